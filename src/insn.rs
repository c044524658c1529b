use bitflags::bitflags;
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::analysis::Worklist;
use crate::space::{AddressSpace, Error};

/// Operand type reported by the processor plugin; stored in the operand
/// property table as a JSON number under [`PROP_TYPE`](crate::annotations::PROP_TYPE)
/// and consulted when rendering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum OpType {
    /// No operand.
    Void = 0,
    /// Immediate value.
    Imm = 1,
    /// Direct memory reference.
    Mem = 2,
    /// Code reference (jump/call target).
    Near = 3,
}

bitflags! {
    /// Per-operand display bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct OpFlags: u8 {
        /// Operand is displayed; hidden operands are skipped when picking
        /// the operand to follow.
        const SHOW = 0x08;
    }
}

/// One decoded operand of the current instruction.
#[derive(Debug, Clone, Default)]
pub struct Operand {
    pub kind: OpType,
    pub value: u64,
    pub addr: u64,
    pub flags: OpFlags,
}

impl Default for OpType {
    fn default() -> Self {
        OpType::Void
    }
}

impl Operand {
    #[must_use]
    pub fn imm(value: u64) -> Self {
        Operand {
            kind: OpType::Imm,
            value,
            addr: value,
            flags: OpFlags::SHOW,
        }
    }

    #[must_use]
    pub fn mem(addr: u64) -> Self {
        Operand {
            kind: OpType::Mem,
            value: addr,
            addr,
            flags: OpFlags::SHOW,
        }
    }

    #[must_use]
    pub fn near(addr: u64) -> Self {
        Operand {
            kind: OpType::Near,
            value: addr,
            addr,
            flags: OpFlags::SHOW,
        }
    }
}

/// The mutable "current instruction" descriptor shared between the core and
/// the processor plugin. The driver owns one and re-initializes it before
/// each `ana()` call; `out()` fills `disasm`.
#[derive(Debug, Clone, Default)]
pub struct Insn {
    pub ea: u64,
    /// Decoded length in bytes; 0 until `ana()` succeeds.
    pub size: usize,
    /// Cached disassembly text, filled by `out()`.
    pub disasm: Option<String>,
    pub operands: Vec<Operand>,
}

impl Insn {
    #[must_use]
    pub fn new(ea: u64) -> Self {
        Insn {
            ea,
            size: 0,
            disasm: None,
            operands: Vec::new(),
        }
    }

    /// Reset the descriptor for decoding at `ea`.
    pub fn init(&mut self, ea: u64) {
        self.ea = ea;
        self.size = 0;
        self.disasm = None;
        self.operands.clear();
    }

    /// The most address-like displayed operand, for the UI's
    /// "follow reference" action: code references win, then memory
    /// references, then immediates.
    #[must_use]
    pub fn get_operand_addr(&self) -> Option<&Operand> {
        pick_addr_operand(&self.operands)
    }
}

/// Pick the operand carrying an address: the first displayed `Near`
/// operand wins, then the first `Mem`, then the first `Imm`.
pub(crate) fn pick_addr_operand(operands: &[Operand]) -> Option<&Operand> {
    let mut mem = None;
    let mut imm = None;
    for op in operands {
        if !op.flags.contains(OpFlags::SHOW) {
            continue;
        }
        match op.kind {
            OpType::Near => return Some(op),
            OpType::Mem => mem = mem.or(Some(op)),
            OpType::Imm => imm = imm.or(Some(op)),
            OpType::Void => {}
        }
    }
    mem.or(imm)
}

/// The pluggable instruction decoder.
///
/// The core drives it through the shared [`Insn`] descriptor: `ana()`
/// decodes one instruction, `emu()` seeds successor addresses and records
/// xrefs/labels, `out()` materializes the disassembly text. The plugin owns
/// no state the core reads except the descriptor.
pub trait Processor {
    /// Decode the instruction at `cmd.ea`, filling `cmd.size` and the
    /// operand array. Returns the decoded length in bytes, 0 if the bytes
    /// are not an instruction. Reading past the end of an area surfaces the
    /// store's `InvalidAddr`, which the analysis driver treats as a benign
    /// path terminator.
    fn ana(&mut self, space: &AddressSpace, cmd: &mut Insn) -> Result<usize, Error>;

    /// Emulate the decoded instruction: push successor addresses onto the
    /// worklist and record xrefs/labels in the annotation tables. Returning
    /// `false` is a fatal processor bug.
    fn emu(&mut self, space: &mut AddressSpace, queue: &mut Worklist, cmd: &mut Insn) -> bool;

    /// Fill `cmd.disasm` with the rendered text of the decoded instruction.
    fn out(&mut self, space: &AddressSpace, cmd: &mut Insn);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operand_addr_priorities() {
        let mut cmd = Insn::new(0x10);
        cmd.operands.push(Operand::imm(0x42));
        cmd.operands.push(Operand::mem(0x2000));
        assert_eq!(cmd.get_operand_addr().unwrap().kind, OpType::Mem);

        cmd.operands.push(Operand::near(0x3000));
        assert_eq!(cmd.get_operand_addr().unwrap().kind, OpType::Near);

        cmd.operands.clear();
        cmd.operands.push(Operand::imm(0x42));
        assert_eq!(cmd.get_operand_addr().unwrap().kind, OpType::Imm);

        // Hidden operands are skipped.
        cmd.operands.clear();
        let mut hidden = Operand::near(0x3000);
        hidden.flags = OpFlags::empty();
        cmd.operands.push(hidden);
        cmd.operands.push(Operand::imm(7));
        assert_eq!(cmd.get_operand_addr().unwrap().kind, OpType::Imm);

        cmd.operands.clear();
        assert!(cmd.get_operand_addr().is_none());
    }

    #[test]
    fn init_resets_descriptor() {
        let mut cmd = Insn::new(0x10);
        cmd.size = 4;
        cmd.disasm = Some("nop".to_string());
        cmd.operands.push(Operand::imm(1));
        cmd.init(0x20);
        assert_eq!(cmd.ea, 0x20);
        assert_eq!(cmd.size, 0);
        assert!(cmd.disasm.is_none());
        assert!(cmd.operands.is_empty());
    }

    #[test]
    fn op_type_round_trips_through_u8() {
        assert_eq!(OpType::try_from(2u8).unwrap(), OpType::Mem);
        assert_eq!(u8::from(OpType::Near), 3);
        assert!(OpType::try_from(9u8).is_err());
    }
}
