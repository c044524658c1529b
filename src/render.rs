use std::collections::HashMap;
use std::fmt::Write as _;

use log::debug;
use serde_json::Value;

use crate::annotations::PROP_TYPE;
use crate::insn::{Insn, OpFlags, OpType, Operand, Processor, pick_addr_operand};
use crate::space::{AddressSpace, Error, Flags};

/// Width of the leader fields (address, raw bytes) the UI prepends to each
/// line; part of the display length so cursor math stays cheap.
pub const LEADER_SIZE: usize = 9;

/// Indent of body lines; labels and xrefs are flush left.
pub const INDENT: &str = "  ";

/// Mnemonic column width.
const MNEM_WIDTH: usize = 8;

/// How many bytes a single display object may occupy; used to size the
/// back-off when rendering around a target address.
pub const MAX_UNIT_SIZE: usize = 4;

/// One display object: a line of the textual model, keyed by
/// `(address, subno)`.
#[derive(Debug, Clone)]
pub struct Line {
    pub ea: u64,
    /// Byte size of the underlying unit; 1 for virtual lines.
    pub size: usize,
    /// Relative number among the lines sharing this address; assigned by
    /// [`Model::add_line`].
    pub subno: i32,
    pub kind: LineKind,
    cache: Option<String>,
}

/// The variant set of display objects.
#[derive(Debug, Clone)]
pub enum LineKind {
    /// A decoded instruction with its materialized disassembly text.
    Insn {
        disasm: String,
        operands: Vec<Operand>,
    },
    /// A data unit with its little-endian value.
    Data { value: u64 },
    /// A string unit; NUL bytes render as `\0`.
    Str { bytes: Vec<u8> },
    /// An unclassified byte.
    Unknown { byte: u8 },
    /// `<label>:` (virtual).
    Label,
    /// `; xref: 0x<from> <tag>` (virtual).
    Xref { from: u64, tag: String },
    /// Opaque pre-formatted text for area delimiters (virtual).
    Literal,
}

impl Line {
    #[must_use]
    pub fn insn(ea: u64, size: usize, disasm: String, operands: Vec<Operand>) -> Self {
        Line {
            ea,
            size,
            subno: 0,
            kind: LineKind::Insn { disasm, operands },
            cache: None,
        }
    }

    #[must_use]
    pub fn data(ea: u64, size: usize, value: u64) -> Self {
        Line {
            ea,
            size,
            subno: 0,
            kind: LineKind::Data { value },
            cache: None,
        }
    }

    #[must_use]
    pub fn str(ea: u64, size: usize, bytes: Vec<u8>) -> Self {
        Line {
            ea,
            size,
            subno: 0,
            kind: LineKind::Str { bytes },
            cache: None,
        }
    }

    #[must_use]
    pub fn unknown(ea: u64, byte: u8) -> Self {
        Line {
            ea,
            size: 1,
            subno: 0,
            kind: LineKind::Unknown { byte },
            cache: None,
        }
    }

    #[must_use]
    pub fn label(ea: u64) -> Self {
        Line {
            ea,
            size: 1,
            subno: 0,
            kind: LineKind::Label,
            cache: None,
        }
    }

    #[must_use]
    pub fn xref(ea: u64, from: u64, tag: String) -> Self {
        Line {
            ea,
            size: 1,
            subno: 0,
            kind: LineKind::Xref { from, tag },
            cache: None,
        }
    }

    #[must_use]
    pub fn literal(ea: u64, text: String) -> Self {
        Line {
            ea,
            size: 1,
            subno: 0,
            kind: LineKind::Literal,
            cache: Some(text),
        }
    }

    /// Whether this line corresponds to real bytes of the input (false) or
    /// is synthesized around them (true).
    #[must_use]
    pub fn is_virtual(&self) -> bool {
        matches!(
            self.kind,
            LineKind::Label | LineKind::Xref { .. } | LineKind::Literal
        )
    }

    #[must_use]
    pub fn indent(&self) -> &'static str {
        match self.kind {
            LineKind::Label | LineKind::Xref { .. } => "",
            _ => INDENT,
        }
    }

    /// Render this line as a string, caching the result.
    pub fn render(&mut self, space: &AddressSpace) -> &str {
        if self.cache.is_none() {
            self.cache = Some(self.format(space));
        }
        self.cache.as_deref().unwrap_or_default()
    }

    /// Display length: leader + indent + rendered text. Called on every
    /// cursor movement, hence the cache.
    pub fn display_len(&mut self, space: &AddressSpace) -> usize {
        let indent = self.indent().len();
        LEADER_SIZE + indent + self.render(space).len()
    }

    /// The most address-like operand for the UI's "follow reference"
    /// action.
    #[must_use]
    pub fn get_operand_addr(&self) -> Option<Operand> {
        match &self.kind {
            LineKind::Insn { operands, .. } => pick_addr_operand(operands).cloned(),
            LineKind::Data { value } => Some(Operand {
                kind: OpType::Imm,
                value: *value,
                addr: *value,
                flags: OpFlags::default(),
            }),
            LineKind::Xref { from, .. } => Some(Operand {
                kind: OpType::Void,
                value: 0,
                addr: *from,
                flags: OpFlags::default(),
            }),
            _ => None,
        }
    }

    fn format(&self, space: &AddressSpace) -> String {
        match &self.kind {
            LineKind::Insn { disasm, .. } => {
                format!("{disasm}{}", comment_suffix(space, self.ea))
            }
            LineKind::Data { value } => {
                let mut s = if is_mem_typed(space, self.ea) {
                    match space.get_label(*value) {
                        Some(label) => format!("{}{label}", mnem(data_sz2mnem(self.size))),
                        None => format!("{}0x{value:x}", mnem(data_sz2mnem(self.size))),
                    }
                } else {
                    format!("{}0x{value:x}", mnem(data_sz2mnem(self.size)))
                };
                s.push_str(&comment_suffix(space, self.ea));
                s
            }
            LineKind::Str { bytes } => {
                format!(
                    "{}{}{}",
                    mnem("db"),
                    quote_str(bytes),
                    comment_suffix(space, self.ea)
                )
            }
            LineKind::Unknown { byte } => {
                let mut s = format!("{}0x{byte:02x}", mnem("unk"));
                if (0x20..=0x7e).contains(byte) {
                    let _ = write!(s, " ; '{}'", *byte as char);
                }
                s.push_str(&comment_suffix(space, self.ea));
                s
            }
            LineKind::Label => {
                format!("{}:", space.get_label(self.ea).unwrap_or_default())
            }
            LineKind::Xref { from, tag } => {
                format!("; xref: 0x{from:x} {tag}")
            }
            // Literal text is set at construction time.
            LineKind::Literal => String::new(),
        }
    }
}

fn mnem(s: &str) -> String {
    format!("{s:<width$}", width = MNEM_WIDTH)
}

fn data_sz2mnem(sz: usize) -> &'static str {
    match sz {
        2 => "dw",
        4 => "dd",
        _ => "db",
    }
}

fn comment_suffix(space: &AddressSpace, ea: u64) -> String {
    match space.get_comment(ea) {
        Some(c) => format!("  ; {c}"),
        None => String::new(),
    }
}

fn is_mem_typed(space: &AddressSpace, ea: u64) -> bool {
    space.get_arg_prop(ea, 0, PROP_TYPE).and_then(Value::as_u64)
        == Some(u64::from(u8::from(OpType::Mem)))
}

fn quote_str(bytes: &[u8]) -> String {
    let mut s = String::with_capacity(bytes.len() + 2);
    s.push('"');
    for &b in bytes {
        match b {
            0 => s.push_str("\\0"),
            b'"' => s.push_str("\\\""),
            b'\\' => s.push_str("\\\\"),
            0x20..=0x7e => s.push(b as char),
            _ => {
                let _ = write!(s, "\\x{b:02x}");
            }
        }
    }
    s.push('"');
    s
}

/// An indexable window of the address space: an ordered line sequence plus
/// the `(addr, subno) → line number` mapping. `(addr, -1)` keys the "real"
/// (non-virtual) line at an address.
///
/// When constructed with a target, [`add_line`](Self::add_line) latches
/// three line numbers for the UI cursor: the first line at the target
/// address, the line whose subno matches the requested one, and the first
/// non-virtual line at the target address.
#[derive(Debug, Default)]
pub struct Model {
    lines: Vec<Line>,
    addr2line: HashMap<(u64, i32), usize>,
    last_addr: Option<u64>,
    subcnt: i32,
    target_addr: Option<u64>,
    target_subno: i32,
    pub target_addr_lineno_0: Option<usize>,
    pub target_addr_lineno: Option<usize>,
    pub target_addr_lineno_real: Option<usize>,
}

impl Model {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_target(target_addr: u64, target_subno: i32) -> Self {
        Model {
            target_addr: Some(target_addr),
            target_subno,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn lines(&self) -> &[Line] {
        &self.lines
    }

    pub fn lines_mut(&mut self) -> &mut [Line] {
        &mut self.lines
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lines.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Append a line at `addr`, assigning its subno. The sub-counter resets
    /// whenever the address changes from the previous call.
    pub fn add_line(&mut self, addr: u64, mut line: Line) {
        if self.last_addr != Some(addr) {
            self.last_addr = Some(addr);
            self.subcnt = 0;
        }
        let lineno = self.lines.len();
        if self.target_addr == Some(addr) {
            if self.subcnt == 0 {
                // First line related to the target address.
                self.target_addr_lineno_0 = Some(lineno);
            }
            if self.subcnt == self.target_subno {
                self.target_addr_lineno = Some(lineno);
            }
            if !line.is_virtual() && self.target_addr_lineno_real.is_none() {
                // Line where the actual instr/data/unknown bytes are
                // rendered, vs labels/xrefs.
                self.target_addr_lineno_real = Some(lineno);
            }
        }
        line.subno = self.subcnt;
        self.addr2line.insert((addr, self.subcnt), lineno);
        if !line.is_virtual() {
            self.addr2line.entry((addr, -1)).or_insert(lineno);
        }
        self.lines.push(line);
        self.subcnt += 1;
    }

    /// Line number of the real (non-virtual) line at `addr`.
    #[must_use]
    pub fn addr2line_no(&self, addr: u64) -> Option<usize> {
        self.addr2line.get(&(addr, -1)).copied()
    }

    /// Line number of the line `(addr, subno)`.
    #[must_use]
    pub fn line_no(&self, addr: u64, subno: i32) -> Option<usize> {
        self.addr2line.get(&(addr, subno)).copied()
    }
}

/// Materialize the whole address space as a line sequence.
pub fn render<P: Processor + ?Sized>(
    space: &AddressSpace,
    processor: &mut P,
) -> Result<Model, Error> {
    let mut model = Model::new();
    render_partial(space, processor, &mut model, 0, 0, 1_000_000, None)?;
    Ok(model)
}

/// Walk areas in order starting at `(area_no, offset)`, appending up to
/// `num_lines` body lines to `model`.
///
/// Per byte: one xref line per recorded source (ascending), a label line if
/// one exists, then the unit's real object determined by the head flag,
/// advancing by the unit size. Area delimiters are emitted whenever an area
/// is entered at offset 0 and when an area is exhausted; only body lines
/// consume the budget. With `target_addr` set, the budget is compensated
/// for every unit before the target, so it counts lines at and after the
/// target only.
pub fn render_partial<P: Processor + ?Sized>(
    space: &AddressSpace,
    processor: &mut P,
    model: &mut Model,
    mut area_no: usize,
    offset: usize,
    mut num_lines: usize,
    target_addr: Option<u64>,
) -> Result<(), Error> {
    if num_lines == 0 {
        return Ok(());
    }
    let mut start = true;
    while area_no < space.area_count() {
        let area = space.area(area_no);
        area_no += 1;
        let mut i = 0;
        if start {
            i = offset;
            start = false;
        }
        if i == 0 {
            model.add_line(
                area.start,
                Line::literal(area.start, format!("; Start of 0x{:x} area", area.start)),
            );
        }
        let bytes = area.bytes();
        let flags = area.flags();
        while i < flags.len() {
            let addr = area.start + i as u64;
            // Render all lines up to the target address, and then
            // `num_lines` past it.
            if let Some(target) = target_addr {
                if addr < target {
                    num_lines += 1;
                }
            }

            if let Some(xrefs) = space.get_xrefs(addr) {
                for (from, tag) in xrefs {
                    model.add_line(addr, Line::xref(addr, *from, tag.clone()));
                }
            }
            if space.has_label(addr) {
                model.add_line(addr, Line::label(addr));
            }

            let f = flags[i];
            let out = if f == Flags::UNK {
                let out = Line::unknown(addr, bytes[i]);
                i += 1;
                out
            } else if f == Flags::DATA {
                let mut sz = 1;
                while i + sz < flags.len() && flags[i + sz] == Flags::DATA_CONT {
                    sz += 1;
                }
                let out = Line::data(addr, sz, space.get_data(addr, sz)?);
                i += sz;
                out
            } else if f == Flags::STR {
                let mut sz = 1;
                while i + sz < flags.len() && flags[i + sz] == Flags::DATA_CONT {
                    sz += 1;
                }
                let out = Line::str(addr, sz, bytes[i..i + sz].to_vec());
                i += sz;
                out
            } else if f == Flags::CODE {
                let mut cmd = Insn::new(addr);
                let insn_sz = processor.ana(space, &mut cmd)?;
                assert!(
                    insn_sz > 0,
                    "ana() refused bytes marked as code at 0x{addr:08x}"
                );
                processor.out(space, &mut cmd);
                let disasm = cmd.disasm.take().unwrap_or_default();
                let out = Line::insn(addr, insn_sz, disasm, std::mem::take(&mut cmd.operands));
                i += insn_sz;
                out
            } else {
                // A continuation without its head: flag corruption.
                // Truncate the walk to a single raw byte.
                debug_assert!(false, "corrupt flags {f:?} at 0x{addr:08x}");
                let out = Line::unknown(addr, bytes[i]);
                i += 1;
                out
            };

            model.add_line(addr, out);
            num_lines -= 1;
            if num_lines == 0 {
                return Ok(());
            }
        }
        model.add_line(
            area.end,
            Line::literal(area.end, format!("; End of 0x{:x} area", area.start)),
        );
    }
    Ok(())
}

/// Render a window of `context_lines` body lines around `(addr, subno)`.
///
/// Backs off `context_lines × MAX_UNIT_SIZE` bytes, walking backwards
/// across area boundaries and clamping at the first area's start, snaps the
/// starting offset to a unit head, then renders with `addr` as the target.
/// The returned model always has `target_addr_lineno_0` set; when the exact
/// subno no longer exists, `target_addr_lineno` falls back to it.
pub fn render_partial_around<P: Processor + ?Sized>(
    space: &AddressSpace,
    processor: &mut P,
    addr: u64,
    subno: i32,
    context_lines: usize,
) -> Result<Model, Error> {
    debug!("render_partial_around(0x{addr:x}, {subno})");
    let (off, area) = space.addr2area(addr).ok_or(Error::InvalidAddr(addr))?;
    let mut area_no = space.area_no(area) as isize;
    let mut off = off as i64 - (context_lines * MAX_UNIT_SIZE) as i64;
    if off < 0 {
        area_no -= 1;
        while area_no >= 0 {
            off += space.area(area_no as usize).len() as i64;
            if off >= 0 {
                break;
            }
            area_no -= 1;
        }
        if area_no < 0 {
            // Reached the beginning of the address space.
            area_no = 0;
        }
        if off < 0 {
            off = 0;
        }
    }
    let area_no = area_no as usize;
    let area = space.area(area_no);
    debug!("render_partial_around: 0x{off:x}, {area}");
    let off = area.adjust_offset_reverse(off as usize);
    debug!("render_partial_around adjusted: 0x{off:x}, {area}");

    let mut model = Model::with_target(addr, subno);
    render_partial(
        space,
        processor,
        &mut model,
        area_no,
        off,
        context_lines,
        Some(addr),
    )?;
    debug!("render_partial_around model done, lines: {}", model.len());
    assert!(
        model.target_addr_lineno_0.is_some(),
        "target 0x{addr:08x} did not render"
    );
    if model.target_addr_lineno.is_none() {
        // The exact subno no longer exists, use the first line of the
        // target address.
        model.target_addr_lineno = model.target_addr_lineno_0;
    }
    Ok(model)
}
