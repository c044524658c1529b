use std::collections::HashSet;

use log::debug;

use crate::insn::{Insn, Processor};
use crate::space::{AddressSpace, Error};

/// Addresses scheduled for code decoding. LIFO; duplicates are permitted
/// (re-decoding an already-`CODE` byte is a no-op when the flags already
/// match).
#[derive(Debug, Default)]
pub struct Worklist {
    stack: Vec<u64>,
}

impl Worklist {
    #[must_use]
    pub fn new() -> Self {
        Self { stack: Vec::new() }
    }

    /// Schedule `ea` for decoding.
    pub fn push(&mut self, ea: u64) {
        self.stack.push(ea);
    }

    pub fn pop(&mut self) -> Option<u64> {
        self.stack.pop()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.stack.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.stack.is_empty()
    }
}

/// Worklist-based recursive code discovery.
///
/// Decoding is delegated to the [`Processor`] plugin; the driver marks
/// decoded ranges as code and lets the plugin's `emu()` push successor
/// addresses back onto the worklist. The driver is idempotent and
/// restartable: re-invoking `analyze` continues where the budget cut off.
#[derive(Debug, Default)]
pub struct Analysis {
    pub worklist: Worklist,
}

impl Analysis {
    /// Instructions decoded per `analyze` invocation before yielding back
    /// to the caller.
    pub const INSN_BUDGET: usize = 40_000;

    /// Progress callback interval, in decoded instructions.
    const PROGRESS_INTERVAL: usize = 1000;

    #[must_use]
    pub fn new() -> Self {
        Self {
            worklist: Worklist::new(),
        }
    }

    pub fn add_entrypoint(&mut self, ea: u64) {
        self.worklist.push(ea);
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.worklist.is_empty()
    }

    /// Run discovery until the worklist drains or the instruction budget is
    /// exhausted. `progress` is invoked every 1000 decoded instructions
    /// with the running count; returns the number of instructions decoded
    /// by this invocation.
    pub fn analyze<P: Processor + ?Sized>(
        &mut self,
        space: &mut AddressSpace,
        processor: &mut P,
        mut progress: impl FnMut(usize),
    ) -> usize {
        let mut cmd = Insn::default();
        // Scoped to this invocation: duplicate pops are idempotent anyway,
        // just wasteful on highly cyclic code.
        let mut visited = HashSet::new();
        let mut budget = Self::INSN_BUDGET;
        let mut cnt = 0;
        while budget > 0 {
            let Some(ea) = self.worklist.pop() else {
                break;
            };
            if !visited.insert(ea) {
                continue;
            }
            cmd.init(ea);
            let insn_sz = match processor.ana(space, &mut cmd) {
                Ok(sz) => sz,
                Err(Error::InvalidAddr(_)) => {
                    // Ran out of memory area; continue with the rest of the
                    // paths.
                    continue;
                }
                Err(err) => panic!("processor ana() failed at 0x{ea:08x}: {err}"),
            };
            if insn_sz == 0 {
                continue;
            }
            assert!(
                processor.emu(space, &mut self.worklist, &mut cmd),
                "processor emu() failed at 0x{ea:08x}"
            );
            space
                .make_code(ea, insn_sz)
                .expect("decoded instruction must lie inside its area");
            processor.out(space, &mut cmd);
            budget -= 1;
            cnt += 1;
            if cnt % Self::PROGRESS_INTERVAL == 0 {
                progress(cnt);
            }
        }
        if self.worklist.is_empty() {
            debug!("analysis finished, {cnt} instructions this pass");
        }
        cnt
    }
}
