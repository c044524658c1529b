//! Analysis and rendering core of an interactive disassembler
//!
//! Given loaded memory areas of raw bytes and a pluggable processor module
//! that decodes one machine instruction at a time, the core discovers code
//! by recursive descent, stores user annotations, and materializes any
//! window of the address space as a line-oriented textual model.

/// Worklist-based recursive code discovery
pub mod analysis;
/// Annotation tables: labels, comments, xrefs, operand properties
pub mod annotations;
/// Processor plugin contract
pub mod insn;
/// Text persistence of annotations and flags
pub mod persist;
/// Display objects and the line model
pub mod render;
/// Address space byte/flag store
pub mod space;

pub use self::analysis::{Analysis, Worklist};
pub use self::annotations::{Label, PROP_TYPE};
pub use self::insn::{Insn, OpFlags, OpType, Operand, Processor};
pub use self::render::{Line, LineKind, Model, render, render_partial, render_partial_around};
pub use self::space::{AddressSpace, Area, AreaProps, Error, Flags};
