//! Mid-level intermediate representation for hlx
//!
//! The MIR is a small LLVM-like module:
//! - Functions made of basic blocks, each ending in exactly one terminator
//! - Every local lives in a stack slot allocated at the head of the entry block
//! - SSA values for temporaries, with phi nodes where `&&`/`||` join
//! - A textual printer used by `-llvm-dump`

mod mir;
mod lower;
#[cfg(test)]
mod interp;

pub use mir::*;
pub use lower::lower_program;
