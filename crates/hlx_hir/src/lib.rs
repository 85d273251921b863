//! Resolved tree and semantic analysis
//!
//! This crate turns the parsed tree into a resolved tree by:
//! 1. Binding every identifier to a declaration in the arena (`DeclId`, `FnId`)
//! 2. Checking types, arity, mutability and the `main` signature
//! 3. Reporting unreachable statements as warnings

mod hir;
mod resolve;

pub use hir::*;
pub use resolve::{Diagnostic, Resolution, Resolver, Severity};
