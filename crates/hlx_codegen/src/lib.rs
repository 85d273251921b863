//! Code generation for hlx using Cranelift
//!
//! This crate compiles a MIR module to a native relocatable object.

mod codegen;

pub use codegen::{Codegen, CodegenError, RUNTIME_PREFIX};
