//! Lowering of WebAssembly memory operators to backend IR.
//!
//! The lowerer runs inside the JIT's function translator: the translator
//! keeps the operand stack and per-memory base-pointer variables, and hands
//! every memory, atomic and SIMD memory operator to [`FunctionEmitter`],
//! which emits IR that forms a bounded 64-bit effective address, performs
//! the access through the compartment-local base pointer, and carries the
//! right atomic and alignment semantics.

#![warn(missing_docs, unused_import_braces)]
#![deny(unused_extern_crates)]
#![cfg_attr(
    feature = "cargo-clippy",
    warn(
        clippy::mut_mut,
        clippy::nonminimal_bool,
        clippy::print_stdout,
        clippy::unicode_not_nfc,
        clippy::use_self
    )
)]

mod emitter;
mod ir;
mod memory_ops;

pub use crate::emitter::{CompileError, FunctionEmitter};
pub use crate::ir::{
    AtomicOrdering, BasicBlockRef, FunctionBuilder, Instruction, IntPredicate, IrType, RmwOp,
    ScalarType, ValueRef,
};
pub use crate::memory_ops::{
    AtomicAccessType, LoadConversion, LoadKind, MemArg, MemoryOperator, StoreConversion,
    StoreKind, VectorShape,
};

/// Version number of this crate.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
