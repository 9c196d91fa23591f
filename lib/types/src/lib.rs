//! This crate holds the common types shared by the Breakwater runtime
//! crates: value and reference types, memory/table/global descriptions,
//! page-granular units, the module IR summary produced by the loaders, and
//! the closed trap taxonomy raised by compiled code.

#![warn(missing_docs, unused_import_braces)]
#![deny(unused_extern_crates)]
#![cfg_attr(
    feature = "cargo-clippy",
    warn(
        clippy::float_arithmetic,
        clippy::mut_mut,
        clippy::nonminimal_bool,
        clippy::print_stdout,
        clippy::unicode_not_nfc,
        clippy::use_self
    )
)]

mod features;
mod module;
mod trap;
mod types;
mod units;
mod values;

pub use crate::features::Features;
pub use crate::module::{
    DataSegmentIr, ElemSegmentIr, Export, ExternKind, FunctionDef, GlobalDef, Import, ImportDesc,
    InitExpr, ModuleIr, SourceRange,
};
pub use crate::trap::{ParseTrapCodeError, TrapCode};
pub use crate::types::{
    ExceptionTypeSig, FunctionType, GlobalType, MemoryType, Mutability, TableType, Type,
    TypeEncoding,
};
pub use crate::units::{Bytes, PageCountOutOfRange, Pages, WASM_MAX_PAGES, WASM_PAGE_SIZE};
pub use crate::values::Value;

/// Version number of this crate.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
