//! Runtime object graph and compartment system for Breakwater.
//!
//! Every mutable runtime entity (memories, tables, globals, exception
//! types, instances, contexts, foreigns) lives in exactly one
//! [`Compartment`], which owns the authoritative `id -> entity` mapping per
//! object kind. Compartments can be cloned into isomorphic copies that
//! preserve those ids. Functions are the exception: they are not
//! compartment-owned, and their compartment membership is computed from the
//! instance id and JIT module they reference.

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

mod compartment;
mod context;
mod exception;
mod foreign;
mod function;
mod global;
mod index_space;
mod instance;
mod memory;
mod mmap;
mod objects;
mod quota;
mod table;
mod trap;
mod values;

pub use crate::compartment::{
    clone_compartment, is_in_compartment, max_contexts, remap_to_cloned_compartment, Compartment,
    CompartmentError, CompartmentRuntimeData, ContextRuntimeData, COMPARTMENT_RESERVED_BYTES,
    COMPARTMENT_RUNTIME_DATA_ALIGNMENT_LOG2, MAX_MEMORIES, MAX_MUTABLE_GLOBALS, MAX_TABLES,
};
pub use crate::context::Context;
pub use crate::exception::ExceptionType;
pub use crate::foreign::Foreign;
pub use crate::function::{Function, FunctionMutableData, FunctionRef};
pub use crate::global::Global;
pub use crate::index_space::IndexSpace;
pub use crate::instance::{InstanceInit, Instance, JitModule};
pub use crate::memory::{Memory, MemoryError, MEMORY_NUM_RESERVED_BYTES};
pub use crate::mmap::Mmap;
pub use crate::objects::{GcHeader, Object, ObjectKind, UserData, INVALID_ID};
pub use crate::quota::{CurrentAndMax, ResourceQuota, ResourceQuotaRef};
pub use crate::table::{out_of_bounds_element, Table, TableError};
pub use crate::trap::Trap;
pub use crate::values::{NaNCheck, Value};

/// Version number of this crate.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
