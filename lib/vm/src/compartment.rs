//! Compartments: the isolation domains that own all non-function runtime
//! objects.

use crate::context::Context;
use crate::exception::ExceptionType;
use crate::foreign::Foreign;
use crate::global::Global;
use crate::index_space::IndexSpace;
use crate::instance::Instance;
use crate::memory::{Memory, MemoryError};
use crate::mmap::{round_up_to_pages, Mmap};
use crate::objects::{Object, ObjectKind, INVALID_ID};
use crate::table::{Table, TableError};
use memoffset::offset_of;
use std::ptr::NonNull;
use std::sync::{Arc, RwLock};
use std::time::Instant;
use thiserror::Error;

/// The maximum number of tables a compartment can hold.
pub const MAX_TABLES: usize = 256;

/// The maximum number of memories a compartment can hold.
pub const MAX_MEMORIES: usize = 255;

/// The maximum number of mutable globals a compartment can hold.
pub const MAX_MUTABLE_GLOBALS: usize = 4096;

/// The size of the virtual reservation backing a compartment's runtime data.
pub const COMPARTMENT_RESERVED_BYTES: usize = 1 << 32;

/// The alignment of the runtime-data reservation. Generated code finds the
/// compartment runtime data from any interior pointer by masking with this
/// alignment.
pub const COMPARTMENT_RUNTIME_DATA_ALIGNMENT_LOG2: u32 = 32;

/// The per-context slice of the compartment runtime-data region.
#[repr(C)]
pub struct ContextRuntimeData {
    /// The context's copies of the compartment's mutable globals.
    pub mutable_globals: [u128; MAX_MUTABLE_GLOBALS],
}

/// The head of the compartment runtime-data region. Only the head (up to the
/// `contexts` offset) is committed when a compartment is created; context
/// slices are committed as contexts are created.
#[repr(C)]
pub struct CompartmentRuntimeData {
    /// The address of the owning compartment.
    pub compartment: usize,
    /// The base address of each memory, indexed by memory id.
    pub memory_bases: [usize; MAX_MEMORIES],
    /// The base address of each table's element array, indexed by table id.
    pub table_bases: [usize; MAX_TABLES],
    /// Marker for the start of the context slices; the actual array extends
    /// to the end of the reservation.
    pub contexts: [ContextRuntimeData; 0],
}

/// The maximum number of contexts a compartment can hold: as many context
/// slices as fit in the reservation after the head.
pub fn max_contexts() -> usize {
    (COMPARTMENT_RESERVED_BYTES - offset_of!(CompartmentRuntimeData, contexts))
        / std::mem::size_of::<ContextRuntimeData>()
}

/// Errors from compartment operations and object registration.
#[derive(Debug, Error)]
pub enum CompartmentError {
    /// The id space for the given object kind is full.
    #[error("the compartment has no free {0:?} ids")]
    IndexSpaceExhausted(ObjectKind),

    /// A compartment can only be destroyed once its index maps are empty.
    #[error("the compartment still owns objects")]
    NotEmpty,

    /// All mutable-global slots are in use.
    #[error("the compartment has no free mutable-global slots")]
    TooManyMutableGlobals,

    /// The object's compartment was already dropped.
    #[error("the object's compartment no longer exists")]
    CompartmentDropped,

    /// The runtime-data reservation could not be created or committed.
    #[error("virtual memory error: {0}")]
    Region(String),

    /// Cloning a memory failed.
    #[error(transparent)]
    Memory(#[from] MemoryError),

    /// Cloning a table failed.
    #[error(transparent)]
    Table(#[from] TableError),
}

pub(crate) struct CompartmentMaps {
    pub tables: IndexSpace<Arc<Table>>,
    pub memories: IndexSpace<Arc<Memory>>,
    pub globals: IndexSpace<Arc<Global>>,
    pub exception_types: IndexSpace<Arc<ExceptionType>>,
    pub instances: IndexSpace<Arc<Instance>>,
    pub contexts: IndexSpace<Arc<Context>>,
    pub foreigns: IndexSpace<Arc<Foreign>>,

    // One bit per mutable-global slot in use.
    pub global_data_allocation_mask: Box<[u64]>,
    // The value each new context starts its mutable globals from.
    pub initial_context_mutable_globals: Box<[u128]>,
}

impl CompartmentMaps {
    fn new() -> Self {
        Self {
            tables: IndexSpace::new(0, MAX_TABLES - 1),
            memories: IndexSpace::new(0, MAX_MEMORIES - 1),
            globals: IndexSpace::new(0, INVALID_ID - 1),
            exception_types: IndexSpace::new(0, INVALID_ID - 1),
            instances: IndexSpace::new(0, INVALID_ID - 1),
            contexts: IndexSpace::new(0, max_contexts() - 1),
            foreigns: IndexSpace::new(0, INVALID_ID - 1),
            global_data_allocation_mask: vec![0u64; MAX_MUTABLE_GLOBALS / 64].into_boxed_slice(),
            initial_context_mutable_globals: vec![0u128; MAX_MUTABLE_GLOBALS].into_boxed_slice(),
        }
    }

    fn is_empty(&self) -> bool {
        self.tables.is_empty()
            && self.memories.is_empty()
            && self.globals.is_empty()
            && self.exception_types.is_empty()
            && self.instances.is_empty()
            && self.contexts.is_empty()
            && self.foreigns.is_empty()
    }

    /// Allocate the lowest free mutable-global slot.
    pub fn allocate_mutable_global_index(&mut self) -> Option<u32> {
        for (word_index, word) in self.global_data_allocation_mask.iter_mut().enumerate() {
            if *word != u64::MAX {
                let bit = word.trailing_ones();
                *word |= 1u64 << bit;
                return Some((word_index * 64) as u32 + bit);
            }
        }
        None
    }

    /// Mark a specific mutable-global slot in use, for clones.
    pub fn claim_mutable_global_index(&mut self, index: u32) {
        self.global_data_allocation_mask[index as usize / 64] |= 1u64 << (index % 64);
    }

    /// Release a mutable-global slot.
    pub fn free_mutable_global_index(&mut self, index: u32) {
        self.global_data_allocation_mask[index as usize / 64] &= !(1u64 << (index % 64));
    }
}

/// An isolation domain owning runtime objects.
///
/// The per-compartment reader-writer lock covers the index maps: readers
/// for lookups and cloning enumeration, the writer for object
/// creation/destruction and for mutating the global allocation mask.
pub struct Compartment {
    pub(crate) maps: RwLock<CompartmentMaps>,
    runtime_data: Mmap,
}

impl Compartment {
    /// Create an empty compartment.
    ///
    /// This reserves the aligned runtime-data region and commits its head up
    /// to the `contexts` array offset.
    pub fn new() -> Result<Arc<Self>, CompartmentError> {
        let runtime_data = Mmap::aligned_reserved(
            COMPARTMENT_RESERVED_BYTES,
            COMPARTMENT_RUNTIME_DATA_ALIGNMENT_LOG2,
        )
        .map_err(CompartmentError::Region)?;

        let head_size = round_up_to_pages(
            offset_of!(CompartmentRuntimeData, contexts),
            region::page::size(),
        );
        runtime_data
            .make_accessible(0, head_size)
            .map_err(CompartmentError::Region)?;

        let compartment = Arc::new(Self {
            maps: RwLock::new(CompartmentMaps::new()),
            runtime_data,
        });

        // Store the back-pointer generated code uses to find the compartment.
        unsafe {
            (*compartment.runtime_data_ptr().as_ptr()).compartment =
                Arc::as_ptr(&compartment) as usize;
        }

        Ok(compartment)
    }

    /// The compartment's runtime-data region.
    pub fn runtime_data_ptr(&self) -> NonNull<CompartmentRuntimeData> {
        NonNull::new(self.runtime_data.as_mut_ptr() as *mut CompartmentRuntimeData).unwrap()
    }

    pub(crate) fn set_memory_base(&self, id: usize, base: usize) {
        unsafe {
            (*self.runtime_data_ptr().as_ptr()).memory_bases[id] = base;
        }
    }

    pub(crate) fn set_table_base(&self, id: usize, base: usize) {
        unsafe {
            (*self.runtime_data_ptr().as_ptr()).table_bases[id] = base;
        }
    }

    pub(crate) fn commit_context_runtime_data(
        &self,
        id: usize,
    ) -> Result<NonNull<ContextRuntimeData>, CompartmentError> {
        let contexts_offset = offset_of!(CompartmentRuntimeData, contexts);
        let stride = std::mem::size_of::<ContextRuntimeData>();
        let page_size = region::page::size();
        let begin = contexts_offset + id * stride;
        let commit_begin = begin - (begin % page_size);
        let commit_end = round_up_to_pages(begin + stride, page_size);
        self.runtime_data
            .make_accessible(commit_begin, commit_end - commit_begin)
            .map_err(CompartmentError::Region)?;
        Ok(NonNull::new(unsafe { self.runtime_data.as_mut_ptr().add(begin) }
            as *mut ContextRuntimeData)
        .unwrap())
    }

    /// Remove an object from the compartment's index maps, releasing its id.
    ///
    /// The object itself stays alive for as long as references to it exist.
    pub fn remove_object(&self, object: &Object) {
        // Declared before the lock guard so that the removed reference is
        // dropped after the lock is released: object finalizers may take the
        // compartment lock themselves.
        let mut removed: Option<Object> = None;
        let mut maps = self.maps.write().unwrap();
        match object {
            Object::Table(o) => {
                removed = maps.tables.remove(o.id()).map(Object::Table);
            }
            Object::Memory(o) => {
                removed = maps.memories.remove(o.id()).map(Object::Memory);
            }
            Object::Global(o) => {
                removed = maps.globals.remove(o.id()).map(Object::Global);
            }
            Object::ExceptionType(o) => {
                removed = maps.exception_types.remove(o.id()).map(Object::ExceptionType);
            }
            Object::Instance(o) => {
                removed = maps.instances.remove(o.id()).map(Object::Instance);
            }
            Object::Context(o) => {
                removed = maps.contexts.remove(o.id()).map(Object::Context);
            }
            Object::Foreign(o) => {
                removed = maps.foreigns.remove(o.id()).map(Object::Foreign);
            }
            Object::Function(_) => {}
        }
        drop(maps);
        drop(removed);
    }

    /// Look up an object by kind and id.
    pub fn lookup(&self, kind: ObjectKind, id: usize) -> Option<Object> {
        let maps = self.maps.read().unwrap();
        match kind {
            ObjectKind::Table => maps.tables.get(id).cloned().map(Object::Table),
            ObjectKind::Memory => maps.memories.get(id).cloned().map(Object::Memory),
            ObjectKind::Global => maps.globals.get(id).cloned().map(Object::Global),
            ObjectKind::ExceptionType => maps
                .exception_types
                .get(id)
                .cloned()
                .map(Object::ExceptionType),
            ObjectKind::Instance => maps.instances.get(id).cloned().map(Object::Instance),
            ObjectKind::Context => maps.contexts.get(id).cloned().map(Object::Context),
            ObjectKind::Foreign => maps.foreigns.get(id).cloned().map(Object::Foreign),
            ObjectKind::Function => None,
        }
    }

    /// Check that the compartment may be destroyed: all of its index maps
    /// must be empty.
    pub fn assert_destroyable(&self) -> Result<(), CompartmentError> {
        if self.maps.read().unwrap().is_empty() {
            Ok(())
        } else {
            Err(CompartmentError::NotEmpty)
        }
    }
}

impl std::fmt::Debug for Compartment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let maps = self.maps.read().unwrap();
        f.debug_struct("Compartment")
            .field("tables", &maps.tables.len())
            .field("memories", &maps.memories.len())
            .field("globals", &maps.globals.len())
            .field("instances", &maps.instances.len())
            .finish_non_exhaustive()
    }
}

/// Clone a compartment: produce a new compartment holding isomorphic copies
/// of every table, memory, global, exception type and instance, each with
/// the id it had in the source.
///
/// The source's lock is held (shared) for the whole clone, so the result is
/// a point-in-time snapshot. Contexts and foreigns are not cloned.
pub fn clone_compartment(
    compartment: &Arc<Compartment>,
) -> Result<Arc<Compartment>, CompartmentError> {
    let started_at = Instant::now();

    let new_compartment = Compartment::new()?;
    let maps = compartment.maps.read().unwrap();

    // Clone tables.
    for (id, table) in maps.tables.iter() {
        let new_table = Table::clone_into(table, &new_compartment)?;
        debug_assert_eq!(new_table.id(), id);
    }

    // Clone memories.
    for (id, memory) in maps.memories.iter() {
        let new_memory = Memory::clone_into(memory, &new_compartment)?;
        debug_assert_eq!(new_memory.id(), id);
    }

    // Clone globals: first the allocation mask and initial values as a
    // bitwise image, then the objects (which claim their existing slots).
    {
        let mut new_maps = new_compartment.maps.write().unwrap();
        new_maps
            .global_data_allocation_mask
            .copy_from_slice(&maps.global_data_allocation_mask);
        new_maps
            .initial_context_mutable_globals
            .copy_from_slice(&maps.initial_context_mutable_globals);
    }
    for (id, global) in maps.globals.iter() {
        let new_global = Global::clone_into(global, &new_compartment)?;
        debug_assert_eq!(new_global.id(), id);
        debug_assert_eq!(
            new_global.mutable_global_index(),
            global.mutable_global_index()
        );
    }

    // Clone exception types.
    for (id, exception_type) in maps.exception_types.iter() {
        let new_exception_type = ExceptionType::clone_into(exception_type, &new_compartment)?;
        debug_assert_eq!(new_exception_type.id(), id);
    }

    // Clone instances.
    for (id, instance) in maps.instances.iter() {
        let new_instance = Instance::clone_into(instance, &new_compartment)?;
        debug_assert_eq!(new_instance.id(), id);
    }

    tracing::debug!(elapsed = ?started_at.elapsed(), "cloned compartment");
    Ok(new_compartment)
}

/// Find the counterpart of `object` in a compartment cloned from the one the
/// object belongs to.
///
/// Functions pass through unchanged: they are not compartment-owned.
///
/// # Panics
///
/// Panics for contexts and foreigns (they are not cloned, so they have no
/// counterpart), and if the object was never cloned into `new_compartment`.
pub fn remap_to_cloned_compartment(object: &Object, new_compartment: &Arc<Compartment>) -> Object {
    if let Object::Function(function) = object {
        return Object::Function(function.clone());
    }

    let maps = new_compartment.maps.read().unwrap();
    match object {
        Object::Table(table) => Object::Table(
            maps.tables
                .get(table.id())
                .expect("table was not cloned into the compartment")
                .clone(),
        ),
        Object::Memory(memory) => Object::Memory(
            maps.memories
                .get(memory.id())
                .expect("memory was not cloned into the compartment")
                .clone(),
        ),
        Object::Global(global) => Object::Global(
            maps.globals
                .get(global.id())
                .expect("global was not cloned into the compartment")
                .clone(),
        ),
        Object::ExceptionType(exception_type) => Object::ExceptionType(
            maps.exception_types
                .get(exception_type.id())
                .expect("exception type was not cloned into the compartment")
                .clone(),
        ),
        Object::Instance(instance) => Object::Instance(
            maps.instances
                .get(instance.id())
                .expect("instance was not cloned into the compartment")
                .clone(),
        ),
        Object::Context(_) | Object::Foreign(_) | Object::Function(_) => {
            unreachable!("objects of this kind cannot be remapped to a cloned compartment")
        }
    }
}

/// Whether `object` is in `compartment`.
///
/// Non-function objects are in exactly the compartment that created them. A
/// function is in every compartment whose instance map binds the function's
/// instance id to an instance sharing the function's JIT module; functions
/// without an instance id are in all compartments.
pub fn is_in_compartment(object: &Object, compartment: &Arc<Compartment>) -> bool {
    if let Object::Function(function) = object {
        if function.instance_id() == INVALID_ID {
            return true;
        }

        let maps = compartment.maps.read().unwrap();
        let Some(instance) = maps.instances.get(function.instance_id()) else {
            return false;
        };
        match function.mutable_data().jit_module() {
            Some(jit_module) => Arc::ptr_eq(instance.jit_module(), &jit_module),
            None => false,
        }
    } else {
        let header = object.header().expect("non-function objects have headers");
        header
            .compartment_weak()
            .upgrade()
            .is_some_and(|owner| Arc::ptr_eq(&owner, compartment))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runtime_data_is_aligned_and_committed() {
        let compartment = Compartment::new().unwrap();
        let ptr = compartment.runtime_data_ptr().as_ptr() as usize;
        assert_eq!(ptr & ((1 << COMPARTMENT_RUNTIME_DATA_ALIGNMENT_LOG2) - 1), 0);

        // The head must be readable, and hold the back-pointer.
        let back = unsafe { (*compartment.runtime_data_ptr().as_ptr()).compartment };
        assert_eq!(back, Arc::as_ptr(&compartment) as usize);
    }

    #[test]
    fn destroyable_only_when_empty() {
        let compartment = Compartment::new().unwrap();
        assert!(compartment.assert_destroyable().is_ok());
    }

    #[test]
    fn mutable_global_index_allocation() {
        let compartment = Compartment::new().unwrap();
        let mut maps = compartment.maps.write().unwrap();
        assert_eq!(maps.allocate_mutable_global_index(), Some(0));
        assert_eq!(maps.allocate_mutable_global_index(), Some(1));
        maps.free_mutable_global_index(0);
        assert_eq!(maps.allocate_mutable_global_index(), Some(0));
        maps.claim_mutable_global_index(2);
        assert_eq!(maps.allocate_mutable_global_index(), Some(3));
    }

    #[test]
    fn max_contexts_fits_reservation() {
        let contexts_offset = offset_of!(CompartmentRuntimeData, contexts);
        let max = max_contexts();
        assert!(max > 0);
        assert!(
            contexts_offset + max * std::mem::size_of::<ContextRuntimeData>()
                <= COMPARTMENT_RESERVED_BYTES
        );
    }
}
