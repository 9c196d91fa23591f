//! Linear memory instances.
//!
//! Every memory owns a large virtual reservation with unmapped guard pages
//! beyond the committed size, so that compiled code can access any 32-bit
//! address plus 32-bit offset without an explicit bounds check.

use crate::compartment::{Compartment, CompartmentError};
use crate::mmap::{round_up_to_pages, Mmap};
use crate::objects::{GcHeader, ObjectKind};
use crate::quota::ResourceQuotaRef;
use breakwater_types::{Bytes, MemoryType, Pages, WASM_PAGE_SIZE};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use thiserror::Error;

/// The size of the virtual reservation backing each memory.
///
/// The sandbox invariant requires at least `2^32 + 2^32` bytes (a 32-bit
/// address plus a 32-bit static offset), so the guard region past the
/// committed pages absorbs every possible effective address.
pub const MEMORY_NUM_RESERVED_BYTES: usize = 0x2_0000_0000;

const _: () = assert!(
    MEMORY_NUM_RESERVED_BYTES as u128 >= (1u128 << 32) + (u32::MAX as u128),
    "the memory reservation must cover any 32-bit address plus offset"
);

const _: () = assert!(
    std::mem::size_of::<usize>() == 8,
    "the guard-region sandbox requires a 64-bit virtual address space"
);

/// Error type describing things that can go wrong when operating on linear
/// memories.
#[derive(Debug, Error)]
pub enum MemoryError {
    /// The operation would cause the size of the memory to exceed its
    /// maximum or the addressable range.
    #[error("memory of {} pages could not grow by {} pages", current.0, attempted_delta.0)]
    CouldNotGrow {
        /// The current size in pages.
        current: Pages,
        /// The attempted amount to grow by in pages.
        attempted_delta: Pages,
    },

    /// The memory's resource quota denied the allocation.
    #[error("the resource quota denied an allocation of {} pages", pages.0)]
    QuotaExceeded {
        /// The number of pages that were requested.
        pages: Pages,
    },

    /// A user-defined error value, used for error cases not listed above.
    #[error("invalid memory: {reason}")]
    InvalidMemory {
        /// The reason the memory descriptor is invalid.
        reason: String,
    },

    /// Low-level virtual-memory error.
    #[error("virtual memory error: {0}")]
    Region(String),

    /// The compartment could not register the memory.
    #[error(transparent)]
    Compartment(#[from] Box<CompartmentError>),
}

/// A linear memory instance.
pub struct Memory {
    header: GcHeader,
    id: usize,
    ty: MemoryType,
    debug_name: String,
    mmap: Mmap,
    // Writer while growing; readers for operations that must observe a
    // stable capacity. Plain loads/stores take no lock: the guard region
    // makes them safe against concurrent growth.
    resizing_lock: RwLock<()>,
    num_pages: AtomicUsize,
    quota: ResourceQuotaRef,
}

impl Memory {
    /// Create a memory in `compartment` and register it under a fresh id.
    pub fn new(
        compartment: &Arc<Compartment>,
        ty: &MemoryType,
        debug_name: impl Into<String>,
        quota: ResourceQuotaRef,
    ) -> Result<Arc<Self>, MemoryError> {
        if ty.minimum > Pages::max_value() {
            return Err(MemoryError::InvalidMemory {
                reason: format!("minimum size ({:?}) exceeds the addressable range", ty.minimum),
            });
        }
        if let Some(max) = ty.maximum {
            if max > Pages::max_value() {
                return Err(MemoryError::InvalidMemory {
                    reason: format!("maximum size ({:?}) exceeds the addressable range", max),
                });
            }
            if max < ty.minimum {
                return Err(MemoryError::InvalidMemory {
                    reason: format!(
                        "the maximum ({} pages) is less than the minimum ({} pages)",
                        max.0, ty.minimum.0
                    ),
                });
            }
        }

        Self::create(compartment, ty, debug_name.into(), quota, None, &[])
    }

    fn create(
        compartment: &Arc<Compartment>,
        ty: &MemoryType,
        debug_name: String,
        quota: ResourceQuotaRef,
        explicit_id: Option<usize>,
        initial_contents: &[u8],
    ) -> Result<Arc<Self>, MemoryError> {
        let minimum_bytes = ty.minimum.bytes().0;
        let committed_bytes = round_up_to_pages(minimum_bytes, region::page::size());

        let mut maps = compartment.maps.write().unwrap();
        let id = match explicit_id {
            Some(id) => id,
            None => maps.memories.next_free_id().ok_or_else(|| {
                Box::new(CompartmentError::IndexSpaceExhausted(ObjectKind::Memory))
            })?,
        };

        if let Some(quota) = &quota {
            if !quota.memory_pages.allocate(ty.minimum.0 as usize) {
                return Err(MemoryError::QuotaExceeded { pages: ty.minimum });
            }
        }

        let mmap = match Mmap::accessible_reserved(committed_bytes, MEMORY_NUM_RESERVED_BYTES) {
            Ok(mmap) => mmap,
            Err(message) => {
                if let Some(quota) = &quota {
                    quota.memory_pages.free(ty.minimum.0 as usize);
                }
                return Err(MemoryError::Region(message));
            }
        };

        if !initial_contents.is_empty() {
            debug_assert!(initial_contents.len() <= minimum_bytes);
            unsafe {
                std::ptr::copy_nonoverlapping(
                    initial_contents.as_ptr(),
                    mmap.as_mut_ptr(),
                    initial_contents.len(),
                );
            }
        }

        let memory = Arc::new(Self {
            header: GcHeader::new(ObjectKind::Memory, compartment),
            id,
            ty: *ty,
            debug_name,
            mmap,
            resizing_lock: RwLock::new(()),
            num_pages: AtomicUsize::new(ty.minimum.0 as usize),
            quota,
        });

        if !maps.memories.insert_at(id, memory.clone()) {
            return Err(Box::new(CompartmentError::IndexSpaceExhausted(ObjectKind::Memory)).into());
        }
        compartment.set_memory_base(id, memory.base_address() as usize);

        Ok(memory)
    }

    /// Clone this memory into another compartment, preserving its id and
    /// committed contents.
    pub(crate) fn clone_into(
        &self,
        new_compartment: &Arc<Compartment>,
    ) -> Result<Arc<Self>, MemoryError> {
        let _guard = self.resizing_lock.read().unwrap();
        let num_pages = self.num_pages.load(Ordering::SeqCst);
        let committed_bytes = num_pages * WASM_PAGE_SIZE;
        let contents =
            unsafe { std::slice::from_raw_parts(self.mmap.as_ptr(), committed_bytes) };

        let mut ty = self.ty;
        ty.minimum = Pages(num_pages as u32);

        Self::create(
            new_compartment,
            &ty,
            self.debug_name.clone(),
            self.quota.clone(),
            Some(self.id),
            contents,
        )
    }

    /// The shared object header.
    pub fn header(&self) -> &GcHeader {
        &self.header
    }

    /// The memory's id within its compartment.
    pub fn id(&self) -> usize {
        self.id
    }

    /// The memory's type.
    pub fn ty(&self) -> &MemoryType {
        &self.ty
    }

    /// The memory's debug name.
    pub fn debug_name(&self) -> &str {
        &self.debug_name
    }

    /// The base address of the memory's virtual reservation. The base never
    /// moves: growth only commits pages inside the reservation.
    pub fn base_address(&self) -> *mut u8 {
        self.mmap.as_mut_ptr()
    }

    /// The size of the virtual reservation in bytes.
    pub fn num_reserved_bytes(&self) -> usize {
        self.mmap.len()
    }

    /// The current size of the memory.
    pub fn num_pages(&self) -> Pages {
        Pages(self.num_pages.load(Ordering::SeqCst) as u32)
    }

    /// Grow the memory by `delta` pages, returning the previous size.
    pub fn grow(&self, delta: Pages) -> Result<Pages, MemoryError> {
        let _guard = self.resizing_lock.write().unwrap();

        let prev_pages = Pages(self.num_pages.load(Ordering::SeqCst) as u32);

        // Optimization of memory.grow 0 calls.
        if delta.0 == 0 {
            return Ok(prev_pages);
        }

        let new_pages = prev_pages
            .checked_add(delta)
            .ok_or(MemoryError::CouldNotGrow {
                current: prev_pages,
                attempted_delta: delta,
            })?;
        if let Some(maximum) = self.ty.maximum {
            if new_pages > maximum {
                return Err(MemoryError::CouldNotGrow {
                    current: prev_pages,
                    attempted_delta: delta,
                });
            }
        }

        if let Some(quota) = &self.quota {
            if !quota.memory_pages.allocate(delta.0 as usize) {
                return Err(MemoryError::QuotaExceeded { pages: delta });
            }
        }

        // Wasm pages are a whole multiple of any native page size, so the
        // committed range stays page-aligned.
        let prev_bytes = Bytes::from(prev_pages).0;
        let delta_bytes = Bytes::from(delta).0;
        debug_assert!(prev_bytes + delta_bytes <= self.mmap.len());
        debug_assert_eq!(prev_bytes % region::page::size(), 0);

        if let Err(message) = self.mmap.make_accessible(prev_bytes, delta_bytes) {
            if let Some(quota) = &self.quota {
                quota.memory_pages.free(delta.0 as usize);
            }
            return Err(MemoryError::Region(message));
        }

        self.num_pages.store(new_pages.0 as usize, Ordering::SeqCst);
        Ok(prev_pages)
    }
}

impl Drop for Memory {
    fn drop(&mut self) {
        if let Some(quota) = &self.quota {
            quota
                .memory_pages
                .free(self.num_pages.load(Ordering::SeqCst));
        }
    }
}

impl std::fmt::Debug for Memory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Memory")
            .field("id", &self.id)
            .field("debug_name", &self.debug_name)
            .field("num_pages", &self.num_pages())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_memory_type(minimum: u32, maximum: Option<u32>) -> MemoryType {
        MemoryType::new(Pages(minimum), maximum.map(Pages), false)
    }

    #[test]
    fn reservation_covers_the_sandbox() {
        let compartment = Compartment::new().unwrap();
        let memory =
            Memory::new(&compartment, &test_memory_type(1, None), "test", None).unwrap();
        assert!(memory.num_reserved_bytes() >= MEMORY_NUM_RESERVED_BYTES);
        assert_eq!(memory.num_pages(), Pages(1));

        // Committed pages are readable and zeroed.
        let first = unsafe { *memory.base_address() };
        assert_eq!(first, 0);
    }

    #[test]
    fn grow_respects_maximum() {
        let compartment = Compartment::new().unwrap();
        let memory =
            Memory::new(&compartment, &test_memory_type(1, Some(2)), "test", None).unwrap();
        assert_eq!(memory.grow(Pages(1)).unwrap(), Pages(1));
        assert!(matches!(
            memory.grow(Pages(1)),
            Err(MemoryError::CouldNotGrow { .. })
        ));
        assert_eq!(memory.num_pages(), Pages(2));
    }

    #[test]
    fn grow_charges_the_quota() {
        let compartment = Compartment::new().unwrap();
        let quota = crate::quota::ResourceQuota::with_limits(3, 0);
        let memory = Memory::new(
            &compartment,
            &test_memory_type(1, None),
            "test",
            Some(quota.clone()),
        )
        .unwrap();
        assert_eq!(quota.memory_pages.current(), 1);
        memory.grow(Pages(2)).unwrap();
        assert_eq!(quota.memory_pages.current(), 3);
        assert!(matches!(
            memory.grow(Pages(1)),
            Err(MemoryError::QuotaExceeded { .. })
        ));

        // The quota is returned once the compartment releases the memory
        // and the last reference drops.
        compartment.remove_object(&crate::objects::Object::Memory(memory.clone()));
        drop(memory);
        assert_eq!(quota.memory_pages.current(), 0);
    }

    #[test]
    fn ids_allocate_from_zero() {
        let compartment = Compartment::new().unwrap();
        let a = Memory::new(&compartment, &test_memory_type(0, None), "a", None).unwrap();
        let b = Memory::new(&compartment, &test_memory_type(0, None), "b", None).unwrap();
        assert_eq!(a.id(), 0);
        assert_eq!(b.id(), 1);
    }
}
