//! Table instances with biased function-pointer elements.
//!
//! Each element stores the function's address minus the address of a
//! process-wide sentinel function, so zero-initialized cells resolve back to
//! the sentinel when the bias is re-added. That way freshly committed pages
//! behave as "out of bounds" without a separate validity bit.

use crate::compartment::{Compartment, CompartmentError};
use crate::function::Function;
use crate::mmap::{round_up_to_pages, Mmap};
use crate::objects::{GcHeader, ObjectKind};
use crate::quota::ResourceQuotaRef;
use crate::trap::Trap;
use breakwater_types::{TableType, TrapCode};
use once_cell::sync::Lazy;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use thiserror::Error;

static OUT_OF_BOUNDS_ELEMENT: Lazy<Arc<Function>> =
    Lazy::new(|| Function::new_unowned("outOfBoundsTableElement"));

/// The sentinel function whose address biases every table element.
///
/// A zero-initialized cell, when the sentinel's address is re-added,
/// resolves to the sentinel itself; calling through it traps.
pub fn out_of_bounds_element() -> &'static Arc<Function> {
    &OUT_OF_BOUNDS_ELEMENT
}

fn sentinel_address() -> usize {
    Arc::as_ptr(out_of_bounds_element()) as usize
}

const ELEMENT_SIZE: usize = std::mem::size_of::<usize>();

/// Error type describing things that can go wrong when operating on tables.
#[derive(Debug, Error)]
pub enum TableError {
    /// The operation would cause the size of the table to exceed its
    /// maximum.
    #[error("table of {current} elements could not grow by {attempted_delta} elements")]
    CouldNotGrow {
        /// The current number of elements.
        current: u32,
        /// The attempted amount to grow by.
        attempted_delta: u32,
    },

    /// The table's resource quota denied the allocation.
    #[error("the resource quota denied an allocation of {elements} table elements")]
    QuotaExceeded {
        /// The number of elements requested.
        elements: u32,
    },

    /// A user-defined error value, used for error cases not listed above.
    #[error("invalid table: {reason}")]
    InvalidTable {
        /// The reason the table descriptor is invalid.
        reason: String,
    },

    /// Low-level virtual-memory error.
    #[error("virtual memory error: {0}")]
    Region(String),

    /// The compartment could not register the table.
    #[error(transparent)]
    Compartment(#[from] Box<CompartmentError>),
}

/// A table instance.
pub struct Table {
    header: GcHeader,
    id: usize,
    ty: TableType,
    debug_name: String,
    mmap: Mmap,
    num_reserved_elements: usize,
    resizing_lock: RwLock<()>,
    num_elements: AtomicUsize,
    quota: ResourceQuotaRef,
}

impl Table {
    /// Create a table in `compartment` and register it under a fresh id.
    pub fn new(
        compartment: &Arc<Compartment>,
        ty: &TableType,
        debug_name: impl Into<String>,
        quota: ResourceQuotaRef,
    ) -> Result<Arc<Self>, TableError> {
        if let Some(max) = ty.maximum {
            if max < ty.minimum {
                return Err(TableError::InvalidTable {
                    reason: format!(
                        "the maximum ({}) is less than the minimum ({})",
                        max, ty.minimum
                    ),
                });
            }
        }
        Self::create(compartment, ty, debug_name.into(), quota, None, None)
    }

    fn create(
        compartment: &Arc<Compartment>,
        ty: &TableType,
        debug_name: String,
        quota: ResourceQuotaRef,
        explicit_id: Option<usize>,
        initial_elements: Option<&[usize]>,
    ) -> Result<Arc<Self>, TableError> {
        let page_size = region::page::size();
        let num_reserved_elements = ty.maximum.unwrap_or(u32::MAX) as usize;
        let reserved_bytes =
            round_up_to_pages(num_reserved_elements.max(1) * ELEMENT_SIZE, page_size);
        let committed_bytes =
            round_up_to_pages(ty.minimum as usize * ELEMENT_SIZE, page_size);

        let mut maps = compartment.maps.write().unwrap();
        let id = match explicit_id {
            Some(id) => id,
            None => maps
                .tables
                .next_free_id()
                .ok_or_else(|| Box::new(CompartmentError::IndexSpaceExhausted(ObjectKind::Table)))?,
        };

        if let Some(quota) = &quota {
            if !quota.table_elems.allocate(ty.minimum as usize) {
                return Err(TableError::QuotaExceeded {
                    elements: ty.minimum,
                });
            }
        }

        let mmap = match Mmap::accessible_reserved(committed_bytes, reserved_bytes) {
            Ok(mmap) => mmap,
            Err(message) => {
                if let Some(quota) = &quota {
                    quota.table_elems.free(ty.minimum as usize);
                }
                return Err(TableError::Region(message));
            }
        };

        if let Some(initial_elements) = initial_elements {
            debug_assert!(initial_elements.len() <= ty.minimum as usize);
            unsafe {
                std::ptr::copy_nonoverlapping(
                    initial_elements.as_ptr(),
                    mmap.as_mut_ptr() as *mut usize,
                    initial_elements.len(),
                );
            }
        }

        let table = Arc::new(Self {
            header: GcHeader::new(ObjectKind::Table, compartment),
            id,
            ty: *ty,
            debug_name,
            mmap,
            num_reserved_elements,
            resizing_lock: RwLock::new(()),
            num_elements: AtomicUsize::new(ty.minimum as usize),
            quota,
        });

        if !maps.tables.insert_at(id, table.clone()) {
            return Err(Box::new(CompartmentError::IndexSpaceExhausted(ObjectKind::Table)).into());
        }
        compartment.set_table_base(id, table.mmap.as_ptr() as usize);

        Ok(table)
    }

    /// Clone this table into another compartment, preserving its id and its
    /// current biased elements.
    pub(crate) fn clone_into(
        &self,
        new_compartment: &Arc<Compartment>,
    ) -> Result<Arc<Self>, TableError> {
        let _guard = self.resizing_lock.read().unwrap();
        let num_elements = self.num_elements.load(Ordering::SeqCst);
        // Biased values are relative to the process-wide sentinel, so they
        // are valid verbatim in the cloned table.
        let elements =
            unsafe { std::slice::from_raw_parts(self.mmap.as_ptr() as *const usize, num_elements) };

        let mut ty = self.ty;
        ty.minimum = num_elements as u32;

        Self::create(
            new_compartment,
            &ty,
            self.debug_name.clone(),
            self.quota.clone(),
            Some(self.id),
            Some(elements),
        )
    }

    /// The shared object header.
    pub fn header(&self) -> &GcHeader {
        &self.header
    }

    /// The table's id within its compartment.
    pub fn id(&self) -> usize {
        self.id
    }

    /// The table's type.
    pub fn ty(&self) -> &TableType {
        &self.ty
    }

    /// The table's debug name.
    pub fn debug_name(&self) -> &str {
        &self.debug_name
    }

    /// The number of elements the virtual reservation can hold.
    pub fn num_reserved_elements(&self) -> usize {
        self.num_reserved_elements
    }

    /// The size of the virtual reservation in bytes.
    pub fn num_reserved_bytes(&self) -> usize {
        self.mmap.len()
    }

    /// The current number of elements.
    pub fn num_elements(&self) -> u32 {
        self.num_elements.load(Ordering::SeqCst) as u32
    }

    fn element(&self, index: u32) -> Result<&AtomicUsize, Trap> {
        if (index as usize) >= self.num_elements.load(Ordering::SeqCst) {
            return Err(Trap::new(TrapCode::OutOfBoundsTableAccess));
        }
        // In bounds of the committed region: num_elements only grows and
        // growth commits pages first.
        Ok(unsafe { &*(self.mmap.as_ptr() as *const AtomicUsize).add(index as usize) })
    }

    /// Read the function stored at `index`.
    ///
    /// Returns `None` for a cell that is uninitialized (still holding the
    /// sentinel). The returned pointer is valid for as long as the function's
    /// owner (its instance, or the host-ref table) keeps it alive; the table
    /// itself does not own its elements.
    pub fn get(&self, index: u32) -> Result<Option<*const Function>, Trap> {
        let biased = self.element(index)?.load(Ordering::SeqCst);
        let address = biased.wrapping_add(sentinel_address());
        if address == sentinel_address() {
            Ok(None)
        } else {
            Ok(Some(address as *const Function))
        }
    }

    /// Store `function` at `index`, returning the previous element (or
    /// `None` if the cell was uninitialized).
    pub fn set(
        &self,
        index: u32,
        function: &Arc<Function>,
    ) -> Result<Option<*const Function>, Trap> {
        let biased = (Arc::as_ptr(function) as usize).wrapping_sub(sentinel_address());
        let previous = self.element(index)?.swap(biased, Ordering::SeqCst);
        let address = previous.wrapping_add(sentinel_address());
        if address == sentinel_address() {
            Ok(None)
        } else {
            Ok(Some(address as *const Function))
        }
    }

    /// Grow the table by `delta` elements, returning the previous size.
    pub fn grow(&self, delta: u32) -> Result<u32, TableError> {
        let _guard = self.resizing_lock.write().unwrap();

        let prev_elements = self.num_elements.load(Ordering::SeqCst) as u32;
        if delta == 0 {
            return Ok(prev_elements);
        }

        let new_elements = prev_elements
            .checked_add(delta)
            .ok_or(TableError::CouldNotGrow {
                current: prev_elements,
                attempted_delta: delta,
            })?;
        if new_elements as usize > self.num_reserved_elements
            || self.ty.maximum.is_some_and(|maximum| new_elements > maximum)
        {
            return Err(TableError::CouldNotGrow {
                current: prev_elements,
                attempted_delta: delta,
            });
        }

        if let Some(quota) = &self.quota {
            if !quota.table_elems.allocate(delta as usize) {
                return Err(TableError::QuotaExceeded { elements: delta });
            }
        }

        let page_size = region::page::size();
        let prev_committed =
            round_up_to_pages(prev_elements as usize * ELEMENT_SIZE, page_size);
        let new_committed = round_up_to_pages(new_elements as usize * ELEMENT_SIZE, page_size);
        if new_committed > prev_committed {
            if let Err(message) = self
                .mmap
                .make_accessible(prev_committed, new_committed - prev_committed)
            {
                if let Some(quota) = &self.quota {
                    quota.table_elems.free(delta as usize);
                }
                return Err(TableError::Region(message));
            }
        }

        self.num_elements
            .store(new_elements as usize, Ordering::SeqCst);
        Ok(prev_elements)
    }
}

impl Drop for Table {
    fn drop(&mut self) {
        if let Some(quota) = &self.quota {
            quota
                .table_elems
                .free(self.num_elements.load(Ordering::SeqCst));
        }
    }
}

impl std::fmt::Debug for Table {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Table")
            .field("id", &self.id)
            .field("debug_name", &self.debug_name)
            .field("num_elements", &self.num_elements())
            .finish_non_exhaustive()
    }
}
