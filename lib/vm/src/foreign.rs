//! Opaque host objects with compartment-scoped identity.

use crate::compartment::{Compartment, CompartmentError};
use crate::objects::{GcHeader, ObjectKind};
use std::sync::Arc;

/// An opaque host handle. Foreigns carry no payload of their own; embedders
/// attach state through the header's user data.
pub struct Foreign {
    header: GcHeader,
    id: usize,
}

impl Foreign {
    /// Create a foreign in `compartment` and register it under a fresh id.
    pub fn new(compartment: &Arc<Compartment>) -> Result<Arc<Self>, CompartmentError> {
        let mut maps = compartment.maps.write().unwrap();
        let id = maps
            .foreigns
            .next_free_id()
            .ok_or(CompartmentError::IndexSpaceExhausted(ObjectKind::Foreign))?;

        let foreign = Arc::new(Self {
            header: GcHeader::new(ObjectKind::Foreign, compartment),
            id,
        });

        if !maps.foreigns.insert_at(id, foreign.clone()) {
            return Err(CompartmentError::IndexSpaceExhausted(ObjectKind::Foreign));
        }
        Ok(foreign)
    }

    /// The shared object header.
    pub fn header(&self) -> &GcHeader {
        &self.header
    }

    /// The foreign's id within its compartment.
    pub fn id(&self) -> usize {
        self.id
    }
}

impl std::fmt::Debug for Foreign {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Foreign").field("id", &self.id).finish()
    }
}
