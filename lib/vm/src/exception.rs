//! Exception type instances.

use crate::compartment::{Compartment, CompartmentError};
use crate::objects::{GcHeader, ObjectKind};
use breakwater_types::ExceptionTypeSig;
use std::sync::Arc;

/// An exception type instance: the runtime identity thrown exceptions are
/// matched against.
pub struct ExceptionType {
    header: GcHeader,
    id: usize,
    sig: ExceptionTypeSig,
    debug_name: String,
}

impl ExceptionType {
    /// Create an exception type in `compartment` and register it under a
    /// fresh id.
    pub fn new(
        compartment: &Arc<Compartment>,
        sig: ExceptionTypeSig,
        debug_name: impl Into<String>,
    ) -> Result<Arc<Self>, CompartmentError> {
        Self::create(compartment, sig, debug_name.into(), None)
    }

    fn create(
        compartment: &Arc<Compartment>,
        sig: ExceptionTypeSig,
        debug_name: String,
        explicit_id: Option<usize>,
    ) -> Result<Arc<Self>, CompartmentError> {
        let mut maps = compartment.maps.write().unwrap();
        let id = match explicit_id {
            Some(id) => id,
            None => maps.exception_types.next_free_id().ok_or(
                CompartmentError::IndexSpaceExhausted(ObjectKind::ExceptionType),
            )?,
        };

        let exception_type = Arc::new(Self {
            header: GcHeader::new(ObjectKind::ExceptionType, compartment),
            id,
            sig,
            debug_name,
        });

        if !maps.exception_types.insert_at(id, exception_type.clone()) {
            return Err(CompartmentError::IndexSpaceExhausted(
                ObjectKind::ExceptionType,
            ));
        }
        Ok(exception_type)
    }

    pub(crate) fn clone_into(
        &self,
        new_compartment: &Arc<Compartment>,
    ) -> Result<Arc<Self>, CompartmentError> {
        Self::create(
            new_compartment,
            self.sig.clone(),
            self.debug_name.clone(),
            Some(self.id),
        )
    }

    /// The shared object header.
    pub fn header(&self) -> &GcHeader {
        &self.header
    }

    /// The exception type's id within its compartment.
    pub fn id(&self) -> usize {
        self.id
    }

    /// The exception type's signature.
    pub fn sig(&self) -> &ExceptionTypeSig {
        &self.sig
    }

    /// The exception type's debug name.
    pub fn debug_name(&self) -> &str {
        &self.debug_name
    }
}

impl std::fmt::Debug for ExceptionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExceptionType")
            .field("id", &self.id)
            .field("debug_name", &self.debug_name)
            .finish_non_exhaustive()
    }
}
