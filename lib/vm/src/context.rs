//! Execution contexts: the per-thread state for running code in a
//! compartment.

use crate::compartment::{Compartment, CompartmentError, ContextRuntimeData};
use crate::objects::{GcHeader, ObjectKind};
use std::ptr::NonNull;
use std::sync::Arc;

/// The execution state of a thread running in a compartment.
///
/// Each context owns a slice of the compartment's runtime-data reservation,
/// committed on creation and seeded with the compartment's initial mutable
/// globals. Contexts are never cloned with their compartment.
pub struct Context {
    header: GcHeader,
    id: usize,
    runtime_data: usize,
}

impl Context {
    /// Create a context in `compartment` and register it under a fresh id.
    pub fn new(compartment: &Arc<Compartment>) -> Result<Arc<Self>, CompartmentError> {
        let mut maps = compartment.maps.write().unwrap();
        let id = maps
            .contexts
            .next_free_id()
            .ok_or(CompartmentError::IndexSpaceExhausted(ObjectKind::Context))?;

        let runtime_data = compartment.commit_context_runtime_data(id)?;

        // Seed the context's mutable globals from the compartment image.
        unsafe {
            let mutable_globals = &mut (*runtime_data.as_ptr()).mutable_globals;
            mutable_globals.copy_from_slice(&maps.initial_context_mutable_globals);
        }

        let context = Arc::new(Self {
            header: GcHeader::new(ObjectKind::Context, compartment),
            id,
            runtime_data: runtime_data.as_ptr() as usize,
        });

        if !maps.contexts.insert_at(id, context.clone()) {
            return Err(CompartmentError::IndexSpaceExhausted(ObjectKind::Context));
        }
        Ok(context)
    }

    /// The shared object header.
    pub fn header(&self) -> &GcHeader {
        &self.header
    }

    /// The context's id within its compartment.
    pub fn id(&self) -> usize {
        self.id
    }

    /// The context's slice of the compartment runtime-data region.
    pub fn runtime_data(&self) -> NonNull<ContextRuntimeData> {
        NonNull::new(self.runtime_data as *mut ContextRuntimeData).unwrap()
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context").field("id", &self.id).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::global::Global;
    use breakwater_types::{GlobalType, Mutability, Type};

    #[test]
    fn contexts_start_from_the_initial_mutable_globals() {
        let compartment = Compartment::new().unwrap();
        let global = Global::new(
            &compartment,
            GlobalType::new(Type::I64, Mutability::Var),
            "g",
        )
        .unwrap();
        global.initialize(7).unwrap();

        let context = Context::new(&compartment).unwrap();
        let value = unsafe {
            (*context.runtime_data().as_ptr()).mutable_globals
                [global.mutable_global_index() as usize]
        };
        assert_eq!(value, 7);
        assert_eq!(context.id(), 0);
    }
}
