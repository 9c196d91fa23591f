//! Global variable instances.

use crate::compartment::{Compartment, CompartmentError};
use crate::objects::{GcHeader, ObjectKind};
use breakwater_types::GlobalType;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// The index value globals carry when they have no mutable-global slot.
pub(crate) const INVALID_MUTABLE_GLOBAL_INDEX: u32 = u32::MAX;

/// A global variable instance.
///
/// Mutable globals are assigned a slot in their compartment's mutable-global
/// array; the slot index is preserved by compartment cloning so that
/// compiled code addressing the slot keeps working in the clone.
pub struct Global {
    header: GcHeader,
    id: usize,
    ty: GlobalType,
    debug_name: String,
    mutable_global_index: u32,
    initial_value: Mutex<u128>,
    has_been_initialized: AtomicBool,
}

impl Global {
    /// Create a global in `compartment` and register it under a fresh id.
    pub fn new(
        compartment: &Arc<Compartment>,
        ty: GlobalType,
        debug_name: impl Into<String>,
    ) -> Result<Arc<Self>, CompartmentError> {
        Self::create(compartment, ty, debug_name.into(), None, None, 0, false)
    }

    #[allow(clippy::too_many_arguments)]
    fn create(
        compartment: &Arc<Compartment>,
        ty: GlobalType,
        debug_name: String,
        explicit_id: Option<usize>,
        explicit_mutable_global_index: Option<u32>,
        initial_value: u128,
        has_been_initialized: bool,
    ) -> Result<Arc<Self>, CompartmentError> {
        let mut maps = compartment.maps.write().unwrap();

        let id = match explicit_id {
            Some(id) => id,
            None => maps
                .globals
                .next_free_id()
                .ok_or(CompartmentError::IndexSpaceExhausted(ObjectKind::Global))?,
        };

        let mutable_global_index = match explicit_mutable_global_index {
            // Clones reuse their slot; the clone copied the allocation mask
            // wholesale, so the slot is already marked in use.
            Some(index) => index,
            None if ty.mutability.is_mutable() => maps
                .allocate_mutable_global_index()
                .ok_or(CompartmentError::TooManyMutableGlobals)?,
            None => INVALID_MUTABLE_GLOBAL_INDEX,
        };

        let global = Arc::new(Self {
            header: GcHeader::new(ObjectKind::Global, compartment),
            id,
            ty,
            debug_name,
            mutable_global_index,
            initial_value: Mutex::new(initial_value),
            has_been_initialized: AtomicBool::new(has_been_initialized),
        });

        if !maps.globals.insert_at(id, global.clone()) {
            if explicit_mutable_global_index.is_none()
                && mutable_global_index != INVALID_MUTABLE_GLOBAL_INDEX
            {
                maps.free_mutable_global_index(mutable_global_index);
            }
            // Release the lock before the failed global drops: its Drop
            // impl re-takes the compartment lock to free its slot.
            drop(maps);
            drop(global);
            return Err(CompartmentError::IndexSpaceExhausted(ObjectKind::Global));
        }

        Ok(global)
    }

    /// Clone this global into another compartment, preserving both its id
    /// and its mutable-global slot.
    pub(crate) fn clone_into(
        &self,
        new_compartment: &Arc<Compartment>,
    ) -> Result<Arc<Self>, CompartmentError> {
        Self::create(
            new_compartment,
            self.ty,
            self.debug_name.clone(),
            Some(self.id),
            Some(self.mutable_global_index),
            *self.initial_value.lock().unwrap(),
            self.has_been_initialized.load(Ordering::SeqCst),
        )
    }

    /// The shared object header.
    pub fn header(&self) -> &GcHeader {
        &self.header
    }

    /// The global's id within its compartment.
    pub fn id(&self) -> usize {
        self.id
    }

    /// The global's type.
    pub fn ty(&self) -> &GlobalType {
        &self.ty
    }

    /// The global's debug name.
    pub fn debug_name(&self) -> &str {
        &self.debug_name
    }

    /// The compartment mutable-global slot this global addresses, or
    /// `u32::MAX` for immutable globals.
    pub fn mutable_global_index(&self) -> u32 {
        self.mutable_global_index
    }

    /// The value the global was initialized with.
    pub fn initial_value(&self) -> u128 {
        *self.initial_value.lock().unwrap()
    }

    /// Whether [`Global::initialize`] has run.
    pub fn has_been_initialized(&self) -> bool {
        self.has_been_initialized.load(Ordering::SeqCst)
    }

    /// Set the global's initial value. For mutable globals this also seeds
    /// the value new contexts start from.
    pub fn initialize(&self, value: u128) -> Result<(), CompartmentError> {
        let compartment = self
            .header
            .compartment()
            .ok_or(CompartmentError::CompartmentDropped)?;
        *self.initial_value.lock().unwrap() = value;
        if self.mutable_global_index != INVALID_MUTABLE_GLOBAL_INDEX {
            let mut maps = compartment.maps.write().unwrap();
            maps.initial_context_mutable_globals[self.mutable_global_index as usize] = value;
        }
        self.has_been_initialized.store(true, Ordering::SeqCst);
        Ok(())
    }
}

impl Drop for Global {
    fn drop(&mut self) {
        if self.mutable_global_index != INVALID_MUTABLE_GLOBAL_INDEX {
            if let Some(compartment) = self.header.compartment() {
                let mut maps = compartment.maps.write().unwrap();
                maps.free_mutable_global_index(self.mutable_global_index);
            }
        }
    }
}

impl std::fmt::Debug for Global {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Global")
            .field("id", &self.id)
            .field("debug_name", &self.debug_name)
            .field("ty", &self.ty)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use breakwater_types::{Mutability, Type};

    #[test]
    fn mutable_globals_get_distinct_slots() {
        let compartment = Compartment::new().unwrap();
        let ty = GlobalType::new(Type::I32, Mutability::Var);
        let a = Global::new(&compartment, ty, "a").unwrap();
        let b = Global::new(&compartment, ty, "b").unwrap();
        assert_ne!(a.mutable_global_index(), b.mutable_global_index());

        let immutable =
            Global::new(&compartment, GlobalType::new(Type::I32, Mutability::Const), "c").unwrap();
        assert_eq!(immutable.mutable_global_index(), u32::MAX);
    }

    #[test]
    fn initialize_seeds_new_contexts() {
        let compartment = Compartment::new().unwrap();
        let ty = GlobalType::new(Type::I64, Mutability::Var);
        let global = Global::new(&compartment, ty, "g").unwrap();
        assert!(!global.has_been_initialized());
        global.initialize(42).unwrap();
        assert!(global.has_been_initialized());

        let maps = compartment.maps.read().unwrap();
        assert_eq!(
            maps.initial_context_mutable_globals[global.mutable_global_index() as usize],
            42
        );
    }

    #[test]
    fn dropping_a_global_frees_its_slot() {
        let compartment = Compartment::new().unwrap();
        let ty = GlobalType::new(Type::F64, Mutability::Var);
        let global = Global::new(&compartment, ty, "g").unwrap();
        let slot = global.mutable_global_index();
        compartment.remove_object(&crate::objects::Object::Global(global.clone()));
        drop(global);

        let replacement = Global::new(&compartment, ty, "h").unwrap();
        assert_eq!(replacement.mutable_global_index(), slot);
    }
}
