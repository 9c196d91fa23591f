//! Functions and their mutable side data.
//!
//! `Function` and `FunctionMutableData` reference each other; the cycle is
//! broken by splitting them into two allocations with a weak back-reference,
//! both created together by a single owner (an instance, or the host-ref
//! interning table).

use crate::instance::JitModule;
use crate::objects::INVALID_ID;
use breakwater_types::TypeEncoding;
use std::fmt;
use std::sync::{Arc, Mutex, Weak};

/// The mutable side of a function: its debug name, the JIT module its code
/// lives in, and a back-reference to the function itself.
pub struct FunctionMutableData {
    debug_name: String,
    jit_module: Mutex<Option<Arc<JitModule>>>,
    function: Mutex<Weak<Function>>,
}

impl FunctionMutableData {
    /// The function's debug name.
    pub fn debug_name(&self) -> &str {
        &self.debug_name
    }

    /// The JIT module holding the function's code, if it has been bound.
    pub fn jit_module(&self) -> Option<Arc<JitModule>> {
        self.jit_module.lock().unwrap().clone()
    }

    /// Bind the function to the JIT module holding its code.
    pub fn set_jit_module(&self, jit_module: Arc<JitModule>) {
        *self.jit_module.lock().unwrap() = Some(jit_module);
    }

    /// The function this data belongs to.
    pub fn function(&self) -> Option<Arc<Function>> {
        self.function.lock().unwrap().upgrade()
    }
}

impl fmt::Debug for FunctionMutableData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunctionMutableData")
            .field("debug_name", &self.debug_name)
            .finish_non_exhaustive()
    }
}

/// A WebAssembly function.
///
/// Functions are not owned by a compartment. A function with an instance id
/// is "in" every compartment whose instance of that id shares the function's
/// JIT module; a function with [`INVALID_ID`] is in all compartments.
pub struct Function {
    instance_id: usize,
    encoded_type: TypeEncoding,
    mutable_data: Arc<FunctionMutableData>,
}

impl Function {
    /// Create a function together with its mutable data.
    pub fn new(
        debug_name: impl Into<String>,
        instance_id: usize,
        encoded_type: TypeEncoding,
        jit_module: Option<Arc<JitModule>>,
    ) -> Arc<Self> {
        let debug_name = debug_name.into();
        Arc::new_cyclic(|weak: &Weak<Self>| Self {
            instance_id,
            encoded_type,
            mutable_data: Arc::new(FunctionMutableData {
                debug_name,
                jit_module: Mutex::new(jit_module),
                function: Mutex::new(weak.clone()),
            }),
        })
    }

    /// Create a function that belongs to no instance, such as an interned
    /// host reference.
    pub fn new_unowned(debug_name: impl Into<String>) -> Arc<Self> {
        Self::new(debug_name, INVALID_ID, TypeEncoding::default(), None)
    }

    /// The id of the instance that defined this function, or [`INVALID_ID`].
    pub fn instance_id(&self) -> usize {
        self.instance_id
    }

    /// The packed encoding of the function's signature.
    pub fn encoded_type(&self) -> TypeEncoding {
        self.encoded_type
    }

    /// The function's debug name.
    pub fn debug_name(&self) -> &str {
        self.mutable_data.debug_name()
    }

    /// The function's mutable side data.
    pub fn mutable_data(&self) -> &Arc<FunctionMutableData> {
        &self.mutable_data
    }
}

impl fmt::Debug for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Function")
            .field("debug_name", &self.debug_name())
            .field("instance_id", &self.instance_id)
            .finish_non_exhaustive()
    }
}

/// A function reference with pointer-identity equality, used as the
/// `funcref` payload of runtime values.
#[derive(Clone, Debug)]
pub struct FunctionRef(pub Arc<Function>);

impl PartialEq for FunctionRef {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for FunctionRef {}

impl From<Arc<Function>> for FunctionRef {
    fn from(function: Arc<Function>) -> Self {
        Self(function)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn back_reference_resolves() {
        let function = Function::new_unowned("test!f");
        let through_data = function.mutable_data().function().unwrap();
        assert!(Arc::ptr_eq(&function, &through_data));
    }

    #[test]
    fn function_ref_equality_is_identity() {
        let a = Function::new_unowned("a");
        let b = Function::new_unowned("a");
        assert_eq!(FunctionRef(a.clone()), FunctionRef(a.clone()));
        assert_ne!(FunctionRef(a), FunctionRef(b));
    }
}
