//! The shared header and tagged union over the runtime object kinds.

use crate::compartment::Compartment;
use crate::context::Context;
use crate::exception::ExceptionType;
use crate::foreign::Foreign;
use crate::function::Function;
use crate::global::Global;
use crate::instance::Instance;
use crate::memory::Memory;
use crate::table::Table;
use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};

/// The id value reserved to mean "not registered in any compartment".
pub const INVALID_ID: usize = usize::MAX;

/// The kind tag of a runtime object.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    /// A table.
    Table,
    /// A linear memory.
    Memory,
    /// A global.
    Global,
    /// An exception type.
    ExceptionType,
    /// A module instance.
    Instance,
    /// An execution context.
    Context,
    /// An opaque host object.
    Foreign,
    /// A function. Functions are not compartment-owned.
    Function,
}

/// Opaque embedder data attached to a runtime object, with a deterministic
/// finalizer run when the object is destroyed.
pub struct UserData {
    /// The attached value.
    pub value: Box<dyn Any + Send>,
    /// Called with the value when the owning object is finalized.
    pub finalize: Option<Box<dyn FnOnce(Box<dyn Any + Send>) + Send>>,
}

impl fmt::Debug for UserData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UserData").finish_non_exhaustive()
    }
}

/// The common header of all compartment-owned runtime objects.
#[derive(Debug)]
pub struct GcHeader {
    kind: ObjectKind,
    compartment: Weak<Compartment>,
    num_root_references: AtomicUsize,
    user_data: Mutex<Option<UserData>>,
}

impl GcHeader {
    pub(crate) fn new(kind: ObjectKind, compartment: &Arc<Compartment>) -> Self {
        Self {
            kind,
            compartment: Arc::downgrade(compartment),
            num_root_references: AtomicUsize::new(0),
            user_data: Mutex::new(None),
        }
    }

    /// The object's kind tag.
    pub fn kind(&self) -> ObjectKind {
        self.kind
    }

    /// The compartment this object belongs to for its whole lifetime.
    pub fn compartment(&self) -> Option<Arc<Compartment>> {
        self.compartment.upgrade()
    }

    pub(crate) fn compartment_weak(&self) -> &Weak<Compartment> {
        &self.compartment
    }

    /// Add an external strong reference ("root").
    pub fn add_root_ref(&self) {
        self.num_root_references.fetch_add(1, Ordering::SeqCst);
    }

    /// Remove an external strong reference.
    pub fn remove_root_ref(&self) {
        let previous = self.num_root_references.fetch_sub(1, Ordering::SeqCst);
        assert!(previous > 0, "removed more root references than were added");
    }

    /// The number of external strong references. An object with zero roots
    /// is eligible for collection once its compartment releases it.
    pub fn num_root_references(&self) -> usize {
        self.num_root_references.load(Ordering::SeqCst)
    }

    /// Attach embedder data, returning any previous attachment without
    /// running its finalizer.
    pub fn set_user_data(&self, user_data: Option<UserData>) -> Option<UserData> {
        std::mem::replace(&mut *self.user_data.lock().unwrap(), user_data)
    }

    /// Run a closure with a reference to the attached embedder data.
    pub fn with_user_data<R>(&self, f: impl FnOnce(Option<&UserData>) -> R) -> R {
        f(self.user_data.lock().unwrap().as_ref())
    }
}

impl Drop for GcHeader {
    fn drop(&mut self) {
        if let Some(user_data) = self.user_data.get_mut().unwrap().take() {
            if let Some(finalize) = user_data.finalize {
                finalize(user_data.value);
            }
        }
    }
}

/// A reference to any runtime object. Dispatch is by tag, not virtual call.
#[derive(Clone)]
pub enum Object {
    /// A table.
    Table(Arc<Table>),
    /// A linear memory.
    Memory(Arc<Memory>),
    /// A global.
    Global(Arc<Global>),
    /// An exception type.
    ExceptionType(Arc<ExceptionType>),
    /// A module instance.
    Instance(Arc<Instance>),
    /// An execution context.
    Context(Arc<Context>),
    /// An opaque host object.
    Foreign(Arc<Foreign>),
    /// A function.
    Function(Arc<Function>),
}

impl Object {
    /// The object's kind tag.
    pub fn kind(&self) -> ObjectKind {
        match self {
            Self::Table(_) => ObjectKind::Table,
            Self::Memory(_) => ObjectKind::Memory,
            Self::Global(_) => ObjectKind::Global,
            Self::ExceptionType(_) => ObjectKind::ExceptionType,
            Self::Instance(_) => ObjectKind::Instance,
            Self::Context(_) => ObjectKind::Context,
            Self::Foreign(_) => ObjectKind::Foreign,
            Self::Function(_) => ObjectKind::Function,
        }
    }

    /// The GC header, for every kind except `Function` (functions carry no
    /// header because they are not compartment-owned).
    pub fn header(&self) -> Option<&GcHeader> {
        match self {
            Self::Table(o) => Some(o.header()),
            Self::Memory(o) => Some(o.header()),
            Self::Global(o) => Some(o.header()),
            Self::ExceptionType(o) => Some(o.header()),
            Self::Instance(o) => Some(o.header()),
            Self::Context(o) => Some(o.header()),
            Self::Foreign(o) => Some(o.header()),
            Self::Function(_) => None,
        }
    }

    /// The object's id within its compartment's index space for its kind.
    /// Functions report [`INVALID_ID`] unless they belong to an instance.
    pub fn id(&self) -> usize {
        match self {
            Self::Table(o) => o.id(),
            Self::Memory(o) => o.id(),
            Self::Global(o) => o.id(),
            Self::ExceptionType(o) => o.id(),
            Self::Instance(o) => o.id(),
            Self::Context(o) => o.id(),
            Self::Foreign(o) => o.id(),
            Self::Function(o) => o.instance_id(),
        }
    }

    /// Whether two object references point at the same object.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Table(a), Self::Table(b)) => Arc::ptr_eq(a, b),
            (Self::Memory(a), Self::Memory(b)) => Arc::ptr_eq(a, b),
            (Self::Global(a), Self::Global(b)) => Arc::ptr_eq(a, b),
            (Self::ExceptionType(a), Self::ExceptionType(b)) => Arc::ptr_eq(a, b),
            (Self::Instance(a), Self::Instance(b)) => Arc::ptr_eq(a, b),
            (Self::Context(a), Self::Context(b)) => Arc::ptr_eq(a, b),
            (Self::Foreign(a), Self::Foreign(b)) => Arc::ptr_eq(a, b),
            (Self::Function(a), Self::Function(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl fmt::Debug for Object {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Function(function) => {
                write!(f, "Function({:?})", function.debug_name())
            }
            other => f
                .debug_struct("Object")
                .field("kind", &other.kind())
                .field("id", &other.id())
                .finish(),
        }
    }
}
