//! The tagged value sum consumed and produced by WebAssembly code.

use crate::types::Type;
use std::fmt;

/// Possible runtime values that a WebAssembly module can either consume or
/// produce.
///
/// The type is generic over the function-reference representation so that it
/// can be instantiated both with plain indices (in the IR summary) and with
/// the runtime's owned function handles.
#[derive(Clone, PartialEq)]
pub enum Value<T> {
    /// A 32-bit integer.
    ///
    /// In Wasm integers are sign-agnostic, i.e. this can either be signed or unsigned.
    I32(i32),

    /// A 64-bit integer.
    ///
    /// In Wasm integers are sign-agnostic, i.e. this can either be signed or unsigned.
    I64(i64),

    /// A 32-bit float.
    F32(f32),

    /// A 64-bit float.
    F64(f64),

    /// A 128-bit number.
    V128(u128),

    /// A first-class reference to a WebAssembly function.
    FuncRef(T),

    /// The null reference.
    NullRef,
}

macro_rules! accessors {
    ($bind:ident $(($variant:ident($ty:ty) $get:ident $unwrap:ident $cvt:expr))*) => ($(
        /// Attempt to access the underlying value of this `Value`, returning
        /// `None` if it is not the correct type.
        pub fn $get(&self) -> Option<$ty> {
            if let Self::$variant($bind) = self {
                Some($cvt)
            } else {
                None
            }
        }

        /// Returns the underlying value of this `Value`, panicking if it's the
        /// wrong type.
        ///
        /// # Panics
        ///
        /// Panics if `self` is not of the right type.
        pub fn $unwrap(&self) -> $ty {
            self.$get().expect(concat!("expected ", stringify!($ty)))
        }
    )*)
}

impl<T> Value<T> {
    /// Returns the corresponding [`Type`] for this `Value`.
    pub fn ty(&self) -> Type {
        match self {
            Self::I32(_) => Type::I32,
            Self::I64(_) => Type::I64,
            Self::F32(_) => Type::F32,
            Self::F64(_) => Type::F64,
            Self::V128(_) => Type::V128,
            Self::FuncRef(_) => Type::FuncRef,
            Self::NullRef => Type::NullRef,
        }
    }

    accessors! {
        e
        (I32(i32) i32 unwrap_i32 *e)
        (I64(i64) i64 unwrap_i64 *e)
        (F32(f32) f32 unwrap_f32 *e)
        (F64(f64) f64 unwrap_f64 *e)
        (V128(u128) v128 unwrap_v128 *e)
    }

    /// Attempt to access the underlying function reference, returning `None`
    /// if this value holds a different type.
    pub fn funcref(&self) -> Option<&T> {
        if let Self::FuncRef(f) = self {
            Some(f)
        } else {
            None
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for Value<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::I32(v) => write!(f, "I32({v:?})"),
            Self::I64(v) => write!(f, "I64({v:?})"),
            Self::F32(v) => write!(f, "F32({v:?})"),
            Self::F64(v) => write!(f, "F64({v:?})"),
            Self::V128(v) => write!(f, "V128({v:?})"),
            Self::FuncRef(v) => write!(f, "FuncRef({v:?})"),
            Self::NullRef => write!(f, "NullRef"),
        }
    }
}

impl<T> From<i32> for Value<T> {
    fn from(val: i32) -> Self {
        Self::I32(val)
    }
}

impl<T> From<i64> for Value<T> {
    fn from(val: i64) -> Self {
        Self::I64(val)
    }
}

impl<T> From<f32> for Value<T> {
    fn from(val: f32) -> Self {
        Self::F32(val)
    }
}

impl<T> From<f64> for Value<T> {
    fn from(val: f64) -> Self {
        Self::F64(val)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn value_types() {
        assert_eq!(Value::<()>::I32(7).ty(), Type::I32);
        assert_eq!(Value::<()>::V128(0).ty(), Type::V128);
        assert_eq!(Value::<()>::NullRef.ty(), Type::NullRef);
    }

    #[test]
    fn accessors_match_variant() {
        let value = Value::<()>::I64(-1);
        assert_eq!(value.i64(), Some(-1));
        assert_eq!(value.i32(), None);
    }
}
