//! The closed set of runtime traps compiled code can raise.

use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// A trap code describing the reason for a trap.
///
/// All trap instructions have an explicit trap code.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Hash)]
#[repr(u32)]
pub enum TrapCode {
    /// A load or store hit the guard pages beyond the linear memory.
    OutOfBoundsMemoryAccess = 0,

    /// `memory.init` read past the end of a data segment.
    OutOfBoundsDataSegmentAccess = 1,

    /// `table.init` read past the end of an element segment.
    OutOfBoundsElemSegmentAccess = 2,

    /// A table access was outside the current table bounds.
    OutOfBoundsTableAccess = 3,

    /// An indirect call went through a table slot that was never initialized.
    UninitializedTableElement = 4,

    /// The host call stack was exhausted.
    StackOverflow = 5,

    /// An integer arithmetic operation caused an overflow.
    IntegerOverflow = 6,

    /// An integer division by zero.
    IntegerDivideByZero = 7,

    /// Failed float-to-int conversion.
    InvalidFloatOperation = 8,

    /// An atomic memory access with an unaligned address.
    MisalignedAtomicMemoryAccess = 9,

    /// Code that should have been unreachable was reached.
    ReachedUnreachable = 10,

    /// The signature of an indirect call target did not match the expected
    /// signature.
    IndirectCallSignatureMismatch = 11,

    /// An intrinsic was passed an argument it cannot act on, such as a
    /// dropped data or element segment.
    InvalidArgument = 12,
}

impl TrapCode {
    /// Gives the trap message describing this trap, in the conventional
    /// wording consumed by the test-script trap classifier.
    pub fn message(&self) -> &str {
        match self {
            Self::OutOfBoundsMemoryAccess => "out of bounds memory access",
            Self::OutOfBoundsDataSegmentAccess => "out of bounds data segment access",
            Self::OutOfBoundsElemSegmentAccess => "out of bounds elem segment access",
            Self::OutOfBoundsTableAccess => "undefined element",
            Self::UninitializedTableElement => "uninitialized element",
            Self::StackOverflow => "call stack exhausted",
            Self::IntegerOverflow => "integer overflow",
            Self::IntegerDivideByZero => "integer divide by zero",
            Self::InvalidFloatOperation => "invalid conversion to integer",
            Self::MisalignedAtomicMemoryAccess => "unaligned atomic",
            Self::ReachedUnreachable => "unreachable",
            Self::IndirectCallSignatureMismatch => "indirect call type mismatch",
            Self::InvalidArgument => "invalid argument",
        }
    }
}

impl fmt::Display for TrapCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.message())
    }
}

/// Error raised when parsing an unknown trap-code name.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid trap code: {0}")]
pub struct ParseTrapCodeError(String);

impl FromStr for TrapCode {
    type Err = ParseTrapCodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "out_of_bounds_memory_access" => Ok(Self::OutOfBoundsMemoryAccess),
            "out_of_bounds_data_segment_access" => Ok(Self::OutOfBoundsDataSegmentAccess),
            "out_of_bounds_elem_segment_access" => Ok(Self::OutOfBoundsElemSegmentAccess),
            "out_of_bounds_table_access" => Ok(Self::OutOfBoundsTableAccess),
            "uninitialized_table_element" => Ok(Self::UninitializedTableElement),
            "stack_overflow" => Ok(Self::StackOverflow),
            "integer_overflow" => Ok(Self::IntegerOverflow),
            "integer_divide_by_zero" => Ok(Self::IntegerDivideByZero),
            "invalid_float_operation" => Ok(Self::InvalidFloatOperation),
            "misaligned_atomic_memory_access" => Ok(Self::MisalignedAtomicMemoryAccess),
            "reached_unreachable" => Ok(Self::ReachedUnreachable),
            "indirect_call_signature_mismatch" => Ok(Self::IndirectCallSignatureMismatch),
            "invalid_argument" => Ok(Self::InvalidArgument),
            _ => Err(ParseTrapCodeError(s.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_matches_classifier_wording() {
        assert_eq!(
            TrapCode::OutOfBoundsMemoryAccess.message(),
            "out of bounds memory access"
        );
        assert_eq!(TrapCode::StackOverflow.message(), "call stack exhausted");
        assert_eq!(TrapCode::MisalignedAtomicMemoryAccess.message(), "unaligned atomic");
    }
}
