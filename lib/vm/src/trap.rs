//! Runtime traps, as raised by the intrinsics backing compiled code.

use breakwater_types::TrapCode;
use std::fmt;

/// A trap unwinding the current Wasm activation frame to the embedder.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Trap {
    code: TrapCode,
}

impl Trap {
    /// Construct a trap from its code.
    pub fn new(code: TrapCode) -> Self {
        Self { code }
    }

    /// The trap code.
    pub fn code(&self) -> TrapCode {
        self.code
    }
}

impl From<TrapCode> for Trap {
    fn from(code: TrapCode) -> Self {
        Self::new(code)
    }
}

impl fmt::Display for Trap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code.message())
    }
}

impl std::error::Error for Trap {}
