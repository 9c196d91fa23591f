//! Parsing of WebAssembly test scripts and module text.
//!
//! A test script is a sequence of parenthesized commands: module
//! definitions, actions (`get`/`invoke`), and assertions. Parsing produces
//! a declarative [`Command`] list for a conformance driver to interpret;
//! nothing is executed here.

#![warn(missing_docs, unused_import_braces)]
#![deny(unused_extern_crates)]
#![cfg_attr(
    feature = "cargo-clippy",
    warn(
        clippy::mut_mut,
        clippy::nonminimal_bool,
        clippy::print_stdout,
        clippy::unicode_not_nfc,
        clippy::use_self
    )
)]

mod binary;
mod constexpr;
mod cursor;
mod error;
mod lexer;
mod literals;
mod module;
mod script;
mod token;

pub use crate::binary::{load_binary_module, LoadError, LoadErrorKind};
pub use crate::constexpr::make_host_ref;
pub use crate::cursor::{CursorState, ParseState};
pub use crate::error::{Error, ParseAbort, TextFileLocus, UnresolvedError};
pub use crate::lexer::lex;
pub use crate::module::{parse_module_text, validate_module};
pub use crate::script::{
    parse_test_commands, Action, Command, ExpectedTrapType, GetAction, InvalidOrMalformed,
    InvokeAction, ModuleAction, NanAssertKind, QuotedModuleType,
};
pub use crate::token::{Token, TokenKind};

/// Version number of this crate.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
