//! The test-command grammar: module definitions, actions, and assertions.

use crate::binary::{load_binary_module, LoadErrorKind};
use crate::constexpr::parse_const_expression_tuple;
use crate::cursor::{CursorState, ParseState};
use crate::error::{Error, ParseAbort, ParseResult, TextFileLocus};
use crate::lexer::lex;
use crate::module::{parse_module_body, parse_module_text};
use crate::token::TokenKind;
use breakwater_types::{Features, ModuleIr};
use breakwater_vm::Value;

/// Where a quoted module came from.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum QuotedModuleType {
    /// Not a quoted module.
    None,
    /// `(module quote "...")` or verbatim text.
    Text,
    /// `(module binary "...")`.
    Binary,
}

/// The classification produced by parsing an `assert_invalid` or
/// `assert_malformed` module.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum InvalidOrMalformed {
    /// The module parsed and validated.
    WellFormedAndValid,
    /// The module parsed but failed validation.
    Invalid,
    /// The module did not parse or decode.
    Malformed,
}

/// The closed taxonomy of traps an `assert_trap` may expect.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum ExpectedTrapType {
    OutOfBoundsMemoryAccess,
    OutOfBoundsDataSegmentAccess,
    OutOfBoundsElemSegmentAccess,
    OutOfBounds,
    StackOverflow,
    IntegerDivideByZeroOrIntegerOverflow,
    InvalidFloatOperation,
    MisalignedAtomicMemoryAccess,
    ReachedUnreachable,
    IndirectCallSignatureMismatch,
    OutOfBoundsTableAccess,
    UninitializedTableElement,
    InvalidArgument,
}

// Maps the free-form expected-error strings test scripts carry onto the
// trap taxonomy. Order matters: the first matching rule wins.
fn expected_trap_type(message: &str) -> Option<ExpectedTrapType> {
    use ExpectedTrapType::*;
    Some(if message == "out of bounds memory access" {
        OutOfBoundsMemoryAccess
    } else if message.starts_with("out of bounds data segment access") {
        OutOfBoundsDataSegmentAccess
    } else if message.starts_with("out of bounds elem segment access") {
        OutOfBoundsElemSegmentAccess
    } else if message.starts_with("out of bounds") {
        OutOfBounds
    } else if message == "call stack exhausted" {
        StackOverflow
    } else if message == "integer overflow" || message == "integer divide by zero" {
        IntegerDivideByZeroOrIntegerOverflow
    } else if message == "invalid conversion to integer" {
        InvalidFloatOperation
    } else if message == "unaligned atomic" {
        MisalignedAtomicMemoryAccess
    } else if message.starts_with("unreachable") {
        ReachedUnreachable
    } else if message.starts_with("indirect call") {
        IndirectCallSignatureMismatch
    } else if message.starts_with("undefined") {
        OutOfBoundsTableAccess
    } else if message.starts_with("uninitialized") {
        UninitializedTableElement
    } else if message.starts_with("invalid argument")
        || message == "element segment dropped"
        || message == "data segment dropped"
    {
        InvalidArgument
    } else {
        return None;
    })
}

/// Which NaN pattern an `assert_return_*_nan*` command expects.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum NanAssertKind {
    /// Any arithmetic NaN.
    Arithmetic,
    /// The canonical NaN.
    Canonical,
    /// An arithmetic NaN in each f32x4 lane.
    ArithmeticF32x4,
    /// The canonical NaN in each f32x4 lane.
    CanonicalF32x4,
    /// An arithmetic NaN in each f64x2 lane.
    ArithmeticF64x2,
    /// The canonical NaN in each f64x2 lane.
    CanonicalF64x2,
}

/// `(get module? "export")`: read an exported global.
#[derive(Debug)]
pub struct GetAction {
    /// Where the action appears.
    pub locus: TextFileLocus,
    /// The internal name of the module acted on; empty for the last module.
    pub internal_module_name: String,
    /// The export read.
    pub export_name: String,
}

/// `(invoke module? "export" args*)`: call an exported function.
#[derive(Debug)]
pub struct InvokeAction {
    /// Where the action appears.
    pub locus: TextFileLocus,
    /// The internal name of the module acted on; empty for the last module.
    pub internal_module_name: String,
    /// The export called.
    pub export_name: String,
    /// The call arguments.
    pub arguments: Vec<Value>,
}

/// `(module ...)`: define (and implicitly instantiate) a module.
#[derive(Debug)]
pub struct ModuleAction {
    /// Where the action appears.
    pub locus: TextFileLocus,
    /// The module's internal `$name`, or empty.
    pub internal_module_name: String,
    /// The parsed module, when it parsed.
    pub module: Box<ModuleIr>,
}

/// An action: the executable part of a command.
#[derive(Debug)]
pub enum Action {
    /// A `get` action.
    Get(GetAction),
    /// An `invoke` action.
    Invoke(InvokeAction),
    /// A module definition.
    Module(ModuleAction),
}

impl Action {
    /// Where the action appears.
    pub fn locus(&self) -> TextFileLocus {
        match self {
            Self::Get(action) => action.locus,
            Self::Invoke(action) => action.locus,
            Self::Module(action) => action.locus,
        }
    }
}

/// One parsed test command.
#[derive(Debug)]
pub enum Command {
    /// A bare action.
    Action {
        /// Where the command appears.
        locus: TextFileLocus,
        /// The action to perform.
        action: Action,
    },
    /// `(register "name" $module?)`: make a module's exports importable.
    Register {
        /// Where the command appears.
        locus: TextFileLocus,
        /// The name the module is registered under.
        module_name: String,
        /// The internal name of the registered module; empty for the last.
        internal_name: String,
    },
    /// `(assert_return action results*)`.
    AssertReturn {
        /// Where the command appears.
        locus: TextFileLocus,
        /// The action to perform.
        action: Action,
        /// The expected results.
        expected_values: Vec<Value>,
    },
    /// The six `assert_return_*nan*` forms.
    AssertReturnNan {
        /// Where the command appears.
        locus: TextFileLocus,
        /// Which NaN pattern is expected.
        kind: NanAssertKind,
        /// The action to perform.
        action: Action,
    },
    /// `(assert_return_func action)`: the result must be a function.
    AssertReturnFunc {
        /// Where the command appears.
        locus: TextFileLocus,
        /// The action to perform.
        action: Action,
    },
    /// `(assert_trap action "message")` and `(assert_exhaustion ...)`.
    AssertTrap {
        /// Where the command appears.
        locus: TextFileLocus,
        /// The action to perform.
        action: Action,
        /// The trap the action must raise.
        expected_trap_type: ExpectedTrapType,
    },
    /// `(assert_throws action $exception "export" args*)`.
    AssertThrows {
        /// Where the command appears.
        locus: TextFileLocus,
        /// The action to perform.
        action: Action,
        /// The internal name of the module exporting the exception type.
        exception_type_internal_module_name: String,
        /// The export naming the exception type.
        exception_type_export_name: String,
        /// The expected exception arguments.
        expected_arguments: Vec<Value>,
    },
    /// `(assert_unlinkable (module ...) "message")`.
    ///
    /// The expected message is parsed and required, but not recorded: link
    /// errors are outside the trap taxonomy, so there is nothing sound to
    /// compare it against.
    AssertUnlinkable {
        /// Where the command appears.
        locus: TextFileLocus,
        /// The module that must fail to link.
        module_action: ModuleAction,
    },
    /// `(assert_invalid ...)` and `(assert_malformed ...)`.
    AssertInvalidOrMalformed {
        /// Where the command appears.
        locus: TextFileLocus,
        /// Which classification the script expects.
        expected: InvalidOrMalformed,
        /// Which classification the parse actually produced.
        actual: InvalidOrMalformed,
        /// Where the quoted module came from.
        quoted_module_type: QuotedModuleType,
        /// The quoted module text or binary bytes.
        quoted_module_bytes: Vec<u8>,
    },
    /// `(benchmark "name" (invoke ...))`.
    Benchmark {
        /// Where the command appears.
        locus: TextFileLocus,
        /// The benchmark's name.
        name: String,
        /// The invoke the benchmark repeats.
        invoke: InvokeAction,
    },
}

impl Command {
    /// Where the command appears.
    pub fn locus(&self) -> TextFileLocus {
        match self {
            Self::Action { locus, .. }
            | Self::Register { locus, .. }
            | Self::AssertReturn { locus, .. }
            | Self::AssertReturnNan { locus, .. }
            | Self::AssertReturnFunc { locus, .. }
            | Self::AssertTrap { locus, .. }
            | Self::AssertThrows { locus, .. }
            | Self::AssertUnlinkable { locus, .. }
            | Self::AssertInvalidOrMalformed { locus, .. }
            | Self::Benchmark { locus, .. } => *locus,
        }
    }
}

// Parses the interior of a `(module ...)` form: either a quoted/binary
// module or a textual body (whose verbatim source slice is captured).
fn parse_test_script_module(
    cursor: &mut CursorState<'_, '_>,
    features: &Features,
) -> ParseResult<(ModuleIr, String, QuotedModuleType, Vec<u8>)> {
    let internal_module_name = cursor.parse_optional_name_as_string();

    if matches!(
        cursor.next_token().kind,
        TokenKind::Quote | TokenKind::Binary
    ) {
        let quote_token = cursor.next_token();
        cursor.advance();

        let mut quoted_bytes = Vec::new();
        if !cursor.try_parse_string(&mut quoted_bytes) {
            cursor.error_at_next("expected string");
        } else {
            while cursor.try_parse_string(&mut quoted_bytes) {}
        }

        if quote_token.kind == TokenKind::Quote {
            // Parse the concatenated text as a module of its own, and
            // forward its errors to the quote token's offset.
            let module = match String::from_utf8(quoted_bytes.clone()) {
                Ok(text) => {
                    let (module, errors) = parse_module_text(&text, features);
                    for error in errors {
                        cursor
                            .parse_state
                            .error(quote_token.begin, error.message);
                    }
                    module
                }
                Err(_) => {
                    cursor
                        .parse_state
                        .error(quote_token.begin, "malformed UTF-8 encoding");
                    ModuleIr::new(features.clone())
                }
            };
            Ok((
                module,
                internal_module_name,
                QuotedModuleType::Text,
                quoted_bytes,
            ))
        } else {
            let module = match load_binary_module(&quoted_bytes, features) {
                Ok(module) => module,
                Err(error) => {
                    let message = match error.kind {
                        LoadErrorKind::Malformed => {
                            format!("error deserializing binary module: {}", error.message)
                        }
                        LoadErrorKind::Invalid => {
                            format!("validation error: {}", error.message)
                        }
                    };
                    cursor.parse_state.error(quote_token.begin, message);
                    ModuleIr::new(features.clone())
                }
            };
            Ok((
                module,
                internal_module_name,
                QuotedModuleType::Binary,
                quoted_bytes,
            ))
        }
    } else {
        let start_offset = cursor.next_token().begin;
        let mut module = ModuleIr::new(features.clone());
        parse_module_body(cursor, &mut module)?;
        let end_offset = cursor.next_token().begin;
        let quoted_text =
            cursor.parse_state.source[start_offset as usize..end_offset as usize].to_string();
        Ok((
            module,
            internal_module_name,
            QuotedModuleType::Text,
            quoted_text.into_bytes(),
        ))
    }
}

fn parse_action(cursor: &mut CursorState<'_, '_>, features: &Features) -> ParseResult<Action> {
    cursor.parse_parenthesized(|cursor| {
        let locus = cursor.parse_state.locus(cursor.next_token().begin);
        match cursor.next_token().kind {
            TokenKind::Get => {
                cursor.advance();
                let internal_module_name = cursor.parse_optional_name_as_string();
                let export_name = cursor.parse_utf8_string()?;
                Ok(Action::Get(GetAction {
                    locus,
                    internal_module_name,
                    export_name,
                }))
            }
            TokenKind::Invoke => {
                cursor.advance();
                let internal_module_name = cursor.parse_optional_name_as_string();
                let export_name = cursor.parse_utf8_string()?;
                let arguments = parse_const_expression_tuple(cursor)?;
                Ok(Action::Invoke(InvokeAction {
                    locus,
                    internal_module_name,
                    export_name,
                    arguments,
                }))
            }
            TokenKind::Module => {
                cursor.advance();
                let (module, internal_module_name, _, _) =
                    parse_test_script_module(cursor, features)?;
                Ok(Action::Module(ModuleAction {
                    locus,
                    internal_module_name,
                    module: Box::new(module),
                }))
            }
            _ => {
                cursor.error_at_next("expected 'get' or 'invoke'");
                Err(ParseAbort::Recover)
            }
        }
    })
}

fn parse_invoke_action(
    cursor: &mut CursorState<'_, '_>,
    features: &Features,
) -> ParseResult<InvokeAction> {
    match parse_action(cursor, features)? {
        Action::Invoke(invoke) => Ok(invoke),
        _ => Err(ParseAbort::Recover),
    }
}

fn parse_command(cursor: &mut CursorState<'_, '_>, features: &Features) -> ParseResult<Command> {
    if cursor.next_token().kind == TokenKind::LeftParenthesis
        && matches!(
            cursor.peek(1).kind,
            TokenKind::Module | TokenKind::Invoke | TokenKind::Get
        )
    {
        let action = parse_action(cursor, features)?;
        let locus = action.locus();
        return Ok(Command::Action { locus, action });
    }

    cursor.parse_parenthesized(|cursor| {
        let locus = cursor.parse_state.locus(cursor.next_token().begin);
        match cursor.next_token().kind {
            TokenKind::Register => {
                cursor.advance();
                let module_name = cursor.parse_utf8_string()?;
                let internal_name = cursor.parse_optional_name_as_string();
                Ok(Command::Register {
                    locus,
                    module_name,
                    internal_name,
                })
            }
            TokenKind::AssertReturn => {
                cursor.advance();
                let action = parse_action(cursor, features)?;
                let expected_values = parse_const_expression_tuple(cursor)?;
                Ok(Command::AssertReturn {
                    locus,
                    action,
                    expected_values,
                })
            }
            kind @ (TokenKind::AssertReturnArithmeticNan
            | TokenKind::AssertReturnCanonicalNan
            | TokenKind::AssertReturnArithmeticNanF32x4
            | TokenKind::AssertReturnCanonicalNanF32x4
            | TokenKind::AssertReturnArithmeticNanF64x2
            | TokenKind::AssertReturnCanonicalNanF64x2) => {
                let nan_kind = match kind {
                    TokenKind::AssertReturnArithmeticNan => NanAssertKind::Arithmetic,
                    TokenKind::AssertReturnCanonicalNan => NanAssertKind::Canonical,
                    TokenKind::AssertReturnArithmeticNanF32x4 => NanAssertKind::ArithmeticF32x4,
                    TokenKind::AssertReturnCanonicalNanF32x4 => NanAssertKind::CanonicalF32x4,
                    TokenKind::AssertReturnArithmeticNanF64x2 => NanAssertKind::ArithmeticF64x2,
                    _ => NanAssertKind::CanonicalF64x2,
                };
                cursor.advance();
                let action = parse_action(cursor, features)?;
                Ok(Command::AssertReturnNan {
                    locus,
                    kind: nan_kind,
                    action,
                })
            }
            TokenKind::AssertReturnFunc => {
                cursor.advance();
                let action = parse_action(cursor, features)?;
                Ok(Command::AssertReturnFunc { locus, action })
            }
            TokenKind::AssertTrap | TokenKind::AssertExhaustion => {
                cursor.advance();
                let action = parse_action(cursor, features)?;

                let error_token = cursor.next_token();
                let mut message_bytes = Vec::new();
                if !cursor.try_parse_string(&mut message_bytes) {
                    cursor.error_at_next("expected string literal");
                    return Err(ParseAbort::Recover);
                }
                let message = String::from_utf8_lossy(&message_bytes);
                let Some(expected_trap_type) = expected_trap_type(&message) else {
                    cursor
                        .parse_state
                        .error(error_token.begin, "unrecognized trap type");
                    return Err(ParseAbort::Recover);
                };
                Ok(Command::AssertTrap {
                    locus,
                    action,
                    expected_trap_type,
                })
            }
            TokenKind::AssertThrows => {
                cursor.advance();
                let action = parse_action(cursor, features)?;
                let exception_type_internal_module_name = cursor.parse_optional_name_as_string();
                let exception_type_export_name = cursor.parse_utf8_string()?;
                let expected_arguments = parse_const_expression_tuple(cursor)?;
                Ok(Command::AssertThrows {
                    locus,
                    action,
                    exception_type_internal_module_name,
                    exception_type_export_name,
                    expected_arguments,
                })
            }
            TokenKind::AssertUnlinkable => {
                cursor.advance();
                if cursor.next_token().kind != TokenKind::LeftParenthesis
                    || cursor.peek(1).kind != TokenKind::Module
                {
                    cursor.error_at_next("expected module");
                    return Err(ParseAbort::Recover);
                }
                let module_action = match parse_action(cursor, features)? {
                    Action::Module(module_action) => module_action,
                    _ => return Err(ParseAbort::Recover),
                };

                // The expected error message is required but deliberately
                // not recorded on the command.
                let mut expected_error = Vec::new();
                if !cursor.try_parse_string(&mut expected_error) {
                    cursor.error_at_next("expected string literal");
                    return Err(ParseAbort::Recover);
                }

                Ok(Command::AssertUnlinkable {
                    locus,
                    module_action,
                })
            }
            kind @ (TokenKind::AssertInvalid | TokenKind::AssertMalformed) => {
                let expected = if kind == TokenKind::AssertInvalid {
                    InvalidOrMalformed::Invalid
                } else {
                    InvalidOrMalformed::Malformed
                };
                cursor.advance();

                // Parse the module into a scoped parse state so its errors
                // classify the module without leaking to the caller. The
                // outer state is restored on every path.
                let scoped_state = cursor.parse_state.scoped();
                let outer_state = std::mem::replace(&mut cursor.parse_state, scoped_state);
                let module_result = cursor.parse_parenthesized(|cursor| {
                    cursor.require(TokenKind::Module)?;
                    parse_test_script_module(cursor, features)
                });
                let scoped_state = std::mem::replace(&mut cursor.parse_state, outer_state);

                let (quoted_module_type, quoted_module_bytes) = match module_result {
                    Ok((_, _, quoted_module_type, quoted_module_bytes)) => {
                        (quoted_module_type, quoted_module_bytes)
                    }
                    Err(abort) => return Err(abort),
                };

                let mut expected_error = Vec::new();
                if !cursor.try_parse_string(&mut expected_error) {
                    cursor.error_at_next("expected string literal");
                    return Err(ParseAbort::Recover);
                }

                // If there are any syntax errors, the module is malformed.
                // If there are only validation errors, it is invalid.
                let mut actual = InvalidOrMalformed::WellFormedAndValid;
                for error in &scoped_state.unresolved_errors {
                    if error.message.starts_with("validation error") {
                        actual = InvalidOrMalformed::Invalid;
                    } else {
                        actual = InvalidOrMalformed::Malformed;
                        break;
                    }
                }

                Ok(Command::AssertInvalidOrMalformed {
                    locus,
                    expected,
                    actual,
                    quoted_module_type,
                    quoted_module_bytes,
                })
            }
            TokenKind::Benchmark => {
                cursor.advance();

                let mut name_bytes = Vec::new();
                if !cursor.try_parse_string(&mut name_bytes) {
                    cursor.error_at_next("expected benchmark name string");
                    return Err(ParseAbort::Recover);
                }
                let name = String::from_utf8_lossy(&name_bytes).into_owned();

                if cursor.next_token().kind != TokenKind::LeftParenthesis
                    || cursor.peek(1).kind != TokenKind::Invoke
                {
                    cursor.error_at_next("expected invoke");
                    return Err(ParseAbort::Recover);
                }
                let invoke = parse_invoke_action(cursor, features)?;
                Ok(Command::Benchmark {
                    locus,
                    name,
                    invoke,
                })
            }
            _ => {
                cursor.error_at_next("unknown script command");
                Err(ParseAbort::Recover)
            }
        }
    })
}

/// Parse a test script: either an inline module (a bare module body) or a
/// sequence of commands. Errors are resolved to loci and returned alongside
/// the commands that did parse.
pub fn parse_test_commands(source: &str, features: &Features) -> (Vec<Command>, Vec<Error>) {
    let mut parse_state = ParseState::new(source);
    let tokens = lex(source, &mut parse_state);
    let mut cursor = CursorState::new(&tokens, parse_state);
    let mut commands = Vec::new();

    // Support test scripts that are just an inline module.
    if cursor.next_token().kind == TokenKind::LeftParenthesis
        && cursor.peek(1).kind.is_module_body_start()
    {
        let locus = cursor.parse_state.locus(cursor.next_token().begin);
        let mut module = ModuleIr::new(features.clone());
        let result = parse_module_body(&mut cursor, &mut module);
        if result.is_ok() {
            if cursor.next_token().kind != TokenKind::Eof {
                cursor.error_at_next("expected the end of the input");
            }
            commands.push(Command::Action {
                locus,
                action: Action::Module(ModuleAction {
                    locus,
                    internal_module_name: String::new(),
                    module: Box::new(module),
                }),
            });
        }
    } else {
        // (command)* <eof>
        loop {
            match cursor.next_token().kind {
                TokenKind::Eof => break,
                TokenKind::LeftParenthesis => match parse_command(&mut cursor, features) {
                    Ok(command) => commands.push(command),
                    // The cursor is already past the broken command's
                    // closing parenthesis: resume at the next one.
                    Err(ParseAbort::Recover) => continue,
                    Err(ParseAbort::Fatal) => break,
                },
                _ => {
                    cursor.error_at_next("expected the start of a command");
                    break;
                }
            }
        }
    }

    let unresolved = std::mem::take(&mut cursor.parse_state.unresolved_errors);
    let errors = unresolved
        .into_iter()
        .map(|unresolved| Error {
            locus: cursor.parse_state.locus(unresolved.offset),
            message: unresolved.message,
        })
        .collect();
    (commands, errors)
}
