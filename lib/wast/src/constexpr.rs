//! Parsing of typed constant expressions, used for action arguments and
//! expected results.

use crate::cursor::CursorState;
use crate::error::{ParseAbort, ParseResult};
use crate::literals::{parse_f32, parse_f64, parse_i32, parse_i64, parse_u32, parse_v128};
use crate::token::TokenKind;
use breakwater_vm::{Function, FunctionRef, Value};
use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

// Host references are interned process-wide so that `ref.host N` denotes
// the same function identity wherever it appears.
static HOST_REFS: Lazy<Mutex<HashMap<u32, Arc<Function>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

/// The function interned for `ref.host index`. Calls with equal indices
/// return the same function.
pub fn make_host_ref(index: u32) -> Arc<Function> {
    let mut host_refs = HOST_REFS.lock().unwrap();
    host_refs
        .entry(index)
        .or_insert_with(|| Function::new_unowned(format!("test!ref.host!{index}")))
        .clone()
}

/// Parse one `(tag value)` constant expression.
pub(crate) fn parse_const_expression(cursor: &mut CursorState<'_, '_>) -> ParseResult<Value> {
    cursor.parse_parenthesized(|cursor| match cursor.next_token().kind {
        TokenKind::I32Const => {
            cursor.advance();
            Ok(Value::I32(parse_i32(cursor)?))
        }
        TokenKind::I64Const => {
            cursor.advance();
            Ok(Value::I64(parse_i64(cursor)?))
        }
        TokenKind::F32Const => {
            cursor.advance();
            Ok(Value::F32(parse_f32(cursor)?))
        }
        TokenKind::F64Const => {
            cursor.advance();
            Ok(Value::F64(parse_f64(cursor)?))
        }
        TokenKind::V128Const => {
            cursor.advance();
            Ok(Value::V128(parse_v128(cursor)?))
        }
        TokenKind::RefHost => {
            cursor.advance();
            let index = parse_u32(cursor)?;
            Ok(Value::FuncRef(FunctionRef(make_host_ref(index))))
        }
        TokenKind::RefNull => {
            cursor.advance();
            Ok(Value::NullRef)
        }
        _ => {
            cursor.error_at_next("expected const expression");
            Err(ParseAbort::Recover)
        }
    })
}

/// Parse `(constexpr)*`, terminated by any token that is not a `(`.
pub(crate) fn parse_const_expression_tuple(
    cursor: &mut CursorState<'_, '_>,
) -> ParseResult<Vec<Value>> {
    let mut values = Vec::new();
    while cursor.next_token().kind == TokenKind::LeftParenthesis {
        values.push(parse_const_expression(cursor)?);
    }
    Ok(values)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_refs_intern_by_index() {
        let a = make_host_ref(1000);
        let b = make_host_ref(1000);
        let c = make_host_ref(1001);
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(a.debug_name(), "test!ref.host!1000");
        assert_eq!(a.instance_id(), breakwater_vm::INVALID_ID);
    }
}
