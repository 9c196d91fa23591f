//! Numeric literal parsing: integers (decimal and hex, with `_`
//! separators), floats (decimal, hex, infinities and NaN payloads), and
//! `v128` lane lists.

use crate::cursor::CursorState;
use crate::error::{ParseAbort, ParseResult};
use crate::token::TokenKind;

fn without_separators(text: &str) -> String {
    text.chars().filter(|c| *c != '_').collect()
}

fn parse_unsigned_text(text: &str) -> Option<u64> {
    if let Some(hex) = text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16).ok()
    } else {
        text.parse().ok()
    }
}

// Wasm integer literals are sign-agnostic: an N-bit literal may be written
// as any value in [-2^(N-1), 2^N).
fn parse_int_text(text: &str, bits: u32) -> Option<u64> {
    let text = without_separators(text);
    let (negative, unsigned_text) = match text.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, text.strip_prefix('+').unwrap_or(&text)),
    };
    let magnitude = parse_unsigned_text(unsigned_text)?;
    let unsigned_max = if bits == 64 { u64::MAX } else { (1 << bits) - 1 };
    if negative {
        let signed_min_magnitude = 1u64 << (bits - 1);
        if magnitude > signed_min_magnitude {
            return None;
        }
        Some(magnitude.wrapping_neg() & unsigned_max)
    } else {
        (magnitude <= unsigned_max).then_some(magnitude)
    }
}

fn next_int_text<'s>(cursor: &mut CursorState<'_, 's>) -> ParseResult<(&'s str, u32)> {
    if cursor.next_token().kind != TokenKind::Int {
        cursor.error_at_next("expected an integer literal");
        return Err(ParseAbort::Recover);
    }
    let text = cursor.next_text();
    let offset = cursor.next_token().begin;
    cursor.advance();
    Ok((text, offset))
}

/// Parse an i32 literal.
pub(crate) fn parse_i32(cursor: &mut CursorState<'_, '_>) -> ParseResult<i32> {
    let (text, offset) = next_int_text(cursor)?;
    match parse_int_text(text, 32) {
        Some(bits) => Ok(bits as u32 as i32),
        None => {
            cursor.parse_state.error(offset, "invalid i32 literal".to_string());
            Err(ParseAbort::Recover)
        }
    }
}

/// Parse an i64 literal.
pub(crate) fn parse_i64(cursor: &mut CursorState<'_, '_>) -> ParseResult<i64> {
    let (text, offset) = next_int_text(cursor)?;
    match parse_int_text(text, 64) {
        Some(bits) => Ok(bits as i64),
        None => {
            cursor.parse_state.error(offset, "invalid i64 literal".to_string());
            Err(ParseAbort::Recover)
        }
    }
}

/// Parse a non-negative u32 literal.
pub(crate) fn parse_u32(cursor: &mut CursorState<'_, '_>) -> ParseResult<u32> {
    let (text, offset) = next_int_text(cursor)?;
    let value = without_separators(text);
    match parse_unsigned_text(&value).filter(|v| *v <= u32::MAX as u64) {
        Some(value) => Ok(value as u32),
        None => {
            cursor
                .parse_state
                .error(offset, "expected an unsigned 32-bit integer".to_string());
            Err(ParseAbort::Recover)
        }
    }
}

// A hex float: 0xH.HHHp±E with a binary exponent. Parsed by accumulating
// the mantissa exactly and scaling by the binary exponent.
fn parse_hex_float(unsigned: &str) -> Option<f64> {
    let digits = unsigned
        .strip_prefix("0x")
        .or_else(|| unsigned.strip_prefix("0X"))?;
    let (mantissa_text, exponent) = match digits.split_once(['p', 'P']) {
        Some((mantissa, exponent)) => (mantissa, exponent.parse::<i32>().ok()?),
        None => (digits, 0),
    };
    let (integer_text, fraction_text) = match mantissa_text.split_once('.') {
        Some((integer, fraction)) => (integer, fraction),
        None => (mantissa_text, ""),
    };
    if integer_text.is_empty() && fraction_text.is_empty() {
        return None;
    }

    let mut mantissa = 0f64;
    for digit in integer_text.chars() {
        mantissa = mantissa * 16.0 + digit.to_digit(16)? as f64;
    }
    let mut scale = 1.0f64 / 16.0;
    for digit in fraction_text.chars() {
        mantissa += digit.to_digit(16)? as f64 * scale;
        scale /= 16.0;
    }
    Some(mantissa * 2f64.powi(exponent))
}

fn f64_nan_with_payload(negative: bool, payload: u64) -> f64 {
    let sign = if negative { 1u64 << 63 } else { 0 };
    f64::from_bits(sign | 0x7ff0_0000_0000_0000 | (payload & 0x000f_ffff_ffff_ffff))
}

fn f32_nan_with_payload(negative: bool, payload: u32) -> f32 {
    let sign = if negative { 1u32 << 31 } else { 0 };
    f32::from_bits(sign | 0x7f80_0000 | (payload & 0x007f_ffff))
}

fn parse_f64_text(text: &str) -> Option<f64> {
    let text = without_separators(text);
    let (negative, unsigned) = match text.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, text.strip_prefix('+').unwrap_or(text.as_str())),
    };
    let magnitude = if unsigned == "inf" {
        f64::INFINITY
    } else if unsigned == "nan" || unsigned == "nan:canonical" || unsigned == "nan:arithmetic" {
        return Some(f64_nan_with_payload(negative, 1 << 51));
    } else if let Some(payload_text) = unsigned.strip_prefix("nan:0x") {
        let payload = u64::from_str_radix(payload_text, 16).ok()?;
        if payload == 0 || payload >= 1 << 52 {
            return None;
        }
        return Some(f64_nan_with_payload(negative, payload));
    } else if unsigned.starts_with("0x") || unsigned.starts_with("0X") {
        parse_hex_float(unsigned)?
    } else {
        unsigned.parse::<f64>().ok()?
    };
    Some(if negative { -magnitude } else { magnitude })
}

fn parse_f32_text(text: &str) -> Option<f32> {
    let text = without_separators(text);
    let (negative, unsigned) = match text.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, text.strip_prefix('+').unwrap_or(text.as_str())),
    };
    if unsigned == "nan" || unsigned == "nan:canonical" || unsigned == "nan:arithmetic" {
        return Some(f32_nan_with_payload(negative, 1 << 22));
    }
    if let Some(payload_text) = unsigned.strip_prefix("nan:0x") {
        let payload = u32::from_str_radix(payload_text, 16).ok()?;
        if payload == 0 || payload >= 1 << 23 {
            return None;
        }
        return Some(f32_nan_with_payload(negative, payload));
    }
    parse_f64_text(&text).map(|value| value as f32)
}

fn next_float_text<'s>(cursor: &mut CursorState<'_, 's>) -> ParseResult<(&'s str, u32)> {
    if !matches!(cursor.next_token().kind, TokenKind::Int | TokenKind::Float) {
        cursor.error_at_next("expected a float literal");
        return Err(ParseAbort::Recover);
    }
    let text = cursor.next_text();
    let offset = cursor.next_token().begin;
    cursor.advance();
    Ok((text, offset))
}

/// Parse an f32 literal.
pub(crate) fn parse_f32(cursor: &mut CursorState<'_, '_>) -> ParseResult<f32> {
    let (text, offset) = next_float_text(cursor)?;
    match parse_f32_text(text) {
        Some(value) => Ok(value),
        None => {
            cursor.parse_state.error(offset, "invalid f32 literal".to_string());
            Err(ParseAbort::Recover)
        }
    }
}

/// Parse an f64 literal.
pub(crate) fn parse_f64(cursor: &mut CursorState<'_, '_>) -> ParseResult<f64> {
    let (text, offset) = next_float_text(cursor)?;
    match parse_f64_text(text) {
        Some(value) => Ok(value),
        None => {
            cursor.parse_state.error(offset, "invalid f64 literal".to_string());
            Err(ParseAbort::Recover)
        }
    }
}

/// Parse a `v128.const` payload: a lane-shape word followed by that many
/// lane literals.
pub(crate) fn parse_v128(cursor: &mut CursorState<'_, '_>) -> ParseResult<u128> {
    let shape = cursor.next_text();
    let shape_offset = cursor.next_token().begin;
    match shape {
        "i8x16" => {
            cursor.advance();
            let mut bits = 0u128;
            for lane in 0..16 {
                let value = parse_lane_int(cursor, 8)? as u128;
                bits |= value << (lane * 8);
            }
            Ok(bits)
        }
        "i16x8" => {
            cursor.advance();
            let mut bits = 0u128;
            for lane in 0..8 {
                let value = parse_lane_int(cursor, 16)? as u128;
                bits |= value << (lane * 16);
            }
            Ok(bits)
        }
        "i32x4" => {
            cursor.advance();
            let mut bits = 0u128;
            for lane in 0..4 {
                let value = parse_i32(cursor)? as u32 as u128;
                bits |= value << (lane * 32);
            }
            Ok(bits)
        }
        "i64x2" => {
            cursor.advance();
            let mut bits = 0u128;
            for lane in 0..2 {
                let value = parse_i64(cursor)? as u64 as u128;
                bits |= value << (lane * 64);
            }
            Ok(bits)
        }
        "f32x4" => {
            cursor.advance();
            let mut bits = 0u128;
            for lane in 0..4 {
                let value = parse_f32(cursor)?.to_bits() as u128;
                bits |= value << (lane * 32);
            }
            Ok(bits)
        }
        "f64x2" => {
            cursor.advance();
            let mut bits = 0u128;
            for lane in 0..2 {
                let value = parse_f64(cursor)?.to_bits() as u128;
                bits |= value << (lane * 64);
            }
            Ok(bits)
        }
        _ => {
            cursor
                .parse_state
                .error(shape_offset, "expected a v128 lane interpretation");
            Err(ParseAbort::Recover)
        }
    }
}

fn parse_lane_int(cursor: &mut CursorState<'_, '_>, bits: u32) -> ParseResult<u64> {
    let (text, offset) = next_int_text(cursor)?;
    match parse_int_text(text, bits) {
        Some(value) => Ok(value),
        None => {
            cursor
                .parse_state
                .error(offset, format!("invalid i{bits} lane literal"));
            Err(ParseAbort::Recover)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn int_ranges_are_sign_agnostic() {
        assert_eq!(parse_int_text("4294967295", 32), Some(0xffff_ffff));
        assert_eq!(parse_int_text("-2147483648", 32), Some(0x8000_0000));
        assert_eq!(parse_int_text("-2147483649", 32), None);
        assert_eq!(parse_int_text("4294967296", 32), None);
        assert_eq!(parse_int_text("0xff_ff", 32), Some(0xffff));
        assert_eq!(parse_int_text("-1", 64), Some(u64::MAX));
    }

    #[test]
    fn hex_floats() {
        assert_eq!(parse_f64_text("0x1p3"), Some(8.0));
        assert_eq!(parse_f64_text("0x1.8p1"), Some(3.0));
        assert_eq!(parse_f64_text("-0x1p-1"), Some(-0.5));
        assert_eq!(parse_f32_text("0x1.8p1"), Some(3.0f32));
    }

    #[test]
    fn nan_payloads() {
        assert_eq!(
            parse_f32_text("nan").map(f32::to_bits),
            Some(0x7fc0_0000)
        );
        assert_eq!(
            parse_f32_text("-nan:0x200000").map(f32::to_bits),
            Some(0xffa0_0000)
        );
        assert_eq!(
            parse_f64_text("nan:0x4").map(f64::to_bits),
            Some(0x7ff0_0000_0000_0004)
        );
        assert_eq!(parse_f32_text("nan:0x800000"), None);
    }

    #[test]
    fn infinities() {
        assert_eq!(parse_f64_text("inf"), Some(f64::INFINITY));
        assert_eq!(parse_f64_text("-inf"), Some(f64::NEG_INFINITY));
    }
}
