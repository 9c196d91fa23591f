//! Parse state and the token cursor the recursive-descent parser walks.

use crate::error::{calc_locus_from_offset, ParseAbort, ParseResult, TextFileLocus, UnresolvedError};
use crate::lexer::atom_text;
use crate::token::{Token, TokenKind};

/// The state shared by every parse function: the source, the line-start
/// table, and the errors recorded so far (resolved to loci only after
/// parsing completes).
#[derive(Debug)]
pub struct ParseState<'s> {
    /// The source text being parsed.
    pub source: &'s str,
    /// Byte offsets of line starts, filled by the lexer.
    pub line_info: Vec<u32>,
    /// Errors recorded at byte offsets.
    pub unresolved_errors: Vec<UnresolvedError>,
}

impl<'s> ParseState<'s> {
    /// A fresh parse state over `source`.
    pub fn new(source: &'s str) -> Self {
        Self {
            source,
            line_info: vec![0],
            unresolved_errors: Vec::new(),
        }
    }

    /// A scoped parse state sharing this state's source and line table but
    /// collecting its own errors, for parses whose errors must not leak to
    /// the caller.
    pub fn scoped(&self) -> Self {
        Self {
            source: self.source,
            line_info: self.line_info.clone(),
            unresolved_errors: Vec::new(),
        }
    }

    /// Record an error at `offset`.
    pub fn error(&mut self, offset: u32, message: impl Into<String>) {
        self.unresolved_errors.push(UnresolvedError {
            offset,
            message: message.into(),
        });
    }

    /// Resolve an offset to a locus.
    pub fn locus(&self, offset: u32) -> TextFileLocus {
        calc_locus_from_offset(&self.line_info, offset)
    }
}

/// A position in the token stream plus the parse state errors are recorded
/// into.
pub struct CursorState<'a, 's> {
    tokens: &'a [Token],
    next: usize,
    /// The parse state; swapped out for a scoped state while parsing
    /// `assert_invalid`/`assert_malformed` modules.
    pub parse_state: ParseState<'s>,
}

impl<'a, 's> CursorState<'a, 's> {
    /// A cursor at the start of `tokens`.
    pub fn new(tokens: &'a [Token], parse_state: ParseState<'s>) -> Self {
        debug_assert!(matches!(
            tokens.last(),
            Some(Token {
                kind: TokenKind::Eof,
                ..
            })
        ));
        Self {
            tokens,
            next: 0,
            parse_state,
        }
    }

    /// The next token. The stream is Eof-terminated, so this never runs off
    /// the end.
    pub fn next_token(&self) -> Token {
        self.peek(0)
    }

    /// Look `ahead` tokens past the next one.
    pub fn peek(&self, ahead: usize) -> Token {
        let index = (self.next + ahead).min(self.tokens.len() - 1);
        self.tokens[index]
    }

    /// Consume the next token.
    pub fn advance(&mut self) -> Token {
        let token = self.next_token();
        if self.next + 1 < self.tokens.len() {
            self.next += 1;
        }
        token
    }

    /// The text of the atom the next token begins.
    pub fn next_text(&self) -> &'s str {
        atom_text(self.parse_state.source, self.next_token().begin)
    }

    /// Record an error at the next token.
    pub fn error_at_next(&mut self, message: impl Into<String>) {
        let offset = self.next_token().begin;
        self.parse_state.error(offset, message);
    }

    /// Consume a token of `kind`, or record an error and unwind to the next
    /// command.
    pub fn require(&mut self, kind: TokenKind) -> ParseResult<Token> {
        if self.next_token().kind == kind {
            Ok(self.advance())
        } else {
            self.error_at_next(format!("expected {}", kind.describe()));
            Err(ParseAbort::Recover)
        }
    }

    /// Skip forward past the `)` matching an already-consumed `(`.
    pub fn find_closing_parenthesis(&mut self) -> ParseResult<()> {
        let mut depth = 1u32;
        loop {
            match self.next_token().kind {
                TokenKind::Eof => {
                    self.error_at_next("unexpected end of input");
                    return Err(ParseAbort::Fatal);
                }
                TokenKind::LeftParenthesis => {
                    depth += 1;
                    self.advance();
                }
                TokenKind::RightParenthesis => {
                    depth -= 1;
                    self.advance();
                    if depth == 0 {
                        return Ok(());
                    }
                }
                _ => {
                    self.advance();
                }
            }
        }
    }

    /// Parse a parenthesized form: `(`, the body, `)`.
    ///
    /// If the body unwinds recoverably, the cursor is advanced past the
    /// matching `)` before the error propagates, so the caller resumes at a
    /// command boundary.
    pub fn parse_parenthesized<T>(
        &mut self,
        body: impl FnOnce(&mut Self) -> ParseResult<T>,
    ) -> ParseResult<T> {
        self.require(TokenKind::LeftParenthesis)?;
        match body(self) {
            Ok(value) => {
                self.require(TokenKind::RightParenthesis)?;
                Ok(value)
            }
            Err(ParseAbort::Recover) => {
                self.find_closing_parenthesis()?;
                Err(ParseAbort::Recover)
            }
            Err(ParseAbort::Fatal) => Err(ParseAbort::Fatal),
        }
    }

    /// Parse an optional `$name`, returning its text without the sigil.
    pub fn try_parse_name(&mut self) -> Option<String> {
        if self.next_token().kind == TokenKind::Name {
            let text = self.next_text();
            self.advance();
            Some(text[1..].to_string())
        } else {
            None
        }
    }

    /// Parse an optional name; the empty string means "no name".
    pub fn parse_optional_name_as_string(&mut self) -> String {
        self.try_parse_name().unwrap_or_default()
    }

    /// Try to parse one string literal, appending its decoded bytes to
    /// `out`. Returns false (consuming nothing) if the next token is not a
    /// string.
    pub fn try_parse_string(&mut self, out: &mut Vec<u8>) -> bool {
        if self.next_token().kind != TokenKind::String {
            return false;
        }
        let begin = self.next_token().begin;
        self.decode_string(begin, out);
        self.advance();
        true
    }

    /// Parse a required string literal that must be valid UTF-8.
    pub fn parse_utf8_string(&mut self) -> ParseResult<String> {
        let mut bytes = Vec::new();
        if !self.try_parse_string(&mut bytes) {
            self.error_at_next("expected string literal");
            return Err(ParseAbort::Recover);
        }
        match String::from_utf8(bytes) {
            Ok(string) => Ok(string),
            Err(_) => {
                self.error_at_next("malformed UTF-8 encoding");
                Err(ParseAbort::Recover)
            }
        }
    }

    // Decodes the escapes of the string literal starting at `begin` (which
    // the lexer already verified is terminated).
    fn decode_string(&mut self, begin: u32, out: &mut Vec<u8>) {
        let source: &'s str = self.parse_state.source;
        let bytes = source.as_bytes();
        let mut offset = begin as usize + 1;
        loop {
            match bytes[offset] {
                b'"' => return,
                b'\\' => {
                    offset += 1;
                    match bytes[offset] {
                        b'n' => out.push(b'\n'),
                        b't' => out.push(b'\t'),
                        b'r' => out.push(b'\r'),
                        b'\\' => out.push(b'\\'),
                        b'\'' => out.push(b'\''),
                        b'"' => out.push(b'"'),
                        b'u' => {
                            // \u{XXXX}
                            let close = bytes[offset..]
                                .iter()
                                .position(|b| *b == b'}')
                                .map(|i| offset + i);
                            let mut ok = false;
                            if bytes.get(offset + 1) == Some(&b'{') {
                                if let Some(close) = close {
                                    let digits = &source[offset + 2..close];
                                    if let Ok(code) = u32::from_str_radix(digits, 16) {
                                        if let Some(c) = char::from_u32(code) {
                                            let mut buffer = [0u8; 4];
                                            out.extend_from_slice(
                                                c.encode_utf8(&mut buffer).as_bytes(),
                                            );
                                            offset = close;
                                            ok = true;
                                        }
                                    }
                                }
                            }
                            if !ok {
                                self.parse_state
                                    .error(offset as u32, "invalid unicode escape");
                            }
                        }
                        high => {
                            // Two hex digits: a raw byte.
                            let low = bytes[offset + 1];
                            let hex = [high, low];
                            let hex = std::str::from_utf8(&hex).unwrap_or("");
                            match u8::from_str_radix(hex, 16) {
                                Ok(byte) => {
                                    out.push(byte);
                                    offset += 1;
                                }
                                Err(_) => {
                                    self.parse_state
                                        .error(offset as u32, "invalid string escape");
                                }
                            }
                        }
                    }
                    offset += 1;
                }
                byte => {
                    out.push(byte);
                    offset += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lexer::lex;

    fn cursor<'a, 's>(source: &'s str, tokens: &'a mut Vec<Token>) -> CursorState<'a, 's> {
        let mut parse_state = ParseState::new(source);
        *tokens = lex(source, &mut parse_state);
        CursorState::new(tokens, parse_state)
    }

    #[test]
    fn string_escapes_decode() {
        let source = r#""a\n\t\\\"\00\ff\u{41}""#;
        let mut tokens = Vec::new();
        let mut cursor = cursor(source, &mut tokens);
        let mut bytes = Vec::new();
        assert!(cursor.try_parse_string(&mut bytes));
        assert_eq!(bytes, b"a\n\t\\\"\x00\xffA");
    }

    #[test]
    fn require_records_an_error_and_recovers() {
        let source = ") x";
        let mut tokens = Vec::new();
        let mut cursor = cursor(source, &mut tokens);
        assert_eq!(
            cursor.require(TokenKind::LeftParenthesis),
            Err(ParseAbort::Recover)
        );
        assert_eq!(cursor.parse_state.unresolved_errors.len(), 1);
    }

    #[test]
    fn find_closing_parenthesis_balances() {
        let source = "(a (b c) d) tail";
        let mut tokens = Vec::new();
        let mut cursor = cursor(source, &mut tokens);
        cursor.advance(); // consume '('
        cursor.find_closing_parenthesis().unwrap();
        assert_eq!(cursor.next_text(), "tail");
    }

    #[test]
    fn eof_during_recovery_is_fatal() {
        let source = "(a (b";
        let mut tokens = Vec::new();
        let mut cursor = cursor(source, &mut tokens);
        cursor.advance();
        assert_eq!(cursor.find_closing_parenthesis(), Err(ParseAbort::Fatal));
    }
}
