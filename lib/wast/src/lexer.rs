//! The scanner producing the token stream and line-start table.

use crate::cursor::ParseState;
use crate::error::UnresolvedError;
use crate::token::{Token, TokenKind};

fn is_delimiter(byte: u8) -> bool {
    matches!(byte, b' ' | b'\t' | b'\r' | b'\n' | b'(' | b')' | b'"' | b';')
}

/// The characters of an atom starting at `begin`.
pub(crate) fn atom_text(source: &str, begin: u32) -> &str {
    let bytes = source.as_bytes();
    let begin = begin as usize;
    let mut end = begin;
    while end < bytes.len() && !is_delimiter(bytes[end]) {
        end += 1;
    }
    &source[begin..end]
}

fn looks_numeric(text: &str) -> bool {
    let unsigned = text
        .strip_prefix('+')
        .or_else(|| text.strip_prefix('-'))
        .unwrap_or(text);
    unsigned.starts_with(|c: char| c.is_ascii_digit())
        || unsigned.starts_with("inf")
        || unsigned.starts_with("nan")
}

fn classify_numeric(text: &str) -> TokenKind {
    let unsigned = text
        .strip_prefix('+')
        .or_else(|| text.strip_prefix('-'))
        .unwrap_or(text);
    if unsigned.starts_with("inf") || unsigned.starts_with("nan") {
        return TokenKind::Float;
    }
    let is_hex = unsigned.starts_with("0x") || unsigned.starts_with("0X");
    let has_point = unsigned.contains('.');
    let has_exponent = if is_hex {
        unsigned.contains('p') || unsigned.contains('P')
    } else {
        unsigned.contains('e') || unsigned.contains('E')
    };
    if has_point || has_exponent {
        TokenKind::Float
    } else {
        TokenKind::Int
    }
}

struct Lexer<'s> {
    source: &'s str,
    offset: usize,
    tokens: Vec<Token>,
    line_starts: Vec<u32>,
    errors: Vec<UnresolvedError>,
}

impl<'s> Lexer<'s> {
    fn peek(&self) -> Option<u8> {
        self.source.as_bytes().get(self.offset).copied()
    }

    fn bump(&mut self) -> Option<u8> {
        let byte = self.peek()?;
        self.offset += 1;
        if byte == b'\n' {
            self.line_starts.push(self.offset as u32);
        }
        Some(byte)
    }

    fn error(&mut self, offset: usize, message: impl Into<String>) {
        self.errors.push(UnresolvedError {
            offset: offset as u32,
            message: message.into(),
        });
    }

    fn skip_line_comment(&mut self) {
        while let Some(byte) = self.bump() {
            if byte == b'\n' {
                break;
            }
        }
    }

    // Block comments nest.
    fn skip_block_comment(&mut self, begin: usize) {
        let mut depth = 1u32;
        loop {
            match self.bump() {
                None => {
                    self.error(begin, "unterminated block comment");
                    return;
                }
                Some(b'(') if self.peek() == Some(b';') => {
                    self.bump();
                    depth += 1;
                }
                Some(b';') if self.peek() == Some(b')') => {
                    self.bump();
                    depth -= 1;
                    if depth == 0 {
                        return;
                    }
                }
                Some(_) => {}
            }
        }
    }

    // Scans past a string literal, reporting whether it was terminated.
    // Escape decoding happens later, when the parser needs the bytes.
    fn skip_string(&mut self, begin: usize) -> bool {
        loop {
            match self.bump() {
                None | Some(b'\n') => {
                    self.error(begin, "unterminated string literal");
                    return false;
                }
                Some(b'\\') => {
                    self.bump();
                }
                Some(b'"') => return true,
                Some(_) => {}
            }
        }
    }

    fn scan(&mut self) {
        while let Some(byte) = self.peek() {
            let begin = self.offset;
            match byte {
                b' ' | b'\t' | b'\r' | b'\n' => {
                    self.bump();
                }
                b';' => {
                    self.bump();
                    if self.peek() == Some(b';') {
                        self.skip_line_comment();
                    } else {
                        self.error(begin, "unexpected ';'");
                    }
                }
                b'(' => {
                    self.bump();
                    if self.peek() == Some(b';') {
                        self.bump();
                        self.skip_block_comment(begin);
                    } else {
                        self.tokens.push(Token {
                            kind: TokenKind::LeftParenthesis,
                            begin: begin as u32,
                        });
                    }
                }
                b')' => {
                    self.bump();
                    self.tokens.push(Token {
                        kind: TokenKind::RightParenthesis,
                        begin: begin as u32,
                    });
                }
                b'"' => {
                    self.bump();
                    if self.skip_string(begin) {
                        self.tokens.push(Token {
                            kind: TokenKind::String,
                            begin: begin as u32,
                        });
                    }
                }
                b'$' => {
                    self.bump();
                    while self.peek().is_some_and(|b| !is_delimiter(b)) {
                        self.bump();
                    }
                    self.tokens.push(Token {
                        kind: TokenKind::Name,
                        begin: begin as u32,
                    });
                }
                _ => {
                    while self.peek().is_some_and(|b| !is_delimiter(b)) {
                        self.bump();
                    }
                    let text = &self.source[begin..self.offset];
                    let kind = TokenKind::from_keyword(text).unwrap_or_else(|| {
                        if looks_numeric(text) {
                            classify_numeric(text)
                        } else {
                            TokenKind::Word
                        }
                    });
                    self.tokens.push(Token {
                        kind,
                        begin: begin as u32,
                    });
                }
            }
        }
        self.tokens.push(Token {
            kind: TokenKind::Eof,
            begin: self.offset as u32,
        });
    }
}

/// Tokenize the parse state's source, returning the token stream
/// (terminated by an [`TokenKind::Eof`] token). The line-start table and
/// any lexical errors are recorded into `parse_state`.
pub fn lex(source: &str, parse_state: &mut ParseState<'_>) -> Vec<Token> {
    let mut lexer = Lexer {
        source,
        offset: 0,
        tokens: Vec::new(),
        line_starts: vec![0],
        errors: Vec::new(),
    };
    lexer.scan();
    parse_state.line_info = lexer.line_starts;
    parse_state.unresolved_errors.append(&mut lexer.errors);
    lexer.tokens
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lex_kinds(source: &str) -> Vec<TokenKind> {
        let mut parse_state = ParseState::new(source);
        let tokens = lex(source, &mut parse_state);
        assert!(parse_state.unresolved_errors.is_empty());
        tokens.into_iter().map(|t| t.kind).collect()
    }

    #[test]
    fn keywords_and_atoms() {
        assert_eq!(
            lex_kinds("(module (func $f (export \"f\")))"),
            vec![
                TokenKind::LeftParenthesis,
                TokenKind::Module,
                TokenKind::LeftParenthesis,
                TokenKind::Func,
                TokenKind::Name,
                TokenKind::LeftParenthesis,
                TokenKind::Export,
                TokenKind::String,
                TokenKind::RightParenthesis,
                TokenKind::RightParenthesis,
                TokenKind::RightParenthesis,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn numbers_classify_as_int_or_float() {
        assert_eq!(
            lex_kinds("42 -0x1f 1.5 -1e3 0x1p3 inf -inf nan nan:0x7 i32"),
            vec![
                TokenKind::Int,
                TokenKind::Int,
                TokenKind::Float,
                TokenKind::Float,
                TokenKind::Float,
                TokenKind::Float,
                TokenKind::Float,
                TokenKind::Float,
                TokenKind::Float,
                TokenKind::Word,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn comments_nest_and_newlines_count() {
        let source = "(; outer (; inner ;) still ;) module\n;; line\nget";
        let mut parse_state = ParseState::new(source);
        let tokens = lex(source, &mut parse_state);
        assert!(parse_state.unresolved_errors.is_empty());
        assert_eq!(
            tokens.iter().map(|t| t.kind).collect::<Vec<_>>(),
            vec![TokenKind::Module, TokenKind::Get, TokenKind::Eof]
        );
        assert_eq!(parse_state.line_info.len(), 3);
    }

    #[test]
    fn unterminated_string_is_a_lexical_error() {
        let source = "\"abc";
        let mut parse_state = ParseState::new(source);
        let tokens = lex(source, &mut parse_state);
        assert_eq!(parse_state.unresolved_errors.len(), 1);
        assert_eq!(tokens.last().unwrap().kind, TokenKind::Eof);
    }
}
