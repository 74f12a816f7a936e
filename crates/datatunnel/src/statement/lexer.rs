//! Tokenizer for statement text

use crate::error::{ParseError, Position};
use serde_json::{Map, Value};
use std::fmt;

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum TokenKind {
    Ident(String),
    Str(String),
    Int(i64),
    Float(f64),
    Object(Map<String, Value>),
    LParen,
    RParen,
    LBracket,
    RBracket,
    Comma,
    Eq,
    Semicolon,
    Eof,
}

impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TokenKind::Ident(s) => write!(f, "identifier '{s}'"),
            TokenKind::Str(_) => f.write_str("string literal"),
            TokenKind::Int(i) => write!(f, "number {i}"),
            TokenKind::Float(v) => write!(f, "number {v}"),
            TokenKind::Object(_) => f.write_str("object literal"),
            TokenKind::LParen => f.write_str("'('"),
            TokenKind::RParen => f.write_str("')'"),
            TokenKind::LBracket => f.write_str("'['"),
            TokenKind::RBracket => f.write_str("']'"),
            TokenKind::Comma => f.write_str("','"),
            TokenKind::Eq => f.write_str("'='"),
            TokenKind::Semicolon => f.write_str("';'"),
            TokenKind::Eof => f.write_str("end of statement"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Token {
    pub kind: TokenKind,
    /// Byte offset of the first character
    pub offset: usize,
}

pub(crate) struct Lexer<'a> {
    text: &'a str,
    pos: usize,
}

impl<'a> Lexer<'a> {
    pub fn new(text: &'a str) -> Self {
        Self { text, pos: 0 }
    }

    pub fn error_at(&self, offset: usize, message: impl Into<String>) -> ParseError {
        ParseError::Syntax {
            position: Position::locate(self.text, offset),
            message: message.into(),
        }
    }

    fn peek_char(&self) -> Option<char> {
        self.text[self.pos..].chars().next()
    }

    fn peek_second(&self) -> Option<char> {
        let mut chars = self.text[self.pos..].chars();
        chars.next();
        chars.next()
    }

    fn bump(&mut self) -> Option<char> {
        let ch = self.peek_char()?;
        self.pos += ch.len_utf8();
        Some(ch)
    }

    fn skip_trivia(&mut self) {
        loop {
            match self.peek_char() {
                Some(c) if c.is_whitespace() => {
                    self.bump();
                }
                Some('-') if self.peek_second() == Some('-') => {
                    while let Some(c) = self.bump() {
                        if c == '\n' {
                            break;
                        }
                    }
                }
                _ => return,
            }
        }
    }

    pub fn next_token(&mut self) -> Result<Token, ParseError> {
        self.skip_trivia();
        let start = self.pos;
        let Some(ch) = self.peek_char() else {
            return Ok(Token {
                kind: TokenKind::Eof,
                offset: start,
            });
        };

        let kind = match ch {
            '(' => self.single(TokenKind::LParen),
            ')' => self.single(TokenKind::RParen),
            '[' => self.single(TokenKind::LBracket),
            ']' => self.single(TokenKind::RBracket),
            ',' => self.single(TokenKind::Comma),
            '=' => self.single(TokenKind::Eq),
            ';' => self.single(TokenKind::Semicolon),
            '"' | '\'' => self.string(ch)?,
            '{' => self.object()?,
            c if c.is_ascii_digit() => self.number()?,
            '-' if self.peek_second().is_some_and(|c| c.is_ascii_digit()) => self.number()?,
            c if c.is_ascii_alphabetic() || c == '_' => self.ident(),
            other => return Err(self.error_at(start, format!("unexpected character '{other}'"))),
        };

        Ok(Token {
            kind,
            offset: start,
        })
    }

    fn single(&mut self, kind: TokenKind) -> TokenKind {
        self.bump();
        kind
    }

    fn ident(&mut self) -> TokenKind {
        let start = self.pos;
        while let Some(c) = self.peek_char() {
            if c.is_ascii_alphanumeric() || c == '_' || c == '.' {
                self.bump();
            } else {
                break;
            }
        }
        TokenKind::Ident(self.text[start..self.pos].to_string())
    }

    fn string(&mut self, quote: char) -> Result<TokenKind, ParseError> {
        let start = self.pos;
        self.bump();
        let mut out = String::new();
        loop {
            let escape_at = self.pos;
            match self.bump() {
                None => return Err(self.error_at(start, "unterminated string literal")),
                Some(c) if c == quote => return Ok(TokenKind::Str(out)),
                Some('\\') => match self.bump() {
                    Some('n') => out.push('\n'),
                    Some('r') => out.push('\r'),
                    Some('t') => out.push('\t'),
                    Some(c @ ('\\' | '"' | '\'')) => out.push(c),
                    Some(other) => {
                        return Err(self.error_at(escape_at, format!("unknown escape '\\{other}'")))
                    }
                    None => return Err(self.error_at(start, "unterminated string literal")),
                },
                Some(c) => out.push(c),
            }
        }
    }

    fn eat_digits(&mut self) -> usize {
        let start = self.pos;
        while self.peek_char().is_some_and(|c| c.is_ascii_digit()) {
            self.bump();
        }
        self.pos - start
    }

    fn number(&mut self) -> Result<TokenKind, ParseError> {
        let start = self.pos;
        if self.peek_char() == Some('-') {
            self.bump();
        }
        self.eat_digits();

        let mut is_float = false;
        if self.peek_char() == Some('.') {
            self.bump();
            if self.eat_digits() == 0 {
                return Err(self.error_at(self.pos, "expected digits after decimal point"));
            }
            is_float = true;
        }
        if matches!(self.peek_char(), Some('e' | 'E')) {
            self.bump();
            if matches!(self.peek_char(), Some('+' | '-')) {
                self.bump();
            }
            if self.eat_digits() == 0 {
                return Err(self.error_at(self.pos, "expected digits in exponent"));
            }
            is_float = true;
        }

        let literal = &self.text[start..self.pos];
        if !is_float {
            if let Ok(i) = literal.parse::<i64>() {
                return Ok(TokenKind::Int(i));
            }
        }
        literal
            .parse::<f64>()
            .ok()
            .filter(|v| v.is_finite())
            .map(TokenKind::Float)
            .ok_or_else(|| self.error_at(start, format!("invalid number '{literal}'")))
    }

    /// JSON object literal; the matching brace is found first, then serde_json
    /// parses the slice.
    fn object(&mut self) -> Result<TokenKind, ParseError> {
        let start = self.pos;
        let mut depth = 0usize;
        let mut in_string = false;
        let mut escaped = false;

        while let Some(c) = self.bump() {
            if in_string {
                match c {
                    _ if escaped => escaped = false,
                    '\\' => escaped = true,
                    '"' => in_string = false,
                    _ => {}
                }
                continue;
            }
            match c {
                '"' => in_string = true,
                '{' | '[' => depth += 1,
                '}' | ']' => {
                    depth = depth.saturating_sub(1);
                    if depth == 0 {
                        let slice = &self.text[start..self.pos];
                        return serde_json::from_str::<Map<String, Value>>(slice)
                            .map(TokenKind::Object)
                            .map_err(|e| {
                                self.error_at(start, format!("invalid object literal: {e}"))
                            });
                    }
                }
                _ => {}
            }
        }
        Err(self.error_at(start, "unterminated object literal"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(text: &str) -> Vec<TokenKind> {
        let mut lexer = Lexer::new(text);
        let mut out = Vec::new();
        loop {
            let token = lexer.next_token().unwrap();
            if token.kind == TokenKind::Eof {
                return out;
            }
            out.push(token.kind);
        }
    }

    #[test]
    fn test_punctuation_and_idents() {
        assert_eq!(
            kinds("SOURCE(x) = , ;"),
            vec![
                TokenKind::Ident("SOURCE".into()),
                TokenKind::LParen,
                TokenKind::Ident("x".into()),
                TokenKind::RParen,
                TokenKind::Eq,
                TokenKind::Comma,
                TokenKind::Semicolon,
            ]
        );
    }

    #[test]
    fn test_both_quote_styles() {
        assert_eq!(
            kinds(r#"'it\'s' "say \"hi\"""#),
            vec![
                TokenKind::Str("it's".into()),
                TokenKind::Str("say \"hi\"".into())
            ]
        );
    }

    #[test]
    fn test_numbers() {
        assert_eq!(
            kinds("42 -7 1.5 2e3 99999999999999999999"),
            vec![
                TokenKind::Int(42),
                TokenKind::Int(-7),
                TokenKind::Float(1.5),
                TokenKind::Float(2000.0),
                TokenKind::Float(1e20),
            ]
        );
    }

    #[test]
    fn test_comments_are_skipped() {
        assert_eq!(
            kinds("a -- trailing comment\n b"),
            vec![TokenKind::Ident("a".into()), TokenKind::Ident("b".into())]
        );
    }

    #[test]
    fn test_object_literal_with_nested_braces_in_strings() {
        let tokens = kinds(r#"{"id": 1, "note": "a}b", "tags": [1, {"x": 2}]}"#);
        match &tokens[0] {
            TokenKind::Object(map) => {
                assert_eq!(map["id"], serde_json::json!(1));
                assert_eq!(map["note"], serde_json::json!("a}b"));
            }
            other => panic!("expected object, got {other:?}"),
        }
        assert_eq!(tokens.len(), 1);
    }

    #[test]
    fn test_unterminated_string_reports_start() {
        let mut lexer = Lexer::new("  'abc");
        match lexer.next_token().unwrap_err() {
            ParseError::Syntax { position, .. } => assert_eq!(position.offset, 2),
            other => panic!("unexpected {other:?}"),
        }
    }
}
