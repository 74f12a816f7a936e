//! Recursive-descent parser for the DATATUNNEL statement
//!
//! ```text
//! statement   := "DATATUNNEL" clause(SOURCE) clause(SINK) [";"]
//! clause(K)   := K "(" string ")" "OPTIONS" "(" [option ("," option)*] ")"
//! option      := identifier "=" value
//! value       := scalar | "[" item ("," item)* "]"
//! item        := scalar | object
//! scalar      := string | number | "true" | "false"
//! ```
//!
//! One token of lookahead, no backtracking, no I/O.

use super::lexer::{Lexer, Token, TokenKind};
use super::plan::{ConnectorRole, ConnectorSpec, TunnelJobPlan, RESULT_TABLE_NAME};
use crate::error::{ParseError, Position};
use crate::options::{OptionValue, RawOptions};
use std::collections::btree_map::Entry;

/// Parse statement text into a job plan
pub fn parse(text: &str) -> Result<TunnelJobPlan, ParseError> {
    Parser::new(text)?.statement()
}

struct Parser<'a> {
    text: &'a str,
    lexer: Lexer<'a>,
    current: Token,
}

impl<'a> Parser<'a> {
    fn new(text: &'a str) -> Result<Self, ParseError> {
        let mut lexer = Lexer::new(text);
        let current = lexer.next_token()?;
        Ok(Self {
            text,
            lexer,
            current,
        })
    }

    fn advance(&mut self) -> Result<Token, ParseError> {
        let next = self.lexer.next_token()?;
        Ok(std::mem::replace(&mut self.current, next))
    }

    fn error(&self, message: impl Into<String>) -> ParseError {
        self.lexer.error_at(self.current.offset, message)
    }

    fn unexpected(&self, expected: &str) -> ParseError {
        self.error(format!("expected {expected}, found {}", self.current.kind))
    }

    fn expect(&mut self, kind: TokenKind, expected: &str) -> Result<Token, ParseError> {
        if self.current.kind == kind {
            self.advance()
        } else {
            Err(self.unexpected(expected))
        }
    }

    fn expect_keyword(&mut self, keyword: &str) -> Result<(), ParseError> {
        match &self.current.kind {
            TokenKind::Ident(word) if word.eq_ignore_ascii_case(keyword) => {
                self.advance()?;
                Ok(())
            }
            _ => Err(self.unexpected(keyword)),
        }
    }

    fn statement(mut self) -> Result<TunnelJobPlan, ParseError> {
        self.expect_keyword("DATATUNNEL")?;
        let (source, result_table_name) = self.clause(ConnectorRole::Source)?;
        let (sink, _) = self.clause(ConnectorRole::Sink)?;

        if self.current.kind == TokenKind::Semicolon {
            self.advance()?;
        }
        if self.current.kind != TokenKind::Eof {
            return Err(self.unexpected("end of statement"));
        }

        Ok(TunnelJobPlan::new(source, sink, result_table_name))
    }

    fn clause(&mut self, role: ConnectorRole) -> Result<(ConnectorSpec, Option<String>), ParseError> {
        self.expect_keyword(role.keyword())?;
        self.expect(TokenKind::LParen, &format!("'(' after {}", role.keyword()))?;

        let kind = match &self.current.kind {
            TokenKind::Str(kind) if !kind.is_empty() => kind.clone(),
            TokenKind::Str(_) => return Err(self.error("connector kind must not be empty")),
            _ => return Err(self.unexpected("connector kind string")),
        };
        self.advance()?;

        self.expect(TokenKind::RParen, "')' after connector kind")?;
        self.expect_keyword("OPTIONS")?;
        self.expect(TokenKind::LParen, "'(' after OPTIONS")?;
        let (mut options, result_table) = self.option_list(role)?;
        self.expect(TokenKind::RParen, "',' or ')' in option list")?;

        let result_table_name = match result_table {
            Some((value, offset)) if role == ConnectorRole::Source => match value {
                OptionValue::String(name) if !name.is_empty() => Some(name),
                _ => {
                    return Err(self.lexer.error_at(
                        offset,
                        format!("{RESULT_TABLE_NAME} must be a non-empty string literal"),
                    ))
                }
            },
            Some((value, _)) => {
                options.insert(RESULT_TABLE_NAME.to_string(), value);
                None
            }
            None => None,
        };

        Ok((ConnectorSpec::new(role, kind, options), result_table_name))
    }

    /// Options plus the `resultTableName` entry (and its value offset), if any
    fn option_list(
        &mut self,
        role: ConnectorRole,
    ) -> Result<(RawOptions, Option<(OptionValue, usize)>), ParseError> {
        let mut options = RawOptions::new();
        let mut result_table = None;

        if self.current.kind == TokenKind::RParen {
            return Ok((options, result_table));
        }

        loop {
            let key_offset = self.current.offset;
            let key = match &self.current.kind {
                TokenKind::Ident(key) => key.clone(),
                _ => return Err(self.unexpected("option name")),
            };
            self.advance()?;
            self.expect(TokenKind::Eq, &format!("'=' after option '{key}'"))?;
            let value_offset = self.current.offset;
            let value = self.value()?;

            let duplicate = || ParseError::DuplicateOptionKey {
                key: key.clone(),
                role,
                position: Position::locate(self.text, key_offset),
            };

            if key == RESULT_TABLE_NAME {
                if result_table.is_some() {
                    return Err(duplicate());
                }
                result_table = Some((value, value_offset));
            } else {
                match options.entry(key.clone()) {
                    Entry::Occupied(_) => return Err(duplicate()),
                    Entry::Vacant(slot) => {
                        slot.insert(value);
                    }
                }
            }

            if self.current.kind == TokenKind::Comma {
                self.advance()?;
            } else {
                return Ok((options, result_table));
            }
        }
    }

    fn value(&mut self) -> Result<OptionValue, ParseError> {
        if self.current.kind == TokenKind::LBracket {
            return self.list();
        }
        if matches!(self.current.kind, TokenKind::Object(_)) {
            return Err(self.error("object literals are only allowed inside lists"));
        }
        self.scalar("option value")
    }

    fn scalar(&mut self, expected: &str) -> Result<OptionValue, ParseError> {
        let value = match &self.current.kind {
            TokenKind::Str(s) => OptionValue::String(s.clone()),
            TokenKind::Int(i) => OptionValue::Integer(*i),
            TokenKind::Float(v) => OptionValue::Float(*v),
            TokenKind::Ident(word) if word.eq_ignore_ascii_case("true") => OptionValue::Boolean(true),
            TokenKind::Ident(word) if word.eq_ignore_ascii_case("false") => {
                OptionValue::Boolean(false)
            }
            _ => return Err(self.unexpected(expected)),
        };
        self.advance()?;
        Ok(value)
    }

    fn list(&mut self) -> Result<OptionValue, ParseError> {
        self.expect(TokenKind::LBracket, "'['")?;
        let mut items = Vec::new();
        loop {
            let item = match &self.current.kind {
                TokenKind::Object(map) => {
                    let map = map.clone();
                    self.advance()?;
                    OptionValue::Object(map)
                }
                _ => self.scalar("list element")?,
            };
            items.push(item);

            match self.current.kind {
                TokenKind::Comma => {
                    self.advance()?;
                }
                TokenKind::RBracket => {
                    self.advance()?;
                    return Ok(OptionValue::List(items));
                }
                _ => return Err(self.unexpected("',' or ']' in list")),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const DEMO: &str = r#"
        DATATUNNEL SOURCE("mysql") OPTIONS(
            username = "root",
            password = 'secret',
            host = '172.18.5.44',
            port = 3306,
            databaseName = 'demos',
            tableName = 'users',
            columns = ["*"],
            resultTableName = 'tdl_users'
        )
        SINK("redshift") OPTIONS(
            username = "admin",
            tableName = "users",
            tempdir = "s3a://datacyber/redshift_temp/",
            columns = ["id", "name"]
        )
    "#;

    #[test]
    fn test_parse_demo_statement() {
        let plan = parse(DEMO).unwrap();
        assert_eq!(plan.source().kind(), "mysql");
        assert_eq!(plan.sink().kind(), "redshift");
        assert_eq!(plan.result_table_name(), Some("tdl_users"));
        assert!(!plan.source().options().contains_key(RESULT_TABLE_NAME));
        assert_eq!(
            plan.source().options()["port"],
            OptionValue::Integer(3306)
        );
        assert_eq!(
            plan.sink().options()["columns"],
            OptionValue::string_list(["id", "name"])
        );
    }

    #[test]
    fn test_keywords_are_case_insensitive() {
        let plan = parse(r#"datatunnel source("memory") options(rows=[{"id":1}]) Sink("memory") Options(target="t1");"#)
            .unwrap();
        match &plan.source().options()["rows"] {
            OptionValue::List(items) => match &items[0] {
                OptionValue::Object(row) => assert_eq!(row["id"], json!(1)),
                other => panic!("unexpected item {other:?}"),
            },
            other => panic!("unexpected value {other:?}"),
        }
    }

    #[test]
    fn test_kind_is_case_sensitive() {
        let plan = parse(r#"DATATUNNEL SOURCE("MySQL") OPTIONS() SINK("log") OPTIONS()"#).unwrap();
        assert_eq!(plan.source().kind(), "MySQL");
    }

    #[test]
    fn test_duplicate_option_key() {
        let err = parse(r#"DATATUNNEL SOURCE("memory") OPTIONS(a=1, a=2) SINK("log") OPTIONS()"#)
            .unwrap_err();
        match err {
            ParseError::DuplicateOptionKey { key, role, position } => {
                assert_eq!(key, "a");
                assert_eq!(role, ConnectorRole::Source);
                assert_eq!(position.column, 42);
            }
            other => panic!("unexpected {other:?}"),
        }

        let err = parse(r#"DATATUNNEL SOURCE("memory") OPTIONS() SINK("log") OPTIONS(x="a", x="b")"#)
            .unwrap_err();
        assert!(matches!(err, ParseError::DuplicateOptionKey { role: ConnectorRole::Sink, .. }));
    }

    #[test]
    fn test_duplicate_result_table_name() {
        let err = parse(
            r#"DATATUNNEL SOURCE("m") OPTIONS(resultTableName="a", resultTableName="b") SINK("log") OPTIONS()"#,
        )
        .unwrap_err();
        assert!(matches!(err, ParseError::DuplicateOptionKey { .. }));
    }

    #[test]
    fn test_result_table_name_must_be_string() {
        let err = parse(r#"DATATUNNEL SOURCE("m") OPTIONS(resultTableName=1) SINK("log") OPTIONS()"#)
            .unwrap_err();
        assert!(err.to_string().contains(RESULT_TABLE_NAME));
    }

    #[test]
    fn test_sink_result_table_name_is_plain_option() {
        let plan = parse(r#"DATATUNNEL SOURCE("m") OPTIONS() SINK("log") OPTIONS(resultTableName="x")"#)
            .unwrap();
        assert_eq!(plan.result_table_name(), None);
        assert!(plan.sink().options().contains_key(RESULT_TABLE_NAME));
    }

    #[test]
    fn test_syntax_errors_carry_position() {
        let err = parse("DATATUNNEL SOURCE(memory) OPTIONS() SINK(\"log\") OPTIONS()").unwrap_err();
        match err {
            ParseError::Syntax { position, message } => {
                assert_eq!(position.offset, 18);
                assert!(message.contains("connector kind"));
            }
            other => panic!("unexpected {other:?}"),
        }

        assert!(parse("").is_err());
        assert!(parse(r#"DATATUNNEL SOURCE("m") OPTIONS(a=) SINK("l") OPTIONS()"#).is_err());
        assert!(parse(r#"DATATUNNEL SOURCE("m") OPTIONS(a=[]) SINK("l") OPTIONS()"#).is_err());
        assert!(parse(r#"DATATUNNEL SOURCE("m") OPTIONS(a=1,) SINK("l") OPTIONS()"#).is_err());
        assert!(parse(r#"DATATUNNEL SOURCE("m") OPTIONS() SINK("l") OPTIONS() extra"#).is_err());
        assert!(parse(r#"DATATUNNEL SOURCE("m") OPTIONS(a={"x":1}) SINK("l") OPTIONS()"#).is_err());
    }

    #[test]
    fn test_injected_values_stay_values() {
        let plan = parse(
            r#"DATATUNNEL SOURCE("m") OPTIONS(password="x\") SINK(\"evil\") OPTIONS(") SINK("log") OPTIONS()"#,
        )
        .unwrap();
        assert_eq!(plan.sink().kind(), "log");
        assert_eq!(
            plan.source().options()["password"],
            OptionValue::from(r#"x") SINK("evil") OPTIONS("#)
        );
    }

    #[test]
    fn test_canonical_round_trip() {
        let plan = parse(DEMO).unwrap();
        let text = plan.to_string();
        assert!(text.starts_with("DATATUNNEL SOURCE(\"mysql\") OPTIONS(columns=[\"*\"]"));
        assert!(text.contains("resultTableName=\"tdl_users\") SINK"));
        assert_eq!(parse(&text).unwrap(), plan);
    }
}
