// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! The schema sidecar file (`<base>.desc`).
//!
//! Schemas persist in a SQL-like `CREATE TABLE` text form next to the data
//! file. The sidecar is rewritten atomically, and only when the in-memory
//! schema differs structurally from what is on disk.

use crate::{
    schema::{Column, ColumnType, Meta, StorageKind, Value, WalMode},
    Error,
};
use chrono::NaiveDate;
use std::{
    io::Write,
    path::{Path, PathBuf},
};

/// Extension of the sidecar, appended to the data file name.
pub const SIDECAR_SUFFIX: &str = ".desc";

/// Sidecar path for a data file path.
#[must_use]
pub fn sidecar_path(data_path: &Path) -> PathBuf {
    let mut s = data_path.as_os_str().to_owned();
    s.push(SIDECAR_SUFFIX);
    PathBuf::from(s)
}

fn quote(text: &str) -> String {
    format!("'{}'", text.replace('\'', "''"))
}

/// Renders a schema into its sidecar text form.
#[must_use]
pub fn to_text(meta: &Meta) -> String {
    let mut out = String::new();
    out.push_str(&format!("CREATE TABLE {} (\n", meta.name));

    for c in &meta.columns {
        out.push_str(&format!("  {} {}", c.name, c.ctype.schema_name()));

        match c.ctype {
            ColumnType::String | ColumnType::Bytes => {
                out.push_str(&format!("({})", c.width));
            }
            ColumnType::Decimal => {
                out.push_str(&format!(
                    "({},{})",
                    c.width.saturating_sub(3) * 2,
                    c.precision
                ));
            }
            _ => {}
        }

        if c.not_null {
            out.push_str(" NOT NULL");
        }
        if let Some(v) = &c.default {
            out.push_str(&format!(" DEFAULT {}", quote(&v.to_string())));
        }
        if let Some(comment) = &c.comment {
            out.push_str(&format!(" COMMENT {}", quote(comment)));
        }

        out.push_str(",\n");
    }

    for (i, index) in meta.indexes.iter().enumerate() {
        if i == 0 {
            out.push_str(&format!("  PRIMARY KEY ({})", index.columns.join(", ")));
        } else {
            out.push_str(&format!(
                ",\n  KEY {} ({})",
                index.name,
                index.columns.join(", ")
            ));
        }
    }

    out.push_str("\n) ");
    out.push_str(&format!(
        "STORAGE={}, CACHE={}, WAL={}, COMPACT={}",
        meta.kind.schema_name(),
        meta.cache_size,
        meta.wal.schema_name(),
        meta.compact,
    ));

    if let Some(c) = &meta.compressor {
        out.push_str(&format!(", COMPRESSOR={c}"));
    }
    if let Some(d) = &meta.dictionary {
        out.push_str(&format!(", DICTIONARY={}", d.display()));
    }

    out.push_str(&format!(", DATE={}", meta.created.format("%Y-%m-%d")));
    out.push('\n');

    out
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum Token {
    Word(String),
    Quoted(String),
    LParen,
    RParen,
    Comma,
    Eq,
}

fn tokenize(text: &str) -> crate::Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut chars = text.chars().peekable();

    while let Some(&c) = chars.peek() {
        match c {
            c if c.is_whitespace() => {
                chars.next();
            }
            '(' => {
                chars.next();
                tokens.push(Token::LParen);
            }
            ')' => {
                chars.next();
                tokens.push(Token::RParen);
            }
            ',' => {
                chars.next();
                tokens.push(Token::Comma);
            }
            '=' => {
                chars.next();
                tokens.push(Token::Eq);
            }
            '\'' => {
                chars.next();
                let mut s = String::new();

                loop {
                    match chars.next() {
                        Some('\'') => {
                            // Doubled quote is an escaped quote
                            if chars.peek() == Some(&'\'') {
                                chars.next();
                                s.push('\'');
                            } else {
                                break;
                            }
                        }
                        Some(c) => s.push(c),
                        None => {
                            return Err(Error::Format(
                                "unterminated quoted literal in sidecar".into(),
                            ))
                        }
                    }
                }

                tokens.push(Token::Quoted(s));
            }
            _ => {
                let mut word = String::new();

                while let Some(&c) = chars.peek() {
                    if c.is_whitespace() || matches!(c, '(' | ')' | ',' | '=' | '\'') {
                        break;
                    }
                    word.push(c);
                    chars.next();
                }

                tokens.push(Token::Word(word));
            }
        }
    }

    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> crate::Result<Token> {
        let t = self
            .tokens
            .get(self.pos)
            .cloned()
            .ok_or_else(|| Error::Format("unexpected end of sidecar".into()))?;
        self.pos += 1;
        Ok(t)
    }

    fn word(&mut self) -> crate::Result<String> {
        match self.next()? {
            Token::Word(w) => Ok(w),
            other => Err(Error::Format(format!("expected a word, found {other:?}"))),
        }
    }

    fn keyword(&mut self, expected: &str) -> crate::Result<()> {
        let w = self.word()?;
        if w.eq_ignore_ascii_case(expected) {
            Ok(())
        } else {
            Err(Error::Format(format!(
                "expected {expected}, found {w:?}"
            )))
        }
    }

    fn expect(&mut self, expected: &Token) -> crate::Result<()> {
        let t = self.next()?;
        if &t == expected {
            Ok(())
        } else {
            Err(Error::Format(format!(
                "expected {expected:?}, found {t:?}"
            )))
        }
    }

    fn peek_word(&self, expected: &str) -> bool {
        matches!(self.peek(), Some(Token::Word(w)) if w.eq_ignore_ascii_case(expected))
    }

    fn number(&mut self) -> crate::Result<usize> {
        let w = self.word()?;
        w.parse()
            .map_err(|_| Error::Format(format!("expected a number, found {w:?}")))
    }

    fn name_list(&mut self) -> crate::Result<Vec<String>> {
        self.expect(&Token::LParen)?;
        let mut names = Vec::new();

        loop {
            names.push(self.word()?.to_ascii_lowercase());
            match self.next()? {
                Token::Comma => {}
                Token::RParen => break,
                other => {
                    return Err(Error::Format(format!(
                        "expected , or ) in key list, found {other:?}"
                    )))
                }
            }
        }

        Ok(names)
    }

    fn column(&mut self, name: &str) -> crate::Result<Column> {
        let type_name = self.word()?;
        let ctype = ColumnType::from_schema_name(&type_name)?;

        let mut width = None;
        let mut precision = 0;

        if self.peek() == Some(&Token::LParen) {
            self.next()?;
            let first = self.number()?;

            if self.peek() == Some(&Token::Comma) {
                self.next()?;
                precision = u32::try_from(self.number()?)
                    .map_err(|_| Error::Format("precision out of range".into()))?;
            }

            self.expect(&Token::RParen)?;
            width = Some(first);
        }

        let mut column = Column::new(name, ctype);
        column.precision = precision;

        column.width = match (ctype, width) {
            (ColumnType::Decimal, Some(digits)) => {
                Column::decimal_width(u32::try_from(digits).unwrap_or(u32::MAX))
            }
            (ColumnType::Decimal, None) => Column::decimal_width(18),
            (_, Some(w)) if ctype.is_variable() => w,
            (_, _) => column.width,
        };

        loop {
            if self.peek_word("NOT") {
                self.next()?;
                self.keyword("NULL")?;
                column.not_null = true;
            } else if self.peek_word("DEFAULT") {
                self.next()?;
                let literal = match self.next()? {
                    Token::Quoted(s) | Token::Word(s) => s,
                    other => {
                        return Err(Error::Format(format!(
                            "expected a DEFAULT literal, found {other:?}"
                        )))
                    }
                };
                column = column.with_default(Value::Str(literal))?;
            } else if self.peek_word("COMMENT") {
                self.next()?;
                match self.next()? {
                    Token::Quoted(s) => column.comment = Some(s),
                    other => {
                        return Err(Error::Format(format!(
                            "expected a COMMENT literal, found {other:?}"
                        )))
                    }
                }
            } else {
                break;
            }
        }

        Ok(column)
    }
}

/// Parses a sidecar text form back into a schema.
///
/// # Errors
///
/// Fails with [`Error::Format`] on any token the grammar does not allow.
pub fn from_text(text: &str) -> crate::Result<Meta> {
    let mut p = Parser {
        tokens: tokenize(text)?,
        pos: 0,
    };

    p.keyword("CREATE")?;
    p.keyword("TABLE")?;
    let table_name = p.word()?;
    p.expect(&Token::LParen)?;

    let mut columns = Vec::new();
    let mut primary: Option<Vec<String>> = None;
    let mut keys: Vec<(String, Vec<String>)> = Vec::new();

    loop {
        if p.peek_word("PRIMARY") {
            p.next()?;
            p.keyword("KEY")?;

            if primary.replace(p.name_list()?).is_some() {
                return Err(Error::Format("duplicate PRIMARY KEY clause".into()));
            }
        } else if p.peek_word("KEY") {
            p.next()?;
            let name = p.word()?;
            keys.push((name, p.name_list()?));
        } else {
            let name = p.word()?;
            columns.push(p.column(&name)?);
        }

        match p.next()? {
            Token::Comma => {}
            Token::RParen => break,
            other => {
                return Err(Error::Format(format!(
                    "expected , or ) after table element, found {other:?}"
                )))
            }
        }
    }

    let primary =
        primary.ok_or_else(|| Error::Format(format!("table {table_name:?} has no PRIMARY KEY")))?;
    let primary: Vec<&str> = primary.iter().map(String::as_str).collect();

    let mut meta = Meta::new(&table_name, columns, &primary)?;

    for (name, cols) in keys {
        let cols: Vec<&str> = cols.iter().map(String::as_str).collect();
        meta = meta.with_key(&name, &cols)?;
    }

    // Trailing options
    while p.peek().is_some() {
        let key = p.word()?;
        p.expect(&Token::Eq)?;
        let value = match p.next()? {
            Token::Word(w) => w,
            Token::Quoted(s) => s,
            other => {
                return Err(Error::Format(format!(
                    "expected an option value, found {other:?}"
                )))
            }
        };

        match key.to_ascii_uppercase().as_str() {
            "STORAGE" => meta.kind = StorageKind::from_schema_name(&value)?,
            "CACHE" => {
                meta.cache_size = value
                    .parse()
                    .map_err(|_| Error::Format(format!("invalid CACHE value {value:?}")))?;
            }
            "WAL" => meta.wal = WalMode::from_schema_name(&value)?,
            "COMPACT" => {
                meta.compact = value
                    .parse()
                    .map_err(|_| Error::Format(format!("invalid COMPACT value {value:?}")))?;
            }
            "COMPRESSOR" => meta.compressor = Some(value),
            "DICTIONARY" => meta.dictionary = Some(PathBuf::from(value)),
            "DATE" => {
                meta.created = NaiveDate::parse_from_str(&value, "%Y-%m-%d")
                    .map_err(|_| Error::Format(format!("invalid DATE value {value:?}")))?;
            }
            other => {
                return Err(Error::Format(format!("unknown sidecar option {other:?}")));
            }
        }

        if p.peek() == Some(&Token::Comma) {
            p.next()?;
        }
    }

    Ok(meta)
}

/// Reads and parses the sidecar next to a data file, if present.
///
/// # Errors
///
/// I/O failures and malformed sidecars propagate.
pub fn read(data_path: &Path) -> crate::Result<Option<Meta>> {
    let path = sidecar_path(data_path);

    match std::fs::read_to_string(&path) {
        Ok(text) => Ok(Some(from_text(&text)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Writes the sidecar iff the on-disk schema differs structurally.
///
/// Returns whether a write happened. The write replaces the file
/// atomically via a temp file in the same directory.
///
/// # Errors
///
/// I/O failures propagate; an unparsable existing sidecar is a format
/// error rather than silently overwritten.
pub fn write_if_changed(data_path: &Path, meta: &Meta) -> crate::Result<bool> {
    if let Some(existing) = read(data_path)? {
        if existing.structural_eq(meta) {
            return Ok(false);
        }
    }

    let path = sidecar_path(data_path);
    let folder = path.parent().unwrap_or_else(|| Path::new("."));

    let mut temp_file = tempfile::NamedTempFile::new_in(folder)?;
    temp_file.write_all(to_text(meta).as_bytes())?;
    temp_file.flush()?;
    temp_file.as_file_mut().sync_all()?;
    temp_file
        .persist(&path)
        .map_err(|e| crate::Error::Io(e.error))?;

    log::debug!("Wrote schema sidecar to {path:?}");

    Ok(true)
}
