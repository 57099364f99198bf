// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{schema::Column, Error};
use chrono::NaiveDate;
use std::path::PathBuf;

/// Upper bound on indexes per table, primary included.
pub const MAX_INDEXES: usize = 20;

/// How a table file is backed.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum StorageKind {
    /// Memory-mapped file
    #[default]
    Mmap,

    /// Heap regions, no file until transferred
    Memory,
}

impl StorageKind {
    /// Schema name, as written in the sidecar file.
    #[must_use]
    pub fn schema_name(self) -> &'static str {
        match self {
            Self::Mmap => "mmap",
            Self::Memory => "memory",
        }
    }

    /// Parses a schema storage name (case-insensitive).
    ///
    /// # Errors
    ///
    /// Unknown names are a format error.
    pub fn from_schema_name(name: &str) -> crate::Result<Self> {
        match name.to_ascii_lowercase().as_str() {
            "mmap" => Ok(Self::Mmap),
            "memory" => Ok(Self::Memory),
            other => Err(Error::Format(format!("unknown storage kind {other:?}"))),
        }
    }
}

/// Write-ahead logging mode of a table.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum WalMode {
    /// No journal
    #[default]
    Off,

    /// Journal, truncated after every successful recovery
    Truncate,

    /// Journal, kept across opens
    Log,
}

impl WalMode {
    /// Schema name, as written in the sidecar file.
    #[must_use]
    pub fn schema_name(self) -> &'static str {
        match self {
            Self::Off => "OFF",
            Self::Truncate => "TRUNCATE",
            Self::Log => "LOG",
        }
    }

    /// Parses a schema WAL mode name (case-insensitive).
    ///
    /// # Errors
    ///
    /// Unknown names are a format error.
    pub fn from_schema_name(name: &str) -> crate::Result<Self> {
        match name.to_ascii_uppercase().as_str() {
            "OFF" => Ok(Self::Off),
            "TRUNCATE" => Ok(Self::Truncate),
            "LOG" => Ok(Self::Log),
            other => Err(Error::Format(format!("unknown WAL mode {other:?}"))),
        }
    }
}

/// Options for the text-file import/export plugins.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TextOptions {
    /// Field delimiter
    pub delimiter: char,

    /// Quote character
    pub quote: char,

    /// Literal standing in for null
    pub null_string: String,

    /// Whether the first line is a header
    pub header: bool,
}

impl Default for TextOptions {
    fn default() -> Self {
        Self {
            delimiter: '\t',
            quote: '"',
            null_string: String::new(),
            header: false,
        }
    }
}

/// One index definition: a name plus the ordered key columns.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Index {
    /// Index name (`PRIMARY` for the primary index)
    pub name: String,

    /// Key column names, in order
    pub columns: Vec<String>,
}

/// Schema plus storage options of one table.
#[derive(Clone, Debug, PartialEq)]
pub struct Meta {
    /// Table name
    pub name: String,

    /// Ordered column set
    pub columns: Vec<Column>,

    /// Indexes; the first is always the primary
    pub indexes: Vec<Index>,

    /// File backing
    pub kind: StorageKind,

    /// Block compaction size: payload bytes per block are capped at this
    pub compact: usize,

    /// Compressor name, if any
    pub compressor: Option<String>,

    /// Dictionary file reference, if any
    pub dictionary: Option<PathBuf>,

    /// Row cache capacity in entries
    pub cache_size: usize,

    /// Write-ahead logging mode
    pub wal: WalMode,

    /// Text plugin options
    pub text: TextOptions,

    /// Creation date
    pub created: NaiveDate,

    /// Format tag
    pub format: Option<String>,

    /// mmap region size in bytes; 0 lets the storage choose
    pub increment: u32,
}

impl Meta {
    /// Creates a schema with the mandatory primary index.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::Format`] on an empty or duplicated column set,
    /// or a primary key naming a column that does not exist.
    pub fn new(name: &str, columns: Vec<Column>, primary: &[&str]) -> crate::Result<Self> {
        if columns.is_empty() {
            return Err(Error::Format(format!("table {name:?} has no columns")));
        }

        for (i, c) in columns.iter().enumerate() {
            if columns
                .iter()
                .skip(i + 1)
                .any(|other| other.name == c.name)
            {
                return Err(Error::Format(format!("duplicate column {:?}", c.name)));
            }
        }

        let mut meta = Self {
            name: name.to_owned(),
            columns,
            indexes: Vec::new(),
            kind: StorageKind::default(),
            compact: 4_000,
            compressor: None,
            dictionary: None,
            cache_size: 1_024,
            wal: WalMode::default(),
            text: TextOptions::default(),
            created: chrono::Utc::now().date_naive(),
            format: None,
            increment: 0,
        };

        meta.push_index("PRIMARY", primary)?;

        Ok(meta)
    }

    fn push_index(&mut self, name: &str, columns: &[&str]) -> crate::Result<()> {
        if self.indexes.len() == MAX_INDEXES {
            return Err(Error::Format(format!(
                "table {:?} exceeds {MAX_INDEXES} indexes",
                self.name
            )));
        }
        if columns.is_empty() {
            return Err(Error::Format(format!("index {name:?} has no columns")));
        }

        let columns: Vec<String> = columns
            .iter()
            .map(|c| c.to_ascii_lowercase())
            .collect();

        for c in &columns {
            if !self.columns.iter().any(|col| &col.name == c) {
                return Err(Error::Format(format!(
                    "index {name:?} references unknown column {c:?}"
                )));
            }
        }

        self.indexes.push(Index {
            name: name.to_owned(),
            columns,
        });

        Ok(())
    }

    /// Adds a secondary index.
    ///
    /// # Errors
    ///
    /// Fails on the 21st index or unknown key columns.
    pub fn with_key(mut self, name: &str, columns: &[&str]) -> crate::Result<Self> {
        self.push_index(name, columns)?;
        Ok(self)
    }

    /// Sets the storage kind.
    #[must_use]
    pub fn with_kind(mut self, kind: StorageKind) -> Self {
        self.kind = kind;
        self
    }

    /// Sets the WAL mode.
    #[must_use]
    pub fn with_wal(mut self, wal: WalMode) -> Self {
        self.wal = wal;
        self
    }

    /// Sets the row cache capacity.
    #[must_use]
    pub fn with_cache(mut self, entries: usize) -> Self {
        self.cache_size = entries;
        self
    }

    /// Sets the block compaction size.
    #[must_use]
    pub fn with_compact(mut self, bytes: usize) -> Self {
        self.compact = bytes;
        self
    }

    /// The primary index.
    #[must_use]
    pub fn primary(&self) -> &Index {
        #[allow(clippy::indexing_slicing)]
        &self.indexes[0]
    }

    /// Looks up a column position by name.
    #[must_use]
    pub fn column_position(&self, name: &str) -> Option<usize> {
        let name = name.to_ascii_lowercase();
        self.columns.iter().position(|c| c.name == name)
    }

    /// Column positions of an index's key, in key order.
    ///
    /// # Errors
    ///
    /// Fails when the index number is out of range.
    pub fn key_positions(&self, index_no: usize) -> crate::Result<Vec<usize>> {
        let index = self.indexes.get(index_no).ok_or_else(|| {
            Error::Format(format!("table {:?} has no index {index_no}", self.name))
        })?;

        Ok(index
            .columns
            .iter()
            .filter_map(|name| self.column_position(name))
            .collect())
    }

    /// Worst-case encoded row size:
    /// 2 bytes of column count plus each column's encoded cost.
    #[must_use]
    pub fn row_bytes(&self) -> usize {
        2 + self.columns.iter().map(Column::encoded_cost).sum::<usize>()
    }

    /// Payload bytes per storage block for this schema.
    #[must_use]
    pub fn block_data_bytes(&self) -> usize {
        self.row_bytes().min(self.compact).max(16)
    }

    /// Structural schema equality: everything except the mmap increment.
    #[must_use]
    pub fn structural_eq(&self, other: &Self) -> bool {
        let mut a = self.clone();
        let mut b = other.clone();
        a.increment = 0;
        b.increment = 0;
        a == b
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::ColumnType;
    use test_log::test;

    fn sample() -> crate::Result<Meta> {
        Meta::new(
            "accounts",
            vec![
                Column::new("id", ColumnType::Int64),
                Column::new("name", ColumnType::String).with_width(32),
                Column::decimal("amount", 18, 2),
            ],
            &["id"],
        )
    }

    #[test]
    fn meta_requires_known_key_columns() {
        let r = Meta::new(
            "t",
            vec![Column::new("id", ColumnType::Int64)],
            &["missing"],
        );
        assert!(matches!(r, Err(Error::Format(_))));
    }

    #[test]
    fn meta_rejects_duplicate_columns() {
        let r = Meta::new(
            "t",
            vec![
                Column::new("id", ColumnType::Int64),
                Column::new("ID", ColumnType::Int),
            ],
            &["id"],
        );
        assert!(matches!(r, Err(Error::Format(_))));
    }

    #[test]
    fn meta_caps_index_count() -> crate::Result<()> {
        let mut meta = sample()?;

        for i in 1..MAX_INDEXES {
            meta = meta.with_key(&format!("ix{i}"), &["name"])?;
        }
        assert_eq!(MAX_INDEXES, meta.indexes.len());
        assert!(meta.with_key("one_too_many", &["name"]).is_err());

        Ok(())
    }

    #[test]
    fn row_bytes_formula() -> crate::Result<()> {
        let meta = sample()?;

        let expected = 2 // column count
            + (2 + 8) // id
            + (2 + 2 + 32) // name
            + (2 + 2 + Column::decimal_width(18)); // amount
        assert_eq!(expected, meta.row_bytes());

        Ok(())
    }

    #[test]
    fn structural_eq_ignores_increment() -> crate::Result<()> {
        let a = sample()?;
        let mut b = sample()?;
        b.created = a.created;
        b.increment = 1 << 20;

        assert!(a.structural_eq(&b));

        let c = b.clone().with_cache(9);
        assert!(!a.structural_eq(&c));

        Ok(())
    }

    #[test]
    fn primary_is_first() -> crate::Result<()> {
        let meta = sample()?.with_key("by_name", &["name"])?;
        assert_eq!("PRIMARY", meta.primary().name);
        assert_eq!(vec![0], meta.key_positions(0)?);
        assert_eq!(vec![1], meta.key_positions(1)?);
        Ok(())
    }
}
