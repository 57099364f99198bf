// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! The row-lookup table: row codec, block storage, primary hash index
//! and row cache behind one single-writer surface.

mod key;

use crate::{
    cache::RowCache,
    codec::RowCodec,
    index::HashIndexFile,
    row::Row,
    schema::{sidecar, Meta, StorageKind, Value, WalMode, MAX_INDEXES},
    storage::{
        AnyStorage, BlockFile, NoopRedo, Storage, StorageOptions, Wal, WalStorage,
    },
    Error,
};
use byteorder::{ByteOrder, LittleEndian};
use key::{RowProbe, StoredOrder};
use std::{
    path::{Path, PathBuf},
    time::Instant,
};

/// First bytes of a table data file's custom header.
const SIGNATURE: &[u8; 4] = b"HTBL";

/// Current table format version.
const TABLE_VERSION: u32 = 1;

/// How a table is opened.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum OpenMode {
    /// Single writer; takes the advisory file lock
    ReadWrite,

    /// Reader of already-flushed state; no lock, no cache
    ReadOnly,
}

/// A table with a hash primary index.
///
/// ```
/// # use flintdb::{HashTable, OpenMode, Row};
/// # use flintdb::schema::{Column, ColumnType, Meta, Value};
/// # let dir = tempfile::tempdir()?;
/// let meta = Meta::new(
///     "users",
///     vec![
///         Column::new("id", ColumnType::Int64),
///         Column::new("name", ColumnType::String).with_width(32),
///     ],
///     &["id"],
/// )?;
///
/// let mut table = HashTable::open(dir.path().join("users.db"), meta, OpenMode::ReadWrite)?;
///
/// let mut row = Row::new(vec![Value::Int64(1), Value::Str("alice".into())]);
/// table.apply(&mut row)?;
///
/// let found = table.one(0, &[("id", Value::Int64(1))])?;
/// assert_eq!(Some(Value::Str("alice".into())), found.and_then(|r| r.get(1).cloned()));
/// # table.close()?;
/// # Ok::<(), flintdb::Error>(())
/// ```
pub struct HashTable {
    path: PathBuf,
    meta: Meta,
    codec: RowCodec,
    storage: AnyStorage,
    primary: HashIndexFile,
    cache: RowCache,
    key_positions: Vec<usize>,
    mode: OpenMode,
}

fn index_path(data_path: &Path, index_no: usize) -> PathBuf {
    let mut s = data_path.as_os_str().to_owned();
    s.push(format!(".i.{index_no}"));
    PathBuf::from(s)
}

fn wal_path(data_path: &Path) -> PathBuf {
    let mut s = data_path.as_os_str().to_owned();
    s.push(crate::storage::wal::WAL_SUFFIX);
    PathBuf::from(s)
}

fn verify_signature(file: &mut BlockFile, read_only: bool) -> crate::Result<()> {
    let mut raw = [0u8; 8];
    file.custom_read(0, &mut raw)?;

    #[allow(clippy::indexing_slicing)]
    if &raw[..4] == SIGNATURE {
        let version = LittleEndian::read_u32(&raw[4..8]);

        if version != TABLE_VERSION {
            return Err(Error::Corruption {
                path: file.path().to_path_buf(),
                message: format!("table version {version} is not supported"),
            });
        }

        Ok(())
    } else if raw == [0; 8] && !read_only {
        let mut stamp = [0u8; 8];
        stamp[..4].copy_from_slice(SIGNATURE);
        LittleEndian::write_u32(&mut stamp[4..8], TABLE_VERSION);
        file.custom_write(0, &stamp)
    } else {
        Err(Error::Corruption {
            path: file.path().to_path_buf(),
            message: "not a table data file".into(),
        })
    }
}

impl HashTable {
    /// Opens or creates a table.
    ///
    /// Read-write opens make or refresh the schema sidecar, take the
    /// writer lock, replay any journal and stamp the file signature.
    /// Read-only opens check the sidecar and skip lock, cache and
    /// journal.
    ///
    /// # Errors
    ///
    /// Schema mismatches are format errors; foreign files are corruption
    /// errors; lock conflicts surface as I/O errors.
    pub fn open<P: AsRef<Path>>(path: P, meta: Meta, mode: OpenMode) -> crate::Result<Self> {
        let start = Instant::now();
        let path = path.as_ref().to_path_buf();
        let read_only = mode == OpenMode::ReadOnly;
        let in_memory = meta.kind == StorageKind::Memory;

        if read_only {
            if let Some(existing) = sidecar::read(&path)? {
                if !existing.structural_eq(&meta) {
                    return Err(Error::Format(format!(
                        "schema for {path:?} does not match its sidecar"
                    )));
                }
            }
        } else {
            sidecar::write_if_changed(&path, &meta)?;
        }

        let mut file = StorageOptions::new(&path)
            .block_data_bytes(meta.block_data_bytes())
            .increment(u64::from(meta.increment))
            .read_only(read_only)
            .in_memory(in_memory)
            .open()?;

        verify_signature(&mut file, read_only)?;

        let storage = if meta.wal == WalMode::Off || read_only {
            AnyStorage::Block(file)
        } else {
            let mut wal = Wal::open(wal_path(&path), true)?;
            wal.recover(&mut file, &mut NoopRedo)?;

            if meta.wal == WalMode::Truncate {
                wal.checkpoint()?;
            }

            AnyStorage::Wal(WalStorage::new(AnyStorage::Block(file), wal))
        };

        let primary = HashIndexFile::open(index_path(&path, 0), read_only, in_memory)?;
        let key_positions = meta.key_positions(0)?;
        let cache = RowCache::new(if read_only { 0 } else { meta.cache_size });
        let codec = RowCodec::new(meta.clone())?;

        log::info!(
            "Opened table {:?}: {} columns, {} rows, wal {}, cache {}, in {:?}",
            path,
            meta.columns.len(),
            storage.count(),
            meta.wal.schema_name(),
            meta.cache_size,
            start.elapsed(),
        );

        let mut table = Self {
            path,
            meta,
            codec,
            storage,
            primary,
            cache,
            key_positions,
            mode,
        };

        // Journal replay (or an index file lost with a crash) can leave
        // the primary index behind the data; reindex the gap
        if !read_only && table.primary.count() < table.storage.count() {
            table.rebuild_primary()?;
        }

        Ok(table)
    }

    fn rebuild_primary(&mut self) -> crate::Result<()> {
        let block_bytes = (16 + self.meta.block_data_bytes()) as u64;
        let blocks = self.storage.bytes().saturating_sub(512) / block_bytes;

        log::warn!(
            "Reindexing {:?}: index has {} keys, storage has {} rows",
            self.path,
            self.primary.count(),
            self.storage.count(),
        );

        for id in 0..blocks {
            if self.storage.read(id)?.is_none() {
                continue;
            }

            let key = i64::try_from(id).map_err(|_| Error::Corruption {
                path: self.path.clone(),
                message: "row id overflow".into(),
            })?;

            let mut order = StoredOrder {
                storage: &mut self.storage,
                codec: &self.codec,
                key_positions: &self.key_positions,
            };

            self.primary.insert(key, &mut order)?;
        }

        Ok(())
    }

    /// Opens an existing table using the schema from its sidecar.
    ///
    /// # Errors
    ///
    /// A missing sidecar is a format error; otherwise see
    /// [`HashTable::open`].
    pub fn open_existing<P: AsRef<Path>>(path: P, mode: OpenMode) -> crate::Result<Self> {
        let path = path.as_ref();

        let meta = sidecar::read(path)?.ok_or_else(|| {
            Error::Format(format!("table {path:?} has no schema sidecar"))
        })?;

        Self::open(path, meta, mode)
    }

    /// The table schema.
    #[must_use]
    pub fn meta(&self) -> &Meta {
        &self.meta
    }

    /// The data file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// How the table was opened.
    #[must_use]
    pub fn mode(&self) -> OpenMode {
        self.mode
    }

    /// Live rows.
    #[must_use]
    pub fn count(&self) -> u64 {
        self.storage.count()
    }

    /// Data file size in bytes.
    #[must_use]
    pub fn bytes(&self) -> u64 {
        self.storage.bytes()
    }

    /// Inserts or updates a row by its primary key.
    ///
    /// A row that already carries an id overwrites in place. Otherwise
    /// the primary index decides: an absent key stores a fresh row and
    /// indexes it, a present key overwrites the existing row. The row's
    /// id is stamped either way and returned.
    ///
    /// # Errors
    ///
    /// Arity mismatches and oversized values are rejected before any
    /// mutation; storage and index failures propagate.
    pub fn apply(&mut self, row: &mut Row) -> crate::Result<i64> {
        self.normalize(row)?;

        let buf = self.codec.format(row)?;
        let result = self.apply_encoded(row, buf.as_read_slice());
        self.codec.release(buf);
        result
    }

    /// Casts every value to its column type, so probing, hashing and the
    /// stored form all agree.
    fn normalize(&self, row: &mut Row) -> crate::Result<()> {
        if row.len() != self.meta.columns.len() {
            return Err(Error::Format(format!(
                "row has {} values, schema {:?} has {} columns",
                row.len(),
                self.meta.name,
                self.meta.columns.len(),
            )));
        }

        for (column, value) in self.meta.columns.iter().zip(&mut row.values) {
            if !value.is_null() && value.type_of() != column.ctype {
                *value = value.clone().cast(column.ctype, column.precision)?;
            }
        }

        Ok(())
    }

    fn apply_encoded(&mut self, row: &mut Row, payload: &[u8]) -> crate::Result<i64> {
        if row.id >= 0 {
            self.cache.evict(row.id);

            #[allow(clippy::cast_sign_loss)]
            self.storage.write_at(row.id as u64, payload)?;
            return Ok(row.id);
        }

        let existing = {
            let mut probe = RowProbe {
                row,
                storage: &mut self.storage,
                codec: &self.codec,
                key_positions: &self.key_positions,
            };

            self.primary.find(&mut probe)?
        };

        match existing {
            Some(id) => {
                self.cache.evict(id);

                #[allow(clippy::cast_sign_loss)]
                self.storage.write_at(id as u64, payload)?;
                row.id = id;
            }
            None => {
                let id = i64::try_from(self.storage.write(payload)?).map_err(|_| {
                    Error::Corruption {
                        path: self.path.clone(),
                        message: "row id overflow".into(),
                    }
                })?;

                let mut order = StoredOrder {
                    storage: &mut self.storage,
                    codec: &self.codec,
                    key_positions: &self.key_positions,
                };

                self.primary.insert(id, &mut order)?;
                row.id = id;
            }
        }

        Ok(row.id)
    }

    /// Overwrites the row at `node` without touching the primary index.
    ///
    /// The primary key is presumed unchanged. A negative `node` falls
    /// back to [`HashTable::apply`].
    ///
    /// # Errors
    ///
    /// Same conditions as [`HashTable::apply`].
    pub fn apply_at(&mut self, node: i64, row: &mut Row) -> crate::Result<i64> {
        if node < 0 {
            return self.apply(row);
        }

        self.normalize(row)?;

        let buf = self.codec.format(row)?;
        self.cache.evict(node);

        #[allow(clippy::cast_sign_loss)]
        let result = self.storage.write_at(node as u64, buf.as_read_slice());
        self.codec.release(buf);
        result?;

        row.id = node;
        Ok(node)
    }

    /// Looks a row up by index key values.
    ///
    /// Only the primary index (number 0) is available on this table. The
    /// given values are cast to their column types and every key column
    /// must be present.
    ///
    /// # Errors
    ///
    /// Unknown columns, missing key columns and cast failures are format
    /// errors.
    pub fn one(&mut self, index_no: usize, keys: &[(&str, Value)]) -> crate::Result<Option<Row>> {
        if index_no != 0 {
            return Err(Error::Unsupported(
                "secondary index lookup on the hash-primary table",
            ));
        }

        let mut synthetic = Row::nulls(&self.meta);

        for (name, value) in keys {
            let position = self.meta.column_position(name).ok_or_else(|| {
                Error::Format(format!("unknown column {name:?} in key lookup"))
            })?;

            #[allow(clippy::indexing_slicing)]
            let column = &self.meta.columns[position];
            synthetic.set(position, value.clone().cast(column.ctype, column.precision)?);
        }

        for &p in &self.key_positions {
            if synthetic.get(p).is_none_or(Value::is_null) {
                #[allow(clippy::indexing_slicing)]
                return Err(Error::Format(format!(
                    "key column {:?} was not provided",
                    self.meta.columns[p].name
                )));
            }
        }

        let found = {
            let mut probe = RowProbe {
                row: &synthetic,
                storage: &mut self.storage,
                codec: &self.codec,
                key_positions: &self.key_positions,
            };

            self.primary.find(&mut probe)?
        };

        match found {
            Some(id) => self.read(id),
            None => Ok(None),
        }
    }

    /// Reads the row at `id`, through the row cache.
    ///
    /// # Errors
    ///
    /// Storage and decode failures propagate; an absent row is `None`.
    pub fn read(&mut self, id: i64) -> crate::Result<Option<Row>> {
        if id < 0 {
            return Ok(None);
        }

        if let Some(row) = self.cache.get(id) {
            return Ok(Some(row));
        }

        #[allow(clippy::cast_sign_loss)]
        let Some(bytes) = self.storage.read(id as u64)? else {
            return Ok(None);
        };

        let mut row = self.codec.parse(&bytes)?;
        row.id = id;

        self.cache.put(id, row.clone());
        Ok(Some(row))
    }

    /// Visits every row in primary-index order per bucket.
    ///
    /// Returns the number of rows visited.
    ///
    /// # Errors
    ///
    /// Visitor, storage and decode failures propagate.
    pub fn traverse(
        &mut self,
        visitor: &mut dyn FnMut(&Row) -> crate::Result<()>,
    ) -> crate::Result<u64> {
        let storage = &mut self.storage;
        let codec = &self.codec;
        let path = &self.path;

        self.primary.traverse(&mut |key| {
            let id = u64::try_from(key).map_err(|_| Error::Corruption {
                path: path.clone(),
                message: format!("index key {key} is negative"),
            })?;

            let bytes = storage.read(id)?.ok_or_else(|| Error::Corruption {
                path: path.clone(),
                message: format!("index key {key} does not resolve to a row"),
            })?;

            let mut row = codec.parse(&bytes)?;
            row.id = key;
            visitor(&row)
        })
    }

    /// Row deletion is not available on the hash-primary table; the
    /// primary index has no removal path.
    ///
    /// # Errors
    ///
    /// Always [`Error::Unsupported`].
    pub fn delete(&mut self, _id: i64) -> crate::Result<bool> {
        Err(Error::Unsupported("delete on the hash-primary table"))
    }

    /// Truncates the journal when one is attached and quiet.
    ///
    /// # Errors
    ///
    /// Propagates journal failures.
    pub fn checkpoint(&mut self) -> crate::Result<bool> {
        match &mut self.storage {
            AnyStorage::Wal(wal) => wal.checkpoint(),
            AnyStorage::Block(_) => Ok(false),
        }
    }

    /// Closes index, cache, codec and storage, in that order.
    ///
    /// # Errors
    ///
    /// Propagates I/O errors.
    pub fn close(mut self) -> crate::Result<()> {
        let start = Instant::now();

        self.primary.close()?;
        self.cache.clear();
        self.storage.close()?;

        log::debug!("Closed table {:?} in {:?}", self.path, start.elapsed());
        Ok(())
    }

    /// Closes the table and removes its data file, sidecar, index files
    /// and journal.
    ///
    /// # Errors
    ///
    /// Propagates I/O errors.
    pub fn drop_table(self) -> crate::Result<()> {
        let path = self.path.clone();
        self.close()?;

        remove_if_exists(&path)?;
        remove_if_exists(&sidecar::sidecar_path(&path))?;
        remove_if_exists(&wal_path(&path))?;

        for index_no in 0..MAX_INDEXES {
            remove_if_exists(&index_path(&path, index_no))?;
        }

        log::info!("Dropped table {path:?}");
        Ok(())
    }
}

fn remove_if_exists(path: &Path) -> crate::Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{Column, ColumnType};
    use test_log::test;

    fn meta() -> crate::Result<Meta> {
        Meta::new(
            "accounts",
            vec![
                Column::new("id", ColumnType::Int64),
                Column::new("name", ColumnType::String).with_width(32),
            ],
            &["id"],
        )
    }

    #[test]
    fn apply_stamps_the_row_id() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let mut table = HashTable::open(dir.path().join("t.db"), meta()?, OpenMode::ReadWrite)?;

        let mut row = Row::new(vec![Value::Int64(1), Value::Str("alice".into())]);
        assert_eq!(0, table.apply(&mut row)?);
        assert_eq!(0, row.id);

        let mut row = Row::new(vec![Value::Int64(2), Value::Str("bob".into())]);
        assert_eq!(1, table.apply(&mut row)?);

        table.close()
    }

    #[test]
    fn apply_upserts_by_primary_key() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let mut table = HashTable::open(dir.path().join("t.db"), meta()?, OpenMode::ReadWrite)?;

        let mut first = Row::new(vec![Value::Int64(7), Value::Str("old".into())]);
        table.apply(&mut first)?;

        let mut second = Row::new(vec![Value::Int64(7), Value::Str("new".into())]);
        table.apply(&mut second)?;

        assert_eq!(first.id, second.id);
        assert_eq!(1, table.count());

        let read = table.read(first.id)?.ok_or(Error::Unsupported("row"))?;
        assert_eq!(Some(&Value::Str("new".into())), read.get(1));

        table.close()
    }

    #[test]
    fn apply_at_skips_the_index() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let mut table = HashTable::open(dir.path().join("t.db"), meta()?, OpenMode::ReadWrite)?;

        let mut row = Row::new(vec![Value::Int64(1), Value::Str("v1".into())]);
        let id = table.apply(&mut row)?;

        let mut patch = Row::new(vec![Value::Int64(1), Value::Str("v2".into())]);
        table.apply_at(id, &mut patch)?;

        let read = table.read(id)?.ok_or(Error::Unsupported("row"))?;
        assert_eq!(Some(&Value::Str("v2".into())), read.get(1));

        table.close()
    }

    #[test]
    fn delete_is_unsupported() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let mut table = HashTable::open(dir.path().join("t.db"), meta()?, OpenMode::ReadWrite)?;

        assert!(matches!(
            table.delete(0),
            Err(Error::Unsupported(_))
        ));

        table.close()
    }

    #[test]
    fn drop_table_removes_every_file() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("t.db");

        let meta = meta()?.with_wal(WalMode::Log);
        let mut table = HashTable::open(&path, meta, OpenMode::ReadWrite)?;

        let mut row = Row::new(vec![Value::Int64(1), Value::Str("x".into())]);
        table.apply(&mut row)?;
        table.drop_table()?;

        assert_eq!(0, std::fs::read_dir(dir.path())?.count());
        Ok(())
    }
}
