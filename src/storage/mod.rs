// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Block-paged storage: the mmap/memory-backed [`BlockFile`], the
//! [`Storage`] capability set and the write-ahead-log wrapper.

pub mod block;
mod block_file;
pub mod wal;

pub use block_file::{BlockFile, StreamReader};
pub use wal::{NoopRedo, RedoCallback, Wal, WalStorage};

use enum_dispatch::enum_dispatch;
use std::path::{Path, PathBuf};

/// Options for opening a [`BlockFile`].
///
/// ```
/// # use flintdb::storage::StorageOptions;
/// # let dir = tempfile::tempdir()?;
/// let mut store = StorageOptions::new(dir.path().join("data.db"))
///     .block_data_bytes(4_000)
///     .open()?;
///
/// let id = store.write(b"first row")?;
/// assert_eq!(Some(b"first row".to_vec()), store.read(id)?);
/// # Ok::<(), flintdb::Error>(())
/// ```
#[derive(Clone, Debug)]
pub struct StorageOptions {
    pub(crate) path: PathBuf,
    pub(crate) block_data_bytes: usize,
    pub(crate) increment: u64,
    pub(crate) extra_head_bytes: usize,
    pub(crate) read_only: bool,
    pub(crate) in_memory: bool,
    pub(crate) commit_interval: u32,
}

impl StorageOptions {
    /// Starts options for the given data file path.
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            block_data_bytes: 4_000,
            increment: 0,
            extra_head_bytes: 0,
            read_only: false,
            in_memory: false,
            commit_interval: 1,
        }
    }

    /// Payload bytes per block (default 4000).
    #[must_use]
    pub fn block_data_bytes(mut self, bytes: usize) -> Self {
        self.block_data_bytes = bytes;
        self
    }

    /// Region size in bytes; must be a positive block multiple.
    /// 0 picks a default of roughly 8 MiB.
    #[must_use]
    pub fn increment(mut self, bytes: u64) -> Self {
        self.increment = bytes;
        self
    }

    /// Bytes of caller-owned header between the common header and the
    /// block array (index directories live here).
    #[must_use]
    pub fn extra_head_bytes(mut self, bytes: usize) -> Self {
        self.extra_head_bytes = bytes;
        self
    }

    /// Opens without the writer lock; mutations are rejected.
    #[must_use]
    pub fn read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    /// Backs the store with heap regions instead of a file.
    #[must_use]
    pub fn in_memory(mut self, in_memory: bool) -> Self {
        self.in_memory = in_memory;
        self
    }

    /// Mutations between header commits (default 1: commit every
    /// mutation). Raise for batch loads; close always commits.
    #[must_use]
    pub fn commit_interval(mut self, interval: u32) -> Self {
        self.commit_interval = interval;
        self
    }

    /// Opens the block file.
    ///
    /// # Errors
    ///
    /// See [`BlockFile::open`].
    pub fn open(self) -> crate::Result<BlockFile> {
        BlockFile::open(self)
    }
}

/// Capability set of a block store.
///
/// Two shapes implement this: the plain [`BlockFile`] (mmap or memory
/// backed) and the [`WalStorage`] wrapper that journals every mutation
/// before handing it down.
#[enum_dispatch]
pub trait Storage {
    /// Stores a payload in a fresh row, returning its id.
    fn write(&mut self, payload: &[u8]) -> crate::Result<u64>;

    /// Overwrites the row at `id` in place.
    fn write_at(&mut self, id: u64, payload: &[u8]) -> crate::Result<()>;

    /// Reads the row at `id`; `None` when the block holds no row.
    fn read(&mut self, id: u64) -> crate::Result<Option<Vec<u8>>>;

    /// Deletes the row at `id`; `false` when already empty.
    fn delete(&mut self, id: u64) -> crate::Result<bool>;

    /// Reads from the custom header region `[0, 256)`.
    fn custom_read(&self, offset: usize, out: &mut [u8]) -> crate::Result<()>;

    /// Writes into the custom header region `[0, 256)`.
    fn custom_write(&mut self, offset: usize, data: &[u8]) -> crate::Result<()>;

    /// Live rows.
    fn count(&self) -> u64;

    /// Recomputes the live-row count by scanning blocks.
    fn recount(&mut self) -> crate::Result<u64>;

    /// Store size in bytes.
    fn bytes(&self) -> u64;

    /// Format version.
    fn version(&self) -> u16;

    /// One-line store summary.
    fn status(&self) -> String;

    /// Rewrites the common header.
    fn commit(&mut self) -> crate::Result<()>;

    /// Flushes everything to disk.
    fn sync(&mut self) -> crate::Result<()>;

    /// Final commit, flush and unmap.
    fn close(&mut self) -> crate::Result<()>;

    /// Whether mutations are rejected.
    fn read_only(&self) -> bool;

    /// Path of the backing file.
    fn path(&self) -> &Path;
}

impl Storage for BlockFile {
    fn write(&mut self, payload: &[u8]) -> crate::Result<u64> {
        BlockFile::write(self, payload)
    }

    fn write_at(&mut self, id: u64, payload: &[u8]) -> crate::Result<()> {
        BlockFile::write_at(self, id, payload)
    }

    fn read(&mut self, id: u64) -> crate::Result<Option<Vec<u8>>> {
        BlockFile::read(self, id)
    }

    fn delete(&mut self, id: u64) -> crate::Result<bool> {
        BlockFile::delete(self, id)
    }

    fn custom_read(&self, offset: usize, out: &mut [u8]) -> crate::Result<()> {
        BlockFile::custom_read(self, offset, out)
    }

    fn custom_write(&mut self, offset: usize, data: &[u8]) -> crate::Result<()> {
        BlockFile::custom_write(self, offset, data)
    }

    fn count(&self) -> u64 {
        BlockFile::count(self)
    }

    fn recount(&mut self) -> crate::Result<u64> {
        BlockFile::recount(self)
    }

    fn bytes(&self) -> u64 {
        BlockFile::bytes(self)
    }

    fn version(&self) -> u16 {
        BlockFile::version(self)
    }

    fn status(&self) -> String {
        BlockFile::status(self)
    }

    fn commit(&mut self) -> crate::Result<()> {
        BlockFile::commit(self)
    }

    fn sync(&mut self) -> crate::Result<()> {
        BlockFile::sync(self)
    }

    fn close(&mut self) -> crate::Result<()> {
        BlockFile::close(self)
    }

    fn read_only(&self) -> bool {
        BlockFile::read_only(self)
    }

    fn path(&self) -> &Path {
        BlockFile::path(self)
    }
}

/// A storage of either shape.
#[enum_dispatch(Storage)]
pub enum AnyStorage {
    /// Plain block file, mmap or memory backed
    Block(BlockFile),

    /// Journaling wrapper around another storage
    Wal(WalStorage),
}
