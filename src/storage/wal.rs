// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Write-ahead logging.
//!
//! The journal is itself a [`BlockFile`]; every record is one row of it.
//! A transaction is `BEGIN`, any number of data operations, then `COMMIT`
//! or `ROLLBACK`. Recovery replays data operations of committed
//! transactions in log order and discards everything else; a torn tail
//! record is dropped.

use crate::{
    coding::{Decode, DecodeError, Encode, EncodeError},
    storage::{BlockFile, Storage, StorageOptions},
    Error,
};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::{
    collections::HashSet,
    io::{Read, Write},
    path::Path,
};

/// Extension of the journal, appended to the data file name.
pub const WAL_SUFFIX: &str = ".wal";

/// First bytes of the journal's custom header.
const WAL_SIGNATURE: &[u8; 4] = b"WLOG";

/// Payload bytes per journal block; big records chain like any row.
const WAL_BLOCK_BYTES: usize = 256;

/// Operation code of a journal record.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum WalOp {
    /// Transaction start
    Begin,

    /// Fresh row stored
    Write,

    /// Row deleted
    Delete,

    /// Row overwritten
    Update,

    /// Transaction committed
    Commit,

    /// Transaction rolled back
    Rollback,

    /// Journal checkpoint
    Checkpoint,
}

impl From<WalOp> for u8 {
    fn from(value: WalOp) -> Self {
        match value {
            WalOp::Begin => 0x00,
            WalOp::Write => 0x01,
            WalOp::Delete => 0x02,
            WalOp::Update => 0x03,
            WalOp::Commit => 0x10,
            WalOp::Rollback => 0x11,
            WalOp::Checkpoint => 0x20,
        }
    }
}

impl TryFrom<u8> for WalOp {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(Self::Begin),
            0x01 => Ok(Self::Write),
            0x02 => Ok(Self::Delete),
            0x03 => Ok(Self::Update),
            0x10 => Ok(Self::Commit),
            0x11 => Ok(Self::Rollback),
            0x20 => Ok(Self::Checkpoint),
            _ => Err(()),
        }
    }
}

impl WalOp {
    fn is_data(self) -> bool {
        matches!(self, Self::Write | Self::Delete | Self::Update)
    }
}

/// One journal record.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct WalRecord {
    /// Operation
    pub op: WalOp,

    /// Transaction id
    pub tx: u64,

    /// Block id the operation touched
    pub page: u64,

    /// Operation images; layout depends on the op and the page-data flag
    pub payload: Vec<u8>,
}

impl Encode for WalRecord {
    fn encode_into<W: Write>(&self, writer: &mut W) -> Result<(), EncodeError> {
        writer.write_u8(u8::from(self.op))?;
        writer.write_u64::<LittleEndian>(self.tx)?;
        writer.write_u64::<LittleEndian>(self.page)?;

        let len = u32::try_from(self.payload.len()).map_err(|_| EncodeError::BufferFull {
            requested: self.payload.len(),
            remaining: u32::MAX as usize,
        })?;
        writer.write_u32::<LittleEndian>(len)?;
        writer.write_all(&self.payload)?;

        Ok(())
    }
}

impl Decode for WalRecord {
    fn decode_from<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
        let raw_op = reader.read_u8()?;
        let op = WalOp::try_from(raw_op)
            .map_err(|()| DecodeError::InvalidTag(("wal op", u16::from(raw_op))))?;

        let tx = reader.read_u64::<LittleEndian>()?;
        let page = reader.read_u64::<LittleEndian>()?;
        let len = reader.read_u32::<LittleEndian>()? as usize;

        let mut payload = vec![0u8; len];
        reader.read_exact(&mut payload)?;

        Ok(Self {
            op,
            tx,
            page,
            payload,
        })
    }
}

/// Hook invoked for every page a recovery replay touches, so the layer
/// above can drop stale cached state.
pub trait RedoCallback {
    /// A replayed operation touched `page`.
    ///
    /// # Errors
    ///
    /// An error aborts recovery.
    fn refresh(&mut self, page: u64) -> crate::Result<()>;
}

/// Callback that ignores every page.
pub struct NoopRedo;

impl RedoCallback for NoopRedo {
    fn refresh(&mut self, _page: u64) -> crate::Result<()> {
        Ok(())
    }
}

/// The journal.
pub struct Wal {
    file: BlockFile,
    next_tx: u64,
    open_tx: Option<u64>,
    pending: Vec<WalRecord>,
    page_data: bool,
}

impl Wal {
    /// Opens or creates the journal at `path`.
    ///
    /// `page_data` records before-images, enabling rollback and full
    /// UPDATE/DELETE recovery; an existing journal's stored flag wins.
    ///
    /// # Errors
    ///
    /// Propagates I/O errors; a foreign file is a corruption error.
    pub fn open<P: AsRef<Path>>(path: P, page_data: bool) -> crate::Result<Self> {
        let mut file = StorageOptions::new(path.as_ref())
            .block_data_bytes(WAL_BLOCK_BYTES)
            .open()?;

        let mut signature = [0u8; 5];
        file.custom_read(0, &mut signature)?;

        let page_data = if &signature[..4] == WAL_SIGNATURE {
            signature[4] == 1
        } else if signature[..4] == [0; 4] {
            file.custom_write(0, WAL_SIGNATURE)?;
            file.custom_write(4, &[u8::from(page_data)])?;
            page_data
        } else {
            return Err(Error::Corruption {
                path: path.as_ref().to_path_buf(),
                message: "not a journal file".into(),
            });
        };

        let mut wal = Self {
            file,
            next_tx: 1,
            open_tx: None,
            pending: Vec::new(),
            page_data,
        };

        let max_tx = wal
            .records()?
            .iter()
            .map(|r| r.tx)
            .max()
            .unwrap_or(0);
        wal.next_tx = max_tx + 1;

        Ok(wal)
    }

    /// Whether before-images are recorded.
    #[must_use]
    pub fn page_data(&self) -> bool {
        self.page_data
    }

    /// The transaction currently open, if any.
    #[must_use]
    pub fn open_tx(&self) -> Option<u64> {
        self.open_tx
    }

    /// Journal records so far.
    #[must_use]
    pub fn record_count(&self) -> u64 {
        self.file.count()
    }

    /// Journal size in bytes.
    #[must_use]
    pub fn bytes(&self) -> u64 {
        self.file.bytes()
    }

    /// Starts a transaction, returning its monotonically increasing id.
    ///
    /// # Errors
    ///
    /// A transaction is already open, or the append fails.
    pub fn begin(&mut self) -> crate::Result<u64> {
        if let Some(open) = self.open_tx {
            return Err(Error::Config(format!(
                "transaction {open} is still open"
            )));
        }

        let tx = self.next_tx;
        self.next_tx += 1;

        self.append(&WalRecord {
            op: WalOp::Begin,
            tx,
            page: 0,
            payload: Vec::new(),
        })?;

        self.open_tx = Some(tx);
        Ok(tx)
    }

    /// Appends a data record for the open transaction.
    ///
    /// # Errors
    ///
    /// Propagates append failures.
    pub fn append_op(
        &mut self,
        op: WalOp,
        tx: u64,
        page: u64,
        payload: Vec<u8>,
    ) -> crate::Result<()> {
        let record = WalRecord {
            op,
            tx,
            page,
            payload,
        };

        self.append(&record)?;

        if op.is_data() && self.open_tx == Some(tx) {
            self.pending.push(record);
        }

        Ok(())
    }

    fn append(&mut self, record: &WalRecord) -> crate::Result<()> {
        let bytes = record.encode_into_vec();
        self.file.write(&bytes)?;
        Ok(())
    }

    fn end_tx(&mut self, op: WalOp, tx: u64) -> crate::Result<()> {
        if self.open_tx != Some(tx) {
            return Err(Error::Config(format!("transaction {tx} is not open")));
        }

        self.append(&WalRecord {
            op,
            tx,
            page: 0,
            payload: Vec::new(),
        })?;

        // Commit durability lives here: the journal is flushed before the
        // caller proceeds
        self.file.sync()?;

        self.open_tx = None;
        Ok(())
    }

    /// Commits the transaction and flushes the journal.
    ///
    /// # Errors
    ///
    /// The transaction is not open, or the flush fails.
    pub fn commit(&mut self, tx: u64) -> crate::Result<()> {
        self.end_tx(WalOp::Commit, tx)?;
        self.pending.clear();
        Ok(())
    }

    /// Rolls the transaction back, undoing its operations on `inner`
    /// using the recorded before-images.
    ///
    /// # Errors
    ///
    /// Undoing UPDATE/DELETE without page data is unsupported.
    pub fn rollback(&mut self, tx: u64, inner: &mut dyn Storage) -> crate::Result<()> {
        self.end_tx(WalOp::Rollback, tx)?;

        let pending = std::mem::take(&mut self.pending);

        for record in pending.iter().rev() {
            match record.op {
                WalOp::Write => {
                    inner.delete(record.page)?;
                }
                WalOp::Update | WalOp::Delete => {
                    if !self.page_data {
                        return Err(Error::Unsupported(
                            "rollback of UPDATE/DELETE without walPageData",
                        ));
                    }

                    let (before, _) = split_images(&record.payload)?;
                    inner.write_at(record.page, before)?;
                }
                _ => {}
            }
        }

        inner.commit()?;
        Ok(())
    }

    /// All well-formed records, in log order.
    ///
    /// A torn record at the very tail is dropped with a warning; a
    /// malformed record followed by further records aborts with a
    /// corruption error.
    ///
    /// # Errors
    ///
    /// See above.
    pub fn records(&mut self) -> crate::Result<Vec<WalRecord>> {
        let mut records = Vec::new();
        let mut id = 0u64;

        loop {
            let Some(header) = self.file.header_of(id)? else {
                break;
            };

            if !header.is_live() {
                break;
            }

            if !header.is_row_head() {
                id += 1;
                continue;
            }

            let Some(bytes) = self.file.read(id)? else {
                id += 1;
                continue;
            };

            match WalRecord::decode_from(&mut bytes.as_slice()) {
                Ok(record) => records.push(record),
                Err(e) => {
                    if self.has_live_after(id)? {
                        return Err(Error::Corruption {
                            path: self.file.path().to_path_buf(),
                            message: format!("journal record at block {id}: {e}"),
                        });
                    }

                    log::warn!("Dropping torn journal tail at block {id}: {e}");
                    self.file.delete(id)?;
                    break;
                }
            }

            id += 1;
        }

        Ok(records)
    }

    fn has_live_after(&mut self, id: u64) -> crate::Result<bool> {
        let mut cursor = id + 1;

        while let Some(header) = self.file.header_of(cursor)? {
            if header.is_row_head() {
                return Ok(true);
            }
            if !header.is_live() {
                return Ok(false);
            }
            cursor += 1;
        }

        Ok(false)
    }

    /// Replays committed operations into `inner`, skipping everything
    /// uncommitted or rolled back. Idempotent.
    ///
    /// Returns the number of operations applied.
    ///
    /// # Errors
    ///
    /// Malformed journals and replay failures propagate.
    pub fn recover(
        &mut self,
        inner: &mut dyn Storage,
        callback: &mut dyn RedoCallback,
    ) -> crate::Result<usize> {
        let records = self.records()?;

        let committed: HashSet<u64> = records
            .iter()
            .filter(|r| r.op == WalOp::Commit)
            .map(|r| r.tx)
            .collect();

        let mut applied = 0usize;

        for record in &records {
            if !record.op.is_data() || !committed.contains(&record.tx) {
                continue;
            }

            match record.op {
                WalOp::Write => {
                    inner.write_at(record.page, &record.payload)?;
                }
                WalOp::Update => {
                    let (_, after) = if self.page_data {
                        split_images(&record.payload)?
                    } else {
                        (&[][..], &record.payload[..])
                    };
                    inner.write_at(record.page, after)?;
                }
                WalOp::Delete => {
                    inner.delete(record.page)?;
                }
                _ => unreachable!("only data ops reach the replay"),
            }

            callback.refresh(record.page)?;
            applied += 1;
        }

        if applied > 0 {
            // The header may predate the crash; rebuild the count from
            // the blocks themselves before committing it
            inner.recount()?;
            inner.commit()?;
            log::info!(
                "Recovered {applied} operations from {:?}",
                self.file.path()
            );
        }

        Ok(applied)
    }

    /// Truncates the journal if no transaction is open.
    ///
    /// Returns whether truncation happened.
    ///
    /// # Errors
    ///
    /// Propagates I/O errors.
    pub fn checkpoint(&mut self) -> crate::Result<bool> {
        if self.open_tx.is_some() {
            return Ok(false);
        }

        self.append(&WalRecord {
            op: WalOp::Checkpoint,
            tx: 0,
            page: 0,
            payload: Vec::new(),
        })?;
        self.file.sync()?;

        self.file.reset()?;
        self.pending.clear();
        Ok(true)
    }

    /// Flushes and closes the journal.
    ///
    /// # Errors
    ///
    /// Propagates I/O errors.
    pub fn close(&mut self) -> crate::Result<()> {
        self.file.close()
    }
}

/// Splits a page-data payload into before- and after-image.
fn split_images(payload: &[u8]) -> crate::Result<(&[u8], &[u8])> {
    if payload.len() < 4 {
        return Err(Error::Decode(DecodeError::UnexpectedEof));
    }

    #[allow(clippy::indexing_slicing)]
    let before_len = u32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]) as usize;

    let rest = payload.get(4..).unwrap_or(&[]);

    if before_len > rest.len() {
        return Err(Error::Decode(DecodeError::UnexpectedEof));
    }

    #[allow(clippy::indexing_slicing)]
    Ok((&rest[..before_len], &rest[before_len..]))
}

fn join_images(before: &[u8], after: &[u8]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(4 + before.len() + after.len());
    payload.extend_from_slice(&(before.len() as u32).to_le_bytes());
    payload.extend_from_slice(before);
    payload.extend_from_slice(after);
    payload
}

/// A storage that journals every mutation before handing it to the
/// wrapped storage.
///
/// Mutations outside an explicit transaction auto-commit.
pub struct WalStorage {
    inner: Box<super::AnyStorage>,
    wal: Wal,
}

impl WalStorage {
    /// Wraps `inner` with the journal.
    #[must_use]
    pub fn new(inner: super::AnyStorage, wal: Wal) -> Self {
        Self {
            inner: Box::new(inner),
            wal,
        }
    }

    /// The journal.
    #[must_use]
    pub fn wal(&self) -> &Wal {
        &self.wal
    }

    /// Starts a transaction.
    ///
    /// # Errors
    ///
    /// See [`Wal::begin`].
    pub fn begin(&mut self) -> crate::Result<u64> {
        self.wal.begin()
    }

    /// Commits a transaction.
    ///
    /// # Errors
    ///
    /// See [`Wal::commit`].
    pub fn commit_tx(&mut self, tx: u64) -> crate::Result<()> {
        self.wal.commit(tx)
    }

    /// Rolls a transaction back, undoing its mutations.
    ///
    /// # Errors
    ///
    /// See [`Wal::rollback`].
    pub fn rollback_tx(&mut self, tx: u64) -> crate::Result<()> {
        self.wal.rollback(tx, &mut *self.inner)
    }

    /// Replays committed journal records into the wrapped storage.
    ///
    /// # Errors
    ///
    /// See [`Wal::recover`].
    pub fn recover(&mut self, callback: &mut dyn RedoCallback) -> crate::Result<usize> {
        self.wal.recover(&mut *self.inner, callback)
    }

    /// Truncates the journal if possible.
    ///
    /// # Errors
    ///
    /// See [`Wal::checkpoint`].
    pub fn checkpoint(&mut self) -> crate::Result<bool> {
        self.wal.checkpoint()
    }

    fn tx_for_op(&mut self) -> crate::Result<(u64, bool)> {
        match self.wal.open_tx() {
            Some(tx) => Ok((tx, false)),
            None => Ok((self.wal.begin()?, true)),
        }
    }

    fn finish_op(&mut self, tx: u64, auto: bool) -> crate::Result<()> {
        if auto {
            self.wal.commit(tx)?;
        }
        Ok(())
    }
}

impl Storage for WalStorage {
    fn write(&mut self, payload: &[u8]) -> crate::Result<u64> {
        let (tx, auto) = self.tx_for_op()?;

        // The fresh block id is only known once the free chain assigns it
        let id = self.inner.write(payload)?;
        self.wal.append_op(WalOp::Write, tx, id, payload.to_vec())?;

        self.finish_op(tx, auto)?;
        Ok(id)
    }

    fn write_at(&mut self, id: u64, payload: &[u8]) -> crate::Result<()> {
        let (tx, auto) = self.tx_for_op()?;

        let record = if self.wal.page_data() {
            let before = self.inner.read(id)?.unwrap_or_default();
            join_images(&before, payload)
        } else {
            payload.to_vec()
        };

        self.wal.append_op(WalOp::Update, tx, id, record)?;
        self.inner.write_at(id, payload)?;

        self.finish_op(tx, auto)
    }

    fn read(&mut self, id: u64) -> crate::Result<Option<Vec<u8>>> {
        self.inner.read(id)
    }

    fn delete(&mut self, id: u64) -> crate::Result<bool> {
        let (tx, auto) = self.tx_for_op()?;

        let record = if self.wal.page_data() {
            self.inner.read(id)?.unwrap_or_default()
        } else {
            Vec::new()
        };

        self.wal.append_op(WalOp::Delete, tx, id, record)?;
        let deleted = self.inner.delete(id)?;

        self.finish_op(tx, auto)?;
        Ok(deleted)
    }

    fn custom_read(&self, offset: usize, out: &mut [u8]) -> crate::Result<()> {
        self.inner.custom_read(offset, out)
    }

    fn custom_write(&mut self, offset: usize, data: &[u8]) -> crate::Result<()> {
        self.inner.custom_write(offset, data)
    }

    fn count(&self) -> u64 {
        self.inner.count()
    }

    fn recount(&mut self) -> crate::Result<u64> {
        self.inner.recount()
    }

    fn bytes(&self) -> u64 {
        self.inner.bytes()
    }

    fn version(&self) -> u16 {
        self.inner.version()
    }

    fn status(&self) -> String {
        format!(
            "{} (wal: {} records, {} B)",
            self.inner.status(),
            self.wal.record_count(),
            self.wal.bytes(),
        )
    }

    fn commit(&mut self) -> crate::Result<()> {
        self.inner.commit()
    }

    fn sync(&mut self) -> crate::Result<()> {
        self.wal.file.sync()?;
        self.inner.sync()
    }

    fn close(&mut self) -> crate::Result<()> {
        self.wal.close()?;
        self.inner.close()
    }

    fn read_only(&self) -> bool {
        self.inner.read_only()
    }

    fn path(&self) -> &Path {
        self.inner.path()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::AnyStorage;
    use test_log::test;

    fn inner(dir: &Path) -> crate::Result<AnyStorage> {
        Ok(AnyStorage::Block(
            StorageOptions::new(dir.join("data.db"))
                .block_data_bytes(64)
                .open()?,
        ))
    }

    #[test]
    fn wal_record_round_trip() -> crate::Result<()> {
        let record = WalRecord {
            op: WalOp::Update,
            tx: 7,
            page: 42,
            payload: vec![1, 2, 3, 4],
        };

        let bytes = record.encode_into_vec();
        let back = WalRecord::decode_from(&mut bytes.as_slice()).map_err(Error::from)?;

        assert_eq!(record, back);
        Ok(())
    }

    #[test]
    fn truncated_record_is_an_error() {
        let record = WalRecord {
            op: WalOp::Write,
            tx: 1,
            page: 0,
            payload: vec![9; 100],
        };

        let bytes = record.encode_into_vec();
        let r = WalRecord::decode_from(&mut bytes[..bytes.len() - 1].as_ref());
        assert!(r.is_err());
    }

    #[test]
    fn auto_commit_journals_every_mutation() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let wal = Wal::open(dir.path().join("data.db.wal"), true)?;
        let mut storage = WalStorage::new(inner(dir.path())?, wal);

        let id = storage.write(b"alpha")?;
        storage.write_at(id, b"beta")?;

        assert_eq!(Some(b"beta".to_vec()), storage.read(id)?);

        // begin + write + commit, begin + update + commit
        assert_eq!(6, storage.wal().record_count());

        Ok(())
    }

    #[test]
    fn rollback_restores_before_images() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let wal = Wal::open(dir.path().join("data.db.wal"), true)?;
        let mut storage = WalStorage::new(inner(dir.path())?, wal);

        let keep = storage.write(b"keep")?;

        let tx = storage.begin()?;
        let gone = storage.write(b"gone")?;
        storage.write_at(keep, b"overwritten")?;
        storage.rollback_tx(tx)?;

        assert_eq!(Some(b"keep".to_vec()), storage.read(keep)?);
        assert_eq!(None, storage.read(gone)?);
        assert_eq!(1, storage.count());

        Ok(())
    }

    #[test]
    fn recovery_replays_only_committed_transactions() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;

        // Journal ten committed writes plus one uncommitted, against a
        // storage that is thrown away before its header ever syncs
        {
            let mut wal = Wal::open(dir.path().join("data.db.wal"), true)?;
            let mut scratch = inner(dir.path())?;

            for i in 0..10u64 {
                let tx = wal.begin()?;
                let id = scratch.write(format!("row {i}").as_bytes())?;
                wal.append_op(WalOp::Write, tx, id, format!("row {i}").into_bytes())?;
                wal.commit(tx)?;
            }

            let tx = wal.begin()?;
            wal.append_op(WalOp::Write, tx, 99, b"uncommitted".to_vec())?;
            wal.close()?;
            drop(scratch);
        }

        std::fs::remove_file(dir.path().join("data.db"))?;

        let mut wal = Wal::open(dir.path().join("data.db.wal"), true)?;
        let mut fresh = inner(dir.path())?;

        let applied = wal.recover(&mut fresh, &mut NoopRedo)?;
        assert_eq!(10, applied);
        assert_eq!(10, fresh.count());
        assert_eq!(Some(b"row 3".to_vec()), fresh.read(3)?);
        assert_eq!(None, fresh.read(99)?);

        // Replaying again changes nothing
        let applied = wal.recover(&mut fresh, &mut NoopRedo)?;
        assert_eq!(10, applied);
        assert_eq!(10, fresh.count());

        Ok(())
    }

    #[test]
    fn checkpoint_truncates_a_quiet_journal() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let wal = Wal::open(dir.path().join("data.db.wal"), false)?;
        let mut storage = WalStorage::new(inner(dir.path())?, wal);

        storage.write(b"x")?;
        assert!(storage.wal().record_count() > 0);

        assert!(storage.checkpoint()?);
        assert_eq!(0, storage.wal().record_count());

        let tx = storage.begin()?;
        storage.write(b"y")?;
        assert!(!storage.checkpoint()?);
        storage.commit_tx(tx)?;

        Ok(())
    }
}
