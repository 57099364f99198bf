// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{
    arena::BufferArena,
    storage::{
        block::{
            BlockHeader, CommonHeader, BLOCK_HEADER_BYTES, COMMON_HEADER_OFFSET,
            CUSTOM_HEADER_BYTES, FORMAT_VERSION, HEADER_BYTES, MARK_DATA, NO_BLOCK, STATUS_LIVE,
        },
        StorageOptions,
    },
    Error,
};
use fs2::FileExt;
use lru::LruCache;
use memmap2::{Mmap, MmapMut, MmapOptions};
use std::{
    fs::File,
    io::{Read, Write},
    num::NonZeroUsize,
    path::{Path, PathBuf},
};

/// Mapped regions kept open at once; the eldest is flushed and unmapped.
const REGION_CACHE: usize = 16;

/// Assembly buffers for multi-block reads.
const ASSEMBLY_SLICES: usize = 8;

const COMMON_HEADER_RANGE: std::ops::Range<usize> =
    COMMON_HEADER_OFFSET..COMMON_HEADER_OFFSET + CommonHeader::SERIALIZED_LEN;

enum Region {
    Rw(MmapMut),
    Ro(Mmap),
}

impl Region {
    fn as_slice(&self) -> &[u8] {
        match self {
            Self::Rw(m) => m,
            Self::Ro(m) => m,
        }
    }

    fn as_mut_slice(&mut self) -> Option<&mut [u8]> {
        match self {
            Self::Rw(m) => Some(&mut m[..]),
            Self::Ro(_) => None,
        }
    }

    fn flush(&self) -> std::io::Result<()> {
        match self {
            Self::Rw(m) => m.flush(),
            Self::Ro(_) => Ok(()),
        }
    }
}

enum Backing {
    /// Memory-mapped file; data regions are mapped on demand
    Mapped {
        file: File,
        regions: LruCache<u64, Region>,
    },

    /// Heap regions; no file involved until [`BlockFile::transfer`]
    Memory { regions: Vec<Vec<u8>> },
}

enum Head {
    Mapped(Region),
    Memory(Vec<u8>),
}

/// The block-paged store: a fixed-block file (or heap image) with a free
/// chain, overflow chaining and an atomically rewritten common header.
///
/// A row's identity is the ordinal of its first block. All multi-byte
/// fields on disk are little-endian.
pub struct BlockFile {
    path: PathBuf,
    backing: Backing,
    head: Head,

    block_data_bytes: usize,
    block_bytes: u64,
    increment: u64,
    blocks_per_region: u64,
    extra_bytes: usize,
    data_start: u64,

    free_head: i64,
    row_count: u64,
    version: u16,

    read_only: bool,
    file_len: u64,

    dirty: u32,
    commit_interval: u32,

    arena: BufferArena,
}

impl BlockFile {
    /// Opens or creates a block file per the options.
    ///
    /// # Errors
    ///
    /// Invalid options fail with [`Error::Config`]; an existing file whose
    /// header disagrees with the options fails with [`Error::Corruption`];
    /// a second writer fails the advisory lock with [`Error::Io`].
    pub fn open(options: StorageOptions) -> crate::Result<Self> {
        let block_data_bytes = options.block_data_bytes;

        if block_data_bytes == 0 || block_data_bytes > usize::from(u16::MAX) {
            return Err(Error::Config(format!(
                "block data size {block_data_bytes} is out of range"
            )));
        }

        let block_bytes = (BLOCK_HEADER_BYTES + block_data_bytes) as u64;
        let increment = effective_increment(options.increment, block_bytes)?;
        let extra_bytes = options.extra_head_bytes;
        let data_start = (HEADER_BYTES + extra_bytes) as u64;

        let arena = BufferArena::new((block_bytes as usize) * 4, ASSEMBLY_SLICES)?;

        let mut this = Self {
            path: options.path.clone(),
            backing: Backing::Memory {
                regions: Vec::new(),
            },
            head: Head::Memory(Vec::new()),
            block_data_bytes,
            block_bytes,
            increment,
            blocks_per_region: increment / block_bytes,
            extra_bytes,
            data_start,
            free_head: 0,
            row_count: 0,
            version: FORMAT_VERSION,
            read_only: options.read_only,
            file_len: 0,
            dirty: 0,
            commit_interval: options.commit_interval.max(1),
            arena,
        };

        if options.in_memory {
            this.head = Head::Memory(vec![0; HEADER_BYTES + extra_bytes]);
            this.commit()?;
            return Ok(this);
        }

        let file = File::options()
            .read(true)
            .write(!options.read_only)
            .create(!options.read_only)
            .open(&options.path)?;

        if !options.read_only {
            file.try_lock_exclusive()?;
        }

        let len = file.metadata()?.len();
        this.file_len = len;

        if len < data_start {
            if options.read_only {
                return Err(Error::Corruption {
                    path: options.path,
                    message: format!("file is {len} bytes, header needs {data_start}"),
                });
            }

            file.set_len(data_start)?;
            this.file_len = data_start;
            this.head = Head::Mapped(map_region(&file, 0, data_start as usize, false)?);
            this.backing = Backing::Mapped {
                file,
                regions: new_region_cache(),
            };
            this.commit()?;

            log::debug!("Created block file {:?}", this.path);
        } else {
            this.head = Head::Mapped(map_region(
                &file,
                0,
                data_start as usize,
                options.read_only,
            )?);
            this.backing = Backing::Mapped {
                file,
                regions: new_region_cache(),
            };
            this.load_common_header()?;
        }

        Ok(this)
    }

    fn load_common_header(&mut self) -> crate::Result<()> {
        let raw = self
            .head_bytes()
            .get(COMMON_HEADER_RANGE)
            .ok_or_else(|| self.corruption("header page is truncated"))?;
        let header = CommonHeader::read_from(raw).map_err(Error::from)?;

        if header.version != FORMAT_VERSION {
            return Err(self.corruption(&format!(
                "format version {} is not supported",
                header.version
            )));
        }
        if usize::from(header.block_data_bytes) != self.block_data_bytes {
            return Err(self.corruption(&format!(
                "file has {}-byte blocks, options say {}",
                header.block_data_bytes, self.block_data_bytes
            )));
        }

        // The stored increment wins over the requested one
        if header.increment != 0 {
            let increment = u64::from(header.increment);
            if increment % self.block_bytes != 0 {
                return Err(self.corruption("stored increment is not a block multiple"));
            }
            self.increment = increment;
            self.blocks_per_region = increment / self.block_bytes;
        }

        self.free_head = header.free_head;
        self.row_count = header.row_count;
        self.version = header.version;

        Ok(())
    }

    fn corruption(&self, message: &str) -> Error {
        Error::Corruption {
            path: self.path.clone(),
            message: message.to_owned(),
        }
    }

    fn corruption_at(&self, id: u64, message: &str) -> Error {
        Error::Corruption {
            path: self.path.clone(),
            message: format!("block {id}: {message}"),
        }
    }

    /// Path of the backing file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether this store was opened read-only.
    #[must_use]
    pub fn read_only(&self) -> bool {
        self.read_only
    }

    /// Live rows in the store.
    #[must_use]
    pub fn count(&self) -> u64 {
        self.row_count
    }

    /// File (or heap image) size in bytes.
    #[must_use]
    pub fn bytes(&self) -> u64 {
        match &self.backing {
            Backing::Mapped { .. } => self.file_len,
            Backing::Memory { regions } => {
                self.data_start + regions.len() as u64 * self.increment
            }
        }
    }

    /// Format version from the common header.
    #[must_use]
    pub fn version(&self) -> u16 {
        self.version
    }

    /// Payload bytes per block.
    #[must_use]
    pub fn block_data_bytes(&self) -> usize {
        self.block_data_bytes
    }

    /// Front of the free chain.
    #[must_use]
    pub fn free_head(&self) -> i64 {
        self.free_head
    }

    /// One-line store summary.
    #[must_use]
    pub fn status(&self) -> String {
        format!(
            "{:?}: {} rows, {} B blocks, free head {}, {} B",
            self.path,
            self.row_count,
            self.block_bytes,
            self.free_head,
            self.bytes(),
        )
    }

    fn head_bytes(&self) -> &[u8] {
        match &self.head {
            Head::Mapped(region) => region.as_slice(),
            Head::Memory(v) => v,
        }
    }

    fn head_bytes_mut(&mut self) -> crate::Result<&mut [u8]> {
        match &mut self.head {
            Head::Mapped(region) => region.as_mut_slice().ok_or_else(|| {
                Error::Io(std::io::Error::new(
                    std::io::ErrorKind::PermissionDenied,
                    "store is read-only",
                ))
            }),
            Head::Memory(v) => Ok(v),
        }
    }

    /// Reads from the custom header region `[0, 256)`.
    ///
    /// # Errors
    ///
    /// Out-of-range access is a config error.
    pub fn custom_read(&self, offset: usize, out: &mut [u8]) -> crate::Result<()> {
        let end = offset + out.len();
        if end > CUSTOM_HEADER_BYTES {
            return Err(Error::Config(format!(
                "custom header access [{offset}, {end}) is out of range"
            )));
        }

        #[allow(clippy::indexing_slicing)]
        out.copy_from_slice(&self.head_bytes()[offset..end]);
        Ok(())
    }

    /// Writes into the custom header region `[0, 256)`.
    ///
    /// # Errors
    ///
    /// Out-of-range access is a config error; read-only stores reject it.
    pub fn custom_write(&mut self, offset: usize, data: &[u8]) -> crate::Result<()> {
        let end = offset + data.len();
        if end > CUSTOM_HEADER_BYTES {
            return Err(Error::Config(format!(
                "custom header access [{offset}, {end}) is out of range"
            )));
        }

        let head = self.head_bytes_mut()?;

        #[allow(clippy::indexing_slicing)]
        head[offset..end].copy_from_slice(data);
        Ok(())
    }

    /// Read view into the extra header region.
    ///
    /// # Errors
    ///
    /// Out-of-range access is a config error.
    pub fn extra_slice(&self, offset: usize, len: usize) -> crate::Result<&[u8]> {
        if offset + len > self.extra_bytes {
            return Err(Error::Config(format!(
                "extra header access [{offset}, {}) is out of range",
                offset + len
            )));
        }

        let start = HEADER_BYTES + offset;

        #[allow(clippy::indexing_slicing)]
        Ok(&self.head_bytes()[start..start + len])
    }

    /// Write view into the extra header region.
    ///
    /// # Errors
    ///
    /// Out-of-range access is a config error; read-only stores reject it.
    pub fn extra_slice_mut(&mut self, offset: usize, len: usize) -> crate::Result<&mut [u8]> {
        if offset + len > self.extra_bytes {
            return Err(Error::Config(format!(
                "extra header access [{offset}, {}) is out of range",
                offset + len
            )));
        }

        let start = HEADER_BYTES + offset;
        let head = self.head_bytes_mut()?;

        #[allow(clippy::indexing_slicing)]
        Ok(&mut head[start..start + len])
    }

    fn region_of(&self, id: u64) -> (u64, usize) {
        let absolute = id * self.block_bytes;
        (
            absolute / self.increment,
            (absolute % self.increment) as usize,
        )
    }

    /// Total blocks covered by materialized regions.
    fn materialized_blocks(&self) -> u64 {
        match &self.backing {
            Backing::Mapped { .. } => {
                self.file_len.saturating_sub(self.data_start) / self.block_bytes
            }
            Backing::Memory { regions } => regions.len() as u64 * self.blocks_per_region,
        }
    }

    /// Makes sure the region `r` is available.
    ///
    /// Returns `false` when the region does not exist and `create` is off.
    /// A freshly grown region gets every block pre-stitched `next = id+1`,
    /// so the free chain extends across region boundaries by construction.
    fn ensure_region(&mut self, r: u64, create: bool) -> crate::Result<bool> {
        let region_start = self.data_start + r * self.increment;
        let region_len = self.increment as usize;
        let first_id = r * self.blocks_per_region;

        match &mut self.backing {
            Backing::Mapped { file, regions } => {
                if regions.get(&r).is_some() {
                    return Ok(true);
                }

                let needed = region_start + self.increment;
                let grow = self.file_len < needed;

                if grow {
                    if !create {
                        return Ok(false);
                    }
                    if self.read_only {
                        return Err(Error::Io(std::io::Error::new(
                            std::io::ErrorKind::PermissionDenied,
                            "cannot grow a read-only store",
                        )));
                    }
                    if self.file_len > region_start {
                        return Err(Error::Corruption {
                            path: self.path.clone(),
                            message: format!("file ends mid-region at {}", self.file_len),
                        });
                    }

                    file.set_len(needed)?;
                    self.file_len = needed;
                }

                let mut region = map_region(file, region_start, region_len, self.read_only)?;

                if grow {
                    #[allow(clippy::expect_used)]
                    let bytes = region
                        .as_mut_slice()
                        .expect("a grown region is always writable");
                    stitch_blocks(bytes, first_id, self.blocks_per_region, self.block_bytes);
                }

                if let Some((_, evicted)) = regions.push(r, region) {
                    evicted.flush()?;
                }

                Ok(true)
            }
            Backing::Memory { regions } => {
                if (r as usize) < regions.len() {
                    return Ok(true);
                }
                if !create {
                    return Ok(false);
                }

                while regions.len() <= r as usize {
                    let mut bytes = vec![0u8; region_len];
                    let start_id = regions.len() as u64 * self.blocks_per_region;
                    stitch_blocks(&mut bytes, start_id, self.blocks_per_region, self.block_bytes);
                    regions.push(bytes);
                }

                Ok(true)
            }
        }
    }

    fn block_slice(&mut self, id: u64) -> crate::Result<Option<&[u8]>> {
        let (r, offset) = self.region_of(id);

        if !self.ensure_region(r, false)? {
            return Ok(None);
        }

        let block_bytes = self.block_bytes as usize;

        let region: &[u8] = match &mut self.backing {
            Backing::Mapped { regions, .. } => {
                #[allow(clippy::expect_used)]
                regions
                    .get(&r)
                    .expect("region was just ensured")
                    .as_slice()
            }
            Backing::Memory { regions } => {
                #[allow(clippy::expect_used)]
                regions.get(r as usize).expect("region was just ensured")
            }
        };

        #[allow(clippy::indexing_slicing)]
        Ok(Some(&region[offset..offset + block_bytes]))
    }

    fn block_slice_mut(&mut self, id: u64, create: bool) -> crate::Result<Option<&mut [u8]>> {
        let (r, offset) = self.region_of(id);

        if !self.ensure_region(r, create)? {
            return Ok(None);
        }

        let block_bytes = self.block_bytes as usize;

        let region: &mut [u8] = match &mut self.backing {
            Backing::Mapped { regions, .. } => {
                #[allow(clippy::expect_used)]
                let region = regions.get_mut(&r).expect("region was just ensured");

                region.as_mut_slice().ok_or_else(|| {
                    Error::Io(std::io::Error::new(
                        std::io::ErrorKind::PermissionDenied,
                        "store is read-only",
                    ))
                })?
            }
            Backing::Memory { regions } => {
                #[allow(clippy::expect_used)]
                regions.get_mut(r as usize).expect("region was just ensured")
            }
        };

        #[allow(clippy::indexing_slicing)]
        Ok(Some(&mut region[offset..offset + block_bytes]))
    }

    pub(crate) fn header_of(&mut self, id: u64) -> crate::Result<Option<BlockHeader>> {
        let path = self.path.clone();

        match self.block_slice(id)? {
            None => Ok(None),
            Some(block) => BlockHeader::read_from(block)
                .map(Some)
                .map_err(|e| Error::Corruption {
                    path,
                    message: format!("block {id}: {e}"),
                }),
        }
    }

    fn write_header(&mut self, id: u64, header: &BlockHeader) -> crate::Result<()> {
        let path = self.path.clone();

        let block = self
            .block_slice_mut(id, true)?
            .ok_or_else(|| err_at(path, id, "block vanished during write"))?;
        header.write_to(block);
        Ok(())
    }

    /// Pops the front of the free chain, materializing its region.
    fn allocate(&mut self) -> crate::Result<u64> {
        let limit = self.materialized_blocks() + self.blocks_per_region + 2;

        for _ in 0..limit {
            let id = u64::try_from(self.free_head)
                .map_err(|_| self.corruption("free chain is exhausted"))?;

            let (r, _) = self.region_of(id);
            self.ensure_region(r, true)?;

            let header = self
                .header_of(id)?
                .ok_or_else(|| self.corruption_at(id, "free chain points past the file"))?;

            self.free_head = header.next;

            if !header.is_live() {
                return Ok(id);
            }

            // A recovery write can steal a block out of the chain without
            // unthreading it; skip stale entries
        }

        Err(self.corruption("free chain does not terminate"))
    }

    /// Removes a specific block from the free chain.
    fn unlink_free(&mut self, id: u64) -> crate::Result<()> {
        let target = i64::try_from(id).map_err(|_| self.corruption("block id overflow"))?;

        if self.free_head == target {
            let header = self
                .header_of(id)?
                .ok_or_else(|| self.corruption_at(id, "free head points past the file"))?;
            self.free_head = header.next;
            return Ok(());
        }

        let limit = self.materialized_blocks() + self.blocks_per_region + 2;
        let mut prev = self.free_head;

        for _ in 0..limit {
            let prev_id = u64::try_from(prev)
                .map_err(|_| self.corruption_at(id, "not on the free chain"))?;
            let prev_header = self
                .header_of(prev_id)?
                .ok_or_else(|| self.corruption_at(id, "not on the free chain"))?;

            if prev_header.next == target {
                let header = self
                    .header_of(id)?
                    .ok_or_else(|| self.corruption_at(id, "free chain points past the file"))?;

                let mut relink = prev_header;
                relink.next = header.next;
                self.write_header(prev_id, &relink)?;
                return Ok(());
            }

            prev = prev_header.next;
        }

        Err(self.corruption_at(id, "not on the free chain"))
    }

    /// Blocks of the row chain starting at `head`.
    fn chain_of(&mut self, head: u64) -> crate::Result<Vec<u64>> {
        let mut ids = Vec::new();
        let mut cursor = i64::try_from(head).map_err(|_| self.corruption("block id overflow"))?;

        while cursor != NO_BLOCK {
            let id = u64::try_from(cursor)
                .map_err(|_| self.corruption_at(head, "chain pointer is negative"))?;

            if ids.contains(&id) {
                return Err(self.corruption_at(head, "chain is cyclic"));
            }

            let header = self
                .header_of(id)?
                .ok_or_else(|| self.corruption_at(id, "chain points past the file"))?;

            if !header.is_live() {
                return Err(self.corruption_at(id, "chain runs into an empty block"));
            }

            ids.push(id);
            cursor = header.next;
        }

        Ok(ids)
    }

    fn put_block(
        &mut self,
        id: u64,
        is_head: bool,
        data: &[u8],
        next: i64,
        len_total: u32,
    ) -> crate::Result<()> {
        debug_assert!(data.len() <= self.block_data_bytes);

        let header = BlockHeader {
            status: STATUS_LIVE,
            mark: if is_head { MARK_DATA } else { crate::storage::block::MARK_CONT },
            len_here: u16::try_from(data.len())
                .map_err(|_| self.corruption_at(id, "chunk exceeds the block size"))?,
            len_total,
            next,
        };

        let path = self.path.clone();

        let block = self
            .block_slice_mut(id, true)?
            .ok_or_else(|| err_at(path, id, "block vanished during write"))?;

        header.write_to(block);

        #[allow(clippy::indexing_slicing)]
        {
            let payload = &mut block[BLOCK_HEADER_BYTES..];
            payload[..data.len()].copy_from_slice(data);
            payload[data.len()..].fill(0);
        }

        Ok(())
    }

    /// Lays a payload over a chain: `reuse` blocks first, then the free
    /// chain. Surplus reused blocks are freed.
    fn write_chain(&mut self, first: u64, payload: &[u8], reuse: &[u64]) -> crate::Result<()> {
        let len_total = u32::try_from(payload.len())
            .map_err(|_| self.corruption_at(first, "payload exceeds 4 GiB"))?;

        let chunk_count = if payload.is_empty() {
            1
        } else {
            payload.len().div_ceil(self.block_data_bytes)
        };

        // Pick the block ids up front: head, then reused, then fresh
        let mut ids = Vec::with_capacity(chunk_count);
        ids.push(first);

        for i in 1..chunk_count {
            match reuse.get(i) {
                Some(id) => ids.push(*id),
                None => ids.push(self.allocate()?),
            }
        }

        for i in 0..ids.len() {
            let start = (i * self.block_data_bytes).min(payload.len());
            let end = payload.len().min(start + self.block_data_bytes);
            let next = ids.get(i + 1).map_or(NO_BLOCK, |id| *id as i64);

            #[allow(clippy::indexing_slicing)]
            self.put_block(ids[i], i == 0, &payload[start..end], next, len_total)?;
        }

        // Free what the old chain no longer needs
        for &surplus in reuse.get(chunk_count..).unwrap_or(&[]) {
            self.free_block(surplus)?;
        }

        Ok(())
    }

    fn free_block(&mut self, id: u64) -> crate::Result<()> {
        let next = self.free_head;
        let path = self.path.clone();

        let block = self
            .block_slice_mut(id, false)?
            .ok_or_else(|| err_at(path, id, "cannot free a block past the file"))?;

        block.fill(0);
        BlockHeader::unused(next).write_to(block);

        self.free_head = i64::try_from(id).map_err(|_| self.corruption("block id overflow"))?;
        Ok(())
    }

    /// Stores a payload in a fresh row, returning its id.
    ///
    /// # Errors
    ///
    /// Propagates I/O and corruption errors.
    pub fn write(&mut self, payload: &[u8]) -> crate::Result<u64> {
        let first = self.allocate()?;
        self.write_chain(first, payload, &[])?;

        self.row_count += 1;
        self.touch_commit()?;

        Ok(first)
    }

    /// Overwrites the row at `id` in place.
    ///
    /// Writing to an empty block claims it (recovery replays do this); the
    /// existing chain is reused and grown or shrunk as needed.
    ///
    /// # Errors
    ///
    /// Propagates I/O and corruption errors; a continuation block is not a
    /// valid target.
    pub fn write_at(&mut self, id: u64, payload: &[u8]) -> crate::Result<()> {
        let (r, _) = self.region_of(id);
        self.ensure_region(r, true)?;

        let header = self
            .header_of(id)?
            .ok_or_else(|| self.corruption_at(id, "write target past the file"))?;

        if header.is_live() {
            if header.mark != MARK_DATA {
                return Err(self.corruption_at(id, "write target is a continuation block"));
            }

            let reuse = self.chain_of(id)?;
            self.write_chain(id, payload, &reuse)?;
        } else {
            self.unlink_free(id)?;
            self.write_chain(id, payload, &[])?;
            self.row_count += 1;
        }

        self.touch_commit()
    }

    /// Reads the row at `id`.
    ///
    /// Returns `None` for ids that do not address a live row head; the
    /// returned buffer is an owned copy.
    ///
    /// # Errors
    ///
    /// Propagates I/O and corruption errors.
    pub fn read(&mut self, id: u64) -> crate::Result<Option<Vec<u8>>> {
        let Some(header) = self.header_of(id)? else {
            return Ok(None);
        };

        if !header.is_row_head() {
            return Ok(None);
        }

        if header.next == NO_BLOCK {
            return Ok(Some(self.chunk_of(id)?));
        }

        // Overflowed row: assemble through a pooled buffer, hand out a copy
        let total = header.len_total as usize;
        let chain = self.chain_of(id)?;

        let mut assembly = self.arena.borrow(total);
        let mut gathered = 0usize;

        for block_id in chain {
            let chunk = self.chunk_of(block_id)?;

            if assembly.put_slice(&chunk).is_err() {
                self.arena.give_back(assembly);
                return Err(self.corruption_at(block_id, "chain exceeds its total length"));
            }

            gathered += chunk.len();
        }

        if gathered != total {
            self.arena.give_back(assembly);
            return Err(self.corruption_at(id, "chain is shorter than its total length"));
        }

        assembly.flip();
        let out = assembly.as_read_slice().to_vec();
        self.arena.give_back(assembly);

        Ok(Some(out))
    }

    /// Copies the payload bytes stored in one block.
    fn chunk_of(&mut self, id: u64) -> crate::Result<Vec<u8>> {
        let path = self.path.clone();

        let block = self
            .block_slice(id)?
            .ok_or_else(|| err_at(path.clone(), id, "block vanished during read"))?;

        let header = BlockHeader::read_from(block)
            .map_err(|e| err_at(path, id, &e.to_string()))?;
        let len = usize::from(header.len_here);

        #[allow(clippy::indexing_slicing)]
        Ok(block[BLOCK_HEADER_BYTES..BLOCK_HEADER_BYTES + len].to_vec())
    }

    /// Deletes the row at `id`, wiping and freeing its whole chain.
    ///
    /// Returns `false` when the block is already empty or past the file.
    /// The head block ends up at the front of the free chain.
    ///
    /// # Errors
    ///
    /// Propagates I/O and corruption errors.
    pub fn delete(&mut self, id: u64) -> crate::Result<bool> {
        let Some(header) = self.header_of(id)? else {
            return Ok(false);
        };

        if !header.is_live() {
            return Ok(false);
        }

        let was_row = header.mark == MARK_DATA;
        let chain = self.chain_of(id)?;

        // Freeing back-to-front leaves the head block at the chain front
        for &block_id in chain.iter().rev() {
            self.free_block(block_id)?;
        }

        if was_row {
            self.row_count = self.row_count.saturating_sub(1);
        }

        self.touch_commit()?;
        Ok(true)
    }

    /// Stores a stream as a fresh row, chunking it block by block.
    ///
    /// # Errors
    ///
    /// Propagates I/O and corruption errors.
    pub fn write_stream(&mut self, reader: &mut dyn Read) -> crate::Result<u64> {
        let first = self.allocate()?;
        let mut ids = vec![first];

        let mut current = vec![0u8; self.block_data_bytes];
        let mut lookahead = vec![0u8; self.block_data_bytes];

        let mut current_len = read_full(reader, &mut current)?;
        let mut current_id = first;
        let mut total = current_len as u64;
        let mut index = 0usize;

        loop {
            let lookahead_len = read_full(reader, &mut lookahead)?;

            let next = if lookahead_len > 0 {
                let id = self.allocate()?;
                ids.push(id);
                i64::try_from(id).unwrap_or(NO_BLOCK)
            } else {
                NO_BLOCK
            };

            #[allow(clippy::indexing_slicing)]
            self.put_block(current_id, index == 0, &current[..current_len], next, 0)?;

            if next == NO_BLOCK {
                break;
            }

            std::mem::swap(&mut current, &mut lookahead);
            current_len = lookahead_len;
            current_id = u64::try_from(next).unwrap_or(0);
            total += lookahead_len as u64;
            index += 1;
        }

        // Backpatch the total length now that the stream has ended
        let len_total = u32::try_from(total)
            .map_err(|_| self.corruption_at(first, "stream exceeds 4 GiB"))?;

        for id in ids {
            if let Some(mut header) = self.header_of(id)? {
                header.len_total = len_total;
                self.write_header(id, &header)?;
            }
        }

        self.row_count += 1;
        self.touch_commit()?;

        Ok(first)
    }

    /// Opens a chunked reader over the row at `id`.
    ///
    /// # Errors
    ///
    /// Propagates I/O and corruption errors.
    pub fn read_stream(&mut self, id: u64) -> crate::Result<Option<StreamReader<'_>>> {
        match self.header_of(id)? {
            Some(header) if header.is_row_head() => Ok(Some(StreamReader {
                file: self,
                block: i64::try_from(id).unwrap_or(NO_BLOCK),
                offset: 0,
            })),
            _ => Ok(None),
        }
    }

    /// Recomputes the live-row count by scanning every materialized
    /// block, replacing whatever the header claimed.
    ///
    /// Recovery uses this: a crash can leave live blocks behind a stale
    /// header, and replaying onto them cannot tell a restored row from an
    /// already-present one.
    ///
    /// # Errors
    ///
    /// Propagates I/O and corruption errors.
    pub fn recount(&mut self) -> crate::Result<u64> {
        let mut count = 0u64;

        for id in 0..self.materialized_blocks() {
            if self.header_of(id)?.is_some_and(|h| h.is_row_head()) {
                count += 1;
            }
        }

        self.row_count = count;
        Ok(count)
    }

    /// Rewrites the common header; the row count is the final store.
    ///
    /// # Errors
    ///
    /// Read-only stores reject the write.
    pub fn commit(&mut self) -> crate::Result<()> {
        let header = CommonHeader {
            free_head: self.free_head,
            version: self.version,
            increment: u32::try_from(self.increment).unwrap_or(0),
            block_data_bytes: u16::try_from(self.block_data_bytes).unwrap_or(0),
            row_count: self.row_count,
        };

        let head = self.head_bytes_mut()?;

        #[allow(clippy::indexing_slicing)]
        header.write_to(&mut head[COMMON_HEADER_RANGE]);

        self.dirty = 0;
        Ok(())
    }

    fn touch_commit(&mut self) -> crate::Result<()> {
        self.dirty += 1;

        if self.dirty >= self.commit_interval {
            self.commit()?;
        }

        Ok(())
    }

    /// Flushes headers and mapped regions to disk.
    ///
    /// # Errors
    ///
    /// Propagates I/O errors.
    pub fn sync(&mut self) -> crate::Result<()> {
        if let Head::Mapped(region) = &self.head {
            region.flush()?;
        }

        if let Backing::Mapped { file, regions } = &mut self.backing {
            for (_, region) in regions.iter() {
                region.flush()?;
            }
            file.sync_all()?;
        }

        Ok(())
    }

    /// Forces a final header commit, flushes and unmaps everything.
    ///
    /// # Errors
    ///
    /// Propagates I/O errors.
    pub fn close(&mut self) -> crate::Result<()> {
        if !self.read_only {
            self.commit()?;
            self.sync()?;
        }

        if let Backing::Mapped { regions, .. } = &mut self.backing {
            regions.clear();
        }

        self.arena.clear();
        Ok(())
    }

    /// Empties the store: all blocks gone, counters reset.
    ///
    /// # Errors
    ///
    /// Propagates I/O errors; read-only stores reject it.
    pub fn reset(&mut self) -> crate::Result<()> {
        self.free_head = 0;
        self.row_count = 0;

        match &mut self.backing {
            Backing::Mapped { file, regions } => {
                regions.clear();
                file.set_len(self.data_start)?;
                self.file_len = self.data_start;
            }
            Backing::Memory { regions } => regions.clear(),
        }

        self.commit()
    }

    /// Appends the header page and every region to a destination file.
    ///
    /// This is how a memory-backed store becomes a file.
    ///
    /// # Errors
    ///
    /// Propagates I/O errors; mapped stores reject it.
    pub fn transfer(&mut self, dst: &mut File) -> crate::Result<()> {
        self.commit()?;

        let Backing::Memory { regions } = &self.backing else {
            return Err(Error::Unsupported("transfer of a file-backed store"));
        };

        dst.write_all(self.head_bytes())?;

        for region in regions {
            dst.write_all(region)?;
        }

        dst.sync_all()?;
        Ok(())
    }
}

/// Chunked reader over one row chain, yielding payload bytes in order.
pub struct StreamReader<'a> {
    file: &'a mut BlockFile,
    block: i64,
    offset: usize,
}

impl Read for StreamReader<'_> {
    fn read(&mut self, out: &mut [u8]) -> std::io::Result<usize> {
        loop {
            if self.block == NO_BLOCK || out.is_empty() {
                return Ok(0);
            }

            let id = u64::try_from(self.block)
                .map_err(|_| std::io::Error::other("negative block id"))?;

            let header = self
                .file
                .header_of(id)
                .map_err(std::io::Error::other)?
                .ok_or_else(|| std::io::Error::other("row chain points past the file"))?;

            let len = usize::from(header.len_here);

            if self.offset >= len {
                self.block = header.next;
                self.offset = 0;
                continue;
            }

            let n = out.len().min(len - self.offset);
            let start = BLOCK_HEADER_BYTES + self.offset;

            let block = self
                .file
                .block_slice(id)
                .map_err(std::io::Error::other)?
                .ok_or_else(|| std::io::Error::other("row chain points past the file"))?;

            #[allow(clippy::indexing_slicing)]
            out[..n].copy_from_slice(&block[start..start + n]);

            self.offset += n;
            return Ok(n);
        }
    }
}

fn err_at(path: PathBuf, id: u64, message: &str) -> Error {
    Error::Corruption {
        path,
        message: format!("block {id}: {message}"),
    }
}

fn new_region_cache() -> LruCache<u64, Region> {
    #[allow(clippy::expect_used)]
    LruCache::new(NonZeroUsize::new(REGION_CACHE).expect("capacity is nonzero"))
}

fn effective_increment(requested: u64, block_bytes: u64) -> crate::Result<u64> {
    const DEFAULT_REGION: u64 = 8 << 20;

    if requested == 0 {
        return Ok((DEFAULT_REGION / block_bytes).max(1) * block_bytes);
    }

    if requested % block_bytes != 0 {
        return Err(Error::Config(format!(
            "increment {requested} is not a multiple of the block size {block_bytes}"
        )));
    }
    if u32::try_from(requested).is_err() {
        return Err(Error::Config(format!("increment {requested} exceeds 4 GiB")));
    }

    Ok(requested)
}

#[allow(unsafe_code)]
fn map_region(file: &File, offset: u64, len: usize, read_only: bool) -> crate::Result<Region> {
    // SAFETY: each region is mapped exactly once and owned by this store;
    // slices handed out are reborrowed from the map and cannot outlive it
    let region = if read_only {
        Region::Ro(unsafe { MmapOptions::new().offset(offset).len(len).map(file)? })
    } else {
        Region::Rw(unsafe { MmapOptions::new().offset(offset).len(len).map_mut(file)? })
    };

    Ok(region)
}

/// Marks every block of a fresh region unused, each pointing at the next
/// id, the last one at the first block of the following region.
fn stitch_blocks(region: &mut [u8], first_id: u64, count: u64, block_bytes: u64) {
    for i in 0..count {
        let at = (i * block_bytes) as usize;
        let next = i64::try_from(first_id + i + 1).unwrap_or(NO_BLOCK);

        #[allow(clippy::indexing_slicing)]
        BlockHeader::unused(next).write_to(&mut region[at..at + BLOCK_HEADER_BYTES]);
    }
}

fn read_full(reader: &mut dyn Read, buf: &mut [u8]) -> crate::Result<usize> {
    let mut filled = 0;

    while filled < buf.len() {
        #[allow(clippy::indexing_slicing)]
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e.into()),
        }
    }

    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::StorageOptions;
    use test_log::test;

    fn small_options(path: &Path) -> StorageOptions {
        StorageOptions::new(path)
            .block_data_bytes(64)
            .increment((16 + 64) * 8)
    }

    #[test]
    fn block_round_trip() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let mut file = BlockFile::open(small_options(&dir.path().join("t.db")))?;

        let id = file.write(b"hello blocks")?;
        assert_eq!(Some(b"hello blocks".to_vec()), file.read(id)?);
        assert_eq!(1, file.count());

        Ok(())
    }

    #[test]
    fn chained_round_trip_spans_regions() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let mut file = BlockFile::open(small_options(&dir.path().join("t.db")))?;

        // 20 blocks worth of payload, regions hold 8 blocks
        let payload: Vec<u8> = (0..64 * 20).map(|i| (i % 251) as u8).collect();

        let id = file.write(&payload)?;
        assert_eq!(Some(payload.clone()), file.read(id)?);
        assert_eq!(1, file.count());

        // Continuations are not readable rows
        assert_eq!(None, file.read(id + 1)?);

        Ok(())
    }

    #[test]
    fn free_head_is_first_untouched_block() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let mut file = BlockFile::open(small_options(&dir.path().join("t.db")))?;

        for i in 0..5u64 {
            assert_eq!(i, file.write(b"x")?);
        }
        assert_eq!(5, file.free_head());

        Ok(())
    }

    #[test]
    fn delete_then_reuse_takes_the_freed_block() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let mut file = BlockFile::open(small_options(&dir.path().join("t.db")))?;

        let _a = file.write(b"a")?;
        let b = file.write(b"b")?;
        let _c = file.write(b"c")?;

        assert!(file.delete(b)?);
        assert!(!file.delete(b)?);
        assert_eq!(2, file.count());

        let d = file.write(b"d")?;
        assert_eq!(b, d);
        assert_eq!(3, file.count());

        Ok(())
    }

    #[test]
    fn overwrite_grows_and_shrinks_chains() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let mut file = BlockFile::open(small_options(&dir.path().join("t.db")))?;

        let id = file.write(b"short")?;

        let long: Vec<u8> = (0..200).map(|i| i as u8).collect();
        file.write_at(id, &long)?;
        assert_eq!(Some(long), file.read(id)?);

        file.write_at(id, b"short again")?;
        assert_eq!(Some(b"short again".to_vec()), file.read(id)?);
        assert_eq!(1, file.count());

        Ok(())
    }

    #[test]
    fn header_survives_reopen() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("t.db");

        {
            let mut file = BlockFile::open(small_options(&path))?;
            for _ in 0..10 {
                file.write(b"row")?;
            }
            file.delete(3)?;
            file.close()?;
        }

        {
            let mut file = BlockFile::open(small_options(&path))?;
            assert_eq!(9, file.count());
            assert_eq!(3, file.free_head());
            assert_eq!(Some(b"row".to_vec()), file.read(7)?);
            assert_eq!(None, file.read(3)?);
        }

        Ok(())
    }

    #[test]
    fn read_only_sees_flushed_state() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("t.db");

        {
            let mut file = BlockFile::open(small_options(&path))?;
            file.write(b"frozen")?;
            file.close()?;
        }

        let mut reader = BlockFile::open(small_options(&path).read_only(true))?;
        assert!(reader.read_only());
        assert_eq!(Some(b"frozen".to_vec()), reader.read(0)?);
        assert!(reader.write(b"nope").is_err());

        Ok(())
    }

    #[test]
    fn mismatched_block_size_is_corruption() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("t.db");

        {
            let mut file = BlockFile::open(small_options(&path))?;
            file.write(b"x")?;
            file.close()?;
        }

        let r = BlockFile::open(StorageOptions::new(&path).block_data_bytes(128));
        assert!(matches!(r, Err(Error::Corruption { .. })));

        Ok(())
    }

    #[test]
    fn memory_backing_and_transfer() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("mem.db");

        let mut mem = BlockFile::open(small_options(&path).in_memory(true))?;
        let id = mem.write(b"volatile")?;
        assert_eq!(Some(b"volatile".to_vec()), mem.read(id)?);

        let mut dst = File::create(&path)?;
        mem.transfer(&mut dst)?;
        drop(dst);

        let mut reopened = BlockFile::open(small_options(&path))?;
        assert_eq!(1, reopened.count());
        assert_eq!(Some(b"volatile".to_vec()), reopened.read(id)?);

        Ok(())
    }

    #[test]
    fn streams_round_trip() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let mut file = BlockFile::open(small_options(&dir.path().join("t.db")))?;

        let payload: Vec<u8> = (0..1000u32).map(|i| (i % 241) as u8).collect();

        let id = file.write_stream(&mut payload.as_slice())?;

        let mut out = Vec::new();
        file.read_stream(id)?
            .ok_or_else(|| Error::Unsupported("missing stream"))?
            .read_to_end(&mut out)?;

        assert_eq!(payload, out);
        assert_eq!(Some(payload), file.read(id)?);

        Ok(())
    }

    #[test]
    fn custom_and_extra_headers_are_separate() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let mut file = BlockFile::open(
            small_options(&dir.path().join("t.db")).extra_head_bytes(64),
        )?;

        file.custom_write(0, b"SIGN")?;
        file.extra_slice_mut(0, 4)?.copy_from_slice(b"DIRS");

        let mut sign = [0u8; 4];
        file.custom_read(0, &mut sign)?;
        assert_eq!(b"SIGN", &sign);
        assert_eq!(b"DIRS", file.extra_slice(0, 4)?);

        // writes land after the fixed 512-byte header
        let id = file.write(b"row")?;
        assert_eq!(Some(b"row".to_vec()), file.read(id)?);

        Ok(())
    }

    #[test]
    fn second_writer_is_locked_out() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("t.db");

        let _first = BlockFile::open(small_options(&path))?;
        let second = BlockFile::open(small_options(&path));

        assert!(matches!(second, Err(Error::Io(_))));
        Ok(())
    }
}
