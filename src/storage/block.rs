// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! On-disk layout of a block file.
//!
//! ```text
//! [0, 256)            custom header (owned by the layer above)
//! [256, 512)          common header
//! [512, 512 + EXTRA)  extra header (index directories live here)
//! [512 + EXTRA, ...)  fixed-size block array
//! ```
//!
//! Every block is a 16-byte header plus `block_data_bytes` of payload.
//! Empty blocks thread a singly linked free chain through their `next`
//! fields, anchored at the common header's free-list head.

use crate::coding::DecodeError;
use byteorder::{ByteOrder, LittleEndian};

/// Bytes reserved for the custom header.
pub const CUSTOM_HEADER_BYTES: usize = 256;

/// File offset of the common header.
pub const COMMON_HEADER_OFFSET: usize = 256;

/// Bytes of custom plus common header.
pub const HEADER_BYTES: usize = 512;

/// Bytes of each block header.
pub const BLOCK_HEADER_BYTES: usize = 16;

/// Terminator of block chains and of the free list.
pub const NO_BLOCK: i64 = -1;

/// Block status: holds data.
pub const STATUS_LIVE: u8 = b'+';

/// Block status: empty, part of the free chain.
pub const STATUS_EMPTY: u8 = b'-';

/// Block mark: first block of a row.
pub const MARK_DATA: u8 = b'D';

/// Block mark: continuation of an overflowed row.
pub const MARK_CONT: u8 = b'N';

/// Block mark: never used.
pub const MARK_UNUSED: u8 = b'X';

/// Current block file format version.
pub const FORMAT_VERSION: u16 = 1;

/// Header of one block.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct BlockHeader {
    /// [`STATUS_LIVE`] or [`STATUS_EMPTY`]
    pub status: u8,

    /// [`MARK_DATA`], [`MARK_CONT`] or [`MARK_UNUSED`]
    pub mark: u8,

    /// Payload bytes stored in this block
    pub len_here: u16,

    /// Payload bytes of the whole row
    pub len_total: u32,

    /// Next block of the chain this block is on (row chain when live,
    /// free chain when empty), or [`NO_BLOCK`]
    pub next: i64,
}

impl BlockHeader {
    /// A never-used block whose free chain continues at `next`.
    #[must_use]
    pub fn unused(next: i64) -> Self {
        Self {
            status: STATUS_EMPTY,
            mark: MARK_UNUSED,
            len_here: 0,
            len_total: 0,
            next,
        }
    }

    /// Whether the block currently holds data.
    #[must_use]
    pub fn is_live(&self) -> bool {
        self.status == STATUS_LIVE
    }

    /// Whether the block is the first block of a row.
    #[must_use]
    pub fn is_row_head(&self) -> bool {
        self.is_live() && self.mark == MARK_DATA
    }

    /// Writes the header into the first 16 bytes of a block slice.
    pub fn write_to(&self, block: &mut [u8]) {
        debug_assert!(block.len() >= BLOCK_HEADER_BYTES);

        #[allow(clippy::indexing_slicing)]
        {
            block[0] = self.status;
            block[1] = self.mark;
            LittleEndian::write_u16(&mut block[2..4], self.len_here);
            LittleEndian::write_u32(&mut block[4..8], self.len_total);
            LittleEndian::write_i64(&mut block[8..16], self.next);
        }
    }

    /// Reads a header from the first 16 bytes of a block slice.
    ///
    /// # Errors
    ///
    /// Fails on a short slice or unrecognized status/mark bytes.
    pub fn read_from(block: &[u8]) -> Result<Self, DecodeError> {
        if block.len() < BLOCK_HEADER_BYTES {
            return Err(DecodeError::UnexpectedEof);
        }

        #[allow(clippy::indexing_slicing)]
        let header = Self {
            status: block[0],
            mark: block[1],
            len_here: LittleEndian::read_u16(&block[2..4]),
            len_total: LittleEndian::read_u32(&block[4..8]),
            next: LittleEndian::read_i64(&block[8..16]),
        };

        // A zeroed header is a block of a region the writer grew but never
        // initialized (crash between set_len and init); treat as unused
        if header.status == 0 && header.mark == 0 {
            return Ok(Self::unused(NO_BLOCK));
        }

        if !matches!(header.status, STATUS_LIVE | STATUS_EMPTY) {
            return Err(DecodeError::InvalidHeader("block status"));
        }
        if !matches!(header.mark, MARK_DATA | MARK_CONT | MARK_UNUSED) {
            return Err(DecodeError::InvalidHeader("block mark"));
        }

        Ok(header)
    }
}

/// The common header at offset 256.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct CommonHeader {
    /// Front of the free chain
    pub free_head: i64,

    /// Format version
    pub version: u16,

    /// Region (mmap) size in bytes
    pub increment: u32,

    /// Payload bytes per block
    pub block_data_bytes: u16,

    /// Live rows in the file
    pub row_count: u64,
}

impl CommonHeader {
    /// Serialized size of the common header.
    pub const SERIALIZED_LEN: usize = 64;

    /// Writes the header fields, the row count last.
    ///
    /// Rewriting is a plain store sequence: each field is written in
    /// little-endian order with the count as the final store, so a torn
    /// rewrite never yields a count ahead of the structure it counts.
    pub fn write_to(&self, out: &mut [u8]) {
        debug_assert!(out.len() >= Self::SERIALIZED_LEN);

        #[allow(clippy::indexing_slicing)]
        {
            LittleEndian::write_i64(&mut out[8..16], self.free_head);
            LittleEndian::write_u16(&mut out[24..26], self.version);
            LittleEndian::write_u32(&mut out[26..30], self.increment);
            LittleEndian::write_u16(&mut out[54..56], self.block_data_bytes);
            LittleEndian::write_u64(&mut out[56..64], self.row_count);
        }
    }

    /// Reads the header fields.
    ///
    /// # Errors
    ///
    /// Fails on a short slice.
    pub fn read_from(raw: &[u8]) -> Result<Self, DecodeError> {
        if raw.len() < Self::SERIALIZED_LEN {
            return Err(DecodeError::UnexpectedEof);
        }

        #[allow(clippy::indexing_slicing)]
        Ok(Self {
            free_head: LittleEndian::read_i64(&raw[8..16]),
            version: LittleEndian::read_u16(&raw[24..26]),
            increment: LittleEndian::read_u32(&raw[26..30]),
            block_data_bytes: LittleEndian::read_u16(&raw[54..56]),
            row_count: LittleEndian::read_u64(&raw[56..64]),
        })
    }
}
