// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::coding::{DecodeError, EncodeError};
use byteorder::{ByteOrder, LittleEndian};

/// Little-endian view over an owned byte buffer.
///
/// Mirrors the classic position/limit cursor: relative accessors read or
/// write at `position` and advance it, absolute accessors take an explicit
/// offset and leave the cursor alone. `limit` marks the logical end of the
/// buffer; the backing allocation always spans the full capacity.
pub struct LeBuffer {
    data: Vec<u8>,
    position: usize,
    limit: usize,

    // Set for buffers that originate from an arena slice
    pub(crate) pooled: bool,
}

impl std::fmt::Debug for LeBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "LeBuffer(pos={}, limit={}, cap={})",
            self.position,
            self.limit,
            self.data.len(),
        )
    }
}

macro_rules! relative_get {
    ($name:ident, $t:ty, $width:literal, $read:expr) => {
        #[doc = concat!("Reads a little-endian `", stringify!($t), "` at the cursor.")]
        pub fn $name(&mut self) -> Result<$t, DecodeError> {
            let pos = self.position;
            self.check_get(pos, $width)?;
            self.position += $width;

            #[allow(clippy::indexing_slicing)]
            Ok($read(&self.data[pos..pos + $width]))
        }
    };
}

macro_rules! relative_put {
    ($name:ident, $t:ty, $width:literal, $write:expr) => {
        #[doc = concat!("Writes a little-endian `", stringify!($t), "` at the cursor.")]
        pub fn $name(&mut self, v: $t) -> Result<(), EncodeError> {
            let pos = self.position;
            self.check_put(pos, $width)?;
            self.position += $width;

            #[allow(clippy::indexing_slicing)]
            $write(&mut self.data[pos..pos + $width], v);

            Ok(())
        }
    };
}

impl LeBuffer {
    /// Creates a zeroed heap buffer of the given capacity.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: vec![0; capacity],
            position: 0,
            limit: capacity,
            pooled: false,
        }
    }

    pub(crate) fn from_pooled(data: Vec<u8>) -> Self {
        let limit = data.len();

        Self {
            data,
            position: 0,
            limit,
            pooled: true,
        }
    }

    /// Current cursor position.
    #[must_use]
    pub fn position(&self) -> usize {
        self.position
    }

    /// Moves the cursor.
    pub fn set_position(&mut self, pos: usize) {
        debug_assert!(pos <= self.limit);
        self.position = pos;
    }

    /// Logical end of the buffer.
    #[must_use]
    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Moves the logical end of the buffer.
    pub fn set_limit(&mut self, limit: usize) {
        debug_assert!(limit <= self.data.len());
        self.limit = limit.min(self.data.len());
        self.position = self.position.min(self.limit);
    }

    /// Full capacity of the backing allocation.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Bytes left between cursor and limit.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.limit.saturating_sub(self.position)
    }

    /// Whether any bytes are left to read or write.
    #[must_use]
    pub fn has_remaining(&self) -> bool {
        self.position < self.limit
    }

    /// Resets cursor and limit, keeping the bytes.
    pub fn clear(&mut self) {
        self.position = 0;
        self.limit = self.data.len();
    }

    /// Zeroes the backing bytes and resets cursor and limit.
    pub fn wipe(&mut self) {
        self.data.fill(0);
        self.clear();
    }

    /// Makes the written region readable: limit becomes the cursor, cursor rewinds.
    pub fn flip(&mut self) {
        self.limit = self.position;
        self.position = 0;
    }

    /// Rewinds the cursor without touching the limit.
    pub fn rewind(&mut self) {
        self.position = 0;
    }

    /// Read view of the region between cursor and limit.
    #[must_use]
    pub fn as_read_slice(&self) -> &[u8] {
        #[allow(clippy::indexing_slicing)]
        &self.data[self.position..self.limit]
    }

    /// Read view of everything up to the limit.
    #[must_use]
    pub fn filled(&self) -> &[u8] {
        #[allow(clippy::indexing_slicing)]
        &self.data[..self.limit]
    }

    pub(crate) fn into_inner(self) -> Vec<u8> {
        self.data
    }

    fn check_get(&self, pos: usize, width: usize) -> Result<(), DecodeError> {
        if pos + width > self.limit {
            return Err(DecodeError::UnexpectedEof);
        }
        Ok(())
    }

    fn check_put(&self, pos: usize, width: usize) -> Result<(), EncodeError> {
        if pos + width > self.limit {
            return Err(EncodeError::BufferFull {
                requested: width,
                remaining: self.limit.saturating_sub(pos),
            });
        }
        Ok(())
    }

    /// Reads a byte at the cursor.
    pub fn get_u8(&mut self) -> Result<u8, DecodeError> {
        let pos = self.position;
        self.check_get(pos, 1)?;
        self.position += 1;

        #[allow(clippy::indexing_slicing)]
        Ok(self.data[pos])
    }

    /// Writes a byte at the cursor.
    pub fn put_u8(&mut self, v: u8) -> Result<(), EncodeError> {
        let pos = self.position;
        self.check_put(pos, 1)?;
        self.position += 1;

        #[allow(clippy::indexing_slicing)]
        {
            self.data[pos] = v;
        }

        Ok(())
    }

    relative_get!(get_u16, u16, 2, LittleEndian::read_u16);
    relative_get!(get_i16, i16, 2, LittleEndian::read_i16);
    relative_get!(get_u32, u32, 4, LittleEndian::read_u32);
    relative_get!(get_i32, i32, 4, LittleEndian::read_i32);
    relative_get!(get_u64, u64, 8, LittleEndian::read_u64);
    relative_get!(get_i64, i64, 8, LittleEndian::read_i64);
    relative_get!(get_f32, f32, 4, LittleEndian::read_f32);
    relative_get!(get_f64, f64, 8, LittleEndian::read_f64);

    relative_put!(put_u16, u16, 2, LittleEndian::write_u16);
    relative_put!(put_i16, i16, 2, LittleEndian::write_i16);
    relative_put!(put_u32, u32, 4, LittleEndian::write_u32);
    relative_put!(put_i32, i32, 4, LittleEndian::write_i32);
    relative_put!(put_u64, u64, 8, LittleEndian::write_u64);
    relative_put!(put_i64, i64, 8, LittleEndian::write_i64);
    relative_put!(put_f32, f32, 4, LittleEndian::write_f32);
    relative_put!(put_f64, f64, 8, LittleEndian::write_f64);

    /// Reads a 3-byte little-endian unsigned integer at the cursor.
    pub fn get_u24(&mut self) -> Result<u32, DecodeError> {
        let mut raw = [0u8; 3];
        self.get_slice(&mut raw)?;
        Ok(u32::from(raw[0]) | (u32::from(raw[1]) << 8) | (u32::from(raw[2]) << 16))
    }

    /// Writes a 3-byte little-endian unsigned integer at the cursor.
    pub fn put_u24(&mut self, v: u32) -> Result<(), EncodeError> {
        debug_assert!(v < 1 << 24);
        self.put_slice(&[v as u8, (v >> 8) as u8, (v >> 16) as u8])
    }

    /// Reads `out.len()` bytes at the cursor.
    pub fn get_slice(&mut self, out: &mut [u8]) -> Result<(), DecodeError> {
        let pos = self.position;
        self.check_get(pos, out.len())?;
        self.position += out.len();

        #[allow(clippy::indexing_slicing)]
        out.copy_from_slice(&self.data[pos..pos + out.len()]);

        Ok(())
    }

    /// Writes the slice at the cursor.
    pub fn put_slice(&mut self, src: &[u8]) -> Result<(), EncodeError> {
        let pos = self.position;
        self.check_put(pos, src.len())?;
        self.position += src.len();

        #[allow(clippy::indexing_slicing)]
        self.data[pos..pos + src.len()].copy_from_slice(src);

        Ok(())
    }

    /// Reads a little-endian `u64` at an absolute offset.
    pub fn get_u64_at(&self, offset: usize) -> Result<u64, DecodeError> {
        if offset + 8 > self.data.len() {
            return Err(DecodeError::UnexpectedEof);
        }

        #[allow(clippy::indexing_slicing)]
        Ok(LittleEndian::read_u64(&self.data[offset..offset + 8]))
    }

    /// Writes a little-endian `u64` at an absolute offset.
    pub fn put_u64_at(&mut self, offset: usize, v: u64) -> Result<(), EncodeError> {
        if offset + 8 > self.data.len() {
            return Err(EncodeError::BufferFull {
                requested: 8,
                remaining: self.data.len().saturating_sub(offset),
            });
        }

        #[allow(clippy::indexing_slicing)]
        LittleEndian::write_u64(&mut self.data[offset..offset + 8], v);

        Ok(())
    }
}
