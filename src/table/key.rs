// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Key resolution for the primary index.
//!
//! The hash file stores row ids and knows nothing about key bytes; these
//! adapters resolve an id to its row and hash/order the key column
//! values. Hashing runs xxh3 over the canonically encoded key values, so
//! a stored row and a synthetic probe row always agree.

use crate::{
    codec::RowCodec,
    index::{KeyOrder, KeyProbe},
    le_buffer::LeBuffer,
    row::Row,
    storage::{AnyStorage, Storage},
    Error,
};
use std::cmp::Ordering;

pub(crate) fn hash_key(
    codec: &RowCodec,
    key_positions: &[usize],
    row: &Row,
) -> crate::Result<u64> {
    let meta = codec.meta();

    let size: usize = key_positions
        .iter()
        .filter_map(|&p| meta.columns.get(p))
        .map(crate::schema::Column::encoded_cost)
        .sum();

    let mut buf = LeBuffer::with_capacity(size);

    for &p in key_positions {
        let column = meta
            .columns
            .get(p)
            .ok_or_else(|| Error::Format(format!("key position {p} is out of range")))?;
        let value = row
            .get(p)
            .ok_or_else(|| Error::Format(format!("row is missing key column {:?}", column.name)))?;

        codec.encode_value(column, value, &mut buf)?;
    }

    buf.flip();
    Ok(xxhash_rust::xxh3::xxh3_64(buf.as_read_slice()))
}

fn resolve(storage: &mut AnyStorage, codec: &RowCodec, key: i64) -> crate::Result<Row> {
    let id = u64::try_from(key).map_err(|_| Error::Corruption {
        path: storage.path().to_path_buf(),
        message: format!("index key {key} is negative"),
    })?;

    let bytes = storage.read(id)?.ok_or_else(|| Error::Corruption {
        path: storage.path().to_path_buf(),
        message: format!("index key {key} does not resolve to a row"),
    })?;

    let mut row = codec.parse(&bytes)?;
    row.id = key;
    Ok(row)
}

fn compare_keys(key_positions: &[usize], a: &Row, b: &Row) -> Ordering {
    for &p in key_positions {
        let (Some(left), Some(right)) = (a.get(p), b.get(p)) else {
            return Ordering::Equal;
        };

        let order = left.compare(right);
        if order != Ordering::Equal {
            return order;
        }
    }

    Ordering::Equal
}

/// Orders stored keys by resolving both sides to rows.
pub(crate) struct StoredOrder<'a> {
    pub storage: &'a mut AnyStorage,
    pub codec: &'a RowCodec,
    pub key_positions: &'a [usize],
}

impl KeyOrder for StoredOrder<'_> {
    fn hash_of(&mut self, key: i64) -> crate::Result<u64> {
        let row = resolve(self.storage, self.codec, key)?;
        hash_key(self.codec, self.key_positions, &row)
    }

    fn compare(&mut self, a: i64, b: i64) -> crate::Result<Ordering> {
        if a == b {
            return Ok(Ordering::Equal);
        }

        let left = resolve(self.storage, self.codec, a)?;
        let right = resolve(self.storage, self.codec, b)?;
        Ok(compare_keys(self.key_positions, &left, &right))
    }
}

/// Probes the index with an in-memory row that has no id yet.
pub(crate) struct RowProbe<'a> {
    pub row: &'a Row,
    pub storage: &'a mut AnyStorage,
    pub codec: &'a RowCodec,
    pub key_positions: &'a [usize],
}

impl KeyProbe for RowProbe<'_> {
    fn hash(&mut self) -> crate::Result<u64> {
        hash_key(self.codec, self.key_positions, self.row)
    }

    fn compare_to(&mut self, stored: i64) -> crate::Result<Ordering> {
        let right = resolve(self.storage, self.codec, stored)?;
        Ok(compare_keys(self.key_positions, self.row, &right))
    }
}
