// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! An embedded single-writer/multi-reader table store.
//!
//! Tables carry a typed schema, a hash primary index and persist as
//! fixed-size block files backed by memory-mapped I/O (or purely in
//! memory), with optional write-ahead logging.
//!
//! The pieces, bottom up:
//!
//! - [`BufferArena`]: a lock-free pool of fixed-capacity buffers
//! - [`LeBuffer`]: a little-endian position/limit cursor
//! - [`schema`]: columns, typed values, schema metadata and the text
//!   sidecar they persist in
//! - [`RowCodec`]: the self-describing row wire format
//! - [`storage`]: the block-paged store with a free chain, overflow
//!   chaining, crash-consistent header commits and the WAL wrapper
//! - [`index`]: the disk-resident hash primary index
//! - [`HashTable`]: the table surface composing all of the above
//!
//! # Example
//!
//! ```
//! use flintdb::{HashTable, OpenMode, Row};
//! use flintdb::schema::{Column, ColumnType, Meta, Value};
//! #
//! # let dir = tempfile::tempdir()?;
//!
//! let meta = Meta::new(
//!     "accounts",
//!     vec![
//!         Column::new("id", ColumnType::Int64),
//!         Column::new("name", ColumnType::String).with_width(32),
//!         Column::decimal("amount", 18, 2),
//!     ],
//!     &["id"],
//! )?;
//!
//! let mut table = HashTable::open(dir.path().join("accounts.db"), meta, OpenMode::ReadWrite)?;
//!
//! let mut row = Row::new(vec![
//!     Value::Int64(1),
//!     Value::Str("alice".into()),
//!     Value::Str("12.50".into()), // cast to DECIMAL(18,2) on the way in
//! ]);
//! table.apply(&mut row)?;
//!
//! let hit = table.one(0, &[("id", Value::Int64(1))])?;
//! assert!(hit.is_some());
//!
//! table.close()?;
//! # Ok::<(), flintdb::Error>(())
//! ```

#![doc(html_logo_url = "https://raw.githubusercontent.com/fillmemory/flintdb-rs/main/logo.png")]
#![warn(unsafe_code)]
#![warn(clippy::all, clippy::cargo, clippy::pedantic)]
#![warn(missing_docs)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]
#![warn(clippy::indexing_slicing)]
#![allow(clippy::missing_const_for_fn)]
#![allow(clippy::multiple_crate_versions)]
#![allow(clippy::option_if_let_else)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_possible_wrap)]
#![allow(clippy::module_name_repetitions)]

mod arena;
mod cache;
mod codec;
mod coding;
mod error;
mod le_buffer;
mod row;
mod table;

pub mod index;
pub mod schema;
pub mod storage;

pub use arena::BufferArena;
pub use cache::RowCache;
pub use codec::RowCodec;
pub use coding::{Decode, DecodeError, Encode, EncodeError};
pub use error::{Error, Result};
pub use le_buffer::LeBuffer;
pub use row::{Row, UNASSIGNED};
pub use table::{HashTable, OpenMode};
