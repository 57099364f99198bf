// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::coding::DecodeError;
use byteorder::{ByteOrder, LittleEndian};

/// Serialized size of both node kinds.
pub const NODE_BYTES: usize = 14 * 8;

/// Leaf slots per internal node.
pub const INTERNAL_MAX: usize = 12;

/// Keys per leaf node.
pub const LEAF_MAX: usize = 14;

/// Null node reference. Nodes are addressed by absolute file offset and
/// the node body starts after the headers, so 0 never names a node.
pub const NO_NODE: i64 = 0;

/// Terminator of a partially filled leaf's key array.
const KEY_END: i64 = -1;

/// Inner node of a bucket: a doubly linked chain member indexing up to
/// [`INTERNAL_MAX`] leaves in key order.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Internal {
    /// Left neighbor in the bucket chain, or [`NO_NODE`]
    pub prev: i64,

    /// Right neighbor in the bucket chain, or [`NO_NODE`]
    pub next: i64,

    /// Leaf offsets, in key order
    pub leaves: Vec<i64>,
}

impl Internal {
    /// A chain-less internal holding one leaf.
    #[must_use]
    pub fn solo(leaf: i64) -> Self {
        Self {
            prev: NO_NODE,
            next: NO_NODE,
            leaves: vec![leaf],
        }
    }

    /// Whether no more leaves fit.
    #[must_use]
    pub fn is_full(&self) -> bool {
        self.leaves.len() >= INTERNAL_MAX
    }

    /// Serializes into a node-sized buffer.
    #[must_use]
    pub fn encode(&self) -> [u8; NODE_BYTES] {
        debug_assert!(self.leaves.len() <= INTERNAL_MAX);

        let mut raw = [0u8; NODE_BYTES];
        LittleEndian::write_i64(&mut raw[0..8], self.prev);
        LittleEndian::write_i64(&mut raw[8..16], self.next);

        for (i, leaf) in self.leaves.iter().enumerate().take(INTERNAL_MAX) {
            let at = 16 + i * 8;

            #[allow(clippy::indexing_slicing)]
            LittleEndian::write_i64(&mut raw[at..at + 8], *leaf);
        }

        raw
    }

    /// Deserializes from a node-sized buffer.
    ///
    /// # Errors
    ///
    /// Fails on a short buffer or an internal without leaves.
    pub fn decode(raw: &[u8]) -> Result<Self, DecodeError> {
        if raw.len() < NODE_BYTES {
            return Err(DecodeError::UnexpectedEof);
        }

        #[allow(clippy::indexing_slicing)]
        let (prev, next) = (
            LittleEndian::read_i64(&raw[0..8]),
            LittleEndian::read_i64(&raw[8..16]),
        );

        let mut leaves = Vec::new();

        for i in 0..INTERNAL_MAX {
            let at = 16 + i * 8;

            #[allow(clippy::indexing_slicing)]
            let leaf = LittleEndian::read_i64(&raw[at..at + 8]);

            if leaf == NO_NODE {
                break;
            }
            leaves.push(leaf);
        }

        if leaves.is_empty() {
            return Err(DecodeError::InvalidHeader("internal node without leaves"));
        }

        Ok(Self { prev, next, leaves })
    }
}

/// Leaf node: up to [`LEAF_MAX`] keys, kept sorted by the caller's
/// comparator, terminated by `-1` when not full.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Leaf {
    /// Sorted keys
    pub keys: Vec<i64>,
}

impl Leaf {
    /// A leaf holding one key.
    #[must_use]
    pub fn solo(key: i64) -> Self {
        Self { keys: vec![key] }
    }

    /// Whether no more keys fit.
    #[must_use]
    pub fn is_full(&self) -> bool {
        self.keys.len() >= LEAF_MAX
    }

    /// Serializes into a node-sized buffer.
    #[must_use]
    pub fn encode(&self) -> [u8; NODE_BYTES] {
        debug_assert!(self.keys.len() <= LEAF_MAX);

        let mut raw = [0u8; NODE_BYTES];

        for (i, key) in self.keys.iter().enumerate().take(LEAF_MAX) {
            let at = i * 8;

            #[allow(clippy::indexing_slicing)]
            LittleEndian::write_i64(&mut raw[at..at + 8], *key);
        }

        if self.keys.len() < LEAF_MAX {
            let at = self.keys.len() * 8;

            #[allow(clippy::indexing_slicing)]
            LittleEndian::write_i64(&mut raw[at..at + 8], KEY_END);
        }

        raw
    }

    /// Deserializes from a node-sized buffer.
    ///
    /// # Errors
    ///
    /// Fails on a short buffer or a leaf without keys.
    pub fn decode(raw: &[u8]) -> Result<Self, DecodeError> {
        if raw.len() < NODE_BYTES {
            return Err(DecodeError::UnexpectedEof);
        }

        let mut keys = Vec::new();

        for i in 0..LEAF_MAX {
            let at = i * 8;

            #[allow(clippy::indexing_slicing)]
            let key = LittleEndian::read_i64(&raw[at..at + 8]);

            if key == KEY_END {
                break;
            }
            keys.push(key);
        }

        if keys.is_empty() {
            return Err(DecodeError::InvalidHeader("leaf node without keys"));
        }

        Ok(Self { keys })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn internal_round_trip() -> Result<(), DecodeError> {
        let node = Internal {
            prev: 512,
            next: 1024,
            leaves: vec![2048, 4096, 8192],
        };

        assert_eq!(node, Internal::decode(&node.encode())?);
        Ok(())
    }

    #[test]
    fn full_internal_round_trip() -> Result<(), DecodeError> {
        let node = Internal {
            prev: NO_NODE,
            next: NO_NODE,
            leaves: (1..=INTERNAL_MAX as i64).map(|i| i * 128).collect(),
        };

        let back = Internal::decode(&node.encode())?;
        assert_eq!(INTERNAL_MAX, back.leaves.len());
        assert_eq!(node, back);
        Ok(())
    }

    #[test]
    fn leaf_round_trip_with_terminator() -> Result<(), DecodeError> {
        // Key 0 is a legal row id and must survive
        let leaf = Leaf {
            keys: vec![0, 3, 9],
        };

        assert_eq!(leaf, Leaf::decode(&leaf.encode())?);
        Ok(())
    }

    #[test]
    fn full_leaf_round_trip() -> Result<(), DecodeError> {
        let leaf = Leaf {
            keys: (0..LEAF_MAX as i64).collect(),
        };

        let back = Leaf::decode(&leaf.encode())?;
        assert_eq!(LEAF_MAX, back.keys.len());
        assert_eq!(leaf, back);
        Ok(())
    }

    #[test]
    fn empty_nodes_are_rejected() {
        assert!(Internal::decode(&[0u8; NODE_BYTES]).is_err());
        assert!(Leaf::decode(&Leaf { keys: vec![] }.encode()).is_err());
    }
}
