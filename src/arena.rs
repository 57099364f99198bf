// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{le_buffer::LeBuffer, Error};
use crossbeam::queue::ArrayQueue;
use std::sync::atomic::{AtomicBool, Ordering};

/// Pool of fixed-capacity byte buffers.
///
/// The arena preallocates `max_slices` buffers of `slice_bytes` each and
/// parks them in a lock-free queue. Borrowing never blocks: when the pool
/// is drained (or the request is oversized), an exact-size heap buffer is
/// handed out instead and simply dropped on return.
///
/// Returned buffers are zeroed before they are parked again, so a borrow
/// always observes a clean buffer.
pub struct BufferArena {
    slice_bytes: usize,
    pool: ArrayQueue<Vec<u8>>,
    drained_warning: AtomicBool,
}

impl BufferArena {
    /// Creates an arena of `max_slices` buffers of `slice_bytes` each.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::Config`] on non-positive sizes or if the total
    /// pool size overflows.
    pub fn new(slice_bytes: usize, max_slices: usize) -> crate::Result<Self> {
        if slice_bytes == 0 {
            return Err(Error::Config("arena slice size must be positive".into()));
        }
        if max_slices == 0 {
            return Err(Error::Config("arena slice count must be positive".into()));
        }
        if slice_bytes.checked_mul(max_slices).is_none() {
            return Err(Error::Config(format!(
                "arena total size overflows: {slice_bytes} x {max_slices}"
            )));
        }

        let pool = ArrayQueue::new(max_slices);

        for _ in 0..max_slices {
            // NOTE: Queue was sized for exactly this many buffers
            #[allow(clippy::expect_used)]
            pool.push(vec![0; slice_bytes]).expect("pool was just sized");
        }

        Ok(Self {
            slice_bytes,
            pool,
            drained_warning: AtomicBool::new(false),
        })
    }

    /// Size of each pooled buffer.
    #[must_use]
    pub fn slice_bytes(&self) -> usize {
        self.slice_bytes
    }

    /// Number of buffers currently parked.
    #[must_use]
    pub fn parked(&self) -> usize {
        self.pool.len()
    }

    /// Borrows a buffer of at least `requested` bytes, limit set to `requested`.
    ///
    /// Falls back to an exact-size heap allocation when the request exceeds
    /// the slice size or the pool is drained; such buffers are not re-pooled.
    #[must_use]
    pub fn borrow(&self, requested: usize) -> LeBuffer {
        if requested <= self.slice_bytes {
            if let Some(slice) = self.pool.pop() {
                let mut buf = LeBuffer::from_pooled(slice);
                buf.set_limit(requested);
                return buf;
            }

            if !self.drained_warning.swap(true, Ordering::Relaxed) {
                log::warn!(
                    "buffer arena drained, falling back to heap allocations ({requested} B)",
                );
            }
        }

        LeBuffer::with_capacity(requested)
    }

    /// Returns a borrowed buffer to the pool.
    ///
    /// Only buffers that came out of this pool (matching capacity) are
    /// accepted; everything else is dropped.
    pub fn give_back(&self, buf: LeBuffer) {
        if !buf.pooled || buf.capacity() != self.slice_bytes {
            return;
        }

        let mut slice = buf.into_inner();
        slice.fill(0);

        // Full pool: drop the extra buffer
        let _ = self.pool.push(slice);
    }

    /// Drops all parked buffers and refills the pool with fresh ones.
    pub fn clear(&self) {
        while self.pool.pop().is_some() {}

        while self.pool.push(vec![0; self.slice_bytes]).is_ok() {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn arena_borrow_and_return() -> crate::Result<()> {
        let arena = BufferArena::new(64, 4)?;
        assert_eq!(4, arena.parked());

        let buf = arena.borrow(10);
        assert_eq!(10, buf.limit());
        assert_eq!(64, buf.capacity());
        assert_eq!(3, arena.parked());

        arena.give_back(buf);
        assert_eq!(4, arena.parked());

        Ok(())
    }

    #[test]
    fn arena_oversized_request_bypasses_pool() -> crate::Result<()> {
        let arena = BufferArena::new(64, 2)?;

        let buf = arena.borrow(1000);
        assert_eq!(1000, buf.capacity());
        assert_eq!(2, arena.parked());

        // An oversized buffer is not accepted back
        arena.give_back(buf);
        assert_eq!(2, arena.parked());

        Ok(())
    }

    #[test]
    fn arena_drained_pool_falls_back() -> crate::Result<()> {
        let arena = BufferArena::new(16, 1)?;

        let first = arena.borrow(8);
        let second = arena.borrow(8);
        assert_eq!(0, arena.parked());
        assert_eq!(8, second.capacity());

        arena.give_back(first);
        arena.give_back(second);
        assert_eq!(1, arena.parked());

        Ok(())
    }

    #[test]
    fn arena_returned_buffers_are_zeroed() -> crate::Result<()> {
        let arena = BufferArena::new(8, 1)?;

        let mut buf = arena.borrow(8);
        buf.put_u64(u64::MAX).map_err(crate::Error::from)?;
        arena.give_back(buf);

        let mut buf = arena.borrow(8);
        assert_eq!(0, buf.get_u64().map_err(crate::Error::from)?);

        Ok(())
    }

    #[test]
    fn arena_rejects_bad_config() {
        assert!(BufferArena::new(0, 4).is_err());
        assert!(BufferArena::new(4, 0).is_err());
        assert!(BufferArena::new(usize::MAX, 2).is_err());
    }
}
