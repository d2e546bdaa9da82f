/*
 * apkzip v1.0.0
 * Copyright (c) 2026 Tiash H Kabir / @MrCarb0n.
 * Licensed under the MIT License.
 */

//! Accounting of the byte buffers held alive while an archive is rewritten.
//!
//! Every buffer handed to a compressor, every compressed result and every
//! entry read back for relocation is wrapped in a [`TrackedBytes`]. The
//! owning [`ByteTracker`] counts the bytes currently alive and remembers the
//! high-water mark, so a packaging session can report how much memory an
//! incremental rewrite needed.

use std::io::Read;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Counts bytes held by live [`TrackedBytes`] buffers.
#[derive(Debug, Default)]
pub struct ByteTracker {
    used: AtomicU64,
    max_used: AtomicU64,
}

impl ByteTracker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Take ownership of `data` and account for it until the buffer drops.
    pub fn from_vec(self: &Arc<Self>, data: Vec<u8>) -> TrackedBytes {
        let len = data.len() as u64;
        let now = self.used.fetch_add(len, Ordering::AcqRel) + len;
        self.max_used.fetch_max(now, Ordering::AcqRel);
        TrackedBytes {
            data,
            tracker: Arc::clone(self),
        }
    }

    pub fn from_slice(self: &Arc<Self>, data: &[u8]) -> TrackedBytes {
        self.from_vec(data.to_vec())
    }

    /// Drain `reader` into a tracked buffer.
    pub fn from_reader<R: Read>(self: &Arc<Self>, reader: &mut R) -> std::io::Result<TrackedBytes> {
        let mut data = Vec::new();
        reader.read_to_end(&mut data)?;
        Ok(self.from_vec(data))
    }

    /// Bytes currently held by live buffers.
    pub fn bytes_used(&self) -> u64 {
        self.used.load(Ordering::Acquire)
    }

    /// Largest value [`bytes_used`](Self::bytes_used) has reached.
    pub fn max_bytes_used(&self) -> u64 {
        self.max_used.load(Ordering::Acquire)
    }

    fn release(&self, len: u64) {
        self.used.fetch_sub(len, Ordering::AcqRel);
    }
}

/// A byte buffer accounted for by a [`ByteTracker`].
pub struct TrackedBytes {
    data: Vec<u8>,
    tracker: Arc<ByteTracker>,
}

impl TrackedBytes {
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn tracker(&self) -> &Arc<ByteTracker> {
        &self.tracker
    }
}

impl Deref for TrackedBytes {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.data
    }
}

impl AsRef<[u8]> for TrackedBytes {
    fn as_ref(&self) -> &[u8] {
        &self.data
    }
}

impl std::fmt::Debug for TrackedBytes {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrackedBytes")
            .field("len", &self.data.len())
            .finish()
    }
}

impl Drop for TrackedBytes {
    fn drop(&mut self) {
        self.tracker.release(self.data.len() as u64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_live_buffers_and_high_water_mark() {
        let tracker = ByteTracker::new();
        let a = tracker.from_vec(vec![0u8; 100]);
        let b = tracker.from_slice(&[1u8; 50]);
        assert_eq!(tracker.bytes_used(), 150);
        drop(a);
        assert_eq!(tracker.bytes_used(), 50);
        drop(b);
        assert_eq!(tracker.bytes_used(), 0);
        assert_eq!(tracker.max_bytes_used(), 150);
    }

    #[test]
    fn shared_between_threads() {
        let tracker = ByteTracker::new();
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let tracker = Arc::clone(&tracker);
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        let buf = tracker.from_vec(vec![0u8; 1024]);
                        assert!(buf.len() == 1024);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(tracker.bytes_used(), 0);
        assert!(tracker.max_bytes_used() >= 1024);
    }
}
