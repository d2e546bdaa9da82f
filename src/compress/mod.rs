/*
 * apkzip v1.0.0
 * Copyright (c) 2026 Tiash H Kabir / @MrCarb0n.
 * Licensed under the MIT License.
 */

//! Pluggable compression of ZIP entry payloads.
//!
//! A [`Compressor`] receives the raw bytes of one entry and hands back a
//! [`PendingCompression`]. Depending on its [`CompressionExecutor`] the work
//! either already happened on the calling thread or is running on a rayon
//! pool; [`PendingCompression::wait`] joins it. Entries are compressed
//! independently and may finish in any order.

mod deflate;

pub use deflate::{BestAndDefaultDeflateCompressor, DeflateExecutionCompressor};

use crate::error::PackagingError;
use crate::tracker::TrackedBytes;
use std::sync::{Arc, Condvar, Mutex, PoisonError};

/// ZIP compression method of an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompressionMethod {
    Stored,
    Deflated,
}

impl CompressionMethod {
    pub const fn zip_id(self) -> u16 {
        match self {
            Self::Stored => 0,
            Self::Deflated => 8,
        }
    }

    pub fn from_zip_id(id: u16) -> Option<CompressionMethod> {
        match id {
            0 => Some(Self::Stored),
            8 => Some(Self::Deflated),
            _ => None,
        }
    }
}

/// Output of a compressor: the bytes to store and how they were produced.
#[derive(Debug, Clone)]
pub struct CompressionResult {
    method: CompressionMethod,
    data: Arc<TrackedBytes>,
}

impl CompressionResult {
    pub fn new(method: CompressionMethod, data: Arc<TrackedBytes>) -> Self {
        Self { method, data }
    }

    /// The source itself, uncompressed.
    pub fn stored(source: Arc<TrackedBytes>) -> Self {
        Self::new(CompressionMethod::Stored, source)
    }

    pub fn method(&self) -> CompressionMethod {
        self.method
    }

    pub fn data(&self) -> &Arc<TrackedBytes> {
        &self.data
    }

    pub fn size(&self) -> u64 {
        self.data.len() as u64
    }
}

type Outcome = Result<CompressionResult, PackagingError>;

struct Completion {
    outcome: Mutex<Option<Outcome>>,
    done: Condvar,
}

/// Handle on a compression that may still be running.
pub struct PendingCompression {
    completion: Arc<Completion>,
}

impl PendingCompression {
    /// A compression that already finished.
    pub fn ready(outcome: Outcome) -> Self {
        Self {
            completion: Arc::new(Completion {
                outcome: Mutex::new(Some(outcome)),
                done: Condvar::new(),
            }),
        }
    }

    fn unfinished() -> (Self, Arc<Completion>) {
        let completion = Arc::new(Completion {
            outcome: Mutex::new(None),
            done: Condvar::new(),
        });
        (
            Self {
                completion: Arc::clone(&completion),
            },
            completion,
        )
    }

    pub fn is_done(&self) -> bool {
        self.completion
            .outcome
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Block until the compression finishes and take its outcome.
    pub fn wait(self) -> Outcome {
        let mut outcome = self
            .completion
            .outcome
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        loop {
            if let Some(result) = outcome.take() {
                return result;
            }
            outcome = self
                .completion
                .done
                .wait(outcome)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }
}

impl std::fmt::Debug for PendingCompression {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingCompression")
            .field("done", &self.is_done())
            .finish()
    }
}

/// Where compression work runs.
#[derive(Clone, Default)]
pub enum CompressionExecutor {
    /// On the thread calling [`Compressor::compress`].
    #[default]
    SameThread,
    /// On a shared rayon pool.
    Pool(Arc<rayon::ThreadPool>),
}

impl CompressionExecutor {
    /// A dedicated pool of `threads` workers (0 picks the CPU count).
    pub fn thread_pool(threads: usize) -> Result<Self, PackagingError> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("apkzip-compress-{}", i))
            .build()
            .map_err(|e| PackagingError::Config(format!("Cannot start compression pool: {}", e)))?;
        Ok(Self::Pool(Arc::new(pool)))
    }

    /// Number of threads that may compress concurrently.
    pub fn parallelism(&self) -> usize {
        match self {
            Self::SameThread => 1,
            Self::Pool(pool) => pool.current_num_threads(),
        }
    }

    pub fn execute<F>(&self, task: F) -> PendingCompression
    where
        F: FnOnce() -> Outcome + Send + 'static,
    {
        match self {
            Self::SameThread => PendingCompression::ready(task()),
            Self::Pool(pool) => {
                let (pending, completion) = PendingCompression::unfinished();
                pool.spawn(move || {
                    let outcome = task();
                    let mut slot = completion
                        .outcome
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner);
                    *slot = Some(outcome);
                    completion.done.notify_all();
                });
                pending
            }
        }
    }
}

impl std::fmt::Debug for CompressionExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SameThread => f.write_str("SameThread"),
            Self::Pool(pool) => write!(f, "Pool({} threads)", pool.current_num_threads()),
        }
    }
}

pub trait Compressor: Send + Sync {
    /// Start compressing `source`. Errors surface from [`PendingCompression::wait`].
    fn compress(&self, source: Arc<TrackedBytes>) -> PendingCompression;
}

/// Never compresses.
#[derive(Debug, Default, Clone, Copy)]
pub struct StoreCompressor;

impl Compressor for StoreCompressor {
    fn compress(&self, source: Arc<TrackedBytes>) -> PendingCompression {
        PendingCompression::ready(Ok(CompressionResult::stored(source)))
    }
}
