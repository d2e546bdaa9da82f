/*
 * apkzip v1.0.0
 * Copyright (c) 2026 Tiash H Kabir / @MrCarb0n.
 * Licensed under the MIT License.
 */

use super::{
    CompressionExecutor, CompressionMethod, CompressionResult, Compressor, PendingCompression,
};
use crate::error::PackagingError;
use crate::pool::{PoolConfig, WorkerPool};
use crate::tracker::{ByteTracker, TrackedBytes};
use flate2::{Compress, Compression, FlushCompress, Status};
use std::sync::Arc;

type DeflaterPool = WorkerPool<u32, Compress>;

fn deflater_pool(executor: &CompressionExecutor) -> Arc<DeflaterPool> {
    let config = PoolConfig::with_size(executor.parallelism());
    Arc::new(WorkerPool::new(config, |level: &u32| {
        Ok(Compress::new(Compression::new(*level), false))
    }))
}

/// Raw deflate of `input` with a pooled deflater.
fn deflate(deflater: &mut Compress, input: &[u8]) -> Result<Vec<u8>, PackagingError> {
    deflater.reset();
    let mut out = Vec::with_capacity(input.len() / 2 + 64);
    loop {
        let consumed = deflater.total_in() as usize;
        match deflater.compress_vec(&input[consumed..], &mut out, FlushCompress::Finish)? {
            Status::StreamEnd => return Ok(out),
            Status::Ok | Status::BufError => out.reserve(out.capacity().max(4096)),
        }
    }
}

fn compress_with_level(
    pool: &DeflaterPool,
    tracker: &Arc<ByteTracker>,
    level: u32,
    source: Arc<TrackedBytes>,
) -> Result<CompressionResult, PackagingError> {
    let compressed = {
        let mut deflater = pool.obtain(&level)?;
        deflate(&mut deflater, &source)?
    };
    if compressed.len() >= source.len() {
        return Ok(CompressionResult::stored(source));
    }
    Ok(CompressionResult::new(
        CompressionMethod::Deflated,
        Arc::new(tracker.from_vec(compressed)),
    ))
}

/// Deflates entries at a fixed level on its executor.
///
/// Deflaters are reused through a [`WorkerPool`] keyed by level, sized to the
/// executor's parallelism. Output that does not shrink is stored instead.
pub struct DeflateExecutionCompressor {
    executor: CompressionExecutor,
    tracker: Arc<ByteTracker>,
    level: Compression,
    deflaters: Arc<DeflaterPool>,
}

impl DeflateExecutionCompressor {
    pub fn new(executor: CompressionExecutor, tracker: Arc<ByteTracker>, level: Compression) -> Self {
        let deflaters = deflater_pool(&executor);
        Self {
            executor,
            tracker,
            level,
            deflaters,
        }
    }

    pub fn level(&self) -> Compression {
        self.level
    }
}

impl Compressor for DeflateExecutionCompressor {
    fn compress(&self, source: Arc<TrackedBytes>) -> PendingCompression {
        let pool = Arc::clone(&self.deflaters);
        let tracker = Arc::clone(&self.tracker);
        let level = self.level.level();
        self.executor
            .execute(move || compress_with_level(&pool, &tracker, level, source))
    }
}

/// Deflates with the default level and retries with the best level when the
/// default result is already good.
///
/// Entries whose default compressed size is at least `min_ratio` of the
/// original are kept as they are; the extra pass only pays off for data that
/// compresses well.
pub struct BestAndDefaultDeflateCompressor {
    executor: CompressionExecutor,
    tracker: Arc<ByteTracker>,
    min_ratio: f64,
    deflaters: Arc<DeflaterPool>,
}

impl BestAndDefaultDeflateCompressor {
    pub fn new(executor: CompressionExecutor, tracker: Arc<ByteTracker>, min_ratio: f64) -> Self {
        let deflaters = deflater_pool(&executor);
        Self {
            executor,
            tracker,
            min_ratio,
            deflaters,
        }
    }
}

impl Compressor for BestAndDefaultDeflateCompressor {
    fn compress(&self, source: Arc<TrackedBytes>) -> PendingCompression {
        let pool = Arc::clone(&self.deflaters);
        let tracker = Arc::clone(&self.tracker);
        let min_ratio = self.min_ratio;
        self.executor.execute(move || {
            let default_level = Compression::default().level();
            let default_result =
                compress_with_level(&pool, &tracker, default_level, Arc::clone(&source))?;
            if default_result.method() == CompressionMethod::Stored || source.is_empty() {
                return Ok(default_result);
            }
            let ratio = default_result.size() as f64 / source.len() as f64;
            if ratio >= min_ratio {
                return Ok(default_result);
            }
            let best_result =
                compress_with_level(&pool, &tracker, Compression::best().level(), source)?;
            if best_result.size() < default_result.size() {
                Ok(best_result)
            } else {
                Ok(default_result)
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::read::DeflateDecoder;
    use std::io::Read;

    fn inflate(data: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        DeflateDecoder::new(data).read_to_end(&mut out).unwrap();
        out
    }

    fn text(len: usize) -> Vec<u8> {
        b"the quick brown fox jumps over the lazy dog. "
            .iter()
            .cycle()
            .take(len)
            .copied()
            .collect()
    }

    #[test]
    fn deflate_round_trips() {
        let tracker = ByteTracker::new();
        let compressor = DeflateExecutionCompressor::new(
            CompressionExecutor::SameThread,
            Arc::clone(&tracker),
            Compression::default(),
        );
        let input = text(100_000);
        let result = compressor
            .compress(Arc::new(tracker.from_vec(input.clone())))
            .wait()
            .unwrap();
        assert_eq!(result.method(), CompressionMethod::Deflated);
        assert!(result.size() < input.len() as u64);
        assert_eq!(inflate(result.data()), input);
    }

    #[test]
    fn incompressible_data_is_stored() {
        let tracker = ByteTracker::new();
        let compressor = DeflateExecutionCompressor::new(
            CompressionExecutor::SameThread,
            Arc::clone(&tracker),
            Compression::default(),
        );
        let input: Vec<u8> = (0..4096u32)
            .map(|i| (i.wrapping_mul(2_654_435_761) >> 13) as u8)
            .collect();
        let result = compressor
            .compress(Arc::new(tracker.from_vec(input.clone())))
            .wait()
            .unwrap();
        if result.method() == CompressionMethod::Stored {
            assert_eq!(result.data().as_slice(), &input[..]);
        } else {
            assert!(result.size() < input.len() as u64);
        }
    }

    #[test]
    fn empty_input_is_stored() {
        let tracker = ByteTracker::new();
        let compressor = DeflateExecutionCompressor::new(
            CompressionExecutor::SameThread,
            Arc::clone(&tracker),
            Compression::default(),
        );
        let result = compressor
            .compress(Arc::new(tracker.from_vec(Vec::new())))
            .wait()
            .unwrap();
        assert_eq!(result.method(), CompressionMethod::Stored);
    }

    #[test]
    fn parallel_compression_reuses_deflaters() {
        let tracker = ByteTracker::new();
        let executor = CompressionExecutor::thread_pool(3).unwrap();
        let compressor =
            DeflateExecutionCompressor::new(executor, Arc::clone(&tracker), Compression::fast());
        let inputs: Vec<Vec<u8>> = (0..24).map(|i| text(10_000 + i * 97)).collect();
        let pending: Vec<_> = inputs
            .iter()
            .map(|i| compressor.compress(Arc::new(tracker.from_slice(i))))
            .collect();
        for (input, p) in inputs.iter().zip(pending) {
            assert_eq!(&inflate(p.wait().unwrap().data()), input);
        }
        assert!(compressor.deflaters.idle(&Compression::fast().level()) <= 3);
        assert_eq!(tracker.bytes_used(), 0);
    }

    #[test]
    fn best_and_default_never_grows() {
        let tracker = ByteTracker::new();
        let compressor = BestAndDefaultDeflateCompressor::new(
            CompressionExecutor::SameThread,
            Arc::clone(&tracker),
            0.9,
        );
        let input = text(50_000);
        let default_size = DeflateExecutionCompressor::new(
            CompressionExecutor::SameThread,
            Arc::clone(&tracker),
            Compression::default(),
        )
        .compress(Arc::new(tracker.from_slice(&input)))
        .wait()
        .unwrap()
        .size();
        let result = compressor
            .compress(Arc::new(tracker.from_slice(&input)))
            .wait()
            .unwrap();
        assert!(result.size() <= default_size);
        assert_eq!(inflate(result.data()), input);
    }
}
