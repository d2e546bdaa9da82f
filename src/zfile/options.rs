/*
 * apkzip v1.0.0
 * Copyright (c) 2026 Tiash H Kabir / @MrCarb0n.
 * Licensed under the MIT License.
 */

use crate::compress::{CompressionExecutor, Compressor, DeflateExecutionCompressor};
use crate::error::PackagingError;
use crate::tracker::ByteTracker;
use flate2::Compression;
use std::fmt;
use std::sync::Arc;

/// Alignment applied to the data of stored entries.
///
/// Deflated entries are never aligned. A rule of `1` means unaligned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlignmentRule {
    default: u16,
    suffixes: Vec<(String, u16)>,
}

impl Default for AlignmentRule {
    fn default() -> Self {
        Self::none()
    }
}

impl AlignmentRule {
    pub fn none() -> Self {
        Self::constant(1)
    }

    pub fn constant(alignment: u16) -> Self {
        Self {
            default: alignment.max(1),
            suffixes: Vec::new(),
        }
    }

    /// Override the alignment of names ending in `suffix`.
    pub fn with_suffix(mut self, suffix: impl Into<String>, alignment: u16) -> Self {
        self.suffixes.push((suffix.into(), alignment.max(1)));
        self
    }

    /// zipalign defaults: 4 bytes, native libraries on 4 KiB pages.
    pub fn apk() -> Self {
        Self::constant(4).with_suffix(".so", 4096)
    }

    pub fn alignment(&self, name: &str) -> u16 {
        self.suffixes
            .iter()
            .find(|(suffix, _)| name.ends_with(suffix.as_str()))
            .map(|(_, a)| *a)
            .unwrap_or(self.default)
    }
}

/// Tunables shared by every entry written through one [`ZFile`](super::ZFile).
#[derive(Clone)]
pub struct ZFileOptions {
    tracker: Arc<ByteTracker>,
    compressor: Arc<dyn Compressor>,
    no_timestamps: bool,
    alignment_rule: AlignmentRule,
}

impl Default for ZFileOptions {
    fn default() -> Self {
        let tracker = ByteTracker::new();
        let compressor = DeflateExecutionCompressor::new(
            CompressionExecutor::SameThread,
            Arc::clone(&tracker),
            Compression::default(),
        );
        Self {
            tracker,
            compressor: Arc::new(compressor),
            no_timestamps: false,
            alignment_rule: AlignmentRule::none(),
        }
    }
}

impl ZFileOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the compressor. It should account its output on [`tracker`](Self::tracker).
    pub fn with_compressor(mut self, compressor: Arc<dyn Compressor>) -> Self {
        self.compressor = compressor;
        self
    }

    /// Deflate at the default level on a pool of `threads` workers.
    pub fn with_threads(self, threads: usize) -> Result<Self, PackagingError> {
        let executor = CompressionExecutor::thread_pool(threads)?;
        let compressor =
            DeflateExecutionCompressor::new(executor, Arc::clone(&self.tracker), Compression::default());
        Ok(self.with_compressor(Arc::new(compressor)))
    }

    pub fn with_no_timestamps(mut self, no_timestamps: bool) -> Self {
        self.no_timestamps = no_timestamps;
        self
    }

    pub fn with_alignment_rule(mut self, rule: AlignmentRule) -> Self {
        self.alignment_rule = rule;
        self
    }

    pub fn tracker(&self) -> &Arc<ByteTracker> {
        &self.tracker
    }

    pub fn compressor(&self) -> &Arc<dyn Compressor> {
        &self.compressor
    }

    pub fn no_timestamps(&self) -> bool {
        self.no_timestamps
    }

    pub fn alignment_rule(&self) -> &AlignmentRule {
        &self.alignment_rule
    }
}

impl fmt::Debug for ZFileOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ZFileOptions")
            .field("tracker", &self.tracker)
            .field("no_timestamps", &self.no_timestamps)
            .field("alignment_rule", &self.alignment_rule)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn apk_rule_pages_native_libraries() {
        let rule = AlignmentRule::apk();
        assert_eq!(rule.alignment("lib/arm64-v8a/libfoo.so"), 4096);
        assert_eq!(rule.alignment("res/raw/blob.bin"), 4);
        assert_eq!(AlignmentRule::none().alignment("lib/x86/libbar.so"), 1);
        assert_eq!(AlignmentRule::constant(0).alignment("x"), 1);
    }

    #[test]
    fn builder_keeps_tracker() {
        let options = ZFileOptions::new()
            .with_no_timestamps(true)
            .with_alignment_rule(AlignmentRule::apk());
        let tracker = Arc::clone(options.tracker());
        let options = options.with_threads(2).unwrap();
        assert!(Arc::ptr_eq(options.tracker(), &tracker));
        assert!(options.no_timestamps());
        assert_eq!(options.alignment_rule(), &AlignmentRule::apk());
    }
}
