/*
 * apkzip v1.0.0
 * Copyright (c) 2026 Tiash H Kabir / @MrCarb0n.
 * Licensed under the MIT License.
 */

use crate::{
    digest::DigestAlgorithm, error::PackagingError, signature_algorithm::ContentDigestAlgorithm,
    BUFFER_SIZE,
};
use base64::{engine::general_purpose::STANDARD as base64_engine, Engine};
use rayon::prelude::*;
use ring::digest;
use std::io::Read;
use tracing::trace;

/// Size of the chunks hashed by APK Signature Scheme v2 content digests.
pub const CHUNK_SIZE: usize = 1024 * 1024;

const CHUNK_PREFIX: u8 = 0xa5;
const TOP_LEVEL_PREFIX: u8 = 0x5a;

pub struct CryptoEngine;

impl CryptoEngine {
    pub fn digest(algorithm: DigestAlgorithm, data: &[u8]) -> Vec<u8> {
        digest::digest(algorithm.ring_algorithm(), data).as_ref().to_vec()
    }

    pub fn digest_base64(algorithm: DigestAlgorithm, data: &[u8]) -> String {
        base64_engine.encode(digest::digest(algorithm.ring_algorithm(), data).as_ref())
    }

    pub fn stream_digest_base64<R: Read>(
        algorithm: DigestAlgorithm,
        reader: &mut R,
    ) -> Result<String, PackagingError> {
        let mut ctx = digest::Context::new(algorithm.ring_algorithm());
        let mut buf = vec![0u8; BUFFER_SIZE];
        let mut processed = 0u64;
        loop {
            let count = reader.read(&mut buf)?;
            if count == 0 {
                break;
            }
            ctx.update(&buf[..count]);
            processed += count as u64;
        }
        trace!(
            algorithm = algorithm.message_digest_name(),
            bytes = processed,
            "stream digest complete"
        );
        Ok(base64_engine.encode(ctx.finish().as_ref()))
    }

    /// Chunked content digest over `sections`, in order.
    ///
    /// Each section is cut into 1 MiB chunks (the last one shorter); chunk
    /// digests are computed in parallel and combined into the top level digest.
    pub fn chunked_digest(algorithm: ContentDigestAlgorithm, sections: &[&[u8]]) -> Vec<u8> {
        let chunks: Vec<&[u8]> = sections
            .iter()
            .flat_map(|section| section.chunks(CHUNK_SIZE))
            .collect();
        let ring_alg = algorithm.ring_algorithm();
        let chunk_digests: Vec<digest::Digest> = chunks
            .par_iter()
            .map(|chunk| {
                let mut ctx = digest::Context::new(ring_alg);
                ctx.update(&[CHUNK_PREFIX]);
                ctx.update(&(chunk.len() as u32).to_le_bytes());
                ctx.update(chunk);
                ctx.finish()
            })
            .collect();

        let mut ctx = digest::Context::new(ring_alg);
        ctx.update(&[TOP_LEVEL_PREFIX]);
        ctx.update(&(chunk_digests.len() as u32).to_le_bytes());
        for d in &chunk_digests {
            ctx.update(d.as_ref());
        }
        trace!(chunks = chunk_digests.len(), "chunked digest complete");
        ctx.finish().as_ref().to_vec()
    }

    pub fn decode_base64(value: &str) -> Result<Vec<u8>, PackagingError> {
        base64_engine
            .decode(value.trim())
            .map_err(|e| PackagingError::Validation(format!("Invalid base64 digest: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_digests() {
        assert_eq!(
            CryptoEngine::digest_base64(DigestAlgorithm::Sha1, b"abc"),
            "qZk+NkcGgWq6PiVxeFDCbJzQ2J0="
        );
        assert_eq!(
            CryptoEngine::digest_base64(DigestAlgorithm::Sha256, b"abc"),
            "ungWv48Bz+pBQUDeXa4iI7ADYaOWF3qctBD/YfIAFa0="
        );
    }

    #[test]
    fn stream_matches_one_shot() {
        let data: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        let streamed =
            CryptoEngine::stream_digest_base64(DigestAlgorithm::Sha256, &mut &data[..]).unwrap();
        assert_eq!(streamed, CryptoEngine::digest_base64(DigestAlgorithm::Sha256, &data));
    }

    #[test]
    fn chunked_digest_of_small_input() {
        let data = b"hello";
        let mut chunk = vec![CHUNK_PREFIX];
        chunk.extend_from_slice(&5u32.to_le_bytes());
        chunk.extend_from_slice(data);
        let chunk_digest = digest::digest(&digest::SHA256, &chunk);
        let mut top = vec![TOP_LEVEL_PREFIX];
        top.extend_from_slice(&1u32.to_le_bytes());
        top.extend_from_slice(chunk_digest.as_ref());
        let expected = digest::digest(&digest::SHA256, &top);
        assert_eq!(
            CryptoEngine::chunked_digest(ContentDigestAlgorithm::ChunkedSha256, &[data]),
            expected.as_ref()
        );
    }

    #[test]
    fn sections_do_not_share_chunks() {
        let a = vec![1u8; CHUNK_SIZE + 10];
        let b = vec![2u8; 10];
        let joined: Vec<u8> = a.iter().chain(b.iter()).copied().collect();
        let split = CryptoEngine::chunked_digest(ContentDigestAlgorithm::ChunkedSha512, &[&a, &b]);
        let whole = CryptoEngine::chunked_digest(ContentDigestAlgorithm::ChunkedSha512, &[&joined]);
        assert_eq!(split.len(), 64);
        assert_ne!(split, whole);
    }
}
