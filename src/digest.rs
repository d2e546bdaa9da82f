/*
 * apkzip v1.0.0
 * Copyright (c) 2026 Tiash H Kabir / @MrCarb0n.
 * Licensed under the MIT License.
 */

//! Message digests usable in JAR manifests and signature files.

use crate::error::PackagingError;
use crate::keys::KeyAlgorithm;
use ring::digest;

/// API level from which RSA and ECDSA JAR signatures may use SHA-256.
pub const API_SHA_256_RSA_AND_ECDSA: u32 = 18;

/// API level from which every key algorithm may use SHA-256.
pub const API_SHA_256_ALL_ALGORITHMS: u32 = 21;

/// Digest written as `<name>-Digest` / `<name>-Digest-Manifest` attributes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DigestAlgorithm {
    Sha1,
    Sha256,
}

impl DigestAlgorithm {
    /// Declaration order; ties in [`find_best`](Self::find_best) go to the earlier one.
    pub const ALL: [DigestAlgorithm; 2] = [DigestAlgorithm::Sha1, DigestAlgorithm::Sha256];

    /// Lowest API level able to verify this digest.
    pub const fn min_sdk(self) -> u32 {
        match self {
            Self::Sha1 => 0,
            Self::Sha256 => API_SHA_256_RSA_AND_ECDSA,
        }
    }

    pub const fn priority(self) -> u32 {
        match self {
            Self::Sha1 => 0,
            Self::Sha256 => 1,
        }
    }

    /// Name of the algorithm as understood by `MessageDigest`-style registries.
    pub const fn message_digest_name(self) -> &'static str {
        match self {
            Self::Sha1 => "SHA-1",
            Self::Sha256 => "SHA-256",
        }
    }

    const fn attribute_prefix(self) -> &'static str {
        match self {
            Self::Sha1 => "SHA1",
            Self::Sha256 => "SHA-256",
        }
    }

    /// Attribute holding an entry digest, e.g. `SHA-256-Digest`.
    pub fn entry_attribute_name(self) -> String {
        format!("{}-Digest", self.attribute_prefix())
    }

    /// Attribute holding the whole-manifest digest, e.g. `SHA-256-Digest-Manifest`.
    pub fn manifest_attribute_name(self) -> String {
        format!("{}-Digest-Manifest", self.attribute_prefix())
    }

    pub(crate) fn ring_algorithm(self) -> &'static digest::Algorithm {
        match self {
            Self::Sha1 => &digest::SHA1_FOR_LEGACY_USE_ONLY,
            Self::Sha256 => &digest::SHA256,
        }
    }

    /// Find the digest with the highest priority that devices at `min_sdk` can verify.
    pub fn find_best(min_sdk: u32) -> Result<DigestAlgorithm, PackagingError> {
        Self::best_of(Self::ALL.iter().copied().filter(|d| d.min_sdk() <= min_sdk))
    }

    /// Like [`find_best`](Self::find_best), but honours the later SHA-256 support
    /// for DSA signed JARs.
    pub fn find_best_for_key(
        min_sdk: u32,
        key: KeyAlgorithm,
    ) -> Result<DigestAlgorithm, PackagingError> {
        let threshold = match key {
            KeyAlgorithm::Rsa | KeyAlgorithm::Ecdsa => API_SHA_256_RSA_AND_ECDSA,
            KeyAlgorithm::Dsa => API_SHA_256_ALL_ALGORITHMS,
        };
        Self::best_of(Self::ALL.iter().copied().filter(|d| match d {
            Self::Sha1 => true,
            Self::Sha256 => min_sdk >= threshold,
        }))
    }

    /// Resolve an attribute name such as `SHA-256-Digest` back to its algorithm.
    pub fn from_entry_attribute(name: &str) -> Option<DigestAlgorithm> {
        Self::ALL
            .iter()
            .copied()
            .find(|d| d.entry_attribute_name().eq_ignore_ascii_case(name))
    }

    fn best_of(
        candidates: impl Iterator<Item = DigestAlgorithm>,
    ) -> Result<DigestAlgorithm, PackagingError> {
        candidates
            .reduce(|best, c| if c.priority() > best.priority() { c } else { best })
            .ok_or_else(|| PackagingError::Unsupported("no applicable digest algorithm".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn best_digest_is_maximal_among_applicable() {
        for min_sdk in 0..=34 {
            let best = DigestAlgorithm::find_best(min_sdk).unwrap();
            assert!(best.min_sdk() <= min_sdk);
            for other in DigestAlgorithm::ALL {
                if other.min_sdk() <= min_sdk {
                    assert!(other.priority() <= best.priority());
                }
            }
        }
    }

    #[test]
    fn sha256_starts_at_api_18() {
        assert_eq!(DigestAlgorithm::find_best(17).unwrap(), DigestAlgorithm::Sha1);
        assert_eq!(DigestAlgorithm::find_best(18).unwrap(), DigestAlgorithm::Sha256);
    }

    #[test]
    fn no_candidate_is_an_error() {
        assert!(matches!(
            DigestAlgorithm::best_of(std::iter::empty()),
            Err(PackagingError::Unsupported(_))
        ));
        assert_eq!(
            DigestAlgorithm::best_of([DigestAlgorithm::Sha256, DigestAlgorithm::Sha1].into_iter())
                .unwrap(),
            DigestAlgorithm::Sha256
        );
    }

    #[test]
    fn dsa_keys_wait_for_api_21() {
        assert_eq!(
            DigestAlgorithm::find_best_for_key(20, KeyAlgorithm::Dsa).unwrap(),
            DigestAlgorithm::Sha1
        );
        assert_eq!(
            DigestAlgorithm::find_best_for_key(21, KeyAlgorithm::Dsa).unwrap(),
            DigestAlgorithm::Sha256
        );
        assert_eq!(
            DigestAlgorithm::find_best_for_key(18, KeyAlgorithm::Ecdsa).unwrap(),
            DigestAlgorithm::Sha256
        );
    }

    #[test]
    fn attribute_names() {
        assert_eq!(DigestAlgorithm::Sha1.entry_attribute_name(), "SHA1-Digest");
        assert_eq!(
            DigestAlgorithm::Sha256.manifest_attribute_name(),
            "SHA-256-Digest-Manifest"
        );
        assert_eq!(
            DigestAlgorithm::from_entry_attribute("sha-256-digest"),
            Some(DigestAlgorithm::Sha256)
        );
    }
}
