/*
 * apkzip v1.0.0
 * Copyright (c) 2026 Tiash H Kabir / @MrCarb0n.
 * Licensed under the MIT License.
 */

//! Registry of APK Signature Scheme v2 signature algorithms.
//!
//! The numeric identifiers are written into signing blocks and read back by
//! every device that installs the APK. They are wire constants: an identifier
//! is never reassigned, and a new algorithm always gets a fresh one. The high
//! byte names the key family (`0x01` RSA, `0x02` ECDSA, `0x03` DSA), the low
//! byte distinguishes padding and digest size.

use crate::keys::KeyAlgorithm;
use ring::{digest, signature};

/// Digest computed over 1 MiB chunks of the APK contents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ContentDigestAlgorithm {
    ChunkedSha256,
    ChunkedSha512,
}

impl ContentDigestAlgorithm {
    pub const fn id(self) -> u32 {
        match self {
            Self::ChunkedSha256 => 1,
            Self::ChunkedSha512 => 2,
        }
    }

    pub const fn output_len(self) -> usize {
        match self {
            Self::ChunkedSha256 => 32,
            Self::ChunkedSha512 => 64,
        }
    }

    pub(crate) fn ring_algorithm(self) -> &'static digest::Algorithm {
        match self {
            Self::ChunkedSha256 => &digest::SHA256,
            Self::ChunkedSha512 => &digest::SHA512,
        }
    }
}

/// RSASSA-PSS parameters, the `PSSParameterSpec` of a signature algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PssParameters {
    pub message_digest: &'static str,
    pub mask_generation_function: &'static str,
    pub mgf_digest: &'static str,
    pub salt_len: u32,
    pub trailer_field: u32,
}

impl PssParameters {
    const fn mgf1(digest: &'static str, salt_len: u32) -> Self {
        Self {
            message_digest: digest,
            mask_generation_function: "MGF1",
            mgf_digest: digest,
            salt_len,
            trailer_field: 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignatureAlgorithm {
    RsaPssSha256,
    RsaPssSha512,
    RsaPkcs1Sha256,
    RsaPkcs1Sha512,
    EcdsaSha256,
    EcdsaSha512,
    DsaSha256,
}

impl SignatureAlgorithm {
    pub const ALL: [SignatureAlgorithm; 7] = [
        SignatureAlgorithm::RsaPssSha256,
        SignatureAlgorithm::RsaPssSha512,
        SignatureAlgorithm::RsaPkcs1Sha256,
        SignatureAlgorithm::RsaPkcs1Sha512,
        SignatureAlgorithm::EcdsaSha256,
        SignatureAlgorithm::EcdsaSha512,
        SignatureAlgorithm::DsaSha256,
    ];

    pub const fn id(self) -> u32 {
        match self {
            Self::RsaPssSha256 => 0x0101,
            Self::RsaPssSha512 => 0x0102,
            Self::RsaPkcs1Sha256 => 0x0103,
            Self::RsaPkcs1Sha512 => 0x0104,
            Self::EcdsaSha256 => 0x0201,
            Self::EcdsaSha512 => 0x0202,
            Self::DsaSha256 => 0x0301,
        }
    }

    pub fn from_id(id: u32) -> Option<SignatureAlgorithm> {
        Self::ALL.iter().copied().find(|a| a.id() == id)
    }

    pub const fn content_digest_algorithm(self) -> ContentDigestAlgorithm {
        match self {
            Self::RsaPssSha256 | Self::RsaPkcs1Sha256 | Self::EcdsaSha256 | Self::DsaSha256 => {
                ContentDigestAlgorithm::ChunkedSha256
            }
            Self::RsaPssSha512 | Self::RsaPkcs1Sha512 | Self::EcdsaSha512 => {
                ContentDigestAlgorithm::ChunkedSha512
            }
        }
    }

    /// JCA-style name of the signing algorithm.
    pub const fn signing_algorithm_name(self) -> &'static str {
        match self {
            Self::RsaPssSha256 => "SHA256withRSA/PSS",
            Self::RsaPssSha512 => "SHA512withRSA/PSS",
            Self::RsaPkcs1Sha256 => "SHA256withRSA",
            Self::RsaPkcs1Sha512 => "SHA512withRSA",
            Self::EcdsaSha256 => "SHA256withECDSA",
            Self::EcdsaSha512 => "SHA512withECDSA",
            Self::DsaSha256 => "SHA256withDSA",
        }
    }

    pub const fn parameter_spec(self) -> Option<PssParameters> {
        match self {
            Self::RsaPssSha256 => Some(PssParameters::mgf1("SHA-256", 256 / 8)),
            Self::RsaPssSha512 => Some(PssParameters::mgf1("SHA-512", 512 / 8)),
            _ => None,
        }
    }

    pub const fn key_algorithm(self) -> KeyAlgorithm {
        match self.id() >> 8 {
            0x01 => KeyAlgorithm::Rsa,
            0x02 => KeyAlgorithm::Ecdsa,
            _ => KeyAlgorithm::Dsa,
        }
    }

    /// Algorithm used when signing with a key of the given family and size.
    pub fn suggested_for(key: KeyAlgorithm, key_bits: usize) -> SignatureAlgorithm {
        match key {
            KeyAlgorithm::Rsa if key_bits <= 3072 => Self::RsaPkcs1Sha256,
            KeyAlgorithm::Rsa => Self::RsaPkcs1Sha512,
            KeyAlgorithm::Ecdsa if key_bits <= 256 => Self::EcdsaSha256,
            KeyAlgorithm::Ecdsa => Self::EcdsaSha512,
            KeyAlgorithm::Dsa => Self::DsaSha256,
        }
    }

    /// `ring` verification parameters, when `ring` implements the scheme.
    pub fn verification_algorithm(self) -> Option<&'static dyn signature::VerificationAlgorithm> {
        match self {
            Self::RsaPssSha256 => Some(&signature::RSA_PSS_2048_8192_SHA256),
            Self::RsaPssSha512 => Some(&signature::RSA_PSS_2048_8192_SHA512),
            Self::RsaPkcs1Sha256 => Some(&signature::RSA_PKCS1_2048_8192_SHA256),
            Self::RsaPkcs1Sha512 => Some(&signature::RSA_PKCS1_2048_8192_SHA512),
            Self::EcdsaSha256 => Some(&signature::ECDSA_P256_SHA256_ASN1),
            Self::EcdsaSha512 | Self::DsaSha256 => None,
        }
    }

    /// `ring` RSA padding for signing, for the RSA variants.
    pub fn rsa_encoding(self) -> Option<&'static dyn signature::RsaEncoding> {
        match self {
            Self::RsaPssSha256 => Some(&signature::RSA_PSS_SHA256),
            Self::RsaPssSha512 => Some(&signature::RSA_PSS_SHA512),
            Self::RsaPkcs1Sha256 => Some(&signature::RSA_PKCS1_SHA256),
            Self::RsaPkcs1Sha512 => Some(&signature::RSA_PKCS1_SHA512),
            _ => None,
        }
    }
}
