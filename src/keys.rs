/*
 * apkzip v1.0.0
 * Copyright (c) 2026 Tiash H Kabir / @MrCarb0n.
 * Licensed under the MIT License.
 */

//! Signing key and certificate loading.

use crate::error::PackagingError;
use crate::signature_algorithm::SignatureAlgorithm;
use ::pem as pem_crate;
use ring::rand::SystemRandom;
use ring::digest;
use ring::signature::{self, EcdsaKeyPair, KeyPair, RsaKeyPair};
use rsa::{pkcs8::DecodePrivateKey, Pkcs1v15Sign, RsaPrivateKey};
use sha1::Sha1;
use std::{fs, path::Path};
use tracing::{debug, warn};
use x509_parser::prelude::*;
use x509_parser::public_key::PublicKey;

#[cfg(has_merged_keys)]
mod embedded {
    include!(concat!(env!("OUT_DIR"), "/merged_keys.rs"));
}

/// Public key family of a signer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyAlgorithm {
    Rsa,
    Ecdsa,
    Dsa,
}

impl KeyAlgorithm {
    /// Extension of the JAR signature block file (`CERT.RSA`, `CERT.EC`, ...).
    pub const fn signature_block_extension(self) -> &'static str {
        match self {
            Self::Rsa => "RSA",
            Self::Ecdsa => "EC",
            Self::Dsa => "DSA",
        }
    }
}

pub enum SigningKey {
    /// `ring` signs SHA-256 and up; the `rsa` key covers SHA1withRSA.
    Rsa(RsaKeyPair, Box<RsaPrivateKey>),
    Ecdsa(EcdsaKeyPair),
}

/// A private key and the certificate vouching for it.
pub struct KeyChain {
    key: SigningKey,
    certificate: Vec<u8>,
    public_key_info: Vec<u8>,
    key_algorithm: KeyAlgorithm,
    key_bits: usize,
    rng: SystemRandom,
}

impl KeyChain {
    /// Load signing material from files, falling back to the bundled
    /// development key pair when one was built in.
    pub fn load(key_path: Option<&Path>, cert_path: Option<&Path>) -> Result<Self, PackagingError> {
        let key = match key_path {
            Some(p) => {
                Self::check_key_permissions(p)?;
                fs::read(p)?
            }
            None => Self::dev_key()?.to_vec(),
        };
        let cert = match cert_path {
            Some(p) => fs::read(p)?,
            None => Self::dev_cert()?.to_vec(),
        };
        Self::from_pem(&key, &cert)
    }

    #[cfg(has_merged_keys)]
    fn dev_key() -> Result<&'static [u8], PackagingError> {
        warn!("Using dev key. For production: -k flag.");
        Ok(embedded::PRIVATE_KEY.as_bytes())
    }

    #[cfg(has_merged_keys)]
    fn dev_cert() -> Result<&'static [u8], PackagingError> {
        warn!("Using dev cert. For production: -p flag.");
        Ok(embedded::PUBLIC_KEY.as_bytes())
    }

    #[cfg(not(has_merged_keys))]
    fn dev_key() -> Result<&'static [u8], PackagingError> {
        Err(PackagingError::Config(
            "No private key given (-k) and no development key built in.".into(),
        ))
    }

    #[cfg(not(has_merged_keys))]
    fn dev_cert() -> Result<&'static [u8], PackagingError> {
        Err(PackagingError::Config(
            "No certificate given (-p) and no development certificate built in.".into(),
        ))
    }

    /// Build from a PKCS#8 private key and an X.509 certificate, each PEM or DER.
    pub fn from_pem(key: &[u8], cert: &[u8]) -> Result<Self, PackagingError> {
        let key_der = decode_pem_or_der(key, "private key");
        let cert_der = decode_pem_or_der(cert, "certificate");

        let (_, parsed) = X509Certificate::from_der(&cert_der)
            .map_err(|e| PackagingError::Config(format!("Invalid certificate: {}", e)))?;
        let spki = parsed.public_key();
        let (key_algorithm, key_bits) = match spki.parsed() {
            Ok(PublicKey::RSA(public)) => (KeyAlgorithm::Rsa, public.key_size()),
            Ok(PublicKey::EC(point)) => (KeyAlgorithm::Ecdsa, point.key_size()),
            Ok(PublicKey::DSA(_)) => {
                return Err(PackagingError::Unsupported("DSA signing keys".into()))
            }
            Ok(_) => {
                return Err(PackagingError::Unsupported(format!(
                    "public key algorithm {}",
                    spki.algorithm.algorithm
                )))
            }
            Err(e) => {
                return Err(PackagingError::Config(format!(
                    "Invalid certificate public key: {}",
                    e
                )))
            }
        };

        let rng = SystemRandom::new();
        let key = match key_algorithm {
            KeyAlgorithm::Rsa => SigningKey::Rsa(
                RsaKeyPair::from_pkcs8(&key_der)
                    .map_err(|e| PackagingError::Config(format!("Invalid RSA private key: {}", e)))?,
                Box::new(RsaPrivateKey::from_pkcs8_der(&key_der).map_err(|e| {
                    PackagingError::Config(format!("Invalid RSA private key: {}", e))
                })?),
            ),
            _ => SigningKey::Ecdsa(
                EcdsaKeyPair::from_pkcs8(&signature::ECDSA_P256_SHA256_ASN1_SIGNING, &key_der, &rng)
                    .map_err(|e| {
                        PackagingError::Config(format!("Invalid P-256 private key: {}", e))
                    })?,
            ),
        };

        let public_key = match &key {
            SigningKey::Rsa(k, _) => k.public_key().as_ref(),
            SigningKey::Ecdsa(k) => k.public_key().as_ref(),
        };
        if public_key != spki.subject_public_key.data.as_ref() {
            return Err(PackagingError::Config(
                "Private key does not match the certificate".into(),
            ));
        }
        debug!(?key_algorithm, key_bits, "loaded signing key");

        Ok(Self {
            key,
            public_key_info: spki.raw.to_vec(),
            certificate: cert_der.clone(),
            key_algorithm,
            key_bits,
            rng,
        })
    }

    pub fn key_algorithm(&self) -> KeyAlgorithm {
        self.key_algorithm
    }

    pub fn key_bits(&self) -> usize {
        self.key_bits
    }

    /// DER encoded certificate.
    pub fn certificate(&self) -> &[u8] {
        &self.certificate
    }

    /// DER encoded SubjectPublicKeyInfo.
    pub fn public_key_info(&self) -> &[u8] {
        &self.public_key_info
    }

    pub fn default_signature_algorithm(&self) -> SignatureAlgorithm {
        SignatureAlgorithm::suggested_for(self.key_algorithm, self.key_bits)
    }

    /// Sign `data` with `algorithm`, which must belong to this key's family.
    pub fn sign(&self, algorithm: SignatureAlgorithm, data: &[u8]) -> Result<Vec<u8>, PackagingError> {
        match (&self.key, algorithm) {
            (SigningKey::Rsa(key, _), alg) => {
                let encoding = alg.rsa_encoding().ok_or_else(|| {
                    PackagingError::Config(format!(
                        "{} cannot be used with an RSA key",
                        alg.signing_algorithm_name()
                    ))
                })?;
                let mut sig = vec![0u8; key.public().modulus_len()];
                key.sign(encoding, &self.rng, data, &mut sig)?;
                Ok(sig)
            }
            (SigningKey::Ecdsa(key), SignatureAlgorithm::EcdsaSha256) => {
                Ok(key.sign(&self.rng, data)?.as_ref().to_vec())
            }
            (SigningKey::Ecdsa(_), alg) => Err(PackagingError::Unsupported(format!(
                "{} with a P-256 key",
                alg.signing_algorithm_name()
            ))),
        }
    }

    /// SHA1withRSA (PKCS#1 v1.5) over `data`, for JAR signature blocks that
    /// devices below API level 18 must accept. ECDSA JAR signatures need API 18.
    pub fn sign_sha1_legacy(&self, data: &[u8]) -> Result<Vec<u8>, PackagingError> {
        match &self.key {
            SigningKey::Rsa(_, key) => {
                let hashed = digest::digest(&digest::SHA1_FOR_LEGACY_USE_ONLY, data);
                key.sign(Pkcs1v15Sign::new::<Sha1>(), hashed.as_ref())
                    .map_err(|e| PackagingError::Config(format!("SHA1withRSA signing failed: {}", e)))
            }
            SigningKey::Ecdsa(_) => Err(PackagingError::Unsupported(
                "SHA-1 signature blocks with an EC key (ECDSA JAR signatures need API level 18)"
                    .into(),
            )),
        }
    }

    #[cfg(unix)]
    fn check_key_permissions(path: &Path) -> Result<(), PackagingError> {
        use std::os::unix::fs::PermissionsExt;
        let metadata = std::fs::metadata(path)?;
        let permissions = metadata.permissions().mode();
        if permissions & 0o077 != 0 {
            warn!(
                "Private key '{}' is accessible by others (mode {:o}).",
                path.display(),
                permissions
            );
        }
        Ok(())
    }

    #[cfg(not(unix))]
    fn check_key_permissions(_path: &Path) -> Result<(), PackagingError> {
        Ok(())
    }
}

impl std::fmt::Debug for KeyChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyChain")
            .field("key_algorithm", &self.key_algorithm)
            .field("key_bits", &self.key_bits)
            .finish_non_exhaustive()
    }
}

pub(crate) fn decode_pem_or_der(content: &[u8], what: &str) -> Vec<u8> {
    match pem_crate::parse(content) {
        Ok(pem) => pem.contents().to_vec(),
        Err(_) => {
            debug!("{} is not PEM, treating it as DER", what);
            content.to_vec()
        }
    }
}

/// Verify `signature` over `data` with a DER SubjectPublicKeyInfo.
pub fn verify_with_public_key_info(
    algorithm: SignatureAlgorithm,
    public_key_info: &[u8],
    data: &[u8],
    signature: &[u8],
) -> Result<(), PackagingError> {
    let verification = algorithm.verification_algorithm().ok_or_else(|| {
        PackagingError::Unsupported(format!(
            "verifying {}",
            algorithm.signing_algorithm_name()
        ))
    })?;
    let (_, spki) = SubjectPublicKeyInfo::from_der(public_key_info)
        .map_err(|e| PackagingError::Validation(format!("Invalid public key: {}", e)))?;
    signature::UnparsedPublicKey::new(verification, spki.subject_public_key.data.as_ref())
        .verify(data, signature)
        .map_err(|_| {
            PackagingError::Validation(format!(
                "{} signature does not verify",
                algorithm.signing_algorithm_name()
            ))
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    const RSA_KEY: &[u8] = include_bytes!("../tests/fixtures/rsa_key.pem");
    const RSA_CERT: &[u8] = include_bytes!("../tests/fixtures/rsa_cert.pem");
    const EC_KEY: &[u8] = include_bytes!("../tests/fixtures/ec_key.pem");
    const EC_CERT: &[u8] = include_bytes!("../tests/fixtures/ec_cert.pem");

    #[test]
    fn rsa_key_signs_and_verifies() {
        let keys = KeyChain::from_pem(RSA_KEY, RSA_CERT).unwrap();
        assert_eq!(keys.key_algorithm(), KeyAlgorithm::Rsa);
        assert_eq!(keys.key_bits(), 2048);
        let alg = keys.default_signature_algorithm();
        assert_eq!(alg, SignatureAlgorithm::RsaPkcs1Sha256);
        let sig = keys.sign(alg, b"payload").unwrap();
        verify_with_public_key_info(alg, keys.public_key_info(), b"payload", &sig).unwrap();
        assert!(verify_with_public_key_info(alg, keys.public_key_info(), b"other", &sig).is_err());
    }

    #[test]
    fn ec_key_signs_and_verifies() {
        let keys = KeyChain::from_pem(EC_KEY, EC_CERT).unwrap();
        assert_eq!(keys.key_algorithm(), KeyAlgorithm::Ecdsa);
        assert_eq!(keys.key_algorithm().signature_block_extension(), "EC");
        let alg = keys.default_signature_algorithm();
        assert_eq!(alg, SignatureAlgorithm::EcdsaSha256);
        let sig = keys.sign(alg, b"payload").unwrap();
        verify_with_public_key_info(alg, keys.public_key_info(), b"payload", &sig).unwrap();
        assert!(matches!(
            keys.sign(SignatureAlgorithm::EcdsaSha512, b"payload"),
            Err(PackagingError::Unsupported(_))
        ));
    }

    #[test]
    fn legacy_sha1_signature_verifies() {
        let keys = KeyChain::from_pem(RSA_KEY, RSA_CERT).unwrap();
        let sig = keys.sign_sha1_legacy(b"payload").unwrap();
        let (_, spki) = SubjectPublicKeyInfo::from_der(keys.public_key_info()).unwrap();
        let key = signature::UnparsedPublicKey::new(
            &signature::RSA_PKCS1_2048_8192_SHA1_FOR_LEGACY_USE_ONLY,
            spki.subject_public_key.data.as_ref(),
        );
        key.verify(b"payload", &sig).unwrap();
        assert!(key.verify(b"other", &sig).is_err());
    }

    #[test]
    fn mismatched_key_and_certificate_are_rejected() {
        assert!(matches!(
            KeyChain::from_pem(RSA_KEY, EC_CERT),
            Err(PackagingError::Config(_))
        ));
    }

    #[test]
    fn der_input_is_accepted() {
        let key = pem_crate::parse(RSA_KEY).unwrap().contents().to_vec();
        let cert = pem_crate::parse(RSA_CERT).unwrap().contents().to_vec();
        assert!(KeyChain::from_pem(&key, &cert).is_ok());
    }
}
