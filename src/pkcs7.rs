/*
 * apkzip v1.0.0
 * Copyright (c) 2026 Tiash H Kabir / @MrCarb0n.
 * Licensed under the MIT License.
 */

//! PKCS#7 SignedData blocks (`CERT.RSA`, `CERT.EC`) for JAR signatures.
//!
//! Blocks are detached: the signed content is the signature file stored
//! next to the block. Generated blocks carry no authenticated attributes;
//! parsed blocks may.

use crate::{
    digest::DigestAlgorithm,
    error::PackagingError,
    keys::{KeyAlgorithm, KeyChain},
    signature_algorithm::SignatureAlgorithm,
};
use ring::{digest, signature};
use simple_asn1::{oid, ASN1Block, ASN1Class, BigInt, BigUint, OID};
use x509_parser::der_parser::asn1_rs::{Any, Class, FromDer, Tag};
use x509_parser::prelude::X509Certificate;
use x509_parser::public_key::PublicKey;

pub const OID_SIGNED_DATA: &str = "1.2.840.113549.1.7.2";
pub const OID_SHA1: &str = "1.3.14.3.2.26";
pub const OID_SHA256: &str = "2.16.840.1.101.3.4.2.1";
pub const OID_SHA512: &str = "2.16.840.1.101.3.4.2.3";
const OID_MESSAGE_DIGEST: &str = "1.2.840.113549.1.9.4";

const SEQUENCE: (Class, Tag) = (Class::Universal, Tag::Sequence);
const SET: (Class, Tag) = (Class::Universal, Tag::Set);
const INTEGER: (Class, Tag) = (Class::Universal, Tag::Integer);
const OCTET_STRING: (Class, Tag) = (Class::Universal, Tag::OctetString);
const OBJECT_IDENTIFIER: (Class, Tag) = (Class::Universal, Tag::Oid);
const CONTEXT_0: (Class, Tag) = (Class::ContextSpecific, Tag(0));
const CONTEXT_1: (Class, Tag) = (Class::ContextSpecific, Tag(1));

fn oid_signed_data() -> OID {
    oid!(1, 2, 840, 113549, 1, 7, 2)
}
fn oid_data() -> OID {
    oid!(1, 2, 840, 113549, 1, 7, 1)
}
fn oid_sha1() -> OID {
    oid!(1, 3, 14, 3, 2, 26)
}
fn oid_sha256() -> OID {
    oid!(2, 16, 840, 1, 101, 3, 4, 2, 1)
}
fn oid_rsa() -> OID {
    oid!(1, 2, 840, 113549, 1, 1, 1)
}
fn oid_ec_public_key() -> OID {
    oid!(1, 2, 840, 10045, 2, 1)
}

fn asn1_error(e: impl std::fmt::Display) -> PackagingError {
    PackagingError::Config(format!("ASN1 encode error: {}", e))
}

/// A decoded DER element and its complete encoding.
struct Element<'a> {
    any: Any<'a>,
    raw: &'a [u8],
}

impl<'a> Element<'a> {
    fn body(&self) -> &'a [u8] {
        self.any.data
    }

    fn is(&self, (class, tag): (Class, Tag)) -> bool {
        self.any.class() == class && self.any.tag() == tag
    }

    fn oid(&self) -> Result<String, PackagingError> {
        self.any
            .as_oid()
            .map(|oid| oid.to_id_string())
            .map_err(|e| PackagingError::format(format!("invalid OID: {}", e)))
    }
}

fn next_element(input: &[u8]) -> Result<(Element<'_>, &[u8]), PackagingError> {
    let (rest, any) = Any::from_der(input)
        .map_err(|e| PackagingError::format(format!("malformed DER: {}", e)))?;
    let raw = &input[..input.len() - rest.len()];
    Ok((Element { any, raw }, rest))
}

fn expect_element<'a>(
    input: &'a [u8],
    expected: (Class, Tag),
    what: &str,
) -> Result<(Element<'a>, &'a [u8]), PackagingError> {
    let (element, rest) = next_element(input)?;
    if !element.is(expected) {
        return Err(PackagingError::format(format!(
            "expected {}, found {:?} tag {}",
            what,
            element.any.class(),
            element.any.tag().0
        )));
    }
    Ok((element, rest))
}

/// Wrap already encoded DER so `simple_asn1` emits it unchanged.
fn verbatim(der: &[u8]) -> Result<ASN1Block, PackagingError> {
    let (element, rest) = next_element(der)?;
    if !rest.is_empty() {
        return Err(PackagingError::format("trailing bytes after DER element"));
    }
    let class = match element.any.class() {
        Class::Universal => ASN1Class::Universal,
        Class::Application => ASN1Class::Application,
        Class::ContextSpecific => ASN1Class::ContextSpecific,
        Class::Private => ASN1Class::Private,
    };
    Ok(ASN1Block::Unknown(
        class,
        element.any.header.is_constructed(),
        0,
        BigUint::from(element.any.tag().0),
        element.body().to_vec(),
    ))
}

fn algorithm_identifier(oid: OID) -> ASN1Block {
    ASN1Block::Sequence(0, vec![ASN1Block::ObjectIdentifier(0, oid), ASN1Block::Null(0)])
}

/// Algorithm used for SHA-256 JAR signature blocks made with `keys`.
pub fn block_signature_algorithm(keys: &KeyChain) -> SignatureAlgorithm {
    match keys.key_algorithm() {
        KeyAlgorithm::Ecdsa => SignatureAlgorithm::EcdsaSha256,
        _ => SignatureAlgorithm::RsaPkcs1Sha256,
    }
}

/// Generates a detached PKCS#7 SignedData over `content` (the signature file).
///
/// `digest` is the digest of the manifest and signature file; SHA-1 blocks
/// are signed SHA1withRSA so that devices below API level 18 accept them.
pub fn sign(
    keys: &KeyChain,
    digest: DigestAlgorithm,
    content: &[u8],
) -> Result<Vec<u8>, PackagingError> {
    let cert_der = keys.certificate();
    let (_, cert) = X509Certificate::from_der(cert_der)
        .map_err(|e| PackagingError::Config(format!("Failed to parse cert for PKCS7: {}", e)))?;
    let issuer = verbatim(cert.tbs_certificate.issuer.as_raw())?;
    let serial = BigInt::from_signed_bytes_be(cert.tbs_certificate.raw_serial());

    let (digest_oid, signature_bytes) = match digest {
        DigestAlgorithm::Sha256 => (
            oid_sha256(),
            keys.sign(block_signature_algorithm(keys), content)?,
        ),
        DigestAlgorithm::Sha1 => (oid_sha1(), keys.sign_sha1_legacy(content)?),
    };
    let encryption_oid = match keys.key_algorithm() {
        KeyAlgorithm::Ecdsa => oid_ec_public_key(),
        _ => oid_rsa(),
    };

    let signer_info = ASN1Block::Sequence(
        0,
        vec![
            ASN1Block::Integer(0, BigInt::from(1u32)),
            ASN1Block::Sequence(0, vec![issuer, ASN1Block::Integer(0, serial)]),
            algorithm_identifier(digest_oid.clone()),
            algorithm_identifier(encryption_oid),
            ASN1Block::OctetString(0, signature_bytes),
        ],
    );

    let signed_data = vec![
        ASN1Block::Integer(0, BigInt::from(1u32)),
        ASN1Block::Set(0, vec![algorithm_identifier(digest_oid)]),
        // Detached: encapContentInfo carries only the content type.
        ASN1Block::Sequence(0, vec![ASN1Block::ObjectIdentifier(0, oid_data())]),
        // certificates [0] IMPLICIT SET OF Certificate, a single certificate here.
        ASN1Block::Explicit(
            ASN1Class::ContextSpecific,
            0,
            BigUint::from(0u32),
            Box::new(verbatim(cert_der)?),
        ),
        ASN1Block::Set(0, vec![signer_info]),
    ];

    let content_info = vec![
        ASN1Block::ObjectIdentifier(0, oid_signed_data()),
        ASN1Block::Explicit(
            ASN1Class::ContextSpecific,
            0,
            BigUint::from(0u32),
            Box::new(ASN1Block::Sequence(0, signed_data)),
        ),
    ];

    simple_asn1::to_der(&ASN1Block::Sequence(0, content_info)).map_err(asn1_error)
}

/// The parts of a SignedData block needed to check a JAR signature.
#[derive(Debug, Clone)]
pub struct SignedData {
    pub certificates: Vec<Vec<u8>>,
    /// Dotted OID of the signer's digest algorithm.
    pub digest_oid: String,
    /// Dotted OID of the signer's signature (encryption) algorithm.
    pub signature_oid: String,
    /// Authenticated attributes re-tagged as a DER SET, ready to verify.
    pub signed_attributes: Option<Vec<u8>>,
    pub message_digest: Option<Vec<u8>>,
    pub signature: Vec<u8>,
}

impl SignedData {
    pub fn parse(der: &[u8]) -> Result<Self, PackagingError> {
        let (content_info, _) = expect_element(der, SEQUENCE, "ContentInfo")?;
        let (content_type, rest) =
            expect_element(content_info.body(), OBJECT_IDENTIFIER, "content type")?;
        if content_type.oid()? != OID_SIGNED_DATA {
            return Err(PackagingError::format("signature block is not SignedData"));
        }
        let (explicit, _) = expect_element(rest, CONTEXT_0, "SignedData content")?;
        let (signed_data, _) = expect_element(explicit.body(), SEQUENCE, "SignedData")?;

        let (_version, rest) = expect_element(signed_data.body(), INTEGER, "version")?;
        let (_digest_algorithms, rest) = expect_element(rest, SET, "digestAlgorithms")?;
        let (_encap, mut rest) = expect_element(rest, SEQUENCE, "encapContentInfo")?;

        let mut certificates = Vec::new();
        loop {
            let (element, next) = next_element(rest)?;
            if element.is(CONTEXT_0) {
                let mut certs = element.body();
                while !certs.is_empty() {
                    let (cert, more) = next_element(certs)?;
                    certificates.push(cert.raw.to_vec());
                    certs = more;
                }
            } else if !element.is(CONTEXT_1) {
                break;
            }
            rest = next;
        }

        let (signer_infos, _) = expect_element(rest, SET, "signerInfos")?;
        let (signer, _) = expect_element(signer_infos.body(), SEQUENCE, "SignerInfo")?;
        let (_version, rest) = expect_element(signer.body(), INTEGER, "SignerInfo version")?;
        let (_sid, rest) = next_element(rest)?;
        let (digest_alg, rest) = expect_element(rest, SEQUENCE, "digestAlgorithm")?;
        let (digest_oid, _) = expect_element(digest_alg.body(), OBJECT_IDENTIFIER, "digest OID")?;

        let (next, mut rest) = next_element(rest)?;
        let mut signed_attributes = None;
        let mut message_digest = None;
        let signature_alg = if next.is(CONTEXT_0) {
            let mut set = next.raw.to_vec();
            // [0] IMPLICIT is signed as a universal SET.
            set[0] = 0x31;
            signed_attributes = Some(set);
            message_digest = find_message_digest(next.body())?;
            let (alg, after) = expect_element(rest, SEQUENCE, "signatureAlgorithm")?;
            rest = after;
            alg
        } else {
            next
        };
        let (signature_oid, _) =
            expect_element(signature_alg.body(), OBJECT_IDENTIFIER, "signature OID")?;
        let (signature, _) = expect_element(rest, OCTET_STRING, "signature")?;

        Ok(Self {
            certificates,
            digest_oid: digest_oid.oid()?,
            signature_oid: signature_oid.oid()?,
            signed_attributes,
            message_digest,
            signature: signature.body().to_vec(),
        })
    }

    /// Check the signature over detached `content`, returning the signer certificate.
    pub fn verify(&self, content: &[u8]) -> Result<&[u8], PackagingError> {
        let cert_der = self
            .certificates
            .first()
            .ok_or_else(|| PackagingError::Validation("signature block has no certificate".into()))?;
        let (_, cert) = X509Certificate::from_der(cert_der)
            .map_err(|e| PackagingError::Validation(format!("Invalid signer certificate: {}", e)))?;
        let spki = cert.public_key();

        let digest_alg = match self.digest_oid.as_str() {
            OID_SHA256 => &digest::SHA256,
            OID_SHA1 => &digest::SHA1_FOR_LEGACY_USE_ONLY,
            OID_SHA512 => &digest::SHA512,
            other => {
                return Err(PackagingError::Unsupported(format!(
                    "signature block digest algorithm {}",
                    other
                )))
            }
        };

        let verification: &dyn signature::VerificationAlgorithm = match spki.parsed() {
            Ok(PublicKey::RSA(_)) if digest_alg == &digest::SHA256 => {
                &signature::RSA_PKCS1_2048_8192_SHA256
            }
            Ok(PublicKey::RSA(_)) if digest_alg == &digest::SHA512 => {
                &signature::RSA_PKCS1_2048_8192_SHA512
            }
            Ok(PublicKey::RSA(_)) => &signature::RSA_PKCS1_2048_8192_SHA1_FOR_LEGACY_USE_ONLY,
            Ok(PublicKey::EC(_)) if digest_alg == &digest::SHA256 => {
                &signature::ECDSA_P256_SHA256_ASN1
            }
            _ => {
                return Err(PackagingError::Unsupported(
                    "signature block key and digest combination".into(),
                ))
            }
        };

        let signed: &[u8] = match &self.signed_attributes {
            Some(attributes) => {
                let expected = self.message_digest.as_deref().ok_or_else(|| {
                    PackagingError::Validation("signed attributes lack messageDigest".into())
                })?;
                if digest::digest(digest_alg, content).as_ref() != expected {
                    return Err(PackagingError::Validation(
                        "messageDigest does not match the signature file".into(),
                    ));
                }
                attributes
            }
            None => content,
        };

        signature::UnparsedPublicKey::new(verification, spki.subject_public_key.data.as_ref())
            .verify(signed, &self.signature)
            .map_err(|_| PackagingError::Validation("signature block does not verify".into()))?;
        Ok(cert_der)
    }
}

fn find_message_digest(mut attributes: &[u8]) -> Result<Option<Vec<u8>>, PackagingError> {
    while !attributes.is_empty() {
        let (attribute, rest) = expect_element(attributes, SEQUENCE, "attribute")?;
        let (attr_type, values) =
            expect_element(attribute.body(), OBJECT_IDENTIFIER, "attribute type")?;
        if attr_type.oid()? == OID_MESSAGE_DIGEST {
            let (set, _) = expect_element(values, SET, "attribute values")?;
            let (value, _) = expect_element(set.body(), OCTET_STRING, "messageDigest")?;
            return Ok(Some(value.body().to_vec()));
        }
        attributes = rest;
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    const RSA_KEY: &[u8] = include_bytes!("../tests/fixtures/rsa_key.pem");
    const RSA_CERT: &[u8] = include_bytes!("../tests/fixtures/rsa_cert.pem");
    const EC_KEY: &[u8] = include_bytes!("../tests/fixtures/ec_key.pem");
    const EC_CERT: &[u8] = include_bytes!("../tests/fixtures/ec_cert.pem");

    #[test]
    fn raw_blocks_are_emitted_verbatim() {
        let cert = pem::parse(RSA_CERT).unwrap().contents().to_vec();
        let encoded = simple_asn1::to_der(&verbatim(&cert).unwrap()).unwrap();
        assert_eq!(encoded, cert);
    }

    #[test]
    fn rsa_block_round_trip() {
        let keys = KeyChain::from_pem(RSA_KEY, RSA_CERT).unwrap();
        let block = sign(&keys, DigestAlgorithm::Sha256, b"Signature-Version: 1.0\r\n\r\n").unwrap();
        let parsed = SignedData::parse(&block).unwrap();
        assert_eq!(parsed.certificates, vec![keys.certificate().to_vec()]);
        assert_eq!(parsed.digest_oid, OID_SHA256);
        assert!(parsed.signed_attributes.is_none());
        assert_eq!(
            parsed.verify(b"Signature-Version: 1.0\r\n\r\n").unwrap(),
            keys.certificate()
        );
        assert!(parsed.verify(b"Signature-Version: 1.1\r\n\r\n").is_err());
    }

    #[test]
    fn sha1_block_uses_sha1_with_rsa() {
        let keys = KeyChain::from_pem(RSA_KEY, RSA_CERT).unwrap();
        let block = sign(&keys, DigestAlgorithm::Sha1, b"content").unwrap();
        let parsed = SignedData::parse(&block).unwrap();
        assert_eq!(parsed.digest_oid, OID_SHA1);
        assert_eq!(parsed.signature_oid, "1.2.840.113549.1.1.1");
        assert_eq!(parsed.verify(b"content").unwrap(), keys.certificate());
        assert!(parsed.verify(b"tampered").is_err());
    }

    #[test]
    fn ec_block_round_trip() {
        let keys = KeyChain::from_pem(EC_KEY, EC_CERT).unwrap();
        let block = sign(&keys, DigestAlgorithm::Sha256, b"content").unwrap();
        let parsed = SignedData::parse(&block).unwrap();
        assert_eq!(parsed.signature_oid, "1.2.840.10045.2.1");
        parsed.verify(b"content").unwrap();
    }

    #[test]
    fn ec_keys_cannot_make_sha1_blocks() {
        let keys = KeyChain::from_pem(EC_KEY, EC_CERT).unwrap();
        assert!(matches!(
            sign(&keys, DigestAlgorithm::Sha1, b"content"),
            Err(PackagingError::Unsupported(_))
        ));
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(SignedData::parse(b"\x30\x03\x02\x01\x01").is_err());
        assert!(SignedData::parse(&[]).is_err());
        assert!(SignedData::parse(b"\x30\x82\x01").is_err());
    }
}
