/*
 * apkzip v1.0.0
 * Copyright (c) 2026 Tiash H Kabir / @MrCarb0n.
 * Licensed under the MIT License.
 */

//! APK Signature Scheme v2.
//!
//! The APK signing block sits between the last entry and the central
//! directory:
//!
//! ```text
//! u64 size | (u64 len, u32 id, value)* | u64 size | "APK Sig Block 42"
//! ```
//!
//! The v2 pair holds length-prefixed signers, each with signed data
//! (content digests, certificates, attributes), signatures over the signed
//! data and the signer's public key. Content digests cover the entries, the
//! central directory and the EOCD with its directory offset pointing at the
//! signing block.

use crate::{
    crypto::CryptoEngine,
    error::PackagingError,
    keys::{verify_with_public_key_info, KeyChain},
    signature_algorithm::{ContentDigestAlgorithm, SignatureAlgorithm},
    zfile::{records, ZFile},
};
use byteorder::{ByteOrder, LittleEndian as LE, WriteBytesExt};
use std::collections::BTreeMap;
use tracing::{debug, trace};
use x509_parser::prelude::*;

pub const APK_SIGNATURE_SCHEME_V2_BLOCK_ID: u32 = 0x7109_871a;
pub const APK_SIG_BLOCK_MAGIC: &[u8; 16] = b"APK Sig Block 42";
const APK_SIG_BLOCK_MIN_SIZE: usize = 32;
/// Offset of the central directory offset field within the EOCD.
const EOCD_CD_OFFSET_FIELD: usize = 16;

fn put_prefixed(out: &mut Vec<u8>, data: &[u8]) -> Result<(), PackagingError> {
    let len = u32::try_from(data.len())
        .map_err(|_| PackagingError::Unsupported("signing block field over 4 GiB".into()))?;
    out.write_u32::<LE>(len)?;
    out.extend_from_slice(data);
    Ok(())
}

fn prefixed_sequence(items: &[Vec<u8>]) -> Result<Vec<u8>, PackagingError> {
    let mut out = Vec::new();
    for item in items {
        put_prefixed(&mut out, item)?;
    }
    Ok(out)
}

fn id_and_value(id: u32, value: &[u8]) -> Result<Vec<u8>, PackagingError> {
    let mut out = Vec::with_capacity(8 + value.len());
    out.write_u32::<LE>(id)?;
    put_prefixed(&mut out, value)?;
    Ok(out)
}

/// Bounds-checked little endian reader over a byte slice.
struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    fn bytes(&mut self, len: usize) -> Result<&'a [u8], PackagingError> {
        if len > self.buf.len() {
            return Err(PackagingError::format("truncated APK signing block field"));
        }
        let (head, tail) = self.buf.split_at(len);
        self.buf = tail;
        Ok(head)
    }

    fn u32(&mut self) -> Result<u32, PackagingError> {
        Ok(LE::read_u32(self.bytes(4)?))
    }

    fn u64(&mut self) -> Result<u64, PackagingError> {
        Ok(LE::read_u64(self.bytes(8)?))
    }

    fn prefixed(&mut self) -> Result<Reader<'a>, PackagingError> {
        let len = self.u32()? as usize;
        Ok(Reader::new(self.bytes(len)?))
    }
}

/// Content digests of an APK for each requested algorithm.
///
/// `eocd` is patched so that its directory offset equals `entries.len()`,
/// where the signing block starts.
pub fn compute_content_digests(
    algorithms: &[ContentDigestAlgorithm],
    entries: &[u8],
    central_directory: &[u8],
    eocd: &[u8],
) -> Result<BTreeMap<ContentDigestAlgorithm, Vec<u8>>, PackagingError> {
    if eocd.len() < records::EOCD_LEN {
        return Err(PackagingError::format("EOCD too short"));
    }
    let mut patched_eocd = eocd.to_vec();
    LE::write_u32(
        &mut patched_eocd[EOCD_CD_OFFSET_FIELD..EOCD_CD_OFFSET_FIELD + 4],
        records::offset_u32(entries.len() as u64)?,
    );
    let sections = [entries, central_directory, patched_eocd.as_slice()];
    Ok(algorithms
        .iter()
        .map(|&alg| (alg, CryptoEngine::chunked_digest(alg, &sections)))
        .collect())
}

/// Builds and writes v2 signatures.
pub struct V2Signer<'a> {
    keys: &'a KeyChain,
    algorithms: Vec<SignatureAlgorithm>,
}

impl<'a> V2Signer<'a> {
    /// Sign with the algorithm suggested for the key.
    pub fn new(keys: &'a KeyChain) -> Self {
        Self {
            algorithms: vec![keys.default_signature_algorithm()],
            keys,
        }
    }

    pub fn with_algorithms(keys: &'a KeyChain, algorithms: Vec<SignatureAlgorithm>) -> Self {
        Self { keys, algorithms }
    }

    pub fn algorithms(&self) -> &[SignatureAlgorithm] {
        &self.algorithms
    }

    /// Commit `zfile`, then insert a signing block in front of its central directory.
    pub fn sign(&self, zfile: &mut ZFile) -> Result<(), PackagingError> {
        zfile.set_pre_directory_block(None);
        zfile.update()?;
        let layout = zfile
            .layout()
            .ok_or_else(|| PackagingError::Validation("archive not committed".into()))?;
        let bytes = std::fs::read(zfile.path())?;
        if bytes.len() as u64 != layout.file_len {
            return Err(PackagingError::Validation(
                "archive changed on disk while signing".into(),
            ));
        }
        let block = self.signing_block(
            &bytes[..layout.entries_end as usize],
            &bytes[layout.cd_offset as usize..layout.eocd_offset as usize],
            &bytes[layout.eocd_offset as usize..],
        )?;
        debug!(bytes = block.len(), "built APK signing block");
        zfile.set_pre_directory_block(Some(block));
        zfile.update()
    }

    /// Complete APK signing block for the given archive sections.
    pub fn signing_block(
        &self,
        entries: &[u8],
        central_directory: &[u8],
        eocd: &[u8],
    ) -> Result<Vec<u8>, PackagingError> {
        if self.algorithms.is_empty() {
            return Err(PackagingError::Config("no v2 signature algorithms".into()));
        }
        let mut content_algorithms: Vec<ContentDigestAlgorithm> = self
            .algorithms
            .iter()
            .map(|a| a.content_digest_algorithm())
            .collect();
        content_algorithms.sort();
        content_algorithms.dedup();
        let digests =
            compute_content_digests(&content_algorithms, entries, central_directory, eocd)?;

        let digest_records = self
            .algorithms
            .iter()
            .map(|alg| id_and_value(alg.id(), &digests[&alg.content_digest_algorithm()]))
            .collect::<Result<Vec<_>, _>>()?;

        let mut signed_data = Vec::new();
        put_prefixed(&mut signed_data, &prefixed_sequence(&digest_records)?)?;
        put_prefixed(
            &mut signed_data,
            &prefixed_sequence(&[self.keys.certificate().to_vec()])?,
        )?;
        put_prefixed(&mut signed_data, &[])?;

        let signature_records = self
            .algorithms
            .iter()
            .map(|&alg| id_and_value(alg.id(), &self.keys.sign(alg, &signed_data)?))
            .collect::<Result<Vec<_>, _>>()?;

        let mut signer = Vec::new();
        put_prefixed(&mut signer, &signed_data)?;
        put_prefixed(&mut signer, &prefixed_sequence(&signature_records)?)?;
        put_prefixed(&mut signer, self.keys.public_key_info())?;

        let mut value = Vec::new();
        put_prefixed(&mut value, &prefixed_sequence(&[signer])?)?;
        encode_signing_block(&[(APK_SIGNATURE_SCHEME_V2_BLOCK_ID, value)])
    }
}

/// Wrap `(id, value)` pairs into an APK signing block.
pub fn encode_signing_block(pairs: &[(u32, Vec<u8>)]) -> Result<Vec<u8>, PackagingError> {
    let pairs_len: usize = pairs.iter().map(|(_, v)| 12 + v.len()).sum();
    // Both size fields count everything after the leading one.
    let size = (pairs_len + 8 + APK_SIG_BLOCK_MAGIC.len()) as u64;
    let mut out = Vec::with_capacity(size as usize + 8);
    out.write_u64::<LE>(size)?;
    for (id, value) in pairs {
        out.write_u64::<LE>(4 + value.len() as u64)?;
        out.write_u32::<LE>(*id)?;
        out.extend_from_slice(value);
    }
    out.write_u64::<LE>(size)?;
    out.extend_from_slice(APK_SIG_BLOCK_MAGIC);
    Ok(out)
}

/// An APK signing block found in front of the central directory.
#[derive(Debug, Clone)]
pub struct SigningBlock<'a> {
    /// Offset of the block in the file.
    pub offset: u64,
    pairs: Vec<(u32, &'a [u8])>,
}

impl<'a> SigningBlock<'a> {
    /// Locate the block ending at `cd_offset` in `apk`, if there is one.
    pub fn find(apk: &'a [u8], cd_offset: u64) -> Result<Option<Self>, PackagingError> {
        let cd_offset = cd_offset as usize;
        if cd_offset < APK_SIG_BLOCK_MIN_SIZE || cd_offset > apk.len() {
            return Ok(None);
        }
        let footer = &apk[cd_offset - 24..cd_offset];
        if &footer[8..] != APK_SIG_BLOCK_MAGIC {
            return Ok(None);
        }
        let size = LE::read_u64(&footer[..8]) as usize;
        if size < 24 || size > cd_offset - 8 {
            return Err(PackagingError::format("APK signing block size out of range"));
        }
        let start = cd_offset - size - 8;
        if LE::read_u64(&apk[start..start + 8]) as usize != size {
            return Err(PackagingError::format("APK signing block sizes disagree"));
        }

        let mut reader = Reader::new(&apk[start + 8..cd_offset - 24]);
        let mut pairs = Vec::new();
        while !reader.is_empty() {
            let len = reader.u64()? as usize;
            if len < 4 {
                return Err(PackagingError::format("APK signing block pair too short"));
            }
            let mut pair = Reader::new(reader.bytes(len)?);
            let id = pair.u32()?;
            pairs.push((id, pair.buf));
        }
        Ok(Some(Self {
            offset: start as u64,
            pairs,
        }))
    }

    pub fn get(&self, id: u32) -> Option<&'a [u8]> {
        self.pairs.iter().find(|(i, _)| *i == id).map(|(_, v)| *v)
    }

    pub fn ids(&self) -> impl Iterator<Item = u32> + '_ {
        self.pairs.iter().map(|(id, _)| *id)
    }
}

/// A signer whose v2 signature checked out.
#[derive(Debug, Clone)]
pub struct VerifiedSigner {
    pub algorithm: SignatureAlgorithm,
    pub certificates: Vec<Vec<u8>>,
}

/// Verify the v2 signature of `apk`.
///
/// Returns `Ok(None)` when the APK has no v2 signature block.
pub fn verify(apk: &[u8]) -> Result<Option<Vec<VerifiedSigner>>, PackagingError> {
    let tail_len = apk.len().min(records::EOCD_LEN + records::MAX_EOCD_COMMENT);
    let location = records::locate_directory(&apk[apk.len() - tail_len..], apk.len() as u64)?;
    let cd_offset = location.cd_offset();
    let Some(block) = SigningBlock::find(apk, cd_offset)? else {
        return Ok(None);
    };
    let Some(signers) = block.get(APK_SIGNATURE_SCHEME_V2_BLOCK_ID) else {
        return Ok(None);
    };

    let mut signers = Reader::new(signers).prefixed()?;
    let mut verified = Vec::new();
    let mut wanted_digests: BTreeMap<ContentDigestAlgorithm, Vec<Vec<u8>>> = BTreeMap::new();
    while !signers.is_empty() {
        let mut signer = signers.prefixed()?;
        let (signer, expected) = verify_signer(&mut signer)?;
        for (alg, digest) in expected {
            wanted_digests.entry(alg).or_default().push(digest);
        }
        verified.push(signer);
    }
    if verified.is_empty() {
        return Err(PackagingError::Validation("v2 block has no signers".into()));
    }

    let algorithms: Vec<ContentDigestAlgorithm> = wanted_digests.keys().copied().collect();
    let actual = compute_content_digests(
        &algorithms,
        &apk[..block.offset as usize],
        &apk[cd_offset as usize..location.eocd_offset as usize],
        &apk[location.eocd_offset as usize..],
    )?;
    for (alg, expected) in &wanted_digests {
        if expected.iter().any(|d| d != &actual[alg]) {
            return Err(PackagingError::Validation(format!(
                "v2 content digest mismatch ({:?})",
                alg
            )));
        }
    }
    debug!(signers = verified.len(), "v2 signature verified");
    Ok(Some(verified))
}

type ExpectedDigests = Vec<(ContentDigestAlgorithm, Vec<u8>)>;

fn verify_signer(signer: &mut Reader<'_>) -> Result<(VerifiedSigner, ExpectedDigests), PackagingError> {
    let signed_data_bytes = signer.prefixed()?.buf;
    let mut signatures = signer.prefixed()?;
    let public_key = signer.prefixed()?.buf;

    let mut offered = Vec::new();
    while !signatures.is_empty() {
        let mut record = signatures.prefixed()?;
        let id = record.u32()?;
        let sig = record.prefixed()?.buf;
        offered.push((id, sig));
    }
    if offered.is_empty() {
        return Err(PackagingError::Validation("v2 signer has no signatures".into()));
    }
    let (algorithm, sig) = offered
        .iter()
        .filter_map(|(id, sig)| SignatureAlgorithm::from_id(*id).map(|a| (a, *sig)))
        .filter(|(a, _)| a.verification_algorithm().is_some())
        .max_by_key(|(a, _)| a.content_digest_algorithm())
        .ok_or_else(|| {
            PackagingError::Unsupported("none of the v2 signature algorithms".into())
        })?;
    verify_with_public_key_info(algorithm, public_key, signed_data_bytes, sig)?;
    trace!(algorithm = algorithm.signing_algorithm_name(), "v2 signer signature ok");

    let mut signed_data = Reader::new(signed_data_bytes);
    let mut digests = signed_data.prefixed()?;
    let mut certificates_reader = signed_data.prefixed()?;

    let mut digest_ids = Vec::new();
    let mut expected = Vec::new();
    while !digests.is_empty() {
        let mut record = digests.prefixed()?;
        let id = record.u32()?;
        let value = record.prefixed()?.buf;
        digest_ids.push(id);
        if let Some(alg) = SignatureAlgorithm::from_id(id) {
            expected.push((alg.content_digest_algorithm(), value.to_vec()));
        }
    }
    let signature_ids: Vec<u32> = offered.iter().map(|(id, _)| *id).collect();
    if digest_ids != signature_ids {
        return Err(PackagingError::Validation(
            "v2 signature and digest algorithm lists differ".into(),
        ));
    }

    let mut certificates = Vec::new();
    while !certificates_reader.is_empty() {
        certificates.push(certificates_reader.prefixed()?.buf.to_vec());
    }
    let first = certificates
        .first()
        .ok_or_else(|| PackagingError::Validation("v2 signer has no certificate".into()))?;
    let (_, cert) = X509Certificate::from_der(first)
        .map_err(|e| PackagingError::Validation(format!("Invalid v2 certificate: {}", e)))?;
    if cert.public_key().raw != public_key {
        return Err(PackagingError::Validation(
            "v2 public key does not match the first certificate".into(),
        ));
    }

    Ok((
        VerifiedSigner {
            algorithm,
            certificates,
        },
        expected,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_layout() {
        let block = encode_signing_block(&[(APK_SIGNATURE_SCHEME_V2_BLOCK_ID, vec![1, 2, 3])]).unwrap();
        assert_eq!(block.len(), 8 + 12 + 3 + 8 + 16);
        assert_eq!(LE::read_u64(&block[..8]), block.len() as u64 - 8);
        assert!(block.ends_with(APK_SIG_BLOCK_MAGIC));

        let mut apk = vec![0u8; 10];
        apk.extend_from_slice(&block);
        let found = SigningBlock::find(&apk, apk.len() as u64).unwrap().unwrap();
        assert_eq!(found.offset, 10);
        assert_eq!(found.get(APK_SIGNATURE_SCHEME_V2_BLOCK_ID), Some(&[1u8, 2, 3][..]));
        assert_eq!(found.ids().collect::<Vec<_>>(), vec![APK_SIGNATURE_SCHEME_V2_BLOCK_ID]);
    }

    #[test]
    fn no_block_without_magic() {
        let apk = vec![0u8; 100];
        assert!(SigningBlock::find(&apk, 100).unwrap().is_none());
        assert!(SigningBlock::find(&apk, 4).unwrap().is_none());
    }

    #[test]
    fn eocd_offset_is_patched_before_digesting() {
        let mut eocd = Vec::new();
        records::EndOfCentralDirectory::for_directory(0, 0, 999, vec![])
            .unwrap()
            .write_to(&mut eocd)
            .unwrap();
        let a = compute_content_digests(&[ContentDigestAlgorithm::ChunkedSha256], b"entries", b"", &eocd).unwrap();
        let mut patched = Vec::new();
        records::EndOfCentralDirectory::for_directory(0, 0, 7, vec![])
            .unwrap()
            .write_to(&mut patched)
            .unwrap();
        let b = compute_content_digests(&[ContentDigestAlgorithm::ChunkedSha256], b"entries", b"", &patched).unwrap();
        assert_eq!(a, b);
    }
}
