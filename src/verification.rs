/*
 * apkzip v1.0.0
 * Copyright (c) 2026 Tiash H Kabir / @MrCarb0n.
 * Licensed under the MIT License.
 */

use rayon::prelude::*;
use std::io::{Cursor, Read};
use std::path::Path;
use tracing::{debug, warn};
use zip::ZipArchive;

use crate::{
    crypto::CryptoEngine,
    digest::DigestAlgorithm,
    error::PackagingError,
    manifest::{Sections, ANDROID_APK_SIGNED},
    pkcs7::SignedData,
    scheme_v2::{self, VerifiedSigner},
    signing::is_signature_file,
    BUFFER_SIZE, MANIFEST_NAME,
};

/// Outcome of a successful v1 check.
#[derive(Debug, Clone)]
pub struct JarVerification {
    /// Signature file whose signature verified, e.g. `META-INF/CERT.SF`.
    pub signature_file: String,
    pub certificate: Vec<u8>,
    pub entries_verified: usize,
    /// Signature schemes the `.SF` claims were applied in addition to v1.
    pub stripped_scheme_ids: Vec<u32>,
}

#[derive(Debug, Clone, Default)]
pub struct VerificationReport {
    pub v1: Option<JarVerification>,
    pub v2: Option<Vec<VerifiedSigner>>,
}

impl VerificationReport {
    pub fn is_signed(&self) -> bool {
        self.v1.is_some() || self.v2.is_some()
    }

    /// Signer certificate, preferring the v2 one.
    pub fn signer_certificate(&self) -> Option<&[u8]> {
        self.v2
            .as_ref()
            .and_then(|signers| signers.first())
            .and_then(|s| s.certificates.first())
            .map(Vec::as_slice)
            .or_else(|| self.v1.as_ref().map(|v1| v1.certificate.as_slice()))
    }
}

/// Verifies v1 (JAR) and v2 signatures on signed ZIP/APK/JAR archives.
pub struct ArtifactVerifier;

impl ArtifactVerifier {
    /// Verify every signature present in `path`.
    ///
    /// Fails when the archive carries no signature, when any present
    /// signature is invalid, or when `expected_cert` is given and a signer
    /// certificate differs from it.
    pub fn verify(
        path: &Path,
        expected_cert: Option<&[u8]>,
    ) -> Result<VerificationReport, PackagingError> {
        let bytes = std::fs::read(path)?;
        Self::verify_bytes(&bytes, expected_cert)
    }

    pub fn verify_bytes(
        bytes: &[u8],
        expected_cert: Option<&[u8]>,
    ) -> Result<VerificationReport, PackagingError> {
        let v2 = scheme_v2::verify(bytes)?;
        let v1 = Self::verify_jar(bytes)?;

        if let (Some(jar), None) = (&v1, &v2) {
            if jar.stripped_scheme_ids.contains(&2) {
                return Err(PackagingError::Validation(
                    "APK was signed with v2 but its v2 signature is missing".into(),
                ));
            }
        }
        let report = VerificationReport { v1, v2 };
        if !report.is_signed() {
            return Err(PackagingError::Validation("archive is not signed".into()));
        }

        if let Some(expected) = expected_cert {
            let expected = crate::keys::decode_pem_or_der(expected, "expected certificate");
            let mut certs = Vec::new();
            if let Some(jar) = &report.v1 {
                certs.push(jar.certificate.as_slice());
            }
            for signer in report.v2.iter().flatten() {
                certs.extend(signer.certificates.first().map(Vec::as_slice));
            }
            if certs.iter().any(|c| *c != expected.as_slice()) {
                return Err(PackagingError::Validation(
                    "signer certificate does not match the expected certificate".into(),
                ));
            }
        }
        Ok(report)
    }

    /// Check the JAR signature. `Ok(None)` when no `.SF` file exists.
    pub fn verify_jar(bytes: &[u8]) -> Result<Option<JarVerification>, PackagingError> {
        let mut archive = ZipArchive::new(Cursor::new(bytes))?;
        let names: Vec<String> = archive.file_names().map(str::to_string).collect();

        let mut sf_names: Vec<&String> = names
            .iter()
            .filter(|n| is_signature_file(n) && n.to_ascii_uppercase().ends_with(".SF"))
            .collect();
        sf_names.sort();
        let Some(sf_name) = sf_names.first().copied() else {
            return Ok(None);
        };
        if sf_names.len() > 1 {
            warn!(count = sf_names.len(), "multiple JAR signers; checking {}", sf_name);
        }

        let stem = &sf_name[..sf_name.len() - 3];
        let block_name = names
            .iter()
            .find(|n| {
                n.len() > stem.len()
                    && n.starts_with(stem)
                    && matches!(
                        n[stem.len()..].to_ascii_uppercase().as_str(),
                        ".RSA" | ".EC" | ".DSA"
                    )
            })
            .ok_or_else(|| {
                PackagingError::Validation(format!("No signature block found for {}", sf_name))
            })?;

        let sf = read_whole(&mut archive, sf_name)?;
        let block = read_whole(&mut archive, block_name)?;
        let manifest = read_whole(&mut archive, MANIFEST_NAME).map_err(|e| {
            PackagingError::Validation(format!("No Manifest file found ({}): {}", MANIFEST_NAME, e))
        })?;

        let signed_data = SignedData::parse(&block)?;
        let certificate = signed_data.verify(&sf)?.to_vec();
        debug!(block = %block_name, "signature block verified");

        let sf_sections = Sections::parse(&sf)?;
        let manifest_sections = Sections::parse(&manifest)?;
        Self::check_signature_file(&sf_sections, &manifest_sections, &manifest)?;

        let stripped_scheme_ids = sf_sections
            .main
            .attributes
            .get(ANDROID_APK_SIGNED)
            .map(|v| {
                v.split(',')
                    .filter_map(|id| id.trim().parse::<u32>().ok())
                    .collect()
            })
            .unwrap_or_default();

        let entries_verified = Self::check_entries(bytes, &names, &manifest_sections)?;
        Ok(Some(JarVerification {
            signature_file: sf_name.clone(),
            certificate,
            entries_verified,
            stripped_scheme_ids,
        }))
    }

    /// The `.SF` must vouch for the manifest: either the whole-manifest
    /// digest matches, or every manifest section digest does.
    fn check_signature_file(
        sf: &Sections,
        manifest: &Sections,
        manifest_bytes: &[u8],
    ) -> Result<(), PackagingError> {
        let whole = DigestAlgorithm::ALL.iter().copied().find_map(|alg| {
            sf.main
                .attributes
                .get(&alg.manifest_attribute_name())
                .map(|value| (alg, value))
        });
        if let Some((alg, value)) = whole {
            if CryptoEngine::decode_base64(value)? == CryptoEngine::digest(alg, manifest_bytes) {
                return Ok(());
            }
            debug!("whole-manifest digest mismatch, checking sections");
        }

        for section in &manifest.entries {
            let name = section.name.as_deref().unwrap_or_default();
            let sf_section = sf.get(name).ok_or_else(|| {
                PackagingError::Validation(format!("SF missing entry for {}", name))
            })?;
            let (alg, value) = entry_digest(&sf_section.attributes).ok_or_else(|| {
                PackagingError::Validation(format!("SF entry for {} has no digest", name))
            })?;
            let section_bytes = &manifest_bytes[section.range.clone()];
            if CryptoEngine::decode_base64(value)? != CryptoEngine::digest(alg, section_bytes) {
                return Err(PackagingError::Validation(format!("SF digest mismatch for {}", name)));
            }
        }
        Ok(())
    }

    /// Every non-directory, non-signature entry must be named in the
    /// manifest with a matching digest, and vice versa.
    fn check_entries(
        bytes: &[u8],
        names: &[String],
        manifest: &Sections,
    ) -> Result<usize, PackagingError> {
        let covered: Vec<&String> = names
            .iter()
            .filter(|n| !n.ends_with('/') && n.as_str() != MANIFEST_NAME && !is_signature_file(n))
            .collect();

        for section in &manifest.entries {
            let name = section.name.as_deref().unwrap_or_default();
            if entry_digest(&section.attributes).is_some() && !names.iter().any(|n| n == name) {
                return Err(PackagingError::Validation(format!(
                    "Manifest references missing file {}",
                    name
                )));
            }
        }

        covered
            .par_iter()
            .map_init(
                || ZipArchive::new(Cursor::new(bytes)),
                |archive, name| {
                    let archive = archive.as_mut().map_err(|e| {
                        PackagingError::Validation(format!("Cannot reopen archive: {}", e))
                    })?;
                    let section = manifest.get(name).ok_or_else(|| {
                        PackagingError::Validation(format!("Manifest missing entry for {}", name))
                    })?;
                    let (alg, value) = entry_digest(&section.attributes).ok_or_else(|| {
                        PackagingError::Validation(format!("Manifest entry for {} has no digest", name))
                    })?;
                    let mut file = archive.by_name(name)?;
                    let actual = CryptoEngine::stream_digest_base64(alg, &mut file)?;
                    if CryptoEngine::decode_base64(value)? != CryptoEngine::decode_base64(&actual)? {
                        return Err(PackagingError::Validation(format!(
                            "Manifest digest mismatch for {}",
                            name
                        )));
                    }
                    Ok(())
                },
            )
            .collect::<Result<Vec<()>, PackagingError>>()?;
        Ok(covered.len())
    }
}

/// Strongest `*-Digest` attribute of a section.
fn entry_digest(attributes: &crate::manifest::Attributes) -> Option<(DigestAlgorithm, &str)> {
    attributes
        .iter()
        .filter_map(|(k, v)| DigestAlgorithm::from_entry_attribute(k).map(|alg| (alg, v)))
        .max_by_key(|(alg, _)| alg.priority())
}

fn read_whole<R: Read + std::io::Seek>(
    archive: &mut ZipArchive<R>,
    name: &str,
) -> Result<Vec<u8>, PackagingError> {
    let mut file = archive.by_name(name)?;
    let mut out = Vec::with_capacity((file.size() as usize).min(BUFFER_SIZE * 16));
    file.read_to_end(&mut out)?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::{signature_file, Manifest};

    fn manifest_with(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut manifest = Manifest::new("test");
        for (name, data) in entries {
            manifest.entry_mut(name).insert(
                DigestAlgorithm::Sha256.entry_attribute_name(),
                CryptoEngine::digest_base64(DigestAlgorithm::Sha256, data),
            );
        }
        manifest.to_bytes()
    }

    #[test]
    fn signature_file_vouches_for_manifest() {
        let manifest = manifest_with(&[("a.txt", b"a"), ("b.txt", b"b")]);
        let sf = signature_file(&manifest, DigestAlgorithm::Sha256, "test", false).unwrap();
        let sf_sections = Sections::parse(&sf).unwrap();
        let sections = Sections::parse(&manifest).unwrap();
        ArtifactVerifier::check_signature_file(&sf_sections, &sections, &manifest).unwrap();
    }

    #[test]
    fn section_digests_used_when_whole_digest_is_stale() {
        let manifest = manifest_with(&[("a.txt", b"a"), ("b.txt", b"b")]);
        let sf = signature_file(&manifest, DigestAlgorithm::Sha256, "test", false).unwrap();
        let sf = String::from_utf8(sf).unwrap();
        let stale: String = sf
            .split_inclusive("\r\n")
            .map(|line| {
                if line.starts_with("SHA-256-Digest-Manifest: ") {
                    "SHA-256-Digest-Manifest: AAAA\r\n"
                } else {
                    line
                }
            })
            .collect();
        let sf_sections = Sections::parse(stale.as_bytes()).unwrap();
        let sections = Sections::parse(&manifest).unwrap();
        ArtifactVerifier::check_signature_file(&sf_sections, &sections, &manifest).unwrap();
    }

    #[test]
    fn tampered_manifest_section_is_rejected() {
        let manifest = manifest_with(&[("a.txt", b"a")]);
        let sf = signature_file(&manifest, DigestAlgorithm::Sha256, "test", false).unwrap();
        let other = manifest_with(&[("a.txt", b"changed")]);
        let result = ArtifactVerifier::check_signature_file(
            &Sections::parse(&sf).unwrap(),
            &Sections::parse(&other).unwrap(),
            &other,
        );
        assert!(matches!(result, Err(PackagingError::Validation(_))));
    }

    #[test]
    fn strongest_entry_digest_wins() {
        let mut attributes = crate::manifest::Attributes::new();
        attributes.insert("SHA1-Digest", "one");
        attributes.insert("SHA-256-Digest", "two");
        attributes.insert("X-Other", "three");
        let (alg, value) = entry_digest(&attributes).unwrap();
        assert_eq!(alg, DigestAlgorithm::Sha256);
        assert_eq!(value, "two");
    }
}
