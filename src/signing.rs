/*
 * apkzip v1.0.0
 * Copyright (c) 2026 Tiash H Kabir / @MrCarb0n.
 * Licensed under the MIT License.
 */

//! JAR (v1) signing and the combined v1 + v2 APK signer.

use crate::{
    crypto::CryptoEngine,
    digest::DigestAlgorithm,
    error::PackagingError,
    keys::KeyChain,
    manifest::{self, Manifest},
    pkcs7,
    scheme_v2::V2Signer,
    signature_algorithm::SignatureAlgorithm,
    zfile::{ZFile, ZFileOptions},
    APP_NAME, APP_VERSION, CERT_SF_NAME, MANIFEST_NAME, META_INF,
};
use rayon::prelude::*;
use std::collections::BTreeSet;
use std::path::Path;
use tracing::{debug, info};

/// Lowest API level assumed when none is given.
pub const DEFAULT_MIN_SDK: u32 = 21;

/// Whether `name` is a JAR signature file (`.SF`, signature block, `SIG-*`)
/// directly under `META-INF/`.
pub fn is_signature_file(name: &str) -> bool {
    let Some(file) = name.strip_prefix(META_INF) else {
        return false;
    };
    if file.contains('/') {
        return false;
    }
    let upper = file.to_ascii_uppercase();
    upper.starts_with("SIG-")
        || [".SF", ".RSA", ".DSA", ".EC"]
            .iter()
            .any(|ext| upper.ends_with(ext))
}

/// Entries a JAR manifest must cover.
fn is_digested(name: &str) -> bool {
    !name.ends_with('/') && name != MANIFEST_NAME && !is_signature_file(name)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SigningConfig {
    /// Lowest API level that must accept the signatures.
    pub min_sdk: u32,
    pub v1_enabled: bool,
    pub v2_enabled: bool,
    /// `Created-By` value of generated manifests and signature files.
    pub created_by: String,
}

impl Default for SigningConfig {
    fn default() -> Self {
        Self {
            min_sdk: DEFAULT_MIN_SDK,
            v1_enabled: true,
            v2_enabled: true,
            created_by: format!("{} ({})", APP_VERSION, APP_NAME),
        }
    }
}

/// What a signing run produced.
#[derive(Debug, Clone, Default)]
pub struct SigningReport {
    /// Digest used for v1 manifest entries, when v1 signing ran.
    pub digest_algorithm: Option<DigestAlgorithm>,
    pub entries_digested: usize,
    /// Name of the PKCS#7 block written, when v1 signing ran.
    pub signature_block: Option<String>,
    pub v2_algorithms: Vec<SignatureAlgorithm>,
    /// High-water mark of tracked buffers during the run.
    pub max_bytes_tracked: u64,
}

/// Writes `META-INF/MANIFEST.MF`, `CERT.SF` and the signature block.
pub struct JarSigner<'a> {
    keys: &'a KeyChain,
    config: &'a SigningConfig,
}

impl<'a> JarSigner<'a> {
    pub fn new(keys: &'a KeyChain, config: &'a SigningConfig) -> Self {
        Self { keys, config }
    }

    pub fn digest_algorithm(&self) -> Result<DigestAlgorithm, PackagingError> {
        DigestAlgorithm::find_best_for_key(self.config.min_sdk, self.keys.key_algorithm())
    }

    pub fn signature_block_name(&self) -> String {
        format!(
            "{}CERT.{}",
            META_INF,
            self.keys.key_algorithm().signature_block_extension()
        )
    }

    /// Add v1 signature files to `zfile`. Nothing is committed.
    pub fn sign(&self, zfile: &mut ZFile) -> Result<SigningReport, PackagingError> {
        let digest = self.digest_algorithm()?;

        let mut manifest = match zfile.get(MANIFEST_NAME) {
            Some(_) => {
                let existing = Manifest::parse(&zfile.read_entry(MANIFEST_NAME)?)?;
                debug!("keeping main section of existing manifest");
                existing
            }
            None => Manifest::new(&self.config.created_by),
        };

        let stale: Vec<String> = zfile
            .entries()
            .map(|e| e.name())
            .filter(|n| is_signature_file(n))
            .map(str::to_string)
            .collect();
        for name in &stale {
            debug!(name = %name, "removing stale signature file");
            zfile.remove(name);
        }

        let names: Vec<String> = zfile
            .entries()
            .map(|e| e.name())
            .filter(|n| is_digested(n))
            .map(str::to_string)
            .collect();
        let shared: &ZFile = zfile;
        let digests = names
            .par_iter()
            .map(|name| {
                let data = shared.read_entry(name)?;
                Ok((name.as_str(), CryptoEngine::digest_base64(digest, &data)))
            })
            .collect::<Result<Vec<_>, PackagingError>>()?;

        let covered: BTreeSet<&str> = names.iter().map(String::as_str).collect();
        manifest.retain_entries(|name| covered.contains(name));
        for (name, value) in &digests {
            let attributes = manifest.entry_mut(name);
            attributes.retain(|k| !k.to_ascii_uppercase().ends_with("-DIGEST"));
            attributes.insert(digest.entry_attribute_name(), value.as_str());
        }

        let manifest_bytes = manifest.to_bytes();
        let sf = manifest::signature_file(
            &manifest_bytes,
            digest,
            &self.config.created_by,
            self.config.v2_enabled,
        )?;
        let block = pkcs7::sign(self.keys, digest, &sf)?;
        let block_name = self.signature_block_name();

        zfile.add(MANIFEST_NAME, manifest_bytes, true)?;
        zfile.add(CERT_SF_NAME, sf, true)?;
        zfile.add(&block_name, block, true)?;
        info!(
            entries = digests.len(),
            digest = digest.message_digest_name(),
            "v1 signature added"
        );

        Ok(SigningReport {
            digest_algorithm: Some(digest),
            entries_digested: digests.len(),
            signature_block: Some(block_name),
            ..SigningReport::default()
        })
    }
}

/// Signs APKs with v1 and/or v2 signatures.
pub struct ApkSigner<'a> {
    keys: &'a KeyChain,
    config: SigningConfig,
}

impl<'a> ApkSigner<'a> {
    pub fn new(keys: &'a KeyChain, config: SigningConfig) -> Self {
        Self { keys, config }
    }

    pub fn config(&self) -> &SigningConfig {
        &self.config
    }

    /// Sign and commit `zfile`.
    pub fn sign(&self, zfile: &mut ZFile) -> Result<SigningReport, PackagingError> {
        if !self.config.v1_enabled && !self.config.v2_enabled {
            return Err(PackagingError::Config(
                "At least one of v1 and v2 signing must be enabled.".into(),
            ));
        }
        let mut report = if self.config.v1_enabled {
            JarSigner::new(self.keys, &self.config).sign(zfile)?
        } else {
            SigningReport::default()
        };

        if self.config.v2_enabled {
            let signer = V2Signer::new(self.keys);
            signer.sign(zfile)?;
            report.v2_algorithms = signer.algorithms().to_vec();
        } else {
            zfile.set_pre_directory_block(None);
            zfile.update()?;
        }
        report.max_bytes_tracked = zfile.options().tracker().max_bytes_used();
        Ok(report)
    }

    /// Sign `input` into `output` (which may be the same file).
    pub fn sign_file(
        &self,
        input: &Path,
        output: &Path,
        options: ZFileOptions,
    ) -> Result<SigningReport, PackagingError> {
        if input != output {
            std::fs::copy(input, output)?;
        }
        let mut zfile = ZFile::open(output, options)?;
        let report = self.sign(&mut zfile)?;
        zfile.close()?;
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_file_names() {
        assert!(is_signature_file("META-INF/CERT.SF"));
        assert!(is_signature_file("META-INF/release.rsa"));
        assert!(is_signature_file("META-INF/CERT.EC"));
        assert!(is_signature_file("META-INF/SIG-FOO"));
        assert!(!is_signature_file("META-INF/MANIFEST.MF"));
        assert!(!is_signature_file("META-INF/services/x.SF"));
        assert!(!is_signature_file("assets/CERT.SF"));
    }

    #[test]
    fn digested_entries() {
        assert!(is_digested("classes.dex"));
        assert!(is_digested("META-INF/services/foo"));
        assert!(!is_digested("META-INF/MANIFEST.MF"));
        assert!(!is_digested("res/"));
    }

    #[test]
    fn default_config_signs_both_schemes() {
        let config = SigningConfig::default();
        assert!(config.v1_enabled && config.v2_enabled);
        assert_eq!(config.created_by, "1.0.0 (apkzip)");
    }
}
