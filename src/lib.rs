/*
 * apkzip v1.0.0
 * Copyright (c) 2026 Tiash H Kabir / @MrCarb0n.
 * Licensed under the MIT License.
 */

//! # apkzip
//!
//! Incremental ZIP packaging and JAR/APK signing for Android artifacts.
//!
//! [`zfile::ZFile`] edits an archive in place, rewriting only what changed
//! and compressing entries through a pluggable [`compress::Compressor`].
//! [`signing::ApkSigner`] adds v1 (JAR) and v2 signatures on top of it and
//! [`verification::ArtifactVerifier`] checks both.

pub mod cli;
pub mod compress;
pub mod config;
pub mod crypto;
pub mod dex;
pub mod digest;
pub mod error;
pub mod keys;
pub mod manifest;
pub mod pkcs7;
pub mod pool;
pub mod scheme_v2;
pub mod signature_algorithm;
pub mod signing;
pub mod tracker;
pub mod ui;
pub mod verification;
pub mod zfile;

pub const APP_NAME: &str = "apkzip";
pub const APP_BIN_NAME: &str = "apkzip";
pub const APP_VERSION: &str = "1.0.0";
pub const APP_AUTHOR: &str = "Tiash H Kabir / @MrCarb0n";
pub const APP_ABOUT: &str = "Incremental ZIP packaging with v1/v2 signing and verification for Android APK/JAR archives.";
pub const BUFFER_SIZE: usize = 64 * 1024;

pub const META_INF: &str = "META-INF/";
pub const MANIFEST_NAME: &str = "META-INF/MANIFEST.MF";
pub const CERT_SF_NAME: &str = "META-INF/CERT.SF";
