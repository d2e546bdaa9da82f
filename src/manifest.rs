/*
 * apkzip v1.0.0
 * Copyright (c) 2026 Tiash H Kabir / @MrCarb0n.
 * Licensed under the MIT License.
 */

//! JAR manifest and signature file text format.
//!
//! Both files are lists of sections separated by empty lines, each section a
//! list of `Name: value` lines folded at 72 bytes with CRLF line endings.
//! Signature files digest manifest sections byte for byte, so the parser
//! keeps the exact byte range of every section it reads.

use crate::{crypto::CryptoEngine, digest::DigestAlgorithm, error::PackagingError};
use std::collections::BTreeMap;
use std::ops::Range;

pub const MANIFEST_VERSION: &str = "Manifest-Version";
pub const SIGNATURE_VERSION: &str = "Signature-Version";
pub const CREATED_BY: &str = "Created-By";
pub const NAME: &str = "Name";
/// Signature file attribute announcing that an APK signing block must be present.
pub const ANDROID_APK_SIGNED: &str = "X-Android-APK-Signed";

const MAX_LINE_BYTES: usize = 72;

/// Ordered attributes of one section. Names compare case-insensitively.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Attributes {
    items: Vec<(String, String)>,
}

impl Attributes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.items
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Set `name`, keeping its position if it already exists.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        match self.items.iter_mut().find(|(k, _)| k.eq_ignore_ascii_case(&name)) {
            Some(item) => item.1 = value,
            None => self.items.push((name, value)),
        }
    }

    pub fn remove(&mut self, name: &str) -> Option<String> {
        let pos = self
            .items
            .iter()
            .position(|(k, _)| k.eq_ignore_ascii_case(name))?;
        Some(self.items.remove(pos).1)
    }

    pub fn retain(&mut self, mut keep: impl FnMut(&str) -> bool) {
        self.items.retain(|(k, _)| keep(k));
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.items.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// Append `key: value`, folded into 72 byte lines.
pub fn write_manifest_line(out: &mut Vec<u8>, key: &str, value: &str) {
    let line = format!("{}: {}", key, value);
    let mut rest = line.as_str();
    let mut first = true;
    while !rest.is_empty() {
        let limit = if first { MAX_LINE_BYTES } else { MAX_LINE_BYTES - 1 };
        let mut split = rest.len().min(limit);
        while !rest.is_char_boundary(split) {
            split -= 1;
        }
        if !first {
            out.push(b' ');
        }
        out.extend_from_slice(rest[..split].as_bytes());
        out.extend_from_slice(b"\r\n");
        rest = &rest[split..];
        first = false;
    }
}

fn write_section(out: &mut Vec<u8>, leading: Option<(&str, &str)>, attributes: &Attributes) {
    if let Some((k, v)) = leading {
        write_manifest_line(out, k, v);
    }
    for (k, v) in attributes.iter() {
        if leading.map_or(false, |(lk, _)| lk.eq_ignore_ascii_case(k)) {
            continue;
        }
        write_manifest_line(out, k, v);
    }
    out.extend_from_slice(b"\r\n");
}

/// One section as read from bytes.
#[derive(Debug, Clone)]
pub struct Section {
    /// Bytes of the section including its terminating empty line.
    pub range: Range<usize>,
    /// Value of the `Name` attribute; `None` for the main section.
    pub name: Option<String>,
    pub attributes: Attributes,
}

/// All sections of a manifest or signature file, with their byte ranges.
#[derive(Debug, Clone)]
pub struct Sections {
    pub main: Section,
    pub entries: Vec<Section>,
}

impl Sections {
    pub fn parse(bytes: &[u8]) -> Result<Self, PackagingError> {
        let mut sections = Vec::new();
        let mut start = 0;
        let mut logical: Vec<Vec<u8>> = Vec::new();
        let mut pos = 0;

        while pos < bytes.len() {
            let (line, next) = next_line(bytes, pos);
            pos = next;
            if line.is_empty() {
                if !logical.is_empty() || sections.is_empty() {
                    sections.push(build_section(start..pos, &logical)?);
                }
                logical.clear();
                start = pos;
            } else if line[0] == b' ' {
                let last = logical.last_mut().ok_or_else(|| {
                    PackagingError::format("manifest continuation line without a header")
                })?;
                last.extend_from_slice(&line[1..]);
            } else {
                logical.push(line.to_vec());
            }
        }
        if !logical.is_empty() || sections.is_empty() {
            sections.push(build_section(start..bytes.len(), &logical)?);
        }

        let mut iter = sections.into_iter();
        let main = iter
            .next()
            .ok_or_else(|| PackagingError::format("empty manifest"))?;
        let entries: Vec<Section> = iter.collect();
        if let Some(unnamed) = entries.iter().find(|s| s.name.is_none()) {
            return Err(PackagingError::format(format!(
                "manifest section at byte {} has no Name",
                unnamed.range.start
            )));
        }
        Ok(Self { main, entries })
    }

    pub fn get(&self, name: &str) -> Option<&Section> {
        self.entries.iter().find(|s| s.name.as_deref() == Some(name))
    }
}

/// Returns the line starting at `pos` without terminator and the offset of the next line.
fn next_line(bytes: &[u8], pos: usize) -> (&[u8], usize) {
    let rest = &bytes[pos..];
    match rest.iter().position(|&b| b == b'\n' || b == b'\r') {
        Some(i) => {
            let skip = if rest[i] == b'\r' && rest.get(i + 1) == Some(&b'\n') {
                2
            } else {
                1
            };
            (&rest[..i], pos + i + skip)
        }
        None => (rest, bytes.len()),
    }
}

fn build_section(range: Range<usize>, lines: &[Vec<u8>]) -> Result<Section, PackagingError> {
    let mut attributes = Attributes::new();
    let mut name = None;
    for line in lines {
        let text = std::str::from_utf8(line)
            .map_err(|_| PackagingError::format("manifest line is not UTF-8"))?;
        let (key, value) = text.split_once(": ").ok_or_else(|| {
            PackagingError::format(format!("malformed manifest line '{}'", text))
        })?;
        if key.eq_ignore_ascii_case(NAME) && name.is_none() {
            name = Some(value.to_string());
        } else {
            attributes.insert(key, value);
        }
    }
    Ok(Section {
        range,
        name,
        attributes,
    })
}

/// `META-INF/MANIFEST.MF` contents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Manifest {
    main: Attributes,
    entries: BTreeMap<String, Attributes>,
}

impl Manifest {
    pub fn new(created_by: &str) -> Self {
        let mut main = Attributes::new();
        main.insert(MANIFEST_VERSION, "1.0");
        main.insert(CREATED_BY, created_by);
        Self {
            main,
            entries: BTreeMap::new(),
        }
    }

    pub fn parse(bytes: &[u8]) -> Result<Self, PackagingError> {
        let sections = Sections::parse(bytes)?;
        let mut entries = BTreeMap::new();
        for section in sections.entries {
            if let Some(name) = section.name {
                entries.insert(name, section.attributes);
            }
        }
        Ok(Self {
            main: sections.main.attributes,
            entries,
        })
    }

    pub fn main(&self) -> &Attributes {
        &self.main
    }

    pub fn main_mut(&mut self) -> &mut Attributes {
        &mut self.main
    }

    pub fn entry(&self, name: &str) -> Option<&Attributes> {
        self.entries.get(name)
    }

    /// Attributes of `name`, created empty if missing.
    pub fn entry_mut(&mut self, name: &str) -> &mut Attributes {
        self.entries.entry(name.to_string()).or_default()
    }

    pub fn remove_entry(&mut self, name: &str) -> Option<Attributes> {
        self.entries.remove(name)
    }

    pub fn retain_entries(&mut self, mut keep: impl FnMut(&str) -> bool) {
        self.entries.retain(|name, _| keep(name));
    }

    pub fn entries(&self) -> impl Iterator<Item = (&str, &Attributes)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Serialize with the main section first and entries sorted by name.
    pub fn to_bytes(&self) -> Vec<u8> {
        let estimated_size = 64 + self.entries.len() * 110;
        let mut out = Vec::with_capacity(estimated_size);
        let version = self.main.get(MANIFEST_VERSION).unwrap_or("1.0");
        write_section(&mut out, Some((MANIFEST_VERSION, version)), &self.main);
        for (name, attributes) in &self.entries {
            write_section(&mut out, Some((NAME, name)), attributes);
        }
        out
    }
}

/// Build the signature file (`CERT.SF`) for serialized `manifest` bytes.
///
/// Each manifest entry section is digested as it appears in `manifest`.
pub fn signature_file(
    manifest: &[u8],
    digest: DigestAlgorithm,
    created_by: &str,
    v2_signed: bool,
) -> Result<Vec<u8>, PackagingError> {
    let sections = Sections::parse(manifest)?;
    let mut main = Attributes::new();
    main.insert(CREATED_BY, created_by);
    main.insert(
        digest.manifest_attribute_name(),
        CryptoEngine::digest_base64(digest, manifest),
    );
    main.insert(
        format!("{}-Main-Attributes", digest.manifest_attribute_name()),
        CryptoEngine::digest_base64(digest, &manifest[sections.main.range.clone()]),
    );
    if v2_signed {
        main.insert(ANDROID_APK_SIGNED, "2");
    }

    let mut out = Vec::with_capacity(manifest.len() / 2 + 256);
    write_section(&mut out, Some((SIGNATURE_VERSION, "1.0")), &main);
    for section in &sections.entries {
        if let Some(name) = &section.name {
            let mut attributes = Attributes::new();
            attributes.insert(
                digest.entry_attribute_name(),
                CryptoEngine::digest_base64(digest, &manifest[section.range.clone()]),
            );
            write_section(&mut out, Some((NAME, name)), &attributes);
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn long_lines_fold_at_72_bytes() {
        let mut out = Vec::new();
        let name = "assets/".to_string() + &"x".repeat(150);
        write_manifest_line(&mut out, "Name", &name);
        let text = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = text.split("\r\n").filter(|l| !l.is_empty()).collect();
        assert_eq!(lines[0].len(), 72);
        assert!(lines[1..].iter().all(|l| l.starts_with(' ') && l.len() <= 72));
        let unfolded: String = lines
            .iter()
            .enumerate()
            .map(|(i, l)| if i == 0 { *l } else { &l[1..] })
            .collect();
        assert_eq!(unfolded, format!("Name: {}", name));
    }

    #[test]
    fn folding_never_splits_characters() {
        let mut out = Vec::new();
        write_manifest_line(&mut out, "Name", &"é".repeat(80));
        assert!(String::from_utf8(out).is_ok());
    }

    #[test]
    fn manifest_parses_what_it_writes() {
        let mut manifest = Manifest::new("apkzip");
        manifest
            .entry_mut("classes.dex")
            .insert("SHA-256-Digest", "abc=");
        manifest
            .entry_mut(&"long/".repeat(30))
            .insert("SHA-256-Digest", "def=");
        let bytes = manifest.to_bytes();
        assert!(bytes.starts_with(b"Manifest-Version: 1.0\r\nCreated-By: apkzip\r\n\r\n"));
        assert_eq!(Manifest::parse(&bytes).unwrap(), manifest);
    }

    #[test]
    fn section_ranges_cover_the_blank_line() {
        let bytes = b"Manifest-Version: 1.0\r\n\r\nName: a\r\nSHA1-Digest: x\r\n\r\nName: b\nSHA1-Digest: y\n\n";
        let sections = Sections::parse(bytes).unwrap();
        assert_eq!(&bytes[sections.main.range.clone()], b"Manifest-Version: 1.0\r\n\r\n");
        let a = sections.get("a").unwrap();
        assert_eq!(&bytes[a.range.clone()], b"Name: a\r\nSHA1-Digest: x\r\n\r\n");
        assert_eq!(sections.get("b").unwrap().attributes.get("sha1-digest"), Some("y"));
    }

    #[test]
    fn signature_file_digests_each_section() {
        let mut manifest = Manifest::new("apkzip");
        manifest.entry_mut("a.txt").insert("SHA-256-Digest", "abc=");
        let bytes = manifest.to_bytes();
        let sf = signature_file(&bytes, DigestAlgorithm::Sha256, "apkzip", true).unwrap();
        let sections = Sections::parse(&sf).unwrap();
        assert_eq!(sections.main.attributes.get(SIGNATURE_VERSION), Some("1.0"));
        assert_eq!(sections.main.attributes.get(ANDROID_APK_SIGNED), Some("2"));
        assert_eq!(
            sections.main.attributes.get("SHA-256-Digest-Manifest"),
            Some(CryptoEngine::digest_base64(DigestAlgorithm::Sha256, &bytes).as_str())
        );
        let manifest_sections = Sections::parse(&bytes).unwrap();
        let entry = &bytes[manifest_sections.get("a.txt").unwrap().range.clone()];
        assert_eq!(
            sections.get("a.txt").unwrap().attributes.get("SHA-256-Digest"),
            Some(CryptoEngine::digest_base64(DigestAlgorithm::Sha256, entry).as_str())
        );
    }

    #[test]
    fn continuation_without_header_is_rejected() {
        assert!(Sections::parse(b" orphan\r\n").is_err());
        assert!(Sections::parse(b"Manifest-Version: 1.0\r\n\r\nSHA1-Digest: x\r\n").is_err());
    }
}
