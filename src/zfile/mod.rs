/*
 * apkzip v1.0.0
 * Copyright (c) 2026 Tiash H Kabir / @MrCarb0n.
 * Licensed under the MIT License.
 */

//! Incremental editing of ZIP archives.
//!
//! A [`ZFile`] mirrors the central directory of an archive in memory. Added
//! entries are compressed in the background and nothing touches the disk
//! until [`ZFile::update`]: untouched entries stay where they are, entries
//! behind the first hole are moved down, new entries are appended, and the
//! central directory is written once at the end.

mod options;
pub(crate) mod records;

pub use options::{AlignmentRule, ZFileOptions};

use crate::compress::{CompressionMethod, Compressor, PendingCompression};
use crate::error::PackagingError;
use crate::tracker::TrackedBytes;
use crate::BUFFER_SIZE;
use flate2::read::DeflateDecoder;
use records::{
    alignment_extra, dos_date_time, locate_directory, offset_u32, read_central_directory,
    strip_alignment_extra, CentralDirectoryHeader, EndOfCentralDirectory, LocalHeaderInfo,
    ALIGNMENT_EXTRA_MIN_LEN, DATA_DESCRIPTOR_SIG, DOS_EPOCH, EOCD_LEN, FLAG_DATA_DESCRIPTOR,
    FLAG_UTF8, LOCAL_FILE_HEADER_LEN, MAX_EOCD_COMMENT, VERSION_DEFLATED, VERSION_MADE_BY,
    VERSION_STORED,
};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, trace};

const FILE_EXTERNAL_ATTRS: u32 = 0o100644 << 16;
const DIR_EXTERNAL_ATTRS: u32 = (0o040755 << 16) | 0x10;

/// Byte ranges of a committed archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArchiveLayout {
    /// End of the last entry; the pre-directory block starts here.
    pub entries_end: u64,
    pub cd_offset: u64,
    pub cd_size: u64,
    pub eocd_offset: u64,
    pub file_len: u64,
}

#[derive(Debug)]
enum EntryState {
    /// Committed: local header at `offset`, data at `data_offset`, footprint ends at `end`.
    OnDisk {
        offset: u64,
        data_offset: u64,
        end: u64,
    },
    /// Waiting for the compressor.
    Pending {
        source: Arc<TrackedBytes>,
        pending: PendingCompression,
    },
    /// Final payload held in memory, not yet written.
    Ready { data: Arc<TrackedBytes> },
}

/// One entry of a [`ZFile`].
#[derive(Debug)]
pub struct StoredEntry {
    header: CentralDirectoryHeader,
    state: EntryState,
}

impl StoredEntry {
    pub fn name(&self) -> &str {
        &self.header.name
    }

    pub fn is_directory(&self) -> bool {
        self.header.name.ends_with('/')
    }

    pub fn crc32(&self) -> u32 {
        self.header.crc32
    }

    pub fn uncompressed_size(&self) -> u64 {
        self.header.uncompressed_size as u64
    }

    /// `None` while the entry is still being compressed.
    pub fn compressed_size(&self) -> Option<u64> {
        match self.state {
            EntryState::Pending { .. } => None,
            _ => Some(self.header.compressed_size as u64),
        }
    }

    /// `None` while the entry is still being compressed.
    pub fn method(&self) -> Option<CompressionMethod> {
        match self.state {
            EntryState::Pending { .. } => None,
            _ => CompressionMethod::from_zip_id(self.header.method),
        }
    }

    /// Offset of the local header, for entries written to disk.
    pub fn local_header_offset(&self) -> Option<u64> {
        match self.state {
            EntryState::OnDisk { offset, .. } => Some(offset),
            _ => None,
        }
    }

    /// Offset of the entry payload, for entries written to disk.
    pub fn data_offset(&self) -> Option<u64> {
        match self.state {
            EntryState::OnDisk { data_offset, .. } => Some(data_offset),
            _ => None,
        }
    }

    pub fn is_committed(&self) -> bool {
        matches!(self.state, EntryState::OnDisk { .. })
    }

    /// MS-DOS `(time, date)` of the entry.
    pub fn dos_time(&self) -> (u16, u16) {
        (self.header.last_mod_time, self.header.last_mod_date)
    }

    pub fn extra(&self) -> &[u8] {
        &self.header.extra
    }

    /// Join a pending compression. A failed compression is submitted to
    /// `compressor` again, so the entry stays pending until one succeeds.
    fn resolve(&mut self, compressor: &Arc<dyn Compressor>) -> Result<(), PackagingError> {
        let source = match &self.state {
            EntryState::Pending { source, .. } => Arc::clone(source),
            _ => return Ok(()),
        };
        let placeholder = EntryState::Ready {
            data: Arc::clone(&source),
        };
        let EntryState::Pending { pending, .. } = std::mem::replace(&mut self.state, placeholder)
        else {
            return Ok(());
        };
        let outcome = pending
            .wait()
            .and_then(|result| Ok((offset_u32(result.size())?, result)));
        match outcome {
            Ok((compressed_size, result)) => {
                self.header.method = result.method().zip_id();
                self.header.version_needed = version_needed(result.method());
                self.header.compressed_size = compressed_size;
                self.state = EntryState::Ready {
                    data: Arc::clone(result.data()),
                };
                Ok(())
            }
            Err(e) => {
                self.state = EntryState::Pending {
                    pending: compressor.compress(Arc::clone(&source)),
                    source,
                };
                Err(e)
            }
        }
    }

    fn needs_alignment_fix(&self, data_offset: u64, rule: &AlignmentRule) -> bool {
        if self.header.method != CompressionMethod::Stored.zip_id() {
            return false;
        }
        data_offset % rule.alignment(&self.header.name) as u64 != 0
    }
}

fn version_needed(method: CompressionMethod) -> u16 {
    match method {
        CompressionMethod::Stored => VERSION_STORED,
        CompressionMethod::Deflated => VERSION_DEFLATED,
    }
}

/// Padding that puts `data_offset` on an `alignment` boundary, large enough
/// to hold an alignment extra field.
fn alignment_padding(data_offset: u64, alignment: u16) -> usize {
    let alignment = alignment as u64;
    if alignment <= 1 {
        return 0;
    }
    let mut padding = (alignment - data_offset % alignment) % alignment;
    while padding != 0 && padding < ALIGNMENT_EXTRA_MIN_LEN as u64 {
        padding += alignment;
    }
    padding as usize
}

/// A ZIP archive opened for incremental modification.
#[derive(Debug)]
pub struct ZFile {
    path: PathBuf,
    file: Mutex<File>,
    options: ZFileOptions,
    entries: Vec<StoredEntry>,
    index: HashMap<String, usize>,
    pre_directory_block: Option<Vec<u8>>,
    comment: Vec<u8>,
    /// Present while the file on disk matches the in-memory state.
    layout: Option<ArchiveLayout>,
}

impl ZFile {
    /// Open `path`, creating an empty archive if it does not exist.
    pub fn open(path: impl AsRef<Path>, options: ZFileOptions) -> Result<Self, PackagingError> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        let file_len = file.metadata()?.len();

        let mut zfile = Self {
            path,
            file: Mutex::new(file),
            options,
            entries: Vec::new(),
            index: HashMap::new(),
            pre_directory_block: None,
            comment: Vec::new(),
            layout: None,
        };
        if file_len > 0 {
            zfile.read_directory(file_len)?;
        }
        debug!(
            path = %zfile.path.display(),
            entries = zfile.entries.len(),
            "opened archive"
        );
        Ok(zfile)
    }

    fn read_directory(&mut self, file_len: u64) -> Result<(), PackagingError> {
        let tail_len = file_len.min((EOCD_LEN + MAX_EOCD_COMMENT) as u64);
        let tail = self.read_at(file_len - tail_len, tail_len as usize)?;
        let location = locate_directory(&tail, file_len)?;
        let cd_offset = location.cd_offset();
        let cd = self.read_at(cd_offset, location.eocd.cd_size as usize)?;
        let headers = read_central_directory(&cd, location.eocd.total_entries as usize)?;

        let mut entries_end = 0;
        for header in headers {
            if CompressionMethod::from_zip_id(header.method).is_none() {
                return Err(PackagingError::Unsupported(format!(
                    "compression method {} of '{}'",
                    header.method, header.name
                )));
            }
            if self.index.contains_key(&header.name) {
                return Err(PackagingError::format(format!(
                    "duplicate entry '{}'",
                    header.name
                )));
            }
            let offset = header.local_header_offset as u64;
            let local = LocalHeaderInfo::parse(&self.read_at(offset, LOCAL_FILE_HEADER_LEN)?)?;
            let data_offset = offset + local.header_len();
            let mut end = data_offset + header.compressed_size as u64;
            if header.flags & FLAG_DATA_DESCRIPTOR != 0 {
                end += self.descriptor_len(end)?;
            }
            if end > cd_offset {
                return Err(PackagingError::format(format!(
                    "entry '{}' overlaps the central directory",
                    header.name
                )));
            }
            entries_end = entries_end.max(end);
            self.push(StoredEntry {
                header,
                state: EntryState::OnDisk {
                    offset,
                    data_offset,
                    end,
                },
            });
        }

        if cd_offset > entries_end {
            let block = self.read_at(entries_end, (cd_offset - entries_end) as usize)?;
            self.pre_directory_block = Some(block);
        }
        self.comment = location.eocd.comment.clone();
        self.layout = Some(ArchiveLayout {
            entries_end,
            cd_offset,
            cd_size: location.eocd.cd_size as u64,
            eocd_offset: location.eocd_offset,
            file_len,
        });
        Ok(())
    }

    /// Length of the data descriptor starting at `pos` (with or without signature).
    fn descriptor_len(&self, pos: u64) -> Result<u64, PackagingError> {
        let sig = self.read_at(pos, 4)?;
        if sig[..] == DATA_DESCRIPTOR_SIG.to_le_bytes() {
            Ok(16)
        } else {
            Ok(12)
        }
    }

    fn read_at(&self, offset: u64, len: usize) -> Result<Vec<u8>, PackagingError> {
        let mut file = self.file.lock().unwrap_or_else(PoisonError::into_inner);
        file.seek(SeekFrom::Start(offset))?;
        let mut buf = vec![0u8; len];
        file.read_exact(&mut buf)?;
        Ok(buf)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn options(&self) -> &ZFileOptions {
        &self.options
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries in central directory order.
    pub fn entries(&self) -> impl Iterator<Item = &StoredEntry> + '_ {
        self.entries.iter()
    }

    pub fn get(&self, name: &str) -> Option<&StoredEntry> {
        self.index.get(name).map(|&i| &self.entries[i])
    }

    /// Byte ranges of the archive on disk, `None` while changes are uncommitted.
    pub fn layout(&self) -> Option<ArchiveLayout> {
        self.layout
    }

    pub fn comment(&self) -> &[u8] {
        &self.comment
    }

    pub fn set_comment(&mut self, comment: impl Into<Vec<u8>>) -> Result<(), PackagingError> {
        let comment = comment.into();
        if comment.len() > MAX_EOCD_COMMENT {
            return Err(PackagingError::Config(
                "archive comment longer than 65535 bytes".into(),
            ));
        }
        self.comment = comment;
        self.layout = None;
        Ok(())
    }

    /// Add `data` as `name`, replacing any entry of that name.
    ///
    /// With `may_compress` the bytes go to the configured compressor; the
    /// result is only waited for on [`update`](Self::update).
    pub fn add(
        &mut self,
        name: &str,
        data: impl Into<Vec<u8>>,
        may_compress: bool,
    ) -> Result<(), PackagingError> {
        let source = Arc::new(self.options.tracker().from_vec(data.into()));
        self.add_tracked(name, source, may_compress)
    }

    /// Like [`add`](Self::add), draining `reader` for the contents.
    pub fn add_reader<R: Read>(
        &mut self,
        name: &str,
        reader: &mut R,
        may_compress: bool,
    ) -> Result<(), PackagingError> {
        let source = Arc::new(self.options.tracker().from_reader(reader)?);
        self.add_tracked(name, source, may_compress)
    }

    fn add_tracked(
        &mut self,
        name: &str,
        source: Arc<TrackedBytes>,
        may_compress: bool,
    ) -> Result<(), PackagingError> {
        if name.is_empty() || name.len() > u16::MAX as usize {
            return Err(PackagingError::Config(format!(
                "invalid entry name '{}'",
                name
            )));
        }
        let size = offset_u32(source.len() as u64)?;
        let is_directory = name.ends_with('/');
        let (last_mod_time, last_mod_date) = self.timestamp();

        let header = CentralDirectoryHeader {
            version_made_by: VERSION_MADE_BY,
            version_needed: VERSION_STORED,
            flags: if name.is_ascii() { 0 } else { FLAG_UTF8 },
            method: CompressionMethod::Stored.zip_id(),
            last_mod_time,
            last_mod_date,
            crc32: crc32fast::hash(&source),
            compressed_size: size,
            uncompressed_size: size,
            name: name.to_string(),
            raw_name: name.as_bytes().to_vec(),
            extra: Vec::new(),
            comment: Vec::new(),
            disk_start: 0,
            internal_attrs: 0,
            external_attrs: if is_directory {
                DIR_EXTERNAL_ATTRS
            } else {
                FILE_EXTERNAL_ATTRS
            },
            local_header_offset: 0,
        };
        let state = if may_compress && !is_directory && !source.is_empty() {
            EntryState::Pending {
                pending: self.options.compressor().compress(Arc::clone(&source)),
                source,
            }
        } else {
            EntryState::Ready { data: source }
        };

        self.remove(name);
        trace!(name, size, may_compress, "queued entry");
        self.push(StoredEntry { header, state });
        self.invalidate();
        Ok(())
    }

    fn timestamp(&self) -> (u16, u16) {
        if self.options.no_timestamps() {
            DOS_EPOCH
        } else {
            dos_date_time(&chrono::Local::now().naive_local())
        }
    }

    fn push(&mut self, entry: StoredEntry) {
        self.index
            .insert(entry.header.name.clone(), self.entries.len());
        self.entries.push(entry);
    }

    fn invalidate(&mut self) {
        self.layout = None;
        self.pre_directory_block = None;
    }

    /// Remove `name`. Returns whether it existed.
    pub fn remove(&mut self, name: &str) -> bool {
        let Some(pos) = self.index.remove(name) else {
            return false;
        };
        self.entries.remove(pos);
        for (i, entry) in self.entries.iter().enumerate().skip(pos) {
            self.index.insert(entry.header.name.clone(), i);
        }
        self.invalidate();
        true
    }

    /// Uncompressed contents of `name`, checked against its CRC.
    pub fn read_entry(&self, name: &str) -> Result<Vec<u8>, PackagingError> {
        let entry = self
            .get(name)
            .ok_or_else(|| PackagingError::EntryNotFound(name.to_string()))?;
        let raw = match &entry.state {
            EntryState::Pending { source, .. } => return Ok(source.to_vec()),
            EntryState::Ready { data } => data.to_vec(),
            EntryState::OnDisk { .. } => self.raw_bytes(entry)?,
        };

        let data = match CompressionMethod::from_zip_id(entry.header.method) {
            Some(CompressionMethod::Deflated) => {
                let mut out = Vec::with_capacity(entry.uncompressed_size() as usize);
                DeflateDecoder::new(&raw[..])
                    .read_to_end(&mut out)
                    .map_err(|e| PackagingError::format(format!("inflating '{}': {}", name, e)))?;
                out
            }
            _ => raw,
        };
        if data.len() as u64 != entry.uncompressed_size() || crc32fast::hash(&data) != entry.crc32() {
            return Err(PackagingError::format(format!(
                "CRC or size mismatch in '{}'",
                name
            )));
        }
        Ok(data)
    }

    /// Payload of `name` as stored in the archive. Waits for a pending compression.
    pub fn read_raw(&mut self, name: &str) -> Result<Vec<u8>, PackagingError> {
        let pos = *self
            .index
            .get(name)
            .ok_or_else(|| PackagingError::EntryNotFound(name.to_string()))?;
        let compressor = Arc::clone(self.options.compressor());
        self.entries[pos].resolve(&compressor)?;
        self.raw_bytes(&self.entries[pos])
    }

    fn raw_bytes(&self, entry: &StoredEntry) -> Result<Vec<u8>, PackagingError> {
        match &entry.state {
            EntryState::OnDisk { data_offset, .. } => {
                self.read_at(*data_offset, entry.header.compressed_size as usize)
            }
            EntryState::Ready { data } => Ok(data.to_vec()),
            EntryState::Pending { .. } => Err(PackagingError::Validation(format!(
                "entry '{}' is still being compressed",
                entry.header.name
            ))),
        }
    }

    /// Copy the entries of `other` not matched by `ignore`, keeping their
    /// compressed form. Entries `other` has not compressed yet are
    /// recompressed here. Returns the number of entries copied.
    pub fn merge_from(
        &mut self,
        other: &ZFile,
        ignore: impl Fn(&str) -> bool,
    ) -> Result<usize, PackagingError> {
        let mut merged = 0;
        for entry in other.entries() {
            if ignore(entry.name()) {
                continue;
            }
            if let EntryState::Pending { source, .. } = &entry.state {
                self.add_tracked(entry.name(), Arc::clone(source), true)?;
            } else {
                let data = Arc::new(self.options.tracker().from_vec(other.raw_bytes(entry)?));
                let mut header = entry.header.clone();
                header.flags &= !FLAG_DATA_DESCRIPTOR;
                header.extra = strip_alignment_extra(&header.extra);
                header.local_header_offset = 0;
                self.remove(&header.name);
                self.push(StoredEntry {
                    header,
                    state: EntryState::Ready { data },
                });
                self.invalidate();
            }
            merged += 1;
        }
        debug!(from = %other.path.display(), merged, "merged entries");
        Ok(merged)
    }

    /// Bytes to place between the last entry and the central directory.
    pub fn pre_directory_block(&self) -> Option<&[u8]> {
        self.pre_directory_block.as_deref()
    }

    /// Set or clear the pre-directory block. Entries are not moved.
    pub fn set_pre_directory_block(&mut self, block: Option<Vec<u8>>) {
        self.pre_directory_block = block.filter(|b| !b.is_empty());
        self.layout = None;
    }

    /// Write pending changes to disk.
    ///
    /// Compressions are joined in central directory order first; if one
    /// fails the file is left untouched. Entries are only marked as written
    /// once the central directory and EOCD are on disk: if writing fails part
    /// way the archive on disk is incomplete, and a later `update` writes
    /// everything behind the kept prefix again.
    pub fn update(&mut self) -> Result<(), PackagingError> {
        if self.layout.is_some() {
            return Ok(());
        }
        u16::try_from(self.entries.len())
            .map_err(|_| PackagingError::Unsupported("more than 65535 entries (ZIP64)".into()))?;
        let compressor = Arc::clone(self.options.compressor());
        for entry in &mut self.entries {
            entry.resolve(&compressor)?;
        }

        let rule = self.options.alignment_rule().clone();
        let no_timestamps = self.options.no_timestamps();

        let mut on_disk: Vec<usize> = (0..self.entries.len())
            .filter(|&i| self.entries[i].is_committed())
            .collect();
        on_disk.sort_by_key(|&i| self.entries[i].local_header_offset());

        // Everything up to the first hole or misaligned entry stays in place.
        let mut cursor = 0u64;
        let mut kept = 0usize;
        let mut relocate = Vec::new();
        for &i in &on_disk {
            let entry = &self.entries[i];
            if let EntryState::OnDisk {
                offset,
                data_offset,
                end,
            } = entry.state
            {
                if relocate.is_empty()
                    && offset == cursor
                    && !entry.needs_alignment_fix(data_offset, &rule)
                {
                    cursor = end;
                    kept += 1;
                } else {
                    relocate.push(i);
                }
            }
        }

        // Read moved entries before their old bytes are overwritten.
        for &i in &relocate {
            let raw = self.raw_bytes(&self.entries[i])?;
            trace!(name = %self.entries[i].header.name, bytes = raw.len(), "relocating entry");
            let data = Arc::new(self.options.tracker().from_vec(raw));
            self.entries[i].state = EntryState::Ready { data };
        }
        let relocated = relocate.len();
        let mut was_on_disk = vec![false; self.entries.len()];
        for &i in &on_disk {
            was_on_disk[i] = true;
        }
        let mut write_order = relocate;
        write_order.extend((0..self.entries.len()).filter(|&i| !was_on_disk[i]));
        let appended = write_order.len() - relocated;

        let file = self.file.get_mut().unwrap_or_else(PoisonError::into_inner);
        file.seek(SeekFrom::Start(cursor))?;
        let mut out = BufWriter::with_capacity(BUFFER_SIZE, &*file);

        let mut written = Vec::with_capacity(write_order.len());
        for i in write_order {
            let entry = &self.entries[i];
            let data = match &entry.state {
                EntryState::Ready { data } => data,
                _ => continue,
            };
            let mut header = entry.header.clone();
            header.flags &= !FLAG_DATA_DESCRIPTOR;
            header.extra = strip_alignment_extra(&header.extra);
            if no_timestamps {
                (header.last_mod_time, header.last_mod_date) = DOS_EPOCH;
            }
            header.local_header_offset = offset_u32(cursor)?;

            let mut extra = header.extra.clone();
            if header.method == CompressionMethod::Stored.zip_id() {
                let alignment = rule.alignment(&header.name);
                let unpadded = cursor
                    + (LOCAL_FILE_HEADER_LEN + header.raw_name.len() + extra.len()) as u64;
                let padding = alignment_padding(unpadded, alignment);
                if padding > 0 {
                    extra.extend_from_slice(&alignment_extra(alignment, padding));
                }
            }
            let local_header = header.local_header(&extra)?;
            out.write_all(&local_header)?;
            out.write_all(data)?;

            let data_offset = cursor + local_header.len() as u64;
            let end = data_offset + data.len() as u64;
            written.push((
                i,
                header,
                EntryState::OnDisk {
                    offset: cursor,
                    data_offset,
                    end,
                },
            ));
            cursor = end;
        }

        let entries_end = cursor;
        if let Some(block) = &self.pre_directory_block {
            out.write_all(block)?;
            cursor += block.len() as u64;
        }
        let cd_offset = cursor;
        let mut headers: Vec<&CentralDirectoryHeader> =
            self.entries.iter().map(|e| &e.header).collect();
        for (i, header, _) in &written {
            headers[*i] = header;
        }
        let mut cd_size = 0u64;
        for header in &headers {
            header.write_to(&mut out)?;
            cd_size += header.encoded_len() as u64;
        }
        let eocd = EndOfCentralDirectory::for_directory(
            self.entries.len(),
            cd_size,
            cd_offset,
            self.comment.clone(),
        )?;
        eocd.write_to(&mut out)?;
        out.flush()?;
        drop(out);

        let eocd_offset = cd_offset + cd_size;
        let file_len = eocd_offset + eocd.encoded_len() as u64;
        file.set_len(file_len)?;

        for (i, header, state) in written {
            let entry = &mut self.entries[i];
            entry.header = header;
            entry.state = state;
        }
        self.layout = Some(ArchiveLayout {
            entries_end,
            cd_offset,
            cd_size,
            eocd_offset,
            file_len,
        });
        debug!(
            path = %self.path.display(),
            kept,
            relocated,
            appended,
            bytes = file_len,
            "committed archive"
        );
        Ok(())
    }

    /// Commit and close.
    pub fn close(mut self) -> Result<(), PackagingError> {
        self.update()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compress::{CompressionResult, Compressor, StoreCompressor};
    use std::io::Cursor;

    fn options() -> ZFileOptions {
        ZFileOptions::new().with_no_timestamps(true)
    }

    fn text(len: usize) -> Vec<u8> {
        b"lorem ipsum dolor sit amet "
            .iter()
            .cycle()
            .take(len)
            .copied()
            .collect()
    }

    fn zip_read(path: &Path, name: &str) -> Vec<u8> {
        let mut archive = zip::ZipArchive::new(File::open(path).unwrap()).unwrap();
        let mut entry = archive.by_name(name).unwrap();
        let mut out = Vec::new();
        entry.read_to_end(&mut out).unwrap();
        out
    }

    #[test]
    fn new_archive_is_readable_by_zip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("new.zip");
        let mut zf = ZFile::open(&path, options()).unwrap();
        zf.add("a.txt", text(5000), true).unwrap();
        zf.add("dir/", Vec::new(), true).unwrap();
        zf.add("dir/b.bin", vec![1, 2, 3], false).unwrap();
        zf.close().unwrap();

        assert_eq!(zip_read(&path, "a.txt"), text(5000));
        assert_eq!(zip_read(&path, "dir/b.bin"), vec![1, 2, 3]);
        let archive = zip::ZipArchive::new(File::open(&path).unwrap()).unwrap();
        assert_eq!(archive.len(), 3);

        let zf = ZFile::open(&path, options()).unwrap();
        assert_eq!(zf.get("a.txt").unwrap().method(), Some(CompressionMethod::Deflated));
        assert!(zf.get("dir/").unwrap().is_directory());
        assert_eq!(zf.read_entry("a.txt").unwrap(), text(5000));
        assert!(matches!(
            zf.read_entry("missing"),
            Err(PackagingError::EntryNotFound(_))
        ));
    }

    #[test]
    fn untouched_entries_keep_their_offsets() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("inc.zip");
        let mut zf = ZFile::open(&path, options()).unwrap();
        zf.add("one", text(1000), true).unwrap();
        zf.add("two", text(2000), true).unwrap();
        zf.close().unwrap();

        let mut zf = ZFile::open(&path, options()).unwrap();
        let before: Vec<_> = zf.entries().map(|e| e.local_header_offset()).collect();
        zf.add("three", text(3000), true).unwrap();
        zf.update().unwrap();
        let after: Vec<_> = zf.entries().take(2).map(|e| e.local_header_offset()).collect();
        assert_eq!(before, after);
        zf.close().unwrap();
        assert_eq!(zip_read(&path, "three"), text(3000));
    }

    #[test]
    fn removing_an_entry_moves_the_following_ones() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rm.zip");
        let mut zf = ZFile::open(&path, options()).unwrap();
        for name in ["a", "b", "c"] {
            zf.add(name, text(4000), true).unwrap();
        }
        zf.close().unwrap();
        let full_len = std::fs::metadata(&path).unwrap().len();

        let mut zf = ZFile::open(&path, options()).unwrap();
        assert!(zf.remove("a"));
        assert!(!zf.remove("a"));
        zf.update().unwrap();
        assert_eq!(zf.get("b").unwrap().local_header_offset(), Some(0));
        zf.close().unwrap();

        assert!(std::fs::metadata(&path).unwrap().len() < full_len);
        assert_eq!(zip_read(&path, "c"), text(4000));
        assert_eq!(ZFile::open(&path, options()).unwrap().len(), 2);
    }

    #[test]
    fn stored_entries_are_aligned() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("aligned.zip");
        let opts = options().with_alignment_rule(AlignmentRule::apk());
        let mut zf = ZFile::open(&path, opts.clone()).unwrap();
        zf.add("x", vec![7u8; 3], false).unwrap();
        zf.add("lib/arm64-v8a/libz.so", vec![9u8; 100], false).unwrap();
        zf.add("res/raw/odd", vec![1u8; 5], false).unwrap();
        zf.close().unwrap();

        let zf = ZFile::open(&path, opts).unwrap();
        assert_eq!(zf.get("lib/arm64-v8a/libz.so").unwrap().data_offset().unwrap() % 4096, 0);
        assert_eq!(zf.get("res/raw/odd").unwrap().data_offset().unwrap() % 4, 0);
        assert_eq!(zf.get("x").unwrap().data_offset().unwrap() % 4, 0);
        assert_eq!(zip_read(&path, "lib/arm64-v8a/libz.so"), vec![9u8; 100]);
    }

    #[test]
    fn pre_directory_block_survives_reopen_and_drops_on_change() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("block.zip");
        let mut zf = ZFile::open(&path, options()).unwrap();
        zf.add("a", text(100), true).unwrap();
        zf.update().unwrap();
        let entries_end = zf.layout().unwrap().entries_end;
        zf.set_pre_directory_block(Some(vec![0xab; 64]));
        zf.close().unwrap();

        let mut zf = ZFile::open(&path, options()).unwrap();
        assert_eq!(zf.pre_directory_block(), Some(&[0xab; 64][..]));
        let layout = zf.layout().unwrap();
        assert_eq!(layout.entries_end, entries_end);
        assert_eq!(layout.cd_offset, entries_end + 64);

        zf.add("b", text(10), true).unwrap();
        assert!(zf.pre_directory_block().is_none());
        zf.close().unwrap();
        assert!(ZFile::open(&path, options()).unwrap().pre_directory_block().is_none());
    }

    struct FailingCompressor;

    impl Compressor for FailingCompressor {
        fn compress(&self, _source: Arc<TrackedBytes>) -> PendingCompression {
            PendingCompression::ready(Err(PackagingError::Compression("boom".into())))
        }
    }

    #[test]
    fn failed_compression_leaves_the_file_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fail.zip");
        let mut zf = ZFile::open(&path, options()).unwrap();
        zf.add("a", text(100), true).unwrap();
        zf.close().unwrap();
        let before = std::fs::read(&path).unwrap();

        let opts = options().with_compressor(Arc::new(FailingCompressor));
        let mut zf = ZFile::open(&path, opts).unwrap();
        zf.add("b", text(100), true).unwrap();
        assert!(matches!(zf.update(), Err(PackagingError::Compression(_))));
        assert_eq!(std::fs::read(&path).unwrap(), before);

        assert_eq!(zf.get("b").unwrap().method(), None);
        assert!(matches!(zf.update(), Err(PackagingError::Compression(_))));
        assert_eq!(std::fs::read(&path).unwrap(), before);
        assert_eq!(zf.read_entry("b").unwrap(), text(100));
    }

    #[test]
    fn failed_write_keeps_entries_uncommitted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ro.zip");
        let mut zf = ZFile::open(&path, options()).unwrap();
        zf.add("a", text(500), true).unwrap();
        zf.update().unwrap();

        zf.add("b", text(700), false).unwrap();
        zf.file = Mutex::new(File::open(&path).unwrap());
        assert!(matches!(zf.update(), Err(PackagingError::Io(_))));
        assert!(zf.layout().is_none());
        assert!(zf.get("a").unwrap().is_committed());
        assert!(!zf.get("b").unwrap().is_committed());
        assert_eq!(zf.read_entry("b").unwrap(), text(700));

        zf.file = Mutex::new(OpenOptions::new().read(true).write(true).open(&path).unwrap());
        zf.close().unwrap();
        assert_eq!(zip_read(&path, "a"), text(500));
        assert_eq!(zip_read(&path, "b"), text(700));
    }

    #[test]
    fn non_utf8_names_are_written_back_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("latin1.zip");
        let raw_name = b"x\x82y.txt".to_vec();
        let data = b"legacy".to_vec();
        let header = CentralDirectoryHeader {
            version_made_by: VERSION_MADE_BY,
            version_needed: VERSION_STORED,
            flags: 0,
            method: CompressionMethod::Stored.zip_id(),
            last_mod_time: DOS_EPOCH.0,
            last_mod_date: DOS_EPOCH.1,
            crc32: crc32fast::hash(&data),
            compressed_size: data.len() as u32,
            uncompressed_size: data.len() as u32,
            name: String::from_utf8_lossy(&raw_name).into_owned(),
            raw_name: raw_name.clone(),
            extra: Vec::new(),
            comment: Vec::new(),
            disk_start: 0,
            internal_attrs: 0,
            external_attrs: FILE_EXTERNAL_ATTRS,
            local_header_offset: 0,
        };
        let mut archive = header.local_header(&[]).unwrap();
        archive.extend_from_slice(&data);
        let cd_offset = archive.len() as u64;
        header.write_to(&mut archive).unwrap();
        EndOfCentralDirectory::for_directory(1, header.encoded_len() as u64, cd_offset, Vec::new())
            .unwrap()
            .write_to(&mut archive)
            .unwrap();
        std::fs::write(&path, &archive).unwrap();

        let mut zf = ZFile::open(&path, options()).unwrap();
        zf.add("new.txt", text(10), false).unwrap();
        zf.close().unwrap();

        let bytes = std::fs::read(&path).unwrap();
        let count = bytes.windows(raw_name.len()).filter(|w| *w == &raw_name[..]).count();
        assert_eq!(count, 2);
        let lossy = "x\u{FFFD}y.txt".as_bytes();
        assert!(!bytes.windows(lossy.len()).any(|w| w == lossy));
        let zf = ZFile::open(&path, options()).unwrap();
        assert_eq!(zf.read_entry("x\u{FFFD}y.txt").unwrap(), data);
    }

    #[test]
    fn comment_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("comment.zip");
        let mut zf = ZFile::open(&path, options()).unwrap();
        zf.add("a", text(10), true).unwrap();
        zf.set_comment(b"built by apkzip".to_vec()).unwrap();
        assert!(matches!(
            zf.set_comment(vec![0u8; MAX_EOCD_COMMENT + 1]),
            Err(PackagingError::Config(_))
        ));
        zf.close().unwrap();

        let zf = ZFile::open(&path, options()).unwrap();
        assert_eq!(zf.comment(), b"built by apkzip");
        let archive = zip::ZipArchive::new(File::open(&path).unwrap()).unwrap();
        assert_eq!(archive.comment(), b"built by apkzip");
    }

    #[test]
    fn merge_copies_compressed_payloads() {
        let dir = tempfile::tempdir().unwrap();
        let src_path = dir.path().join("src.zip");
        let mut src = ZFile::open(&src_path, options()).unwrap();
        src.add("keep", text(8000), true).unwrap();
        src.add("skip", text(10), true).unwrap();
        src.close().unwrap();
        let src = ZFile::open(&src_path, options()).unwrap();

        let opts = options().with_compressor(Arc::new(StoreCompressor));
        let mut dst = ZFile::open(dir.path().join("dst.zip"), opts).unwrap();
        assert_eq!(dst.merge_from(&src, |n| n == "skip").unwrap(), 1);
        dst.update().unwrap();
        let merged = dst.get("keep").unwrap();
        assert_eq!(merged.method(), Some(CompressionMethod::Deflated));
        assert_eq!(merged.compressed_size(), src.get("keep").unwrap().compressed_size());
        assert!(dst.get("skip").is_none());
        assert_eq!(dst.read_entry("keep").unwrap(), text(8000));
    }

    #[test]
    fn read_raw_waits_for_compression() {
        let dir = tempfile::tempdir().unwrap();
        let mut zf = ZFile::open(dir.path().join("raw.zip"), options()).unwrap();
        zf.add("a", text(3000), true).unwrap();
        assert_eq!(zf.get("a").unwrap().method(), None);
        let raw = zf.read_raw("a").unwrap();
        let mut inflated = Vec::new();
        DeflateDecoder::new(Cursor::new(raw))
            .read_to_end(&mut inflated)
            .unwrap();
        assert_eq!(inflated, text(3000));
    }

    #[test]
    fn tracker_drains_after_commit() {
        let dir = tempfile::tempdir().unwrap();
        let opts = options().with_threads(2).unwrap();
        let tracker = Arc::clone(opts.tracker());
        let mut zf = ZFile::open(dir.path().join("t.zip"), opts).unwrap();
        for i in 0..20 {
            zf.add(&format!("f{}", i), text(1000 + i), true).unwrap();
        }
        assert!(tracker.bytes_used() > 0);
        zf.close().unwrap();
        assert_eq!(tracker.bytes_used(), 0);
        assert!(tracker.max_bytes_used() >= 20_000);
    }

    #[test]
    fn stored_result_of_compressor_is_accepted() {
        struct Identity;
        impl Compressor for Identity {
            fn compress(&self, source: Arc<TrackedBytes>) -> PendingCompression {
                PendingCompression::ready(Ok(CompressionResult::stored(source)))
            }
        }
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("id.zip");
        let mut zf = ZFile::open(&path, options().with_compressor(Arc::new(Identity))).unwrap();
        zf.add("a", text(10), true).unwrap();
        zf.close().unwrap();
        assert_eq!(zip_read(&path, "a"), text(10));
    }

    #[test]
    fn padding_is_large_enough_for_the_extra_field() {
        assert_eq!(alignment_padding(100, 4), 0);
        assert_eq!(alignment_padding(102, 4), 6);
        assert_eq!(alignment_padding(101, 4), 7);
        assert_eq!(alignment_padding(4095, 4096), 4097);
        assert_eq!(alignment_padding(17, 1), 0);
    }
}
