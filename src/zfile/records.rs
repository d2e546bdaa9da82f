/*
 * apkzip v1.0.0
 * Copyright (c) 2026 Tiash H Kabir / @MrCarb0n.
 * Licensed under the MIT License.
 */

//! PKZIP record layouts: local file header, central directory header and
//! end of central directory. Little endian throughout; no ZIP64.

use crate::error::PackagingError;
use byteorder::{LittleEndian as LE, ReadBytesExt, WriteBytesExt};
use std::io::{Cursor, Read, Write};

pub const LOCAL_FILE_HEADER_SIG: u32 = 0x0403_4b50;
pub const CENTRAL_DIR_HEADER_SIG: u32 = 0x0201_4b50;
pub const EOCD_SIG: u32 = 0x0605_4b50;
pub const DATA_DESCRIPTOR_SIG: u32 = 0x0807_4b50;

pub const LOCAL_FILE_HEADER_LEN: usize = 30;
pub const CENTRAL_DIR_HEADER_LEN: usize = 46;
pub const EOCD_LEN: usize = 22;
pub const MAX_EOCD_COMMENT: usize = u16::MAX as usize;

/// General purpose flag: sizes and CRC follow the data in a descriptor.
pub const FLAG_DATA_DESCRIPTOR: u16 = 1 << 3;
/// General purpose flag: name and comment are UTF-8.
pub const FLAG_UTF8: u16 = 1 << 11;

/// Version made by: UNIX host, PKZIP 2.0.
pub const VERSION_MADE_BY: u16 = (3 << 8) | 20;
pub const VERSION_STORED: u16 = 10;
pub const VERSION_DEFLATED: u16 = 20;

/// Extra field used to pad local headers so stored data lands aligned.
pub const ALIGNMENT_EXTRA_ID: u16 = 0xd935;
pub const ALIGNMENT_EXTRA_MIN_LEN: usize = 6;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CentralDirectoryHeader {
    pub version_made_by: u16,
    pub version_needed: u16,
    pub flags: u16,
    pub method: u16,
    pub last_mod_time: u16,
    pub last_mod_date: u16,
    pub crc32: u32,
    pub compressed_size: u32,
    pub uncompressed_size: u32,
    /// Entry name as used for lookups; not valid UTF-8 names are decoded lossily.
    pub name: String,
    /// Entry name bytes exactly as they are written to both headers.
    pub raw_name: Vec<u8>,
    pub extra: Vec<u8>,
    pub comment: Vec<u8>,
    pub disk_start: u16,
    pub internal_attrs: u16,
    pub external_attrs: u32,
    pub local_header_offset: u32,
}

impl CentralDirectoryHeader {
    pub fn encoded_len(&self) -> usize {
        CENTRAL_DIR_HEADER_LEN + self.raw_name.len() + self.extra.len() + self.comment.len()
    }

    pub fn write_to<W: Write>(&self, w: &mut W) -> Result<(), PackagingError> {
        w.write_u32::<LE>(CENTRAL_DIR_HEADER_SIG)?;
        w.write_u16::<LE>(self.version_made_by)?;
        w.write_u16::<LE>(self.version_needed)?;
        w.write_u16::<LE>(self.flags)?;
        w.write_u16::<LE>(self.method)?;
        w.write_u16::<LE>(self.last_mod_time)?;
        w.write_u16::<LE>(self.last_mod_date)?;
        w.write_u32::<LE>(self.crc32)?;
        w.write_u32::<LE>(self.compressed_size)?;
        w.write_u32::<LE>(self.uncompressed_size)?;
        w.write_u16::<LE>(len_u16(self.raw_name.len(), "entry name")?)?;
        w.write_u16::<LE>(len_u16(self.extra.len(), "extra field")?)?;
        w.write_u16::<LE>(len_u16(self.comment.len(), "entry comment")?)?;
        w.write_u16::<LE>(self.disk_start)?;
        w.write_u16::<LE>(self.internal_attrs)?;
        w.write_u32::<LE>(self.external_attrs)?;
        w.write_u32::<LE>(self.local_header_offset)?;
        w.write_all(&self.raw_name)?;
        w.write_all(&self.extra)?;
        w.write_all(&self.comment)?;
        Ok(())
    }

    /// Parse one header from `cursor`, which must sit on its signature.
    pub fn read_from(cursor: &mut Cursor<&[u8]>) -> Result<Self, PackagingError> {
        if cursor.read_u32::<LE>()? != CENTRAL_DIR_HEADER_SIG {
            return Err(PackagingError::format("bad central directory header signature"));
        }
        let version_made_by = cursor.read_u16::<LE>()?;
        let version_needed = cursor.read_u16::<LE>()?;
        let flags = cursor.read_u16::<LE>()?;
        let method = cursor.read_u16::<LE>()?;
        let last_mod_time = cursor.read_u16::<LE>()?;
        let last_mod_date = cursor.read_u16::<LE>()?;
        let crc32 = cursor.read_u32::<LE>()?;
        let compressed_size = cursor.read_u32::<LE>()?;
        let uncompressed_size = cursor.read_u32::<LE>()?;
        let name_len = cursor.read_u16::<LE>()? as usize;
        let extra_len = cursor.read_u16::<LE>()? as usize;
        let comment_len = cursor.read_u16::<LE>()? as usize;
        let disk_start = cursor.read_u16::<LE>()?;
        let internal_attrs = cursor.read_u16::<LE>()?;
        let external_attrs = cursor.read_u32::<LE>()?;
        let local_header_offset = cursor.read_u32::<LE>()?;

        let raw_name = read_vec(cursor, name_len)?;
        let extra = read_vec(cursor, extra_len)?;
        let comment = read_vec(cursor, comment_len)?;

        if compressed_size == u32::MAX
            || uncompressed_size == u32::MAX
            || local_header_offset == u32::MAX
        {
            return Err(PackagingError::Unsupported("ZIP64 entries".into()));
        }

        Ok(Self {
            version_made_by,
            version_needed,
            flags,
            method,
            last_mod_time,
            last_mod_date,
            crc32,
            compressed_size,
            uncompressed_size,
            name: String::from_utf8_lossy(&raw_name).into_owned(),
            raw_name,
            extra,
            comment,
            disk_start,
            internal_attrs,
            external_attrs,
            local_header_offset,
        })
    }

    /// Local file header matching this entry, with the given extra field.
    pub fn local_header(&self, extra: &[u8]) -> Result<Vec<u8>, PackagingError> {
        let mut out = Vec::with_capacity(LOCAL_FILE_HEADER_LEN + self.raw_name.len() + extra.len());
        out.write_u32::<LE>(LOCAL_FILE_HEADER_SIG)?;
        out.write_u16::<LE>(self.version_needed)?;
        out.write_u16::<LE>(self.flags & !FLAG_DATA_DESCRIPTOR)?;
        out.write_u16::<LE>(self.method)?;
        out.write_u16::<LE>(self.last_mod_time)?;
        out.write_u16::<LE>(self.last_mod_date)?;
        out.write_u32::<LE>(self.crc32)?;
        out.write_u32::<LE>(self.compressed_size)?;
        out.write_u32::<LE>(self.uncompressed_size)?;
        out.write_u16::<LE>(len_u16(self.raw_name.len(), "entry name")?)?;
        out.write_u16::<LE>(len_u16(extra.len(), "extra field")?)?;
        out.write_all(&self.raw_name)?;
        out.write_all(extra)?;
        Ok(out)
    }
}

/// Fixed part of a local file header, as read from disk.
#[derive(Debug, Clone, Copy)]
pub struct LocalHeaderInfo {
    pub flags: u16,
    pub name_len: u16,
    pub extra_len: u16,
}

impl LocalHeaderInfo {
    pub fn parse(bytes: &[u8]) -> Result<Self, PackagingError> {
        let mut cursor = Cursor::new(bytes);
        if cursor.read_u32::<LE>()? != LOCAL_FILE_HEADER_SIG {
            return Err(PackagingError::format("bad local file header signature"));
        }
        let _version = cursor.read_u16::<LE>()?;
        let flags = cursor.read_u16::<LE>()?;
        cursor.set_position(26);
        let name_len = cursor.read_u16::<LE>()?;
        let extra_len = cursor.read_u16::<LE>()?;
        Ok(Self {
            flags,
            name_len,
            extra_len,
        })
    }

    pub fn header_len(&self) -> u64 {
        LOCAL_FILE_HEADER_LEN as u64 + self.name_len as u64 + self.extra_len as u64
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EndOfCentralDirectory {
    pub disk_number: u16,
    pub cd_disk: u16,
    pub entries_on_disk: u16,
    pub total_entries: u16,
    pub cd_size: u32,
    pub cd_offset: u32,
    pub comment: Vec<u8>,
}

impl EndOfCentralDirectory {
    pub fn for_directory(entries: usize, cd_size: u64, cd_offset: u64, comment: Vec<u8>) -> Result<Self, PackagingError> {
        let count = u16::try_from(entries)
            .map_err(|_| PackagingError::Unsupported("more than 65535 entries (ZIP64)".into()))?;
        Ok(Self {
            disk_number: 0,
            cd_disk: 0,
            entries_on_disk: count,
            total_entries: count,
            cd_size: offset_u32(cd_size)?,
            cd_offset: offset_u32(cd_offset)?,
            comment,
        })
    }

    pub fn encoded_len(&self) -> usize {
        EOCD_LEN + self.comment.len()
    }

    pub fn write_to<W: Write>(&self, w: &mut W) -> Result<(), PackagingError> {
        w.write_u32::<LE>(EOCD_SIG)?;
        w.write_u16::<LE>(self.disk_number)?;
        w.write_u16::<LE>(self.cd_disk)?;
        w.write_u16::<LE>(self.entries_on_disk)?;
        w.write_u16::<LE>(self.total_entries)?;
        w.write_u32::<LE>(self.cd_size)?;
        w.write_u32::<LE>(self.cd_offset)?;
        w.write_u16::<LE>(len_u16(self.comment.len(), "archive comment")?)?;
        w.write_all(&self.comment)?;
        Ok(())
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, PackagingError> {
        let mut out = Vec::with_capacity(self.encoded_len());
        self.write_to(&mut out)?;
        Ok(out)
    }

    fn parse(bytes: &[u8]) -> Result<Self, PackagingError> {
        let mut cursor = Cursor::new(bytes);
        if cursor.read_u32::<LE>()? != EOCD_SIG {
            return Err(PackagingError::format("bad end of central directory signature"));
        }
        let disk_number = cursor.read_u16::<LE>()?;
        let cd_disk = cursor.read_u16::<LE>()?;
        let entries_on_disk = cursor.read_u16::<LE>()?;
        let total_entries = cursor.read_u16::<LE>()?;
        let cd_size = cursor.read_u32::<LE>()?;
        let cd_offset = cursor.read_u32::<LE>()?;
        let comment_len = cursor.read_u16::<LE>()? as usize;
        let comment = read_vec(&mut cursor, comment_len)?;
        if disk_number != 0 || cd_disk != 0 || entries_on_disk != total_entries {
            return Err(PackagingError::Unsupported("multi-disk archives".into()));
        }
        if total_entries == u16::MAX || cd_offset == u32::MAX || cd_size == u32::MAX {
            return Err(PackagingError::Unsupported("ZIP64 archives".into()));
        }
        Ok(Self {
            disk_number,
            cd_disk,
            entries_on_disk,
            total_entries,
            cd_size,
            cd_offset,
            comment,
        })
    }
}

/// Where the directory structures of an archive live.
#[derive(Debug, Clone)]
pub struct DirectoryLocation {
    pub eocd_offset: u64,
    pub eocd: EndOfCentralDirectory,
}

impl DirectoryLocation {
    pub fn cd_offset(&self) -> u64 {
        self.eocd.cd_offset as u64
    }

    pub fn cd_end(&self) -> u64 {
        self.eocd.cd_offset as u64 + self.eocd.cd_size as u64
    }
}

/// Find the EOCD in the tail of an archive.
///
/// `tail` holds the last bytes of a file of length `file_len`; it must cover
/// at least the EOCD and its comment (`EOCD_LEN + 65535` bytes suffice).
pub fn locate_directory(tail: &[u8], file_len: u64) -> Result<DirectoryLocation, PackagingError> {
    if tail.len() < EOCD_LEN {
        return Err(PackagingError::format("file too small to be a ZIP archive"));
    }
    let tail_start = file_len - tail.len() as u64;
    let sig = EOCD_SIG.to_le_bytes();
    for offset in (0..=tail.len() - EOCD_LEN).rev() {
        if tail[offset..offset + 4] != sig {
            continue;
        }
        let comment_len = u16::from_le_bytes([tail[offset + 20], tail[offset + 21]]) as usize;
        if offset + EOCD_LEN + comment_len != tail.len() {
            continue;
        }
        let eocd = EndOfCentralDirectory::parse(&tail[offset..])?;
        let eocd_offset = tail_start + offset as u64;
        if eocd.cd_offset as u64 + eocd.cd_size as u64 > eocd_offset {
            return Err(PackagingError::format("central directory overlaps its end record"));
        }
        return Ok(DirectoryLocation { eocd_offset, eocd });
    }
    Err(PackagingError::format("end of central directory not found"))
}

/// Parse every central directory header in `cd`.
pub fn read_central_directory(cd: &[u8], expected: usize) -> Result<Vec<CentralDirectoryHeader>, PackagingError> {
    let mut cursor = Cursor::new(cd);
    let mut headers = Vec::with_capacity(expected);
    for _ in 0..expected {
        headers.push(CentralDirectoryHeader::read_from(&mut cursor)?);
    }
    if cursor.position() as usize != cd.len() {
        return Err(PackagingError::format("central directory size does not match its entries"));
    }
    Ok(headers)
}

/// Extra field padding a local header by exactly `padding` bytes (>= 6).
pub fn alignment_extra(alignment: u16, padding: usize) -> Vec<u8> {
    debug_assert!(padding >= ALIGNMENT_EXTRA_MIN_LEN);
    let mut extra = Vec::with_capacity(padding);
    extra.extend_from_slice(&ALIGNMENT_EXTRA_ID.to_le_bytes());
    extra.extend_from_slice(&((padding - 4) as u16).to_le_bytes());
    extra.extend_from_slice(&alignment.to_le_bytes());
    extra.resize(padding, 0);
    extra
}

/// `extra` without any alignment records; other records are kept verbatim.
pub fn strip_alignment_extra(extra: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(extra.len());
    let mut pos = 0;
    while pos + 4 <= extra.len() {
        let id = u16::from_le_bytes([extra[pos], extra[pos + 1]]);
        let len = u16::from_le_bytes([extra[pos + 2], extra[pos + 3]]) as usize;
        let end = pos + 4 + len;
        if end > extra.len() {
            // Malformed tail (old zipalign zero padding): drop it.
            break;
        }
        if id != ALIGNMENT_EXTRA_ID && id != 0 {
            out.extend_from_slice(&extra[pos..end]);
        }
        pos = end;
    }
    out
}

/// Convert a local time to MS-DOS `(time, date)`, clamped to 1980..=2107.
pub fn dos_date_time(dt: &chrono::NaiveDateTime) -> (u16, u16) {
    use chrono::{Datelike, Timelike};
    let year = dt.year().clamp(1980, 2107) as u16;
    let date = ((year - 1980) << 9) | ((dt.month() as u16) << 5) | dt.day() as u16;
    let time = ((dt.hour() as u16) << 11) | ((dt.minute() as u16) << 5) | (dt.second() as u16 / 2);
    (time, date)
}

/// 1980-01-01 00:00:00, the earliest MS-DOS timestamp.
pub const DOS_EPOCH: (u16, u16) = (0, (1 << 5) | 1);

pub fn offset_u32(value: u64) -> Result<u32, PackagingError> {
    u32::try_from(value).map_err(|_| PackagingError::Unsupported("archive larger than 4 GiB (ZIP64)".into()))
}

fn len_u16(len: usize, what: &str) -> Result<u16, PackagingError> {
    u16::try_from(len).map_err(|_| PackagingError::Config(format!("{} longer than 65535 bytes", what)))
}

fn read_vec(cursor: &mut Cursor<&[u8]>, len: usize) -> Result<Vec<u8>, PackagingError> {
    let mut buf = vec![0u8; len];
    cursor
        .read_exact(&mut buf)
        .map_err(|_| PackagingError::format("truncated record"))?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(name: &str) -> CentralDirectoryHeader {
        CentralDirectoryHeader {
            version_made_by: VERSION_MADE_BY,
            version_needed: VERSION_STORED,
            flags: 0,
            method: 0,
            last_mod_time: DOS_EPOCH.0,
            last_mod_date: DOS_EPOCH.1,
            crc32: 0xdead_beef,
            compressed_size: 5,
            uncompressed_size: 5,
            name: name.into(),
            raw_name: name.as_bytes().to_vec(),
            extra: vec![],
            comment: b"c".to_vec(),
            disk_start: 0,
            internal_attrs: 0,
            external_attrs: 0o100644 << 16,
            local_header_offset: 1234,
        }
    }

    #[test]
    fn central_directory_parses_what_it_writes() {
        let headers = vec![header("a.txt"), header("dir/b.bin")];
        let mut cd = Vec::new();
        for h in &headers {
            h.write_to(&mut cd).unwrap();
        }
        assert_eq!(cd.len(), headers.iter().map(|h| h.encoded_len()).sum::<usize>());
        assert_eq!(read_central_directory(&cd, 2).unwrap(), headers);
        assert!(read_central_directory(&cd, 1).is_err());
    }

    #[test]
    fn eocd_is_found_behind_a_comment() {
        let mut file = vec![0u8; 100];
        let eocd = EndOfCentralDirectory::for_directory(0, 0, 100, b"hello".to_vec()).unwrap();
        eocd.write_to(&mut file).unwrap();
        let len = file.len() as u64;
        let loc = locate_directory(&file, len).unwrap();
        assert_eq!(loc.eocd_offset, 100);
        assert_eq!(loc.cd_offset(), 100);
        assert_eq!(loc.cd_end(), 100);
        assert_eq!(loc.eocd.comment, b"hello");
    }

    #[test]
    fn alignment_extra_has_exact_length() {
        let extra = alignment_extra(4, 9);
        assert_eq!(extra.len(), 9);
        assert_eq!(&extra[0..2], &ALIGNMENT_EXTRA_ID.to_le_bytes());
        let mut mixed = vec![0x55, 0x54, 1, 0, 7];
        mixed.extend_from_slice(&extra);
        assert_eq!(strip_alignment_extra(&mixed), vec![0x55, 0x54, 1, 0, 7]);
    }

    #[test]
    fn dos_time_encoding() {
        let dt = chrono::NaiveDate::from_ymd_opt(2008, 2, 29)
            .unwrap()
            .and_hms_opt(13, 45, 31)
            .unwrap();
        let (time, date) = dos_date_time(&dt);
        assert_eq!(date >> 9, 28);
        assert_eq!((date >> 5) & 0xf, 2);
        assert_eq!(date & 0x1f, 29);
        assert_eq!(time >> 11, 13);
        assert_eq!(time & 0x1f, 15);
    }

    #[test]
    fn local_header_drops_descriptor_flag() {
        let mut h = header("x");
        h.flags = FLAG_DATA_DESCRIPTOR | FLAG_UTF8;
        let lfh = h.local_header(&[]).unwrap();
        let info = LocalHeaderInfo::parse(&lfh).unwrap();
        assert_eq!(info.flags, FLAG_UTF8);
        assert_eq!(info.header_len(), lfh.len() as u64);
    }
}
