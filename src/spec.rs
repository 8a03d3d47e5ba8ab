//! The nitty gritty of the ZIP file format.
//!
//! Everything here is a pure function over byte slices:
//! no I/O, no shared state. The [`read`] module turns these raw records
//! into something user-friendly.
//!
//! Record layouts are quoted from the ZIP spec, [`APPNOTE.TXT`].
//!
//! [`read`]: ../read/index.html
//! [`APPNOTE.TXT`]: https://pkware.cachefly.net/webdocs/APPNOTE/APPNOTE-6.3.6.TXT

use std::convert::TryInto;

use chrono::{NaiveDate, NaiveDateTime};
use memchr::memmem;

use crate::arch::usize;
use crate::result::*;

// Magic numbers denoting various sections of a ZIP archive

/// End of central directory magic number
pub const EOCDR_MAGIC: [u8; 4] = [b'P', b'K', 5, 6];
/// Zip64 end of central directory magic number
const ZIP64_EOCDR_MAGIC: [u8; 4] = [b'P', b'K', 6, 6];
/// Zip64 end of central directory locator magic number
const ZIP64_EOCDR_LOCATOR_MAGIC: [u8; 4] = [b'P', b'K', 6, 7];
/// Central directory magic number
const CENTRAL_DIRECTORY_MAGIC: [u8; 4] = [b'P', b'K', 1, 2];
/// Local file header magic number
const LOCAL_FILE_HEADER_MAGIC: [u8; 4] = [b'P', b'K', 3, 4];

/// Fixed size of the End of central directory record,
/// sans the trailing comment.
pub const EOCDR_FIXED_SIZE: usize = 22;

/// The comment length is a u16, so the EOCDR can't sit further than this
/// from the end of the file.
const MAX_COMMENT_LENGTH: usize = u16::MAX as usize;

/// Fixed size of a central directory record,
/// sans the name/extra/comment fields.
pub const CENTRAL_DIRECTORY_ENTRY_FIXED_SIZE: usize = 46;

/// Fixed size of a local file header, sans the name/extra fields.
pub const LOCAL_FILE_HEADER_FIXED_SIZE: usize = 30;

// Straight from the Rust docs:

/// Reads a little-endian u64 from the front of the provided slice, shrinking it.
fn read_u64(input: &mut &[u8]) -> u64 {
    let (int_bytes, rest) = input.split_at(std::mem::size_of::<u64>());
    *input = rest;
    u64::from_le_bytes(int_bytes.try_into().expect("less than eight bytes for u64"))
}

/// Reads a little-endian u32 from the front of the provided slice, shrinking it.
fn read_u32(input: &mut &[u8]) -> u32 {
    let (int_bytes, rest) = input.split_at(std::mem::size_of::<u32>());
    *input = rest;
    u32::from_le_bytes(int_bytes.try_into().expect("less than four bytes for u32"))
}

/// Reads a little-endian u16 from the front of the provided slice, shrinking it.
fn read_u16(input: &mut &[u8]) -> u16 {
    let (int_bytes, rest) = input.split_at(std::mem::size_of::<u16>());
    *input = rest;
    u16::from_le_bytes(int_bytes.try_into().expect("less than two bytes for u16"))
}

/// Bit 11: Language encoding flag (EFS). If set, the filename and comment
/// fields MUST be encoded using UTF-8. Otherwise text is assumed to be CP437.
pub fn is_utf8(flags: u16) -> bool {
    flags & (1 << 11) != 0
}

/// Bit 0: If set, the file is encrypted. (Decryption is unsupported.)
pub fn is_encrypted(flags: u16) -> bool {
    flags & 1 != 0
}

/// Bit 3: If set, the sizes and CRC-32 in the local file header are zero
/// and the real values live in a data descriptor trailing the payload.
/// The central directory always has the real values.
pub fn has_data_descriptor(flags: u16) -> bool {
    flags & (1 << 3) != 0
}

/// Searches backward through the tail of `mapping` for the
/// End of central directory record, returning its offset.
///
/// The record should be right at the end of the file, but its
/// variable-length comment means we can't jump to a known offset.
/// The comment length caps the search at the last 64 KB + 22 bytes,
/// so a big non-ZIP file fails fast instead of being scanned whole.
pub fn find_eocdr(mapping: &[u8]) -> ZipResult<usize> {
    let tail_start = mapping
        .len()
        .saturating_sub(EOCDR_FIXED_SIZE + MAX_COMMENT_LENGTH);
    memmem::rfind(&mapping[tail_start..], &EOCDR_MAGIC)
        .map(|posit| tail_start + posit)
        .ok_or(ZipError::EndRecordNotFound)
}

/// Data from the End of central directory record
///
/// Found at the back of the archive; provides offsets for finding the
/// central directory, along with lots of stuff that stopped being relevant
/// when we stopped breaking ZIP archives onto multiple floppies.
#[derive(Debug)]
pub struct EndOfCentralDirectory<'a> {
    pub disk_number: u16,
    pub disk_with_central_directory: u16,
    pub entries_on_this_disk: u16,
    pub entries: u16,
    pub central_directory_size: u32,
    pub central_directory_offset: u32,
    pub file_comment: &'a [u8],
}

impl<'a> EndOfCentralDirectory<'a> {
    pub fn parse(mut eocdr: &'a [u8]) -> ZipResult<Self> {
        // 4.3.16  End of central directory record:
        //
        // signature                       4 bytes  (0x06054b50)
        // number of this disk             2 bytes
        // disk with start of the CD       2 bytes
        // CD entries on this disk         2 bytes
        // CD entries, total               2 bytes
        // size of the central directory   4 bytes
        // offset of start of the CD       4 bytes
        // zipfile comment length          2 bytes
        if eocdr.len() < EOCDR_FIXED_SIZE {
            return Err(ZipError::MalformedHeader(
                "End Of Central Directory Record cut short",
            ));
        }
        if eocdr[..4] != EOCDR_MAGIC {
            return Err(ZipError::MalformedHeader(
                "bad End Of Central Directory Record signature",
            ));
        }
        eocdr = &eocdr[4..];
        let disk_number = read_u16(&mut eocdr);
        let disk_with_central_directory = read_u16(&mut eocdr);
        let entries_on_this_disk = read_u16(&mut eocdr);
        let entries = read_u16(&mut eocdr);
        let central_directory_size = read_u32(&mut eocdr);
        let central_directory_offset = read_u32(&mut eocdr);
        let comment_length = read_u16(&mut eocdr);
        let file_comment = eocdr.get(..usize(comment_length)?).ok_or(
            ZipError::MalformedHeader("comment runs past the end of the file"),
        )?;

        Ok(Self {
            disk_number,
            disk_with_central_directory,
            entries_on_this_disk,
            entries,
            central_directory_size,
            central_directory_offset,
            file_comment,
        })
    }
}

/// Data from the Zip64 end of central directory locator
///
/// On Zip64 archives this immediately precedes the End of central directory
/// record and tells us where to find the Zip64 end of central directory record.
#[derive(Debug)]
pub struct Zip64EndOfCentralDirectoryLocator {
    pub disk_with_central_directory: u32,
    pub zip64_eocdr_offset: u64,
    pub disks: u32,
}

impl Zip64EndOfCentralDirectoryLocator {
    /// Parses a locator, or returns `None` if the signature doesn't match
    /// (i.e., this isn't a Zip64 archive).
    pub fn parse(mut mapping: &[u8]) -> Option<Self> {
        // 4.3.15 Zip64 end of central directory locator
        //
        // signature                       4 bytes  (0x07064b50)
        // disk with the zip64 EOCDR       4 bytes
        // relative offset of zip64 EOCDR  8 bytes
        // total number of disks           4 bytes
        if mapping.len() < Self::size_in_file() || mapping[..4] != ZIP64_EOCDR_LOCATOR_MAGIC {
            return None;
        }
        mapping = &mapping[4..];
        let disk_with_central_directory = read_u32(&mut mapping);
        let zip64_eocdr_offset = read_u64(&mut mapping);
        let disks = read_u32(&mut mapping);

        Some(Self {
            disk_with_central_directory,
            zip64_eocdr_offset,
            disks,
        })
    }

    pub fn size_in_file() -> usize {
        20
    }
}

/// Finds the Zip64 end of central directory record in the given slice.
///
/// The slice should start at the record's nominal location, but we might
/// have to do some searching since archives can have arbitrary junk up front.
pub fn find_zip64_eocdr(mapping: &[u8]) -> ZipResult<usize> {
    memmem::find(mapping, &ZIP64_EOCDR_MAGIC).ok_or(ZipError::MalformedHeader(
        "couldn't find the zip64 End Of Central Directory Record",
    ))
}

/// Data from the Zip64 end of central directory record
///
/// 64-bit versions of the interesting [`EndOfCentralDirectory`] fields,
/// for archives where those saturated.
#[derive(Debug)]
pub struct Zip64EndOfCentralDirectory<'a> {
    pub source_version: u16,
    pub minimum_extract_version: u16,
    pub disk_number: u32,
    pub disk_with_central_directory: u32,
    pub entries_on_this_disk: u64,
    pub entries: u64,
    pub central_directory_size: u64,
    pub central_directory_offset: u64,
    pub extensible_data: &'a [u8],
}

impl<'a> Zip64EndOfCentralDirectory<'a> {
    pub fn parse(mut eocdr: &'a [u8]) -> ZipResult<Self> {
        // 4.3.14  Zip64 end of central directory record
        //
        // signature                       4 bytes  (0x06064b50)
        // size of zip64 EOCDR             8 bytes
        // version made by                 2 bytes
        // version needed to extract       2 bytes
        // number of this disk             4 bytes
        // disk with start of the CD       4 bytes
        // CD entries on this disk         8 bytes
        // CD entries, total               8 bytes
        // size of the central directory   8 bytes
        // offset of start of the CD       8 bytes
        // zip64 extensible data sector    (variable size)
        if eocdr.len() < Self::fixed_size_in_file() {
            return Err(ZipError::MalformedHeader(
                "zip64 End Of Central Directory Record cut short",
            ));
        }
        if eocdr[..4] != ZIP64_EOCDR_MAGIC {
            return Err(ZipError::MalformedHeader(
                "bad zip64 End Of Central Directory Record signature",
            ));
        }
        eocdr = &eocdr[4..];
        let eocdr_size = read_u64(&mut eocdr);
        let source_version = read_u16(&mut eocdr);
        let minimum_extract_version = read_u16(&mut eocdr);
        let disk_number = read_u32(&mut eocdr);
        let disk_with_central_directory = read_u32(&mut eocdr);
        let entries_on_this_disk = read_u64(&mut eocdr);
        let entries = read_u64(&mut eocdr);
        let central_directory_size = read_u64(&mut eocdr);
        let central_directory_offset = read_u64(&mut eocdr);

        // 4.3.14.1: the stored size doesn't include the signature
        // or the size field itself, i.e.,
        // Size = SizeOfFixedFields + SizeOfVariableData - 12.
        let eocdr_size = usize(eocdr_size)?;
        let extensible_data_length = eocdr_size
            .checked_add(12)
            .and_then(|with_lead_in| with_lead_in.checked_sub(Self::fixed_size_in_file()))
            .ok_or(ZipError::MalformedHeader(
                "impossible zip64 End Of Central Directory Record size",
            ))?;
        let extensible_data = eocdr.get(..extensible_data_length).ok_or(
            ZipError::MalformedHeader("zip64 extensible data runs past the end of the file"),
        )?;

        Ok(Self {
            source_version,
            minimum_extract_version,
            disk_number,
            disk_with_central_directory,
            entries_on_this_disk,
            entries,
            central_directory_size,
            central_directory_offset,
            extensible_data,
        })
    }

    fn fixed_size_in_file() -> usize {
        56
    }
}

/// Data from a central directory record: everything the archive knows
/// about a stored file without touching its local header.
#[derive(Debug)]
pub struct CentralDirectoryEntry<'a> {
    pub source_version: u16,
    pub minimum_extract_version: u16,
    pub flags: u16,
    pub compression_method: u16,
    pub last_modified_time: u16,
    pub last_modified_date: u16,
    pub crc32: u32,
    pub compressed_size: u32,
    pub uncompressed_size: u32,
    pub disk_number: u16,
    pub internal_file_attributes: u16,
    pub external_file_attributes: u32,
    pub header_offset: u32,
    pub name: &'a [u8],
    pub extra_field: &'a [u8],
    pub file_comment: &'a [u8],
}

impl<'a> CentralDirectoryEntry<'a> {
    /// Parses one record from the front of `entry`,
    /// advancing it past the record and its variable-length fields.
    pub fn parse_and_consume(entry: &mut &'a [u8]) -> ZipResult<Self> {
        // 4.3.12  Central directory structure, per file:
        //
        // signature                       4 bytes  (0x02014b50)
        // version made by                 2 bytes
        // version needed to extract       2 bytes
        // general purpose bit flag        2 bytes
        // compression method              2 bytes
        // last mod file time              2 bytes
        // last mod file date              2 bytes
        // crc-32                          4 bytes
        // compressed size                 4 bytes
        // uncompressed size               4 bytes
        // file name length                2 bytes
        // extra field length              2 bytes
        // file comment length             2 bytes
        // disk number start               2 bytes
        // internal file attributes        2 bytes
        // external file attributes        4 bytes
        // relative offset of local header 4 bytes
        //
        // file name, extra field, file comment (variable size)
        if entry.len() < CENTRAL_DIRECTORY_ENTRY_FIXED_SIZE {
            return Err(ZipError::TruncatedDirectory(
                "record runs past the end of the directory",
            ));
        }
        if entry[..4] != CENTRAL_DIRECTORY_MAGIC {
            return Err(ZipError::MalformedHeader(
                "bad central directory record signature",
            ));
        }
        *entry = &entry[4..];
        let source_version = read_u16(entry);
        let minimum_extract_version = read_u16(entry);
        let flags = read_u16(entry);
        let compression_method = read_u16(entry);
        let last_modified_time = read_u16(entry);
        let last_modified_date = read_u16(entry);
        let crc32 = read_u32(entry);
        let compressed_size = read_u32(entry);
        let uncompressed_size = read_u32(entry);
        let name_length = usize(read_u16(entry))?;
        let extra_field_length = usize(read_u16(entry))?;
        let file_comment_length = usize(read_u16(entry))?;
        let disk_number = read_u16(entry);
        let internal_file_attributes = read_u16(entry);
        let external_file_attributes = read_u32(entry);
        let header_offset = read_u32(entry);

        if name_length + extra_field_length + file_comment_length > entry.len() {
            return Err(ZipError::TruncatedDirectory(
                "variable-length fields run past the end of the directory",
            ));
        }
        let (name, remaining) = entry.split_at(name_length);
        let (extra_field, remaining) = remaining.split_at(extra_field_length);
        let (file_comment, remaining) = remaining.split_at(file_comment_length);
        *entry = remaining;

        Ok(Self {
            source_version,
            minimum_extract_version,
            flags,
            compression_method,
            last_modified_time,
            last_modified_date,
            crc32,
            compressed_size,
            uncompressed_size,
            disk_number,
            internal_file_attributes,
            external_file_attributes,
            header_offset,
            name,
            extra_field,
            file_comment,
        })
    }
}

/// Data from a local file header
///
/// Each file's payload is immediately preceded by one of these.
/// When the data descriptor flag is set, the sizes and CRC here are zeros
/// and only the central directory has the real values.
#[derive(Debug)]
pub struct LocalFileHeader<'a> {
    pub minimum_extract_version: u16,
    pub flags: u16,
    pub compression_method: u16,
    pub last_modified_time: u16,
    pub last_modified_date: u16,
    pub crc32: u32,
    pub compressed_size: u32,
    pub uncompressed_size: u32,
    pub name: &'a [u8],
    pub extra_field: &'a [u8],
}

impl<'a> LocalFileHeader<'a> {
    /// Parses the header from the front of `header`, advancing it past the
    /// variable-length fields. On success `header` starts at the payload.
    pub fn parse_and_consume(header: &mut &'a [u8]) -> ZipResult<Self> {
        // 4.3.7  Local file header:
        //
        // signature                       4 bytes  (0x04034b50)
        // version needed to extract       2 bytes
        // general purpose bit flag        2 bytes
        // compression method              2 bytes
        // last mod file time              2 bytes
        // last mod file date              2 bytes
        // crc-32                          4 bytes
        // compressed size                 4 bytes
        // uncompressed size               4 bytes
        // file name length                2 bytes
        // extra field length              2 bytes
        //
        // file name, extra field (variable size)
        if header.len() < LOCAL_FILE_HEADER_FIXED_SIZE {
            return Err(ZipError::MalformedHeader("local file header cut short"));
        }
        if header[..4] != LOCAL_FILE_HEADER_MAGIC {
            return Err(ZipError::MalformedHeader(
                "bad local file header signature",
            ));
        }
        *header = &header[4..];
        let minimum_extract_version = read_u16(header);
        let flags = read_u16(header);
        let compression_method = read_u16(header);
        let last_modified_time = read_u16(header);
        let last_modified_date = read_u16(header);
        let crc32 = read_u32(header);
        let compressed_size = read_u32(header);
        let uncompressed_size = read_u32(header);
        let name_length = usize(read_u16(header))?;
        let extra_field_length = usize(read_u16(header))?;

        if name_length + extra_field_length > header.len() {
            return Err(ZipError::MalformedHeader(
                "local file header fields run past the end of the file",
            ));
        }
        let (name, remaining) = header.split_at(name_length);
        let (extra_field, remaining) = remaining.split_at(extra_field_length);
        *header = remaining;

        Ok(Self {
            minimum_extract_version,
            flags,
            compression_method,
            last_modified_time,
            last_modified_date,
            crc32,
            compressed_size,
            uncompressed_size,
            name,
            extra_field,
        })
    }
}

/// Walks the "extra fields" of a central directory record looking for the
/// Zip64 extended information field (0x0001), which carries 64-bit values
/// for each 32-bit field that saturated at `0xFFFFFFFF`.
///
/// Other field kinds are skipped.
pub fn parse_zip64_extra_field(
    mut extra_field: &[u8],
    size: &mut usize,
    compressed_size: &mut usize,
    header_offset: &mut usize,
) -> ZipResult<()> {
    // 4.5.1: the extra field is a sequence of
    //     Header ID - 2 bytes
    //     Data Size - 2 bytes
    //     data      - (variable)
    while extra_field.len() >= 4 {
        let kind = read_u16(&mut extra_field);
        let field_length = read_u16(&mut extra_field) as usize;
        if field_length > extra_field.len() {
            return Err(ZipError::MalformedHeader(
                "extra field runs past its container",
            ));
        }
        let (mut field, rest) = extra_field.split_at(field_length);
        extra_field = rest;

        if kind != 0x0001 {
            continue;
        }
        // 4.5.3: the Zip64 field holds one u64 per saturated field,
        // in this fixed order. (Disk numbers would follow, but we already
        // refused multi-disk archives.)
        for slot in [&mut *size, &mut *compressed_size, &mut *header_offset] {
            if *slot == u32::MAX as usize {
                if field.len() < 8 {
                    return Err(ZipError::MalformedHeader("zip64 extra field cut short"));
                }
                *slot = usize(read_u64(&mut field))?;
            }
        }
    }
    Ok(())
}

/// Converts MS-DOS time and date words to a calendar timestamp.
///
/// Returns `None` for nonsense values (including the all-zero fields
/// many archivers write when they don't care).
pub fn parse_msdos(time: u16, date: u16) -> Option<NaiveDateTime> {
    let seconds = (0b0000_0000_0001_1111 & time) as u32 * 2; // 2-second precision
    let minutes = (0b0000_0111_1110_0000 & time) as u32 >> 5;
    let hours = (0b1111_1000_0000_0000 & time) as u32 >> 11;

    let days = (0b0000_0000_0001_1111 & date) as u32;
    let months = (0b0000_0001_1110_0000 & date) as u32 >> 5;
    // MS-DOS counts years from 1980.
    let years = ((0b1111_1110_0000_0000 & date) >> 9) as i32 + 1980;

    NaiveDate::from_ymd_opt(years, months, days)?.and_hms_opt(hours, minutes, seconds)
}
