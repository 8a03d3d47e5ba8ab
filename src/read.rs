//! Tools for reading a ZIP archive.
//!
//! To start reading an archive, open a [`ZipArchive`] from a file path
//! (which memory-maps it) or hand one an in-memory buffer.
//!
//! This library doesn't do any writing,
//! but the module was arranged to resemble the structure of the [Zip crate]
//! in case a writer ever shows up.
//!
//! [Zip crate]: https://crates.io/crates/zip
//! [`ZipArchive`]: struct.ZipArchive.html

use std::borrow::Cow;
use std::collections::HashMap;
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

use chrono::NaiveDateTime;
use codepage_437::*;
use flate2::read::DeflateDecoder;
use log::*;
use memmap2::Mmap;

use crate::arch::usize;
use crate::result::*;
use crate::spec;

/// The compression method used to store a file
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CompressionMethod {
    /// The file is uncompressed
    Stored,
    /// The file is [DEFLATE](https://en.wikipedia.org/wiki/DEFLATE)d.
    /// This is the most common format used by ZIP archives.
    Deflate,
    /// The file is compressed with a yet-unsupported format.
    /// (The u16 indicates the internal format code.)
    Unsupported(u16),
}

impl CompressionMethod {
    fn from_u16(u: u16) -> Self {
        match u {
            0 => CompressionMethod::Stored,
            8 => CompressionMethod::Deflate,
            v => CompressionMethod::Unsupported(v),
        }
    }
}

/// Metadata for a file or directory in the archive,
/// taken from its central directory record
///
/// Entries hold offsets into the mapping, never borrowed bytes,
/// so they stay plain data and the archive stays `Send + Sync`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveEntry {
    /// The entry's name as stored in the central directory:
    /// UTF-8 when flag bit 11 says so, CP437 otherwise.
    pub name: String,

    /// Uncompressed size of the file in bytes
    pub size: usize,

    /// Compressed size of the file in bytes
    pub compressed_size: usize,

    /// Compression algorithm used to store the file
    pub compression_method: CompressionMethod,

    /// The CRC-32 of the decompressed file
    pub crc32: u32,

    /// The general purpose bit flag from the central directory
    pub flags: u16,

    /// Last modification time, in MS-DOS format
    pub last_modified_time: u16,

    /// Last modification date, in MS-DOS format
    pub last_modified_date: u16,

    /// The offset of the entry's local file header in the archive
    pub(crate) header_offset: usize,
}

impl ArchiveEntry {
    /// Returns true if the given entry is a directory
    pub fn is_dir(&self) -> bool {
        self.size == 0 && self.name.ends_with('/')
    }

    /// Returns true if the given entry is a file
    pub fn is_file(&self) -> bool {
        !self.is_dir()
    }

    /// Returns true if the entry is encrypted. (Decryption is unsupported.)
    pub fn is_encrypted(&self) -> bool {
        spec::is_encrypted(self.flags)
    }

    /// Returns true if the entry's payload is followed by a data descriptor,
    /// i.e., its _local_ header holds zeros for the sizes and CRC.
    /// The values in this entry come from the central directory
    /// and are real either way.
    pub fn has_data_descriptor(&self) -> bool {
        spec::has_data_descriptor(self.flags)
    }

    /// The last-modified timestamp, or `None` if the archive recorded
    /// nonsense (commonly all zeros).
    pub fn last_modified(&self) -> Option<NaiveDateTime> {
        spec::parse_msdos(self.last_modified_time, self.last_modified_date)
    }

    /// Builds an entry from a central directory record,
    /// validating its offsets against the mapping.
    ///
    /// `base_offset` is the length of whatever data precedes the actual
    /// archive (zero for an ordinary ZIP file).
    fn from_cde(
        cde: &spec::CentralDirectoryEntry,
        base_offset: usize,
        mapping_len: usize,
    ) -> ZipResult<Self> {
        let name = decode_name(cde.name, cde.flags)?;

        if cde.disk_number != 0 {
            return Err(ZipError::UnsupportedArchive(format!(
                "no support for multi-disk archives: {} claims to be on disk {}",
                name, cde.disk_number,
            )));
        }

        let mut size = usize(cde.uncompressed_size)?;
        let mut compressed_size = usize(cde.compressed_size)?;
        let mut header_offset = usize(cde.header_offset)?;
        spec::parse_zip64_extra_field(
            cde.extra_field,
            &mut size,
            &mut compressed_size,
            &mut header_offset,
        )?;
        header_offset = header_offset.checked_add(base_offset).ok_or(
            ZipError::MalformedHeader("local header offset points past the end of the file"),
        )?;

        // An entry must live inside the mapping: its local header has to fit
        // at the recorded offset, and the compressed payload can't be bigger
        // than everything past that point.
        if header_offset
            .checked_add(spec::LOCAL_FILE_HEADER_FIXED_SIZE)
            .map_or(true, |header_end| header_end > mapping_len)
        {
            return Err(ZipError::MalformedHeader(
                "local header offset points past the end of the file",
            ));
        }
        if compressed_size > mapping_len - header_offset {
            return Err(ZipError::MalformedHeader(
                "compressed size is larger than the rest of the file",
            ));
        }

        Ok(Self {
            name,
            size,
            compressed_size,
            compression_method: CompressionMethod::from_u16(cde.compression_method),
            crc32: cde.crc32,
            flags: cde.flags,
            last_modified_time: cde.last_modified_time,
            last_modified_date: cde.last_modified_date,
            header_offset,
        })
    }
}

/// Decodes an entry name per flag bit 11: UTF-8 if set, CP437 otherwise.
fn decode_name(raw: &[u8], flags: u16) -> ZipResult<String> {
    if spec::is_utf8(flags) {
        Ok(std::str::from_utf8(raw)?.to_owned())
    } else {
        let cow: Cow<str> = Cow::borrow_from_cp437(raw, &CP437_CONTROL);
        Ok(cow.into_owned())
    }
}

/// Knobs for opening an archive
#[derive(Debug, Copy, Clone, Default)]
pub struct ArchiveOptions {
    /// Cross-check every local file header against its central directory
    /// record before decompressing.
    ///
    /// Inconsistent archives are rare, and a checksum catches actual
    /// corruption, so this is off by default.
    pub check_local_headers: bool,
}

/// The bytes backing an archive: a mapping of the file, or a plain buffer.
enum Backing {
    Mapped(Mmap),
    Bytes(Vec<u8>),
}

impl Backing {
    fn bytes(&self) -> &[u8] {
        match self {
            Backing::Mapped(mapping) => mapping,
            Backing::Bytes(bytes) => bytes,
        }
    }
}

/// A ZIP archive, opened for reading
///
/// The handle owns a read-only view of the whole file and an index of its
/// central directory, both fixed at open time. Nothing is mutated afterward
/// and decompression scratch state is per-call, so `&ZipArchive` can be
/// shared across any number of threads and entries can be read concurrently
/// without locks. Dropping the handle releases the mapping; the borrow
/// checker won't let that happen while a read is in flight.
pub struct ZipArchive {
    /// The contents of the ZIP archive
    backing: Backing,
    /// Entries in central-directory order
    entries: Vec<ArchiveEntry>,
    /// Name lookup. Names needn't be unique in the format;
    /// the last occurrence wins, like repeated inserts into a dict.
    by_name: HashMap<String, usize>,
    options: ArchiveOptions,
}

impl ZipArchive {
    /// Memory-maps the file at `path` and scans its central directory.
    ///
    /// ```no_run
    /// # use parzip::ZipArchive;
    /// let archive = ZipArchive::open("foo.zip")?;
    /// let bytes = archive.read("hello.txt")?;
    /// # Ok::<(), parzip::ZipError>(())
    /// ```
    pub fn open<P: AsRef<Path>>(path: P) -> ZipResult<Self> {
        Self::open_with(path, ArchiveOptions::default())
    }

    /// Like [`ZipArchive::open`], with explicit options.
    pub fn open_with<P: AsRef<Path>>(path: P, options: ArchiveOptions) -> ZipResult<Self> {
        let file = File::open(path)?;
        let metadata = file.metadata()?;
        if !metadata.is_file() {
            return Err(ZipError::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                "not a regular file",
            )));
        }
        if metadata.len() == 0 {
            return Err(ZipError::Io(io::Error::new(
                io::ErrorKind::InvalidData,
                "refusing to map a zero-length file",
            )));
        }
        // SAFETY: the mapping is read-only and we assume nobody truncates
        // the archive underneath us while it's open.
        let mapping = unsafe { Mmap::map(&file)? };
        Self::with_backing(Backing::Mapped(mapping), options)
    }

    /// Reads an archive already sitting in a buffer.
    /// Handy for smaller files, or bytes that arrived over the network.
    pub fn from_bytes(bytes: Vec<u8>) -> ZipResult<Self> {
        Self::from_bytes_with(bytes, ArchiveOptions::default())
    }

    /// Like [`ZipArchive::from_bytes`], with explicit options.
    pub fn from_bytes_with(bytes: Vec<u8>, options: ArchiveOptions) -> ZipResult<Self> {
        Self::with_backing(Backing::Bytes(bytes), options)
    }

    fn with_backing(backing: Backing, options: ArchiveOptions) -> ZipResult<Self> {
        let (entries, by_name) = scan_directory(backing.bytes())?;
        Ok(Self {
            backing,
            entries,
            by_name,
            options,
        })
    }

    /// Returns the entries found in the archive's central directory,
    /// in central-directory order.
    ///
    /// No effort is made to deduplicate these; for name lookups with a fixed
    /// duplicate policy, see [`ZipArchive::entry`].
    pub fn entries(&self) -> &[ArchiveEntry] {
        &self.entries
    }

    /// Returns the names of all entries, in central-directory order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|entry| entry.name.as_str())
    }

    /// Looks an entry up by name.
    ///
    /// The format permits duplicate names; the last occurrence wins.
    pub fn entry(&self, name: &str) -> Option<&ArchiveEntry> {
        self.by_name.get(name).map(|&index| &self.entries[index])
    }

    /// Returns true if the archive has an entry with the given name.
    pub fn contains(&self, name: &str) -> bool {
        self.by_name.contains_key(name)
    }

    /// Decompresses the named entry into an owned buffer.
    ///
    /// The stored CRC-32 is *not* checked; see [`ZipArchive::read_checked`].
    pub fn read(&self, name: &str) -> ZipResult<Vec<u8>> {
        self.extract(self.lookup(name)?, false)
    }

    /// Like [`ZipArchive::read`], and verifies the decompressed bytes
    /// against the entry's stored CRC-32.
    pub fn read_checked(&self, name: &str) -> ZipResult<Vec<u8>> {
        self.extract(self.lookup(name)?, true)
    }

    /// Decompresses the given entry into an owned buffer.
    ///
    /// Since each file in a ZIP archive is compressed independently
    /// and the mapping is immutable, any number of entries can be read
    /// in parallel.
    pub fn read_entry(&self, entry: &ArchiveEntry) -> ZipResult<Vec<u8>> {
        self.extract(entry, false)
    }

    /// Like [`ZipArchive::read_entry`], and verifies the decompressed bytes
    /// against the entry's stored CRC-32.
    pub fn read_entry_checked(&self, entry: &ArchiveEntry) -> ZipResult<Vec<u8>> {
        self.extract(entry, true)
    }

    fn lookup(&self, name: &str) -> ZipResult<&ArchiveEntry> {
        self.entry(name)
            .ok_or_else(|| ZipError::NameNotFound(name.to_owned()))
    }

    fn extract(&self, entry: &ArchiveEntry, verify_checksum: bool) -> ZipResult<Vec<u8>> {
        let mapping = self.backing.bytes();
        // Offsets were validated at scan time, but the caller could hand us
        // an entry from some other archive. Stay bounds-checked.
        let mut file_slice = mapping.get(entry.header_offset..).ok_or(
            ZipError::MalformedHeader("local header offset points past the end of the file"),
        )?;
        let local_header = spec::LocalFileHeader::parse_and_consume(&mut file_slice)?;
        trace!("{:?}", local_header);
        debug!("reading {}", entry.name);

        if self.options.check_local_headers {
            check_local_header(entry, &local_header)?;
        }

        if entry.is_encrypted() {
            return Err(ZipError::UnsupportedArchive(format!(
                "can't read encrypted entry {}",
                entry.name
            )));
        }

        // `parse_and_consume` left `file_slice` at the payload. The local
        // header's own size fields may be zeros (data descriptor) or
        // saturated (zip64); the central directory value is authoritative.
        let compressed = file_slice.get(..entry.compressed_size).ok_or(
            ZipError::MalformedHeader("compressed data runs past the end of the file"),
        )?;

        let bytes = match entry.compression_method {
            CompressionMethod::Stored => compressed.to_vec(),
            CompressionMethod::Deflate => inflate(compressed, entry.size)?,
            CompressionMethod::Unsupported(method) => {
                return Err(ZipError::UnsupportedCompressionMethod(method))
            }
        };

        if verify_checksum {
            let mut hasher = crc32fast::Hasher::new();
            hasher.update(&bytes);
            let actual = hasher.finalize();
            if actual != entry.crc32 {
                return Err(ZipError::ChecksumMismatch {
                    expected: entry.crc32,
                    actual,
                });
            }
        }

        Ok(bytes)
    }
}

/// Scans the central directory of a mapped archive into an ordered entry
/// list and a name-lookup table. Runs once, at open; nothing here is
/// touched again except through `&` references.
fn scan_directory(
    mapping: &[u8],
) -> ZipResult<(Vec<ArchiveEntry>, HashMap<String, usize>)> {
    let eocdr_posit = spec::find_eocdr(mapping)?;
    let eocdr = spec::EndOfCentralDirectory::parse(&mapping[eocdr_posit..])?;
    trace!("{:?}", eocdr);

    if eocdr.disk_number != eocdr.disk_with_central_directory {
        return Err(ZipError::UnsupportedArchive(format!(
            "no support for multi-disk archives: disk ({}) != disk with central directory ({})",
            eocdr.disk_number, eocdr.disk_with_central_directory
        )));
    }
    if eocdr.entries != eocdr.entries_on_this_disk {
        return Err(ZipError::UnsupportedArchive(format!(
            "no support for multi-disk archives: entries ({}) != entries this disk ({})",
            eocdr.entries, eocdr.entries_on_this_disk
        )));
    }

    let nominal_central_directory_offset: usize;
    let central_directory_size: usize;
    let entry_count: u64;

    // ZIP files can be prepended by arbitrary junk (think self-extracting
    // archives), so all the stored positions might be off by some base.
    let base_offset;

    // A zip64 archive has a locator for its bigger EOCDR
    // right before the classic one.
    let zip64_locator = eocdr_posit
        .checked_sub(spec::Zip64EndOfCentralDirectoryLocator::size_in_file())
        .and_then(|posit| spec::Zip64EndOfCentralDirectoryLocator::parse(&mapping[posit..]));

    if let Some(zip64_locator) = zip64_locator {
        trace!("{:?}", zip64_locator);

        if u32::from(eocdr.disk_number) != zip64_locator.disk_with_central_directory {
            return Err(ZipError::UnsupportedArchive(format!(
                "no support for multi-disk archives: disk ({}) != disk with zip64 central directory ({})",
                eocdr.disk_number, zip64_locator.disk_with_central_directory
            )));
        }
        if zip64_locator.disks != 1 {
            return Err(ZipError::UnsupportedArchive(format!(
                "no support for multi-disk archives: zip64 EOCDR locator reports {} disks",
                zip64_locator.disks
            )));
        }

        // Search for the zip64 EOCDR from its nominal position to the end
        // of where it could be. Finding it past the nominal position tells
        // us how much junk precedes the archive.
        let search_start = usize(zip64_locator.zip64_eocdr_offset)?;
        let search_end =
            eocdr_posit - spec::Zip64EndOfCentralDirectoryLocator::size_in_file();
        let search_space = mapping.get(search_start..search_end).ok_or(
            ZipError::MalformedHeader("zip64 End Of Central Directory Record offset out of bounds"),
        )?;
        let zip64_eocdr_posit = spec::find_zip64_eocdr(search_space)?;
        base_offset = zip64_eocdr_posit;
        let zip64_eocdr =
            spec::Zip64EndOfCentralDirectory::parse(&search_space[zip64_eocdr_posit..])?;
        trace!("{:?}", zip64_eocdr);

        nominal_central_directory_offset = usize(zip64_eocdr.central_directory_offset)?;
        central_directory_size = usize(zip64_eocdr.central_directory_size)?;
        entry_count = zip64_eocdr.entries;
    } else {
        // The base is the directory's actual position versus its stored one.
        let actual_cdr_posit = eocdr_posit.checked_sub(usize(eocdr.central_directory_size)?);
        let nominal_offset = usize(eocdr.central_directory_offset)?;
        base_offset = actual_cdr_posit
            .and_then(|posit| posit.checked_sub(nominal_offset))
            .ok_or(ZipError::MalformedHeader(
                "central directory size or offset doesn't fit the file",
            ))?;
        nominal_central_directory_offset = nominal_offset;
        central_directory_size = usize(eocdr.central_directory_size)?;
        entry_count = u64::from(eocdr.entries);
    }

    trace!(
        "{} entries at nominal offset {}",
        entry_count,
        nominal_central_directory_offset
    );

    let directory_start = base_offset
        .checked_add(nominal_central_directory_offset)
        .ok_or(ZipError::TruncatedDirectory(
            "directory extends past the end of the file",
        ))?;
    let mut central_directory = directory_start
        .checked_add(central_directory_size)
        .and_then(|directory_end| mapping.get(directory_start..directory_end))
        .ok_or(ZipError::TruncatedDirectory(
            "directory extends past the end of the file",
        ))?;

    let mut entries = Vec::with_capacity(usize(entry_count)?);
    let mut by_name = HashMap::with_capacity(usize(entry_count)?);

    for _ in 0..entry_count {
        let dir_entry = spec::CentralDirectoryEntry::parse_and_consume(&mut central_directory)?;
        trace!("{:?}", dir_entry);

        let entry = ArchiveEntry::from_cde(&dir_entry, base_offset, mapping.len())?;
        debug!("{:?}", entry);
        by_name.insert(entry.name.clone(), entries.len());
        entries.push(entry);
    }

    Ok((entries, by_name))
}

/// Strict-mode comparison of a local file header against the central
/// directory record we already trusted.
fn check_local_header(
    entry: &ArchiveEntry,
    local_header: &spec::LocalFileHeader,
) -> ZipResult<()> {
    if CompressionMethod::from_u16(local_header.compression_method) != entry.compression_method {
        return Err(ZipError::MalformedHeader(
            "local file header compression method disagrees with the central directory",
        ));
    }
    // With a data descriptor the local sizes and CRC are zeros; nothing to
    // compare. A saturated 32-bit size means "see the zip64 extra field",
    // which the central directory already resolved for us.
    if spec::has_data_descriptor(local_header.flags) {
        return Ok(());
    }
    let local_compressed = usize(local_header.compressed_size)?;
    let local_size = usize(local_header.uncompressed_size)?;
    let saturated = u32::MAX as usize;
    if (local_compressed != saturated && local_compressed != entry.compressed_size)
        || (local_size != saturated && local_size != entry.size)
        || local_header.crc32 != entry.crc32
    {
        return Err(ZipError::MalformedHeader(
            "local file header disagrees with the central directory",
        ));
    }
    Ok(())
}

/// Inflates a raw DEFLATE stream (no zlib or gzip framing) whose
/// decompressed size we know from the central directory.
///
/// Decoder state and the output buffer live and die with this call,
/// which is what makes concurrent reads contention-free.
fn inflate(compressed: &[u8], expected_size: usize) -> ZipResult<Vec<u8>> {
    let mut bytes = Vec::with_capacity(expected_size);
    let mut decoder = DeflateDecoder::new(compressed);
    decoder
        .read_to_end(&mut bytes)
        .map_err(ZipError::Decompression)?;
    if bytes.len() != expected_size {
        return Err(ZipError::Decompression(io::Error::new(
            io::ErrorKind::InvalidData,
            format!(
                "expected {} decompressed bytes, got {}",
                expected_size,
                bytes.len()
            ),
        )));
    }
    Ok(bytes)
}
