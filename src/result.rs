//! Error types and the related `Result<T>`

use thiserror::Error;

pub type ZipResult<T> = Result<T, ZipError>;

#[derive(Debug, Error)]
pub enum ZipError {
    /// Opening, inspecting, or mapping the archive file failed
    #[error("I/O error")]
    Io(#[from] std::io::Error),

    /// No End of central directory record within the last 64 KB + 22 bytes
    /// of the file. It's truncated, or it isn't a ZIP archive at all.
    #[error("couldn't find the End Of Central Directory Record")]
    EndRecordNotFound,

    /// The central directory ran past its declared length
    /// or past the end of the mapping.
    #[error("truncated central directory: {0}")]
    TruncatedDirectory(&'static str),

    /// A record's signature or fixed-size layout didn't check out.
    #[error("malformed archive: {0}")]
    MalformedHeader(&'static str),

    /// The archive uses a feature we don't support
    /// (multi-disk archives, encrypted entries, ...)
    #[error("unsupported archive: {0}")]
    UnsupportedArchive(String),

    /// Decoding a file name marked as UTF-8 failed
    #[error("invalid UTF-8")]
    Encoding(#[from] std::str::Utf8Error),

    /// No entry in the archive has the given name
    #[error("no entry in the archive named {0}")]
    NameNotFound(String),

    /// The entry is compressed with something other than "stored"
    /// or DEFLATE. (The u16 is the method code.)
    #[error("unsupported compression method {0}")]
    UnsupportedCompressionMethod(u16),

    /// The compressed stream was corrupt or truncated
    #[error("decompression failed")]
    Decompression(#[source] std::io::Error),

    /// Checksum verification was requested and the decompressed bytes
    /// don't hash to the CRC-32 stored in the central directory.
    #[error("CRC-32 mismatch: expected {expected:08x}, computed {actual:08x}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    /// A cast from a 64-bit int to a usize failed while mapping the file,
    /// probably on a 32-bit system.
    #[error("Zip archive too large for address space")]
    InsufficientAddressSpace,
}
