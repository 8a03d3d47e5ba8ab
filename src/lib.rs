//! parzip reads ZIP archives through a memory mapping so that any number
//! of threads can decompress entries at once:
//!
//! ```no_run
//! # use parzip::ZipArchive;
//! let archive = ZipArchive::open("foo.zip")?;
//!
//! for entry in archive.entries() {
//!     println!("{} ({} bytes)", entry.name, entry.size);
//! }
//!
//! let bytes = archive.read("some/file.txt")?;
//! # Ok::<(), parzip::ZipError>(())
//! ```
//!
//! ZIP is an interesting archive format: unlike compressed tarballs often
//! seen in Linux land (`*.tar.gz`, `*.tar.zst`, ...), each file in a ZIP
//! archive is compressed independently, with a central directory telling us
//! where to find each one. Memory-mapping the archive then lets every
//! thread slice and inflate its own entry with nothing shared but
//! read-only memory; there's not a lock anywhere on the path.
//!
//! ```no_run
//! # use rayon::prelude::*;
//! # use parzip::ZipArchive;
//! let archive = ZipArchive::open("foo.zip")?;
//!
//! archive
//!     .entries()
//!     .par_iter()
//!     .filter(|entry| entry.is_file())
//!     .try_for_each(|entry| {
//!         let bytes = archive.read_entry(entry)?;
//!         std::fs::write(&entry.name, bytes)?;
//!         Ok::<(), anyhow::Error>(())
//!     })?;
//! # Ok::<(), anyhow::Error>(())
//! ```
//!
//! The directory is scanned once at open time; after that the archive is
//! immutable, so reads need no synchronization and can't observe a
//! half-built index. Checksum verification is opt-in (`read_checked`)
//! so callers that don't need it don't pay for it.

pub mod read;
pub mod result;

pub use read::{ArchiveEntry, ArchiveOptions, CompressionMethod, ZipArchive};
pub use result::{ZipError, ZipResult};

mod arch;
mod spec;
