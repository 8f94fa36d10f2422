//! Error types for the vhdxtool core library.

use std::path::PathBuf;

/// The main error type for VHDX operations.
///
/// Variants fall into two groups. Data problems (`Io`, `Format`, `Corrupt`,
/// `UnsupportedLayout`) describe the file being opened. Misuse errors
/// (`Misaligned`, `InvalidArgument`, `ReadOnly`, `OutOfRange`) describe a call
/// that violated a precondition; see [`Error::is_misuse`].
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// I/O error with optional path context.
    #[error("I/O error{}: {source}", path.as_ref().map(|p| format!(" at '{}'", p.display())).unwrap_or_default())]
    Io {
        source: std::io::Error,
        path: Option<PathBuf>,
    },

    /// Bad signature, bad checksum or unrecognised required structure.
    #[error("VHDX format error: {message}")]
    Format { message: String },

    /// The file is structurally recognisable but its content is inconsistent.
    #[error("VHDX corrupt: {message}")]
    Corrupt { message: String },

    /// A valid layout this engine does not handle.
    #[error("unsupported VHDX layout: {message}")]
    UnsupportedLayout { message: String },

    /// Content I/O not aligned to the logical sector size.
    #[error("unaligned access: offset {offset} length {length} (sector size {sector_size})")]
    Misaligned {
        offset: u64,
        length: u64,
        sector_size: u32,
    },

    /// An argument outside the accepted domain.
    #[error("invalid argument: {message}")]
    InvalidArgument { message: String },

    /// Write attempted on a disk opened read-only.
    #[error("attempt to write to read-only VHDX")]
    ReadOnly,

    /// Access beyond the end of the virtual disk.
    #[error("out of range: offset {offset} length {length} (capacity {capacity})")]
    OutOfRange {
        offset: u64,
        length: u64,
        capacity: u64,
    },
}

/// A specialized Result type for VHDX operations.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create an I/O error with path context.
    pub fn io(source: std::io::Error, path: impl Into<PathBuf>) -> Self {
        Self::Io {
            source,
            path: Some(path.into()),
        }
    }

    /// Create an I/O error without path context.
    pub fn io_simple(source: std::io::Error) -> Self {
        Self::Io { source, path: None }
    }

    /// Create a format error.
    pub fn format(message: impl Into<String>) -> Self {
        Self::Format {
            message: message.into(),
        }
    }

    /// Create a corruption error.
    pub fn corrupt(message: impl Into<String>) -> Self {
        Self::Corrupt {
            message: message.into(),
        }
    }

    /// Create an unsupported-layout error.
    pub fn unsupported(message: impl Into<String>) -> Self {
        Self::UnsupportedLayout {
            message: message.into(),
        }
    }

    /// Create an invalid-argument error.
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    /// Returns true when the error reports a caller mistake rather than bad data.
    pub fn is_misuse(&self) -> bool {
        matches!(
            self,
            Self::Misaligned { .. }
                | Self::InvalidArgument { .. }
                | Self::ReadOnly
                | Self::OutOfRange { .. }
        )
    }
}

impl From<std::io::Error> for Error {
    fn from(source: std::io::Error) -> Self {
        Self::io_simple(source)
    }
}
