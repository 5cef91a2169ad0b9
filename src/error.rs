//! Error types shared by the codecs and the slice manager.

use core::fmt;

use crate::label::LabelType;

/// Failure reported by a [`BlockDevice`](crate::BlockDevice).
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum IoError {
    /// The device could not read the sector range starting at this LBA.
    #[error("device failed to read sector {0}")]
    Read(u64),

    /// The device could not write the sector range starting at this LBA.
    #[error("device failed to write sector {0}")]
    Write(u64),

    /// The requested range lies past the end of the device.
    #[error("sectors {lba}..+{count} are beyond the end of the device")]
    OutOfRange { lba: u64, count: u32 },

    /// The caller's buffer does not hold exactly the requested number of sectors.
    #[error("buffer of {0} bytes does not match the requested sector count")]
    BufferSize(usize),
}

/// On-disk region protected by a checksum.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChecksumRegion {
    GptHeader,
    GptEntries,
}

impl fmt::Display for ChecksumRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::GptHeader => f.write_str("GPT header"),
            Self::GptEntries => f.write_str("GPT partition entries"),
        }
    }
}

/// Error type for every operation of this crate.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] IoError),

    /// A signature is missing or a structure is malformed.
    #[error("invalid {label} table: {reason}")]
    InvalidTable {
        label: LabelType,
        reason: &'static str,
    },

    #[error("{region} checksum mismatch: computed {computed:#010x}, stored {stored:#010x}")]
    ChecksumMismatch {
        region: ChecksumRegion,
        computed: u32,
        stored: u32,
    },

    /// Neither an MS-DOS nor a GPT label was found on the disk.
    #[error("no known disk label found")]
    UnknownLabel,

    #[error("not enough space: {requested} sectors requested, {available} available")]
    NoSpace { requested: u64, available: u64 },

    #[error("invalid placement: {0}")]
    InvalidPlacement(&'static str),

    #[error("sectors {start}..+{num_sectors} would overlap another slice")]
    WouldOverlap { start: u64, num_sectors: u64 },

    #[error("label mismatch: {0}")]
    LabelMismatch(&'static str),

    #[error("sector {lba} is outside of the disk ({num_sectors} sectors)")]
    OutOfBounds { lba: u64, num_sectors: u64 },

    /// Part of the table reached the disk before the failure; the disk may be inconsistent.
    #[error("partial write, {committed} already written: {source}")]
    PartialWrite {
        committed: &'static str,
        source: IoError,
    },

    #[error("no suitable slice at index {0}")]
    NoSuchSlice(usize),

    #[error("operation not supported by {0} labels")]
    Unsupported(LabelType),

    #[error("partition table is full")]
    TableFull,
}

pub type Result<T> = core::result::Result<T, Error>;
