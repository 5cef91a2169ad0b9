//! Partition table engine for MS-DOS (MBR) and GPT disk labels.
//!
//! The crate reads a disk label through a [`BlockDevice`], flattens it into a list of
//! [`RawSlice`]s and lets a [`PartitionTable`] edit it as an ordered sequence of used,
//! reserved and empty [`Slice`]s covering the whole disk, before serializing it back.
#![no_std]

#[macro_use]
extern crate static_assertions;

extern crate alloc;

#[cfg(feature = "std")]
extern crate std;

/// Generates getters (and optionally setters) for fields of `repr(packed)` on-disk structures.
///
/// Fields are always copied in and out by value, so no reference to an unaligned field is
/// ever created.
macro_rules! packed_field_accessors {
    ($field:ident, $type:ty) => {
        #[must_use]
        pub fn $field(&self) -> $type {
            self.$field
        }
    };
    ($field:ident, $field_setter:ident, $type:ty) => {
        #[must_use]
        pub fn $field(&self) -> $type {
            self.$field
        }

        pub fn $field_setter(&mut self, value: $type) {
            self.$field = value;
        }
    };
}

pub(crate) use packed_field_accessors;

pub mod error;
pub mod geometry;
pub mod gpt;
pub mod io;
pub mod label;
pub mod mbr;
pub mod slice;
pub mod table;

pub use error::{Error, IoError, Result};
pub use geometry::{Chs, DiskGeometry, Rounding};
pub use gpt::{GptHeader, GptPartition};
pub use io::{copy_sectors, BlockDevice, MemoryDisk};
pub use label::{
    Capabilities, ChecksumPolicy, CreateKind, DiskLabel, Integrity, LabelTable, LabelType,
    ReadOptions, UsableBounds,
};
pub use mbr::{Mbr, MbrPartition, MbrPartitionType};
pub use slice::{
    Extent, FilesystemProbe, FsInfo, RawSlice, Slice, SliceFlags, SliceKind, SliceType, UsedSlice,
};
pub use table::{Clipboard, PartitionTable, ResizeDirection, SliceMove, TableOptions};

#[cfg(feature = "std")]
pub use io::StdDisk;
