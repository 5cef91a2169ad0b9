//! Slices: the label-independent view of a disk's sector ranges.

use alloc::string::String;

use bitflags::bitflags;
use uuid::Uuid;

/// Whether a partition lives in the primary table or in the MS-DOS extended chain.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SliceKind {
    #[default]
    Primary,
    Logical,
}

bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct SliceFlags: u8 {
        /// MS-DOS _active_ (bootable) partition.
        const BOOTABLE = 0x01;
    }
}

/// Identifies what a partition contains: an MS-DOS tag or a GPT type GUID.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SliceType {
    Tag(u8),
    Guid(Uuid),
}

/// One partition table entry, as read from or written to the disk.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RawSlice {
    /// Position of the entry in the on-disk table.
    pub order: u32,
    pub kind: SliceKind,
    pub flags: SliceFlags,

    /// MS-DOS partition type. Zero marks an unused entry.
    pub tag: u8,

    /// GPT partition type. The nil GUID marks an unused entry.
    pub type_guid: Uuid,

    /// GPT unique partition GUID, nil until the partition is first written.
    pub part_guid: Uuid,

    /// GPT attribute bits.
    pub attributes: u64,

    pub start_sector: u64,
    pub num_sectors: u64,

    /// GPT partition name.
    pub name: String,
}

impl RawSlice {
    /// First sector past the end of this slice.
    #[must_use]
    pub fn end_sector(&self) -> u64 {
        self.start_sector.saturating_add(self.num_sectors)
    }

    #[must_use]
    pub fn is_bootable(&self) -> bool {
        self.flags.contains(SliceFlags::BOOTABLE)
    }

    #[must_use]
    pub fn is_logical(&self) -> bool {
        self.kind == SliceKind::Logical
    }
}

/// A contiguous range of sectors.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Extent {
    pub start_sector: u64,
    pub num_sectors: u64,
}

impl Extent {
    #[must_use]
    pub fn new(start_sector: u64, num_sectors: u64) -> Self {
        Self {
            start_sector,
            num_sectors,
        }
    }

    #[must_use]
    pub fn end_sector(&self) -> u64 {
        self.start_sector.saturating_add(self.num_sectors)
    }

    #[must_use]
    pub fn contains(&self, other: &Extent) -> bool {
        other.start_sector >= self.start_sector && other.end_sector() <= self.end_sector()
    }
}

/// A partition as presented by a [`PartitionTable`](crate::PartitionTable).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UsedSlice {
    pub raw: RawSlice,

    /// Name of the partition's device, the disk name followed by a letter (`hd0a`).
    pub device_name: String,

    /// Filesystem found by the [`FilesystemProbe`], `"unknown"` otherwise.
    pub fs_type: String,

    pub description: String,

    /// Sectors in front of the partition that belong to it in the slice list: the MS-DOS
    /// chain sector of a logical partition and the alignment gap before it.
    pub(crate) lead_sectors: u64,
}

impl UsedSlice {
    /// Sectors covered by this slice in the slice list.
    #[must_use]
    pub fn extent(&self) -> Extent {
        Extent::new(
            self.raw.start_sector - self.lead_sectors,
            self.raw.num_sectors + self.lead_sectors,
        )
    }

    #[must_use]
    pub fn lead_sectors(&self) -> u64 {
        self.lead_sectors
    }
}

/// One element of the ordered, gap-free slice list.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Slice {
    /// A partition.
    Used(UsedSlice),

    /// Space outside of the label's usable range.
    Reserved(Extent),

    /// Free space.
    Empty(Extent),
}

impl Slice {
    #[must_use]
    pub fn extent(&self) -> Extent {
        match self {
            Self::Used(used) => used.extent(),
            Self::Reserved(extent) | Self::Empty(extent) => *extent,
        }
    }

    #[must_use]
    pub fn as_used(&self) -> Option<&UsedSlice> {
        match self {
            Self::Used(used) => Some(used),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_empty(&self) -> Option<Extent> {
        match self {
            Self::Empty(extent) => Some(*extent),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_used(&self) -> bool {
        matches!(self, Self::Used(_))
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        matches!(self, Self::Empty(_))
    }

    #[must_use]
    pub fn is_reserved(&self) -> bool {
        matches!(self, Self::Reserved(_))
    }

    /// `true` for a used logical partition.
    #[must_use]
    pub fn is_logical(&self) -> bool {
        self.as_used().is_some_and(|used| used.raw.is_logical())
    }
}

/// What a [`FilesystemProbe`] knows about the content of a partition.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FsInfo {
    pub fs_type: String,
    pub supports_resize: bool,

    /// Smallest and largest size, in sectors, the filesystem can be resized to.
    pub resize_bounds: Option<(u64, u64)>,
}

/// Identifies the filesystem inside a partition. Implemented outside of this crate.
pub trait FilesystemProbe {
    fn probe(&self, device_name: &str, slice: &RawSlice) -> Option<FsInfo>;
}
