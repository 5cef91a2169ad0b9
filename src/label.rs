//! Disk label detection and dispatch to the MS-DOS and GPT codecs.

use alloc::vec::Vec;
use core::fmt;

use bitflags::bitflags;

use crate::{
    error::{Error, Result},
    gpt,
    io::BlockDevice,
    mbr,
    slice::{RawSlice, Slice, SliceType},
};

/// The partitioning scheme of a disk.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LabelType {
    MsDos,
    Gpt,
}

impl fmt::Display for LabelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MsDos => f.write_str("MS-DOS"),
            Self::Gpt => f.write_str("GPT"),
        }
    }
}

bitflags! {
    /// Features a label supports.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct Capabilities: u8 {
        /// Partition types are one-byte tags.
        const USES_TAGS = 0x01;
        /// Partition types are GUIDs.
        const USES_GUIDS = 0x02;
        /// Partitions may be logical, inside an extended partition.
        const LOGICAL = 0x04;
        /// One partition may be flagged bootable.
        const ACTIVE = 0x08;
        /// Some partition types can be hidden.
        const HIDE = 0x10;
    }
}

/// What may be created in an empty slice.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CreateKind {
    None,
    Primary,
    Logical,
    Any,
}

impl CreateKind {
    #[must_use]
    pub fn from_permissions(primary: bool, logical: bool) -> Self {
        match (primary, logical) {
            (true, true) => Self::Any,
            (true, false) => Self::Primary,
            (false, true) => Self::Logical,
            (false, false) => Self::None,
        }
    }

    #[must_use]
    pub fn allows_primary(self) -> bool {
        matches!(self, Self::Primary | Self::Any)
    }

    #[must_use]
    pub fn allows_logical(self) -> bool {
        matches!(self, Self::Logical | Self::Any)
    }
}

/// What to do when a GPT checksum does not match.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ChecksumPolicy {
    /// Refuse to read the table.
    Strict,

    /// Log a warning and use the primary table anyway.
    Warn,

    /// Use the backup table when the primary one is damaged.
    #[default]
    Fallback,
}

/// Options applied when reading a label.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ReadOptions {
    pub checksum_policy: ChecksumPolicy,
}

/// How trustworthy the table that was read is.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Integrity {
    Verified,

    /// A checksum did not match and [`ChecksumPolicy::Warn`] was in effect.
    ChecksumIgnored,

    /// The primary GPT was damaged, the backup copy was used.
    RecoveredFromBackup,
}

/// Range of sectors partitions may occupy, both ends included.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct UsableBounds {
    pub first_usable_sector: u64,
    pub last_usable_sector: u64,
}

impl UsableBounds {
    #[must_use]
    pub fn contains(&self, start_sector: u64, num_sectors: u64) -> bool {
        num_sectors != 0
            && start_sector >= self.first_usable_sector
            && start_sector <= self.last_usable_sector
            && num_sectors - 1 <= self.last_usable_sector - start_sector
    }
}

/// The content of a label, as read from the disk.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LabelTable {
    /// Entries in on-disk order. MS-DOS tables keep unused primary entries as placeholders
    /// (`tag == 0`) so that the remaining entries keep their slot number.
    pub slices: Vec<RawSlice>,
    pub bounds: UsableBounds,
    pub integrity: Integrity,
}

/// A label codec.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DiskLabel {
    MsDos,
    Gpt,
}

impl DiskLabel {
    #[must_use]
    pub fn new(label_type: LabelType) -> Self {
        match label_type {
            LabelType::MsDos => Self::MsDos,
            LabelType::Gpt => Self::Gpt,
        }
    }

    /// Finds the label of a disk.
    ///
    /// A GPT disk also carries a valid MS-DOS signature (its protective MBR), so GPT is
    /// checked first. Fails only on I/O errors.
    pub fn detect<D: BlockDevice + ?Sized>(device: &mut D) -> Result<Option<Self>> {
        if gpt::probe(device)? {
            Ok(Some(Self::Gpt))
        } else if mbr::probe(device)? {
            Ok(Some(Self::MsDos))
        } else {
            Ok(None)
        }
    }

    #[must_use]
    pub fn label_type(self) -> LabelType {
        match self {
            Self::MsDos => LabelType::MsDos,
            Self::Gpt => LabelType::Gpt,
        }
    }

    #[must_use]
    pub fn capabilities(self) -> Capabilities {
        match self {
            Self::MsDos => {
                Capabilities::USES_TAGS
                    | Capabilities::LOGICAL
                    | Capabilities::ACTIVE
                    | Capabilities::HIDE
            }
            Self::Gpt => Capabilities::USES_GUIDS,
        }
    }

    /// Whether the disk holds a label of this type.
    pub fn probe<D: BlockDevice + ?Sized>(self, device: &mut D) -> Result<bool> {
        match self {
            Self::MsDos => Ok(mbr::probe(device)? && !gpt::probe(device)?),
            Self::Gpt => gpt::probe(device),
        }
    }

    /// Writes a new, empty label on the disk.
    pub fn create<D: BlockDevice + ?Sized>(self, device: &mut D) -> Result<()> {
        match self {
            Self::MsDos => mbr::create(device),
            Self::Gpt => gpt::create(device),
        }
    }

    pub fn read_table<D: BlockDevice + ?Sized>(
        self,
        device: &mut D,
        options: &ReadOptions,
    ) -> Result<LabelTable> {
        match self {
            Self::MsDos => mbr::read_table(device),
            Self::Gpt => gpt::read_table(device, options),
        }
    }

    /// Serializes the used entries of `slices`.
    pub fn write_table<D: BlockDevice + ?Sized>(
        self,
        device: &mut D,
        slices: &[RawSlice],
    ) -> Result<()> {
        match self {
            Self::MsDos => mbr::write_table(device, slices),
            Self::Gpt => gpt::write_table(device, slices),
        }
    }

    /// Number of entries in the primary table.
    #[must_use]
    pub fn max_entries(self) -> u32 {
        match self {
            Self::MsDos => mbr::PRIMARY_ENTRIES as u32,
            Self::Gpt => gpt::GPT_ENTRY_COUNT,
        }
    }

    #[must_use]
    pub fn is_used(self, slice: &RawSlice) -> bool {
        match self {
            Self::MsDos => slice.tag != 0 && slice.num_sectors != 0,
            Self::Gpt => !slice.type_guid.is_nil(),
        }
    }

    #[must_use]
    pub fn slice_type(self, slice: &RawSlice) -> SliceType {
        match self {
            Self::MsDos => SliceType::Tag(slice.tag),
            Self::Gpt => SliceType::Guid(slice.type_guid),
        }
    }

    #[must_use]
    pub fn slice_type_description(self, slice: &RawSlice) -> &'static str {
        match self {
            Self::MsDos => mbr::type_description(slice.tag),
            Self::Gpt => gpt::type_description(&slice.type_guid),
        }
    }

    /// Types that can be given to a partition, with their names.
    #[must_use]
    pub fn type_catalog(self) -> Vec<(SliceType, &'static str)> {
        match self {
            Self::MsDos => mbr::type_catalog(),
            Self::Gpt => gpt::type_catalog(),
        }
    }

    #[must_use]
    pub fn default_slice_type(self) -> SliceType {
        match self {
            Self::MsDos => SliceType::Tag(mbr::DEFAULT_TAG),
            Self::Gpt => SliceType::Guid(gpt::LINUX_FILESYSTEM),
        }
    }

    /// Changes the type of `slice`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LabelMismatch`] for a tag on a GPT disk or a GUID on an MS-DOS one,
    /// and [`Error::InvalidPlacement`] for the types reserved to the label itself.
    pub fn set_slice_type(self, slice: &mut RawSlice, slice_type: SliceType) -> Result<()> {
        match (self, slice_type) {
            (Self::MsDos, SliceType::Tag(tag)) => {
                if tag == 0 || mbr::is_extended_tag(tag) {
                    return Err(Error::InvalidPlacement(
                        "empty and extended types are managed by the label",
                    ));
                }

                slice.tag = tag;
            }
            (Self::Gpt, SliceType::Guid(guid)) => {
                if guid.is_nil() {
                    return Err(Error::InvalidPlacement("the nil GUID marks unused entries"));
                }

                slice.type_guid = guid;
            }
            (Self::MsDos, SliceType::Guid(_)) => {
                return Err(Error::LabelMismatch("MS-DOS partitions are typed with tags"))
            }
            (Self::Gpt, SliceType::Tag(_)) => {
                return Err(Error::LabelMismatch("GPT partitions are typed with GUIDs"))
            }
        }

        Ok(())
    }

    /// Translates the type of a partition coming from a `source` label into this one.
    ///
    /// Types without an equivalent become [`DiskLabel::default_slice_type`].
    #[must_use]
    pub fn convert_type(self, slice: &RawSlice, source: LabelType) -> SliceType {
        match (source, self) {
            (LabelType::MsDos, Self::MsDos) => SliceType::Tag(slice.tag),
            (LabelType::Gpt, Self::Gpt) => SliceType::Guid(slice.type_guid),
            (LabelType::MsDos, Self::Gpt) => SliceType::Guid(
                gpt::guid_for_tag(slice.tag).unwrap_or(gpt::LINUX_FILESYSTEM),
            ),
            (LabelType::Gpt, Self::MsDos) => SliceType::Tag(
                gpt::tag_for_guid(&slice.type_guid).unwrap_or(mbr::DEFAULT_TAG),
            ),
        }
    }

    /// Decides what may be created in the empty slice at `index`.
    #[must_use]
    pub fn can_create_slice(self, slices: &[Slice], index: usize) -> CreateKind {
        match self {
            Self::MsDos => mbr::can_create_slice(slices, index),
            Self::Gpt => gpt::can_create_slice(slices, index),
        }
    }

    #[must_use]
    pub fn can_hide(self, slice: &RawSlice) -> bool {
        match self {
            Self::MsDos => mbr::can_hide(slice.tag),
            Self::Gpt => false,
        }
    }

    /// Hides a visible partition or reveals a hidden one.
    pub fn hide(self, slice: &mut RawSlice) -> Result<()> {
        match self {
            Self::MsDos => {
                slice.tag = mbr::toggle_hidden(slice.tag)
                    .ok_or(Error::InvalidPlacement("this partition type cannot be hidden"))?;

                Ok(())
            }
            Self::Gpt => Err(Error::Unsupported(LabelType::Gpt)),
        }
    }
}
