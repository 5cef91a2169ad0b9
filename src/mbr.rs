//! MBR (_Master Boot Record_) partion table handling
//!
//! Legacy structure used to store partition information on hard drives, stored on the first
//! logical block of the drive.
//!
//! The first sector holds up to four primary entries. One of them may be an _extended_
//! partition whose first sector holds another, smaller table: one logical partition and a
//! link to the next extended table, forming a chain. This module flattens that chain into
//! [`RawSlice`]s and rebuilds it on write.

use alloc::{vec, vec::Vec};

use zerocopy::{FromBytes, IntoBytes};
use zerocopy_derive::{FromBytes, Immutable, IntoBytes};

use crate::{
    error::{Error, Result},
    geometry::DiskGeometry,
    io::{read_vec, BlockDevice},
    label::{CreateKind, Integrity, LabelTable, LabelType, UsableBounds},
    packed_field_accessors,
    slice::{RawSlice, Slice, SliceFlags, SliceKind, SliceType},
};

/// Size of the *MBR* header, in bytes.
pub const MBR_BOOTSTRAP_SIZE: usize = 446;

/// Magic boot signature for the *MBR* header (little-endian format).
pub const MBR_MAGIC_LE: u16 = 0xaa55;

/// Tag used for the extended partitions written by this crate.
pub const TAG_EXTENDED_LBA: u8 = 0x0F;

/// Tag of the single partition of a GPT protective MBR.
pub const TAG_GPT_PROTECTIVE: u8 = 0xEE;

/// Tag given to partitions that have no better one.
pub const DEFAULT_TAG: u8 = 0x83;

pub(crate) const PRIMARY_ENTRIES: usize = 4;
const EXTENDED_ENTRIES: usize = 2;

/// Upper bound on the number of extended tables followed, so a looping chain terminates.
const MAX_CHAIN_LENGTH: usize = 128;

/// Tags that can be hidden by adding `0x10`.
const HIDEABLE_TAGS: [u8; 7] = [0x01, 0x04, 0x06, 0x07, 0x0B, 0x0C, 0x0E];

/// The Master Boot Record is the first sector of a storage device that
/// contains important metadata, including bootstrap code, a partition
/// table, and a boot signature.
///
/// The same layout is used by every table of the extended partition chain.
///
/// # Examples
///
/// ```
/// use disklabel::Mbr;
///
/// let mut buf = [0u8; 512];
///
/// Mbr::new().write(&mut buf).unwrap();
/// Mbr::parse_from_buf(&buf).unwrap();
/// ```
#[derive(Clone, Copy, Debug, FromBytes, IntoBytes, Immutable)]
#[repr(C, packed(1))]
pub struct Mbr {
    bootstrap: [u8; MBR_BOOTSTRAP_SIZE],

    /// Partition table for this `Mbr`.
    ///
    /// The partition table contains entries describing up to four primary partitions
    /// in the Master Boot Record (MBR).
    pub partitions: [MbrPartition; PRIMARY_ENTRIES],

    boot_sig: u16,
}

assert_eq_size!(Mbr, [u8; 0x200]);
assert_eq_align!(Mbr, u8);

impl Mbr {
    /// Creates a new, empty (but valid) MBR.
    #[must_use]
    pub fn new() -> Self {
        Self {
            bootstrap: [0u8; MBR_BOOTSTRAP_SIZE],
            partitions: [MbrPartition::default(); PRIMARY_ENTRIES],
            boot_sig: MBR_MAGIC_LE,
        }
    }

    /// Creates the protective MBR of a GPT disk: a single `0xEE` partition covering the
    /// whole disk (or as much of it as 32 bits can describe).
    pub fn protective(geometry: &DiskGeometry) -> Result<Self> {
        let mut mbr = Self::new();
        let num_sectors = (geometry.num_sectors - 1).min(u64::from(u32::MAX));

        mbr.partitions[0] =
            MbrPartition::for_extent(geometry, TAG_GPT_PROTECTIVE, false, 1, 1, num_sectors)?;

        Ok(mbr)
    }

    /// Reads the MBR from a raw bytes buffer.
    ///
    /// This creates a copy, and does not operate in-place.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidTable`] if the buffer is too short or the boot signature is
    /// missing.
    ///
    /// # Examples
    ///
    /// ```
    /// use disklabel::Mbr;
    ///
    /// let mut mbr_buf = [0u8; 0x200];
    /// mbr_buf[0x1FF] = 0xaa;
    /// mbr_buf[0x1FE] = 0x55;
    ///
    /// Mbr::parse_from_buf(&mbr_buf).unwrap();
    /// ```
    pub fn parse_from_buf(buf: &[u8]) -> Result<Self> {
        let (mbr, _) = Mbr::read_from_prefix(buf).map_err(|_| invalid("sector is too small"))?;

        mbr.check_validity()?;

        Ok(mbr)
    }

    /// Writes this MBR to a mutable bytes buffer.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidTable`] if the buffer cannot hold an MBR.
    pub fn write(&self, buf: &mut [u8]) -> Result<()> {
        let bytes = self.as_bytes();

        buf.get_mut(..bytes.len())
            .ok_or(invalid("sector is too small"))?
            .copy_from_slice(bytes);

        Ok(())
    }

    /// Returns the bootstrap code contained in this MBR.
    ///
    /// The last bytes of this area also hold the optional disk signature.
    #[must_use]
    pub fn bootcode(&self) -> &[u8] {
        &self.bootstrap
    }

    /// Checks if this MBR carries the boot signature.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidTable`] if it does not.
    pub fn check_validity(&self) -> Result<()> {
        if !self.check_signature() {
            return Err(invalid("missing boot signature"));
        }

        Ok(())
    }

    #[inline]
    fn check_signature(&self) -> bool {
        self.boot_sig() == MBR_MAGIC_LE
    }

    packed_field_accessors!(boot_sig, u16);
}

impl Default for Mbr {
    fn default() -> Self {
        Self::new()
    }
}

/// Represents an individual partition entry in an MBR partition table.
///
/// This struct is designed to match the exact layout of an MBR partition entry on disk.
///
/// # Examples
///
/// ```
/// use disklabel::Mbr;
///
/// let mut mbr = Mbr::new();
///
/// mbr.partitions[0].set_sectors_count(1024);
/// mbr.partitions[0].set_part_type(0x83);
///
/// assert!(mbr.partitions[0].is_used());
/// ```
#[derive(Clone, Copy, Debug, Default, FromBytes, IntoBytes, Immutable)]
#[repr(C, packed(1))]
pub struct MbrPartition {
    attributes: u8,

    chs_start: [u8; 3],
    part_type: u8,
    chs_last: [u8; 3],

    start_lba: u32,
    sectors_count: u32,
}

assert_eq_size!(MbrPartition, [u8; 0x10]);

impl MbrPartition {
    /// Builds an entry for `num_sectors` sectors starting at the absolute sector `first_lba`.
    ///
    /// `relative_start` is the value stored in the entry, which for extended tables is
    /// relative to some base sector. The CHS fields are derived from the absolute position.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfBounds`] when the extent leaves the disk or cannot be described
    /// with 32-bit sector numbers.
    pub fn for_extent(
        geometry: &DiskGeometry,
        tag: u8,
        active: bool,
        first_lba: u64,
        relative_start: u64,
        num_sectors: u64,
    ) -> Result<Self> {
        let out_of_bounds = Error::OutOfBounds {
            lba: first_lba + num_sectors,
            num_sectors: geometry.num_sectors,
        };

        let start_lba = u32::try_from(relative_start).map_err(|_| out_of_bounds.clone())?;
        let sectors_count = u32::try_from(num_sectors).map_err(|_| out_of_bounds.clone())?;

        if num_sectors == 0 {
            return Err(out_of_bounds);
        }

        let mut entry = Self {
            attributes: 0,
            chs_start: geometry.lba_to_chs(first_lba)?.encode(),
            part_type: tag,
            chs_last: geometry.lba_to_chs(first_lba + num_sectors - 1)?.encode(),
            start_lba,
            sectors_count,
        };
        entry.set_active(active);

        Ok(entry)
    }

    /// Returns `true` if this partition is flagged as _active_ (or bootable).
    ///
    /// Any value with the high bit set is accepted, as some tools store the BIOS drive
    /// number there.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.attributes & 0x80 != 0
    }

    /// Sets the _active_ (or bootable) flag for this partition.
    ///
    /// Only one partition should be active in a [`Mbr`]
    #[inline]
    pub fn set_active(&mut self, active: bool) {
        self.attributes = if active { 0x80 } else { 0 }
    }

    /// Returns `true` if this entry corresponds to a valid partition.
    #[must_use]
    pub fn is_used(&self) -> bool {
        self.part_type != 0 && self.sectors_count() != 0
    }

    /// Returns `true` if this entry points to another table of the extended chain.
    #[must_use]
    pub fn is_extended(&self) -> bool {
        is_extended_tag(self.part_type)
    }

    /// Returns the [`MbrPartitionType`] for this partition.
    #[inline]
    #[must_use]
    pub fn partition_type(&self) -> MbrPartitionType {
        self.part_type.into()
    }

    fn to_raw(self, order: u32, kind: SliceKind, base: u64) -> RawSlice {
        let mut flags = SliceFlags::empty();
        flags.set(SliceFlags::BOOTABLE, self.is_active());

        RawSlice {
            order,
            kind,
            flags,
            tag: self.part_type,
            start_sector: base + u64::from(self.start_lba()),
            num_sectors: u64::from(self.sectors_count()),
            ..RawSlice::default()
        }
    }

    packed_field_accessors!(part_type, set_part_type, u8);
    packed_field_accessors!(start_lba, set_start_lba, u32);
    packed_field_accessors!(sectors_count, set_sectors_count, u32);
    packed_field_accessors!(chs_start, [u8; 3]);
    packed_field_accessors!(chs_last, [u8; 3]);
}

/// Known partition IDs for various filesystems, used in MBR partition entries.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MbrPartitionType {
    Empty,
    DOSFat12,
    XenixRoot,
    XenixUsr,
    DOS3Fat16,
    Extended,
    DOS331Fat16,
    NTFS,
    Fat32,
    Fat32LBA,
    DOSFat16LBA,
    ExtendedLBA,
    HiddenFat12,
    HiddenFat16Small,
    HiddenFat16,
    HiddenNTFS,
    HiddenFat32,
    HiddenFat32LBA,
    HiddenFat16LBA,
    Minix,
    LinuxSwap,
    LinuxNative,
    LinuxExtended,
    LinuxLVM,
    BSDI,
    FreeBSD,
    OpenBSD,
    MacOSX,
    NetBSD,
    MacOSXBoot,
    MacOSXHFS,
    LUKS,
    GPT,
    EFI,
    LinuxRaid,
    Unknown(u8),
}

impl MbrPartitionType {
    /// Every named type, in tag order.
    pub const KNOWN: [MbrPartitionType; 35] = [
        Self::Empty,
        Self::DOSFat12,
        Self::XenixRoot,
        Self::XenixUsr,
        Self::DOS3Fat16,
        Self::Extended,
        Self::DOS331Fat16,
        Self::NTFS,
        Self::Fat32,
        Self::Fat32LBA,
        Self::DOSFat16LBA,
        Self::ExtendedLBA,
        Self::HiddenFat12,
        Self::HiddenFat16Small,
        Self::HiddenFat16,
        Self::HiddenNTFS,
        Self::HiddenFat32,
        Self::HiddenFat32LBA,
        Self::HiddenFat16LBA,
        Self::Minix,
        Self::LinuxSwap,
        Self::LinuxNative,
        Self::LinuxExtended,
        Self::LinuxLVM,
        Self::BSDI,
        Self::FreeBSD,
        Self::OpenBSD,
        Self::MacOSX,
        Self::NetBSD,
        Self::MacOSXBoot,
        Self::MacOSXHFS,
        Self::LUKS,
        Self::GPT,
        Self::EFI,
        Self::LinuxRaid,
    ];

    #[must_use]
    pub fn description(self) -> &'static str {
        match self {
            Self::Empty => "Empty",
            Self::DOSFat12 => "FAT12",
            Self::XenixRoot => "XENIX root",
            Self::XenixUsr => "XENIX usr",
            Self::DOS3Fat16 => "FAT16 (<32M)",
            Self::Extended => "Extended",
            Self::DOS331Fat16 => "FAT16",
            Self::NTFS => "NTFS / HPFS / exFAT",
            Self::Fat32 => "FAT32",
            Self::Fat32LBA => "FAT32 (LBA)",
            Self::DOSFat16LBA => "FAT16 (LBA)",
            Self::ExtendedLBA => "Extended (LBA)",
            Self::HiddenFat12 => "Hidden FAT12",
            Self::HiddenFat16Small => "Hidden FAT16 (<32M)",
            Self::HiddenFat16 => "Hidden FAT16",
            Self::HiddenNTFS => "Hidden NTFS / HPFS",
            Self::HiddenFat32 => "Hidden FAT32",
            Self::HiddenFat32LBA => "Hidden FAT32 (LBA)",
            Self::HiddenFat16LBA => "Hidden FAT16 (LBA)",
            Self::Minix => "Minix",
            Self::LinuxSwap => "Linux swap",
            Self::LinuxNative => "Linux",
            Self::LinuxExtended => "Linux extended",
            Self::LinuxLVM => "Linux LVM",
            Self::BSDI => "BSD/OS",
            Self::FreeBSD => "FreeBSD",
            Self::OpenBSD => "OpenBSD",
            Self::MacOSX => "Darwin UFS",
            Self::NetBSD => "NetBSD",
            Self::MacOSXBoot => "Darwin boot",
            Self::MacOSXHFS => "HFS / HFS+",
            Self::LUKS => "Linux LUKS",
            Self::GPT => "GPT protective",
            Self::EFI => "EFI system",
            Self::LinuxRaid => "Linux RAID",
            Self::Unknown(_) => "Unknown",
        }
    }
}

impl From<MbrPartitionType> for u8 {
    fn from(value: MbrPartitionType) -> Self {
        match value {
            MbrPartitionType::Empty => 0,
            MbrPartitionType::DOSFat12 => 1,
            MbrPartitionType::XenixRoot => 2,
            MbrPartitionType::XenixUsr => 3,
            MbrPartitionType::DOS3Fat16 => 4,
            MbrPartitionType::Extended => 5,
            MbrPartitionType::DOS331Fat16 => 6,
            MbrPartitionType::NTFS => 7,
            MbrPartitionType::Fat32 => 0xB,
            MbrPartitionType::Fat32LBA => 0xC,
            MbrPartitionType::DOSFat16LBA => 0xE,
            MbrPartitionType::ExtendedLBA => 0xF,
            MbrPartitionType::HiddenFat12 => 0x11,
            MbrPartitionType::HiddenFat16Small => 0x14,
            MbrPartitionType::HiddenFat16 => 0x16,
            MbrPartitionType::HiddenNTFS => 0x17,
            MbrPartitionType::HiddenFat32 => 0x1B,
            MbrPartitionType::HiddenFat32LBA => 0x1C,
            MbrPartitionType::HiddenFat16LBA => 0x1E,
            MbrPartitionType::Minix => 0x81,
            MbrPartitionType::LinuxSwap => 0x82,
            MbrPartitionType::LinuxNative => 0x83,
            MbrPartitionType::LinuxExtended => 0x85,
            MbrPartitionType::LinuxLVM => 0x8E,
            MbrPartitionType::BSDI => 0x9F,
            MbrPartitionType::FreeBSD => 0xA5,
            MbrPartitionType::OpenBSD => 0xA6,
            MbrPartitionType::MacOSX => 0xA8,
            MbrPartitionType::NetBSD => 0xA9,
            MbrPartitionType::MacOSXBoot => 0xAB,
            MbrPartitionType::MacOSXHFS => 0xAF,
            MbrPartitionType::LUKS => 0xE8,
            MbrPartitionType::GPT => 0xEE,
            MbrPartitionType::EFI => 0xEF,
            MbrPartitionType::LinuxRaid => 0xFD,
            MbrPartitionType::Unknown(tag) => tag,
        }
    }
}

impl From<u8> for MbrPartitionType {
    fn from(value: u8) -> Self {
        Self::KNOWN
            .into_iter()
            .find(|&known| u8::from(known) == value)
            .unwrap_or(Self::Unknown(value))
    }
}

fn invalid(reason: &'static str) -> Error {
    Error::InvalidTable {
        label: LabelType::MsDos,
        reason,
    }
}

#[must_use]
pub fn is_extended_tag(tag: u8) -> bool {
    matches!(tag, 0x05 | 0x0F | 0x85)
}

/// Human-readable name of an MS-DOS partition tag.
#[must_use]
pub fn type_description(tag: u8) -> &'static str {
    MbrPartitionType::from(tag).description()
}

/// Types a user may give to a new partition.
pub(crate) fn type_catalog() -> Vec<(SliceType, &'static str)> {
    MbrPartitionType::KNOWN
        .into_iter()
        .filter(|ty| {
            let tag = u8::from(*ty);
            tag != 0 && tag != TAG_GPT_PROTECTIVE && !is_extended_tag(tag)
        })
        .map(|ty| (SliceType::Tag(ty.into()), ty.description()))
        .collect()
}

/// Whether `tag` belongs to a type that can be hidden, or is one that was hidden.
#[must_use]
pub fn can_hide(tag: u8) -> bool {
    HIDEABLE_TAGS.contains(&tag) || HIDEABLE_TAGS.contains(&tag.wrapping_sub(0x10))
}

/// Hides a visible tag, or reveals a hidden one.
#[must_use]
pub fn toggle_hidden(tag: u8) -> Option<u8> {
    if HIDEABLE_TAGS.contains(&tag) {
        Some(tag + 0x10)
    } else if HIDEABLE_TAGS.contains(&tag.wrapping_sub(0x10)) {
        Some(tag - 0x10)
    } else {
        None
    }
}

fn read_mbr<D: BlockDevice + ?Sized>(device: &mut D, lba: u64) -> Result<Mbr> {
    Mbr::parse_from_buf(&read_vec(device, lba, 1)?)
}

/// Reads sector 0 and keeps its bootstrap code, if it holds a valid MBR.
fn current_bootcode<D: BlockDevice + ?Sized>(device: &mut D) -> Result<[u8; MBR_BOOTSTRAP_SIZE]> {
    let mut bootstrap = [0u8; MBR_BOOTSTRAP_SIZE];

    match read_mbr(device, 0) {
        Ok(mbr) => bootstrap.copy_from_slice(mbr.bootcode()),
        Err(Error::InvalidTable { .. }) => {}
        Err(err) => return Err(err),
    }

    Ok(bootstrap)
}

fn write_mbr<D: BlockDevice + ?Sized>(device: &mut D, lba: u64, mbr: &Mbr) -> Result<()> {
    let mut sector = vec![0u8; device.geometry().sector_size as usize];
    mbr.write(&mut sector)?;

    device.write_sectors(lba, 1, &sector)?;

    Ok(())
}

/// Returns `true` if sector 0 carries the boot signature.
pub(crate) fn probe<D: BlockDevice + ?Sized>(device: &mut D) -> Result<bool> {
    if device.geometry().num_sectors == 0 {
        return Ok(false);
    }

    match read_mbr(device, 0) {
        Ok(_) => Ok(true),
        Err(Error::InvalidTable { .. }) => Ok(false),
        Err(err) => Err(err),
    }
}

/// Returns `true` if sector 0 holds an MBR with a GPT protective entry.
pub(crate) fn has_protective_entry<D: BlockDevice + ?Sized>(device: &mut D) -> Result<bool> {
    if device.geometry().num_sectors == 0 {
        return Ok(false);
    }

    match read_mbr(device, 0) {
        Ok(mbr) => Ok(mbr
            .partitions
            .iter()
            .any(|part| part.part_type() == TAG_GPT_PROTECTIVE)),
        Err(Error::InvalidTable { .. }) => Ok(false),
        Err(err) => Err(err),
    }
}

/// Writes an empty partition table, keeping any bootstrap code already present.
pub(crate) fn create<D: BlockDevice + ?Sized>(device: &mut D) -> Result<()> {
    let mut mbr = Mbr::new();
    mbr.bootstrap = current_bootcode(device)?;

    log::debug!("Writing empty MS-DOS table on {}", device.name());

    write_mbr(device, 0, &mbr)
}

/// Writes the protective MBR of a GPT disk.
pub(crate) fn write_protective<D: BlockDevice + ?Sized>(device: &mut D) -> Result<()> {
    let mut mbr = Mbr::protective(&device.geometry())?;
    mbr.bootstrap = current_bootcode(device)?;

    log::trace!("Writing protective MBR");

    write_mbr(device, 0, &mbr)
}

/// Parses one table of the chain at `table_lba` and appends its partitions to `slices`.
///
/// `extended_base` is `None` for the MBR itself and the start of the outermost extended
/// partition for every other table. Returns the sector of the next table, if any.
fn read_table_sector<D: BlockDevice + ?Sized>(
    device: &mut D,
    table_lba: u64,
    extended_base: Option<u64>,
    slices: &mut Vec<RawSlice>,
) -> Result<Option<u64>> {
    let mbr = read_mbr(device, table_lba)?;

    let (kind, entries, base) = match extended_base {
        None => (SliceKind::Primary, &mbr.partitions[..PRIMARY_ENTRIES], 0),
        Some(_) => (SliceKind::Logical, &mbr.partitions[..EXTENDED_ENTRIES], table_lba),
    };

    for entry in entries {
        let order = slices.len() as u32;

        if entry.is_extended() {
            if extended_base.is_none() {
                slices.push(RawSlice {
                    order,
                    ..RawSlice::default()
                });
            }
            continue;
        }

        if !entry.is_used() {
            if extended_base.is_some() {
                break;
            }

            slices.push(RawSlice {
                order,
                ..RawSlice::default()
            });
            continue;
        }

        log::trace!(
            "Entry {order}: tag {:#04x}, start {}, {} sectors",
            entry.part_type(),
            base + u64::from(entry.start_lba()),
            entry.sectors_count()
        );

        slices.push(entry.to_raw(order, kind, base));
    }

    if extended_base.is_none() {
        while slices.last().is_some_and(|slice| slice.tag == 0) {
            slices.pop();
        }
    }

    let next = entries
        .iter()
        .take_while(|entry| extended_base.is_none() || entry.part_type() != 0)
        .find(|entry| entry.is_extended() && entry.sectors_count() != 0)
        .map(|entry| extended_base.unwrap_or(0) + u64::from(entry.start_lba()));

    Ok(next)
}

pub(crate) fn read_table<D: BlockDevice + ?Sized>(device: &mut D) -> Result<LabelTable> {
    let geometry = device.geometry();
    let mut slices = Vec::new();

    let mut next = read_table_sector(device, 0, None, &mut slices)?;
    let extended_base = next;

    for _ in 0..MAX_CHAIN_LENGTH {
        let Some(table_lba) = next else {
            break;
        };

        if table_lba >= geometry.num_sectors {
            log::warn!("Extended table at sector {table_lba} lies outside of the disk");
            next = None;
            break;
        }

        next = match read_table_sector(device, table_lba, extended_base, &mut slices) {
            Ok(next) => next,
            Err(Error::InvalidTable { .. }) => {
                log::warn!("Extended table at sector {table_lba} has no boot signature");
                None
            }
            Err(err) => return Err(err),
        };
    }

    if next.is_some() {
        log::warn!("Extended partition chain is longer than {MAX_CHAIN_LENGTH} tables, ignoring the rest");
    }

    log::debug!(
        "Read MS-DOS table of {}: {} entries",
        device.name(),
        slices.len()
    );

    Ok(LabelTable {
        slices,
        bounds: UsableBounds {
            first_usable_sector: 0,
            last_usable_sector: geometry.num_sectors.saturating_sub(1),
        },
        integrity: Integrity::Verified,
    })
}

/// Number of sectors of the extended partition holding `logicals`, from the table sector of
/// the first one to the end of the last one.
fn calc_extended_size(logicals: &[&RawSlice]) -> u64 {
    match (logicals.first(), logicals.last()) {
        (Some(first), Some(last)) => last.end_sector() - (first.start_sector - 1),
        _ => 0,
    }
}

/// Serializes `slices` into the MBR and the extended chain.
///
/// Everything is validated and encoded before the first sector is written.
pub(crate) fn write_table<D: BlockDevice + ?Sized>(device: &mut D, slices: &[RawSlice]) -> Result<()> {
    let geometry = device.geometry();

    let mut used: Vec<&RawSlice> = slices
        .iter()
        .filter(|slice| slice.tag != 0 && slice.num_sectors != 0)
        .collect();
    used.sort_by_key(|slice| slice.order);

    let run_starts = used
        .iter()
        .enumerate()
        .filter(|(i, slice)| slice.is_logical() && (*i == 0 || !used[i - 1].is_logical()))
        .count();

    if run_starts > 1 {
        return Err(Error::InvalidPlacement(
            "logical partitions must form a single chain",
        ));
    }

    let (mut logicals, primaries): (Vec<&RawSlice>, Vec<&RawSlice>) =
        used.into_iter().partition(|slice| slice.is_logical());
    logicals.sort_by_key(|slice| slice.start_sector);

    let mut mbr = Mbr::new();
    mbr.bootstrap = current_bootcode(device)?;

    let mut taken = [false; PRIMARY_ENTRIES];

    for slice in &primaries {
        let slot = match usize::try_from(slice.order) {
            Ok(slot) if slot < PRIMARY_ENTRIES && !taken[slot] => slot,
            _ => taken.iter().position(|&t| !t).ok_or(Error::TableFull)?,
        };

        mbr.partitions[slot] = MbrPartition::for_extent(
            &geometry,
            slice.tag,
            slice.is_bootable(),
            slice.start_sector,
            slice.start_sector,
            slice.num_sectors,
        )?;
        taken[slot] = true;
    }

    let mut chain = Vec::with_capacity(logicals.len());

    if let (Some(first), Some(last)) = (logicals.first(), logicals.last()) {
        // The first chain sector must not be the MBR.
        if first.start_sector < 2 {
            return Err(Error::InvalidPlacement(
                "a logical partition cannot start before sector 2",
            ));
        }

        let container_start = first.start_sector - 1;
        let container_end = last.end_sector();

        if primaries
            .iter()
            .any(|p| p.start_sector < container_end && p.end_sector() > container_start)
        {
            return Err(Error::WouldOverlap {
                start: container_start,
                num_sectors: container_end - container_start,
            });
        }

        let last_primary_slot = taken.iter().rposition(|&t| t).map_or(0, |slot| slot + 1);
        let slot = (last_primary_slot..PRIMARY_ENTRIES)
            .find(|&slot| !taken[slot])
            .or_else(|| taken.iter().position(|&t| !t))
            .ok_or(Error::TableFull)?;

        mbr.partitions[slot] = MbrPartition::for_extent(
            &geometry,
            TAG_EXTENDED_LBA,
            false,
            container_start,
            container_start,
            calc_extended_size(&logicals),
        )?;

        let mut previous_end = container_start;

        for (i, logical) in logicals.iter().enumerate() {
            let table_lba = logical.start_sector - 1;

            if table_lba < previous_end {
                return Err(Error::WouldOverlap {
                    start: table_lba,
                    num_sectors: logical.num_sectors + 1,
                });
            }

            let mut ebr = Mbr::new();
            ebr.partitions[0] = MbrPartition::for_extent(
                &geometry,
                logical.tag,
                logical.is_bootable(),
                logical.start_sector,
                1,
                logical.num_sectors,
            )?;

            if let Some(next) = logicals.get(i + 1) {
                let next_table = next.start_sector - 1;

                ebr.partitions[1] = MbrPartition::for_extent(
                    &geometry,
                    TAG_EXTENDED_LBA,
                    false,
                    next_table,
                    next_table - container_start,
                    next.end_sector() - next_table,
                )?;
            }

            chain.push((table_lba, ebr));
            previous_end = logical.end_sector();
        }
    }

    log::debug!(
        "Writing MS-DOS table on {}: {} primary, {} logical",
        device.name(),
        primaries.len(),
        chain.len()
    );

    for (i, (table_lba, ebr)) in chain.iter().enumerate() {
        write_mbr(device, *table_lba, ebr).map_err(|err| partial(err, i > 0))?;
    }

    write_mbr(device, 0, &mbr).map_err(|err| partial(err, !chain.is_empty()))
}

fn partial(err: Error, something_written: bool) -> Error {
    match err {
        Error::Io(source) if something_written => Error::PartialWrite {
            committed: "extended partition tables",
            source,
        },
        err => err,
    }
}

/// Decides which kind of partition may be created in the empty slice at `index`.
///
/// The extended partition uses one of the four primary slots for the whole chain, and a new
/// logical partition has to extend the existing chain if there is one.
pub(crate) fn can_create_slice(slices: &[Slice], index: usize) -> CreateKind {
    let Some(empty) = slices.get(index).and_then(Slice::as_empty) else {
        return CreateKind::None;
    };

    let primaries = slices
        .iter()
        .filter(|slice| slice.is_used() && !slice.is_logical())
        .count();
    let has_logical = slices.iter().any(Slice::is_logical);
    let used_slots = primaries + usize::from(has_logical);

    let prev_logical = slices[..index]
        .iter()
        .rev()
        .find(|slice| slice.is_used())
        .is_some_and(Slice::is_logical);
    let next_logical = slices[index + 1..]
        .iter()
        .find(|slice| slice.is_used())
        .is_some_and(Slice::is_logical);

    let primary = used_slots < PRIMARY_ENTRIES && !(prev_logical && next_logical);
    let logical = empty.num_sectors >= 2
        && if has_logical {
            prev_logical || next_logical
        } else {
            used_slots < PRIMARY_ENTRIES
        };

    CreateKind::from_permissions(primary, logical)
}

#[cfg(test)]
mod tests {
    extern crate std;

    use alloc::string::String;

    use base64::prelude::*;

    use super::*;
    use crate::{io::MemoryDisk, slice::UsedSlice, Extent};

    const DUMMY_MBR: &str = "M+2QkJCQkJCQkJCQkJCQkJCQkJCQkJCQkJCQkJCQkJAz7fqO1bwAfPv8ZjHbZjHJZlNmUQZXjt2OxVK+AHy/AAa5AAHzpepLBgAAUrRBu6pVMckw9vnNE3IWgftVqnUQg+EBdAtmxwbzBrRC6xXrAjHJWlG0CM0TWw+2xkBQg+E/UffhU1JQuwB8uQQAZqGwB+hEAA+CgABmQIDHAuLyZoE+QHz7wHhwdQn6vOx76kR8AADogwBpc29saW51eC5iaW4gbWlzc2luZyBvciBjb3JydXB0Lg0KZmBmMdJmAwb4e2YTFvx7ZlJmUAZTagFqEInmZvc26HvA5AaI4YjFkvY27nuIxgjhQbgBAooW8nvNE41kEGZhw+geAE9wZXJhdGluZyBzeXN0ZW0gbG9hZCBlcnJvci4NCl6stA6KPmIEswfNEDwKdfHNGPTr/QAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA7AEAAAAAAAD25m4IAACAAQIAAKv//0AAAADAT6kAAKv//++r//8AUKkAAFgFAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAVao=";

    fn geometry() -> DiskGeometry {
        DiskGeometry::from_sector_count(2_097_152, 512)
    }

    fn primary(order: u32, tag: u8, start_sector: u64, num_sectors: u64) -> RawSlice {
        RawSlice {
            order,
            tag,
            start_sector,
            num_sectors,
            ..RawSlice::default()
        }
    }

    fn logical(order: u32, start_sector: u64, num_sectors: u64) -> RawSlice {
        RawSlice {
            kind: SliceKind::Logical,
            ..primary(order, 0x83, start_sector, num_sectors)
        }
    }

    fn used(raw: RawSlice) -> Slice {
        Slice::Used(UsedSlice {
            raw,
            device_name: String::new(),
            fs_type: String::new(),
            description: String::new(),
            lead_sectors: 0,
        })
    }

    #[test]
    pub fn parse_standard_mbr_from_buffer() {
        let mbr_bytes = BASE64_STANDARD.decode(DUMMY_MBR).unwrap();

        let mbr = Mbr::parse_from_buf(&mbr_bytes).unwrap();

        assert!(mbr.partitions[0].is_active());
        assert!(!mbr.partitions[1].is_active());
        assert_eq!(mbr.partitions[0].sectors_count(), 11096000);
        assert_eq!(mbr.partitions[0].start_lba(), 64);
        assert_eq!(
            mbr.partitions[1].partition_type(),
            MbrPartitionType::EFI
        );
    }

    #[test]
    pub fn missing_signature_is_invalid() {
        let buf = [0u8; 512];

        assert!(matches!(
            Mbr::parse_from_buf(&buf),
            Err(Error::InvalidTable {
                label: LabelType::MsDos,
                ..
            })
        ));
    }

    #[test]
    pub fn read_keeps_primary_slot_numbering() {
        let image = BASE64_STANDARD.decode(DUMMY_MBR).unwrap();
        let mut disk =
            MemoryDisk::with_image(DiskGeometry::from_sector_count(11_446_272, 512), &image)
                .unwrap();

        let table = read_table(&mut disk).unwrap();

        // The first entry has a size but no type: it only keeps its slot.
        assert_eq!(table.slices.len(), 2);
        assert_eq!(table.slices[0].tag, 0);
        assert_eq!(table.slices[1].order, 1);
        assert_eq!(table.slices[1].tag, 0xEF);
        assert_eq!(table.slices[1].start_sector, 11_096_064);
        assert_eq!(table.slices[1].num_sectors, 350_208);
        assert_eq!(table.bounds.first_usable_sector, 0);
        assert_eq!(table.bounds.last_usable_sector, 11_446_271);
    }

    #[test]
    pub fn write_then_read_extended_chain() {
        let mut disk = MemoryDisk::new(geometry());
        create(&mut disk).unwrap();

        let mut boot = primary(0, 0x0C, 2048, 204_800);
        boot.flags = SliceFlags::BOOTABLE;

        let slices = [
            boot,
            primary(1, 0x82, 206_848, 8192),
            logical(2, 409_600, 10_000),
            logical(3, 419_601, 20_000),
            logical(4, 500_000, 2),
        ];

        write_table(&mut disk, &slices).unwrap();

        let table = read_table(&mut disk).unwrap();

        assert_eq!(table.slices, slices);
    }

    #[test]
    pub fn extended_chain_layout_on_disk() {
        let mut disk = MemoryDisk::new(geometry());

        let slices = [
            primary(0, 0x07, 2048, 2048),
            logical(1, 8192, 1000),
            logical(2, 10_000, 1000),
        ];

        write_table(&mut disk, &slices).unwrap();

        let mbr = read_mbr(&mut disk, 0).unwrap();
        let container = mbr.partitions[1];

        assert_eq!(container.part_type(), TAG_EXTENDED_LBA);
        assert_eq!(container.start_lba(), 8191);
        assert_eq!(container.sectors_count(), 11_000 - 8191);

        let first = read_mbr(&mut disk, 8191).unwrap();
        assert_eq!(first.partitions[0].start_lba(), 1);
        assert_eq!(first.partitions[0].sectors_count(), 1000);
        assert_eq!(first.partitions[1].start_lba(), 9999 - 8191);
        assert_eq!(first.partitions[1].sectors_count(), 1001);

        let second = read_mbr(&mut disk, 9999).unwrap();
        assert_eq!(second.partitions[0].start_lba(), 1);
        assert!(!second.partitions[1].is_used());
    }

    #[test]
    pub fn write_keeps_bootcode_and_chs() {
        let image = BASE64_STANDARD.decode(DUMMY_MBR).unwrap();
        let mut disk = MemoryDisk::with_image(geometry(), &image).unwrap();

        write_table(&mut disk, &[primary(0, 0x83, 16_065, 16_065)]).unwrap();

        let mbr = read_mbr(&mut disk, 0).unwrap();

        assert_eq!(mbr.bootcode(), &image[..MBR_BOOTSTRAP_SIZE]);
        assert_eq!(mbr.partitions[0].chs_start(), [0, 1, 1]);
        assert_eq!(mbr.partitions[0].chs_last(), [254, 63, 1]);
    }

    #[test]
    pub fn broken_chain_link_ends_the_chain() {
        let mut disk = MemoryDisk::new(geometry());

        write_table(
            &mut disk,
            &[logical(0, 4096, 100), logical(1, 8192, 100)],
        )
        .unwrap();
        disk.zero_sector(8191);

        let table = read_table(&mut disk).unwrap();

        assert_eq!(table.slices.len(), 1);
        assert_eq!(table.slices[0].start_sector, 4096);
    }

    #[test]
    pub fn write_rejects_unrepresentable_partitions() {
        let mut disk = MemoryDisk::new(DiskGeometry::from_sector_count(1 << 33, 512));

        assert!(matches!(
            write_table(&mut disk, &[primary(0, 0x83, 1 << 32, 2048)]),
            Err(Error::OutOfBounds { .. })
        ));
        assert!(!probe(&mut disk).unwrap());
    }

    #[test]
    pub fn logical_table_cannot_share_sector_zero() {
        let mut disk = MemoryDisk::new(geometry());

        for start_sector in [0, 1] {
            assert!(matches!(
                write_table(&mut disk, &[logical(0, start_sector, 100)]),
                Err(Error::InvalidPlacement(_))
            ));
        }
        assert!(!probe(&mut disk).unwrap());

        write_table(&mut disk, &[logical(0, 2, 100)]).unwrap();

        let table = read_table(&mut disk).unwrap();
        assert_eq!(table.slices.len(), 1);
        assert_eq!(table.slices[0].start_sector, 2);
        assert_eq!(table.slices[0].num_sectors, 100);
    }

    #[test]
    pub fn protective_mbr_covers_the_disk() {
        let geometry = geometry();
        let mbr = Mbr::protective(&geometry).unwrap();

        assert_eq!(mbr.partitions[0].part_type(), TAG_GPT_PROTECTIVE);
        assert_eq!(mbr.partitions[0].start_lba(), 1);
        assert_eq!(
            u64::from(mbr.partitions[0].sectors_count()),
            geometry.num_sectors - 1
        );
    }

    #[test]
    pub fn hide_toggles_known_tags() {
        assert!(can_hide(0x07));
        assert!(can_hide(0x17));
        assert!(!can_hide(0x83));
        assert_eq!(toggle_hidden(0x0C), Some(0x1C));
        assert_eq!(toggle_hidden(0x1C), Some(0x0C));
        assert_eq!(toggle_hidden(0x83), None);
    }

    #[test]
    pub fn catalog_has_no_containers() {
        let catalog = type_catalog();

        assert!(catalog
            .iter()
            .all(|(ty, _)| !matches!(ty, SliceType::Tag(0 | 0x05 | 0x0F | 0x85 | 0xEE))));
        assert_eq!(type_description(0x83), "Linux");
        assert_eq!(type_description(0x42), "Unknown");
    }

    #[test]
    pub fn create_kind_follows_slot_usage() {
        let empty = |start, len| Slice::Empty(Extent::new(start, len));

        let free_disk = [empty(1, 1000)];
        assert_eq!(can_create_slice(&free_disk, 0), CreateKind::Any);

        let full = [
            used(primary(0, 0x83, 10, 10)),
            used(primary(1, 0x83, 20, 10)),
            used(primary(2, 0x83, 30, 10)),
            empty(40, 10),
            used(primary(3, 0x83, 50, 10)),
        ];
        assert_eq!(can_create_slice(&full, 3), CreateKind::None);

        let chain = [
            used(primary(0, 0x83, 10, 10)),
            empty(20, 10),
            used(logical(1, 31, 10)),
            empty(41, 1),
            used(logical(2, 43, 10)),
            empty(53, 100),
        ];
        assert_eq!(can_create_slice(&chain, 1), CreateKind::Any);
        assert_eq!(can_create_slice(&chain, 3), CreateKind::None);
        assert_eq!(can_create_slice(&chain, 5), CreateKind::Any);
        assert_eq!(can_create_slice(&chain, 0), CreateKind::None);

        let detached = [
            used(logical(1, 31, 10)),
            empty(41, 10),
            used(primary(0, 0x83, 51, 10)),
            empty(61, 10),
        ];
        assert_eq!(can_create_slice(&detached, 3), CreateKind::Primary);
    }
}
