//! GPT (_GUID Partition Table_) handling
//!
//! The header lives in the second sector of the disk and points to an array of partition
//! entries. Both are protected by CRC32 checksums and duplicated at the end of the disk, the
//! backup header occupying the very last sector.

use alloc::{string::String, vec, vec::Vec};

use uuid::{uuid, Uuid};
use zerocopy::{FromBytes, IntoBytes};
use zerocopy_derive::{FromBytes, Immutable, IntoBytes};

use crate::{
    error::{ChecksumRegion, Error, Result},
    geometry::DiskGeometry,
    io::{read_vec, BlockDevice},
    label::{ChecksumPolicy, CreateKind, Integrity, LabelTable, LabelType, ReadOptions, UsableBounds},
    mbr, packed_field_accessors,
    slice::{RawSlice, Slice, SliceFlags, SliceKind, SliceType},
};

const GPT_HEADER_LBA: u64 = 1;
const GPT_SIG: &[u8; 8] = b"EFI PART";
const GPT_REVISION: u32 = 0x0001_0000;
const GPT_HEADER_SIZE: u32 = 0x5C;
pub(crate) const GPT_ENTRY_COUNT: u32 = 128;
const GPT_ENTRY_SIZE: u32 = 0x80;
const GPT_NAME_UNITS: usize = 36;

/// Largest partition entry array accepted when reading, in bytes.
const MAX_ENTRY_ARRAY_SIZE: u64 = 1 << 20;

/// Tag given to used GPT slices, whose real type is their GUID.
pub const GPT_USED_TAG: u8 = 1;

pub const EFI_SYSTEM: Uuid = uuid!("C12A7328-F81F-11D2-BA4B-00A0C93EC93B");
pub const BIOS_BOOT: Uuid = uuid!("21686148-6449-6E6F-744E-656564454649");
pub const MICROSOFT_RESERVED: Uuid = uuid!("E3C9E316-0B5C-4DB8-817D-F92DF00215AE");
pub const MICROSOFT_BASIC_DATA: Uuid = uuid!("EBD0A0A2-B9E5-4433-87C0-68B6B72699C7");
pub const WINDOWS_RECOVERY: Uuid = uuid!("DE94BBA4-06D1-4D40-A16A-BFD50179D6AC");
pub const LINUX_FILESYSTEM: Uuid = uuid!("0FC63DAF-8483-4772-8E79-3D69D8477DE4");
pub const LINUX_SWAP: Uuid = uuid!("0657FD6D-A4AB-43C4-84E5-0933C84B4F4F");
pub const LINUX_LVM: Uuid = uuid!("E6D6D379-F507-44C2-A23C-238F2A3DF928");
pub const LINUX_RAID: Uuid = uuid!("A19D880F-05FC-4D3B-A006-743F0F84911E");
pub const LINUX_HOME: Uuid = uuid!("933AC7E1-2EB4-4F13-B844-0E14E2AEF915");
pub const APPLE_HFS: Uuid = uuid!("48465300-0000-11AA-AA11-00306543ECAC");
pub const APPLE_APFS: Uuid = uuid!("7C3457EF-0000-11AA-AA11-00306543ECAC");
pub const FREEBSD_UFS: Uuid = uuid!("516E7CB6-6ECF-11D6-8FF8-00022D09712B");
pub const FREEBSD_SWAP: Uuid = uuid!("516E7CB5-6ECF-11D6-8FF8-00022D09712B");
pub const MBR_PARTITION_SCHEME: Uuid = uuid!("024DEE41-33E7-11D3-9D69-0008C781F39F");

const TYPE_NAMES: [(Uuid, &str); 15] = [
    (EFI_SYSTEM, "EFI system"),
    (BIOS_BOOT, "BIOS boot"),
    (MICROSOFT_RESERVED, "Microsoft reserved"),
    (MICROSOFT_BASIC_DATA, "Microsoft basic data"),
    (WINDOWS_RECOVERY, "Windows recovery"),
    (LINUX_FILESYSTEM, "Linux filesystem"),
    (LINUX_SWAP, "Linux swap"),
    (LINUX_LVM, "Linux LVM"),
    (LINUX_RAID, "Linux RAID"),
    (LINUX_HOME, "Linux /home"),
    (APPLE_HFS, "Apple HFS+"),
    (APPLE_APFS, "Apple APFS"),
    (FREEBSD_UFS, "FreeBSD UFS"),
    (FREEBSD_SWAP, "FreeBSD swap"),
    (MBR_PARTITION_SCHEME, "MBR partition scheme"),
];

/// MS-DOS tags and the GPT types holding the same kind of data. The first match wins in both
/// directions.
const TAG_EQUIVALENTS: [(u8, Uuid); 14] = [
    (0x07, MICROSOFT_BASIC_DATA),
    (0x01, MICROSOFT_BASIC_DATA),
    (0x04, MICROSOFT_BASIC_DATA),
    (0x06, MICROSOFT_BASIC_DATA),
    (0x0B, MICROSOFT_BASIC_DATA),
    (0x0C, MICROSOFT_BASIC_DATA),
    (0x0E, MICROSOFT_BASIC_DATA),
    (0x83, LINUX_FILESYSTEM),
    (0x82, LINUX_SWAP),
    (0x8E, LINUX_LVM),
    (0xFD, LINUX_RAID),
    (0xEF, EFI_SYSTEM),
    (0xAF, APPLE_HFS),
    (0xA5, FREEBSD_UFS),
];

/// Human-readable name of a GPT partition type.
#[must_use]
pub fn type_description(type_guid: &Uuid) -> &'static str {
    TYPE_NAMES
        .iter()
        .find(|(guid, _)| guid == type_guid)
        .map_or("Unknown", |&(_, name)| name)
}

pub(crate) fn type_catalog() -> Vec<(SliceType, &'static str)> {
    TYPE_NAMES
        .iter()
        .map(|&(guid, name)| (SliceType::Guid(guid), name))
        .collect()
}

#[must_use]
pub fn guid_for_tag(tag: u8) -> Option<Uuid> {
    TAG_EQUIVALENTS
        .iter()
        .find(|(known, _)| *known == tag)
        .map(|&(_, guid)| guid)
}

#[must_use]
pub fn tag_for_guid(type_guid: &Uuid) -> Option<u8> {
    TAG_EQUIVALENTS
        .iter()
        .find(|(_, guid)| guid == type_guid)
        .map(|&(tag, _)| tag)
}

fn invalid(reason: &'static str) -> Error {
    Error::InvalidTable {
        label: LabelType::Gpt,
        reason,
    }
}

/// Header of a GUID Partition Table.
///
/// # Examples
///
/// ```
/// use disklabel::{DiskGeometry, GptHeader};
///
/// let header = GptHeader::new(&DiskGeometry::from_sector_count(2048, 512)).unwrap();
///
/// assert_eq!(header.first_usable_lba(), 34);
/// assert_eq!(header.last_usable_lba(), 2014);
/// assert_eq!(header.compute_checksum(), header.checksum());
/// ```
#[derive(Clone, Copy, Debug, FromBytes, IntoBytes, Immutable)]
#[repr(C, packed(1))]
pub struct GptHeader {
    /// Identifies EFI-compatible partition table header.
    /// Should contain the string "EFI PART".
    signature: [u8; 8],

    /// Revision number for this header.
    revision: u32,

    /// Size of the header in bytes.
    size: u32,

    /// CRC32 checksum for the header.
    checksum: u32,
    reserved: [u8; 4],

    /// The LBA that contains this structure.
    lba: u64,

    /// The LBA of the alternate `GPT` header.
    alternate_lba: u64,

    /// First logical block that may be used by a partition.
    first_usable_lba: u64,

    /// Last logical block that may be used by a partition.
    last_usable_lba: u64,

    /// GUID used to identify the disk.
    guid: [u8; 16],

    /// Starting LBA of the GUID Partition Entry array.
    partition_start_lba: u64,

    /// Number of partitions entries in the GUID Partition Entry array.
    partition_entries_count: u32,

    /// Size in bytes of each entry in the GUID Partition Entry array.
    partition_entry_size: u32,

    /// CRC32 of the GUID Partition Entry array.
    partition_entries_checksum: u32,
}

assert_eq_size!(GptHeader, [u8; 0x5C]);
assert_eq_align!(GptHeader, u8);

impl GptHeader {
    /// Lays out a fresh header for a disk: 128 entries right after the header, a backup copy
    /// of both at the end of the disk, and a random disk GUID.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoSpace`] if the disk cannot hold both copies and one usable sector.
    pub fn new(geometry: &DiskGeometry) -> Result<Self> {
        let entry_sectors = (u64::from(GPT_ENTRY_COUNT) * u64::from(GPT_ENTRY_SIZE))
            .div_ceil(u64::from(geometry.sector_size.max(1)));
        let first_usable_lba = GPT_HEADER_LBA + 1 + entry_sectors;
        let overhead = first_usable_lba + entry_sectors + 1;

        if geometry.num_sectors <= overhead {
            return Err(Error::NoSpace {
                requested: overhead + 1,
                available: geometry.num_sectors,
            });
        }

        let mut header = Self {
            signature: *GPT_SIG,
            revision: GPT_REVISION,
            size: GPT_HEADER_SIZE,
            checksum: 0,
            reserved: [0; 4],
            lba: GPT_HEADER_LBA,
            alternate_lba: geometry.num_sectors - 1,
            first_usable_lba,
            last_usable_lba: geometry.num_sectors - 2 - entry_sectors,
            guid: Uuid::new_v4().to_bytes_le(),
            partition_start_lba: GPT_HEADER_LBA + 1,
            partition_entries_count: GPT_ENTRY_COUNT,
            partition_entry_size: GPT_ENTRY_SIZE,
            partition_entries_checksum: 0,
        };
        header.seal();

        Ok(header)
    }

    /// Reads a header from the raw bytes of its sector.
    ///
    /// Only the structure is checked here, see [`GptHeader::verify_checksum`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidTable`] if the signature is missing or a size is unusable.
    pub fn parse_from_buf(buf: &[u8]) -> Result<Self> {
        let (header, _) =
            GptHeader::read_from_prefix(buf).map_err(|_| invalid("sector is too small"))?;

        if &header.signature != GPT_SIG {
            return Err(invalid("missing EFI PART signature"));
        }

        if header.size() < GPT_HEADER_SIZE || header.size() as usize > buf.len() {
            return Err(invalid("bad header size"));
        }

        if header.partition_entry_size() < GPT_ENTRY_SIZE
            || header.partition_entries_count() == 0
            || header.entry_array_size() > MAX_ENTRY_ARRAY_SIZE
        {
            return Err(invalid("bad partition entry array size"));
        }

        Ok(header)
    }

    /// CRC32 of this header, computed with the checksum field zeroed.
    #[must_use]
    pub fn compute_checksum(&self) -> u32 {
        let mut copy = *self;
        copy.checksum = 0;

        crc32fast::hash(copy.as_bytes())
    }

    /// Checks the header checksum against the sector the header was read from, since the
    /// checksummed area may extend past the fields known here.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ChecksumMismatch`] when the checksum is wrong.
    pub fn verify_checksum(&self, buf: &[u8]) -> Result<()> {
        let end = (self.size() as usize).min(buf.len());

        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&buf[..16]);
        hasher.update(&[0; 4]);
        hasher.update(&buf[20..end]);
        let computed = hasher.finalize();

        if computed != self.checksum() {
            return Err(Error::ChecksumMismatch {
                region: ChecksumRegion::GptHeader,
                computed,
                stored: self.checksum(),
            });
        }

        Ok(())
    }

    /// Recomputes the header checksum.
    fn seal(&mut self) {
        self.size = GPT_HEADER_SIZE;
        self.checksum = self.compute_checksum();
    }

    /// The matching header for the other end of the disk, with its entries at
    /// `partition_start_lba`.
    #[must_use]
    pub fn alternate(&self, partition_start_lba: u64) -> Self {
        let mut alternate = *self;
        alternate.lba = self.alternate_lba;
        alternate.alternate_lba = self.lba;
        alternate.partition_start_lba = partition_start_lba;
        alternate.seal();

        alternate
    }

    #[must_use]
    pub fn disk_guid(&self) -> Uuid {
        Uuid::from_bytes_le(self.guid)
    }

    /// Size in bytes of the partition entry array.
    #[must_use]
    pub fn entry_array_size(&self) -> u64 {
        u64::from(self.partition_entries_count()) * u64::from(self.partition_entry_size())
    }

    /// Number of sectors occupied by the partition entry array.
    #[must_use]
    pub fn entry_array_sectors(&self, sector_size: u32) -> u64 {
        self.entry_array_size()
            .div_ceil(u64::from(sector_size.max(1)))
    }

    fn to_sector(self, sector_size: u32) -> Vec<u8> {
        let mut sector = vec![0u8; sector_size as usize];
        let bytes = self.as_bytes();
        sector[..bytes.len()].copy_from_slice(bytes);

        sector
    }

    packed_field_accessors!(revision, u32);
    packed_field_accessors!(size, u32);
    packed_field_accessors!(checksum, u32);
    packed_field_accessors!(lba, u64);
    packed_field_accessors!(alternate_lba, u64);
    packed_field_accessors!(first_usable_lba, u64);
    packed_field_accessors!(last_usable_lba, u64);
    packed_field_accessors!(partition_start_lba, u64);
    packed_field_accessors!(partition_entries_count, u32);
    packed_field_accessors!(partition_entry_size, u32);
    packed_field_accessors!(partition_entries_checksum, u32);
}

/// An entry of the partition array.
#[derive(Clone, Copy, Debug, FromBytes, IntoBytes, Immutable)]
#[repr(C, packed(1))]
pub struct GptPartition {
    /// Defines the purpose and type of this partition.
    type_guid: [u8; 16],

    /// GUID unique for every partition entry.
    partition_guid: [u8; 16],

    /// Starting LBA of this partition.
    start_lba: u64,

    /// Last LBA of this partition.
    last_lba: u64,

    /// Partition's attributes bits.
    attributes: u64,

    /// Null-terminated string containing a human-readable name of this partition.
    partition_name: [u16; GPT_NAME_UNITS],
}

assert_eq_size!(GptPartition, [u8; 0x80]);
assert_eq_align!(GptPartition, u8);

impl GptPartition {
    /// Encodes a slice, giving it a new unique GUID if it has none yet.
    ///
    /// Names longer than 36 UTF-16 code units are truncated.
    #[must_use]
    pub fn from_raw(raw: &RawSlice) -> Self {
        let part_guid = if raw.part_guid.is_nil() {
            Uuid::new_v4()
        } else {
            raw.part_guid
        };

        let mut partition_name = [0u16; GPT_NAME_UNITS];
        for (unit, dest) in raw.name.encode_utf16().zip(partition_name.iter_mut()) {
            *dest = unit;
        }

        Self {
            type_guid: raw.type_guid.to_bytes_le(),
            partition_guid: part_guid.to_bytes_le(),
            start_lba: raw.start_sector,
            last_lba: raw.end_sector().saturating_sub(1),
            attributes: raw.attributes,
            partition_name,
        }
    }

    /// Returns this partition's sectors count.
    ///
    /// # Examples
    ///
    /// ```
    /// use disklabel::{GptPartition, RawSlice};
    ///
    /// let raw = RawSlice {
    ///     start_sector: 40,
    ///     num_sectors: 100,
    ///     ..RawSlice::default()
    /// };
    ///
    /// assert_eq!(GptPartition::from_raw(&raw).size(), 100);
    /// ```
    #[must_use]
    pub fn size(&self) -> u64 {
        self.last_lba() - self.start_lba() + 1
    }

    #[must_use]
    pub fn is_used(&self) -> bool {
        self.type_guid != [0; 16]
    }

    #[must_use]
    pub fn type_guid(&self) -> Uuid {
        Uuid::from_bytes_le(self.type_guid)
    }

    #[must_use]
    pub fn partition_guid(&self) -> Uuid {
        Uuid::from_bytes_le(self.partition_guid)
    }

    /// The partition name. Invalid UTF-16 is replaced with U+FFFD.
    #[must_use]
    pub fn name(&self) -> String {
        let units = self.partition_name;

        char::decode_utf16(units.into_iter().take_while(|&unit| unit != 0))
            .map(|c| c.unwrap_or(char::REPLACEMENT_CHARACTER))
            .collect()
    }

    fn to_raw(self, order: u32) -> RawSlice {
        RawSlice {
            order,
            kind: SliceKind::Primary,
            flags: SliceFlags::empty(),
            tag: GPT_USED_TAG,
            type_guid: self.type_guid(),
            part_guid: self.partition_guid(),
            attributes: self.attributes(),
            start_sector: self.start_lba(),
            num_sectors: self.size(),
            name: self.name(),
        }
    }

    packed_field_accessors!(start_lba, u64);
    packed_field_accessors!(last_lba, u64);
    packed_field_accessors!(attributes, u64);
}

/// One copy of the table: a header and its partition entry array.
struct GptCopy {
    header: GptHeader,

    /// Exactly `entries_count * entry_size` bytes.
    entries: Vec<u8>,
}

impl GptCopy {
    fn partitions(&self) -> impl Iterator<Item = (u32, GptPartition)> + '_ {
        self.entries
            .chunks_exact(self.header.partition_entry_size() as usize)
            .zip(0u32..)
            .filter_map(|(bytes, index)| {
                GptPartition::read_from_prefix(bytes)
                    .ok()
                    .map(|(part, _)| (index, part))
            })
    }
}

/// Reads the copy whose header is at `header_lba`.
///
/// Structural problems are errors. A checksum mismatch is returned next to the copy, so the
/// caller can decide whether to use it.
fn read_copy<D: BlockDevice + ?Sized>(
    device: &mut D,
    header_lba: u64,
) -> Result<(GptCopy, Option<Error>)> {
    let geometry = device.geometry();

    let sector = read_vec(device, header_lba, 1)?;
    let header = GptHeader::parse_from_buf(&sector)?;
    let mut anomaly = header.verify_checksum(&sector).err();

    let entry_sectors = header.entry_array_sectors(geometry.sector_size);

    if header
        .partition_start_lba()
        .checked_add(entry_sectors)
        .map_or(true, |end| end > geometry.num_sectors)
    {
        return Err(invalid("partition entries lie outside of the disk"));
    }

    let mut entries = read_vec(device, header.partition_start_lba(), entry_sectors as u32)?;
    entries.truncate(header.entry_array_size() as usize);

    let computed = crc32fast::hash(&entries);

    if anomaly.is_none() && computed != header.partition_entries_checksum() {
        anomaly = Some(Error::ChecksumMismatch {
            region: ChecksumRegion::GptEntries,
            computed,
            stored: header.partition_entries_checksum(),
        });
    }

    Ok((GptCopy { header, entries }, anomaly))
}

/// Reads the primary table, falling back to the backup one if `options` allow it.
fn load<D: BlockDevice + ?Sized>(
    device: &mut D,
    options: &ReadOptions,
) -> Result<(GptCopy, Integrity)> {
    let num_sectors = device.geometry().num_sectors;
    let mut backup_lba = num_sectors.saturating_sub(1);

    let primary_error = match read_copy(device, GPT_HEADER_LBA) {
        Ok((copy, None)) => return Ok((copy, Integrity::Verified)),
        Ok((copy, Some(anomaly))) => {
            if options.checksum_policy == ChecksumPolicy::Warn {
                log::warn!("{anomaly}, using the primary GPT anyway");
                return Ok((copy, Integrity::ChecksumIgnored));
            }

            if copy.header.alternate_lba() < num_sectors {
                backup_lba = copy.header.alternate_lba();
            }

            anomaly
        }
        Err(err @ Error::Io(_)) => return Err(err),
        Err(err) => err,
    };

    if options.checksum_policy != ChecksumPolicy::Fallback {
        return Err(primary_error);
    }

    log::warn!("Primary GPT is damaged ({primary_error}), reading the backup at sector {backup_lba}");

    match read_copy(device, backup_lba) {
        Ok((copy, None)) => Ok((copy, Integrity::RecoveredFromBackup)),
        Ok((_, Some(anomaly))) => {
            log::warn!("Backup GPT is damaged too: {anomaly}");
            Err(primary_error)
        }
        Err(err) => {
            log::warn!("Backup GPT is unusable: {err}");
            Err(primary_error)
        }
    }
}

/// Returns `true` if the disk has an MS-DOS signature and a GPT header signature.
///
/// When the primary header is gone, a protective MBR with a backup header on the last
/// sector is enough, so that the table can still be read from the backup.
pub(crate) fn probe<D: BlockDevice + ?Sized>(device: &mut D) -> Result<bool> {
    let num_sectors = device.geometry().num_sectors;

    if num_sectors <= GPT_HEADER_LBA || !mbr::probe(device)? {
        return Ok(false);
    }

    if read_vec(device, GPT_HEADER_LBA, 1)?.starts_with(GPT_SIG) {
        return Ok(true);
    }

    if num_sectors - 1 == GPT_HEADER_LBA || !mbr::has_protective_entry(device)? {
        return Ok(false);
    }

    let backup = read_vec(device, num_sectors - 1, 1)?.starts_with(GPT_SIG);
    if backup {
        log::warn!("{}: primary GPT header missing, found the backup one", device.name());
    }

    Ok(backup)
}

/// Writes both entry arrays, then both headers, then the protective MBR.
pub(crate) fn create<D: BlockDevice + ?Sized>(device: &mut D) -> Result<()> {
    let geometry = device.geometry();

    let mut header = GptHeader::new(&geometry)?;
    let entry_sectors = header.entry_array_sectors(geometry.sector_size);
    let entries = vec![0u8; (entry_sectors * u64::from(geometry.sector_size)) as usize];

    header.partition_entries_checksum =
        crc32fast::hash(&entries[..header.entry_array_size() as usize]);
    header.seal();

    let backup = header.alternate(header.last_usable_lba() + 1);

    log::debug!(
        "Writing empty GPT on {}, disk GUID {}",
        device.name(),
        header.disk_guid()
    );

    device.write_sectors(header.partition_start_lba(), entry_sectors as u32, &entries)?;
    device.write_sectors(backup.partition_start_lba(), entry_sectors as u32, &entries)?;
    device.write_sectors(header.lba(), 1, &header.to_sector(geometry.sector_size))?;
    device.write_sectors(backup.lba(), 1, &backup.to_sector(geometry.sector_size))?;

    mbr::write_protective(device)
}

pub(crate) fn read_table<D: BlockDevice + ?Sized>(
    device: &mut D,
    options: &ReadOptions,
) -> Result<LabelTable> {
    let (copy, integrity) = load(device, options)?;

    let slices: Vec<RawSlice> = copy
        .partitions()
        .filter(|(_, part)| part.is_used())
        .filter_map(|(index, part)| {
            if part.last_lba() < part.start_lba() {
                log::warn!("GPT entry {index} ends before it starts, ignoring it");
                return None;
            }

            Some(part.to_raw(index))
        })
        .collect();

    log::debug!(
        "Read GPT of {}: {} partitions, usable sectors {}..={}",
        device.name(),
        slices.len(),
        copy.header.first_usable_lba(),
        copy.header.last_usable_lba()
    );

    Ok(LabelTable {
        slices,
        bounds: UsableBounds {
            first_usable_sector: copy.header.first_usable_lba(),
            last_usable_sector: copy.header.last_usable_lba(),
        },
        integrity,
    })
}

/// Serializes the used entries of `slices`, each at the array index given by its order.
///
/// The current header is read back first so the disk GUID and layout are kept. The primary
/// array is written first and the backup header last; a failure writing the backup header
/// is only logged.
pub(crate) fn write_table<D: BlockDevice + ?Sized>(device: &mut D, slices: &[RawSlice]) -> Result<()> {
    let geometry = device.geometry();
    let (current, _) = load(device, &ReadOptions::default())?;

    let mut header = current.header;

    if header.lba() != GPT_HEADER_LBA {
        log::warn!("Rebuilding the primary GPT header from the backup");

        header.alternate_lba = header.lba();
        header.lba = GPT_HEADER_LBA;
        header.partition_start_lba = GPT_HEADER_LBA + 1;
    }

    let bounds = UsableBounds {
        first_usable_sector: header.first_usable_lba(),
        last_usable_sector: header.last_usable_lba(),
    };
    let entry_size = header.partition_entry_size() as usize;
    let entry_sectors = header.entry_array_sectors(geometry.sector_size);
    let backup_entries_lba = header.last_usable_lba() + 1;

    if backup_entries_lba + entry_sectors > header.alternate_lba() {
        return Err(invalid("no room for the backup partition entries"));
    }

    let mut used: Vec<&RawSlice> = slices
        .iter()
        .filter(|slice| !slice.type_guid.is_nil())
        .collect();
    used.sort_by_key(|slice| slice.order);

    let mut entries = vec![0u8; (entry_sectors * u64::from(geometry.sector_size)) as usize];
    let mut taken = vec![false; header.partition_entries_count() as usize];

    for slice in used {
        if !bounds.contains(slice.start_sector, slice.num_sectors) {
            return Err(Error::OutOfBounds {
                lba: slice.start_sector,
                num_sectors: geometry.num_sectors,
            });
        }

        let index = match usize::try_from(slice.order) {
            Ok(index) if index < taken.len() && !taken[index] => index,
            _ => taken.iter().position(|&t| !t).ok_or(Error::TableFull)?,
        };
        taken[index] = true;

        let part = GptPartition::from_raw(slice);
        let offset = index * entry_size;
        entries[offset..offset + size_of::<GptPartition>()].copy_from_slice(part.as_bytes());
    }

    header.partition_entries_checksum =
        crc32fast::hash(&entries[..header.entry_array_size() as usize]);
    header.seal();

    let backup = header.alternate(backup_entries_lba);

    log::debug!(
        "Writing GPT on {}: {} entries in use",
        device.name(),
        taken.iter().filter(|&&t| t).count()
    );

    device.write_sectors(header.partition_start_lba(), entry_sectors as u32, &entries)?;

    device
        .write_sectors(backup_entries_lba, entry_sectors as u32, &entries)
        .map_err(|source| Error::PartialWrite {
            committed: "primary partition entries",
            source,
        })?;

    device
        .write_sectors(header.lba(), 1, &header.to_sector(geometry.sector_size))
        .map_err(|source| Error::PartialWrite {
            committed: "partition entries",
            source,
        })?;

    if let Err(err) = device.write_sectors(backup.lba(), 1, &backup.to_sector(geometry.sector_size)) {
        log::warn!("Could not write the backup GPT header: {err}");
    }

    Ok(())
}

/// GPT has no logical partitions: any empty slice can hold a partition while the entry array
/// has room.
pub(crate) fn can_create_slice(slices: &[Slice], index: usize) -> CreateKind {
    if !slices.get(index).is_some_and(Slice::is_empty) {
        return CreateKind::None;
    }

    let used = slices.iter().filter(|slice| slice.is_used()).count();

    CreateKind::from_permissions(used < GPT_ENTRY_COUNT as usize, false)
}

#[cfg(test)]
mod tests {
    extern crate std;

    use base64::prelude::*;

    use super::*;
    use crate::{io::MemoryDisk, slice::Extent};

    const GPT_DISK_DUMP: &str = "AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA7gAAAAEAAAD/BwQAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAVapFRkkgUEFSVAAAAQBcAAAAWaj9XQAAAAABAAAAAAAAAP8HBAAAAAAAIgAAAAAAAADeBwQAAAAAABSWWrX/9bRAqBnTWMJ7e4QCAAAAAAAAAIAAAACAAAAAAVHo0AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAK89xg+DhHJHjnk9adhHfeTgKQeQ2MI7RriK9NAozzsNKAAAAAAAAAAnAAIAAAAAAAAAAAAAAAAAcABhAHIAdABfAGEAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAArz3GD4OEckeOeT1p2Ed95EKe9HINBAxMkRpP2yjM5FYoAAIAAAAAACcABAAAAAAAAAAAAAAAAABwAGEAcgB0AF8AYgAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA=";

    const DUMP_SECTORS: u64 = 264_192;

    fn dump_disk() -> MemoryDisk {
        let image = BASE64_STANDARD.decode(GPT_DISK_DUMP).unwrap();

        MemoryDisk::with_image(DiskGeometry::from_sector_count(DUMP_SECTORS, 512), &image).unwrap()
    }

    fn fresh_disk() -> MemoryDisk {
        let mut disk = MemoryDisk::new(DiskGeometry::from_sector_count(2_097_152, 512));
        create(&mut disk).unwrap();

        disk
    }

    fn partition(order: u32, start_sector: u64, num_sectors: u64, name: &str) -> RawSlice {
        RawSlice {
            order,
            tag: GPT_USED_TAG,
            type_guid: LINUX_FILESYSTEM,
            start_sector,
            num_sectors,
            name: name.into(),
            ..RawSlice::default()
        }
    }

    fn read(disk: &mut MemoryDisk, checksum_policy: ChecksumPolicy) -> Result<LabelTable> {
        read_table(disk, &ReadOptions { checksum_policy })
    }

    #[test]
    pub fn parse_gpt_header_from_dump() {
        let mut disk = dump_disk();

        let (copy, anomaly) = read_copy(&mut disk, GPT_HEADER_LBA).unwrap();

        assert!(anomaly.is_none());
        assert_eq!(copy.header.partition_entries_count(), 128);
        assert_eq!(copy.header.lba(), 1);
        assert_eq!(copy.header.alternate_lba(), 264_191);
        assert_eq!(copy.header.last_usable_lba(), 264_158);
        assert_eq!(copy.header.compute_checksum(), copy.header.checksum());
        assert_eq!(
            copy.header.disk_guid(),
            uuid!("B55A9614-F5FF-40B4-A819-D358C27B7B84")
        );
        assert!(probe(&mut disk).unwrap());
    }

    #[test]
    pub fn parse_gpt_partitions() {
        let mut disk = dump_disk();

        let table = read(&mut disk, ChecksumPolicy::Strict).unwrap();

        assert_eq!(table.integrity, Integrity::Verified);
        assert_eq!(
            table.bounds,
            UsableBounds {
                first_usable_sector: 34,
                last_usable_sector: 264_158
            }
        );
        assert_eq!(table.slices.len(), 2);

        let part_a = &table.slices[0];
        assert_eq!(part_a.order, 0);
        assert_eq!(part_a.name, "part_a");
        assert_eq!(part_a.start_sector, 40);
        assert_eq!(part_a.num_sectors, 131_072);
        assert_eq!(part_a.type_guid, LINUX_FILESYSTEM);
        assert_eq!(
            part_a.part_guid,
            uuid!("900729E0-C2D8-463B-B88A-F4D028CF3B0D")
        );

        let part_b = &table.slices[1];
        assert_eq!(part_b.order, 1);
        assert_eq!(part_b.name, "part_b");
        assert_eq!(part_b.start_sector, 131_112);
        assert_eq!(type_description(&part_b.type_guid), "Linux filesystem");
    }

    #[test]
    pub fn dump_without_backup_cannot_recover() {
        let mut disk = dump_disk();
        disk.zero_sector(GPT_HEADER_LBA);

        assert!(matches!(
            read(&mut disk, ChecksumPolicy::Fallback),
            Err(Error::InvalidTable {
                label: LabelType::Gpt,
                ..
            })
        ));
    }

    #[test]
    pub fn gpt_append_partition() {
        let mut disk = dump_disk();

        let mut slices = read(&mut disk, ChecksumPolicy::Strict).unwrap().slices;
        slices.push(partition(2, 262_184, 1000, "part_c"));

        write_table(&mut disk, &slices).unwrap();

        let table = read(&mut disk, ChecksumPolicy::Strict).unwrap();

        assert_eq!(table.slices.len(), 3);
        assert_eq!(table.slices[..2], slices[..2]);
        assert_eq!(table.slices[2].name, "part_c");
        assert!(!table.slices[2].part_guid.is_nil());

        let (primary, _) = read_copy(&mut disk, GPT_HEADER_LBA).unwrap();
        assert_eq!(
            primary.header.disk_guid(),
            uuid!("B55A9614-F5FF-40B4-A819-D358C27B7B84")
        );

        let (backup, anomaly) = read_copy(&mut disk, 264_191).unwrap();
        assert!(anomaly.is_none());
        assert_eq!(backup.header.alternate_lba(), 1);
        assert_eq!(backup.header.partition_start_lba(), 264_159);
        assert_eq!(backup.partitions().filter(|(_, p)| p.is_used()).count(), 3);
    }

    #[test]
    pub fn gpt_remove_partition() {
        let mut disk = dump_disk();

        let mut slices = read(&mut disk, ChecksumPolicy::Strict).unwrap().slices;
        slices.remove(0);

        write_table(&mut disk, &slices).unwrap();

        let table = read(&mut disk, ChecksumPolicy::Strict).unwrap();

        assert_eq!(table.slices.len(), 1);
        assert_eq!(table.slices[0].name, "part_b");
        assert_eq!(table.slices[0].order, 1);
    }

    #[test]
    pub fn create_lays_out_both_copies() {
        let mut disk = fresh_disk();
        let num_sectors = disk.geometry().num_sectors;

        let table = read(&mut disk, ChecksumPolicy::Strict).unwrap();

        assert!(table.slices.is_empty());
        assert_eq!(table.bounds.first_usable_sector, 34);
        assert_eq!(table.bounds.last_usable_sector, num_sectors - 34);

        let (backup, anomaly) = read_copy(&mut disk, num_sectors - 1).unwrap();
        assert!(anomaly.is_none());
        assert_eq!(backup.header.partition_start_lba(), num_sectors - 33);

        let mbr = mbr::Mbr::parse_from_buf(&read_vec(&mut disk, 0, 1).unwrap()).unwrap();
        assert_eq!(mbr.partitions[0].part_type(), mbr::TAG_GPT_PROTECTIVE);
        assert!(probe(&mut disk).unwrap());
    }

    #[test]
    pub fn create_on_tiny_disk_fails() {
        let mut disk = MemoryDisk::new(DiskGeometry::from_sector_count(60, 512));

        assert!(matches!(create(&mut disk), Err(Error::NoSpace { .. })));
    }

    #[test]
    pub fn damaged_entries_follow_checksum_policy() {
        let mut disk = fresh_disk();

        write_table(
            &mut disk,
            &[
                partition(0, 2048, 204_800, "boot"),
                partition(1, 206_848, 409_600, "root"),
            ],
        )
        .unwrap();
        let written = read(&mut disk, ChecksumPolicy::Strict).unwrap().slices;

        disk.zero_sector(2);

        assert!(matches!(
            read(&mut disk, ChecksumPolicy::Strict),
            Err(Error::ChecksumMismatch {
                region: ChecksumRegion::GptEntries,
                ..
            })
        ));

        let ignored = read(&mut disk, ChecksumPolicy::Warn).unwrap();
        assert_eq!(ignored.integrity, Integrity::ChecksumIgnored);
        assert!(ignored.slices.is_empty());

        let recovered = read(&mut disk, ChecksumPolicy::Fallback).unwrap();
        assert_eq!(recovered.integrity, Integrity::RecoveredFromBackup);
        assert_eq!(recovered.slices, written);

        write_table(&mut disk, &recovered.slices).unwrap();

        let repaired = read(&mut disk, ChecksumPolicy::Strict).unwrap();
        assert_eq!(repaired.integrity, Integrity::Verified);
        assert_eq!(repaired.slices, written);
    }

    #[test]
    pub fn damaged_header_is_detected() {
        let mut disk = fresh_disk();

        let mut sector = read_vec(&mut disk, GPT_HEADER_LBA, 1).unwrap();
        sector[40] ^= 0xFF;
        disk.write_sectors(GPT_HEADER_LBA, 1, &sector).unwrap();

        assert!(matches!(
            read(&mut disk, ChecksumPolicy::Strict),
            Err(Error::ChecksumMismatch {
                region: ChecksumRegion::GptHeader,
                ..
            })
        ));
        assert_eq!(
            read(&mut disk, ChecksumPolicy::Fallback).unwrap().integrity,
            Integrity::RecoveredFromBackup
        );
    }

    #[test]
    pub fn colliding_orders_take_free_entries() {
        let mut disk = fresh_disk();

        write_table(
            &mut disk,
            &[partition(0, 2048, 2048, "a"), partition(0, 4096, 2048, "b")],
        )
        .unwrap();

        let table = read(&mut disk, ChecksumPolicy::Strict).unwrap();

        assert_eq!(table.slices[0].order, 0);
        assert_eq!(table.slices[1].order, 1);
        assert_eq!(table.slices[1].name, "b");
    }

    #[test]
    pub fn write_rejects_reserved_sectors() {
        let mut disk = fresh_disk();

        assert!(matches!(
            write_table(&mut disk, &[partition(0, 10, 2048, "early")]),
            Err(Error::OutOfBounds { lba: 10, .. })
        ));
    }

    #[test]
    pub fn names_are_utf16() {
        let raw = partition(0, 40, 10, "données système");
        assert_eq!(GptPartition::from_raw(&raw).name(), "données système");

        let long = partition(0, 40, 10, "abcdefghijklmnopqrstuvwxyz0123456789overflow");
        assert_eq!(
            GptPartition::from_raw(&long).name(),
            "abcdefghijklmnopqrstuvwxyz0123456789"
        );
    }

    #[test]
    pub fn tags_map_to_guids() {
        assert_eq!(guid_for_tag(0x0C), Some(MICROSOFT_BASIC_DATA));
        assert_eq!(tag_for_guid(&MICROSOFT_BASIC_DATA), Some(0x07));
        assert_eq!(tag_for_guid(&EFI_SYSTEM), Some(0xEF));
        assert_eq!(guid_for_tag(0x42), None);
    }

    #[test]
    pub fn any_empty_slice_takes_a_primary() {
        let slices = [Slice::Empty(Extent::new(34, 1000))];

        assert_eq!(can_create_slice(&slices, 0), CreateKind::Primary);
        assert_eq!(can_create_slice(&slices, 1), CreateKind::None);
    }
}
