//! Disk geometry and sector arithmetic.
//!
//! LBA values are authoritative everywhere in this crate; CHS tuples only exist because the
//! MS-DOS partition entries still carry them.

use crate::error::{Error, Result};

const BYTES_PER_MEGABYTE: u64 = 1_048_576;

/// Highest cylinder number representable in the 10-bit CHS cylinder field.
pub const CHS_MAX_CYLINDER: u32 = 1023;

/// Physical description of a disk, as reported by the device.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DiskGeometry {
    /// Size of a sector, in bytes.
    pub sector_size: u32,
    pub sectors_per_track: u32,
    pub heads: u32,
    pub cylinders: u64,

    /// Total number of addressable sectors.
    pub num_sectors: u64,
}

/// Rounding applied when converting sectors to megabytes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Rounding {
    /// Round to the nearest megabyte.
    Natural,

    /// Round up whenever there is a remainder.
    Up,

    /// Truncate.
    Down,
}

/// A cylinder / head / sector address. Sector numbers are 1-based.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Chs {
    pub cylinder: u32,
    pub head: u32,
    pub sector: u32,
}

impl Chs {
    /// Packs this address into the legacy 3-byte MS-DOS entry field.
    ///
    /// Cylinders past 1023 cannot be represented and are clamped to 1023.
    #[must_use]
    pub fn encode(&self) -> [u8; 3] {
        let cylinder = self.cylinder.min(CHS_MAX_CYLINDER);

        [
            (self.head & 0xFF) as u8,
            (self.sector & 0x3F) as u8 | ((cylinder >> 2) & 0xC0) as u8,
            (cylinder & 0xFF) as u8,
        ]
    }

    /// Unpacks the legacy 3-byte MS-DOS entry field.
    #[must_use]
    pub fn decode(bytes: [u8; 3]) -> Self {
        Self {
            cylinder: (u32::from(bytes[1] & 0xC0) << 2) | u32::from(bytes[2]),
            head: u32::from(bytes[0]),
            sector: u32::from(bytes[1] & 0x3F),
        }
    }
}

impl DiskGeometry {
    /// Synthesizes the customary 255 heads / 63 sectors-per-track geometry for a disk of
    /// `num_sectors` sectors, as used for raw images that carry no geometry of their own.
    #[must_use]
    pub fn from_sector_count(num_sectors: u64, sector_size: u32) -> Self {
        const HEADS: u32 = 255;
        const SECTORS_PER_TRACK: u32 = 63;

        Self {
            sector_size,
            sectors_per_track: SECTORS_PER_TRACK,
            heads: HEADS,
            cylinders: num_sectors.div_ceil(u64::from(HEADS * SECTORS_PER_TRACK)),
            num_sectors,
        }
    }

    #[must_use]
    pub fn sectors_per_cylinder(&self) -> u64 {
        u64::from(self.heads) * u64::from(self.sectors_per_track)
    }

    /// Number of sectors in one megabyte (MiB) on this disk.
    #[must_use]
    pub fn sectors_per_megabyte(&self) -> u64 {
        (BYTES_PER_MEGABYTE / u64::from(self.sector_size.max(1))).max(1)
    }

    /// Converts a logical sector number into a CHS address.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfBounds`] if `lba` is not a sector of this disk.
    pub fn lba_to_chs(&self, lba: u64) -> Result<Chs> {
        if lba >= self.num_sectors {
            return Err(Error::OutOfBounds {
                lba,
                num_sectors: self.num_sectors,
            });
        }

        let per_cylinder = self.sectors_per_cylinder().max(1);
        let per_track = u64::from(self.sectors_per_track.max(1));

        Ok(Chs {
            cylinder: u32::try_from(lba / per_cylinder).unwrap_or(u32::MAX),
            head: ((lba % per_cylinder) / per_track) as u32,
            sector: ((lba % per_track) + 1) as u32,
        })
    }

    /// Converts a CHS address back into a logical sector number.
    #[must_use]
    pub fn chs_to_lba(&self, chs: Chs) -> u64 {
        u64::from(chs.cylinder) * self.sectors_per_cylinder()
            + u64::from(chs.head) * u64::from(self.sectors_per_track)
            + u64::from(chs.sector.saturating_sub(1))
    }

    #[must_use]
    pub fn sectors_to_megabytes(&self, sectors: u64, rounding: Rounding) -> u64 {
        let per_mb = self.sectors_per_megabyte();

        match rounding {
            Rounding::Natural => (sectors + per_mb / 2) / per_mb,
            Rounding::Up => sectors.div_ceil(per_mb),
            Rounding::Down => sectors / per_mb,
        }
    }

    #[must_use]
    pub fn megabytes_to_sectors(&self, megabytes: u64) -> u64 {
        megabytes * self.sectors_per_megabyte()
    }

    /// Rounds `sector` up to the next megabyte boundary.
    #[must_use]
    pub fn round_up_to_megabyte(&self, sector: u64) -> u64 {
        sector.next_multiple_of(self.sectors_per_megabyte())
    }

    /// Rounds `sector` up to the next cylinder boundary.
    #[must_use]
    pub fn round_up_to_cylinder(&self, sector: u64) -> u64 {
        sector.next_multiple_of(self.sectors_per_cylinder().max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn one_gib() -> DiskGeometry {
        DiskGeometry {
            sector_size: 512,
            sectors_per_track: 63,
            heads: 255,
            cylinders: 131,
            num_sectors: 2_097_152,
        }
    }

    #[test]
    pub fn lba_to_chs_conversion() {
        let disk = one_gib();

        assert_eq!(
            disk.lba_to_chs(0).unwrap(),
            Chs {
                cylinder: 0,
                head: 0,
                sector: 1
            }
        );
        assert_eq!(
            disk.lba_to_chs(16065 + 63 + 5).unwrap(),
            Chs {
                cylinder: 1,
                head: 1,
                sector: 6
            }
        );
        assert_eq!(disk.chs_to_lba(disk.lba_to_chs(123_456).unwrap()), 123_456);
    }

    #[test]
    pub fn lba_outside_disk_is_rejected() {
        let disk = one_gib();

        assert!(matches!(
            disk.lba_to_chs(disk.num_sectors),
            Err(Error::OutOfBounds { .. })
        ));
    }

    #[test]
    pub fn chs_cylinder_is_clamped() {
        let chs = Chs {
            cylinder: 5000,
            head: 254,
            sector: 63,
        };

        let decoded = Chs::decode(chs.encode());

        assert_eq!(decoded.cylinder, CHS_MAX_CYLINDER);
        assert_eq!(decoded.head, 254);
        assert_eq!(decoded.sector, 63);
    }

    #[test]
    pub fn megabyte_rounding() {
        let disk = one_gib();

        assert_eq!(disk.sectors_per_megabyte(), 2048);
        assert_eq!(disk.sectors_to_megabytes(3071, Rounding::Natural), 1);
        assert_eq!(disk.sectors_to_megabytes(3072, Rounding::Natural), 2);
        assert_eq!(disk.sectors_to_megabytes(2049, Rounding::Up), 2);
        assert_eq!(disk.sectors_to_megabytes(4095, Rounding::Down), 1);
        assert_eq!(disk.megabytes_to_sectors(100), 204_800);
        assert_eq!(disk.round_up_to_megabyte(1), 2048);
        assert_eq!(disk.round_up_to_cylinder(2048), 16065);
    }
}
