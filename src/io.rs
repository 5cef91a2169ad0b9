//! Sector-level access to disks.
//!
//! The partition table engine never touches a device directly: everything goes through
//! [`BlockDevice`], which only moves whole sectors.

use alloc::{boxed::Box, collections::BTreeMap, vec, vec::Vec};

use crate::{error::IoError, geometry::DiskGeometry};

/// Number of sectors moved per round trip by [`copy_sectors`].
const COPY_CHUNK_SECTORS: u32 = 2048;

/// A disk addressed in whole sectors.
pub trait BlockDevice {
    /// Geometry of the disk. It must not change while a table is open on it.
    fn geometry(&self) -> DiskGeometry;

    /// Short device name (`"hd0"`, `"sda"`, ...) used to name the partitions on it.
    fn name(&self) -> &str {
        "disk"
    }

    /// Reads `count` sectors starting at `lba` into `buf`, which holds exactly
    /// `count * sector_size` bytes.
    fn read_sectors(&mut self, lba: u64, count: u32, buf: &mut [u8]) -> Result<(), IoError>;

    /// Writes `count` sectors starting at `lba` from `buf`, which holds exactly
    /// `count * sector_size` bytes.
    fn write_sectors(&mut self, lba: u64, count: u32, buf: &[u8]) -> Result<(), IoError>;
}

impl<D: BlockDevice + ?Sized> BlockDevice for &mut D {
    fn geometry(&self) -> DiskGeometry {
        (**self).geometry()
    }

    fn name(&self) -> &str {
        (**self).name()
    }

    fn read_sectors(&mut self, lba: u64, count: u32, buf: &mut [u8]) -> Result<(), IoError> {
        (**self).read_sectors(lba, count, buf)
    }

    fn write_sectors(&mut self, lba: u64, count: u32, buf: &[u8]) -> Result<(), IoError> {
        (**self).write_sectors(lba, count, buf)
    }
}

/// Reads `count` sectors at `lba` into a freshly allocated buffer.
pub(crate) fn read_vec<D: BlockDevice + ?Sized>(
    device: &mut D,
    lba: u64,
    count: u32,
) -> Result<Vec<u8>, IoError> {
    let sector_size = device.geometry().sector_size as usize;
    let mut buf = vec![0u8; sector_size * count as usize];

    device.read_sectors(lba, count, &mut buf)?;

    Ok(buf)
}

fn check_range(geometry: &DiskGeometry, lba: u64, count: u32, len: usize) -> Result<(), IoError> {
    if lba.saturating_add(u64::from(count)) > geometry.num_sectors {
        return Err(IoError::OutOfRange { lba, count });
    }

    if len != count as usize * geometry.sector_size as usize {
        return Err(IoError::BufferSize(len));
    }

    Ok(())
}

/// Copies `count` sectors from `from` to `to` on the same device.
///
/// Overlapping ranges are handled by copying from the end when moving data towards higher
/// sectors, so this can relocate a partition in place.
pub fn copy_sectors<D: BlockDevice + ?Sized>(
    device: &mut D,
    from: u64,
    to: u64,
    count: u64,
) -> Result<(), IoError> {
    if from == to || count == 0 {
        return Ok(());
    }

    let sector_size = device.geometry().sector_size as usize;
    let mut buf = vec![0u8; sector_size * COPY_CHUNK_SECTORS as usize];
    let mut done = 0u64;

    log::debug!("Copying {count} sectors from {from} to {to}");

    while done < count {
        let chunk = (count - done).min(u64::from(COPY_CHUNK_SECTORS)) as u32;
        let offset = if to > from {
            count - done - u64::from(chunk)
        } else {
            done
        };
        let bytes = &mut buf[..chunk as usize * sector_size];

        device.read_sectors(from + offset, chunk, bytes)?;
        device.write_sectors(to + offset, chunk, bytes)?;

        done += u64::from(chunk);
    }

    Ok(())
}

/// A sparse disk held in memory. Sectors that were never written read back as zeros.
#[derive(Clone, Debug)]
pub struct MemoryDisk {
    geometry: DiskGeometry,
    name: &'static str,
    sectors: BTreeMap<u64, Box<[u8]>>,
}

impl MemoryDisk {
    #[must_use]
    pub fn new(geometry: DiskGeometry) -> Self {
        Self {
            geometry,
            name: "mem0",
            sectors: BTreeMap::new(),
        }
    }

    /// Creates a disk whose first sectors hold `image`. The image is zero-padded to a whole
    /// number of sectors and must fit in the geometry.
    pub fn with_image(geometry: DiskGeometry, image: &[u8]) -> Result<Self, IoError> {
        let mut disk = Self::new(geometry);
        let sector_size = geometry.sector_size as usize;

        for (lba, chunk) in (0u64..).zip(image.chunks(sector_size)) {
            let mut sector = vec![0u8; sector_size];
            sector[..chunk.len()].copy_from_slice(chunk);

            disk.write_sectors(lba, 1, &sector)?;
        }

        Ok(disk)
    }

    #[must_use]
    pub fn named(mut self, name: &'static str) -> Self {
        self.name = name;
        self
    }

    /// Overwrites one sector with zeros.
    pub fn zero_sector(&mut self, lba: u64) {
        self.sectors.remove(&lba);
    }
}

impl BlockDevice for MemoryDisk {
    fn geometry(&self) -> DiskGeometry {
        self.geometry
    }

    fn name(&self) -> &str {
        self.name
    }

    fn read_sectors(&mut self, lba: u64, count: u32, buf: &mut [u8]) -> Result<(), IoError> {
        check_range(&self.geometry, lba, count, buf.len())?;

        let sector_size = self.geometry.sector_size as usize;

        for (sector_lba, dest) in (lba..).zip(buf.chunks_mut(sector_size)) {
            match self.sectors.get(&sector_lba) {
                Some(data) => dest.copy_from_slice(data),
                None => dest.fill(0),
            }
        }

        Ok(())
    }

    fn write_sectors(&mut self, lba: u64, count: u32, buf: &[u8]) -> Result<(), IoError> {
        check_range(&self.geometry, lba, count, buf.len())?;

        let sector_size = self.geometry.sector_size as usize;

        for (sector_lba, src) in (lba..).zip(buf.chunks(sector_size)) {
            if src.iter().all(|&b| b == 0) {
                self.sectors.remove(&sector_lba);
            } else {
                self.sectors.insert(sector_lba, src.into());
            }
        }

        Ok(())
    }
}

#[cfg(feature = "std")]
pub use self::std_disk::StdDisk;

#[cfg(feature = "std")]
mod std_disk {
    use std::io::{Read, Seek, SeekFrom, Write};

    use super::{check_range, BlockDevice};
    use crate::{error::IoError, geometry::DiskGeometry};

    /// Adapts anything implementing [`Read`], [`Write`] and [`Seek`] (a file, a block device
    /// node, a [`std::io::Cursor`]) into a [`BlockDevice`].
    pub struct StdDisk<T> {
        inner: T,
        geometry: DiskGeometry,
        name: std::string::String,
    }

    impl<T: Read + Write + Seek> StdDisk<T> {
        pub fn new(inner: T, geometry: DiskGeometry) -> Self {
            Self {
                inner,
                geometry,
                name: "disk".into(),
            }
        }

        /// Measures the stream and synthesizes a geometry for it.
        pub fn from_stream(mut inner: T, sector_size: u32) -> std::io::Result<Self> {
            let len = inner.seek(SeekFrom::End(0))?;
            let geometry = DiskGeometry::from_sector_count(len / u64::from(sector_size), sector_size);

            Ok(Self::new(inner, geometry))
        }

        #[must_use]
        pub fn named(mut self, name: &str) -> Self {
            self.name = name.into();
            self
        }

        pub fn into_inner(self) -> T {
            self.inner
        }

        fn seek_to(&mut self, lba: u64) -> std::io::Result<u64> {
            self.inner
                .seek(SeekFrom::Start(lba * u64::from(self.geometry.sector_size)))
        }
    }

    impl<T: Read + Write + Seek> BlockDevice for StdDisk<T> {
        fn geometry(&self) -> DiskGeometry {
            self.geometry
        }

        fn name(&self) -> &str {
            &self.name
        }

        fn read_sectors(&mut self, lba: u64, count: u32, buf: &mut [u8]) -> Result<(), IoError> {
            check_range(&self.geometry, lba, count, buf.len())?;

            self.seek_to(lba)
                .and_then(|_| self.inner.read_exact(buf))
                .map_err(|err| {
                    log::error!("Reading {count} sectors at {lba} failed: {err}");
                    IoError::Read(lba)
                })
        }

        fn write_sectors(&mut self, lba: u64, count: u32, buf: &[u8]) -> Result<(), IoError> {
            check_range(&self.geometry, lba, count, buf.len())?;

            self.seek_to(lba)
                .and_then(|_| self.inner.write_all(buf))
                .and_then(|()| self.inner.flush())
                .map_err(|err| {
                    log::error!("Writing {count} sectors at {lba} failed: {err}");
                    IoError::Write(lba)
                })
        }
    }
}
