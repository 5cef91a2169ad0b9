//! The partition table manager.
//!
//! A [`PartitionTable`] holds the label read from one disk as an ordered list of
//! [`Slice`]s covering every sector of it exactly once. Editing operations check their
//! arguments first and only then replace the list, so a rejected operation leaves the table
//! untouched. Nothing reaches the disk before [`PartitionTable::write`].

use alloc::{
    boxed::Box,
    format,
    string::{String, ToString},
    vec::Vec,
};

use crate::{
    error::{Error, Result},
    geometry::{DiskGeometry, Rounding},
    gpt,
    io::BlockDevice,
    label::{Capabilities, CreateKind, DiskLabel, Integrity, LabelType, ReadOptions, UsableBounds},
    slice::{
        Extent, FilesystemProbe, FsInfo, RawSlice, Slice, SliceFlags, SliceKind, SliceType,
        UsedSlice,
    },
};

/// Options of a [`PartitionTable`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TableOptions {
    pub read: ReadOptions,
}

/// Data relocation implied by [`PartitionTable::move_slice`].
///
/// The table only records the new position; the caller copies the sectors, for example with
/// [`copy_sectors`](crate::copy_sectors), before or after writing the table.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SliceMove {
    pub from_sector: u64,
    pub to_sector: u64,
    pub num_sectors: u64,
}

/// Outcome of [`PartitionTable::resize_slice`].
///
/// A filesystem must be shrunk before its slice is, and a slice grown before its filesystem.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResizeDirection {
    Grow,
    Shrink,
    Unchanged,
}

#[derive(Clone, Debug)]
struct ClipboardEntry {
    raw: RawSlice,
    source_disk: String,
    source_label: LabelType,
    sector_size: u32,
}

/// Holds the last slice copied with [`PartitionTable::copy_slice`].
///
/// It is owned by the caller, so one clipboard can be shared by the tables of several disks.
/// Copying again replaces the previous content.
#[derive(Clone, Debug, Default)]
pub struct Clipboard {
    entry: Option<ClipboardEntry>,
}

impl Clipboard {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entry.is_none()
    }

    #[must_use]
    pub fn slice(&self) -> Option<&RawSlice> {
        self.entry.as_ref().map(|entry| &entry.raw)
    }

    /// Name of the disk the slice was copied from.
    #[must_use]
    pub fn source_disk(&self) -> Option<&str> {
        self.entry.as_ref().map(|entry| entry.source_disk.as_str())
    }

    #[must_use]
    pub fn source_label(&self) -> Option<LabelType> {
        self.entry.as_ref().map(|entry| entry.source_label)
    }

    pub fn clear(&mut self) {
        self.entry = None;
    }
}

/// The partition table of one disk, being edited.
///
/// # Examples
///
/// ```
/// use disklabel::{DiskGeometry, LabelType, MemoryDisk, PartitionTable, SliceKind, TableOptions};
///
/// let disk = MemoryDisk::new(DiskGeometry::from_sector_count(2_097_152, 512)).named("hd0");
/// let mut table = PartitionTable::create(disk, LabelType::MsDos, TableOptions::default()).unwrap();
///
/// let index = table.create_slice(0, 2048, 204_800, SliceKind::Primary).unwrap();
/// assert_eq!(table.slices()[index].as_used().unwrap().device_name, "hd0a");
///
/// table.write().unwrap();
/// assert!(!table.has_changes());
/// ```
pub struct PartitionTable<D: BlockDevice> {
    device: D,
    geometry: DiskGeometry,
    label: DiskLabel,
    options: TableOptions,
    bounds: UsableBounds,
    integrity: Integrity,

    /// Entries as last read from the disk, restored by [`PartitionTable::undo`].
    raw_slices: Vec<RawSlice>,
    slices: Vec<Slice>,
    selected: usize,
    changes_pending: u32,
    probe: Option<Box<dyn FilesystemProbe>>,
}

impl<D: BlockDevice> PartitionTable<D> {
    /// Reads the label of `device`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownLabel`] if the disk carries neither an MS-DOS nor a GPT label,
    /// or the error of the label read.
    pub fn open(mut device: D, options: TableOptions) -> Result<Self> {
        let label = DiskLabel::detect(&mut device)?.ok_or(Error::UnknownLabel)?;

        Self::load(device, label, options)
    }

    /// Writes a new, empty label of type `label_type` on `device` and opens it.
    ///
    /// Any table previously on the disk is lost.
    pub fn create(mut device: D, label_type: LabelType, options: TableOptions) -> Result<Self> {
        let label = DiskLabel::new(label_type);
        label.create(&mut device)?;

        Self::load(device, label, options)
    }

    fn load(device: D, label: DiskLabel, options: TableOptions) -> Result<Self> {
        let mut table = Self {
            geometry: device.geometry(),
            device,
            label,
            options,
            bounds: UsableBounds::default(),
            integrity: Integrity::Verified,
            raw_slices: Vec::new(),
            slices: Vec::new(),
            selected: 0,
            changes_pending: 0,
            probe: None,
        };
        table.refresh()?;

        Ok(table)
    }

    /// Uses `probe` to fill in the filesystem of every partition.
    pub fn set_probe(&mut self, probe: Box<dyn FilesystemProbe>) {
        self.probe = Some(probe);
        self.slices = self.rebuild_gaps(self.used_raws());
    }

    /// Reads the table from the disk again, dropping every pending change.
    pub fn refresh(&mut self) -> Result<()> {
        let table = self.label.read_table(&mut self.device, &self.options.read)?;
        self.check_layout(&table.slices, &table.bounds)?;

        self.bounds = table.bounds;
        self.integrity = table.integrity;
        self.raw_slices = table.slices;
        self.slices = self.rebuild_gaps(self.raw_slices.clone());
        self.changes_pending = 0;
        self.clamp_selection();

        Ok(())
    }

    #[must_use]
    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn device_mut(&mut self) -> &mut D {
        &mut self.device
    }

    pub fn into_device(self) -> D {
        self.device
    }

    #[must_use]
    pub fn geometry(&self) -> &DiskGeometry {
        &self.geometry
    }

    #[must_use]
    pub fn label(&self) -> DiskLabel {
        self.label
    }

    #[must_use]
    pub fn label_type(&self) -> LabelType {
        self.label.label_type()
    }

    #[must_use]
    pub fn bounds(&self) -> UsableBounds {
        self.bounds
    }

    /// How the table was obtained by the last read.
    #[must_use]
    pub fn integrity(&self) -> Integrity {
        self.integrity
    }

    #[must_use]
    pub fn slices(&self) -> &[Slice] {
        &self.slices
    }

    /// The entries as last read from the disk.
    #[must_use]
    pub fn raw_slices(&self) -> &[RawSlice] {
        &self.raw_slices
    }

    #[must_use]
    pub fn selected(&self) -> usize {
        self.selected
    }

    pub fn select(&mut self, index: usize) -> Result<()> {
        if index >= self.slices.len() {
            return Err(Error::NoSuchSlice(index));
        }

        self.selected = index;
        Ok(())
    }

    /// Number of changes made since the table was last read or written.
    #[must_use]
    pub fn changes_pending(&self) -> u32 {
        self.changes_pending
    }

    #[must_use]
    pub fn has_changes(&self) -> bool {
        self.changes_pending != 0
    }

    /// Asks the filesystem probe about the content of a partition.
    #[must_use]
    pub fn fs_info(&self, index: usize) -> Option<FsInfo> {
        let used = self.slices.get(index)?.as_used()?;

        self.probe.as_ref()?.probe(&used.device_name, &used.raw)
    }

    /// Decides what may be created in the empty slice at `index`.
    #[must_use]
    pub fn can_create(&self, index: usize) -> CreateKind {
        let allowed = self.label.can_create_slice(&self.slices, index);
        let fits = |kind| {
            self.placement_window(index, kind)
                .is_ok_and(|window| window.num_sectors != 0)
        };

        CreateKind::from_permissions(
            allowed.allows_primary() && fits(SliceKind::Primary),
            allowed.allows_logical() && fits(SliceKind::Logical),
        )
    }

    /// Creates a partition of the default type in the empty slice at `index`.
    ///
    /// Returns the index of the new slice, which becomes the selected one.
    ///
    /// # Errors
    ///
    /// * [`Error::NoSuchSlice`] if `index` is not an empty slice.
    /// * [`Error::InvalidPlacement`] if `kind` cannot be created there, or `start_sector` is
    ///   not a sector a partition may start at.
    /// * [`Error::NoSpace`] if the partition does not fit.
    /// * [`Error::TableFull`] if no table entry is left.
    pub fn create_slice(
        &mut self,
        index: usize,
        start_sector: u64,
        num_sectors: u64,
        kind: SliceKind,
    ) -> Result<usize> {
        let raw = RawSlice {
            kind,
            start_sector,
            num_sectors,
            ..RawSlice::default()
        };
        let raw = self.with_type(raw, self.label.default_slice_type())?;

        self.check_placement(index, &raw)?;

        log::debug!(
            "Creating {kind:?} slice at {start_sector}, {num_sectors} sectors, in slice {index}"
        );

        self.insert(raw)
    }

    /// Deletes the partition at `index`.
    ///
    /// Partitions of the same kind that came after it in the table move up one entry.
    pub fn delete_slice(&mut self, index: usize) -> Result<()> {
        let position = self.raw_position(index)?;
        let mut raws = self.used_raws();
        let removed = raws.remove(position);

        for raw in raws
            .iter_mut()
            .filter(|raw| raw.kind == removed.kind && raw.order > removed.order)
        {
            raw.order -= 1;
        }

        log::debug!("Deleting slice {index} (entry {})", removed.order);

        self.commit(raws);
        Ok(())
    }

    /// Deletes every partition.
    pub fn delete_all(&mut self) {
        self.commit(Vec::new());
    }

    /// Moves the partition at `index` so that it starts at `new_start_sector`.
    ///
    /// The partition may only move within the free space directly next to it. Only the
    /// table is updated; the returned [`SliceMove`] describes the data copy the caller has to
    /// perform.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidPlacement`] if there is no free space next to the partition,
    /// and [`Error::WouldOverlap`] if the new position leaves that free space.
    pub fn move_slice(&mut self, index: usize, new_start_sector: u64) -> Result<SliceMove> {
        let position = self.raw_position(index)?;
        let Some(used) = self.slices[index].as_used() else {
            return Err(Error::NoSuchSlice(index));
        };

        let raw = &used.raw;
        let slice_move = SliceMove {
            from_sector: raw.start_sector,
            to_sector: new_start_sector,
            num_sectors: raw.num_sectors,
        };

        if new_start_sector == raw.start_sector {
            return Ok(slice_move);
        }

        let prev_empty = index
            .checked_sub(1)
            .and_then(|prev| self.slices[prev].as_empty());
        let next_empty = self.slices.get(index + 1).and_then(Slice::as_empty);

        if prev_empty.is_none() && next_empty.is_none() {
            return Err(Error::InvalidPlacement("no free space next to the slice"));
        }

        let from = prev_empty.map_or(used.extent().start_sector, |empty| empty.start_sector);
        let to = next_empty.map_or(used.extent().end_sector(), |empty| empty.end_sector());
        let after = index + if next_empty.is_some() { 2 } else { 1 };
        let window = self.clamp_range(from, to, raw.kind, after);

        if new_start_sector < window.start_sector
            || new_start_sector > window.end_sector().saturating_sub(raw.num_sectors)
        {
            return Err(Error::WouldOverlap {
                start: new_start_sector,
                num_sectors: raw.num_sectors,
            });
        }

        let mut raws = self.used_raws();
        raws[position].start_sector = new_start_sector;

        log::debug!(
            "Moving slice {index} from {} to {new_start_sector}",
            slice_move.from_sector
        );

        self.commit(raws);
        self.select_start(new_start_sector);

        Ok(slice_move)
    }

    /// Changes the size of the partition at `index`.
    ///
    /// A partition can grow into the free space directly after it and shrink down to one
    /// sector.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoSpace`] if the free space after the partition is too small.
    pub fn resize_slice(&mut self, index: usize, new_num_sectors: u64) -> Result<ResizeDirection> {
        let position = self.raw_position(index)?;
        let Some(used) = self.slices[index].as_used() else {
            return Err(Error::NoSuchSlice(index));
        };

        let raw = &used.raw;

        if new_num_sectors == 0 {
            return Err(Error::InvalidPlacement("a slice needs at least one sector"));
        }

        let direction = match new_num_sectors.cmp(&raw.num_sectors) {
            core::cmp::Ordering::Greater => ResizeDirection::Grow,
            core::cmp::Ordering::Less => ResizeDirection::Shrink,
            core::cmp::Ordering::Equal => return Ok(ResizeDirection::Unchanged),
        };

        if direction == ResizeDirection::Grow {
            let next_empty = self.slices.get(index + 1).and_then(Slice::as_empty);
            let to = next_empty.map_or(used.extent().end_sector(), |empty| empty.end_sector());
            let after = index + if next_empty.is_some() { 2 } else { 1 };
            let window = self.clamp_range(raw.start_sector, to, SliceKind::Primary, after);
            let available = window.end_sector().saturating_sub(raw.start_sector);

            if new_num_sectors > available {
                return Err(Error::NoSpace {
                    requested: new_num_sectors,
                    available,
                });
            }
        }

        let mut raws = self.used_raws();
        raws[position].num_sectors = new_num_sectors;

        log::debug!("Resizing slice {index} to {new_num_sectors} sectors");

        self.commit(raws);

        Ok(direction)
    }

    /// Puts a copy of the partition at `index` in `clipboard`.
    pub fn copy_slice(&self, index: usize, clipboard: &mut Clipboard) -> Result<()> {
        let used = self
            .slices
            .get(index)
            .and_then(Slice::as_used)
            .ok_or(Error::NoSuchSlice(index))?;

        clipboard.entry = Some(ClipboardEntry {
            raw: used.raw.clone(),
            source_disk: self.device.name().to_string(),
            source_label: self.label_type(),
            sector_size: self.geometry.sector_size,
        });

        Ok(())
    }

    /// Creates a partition like the one in `clipboard` in the empty slice at `index`.
    ///
    /// The partition starts at the first megabyte boundary of the free space. Its type is
    /// translated when the clipboard comes from a disk with another label.
    ///
    /// # Errors
    ///
    /// * [`Error::InvalidPlacement`] if the clipboard is empty or no partition can be
    ///   created at `index`.
    /// * [`Error::LabelMismatch`] if the disks have different sector sizes.
    /// * [`Error::NoSpace`] if the partition does not fit.
    pub fn paste_slice(&mut self, index: usize, clipboard: &Clipboard) -> Result<usize> {
        let entry = clipboard
            .entry
            .as_ref()
            .ok_or(Error::InvalidPlacement("the clipboard is empty"))?;

        if entry.sector_size != self.geometry.sector_size {
            return Err(Error::LabelMismatch("the disks have different sector sizes"));
        }

        let allowed = self.can_create(index);
        let kind = if allowed.allows_primary() {
            SliceKind::Primary
        } else if allowed.allows_logical() {
            SliceKind::Logical
        } else {
            return Err(Error::InvalidPlacement("no slice can be created here"));
        };

        let window = self.placement_window(index, kind)?;
        let start_sector = self.geometry.round_up_to_megabyte(window.start_sector);
        let num_sectors = entry.raw.num_sectors;
        let available = window.end_sector().saturating_sub(start_sector);

        if num_sectors > available {
            return Err(Error::NoSpace {
                requested: num_sectors,
                available,
            });
        }

        // One active partition per disk at most.
        let same_label = entry.source_label == self.label_type();
        let active_taken = self
            .slices
            .iter()
            .filter_map(Slice::as_used)
            .any(|used| used.raw.is_bootable());
        let mut flags = SliceFlags::empty();
        if same_label && !active_taken {
            flags.set(SliceFlags::BOOTABLE, entry.raw.is_bootable());
        }

        let raw = RawSlice {
            kind,
            flags,
            attributes: if same_label { entry.raw.attributes } else { 0 },
            name: if self.label == DiskLabel::Gpt {
                entry.raw.name.clone()
            } else {
                String::new()
            },
            start_sector,
            num_sectors,
            ..RawSlice::default()
        };
        let raw = self.with_type(raw, self.label.convert_type(&entry.raw, entry.source_label))?;

        log::debug!(
            "Pasting slice from {} at {start_sector}, {num_sectors} sectors",
            entry.source_disk
        );

        self.insert(raw)
    }

    /// Reassigns the table entries of the primary partitions.
    ///
    /// `slice_indices` lists the index of every primary partition, in the order their
    /// entries should have. The entries in use stay the same, only who gets which changes.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidPlacement`] if `slice_indices` is not a permutation of the
    /// primary partitions.
    pub fn reorder_primary_slices(&mut self, slice_indices: &[usize]) -> Result<()> {
        let primaries: Vec<usize> = self
            .slices
            .iter()
            .enumerate()
            .filter(|(_, slice)| slice.is_used() && !slice.is_logical())
            .map(|(index, _)| index)
            .collect();

        let mut requested = slice_indices.to_vec();
        requested.sort_unstable();

        if requested != primaries {
            return Err(Error::InvalidPlacement(
                "the new order must list every primary slice once",
            ));
        }

        let mut orders: Vec<u32> = primaries
            .iter()
            .filter_map(|&index| self.slices[index].as_used())
            .map(|used| used.raw.order)
            .collect();
        orders.sort_unstable();

        let mut raws = self.used_raws();

        for (&index, order) in slice_indices.iter().zip(orders) {
            let position = self.raw_position(index)?;
            raws[position].order = order;
        }

        self.commit(raws);

        Ok(())
    }

    /// Swaps the table entries of two primary partitions.
    pub fn swap_order(&mut self, first: usize, second: usize) -> Result<()> {
        let a = self.raw_position(first)?;
        let b = self.raw_position(second)?;
        let mut raws = self.used_raws();

        if raws[a].is_logical() || raws[b].is_logical() {
            return Err(Error::InvalidPlacement(
                "logical slices are ordered by their position",
            ));
        }

        let order = raws[a].order;
        raws[a].order = raws[b].order;
        raws[b].order = order;

        self.commit(raws);
        Ok(())
    }

    /// Makes the partition at `index` the bootable one, or clears the flag if it already is.
    pub fn set_active(&mut self, index: usize) -> Result<()> {
        if !self.label.capabilities().contains(Capabilities::ACTIVE) {
            return Err(Error::Unsupported(self.label_type()));
        }

        let position = self.raw_position(index)?;
        let mut raws = self.used_raws();
        let activate = !raws[position].is_bootable();

        for (i, raw) in raws.iter_mut().enumerate() {
            raw.flags.set(SliceFlags::BOOTABLE, activate && i == position);
        }

        self.commit(raws);
        Ok(())
    }

    pub fn set_slice_type(&mut self, index: usize, slice_type: SliceType) -> Result<()> {
        let position = self.raw_position(index)?;
        let mut raws = self.used_raws();

        self.label.set_slice_type(&mut raws[position], slice_type)?;

        self.commit(raws);
        Ok(())
    }

    /// Hides the partition at `index` or reveals it if hidden.
    pub fn hide_slice(&mut self, index: usize) -> Result<()> {
        let position = self.raw_position(index)?;
        let mut raws = self.used_raws();

        self.label.hide(&mut raws[position])?;

        self.commit(raws);
        Ok(())
    }

    /// Writes the table to the disk, then reads it back.
    ///
    /// On failure the pending changes are kept.
    pub fn write(&mut self) -> Result<()> {
        let raws = self.used_raws();

        log::debug!(
            "Writing {} table of {} with {} partitions",
            self.label_type(),
            self.device.name(),
            raws.len()
        );

        self.label.write_table(&mut self.device, &raws)?;
        self.refresh()
    }

    /// Drops every pending change.
    pub fn undo(&mut self) {
        self.slices = self.rebuild_gaps(self.raw_slices.clone());
        self.changes_pending = 0;
        self.clamp_selection();
    }

    /// Rejects a table read from disk whose partitions cannot be laid out one after the other.
    fn check_layout(&self, raws: &[RawSlice], bounds: &UsableBounds) -> Result<()> {
        let num_sectors = self.geometry.num_sectors;
        let mut used: Vec<&RawSlice> = raws
            .iter()
            .filter(|raw| self.label.is_used(raw))
            .collect();
        used.sort_by_key(|raw| raw.start_sector);

        let mut cursor = bounds.first_usable_sector.min(num_sectors);

        for raw in used {
            let reason = if raw.start_sector < cursor {
                "partitions overlap"
            } else if raw.start_sector >= num_sectors
                || raw.num_sectors > num_sectors - raw.start_sector
            {
                "a partition extends past the end of the disk"
            } else {
                cursor = raw.end_sector();
                continue;
            };

            log::warn!(
                "{}: partition {} at sector {} is unusable: {reason}",
                self.device.name(),
                raw.order,
                raw.start_sector
            );

            return Err(Error::InvalidTable {
                label: self.label_type(),
                reason,
            });
        }

        Ok(())
    }

    fn used_raws(&self) -> Vec<RawSlice> {
        self.slices
            .iter()
            .filter_map(Slice::as_used)
            .map(|used| used.raw.clone())
            .collect()
    }

    /// Position in [`Self::used_raws`] of the partition at `index`.
    fn raw_position(&self, index: usize) -> Result<usize> {
        if !self.slices.get(index).is_some_and(Slice::is_used) {
            return Err(Error::NoSuchSlice(index));
        }

        Ok(self.slices[..index].iter().filter(|s| s.is_used()).count())
    }

    fn commit(&mut self, raws: Vec<RawSlice>) {
        self.slices = self.rebuild_gaps(raws);
        self.changes_pending += 1;
        self.clamp_selection();
    }

    fn clamp_selection(&mut self) {
        self.selected = self.selected.min(self.slices.len().saturating_sub(1));
    }

    fn select_start(&mut self, start_sector: u64) -> usize {
        if let Some(index) = self.slices.iter().position(|slice| {
            slice
                .as_used()
                .is_some_and(|used| used.raw.start_sector == start_sector)
        }) {
            self.selected = index;
        }

        self.selected
    }

    /// Gives `raw` its type, filling the fields the label keys on.
    fn with_type(&self, mut raw: RawSlice, slice_type: SliceType) -> Result<RawSlice> {
        if self.label == DiskLabel::Gpt {
            raw.tag = gpt::GPT_USED_TAG;
        }

        self.label.set_slice_type(&mut raw, slice_type)?;

        Ok(raw)
    }

    fn check_placement(&self, index: usize, raw: &RawSlice) -> Result<()> {
        if !self.slices.get(index).is_some_and(Slice::is_empty) {
            return Err(Error::NoSuchSlice(index));
        }

        let allowed = self.can_create(index);
        let permitted = match raw.kind {
            SliceKind::Primary => allowed.allows_primary(),
            SliceKind::Logical => allowed.allows_logical(),
        };

        if !permitted {
            return Err(Error::InvalidPlacement(
                "this kind of slice cannot be created here",
            ));
        }

        if raw.num_sectors == 0 {
            return Err(Error::InvalidPlacement("a slice needs at least one sector"));
        }

        let window = self.placement_window(index, raw.kind)?;

        if raw.start_sector < window.start_sector || raw.start_sector >= window.end_sector() {
            return Err(Error::InvalidPlacement(
                "the start sector is not in the usable free space",
            ));
        }

        let available = window.end_sector() - raw.start_sector;

        if raw.num_sectors > available {
            return Err(Error::NoSpace {
                requested: raw.num_sectors,
                available,
            });
        }

        Ok(())
    }

    /// Adds a validated partition, giving it its table entry.
    fn insert(&mut self, mut raw: RawSlice) -> Result<usize> {
        let mut raws = self.used_raws();
        raw.order = self.insertion_order(&mut raws, raw.kind, raw.start_sector)?;

        let start_sector = raw.start_sector;
        raws.push(raw);

        self.commit(raws);
        Ok(self.select_start(start_sector))
    }

    /// Finds the table entry of a new partition, renumbering the logical ones as needed.
    ///
    /// A primary partition takes the first free entry. The logical partitions always come
    /// after every primary one and are numbered in chain order, so a new logical partition
    /// takes the number following its predecessor in the chain.
    fn insertion_order(
        &self,
        raws: &mut [RawSlice],
        kind: SliceKind,
        start_sector: u64,
    ) -> Result<u32> {
        let is_primary = |raw: &&RawSlice| !raw.is_logical();

        let order = match kind {
            SliceKind::Primary => {
                let order = (0..self.label.max_entries())
                    .find(|order| !raws.iter().filter(is_primary).any(|raw| raw.order == *order))
                    .ok_or(Error::TableFull)?;

                if raws.iter().any(|raw| raw.is_logical() && raw.order <= order) {
                    for raw in raws.iter_mut().filter(|raw| raw.is_logical()) {
                        raw.order += 1;
                    }
                }

                return Ok(order);
            }
            SliceKind::Logical => {
                let prev = raws
                    .iter()
                    .filter(|raw| raw.is_logical() && raw.start_sector < start_sector)
                    .max_by_key(|raw| raw.start_sector);
                let next = raws
                    .iter()
                    .filter(|raw| raw.is_logical() && raw.start_sector > start_sector)
                    .min_by_key(|raw| raw.start_sector);

                match (prev, next) {
                    (Some(prev), _) => prev.order + 1,
                    (None, Some(next)) => next.order,
                    (None, None) => raws
                        .iter()
                        .filter(is_primary)
                        .map(|raw| raw.order + 1)
                        .max()
                        .unwrap_or(0),
                }
            }
        };

        for raw in raws
            .iter_mut()
            .filter(|raw| raw.is_logical() && raw.order >= order)
        {
            raw.order += 1;
        }

        Ok(order)
    }

    /// Sectors of the empty slice at `index` a new partition of `kind` may occupy.
    fn placement_window(&self, index: usize, kind: SliceKind) -> Result<Extent> {
        let empty = self
            .slices
            .get(index)
            .and_then(Slice::as_empty)
            .ok_or(Error::NoSuchSlice(index))?;

        Ok(self.clamp_range(empty.start_sector, empty.end_sector(), kind, index + 1))
    }

    /// Restricts the free range `[from, to)` to where the data of a `kind` partition may go.
    ///
    /// `next_index` is the index of the slice following the range. On MS-DOS disks the first
    /// track is kept free, a logical partition needs the sector before it for its table, and
    /// the sector before a following logical partition holds that partition's table.
    fn clamp_range(&self, from: u64, to: u64, kind: SliceKind, next_index: usize) -> Extent {
        let mut start = from.max(self.bounds.first_usable_sector);
        let mut end = to.min(self.bounds.last_usable_sector.saturating_add(1));

        if self.label == DiskLabel::MsDos {
            start = start.max(u64::from(self.geometry.sectors_per_track));

            if kind == SliceKind::Logical {
                start = start.max(from + 1);
            }

            let next_logical_table = self
                .slices
                .get(next_index)
                .and_then(Slice::as_used)
                .is_some_and(|used| used.raw.is_logical() && used.lead_sectors == 0);

            if next_logical_table {
                end = end.min(to.saturating_sub(1));
            }
        }

        Extent::new(start, end.saturating_sub(start))
    }

    /// Builds the slice list from the used entries of `raws`, filling every gap.
    ///
    /// Space outside of the usable bounds becomes [`Slice::Reserved`]. A gap of less than a
    /// megabyte in front of a logical partition is counted as part of that partition. The
    /// used entries must not overlap.
    fn rebuild_gaps(&self, mut raws: Vec<RawSlice>) -> Vec<Slice> {
        let num_sectors = self.geometry.num_sectors;
        let megabyte = self.geometry.sectors_per_megabyte();
        let first_usable = self.bounds.first_usable_sector.min(num_sectors);
        let reserved_tail = self
            .bounds
            .last_usable_sector
            .saturating_add(1)
            .min(num_sectors);

        raws.retain(|raw| self.label.is_used(raw));
        raws.sort_by_key(|raw| raw.start_sector);

        let mut slices = Vec::with_capacity(raws.len() * 2 + 3);
        let mut cursor = 0;

        if first_usable > 0 {
            slices.push(Slice::Reserved(Extent::new(0, first_usable)));
            cursor = first_usable;
        }

        for raw in raws {
            let mut lead_sectors = 0;

            if raw.start_sector > cursor {
                let gap = raw.start_sector - cursor;

                if raw.is_logical() && gap < megabyte {
                    lead_sectors = gap;
                } else {
                    slices.push(Slice::Empty(Extent::new(cursor, gap)));
                }
            }

            cursor = cursor.max(raw.end_sector());
            slices.push(Slice::Used(self.used_slice(raw, lead_sectors)));
        }

        if cursor < reserved_tail {
            slices.push(Slice::Empty(Extent::new(cursor, reserved_tail - cursor)));
            cursor = reserved_tail;
        }

        if cursor < num_sectors {
            slices.push(Slice::Reserved(Extent::new(cursor, num_sectors - cursor)));
        }

        log::trace!("Rebuilt slice list: {} slices", slices.len());

        slices
    }

    fn used_slice(&self, raw: RawSlice, lead_sectors: u64) -> UsedSlice {
        let device_name = match u8::try_from(raw.order) {
            Ok(order) if order < 26 => format!("{}{}", self.device.name(), char::from(b'a' + order)),
            _ => format!("{}p{}", self.device.name(), u64::from(raw.order) + 1),
        };

        let fs_type = self
            .probe
            .as_ref()
            .and_then(|probe| probe.probe(&device_name, &raw))
            .map_or_else(|| String::from("unknown"), |info| info.fs_type);

        let mut description = format!(
            "{device_name}: {}, {} MB",
            self.label.slice_type_description(&raw),
            self.geometry
                .sectors_to_megabytes(raw.num_sectors, Rounding::Natural)
        );
        if raw.is_logical() {
            description.push_str(", logical");
        }
        if raw.is_bootable() {
            description.push_str(", active");
        }

        UsedSlice {
            raw,
            device_name,
            fs_type,
            description,
            lead_sectors,
        }
    }
}
