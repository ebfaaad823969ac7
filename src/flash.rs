//! Wear-leveled flash volume
//!
//! The flash translation layer (wear leveling, bad block handling) lives below
//! this crate. It is seen here only through the [FlashVolume] it hands out once a
//! [FlashPartition] has been mounted.

use crate::fmt::{info, warning};

/// Flash IO error
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum FlashError {
    /// A read could not be completed
    Read,
    /// A program operation could not be completed
    Write,
    /// An erase could not be completed
    Erase,
}

/// Volume mount error
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum MountError {
    /// The volume could not be mounted and formatting is disabled
    MountFailed,
    /// The volume could not be mounted and the attempt to format it failed too
    FormatFailed,
    /// The mounted volume reports a geometry that cannot be exposed as a disk
    InvalidGeometry,
    /// A volume is mounted already
    AlreadyMounted,
}

/// Sector geometry of a volume, also reported to the host as the disk capacity
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Geometry {
    /// Bytes per sector. Always a power of two
    pub sector_size: u32,
    /// Number of sectors
    pub sector_count: u32,
}

impl Geometry {
    pub const fn new(sector_size: u32, sector_count: u32) -> Self {
        Self {
            sector_size,
            sector_count,
        }
    }

    /// Total size in bytes
    pub const fn capacity(&self) -> u64 {
        self.sector_size as u64 * self.sector_count as u64
    }

    /// The address of the last logical block
    pub const fn last_lba(&self) -> u32 {
        self.sector_count.saturating_sub(1)
    }

    /// Whether `[lba, lba + count)` fits into the volume.
    ///
    /// `lba` has to address an existing block even when `count` is zero.
    pub fn contains_blocks(&self, lba: u64, count: u64) -> bool {
        lba < self.sector_count as u64
            && lba
                .checked_add(count)
                .map_or(false, |end| end <= self.sector_count as u64)
    }

    /// Checks that a volume with this geometry can be driven by byte offsets
    /// of 32 bits and that `erase_size` splits a sector evenly.
    pub(crate) fn validate(&self, erase_size: u32) -> Result<(), MountError> {
        let sector_ok = self.sector_size.is_power_of_two() && self.sector_count > 0;
        let erase_ok = erase_size.is_power_of_two() && erase_size <= self.sector_size;
        if sector_ok && erase_ok && self.capacity() <= u32::MAX as u64 + 1 {
            Ok(())
        } else {
            warning!(
                "flash: rejecting geometry {}x{}, erase size {}",
                self.sector_count,
                self.sector_size,
                erase_size
            );
            Err(MountError::InvalidGeometry)
        }
    }
}

/// Options used when mounting a [FlashPartition]
#[derive(Debug, Copy, Clone)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct MountConfig {
    /// Where the filesystem on the volume is attached for local use
    pub base_path: &'static str,
    /// Partition label
    pub label: &'static str,
    /// Format the partition if it cannot be mounted
    pub format_if_mount_failed: bool,
    /// Max number of files the local filesystem may keep open at once
    pub max_files: u8,
    /// Filesystem cluster size used when formatting
    pub allocation_unit_size: u32,
}

impl Default for MountConfig {
    fn default() -> Self {
        Self {
            base_path: "/fatfs",
            label: "ffat",
            format_if_mount_failed: true,
            max_files: 5,
            allocation_unit_size: 4096,
        }
    }
}

/// Sector addressed storage with erase-before-write semantics.
///
/// Offsets are absolute byte offsets into the volume. Callers must keep every
/// access within `[0, capacity)`; behaviour outside of it is up to the
/// implementation. A range has to be erased before it can be written.
pub trait FlashVolume {
    fn geometry(&self) -> Geometry;

    /// The smallest erasable unit in bytes.
    ///
    /// Must be a power of two no larger than a sector. Volumes that can erase
    /// below sector granularity override this.
    fn erase_size(&self) -> u32 {
        self.geometry().sector_size
    }

    fn read(&mut self, offset: u32, dst: &mut [u8]) -> Result<(), FlashError>;

    /// Erases `len` bytes starting at `offset`. Both are multiples of [erase_size]
    ///
    /// [erase_size]: FlashVolume::erase_size
    fn erase(&mut self, offset: u32, len: u32) -> Result<(), FlashError>;

    fn write(&mut self, offset: u32, src: &[u8]) -> Result<(), FlashError>;
}

/// Backing flash partition on which a wear-leveling layer is mounted.
pub trait FlashPartition {
    type Volume: FlashVolume;

    /// Mounts the partition
    ///
    /// # Errors
    /// * [MountFailed] - the partition has no usable filesystem and
    ///   `format_if_mount_failed` is not set
    /// * [FormatFailed] - formatting was attempted and failed
    ///
    /// [MountFailed]: MountError::MountFailed
    /// [FormatFailed]: MountError::FormatFailed
    fn mount(&mut self, config: &MountConfig) -> Result<Self::Volume, MountError>;

    /// Unmounts a volume previously returned by [mount](FlashPartition::mount).
    fn unmount(&mut self, volume: Self::Volume);
}

pub(crate) fn mount<P: FlashPartition>(
    partition: &mut P,
    config: &MountConfig,
) -> Result<(P::Volume, Geometry), MountError> {
    info!("flash: mount '{}' at {}", config.label, config.base_path);
    let volume = partition.mount(config)?;
    let geometry = volume.geometry();
    match geometry.validate(volume.erase_size()) {
        Ok(()) => Ok((volume, geometry)),
        Err(err) => {
            partition.unmount(volume);
            Err(err)
        }
    }
}
