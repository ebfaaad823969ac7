//! Block device adapter
//!
//! Translates host block requests, addressed as `(lba, offset, length)`, into
//! sector operations on a [FlashVolume].

use crate::flash::{FlashError, FlashVolume, Geometry, MountError};
use crate::fmt::{trace, warning};
use core::borrow::BorrowMut;
use core::cmp::min;

/// Block request error
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum BlockError {
    /// No active media session
    MediumNotPresent,
    /// The request addresses bytes outside of the volume
    OutOfRange,
    /// The volume failed after `transferred` bytes had been moved
    Io { error: FlashError, transferred: usize },
    /// The scratch buffer cannot hold a single erase unit
    BufferTooSmall,
}

impl BlockError {
    /// Number of bytes moved before the request failed
    pub fn transferred(&self) -> usize {
        match self {
            BlockError::Io { transferred, .. } => *transferred,
            _ => 0,
        }
    }
}

/// Services block requests against a [FlashVolume].
///
/// Every request is handled synchronously. Nothing is buffered between calls.
///
/// Writes honour the erase-before-write contract of the volume. A write span
/// covering a whole erase unit is erased and programmed directly. A span covering
/// only a part of an erase unit goes through the `scratch` buffer: the unit is
/// read, patched, erased and written back so the bytes around the request
/// survive. The scratch buffer is only needed for such partial writes and has to
/// fit at least one [erase unit].
///
/// [erase unit]: FlashVolume::erase_size
pub struct BlockDeviceAdapter<V, S> {
    volume: V,
    scratch: S,
    geometry: Geometry,
    erase_size: u32,
}

impl<V, S> BlockDeviceAdapter<V, S>
where
    V: FlashVolume,
    S: BorrowMut<[u8]>,
{
    /// Creates an adapter over a mounted volume
    ///
    /// # Errors
    /// * [InvalidGeometry] - the volume geometry cannot be addressed with 32 bit
    ///   byte offsets, or its erase unit does not split a sector evenly
    ///
    /// [InvalidGeometry]: MountError::InvalidGeometry
    pub fn new(volume: V, scratch: S) -> Result<Self, MountError> {
        let geometry = volume.geometry();
        geometry.validate(volume.erase_size())?;
        Ok(Self::with_geometry(volume, scratch, geometry))
    }

    /// `geometry` has been validated already
    pub(crate) fn with_geometry(volume: V, scratch: S, geometry: Geometry) -> Self {
        let erase_size = volume.erase_size();
        Self {
            volume,
            scratch,
            geometry,
            erase_size,
        }
    }

    /// Volume geometry captured when the adapter was created
    pub fn geometry(&self) -> Geometry {
        self.geometry
    }

    /// Gives the volume and the scratch buffer back
    pub fn release(self) -> (V, S) {
        (self.volume, self.scratch)
    }

    /// Reads `dst.len()` bytes starting `offset` bytes into block `lba`.
    ///
    /// Returns the number of bytes read.
    ///
    /// # Errors
    /// * [OutOfRange] - the range does not fit the volume. Nothing is read
    /// * [Io] - the volume failed. `transferred` bytes at the head of `dst` are valid
    ///
    /// [OutOfRange]: BlockError::OutOfRange
    /// [Io]: BlockError::Io
    pub fn on_read(&mut self, lba: u32, offset: u32, dst: &mut [u8]) -> Result<usize, BlockError> {
        if dst.is_empty() {
            return Ok(0);
        }
        let start = self.locate(lba, offset, dst.len())?;
        trace!("adapter: read [{}; {}]", start, dst.len());

        let sector_size = self.geometry.sector_size;
        let mut done = 0;
        while done < dst.len() {
            let pos = start + done as u32;
            let span = min(dst.len() - done, (sector_size - pos % sector_size) as usize);
            self.volume
                .read(pos, &mut dst[done..done + span])
                .map_err(|error| io_error(error, done))?;
            done += span;
        }
        Ok(done)
    }

    /// Writes `src` starting `offset` bytes into block `lba`.
    ///
    /// Returns the number of bytes written.
    ///
    /// # Errors
    /// * [OutOfRange] - the range does not fit the volume. Nothing is written
    /// * [BufferTooSmall] - a partial erase unit has to be patched but the scratch
    ///   buffer cannot hold it. Nothing is written
    /// * [Io] - the volume failed. The first `transferred` bytes have landed
    ///
    /// [OutOfRange]: BlockError::OutOfRange
    /// [BufferTooSmall]: BlockError::BufferTooSmall
    /// [Io]: BlockError::Io
    pub fn on_write(&mut self, lba: u32, offset: u32, src: &[u8]) -> Result<usize, BlockError> {
        if src.is_empty() {
            return Ok(0);
        }
        let start = self.locate(lba, offset, src.len())?;
        trace!("adapter: write [{}; {}]", start, src.len());

        let unit = self.erase_size;
        let end = start as u64 + src.len() as u64;
        let unaligned = start % unit != 0 || end % unit as u64 != 0;
        if unaligned && self.scratch.borrow().len() < unit as usize {
            warning!("adapter: scratch buffer smaller than erase unit {}", unit);
            return Err(BlockError::BufferTooSmall);
        }

        let mut done = 0;
        while done < src.len() {
            let pos = start + done as u32;
            let unit_start = pos - pos % unit;
            let skip = (pos - unit_start) as usize;
            let span = min(src.len() - done, unit as usize - skip);
            let chunk = &src[done..done + span];

            let res = if span == unit as usize {
                self.volume
                    .erase(pos, unit)
                    .and_then(|_| self.volume.write(pos, chunk))
            } else {
                self.patch_unit(unit_start, skip, chunk)
            };
            res.map_err(|error| io_error(error, done))?;
            done += span;
        }
        Ok(done)
    }

    /// Absolute byte offset of a request, if all of it fits the volume
    fn locate(&self, lba: u32, offset: u32, len: usize) -> Result<u32, BlockError> {
        let start = self.geometry.sector_size as u64 * lba as u64 + offset as u64;
        match start.checked_add(len as u64) {
            Some(end) if end <= self.geometry.capacity() => {
                // capacity never exceeds 2^32 and the range is not empty
                Ok(start as u32)
            }
            _ => {
                warning!(
                    "adapter: rejecting lba {} offset {} len {}",
                    lba,
                    offset,
                    len
                );
                Err(BlockError::OutOfRange)
            }
        }
    }

    /// Read-modify-write of a single erase unit
    fn patch_unit(&mut self, unit_start: u32, skip: usize, chunk: &[u8]) -> Result<(), FlashError> {
        let unit = self.erase_size;
        let buf = &mut self.scratch.borrow_mut()[..unit as usize];
        self.volume.read(unit_start, buf)?;
        buf[skip..skip + chunk.len()].copy_from_slice(chunk);
        self.volume.erase(unit_start, unit)?;
        self.volume.write(unit_start, buf)
    }
}

fn io_error(error: FlashError, transferred: usize) -> BlockError {
    warning!("adapter: {} after {} bytes", error, transferred);
    BlockError::Io { error, transferred }
}
