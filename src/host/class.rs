//! SCSI disk over Bulk Only Transport

use crate::flash::Geometry;
use crate::fmt::{debug, info, trace, warning};
use crate::host::scsi::{self, ScsiCommand, Sense, SUBCLASS_SCSI};
use crate::host::{BlockHandler, HostSession};
use core::borrow::BorrowMut;
use core::cmp::min;
use usb_device::bus::{InterfaceNumber, UsbBus, UsbBusAllocator};
use usb_device::class::{ControlIn, UsbClass};
use usb_device::descriptor::DescriptorWriter;
use usb_device::UsbError;
use usbd_storage::transport::bbb::{BulkOnly, BulkOnlyError};
use usbd_storage::transport::{CommandStatus, Transport, TransportError};
use usbd_storage::CLASS_MASS_STORAGE;

/// A single logical unit is exposed
const MAX_LUN: u8 = 0;

type BulkOnlyResult<T> = Result<T, TransportError<BulkOnlyError>>;

/// Progress of a READ or WRITE command
#[derive(Debug, Copy, Clone)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
struct Transfer {
    lba: u64,
    block_size: u32,
    /// Bytes the command moves in total
    total: u64,
    /// Bytes handed to or taken from the [BlockHandler]
    done: u64,
    /// Bytes held in the block buffer
    filled: usize,
    /// Bytes of the block buffer already passed to the transport
    sent: usize,
}

impl Transfer {
    /// `(lba, offset)` of the next byte to move
    fn position(&self) -> (u32, u32) {
        let block_size = self.block_size as u64;
        // the range was checked against the capacity, so the lba fits
        (
            (self.lba + self.done / block_size) as u32,
            (self.done % block_size) as u32,
        )
    }
}

/// USB Mass Storage SCSI disk.
///
/// Commands arriving over the [Bulk Only Transport] are answered from the
/// [HostSession] (identity, capacity, media presence) and block data is moved
/// through a [BlockHandler], passed to [poll] on every call.
///
/// Data goes through `block_buf` in chunks of its size: a READ or WRITE of `n`
/// blocks results in `read`/`write` calls addressed as `(lba, offset)`, where
/// `offset` is the position of the chunk inside block `lba`. A `block_buf` of at
/// least one block avoids partial block writes.
///
/// [Bulk Only Transport]: usbd_storage::transport::bbb::BulkOnly
/// [poll]: MscClass::poll
pub struct MscClass<'alloc, Bus: UsbBus, Buf: BorrowMut<[u8]>> {
    interface: InterfaceNumber,
    transport: BulkOnly<'alloc, Bus, Buf>,
    block_buf: Buf,
    host: HostSession,
    sense: Sense,
    transfer: Option<Transfer>,
}

impl<'alloc, Bus, Buf> MscClass<'alloc, Bus, Buf>
where
    Bus: UsbBus + 'alloc,
    Buf: BorrowMut<[u8]>,
{
    /// Creates a SCSI disk over Bulk Only Transport
    ///
    /// # Arguments
    /// * `alloc` - [UsbBusAllocator]
    /// * `packet_size` - Maximum USB packet size. Allowed values: 8,16,32,64
    /// * `io_buf` - The transport IO buffer. It is **required** to fit at least a `CBW` and a
    /// single packet. It is **recommended** to fit 64 bytes so any response fits at once
    /// * `block_buf` - Staging buffer for block data. Must not be empty
    ///
    /// # Errors
    /// * [BufferTooSmall]
    ///
    /// # Panics
    /// Panics if endpoint allocations fails.
    ///
    /// [BufferTooSmall]: usbd_storage::transport::bbb::BulkOnlyError::BufferTooSmall
    /// [UsbBusAllocator]: usb_device::bus::UsbBusAllocator
    pub fn new(
        alloc: &'alloc UsbBusAllocator<Bus>,
        packet_size: u16,
        io_buf: Buf,
        block_buf: Buf,
    ) -> Result<Self, BulkOnlyError> {
        if block_buf.borrow().is_empty() {
            return Err(BulkOnlyError::BufferTooSmall);
        }
        BulkOnly::new(alloc, packet_size, MAX_LUN, io_buf).map(|transport| Self {
            interface: alloc.interface(),
            transport,
            block_buf,
            host: HostSession::new(),
            sense: Sense::NONE,
            transfer: None,
        })
    }

    pub fn host(&self) -> &HostSession {
        &self.host
    }

    /// The registration the host sees. See [MediaSession::start]
    ///
    /// [MediaSession::start]: crate::session::MediaSession::start
    pub fn host_mut(&mut self) -> &mut HostSession {
        &mut self.host
    }

    /// Drives the transport in both directions and services the current command
    ///
    /// `handler` may be called zero or several times per call.
    pub fn poll<H: BlockHandler>(&mut self, handler: &mut H) -> Result<(), UsbError> {
        fn map_ignore<T>(res: BulkOnlyResult<T>) -> Result<(), UsbError> {
            match res {
                Ok(_)
                | Err(TransportError::Usb(UsbError::WouldBlock))
                | Err(TransportError::Error(_)) => Ok(()),
                Err(TransportError::Usb(err)) => Err(err),
            }
        }

        map_ignore(self.transport.read())?;
        map_ignore(self.transport.write())?;

        if self.transport.has_status() {
            return Ok(());
        }
        let command = match self.transport.get_command() {
            Some(cb) => {
                let command = ScsiCommand::parse(cb.bytes);
                trace!("usb: msc: Command: {}, lun: {}", command, cb.lun);
                command
            }
            None => return Ok(()),
        };

        loop {
            if let Err(err) = self.handle(command, handler) {
                warning!("usb: msc: Transport error: {}", err);
                self.transfer = None;
                if !self.transport.has_status() {
                    self.transport.set_status(CommandStatus::PhaseError);
                }
            }

            // the host expects a full packet next: produce more data first
            match self.transport.write() {
                Err(TransportError::Error(BulkOnlyError::FullPacketExpected)) => continue,
                Ok(_)
                | Err(TransportError::Error(_))
                | Err(TransportError::Usb(UsbError::WouldBlock)) => {}
                Err(TransportError::Usb(err)) => return Err(err),
            }
            map_ignore(self.transport.read())?;

            break;
        }

        Ok(())
    }

    fn handle<H: BlockHandler>(&mut self, command: ScsiCommand, handler: &mut H) -> BulkOnlyResult<()> {
        match command {
            ScsiCommand::TestUnitReady => {
                if self.ready().is_some() {
                    self.pass();
                }
            }
            ScsiCommand::RequestSense { alloc_len } => {
                let data = self.sense.to_bytes();
                self.respond(&data, alloc_len as usize)?;
                self.sense = Sense::NONE;
                self.pass();
            }
            ScsiCommand::Inquiry {
                evpd: false,
                page_code: 0,
                alloc_len,
            } => {
                let identity = self.host.identity().unwrap_or_default();
                self.respond(&scsi::inquiry_data(&identity), alloc_len as usize)?;
                self.pass();
            }
            ScsiCommand::Inquiry { .. } => {
                // no vital product data pages
                self.fail(Sense::INVALID_FIELD_IN_CDB);
            }
            ScsiCommand::ModeSense6 { alloc_len } => {
                self.respond(&scsi::MODE_SENSE_6, alloc_len as usize)?;
                self.pass();
            }
            ScsiCommand::ModeSense10 { alloc_len } => {
                self.respond(&scsi::MODE_SENSE_10, alloc_len as usize)?;
                self.pass();
            }
            ScsiCommand::PreventAllowMediumRemoval { .. } | ScsiCommand::SynchronizeCache => {
                // nothing is cached and the medium cannot be locked
                self.pass();
            }
            ScsiCommand::StartStopUnit {
                power_condition,
                start,
                load_eject,
            } => {
                info!(
                    "usb: msc: Start/stop: power condition {}, start {}, load/eject {}",
                    power_condition,
                    start,
                    load_eject
                );
                if handler.power_event(&mut self.host, power_condition, start, load_eject) {
                    self.pass();
                } else {
                    self.fail(Sense::INVALID_FIELD_IN_CDB);
                }
            }
            ScsiCommand::ReadCapacity10 => {
                if let Some(capacity) = self.ready() {
                    self.respond(&scsi::read_capacity_10(&capacity), usize::MAX)?;
                    self.pass();
                }
            }
            ScsiCommand::ReadCapacity16 { alloc_len } => {
                if let Some(capacity) = self.ready() {
                    self.respond(&scsi::read_capacity_16(&capacity), alloc_len as usize)?;
                    self.pass();
                }
            }
            ScsiCommand::ReadFormatCapacities { alloc_len } => {
                if let Some(capacity) = self.ready() {
                    self.respond(&scsi::read_format_capacities(&capacity), alloc_len as usize)?;
                    self.pass();
                }
            }
            ScsiCommand::Verify { lba, len } => {
                if self.check_range(lba, len).is_some() {
                    self.pass();
                }
            }
            ScsiCommand::Read { lba, len } => self.read_blocks(lba, len, handler)?,
            ScsiCommand::Write { lba, len } => self.write_blocks(lba, len, handler)?,
            ScsiCommand::Unknown { opcode } => {
                warning!("usb: msc: Unknown SCSI opcode: {:#x}", opcode);
                self.fail(Sense::INVALID_COMMAND);
            }
        }
        Ok(())
    }

    fn read_blocks<H: BlockHandler>(&mut self, lba: u64, len: u32, handler: &mut H) -> BulkOnlyResult<()> {
        let mut t = match self.transfer.take().or_else(|| self.begin_transfer(lba, len)) {
            Some(t) => t,
            None => return Ok(()),
        };

        // refill once everything staged has been handed to the transport
        if t.sent == t.filled && t.done < t.total {
            let want = min(self.block_buf.borrow().len() as u64, t.total - t.done) as usize;
            let (lba, offset) = t.position();
            match handler.read(lba, offset, &mut self.block_buf.borrow_mut()[..want]) {
                Ok(count) if count == want => {
                    t.filled = want;
                    t.sent = 0;
                    t.done += want as u64;
                }
                Ok(count) => {
                    warning!("usb: msc: Short read: {} of {}", count, want);
                    self.fail(Sense::UNRECOVERED_READ_ERROR);
                    return Ok(());
                }
                Err(err) => {
                    self.fail(err.into());
                    return Ok(());
                }
            }
        }

        if t.sent < t.filled {
            t.sent += self
                .transport
                .write_data(&self.block_buf.borrow()[t.sent..t.filled])?;
        }

        if t.sent == t.filled && t.done == t.total {
            self.pass();
        } else {
            self.transfer = Some(t);
        }
        Ok(())
    }

    fn write_blocks<H: BlockHandler>(&mut self, lba: u64, len: u32, handler: &mut H) -> BulkOnlyResult<()> {
        let mut t = match self.transfer.take().or_else(|| self.begin_transfer(lba, len)) {
            Some(t) => t,
            None => return Ok(()),
        };

        if t.done < t.total {
            // collect a full chunk before handing it over to keep partial block writes rare
            let want = min(self.block_buf.borrow().len() as u64, t.total - t.done) as usize;
            if t.filled < want {
                t.filled += self
                    .transport
                    .read_data(&mut self.block_buf.borrow_mut()[t.filled..want])?;
            }
            if t.filled == want {
                let (lba, offset) = t.position();
                match handler.write(lba, offset, &self.block_buf.borrow()[..want]) {
                    Ok(count) if count == want => {
                        t.done += want as u64;
                        t.filled = 0;
                    }
                    Ok(count) => {
                        warning!("usb: msc: Short write: {} of {}", count, want);
                        self.fail(Sense::WRITE_ERROR);
                        return Ok(());
                    }
                    Err(err) => {
                        self.fail(err.into());
                        return Ok(());
                    }
                }
            }
        }

        if t.done == t.total {
            self.pass();
        } else {
            self.transfer = Some(t);
        }
        Ok(())
    }

    fn begin_transfer(&mut self, lba: u64, len: u32) -> Option<Transfer> {
        let capacity = self.check_range(lba, len)?;
        debug!("usb: msc: Transfer: lba {}, blocks {}", lba, len);
        Some(Transfer {
            lba,
            block_size: capacity.sector_size,
            total: len as u64 * capacity.sector_size as u64,
            done: 0,
            filled: 0,
            sent: 0,
        })
    }

    /// Capacity of the disk, if media is present. Fails the command otherwise
    fn ready(&mut self) -> Option<Geometry> {
        match self.host.capacity() {
            Some(capacity) if self.host.media_present() => Some(capacity),
            _ => {
                self.fail(Sense::MEDIUM_NOT_PRESENT);
                None
            }
        }
    }

    fn check_range(&mut self, lba: u64, len: u32) -> Option<Geometry> {
        let capacity = self.ready()?;
        if capacity.contains_blocks(lba, len as u64) {
            Some(capacity)
        } else {
            warning!("usb: msc: LBA out of range: {} + {}", lba, len);
            self.fail(Sense::LBA_OUT_OF_RANGE);
            None
        }
    }

    fn respond(&mut self, data: &[u8], alloc_len: usize) -> BulkOnlyResult<()> {
        self.transport
            .try_write_data_all(&data[..min(data.len(), alloc_len)])
    }

    fn pass(&mut self) {
        self.transfer = None;
        self.transport.set_status(CommandStatus::Passed);
    }

    fn fail(&mut self, sense: Sense) {
        debug!("usb: msc: Fail: {}", sense);
        self.transfer = None;
        self.sense = sense;
        self.transport.set_status(CommandStatus::Failed);
    }
}

impl<'alloc, Bus, Buf> UsbClass<Bus> for MscClass<'alloc, Bus, Buf>
where
    Bus: UsbBus,
    Buf: BorrowMut<[u8]>,
{
    fn get_configuration_descriptors(
        &self,
        writer: &mut DescriptorWriter,
    ) -> usb_device::Result<()> {
        let proto = <BulkOnly<'alloc, Bus, Buf> as Transport>::PROTO;
        writer.iad(
            self.interface,
            1,
            CLASS_MASS_STORAGE,
            SUBCLASS_SCSI,
            proto,
            None,
        )?;
        writer.interface(self.interface, CLASS_MASS_STORAGE, SUBCLASS_SCSI, proto)?;

        self.transport.get_endpoint_descriptors(writer)?;

        Ok(())
    }

    fn reset(&mut self) {
        info!("usb: msc: Reset");
        self.transfer = None;
        self.transport.reset()
    }

    fn control_in(&mut self, xfer: ControlIn<Bus>) {
        self.transport.control_in(xfer)
    }
}
