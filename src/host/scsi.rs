//! SCSI block commands
//!
//! Decoding of the command blocks a host sends to a removable direct-access
//! device, and the fixed-size responses sent back.

use crate::adapter::BlockError;
use crate::flash::{FlashError, Geometry};
use crate::host::DeviceIdentity;
use num_enum::{IntoPrimitive, TryFromPrimitive};

/// SCSI device subclass code
pub const SUBCLASS_SCSI: u8 = 0x06; // SCSI Transparent command set

const MAX_CB_LEN: usize = 16;

/// READ CAPACITY (16) is a SERVICE ACTION IN (16) with this action code
const SERVICE_ACTION_READ_CAPACITY_16: u8 = 0x10;

#[repr(u8)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, TryFromPrimitive)]
enum Opcode {
    /* SPC */
    TestUnitReady = 0x00,
    RequestSense = 0x03,
    Inquiry = 0x12,
    ModeSense6 = 0x1A,
    PreventAllowMediumRemoval = 0x1E,
    ModeSense10 = 0x5A,

    /* SBC */
    StartStopUnit = 0x1B,
    ReadCapacity10 = 0x25,
    Read10 = 0x28,
    Write10 = 0x2A,
    Verify10 = 0x2F,
    SynchronizeCache10 = 0x35,
    Read16 = 0x88,
    Write16 = 0x8A,
    ServiceActionIn16 = 0x9E,

    /* MMC */
    ReadFormatCapacities = 0x23,
}

/// SCSI command
///
/// Refer to specifications (SPC, SBC, MMC)
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ScsiCommand {
    Unknown {
        opcode: u8,
    },

    /* SPC */
    TestUnitReady,
    RequestSense {
        alloc_len: u8,
    },
    Inquiry {
        evpd: bool,
        page_code: u8,
        alloc_len: u16,
    },
    ModeSense6 {
        alloc_len: u8,
    },
    ModeSense10 {
        alloc_len: u16,
    },
    PreventAllowMediumRemoval {
        prevent: bool,
    },

    /* SBC */
    StartStopUnit {
        power_condition: u8,
        start: bool,
        load_eject: bool,
    },
    ReadCapacity10,
    ReadCapacity16 {
        alloc_len: u32,
    },
    Read {
        lba: u64,
        len: u32,
    },
    Write {
        lba: u64,
        len: u32,
    },
    Verify {
        lba: u64,
        len: u32,
    },
    SynchronizeCache,

    /* MMC */
    ReadFormatCapacities {
        alloc_len: u16,
    },
}

impl ScsiCommand {
    /// Decodes a command block.
    ///
    /// Blocks shorter than their opcode requires are treated as zero padded.
    pub fn parse(bytes: &[u8]) -> ScsiCommand {
        let mut cb = [0u8; MAX_CB_LEN];
        let len = bytes.len().min(MAX_CB_LEN);
        cb[..len].copy_from_slice(&bytes[..len]);

        let be16 = |at: usize| u16::from_be_bytes([cb[at], cb[at + 1]]);
        let be32 = |at: usize| u32::from_be_bytes([cb[at], cb[at + 1], cb[at + 2], cb[at + 3]]);
        let be64 = |at: usize| (be32(at) as u64) << 32 | be32(at + 4) as u64;

        let opcode = match Opcode::try_from_primitive(cb[0]) {
            Ok(opcode) => opcode,
            Err(_) => return ScsiCommand::Unknown { opcode: cb[0] },
        };

        match opcode {
            Opcode::TestUnitReady => ScsiCommand::TestUnitReady,
            Opcode::RequestSense => ScsiCommand::RequestSense { alloc_len: cb[4] },
            Opcode::Inquiry => ScsiCommand::Inquiry {
                evpd: (cb[1] & 0b00000001) != 0,
                page_code: cb[2],
                alloc_len: be16(3),
            },
            Opcode::ModeSense6 => ScsiCommand::ModeSense6 { alloc_len: cb[4] },
            Opcode::ModeSense10 => ScsiCommand::ModeSense10 { alloc_len: be16(7) },
            Opcode::PreventAllowMediumRemoval => ScsiCommand::PreventAllowMediumRemoval {
                prevent: (cb[4] & 0b00000011) != 0,
            },
            Opcode::StartStopUnit => ScsiCommand::StartStopUnit {
                power_condition: cb[4] >> 4,
                start: (cb[4] & 0b00000001) != 0,
                load_eject: (cb[4] & 0b00000010) != 0,
            },
            Opcode::ReadCapacity10 => ScsiCommand::ReadCapacity10,
            Opcode::ServiceActionIn16 if cb[1] & 0b00011111 == SERVICE_ACTION_READ_CAPACITY_16 => {
                ScsiCommand::ReadCapacity16 { alloc_len: be32(10) }
            }
            Opcode::ServiceActionIn16 => ScsiCommand::Unknown { opcode: cb[0] },
            Opcode::Read10 => ScsiCommand::Read {
                lba: be32(2) as u64,
                len: be16(7) as u32,
            },
            Opcode::Read16 => ScsiCommand::Read {
                lba: be64(2),
                len: be32(10),
            },
            Opcode::Write10 => ScsiCommand::Write {
                lba: be32(2) as u64,
                len: be16(7) as u32,
            },
            Opcode::Write16 => ScsiCommand::Write {
                lba: be64(2),
                len: be32(10),
            },
            Opcode::Verify10 => ScsiCommand::Verify {
                lba: be32(2) as u64,
                len: be16(7) as u32,
            },
            Opcode::SynchronizeCache10 => ScsiCommand::SynchronizeCache,
            Opcode::ReadFormatCapacities => ScsiCommand::ReadFormatCapacities { alloc_len: be16(7) },
        }
    }
}

/// Sense key
#[repr(u8)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, IntoPrimitive)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SenseKey {
    NoSense = 0x00,
    NotReady = 0x02,
    MediumError = 0x03,
    HardwareError = 0x04,
    IllegalRequest = 0x05,
}

/// Sense data describing why the last command failed
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Sense {
    pub key: SenseKey,
    /// Additional sense code
    pub asc: u8,
    /// Additional sense code qualifier
    pub ascq: u8,
}

impl Sense {
    pub const NONE: Sense = Sense::new(SenseKey::NoSense, 0x00, 0x00);
    pub const MEDIUM_NOT_PRESENT: Sense = Sense::new(SenseKey::NotReady, 0x3A, 0x00);
    pub const LBA_OUT_OF_RANGE: Sense = Sense::new(SenseKey::IllegalRequest, 0x21, 0x00);
    pub const INVALID_COMMAND: Sense = Sense::new(SenseKey::IllegalRequest, 0x20, 0x00);
    pub const INVALID_FIELD_IN_CDB: Sense = Sense::new(SenseKey::IllegalRequest, 0x24, 0x00);
    pub const UNRECOVERED_READ_ERROR: Sense = Sense::new(SenseKey::MediumError, 0x11, 0x00);
    pub const WRITE_ERROR: Sense = Sense::new(SenseKey::MediumError, 0x0C, 0x00);
    pub const ERASE_FAILURE: Sense = Sense::new(SenseKey::MediumError, 0x51, 0x00);
    pub const HARDWARE_ERROR: Sense = Sense::new(SenseKey::HardwareError, 0x00, 0x00);

    pub const fn new(key: SenseKey, asc: u8, ascq: u8) -> Self {
        Self { key, asc, ascq }
    }

    /// Fixed format sense data
    pub fn to_bytes(&self) -> [u8; 18] {
        let mut data = [0u8; 18];
        data[0] = 0x70; // current errors, fixed format
        data[2] = self.key.into();
        data[7] = 10; // additional sense length
        data[12] = self.asc;
        data[13] = self.ascq;
        data
    }
}

impl From<BlockError> for Sense {
    fn from(err: BlockError) -> Self {
        match err {
            BlockError::MediumNotPresent => Sense::MEDIUM_NOT_PRESENT,
            BlockError::OutOfRange => Sense::LBA_OUT_OF_RANGE,
            BlockError::Io {
                error: FlashError::Read,
                ..
            } => Sense::UNRECOVERED_READ_ERROR,
            BlockError::Io {
                error: FlashError::Write,
                ..
            } => Sense::WRITE_ERROR,
            BlockError::Io {
                error: FlashError::Erase,
                ..
            } => Sense::ERASE_FAILURE,
            BlockError::BufferTooSmall => Sense::HARDWARE_ERROR,
        }
    }
}

/// Standard INQUIRY data of a removable direct-access device
pub(crate) fn inquiry_data(identity: &DeviceIdentity) -> [u8; 36] {
    let mut data = [b' '; 36];
    data[..8].copy_from_slice(&[
        0x00, // periph qualifier, direct access block device
        0x80, // removable
        0x04, // SPC-2 compliance
        0x02, // response data format
        0x1F, // additional length
        0x00, 0x00, 0x00,
    ]);
    fill_ascii(&mut data[8..16], identity.vendor_id);
    fill_ascii(&mut data[16..32], identity.product_id);
    fill_ascii(&mut data[32..36], identity.revision);
    data
}

fn fill_ascii(dst: &mut [u8], src: &str) {
    for (d, s) in dst.iter_mut().zip(src.bytes()) {
        *d = if s.is_ascii_graphic() { s } else { b' ' };
    }
}

pub(crate) fn read_capacity_10(capacity: &Geometry) -> [u8; 8] {
    let mut data = [0u8; 8];
    data[..4].copy_from_slice(&capacity.last_lba().to_be_bytes());
    data[4..].copy_from_slice(&capacity.sector_size.to_be_bytes());
    data
}

pub(crate) fn read_capacity_16(capacity: &Geometry) -> [u8; 32] {
    let mut data = [0u8; 32];
    data[..8].copy_from_slice(&(capacity.last_lba() as u64).to_be_bytes());
    data[8..12].copy_from_slice(&capacity.sector_size.to_be_bytes());
    data
}

pub(crate) fn read_format_capacities(capacity: &Geometry) -> [u8; 12] {
    let mut data = [0u8; 12];
    data[3] = 0x08; // capacity list length
    data[4..8].copy_from_slice(&capacity.sector_count.to_be_bytes());
    data[8..].copy_from_slice(&capacity.sector_size.to_be_bytes());
    data[8] = 0x02; // formatted media, overwrites the block length MSB
    data
}

pub(crate) const MODE_SENSE_6: [u8; 4] = [
    0x03, // number of bytes that follow
    0x00, // the media type is SBC
    0x00, // not write-protected, no cache-control bytes support
    0x00, // no mode-parameter block descriptors
];

pub(crate) const MODE_SENSE_10: [u8; 8] = [0x00, 0x06, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00];
