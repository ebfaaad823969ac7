//! Host session binding
//!
//! [MscClass] exposes a [BlockHandler] to the USB host as a SCSI disk over the
//! Bulk Only Transport. What the host gets to see (identity, capacity and
//! whether media is present) is recorded in a [HostSession].
//!
//! [MscClass]: crate::host::class::MscClass

use crate::adapter::BlockError;
use crate::flash::Geometry;
use crate::fmt::info;

pub mod class;
pub mod scsi;

/// Device identity strings reported in the SCSI INQUIRY response.
///
/// Fields longer than their INQUIRY slot (8, 16 and 4 bytes) are truncated,
/// shorter ones are padded with spaces.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct DeviceIdentity {
    pub vendor_id: &'static str,
    pub product_id: &'static str,
    pub revision: &'static str,
}

impl DeviceIdentity {
    pub const fn new(vendor_id: &'static str, product_id: &'static str, revision: &'static str) -> Self {
        Self {
            vendor_id,
            product_id,
            revision,
        }
    }
}

impl Default for DeviceIdentity {
    fn default() -> Self {
        Self::new("ESP32", "USB_MSC", "1.0")
    }
}

/// Block request callbacks invoked by the transport.
///
/// Calls never overlap: the transport issues one request and waits for it to
/// return before issuing the next one.
pub trait BlockHandler {
    /// Fills `dst` with data starting `offset` bytes into block `lba`.
    ///
    /// Returns the number of bytes read.
    fn read(&mut self, lba: u32, offset: u32, dst: &mut [u8]) -> Result<usize, BlockError>;

    /// Stores `src` starting `offset` bytes into block `lba`.
    ///
    /// Returns the number of bytes written.
    fn write(&mut self, lba: u32, offset: u32, src: &[u8]) -> Result<usize, BlockError>;

    /// START STOP UNIT. Returns whether the event is acknowledged.
    ///
    /// `host` is the registration the event arrived through, so a handler may
    /// tear it down (e.g. on eject).
    fn power_event(
        &mut self,
        host: &mut HostSession,
        power_condition: u8,
        start: bool,
        load_eject: bool,
    ) -> bool;
}

#[derive(Debug, Copy, Clone)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
struct Registration {
    identity: DeviceIdentity,
    capacity: Geometry,
}

/// What the host is told about the disk
#[derive(Debug, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct HostSession {
    registration: Option<Registration>,
    media_present: bool,
}

impl HostSession {
    pub const fn new() -> Self {
        Self {
            registration: None,
            media_present: false,
        }
    }

    /// Publishes the disk. `capacity` has to be registered before the host
    /// issues any read or write.
    pub fn register(&mut self, identity: DeviceIdentity, capacity: Geometry) {
        info!(
            "host: register {} {} {}, {} blocks of {}",
            identity.vendor_id,
            identity.product_id,
            identity.revision,
            capacity.sector_count,
            capacity.sector_size
        );
        self.registration = Some(Registration { identity, capacity });
    }

    pub fn set_media_present(&mut self, present: bool) {
        info!("host: media present: {}", present);
        self.media_present = present;
    }

    /// Withdraws the disk. Media is reported as not present afterwards.
    pub fn unregister(&mut self) {
        info!("host: unregister");
        self.registration = None;
        self.media_present = false;
    }

    pub fn is_registered(&self) -> bool {
        self.registration.is_some()
    }

    /// Whether the host may access the disk
    pub fn media_present(&self) -> bool {
        self.media_present && self.registration.is_some()
    }

    pub fn identity(&self) -> Option<DeviceIdentity> {
        self.registration.map(|r| r.identity)
    }

    pub fn capacity(&self) -> Option<Geometry> {
        self.registration.map(|r| r.capacity)
    }
}
