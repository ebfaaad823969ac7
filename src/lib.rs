//! USB flash disk for [usb-device]
//!
//! Exposes a wear-leveled flash volume to a USB host as a removable SCSI disk
//! over the [usbd-storage] Bulk Only Transport.
//!
//! # Layers:
//! * [FlashVolume] - sector addressed storage handed out by a mounted [FlashPartition]
//! * [BlockDeviceAdapter] - turns `(lba, offset, length)` requests into erase, write
//!   and read calls on the volume
//! * [MediaSession] - mount/start/stop/eject state machine owning the volume
//! * [MscClass] - USB class answering SCSI commands on behalf of a [BlockHandler]
//!
//! # Usage
//! ```ignore
//! let mut session = MediaSession::new(partition, MountConfig::default(), DeviceIdentity::default(), scratch);
//! let mut msc = MscClass::new(&usb_bus, 64, io_buf, block_buf)?;
//! session.mount()?;
//! session.start(msc.host_mut())?;
//!
//! loop {
//!     if usb_device.poll(&mut [&mut msc]) {
//!         msc.poll(&mut session)?;
//!     }
//! }
//! ```
//!
//! # Features
//! | Feature | Description                           |
//! | ------- |---------------------------------------|
//! | `defmt` | Enable logging via [defmt](https://crates.io/crates/defmt) crate |
//!
//! [usb-device]: https://crates.io/crates/usb-device
//! [usbd-storage]: https://crates.io/crates/usbd-storage
//! [FlashVolume]: crate::flash::FlashVolume
//! [FlashPartition]: crate::flash::FlashPartition
//! [BlockDeviceAdapter]: crate::adapter::BlockDeviceAdapter
//! [MediaSession]: crate::session::MediaSession
//! [MscClass]: crate::host::class::MscClass
//! [BlockHandler]: crate::host::BlockHandler

#![no_std]

pub(crate) mod fmt;

pub mod adapter;
pub mod flash;
pub mod host;
pub mod session;

pub use adapter::{BlockDeviceAdapter, BlockError};
pub use flash::{FlashError, FlashPartition, FlashVolume, Geometry, MountConfig, MountError};
pub use host::class::MscClass;
pub use host::{BlockHandler, DeviceIdentity, HostSession};
pub use session::{MediaSession, SessionError, SessionState};
