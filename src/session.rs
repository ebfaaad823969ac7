//! Media session
//!
//! Owns the mounted [FlashVolume] and the media state the host observes:
//!
//! ```text
//! Unmounted --mount--> Mounted --start--> Active --stop/eject--> Stopped
//!     ^                   |                  ^                      |
//!     +------unmount------+                  +--------start---------+
//!     +----------------------------unmount--------------------------+
//! ```
//!
//! Block requests are only serviced while the session is `Active`.
//!
//! [FlashVolume]: crate::flash::FlashVolume

use crate::adapter::{BlockDeviceAdapter, BlockError};
use crate::flash::{self, FlashPartition, FlashVolume, Geometry, MountConfig, MountError};
use crate::fmt::{error, info};
use crate::host::{BlockHandler, DeviceIdentity, HostSession};
use core::borrow::BorrowMut;

/// State of a [MediaSession]
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SessionState {
    /// No volume mounted
    Unmounted,
    /// Volume mounted, not exposed to the host yet
    Mounted,
    /// Exposed to the host, media present
    Active,
    /// Stopped or ejected by the host. The volume stays mounted
    Stopped,
}

/// Media session error
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SessionError {
    Mount(MountError),
    /// The scratch buffer cannot hold an erase unit of the mounted volume
    BufferTooSmall,
    /// The operation is not allowed in the current state
    InvalidState(SessionState),
}

impl From<MountError> for SessionError {
    fn from(err: MountError) -> Self {
        SessionError::Mount(err)
    }
}

/// Media session controller.
///
/// The only owner of the flash volume. Block requests reach the volume through a
/// [BlockDeviceAdapter] and only while the session is [Active].
///
/// [Active]: SessionState::Active
pub struct MediaSession<P: FlashPartition, S> {
    partition: P,
    config: MountConfig,
    identity: DeviceIdentity,
    state: SessionState,
    adapter: Option<BlockDeviceAdapter<P::Volume, S>>,
    scratch: Option<S>,
}

impl<P, S> MediaSession<P, S>
where
    P: FlashPartition,
    S: BorrowMut<[u8]>,
{
    /// Creates an unmounted session
    ///
    /// # Arguments
    /// * `partition` - flash partition to mount
    /// * `config` - mount options
    /// * `identity` - strings reported to the host
    /// * `scratch` - buffer for partial erase unit writes. See [BlockDeviceAdapter]
    pub fn new(partition: P, config: MountConfig, identity: DeviceIdentity, scratch: S) -> Self {
        Self {
            partition,
            config,
            identity,
            state: SessionState::Unmounted,
            adapter: None,
            scratch: Some(scratch),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Whether the host sees media
    pub fn is_present(&self) -> bool {
        self.state == SessionState::Active
    }

    /// Geometry of the mounted volume
    pub fn geometry(&self) -> Option<Geometry> {
        self.adapter.as_ref().map(|adapter| adapter.geometry())
    }

    pub fn partition(&self) -> &P {
        &self.partition
    }

    /// Mounts the volume. `Unmounted -> Mounted`
    ///
    /// On failure the session stays `Unmounted`.
    ///
    /// # Errors
    /// * [Mount] - the partition could not be mounted or reported an unusable geometry
    /// * [BufferTooSmall] - the scratch buffer is smaller than the volume's erase unit
    ///
    /// [Mount]: SessionError::Mount
    /// [BufferTooSmall]: SessionError::BufferTooSmall
    pub fn mount(&mut self) -> Result<Geometry, SessionError> {
        if self.state != SessionState::Unmounted {
            return Err(MountError::AlreadyMounted.into());
        }
        let scratch = self.scratch.take().ok_or(SessionError::InvalidState(self.state))?;

        let (volume, geometry) = match flash::mount(&mut self.partition, &self.config) {
            Ok(mounted) => mounted,
            Err(err) => {
                error!("session: mount failed: {}", err);
                self.scratch = Some(scratch);
                return Err(err.into());
            }
        };
        if scratch.borrow().len() < volume.erase_size() as usize {
            error!("session: scratch buffer below erase size {}", volume.erase_size());
            self.partition.unmount(volume);
            self.scratch = Some(scratch);
            return Err(SessionError::BufferTooSmall);
        }

        info!(
            "session: mounted {} sectors of {} bytes",
            geometry.sector_count,
            geometry.sector_size
        );
        self.adapter = Some(BlockDeviceAdapter::with_geometry(volume, scratch, geometry));
        self.enter_state(SessionState::Mounted);
        Ok(geometry)
    }

    /// Exposes the volume to the host. `Mounted | Stopped -> Active`
    ///
    /// Registers the identity and the capacity with `host` and reports media as present.
    pub fn start(&mut self, host: &mut HostSession) -> Result<Geometry, SessionError> {
        match (self.state, self.geometry()) {
            (SessionState::Mounted | SessionState::Stopped, Some(geometry)) => {
                host.register(self.identity, geometry);
                host.set_media_present(true);
                self.enter_state(SessionState::Active);
                Ok(geometry)
            }
            (state, _) => Err(SessionError::InvalidState(state)),
        }
    }

    /// Withdraws the volume from the host. `Active -> Stopped`
    ///
    /// Does nothing in any other state.
    pub fn stop(&mut self, host: &mut HostSession) {
        if self.state == SessionState::Active {
            host.set_media_present(false);
            host.unregister();
            self.enter_state(SessionState::Stopped);
        }
    }

    /// Releases the volume. `Mounted | Stopped -> Unmounted`
    ///
    /// An active session has to be stopped first.
    pub fn unmount(&mut self) -> Result<(), SessionError> {
        match self.state {
            SessionState::Mounted | SessionState::Stopped => {
                if let Some(adapter) = self.adapter.take() {
                    let (volume, scratch) = adapter.release();
                    self.partition.unmount(volume);
                    self.scratch = Some(scratch);
                }
                self.enter_state(SessionState::Unmounted);
                Ok(())
            }
            state => Err(SessionError::InvalidState(state)),
        }
    }

    /// Handles a START STOP UNIT request.
    ///
    /// An eject (`load_eject` without `start`) stops an active session. Every other
    /// combination is acknowledged without a state change.
    pub fn handle_power_event(
        &mut self,
        host: &mut HostSession,
        power_condition: u8,
        start: bool,
        load_eject: bool,
    ) -> bool {
        info!(
            "session: power event {}, start {}, load/eject {} in {}",
            power_condition,
            start,
            load_eject,
            self.state
        );
        if load_eject && !start {
            self.stop(host);
        }
        true
    }

    /// Reads from the volume. See [BlockDeviceAdapter::on_read]
    ///
    /// # Errors
    /// [MediumNotPresent] unless the session is active.
    ///
    /// [MediumNotPresent]: BlockError::MediumNotPresent
    pub fn on_read(&mut self, lba: u32, offset: u32, dst: &mut [u8]) -> Result<usize, BlockError> {
        self.active_adapter()?.on_read(lba, offset, dst)
    }

    /// Writes to the volume. See [BlockDeviceAdapter::on_write]
    ///
    /// # Errors
    /// [MediumNotPresent] unless the session is active.
    ///
    /// [MediumNotPresent]: BlockError::MediumNotPresent
    pub fn on_write(&mut self, lba: u32, offset: u32, src: &[u8]) -> Result<usize, BlockError> {
        self.active_adapter()?.on_write(lba, offset, src)
    }

    fn active_adapter(&mut self) -> Result<&mut BlockDeviceAdapter<P::Volume, S>, BlockError> {
        match (self.state, self.adapter.as_mut()) {
            (SessionState::Active, Some(adapter)) => Ok(adapter),
            _ => Err(BlockError::MediumNotPresent),
        }
    }

    fn enter_state(&mut self, state: SessionState) {
        info!("session: {} -> {}", self.state, state);
        self.state = state;
    }
}

impl<P, S> BlockHandler for MediaSession<P, S>
where
    P: FlashPartition,
    S: BorrowMut<[u8]>,
{
    fn read(&mut self, lba: u32, offset: u32, dst: &mut [u8]) -> Result<usize, BlockError> {
        self.on_read(lba, offset, dst)
    }

    fn write(&mut self, lba: u32, offset: u32, src: &[u8]) -> Result<usize, BlockError> {
        self.on_write(lba, offset, src)
    }

    fn power_event(
        &mut self,
        host: &mut HostSession,
        power_condition: u8,
        start: bool,
        load_eject: bool,
    ) -> bool {
        self.handle_power_event(host, power_condition, start, load_eject)
    }
}
