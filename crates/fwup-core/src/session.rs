//! Update session - high-level orchestrator for one firmware update.
//!
//! An [`Updater`] owns the device broker, observer and target profile. Each
//! call to [`Updater::perform_update`] creates an `UpdateSession` that owns
//! the opened bootloader for the duration of the attempt and is dropped at
//! COMPLETE or ERROR. The device is released on every exit path.

use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::config::TargetProfile;
use crate::events::{TracingObserver, UpdateEvent, UpdateObserver};
use crate::flash::{FlashEngine, FlashError, FlashReport};
use crate::image::{ImageError, PreparedImage, SegmentSpan};
use crate::protocol::{DeviceMemoryMap, DfuState};
use crate::release::{
    FirmwareManifest, ReleaseError, UNKNOWN_VERSION, is_hex_name, is_newer, parse_reported_version,
};
use crate::state::{InvalidTransition, UpdateState, transition};
use crate::transport::{
    DeviceBroker, DeviceCandidate, DfuInterface, DfuTransport, DiscoveryError, TransportError,
};

#[derive(Error, Debug)]
pub enum ChannelError {
    #[error("No response within {0:?}")]
    Timeout(Duration),

    #[error("Command channel is closed")]
    Closed,

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Text command link to the running application firmware.
pub trait CommandChannel {
    /// Send one command and return the device's reply.
    fn send_command(&mut self, command: &str, timeout: Duration) -> Result<String, ChannelError>;

    fn is_open(&self) -> bool;

    fn close(&mut self) -> Result<(), ChannelError>;
}

#[derive(Error, Debug)]
pub enum FetchError {
    #[error("Failed to read {path}: {source}")]
    Io { path: PathBuf, source: io::Error },

    #[error("Artifact '{0}' is not available")]
    Unavailable(String),
}

/// Retrieves release artifacts by file name.
pub trait ArtifactFetcher {
    fn fetch_text(&self, name: &str) -> Result<String, FetchError>;
}

/// Reads artifacts from a local release directory.
pub struct DirectoryFetcher {
    root: PathBuf,
}

impl DirectoryFetcher {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl ArtifactFetcher for DirectoryFetcher {
    fn fetch_text(&self, name: &str) -> Result<String, FetchError> {
        let path = self.root.join(name);
        debug!(path = %path.display(), "Reading artifact");
        std::fs::read_to_string(&path).map_err(|source| FetchError::Io { path, source })
    }
}

/// Where the firmware comes from.
#[derive(Debug, Clone)]
pub enum FirmwareSource {
    /// A HEX file the operator picked.
    Local { file_name: String, text: String },
    /// The HEX artifact of a published release.
    Release { manifest: FirmwareManifest },
}

/// How the device gets into its bootloader.
pub enum BootloaderEntry<'a> {
    /// Send the bootloader-entry command over the application channel.
    Automatic(&'a mut dyn CommandChannel),
    /// The operator already put the device in bootloader mode.
    Manual,
}

/// Result of an update check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateInfo {
    pub available: bool,
    pub current: String,
    pub latest: String,
    /// HEX artifact to fetch, present when an update is available.
    pub artifact: Option<String>,
    pub manifest: FirmwareManifest,
}

/// Summary of a successful update.
#[derive(Debug, Clone)]
pub struct UpdateReport {
    pub version: Option<String>,
    pub device: DeviceCandidate,
    pub flash: FlashReport,
    pub rejected: Vec<SegmentSpan>,
}

/// Primary cause of a failed update.
#[derive(Error, Debug)]
pub enum UpdateFailure {
    #[error(transparent)]
    Image(#[from] ImageError),

    #[error(transparent)]
    Release(#[from] ReleaseError),

    #[error("Firmware download failed: {0}")]
    Fetch(#[from] FetchError),

    #[error("DFU connection failed: {0}")]
    Discovery(#[from] DiscoveryError),

    #[error("Device error: {0}")]
    Transport(#[from] TransportError),

    #[error("Flash failed: {0}")]
    Flash(#[from] FlashError),

    #[error(transparent)]
    Transition(#[from] InvalidTransition),
}

/// A failed update: where it failed, why, and what went wrong while
/// recovering.
#[derive(Error, Debug)]
#[error("Update failed in {state}")]
pub struct UpdateError {
    pub state: UpdateState,
    #[source]
    pub cause: UpdateFailure,
    pub recovery_errors: Vec<TransportError>,
}

impl UpdateError {
    /// The operator dismissed the device request; nothing was written.
    pub fn is_cancelled(&self) -> bool {
        matches!(
            self.cause,
            UpdateFailure::Discovery(DiscoveryError::NoDeviceSelected)
        )
    }
}

/// State of one update attempt.
struct UpdateSession<T: DfuTransport> {
    state: UpdateState,
    image: Option<PreparedImage>,
    transport: Option<T>,
    device: Option<DeviceCandidate>,
    bytes_written: u64,
    bytes_total: u64,
}

impl<T: DfuTransport> UpdateSession<T> {
    fn new() -> Self {
        Self {
            state: UpdateState::Idle,
            image: None,
            transport: None,
            device: None,
            bytes_written: 0,
            bytes_total: 0,
        }
    }

    fn advance(
        &mut self,
        to: UpdateState,
        observer: &dyn UpdateObserver,
    ) -> Result<(), InvalidTransition> {
        let from = self.state;
        self.state = transition(from, to)?;
        observer.on_event(&UpdateEvent::StateChanged { from, to });
        Ok(())
    }
}

/// Firmware updater - orchestrates check, bootloader entry, flashing and
/// recovery.
pub struct Updater<B: DeviceBroker, O: UpdateObserver> {
    broker: B,
    observer: Arc<O>,
    profile: TargetProfile,
    fetcher: Option<Box<dyn ArtifactFetcher>>,
}

impl<B: DeviceBroker> Updater<B, TracingObserver> {
    /// Create an updater with the default tracing observer.
    pub fn new(broker: B, profile: TargetProfile) -> Self {
        Self::with_observer(broker, profile, Arc::new(TracingObserver))
    }
}

impl<B: DeviceBroker, O: UpdateObserver> Updater<B, O> {
    /// Create an updater with a custom observer.
    pub fn with_observer(broker: B, profile: TargetProfile, observer: Arc<O>) -> Self {
        Self {
            broker,
            observer,
            profile,
            fetcher: None,
        }
    }

    /// Source of release artifacts for [`FirmwareSource::Release`].
    pub fn with_fetcher(mut self, fetcher: impl ArtifactFetcher + 'static) -> Self {
        self.fetcher = Some(Box::new(fetcher));
        self
    }

    pub fn profile(&self) -> &TargetProfile {
        &self.profile
    }

    pub fn broker(&self) -> &B {
        &self.broker
    }

    fn status(&self, state: UpdateState, message: impl Into<String>) {
        self.observer.on_event(&UpdateEvent::Status {
            state,
            message: message.into(),
        });
    }

    /// Compare the running firmware with a published release.
    ///
    /// The running version is queried over `channel` when one is given; any
    /// failure counts as `0.0.0`.
    #[instrument(skip_all, fields(latest = %manifest.version))]
    pub fn check_for_update(
        &mut self,
        channel: Option<&mut dyn CommandChannel>,
        manifest: FirmwareManifest,
    ) -> Result<UpdateInfo, ReleaseError> {
        let from = UpdateState::Idle;
        let to = UpdateState::CheckingVersion;
        self.observer.on_event(&UpdateEvent::StateChanged { from, to });
        self.status(to, "Checking firmware version...");

        let current = match channel {
            Some(channel) => self.query_version(channel),
            None => UNKNOWN_VERSION.to_string(),
        };

        self.status(to, "Checking for updates...");
        let available = is_newer(&manifest.version, Some(&current));
        let artifact = if available {
            Some(manifest.hex_artifact()?.to_string())
        } else {
            None
        };
        info!(current = %current, available, "Update check finished");

        Ok(UpdateInfo {
            available,
            current,
            latest: manifest.version.clone(),
            artifact,
            manifest,
        })
    }

    fn query_version(&self, channel: &mut dyn CommandChannel) -> String {
        match channel.send_command(
            &self.profile.version_command,
            self.profile.version_command_timeout(),
        ) {
            Ok(response) => parse_reported_version(&response),
            Err(e) => {
                warn!(error = %e, "Could not get firmware version");
                UNKNOWN_VERSION.to_string()
            }
        }
    }

    /// Run a complete update.
    ///
    /// On failure the session moves to ERROR, one recovery pass runs against
    /// the device if it was opened, and the original cause is returned with
    /// any recovery errors attached.
    #[instrument(skip_all)]
    pub fn perform_update(
        &mut self,
        source: FirmwareSource,
        entry: BootloaderEntry<'_>,
    ) -> Result<UpdateReport, UpdateError> {
        let mut session = UpdateSession::new();
        match self.run(&mut session, source, entry) {
            Ok(report) => Ok(report),
            Err(cause) => Err(self.fail(session, cause)),
        }
    }

    fn run(
        &mut self,
        session: &mut UpdateSession<B::Transport>,
        source: FirmwareSource,
        entry: BootloaderEntry<'_>,
    ) -> Result<UpdateReport, UpdateFailure> {
        let observer = Arc::clone(&self.observer);
        let observer: &dyn UpdateObserver = &*observer;

        let (text, version) = self.obtain_firmware(session, source)?;
        self.prepare_image(session, &text)?;

        match entry {
            BootloaderEntry::Automatic(channel) => {
                session.advance(UpdateState::EnteringDfu, observer)?;
                self.status(session.state, "Entering DFU mode...");
                self.enter_bootloader(channel);
            }
            BootloaderEntry::Manual => {
                session.advance(UpdateState::WaitingDfu, observer)?;
                self.status(
                    session.state,
                    "Waiting for DFU device (enter DFU mode manually)...",
                );
            }
        }

        session.advance(UpdateState::ConnectingDfu, observer)?;
        self.status(session.state, "Connecting to bootloader...");
        self.connect(session)?;

        session.advance(UpdateState::Flashing, observer)?;
        self.status(session.state, "Flashing firmware...");
        let flash = self.flash(session)?;

        session.advance(UpdateState::Rebooting, observer)?;
        self.status(session.state, "Rebooting device...");
        self.leave_bootloader(session);
        info!(
            written = session.bytes_written,
            total = session.bytes_total,
            "Firmware written"
        );

        session.advance(UpdateState::Complete, observer)?;
        let message = match &version {
            Some(v) => format!("Firmware updated successfully to {}", v),
            None => "Firmware updated successfully".to_string(),
        };
        self.status(session.state, message);
        observer.on_event(&UpdateEvent::Complete {
            version: version.clone(),
        });

        let rejected = session
            .image
            .take()
            .map(|image| image.rejected)
            .unwrap_or_default();
        let device = session
            .device
            .take()
            .ok_or(DiscoveryError::NoDeviceSelected)?;

        Ok(UpdateReport {
            version,
            device,
            flash,
            rejected,
        })
    }

    /// HEX text and the version it carries, if known.
    fn obtain_firmware(
        &self,
        session: &mut UpdateSession<B::Transport>,
        source: FirmwareSource,
    ) -> Result<(String, Option<String>), UpdateFailure> {
        match source {
            FirmwareSource::Local { file_name, text } => {
                self.status(session.state, "Using local firmware file...");
                if !is_hex_name(&file_name) {
                    return Err(ImageError::NotHexFile(file_name).into());
                }
                Ok((text, None))
            }
            FirmwareSource::Release { manifest } => {
                session.advance(UpdateState::Downloading, &*self.observer)?;
                let artifact = manifest.hex_artifact()?;
                self.status(
                    session.state,
                    format!("Downloading firmware {}...", artifact),
                );
                let fetcher = self
                    .fetcher
                    .as_ref()
                    .ok_or_else(|| FetchError::Unavailable(artifact.to_string()))?;
                let text = fetcher.fetch_text(artifact)?;
                Ok((text, Some(manifest.version.clone())))
            }
        }
    }

    /// Parse, filter and merge before anything touches the device.
    fn prepare_image(
        &self,
        session: &mut UpdateSession<B::Transport>,
        text: &str,
    ) -> Result<(), UpdateFailure> {
        let prepared =
            PreparedImage::from_hex(text, &self.profile.safe_ranges, self.profile.merge_gap);
        let rejected = match &prepared {
            Ok(image) => image.rejected.as_slice(),
            Err(ImageError::NoSafeSegments(e)) => e.rejected.as_slice(),
            Err(_) => &[],
        };
        for span in rejected {
            self.observer
                .on_event(&UpdateEvent::SegmentSkipped { span: *span });
        }
        let image = prepared?;

        let default_map = self
            .profile
            .default_memory_map()
            .map_err(ImageError::from)?;
        image.verify_erase_footprint(&default_map, &self.profile.safe_ranges)?;

        session.bytes_total = image.total_bytes();
        session.image = Some(image);
        Ok(())
    }

    /// Send the bootloader-entry command. The device reboots while
    /// answering, so a failed command is expected.
    fn enter_bootloader(&self, channel: &mut dyn CommandChannel) {
        match channel.send_command(
            &self.profile.bootloader_command,
            self.profile.bootloader_command_timeout(),
        ) {
            Ok(response) => debug!(response = %response, "Bootloader command answered"),
            Err(e) => debug!(error = %e, "Bootloader command sent, device disconnecting"),
        }

        thread::sleep(self.profile.bootloader_settle());

        if channel.is_open() {
            if let Err(e) = channel.close() {
                debug!(error = %e, "Command channel already closed");
            }
        }
    }

    /// Find, open and normalize the bootloader.
    fn connect(&mut self, session: &mut UpdateSession<B::Transport>) -> Result<(), UpdateFailure> {
        let identity = self.profile.bootloader;
        let authorized = self.broker.authorized_devices(identity)?;
        let device = match authorized.into_iter().next() {
            Some(device) => device,
            None => {
                self.status(session.state, "Select the STM32 bootloader device...");
                self.broker
                    .request_device(identity)?
                    .ok_or(DiscoveryError::NoDeviceSelected)?
            }
        };
        info!(device = %device, "Bootloader device found");

        let interface = self
            .broker
            .dfu_interfaces(&device)?
            .into_iter()
            .next()
            .ok_or_else(|| DiscoveryError::NoDfuInterface(device.to_string()))?;

        let transport = self.broker.open(&device, &interface)?;
        session.device = Some(device.clone());
        let transport = session.transport.insert(transport);

        self.observer.on_event(&UpdateEvent::DeviceConnected {
            vid: device.identity.vendor_id,
            pid: device.identity.product_id,
            interface: interface.name.clone(),
        });

        let map = self.memory_map_for(&interface)?;
        if let Some(image) = &session.image {
            image.verify_erase_footprint(&map, &self.profile.safe_ranges)?;
        }
        transport.bind_memory_map(map);

        normalize(transport)?;
        Ok(())
    }

    fn memory_map_for(&self, interface: &DfuInterface) -> Result<DeviceMemoryMap, ImageError> {
        let parsed = interface
            .name
            .as_deref()
            .map(DeviceMemoryMap::parse_descriptor);
        match parsed {
            Some(Ok(map)) => {
                debug!(map = %map.name, sectors = map.sectors.len(), "Using device memory map");
                Ok(map)
            }
            Some(Err(e)) => {
                let message = format!("{}; using the default sector map", e);
                warn!("{}", message);
                self.observer.on_event(&UpdateEvent::Warning { message });
                Ok(self.profile.default_memory_map()?)
            }
            None => {
                let message = "No memory descriptor from device, using the default sector map";
                warn!("{}", message);
                self.observer.on_event(&UpdateEvent::Warning {
                    message: message.to_string(),
                });
                Ok(self.profile.default_memory_map()?)
            }
        }
    }

    fn flash(
        &self,
        session: &mut UpdateSession<B::Transport>,
    ) -> Result<FlashReport, UpdateFailure> {
        let (Some(transport), Some(image)) = (session.transport.as_ref(), session.image.as_ref())
        else {
            return Err(TransportError::NotOpen.into());
        };

        let report = FlashEngine::new(transport, &*self.observer)
            .with_block_size(self.profile.block_size)
            .flash(&image.segments)?;

        session.bytes_written = report.bytes_written;
        Ok(report)
    }

    /// Release the device and give it time to boot the new firmware.
    fn leave_bootloader(&self, session: &mut UpdateSession<B::Transport>) {
        if let Some(mut transport) = session.transport.take() {
            if let Err(e) = transport.close() {
                debug!(error = %e, "Device already gone after manifestation");
            }
        }
        thread::sleep(self.profile.reboot_settle());
    }

    fn fail(&self, mut session: UpdateSession<B::Transport>, cause: UpdateFailure) -> UpdateError {
        let state = session.state;
        let observer = &*self.observer;

        if session.advance(UpdateState::Error, observer).is_err() {
            session.state = UpdateState::Error;
        }

        let error = UpdateError {
            state,
            cause,
            recovery_errors: Vec::new(),
        };
        if error.is_cancelled() {
            self.status(UpdateState::Error, "No DFU device selected or found");
        } else {
            observer.on_event(&UpdateEvent::Error {
                state,
                message: error.cause.to_string(),
            });
        }

        let recovery_errors = match session.transport.take() {
            Some(transport) => self.recover(transport),
            None => Vec::new(),
        };
        UpdateError {
            recovery_errors,
            ..error
        }
    }

    /// One best-effort pass: clear a pending error, abort, release the
    /// device. Every step runs regardless of earlier failures.
    fn recover(&self, mut transport: B::Transport) -> Vec<TransportError> {
        self.status(UpdateState::Error, "Attempting recovery...");
        let mut errors = Vec::new();

        match transport.get_status() {
            Ok(status) if status.state == DfuState::Error => {
                if let Err(e) = transport.clear_status() {
                    errors.push(e);
                }
            }
            Ok(_) => {}
            Err(e) => errors.push(e),
        }
        if let Err(e) = transport.abort() {
            errors.push(e);
        }
        if let Err(e) = transport.close() {
            errors.push(e);
        }

        for e in &errors {
            warn!(error = %e, "Recovery step failed");
        }
        errors
    }
}

/// Bring the device to dfuIDLE before flashing.
fn normalize<T: DfuTransport>(transport: &T) -> Result<(), TransportError> {
    let state = transport.get_state()?;
    debug!(state = %state, "Initial DFU state");
    if state == DfuState::Error {
        transport.clear_status()?;
    }
    if state != DfuState::DfuIdle {
        transport.abort()?;
    }
    Ok(())
}
