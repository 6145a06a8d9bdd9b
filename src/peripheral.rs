//! Lifecycle of one peripheral
//!
//! [Peripheral] is what an editor integration holds on to: it finds the
//! device, keeps a [Session] against it, runs blocks by name and uploads the
//! profile's firmware.

use std::{fs, path::Path, time::Duration};

use log::{debug, info};

use crate::{
    blocks::BlockTable,
    codec::Value,
    command::{CommandRequest, CommandResult},
    connection::{Connection, ConnectionState, Transport, DEFAULT_CONNECT_TIMEOUT},
    error::Error,
    flasher::{FlashSettings, Flasher},
    profile::DeviceProfile,
    progress::ProgressCallbacks,
    registry::{discover, PortCandidate, PortEnumerator, SystemPorts},
    session::{Session, SessionConfig},
};

/// A peripheral described by a [DeviceProfile]
#[derive(Debug)]
pub struct Peripheral {
    profile: DeviceProfile,
    blocks: BlockTable,
    session_config: SessionConfig,
    flash_settings: FlashSettings,
    connect_timeout: Duration,
    session: Option<Session>,
    /// Port of the last successful connection
    port: Option<String>,
}

impl Peripheral {
    /// Fails if the block table does not match the command set
    pub fn new(profile: DeviceProfile) -> Result<Self, Error> {
        Ok(Peripheral {
            profile,
            blocks: BlockTable::load()?,
            session_config: SessionConfig::default(),
            flash_settings: FlashSettings::default(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            session: None,
            port: None,
        })
    }

    /// Applies to sessions opened from now on
    pub fn with_session_config(mut self, config: SessionConfig) -> Self {
        self.session_config = config;
        self
    }

    pub fn with_flash_settings(mut self, settings: FlashSettings) -> Self {
        self.flash_settings = settings;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn profile(&self) -> &DeviceProfile {
        &self.profile
    }

    pub fn blocks(&self) -> &BlockTable {
        &self.blocks
    }

    /// Attached ports matching the profile, oldest first
    pub fn scan(&self) -> Result<Vec<PortCandidate>, Error> {
        self.scan_with(&SystemPorts)
    }

    pub fn scan_with(&self, enumerator: &dyn PortEnumerator) -> Result<Vec<PortCandidate>, Error> {
        discover(&self.profile, enumerator)
    }

    /// Open `port` and start a session on it
    ///
    /// An existing session is closed first.
    pub fn connect(&mut self, port: &str) -> Result<(), Error> {
        self.disconnect();

        let connection = Connection::open(port, self.profile.serial(), self.connect_timeout)?;
        self.start(connection)
    }

    /// Start a session on a transport produced by `opener`
    ///
    /// `opener` is called again whenever the connection is reopened.
    pub fn connect_transport<F>(&mut self, port: &str, opener: F) -> Result<(), Error>
    where
        F: FnMut() -> Result<Box<dyn Transport>, Error> + Send + 'static,
    {
        self.disconnect();

        let connection =
            Connection::with_opener(port, self.profile.serial(), self.connect_timeout, opener)?;
        self.start(connection)
    }

    /// Connect to the earliest attached matching port
    pub fn connect_first(&mut self) -> Result<(), Error> {
        let candidate = self
            .scan()?
            .into_iter()
            .next()
            .ok_or(Error::NoMatchingDevice)?;

        self.connect(&candidate.port_name)
    }

    fn start(&mut self, connection: Connection) -> Result<(), Error> {
        let port = connection.port_path().to_string();
        let session = Session::new(connection, self.session_config)?;

        info!("Peripheral '{}' connected on {port}", self.profile.id());
        self.session = Some(session);
        self.port = Some(port);

        Ok(())
    }

    /// Close the session; does nothing when not connected
    pub fn disconnect(&mut self) {
        if let Some(session) = self.session.take() {
            debug!("Disconnecting from {}", session.port_path());
        }
    }

    /// Reopen the connection, clearing a fault
    ///
    /// Without a live session, the last port is connected again.
    pub fn reconnect(&mut self) -> Result<(), Error> {
        if let Some(session) = &self.session {
            return session.reopen();
        }

        let port = self.port.clone().ok_or(Error::NotConnected)?;
        self.connect(&port)
    }

    pub fn is_connected(&self) -> bool {
        self.session
            .as_ref()
            .is_some_and(|session| session.state() == ConnectionState::Connected)
    }

    pub fn session(&self) -> Result<&Session, Error> {
        self.session.as_ref().ok_or(Error::NotConnected)
    }

    /// Run the block `name` with named textual arguments
    ///
    /// Omitted arguments take the block's defaults.
    pub fn run_block(&self, name: &str, args: &[(&str, &str)]) -> Result<Option<Value>, Error> {
        let request = self.blocks.request(name, args)?;
        self.run(request)?.into_result()
    }

    pub fn run(&self, request: CommandRequest) -> Result<CommandResult, Error> {
        self.session()?.submit(request)
    }

    /// Upload the profile's firmware, resolved against `firmware_dir`
    pub fn upload_firmware(
        &self,
        firmware_dir: &Path,
        progress: Option<Box<dyn ProgressCallbacks + Send>>,
    ) -> Result<(), Error> {
        let path = self.profile.firmware_path(firmware_dir);
        let image = fs::read(&path).map_err(|e| Error::FirmwareNotFound(path.clone(), e))?;

        info!("Uploading {} ({} bytes)", path.display(), image.len());
        self.upload_image(image, progress)
    }

    pub fn upload_image(
        &self,
        image: Vec<u8>,
        progress: Option<Box<dyn ProgressCallbacks + Send>>,
    ) -> Result<(), Error> {
        let session = self.session()?;
        let flasher = Flasher::new(self.flash_settings);

        session.flash(flasher, self.profile.flash().clone(), image, progress)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_connected() {
        let peripheral = Peripheral::new(DeviceProfile::ecool()).unwrap();

        assert!(!peripheral.is_connected());
        assert!(matches!(
            peripheral.run_block("screenClear", &[]),
            Err(Error::NotConnected)
        ));
    }

    #[test]
    fn missing_firmware() {
        let dir = tempfile::tempdir().unwrap();
        let peripheral = Peripheral::new(DeviceProfile::ecool()).unwrap();

        let err = peripheral.upload_firmware(dir.path(), None).unwrap_err();
        assert!(matches!(err, Error::FirmwareNotFound(path, _) if path.ends_with("canmv_yahboom_v2.1.1.bin")));
    }

    #[test]
    fn reconnect_without_port() {
        let mut peripheral = Peripheral::new(DeviceProfile::ecool()).unwrap();
        assert!(matches!(peripheral.reconnect(), Err(Error::NotConnected)));
    }
}
