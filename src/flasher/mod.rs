//! Write a firmware image to a target device
//!
//! The [Flasher] drives the bootloader through a fixed sequence: reset the chip
//! into its bootloader and synchronize, transfer the image in blocks, compare
//! the device's digest of what it received, and reboot into the new firmware.

use std::{
    thread::sleep,
    time::{Duration, Instant},
};

use log::{debug, error, info, warn};
use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};
use strum::Display;

use self::protocol::{LoaderCommand, LoaderReply, MD5_LEN};
use crate::{
    codec::{RawFrameDecoder, MAX_PAYLOAD},
    connection::{
        reset::{construct_reset_strategy_sequence, HardReset, ResetStrategy},
        Connection,
        Incoming,
    },
    error::{ConnectionError, Error, FlashError, ResultExt, TimedOutCommand},
    profile::FlashConfig,
    progress::ProgressCallbacks,
};

pub mod protocol;

/// Largest image the bootloader accepts
pub const MAX_IMAGE_SIZE: usize = 16 * 1024 * 1024;

const MAX_SYNC_ATTEMPTS: usize = 3;
const BLOCK_HEADER_LEN: usize = 16;
const MAX_CHUNK_SIZE: usize = MAX_PAYLOAD - BLOCK_HEADER_LEN;
/// Time for the bridge and the bootloader to settle on a new baud rate
const BAUD_SETTLE: Duration = Duration::from_millis(50);

/// Tunables of the upload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct FlashSettings {
    /// Bytes per data block
    pub chunk_size: usize,
    /// Pause between consecutive blocks in slow mode
    pub slow_mode_delay_ms: u64,
    /// Bound on the whole upload
    pub total_timeout_ms: u64,
}

impl Default for FlashSettings {
    fn default() -> Self {
        FlashSettings {
            chunk_size: 4096,
            slow_mode_delay_ms: 20,
            total_timeout_ms: 300_000,
        }
    }
}

impl FlashSettings {
    pub fn chunk_size(&self) -> usize {
        self.chunk_size.clamp(1, MAX_CHUNK_SIZE)
    }

    pub fn slow_mode_delay(&self) -> Duration {
        Duration::from_millis(self.slow_mode_delay_ms)
    }

    pub fn total_timeout(&self) -> Duration {
        Duration::from_millis(self.total_timeout_ms)
    }
}

/// Stage of a firmware upload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum FlashState {
    Idle,
    ResettingToBootloader,
    Transferring,
    Verifying,
    Rebooting,
    Failed,
}

/// Stage and completion of the current or last upload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlashStatus {
    pub state: FlashState,
    /// Percentage of the image transferred, `0..=100`
    pub progress: u8,
}

impl Default for FlashStatus {
    fn default() -> Self {
        FlashStatus {
            state: FlashState::Idle,
            progress: 0,
        }
    }
}

/// Inserts the pause between blocks in slow mode
pub trait Pacer: Send {
    fn pause(&mut self, delay: Duration);
}

/// [Pacer] which sleeps the current thread
#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadSleep;

impl Pacer for ThreadSleep {
    fn pause(&mut self, delay: Duration) {
        sleep(delay);
    }
}

/// Uploads firmware images through the bootloader
pub struct Flasher {
    settings: FlashSettings,
    pacer: Box<dyn Pacer>,
}

impl Default for Flasher {
    fn default() -> Self {
        Flasher::new(FlashSettings::default())
    }
}

impl Flasher {
    pub fn new(settings: FlashSettings) -> Self {
        Flasher {
            settings,
            pacer: Box::new(ThreadSleep),
        }
    }

    /// Replace how slow-mode pauses are taken
    pub fn with_pacer(mut self, pacer: impl Pacer + 'static) -> Self {
        self.pacer = Box::new(pacer);
        self
    }

    pub fn settings(&self) -> &FlashSettings {
        &self.settings
    }

    /// Write `image` to the device behind `connection`
    ///
    /// The connection is held exclusively for the whole upload. Whatever the
    /// outcome, the serial line is returned to its configured settings
    /// afterwards unless the connection faulted.
    pub fn flash(
        &mut self,
        connection: &mut Connection,
        config: &FlashConfig,
        image: &[u8],
        mut progress: Option<&mut dyn ProgressCallbacks>,
    ) -> Result<(), Error> {
        if image.is_empty() {
            return Err(FlashError::EmptyImage.into());
        }
        if image.len() > MAX_IMAGE_SIZE {
            return Err(FlashError::ImageTooLarge {
                size: image.len(),
                max: MAX_IMAGE_SIZE,
            }
            .into());
        }

        connection.begin_flashing()?;

        let mut upload = Upload {
            connection,
            decoder: RawFrameDecoder::new(),
            sequence: 0,
            started: Instant::now(),
            total_timeout: self.settings.total_timeout(),
        };

        let result = upload.run(
            config,
            image,
            &self.settings,
            self.pacer.as_mut(),
            &mut progress,
        );

        let connection = upload.connection;
        let result = match result {
            Ok(()) => connection.restore_lines().map(|_| {
                info!("Flashed {} bytes", image.len());
                set_stage(&mut progress, FlashState::Idle);
            }),
            Err(err) => {
                error!("Firmware upload failed: {err}");
                set_stage(&mut progress, FlashState::Failed);

                if connection.is_usable() {
                    if let Err(restore_err) = connection.restore_lines() {
                        warn!("Failed to restore the serial settings: {restore_err}");
                    }
                }
                Err(err)
            }
        };

        connection.end_flashing();

        result.flashing()
    }
}

fn set_stage(progress: &mut Option<&mut dyn ProgressCallbacks>, state: FlashState) {
    if let Some(cb) = progress.as_mut() {
        cb.stage(state);
    }
}

/// State of one upload in progress
struct Upload<'a> {
    connection: &'a mut Connection,
    decoder: RawFrameDecoder,
    sequence: u16,
    started: Instant,
    total_timeout: Duration,
}

impl Upload<'_> {
    fn run(
        &mut self,
        config: &FlashConfig,
        image: &[u8],
        settings: &FlashSettings,
        pacer: &mut dyn Pacer,
        progress: &mut Option<&mut dyn ProgressCallbacks>,
    ) -> Result<(), Error> {
        info!("Resetting {} into its bootloader", self.connection.port_path());
        set_stage(progress, FlashState::ResettingToBootloader);

        let chip = self.enter_bootloader(config)?;
        if !chip.eq_ignore_ascii_case(&config.chip) {
            return Err(FlashError::ChipMismatch {
                expected: config.chip.clone(),
                found: chip,
            }
            .into());
        }

        let serial_baud = self.connection.serial_config().baud_rate;
        if config.baud_rate != serial_baud {
            self.command(
                LoaderCommand::ChangeBaudrate,
                protocol::change_baud_payload(config.baud_rate, serial_baud),
            )?;
            self.connection.set_baud(config.baud_rate)?;
            sleep(BAUD_SETTLE);
            self.connection.clear_input()?;
            self.decoder.reset();
        }
        if config.flow_control {
            self.connection.set_flow_control(true)?;
        }

        info!("Transferring {} bytes", image.len());
        set_stage(progress, FlashState::Transferring);
        self.transfer(config, image, settings, pacer, progress)?;

        info!("Verifying");
        set_stage(progress, FlashState::Verifying);
        self.verify(image)?;

        info!("Rebooting");
        set_stage(progress, FlashState::Rebooting);
        self.command(LoaderCommand::FlashEnd, protocol::end_payload(true))?;
        HardReset.reset(self.connection)?;

        Ok(())
    }

    /// Reset into the bootloader and synchronize, returning the chip name it
    /// reports
    fn enter_bootloader(&mut self, config: &FlashConfig) -> Result<String, Error> {
        for strategy in construct_reset_strategy_sequence(config) {
            self.check_deadline()?;

            strategy.reset(self.connection)?;
            self.connection.clear_input()?;
            self.decoder.reset();

            for _ in 0..MAX_SYNC_ATTEMPTS {
                match self.command(LoaderCommand::Sync, protocol::sync_payload()) {
                    Ok(data) => {
                        let chip = String::from_utf8_lossy(&data).trim().to_string();
                        debug!("Bootloader reports chip '{chip}'");
                        return Ok(chip);
                    }
                    Err(Error::Connection(ConnectionError::Timeout(_))) => {
                        debug!("No sync reply, retrying");
                    }
                    Err(err) => return Err(err),
                }
            }
        }

        Err(FlashError::EnterBootloader.into())
    }

    fn transfer(
        &mut self,
        config: &FlashConfig,
        image: &[u8],
        settings: &FlashSettings,
        pacer: &mut dyn Pacer,
        progress: &mut Option<&mut dyn ProgressCallbacks>,
    ) -> Result<(), Error> {
        let chunk_size = settings.chunk_size();
        let blocks = image.len().div_ceil(chunk_size);

        self.command(
            LoaderCommand::FlashBegin,
            protocol::begin_payload(
                image.len() as u32,
                blocks as u32,
                chunk_size as u32,
                &config.board,
            ),
        )?;

        if let Some(cb) = progress.as_mut() {
            cb.init(image.len());
        }

        let mut written = 0;
        for (i, block) in image.chunks(chunk_size).enumerate() {
            if i > 0 && config.slow_mode {
                pacer.pause(settings.slow_mode_delay().min(self.remaining()));
            }

            self.command(
                LoaderCommand::FlashData,
                protocol::data_payload(i as u32, block),
            )?;

            written += block.len();
            if let Some(cb) = progress.as_mut() {
                cb.update(written);
            }
        }

        if let Some(cb) = progress.as_mut() {
            cb.finish();
        }

        Ok(())
    }

    fn verify(&mut self, image: &[u8]) -> Result<(), Error> {
        let data = self.command(
            LoaderCommand::FlashMd5,
            protocol::md5_payload(image.len() as u32),
        )?;
        let (actual_len, actual) = protocol::parse_md5_reply(&data)?;

        let mut expected = [0u8; MD5_LEN];
        expected.copy_from_slice(&Md5::digest(image));
        let expected_len = image.len() as u32;

        if actual_len != expected_len || actual != expected {
            return Err(Error::VerificationFailed {
                expected_len,
                actual_len,
                expected: hex(&expected),
                actual: hex(&actual),
            });
        }

        Ok(())
    }

    fn deadline(&self) -> Instant {
        self.started + self.total_timeout
    }

    /// Time left before the whole upload times out
    fn remaining(&self) -> Duration {
        self.deadline().saturating_duration_since(Instant::now())
    }

    fn check_deadline(&self) -> Result<(), Error> {
        if Instant::now() >= self.deadline() {
            return Err(FlashError::Timeout(self.total_timeout).into());
        }

        Ok(())
    }

    /// Send one loader command and wait for its reply data
    fn command(&mut self, command: LoaderCommand, payload: Vec<u8>) -> Result<Vec<u8>, Error> {
        self.check_deadline()?;

        self.sequence = self.sequence.wrapping_add(1);
        let sequence = self.sequence;

        let bytes = protocol::request(command, sequence, payload)?;
        self.connection.write(&bytes).for_command(command)?;

        // No reply wait outlives the upload as a whole
        let deadline = (Instant::now() + command.timeout()).min(self.deadline());
        loop {
            let raw = match self
                .connection
                .read_raw_frame(&mut self.decoder, deadline)
                .for_command(command)?
            {
                Incoming::Frame(raw) => raw,
                Incoming::Malformed(_) => continue,
                Incoming::Idle => {
                    self.check_deadline()?;
                    return Err(Error::Connection(ConnectionError::Timeout(
                        TimedOutCommand::new(command),
                    )));
                }
            };

            let reply = match LoaderReply::parse(raw) {
                Ok(reply) => reply,
                Err(err) => {
                    warn!("Ignoring unexpected frame while waiting for {command}: {err}");
                    continue;
                }
            };

            if reply.command != command || reply.sequence != sequence {
                debug!(
                    "Ignoring stale {} reply #{} while waiting for {command} #{sequence}",
                    reply.command, reply.sequence
                );
                continue;
            }

            if reply.status != 0 {
                return Err(FlashError::Rejected {
                    command: command.to_string(),
                    code: reply.error,
                }
                .into());
            }

            return Ok(reply.data);
        }
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settings_defaults() {
        let settings = FlashSettings::default();
        assert_eq!(settings.chunk_size(), 4096);
        assert_eq!(settings.slow_mode_delay(), Duration::from_millis(20));

        let settings = FlashSettings {
            chunk_size: 1 << 20,
            ..settings
        };
        assert_eq!(settings.chunk_size(), MAX_CHUNK_SIZE);

        let settings: FlashSettings = toml::from_str("slow-mode-delay-ms = 5").unwrap();
        assert_eq!(settings.slow_mode_delay(), Duration::from_millis(5));
        assert_eq!(settings.chunk_size, 4096);
    }

    #[test]
    fn rejects_empty_and_oversized_images() {
        use crate::{connection::Connection, profile::DeviceProfile};

        struct NoPort;

        impl crate::connection::Transport for NoPort {
            fn name(&self) -> String {
                "none".into()
            }
            fn read(&mut self, _buf: &mut [u8]) -> std::io::Result<usize> {
                Err(std::io::ErrorKind::TimedOut.into())
            }
            fn write_all(&mut self, _bytes: &[u8]) -> std::io::Result<()> {
                Ok(())
            }
            fn flush(&mut self) -> std::io::Result<()> {
                Ok(())
            }
            fn baud_rate(&self) -> Result<u32, Error> {
                Ok(115_200)
            }
            fn set_baud_rate(&mut self, _: u32) -> Result<(), Error> {
                Ok(())
            }
            fn set_data_bits(&mut self, _: serialport::DataBits) -> Result<(), Error> {
                Ok(())
            }
            fn set_stop_bits(&mut self, _: serialport::StopBits) -> Result<(), Error> {
                Ok(())
            }
            fn set_flow_control(&mut self, _: bool) -> Result<(), Error> {
                Ok(())
            }
            fn set_timeout(&mut self, _: Duration) -> Result<(), Error> {
                Ok(())
            }
            fn write_data_terminal_ready(&mut self, _: bool) -> Result<(), Error> {
                Ok(())
            }
            fn write_request_to_send(&mut self, _: bool) -> Result<(), Error> {
                Ok(())
            }
            fn clear_input(&mut self) -> Result<(), Error> {
                Ok(())
            }
        }

        let profile = DeviceProfile::ecool();
        let mut connection =
            Connection::from_transport("none", Box::new(NoPort), profile.serial()).unwrap();
        let mut flasher = Flasher::default();

        assert!(matches!(
            flasher.flash(&mut connection, profile.flash(), &[], None),
            Err(Error::Flash(FlashError::EmptyImage))
        ));
        assert!(matches!(
            flasher.flash(
                &mut connection,
                profile.flash(),
                &vec![0; MAX_IMAGE_SIZE + 1],
                None
            ),
            Err(Error::Flash(FlashError::ImageTooLarge { .. }))
        ));
    }
}
