//! Library and application errors

use std::{
    fmt::{Display, Formatter},
    io,
    path::PathBuf,
};

use miette::Diagnostic;
use thiserror::Error;

use crate::command::DeviceFault;

/// All possible errors returned by periphlink
#[derive(Debug, Diagnostic, Error)]
#[non_exhaustive]
pub enum Error {
    #[error("Error while communicating with the device")]
    #[diagnostic(transparent)]
    Connection(#[source] ConnectionError),

    #[error("Received malformed data from the device")]
    #[diagnostic(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("The operation `{0}` is not supported by this device")]
    #[diagnostic(
        code(periphlink::unsupported_operation),
        help("Run `periphlink blocks` to list the operations this device understands")
    )]
    UnsupportedOperation(String),

    #[error("Invalid arguments for `{opcode}`: {reason}")]
    #[diagnostic(code(periphlink::invalid_arguments))]
    InvalidArguments { opcode: String, reason: String },

    #[error("The device is busy with another operation")]
    #[diagnostic(
        code(periphlink::busy),
        help("Retry once the current command or firmware upload has completed")
    )]
    Busy,

    #[error("The device did not answer `{0}` in time")]
    #[diagnostic(code(periphlink::timed_out), help("Retrying the command will likely help"))]
    TimedOut(String),

    #[error("The device stopped responding after {0} consecutive timeouts")]
    #[diagnostic(
        code(periphlink::device_unresponsive),
        help("Reconnect the device; the serial connection must be reopened")
    )]
    DeviceUnresponsive(u32),

    #[error("The device rejected `{opcode}`: {fault}")]
    #[diagnostic(code(periphlink::device_error))]
    Device { opcode: String, fault: DeviceFault },

    #[error("The command was cancelled")]
    #[diagnostic(code(periphlink::cancelled))]
    Cancelled,

    #[error("The session has been closed")]
    #[diagnostic(
        code(periphlink::session_closed),
        help("Connect to the device again")
    )]
    SessionClosed,

    #[error("Firmware upload failed")]
    #[diagnostic(transparent)]
    Flash(#[source] FlashError),

    #[error("Communication error while flashing device")]
    #[diagnostic(
        code(periphlink::flashing),
        help("The device firmware may be incomplete; reconnect the device and flash it again")
    )]
    Flashing(#[source] ConnectionError),

    #[error(
        "Verification of the flashed image failed: expected {expected_len} bytes with digest \
         {expected}, device reported {actual_len} bytes with digest {actual}"
    )]
    #[diagnostic(
        code(periphlink::verification_failed),
        help("The device firmware state is uncertain; flash the image again before using the device")
    )]
    VerificationFailed {
        expected_len: u32,
        actual_len: u32,
        expected: String,
        actual: String,
    },

    #[error("Invalid device profile: {0}")]
    #[diagnostic(code(periphlink::invalid_profile))]
    InvalidProfile(String),

    #[error("Invalid session configuration: {0}")]
    #[diagnostic(
        code(periphlink::invalid_session_config),
        help("Check the `[session]` section of the configuration file")
    )]
    InvalidSessionConfig(String),

    #[error("Invalid block table: {0}")]
    #[diagnostic(code(periphlink::invalid_block_table))]
    InvalidBlockTable(String),

    #[error("Failed to open firmware image {0}")]
    #[diagnostic(
        code(periphlink::firmware_not_found),
        help("Check the `firmware_dir` setting or pass the image with `--firmware`")
    )]
    FirmwareNotFound(PathBuf, #[source] io::Error),

    #[error("No serial port matches the device filters")]
    #[diagnostic(
        code(periphlink::no_matching_device),
        help("Make sure the device is connected and its USB-UART driver is installed")
    )]
    NoMatchingDevice,

    #[error("The serial port '{0}' could not be found")]
    #[diagnostic(
        code(periphlink::serial_not_found),
        help("Make sure the correct device is connected to the host system")
    )]
    SerialNotFound(String),

    #[error("Not connected to a device")]
    #[diagnostic(code(periphlink::not_connected), help("Connect to the device first"))]
    NotConnected,

    #[cfg(feature = "cli")]
    #[error(transparent)]
    #[diagnostic(code(periphlink::dialoguer_error))]
    DialoguerError(#[from] dialoguer::Error),
}

/// How a caller is expected to recover from an [Error]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recovery {
    /// Retrying the same operation will likely succeed
    Retry,
    /// The connection must be reopened first
    Reconnect,
    /// Someone has to change the request, the configuration or the device
    OperatorAction,
}

impl Error {
    /// Classify the error by what a caller has to do before trying again
    pub fn recovery(&self) -> Recovery {
        match self {
            Error::Busy | Error::TimedOut(_) | Error::Protocol(_) | Error::Cancelled => {
                Recovery::Retry
            }
            Error::Connection(_)
            | Error::DeviceUnresponsive(_)
            | Error::SessionClosed
            | Error::NotConnected
            | Error::NoMatchingDevice
            | Error::SerialNotFound(_) => Recovery::Reconnect,
            _ => Recovery::OperatorAction,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Self::Connection(err.into())
    }
}

impl From<serialport::Error> for Error {
    fn from(err: serialport::Error) -> Self {
        Self::Connection(err.into())
    }
}

impl From<ConnectionError> for Error {
    fn from(err: ConnectionError) -> Self {
        Self::Connection(err)
    }
}

impl From<FlashError> for Error {
    fn from(err: FlashError) -> Self {
        Self::Flash(err)
    }
}

/// Connection-related errors
#[derive(Debug, Diagnostic, Error)]
#[non_exhaustive]
pub enum ConnectionError {
    #[error("Failed to connect to the device")]
    #[diagnostic(
        code(periphlink::connection_failed),
        help("Ensure that the device is connected and no other program holds the serial port")
    )]
    ConnectionFailed,

    #[error("Serial port not found")]
    #[diagnostic(
        code(periphlink::device_not_found),
        help("Ensure that the device is connected and your host recognizes the serial adapter")
    )]
    DeviceNotFound,

    #[error("The connection is closed")]
    #[diagnostic(code(periphlink::connection_closed))]
    Closed,

    #[error("The connection has faulted and must be reopened")]
    #[diagnostic(code(periphlink::connection_faulted))]
    Faulted,

    #[error("Timeout while {0}")]
    #[diagnostic(code(periphlink::timeout))]
    Timeout(TimedOutCommand),

    #[error("IO error while using serial port: {0}")]
    #[diagnostic(code(periphlink::serial_error))]
    Serial(#[source] serialport::Error),
}

impl From<io::Error> for ConnectionError {
    fn from(err: io::Error) -> Self {
        from_error_kind(err.kind(), err)
    }
}

impl From<serialport::Error> for ConnectionError {
    fn from(err: serialport::Error) -> Self {
        use serialport::ErrorKind;

        match err.kind() {
            ErrorKind::Io(kind) => from_error_kind(kind, err),
            ErrorKind::NoDevice => ConnectionError::DeviceNotFound,
            _ => ConnectionError::Serial(err),
        }
    }
}

/// An operation on the wire which has timed out
#[derive(Clone, Debug, Default)]
pub struct TimedOutCommand {
    command: Option<String>,
}

impl TimedOutCommand {
    pub fn new(command: impl Display) -> Self {
        TimedOutCommand {
            command: Some(command.to_string()),
        }
    }
}

impl Display for TimedOutCommand {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match &self.command {
            Some(command) => write!(f, "running {command} command"),
            None => write!(f, "waiting for the serial port"),
        }
    }
}

/// Errors in the framing or content of received data
///
/// None of these are fatal to the connection: the decoder drops the offending
/// frame and resynchronizes on the next frame delimiter.
#[derive(Debug, Clone, PartialEq, Eq, Diagnostic, Error)]
#[non_exhaustive]
pub enum ProtocolError {
    #[error("Received packet has invalid SLIP framing")]
    #[diagnostic(code(periphlink::protocol::framing))]
    FramingError,

    #[error("Received packet too large for buffer")]
    #[diagnostic(code(periphlink::protocol::oversized))]
    OversizedFrame,

    #[error("Frame too short: {0} bytes")]
    #[diagnostic(code(periphlink::protocol::truncated))]
    Truncated(usize),

    #[error("Frame declares {declared} payload bytes but carries {actual}")]
    #[diagnostic(code(periphlink::protocol::length))]
    LengthMismatch { declared: usize, actual: usize },

    #[error("Frame checksum mismatch: expected {expected:#04x}, computed {computed:#04x}")]
    #[diagnostic(code(periphlink::protocol::checksum))]
    ChecksumMismatch { expected: u8, computed: u8 },

    #[error("Unknown frame direction {0:#04x}")]
    #[diagnostic(code(periphlink::protocol::direction))]
    UnknownDirection(u8),

    #[error("Unknown opcode {0:#04x}")]
    #[diagnostic(code(periphlink::protocol::opcode))]
    UnknownOpcode(u8),

    #[error("Malformed payload: {0}")]
    #[diagnostic(code(periphlink::protocol::payload))]
    MalformedPayload(String),
}

/// Failures of a firmware upload
#[derive(Debug, Diagnostic, Error)]
#[non_exhaustive]
pub enum FlashError {
    #[error("The firmware image is empty")]
    #[diagnostic(code(periphlink::flash::empty_image))]
    EmptyImage,

    #[error("The firmware image of {size} bytes exceeds the {max} byte limit")]
    #[diagnostic(code(periphlink::flash::image_too_large))]
    ImageTooLarge { size: usize, max: usize },

    #[error("Failed to bring the device into its bootloader")]
    #[diagnostic(
        code(periphlink::flash::enter_bootloader),
        help("Hold the boot button while resetting the board, then try again")
    )]
    EnterBootloader,

    #[error("Chip '{found}' reported by the bootloader does not match the configured '{expected}'")]
    #[diagnostic(
        code(periphlink::flash::chip_mismatch),
        help("Ensure that the correct device profile is selected")
    )]
    ChipMismatch { expected: String, found: String },

    #[error("The bootloader rejected {command} with error code {code:#04x}")]
    #[diagnostic(code(periphlink::flash::rejected))]
    Rejected { command: String, code: u8 },

    #[error("Firmware upload did not finish within {0:?}")]
    #[diagnostic(code(periphlink::flash::timeout))]
    Timeout(std::time::Duration),
}

pub(crate) trait ResultExt {
    /// Mark an error as having occurred during the flashing stage
    fn flashing(self) -> Self;
    /// Mark the command from which this error originates
    fn for_command(self, command: impl Display) -> Self;
}

impl<T> ResultExt for Result<T, Error> {
    fn flashing(self) -> Self {
        match self {
            Err(Error::Connection(err)) => Err(Error::Flashing(err)),
            res => res,
        }
    }

    fn for_command(self, command: impl Display) -> Self {
        match self {
            Err(Error::Connection(ConnectionError::Timeout(_))) => Err(Error::Connection(
                ConnectionError::Timeout(TimedOutCommand::new(command)),
            )),
            Err(Error::Flashing(ConnectionError::Timeout(_))) => Err(Error::Flashing(
                ConnectionError::Timeout(TimedOutCommand::new(command)),
            )),
            res => res,
        }
    }
}

fn from_error_kind<E>(kind: io::ErrorKind, err: E) -> ConnectionError
where
    E: Into<serialport::Error>,
{
    use io::ErrorKind;

    match kind {
        ErrorKind::TimedOut => ConnectionError::Timeout(TimedOutCommand::default()),
        ErrorKind::NotFound => ConnectionError::DeviceNotFound,
        _ => ConnectionError::Serial(err.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recovery_classes() {
        assert_eq!(Error::Busy.recovery(), Recovery::Retry);
        assert_eq!(Error::TimedOut("screenClear".into()).recovery(), Recovery::Retry);
        assert_eq!(Error::DeviceUnresponsive(3).recovery(), Recovery::Reconnect);
        assert_eq!(
            Error::Connection(ConnectionError::ConnectionFailed).recovery(),
            Recovery::Reconnect
        );
        assert_eq!(
            Error::Flash(FlashError::EnterBootloader).recovery(),
            Recovery::OperatorAction
        );
        assert_eq!(
            Error::UnsupportedOperation("warp".into()).recovery(),
            Recovery::OperatorAction
        );
        assert_eq!(
            Error::VerificationFailed {
                expected_len: 1,
                actual_len: 2,
                expected: String::new(),
                actual: String::new(),
            }
            .recovery(),
            Recovery::OperatorAction
        );
    }

    #[test]
    fn io_timeouts_map_to_connection_timeouts() {
        let err = Error::from(io::Error::new(io::ErrorKind::TimedOut, "slow"));
        assert!(matches!(
            err,
            Error::Connection(ConnectionError::Timeout(_))
        ));

        let err: Result<(), Error> = Err(err);
        let err = err.for_command("sync").flashing().unwrap_err();
        match err {
            Error::Flashing(ConnectionError::Timeout(cmd)) => {
                assert_eq!(cmd.to_string(), "running sync command")
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
