//! Commands understood by the peripheral
//!
//! Every block maps to exactly one [Opcode], which fixes the wire id and the
//! positional argument schema of the command.

use std::{
    fmt::{self, Display, Formatter},
    str::FromStr,
    time::Duration,
};

use strum::{Display as StrumDisplay, EnumIter, EnumString, FromRepr, IntoEnumIterator, VariantNames};

use crate::{
    codec::{ArgType, Value},
    error::Error,
};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(3);
const SENSOR_INIT_TIMEOUT: Duration = Duration::from_secs(10);
const EXECFILE_TIMEOUT: Duration = Duration::from_secs(10);

/// One positional argument of an opcode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Param {
    pub name: &'static str,
    pub ty: ArgType,
}

/// Whether a block performs an action or reports a value
#[derive(Debug, Clone, Copy, PartialEq, Eq, StrumDisplay)]
#[strum(serialize_all = "lowercase")]
pub enum BlockKind {
    Command,
    Reporter,
}

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    StrumDisplay,
    EnumIter,
    EnumString,
    FromRepr,
    VariantNames,
)]
#[strum(serialize_all = "camelCase")]
#[repr(u8)]
#[non_exhaustive]
pub enum Opcode {
    ScreenInit = 0x20,
    ScreenRotate = 0x21,
    ScreenMirror = 0x22,
    ScreenShow = 0x23,
    ScreenSet = 0x24,
    ScreenShowImage = 0x25,
    ScreenClear = 0x26,
    ImageInit = 0x30,
    Image = 0x31,
    ImageDrawString = 0x32,
    ImageDrawRectangle = 0x33,
    #[strum(serialize = "sensorinit")]
    SensorInit = 0x40,
    Snapshot = 0x41,
    ConsoleTimeClock = 0x50,
    ConsoleTimeTick = 0x51,
    ConsoleFps = 0x52,
    ConsolePrint = 0x53,
    ConsoleExecfile = 0x54,
    ConsoleReboot = 0x55,
}

impl Opcode {
    /// Look an opcode up by its block name, e.g. `screenInit`
    pub fn from_name(name: &str) -> Result<Self, Error> {
        Opcode::from_str(name).map_err(|_| Error::UnsupportedOperation(name.to_string()))
    }

    /// Look an opcode up by its wire id
    pub fn from_wire(id: u8) -> Option<Self> {
        Opcode::from_repr(id)
    }

    pub fn wire_id(&self) -> u8 {
        *self as u8
    }

    /// All opcodes, in wire id order
    pub fn all() -> impl Iterator<Item = Opcode> {
        Opcode::iter()
    }

    /// Positional argument schema
    pub fn params(&self) -> &'static [Param] {
        use ArgType::*;

        match self {
            Opcode::ScreenRotate => &[Param { name: "ANGLE", ty: Angle }],
            Opcode::ScreenMirror => &[Param { name: "MODE", ty: Number }],
            Opcode::ScreenShow => &[Param { name: "COLOR", ty: Text }],
            Opcode::ScreenSet => &[
                Param { name: "R", ty: Uint8 },
                Param { name: "G", ty: Uint8 },
                Param { name: "B", ty: Uint8 },
            ],
            Opcode::ScreenShowImage | Opcode::ImageInit => &[Param { name: "IMAGE", ty: Text }],
            Opcode::ImageDrawString => &[
                Param { name: "TEXT", ty: Text },
                Param { name: "X", ty: Number },
                Param { name: "Y", ty: Number },
                Param { name: "SIZE", ty: Number },
                Param { name: "COLOR", ty: Color },
            ],
            Opcode::ImageDrawRectangle => &[
                Param { name: "X", ty: Number },
                Param { name: "Y", ty: Number },
                Param { name: "W", ty: Number },
                Param { name: "H", ty: Number },
                Param { name: "COLOR", ty: Color },
                Param { name: "THICKNESS", ty: Number },
                Param { name: "FILL", ty: Number },
            ],
            Opcode::SensorInit => &[
                Param { name: "PIX", ty: Text },
                Param { name: "SIZE", ty: Text },
                Param { name: "SKIPFRAME", ty: Number },
            ],
            Opcode::ConsolePrint | Opcode::ConsoleExecfile => &[Param { name: "TEXT", ty: Text }],
            Opcode::ScreenInit
            | Opcode::ScreenClear
            | Opcode::Image
            | Opcode::Snapshot
            | Opcode::ConsoleTimeClock
            | Opcode::ConsoleTimeTick
            | Opcode::ConsoleFps
            | Opcode::ConsoleReboot => &[],
        }
    }

    pub fn kind(&self) -> BlockKind {
        match self {
            Opcode::Image | Opcode::Snapshot | Opcode::ConsoleFps => BlockKind::Reporter,
            _ => BlockKind::Command,
        }
    }

    /// Response timeout for commands which take longer than usual on the
    /// device, if any
    pub fn timeout(&self) -> Option<Duration> {
        match self {
            // Skips the configured number of frames before answering
            Opcode::SensorInit => Some(SENSOR_INIT_TIMEOUT),
            Opcode::ConsoleExecfile => Some(EXECFILE_TIMEOUT),
            _ => None,
        }
    }

    /// The response timeout to use given the session's default
    pub fn timeout_or(&self, default: Duration) -> Duration {
        self.timeout().map_or(default, |t| t.max(default))
    }

    pub fn default_timeout() -> Duration {
        DEFAULT_TIMEOUT
    }
}

/// A typed command invocation
#[derive(Debug, Clone, PartialEq)]
pub struct CommandRequest {
    pub opcode: Opcode,
    pub arguments: Vec<Value>,
    /// Assigned by the session when the request is accepted
    pub correlation_id: u16,
}

impl CommandRequest {
    pub fn new(opcode: Opcode, arguments: Vec<Value>) -> Self {
        CommandRequest {
            opcode,
            arguments,
            correlation_id: 0,
        }
    }

    /// Build a request from a block name and textual arguments
    pub fn from_name(name: &str, arguments: &[&str]) -> Result<Self, Error> {
        let opcode = Opcode::from_name(name)?;
        let params = opcode.params();

        if arguments.len() != params.len() {
            return Err(arity_error(opcode, arguments.len()));
        }

        let arguments = params
            .iter()
            .zip(arguments)
            .map(|(param, raw)| {
                param.ty.parse(raw).map_err(|reason| Error::InvalidArguments {
                    opcode: opcode.to_string(),
                    reason: format!("{}: {reason}", param.name),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(CommandRequest::new(opcode, arguments))
    }

    /// Check the arguments against the opcode's schema
    pub fn validate(&self) -> Result<(), Error> {
        let params = self.opcode.params();

        if self.arguments.len() != params.len() {
            return Err(arity_error(self.opcode, self.arguments.len()));
        }

        for (param, value) in params.iter().zip(&self.arguments) {
            if !param.ty.accepts(value) {
                return Err(Error::InvalidArguments {
                    opcode: self.opcode.to_string(),
                    reason: format!("{} expects {}, got {value}", param.name, param.ty),
                });
            }
        }

        Ok(())
    }
}

fn arity_error(opcode: Opcode, given: usize) -> Error {
    Error::InvalidArguments {
        opcode: opcode.to_string(),
        reason: format!(
            "expected {} arguments, got {given}",
            opcode.params().len()
        ),
    }
}

/// Why the device did not produce a value for a command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceFault {
    /// The device answered with an error code
    Code(u8),
    /// The connection was faulted by repeated timeouts before dispatch
    Unresponsive,
    /// The connection went away while the command was pending
    ConnectionLost,
}

impl Display for DeviceFault {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            DeviceFault::Code(code) => write!(f, "error code {code:#04x}"),
            DeviceFault::Unresponsive => write!(f, "device unresponsive"),
            DeviceFault::ConnectionLost => write!(f, "connection lost"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CommandStatus {
    Ok(Option<Value>),
    TimedOut,
    DeviceError(DeviceFault),
}

/// The outcome of exactly one accepted [CommandRequest]
#[derive(Debug, Clone, PartialEq)]
pub struct CommandResult {
    pub correlation_id: u16,
    pub opcode: Opcode,
    pub status: CommandStatus,
}

impl CommandResult {
    pub fn is_ok(&self) -> bool {
        matches!(self.status, CommandStatus::Ok(_))
    }

    /// Convert into the reported value, or the matching [Error]
    pub fn into_result(self) -> Result<Option<Value>, Error> {
        match self.status {
            CommandStatus::Ok(value) => Ok(value),
            CommandStatus::TimedOut => Err(Error::TimedOut(self.opcode.to_string())),
            CommandStatus::DeviceError(fault) => Err(Error::Device {
                opcode: self.opcode.to_string(),
                fault,
            }),
        }
    }
}
