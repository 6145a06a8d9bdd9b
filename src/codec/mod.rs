//! Wire format of the command protocol
//!
//! Every frame is SLIP-delimited and carries, in order:
//!
//! | field          | size | notes                                  |
//! |----------------|------|----------------------------------------|
//! | direction      | 1    | request, response or event             |
//! | opcode         | 1    | wire id, or channel for events         |
//! | correlation id | 2    | little endian                          |
//! | payload length | 2    | little endian                          |
//! | payload        | n    |                                        |
//! | checksum       | 1    | XOR of all preceding bytes, seeded     |
//!
//! Decoding is incremental: bytes are fed as they arrive, partial frames stay
//! buffered, and a malformed frame is reported once before the decoder picks
//! up again at the next delimiter.

use std::collections::VecDeque;

use log::debug;
use strum::FromRepr;

pub use self::value::{ArgType, Rgb, Value};
use self::slip::SlipDecoder;
use crate::{
    command::{CommandRequest, CommandResult, CommandStatus, DeviceFault, Opcode},
    error::{Error, ProtocolError},
};

pub mod slip;
mod value;

const HEADER_LEN: usize = 6;
const CHECKSUM_LEN: usize = 1;
/// Largest payload a single frame can carry
pub const MAX_PAYLOAD: usize = u16::MAX as usize;
const MAX_FRAME: usize = HEADER_LEN + MAX_PAYLOAD + CHECKSUM_LEN;

/// Initial state for the checksum calculation
pub const CHECKSUM_INIT: u8 = 0xEF;

/// Calculate the XOR checksum of `data`, starting from `checksum`
pub fn checksum(data: &[u8], mut checksum: u8) -> u8 {
    for byte in data {
        checksum ^= *byte;
    }

    checksum
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, FromRepr)]
#[repr(u8)]
pub enum Direction {
    Request = 0,
    Response = 1,
    Event = 2,
}

/// A frame before its payload is interpreted
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFrame {
    pub direction: Direction,
    pub op: u8,
    pub correlation_id: u16,
    pub payload: Vec<u8>,
}

impl RawFrame {
    /// Serialize and SLIP-wrap the frame
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        let len = u16::try_from(self.payload.len()).map_err(|_| {
            ProtocolError::MalformedPayload(format!(
                "payload of {} bytes exceeds {MAX_PAYLOAD} bytes",
                self.payload.len()
            ))
        })?;

        let mut body = Vec::with_capacity(HEADER_LEN + self.payload.len() + CHECKSUM_LEN);
        body.push(self.direction as u8);
        body.push(self.op);
        body.extend_from_slice(&self.correlation_id.to_le_bytes());
        body.extend_from_slice(&len.to_le_bytes());
        body.extend_from_slice(&self.payload);
        body.push(checksum(&body, CHECKSUM_INIT));

        let mut out = Vec::new();
        slip::encode(&body, &mut out);

        Ok(out)
    }

    /// Parse an unwrapped SLIP packet
    pub fn parse(packet: &[u8]) -> Result<Self, ProtocolError> {
        if packet.len() < HEADER_LEN + CHECKSUM_LEN {
            return Err(ProtocolError::Truncated(packet.len()));
        }

        let (body, tail) = packet.split_at(packet.len() - CHECKSUM_LEN);
        let computed = checksum(body, CHECKSUM_INIT);
        if computed != tail[0] {
            return Err(ProtocolError::ChecksumMismatch {
                expected: tail[0],
                computed,
            });
        }

        let declared = u16::from_le_bytes([body[4], body[5]]) as usize;
        let payload = &body[HEADER_LEN..];
        if declared != payload.len() {
            return Err(ProtocolError::LengthMismatch {
                declared,
                actual: payload.len(),
            });
        }

        let direction =
            Direction::from_repr(body[0]).ok_or(ProtocolError::UnknownDirection(body[0]))?;

        Ok(RawFrame {
            direction,
            op: body[1],
            correlation_id: u16::from_le_bytes([body[2], body[3]]),
            payload: payload.to_vec(),
        })
    }
}

/// Incremental decoder yielding [RawFrame]s
#[derive(Debug)]
pub struct RawFrameDecoder {
    slip: SlipDecoder,
    ready: VecDeque<Result<RawFrame, ProtocolError>>,
}

impl Default for RawFrameDecoder {
    fn default() -> Self {
        RawFrameDecoder::new()
    }
}

impl RawFrameDecoder {
    pub fn new() -> Self {
        RawFrameDecoder {
            slip: SlipDecoder::new(MAX_FRAME),
            ready: VecDeque::new(),
        }
    }

    /// Buffer received bytes
    pub fn feed(&mut self, bytes: &[u8]) {
        for byte in bytes {
            if let Some(packet) = self.slip.push(*byte) {
                self.ready
                    .push_back(packet.and_then(|packet| RawFrame::parse(&packet)));
            }
        }
    }

    /// The next complete frame, if any
    ///
    /// An `Err` reports one dropped frame; later calls continue with the
    /// frames that follow it.
    pub fn next_frame(&mut self) -> Result<Option<RawFrame>, ProtocolError> {
        self.ready.pop_front().transpose()
    }

    /// Drop all buffered input
    pub fn reset(&mut self) {
        self.slip = SlipDecoder::new(MAX_FRAME);
        self.ready.clear();
    }
}

/// Unsolicited value pushed by the device
#[derive(Debug, Clone, PartialEq)]
pub struct Telemetry {
    pub channel: u8,
    pub value: Option<Value>,
}

/// A decoded frame of the command protocol
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Request(CommandRequest),
    Response(CommandResult),
    Telemetry(Telemetry),
}

impl Frame {
    fn from_raw(raw: RawFrame) -> Result<Self, ProtocolError> {
        let mut payload = raw.payload.as_slice();

        let frame = match raw.direction {
            Direction::Request => {
                let opcode = opcode(raw.op)?;
                let count = take_u8(&mut payload)?;
                let arguments = (0..count)
                    .map(|_| Value::decode(&mut payload))
                    .collect::<Result<Vec<_>, _>>()?;

                Frame::Request(CommandRequest {
                    opcode,
                    arguments,
                    correlation_id: raw.correlation_id,
                })
            }
            Direction::Response => {
                let opcode = opcode(raw.op)?;
                let status = take_u8(&mut payload)?;
                let code = take_u8(&mut payload)?;
                let value = optional_value(&mut payload)?;

                let status = match status {
                    0 => CommandStatus::Ok(value),
                    1 => CommandStatus::DeviceError(DeviceFault::Code(code)),
                    other => {
                        return Err(ProtocolError::MalformedPayload(format!(
                            "unknown response status {other:#04x}"
                        )))
                    }
                };

                Frame::Response(CommandResult {
                    correlation_id: raw.correlation_id,
                    opcode,
                    status,
                })
            }
            Direction::Event => Frame::Telemetry(Telemetry {
                channel: raw.op,
                value: optional_value(&mut payload)?,
            }),
        };

        if !payload.is_empty() {
            return Err(ProtocolError::MalformedPayload(format!(
                "{} trailing bytes",
                payload.len()
            )));
        }

        Ok(frame)
    }
}

fn opcode(id: u8) -> Result<Opcode, ProtocolError> {
    Opcode::from_wire(id).ok_or(ProtocolError::UnknownOpcode(id))
}

fn take_u8(input: &mut &[u8]) -> Result<u8, ProtocolError> {
    let (first, rest) = input
        .split_first()
        .ok_or_else(|| ProtocolError::MalformedPayload("payload ended early".into()))?;
    *input = rest;

    Ok(*first)
}

fn optional_value(input: &mut &[u8]) -> Result<Option<Value>, ProtocolError> {
    match take_u8(input)? {
        0 => Ok(None),
        1 => Value::decode(input).map(Some),
        other => Err(ProtocolError::MalformedPayload(format!(
            "invalid value marker {other:#04x}"
        ))),
    }
}

fn push_optional_value(out: &mut Vec<u8>, value: Option<&Value>) -> Result<(), ProtocolError> {
    match value {
        Some(value) => {
            out.push(1);
            value.encode(out)
        }
        None => {
            out.push(0);
            Ok(())
        }
    }
}

/// Incremental decoder for the command protocol
#[derive(Debug, Default)]
pub struct FrameDecoder {
    raw: RawFrameDecoder,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Buffer received bytes
    pub fn feed(&mut self, bytes: &[u8]) {
        self.raw.feed(bytes);
    }

    /// The next complete frame, if any
    pub fn next_frame(&mut self) -> Result<Option<Frame>, ProtocolError> {
        match self.raw.next_frame() {
            Ok(Some(raw)) => Frame::from_raw(raw).map(Some),
            Ok(None) => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Feed `bytes` and return the next complete frame
    ///
    /// `Ok(None)` means no complete frame has been received yet.
    pub fn decode(&mut self, bytes: &[u8]) -> Result<Option<Frame>, ProtocolError> {
        self.feed(bytes);
        self.next_frame()
    }

    pub fn reset(&mut self) {
        self.raw.reset();
    }
}

/// Encode a command request for the wire
///
/// The request is checked against its opcode's schema first.
pub fn encode(request: &CommandRequest) -> Result<Vec<u8>, Error> {
    request.validate()?;

    let invalid = |err: ProtocolError| Error::InvalidArguments {
        opcode: request.opcode.to_string(),
        reason: err.to_string(),
    };

    let mut payload = vec![request.arguments.len() as u8];
    for value in &request.arguments {
        value.encode(&mut payload).map_err(invalid)?;
    }

    let bytes = RawFrame {
        direction: Direction::Request,
        op: request.opcode.wire_id(),
        correlation_id: request.correlation_id,
        payload,
    }
    .encode()
    .map_err(invalid)?;

    debug!(
        "Encoded {} #{} into {} bytes",
        request.opcode,
        request.correlation_id,
        bytes.len()
    );

    Ok(bytes)
}

/// Encode a device response, as the peripheral would send it
pub fn encode_response(result: &CommandResult) -> Result<Vec<u8>, ProtocolError> {
    let mut payload = Vec::new();

    match &result.status {
        CommandStatus::Ok(value) => {
            payload.extend_from_slice(&[0, 0]);
            push_optional_value(&mut payload, value.as_ref())?;
        }
        CommandStatus::DeviceError(DeviceFault::Code(code)) => {
            payload.extend_from_slice(&[1, *code, 0]);
        }
        status => {
            return Err(ProtocolError::MalformedPayload(format!(
                "{status:?} is produced by the host and has no wire form"
            )))
        }
    }

    RawFrame {
        direction: Direction::Response,
        op: result.opcode.wire_id(),
        correlation_id: result.correlation_id,
        payload,
    }
    .encode()
}

/// Encode a telemetry event, as the peripheral would send it
pub fn encode_event(event: &Telemetry) -> Result<Vec<u8>, ProtocolError> {
    let mut payload = Vec::new();
    push_optional_value(&mut payload, event.value.as_ref())?;

    RawFrame {
        direction: Direction::Event,
        op: event.channel,
        correlation_id: 0,
        payload,
    }
    .encode()
}
