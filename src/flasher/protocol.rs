//! Bootloader command protocol
//!
//! Loader commands share the frame layout of the command protocol. Requests
//! carry the command parameters as payload; replies carry a status byte, an
//! error code and command-specific data.

use std::time::Duration;

use bytemuck::{bytes_of, Pod, Zeroable};
use strum::{Display, FromRepr};

use crate::{
    codec::{checksum, Direction, RawFrame, CHECKSUM_INIT},
    error::ProtocolError,
};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(3);
const SYNC_TIMEOUT: Duration = Duration::from_millis(200);
const ERASE_TIMEOUT: Duration = Duration::from_secs(30);
const MD5_TIMEOUT: Duration = Duration::from_secs(10);

/// Synchronization pattern the bootloader locks on to
const SYNC_PATTERN: [u8; 4] = [0x07, 0x07, 0x12, 0x20];

pub const MD5_LEN: usize = 16;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Display, FromRepr)]
#[repr(u8)]
#[non_exhaustive]
pub enum LoaderCommand {
    FlashBegin = 0x02,
    FlashData = 0x03,
    FlashEnd = 0x04,
    Sync = 0x08,
    ChangeBaudrate = 0x0F,
    FlashMd5 = 0x13,
}

impl LoaderCommand {
    pub fn timeout(&self) -> Duration {
        match self {
            LoaderCommand::Sync => SYNC_TIMEOUT,
            // Erases the whole image region before answering
            LoaderCommand::FlashBegin => ERASE_TIMEOUT,
            LoaderCommand::FlashMd5 => MD5_TIMEOUT,
            _ => DEFAULT_TIMEOUT,
        }
    }
}

#[derive(Zeroable, Pod, Copy, Clone, Debug)]
#[repr(C)]
struct BeginParams {
    size: u32,
    blocks: u32,
    block_size: u32,
    offset: u32,
}

#[derive(Zeroable, Pod, Copy, Clone, Debug)]
#[repr(C)]
struct BlockParams {
    size: u32,
    sequence: u32,
    checksum: u32,
    reserved: u32,
}

#[derive(Zeroable, Pod, Copy, Clone, Debug)]
#[repr(C)]
struct BaudParams {
    new_baud: u32,
    prior_baud: u32,
}

/// Frame a loader request
pub fn request(
    command: LoaderCommand,
    sequence: u16,
    payload: Vec<u8>,
) -> Result<Vec<u8>, ProtocolError> {
    RawFrame {
        direction: Direction::Request,
        op: command as u8,
        correlation_id: sequence,
        payload,
    }
    .encode()
}

pub fn sync_payload() -> Vec<u8> {
    let mut payload = SYNC_PATTERN.to_vec();
    payload.extend_from_slice(&[0x55; 32]);
    payload
}

/// Begin a transfer of `size` bytes in `blocks` blocks; the board id follows
/// the fixed parameters
pub fn begin_payload(size: u32, blocks: u32, block_size: u32, board: &str) -> Vec<u8> {
    let params = BeginParams {
        size,
        blocks,
        block_size,
        offset: 0,
    };

    let mut payload = bytes_of(&params).to_vec();
    payload.extend_from_slice(board.as_bytes());
    payload
}

pub fn data_payload(sequence: u32, data: &[u8]) -> Vec<u8> {
    let params = BlockParams {
        size: data.len() as u32,
        sequence,
        checksum: checksum(data, CHECKSUM_INIT) as u32,
        reserved: 0,
    };

    let mut payload = bytes_of(&params).to_vec();
    payload.extend_from_slice(data);
    payload
}

pub fn change_baud_payload(new_baud: u32, prior_baud: u32) -> Vec<u8> {
    bytes_of(&BaudParams {
        new_baud,
        prior_baud,
    })
    .to_vec()
}

pub fn md5_payload(size: u32) -> Vec<u8> {
    size.to_le_bytes().to_vec()
}

pub fn end_payload(reboot: bool) -> Vec<u8> {
    (reboot as u32).to_le_bytes().to_vec()
}

/// A decoded bootloader request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoaderRequest {
    pub command: LoaderCommand,
    pub sequence: u16,
    pub payload: Vec<u8>,
}

impl LoaderRequest {
    pub fn parse(raw: RawFrame) -> Result<Self, ProtocolError> {
        if raw.direction != Direction::Request {
            return Err(ProtocolError::UnknownDirection(raw.direction as u8));
        }

        Ok(LoaderRequest {
            command: LoaderCommand::from_repr(raw.op).ok_or(ProtocolError::UnknownOpcode(raw.op))?,
            sequence: raw.correlation_id,
            payload: raw.payload,
        })
    }

    /// For [LoaderCommand::FlashData], the sequence number and block data
    pub fn block(&self) -> Option<(u32, &[u8])> {
        if self.command != LoaderCommand::FlashData || self.payload.len() < 16 {
            return None;
        }

        let (params, data) = self.payload.split_at(16);
        let params: BlockParams = bytemuck::pod_read_unaligned(params);

        Some((params.sequence, data))
    }
}

/// A bootloader reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoaderReply {
    pub command: LoaderCommand,
    pub sequence: u16,
    pub status: u8,
    pub error: u8,
    pub data: Vec<u8>,
}

impl LoaderReply {
    pub fn ok(command: LoaderCommand, sequence: u16, data: Vec<u8>) -> Self {
        LoaderReply {
            command,
            sequence,
            status: 0,
            error: 0,
            data,
        }
    }

    pub fn parse(raw: RawFrame) -> Result<Self, ProtocolError> {
        if raw.direction != Direction::Response {
            return Err(ProtocolError::UnknownDirection(raw.direction as u8));
        }
        if raw.payload.len() < 2 {
            return Err(ProtocolError::Truncated(raw.payload.len()));
        }

        Ok(LoaderReply {
            command: LoaderCommand::from_repr(raw.op).ok_or(ProtocolError::UnknownOpcode(raw.op))?,
            sequence: raw.correlation_id,
            status: raw.payload[0],
            error: raw.payload[1],
            data: raw.payload[2..].to_vec(),
        })
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        let mut payload = vec![self.status, self.error];
        payload.extend_from_slice(&self.data);

        RawFrame {
            direction: Direction::Response,
            op: self.command as u8,
            correlation_id: self.sequence,
            payload,
        }
        .encode()
    }
}

/// Data of a [LoaderCommand::FlashMd5] reply
pub fn md5_reply(len: u32, digest: [u8; MD5_LEN]) -> Vec<u8> {
    let mut data = len.to_le_bytes().to_vec();
    data.extend_from_slice(&digest);
    data
}

/// Split a [LoaderCommand::FlashMd5] reply into length and digest
pub fn parse_md5_reply(data: &[u8]) -> Result<(u32, [u8; MD5_LEN]), ProtocolError> {
    if data.len() != 4 + MD5_LEN {
        return Err(ProtocolError::MalformedPayload(format!(
            "checksum reply of {} bytes",
            data.len()
        )));
    }

    let (len, digest) = data.split_at(4);
    let mut out = [0u8; MD5_LEN];
    out.copy_from_slice(digest);

    Ok((u32::from_le_bytes([len[0], len[1], len[2], len[3]]), out))
}
