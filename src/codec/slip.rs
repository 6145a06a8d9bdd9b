//! SLIP framing
//!
//! See <https://datatracker.ietf.org/doc/html/rfc1055>

use crate::error::ProtocolError;

const END: u8 = 0xC0;
const ESC: u8 = 0xDB;
const ESC_END: u8 = 0xDC;
const ESC_ESC: u8 = 0xDD;

/// Wrap `packet` in END delimiters, escaping END and ESC inside it
pub fn encode(packet: &[u8], out: &mut Vec<u8>) {
    out.reserve(packet.len() + 2);
    out.push(END);
    for &byte in packet {
        match byte {
            END => out.extend_from_slice(&[ESC, ESC_END]),
            ESC => out.extend_from_slice(&[ESC, ESC_ESC]),
            _ => out.push(byte),
        }
    }
    out.push(END);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Normal,
    Escape,
    /// Discarding input until the next END
    Error,
}

/// Incremental SLIP decoder
///
/// Bytes are pushed one at a time as they arrive from the port; a packet is
/// emitted once its closing END is seen. Partial packets stay buffered
/// between pushes.
#[derive(Debug)]
pub struct SlipDecoder {
    buf: Vec<u8>,
    state: State,
    max_len: usize,
}

impl SlipDecoder {
    pub fn new(max_len: usize) -> Self {
        SlipDecoder {
            buf: Vec::new(),
            state: State::Normal,
            max_len,
        }
    }

    /// Number of bytes held for the packet currently being received
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    /// Push one byte, returning a packet or an error when one completes
    ///
    /// After an error every byte up to and including the next END is dropped.
    pub fn push(&mut self, byte: u8) -> Option<Result<Vec<u8>, ProtocolError>> {
        match (self.state, byte) {
            (State::Error, END) => {
                self.state = State::Normal;
                None
            }
            (State::Error, _) => None,
            (State::Normal, END) => {
                if self.buf.is_empty() {
                    // Back-to-back delimiters between packets
                    None
                } else {
                    Some(Ok(std::mem::take(&mut self.buf)))
                }
            }
            (State::Normal, ESC) => {
                self.state = State::Escape;
                None
            }
            (State::Normal, byte) => self.append(byte),
            (State::Escape, ESC_END) => {
                self.state = State::Normal;
                self.append(END)
            }
            (State::Escape, ESC_ESC) => {
                self.state = State::Normal;
                self.append(ESC)
            }
            (State::Escape, END) => {
                // The packet ended mid-escape; END itself already resynchronizes
                self.buf.clear();
                self.state = State::Normal;
                Some(Err(ProtocolError::FramingError))
            }
            (State::Escape, _) => self.fail(ProtocolError::FramingError),
        }
    }

    fn append(&mut self, byte: u8) -> Option<Result<Vec<u8>, ProtocolError>> {
        if self.buf.len() >= self.max_len {
            return self.fail(ProtocolError::OversizedFrame);
        }

        self.buf.push(byte);
        None
    }

    fn fail(&mut self, err: ProtocolError) -> Option<Result<Vec<u8>, ProtocolError>> {
        self.buf.clear();
        self.state = State::Error;
        Some(Err(err))
    }
}
