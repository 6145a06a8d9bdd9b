//! A scripted in-memory peripheral for integration tests

#![allow(dead_code)]

use std::{
    collections::VecDeque,
    io,
    sync::{Arc, Mutex, MutexGuard},
    thread::sleep,
    time::Duration,
};

use md5::{Digest, Md5};
use periphlink::{
    codec::{self, Frame, FrameDecoder, RawFrameDecoder, Telemetry},
    command::{CommandRequest, CommandResult, CommandStatus},
    connection::{Connection, Transport},
    error::Error,
    flasher::protocol::{md5_reply, LoaderCommand, LoaderReply, LoaderRequest, MD5_LEN},
    profile::DeviceProfile,
};
use serialport::{DataBits, StopBits};

pub const PORT: &str = "/dev/ttyUSB0";

/// Something the host did to the port
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineEvent {
    Opened,
    Baud(u32),
    DataBits(DataBits),
    StopBits(StopBits),
    FlowControl(bool),
    Dtr(bool),
    Rts(bool),
    /// A command frame, by opcode name
    Command(String),
    /// A bootloader frame
    Loader(LoaderCommand),
}

/// How the device answers a command; `None` leaves it unanswered
pub type Responder = Box<dyn FnMut(&CommandRequest) -> Option<CommandStatus> + Send>;

pub struct DeviceState {
    pub events: Vec<LineEvent>,
    pub requests: Vec<CommandRequest>,
    /// Image as written through the bootloader
    pub image: Vec<u8>,
    /// Chip name reported on sync
    pub chip: String,
    /// Report a wrong digest on verification
    pub corrupt_md5: bool,
    /// Fail every write
    pub broken: bool,
    /// Bootloader commands left unanswered
    pub silent: Vec<LoaderCommand>,
    rx: VecDeque<u8>,
    decoder: RawFrameDecoder,
    responder: Responder,
}

impl DeviceState {
    pub fn commands(&self) -> Vec<String> {
        self.requests
            .iter()
            .map(|request| request.opcode.to_string())
            .collect()
    }

    pub fn loader_commands(&self) -> Vec<LoaderCommand> {
        self.events
            .iter()
            .filter_map(|event| match event {
                LineEvent::Loader(command) => Some(*command),
                _ => None,
            })
            .collect()
    }

    fn receive(&mut self, bytes: &[u8]) {
        self.decoder.feed(bytes);

        while let Ok(Some(raw)) = self.decoder.next_frame() {
            if LoaderCommand::from_repr(raw.op).is_some() {
                if let Ok(request) = LoaderRequest::parse(raw) {
                    self.loader(request);
                }
                continue;
            }

            let bytes = match raw.encode() {
                Ok(bytes) => bytes,
                Err(_) => continue,
            };
            if let Ok(Some(Frame::Request(request))) = FrameDecoder::new().decode(&bytes) {
                self.command(request);
            }
        }
    }

    fn command(&mut self, request: CommandRequest) {
        self.events
            .push(LineEvent::Command(request.opcode.to_string()));

        let status = (self.responder)(&request);
        self.requests.push(request.clone());

        if let Some(status) = status {
            let result = CommandResult {
                correlation_id: request.correlation_id,
                opcode: request.opcode,
                status,
            };
            if let Ok(bytes) = codec::encode_response(&result) {
                self.rx.extend(bytes);
            }
        }
    }

    fn loader(&mut self, request: LoaderRequest) {
        self.events.push(LineEvent::Loader(request.command));
        if self.silent.contains(&request.command) {
            return;
        }

        let data = match request.command {
            LoaderCommand::Sync => self.chip.as_bytes().to_vec(),
            LoaderCommand::FlashBegin => {
                self.image.clear();
                Vec::new()
            }
            LoaderCommand::FlashData => {
                if let Some((_, block)) = request.block() {
                    self.image.extend_from_slice(block);
                }
                Vec::new()
            }
            LoaderCommand::FlashMd5 => {
                let mut digest = [0u8; MD5_LEN];
                digest.copy_from_slice(&Md5::digest(&self.image));
                if self.corrupt_md5 {
                    digest[0] ^= 0xff;
                }
                md5_reply(self.image.len() as u32, digest)
            }
            _ => Vec::new(),
        };

        if let Ok(bytes) = LoaderReply::ok(request.command, request.sequence, data).encode() {
            self.rx.extend(bytes);
        }
    }
}

/// Handle on the simulated device, shared with its ports
#[derive(Clone)]
pub struct MockDevice {
    state: Arc<Mutex<DeviceState>>,
}

impl MockDevice {
    pub fn new(responder: impl FnMut(&CommandRequest) -> Option<CommandStatus> + Send + 'static) -> Self {
        MockDevice {
            state: Arc::new(Mutex::new(DeviceState {
                events: Vec::new(),
                requests: Vec::new(),
                image: Vec::new(),
                chip: "k210".into(),
                corrupt_md5: false,
                broken: false,
                silent: Vec::new(),
                rx: VecDeque::new(),
                decoder: RawFrameDecoder::new(),
                responder: Box::new(responder),
            })),
        }
    }

    /// A device answering every command with success and no value
    pub fn acking() -> Self {
        Self::new(|_| Some(CommandStatus::Ok(None)))
    }

    pub fn state(&self) -> MutexGuard<'_, DeviceState> {
        self.state.lock().unwrap()
    }

    /// Queue a telemetry event for the host
    pub fn emit(&self, event: Telemetry) {
        let bytes = codec::encode_event(&event).unwrap();
        self.state().rx.extend(bytes);
    }

    /// A fresh port onto the device
    pub fn port(&self) -> MockPort {
        self.state().events.push(LineEvent::Opened);
        MockPort {
            device: self.clone(),
            baud: 115_200,
        }
    }

    /// Connect with the built-in profile's line settings
    pub fn connect(&self) -> Connection {
        let device = self.clone();
        Connection::with_opener(
            PORT,
            DeviceProfile::ecool().serial(),
            Duration::from_secs(1),
            move || Ok(Box::new(device.port()) as Box<dyn Transport>),
        )
        .unwrap()
    }
}

pub struct MockPort {
    device: MockDevice,
    baud: u32,
}

impl MockPort {
    fn record(&self, event: LineEvent) -> Result<(), Error> {
        self.device.state().events.push(event);
        Ok(())
    }
}

impl Transport for MockPort {
    fn name(&self) -> String {
        PORT.into()
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        {
            let mut state = self.device.state();
            if !state.rx.is_empty() {
                let n = buf.len().min(state.rx.len());
                for (slot, byte) in buf.iter_mut().zip(state.rx.drain(..n)) {
                    *slot = byte;
                }
                return Ok(n);
            }
        }

        sleep(Duration::from_millis(1));
        Err(io::ErrorKind::TimedOut.into())
    }

    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        let mut state = self.device.state();
        if state.broken {
            return Err(io::ErrorKind::BrokenPipe.into());
        }

        state.receive(bytes);
        Ok(())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }

    fn baud_rate(&self) -> Result<u32, Error> {
        Ok(self.baud)
    }

    fn set_baud_rate(&mut self, baud_rate: u32) -> Result<(), Error> {
        self.baud = baud_rate;
        self.record(LineEvent::Baud(baud_rate))
    }

    fn set_data_bits(&mut self, data_bits: DataBits) -> Result<(), Error> {
        self.record(LineEvent::DataBits(data_bits))
    }

    fn set_stop_bits(&mut self, stop_bits: StopBits) -> Result<(), Error> {
        self.record(LineEvent::StopBits(stop_bits))
    }

    fn set_flow_control(&mut self, enabled: bool) -> Result<(), Error> {
        self.record(LineEvent::FlowControl(enabled))
    }

    fn set_timeout(&mut self, _timeout: Duration) -> Result<(), Error> {
        Ok(())
    }

    fn write_data_terminal_ready(&mut self, level: bool) -> Result<(), Error> {
        self.record(LineEvent::Dtr(level))
    }

    fn write_request_to_send(&mut self, level: bool) -> Result<(), Error> {
        self.record(LineEvent::Rts(level))
    }

    fn clear_input(&mut self) -> Result<(), Error> {
        self.device.state().rx.clear();
        Ok(())
    }
}
