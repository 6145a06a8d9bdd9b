//! Establish a connection with a target device
//!
//! The [Connection] struct owns the transport to the peripheral and its line
//! configuration, and tracks whether the link is usable.

use std::{
    io::ErrorKind,
    sync::{mpsc, Arc, Mutex},
    thread,
    time::{Duration, Instant},
};

use log::{debug, info, warn};
use strum::Display;

pub use self::transport::{SerialTransport, Transport};
use crate::{
    codec::{Frame, FrameDecoder, RawFrame, RawFrameDecoder},
    error::{ConnectionError, Error, ProtocolError, TimedOutCommand},
    profile::SerialConfig,
};

pub mod reset;
pub mod transport;

/// Read timeout of the underlying port; bounds how long a single poll blocks
pub const POLL_INTERVAL: Duration = Duration::from_millis(20);
/// Default bound on opening a port
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

const READ_CHUNK: usize = 1024;

/// Lifecycle of a [Connection]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Exclusively owned by a firmware upload
    Flashing,
    /// An I/O error or repeated timeouts; the connection must be reopened
    Faulted,
}

type Opener = Box<dyn FnMut() -> Result<Box<dyn Transport>, Error> + Send>;

/// Result of waiting for one frame
#[derive(Debug)]
pub enum Incoming<T> {
    Frame(T),
    /// A frame was dropped; the decoder has resynchronized
    Malformed(ProtocolError),
    /// The deadline passed without a complete frame
    Idle,
}

/// An established connection with a target device
pub struct Connection {
    port_path: String,
    serial: SerialConfig,
    state: ConnectionState,
    transport: Option<Box<dyn Transport>>,
    opener: Option<Arc<Mutex<Opener>>>,
    connect_timeout: Duration,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("port_path", &self.port_path)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl Connection {
    /// Open and configure the serial port at `port_path`
    pub fn open(
        port_path: &str,
        serial: &SerialConfig,
        connect_timeout: Duration,
    ) -> Result<Self, Error> {
        let path = port_path.to_string();
        let baud_rate = serial.baud_rate;

        Self::with_opener(port_path, serial, connect_timeout, move || {
            let transport = SerialTransport::open(&path, baud_rate)?;
            Ok(Box::new(transport) as Box<dyn Transport>)
        })
    }

    /// Open a connection through `opener`, which is called again on
    /// [Connection::reopen]
    pub fn with_opener<F>(
        port_path: &str,
        serial: &SerialConfig,
        connect_timeout: Duration,
        opener: F,
    ) -> Result<Self, Error>
    where
        F: FnMut() -> Result<Box<dyn Transport>, Error> + Send + 'static,
    {
        let mut connection = Connection {
            port_path: port_path.to_string(),
            serial: *serial,
            state: ConnectionState::Disconnected,
            transport: None,
            opener: Some(Arc::new(Mutex::new(Box::new(opener)))),
            connect_timeout,
        };
        connection.connect()?;

        Ok(connection)
    }

    /// Configure an already open transport; it cannot be reopened
    pub fn from_transport(
        port_path: &str,
        transport: Box<dyn Transport>,
        serial: &SerialConfig,
    ) -> Result<Self, Error> {
        let mut connection = Connection {
            port_path: port_path.to_string(),
            serial: *serial,
            state: ConnectionState::Connecting,
            transport: None,
            opener: None,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        };
        connection.attach(transport)?;

        Ok(connection)
    }

    fn connect(&mut self) -> Result<(), Error> {
        let opener = self
            .opener
            .clone()
            .ok_or(Error::Connection(ConnectionError::ConnectionFailed))?;

        self.state = ConnectionState::Connecting;
        debug!("Opening {}", self.port_path);

        match open_bounded(opener, self.connect_timeout) {
            Ok(transport) => self.attach(transport),
            Err(err) => {
                self.state = ConnectionState::Disconnected;
                Err(err)
            }
        }
    }

    /// Apply the line configuration; nothing is written before it completes
    fn attach(&mut self, mut transport: Box<dyn Transport>) -> Result<(), Error> {
        if let Err(err) = configure(transport.as_mut(), &self.serial) {
            self.state = ConnectionState::Disconnected;
            return Err(err);
        }

        info!(
            "Connected to {} at {} baud",
            self.port_path, self.serial.baud_rate
        );

        self.transport = Some(transport);
        self.state = ConnectionState::Connected;

        Ok(())
    }

    /// Close the connection, releasing the port
    ///
    /// Closing an already closed connection does nothing.
    pub fn close(&mut self) {
        if self.transport.take().is_some() {
            info!("Closed {}", self.port_path);
        }
        self.state = ConnectionState::Disconnected;
    }

    /// Close and open the port again with the same configuration
    pub fn reopen(&mut self) -> Result<(), Error> {
        self.close();
        self.connect()
    }

    pub fn port_path(&self) -> &str {
        &self.port_path
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn serial_config(&self) -> &SerialConfig {
        &self.serial
    }

    pub fn is_usable(&self) -> bool {
        matches!(
            self.state,
            ConnectionState::Connected | ConnectionState::Flashing
        )
    }

    /// Mark the connection as unusable until reopened
    pub(crate) fn fault(&mut self) {
        if self.state != ConnectionState::Faulted {
            warn!("Connection to {} faulted", self.port_path);
        }
        self.state = ConnectionState::Faulted;
    }

    pub(crate) fn begin_flashing(&mut self) -> Result<(), Error> {
        self.usable()?;
        self.state = ConnectionState::Flashing;
        Ok(())
    }

    pub(crate) fn end_flashing(&mut self) {
        if self.state == ConnectionState::Flashing {
            self.state = ConnectionState::Connected;
        }
    }

    fn usable(&self) -> Result<(), Error> {
        match self.state {
            ConnectionState::Connected | ConnectionState::Flashing => Ok(()),
            ConnectionState::Faulted => Err(Error::Connection(ConnectionError::Faulted)),
            _ => Err(Error::Connection(ConnectionError::Closed)),
        }
    }

    /// Run `f` on the transport, faulting the connection if it fails
    fn with_transport<T>(
        &mut self,
        f: impl FnOnce(&mut dyn Transport) -> Result<T, Error>,
    ) -> Result<T, Error> {
        self.usable()?;

        let transport = self
            .transport
            .as_deref_mut()
            .ok_or(Error::Connection(ConnectionError::Closed))?;

        match f(transport) {
            Ok(value) => Ok(value),
            Err(err) => {
                self.fault();
                Err(err)
            }
        }
    }

    /// Read whatever is available
    ///
    /// Returns `Ok(0)` when nothing arrived within [POLL_INTERVAL].
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize, Error> {
        self.with_transport(|transport| match transport.read(buf) {
            Ok(n) => Ok(n),
            Err(err)
                if matches!(
                    err.kind(),
                    ErrorKind::TimedOut | ErrorKind::WouldBlock | ErrorKind::Interrupted
                ) =>
            {
                Ok(0)
            }
            Err(err) => Err(err.into()),
        })
    }

    /// Write all of `bytes` and flush them to the device
    pub fn write(&mut self, bytes: &[u8]) -> Result<(), Error> {
        debug!("Writing {} bytes to {}", bytes.len(), self.port_path);

        self.with_transport(|transport| {
            transport.write_all(bytes)?;
            transport.flush()?;
            Ok(())
        })
    }

    /// Wait until `deadline` for the next command protocol frame
    pub fn read_frame(
        &mut self,
        decoder: &mut FrameDecoder,
        deadline: Instant,
    ) -> Result<Incoming<Frame>, Error> {
        self.read_until(deadline, |bytes| {
            decoder.feed(bytes);
            decoder.next_frame().transpose()
        })
    }

    /// Wait until `deadline` for the next frame without interpreting it
    pub fn read_raw_frame(
        &mut self,
        decoder: &mut RawFrameDecoder,
        deadline: Instant,
    ) -> Result<Incoming<RawFrame>, Error> {
        self.read_until(deadline, |bytes| {
            decoder.feed(bytes);
            decoder.next_frame().transpose()
        })
    }

    /// Polls the port at least once, even if `deadline` has already passed
    fn read_until<T>(
        &mut self,
        deadline: Instant,
        mut next: impl FnMut(&[u8]) -> Option<Result<T, ProtocolError>>,
    ) -> Result<Incoming<T>, Error> {
        let mut buf = [0u8; READ_CHUNK];
        let mut received = 0;
        let mut polled = false;

        loop {
            match next(&buf[..received]) {
                Some(Ok(frame)) => return Ok(Incoming::Frame(frame)),
                Some(Err(err)) => {
                    warn!("Dropped malformed frame from {}: {err}", self.port_path);
                    return Ok(Incoming::Malformed(err));
                }
                None => {}
            }

            if polled && Instant::now() >= deadline {
                return Ok(Incoming::Idle);
            }

            received = self.read(&mut buf)?;
            polled = true;
        }
    }

    pub fn set_dtr(&mut self, level: bool) -> Result<(), Error> {
        self.with_transport(|transport| transport.write_data_terminal_ready(level))
    }

    pub fn set_rts(&mut self, level: bool) -> Result<(), Error> {
        self.with_transport(|transport| transport.write_request_to_send(level))
    }

    /// Set baud rate for the serial port
    pub fn set_baud(&mut self, baud_rate: u32) -> Result<(), Error> {
        debug!("Switching {} to {baud_rate} baud", self.port_path);
        self.with_transport(|transport| transport.set_baud_rate(baud_rate))
    }

    /// Get the current baud rate of the serial port
    pub fn baud(&mut self) -> Result<u32, Error> {
        self.with_transport(|transport| transport.baud_rate())
    }

    pub fn set_flow_control(&mut self, enabled: bool) -> Result<(), Error> {
        self.with_transport(|transport| transport.set_flow_control(enabled))
    }

    pub fn clear_input(&mut self) -> Result<(), Error> {
        self.with_transport(|transport| transport.clear_input())
    }

    /// Return the serial port to its configured line settings
    pub(crate) fn restore_lines(&mut self) -> Result<(), Error> {
        let serial = self.serial;
        self.with_transport(|transport| configure(transport, &serial))
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}

fn configure(transport: &mut dyn Transport, serial: &SerialConfig) -> Result<(), Error> {
    transport.set_baud_rate(serial.baud_rate)?;
    transport.set_data_bits(serial.serial_data_bits())?;
    transport.set_stop_bits(serial.serial_stop_bits())?;
    transport.set_flow_control(false)?;
    transport.write_data_terminal_ready(serial.dtr)?;
    transport.write_request_to_send(serial.rts)?;
    transport.set_timeout(POLL_INTERVAL)?;
    transport.clear_input()?;

    Ok(())
}

/// Run `opener` on a helper thread so a hanging driver cannot block past
/// `timeout`
fn open_bounded(
    opener: Arc<Mutex<Opener>>,
    timeout: Duration,
) -> Result<Box<dyn Transport>, Error> {
    let (tx, rx) = mpsc::channel();

    thread::Builder::new()
        .name("periphlink-open".into())
        .spawn(move || {
            let result = match opener.lock() {
                Ok(mut guard) => {
                    let open: &mut Opener = &mut guard;
                    open()
                }
                Err(_) => Err(Error::Connection(ConnectionError::ConnectionFailed)),
            };
            // The receiver is gone if the open already timed out
            tx.send(result).ok();
        })?;

    match rx.recv_timeout(timeout) {
        Ok(result) => result,
        Err(mpsc::RecvTimeoutError::Timeout) => Err(Error::Connection(ConnectionError::Timeout(
            TimedOutCommand::default(),
        ))),
        Err(mpsc::RecvTimeoutError::Disconnected) => {
            Err(Error::Connection(ConnectionError::ConnectionFailed))
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::VecDeque,
        io,
        sync::{Arc, Mutex},
    };

    use serialport::{DataBits, StopBits};

    use super::*;
    use crate::profile::DeviceProfile;

    #[derive(Default)]
    struct Shared {
        log: Vec<String>,
        input: VecDeque<u8>,
        fail_writes: bool,
    }

    struct FakePort(Arc<Mutex<Shared>>);

    impl FakePort {
        fn record(&self, entry: String) -> Result<(), Error> {
            self.0.lock().unwrap().log.push(entry);
            Ok(())
        }
    }

    impl Transport for FakePort {
        fn name(&self) -> String {
            "fake".into()
        }

        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let mut shared = self.0.lock().unwrap();
            if shared.input.is_empty() {
                return Err(io::Error::new(io::ErrorKind::TimedOut, "no data"));
            }
            let n = buf.len().min(shared.input.len());
            for (slot, byte) in buf.iter_mut().zip(shared.input.drain(..n)) {
                *slot = byte;
            }
            Ok(n)
        }

        fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
            let mut shared = self.0.lock().unwrap();
            if shared.fail_writes {
                return Err(io::Error::new(io::ErrorKind::BrokenPipe, "unplugged"));
            }
            shared.log.push(format!("write {}", bytes.len()));
            Ok(())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }

        fn baud_rate(&self) -> Result<u32, Error> {
            Ok(115_200)
        }

        fn set_baud_rate(&mut self, baud_rate: u32) -> Result<(), Error> {
            self.record(format!("baud {baud_rate}"))
        }

        fn set_data_bits(&mut self, data_bits: DataBits) -> Result<(), Error> {
            self.record(format!("data {data_bits:?}"))
        }

        fn set_stop_bits(&mut self, stop_bits: StopBits) -> Result<(), Error> {
            self.record(format!("stop {stop_bits:?}"))
        }

        fn set_flow_control(&mut self, enabled: bool) -> Result<(), Error> {
            self.record(format!("flow {enabled}"))
        }

        fn set_timeout(&mut self, _timeout: Duration) -> Result<(), Error> {
            Ok(())
        }

        fn write_data_terminal_ready(&mut self, level: bool) -> Result<(), Error> {
            self.record(format!("dtr {level}"))
        }

        fn write_request_to_send(&mut self, level: bool) -> Result<(), Error> {
            self.record(format!("rts {level}"))
        }

        fn clear_input(&mut self) -> Result<(), Error> {
            Ok(())
        }
    }

    fn fake() -> (Arc<Mutex<Shared>>, Box<dyn Transport>) {
        let shared = Arc::new(Mutex::new(Shared::default()));
        (shared.clone(), Box::new(FakePort(shared)))
    }

    #[test]
    fn lines_are_configured_before_use() {
        let profile = DeviceProfile::ecool();
        let (shared, port) = fake();

        let mut connection = Connection::from_transport("fake", port, profile.serial()).unwrap();
        assert_eq!(connection.state(), ConnectionState::Connected);
        connection.write(&[1, 2, 3]).unwrap();

        assert_eq!(
            shared.lock().unwrap().log,
            vec![
                "baud 115200",
                "data Eight",
                "stop One",
                "flow false",
                "dtr false",
                "rts false",
                "write 3",
            ]
        );
    }

    #[test]
    fn empty_polls_are_not_faults() {
        let profile = DeviceProfile::ecool();
        let (shared, port) = fake();
        let mut connection = Connection::from_transport("fake", port, profile.serial()).unwrap();

        let mut buf = [0u8; 8];
        assert_eq!(connection.read(&mut buf).unwrap(), 0);
        assert_eq!(connection.state(), ConnectionState::Connected);

        shared.lock().unwrap().input.extend([7, 8]);
        assert_eq!(connection.read(&mut buf).unwrap(), 2);
        assert_eq!(&buf[..2], &[7, 8]);
    }

    #[test]
    fn write_errors_fault_the_connection() {
        let profile = DeviceProfile::ecool();
        let (shared, port) = fake();
        let mut connection = Connection::from_transport("fake", port, profile.serial()).unwrap();

        shared.lock().unwrap().fail_writes = true;
        assert!(connection.write(&[1]).is_err());
        assert_eq!(connection.state(), ConnectionState::Faulted);

        assert!(matches!(
            connection.write(&[1]),
            Err(Error::Connection(ConnectionError::Faulted))
        ));
    }

    #[test]
    fn close_is_idempotent_and_reopen_reconnects() {
        let profile = DeviceProfile::ecool();
        let opened = Arc::new(Mutex::new(0));

        let counter = opened.clone();
        let mut connection = Connection::with_opener(
            "fake",
            profile.serial(),
            DEFAULT_CONNECT_TIMEOUT,
            move || {
                *counter.lock().unwrap() += 1;
                Ok(fake().1)
            },
        )
        .unwrap();

        connection.close();
        connection.close();
        assert_eq!(connection.state(), ConnectionState::Disconnected);
        assert!(connection.write(&[1]).is_err());

        connection.reopen().unwrap();
        assert_eq!(connection.state(), ConnectionState::Connected);
        assert_eq!(*opened.lock().unwrap(), 2);
    }

    #[test]
    fn hanging_open_times_out() {
        let profile = DeviceProfile::ecool();

        let err = Connection::with_opener(
            "fake",
            profile.serial(),
            Duration::from_millis(50),
            || {
                thread::sleep(Duration::from_millis(500));
                Ok(fake().1)
            },
        )
        .unwrap_err();

        assert!(matches!(
            err,
            Error::Connection(ConnectionError::Timeout(_))
        ));
    }
}
