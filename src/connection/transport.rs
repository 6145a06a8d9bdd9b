//! Byte transports underneath a [Connection](super::Connection)

use std::{io::Read, io::Write, time::Duration};

use serialport::{ClearBuffer, DataBits, FlowControl, SerialPort, StopBits};

use crate::error::Error;

/// A bidirectional byte channel with serial line control
///
/// Reads are polls: when no data arrives within the configured timeout they
/// fail with [std::io::ErrorKind::TimedOut], which the connection treats as
/// "nothing yet" rather than a fault.
pub trait Transport: Send {
    /// Human readable name, e.g. the port path
    fn name(&self) -> String;

    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize>;

    fn write_all(&mut self, bytes: &[u8]) -> std::io::Result<()>;

    fn flush(&mut self) -> std::io::Result<()>;

    fn baud_rate(&self) -> Result<u32, Error>;

    fn set_baud_rate(&mut self, baud_rate: u32) -> Result<(), Error>;

    fn set_data_bits(&mut self, data_bits: DataBits) -> Result<(), Error>;

    fn set_stop_bits(&mut self, stop_bits: StopBits) -> Result<(), Error>;

    /// Enable or disable RTS/CTS hardware flow control
    fn set_flow_control(&mut self, enabled: bool) -> Result<(), Error>;

    /// Poll interval for reads
    fn set_timeout(&mut self, timeout: Duration) -> Result<(), Error>;

    fn write_data_terminal_ready(&mut self, level: bool) -> Result<(), Error>;

    fn write_request_to_send(&mut self, level: bool) -> Result<(), Error>;

    /// Discard any bytes received but not yet read
    fn clear_input(&mut self) -> Result<(), Error>;
}

/// [Transport] over an OS serial port
pub struct SerialTransport {
    port: Box<dyn SerialPort>,
}

impl SerialTransport {
    /// Open `port_path`; line settings are applied by the connection afterwards
    pub fn open(port_path: &str, baud_rate: u32) -> Result<Self, Error> {
        let port = serialport::new(port_path, baud_rate)
            .flow_control(FlowControl::None)
            .open()?;

        Ok(SerialTransport { port })
    }
}

impl Transport for SerialTransport {
    fn name(&self) -> String {
        self.port.name().unwrap_or_default()
    }

    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.port.read(buf)
    }

    fn write_all(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        self.port.write_all(bytes)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.port.flush()
    }

    fn baud_rate(&self) -> Result<u32, Error> {
        Ok(self.port.baud_rate()?)
    }

    fn set_baud_rate(&mut self, baud_rate: u32) -> Result<(), Error> {
        self.port.set_baud_rate(baud_rate)?;
        Ok(())
    }

    fn set_data_bits(&mut self, data_bits: DataBits) -> Result<(), Error> {
        self.port.set_data_bits(data_bits)?;
        Ok(())
    }

    fn set_stop_bits(&mut self, stop_bits: StopBits) -> Result<(), Error> {
        self.port.set_stop_bits(stop_bits)?;
        Ok(())
    }

    fn set_flow_control(&mut self, enabled: bool) -> Result<(), Error> {
        let flow_control = if enabled {
            FlowControl::Hardware
        } else {
            FlowControl::None
        };
        self.port.set_flow_control(flow_control)?;
        Ok(())
    }

    fn set_timeout(&mut self, timeout: Duration) -> Result<(), Error> {
        self.port.set_timeout(timeout)?;
        Ok(())
    }

    fn write_data_terminal_ready(&mut self, level: bool) -> Result<(), Error> {
        self.port.write_data_terminal_ready(level)?;
        Ok(())
    }

    fn write_request_to_send(&mut self, level: bool) -> Result<(), Error> {
        self.port.write_request_to_send(level)?;
        Ok(())
    }

    fn clear_input(&mut self) -> Result<(), Error> {
        self.port.clear(ClearBuffer::Input)?;
        Ok(())
    }
}
