//! UART transport using the `serialport` crate.

// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

use std::io::{ErrorKind, Read, Write};
use std::time::Duration;

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};
use serialport::{ClearBuffer, SerialPort};

use crate::io::Transport;

/// Default time a single port read waits for data.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_millis(10);

/// [`Transport`] over a serial port, e.g. `/dev/ttyUSB0`.
///
/// The port is opened by [`Transport::open()`], not by [`Self::new()`], so
/// that the open failure is reported through
/// [`crate::client::BusClient::connect()`].
pub struct SerialTransport {
    path: String,
    baud_rate: u32,
    read_timeout: Duration,
    port: Option<Box<dyn SerialPort>>,
}

impl SerialTransport {
    /// Create a new, unopened, serial transport.
    ///
    /// Arguments:
    /// - `path`: device path, e.g. `/dev/ttyUSB0`
    /// - `baud_rate`: baud rate, e.g. `115200`
    pub fn new(path: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            path: path.into(),
            baud_rate,
            read_timeout: DEFAULT_READ_TIMEOUT,
            port: None,
        }
    }

    /// Set how long a single port read waits before returning no data.
    ///
    /// Keep this well below the client's transaction timeout.
    pub fn with_read_timeout(mut self, read_timeout: Duration) -> Self {
        self.read_timeout = read_timeout;
        self
    }

    fn port(&mut self) -> Result<&mut Box<dyn SerialPort>, serialport::Error> {
        self.port.as_mut().ok_or_else(|| {
            serialport::Error::new(serialport::ErrorKind::NoDevice, "serial port not open")
        })
    }
}

impl Transport for SerialTransport {
    type Error = serialport::Error;

    fn open(&mut self) -> Result<(), Self::Error> {
        let port = serialport::new(self.path.as_str(), self.baud_rate)
            .timeout(self.read_timeout)
            .open()?;
        port.clear(ClearBuffer::All)?;
        debug!("Opened {} at {} baud", self.path, self.baud_rate);
        self.port = Some(port);
        Ok(())
    }

    fn close(&mut self) {
        if self.port.take().is_some() {
            debug!("Closed {}", self.path);
        }
    }

    fn write(&mut self, data: &[u8]) -> Result<(), Self::Error> {
        let port = self.port()?;
        port.write_all(data)?;
        port.flush()?;
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, Self::Error> {
        let port = self.port()?;
        match port.read(buf) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == ErrorKind::TimedOut => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    fn purge(&mut self) -> Result<(), Self::Error> {
        self.port()?.clear(ClearBuffer::All)
    }
}
