//! Host-side register bus access for Olympus FPGA images, such as the one
//! running on the Dionysus board.
//!
//! An Olympus image exposes a Wishbone master to the host over a byte
//! stream (a USB synchronous FIFO or a UART).  The host sends framed
//! requests - ping, read, write, reset, core dump - and the master answers
//! with a response frame that starts with a fixed identification byte.
//! Peripherals are discovered by reading the Device ROM Table (DRT), which
//! the image places at address 0 of the peripheral bus.
//!
//! ## Architecture
//!
//! - **Transport**: a raw duplex byte channel, supplied by the application as
//!   an [`io::Transport`] (or [`io::AsyncTransport`]) implementation.  A
//!   serial port implementation is included behind the `serial` feature.
//! - **Framing**: [`frame`] turns operations into the exact bytes sent on the
//!   wire, and response payloads back into 32-bit words.
//! - **Synchronization**: [`frame::sync::Synchronizer`] hunts for the `0xDC`
//!   response sentinel, discarding any noise that precedes it, and gives up
//!   after a wall-clock deadline.
//! - **Discovery**: [`drt`] parses the DRT word block into a
//!   [`drt::DeviceTable`].
//! - **Client**: [`client::BusClient`] ties the above together into device
//!   level operations, and caches the device table and interrupt bitmask.
//!
//! The protocol is strictly half-duplex: one request, then its response.  A
//! [`client::BusClient`] therefore owns its transport exclusively, and must be
//! wrapped in a mutex to be shared between threads - see
//! [`client::listener::InterruptListener`] for an interrupt polling worker
//! built that way.
//!
//! ## Wire format
//!
//! Requests (multi-byte fields big-endian):
//!
//! ```text
//! byte 0     0xCD  identification
//! byte 1     command code
//! bytes 2-4  length in 32-bit words
//! byte 5     device selector (0x00 for the memory bus)
//! bytes 6-8  address
//! bytes 9..  payload (writes only)
//! ```
//!
//! Responses start with `0xDC`, possibly preceded by noise, followed by an
//! 8 byte status block and, for reads, the payload.
//!
//! ## Getting started
//!
//! ```rust,ignore
//! use olympus_bus::client::{BusClient, BusClientConfig};
//!
//! let transport = ...; // implement olympus_bus::io::Transport
//! let mut client = BusClient::new(transport, BusClientConfig::default());
//! client.connect()?;
//! client.ping()?;
//! client.read_drt()?;
//! for device in client.devices()?.iter() {
//!     println!("{device}");
//! }
//! let words = client.read_registers(1, 0, 2)?;
//! ```
//!
//! ## Features
//!
//! Default features:
//! - `async` - [`client::AsyncBusClient`] and the [`io::AsyncTransport`] trait.
//!
//! Optional features:
//! - `serial` - [`io::serial::SerialTransport`], a UART transport.
//! - `sim` - [`sim::SimulatedBoard`], an in-process device speaking the wire
//!   protocol, for testing drivers without hardware.

// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

pub mod client;
pub mod core_dump;
pub mod drt;
pub mod frame;
pub mod io;
#[cfg(any(test, feature = "sim"))]
pub mod sim;

/// Register bus errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Transport could not be opened or configured
    Connect,
    /// No ping response within the timeout
    PingTimeout,
    /// Response sentinel not seen within the timeout
    ResponseTimeout,
    /// Sentinel seen, but the response ended early
    TruncatedResponse {
        /// Bytes required after the sentinel
        expected: usize,
        /// Bytes received before the deadline
        received: usize,
    },
    /// Reading the Device ROM Table failed
    DrtRead(Box<Error>),
    /// Device ROM Table contents are implausible
    DrtCorrupt,
    /// Request parameters do not fit the frame
    Encoding,
    /// Response payload could not be decoded
    Decoding,
    /// Device index not present in the device table
    IndexOutOfRange,
    /// Register transaction with a device failed
    DeviceComm(Box<Error>),
    /// Operation not valid in the current connection state
    InvalidOperation,
    /// Transport read or write failed
    Io,
}

impl Error {
    /// Wrap a transaction failure as a device communication error.
    pub(crate) fn device_comm(self) -> Self {
        match self {
            Error::IndexOutOfRange | Error::InvalidOperation | Error::DeviceComm(_) => self,
            other => Error::DeviceComm(Box::new(other)),
        }
    }

    /// Wrap a transaction failure as a DRT read error.
    pub(crate) fn drt_read(self) -> Self {
        match self {
            Error::DrtCorrupt | Error::InvalidOperation | Error::DrtRead(_) => self,
            other => Error::DrtRead(Box::new(other)),
        }
    }
}

impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Error::Connect => write!(f, "failed to open transport"),
            Error::PingTimeout => write!(f, "no response to ping"),
            Error::ResponseTimeout => write!(f, "timed out waiting for response"),
            Error::TruncatedResponse { expected, received } => {
                write!(f, "response truncated: {received} of {expected} bytes")
            }
            Error::DrtRead(e) => write!(f, "failed to read DRT: {e}"),
            Error::DrtCorrupt => write!(f, "DRT contents are corrupt"),
            Error::Encoding => write!(f, "request does not fit the frame format"),
            Error::Decoding => write!(f, "malformed response payload"),
            Error::IndexOutOfRange => write!(f, "device index out of range"),
            Error::DeviceComm(e) => write!(f, "device communication failed: {e}"),
            Error::InvalidOperation => write!(f, "invalid operation in current state"),
            Error::Io => write!(f, "transport I/O error"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::DrtRead(e) | Error::DeviceComm(e) => Some(e.as_ref()),
            _ => None,
        }
    }
}

/// Type to represent the result of a register bus operation
pub type Result<T> = core::result::Result<T, Error>;

#[cfg(test)]
pub(crate) fn init_test_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}
