//! Transport traits for the raw byte channel to an Olympus image.
//!
//! A transport is a duplex, in-order byte stream.  It is allowed to lose or
//! delay bytes, and to emit stray bytes (for example FTDI modem status) ahead
//! of a response - the synchronizer in [`crate::frame`] copes with that.
//!
//! # Possible implementations
//!
//! - A UART, see [`serial::SerialTransport`] (feature `serial`)
//! - A USB synchronous FIFO such as the FT2232H on the Dionysus board
//! - An in-process simulation, see `crate::sim` (feature `sim`)
//!
//! # Read semantics
//!
//! `read` must return within a short, bounded time even when nothing has
//! arrived, returning `Ok(0)` in that case.  The caller enforces the overall
//! transaction deadline by calling `read` repeatedly, so a transport that
//! blocks forever defeats the response timeout.

// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

#[cfg(feature = "serial")]
pub mod serial;

/// Blocking transport trait.
pub trait Transport {
    /// The error type returned by transport operations.
    ///
    /// This allows implementations to use their own error types
    /// (e.g., `std::io::Error` or `serialport::Error`).
    type Error: core::fmt::Debug;

    /// Open and configure the underlying channel.
    ///
    /// Called once by [`crate::client::BusClient::connect()`].  Baud rate,
    /// USB mode and similar parameters are the implementation's concern.
    fn open(&mut self) -> Result<(), Self::Error>;

    /// Close the underlying channel.  The default does nothing.
    fn close(&mut self) {}

    /// Write all of `data` to the channel.
    fn write(&mut self, data: &[u8]) -> Result<(), Self::Error>;

    /// Read up to `buf.len()` bytes, returning how many were read.
    ///
    /// Returns `Ok(0)` if nothing arrived within the transport's own short
    /// read timeout.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, Self::Error>;

    /// Discard anything buffered in either direction.
    fn purge(&mut self) -> Result<(), Self::Error>;
}

/// Async transport trait.
///
/// Same contract as [`Transport`], for transports driven by an async
/// runtime.
#[cfg(feature = "async")]
#[async_trait::async_trait(?Send)]
pub trait AsyncTransport {
    /// The error type returned by transport operations.
    type Error: core::fmt::Debug;

    /// Open and configure the underlying channel.
    async fn open(&mut self) -> Result<(), Self::Error>;

    /// Close the underlying channel.  The default does nothing.
    async fn close(&mut self) {}

    /// Write all of `data` to the channel.
    async fn write(&mut self, data: &[u8]) -> Result<(), Self::Error>;

    /// Read up to `buf.len()` bytes, returning how many were read, or
    /// `Ok(0)` if nothing is available yet.
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, Self::Error>;

    /// Discard anything buffered in either direction.
    async fn purge(&mut self) -> Result<(), Self::Error>;
}
