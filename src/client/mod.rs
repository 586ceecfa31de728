//! Register bus client - the device level interface to an Olympus image.
//!
//! - [`BusClient`]: blocking client over a [`crate::io::Transport`]
//! - [`AsyncBusClient`]: async client over a [`crate::io::AsyncTransport`]
//! - [`listener::InterruptListener`]: worker thread polling for interrupts
//!   on a shared [`BusClient`]
//!
//! Both clients move through the same states:
//!
//! ```text
//! Disconnected --connect()--> Connected --read_drt()--> DrtLoaded
//!       ^                                                   |
//!       +------------------- disconnect() ------------------+
//! ```

// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

use std::time::Duration;

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

#[cfg(feature = "async")]
pub mod futures;
pub mod listener;
pub mod sync;

#[cfg(feature = "async")]
pub use crate::frame::AsyncDelay;
#[cfg(feature = "async")]
pub use futures::AsyncBusClient;
pub use listener::{CancelToken, InterruptListener, ListenerAction};
pub use sync::{BusClient, SharedBusClient};

use crate::drt::{DRT_HEADER_WORDS, DeviceDescriptor, DeviceTable, DrtHeader};
use crate::frame::{Bus, RESPONSE_STATUS_LEN, ResponseStatus};
use crate::{Error, Result};

/// Default response timeout
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(3);

/// Default timeout for core dumps, which the master is slow to produce
pub const DEFAULT_CORE_DUMP_TIMEOUT: Duration = Duration::from_secs(5);

/// Default upper bound on the DRT device count
pub const DEFAULT_MAX_DEVICES: u32 = 255;

/// Peripheral selector of the DRT itself
pub const DRT_SELECTOR: u8 = 0x00;

/// Board specific protocol conventions.
///
/// The different host tools for Olympus boards agree on framing, but not on
/// how a DRT index maps onto a peripheral selector, or where the interrupt
/// bitmask sits in an interrupt frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dialect {
    /// Added to a DRT index to form the peripheral selector
    pub selector_offset: u8,
    /// Byte offset of the 32-bit interrupt mask within the 8-byte status
    pub interrupt_mask_offset: usize,
}

impl Dialect {
    /// Dionysus (FT2232H synchronous FIFO).  DRT index is the selector, the
    /// DRT itself being index 0.  Interrupt mask in status bytes 4-7.
    pub const fn dionysus() -> Self {
        Self {
            selector_offset: 0,
            interrupt_mask_offset: 4,
        }
    }

    /// Older images where DRT records are numbered from the first real
    /// device, so index `i` is selector `i + 1`.  Interrupt mask in status
    /// bytes 0-3.
    pub const fn legacy() -> Self {
        Self {
            selector_offset: 1,
            interrupt_mask_offset: 0,
        }
    }

    /// Peripheral selector for a DRT index
    pub fn selector(&self, index: u32) -> Result<u8> {
        index
            .checked_add(self.selector_offset as u32)
            .and_then(|s| u8::try_from(s).ok())
            .ok_or(Error::Encoding)
    }

    /// Interrupt bitmask bit for a DRT index
    pub fn interrupt_bit(&self, index: u32) -> u32 {
        self.selector(index)
            .ok()
            .and_then(|s| 1u32.checked_shl(s as u32))
            .unwrap_or(0)
    }

    pub(crate) fn interrupt_mask(&self, rsp: &[u8]) -> Result<u32> {
        ResponseStatus::from_response(rsp)?.word_at(self.interrupt_mask_offset)
    }
}

impl Default for Dialect {
    fn default() -> Self {
        Self::dionysus()
    }
}

/// Configuration for creating a bus client.
#[derive(Debug, Clone)]
pub struct BusClientConfig {
    /// Time allowed for each response
    pub timeout: Duration,
    /// Time allowed for a core dump response
    pub core_dump_timeout: Duration,
    /// Bytes requested per read while looking for the response sentinel
    pub sync_chunk: usize,
    /// DRTs claiming more devices than this are treated as corrupt
    pub max_devices: u32,
    pub dialect: Dialect,
}

impl BusClientConfig {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_dialect(mut self, dialect: Dialect) -> Self {
        self.dialect = dialect;
        self
    }
}

impl Default for BusClientConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            core_dump_timeout: DEFAULT_CORE_DUMP_TIMEOUT,
            sync_chunk: 1,
            max_devices: DEFAULT_MAX_DEVICES,
            dialect: Dialect::default(),
        }
    }
}

/// Connection lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connected,
    DrtLoaded,
}

/// Where a device-relative transaction lands on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Target {
    pub bus: Bus,
    pub selector: u8,
    pub address: u32,
}

/// State shared by the sync and async clients.
#[derive(Debug)]
pub(crate) struct ClientState {
    pub config: BusClientConfig,
    state: ConnectionState,
    devices: Option<DeviceTable>,
    interrupts: u32,
}

impl ClientState {
    pub fn new(config: BusClientConfig) -> Self {
        Self {
            config,
            state: ConnectionState::Disconnected,
            devices: None,
            interrupts: 0,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn connected(&mut self) {
        debug!("State {:?} -> Connected", self.state);
        self.state = ConnectionState::Connected;
        self.devices = None;
        self.interrupts = 0;
    }

    pub fn disconnected(&mut self) {
        debug!("State {:?} -> Disconnected", self.state);
        self.state = ConnectionState::Disconnected;
        self.devices = None;
        self.interrupts = 0;
    }

    pub fn check_connected(&self) -> Result<()> {
        if self.state == ConnectionState::Disconnected {
            Err(Error::InvalidOperation)
        } else {
            Ok(())
        }
    }

    pub fn devices(&self) -> Result<&DeviceTable> {
        match (&self.devices, self.state) {
            (Some(table), ConnectionState::DrtLoaded) => Ok(table),
            _ => Err(Error::InvalidOperation),
        }
    }

    pub fn device(&self, index: u32) -> Result<&DeviceDescriptor> {
        self.devices()?.get(index)
    }

    /// Validate a DRT header and return how many body words to read.
    pub fn drt_body_words(&self, header_words: &[u32]) -> Result<(DrtHeader, usize)> {
        let header = DrtHeader::parse(header_words).map_err(|_| Error::DrtCorrupt)?;
        let count = header.device_count();
        if count > self.config.max_devices {
            warn!(
                "DRT claims {count} devices, limit is {}",
                self.config.max_devices
            );
            return Err(Error::DrtCorrupt);
        }
        Ok((header, header.body_words()))
    }

    /// Parse the DRT body and replace the cached table.
    pub fn load_drt(&mut self, header: DrtHeader, body: &[u32]) -> Result<&DeviceTable> {
        let table = DeviceTable::parse(header, body, self.config.dialect.selector_offset)
            .map_err(|e| match e {
                Error::Decoding => Error::DrtCorrupt,
                other => other,
            })?;
        info!("DRT loaded: {} devices", table.len());
        debug!("{table}");
        self.state = ConnectionState::DrtLoaded;
        let table = self.devices.insert(table);
        Ok(&*table)
    }

    /// Resolve a device index and device-relative address.
    pub fn target(&self, index: u32, address: u32) -> Result<Target> {
        let device = self.device(index)?;
        if device.is_memory_device() {
            let address = device
                .address_offset
                .checked_add(address)
                .ok_or(Error::Encoding)?;
            Ok(Target {
                bus: Bus::Memory,
                selector: crate::frame::MEMORY_SELECTOR,
                address,
            })
        } else {
            Ok(Target {
                bus: Bus::Peripheral,
                selector: self.config.dialect.selector(index)?,
                address,
            })
        }
    }

    pub fn set_interrupts(&mut self, mask: u32) {
        trace!("Interrupts {:#010X} -> {mask:#010X}", self.interrupts);
        self.interrupts = mask;
    }

    pub fn interrupts(&self) -> u32 {
        self.interrupts
    }

    pub fn is_interrupt_pending_for(&self, index: u32) -> bool {
        self.interrupts & self.config.dialect.interrupt_bit(index) != 0
    }
}

// Helper functions

pub(crate) const DRT_HEADER_LEN: u32 = DRT_HEADER_WORDS as u32;

/// Bytes expected after the sentinel for a read of `words` words
pub(crate) fn read_response_len(words: u32) -> usize {
    RESPONSE_STATUS_LEN + words as usize * 4
}

/// Word count from the 4-byte core dump preamble
pub(crate) fn core_dump_count(preamble: &[u8]) -> Result<usize> {
    crate::frame::check_len(preamble, 4)?;
    let count = crate::frame::be24(&preamble[1..4]) as usize;
    if count > crate::core_dump::CORE_DUMP_MAX_WORDS {
        warn!("Core dump claims {count} words");
        return Err(Error::Decoding);
    }
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dialect_selectors() {
        let d = Dialect::dionysus();
        assert_eq!(d.selector(0), Ok(0));
        assert_eq!(d.selector(255), Ok(255));
        assert_eq!(d.selector(256), Err(Error::Encoding));

        let l = Dialect::legacy();
        assert_eq!(l.selector(0), Ok(1));
        assert_eq!(l.selector(255), Err(Error::Encoding));
    }

    #[test]
    fn interrupt_bits_follow_selector() {
        assert_eq!(Dialect::dionysus().interrupt_bit(3), 1 << 3);
        assert_eq!(Dialect::legacy().interrupt_bit(3), 1 << 4);
        assert_eq!(Dialect::dionysus().interrupt_bit(40), 0);
    }

    #[test]
    fn interrupt_mask_position() {
        let rsp = [0x00, 0x00, 0x00, 0x02, 0x80, 0x00, 0x00, 0x01];
        assert_eq!(Dialect::dionysus().interrupt_mask(&rsp), Ok(0x8000_0001));
        assert_eq!(Dialect::legacy().interrupt_mask(&rsp), Ok(0x0000_0002));
    }

    #[test]
    fn state_gates_device_access() {
        let mut state = ClientState::new(BusClientConfig::default());
        assert_eq!(state.check_connected(), Err(Error::InvalidOperation));
        state.connected();
        assert!(state.check_connected().is_ok());
        assert_eq!(state.devices().err(), Some(Error::InvalidOperation));
    }

    #[test]
    fn oversized_drt_is_corrupt() {
        let state = ClientState::new(BusClientConfig::default());
        let header = [0, 256, 0, 0, 0, 0, 0, 0];
        assert_eq!(state.drt_body_words(&header).err(), Some(Error::DrtCorrupt));
        let header = [0, 3, 0, 0, 0, 0, 0, 0];
        assert_eq!(state.drt_body_words(&header).map(|(_, n)| n), Ok(24));
    }

    #[test]
    fn core_dump_preamble() {
        assert_eq!(core_dump_count(&[0, 0, 0, 14]), Ok(14));
        assert_eq!(core_dump_count(&[0, 0x01, 0, 0]), Err(Error::Decoding));
        assert!(matches!(
            core_dump_count(&[0, 0]),
            Err(Error::TruncatedResponse { .. })
        ));
    }
}
