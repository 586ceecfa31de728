//! Device ROM Table (DRT) parsing.
//!
//! The DRT sits at address 0 of the peripheral bus, selector 0.  It is read
//! as 32-bit words:
//!
//! ```text
//! header   words 0-7    word 1 (bytes 4-7) = device count
//! record   8 words      per device, immediately after the header
//!   word 0  device id
//!   word 1  flags (bit 16 = device is on the memory bus)
//!   word 2  address offset
//!   word 3  size (words) or register count
//!   words 4-7 reserved
//! ```
//!
//! Reading is done in two phases by the client: the header, to learn the
//! device count, then the records.

// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

use core::fmt;

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use crate::{Error, Result};

/// Header length in words
pub const DRT_HEADER_WORDS: usize = 8;

/// Record length in words
pub const DRT_RECORD_WORDS: usize = 8;

/// Word offset of the device count within the header
pub const DEVICE_COUNT_WORD: usize = 1;

/// Flag bit marking a memory bus device
pub const FLAG_MEMORY_DEVICE: u32 = 0x0001_0000;

/// Peripheral type identifiers found in DRT records
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceType {
    Drt,
    Gpio,
    Uart,
    I2c,
    Spi,
    Memory,
    Console,
    I2s,
    LogicAnalyzer,
    Gtp,
    Unknown(u32),
}

impl From<u32> for DeviceType {
    fn from(value: u32) -> Self {
        match value {
            0x00 => DeviceType::Drt,
            0x01 => DeviceType::Gpio,
            0x02 => DeviceType::Uart,
            0x03 => DeviceType::I2c,
            0x04 => DeviceType::Spi,
            0x05 => DeviceType::Memory,
            0x06 => DeviceType::Console,
            0x0B => DeviceType::I2s,
            0x0C => DeviceType::LogicAnalyzer,
            0x0E => DeviceType::Gtp,
            other => DeviceType::Unknown(other),
        }
    }
}

impl From<DeviceType> for u32 {
    fn from(value: DeviceType) -> Self {
        match value {
            DeviceType::Drt => 0x00,
            DeviceType::Gpio => 0x01,
            DeviceType::Uart => 0x02,
            DeviceType::I2c => 0x03,
            DeviceType::Spi => 0x04,
            DeviceType::Memory => 0x05,
            DeviceType::Console => 0x06,
            DeviceType::I2s => 0x0B,
            DeviceType::LogicAnalyzer => 0x0C,
            DeviceType::Gtp => 0x0E,
            DeviceType::Unknown(other) => other,
        }
    }
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceType::Drt => write!(f, "DRT"),
            DeviceType::Gpio => write!(f, "GPIO"),
            DeviceType::Uart => write!(f, "UART"),
            DeviceType::I2c => write!(f, "I2C"),
            DeviceType::Spi => write!(f, "SPI"),
            DeviceType::Memory => write!(f, "Memory"),
            DeviceType::Console => write!(f, "Console"),
            DeviceType::I2s => write!(f, "I2S"),
            DeviceType::LogicAnalyzer => write!(f, "Logic Analyzer"),
            DeviceType::Gtp => write!(f, "GTP"),
            DeviceType::Unknown(id) => write!(f, "Unknown ({id:#06X})"),
        }
    }
}

/// DRT header words
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrtHeader {
    pub words: [u32; DRT_HEADER_WORDS],
}

impl DrtHeader {
    /// Parse the header from its 8 words.
    pub fn parse(words: &[u32]) -> Result<Self> {
        let words: [u32; DRT_HEADER_WORDS] = words
            .get(..DRT_HEADER_WORDS)
            .and_then(|w| w.try_into().ok())
            .ok_or(Error::Decoding)?;
        Ok(Self { words })
    }

    pub fn device_count(&self) -> u32 {
        self.words[DEVICE_COUNT_WORD]
    }

    /// Words of record data that follow the header
    pub fn body_words(&self) -> usize {
        self.device_count() as usize * DRT_RECORD_WORDS
    }
}

/// One device entry from the DRT
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceDescriptor {
    /// Peripheral type identifier, see [`DeviceType`]
    pub device_id: u32,
    /// Position within the DRT
    pub index: u32,
    pub flags: u32,
    /// Base address of the device's register or memory window
    pub address_offset: u32,
    /// Size in words for memory devices, register count otherwise
    pub size_or_reg_count: u32,
}

impl DeviceDescriptor {
    /// Parse an 8-word record.  Reserved words are ignored.
    pub fn parse(index: u32, record: &[u32]) -> Result<Self> {
        if record.len() < DRT_RECORD_WORDS {
            return Err(Error::Decoding);
        }
        Ok(Self {
            device_id: record[0],
            index,
            flags: record[1],
            address_offset: record[2],
            size_or_reg_count: record[3],
        })
    }

    pub fn device_type(&self) -> DeviceType {
        DeviceType::from(self.device_id)
    }

    pub fn is_memory_device(&self) -> bool {
        self.flags & FLAG_MEMORY_DEVICE != 0
    }

    /// The record words for this device, reserved words zeroed.
    pub fn to_words(&self) -> [u32; DRT_RECORD_WORDS] {
        [
            self.device_id,
            self.flags,
            self.address_offset,
            self.size_or_reg_count,
            0,
            0,
            0,
            0,
        ]
    }
}

impl fmt::Display for DeviceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:>3}  {:<16} {:<10} addr {:#010X}  size {:#010X}  flags {:#010X}",
            self.index,
            self.device_type().to_string(),
            if self.is_memory_device() {
                "memory"
            } else {
                "peripheral"
            },
            self.address_offset,
            self.size_or_reg_count,
            self.flags,
        )
    }
}

/// Parsed Device ROM Table.
///
/// Rebuilt on every DRT read, immutable afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceTable {
    header: DrtHeader,
    devices: Vec<DeviceDescriptor>,
}

impl DeviceTable {
    /// Build a table from the header and the record words that followed it.
    ///
    /// `selector_offset` is the board's mapping from DRT index to peripheral
    /// selector (see [`crate::client::Dialect`]).  A peripheral record that
    /// maps to selector 0 collides with the DRT itself, and must be the DRT.
    pub fn parse(header: DrtHeader, body: &[u32], selector_offset: u8) -> Result<Self> {
        let count = header.device_count() as usize;
        if body.len() < count * DRT_RECORD_WORDS {
            return Err(Error::Decoding);
        }

        let devices = body
            .chunks_exact(DRT_RECORD_WORDS)
            .take(count)
            .enumerate()
            .map(|(index, record)| DeviceDescriptor::parse(index as u32, record))
            .collect::<Result<Vec<_>>>()?;

        if selector_offset == 0 {
            if let Some(first) = devices.first() {
                if !first.is_memory_device() && first.device_type() != DeviceType::Drt {
                    warn!(
                        "DRT record 0 is {}, but selector 0 is reserved for the DRT",
                        first.device_type()
                    );
                    return Err(Error::DrtCorrupt);
                }
            }
        }

        Ok(Self { header, devices })
    }

    pub fn header(&self) -> &DrtHeader {
        &self.header
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Device at `index`, or [`Error::IndexOutOfRange`].
    pub fn get(&self, index: u32) -> Result<&DeviceDescriptor> {
        self.devices
            .get(index as usize)
            .ok_or(Error::IndexOutOfRange)
    }

    /// First device of the given type
    pub fn find(&self, device_type: DeviceType) -> Option<&DeviceDescriptor> {
        self.iter().find(|d| d.device_type() == device_type)
    }

    /// All devices of the given type
    pub fn find_all(&self, device_type: DeviceType) -> impl Iterator<Item = &DeviceDescriptor> {
        self.iter().filter(move |d| d.device_type() == device_type)
    }

    pub fn iter(&self) -> impl Iterator<Item = &DeviceDescriptor> {
        self.devices.iter()
    }

    /// Total size of the memory bus devices that form a contiguous region
    /// starting at address 0.
    pub fn total_memory_size(&self) -> u32 {
        let mut memories: Vec<_> = self.iter().filter(|d| d.is_memory_device()).collect();
        memories.sort_by_key(|d| d.address_offset);

        let mut total = 0u32;
        for device in memories {
            if device.address_offset != total {
                break;
            }
            total = total.saturating_add(device.size_or_reg_count);
        }
        total
    }
}

impl fmt::Display for DeviceTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "DRT: {} devices", self.len())?;
        for device in self.iter() {
            writeln!(f, "{device}")?;
        }
        Ok(())
    }
}
