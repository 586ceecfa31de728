//! Framing for Olympus register bus transactions.
//!
//! Pure encode/decode functions, no I/O.  The response side of the protocol
//! is handled by [`sync::Synchronizer`] (and its async twin), which returns
//! the bytes following the response sentinel; the functions here turn those
//! bytes into words.

// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

#[cfg(feature = "async")]
pub mod futures;
pub mod sync;

#[cfg(feature = "async")]
pub use futures::{AsyncDelay, AsyncSynchronizer};
pub use sync::Synchronizer;

use crate::{Error, Result};

/// First byte of every request
pub const ID_BYTE: u8 = 0xCD;

/// First byte of every response.  Anything before it is noise.
pub const RESPONSE_SENTINEL: u8 = 0xDC;

/// Size of the request header, including the ID byte
pub const REQUEST_HEADER_LEN: usize = 9;

/// Size of the status block following the response sentinel
pub const RESPONSE_STATUS_LEN: usize = 8;

/// Largest value of a 3-byte length or address field
pub const MAX_FIELD: u32 = 0x00FF_FFFF;

/// Selector byte used for all memory bus transactions
pub const MEMORY_SELECTOR: u8 = 0x00;

/// Request command codes
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Ping = 0x00,
    PeripheralWrite = 0x01,
    PeripheralRead = 0x02,
    Reset = 0x03,
    CoreDump = 0x0F,
    MemoryWrite = 0x11,
    MemoryRead = 0x12,
}

impl Command {
    /// Read command for the given bus
    pub fn read(bus: Bus) -> Self {
        match bus {
            Bus::Peripheral => Command::PeripheralRead,
            Bus::Memory => Command::MemoryRead,
        }
    }

    /// Write command for the given bus
    pub fn write(bus: Bus) -> Self {
        match bus {
            Bus::Peripheral => Command::PeripheralWrite,
            Bus::Memory => Command::MemoryWrite,
        }
    }
}

impl TryFrom<u8> for Command {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0x00 => Ok(Command::Ping),
            0x01 => Ok(Command::PeripheralWrite),
            0x02 => Ok(Command::PeripheralRead),
            0x03 => Ok(Command::Reset),
            0x0F => Ok(Command::CoreDump),
            0x11 => Ok(Command::MemoryWrite),
            0x12 => Ok(Command::MemoryRead),
            _ => Err(Error::Decoding),
        }
    }
}

/// Which of the image's two Wishbone buses a transaction targets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bus {
    Peripheral,
    Memory,
}

impl Bus {
    pub fn from_memory_flag(is_memory_device: bool) -> Self {
        if is_memory_device {
            Bus::Memory
        } else {
            Bus::Peripheral
        }
    }
}

/// Header of a read or write request, bytes 0-8 on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestHeader {
    pub command: Command,
    /// Transfer length in 32-bit words
    pub length: u32,
    /// Device selector, [`MEMORY_SELECTOR`] on the memory bus
    pub selector: u8,
    pub address: u32,
}

impl RequestHeader {
    /// Build a read or write header, applying the memory bus selector rule.
    pub fn new(command: Command, bus: Bus, selector: u8, address: u32, length: u32) -> Self {
        let selector = match bus {
            Bus::Memory => MEMORY_SELECTOR,
            Bus::Peripheral => selector,
        };
        Self {
            command,
            length,
            selector,
            address,
        }
    }

    /// Serialize into the 9-byte wire layout.
    pub fn to_bytes(&self) -> Result<[u8; REQUEST_HEADER_LEN]> {
        check_field(self.length)?;
        check_field(self.address)?;

        let len = self.length.to_be_bytes();
        let addr = self.address.to_be_bytes();
        Ok([
            ID_BYTE,
            self.command as u8,
            len[1],
            len[2],
            len[3],
            self.selector,
            addr[1],
            addr[2],
            addr[3],
        ])
    }

    /// Parse a 9-byte wire header.  Used by simulated targets.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < REQUEST_HEADER_LEN || bytes[0] != ID_BYTE {
            return Err(Error::Decoding);
        }
        Ok(Self {
            command: Command::try_from(bytes[1])?,
            length: be24(&bytes[2..5]),
            selector: bytes[5],
            address: be24(&bytes[6..9]),
        })
    }

    /// Payload bytes that follow this header on the wire
    pub fn payload_len(&self) -> usize {
        match self.command {
            Command::PeripheralWrite | Command::MemoryWrite => self.length as usize * 4,
            _ => 0,
        }
    }
}

/// The 8 status bytes that follow the response sentinel.
///
/// Subfields are command specific; interrupt frames carry the interrupt
/// bitmask at a board dependent offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseStatus(pub [u8; RESPONSE_STATUS_LEN]);

impl ResponseStatus {
    /// Take the status block from the start of a synchronized response.
    pub fn from_response(rsp: &[u8]) -> Result<Self> {
        check_len(rsp, RESPONSE_STATUS_LEN)?;
        let mut status = [0u8; RESPONSE_STATUS_LEN];
        status.copy_from_slice(&rsp[..RESPONSE_STATUS_LEN]);
        Ok(Self(status))
    }

    /// Big-endian word starting at `offset` within the status block.
    pub fn word_at(&self, offset: usize) -> Result<u32> {
        let bytes = self.0.get(offset..offset + 4).ok_or(Error::Decoding)?;
        Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }
}

/// Encode a read request.
///
/// `selector` is ignored (sent as `0x00`) for memory bus reads.
pub fn encode_read(
    selector: u8,
    is_memory_device: bool,
    address: u32,
    length_words: u32,
) -> Result<Vec<u8>> {
    let bus = Bus::from_memory_flag(is_memory_device);
    let header = RequestHeader::new(Command::read(bus), bus, selector, address, length_words);
    Ok(header.to_bytes()?.to_vec())
}

/// Encode a write request carrying `payload` verbatim.
///
/// `payload` must be a whole number of 32-bit words.
pub fn encode_write(
    selector: u8,
    is_memory_device: bool,
    address: u32,
    payload: &[u8],
) -> Result<Vec<u8>> {
    if payload.len() % 4 != 0 {
        return Err(Error::Encoding);
    }
    let length_words = u32::try_from(payload.len() / 4).map_err(|_| Error::Encoding)?;

    let bus = Bus::from_memory_flag(is_memory_device);
    let header = RequestHeader::new(Command::write(bus), bus, selector, address, length_words);

    let mut frame = Vec::with_capacity(REQUEST_HEADER_LEN + payload.len());
    frame.extend_from_slice(&header.to_bytes()?);
    frame.extend_from_slice(payload);
    Ok(frame)
}

/// Encode a ping request.
pub fn encode_ping() -> [u8; 9] {
    [ID_BYTE, Command::Ping as u8, 0, 0, 0, 0, 0, 0, 0]
}

/// Encode a reset request.  The master sends no response.
pub fn encode_reset() -> [u8; 6] {
    [ID_BYTE, Command::Reset as u8, 0, 0, 0, 0]
}

/// Encode a core dump request.
pub fn encode_core_dump_request() -> [u8; 13] {
    let mut frame = [0u8; 13];
    frame[0] = ID_BYTE;
    frame[1] = Command::CoreDump as u8;
    frame
}

/// Decode a read payload into big-endian words.
pub fn decode_read_response(payload: &[u8]) -> Result<Vec<u32>> {
    if payload.len() % 4 != 0 {
        return Err(Error::Decoding);
    }
    Ok(payload
        .chunks_exact(4)
        .map(|w| u32::from_be_bytes([w[0], w[1], w[2], w[3]]))
        .collect())
}

/// Encode words as a big-endian write payload.
pub fn encode_words(words: &[u32]) -> Vec<u8> {
    words.iter().flat_map(|w| w.to_be_bytes()).collect()
}

// Helper functions

pub(crate) fn be24(bytes: &[u8]) -> u32 {
    (bytes[0] as u32) << 16 | (bytes[1] as u32) << 8 | bytes[2] as u32
}

fn check_field(value: u32) -> Result<()> {
    if value > MAX_FIELD {
        Err(Error::Encoding)
    } else {
        Ok(())
    }
}

/// Fail with [`Error::TruncatedResponse`] unless `rsp` holds `expected` bytes.
pub(crate) fn check_len(rsp: &[u8], expected: usize) -> Result<()> {
    if rsp.len() < expected {
        Err(Error::TruncatedResponse {
            expected,
            received: rsp.len(),
        })
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_frame_layout() {
        let frame = encode_read(3, false, 0x01_0203, 0x00_0010).unwrap();
        assert_eq!(
            frame,
            [0xCD, 0x02, 0x00, 0x00, 0x10, 0x03, 0x01, 0x02, 0x03]
        );
    }

    #[test]
    fn memory_read_forces_zero_selector() {
        let frame = encode_read(7, true, 0x100, 2).unwrap();
        assert_eq!(frame[1], 0x12);
        assert_eq!(frame[5], MEMORY_SELECTOR);
        assert_eq!(&frame[6..9], &[0x00, 0x01, 0x00]);
    }

    #[test]
    fn read_rejects_wide_fields() {
        assert_eq!(encode_read(1, false, 0x0100_0000, 1), Err(Error::Encoding));
        assert_eq!(encode_read(1, false, 0, 0x0100_0000), Err(Error::Encoding));
        assert!(encode_read(1, false, MAX_FIELD, MAX_FIELD).is_ok());
    }

    #[test]
    fn write_frame_appends_payload() {
        let payload = [0xAA, 0xBB, 0xCC, 0xDD, 0x55, 0x66, 0x77, 0x88];
        let frame = encode_write(2, false, 4, &payload).unwrap();
        assert_eq!(&frame[..9], &[0xCD, 0x01, 0x00, 0x00, 0x02, 0x02, 0x00, 0x00, 0x04]);
        assert_eq!(&frame[9..], &payload);

        let frame = encode_write(2, true, 4, &payload).unwrap();
        assert_eq!(frame[1], 0x11);
        assert_eq!(frame[5], 0x00);
    }

    #[test]
    fn write_rejects_partial_words() {
        for len in [1usize, 2, 3, 5, 7, 13] {
            let payload = vec![0u8; len];
            assert_eq!(encode_write(1, false, 0, &payload), Err(Error::Encoding));
        }
    }

    #[test]
    fn fixed_frames() {
        assert_eq!(encode_ping(), [0xCD, 0x00, 0, 0, 0, 0, 0, 0, 0]);
        assert_eq!(encode_reset(), [0xCD, 0x03, 0, 0, 0, 0]);
        let dump = encode_core_dump_request();
        assert_eq!(dump.len(), 13);
        assert_eq!(&dump[..2], &[0xCD, 0x0F]);
        assert!(dump[2..].iter().all(|b| *b == 0));
    }

    #[test]
    fn decode_words_big_endian() {
        let words = decode_read_response(&[0x12, 0x34, 0x56, 0x78, 0, 0, 0, 1]).unwrap();
        assert_eq!(words, vec![0x1234_5678, 1]);
        assert_eq!(decode_read_response(&[1, 2, 3]), Err(Error::Decoding));
        assert_eq!(decode_read_response(&[]), Ok(vec![]));
    }

    #[test]
    fn header_parses_what_it_encodes() {
        let header = RequestHeader::new(Command::MemoryWrite, Bus::Memory, 9, 0xABCDEF, 3);
        let bytes = header.to_bytes().unwrap();
        let parsed = RequestHeader::from_bytes(&bytes).unwrap();
        assert_eq!(parsed.selector, MEMORY_SELECTOR);
        assert_eq!(parsed.address, 0xABCDEF);
        assert_eq!(parsed.payload_len(), 12);
        assert_eq!(
            RequestHeader::from_bytes(&[0xCC, 0, 0, 0, 0, 0, 0, 0, 0]),
            Err(Error::Decoding)
        );
    }

    #[test]
    fn status_word_extraction() {
        let status = ResponseStatus::from_response(&[0, 0, 0, 0, 0x80, 0, 0, 0x02, 0xFF]).unwrap();
        assert_eq!(status.word_at(4), Ok(0x8000_0002));
        assert_eq!(status.word_at(0), Ok(0));
        assert_eq!(status.word_at(5), Err(Error::Decoding));
        assert_eq!(
            ResponseStatus::from_response(&[0; 3]),
            Err(Error::TruncatedResponse {
                expected: 8,
                received: 3
            })
        );
    }
}
