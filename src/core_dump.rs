//! Decoding of the master's core dump.
//!
//! After a hang the Wishbone master latches its internal state.  A core
//! dump request returns that state as a block of words, which is decoded
//! here.  Resetting the image before dumping loses the data.

// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

use crate::{Error, Result};

/// Words the master currently reports
pub const CORE_DUMP_WORDS: usize = 14;

/// Largest dump accepted from the wire
pub const CORE_DUMP_MAX_WORDS: usize = 256;

/// State machine state of the master
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MasterState {
    Idle,
    Write,
    Read,
    CoreDump,
    Unknown(u32),
}

impl From<u32> for MasterState {
    fn from(value: u32) -> Self {
        match value {
            0 => MasterState::Idle,
            1 => MasterState::Write,
            2 => MasterState::Read,
            3 => MasterState::CoreDump,
            other => MasterState::Unknown(other),
        }
    }
}

/// Last command the master received
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InCommand {
    Ping,
    Write,
    Read,
    CommReset,
    MasterControl,
    CoreDump,
    Other(u16),
}

impl From<u16> for InCommand {
    fn from(value: u16) -> Self {
        match value {
            0 => InCommand::Ping,
            1 => InCommand::Write,
            2 => InCommand::Read,
            3 => InCommand::CommReset,
            4 => InCommand::MasterControl,
            15 => InCommand::CoreDump,
            other => InCommand::Other(other),
        }
    }
}

/// Snapshot of one Wishbone bus
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BusSnapshot {
    pub cyc: bool,
    pub stb: bool,
    pub we: bool,
    pub ack: bool,
    /// Interrupt line, peripheral bus only
    pub int: bool,
    pub addr: u32,
    /// Data from the slave
    pub data_in: u32,
    /// Data to the slave
    pub data_out: u32,
}

/// Decoded core dump
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoreDump {
    pub state: MasterState,
    pub mem_bus_selected: bool,
    pub master_ready: bool,
    pub in_ready: bool,
    pub out_en: bool,
    pub out_ready: bool,
    pub ih_ready: bool,
    pub periph_int: bool,
    pub nack_count: u32,
    pub in_command: InCommand,
    pub in_flags: u16,
    pub in_address: u32,
    pub internal_data_count: u32,
    pub peripheral_bus: BusSnapshot,
    pub memory_bus: BusSnapshot,
    /// Raw words as received, including any the master added beyond
    /// [`CORE_DUMP_WORDS`]
    pub raw: Vec<u32>,
}

impl CoreDump {
    /// Decode the dump words.
    pub fn from_words(words: &[u32]) -> Result<Self> {
        if words.len() < CORE_DUMP_WORDS {
            return Err(Error::Decoding);
        }
        let bit = |word: u32, mask: u32| word & mask != 0;
        let status = words[1];
        let wb = words[7];

        Ok(Self {
            state: MasterState::from(words[0]),
            mem_bus_selected: bit(status, 0x01),
            master_ready: bit(status, 0x02),
            in_ready: bit(status, 0x04),
            out_en: bit(status, 0x08),
            out_ready: bit(status, 0x10),
            ih_ready: bit(status, 0x20),
            periph_int: bit(words[2], 0x01),
            nack_count: words[3],
            in_command: InCommand::from((words[4] & 0xFFFF) as u16),
            in_flags: (words[4] >> 16) as u16,
            in_address: words[5],
            internal_data_count: words[6],
            peripheral_bus: BusSnapshot {
                cyc: bit(wb, 0x10_0000),
                stb: bit(wb, 0x08_0000),
                we: bit(wb, 0x04_0000),
                ack: bit(wb, 0x02_0000),
                int: bit(wb, 0x01_0000),
                addr: words[8],
                data_in: words[9],
                data_out: words[10],
            },
            memory_bus: BusSnapshot {
                cyc: bit(wb, 0x08),
                stb: bit(wb, 0x04),
                we: bit(wb, 0x02),
                ack: bit(wb, 0x01),
                int: false,
                addr: words[11],
                data_in: words[12],
                data_out: words[13],
            },
            raw: words.to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_stuck_read() {
        let words = [
            2,           // read
            0x0000_0013, // mem bus, master ready, out ready
            0x1,         // peripheral interrupt
            7,
            0x0003_0002, // flags 3, read
            0x0000_0040,
            12,
            0x0018_0009, // periph cyc+stb, mem cyc+ack
            0x0100_0004,
            0xAAAA_AAAA,
            0x5555_5555,
            0x0000_0100,
            0x1234_5678,
            0x8765_4321,
        ];
        let dump = CoreDump::from_words(&words).unwrap();
        assert_eq!(dump.state, MasterState::Read);
        assert!(dump.mem_bus_selected && dump.master_ready && dump.out_ready);
        assert!(!dump.in_ready && !dump.out_en && !dump.ih_ready);
        assert!(dump.periph_int);
        assert_eq!(dump.in_command, InCommand::Read);
        assert_eq!(dump.in_flags, 3);
        assert!(dump.peripheral_bus.cyc && dump.peripheral_bus.stb);
        assert!(!dump.peripheral_bus.we && !dump.peripheral_bus.ack);
        assert!(dump.memory_bus.cyc && dump.memory_bus.ack);
        assert_eq!(dump.memory_bus.data_out, 0x8765_4321);
    }

    #[test]
    fn short_dump_is_rejected() {
        assert_eq!(CoreDump::from_words(&[0; 13]), Err(Error::Decoding));
    }
}
