//! Simulated Olympus image.
//!
//! [`SimulatedBoard`] is a [`Transport`] that decodes request frames as the
//! image's Wishbone master would, and queues the response bytes for the
//! client to read back.  It serves a DRT built from the devices it is given,
//! backs peripheral registers and the memory bus with sparse word maps, and
//! can inject the faults a real link produces: leading noise, silence and
//! truncated responses.
//!
//! Available to the crate's own tests, and to applications with the `sim`
//! feature.
//!
//! ```rust,ignore
//! use olympus_bus::client::{BusClient, BusClientConfig};
//! use olympus_bus::drt::DeviceType;
//! use olympus_bus::sim::SimulatedBoard;
//!
//! let board = SimulatedBoard::new()
//!     .with_device(DeviceType::Drt, 0, 0, 3)
//!     .with_device(DeviceType::Gpio, 0, 0x0100_0000, 5);
//! let mut client = BusClient::new(board, BusClientConfig::default());
//! client.connect()?;
//! client.read_drt()?;
//! ```

// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

use std::collections::{HashMap, VecDeque};

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use crate::client::{DRT_SELECTOR, Dialect};
use crate::drt::{DRT_HEADER_WORDS, DeviceDescriptor, DeviceType};
use crate::frame::{
    Bus, Command, ID_BYTE, RESPONSE_SENTINEL, RESPONSE_STATUS_LEN, RequestHeader, encode_words,
};
use crate::io::Transport;

/// DRT header word 0 served by the simulation
pub const SIM_DRT_VERSION: u32 = 0x0001_0000;

/// Errors from the simulated transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimError {
    /// Written to before being opened
    NotOpen,
    /// Open failure requested with [`SimulatedBoard::set_fail_open()`]
    OpenFailed,
}

/// In-process Olympus image speaking the wire protocol.
#[derive(Debug)]
pub struct SimulatedBoard {
    dialect: Dialect,
    devices: Vec<DeviceDescriptor>,
    drt_device_count: Option<u32>,
    registers: HashMap<(u8, u32), u32>,
    memory: HashMap<u32, u32>,
    core_dump: Vec<u32>,

    // Bytes waiting for the host
    outbound: VecDeque<u8>,
    noise: Vec<u8>,
    silent: bool,
    // (complete responses to send first, bytes of the one after)
    truncate: Option<(usize, usize)>,
    fail_open: bool,
    open: bool,
    read_step: usize,

    requests: Vec<RequestHeader>,
    resets: usize,
}

impl Default for SimulatedBoard {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedBoard {
    /// A board using the Dionysus dialect, with an empty DRT.
    pub fn new() -> Self {
        Self {
            dialect: Dialect::dionysus(),
            devices: Vec::new(),
            drt_device_count: None,
            registers: HashMap::new(),
            memory: HashMap::new(),
            core_dump: Vec::new(),
            outbound: VecDeque::new(),
            noise: Vec::new(),
            silent: false,
            truncate: None,
            fail_open: false,
            open: false,
            read_step: usize::MAX,
            requests: Vec::new(),
            resets: 0,
        }
    }

    pub fn with_dialect(mut self, dialect: Dialect) -> Self {
        self.dialect = dialect;
        self
    }

    /// Append a DRT record.
    pub fn with_device(
        mut self,
        device_type: DeviceType,
        flags: u32,
        address_offset: u32,
        size_or_reg_count: u32,
    ) -> Self {
        self.add_device(device_type, flags, address_offset, size_or_reg_count);
        self
    }

    /// Append a DRT record, returning its index.
    pub fn add_device(
        &mut self,
        device_type: DeviceType,
        flags: u32,
        address_offset: u32,
        size_or_reg_count: u32,
    ) -> u32 {
        let index = self.devices.len() as u32;
        self.devices.push(DeviceDescriptor {
            device_id: device_type.into(),
            index,
            flags,
            address_offset,
            size_or_reg_count,
        });
        index
    }

    /// Serve `count` as the DRT device count instead of the real one.
    pub fn set_drt_device_count(&mut self, count: u32) {
        self.drt_device_count = Some(count);
    }

    /// Set a peripheral register, by selector and register number.
    pub fn set_register(&mut self, selector: u8, address: u32, value: u32) {
        self.registers.insert((selector, address), value);
    }

    pub fn register(&self, selector: u8, address: u32) -> Option<u32> {
        self.registers.get(&(selector, address)).copied()
    }

    /// Fill memory bus words starting at `address`.
    pub fn set_memory(&mut self, address: u32, words: &[u32]) {
        for (ii, word) in words.iter().enumerate() {
            self.memory.insert(address + ii as u32, *word);
        }
    }

    /// Memory bus word at `address`.  Unwritten memory reads as 0.
    pub fn memory(&self, address: u32) -> u32 {
        self.memory.get(&address).copied().unwrap_or(0)
    }

    /// Words returned by the next core dump request.
    pub fn set_core_dump(&mut self, words: &[u32]) {
        self.core_dump = words.to_vec();
    }

    /// Push an interrupt frame carrying `mask` to the host.
    pub fn raise_interrupts(&mut self, mask: u32) {
        let mut status = [0u8; RESPONSE_STATUS_LEN];
        let offset = self.dialect.interrupt_mask_offset;
        match status.get_mut(offset..offset.saturating_add(4)) {
            Some(bytes) => bytes.copy_from_slice(&mask.to_be_bytes()),
            None => {
                warn!("Sim: interrupt mask offset {offset} outside status block");
                return;
            }
        }
        debug!("Sim: raising interrupts {mask:#010X}");
        self.respond(&status);
    }

    /// Bytes to send ahead of the next response.
    pub fn inject_noise(&mut self, bytes: &[u8]) {
        self.noise.extend_from_slice(bytes);
    }

    /// Stop (or resume) responding to requests.
    pub fn set_silent(&mut self, silent: bool) {
        self.silent = silent;
    }

    /// Send only the first `len` bytes of the next response, counting the
    /// sentinel.
    pub fn truncate_next_response(&mut self, len: usize) {
        self.truncate_response(0, len);
    }

    /// Send `skip` responses in full, then only the first `len` bytes of the
    /// one after.
    pub fn truncate_response(&mut self, skip: usize, len: usize) {
        self.truncate = Some((skip, len));
    }

    /// Queue bytes for the host verbatim.
    pub fn queue_raw(&mut self, bytes: &[u8]) {
        self.outbound.extend(bytes);
    }

    pub fn set_fail_open(&mut self, fail: bool) {
        self.fail_open = fail;
    }

    /// Most bytes returned by a single read.
    pub fn set_read_step(&mut self, step: usize) {
        self.read_step = step.max(1);
    }

    /// Read and write requests received, oldest first
    pub fn requests(&self) -> &[RequestHeader] {
        &self.requests
    }

    pub fn reset_count(&self) -> usize {
        self.resets
    }

    pub fn is_open(&self) -> bool {
        self.open
    }
}

// Request handling
impl SimulatedBoard {
    fn handle_frame(&mut self, data: &[u8]) {
        if data.len() < 2 || data[0] != ID_BYTE {
            warn!("Sim: dropping frame without ID byte: {data:02X?}");
            return;
        }
        let command = match Command::try_from(data[1]) {
            Ok(command) => command,
            Err(_) => {
                warn!("Sim: unknown command {:#04X}", data[1]);
                return;
            }
        };

        match command {
            Command::Ping => self.respond(&[0u8; RESPONSE_STATUS_LEN]),
            Command::Reset => {
                debug!("Sim: reset");
                self.resets += 1;
                self.outbound.clear();
            }
            Command::CoreDump => {
                let len = (self.core_dump.len() as u32).to_be_bytes();
                let mut rsp = vec![0, len[1], len[2], len[3]];
                rsp.extend(encode_words(&self.core_dump));
                self.respond(&rsp);
            }
            _ => self.handle_transaction(data),
        }
    }

    fn handle_transaction(&mut self, data: &[u8]) {
        let header = match RequestHeader::from_bytes(data) {
            Ok(header) => header,
            Err(_) => {
                warn!("Sim: malformed request {data:02X?}");
                return;
            }
        };
        trace!("Sim: {header:?}");
        self.requests.push(header);

        let bus = match header.command {
            Command::MemoryRead | Command::MemoryWrite => Bus::Memory,
            _ => Bus::Peripheral,
        };
        let mut rsp = data[1..1 + RESPONSE_STATUS_LEN].to_vec();

        match header.command {
            Command::PeripheralRead | Command::MemoryRead => {
                let words: Vec<u32> = (0..header.length)
                    .map(|ii| self.load(bus, header.selector, header.address + ii))
                    .collect();
                rsp.extend(encode_words(&words));
            }
            _ => {
                let payload = &data[9..];
                if payload.len() != header.payload_len() {
                    warn!(
                        "Sim: write payload {} bytes, header says {}",
                        payload.len(),
                        header.payload_len()
                    );
                    return;
                }
                for (ii, word) in payload.chunks_exact(4).enumerate() {
                    let value = u32::from_be_bytes([word[0], word[1], word[2], word[3]]);
                    self.store(bus, header.selector, header.address + ii as u32, value);
                }
            }
        }

        self.respond(&rsp);
    }

    fn load(&self, bus: Bus, selector: u8, address: u32) -> u32 {
        match bus {
            Bus::Memory => self.memory(address),
            Bus::Peripheral if selector == DRT_SELECTOR => self.drt_word(address),
            Bus::Peripheral => self.register(selector, address).unwrap_or(0),
        }
    }

    fn store(&mut self, bus: Bus, selector: u8, address: u32, value: u32) {
        match bus {
            Bus::Memory => {
                self.memory.insert(address, value);
            }
            Bus::Peripheral if selector == DRT_SELECTOR => {
                debug!("Sim: ignoring write to DRT address {address:#X}");
            }
            Bus::Peripheral => self.set_register(selector, address, value),
        }
    }

    fn drt_word(&self, address: u32) -> u32 {
        let address = address as usize;
        match address {
            0 => SIM_DRT_VERSION,
            1 => self
                .drt_device_count
                .unwrap_or(self.devices.len() as u32),
            a if a < DRT_HEADER_WORDS => 0,
            a => {
                let offset = a - DRT_HEADER_WORDS;
                self.devices
                    .get(offset / 8)
                    .map(|d| d.to_words()[offset % 8])
                    .unwrap_or(0)
            }
        }
    }

    fn respond(&mut self, body: &[u8]) {
        if self.silent {
            trace!("Sim: silent, dropping response");
            return;
        }
        let mut frame = Vec::with_capacity(1 + body.len());
        frame.push(RESPONSE_SENTINEL);
        frame.extend_from_slice(body);
        match self.truncate.take() {
            Some((0, len)) => frame.truncate(len),
            Some((skip, len)) => self.truncate = Some((skip - 1, len)),
            None => {}
        }
        self.outbound.extend(self.noise.drain(..));
        self.outbound.extend(frame);
    }
}

impl Transport for SimulatedBoard {
    type Error = SimError;

    fn open(&mut self) -> Result<(), SimError> {
        if self.fail_open {
            return Err(SimError::OpenFailed);
        }
        self.open = true;
        Ok(())
    }

    fn close(&mut self) {
        self.open = false;
    }

    fn write(&mut self, data: &[u8]) -> Result<(), SimError> {
        if !self.open {
            return Err(SimError::NotOpen);
        }
        self.handle_frame(data);
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, SimError> {
        let n = buf.len().min(self.read_step).min(self.outbound.len());
        for (dst, src) in buf.iter_mut().zip(self.outbound.drain(..n)) {
            *dst = src;
        }
        Ok(n)
    }

    fn purge(&mut self) -> Result<(), SimError> {
        self.outbound.clear();
        Ok(())
    }
}

#[cfg(feature = "async")]
#[async_trait::async_trait(?Send)]
impl crate::io::AsyncTransport for SimulatedBoard {
    type Error = SimError;

    async fn open(&mut self) -> Result<(), SimError> {
        Transport::open(self)
    }

    async fn close(&mut self) {
        Transport::close(self)
    }

    async fn write(&mut self, data: &[u8]) -> Result<(), SimError> {
        Transport::write(self, data)
    }

    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, SimError> {
        Transport::read(self, buf)
    }

    async fn purge(&mut self) -> Result<(), SimError> {
        Transport::purge(self)
    }
}

/// [`crate::frame::AsyncDelay`] that yields once to the executor.
#[cfg(feature = "async")]
pub struct SimDelay;

#[cfg(feature = "async")]
impl crate::frame::AsyncDelay for SimDelay {
    async fn delay() {
        YieldNow(false).await
    }
}

#[cfg(feature = "async")]
struct YieldNow(bool);

#[cfg(feature = "async")]
impl Future for YieldNow {
    type Output = ();

    fn poll(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<()> {
        if self.0 {
            std::task::Poll::Ready(())
        } else {
            self.0 = true;
            cx.waker().wake_by_ref();
            std::task::Poll::Pending
        }
    }
}
