//! Blocking register bus client - typically used by host tools and drivers.

// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

use std::sync::{Arc, Mutex};
use std::time::Duration;

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use crate::client::{
    BusClientConfig, ClientState, ConnectionState, DRT_HEADER_LEN, DRT_SELECTOR, Target,
    core_dump_count, read_response_len,
};
use crate::core_dump::CoreDump;
use crate::drt::{DeviceDescriptor, DeviceTable, DeviceType};
use crate::frame::{
    Bus, RESPONSE_STATUS_LEN, Synchronizer, check_len, decode_read_response,
    encode_core_dump_request, encode_ping, encode_read, encode_reset, encode_words, encode_write,
};
use crate::io::Transport;
use crate::{Error, Result};

/// A [`BusClient`] shared between threads.
///
/// All transport access goes through the mutex, so a polling worker and
/// register accesses from another thread never interleave on the wire.
pub type SharedBusClient<T> = Arc<Mutex<BusClient<T>>>;

/// Register bus client for dual-bus Olympus images.
///
/// Owns its transport.  Requests are strictly one at a time: each call sends
/// a frame and, where the protocol has one, waits for its response before
/// returning.  Nothing is retried.
///
/// Example usage:
///
/// ```rust,ignore
/// use olympus_bus::client::{BusClient, BusClientConfig};
/// use olympus_bus::drt::DeviceType;
///
/// let mut client = BusClient::new(transport, BusClientConfig::default());
/// client.connect()?;
/// client.ping()?;
/// client.read_drt()?;
/// if let Some(gpio) = client.find_device(DeviceType::Gpio)? {
///     client.write_register(gpio.index, 0, 0xFFFF_FFFF)?;
/// }
/// ```
pub struct BusClient<T: Transport> {
    transport: T,
    state: ClientState,
}

impl<T: Transport> BusClient<T> {
    /// Create a new, disconnected, BusClient
    ///
    /// Arguments:
    /// - `transport`: Transport to the board, not yet opened
    /// - `config`: Timeouts and board dialect
    pub fn new(transport: T, config: BusClientConfig) -> Self {
        Self {
            transport,
            state: ClientState::new(config),
        }
    }

    /// Wrap this client for use from several threads.
    pub fn into_shared(self) -> SharedBusClient<T> {
        Arc::new(Mutex::new(self))
    }

    pub fn config(&self) -> &BusClientConfig {
        &self.state.config
    }

    /// Response timeout for subsequent transactions
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.state.config.timeout = timeout;
    }

    pub fn timeout(&self) -> Duration {
        self.state.config.timeout
    }

    pub fn state(&self) -> ConnectionState {
        self.state.state()
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Direct transport access.  Anything written here bypasses the client's
    /// framing.
    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Open the transport.
    ///
    /// Any cached device table and interrupt state is dropped.  On failure
    /// the client is left disconnected.
    pub fn connect(&mut self) -> Result<()> {
        if self.state() != ConnectionState::Disconnected {
            self.disconnect();
        }
        self.transport.open().map_err(|e| {
            warn!("Failed to open transport: {e:?}");
            Error::Connect
        })?;
        self.state.connected();
        Ok(())
    }

    /// Close the transport and drop cached state.
    pub fn disconnect(&mut self) {
        self.transport.close();
        self.state.disconnected();
    }

    /// Check the image is responding.
    ///
    /// Succeeds as soon as the response sentinel is seen.
    pub fn ping(&mut self) -> Result<()> {
        self.state.check_connected()?;
        debug!("Sending ping");
        self.send(&encode_ping())?;

        match self.synchronizer().receive(&mut self.transport, RESPONSE_STATUS_LEN) {
            Ok(status) => {
                if status.len() < RESPONSE_STATUS_LEN {
                    debug!("Ping status short: {} bytes", status.len());
                }
                debug!("Ping response received");
                Ok(())
            }
            Err(Error::ResponseTimeout) => Err(Error::PingTimeout),
            Err(e) => Err(e),
        }
    }

    /// Reset the master.  The image sends no response.
    pub fn reset(&mut self) -> Result<()> {
        self.state.check_connected()?;
        debug!("Sending reset");
        self.send(&encode_reset())
    }

    /// Read the Device ROM Table and cache it.
    ///
    /// The header is read first to find the device count, then the records.
    /// If either read fails, or the contents are implausible, the previously
    /// cached table is kept.
    pub fn read_drt(&mut self) -> Result<&DeviceTable> {
        self.state.check_connected()?;

        let header = self
            .read_words(drt_target(0), DRT_HEADER_LEN)
            .map_err(Error::drt_read)?;
        let (header, body_words) = self.state.drt_body_words(&header)?;

        let body = if body_words > 0 {
            self.read_words(drt_target(DRT_HEADER_LEN), body_words as u32)
                .map_err(Error::drt_read)?
        } else {
            Vec::new()
        };

        self.state.load_drt(header, &body)
    }

    /// The cached device table.  Requires [`Self::read_drt()`].
    pub fn devices(&self) -> Result<&DeviceTable> {
        self.state.devices()
    }

    pub fn get_number_of_devices(&self) -> Result<usize> {
        Ok(self.devices()?.len())
    }

    pub fn get_device(&self, index: u32) -> Result<DeviceDescriptor> {
        self.state.device(index).copied()
    }

    /// First device of the given type, if the DRT lists one.
    pub fn find_device(&self, device_type: DeviceType) -> Result<Option<DeviceDescriptor>> {
        Ok(self.devices()?.find(device_type).copied())
    }

    pub fn is_memory_device(&self, index: u32) -> Result<bool> {
        Ok(self.state.device(index)?.is_memory_device())
    }

    /// Read `count` words from a device, starting at a device-relative
    /// `address`.
    ///
    /// Memory bus devices are addressed from their DRT address offset;
    /// peripheral bus devices by register number.
    pub fn read_registers(&mut self, index: u32, address: u32, count: u32) -> Result<Vec<u32>> {
        let target = self
            .state
            .target(index, address)
            .map_err(Error::device_comm)?;
        self.read_words(target, count).map_err(Error::device_comm)
    }

    /// Write `values` to a device, starting at a device-relative `address`.
    pub fn write_registers(&mut self, index: u32, address: u32, values: &[u32]) -> Result<()> {
        let target = self
            .state
            .target(index, address)
            .map_err(Error::device_comm)?;
        self.write_words(target, values).map_err(Error::device_comm)
    }

    pub fn read_register(&mut self, index: u32, address: u32) -> Result<u32> {
        let words = self.read_registers(index, address, 1)?;
        words
            .first()
            .copied()
            .ok_or_else(|| Error::Decoding.device_comm())
    }

    pub fn write_register(&mut self, index: u32, address: u32, value: u32) -> Result<()> {
        self.write_registers(index, address, &[value])
    }

    /// Read `count` words from an absolute memory bus address.
    ///
    /// Does not need the DRT.
    pub fn read_memory(&mut self, address: u32, count: u32) -> Result<Vec<u32>> {
        self.state.check_connected()?;
        self.read_words(memory_target(address), count)
            .map_err(Error::device_comm)
    }

    /// Write words to an absolute memory bus address.
    pub fn write_memory(&mut self, address: u32, values: &[u32]) -> Result<()> {
        self.state.check_connected()?;
        self.write_words(memory_target(address), values)
            .map_err(Error::device_comm)
    }

    /// Retrieve the master's latched state after a hang.
    ///
    /// Do not reset the image first, that discards the dump.
    pub fn dump_core(&mut self) -> Result<CoreDump> {
        self.state.check_connected()?;
        info!("Requesting core dump");
        self.send(&encode_core_dump_request())?;

        let sync = Synchronizer::new(
            self.state.config.core_dump_timeout,
            self.state.config.sync_chunk,
        );
        let preamble = sync.receive(&mut self.transport, 4)?;
        let count = core_dump_count(&preamble)?;
        debug!("Core dump has {count} words");

        let data = sync.receive_continuation(&mut self.transport, count * 4)?;
        check_len(&data, count * 4)?;
        CoreDump::from_words(&decode_read_response(&data)?)
    }

    /// Wait up to `timeout` for an interrupt frame from the image.
    ///
    /// Nothing is sent: the image pushes interrupt frames unprompted.
    ///
    /// Returns:
    /// - `Ok(true)`: a frame arrived, the cached bitmask now holds its mask
    /// - `Ok(false)`: nothing arrived, the cached bitmask is unchanged
    pub fn poll_interrupts(&mut self, timeout: Duration) -> Result<bool> {
        self.state.check_connected()?;

        let sync = Synchronizer::new(timeout, self.state.config.sync_chunk);
        let rsp = match sync.receive(&mut self.transport, RESPONSE_STATUS_LEN) {
            Ok(rsp) => rsp,
            Err(Error::ResponseTimeout) => return Ok(false),
            Err(e) => return Err(e),
        };

        let mask = self.state.config.dialect.interrupt_mask(&rsp)?;
        debug!("Interrupts: {mask:#010X}");
        self.state.set_interrupts(mask);
        Ok(true)
    }

    /// Interrupt bitmask from the most recent successful poll
    pub fn interrupts(&self) -> u32 {
        self.state.interrupts()
    }

    /// Whether the last poll reported an interrupt for the device at `index`.
    pub fn is_interrupt_pending_for(&self, index: u32) -> bool {
        self.state.is_interrupt_pending_for(index)
    }
}

// Internal functions
impl<T: Transport> BusClient<T> {
    fn synchronizer(&self) -> Synchronizer {
        Synchronizer::new(self.state.config.timeout, self.state.config.sync_chunk)
    }

    /// Purge stale input, then send a frame.
    fn send(&mut self, frame: &[u8]) -> Result<()> {
        trace!("Request: {frame:02X?}");
        self.transport.purge().map_err(|e| {
            warn!("Transport purge failed: {e:?}");
            Error::Io
        })?;
        self.transport.write(frame).map_err(|e| {
            warn!("Transport write failed: {e:?}");
            Error::Io
        })
    }

    fn read_words(&mut self, target: Target, count: u32) -> Result<Vec<u32>> {
        let frame = encode_read(
            target.selector,
            target.bus == Bus::Memory,
            target.address,
            count,
        )?;
        self.send(&frame)?;

        let expected = read_response_len(count);
        let rsp = self.synchronizer().receive(&mut self.transport, expected)?;
        check_len(&rsp, expected)?;
        decode_read_response(&rsp[RESPONSE_STATUS_LEN..])
    }

    fn write_words(&mut self, target: Target, values: &[u32]) -> Result<()> {
        let frame = encode_write(
            target.selector,
            target.bus == Bus::Memory,
            target.address,
            &encode_words(values),
        )?;
        self.send(&frame)?;

        let rsp = self
            .synchronizer()
            .receive(&mut self.transport, RESPONSE_STATUS_LEN)?;
        check_len(&rsp, RESPONSE_STATUS_LEN)
    }
}

fn drt_target(address: u32) -> Target {
    Target {
        bus: Bus::Peripheral,
        selector: DRT_SELECTOR,
        address,
    }
}

fn memory_target(address: u32) -> Target {
    Target {
        bus: Bus::Memory,
        selector: crate::frame::MEMORY_SELECTOR,
        address,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::Dialect;
    use crate::drt::FLAG_MEMORY_DEVICE;
    use crate::sim::SimulatedBoard;

    fn config() -> BusClientConfig {
        BusClientConfig::default().with_timeout(Duration::from_millis(100))
    }

    fn board() -> SimulatedBoard {
        SimulatedBoard::new()
            .with_device(DeviceType::Drt, 0, 0, 3)
            .with_device(DeviceType::Gpio, 0, 0x0100_0000, 5)
            .with_device(DeviceType::Memory, FLAG_MEMORY_DEVICE, 0, 0x800)
    }

    fn loaded(board: SimulatedBoard) -> BusClient<SimulatedBoard> {
        crate::init_test_logging();
        let mut client = BusClient::new(board, config());
        client.connect().unwrap();
        client.read_drt().unwrap();
        client
    }

    #[test]
    fn end_to_end_single_memory_device() {
        let mut board = SimulatedBoard::new().with_device(
            DeviceType::Memory,
            0x0001_0000,
            0x0000_0000,
            0x0000_0100,
        );
        board.set_memory(0, &[0xAABB_CCDD, 0x5566_7788]);

        let mut client = loaded(board);
        assert_eq!(client.state(), ConnectionState::DrtLoaded);
        assert_eq!(client.get_number_of_devices(), Ok(1));
        assert!(client.get_device(0).unwrap().is_memory_device());
        assert_eq!(
            client.read_registers(0, 0, 2),
            Ok(vec![0xAABB_CCDD, 0x5566_7788])
        );
    }

    #[test]
    fn drt_enumerates_in_order() {
        let client = loaded(board());
        let table = client.devices().unwrap();
        assert_eq!(table.len(), 3);
        let ids: Vec<_> = table.iter().map(|d| (d.index, d.device_type())).collect();
        assert_eq!(
            ids,
            vec![
                (0, DeviceType::Drt),
                (1, DeviceType::Gpio),
                (2, DeviceType::Memory)
            ]
        );
        assert_eq!(client.is_memory_device(1), Ok(false));
        assert_eq!(client.is_memory_device(2), Ok(true));
        assert_eq!(client.get_device(3), Err(Error::IndexOutOfRange));
    }

    #[test]
    fn drt_read_is_idempotent() {
        let mut client = loaded(board());
        let first = client.devices().unwrap().clone();
        let second = client.read_drt().unwrap().clone();
        assert_eq!(first, second);
    }

    #[test]
    fn operations_require_state() {
        let mut client = BusClient::new(board(), config());
        assert_eq!(client.ping(), Err(Error::InvalidOperation));
        assert_eq!(client.read_drt().err(), Some(Error::InvalidOperation));

        client.connect().unwrap();
        assert_eq!(client.get_number_of_devices(), Err(Error::InvalidOperation));
        assert_eq!(client.read_registers(1, 0, 1), Err(Error::InvalidOperation));

        client.read_drt().unwrap();
        client.disconnect();
        assert_eq!(client.state(), ConnectionState::Disconnected);
        assert_eq!(client.get_number_of_devices(), Err(Error::InvalidOperation));
    }

    #[test]
    fn connect_failure_stays_disconnected() {
        let mut board = board();
        board.set_fail_open(true);
        let mut client = BusClient::new(board, config());
        assert_eq!(client.connect(), Err(Error::Connect));
        assert_eq!(client.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn ping_through_noise_and_silence() {
        let mut client = BusClient::new(board(), config());
        client.connect().unwrap();
        client.transport_mut().inject_noise(&[0x00, 0x31, 0x60]);
        assert_eq!(client.ping(), Ok(()));

        client.transport_mut().set_silent(true);
        assert_eq!(client.ping(), Err(Error::PingTimeout));
    }

    #[test]
    fn peripheral_registers_use_index_selector() {
        let mut client = loaded(board());
        client.write_registers(1, 2, &[0x1234_5678, 0x9ABC_DEF0]).unwrap();
        assert_eq!(client.transport().register(1, 2), Some(0x1234_5678));
        assert_eq!(client.transport().register(1, 3), Some(0x9ABC_DEF0));
        assert_eq!(client.read_register(1, 3), Ok(0x9ABC_DEF0));

        let last = *client.transport().requests().last().unwrap();
        assert_eq!(last.selector, 1);
        assert_eq!(last.address, 3);
    }

    #[test]
    fn legacy_dialect_offsets_selector() {
        let mut board = SimulatedBoard::new()
            .with_dialect(Dialect::legacy())
            .with_device(DeviceType::Gpio, 0, 0, 5);
        board.set_register(1, 0, 0xCAFE);
        let mut client = BusClient::new(board, config().with_dialect(Dialect::legacy()));
        client.connect().unwrap();
        client.read_drt().unwrap();
        assert_eq!(client.read_register(0, 0), Ok(0xCAFE));
    }

    #[test]
    fn memory_device_addresses_from_offset() {
        let mut board = SimulatedBoard::new()
            .with_device(DeviceType::Drt, 0, 0, 3)
            .with_device(DeviceType::Memory, FLAG_MEMORY_DEVICE, 0x1000, 0x100);
        board.set_memory(0x1004, &[7]);
        let mut client = loaded(board);
        assert_eq!(client.read_register(1, 4), Ok(7));
        client.write_register(1, 5, 8).unwrap();
        assert_eq!(client.read_memory(0x1005, 1), Ok(vec![8]));

        let last = *client.transport().requests().last().unwrap();
        assert_eq!(last.selector, 0x00);
    }

    #[test]
    fn reads_return_requested_word_count() {
        let mut client = BusClient::new(board(), config());
        client.connect().unwrap();
        for count in [0u32, 1, 2, 7, 64, 300] {
            let words = client.read_memory(0x40, count).unwrap();
            assert_eq!(words.len(), count as usize);
        }
    }

    #[test]
    fn bad_payload_is_encoding_failure() {
        let mut client = loaded(board());
        assert_eq!(
            client.write_registers(1, 0x0100_0000, &[1]),
            Err(Error::DeviceComm(Box::new(Error::Encoding)))
        );
        assert_eq!(client.read_registers(9, 0, 1), Err(Error::IndexOutOfRange));
    }

    #[test]
    fn truncated_read_is_reported() {
        let mut client = loaded(board());
        client.transport_mut().truncate_next_response(6);
        assert_eq!(
            client.read_registers(1, 0, 1),
            Err(Error::DeviceComm(Box::new(Error::TruncatedResponse {
                expected: 12,
                received: 5
            })))
        );
        // The next request is unaffected
        assert!(client.read_registers(1, 0, 1).is_ok());
    }

    #[test]
    fn silent_device_times_out() {
        let mut client = loaded(board());
        client.transport_mut().set_silent(true);
        assert_eq!(
            client.write_register(1, 0, 1),
            Err(Error::DeviceComm(Box::new(Error::ResponseTimeout)))
        );
    }

    #[test]
    fn failed_drt_refresh_keeps_old_table() {
        let mut client = loaded(board());
        client.transport_mut().set_silent(true);
        assert_eq!(
            client.read_drt().err(),
            Some(Error::DrtRead(Box::new(Error::ResponseTimeout)))
        );
        assert_eq!(client.state(), ConnectionState::DrtLoaded);
        assert_eq!(client.get_number_of_devices(), Ok(3));
    }

    #[test]
    fn short_drt_header_is_read_error() {
        let mut board = board();
        board.truncate_next_response(10);
        let mut client = BusClient::new(board, config());
        client.connect().unwrap();
        assert_eq!(
            client.read_drt().err(),
            Some(Error::DrtRead(Box::new(Error::TruncatedResponse {
                expected: 40,
                received: 9
            })))
        );
        assert_eq!(client.state(), ConnectionState::Connected);
    }

    #[test]
    fn short_drt_body_keeps_old_table() {
        let mut client = loaded(board());
        // Header in full, then a body cut short
        client.transport_mut().truncate_response(1, 20);
        assert_eq!(
            client.read_drt().err(),
            Some(Error::DrtRead(Box::new(Error::TruncatedResponse {
                expected: 8 + 3 * 8 * 4,
                received: 19
            })))
        );
        assert_eq!(client.state(), ConnectionState::DrtLoaded);
        assert_eq!(client.get_number_of_devices(), Ok(3));
    }

    #[test]
    fn implausible_device_count_is_corrupt() {
        let mut board = board();
        board.set_drt_device_count(100_000);
        let mut client = BusClient::new(board, config());
        client.connect().unwrap();
        assert_eq!(client.read_drt().err(), Some(Error::DrtCorrupt));
        assert_eq!(client.state(), ConnectionState::Connected);
    }

    #[test]
    fn interrupts_reflect_latest_poll_only() {
        let mut client = loaded(board());
        for index in 0..3 {
            assert!(!client.is_interrupt_pending_for(index));
        }

        assert_eq!(client.poll_interrupts(Duration::from_millis(20)), Ok(false));

        client.transport_mut().raise_interrupts(0b0110);
        assert_eq!(client.poll_interrupts(Duration::from_millis(100)), Ok(true));
        assert!(!client.is_interrupt_pending_for(0));
        assert!(client.is_interrupt_pending_for(1));
        assert!(client.is_interrupt_pending_for(2));

        client.transport_mut().raise_interrupts(0b0001);
        assert_eq!(client.poll_interrupts(Duration::from_millis(100)), Ok(true));
        assert!(client.is_interrupt_pending_for(0));
        assert!(!client.is_interrupt_pending_for(1));
        assert_eq!(client.interrupts(), 0b0001);
    }

    #[test]
    fn interrupt_poll_without_deadline() {
        let mut client = loaded(board());
        client.transport_mut().raise_interrupts(0b100);
        assert_eq!(client.poll_interrupts(Duration::MAX), Ok(true));
        assert!(client.is_interrupt_pending_for(2));

        client.set_timeout(Duration::MAX);
        assert_eq!(client.read_register(1, 0), Ok(0));
    }

    #[test]
    fn back_to_back_interrupts_with_large_chunks() {
        let mut config = config();
        config.sync_chunk = 16;
        let mut client = BusClient::new(board(), config);
        client.connect().unwrap();
        client.read_drt().unwrap();

        client.transport_mut().raise_interrupts(0b01);
        client.transport_mut().raise_interrupts(0b10);
        let poll = Duration::from_millis(50);
        assert_eq!(client.poll_interrupts(poll), Ok(true));
        assert_eq!(client.interrupts(), 0b01);
        assert_eq!(client.poll_interrupts(poll), Ok(true));
        assert_eq!(client.interrupts(), 0b10);
    }

    #[test]
    fn reset_sends_no_response() {
        let mut client = loaded(board());
        client.reset().unwrap();
        assert_eq!(client.transport().reset_count(), 1);
        assert_eq!(client.ping(), Ok(()));
    }

    #[test]
    fn core_dump_is_decoded() {
        let mut board = board();
        let mut words = [0u32; 14];
        words[0] = 1;
        words[4] = 0x0000_0001;
        words[5] = 0x40;
        board.set_core_dump(&words);
        let mut client = BusClient::new(board, config());
        client.connect().unwrap();
        let dump = client.dump_core().unwrap();
        assert_eq!(dump.state, crate::core_dump::MasterState::Write);
        assert_eq!(dump.in_command, crate::core_dump::InCommand::Write);
        assert_eq!(dump.in_address, 0x40);
    }
}
