//! Asynchronous register bus client.

// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

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
    AsyncDelay, AsyncSynchronizer, Bus, MEMORY_SELECTOR, RESPONSE_STATUS_LEN, check_len,
    decode_read_response, encode_core_dump_request, encode_ping, encode_read, encode_reset,
    encode_words, encode_write,
};
use crate::io::AsyncTransport;
use crate::{Error, Result};

/// Async register bus client.
///
/// Behaves as [`crate::client::BusClient`], over an [`AsyncTransport`].
/// See [`AsyncDelay`] for the required delay trait.
///
/// Example usage:
///
/// ```rust,ignore
/// use olympus_bus::client::{AsyncBusClient, BusClientConfig};
///
/// let mut client = AsyncBusClient::<_, Delay>::new(transport, BusClientConfig::default());
/// client.connect().await?;
/// client.read_drt().await?;
/// let value = client.read_register(1, 0).await?;
/// ```
pub struct AsyncBusClient<T: AsyncTransport, D: AsyncDelay> {
    transport: T,
    state: ClientState,
    _delay: core::marker::PhantomData<D>,
}

impl<T: AsyncTransport, D: AsyncDelay> AsyncBusClient<T, D> {
    /// Create a new, disconnected, AsyncBusClient
    ///
    /// Arguments:
    /// - `transport`: Transport to the board, not yet opened
    /// - `config`: Timeouts and board dialect
    pub fn new(transport: T, config: BusClientConfig) -> Self {
        Self {
            transport,
            state: ClientState::new(config),
            _delay: core::marker::PhantomData,
        }
    }

    pub fn config(&self) -> &BusClientConfig {
        &self.state.config
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.state.config.timeout = timeout;
    }

    pub fn state(&self) -> ConnectionState {
        self.state.state()
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub async fn connect(&mut self) -> Result<()> {
        if self.state() != ConnectionState::Disconnected {
            self.disconnect().await;
        }
        self.transport.open().await.map_err(|e| {
            warn!("Failed to open transport: {e:?}");
            Error::Connect
        })?;
        self.state.connected();
        Ok(())
    }

    pub async fn disconnect(&mut self) {
        self.transport.close().await;
        self.state.disconnected();
    }

    pub async fn ping(&mut self) -> Result<()> {
        self.state.check_connected()?;
        debug!("Sending ping");
        self.send(&encode_ping()).await?;

        let sync = self.synchronizer(self.state.config.timeout);
        match sync.receive(&mut self.transport, RESPONSE_STATUS_LEN).await {
            Ok(_) => Ok(()),
            Err(Error::ResponseTimeout) => Err(Error::PingTimeout),
            Err(e) => Err(e),
        }
    }

    pub async fn reset(&mut self) -> Result<()> {
        self.state.check_connected()?;
        debug!("Sending reset");
        self.send(&encode_reset()).await
    }

    /// Read the Device ROM Table and cache it.  See
    /// [`crate::client::BusClient::read_drt()`].
    pub async fn read_drt(&mut self) -> Result<&DeviceTable> {
        self.state.check_connected()?;

        let header = self
            .read_words(drt_target(0), DRT_HEADER_LEN)
            .await
            .map_err(Error::drt_read)?;
        let (header, body_words) = self.state.drt_body_words(&header)?;

        let body = if body_words > 0 {
            self.read_words(drt_target(DRT_HEADER_LEN), body_words as u32)
                .await
                .map_err(Error::drt_read)?
        } else {
            Vec::new()
        };

        self.state.load_drt(header, &body)
    }

    pub fn devices(&self) -> Result<&DeviceTable> {
        self.state.devices()
    }

    pub fn get_number_of_devices(&self) -> Result<usize> {
        Ok(self.devices()?.len())
    }

    pub fn get_device(&self, index: u32) -> Result<DeviceDescriptor> {
        self.state.device(index).copied()
    }

    pub fn find_device(&self, device_type: DeviceType) -> Result<Option<DeviceDescriptor>> {
        Ok(self.devices()?.find(device_type).copied())
    }

    pub fn is_memory_device(&self, index: u32) -> Result<bool> {
        Ok(self.state.device(index)?.is_memory_device())
    }

    pub async fn read_registers(
        &mut self,
        index: u32,
        address: u32,
        count: u32,
    ) -> Result<Vec<u32>> {
        let target = self
            .state
            .target(index, address)
            .map_err(Error::device_comm)?;
        self.read_words(target, count)
            .await
            .map_err(Error::device_comm)
    }

    pub async fn write_registers(
        &mut self,
        index: u32,
        address: u32,
        values: &[u32],
    ) -> Result<()> {
        let target = self
            .state
            .target(index, address)
            .map_err(Error::device_comm)?;
        self.write_words(target, values)
            .await
            .map_err(Error::device_comm)
    }

    pub async fn read_register(&mut self, index: u32, address: u32) -> Result<u32> {
        let words = self.read_registers(index, address, 1).await?;
        words
            .first()
            .copied()
            .ok_or_else(|| Error::Decoding.device_comm())
    }

    pub async fn write_register(&mut self, index: u32, address: u32, value: u32) -> Result<()> {
        self.write_registers(index, address, &[value]).await
    }

    pub async fn read_memory(&mut self, address: u32, count: u32) -> Result<Vec<u32>> {
        self.state.check_connected()?;
        self.read_words(memory_target(address), count)
            .await
            .map_err(Error::device_comm)
    }

    pub async fn write_memory(&mut self, address: u32, values: &[u32]) -> Result<()> {
        self.state.check_connected()?;
        self.write_words(memory_target(address), values)
            .await
            .map_err(Error::device_comm)
    }

    pub async fn dump_core(&mut self) -> Result<CoreDump> {
        self.state.check_connected()?;
        info!("Requesting core dump");
        self.send(&encode_core_dump_request()).await?;

        let sync = self.synchronizer(self.state.config.core_dump_timeout);
        let preamble = sync.receive(&mut self.transport, 4).await?;
        let count = core_dump_count(&preamble)?;

        let data = sync
            .receive_continuation(&mut self.transport, count * 4)
            .await?;
        check_len(&data, count * 4)?;
        CoreDump::from_words(&decode_read_response(&data)?)
    }

    /// Wait up to `timeout` for an interrupt frame.  See
    /// [`crate::client::BusClient::poll_interrupts()`].
    pub async fn poll_interrupts(&mut self, timeout: Duration) -> Result<bool> {
        self.state.check_connected()?;

        let sync = self.synchronizer(timeout);
        let rsp = match sync.receive(&mut self.transport, RESPONSE_STATUS_LEN).await {
            Ok(rsp) => rsp,
            Err(Error::ResponseTimeout) => return Ok(false),
            Err(e) => return Err(e),
        };

        let mask = self.state.config.dialect.interrupt_mask(&rsp)?;
        debug!("Interrupts: {mask:#010X}");
        self.state.set_interrupts(mask);
        Ok(true)
    }

    pub fn interrupts(&self) -> u32 {
        self.state.interrupts()
    }

    pub fn is_interrupt_pending_for(&self, index: u32) -> bool {
        self.state.is_interrupt_pending_for(index)
    }
}

// Internal functions
impl<T: AsyncTransport, D: AsyncDelay> AsyncBusClient<T, D> {
    fn synchronizer(&self, timeout: Duration) -> AsyncSynchronizer<D> {
        AsyncSynchronizer::new(timeout, self.state.config.sync_chunk)
    }

    async fn send(&mut self, frame: &[u8]) -> Result<()> {
        trace!("Request: {frame:02X?}");
        self.transport.purge().await.map_err(|e| {
            warn!("Transport purge failed: {e:?}");
            Error::Io
        })?;
        self.transport.write(frame).await.map_err(|e| {
            warn!("Transport write failed: {e:?}");
            Error::Io
        })
    }

    async fn read_words(&mut self, target: Target, count: u32) -> Result<Vec<u32>> {
        let frame = encode_read(
            target.selector,
            target.bus == Bus::Memory,
            target.address,
            count,
        )?;
        self.send(&frame).await?;

        let expected = read_response_len(count);
        let sync = self.synchronizer(self.state.config.timeout);
        let rsp = sync.receive(&mut self.transport, expected).await?;
        check_len(&rsp, expected)?;
        decode_read_response(&rsp[RESPONSE_STATUS_LEN..])
    }

    async fn write_words(&mut self, target: Target, values: &[u32]) -> Result<()> {
        let frame = encode_write(
            target.selector,
            target.bus == Bus::Memory,
            target.address,
            &encode_words(values),
        )?;
        self.send(&frame).await?;

        let sync = self.synchronizer(self.state.config.timeout);
        let rsp = sync.receive(&mut self.transport, RESPONSE_STATUS_LEN).await?;
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
        selector: MEMORY_SELECTOR,
        address,
    }
}

#[cfg(test)]
mod tests {
    use futures::executor::block_on;

    use super::*;
    use crate::drt::FLAG_MEMORY_DEVICE;
    use crate::sim::{SimDelay, SimulatedBoard};

    type Client = AsyncBusClient<SimulatedBoard, SimDelay>;

    fn client() -> Client {
        crate::init_test_logging();
        let board = SimulatedBoard::new()
            .with_device(DeviceType::Drt, 0, 0, 3)
            .with_device(DeviceType::Gpio, 0, 0x0100_0000, 5)
            .with_device(DeviceType::Memory, FLAG_MEMORY_DEVICE, 0, 0x800);
        let config = BusClientConfig::default().with_timeout(Duration::from_millis(100));
        AsyncBusClient::new(board, config)
    }

    #[test]
    fn async_drt_and_registers() {
        let mut client = client();
        block_on(async {
            client.connect().await.unwrap();
            client.ping().await.unwrap();
            assert_eq!(client.read_drt().await.map(|t| t.len()), Ok(3));
            client.write_registers(1, 0, &[5, 6]).await.unwrap();
            assert_eq!(client.read_registers(1, 0, 2).await, Ok(vec![5, 6]));
            client.write_register(2, 0x10, 0xFEED).await.unwrap();
            assert_eq!(client.read_memory(0x10, 1).await, Ok(vec![0xFEED]));
        });
        assert_eq!(client.transport().register(1, 1), Some(6));
    }

    #[test]
    fn async_failures_match_blocking_client() {
        let mut client = client();
        block_on(async {
            assert_eq!(client.ping().await, Err(Error::InvalidOperation));
            client.connect().await.unwrap();
            assert_eq!(
                client.read_register(1, 0).await,
                Err(Error::InvalidOperation)
            );
            client.read_drt().await.unwrap();

            client.transport_mut().truncate_next_response(4);
            assert_eq!(
                client.read_register(1, 0).await,
                Err(Error::DeviceComm(Box::new(Error::TruncatedResponse {
                    expected: 12,
                    received: 3
                })))
            );

            client.transport_mut().set_silent(true);
            assert_eq!(client.ping().await, Err(Error::PingTimeout));
            assert_eq!(
                client.read_drt().await.err(),
                Some(Error::DrtRead(Box::new(Error::ResponseTimeout)))
            );
            assert_eq!(client.get_number_of_devices(), Ok(3));
        });
    }

    #[test]
    fn async_interrupts_and_core_dump() {
        let mut client = client();
        let mut words = [0u32; 14];
        words[0] = 2;
        client.transport_mut().set_core_dump(&words);
        block_on(async {
            client.connect().await.unwrap();
            client.read_drt().await.unwrap();

            let poll = Duration::from_millis(10);
            assert_eq!(client.poll_interrupts(poll).await, Ok(false));
            client.transport_mut().raise_interrupts(1 << 2);
            assert_eq!(client.poll_interrupts(Duration::MAX).await, Ok(true));
            assert!(client.is_interrupt_pending_for(2));
            assert!(!client.is_interrupt_pending_for(1));

            let dump = client.dump_core().await.unwrap();
            assert_eq!(dump.state, crate::core_dump::MasterState::Read);
        });
    }
}
