//! Asynchronous response synchronizer.
//!
//! Same algorithm as [`crate::frame::sync::Synchronizer`], over an
//! [`AsyncTransport`].  Between empty reads it yields through [`AsyncDelay`]
//! so that it doesn't spin the executor.

// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

use std::time::{Duration, Instant};

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use crate::frame::RESPONSE_SENTINEL;
use crate::frame::sync::{before, chunk_len, deadline};
use crate::io::AsyncTransport;
use crate::{Error, Result};

/// Yield delay for async polling loops.
///
/// Application must provide an implementation of this trait in order for the
/// async synchronizer to be able to yield while waiting for response bytes.
///
/// This trait keeps `olympus-bus` free of any specific async runtime.
///
/// Example:
///
/// ```rust,ignore
/// use embassy_time::{Duration, Timer};
/// struct Delay;
/// impl AsyncDelay for Delay {
///     async fn delay() {
///         Timer::after(Duration::from_millis(1)).await;
///     }
/// }
/// ```
pub trait AsyncDelay {
    fn delay() -> impl Future<Output = ()>;
}

/// Scans an [`AsyncTransport`] for a response.
pub struct AsyncSynchronizer<D: AsyncDelay> {
    timeout: Duration,
    chunk_size: usize,
    _delay: core::marker::PhantomData<D>,
}

impl<D: AsyncDelay> AsyncSynchronizer<D> {
    /// Create a new synchronizer.  See
    /// [`crate::frame::sync::Synchronizer::new()`].
    pub fn new(timeout: Duration, chunk_size: usize) -> Self {
        Self {
            timeout,
            chunk_size: chunk_size.max(1),
            _delay: core::marker::PhantomData,
        }
    }

    /// Receive up to `expected` bytes following the response sentinel.
    ///
    /// Same contract as [`crate::frame::sync::Synchronizer::receive()`].
    pub async fn receive<T: AsyncTransport>(
        &self,
        transport: &mut T,
        expected: usize,
    ) -> Result<Vec<u8>> {
        let deadline = deadline(self.timeout);
        let mut rsp = self.find_sentinel(transport, expected, deadline).await?;

        self.fill(transport, &mut rsp, expected, deadline).await?;
        Ok(rsp)
    }

    /// Receive up to `expected` further bytes with a fresh deadline.  See
    /// [`crate::frame::sync::Synchronizer::receive_continuation()`].
    pub async fn receive_continuation<T: AsyncTransport>(
        &self,
        transport: &mut T,
        expected: usize,
    ) -> Result<Vec<u8>> {
        let deadline = deadline(self.timeout);
        let mut rsp = Vec::with_capacity(expected);
        self.fill(transport, &mut rsp, expected, deadline).await?;
        Ok(rsp)
    }

    async fn fill<T: AsyncTransport>(
        &self,
        transport: &mut T,
        rsp: &mut Vec<u8>,
        expected: usize,
        deadline: Option<Instant>,
    ) -> Result<()> {
        while rsp.len() < expected && before(deadline) {
            let start = rsp.len();
            rsp.resize(expected, 0);
            let n = read(transport, &mut rsp[start..]).await?;
            rsp.truncate(start + n);
            if n == 0 {
                D::delay().await;
            }
        }

        if rsp.len() < expected {
            warn!("Short response: {} of {} bytes", rsp.len(), expected);
        }
        trace!("Response: {rsp:02X?}");
        Ok(())
    }

    async fn find_sentinel<T: AsyncTransport>(
        &self,
        transport: &mut T,
        expected: usize,
        deadline: Option<Instant>,
    ) -> Result<Vec<u8>> {
        let mut chunk = vec![0u8; chunk_len(self.chunk_size, expected)];
        let mut discarded = 0usize;

        while before(deadline) {
            let n = read(transport, &mut chunk).await?;
            if n == 0 {
                D::delay().await;
                continue;
            }
            if let Some(index) = chunk[..n].iter().position(|b| *b == RESPONSE_SENTINEL) {
                discarded += index;
                if discarded > 0 {
                    debug!("Discarded {discarded} bytes before response sentinel");
                }
                return Ok(chunk[index + 1..n].to_vec());
            }
            discarded += n;
        }

        debug!("No response sentinel within {:?}", self.timeout);
        Err(Error::ResponseTimeout)
    }
}

async fn read<T: AsyncTransport>(transport: &mut T, buf: &mut [u8]) -> Result<usize> {
    transport.read(buf).await.map_err(|e| {
        warn!("Transport read failed: {e:?}");
        Error::Io
    })
}

#[cfg(test)]
mod tests {
    use futures::executor::block_on;

    use super::*;
    use crate::sim::{SimDelay, SimulatedBoard};

    #[test]
    fn async_receive_skips_noise() {
        crate::init_test_logging();
        let mut board = SimulatedBoard::new();
        board.queue_raw(&[0x31, 0x60, RESPONSE_SENTINEL, 0, 0, 0, 0, 0, 0, 0, 7]);
        let sync = AsyncSynchronizer::<SimDelay>::new(Duration::from_millis(100), 1);
        let rsp = block_on(sync.receive(&mut board, 8)).unwrap();
        assert_eq!(rsp, vec![0, 0, 0, 0, 0, 0, 0, 7]);
    }

    #[test]
    fn async_large_chunks_keep_following_frame() {
        let mut board = SimulatedBoard::new();
        board.raise_interrupts(1);
        board.raise_interrupts(2);
        let sync = AsyncSynchronizer::<SimDelay>::new(Duration::MAX, 16);
        let first = block_on(sync.receive(&mut board, 8)).unwrap();
        let second = block_on(sync.receive(&mut board, 8)).unwrap();
        assert_eq!(first, vec![0, 0, 0, 0, 0, 0, 0, 1]);
        assert_eq!(second, vec![0, 0, 0, 0, 0, 0, 0, 2]);
    }

    #[test]
    fn async_receive_times_out() {
        let mut board = SimulatedBoard::new();
        board.queue_raw(&[0x00, 0x01, 0x02]);
        let sync = AsyncSynchronizer::<SimDelay>::new(Duration::from_millis(20), 1);
        assert_eq!(
            block_on(sync.receive(&mut board, 8)),
            Err(Error::ResponseTimeout)
        );
    }
}
