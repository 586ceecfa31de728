//! Blocking response synchronizer.
//!
//! Responses may be preceded by noise, such as FTDI modem status bytes or
//! the tail of an earlier, abandoned response.  The synchronizer reads until
//! it sees [`RESPONSE_SENTINEL`], throws away everything before it, and then
//! collects the requested number of bytes that follow.
//!
//! The sentinel is a single byte value that can also occur in payload data.
//! If stale payload containing `0xDC` is still in flight when a new request
//! is sent, the synchronizer will lock onto it.  Deployed images rely on this
//! framing, so callers purge the transport before each request rather than
//! the synchronizer trying to be cleverer.

// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

use std::time::{Duration, Instant};

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use crate::frame::RESPONSE_SENTINEL;
use crate::io::Transport;
use crate::{Error, Result};

/// Scans a [`Transport`] for a response.
#[derive(Debug, Clone, Copy)]
pub struct Synchronizer {
    timeout: Duration,
    chunk_size: usize,
}

impl Synchronizer {
    /// Create a new synchronizer.
    ///
    /// Arguments:
    /// - `timeout`: wall-clock time allowed for the whole response
    /// - `chunk_size`: bytes requested per read while looking for the
    ///   sentinel.  Values of 0 are treated as 1.
    pub fn new(timeout: Duration, chunk_size: usize) -> Self {
        Self {
            timeout,
            chunk_size: chunk_size.max(1),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Receive up to `expected` bytes following the response sentinel.
    ///
    /// Returns:
    /// - `Ok(bytes)`: the sentinel was found.  `bytes` excludes the sentinel
    ///   and may be shorter than `expected` if the deadline passed first;
    ///   the caller decides whether that is a [`Error::TruncatedResponse`].
    /// - `Err(Error::ResponseTimeout)`: no sentinel before the deadline.
    /// - `Err(Error::Io)`: the transport failed.
    pub fn receive<T: Transport>(&self, transport: &mut T, expected: usize) -> Result<Vec<u8>> {
        let deadline = deadline(self.timeout);
        let mut rsp = self.find_sentinel(transport, expected, deadline)?;
        fill(transport, &mut rsp, expected, deadline)?;
        Ok(rsp)
    }

    /// Receive up to `expected` further bytes of a response already
    /// synchronized by [`Self::receive()`], with a fresh deadline.
    ///
    /// Used where the length of the rest of a response is only known after
    /// its first part has been decoded.
    pub fn receive_continuation<T: Transport>(
        &self,
        transport: &mut T,
        expected: usize,
    ) -> Result<Vec<u8>> {
        let deadline = deadline(self.timeout);
        let mut rsp = Vec::with_capacity(expected);
        fill(transport, &mut rsp, expected, deadline)?;
        Ok(rsp)
    }

    /// Wait for a sentinel, returning whatever followed it in the same chunk.
    ///
    /// Reads never extend past the end of the response, so bytes of a
    /// following frame stay in the transport.
    fn find_sentinel<T: Transport>(
        &self,
        transport: &mut T,
        expected: usize,
        deadline: Option<Instant>,
    ) -> Result<Vec<u8>> {
        let mut chunk = vec![0u8; chunk_len(self.chunk_size, expected)];
        let mut discarded = 0usize;

        while before(deadline) {
            let n = read(transport, &mut chunk)?;
            if n == 0 {
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

/// Deadline `timeout` from now.  `None` if that is beyond what [`Instant`]
/// can represent, meaning wait forever.
pub(crate) fn deadline(timeout: Duration) -> Option<Instant> {
    let deadline = Instant::now().checked_add(timeout);
    if deadline.is_none() {
        trace!("Timeout {timeout:?} has no deadline");
    }
    deadline
}

pub(crate) fn before(deadline: Option<Instant>) -> bool {
    deadline.is_none_or(|d| Instant::now() < d)
}

/// Bytes per read while hunting for the sentinel: at most the sentinel plus
/// the response.
pub(crate) fn chunk_len(chunk_size: usize, expected: usize) -> usize {
    chunk_size.min(expected.saturating_add(1))
}

/// Read into `rsp` until it holds `expected` bytes or the deadline passes.
fn fill<T: Transport>(
    transport: &mut T,
    rsp: &mut Vec<u8>,
    expected: usize,
    deadline: Option<Instant>,
) -> Result<()> {
    while rsp.len() < expected && before(deadline) {
        let start = rsp.len();
        rsp.resize(expected, 0);
        let n = read(transport, &mut rsp[start..])?;
        rsp.truncate(start + n);
    }

    if rsp.len() < expected {
        warn!("Short response: {} of {} bytes", rsp.len(), expected);
    }
    trace!("Response: {rsp:02X?}");
    Ok(())
}

fn read<T: Transport>(transport: &mut T, buf: &mut [u8]) -> Result<usize> {
    transport.read(buf).map_err(|e| {
        warn!("Transport read failed: {e:?}");
        Error::Io
    })
}
