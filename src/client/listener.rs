//! Interrupt polling worker.
//!
//! Olympus images push interrupt frames to the host unprompted.  An
//! [`InterruptListener`] runs a thread that repeatedly polls a
//! [`SharedBusClient`] for them, and hands the client to a callback whenever
//! one arrives, so the callback can service the interrupting device with
//! ordinary register accesses.
//!
//! The client lock is held for each poll and callback, and released between
//! cycles, so other threads may use the same client.  Cancellation is
//! checked between cycles: a poll in progress is allowed to time out first.

// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded};
#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use crate::client::{BusClient, SharedBusClient};
use crate::io::Transport;
use crate::{Error, Result};

/// Default time each poll waits for an interrupt frame
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_millis(500);

/// Time the client lock is left free between polls
const IDLE_GAP: Duration = Duration::from_millis(1);

/// What the listener does after its callback returns
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerAction {
    Continue,
    Stop,
}

/// Cooperative cancellation signal for a listener thread.
#[derive(Debug, Clone)]
pub struct CancelToken {
    tx: Sender<()>,
    rx: Receiver<()>,
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelToken {
    pub fn new() -> Self {
        let (tx, rx) = bounded(1);
        Self { tx, rx }
    }

    /// Request cancellation.  Repeated calls have no further effect.
    pub fn cancel(&self) {
        let _ = self.tx.try_send(());
    }

    pub fn is_cancelled(&self) -> bool {
        !self.rx.is_empty()
    }

    /// Sleep for up to `timeout`, returning early with `true` if cancelled.
    fn wait(&self, timeout: Duration) -> bool {
        match self.rx.recv_timeout(timeout) {
            Ok(()) => {
                // Re-arm, so the token stays cancelled
                self.cancel();
                true
            }
            Err(RecvTimeoutError::Timeout) => false,
            Err(RecvTimeoutError::Disconnected) => true,
        }
    }
}

/// Handle to a running interrupt polling thread.
///
/// Dropping the handle cancels the thread and waits for it to finish.
pub struct InterruptListener {
    token: CancelToken,
    handle: Option<JoinHandle<Result<()>>>,
}

impl InterruptListener {
    /// Start polling `client` for interrupts.
    ///
    /// Arguments:
    /// - `client`: connected client.  The DRT is only needed if `callback`
    ///   uses device indexes.
    /// - `poll_timeout`: how long each poll waits, see
    ///   [`BusClient::poll_interrupts()`]
    /// - `callback`: called with the locked client after each interrupt
    ///   frame.  [`BusClient::interrupts()`] holds the new mask.
    ///
    /// The thread stops when cancelled, when `callback` returns
    /// [`ListenerAction::Stop`], or on a transport failure.
    pub fn spawn<T, F>(client: SharedBusClient<T>, poll_timeout: Duration, callback: F) -> Self
    where
        T: Transport + Send + 'static,
        F: FnMut(&mut BusClient<T>) -> ListenerAction + Send + 'static,
    {
        let token = CancelToken::new();
        let worker_token = token.clone();
        let handle = std::thread::spawn(move || run(client, poll_timeout, callback, worker_token));
        Self {
            token,
            handle: Some(handle),
        }
    }

    /// A token that cancels this listener.
    pub fn cancel_token(&self) -> CancelToken {
        self.token.clone()
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Wait for the thread to stop, returning the error that stopped it, if
    /// any.  Does not cancel.
    pub fn join(mut self) -> Result<()> {
        self.join_inner()
    }

    fn join_inner(&mut self) -> Result<()> {
        match self.handle.take() {
            Some(handle) => match handle.join() {
                Ok(result) => result,
                Err(panic) => std::panic::resume_unwind(panic),
            },
            None => Ok(()),
        }
    }
}

impl Drop for InterruptListener {
    fn drop(&mut self) {
        if self.handle.is_some() {
            self.token.cancel();
            if let Err(e) = self.join_inner() {
                debug!("Interrupt listener stopped with {e}");
            }
        }
    }
}

fn run<T, F>(
    client: SharedBusClient<T>,
    poll_timeout: Duration,
    mut callback: F,
    token: CancelToken,
) -> Result<()>
where
    T: Transport,
    F: FnMut(&mut BusClient<T>) -> ListenerAction,
{
    debug!("Interrupt listener started");

    while !token.is_cancelled() {
        let action = {
            let mut client = client.lock().map_err(|_| {
                error!("Bus client lock poisoned");
                Error::InvalidOperation
            })?;

            match client.poll_interrupts(poll_timeout) {
                Ok(true) => callback(&mut client),
                Ok(false) => ListenerAction::Continue,
                Err(e @ (Error::Io | Error::InvalidOperation)) => {
                    warn!("Interrupt listener stopping: {e}");
                    return Err(e);
                }
                Err(e) => {
                    warn!("Ignoring bad interrupt frame: {e}");
                    ListenerAction::Continue
                }
            }
        };

        if action == ListenerAction::Stop || token.wait(IDLE_GAP) {
            break;
        }
    }

    debug!("Interrupt listener stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::BusClientConfig;
    use crate::drt::DeviceType;
    use crate::sim::SimulatedBoard;

    const POLL: Duration = Duration::from_millis(20);
    const WAIT: Duration = Duration::from_secs(2);

    fn shared() -> SharedBusClient<SimulatedBoard> {
        crate::init_test_logging();
        let board = SimulatedBoard::new()
            .with_device(DeviceType::Drt, 0, 0, 3)
            .with_device(DeviceType::Gpio, 0, 0x0100_0000, 5);
        let config = BusClientConfig::default().with_timeout(Duration::from_millis(100));
        let mut client = BusClient::new(board, config);
        client.connect().unwrap();
        client.read_drt().unwrap();
        client.into_shared()
    }

    #[test]
    fn delivers_each_interrupt_frame() {
        let client = shared();
        let (tx, rx) = bounded(4);
        let listener = InterruptListener::spawn(client.clone(), POLL, move |c| {
            tx.send((c.interrupts(), c.is_interrupt_pending_for(1))).unwrap();
            ListenerAction::Continue
        });

        client.lock().unwrap().transport_mut().raise_interrupts(0b10);
        assert_eq!(rx.recv_timeout(WAIT), Ok((0b10, true)));

        client.lock().unwrap().transport_mut().raise_interrupts(0b01);
        assert_eq!(rx.recv_timeout(WAIT), Ok((0b01, false)));

        listener.cancel();
        assert_eq!(listener.join(), Ok(()));
    }

    #[test]
    fn callback_can_stop_listener() {
        let client = shared();
        let listener = InterruptListener::spawn(client.clone(), POLL, |_| ListenerAction::Stop);
        client.lock().unwrap().transport_mut().raise_interrupts(1);
        assert_eq!(listener.join(), Ok(()));
    }

    #[test]
    fn client_usable_while_listening() {
        let client = shared();
        let listener = InterruptListener::spawn(client.clone(), POLL, |_| ListenerAction::Continue);
        for value in 0..5 {
            let mut c = client.lock().unwrap();
            c.write_register(1, 0, value).unwrap();
            assert_eq!(c.read_register(1, 0), Ok(value));
        }
        assert!(listener.is_running());
        let token = listener.cancel_token();
        token.cancel();
        assert!(token.is_cancelled());
        assert_eq!(listener.join(), Ok(()));
    }

    #[test]
    fn disconnect_stops_listener() {
        let client = shared();
        let listener = InterruptListener::spawn(client.clone(), POLL, |_| ListenerAction::Continue);
        client.lock().unwrap().disconnect();
        assert_eq!(listener.join(), Err(Error::InvalidOperation));
    }
}
