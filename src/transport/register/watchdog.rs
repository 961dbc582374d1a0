//! Connection watchdog and reconnection supervisor
//!
//! Ticks on a fixed interval. After `probe_after` without inbound traffic it
//! sends one 1-byte probe read; after `stale_after` it closes the ports and
//! loops reopen + full resync with backoff until it succeeds or shutdown is
//! requested, then notifies observers of the whole state exactly once.

use crossbeam::channel::{bounded, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{info, warn};

use super::Inner;
use crate::error::Result;
use crate::transport::ConnectionState;

/// Handle of the running watchdog thread
pub(super) struct Supervisor {
    shutdown: Sender<()>,
    done: Receiver<()>,
    handle: JoinHandle<()>,
}

impl Supervisor {
    pub(super) fn spawn(inner: Arc<Inner>) -> Result<Self> {
        let (shutdown_tx, shutdown_rx) = bounded::<()>(1);
        let (done_tx, done_rx) = bounded::<()>(1);

        let handle = thread::Builder::new()
            .name("midibox-watchdog".into())
            .spawn(move || {
                run(&inner, &shutdown_rx);
                drop(done_tx);
            })?;

        Ok(Self {
            shutdown: shutdown_tx,
            done: done_rx,
            handle,
        })
    }

    /// Signal the thread and join it, giving up after `timeout`
    pub(super) fn stop(self, timeout: Duration) {
        let _ = self.shutdown.try_send(());
        drop(self.shutdown);

        match self.done.recv_timeout(timeout) {
            Err(RecvTimeoutError::Timeout) => {
                warn!("Watchdog did not exit within {:?}, detaching", timeout);
            }
            _ => {
                let _ = self.handle.join();
            }
        }
    }
}

/// Wait one interval; true when shutdown was requested
fn sleep_or_shutdown(shutdown: &Receiver<()>, interval: Duration) -> bool {
    !matches!(shutdown.recv_timeout(interval), Err(RecvTimeoutError::Timeout))
}

fn run(inner: &Arc<Inner>, shutdown: &Receiver<()>) {
    let timing = &inner.timing;
    let mut probing = false;
    inner.touch();

    while !sleep_or_shutdown(shutdown, timing.watchdog_tick()) {
        if !inner.keep_alive {
            inner.touch();
        }

        let idle = inner.idle();
        if inner.state() != ConnectionState::Synced || idle > timing.stale_after() {
            probing = false;
            if !reconnect(inner, shutdown) {
                break;
            }
        } else if idle > timing.probe_after() {
            if !probing {
                probing = true;
                inner.send_probe();
            }
        } else {
            probing = false;
        }
    }
}

/// Reopen and resync until success; false when interrupted by shutdown
fn reconnect(inner: &Arc<Inner>, shutdown: &Receiver<()>) -> bool {
    info!("Midibox reconnecting");
    inner.close_link();
    inner.set_state(ConnectionState::Connecting);

    let backoff = inner.timing.reconnect_backoff();
    let mut attempt: u32 = 0;
    loop {
        attempt += 1;
        match inner.open_and_sync(inner.timing.reconnect_read_retries) {
            Ok(()) => break,
            Err(e) => {
                inner.close_link();
                inner.set_state(ConnectionState::Connecting);
                let delay = backoff.saturating_mul(attempt.min(10));
                warn!("Midibox reconnect #{} failed: {} (next in {:?})", attempt, e, delay);
                if sleep_or_shutdown(shutdown, delay) {
                    return false;
                }
            }
        }
    }

    info!("Midibox reconnected after {} attempt(s)", attempt);
    inner.touch();
    inner.emit_all();
    true
}
