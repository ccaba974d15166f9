//! Refresh triggers: hotplug notifications and the polling timer.
//!
//! The inventory refreshes when something tells it to. Two somethings
//! exist: a hotplug notification from whatever OS integration the
//! front-end wires up (udev, DBus), and the [`Poller`], a fallback
//! timer that catches events the integration missed or that no
//! integration exists for. Both feed the same channel, and the single
//! consumer draining it performs one refresh cycle per trigger, so
//! refreshes are serialized by construction.

use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::debug;

/// A device arrival or departure reported by the OS.
///
/// The metadata is advisory: diffing works purely on inventory
/// snapshots, so a notification with no metadata at all still causes a
/// correct refresh.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HotplugEvent {
    Added {
        vendor: Option<String>,
        model: Option<String>,
    },
    Removed {
        vendor: Option<String>,
        model: Option<String>,
    },
}

/// Why the consumer should refresh the inventory now.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RefreshTrigger {
    /// The OS reported a device arriving or leaving.
    Hotplug(HotplugEvent),
    /// The fallback polling timer fired.
    Tick,
}

/// Sends [`RefreshTrigger::Tick`] at a fixed interval until dropped.
pub struct Poller {
    stop: Option<mpsc::Sender<()>>,
    worker: Option<JoinHandle<()>>,
}

impl Poller {
    /// Spawns the timer thread. Ticking ends when the `Poller` is
    /// dropped or the receiving end of `triggers` goes away.
    pub fn spawn(interval: Duration, triggers: Sender<RefreshTrigger>) -> Self {
        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let worker = thread::spawn(move || {
            debug!(interval_ms = interval.as_millis() as u64, "poller started");
            loop {
                match stop_rx.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => {
                        if triggers.send(RefreshTrigger::Tick).is_err() {
                            // Consumer loop is gone, nothing left to poll for.
                            break;
                        }
                    }
                    // Stop requested or the Poller was dropped.
                    _ => break,
                }
            }
            debug!("poller stopped");
        });

        Self {
            stop: Some(stop_tx),
            worker: Some(worker),
        }
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        // Closing the stop channel wakes the worker mid-wait.
        drop(self.stop.take());
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}
