//! Execution control state shared between the engine API and a running
//! scheduler: the pause gate and the breakpoint resolution channel.

use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{oneshot, Notify};

/// Shared control surface for one execution.
#[derive(Debug, Default)]
pub struct ControlState {
    paused: AtomicBool,
    resumed: Notify,
    breakpoint_tx: Mutex<Option<oneshot::Sender<Value>>>,
}

impl ControlState {
    /// Fresh, unpaused control state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Request a pause; the scheduler suspends at the next cycle boundary.
    pub fn pause(&self) {
        self.paused.store(true, Ordering::Release);
    }

    /// Clear the pause flag and wake the scheduler.
    pub fn resume(&self) {
        self.paused.store(false, Ordering::Release);
        self.resumed.notify_waiters();
    }

    /// Whether a pause is requested.
    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    /// Wait until the pause flag clears.
    pub async fn wait_resumed(&self) {
        while self.is_paused() {
            let notified = self.resumed.notified();
            if !self.is_paused() {
                break;
            }
            notified.await;
        }
    }

    /// Install the resolution channel for a waiting breakpoint.
    pub fn arm_breakpoint(&self, tx: oneshot::Sender<Value>) {
        *self.breakpoint_tx.lock() = Some(tx);
    }

    /// Resolve a waiting breakpoint; returns `false` when none is armed.
    pub fn resolve_breakpoint(&self, resolution: Value) -> bool {
        match self.breakpoint_tx.lock().take() {
            Some(tx) => tx.send(resolution).is_ok(),
            None => false,
        }
    }

    /// Whether a breakpoint is currently waiting.
    #[must_use]
    pub fn has_pending_breakpoint(&self) -> bool {
        self.breakpoint_tx.lock().is_some()
    }
}
