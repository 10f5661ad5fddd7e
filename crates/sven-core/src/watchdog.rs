// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Per-sub-agent activity watchdog.
//!
//! A delegated sub-agent that goes quiet (no tool-call start) for longer
//! than `activity_timeout_ms` is assumed stuck and interrupted. The timer
//! pauses while the sub-agent itself delegates further down the chain —
//! waiting on a grandchild is not "going quiet" — via a stacking counter so
//! nested pause/resume calls compose correctly.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{oneshot, Notify};
use tracing::debug;

/// Fires an interrupt after a period of inactivity, unless paused.
///
/// `touch()` resets the deadline (call on every tool-call start).
/// `pause()`/`resume()` use a stacking counter: the timer only actually
/// stops on the 0→1 transition and only restarts (with a fresh deadline) on
/// the 1→0 transition, so a sub-agent several levels deep can pause its
/// direct parent without racing a sibling's pause/resume.
pub struct ActivityWatchdog {
    timeout: Duration,
    pause_count: AtomicU32,
    reset: Notify,
    cancel_tx: tokio::sync::Mutex<Option<oneshot::Sender<()>>>,
}

impl ActivityWatchdog {
    /// Spawn a watchdog that sends on `cancel_tx` the first time `timeout`
    /// elapses with the pause count at zero and no intervening `touch()`.
    pub fn spawn(timeout: Duration, cancel_tx: oneshot::Sender<()>) -> Arc<Self> {
        let this = Arc::new(Self {
            timeout,
            pause_count: AtomicU32::new(0),
            reset: Notify::new(),
            cancel_tx: tokio::sync::Mutex::new(Some(cancel_tx)),
        });
        let weak = Arc::downgrade(&this);
        tokio::spawn(async move {
            loop {
                let Some(strong) = weak.upgrade() else { break };
                tokio::select! {
                    _ = tokio::time::sleep(strong.timeout) => {
                        if strong.pause_count.load(Ordering::Acquire) == 0 {
                            let mut slot = strong.cancel_tx.lock().await;
                            if let Some(tx) = slot.take() {
                                debug!(timeout_ms = strong.timeout.as_millis() as u64, "activity watchdog fired");
                                let _ = tx.send(());
                            }
                            break;
                        }
                        // Paused: wait for resume() to notify us rather than
                        // busy-looping on the same expired sleep.
                        strong.reset.notified().await;
                    }
                    _ = strong.reset.notified() => {}
                }
            }
        });
        this
    }

    /// Reset the deadline. Call whenever the watched sub-agent starts a new
    /// tool call (the activity that proves it is not stuck).
    pub fn touch(&self) {
        self.reset.notify_one();
    }

    /// Increment the pause counter. Only the 0→1 transition stops the timer.
    pub fn pause(&self) {
        self.pause_count.fetch_add(1, Ordering::AcqRel);
    }

    /// Decrement the pause counter. Only the 1→0 transition restarts the
    /// timer with a fresh deadline.
    pub fn resume(&self) {
        let prev = self.pause_count.fetch_sub(1, Ordering::AcqRel);
        if prev == 1 {
            self.reset.notify_one();
        }
    }

    pub fn is_paused(&self) -> bool {
        self.pause_count.load(Ordering::Acquire) > 0
    }
}

/// RAII guard pausing `watchdog` for as long as it is alive. Used by a
/// delegating tool to pause its own parent's watchdog for the duration of a
/// nested `send_message`/`submit` call.
pub struct WatchdogPauseGuard {
    watchdog: Option<Arc<ActivityWatchdog>>,
}

impl WatchdogPauseGuard {
    pub fn new(watchdog: Option<Arc<ActivityWatchdog>>) -> Self {
        if let Some(w) = &watchdog {
            w.pause();
        }
        Self { watchdog }
    }
}

impl Drop for WatchdogPauseGuard {
    fn drop(&mut self) {
        if let Some(w) = &self.watchdog {
            w.resume();
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fires_after_timeout_with_no_touch() {
        let (tx, rx) = oneshot::channel();
        let _wd = ActivityWatchdog::spawn(Duration::from_millis(20), tx);
        let fired = tokio::time::timeout(Duration::from_millis(200), rx).await;
        assert!(fired.is_ok());
    }

    #[tokio::test]
    async fn touch_resets_deadline_and_delays_firing() {
        let (tx, rx) = oneshot::channel();
        let wd = ActivityWatchdog::spawn(Duration::from_millis(50), tx);
        tokio::time::sleep(Duration::from_millis(30)).await;
        wd.touch();
        // Should not have fired yet at the original deadline.
        let early = tokio::time::timeout(Duration::from_millis(10), rx).await;
        assert!(early.is_err());
    }

    #[tokio::test]
    async fn pause_prevents_firing_until_resumed() {
        let (tx, rx) = oneshot::channel();
        let wd = ActivityWatchdog::spawn(Duration::from_millis(20), tx);
        wd.pause();
        let during_pause = tokio::time::timeout(Duration::from_millis(80), rx).await;
        assert!(during_pause.is_err());
        wd.resume();
    }

    #[tokio::test]
    async fn stacking_pause_requires_matching_resumes() {
        let wd_timeout = Duration::from_millis(15);
        let (tx, rx) = oneshot::channel();
        let wd = ActivityWatchdog::spawn(wd_timeout, tx);
        wd.pause();
        wd.pause();
        wd.resume();
        assert!(wd.is_paused());
        let still_paused = tokio::time::timeout(Duration::from_millis(60), rx).await;
        assert!(still_paused.is_err());
        wd.resume();
        assert!(!wd.is_paused());
    }

    #[tokio::test]
    async fn pause_guard_resumes_on_drop() {
        let (tx, rx) = oneshot::channel();
        let wd = ActivityWatchdog::spawn(Duration::from_millis(20), tx);
        {
            let _guard = WatchdogPauseGuard::new(Some(wd.clone()));
            assert!(wd.is_paused());
        }
        assert!(!wd.is_paused());
        let fired = tokio::time::timeout(Duration::from_millis(200), rx).await;
        assert!(fired.is_ok());
    }

    #[tokio::test]
    async fn none_guard_is_a_no_op() {
        let _guard = WatchdogPauseGuard::new(None);
    }
}
