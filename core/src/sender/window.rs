//! Per-relay adaptive flow control.
//!
//! Each relay session owns a small in-flight limit that grows on every
//! successful slot acquisition and shrinks when acquisition times out.
//! The controller is plain state updated on acquire outcomes; the pool
//! around it turns that state into awaitable permits.

use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::timeout;

use crate::error::{Error, Result};

/// How long a slot acquisition may wait before the relay is considered
/// slow and the limit is halved.
pub(crate) const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(1);

/// Additive-increase / multiplicative-decrease window state for one
/// relay session.
///
/// The limit starts at 1 in slow-start. Each successful acquire doubles
/// it while slow-start lasts and adds one afterwards; crossing the cap
/// clamps the limit and leaves slow-start for good. A timed-out acquire
/// halves the limit, floor 1.
#[derive(Debug)]
pub struct WindowController {
    limit: usize,
    cap: usize,
    slow_start: bool,
}

impl WindowController {
    /// Creates a controller capped at `cap` in-flight frames.
    pub fn new(cap: usize) -> Self {
        Self {
            limit: 1,
            cap: cap.max(1),
            slow_start: true,
        }
    }

    /// Current in-flight limit.
    pub fn limit(&self) -> usize {
        self.limit
    }

    /// True while the window is still in slow-start.
    pub fn in_slow_start(&self) -> bool {
        self.slow_start
    }

    /// Grows the limit after a successful acquire.
    pub fn on_acquire(&mut self) {
        if self.limit >= self.cap {
            return;
        }
        if self.slow_start {
            self.limit *= 2;
        } else {
            self.limit += 1;
        }
        if self.limit > self.cap {
            self.slow_start = false;
            self.limit = self.cap;
        }
    }

    /// Halves the limit after an acquire timeout.
    pub fn on_timeout(&mut self) {
        self.limit = (self.limit / 2).max(1);
    }
}

#[derive(Debug)]
struct FlightState {
    ctl: WindowController,
    in_flight: usize,
    closed: bool,
}

/// Awaitable permit pool driven by a [`WindowController`].
///
/// One instance per relay session; a slow relay shrinks only its own
/// window.
#[derive(Debug)]
pub(crate) struct FlightWindow {
    state: Mutex<FlightState>,
    notify: Notify,
}

impl FlightWindow {
    pub(crate) fn new(cap: usize) -> Self {
        Self {
            state: Mutex::new(FlightState {
                ctl: WindowController::new(cap),
                in_flight: 0,
                closed: false,
            }),
            notify: Notify::new(),
        }
    }

    /// Acquires one in-flight slot, applying window growth on success and
    /// halving on every [`ACQUIRE_TIMEOUT`] spent waiting.
    pub(crate) async fn acquire(&self) -> Result<()> {
        loop {
            {
                let mut st = self.state.lock().unwrap();
                if st.closed {
                    return Err(Error::SessionClosed);
                }
                if st.in_flight < st.ctl.limit() {
                    st.in_flight += 1;
                    st.ctl.on_acquire();
                    return Ok(());
                }
            }

            if timeout(ACQUIRE_TIMEOUT, self.notify.notified()).await.is_err() {
                self.state.lock().unwrap().ctl.on_timeout();
            }
        }
    }

    /// Returns one slot to the pool.
    pub(crate) fn release(&self) {
        let mut st = self.state.lock().unwrap();
        st.in_flight = st.in_flight.saturating_sub(1);
        drop(st);
        self.notify.notify_one();
    }

    /// Fails current and future acquires.
    pub(crate) fn close(&self) {
        self.state.lock().unwrap().closed = true;
        self.notify.notify_waiters();
    }

    #[cfg(test)]
    pub(crate) fn limit(&self) -> usize {
        self.state.lock().unwrap().ctl.limit()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slow_start_doubles_until_cap() {
        let mut ctl = WindowController::new(16);

        let mut seen = vec![ctl.limit()];
        for _ in 0..5 {
            ctl.on_acquire();
            seen.push(ctl.limit());
        }
        assert_eq!(seen, vec![1, 2, 4, 8, 16, 16]);
    }

    #[test]
    fn test_crossing_cap_leaves_slow_start() {
        let mut ctl = WindowController::new(5);

        ctl.on_acquire(); // 2
        ctl.on_acquire(); // 4
        assert!(ctl.in_slow_start());
        ctl.on_acquire(); // 8 -> clamped to 5
        assert_eq!(ctl.limit(), 5);
        assert!(!ctl.in_slow_start());
    }

    #[test]
    fn test_additive_growth_after_slow_start() {
        let mut ctl = WindowController::new(5);

        ctl.on_acquire();
        ctl.on_acquire();
        ctl.on_acquire(); // leaves slow-start at the cap
        ctl.on_timeout(); // 2
        assert_eq!(ctl.limit(), 2);

        ctl.on_acquire();
        assert_eq!(ctl.limit(), 3);
        ctl.on_acquire();
        assert_eq!(ctl.limit(), 4);
    }

    #[test]
    fn test_timeout_halves_with_floor_one() {
        let mut ctl = WindowController::new(8);

        ctl.on_timeout();
        assert_eq!(ctl.limit(), 1);

        ctl.on_acquire(); // 2
        ctl.on_acquire(); // 4
        ctl.on_timeout();
        assert_eq!(ctl.limit(), 2);
        ctl.on_timeout();
        assert_eq!(ctl.limit(), 1);
        ctl.on_timeout();
        assert_eq!(ctl.limit(), 1);
    }

    #[test]
    fn test_cap_floor_is_one() {
        let ctl = WindowController::new(0);
        assert_eq!(ctl.limit(), 1);
    }

    #[tokio::test]
    async fn test_flight_window_acquire_release() {
        let win = FlightWindow::new(4);

        win.acquire().await.unwrap(); // limit 1 -> 2
        win.acquire().await.unwrap(); // limit 2 -> 4
        assert_eq!(win.limit(), 4);

        win.release();
        win.release();
        win.acquire().await.unwrap();
        win.release();
    }

    #[tokio::test(start_paused = true)]
    async fn test_flight_window_timeout_shrinks() {
        let win = std::sync::Arc::new(FlightWindow::new(4));

        for _ in 0..4 {
            win.acquire().await.unwrap();
        }
        assert_eq!(win.limit(), 4);

        // pool exhausted: the pending acquire shrinks the limit once per
        // second until a release lets it through
        let w2 = win.clone();
        let pending = tokio::spawn(async move { w2.acquire().await });

        tokio::time::sleep(Duration::from_millis(2500)).await;
        assert_eq!(win.limit(), 1); // halved twice while starved

        // drain in-flight below the shrunken limit so the waiter gets in
        for _ in 0..4 {
            win.release();
        }
        pending.await.unwrap().unwrap();
        assert_eq!(win.limit(), 2); // the granted slot grew the window again
    }

    #[tokio::test]
    async fn test_flight_window_close_fails_acquire() {
        let win = FlightWindow::new(2);
        win.close();
        assert!(matches!(win.acquire().await, Err(Error::SessionClosed)));
    }
}
