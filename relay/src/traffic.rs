//! Daily traffic accounting against a byte cap.
//!
//! Every spliced byte is charged to an atomic counter. The add that
//! crosses the cap fires the exceed signal exactly once; a sampling loop
//! notices local calendar-day rollover, resets the counter, and fires the
//! restore signal if the cap had been hit since the last reset.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use chrono::{Local, NaiveDate};
use tokio::sync::mpsc;

/// Interval at which day rollover is sampled.
const ROLLOVER_SAMPLE: Duration = Duration::from_secs(5);

/// Byte counter with a daily cap.
pub struct TrafficMeter {
    count: AtomicU64,
    cap: u64,
    exceed_tx: mpsc::Sender<()>,
    exceed_rx: Mutex<Option<mpsc::Receiver<()>>>,
}

impl TrafficMeter {
    /// Creates a meter; `cap` of 0 means unlimited.
    pub fn new(cap: u64) -> Self {
        let cap = if cap == 0 { u64::MAX } else { cap };
        let (exceed_tx, exceed_rx) = mpsc::channel(1);
        Self {
            count: AtomicU64::new(0),
            cap,
            exceed_tx,
            exceed_rx: Mutex::new(Some(exceed_rx)),
        }
    }

    /// Charges `n` bytes. Only the charge that crosses the cap fires
    /// the exceed signal.
    pub fn add(&self, n: u64) {
        let new = self.count.fetch_add(n, Ordering::Relaxed) + n;
        if new - n < self.cap && new >= self.cap {
            let _ = self.exceed_tx.try_send(());
        }
    }

    /// Bytes charged since the last daily reset.
    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    /// Drives cap enforcement until the process exits. `on_exceed` runs
    /// when the cap is crossed; `on_restore` runs on the first sample in
    /// a new local calendar day if the cap had been crossed.
    pub async fn run(&self, on_exceed: impl Fn(), on_restore: impl Fn()) {
        let mut exceed_rx = match self.exceed_rx.lock().unwrap().take() {
            Some(rx) => rx,
            None => return,
        };
        let mut rollover = Rollover::new(Local::now().date_naive());

        loop {
            tokio::select! {
                _ = exceed_rx.recv() => {
                    rollover.exceed();
                    on_exceed();
                }
                _ = tokio::time::sleep(ROLLOVER_SAMPLE) => {
                    if let Some(restore) = rollover.tick(Local::now().date_naive()) {
                        self.count.store(0, Ordering::Relaxed);
                        if restore {
                            on_restore();
                        }
                    }
                }
            }
        }
    }
}

/// Day-rollover bookkeeping, separated from the clock for testing.
struct Rollover {
    last_day: NaiveDate,
    exceeded: bool,
}

impl Rollover {
    fn new(today: NaiveDate) -> Self {
        Self {
            last_day: today,
            exceeded: false,
        }
    }

    fn exceed(&mut self) {
        self.exceeded = true;
    }

    /// On a new day returns Some(restore) where `restore` says whether
    /// the cap had been crossed since the last reset; None otherwise.
    fn tick(&mut self, today: NaiveDate) -> Option<bool> {
        if today <= self.last_day {
            return None;
        }
        self.last_day = today;
        Some(std::mem::take(&mut self.exceeded))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exceed_fires_exactly_once_per_crossing() {
        let meter = TrafficMeter::new(100);
        let mut rx = meter.exceed_rx.lock().unwrap().take().unwrap();

        meter.add(60);
        assert!(rx.try_recv().is_err());

        meter.add(60); // crosses 100
        assert!(rx.try_recv().is_ok());

        meter.add(60); // already over, no second signal
        meter.add(60);
        assert!(rx.try_recv().is_err());
        assert_eq!(meter.count(), 240);
    }

    #[test]
    fn test_exact_boundary_counts_as_crossing() {
        let meter = TrafficMeter::new(100);
        let mut rx = meter.exceed_rx.lock().unwrap().take().unwrap();

        meter.add(100);
        assert!(rx.try_recv().is_ok());
    }

    #[test]
    fn test_zero_cap_means_unlimited() {
        let meter = TrafficMeter::new(0);
        let mut rx = meter.exceed_rx.lock().unwrap().take().unwrap();

        meter.add(u64::MAX / 2);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_rollover_restores_only_after_exceed() {
        let day1 = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
        let day2 = NaiveDate::from_ymd_opt(2024, 3, 2).unwrap();
        let day3 = NaiveDate::from_ymd_opt(2024, 3, 3).unwrap();

        let mut rollover = Rollover::new(day1);
        assert_eq!(rollover.tick(day1), None);

        rollover.exceed();
        assert_eq!(rollover.tick(day1), None);
        assert_eq!(rollover.tick(day2), Some(true));

        // next day without an exceed resets the count but not the client
        assert_eq!(rollover.tick(day3), Some(false));
    }
}
