//! Background tickers: cron-scheduled restarts and fixed-interval sampling.
use chrono::{DateTime, Local, TimeZone};
use cron::Schedule;
use std::{
    sync::mpsc::{self, RecvTimeoutError, Sender},
    thread,
    time::Duration,
};
use tracing::debug;

/// Keeps a ticker thread alive; dropping it stops the thread promptly.
pub struct Ticker {
    _cancel: Sender<()>,
}

impl Ticker {
    /// Calls `on_tick` after each delay yielded by `next_delay` until either returns
    /// `None`/`false` or the ticker is dropped.
    pub fn spawn<D, F>(label: String, mut next_delay: D, mut on_tick: F) -> Self
    where
        D: FnMut() -> Option<Duration> + Send + 'static,
        F: FnMut() -> bool + Send + 'static,
    {
        let (cancel, cancelled) = mpsc::channel::<()>();
        thread::spawn(move || {
            while let Some(delay) = next_delay() {
                match cancelled.recv_timeout(delay) {
                    Err(RecvTimeoutError::Timeout) => {
                        if !on_tick() {
                            break;
                        }
                    }
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            }
            debug!("Ticker '{label}' stopped");
        });
        Self { _cancel: cancel }
    }

    /// Fires every `interval`.
    pub fn every<F>(label: String, interval: Duration, on_tick: F) -> Self
    where
        F: FnMut() -> bool + Send + 'static,
    {
        Self::spawn(label, move || Some(interval), on_tick)
    }

    /// Fires at each upcoming occurrence of `schedule` in local time.
    pub fn cron<F>(label: String, schedule: Schedule, on_tick: F) -> Self
    where
        F: FnMut() -> bool + Send + 'static,
    {
        Self::spawn(label, move || next_fire_delay(&schedule, Local::now()), on_tick)
    }
}

/// Time from `now` until the schedule's next occurrence.
pub fn next_fire_delay<Tz: TimeZone>(schedule: &Schedule, now: DateTime<Tz>) -> Option<Duration> {
    let next = schedule.after(&now).next()?;
    (next - now).to_std().ok()
}
