//! Throttled transfer progress reporting.
//!
//! A [`ProgressReporter`] is cheap to clone and is moved into body streams;
//! all clones share one state. Callbacks run inline on the transfer's task,
//! outside the state lock, and are never awaited.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use cloudshelf_core::types::{ProgressCallback, TransferProgress};

/// Wall-clock window over which instantaneous speed is sampled.
pub const SPEED_WINDOW: Duration = Duration::from_millis(500);

struct State {
    total: u64,
    transferred: u64,
    interval: Duration,
    last_emit: Option<Instant>,
    window_start: Instant,
    window_bytes: u64,
    speed: Option<f64>,
    finished: bool,
}

/// Shared, throttled progress emitter. A reporter without a callback is a no-op.
#[derive(Clone)]
pub struct ProgressReporter {
    callback: Option<ProgressCallback>,
    state: Arc<Mutex<State>>,
}

impl std::fmt::Debug for ProgressReporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressReporter")
            .field("enabled", &self.callback.is_some())
            .finish()
    }
}

impl ProgressReporter {
    /// Reporter for a transfer of `total` bytes (`0` when unknown).
    pub fn new(callback: Option<ProgressCallback>, total: u64, interval: Duration) -> Self {
        Self::starting_at(callback, total, interval, Instant::now())
    }

    /// Reporter that never emits.
    pub fn disabled() -> Self {
        Self::new(None, 0, Duration::ZERO)
    }

    /// Reporter with an explicit start instant.
    pub fn starting_at(
        callback: Option<ProgressCallback>,
        total: u64,
        interval: Duration,
        start: Instant,
    ) -> Self {
        Self {
            callback,
            state: Arc::new(Mutex::new(State {
                total,
                transferred: 0,
                interval,
                last_emit: None,
                window_start: start,
                window_bytes: 0,
                speed: None,
                finished: false,
            })),
        }
    }

    /// Set the total once it becomes known (e.g. from `Content-Length`).
    pub fn set_total(&self, total: u64) {
        self.lock().total = total;
    }

    /// Record `bytes` more transferred.
    pub fn advance(&self, bytes: u64) {
        self.advance_at(bytes, Instant::now());
    }

    /// Record `bytes` more transferred at `now`.
    pub fn advance_at(&self, bytes: u64, now: Instant) {
        if self.callback.is_none() {
            return;
        }

        let sample = {
            let mut state = self.lock();
            state.transferred += bytes;
            state.window_bytes += bytes;

            let window = now.saturating_duration_since(state.window_start);
            if window >= SPEED_WINDOW {
                state.speed = Some(state.window_bytes as f64 / window.as_secs_f64());
                state.window_start = now;
                state.window_bytes = 0;
            }

            let complete = state.total > 0 && state.transferred >= state.total;
            let due = state
                .last_emit
                .is_none_or(|last| now.saturating_duration_since(last) >= state.interval);

            if complete && !state.finished {
                state.finished = true;
                state.last_emit = Some(now);
                Some(sample_of(&state))
            } else if due && !complete {
                state.last_emit = Some(now);
                Some(sample_of(&state))
            } else {
                None
            }
        };

        if let (Some(sample), Some(callback)) = (sample, &self.callback) {
            callback(sample);
        }
    }

    /// Emit the final 100% report if it has not been emitted yet.
    pub fn finish(&self) {
        let sample = {
            let mut state = self.lock();
            if state.finished || self.callback.is_none() {
                return;
            }
            state.finished = true;
            if state.total == 0 {
                state.total = state.transferred;
            }
            let mut sample = sample_of(&state);
            sample.percent = 100.0;
            sample
        };
        if let Some(callback) = &self.callback {
            callback(sample);
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn sample_of(state: &State) -> TransferProgress {
    let percent = if state.total > 0 {
        (state.transferred as f64 / state.total as f64 * 100.0).min(100.0)
    } else {
        0.0
    };
    TransferProgress {
        percent,
        transferred: state.transferred,
        total: state.total,
        speed: state.speed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recorder() -> (ProgressCallback, Arc<Mutex<Vec<TransferProgress>>>) {
        let samples = Arc::new(Mutex::new(Vec::new()));
        let sink = samples.clone();
        let callback: ProgressCallback = Arc::new(move |p| sink.lock().unwrap().push(p));
        (callback, samples)
    }

    #[test]
    fn test_throttles_to_interval_and_always_reports_completion() {
        let (callback, samples) = recorder();
        let start = Instant::now();
        let reporter =
            ProgressReporter::starting_at(Some(callback), 1000, Duration::from_millis(500), start);

        // 10 chunks, 100 ms apart: emissions at 0 ms and 500 ms, then completion.
        for i in 0..10u64 {
            reporter.advance_at(100, start + Duration::from_millis(i * 100));
        }
        reporter.finish();

        let samples = samples.lock().unwrap();
        let percents: Vec<f64> = samples.iter().map(|s| s.percent).collect();
        assert_eq!(percents, [10.0, 60.0, 100.0]);
        assert_eq!(samples.last().unwrap().transferred, 1000);
    }

    #[test]
    fn test_speed_sampled_over_window() {
        let (callback, samples) = recorder();
        let start = Instant::now();
        let reporter =
            ProgressReporter::starting_at(Some(callback), 10_000, Duration::from_millis(100), start);

        reporter.advance_at(1000, start + Duration::from_millis(100));
        reporter.advance_at(1000, start + Duration::from_millis(500));

        let samples = samples.lock().unwrap();
        assert_eq!(samples[0].speed, None);
        assert_eq!(samples[1].speed, Some(4000.0));
    }

    #[test]
    fn test_finish_with_unknown_total() {
        let (callback, samples) = recorder();
        let reporter = ProgressReporter::new(Some(callback), 0, Duration::from_millis(500));
        reporter.advance(42);
        reporter.finish();
        reporter.finish();

        let samples = samples.lock().unwrap();
        assert_eq!(samples.len(), 2);
        assert_eq!(samples[1].percent, 100.0);
        assert_eq!(samples[1].total, 42);
    }
}
