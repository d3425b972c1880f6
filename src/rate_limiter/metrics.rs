//! Rolling call-volume metrics: `{total_calls, calls_by_path, window_start,
//! calls_in_window}`. Rolls every 30 seconds, emitting a rate-usage log line.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

const WINDOW: Duration = Duration::from_secs(30);

struct Inner {
    total_calls: u64,
    calls_by_path: HashMap<String, u64>,
    window_start: Instant,
    calls_in_window: u64,
}

/// Thread-safe call counters for the remote client, rolled every 30 seconds.
pub struct ApiMetrics {
    inner: Mutex<Inner>,
}

impl ApiMetrics {
    /// Start a fresh metrics window beginning now.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                total_calls: 0,
                calls_by_path: HashMap::new(),
                window_start: Instant::now(),
                calls_in_window: 0,
            }),
        }
    }

    /// Record one outbound call to `path`, rolling the window and emitting
    /// a log line when 30 seconds have elapsed since the last roll.
    pub fn record_call(&self, path: &str) {
        let mut inner = self.inner.lock().expect("metrics mutex poisoned");
        inner.total_calls += 1;
        inner.calls_in_window += 1;
        *inner.calls_by_path.entry(path.to_string()).or_insert(0) += 1;

        if inner.window_start.elapsed() >= WINDOW {
            tracing::info!(
                calls_in_window = inner.calls_in_window,
                total_calls = inner.total_calls,
                "remote API call volume"
            );
            inner.window_start = Instant::now();
            inner.calls_in_window = 0;
        }
    }

    /// Total calls made since this metrics instance was created.
    pub fn total_calls(&self) -> u64 {
        self.inner.lock().expect("metrics mutex poisoned").total_calls
    }

    /// Calls made to one specific path.
    pub fn calls_for_path(&self, path: &str) -> u64 {
        self.inner
            .lock()
            .expect("metrics mutex poisoned")
            .calls_by_path
            .get(path)
            .copied()
            .unwrap_or(0)
    }
}

impl Default for ApiMetrics {
    fn default() -> Self {
        Self::new()
    }
}
