//! Fixed-capacity circular buffer of structured log entries.
//!
//! Fed by a [`tracing_subscriber::Layer`] implementation so every
//! `tracing::info!`/`warn!`/etc. call site across the crate ends up on the
//! ring without needing a direct reference to it. Served to IPC clients via
//! `GetRecentLogs` and `SubscribeLogs`; lossy for slow subscribers, never
//! blocks producers.

use crate::types::{LogEntry, LogLevel};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tokio::sync::mpsc;
use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::Context;
use tracing_subscriber::Layer;

/// Bounded channel capacity for one IPC log subscriber.
const SUBSCRIBER_CHANNEL_CAPACITY: usize = 100;

struct RingInner {
    entries: VecDeque<LogEntry>,
    capacity: usize,
}

/// Fixed-capacity ring of [`LogEntry`] values with push subscriptions.
pub struct LogRing {
    ring: Mutex<RingInner>,
    subscribers: Mutex<HashMap<u64, mpsc::Sender<LogEntry>>>,
    next_subscriber_id: AtomicU64,
}

impl LogRing {
    /// Build a ring holding at most `capacity` entries.
    pub fn new(capacity: usize) -> Self {
        Self {
            ring: Mutex::new(RingInner {
                entries: VecDeque::with_capacity(capacity),
                capacity,
            }),
            subscribers: Mutex::new(HashMap::new()),
            next_subscriber_id: AtomicU64::new(0),
        }
    }

    /// Push one entry, evicting the oldest if the ring is full, then fan out
    /// to every subscriber without blocking — a full subscriber channel just
    /// drops this entry for that one subscriber.
    pub fn add(&self, entry: LogEntry) {
        {
            let mut ring = self.ring.lock().expect("log ring mutex poisoned");
            if ring.entries.len() >= ring.capacity {
                ring.entries.pop_front();
            }
            ring.entries.push_back(entry.clone());
        }

        let subscribers = self.subscribers.lock().expect("subscriber map mutex poisoned");
        for sender in subscribers.values() {
            let _ = sender.try_send(entry.clone());
        }
    }

    /// The `n` most recent entries, oldest-first within that window.
    pub fn recent(&self, n: usize) -> Vec<LogEntry> {
        let ring = self.ring.lock().expect("log ring mutex poisoned");
        let skip = ring.entries.len().saturating_sub(n);
        ring.entries.iter().skip(skip).cloned().collect()
    }

    /// Subscribe to future entries. Returns a subscriber id (for
    /// `unsubscribe`) and the receiving half of a bounded channel.
    pub fn subscribe(&self) -> (u64, mpsc::Receiver<LogEntry>) {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_CHANNEL_CAPACITY);
        let id = self.next_subscriber_id.fetch_add(1, Ordering::SeqCst);
        self.subscribers
            .lock()
            .expect("subscriber map mutex poisoned")
            .insert(id, tx);
        (id, rx)
    }

    /// Drop a subscriber registered with [`Self::subscribe`].
    pub fn unsubscribe(&self, id: u64) {
        self.subscribers
            .lock()
            .expect("subscriber map mutex poisoned")
            .remove(&id);
    }

    /// Drop every buffered entry. Subscribers are left connected.
    pub fn clear(&self) {
        self.ring.lock().expect("log ring mutex poisoned").entries.clear();
    }

    /// Number of entries currently buffered.
    pub fn len(&self) -> usize {
        self.ring.lock().expect("log ring mutex poisoned").entries.len()
    }

    /// Whether the ring is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A [`tracing_subscriber::Layer`] that turns every event into a
/// [`LogEntry`] and pushes it onto a shared [`LogRing`]. Install alongside
/// the process's `fmt` layer; this layer never formats to stdout itself.
pub struct LogRingLayer {
    ring: std::sync::Arc<LogRing>,
}

impl LogRingLayer {
    /// Build a layer that feeds `ring`.
    pub fn new(ring: std::sync::Arc<LogRing>) -> Self {
        Self { ring }
    }
}

#[derive(Default)]
struct FieldVisitor {
    message: Option<String>,
    stage: Option<String>,
    fields: HashMap<String, String>,
}

impl Visit for FieldVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        let rendered = format!("{value:?}");
        match field.name() {
            "message" => self.message = Some(rendered),
            "stage" => self.stage = Some(rendered.trim_matches('"').to_string()),
            name => {
                self.fields
                    .insert(name.to_string(), rendered.trim_matches('"').to_string());
            }
        }
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        match field.name() {
            "message" => self.message = Some(value.to_string()),
            "stage" => self.stage = Some(value.to_string()),
            name => {
                self.fields.insert(name.to_string(), value.to_string());
            }
        }
    }
}

impl<S: Subscriber> Layer<S> for LogRingLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut visitor = FieldVisitor::default();
        event.record(&mut visitor);

        let level = match *event.metadata().level() {
            tracing::Level::ERROR => LogLevel::Error,
            tracing::Level::WARN => LogLevel::Warn,
            tracing::Level::INFO => LogLevel::Info,
            _ => LogLevel::Debug,
        };

        self.ring.add(LogEntry {
            timestamp: chrono::Utc::now(),
            level,
            stage: visitor.stage.unwrap_or_else(|| event.metadata().target().to_string()),
            message: visitor.message.unwrap_or_default(),
            fields: visitor.fields,
        });
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn entry(message: &str) -> LogEntry {
        LogEntry {
            timestamp: Utc::now(),
            level: LogLevel::Info,
            stage: "scan".to_string(),
            message: message.to_string(),
            fields: HashMap::new(),
        }
    }

    #[test]
    fn ring_evicts_oldest_when_full() {
        let ring = LogRing::new(3);
        ring.add(entry("one"));
        ring.add(entry("two"));
        ring.add(entry("three"));
        ring.add(entry("four"));

        let recent = ring.recent(10);
        assert_eq!(recent.len(), 3);
        assert_eq!(recent[0].message, "two");
        assert_eq!(recent[2].message, "four");
    }

    #[test]
    fn recent_respects_requested_count() {
        let ring = LogRing::new(10);
        for i in 0..5 {
            ring.add(entry(&format!("msg{i}")));
        }
        let recent = ring.recent(2);
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].message, "msg3");
        assert_eq!(recent[1].message, "msg4");
    }

    #[tokio::test]
    async fn subscriber_receives_entries_pushed_after_subscribing() {
        let ring = LogRing::new(10);
        let (_id, mut rx) = ring.subscribe();
        ring.add(entry("hello"));

        let received = rx.recv().await.unwrap();
        assert_eq!(received.message, "hello");
    }

    #[tokio::test]
    async fn unsubscribe_stops_further_delivery() {
        let ring = LogRing::new(10);
        let (id, mut rx) = ring.subscribe();
        ring.unsubscribe(id);
        ring.add(entry("after unsubscribe"));

        // Channel should be closed (sender dropped from map); recv returns None
        // immediately once any buffered messages (none, here) are drained.
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn clear_empties_the_ring_but_keeps_capacity() {
        let ring = LogRing::new(5);
        ring.add(entry("one"));
        ring.add(entry("two"));
        ring.clear();
        assert!(ring.is_empty());
        ring.add(entry("three"));
        assert_eq!(ring.len(), 1);
    }

    #[tokio::test]
    async fn full_subscriber_channel_drops_entries_without_blocking_producer() {
        let ring = LogRing::new(200);
        let (_id, _rx) = ring.subscribe();
        // Never read from _rx: push past capacity and confirm add() doesn't hang.
        for i in 0..(SUBSCRIBER_CHANNEL_CAPACITY + 20) {
            ring.add(entry(&format!("msg{i}")));
        }
        assert_eq!(ring.len(), 200.min(SUBSCRIBER_CHANNEL_CAPACITY + 20));
    }
}
