//! Event sink contract and reference sinks
//!
//! Events are pushed through a non-blocking `try_publish`; a sink that
//! cannot accept an event drops its oldest entry and counts the loss.
//! The pipeline never blocks on a sink.

use crate::event::BehaviorEvent;
use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tracing::warn;

/// Destination for behavior events.
pub trait EventSink: Send + Sync {
    fn name(&self) -> &str;

    /// Push one event without blocking. Returns false when the event (or an
    /// older one, for drop-oldest sinks) was lost.
    fn try_publish(&self, event: &BehaviorEvent) -> bool;
}

/// Bounded in-memory sink with drop-oldest overflow, used by tests and the
/// visualization path.
pub struct MemorySink {
    name: String,
    capacity: usize,
    events: Mutex<VecDeque<BehaviorEvent>>,
    dropped: AtomicU64,
}

impl MemorySink {
    #[must_use]
    pub fn new(name: impl Into<String>, capacity: usize) -> Self {
        Self {
            name: name.into(),
            capacity: capacity.max(1),
            events: Mutex::new(VecDeque::with_capacity(capacity.max(1))),
            dropped: AtomicU64::new(0),
        }
    }

    /// Snapshot of the buffered events, oldest first.
    #[must_use]
    pub fn events(&self) -> Vec<BehaviorEvent> {
        self.events
            .lock()
            .map(|queue| queue.iter().cloned().collect())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.events.lock().map(|queue| queue.len()).unwrap_or(0)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl EventSink for MemorySink {
    fn name(&self) -> &str {
        &self.name
    }

    fn try_publish(&self, event: &BehaviorEvent) -> bool {
        let Ok(mut queue) = self.events.lock() else {
            return false;
        };
        let mut intact = true;
        if queue.len() >= self.capacity {
            queue.pop_front();
            self.dropped.fetch_add(1, Ordering::Relaxed);
            intact = false;
        }
        queue.push_back(event.clone());
        intact
    }
}

/// Append-only JSON Lines sink (one serialized event per line).
pub struct JsonLinesSink {
    name: String,
    writer: Mutex<BufWriter<File>>,
}

impl JsonLinesSink {
    pub fn create(name: impl Into<String>, path: &Path) -> std::io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            name: name.into(),
            writer: Mutex::new(BufWriter::new(file)),
        })
    }
}

impl EventSink for JsonLinesSink {
    fn name(&self) -> &str {
        &self.name
    }

    fn try_publish(&self, event: &BehaviorEvent) -> bool {
        let Ok(mut writer) = self.writer.lock() else {
            return false;
        };
        let serialized = match serde_json::to_string(event) {
            Ok(json) => json,
            Err(e) => {
                warn!("Failed to serialize event for sink {}: {e}", self.name);
                return false;
            }
        };
        if writeln!(writer, "{serialized}").and_then(|()| writer.flush()).is_err() {
            warn!("Failed to write event to sink {}", self.name);
            return false;
        }
        true
    }
}
