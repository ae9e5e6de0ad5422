//! Bounded console log of captured process output.

use std::collections::VecDeque;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;

/// Capacity of the live subscription channel. Slow subscribers lag and
/// skip lines instead of blocking the output reader.
const SUBSCRIBER_CAPACITY: usize = 256;

/// One captured output line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogLine {
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    pub text: String,
}

#[derive(Debug, Default)]
struct Lines {
    entries: VecDeque<Arc<LogLine>>,
    next_seq: u64,
}

/// Fixed-capacity ring buffer of console lines.
///
/// Appends come from the single output reader task. Readers clone the
/// `Arc`s under a short read lock, so a snapshot never waits on I/O and
/// always reflects every append that completed before it.
#[derive(Debug)]
pub struct ConsoleLogBuffer {
    lines: RwLock<Lines>,
    capacity: usize,
    tx: broadcast::Sender<Arc<LogLine>>,
}

impl ConsoleLogBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (tx, _) = broadcast::channel(SUBSCRIBER_CAPACITY);
        Self {
            lines: RwLock::new(Lines {
                entries: VecDeque::with_capacity(capacity),
                next_seq: 0,
            }),
            capacity,
            tx,
        }
    }

    /// Append a line, evicting the oldest one when full.
    pub fn append(&self, text: impl Into<String>) -> u64 {
        let line = {
            let mut lines = self.lines.write().unwrap_or_else(|e| e.into_inner());
            let line = Arc::new(LogLine {
                seq: lines.next_seq,
                timestamp: Utc::now(),
                text: text.into(),
            });
            lines.next_seq += 1;
            if lines.entries.len() == self.capacity {
                lines.entries.pop_front();
            }
            lines.entries.push_back(line.clone());
            line
        };

        let seq = line.seq;
        // No receivers is fine.
        let _ = self.tx.send(line);
        seq
    }

    /// Current contents as text, oldest first.
    pub fn snapshot(&self) -> Vec<String> {
        self.records()
            .into_iter()
            .map(|line| line.text.clone())
            .collect()
    }

    /// The last `n` lines, oldest first.
    pub fn tail(&self, n: usize) -> Vec<String> {
        let records = self.records();
        let skip = records.len().saturating_sub(n);
        records
            .into_iter()
            .skip(skip)
            .map(|line| line.text.clone())
            .collect()
    }

    /// Full records including sequence numbers and timestamps.
    pub fn lines(&self) -> Vec<LogLine> {
        self.records()
            .into_iter()
            .map(|line| LogLine::clone(&line))
            .collect()
    }

    /// Receive lines appended from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<LogLine>> {
        self.tx.subscribe()
    }

    pub fn len(&self) -> usize {
        self.lines
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .entries
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn records(&self) -> Vec<Arc<LogLine>> {
        let lines = self.lines.read().unwrap_or_else(|e| e.into_inner());
        lines.entries.iter().cloned().collect()
    }
}
