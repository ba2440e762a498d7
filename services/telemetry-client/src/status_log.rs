use std::collections::VecDeque;
use std::fmt::{self, Display};
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;

const FEED_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

/// One operator-facing connection log line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogEntry {
    pub at: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
}

impl Display for LogEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.at.format("%H:%M:%S"), self.message)
    }
}

/// Timestamped connection log: mirrored to tracing, broadcast to live
/// subscribers, and kept in a bounded ring buffer for late readers.
pub struct StatusLog {
    tx: broadcast::Sender<LogEntry>,
    buffer: RwLock<VecDeque<LogEntry>>,
    max_entries: usize,
}

impl StatusLog {
    pub fn new(max_entries: usize) -> Self {
        let (tx, _) = broadcast::channel(FEED_CAPACITY);
        Self {
            tx,
            buffer: RwLock::new(VecDeque::with_capacity(max_entries)),
            max_entries,
        }
    }

    pub fn log_at(&self, level: LogLevel, msg: impl Display) {
        let entry = LogEntry {
            at: Utc::now(),
            level,
            message: msg.to_string(),
        };
        match level {
            LogLevel::Info => tracing::info!("{}", entry.message),
            LogLevel::Warn => tracing::warn!("{}", entry.message),
            LogLevel::Error => tracing::error!("{}", entry.message),
        }
        if let Ok(mut entries) = self.buffer.write() {
            entries.push_back(entry.clone());
            while entries.len() > self.max_entries {
                entries.pop_front();
            }
        }
        let _ = self.tx.send(entry);
    }

    /// Oldest-first snapshot of the buffered entries.
    pub fn entries(&self) -> Vec<LogEntry> {
        self.buffer
            .read()
            .map(|b| b.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LogEntry> {
        self.tx.subscribe()
    }
}
