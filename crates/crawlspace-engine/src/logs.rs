//! Per-run log pipeline.
//!
//! Each run owns a capped ring in the coordination store plus a pub/sub
//! channel `logs:<run_id>`. Appends go to both; subscribers first replay the
//! most recent [`REPLAY_COUNT`] entries, then receive live appends without
//! duplicates within that continuity. Duplicates are possible only across a
//! subscriber reconnect; clients must tolerate them.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use crawlspace_core::{CoordStore, RunId};

use crate::error::Result;

/// Maximum entries retained per run.
pub const LOG_CAP: usize = 1000;

/// Ring expiry, measured from the last append.
pub const LOG_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Entries replayed to a fresh subscriber.
pub const REPLAY_COUNT: usize = 50;

/// Severity of a log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    /// Diagnostic detail.
    Debug,
    /// Routine progress.
    Info,
    /// Something unexpected but survivable.
    Warn,
    /// A failure.
    Error,
}

impl LogLevel {
    /// Classifies a log line by content, falling back to `fallback`.
    ///
    /// Recognizes a leading severity token as produced by the common SDK log
    /// formats, e.g. `ERROR something broke`.
    #[must_use]
    pub fn classify(line: &str, fallback: Self) -> Self {
        let trimmed = line.trim_start();
        for (token, level) in [
            ("DEBUG", Self::Debug),
            ("INFO", Self::Info),
            ("WARN", Self::Warn),
            ("ERROR", Self::Error),
        ] {
            if let Some(rest) = trimmed.strip_prefix(token) {
                if rest.is_empty() || rest.starts_with([' ', ':', '\t']) {
                    return level;
                }
            }
        }
        fallback
    }
}

/// One log line attributed to a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// When the entry was recorded.
    pub timestamp: DateTime<Utc>,
    /// Severity.
    pub level: LogLevel,
    /// The line, without trailing newline.
    pub message: String,
}

impl LogEntry {
    /// Creates an entry stamped with the current time.
    #[must_use]
    pub fn now(level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            level,
            message: message.into(),
        }
    }
}

/// Payload published on the per-run channel; the sequence number lets
/// subscribers splice replay and live delivery without duplicates.
#[derive(Debug, Serialize, Deserialize)]
struct Published {
    seq: u64,
    entry: LogEntry,
}

/// A boxed stream of log entries.
pub type LogStream = Pin<Box<dyn Stream<Item = LogEntry> + Send>>;

/// Log pipeline over the coordination store.
#[derive(Clone)]
pub struct LogPipeline {
    coord: Arc<dyn CoordStore>,
}

impl std::fmt::Debug for LogPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogPipeline").finish_non_exhaustive()
    }
}

fn channel_name(run_id: &RunId) -> String {
    format!("logs:{run_id}")
}

impl LogPipeline {
    /// Creates a pipeline over the given coordination store.
    #[must_use]
    pub fn new(coord: Arc<dyn CoordStore>) -> Self {
        Self { coord }
    }

    /// Appends an entry to the run's ring and fans it out to subscribers.
    pub async fn append(&self, run_id: &RunId, entry: LogEntry) -> Result<()> {
        let name = channel_name(run_id);
        let encoded = serde_json::to_vec(&entry).map_err(|e| {
            crate::error::EngineError::internal(format!("encode log entry: {e}"))
        })?;
        let seq = self
            .coord
            .ring_append(&name, Bytes::from(encoded), LOG_CAP, LOG_TTL)
            .await?;
        let published = serde_json::to_vec(&Published { seq, entry }).map_err(|e| {
            crate::error::EngineError::internal(format!("encode log frame: {e}"))
        })?;
        self.coord.publish(&name, Bytes::from(published)).await?;
        Ok(())
    }

    /// Returns a slice of the ring in append order.
    pub async fn fetch(&self, run_id: &RunId, offset: usize, limit: usize) -> Result<Vec<LogEntry>> {
        let raw = self
            .coord
            .ring_range(&channel_name(run_id), offset, limit)
            .await?;
        raw.into_iter()
            .map(|(_, bytes)| {
                serde_json::from_slice(&bytes).map_err(|e| {
                    crate::error::EngineError::internal(format!("decode log entry: {e}"))
                })
            })
            .collect()
    }

    /// Returns the number of retained entries.
    pub async fn len(&self, run_id: &RunId) -> Result<usize> {
        Ok(self.coord.ring_len(&channel_name(run_id)).await?)
    }

    /// Subscribes to a run's log stream.
    ///
    /// The stream replays the most recent [`REPLAY_COUNT`] entries, then
    /// delivers subsequent appends in order. Entries already covered by the
    /// replay are filtered out of the live tail.
    pub async fn subscribe(&self, run_id: &RunId) -> Result<LogStream> {
        let name = channel_name(run_id);

        // Subscribe before reading the tail so nothing falls in the gap;
        // anything delivered both ways is filtered by sequence number below.
        let live = self.coord.subscribe(&name).await?;
        let tail = self.coord.ring_tail(&name, REPLAY_COUNT).await?;

        let last_replayed = tail.last().map(|(seq, _)| *seq);
        let replay: Vec<LogEntry> = tail
            .into_iter()
            .filter_map(|(_, bytes)| serde_json::from_slice(&bytes).ok())
            .collect();

        let live = live.filter_map(move |payload: Bytes| async move {
            serde_json::from_slice::<Published>(&payload).ok()
        });
        let live = live.filter_map(move |published| async move {
            match last_replayed {
                Some(last) if published.seq <= last => None,
                _ => Some(published.entry),
            }
        });

        Ok(Box::pin(futures::stream::iter(replay).chain(live)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crawlspace_core::MemoryCoordStore;

    fn pipeline() -> LogPipeline {
        LogPipeline::new(Arc::new(MemoryCoordStore::new()))
    }

    #[tokio::test]
    async fn append_then_fetch_preserves_order() {
        let logs = pipeline();
        let run = RunId::generate();
        for i in 0..3 {
            logs.append(&run, LogEntry::now(LogLevel::Info, format!("line {i}")))
                .await
                .unwrap();
        }

        let entries = logs.fetch(&run, 0, 10).await.unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].message, "line 0");
        assert_eq!(entries[2].message, "line 2");

        let page = logs.fetch(&run, 1, 1).await.unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].message, "line 1");
    }

    #[tokio::test]
    async fn ring_at_cap_drops_oldest() {
        let logs = pipeline();
        let run = RunId::generate();
        for i in 0..=LOG_CAP {
            logs.append(&run, LogEntry::now(LogLevel::Info, format!("line {i}")))
                .await
                .unwrap();
        }

        assert_eq!(logs.len(&run).await.unwrap(), LOG_CAP);
        let entries = logs.fetch(&run, 0, 1).await.unwrap();
        assert_eq!(entries[0].message, "line 1");
    }

    #[tokio::test]
    async fn subscribe_replays_then_streams_live() {
        let logs = pipeline();
        let run = RunId::generate();
        for i in 0..3 {
            logs.append(&run, LogEntry::now(LogLevel::Info, format!("early {i}")))
                .await
                .unwrap();
        }

        let mut stream = logs.subscribe(&run).await.unwrap();
        for i in 0..3 {
            let entry = stream.next().await.unwrap();
            assert_eq!(entry.message, format!("early {i}"));
        }

        logs.append(&run, LogEntry::now(LogLevel::Warn, "late"))
            .await
            .unwrap();
        let entry = stream.next().await.unwrap();
        assert_eq!(entry.message, "late");
        assert_eq!(entry.level, LogLevel::Warn);
    }

    #[tokio::test]
    async fn subscribe_caps_replay() {
        let logs = pipeline();
        let run = RunId::generate();
        for i in 0..(REPLAY_COUNT + 10) {
            logs.append(&run, LogEntry::now(LogLevel::Info, format!("line {i}")))
                .await
                .unwrap();
        }

        let mut stream = logs.subscribe(&run).await.unwrap();
        let first = stream.next().await.unwrap();
        assert_eq!(first.message, "line 10");
    }

    #[test]
    fn classification_recognizes_leading_tokens() {
        assert_eq!(
            LogLevel::classify("ERROR boom", LogLevel::Info),
            LogLevel::Error
        );
        assert_eq!(
            LogLevel::classify("  WARN: slow response", LogLevel::Info),
            LogLevel::Warn
        );
        assert_eq!(
            LogLevel::classify("DEBUG details", LogLevel::Info),
            LogLevel::Debug
        );
        assert_eq!(
            LogLevel::classify("ERRORS are not a token", LogLevel::Info),
            LogLevel::Info
        );
        assert_eq!(
            LogLevel::classify("plain line", LogLevel::Error),
            LogLevel::Error
        );
    }
}
