//! Diagnostic replay log of routed messages.
//!
//! An explicit handle passed in through the conductor's config rather than
//! process-wide state. Entries are handed to a writer task over an
//! unbounded channel, one JSON object per line, so recording never blocks
//! the routing loop on write completion.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::io::{AsyncWrite, AsyncWriteExt, BufWriter};
use tokio::sync::mpsc;
use tracing::warn;

use crate::wire::WireMessage;

/// Which way a message was moving when it was recorded.
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Direction {
    LeftToRight,
    RightToLeft,
}

#[derive(Debug, Serialize)]
struct LogEntry<'a> {
    ts: DateTime<Utc>,
    direction: Direction,
    endpoint: &'a str,
    message: &'a WireMessage,
}

/// Cloneable recording handle. Dropping every clone ends the writer task
/// after it drains.
#[derive(Debug, Clone)]
pub struct MessageLog {
    tx: mpsc::UnboundedSender<String>,
}

impl MessageLog {
    /// Log to any async writer (a file, a pipe, a test buffer).
    pub fn to_writer(writer: impl AsyncWrite + Send + Unpin + 'static) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        tokio::spawn(async move {
            let mut writer = BufWriter::new(writer);
            while let Some(line) = rx.recv().await {
                if writer.write_all(line.as_bytes()).await.is_err() {
                    break;
                }
                if writer.write_all(b"\n").await.is_err() {
                    break;
                }
                // Flush per entry: replay logs are for post-mortems, a
                // partially buffered tail defeats the point.
                if writer.flush().await.is_err() {
                    break;
                }
            }
        });
        Self { tx }
    }

    /// Append one entry. Never blocks; a failed append is logged and
    /// otherwise ignored.
    pub fn record(&self, direction: Direction, endpoint: &str, message: &WireMessage) {
        let entry = LogEntry {
            ts: Utc::now(),
            direction,
            endpoint,
            message,
        };
        match serde_json::to_string(&entry) {
            Ok(line) => {
                let _ = self.tx.send(line);
            }
            Err(err) => warn!(%err, "failed to serialize message log entry"),
        }
    }
}
