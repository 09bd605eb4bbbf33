//! Best-effort activity telemetry
//!
//! Fire-and-forget `(unit_id, event_kind, timestamp, payload)` events over
//! a bounded channel to a JSONL writer task. If the channel is full or the
//! writer is gone, events are dropped: the sink must never block or fail
//! the scheduling loop.

use std::path::PathBuf;

use serde::Serialize;
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// One activity event
#[derive(Debug, Clone, Serialize)]
pub struct ActivityEvent {
    pub unit_id: String,
    pub event_kind: String,
    pub timestamp: String,
    pub payload: Value,
}

/// Handle for emitting activity events
#[derive(Clone)]
pub struct TelemetrySink {
    tx: Option<mpsc::Sender<ActivityEvent>>,
}

impl TelemetrySink {
    /// A sink that drops everything
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    /// Spawn a writer task appending JSONL to the given file
    pub fn to_file(path: PathBuf) -> Self {
        let (tx, rx) = mpsc::channel(256);
        tokio::spawn(writer_loop(path, rx));
        Self { tx: Some(tx) }
    }

    /// Emit an event; never blocks, never errors
    pub fn emit(&self, unit_id: &str, event_kind: &str, payload: Value) {
        let Some(tx) = &self.tx else { return };

        let event = ActivityEvent {
            unit_id: unit_id.to_string(),
            event_kind: event_kind.to_string(),
            timestamp: chrono::Utc::now().to_rfc3339(),
            payload,
        };

        if tx.try_send(event).is_err() {
            // Full channel or dead writer: telemetry is best-effort
            debug!(unit_id, event_kind, "Dropped telemetry event");
        }
    }
}

async fn writer_loop(path: PathBuf, mut rx: mpsc::Receiver<ActivityEvent>) {
    if let Some(parent) = path.parent()
        && let Err(e) = tokio::fs::create_dir_all(parent).await
    {
        warn!(error = %e, "Telemetry dir creation failed, sink disabled");
        return;
    }

    let file = match tokio::fs::OpenOptions::new().create(true).append(true).open(&path).await {
        Ok(file) => file,
        Err(e) => {
            warn!(error = %e, path = %path.display(), "Telemetry file open failed, sink disabled");
            return;
        }
    };
    let mut file = tokio::io::BufWriter::new(file);

    while let Some(event) = rx.recv().await {
        let Ok(mut line) = serde_json::to_vec(&event) else { continue };
        line.push(b'\n');
        if file.write_all(&line).await.is_err() {
            warn!("Telemetry write failed, sink disabled");
            return;
        }
        // Flush per event: the stream is low-volume and consumers tail it
        let _ = file.flush().await;
    }
}
