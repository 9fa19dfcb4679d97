use std::fs::OpenOptions;
use std::io::Write;
use tokio::sync::mpsc;

use crate::types::TelemetryEvent;

/// Handle cloned into every task that needs to record an event. Sending never blocks the
/// caller's I/O path — the channel is drained by a single background writer.
#[derive(Clone)]
pub struct TelemetrySink {
    tx: mpsc::Sender<TelemetryEvent>,
}

impl TelemetrySink {
    pub fn record(&self, event: TelemetryEvent) {
        if let Err(e) = self.tx.try_send(event) {
            log::warn!("telemetry channel full or closed, dropping event: {}", e);
        }
    }
}

/// Builds the sink/writer pair. `path` is a single append-only NDJSON file, per §6 — unlike
/// the teacher's per-kind CSVs, every event kind lands in the same file since the spec names
/// one log, not several.
pub fn spawn(path: String, capacity: usize) -> (TelemetrySink, tokio::task::JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(capacity);
    let handle = tokio::spawn(telemetry_writer(rx, path));
    (TelemetrySink { tx }, handle)
}

/// Single background task that handles ALL telemetry, exactly the teacher pack's
/// single-writer-task-behind-a-channel shape (`mufund-nitro-fig/src/telemetry/writer.rs`),
/// adapted to append newline-delimited JSON instead of per-kind CSVs.
async fn telemetry_writer(mut rx: mpsc::Receiver<TelemetryEvent>, path: String) {
    let mut file = match OpenOptions::new().create(true).append(true).open(&path) {
        Ok(f) => f,
        Err(e) => {
            log::error!("telemetry writer could not open {}: {}", path, e);
            return;
        }
    };

    while let Some(event) = rx.recv().await {
        match serde_json::to_string(&event) {
            Ok(line) => {
                if let Err(e) = writeln!(file, "{}", line) {
                    log::warn!("telemetry write failed: {}", e);
                }
            }
            Err(e) => log::warn!("telemetry serialize failed: {}", e),
        }
    }

    file.flush().ok();
    log::info!("telemetry writer stopped, file flushed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Read;

    #[tokio::test]
    async fn events_are_appended_as_ndjson() {
        let path = std::env::temp_dir().join(format!("telemetry-test-{}.ndjson", std::process::id()));
        let path_str = path.to_str().unwrap().to_string();
        let (sink, handle) = spawn(path_str.clone(), 16);

        sink.record(TelemetryEvent::new("duplicate", json!({"channel": "c1"})));
        sink.record(TelemetryEvent::new("non_signal", json!({"reason": "too_short"})));
        drop(sink);
        handle.await.unwrap();

        let mut contents = String::new();
        std::fs::File::open(&path).unwrap().read_to_string(&mut contents).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("duplicate"));
        std::fs::remove_file(&path).ok();
    }
}
