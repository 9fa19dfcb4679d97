use tokio::sync::mpsc;

use crate::chat_source::{ChatMessage, TelegramChatSource};
use crate::config::Config;
use crate::detector::{detect, to_parsed_signal};
use crate::errors::PipelineError;
use crate::signal_store::SignalStore;
use crate::telemetry::TelemetrySink;
use crate::types::TelemetryEvent;

/// The chat source's single long-poll task feeds a funnel channel; a lone consumer task
/// here filters to configured channels, dedups, detects, and persists — so dedup/claim
/// ordering never races across channels (§4.F "Ingestion pipeline").
pub struct Ingestion {
    cfg: Config,
    chat: TelegramChatSource,
    signals: SignalStore,
    telemetry: TelemetrySink,
}

impl Ingestion {
    pub fn new(cfg: Config, chat: TelegramChatSource, signals: SignalStore, telemetry: TelemetrySink) -> Self {
        Ingestion { cfg, chat, signals, telemetry }
    }

    pub async fn run(self) -> Result<(), PipelineError> {
        let (tx, mut rx) = mpsc::channel::<ChatMessage>(256);

        let chat = self.chat.clone();
        let source_handle = tokio::spawn(async move {
            chat.run(tx).await;
        });

        while let Some(msg) = rx.recv().await {
            if let Err(e) = self.handle_message(&msg) {
                log::warn!("ingestion failed for {}/{}: {}", msg.channel, msg.message_id, e);
            }
        }

        source_handle.await.map_err(|_| PipelineError::ChannelClosed("chat source task"))?;
        Ok(())
    }

    fn handle_message(&self, msg: &ChatMessage) -> Result<(), PipelineError> {
        if !self.cfg.telegram_channels.is_empty() && !self.cfg.telegram_channels.contains(&msg.channel) {
            return Ok(());
        }

        let hash = SignalStore::normalize_hash(&msg.text);
        if self.signals.is_duplicate(&msg.channel, &msg.message_id, &hash)? {
            self.telemetry.record(TelemetryEvent::new(
                "duplicate",
                serde_json::json!({ "channel": msg.channel, "message_id": msg.message_id }),
            ));
            return Ok(());
        }

        let report = detect(&msg.text);
        let Some(parsed) = to_parsed_signal(&report) else {
            self.telemetry.record(TelemetryEvent::new(
                "non_signal",
                serde_json::json!({ "channel": msg.channel, "reason": report.reason, "score": report.score }),
            ));
            return Ok(());
        };

        if self.cfg.extract_only {
            self.telemetry.record(TelemetryEvent::new(
                "extracted_only",
                serde_json::json!({ "symbol": parsed.symbol, "side": parsed.side.as_str() }),
            ));
            return Ok(());
        }

        let signal_id = self.signals.insert_new(&msg.channel, &msg.message_id, &hash, &parsed)?;
        self.telemetry.record(
            TelemetryEvent::new("signal_detected", serde_json::json!({ "symbol": parsed.symbol, "side": parsed.side.as_str() }))
                .with_signal(signal_id),
        );
        Ok(())
    }
}
