use std::time::Duration;
use tokio::sync::mpsc;

use crate::config::Config;

/// One chat message pulled off a monitored channel.
#[derive(Debug, Clone)]
pub struct ChatMessage {
    pub channel: String,
    pub message_id: String,
    pub text: String,
}

const BASE_URL: &str = "https://api.telegram.org";

/// Long-polls Telegram's `getUpdates` for every configured channel and funnels messages
/// into a single bounded channel. The poll-then-reconnect-on-error loop is the same shape
/// as the teacher's `websocket_handler::reconnect_with_backoff`, repointed from a Bybit
/// kline stream at a Telegram long-poll stream.
#[derive(Clone)]
pub struct TelegramChatSource {
    client: reqwest::Client,
    bot_token: String,
    notify_chat_id: String,
    long_poll_timeout_secs: u64,
}

impl TelegramChatSource {
    pub fn new(cfg: &Config) -> Self {
        TelegramChatSource {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(cfg.long_poll_timeout_secs + 10))
                .build()
                .expect("HTTP client build failed"),
            bot_token: cfg.telegram_bot_token.clone(),
            notify_chat_id: cfg.telegram_notify_chat_id.clone(),
            long_poll_timeout_secs: cfg.long_poll_timeout_secs,
        }
    }

    fn api_url(&self, method: &str) -> String {
        format!("{}/bot{}/{}", BASE_URL, self.bot_token, method)
    }

    /// Run the long-poll loop forever, sending each inbound message to `tx`. Returns only
    /// on an unrecoverable channel-closed condition; transport errors are retried internally.
    pub async fn run(&self, tx: mpsc::Sender<ChatMessage>) {
        let mut offset: i64 = 0;
        loop {
            match reconnect_with_backoff(self, &mut offset, &tx, 10, 1).await {
                Ok(()) => return, // tx closed, shut down cleanly
                Err(e) => {
                    log::error!("chat source poll loop exhausted retries: {}", e);
                    tokio::time::sleep(Duration::from_secs(30)).await;
                }
            }
        }
    }

    async fn poll_once(&self, offset: i64) -> Result<(i64, Vec<ChatMessage>), Box<dyn std::error::Error + Send + Sync>> {
        let url = self.api_url("getUpdates");
        let resp = self
            .client
            .get(&url)
            .query(&[
                ("offset", offset.to_string()),
                ("timeout", self.long_poll_timeout_secs.to_string()),
            ])
            .send()
            .await?;
        let json: serde_json::Value = resp.json().await?;
        if json["ok"].as_bool() != Some(true) {
            return Err(format!("getUpdates not ok: {}", json).into());
        }

        let mut next_offset = offset;
        let mut messages = Vec::new();
        if let Some(results) = json["result"].as_array() {
            for update in results {
                let update_id = update["update_id"].as_i64().unwrap_or(0);
                next_offset = next_offset.max(update_id + 1);
                let Some(msg) = update.get("channel_post").or_else(|| update.get("message")) else {
                    continue;
                };
                let Some(text) = msg["text"].as_str() else {
                    continue;
                };
                let chat_id = msg["chat"]["id"].as_i64().map(|i| i.to_string()).unwrap_or_default();
                let message_id = msg["message_id"].as_i64().map(|i| i.to_string()).unwrap_or_default();
                messages.push(ChatMessage {
                    channel: chat_id,
                    message_id,
                    text: text.to_string(),
                });
            }
        }
        Ok((next_offset, messages))
    }

    /// Publish an outbound status/alert message. Kept for compatibility with the teacher's
    /// reqwest + HTML parse-mode convention (see `publisher.rs`).
    pub async fn send(&self, text: &str) {
        let body = serde_json::json!({
            "chat_id": self.notify_chat_id,
            "text": text,
            "parse_mode": "HTML",
            "disable_web_page_preview": true,
        });

        match self.client.post(self.api_url("sendMessage")).json(&body).send().await {
            Ok(resp) if resp.status().is_success() => {
                let preview: String = text.chars().take(80).collect();
                log::info!("telegram sent: {}", preview.replace('\n', " "));
            }
            Ok(resp) => log::warn!("telegram error status: {}", resp.status()),
            Err(e) => log::warn!("telegram send failed: {}", e),
        }
    }
}

async fn reconnect_with_backoff(
    source: &TelegramChatSource,
    offset: &mut i64,
    tx: &mpsc::Sender<ChatMessage>,
    max_retries: u32,
    initial_delay_secs: u64,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let mut retries = 0;
    let mut delay = initial_delay_secs;

    loop {
        match source.poll_once(*offset).await {
            Ok((next_offset, messages)) => {
                *offset = next_offset;
                retries = 0;
                delay = initial_delay_secs;
                for msg in messages {
                    if tx.send(msg).await.is_err() {
                        return Ok(()); // receiver dropped, exit cleanly
                    }
                }
            }
            Err(e) => {
                retries += 1;
                if retries >= max_retries {
                    return Err(format!("chat source failed after {} retries: {}", retries, e).into());
                }
                log::warn!("chat source poll error: {}. retry in {}s ({}/{})", e, delay, retries, max_retries);
                tokio::time::sleep(Duration::from_secs(delay)).await;
                delay = (delay * 2).min(300);
            }
        }
    }
}
