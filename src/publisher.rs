use rust_decimal::Decimal;

use crate::chat_source::TelegramChatSource;
use crate::types::{Position, Side};

/// Renders and sends the fixed-block confirmation template named in §6. Never called until
/// the exchange has acknowledged the order — "exchange-first" — so the header line can
/// truthfully state that fact.
pub struct Publisher {
    chat: TelegramChatSource,
}

impl Publisher {
    pub fn new(chat: TelegramChatSource) -> Self {
        Publisher { chat }
    }

    pub async fn publish_entry(&self, position: &Position, entry_price: Decimal) {
        let tp_list = position
            .tp_prices
            .iter()
            .map(|tp| {
                let pct_from_entry = if entry_price.is_zero() {
                    Decimal::ZERO
                } else {
                    (tp - entry_price) / entry_price * Decimal::ONE_HUNDRED
                };
                format!("  - {} ({:+.2}% from entry, share {:.2})", tp, pct_from_entry, Decimal::ONE / Decimal::from(position.tp_prices.len().max(1) as i64))
            })
            .collect::<Vec<_>>()
            .join("\n");

        let msg = format!(
            "✅ Exchange confirmed — position opened\n\
             bot_order_id: {}\n\
             exchange_order_ids: {:?}\n\
             symbol: {}\n\
             side: {}\n\
             entry_price: {}\n\
             sl_price: {}\n\
             leverage: x{:.2}\n\
             quantity: {}\n\
             tp_list:\n{}\n\
             order_accepted: true\n\
             tp_sl_set: {}\n\
             position_opened: true",
            position.position_id,
            position.entry_order_ids,
            position.symbol,
            side_label(position.side),
            entry_price,
            position.sl_price,
            position.leverage,
            position.filled_qty,
            tp_list,
            !position.tp_order_ids.is_empty(),
        );
        self.chat.send(&msg).await;
    }

    pub async fn publish_rejected(&self, signal_id: i64, reason: &str) {
        self.chat
            .send(&format!("⚠️ Signal {} REJECTED: {}", signal_id, reason))
            .await;
    }

    pub async fn publish_failed(&self, position_id: i64, reason: &str) {
        self.chat
            .send(&format!("⛔ Position {} FAILED: {}", position_id, reason))
            .await;
    }

    pub async fn publish_closed(&self, position: &Position, outcome: &str) {
        self.chat
            .send(&format!(
                "🏁 Position {} ({} {}) CLOSED — outcome: {}",
                position.position_id, side_label(position.side), position.symbol, outcome
            ))
            .await;
    }
}

fn side_label(side: Side) -> &'static str {
    match side {
        Side::Long => "LONG",
        Side::Short => "SHORT",
    }
}
