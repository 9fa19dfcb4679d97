use chrono::Utc;
use rust_decimal::Decimal;

use crate::config::Config;
use crate::errors::PipelineError;
use crate::exchange_gateway::BybitGateway;
use crate::lifecycle_store::LifecycleStore;
use crate::position_lock::PositionLocks;
use crate::telemetry::TelemetrySink;
use crate::types::{ExecutedScale, Position, PositionState, TelemetryEvent};

/// Scales winners up the ladder named in `Config::pyramid_ladder` — `(3.0%, +50%)` then
/// `(6.0%, +25%)` of the originally planned quantity — capped at `pyramid_max_multiplier`
/// times the planned size, and each rung fires at most once per position (§4.I).
pub struct PyramidManager {
    cfg: Config,
    gateway: BybitGateway,
    positions: LifecycleStore,
    telemetry: TelemetrySink,
    locks: PositionLocks,
}

impl PyramidManager {
    pub fn new(cfg: Config, gateway: BybitGateway, positions: LifecycleStore, telemetry: TelemetrySink, locks: PositionLocks) -> Self {
        PyramidManager { cfg, gateway, positions, telemetry, locks }
    }

    pub async fn tick(&self) -> Result<(), PipelineError> {
        for position in self.positions.open_positions()? {
            if position.state != PositionState::Open {
                continue;
            }
            if let Err(e) = self.poll_one(&position).await {
                log::warn!("pyramid poll failed for position {}: {}", position.position_id, e);
            }
        }
        Ok(())
    }

    async fn poll_one(&self, position: &Position) -> Result<(), PipelineError> {
        let ladder = self.cfg.pyramid_ladder();
        let cap = position.planned_qty * self.cfg.pyramid_max_multiplier;
        if position.filled_qty >= cap {
            return Ok(());
        }

        let mark = self.gateway.get_mark_price(&position.symbol).await?;
        let unrealized_pct = position.unrealized_pct(mark);

        for (scale_id, (threshold, add_fraction)) in ladder.iter().enumerate() {
            let scale_id = scale_id as u32;
            if position.pyramid_state.has_executed(scale_id) {
                continue;
            }
            if unrealized_pct < *threshold {
                continue;
            }

            let add_qty_raw = position.planned_qty * add_fraction;
            let remaining_room = cap - position.filled_qty;
            let add_qty = add_qty_raw.min(remaining_room.max(Decimal::ZERO));
            if add_qty <= Decimal::ZERO {
                continue;
            }

            let filters = self.gateway.get_symbol_info(&position.symbol).await?;
            let quantized = crate::quantize::round_qty_down(add_qty, filters.qty_step);
            if quantized < filters.min_qty {
                continue;
            }

            let ack = self
                .gateway
                .place_market(&position.symbol, position.side, quantized, false)
                .await?;
            self.positions.register_order(&ack.order_id, position.position_id, "pyramid_add")?;

            let new_total = position.filled_qty + quantized;
            let new_avg = (position.avg_entry_price * position.filled_qty + mark * quantized) / new_total;
            let mut state = position.pyramid_state.clone();
            state.executed_scales.push(ExecutedScale { scale_id, executed_at: Utc::now(), added_qty: quantized });
            {
                let _g = self.locks.acquire(position.position_id).await;
                self.positions.record_fill(position.position_id, new_total, new_avg, None, None)?;
                self.positions.record_pyramid_scale(position.position_id, &state)?;
            }

            self.telemetry.record(
                TelemetryEvent::new(
                    "pyramid_scale_executed",
                    serde_json::json!({ "scale_id": scale_id, "added_qty": quantized.to_string(), "threshold_pct": threshold.to_string() }),
                )
                .with_position(position.position_id)
                .with_orders(vec![ack.order_id]),
            );

            // Only one rung per tick: re-evaluate mark/unrealized_pct on the next poll
            // rather than stacking multiple adds against a single stale mark read.
            return Ok(());
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn ladder_caps_total_add_at_max_multiplier() {
        let planned = dec!(10);
        let max_multiplier = dec!(2.0);
        let cap = planned * max_multiplier;
        let already_filled = dec!(19);
        let remaining_room = cap - already_filled;
        assert_eq!(remaining_room, dec!(1));
    }
}
