use rust_decimal::Decimal;

use crate::config::Config;
use crate::errors::PipelineError;
use crate::exchange_gateway::BybitGateway;
use crate::lifecycle_store::LifecycleStore;
use crate::position_lock::PositionLocks;
use crate::signal_store::SignalStore;
use crate::telemetry::TelemetrySink;
use crate::types::{HedgeInfo, HedgeState, Position, PositionState, TelemetryEvent};

/// Opens a role-reversed counter-position when a primary moves `hedge_trigger_pct` against
/// it, and drives the bounded re-entry cycle once the primary's stop is hit (§4.J). The
/// hedge's take-profit sits at the primary's stop price and its stop-loss sits back at the
/// primary's original entry — so a hedge TP fill is functionally the same event as the
/// primary's stop being hit, and a hedge stop-out means the primary recovered.
pub struct HedgeManager {
    cfg: Config,
    gateway: BybitGateway,
    signals: SignalStore,
    positions: LifecycleStore,
    telemetry: TelemetrySink,
    locks: PositionLocks,
}

impl HedgeManager {
    pub fn new(
        cfg: Config,
        gateway: BybitGateway,
        signals: SignalStore,
        positions: LifecycleStore,
        telemetry: TelemetrySink,
        locks: PositionLocks,
    ) -> Self {
        HedgeManager { cfg, gateway, signals, positions, telemetry, locks }
    }

    pub async fn tick(&self) -> Result<(), PipelineError> {
        for position in self.positions.open_positions()? {
            if position.state == PositionState::Open && position.hedge.state() == HedgeState::None {
                if let Err(e) = self.maybe_open_hedge(&position).await {
                    log::warn!("hedge open failed for position {}: {}", position.position_id, e);
                }
            }
        }
        // A primary that already hit its own stop is CLOSED and no longer in
        // `open_positions()`, but its hedge may still be live — poll those separately so
        // the hedge's own closure and the bounded re-entry cycle still get driven.
        for position in self.positions.hedged_positions()? {
            if let Err(e) = self.poll_hedge_orders(&position).await {
                log::warn!("hedge resolution poll failed for position {}: {}", position.position_id, e);
            }
        }
        Ok(())
    }

    async fn maybe_open_hedge(&self, position: &Position) -> Result<(), PipelineError> {
        let mark = self.gateway.get_mark_price(&position.symbol).await?;
        let unrealized_pct = position.unrealized_pct(mark);
        if unrealized_pct > self.cfg.hedge_trigger_pct {
            return Ok(());
        }

        let entry_basis = position.pct_basis();
        let hedge_side = position.side.opposite();
        let filters = self.gateway.get_symbol_info(&position.symbol).await?;
        let hedge_qty = crate::quantize::round_qty_down(position.filled_qty, filters.qty_step);
        if hedge_qty < filters.min_qty {
            return Ok(());
        }
        let ack = self
            .gateway
            .place_market(&position.symbol, hedge_side, hedge_qty, false)
            .await?;

        let hedge_position_id = self.positions.create_pending(
            position.signal_id,
            &position.symbol,
            hedge_side,
            hedge_qty,
            position.leverage,
            position.initial_margin_plan,
            entry_basis,                 // hedge's stop: primary's original entry
            &[position.sl_price],        // hedge's take-profit: primary's stop level
            &[ack.order_id.clone()],
        )?;

        {
            let _g = self.locks.acquire(position.position_id).await;
            self.positions.record_hedge(
                position.position_id,
                &HedgeInfo { state: HedgeState::Hedged.as_str().to_string(), hedge_position_id: Some(hedge_position_id), re_entry_attempts: 0 },
            )?;
        }

        self.telemetry.record(
            TelemetryEvent::new(
                "hedge_opened",
                serde_json::json!({ "hedge_position_id": hedge_position_id, "qty": hedge_qty.to_string(), "trigger_pct": unrealized_pct.to_string() }),
            )
            .with_position(position.position_id)
            .with_orders(vec![ack.order_id]),
        );
        Ok(())
    }

    /// The hedge is itself a tracked position, driven to OPEN/CLOSED by the lifecycle
    /// manager's normal poll. The moment it's first observed CLOSED is an edge, not a level
    /// — this function only runs while the parent still reads `Hedged`, so the re-entry
    /// attempt below fires exactly once per hedge.
    async fn poll_hedge_orders(&self, position: &Position) -> Result<(), PipelineError> {
        let Some(hedge_id) = position.hedge.hedge_position_id else {
            return Ok(());
        };
        let Some(hedge_pos) = self.positions.get(hedge_id)? else {
            return Ok(());
        };
        if hedge_pos.state != PositionState::Closed {
            return Ok(());
        }

        {
            let _g = self.locks.acquire(position.position_id).await;
            self.positions.record_hedge(
                position.position_id,
                &HedgeInfo { state: HedgeState::HedgeClosed.as_str().to_string(), hedge_position_id: Some(hedge_id), re_entry_attempts: position.hedge.re_entry_attempts },
            )?;
        }
        self.telemetry.record(TelemetryEvent::new("hedge_closed", serde_json::json!({})).with_position(position.position_id));

        self.maybe_re_enter(position).await
    }

    /// Once a primary has closed via stop while hedged, feed the originating signal back
    /// for one more attempt, bounded by `max_re_entry_attempts`.
    async fn maybe_re_enter(&self, position: &Position) -> Result<(), PipelineError> {
        let Some(signal) = self.signals.get(position.signal_id)? else {
            return Ok(());
        };
        if signal.re_entry_attempts >= self.cfg.max_re_entry_attempts {
            log::info!("signal {} exhausted re-entry budget ({})", signal.signal_id, self.cfg.max_re_entry_attempts);
            return Ok(());
        }
        self.signals.increment_re_entry_attempts(signal.signal_id)?;
        self.signals.revert_to_new(signal.signal_id)?;
        self.telemetry.record(TelemetryEvent::new("signal_re_entry", serde_json::json!({})).with_signal(signal.signal_id));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn hedge_triggers_only_below_threshold() {
        let trigger = dec!(-2.0);
        let above: Decimal = dec!(-1.0);
        let below: Decimal = dec!(-3.0);
        assert!(above > trigger);
        assert!(below <= trigger);
    }
}
