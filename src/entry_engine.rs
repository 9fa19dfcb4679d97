use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde_json::json;

use crate::config::Config;
use crate::errors::PipelineError;
use crate::exchange_gateway::BybitGateway;
use crate::lifecycle_store::LifecycleStore;
use crate::publisher::Publisher;
use crate::quantize::{round_leverage_half_up, round_price_toward_safe, round_qty_down};
use crate::signal_store::SignalStore;
use crate::telemetry::TelemetrySink;
use crate::types::{Side, Signal, SignalStatus, SignalType, TelemetryEvent};
use crate::watchdog::Watchdog;

pub struct EntryEngine {
    cfg: Config,
    gateway: BybitGateway,
    signals: SignalStore,
    positions: LifecycleStore,
    telemetry: TelemetrySink,
    watchdog: Watchdog,
    publisher: Publisher,
}

/// Result of the sizing step (§4.G "Sizing and leverage").
struct Sizing {
    stop_loss: Decimal,
    leverage: Decimal,
    signal_type: SignalType,
}

impl EntryEngine {
    pub fn new(
        cfg: Config,
        gateway: BybitGateway,
        signals: SignalStore,
        positions: LifecycleStore,
        telemetry: TelemetrySink,
        watchdog: Watchdog,
        publisher: Publisher,
    ) -> Self {
        EntryEngine { cfg, gateway, signals, positions, telemetry, watchdog, publisher }
    }

    /// One iteration: claim the next NEW signal (if capacity allows) and drive it through
    /// to a placed dual-limit entry or a terminal REJECTED/FAILED state.
    pub async fn tick(&self) -> Result<bool, PipelineError> {
        if !self.watchdog.may_accept_new_signal()? {
            return Ok(false);
        }
        let Some(signal) = self.signals.claim_next()? else {
            return Ok(false);
        };
        if let Err(e) = self.process(&signal).await {
            log::warn!("entry engine failed for signal {}: {}", signal.signal_id, e);
        }
        Ok(true)
    }

    async fn process(&self, signal: &Signal) -> Result<(), PipelineError> {
        let balance = match self.gateway.get_balance().await {
            Ok(b) => b,
            Err(e) => {
                self.reject(signal, &format!("get_balance_failed:{}", e)).await?;
                return Ok(());
            }
        };
        let sizing = self.compute_sizing(signal, balance);

        let initial_margin = dec!(20);
        let leverage = sizing.leverage;

        let filters = match self.gateway.get_symbol_info(&signal.symbol).await {
            Ok(f) => f,
            Err(e) => {
                self.reject(signal, &format!("symbol_info_failed:{}", e)).await?;
                return Ok(());
            }
        };

        let qty_raw = initial_margin * leverage / signal.entry_mid;
        let qty = round_qty_down(qty_raw, filters.qty_step);
        if qty < filters.min_qty {
            self.reject(signal, "qty_below_minimum").await?;
            return Ok(());
        }

        if let Err(e) = self.gateway.set_leverage(&signal.symbol, leverage).await {
            self.reject(signal, &format!("set_leverage_failed:{}", e)).await?;
            return Ok(());
        }

        let last_price = match self.gateway.get_mark_price(&signal.symbol).await {
            Ok(p) => p,
            Err(e) => {
                self.reject(signal, &format!("mark_price_failed:{}", e)).await?;
                return Ok(());
            }
        };

        let half_spread_pct = dec!(0.0005);
        let half_spread = signal.entry_mid * half_spread_pct;
        let p1_raw = signal.entry_mid - half_spread;
        let p2_raw = signal.entry_mid + half_spread;

        let (buy_price, sell_price) = match signal.side {
            Side::Long => (p1_raw, p2_raw),
            Side::Short => (p2_raw, p1_raw),
        };
        let p1 = round_price_toward_safe(buy_price, filters.tick_size, true);
        let p2 = round_price_toward_safe(sell_price, filters.tick_size, false);

        let (p1, p2) = match nudge_legs_below_last(p1, p2, signal.side, last_price, filters.tick_size) {
            Some(pair) => pair,
            None => {
                self.reject(signal, "crosses_book").await?;
                return Ok(());
            }
        };

        let q1 = round_qty_down(qty / Decimal::TWO, filters.qty_step);
        let q2 = qty - q1;

        let order_a = match self.gateway.place_limit(&signal.symbol, signal.side, q1, p1, true, false).await {
            Ok(ack) => ack,
            Err(e) => {
                self.reject(signal, &format!("entry_a_failed:{}", e)).await?;
                return Ok(());
            }
        };
        let order_b = match self.gateway.place_limit(&signal.symbol, signal.side, q2, p2, true, false).await {
            Ok(ack) => ack,
            Err(e) => {
                // best-effort cleanup of the leg that did place
                let _ = self.gateway.cancel_order(&signal.symbol, &order_a.order_id).await;
                self.reject(signal, &format!("entry_b_failed:{}", e)).await?;
                return Ok(());
            }
        };

        let position_id = self.positions.create_pending(
            signal.signal_id,
            &signal.symbol,
            signal.side,
            qty,
            leverage,
            initial_margin,
            sizing.stop_loss,
            &signal.targets,
            &[order_a.order_id.clone(), order_b.order_id.clone()],
        )?;
        self.positions.register_order(&order_b.order_id, position_id, "entry_b")?;

        self.telemetry.record(
            TelemetryEvent::new(
                "entry_placed",
                json!({
                    "symbol": signal.symbol,
                    "side": signal.side.as_str(),
                    "qty": qty.to_string(),
                    "p1": p1.to_string(),
                    "p2": p2.to_string(),
                    "leverage": leverage.to_string(),
                    "signal_type": sizing.signal_type.as_str(),
                }),
            )
            .with_signal(signal.signal_id)
            .with_position(position_id)
            .with_orders(vec![order_a.order_id, order_b.order_id]),
        );

        Ok(())
    }

    /// §4.G "Sizing and leverage" and classification.
    fn compute_sizing(&self, signal: &Signal, balance: Decimal) -> Sizing {
        match signal.stop_loss {
            None => Sizing {
                stop_loss: fast_fallback_stop(signal.entry_mid, signal.side, self.cfg.fast_fallback_pct),
                leverage: dec!(10.00),
                signal_type: SignalType::Fast,
            },
            Some(stop) => {
                let leverage = compute_leverage(signal.entry_mid, stop, self.cfg.leverage_min, self.cfg.leverage_max, balance);
                Sizing {
                    stop_loss: stop,
                    leverage,
                    signal_type: classify_leverage(leverage),
                }
            }
        }
    }

    async fn reject(&self, signal: &Signal, reason: &str) -> Result<(), PipelineError> {
        self.signals.set_status(signal.signal_id, SignalStatus::Rejected)?;
        self.telemetry.record(
            TelemetryEvent::new("signal_rejected", json!({ "reason": reason }))
                .with_signal(signal.signal_id),
        );
        self.publisher.publish_rejected(signal.signal_id, reason).await;
        Ok(())
    }
}

/// `S = E * (1 - 0.02)` for LONG, `E * (1 + 0.02)` for SHORT.
fn fast_fallback_stop(entry: Decimal, side: Side, pct: Decimal) -> Decimal {
    let frac = pct / dec!(100);
    match side {
        Side::Long => entry * (Decimal::ONE - frac),
        Side::Short => entry * (Decimal::ONE + frac),
    }
}

/// `leverage = clamp(r*B/Δ / IM, min, max)` rounded HALF-UP to 2 decimals.
fn compute_leverage(entry: Decimal, stop: Decimal, min: Decimal, max: Decimal, balance: Decimal) -> Decimal {
    let risk_pct = dec!(0.02);
    let initial_margin = dec!(20);
    let delta = ((entry - stop) / entry).abs();
    if delta.is_zero() {
        return round_leverage_half_up(min);
    }
    let notional = risk_pct * balance / delta;
    let leverage_raw = notional / initial_margin;
    let clamped = leverage_raw.clamp(min, max);
    round_leverage_half_up(clamped)
}

/// §4.G: both legs must sit below last traded price for LONG / above for SHORT. Nudges
/// outward one tick at a time until post-only is safe; gives up after a bounded number of
/// ticks rather than nudging indefinitely into a runaway price.
const MAX_NUDGE_TICKS: u32 = 50;

fn nudge_legs_below_last(
    p1: Decimal,
    p2: Decimal,
    side: Side,
    last_price: Decimal,
    tick_size: Decimal,
) -> Option<(Decimal, Decimal)> {
    let nudge_one = |mut price: Decimal| -> Option<Decimal> {
        for _ in 0..MAX_NUDGE_TICKS {
            let safe = match side {
                Side::Long => price < last_price,
                Side::Short => price > last_price,
            };
            if safe {
                return Some(price);
            }
            price = match side {
                Side::Long => price - tick_size,
                Side::Short => price + tick_size,
            };
        }
        None
    };
    Some((nudge_one(p1)?, nudge_one(p2)?))
}

/// SWING if ≤6.00, DYNAMIC if ≥7.50, values in between snap to the nearer class, with the
/// exact midpoint 6.75 snapping to DYNAMIC (Open Question resolution, see DESIGN.md).
fn classify_leverage(leverage: Decimal) -> SignalType {
    if leverage <= dec!(6.00) {
        SignalType::Swing
    } else if leverage >= dec!(7.50) {
        SignalType::Dynamic
    } else if leverage >= dec!(6.75) {
        SignalType::Dynamic
    } else {
        SignalType::Swing
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fast_fallback_sets_two_percent_stop() {
        assert_eq!(fast_fallback_stop(dec!(100), Side::Long, dec!(2.0)), dec!(98.00));
        assert_eq!(fast_fallback_stop(dec!(100), Side::Short, dec!(2.0)), dec!(102.00));
    }

    #[test]
    fn leverage_clamped_to_bounds() {
        let lev = compute_leverage(dec!(100), dec!(99.999), dec!(6), dec!(50), dec!(10_000));
        assert_eq!(lev, dec!(50.00));
        let lev_tight = compute_leverage(dec!(100), dec!(50), dec!(6), dec!(50), dec!(10_000));
        assert_eq!(lev_tight, dec!(6.00));
    }

    #[test]
    fn nudge_pushes_long_legs_below_last() {
        let (p1, p2) = nudge_legs_below_last(dec!(100.0), dec!(100.2), Side::Long, dec!(100.1), dec!(0.1)).unwrap();
        assert!(p1 < dec!(100.1));
        assert!(p2 < dec!(100.1));
    }

    #[test]
    fn nudge_gives_up_past_bound() {
        assert!(nudge_legs_below_last(dec!(100.0), dec!(100.0), Side::Long, dec!(1_000_000), dec!(0.1)).is_none());
    }

    #[test]
    fn classification_midpoint_snaps_dynamic() {
        assert_eq!(classify_leverage(dec!(6.75)), SignalType::Dynamic);
        assert_eq!(classify_leverage(dec!(6.74)), SignalType::Swing);
        assert_eq!(classify_leverage(dec!(7.50)), SignalType::Dynamic);
        assert_eq!(classify_leverage(dec!(6.00)), SignalType::Swing);
    }
}
