use rust_decimal::prelude::*;
use rust_decimal::Decimal;

/// Per-symbol exchange filters (Bybit `instruments-info` linear category).
#[derive(Clone, Copy, Debug)]
pub struct SymbolFilters {
    pub tick_size: Decimal,
    pub qty_step: Decimal,
    pub min_qty: Decimal,
}

/// Round `price` to the nearest multiple of `tick_size`, biased against the position
/// (down for a buy-side limit, up for a sell-side limit) so a rounded order never
/// crosses further than the original signal price.
pub fn round_price_toward_safe(price: Decimal, tick_size: Decimal, is_buy: bool) -> Decimal {
    if tick_size.is_zero() {
        return price;
    }
    let steps = price / tick_size;
    let rounded_steps = if is_buy {
        steps.floor()
    } else {
        steps.ceil()
    };
    rounded_steps * tick_size
}

/// Round `qty` down to the nearest multiple of `qty_step` (never round up — that would
/// oversize the order past what was sized).
pub fn round_qty_down(qty: Decimal, qty_step: Decimal) -> Decimal {
    if qty_step.is_zero() {
        return qty;
    }
    (qty / qty_step).floor() * qty_step
}

/// Round leverage to 2 decimal places using HALF-UP rounding, per SPEC_FULL §4.G.
pub fn round_leverage_half_up(leverage: Decimal) -> Decimal {
    leverage.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn price_rounds_down_for_buy_up_for_sell() {
        let tick = dec!(0.5);
        assert_eq!(round_price_toward_safe(dec!(100.7), tick, true), dec!(100.5));
        assert_eq!(round_price_toward_safe(dec!(100.3), tick, false), dec!(100.5));
    }

    #[test]
    fn qty_never_rounds_up() {
        assert_eq!(round_qty_down(dec!(1.237), dec!(0.01)), dec!(1.23));
    }

    #[test]
    fn leverage_half_up_at_exact_midpoint() {
        assert_eq!(round_leverage_half_up(dec!(6.755)), dec!(6.76));
        assert_eq!(round_leverage_half_up(dec!(6.754)), dec!(6.75));
    }
}
