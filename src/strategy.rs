use std::fmt;

use rand::Rng;

use crate::gateway::{OrderKind, OrderSide};

/// Which side of the anchor price the shared entry is placed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryDirection {
    Above,
    Below,
}

impl fmt::Display for EntryDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntryDirection::Above => write!(f, "ABOVE"),
            EntryDirection::Below => write!(f, "BELOW"),
        }
    }
}

/// Take-profit and stop-loss prices for a leg entered at `entry_price`.
/// `tp_pnl_pct` / `sl_pnl_pct` are PnL fractions on collateral (0.8 = 80%),
/// which leverage translates into a much smaller price move.
pub fn calc_tp_sl_price(
    entry_price: f64,
    leverage: f64,
    tp_pnl_pct: f64,
    sl_pnl_pct: f64,
    is_long: bool,
) -> (f64, f64) {
    let tp_move = entry_price * (tp_pnl_pct / leverage);
    let sl_move = entry_price * (sl_pnl_pct / leverage);
    if is_long {
        (entry_price + tp_move, entry_price - sl_move)
    } else {
        (entry_price - tp_move, entry_price + sl_move)
    }
}

/// Leveraged PnL fraction on collateral for a position entered at
/// `entry_price` and marked at `current_price`.
pub fn calc_pnl_pct(entry_price: f64, current_price: f64, leverage: f64, is_long: bool) -> f64 {
    let raw = if is_long {
        (current_price - entry_price) / entry_price
    } else {
        (entry_price - current_price) / entry_price
    };
    raw * leverage
}

/// Shared entry price for both legs: the anchor shifted by `offset`
/// (a fraction, 0.005 = 0.5%) in the given direction.
pub fn entry_price(anchor_price: f64, offset: f64, direction: EntryDirection) -> f64 {
    match direction {
        EntryDirection::Above => anchor_price * (1.0 + offset),
        EntryDirection::Below => anchor_price * (1.0 - offset),
    }
}

pub fn random_offset(min: f64, max: f64, rng: &mut impl Rng) -> f64 {
    rng.gen_range(min..=max)
}

pub fn random_direction(rng: &mut impl Rng) -> EntryDirection {
    if rng.gen_bool(0.5) {
        EntryDirection::Above
    } else {
        EntryDirection::Below
    }
}

/// Per-cycle collateral: the base size scaled by a uniform factor in
/// `[1 - variance, 1 + variance]`, then rounded to the nearest multiple of
/// `step`. A non-positive step disables the rounding.
pub fn vary_collateral(base: f64, variance: f64, step: f64, rng: &mut impl Rng) -> f64 {
    let factor = 1.0 + rng.gen_range(-variance..=variance);
    let varied = base * factor;
    if step <= 0.0 {
        varied
    } else {
        (varied / step).round() * step
    }
}

/// Per-cycle reposition threshold: `base` plus a uniform draw in
/// `[-spread, +spread]`.
pub fn reposition_threshold(base: f64, spread: f64, rng: &mut impl Rng) -> f64 {
    base + rng.gen_range(-spread..=spread)
}

/// Seconds to sleep before the next poll, drawn uniformly from
/// `[min_secs, max_secs]`.
pub fn random_interval_secs(min_secs: f64, max_secs: f64, rng: &mut impl Rng) -> f64 {
    rng.gen_range(min_secs..=max_secs)
}

/// Order type for a leg given where the entry sits relative to the mark.
/// A plain limit only rests on the passive side of the market: for a
/// below-market entry the long leg is a limit and the short leg needs a
/// stop-limit trigger; an above-market entry mirrors this.
pub fn order_kind(direction: EntryDirection, side: OrderSide) -> OrderKind {
    match (direction, side) {
        (EntryDirection::Below, OrderSide::Long) => OrderKind::Limit,
        (EntryDirection::Below, OrderSide::Short) => OrderKind::StopLimit,
        (EntryDirection::Above, OrderSide::Long) => OrderKind::StopLimit,
        (EntryDirection::Above, OrderSide::Short) => OrderKind::Limit,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn rng() -> StdRng {
        StdRng::seed_from_u64(7)
    }

    fn assert_close(actual: f64, expected: f64, tol: f64) {
        assert!(
            (actual - expected).abs() < tol,
            "expected {expected}, got {actual}"
        );
    }

    #[test]
    fn tp_sl_for_long_leg() {
        let (tp, sl) = calc_tp_sl_price(49750.0, 75.0, 0.8, 0.8, true);
        assert_close(tp, 50280.666, 1e-2);
        assert_close(sl, 49219.333, 1e-2);
    }

    #[test]
    fn tp_sl_for_short_leg_mirrors_long() {
        let (tp, sl) = calc_tp_sl_price(49750.0, 75.0, 0.8, 0.8, false);
        assert_close(tp, 49219.333, 1e-2);
        assert_close(sl, 50280.666, 1e-2);
    }

    #[test]
    fn pnl_at_tp_price_recovers_target_fraction() {
        let (tp, sl) = calc_tp_sl_price(49750.0, 75.0, 0.8, 0.8, true);
        assert_close(calc_pnl_pct(49750.0, tp, 75.0, true), 0.8, 1e-9);
        assert_close(calc_pnl_pct(49750.0, sl, 75.0, true), -0.8, 1e-9);
    }

    #[test]
    fn entry_price_shifts_by_offset() {
        assert_close(
            entry_price(50000.0, 0.005, EntryDirection::Below),
            49750.0,
            1e-9,
        );
        assert_close(
            entry_price(50000.0, 0.005, EntryDirection::Above),
            50250.0,
            1e-9,
        );
    }

    #[test]
    fn order_kind_pairs_limit_with_stop_limit() {
        assert_eq!(
            order_kind(EntryDirection::Below, OrderSide::Long),
            OrderKind::Limit
        );
        assert_eq!(
            order_kind(EntryDirection::Below, OrderSide::Short),
            OrderKind::StopLimit
        );
        assert_eq!(
            order_kind(EntryDirection::Above, OrderSide::Long),
            OrderKind::StopLimit
        );
        assert_eq!(
            order_kind(EntryDirection::Above, OrderSide::Short),
            OrderKind::Limit
        );
    }

    #[test]
    fn varied_collateral_stays_in_band_and_on_step() {
        let mut rng = rng();
        for _ in 0..100 {
            let collateral = vary_collateral(10.0, 0.05, 0.5, &mut rng);
            assert!((9.5..=10.5).contains(&collateral), "got {collateral}");
            let steps = collateral / 0.5;
            assert_close(steps, steps.round(), 1e-9);
        }
    }

    #[test]
    fn zero_variance_keeps_base_collateral() {
        let mut rng = rng();
        assert_close(vary_collateral(10.0, 0.0, 0.5, &mut rng), 10.0, 1e-9);
    }

    #[test]
    fn non_positive_step_skips_rounding() {
        let mut rng = StdRng::seed_from_u64(42);
        let collateral = vary_collateral(10.0, 0.05, 0.0, &mut rng);
        assert!((9.5..=10.5).contains(&collateral));
    }

    #[test]
    fn reposition_threshold_stays_in_band() {
        let mut rng = rng();
        for _ in 0..100 {
            let threshold = reposition_threshold(0.01, 0.002, &mut rng);
            assert!((0.008..=0.012).contains(&threshold), "got {threshold}");
        }
    }

    #[test]
    fn random_offset_stays_in_band() {
        let mut rng = rng();
        for _ in 0..100 {
            let offset = random_offset(0.0025, 0.01, &mut rng);
            assert!((0.0025..=0.01).contains(&offset), "got {offset}");
        }
    }

    #[test]
    fn random_direction_produces_both_variants() {
        let mut rng = rng();
        let mut above = false;
        let mut below = false;
        for _ in 0..100 {
            match random_direction(&mut rng) {
                EntryDirection::Above => above = true,
                EntryDirection::Below => below = true,
            }
        }
        assert!(above && below);
    }
}
