use chrono::{FixedOffset, Timelike, Utc};
use rand::Rng;

/// Whether `now_minutes` (minutes since local midnight) falls inside the
/// trading window. A fresh jitter in `[-variance, +variance]` minutes is drawn
/// on every call and applied to both boundaries, so the effective window edges
/// wander a little from check to check. `end_hour <= start_hour` denotes an
/// overnight window (e.g. 13:00 - 04:00).
pub fn is_trading_hours(
    now_minutes: u32,
    start_hour: u32,
    end_hour: u32,
    variance_minutes: u32,
    rng: &mut impl Rng,
) -> bool {
    let variance = variance_minutes as i64;
    let jitter = if variance == 0 {
        0
    } else {
        rng.gen_range(-variance..=variance)
    };

    let start_minutes = (start_hour as i64 * 60 + jitter).clamp(0, 1439);
    let end_minutes = (end_hour as i64 * 60 + jitter).clamp(0, 1440);
    let now = now_minutes as i64;

    if end_hour <= start_hour {
        // Overnight: open after start or before end
        now >= start_minutes || now < end_minutes
    } else {
        start_minutes <= now && now < end_minutes
    }
}

/// Minutes since midnight in the venue-local timezone.
pub fn minutes_of_day(tz: &FixedOffset) -> u32 {
    let local = Utc::now().with_timezone(tz);
    local.hour() * 60 + local.minute()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn rng() -> StdRng {
        StdRng::seed_from_u64(7)
    }

    #[test]
    fn same_day_window_boundaries_without_variance() {
        let mut rng = rng();
        // 08:00 - 24:00
        assert!(is_trading_hours(8 * 60, 8, 24, 0, &mut rng));
        assert!(is_trading_hours(23 * 60 + 59, 8, 24, 0, &mut rng));
        assert!(!is_trading_hours(7 * 60 + 59, 8, 24, 0, &mut rng));
        assert!(!is_trading_hours(1, 8, 24, 0, &mut rng));
    }

    #[test]
    fn overnight_window_wraps_midnight() {
        let mut rng = rng();
        // 13:00 - 04:00
        assert!(is_trading_hours(13 * 60, 13, 4, 0, &mut rng));
        assert!(is_trading_hours(22 * 60, 13, 4, 0, &mut rng));
        assert!(is_trading_hours(3 * 60 + 59, 13, 4, 0, &mut rng));
        assert!(!is_trading_hours(4 * 60, 13, 4, 0, &mut rng));
        assert!(!is_trading_hours(12 * 60 + 59, 13, 4, 0, &mut rng));
    }

    #[test]
    fn full_day_window_is_always_open() {
        let mut rng = rng();
        assert!(is_trading_hours(0, 0, 24, 0, &mut rng));
        assert!(is_trading_hours(12 * 60, 0, 24, 0, &mut rng));
        assert!(is_trading_hours(1439, 0, 24, 0, &mut rng));
    }

    #[test]
    fn equal_start_and_end_counts_as_overnight() {
        let mut rng = rng();
        // 08:00 - 08:00 wraps all the way around
        assert!(is_trading_hours(0, 8, 8, 0, &mut rng));
        assert!(is_trading_hours(8 * 60, 8, 8, 0, &mut rng));
        assert!(is_trading_hours(1439, 8, 8, 0, &mut rng));
    }

    #[test]
    fn variance_cannot_flip_points_deep_inside_or_outside() {
        // With +-120min of jitter the start bound stays within [06:00, 10:00]
        // and the end bound within [22:00, 26:00 clamped to 24:00], so midday
        // is always open and 05:00 is always closed.
        let mut rng = rng();
        for _ in 0..200 {
            assert!(is_trading_hours(12 * 60, 8, 24, 120, &mut rng));
            assert!(!is_trading_hours(5 * 60, 8, 24, 120, &mut rng));
        }
    }
}
