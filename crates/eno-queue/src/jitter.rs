use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Spread a delay by ±10% so periodic requeues don't synchronize into
/// thundering herds. Seeded from the wall clock's subsecond nanos; the
/// spread only needs to decorrelate, not be statistically strong.
pub fn jittered(base: Duration) -> Duration {
    if base.is_zero() {
        return base;
    }
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);
    // Map nanos onto [-0.1, +0.1].
    let unit = f64::from(nanos) / 1_000_000_000.0;
    let factor = 1.0 + (unit - 0.5) * 0.2;
    base.mul_f64(factor)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stays_within_ten_percent() {
        let base = Duration::from_secs(10);
        for _ in 0..100 {
            let j = jittered(base);
            assert!(j >= Duration::from_secs(9), "{:?}", j);
            assert!(j <= Duration::from_secs(11), "{:?}", j);
        }
    }

    #[test]
    fn zero_stays_zero() {
        assert_eq!(jittered(Duration::ZERO), Duration::ZERO);
    }
}
