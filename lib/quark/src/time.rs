use std::time::{Duration, SystemTime};

/// Returns the current unix timestamp (seconds elapsed since 1970-01-01)
#[inline]
pub fn timestamp_secs() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .expect("Closed timelike curve, reality compromised")
        .as_secs()
}

/// Converts fractional seconds into a `Duration`, clamping negatives to zero.
#[inline]
pub fn secs_to_duration(secs: f64) -> Duration {
    if secs <= 0.0 {
        Duration::from_secs(0)
    } else {
        Duration::from_nanos((secs * 1e9) as u64)
    }
}

/// Converts a `Duration` into fractional seconds.
#[inline]
pub fn duration_to_secs(duration: Duration) -> f64 {
    duration.as_secs() as f64 + f64::from(duration.subsec_nanos()) * 1e-9
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_secs_roundtrip() {
        let d = secs_to_duration(1.5);
        assert_eq!(d, Duration::from_millis(1500));
        assert!((duration_to_secs(d) - 1.5).abs() < 1e-9);
    }

    #[test]
    fn test_negative_clamps_to_zero() {
        assert_eq!(secs_to_duration(-2.0), Duration::from_secs(0));
    }
}
