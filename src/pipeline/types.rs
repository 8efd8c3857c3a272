//! Timestamps carried through feedback, timesync and audio

use std::time::{Duration, Instant};

/// Nanoseconds on the headset stream clock
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp {
    pub nanos: i64,
}

impl Timestamp {
    pub fn from_nanos(nanos: i64) -> Self {
        Self { nanos }
    }

    pub fn from_duration(duration: Duration) -> Self {
        Self {
            nanos: i64::try_from(duration.as_nanos()).unwrap_or(i64::MAX),
        }
    }

    /// Instants before `base` map to zero
    pub fn from_instant(instant: Instant, base: Instant) -> Self {
        Self::from_duration(instant.saturating_duration_since(base))
    }

    pub fn add(&self, duration: Duration) -> Self {
        Self {
            nanos: self
                .nanos
                .saturating_add(Self::from_duration(duration).nanos),
        }
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}ns", self.nanos)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_instant() {
        let base = Instant::now();
        let later = base + Duration::from_millis(5);
        assert_eq!(Timestamp::from_instant(later, base).nanos, 5_000_000);
        assert_eq!(Timestamp::from_instant(base, later).nanos, 0);
    }

    #[test]
    fn test_from_duration_saturates() {
        assert_eq!(Timestamp::from_duration(Duration::MAX).nanos, i64::MAX);
    }
}
