//! Clock-window and self-reflection checks applied to every peer header.

use std::time::{SystemTime, UNIX_EPOCH};

use subtle::ConstantTimeEq;

use crate::error::HandshakeError;

/// Largest accepted distance, in seconds, between a peer timestamp and now.
pub const TIME_WINDOW_SECS: u64 = 30;

/// Source of "now" for the time guard.
pub trait Clock: Send + Sync {
    /// Seconds since the Unix epoch.
    fn unix_secs(&self) -> u64;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn unix_secs(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0)
    }
}

/// A clock pinned to the system clock plus a fixed offset.
#[cfg(test)]
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct SkewedClock {
    pub(crate) offset_secs: i64,
}

#[cfg(test)]
impl SkewedClock {
    pub(crate) fn new(offset_secs: i64) -> Self {
        Self { offset_secs }
    }
}

#[cfg(test)]
impl Clock for SkewedClock {
    fn unix_secs(&self) -> u64 {
        SystemClock.unix_secs().saturating_add_signed(self.offset_secs)
    }
}

/// Rejects timestamps outside the window around the local clock.
#[derive(Debug, Clone, Copy)]
pub struct TimeGuard {
    window_secs: u64,
}

impl TimeGuard {
    pub fn new(window_secs: u64) -> Self {
        Self { window_secs }
    }

    /// Accepts `|peer - now| <= window`.
    pub fn check(&self, now: u64, peer: u64) -> Result<(), HandshakeError> {
        if now.abs_diff(peer) > self.window_secs {
            let skew_secs = (i128::from(peer) - i128::from(now))
                .clamp(i128::from(i64::MIN), i128::from(i64::MAX)) as i64;
            return Err(HandshakeError::StaleTimestamp { skew_secs });
        }
        Ok(())
    }
}

impl Default for TimeGuard {
    fn default() -> Self {
        Self::new(TIME_WINDOW_SECS)
    }
}

/// Fails with `ReplayDetected` when the peer's ephemeral key is our own.
pub fn check_reflection(ours: &[u8], theirs: &[u8]) -> Result<(), HandshakeError> {
    if bool::from(ours.ct_eq(theirs)) {
        return Err(HandshakeError::ReplayDetected);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOW: u64 = 1_700_000_000;

    #[test]
    fn test_window_edges() {
        let guard = TimeGuard::default();
        assert!(guard.check(NOW, NOW).is_ok());
        assert!(guard.check(NOW, NOW + 29).is_ok());
        assert!(guard.check(NOW, NOW - 29).is_ok());
        assert!(guard.check(NOW, NOW + 30).is_ok());
        assert!(guard.check(NOW, NOW - 30).is_ok());

        assert!(matches!(
            guard.check(NOW, NOW + 31),
            Err(HandshakeError::StaleTimestamp { skew_secs: 31 })
        ));
        assert!(matches!(
            guard.check(NOW, NOW - 31),
            Err(HandshakeError::StaleTimestamp { skew_secs: -31 })
        ));
    }

    #[test]
    fn test_far_timestamps_do_not_overflow() {
        let guard = TimeGuard::default();
        assert!(matches!(
            guard.check(NOW, u64::MAX),
            Err(HandshakeError::StaleTimestamp { .. })
        ));
        assert!(guard.check(NOW, 0).is_err());
    }

    #[test]
    fn test_skewed_clock() {
        let ahead = SkewedClock::new(29).unix_secs();
        let now = SystemClock.unix_secs();
        assert!((28..=30).contains(&(ahead - now)));
    }

    #[test]
    fn test_reflection() {
        let key = [4u8; 65];
        let mut other = key;
        other[64] ^= 1;

        assert!(matches!(
            check_reflection(&key, &key),
            Err(HandshakeError::ReplayDetected)
        ));
        assert!(check_reflection(&key, &other).is_ok());
    }
}
