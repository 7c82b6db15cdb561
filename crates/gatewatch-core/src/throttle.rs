//! Per-identity alert debounce.

use chrono::{Duration, NaiveDateTime};
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

/// Smallest cooldown [`AlertThrottle::from_secs_f64`] will build.
pub const MIN_COOLDOWN_MS: i64 = 1;

/// Suppresses repeat alerts for the same identity key within a cooldown window.
///
/// Shared by every stream. The check-and-record is a single critical section,
/// so two concurrent calls for one key can never both return `true`. The first
/// sighting of any key always alerts.
#[derive(Debug)]
pub struct AlertThrottle {
    cooldown: Duration,
    last_alert: Mutex<HashMap<String, NaiveDateTime>>,
}

impl AlertThrottle {
    pub fn new(cooldown: Duration) -> Self {
        Self {
            cooldown,
            last_alert: Mutex::new(HashMap::new()),
        }
    }

    /// Build from a cooldown in seconds, at millisecond resolution. Anything
    /// shorter than [`MIN_COOLDOWN_MS`] is raised to it.
    pub fn from_secs_f64(cooldown_secs: f64) -> Self {
        let millis = (cooldown_secs * 1000.0).round().max(MIN_COOLDOWN_MS as f64);
        Self::new(Duration::milliseconds(millis as i64))
    }

    pub fn cooldown(&self) -> Duration {
        self.cooldown
    }

    /// Returns true, and records `now`, when `key` has never alerted or its
    /// last alert is at least one cooldown old. Otherwise leaves state alone.
    pub fn should_alert(&self, key: &str, now: NaiveDateTime) -> bool {
        let mut last_alert = self.last_alert.lock().unwrap_or_else(PoisonError::into_inner);
        match last_alert.entry(key.to_owned()) {
            Entry::Occupied(entry) if now - *entry.get() < self.cooldown => false,
            Entry::Occupied(mut entry) => {
                entry.insert(now);
                true
            }
            Entry::Vacant(entry) => {
                entry.insert(now);
                true
            }
        }
    }

    /// Last alert time recorded for `key`.
    pub fn last_alert(&self, key: &str) -> Option<NaiveDateTime> {
        self.last_alert
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .copied()
    }

    /// Drop keys whose cooldown has fully elapsed. A pruned key behaves exactly
    /// as before on its next sighting (it alerts), so pruning never changes a
    /// decision. Returns the number of keys removed.
    pub fn prune(&self, now: NaiveDateTime) -> usize {
        let mut last_alert = self.last_alert.lock().unwrap_or_else(PoisonError::into_inner);
        let before = last_alert.len();
        last_alert.retain(|_, last| now - *last < self.cooldown);
        before - last_alert.len()
    }

    pub fn len(&self) -> usize {
        self.last_alert.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use std::sync::Arc;

    fn t0() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 5, 1)
            .unwrap()
            .and_hms_opt(12, 0, 0)
            .unwrap()
    }

    #[test]
    fn test_first_sighting_alerts() {
        let throttle = AlertThrottle::from_secs_f64(300.0);
        assert!(throttle.should_alert("Unknown_1", t0()));
        assert_eq!(throttle.last_alert("Unknown_1"), Some(t0()));
    }

    #[test]
    fn test_cooldown_window() {
        let throttle = AlertThrottle::from_secs_f64(300.0);
        assert!(throttle.should_alert("k", t0()));
        assert!(!throttle.should_alert("k", t0() + Duration::seconds(1)));
        assert!(!throttle.should_alert("k", t0() + Duration::seconds(299)));
        assert!(throttle.should_alert("k", t0() + Duration::seconds(300)));
    }

    #[test]
    fn test_sub_millisecond_cooldown_still_suppresses() {
        let throttle = AlertThrottle::from_secs_f64(0.0004);
        assert_eq!(throttle.cooldown(), Duration::milliseconds(1));
        assert!(throttle.should_alert("k", t0()));
        assert!(!throttle.should_alert("k", t0()));
        assert!(throttle.should_alert("k", t0() + Duration::milliseconds(1)));
    }

    #[test]
    fn test_suppressed_call_does_not_extend_window() {
        let throttle = AlertThrottle::from_secs_f64(10.0);
        assert!(throttle.should_alert("k", t0()));
        assert!(!throttle.should_alert("k", t0() + Duration::seconds(9)));
        assert_eq!(throttle.last_alert("k"), Some(t0()));
        assert!(throttle.should_alert("k", t0() + Duration::seconds(10)));
    }

    #[test]
    fn test_keys_are_independent() {
        let throttle = AlertThrottle::from_secs_f64(300.0);
        assert!(throttle.should_alert("Unknown_1", t0()));
        assert!(throttle.should_alert("Unknown_2", t0()));
        assert!(throttle.should_alert("bob", t0()));
        assert!(!throttle.should_alert("Unknown_1", t0()));
        assert_eq!(throttle.len(), 3);
    }

    #[test]
    fn test_concurrent_same_key_alerts_once() {
        let throttle = Arc::new(AlertThrottle::from_secs_f64(300.0));
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let throttle = Arc::clone(&throttle);
                std::thread::spawn(move || throttle.should_alert("shared", t0()))
            })
            .collect();
        let fired = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|&alerted| alerted)
            .count();
        assert_eq!(fired, 1);
    }

    #[test]
    fn test_prune_drops_expired_keys_only() {
        let throttle = AlertThrottle::from_secs_f64(60.0);
        throttle.should_alert("old", t0());
        throttle.should_alert("fresh", t0() + Duration::seconds(50));
        assert_eq!(throttle.prune(t0() + Duration::seconds(70)), 1);
        assert!(throttle.last_alert("old").is_none());
        assert!(throttle.last_alert("fresh").is_some());
        // Pruned key alerts again on its next sighting.
        assert!(throttle.should_alert("old", t0() + Duration::seconds(71)));
    }
}
