//! Failed-attempt accounting with sliding-window lockout.
//!
//! Two independent counters track every failed login: one keyed by username,
//! one by client IP. Either tripping the threshold locks that identifier;
//! when both are locked the later unlock time is surfaced. The two entries
//! recorded for one attempt stay linked so an administrative reset of the
//! username also releases the IP it was locked with.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use tracing::warn;

/// Per-identifier failure state.
#[derive(Debug, Clone, Default)]
struct LockoutEntry {
    fail_count: u32,
    first_failure_at: Option<DateTime<Utc>>,
    locked_until: Option<DateTime<Utc>>,
    linked: HashSet<String>,
}

/// Snapshot returned by [`LockoutTracker::info`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockoutInfo {
    /// Failures recorded inside the current window.
    pub attempts: u32,
    /// When the lockout ends, if locked.
    pub locked_until: Option<DateTime<Utc>>,
    /// Whether the identifier is currently locked.
    pub locked: bool,
}

impl LockoutInfo {
    fn clear() -> Self {
        Self {
            attempts: 0,
            locked_until: None,
            locked: false,
        }
    }
}

/// Sliding-window failure counters for usernames and client IPs.
pub struct LockoutTracker {
    entries: Mutex<HashMap<String, LockoutEntry>>,
    max_attempts: u32,
    window: Duration,
    lockout: Duration,
}

impl LockoutTracker {
    /// Create a tracker with the given threshold and windows.
    #[must_use]
    pub fn new(
        max_attempts: u32,
        window: std::time::Duration,
        lockout: std::time::Duration,
    ) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            max_attempts,
            window: Duration::from_std(window).unwrap_or_else(|_| Duration::minutes(15)),
            lockout: Duration::from_std(lockout).unwrap_or_else(|_| Duration::minutes(15)),
        }
    }

    /// Record one failed attempt against both identifiers, linking them for
    /// administrative reset. Returns the username's post-increment state.
    pub fn record_failure_pair(&self, username: &str, ip: &str) -> LockoutInfo {
        let now = Utc::now();
        let mut entries = self.entries.lock();

        Self::bump(&mut entries, ip, now, self.max_attempts, self.window, self.lockout);
        let info = Self::bump(
            &mut entries,
            username,
            now,
            self.max_attempts,
            self.window,
            self.lockout,
        );

        if username != ip {
            if let Some(entry) = entries.get_mut(username) {
                entry.linked.insert(ip.to_string());
            }
            if let Some(entry) = entries.get_mut(ip) {
                entry.linked.insert(username.to_string());
            }
        }

        info
    }

    /// Record a failure for one identifier alone.
    pub fn record_failure(&self, identifier: &str) -> LockoutInfo {
        let now = Utc::now();
        let mut entries = self.entries.lock();
        Self::bump(
            &mut entries,
            identifier,
            now,
            self.max_attempts,
            self.window,
            self.lockout,
        )
    }

    fn bump(
        entries: &mut HashMap<String, LockoutEntry>,
        identifier: &str,
        now: DateTime<Utc>,
        max_attempts: u32,
        window: Duration,
        lockout: Duration,
    ) -> LockoutInfo {
        let entry = entries.entry(identifier.to_string()).or_default();

        // Window expired: restart the count
        let window_expired = entry
            .first_failure_at
            .is_some_and(|first| now - first > window);
        if window_expired && entry.locked_until.is_none() {
            entry.fail_count = 0;
            entry.first_failure_at = None;
        }

        if entry.first_failure_at.is_none() {
            entry.first_failure_at = Some(now);
        }
        entry.fail_count += 1;

        if entry.fail_count >= max_attempts && entry.locked_until.is_none() {
            entry.locked_until = Some(now + lockout);
            warn!(identifier = %identifier, "Identifier locked out");
        }

        Self::snapshot(entry, now)
    }

    /// Record a successful login: clears both counters.
    pub fn record_success(&self, username: &str, ip: &str) {
        let mut entries = self.entries.lock();
        entries.remove(username);
        entries.remove(ip);
    }

    /// Current state for one identifier.
    pub fn info(&self, identifier: &str) -> LockoutInfo {
        let now = Utc::now();
        let mut entries = self.entries.lock();

        let snapshot = entries.get(identifier).map(|entry| {
            let lock_expired = entry.locked_until.is_some_and(|until| until <= now);
            (lock_expired, Self::snapshot(entry, now))
        });

        match snapshot {
            // Expired lockout clears the entry entirely
            Some((true, _)) => {
                entries.remove(identifier);
                LockoutInfo::clear()
            }
            Some((false, info)) => info,
            None => LockoutInfo::clear(),
        }
    }

    /// Check both identifiers; when locked, the later unlock time wins.
    pub fn check(&self, username: &str, ip: &str) -> Option<DateTime<Utc>> {
        let user = self.info(username);
        let addr = self.info(ip);

        match (user.locked_until, addr.locked_until) {
            (Some(a), Some(b)) if user.locked && addr.locked => Some(a.max(b)),
            (Some(a), _) if user.locked => Some(a),
            (_, Some(b)) if addr.locked => Some(b),
            _ => None,
        }
    }

    /// Attempts remaining before `identifier` locks.
    pub fn remaining(&self, identifier: &str) -> u32 {
        let info = self.info(identifier);
        self.max_attempts.saturating_sub(info.attempts)
    }

    /// Administrative reset: clears the identifier and every identifier its
    /// failures were recorded with.
    pub fn reset(&self, identifier: &str) {
        let mut entries = self.entries.lock();
        let linked = entries
            .remove(identifier)
            .map(|entry| entry.linked)
            .unwrap_or_default();
        for other in linked {
            entries.remove(&other);
        }
    }

    /// Drop entries whose lockout and window have both passed.
    pub fn prune(&self) -> usize {
        let now = Utc::now();
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, entry| {
            let lock_active = entry.locked_until.is_some_and(|until| until > now);
            let window_active = entry
                .first_failure_at
                .is_some_and(|first| now - first <= self.window);
            lock_active || window_active
        });
        before - entries.len()
    }

    fn snapshot(entry: &LockoutEntry, now: DateTime<Utc>) -> LockoutInfo {
        let locked = entry.locked_until.is_some_and(|until| until > now);
        LockoutInfo {
            attempts: entry.fail_count,
            locked_until: entry.locked_until,
            locked,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration as StdDuration;

    fn tracker() -> LockoutTracker {
        LockoutTracker::new(
            5,
            StdDuration::from_secs(900),
            StdDuration::from_secs(900),
        )
    }

    #[test]
    fn locks_after_threshold() {
        let t = tracker();

        for attempt in 1..=4 {
            let info = t.record_failure_pair("admin", "198.51.100.5");
            assert_eq!(info.attempts, attempt);
            assert!(!info.locked, "attempt {attempt} should not lock yet");
        }

        let info = t.record_failure_pair("admin", "198.51.100.5");
        assert!(info.locked);
        assert!(info.locked_until.is_some());
        // The IP locked alongside the username
        assert!(t.info("198.51.100.5").locked);
    }

    #[test]
    fn remaining_decrements() {
        let t = tracker();
        assert_eq!(t.remaining("admin"), 5);
        t.record_failure_pair("admin", "ip");
        assert_eq!(t.remaining("admin"), 4);
        t.record_failure_pair("admin", "ip");
        assert_eq!(t.remaining("admin"), 3);
    }

    #[test]
    fn success_clears_both_counters() {
        let t = tracker();
        t.record_failure_pair("admin", "198.51.100.5");

        t.record_success("admin", "198.51.100.5");

        assert_eq!(t.info("admin").attempts, 0);
        assert_eq!(t.info("198.51.100.5").attempts, 0);
    }

    #[test]
    fn check_surfaces_later_unlock_time() {
        let t = tracker();
        for _ in 0..5 {
            t.record_failure("admin");
        }
        std::thread::sleep(StdDuration::from_millis(10));
        for _ in 0..5 {
            t.record_failure("198.51.100.5");
        }

        let until = t.check("admin", "198.51.100.5").unwrap();
        let ip_until = t.info("198.51.100.5").locked_until.unwrap();
        assert_eq!(until, ip_until);
    }

    #[test]
    fn reset_releases_linked_identifiers() {
        let t = tracker();
        for _ in 0..5 {
            t.record_failure_pair("admin", "198.51.100.5");
        }
        assert!(t.info("admin").locked);
        assert!(t.info("198.51.100.5").locked);

        t.reset("admin");
        assert!(!t.info("admin").locked);
        assert!(!t.info("198.51.100.5").locked);
        assert!(t.check("admin", "198.51.100.5").is_none());
    }

    #[test]
    fn independent_identifiers() {
        let t = tracker();
        for _ in 0..5 {
            t.record_failure("alice");
        }
        assert!(t.info("alice").locked);
        assert!(!t.info("bob").locked);
        assert!(t.check("bob", "203.0.113.7").is_none());
    }

    #[test]
    fn expired_window_restarts_count() {
        let t = LockoutTracker::new(
            5,
            StdDuration::from_millis(20),
            StdDuration::from_secs(900),
        );
        t.record_failure("admin");
        t.record_failure("admin");
        std::thread::sleep(StdDuration::from_millis(40));

        let info = t.record_failure("admin");
        assert_eq!(info.attempts, 1);
    }

    #[test]
    fn expired_lockout_clears() {
        let t = LockoutTracker::new(
            2,
            StdDuration::from_secs(900),
            StdDuration::from_millis(20),
        );
        t.record_failure("admin");
        t.record_failure("admin");
        assert!(t.info("admin").locked);

        std::thread::sleep(StdDuration::from_millis(40));
        assert!(!t.info("admin").locked);
    }

    #[test]
    fn prune_drops_stale_entries() {
        let t = LockoutTracker::new(
            5,
            StdDuration::from_millis(10),
            StdDuration::from_millis(10),
        );
        t.record_failure("admin");
        std::thread::sleep(StdDuration::from_millis(30));
        assert_eq!(t.prune(), 1);
    }
}
