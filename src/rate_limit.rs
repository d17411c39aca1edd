//! Rate Limiter: per-identity admission windows and concurrency caps.
//!
//! Grounded on the base crate's `claude::rate_limiter` module — a single
//! `Mutex`-guarded state with a reset-at-boundary window (`refill_buckets`
//! there, generalized to four independent event classes here), not a
//! token-bucket. `dashmap` replaces the single global mutex with one
//! critical section per tracking key, since every key's counters are
//! independent and contention between unrelated keys is needless.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::HashSet;
use std::time::Duration;
use thiserror::Error;

/// Identity-class determining which limits table entry applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tier {
    /// Unauthenticated client, tracked by IP.
    Anonymous,
    /// Authenticated client.
    LoggedIn,
    /// Paying client.
    Premium,
    /// Operator identity. Every check short-circuits to allowed.
    Admin,
}

/// Static per-tier limits.
#[derive(Debug, Clone, Copy)]
pub struct TierLimits {
    /// Successful session creations allowed per rolling hour.
    pub sessions_per_hour: u32,
    /// Concurrently live sessions allowed.
    pub max_concurrent_sessions: u32,
    /// Commands allowed per rolling minute.
    pub commands_per_minute: u32,
    /// Concurrently open terminal connections allowed.
    pub max_concurrent_connections: u32,
}

const SESSION_WINDOW: Duration = Duration::from_secs(3600);
const COMMAND_WINDOW: Duration = Duration::from_secs(60);

/// Outcome of an admission check: `allowed` is authoritative; `retry_after`
/// is populated only when a windowed (not concurrency) cap was the cause.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdmissionResult {
    /// Whether the event may proceed.
    pub allowed: bool,
    /// Seconds until the window resets, when `allowed` is false due to a
    /// windowed cap. `None` for concurrency-cap denials or admin bypass.
    pub retry_after_seconds: Option<u64>,
}

impl AdmissionResult {
    fn allow() -> Self {
        Self {
            allowed: true,
            retry_after_seconds: None,
        }
    }

    fn deny_with_retry(retry_after_seconds: u64) -> Self {
        Self {
            allowed: false,
            retry_after_seconds: Some(retry_after_seconds),
        }
    }

    fn deny_concurrent() -> Self {
        Self {
            allowed: false,
            retry_after_seconds: None,
        }
    }
}

/// Rate-limiter administration errors.
#[derive(Debug, Error)]
pub enum RateLimitError {
    /// No record exists for the given tracking key.
    #[error("no rate-limit record for key {0:?}")]
    NotFound(String),
    /// An admin operation was called with invalid arguments.
    #[error("invalid rate-limit admin request: {0}")]
    InvalidRequest(String),
}

fn limits_for(tier: Tier, dev_mode: bool) -> TierLimits {
    if dev_mode {
        return TierLimits {
            sessions_per_hour: 100_000,
            max_concurrent_sessions: 100_000,
            commands_per_minute: 100_000,
            max_concurrent_connections: 100_000,
        };
    }
    match tier {
        Tier::Anonymous => TierLimits {
            sessions_per_hour: 10,
            max_concurrent_sessions: 2,
            commands_per_minute: 60,
            max_concurrent_connections: 2,
        },
        Tier::LoggedIn => TierLimits {
            sessions_per_hour: 30,
            max_concurrent_sessions: 5,
            commands_per_minute: 180,
            max_concurrent_connections: 5,
        },
        Tier::Premium => TierLimits {
            sessions_per_hour: 100,
            max_concurrent_sessions: 15,
            commands_per_minute: 600,
            max_concurrent_connections: 15,
        },
        Tier::Admin => TierLimits {
            sessions_per_hour: u32::MAX,
            max_concurrent_sessions: u32::MAX,
            commands_per_minute: u32::MAX,
            max_concurrent_connections: u32::MAX,
        },
    }
}

/// One tracking identity's counters and active-id sets.
#[derive(Debug, Clone)]
struct RateLimitRecord {
    tier: Tier,
    session_count: u32,
    session_window_start: DateTime<Utc>,
    active_session_ids: HashSet<String>,
    command_count: u32,
    command_window_start: DateTime<Utc>,
    active_connection_ids: HashSet<String>,
    /// Per-key override of `max_concurrent_sessions`, set by an admin.
    session_max_override: Option<u32>,
    /// Per-key override of the session window, set by an admin.
    session_window_override: Option<Duration>,
}

impl RateLimitRecord {
    fn new(tier: Tier, now: DateTime<Utc>) -> Self {
        Self {
            tier,
            session_count: 0,
            session_window_start: now,
            active_session_ids: HashSet::new(),
            command_count: 0,
            command_window_start: now,
            active_connection_ids: HashSet::new(),
            session_max_override: None,
            session_window_override: None,
        }
    }

    /// Reset-at-boundary: if the window has fully elapsed, zero the counter
    /// and re-anchor the window to `now`. A session landing exactly at
    /// `window_start + window_duration` belongs to the new window.
    fn roll_windows(&mut self, now: DateTime<Utc>) {
        let session_window = self.session_window_override.unwrap_or(SESSION_WINDOW);
        if chrono_elapsed(self.session_window_start, now) >= session_window {
            self.session_count = 0;
            self.session_window_start = now;
        }
        if chrono_elapsed(self.command_window_start, now) >= COMMAND_WINDOW {
            self.command_count = 0;
            self.command_window_start = now;
        }
    }
}

fn chrono_elapsed(start: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    now.signed_duration_since(start)
        .to_std()
        .unwrap_or(Duration::ZERO)
}

/// Snapshot of a tracking key's rate-limit record, for the admin surface.
#[derive(Debug, Clone)]
pub struct RateLimitSnapshot {
    /// Tracking key.
    pub key: String,
    /// Tier.
    pub tier: Tier,
    /// Sessions created in the current hour window.
    pub session_count: u32,
    /// Currently active (not yet released) session ids.
    pub active_sessions: usize,
    /// Commands recorded in the current minute window.
    pub command_count: u32,
    /// Currently open terminal connections.
    pub active_connections: usize,
}

/// Per-identity admission windows and concurrency caps.
///
/// Each tracking key gets its own critical section (a `dashmap` shard lock),
/// so unrelated keys never contend. Within a single call, check-then-mutate
/// against one key's record is atomic; across two separate calls (a
/// `check*` followed later by a `record*`) the Coordinator may interleave
/// with another caller for the same key, matching the slack the external
/// contract explicitly tolerates (testable property 3: "+1").
pub struct RateLimiter {
    records: DashMap<String, RateLimitRecord>,
    dev_mode: bool,
}

impl RateLimiter {
    /// Construct an empty limiter. `dev_mode` substitutes very-high limits
    /// for every tier (used together with `DISABLE_RATE_LIMIT`).
    pub fn new(dev_mode: bool) -> Self {
        Self {
            records: DashMap::new(),
            dev_mode,
        }
    }

    fn limits(&self, tier: Tier) -> TierLimits {
        limits_for(tier, self.dev_mode)
    }

    /// Check whether a new session may be admitted for `key`/`tier`.
    pub fn check_session_limit(&self, key: &str, tier: Tier) -> AdmissionResult {
        if matches!(tier, Tier::Admin) {
            return AdmissionResult::allow();
        }
        let now = Utc::now();
        let limits = self.limits(tier);
        let mut record = self
            .records
            .entry(key.to_string())
            .or_insert_with(|| RateLimitRecord::new(tier, now));
        record.roll_windows(now);

        let max_concurrent = record
            .session_max_override
            .unwrap_or(limits.max_concurrent_sessions);
        if record.active_session_ids.len() as u32 >= max_concurrent {
            return AdmissionResult::deny_concurrent();
        }
        if record.session_count >= limits.sessions_per_hour {
            let window = record.session_window_override.unwrap_or(SESSION_WINDOW);
            let retry = window
                .saturating_sub(chrono_elapsed(record.session_window_start, now))
                .as_secs();
            return AdmissionResult::deny_with_retry(retry);
        }
        AdmissionResult::allow()
    }

    /// Record a session admitted by a prior [`Self::check_session_limit`] call.
    pub fn record_session(&self, key: &str, session_id: &str, tier: Tier) {
        if matches!(tier, Tier::Admin) {
            return;
        }
        let now = Utc::now();
        let mut record = self
            .records
            .entry(key.to_string())
            .or_insert_with(|| RateLimitRecord::new(tier, now));
        record.roll_windows(now);
        record.session_count += 1;
        record.active_session_ids.insert(session_id.to_string());
    }

    /// Release a session's concurrency slot. Counters and window are untouched.
    pub fn remove_session(&self, key: &str, session_id: &str) {
        if let Some(mut record) = self.records.get_mut(key) {
            record.active_session_ids.remove(session_id);
        }
    }

    /// Check whether a command may be admitted for `key`/`tier`.
    pub fn check_command_limit(&self, key: &str, tier: Tier) -> AdmissionResult {
        if matches!(tier, Tier::Admin) {
            return AdmissionResult::allow();
        }
        let now = Utc::now();
        let limits = self.limits(tier);
        let mut record = self
            .records
            .entry(key.to_string())
            .or_insert_with(|| RateLimitRecord::new(tier, now));
        record.roll_windows(now);

        if record.command_count >= limits.commands_per_minute {
            let retry = COMMAND_WINDOW
                .saturating_sub(chrono_elapsed(record.command_window_start, now))
                .as_secs();
            return AdmissionResult::deny_with_retry(retry);
        }
        AdmissionResult::allow()
    }

    /// Record a command admitted by a prior [`Self::check_command_limit`] call.
    pub fn record_command(&self, key: &str, tier: Tier) {
        if matches!(tier, Tier::Admin) {
            return;
        }
        let now = Utc::now();
        let mut record = self
            .records
            .entry(key.to_string())
            .or_insert_with(|| RateLimitRecord::new(tier, now));
        record.roll_windows(now);
        record.command_count += 1;
    }

    /// Check whether a new terminal connection may be admitted.
    pub fn check_connection_limit(&self, key: &str, tier: Tier) -> AdmissionResult {
        if matches!(tier, Tier::Admin) {
            return AdmissionResult::allow();
        }
        let now = Utc::now();
        let limits = self.limits(tier);
        let record = self
            .records
            .entry(key.to_string())
            .or_insert_with(|| RateLimitRecord::new(tier, now));

        if record.active_connection_ids.len() as u32 >= limits.max_concurrent_connections {
            return AdmissionResult::deny_concurrent();
        }
        AdmissionResult::allow()
    }

    /// Register a connection admitted by a prior check.
    pub fn register_connection(&self, key: &str, connection_id: &str, tier: Tier) {
        if matches!(tier, Tier::Admin) {
            return;
        }
        let now = Utc::now();
        let mut record = self
            .records
            .entry(key.to_string())
            .or_insert_with(|| RateLimitRecord::new(tier, now));
        record
            .active_connection_ids
            .insert(connection_id.to_string());
    }

    /// Release a connection's concurrency slot.
    pub fn unregister_connection(&self, key: &str, connection_id: &str) {
        if let Some(mut record) = self.records.get_mut(key) {
            record.active_connection_ids.remove(connection_id);
        }
    }

    /// Admin: snapshot every tracked key.
    pub fn get_all(&self) -> Vec<RateLimitSnapshot> {
        self.records
            .iter()
            .map(|entry| snapshot(entry.key(), entry.value()))
            .collect()
    }

    /// Admin: snapshot a single key.
    ///
    /// # Errors
    ///
    /// Returns [`RateLimitError::NotFound`] if the key has no record.
    pub fn get(&self, key: &str) -> Result<RateLimitSnapshot, RateLimitError> {
        self.records
            .get(key)
            .map(|entry| snapshot(key, entry.value()))
            .ok_or_else(|| RateLimitError::NotFound(key.to_string()))
    }

    /// Admin: drop a key's record entirely.
    pub fn remove(&self, key: &str) {
        self.records.remove(key);
    }

    /// Admin: zero a key's windowed counters without touching active-id sets.
    ///
    /// # Errors
    ///
    /// Returns [`RateLimitError::NotFound`] if the key has no record.
    pub fn reset_limit(&self, key: &str) -> Result<(), RateLimitError> {
        let mut record = self
            .records
            .get_mut(key)
            .ok_or_else(|| RateLimitError::NotFound(key.to_string()))?;
        let now = Utc::now();
        record.session_count = 0;
        record.session_window_start = now;
        record.command_count = 0;
        record.command_window_start = now;
        Ok(())
    }

    /// Admin: override a key's session window and/or concurrent-session cap.
    /// Passing `None` for a field leaves that field's current override (or
    /// the tier default) unchanged.
    ///
    /// # Errors
    ///
    /// Returns [`RateLimitError::NotFound`] if the key has no record.
    pub fn adjust_limit(
        &self,
        key: &str,
        new_window: Option<Duration>,
        new_max: Option<u32>,
    ) -> Result<(), RateLimitError> {
        let mut record = self
            .records
            .get_mut(key)
            .ok_or_else(|| RateLimitError::NotFound(key.to_string()))?;
        if let Some(window) = new_window {
            record.session_window_override = Some(window);
        }
        if let Some(max) = new_max {
            record.session_max_override = Some(max);
        }
        Ok(())
    }
}

fn snapshot(key: &str, record: &RateLimitRecord) -> RateLimitSnapshot {
    RateLimitSnapshot {
        key: key.to_string(),
        tier: record.tier,
        session_count: record.session_count,
        active_sessions: record.active_session_ids.len(),
        command_count: record.command_count,
        active_connections: record.active_connection_ids.len(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_concurrent_cap() {
        let limiter = RateLimiter::new(false);
        let key = "ip:198.51.100.7";
        for i in 0..2 {
            assert!(limiter.check_session_limit(key, Tier::Anonymous).allowed);
            limiter.record_session(key, &format!("s{i}"), Tier::Anonymous);
        }
        let result = limiter.check_session_limit(key, Tier::Anonymous);
        assert!(!result.allowed);
        assert_eq!(result.retry_after_seconds, None);
    }

    #[test]
    fn test_session_release_frees_slot() {
        let limiter = RateLimiter::new(false);
        let key = "ip:198.51.100.7";
        limiter.record_session(key, "s0", Tier::Anonymous);
        limiter.record_session(key, "s1", Tier::Anonymous);
        assert!(!limiter.check_session_limit(key, Tier::Anonymous).allowed);
        limiter.remove_session(key, "s0");
        assert!(limiter.check_session_limit(key, Tier::Anonymous).allowed);
    }

    #[test]
    fn test_session_hourly_cap_retry_after() {
        let limiter = RateLimiter::new(false);
        let key = "user:alice";
        for i in 0..10 {
            assert!(limiter.check_session_limit(key, Tier::Anonymous).allowed);
            limiter.record_session(key, &format!("s{i}"), Tier::Anonymous);
            limiter.remove_session(key, &format!("s{i}"));
        }
        let result = limiter.check_session_limit(key, Tier::Anonymous);
        assert!(!result.allowed);
        let retry = result.retry_after_seconds.unwrap();
        assert!(retry > 0 && retry <= 3600);
    }

    #[test]
    fn test_admin_tier_never_denied() {
        let limiter = RateLimiter::new(false);
        let key = "user:root";
        for i in 0..1000 {
            assert!(limiter.check_session_limit(key, Tier::Admin).allowed);
            limiter.record_session(key, &format!("s{i}"), Tier::Admin);
        }
        assert!(limiter.check_command_limit(key, Tier::Admin).allowed);
        assert!(limiter.check_connection_limit(key, Tier::Admin).allowed);
    }

    #[test]
    fn test_record_then_remove_is_idempotent_on_active_count() {
        let limiter = RateLimiter::new(false);
        let key = "ip:203.0.113.1";
        limiter.record_session(key, "s0", Tier::Anonymous);
        limiter.remove_session(key, "s0");
        let snapshot = limiter.get(key).unwrap();
        assert_eq!(snapshot.active_sessions, 0);
        assert_eq!(snapshot.session_count, 1);
    }

    #[test]
    fn test_connection_concurrent_cap() {
        let limiter = RateLimiter::new(false);
        let key = "ip:198.51.100.7";
        limiter.register_connection(key, "c0", Tier::Anonymous);
        limiter.register_connection(key, "c1", Tier::Anonymous);
        assert!(!limiter.check_connection_limit(key, Tier::Anonymous).allowed);
        limiter.unregister_connection(key, "c0");
        assert!(limiter.check_connection_limit(key, Tier::Anonymous).allowed);
    }

    #[test]
    fn test_dev_mode_substitutes_high_limits() {
        let limiter = RateLimiter::new(true);
        let key = "ip:198.51.100.7";
        for i in 0..50 {
            assert!(limiter.check_session_limit(key, Tier::Anonymous).allowed);
            limiter.record_session(key, &format!("s{i}"), Tier::Anonymous);
        }
    }

    #[test]
    fn test_admin_get_missing_key_errors() {
        let limiter = RateLimiter::new(false);
        assert!(matches!(
            limiter.get("nonexistent"),
            Err(RateLimitError::NotFound(_))
        ));
    }

    #[test]
    fn test_adjust_limit_overrides_concurrent_cap() {
        let limiter = RateLimiter::new(false);
        let key = "ip:198.51.100.7";
        limiter.record_session(key, "s0", Tier::Anonymous);
        limiter.adjust_limit(key, None, Some(1)).unwrap();
        assert!(!limiter.check_session_limit(key, Tier::Anonymous).allowed);
    }

    #[test]
    fn test_reset_limit_zeroes_windowed_counters_only() {
        let limiter = RateLimiter::new(false);
        let key = "ip:198.51.100.7";
        limiter.record_session(key, "s0", Tier::Anonymous);
        limiter.reset_limit(key).unwrap();
        let snapshot = limiter.get(key).unwrap();
        assert_eq!(snapshot.session_count, 0);
        assert_eq!(snapshot.active_sessions, 1);
    }
}
