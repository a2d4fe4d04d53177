//! Shared clock and identifier helpers.
//!
//! Every timestamp ForgeFlow persists is RFC-3339 UTC; every run and incident
//! id embeds its mint time in unix milliseconds plus eight hex characters of
//! entropy, so ids sort chronologically and never collide in practice.

use chrono::{DateTime, SecondsFormat, Utc};
use ulid::Ulid;

/// Current time as an RFC-3339 UTC string with millisecond precision,
/// e.g. `2026-08-01T09:30:12.345Z`.
pub fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Current unix time in milliseconds.
pub fn now_unix_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Unique event identifier (ULID).
pub fn new_event_id() -> String {
    Ulid::new().to_string()
}

/// Eight lowercase hex characters of fresh entropy.
fn hex8() -> String {
    format!("{:08x}", (Ulid::new().random() & 0xffff_ffff) as u32)
}

/// Mint a run id: `run-{unix_ms}-{8 hex}`.
pub fn new_run_id() -> String {
    format!("run-{}-{}", now_unix_ms(), hex8())
}

/// Mint an incident id: `incident-{unix_ms}-{8 hex}`.
pub fn new_incident_id() -> String {
    format!("incident-{}-{}", now_unix_ms(), hex8())
}

/// Parse an RFC-3339 timestamp; `None` if malformed.
pub fn parse_rfc3339(ts: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(ts)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Age of `ts` relative to `now`, in whole seconds. Malformed or future
/// timestamps report zero age.
pub fn age_seconds(ts: &str, now: DateTime<Utc>) -> i64 {
    match parse_rfc3339(ts) {
        Some(then) => (now - then).num_seconds().max(0),
        None => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_now_rfc3339_parses_back() {
        let ts = now_rfc3339();
        assert!(ts.ends_with('Z'));
        assert!(parse_rfc3339(&ts).is_some());
    }

    #[test]
    fn test_run_id_shape() {
        let id = new_run_id();
        let parts: Vec<&str> = id.splitn(3, '-').collect();
        assert_eq!(parts[0], "run");
        assert!(parts[1].parse::<i64>().is_ok());
        assert_eq!(parts[2].len(), 8);
        assert!(parts[2].chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_incident_id_shape() {
        let id = new_incident_id();
        assert!(id.starts_with("incident-"));
        assert_eq!(id.rsplit('-').next().map(|s| s.len()), Some(8));
    }

    #[test]
    fn test_ids_are_unique() {
        assert_ne!(new_run_id(), new_run_id());
        assert_ne!(new_event_id(), new_event_id());
    }

    #[test]
    fn test_age_seconds() {
        let now = Utc::now();
        let week_ago = (now - chrono::Duration::days(7))
            .to_rfc3339_opts(SecondsFormat::Millis, true);
        let age = age_seconds(&week_ago, now);
        assert_eq!(age, 7 * 24 * 3600);
        assert_eq!(age_seconds("not-a-timestamp", now), 0);
    }
}
