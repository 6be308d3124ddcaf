//! Value envelope — the only format written to Redis
//!
//! Every cached payload is wrapped in a [`ValueEnvelope`] carrying its type
//! name, creation time, TTL and access counters. The wire format is a
//! camelCase JSON record so other-language readers can consume it; unknown
//! fields are ignored on decode.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Distinguished `type` value identifying a cached-null envelope.
///
/// Domain values always carry their own declared type name, so this marker
/// is unambiguous on decode.
pub const NULL_MARKER_TYPE: &str = "cache-shield/null";

/// TTL value meaning "never expires".
pub const ETERNAL_TTL: i64 = -1;

/// Payload wrapper persisted under `<cacheName>::<renderedKey>`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValueEnvelope {
    /// The cached value; JSON null for the null marker.
    pub value: Value,
    /// Declared type name of the value, or [`NULL_MARKER_TYPE`].
    #[serde(rename = "type")]
    pub type_name: String,
    /// TTL in seconds; [`ETERNAL_TTL`] for eternal entries.
    pub ttl: i64,
    /// Creation instant, epoch milliseconds.
    pub created_time: i64,
    /// Last read instant, epoch milliseconds. Never before `created_time`.
    pub last_access_time: i64,
    /// Monotonic read counter.
    pub visit_times: u64,
    /// Whether the entry was already past its TTL when last observed.
    #[serde(default)]
    pub expired: bool,
    /// Strictly increases on each overwrite of the same key.
    pub version: u64,
}

impl ValueEnvelope {
    /// Envelope for a freshly loaded value, version 1.
    #[must_use]
    pub fn new(value: Value, type_name: impl Into<String>, ttl_seconds: u64, now_ms: i64) -> Self {
        Self {
            value,
            type_name: type_name.into(),
            ttl: if ttl_seconds == 0 {
                ETERNAL_TTL
            } else {
                i64::try_from(ttl_seconds).unwrap_or(i64::MAX)
            },
            created_time: now_ms,
            last_access_time: now_ms,
            visit_times: 0,
            expired: false,
            version: 1,
        }
    }

    /// Envelope representing a cached null.
    #[must_use]
    pub fn null_marker(ttl_seconds: u64, now_ms: i64) -> Self {
        Self::new(Value::Null, NULL_MARKER_TYPE, ttl_seconds, now_ms)
    }

    /// Whether this envelope is the cached-null sentinel.
    #[must_use]
    pub fn is_null_marker(&self) -> bool {
        self.type_name == NULL_MARKER_TYPE
    }

    /// Whether the entry never expires.
    #[must_use]
    pub fn is_eternal(&self) -> bool {
        self.ttl <= 0
    }

    /// Record a read: bump the visit counter and the access stamp.
    ///
    /// `last_access_time` never moves backwards even with a skewed clock.
    pub fn touch(&mut self, now_ms: i64) {
        self.visit_times = self.visit_times.saturating_add(1);
        if now_ms > self.last_access_time {
            self.last_access_time = now_ms;
        }
    }

    /// Successor envelope for an overwrite of the same key.
    ///
    /// Carries `version + 1`; creation and access stamps restart at `now_ms`.
    #[must_use]
    pub fn next_version(
        &self,
        value: Value,
        type_name: impl Into<String>,
        ttl_seconds: u64,
        now_ms: i64,
    ) -> Self {
        let mut next = Self::new(value, type_name, ttl_seconds, now_ms);
        next.version = self.version.saturating_add(1);
        next
    }

    /// TTL in seconds for storage, `None` when eternal.
    #[must_use]
    pub fn storage_ttl_seconds(&self) -> Option<u64> {
        if self.is_eternal() {
            None
        } else {
            u64::try_from(self.ttl).ok()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn round_trips_through_json() {
        let env = ValueEnvelope::new(json!({"id": 1, "name": "David"}), "demo.User", 300, 1_000);
        let bytes = serde_json::to_vec(&env).unwrap();
        let back: ValueEnvelope = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(back, env);
    }

    #[test]
    fn wire_field_names_are_camel_case() {
        let env = ValueEnvelope::new(json!(42), "i64", 10, 5);
        let text = serde_json::to_string(&env).unwrap();
        for field in [
            "\"value\"",
            "\"type\"",
            "\"ttl\"",
            "\"createdTime\"",
            "\"lastAccessTime\"",
            "\"visitTimes\"",
            "\"expired\"",
            "\"version\"",
        ] {
            assert!(text.contains(field), "missing {field} in {text}");
        }
    }

    #[test]
    fn unknown_fields_are_ignored_on_decode() {
        let text = r#"{
            "value": 7, "type": "i64", "ttl": 60,
            "createdTime": 1, "lastAccessTime": 2,
            "visitTimes": 3, "expired": false, "version": 4,
            "someFutureField": {"nested": true}
        }"#;
        let env: ValueEnvelope = serde_json::from_str(text).unwrap();
        assert_eq!(env.version, 4);
        assert_eq!(env.value, json!(7));
    }

    #[test]
    fn null_marker_is_unambiguous() {
        let marker = ValueEnvelope::null_marker(60, 0);
        assert!(marker.is_null_marker());

        // A domain value that happens to be JSON null is not the marker.
        let domain_null = ValueEnvelope::new(Value::Null, "demo.Opt", 60, 0);
        assert!(!domain_null.is_null_marker());
    }

    #[test]
    fn zero_ttl_means_eternal() {
        let env = ValueEnvelope::new(json!(1), "i64", 0, 0);
        assert_eq!(env.ttl, ETERNAL_TTL);
        assert!(env.is_eternal());
        assert_eq!(env.storage_ttl_seconds(), None);
    }

    #[test]
    fn version_increases_and_access_time_never_regresses() {
        let mut env = ValueEnvelope::new(json!(1), "i64", 60, 1_000);
        env.touch(2_000);
        env.touch(1_500); // behind the latest stamp
        assert_eq!(env.visit_times, 2);
        assert_eq!(env.last_access_time, 2_000);
        assert!(env.created_time <= env.last_access_time);

        let next = env.next_version(json!(2), "i64", 60, 3_000);
        assert_eq!(next.version, 2);
        assert_eq!(next.visit_times, 0);
        assert_eq!(next.created_time, 3_000);
    }
}
