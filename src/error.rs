//! Error types for the cache engine
//!
//! One error enum covering the failure kinds the pipeline distinguishes:
//! transient Redis I/O, envelope decode failures, lock timeouts, origin
//! loader failures, invalid operation descriptors, and bloom faults.
//! Read-path handlers may degrade most of these to a miss; write-path
//! handlers propagate.

use thiserror::Error;

/// Errors surfaced by cache operations
#[derive(Debug, Error)]
pub enum CacheError {
    /// Redis connect/read/write failure or timeout. The client layer retries;
    /// this surfaces once attempts are exhausted.
    #[error("transient redis i/o failure: {0}")]
    Transient(String),

    /// Envelope decode failed. The offending key is evicted and the read is
    /// treated as a miss.
    #[error("envelope decode failed for '{key}': {detail}")]
    Serialization { key: String, detail: String },

    /// Neither the local nor the distributed lock was acquired within bounds.
    #[error("lock '{key}' not acquired within {timeout_ms} ms")]
    LockTimeout { key: String, timeout_ms: u64 },

    /// The origin loader threw. Never cached; under pre-refresh the stale
    /// value is retained.
    #[error("origin loader failed for '{key}'")]
    LoaderFailure {
        key: String,
        #[source]
        source: anyhow::Error,
    },

    /// The origin loader returned null on a path that does not cache nulls.
    #[error("loader returned null for '{key}' and null caching is disabled")]
    NullLoaderResult { key: String },

    /// Rejected at registration by descriptor validation. Never raised at
    /// read time.
    #[error("invalid cache operation for '{cache}': {reason}")]
    ConfigurationInvalid { cache: String, reason: String },

    /// Bloom filter fault. Membership checks fail open instead of raising
    /// this; it is reported through stats and events.
    #[error("bloom filter failure for '{cache}': {detail}")]
    Bloom { cache: String, detail: String },
}

impl CacheError {
    /// True when the error should be treated as a miss on the read path.
    #[must_use]
    pub fn degrades_to_miss(&self) -> bool {
        matches!(
            self,
            Self::Transient(_) | Self::Serialization { .. } | Self::Bloom { .. }
        )
    }
}

impl From<redis::RedisError> for CacheError {
    fn from(err: redis::RedisError) -> Self {
        Self::Transient(err.to_string())
    }
}

/// Severity classification for operator attention
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSeverity {
    /// Degraded service; the pipeline compensates (miss, stale value, retry).
    Degraded,
    /// Needs operator attention: resource exhaustion or a dead dependency.
    Critical,
}

/// Classify an error for alerting purposes.
///
/// Connection-refused, pool exhaustion and memory exhaustion are flagged
/// critical; everything else the pipeline can ride out.
#[must_use]
pub fn classify(err: &CacheError) -> ErrorSeverity {
    let critical_markers = [
        "connection refused",
        "pool exhausted",
        "no connection available",
        "out of memory",
        "stack overflow",
    ];
    let text = err.to_string().to_lowercase();
    let source_text = match err {
        CacheError::LoaderFailure { source, .. } => source.to_string().to_lowercase(),
        _ => String::new(),
    };
    if critical_markers
        .iter()
        .any(|m| text.contains(m) || source_text.contains(m))
    {
        ErrorSeverity::Critical
    } else {
        ErrorSeverity::Degraded
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_degrades_to_miss() {
        let err = CacheError::Transient("timeout".into());
        assert!(err.degrades_to_miss());
    }

    #[test]
    fn lock_timeout_does_not_degrade() {
        let err = CacheError::LockTimeout {
            key: "users::1".into(),
            timeout_ms: 10_000,
        };
        assert!(!err.degrades_to_miss());
    }

    #[test]
    fn connection_refused_is_critical() {
        let err = CacheError::Transient("Connection refused (os error 111)".into());
        assert_eq!(classify(&err), ErrorSeverity::Critical);
    }

    #[test]
    fn decode_failure_is_degraded() {
        let err = CacheError::Serialization {
            key: "users::1".into(),
            detail: "unexpected eof".into(),
        };
        assert_eq!(classify(&err), ErrorSeverity::Degraded);
    }
}
