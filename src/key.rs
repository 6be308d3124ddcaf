//! Cache keys and key rendering
//!
//! A cache key is the `(cacheName, renderedKey)` pair stored in Redis as
//! `<cacheName>::<renderedKey>`. Rendered keys are bounded: anything longer
//! than [`MAX_KEY_CHARS`] is replaced by a readable prefix plus a SHA-256
//! hex digest, deterministically, so equal inputs always map to equal keys.

use sha2::{Digest, Sha256};

use crate::traits::KeyGenerator;

/// Maximum rendered key length before digest compaction kicks in.
pub const MAX_KEY_CHARS: usize = 512;

/// Separator between cache name and rendered key in storage keys.
pub const KEY_SEPARATOR: &str = "::";

/// How much of the original key survives as a readable prefix when hashed.
const READABLE_PREFIX_CHARS: usize = 64;

/// A fully rendered `(cacheName, renderedKey)` pair
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    cache: String,
    rendered: String,
}

impl CacheKey {
    /// Build a key, applying the length bound to the rendered part.
    #[must_use]
    pub fn new(cache: impl Into<String>, rendered: impl Into<String>) -> Self {
        Self {
            cache: cache.into(),
            rendered: bound_key(&rendered.into()),
        }
    }

    #[must_use]
    pub fn cache_name(&self) -> &str {
        &self.cache
    }

    #[must_use]
    pub fn rendered(&self) -> &str {
        &self.rendered
    }

    /// The Redis key this entry lives under.
    #[must_use]
    pub fn storage_key(&self) -> String {
        format!("{}{}{}", self.cache, KEY_SEPARATOR, self.rendered)
    }

    /// Glob pattern matching every entry of a cache.
    #[must_use]
    pub fn cache_pattern(cache: &str) -> String {
        format!("{cache}{KEY_SEPARATOR}*")
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}{}{}", self.cache, KEY_SEPARATOR, self.rendered)
    }
}

/// Bound a rendered key to [`MAX_KEY_CHARS`].
///
/// Over-long keys keep a human-readable prefix and append the SHA-256 hex
/// digest of the full original, so operators can still recognize the key in
/// `redis-cli` while equality stays exact.
#[must_use]
pub fn bound_key(raw: &str) -> String {
    if raw.chars().count() <= MAX_KEY_CHARS {
        return raw.to_string();
    }
    let prefix: String = raw.chars().take(READABLE_PREFIX_CHARS).collect();
    let digest = Sha256::digest(raw.as_bytes());
    format!("{prefix}#{digest:x}")
}

/// Invocation facts available to key rendering
///
/// Produced by the binding layer; consumed by the expression evaluator or
/// the fallback generator.
#[derive(Debug, Clone)]
pub struct KeySource {
    /// Type owning the cached method.
    pub target_type: String,
    /// Cached method name.
    pub method: String,
    /// Argument values, in declaration order.
    pub args: Vec<serde_json::Value>,
}

impl KeySource {
    #[must_use]
    pub fn new(
        target_type: impl Into<String>,
        method: impl Into<String>,
        args: Vec<serde_json::Value>,
    ) -> Self {
        Self {
            target_type: target_type.into(),
            method: method.into(),
            args,
        }
    }
}

/// Fallback generator: stringifies `(targetType, methodName, args…)`
///
/// Used when an operation declares neither a key expression nor a named
/// generator. Output goes through the same length bound as rendered keys.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultKeyGenerator;

impl KeyGenerator for DefaultKeyGenerator {
    fn generate(&self, source: &KeySource) -> String {
        let mut parts = Vec::with_capacity(source.args.len() + 2);
        parts.push(source.target_type.clone());
        parts.push(source.method.clone());
        for arg in &source.args {
            parts.push(compact_json(arg));
        }
        bound_key(&parts.join(":"))
    }
}

fn compact_json(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn storage_key_joins_cache_and_rendered() {
        let key = CacheKey::new("users", "42");
        assert_eq!(key.storage_key(), "users::42");
        assert_eq!(CacheKey::cache_pattern("users"), "users::*");
    }

    #[test]
    fn short_keys_pass_through() {
        assert_eq!(bound_key("user:1"), "user:1");
    }

    #[test]
    fn long_keys_are_digested_deterministically() {
        let raw = "x".repeat(2_000);
        let a = bound_key(&raw);
        let b = bound_key(&raw);
        assert_eq!(a, b);
        assert!(a.len() <= MAX_KEY_CHARS);
        assert!(a.starts_with(&"x".repeat(READABLE_PREFIX_CHARS)));
        assert!(a.contains('#'));
    }

    #[test]
    fn distinct_long_keys_stay_distinct() {
        let a = bound_key(&format!("{}a", "k".repeat(600)));
        let b = bound_key(&format!("{}b", "k".repeat(600)));
        assert_ne!(a, b);
    }

    #[test]
    fn default_generator_is_stable() {
        let source = KeySource::new("demo.UserService", "find_by_id", vec![json!(1), json!("eu")]);
        let generator = DefaultKeyGenerator;
        assert_eq!(
            generator.generate(&source),
            "demo.UserService:find_by_id:1:eu"
        );
        assert_eq!(generator.generate(&source), generator.generate(&source));
    }
}
