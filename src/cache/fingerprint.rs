//! Step fingerprints
//!
//! A fingerprint is the SHA-256 of a canonical JSON document built from
//! the handler type, the handler version and the step's resolved inputs.
//! `serde_json::Map` keeps keys sorted, so the encoding does not depend on
//! the order keys were declared in and stays stable across restarts.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};

/// Deterministic cache key for one step dispatch.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Computes the fingerprint of a dispatch.
    pub fn compute(handler: &str, handler_version: &str, inputs: &Map<String, Value>) -> Self {
        let document = json!({
            "handler": handler,
            "handler_version": handler_version,
            "inputs": inputs,
        });

        let mut hasher = Sha256::new();
        hasher.update(document.to_string().as_bytes());
        let digest = hasher.finalize();

        let mut hex = String::with_capacity(digest.len() * 2);
        for byte in digest {
            hex.push_str(&format!("{:02x}", byte));
        }
        Self(hex)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 12 hex characters, for log lines.
    pub fn short(&self) -> &str {
        &self.0[..self.0.len().min(12)]
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inputs(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_fingerprint_ignores_key_order() {
        let a = Fingerprint::compute("echo", "1", &inputs(json!({"a": 1, "b": [1, 2]})));
        let b = Fingerprint::compute("echo", "1", &inputs(json!({"b": [1, 2], "a": 1})));
        assert_eq!(a, b);
        assert_eq!(a.as_str().len(), 64);
        assert_eq!(a.short().len(), 12);
    }

    #[test]
    fn test_fingerprint_distinguishes_context() {
        let base = Fingerprint::compute("echo", "1", &inputs(json!({"a": 1})));
        assert_ne!(base, Fingerprint::compute("echo", "2", &inputs(json!({"a": 1}))));
        assert_ne!(base, Fingerprint::compute("shell", "1", &inputs(json!({"a": 1}))));
        assert_ne!(base, Fingerprint::compute("echo", "1", &inputs(json!({"a": 2}))));
    }

    #[test]
    fn test_fingerprint_is_stable() {
        // Pinned so an encoding change that would orphan persisted entries is noticed
        assert_eq!(
            Fingerprint::compute("echo", "1", &Map::new()).as_str(),
            "b42f5d9cf7a93853099a5205ab7108872c015701f005a593f535a4acc8d52be0"
        );
        assert_eq!(
            Fingerprint::compute("echo", "1", &inputs(json!({"b": [1, 2], "a": 1}))).as_str(),
            "02a9bad547efbc8756bae88f78779098f2cd22aa6000ee12d40f70d105d453c5"
        );
    }
}
