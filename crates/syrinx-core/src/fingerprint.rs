//! Parameter fingerprints
//!
//! A fingerprint is a deterministic digest of a canonicalized parameter
//! set: SHA-256 over the stage tag and the canonical JSON rendering of a
//! typed config, truncated to 16 hex characters. JSON objects serialize
//! with sorted keys, so two semantically equal parameter sets digest
//! identically regardless of insertion order. Fingerprints are compared
//! for equality only, never decoded back into parameters.

use crate::error::{PipelineError, Result};
use serde::Serialize;
use sha2::{Digest, Sha256};

/// Number of hex characters kept from the SHA-256 digest.
pub const FINGERPRINT_HEX_LEN: usize = 16;

/// Stable identity of a canonicalized parameter set.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Digest a stage's parameter set.
pub fn fingerprint_params<T: Serialize>(stage: &str, params: &T) -> Result<Fingerprint> {
    digest(stage, None, params)
}

/// Digest a parameter set layered on a base fingerprint, for passes that
/// transform an existing artifact (e.g. boundary refinement over a
/// segment set) without re-reading the parameters that produced it.
pub fn fingerprint_layered<T: Serialize>(
    stage: &str,
    base: &Fingerprint,
    params: &T,
) -> Result<Fingerprint> {
    digest(stage, Some(base), params)
}

fn digest<T: Serialize>(stage: &str, base: Option<&Fingerprint>, params: &T) -> Result<Fingerprint> {
    let value = serde_json::to_value(params).map_err(|e| {
        PipelineError::InvalidParameter(format!("parameters are not serializable: {}", e))
    })?;
    // serde_json object maps are ordered by key, so this rendering is the
    // canonical form.
    let canonical = serde_json::to_string(&value).map_err(|e| {
        PipelineError::InvalidParameter(format!("canonicalization failed: {}", e))
    })?;

    let mut hasher = Sha256::new();
    hasher.update(stage.as_bytes());
    hasher.update([0u8]);
    if let Some(base) = base {
        hasher.update(base.as_str().as_bytes());
        hasher.update([0u8]);
    }
    hasher.update(canonical.as_bytes());

    let digest = hasher.finalize();
    let mut hex = String::with_capacity(FINGERPRINT_HEX_LEN);
    for byte in digest.iter().take(FINGERPRINT_HEX_LEN / 2) {
        hex.push_str(&format!("{:02x}", byte));
    }
    Ok(Fingerprint(hex))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AmplitudeSegConfig, RefineConfig, SpectrogramConfig};
    use serde_json::json;

    #[test]
    fn test_key_order_does_not_matter() {
        let a = json!({ "threshold": 0.1, "min_gap_s": 0.05 });
        let b = json!({ "min_gap_s": 0.05, "threshold": 0.1 });
        assert_eq!(
            fingerprint_params("segments", &a).unwrap(),
            fingerprint_params("segments", &b).unwrap()
        );
    }

    #[test]
    fn test_value_change_changes_fingerprint() {
        let base = SpectrogramConfig::default();
        let changed = SpectrogramConfig {
            hop_length: base.hop_length + 1,
            ..base.clone()
        };
        assert_ne!(
            fingerprint_params("spectrograms", &base).unwrap(),
            fingerprint_params("spectrograms", &changed).unwrap()
        );
    }

    #[test]
    fn test_stage_tag_separates_namespaces() {
        let config = AmplitudeSegConfig::default();
        assert_ne!(
            fingerprint_params("segments", &config).unwrap(),
            fingerprint_params("spectrograms", &config).unwrap()
        );
    }

    #[test]
    fn test_layered_fingerprint_depends_on_base() {
        let refine = RefineConfig::default();
        let base_a = fingerprint_params("segments", &AmplitudeSegConfig::default()).unwrap();
        let base_b = fingerprint_params(
            "segments",
            &AmplitudeSegConfig {
                threshold: 0.2,
                ..Default::default()
            },
        )
        .unwrap();

        assert_ne!(
            fingerprint_layered("segments+refined", &base_a, &refine).unwrap(),
            fingerprint_layered("segments+refined", &base_b, &refine).unwrap()
        );
    }

    #[test]
    fn test_fingerprint_is_stable_across_calls() {
        let config = AmplitudeSegConfig::default();
        let a = fingerprint_params("segments", &config).unwrap();
        let b = fingerprint_params("segments", &config).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.as_str().len(), FINGERPRINT_HEX_LEN);
        assert!(a.as_str().chars().all(|c| c.is_ascii_hexdigit()));
    }
}
