//! Configuration parameters for the processing stages
//!
//! Each stage owns a validated configuration struct with documented
//! defaults. Deserialization rejects unknown keys, so a typo'd option
//! surfaces as an error instead of silently producing a different
//! parameter fingerprint.

use crate::error::{PipelineError, Result};
use serde::{Deserialize, Serialize};

/// Amplitude-threshold segmentation parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct AmplitudeSegConfig {
    /// Envelope value above which a region counts as vocalization
    pub threshold: f64,
    /// Minimum segment duration in seconds; shorter detections are
    /// discarded and counted
    pub min_duration_s: f64,
    /// Detections separated by less than this gap are merged
    pub min_gap_s: f64,
    /// RMS envelope window in seconds
    pub envelope_window_s: f64,
    /// RMS envelope hop in seconds
    pub envelope_hop_s: f64,
}

impl Default for AmplitudeSegConfig {
    fn default() -> Self {
        Self {
            threshold: 0.1,
            min_duration_s: 0.03,
            min_gap_s: 0.05,
            envelope_window_s: 0.005,
            envelope_hop_s: 0.001,
        }
    }
}

impl AmplitudeSegConfig {
    pub fn validate(&self) -> Result<()> {
        require_positive("threshold", self.threshold)?;
        require_positive("min_duration_s", self.min_duration_s)?;
        require_finite("min_gap_s", self.min_gap_s)?;
        if self.min_gap_s < 0.0 {
            return Err(PipelineError::InvalidParameter(
                "min_gap_s must be >= 0".to_string(),
            ));
        }
        require_positive("envelope_window_s", self.envelope_window_s)?;
        require_positive("envelope_hop_s", self.envelope_hop_s)?;
        Ok(())
    }
}

/// Template-matching segmentation parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct TemplateSegConfig {
    /// Reference envelope template, sampled at the envelope hop
    pub template: Vec<f32>,
    /// Normalized cross-correlation score above which a match seeds a
    /// segment (0..1]
    pub threshold: f64,
    /// Matches separated by less than this gap are merged
    pub min_gap_s: f64,
    /// RMS envelope window in seconds
    pub envelope_window_s: f64,
    /// RMS envelope hop in seconds
    pub envelope_hop_s: f64,
}

impl Default for TemplateSegConfig {
    fn default() -> Self {
        Self {
            template: Vec::new(),
            threshold: 0.7,
            min_gap_s: 0.05,
            envelope_window_s: 0.005,
            envelope_hop_s: 0.001,
        }
    }
}

impl TemplateSegConfig {
    pub fn validate(&self) -> Result<()> {
        if self.template.is_empty() {
            return Err(PipelineError::InvalidParameter(
                "template must not be empty".to_string(),
            ));
        }
        if self.template.iter().any(|v| !v.is_finite()) {
            return Err(PipelineError::InvalidParameter(
                "template contains non-finite values".to_string(),
            ));
        }
        require_positive("threshold", self.threshold)?;
        if self.threshold > 1.0 {
            return Err(PipelineError::InvalidParameter(
                "threshold must be <= 1 for normalized correlation".to_string(),
            ));
        }
        if self.min_gap_s < 0.0 || !self.min_gap_s.is_finite() {
            return Err(PipelineError::InvalidParameter(
                "min_gap_s must be >= 0".to_string(),
            ));
        }
        require_positive("envelope_window_s", self.envelope_window_s)?;
        require_positive("envelope_hop_s", self.envelope_hop_s)?;
        Ok(())
    }
}

/// Boundary refinement parameters
///
/// Applied to an existing segment set; fingerprinted as a layer on top of
/// the producing segmentation fingerprint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct RefineConfig {
    /// Each boundary may move at most this far to reach a local energy
    /// minimum
    pub search_radius_s: f64,
    /// RMS envelope window in seconds
    pub envelope_window_s: f64,
    /// RMS envelope hop in seconds
    pub envelope_hop_s: f64,
}

impl Default for RefineConfig {
    fn default() -> Self {
        Self {
            search_radius_s: 0.01,
            envelope_window_s: 0.005,
            envelope_hop_s: 0.001,
        }
    }
}

impl RefineConfig {
    pub fn validate(&self) -> Result<()> {
        require_positive("search_radius_s", self.search_radius_s)?;
        require_positive("envelope_window_s", self.envelope_window_s)?;
        require_positive("envelope_hop_s", self.envelope_hop_s)?;
        Ok(())
    }
}

/// Frequency axis scaling for spectrograms
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FreqScale {
    Linear,
    Mel,
}

/// Spectrogram extraction parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct SpectrogramConfig {
    /// Sample rate the audio is decoded to before the transform
    pub sample_rate: u32,
    /// STFT window length in samples
    pub window_length: usize,
    /// STFT hop length in samples
    pub hop_length: usize,
    /// Frequency axis scaling
    pub freq_scale: FreqScale,
    /// Lowest frequency of interest in Hz
    pub min_freq: f64,
    /// Highest frequency of interest in Hz
    pub max_freq: f64,
    /// Fixed number of frequency bins in every output record
    pub shape_freq_bins: usize,
    /// Fixed number of time bins in every output record
    pub shape_time_bins: usize,
    /// Log-magnitude floor in dB; padding uses this silence floor
    pub log_floor_db: f64,
}

impl Default for SpectrogramConfig {
    fn default() -> Self {
        Self {
            sample_rate: 32000,
            window_length: 512,
            hop_length: 128,
            freq_scale: FreqScale::Mel,
            min_freq: 400.0,
            max_freq: 10000.0,
            shape_freq_bins: 128,
            shape_time_bins: 128,
            log_floor_db: -80.0,
        }
    }
}

impl SpectrogramConfig {
    pub fn validate(&self) -> Result<()> {
        if self.sample_rate == 0 {
            return Err(PipelineError::InvalidParameter(
                "sample_rate must be > 0".to_string(),
            ));
        }
        if self.window_length == 0 || self.hop_length == 0 {
            return Err(PipelineError::InvalidParameter(
                "window_length and hop_length must be > 0".to_string(),
            ));
        }
        if self.hop_length > self.window_length {
            return Err(PipelineError::InvalidParameter(
                "hop_length must not exceed window_length".to_string(),
            ));
        }
        if self.shape_freq_bins == 0 || self.shape_time_bins == 0 {
            return Err(PipelineError::InvalidParameter(
                "target shape dimensions must be > 0".to_string(),
            ));
        }
        require_finite("min_freq", self.min_freq)?;
        require_finite("max_freq", self.max_freq)?;
        if self.min_freq < 0.0 || self.min_freq >= self.max_freq {
            return Err(PipelineError::InvalidParameter(
                "min_freq must be >= 0 and < max_freq".to_string(),
            ));
        }
        if self.max_freq > self.sample_rate as f64 / 2.0 {
            return Err(PipelineError::InvalidParameter(format!(
                "max_freq {} exceeds Nyquist for sample_rate {}",
                self.max_freq, self.sample_rate
            )));
        }
        if !self.log_floor_db.is_finite() || self.log_floor_db >= 0.0 {
            return Err(PipelineError::InvalidParameter(
                "log_floor_db must be a finite negative value".to_string(),
            ));
        }
        Ok(())
    }
}

fn require_positive(name: &str, value: f64) -> Result<()> {
    if !value.is_finite() || value <= 0.0 {
        return Err(PipelineError::InvalidParameter(format!(
            "{} must be a positive finite value, got {}",
            name, value
        )));
    }
    Ok(())
}

fn require_finite(name: &str, value: f64) -> Result<()> {
    if !value.is_finite() {
        return Err(PipelineError::InvalidParameter(format!(
            "{} must be finite",
            name
        )));
    }
    Ok(())
}

/// Deserialize a stage config from an untyped parameter table, mapping
/// unknown-key failures to the unrecognized-parameter error.
pub fn config_from_value<T: serde::de::DeserializeOwned>(value: serde_json::Value) -> Result<T> {
    serde_json::from_value(value).map_err(|e| {
        let msg = e.to_string();
        if msg.contains("unknown field") {
            PipelineError::UnrecognizedParameter(msg)
        } else {
            PipelineError::InvalidParameter(msg)
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_defaults_validate() {
        AmplitudeSegConfig::default().validate().unwrap();
        RefineConfig::default().validate().unwrap();
        SpectrogramConfig::default().validate().unwrap();
    }

    #[test]
    fn test_negative_threshold_rejected() {
        let config = AmplitudeSegConfig {
            threshold: -0.5,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(PipelineError::InvalidParameter(_))
        ));
    }

    #[test]
    fn test_empty_template_rejected() {
        let err = TemplateSegConfig::default().validate();
        assert!(matches!(err, Err(PipelineError::InvalidParameter(_))));
    }

    #[test]
    fn test_nyquist_violation_rejected() {
        let config = SpectrogramConfig {
            sample_rate: 16000,
            max_freq: 10000.0,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(PipelineError::InvalidParameter(_))
        ));
    }

    #[test]
    fn test_unknown_key_is_unrecognized_parameter() {
        let value = json!({ "threshold": 0.2, "min_druation_s": 0.05 });
        let err = config_from_value::<AmplitudeSegConfig>(value);
        assert!(matches!(err, Err(PipelineError::UnrecognizedParameter(_))));
    }

    #[test]
    fn test_known_keys_deserialize_with_defaults() {
        let value = json!({ "threshold": 0.2 });
        let config: AmplitudeSegConfig = config_from_value(value).unwrap();
        assert_eq!(config.threshold, 0.2);
        assert_eq!(config.min_gap_s, AmplitudeSegConfig::default().min_gap_s);
    }
}
