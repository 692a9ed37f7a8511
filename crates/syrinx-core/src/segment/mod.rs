//! Vocalization segmentation
//!
//! Strategies are a closed, tagged set: an unrecognized strategy name
//! fails fast instead of falling through. All strategies consume audio
//! samples plus parameters and produce an ordered, non-overlapping set of
//! onset/offset pairs within the recording bounds.

pub mod amplitude;
pub mod refine;
pub mod template;

use crate::audio::AudioData;
use crate::config::{config_from_value, AmplitudeSegConfig, TemplateSegConfig};
use crate::error::{PipelineError, Result};
use crate::fingerprint::{fingerprint_params, Fingerprint};
use serde::{Deserialize, Serialize};

/// Return-side audit metadata for a segmentation run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SegmentStats {
    /// Segments dropped for falling below the minimum duration.
    pub discarded_short: u32,
    /// Offsets clipped to the recording duration.
    pub clipped: u32,
}

/// Ordered onset/offset pairs for one recording under one fingerprint.
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentSet {
    /// (onset, offset) pairs in seconds, ordered, non-overlapping, within
    /// [0, duration].
    pub pairs: Vec<(f64, f64)>,
    /// Fingerprint of the strategy and parameters that produced the set.
    pub fingerprint: Fingerprint,
    pub stats: SegmentStats,
}

impl SegmentSet {
    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }
}

/// Closed set of interchangeable segmentation algorithms.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SegmentationStrategy {
    Amplitude(AmplitudeSegConfig),
    Template(TemplateSegConfig),
}

impl SegmentationStrategy {
    pub fn name(&self) -> &'static str {
        match self {
            SegmentationStrategy::Amplitude(_) => "amplitude",
            SegmentationStrategy::Template(_) => "template",
        }
    }

    /// Resolve a strategy from a name and an untyped parameter table.
    /// Unknown names and unknown parameter keys fail fast.
    pub fn from_name(name: &str, params: serde_json::Value) -> Result<Self> {
        match name {
            "amplitude" => Ok(SegmentationStrategy::Amplitude(config_from_value(params)?)),
            "template" => Ok(SegmentationStrategy::Template(config_from_value(params)?)),
            other => Err(PipelineError::InvalidParameter(format!(
                "unknown segmentation strategy {:?}",
                other
            ))),
        }
    }

    pub fn validate(&self) -> Result<()> {
        match self {
            SegmentationStrategy::Amplitude(config) => config.validate(),
            SegmentationStrategy::Template(config) => config.validate(),
        }
    }

    /// Fingerprint of the strategy tag plus its parameters.
    pub fn fingerprint(&self) -> Result<Fingerprint> {
        fingerprint_params("segments", self)
    }
}

/// Segment one recording under the chosen strategy.
///
/// Zero segments is a valid outcome and is cached like any other result.
pub fn segment(audio: &AudioData, strategy: &SegmentationStrategy) -> Result<SegmentSet> {
    strategy.validate()?;
    let fingerprint = strategy.fingerprint()?;

    let (raw_pairs, discarded_short) = match strategy {
        SegmentationStrategy::Amplitude(config) => amplitude::detect(audio, config),
        SegmentationStrategy::Template(config) => template::detect(audio, config),
    };

    let (pairs, clipped) = clip_to_duration(raw_pairs, audio.duration_s());
    debug_assert_ordered(&pairs);

    Ok(SegmentSet {
        pairs,
        fingerprint,
        stats: SegmentStats {
            discarded_short,
            clipped,
        },
    })
}

/// Clip offsets that run past the recording end. Clipped segments are
/// kept and the clip is logged, never silently dropped.
fn clip_to_duration(pairs: Vec<(f64, f64)>, duration_s: f64) -> (Vec<(f64, f64)>, u32) {
    let mut clipped = 0u32;
    let out = pairs
        .into_iter()
        .map(|(onset, offset)| {
            if offset > duration_s {
                clipped += 1;
                log::warn!(
                    "clipping segment offset {:.3}s to recording duration {:.3}s",
                    offset,
                    duration_s
                );
                (onset.min(duration_s), duration_s)
            } else {
                (onset, offset)
            }
        })
        .collect();
    (out, clipped)
}

fn debug_assert_ordered(pairs: &[(f64, f64)]) {
    debug_assert!(pairs.windows(2).all(|w| w[0].1 <= w[1].0));
    debug_assert!(pairs.iter().all(|(on, off)| on <= off && *on >= 0.0));
}

/// Smoothed RMS energy envelope shared by the segmentation strategies.
///
/// Frame `i` covers samples `[i*hop, i*hop + window)`; the onset of a
/// detection is the start time of its first frame, the offset the end
/// time of its last frame.
pub(crate) fn energy_envelope(
    samples: &[f32],
    sample_rate: u32,
    window_s: f64,
    hop_s: f64,
) -> Vec<f64> {
    let window = ((window_s * sample_rate as f64) as usize).max(1);
    let hop = ((hop_s * sample_rate as f64) as usize).max(1);

    let mut envelope = Vec::with_capacity(samples.len() / hop + 1);
    let mut start = 0usize;
    while start < samples.len() {
        let end = (start + window).min(samples.len());
        let sum_sq: f64 = samples[start..end]
            .iter()
            .map(|&s| (s as f64) * (s as f64))
            .sum();
        envelope.push((sum_sq / (end - start) as f64).sqrt());
        start += hop;
    }
    envelope
}

/// Merge detections whose gap is below `min_gap_s`.
pub(crate) fn merge_close(pairs: Vec<(f64, f64)>, min_gap_s: f64) -> Vec<(f64, f64)> {
    let mut merged: Vec<(f64, f64)> = Vec::with_capacity(pairs.len());
    for (onset, offset) in pairs {
        match merged.last_mut() {
            Some(last) if onset - last.1 < min_gap_s => {
                last.1 = last.1.max(offset);
            }
            _ => merged.push((onset, offset)),
        }
    }
    merged
}
