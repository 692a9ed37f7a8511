//! Template-matching segmentation
//!
//! Cross-correlates a reference envelope template against the recording
//! envelope and thresholds the normalized correlation score.

use super::{energy_envelope, merge_close};
use crate::audio::AudioData;
use crate::config::TemplateSegConfig;

pub(super) fn detect(audio: &AudioData, config: &TemplateSegConfig) -> (Vec<(f64, f64)>, u32) {
    let envelope = energy_envelope(
        &audio.samples,
        audio.sample_rate,
        config.envelope_window_s,
        config.envelope_hop_s,
    );

    let template: Vec<f64> = config.template.iter().map(|&v| v as f64).collect();
    let len = template.len();
    if envelope.len() < len {
        return (Vec::new(), 0);
    }

    let template_mean = template.iter().sum::<f64>() / len as f64;
    let template_dev: Vec<f64> = template.iter().map(|v| v - template_mean).collect();
    let template_norm = template_dev.iter().map(|v| v * v).sum::<f64>().sqrt();

    let hop_s = config.envelope_hop_s;
    let window_s = config.envelope_window_s;
    let span_s = (len - 1) as f64 * hop_s + window_s;

    let mut detections: Vec<(f64, f64)> = Vec::new();
    for start in 0..=(envelope.len() - len) {
        let score = correlation(&envelope[start..start + len], &template_dev, template_norm);
        if score >= config.threshold {
            let onset = start as f64 * hop_s;
            detections.push((onset, onset + span_s));
        }
    }

    // Above-threshold positions cluster around each true match; merging
    // collapses a cluster into one segment.
    let merged = merge_close(detections, config.min_gap_s);
    (merged, 0)
}

/// Zero-normalized cross-correlation in [-1, 1]. Flat windows score 0.
fn correlation(window: &[f64], template_dev: &[f64], template_norm: f64) -> f64 {
    let mean = window.iter().sum::<f64>() / window.len() as f64;

    let mut dot = 0.0;
    let mut norm_sq = 0.0;
    for (value, t_dev) in window.iter().zip(template_dev) {
        let dev = value - mean;
        dot += dev * t_dev;
        norm_sq += dev * dev;
    }

    let denom = norm_sq.sqrt() * template_norm;
    if denom <= f64::EPSILON {
        return 0.0;
    }
    dot / denom
}
