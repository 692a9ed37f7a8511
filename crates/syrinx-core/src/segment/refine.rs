//! Boundary refinement
//!
//! Snaps segment boundaries to local energy minima within a search
//! radius. Operates only on an existing segment set plus the audio; the
//! result is fingerprinted as a layer over the producing fingerprint, so
//! the original parameters are never re-read.

use super::{energy_envelope, SegmentSet, SegmentStats};
use crate::audio::AudioData;
use crate::config::RefineConfig;
use crate::error::Result;
use crate::fingerprint::fingerprint_layered;

pub fn refine(audio: &AudioData, base: &SegmentSet, config: &RefineConfig) -> Result<SegmentSet> {
    config.validate()?;
    let fingerprint = fingerprint_layered("segments+refined", &base.fingerprint, config)?;

    let envelope = energy_envelope(
        &audio.samples,
        audio.sample_rate,
        config.envelope_window_s,
        config.envelope_hop_s,
    );
    let hop_s = config.envelope_hop_s;
    let duration_s = audio.duration_s();

    let mut pairs = Vec::with_capacity(base.pairs.len());
    let mut previous_offset = 0.0f64;
    for &(onset, offset) in &base.pairs {
        let mut new_onset = snap_to_minimum(&envelope, hop_s, onset, config.search_radius_s);
        let mut new_offset = snap_to_minimum(&envelope, hop_s, offset, config.search_radius_s);

        // Snapping must not reorder boundaries or cross neighbors.
        new_onset = new_onset.max(previous_offset);
        new_offset = new_offset.clamp(new_onset, duration_s);
        previous_offset = new_offset;

        pairs.push((new_onset, new_offset));
    }

    Ok(SegmentSet {
        pairs,
        fingerprint,
        stats: SegmentStats::default(),
    })
}

/// Earliest local envelope minimum within `radius_s` of `time_s`.
fn snap_to_minimum(envelope: &[f64], hop_s: f64, time_s: f64, radius_s: f64) -> f64 {
    if envelope.is_empty() {
        return time_s;
    }
    let center = (time_s / hop_s).round() as i64;
    let radius = (radius_s / hop_s).ceil() as i64;

    let lo = (center - radius).clamp(0, envelope.len() as i64 - 1) as usize;
    let hi = (center + radius).clamp(0, envelope.len() as i64 - 1) as usize;

    let mut best = lo;
    for i in lo..=hi {
        if envelope[i] < envelope[best] {
            best = i;
        }
    }
    best as f64 * hop_s
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AmplitudeSegConfig;
    use crate::segment::{segment, SegmentationStrategy};

    fn burst_audio(sample_rate: u32, total_s: f64, bursts: &[(f64, f64)]) -> AudioData {
        let total = (sample_rate as f64 * total_s) as usize;
        let mut samples = vec![0.0f32; total];
        for &(start, end) in bursts {
            let lo = (start * sample_rate as f64) as usize;
            let hi = ((end * sample_rate as f64) as usize).min(total);
            for (i, s) in samples[lo..hi].iter_mut().enumerate() {
                *s = (2.0 * std::f32::consts::PI * 2000.0 * i as f32 / sample_rate as f32).sin()
                    * 0.5;
            }
        }
        AudioData {
            samples,
            sample_rate,
            channels: 1,
            duration_ms: (total_s * 1000.0) as u32,
        }
    }

    #[test]
    fn test_refined_boundaries_stay_ordered_and_in_bounds() {
        let audio = burst_audio(32000, 10.0, &[(1.0, 2.0), (5.0, 5.5)]);
        let strategy = SegmentationStrategy::Amplitude(AmplitudeSegConfig {
            threshold: 0.1,
            ..Default::default()
        });
        let base = segment(&audio, &strategy).unwrap();

        let refined = refine(&audio, &base, &RefineConfig::default()).unwrap();
        assert_eq!(refined.len(), base.len());
        for window in refined.pairs.windows(2) {
            assert!(window[0].1 <= window[1].0);
        }
        for &(onset, offset) in &refined.pairs {
            assert!(onset >= 0.0 && offset <= audio.duration_s());
            assert!(onset <= offset);
        }
    }

    #[test]
    fn test_refined_fingerprint_layers_over_base() {
        let audio = burst_audio(32000, 4.0, &[(1.0, 1.5)]);
        let strategy = SegmentationStrategy::Amplitude(AmplitudeSegConfig {
            threshold: 0.1,
            ..Default::default()
        });
        let base = segment(&audio, &strategy).unwrap();

        let refined = refine(&audio, &base, &RefineConfig::default()).unwrap();
        assert_ne!(refined.fingerprint, base.fingerprint);

        // Same base, same refine config: same layered fingerprint.
        let again = refine(&audio, &base, &RefineConfig::default()).unwrap();
        assert_eq!(refined.fingerprint, again.fingerprint);
    }

    #[test]
    fn test_boundary_moves_toward_energy_minimum() {
        let audio = burst_audio(32000, 4.0, &[(1.0, 1.5)]);
        let strategy = SegmentationStrategy::Amplitude(AmplitudeSegConfig {
            threshold: 0.1,
            ..Default::default()
        });
        let base = segment(&audio, &strategy).unwrap();

        let refined = refine(
            &audio,
            &base,
            &RefineConfig {
                search_radius_s: 0.02,
                ..Default::default()
            },
        )
        .unwrap();

        // The onset detection fires slightly before the true burst start;
        // the energy minimum inside the radius sits at or before that
        // point, never inside the burst.
        assert!(refined.pairs[0].0 <= base.pairs[0].0 + 1e-9);
    }

    #[test]
    fn test_empty_set_refines_to_empty() {
        let audio = burst_audio(32000, 2.0, &[]);
        let strategy = SegmentationStrategy::Amplitude(Default::default());
        let base = segment(&audio, &strategy).unwrap();

        let refined = refine(&audio, &base, &RefineConfig::default()).unwrap();
        assert!(refined.is_empty());
    }
}
