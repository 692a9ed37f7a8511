//! Amplitude-threshold segmentation
//!
//! Flags a region as a segment when the smoothed energy envelope exceeds
//! the threshold, merges near-adjacent detections, then discards (and
//! counts) segments below the minimum duration.

use super::{energy_envelope, merge_close};
use crate::audio::AudioData;
use crate::config::AmplitudeSegConfig;

pub(super) fn detect(audio: &AudioData, config: &AmplitudeSegConfig) -> (Vec<(f64, f64)>, u32) {
    let envelope = energy_envelope(
        &audio.samples,
        audio.sample_rate,
        config.envelope_window_s,
        config.envelope_hop_s,
    );

    let hop_s = config.envelope_hop_s;
    let window_s = config.envelope_window_s;

    // Runs of above-threshold frames
    let mut detections: Vec<(f64, f64)> = Vec::new();
    let mut run_start: Option<usize> = None;
    for (i, &value) in envelope.iter().enumerate() {
        if value > config.threshold {
            if run_start.is_none() {
                run_start = Some(i);
            }
        } else if let Some(start) = run_start.take() {
            detections.push(frames_to_pair(start, i, hop_s, window_s));
        }
    }
    if let Some(start) = run_start {
        detections.push(frames_to_pair(start, envelope.len(), hop_s, window_s));
    }

    let merged = merge_close(detections, config.min_gap_s);

    let mut discarded_short = 0u32;
    let kept: Vec<(f64, f64)> = merged
        .into_iter()
        .filter(|(onset, offset)| {
            if offset - onset < config.min_duration_s {
                discarded_short += 1;
                log::debug!(
                    "discarding short segment [{:.3}, {:.3}]s below minimum {:.3}s",
                    onset,
                    offset,
                    config.min_duration_s
                );
                false
            } else {
                true
            }
        })
        .collect();

    (kept, discarded_short)
}

fn frames_to_pair(start: usize, end: usize, hop_s: f64, window_s: f64) -> (f64, f64) {
    let onset = start as f64 * hop_s;
    let offset = (end - 1) as f64 * hop_s + window_s;
    (onset, offset)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segment::{segment, SegmentationStrategy};

    /// Synthetic recording with sine bursts at the given spans.
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
    fn test_two_known_bursts_found_within_tolerance() {
        let audio = burst_audio(32000, 10.0, &[(1.0, 2.0), (5.0, 5.5)]);
        let strategy = SegmentationStrategy::Amplitude(AmplitudeSegConfig {
            threshold: 0.1,
            ..Default::default()
        });

        let set = segment(&audio, &strategy).unwrap();
        assert_eq!(set.len(), 2);

        use approx::assert_abs_diff_eq;
        let tolerance = 0.015;
        assert_abs_diff_eq!(set.pairs[0].0, 1.0, epsilon = tolerance);
        assert_abs_diff_eq!(set.pairs[0].1, 2.0, epsilon = tolerance);
        assert_abs_diff_eq!(set.pairs[1].0, 5.0, epsilon = tolerance);
        assert_abs_diff_eq!(set.pairs[1].1, 5.5, epsilon = tolerance);
    }

    #[test]
    fn test_silent_recording_yields_zero_segments() {
        let audio = burst_audio(32000, 3.0, &[]);
        let strategy = SegmentationStrategy::Amplitude(Default::default());

        let set = segment(&audio, &strategy).unwrap();
        assert!(set.is_empty());
        assert_eq!(set.stats.discarded_short, 0);
    }

    #[test]
    fn test_short_blip_discarded_and_counted() {
        // 5 ms blip, below the 30 ms minimum
        let audio = burst_audio(32000, 2.0, &[(1.0, 1.005)]);
        let strategy = SegmentationStrategy::Amplitude(AmplitudeSegConfig {
            threshold: 0.1,
            ..Default::default()
        });

        let set = segment(&audio, &strategy).unwrap();
        assert!(set.is_empty());
        assert_eq!(set.stats.discarded_short, 1);
    }

    #[test]
    fn test_near_adjacent_bursts_merged() {
        // 20 ms gap, below the 50 ms minimum gap
        let audio = burst_audio(32000, 3.0, &[(1.0, 1.2), (1.22, 1.4)]);
        let strategy = SegmentationStrategy::Amplitude(AmplitudeSegConfig {
            threshold: 0.1,
            ..Default::default()
        });

        let set = segment(&audio, &strategy).unwrap();
        assert_eq!(set.len(), 1);
        assert!(set.pairs[0].0 < 1.02);
        assert!(set.pairs[0].1 > 1.38);
    }

    #[test]
    fn test_burst_to_end_is_clipped_not_dropped() {
        let audio = burst_audio(32000, 2.0, &[(1.8, 2.0)]);
        let strategy = SegmentationStrategy::Amplitude(AmplitudeSegConfig {
            threshold: 0.1,
            ..Default::default()
        });

        let set = segment(&audio, &strategy).unwrap();
        assert_eq!(set.len(), 1);
        assert!(set.pairs[0].1 <= audio.duration_s());
        assert_eq!(set.stats.clipped, 1);
    }

    #[test]
    fn test_deterministic_across_runs() {
        let audio = burst_audio(32000, 10.0, &[(1.0, 2.0), (5.0, 5.5)]);
        let strategy = SegmentationStrategy::Amplitude(Default::default());

        let a = segment(&audio, &strategy).unwrap();
        let b = segment(&audio, &strategy).unwrap();
        assert_eq!(a, b);
    }
}
