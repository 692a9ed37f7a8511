//! Per-segment spectrogram extraction
//!
//! For each onset/offset pair the corresponding audio window is run
//! through an STFT and mapped onto a fixed target shape: row-centre
//! frequencies (linear or mel spacing) sampled from the magnitude
//! spectrum, log-scaled against a silence floor, then centre-cropped or
//! floor-padded along time. Identical inputs always produce bit-identical
//! output.

use crate::audio::AudioData;
use crate::config::{FreqScale, SpectrogramConfig};
use crate::error::{PipelineError, Result};
use crate::fingerprint::{fingerprint_params, Fingerprint};
use crate::segment::SegmentSet;
use rustfft::{num_complex::Complex, FftPlanner};
use std::f64::consts::PI;

/// One fixed-shape spectrogram tied to a segment.
#[derive(Debug, Clone, PartialEq)]
pub struct SpectrogramRecord {
    /// Position of the owning segment within its segment set.
    pub segment_index: u32,
    pub onset: f64,
    pub offset: f64,
    /// Row-major values, shape_freq_bins rows by shape_time_bins columns,
    /// in [0, 1] with 0 at the silence floor.
    pub data: Vec<f32>,
}

/// All records produced for one (recording, segment set, config) triple.
#[derive(Debug, Clone, PartialEq)]
pub struct SpectrogramBatch {
    pub records: Vec<SpectrogramRecord>,
    /// Segments too short to produce a single transform frame; skipped
    /// and counted, never raised.
    pub skipped_short: u32,
    pub config_fingerprint: Fingerprint,
    pub segset_fingerprint: Fingerprint,
}

impl SpectrogramBatch {
    /// Count invariant: every segment is either represented or skipped.
    pub fn accounts_for(&self, segment_count: usize) -> bool {
        self.records.len() + self.skipped_short as usize == segment_count
    }
}

/// Build fixed-shape spectrograms for every segment of a recording.
pub fn build(
    audio: &AudioData,
    segments: &SegmentSet,
    config: &SpectrogramConfig,
) -> Result<SpectrogramBatch> {
    config.validate()?;
    if audio.sample_rate != config.sample_rate {
        return Err(PipelineError::InvalidParameter(format!(
            "audio decoded at {} Hz but the configuration expects {} Hz",
            audio.sample_rate, config.sample_rate
        )));
    }

    let config_fingerprint = fingerprint_params("spectrograms", config)?;

    let mut planner = FftPlanner::new();
    let fft = planner.plan_fft_forward(config.window_length);
    let window = hann_window(config.window_length);
    let window_sum: f64 = window.iter().map(|&w| w as f64).sum();
    let row_centers = row_center_frequencies(config);

    let mut records = Vec::with_capacity(segments.len());
    let mut skipped_short = 0u32;

    for (index, &(onset, offset)) in segments.pairs.iter().enumerate() {
        let lo = (onset * audio.sample_rate as f64) as usize;
        let hi = ((offset * audio.sample_rate as f64) as usize).min(audio.samples.len());

        if hi <= lo || hi - lo < config.window_length {
            skipped_short += 1;
            log::debug!(
                "segment {} [{:.3}, {:.3}]s too short for one transform frame, skipped",
                index,
                onset,
                offset
            );
            continue;
        }

        let frames = stft_rows(
            &audio.samples[lo..hi],
            config,
            fft.as_ref(),
            &window,
            window_sum,
            &row_centers,
        );
        let data = fit_time_axis(frames, config);

        let expected = config.shape_freq_bins * config.shape_time_bins;
        if data.len() != expected {
            return Err(PipelineError::ShapeMismatch {
                expected: format!("{}x{}", config.shape_freq_bins, config.shape_time_bins),
                actual: format!("{} values", data.len()),
            });
        }

        records.push(SpectrogramRecord {
            segment_index: index as u32,
            onset,
            offset,
            data,
        });
    }

    Ok(SpectrogramBatch {
        records,
        skipped_short,
        config_fingerprint,
        segset_fingerprint: segments.fingerprint.clone(),
    })
}

fn hann_window(size: usize) -> Vec<f32> {
    (0..size)
        .map(|i| {
            let x = i as f64 / (size - 1).max(1) as f64;
            (0.5 * (1.0 - (2.0 * PI * x).cos())) as f32
        })
        .collect()
}

/// HTK mel scale
fn hz_to_mel(hz: f64) -> f64 {
    2595.0 * (1.0 + hz / 700.0).log10()
}

fn mel_to_hz(mel: f64) -> f64 {
    700.0 * (10.0_f64.powf(mel / 2595.0) - 1.0)
}

/// Centre frequency of every output row, low to high.
fn row_center_frequencies(config: &SpectrogramConfig) -> Vec<f64> {
    let rows = config.shape_freq_bins;
    (0..rows)
        .map(|r| {
            let position = (r as f64 + 0.5) / rows as f64;
            match config.freq_scale {
                FreqScale::Linear => {
                    config.min_freq + (config.max_freq - config.min_freq) * position
                }
                FreqScale::Mel => {
                    let lo = hz_to_mel(config.min_freq);
                    let hi = hz_to_mel(config.max_freq);
                    mel_to_hz(lo + (hi - lo) * position)
                }
            }
        })
        .collect()
}

/// STFT the segment and sample each output row's centre frequency from
/// the magnitude spectrum (linear interpolation between neighbouring
/// bins). Returns column-major frames: one Vec of shape_freq_bins values
/// per time frame, already log-scaled to [0, 1].
fn stft_rows(
    samples: &[f32],
    config: &SpectrogramConfig,
    fft: &dyn rustfft::Fft<f32>,
    window: &[f32],
    window_sum: f64,
    row_centers: &[f64],
) -> Vec<Vec<f32>> {
    let num_frames = (samples.len() - config.window_length) / config.hop_length + 1;
    let bin_hz = config.sample_rate as f64 / config.window_length as f64;
    let num_bins = config.window_length / 2 + 1;

    let mut frames = Vec::with_capacity(num_frames);
    let mut buffer: Vec<Complex<f32>> = vec![Complex::new(0.0, 0.0); config.window_length];

    for frame_idx in 0..num_frames {
        let start = frame_idx * config.hop_length;
        for (i, slot) in buffer.iter_mut().enumerate() {
            *slot = Complex::new(samples[start + i] * window[i], 0.0);
        }
        fft.process(&mut buffer);

        // Amplitude spectrum normalized by the window gain.
        let magnitudes: Vec<f64> = buffer[..num_bins]
            .iter()
            .map(|c| c.norm() as f64 * 2.0 / window_sum)
            .collect();

        let row_values: Vec<f32> = row_centers
            .iter()
            .map(|&freq| {
                let magnitude = sample_spectrum(&magnitudes, freq / bin_hz);
                log_scale(magnitude, config.log_floor_db)
            })
            .collect();
        frames.push(row_values);
    }

    frames
}

/// Linear interpolation between the two FFT bins around `position`.
fn sample_spectrum(magnitudes: &[f64], position: f64) -> f64 {
    let lower = position.floor() as usize;
    if lower + 1 >= magnitudes.len() {
        return *magnitudes.last().unwrap_or(&0.0);
    }
    let frac = position - lower as f64;
    magnitudes[lower] * (1.0 - frac) + magnitudes[lower + 1] * frac
}

/// Log magnitude mapped so the silence floor is 0.0.
fn log_scale(magnitude: f64, floor_db: f64) -> f32 {
    let db = 20.0 * (magnitude + 1e-10).log10();
    (((db - floor_db) / -floor_db).max(0.0)) as f32
}

/// Centre-crop or floor-pad the frame sequence to the fixed time axis,
/// producing row-major data. Padding uses the silence floor value so
/// padded columns are indistinguishable from silence.
fn fit_time_axis(frames: Vec<Vec<f32>>, config: &SpectrogramConfig) -> Vec<f32> {
    let rows = config.shape_freq_bins;
    let cols = config.shape_time_bins;
    let num_frames = frames.len();

    let mut data = vec![0.0f32; rows * cols];

    let (frame_offset, col_offset, copy_cols) = if num_frames >= cols {
        // Crop, keeping the temporal centre.
        ((num_frames - cols) / 2, 0usize, cols)
    } else {
        // Pad evenly on both sides.
        (0usize, (cols - num_frames) / 2, num_frames)
    };

    for c in 0..copy_cols {
        let frame = &frames[frame_offset + c];
        for r in 0..rows {
            data[r * cols + col_offset + c] = frame[r];
        }
    }

    data
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

    fn amplitude_strategy() -> SegmentationStrategy {
        SegmentationStrategy::Amplitude(AmplitudeSegConfig {
            threshold: 0.1,
            ..Default::default()
        })
    }

    #[test]
    fn test_two_bursts_yield_two_fixed_shape_records() {
        let audio = burst_audio(32000, 10.0, &[(1.0, 2.0), (5.0, 5.5)]);
        let segments = segment(&audio, &amplitude_strategy()).unwrap();
        assert_eq!(segments.len(), 2);

        let config = SpectrogramConfig::default();
        let batch = build(&audio, &segments, &config).unwrap();

        assert_eq!(batch.records.len(), 2);
        assert_eq!(batch.skipped_short, 0);
        assert!(batch.accounts_for(segments.len()));
        for record in &batch.records {
            assert_eq!(
                record.data.len(),
                config.shape_freq_bins * config.shape_time_bins
            );
        }
    }

    #[test]
    fn test_build_is_bit_identical_across_runs() {
        let audio = burst_audio(32000, 6.0, &[(1.0, 1.4), (3.0, 3.2)]);
        let segments = segment(&audio, &amplitude_strategy()).unwrap();
        let config = SpectrogramConfig::default();

        let a = build(&audio, &segments, &config).unwrap();
        let b = build(&audio, &segments, &config).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_short_segment_skipped_and_counted() {
        let audio = burst_audio(32000, 4.0, &[(1.0, 1.5)]);
        let mut segments = segment(&audio, &amplitude_strategy()).unwrap();
        // Append a segment shorter than one 512-sample window (16 ms).
        segments.pairs.push((3.0, 3.01));

        let batch = build(&audio, &segments, &SpectrogramConfig::default()).unwrap();
        assert_eq!(batch.records.len(), 1);
        assert_eq!(batch.skipped_short, 1);
        assert!(batch.accounts_for(segments.len()));
    }

    #[test]
    fn test_energy_lands_near_burst_frequency() {
        let audio = burst_audio(32000, 4.0, &[(1.0, 2.0)]);
        let segments = segment(&audio, &amplitude_strategy()).unwrap();
        let config = SpectrogramConfig {
            freq_scale: FreqScale::Linear,
            ..Default::default()
        };
        let batch = build(&audio, &segments, &config).unwrap();
        let record = &batch.records[0];

        // Row whose centre frequency is nearest the 2 kHz tone.
        let centers = row_center_frequencies(&config);
        let tone_row = centers
            .iter()
            .enumerate()
            .min_by(|a, b| {
                (a.1 - 2000.0).abs().partial_cmp(&(b.1 - 2000.0).abs()).unwrap()
            })
            .map(|(i, _)| i)
            .unwrap();
        let far_row = centers.len() - 1;

        let mid_col = config.shape_time_bins / 2;
        let tone_value = record.data[tone_row * config.shape_time_bins + mid_col];
        let far_value = record.data[far_row * config.shape_time_bins + mid_col];
        assert!(tone_value > far_value + 0.2);
    }

    #[test]
    fn test_padding_uses_silence_floor() {
        let audio = burst_audio(32000, 4.0, &[(1.0, 1.1)]);
        let segments = segment(&audio, &amplitude_strategy()).unwrap();
        // A 100 ms segment at hop 128 yields ~21 frames, far fewer than
        // the 128 target columns, so both edges are padding.
        let config = SpectrogramConfig::default();
        let batch = build(&audio, &segments, &config).unwrap();
        let record = &batch.records[0];

        for r in 0..config.shape_freq_bins {
            assert_eq!(record.data[r * config.shape_time_bins], 0.0);
            assert_eq!(record.data[r * config.shape_time_bins + config.shape_time_bins - 1], 0.0);
        }
    }

    #[test]
    fn test_mel_centers_are_monotonic_within_range() {
        let config = SpectrogramConfig::default();
        let centers = row_center_frequencies(&config);
        assert!(centers.windows(2).all(|w| w[0] < w[1]));
        assert!(centers[0] >= config.min_freq);
        assert!(*centers.last().unwrap() <= config.max_freq);
    }

    #[test]
    fn test_sample_rate_mismatch_rejected() {
        let audio = burst_audio(16000, 2.0, &[(0.5, 1.0)]);
        let segments = segment(&audio, &amplitude_strategy()).unwrap();
        let err = build(&audio, &segments, &SpectrogramConfig::default());
        assert!(matches!(err, Err(PipelineError::InvalidParameter(_))));
    }

    #[test]
    fn test_empty_segment_set_yields_empty_batch() {
        let audio = burst_audio(32000, 2.0, &[]);
        let segments = segment(&audio, &amplitude_strategy()).unwrap();
        let batch = build(&audio, &segments, &SpectrogramConfig::default()).unwrap();
        assert!(batch.records.is_empty());
        assert_eq!(batch.skipped_short, 0);
    }
}
