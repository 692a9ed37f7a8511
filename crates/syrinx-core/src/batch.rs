//! Batch driver
//!
//! Applies an ordered list of pipeline steps to every recording under a
//! dataset root, in parallel across recordings. The registry is the only
//! shared state; per-recording failures are isolated and aggregated into
//! the run summary instead of aborting the run. Re-running over an
//! unchanged dataset with unchanged parameters recomputes nothing, so an
//! early-terminated run simply resumes on the next invocation.

use crate::config::{config_from_value, RefineConfig, SpectrogramConfig};
use crate::container::{DataContainer, SegmentField, STAGE_REFINED, STAGE_SEGMENTS, STAGE_SPECTROGRAMS};
use crate::error::{PipelineError, Result};
use crate::fingerprint::fingerprint_layered;
use crate::segment::SegmentationStrategy;
use crate::source::{resolve_sources, RecordingInfo};
use rayon::prelude::*;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use syrinx_store::Registry;

/// One stage invocation in a pipeline. Steps apply in order; refinement
/// and spectrogram steps consume the segment set produced by the steps
/// before them.
#[derive(Debug, Clone)]
pub enum PipelineStep {
    Segment(SegmentationStrategy),
    Refine(RefineConfig),
    Spectrogram(SpectrogramConfig),
}

impl PipelineStep {
    /// Resolve a step from stage and strategy names plus an untyped
    /// parameter table. Unknown stages, strategies and parameter keys
    /// fail fast.
    pub fn from_spec(
        stage: &str,
        strategy: Option<&str>,
        params: serde_json::Value,
    ) -> Result<Self> {
        match stage {
            "segment" => {
                let name = strategy.ok_or_else(|| {
                    PipelineError::InvalidParameter(
                        "segment step requires a strategy name".to_string(),
                    )
                })?;
                Ok(PipelineStep::Segment(SegmentationStrategy::from_name(
                    name, params,
                )?))
            }
            "refine" => Ok(PipelineStep::Refine(config_from_value(params)?)),
            "spectrogram" => Ok(PipelineStep::Spectrogram(config_from_value(params)?)),
            other => Err(PipelineError::InvalidParameter(format!(
                "unknown pipeline stage {:?}",
                other
            ))),
        }
    }

    pub fn validate(&self) -> Result<()> {
        match self {
            PipelineStep::Segment(strategy) => strategy.validate(),
            PipelineStep::Refine(config) => config.validate(),
            PipelineStep::Spectrogram(config) => config.validate(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FailedRecording {
    pub recording_id: String,
    pub error: String,
}

/// Aggregated outcome of one batch run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunSummary {
    /// Recordings that ran every step without error.
    pub processed: usize,
    /// Step invocations satisfied by an already-published artifact.
    pub steps_skipped: usize,
    /// Step invocations that computed and published a new artifact.
    pub steps_computed: usize,
    /// Recordings that failed; one bad file never aborts the run.
    pub failed: Vec<FailedRecording>,
    pub segments_total: usize,
    pub records_total: usize,
    pub clipped_total: u64,
    pub discarded_total: u64,
    pub short_skipped_total: u64,
    /// True when the stop flag ended the run early. Published artifacts
    /// stay valid; a re-run resumes past them.
    pub interrupted: bool,
    pub elapsed_s: f64,
}

pub struct BatchRunner {
    root: PathBuf,
    registry: Arc<Registry>,
    stop: Arc<AtomicBool>,
}

impl BatchRunner {
    pub fn new(root: &Path, cache_root: &Path) -> Result<Self> {
        Ok(Self {
            root: root.to_path_buf(),
            registry: Arc::new(Registry::open(cache_root)?),
            stop: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Shared flag for early termination; setting it stops the run at
    /// the next recording boundary.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        self.stop.clone()
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn run(&self, steps: &[PipelineStep]) -> Result<RunSummary> {
        for step in steps {
            step.validate()?;
        }

        let started = std::time::Instant::now();
        let recordings = resolve_sources(&self.root)?;
        log::info!(
            "batch over {} recordings, {} steps",
            recordings.len(),
            steps.len()
        );

        let outcomes: Vec<Option<(String, Result<RecordingOutcome>)>> = recordings
            .par_iter()
            .map(|recording| {
                if self.stop.load(Ordering::Relaxed) {
                    return None;
                }
                let outcome = self.process_recording(recording, steps);
                Some((recording.recording_id.clone(), outcome))
            })
            .collect();

        let mut summary = RunSummary {
            interrupted: self.stop.load(Ordering::Relaxed),
            ..Default::default()
        };
        for item in outcomes {
            let Some((recording_id, outcome)) = item else {
                continue;
            };
            match outcome {
                Ok(o) => {
                    summary.processed += 1;
                    summary.steps_skipped += o.steps_skipped;
                    summary.steps_computed += o.steps_computed;
                    summary.segments_total += o.segments;
                    summary.records_total += o.records;
                    summary.clipped_total += o.clipped as u64;
                    summary.discarded_total += o.discarded as u64;
                    summary.short_skipped_total += o.short_skipped as u64;
                }
                Err(e) => {
                    log::warn!("recording {} failed: {}", recording_id, e);
                    summary.failed.push(FailedRecording {
                        recording_id,
                        error: e.to_string(),
                    });
                }
            }
        }

        summary.elapsed_s = started.elapsed().as_secs_f64();
        Ok(summary)
    }

    fn process_recording(
        &self,
        recording: &RecordingInfo,
        steps: &[PipelineStep],
    ) -> Result<RecordingOutcome> {
        let container = DataContainer::new(
            &recording.identity,
            vec![recording.clone()],
            self.registry.clone(),
        );

        let mut outcome = RecordingOutcome::default();
        let mut current: Option<Arc<SegmentField>> = None;
        let mut base_strategy: Option<&SegmentationStrategy> = None;

        for step in steps {
            match step {
                PipelineStep::Segment(strategy) => {
                    let fingerprint = strategy.fingerprint()?;
                    self.count_hit(
                        &mut outcome,
                        &recording.recording_id,
                        STAGE_SEGMENTS,
                        fingerprint.as_str(),
                    );
                    let field = container.get_segments(strategy)?;
                    outcome.segments += field.rows.len();
                    outcome.clipped += field.stats.clipped;
                    outcome.discarded += field.stats.discarded_short;
                    current = Some(field);
                    base_strategy = Some(strategy);
                }
                PipelineStep::Refine(config) => {
                    let strategy = base_strategy.ok_or_else(|| {
                        PipelineError::InvalidParameter(
                            "refine step requires a preceding segment step".to_string(),
                        )
                    })?;
                    let base = current.as_ref().expect("segment step sets the field");
                    let fingerprint =
                        fingerprint_layered(STAGE_REFINED, &base.fingerprint, config)?;
                    self.count_hit(
                        &mut outcome,
                        &recording.recording_id,
                        STAGE_REFINED,
                        fingerprint.as_str(),
                    );
                    current = Some(container.get_refined_segments(strategy, config)?);
                }
                PipelineStep::Spectrogram(config) => {
                    let segments = current.as_ref().ok_or_else(|| {
                        PipelineError::InvalidParameter(
                            "spectrogram step requires a preceding segment step".to_string(),
                        )
                    })?;
                    let fingerprint =
                        fingerprint_layered(STAGE_SPECTROGRAMS, &segments.fingerprint, config)?;
                    self.count_hit(
                        &mut outcome,
                        &recording.recording_id,
                        STAGE_SPECTROGRAMS,
                        fingerprint.as_str(),
                    );
                    let field = container.spectrograms_against(segments, config)?;
                    outcome.records += field.rows.len();
                    outcome.short_skipped += field.skipped_short;
                }
            }
        }

        Ok(outcome)
    }

    fn count_hit(
        &self,
        outcome: &mut RecordingOutcome,
        recording_id: &str,
        stage: &str,
        fingerprint: &str,
    ) {
        if self.registry.lookup(recording_id, stage, fingerprint).is_some() {
            outcome.steps_skipped += 1;
        } else {
            outcome.steps_computed += 1;
        }
    }
}

#[derive(Debug, Default)]
struct RecordingOutcome {
    steps_skipped: usize,
    steps_computed: usize,
    segments: usize,
    records: usize,
    clipped: u32,
    discarded: u32,
    short_skipped: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AmplitudeSegConfig;
    use serde_json::json;

    fn write_burst_wav(path: &Path, sample_rate: u32, total_s: f64, bursts: &[(f64, f64)]) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(path, spec).unwrap();
        let total = (sample_rate as f64 * total_s) as usize;
        for i in 0..total {
            let t = i as f64 / sample_rate as f64;
            let active = bursts.iter().any(|&(s, e)| t >= s && t < e);
            let value = if active {
                ((2.0 * std::f64::consts::PI * 2000.0 * t).sin() * 0.5 * i16::MAX as f64) as i16
            } else {
                0
            };
            writer.write_sample(value).unwrap();
        }
        writer.finalize().unwrap();
    }

    fn steps() -> Vec<PipelineStep> {
        vec![
            PipelineStep::Segment(SegmentationStrategy::Amplitude(AmplitudeSegConfig {
                threshold: 0.1,
                ..Default::default()
            })),
            PipelineStep::Spectrogram(SpectrogramConfig::default()),
        ]
    }

    fn dataset() -> (tempfile::TempDir, tempfile::TempDir) {
        let audio = tempfile::tempdir().unwrap();
        let cache = tempfile::tempdir().unwrap();
        write_burst_wav(
            &audio.path().join("bird1/rec_a.wav"),
            32000,
            6.0,
            &[(1.0, 1.5), (3.0, 3.2)],
        );
        write_burst_wav(&audio.path().join("bird2/rec_b.wav"), 32000, 4.0, &[(0.5, 1.0)]);
        (audio, cache)
    }

    #[test]
    fn test_run_populates_cache_for_all_recordings() {
        let (audio, cache) = dataset();
        let runner = BatchRunner::new(audio.path(), cache.path()).unwrap();
        let summary = runner.run(&steps()).unwrap();

        assert_eq!(summary.processed, 2);
        assert!(summary.failed.is_empty());
        assert_eq!(summary.segments_total, 3);
        assert_eq!(summary.records_total, 3);
        assert_eq!(summary.steps_computed, 4);
        assert_eq!(summary.steps_skipped, 0);
    }

    #[test]
    fn test_second_run_is_pure_skip() {
        let (audio, cache) = dataset();
        let runner = BatchRunner::new(audio.path(), cache.path()).unwrap();
        runner.run(&steps()).unwrap();

        let again = BatchRunner::new(audio.path(), cache.path()).unwrap();
        let summary = again.run(&steps()).unwrap();
        assert_eq!(summary.steps_computed, 0);
        assert_eq!(summary.steps_skipped, 4);
        assert!(summary.failed.is_empty());
    }

    #[test]
    fn test_bad_recording_is_isolated() {
        let (audio, cache) = dataset();
        std::fs::write(audio.path().join("bird1/broken.wav"), b"RIFFnope").unwrap();

        let runner = BatchRunner::new(audio.path(), cache.path()).unwrap();
        let summary = runner.run(&steps()).unwrap();

        assert_eq!(summary.processed, 2);
        assert_eq!(summary.failed.len(), 1);
        assert_eq!(summary.failed[0].recording_id, "bird1/broken.wav");
    }

    #[test]
    fn test_refine_without_segment_step_fails_per_recording() {
        let (audio, cache) = dataset();
        let runner = BatchRunner::new(audio.path(), cache.path()).unwrap();
        let summary = runner
            .run(&[PipelineStep::Refine(RefineConfig::default())])
            .unwrap();
        assert_eq!(summary.processed, 0);
        assert_eq!(summary.failed.len(), 2);
    }

    #[test]
    fn test_step_from_spec_rejects_unknown_stage() {
        let err = PipelineStep::from_spec("embed", None, json!({}));
        assert!(matches!(err, Err(PipelineError::InvalidParameter(_))));
    }

    #[test]
    fn test_full_pipeline_with_refine() {
        let (audio, cache) = dataset();
        let runner = BatchRunner::new(audio.path(), cache.path()).unwrap();
        let pipeline = vec![
            PipelineStep::Segment(SegmentationStrategy::Amplitude(AmplitudeSegConfig {
                threshold: 0.1,
                ..Default::default()
            })),
            PipelineStep::Refine(RefineConfig::default()),
            PipelineStep::Spectrogram(SpectrogramConfig::default()),
        ];
        let summary = runner.run(&pipeline).unwrap();
        assert_eq!(summary.processed, 2);
        assert_eq!(summary.records_total, 3);

        // Spectrograms were published against the refined segment sets.
        let entries = runner.registry().snapshot();
        assert!(entries.iter().any(|e| e.stage == STAGE_REFINED));
    }
}
