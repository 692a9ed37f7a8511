//! Syrinx Core - Bioacoustic Segmentation and Spectrogram Pipeline
//!
//! This crate indexes collections of raw vocalization recordings,
//! segments them into syllable-scale units, converts the units into
//! fixed-shape spectrograms, and exposes a lazily-resolving,
//! cache-consistent aggregate view keyed by parameter fingerprints.

pub mod audio;
pub mod batch;
pub mod config;
pub mod container;
pub mod error;
pub mod fingerprint;
pub mod segment;
pub mod source;
pub mod spectrogram;

pub use batch::{BatchRunner, PipelineStep, RunSummary};
pub use config::{
    AmplitudeSegConfig, FreqScale, RefineConfig, SpectrogramConfig, TemplateSegConfig,
};
pub use container::{
    ArrayField, ArrayRow, DataContainer, RowSelection, SegmentField, SegmentRow,
    STAGE_REFINED, STAGE_SEGMENTS, STAGE_SPECTROGRAMS,
};
pub use error::{PipelineError, Result};
pub use fingerprint::{fingerprint_layered, fingerprint_params, Fingerprint};
pub use segment::{segment, SegmentSet, SegmentStats, SegmentationStrategy};
pub use source::{group_by_identity, resolve_sources, RecordingInfo};
pub use spectrogram::{build, SpectrogramBatch, SpectrogramRecord};

/// Segment one recording and build its spectrograms in a single call.
pub fn process_recording(
    path: &std::path::Path,
    strategy: &SegmentationStrategy,
    config: &SpectrogramConfig,
) -> Result<(SegmentSet, SpectrogramBatch)> {
    let audio = audio::decode_audio(path, 0)?;
    let segments = segment(&audio, strategy)?;

    let audio = if audio.sample_rate == config.sample_rate {
        audio
    } else {
        audio::decode_audio(path, config.sample_rate)?
    };
    let batch = build(&audio, &segments, config)?;

    Ok((segments, batch))
}
