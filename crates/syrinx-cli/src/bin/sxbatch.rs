//! sxbatch - Batch driver over a dataset root
//!
//! Usage: sxbatch --root <audio_dir> --cache <cache_dir> --pipeline <toml>

use anyhow::{Context, Result};
use clap::Parser;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use syrinx_core::{BatchRunner, PipelineStep};

#[derive(Parser, Debug)]
#[command(name = "sxbatch")]
#[command(about = "Populate the derived-artifact cache for a recording collection", long_about = None)]
struct Args {
    /// Dataset root holding the raw recordings
    #[arg(long)]
    root: PathBuf,

    /// Cache root for derived artifacts and the registry index
    #[arg(long)]
    cache: PathBuf,

    /// TOML pipeline description
    #[arg(long)]
    pipeline: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

/// On-disk pipeline description:
///
/// ```toml
/// [[step]]
/// stage = "segment"
/// strategy = "amplitude"
/// params = { threshold = 0.1, min_gap_s = 0.05 }
///
/// [[step]]
/// stage = "spectrogram"
/// params = { sample_rate = 32000, freq_scale = "mel" }
/// ```
#[derive(Debug, Deserialize)]
struct PipelineFile {
    #[serde(default)]
    step: Vec<StepSpec>,
}

#[derive(Debug, Deserialize)]
struct StepSpec {
    stage: String,
    strategy: Option<String>,
    params: Option<toml::Value>,
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Default: no logs (clean JSON output for parsing)
    // Verbose: show Info level logs for debugging
    if args.verbose {
        env_logger::Builder::from_default_env()
            .filter_level(log::LevelFilter::Info)
            .init();
    } else {
        env_logger::Builder::from_default_env()
            .filter_level(log::LevelFilter::Off)
            .init();
    }

    let steps = load_pipeline(&args.pipeline)?;
    if steps.is_empty() {
        anyhow::bail!("pipeline {} declares no steps", args.pipeline.display());
    }

    let runner = BatchRunner::new(&args.root, &args.cache)?;
    let summary = runner.run(&steps)?;

    println!("{}", serde_json::to_string_pretty(&summary)?);

    if summary.failed.is_empty() {
        Ok(())
    } else {
        std::process::exit(1);
    }
}

fn load_pipeline(path: &Path) -> Result<Vec<PipelineStep>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read pipeline file {}", path.display()))?;
    let file: PipelineFile = toml::from_str(&text)
        .with_context(|| format!("failed to parse pipeline file {}", path.display()))?;

    file.step
        .into_iter()
        .map(|spec| {
            let params = match spec.params {
                Some(value) => serde_json::to_value(value)
                    .context("pipeline parameters are not representable as JSON")?,
                None => serde_json::json!({}),
            };
            PipelineStep::from_spec(&spec.stage, spec.strategy.as_deref(), params)
                .with_context(|| format!("invalid step for stage {:?}", spec.stage))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_pipeline_parses_steps() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pipeline.toml");
        std::fs::write(
            &path,
            r#"
[[step]]
stage = "segment"
strategy = "amplitude"
params = { threshold = 0.2 }

[[step]]
stage = "spectrogram"
"#,
        )
        .unwrap();

        let steps = load_pipeline(&path).unwrap();
        assert_eq!(steps.len(), 2);
        assert!(matches!(steps[0], PipelineStep::Segment(_)));
        assert!(matches!(steps[1], PipelineStep::Spectrogram(_)));
    }

    #[test]
    fn test_load_pipeline_rejects_typo() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pipeline.toml");
        std::fs::write(
            &path,
            r#"
[[step]]
stage = "segment"
strategy = "amplitude"
params = { treshold = 0.2 }
"#,
        )
        .unwrap();

        assert!(load_pipeline(&path).is_err());
    }
}
