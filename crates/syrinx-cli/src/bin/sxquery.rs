//! sxquery - Inspect cached artifacts for one source identity
//!
//! Reads only the cache: registry index, segment sidecars, and array
//! store headers. Never decodes audio or recomputes anything.

use anyhow::{Context, Result};
use clap::Parser;
use serde_json::json;
use std::path::PathBuf;
use syrinx_store::{ArrayReader, Registry, RegistryEntry, SegmentSidecar};

#[derive(Parser, Debug)]
#[command(name = "sxquery")]
#[command(about = "Query cached segments, spectrograms and features", long_about = None)]
struct Args {
    /// Cache root holding the registry index
    #[arg(long)]
    cache: PathBuf,

    /// Source-animal identity (recording ids starting with "<identity>/")
    #[arg(long)]
    identity: String,

    /// Field to query: segments, segments+refined, spectrograms, or
    /// feature:<name>
    #[arg(long)]
    field: String,

    /// Pin to one historical parameter fingerprint; without it, every
    /// cached fingerprint for the field is reported
    #[arg(long)]
    fingerprint: Option<String>,

    /// Include row data (segment pairs / array values) in the output
    #[arg(long)]
    dump: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    if args.verbose {
        env_logger::Builder::from_default_env()
            .filter_level(log::LevelFilter::Info)
            .init();
    } else {
        env_logger::Builder::from_default_env()
            .filter_level(log::LevelFilter::Off)
            .init();
    }

    let registry = Registry::open(&args.cache)?;

    let prefix = format!("{}/", args.identity);
    let entries: Vec<RegistryEntry> = registry
        .snapshot()
        .into_iter()
        .filter(|e| {
            (e.recording_id.starts_with(&prefix) || e.recording_id == args.identity)
                && e.stage == args.field
                && args
                    .fingerprint
                    .as_ref()
                    .map(|fp| &e.fingerprint == fp)
                    .unwrap_or(true)
        })
        .collect();

    if entries.is_empty() {
        anyhow::bail!(
            "no cached artifacts for identity {:?}, field {:?}{}",
            args.identity,
            args.field,
            args.fingerprint
                .as_ref()
                .map(|fp| format!(", fingerprint {}", fp))
                .unwrap_or_default()
        );
    }

    let is_segment_field = args.field == "segments" || args.field == "segments+refined";
    let mut artifacts = Vec::new();
    let mut total_rows = 0u64;

    for entry in &entries {
        let path = registry.artifact_path(entry);
        total_rows += entry.rows as u64;

        let mut report = json!({
            "recording_id": entry.recording_id,
            "fingerprint": entry.fingerprint,
            "rows": entry.rows,
            "path": path.display().to_string(),
            "created_at": entry.created_at,
        });

        if is_segment_field {
            let sidecar = SegmentSidecar::read(&path)
                .with_context(|| format!("unreadable sidecar {}", path.display()))?;
            report["discarded_short"] = json!(sidecar.discarded_short);
            report["clipped"] = json!(sidecar.clipped);
            if args.dump {
                report["pairs"] = json!(sidecar.pairs);
            }
        } else {
            let header = ArrayReader::probe(&path)
                .with_context(|| format!("unreadable store {}", path.display()))?;
            report["shape"] = json!([header.record_rows, header.record_cols]);
            report["segset_fingerprint"] = json!(header.segset_fingerprint_str());
            if args.dump {
                let file = ArrayReader::read(&path)?;
                report["records"] = json!(file
                    .records
                    .iter()
                    .map(|r| json!({
                        "segment_index": r.segment_index,
                        "onset": r.onset,
                        "offset": r.offset,
                        "data": r.data,
                    }))
                    .collect::<Vec<_>>());
            }
        }

        artifacts.push(report);
    }

    let result = json!({
        "identity": args.identity,
        "field": args.field,
        "artifacts": artifacts,
        "total_rows": total_rows,
    });
    println!("{}", serde_json::to_string_pretty(&result)?);

    Ok(())
}
