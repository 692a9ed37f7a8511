//! Audio source resolution
//!
//! Enumerates recording files under a dataset root, grouped by
//! source-animal identity, in a deterministic order. Identity is the first
//! path component under the root; housing-regime tags and age-in-days
//! tokens are parsed from directory names when present. Date-stamped
//! session folders carry no age token, and the age stays an explicit
//! `None` rather than a guessed value.

use crate::audio::AudioFormat;
use crate::error::Result;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Recognized housing/tutoring regime tokens.
const REGIME_TOKENS: [&str; 4] = ["bells", "simple", "samba", "isolates"];

/// One indexed recording file.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordingInfo {
    /// Path relative to the dataset root, '/'-separated; stable across runs.
    pub recording_id: String,
    pub path: PathBuf,
    /// Source-animal identity (first path component under the root).
    pub identity: String,
    /// Housing/tutoring regime tag, when the directory naming carries one.
    pub regime: Option<String>,
    /// Age in days, when the directory naming carries a day token.
    pub age_days: Option<u32>,
    /// Native sample rate, 0 when the probe failed.
    pub sample_rate: u32,
    /// Duration in seconds, 0 when the probe failed.
    pub duration_s: f64,
    /// Whether the header probe succeeded.
    pub decode_ok: bool,
}

/// Enumerate all supported recordings under `root`, ordered by recording id.
///
/// Files that fail the header probe are still listed (with `decode_ok`
/// false) so batch mode can report them instead of silently dropping them.
pub fn resolve_sources(root: &Path) -> Result<Vec<RecordingInfo>> {
    let mut recordings = Vec::new();

    for entry in WalkDir::new(root).follow_links(false) {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                log::warn!("skipping unreadable directory entry: {}", e);
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        if !AudioFormat::from_path(path).is_supported() {
            continue;
        }

        let relative = path.strip_prefix(root).unwrap_or(path);
        let recording_id = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");

        let components: Vec<String> = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect();
        let identity = if components.len() > 1 {
            components[0].clone()
        } else {
            path.file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_else(|| recording_id.clone())
        };

        let dir_components = &components[..components.len().saturating_sub(1)];
        let regime = parse_regime(dir_components);
        let age_days = parse_age_days(dir_components);

        let (sample_rate, duration_s, decode_ok) = match probe_recording(path) {
            Ok((rate, duration)) => (rate, duration, true),
            Err(reason) => {
                log::warn!("probe failed for {}: {}", path.display(), reason);
                (0, 0.0, false)
            }
        };

        recordings.push(RecordingInfo {
            recording_id,
            path: path.to_path_buf(),
            identity,
            regime,
            age_days,
            sample_rate,
            duration_s,
            decode_ok,
        });
    }

    recordings.sort_by(|a, b| a.recording_id.cmp(&b.recording_id));
    Ok(recordings)
}

/// Group resolved recordings by identity, preserving resolver order
/// within each group.
pub fn group_by_identity(recordings: Vec<RecordingInfo>) -> BTreeMap<String, Vec<RecordingInfo>> {
    let mut groups: BTreeMap<String, Vec<RecordingInfo>> = BTreeMap::new();
    for recording in recordings {
        groups
            .entry(recording.identity.clone())
            .or_default()
            .push(recording);
    }
    groups
}

fn parse_regime(components: &[String]) -> Option<String> {
    for component in components {
        let lower = component.to_ascii_lowercase();
        for token in REGIME_TOKENS {
            if lower.split(|c: char| !c.is_ascii_alphanumeric()).any(|w| w == token) {
                return Some(token.to_string());
            }
        }
    }
    None
}

fn parse_age_days(components: &[String]) -> Option<u32> {
    for component in components {
        let lower = component.to_ascii_lowercase();
        if let Some(pos) = lower.find("day") {
            let rest = &lower[pos + 3..];
            let digits: String = rest
                .chars()
                .skip_while(|c| *c == ' ' || *c == '_' || *c == '-')
                .take_while(|c| c.is_ascii_digit())
                .collect();
            if !digits.is_empty() {
                if let Ok(days) = digits.parse() {
                    return Some(days);
                }
            }
        }
    }
    None
}

/// Cheap header probe for sample rate and duration.
fn probe_recording(path: &Path) -> std::result::Result<(u32, f64), String> {
    match AudioFormat::from_path(path) {
        AudioFormat::Wav => {
            let reader = hound::WavReader::open(path).map_err(|e| e.to_string())?;
            let spec = reader.spec();
            let duration = reader.duration() as f64 / spec.sample_rate as f64;
            Ok((spec.sample_rate, duration))
        }
        AudioFormat::Flac => {
            let reader = claxon::FlacReader::open(path).map_err(|e| e.to_string())?;
            let info = reader.streaminfo();
            let duration = match info.samples {
                Some(samples) => samples as f64 / info.sample_rate as f64,
                None => return Err("FLAC stream carries no sample count".to_string()),
            };
            Ok((info.sample_rate, duration))
        }
        // OGG and MP3 headers carry no reliable duration; a full decode
        // settles both.
        AudioFormat::Ogg | AudioFormat::Mp3 => {
            let audio = crate::audio::decode_audio(path, 0).map_err(|e| e.to_string())?;
            Ok((audio.sample_rate, audio.duration_s()))
        }
        AudioFormat::Unknown => Err("unsupported format".to_string()),
    }
}

/// Size and mtime probe used for change detection in registry entries.
pub fn source_stamp(path: &Path) -> Result<(u64, i64)> {
    let metadata = std::fs::metadata(path)?;
    let mtime = metadata
        .modified()?
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0);
    Ok((metadata.len(), mtime))
}
