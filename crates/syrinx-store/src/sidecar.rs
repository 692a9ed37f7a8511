//! Segment sidecar files
//!
//! One sidecar per (recording, fingerprint): a plain text file a person can
//! open to inspect or hand-correct segment bounds. Header lines carry the
//! provenance; the body is one onset/offset pair per line, in seconds.

use crate::{Result, StoreError};
use std::io::{BufRead, BufReader, Write};
use std::path::Path;

const FORMAT_LINE: &str = "# syrinx-segments v1";

/// Parsed sidecar contents.
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentSidecar {
    pub recording_id: String,
    pub fingerprint: String,
    /// Segments dropped for falling below the minimum duration.
    pub discarded_short: u32,
    /// Offsets clipped to the recording duration.
    pub clipped: u32,
    /// Ordered, non-overlapping (onset, offset) pairs in seconds.
    pub pairs: Vec<(f64, f64)>,
}

impl SegmentSidecar {
    /// Write atomically: temp file in the target directory, then rename.
    pub fn write_atomic(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp_path = path.with_extension("txt.tmp");

        {
            let file = std::fs::File::create(&tmp_path)?;
            let mut writer = std::io::BufWriter::new(file);
            writeln!(writer, "{}", FORMAT_LINE)?;
            writeln!(writer, "# recording: {}", self.recording_id)?;
            writeln!(writer, "# fingerprint: {}", self.fingerprint)?;
            writeln!(writer, "# discarded_short: {}", self.discarded_short)?;
            writeln!(writer, "# clipped: {}", self.clipped)?;
            for (onset, offset) in &self.pairs {
                writeln!(writer, "{:.6}\t{:.6}", onset, offset)?;
            }
            writer.flush()?;
        }

        std::fs::rename(&tmp_path, path)?;
        Ok(())
    }

    pub fn read(path: &Path) -> Result<Self> {
        let file = std::fs::File::open(path)?;
        let reader = BufReader::new(file);

        let mut recording_id = None;
        let mut fingerprint = None;
        let mut discarded_short = 0u32;
        let mut clipped = 0u32;
        let mut pairs: Vec<(f64, f64)> = Vec::new();
        let mut saw_format_line = false;

        for (lineno, line) in reader.lines().enumerate() {
            let line = line?;
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            if let Some(rest) = trimmed.strip_prefix('#') {
                let rest = rest.trim();
                if trimmed == FORMAT_LINE {
                    saw_format_line = true;
                } else if let Some(value) = rest.strip_prefix("recording:") {
                    recording_id = Some(value.trim().to_string());
                } else if let Some(value) = rest.strip_prefix("fingerprint:") {
                    fingerprint = Some(value.trim().to_string());
                } else if let Some(value) = rest.strip_prefix("discarded_short:") {
                    discarded_short = parse_field(path, lineno, value)?;
                } else if let Some(value) = rest.strip_prefix("clipped:") {
                    clipped = parse_field(path, lineno, value)?;
                }
                continue;
            }

            let mut fields = trimmed.split_whitespace();
            let onset: f64 = parse_field(path, lineno, fields.next().unwrap_or(""))?;
            let offset: f64 = parse_field(path, lineno, fields.next().unwrap_or(""))?;
            if fields.next().is_some() {
                return Err(corrupt(path, lineno, "expected exactly two columns"));
            }
            if offset < onset {
                return Err(corrupt(path, lineno, "offset precedes onset"));
            }
            if let Some(&(_, prev_offset)) = pairs.last() {
                if onset < prev_offset {
                    return Err(corrupt(path, lineno, "segments overlap or are unordered"));
                }
            }
            pairs.push((onset, offset));
        }

        if !saw_format_line {
            return Err(corrupt(path, 0, "missing format header line"));
        }

        Ok(Self {
            recording_id: recording_id.ok_or_else(|| corrupt(path, 0, "missing recording header"))?,
            fingerprint: fingerprint.ok_or_else(|| corrupt(path, 0, "missing fingerprint header"))?,
            discarded_short,
            clipped,
            pairs,
        })
    }
}

fn corrupt(path: &Path, lineno: usize, reason: &str) -> StoreError {
    StoreError::Corrupt {
        path: path.to_path_buf(),
        reason: format!("line {}: {}", lineno + 1, reason),
    }
}

fn parse_field<T: std::str::FromStr>(path: &Path, lineno: usize, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| corrupt(path, lineno, &format!("unparseable value {:?}", value)))
}
