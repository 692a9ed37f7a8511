//! Lazy aggregate view over all derived fields of one source identity
//!
//! The container resolves each requested field independently and lazily:
//! a field that is never requested is never computed. Resolution checks
//! the registry for an artifact under the requested fingerprint, verifies
//! it against its defining segment set, and only invokes the upstream
//! stage on a miss or a failed verification. Every cache read re-checks
//! the row alignment; misalignment that cannot be repaired by
//! recomputation surfaces as a consistency error, never as silently
//! misaligned rows.
//!
//! Field lifecycle per (stage, fingerprint): absent from the cache map is
//! Unresolved; the per-field lock held during computation is Resolving;
//! present in the map is Resolved, until invalidated back to Unresolved.

use crate::audio::decode_audio;
use crate::config::{RefineConfig, SpectrogramConfig};
use crate::error::{PipelineError, Result};
use crate::fingerprint::{fingerprint_layered, fingerprint_params, Fingerprint};
use crate::segment::{refine::refine, segment, SegmentSet, SegmentStats, SegmentationStrategy};
use crate::source::{source_stamp, RecordingInfo};
use crate::spectrogram::build;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use syrinx_store::{
    registry::now_rfc3339, ArrayFile, ArrayHeader, ArrayReader, ArrayRecord, ArrayWriter,
    Registry, RegistryEntry, SegmentSidecar, StoreError, StoreKind,
};

pub const STAGE_SEGMENTS: &str = "segments";
pub const STAGE_REFINED: &str = "segments+refined";
pub const STAGE_SPECTROGRAMS: &str = "spectrograms";

/// One row of the aggregate view: one segment of one recording.
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentRow {
    pub recording_id: String,
    pub segment_index: u32,
    pub onset: f64,
    pub offset: f64,
}

/// Resolved segments field: rows for every recording of the identity, in
/// resolver order.
#[derive(Debug, Clone)]
pub struct SegmentField {
    pub stage: String,
    pub fingerprint: Fingerprint,
    pub rows: Vec<SegmentRow>,
    pub stats: SegmentStats,
}

impl SegmentField {
    /// Rows belonging to one recording, in segment order.
    pub fn rows_for(&self, recording_id: &str) -> Vec<&SegmentRow> {
        self.rows
            .iter()
            .filter(|r| r.recording_id == recording_id)
            .collect()
    }
}

/// One row of a per-segment array field.
#[derive(Debug, Clone, PartialEq)]
pub struct ArrayRow {
    pub recording_id: String,
    pub segment_index: u32,
    pub onset: f64,
    pub offset: f64,
    pub data: Vec<f32>,
}

/// Resolved per-segment array field (spectrograms, features, projections).
#[derive(Debug, Clone)]
pub struct ArrayField {
    pub stage: String,
    pub fingerprint: Fingerprint,
    /// Fingerprint of the segment set the rows were computed against.
    pub segset_fingerprint: Fingerprint,
    pub record_rows: u32,
    pub record_cols: u32,
    pub rows: Vec<ArrayRow>,
    /// Segments skipped as too short across all recordings.
    pub skipped_short: u32,
}

#[derive(Debug, Clone)]
enum FieldData {
    Segments(Arc<SegmentField>),
    Arrays(Arc<ArrayField>),
}

/// Subset of rows chosen by a predicate over an already-resolved field.
/// Rows are identified by (recording, segment index), so the selection
/// stays aligned across every field requested afterwards.
#[derive(Debug, Clone)]
pub struct RowSelection {
    keys: Vec<(String, u32)>,
}

impl RowSelection {
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

type FieldKey = (String, String);

pub struct DataContainer {
    identity: String,
    recordings: Vec<RecordingInfo>,
    by_id: HashMap<String, RecordingInfo>,
    registry: Arc<Registry>,
    fields: Mutex<HashMap<FieldKey, FieldData>>,
    field_locks: Mutex<HashMap<FieldKey, Arc<Mutex<()>>>>,
}

impl DataContainer {
    /// Create an empty container: nothing is read or computed until a
    /// field is requested.
    pub fn new(identity: &str, recordings: Vec<RecordingInfo>, registry: Arc<Registry>) -> Self {
        let recordings: Vec<RecordingInfo> = recordings
            .into_iter()
            .filter(|r| r.identity == identity)
            .collect();
        let by_id = recordings
            .iter()
            .map(|r| (r.recording_id.clone(), r.clone()))
            .collect();
        Self {
            identity: identity.to_string(),
            recordings,
            by_id,
            registry,
            fields: Mutex::new(HashMap::new()),
            field_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn recordings(&self) -> &[RecordingInfo] {
        &self.recordings
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Return a field to Unresolved without touching other fields or any
    /// on-disk artifact.
    pub fn invalidate(&self, stage: &str, fingerprint: &Fingerprint) {
        let mut fields = self.fields.lock().expect("field map poisoned");
        fields.remove(&(stage.to_string(), fingerprint.as_str().to_string()));
    }

    /// Resolve the segments field for a strategy.
    pub fn get_segments(&self, strategy: &SegmentationStrategy) -> Result<Arc<SegmentField>> {
        strategy.validate()?;
        let fingerprint = strategy.fingerprint()?;
        let key = (STAGE_SEGMENTS.to_string(), fingerprint.as_str().to_string());

        let lock = self.field_lock(&key);
        let _guard = lock.lock().expect("field lock poisoned");
        if let Some(FieldData::Segments(field)) = self.lookup_field(&key) {
            return Ok(field);
        }

        let mut rows = Vec::new();
        let mut stats = SegmentStats::default();
        for recording in &self.recordings {
            let set = self.segments_for_recording(recording, strategy, &fingerprint)?;
            stats.discarded_short += set.stats.discarded_short;
            stats.clipped += set.stats.clipped;
            push_segment_rows(&mut rows, recording, &set.pairs);
        }

        let field = Arc::new(SegmentField {
            stage: STAGE_SEGMENTS.to_string(),
            fingerprint,
            rows,
            stats,
        });
        self.store_field(key, FieldData::Segments(field.clone()));
        Ok(field)
    }

    /// Resolve the refined-segments field layered over a base strategy.
    pub fn get_refined_segments(
        &self,
        strategy: &SegmentationStrategy,
        config: &RefineConfig,
    ) -> Result<Arc<SegmentField>> {
        config.validate()?;
        let base = self.get_segments(strategy)?;
        let fingerprint = fingerprint_layered(STAGE_REFINED, &base.fingerprint, config)?;
        let key = (STAGE_REFINED.to_string(), fingerprint.as_str().to_string());

        let lock = self.field_lock(&key);
        let _guard = lock.lock().expect("field lock poisoned");
        if let Some(FieldData::Segments(field)) = self.lookup_field(&key) {
            return Ok(field);
        }

        let mut rows = Vec::new();
        for recording in &self.recordings {
            let pairs = base
                .rows_for(&recording.recording_id)
                .iter()
                .map(|r| (r.onset, r.offset))
                .collect::<Vec<_>>();
            let base_set = SegmentSet {
                pairs,
                fingerprint: base.fingerprint.clone(),
                stats: SegmentStats::default(),
            };
            let refined = self.refined_for_recording(recording, &base_set, config, &fingerprint)?;
            push_segment_rows(&mut rows, recording, &refined.pairs);
        }

        let field = Arc::new(SegmentField {
            stage: STAGE_REFINED.to_string(),
            fingerprint,
            rows,
            stats: SegmentStats::default(),
        });
        self.store_field(key, FieldData::Segments(field.clone()));
        Ok(field)
    }

    /// Resolve the spectrograms field for a segmentation strategy and a
    /// spectrogram configuration. The field fingerprint layers the
    /// spectrogram parameters over the segment-set fingerprint, so either
    /// kind of parameter change produces a new artifact.
    pub fn get_spectrograms(
        &self,
        strategy: &SegmentationStrategy,
        config: &SpectrogramConfig,
    ) -> Result<Arc<ArrayField>> {
        config.validate()?;
        let segments = self.get_segments(strategy)?;
        self.spectrograms_against(&segments, config)
    }

    /// Spectrograms computed against an already-resolved segment field
    /// (base or refined).
    pub fn spectrograms_against(
        &self,
        segments: &Arc<SegmentField>,
        config: &SpectrogramConfig,
    ) -> Result<Arc<ArrayField>> {
        config.validate()?;
        let config_fp = fingerprint_params(STAGE_SPECTROGRAMS, config)?;
        let fingerprint = fingerprint_layered(STAGE_SPECTROGRAMS, &segments.fingerprint, config)?;
        let key = (
            STAGE_SPECTROGRAMS.to_string(),
            fingerprint.as_str().to_string(),
        );

        let lock = self.field_lock(&key);
        let _guard = lock.lock().expect("field lock poisoned");
        if let Some(FieldData::Arrays(field)) = self.lookup_field(&key) {
            verify_alignment(&field, segments)?;
            return Ok(field);
        }

        let mut rows = Vec::new();
        let mut skipped_short = 0u32;
        for recording in &self.recordings {
            let expected = segments.rows_for(&recording.recording_id);
            let file = self.spectrograms_for_recording(
                recording,
                segments,
                &expected,
                config,
                &config_fp,
                &fingerprint,
            )?;
            skipped_short += expected.len() as u32 - file.records.len() as u32;
            for record in file.records {
                rows.push(ArrayRow {
                    recording_id: recording.recording_id.clone(),
                    segment_index: record.segment_index,
                    onset: record.onset,
                    offset: record.offset,
                    data: record.data,
                });
            }
        }

        let field = Arc::new(ArrayField {
            stage: STAGE_SPECTROGRAMS.to_string(),
            fingerprint,
            segset_fingerprint: segments.fingerprint.clone(),
            record_rows: config.shape_freq_bins as u32,
            record_cols: config.shape_time_bins as u32,
            rows,
            skipped_short,
        });
        verify_alignment(&field, segments)?;
        self.store_field(key, FieldData::Arrays(field.clone()));
        Ok(field)
    }

    /// Load an externally published per-segment field (feature or
    /// projection) and verify its alignment against the segment field it
    /// was computed from. The container cannot recompute these, so any
    /// mismatch is a consistency error.
    pub fn get_feature(
        &self,
        name: &str,
        fingerprint: &Fingerprint,
        segments: &Arc<SegmentField>,
    ) -> Result<Arc<ArrayField>> {
        let stage = feature_stage(name);
        let key = (stage.clone(), fingerprint.as_str().to_string());

        let lock = self.field_lock(&key);
        let _guard = lock.lock().expect("field lock poisoned");
        if let Some(FieldData::Arrays(field)) = self.lookup_field(&key) {
            verify_alignment(&field, segments)?;
            return Ok(field);
        }

        let mut rows = Vec::new();
        let mut record_shape = None;
        for recording in &self.recordings {
            let entry = self
                .registry
                .lookup(&recording.recording_id, &stage, fingerprint.as_str())
                .ok_or_else(|| {
                    PipelineError::Consistency(format!(
                        "field {} not published for recording {} under fingerprint {}",
                        stage, recording.recording_id, fingerprint
                    ))
                })?;

            // Feature stores are owned by their external producer; a
            // corrupt one cannot be recomputed here.
            let path = self.registry.artifact_path(&entry);
            let file = ArrayReader::read(&path).map_err(|e| match e {
                StoreError::Corrupt { .. } => PipelineError::CacheCorruption(e.to_string()),
                other => PipelineError::Store(other),
            })?;
            if file.header.segset_fingerprint_str() != segments.fingerprint.as_str() {
                return Err(PipelineError::Consistency(format!(
                    "field {} for {} was computed against segment set {}, requested {}",
                    stage,
                    recording.recording_id,
                    file.header.segset_fingerprint_str(),
                    segments.fingerprint
                )));
            }

            let shape = (file.header.record_rows, file.header.record_cols);
            if *record_shape.get_or_insert(shape) != shape {
                return Err(PipelineError::Consistency(format!(
                    "field {} record shape varies across recordings",
                    stage
                )));
            }

            for record in file.records {
                rows.push(ArrayRow {
                    recording_id: recording.recording_id.clone(),
                    segment_index: record.segment_index,
                    onset: record.onset,
                    offset: record.offset,
                    data: record.data,
                });
            }
        }

        let (record_rows, record_cols) = record_shape.unwrap_or((0, 0));
        let field = Arc::new(ArrayField {
            stage,
            fingerprint: fingerprint.clone(),
            segset_fingerprint: segments.fingerprint.clone(),
            record_rows,
            record_cols,
            rows,
            skipped_short: 0,
        });
        verify_alignment(&field, segments)?;
        self.store_field(key, FieldData::Arrays(field.clone()));
        Ok(field)
    }

    /// Publish a per-segment feature computed by an external collaborator
    /// (e.g. model embeddings), one vector per segment row, through the
    /// registry so later reads get the same verification as native
    /// fields. Returns the fingerprint the field was published under.
    pub fn publish_feature<T: serde::Serialize>(
        &self,
        name: &str,
        params: &T,
        segments: &Arc<SegmentField>,
        vectors: &[Vec<f32>],
    ) -> Result<Fingerprint> {
        if vectors.len() != segments.rows.len() {
            return Err(PipelineError::Consistency(format!(
                "feature {} carries {} rows for {} segments",
                name,
                vectors.len(),
                segments.rows.len()
            )));
        }
        let dim = vectors.first().map(|v| v.len()).unwrap_or(0);
        if vectors.iter().any(|v| v.len() != dim) {
            return Err(PipelineError::ShapeMismatch {
                expected: format!("1x{}", dim),
                actual: "ragged feature rows".to_string(),
            });
        }

        let stage = feature_stage(name);
        let fingerprint = fingerprint_layered(&stage, &segments.fingerprint, params)?;

        let mut cursor = 0usize;
        for recording in &self.recordings {
            let seg_rows = segments.rows_for(&recording.recording_id);
            let slice = &vectors[cursor..cursor + seg_rows.len()];
            cursor += seg_rows.len();

            let lock = self.registry.stage_lock(&recording.recording_id, &stage);
            let _guard = lock.lock().expect("stage lock poisoned");
            if self
                .registry
                .lookup(&recording.recording_id, &stage, fingerprint.as_str())
                .is_some()
            {
                continue;
            }

            let mut header = ArrayHeader::new(
                StoreKind::Feature,
                fingerprint.as_str(),
                segments.fingerprint.as_str(),
                seg_rows.len() as u32,
                1,
                dim as u32,
            )?;
            header.set_compressed(true);
            let records = seg_rows
                .iter()
                .zip(slice)
                .map(|(row, data)| ArrayRecord {
                    segment_index: row.segment_index,
                    onset: row.onset,
                    offset: row.offset,
                    data: data.clone(),
                })
                .collect();

            let rel_path = artifact_rel_path(&stage, &recording.recording_id, &fingerprint, "syxa");
            let path = self.registry.root().join(&rel_path);
            let checksum = ArrayWriter::new(true).write_atomic(&path, &ArrayFile { header, records })?;

            let (source_size, source_mtime) = source_stamp(&recording.path)?;
            self.registry.publish(RegistryEntry {
                recording_id: recording.recording_id.clone(),
                stage: stage.clone(),
                fingerprint: fingerprint.as_str().to_string(),
                artifact_path: rel_path,
                checksum,
                rows: seg_rows.len() as u32,
                source_size,
                source_mtime,
                created_at: now_rfc3339(),
            })?;
        }

        Ok(fingerprint)
    }

    /// Select rows of an already-resolved segment field by predicate,
    /// without resolving any other field.
    pub fn select<F>(&self, segments: &SegmentField, predicate: F) -> RowSelection
    where
        F: Fn(&SegmentRow, &RecordingInfo) -> bool,
    {
        let keys = segments
            .rows
            .iter()
            .filter(|row| {
                self.by_id
                    .get(&row.recording_id)
                    .map(|info| predicate(row, info))
                    .unwrap_or(false)
            })
            .map(|row| (row.recording_id.clone(), row.segment_index))
            .collect();
        RowSelection { keys }
    }

    /// Segment rows of the selection, in field order.
    pub fn take_segments(
        &self,
        field: &SegmentField,
        selection: &RowSelection,
    ) -> Vec<SegmentRow> {
        let wanted: HashSet<(&str, u32)> = selection
            .keys
            .iter()
            .map(|(id, idx)| (id.as_str(), *idx))
            .collect();
        field
            .rows
            .iter()
            .filter(|r| wanted.contains(&(r.recording_id.as_str(), r.segment_index)))
            .cloned()
            .collect()
    }

    /// Array rows of the selection, in field order. Rows absent from the
    /// field (segments skipped as too short) are simply absent here too,
    /// so two array fields filtered by the same selection stay aligned
    /// row for row wherever both carry the segment.
    pub fn take_arrays(&self, field: &ArrayField, selection: &RowSelection) -> Vec<ArrayRow> {
        let wanted: HashSet<(&str, u32)> = selection
            .keys
            .iter()
            .map(|(id, idx)| (id.as_str(), *idx))
            .collect();
        field
            .rows
            .iter()
            .filter(|r| wanted.contains(&(r.recording_id.as_str(), r.segment_index)))
            .cloned()
            .collect()
    }

    fn field_lock(&self, key: &FieldKey) -> Arc<Mutex<()>> {
        let mut locks = self.field_locks.lock().expect("field lock map poisoned");
        locks.entry(key.clone()).or_default().clone()
    }

    fn lookup_field(&self, key: &FieldKey) -> Option<FieldData> {
        let fields = self.fields.lock().expect("field map poisoned");
        fields.get(key).cloned()
    }

    fn store_field(&self, key: FieldKey, data: FieldData) {
        let mut fields = self.fields.lock().expect("field map poisoned");
        fields.insert(key, data);
    }

    /// Load-or-compute the segment set of one recording under the
    /// registry's per-(recording, stage) lock.
    fn segments_for_recording(
        &self,
        recording: &RecordingInfo,
        strategy: &SegmentationStrategy,
        fingerprint: &Fingerprint,
    ) -> Result<SegmentSet> {
        let lock = self
            .registry
            .stage_lock(&recording.recording_id, STAGE_SEGMENTS);
        let _guard = lock.lock().expect("stage lock poisoned");

        if let Some(entry) =
            self.registry
                .lookup(&recording.recording_id, STAGE_SEGMENTS, fingerprint.as_str())
        {
            match self.load_sidecar(recording, &entry, fingerprint) {
                Ok(set) => return Ok(set),
                Err(reason) => {
                    log::warn!(
                        "cached segments for {} unusable ({}), recomputing",
                        recording.recording_id,
                        reason
                    );
                    self.registry.retract(
                        &recording.recording_id,
                        STAGE_SEGMENTS,
                        fingerprint.as_str(),
                    )?;
                }
            }
        }

        let audio = decode_audio(&recording.path, 0)?;
        let set = segment(&audio, strategy)?;
        self.publish_segments(recording, STAGE_SEGMENTS, &set)?;
        Ok(set)
    }

    fn refined_for_recording(
        &self,
        recording: &RecordingInfo,
        base: &SegmentSet,
        config: &RefineConfig,
        fingerprint: &Fingerprint,
    ) -> Result<SegmentSet> {
        let lock = self
            .registry
            .stage_lock(&recording.recording_id, STAGE_REFINED);
        let _guard = lock.lock().expect("stage lock poisoned");

        if let Some(entry) =
            self.registry
                .lookup(&recording.recording_id, STAGE_REFINED, fingerprint.as_str())
        {
            match self.load_sidecar(recording, &entry, fingerprint) {
                Ok(set) => return Ok(set),
                Err(reason) => {
                    log::warn!(
                        "cached refined segments for {} unusable ({}), recomputing",
                        recording.recording_id,
                        reason
                    );
                    self.registry.retract(
                        &recording.recording_id,
                        STAGE_REFINED,
                        fingerprint.as_str(),
                    )?;
                }
            }
        }

        let audio = decode_audio(&recording.path, 0)?;
        let set = refine(&audio, base, config)?;
        self.publish_segments(recording, STAGE_REFINED, &set)?;
        Ok(set)
    }

    /// Verify a cached sidecar: source unchanged, fingerprint matching,
    /// row count agreeing with the registry entry.
    fn load_sidecar(
        &self,
        recording: &RecordingInfo,
        entry: &RegistryEntry,
        fingerprint: &Fingerprint,
    ) -> std::result::Result<SegmentSet, String> {
        let (size, mtime) = source_stamp(&recording.path).map_err(|e| e.to_string())?;
        if size != entry.source_size || mtime != entry.source_mtime {
            return Err("source recording changed on disk".to_string());
        }

        let path = self.registry.artifact_path(entry);
        let sidecar = SegmentSidecar::read(&path).map_err(|e| e.to_string())?;
        if sidecar.fingerprint != fingerprint.as_str() {
            return Err("sidecar fingerprint mismatch".to_string());
        }
        if sidecar.pairs.len() != entry.rows as usize {
            return Err(format!(
                "sidecar holds {} rows, registry records {}",
                sidecar.pairs.len(),
                entry.rows
            ));
        }

        Ok(SegmentSet {
            pairs: sidecar.pairs,
            fingerprint: fingerprint.clone(),
            stats: SegmentStats {
                discarded_short: sidecar.discarded_short,
                clipped: sidecar.clipped,
            },
        })
    }

    fn publish_segments(
        &self,
        recording: &RecordingInfo,
        stage: &str,
        set: &SegmentSet,
    ) -> Result<()> {
        let rel_path = artifact_rel_path(stage, &recording.recording_id, &set.fingerprint, "txt");
        let path = self.registry.root().join(&rel_path);

        SegmentSidecar {
            recording_id: recording.recording_id.clone(),
            fingerprint: set.fingerprint.as_str().to_string(),
            discarded_short: set.stats.discarded_short,
            clipped: set.stats.clipped,
            pairs: set.pairs.clone(),
        }
        .write_atomic(&path)?;

        let (source_size, source_mtime) = source_stamp(&recording.path)?;
        self.registry.publish(RegistryEntry {
            recording_id: recording.recording_id.clone(),
            stage: stage.to_string(),
            fingerprint: set.fingerprint.as_str().to_string(),
            artifact_path: rel_path,
            checksum: 0,
            rows: set.pairs.len() as u32,
            source_size,
            source_mtime,
            created_at: now_rfc3339(),
        })?;
        Ok(())
    }

    /// Load-or-compute the spectrogram store of one recording.
    fn spectrograms_for_recording(
        &self,
        recording: &RecordingInfo,
        segments: &Arc<SegmentField>,
        expected: &[&SegmentRow],
        config: &SpectrogramConfig,
        config_fp: &Fingerprint,
        fingerprint: &Fingerprint,
    ) -> Result<ArrayFile> {
        let lock = self
            .registry
            .stage_lock(&recording.recording_id, STAGE_SPECTROGRAMS);
        let _guard = lock.lock().expect("stage lock poisoned");

        if let Some(entry) = self.registry.lookup(
            &recording.recording_id,
            STAGE_SPECTROGRAMS,
            fingerprint.as_str(),
        ) {
            match self.load_spectrograms(recording, &entry, segments, expected, config_fp) {
                Ok(file) => return Ok(file),
                Err(reason) => {
                    log::warn!(
                        "cached spectrograms for {} unusable ({}), recomputing",
                        recording.recording_id,
                        reason
                    );
                    self.registry.retract(
                        &recording.recording_id,
                        STAGE_SPECTROGRAMS,
                        fingerprint.as_str(),
                    )?;
                }
            }
        }

        let audio = decode_audio(&recording.path, config.sample_rate)?;
        let set = SegmentSet {
            pairs: expected.iter().map(|r| (r.onset, r.offset)).collect(),
            fingerprint: segments.fingerprint.clone(),
            stats: SegmentStats::default(),
        };
        let batch = build(&audio, &set, config)?;

        let mut header = ArrayHeader::new(
            StoreKind::Spectrogram,
            config_fp.as_str(),
            segments.fingerprint.as_str(),
            batch.records.len() as u32,
            config.shape_freq_bins as u32,
            config.shape_time_bins as u32,
        )?;
        header.set_compressed(true);
        let records: Vec<ArrayRecord> = batch
            .records
            .into_iter()
            .map(|r| ArrayRecord {
                segment_index: r.segment_index,
                onset: r.onset,
                offset: r.offset,
                data: r.data,
            })
            .collect();
        let file = ArrayFile { header, records };

        let rel_path =
            artifact_rel_path(STAGE_SPECTROGRAMS, &recording.recording_id, fingerprint, "syxa");
        let path = self.registry.root().join(&rel_path);
        let checksum = ArrayWriter::new(true).write_atomic(&path, &file)?;

        let (source_size, source_mtime) = source_stamp(&recording.path)?;
        self.registry.publish(RegistryEntry {
            recording_id: recording.recording_id.clone(),
            stage: STAGE_SPECTROGRAMS.to_string(),
            fingerprint: fingerprint.as_str().to_string(),
            artifact_path: rel_path,
            checksum,
            rows: file.records.len() as u32,
            source_size,
            source_mtime,
            created_at: now_rfc3339(),
        })?;

        Ok(file)
    }

    /// Verify a cached spectrogram store against its defining segment set.
    fn load_spectrograms(
        &self,
        recording: &RecordingInfo,
        entry: &RegistryEntry,
        segments: &Arc<SegmentField>,
        expected: &[&SegmentRow],
        config_fp: &Fingerprint,
    ) -> std::result::Result<ArrayFile, String> {
        let (size, mtime) = source_stamp(&recording.path).map_err(|e| e.to_string())?;
        if size != entry.source_size || mtime != entry.source_mtime {
            return Err("source recording changed on disk".to_string());
        }

        let path = self.registry.artifact_path(entry);
        let file = ArrayReader::read(&path).map_err(|e| e.to_string())?;

        if file.header.config_fingerprint_str() != config_fp.as_str() {
            return Err("config fingerprint mismatch".to_string());
        }
        if file.header.segset_fingerprint_str() != segments.fingerprint.as_str() {
            return Err("segment set fingerprint mismatch".to_string());
        }
        if file.records.len() != entry.rows as usize {
            return Err(format!(
                "store holds {} records, registry records {}",
                file.records.len(),
                entry.rows
            ));
        }
        if file.records.len() > expected.len() {
            return Err(format!(
                "store holds {} records for {} segments",
                file.records.len(),
                expected.len()
            ));
        }
        // Every record must point at a real segment with matching bounds.
        for record in &file.records {
            let row = expected
                .iter()
                .find(|r| r.segment_index == record.segment_index)
                .ok_or_else(|| format!("record references unknown segment {}", record.segment_index))?;
            if (row.onset - record.onset).abs() > 1e-9 || (row.offset - record.offset).abs() > 1e-9 {
                return Err(format!(
                    "record {} bounds drifted from segment set",
                    record.segment_index
                ));
            }
        }

        Ok(file)
    }
}

fn push_segment_rows(rows: &mut Vec<SegmentRow>, recording: &RecordingInfo, pairs: &[(f64, f64)]) {
    for (index, &(onset, offset)) in pairs.iter().enumerate() {
        rows.push(SegmentRow {
            recording_id: recording.recording_id.clone(),
            segment_index: index as u32,
            onset,
            offset,
        });
    }
}

fn feature_stage(name: &str) -> String {
    format!("feature:{}", name)
}

fn artifact_rel_path(
    stage: &str,
    recording_id: &str,
    fingerprint: &Fingerprint,
    extension: &str,
) -> String {
    let safe_stage = stage.replace(':', "_");
    let safe_id = recording_id.replace(['/', '\\'], "_");
    format!("{}/{}-{}.{}", safe_stage, safe_id, fingerprint, extension)
}

/// The cross-field row-count invariant, checked on every read: a
/// per-segment field must account for every segment of its defining set.
fn verify_alignment(field: &ArrayField, segments: &SegmentField) -> Result<()> {
    if field.segset_fingerprint != segments.fingerprint {
        return Err(PipelineError::Consistency(format!(
            "field {} was computed against segment set {}, requested {}",
            field.stage, field.segset_fingerprint, segments.fingerprint
        )));
    }
    if field.rows.len() + field.skipped_short as usize != segments.rows.len() {
        return Err(PipelineError::Consistency(format!(
            "field {} holds {} rows (+{} skipped) for {} segments",
            field.stage,
            field.rows.len(),
            field.skipped_short,
            segments.rows.len()
        )));
    }
    Ok(())
}
