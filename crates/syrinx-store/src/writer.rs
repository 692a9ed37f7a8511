//! Array store writer

use crate::format::{ArrayFile, ArrayHeader};
use crate::{Result, StoreError};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

const CRC64: crc::Crc<u64> = crc::Crc::<u64>::new(&crc::CRC_64_ECMA_182);

pub struct ArrayWriter {
    compress: bool,
}

impl ArrayWriter {
    pub fn new(compress: bool) -> Self {
        Self { compress }
    }

    /// Write a store file atomically: the bytes land in a temporary file in
    /// the target directory and are renamed into place only once complete.
    /// A crash mid-write leaves no partial file at `path`. Returns the
    /// CRC-64 checksum of the uncompressed payload.
    pub fn write_atomic(&self, path: &Path, file: &ArrayFile) -> Result<u64> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp_path = tmp_sibling(path);

        let checksum = match self.write_to(&tmp_path, file) {
            Ok(checksum) => checksum,
            Err(e) => {
                let _ = std::fs::remove_file(&tmp_path);
                return Err(e);
            }
        };
        std::fs::rename(&tmp_path, path)?;
        Ok(checksum)
    }

    fn write_to(&self, path: &Path, file: &ArrayFile) -> Result<u64> {
        let payload = encode_payload(&file.header, &file.records)?;

        let mut header = file.header.clone();
        header.payload_size = payload.len() as u64;
        header.checksum = CRC64.checksum(&payload);
        header.record_count = file.records.len() as u32;

        let body = if self.compress {
            let compressed = zstd::encode_all(&payload[..], 0)
                .map_err(|e| StoreError::Index(format!("zstd encode failed: {}", e)))?;
            header.set_compressed(true);
            header.payload_size_compressed = compressed.len() as u64;
            compressed
        } else {
            header.set_compressed(false);
            header.payload_size_compressed = 0;
            payload
        };

        let out = File::create(path)?;
        let mut writer = BufWriter::new(out);
        write_header(&mut writer, &header)?;
        writer.write_all(&body)?;
        writer.flush()?;
        Ok(header.checksum)
    }
}

impl Default for ArrayWriter {
    fn default() -> Self {
        Self::new(true)
    }
}

fn tmp_sibling(path: &Path) -> std::path::PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "artifact".to_string());
    name.push_str(".tmp");
    path.with_file_name(name)
}

fn encode_payload(header: &ArrayHeader, records: &[crate::ArrayRecord]) -> Result<Vec<u8>> {
    let record_len = header.record_len();
    let mut payload = Vec::with_capacity(records.len() * (16 + 4 + record_len * 4));

    for record in records {
        if record.data.len() != record_len {
            return Err(StoreError::Shape(format!(
                "record {} holds {} values, header declares {}x{}",
                record.segment_index,
                record.data.len(),
                header.record_rows,
                header.record_cols
            )));
        }
        payload.extend_from_slice(&record.segment_index.to_le_bytes());
        payload.extend_from_slice(&record.onset.to_le_bytes());
        payload.extend_from_slice(&record.offset.to_le_bytes());
        for value in &record.data {
            payload.extend_from_slice(&value.to_le_bytes());
        }
    }

    Ok(payload)
}

fn write_header(writer: &mut BufWriter<File>, header: &ArrayHeader) -> Result<()> {
    // Write as little-endian binary
    writer.write_all(&header.magic)?;
    writer.write_all(&header.version.to_le_bytes())?;
    writer.write_all(&header.flags.to_le_bytes())?;
    writer.write_all(&[header.kind])?;
    writer.write_all(&header.reserved)?;
    writer.write_all(&header.config_fingerprint)?;
    writer.write_all(&header.segset_fingerprint)?;
    writer.write_all(&header.record_count.to_le_bytes())?;
    writer.write_all(&header.record_rows.to_le_bytes())?;
    writer.write_all(&header.record_cols.to_le_bytes())?;
    writer.write_all(&header.payload_size.to_le_bytes())?;
    writer.write_all(&header.payload_size_compressed.to_le_bytes())?;
    writer.write_all(&header.checksum.to_le_bytes())?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::{ArrayRecord, StoreKind};

    fn sample_file(record_count: usize) -> ArrayFile {
        let header = ArrayHeader::new(
            StoreKind::Spectrogram,
            "0123456789abcdef",
            "fedcba9876543210",
            record_count as u32,
            4,
            4,
        )
        .unwrap();
        let records = (0..record_count)
            .map(|i| ArrayRecord {
                segment_index: i as u32,
                onset: i as f64 * 0.5,
                offset: i as f64 * 0.5 + 0.25,
                data: vec![i as f32; 16],
            })
            .collect();
        ArrayFile { header, records }
    }

    #[test]
    fn test_write_creates_file_and_no_tmp_remains() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("specs.syxa");
        ArrayWriter::new(false).write_atomic(&path, &sample_file(3)).unwrap();
        assert!(path.exists());
        assert!(!tmp_sibling(&path).exists());
    }

    #[test]
    fn test_shape_violation_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.syxa");
        let mut file = sample_file(1);
        file.records[0].data.truncate(3);
        let err = ArrayWriter::new(false).write_atomic(&path, &file);
        assert!(matches!(err, Err(StoreError::Shape(_))));
        assert!(!path.exists());
    }
}
