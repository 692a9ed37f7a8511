//! Array store reader

use crate::format::{ArrayFile, ArrayHeader, ArrayRecord, StoreKind, HEADER_SIZE, MAGIC, VERSION};
use crate::{Result, StoreError};
use std::fs::File;
use std::io::Read;
use std::path::Path;

const CRC64: crc::Crc<u64> = crc::Crc::<u64>::new(&crc::CRC_64_ECMA_182);

pub struct ArrayReader;

impl ArrayReader {
    /// Read and fully verify a store file.
    pub fn read(path: &Path) -> Result<ArrayFile> {
        let mut file = File::open(path)?;
        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes)?;

        let header = parse_header(path, &bytes)?;

        let body = &bytes[HEADER_SIZE..];
        let payload = if header.is_compressed() {
            if body.len() as u64 != header.payload_size_compressed {
                return Err(corrupt(path, "compressed payload size mismatch"));
            }
            zstd::decode_all(body).map_err(|e| corrupt(path, &format!("zstd decode failed: {}", e)))?
        } else {
            body.to_vec()
        };

        if payload.len() as u64 != header.payload_size {
            return Err(corrupt(path, "payload size mismatch"));
        }
        if CRC64.checksum(&payload) != header.checksum {
            return Err(corrupt(path, "checksum mismatch"));
        }

        let records = parse_records(path, &header, &payload)?;
        Ok(ArrayFile { header, records })
    }

    /// Read only the header, via a memory map, without touching the payload.
    /// Used for cheap row-count and fingerprint probes of large stores.
    pub fn probe(path: &Path) -> Result<ArrayHeader> {
        let file = File::open(path)?;
        // Safety: the mapping is read-only and dropped before return.
        let map = unsafe { memmap2::Mmap::map(&file)? };
        parse_header(path, &map)
    }
}

fn corrupt(path: &Path, reason: &str) -> StoreError {
    StoreError::Corrupt {
        path: path.to_path_buf(),
        reason: reason.to_string(),
    }
}

fn parse_header(path: &Path, bytes: &[u8]) -> Result<ArrayHeader> {
    if bytes.len() < HEADER_SIZE {
        return Err(corrupt(path, "file shorter than header"));
    }

    let mut magic = [0u8; 4];
    magic.copy_from_slice(&bytes[0..4]);
    if magic != MAGIC {
        return Err(corrupt(path, "magic bytes mismatch"));
    }

    let version = u16::from_le_bytes([bytes[4], bytes[5]]);
    if version != VERSION {
        return Err(corrupt(path, &format!("unsupported version {}", version)));
    }

    let flags = u16::from_le_bytes([bytes[6], bytes[7]]);
    let kind = bytes[8];
    if StoreKind::from_code(kind).is_none() {
        return Err(corrupt(path, &format!("unknown record kind {}", kind)));
    }
    let mut reserved = [0u8; 3];
    reserved.copy_from_slice(&bytes[9..12]);

    let mut config_fingerprint = [0u8; 16];
    config_fingerprint.copy_from_slice(&bytes[12..28]);
    let mut segset_fingerprint = [0u8; 16];
    segset_fingerprint.copy_from_slice(&bytes[28..44]);

    let record_count = u32::from_le_bytes(bytes[44..48].try_into().unwrap());
    let record_rows = u32::from_le_bytes(bytes[48..52].try_into().unwrap());
    let record_cols = u32::from_le_bytes(bytes[52..56].try_into().unwrap());
    let payload_size = u64::from_le_bytes(bytes[56..64].try_into().unwrap());
    let payload_size_compressed = u64::from_le_bytes(bytes[64..72].try_into().unwrap());
    let checksum = u64::from_le_bytes(bytes[72..80].try_into().unwrap());

    Ok(ArrayHeader {
        magic,
        version,
        flags,
        kind,
        reserved,
        config_fingerprint,
        segset_fingerprint,
        record_count,
        record_rows,
        record_cols,
        payload_size,
        payload_size_compressed,
        checksum,
    })
}

fn parse_records(path: &Path, header: &ArrayHeader, payload: &[u8]) -> Result<Vec<ArrayRecord>> {
    let record_len = header.record_len();
    let stride = 4 + 8 + 8 + record_len * 4;

    if payload.len() != stride * header.record_count as usize {
        return Err(corrupt(path, "payload length disagrees with record count"));
    }

    let mut records = Vec::with_capacity(header.record_count as usize);
    for chunk in payload.chunks_exact(stride) {
        let segment_index = u32::from_le_bytes(chunk[0..4].try_into().unwrap());
        let onset = f64::from_le_bytes(chunk[4..12].try_into().unwrap());
        let offset = f64::from_le_bytes(chunk[12..20].try_into().unwrap());

        let mut data = Vec::with_capacity(record_len);
        for value in chunk[20..].chunks_exact(4) {
            data.push(f32::from_le_bytes(value.try_into().unwrap()));
        }

        records.push(ArrayRecord {
            segment_index,
            onset,
            offset,
            data,
        });
    }

    Ok(records)
}
