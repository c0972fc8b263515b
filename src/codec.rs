//! Versioned, data-only wire format for snapshots.
//!
//! Frame layout:
//!
//! ```text
//! +--------+---------+-------+----------------+---------------------+
//! | "WRSN" | version | flags | sha256(payload) | payload (JSON/defl) |
//! | 4 B    | u16 BE  | 1 B   | 32 B            | ...                 |
//! +--------+---------+-------+----------------+---------------------+
//! ```
//!
//! The payload only ever holds column names, column types, typed values and
//! shape metadata. Decoding never instantiates anything beyond those types.

use crate::history::Snapshot;
use crate::session::metadata::SessionId;
use crate::table::Table;
use flate2::Compression;
use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::io::{Read, Write};
use tracing::debug;

/// Frame magic
pub const SNAPSHOT_MAGIC: &[u8; 4] = b"WRSN";

/// Current snapshot format version
pub const SNAPSHOT_FORMAT_VERSION: u16 = 1;

const FLAG_DEFLATE: u8 = 0b0000_0001;
const KNOWN_FLAGS: u8 = FLAG_DEFLATE;
const DIGEST_LEN: usize = 32;
const HEADER_LEN: usize = SNAPSHOT_MAGIC.len() + 2 + 1 + DIGEST_LEN;

/// Upper bound on an inflated payload, guarding against decompression bombs
const MAX_PAYLOAD_BYTES: u64 = 512 * 1024 * 1024;

/// Errors produced while encoding or decoding snapshot frames
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CodecError {
    #[error("unsupported snapshot format version {found} (supported: {supported})")]
    UnsupportedVersion { found: u16, supported: u16 },

    #[error("snapshot frame truncated: {len} bytes, need at least {needed}")]
    Truncated { len: usize, needed: usize },

    #[error("not a snapshot frame (bad magic)")]
    BadMagic,

    #[error("unknown snapshot flags {0:#04x}")]
    UnknownFlags(u8),

    #[error("snapshot checksum mismatch")]
    ChecksumMismatch,

    #[error("malformed snapshot payload: {0}")]
    Malformed(String),

    #[error("failed to encode snapshot: {0}")]
    Encode(String),
}

/// Codec settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CodecConfig {
    pub compress: bool,
    pub compression_level: u32,
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            compress: false,
            compression_level: 6,
        }
    }
}

#[derive(Serialize, Deserialize)]
struct SnapshotPayload {
    session_id: SessionId,
    sequence: u64,
    row_count: usize,
    table: Table,
}

/// Encodes snapshots to frames and back
#[derive(Debug, Clone, Default)]
pub struct SnapshotCodec {
    config: CodecConfig,
}

impl SnapshotCodec {
    pub fn new(config: CodecConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &CodecConfig {
        &self.config
    }

    pub fn encode(&self, snapshot: &Snapshot) -> Result<Vec<u8>, CodecError> {
        let payload = SnapshotPayload {
            session_id: snapshot.session_id(),
            sequence: snapshot.sequence(),
            row_count: snapshot.table().row_count(),
            table: snapshot.table().clone(),
        };
        let json = serde_json::to_vec(&payload).map_err(|e| CodecError::Encode(e.to_string()))?;

        let (flags, body) = if self.config.compress {
            let mut encoder =
                DeflateEncoder::new(Vec::new(), Compression::new(self.config.compression_level));
            encoder
                .write_all(&json)
                .map_err(|e| CodecError::Encode(e.to_string()))?;
            let compressed = encoder
                .finish()
                .map_err(|e| CodecError::Encode(e.to_string()))?;
            (FLAG_DEFLATE, compressed)
        } else {
            (0, json)
        };

        let mut frame = Vec::with_capacity(HEADER_LEN + body.len());
        frame.extend_from_slice(SNAPSHOT_MAGIC);
        frame.extend_from_slice(&SNAPSHOT_FORMAT_VERSION.to_be_bytes());
        frame.push(flags);
        frame.extend_from_slice(&Sha256::digest(&body));
        frame.extend_from_slice(&body);

        debug!(
            "Encoded snapshot {}:{} ({} bytes)",
            snapshot.session_id(),
            snapshot.sequence(),
            frame.len()
        );
        Ok(frame)
    }

    pub fn decode(&self, bytes: &[u8]) -> Result<Snapshot, CodecError> {
        if bytes.len() < SNAPSHOT_MAGIC.len() {
            return Err(CodecError::Truncated {
                len: bytes.len(),
                needed: HEADER_LEN,
            });
        }
        if &bytes[..SNAPSHOT_MAGIC.len()] != SNAPSHOT_MAGIC {
            return Err(CodecError::BadMagic);
        }
        if bytes.len() < HEADER_LEN {
            return Err(CodecError::Truncated {
                len: bytes.len(),
                needed: HEADER_LEN,
            });
        }

        let version = u16::from_be_bytes([bytes[4], bytes[5]]);
        if version != SNAPSHOT_FORMAT_VERSION {
            return Err(CodecError::UnsupportedVersion {
                found: version,
                supported: SNAPSHOT_FORMAT_VERSION,
            });
        }

        let flags = bytes[6];
        if flags & !KNOWN_FLAGS != 0 {
            return Err(CodecError::UnknownFlags(flags));
        }

        let digest = &bytes[7..HEADER_LEN];
        let body = &bytes[HEADER_LEN..];
        if Sha256::digest(body).as_slice() != digest {
            return Err(CodecError::ChecksumMismatch);
        }

        let json = if flags & FLAG_DEFLATE != 0 {
            let mut inflated = Vec::new();
            DeflateDecoder::new(body)
                .take(MAX_PAYLOAD_BYTES + 1)
                .read_to_end(&mut inflated)
                .map_err(|e| CodecError::Malformed(e.to_string()))?;
            if inflated.len() as u64 > MAX_PAYLOAD_BYTES {
                return Err(CodecError::Malformed("payload exceeds size limit".to_string()));
            }
            inflated
        } else {
            body.to_vec()
        };

        let payload: SnapshotPayload =
            serde_json::from_slice(&json).map_err(|e| CodecError::Malformed(e.to_string()))?;

        if payload.table.row_count() != payload.row_count
            && payload.table.column_count() > 0
        {
            return Err(CodecError::Malformed(format!(
                "row count {} does not match table shape {}",
                payload.row_count,
                payload.table.row_count()
            )));
        }

        Ok(Snapshot::new(
            payload.session_id,
            payload.sequence,
            payload.table,
        ))
    }

    /// Hex SHA-256 over a whole frame, recorded in history for recovery checks
    pub fn checksum(bytes: &[u8]) -> String {
        format!("{:x}", Sha256::digest(bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::{Column, ColumnData};
    use chrono::{TimeZone, Utc};

    fn sample_snapshot() -> Snapshot {
        let table = Table::new(vec![
            Column::new("age", ColumnData::Integer(vec![Some(31), None, Some(47)])),
            Column::new(
                "name",
                ColumnData::Text(vec![Some("ada".into()), None, Some("grace".into())]),
            ),
            Column::new("score", ColumnData::Float(vec![Some(0.1), Some(2.5), None])),
            Column::new(
                "joined",
                ColumnData::Datetime(vec![
                    Some(Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap()),
                    None,
                    None,
                ]),
            ),
        ])
        .unwrap();
        Snapshot::new(SessionId::new_v4(), 3, table)
    }

    #[test]
    fn test_round_trip_is_byte_stable() {
        for compress in [false, true] {
            let codec = SnapshotCodec::new(CodecConfig {
                compress,
                ..Default::default()
            });
            let snapshot = sample_snapshot();
            let bytes = codec.encode(&snapshot).unwrap();
            let decoded = codec.decode(&bytes).unwrap();
            assert_eq!(decoded, snapshot);
            assert_eq!(codec.encode(&decoded).unwrap(), bytes);
        }
    }

    #[test]
    fn test_float_heavy_table_round_trips_exactly() {
        let values: Vec<Option<f64>> = (0..2000)
            .map(|i| {
                let x = i as f64;
                Some(x.sin() * 1e-3 + x * 7.123456789)
            })
            .chain([Some(14.247822875426825), Some(f64::MIN_POSITIVE), Some(-1.0e300)])
            .collect();
        let table = Table::new(vec![Column::new("x", ColumnData::Float(values))]).unwrap();
        let snapshot = Snapshot::new(SessionId::new_v4(), 0, table);

        for compress in [false, true] {
            let codec = SnapshotCodec::new(CodecConfig {
                compress,
                ..Default::default()
            });
            let bytes = codec.encode(&snapshot).unwrap();
            let decoded = codec.decode(&bytes).unwrap();
            assert_eq!(decoded, snapshot);
            assert_eq!(codec.encode(&decoded).unwrap(), bytes);
        }
    }

    #[test]
    fn test_unknown_version_is_rejected() {
        let codec = SnapshotCodec::default();
        let mut bytes = codec.encode(&sample_snapshot()).unwrap();
        bytes[5] = 9;
        assert_eq!(
            codec.decode(&bytes),
            Err(CodecError::UnsupportedVersion {
                found: 9,
                supported: SNAPSHOT_FORMAT_VERSION
            })
        );
    }

    #[test]
    fn test_tampered_and_truncated_frames_fail() {
        let codec = SnapshotCodec::default();
        let bytes = codec.encode(&sample_snapshot()).unwrap();

        let mut tampered = bytes.clone();
        let last = tampered.len() - 2;
        tampered[last] ^= 0x01;
        assert_eq!(codec.decode(&tampered), Err(CodecError::ChecksumMismatch));

        let truncated = &bytes[..bytes.len() - 10];
        assert_eq!(codec.decode(truncated), Err(CodecError::ChecksumMismatch));

        assert!(matches!(
            codec.decode(&bytes[..10]),
            Err(CodecError::Truncated { .. })
        ));
        assert_eq!(codec.decode(b"{\"py/object\": 1}"), Err(CodecError::BadMagic));
    }

    #[test]
    fn test_valid_digest_over_foreign_payload_is_malformed() {
        let codec = SnapshotCodec::default();
        let body = br#"{"session_id":"x","__class__":"os.system"}"#;
        let mut frame = Vec::new();
        frame.extend_from_slice(SNAPSHOT_MAGIC);
        frame.extend_from_slice(&SNAPSHOT_FORMAT_VERSION.to_be_bytes());
        frame.push(0);
        frame.extend_from_slice(&Sha256::digest(body));
        frame.extend_from_slice(body);

        assert!(matches!(codec.decode(&frame), Err(CodecError::Malformed(_))));
    }

    #[test]
    fn test_checksum_is_hex_sha256() {
        let checksum = SnapshotCodec::checksum(b"abc");
        assert_eq!(
            checksum,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
