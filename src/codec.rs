//! Entry envelope and byte codec
//!
//! Values are stored as JSON. Payloads above the compression threshold are
//! gzip-compressed and prefixed with [`COMPRESSED_MARKER`], so decoding needs
//! no side-channel metadata. JSON text never starts with that marker.

use std::io::{Read, Write};
use std::time::Duration;

use chrono::{DateTime, Utc};
use flate2::{Compression, read::GzDecoder, write::GzEncoder};
use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::CacheError;

/// Prefix tagging a gzip-compressed payload
pub const COMPRESSED_MARKER: &[u8] = b"gz:";

/// A cached value with its bookkeeping timestamps.
///
/// `expires_at` is the soft expiry: the point after which the entry is stale
/// and worth refreshing. The backend's own TTL removes it physically.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry<T> {
    pub data: T,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    /// Set on decode when the stored payload carried the compression marker
    #[serde(default, skip_serializing)]
    pub compressed: bool,
}

impl<T> CacheEntry<T> {
    /// Build an entry whose soft expiry is `ttl * soft_ttl_ratio` from now
    pub fn new(data: T, ttl: Duration, soft_ttl_ratio: f64) -> Self {
        let created_at = Utc::now();
        let soft = ttl.mul_f64(soft_ttl_ratio.clamp(0.0, 1.0));
        let expires_at = created_at
            + chrono::Duration::from_std(soft).unwrap_or_else(|_| chrono::Duration::days(36_500));
        Self {
            data,
            created_at,
            expires_at,
            compressed: false,
        }
    }

    /// Whether the soft expiry has passed
    pub fn is_stale(&self) -> bool {
        Utc::now() >= self.expires_at
    }

    /// Share of the soft lifetime already consumed, clamped to `[0, 1]`
    pub fn consumed_fraction(&self) -> f64 {
        let lifetime = (self.expires_at - self.created_at).num_milliseconds();
        if lifetime <= 0 {
            return 1.0;
        }
        let elapsed = (Utc::now() - self.created_at).num_milliseconds();
        (elapsed as f64 / lifetime as f64).clamp(0.0, 1.0)
    }
}

/// Serializes values to JSON, compressing oversized payloads
#[derive(Debug, Clone)]
pub struct Codec {
    compression_threshold: usize,
    max_entry_size: usize,
}

impl Codec {
    pub fn new(compression_threshold: usize, max_entry_size: usize) -> Self {
        Self {
            compression_threshold,
            max_entry_size,
        }
    }

    /// Encode a value, failing with `EntryTooLarge` when the final payload exceeds the limit
    pub fn encode<V: Serialize>(&self, value: &V) -> Result<Vec<u8>, CacheError> {
        let json = serde_json::to_vec(value)?;

        let bytes = if json.len() > self.compression_threshold {
            let mut encoder =
                GzEncoder::new(Vec::with_capacity(json.len() / 4), Compression::default());
            encoder.write_all(&json)?;
            let compressed = encoder.finish()?;

            let mut out = Vec::with_capacity(COMPRESSED_MARKER.len() + compressed.len());
            out.extend_from_slice(COMPRESSED_MARKER);
            out.extend_from_slice(&compressed);
            out
        } else {
            json
        };

        if bytes.len() > self.max_entry_size {
            return Err(CacheError::EntryTooLarge {
                size: bytes.len(),
                max: self.max_entry_size,
            });
        }
        Ok(bytes)
    }

    /// Decode a payload produced by [`Codec::encode`]
    pub fn decode<V: DeserializeOwned>(&self, bytes: &[u8]) -> Result<V, CacheError> {
        match bytes.strip_prefix(COMPRESSED_MARKER) {
            Some(compressed) => {
                let mut json = Vec::new();
                GzDecoder::new(compressed).read_to_end(&mut json)?;
                Ok(serde_json::from_slice(&json)?)
            }
            None => Ok(serde_json::from_slice(bytes)?),
        }
    }

    pub fn is_compressed(bytes: &[u8]) -> bool {
        bytes.starts_with(COMPRESSED_MARKER)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Course {
        id: u32,
        title: String,
    }

    #[test]
    fn small_values_stay_plain_json() {
        let codec = Codec::new(1024, 4096);
        let course = Course {
            id: 42,
            title: "Rust".to_owned(),
        };
        let bytes = codec.encode(&course).unwrap();
        assert!(!Codec::is_compressed(&bytes));
        assert_eq!(bytes.first(), Some(&b'{'));
        assert_eq!(codec.decode::<Course>(&bytes).unwrap(), course);
    }

    #[test]
    fn large_values_are_compressed_and_restored() {
        let codec = Codec::new(100, 1024 * 1024);
        let body = "lesson ".repeat(5_000);
        let bytes = codec.encode(&body).unwrap();

        assert!(Codec::is_compressed(&bytes));
        assert!(bytes.len() < body.len());
        assert_eq!(codec.decode::<String>(&bytes).unwrap(), body);
    }

    #[test]
    fn oversized_entries_fail_closed() {
        let codec = Codec::new(usize::MAX, 64);
        let err = codec.encode(&"x".repeat(100)).unwrap_err();
        assert!(matches!(err, CacheError::EntryTooLarge { max: 64, .. }));
    }

    #[test]
    fn size_limit_applies_after_compression() {
        // 200 KB of repetitive text compresses well below the 16 KB limit
        let codec = Codec::new(1024, 16 * 1024);
        let body = "a".repeat(200 * 1024);
        assert!(codec.encode(&body).is_ok());
    }

    #[test]
    fn corrupt_payloads_are_errors() {
        let codec = Codec::new(1024, 4096);
        assert!(codec.decode::<Course>(b"not json").is_err());
        assert!(codec.decode::<Course>(b"gz:garbage").is_err());
    }

    #[test]
    fn entry_tracks_soft_expiry() {
        let entry = CacheEntry::new(1u8, Duration::from_secs(100), 0.5);
        let soft = entry.expires_at - entry.created_at;
        assert_eq!(soft.num_seconds(), 50);
        assert!(!entry.is_stale());
        assert!(entry.consumed_fraction() < 0.1);

        let expired = CacheEntry::new(1u8, Duration::ZERO, 1.0);
        assert!(expired.is_stale());
        assert_eq!(expired.consumed_fraction(), 1.0);
    }
}
