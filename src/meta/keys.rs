//! Key layout, version ids and upload ids
//!
//! Keys are `<table> 0x1F <field> 0x1F ...`. Table prefixes: `b` buckets,
//! `o` objects, `m` multipart uploads, `f` freezers, `g` garbage.

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Nonce};
use chrono::{DateTime, TimeZone, Utc};

use crate::domain::BackendTuple;
use crate::error::{ApiErrorCode, Error, Result};

/// Field separator.
pub const SEP: u8 = 0x1f;

pub const TABLE_BUCKET: u8 = b'b';
pub const TABLE_OBJECT: u8 = b'o';
pub const TABLE_MULTIPART: u8 = b'm';
pub const TABLE_FREEZER: u8 = b'f';
pub const TABLE_GC: u8 = b'g';

/// Version id of unversioned and null-version objects.
pub const NULL_VERSION: &str = "0";

const UPLOAD_ID_KEY: [u8; 32] = *b"objgate-upload-id-obfuscation-k!";
const UPLOAD_ID_NONCE: [u8; 12] = *b"objgate-upld";

fn key(table: u8, fields: &[&str]) -> Vec<u8> {
    let len = 1 + fields.iter().map(|f| f.len() + 1).sum::<usize>();
    let mut out = Vec::with_capacity(len);
    out.push(table);
    for field in fields {
        out.push(SEP);
        out.extend_from_slice(field.as_bytes());
    }
    out
}

/// `[prefix, prefix')` where `prefix'` bumps the trailing separator.
fn prefix_range(mut prefix: Vec<u8>) -> (Vec<u8>, Vec<u8>) {
    prefix.push(SEP);
    let mut end = prefix.clone();
    if let Some(last) = end.last_mut() {
        *last = SEP + 1;
    }
    (prefix, end)
}

pub fn bucket_key(bucket: &str) -> Vec<u8> {
    key(TABLE_BUCKET, &[bucket])
}

pub fn object_key(bucket: &str, name: &str, version_id: &str) -> Vec<u8> {
    key(TABLE_OBJECT, &[bucket, name, version_id])
}

pub fn multipart_key(bucket: &str, name: &str, upload_id: &str) -> Vec<u8> {
    key(TABLE_MULTIPART, &[bucket, name, upload_id])
}

pub fn freezer_key(bucket: &str, name: &str, version_id: &str) -> Vec<u8> {
    key(TABLE_FREEZER, &[bucket, name, version_id])
}

pub fn gc_key(tuple: &BackendTuple) -> Vec<u8> {
    key(
        TABLE_GC,
        &[&tuple.cluster_id, tuple.pool.name(), &tuple.object_id],
    )
}

/// Whole table.
pub fn table_range(table: u8) -> (Vec<u8>, Vec<u8>) {
    (vec![table, SEP], vec![table, SEP + 1])
}

/// Every object version in a bucket.
pub fn bucket_objects_range(bucket: &str) -> (Vec<u8>, Vec<u8>) {
    prefix_range(key(TABLE_OBJECT, &[bucket]))
}

/// Every object in `bucket` whose name starts with `prefix`.
pub fn object_prefix_range(bucket: &str, prefix: &str) -> (Vec<u8>, Vec<u8>) {
    name_prefix_range(TABLE_OBJECT, bucket, prefix)
}

/// Every multipart upload in `bucket` whose object name starts with `prefix`.
pub fn multipart_prefix_range(bucket: &str, prefix: &str) -> (Vec<u8>, Vec<u8>) {
    name_prefix_range(TABLE_MULTIPART, bucket, prefix)
}

fn name_prefix_range(table: u8, bucket: &str, prefix: &str) -> (Vec<u8>, Vec<u8>) {
    let (start, end) = prefix_range(key(table, &[bucket]));
    if prefix.is_empty() {
        return (start, end);
    }
    let mut narrowed = start;
    narrowed.extend_from_slice(prefix.as_bytes());
    let upper = prefix_successor(&narrowed).unwrap_or(end);
    (narrowed, upper)
}

/// Smallest key greater than every key starting with `prefix`.
fn prefix_successor(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut out = prefix.to_vec();
    while let Some(last) = out.pop() {
        if last < u8::MAX {
            out.push(last + 1);
            return Some(out);
        }
    }
    None
}

/// Every version of one key.
pub fn object_versions_range(bucket: &str, name: &str) -> (Vec<u8>, Vec<u8>) {
    prefix_range(key(TABLE_OBJECT, &[bucket, name]))
}

/// Intersection of two half-open ranges. An empty end means unbounded.
pub fn intersect(a: (&[u8], &[u8]), b: (&[u8], &[u8])) -> Option<(Vec<u8>, Vec<u8>)> {
    let start = a.0.max(b.0);
    let end = match (a.1.is_empty(), b.1.is_empty()) {
        (true, true) => &[][..],
        (true, false) => b.1,
        (false, true) => a.1,
        (false, false) => a.1.min(b.1),
    };
    if !end.is_empty() && start >= end {
        return None;
    }
    Some((start.to_vec(), end.to_vec()))
}

// =============================================================================
// Version Ids
// =============================================================================

/// Version id for a write at `last_modified`.
///
/// `u64::MAX - nanos`, zero padded, so newer versions sort first.
pub fn version_id_for(last_modified: DateTime<Utc>) -> String {
    let nanos = last_modified.timestamp_nanos_opt().unwrap_or(0).max(0) as u64;
    format!("{:020}", u64::MAX - nanos)
}

/// Recover the write time from a version id.
pub fn version_time(version_id: &str) -> Option<DateTime<Utc>> {
    if version_id == NULL_VERSION {
        return None;
    }
    let raw: u64 = version_id.parse().ok()?;
    let nanos = i64::try_from(u64::MAX - raw).ok()?;
    Some(Utc.timestamp_nanos(nanos))
}

// =============================================================================
// Upload Ids
// =============================================================================

fn upload_cipher() -> ChaCha20Poly1305 {
    ChaCha20Poly1305::new(&UPLOAD_ID_KEY.into())
}

/// Opaque upload id encoding the upload's initiation time.
pub fn encode_upload_id(initial_time: DateTime<Utc>) -> Result<String> {
    let nanos = initial_time.timestamp_nanos_opt().unwrap_or(0);
    let sealed = upload_cipher()
        .encrypt(Nonce::from_slice(&UPLOAD_ID_NONCE), nanos.to_string().as_bytes())
        .map_err(|e| Error::Crypto(format!("upload id encryption failed: {}", e)))?;
    Ok(hex::encode(sealed))
}

/// Recover the initiation time from an upload id.
pub fn decode_upload_id(upload_id: &str) -> Result<DateTime<Utc>> {
    let sealed = hex::decode(upload_id).map_err(|_| Error::Api(ApiErrorCode::NoSuchUpload))?;
    let plain = upload_cipher()
        .decrypt(Nonce::from_slice(&UPLOAD_ID_NONCE), sealed.as_ref())
        .map_err(|_| Error::Api(ApiErrorCode::NoSuchUpload))?;
    let nanos: i64 = std::str::from_utf8(&plain)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or(Error::Api(ApiErrorCode::NoSuchUpload))?;
    Ok(Utc.timestamp_nanos(nanos))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Pool;
    use chrono::Duration;

    #[test]
    fn test_object_key_layout() {
        assert_eq!(object_key("b", "k", "v"), b"o\x1fb\x1fk\x1fv".to_vec());
        let (start, end) = table_range(TABLE_MULTIPART);
        assert_eq!(start, b"m\x1f".to_vec());
        assert_eq!(end, b"m\x20".to_vec());
    }

    #[test]
    fn test_bucket_range_contains_only_bucket() {
        let (start, end) = bucket_objects_range("b1");
        let inside = object_key("b1", "k", "v");
        let other = object_key("b10", "k", "v");
        assert!(inside >= start && inside < end);
        assert!(!(other >= start && other < end));
    }

    #[test]
    fn test_object_prefix_range() {
        let (start, end) = object_prefix_range("b", "logs/");
        let hit = object_key("b", "logs/a", "v");
        let miss = object_key("b", "logt", "v");
        assert!(hit >= start && hit < end);
        assert!(!(miss >= start && miss < end));
        assert_eq!(object_prefix_range("b", ""), bucket_objects_range("b"));
        let (start, end) = multipart_prefix_range("b", "logs/");
        let upload = multipart_key("b", "logs/a", "u");
        assert!(upload >= start && upload < end);
    }

    #[test]
    fn test_intersect() {
        let r = intersect((b"a", b"m"), (b"c", b"")).unwrap();
        assert_eq!(r, (b"c".to_vec(), b"m".to_vec()));
        assert!(intersect((b"a", b"c"), (b"d", b"z")).is_none());
        let r = intersect((b"", b""), (b"", b"")).unwrap();
        assert_eq!(r, (vec![], vec![]));
    }

    #[test]
    fn test_newer_version_sorts_first() {
        let t1 = Utc::now();
        let t2 = t1 + Duration::nanoseconds(1);
        let v1 = version_id_for(t1);
        let v2 = version_id_for(t2);
        assert!(v2 < v1);
        assert_eq!(v1.len(), 20);
        assert_eq!(version_time(&v1), Some(t1));
        assert_eq!(version_time(NULL_VERSION), None);
    }

    #[test]
    fn test_upload_id_round_trip() {
        let t = Utc::now();
        let id = encode_upload_id(t).unwrap();
        assert_eq!(decode_upload_id(&id).unwrap(), t);
        assert_eq!(encode_upload_id(t).unwrap(), id);
    }

    #[test]
    fn test_upload_id_rejects_garbage() {
        assert!(decode_upload_id("zz").is_err());
        assert!(decode_upload_id("00112233").is_err());
    }

    #[test]
    fn test_gc_key() {
        let tuple = BackendTuple::new("c", Pool::Big, "i:1");
        assert_eq!(gc_key(&tuple), b"g\x1fc\x1fbig\x1fi:1".to_vec());
    }
}
