//! Metadata record types
//!
//! Records are stored msgpack encoded with named fields, so adding an
//! optional field stays readable by older records.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{BackendTuple, Pool};

// =============================================================================
// Storage Class
// =============================================================================

/// S3 storage classes, ordered by transition weight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum StorageClass {
    #[default]
    #[serde(rename = "STANDARD")]
    Standard,
    #[serde(rename = "REDUCED_REDUNDANCY")]
    ReducedRedundancy,
    #[serde(rename = "STANDARD_IA")]
    StandardIa,
    #[serde(rename = "INTELLIGENT_TIERING")]
    IntelligentTiering,
    #[serde(rename = "ONEZONE_IA")]
    OnezoneIa,
    #[serde(rename = "GLACIER")]
    Glacier,
    #[serde(rename = "DEEP_ARCHIVE")]
    DeepArchive,
}

impl StorageClass {
    pub const ALL: [StorageClass; 7] = [
        StorageClass::Standard,
        StorageClass::ReducedRedundancy,
        StorageClass::StandardIa,
        StorageClass::IntelligentTiering,
        StorageClass::OnezoneIa,
        StorageClass::Glacier,
        StorageClass::DeepArchive,
    ];

    /// Wire name.
    pub fn name(&self) -> &'static str {
        match self {
            StorageClass::Standard => "STANDARD",
            StorageClass::ReducedRedundancy => "REDUCED_REDUNDANCY",
            StorageClass::StandardIa => "STANDARD_IA",
            StorageClass::IntelligentTiering => "INTELLIGENT_TIERING",
            StorageClass::OnezoneIa => "ONEZONE_IA",
            StorageClass::Glacier => "GLACIER",
            StorageClass::DeepArchive => "DEEP_ARCHIVE",
        }
    }

    /// Parse a wire name. `RRS` is accepted for reduced redundancy.
    pub fn from_name(name: &str) -> Option<StorageClass> {
        if name == "RRS" {
            return Some(StorageClass::ReducedRedundancy);
        }
        StorageClass::ALL.into_iter().find(|c| c.name() == name)
    }

    /// Transition weight. An object only moves to a strictly heavier class.
    pub fn weight(&self) -> u8 {
        match self {
            StorageClass::Standard | StorageClass::ReducedRedundancy => 1,
            StorageClass::StandardIa => 2,
            StorageClass::IntelligentTiering => 3,
            StorageClass::OnezoneIa => 4,
            StorageClass::Glacier => 5,
            StorageClass::DeepArchive => 6,
        }
    }

    /// Archive classes live in the cold pool and need a restore to be read.
    pub fn is_archive(&self) -> bool {
        matches!(self, StorageClass::Glacier | StorageClass::DeepArchive)
    }
}

impl fmt::Display for StorageClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// =============================================================================
// Buckets
// =============================================================================

/// Bucket versioning state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum VersioningStatus {
    #[default]
    Disabled,
    Enabled,
    Suspended,
}

impl VersioningStatus {
    /// Whether the bucket keeps more than one version per key.
    pub fn is_versioned(&self) -> bool {
        !matches!(self, VersioningStatus::Disabled)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bucket {
    pub name: String,
    pub owner_id: String,
    pub created: DateTime<Utc>,
    pub versioning: VersioningStatus,
    /// Lifecycle configuration document, as accepted.
    #[serde(default)]
    pub lifecycle_xml: Option<String>,
}

impl Bucket {
    pub fn new(name: impl Into<String>, owner_id: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            owner_id: owner_id.into(),
            created: Utc::now(),
            versioning: VersioningStatus::Disabled,
            lifecycle_xml: None,
        }
    }
}

// =============================================================================
// Objects
// =============================================================================

/// How an object's data was written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ObjectType {
    #[default]
    Normal,
    Appendable,
    Multipart,
}

/// One part of a multipart object or upload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Part {
    pub number: u32,
    pub size: u64,
    pub object_id: String,
    /// Offset of this part within the assembled object.
    pub offset: u64,
    pub etag: String,
    pub last_modified: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Object {
    pub bucket: String,
    pub name: String,
    pub version_id: String,
    /// Cluster id holding the data.
    pub location: String,
    pub pool: Pool,
    pub owner_id: String,
    pub size: u64,
    /// Backend object id; empty for multipart objects and delete markers.
    pub object_id: String,
    pub last_modified: DateTime<Utc>,
    pub etag: String,
    #[serde(default)]
    pub content_type: String,
    #[serde(default)]
    pub custom_attrs: BTreeMap<String, String>,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    #[serde(default)]
    pub parts: BTreeMap<u32, Part>,
    pub storage_class: StorageClass,
    pub object_type: ObjectType,
    #[serde(default)]
    pub delete_marker: bool,
    #[serde(default)]
    pub null_version: bool,
}

impl Object {
    /// Every backend blob holding this object's data.
    pub fn backend_tuples(&self) -> Vec<BackendTuple> {
        if self.delete_marker {
            return Vec::new();
        }
        if !self.parts.is_empty() {
            return self
                .parts
                .values()
                .map(|p| BackendTuple::new(&self.location, self.pool, &p.object_id))
                .collect();
        }
        if self.object_id.is_empty() {
            return Vec::new();
        }
        vec![BackendTuple::new(&self.location, self.pool, &self.object_id)]
    }
}

/// An in-progress multipart upload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Multipart {
    pub bucket: String,
    pub object: String,
    pub upload_id: String,
    pub initial_time: DateTime<Utc>,
    pub owner_id: String,
    pub storage_class: StorageClass,
    pub location: String,
    pub pool: Pool,
    #[serde(default)]
    pub content_type: String,
    #[serde(default)]
    pub parts: BTreeMap<u32, Part>,
}

impl Multipart {
    /// Backend blobs of uploaded parts.
    pub fn backend_tuples(&self) -> Vec<BackendTuple> {
        self.parts
            .values()
            .map(|p| BackendTuple::new(&self.location, self.pool, &p.object_id))
            .collect()
    }
}

// =============================================================================
// Freezer (restored copies)
// =============================================================================

/// Progress of a restore.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum RestoreStatus {
    #[default]
    Ready,
    Restoring,
    Finished,
}

/// Start offsets of an object's parts in part number order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartsIndex {
    pub starts: Vec<u64>,
}

impl PartsIndex {
    pub fn build(parts: &BTreeMap<u32, Part>) -> Self {
        let mut next = 0u64;
        let starts = parts
            .values()
            .map(|part| {
                let start = next;
                next += part.size;
                start
            })
            .collect();
        Self { starts }
    }

    /// Position, in part number order, of the part holding `offset`.
    pub fn locate(&self, offset: u64) -> Option<usize> {
        match self.starts.partition_point(|&start| start <= offset) {
            0 => None,
            n => Some(n - 1),
        }
    }
}

/// Hot copy of an archived object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Freezer {
    pub bucket: String,
    pub name: String,
    pub version_id: String,
    pub status: RestoreStatus,
    /// Days the restored copy lives once finished.
    pub lifetime_days: u32,
    /// Cluster id of the restored data; empty until restored.
    #[serde(default)]
    pub location: String,
    pub pool: Pool,
    #[serde(default)]
    pub object_id: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub etag: String,
    #[serde(default)]
    pub parts: BTreeMap<u32, Part>,
    /// Set for multipart copies.
    #[serde(default)]
    pub parts_index: Option<PartsIndex>,
    /// Type and class of the source object.
    #[serde(default)]
    pub object_type: ObjectType,
    #[serde(default)]
    pub storage_class: StorageClass,
    pub owner_id: String,
    #[serde(default)]
    pub create_time: DateTime<Utc>,
    /// Request time, then completion time once finished.
    pub last_modified: DateTime<Utc>,
    /// Restore attempts started, resumed ones included.
    #[serde(default)]
    pub tried_times: u32,
}

impl Freezer {
    /// A restore request waiting to be picked up.
    pub fn request(
        bucket: impl Into<String>,
        name: impl Into<String>,
        version_id: impl Into<String>,
        owner_id: impl Into<String>,
        lifetime_days: u32,
    ) -> Self {
        let now = Utc::now();
        Self {
            bucket: bucket.into(),
            name: name.into(),
            version_id: version_id.into(),
            status: RestoreStatus::Ready,
            lifetime_days,
            location: String::new(),
            pool: Pool::Big,
            object_id: String::new(),
            size: 0,
            etag: String::new(),
            parts: BTreeMap::new(),
            parts_index: None,
            object_type: ObjectType::Normal,
            storage_class: StorageClass::Standard,
            owner_id: owner_id.into(),
            create_time: now,
            last_modified: now,
            tried_times: 0,
        }
    }

    /// Backend blobs of the restored copy.
    pub fn backend_tuples(&self) -> Vec<BackendTuple> {
        if self.location.is_empty() {
            return Vec::new();
        }
        if !self.parts.is_empty() {
            return self
                .parts
                .values()
                .map(|p| BackendTuple::new(&self.location, self.pool, &p.object_id))
                .collect();
        }
        if self.object_id.is_empty() {
            return Vec::new();
        }
        vec![BackendTuple::new(&self.location, self.pool, &self.object_id)]
    }
}

// =============================================================================
// Garbage Collection
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum GcStatus {
    #[default]
    Pending,
    Deleting,
}

/// Persisted backend blob awaiting removal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GarbageRecord {
    pub tuple: BackendTuple,
    pub status: GcStatus,
    pub tried_times: u32,
    pub recorded: DateTime<Utc>,
}

impl GarbageRecord {
    pub fn pending(tuple: BackendTuple, tried_times: u32) -> Self {
        Self {
            tuple,
            status: GcStatus::Pending,
            tried_times,
            recorded: Utc::now(),
        }
    }
}
