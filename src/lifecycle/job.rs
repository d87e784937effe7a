//! Scanner to worker job envelope
//!
//! Encoded as a msgpack map with keys `Object` or `Multipart`, `Action`
//! and an optional `StorageClass`.

use serde::{Deserialize, Serialize};

use super::evaluate::Action;
use crate::error::{Error, Result};
use crate::meta::{Multipart, Object, StorageClass};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct LifecycleJob {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object: Option<Object>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub multipart: Option<Multipart>,
    pub action: Action,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_class: Option<StorageClass>,
}

impl LifecycleJob {
    pub fn for_object(object: Object, action: Action, storage_class: Option<StorageClass>) -> Self {
        Self {
            object: Some(object),
            multipart: None,
            action,
            storage_class,
        }
    }

    pub fn for_multipart(upload: Multipart) -> Self {
        Self {
            object: None,
            multipart: Some(upload),
            action: Action::AbortMultipartUpload,
            storage_class: None,
        }
    }

    /// Partition key: the object name, so jobs for one key stay ordered.
    pub fn key(&self) -> &str {
        if let Some(object) = &self.object {
            return &object.name;
        }
        self.multipart
            .as_ref()
            .map(|m| m.object.as_str())
            .unwrap_or("")
    }

    pub fn bucket(&self) -> &str {
        if let Some(object) = &self.object {
            return &object.bucket;
        }
        self.multipart
            .as_ref()
            .map(|m| m.bucket.as_str())
            .unwrap_or("")
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        rmp_serde::to_vec_named(self).map_err(|e| Error::Codec(e.to_string()))
    }

    pub fn decode(raw: &[u8]) -> Result<Self> {
        rmp_serde::from_slice(raw).map_err(|e| Error::Codec(e.to_string()))
    }
}
