//! Stripe layout and blob readers.
//!
//! A striped blob is spread over fixed-size sub-objects. Logical bytes are
//! cut into stripe units which are dealt round-robin over `count` objects;
//! once every object in a set holds `object_size` bytes the next set begins.
//!
//! ```text
//! unit:    0    1    2    3    4    5   ...
//! object:  0    1    0    1    0    1   ...   (count = 2)
//! ```

use std::collections::BTreeSet;
use std::io::SeekFrom;
use std::sync::Arc;

use async_trait::async_trait;

use crate::domain::{ObjectReader, RawObjectStore};
use crate::error::{ApiErrorCode, Error, Result};

/// Default stripe unit.
pub const STRIPE_UNIT: u64 = 512 << 10;

/// Default sub-object size.
pub const STRIPE_OBJECT_SIZE: u64 = 8 << 20;

/// Default objects per set.
pub const STRIPE_COUNT: u64 = 2;

// =============================================================================
// Stripe Layout
// =============================================================================

/// Geometry of a striped blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StripeLayout {
    pub unit: u64,
    pub count: u64,
    pub object_size: u64,
}

impl Default for StripeLayout {
    fn default() -> Self {
        Self {
            unit: STRIPE_UNIT,
            count: STRIPE_COUNT,
            object_size: STRIPE_OBJECT_SIZE,
        }
    }
}

/// Where a logical byte lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Placement {
    pub object_no: u64,
    pub object_offset: u64,
    /// Bytes left in this stripe unit from the placement.
    pub unit_remaining: u64,
}

impl StripeLayout {
    pub fn new(unit: u64, count: u64, object_size: u64) -> Result<Self> {
        if unit == 0 || count == 0 || object_size < unit || object_size % unit != 0 {
            return Err(Error::Internal(format!(
                "invalid stripe layout unit={} count={} object_size={}",
                unit, count, object_size
            )));
        }
        Ok(Self {
            unit,
            count,
            object_size,
        })
    }

    /// Layout encoded in a backend object id.
    ///
    /// Striped ids carry `instance:counter:unit:count:size`. Plain
    /// `instance:counter` ids carry none and the owning cluster decides.
    pub fn encoded_in(object_id: &str) -> Result<Option<Self>> {
        let parts: Vec<&str> = object_id.split(':').collect();
        if parts.len() != 5 {
            return Ok(None);
        }
        let parse = |s: &str| {
            s.parse::<u64>()
                .map_err(|_| Error::Internal(format!("malformed layout in object id {}", object_id)))
        };
        Self::new(parse(parts[2])?, parse(parts[3])?, parse(parts[4])?).map(Some)
    }

    /// Suffix appended to ids that carry this layout.
    pub fn id_suffix(&self) -> String {
        format!("{}:{}:{}", self.unit, self.count, self.object_size)
    }

    /// Map a logical offset onto its sub-object.
    pub fn locate(&self, offset: u64) -> Placement {
        let units_per_object = self.object_size / self.unit;
        let block_no = offset / self.unit;
        let stripe_no = block_no / self.count;
        let stripe_pos = block_no % self.count;
        let object_set_no = stripe_no / units_per_object;
        let object_no = object_set_no * self.count + stripe_pos;
        let within_unit = offset % self.unit;
        Placement {
            object_no,
            object_offset: (stripe_no % units_per_object) * self.unit + within_unit,
            unit_remaining: self.unit - within_unit,
        }
    }

    /// Every sub-object a blob of `size` logical bytes touches.
    pub fn objects_for_size(&self, size: u64) -> BTreeSet<u64> {
        let blocks = size.div_ceil(self.unit);
        (0..blocks)
            .map(|block| self.locate(block * self.unit).object_no)
            .collect()
    }

    /// Record name of sub-object `object_no`.
    pub fn sub_object_name(object_id: &str, object_no: u64) -> String {
        format!("{}.{:016x}", object_id, object_no)
    }
}

// =============================================================================
// Readers
// =============================================================================

/// How a reader maps offsets onto records.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Addressing {
    /// The blob is one record named by the object id.
    Whole,
    /// The blob is striped over sub-objects.
    Striped(StripeLayout),
}

/// Reader over `[start, start + length)` of a stored blob. A zero length
/// reads to the end of the blob.
pub(crate) struct BlobReader {
    store: Arc<dyn RawObjectStore>,
    pool: String,
    object_id: String,
    addressing: Addressing,
    /// Logical blob size; reads stop here.
    blob_size: u64,
    start: u64,
    length: u64,
    pos: u64,
}

impl BlobReader {
    pub(crate) fn new(
        store: Arc<dyn RawObjectStore>,
        pool: &str,
        object_id: &str,
        addressing: Addressing,
        blob_size: u64,
        start: u64,
        length: u64,
    ) -> Self {
        Self {
            store,
            pool: pool.to_string(),
            object_id: object_id.to_string(),
            addressing,
            blob_size,
            start,
            length: if length == 0 { u64::MAX } else { length },
            pos: 0,
        }
    }

    fn remaining(&self) -> u64 {
        let end = self.start.saturating_add(self.length).min(self.blob_size);
        end.saturating_sub(self.start.saturating_add(self.pos))
    }
}

#[async_trait]
impl ObjectReader for BlobReader {
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let remaining = self.remaining();
        if remaining == 0 || buf.is_empty() {
            return Ok(0);
        }
        let absolute = self.start + self.pos;
        let mut want = (buf.len() as u64).min(remaining);

        let (record, record_offset) = match self.addressing {
            Addressing::Whole => (self.object_id.clone(), absolute),
            Addressing::Striped(layout) => {
                let placement = layout.locate(absolute);
                want = want.min(placement.unit_remaining);
                (
                    StripeLayout::sub_object_name(&self.object_id, placement.object_no),
                    placement.object_offset,
                )
            }
        };

        let data = self
            .store
            .read_at(&self.pool, &record, record_offset, want as usize)
            .await;
        let data = match data {
            Ok(data) => data,
            // Holes in a sparse striped blob read as zeros.
            Err(Error::ObjectNotFound(_)) if matches!(self.addressing, Addressing::Striped(_)) => {
                bytes::Bytes::new()
            }
            Err(e) => return Err(e),
        };

        let want = want as usize;
        let got = data.len().min(want);
        buf[..got].copy_from_slice(&data[..got]);
        if got < want {
            buf[got..want].fill(0);
        }
        self.pos += want as u64;
        Ok(want)
    }

    fn seek(&mut self, pos: SeekFrom) -> Result<u64> {
        let next = match pos {
            SeekFrom::Start(n) => Some(n),
            SeekFrom::Current(delta) => {
                if delta >= 0 {
                    self.pos.checked_add(delta as u64)
                } else {
                    self.pos.checked_sub(delta.unsigned_abs())
                }
            }
            SeekFrom::End(_) => return Err(Error::Api(ApiErrorCode::NotImplemented)),
        };
        self.pos = next.ok_or(Error::Api(ApiErrorCode::InvalidRange))?;
        Ok(self.pos)
    }
}
