//! Object read composition
//!
//! Maps a byte range of a logical object onto backend readers. Multipart
//! objects are composed from the parts overlapping the range, in part
//! number order.

use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::domain::{Cluster, ObjectReader, Pool};
use crate::error::{ApiErrorCode, Error, Result};
use crate::meta::Part;

/// Copy buffer size.
const COPY_BUF: usize = 64 << 10;

/// A resolved byte range `[offset, offset + length)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub offset: u64,
    pub length: u64,
}

impl ByteRange {
    /// Validate a request against an object of `size` bytes.
    ///
    /// `None` means the whole object. A range starting past the end is
    /// `InvalidRange`; one running past the end is clipped.
    pub fn resolve(requested: Option<(u64, u64)>, size: u64) -> Result<ByteRange> {
        match requested {
            None => Ok(ByteRange {
                offset: 0,
                length: size,
            }),
            Some((offset, length)) => {
                if offset >= size && !(offset == 0 && size == 0) {
                    return Err(Error::Api(ApiErrorCode::InvalidRange));
                }
                Ok(ByteRange {
                    offset,
                    length: length.min(size - offset),
                })
            }
        }
    }

    pub fn end(&self) -> u64 {
        self.offset + self.length
    }
}

/// Piece of a part needed for a range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartSlice {
    pub object_id: String,
    pub offset: u64,
    pub length: u64,
}

/// Slices of `parts` covering `range`, in part number order.
///
/// Parts are laid out back to back in number order; `Part::offset` is
/// trusted only for ordering.
pub fn plan_parts<'a>(parts: impl IntoIterator<Item = &'a Part>, range: ByteRange) -> Vec<PartSlice> {
    let mut slices = Vec::new();
    let mut part_start = 0u64;
    for part in parts {
        let part_end = part_start + part.size;
        let lo = range.offset.max(part_start);
        let hi = range.end().min(part_end);
        if lo < hi {
            slices.push(PartSlice {
                object_id: part.object_id.clone(),
                offset: lo - part_start,
                length: hi - lo,
            });
        }
        part_start = part_end;
        if part_start >= range.end() {
            break;
        }
    }
    slices
}

/// Drain `reader` into `out`. Returns bytes copied.
pub async fn copy_reader<W>(reader: &mut dyn ObjectReader, out: &mut W) -> Result<u64>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut buf = vec![0u8; COPY_BUF];
    let mut total = 0u64;
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        out.write_all(&buf[..n]).await?;
        total += n as u64;
    }
    Ok(total)
}

/// Drain `reader` into memory.
pub async fn read_to_vec(reader: &mut dyn ObjectReader) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    copy_reader(reader, &mut out).await?;
    Ok(out)
}

/// Stream `range` of an object whose data lives in one blob or in parts.
pub async fn stream_range<W>(
    cluster: &dyn Cluster,
    pool: Pool,
    object_id: &str,
    parts: &std::collections::BTreeMap<u32, Part>,
    range: ByteRange,
    out: &mut W,
) -> Result<u64>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    if range.length == 0 {
        return Ok(0);
    }
    if parts.is_empty() {
        let mut reader = cluster
            .get_reader(pool, object_id, range.offset, range.length)
            .await?;
        return copy_reader(reader.as_mut(), out).await;
    }

    let mut total = 0;
    for slice in plan_parts(parts.values(), range) {
        let mut reader = cluster
            .get_reader(pool, &slice.object_id, slice.offset, slice.length)
            .await?;
        let copied = copy_reader(reader.as_mut(), out).await?;
        if copied != slice.length {
            return Err(Error::Backend {
                cluster: cluster.id().to_string(),
                reason: format!(
                    "part {} short read: {} of {} bytes",
                    slice.object_id, copied, slice.length
                ),
            });
        }
        total += copied;
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use chrono::Utc;

    fn part(number: u32, size: u64) -> Part {
        Part {
            number,
            size,
            object_id: format!("p{}", number),
            offset: 0,
            etag: String::new(),
            last_modified: Utc::now(),
        }
    }

    #[test]
    fn test_resolve_range() {
        assert_eq!(
            ByteRange::resolve(None, 10).unwrap(),
            ByteRange {
                offset: 0,
                length: 10
            }
        );
        assert_eq!(ByteRange::resolve(Some((5, 100)), 10).unwrap().length, 5);
        assert_matches!(
            ByteRange::resolve(Some((10, 1)), 10),
            Err(Error::Api(ApiErrorCode::InvalidRange))
        );
        assert_eq!(ByteRange::resolve(Some((0, 0)), 0).unwrap().length, 0);
    }

    #[test]
    fn test_plan_parts_spans_boundaries() {
        let parts = [part(1, 10), part(2, 10), part(3, 10)];
        let slices = plan_parts(
            parts.iter(),
            ByteRange {
                offset: 5,
                length: 10,
            },
        );
        assert_eq!(
            slices,
            vec![
                PartSlice {
                    object_id: "p1".into(),
                    offset: 5,
                    length: 5
                },
                PartSlice {
                    object_id: "p2".into(),
                    offset: 0,
                    length: 5
                },
            ]
        );
    }

    #[test]
    fn test_plan_parts_whole() {
        let parts = [part(1, 3), part(2, 4)];
        let slices = plan_parts(
            parts.iter(),
            ByteRange {
                offset: 0,
                length: 7,
            },
        );
        assert_eq!(slices.len(), 2);
        assert_eq!(slices.iter().map(|s| s.length).sum::<u64>(), 7);
    }
}
