//! Filtering, ordering and pagination of sidecar metadata.
//!
//! The pure part ([`query`]) works on already-parsed records; [`load_records`]
//! is the storage walk that feeds it on every list request.

use crate::{
    models::metadata::{MetadataFilter, MetadataPage, MetadataRecord},
    services::{
        sidecar,
        storage_service::{BucketStorage, StorageResult},
    },
};
use futures::{StreamExt, stream};
use std::{cmp::Ordering, ops::Range};
use tracing::{debug, warn};

pub const DEFAULT_PAGE_SIZE: usize = 20;
pub const MAX_PAGE_SIZE: usize = 100;

/// A validated 1-based page request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pagination {
    pub page: usize,
    pub page_size: usize,
}

impl Default for Pagination {
    fn default() -> Self {
        Self {
            page: 1,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }
}

impl Pagination {
    /// Parse raw `page` / `page_size` values; anything invalid or
    /// non-positive falls back to the default, oversized pages are clamped.
    pub fn from_params(page: Option<&str>, page_size: Option<&str>) -> Self {
        let positive = |raw: Option<&str>| {
            raw.and_then(|v| v.trim().parse::<usize>().ok())
                .filter(|v| *v > 0)
        };
        Self {
            page: positive(page).unwrap_or(1),
            page_size: positive(page_size)
                .unwrap_or(DEFAULT_PAGE_SIZE)
                .min(MAX_PAGE_SIZE),
        }
    }

    /// Index range of this page within `total` items; empty when out of range.
    pub fn bounds(&self, total: usize) -> Range<usize> {
        let start = self.page.saturating_sub(1).saturating_mul(self.page_size);
        if start >= total {
            return 0..0;
        }
        let end = start.saturating_add(self.page_size).min(total);
        start..end
    }
}

fn is_set(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|v| !v.is_empty())
}

/// Whether `record` satisfies every set field of `filter`.
pub fn matches(record: &MetadataRecord, filter: &MetadataFilter) -> bool {
    let exact = [
        (&filter.solana_version, Some(record.solana_version.as_str())),
        (&filter.status, Some(record.status.as_str())),
        (&filter.uploaded_by, Some(record.uploaded_by.as_str())),
        (&filter.node, record.node.as_deref()),
        (&filter.slot_range, record.slot_range.as_deref()),
    ];
    for (wanted, actual) in exact {
        if let Some(wanted) = is_set(wanted) {
            if actual != Some(wanted) {
                return false;
            }
        }
    }

    if filter.min_slot > 0 && record.slot < filter.min_slot {
        return false;
    }
    if filter.max_slot > 0 && record.slot > filter.max_slot {
        return false;
    }

    // An unknown timestamp counts as the earliest possible instant.
    if let Some(start) = filter.start_time {
        if record.timestamp.is_none_or(|ts| ts < start) {
            return false;
        }
    }
    if let Some(end) = filter.end_time {
        if record.timestamp.is_some_and(|ts| ts > end) {
            return false;
        }
    }

    if let Some(term) = is_set(&filter.search_term) {
        let term = term.to_lowercase();
        let haystacks = [
            record.solana_version.as_str(),
            record.status.as_str(),
            record.uploaded_by.as_str(),
            record.node.as_deref().unwrap_or_default(),
            record.hash.as_str(),
            record.file_name.as_str(),
        ];
        if !haystacks
            .iter()
            .any(|field| field.to_lowercase().contains(&term))
        {
            return false;
        }
    }

    true
}

/// Newest first.
///
/// Records with a timestamp come first, ordered by timestamp descending with
/// slot descending as tie-break; records without one follow, ordered by slot
/// descending.
pub fn compare_newest_first(a: &MetadataRecord, b: &MetadataRecord) -> Ordering {
    match (a.timestamp, b.timestamp) {
        (Some(ta), Some(tb)) => tb.cmp(&ta).then_with(|| b.slot.cmp(&a.slot)),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => b.slot.cmp(&a.slot),
    }
}

/// Filter, sort and paginate `records`.
pub fn query(
    records: Vec<MetadataRecord>,
    filter: &MetadataFilter,
    pagination: Pagination,
) -> MetadataPage {
    let mut matching: Vec<MetadataRecord> = records
        .into_iter()
        .filter(|record| matches(record, filter))
        .collect();
    matching.sort_by(compare_newest_first);

    let total = matching.len();
    let bounds = pagination.bounds(total);
    let items = matching
        .into_iter()
        .skip(bounds.start)
        .take(bounds.len())
        .collect();

    MetadataPage { items, total }
}

/// List the bucket and parse every sidecar into a record.
///
/// Up to `concurrency` sidecars are fetched at once. Sidecars that cannot be
/// fetched or are not JSON objects are skipped; only the listing itself can
/// fail.
pub async fn load_records(
    storage: &dyn BucketStorage,
    concurrency: usize,
) -> StorageResult<Vec<MetadataRecord>> {
    let sidecars: Vec<_> = storage
        .list("")
        .await?
        .into_iter()
        .filter(|object| object.is_sidecar())
        .collect();
    debug!("loading {} sidecar files", sidecars.len());

    let records: Vec<MetadataRecord> = stream::iter(sidecars)
        .map(|object| async move {
            let body = match storage.get(&object.key).await {
                Ok(body) => body,
                Err(err) => {
                    warn!("skipping sidecar {}: {}", object.key, err);
                    return None;
                }
            };
            let size = body.content_length;
            let bytes = match body.bytes().await {
                Ok(bytes) => bytes,
                Err(err) => {
                    warn!("failed to read sidecar {}: {}", object.key, err);
                    return None;
                }
            };
            let record = sidecar::parse(bytes).into_record(&object.key, size);
            if record.is_none() {
                debug!("sidecar {} is not a JSON object", object.key);
            }
            record
        })
        .buffered(concurrency.max(1))
        .filter_map(|record| async move { record })
        .collect()
        .await;

    Ok(records)
}
