//! Records derived from snapshot sidecar files, the filter applied to them,
//! and the facet values offered to the client.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Metadata describing one snapshot archive, derived from its sidecar file.
///
/// Empty strings mean "absent" for the free-form descriptive fields; `slot`
/// is 0 when unknown. When `slot > 0`, `slot_range` always equals
/// `sidecar::slot_range(slot)`.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct MetadataRecord {
    /// Sidecar key this record was read from.
    pub file_name: String,

    /// Size of the sidecar in bytes.
    pub file_size: u64,

    pub solana_version: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub solana_feature_set: Option<u64>,

    pub status: String,

    pub uploaded_by: String,

    /// Slot the snapshot was taken at, 0 when unknown.
    pub slot: u64,

    /// Node identity decoded from the sidecar file name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node: Option<String>,

    /// Human label of the million-slot window containing `slot`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slot_range: Option<String>,

    pub hash: String,

    pub timestamp: Option<DateTime<Utc>>,
}

/// Structured filter over metadata records.
///
/// Every unset field is a wildcard; set fields are combined conjunctively.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MetadataFilter {
    pub solana_version: Option<String>,
    pub status: Option<String>,
    pub uploaded_by: Option<String>,
    pub node: Option<String>,
    pub slot_range: Option<String>,
    /// Inclusive lower slot bound, ignored when 0.
    pub min_slot: u64,
    /// Inclusive upper slot bound, ignored when 0.
    pub max_slot: u64,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    /// Case-insensitive substring over the descriptive fields and file name.
    pub search_term: Option<String>,
}

impl MetadataFilter {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// One page of filtered metadata plus the total number of matches.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct MetadataPage {
    pub items: Vec<MetadataRecord>,
    pub total: usize,
}

/// Distinct values observed for each filterable facet, in display order.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FilterOptions {
    pub solana_versions: Vec<String>,
    pub statuses: Vec<String>,
    pub uploaded_by: Vec<String>,
    pub nodes: Vec<String>,
    pub slot_ranges: Vec<String>,
}

impl FilterOptions {
    /// True when no descriptive facet has been indexed yet.
    ///
    /// Nodes and slot ranges come from file names alone, so they say nothing
    /// about whether sidecar contents were ever read.
    pub fn lacks_descriptive_facets(&self) -> bool {
        self.solana_versions.is_empty() && self.statuses.is_empty()
    }

    pub fn is_empty(&self) -> bool {
        self.lacks_descriptive_facets()
            && self.uploaded_by.is_empty()
            && self.nodes.is_empty()
            && self.slot_ranges.is_empty()
    }
}
