//! Sidecar naming convention and permissive metadata decoding.
//!
//! Every snapshot archive `snapshot-<slot>-<node>.tar.gz` is accompanied by a
//! `snapshot-<slot>-<node>.json` sidecar. The file name is the only reliable
//! source of slot and node; the JSON body is written by several uploaders and
//! does not have a stable shape, so it is decoded in two tiers:
//!
//! 1. a strict struct with the three descriptive string fields;
//! 2. a type-checked lookup over a generic JSON object, where any missing or
//!    wrong-typed field is simply absent.
//!
//! A `null` body decodes as an empty record. Any other body that is not a
//! JSON object is kept verbatim so callers can still show it.

use crate::models::metadata::MetadataRecord;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::{cmp::Ordering, sync::LazyLock};

/// Suffix of snapshot archives.
pub const ARCHIVE_SUFFIX: &str = ".tar.gz";

/// Suffix of metadata files; only some of them are sidecars.
pub const METADATA_SUFFIX: &str = ".json";

/// Width of one slot range bucket.
pub const SLOT_RANGE_WIDTH: u64 = 1_000_000;

/// Label of the first slot range bucket.
pub const FIRST_SLOT_RANGE: &str = "< 1M";

/// Facet values uploaders use when they do not know the real value.
const PLACEHOLDER_VALUE: &str = "unknown";

static SIDECAR_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"snapshot-(\d+)-([A-Za-z0-9]+)\.json$").expect("sidecar pattern compiles")
});

static RANGE_PREFIX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\d+)M").expect("range prefix pattern compiles"));

/// Classification of a bucket key by naming convention.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Classification {
    pub is_archive: bool,
    /// Any `.json` object; [`is_sidecar`] narrows it to snapshot sidecars.
    pub is_metadata: bool,
}

/// Classify a key as archive and/or metadata file.
pub fn classify(key: &str) -> Classification {
    Classification {
        is_archive: key.ends_with(ARCHIVE_SUFFIX),
        is_metadata: key.ends_with(METADATA_SUFFIX),
    }
}

/// Whether `key` follows the `snapshot-<digits>-<node>.json` convention.
pub fn is_sidecar(key: &str) -> bool {
    SIDECAR_PATTERN.is_match(key)
}

/// Decode `(slot, node)` from a sidecar key.
///
/// Returns `(0, "")` when the key does not follow the convention or the slot
/// does not fit in a `u64`.
pub fn extract_slot_and_node(key: &str) -> (u64, String) {
    let Some(caps) = SIDECAR_PATTERN.captures(key) else {
        return (0, String::new());
    };
    match caps[1].parse::<u64>() {
        Ok(slot) => (slot, caps[2].to_string()),
        Err(_) => (0, String::new()),
    }
}

/// Label of the million-slot window containing `slot`, e.g. `"2M-3M"`.
pub fn slot_range(slot: u64) -> String {
    let millions = slot / SLOT_RANGE_WIDTH;
    if millions == 0 {
        return FIRST_SLOT_RANGE.to_string();
    }
    format!("{}M-{}M", millions, millions + 1)
}

#[derive(Debug, PartialEq, Eq, PartialOrd, Ord)]
enum VersionPart<'a> {
    Numeric(u64),
    Text(&'a str),
}

fn version_key(version: &str) -> Vec<VersionPart<'_>> {
    version
        .split('.')
        .take(3)
        .map(|part| match part.parse::<u64>() {
            Ok(n) => VersionPart::Numeric(n),
            Err(_) => VersionPart::Text(part),
        })
        .collect()
}

/// Order versions by numeric major.minor.patch.
///
/// Non-numeric components sort after numeric ones and lexicographically among
/// themselves; remaining ties fall back to comparing the full strings, which
/// keeps this a total order.
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    version_key(a)
        .cmp(&version_key(b))
        .then_with(|| a.cmp(b))
}

fn slot_range_key(label: &str) -> (bool, u64) {
    let start = RANGE_PREFIX
        .captures(label)
        .and_then(|caps| caps[1].parse::<u64>().ok())
        .unwrap_or(0);
    (label != FIRST_SLOT_RANGE, start)
}

/// Order slot range labels: `"< 1M"` first, then by leading number.
pub fn compare_slot_ranges(a: &str, b: &str) -> Ordering {
    slot_range_key(a)
        .cmp(&slot_range_key(b))
        .then_with(|| a.cmp(b))
}

/// Whether a descriptive value should appear as a facet.
pub fn is_facet_value(value: &str) -> bool {
    !value.is_empty() && value != PLACEHOLDER_VALUE
}

/// Fields recovered from a sidecar body.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SidecarFields {
    pub solana_version: Option<String>,
    pub status: Option<String>,
    pub uploaded_by: Option<String>,
    pub hash: Option<String>,
    pub slot: Option<u64>,
    pub timestamp: Option<DateTime<Utc>>,
    pub solana_feature_set: Option<u64>,
}

/// Outcome of decoding a sidecar body.
#[derive(Debug, Clone, PartialEq)]
pub enum ParsedSidecar {
    /// The strict shape decoded.
    FullyTyped(SidecarFields),
    /// The strict shape failed, fields were recovered from a generic object.
    PartiallyRecovered(SidecarFields),
    /// Neither a JSON object nor `null`; the raw body is kept for passthrough.
    Opaque(Bytes),
}

#[derive(Debug, Deserialize)]
struct StrictSidecar {
    #[serde(default)]
    solana_version: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    uploaded_by: Option<String>,
}

/// Decode a sidecar body, never failing.
pub fn parse(body: Bytes) -> ParsedSidecar {
    let object = match serde_json::from_slice::<Value>(&body) {
        Ok(Value::Object(object)) => object,
        // An explicit `null` is an empty sidecar rather than foreign content.
        Ok(Value::Null) => return ParsedSidecar::FullyTyped(SidecarFields::default()),
        _ => return ParsedSidecar::Opaque(body),
    };

    match StrictSidecar::deserialize(&Value::Object(object.clone())) {
        Ok(strict) => ParsedSidecar::FullyTyped(SidecarFields {
            solana_version: strict.solana_version,
            status: strict.status,
            uploaded_by: strict.uploaded_by,
            ..Default::default()
        }),
        Err(err) => {
            tracing::debug!("strict sidecar decode failed, recovering fields: {}", err);
            ParsedSidecar::PartiallyRecovered(recover_fields(&object))
        }
    }
}

fn recover_fields(object: &Map<String, Value>) -> SidecarFields {
    let text = |name: &str| object.get(name).and_then(Value::as_str).map(str::to_string);
    SidecarFields {
        solana_version: text("solana_version"),
        status: text("status"),
        uploaded_by: text("uploaded_by"),
        hash: text("hash"),
        slot: object.get("slot").and_then(non_negative_integer),
        timestamp: object
            .get("timestamp")
            .and_then(Value::as_f64)
            .filter(|secs| secs.is_finite())
            .and_then(|secs| DateTime::from_timestamp(secs as i64, 0)),
        solana_feature_set: object.get("solana_feature_set").and_then(non_negative_integer),
    }
}

fn non_negative_integer(value: &Value) -> Option<u64> {
    value.as_u64().or_else(|| {
        value
            .as_f64()
            .filter(|n| n.is_finite() && *n >= 0.0)
            .map(|n| n as u64)
    })
}

impl ParsedSidecar {
    /// Short name of the decoding outcome, used in logs and debug output.
    pub fn kind(&self) -> &'static str {
        match self {
            ParsedSidecar::FullyTyped(_) => "typed",
            ParsedSidecar::PartiallyRecovered(_) => "recovered",
            ParsedSidecar::Opaque(_) => "opaque",
        }
    }

    pub fn fields(&self) -> Option<&SidecarFields> {
        match self {
            ParsedSidecar::FullyTyped(fields) | ParsedSidecar::PartiallyRecovered(fields) => {
                Some(fields)
            }
            ParsedSidecar::Opaque(_) => None,
        }
    }

    /// Build the metadata record for the sidecar stored under `key`.
    ///
    /// Returns `None` for opaque bodies. Slot and node come from the file
    /// name; a recovered body may supply the slot when it is non-zero.
    pub fn into_record(self, key: &str, file_size: u64) -> Option<MetadataRecord> {
        let recovered = matches!(self, ParsedSidecar::PartiallyRecovered(_));
        let fields = match self {
            ParsedSidecar::FullyTyped(fields) | ParsedSidecar::PartiallyRecovered(fields) => fields,
            ParsedSidecar::Opaque(_) => return None,
        };

        let named = is_sidecar(key);
        let (name_slot, name_node) = extract_slot_and_node(key);
        let slot = match fields.slot {
            Some(slot) if recovered && slot > 0 => slot,
            _ => name_slot,
        };

        Some(MetadataRecord {
            file_name: key.to_string(),
            file_size,
            solana_version: fields.solana_version.unwrap_or_default(),
            solana_feature_set: fields.solana_feature_set,
            status: fields.status.unwrap_or_default(),
            uploaded_by: fields.uploaded_by.unwrap_or_default(),
            slot,
            node: (!name_node.is_empty()).then_some(name_node),
            slot_range: (named || slot > 0).then(|| slot_range(slot)),
            hash: fields.hash.unwrap_or_default(),
            timestamp: fields.timestamp,
        })
    }
}

/// Guess a content type for a body that could not be decoded.
pub fn sniff_content_type(body: &[u8]) -> &'static str {
    const SIGNATURES: [(&[u8], &str); 5] = [
        (b"%PDF-", "application/pdf"),
        (b"\x1f\x8b\x08", "application/x-gzip"),
        (b"PK\x03\x04", "application/zip"),
        (b"\x89PNG\r\n\x1a\n", "image/png"),
        (b"GIF8", "image/gif"),
    ];
    if let Some((_, mime)) = SIGNATURES.iter().find(|(sig, _)| body.starts_with(sig)) {
        return mime;
    }

    let text = match std::str::from_utf8(body) {
        Ok(text) => text,
        Err(_) => return "application/octet-stream",
    };
    let head = text.trim_start().to_ascii_lowercase();
    if head.starts_with("<!doctype html") || head.starts_with("<html") {
        return "text/html; charset=utf-8";
    }
    if head.starts_with("<?xml") {
        return "text/xml; charset=utf-8";
    }
    if text
        .chars()
        .any(|c| c.is_control() && !matches!(c, '\n' | '\r' | '\t' | '\x0c'))
    {
        return "application/octet-stream";
    }
    "text/plain; charset=utf-8"
}

#[cfg(test)]
mod tests {
    use super::*;

    const NODE: &str = "AutUwEtGwA2wXfH4VqvpoY87d6vQzLkG1V6EugKx8t96";

    #[test]
    fn recognises_sidecar_names() {
        let cases = [
            (format!("snapshot-123456789-{NODE}.json"), true),
            (format!("snapshot-9876543210-{NODE}.json"), true),
            (format!("backups/snapshot-1-{NODE}.json"), true),
            (format!("snapshot-123456789-{NODE}.tar.gz"), false),
            (format!("snapshot_123456789_{NODE}.json"), false),
            (format!("snapshot-{NODE}.json"), false),
            ("snapshot-123456789.json".to_string(), false),
            ("metadata.json".to_string(), false),
        ];
        for (key, expected) in cases {
            assert_eq!(is_sidecar(&key), expected, "{key}");
        }
    }

    #[test]
    fn extracts_slot_and_node() {
        assert_eq!(
            extract_slot_and_node(&format!("snapshot-123456789-{NODE}.json")),
            (123456789, NODE.to_string())
        );
        assert_eq!(
            extract_slot_and_node(&format!("snapshot-9876543210-{NODE}.json")),
            (9876543210, NODE.to_string())
        );
        assert_eq!(
            extract_slot_and_node(&format!("snapshot_123456789_{NODE}.json")),
            (0, String::new())
        );
        assert_eq!(
            extract_slot_and_node(&format!("snapshot-123456789-{NODE}.tar.gz")),
            (0, String::new())
        );
    }

    #[test]
    fn slot_overflow_is_unknown() {
        let key = "snapshot-99999999999999999999999-Node.json";
        assert!(is_sidecar(key));
        assert_eq!(extract_slot_and_node(key), (0, String::new()));
    }

    #[test]
    fn classifies_archives() {
        let class = classify(&format!("snapshot-1-{NODE}.tar.gz"));
        assert!(class.is_archive);
        assert!(!class.is_metadata);
        let class = classify(&format!("snapshot-1-{NODE}.json"));
        assert!(!class.is_archive);
        assert!(class.is_metadata);
    }

    #[test]
    fn any_json_key_is_metadata() {
        for key in ["metadata.json", "nested/readme.json", "snapshot_1_Node.json"] {
            assert!(classify(key).is_metadata, "{key}");
            assert!(!is_sidecar(key), "{key}");
        }
        assert!(!classify("notes.txt").is_metadata);
    }

    #[test]
    fn buckets_slots_by_million() {
        assert_eq!(slot_range(0), "< 1M");
        assert_eq!(slot_range(999_999), "< 1M");
        assert_eq!(slot_range(1_000_000), "1M-2M");
        assert_eq!(slot_range(2_500_000), "2M-3M");
        assert_eq!(slot_range(312_000_001), "312M-313M");
    }

    #[test]
    fn versions_sort_numerically() {
        let mut versions = vec!["1.10.0", "1.9.0", "1.2.0"];
        versions.sort_by(|a, b| compare_versions(a, b));
        assert_eq!(versions, ["1.2.0", "1.9.0", "1.10.0"]);
    }

    #[test]
    fn versions_with_text_components_still_sort() {
        let mut versions = vec!["2.0.0", "1.18.x", "1.18.2", "beta", "1.18.10"];
        versions.sort_by(|a, b| compare_versions(a, b));
        assert_eq!(versions, ["1.18.2", "1.18.10", "1.18.x", "2.0.0", "beta"]);
    }

    #[test]
    fn slot_ranges_sort_sentinel_first() {
        let mut ranges = vec!["10M-11M", "2M-3M", "< 1M", "1M-2M"];
        ranges.sort_by(|a, b| compare_slot_ranges(a, b));
        assert_eq!(ranges, ["< 1M", "1M-2M", "2M-3M", "10M-11M"]);
    }

    #[test]
    fn strict_shape_is_fully_typed() {
        let body = br#"{"solana_version":"1.18.4","status":"complete","uploaded_by":"ops","extra":[1,2]}"#;
        let parsed = parse(Bytes::from_static(body));
        assert_eq!(parsed.kind(), "typed");
        let fields = parsed.fields().unwrap();
        assert_eq!(fields.solana_version.as_deref(), Some("1.18.4"));
        assert_eq!(fields.status.as_deref(), Some("complete"));
        assert_eq!(fields.uploaded_by.as_deref(), Some("ops"));
        assert_eq!(fields.slot, None);
    }

    #[test]
    fn wrong_typed_field_falls_back_to_recovery() {
        let body = br#"{"solana_version":"1.17.0","status":7,"uploaded_by":"ci","slot":4200000,"hash":"abc","timestamp":1700000000,"solana_feature_set":123}"#;
        let parsed = parse(Bytes::from_static(body));
        assert_eq!(parsed.kind(), "recovered");
        let fields = parsed.fields().unwrap();
        assert_eq!(fields.solana_version.as_deref(), Some("1.17.0"));
        assert_eq!(fields.status, None);
        assert_eq!(fields.uploaded_by.as_deref(), Some("ci"));
        assert_eq!(fields.slot, Some(4_200_000));
        assert_eq!(fields.hash.as_deref(), Some("abc"));
        assert_eq!(
            fields.timestamp,
            DateTime::from_timestamp(1_700_000_000, 0)
        );
        assert_eq!(fields.solana_feature_set, Some(123));
    }

    #[test]
    fn recovery_ignores_wrong_typed_numbers() {
        let body = br#"{"status":1,"slot":"12","timestamp":"yesterday"}"#;
        let fields = parse(Bytes::from_static(body)).fields().cloned().unwrap();
        assert_eq!(fields.slot, None);
        assert_eq!(fields.timestamp, None);
        assert_eq!(fields.status, None);
    }

    #[test]
    fn non_objects_are_opaque() {
        for body in [&b"not json"[..], b"[1,2,3]", b"\"text\"", b"42"] {
            let parsed = parse(Bytes::copy_from_slice(body));
            assert_eq!(parsed, ParsedSidecar::Opaque(Bytes::copy_from_slice(body)));
        }
    }

    #[test]
    fn null_body_is_an_empty_typed_record() {
        let parsed = parse(Bytes::from_static(b" null "));
        assert_eq!(parsed, ParsedSidecar::FullyTyped(SidecarFields::default()));

        let key = format!("snapshot-2500000-{NODE}.json");
        let record = parsed.into_record(&key, 4).unwrap();
        assert_eq!(record.slot, 2_500_000);
        assert_eq!(record.status, "");
        assert_eq!(record.slot_range.as_deref(), Some("2M-3M"));
    }

    #[test]
    fn typed_record_takes_slot_from_file_name() {
        let key = format!("snapshot-2500000-{NODE}.json");
        let record = parse(Bytes::from_static(br#"{"status":"ok"}"#))
            .into_record(&key, 17)
            .unwrap();
        assert_eq!(record.file_name, key);
        assert_eq!(record.file_size, 17);
        assert_eq!(record.slot, 2_500_000);
        assert_eq!(record.node.as_deref(), Some(NODE));
        assert_eq!(record.slot_range.as_deref(), Some("2M-3M"));
        assert_eq!(record.status, "ok");
        assert_eq!(record.timestamp, None);
    }

    #[test]
    fn recovered_record_prefers_document_slot() {
        let key = format!("snapshot-2500000-{NODE}.json");
        let record = parse(Bytes::from_static(br#"{"status":false,"slot":7000001}"#))
            .into_record(&key, 1)
            .unwrap();
        assert_eq!(record.slot, 7_000_001);
        assert_eq!(record.slot_range.as_deref(), Some("7M-8M"));

        let record = parse(Bytes::from_static(br#"{"status":false,"slot":0}"#))
            .into_record(&key, 1)
            .unwrap();
        assert_eq!(record.slot, 2_500_000);
    }

    #[test]
    fn record_without_convention_has_no_range_for_unknown_slot() {
        let record = parse(Bytes::from_static(b"{}"))
            .into_record("notes.json", 2)
            .unwrap();
        assert_eq!(record.slot, 0);
        assert_eq!(record.node, None);
        assert_eq!(record.slot_range, None);
    }

    #[test]
    fn placeholder_values_are_not_facets() {
        assert!(is_facet_value("1.18.0"));
        assert!(!is_facet_value(""));
        assert!(!is_facet_value("unknown"));
    }

    #[test]
    fn sniffs_common_bodies() {
        assert_eq!(sniff_content_type(b"{ broken json"), "text/plain; charset=utf-8");
        assert_eq!(sniff_content_type(b"<html><body>"), "text/html; charset=utf-8");
        assert_eq!(sniff_content_type(b"\x1f\x8b\x08\x00"), "application/x-gzip");
        assert_eq!(sniff_content_type(&[0xff, 0xfe, 0x00]), "application/octet-stream");
    }
}
