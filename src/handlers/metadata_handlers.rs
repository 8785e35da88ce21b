//! HTTP handlers for sidecar metadata: facets, filtered listing, single
//! records and the debug endpoints.

use crate::{
    errors::AppError,
    handlers::object_handlers::{reject_archive, set_object_headers},
    models::metadata::{FilterOptions, MetadataFilter, MetadataPage, MetadataRecord},
    services::{
        query::{self, Pagination},
        sidecar::{self, ParsedSidecar},
    },
    state::AppState,
};
use axum::{
    Json,
    body::Body,
    extract::{Path, Query, State},
    response::{IntoResponse, Response},
};
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

/// Query parameters accepted by `GET /api/metadata`.
///
/// Everything arrives as text so that one bad value is logged and ignored
/// instead of rejecting the whole request.
#[derive(Debug, Default)]
pub struct MetadataQuery {
    pub solana_version: Option<String>,
    pub status: Option<String>,
    pub uploaded_by: Option<String>,
    pub node: Option<String>,
    pub slot_range: Option<String>,
    pub min_slot: Option<String>,
    pub max_slot: Option<String>,
    pub start_time: Option<String>,
    pub end_time: Option<String>,
    pub search_term: Option<String>,
    pub page: Option<String>,
    pub page_size: Option<String>,
}

impl MetadataQuery {
    /// Collect the known parameters; a repeated parameter keeps its first value.
    pub fn from_pairs(pairs: Vec<(String, String)>) -> Self {
        let mut query = Self::default();
        for (name, value) in pairs {
            let slot = match name.as_str() {
                "solanaVersion" => &mut query.solana_version,
                "status" => &mut query.status,
                "uploadedBy" => &mut query.uploaded_by,
                "node" => &mut query.node,
                "slotRange" => &mut query.slot_range,
                "minSlot" => &mut query.min_slot,
                "maxSlot" => &mut query.max_slot,
                "startTime" => &mut query.start_time,
                "endTime" => &mut query.end_time,
                "searchTerm" => &mut query.search_term,
                "page" => &mut query.page,
                "page_size" => &mut query.page_size,
                _ => continue,
            };
            slot.get_or_insert(value);
        }
        query
    }

    pub fn filter(&self) -> MetadataFilter {
        let text = |value: &Option<String>| value.clone().filter(|v| !v.is_empty());
        let filter = MetadataFilter {
            solana_version: text(&self.solana_version),
            status: text(&self.status),
            uploaded_by: text(&self.uploaded_by),
            node: text(&self.node),
            slot_range: text(&self.slot_range),
            min_slot: parse_slot("minSlot", self.min_slot.as_deref()),
            max_slot: parse_slot("maxSlot", self.max_slot.as_deref()),
            start_time: parse_day("startTime", self.start_time.as_deref())
                .map(|day| day.and_time(NaiveTime::MIN).and_utc()),
            end_time: parse_day("endTime", self.end_time.as_deref()).and_then(end_of_day),
            search_term: text(&self.search_term),
        };
        debug!("parsed filter: {:?}", filter);
        filter
    }

    pub fn pagination(&self) -> Pagination {
        Pagination::from_params(self.page.as_deref(), self.page_size.as_deref())
    }
}

fn parse_slot(name: &str, value: Option<&str>) -> u64 {
    match value.filter(|v| !v.is_empty()) {
        Some(raw) => raw.parse().unwrap_or_else(|err| {
            warn!("ignoring {} `{}`: {}", name, raw, err);
            0
        }),
        None => 0,
    }
}

fn parse_day(name: &str, value: Option<&str>) -> Option<NaiveDate> {
    let raw = value.filter(|v| !v.is_empty())?;
    match NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        Ok(day) => Some(day),
        Err(err) => {
            warn!("ignoring {} `{}`: {}", name, raw, err);
            None
        }
    }
}

/// Last representable instant of `day`, so the whole day is included.
fn end_of_day(day: NaiveDate) -> Option<DateTime<Utc>> {
    let last = NaiveTime::from_hms_nano_opt(23, 59, 59, 999_999_999)?;
    Some(day.and_time(last).and_utc())
}

/// GET `/api/metadata/options`: facet values for the filter dropdowns.
pub async fn get_metadata_options(State(state): State<AppState>) -> Json<FilterOptions> {
    Json(state.indexer.facets().await)
}

/// GET `/api/metadata`: filtered, sorted and paginated sidecar records.
pub async fn list_metadata(
    State(state): State<AppState>,
    Query(pairs): Query<Vec<(String, String)>>,
) -> Result<Json<MetadataPage>, AppError> {
    let params = MetadataQuery::from_pairs(pairs);
    let filter = params.filter();
    let pagination = params.pagination();

    let records = query::load_records(state.storage.as_ref(), state.query_concurrency).await?;
    let page = query::query(records, &filter, pagination);
    debug!(
        "metadata page {} ({} per page): {} of {} matching records",
        pagination.page,
        pagination.page_size,
        page.items.len(),
        page.total
    );
    Ok(Json(page))
}

/// GET `/api/metadata/{*key}`: one sidecar as a record.
///
/// JSON keys are decoded into a [`MetadataRecord`]; anything that does not
/// decode to a JSON object is passed through with a sniffed content type.
pub async fn get_metadata(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<Response, AppError> {
    reject_archive(&key)?;

    let object = state.storage.get(&key).await.map_err(|err| {
        warn!("failed to fetch metadata {}: {}", key, err);
        AppError::from(err)
    })?;
    let size = object.content_length;
    let body = object.bytes().await?;

    if key.ends_with(".json") {
        let parsed = sidecar::parse(body.clone());
        debug!("metadata {} decoded as {}", key, parsed.kind());
        if let Some(record) = parsed.into_record(&key, size) {
            return Ok(Json::<MetadataRecord>(record).into_response());
        }
    }

    let content_type = sidecar::sniff_content_type(&body);
    let length = body.len() as u64;
    let mut response = Response::new(Body::from(body));
    set_object_headers(response.headers_mut(), Some(content_type), length);
    Ok(response)
}

#[derive(Debug, Serialize)]
pub struct MessageResponse {
    pub message: String,
}

/// GET `/api/debug/reindex`: drop cached facets and rebuild them.
pub async fn debug_reindex(State(state): State<AppState>) -> Json<MessageResponse> {
    state.indexer.request_reindex().await;
    Json(MessageResponse {
        message: "Reindexing started".into(),
    })
}

#[derive(Debug, Serialize)]
pub struct ExamineResponse {
    pub message: String,
    pub file: String,
    pub kind: &'static str,
    pub record: Option<MetadataRecord>,
}

/// GET `/api/debug/examine-file`: show how the first sidecar decodes.
pub async fn debug_examine_file(
    State(state): State<AppState>,
) -> Result<Json<ExamineResponse>, AppError> {
    let objects = state.storage.list("").await?;
    let Some(first) = objects.into_iter().find(|object| object.is_sidecar()) else {
        return Err(AppError::not_found("No metadata files found"));
    };

    let object = state.storage.get(&first.key).await?;
    let size = object.content_length;
    let body = object.bytes().await?;
    info!(
        "content of metadata file {}: {}",
        first.key,
        String::from_utf8_lossy(&body)
    );

    let parsed = sidecar::parse(body);
    if let ParsedSidecar::Opaque(_) = parsed {
        warn!("metadata file {} is not a JSON object", first.key);
    } else {
        info!("metadata file {} parsed as {:?}", first.key, parsed.fields());
    }

    Ok(Json(ExamineResponse {
        message: "File examined, check logs".into(),
        kind: parsed.kind(),
        record: parsed.into_record(&first.key, size),
        file: first.key,
    }))
}
