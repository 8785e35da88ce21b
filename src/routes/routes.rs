//! Defines routes for the snapshot browser API.
//!
//! ## Structure
//! - **Bucket objects**
//!   - `GET /api/files`: list every object
//!   - `GET /api/files/{*key}`: download an object (archives refused)
//!
//! - **Sidecar metadata**
//!   - `GET /api/metadata/options`: facet values
//!   - `GET /api/metadata`: filtered, paginated records
//!   - `GET /api/metadata/{*key}`: one record
//!
//! - **Realtime and debug**
//!   - `GET /api/ws`: WebSocket push of bucket listings
//!   - `GET /api/debug/reindex`, `GET /api/debug/examine-file`
//!
//! The wildcard `*key` allows nested keys like `mainnet/snapshot-1-abc.json`.
//! Every `/api` response carries permissive CORS headers.

use crate::{
    handlers::{
        health_handlers::{healthz, readyz},
        metadata_handlers::{
            debug_examine_file, debug_reindex, get_metadata, get_metadata_options, list_metadata,
        },
        object_handlers::{get_file, list_files},
        ws_handlers::ws_handler,
    },
    state::AppState,
};
use axum::{
    Router,
    extract::Request,
    http::{HeaderValue, Method, StatusCode, header},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
};

/// Build the router for every endpoint.
pub fn routes() -> Router<AppState> {
    let api = Router::new()
        .route("/files", get(list_files))
        .route("/files/{*key}", get(get_file))
        .route("/metadata/options", get(get_metadata_options))
        .route("/metadata", get(list_metadata))
        .route("/metadata/{*key}", get(get_metadata))
        .route("/ws", get(ws_handler))
        .route("/debug/reindex", get(debug_reindex))
        .route("/debug/examine-file", get(debug_examine_file))
        .layer(middleware::from_fn(cors));

    Router::new()
        // health endpoints (mounted at root)
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .nest("/api", api)
}

/// Allow any origin; preflight requests are answered directly.
async fn cors(request: Request, next: Next) -> Response {
    let mut response = if request.method() == Method::OPTIONS {
        StatusCode::NO_CONTENT.into_response()
    } else {
        next.run(request).await
    };

    let headers = response.headers_mut();
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_static("*"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static("GET, OPTIONS"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static("Content-Type"),
    );
    response
}
