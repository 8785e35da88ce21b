//! Backend for browsing ledger snapshots kept in an S3 bucket.
//!
//! Snapshot archives (`*.tar.gz`) sit next to small JSON sidecars named
//! `snapshot-<slot>-<node>.json`. The service lists the bucket, indexes the
//! sidecars into filter facets, answers filtered queries over them and pushes
//! new listings to browsers over WebSocket.

pub mod config;
pub mod errors;
pub mod handlers;
pub mod models;
pub mod routes;
pub mod services;
pub mod state;

use axum::Router;

/// The full HTTP application over `state`.
pub fn app(state: state::AppState) -> Router {
    routes::routes::routes().with_state(state)
}
