pub mod cache_service;
pub mod hub;
pub mod indexer;
pub mod query;
pub mod sidecar;
pub mod storage_service;
