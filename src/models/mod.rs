//! Core data models for the snapshot browser.
//!
//! `object` describes what a bucket listing returns; `metadata` describes what
//! is derived from the JSON sidecars that accompany each snapshot archive.
//! Both serialize as JSON via `serde` in the shape the browser client reads.

pub mod metadata;
pub mod object;
