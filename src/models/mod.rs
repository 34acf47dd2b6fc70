//! Core data models for the file gateway.
//!
//! Buckets and objects map to SQLite rows via `sqlx::FromRow`; listing
//! entries and upload sessions are request-scoped values that are rebuilt
//! from the object store on every call.

pub mod bucket;
pub mod listing;
pub mod object;
pub mod upload;
