//! Core data models for the file vault.
//!
//! Metadata rows map to SQLite tables via `sqlx::FromRow`; everything
//! serializes as camelCase JSON for the HTTP layer.

pub mod file;
pub mod node;
pub mod requester;
pub mod stored_object;
