//! Data models for the backup pipeline.
//!
//! `volume` and `artifact` describe what flows through the pipeline; `bucket`
//! and `object` are the rows the directory-backed object store keeps in
//! SQLite via `sqlx::FromRow`.

pub mod artifact;
pub mod bucket;
pub mod object;
pub mod volume;
