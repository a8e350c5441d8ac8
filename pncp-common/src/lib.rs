//! # PNCP Harvest Common Library
//!
//! Shared code for the PNCP harvest workspace including:
//! - Domain models (tenders, items, verdicts)
//! - Error types
//! - Configuration loading
//! - SQLite store access (schema, dedup queries, persistence)

pub mod config;
pub mod db;
pub mod error;
pub mod models;

pub use error::{Error, Result};
