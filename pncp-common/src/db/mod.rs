//! SQLite store access
//!
//! The store is the durable side of the pipeline: previously harvested
//! control numbers (consumed by the deduplication gate) and the confirmed
//! tenders with their resolved items.

pub mod init;
pub mod tenders;

pub use init::{create_schema, init_database};
