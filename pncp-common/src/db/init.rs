//! Database initialization
//!
//! Opens (or creates) the SQLite database and brings the schema up
//! idempotently, so a first run needs no manual setup.

use crate::Result;
use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};
use std::path::Path;
use tracing::info;

/// Initialize database connection pool and create tables if needed
pub async fn init_database(db_path: &Path) -> Result<SqlitePool> {
    let newly_created = !db_path.exists();

    // Create parent directory if it doesn't exist
    if let Some(parent) = db_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let db_url = format!("sqlite://{}?mode=rwc", db_path.display());
    let pool = SqlitePoolOptions::new()
        .max_connections(10)
        .connect(&db_url)
        .await?;

    if newly_created {
        info!("Initialized new database: {}", db_path.display());
    } else {
        info!("Opened existing database: {}", db_path.display());
    }

    // Enable foreign keys
    sqlx::query("PRAGMA foreign_keys = ON").execute(&pool).await?;

    // WAL allows concurrent readers while a stage persists results
    sqlx::query("PRAGMA journal_mode = WAL").execute(&pool).await?;

    sqlx::query("PRAGMA busy_timeout = 5000").execute(&pool).await?;

    create_schema(&pool).await?;

    Ok(pool)
}

/// Create tables if needed (idempotent - safe to call multiple times).
///
/// Split out from [`init_database`] so tests can run against
/// `SqlitePool::connect(":memory:")`.
pub async fn create_schema(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS tenders (
            control_number TEXT PRIMARY KEY,
            org_cnpj TEXT NOT NULL,
            org_name TEXT NOT NULL,
            year INTEGER NOT NULL,
            sequential INTEGER NOT NULL,
            modality INTEGER NOT NULL,
            published TEXT NOT NULL,
            description TEXT NOT NULL,
            total_value REAL,
            confidence INTEGER NOT NULL,
            verdict_source TEXT NOT NULL,
            harvested_at TEXT NOT NULL
        )",
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_tenders_org ON tenders(org_cnpj)")
        .execute(pool)
        .await?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS tender_items (
            control_number TEXT NOT NULL REFERENCES tenders(control_number),
            item_number INTEGER NOT NULL,
            description TEXT NOT NULL,
            classification_codes TEXT NOT NULL DEFAULT '[]',
            unit_price REAL,
            PRIMARY KEY (control_number, item_number)
        )",
    )
    .execute(pool)
    .await?;

    Ok(())
}
