//! Database schema definitions using SurrealQL.

use surrealdb::Surreal;
use surrealdb::engine::any::Any;

use crate::StoreError;

/// Initialize the database schema.
///
/// This creates all necessary tables and indexes.
pub async fn init_schema(db: &Surreal<Any>) -> Result<(), StoreError> {
    tracing::info!("Initializing job store schema...");

    db.query(QUEUE_SCHEMA).await?.check()?;
    db.query(JOB_SCHEMA).await?.check()?;
    db.query(RESULT_SCHEMA).await?.check()?;

    tracing::info!("Job store schema initialized");

    Ok(())
}

/// Queue table: one record per job type, keyed by the type name, holding the
/// id counter and the five status collections.
const QUEUE_SCHEMA: &str = r#"
DEFINE TABLE IF NOT EXISTS queue SCHEMALESS;
"#;

/// Job table: one record per job, keyed by `<type>:<id>`.
const JOB_SCHEMA: &str = r#"
DEFINE TABLE IF NOT EXISTS job SCHEMALESS;

DEFINE INDEX IF NOT EXISTS job_type ON job FIELDS job_type;
DEFINE INDEX IF NOT EXISTS job_expires ON job FIELDS expires_at;
"#;

/// Job results, stored and expired apart from the job records.
const RESULT_SCHEMA: &str = r#"
DEFINE TABLE IF NOT EXISTS job_result SCHEMALESS;

DEFINE INDEX IF NOT EXISTS result_type ON job_result FIELDS job_type;
DEFINE INDEX IF NOT EXISTS result_expires ON job_result FIELDS expires_at;
"#;
