//! Database row types for the two queue tables.
//!
//! `parameters` is stored as compact JSON text; the conversion helpers here
//! are the single place the textual encoding is decided.

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::FromRow;

/// A row of the `scheduled_jobs` table: a job that becomes runnable at or
/// after `scheduled_for`.
#[derive(Debug, Clone, FromRow)]
pub struct ScheduledJobRow {
    /// Unique identifier of the scheduled job.
    pub id: u64,
    /// Name of the handler that will execute the job.
    pub name: String,
    /// Status handed to the first handler invocation.
    pub status: String,
    /// JSON text of the parameter payload.
    pub parameters: String,
    /// Point in time at which the job becomes due.
    pub scheduled_for: DateTime<Utc>,
}

/// A row of the `jobs` table: one step of an in-flight or finished execution
/// chain.
#[derive(Debug, Clone, FromRow)]
pub struct JobRow {
    /// Unique identifier of this step.
    pub id: u64,
    /// The scheduled job this chain originated from, or 0 for synthetic
    /// roots.
    pub scheduled_job_id: u64,
    /// The preceding step of the chain, or 0 for roots.
    pub parent_id: u64,
    /// Name of the handler executing the chain.
    pub name: String,
    /// Status at this step.
    pub status: String,
    /// JSON text of the parameter payload at this step.
    pub parameters: String,
    /// How many times this status has been attempted along the chain.
    pub attempt: i32,
    /// When this row was written. Rows older than the recovery threshold in
    /// a non-terminal status are considered stuck.
    pub updated_at: DateTime<Utc>,
}

/// Encode a parameter payload as the stored text form.
pub(crate) fn parameters_to_text(parameters: &Value) -> String {
    parameters.to_string()
}

/// Decode the stored text form back into a parameter payload.
pub(crate) fn parameters_from_text(text: &str) -> Result<Value, serde_json::Error> {
    serde_json::from_str(text)
}
