use chrono::{Duration, Utc};
use sqlx::MySqlPool;

use crate::job::{Job, ScheduledJob, ULTIMATE_STATUSES};
use crate::schema::{JobRow, ScheduledJobRow, parameters_to_text};

/// Idempotently create the `scheduled_jobs` and `jobs` tables.
///
/// The unique key on `jobs (parent_id, scheduled_job_id)` is what keeps
/// concurrent workers from persisting two continuations of the same chain
/// step: the loser of the race gets an integrity violation and backs off.
pub async fn initialize(pool: &MySqlPool) -> Result<(), sqlx::Error> {
    sqlx::query(
        r"
        CREATE TABLE IF NOT EXISTS scheduled_jobs (
            id BIGINT UNSIGNED NOT NULL AUTO_INCREMENT,
            name VARCHAR(255) NOT NULL,
            status VARCHAR(255) NOT NULL,
            parameters TEXT NOT NULL,
            scheduled_for DATETIME NOT NULL,
            PRIMARY KEY (id),
            INDEX idx_scheduled_jobs_scheduled_for (scheduled_for)
        )
        ",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r"
        CREATE TABLE IF NOT EXISTS jobs (
            id BIGINT UNSIGNED NOT NULL AUTO_INCREMENT,
            scheduled_job_id BIGINT UNSIGNED NOT NULL DEFAULT 0,
            parent_id BIGINT UNSIGNED NOT NULL DEFAULT 0,
            name VARCHAR(255) NOT NULL,
            status VARCHAR(255) NOT NULL,
            parameters TEXT NOT NULL,
            attempt INT NOT NULL DEFAULT 1,
            updated_at DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP,
            PRIMARY KEY (id),
            UNIQUE KEY uniq_jobs_continuation (parent_id, scheduled_job_id),
            INDEX idx_jobs_updated_at (updated_at)
        )
        ",
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Insert one step of an execution chain; returns the new primary key.
///
/// May fail with a unique violation when another worker already persisted a
/// continuation of the same parent; callers treat that as a benign lost
/// race (see [`is_unique_violation`]).
pub(crate) async fn insert_job(pool: &MySqlPool, job: &Job) -> Result<u64, sqlx::Error> {
    let result = sqlx::query(
        r"
        INSERT INTO jobs (scheduled_job_id, parent_id, name, status, parameters, attempt)
        VALUES (?, ?, ?, ?, ?, ?)
        ",
    )
    .bind(job.scheduled_job_id)
    .bind(job.parent_id)
    .bind(&job.name)
    .bind(&job.status)
    .bind(parameters_to_text(&job.parameters))
    .bind(job.attempt)
    .execute(pool)
    .await?;

    Ok(result.last_insert_id())
}

pub(crate) async fn insert_scheduled_job(
    pool: &MySqlPool,
    scheduled: &ScheduledJob,
) -> Result<u64, sqlx::Error> {
    let result = sqlx::query(
        r"
        INSERT INTO scheduled_jobs (name, status, parameters, scheduled_for)
        VALUES (?, ?, ?, ?)
        ",
    )
    .bind(&scheduled.name)
    .bind(&scheduled.status)
    .bind(parameters_to_text(&scheduled.parameters))
    .bind(scheduled.scheduled_for)
    .execute(pool)
    .await?;

    Ok(result.last_insert_id())
}

/// Idempotent delete; deleting an already-deleted row is not an error.
pub(crate) async fn delete_scheduled_job_by_id(
    pool: &MySqlPool,
    id: u64,
) -> Result<(), sqlx::Error> {
    sqlx::query("DELETE FROM scheduled_jobs WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Up to `limit` scheduled jobs that are due now, bound to one of `names`,
/// and not currently traversing the pipeline.
pub(crate) async fn select_n_ready_scheduled_jobs(
    pool: &MySqlPool,
    names: &[String],
    exclude_ids: &[u64],
    limit: i64,
) -> Result<Vec<ScheduledJobRow>, sqlx::Error> {
    if names.is_empty() {
        return Ok(Vec::new());
    }

    let query = format!(
        "SELECT id, name, status, parameters, scheduled_for \
         FROM scheduled_jobs \
         WHERE scheduled_for <= NOW() AND name IN ({names}) AND id NOT IN ({ids}) \
         ORDER BY scheduled_for ASC \
         LIMIT ?",
        names = placeholders(names.len()),
        ids = placeholders(exclude_ids.len()),
    );

    let mut select = sqlx::query_as::<_, ScheduledJobRow>(&query);
    for name in names {
        select = select.bind(name);
    }
    for id in exclude_ids {
        select = select.bind(id);
    }
    select.bind(limit).fetch_all(pool).await
}

/// Up to `limit` job rows in a non-terminal status, bound to one of `names`,
/// not currently traversing the pipeline, whose row is older than the stuck
/// threshold. These are chains abandoned by a crashed worker.
pub(crate) async fn select_n_stuck_jobs(
    pool: &MySqlPool,
    names: &[String],
    exclude_ids: &[u64],
    stuck_threshold_mins: u32,
    limit: i64,
) -> Result<Vec<JobRow>, sqlx::Error> {
    if names.is_empty() {
        return Ok(Vec::new());
    }

    let cutoff = Utc::now() - Duration::minutes(i64::from(stuck_threshold_mins));
    let query = format!(
        "SELECT id, scheduled_job_id, parent_id, name, status, parameters, attempt, updated_at \
         FROM jobs \
         WHERE status NOT IN ({statuses}) AND name IN ({names}) AND id NOT IN ({ids}) \
           AND updated_at < ? \
         LIMIT ?",
        statuses = placeholders(ULTIMATE_STATUSES.len()),
        names = placeholders(names.len()),
        ids = placeholders(exclude_ids.len()),
    );

    let mut select = sqlx::query_as::<_, JobRow>(&query);
    for status in ULTIMATE_STATUSES {
        select = select.bind(status);
    }
    for name in names {
        select = select.bind(name);
    }
    for id in exclude_ids {
        select = select.bind(id);
    }
    select.bind(cutoff).bind(limit).fetch_all(pool).await
}

pub(crate) fn is_unique_violation(error: &sqlx::Error) -> bool {
    matches!(error, sqlx::Error::Database(db) if db.is_unique_violation())
}

fn placeholders(count: usize) -> String {
    vec!["?"; count].join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn placeholder_lists_match_bind_counts() {
        assert_eq!(placeholders(1), "?");
        assert_eq!(placeholders(3), "?, ?, ?");
    }
}
