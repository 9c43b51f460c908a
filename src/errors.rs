/// Errors that can occur while persisting a scheduled job.
#[derive(Debug, thiserror::Error)]
pub enum ScheduleError {
    /// An error occurred while communicating with the database.
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}
