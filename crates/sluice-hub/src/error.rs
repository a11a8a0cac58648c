use sluice_core::JobKey;

#[derive(Debug, thiserror::Error)]
pub enum HubError {
    /// Appending to a finished job is a programming error.
    #[error("job {key} is already finished")]
    JobFinished { key: JobKey },

    /// `done` is written by `Job::finish` only.
    #[error("job {key}: the done record is reserved for finish()")]
    ReservedEvent { key: JobKey },

    #[error("hub is shutting down")]
    ShuttingDown,
}
