use thiserror::Error;

/// Failure reported by a `StateRepository` backend.
#[derive(Debug, Error)]
pub enum RepositoryError {
    /// The store could not run the read or write.
    #[error("storage error: {0}")]
    Storage(String),

    /// A stored record no longer decodes into a workflow state.
    #[error("corrupt record: {0}")]
    Corrupt(String),
}
