use thiserror::Error;

pub type BoxedError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("provider error: {0}")]
    Provider(#[source] BoxedError),

    #[error("subscription establishment failed: {0}")]
    Subscribe(String),

    #[error("maximum establishment attempts ({attempts}) reached: {last}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        last: Box<SyncError>,
    },

    #[error("operation cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl SyncError {
    /// Wraps an arbitrary provider-side failure.
    pub fn provider(err: impl Into<BoxedError>) -> Self {
        Self::Provider(err.into())
    }
}
