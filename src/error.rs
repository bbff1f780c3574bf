use std::sync::Arc;

/// Failure reported by an external store collaborator, such as a big segment store.
///
/// Store failures never escape an evaluation: they are turned into degraded statuses. The type is
/// `Clone` so that a single failed load can be handed to every caller waiting on it.
#[derive(thiserror::Error, Debug, Clone)]
#[non_exhaustive]
pub enum StoreError {
    /// The store could not be reached or refused the query.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// The query did not complete within the store's own time limit.
    #[error("store query timed out")]
    Timeout,

    /// Any other error raised by the store implementation.
    #[error(transparent)]
    // Arbitrary errors are not clonable, so they are shared behind an Arc.
    Other(Arc<dyn std::error::Error + Send + Sync>),
}

impl StoreError {
    /// Wrap an arbitrary store implementation error.
    pub fn other<E>(error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        StoreError::Other(Arc::new(error))
    }
}

impl From<std::io::Error> for StoreError {
    fn from(value: std::io::Error) -> Self {
        StoreError::other(value)
    }
}

#[cfg(test)]
mod tests {
    use super::StoreError;

    #[test]
    fn messages() {
        assert_eq!(
            StoreError::Unavailable("connection refused".into()).to_string(),
            "store unavailable: connection refused"
        );
        assert_eq!(StoreError::Timeout.to_string(), "store query timed out");

        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk on fire");
        let err = StoreError::from(io);
        assert_eq!(err.clone().to_string(), "disk on fire");
    }
}
