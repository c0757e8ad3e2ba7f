use thiserror::Error;

/// Errors from store operations (used by the trait definitions in
/// orbitmesh-core and implemented by every backend).
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store connection error")]
    Connection,

    #[error("query error: {0}")]
    Query(String),

    #[error("entity not found")]
    NotFound,

    /// Compare-and-set lost or duplicate key. Callers may retry once.
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_error_display() {
        let err = StoreError::Conflict("instance status changed".to_string());
        assert_eq!(err.to_string(), "conflict: instance status changed");

        let err = StoreError::Query("bad filter".to_string());
        assert!(err.to_string().contains("bad filter"));
    }
}
