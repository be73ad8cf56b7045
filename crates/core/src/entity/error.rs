use thiserror::Error;

/// Errors raised while deriving or decoding entity keys.
///
/// These indicate a programming error upstream and are never retried.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum KeyError {
    #[error("Key belongs to namespace '{actual}' but was used in namespace '{expected}'")]
    CrossNamespace { expected: String, actual: String },
    #[error("Key is incomplete: {0}")]
    Incomplete(String),
    #[error("Malformed key: {0}")]
    Malformed(String),
}

/// Result type for key operations.
pub type Result<T> = std::result::Result<T, KeyError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cross_namespace_display() {
        let error = KeyError::CrossNamespace {
            expected: "tenant-a".to_string(),
            actual: "tenant-b".to_string(),
        };
        assert_eq!(
            error.to_string(),
            "Key belongs to namespace 'tenant-b' but was used in namespace 'tenant-a'"
        );
    }

    #[test]
    fn test_malformed_display() {
        let error = KeyError::Malformed("empty path".to_string());
        assert_eq!(error.to_string(), "Malformed key: empty path");
    }
}
