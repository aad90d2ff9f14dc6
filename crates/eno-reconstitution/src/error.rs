//! Reconstitution error types

/// Errors raised while building or filling the reconstitution cache
#[derive(Debug, thiserror::Error)]
pub enum ReconstitutionError {
    /// A slice was observed without a deletion timestamp while its
    /// composition has one, meaning the local view lags a real deletion
    #[error("stale informer: slice {slice} is not deleting but composition {composition} is, refusing to fill cache")]
    StaleRead {
        /// Composition being filled
        composition: String,
        /// Slice observed out of date
        slice: String,
    },

    /// A manifest could not be turned into a resource
    #[error("building resource at index {index} of slice {slice}: {message}")]
    InvalidResource {
        /// Slice holding the manifest
        slice: String,
        /// Position of the manifest within the slice
        index: usize,
        /// What was wrong with it
        message: String,
    },

    /// Shared eno error (Kubernetes access and friends)
    #[error("{0}")]
    Common(#[from] eno_common::Error),
}

impl ReconstitutionError {
    /// Create an invalid resource error
    pub fn invalid_resource(
        slice: impl Into<String>,
        index: usize,
        message: impl Into<String>,
    ) -> Self {
        Self::InvalidResource {
            slice: slice.into(),
            index,
            message: message.into(),
        }
    }

    /// Whether retrying without any change can succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::StaleRead { .. } => true,
            Self::InvalidResource { .. } => false,
            Self::Common(e) => e.is_retryable(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stale_reads_are_retried() {
        let err = ReconstitutionError::StaleRead {
            composition: "default/app".to_string(),
            slice: "app-abc".to_string(),
        };
        assert!(err.is_retryable());
        assert!(err.to_string().contains("stale informer"));
    }

    #[test]
    fn invalid_resources_are_not_retried() {
        let err = ReconstitutionError::invalid_resource("app-abc", 3, "missing kind");
        assert!(!err.is_retryable());
        assert_eq!(
            err.to_string(),
            "building resource at index 3 of slice app-abc: missing kind"
        );
    }

    #[test]
    fn common_errors_keep_their_policy() {
        let err: ReconstitutionError =
            eno_common::Error::serialization("ResourceSlice", "bad manifest").into();
        assert!(!err.is_retryable());
    }
}
