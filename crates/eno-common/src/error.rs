//! Error types for eno controllers
//!
//! Errors are structured with fields to aid debugging in production.
//! Variants carry the composition or operation context they occurred in.

use thiserror::Error;

/// Main error type for eno operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error [{context}]: {source}")]
    Kube {
        /// The underlying kube-rs error
        source: kube::Error,
        /// Operation that was being performed (e.g., "listing pods")
        context: String,
    },

    /// A field-level compare-and-swap guard did not match the stored object
    #[error("conflict updating {resource}: {message}")]
    Conflict {
        /// Resource being updated (e.g., "default/my-comp")
        resource: String,
        /// Description of the guard that failed
        message: String,
    },

    /// The synthesizer referenced by a composition is not visible yet
    #[error("synthesizer {name} not found for composition {composition}")]
    MissingSynthesizer {
        /// Name of the synthesizer
        name: String,
        /// Composition that references it
        composition: String,
    },

    /// A spec that cannot be acted on until it is changed
    #[error("invalid {resource}: {message}")]
    Validation {
        /// Resource with the invalid spec (e.g., "synthesizer helm")
        resource: String,
        /// Description of what's invalid
        message: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error for {kind}: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
        /// The resource kind being serialized
        kind: String,
    },
}

impl Error {
    /// Wrap a kube error with the operation that produced it
    pub fn kube(context: impl Into<String>, source: kube::Error) -> Self {
        Self::Kube {
            source,
            context: context.into(),
        }
    }

    /// Create a conflict error for a failed guarded update
    pub fn conflict(resource: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Conflict {
            resource: resource.into(),
            message: msg.into(),
        }
    }

    /// Create a missing-synthesizer error
    pub fn missing_synthesizer(name: impl Into<String>, composition: impl Into<String>) -> Self {
        Self::MissingSynthesizer {
            name: name.into(),
            composition: composition.into(),
        }
    }

    /// Create a validation error for a named resource
    pub fn validation(resource: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            resource: resource.into(),
            message: msg.into(),
        }
    }

    /// Create a serialization error for a resource kind
    pub fn serialization(kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: kind.into(),
        }
    }

    /// Whether this error came from a failed optimistic concurrency check.
    ///
    /// Covers both field-level guards and whole-object resourceVersion
    /// mismatches (HTTP 409).
    pub fn is_conflict(&self) -> bool {
        match self {
            Error::Conflict { .. } => true,
            Error::Kube {
                source: kube::Error::Api(ae),
                ..
            } => ae.code == 409,
            _ => false,
        }
    }

    /// Check if this error is retryable
    ///
    /// Every access error is treated as transient; only spec and
    /// serialization problems require a change before retrying helps.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { .. } => true,
            Error::Conflict { .. } => true,
            Error::MissingSynthesizer { .. } => true,
            Error::Validation { .. } => false,
            Error::Serialization { .. } => false,
        }
    }
}

/// Returns true when the kube error is an API 404
pub fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 404)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn api_error(code: u16) -> kube::Error {
        kube::Error::Api(kube::error::ErrorResponse {
            status: "Failure".to_string(),
            message: "boom".to_string(),
            reason: "Test".to_string(),
            code,
        })
    }

    /// Story: access errors carry the operation they failed in
    #[test]
    fn story_kube_errors_include_operation_context() {
        let err = Error::kube("listing pods", api_error(500));
        assert!(err.to_string().contains("[listing pods]"));
        assert!(err.is_retryable());
    }

    /// Story: guard failures and resourceVersion races are both conflicts
    #[test]
    fn story_conflicts_are_detected_for_both_update_styles() {
        let guard = Error::conflict("default/comp", "currentSynthesis.uuid changed");
        assert!(guard.is_conflict());
        assert!(guard.is_retryable());
        assert!(guard.to_string().contains("default/comp"));

        let whole_object = Error::kube("updating composition", api_error(409));
        assert!(whole_object.is_conflict());

        let other = Error::kube("updating composition", api_error(500));
        assert!(!other.is_conflict());
    }

    #[test]
    fn validation_and_serialization_are_not_retryable() {
        let invalid = Error::validation("synthesizer helm", "spec.image must not be empty");
        assert!(!invalid.is_retryable());
        assert_eq!(
            invalid.to_string(),
            "invalid synthesizer helm: spec.image must not be empty"
        );

        let encoding = Error::serialization("Composition", "missing field");
        assert!(!encoding.is_retryable());
        assert_eq!(
            encoding.to_string(),
            "serialization error for Composition: missing field"
        );
    }

    #[test]
    fn missing_synthesizer_names_both_sides() {
        let err = Error::missing_synthesizer("helm", "default/app");
        assert!(err.to_string().contains("helm"));
        assert!(err.to_string().contains("default/app"));
        assert!(err.is_retryable());
    }

    #[test]
    fn not_found_detection() {
        assert!(is_not_found(&api_error(404)));
        assert!(!is_not_found(&api_error(409)));
    }
}
