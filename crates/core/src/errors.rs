use thiserror::Error;

/// Malformed input rejected at the ingestion boundary. Never enters the log.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("invalid `{field}`: {reason}")]
pub struct ValidationError {
    pub field: String,
    pub reason: String,
}

impl ValidationError {
    pub fn new(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self { field: field.into(), reason: reason.into() }
    }

    pub fn missing(field: impl Into<String>) -> Self {
        Self::new(field, "is required")
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ProcessingError {
    /// Dependency timeout or similar; retried with backoff, then dead-lettered.
    #[error("transient processing failure: {0}")]
    Transient(String),
    /// Passed validation but fails semantic checks; dead-lettered without retry.
    #[error("permanent processing failure: {0}")]
    Permanent(String),
}

impl ProcessingError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    pub fn class(&self) -> &'static str {
        match self {
            Self::Transient(_) => "transient",
            Self::Permanent(_) => "permanent",
        }
    }

    pub fn reason(&self) -> &str {
        match self {
            Self::Transient(reason) | Self::Permanent(reason) => reason,
        }
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("embedding unavailable: {0}")]
pub struct EmbeddingUnavailable(pub String);

#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("classification unavailable: {0}")]
pub struct ClassificationUnavailable(pub String);

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ApplicationError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(
        "consumer group `{consumer_group}` requested offset {requested} on {topic}/{partition_key} below low watermark {low_watermark}"
    )]
    OffsetOutOfRange {
        consumer_group: String,
        topic: String,
        partition_key: String,
        requested: u64,
        low_watermark: u64,
    },
    #[error(transparent)]
    Processing(#[from] ProcessingError),
    #[error("raw record missing for `{event_id}`")]
    RawNotFound { event_id: String },
    #[error(transparent)]
    EmbeddingUnavailable(#[from] EmbeddingUnavailable),
    #[error(transparent)]
    ClassificationUnavailable(#[from] ClassificationUnavailable),
    #[error("storage timed out during {operation}")]
    StorageTimeout { operation: String },
    #[error("persistence failure: {0}")]
    Persistence(String),
    #[error("configuration failure: {0}")]
    Configuration(String),
}

impl ApplicationError {
    /// Stable machine-readable class used in logs and CLI output.
    pub fn error_class(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::OffsetOutOfRange { .. } => "offset_out_of_range",
            Self::Processing(ProcessingError::Transient(_)) => "processing_transient",
            Self::Processing(ProcessingError::Permanent(_)) => "processing_permanent",
            Self::RawNotFound { .. } => "raw_not_found",
            Self::EmbeddingUnavailable(_) => "embedding_unavailable",
            Self::ClassificationUnavailable(_) => "classification_unavailable",
            Self::StorageTimeout { .. } => "storage_timeout",
            Self::Persistence(_) => "persistence",
            Self::Configuration(_) => "configuration",
        }
    }

    pub fn into_interface(self, correlation_id: impl Into<String>) -> InterfaceError {
        let correlation_id = correlation_id.into();
        let mut mapped = InterfaceError::from(self);
        match &mut mapped {
            InterfaceError::BadRequest { correlation_id: id, .. }
            | InterfaceError::ServiceUnavailable { correlation_id: id, .. }
            | InterfaceError::Internal { correlation_id: id, .. } => *id = correlation_id,
        }
        mapped
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum InterfaceError {
    #[error("bad request: {message}")]
    BadRequest { message: String, correlation_id: String },
    #[error("service unavailable: {message}")]
    ServiceUnavailable { message: String, correlation_id: String },
    #[error("internal error: {message}")]
    Internal { message: String, correlation_id: String },
}

impl InterfaceError {
    pub fn user_message(&self) -> &'static str {
        match self {
            Self::BadRequest { .. } => {
                "The request could not be processed. Check inputs and try again."
            }
            Self::ServiceUnavailable { .. } => {
                "The service is temporarily unavailable. Please retry shortly."
            }
            Self::Internal { .. } => "An unexpected internal error occurred.",
        }
    }
}

impl From<ApplicationError> for InterfaceError {
    fn from(value: ApplicationError) -> Self {
        let unassigned = || "unassigned".to_owned();
        match value {
            ApplicationError::Validation(error) => {
                Self::BadRequest { message: error.to_string(), correlation_id: unassigned() }
            }
            ApplicationError::EmbeddingUnavailable(_)
            | ApplicationError::ClassificationUnavailable(_)
            | ApplicationError::StorageTimeout { .. }
            | ApplicationError::Persistence(_) => {
                Self::ServiceUnavailable { message: value.to_string(), correlation_id: unassigned() }
            }
            ApplicationError::OffsetOutOfRange { .. }
            | ApplicationError::Processing(_)
            | ApplicationError::RawNotFound { .. }
            | ApplicationError::Configuration(_) => {
                Self::Internal { message: value.to_string(), correlation_id: unassigned() }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::errors::{
        ApplicationError, ClassificationUnavailable, InterfaceError, ProcessingError,
        ValidationError,
    };

    #[test]
    fn validation_error_maps_to_bad_request_interface_error() {
        let interface =
            ApplicationError::from(ValidationError::missing("attendees")).into_interface("req-1");

        assert!(matches!(
            interface,
            InterfaceError::BadRequest {
                ref correlation_id,
                ref message,
            } if correlation_id == "req-1" && message.contains("attendees")
        ));
        assert_eq!(
            interface.user_message(),
            "The request could not be processed. Check inputs and try again."
        );
    }

    #[test]
    fn capability_outages_map_to_service_unavailable() {
        let interface = ApplicationError::from(ClassificationUnavailable("model offline".into()))
            .into_interface("req-2");

        assert!(matches!(interface, InterfaceError::ServiceUnavailable { .. }));
        assert_eq!(
            interface.user_message(),
            "The service is temporarily unavailable. Please retry shortly."
        );
    }

    #[test]
    fn ordering_violation_maps_to_internal() {
        let error = ApplicationError::RawNotFound { event_id: "evt-9".into() };
        assert_eq!(error.error_class(), "raw_not_found");

        let interface = error.into_interface("req-3");
        assert!(matches!(interface, InterfaceError::Internal { .. }));
        assert_eq!(interface.user_message(), "An unexpected internal error occurred.");
    }

    #[test]
    fn processing_error_classes_distinguish_retryability() {
        let transient = ProcessingError::Transient("embedding timed out".into());
        let permanent = ProcessingError::Permanent("confidence_score out of range".into());

        assert!(transient.is_transient());
        assert!(!permanent.is_transient());
        assert_eq!(ApplicationError::from(transient).error_class(), "processing_transient");
        assert_eq!(ApplicationError::from(permanent).error_class(), "processing_permanent");
    }
}
