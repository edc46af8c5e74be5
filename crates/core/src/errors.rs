use thiserror::Error;

use crate::{domain::property::PropertyStatus, flows::FlowTransitionError};

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum DomainError {
    #[error("invalid property transition from {from:?} to {to:?}")]
    InvalidPropertyTransition { from: PropertyStatus, to: PropertyStatus },
    #[error(transparent)]
    FlowTransition(#[from] FlowTransitionError),
    #[error("domain invariant violation: {0}")]
    InvariantViolation(String),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StoreKind {
    Relational,
    Graph,
}

impl StoreKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Relational => "relational",
            Self::Graph => "graph",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Recoverable,
    Degraded,
    Severe,
}

/// Failures inside the intake pipeline. None of these ever reach the messaging
/// channel as an error status; each maps to a plain reply.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum IntakeError {
    #[error("validation failed for {field}: {message}")]
    Validation { field: &'static str, message: String },
    #[error("extraction capability unavailable: {0}")]
    OracleUnavailable(String),
    #[error("extraction capability returned malformed output: {0}")]
    OracleMalformedOutput(String),
    #[error("{} store write failed: {message}", store.as_str())]
    StoreWrite { store: StoreKind, message: String },
    #[error("unknown step marker `{0}`")]
    UnknownStep(String),
}

impl IntakeError {
    pub fn severity(&self) -> Severity {
        match self {
            Self::Validation { .. }
            | Self::OracleUnavailable(_)
            | Self::OracleMalformedOutput(_)
            | Self::UnknownStep(_) => Severity::Recoverable,
            Self::StoreWrite { store: StoreKind::Graph, .. } => Severity::Degraded,
            Self::StoreWrite { store: StoreKind::Relational, .. } => Severity::Severe,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation { .. } => "validation_error",
            Self::OracleUnavailable(_) => "oracle_unavailable",
            Self::OracleMalformedOutput(_) => "oracle_malformed_output",
            Self::StoreWrite { store: StoreKind::Relational, .. } => "relational_write_error",
            Self::StoreWrite { store: StoreKind::Graph, .. } => "graph_write_error",
            Self::UnknownStep(_) => "unknown_step",
        }
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ApplicationError {
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("persistence failure: {0}")]
    Persistence(String),
    #[error("configuration failure: {0}")]
    Configuration(String),
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum InterfaceError {
    #[error("bad request: {message}")]
    BadRequest { message: String, correlation_id: String },
    #[error("not found: {message}")]
    NotFound { message: String, correlation_id: String },
    #[error("conflict: {message}")]
    Conflict { message: String, correlation_id: String },
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
            Self::NotFound { .. } => "The requested record does not exist.",
            Self::Conflict { .. } => {
                "The request matches more than one record. Narrow it down and try again."
            }
            Self::ServiceUnavailable { .. } => {
                "The service is temporarily unavailable. Please retry shortly."
            }
            Self::Internal { .. } => "An unexpected internal error occurred.",
        }
    }

    pub fn correlation_id(&self) -> &str {
        match self {
            Self::BadRequest { correlation_id, .. }
            | Self::NotFound { correlation_id, .. }
            | Self::Conflict { correlation_id, .. }
            | Self::ServiceUnavailable { correlation_id, .. }
            | Self::Internal { correlation_id, .. } => correlation_id,
        }
    }
}

impl ApplicationError {
    pub fn into_interface(self, correlation_id: impl Into<String>) -> InterfaceError {
        let correlation_id = correlation_id.into();
        let mut mapped = InterfaceError::from(self);
        match &mut mapped {
            InterfaceError::BadRequest { correlation_id: id, .. }
            | InterfaceError::NotFound { correlation_id: id, .. }
            | InterfaceError::Conflict { correlation_id: id, .. }
            | InterfaceError::ServiceUnavailable { correlation_id: id, .. }
            | InterfaceError::Internal { correlation_id: id, .. } => *id = correlation_id,
        }
        mapped
    }
}

impl From<ApplicationError> for InterfaceError {
    fn from(value: ApplicationError) -> Self {
        let correlation_id = "unassigned".to_owned();
        match value {
            ApplicationError::Domain(_) => {
                Self::BadRequest { message: "domain validation failed".to_owned(), correlation_id }
            }
            ApplicationError::NotFound(message) => Self::NotFound { message, correlation_id },
            ApplicationError::Conflict(message) => Self::Conflict { message, correlation_id },
            ApplicationError::Persistence(message) => {
                Self::ServiceUnavailable { message, correlation_id }
            }
            ApplicationError::Configuration(message) => Self::Internal { message, correlation_id },
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::errors::{
        ApplicationError, DomainError, InterfaceError, IntakeError, Severity, StoreKind,
    };

    #[test]
    fn domain_error_maps_to_bad_request_interface_error() {
        let interface = ApplicationError::from(DomainError::InvariantViolation(
            "missing required field".to_owned(),
        ))
        .into_interface("req-1");

        assert!(matches!(
            interface,
            InterfaceError::BadRequest {
                ref correlation_id,
                ..
            } if correlation_id == "req-1"
        ));
        assert_eq!(
            interface.user_message(),
            "The request could not be processed. Check inputs and try again."
        );
    }

    #[test]
    fn persistence_error_maps_to_service_unavailable() {
        let interface = ApplicationError::Persistence("database lock timeout".to_owned())
            .into_interface("req-3");

        assert!(matches!(interface, InterfaceError::ServiceUnavailable { .. }));
        assert_eq!(interface.correlation_id(), "req-3");
    }

    #[test]
    fn conflict_keeps_its_message() {
        let interface =
            ApplicationError::Conflict("address has 2 listers".to_owned()).into_interface("req-4");
        assert!(matches!(
            interface,
            InterfaceError::Conflict { ref message, .. } if message == "address has 2 listers"
        ));
    }

    #[test]
    fn relational_write_is_more_severe_than_graph_write() {
        let relational =
            IntakeError::StoreWrite { store: StoreKind::Relational, message: "locked".into() };
        let graph = IntakeError::StoreWrite { store: StoreKind::Graph, message: "locked".into() };

        assert_eq!(relational.severity(), Severity::Severe);
        assert_eq!(graph.severity(), Severity::Degraded);
        assert!(relational.severity() > graph.severity());
        assert_eq!(relational.to_string(), "relational store write failed: locked");
    }

    #[test]
    fn oracle_failures_are_recoverable() {
        assert_eq!(IntakeError::OracleUnavailable("timeout".into()).severity(), Severity::Recoverable);
        assert_eq!(
            IntakeError::OracleMalformedOutput("missing key".into()).kind(),
            "oracle_malformed_output"
        );
    }
}
