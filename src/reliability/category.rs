use std::fmt;
use std::io::ErrorKind;

use dimse::pdu::{AssociationRjResult, AssociationRjServiceUserReason, AssociationRjSource};
use dimse::{DimseError, StoreFailure};
use serde::{Deserialize, Serialize};

/// Coarse classification of a failed service operation, used to decide
/// whether it is worth another attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// The peer or network may recover on its own (refused, reset, aborted)
    Transient,
    /// Retrying the same request cannot succeed
    Permanent,
    /// Local or remote setup is wrong (AE titles, SOP classes, TLS material)
    Configuration,
    /// The peer violated the protocol
    Protocol,
    Timeout,
    /// The peer is out of resources or at its association limit
    Resource,
}

impl ErrorCategory {
    pub const DEFAULT_RETRYABLE: [ErrorCategory; 3] = [
        ErrorCategory::Transient,
        ErrorCategory::Timeout,
        ErrorCategory::Resource,
    ];

    /// Classify a DIMSE failure
    pub fn of(error: &DimseError) -> Self {
        match error {
            DimseError::Config(_)
            | DimseError::InvalidAeTitle(_)
            | DimseError::NoAcceptablePresentationContext
            | DimseError::NoPresentationContext(_)
            | DimseError::NotSupported(_) => ErrorCategory::Configuration,
            #[cfg(feature = "tls")]
            DimseError::Tls(_) => ErrorCategory::Configuration,
            DimseError::Network(e) => match e.kind() {
                ErrorKind::TimedOut => ErrorCategory::Timeout,
                ErrorKind::AddrNotAvailable | ErrorKind::InvalidInput => {
                    ErrorCategory::Configuration
                }
                _ => ErrorCategory::Transient,
            },
            DimseError::Protocol(_) => ErrorCategory::Protocol,
            DimseError::AssociationRejected(rejection) => match rejection.result {
                AssociationRjResult::Transient => ErrorCategory::Resource,
                AssociationRjResult::Permanent => match rejection.source {
                    AssociationRjSource::ServiceUser(
                        AssociationRjServiceUserReason::CalledAeTitleNotRecognized
                        | AssociationRjServiceUserReason::CallingAeTitleNotRecognized,
                    ) => ErrorCategory::Configuration,
                    _ => ErrorCategory::Permanent,
                },
            },
            DimseError::AssociationTimeout(_) => ErrorCategory::Timeout,
            DimseError::PeerAbort(_) | DimseError::PeerReleased => ErrorCategory::Transient,
            DimseError::OperationFailed { status, .. } => match status.code() >> 8 {
                0xA7 => ErrorCategory::Resource,
                _ if status.code() == 0x0122 => ErrorCategory::Configuration,
                _ => ErrorCategory::Permanent,
            },
            DimseError::StoreFailed { reason, .. } => match reason {
                StoreFailure::OutOfResources => ErrorCategory::Resource,
                StoreFailure::SopClassNotSupported | StoreFailure::NotAuthorized => {
                    ErrorCategory::Configuration
                }
                _ => ErrorCategory::Permanent,
            },
            DimseError::LocalAbort(_)
            | DimseError::InvalidState(_)
            | DimseError::Cancelled
            | DimseError::Internal(_) => ErrorCategory::Permanent,
        }
    }

    /// Retryable under the default policy
    pub fn is_retryable(self) -> bool {
        Self::DEFAULT_RETRYABLE.contains(&self)
    }

    /// Whether the failure says something about the destination's health.
    /// Only these count towards opening its circuit breaker.
    pub fn affects_destination_health(self) -> bool {
        matches!(
            self,
            ErrorCategory::Transient | ErrorCategory::Timeout | ErrorCategory::Resource
        )
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorCategory::Transient => "transient",
            ErrorCategory::Permanent => "permanent",
            ErrorCategory::Configuration => "configuration",
            ErrorCategory::Protocol => "protocol",
            ErrorCategory::Timeout => "timeout",
            ErrorCategory::Resource => "resource",
        };
        f.write_str(name)
    }
}
