//! Error types for DIMSE operations

use thiserror::Error;

use crate::pdu::{AbortSource, AssociationRjResult, AssociationRjSource};
use crate::status::Status;
use crate::services::store::StoreFailure;

/// Result type alias for DIMSE operations
pub type Result<T> = std::result::Result<T, DimseError>;

/// Wire or message-structure violations.
///
/// These always indicate a bug or a non-conformant peer and are fatal to the
/// association that produced them.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Malformed PDU: {0}")]
    MalformedPdu(String),

    #[error("Unknown PDU type 0x{0:02X}")]
    UnknownPduType(u8),

    #[error("Truncated data: needed {needed} bytes, {available} available")]
    TruncatedData { needed: usize, available: usize },

    #[error("Unexpected fragment on presentation context {context_id}: {detail}")]
    UnexpectedFragment { context_id: u8, detail: String },

    #[error("Unexpected PDU: {0}")]
    UnexpectedPdu(String),

    #[error("Unexpected message ID: expected {expected}, got {actual}")]
    UnexpectedMessageId { expected: u16, actual: u16 },

    #[error("Unexpected command field 0x{actual:04X} (expected 0x{expected:04X})")]
    UnexpectedCommand { expected: u16, actual: u16 },

    #[error("Invalid command set: {0}")]
    InvalidCommandSet(String),

    #[error("Unknown presentation context ID {0}")]
    UnknownPresentationContext(u8),

    #[error("PDU of {length} bytes exceeds maximum of {max}")]
    PduTooLarge { length: usize, max: usize },
}

/// Which handshake step was waiting when a timer fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutStage {
    Connect,
    AssociationResponse,
    AssociationRequest,
    ReleaseResponse,
    Response,
}

impl std::fmt::Display for TimeoutStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let stage = match self {
            TimeoutStage::Connect => "connect",
            TimeoutStage::AssociationResponse => "A-ASSOCIATE-AC/RJ",
            TimeoutStage::AssociationRequest => "A-ASSOCIATE-RQ",
            TimeoutStage::ReleaseResponse => "A-RELEASE-RP",
            TimeoutStage::Response => "DIMSE response",
        };
        f.write_str(stage)
    }
}

/// Structured A-ASSOCIATE-RJ content.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AssociationRejection {
    pub result: AssociationRjResult,
    pub source: AssociationRjSource,
}

impl std::fmt::Display for AssociationRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?} rejection, {}", self.result, self.source)
    }
}

/// Error types that can occur during DIMSE operations
#[derive(Error, Debug)]
pub enum DimseError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid AE Title: {0}")]
    InvalidAeTitle(String),

    #[error("Network error: {0}")]
    Network(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Association rejected: {0}")]
    AssociationRejected(AssociationRejection),

    #[error("No acceptable presentation context")]
    NoAcceptablePresentationContext,

    #[error("No accepted presentation context for abstract syntax {0}")]
    NoPresentationContext(String),

    #[error("Association timed out waiting for {0}")]
    AssociationTimeout(TimeoutStage),

    #[error("Association aborted by peer: {0}")]
    PeerAbort(AbortSource),

    #[error("Association aborted locally: {0}")]
    LocalAbort(String),

    #[error("Invalid association state: {0}")]
    InvalidState(String),

    #[error("Association released by peer")]
    PeerReleased,

    #[error("{command} failed with status {status}{}", comment.as_deref().map(|c| format!(": {c}")).unwrap_or_default())]
    OperationFailed {
        command: &'static str,
        status: Status,
        comment: Option<String>,
    },

    #[error("C-STORE failed: {reason} ({status})")]
    StoreFailed { reason: StoreFailure, status: Status },

    #[error("Operation cancelled")]
    Cancelled,

    #[cfg(feature = "tls")]
    #[error("TLS error: {0}")]
    Tls(#[from] tokio_rustls::rustls::Error),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Operation not supported: {0}")]
    NotSupported(String),
}

impl DimseError {
    /// Create a new configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a new internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Create a new invalid state error
    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Self::InvalidState(msg.into())
    }

    /// Whether the error left the association unusable.
    ///
    /// Status-level failures keep the association established; everything on
    /// the wire or state-machine side does not.
    pub fn is_fatal_to_association(&self) -> bool {
        !matches!(
            self,
            DimseError::OperationFailed { .. }
                | DimseError::StoreFailed { .. }
                | DimseError::NoPresentationContext(_)
                | DimseError::InvalidState(_)
        )
    }
}
