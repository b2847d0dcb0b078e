//! DIMSE (DICOM Message Service Element) implementation
//!
//! This crate implements the DICOM Upper Layer protocol and DIMSE messaging
//! over it: PDU encoding, presentation context negotiation, the association
//! state machine, message fragmentation and reassembly, and the DIMSE-C
//! services on top.
//!
//! # Features
//! - Outbound DIMSE services (SCU): C-ECHO, C-FIND, C-STORE, C-MOVE, C-GET, C-CANCEL
//! - Inbound DIMSE services (SCP): C-ECHO, C-FIND, C-STORE
//! - TLS support (optional, feature = "tls")
//! - Data sets pass through as opaque encoded bytes

pub mod association;
pub mod audit;
pub mod config;
pub mod error;
pub mod message;
pub mod negotiation;
pub mod pdu;
pub mod scp;
pub mod scu;
pub mod services;
pub mod status;
pub mod types;

#[cfg(feature = "tls")]
pub mod tls;

// Re-export commonly used types
pub use association::{Association, AssociationParameters, AssociationState, Connection};
pub use audit::{AuditEvent, AuditEventKind, AuditSink, MemoryAuditSink, TracingAuditSink};
pub use config::{DimseConfig, RemoteNode, TlsConfig};
pub use error::{DimseError, ProtocolError, Result, TimeoutStage};
pub use message::{CommandField, CommandSet, DimseMessage};
pub use scp::{BoundScp, DimseScp, ServiceProvider};
pub use scu::DimseScu;
pub use services::{
    FindResponse, ReceivedInstance, RetrieveOutcome, StoreFailure, StoreHandler, StoreOutcome,
    StoreRequest, StoreResult,
};
pub use status::{Status, StatusClass};
pub use types::{DimseCommand, Priority, QueryRetrieveModel, SubOperationCounters};

/// DIMSE protocol version
pub const DIMSE_VERSION: &str = "0.2.0";

/// Default DICOM port (non-TLS)
pub const DEFAULT_DIMSE_PORT: u16 = 11112;

/// Default TLS DICOM port
pub const DEFAULT_DIMSE_TLS_PORT: u16 = 2762;
