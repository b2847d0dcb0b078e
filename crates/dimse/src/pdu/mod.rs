//! Upper Layer protocol data units.
//!
//! The seven PDU types of DICOM PS3.8 Annex B and their items. Values are
//! plain data; [`reader::read_pdu`] and [`writer::write_pdu`] do the byte work
//! and [`codec::PduCodec`] frames them on a stream.

use std::fmt;

use bytes::Bytes;

pub mod codec;
pub mod reader;
pub mod writer;

pub use codec::PduCodec;
pub use reader::read_pdu;
pub use writer::{encode_pdu, write_pdu};

/// `{type: u8, reserved: u8, length: u32}`
pub const PDU_HEADER_SIZE: usize = 6;

/// `{item length: u32, context id: u8, message control header: u8}`
pub const PDV_HEADER_SIZE: usize = 6;

/// Smallest maximum length this implementation will announce or honour.
pub const MINIMUM_PDU_SIZE: u32 = 4096;

/// Default maximum length announced in the Maximum Length sub-item.
pub const DEFAULT_MAX_PDU: u32 = 16384;

/// Largest maximum length accepted in configuration.
pub const MAXIMUM_PDU_SIZE: u32 = 4 * 1024 * 1024;

/// The only application context defined by the standard.
pub const DICOM_APPLICATION_CONTEXT: &str = "1.2.840.10008.3.1.1.1";

/// Upper Layer protocol version 1.
pub const PROTOCOL_VERSION: u16 = 0x0001;

pub(crate) mod item_type {
    pub const APPLICATION_CONTEXT: u8 = 0x10;
    pub const PRESENTATION_CONTEXT_RQ: u8 = 0x20;
    pub const PRESENTATION_CONTEXT_AC: u8 = 0x21;
    pub const ABSTRACT_SYNTAX: u8 = 0x30;
    pub const TRANSFER_SYNTAX: u8 = 0x40;
    pub const USER_INFORMATION: u8 = 0x50;
    pub const MAX_LENGTH: u8 = 0x51;
    pub const IMPLEMENTATION_CLASS_UID: u8 = 0x52;
    pub const ASYNC_OPERATIONS_WINDOW: u8 = 0x53;
    pub const ROLE_SELECTION: u8 = 0x54;
    pub const IMPLEMENTATION_VERSION_NAME: u8 = 0x55;
    pub const SOP_CLASS_EXTENDED_NEGOTIATION: u8 = 0x56;
    pub const USER_IDENTITY_RQ: u8 = 0x58;
    pub const USER_IDENTITY_AC: u8 = 0x59;
}

pub(crate) mod pdu_type {
    pub const ASSOCIATE_RQ: u8 = 0x01;
    pub const ASSOCIATE_AC: u8 = 0x02;
    pub const ASSOCIATE_RJ: u8 = 0x03;
    pub const P_DATA_TF: u8 = 0x04;
    pub const RELEASE_RQ: u8 = 0x05;
    pub const RELEASE_RP: u8 = 0x06;
    pub const ABORT_RQ: u8 = 0x07;
}

/// An Upper Layer PDU.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Pdu {
    AssociationRq(AssociationRq),
    AssociationAc(AssociationAc),
    AssociationRj(AssociationRj),
    PData { data: Vec<PDataValue> },
    ReleaseRq,
    ReleaseRp,
    AbortRq { source: AbortSource },
}

impl Pdu {
    /// One-line description for logs; never includes payload bytes.
    pub fn short_description(&self) -> String {
        match self {
            Pdu::AssociationRq(rq) => format!(
                "A-ASSOCIATE-RQ {} -> {} ({} contexts)",
                rq.calling_ae_title,
                rq.called_ae_title,
                rq.presentation_contexts.len()
            ),
            Pdu::AssociationAc(ac) => format!(
                "A-ASSOCIATE-AC ({} contexts, {} accepted)",
                ac.presentation_contexts.len(),
                ac.presentation_contexts
                    .iter()
                    .filter(|pc| pc.reason == PresentationContextResultReason::Acceptance)
                    .count()
            ),
            Pdu::AssociationRj(rj) => format!("A-ASSOCIATE-RJ {:?} {}", rj.result, rj.source),
            Pdu::PData { data } => {
                let bytes: usize = data.iter().map(|pdv| pdv.data.len()).sum();
                format!("P-DATA-TF ({} PDVs, {} bytes)", data.len(), bytes)
            }
            Pdu::ReleaseRq => "A-RELEASE-RQ".to_string(),
            Pdu::ReleaseRp => "A-RELEASE-RP".to_string(),
            Pdu::AbortRq { source } => format!("A-ABORT ({})", source),
        }
    }
}

/// A-ASSOCIATE-RQ
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssociationRq {
    pub protocol_version: u16,
    pub calling_ae_title: String,
    pub called_ae_title: String,
    pub application_context_name: String,
    pub presentation_contexts: Vec<PresentationContextProposed>,
    pub user_variables: Vec<UserVariableItem>,
}

/// A-ASSOCIATE-AC
///
/// The AE title fields are reserved in the AC but peers echo the request's
/// values, so they are kept for interoperability.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssociationAc {
    pub protocol_version: u16,
    pub calling_ae_title: String,
    pub called_ae_title: String,
    pub application_context_name: String,
    pub presentation_contexts: Vec<PresentationContextResult>,
    pub user_variables: Vec<UserVariableItem>,
}

/// A-ASSOCIATE-RJ
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AssociationRj {
    pub result: AssociationRjResult,
    pub source: AssociationRjSource,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssociationRjResult {
    Permanent,
    Transient,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssociationRjSource {
    ServiceUser(AssociationRjServiceUserReason),
    ServiceProviderAcse(AssociationRjServiceProviderAcseReason),
    ServiceProviderPresentation(AssociationRjServiceProviderPresentationReason),
}

impl fmt::Display for AssociationRjSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AssociationRjSource::ServiceUser(reason) => write!(f, "service user: {:?}", reason),
            AssociationRjSource::ServiceProviderAcse(reason) => {
                write!(f, "service provider (ACSE): {:?}", reason)
            }
            AssociationRjSource::ServiceProviderPresentation(reason) => {
                write!(f, "service provider (presentation): {:?}", reason)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssociationRjServiceUserReason {
    NoReasonGiven,
    ApplicationContextNameNotSupported,
    CallingAeTitleNotRecognized,
    CalledAeTitleNotRecognized,
    Reserved(u8),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssociationRjServiceProviderAcseReason {
    NoReasonGiven,
    ProtocolVersionNotSupported,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssociationRjServiceProviderPresentationReason {
    TemporaryCongestion,
    LocalLimitExceeded,
    Reserved(u8),
}

/// Source field of an A-ABORT.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortSource {
    ServiceUser,
    Reserved,
    ServiceProvider(AbortReason),
}

impl fmt::Display for AbortSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AbortSource::ServiceUser => f.write_str("service user"),
            AbortSource::Reserved => f.write_str("reserved source"),
            AbortSource::ServiceProvider(reason) => write!(f, "service provider: {:?}", reason),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    ReasonNotSpecified,
    UnrecognizedPdu,
    UnexpectedPdu,
    Reserved,
    UnrecognizedPduParameter,
    UnexpectedPduParameter,
    InvalidPduParameter,
}

/// Presentation context as proposed in an A-ASSOCIATE-RQ.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresentationContextProposed {
    pub id: u8,
    pub abstract_syntax: String,
    pub transfer_syntaxes: Vec<String>,
}

/// Presentation context as answered in an A-ASSOCIATE-AC.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresentationContextResult {
    pub id: u8,
    pub reason: PresentationContextResultReason,
    pub transfer_syntax: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentationContextResultReason {
    Acceptance,
    UserRejection,
    NoReason,
    AbstractSyntaxNotSupported,
    TransferSyntaxesNotSupported,
}

impl PresentationContextResultReason {
    pub(crate) fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            0 => Self::Acceptance,
            1 => Self::UserRejection,
            2 => Self::NoReason,
            3 => Self::AbstractSyntaxNotSupported,
            4 => Self::TransferSyntaxesNotSupported,
            _ => return None,
        })
    }

    pub(crate) fn to_u8(self) -> u8 {
        match self {
            Self::Acceptance => 0,
            Self::UserRejection => 1,
            Self::NoReason => 2,
            Self::AbstractSyntaxNotSupported => 3,
            Self::TransferSyntaxesNotSupported => 4,
        }
    }
}

/// Sub-items of the User Information item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UserVariableItem {
    MaxLength(u32),
    ImplementationClassUid(String),
    ImplementationVersionName(String),
    AsyncOperationsWindow {
        max_invoked: u16,
        max_performed: u16,
    },
    RoleSelection(RoleSelection),
    SopClassExtendedNegotiation {
        sop_class_uid: String,
        data: Bytes,
    },
    UserIdentity(UserIdentity),
    UserIdentityResponse(Bytes),
    /// Anything not understood, kept verbatim.
    Unknown(u8, Bytes),
}

/// SCP/SCU Role Selection sub-item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoleSelection {
    pub sop_class_uid: String,
    pub scu_role: bool,
    pub scp_role: bool,
}

/// User Identity negotiation request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserIdentity {
    pub identity_type: UserIdentityType,
    pub positive_response_requested: bool,
    pub primary_field: Bytes,
    pub secondary_field: Bytes,
}

impl UserIdentity {
    pub fn username(username: impl Into<String>) -> Self {
        Self {
            identity_type: UserIdentityType::Username,
            positive_response_requested: false,
            primary_field: Bytes::from(username.into()),
            secondary_field: Bytes::new(),
        }
    }

    pub fn username_password(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            identity_type: UserIdentityType::UsernamePassword,
            positive_response_requested: false,
            primary_field: Bytes::from(username.into()),
            secondary_field: Bytes::from(password.into()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserIdentityType {
    Username,
    UsernamePassword,
    KerberosServiceTicket,
    SamlAssertion,
    Jwt,
}

impl UserIdentityType {
    pub(crate) fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            1 => Self::Username,
            2 => Self::UsernamePassword,
            3 => Self::KerberosServiceTicket,
            4 => Self::SamlAssertion,
            5 => Self::Jwt,
            _ => return None,
        })
    }

    pub(crate) fn to_u8(self) -> u8 {
        match self {
            Self::Username => 1,
            Self::UsernamePassword => 2,
            Self::KerberosServiceTicket => 3,
            Self::SamlAssertion => 4,
            Self::Jwt => 5,
        }
    }
}

/// One Presentation Data Value inside a P-DATA-TF.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PDataValue {
    pub presentation_context_id: u8,
    pub value_type: PDataValueType,
    pub is_last: bool,
    pub data: Bytes,
}

impl PDataValue {
    pub fn is_command(&self) -> bool {
        self.value_type == PDataValueType::Command
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PDataValueType {
    Command,
    Data,
}
