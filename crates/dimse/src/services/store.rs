//! C-STORE, both directions.

use std::fmt;

use async_trait::async_trait;
use bytes::Bytes;
use serde::Serialize;
use tracing::{debug, info, warn};

use super::{check_response, request_command, response_command};
use crate::association::Association;
use crate::error::{DimseError, ProtocolError, Result};
use crate::message::{tags, CommandField, CommandValue, DimseMessage, ReceivedMessage};
use crate::status::{Status, StatusClass};
use crate::types::Priority;

/// Why a C-STORE completed with a warning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StoreWarning {
    CoercionOfDataElements,
    ElementsDiscarded,
    DataSetDoesNotMatchSopClass,
    Other(u16),
}

impl StoreWarning {
    pub fn from_status(status: Status) -> Self {
        match status.code() {
            0xB000 => StoreWarning::CoercionOfDataElements,
            0xB006 => StoreWarning::ElementsDiscarded,
            0xB007 => StoreWarning::DataSetDoesNotMatchSopClass,
            code => StoreWarning::Other(code),
        }
    }

    pub fn status(self) -> Status {
        Status::new(match self {
            StoreWarning::CoercionOfDataElements => 0xB000,
            StoreWarning::ElementsDiscarded => 0xB006,
            StoreWarning::DataSetDoesNotMatchSopClass => 0xB007,
            StoreWarning::Other(code) => code,
        })
    }
}

/// Why a C-STORE failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StoreFailure {
    OutOfResources,
    DataSetDoesNotMatchSopClass,
    CannotUnderstand,
    SopClassNotSupported,
    NotAuthorized,
    DuplicateSopInstance,
    InvalidObjectInstance,
    ProcessingFailure,
    Cancelled,
    Other(u16),
}

impl StoreFailure {
    pub fn from_status(status: Status) -> Self {
        match status.code() {
            0xA700..=0xA7FF => StoreFailure::OutOfResources,
            0xA900..=0xA9FF => StoreFailure::DataSetDoesNotMatchSopClass,
            0xC000..=0xCFFF => StoreFailure::CannotUnderstand,
            0x0122 => StoreFailure::SopClassNotSupported,
            0x0124 => StoreFailure::NotAuthorized,
            0x0111 => StoreFailure::DuplicateSopInstance,
            0x0117 => StoreFailure::InvalidObjectInstance,
            0x0110 => StoreFailure::ProcessingFailure,
            0xFE00 => StoreFailure::Cancelled,
            code => StoreFailure::Other(code),
        }
    }

    /// Status code sent back to a peer for this failure.
    pub fn status(self) -> Status {
        Status::new(match self {
            StoreFailure::OutOfResources => 0xA700,
            StoreFailure::DataSetDoesNotMatchSopClass => 0xA900,
            StoreFailure::CannotUnderstand => 0xC000,
            StoreFailure::SopClassNotSupported => 0x0122,
            StoreFailure::NotAuthorized => 0x0124,
            StoreFailure::DuplicateSopInstance => 0x0111,
            StoreFailure::InvalidObjectInstance => 0x0117,
            StoreFailure::ProcessingFailure => 0x0110,
            StoreFailure::Cancelled => 0xFE00,
            StoreFailure::Other(code) => code,
        })
    }
}

impl fmt::Display for StoreFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreFailure::OutOfResources => f.write_str("out of resources"),
            StoreFailure::DataSetDoesNotMatchSopClass => {
                f.write_str("data set does not match SOP class")
            }
            StoreFailure::CannotUnderstand => f.write_str("cannot understand"),
            StoreFailure::SopClassNotSupported => f.write_str("SOP class not supported"),
            StoreFailure::NotAuthorized => f.write_str("not authorized"),
            StoreFailure::DuplicateSopInstance => f.write_str("duplicate SOP instance"),
            StoreFailure::InvalidObjectInstance => f.write_str("invalid object instance"),
            StoreFailure::ProcessingFailure => f.write_str("processing failure"),
            StoreFailure::Cancelled => f.write_str("cancelled"),
            StoreFailure::Other(code) => write!(f, "status 0x{code:04X}"),
        }
    }
}

/// Non-failing C-STORE result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StoreOutcome {
    Success,
    Warning(StoreWarning),
}

impl StoreOutcome {
    pub fn status(self) -> Status {
        match self {
            StoreOutcome::Success => Status::SUCCESS,
            StoreOutcome::Warning(warning) => warning.status(),
        }
    }
}

pub type StoreResult = std::result::Result<StoreOutcome, StoreFailure>;

/// Map a C-STORE-RSP status onto the enumerated outcome.
pub fn classify_store_status(status: Status) -> StoreResult {
    match status.class() {
        StatusClass::Success => Ok(StoreOutcome::Success),
        StatusClass::Warning => Ok(StoreOutcome::Warning(StoreWarning::from_status(status))),
        _ => Err(StoreFailure::from_status(status)),
    }
}

/// One instance to send.
#[derive(Debug, Clone)]
pub struct StoreRequest {
    pub sop_class_uid: String,
    pub sop_instance_uid: String,
    /// Encoded in the transfer syntax accepted for `sop_class_uid`.
    pub data: Bytes,
    pub priority: Priority,
    /// Transfer syntax `data` is encoded in; when unset any accepted one is
    /// assumed to fit.
    pub transfer_syntax: Option<String>,
    /// Set when storing on behalf of a C-MOVE.
    pub move_originator: Option<(String, u16)>,
}

impl StoreRequest {
    pub fn new(
        sop_class_uid: impl Into<String>,
        sop_instance_uid: impl Into<String>,
        data: Bytes,
    ) -> Self {
        Self {
            sop_class_uid: sop_class_uid.into(),
            sop_instance_uid: sop_instance_uid.into(),
            data,
            priority: Priority::default(),
            transfer_syntax: None,
            move_originator: None,
        }
    }

    pub fn with_transfer_syntax(mut self, transfer_syntax: impl Into<String>) -> Self {
        self.transfer_syntax = Some(transfer_syntax.into());
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }
}

/// Send one instance and wait for the C-STORE-RSP.
///
/// Warnings are returned as outcomes; failures as `StoreFailed`.
pub async fn store(association: &mut Association, request: &StoreRequest) -> Result<StoreOutcome> {
    let context_id = match &request.transfer_syntax {
        None => association.context_for(&request.sop_class_uid)?.id,
        Some(ts) => association
            .contexts()
            .iter()
            .find(|c| {
                c.is_accepted() && c.abstract_syntax == request.sop_class_uid && &c.transfer_syntax == ts
            })
            .map(|c| c.id)
            .ok_or_else(|| {
                DimseError::NoPresentationContext(format!("{} in {}", request.sop_class_uid, ts))
            })?,
    };
    let message_id = association.next_message_id();
    let mut command = request_command(CommandField::CStoreRq, message_id, &request.sop_class_uid)
        .with(tags::PRIORITY, CommandValue::U16(request.priority.code()))
        .with(
            tags::AFFECTED_SOP_INSTANCE_UID,
            CommandValue::Uid(request.sop_instance_uid.clone()),
        );
    if let Some((ae_title, originator_id)) = &request.move_originator {
        command.insert(
            tags::MOVE_ORIGINATOR_APPLICATION_ENTITY_TITLE,
            CommandValue::Ae(ae_title.clone()),
        );
        command.insert(tags::MOVE_ORIGINATOR_MESSAGE_ID, CommandValue::U16(*originator_id));
    }
    let message = DimseMessage::new(command, Some(request.data.clone()));
    debug!(
        "Sending C-STORE-RQ for {} ({} bytes, message ID {})",
        request.sop_instance_uid,
        request.data.len(),
        message_id
    );
    association.send_message(context_id, &message).await?;

    let received = association.receive_message().await?;
    let status =
        check_response(association, &received, CommandField::CStoreRsp, message_id).await?;
    match classify_store_status(status) {
        Ok(outcome) => {
            if let StoreOutcome::Warning(warning) = outcome {
                warn!("C-STORE of {} completed with warning {:?}", request.sop_instance_uid, warning);
            } else {
                info!("Stored {} on {}", request.sop_instance_uid, association.peer_ae_title());
            }
            Ok(outcome)
        }
        Err(reason) => Err(DimseError::StoreFailed { reason, status }),
    }
}

/// An instance received through C-STORE.
#[derive(Debug, Clone)]
pub struct ReceivedInstance {
    pub calling_ae_title: String,
    pub sop_class_uid: String,
    pub sop_instance_uid: String,
    pub transfer_syntax: String,
    pub data: Bytes,
    pub move_originator: Option<(String, u16)>,
}

/// Accepts instances this side receives as C-STORE SCP.
#[async_trait]
pub trait StoreHandler: Send + Sync {
    async fn store(&self, instance: ReceivedInstance) -> StoreResult;
}

/// Answer an incoming C-STORE-RQ through `handler`.
///
/// Returns the instance UID and the handler's result so callers can count
/// sub-operations.
pub async fn handle_store_request<H: StoreHandler + ?Sized>(
    association: &mut Association,
    request: ReceivedMessage,
    handler: &H,
) -> Result<(String, StoreResult)> {
    let command = &request.message.command;
    let sop_class_uid = command.affected_sop_class_uid().unwrap_or_default().to_string();
    let sop_instance_uid = command
        .affected_sop_instance_uid()
        .unwrap_or_default()
        .to_string();
    let transfer_syntax = association
        .context(request.presentation_context_id)
        .map(|c| c.transfer_syntax.clone())
        .unwrap_or_default();
    let move_originator = command
        .get_str(tags::MOVE_ORIGINATOR_APPLICATION_ENTITY_TITLE)
        .zip(command.get_u16(tags::MOVE_ORIGINATOR_MESSAGE_ID))
        .map(|(ae, id)| (ae.to_string(), id));

    let Some(data) = request.message.data.clone() else {
        association.abort().await;
        return Err(ProtocolError::InvalidCommandSet("C-STORE-RQ without a data set".into()).into());
    };

    let result = handler
        .store(ReceivedInstance {
            calling_ae_title: association.peer_ae_title().to_string(),
            sop_class_uid,
            sop_instance_uid: sop_instance_uid.clone(),
            transfer_syntax,
            data,
            move_originator,
        })
        .await;
    let status = match result {
        Ok(outcome) => outcome.status(),
        Err(failure) => {
            warn!("Storing {} failed: {}", sop_instance_uid, failure);
            failure.status()
        }
    };
    let response = response_command(CommandField::CStoreRsp, command, status).with(
        tags::AFFECTED_SOP_INSTANCE_UID,
        CommandValue::Uid(sop_instance_uid.clone()),
    );
    association
        .send_message(request.presentation_context_id, &DimseMessage::new(response, None))
        .await?;
    Ok((sop_instance_uid, result))
}
