//! DIMSE-C service operations over an established [`Association`].
//!
//! Each operation allocates a Message ID, sends its request on the context
//! negotiated for the SOP class and checks that every response echoes that ID
//! in MessageIDBeingRespondedTo. A response for another ID, or of the wrong
//! command, is a protocol error and aborts the association.

pub mod cancel;
pub mod echo;
pub mod find;
pub mod retrieve;
pub mod store;

pub use cancel::send_cancel;
pub use echo::echo;
pub use find::{find, FindOperation, FindResponse};
pub use retrieve::{
    get, move_request, FailedInstance, RetrieveEvent, RetrieveOperation, RetrieveOutcome,
};
pub use store::{
    handle_store_request, store, ReceivedInstance, StoreFailure, StoreHandler, StoreOutcome,
    StoreRequest, StoreResult, StoreWarning,
};

use crate::association::Association;
use crate::error::{DimseError, ProtocolError, Result};
use crate::message::{tags, CommandField, CommandSet, CommandValue, DimseMessage, ReceivedMessage};
use crate::status::Status;

/// Command set of a request.
pub(crate) fn request_command(
    field: CommandField,
    message_id: u16,
    affected_sop_class_uid: &str,
) -> CommandSet {
    CommandSet::new()
        .with(
            tags::AFFECTED_SOP_CLASS_UID,
            CommandValue::Uid(affected_sop_class_uid.to_string()),
        )
        .with(tags::COMMAND_FIELD, CommandValue::U16(field.code()))
        .with(tags::MESSAGE_ID, CommandValue::U16(message_id))
}

/// Command set of a response to `request`.
pub fn response_command(field: CommandField, request: &CommandSet, status: Status) -> CommandSet {
    let mut command = CommandSet::new()
        .with(tags::COMMAND_FIELD, CommandValue::U16(field.code()))
        .with(tags::STATUS, CommandValue::U16(status.code()));
    if let Some(uid) = request.affected_sop_class_uid() {
        command.insert(tags::AFFECTED_SOP_CLASS_UID, CommandValue::Uid(uid.to_string()));
    }
    if let Ok(id) = request.message_id() {
        command.insert(tags::MESSAGE_ID_BEING_RESPONDED_TO, CommandValue::U16(id));
    }
    command
}

/// Validate a response and return its status.
///
/// Mismatched command fields or message IDs abort the association.
pub(crate) async fn check_response(
    association: &mut Association,
    received: &ReceivedMessage,
    expected: CommandField,
    message_id: u16,
) -> Result<Status> {
    match validate_response(&received.message, expected, message_id) {
        Ok(status) => Ok(status),
        Err(e) => {
            association.abort().await;
            Err(e.into())
        }
    }
}

fn validate_response(
    message: &DimseMessage,
    expected: CommandField,
    message_id: u16,
) -> std::result::Result<Status, ProtocolError> {
    let actual = message.command.command_field()?;
    if actual != expected.code() {
        return Err(ProtocolError::UnexpectedCommand {
            expected: expected.code(),
            actual,
        });
    }
    let responded_to = message.command.message_id_being_responded_to()?;
    if responded_to != message_id {
        return Err(ProtocolError::UnexpectedMessageId {
            expected: message_id,
            actual: responded_to,
        });
    }
    message.command.status()
}

/// Turn a non-success terminal status into `OperationFailed`.
pub(crate) fn failure(command: &'static str, message: &DimseMessage, status: Status) -> DimseError {
    DimseError::OperationFailed {
        command,
        status,
        comment: message.command.error_comment().map(str::to_string),
    }
}

#[cfg(test)]
pub(crate) mod testing;
