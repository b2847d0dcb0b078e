use tracing::debug;

use crate::association::Association;
use crate::error::Result;
use crate::message::{tags, CommandField, CommandSet, CommandValue, DimseMessage};

/// Send C-CANCEL-RQ for the outstanding request `message_id`.
///
/// The peer answers through the pending operation's own response stream,
/// typically with a final Cancel (0xFE00) status.
pub async fn send_cancel(
    association: &mut Association,
    presentation_context_id: u8,
    message_id: u16,
) -> Result<()> {
    let command = CommandSet::new()
        .with(tags::COMMAND_FIELD, CommandValue::U16(CommandField::CCancelRq.code()))
        .with(tags::MESSAGE_ID_BEING_RESPONDED_TO, CommandValue::U16(message_id));
    debug!("Sending C-CANCEL-RQ for message ID {}", message_id);
    association
        .send_message(presentation_context_id, &DimseMessage::new(command, None))
        .await
}
