use std::collections::HashMap;

use bytes::{Bytes, BytesMut};
use tracing::trace;

use super::{CommandSet, DimseMessage};
use crate::error::ProtocolError;
use crate::pdu::PDataValue;

/// A reassembled message together with the context it arrived on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedMessage {
    pub presentation_context_id: u8,
    pub message: DimseMessage,
}

/// Rebuilds DIMSE messages from incoming PDVs.
///
/// Each presentation context reassembles independently, so fragments of
/// messages on different contexts may interleave. Within a context a data
/// fragment is only legal after the command it belongs to is complete and
/// announced a data set.
#[derive(Debug, Default)]
pub struct Reassembler {
    partial: HashMap<u8, Partial>,
}

#[derive(Debug, Default)]
struct Partial {
    command_buf: BytesMut,
    command: Option<CommandSet>,
    data_buf: BytesMut,
}

impl Reassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// True when no partial message is buffered.
    pub fn is_idle(&self) -> bool {
        self.partial.is_empty()
    }

    /// Feed one PDV. Returns a message when this PDV completed one.
    pub fn push(&mut self, pdv: PDataValue) -> Result<Option<ReceivedMessage>, ProtocolError> {
        let context_id = pdv.presentation_context_id;

        if pdv.is_command() {
            let partial = self.partial.entry(context_id).or_default();
            if partial.command.is_some() {
                return Err(ProtocolError::UnexpectedFragment {
                    context_id,
                    detail: "command fragment while a data set is expected".into(),
                });
            }
            partial.command_buf.extend_from_slice(&pdv.data);
            if !pdv.is_last {
                return Ok(None);
            }
            let decoded = CommandSet::decode(&partial.command_buf);
            partial.command_buf.clear();
            let command = match decoded {
                Ok(command) => command,
                Err(e) => {
                    self.partial.remove(&context_id);
                    return Err(e);
                }
            };
            if command.has_data_set() {
                trace!(context_id, "command complete, awaiting data set");
                partial.command = Some(command);
                return Ok(None);
            }
            self.partial.remove(&context_id);
            return Ok(Some(ReceivedMessage {
                presentation_context_id: context_id,
                message: DimseMessage {
                    command,
                    data: None,
                },
            }));
        }

        let Some(partial) = self
            .partial
            .get_mut(&context_id)
            .filter(|partial| partial.command.is_some())
        else {
            return Err(ProtocolError::UnexpectedFragment {
                context_id,
                detail: "data fragment without a completed command".into(),
            });
        };
        partial.data_buf.extend_from_slice(&pdv.data);
        if !pdv.is_last {
            return Ok(None);
        }
        let Some(Partial {
            command: Some(command),
            data_buf,
            ..
        }) = self.partial.remove(&context_id)
        else {
            return Ok(None);
        };
        let data: Bytes = data_buf.freeze();
        Ok(Some(ReceivedMessage {
            presentation_context_id: context_id,
            message: DimseMessage {
                command,
                data: Some(data),
            },
        }))
    }

    /// Drop any partial message.
    pub fn reset(&mut self) {
        self.partial.clear();
    }
}
