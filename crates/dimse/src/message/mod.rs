//! DIMSE messages: a command set plus an optional opaque data set.

mod command;
mod fragment;
mod reassembly;

use bytes::Bytes;

pub use command::{tags, CommandSet, CommandValue, Tag, NO_DATA_SET};
pub use fragment::{fragment_message, max_pdv_payload};
pub use reassembly::{ReceivedMessage, Reassembler};

use crate::error::ProtocolError;

/// Data set presence marker used when a data set follows the command.
pub const DATA_SET_PRESENT: u16 = 0x0000;

/// The CommandField (0000,0100) values this engine speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandField {
    CStoreRq,
    CStoreRsp,
    CGetRq,
    CGetRsp,
    CFindRq,
    CFindRsp,
    CMoveRq,
    CMoveRsp,
    CEchoRq,
    CEchoRsp,
    CCancelRq,
}

impl CommandField {
    pub const fn code(self) -> u16 {
        match self {
            CommandField::CStoreRq => 0x0001,
            CommandField::CStoreRsp => 0x8001,
            CommandField::CGetRq => 0x0010,
            CommandField::CGetRsp => 0x8010,
            CommandField::CFindRq => 0x0020,
            CommandField::CFindRsp => 0x8020,
            CommandField::CMoveRq => 0x0021,
            CommandField::CMoveRsp => 0x8021,
            CommandField::CEchoRq => 0x0030,
            CommandField::CEchoRsp => 0x8030,
            CommandField::CCancelRq => 0x0FFF,
        }
    }

    pub fn from_code(code: u16) -> Option<Self> {
        Some(match code {
            0x0001 => CommandField::CStoreRq,
            0x8001 => CommandField::CStoreRsp,
            0x0010 => CommandField::CGetRq,
            0x8010 => CommandField::CGetRsp,
            0x0020 => CommandField::CFindRq,
            0x8020 => CommandField::CFindRsp,
            0x0021 => CommandField::CMoveRq,
            0x8021 => CommandField::CMoveRsp,
            0x0030 => CommandField::CEchoRq,
            0x8030 => CommandField::CEchoRsp,
            0x0FFF => CommandField::CCancelRq,
            _ => return None,
        })
    }

    pub const fn name(self) -> &'static str {
        match self {
            CommandField::CStoreRq => "C-STORE-RQ",
            CommandField::CStoreRsp => "C-STORE-RSP",
            CommandField::CGetRq => "C-GET-RQ",
            CommandField::CGetRsp => "C-GET-RSP",
            CommandField::CFindRq => "C-FIND-RQ",
            CommandField::CFindRsp => "C-FIND-RSP",
            CommandField::CMoveRq => "C-MOVE-RQ",
            CommandField::CMoveRsp => "C-MOVE-RSP",
            CommandField::CEchoRq => "C-ECHO-RQ",
            CommandField::CEchoRsp => "C-ECHO-RSP",
            CommandField::CCancelRq => "C-CANCEL-RQ",
        }
    }

    pub const fn is_response(self) -> bool {
        self.code() & 0x8000 != 0
    }
}

/// One DIMSE message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DimseMessage {
    pub command: CommandSet,
    /// Encoded in the transfer syntax of the presentation context; never
    /// interpreted by this crate.
    pub data: Option<Bytes>,
}

impl DimseMessage {
    /// Build a message, setting CommandDataSetType to match `data`.
    pub fn new(mut command: CommandSet, data: Option<Bytes>) -> Self {
        let marker = if data.is_some() {
            DATA_SET_PRESENT
        } else {
            NO_DATA_SET
        };
        command.insert(tags::COMMAND_DATA_SET_TYPE, CommandValue::U16(marker));
        Self { command, data }
    }

    pub fn command_field(&self) -> Result<CommandField, ProtocolError> {
        let code = self.command.command_field()?;
        CommandField::from_code(code).ok_or_else(|| {
            ProtocolError::InvalidCommandSet(format!("unsupported command field 0x{code:04X}"))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_field_codes() {
        for field in [
            CommandField::CStoreRq,
            CommandField::CGetRsp,
            CommandField::CFindRq,
            CommandField::CMoveRsp,
            CommandField::CEchoRq,
            CommandField::CCancelRq,
        ] {
            assert_eq!(CommandField::from_code(field.code()), Some(field));
        }
        assert!(CommandField::CEchoRsp.is_response());
        assert!(!CommandField::CCancelRq.is_response());
        assert_eq!(CommandField::from_code(0x0100), None);
    }

    #[test]
    fn test_new_sets_data_set_type() {
        let with = DimseMessage::new(CommandSet::new(), Some(Bytes::from_static(b"ab")));
        assert!(with.command.has_data_set());
        let without = DimseMessage::new(CommandSet::new(), None);
        assert!(!without.command.has_data_set());
        assert_eq!(
            without.command.get_u16(tags::COMMAND_DATA_SET_TYPE),
            Some(NO_DATA_SET)
        );
    }
}
