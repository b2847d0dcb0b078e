//! Command Sets: the `(0000,xxxx)` group that heads every DIMSE message.
//!
//! Always Implicit VR Little Endian on the wire, whatever transfer syntax the
//! presentation context negotiated.

use std::collections::BTreeMap;

use bytes::{BufMut, Bytes, BytesMut};
pub use dicom_core::Tag;

use crate::error::ProtocolError;
use crate::status::Status;

/// Command element tags (PS3.7 Annex E).
pub mod tags {
    use dicom_core::Tag;

    pub const COMMAND_GROUP_LENGTH: Tag = Tag(0x0000, 0x0000);
    pub const AFFECTED_SOP_CLASS_UID: Tag = Tag(0x0000, 0x0002);
    pub const REQUESTED_SOP_CLASS_UID: Tag = Tag(0x0000, 0x0003);
    pub const COMMAND_FIELD: Tag = Tag(0x0000, 0x0100);
    pub const MESSAGE_ID: Tag = Tag(0x0000, 0x0110);
    pub const MESSAGE_ID_BEING_RESPONDED_TO: Tag = Tag(0x0000, 0x0120);
    pub const MOVE_DESTINATION: Tag = Tag(0x0000, 0x0600);
    pub const PRIORITY: Tag = Tag(0x0000, 0x0700);
    pub const COMMAND_DATA_SET_TYPE: Tag = Tag(0x0000, 0x0800);
    pub const STATUS: Tag = Tag(0x0000, 0x0900);
    pub const OFFENDING_ELEMENT: Tag = Tag(0x0000, 0x0901);
    pub const ERROR_COMMENT: Tag = Tag(0x0000, 0x0902);
    pub const ERROR_ID: Tag = Tag(0x0000, 0x0903);
    pub const AFFECTED_SOP_INSTANCE_UID: Tag = Tag(0x0000, 0x1000);
    pub const REQUESTED_SOP_INSTANCE_UID: Tag = Tag(0x0000, 0x1001);
    pub const NUMBER_OF_REMAINING_SUBOPERATIONS: Tag = Tag(0x0000, 0x1020);
    pub const NUMBER_OF_COMPLETED_SUBOPERATIONS: Tag = Tag(0x0000, 0x1021);
    pub const NUMBER_OF_FAILED_SUBOPERATIONS: Tag = Tag(0x0000, 0x1022);
    pub const NUMBER_OF_WARNING_SUBOPERATIONS: Tag = Tag(0x0000, 0x1023);
    pub const MOVE_ORIGINATOR_APPLICATION_ENTITY_TITLE: Tag = Tag(0x0000, 0x1030);
    pub const MOVE_ORIGINATOR_MESSAGE_ID: Tag = Tag(0x0000, 0x1031);
}

/// CommandDataSetType value meaning "no data set follows".
pub const NO_DATA_SET: u16 = 0x0101;

/// Value representation of the command elements this layer understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CommandVr {
    Us,
    Ul,
    Ui,
    Ae,
    Lo,
    Other,
}

fn command_vr(tag: Tag) -> CommandVr {
    use tags::*;
    match tag {
        COMMAND_GROUP_LENGTH => CommandVr::Ul,
        AFFECTED_SOP_CLASS_UID
        | REQUESTED_SOP_CLASS_UID
        | AFFECTED_SOP_INSTANCE_UID
        | REQUESTED_SOP_INSTANCE_UID => CommandVr::Ui,
        COMMAND_FIELD
        | MESSAGE_ID
        | MESSAGE_ID_BEING_RESPONDED_TO
        | PRIORITY
        | COMMAND_DATA_SET_TYPE
        | STATUS
        | ERROR_ID
        | NUMBER_OF_REMAINING_SUBOPERATIONS
        | NUMBER_OF_COMPLETED_SUBOPERATIONS
        | NUMBER_OF_FAILED_SUBOPERATIONS
        | NUMBER_OF_WARNING_SUBOPERATIONS
        | MOVE_ORIGINATOR_MESSAGE_ID => CommandVr::Us,
        MOVE_DESTINATION | MOVE_ORIGINATOR_APPLICATION_ENTITY_TITLE => CommandVr::Ae,
        ERROR_COMMENT => CommandVr::Lo,
        _ => CommandVr::Other,
    }
}

/// Value of one command element.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandValue {
    U16(u16),
    U32(u32),
    Uid(String),
    Ae(String),
    Text(String),
    /// Elements outside the understood set, carried verbatim.
    Bytes(Bytes),
}

impl CommandValue {
    fn encode(&self, buf: &mut BytesMut) {
        match self {
            CommandValue::U16(v) => buf.put_u16_le(*v),
            CommandValue::U32(v) => buf.put_u32_le(*v),
            CommandValue::Uid(s) => put_padded(buf, s, 0),
            CommandValue::Ae(s) | CommandValue::Text(s) => put_padded(buf, s, b' '),
            CommandValue::Bytes(b) => buf.extend_from_slice(b),
        }
    }

    fn encoded_len(&self) -> usize {
        match self {
            CommandValue::U16(_) => 2,
            CommandValue::U32(_) => 4,
            CommandValue::Uid(s) | CommandValue::Ae(s) | CommandValue::Text(s) => {
                s.len() + s.len() % 2
            }
            CommandValue::Bytes(b) => b.len(),
        }
    }
}

fn put_padded(buf: &mut BytesMut, value: &str, pad: u8) {
    buf.extend_from_slice(value.as_bytes());
    if value.len() % 2 == 1 {
        buf.put_u8(pad);
    }
}

/// An ordered map of command elements.
///
/// The group length element is derived on encoding and dropped on decoding,
/// so it never appears in the map.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandSet {
    elements: BTreeMap<Tag, CommandValue>,
}

impl CommandSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, tag: Tag, value: CommandValue) -> Self {
        self.insert(tag, value);
        self
    }

    pub fn insert(&mut self, tag: Tag, value: CommandValue) {
        if tag != tags::COMMAND_GROUP_LENGTH {
            self.elements.insert(tag, value);
        }
    }

    pub fn get(&self, tag: Tag) -> Option<&CommandValue> {
        self.elements.get(&tag)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Tag, &CommandValue)> {
        self.elements.iter()
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    pub fn get_u16(&self, tag: Tag) -> Option<u16> {
        match self.elements.get(&tag)? {
            CommandValue::U16(v) => Some(*v),
            _ => None,
        }
    }

    pub fn get_str(&self, tag: Tag) -> Option<&str> {
        match self.elements.get(&tag)? {
            CommandValue::Uid(s) | CommandValue::Ae(s) | CommandValue::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Like [`get_u16`](Self::get_u16) but a missing element is a protocol error.
    pub fn require_u16(&self, tag: Tag) -> Result<u16, ProtocolError> {
        self.get_u16(tag).ok_or_else(|| {
            ProtocolError::InvalidCommandSet(format!("missing or mistyped element {tag}"))
        })
    }

    pub fn command_field(&self) -> Result<u16, ProtocolError> {
        self.require_u16(tags::COMMAND_FIELD)
    }

    pub fn message_id(&self) -> Result<u16, ProtocolError> {
        self.require_u16(tags::MESSAGE_ID)
    }

    pub fn message_id_being_responded_to(&self) -> Result<u16, ProtocolError> {
        self.require_u16(tags::MESSAGE_ID_BEING_RESPONDED_TO)
    }

    pub fn status(&self) -> Result<Status, ProtocolError> {
        self.require_u16(tags::STATUS).map(Status::new)
    }

    pub fn affected_sop_class_uid(&self) -> Option<&str> {
        self.get_str(tags::AFFECTED_SOP_CLASS_UID)
    }

    pub fn affected_sop_instance_uid(&self) -> Option<&str> {
        self.get_str(tags::AFFECTED_SOP_INSTANCE_UID)
    }

    pub fn error_comment(&self) -> Option<&str> {
        self.get_str(tags::ERROR_COMMENT)
    }

    /// Whether CommandDataSetType announces a data set. A missing element
    /// is read as "no data set".
    pub fn has_data_set(&self) -> bool {
        self.get_u16(tags::COMMAND_DATA_SET_TYPE)
            .map(|v| v != NO_DATA_SET)
            .unwrap_or(false)
    }

    /// Serialise as Implicit VR Little Endian, group length first.
    pub fn encode(&self) -> Bytes {
        let body_len: usize = self
            .elements
            .values()
            .map(|v| 8 + v.encoded_len())
            .sum();
        let mut buf = BytesMut::with_capacity(12 + body_len);
        write_header(&mut buf, tags::COMMAND_GROUP_LENGTH, 4);
        buf.put_u32_le(body_len as u32);
        for (tag, value) in &self.elements {
            write_header(&mut buf, *tag, value.encoded_len() as u32);
            value.encode(&mut buf);
        }
        buf.freeze()
    }

    /// Parse an Implicit VR Little Endian command group.
    pub fn decode(data: &[u8]) -> Result<Self, ProtocolError> {
        let mut set = CommandSet::new();
        let mut pos = 0usize;
        while pos < data.len() {
            if data.len() - pos < 8 {
                return Err(ProtocolError::InvalidCommandSet(format!(
                    "{} stray bytes at end of command set",
                    data.len() - pos
                )));
            }
            let group = u16::from_le_bytes([data[pos], data[pos + 1]]);
            let element = u16::from_le_bytes([data[pos + 2], data[pos + 3]]);
            let length = u32::from_le_bytes([
                data[pos + 4],
                data[pos + 5],
                data[pos + 6],
                data[pos + 7],
            ]) as usize;
            pos += 8;
            let tag = Tag(group, element);
            if group != 0x0000 {
                return Err(ProtocolError::InvalidCommandSet(format!(
                    "element {tag} outside the command group"
                )));
            }
            if data.len() - pos < length {
                return Err(ProtocolError::InvalidCommandSet(format!(
                    "element {tag} declares {length} bytes, {} available",
                    data.len() - pos
                )));
            }
            let raw = &data[pos..pos + length];
            pos += length;

            let value = match (command_vr(tag), length) {
                (CommandVr::Ul, 4) => {
                    CommandValue::U32(u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]))
                }
                (CommandVr::Us, 2) => CommandValue::U16(u16::from_le_bytes([raw[0], raw[1]])),
                (CommandVr::Ui, _) => CommandValue::Uid(decode_text(raw, tag)?),
                (CommandVr::Ae, _) => CommandValue::Ae(decode_text(raw, tag)?.trim_start().to_string()),
                (CommandVr::Lo, _) => CommandValue::Text(decode_text(raw, tag)?),
                (CommandVr::Us | CommandVr::Ul, _) => {
                    return Err(ProtocolError::InvalidCommandSet(format!(
                        "element {tag} has unexpected length {length}"
                    )))
                }
                (CommandVr::Other, _) => CommandValue::Bytes(Bytes::copy_from_slice(raw)),
            };
            set.insert(tag, value);
        }
        Ok(set)
    }
}

fn write_header(buf: &mut BytesMut, tag: Tag, length: u32) {
    buf.put_u16_le(tag.group());
    buf.put_u16_le(tag.element());
    buf.put_u32_le(length);
}

fn decode_text(raw: &[u8], tag: Tag) -> Result<String, ProtocolError> {
    let s = std::str::from_utf8(raw)
        .map_err(|_| ProtocolError::InvalidCommandSet(format!("element {tag} is not ASCII")))?;
    Ok(s.trim_end_matches(['\0', ' ']).to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn echo_rq() -> CommandSet {
        CommandSet::new()
            .with(tags::AFFECTED_SOP_CLASS_UID, CommandValue::Uid("1.2.840.10008.1.1".into()))
            .with(tags::COMMAND_FIELD, CommandValue::U16(0x0030))
            .with(tags::MESSAGE_ID, CommandValue::U16(7))
            .with(tags::COMMAND_DATA_SET_TYPE, CommandValue::U16(NO_DATA_SET))
    }

    #[test]
    fn test_echo_rq_bytes() {
        let bytes = echo_rq().encode();
        // group length element
        assert_eq!(&bytes[..8], &[0, 0, 0, 0, 4, 0, 0, 0]);
        let group_length = u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]);
        assert_eq!(group_length as usize, bytes.len() - 12);
        // "1.2.840.10008.1.1" is 17 chars, padded with a NUL to 18
        assert_eq!(&bytes[12..20], &[0, 0, 2, 0, 18, 0, 0, 0]);
        assert_eq!(bytes[20 + 17], 0);
    }

    #[test]
    fn test_decode_round_trip_drops_group_length() {
        let set = echo_rq()
            .with(tags::MOVE_DESTINATION, CommandValue::Ae("STORE_SCP".into()))
            .with(tags::ERROR_COMMENT, CommandValue::Text("odd".into()))
            .with(Tag(0x0000, 0x5010), CommandValue::Bytes(Bytes::from_static(&[1, 2])));
        let decoded = CommandSet::decode(&set.encode()).unwrap();
        assert_eq!(decoded, set);
        assert!(decoded.get(tags::COMMAND_GROUP_LENGTH).is_none());
    }

    #[test]
    fn test_accessors() {
        let set = echo_rq();
        assert_eq!(set.command_field().unwrap(), 0x0030);
        assert_eq!(set.message_id().unwrap(), 7);
        assert_eq!(set.affected_sop_class_uid(), Some("1.2.840.10008.1.1"));
        assert!(!set.has_data_set());
        assert!(set.status().is_err());
    }

    #[test]
    fn test_non_command_group_rejected() {
        let bytes = [0x08, 0x00, 0x18, 0x00, 0, 0, 0, 0];
        assert!(matches!(
            CommandSet::decode(&bytes),
            Err(ProtocolError::InvalidCommandSet(_))
        ));
    }

    #[test]
    fn test_overrunning_element_rejected() {
        let bytes = [0x00, 0x00, 0x00, 0x01, 10, 0, 0, 0, 0x30, 0x00];
        assert!(CommandSet::decode(&bytes).is_err());
    }
}
