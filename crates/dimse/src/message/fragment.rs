use bytes::Bytes;

use super::DimseMessage;
use crate::error::ProtocolError;
use crate::pdu::{PDataValue, PDataValueType, MAXIMUM_PDU_SIZE, PDU_HEADER_SIZE, PDV_HEADER_SIZE};

/// Largest PDV payload that fits a P-DATA-TF of `max_pdu_length` bytes
/// carrying a single PDV. Zero means the peer set no limit.
pub fn max_pdv_payload(max_pdu_length: u32) -> Result<usize, ProtocolError> {
    let max: usize = match max_pdu_length {
        0 => MAXIMUM_PDU_SIZE as usize,
        n => n as usize,
    };
    max.checked_sub(PDU_HEADER_SIZE + PDV_HEADER_SIZE)
        .filter(|budget| *budget > 0)
        .ok_or_else(|| {
            ProtocolError::MalformedPdu(format!(
                "maximum PDU length {max_pdu_length} leaves no room for data"
            ))
        })
}

/// Split a message into PDVs whose P-DATA-TF encodings stay within
/// `max_pdu_length`. Command fragments come first; the last fragment of each
/// part carries the last flag. Empty parts still produce one PDV.
pub fn fragment_message(
    message: &DimseMessage,
    presentation_context_id: u8,
    max_pdu_length: u32,
) -> Result<Vec<PDataValue>, ProtocolError> {
    let budget = max_pdv_payload(max_pdu_length)?;
    let mut out = Vec::new();
    split(
        message.command.encode(),
        presentation_context_id,
        PDataValueType::Command,
        budget,
        &mut out,
    );
    if let Some(data) = &message.data {
        split(
            data.clone(),
            presentation_context_id,
            PDataValueType::Data,
            budget,
            &mut out,
        );
    }
    Ok(out)
}

fn split(
    bytes: Bytes,
    presentation_context_id: u8,
    value_type: PDataValueType,
    budget: usize,
    out: &mut Vec<PDataValue>,
) {
    if bytes.is_empty() {
        out.push(PDataValue {
            presentation_context_id,
            value_type,
            is_last: true,
            data: bytes,
        });
        return;
    }
    let mut offset = 0;
    while offset < bytes.len() {
        let end = (offset + budget).min(bytes.len());
        out.push(PDataValue {
            presentation_context_id,
            value_type,
            is_last: end == bytes.len(),
            data: bytes.slice(offset..end),
        });
        offset = end;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{tags, CommandSet, CommandValue};
    use crate::pdu::{encode_pdu, Pdu};

    fn store_message(size: usize) -> DimseMessage {
        let command = CommandSet::new()
            .with(tags::COMMAND_FIELD, CommandValue::U16(0x0001))
            .with(tags::MESSAGE_ID, CommandValue::U16(1));
        DimseMessage::new(command, Some(Bytes::from(vec![0x5Au8; size])))
    }

    #[test]
    fn test_forty_kilobytes_at_sixteen_k() {
        let message = store_message(40_000);
        let pdvs = fragment_message(&message, 1, 16384).unwrap();

        let data: Vec<_> = pdvs.iter().filter(|p| !p.is_command()).collect();
        assert!(data.len() >= 3);
        assert!(data.last().unwrap().is_last);
        assert!(data[..data.len() - 1].iter().all(|p| !p.is_last));
        assert_eq!(data.iter().map(|p| p.data.len()).sum::<usize>(), 40_000);

        for pdv in pdvs {
            let encoded = encode_pdu(&Pdu::PData { data: vec![pdv] }).unwrap();
            assert!(encoded.len() <= 16384);
        }
    }

    #[test]
    fn test_command_precedes_data() {
        let pdvs = fragment_message(&store_message(10), 3, 16384).unwrap();
        assert_eq!(pdvs.len(), 2);
        assert!(pdvs[0].is_command() && pdvs[0].is_last);
        assert!(!pdvs[1].is_command() && pdvs[1].is_last);
        assert!(pdvs.iter().all(|p| p.presentation_context_id == 3));
    }

    #[test]
    fn test_empty_data_set_yields_one_pdv() {
        let pdvs = fragment_message(&store_message(0), 1, 16384).unwrap();
        assert_eq!(pdvs.len(), 2);
        assert!(pdvs[1].data.is_empty());
        assert!(pdvs[1].is_last);
    }

    #[test]
    fn test_unlimited_and_tiny_limits() {
        assert_eq!(
            max_pdv_payload(0).unwrap(),
            MAXIMUM_PDU_SIZE as usize - PDU_HEADER_SIZE - PDV_HEADER_SIZE
        );
        assert!(max_pdv_payload(12).is_err());
        assert_eq!(max_pdv_payload(13).unwrap(), 1);
    }
}
