//! Stream framing for PDUs.

use bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::trace;

use super::{pdu_type, read_pdu, write_pdu, Pdu, PDU_HEADER_SIZE};
use crate::error::{DimseError, ProtocolError};

/// Frames PDUs on a byte stream.
///
/// P-DATA-TF frames larger than `max_pdu_length` (the limit this side
/// announced) are rejected. Association negotiation PDUs are bounded by a
/// fixed 64 KiB ceiling since they are exchanged before any limit applies.
#[derive(Debug, Clone)]
pub struct PduCodec {
    max_pdu_length: u32,
}

const NEGOTIATION_PDU_LIMIT: usize = 64 * 1024;

impl PduCodec {
    pub fn new(max_pdu_length: u32) -> Self {
        Self { max_pdu_length }
    }

    pub fn set_max_pdu_length(&mut self, max_pdu_length: u32) {
        self.max_pdu_length = max_pdu_length;
    }

    fn limit_for(&self, pdu_type: u8) -> usize {
        if pdu_type == pdu_type::P_DATA_TF {
            self.max_pdu_length as usize
        } else {
            NEGOTIATION_PDU_LIMIT
        }
    }
}

impl Decoder for PduCodec {
    type Item = Pdu;
    type Error = DimseError;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Pdu>, DimseError> {
        if buf.len() < PDU_HEADER_SIZE {
            return Ok(None);
        }
        let length = u32::from_be_bytes([buf[2], buf[3], buf[4], buf[5]]) as usize;
        let limit = self.limit_for(buf[0]);
        if length > limit {
            return Err(ProtocolError::PduTooLarge { length, max: limit }.into());
        }
        let frame_len = PDU_HEADER_SIZE + length;
        if buf.len() < frame_len {
            buf.reserve(frame_len - buf.len());
            return Ok(None);
        }
        let pdu = read_pdu(&buf[..frame_len]);
        buf.advance(frame_len);
        let pdu = pdu?;
        trace!("decoded {}", pdu.short_description());
        Ok(Some(pdu))
    }
}

impl Encoder<Pdu> for PduCodec {
    type Error = DimseError;

    fn encode(&mut self, pdu: Pdu, buf: &mut BytesMut) -> Result<(), DimseError> {
        trace!("encoding {}", pdu.short_description());
        write_pdu(&pdu, buf)?;
        Ok(())
    }
}
