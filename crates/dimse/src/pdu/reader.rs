//! PDU decoding.

use bytes::Bytes;
use tracing::debug;

use super::*;
use crate::error::ProtocolError;

type Result<T> = std::result::Result<T, ProtocolError>;

/// Decode exactly one PDU from `buf`.
///
/// `buf` must hold the complete frame: fewer bytes than the declared length
/// is [`ProtocolError::TruncatedData`], trailing bytes are
/// [`ProtocolError::MalformedPdu`].
pub fn read_pdu(buf: &[u8]) -> Result<Pdu> {
    let Some(&pdu_type) = buf.first() else {
        return Err(ProtocolError::TruncatedData {
            needed: PDU_HEADER_SIZE,
            available: 0,
        });
    };
    if !(pdu_type::ASSOCIATE_RQ..=pdu_type::ABORT_RQ).contains(&pdu_type) {
        return Err(ProtocolError::UnknownPduType(pdu_type));
    }
    if buf.len() < PDU_HEADER_SIZE {
        return Err(ProtocolError::TruncatedData {
            needed: PDU_HEADER_SIZE,
            available: buf.len(),
        });
    }

    let length = u32::from_be_bytes([buf[2], buf[3], buf[4], buf[5]]) as usize;
    let available = buf.len() - PDU_HEADER_SIZE;
    if available < length {
        return Err(ProtocolError::TruncatedData {
            needed: PDU_HEADER_SIZE + length,
            available: buf.len(),
        });
    }
    if available > length {
        return Err(ProtocolError::MalformedPdu(format!(
            "{} trailing bytes after PDU of declared length {}",
            available - length,
            length
        )));
    }

    let mut body = Cursor::new(&buf[PDU_HEADER_SIZE..]);
    let pdu = match pdu_type {
        pdu_type::ASSOCIATE_RQ => Pdu::AssociationRq(read_association_rq(&mut body)?),
        pdu_type::ASSOCIATE_AC => Pdu::AssociationAc(read_association_ac(&mut body)?),
        pdu_type::ASSOCIATE_RJ => {
            expect_fixed_length("A-ASSOCIATE-RJ", length, 4)?;
            body.skip(1)?;
            let result = body.u8()?;
            let source = body.u8()?;
            let reason = body.u8()?;
            Pdu::AssociationRj(AssociationRj {
                result: rj_result(result)?,
                source: rj_source(source, reason)?,
            })
        }
        pdu_type::P_DATA_TF => Pdu::PData {
            data: read_pdata_values(&mut body)?,
        },
        pdu_type::RELEASE_RQ => {
            expect_fixed_length("A-RELEASE-RQ", length, 4)?;
            Pdu::ReleaseRq
        }
        pdu_type::RELEASE_RP => {
            expect_fixed_length("A-RELEASE-RP", length, 4)?;
            Pdu::ReleaseRp
        }
        pdu_type::ABORT_RQ => {
            expect_fixed_length("A-ABORT", length, 4)?;
            body.skip(2)?;
            let source = body.u8()?;
            let reason = body.u8()?;
            Pdu::AbortRq {
                source: abort_source(source, reason)?,
            }
        }
        other => return Err(ProtocolError::UnknownPduType(other)),
    };
    Ok(pdu)
}

fn expect_fixed_length(name: &str, actual: usize, expected: usize) -> Result<()> {
    if actual != expected {
        return Err(ProtocolError::MalformedPdu(format!(
            "{name} length must be {expected}, got {actual}"
        )));
    }
    Ok(())
}

/// Bounds-checked big-endian reader over a byte slice.
struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.remaining() < n {
            return Err(ProtocolError::MalformedPdu(format!(
                "field of {n} bytes overruns its container ({} bytes left)",
                self.remaining()
            )));
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn skip(&mut self, n: usize) -> Result<()> {
        self.take(n).map(|_| ())
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// Next `{type, reserved, length: u16}` item and its body.
    fn item(&mut self) -> Result<(u8, Cursor<'a>)> {
        let item_type = self.u8()?;
        self.skip(1)?;
        let length = self.u16()? as usize;
        let body = self.take(length).map_err(|_| {
            ProtocolError::MalformedPdu(format!(
                "item 0x{item_type:02X} declares {length} bytes but only {} remain",
                self.remaining()
            ))
        })?;
        Ok((item_type, Cursor::new(body)))
    }

    fn rest(&mut self) -> &'a [u8] {
        let slice = &self.data[self.pos..];
        self.pos = self.data.len();
        slice
    }
}

fn text(bytes: &[u8], what: &str) -> Result<String> {
    let s = std::str::from_utf8(bytes)
        .map_err(|_| ProtocolError::MalformedPdu(format!("{what} is not valid ASCII")))?;
    Ok(s.trim_end_matches(['\0', ' ']).to_string())
}

fn ae_title(bytes: &[u8]) -> Result<String> {
    Ok(text(bytes, "AE title")?.trim_start().to_string())
}

struct AssociationHeader {
    protocol_version: u16,
    called_ae_title: String,
    calling_ae_title: String,
}

fn read_association_header(body: &mut Cursor<'_>) -> Result<AssociationHeader> {
    let protocol_version = body.u16()?;
    body.skip(2)?;
    let called_ae_title = ae_title(body.take(16)?)?;
    let calling_ae_title = ae_title(body.take(16)?)?;
    body.skip(32)?;
    Ok(AssociationHeader {
        protocol_version,
        called_ae_title,
        calling_ae_title,
    })
}

fn read_association_rq(body: &mut Cursor<'_>) -> Result<AssociationRq> {
    let header = read_association_header(body)?;
    let mut application_context_name = None;
    let mut presentation_contexts = Vec::new();
    let mut user_variables = Vec::new();

    while body.remaining() > 0 {
        let (kind, mut item) = body.item()?;
        match kind {
            item_type::APPLICATION_CONTEXT => {
                application_context_name = Some(text(item.rest(), "application context")?)
            }
            item_type::PRESENTATION_CONTEXT_RQ => {
                presentation_contexts.push(read_presentation_context_rq(&mut item)?)
            }
            item_type::USER_INFORMATION => user_variables = read_user_variables(&mut item)?,
            other => {
                return Err(ProtocolError::MalformedPdu(format!(
                    "unexpected item 0x{other:02X} in A-ASSOCIATE-RQ"
                )))
            }
        }
    }

    Ok(AssociationRq {
        protocol_version: header.protocol_version,
        calling_ae_title: header.calling_ae_title,
        called_ae_title: header.called_ae_title,
        application_context_name: application_context_name.ok_or_else(|| {
            ProtocolError::MalformedPdu("A-ASSOCIATE-RQ without application context".into())
        })?,
        presentation_contexts,
        user_variables,
    })
}

fn read_association_ac(body: &mut Cursor<'_>) -> Result<AssociationAc> {
    let header = read_association_header(body)?;
    let mut application_context_name = None;
    let mut presentation_contexts = Vec::new();
    let mut user_variables = Vec::new();

    while body.remaining() > 0 {
        let (kind, mut item) = body.item()?;
        match kind {
            item_type::APPLICATION_CONTEXT => {
                application_context_name = Some(text(item.rest(), "application context")?)
            }
            item_type::PRESENTATION_CONTEXT_AC => {
                presentation_contexts.push(read_presentation_context_ac(&mut item)?)
            }
            item_type::USER_INFORMATION => user_variables = read_user_variables(&mut item)?,
            other => {
                return Err(ProtocolError::MalformedPdu(format!(
                    "unexpected item 0x{other:02X} in A-ASSOCIATE-AC"
                )))
            }
        }
    }

    Ok(AssociationAc {
        protocol_version: header.protocol_version,
        calling_ae_title: header.calling_ae_title,
        called_ae_title: header.called_ae_title,
        application_context_name: application_context_name.ok_or_else(|| {
            ProtocolError::MalformedPdu("A-ASSOCIATE-AC without application context".into())
        })?,
        presentation_contexts,
        user_variables,
    })
}

fn read_presentation_context_rq(item: &mut Cursor<'_>) -> Result<PresentationContextProposed> {
    let id = item.u8()?;
    item.skip(3)?;
    let mut abstract_syntax = None;
    let mut transfer_syntaxes = Vec::new();

    while item.remaining() > 0 {
        let (kind, mut sub) = item.item()?;
        match kind {
            item_type::ABSTRACT_SYNTAX => {
                if abstract_syntax.is_some() {
                    return Err(ProtocolError::MalformedPdu(format!(
                        "presentation context {id} has more than one abstract syntax"
                    )));
                }
                abstract_syntax = Some(text(sub.rest(), "abstract syntax")?);
            }
            item_type::TRANSFER_SYNTAX => {
                transfer_syntaxes.push(text(sub.rest(), "transfer syntax")?)
            }
            other => {
                return Err(ProtocolError::MalformedPdu(format!(
                    "unexpected sub-item 0x{other:02X} in presentation context {id}"
                )))
            }
        }
    }

    Ok(PresentationContextProposed {
        id,
        abstract_syntax: abstract_syntax.ok_or_else(|| {
            ProtocolError::MalformedPdu(format!("presentation context {id} lacks abstract syntax"))
        })?,
        transfer_syntaxes,
    })
}

fn read_presentation_context_ac(item: &mut Cursor<'_>) -> Result<PresentationContextResult> {
    let id = item.u8()?;
    item.skip(1)?;
    let raw_reason = item.u8()?;
    item.skip(1)?;
    let reason = PresentationContextResultReason::from_u8(raw_reason).ok_or_else(|| {
        ProtocolError::MalformedPdu(format!(
            "presentation context {id} has invalid result {raw_reason}"
        ))
    })?;

    let mut transfer_syntax = String::new();
    while item.remaining() > 0 {
        let (kind, mut sub) = item.item()?;
        match kind {
            item_type::TRANSFER_SYNTAX => transfer_syntax = text(sub.rest(), "transfer syntax")?,
            other => {
                return Err(ProtocolError::MalformedPdu(format!(
                    "unexpected sub-item 0x{other:02X} in presentation context {id}"
                )))
            }
        }
    }

    Ok(PresentationContextResult {
        id,
        reason,
        transfer_syntax,
    })
}

fn read_user_variables(item: &mut Cursor<'_>) -> Result<Vec<UserVariableItem>> {
    let mut variables = Vec::new();
    while item.remaining() > 0 {
        let (kind, mut sub) = item.item()?;
        let variable = match kind {
            item_type::MAX_LENGTH => UserVariableItem::MaxLength(sub.u32()?),
            item_type::IMPLEMENTATION_CLASS_UID => {
                UserVariableItem::ImplementationClassUid(text(sub.rest(), "implementation class UID")?)
            }
            item_type::IMPLEMENTATION_VERSION_NAME => UserVariableItem::ImplementationVersionName(
                text(sub.rest(), "implementation version name")?,
            ),
            item_type::ASYNC_OPERATIONS_WINDOW => UserVariableItem::AsyncOperationsWindow {
                max_invoked: sub.u16()?,
                max_performed: sub.u16()?,
            },
            item_type::ROLE_SELECTION => {
                let uid_length = sub.u16()? as usize;
                let sop_class_uid = text(sub.take(uid_length)?, "role selection SOP class")?;
                let scu_role = sub.u8()? != 0;
                let scp_role = sub.u8()? != 0;
                UserVariableItem::RoleSelection(RoleSelection {
                    sop_class_uid,
                    scu_role,
                    scp_role,
                })
            }
            item_type::SOP_CLASS_EXTENDED_NEGOTIATION => {
                let uid_length = sub.u16()? as usize;
                let sop_class_uid = text(sub.take(uid_length)?, "extended negotiation SOP class")?;
                UserVariableItem::SopClassExtendedNegotiation {
                    sop_class_uid,
                    data: Bytes::copy_from_slice(sub.rest()),
                }
            }
            item_type::USER_IDENTITY_RQ => {
                let raw_type = sub.u8()?;
                let identity_type = UserIdentityType::from_u8(raw_type).ok_or_else(|| {
                    ProtocolError::MalformedPdu(format!("unknown user identity type {raw_type}"))
                })?;
                let positive_response_requested = sub.u8()? != 0;
                let primary_length = sub.u16()? as usize;
                let primary_field = Bytes::copy_from_slice(sub.take(primary_length)?);
                let secondary_length = sub.u16()? as usize;
                let secondary_field = Bytes::copy_from_slice(sub.take(secondary_length)?);
                UserVariableItem::UserIdentity(UserIdentity {
                    identity_type,
                    positive_response_requested,
                    primary_field,
                    secondary_field,
                })
            }
            item_type::USER_IDENTITY_AC => {
                let length = sub.u16()? as usize;
                UserVariableItem::UserIdentityResponse(Bytes::copy_from_slice(sub.take(length)?))
            }
            other => {
                debug!("Keeping unknown user information sub-item 0x{:02X}", other);
                UserVariableItem::Unknown(other, Bytes::copy_from_slice(sub.rest()))
            }
        };
        if sub.remaining() > 0 {
            return Err(ProtocolError::MalformedPdu(format!(
                "user information sub-item 0x{kind:02X} has {} unread bytes",
                sub.remaining()
            )));
        }
        variables.push(variable);
    }
    Ok(variables)
}

fn read_pdata_values(body: &mut Cursor<'_>) -> Result<Vec<PDataValue>> {
    let mut values = Vec::new();
    while body.remaining() > 0 {
        let item_length = body.u32()? as usize;
        if item_length < 2 {
            return Err(ProtocolError::MalformedPdu(format!(
                "PDV item length {item_length} is shorter than its header"
            )));
        }
        if item_length > body.remaining() {
            return Err(ProtocolError::MalformedPdu(format!(
                "PDV item declares {item_length} bytes but only {} remain",
                body.remaining()
            )));
        }
        let presentation_context_id = body.u8()?;
        let control = body.u8()?;
        let data = Bytes::copy_from_slice(body.take(item_length - 2)?);
        values.push(PDataValue {
            presentation_context_id,
            value_type: if control & 0x01 != 0 {
                PDataValueType::Command
            } else {
                PDataValueType::Data
            },
            is_last: control & 0x02 != 0,
            data,
        });
    }
    Ok(values)
}

fn rj_result(value: u8) -> Result<AssociationRjResult> {
    match value {
        1 => Ok(AssociationRjResult::Permanent),
        2 => Ok(AssociationRjResult::Transient),
        other => Err(ProtocolError::MalformedPdu(format!(
            "invalid A-ASSOCIATE-RJ result {other}"
        ))),
    }
}

fn rj_source(source: u8, reason: u8) -> Result<AssociationRjSource> {
    let invalid = || {
        ProtocolError::MalformedPdu(format!(
            "invalid A-ASSOCIATE-RJ source/reason {source}/{reason}"
        ))
    };
    Ok(match source {
        1 => AssociationRjSource::ServiceUser(match reason {
            1 => AssociationRjServiceUserReason::NoReasonGiven,
            2 => AssociationRjServiceUserReason::ApplicationContextNameNotSupported,
            3 => AssociationRjServiceUserReason::CallingAeTitleNotRecognized,
            7 => AssociationRjServiceUserReason::CalledAeTitleNotRecognized,
            4..=6 | 8..=10 => AssociationRjServiceUserReason::Reserved(reason),
            _ => return Err(invalid()),
        }),
        2 => AssociationRjSource::ServiceProviderAcse(match reason {
            1 => AssociationRjServiceProviderAcseReason::NoReasonGiven,
            2 => AssociationRjServiceProviderAcseReason::ProtocolVersionNotSupported,
            _ => return Err(invalid()),
        }),
        3 => AssociationRjSource::ServiceProviderPresentation(match reason {
            1 => AssociationRjServiceProviderPresentationReason::TemporaryCongestion,
            2 => AssociationRjServiceProviderPresentationReason::LocalLimitExceeded,
            0 | 3..=7 => AssociationRjServiceProviderPresentationReason::Reserved(reason),
            _ => return Err(invalid()),
        }),
        _ => return Err(invalid()),
    })
}

fn abort_source(source: u8, reason: u8) -> Result<AbortSource> {
    Ok(match source {
        0 => AbortSource::ServiceUser,
        1 => AbortSource::Reserved,
        2 => AbortSource::ServiceProvider(match reason {
            0 => AbortReason::ReasonNotSpecified,
            1 => AbortReason::UnrecognizedPdu,
            2 => AbortReason::UnexpectedPdu,
            3 => AbortReason::Reserved,
            4 => AbortReason::UnrecognizedPduParameter,
            5 => AbortReason::UnexpectedPduParameter,
            6 => AbortReason::InvalidPduParameter,
            other => {
                return Err(ProtocolError::MalformedPdu(format!(
                    "invalid A-ABORT reason {other}"
                )))
            }
        }),
        other => {
            return Err(ProtocolError::MalformedPdu(format!(
                "invalid A-ABORT source {other}"
            )))
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_input_is_truncated() {
        assert_eq!(
            read_pdu(&[]),
            Err(ProtocolError::TruncatedData {
                needed: 6,
                available: 0
            })
        );
    }

    #[test]
    fn test_unknown_pdu_type() {
        assert_eq!(
            read_pdu(&[0x09, 0, 0, 0, 0, 4, 0, 0, 0, 0]),
            Err(ProtocolError::UnknownPduType(0x09))
        );
    }

    #[test]
    fn test_declared_length_beyond_buffer() {
        let err = read_pdu(&[0x05, 0, 0, 0, 0, 4, 0, 0]).unwrap_err();
        assert_eq!(
            err,
            ProtocolError::TruncatedData {
                needed: 10,
                available: 8
            }
        );
    }

    #[test]
    fn test_release_rq_with_wrong_length_is_malformed() {
        let err = read_pdu(&[0x05, 0, 0, 0, 0, 2, 0, 0]).unwrap_err();
        assert!(matches!(err, ProtocolError::MalformedPdu(_)));
    }

    #[test]
    fn test_pdv_overrunning_pdu_is_malformed() {
        // PDV claims 100 bytes inside an 8 byte P-DATA body
        let bytes = [0x04, 0, 0, 0, 0, 8, 0, 0, 0, 100, 1, 0x03, 0xAA, 0xBB];
        let err = read_pdu(&bytes).unwrap_err();
        assert!(matches!(err, ProtocolError::MalformedPdu(_)));
    }

    #[test]
    fn test_decode_pdata_control_bits() {
        let bytes = [0x04, 0, 0, 0, 0, 8, 0, 0, 0, 4, 3, 0x02, 0xAA, 0xBB];
        let pdu = read_pdu(&bytes).unwrap();
        assert_eq!(
            pdu,
            Pdu::PData {
                data: vec![PDataValue {
                    presentation_context_id: 3,
                    value_type: PDataValueType::Data,
                    is_last: true,
                    data: Bytes::from_static(&[0xAA, 0xBB]),
                }]
            }
        );
    }

    #[test]
    fn test_decode_abort() {
        let pdu = read_pdu(&[0x07, 0, 0, 0, 0, 4, 0, 0, 2, 2]).unwrap();
        assert_eq!(
            pdu,
            Pdu::AbortRq {
                source: AbortSource::ServiceProvider(AbortReason::UnexpectedPdu)
            }
        );
    }

    #[test]
    fn test_decode_reject() {
        let pdu = read_pdu(&[0x03, 0, 0, 0, 0, 4, 0, 1, 1, 7]).unwrap();
        assert_eq!(
            pdu,
            Pdu::AssociationRj(AssociationRj {
                result: AssociationRjResult::Permanent,
                source: AssociationRjSource::ServiceUser(
                    AssociationRjServiceUserReason::CalledAeTitleNotRecognized
                ),
            })
        );
    }
}
