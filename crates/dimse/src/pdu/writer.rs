//! PDU encoding.

use bytes::{BufMut, Bytes, BytesMut};

use super::*;
use crate::error::ProtocolError;

type Result<T> = std::result::Result<T, ProtocolError>;

/// Encode a PDU into a fresh buffer.
pub fn encode_pdu(pdu: &Pdu) -> Result<Bytes> {
    let mut buf = BytesMut::new();
    write_pdu(pdu, &mut buf)?;
    Ok(buf.freeze())
}

/// Append the wire form of `pdu` to `buf`.
///
/// Fails only when a field cannot be represented, e.g. an AE title longer
/// than 16 characters or an item body beyond the 16-bit length field.
pub fn write_pdu(pdu: &Pdu, buf: &mut BytesMut) -> Result<()> {
    match pdu {
        Pdu::AssociationRq(rq) => write_chunk_u32(buf, pdu_type::ASSOCIATE_RQ, |body| {
            write_association_header(
                body,
                rq.protocol_version,
                &rq.called_ae_title,
                &rq.calling_ae_title,
            )?;
            write_text_item(body, item_type::APPLICATION_CONTEXT, &rq.application_context_name)?;
            for pc in &rq.presentation_contexts {
                write_chunk_u16(body, item_type::PRESENTATION_CONTEXT_RQ, |item| {
                    item.put_u8(pc.id);
                    item.put_bytes(0, 3);
                    write_text_item(item, item_type::ABSTRACT_SYNTAX, &pc.abstract_syntax)?;
                    for ts in &pc.transfer_syntaxes {
                        write_text_item(item, item_type::TRANSFER_SYNTAX, ts)?;
                    }
                    Ok(())
                })?;
            }
            write_user_variables(body, &rq.user_variables)
        }),
        Pdu::AssociationAc(ac) => write_chunk_u32(buf, pdu_type::ASSOCIATE_AC, |body| {
            write_association_header(
                body,
                ac.protocol_version,
                &ac.called_ae_title,
                &ac.calling_ae_title,
            )?;
            write_text_item(body, item_type::APPLICATION_CONTEXT, &ac.application_context_name)?;
            for pc in &ac.presentation_contexts {
                write_chunk_u16(body, item_type::PRESENTATION_CONTEXT_AC, |item| {
                    item.put_u8(pc.id);
                    item.put_u8(0);
                    item.put_u8(pc.reason.to_u8());
                    item.put_u8(0);
                    write_text_item(item, item_type::TRANSFER_SYNTAX, &pc.transfer_syntax)
                })?;
            }
            write_user_variables(body, &ac.user_variables)
        }),
        Pdu::AssociationRj(rj) => write_chunk_u32(buf, pdu_type::ASSOCIATE_RJ, |body| {
            let (source, reason) = rj_source_codes(rj.source);
            body.put_u8(0);
            body.put_u8(match rj.result {
                AssociationRjResult::Permanent => 1,
                AssociationRjResult::Transient => 2,
            });
            body.put_u8(source);
            body.put_u8(reason);
            Ok(())
        }),
        Pdu::PData { data } => write_chunk_u32(buf, pdu_type::P_DATA_TF, |body| {
            for pdv in data {
                let item_length = u32::try_from(pdv.data.len() + 2).map_err(|_| {
                    ProtocolError::MalformedPdu("PDV larger than 4 GiB".to_string())
                })?;
                body.put_u32(item_length);
                body.put_u8(pdv.presentation_context_id);
                let mut control = 0u8;
                if pdv.value_type == PDataValueType::Command {
                    control |= 0x01;
                }
                if pdv.is_last {
                    control |= 0x02;
                }
                body.put_u8(control);
                body.extend_from_slice(&pdv.data);
            }
            Ok(())
        }),
        Pdu::ReleaseRq => write_chunk_u32(buf, pdu_type::RELEASE_RQ, |body| {
            body.put_bytes(0, 4);
            Ok(())
        }),
        Pdu::ReleaseRp => write_chunk_u32(buf, pdu_type::RELEASE_RP, |body| {
            body.put_bytes(0, 4);
            Ok(())
        }),
        Pdu::AbortRq { source } => write_chunk_u32(buf, pdu_type::ABORT_RQ, |body| {
            body.put_bytes(0, 2);
            let (source, reason) = match source {
                AbortSource::ServiceUser => (0, 0),
                AbortSource::Reserved => (1, 0),
                AbortSource::ServiceProvider(reason) => (2, abort_reason_code(*reason)),
            };
            body.put_u8(source);
            body.put_u8(reason);
            Ok(())
        }),
    }
}

fn write_chunk_u32<F>(buf: &mut BytesMut, pdu_type: u8, f: F) -> Result<()>
where
    F: FnOnce(&mut BytesMut) -> Result<()>,
{
    let mut body = BytesMut::new();
    f(&mut body)?;
    let length = u32::try_from(body.len())
        .map_err(|_| ProtocolError::MalformedPdu("PDU larger than 4 GiB".to_string()))?;
    buf.reserve(PDU_HEADER_SIZE + body.len());
    buf.put_u8(pdu_type);
    buf.put_u8(0);
    buf.put_u32(length);
    buf.extend_from_slice(&body);
    Ok(())
}

fn write_chunk_u16<F>(buf: &mut BytesMut, item_type: u8, f: F) -> Result<()>
where
    F: FnOnce(&mut BytesMut) -> Result<()>,
{
    let mut body = BytesMut::new();
    f(&mut body)?;
    let length = u16::try_from(body.len()).map_err(|_| {
        ProtocolError::MalformedPdu(format!(
            "item 0x{item_type:02X} of {} bytes exceeds 65535",
            body.len()
        ))
    })?;
    buf.put_u8(item_type);
    buf.put_u8(0);
    buf.put_u16(length);
    buf.extend_from_slice(&body);
    Ok(())
}

fn write_text_item(buf: &mut BytesMut, item_type: u8, value: &str) -> Result<()> {
    write_chunk_u16(buf, item_type, |body| {
        body.extend_from_slice(value.as_bytes());
        Ok(())
    })
}

fn write_length_prefixed(buf: &mut BytesMut, value: &[u8]) -> Result<()> {
    let length = u16::try_from(value.len()).map_err(|_| {
        ProtocolError::MalformedPdu(format!("field of {} bytes exceeds 65535", value.len()))
    })?;
    buf.put_u16(length);
    buf.extend_from_slice(value);
    Ok(())
}

fn write_ae_title(buf: &mut BytesMut, ae_title: &str) -> Result<()> {
    if ae_title.len() > 16 {
        return Err(ProtocolError::MalformedPdu(format!(
            "AE title '{ae_title}' is longer than 16 characters"
        )));
    }
    buf.extend_from_slice(ae_title.as_bytes());
    buf.put_bytes(b' ', 16 - ae_title.len());
    Ok(())
}

fn write_association_header(
    buf: &mut BytesMut,
    protocol_version: u16,
    called_ae_title: &str,
    calling_ae_title: &str,
) -> Result<()> {
    buf.put_u16(protocol_version);
    buf.put_u16(0);
    write_ae_title(buf, called_ae_title)?;
    write_ae_title(buf, calling_ae_title)?;
    buf.put_bytes(0, 32);
    Ok(())
}

fn write_user_variables(buf: &mut BytesMut, variables: &[UserVariableItem]) -> Result<()> {
    if variables.is_empty() {
        return Ok(());
    }
    write_chunk_u16(buf, item_type::USER_INFORMATION, |body| {
        for variable in variables {
            match variable {
                UserVariableItem::MaxLength(max) => {
                    write_chunk_u16(body, item_type::MAX_LENGTH, |sub| {
                        sub.put_u32(*max);
                        Ok(())
                    })?
                }
                UserVariableItem::ImplementationClassUid(uid) => {
                    write_text_item(body, item_type::IMPLEMENTATION_CLASS_UID, uid)?
                }
                UserVariableItem::ImplementationVersionName(name) => {
                    write_text_item(body, item_type::IMPLEMENTATION_VERSION_NAME, name)?
                }
                UserVariableItem::AsyncOperationsWindow {
                    max_invoked,
                    max_performed,
                } => write_chunk_u16(body, item_type::ASYNC_OPERATIONS_WINDOW, |sub| {
                    sub.put_u16(*max_invoked);
                    sub.put_u16(*max_performed);
                    Ok(())
                })?,
                UserVariableItem::RoleSelection(role) => {
                    write_chunk_u16(body, item_type::ROLE_SELECTION, |sub| {
                        write_length_prefixed(sub, role.sop_class_uid.as_bytes())?;
                        sub.put_u8(role.scu_role as u8);
                        sub.put_u8(role.scp_role as u8);
                        Ok(())
                    })?
                }
                UserVariableItem::SopClassExtendedNegotiation {
                    sop_class_uid,
                    data,
                } => write_chunk_u16(body, item_type::SOP_CLASS_EXTENDED_NEGOTIATION, |sub| {
                    write_length_prefixed(sub, sop_class_uid.as_bytes())?;
                    sub.extend_from_slice(data);
                    Ok(())
                })?,
                UserVariableItem::UserIdentity(identity) => {
                    write_chunk_u16(body, item_type::USER_IDENTITY_RQ, |sub| {
                        sub.put_u8(identity.identity_type.to_u8());
                        sub.put_u8(identity.positive_response_requested as u8);
                        write_length_prefixed(sub, &identity.primary_field)?;
                        write_length_prefixed(sub, &identity.secondary_field)
                    })?
                }
                UserVariableItem::UserIdentityResponse(response) => {
                    write_chunk_u16(body, item_type::USER_IDENTITY_AC, |sub| {
                        write_length_prefixed(sub, response)
                    })?
                }
                UserVariableItem::Unknown(kind, data) => write_chunk_u16(body, *kind, |sub| {
                    sub.extend_from_slice(data);
                    Ok(())
                })?,
            }
        }
        Ok(())
    })
}

fn rj_source_codes(source: AssociationRjSource) -> (u8, u8) {
    match source {
        AssociationRjSource::ServiceUser(reason) => (
            1,
            match reason {
                AssociationRjServiceUserReason::NoReasonGiven => 1,
                AssociationRjServiceUserReason::ApplicationContextNameNotSupported => 2,
                AssociationRjServiceUserReason::CallingAeTitleNotRecognized => 3,
                AssociationRjServiceUserReason::CalledAeTitleNotRecognized => 7,
                AssociationRjServiceUserReason::Reserved(code) => code,
            },
        ),
        AssociationRjSource::ServiceProviderAcse(reason) => (
            2,
            match reason {
                AssociationRjServiceProviderAcseReason::NoReasonGiven => 1,
                AssociationRjServiceProviderAcseReason::ProtocolVersionNotSupported => 2,
            },
        ),
        AssociationRjSource::ServiceProviderPresentation(reason) => (
            3,
            match reason {
                AssociationRjServiceProviderPresentationReason::TemporaryCongestion => 1,
                AssociationRjServiceProviderPresentationReason::LocalLimitExceeded => 2,
                AssociationRjServiceProviderPresentationReason::Reserved(code) => code,
            },
        ),
    }
}

fn abort_reason_code(reason: AbortReason) -> u8 {
    match reason {
        AbortReason::ReasonNotSpecified => 0,
        AbortReason::UnrecognizedPdu => 1,
        AbortReason::UnexpectedPdu => 2,
        AbortReason::Reserved => 3,
        AbortReason::UnrecognizedPduParameter => 4,
        AbortReason::UnexpectedPduParameter => 5,
        AbortReason::InvalidPduParameter => 6,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pdu::read_pdu;

    fn sample_rq() -> AssociationRq {
        AssociationRq {
            protocol_version: PROTOCOL_VERSION,
            calling_ae_title: "SCU1".into(),
            called_ae_title: "SCP1".into(),
            application_context_name: DICOM_APPLICATION_CONTEXT.into(),
            presentation_contexts: vec![
                PresentationContextProposed {
                    id: 1,
                    abstract_syntax: "1.2.840.10008.5.1.4.1.1.2".into(),
                    transfer_syntaxes: vec!["1.2.840.10008.1.2.1".into(), "1.2.840.10008.1.2".into()],
                },
                PresentationContextProposed {
                    id: 3,
                    abstract_syntax: "1.2.840.10008.1.1".into(),
                    transfer_syntaxes: vec!["1.2.840.10008.1.2".into()],
                },
            ],
            user_variables: vec![
                UserVariableItem::MaxLength(16384),
                UserVariableItem::ImplementationClassUid("1.2.826.0.1.3680043.9.7433".into()),
                UserVariableItem::ImplementationVersionName("DIMSE_020".into()),
                UserVariableItem::AsyncOperationsWindow {
                    max_invoked: 1,
                    max_performed: 1,
                },
                UserVariableItem::RoleSelection(RoleSelection {
                    sop_class_uid: "1.2.840.10008.5.1.4.1.1.2".into(),
                    scu_role: false,
                    scp_role: true,
                }),
                UserVariableItem::SopClassExtendedNegotiation {
                    sop_class_uid: "1.2.840.10008.5.1.4.1.2.2.1".into(),
                    data: Bytes::from_static(&[1, 1, 0]),
                },
                UserVariableItem::UserIdentity(UserIdentity::username_password("alice", "secret")),
                UserVariableItem::Unknown(0x5F, Bytes::new()),
            ],
        }
    }

    #[test]
    fn test_association_rq_round_trip() {
        let pdu = Pdu::AssociationRq(sample_rq());
        let bytes = encode_pdu(&pdu).unwrap();
        assert_eq!(bytes[0], 0x01);
        let declared = u32::from_be_bytes([bytes[2], bytes[3], bytes[4], bytes[5]]) as usize;
        assert_eq!(declared, bytes.len() - PDU_HEADER_SIZE);
        assert_eq!(read_pdu(&bytes).unwrap(), pdu);
    }

    #[test]
    fn test_association_ac_round_trip() {
        let pdu = Pdu::AssociationAc(AssociationAc {
            protocol_version: PROTOCOL_VERSION,
            calling_ae_title: "SCU1".into(),
            called_ae_title: "SCP1".into(),
            application_context_name: DICOM_APPLICATION_CONTEXT.into(),
            presentation_contexts: vec![
                PresentationContextResult {
                    id: 1,
                    reason: PresentationContextResultReason::Acceptance,
                    transfer_syntax: "1.2.840.10008.1.2.1".into(),
                },
                PresentationContextResult {
                    id: 3,
                    reason: PresentationContextResultReason::AbstractSyntaxNotSupported,
                    transfer_syntax: String::new(),
                },
            ],
            user_variables: vec![
                UserVariableItem::MaxLength(0),
                UserVariableItem::UserIdentityResponse(Bytes::new()),
            ],
        });
        let bytes = encode_pdu(&pdu).unwrap();
        assert_eq!(read_pdu(&bytes).unwrap(), pdu);
    }

    #[test]
    fn test_fixed_pdus_round_trip() {
        let pdus = [
            Pdu::ReleaseRq,
            Pdu::ReleaseRp,
            Pdu::AbortRq {
                source: AbortSource::ServiceUser,
            },
            Pdu::AbortRq {
                source: AbortSource::ServiceProvider(AbortReason::InvalidPduParameter),
            },
            Pdu::AssociationRj(AssociationRj {
                result: AssociationRjResult::Transient,
                source: AssociationRjSource::ServiceProviderPresentation(
                    AssociationRjServiceProviderPresentationReason::TemporaryCongestion,
                ),
            }),
        ];
        for pdu in pdus {
            let bytes = encode_pdu(&pdu).unwrap();
            assert_eq!(bytes.len(), 10, "{}", pdu.short_description());
            assert_eq!(read_pdu(&bytes).unwrap(), pdu);
        }
    }

    #[test]
    fn test_pdata_with_empty_and_large_values() {
        let pdu = Pdu::PData {
            data: vec![
                PDataValue {
                    presentation_context_id: 1,
                    value_type: PDataValueType::Command,
                    is_last: true,
                    data: Bytes::new(),
                },
                PDataValue {
                    presentation_context_id: 1,
                    value_type: PDataValueType::Data,
                    is_last: false,
                    data: Bytes::from(vec![0x5A; 70_000]),
                },
            ],
        };
        let bytes = encode_pdu(&pdu).unwrap();
        assert_eq!(bytes.len(), PDU_HEADER_SIZE + 6 + 6 + 70_000);
        assert_eq!(read_pdu(&bytes).unwrap(), pdu);
    }

    #[test]
    fn test_release_rq_bytes() {
        let bytes = encode_pdu(&Pdu::ReleaseRq).unwrap();
        assert_eq!(&bytes[..], &[0x05, 0, 0, 0, 0, 4, 0, 0, 0, 0]);
    }

    #[test]
    fn test_ae_title_is_space_padded() {
        let bytes = encode_pdu(&Pdu::AssociationRq(sample_rq())).unwrap();
        // called AE occupies bytes 10..26
        assert_eq!(&bytes[10..26], b"SCP1            ");
        assert_eq!(&bytes[26..42], b"SCU1            ");
    }

    #[test]
    fn test_overlong_ae_title_is_rejected() {
        let mut rq = sample_rq();
        rq.calling_ae_title = "A".repeat(17);
        assert!(encode_pdu(&Pdu::AssociationRq(rq)).is_err());
    }

    #[test]
    fn test_truncated_association_rq() {
        let bytes = encode_pdu(&Pdu::AssociationRq(sample_rq())).unwrap();
        let err = read_pdu(&bytes[..bytes.len() - 3]).unwrap_err();
        assert!(matches!(err, ProtocolError::TruncatedData { .. }));
    }

    #[test]
    fn test_item_length_mismatch_is_malformed() {
        let mut bytes = encode_pdu(&Pdu::AssociationRq(sample_rq())).unwrap().to_vec();
        // application context item starts right after the 68 byte fixed header;
        // inflate its length past the end of the PDU
        let offset = PDU_HEADER_SIZE + 68 + 2;
        bytes[offset] = 0xFF;
        bytes[offset + 1] = 0xFF;
        let err = read_pdu(&bytes).unwrap_err();
        assert!(matches!(err, ProtocolError::MalformedPdu(_)));
    }
}
