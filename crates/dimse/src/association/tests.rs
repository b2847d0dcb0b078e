use std::time::Duration;

use bytes::Bytes;
use tokio::io::AsyncReadExt;

use super::*;
use crate::config::DimseConfig;
use crate::message::{tags, CommandSet, CommandValue};
use crate::negotiation::EXPLICIT_VR_LITTLE_ENDIAN;
use crate::pdu::{AssociationRjResult, AssociationRjServiceUserReason, AssociationRjSource};

const CT_IMAGE_STORAGE: &str = "1.2.840.10008.5.1.4.1.1.2";

fn params() -> AssociationParameters {
    AssociationParameters::new("SCU1", "SCP1")
        .with_context(CT_IMAGE_STORAGE, vec![EXPLICIT_VR_LITTLE_ENDIAN.to_string()])
}

fn acceptor(abstract_syntaxes: &[&str]) -> AcceptorOptions {
    AcceptorOptions::from_config(
        &DimseConfig::new("SCP1"),
        abstract_syntaxes.iter().map(|s| s.to_string()).collect(),
    )
}

async fn pair(
    params: AssociationParameters,
    options: AcceptorOptions,
) -> (Result<Association>, Result<Association>) {
    let (a, b) = tokio::io::duplex(1 << 20);
    let acceptor =
        tokio::spawn(async move { Association::accept(Connection::new(b, false), &options).await });
    let requestor = async {
        let mut association = Association::new(Connection::new(a, false), params)?;
        association.establish().await?;
        Ok::<_, DimseError>(association)
    };
    let requestor = requestor.await;
    let acceptor = acceptor.await.unwrap();
    (requestor, acceptor)
}

async fn established() -> (Association, Association) {
    let (scu, scp) = pair(params(), acceptor(&[CT_IMAGE_STORAGE])).await;
    (scu.unwrap(), scp.unwrap())
}

fn store_rq(message_id: u16, data: Bytes) -> DimseMessage {
    let command = CommandSet::new()
        .with(tags::AFFECTED_SOP_CLASS_UID, CommandValue::Uid(CT_IMAGE_STORAGE.into()))
        .with(tags::COMMAND_FIELD, CommandValue::U16(0x0001))
        .with(tags::MESSAGE_ID, CommandValue::U16(message_id));
    DimseMessage::new(command, Some(data))
}

#[tokio::test]
async fn test_forty_kilobytes_over_sixteen_k_pdus() {
    let (mut scu, mut scp) = established().await;
    assert_eq!(scu.state(), AssociationState::Established);
    assert_eq!(scp.state(), AssociationState::Established);
    assert_eq!(scu.peer_max_pdu_length(), 16384);
    assert_eq!(scp.peer_ae_title(), "SCU1");

    let context_id = scu.context_for(CT_IMAGE_STORAGE).unwrap().id;
    let payload = Bytes::from((0..40_000u32).map(|i| i as u8).collect::<Vec<_>>());
    let message_id = scu.next_message_id();
    let message = store_rq(message_id, payload.clone());

    let pdvs = fragment_message(&message, context_id, scu.peer_max_pdu_length()).unwrap();
    assert!(pdvs.iter().filter(|p| !p.is_command()).count() >= 3);

    let (sent, received) = tokio::join!(
        scu.send_message(context_id, &message),
        scp.receive_message()
    );
    sent.unwrap();
    let received = received.unwrap();
    assert_eq!(received.presentation_context_id, context_id);
    assert_eq!(received.message.data, Some(payload));
    assert_eq!(received.message.command.message_id().unwrap(), message_id);

    let (released, peer) = tokio::join!(scu.release(), scp.receive_message());
    released.unwrap();
    assert!(matches!(peer, Err(DimseError::PeerReleased)));
    assert_eq!(scu.state(), AssociationState::Released);
    assert_eq!(scp.state(), AssociationState::Released);
}

#[tokio::test]
async fn test_wrong_called_ae_is_rejected() {
    let params = AssociationParameters::new("SCU1", "OTHER")
        .with_context(CT_IMAGE_STORAGE, vec![EXPLICIT_VR_LITTLE_ENDIAN.to_string()]);
    let (scu, scp) = pair(params, acceptor(&[CT_IMAGE_STORAGE])).await;
    match scu {
        Err(DimseError::AssociationRejected(rejection)) => {
            assert_eq!(rejection.result, AssociationRjResult::Permanent);
            assert_eq!(
                rejection.source,
                AssociationRjSource::ServiceUser(
                    AssociationRjServiceUserReason::CalledAeTitleNotRecognized
                )
            );
        }
        other => panic!("expected rejection, got {other:?}"),
    }
    assert!(matches!(scp, Err(DimseError::AssociationRejected(_))));
}

#[tokio::test]
async fn test_no_acceptable_context() {
    let (scu, scp) = pair(params(), acceptor(&["1.2.840.10008.1.1"])).await;
    assert!(matches!(scu, Err(DimseError::NoAcceptablePresentationContext)));
    assert!(matches!(scp, Err(DimseError::NoAcceptablePresentationContext)));
}

#[tokio::test]
async fn test_send_outside_established_does_no_io() {
    let (a, mut b) = tokio::io::duplex(4096);
    let mut association = Association::new(Connection::new(a, false), params()).unwrap();
    let message = store_rq(1, Bytes::from_static(b"data"));

    let err = association.send_message(1, &message).await.unwrap_err();
    assert!(matches!(err, DimseError::InvalidState(_)));
    assert_eq!(association.state(), AssociationState::Idle);

    let mut buf = [0u8; 1];
    let read = tokio::time::timeout(Duration::from_millis(50), b.read(&mut buf)).await;
    assert!(read.is_err(), "no bytes may reach the peer");
}

#[tokio::test]
async fn test_unaccepted_context_is_refused_locally() {
    let (mut scu, _scp) = established().await;
    let err = scu
        .send_message(3, &store_rq(1, Bytes::from_static(b"xx")))
        .await
        .unwrap_err();
    assert!(matches!(err, DimseError::NoPresentationContext(_)));
    assert_eq!(scu.state(), AssociationState::Established);
}

#[tokio::test(start_paused = true)]
async fn test_silent_peer_hits_artim() {
    let (a, _b) = tokio::io::duplex(1 << 16);
    let params = params().with_timeouts(
        Duration::from_secs(1),
        Duration::from_secs(5),
        Duration::from_secs(5),
    );
    let mut association = Association::new(Connection::new(a, false), params).unwrap();
    let err = association.establish().await.unwrap_err();
    assert!(matches!(
        err,
        DimseError::AssociationTimeout(TimeoutStage::AssociationResponse)
    ));
    assert_eq!(association.state(), AssociationState::Aborted);
}

#[tokio::test]
async fn test_peer_abort_ends_association() {
    let (mut scu, mut scp) = established().await;
    let ((), received) = tokio::join!(scu.abort(), scp.receive_message());
    assert!(matches!(
        received,
        Err(DimseError::PeerAbort(AbortSource::ServiceUser))
    ));
    assert_eq!(scu.state(), AssociationState::Aborted);
    assert_eq!(scp.state(), AssociationState::Aborted);

    let err = scu
        .send_message(1, &store_rq(1, Bytes::new()))
        .await
        .unwrap_err();
    assert!(matches!(err, DimseError::InvalidState(_)));
}

#[tokio::test]
async fn test_cancellation_aborts() {
    let (mut scu, mut scp) = established().await;
    scp.cancellation_token().cancel();
    let err = scp.receive_message().await.unwrap_err();
    assert!(matches!(err, DimseError::Cancelled));
    assert_eq!(scp.state(), AssociationState::Aborted);

    let err = scu.receive_message().await.unwrap_err();
    assert!(matches!(err, DimseError::PeerAbort(_)));
}

#[tokio::test]
async fn test_message_ids_skip_zero() {
    let (mut scu, _scp) = established().await;
    assert_eq!(scu.next_message_id(), 1);
    scu.message_id = u16::MAX;
    assert_eq!(scu.next_message_id(), 1);
}

#[tokio::test]
async fn test_no_acceptable_context_tolerates_missing_abort() {
    use futures::{SinkExt, StreamExt};
    use tokio_util::codec::Framed;

    use crate::pdu::PduCodec;

    let (a, b) = tokio::io::duplex(1 << 16);
    let options = acceptor(&["1.2.840.10008.1.1"]);
    let acceptor =
        tokio::spawn(async move { Association::accept(Connection::new(b, false), &options).await });

    let mut requestor = Framed::new(a, PduCodec::new(0));
    requestor
        .send(Pdu::AssociationRq(params().to_request()))
        .await
        .unwrap();
    let answer = requestor.next().await.unwrap().unwrap();
    assert!(matches!(answer, Pdu::AssociationAc(_)));

    // A release request instead of the expected abort.
    requestor.send(Pdu::ReleaseRq).await.unwrap();
    let result = acceptor.await.unwrap();
    assert!(matches!(
        result,
        Err(DimseError::NoAcceptablePresentationContext)
    ));
}
