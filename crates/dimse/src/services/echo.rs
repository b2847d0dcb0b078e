use dicom_dictionary_std::uids;
use tracing::{debug, info};

use super::{check_response, failure, request_command, response_command};
use crate::association::Association;
use crate::error::Result;
use crate::message::{CommandField, DimseMessage};
use crate::status::Status;

/// Send a C-ECHO-RQ on the Verification context and wait for the response.
///
/// Succeeds only on status 0x0000; any other status is `OperationFailed`.
pub async fn echo(association: &mut Association) -> Result<Status> {
    let context_id = association.context_for(uids::VERIFICATION)?.id;
    let message_id = association.next_message_id();
    let request = DimseMessage::new(
        request_command(CommandField::CEchoRq, message_id, uids::VERIFICATION),
        None,
    );
    debug!("Sending C-ECHO-RQ (message ID {})", message_id);
    association.send_message(context_id, &request).await?;

    let received = association.receive_message().await?;
    let status = check_response(association, &received, CommandField::CEchoRsp, message_id).await?;
    if !status.is_success() {
        return Err(failure("C-ECHO", &received.message, status));
    }
    info!("C-ECHO to {} succeeded", association.peer_ae_title());
    Ok(status)
}

/// The C-ECHO-RSP for `request`.
pub fn echo_response(request: &DimseMessage, status: Status) -> DimseMessage {
    DimseMessage::new(
        response_command(CommandField::CEchoRsp, &request.command, status),
        None,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{DimseError, ProtocolError};
    use crate::services::testing::{established, reply, VERIFICATION_ONLY};

    #[tokio::test]
    async fn test_echo_success() {
        let (mut scu, mut scp) = established(VERIFICATION_ONLY).await;
        let peer = tokio::spawn(async move {
            let request = scp.receive_message().await.unwrap();
            let response = echo_response(&request.message, Status::SUCCESS);
            scp.send_message(request.presentation_context_id, &response)
                .await
                .unwrap();
        });
        assert_eq!(echo(&mut scu).await.unwrap(), Status::SUCCESS);
        peer.await.unwrap();
    }

    #[tokio::test]
    async fn test_echo_failure_status() {
        let (mut scu, mut scp) = established(VERIFICATION_ONLY).await;
        let peer = tokio::spawn(async move {
            let request = scp.receive_message().await.unwrap();
            reply(&mut scp, &request, echo_response(&request.message, Status::new(0x0110))).await;
        });
        let err = echo(&mut scu).await.unwrap_err();
        assert!(matches!(err, DimseError::OperationFailed { command: "C-ECHO", .. }));
        assert!(scu.state().is_established());
        peer.await.unwrap();
    }

    #[tokio::test]
    async fn test_wrong_message_id_aborts() {
        let (mut scu, mut scp) = established(VERIFICATION_ONLY).await;
        let peer = tokio::spawn(async move {
            let request = scp.receive_message().await.unwrap();
            let mut command = request.message.command.clone();
            command.insert(
                crate::message::tags::MESSAGE_ID,
                crate::message::CommandValue::U16(999),
            );
            let bogus = DimseMessage::new(command, None);
            reply(&mut scp, &request, echo_response(&bogus, Status::SUCCESS)).await;
        });
        let err = echo(&mut scu).await.unwrap_err();
        assert!(matches!(
            err,
            DimseError::Protocol(ProtocolError::UnexpectedMessageId { actual: 999, .. })
        ));
        assert!(scu.state().is_terminal());
        peer.await.unwrap();
    }
}
