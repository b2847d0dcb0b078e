//! C-FIND as SCU.
//!
//! Matches arrive as a lazy sequence of pending responses and are handed to the
//! caller as they come off the wire; nothing is buffered beyond the current
//! message.

use bytes::Bytes;
use futures::stream::BoxStream;
use tracing::{debug, info, warn};

use super::{check_response, failure, request_command, send_cancel};
use crate::association::Association;
use crate::error::Result;
use crate::message::{tags, CommandField, CommandValue, DimseMessage};
use crate::status::{Status, StatusClass};
use crate::types::Priority;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FindResponse {
    /// A pending response carrying one match identifier.
    Match { status: Status, identifier: Bytes },
    /// Final response; success, warning or cancel.
    Complete { status: Status },
}

impl FindResponse {
    pub fn status(&self) -> Status {
        match self {
            FindResponse::Match { status, .. } | FindResponse::Complete { status } => *status,
        }
    }
}

/// An outstanding C-FIND; holds the association until the final response.
pub struct FindOperation<'a> {
    association: &'a mut Association,
    context_id: u8,
    message_id: u16,
    matches: usize,
    finished: bool,
    cancel_sent: bool,
}

/// Send a C-FIND-RQ with an encoded identifier and return the pending operation.
pub async fn find<'a>(
    association: &'a mut Association,
    sop_class_uid: &str,
    identifier: Bytes,
    priority: Priority,
) -> Result<FindOperation<'a>> {
    let context_id = association.context_for(sop_class_uid)?.id;
    let message_id = association.next_message_id();
    let command = request_command(CommandField::CFindRq, message_id, sop_class_uid)
        .with(tags::PRIORITY, CommandValue::U16(priority.code()));
    debug!(
        "Sending C-FIND-RQ for {} (message ID {})",
        sop_class_uid, message_id
    );
    association
        .send_message(context_id, &DimseMessage::new(command, Some(identifier)))
        .await?;
    Ok(FindOperation {
        association,
        context_id,
        message_id,
        matches: 0,
        finished: false,
        cancel_sent: false,
    })
}

impl<'a> FindOperation<'a> {
    pub fn message_id(&self) -> u16 {
        self.message_id
    }

    /// Next response, or `None` once the final response has been returned.
    ///
    /// A failure final status is returned as `OperationFailed`.
    pub async fn next(&mut self) -> Option<Result<FindResponse>> {
        if self.finished {
            return None;
        }
        Some(self.receive().await)
    }

    async fn receive(&mut self) -> Result<FindResponse> {
        let received = match self.association.receive_message().await {
            Ok(received) => received,
            Err(e) => {
                self.finished = true;
                return Err(e);
            }
        };
        let status = match check_response(
            self.association,
            &received,
            CommandField::CFindRsp,
            self.message_id,
        )
        .await
        {
            Ok(status) => status,
            Err(e) => {
                self.finished = true;
                return Err(e);
            }
        };

        match status.class() {
            StatusClass::Pending => {
                self.matches += 1;
                Ok(FindResponse::Match {
                    status,
                    identifier: received.message.data.unwrap_or_default(),
                })
            }
            StatusClass::Failure => {
                self.finished = true;
                warn!("C-FIND failed with status {}", status);
                Err(failure("C-FIND", &received.message, status))
            }
            StatusClass::Success | StatusClass::Warning | StatusClass::Cancel => {
                self.finished = true;
                info!(
                    "C-FIND completed with {} matches, status {}",
                    self.matches, status
                );
                Ok(FindResponse::Complete { status })
            }
        }
    }

    /// Ask the peer to stop. Responses already in flight are still delivered;
    /// the operation ends with the peer's final response.
    pub async fn cancel(&mut self) -> Result<()> {
        if self.finished || self.cancel_sent {
            return Ok(());
        }
        self.cancel_sent = true;
        send_cancel(self.association, self.context_id, self.message_id).await
    }

    /// Drain the remaining responses into memory, returning match identifiers.
    pub async fn collect_matches(mut self) -> Result<Vec<Bytes>> {
        let mut identifiers = Vec::new();
        while let Some(response) = self.next().await {
            if let FindResponse::Match { identifier, .. } = response? {
                identifiers.push(identifier);
            }
        }
        Ok(identifiers)
    }

    pub fn into_stream(mut self) -> BoxStream<'a, Result<FindResponse>> {
        let stream = async_stream::stream! {
            while let Some(response) = self.next().await {
                yield response;
            }
        };
        Box::pin(stream)
    }
}

#[cfg(test)]
mod tests {
    use dicom_dictionary_std::uids;
    use futures::StreamExt;

    use super::*;
    use crate::error::DimseError;
    use crate::message::ReceivedMessage;
    use crate::services::response_command;
    use crate::services::testing::{established, reply};

    const FIND: &str = uids::STUDY_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_FIND;

    fn response(request: &ReceivedMessage, status: Status, data: Option<Bytes>) -> DimseMessage {
        DimseMessage::new(
            response_command(CommandField::CFindRsp, &request.message.command, status),
            data,
        )
    }

    #[tokio::test]
    async fn test_three_matches_then_success() {
        let (mut scu, mut scp) = established(&[FIND]).await;
        let peer = tokio::spawn(async move {
            let request = scp.receive_message().await.unwrap();
            assert_eq!(request.message.data.as_deref(), Some(&b"query"[..]));
            for i in 0..3u8 {
                let m = response(&request, Status::PENDING, Some(Bytes::from(vec![i; 4])));
                reply(&mut scp, &request, m).await;
            }
            reply(&mut scp, &request, response(&request, Status::SUCCESS, None)).await;
            scp
        });

        let mut operation = find(&mut scu, FIND, Bytes::from_static(b"query"), Priority::Medium)
            .await
            .unwrap();
        let mut responses = Vec::new();
        while let Some(r) = operation.next().await {
            responses.push(r.unwrap());
        }
        assert_eq!(responses.len(), 4);
        for (i, r) in responses[..3].iter().enumerate() {
            assert_eq!(
                r,
                &FindResponse::Match {
                    status: Status::PENDING,
                    identifier: Bytes::from(vec![i as u8; 4])
                }
            );
        }
        assert_eq!(
            responses[3],
            FindResponse::Complete {
                status: Status::SUCCESS
            }
        );
        assert!(operation.next().await.is_none());
        peer.await.unwrap();
        assert!(scu.state().is_established());
    }

    #[tokio::test]
    async fn test_stream_yields_in_order() {
        let (mut scu, mut scp) = established(&[FIND]).await;
        let peer = tokio::spawn(async move {
            let request = scp.receive_message().await.unwrap();
            for body in [&b"a"[..], &b"b"[..]] {
                let m = response(&request, Status::PENDING_WARNING, Some(Bytes::copy_from_slice(body)));
                reply(&mut scp, &request, m).await;
            }
            reply(&mut scp, &request, response(&request, Status::new(0xB000), None)).await;
        });

        let operation = find(&mut scu, FIND, Bytes::new(), Priority::High)
            .await
            .unwrap();
        let responses: Vec<_> = operation.into_stream().collect().await;
        let statuses: Vec<u16> = responses
            .iter()
            .map(|r| r.as_ref().unwrap().status().code())
            .collect();
        assert_eq!(statuses, vec![0xFF01, 0xFF01, 0xB000]);
        assert!(matches!(
            responses[2],
            Ok(FindResponse::Complete { .. })
        ));
        peer.await.unwrap();
    }

    #[tokio::test]
    async fn test_cancel_through_operation() {
        let (mut scu, mut scp) = established(&[FIND]).await;
        let peer = tokio::spawn(async move {
            let request = scp.receive_message().await.unwrap();
            let m = response(&request, Status::PENDING, Some(Bytes::from_static(b"m1")));
            reply(&mut scp, &request, m).await;
            let cancel = scp.receive_message().await.unwrap();
            assert_eq!(
                cancel
                    .message
                    .command
                    .message_id_being_responded_to()
                    .unwrap(),
                request.message.command.message_id().unwrap()
            );
            reply(&mut scp, &request, response(&request, Status::CANCEL, None)).await;
        });

        let mut operation = find(&mut scu, FIND, Bytes::new(), Priority::Medium)
            .await
            .unwrap();
        assert!(matches!(
            operation.next().await,
            Some(Ok(FindResponse::Match { .. }))
        ));
        operation.cancel().await.unwrap();
        assert_eq!(
            operation.next().await.unwrap().unwrap(),
            FindResponse::Complete {
                status: Status::CANCEL
            }
        );
        assert!(operation.next().await.is_none());
        peer.await.unwrap();
    }

    #[tokio::test]
    async fn test_failure_status_is_error() {
        let (mut scu, mut scp) = established(&[FIND]).await;
        let peer = tokio::spawn(async move {
            let request = scp.receive_message().await.unwrap();
            reply(
                &mut scp,
                &request,
                response(&request, Status::new(0xA700), None),
            )
            .await;
        });
        let operation = find(&mut scu, FIND, Bytes::new(), Priority::Low)
            .await
            .unwrap();
        let err = operation.collect_matches().await.unwrap_err();
        assert!(matches!(
            err,
            DimseError::OperationFailed {
                command: "C-FIND",
                ..
            }
        ));
        peer.await.unwrap();
        assert!(scu.state().is_established());
    }
}
