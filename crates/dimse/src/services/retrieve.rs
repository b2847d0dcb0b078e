//! C-MOVE and C-GET as SCU.
//!
//! Both report progress through sub-operation counters carried by pending
//! responses and finish with a final response whose counters describe the whole
//! retrieve. For C-MOVE the sub-operations run on associations the peer opens
//! to the move destination, so only the counters are seen here. For C-GET the
//! peer sends C-STORE-RQ on this same association, interleaved with the
//! progress responses, and each is answered through a [`StoreHandler`] before
//! the next response is read.

use bytes::Bytes;
use futures::stream::BoxStream;
use serde::Serialize;
use tracing::{debug, info, warn};

use super::store::{handle_store_request, StoreFailure, StoreHandler};
use super::{check_response, failure, request_command, send_cancel};
use crate::association::Association;
use crate::error::{ProtocolError, Result};
use crate::message::{tags, CommandField, CommandValue, DimseMessage};
use crate::status::{Status, StatusClass};
use crate::types::{Priority, SubOperationCounters};

/// A sub-operation that failed on this side of a C-GET.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedInstance {
    pub sop_instance_uid: String,
    pub reason: StoreFailure,
}

/// Result of a retrieve whose final status was not a failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetrieveOutcome {
    pub status: Status,
    pub counters: SubOperationCounters,
    /// Instances this side refused while serving a C-GET.
    pub failed_instances: Vec<FailedInstance>,
    /// Identifier of the final response; for partial results it carries the
    /// Failed SOP Instance UID List reported by the peer.
    pub failed_instance_list: Option<Bytes>,
}

impl RetrieveOutcome {
    /// Some sub-operations failed or warned while others completed.
    pub fn is_partial(&self) -> bool {
        self.counters.failed > 0
            || self.counters.warning > 0
            || !self.failed_instances.is_empty()
            || self.status.is_warning()
    }

    pub fn is_cancelled(&self) -> bool {
        self.status.class() == StatusClass::Cancel
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetrieveEvent {
    /// Pending response.
    Progress(SubOperationCounters),
    /// An instance received through a C-GET sub-operation and the status it
    /// was answered with.
    Stored {
        sop_instance_uid: String,
        status: Status,
    },
    Completed(RetrieveOutcome),
}

/// An outstanding C-MOVE or C-GET.
pub struct RetrieveOperation<'a> {
    association: &'a mut Association,
    command: &'static str,
    response_field: CommandField,
    context_id: u8,
    message_id: u16,
    store_handler: Option<&'a dyn StoreHandler>,
    counters: SubOperationCounters,
    failed_instances: Vec<FailedInstance>,
    finished: bool,
    cancel_sent: bool,
}

/// Send a C-MOVE-RQ asking the peer to store matching instances on
/// `destination_ae_title`.
pub async fn move_request<'a>(
    association: &'a mut Association,
    sop_class_uid: &str,
    destination_ae_title: &str,
    identifier: Bytes,
    priority: Priority,
) -> Result<RetrieveOperation<'a>> {
    crate::config::validate_ae_title(destination_ae_title)?;
    let context_id = association.context_for(sop_class_uid)?.id;
    let message_id = association.next_message_id();
    let command = request_command(CommandField::CMoveRq, message_id, sop_class_uid)
        .with(tags::PRIORITY, CommandValue::U16(priority.code()))
        .with(
            tags::MOVE_DESTINATION,
            CommandValue::Ae(destination_ae_title.to_string()),
        );
    debug!(
        "Sending C-MOVE-RQ to {} (destination {}, message ID {})",
        association.peer_ae_title(),
        destination_ae_title,
        message_id
    );
    association
        .send_message(context_id, &DimseMessage::new(command, Some(identifier)))
        .await?;
    Ok(RetrieveOperation::new(
        association,
        "C-MOVE",
        CommandField::CMoveRsp,
        context_id,
        message_id,
        None,
    ))
}

/// Send a C-GET-RQ; instances arrive on this association and go to `handler`.
///
/// The association should have been negotiated with SCP role selection for
/// the storage SOP classes expected back.
pub async fn get<'a>(
    association: &'a mut Association,
    sop_class_uid: &str,
    identifier: Bytes,
    priority: Priority,
    handler: &'a dyn StoreHandler,
) -> Result<RetrieveOperation<'a>> {
    let context_id = association.context_for(sop_class_uid)?.id;
    let message_id = association.next_message_id();
    let command = request_command(CommandField::CGetRq, message_id, sop_class_uid)
        .with(tags::PRIORITY, CommandValue::U16(priority.code()));
    debug!("Sending C-GET-RQ (message ID {})", message_id);
    association
        .send_message(context_id, &DimseMessage::new(command, Some(identifier)))
        .await?;
    Ok(RetrieveOperation::new(
        association,
        "C-GET",
        CommandField::CGetRsp,
        context_id,
        message_id,
        Some(handler),
    ))
}

impl<'a> RetrieveOperation<'a> {
    fn new(
        association: &'a mut Association,
        command: &'static str,
        response_field: CommandField,
        context_id: u8,
        message_id: u16,
        store_handler: Option<&'a dyn StoreHandler>,
    ) -> Self {
        Self {
            association,
            command,
            response_field,
            context_id,
            message_id,
            store_handler,
            counters: SubOperationCounters::default(),
            failed_instances: Vec::new(),
            finished: false,
            cancel_sent: false,
        }
    }

    pub fn message_id(&self) -> u16 {
        self.message_id
    }

    /// Latest counters reported by the peer.
    pub fn counters(&self) -> SubOperationCounters {
        self.counters
    }

    /// Next event, or `None` after `Completed` or an error.
    pub async fn next(&mut self) -> Option<Result<RetrieveEvent>> {
        if self.finished {
            return None;
        }
        let event = self.receive().await;
        if event.is_err() {
            self.finished = true;
        }
        Some(event)
    }

    async fn receive(&mut self) -> Result<RetrieveEvent> {
        let received = self.association.receive_message().await?;

        let field = match received.message.command.command_field() {
            Ok(field) => field,
            Err(e) => {
                self.association.abort().await;
                return Err(e.into());
            }
        };
        if field == CommandField::CStoreRq.code() {
            let Some(handler) = self.store_handler else {
                let e = ProtocolError::UnexpectedCommand {
                    expected: self.response_field.code(),
                    actual: CommandField::CStoreRq.code(),
                };
                self.association.abort().await;
                return Err(e.into());
            };
            let (sop_instance_uid, result) =
                handle_store_request(self.association, received, handler).await?;
            let status = match result {
                Ok(outcome) => outcome.status(),
                Err(reason) => {
                    self.failed_instances.push(FailedInstance {
                        sop_instance_uid: sop_instance_uid.clone(),
                        reason,
                    });
                    reason.status()
                }
            };
            return Ok(RetrieveEvent::Stored {
                sop_instance_uid,
                status,
            });
        }

        let status =
            check_response(self.association, &received, self.response_field, self.message_id)
                .await?;
        self.counters = SubOperationCounters::from_command(&received.message.command);

        match status.class() {
            StatusClass::Pending => Ok(RetrieveEvent::Progress(self.counters)),
            StatusClass::Failure => {
                self.finished = true;
                warn!(
                    "{} failed with status {} ({} completed, {} failed)",
                    self.command, status, self.counters.completed, self.counters.failed
                );
                Err(failure(self.command, &received.message, status))
            }
            StatusClass::Success | StatusClass::Warning | StatusClass::Cancel => {
                self.finished = true;
                let outcome = RetrieveOutcome {
                    status,
                    counters: self.counters,
                    failed_instances: std::mem::take(&mut self.failed_instances),
                    failed_instance_list: received.message.data,
                };
                if outcome.is_partial() {
                    warn!(
                        "{} finished with partial success: {} completed, {} failed, {} warning",
                        self.command,
                        outcome.counters.completed,
                        outcome.counters.failed,
                        outcome.counters.warning
                    );
                } else {
                    info!(
                        "{} completed: {} sub-operations, status {}",
                        self.command, outcome.counters.completed, status
                    );
                }
                Ok(RetrieveEvent::Completed(outcome))
            }
        }
    }

    /// Send C-CANCEL-RQ; the peer ends the operation with its next final
    /// response, normally status Cancel.
    pub async fn cancel(&mut self) -> Result<()> {
        if self.finished || self.cancel_sent {
            return Ok(());
        }
        self.cancel_sent = true;
        send_cancel(self.association, self.context_id, self.message_id).await
    }

    /// Run to completion, discarding progress events.
    pub async fn wait(mut self) -> Result<RetrieveOutcome> {
        while let Some(event) = self.next().await {
            if let RetrieveEvent::Completed(outcome) = event? {
                return Ok(outcome);
            }
        }
        Err(crate::error::DimseError::internal(format!(
            "{} ended without a final response",
            self.command
        )))
    }

    pub fn into_stream(mut self) -> BoxStream<'a, Result<RetrieveEvent>> {
        Box::pin(async_stream::stream! {
            while let Some(event) = self.next().await {
                yield event;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use dicom_dictionary_std::uids;

    use super::*;
    use crate::association::AssociationParameters;
    use crate::error::DimseError;
    use crate::message::ReceivedMessage;
    use crate::negotiation::EXPLICIT_VR_LITTLE_ENDIAN;
    use crate::pdu::RoleSelection;
    use crate::services::response_command;
    use crate::services::store::{ReceivedInstance, StoreOutcome, StoreResult};
    use crate::services::testing::{established, established_with, reply};

    const MOVE: &str = uids::STUDY_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_MOVE;
    const GET: &str = uids::STUDY_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_GET;
    const CT: &str = uids::CT_IMAGE_STORAGE;

    fn progress(
        request: &ReceivedMessage,
        field: CommandField,
        status: Status,
        remaining: u16,
        completed: u16,
        failed: u16,
    ) -> DimseMessage {
        let command = response_command(field, &request.message.command, status)
            .with(tags::NUMBER_OF_REMAINING_SUBOPERATIONS, CommandValue::U16(remaining))
            .with(tags::NUMBER_OF_COMPLETED_SUBOPERATIONS, CommandValue::U16(completed))
            .with(tags::NUMBER_OF_FAILED_SUBOPERATIONS, CommandValue::U16(failed))
            .with(tags::NUMBER_OF_WARNING_SUBOPERATIONS, CommandValue::U16(0));
        DimseMessage::new(command, None)
    }

    /// Rejects every second instance.
    #[derive(Default)]
    struct Alternating {
        seen: AtomicUsize,
    }

    #[async_trait]
    impl StoreHandler for Alternating {
        async fn store(&self, _instance: ReceivedInstance) -> StoreResult {
            if self.seen.fetch_add(1, Ordering::SeqCst) % 2 == 1 {
                Err(StoreFailure::OutOfResources)
            } else {
                Ok(StoreOutcome::Success)
            }
        }
    }

    #[tokio::test]
    async fn test_move_reports_progress_then_outcome() {
        let (mut scu, mut scp) = established(&[MOVE]).await;
        let peer = tokio::spawn(async move {
            let request = scp.receive_message().await.unwrap();
            assert_eq!(
                request.message.command.get_str(tags::MOVE_DESTINATION),
                Some("ARCHIVE")
            );
            for done in 1..=2 {
                let m = progress(&request, CommandField::CMoveRsp, Status::PENDING, 2 - done, done, 0);
                reply(&mut scp, &request, m).await;
            }
            let last = progress(&request, CommandField::CMoveRsp, Status::SUCCESS, 0, 2, 0);
            reply(&mut scp, &request, last).await;
        });

        let mut operation = move_request(&mut scu, MOVE, "ARCHIVE", Bytes::new(), Priority::Medium)
            .await
            .unwrap();
        let mut events = Vec::new();
        while let Some(event) = operation.next().await {
            events.push(event.unwrap());
        }
        assert_eq!(events.len(), 3);
        assert!(matches!(
            events[0],
            RetrieveEvent::Progress(SubOperationCounters {
                remaining: 1,
                completed: 1,
                ..
            })
        ));
        let RetrieveEvent::Completed(outcome) = &events[2] else {
            panic!("expected completion");
        };
        assert_eq!(outcome.counters.completed, 2);
        assert!(!outcome.is_partial());
        peer.await.unwrap();
    }

    #[tokio::test]
    async fn test_move_partial_success() {
        let (mut scu, mut scp) = established(&[MOVE]).await;
        let peer = tokio::spawn(async move {
            let request = scp.receive_message().await.unwrap();
            let counters = progress(&request, CommandField::CMoveRsp, Status::new(0xB000), 0, 3, 1);
            let last = DimseMessage::new(counters.command, Some(Bytes::from_static(b"failed-uids")));
            reply(&mut scp, &request, last).await;
        });
        let outcome = move_request(&mut scu, MOVE, "ARCHIVE", Bytes::new(), Priority::Low)
            .await
            .unwrap()
            .wait()
            .await
            .unwrap();
        assert!(outcome.is_partial());
        assert_eq!(outcome.counters.failed, 1);
        assert_eq!(
            outcome.failed_instance_list,
            Some(Bytes::from_static(b"failed-uids"))
        );
        peer.await.unwrap();
    }

    #[tokio::test]
    async fn test_move_failure_status() {
        let (mut scu, mut scp) = established(&[MOVE]).await;
        let peer = tokio::spawn(async move {
            let request = scp.receive_message().await.unwrap();
            // move destination unknown
            let last = progress(&request, CommandField::CMoveRsp, Status::new(0xA801), 0, 0, 0);
            reply(&mut scp, &request, last).await;
        });
        let err = move_request(&mut scu, MOVE, "NOWHERE", Bytes::new(), Priority::Medium)
            .await
            .unwrap()
            .wait()
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            DimseError::OperationFailed {
                command: "C-MOVE",
                ..
            }
        ));
        peer.await.unwrap();
    }

    #[tokio::test]
    async fn test_get_serves_interleaved_stores() {
        let params = AssociationParameters::new("SCU1", "SCP1")
            .with_context(GET, vec![EXPLICIT_VR_LITTLE_ENDIAN.to_string()])
            .with_context(CT, vec![EXPLICIT_VR_LITTLE_ENDIAN.to_string()])
            .with_role_selection(RoleSelection {
                sop_class_uid: CT.to_string(),
                scu_role: false,
                scp_role: true,
            });
        let (mut scu, mut scp) = established_with(params).await;

        let peer = tokio::spawn(async move {
            let request = scp.receive_message().await.unwrap();
            let ct_context = scp.context_for(CT).unwrap().id;
            let mut statuses = Vec::new();
            for i in 0..2u16 {
                let message_id = scp.next_message_id();
                let store = crate::services::request_command(CommandField::CStoreRq, message_id, CT)
                    .with(tags::PRIORITY, CommandValue::U16(0))
                    .with(
                        tags::AFFECTED_SOP_INSTANCE_UID,
                        CommandValue::Uid(format!("1.2.3.{i}")),
                    );
                scp.send_message(ct_context, &DimseMessage::new(store, Some(Bytes::from(vec![0u8; 20_000]))))
                    .await
                    .unwrap();
                let rsp = scp.receive_message().await.unwrap();
                assert_eq!(rsp.message.command.message_id_being_responded_to().unwrap(), message_id);
                statuses.push(rsp.message.command.status().unwrap());
                let failed = statuses.iter().filter(|s| s.is_failure()).count() as u16;
                let m = progress(
                    &request,
                    CommandField::CGetRsp,
                    Status::PENDING,
                    1 - i,
                    i + 1 - failed,
                    failed,
                );
                reply(&mut scp, &request, m).await;
            }
            let last = progress(&request, CommandField::CGetRsp, Status::new(0xB000), 0, 1, 1);
            reply(&mut scp, &request, last).await;
            statuses
        });

        let handler = Alternating::default();
        let mut operation = get(&mut scu, GET, Bytes::new(), Priority::Medium, &handler)
            .await
            .unwrap();
        let mut stored = Vec::new();
        let mut outcome = None;
        while let Some(event) = operation.next().await {
            match event.unwrap() {
                RetrieveEvent::Stored {
                    sop_instance_uid,
                    status,
                } => stored.push((sop_instance_uid, status)),
                RetrieveEvent::Progress(_) => {}
                RetrieveEvent::Completed(o) => outcome = Some(o),
            }
        }
        let outcome = outcome.unwrap();
        assert_eq!(stored.len(), 2);
        assert_eq!(stored[1].1, Status::OUT_OF_RESOURCES);
        assert!(outcome.is_partial());
        assert_eq!(
            outcome.failed_instances,
            vec![FailedInstance {
                sop_instance_uid: "1.2.3.1".into(),
                reason: StoreFailure::OutOfResources
            }]
        );
        let statuses = peer.await.unwrap();
        assert_eq!(statuses, vec![Status::SUCCESS, Status::OUT_OF_RESOURCES]);
    }

    #[tokio::test]
    async fn test_store_during_move_is_protocol_error() {
        let (mut scu, mut scp) = established(&[MOVE, CT]).await;
        let peer = tokio::spawn(async move {
            let _request = scp.receive_message().await.unwrap();
            let ct_context = scp.context_for(CT).unwrap().id;
            let store = crate::services::request_command(CommandField::CStoreRq, 1, CT)
                .with(tags::AFFECTED_SOP_INSTANCE_UID, CommandValue::Uid("1.2".into()));
            scp.send_message(ct_context, &DimseMessage::new(store, Some(Bytes::from_static(b"x"))))
                .await
                .unwrap();
        });
        let err = move_request(&mut scu, MOVE, "ARCHIVE", Bytes::new(), Priority::Medium)
            .await
            .unwrap()
            .wait()
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            DimseError::Protocol(ProtocolError::UnexpectedCommand { .. })
        ));
        assert!(scu.state().is_terminal());
        peer.await.unwrap();
    }
}
