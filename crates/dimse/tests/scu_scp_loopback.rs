use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use dicom_dictionary_std::uids;
use dimse::audit::AuditEventKind;
use dimse::pdu::AssociationRjResult;
use dimse::{
    AssociationParameters, DimseConfig, DimseError, DimseScp, DimseScu, MemoryAuditSink, Priority, QueryRetrieveModel,
    ReceivedInstance, RemoteNode, ServiceProvider, Status, StoreFailure, StoreHandler,
    StoreOutcome, StoreRequest, StoreResult,
};
use tokio_util::sync::CancellationToken;

#[derive(Default)]
struct Archive {
    stored: Mutex<Vec<ReceivedInstance>>,
}

#[async_trait]
impl StoreHandler for Archive {
    async fn store(&self, instance: ReceivedInstance) -> StoreResult {
        if instance.data.is_empty() {
            return Err(StoreFailure::CannotUnderstand);
        }
        self.stored.lock().unwrap().push(instance);
        Ok(StoreOutcome::Success)
    }
}

#[async_trait]
impl ServiceProvider for Archive {
    async fn find(&self, _sop_class_uid: &str, identifier: Bytes) -> dimse::Result<Vec<Bytes>> {
        if identifier.as_ref() == b"fail" {
            return Err(DimseError::internal("index unavailable"));
        }
        Ok(vec![
            Bytes::from_static(b"match-1"),
            Bytes::from_static(b"match-2"),
            Bytes::from_static(b"match-3"),
        ])
    }
}

async fn start_scp(archive: Arc<Archive>) -> (RemoteNode, CancellationToken) {
    let mut config = DimseConfig::new("SCP1");
    config.bind_addr = "127.0.0.1".parse().unwrap();
    config.port = 0;
    let bound = DimseScp::new(config, archive).bind().await.unwrap();
    let port = bound.local_addr().unwrap().port();
    let shutdown = CancellationToken::new();
    tokio::spawn(bound.run(shutdown.clone()));
    (RemoteNode::new("SCP1", "127.0.0.1", port), shutdown)
}

fn scu(audit: &MemoryAuditSink) -> DimseScu {
    let mut config = DimseConfig::new("SCU1");
    config.max_pdu = 16384;
    DimseScu::new(config).with_audit_sink(Arc::new(audit.clone()))
}

#[tokio::test]
async fn echo_round_trip_is_audited() {
    let (node, shutdown) = start_scp(Arc::new(Archive::default())).await;
    let audit = MemoryAuditSink::new();

    let status = scu(&audit).echo(&node).await.unwrap();
    assert_eq!(status, Status::SUCCESS);

    let kinds = audit.kinds();
    assert!(matches!(kinds[0], AuditEventKind::AssociationEstablished { .. }));
    assert!(matches!(kinds[1], AuditEventKind::OperationCompleted { status: 0, .. }));
    assert!(matches!(kinds[2], AuditEventKind::AssociationReleased { .. }));
    shutdown.cancel();
}

#[tokio::test]
async fn store_forty_kilobytes_at_sixteen_k_pdus() {
    let archive = Arc::new(Archive::default());
    let (node, shutdown) = start_scp(archive.clone()).await;
    let audit = MemoryAuditSink::new();

    let payload: Vec<u8> = (0..40 * 1024).map(|i| (i % 251) as u8).collect();
    let request = StoreRequest::new(uids::CT_IMAGE_STORAGE, "1.2.826.0.1.1", Bytes::from(payload.clone()))
        .with_priority(Priority::High);
    let outcome = scu(&audit).store(&node, &request).await.unwrap();
    assert_eq!(outcome, StoreOutcome::Success);

    let stored = archive.stored.lock().unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].calling_ae_title, "SCU1");
    assert_eq!(stored[0].sop_instance_uid, "1.2.826.0.1.1");
    assert_eq!(stored[0].data.as_ref(), payload.as_slice());
    shutdown.cancel();
}

#[tokio::test]
async fn store_failure_keeps_batch_going() {
    let archive = Arc::new(Archive::default());
    let (node, shutdown) = start_scp(archive.clone()).await;
    let audit = MemoryAuditSink::new();

    let requests = vec![
        StoreRequest::new(uids::CT_IMAGE_STORAGE, "1.2.3.1", Bytes::new()),
        StoreRequest::new(uids::MR_IMAGE_STORAGE, "1.2.3.2", Bytes::from_static(b"DICM")),
    ];
    let results = scu(&audit).store_all(&node, &requests).await.unwrap();
    assert_eq!(results.len(), 2);
    assert!(matches!(
        results[0].1,
        Err(DimseError::StoreFailed {
            reason: StoreFailure::CannotUnderstand,
            ..
        })
    ));
    assert_eq!(results[1].1.as_ref().unwrap(), &StoreOutcome::Success);
    assert_eq!(archive.stored.lock().unwrap().len(), 1);
    shutdown.cancel();
}

#[tokio::test]
async fn find_returns_matches_in_order() {
    let (node, shutdown) = start_scp(Arc::new(Archive::default())).await;
    let audit = MemoryAuditSink::new();

    let matches = scu(&audit)
        .find(
            &node,
            QueryRetrieveModel::StudyRoot,
            Bytes::from_static(b"query"),
            Priority::Medium,
        )
        .await
        .unwrap();
    assert_eq!(
        matches,
        vec![
            Bytes::from_static(b"match-1"),
            Bytes::from_static(b"match-2"),
            Bytes::from_static(b"match-3"),
        ]
    );

    let err = scu(&audit)
        .find(
            &node,
            QueryRetrieveModel::PatientRoot,
            Bytes::from_static(b"fail"),
            Priority::Medium,
        )
        .await
        .unwrap_err();
    match err {
        DimseError::OperationFailed {
            command, comment, ..
        } => {
            assert_eq!(command, "C-FIND");
            assert!(comment.unwrap().contains("index unavailable"));
        }
        other => panic!("unexpected error {other:?}"),
    }
    shutdown.cancel();
}

#[tokio::test]
async fn unsupported_sop_class_is_negotiation_failure() {
    let (node, shutdown) = start_scp(Arc::new(Archive::default())).await;
    let audit = MemoryAuditSink::new();

    let err = scu(&audit)
        .move_request(
            &node,
            QueryRetrieveModel::StudyRoot,
            "ARCHIVE",
            Bytes::new(),
            Priority::Medium,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, DimseError::NoAcceptablePresentationContext));
    shutdown.cancel();
}

#[tokio::test]
async fn wrong_called_ae_is_rejected() {
    let (node, shutdown) = start_scp(Arc::new(Archive::default())).await;
    let audit = MemoryAuditSink::new();
    let mut wrong = node.clone();
    wrong.ae_title = "NOT_SCP".into();

    let err = scu(&audit).echo(&wrong).await.unwrap_err();
    assert!(matches!(err, DimseError::AssociationRejected(_)));
    shutdown.cancel();
}

#[tokio::test]
async fn busy_scp_rejects_transiently() {
    let mut config = DimseConfig::new("SCP1");
    config.bind_addr = "127.0.0.1".parse().unwrap();
    config.port = 0;
    config.max_associations = 1;
    let bound = DimseScp::new(config, Arc::new(Archive::default()))
        .bind()
        .await
        .unwrap();
    let node = RemoteNode::new("SCP1", "127.0.0.1", bound.local_addr().unwrap().port());
    let shutdown = CancellationToken::new();
    tokio::spawn(bound.run(shutdown.clone()));

    let audit = MemoryAuditSink::new();
    let first = scu(&audit);
    let params = AssociationParameters::for_node(first.config(), &node).with_context(
        uids::VERIFICATION,
        first.config().preferred_transfer_syntaxes.clone(),
    );
    let mut held = first.open(&node, params).await.unwrap();

    let err = scu(&audit).echo(&node).await.unwrap_err();
    match err {
        DimseError::AssociationRejected(rejection) => {
            assert_eq!(rejection.result, AssociationRjResult::Transient);
        }
        other => panic!("unexpected error {other:?}"),
    }

    held.release().await.unwrap();
    shutdown.cancel();
}
