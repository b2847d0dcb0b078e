use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use dicom_dictionary_std::uids;
use dimse::{
    DimseConfig, DimseScp, DimseScu, MemoryAuditSink, ReceivedInstance, RemoteNode,
    ServiceProvider, StoreHandler, StoreOutcome, StoreRequest, StoreResult,
};
use dimse_transfer::{
    CircuitBreakerRegistry, DispatcherConfig, ErrorCategory, PrioritizedTransferItem,
    QueueConfig, RetryExecutor, RetryPolicy, ScuRunner, TransferDispatcher, TransferError,
    TransferOperation, TransferOutput, TransferPriority, TransferQueue, TransferRequest,
};
use tokio_util::sync::CancellationToken;

#[derive(Default)]
struct Archive {
    stored: Mutex<Vec<String>>,
}

#[async_trait]
impl StoreHandler for Archive {
    async fn store(&self, instance: ReceivedInstance) -> StoreResult {
        self.stored.lock().unwrap().push(instance.sop_instance_uid);
        Ok(StoreOutcome::Success)
    }
}

#[async_trait]
impl ServiceProvider for Archive {
    async fn find(&self, _sop_class_uid: &str, _identifier: Bytes) -> dimse::Result<Vec<Bytes>> {
        Ok(Vec::new())
    }
}

async fn start_scp(archive: Arc<Archive>) -> (RemoteNode, CancellationToken) {
    let mut config = DimseConfig::new("ARCHIVE");
    config.bind_addr = "127.0.0.1".parse().unwrap();
    config.port = 0;
    let bound = DimseScp::new(config, archive).bind().await.unwrap();
    let port = bound.local_addr().unwrap().port();
    let shutdown = CancellationToken::new();
    tokio::spawn(bound.run(shutdown.clone()));
    (RemoteNode::new("ARCHIVE", "127.0.0.1", port), shutdown)
}

#[tokio::test]
async fn queued_transfers_reach_the_archive() {
    let archive = Arc::new(Archive::default());
    let (node, shutdown) = start_scp(archive.clone()).await;
    let mut wrong_ae = node.clone();
    wrong_ae.ae_title = "NOBODY".into();

    let audit = MemoryAuditSink::new();
    let cancel = CancellationToken::new();
    let scu = DimseScu::new(DimseConfig::new("TRANSFER"))
        .with_audit_sink(Arc::new(audit.clone()))
        .with_cancellation_token(cancel.child_token());
    let dispatcher = TransferDispatcher::new(
        DispatcherConfig {
            max_concurrent: 2,
            result_buffer: 8,
        },
        Arc::new(TransferQueue::new(QueueConfig::default())),
        HashMap::from([
            ("archive".to_string(), node.clone()),
            ("misconfigured".to_string(), wrong_ae),
        ]),
        Arc::new(ScuRunner::new(scu)),
        RetryExecutor::new(
            RetryPolicy::default(),
            Arc::new(CircuitBreakerRegistry::default()),
        ),
        cancel.clone(),
    );

    let echo = dispatcher
        .submit_request(
            TransferRequest::new("archive", TransferOperation::Echo),
            TransferPriority::High,
        )
        .unwrap();
    let store = dispatcher
        .submit(
            PrioritizedTransferItem::new(
                TransferRequest::new(
                    "archive",
                    TransferOperation::Store(StoreRequest::new(
                        uids::CT_IMAGE_STORAGE,
                        "1.2.826.0.1.3680043.2.1",
                        Bytes::from_static(b"encoded data set"),
                    )),
                ),
                TransferPriority::Normal,
            )
            .with_tag("study-1"),
        )
        .unwrap();
    let rejected = dispatcher
        .submit_request(
            TransferRequest::new("misconfigured", TransferOperation::Echo),
            TransferPriority::Low,
        )
        .unwrap();

    let (handle, mut rx) = dispatcher.spawn();
    let mut outcomes = HashMap::new();
    for _ in 0..3 {
        let result = rx.recv().await.unwrap();
        outcomes.insert(result.id, result);
    }

    assert!(matches!(
        outcomes[&echo].outcome,
        Ok(TransferOutput::Echo(status)) if status.is_success()
    ));
    assert!(matches!(
        outcomes[&store].outcome,
        Ok(TransferOutput::Stored(StoreOutcome::Success))
    ));
    assert_eq!(outcomes[&store].tag.as_deref(), Some("study-1"));
    assert!(matches!(
        outcomes[&rejected].outcome,
        Err(TransferError::NotRetryable {
            category: ErrorCategory::Configuration,
            ..
        })
    ));
    assert_eq!(
        *archive.stored.lock().unwrap(),
        vec!["1.2.826.0.1.3680043.2.1".to_string()]
    );
    assert!(!audit.events().is_empty());

    cancel.cancel();
    handle.await.unwrap();
    shutdown.cancel();
}
