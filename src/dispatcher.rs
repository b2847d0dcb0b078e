//! Transfer dispatcher
//!
//! Pulls items from the [`TransferQueue`], runs each one on its own
//! association through the [`RetryExecutor`], and reports every outcome on
//! an mpsc channel. Concurrency is bounded by a semaphore.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dimse::{
    DimseScu, Priority, QueryRetrieveModel, RemoteNode, RetrieveOutcome, Status, StoreHandler,
    StoreOutcome, StoreRequest,
};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::Config;
use crate::error::{Result, TransferError};
use crate::queue::{PrioritizedTransferItem, QueueEvent, TransferPriority, TransferQueue};
use crate::reliability::{CircuitBreakerRegistry, RetryExecutor};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatcherConfig {
    /// Associations open at the same time
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,

    /// Capacity of the result channel returned by `spawn`
    #[serde(default = "default_result_buffer")]
    pub result_buffer: usize,
}

fn default_max_concurrent() -> usize {
    4
}

fn default_result_buffer() -> usize {
    64
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            result_buffer: default_result_buffer(),
        }
    }
}

impl DispatcherConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent == 0 {
            return Err(TransferError::config(
                "dispatcher.max_concurrent must be greater than 0",
            ));
        }
        if self.result_buffer == 0 {
            return Err(TransferError::config(
                "dispatcher.result_buffer must be greater than 0",
            ));
        }
        Ok(())
    }
}

/// The service operation a queued transfer performs
#[derive(Debug, Clone)]
pub enum TransferOperation {
    Echo,
    Store(StoreRequest),
    Find {
        model: QueryRetrieveModel,
        identifier: Bytes,
    },
    Move {
        model: QueryRetrieveModel,
        destination: String,
        identifier: Bytes,
    },
    Get {
        model: QueryRetrieveModel,
        identifier: Bytes,
        storage_sop_classes: Vec<String>,
    },
}

impl TransferOperation {
    pub fn name(&self) -> &'static str {
        match self {
            TransferOperation::Echo => "C-ECHO",
            TransferOperation::Store(_) => "C-STORE",
            TransferOperation::Find { .. } => "C-FIND",
            TransferOperation::Move { .. } => "C-MOVE",
            TransferOperation::Get { .. } => "C-GET",
        }
    }
}

/// Queue payload: an operation against a configured node
#[derive(Debug, Clone)]
pub struct TransferRequest {
    pub node: String,
    pub operation: TransferOperation,
}

impl TransferRequest {
    pub fn new(node: impl Into<String>, operation: TransferOperation) -> Self {
        Self {
            node: node.into(),
            operation,
        }
    }
}

#[derive(Debug)]
pub enum TransferOutput {
    Echo(Status),
    Stored(StoreOutcome),
    Found(Vec<Bytes>),
    Retrieved(RetrieveOutcome),
}

/// Final outcome of one queued transfer
#[derive(Debug)]
pub struct TransferResult {
    pub id: Uuid,
    pub tag: Option<String>,
    pub outcome: Result<TransferOutput>,
    /// Time between enqueue and dispatch
    pub waited: Duration,
}

/// Runs one attempt of an operation on a fresh association
#[async_trait]
pub trait OperationRunner: Send + Sync {
    async fn run(
        &self,
        node: &RemoteNode,
        operation: &TransferOperation,
        priority: Priority,
    ) -> dimse::Result<TransferOutput>;
}

/// [`OperationRunner`] backed by a [`DimseScu`]
#[derive(Clone)]
pub struct ScuRunner {
    scu: DimseScu,
    get_handler: Option<Arc<dyn StoreHandler>>,
}

impl ScuRunner {
    pub fn new(scu: DimseScu) -> Self {
        Self {
            scu,
            get_handler: None,
        }
    }

    /// Handler receiving instances retrieved with C-GET
    pub fn with_get_handler(mut self, handler: Arc<dyn StoreHandler>) -> Self {
        self.get_handler = Some(handler);
        self
    }
}

#[async_trait]
impl OperationRunner for ScuRunner {
    async fn run(
        &self,
        node: &RemoteNode,
        operation: &TransferOperation,
        priority: Priority,
    ) -> dimse::Result<TransferOutput> {
        match operation {
            TransferOperation::Echo => self.scu.echo(node).await.map(TransferOutput::Echo),
            TransferOperation::Store(request) => {
                let request = request.clone().with_priority(priority);
                self.scu.store(node, &request).await.map(TransferOutput::Stored)
            }
            TransferOperation::Find { model, identifier } => self
                .scu
                .find(node, *model, identifier.clone(), priority)
                .await
                .map(TransferOutput::Found),
            TransferOperation::Move {
                model,
                destination,
                identifier,
            } => self
                .scu
                .move_request(node, *model, destination, identifier.clone(), priority)
                .await
                .map(TransferOutput::Retrieved),
            TransferOperation::Get {
                model,
                identifier,
                storage_sop_classes,
            } => {
                let handler = self.get_handler.as_deref().ok_or_else(|| {
                    dimse::DimseError::config("C-GET requires a store handler")
                })?;
                self.scu
                    .get(
                        node,
                        *model,
                        identifier.clone(),
                        priority,
                        storage_sop_classes,
                        handler,
                    )
                    .await
                    .map(TransferOutput::Retrieved)
            }
        }
    }
}

pub struct TransferDispatcher {
    config: DispatcherConfig,
    queue: Arc<TransferQueue<TransferRequest>>,
    nodes: Arc<HashMap<String, RemoteNode>>,
    runner: Arc<dyn OperationRunner>,
    executor: Arc<RetryExecutor>,
    cancel: CancellationToken,
    outcomes: mpsc::UnboundedReceiver<QueueEvent>,
}

impl TransferDispatcher {
    pub fn new(
        config: DispatcherConfig,
        queue: Arc<TransferQueue<TransferRequest>>,
        nodes: HashMap<String, RemoteNode>,
        runner: Arc<dyn OperationRunner>,
        executor: RetryExecutor,
        cancel: CancellationToken,
    ) -> Self {
        let executor = executor.with_cancellation_token(cancel.child_token());
        let outcomes = queue.track_outcomes();
        Self {
            config,
            outcomes,
            queue,
            nodes: Arc::new(nodes),
            runner,
            executor: Arc::new(executor),
            cancel,
        }
    }

    /// Build a dispatcher over a [`DimseScu`] from a validated configuration
    pub fn from_config(config: &Config) -> Result<Self> {
        config.validate()?;
        let cancel = CancellationToken::new();
        let scu = DimseScu::from_config(config.dimse.clone())?
            .with_cancellation_token(cancel.child_token());
        let executor = RetryExecutor::new(
            config.retry.clone(),
            Arc::new(CircuitBreakerRegistry::new(config.circuit_breaker.clone())),
        );
        Ok(Self::new(
            config.dispatcher.clone(),
            Arc::new(TransferQueue::new(config.queue.clone())),
            config.nodes.clone(),
            Arc::new(ScuRunner::new(scu)),
            executor,
            cancel,
        ))
    }

    pub fn queue(&self) -> &Arc<TransferQueue<TransferRequest>> {
        &self.queue
    }

    pub fn executor(&self) -> &Arc<RetryExecutor> {
        &self.executor
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Queue a transfer for a configured node
    pub fn submit(&self, item: PrioritizedTransferItem<TransferRequest>) -> Result<Uuid> {
        if !self.nodes.contains_key(&item.payload.node) {
            return Err(TransferError::UnknownNode(item.payload.node.clone()));
        }
        self.queue.enqueue(item)
    }

    /// Convenience over [`submit`](Self::submit)
    pub fn submit_request(
        &self,
        request: TransferRequest,
        priority: TransferPriority,
    ) -> Result<Uuid> {
        self.submit(PrioritizedTransferItem::new(request, priority))
    }

    /// Stop dispatching and cancel in-flight transfers, aborting their
    /// associations. Queued items stay queued.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Run the dispatcher on a background task
    pub fn spawn(self) -> (tokio::task::JoinHandle<()>, mpsc::Receiver<TransferResult>) {
        let (tx, rx) = mpsc::channel(self.config.result_buffer);
        (tokio::spawn(self.run(tx)), rx)
    }

    /// Dispatch until cancelled or until `results` is closed
    pub async fn run(self, results: mpsc::Sender<TransferResult>) {
        info!(
            "Transfer dispatcher started (max {} concurrent)",
            self.config.max_concurrent
        );
        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent));
        let mut outcomes = self.outcomes;
        let mut in_flight = JoinSet::new();

        loop {
            while in_flight.try_join_next().is_some() {}

            // Queue outcomes are reported even while every permit is taken.
            let (permit, item) = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                _ = results.closed() => break,
                Some(event) = outcomes.recv() => {
                    if let Some(result) = event_result(event) {
                        if results.send(result).await.is_err() {
                            break;
                        }
                    }
                    continue;
                }
                next = next_dispatch(&semaphore, &self.queue, &self.cancel) => match next {
                    Some(next) => next,
                    None => break,
                },
            };

            let waited = item.waited(Instant::now());
            let Some(node) = self.nodes.get(&item.payload.node).cloned() else {
                let _ = results
                    .send(TransferResult {
                        id: item.id,
                        tag: item.tag,
                        outcome: Err(TransferError::UnknownNode(item.payload.node)),
                        waited,
                    })
                    .await;
                continue;
            };

            let runner = self.runner.clone();
            let executor = self.executor.clone();
            let results = results.clone();
            let span = info_span!(
                "transfer",
                id = %item.id,
                op = item.payload.operation.name(),
                node = %item.payload.node,
                priority = %item.priority
            );
            in_flight.spawn(
                async move {
                    let _permit = permit;
                    let priority = item.priority.dimse_priority();
                    let operation = &item.payload.operation;
                    debug!("Dispatching after {:?} in queue", waited);
                    let outcome = executor
                        .execute(&node.destination_key(), |_| {
                            runner.run(&node, operation, priority)
                        })
                        .await;
                    match &outcome {
                        Ok(_) => info!("Transfer completed"),
                        Err(e) => warn!("Transfer failed: {}", e),
                    }
                    let _ = results
                        .send(TransferResult {
                            id: item.id,
                            tag: item.tag.clone(),
                            outcome,
                            waited,
                        })
                        .await;
                }
                .instrument(span),
            );
        }

        self.cancel.cancel();
        while in_flight.join_next().await.is_some() {}
        info!("Transfer dispatcher stopped");
    }
}

/// Wait for a free slot, then for the next item. Dropping the future never
/// loses an item since the dequeue completes within a single poll.
async fn next_dispatch(
    semaphore: &Arc<Semaphore>,
    queue: &TransferQueue<TransferRequest>,
    cancel: &CancellationToken,
) -> Option<(OwnedSemaphorePermit, PrioritizedTransferItem<TransferRequest>)> {
    let permit = semaphore.clone().acquire_owned().await.ok()?;
    let item = queue.next(cancel).await?;
    Some((permit, item))
}

/// Queue events that end a transfer without dispatching it
fn event_result(event: QueueEvent) -> Option<TransferResult> {
    let (id, tag, error) = match event {
        QueueEvent::ItemExpired { id, tag, .. } => (id, tag, TransferError::ItemExpired(id)),
        QueueEvent::ItemDropped { id, tag, .. } => (id, tag, TransferError::Dropped(id)),
        QueueEvent::ItemCancelled { id, tag } => (id, tag, TransferError::Cancelled),
        QueueEvent::ItemPromoted { id, from, to } => {
            debug!("Transfer {} promoted from {} to {}", id, from, to);
            return None;
        }
    };
    Some(TransferResult {
        id,
        tag,
        outcome: Err(error),
        waited: Duration::ZERO,
    })
}
