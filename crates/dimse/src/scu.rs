//! Service Class User (SCU) implementation for outbound DIMSE operations
//!
//! Each call opens one association to the remote node, proposes only the
//! presentation contexts that operation needs, runs it, and releases the
//! association. Any error aborts the association instead.

use std::sync::Arc;

use bytes::Bytes;
use dicom_dictionary_std::uids;
use futures::stream::BoxStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument};

use crate::association::{Association, AssociationParameters, Connection};
use crate::audit::{AuditEvent, AuditEventKind, AuditSink, TracingAuditSink};
use crate::config::{DimseConfig, RemoteNode};
use crate::pdu::RoleSelection;
use crate::services::{
    self, FindResponse, RetrieveOutcome, StoreHandler, StoreOutcome, StoreRequest,
};
use crate::status::Status;
use crate::types::{DimseCommand, Priority, QueryRetrieveModel};
use crate::{DimseError, Result};

#[cfg(feature = "tls")]
use crate::tls::TlsConnector;

/// DIMSE Service Class User
#[derive(Clone)]
pub struct DimseScu {
    config: DimseConfig,
    audit: Arc<dyn AuditSink>,
    cancel: CancellationToken,
    #[cfg(feature = "tls")]
    tls: Option<TlsConnector>,
}

impl DimseScu {
    /// Create a new SCU with the given configuration
    pub fn new(config: DimseConfig) -> Self {
        Self {
            config,
            audit: Arc::new(TracingAuditSink),
            cancel: CancellationToken::new(),
            #[cfg(feature = "tls")]
            tls: None,
        }
    }

    /// Create an SCU, loading TLS material when the configuration carries it.
    pub fn from_config(config: DimseConfig) -> Result<Self> {
        config.validate()?;
        #[cfg(feature = "tls")]
        let tls = config
            .tls
            .as_ref()
            .map(TlsConnector::from_config)
            .transpose()?;
        let scu = Self::new(config);
        #[cfg(feature = "tls")]
        let scu = Self { tls, ..scu };
        Ok(scu)
    }

    pub fn with_audit_sink(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = audit;
        self
    }

    /// Associations opened by this SCU abort once `token` is cancelled.
    pub fn with_cancellation_token(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn config(&self) -> &DimseConfig {
        &self.config
    }

    fn parameters(&self, node: &RemoteNode) -> AssociationParameters {
        AssociationParameters::for_node(&self.config, node)
    }

    fn transfer_syntaxes(&self) -> Vec<String> {
        self.config.preferred_transfer_syntaxes.clone()
    }

    async fn connect(&self, node: &RemoteNode, params: &AssociationParameters) -> Result<Connection> {
        if node.use_tls {
            #[cfg(feature = "tls")]
            {
                let connector = self.tls.as_ref().ok_or_else(|| {
                    DimseError::config(format!(
                        "Node {} requires TLS but no TLS configuration is loaded",
                        node.ae_title
                    ))
                })?;
                return connector
                    .connect(
                        &node.host,
                        node.port,
                        node.tls_server_name.as_deref(),
                        params.connect_timeout,
                    )
                    .await;
            }
            #[cfg(not(feature = "tls"))]
            {
                return Err(DimseError::NotSupported(
                    "TLS connections require feature 'tls'".into(),
                ));
            }
        }
        Connection::connect(&node.host, node.port, params.connect_timeout).await
    }

    /// Connect and negotiate.
    pub async fn open(&self, node: &RemoteNode, params: AssociationParameters) -> Result<Association> {
        node.validate()?;
        let connection = self.connect(node, &params).await?;
        let mut association =
            Association::new(connection, params)?.with_cancellation_token(self.cancel.child_token());
        association.establish().await?;
        self.audit.record(AuditEvent::new(AuditEventKind::AssociationEstablished {
            calling_ae_title: association.local_ae_title().to_string(),
            called_ae_title: association.peer_ae_title().to_string(),
            peer: node.destination_key(),
            encrypted: association.is_encrypted(),
        }));
        Ok(association)
    }

    /// Release after success, abort after failure, and report both.
    async fn finish<T>(
        &self,
        mut association: Association,
        command: DimseCommand,
        result: Result<T>,
        status: impl FnOnce(&T) -> (Status, Option<crate::types::SubOperationCounters>),
    ) -> Result<T> {
        let peer_ae_title = association.peer_ae_title().to_string();
        match &result {
            Ok(value) => {
                let (status, counters) = status(value);
                self.audit.record(AuditEvent::new(AuditEventKind::OperationCompleted {
                    command,
                    peer_ae_title: peer_ae_title.clone(),
                    status: status.code(),
                    counters,
                }));
                match association.release().await {
                    Ok(()) => self.audit.record(AuditEvent::new(
                        AuditEventKind::AssociationReleased { peer_ae_title },
                    )),
                    Err(e) => {
                        warn!("Release of association with {} failed: {}", peer_ae_title, e);
                        self.audit.record(AuditEvent::new(AuditEventKind::AssociationAborted {
                            peer_ae_title,
                            reason: e.to_string(),
                        }));
                    }
                }
            }
            Err(e) => {
                self.audit.record(AuditEvent::new(AuditEventKind::OperationFailed {
                    command,
                    peer_ae_title: peer_ae_title.clone(),
                    error: e.to_string(),
                }));
                association.abort().await;
                self.audit.record(AuditEvent::new(AuditEventKind::AssociationAborted {
                    peer_ae_title,
                    reason: e.to_string(),
                }));
            }
        }
        result
    }

    /// Send a C-ECHO request to a remote node
    pub async fn echo(&self, node: &RemoteNode) -> Result<Status> {
        info!("Sending C-ECHO to {}@{}:{}", node.ae_title, node.host, node.port);
        let params = self
            .parameters(node)
            .with_context(uids::VERIFICATION, self.transfer_syntaxes());
        let span = tracing::info_span!("association", peer = %node.destination_key());
        async {
            let mut association = self.open(node, params).await?;
            let result = services::echo(&mut association).await;
            self.finish(association, DimseCommand::Echo, result, |s| (*s, None))
                .await
        }
        .instrument(span)
        .await
    }

    /// Send a C-FIND request and collect every match identifier.
    pub async fn find(
        &self,
        node: &RemoteNode,
        model: QueryRetrieveModel,
        identifier: Bytes,
        priority: Priority,
    ) -> Result<Vec<Bytes>> {
        info!(
            "Sending C-FIND to {}@{}:{} ({:?})",
            node.ae_title, node.host, node.port, model
        );
        let sop_class = model.find_sop_class();
        let params = self
            .parameters(node)
            .with_context(sop_class, self.transfer_syntaxes());
        let mut association = self.open(node, params).await?;
        let result = match services::find(&mut association, sop_class, identifier, priority).await {
            Ok(operation) => operation.collect_matches().await,
            Err(e) => Err(e),
        };
        self.finish(association, DimseCommand::Find, result, |_| (Status::SUCCESS, None))
            .await
    }

    /// Send a C-FIND request, yielding responses as they arrive.
    ///
    /// The association lives as long as the stream; dropping the stream early
    /// drops the connection without a release.
    pub fn find_stream(
        &self,
        node: RemoteNode,
        model: QueryRetrieveModel,
        identifier: Bytes,
        priority: Priority,
    ) -> BoxStream<'static, Result<FindResponse>> {
        let scu = self.clone();
        Box::pin(async_stream::try_stream! {
            let sop_class = model.find_sop_class();
            let params = scu
                .parameters(&node)
                .with_context(sop_class, scu.transfer_syntaxes());
            let mut association = scu.open(&node, params).await?;
            let mut failure = None;
            let mut final_status = Status::SUCCESS;
            match services::find(&mut association, sop_class, identifier, priority).await {
                Ok(mut operation) => {
                    while let Some(response) = operation.next().await {
                        match response {
                            Ok(response) => {
                                final_status = response.status();
                                yield response;
                            }
                            Err(e) => {
                                failure = Some(e);
                                break;
                            }
                        }
                    }
                }
                Err(e) => failure = Some(e),
            }
            let result = match failure {
                Some(e) => Err(e),
                None => Ok(()),
            };
            scu.finish(association, DimseCommand::Find, result, |_| (final_status, None))
                .await?;
        })
    }

    /// Store one instance
    pub async fn store(&self, node: &RemoteNode, request: &StoreRequest) -> Result<StoreOutcome> {
        let outcomes = self.store_all(node, std::slice::from_ref(request)).await?;
        outcomes
            .into_iter()
            .next()
            .map(|(_, outcome)| outcome)
            .unwrap_or_else(|| Err(DimseError::internal("no C-STORE result")))
    }

    /// Store several instances over a single association.
    ///
    /// Per-instance failure statuses are reported in the returned list and do
    /// not stop the batch; association-level errors do.
    pub async fn store_all(
        &self,
        node: &RemoteNode,
        requests: &[StoreRequest],
    ) -> Result<Vec<(String, Result<StoreOutcome>)>> {
        info!(
            "Sending {} instance(s) via C-STORE to {}@{}:{}",
            requests.len(),
            node.ae_title,
            node.host,
            node.port
        );
        let mut params = self.parameters(node);
        let mut proposed: Vec<(&str, Vec<String>)> = Vec::new();
        for request in requests {
            let syntaxes = match &request.transfer_syntax {
                Some(ts) => vec![ts.clone()],
                None => self.transfer_syntaxes(),
            };
            let key = (request.sop_class_uid.as_str(), syntaxes);
            if !proposed.contains(&key) {
                proposed.push(key);
            }
        }
        for (sop_class, syntaxes) in proposed {
            params = params.with_context(sop_class, syntaxes);
        }

        let mut association = self.open(node, params).await?;
        let mut outcomes = Vec::with_capacity(requests.len());
        let mut fatal = None;
        for request in requests {
            match services::store(&mut association, request).await {
                Err(e) if e.is_fatal_to_association() => {
                    fatal = Some(e);
                    break;
                }
                result => outcomes.push((request.sop_instance_uid.clone(), result)),
            }
        }
        let result = match fatal {
            Some(e) => Err(e),
            None => Ok(outcomes),
        };
        self.finish(association, DimseCommand::Store, result, |outcomes| {
            let status = outcomes
                .iter()
                .find_map(|(_, r)| match r {
                    Err(DimseError::StoreFailed { status, .. }) => Some(*status),
                    _ => None,
                })
                .unwrap_or(Status::SUCCESS);
            (status, None)
        })
        .await
    }

    /// Send a C-MOVE request to a remote node
    pub async fn move_request(
        &self,
        node: &RemoteNode,
        model: QueryRetrieveModel,
        destination_ae_title: &str,
        identifier: Bytes,
        priority: Priority,
    ) -> Result<RetrieveOutcome> {
        info!(
            "Sending C-MOVE to {}@{}:{} (dest: {})",
            node.ae_title, node.host, node.port, destination_ae_title
        );
        let sop_class = model.move_sop_class();
        let params = self
            .parameters(node)
            .with_context(sop_class, self.transfer_syntaxes());
        let mut association = self.open(node, params).await?;
        let result = match services::move_request(
            &mut association,
            sop_class,
            destination_ae_title,
            identifier,
            priority,
        )
        .await
        {
            Ok(operation) => operation.wait().await,
            Err(e) => Err(e),
        };
        self.finish(association, DimseCommand::Move, result, |o| {
            (o.status, Some(o.counters))
        })
        .await
    }

    /// Send a C-GET request; instances of `storage_sop_classes` come back on
    /// the same association and are passed to `handler`.
    pub async fn get(
        &self,
        node: &RemoteNode,
        model: QueryRetrieveModel,
        identifier: Bytes,
        priority: Priority,
        storage_sop_classes: &[String],
        handler: &dyn StoreHandler,
    ) -> Result<RetrieveOutcome> {
        info!(
            "Sending C-GET to {}@{}:{} ({} storage classes)",
            node.ae_title,
            node.host,
            node.port,
            storage_sop_classes.len()
        );
        let sop_class = model.get_sop_class();
        let mut params = self
            .parameters(node)
            .with_context(sop_class, self.transfer_syntaxes());
        for storage in storage_sop_classes {
            params = params
                .with_context(storage.as_str(), self.transfer_syntaxes())
                .with_role_selection(RoleSelection {
                    sop_class_uid: storage.clone(),
                    scu_role: false,
                    scp_role: true,
                });
        }
        let mut association = self.open(node, params).await?;
        for storage in storage_sop_classes {
            if association.context_for(storage).is_err() {
                debug!("Peer did not accept storage class {} for C-GET", storage);
            }
        }
        let result =
            match services::get(&mut association, sop_class, identifier, priority, handler).await {
                Ok(operation) => operation.wait().await,
                Err(e) => Err(e),
            };
        self.finish(association, DimseCommand::Get, result, |o| {
            (o.status, Some(o.counters))
        })
        .await
    }
}

impl std::fmt::Debug for DimseScu {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DimseScu")
            .field("local_aet", &self.config.local_aet)
            .finish()
    }
}
