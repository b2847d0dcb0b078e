//! Service Class Provider (SCP) implementation for inbound DIMSE operations

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use dicom_dictionary_std::uids;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, span, warn, Instrument, Level};

use crate::association::{AcceptorOptions, Association, Connection};
use crate::audit::{AuditEvent, AuditEventKind, AuditSink, TracingAuditSink};
use crate::config::DimseConfig;
use crate::message::{tags, CommandField, CommandValue, DimseMessage, ReceivedMessage};
use crate::services::echo::echo_response;
use crate::services::{handle_store_request, response_command, StoreHandler};
use crate::status::Status;
use crate::types::DimseCommand;
use crate::{DimseError, Result};

#[cfg(feature = "tls")]
use crate::tls::TlsAcceptor;

/// Storage SOP classes accepted when the configuration names none.
pub const DEFAULT_STORAGE_SOP_CLASSES: &[&str] = &[
    uids::CT_IMAGE_STORAGE,
    uids::MR_IMAGE_STORAGE,
    uids::ULTRASOUND_IMAGE_STORAGE,
    uids::SECONDARY_CAPTURE_IMAGE_STORAGE,
    uids::COMPUTED_RADIOGRAPHY_IMAGE_STORAGE,
];

/// The services an SCP offers. C-STORE goes through the [`StoreHandler`]
/// supertrait.
#[async_trait]
pub trait ServiceProvider: StoreHandler {
    /// Status for a C-ECHO from `calling_ae_title`
    async fn echo(&self, _calling_ae_title: &str) -> Status {
        Status::SUCCESS
    }

    /// Encoded identifiers matching the encoded query `identifier`
    async fn find(&self, sop_class_uid: &str, identifier: Bytes) -> Result<Vec<Bytes>>;
}

/// DIMSE Service Class Provider
pub struct DimseScp {
    config: DimseConfig,
    provider: Arc<dyn ServiceProvider>,
    audit: Arc<dyn AuditSink>,
    active_associations: Arc<RwLock<u32>>,
    #[cfg(feature = "tls")]
    tls: Option<TlsAcceptor>,
}

/// An SCP bound to its listening socket.
pub struct BoundScp {
    listener: TcpListener,
    scp: Arc<DimseScp>,
}

impl DimseScp {
    /// Create a new SCP with the given configuration and service provider
    pub fn new(config: DimseConfig, provider: Arc<dyn ServiceProvider>) -> Self {
        Self {
            config,
            provider,
            audit: Arc::new(TracingAuditSink),
            active_associations: Arc::new(RwLock::new(0)),
            #[cfg(feature = "tls")]
            tls: None,
        }
    }

    pub fn with_audit_sink(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = audit;
        self
    }

    /// Abstract syntaxes this SCP negotiates.
    fn abstract_syntaxes(&self) -> Vec<String> {
        if !self.config.accepted_sop_classes.is_empty() {
            return self.config.accepted_sop_classes.clone();
        }
        let mut syntaxes = Vec::new();
        if self.config.enable_echo {
            syntaxes.push(uids::VERIFICATION.to_string());
        }
        if self.config.enable_find {
            syntaxes.push(uids::PATIENT_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_FIND.to_string());
            syntaxes.push(uids::STUDY_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_FIND.to_string());
        }
        if self.config.enable_store {
            syntaxes.extend(DEFAULT_STORAGE_SOP_CLASSES.iter().map(|s| s.to_string()));
        }
        syntaxes
    }

    /// Validate the configuration and bind the listener
    pub async fn bind(self) -> Result<BoundScp> {
        self.config.validate()?;
        #[cfg(feature = "tls")]
        let scp = {
            let tls = self
                .config
                .tls
                .as_ref()
                .map(TlsAcceptor::from_config)
                .transpose()?;
            Self { tls, ..self }
        };
        #[cfg(not(feature = "tls"))]
        let scp = self;

        let addr = SocketAddr::new(scp.config.bind_addr, scp.config.port);
        let listener = TcpListener::bind(addr).await?;
        info!(
            "Starting DIMSE SCP on {} (AET: {})",
            listener.local_addr()?,
            scp.config.local_aet
        );
        Ok(BoundScp {
            listener,
            scp: Arc::new(scp),
        })
    }

    /// Bind and serve until the process ends
    pub async fn run(self) -> Result<()> {
        self.bind().await?.run(CancellationToken::new()).await
    }

    async fn handle_connection(&self, stream: TcpStream, peer_addr: SocketAddr) -> Result<()> {
        #[cfg(feature = "tls")]
        let connection = match &self.tls {
            Some(acceptor) => acceptor.accept(stream, self.config.artim_timeout()).await?,
            None => Connection::from_tcp(stream),
        };
        #[cfg(not(feature = "tls"))]
        let connection = Connection::from_tcp(stream);

        {
            let mut active = self.active_associations.write().await;
            if *active >= self.config.max_associations {
                drop(active);
                warn!(
                    "Maximum associations reached, rejecting association from {}",
                    peer_addr
                );
                return Association::reject_busy(connection, self.config.artim_timeout()).await;
            }
            *active += 1;
        }

        let result = self.handle_association(connection, peer_addr).await;

        {
            let mut active = self.active_associations.write().await;
            *active = active.saturating_sub(1);
        }

        result
    }

    async fn handle_association(&self, connection: Connection, peer_addr: SocketAddr) -> Result<()> {
        let options = AcceptorOptions::from_config(&self.config, self.abstract_syntaxes());
        let mut association = Association::accept(connection, &options).await?;
        let peer_ae_title = association.peer_ae_title().to_string();
        self.audit.record(AuditEvent::new(AuditEventKind::AssociationEstablished {
            calling_ae_title: peer_ae_title.clone(),
            called_ae_title: self.config.local_aet.clone(),
            peer: peer_addr.to_string(),
            encrypted: association.is_encrypted(),
        }));

        loop {
            let request = match association.receive_message().await {
                Ok(request) => request,
                Err(DimseError::PeerReleased) => {
                    info!("Association with {} released", peer_ae_title);
                    self.audit
                        .record(AuditEvent::new(AuditEventKind::AssociationReleased {
                            peer_ae_title,
                        }));
                    return Ok(());
                }
                Err(e) => {
                    self.audit
                        .record(AuditEvent::new(AuditEventKind::AssociationAborted {
                            peer_ae_title,
                            reason: e.to_string(),
                        }));
                    return Err(e);
                }
            };
            if let Err(e) = self.handle_request(&mut association, request).await {
                if e.is_fatal_to_association() {
                    association.abort().await;
                    self.audit
                        .record(AuditEvent::new(AuditEventKind::AssociationAborted {
                            peer_ae_title,
                            reason: e.to_string(),
                        }));
                    return Err(e);
                }
                warn!("Request from {} failed: {}", peer_ae_title, e);
            }
        }
    }

    async fn handle_request(
        &self,
        association: &mut Association,
        request: ReceivedMessage,
    ) -> Result<()> {
        let field = request.message.command_field()?;
        let context_id = request.presentation_context_id;
        debug!("Received {} on context {}", field.name(), context_id);

        match field {
            CommandField::CEchoRq if self.config.enable_echo => {
                debug!("Processing C-ECHO request");
                let status = self.provider.echo(association.peer_ae_title()).await;
                let response = echo_response(&request.message, status);
                association.send_message(context_id, &response).await?;
                self.completed(association, DimseCommand::Echo, status);
            }
            CommandField::CStoreRq if self.config.enable_store => {
                let (uid, result) =
                    handle_store_request(association, request, self.provider.as_ref()).await?;
                let status = match result {
                    Ok(outcome) => outcome.status(),
                    Err(failure) => failure.status(),
                };
                debug!("C-STORE of {} answered with {}", uid, status);
                self.completed(association, DimseCommand::Store, status);
            }
            CommandField::CFindRq if self.config.enable_find => {
                self.handle_find(association, request).await?;
            }
            CommandField::CCancelRq => {
                // Requests are answered to completion before the next is read,
                // so a cancel always refers to a finished operation.
                debug!("Ignoring C-CANCEL-RQ with no operation outstanding");
            }
            other => {
                warn!("Unsupported {} from {}", other.name(), association.peer_ae_title());
                if other.is_response() {
                    return Err(crate::error::ProtocolError::UnexpectedCommand {
                        expected: 0,
                        actual: other.code(),
                    }
                    .into());
                }
                let response = response_command(
                    response_field(other),
                    &request.message.command,
                    Status::UNRECOGNIZED_OPERATION,
                );
                association
                    .send_message(context_id, &DimseMessage::new(response, None))
                    .await?;
            }
        }
        Ok(())
    }

    async fn handle_find(&self, association: &mut Association, request: ReceivedMessage) -> Result<()> {
        let context_id = request.presentation_context_id;
        let command = &request.message.command;
        let sop_class_uid = command.affected_sop_class_uid().unwrap_or_default().to_string();
        let identifier = request.message.data.clone().unwrap_or_default();
        debug!("Processing C-FIND request for {}", sop_class_uid);

        match self.provider.find(&sop_class_uid, identifier).await {
            Ok(matches) => {
                let count = matches.len();
                for identifier in matches {
                    let pending = response_command(CommandField::CFindRsp, command, Status::PENDING);
                    association
                        .send_message(context_id, &DimseMessage::new(pending, Some(identifier)))
                        .await?;
                }
                let done = response_command(CommandField::CFindRsp, command, Status::SUCCESS);
                association
                    .send_message(context_id, &DimseMessage::new(done, None))
                    .await?;
                info!("C-FIND returned {} matches to {}", count, association.peer_ae_title());
                self.completed(association, DimseCommand::Find, Status::SUCCESS);
            }
            Err(e) => {
                error!("C-FIND query failed: {}", e);
                let mut comment = e.to_string();
                comment.truncate(64);
                let failed = response_command(CommandField::CFindRsp, command, Status::UNABLE_TO_PROCESS)
                    .with(tags::ERROR_COMMENT, CommandValue::Text(comment));
                association
                    .send_message(context_id, &DimseMessage::new(failed, None))
                    .await?;
                self.completed(association, DimseCommand::Find, Status::UNABLE_TO_PROCESS);
            }
        }
        Ok(())
    }

    fn completed(&self, association: &Association, command: DimseCommand, status: Status) {
        self.audit.record(AuditEvent::new(AuditEventKind::OperationCompleted {
            command,
            peer_ae_title: association.peer_ae_title().to_string(),
            status: status.code(),
            counters: None,
        }));
    }

    /// Number of associations currently being served
    pub async fn active_associations(&self) -> u32 {
        *self.active_associations.read().await
    }
}

fn response_field(request: CommandField) -> CommandField {
    match request {
        CommandField::CStoreRq => CommandField::CStoreRsp,
        CommandField::CGetRq => CommandField::CGetRsp,
        CommandField::CFindRq => CommandField::CFindRsp,
        CommandField::CMoveRq => CommandField::CMoveRsp,
        CommandField::CEchoRq => CommandField::CEchoRsp,
        other => other,
    }
}

impl BoundScp {
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept associations until `shutdown` is cancelled
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        loop {
            let accepted = tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("DIMSE SCP on {} shutting down", self.scp.config.local_aet);
                    return Ok(());
                }
                accepted = self.listener.accept() => accepted,
            };
            match accepted {
                Ok((stream, peer_addr)) => {
                    debug!("Accepted connection from {}", peer_addr);
                    let scp = Arc::clone(&self.scp);
                    let span = span!(Level::INFO, "association", peer = %peer_addr);
                    tokio::spawn(
                        async move {
                            if let Err(e) = scp.handle_connection(stream, peer_addr).await {
                                error!("Error handling association from {}: {}", peer_addr, e);
                            }
                        }
                        .instrument(span),
                    );
                }
                Err(e) => {
                    error!("Error accepting connection: {}", e);
                }
            }
        }
    }
}
