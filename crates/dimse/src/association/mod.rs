//! Associations: one negotiated conversation over one byte stream.
//!
//! An [`Association`] is owned by exactly one task. It drives the handshake,
//! carries DIMSE messages while `Established`, and ends in release or abort.
//! Every wait is bounded by a timer and observes the association's
//! cancellation token; a timeout, cancellation or protocol violation aborts
//! the association, after which it must be discarded.

mod accept;
pub mod params;
pub mod state;
pub mod transport;

use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::io::AsyncWriteExt;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub use params::{AcceptorOptions, AssociationParameters};
pub use state::AssociationState;
pub use transport::{AsyncStream, Connection};

use crate::error::{AssociationRejection, DimseError, ProtocolError, Result, TimeoutStage};
use crate::message::{fragment_message, DimseMessage, Reassembler, ReceivedMessage};
use crate::negotiation::{resolve, NegotiatedContext};
use crate::pdu::{
    AbortReason, AbortSource, AssociationRq, PDataValue, Pdu, PduCodec, RoleSelection,
    UserVariableItem, MAXIMUM_PDU_SIZE,
};

/// Upper bound for best-effort A-ABORT delivery and socket shutdown.
const CLOSE_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssociationRole {
    Requestor,
    Acceptor,
}

pub struct Association {
    framed: Framed<Connection, PduCodec>,
    state: AssociationState,
    role: AssociationRole,
    local_ae_title: String,
    peer_ae_title: String,
    local_max_pdu: u32,
    peer_max_pdu: u32,
    contexts: Vec<NegotiatedContext>,
    peer_user_variables: Vec<UserVariableItem>,
    artim_timeout: Duration,
    operation_timeout: Duration,
    reassembler: Reassembler,
    inbox: VecDeque<ReceivedMessage>,
    message_id: u16,
    cancel: CancellationToken,
    encrypted: bool,
    peer_addr: Option<SocketAddr>,
    request: Option<AssociationRq>,
}

impl Association {
    /// Requestor in state `Idle`; nothing is sent until [`establish`](Self::establish).
    pub fn new(connection: Connection, params: AssociationParameters) -> Result<Self> {
        params.validate()?;
        let mut association = Self::from_parts(
            connection,
            AssociationRole::Requestor,
            params.calling_ae_title.clone(),
            params.max_pdu_length,
            params.artim_timeout,
            params.operation_timeout,
        );
        association.peer_ae_title = params.called_ae_title.clone();
        association.request = Some(params.to_request());
        Ok(association)
    }

    /// Open a TCP connection to `host:port` and establish an association on it.
    pub async fn connect(params: AssociationParameters, host: &str, port: u16) -> Result<Self> {
        params.validate()?;
        let connection = Connection::connect(host, port, params.connect_timeout).await?;
        let mut association = Self::new(connection, params)?;
        association.establish().await?;
        Ok(association)
    }

    fn from_parts(
        connection: Connection,
        role: AssociationRole,
        local_ae_title: String,
        local_max_pdu: u32,
        artim_timeout: Duration,
        operation_timeout: Duration,
    ) -> Self {
        let encrypted = connection.is_encrypted();
        let peer_addr = connection.peer_addr();
        let limit = if local_max_pdu == 0 {
            MAXIMUM_PDU_SIZE
        } else {
            local_max_pdu
        };
        Self {
            framed: Framed::new(connection, PduCodec::new(limit)),
            state: AssociationState::Idle,
            role,
            local_ae_title,
            peer_ae_title: String::new(),
            local_max_pdu,
            peer_max_pdu: 0,
            contexts: Vec::new(),
            peer_user_variables: Vec::new(),
            artim_timeout,
            operation_timeout,
            reassembler: Reassembler::new(),
            inbox: VecDeque::new(),
            message_id: 0,
            cancel: CancellationToken::new(),
            encrypted,
            peer_addr,
            request: None,
        }
    }

    /// Send A-ASSOCIATE-RQ and wait (ARTIM) for the answer.
    pub async fn establish(&mut self) -> Result<()> {
        let next = self.state.after_request().ok_or_else(|| {
            DimseError::invalid_state(format!("cannot request association in state {}", self.state))
        })?;
        let request = self
            .request
            .take()
            .ok_or_else(|| DimseError::invalid_state("association request already sent"))?;
        let proposed = request.presentation_contexts.clone();

        info!(
            "Requesting association {} -> {} ({} presentation contexts)",
            self.local_ae_title,
            self.peer_ae_title,
            proposed.len()
        );

        let artim = self.artim_timeout;
        if let Err(e) = self
            .send_pdu(Pdu::AssociationRq(request), artim, TimeoutStage::AssociationRequest)
            .await
        {
            return Err(self.fail(e).await);
        }
        self.state = next;

        let pdu = match self.next_pdu(artim, TimeoutStage::AssociationResponse).await {
            Ok(pdu) => pdu,
            Err(e) => return Err(self.fail(e).await),
        };

        match pdu {
            Pdu::AssociationAc(ac) => {
                let contexts = match resolve(&proposed, &ac.presentation_contexts) {
                    Ok(contexts) => contexts,
                    Err(e) => return Err(self.fail(e.into()).await),
                };
                self.peer_max_pdu = announced_max_length(&ac.user_variables);
                self.peer_user_variables = ac.user_variables;
                self.contexts = contexts;

                if !self.contexts.iter().any(NegotiatedContext::is_accepted) {
                    warn!(
                        "Association with {} accepted no presentation context",
                        self.peer_ae_title
                    );
                    self.abort().await;
                    return Err(DimseError::NoAcceptablePresentationContext);
                }
                for rejected in self.contexts.iter().filter(|c| !c.is_accepted()) {
                    debug!(
                        "Presentation context {} ({}) rejected: {:?}",
                        rejected.id, rejected.abstract_syntax, rejected.reason
                    );
                }

                self.state = self
                    .state
                    .after_accept()
                    .unwrap_or(AssociationState::Established);
                info!(
                    "Association established with {} (peer max PDU {}, {} of {} contexts accepted)",
                    self.peer_ae_title,
                    self.peer_max_pdu,
                    self.contexts.iter().filter(|c| c.is_accepted()).count(),
                    self.contexts.len()
                );
                Ok(())
            }
            Pdu::AssociationRj(rj) => {
                self.state = self
                    .state
                    .after_reject()
                    .unwrap_or(AssociationState::Rejected);
                self.close().await;
                let rejection = AssociationRejection {
                    result: rj.result,
                    source: rj.source,
                };
                warn!("Association rejected by {}: {}", self.peer_ae_title, rejection);
                Err(DimseError::AssociationRejected(rejection))
            }
            other => {
                let e = ProtocolError::UnexpectedPdu(format!(
                    "{} while awaiting A-ASSOCIATE response",
                    other.short_description()
                ));
                Err(self.fail(e.into()).await)
            }
        }
    }

    /// Fragment and send one message on an accepted presentation context.
    ///
    /// Fails with `InvalidState` without touching the connection unless the
    /// association is established.
    pub async fn send_message(
        &mut self,
        presentation_context_id: u8,
        message: &DimseMessage,
    ) -> Result<()> {
        if !self.state.can_send_dimse() {
            return Err(DimseError::invalid_state(format!(
                "cannot send DIMSE message in state {}",
                self.state
            )));
        }
        if !self.is_accepted_context(presentation_context_id) {
            return Err(DimseError::NoPresentationContext(format!(
                "presentation context {presentation_context_id} is not accepted"
            )));
        }
        let pdvs = fragment_message(message, presentation_context_id, self.peer_max_pdu)?;
        debug!(
            "Sending DIMSE message on context {} as {} PDVs",
            presentation_context_id,
            pdvs.len()
        );
        if let Err(e) = self.send_pdvs(pdvs).await {
            return Err(self.fail(e).await);
        }
        Ok(())
    }

    /// Wait for the next complete message.
    ///
    /// A peer A-RELEASE-RQ is answered and reported as `PeerReleased`.
    pub async fn receive_message(&mut self) -> Result<ReceivedMessage> {
        if let Some(message) = self.inbox.pop_front() {
            return Ok(message);
        }
        if !self.state.can_send_dimse() {
            return Err(DimseError::invalid_state(format!(
                "cannot receive DIMSE message in state {}",
                self.state
            )));
        }
        let limit = self.operation_timeout;
        loop {
            let pdu = match self.next_pdu(limit, TimeoutStage::Response).await {
                Ok(pdu) => pdu,
                Err(e) => return Err(self.fail(e).await),
            };
            match pdu {
                Pdu::PData { data } => {
                    for pdv in data {
                        if let Err(e) = self.accept_pdv(pdv) {
                            return Err(self.fail(e.into()).await);
                        }
                    }
                    if let Some(message) = self.inbox.pop_front() {
                        return Ok(message);
                    }
                }
                Pdu::ReleaseRq => {
                    info!("Release requested by {}", self.peer_ae_title);
                    self.answer_release().await?;
                    return Err(DimseError::PeerReleased);
                }
                other => {
                    let e = ProtocolError::UnexpectedPdu(format!(
                        "{} while established",
                        other.short_description()
                    ));
                    return Err(self.fail(e.into()).await);
                }
            }
        }
    }

    fn accept_pdv(&mut self, pdv: PDataValue) -> std::result::Result<(), ProtocolError> {
        if !self.is_accepted_context(pdv.presentation_context_id) {
            return Err(ProtocolError::UnknownPresentationContext(
                pdv.presentation_context_id,
            ));
        }
        if let Some(message) = self.reassembler.push(pdv)? {
            self.inbox.push_back(message);
        }
        Ok(())
    }

    /// Graceful release: A-RELEASE-RQ, then wait (ARTIM) for A-RELEASE-RP.
    pub async fn release(&mut self) -> Result<()> {
        let next = self.state.after_release_request().ok_or_else(|| {
            DimseError::invalid_state(format!("cannot release association in state {}", self.state))
        })?;
        let artim = self.artim_timeout;
        if let Err(e) = self
            .send_pdu(Pdu::ReleaseRq, artim, TimeoutStage::ReleaseResponse)
            .await
        {
            return Err(self.fail(e).await);
        }
        self.state = next;

        loop {
            match self.next_pdu(artim, TimeoutStage::ReleaseResponse).await {
                Ok(Pdu::ReleaseRp) => {
                    self.state = AssociationState::Released;
                    self.close().await;
                    info!("Association with {} released", self.peer_ae_title);
                    return Ok(());
                }
                Ok(Pdu::PData { .. }) => {
                    debug!("Discarding P-DATA-TF received while releasing");
                }
                Ok(Pdu::ReleaseRq) => {
                    // release collision
                    if let Err(e) = self
                        .send_pdu(Pdu::ReleaseRp, artim, TimeoutStage::ReleaseResponse)
                        .await
                    {
                        return Err(self.fail(e).await);
                    }
                }
                Ok(other) => {
                    let e = ProtocolError::UnexpectedPdu(format!(
                        "{} while awaiting A-RELEASE-RP",
                        other.short_description()
                    ));
                    return Err(self.fail(e.into()).await);
                }
                Err(e) => return Err(self.fail(e).await),
            }
        }
    }

    async fn answer_release(&mut self) -> Result<()> {
        let next = self.state.after_release().ok_or_else(|| {
            DimseError::invalid_state(format!("cannot answer release in state {}", self.state))
        })?;
        let artim = self.artim_timeout;
        if let Err(e) = self
            .send_pdu(Pdu::ReleaseRp, artim, TimeoutStage::ReleaseResponse)
            .await
        {
            return Err(self.fail(e).await);
        }
        self.state = next;
        self.close().await;
        Ok(())
    }

    /// Abort as service user. A no-op once the association has ended.
    pub async fn abort(&mut self) {
        self.abort_with(AbortSource::ServiceUser).await;
    }

    async fn abort_with(&mut self, source: AbortSource) {
        let Some(next) = self.state.after_abort() else {
            return;
        };
        let was_idle = self.state == AssociationState::Idle;
        self.state = next;
        warn!("Aborting association with {} ({})", self.peer_ae_title, source);
        if !was_idle {
            match tokio::time::timeout(CLOSE_GRACE, self.framed.send(Pdu::AbortRq { source })).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => debug!("Failed to send A-ABORT: {}", e),
                Err(_) => debug!("Timed out sending A-ABORT"),
            }
        }
        self.close().await;
    }

    async fn close(&mut self) {
        if let Ok(Err(e)) =
            tokio::time::timeout(CLOSE_GRACE, self.framed.get_mut().shutdown()).await
        {
            debug!("Error shutting down connection: {}", e);
        }
    }

    /// Put the association into a terminal state appropriate for `error` and
    /// hand the error back.
    async fn fail(&mut self, error: DimseError) -> DimseError {
        match &error {
            DimseError::PeerAbort(source) => {
                warn!("Association aborted by {} ({})", self.peer_ae_title, source);
                if !self.state.is_terminal() {
                    self.state = AssociationState::Aborted;
                }
                self.close().await;
            }
            DimseError::Network(_) => {
                if !self.state.is_terminal() {
                    self.state = AssociationState::Aborted;
                }
                self.close().await;
            }
            DimseError::Protocol(protocol) => {
                let reason = match protocol {
                    ProtocolError::UnknownPduType(_) => AbortReason::UnrecognizedPdu,
                    ProtocolError::UnexpectedPdu(_) => AbortReason::UnexpectedPdu,
                    _ => AbortReason::InvalidPduParameter,
                };
                self.abort_with(AbortSource::ServiceProvider(reason)).await;
            }
            _ => self.abort().await,
        }
        error
    }

    async fn next_pdu(&mut self, limit: Duration, stage: TimeoutStage) -> Result<Pdu> {
        let cancel = self.cancel.clone();
        let received = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(DimseError::Cancelled),
            received = tokio::time::timeout(limit, self.framed.next()) => received,
        };
        let pdu = match received {
            Err(_) => return Err(DimseError::AssociationTimeout(stage)),
            Ok(None) => {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "peer closed the connection",
                )
                .into())
            }
            Ok(Some(pdu)) => pdu?,
        };
        debug!("Received {}", pdu.short_description());
        match pdu {
            Pdu::AbortRq { source } => Err(DimseError::PeerAbort(source)),
            pdu => Ok(pdu),
        }
    }

    async fn send_pdu(&mut self, pdu: Pdu, limit: Duration, stage: TimeoutStage) -> Result<()> {
        debug!("Sending {}", pdu.short_description());
        let cancel = self.cancel.clone();
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(DimseError::Cancelled),
            sent = tokio::time::timeout(limit, self.framed.send(pdu)) => match sent {
                Err(_) => Err(DimseError::AssociationTimeout(stage)),
                Ok(result) => result,
            },
        }
    }

    async fn send_pdvs(&mut self, pdvs: Vec<PDataValue>) -> Result<()> {
        let cancel = self.cancel.clone();
        let limit = self.operation_timeout;
        let framed = &mut self.framed;
        let send_all = async move {
            for pdv in pdvs {
                framed.feed(Pdu::PData { data: vec![pdv] }).await?;
            }
            framed.flush().await
        };
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(DimseError::Cancelled),
            sent = tokio::time::timeout(limit, send_all) => match sent {
                Err(_) => Err(DimseError::AssociationTimeout(TimeoutStage::Response)),
                Ok(result) => result,
            },
        }
    }

    /// Allocate the next Message ID on this association, never 0.
    pub fn next_message_id(&mut self) -> u16 {
        self.message_id = self.message_id.wrapping_add(1);
        if self.message_id == 0 {
            self.message_id = 1;
        }
        self.message_id
    }

    /// First accepted context for `abstract_syntax`.
    pub fn context_for(&self, abstract_syntax: &str) -> Result<&NegotiatedContext> {
        self.contexts
            .iter()
            .find(|c| c.is_accepted() && c.abstract_syntax == abstract_syntax)
            .ok_or_else(|| DimseError::NoPresentationContext(abstract_syntax.to_string()))
    }

    pub fn context(&self, id: u8) -> Option<&NegotiatedContext> {
        self.contexts.iter().find(|c| c.id == id)
    }

    fn is_accepted_context(&self, id: u8) -> bool {
        self.context(id).is_some_and(NegotiatedContext::is_accepted)
    }

    pub fn contexts(&self) -> &[NegotiatedContext] {
        &self.contexts
    }

    pub fn state(&self) -> AssociationState {
        self.state
    }

    pub fn role(&self) -> AssociationRole {
        self.role
    }

    pub fn local_ae_title(&self) -> &str {
        &self.local_ae_title
    }

    pub fn peer_ae_title(&self) -> &str {
        &self.peer_ae_title
    }

    /// Limit the peer announced for PDUs we send; 0 means unlimited.
    pub fn peer_max_pdu_length(&self) -> u32 {
        self.peer_max_pdu
    }

    pub fn local_max_pdu_length(&self) -> u32 {
        self.local_max_pdu
    }

    pub fn peer_user_variables(&self) -> &[UserVariableItem] {
        &self.peer_user_variables
    }

    /// Role selection the peer returned (or proposed) for `sop_class_uid`.
    pub fn peer_role_selection(&self, sop_class_uid: &str) -> Option<&RoleSelection> {
        self.peer_user_variables.iter().find_map(|item| match item {
            UserVariableItem::RoleSelection(role) if role.sop_class_uid == sop_class_uid => {
                Some(role)
            }
            _ => None,
        })
    }

    pub fn is_encrypted(&self) -> bool {
        self.encrypted
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    pub fn operation_timeout(&self) -> Duration {
        self.operation_timeout
    }

    /// Token that, once cancelled, aborts the association at its next wait.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Tie the association to an externally owned token, e.g. a child of a
    /// dispatcher-wide shutdown token.
    pub fn with_cancellation_token(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }
}

impl std::fmt::Debug for Association {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Association")
            .field("state", &self.state)
            .field("role", &self.role)
            .field("local_ae_title", &self.local_ae_title)
            .field("peer_ae_title", &self.peer_ae_title)
            .field("peer_max_pdu", &self.peer_max_pdu)
            .field("contexts", &self.contexts)
            .finish()
    }
}

fn announced_max_length(items: &[UserVariableItem]) -> u32 {
    items
        .iter()
        .find_map(|item| match item {
            UserVariableItem::MaxLength(length) => Some(*length),
            _ => None,
        })
        .unwrap_or(0)
}

#[cfg(test)]
mod tests;
