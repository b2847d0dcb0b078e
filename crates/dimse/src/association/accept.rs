//! Acceptor side of association establishment.

use std::time::Duration;

use bytes::Bytes;
use tracing::{debug, info, warn};

use super::{
    announced_max_length, AcceptorOptions, Association, AssociationRole, AssociationState,
    Connection,
};
use crate::config::validate_ae_title;
use crate::error::{AssociationRejection, DimseError, ProtocolError, Result, TimeoutStage};
use crate::negotiation::{negotiate, NegotiatedContext};
use crate::pdu::{
    AssociationAc, AssociationRj, AssociationRjResult, AssociationRjServiceProviderAcseReason,
    AssociationRjServiceProviderPresentationReason, AssociationRjServiceUserReason,
    AssociationRjSource, AssociationRq, Pdu, UserVariableItem, DICOM_APPLICATION_CONTEXT,
    PROTOCOL_VERSION,
};

impl Association {
    /// Wait (ARTIM) for an A-ASSOCIATE-RQ on `connection` and answer it.
    ///
    /// Requests for another AE title, an unknown application context or an
    /// unsupported protocol version are rejected. A request where no context
    /// is acceptable is answered with an AC listing the rejections, and
    /// reported as `NoAcceptablePresentationContext`.
    pub async fn accept(connection: Connection, options: &AcceptorOptions) -> Result<Self> {
        let mut association = Self::from_parts(
            connection,
            AssociationRole::Acceptor,
            options.ae_title.clone(),
            options.max_pdu_length,
            options.artim_timeout,
            options.operation_timeout,
        );
        let rq = association.read_request().await?;
        association.state = AssociationState::RequestSent;
        association.peer_ae_title = rq.calling_ae_title.clone();

        if let Some(source) = rejection_reason(&rq, options) {
            association
                .reject(AssociationRjResult::Permanent, source)
                .await?;
            return Err(DimseError::AssociationRejected(AssociationRejection {
                result: AssociationRjResult::Permanent,
                source,
            }));
        }

        let results = negotiate(&rq.presentation_contexts, &options.policy);
        association.contexts = rq
            .presentation_contexts
            .iter()
            .zip(&results)
            .map(|(proposed, result)| NegotiatedContext {
                id: proposed.id,
                abstract_syntax: proposed.abstract_syntax.clone(),
                transfer_syntax: result.transfer_syntax.clone(),
                reason: result.reason,
            })
            .collect();
        association.peer_max_pdu = announced_max_length(&rq.user_variables);

        let mut user_variables = vec![
            UserVariableItem::MaxLength(options.max_pdu_length),
            UserVariableItem::ImplementationClassUid(options.implementation_class_uid.clone()),
        ];
        for item in &rq.user_variables {
            match item {
                UserVariableItem::RoleSelection(role) => {
                    user_variables.push(UserVariableItem::RoleSelection(role.clone()));
                }
                UserVariableItem::UserIdentity(identity) if identity.positive_response_requested => {
                    user_variables.push(UserVariableItem::UserIdentityResponse(Bytes::new()));
                }
                _ => {}
            }
        }
        if let Some(name) = &options.implementation_version_name {
            user_variables.push(UserVariableItem::ImplementationVersionName(name.clone()));
        }
        association.peer_user_variables = rq.user_variables.clone();

        let ac = AssociationAc {
            protocol_version: PROTOCOL_VERSION,
            calling_ae_title: rq.calling_ae_title.clone(),
            called_ae_title: rq.called_ae_title.clone(),
            application_context_name: DICOM_APPLICATION_CONTEXT.to_string(),
            presentation_contexts: results,
            user_variables,
        };
        let artim = association.artim_timeout;
        if let Err(e) = association
            .send_pdu(Pdu::AssociationAc(ac), artim, TimeoutStage::AssociationRequest)
            .await
        {
            return Err(association.fail(e).await);
        }

        if !association.contexts.iter().any(NegotiatedContext::is_accepted) {
            warn!(
                "No acceptable presentation context proposed by {}",
                association.peer_ae_title
            );
            // the requestor is expected to abort
            match association
                .next_pdu(artim, TimeoutStage::AssociationRequest)
                .await
            {
                Ok(Pdu::AbortRq { .. }) => {}
                Ok(other) => debug!(
                    "Expected A-ABORT from {}, got {}",
                    association.peer_ae_title,
                    other.short_description()
                ),
                Err(e) => debug!(
                    "No A-ABORT from {} after rejecting every context: {}",
                    association.peer_ae_title, e
                ),
            }
            association.state = AssociationState::Aborted;
            association.close().await;
            return Err(DimseError::NoAcceptablePresentationContext);
        }

        association.state = AssociationState::Established;
        info!(
            "Accepted association {} -> {} ({} of {} contexts accepted)",
            association.peer_ae_title,
            association.local_ae_title,
            association.contexts.iter().filter(|c| c.is_accepted()).count(),
            association.contexts.len()
        );
        Ok(association)
    }

    /// Read the A-ASSOCIATE-RQ and answer it with a transient
    /// local-limit-exceeded rejection.
    pub async fn reject_busy(connection: Connection, artim_timeout: Duration) -> Result<()> {
        let mut association = Self::from_parts(
            connection,
            AssociationRole::Acceptor,
            String::new(),
            0,
            artim_timeout,
            artim_timeout,
        );
        let rq = association.read_request().await?;
        association.state = AssociationState::RequestSent;
        association.peer_ae_title = rq.calling_ae_title;
        association
            .reject(
                AssociationRjResult::Transient,
                AssociationRjSource::ServiceProviderPresentation(
                    AssociationRjServiceProviderPresentationReason::LocalLimitExceeded,
                ),
            )
            .await
    }

    async fn read_request(&mut self) -> Result<AssociationRq> {
        let artim = self.artim_timeout;
        match self.next_pdu(artim, TimeoutStage::AssociationRequest).await {
            Ok(Pdu::AssociationRq(rq)) => {
                info!(
                    "Association request {} -> {} ({} contexts)",
                    rq.calling_ae_title,
                    rq.called_ae_title,
                    rq.presentation_contexts.len()
                );
                Ok(rq)
            }
            Ok(other) => {
                let e = ProtocolError::UnexpectedPdu(format!(
                    "{} while awaiting A-ASSOCIATE-RQ",
                    other.short_description()
                ));
                Err(self.fail(e.into()).await)
            }
            Err(e) => Err(self.fail(e).await),
        }
    }

    async fn reject(&mut self, result: AssociationRjResult, source: AssociationRjSource) -> Result<()> {
        warn!(
            "Rejecting association from {}: {:?} {}",
            self.peer_ae_title, result, source
        );
        let artim = self.artim_timeout;
        let sent = self
            .send_pdu(
                Pdu::AssociationRj(AssociationRj { result, source }),
                artim,
                TimeoutStage::AssociationRequest,
            )
            .await;
        self.state = AssociationState::Rejected;
        self.close().await;
        sent
    }
}

fn rejection_reason(rq: &AssociationRq, options: &AcceptorOptions) -> Option<AssociationRjSource> {
    if rq.protocol_version & PROTOCOL_VERSION == 0 {
        return Some(AssociationRjSource::ServiceProviderAcse(
            AssociationRjServiceProviderAcseReason::ProtocolVersionNotSupported,
        ));
    }
    if rq.application_context_name != DICOM_APPLICATION_CONTEXT {
        return Some(AssociationRjSource::ServiceUser(
            AssociationRjServiceUserReason::ApplicationContextNameNotSupported,
        ));
    }
    if !options.promiscuous && rq.called_ae_title != options.ae_title {
        return Some(AssociationRjSource::ServiceUser(
            AssociationRjServiceUserReason::CalledAeTitleNotRecognized,
        ));
    }
    if validate_ae_title(&rq.calling_ae_title).is_err() {
        return Some(AssociationRjSource::ServiceUser(
            AssociationRjServiceUserReason::CallingAeTitleNotRecognized,
        ));
    }
    None
}
