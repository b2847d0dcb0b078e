use std::time::Duration;

use crate::config::{validate_ae_title, DimseConfig, RemoteNode};
use crate::error::{DimseError, Result};
use crate::negotiation::{NegotiationPolicy, MAX_PRESENTATION_CONTEXTS};
use crate::pdu::{
    AssociationRq, PresentationContextProposed, RoleSelection, UserIdentity, UserVariableItem,
    DICOM_APPLICATION_CONTEXT, MINIMUM_PDU_SIZE, PROTOCOL_VERSION,
};

/// Everything the requestor needs to open one association.
#[derive(Debug, Clone)]
pub struct AssociationParameters {
    pub calling_ae_title: String,
    pub called_ae_title: String,
    /// Largest PDU this side accepts; 0 means unlimited.
    pub max_pdu_length: u32,
    pub presentation_contexts: Vec<PresentationContextProposed>,
    pub user_identity: Option<UserIdentity>,
    pub role_selections: Vec<RoleSelection>,
    pub implementation_class_uid: String,
    pub implementation_version_name: Option<String>,
    pub connect_timeout: Duration,
    pub artim_timeout: Duration,
    pub operation_timeout: Duration,
}

impl AssociationParameters {
    pub fn new(calling_ae_title: impl Into<String>, called_ae_title: impl Into<String>) -> Self {
        let defaults = DimseConfig::default();
        let connect_timeout = defaults.connect_timeout();
        let artim_timeout = defaults.artim_timeout();
        let operation_timeout = defaults.operation_timeout();
        Self {
            calling_ae_title: calling_ae_title.into(),
            called_ae_title: called_ae_title.into(),
            max_pdu_length: defaults.max_pdu,
            presentation_contexts: Vec::new(),
            user_identity: None,
            role_selections: Vec::new(),
            implementation_class_uid: defaults.implementation_class_uid,
            implementation_version_name: Some(defaults.implementation_version_name),
            connect_timeout,
            artim_timeout,
            operation_timeout,
        }
    }

    /// Parameters for talking to `node`, node overrides winning over the
    /// local configuration.
    pub fn for_node(config: &DimseConfig, node: &RemoteNode) -> Self {
        let ms = Duration::from_millis;
        Self {
            calling_ae_title: config.local_aet.clone(),
            called_ae_title: node.ae_title.clone(),
            max_pdu_length: node.max_pdu.unwrap_or(config.max_pdu),
            presentation_contexts: Vec::new(),
            user_identity: None,
            role_selections: Vec::new(),
            implementation_class_uid: config.implementation_class_uid.clone(),
            implementation_version_name: Some(config.implementation_version_name.clone())
                .filter(|name| !name.is_empty()),
            connect_timeout: ms(node.connect_timeout_ms.unwrap_or(config.connect_timeout_ms)),
            artim_timeout: ms(node.artim_timeout_ms.unwrap_or(config.artim_timeout_ms)),
            operation_timeout: ms(node
                .operation_timeout_ms
                .unwrap_or(config.operation_timeout_ms)),
        }
    }

    /// Propose a context; ids are assigned 1, 3, 5, ... in call order.
    pub fn with_context(
        mut self,
        abstract_syntax: impl Into<String>,
        transfer_syntaxes: Vec<String>,
    ) -> Self {
        let id = (self.presentation_contexts.len() * 2 + 1) as u8;
        self.presentation_contexts.push(PresentationContextProposed {
            id,
            abstract_syntax: abstract_syntax.into(),
            transfer_syntaxes,
        });
        self
    }

    pub fn with_max_pdu_length(mut self, max_pdu_length: u32) -> Self {
        self.max_pdu_length = max_pdu_length;
        self
    }

    pub fn with_user_identity(mut self, identity: UserIdentity) -> Self {
        self.user_identity = Some(identity);
        self
    }

    pub fn with_role_selection(mut self, role: RoleSelection) -> Self {
        self.role_selections.push(role);
        self
    }

    pub fn with_timeouts(mut self, connect: Duration, artim: Duration, operation: Duration) -> Self {
        self.connect_timeout = connect;
        self.artim_timeout = artim;
        self.operation_timeout = operation;
        self
    }

    pub fn validate(&self) -> Result<()> {
        validate_ae_title(&self.calling_ae_title)?;
        validate_ae_title(&self.called_ae_title)?;
        if self.max_pdu_length != 0 && self.max_pdu_length < MINIMUM_PDU_SIZE {
            return Err(DimseError::config(format!(
                "Max PDU length {} is below the minimum of {}",
                self.max_pdu_length, MINIMUM_PDU_SIZE
            )));
        }
        if self.presentation_contexts.is_empty() {
            return Err(DimseError::config("At least one presentation context is required"));
        }
        if self.presentation_contexts.len() > MAX_PRESENTATION_CONTEXTS {
            return Err(DimseError::config(format!(
                "At most {MAX_PRESENTATION_CONTEXTS} presentation contexts may be proposed"
            )));
        }
        let mut ids = std::collections::HashSet::new();
        for pc in &self.presentation_contexts {
            if pc.id % 2 == 0 || !ids.insert(pc.id) {
                return Err(DimseError::config(format!(
                    "Presentation context id {} must be odd and unique",
                    pc.id
                )));
            }
            if pc.transfer_syntaxes.is_empty() {
                return Err(DimseError::config(format!(
                    "Presentation context {} proposes no transfer syntax",
                    pc.id
                )));
            }
        }
        Ok(())
    }

    pub(crate) fn to_request(&self) -> AssociationRq {
        let mut user_variables = vec![
            UserVariableItem::MaxLength(self.max_pdu_length),
            UserVariableItem::ImplementationClassUid(self.implementation_class_uid.clone()),
        ];
        user_variables.extend(
            self.role_selections
                .iter()
                .cloned()
                .map(UserVariableItem::RoleSelection),
        );
        if let Some(name) = &self.implementation_version_name {
            user_variables.push(UserVariableItem::ImplementationVersionName(name.clone()));
        }
        if let Some(identity) = &self.user_identity {
            user_variables.push(UserVariableItem::UserIdentity(identity.clone()));
        }
        AssociationRq {
            protocol_version: PROTOCOL_VERSION,
            calling_ae_title: self.calling_ae_title.clone(),
            called_ae_title: self.called_ae_title.clone(),
            application_context_name: DICOM_APPLICATION_CONTEXT.to_string(),
            presentation_contexts: self.presentation_contexts.clone(),
            user_variables,
        }
    }
}

/// Acceptor-side settings for [`Association::accept`](super::Association::accept).
#[derive(Debug, Clone)]
pub struct AcceptorOptions {
    pub ae_title: String,
    /// Accept any called AE title instead of only `ae_title`.
    pub promiscuous: bool,
    pub policy: NegotiationPolicy,
    pub max_pdu_length: u32,
    pub implementation_class_uid: String,
    pub implementation_version_name: Option<String>,
    pub artim_timeout: Duration,
    pub operation_timeout: Duration,
}

impl AcceptorOptions {
    pub fn from_config(config: &DimseConfig, abstract_syntaxes: Vec<String>) -> Self {
        Self {
            ae_title: config.local_aet.clone(),
            promiscuous: false,
            policy: NegotiationPolicy {
                abstract_syntaxes,
                transfer_syntaxes: config.preferred_transfer_syntaxes.clone(),
            },
            max_pdu_length: config.max_pdu,
            implementation_class_uid: config.implementation_class_uid.clone(),
            implementation_version_name: Some(config.implementation_version_name.clone())
                .filter(|name| !name.is_empty()),
            artim_timeout: config.artim_timeout(),
            operation_timeout: config.operation_timeout(),
        }
    }
}
