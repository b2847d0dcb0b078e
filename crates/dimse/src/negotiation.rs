//! Presentation context negotiation.
//!
//! Pure functions: the acceptor side computes results from proposals, the
//! requestor side pairs returned results with what it proposed.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;
use crate::pdu::{PresentationContextProposed, PresentationContextResult, PresentationContextResultReason};

/// Implicit VR Little Endian, the transfer syntax every peer must support.
pub const IMPLICIT_VR_LITTLE_ENDIAN: &str = "1.2.840.10008.1.2";
pub const EXPLICIT_VR_LITTLE_ENDIAN: &str = "1.2.840.10008.1.2.1";

/// Highest number of contexts one association may propose (ids 1..=255, odd).
pub const MAX_PRESENTATION_CONTEXTS: usize = 128;

/// What an acceptor is willing to accept.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NegotiationPolicy {
    /// Accepted abstract syntaxes. Empty accepts any.
    #[serde(default)]
    pub abstract_syntaxes: Vec<String>,
    /// Accepted transfer syntaxes in order of preference.
    #[serde(default = "default_transfer_syntaxes")]
    pub transfer_syntaxes: Vec<String>,
}

fn default_transfer_syntaxes() -> Vec<String> {
    vec![
        EXPLICIT_VR_LITTLE_ENDIAN.to_string(),
        IMPLICIT_VR_LITTLE_ENDIAN.to_string(),
    ]
}

impl Default for NegotiationPolicy {
    fn default() -> Self {
        Self {
            abstract_syntaxes: Vec::new(),
            transfer_syntaxes: default_transfer_syntaxes(),
        }
    }
}

impl NegotiationPolicy {
    pub fn accepting(abstract_syntaxes: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            abstract_syntaxes: abstract_syntaxes.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    fn supports_abstract(&self, uid: &str) -> bool {
        self.abstract_syntaxes.is_empty() || self.abstract_syntaxes.iter().any(|s| s == uid)
    }
}

/// A context after negotiation, as seen by either side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NegotiatedContext {
    pub id: u8,
    pub abstract_syntax: String,
    pub transfer_syntax: String,
    #[serde(skip)]
    pub reason: PresentationContextResultReason,
}

impl NegotiatedContext {
    pub fn is_accepted(&self) -> bool {
        self.reason == PresentationContextResultReason::Acceptance
    }
}

/// Assign odd context ids to `(abstract syntax, transfer syntaxes)` pairs in
/// order.
pub fn propose<I, S>(contexts: I) -> Result<Vec<PresentationContextProposed>, ProtocolError>
where
    I: IntoIterator<Item = (S, Vec<String>)>,
    S: Into<String>,
{
    let proposed: Vec<_> = contexts
        .into_iter()
        .zip((1u16..).step_by(2))
        .map(|((abstract_syntax, transfer_syntaxes), id)| PresentationContextProposed {
            id: id as u8,
            abstract_syntax: abstract_syntax.into(),
            transfer_syntaxes,
        })
        .collect();
    if proposed.len() > MAX_PRESENTATION_CONTEXTS {
        return Err(ProtocolError::MalformedPdu(format!(
            "{} presentation contexts proposed, at most {MAX_PRESENTATION_CONTEXTS} allowed",
            proposed.len()
        )));
    }
    Ok(proposed)
}

/// Acceptor side: answer every proposed context.
///
/// A context is accepted with the first of the policy's transfer syntaxes
/// that the requestor also proposed. Even or duplicated ids are rejected
/// without reason.
pub fn negotiate(
    proposed: &[PresentationContextProposed],
    policy: &NegotiationPolicy,
) -> Vec<PresentationContextResult> {
    let mut seen = HashSet::new();
    proposed
        .iter()
        .map(|pc| {
            let fallback_ts = pc
                .transfer_syntaxes
                .first()
                .cloned()
                .unwrap_or_else(|| IMPLICIT_VR_LITTLE_ENDIAN.to_string());
            let reject = |reason| PresentationContextResult {
                id: pc.id,
                reason,
                transfer_syntax: fallback_ts.clone(),
            };

            if pc.id % 2 == 0 || !seen.insert(pc.id) {
                return reject(PresentationContextResultReason::NoReason);
            }
            if !policy.supports_abstract(&pc.abstract_syntax) {
                return reject(PresentationContextResultReason::AbstractSyntaxNotSupported);
            }
            match policy
                .transfer_syntaxes
                .iter()
                .find(|ts| pc.transfer_syntaxes.contains(ts))
            {
                Some(ts) => PresentationContextResult {
                    id: pc.id,
                    reason: PresentationContextResultReason::Acceptance,
                    transfer_syntax: ts.clone(),
                },
                None => reject(PresentationContextResultReason::TransferSyntaxesNotSupported),
            }
        })
        .collect()
}

/// Requestor side: pair A-ASSOCIATE-AC results with the proposals.
///
/// Proposals the acceptor did not answer are treated as rejected. A result
/// for an id never proposed, or an accepted transfer syntax that was not
/// offered, is a protocol violation.
pub fn resolve(
    proposed: &[PresentationContextProposed],
    results: &[PresentationContextResult],
) -> Result<Vec<NegotiatedContext>, ProtocolError> {
    for result in results {
        if !proposed.iter().any(|pc| pc.id == result.id) {
            return Err(ProtocolError::UnknownPresentationContext(result.id));
        }
    }
    proposed
        .iter()
        .map(|pc| {
            let Some(result) = results.iter().find(|r| r.id == pc.id) else {
                return Ok(NegotiatedContext {
                    id: pc.id,
                    abstract_syntax: pc.abstract_syntax.clone(),
                    transfer_syntax: String::new(),
                    reason: PresentationContextResultReason::NoReason,
                });
            };
            if result.reason == PresentationContextResultReason::Acceptance
                && !pc.transfer_syntaxes.contains(&result.transfer_syntax)
            {
                return Err(ProtocolError::UnexpectedPdu(format!(
                    "context {} accepted with unproposed transfer syntax {}",
                    pc.id, result.transfer_syntax
                )));
            }
            Ok(NegotiatedContext {
                id: pc.id,
                abstract_syntax: pc.abstract_syntax.clone(),
                transfer_syntax: result.transfer_syntax.clone(),
                reason: result.reason,
            })
        })
        .collect()
}
