//! In-memory association pairs for service tests.

use dicom_dictionary_std::uids;

use crate::association::{AcceptorOptions, Association, AssociationParameters, Connection};
use crate::config::DimseConfig;
use crate::message::{DimseMessage, ReceivedMessage};
use crate::negotiation::{EXPLICIT_VR_LITTLE_ENDIAN, IMPLICIT_VR_LITTLE_ENDIAN};

pub(crate) const VERIFICATION_ONLY: &[&str] = &[uids::VERIFICATION];

fn transfer_syntaxes() -> Vec<String> {
    vec![
        EXPLICIT_VR_LITTLE_ENDIAN.to_string(),
        IMPLICIT_VR_LITTLE_ENDIAN.to_string(),
    ]
}

/// Requestor "SCU1" and acceptor "SCP1", one context per abstract syntax.
pub(crate) async fn established(abstract_syntaxes: &[&str]) -> (Association, Association) {
    let mut params = AssociationParameters::new("SCU1", "SCP1");
    for uid in abstract_syntaxes {
        params = params.with_context(*uid, transfer_syntaxes());
    }
    established_with(params).await
}

pub(crate) async fn established_with(params: AssociationParameters) -> (Association, Association) {
    let accepted = params
        .presentation_contexts
        .iter()
        .map(|pc| pc.abstract_syntax.clone())
        .collect();
    let options = AcceptorOptions::from_config(&DimseConfig::new("SCP1"), accepted);
    let (a, b) = tokio::io::duplex(1 << 20);
    let acceptor =
        tokio::spawn(async move { Association::accept(Connection::new(b, false), &options).await });
    let mut requestor = Association::new(Connection::new(a, false), params).unwrap();
    requestor.establish().await.unwrap();
    (requestor, acceptor.await.unwrap().unwrap())
}

/// Send `response` on the context `request` arrived on.
pub(crate) async fn reply(scp: &mut Association, request: &ReceivedMessage, response: DimseMessage) {
    scp.send_message(request.presentation_context_id, &response)
        .await
        .unwrap();
}
