// SPDX-FileCopyrightText: 2025 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! The Transcryptor party. It contributes the second hop of every
//! transcryption: pseudonyms during ticket issuance, data keys during
//! store and retrieval. Each hop is only applied once the carried
//! authorisation (an Access-Manager-signed issuance context, or a valid
//! ticket) has been checked.

use morphocommon::{
    codec,
    crypto::{
        elgamal::ElgamalCiphertext,
        signatures::{
            SigningKey, VerifyingKey,
            signable::{Signable, Signature, SignedStruct, Verifiable, VerifiedStruct},
        },
        transcryption::{CellBinding, PseudonymDomain, TranscryptorSecrets},
    },
    messages::access_manager::{BlindMode, KeyRequestEntry},
    ticketing::{
        AccessMode, SignedTicket, TicketError, TicketKeyType, TicketSigner, TicketVerifyingKeys,
    },
    time::{Duration, TimeStamp},
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::instrument;

#[derive(Debug, Error)]
pub enum TranscryptionError {
    /// The hop refused to rewrite: the carried authorisation did not cover
    /// the requested transcription.
    #[error("transcryption refused: {0}")]
    Refused(String),
    #[error(transparent)]
    Ticket(#[from] TicketError),
    /// Unrecoverable implementation error
    #[error("Library Error")]
    LibraryError,
}

impl From<morphocommon::LibraryError> for TranscryptionError {
    fn from(_: morphocommon::LibraryError) -> Self {
        Self::LibraryError
    }
}

const ISSUANCE_CONTEXT_LABEL: &str = "IssuanceContext";

/// How long an issuance context is accepted after the Access Manager signed
/// it. Issuance is a single round trip, so this is deliberately tight.
fn issuance_context_validity() -> Duration {
    Duration::minutes(5)
}

/// The Access Manager's summary of an in-flight ticket issuance. Signed by
/// the Access Manager so the other parties can check that the pseudonym
/// transcription they are asked for belongs to a real issuance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssuanceContext {
    pub user: String,
    pub user_group: String,
    pub modes: Vec<AccessMode>,
    pub columns: Vec<String>,
    pub timestamp: TimeStamp,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignedIssuanceContext {
    context: IssuanceContext,
    signature: Signature<TicketKeyType>,
}

impl SignedStruct<IssuanceContext, TicketKeyType> for SignedIssuanceContext {
    fn from_payload(payload: IssuanceContext, signature: Signature<TicketKeyType>) -> Self {
        Self {
            context: payload,
            signature,
        }
    }
}

impl Signable for IssuanceContext {
    type SignedOutput = SignedIssuanceContext;
    type KeyType = TicketKeyType;

    fn unsigned_payload(&self) -> Result<Vec<u8>, codec::Error> {
        codec::to_vec(self)
    }

    fn label(&self) -> &str {
        ISSUANCE_CONTEXT_LABEL
    }
}

impl Verifiable for SignedIssuanceContext {
    type VerifiedStruct = IssuanceContext;
    type KeyType = TicketKeyType;

    fn unsigned_payload(&self) -> Result<Vec<u8>, codec::Error> {
        codec::to_vec(&self.context)
    }

    fn signature(&self) -> &Signature<TicketKeyType> {
        &self.signature
    }

    fn label(&self) -> &str {
        ISSUANCE_CONTEXT_LABEL
    }
}

impl VerifiedStruct for SignedIssuanceContext {
    fn into_verified(self) -> IssuanceContext {
        self.context
    }
}

/// Validate a signed issuance context against the Access Manager's key and
/// its freshness window. Shared by every party that participates in
/// issuance.
pub fn open_issuance_context(
    context: &SignedIssuanceContext,
    access_manager_key: &VerifyingKey<TicketKeyType>,
) -> Result<IssuanceContext, TranscryptionError> {
    let verified = context
        .clone()
        .verify(access_manager_key)
        .map_err(|_| TranscryptionError::Refused("issuance context signature".to_owned()))?;
    let now = TimeStamp::now();
    if now < verified.timestamp || now > verified.timestamp + issuance_context_validity() {
        return Err(TranscryptionError::Refused(
            "issuance context outside its freshness window".to_owned(),
        ));
    }
    Ok(verified)
}

pub struct Transcryptor {
    secrets: TranscryptorSecrets,
    signing_key: SigningKey<TicketKeyType>,
    roots: TicketVerifyingKeys,
    ticket_validity: Duration,
}

impl Transcryptor {
    pub fn new(
        secrets: TranscryptorSecrets,
        signing_key: SigningKey<TicketKeyType>,
        roots: TicketVerifyingKeys,
        ticket_validity: Duration,
    ) -> Self {
        Self {
            secrets,
            signing_key,
            roots,
            ticket_validity,
        }
    }

    pub fn verifying_key(&self) -> VerifyingKey<TicketKeyType> {
        self.signing_key.verifying_key()
    }

    /// Apply this party's pseudonym hop toward `domain` for each ciphertext
    /// of an in-flight issuance.
    #[instrument(level = "debug", skip_all, fields(entries = ciphertexts.len()))]
    pub fn transcrypt_pseudonyms(
        &self,
        context: &SignedIssuanceContext,
        ciphertexts: &[ElgamalCiphertext],
        domain: &PseudonymDomain,
    ) -> Result<Vec<ElgamalCiphertext>, TranscryptionError> {
        let verified = open_issuance_context(context, &self.roots.access_manager)?;
        if let PseudonymDomain::AccessGroup(group) = domain {
            // Access-group pseudonyms may only target the requesting group.
            if group != &verified.user_group {
                return Err(TranscryptionError::Refused(format!(
                    "access group {group:?} does not match the requester"
                )));
            }
        }
        Ok(ciphertexts
            .iter()
            .map(|ciphertext| self.secrets.hop.pseudonym_hop(ciphertext, domain))
            .collect::<Result<Vec<_>, _>>()?)
    }

    /// Countersign a ticket drafted and signed by the Access Manager.
    pub fn countersign_ticket(
        &self,
        mut ticket: SignedTicket,
    ) -> Result<SignedTicket, TranscryptionError> {
        ticket.verify_links(&self.roots, &[TicketSigner::AccessManager])?;
        ticket.countersign(TicketSigner::Transcryptor, &self.signing_key)?;
        Ok(ticket)
    }

    /// Apply this party's data-key hop for each entry of an encryption-key
    /// request. The ticket is validated here; the Access Manager validated
    /// it for its own hop already.
    #[instrument(level = "debug", skip_all, fields(entries = entries.len()))]
    pub fn transcrypt_data_keys(
        &self,
        ticket: &SignedTicket,
        entries: &[(KeyRequestEntry, ElgamalCiphertext)],
    ) -> Result<Vec<ElgamalCiphertext>, TranscryptionError> {
        let opened = ticket.open(&self.roots, self.ticket_validity)?;
        let mut hopped = Vec::with_capacity(entries.len());
        for (entry, ciphertext) in entries {
            let required = match entry.blind_mode {
                BlindMode::Blind => AccessMode::Write,
                BlindMode::Unblind => AccessMode::Read,
            };
            if !opened.grants_mode(required) {
                return Err(TranscryptionError::Ticket(TicketError::NotCovered {
                    mode: required,
                    subject: entry.metadata.tag.clone(),
                }));
            }
            if opened.column_index(&entry.metadata.tag).is_none() {
                return Err(TranscryptionError::Ticket(TicketError::NotCovered {
                    mode: required,
                    subject: entry.metadata.tag.clone(),
                }));
            }
            let pseudonym = opened.pseudonym(entry.pseudonym_index as usize)?;
            let cell = CellBinding {
                column: &entry.metadata.tag,
                pseudonym: &pseudonym.storage_facility,
                blinding_timestamp: entry.metadata.blinding_timestamp,
            };
            let result = match entry.blind_mode {
                BlindMode::Blind => self.secrets.hop.data_key_blind(ciphertext, &cell)?,
                BlindMode::Unblind => {
                    self.secrets
                        .hop
                        .data_key_unblind(ciphertext, &cell, &opened.user_group)?
                }
            };
            hopped.push(result);
        }
        Ok(hopped)
    }
}
