// SPDX-FileCopyrightText: 2025 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Tickets: signed, timestamped authorisations binding a requester to a set
//! of participants, columns and access modes. Tickets are issued by the
//! Access Manager, countersigned by the Transcryptor, and validated by every
//! party that acts on them.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    LibraryError, codec,
    crypto::signatures::{
        SigningKey, VerifyingKey,
        signable::{Signature, sign_content_bytes},
    },
    identifiers::{EncryptedLocalPseudonym, LocalPseudonym, PolymorphicPseudonym, UserIdentity},
    time::{Duration, TimeStamp},
};

/// Default lifetime of a ticket after issuance.
pub fn default_ticket_validity() -> Duration {
    Duration::hours(12)
}

/// Marker type for ticket signature keys.
#[derive(Debug, Clone)]
pub struct TicketKeyType;

/// One of the access modes grantable per `(user_group, target)` pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AccessMode {
    Read,
    Write,
    ReadMeta,
    WriteMeta,
    Access,
    Enumerate,
}

impl AccessMode {
    pub const ALL: [AccessMode; 6] = [
        AccessMode::Read,
        AccessMode::Write,
        AccessMode::ReadMeta,
        AccessMode::WriteMeta,
        AccessMode::Access,
        AccessMode::Enumerate,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AccessMode::Read => "read",
            AccessMode::Write => "write",
            AccessMode::ReadMeta => "read-meta",
            AccessMode::WriteMeta => "write-meta",
            AccessMode::Access => "access",
            AccessMode::Enumerate => "enumerate",
        }
    }
}

impl fmt::Display for AccessMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for AccessMode {
    type Err = UnknownAccessMode;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        AccessMode::ALL
            .into_iter()
            .find(|mode| mode.as_str() == s)
            .ok_or_else(|| UnknownAccessMode(s.to_owned()))
    }
}

#[derive(Debug, Clone, Error)]
#[error("unknown access mode {0:?}")]
pub struct UnknownAccessMode(pub String);

/// One participant in a ticket, in its three representations: polymorphic,
/// Access-Manager-local and Storage-Facility-local, plus optionally the
/// requester's access-group pseudonym (still encrypted to the requester's
/// enrolled pseudonym key).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PseudonymEntry {
    pub polymorphic: PolymorphicPseudonym,
    pub access_manager: LocalPseudonym,
    pub storage_facility: LocalPseudonym,
    pub access_group: Option<EncryptedLocalPseudonym>,
}

/// The payload of a ticket. Immutable once signed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ticket {
    pub issued_at: TimeStamp,
    pub user: String,
    pub user_group: String,
    pub modes: Vec<AccessMode>,
    pub columns: Vec<String>,
    pub pseudonyms: Vec<PseudonymEntry>,
}

impl Ticket {
    pub fn identity(&self) -> UserIdentity {
        UserIdentity::new(self.user.clone(), self.user_group.clone())
    }

    /// Whether the ticket grants `mode`. `read` implies `read-meta`.
    pub fn grants_mode(&self, mode: AccessMode) -> bool {
        self.modes.contains(&mode)
            || (mode == AccessMode::ReadMeta && self.modes.contains(&AccessMode::Read))
    }

    pub fn column_index(&self, column: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == column)
    }

    pub fn pseudonym(&self, index: usize) -> Result<&PseudonymEntry, TicketError> {
        self.pseudonyms
            .get(index)
            .ok_or(TicketError::IndexOutOfRange)
    }

    pub fn column(&self, index: usize) -> Result<&str, TicketError> {
        self.columns
            .get(index)
            .map(String::as_str)
            .ok_or(TicketError::IndexOutOfRange)
    }
}

/// The parties that contribute to a ticket's signature chain, in signing
/// order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TicketSigner {
    AccessManager,
    Transcryptor,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartySignature {
    pub signer: TicketSigner,
    pub signature: Signature<TicketKeyType>,
}

/// The verifying keys a party trusts for ticket validation.
#[derive(Debug, Clone)]
pub struct TicketVerifyingKeys {
    pub access_manager: VerifyingKey<TicketKeyType>,
    pub transcryptor: VerifyingKey<TicketKeyType>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TicketError {
    /// A signature in the chain failed to verify against the trusted roots.
    #[error("ticket signature chain invalid")]
    SignatureInvalid,
    /// The signature chain is missing a required party signature.
    #[error("ticket signature chain incomplete")]
    SignatureChainIncomplete,
    #[error("ticket expired")]
    Expired,
    #[error("ticket not yet valid")]
    NotYetValid,
    /// The attempted operation is not a subset of what the ticket covers.
    #[error("ticket does not grant {mode} on {subject}")]
    NotCovered { mode: AccessMode, subject: String },
    /// A column or pseudonym index pointed outside the ticket's vectors.
    #[error("ticket index out of range")]
    IndexOutOfRange,
    #[error("ticket encoding error")]
    Encoding,
}

const TICKET_SIGN_LABEL: &str = "Ticket";

/// A ticket plus its signature chain. Each signature covers the serialized
/// ticket concatenated with all previous signatures, so stripping or
/// reordering chain links is detectable.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedTicket {
    ticket: Ticket,
    signatures: Vec<PartySignature>,
}

impl SignedTicket {
    fn chain_payload(
        ticket: &Ticket,
        previous: &[PartySignature],
    ) -> Result<Vec<u8>, LibraryError> {
        let mut payload = codec::to_vec(ticket).map_err(|_| LibraryError {})?;
        for link in previous {
            payload.extend_from_slice(link.signature.as_ref());
        }
        sign_content_bytes(TICKET_SIGN_LABEL, &payload)
    }

    /// Start the chain with the issuing party's signature.
    pub fn sign(
        ticket: Ticket,
        signer: TicketSigner,
        key: &SigningKey<TicketKeyType>,
    ) -> Result<Self, LibraryError> {
        let mut signed = Self {
            ticket,
            signatures: Vec::new(),
        };
        signed.countersign(signer, key)?;
        Ok(signed)
    }

    /// Append this party's signature to the chain.
    pub fn countersign(
        &mut self,
        signer: TicketSigner,
        key: &SigningKey<TicketKeyType>,
    ) -> Result<(), LibraryError> {
        let payload = Self::chain_payload(&self.ticket, &self.signatures)?;
        self.signatures.push(PartySignature {
            signer,
            signature: key.sign_payload(&payload),
        });
        Ok(())
    }

    /// Access to the payload before validation. Only issuance plumbing may
    /// use this; every acting party goes through [`Self::open`].
    pub fn unvalidated(&self) -> &Ticket {
        &self.ticket
    }

    /// Verify that the chain consists of exactly the expected signers, in
    /// order, each over the ticket payload plus the previous links.
    pub fn verify_links(
        &self,
        roots: &TicketVerifyingKeys,
        expected: &[TicketSigner],
    ) -> Result<(), TicketError> {
        if self.signatures.len() != expected.len() {
            return Err(TicketError::SignatureChainIncomplete);
        }
        for (i, (link, expected_signer)) in self.signatures.iter().zip(expected).enumerate() {
            if link.signer != *expected_signer {
                return Err(TicketError::SignatureChainIncomplete);
            }
            let payload = Self::chain_payload(&self.ticket, &self.signatures[..i])
                .map_err(|_| TicketError::Encoding)?;
            let key = match link.signer {
                TicketSigner::AccessManager => &roots.access_manager,
                TicketSigner::Transcryptor => &roots.transcryptor,
            };
            key.verify(&payload, &link.signature)
                .map_err(|_| TicketError::SignatureInvalid)?;
        }
        Ok(())
    }

    /// Validate the signature chain and the validity window, yielding the
    /// ticket payload.
    pub fn open(
        &self,
        roots: &TicketVerifyingKeys,
        validity: Duration,
    ) -> Result<&Ticket, TicketError> {
        self.open_at(roots, validity, TimeStamp::now())
    }

    pub fn open_at(
        &self,
        roots: &TicketVerifyingKeys,
        validity: Duration,
        now: TimeStamp,
    ) -> Result<&Ticket, TicketError> {
        self.verify_links(
            roots,
            &[TicketSigner::AccessManager, TicketSigner::Transcryptor],
        )?;

        let issued_at = self.ticket.issued_at;
        if now < issued_at {
            return Err(TicketError::NotYetValid);
        }
        if now > issued_at + validity {
            return Err(TicketError::Expired);
        }
        Ok(&self.ticket)
    }
}

/// A signed ticket plus the indices each requested group expanded to, so
/// clients can re-apply group semantics without re-resolving names.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexedTicket {
    pub ticket: SignedTicket,
    pub column_groups: std::collections::BTreeMap<String, Vec<u32>>,
    pub participant_groups: std::collections::BTreeMap<String, Vec<u32>>,
}

/// What a requester asks the Access Manager for.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TicketRequest {
    /// Explicit polymorphic pseudonyms (may be empty).
    pub pps: Vec<PolymorphicPseudonym>,
    /// Named participant groups, resolved to pseudonyms at issue time.
    pub participant_groups: Vec<String>,
    pub columns: Vec<String>,
    pub column_groups: Vec<String>,
    pub modes: Vec<AccessMode>,
    /// If set, the ticket additionally carries each pseudonym's local
    /// pseudonym at the requester's access group.
    pub include_access_group_pseudonyms: bool,
}

#[cfg(test)]
mod tests {
    use crate::{
        crypto::{elgamal::ElgamalPrivateKey, group::GroupElement},
        identifiers::ParticipantIdentifier,
    };

    use super::*;

    fn test_ticket() -> Ticket {
        let master = ElgamalPrivateKey::random();
        let pp = ParticipantIdentifier::new("Alice").polymorphic(&master.public_key());
        Ticket {
            issued_at: TimeStamp::now(),
            user: "alice".to_owned(),
            user_group: "ResearchAssessor".to_owned(),
            modes: vec![AccessMode::Read],
            columns: vec!["ParticipantInfo".to_owned()],
            pseudonyms: vec![PseudonymEntry {
                polymorphic: pp,
                access_manager: LocalPseudonym::from_element(GroupElement::hash(b"am")),
                storage_facility: LocalPseudonym::from_element(GroupElement::hash(b"sf")),
                access_group: None,
            }],
        }
    }

    fn sign_chain(
        ticket: Ticket,
    ) -> (
        SignedTicket,
        TicketVerifyingKeys,
        SigningKey<TicketKeyType>,
        SigningKey<TicketKeyType>,
    ) {
        let am_key = SigningKey::generate().unwrap();
        let ts_key = SigningKey::generate().unwrap();
        let mut signed = SignedTicket::sign(ticket, TicketSigner::AccessManager, &am_key).unwrap();
        signed.countersign(TicketSigner::Transcryptor, &ts_key).unwrap();
        let roots = TicketVerifyingKeys {
            access_manager: am_key.verifying_key(),
            transcryptor: ts_key.verifying_key(),
        };
        (signed, roots, am_key, ts_key)
    }

    #[test]
    fn chain_verifies() {
        let (signed, roots, _, _) = sign_chain(test_ticket());
        let ticket = signed.open(&roots, default_ticket_validity()).unwrap();
        assert_eq!(ticket.user, "alice");
    }

    #[test]
    fn missing_countersignature_is_rejected() {
        let am_key = SigningKey::generate().unwrap();
        let ts_key = SigningKey::<TicketKeyType>::generate().unwrap();
        let signed =
            SignedTicket::sign(test_ticket(), TicketSigner::AccessManager, &am_key).unwrap();
        let roots = TicketVerifyingKeys {
            access_manager: am_key.verifying_key(),
            transcryptor: ts_key.verifying_key(),
        };
        assert_eq!(
            signed.open(&roots, default_ticket_validity()).unwrap_err(),
            TicketError::SignatureChainIncomplete
        );
    }

    #[test]
    fn tampered_ticket_is_rejected() {
        let (mut signed, roots, _, _) = sign_chain(test_ticket());
        signed.ticket.user = "mallory".to_owned();
        assert_eq!(
            signed.open(&roots, default_ticket_validity()).unwrap_err(),
            TicketError::SignatureInvalid
        );
    }

    #[test]
    fn expired_ticket_is_rejected() {
        let mut ticket = test_ticket();
        ticket.issued_at = TimeStamp::now() + Duration::hours(-24);
        let (signed, roots, _, _) = sign_chain(ticket);
        assert_eq!(
            signed.open(&roots, default_ticket_validity()).unwrap_err(),
            TicketError::Expired
        );
    }

    #[test]
    fn ticket_from_the_future_is_rejected() {
        let mut ticket = test_ticket();
        ticket.issued_at = TimeStamp::now() + Duration::hours(1);
        let (signed, roots, _, _) = sign_chain(ticket);
        assert_eq!(
            signed.open(&roots, default_ticket_validity()).unwrap_err(),
            TicketError::NotYetValid
        );
    }

    #[test]
    fn validity_is_anchored_at_issuance() {
        // A ticket stays valid throughout its window independent of later
        // rule changes; only the clock ends it.
        let mut ticket = test_ticket();
        ticket.issued_at = TimeStamp::now() + Duration::hours(-11);
        let (signed, roots, _, _) = sign_chain(ticket);
        assert!(signed.open(&roots, default_ticket_validity()).is_ok());
    }

    #[test]
    fn read_implies_read_meta() {
        let ticket = test_ticket();
        assert!(ticket.grants_mode(AccessMode::ReadMeta));
        assert!(!ticket.grants_mode(AccessMode::Write));
    }

    #[test]
    fn access_mode_string_roundtrip() {
        for mode in AccessMode::ALL {
            assert_eq!(mode.as_str().parse::<AccessMode>().unwrap(), mode);
        }
        assert!("owner".parse::<AccessMode>().is_err());
    }
}
