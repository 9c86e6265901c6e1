// SPDX-FileCopyrightText: 2025 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Identifiers of participants and requesters. Participants are only ever
//! handled in pseudonymised form: as rerandomised ElGamal ciphertexts
//! ([`PolymorphicPseudonym`]) in flight, and as per-party deterministic group
//! elements ([`LocalPseudonym`]) at rest.

use std::{fmt, hash::Hash as StdHash};

use serde::{Deserialize, Serialize};
use sqlx::{Database, Decode, Encode, Type, encode::IsNull, error::BoxDynError};

use crate::crypto::{
    elgamal::{ElgamalCiphertext, ElgamalPrivateKey, ElgamalPublicKey},
    errors::GroupError,
    group::{GROUP_ELEMENT_SIZE, GroupElement},
};

/// A real-world participant identifier as supplied by a data source. Only
/// clients ever hold this; the server parties see nothing but pseudonyms
/// derived from it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticipantIdentifier(String);

impl ParticipantIdentifier {
    pub fn new(identifier: impl Into<String>) -> Self {
        Self(identifier.into())
    }

    /// The group element encoding of this identifier: `Hash(identifier)·G`
    /// in effect, via the Elligator map.
    pub fn to_element(&self) -> GroupElement {
        GroupElement::hash(self.0.as_bytes())
    }

    /// Encrypt this identifier's group element into a fresh polymorphic
    /// pseudonym under the master pseudonym key.
    pub fn polymorphic(&self, master_key: &ElgamalPublicKey) -> PolymorphicPseudonym {
        PolymorphicPseudonym(ElgamalCiphertext::encrypt(&self.to_element(), master_key))
    }
}

impl fmt::Display for ParticipantIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An ElGamal encryption of a participant's identifier element under the
/// master pseudonym key. Two pseudonyms of the same participant are never
/// byte-equal; equality of the underlying participant is only decidable
/// after transcryption to a local pseudonym.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolymorphicPseudonym(ElgamalCiphertext);

impl PolymorphicPseudonym {
    pub fn from_ciphertext(ciphertext: ElgamalCiphertext) -> Self {
        Self(ciphertext)
    }

    pub fn ciphertext(&self) -> &ElgamalCiphertext {
        &self.0
    }

    /// Fresh randomness, same participant.
    pub fn rerandomize(&self) -> Self {
        Self(self.0.rerandomize())
    }
}

/// A local pseudonym in flight: still ElGamal-encrypted, addressed to the
/// pseudonym decryption key of exactly one party.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedLocalPseudonym(ElgamalCiphertext);

impl EncryptedLocalPseudonym {
    pub fn from_ciphertext(ciphertext: ElgamalCiphertext) -> Self {
        Self(ciphertext)
    }

    pub fn ciphertext(&self) -> &ElgamalCiphertext {
        &self.0
    }

    pub fn decrypt(&self, key: &ElgamalPrivateKey) -> LocalPseudonym {
        LocalPseudonym::from_element(self.0.decrypt(key))
    }
}

/// The deterministic representation of one participant at one party. Stable
/// (same participant, same party, same pseudonym) and opaque across parties.
#[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalPseudonym {
    element: GroupElement,
}

impl LocalPseudonym {
    pub fn from_element(element: GroupElement) -> Self {
        Self { element }
    }

    pub fn element(&self) -> &GroupElement {
        &self.element
    }

    pub fn pack(&self) -> [u8; GROUP_ELEMENT_SIZE] {
        self.element.pack()
    }

    pub fn unpack_slice(bytes: &[u8]) -> Result<Self, GroupError> {
        GroupElement::unpack_slice(bytes).map(Self::from_element)
    }

    /// Hex form used in logs and textual interfaces.
    pub fn hex(&self) -> String {
        hex::encode(self.pack())
    }
}

impl fmt::Debug for LocalPseudonym {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LocalPseudonym({})", self.hex())
    }
}

impl StdHash for LocalPseudonym {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        state.write(&self.pack());
    }
}

impl<DB: Database> Type<DB> for LocalPseudonym
where
    Vec<u8>: Type<DB>,
{
    fn type_info() -> DB::TypeInfo {
        Vec::<u8>::type_info()
    }
}

impl<'q, DB: Database> Encode<'q, DB> for LocalPseudonym
where
    Vec<u8>: Encode<'q, DB>,
{
    fn encode_by_ref(
        &self,
        buf: &mut <DB as Database>::ArgumentBuffer<'q>,
    ) -> Result<IsNull, BoxDynError> {
        Encode::<DB>::encode(self.pack().to_vec(), buf)
    }
}

impl<'r, DB: Database> Decode<'r, DB> for LocalPseudonym
where
    &'r [u8]: Decode<'r, DB>,
{
    fn decode(value: <DB as Database>::ValueRef<'r>) -> Result<Self, BoxDynError> {
        let bytes: &[u8] = Decode::<DB>::decode(value)?;
        Self::unpack_slice(bytes).map_err(|e| BoxDynError::from(e.to_string()))
    }
}

/// Identity of a requester as taken from the transport certificate:
/// common-name = user, organisational-unit = user group.
#[derive(Debug, Clone, PartialEq, Eq, StdHash, Serialize, Deserialize)]
pub struct UserIdentity {
    pub user: String,
    pub user_group: String,
}

impl UserIdentity {
    pub fn new(user: impl Into<String>, user_group: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            user_group: user_group.into(),
        }
    }
}

impl fmt::Display for UserIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.user, self.user_group)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn polymorphic_pseudonyms_are_rerandomised() {
        let master = ElgamalPrivateKey::random();
        let id = ParticipantIdentifier::new("Alice");
        let pp1 = id.polymorphic(&master.public_key());
        let pp2 = id.polymorphic(&master.public_key());
        assert_ne!(pp1, pp2);
        // Same underlying element nonetheless.
        assert_eq!(
            pp1.ciphertext().decrypt(&master),
            pp2.ciphertext().decrypt(&master)
        );
    }

    #[test]
    fn local_pseudonym_pack_roundtrip() {
        let lp = LocalPseudonym::from_element(GroupElement::hash(b"lp"));
        let packed = lp.pack();
        assert_eq!(LocalPseudonym::unpack_slice(&packed).unwrap(), lp);
    }
}
