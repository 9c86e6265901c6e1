// SPDX-FileCopyrightText: 2025 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Typed signing and verifying keys. Keys are parameterized by a marker type
//! so that a key for one purpose (tickets, tokens) cannot be used for
//! another.

pub mod signable;

use std::marker::PhantomData;

use ed25519_dalek::{Signer as _, Verifier as _};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::crypto::errors::KeyGenerationError;

use signable::Signature;

#[derive(Debug, Error)]
pub enum SignatureVerificationError {
    /// Could not verify this signature with the given payload.
    #[error("Could not verify this signature with the given payload.")]
    VerificationFailure,
}

/// A key that can be used to verify signatures. It is parameterized by a
/// unique key type to ensure type safety.
#[derive(Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VerifyingKey<KT> {
    key: ed25519_dalek::VerifyingKey,
    _type: PhantomData<KT>,
}

impl<KT> std::fmt::Debug for VerifyingKey<KT> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "VerifyingKey({})", hex::encode(self.key.as_bytes()))
    }
}

impl<KT> PartialEq for VerifyingKey<KT> {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl<KT> Eq for VerifyingKey<KT> {}

impl<KT> VerifyingKey<KT> {
    /// Verify the given signature over the given payload.
    pub fn verify(
        &self,
        payload: &[u8],
        signature: &Signature<KT>,
    ) -> Result<(), SignatureVerificationError> {
        let signature = ed25519_dalek::Signature::from_slice(signature.as_ref())
            .map_err(|_| SignatureVerificationError::VerificationFailure)?;
        self.key
            .verify(payload, &signature)
            .map_err(|_| SignatureVerificationError::VerificationFailure)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        self.key.as_bytes()
    }
}

/// A key that can be used to produce signatures. The verifying half is
/// published to the other parties; the signing half never leaves its party.
#[derive(Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SigningKey<KT> {
    key: ed25519_dalek::SigningKey,
    _type: PhantomData<KT>,
}

impl<KT> std::fmt::Debug for SigningKey<KT> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SigningKey([[REDACTED]])")
    }
}

impl<KT> SigningKey<KT> {
    pub fn generate() -> Result<Self, KeyGenerationError> {
        let key = ed25519_dalek::SigningKey::generate(&mut rand::rngs::OsRng);
        Ok(Self {
            key,
            _type: PhantomData,
        })
    }

    pub fn verifying_key(&self) -> VerifyingKey<KT> {
        VerifyingKey {
            key: self.key.verifying_key(),
            _type: PhantomData,
        }
    }

    pub(crate) fn sign_payload(&self, payload: &[u8]) -> Signature<KT> {
        Signature::from_bytes(self.key.sign(payload).to_bytes().to_vec())
    }
}
