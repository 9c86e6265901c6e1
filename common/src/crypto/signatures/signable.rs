// SPDX-FileCopyrightText: 2025 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! This module defines traits used for signing and verifying structs.
//!
//! # Type-Enforced Verification
//!
//! * the signer creates an instance of a struct that implements [`Signable`]
//! * the signer signs it, consuming the [`Signable`] struct and producing a
//!   [`SignedStruct`]
//! * the signer serializes the struct and sends it to the verifier
//! * the verifier deserializes the byte-string into a struct implementing
//!   [`Verifiable`]
//! * the verifier verifies the struct, consuming the [`Verifiable`] struct
//!   and producing a [`VerifiedStruct`]
//!
//! This way only verified structs are used as input for further processing
//! functions on the verifier side.

use std::marker::PhantomData;

use serde::{Deserialize, Serialize};
use tls_codec::{Serialize as TlsSerializeTrait, TlsDeserializeBytes, TlsSerialize, TlsSize, VLBytes};

use crate::{LibraryError, codec};

use super::{SignatureVerificationError, SigningKey, VerifyingKey};

#[derive(Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Signature<KT> {
    #[serde(with = "serde_bytes")]
    bytes: Vec<u8>,
    _phantom: PhantomData<KT>,
}

impl<KT> std::fmt::Debug for Signature<KT> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Signature({})", hex::encode(&self.bytes))
    }
}

impl<KT> PartialEq for Signature<KT> {
    fn eq(&self, other: &Self) -> bool {
        self.bytes == other.bytes
    }
}

impl<KT> Eq for Signature<KT> {}

impl<KT> Signature<KT> {
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self {
            bytes,
            _phantom: PhantomData,
        }
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }
}

impl<KT> AsRef<[u8]> for Signature<KT> {
    fn as_ref(&self) -> &[u8] {
        &self.bytes
    }
}

/// This trait must be implemented by all structs that contain a self-signature.
pub trait SignedStruct<T, KT> {
    /// Build a signed struct version from the payload struct.
    fn from_payload(payload: T, signature: Signature<KT>) -> Self;
}

/// Labeled signature content.
#[derive(Debug, Clone, TlsSerialize, TlsDeserializeBytes, TlsSize)]
pub struct SignContent {
    label: VLBytes,
    content: VLBytes,
}

const SIGN_LABEL_PREFIX: &str = "Morpho Protocol";

impl From<(&str, &[u8])> for SignContent {
    fn from((label, content): (&str, &[u8])) -> Self {
        let label_string = SIGN_LABEL_PREFIX.to_owned() + label;
        let label = label_string.as_bytes().into();
        Self {
            label,
            content: content.into(),
        }
    }
}

/// The domain-separated byte string actually passed to the signature scheme
/// for the given label and payload.
pub fn sign_content_bytes(label: &str, payload: &[u8]) -> Result<Vec<u8>, LibraryError> {
    SignContent::from((label, payload))
        .tls_serialize_detached()
        .map_err(|_| LibraryError {})
}

/// This trait must be implemented by all structs that are signed.
pub trait Signable: Sized {
    type SignedOutput: SignedStruct<Self, Self::KeyType>;
    type KeyType;

    fn unsigned_payload(&self) -> Result<Vec<u8>, codec::Error>;
    fn label(&self) -> &str;

    fn sign(self, signing_key: &SigningKey<Self::KeyType>) -> Result<Self::SignedOutput, LibraryError> {
        let payload = self.unsigned_payload().map_err(|_| LibraryError {})?;
        let content = sign_content_bytes(self.label(), &payload)?;
        let signature = signing_key.sign_payload(&content);
        Ok(Self::SignedOutput::from_payload(self, signature))
    }
}

/// The verifier side of the flow. Structs implementing this trait expose the
/// signed payload and signature, and are consumed into their verified
/// counterpart on success.
pub trait Verifiable: Sized {
    type VerifiedStruct;
    type KeyType;

    fn unsigned_payload(&self) -> Result<Vec<u8>, codec::Error>;
    fn signature(&self) -> &Signature<Self::KeyType>;
    fn label(&self) -> &str;

    fn verify(
        self,
        verifying_key: &VerifyingKey<Self::KeyType>,
    ) -> Result<Self::VerifiedStruct, SignatureVerificationError>
    where
        Self: VerifiedStruct,
    {
        let payload = self
            .unsigned_payload()
            .map_err(|_| SignatureVerificationError::VerificationFailure)?;
        let content = sign_content_bytes(self.label(), &payload)
            .map_err(|_| SignatureVerificationError::VerificationFailure)?;
        verifying_key.verify(&content, self.signature())?;
        Ok(self.into_verified())
    }
}

/// Transition from an unverified [`Verifiable`] struct into its verified
/// counterpart. Only called after signature verification succeeded.
pub trait VerifiedStruct: Verifiable {
    fn into_verified(self) -> Self::VerifiedStruct;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    struct TestPayload {
        value: String,
    }

    struct TestKeyType;

    #[derive(Debug)]
    struct SignedTestPayload {
        payload: TestPayload,
        signature: Signature<TestKeyType>,
    }

    impl SignedStruct<TestPayload, TestKeyType> for SignedTestPayload {
        fn from_payload(payload: TestPayload, signature: Signature<TestKeyType>) -> Self {
            Self { payload, signature }
        }
    }

    impl Signable for TestPayload {
        type SignedOutput = SignedTestPayload;
        type KeyType = TestKeyType;

        fn unsigned_payload(&self) -> Result<Vec<u8>, codec::Error> {
            codec::to_vec(self)
        }

        fn label(&self) -> &str {
            "TestPayload"
        }
    }

    impl Verifiable for SignedTestPayload {
        type VerifiedStruct = TestPayload;
        type KeyType = TestKeyType;

        fn unsigned_payload(&self) -> Result<Vec<u8>, codec::Error> {
            codec::to_vec(&self.payload)
        }

        fn signature(&self) -> &Signature<TestKeyType> {
            &self.signature
        }

        fn label(&self) -> &str {
            "TestPayload"
        }
    }

    impl VerifiedStruct for SignedTestPayload {
        fn into_verified(self) -> TestPayload {
            self.payload
        }
    }

    #[test]
    fn sign_verify_roundtrip() {
        let key = SigningKey::<TestKeyType>::generate().unwrap();
        let payload = TestPayload {
            value: "signed".to_string(),
        };
        let signed = payload.clone().sign(&key).unwrap();
        let verified = signed.verify(&key.verifying_key()).unwrap();
        assert_eq!(verified, payload);
    }

    #[test]
    fn wrong_key_fails() {
        let key = SigningKey::<TestKeyType>::generate().unwrap();
        let other = SigningKey::<TestKeyType>::generate().unwrap();
        let payload = TestPayload {
            value: "signed".to_string(),
        };
        let signed = payload.sign(&key).unwrap();
        assert!(signed.verify(&other.verifying_key()).is_err());
    }

    #[test]
    fn tampered_payload_fails() {
        let key = SigningKey::<TestKeyType>::generate().unwrap();
        let payload = TestPayload {
            value: "signed".to_string(),
        };
        let mut signed = payload.sign(&key).unwrap();
        signed.payload.value = "tampered".to_string();
        assert!(signed.verify(&key.verifying_key()).is_err());
    }
}
