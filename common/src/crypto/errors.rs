// SPDX-FileCopyrightText: 2025 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Errors of the cryptographic primitives.

use displaydoc::Display;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Error)]
pub enum RandomnessError {
    /// Insufficient randomness
    InsufficientRandomness,
}

/// Errors of group element and scalar arithmetic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Error)]
pub enum GroupError {
    /// malformed group element or scalar encoding
    InvalidEncoding,
    /// attempted to invert the zero scalar
    NonInvertibleScalar,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Error)]
pub enum EncryptionError {
    /// Could not generate nonce
    RandomnessError,
    /// Error encrypting the plaintext
    EncryptionError,
    /// Error serializing the plaintext
    SerializationError,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Error)]
pub enum DecryptionError {
    /// Error decrypting the ciphertext
    DecryptionError,
    /// Error deserializing the payload
    DeserializationError,
    /// Error serializing the associated data
    SerializationError,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Error)]
pub enum KeyGenerationError {
    /// Not enough randomness to generate the key
    RandomnessError,
}
