// SPDX-FileCopyrightText: 2025 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! The key trait for encryption at rest. Payload pages and metadata extras
//! are raw byte strings, so encryption operates on byte payloads directly;
//! all structure is bound through the key derivation context instead of
//! associated data.

use aes_gcm::{
    KeyInit,
    aead::{Aead as AesGcmAead, Key, Nonce, Payload},
};
use tracing::{error, instrument};

use crate::crypto::{
    errors::{DecryptionError, EncryptionError, RandomnessError},
    secrets::Secret,
};

use super::{AEAD_KEY_SIZE, AEAD_NONCE_SIZE, Aead, AeadCiphertext};

/// A trait meant for structs holding a symmetric key of size [`AEAD_KEY_SIZE`].
/// It enables use of these keys for encryption and decryption operations.
pub trait EarKey: AsRef<Secret<AEAD_KEY_SIZE>> {
    // Encrypt the given plaintext under the given key. Generates a random nonce internally.
    #[instrument(level = "trace", skip_all, fields(key_type = std::any::type_name::<Self>()))]
    fn encrypt<'msg, 'aad>(
        &self,
        plaintext: impl Into<Payload<'msg, 'aad>>,
    ) -> Result<AeadCiphertext, EncryptionError> {
        // Key and AEAD algorithm are static, so from_slice cannot fail here.
        let key = Key::<Aead>::from_slice(self.as_ref().secret());
        let cipher: Aead = Aead::new(key);
        let nonce_raw = Secret::<AEAD_NONCE_SIZE>::random().map_err(|e| match e {
            RandomnessError::InsufficientRandomness => EncryptionError::RandomnessError,
        })?;
        let nonce = Nonce::<Aead>::from(nonce_raw.into_secret());
        let ciphertext = cipher
            .encrypt(&nonce, plaintext)
            .map_err(|_| EncryptionError::EncryptionError)?;
        Ok(AeadCiphertext::new(ciphertext, nonce.into()))
    }

    // Decrypt the given ciphertext (including the nonce) using the given key.
    #[instrument(level = "trace", skip_all, fields(key_type = std::any::type_name::<Self>()))]
    fn decrypt(&self, ciphertext: &AeadCiphertext) -> Result<Vec<u8>, DecryptionError> {
        let key = Key::<Aead>::from_slice(self.as_ref().secret());
        let cipher: Aead = Aead::new(key);
        cipher
            .decrypt(
                ciphertext.nonce().into(),
                Payload {
                    aad: &[],
                    msg: ciphertext.ciphertext(),
                },
            )
            .map_err(|e| {
                error!(%e, "Decryption error");
                DecryptionError::DecryptionError
            })
    }
}
