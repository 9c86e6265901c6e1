// SPDX-FileCopyrightText: 2025 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Keys for the encryption of stored cell artifacts. Both are derived from
//! the per-cell data key, never stored, and rederived on every use.

use crate::crypto::{
    kdf::{KDF_KEY_SIZE, KdfDerivable},
    secrets::Secret,
};

use super::{AEAD_KEY_SIZE, EarKey};

/// Key for one payload page of one cell.
#[derive(Debug)]
pub struct PageEncryptionKey {
    key: Secret<AEAD_KEY_SIZE>,
}

impl From<Secret<KDF_KEY_SIZE>> for PageEncryptionKey {
    fn from(key: Secret<KDF_KEY_SIZE>) -> Self {
        Self { key }
    }
}

impl AsRef<Secret<AEAD_KEY_SIZE>> for PageEncryptionKey {
    fn as_ref(&self) -> &Secret<AEAD_KEY_SIZE> {
        &self.key
    }
}

impl EarKey for PageEncryptionKey {}

impl KdfDerivable for PageEncryptionKey {
    const LABEL: &'static str = "page encryption key";
}

/// Key for the encrypted extras of one cell's metadata.
#[derive(Debug)]
pub struct MetadataEntryKey {
    key: Secret<AEAD_KEY_SIZE>,
}

impl From<Secret<KDF_KEY_SIZE>> for MetadataEntryKey {
    fn from(key: Secret<KDF_KEY_SIZE>) -> Self {
        Self { key }
    }
}

impl AsRef<Secret<AEAD_KEY_SIZE>> for MetadataEntryKey {
    fn as_ref(&self) -> &Secret<AEAD_KEY_SIZE> {
        &self.key
    }
}

impl EarKey for MetadataEntryKey {}

impl KdfDerivable for MetadataEntryKey {
    const LABEL: &'static str = "metadata entry key";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derivations_are_domain_separated() {
        let page = PageEncryptionKey::derive(b"cell key", &[b"ctx"]).unwrap();
        let meta = MetadataEntryKey::derive(b"cell key", &[b"ctx"]).unwrap();
        assert_ne!(page.as_ref().secret(), meta.as_ref().secret());
    }

    #[test]
    fn encrypt_decrypt_roundtrip() {
        let key = PageEncryptionKey::derive(b"cell key", &[b"page", &[0]]).unwrap();
        let ciphertext = key.encrypt(b"payload".as_slice()).unwrap();
        assert_eq!(key.decrypt(&ciphertext).unwrap(), b"payload");
    }

    #[test]
    fn tampered_ciphertext_fails() {
        let key = PageEncryptionKey::derive(b"cell key", &[b"page", &[0]]).unwrap();
        let mut ciphertext = key.encrypt(b"payload".as_slice()).unwrap();
        ciphertext.flip_bit();
        assert!(key.decrypt(&ciphertext).is_err());
    }
}
