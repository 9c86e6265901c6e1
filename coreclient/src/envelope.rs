// SPDX-FileCopyrightText: 2025 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! The cell envelope: client-side transformation between plaintext payloads
//! and the stored artifacts (AEAD pages plus metadata extras). Page keys are
//! derived from the per-cell data key, the cell coordinates and the digest
//! of the extras bound to the cell, so any tampering with those inputs makes
//! decryption fail.

use std::collections::BTreeMap;

use morphocommon::{
    codec,
    crypto::{
        ear::{
            AEAD_MAC_SIZE, AeadCiphertext, EarKey,
            keys::{MetadataEntryKey, PageEncryptionKey},
        },
        kdf::KdfDerivable,
        transcryption::DataKey,
    },
    identifiers::LocalPseudonym,
    messages::storage::{DataPayloadPage, Metadata, MetadataXEntry},
};
use thiserror::Error;

/// Payloads up to this size are stored as a single page; larger payloads
/// are chunked into pages of exactly this size (except the last).
pub(crate) const INLINE_PAGE_THRESHOLD: usize = 64 * 1024;

#[derive(Debug, Error)]
pub enum EnvelopeError {
    /// AEAD failure at decryption; the payload or a bound input was
    /// tampered with.
    #[error("payload corrupted")]
    PayloadCorrupted,
    #[error("page encryption failed")]
    EncryptionFailure,
    /// Pages are missing or out of order.
    #[error("payload pages incomplete")]
    IncompletePages,
}

fn page_key(
    data_key: &DataKey,
    column: &str,
    pseudonym: &LocalPseudonym,
    page_number: u64,
    bound_digest: &[u8; 32],
) -> Result<PageEncryptionKey, EnvelopeError> {
    PageEncryptionKey::derive(
        &data_key.ikm(),
        &[
            column.as_bytes(),
            &pseudonym.pack(),
            &page_number.to_be_bytes(),
            bound_digest,
        ],
    )
    .map_err(|_| EnvelopeError::EncryptionFailure)
}

/// Encrypt a payload into its pages. `entry_index` is the position of the
/// cell within the surrounding request.
pub(crate) fn encrypt_payload(
    data_key: &DataKey,
    column: &str,
    pseudonym: &LocalPseudonym,
    bound_digest: &[u8; 32],
    payload: &[u8],
    entry_index: u64,
) -> Result<Vec<DataPayloadPage>, EnvelopeError> {
    let chunks: Vec<&[u8]> = if payload.is_empty() {
        vec![&[]]
    } else {
        payload.chunks(INLINE_PAGE_THRESHOLD).collect()
    };

    let mut pages = Vec::with_capacity(chunks.len());
    for (page_number, chunk) in chunks.into_iter().enumerate() {
        let key = page_key(data_key, column, pseudonym, page_number as u64, bound_digest)?;
        let ciphertext = key
            .encrypt(chunk)
            .map_err(|_| EnvelopeError::EncryptionFailure)?;
        let (mut bytes, nonce) = ciphertext.into_parts();
        if bytes.len() < AEAD_MAC_SIZE {
            return Err(EnvelopeError::EncryptionFailure);
        }
        let mac = bytes.split_off(bytes.len() - AEAD_MAC_SIZE);
        pages.push(DataPayloadPage {
            crypto_nonce: nonce,
            crypto_mac: mac,
            payload_data: bytes,
            page_number: page_number as u64,
            index: entry_index,
        });
    }
    Ok(pages)
}

/// Decrypt and reassemble a payload from its pages.
pub(crate) fn decrypt_payload(
    data_key: &DataKey,
    column: &str,
    pseudonym: &LocalPseudonym,
    bound_digest: &[u8; 32],
    mut pages: Vec<DataPayloadPage>,
) -> Result<Vec<u8>, EnvelopeError> {
    pages.sort_by_key(|page| page.page_number);
    for (expected, page) in pages.iter().enumerate() {
        if page.page_number != expected as u64 {
            return Err(EnvelopeError::IncompletePages);
        }
    }

    let mut payload = Vec::new();
    for page in pages {
        let key = page_key(data_key, column, pseudonym, page.page_number, bound_digest)?;
        let mut bytes = page.payload_data;
        bytes.extend_from_slice(&page.crypto_mac);
        let ciphertext = AeadCiphertext::new(bytes, page.crypto_nonce);
        let chunk = key
            .decrypt(&ciphertext)
            .map_err(|_| EnvelopeError::PayloadCorrupted)?;
        payload.extend_from_slice(&chunk);
    }
    Ok(payload)
}

/// A metadata extra before sealing.
#[derive(Debug, Clone)]
pub struct PlainExtra {
    pub value: Vec<u8>,
    pub stored_encrypted: bool,
    pub bound_to_cell: bool,
    pub known_by_access_manager: bool,
}

/// Seal the extras of one cell into their stored form, encrypting the ones
/// flagged for it with a key derived from the cell's data key.
pub(crate) fn seal_extras(
    data_key: &DataKey,
    column: &str,
    extras: &BTreeMap<String, PlainExtra>,
) -> Result<BTreeMap<String, MetadataXEntry>, EnvelopeError> {
    let mut sealed = BTreeMap::new();
    for (name, extra) in extras {
        let value = if extra.stored_encrypted {
            let key = MetadataEntryKey::derive(&data_key.ikm(), &[column.as_bytes(), name.as_bytes()])
                .map_err(|_| EnvelopeError::EncryptionFailure)?;
            let ciphertext = key
                .encrypt(extra.value.as_slice())
                .map_err(|_| EnvelopeError::EncryptionFailure)?;
            codec::to_vec(&ciphertext).map_err(|_| EnvelopeError::EncryptionFailure)?
        } else {
            extra.value.clone()
        };
        sealed.insert(
            name.clone(),
            MetadataXEntry {
                value,
                stored_encrypted: extra.stored_encrypted,
                bound_to_cell: extra.bound_to_cell,
                known_by_access_manager: extra.known_by_access_manager,
            },
        );
    }
    Ok(sealed)
}

/// Open the extras of a retrieved cell, decrypting the encrypted ones.
pub(crate) fn open_extras(
    data_key: &DataKey,
    metadata: &Metadata,
) -> Result<BTreeMap<String, Vec<u8>>, EnvelopeError> {
    let mut opened = BTreeMap::new();
    for (name, entry) in &metadata.extra {
        let value = if entry.stored_encrypted {
            let ciphertext: AeadCiphertext =
                codec::from_slice(&entry.value).map_err(|_| EnvelopeError::PayloadCorrupted)?;
            let key = MetadataEntryKey::derive(
                &data_key.ikm(),
                &[metadata.tag.as_bytes(), name.as_bytes()],
            )
            .map_err(|_| EnvelopeError::PayloadCorrupted)?;
            key.decrypt(&ciphertext)
                .map_err(|_| EnvelopeError::PayloadCorrupted)?
        } else {
            entry.value.clone()
        };
        opened.insert(name.clone(), value);
    }
    Ok(opened)
}

#[cfg(test)]
mod tests {
    use morphocommon::crypto::group::GroupElement;

    use super::*;

    fn setup() -> (DataKey, LocalPseudonym, [u8; 32]) {
        (
            DataKey::random(),
            LocalPseudonym::from_element(GroupElement::hash(b"sf-pseudonym")),
            [7u8; 32],
        )
    }

    #[test]
    fn small_payload_is_a_single_page() {
        let (key, lp, digest) = setup();
        let pages = encrypt_payload(&key, "Col", &lp, &digest, b"hello", 0).unwrap();
        assert_eq!(pages.len(), 1);
        let payload = decrypt_payload(&key, "Col", &lp, &digest, pages).unwrap();
        assert_eq!(payload, b"hello");
    }

    #[test]
    fn large_payload_is_chunked_and_reassembled() {
        let (key, lp, digest) = setup();
        let payload: Vec<u8> = (0..INLINE_PAGE_THRESHOLD * 2 + 17)
            .map(|i| (i % 251) as u8)
            .collect();
        let pages = encrypt_payload(&key, "Col", &lp, &digest, &payload, 0).unwrap();
        assert_eq!(pages.len(), 3);
        let decrypted = decrypt_payload(&key, "Col", &lp, &digest, pages).unwrap();
        assert_eq!(decrypted, payload);
    }

    #[test]
    fn empty_payload_roundtrips() {
        let (key, lp, digest) = setup();
        let pages = encrypt_payload(&key, "Col", &lp, &digest, b"", 0).unwrap();
        assert_eq!(pages.len(), 1);
        let payload = decrypt_payload(&key, "Col", &lp, &digest, pages).unwrap();
        assert!(payload.is_empty());
    }

    #[test]
    fn tampered_page_fails_decryption() {
        let (key, lp, digest) = setup();
        let mut pages = encrypt_payload(&key, "Col", &lp, &digest, b"hello", 0).unwrap();
        pages[0].payload_data[0] ^= 1;
        assert!(matches!(
            decrypt_payload(&key, "Col", &lp, &digest, pages),
            Err(EnvelopeError::PayloadCorrupted)
        ));
    }

    #[test]
    fn changed_bound_digest_fails_decryption() {
        let (key, lp, digest) = setup();
        let pages = encrypt_payload(&key, "Col", &lp, &digest, b"hello", 0).unwrap();
        let other_digest = [8u8; 32];
        assert!(matches!(
            decrypt_payload(&key, "Col", &lp, &other_digest, pages),
            Err(EnvelopeError::PayloadCorrupted)
        ));
    }

    #[test]
    fn missing_page_is_detected() {
        let (key, lp, digest) = setup();
        let payload = vec![1u8; INLINE_PAGE_THRESHOLD + 1];
        let mut pages = encrypt_payload(&key, "Col", &lp, &digest, &payload, 0).unwrap();
        pages.remove(0);
        assert!(matches!(
            decrypt_payload(&key, "Col", &lp, &digest, pages),
            Err(EnvelopeError::IncompletePages)
        ));
    }

    #[test]
    fn extras_seal_open_roundtrip() {
        let (key, _, _) = setup();
        let mut extras = BTreeMap::new();
        extras.insert(
            "fileExtension".to_owned(),
            PlainExtra {
                value: b".txt".to_vec(),
                stored_encrypted: true,
                bound_to_cell: false,
                known_by_access_manager: false,
            },
        );
        let sealed = seal_extras(&key, "Col", &extras).unwrap();
        assert_ne!(sealed["fileExtension"].value, b".txt");

        let mut metadata = Metadata::new("Col");
        metadata.extra = sealed;
        let opened = open_extras(&key, &metadata).unwrap();
        assert_eq!(opened["fileExtension"], b".txt");
    }
}
