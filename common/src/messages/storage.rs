// SPDX-FileCopyrightText: 2025 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Messages of the Storage Facility, plus the cell metadata and page types
//! they carry.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    crypto::{
        ear::AEAD_NONCE_SIZE,
        elgamal::ElgamalCiphertext,
        hash::{HASH_SIZE, hash_parts},
    },
    ticketing::SignedTicket,
    time::TimeStamp,
};

/// Identifier of one stored cell head record.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(transparent)]
pub struct EntryId(String);

impl EntryId {
    pub fn random() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Content hash (ETag) of a stored object: the hash of its concatenated
/// ciphertext pages in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentHash([u8; 32]);

impl ContentHash {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.hex())
    }
}

/// Hasher for the content hash of stored pages. Feed the ciphertext pages
/// in order.
pub struct ContentHasher(blake3::Hasher);

impl ContentHasher {
    pub fn new() -> Self {
        Self(blake3::Hasher::new())
    }

    pub fn update(&mut self, page: &DataPayloadPage) {
        self.0.update(&page.payload_data);
    }

    pub fn finalize(self) -> ContentHash {
        ContentHash(*self.0.finalize().as_bytes())
    }
}

impl Default for ContentHasher {
    fn default() -> Self {
        Self::new()
    }
}

/// A named metadata extra of one cell.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataXEntry {
    /// The stored value. If `stored_encrypted` is set this is the encoded
    /// AEAD ciphertext, otherwise the plain bytes.
    #[serde(with = "serde_bytes")]
    pub value: Vec<u8>,
    pub stored_encrypted: bool,
    /// Mixed into the per-cell key derivation: tampering with the entry
    /// makes the payload undecryptable.
    pub bound_to_cell: bool,
    pub known_by_access_manager: bool,
}

/// The head-record metadata of one cell.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    /// Type tag of the cell; carries the column name.
    pub tag: String,
    pub blinding_timestamp: TimeStamp,
    /// For metadata-only updates: the entry whose payload this head record
    /// inherits.
    pub original_payload_entry_id: Option<EntryId>,
    pub extra: BTreeMap<String, MetadataXEntry>,
}

impl Metadata {
    pub fn new(tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            blinding_timestamp: TimeStamp::now(),
            original_payload_entry_id: None,
            extra: BTreeMap::new(),
        }
    }

    /// Digest over every extra whose `bound_to_cell` flag is set, in name
    /// order, over the stored (possibly encrypted) values. Part of the page
    /// key derivation context.
    pub fn bound_extras_digest(&self) -> [u8; HASH_SIZE] {
        let mut parts: Vec<&[u8]> = Vec::new();
        for (name, entry) in &self.extra {
            if entry.bound_to_cell {
                parts.push(name.as_bytes());
                parts.push(&entry.value);
            }
        }
        hash_parts("bound metadata extras", &parts)
    }
}

/// One AEAD-encrypted chunk of a cell's payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataPayloadPage {
    #[serde(with = "serde_bytes")]
    pub crypto_nonce: [u8; AEAD_NONCE_SIZE],
    #[serde(with = "serde_bytes")]
    pub crypto_mac: Vec<u8>,
    #[serde(with = "serde_bytes")]
    pub payload_data: Vec<u8>,
    /// Position of this page within its cell.
    pub page_number: u64,
    /// Position of the cell within the request that produced it.
    pub index: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataStoreEntry {
    pub metadata: Metadata,
    /// The cell's data key, blinded and still addressed to the master data
    /// key.
    pub polymorphic_key: ElgamalCiphertext,
    pub column_index: u32,
    pub pseudonym_index: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataStoreRequest {
    pub ticket: SignedTicket,
    pub entries: Vec<DataStoreEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataStoreResponse {
    pub ids: Vec<EntryId>,
    /// Hash over all stored ciphertext pages of this request, in order.
    pub hash: ContentHash,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataReadRequest {
    pub ticket: SignedTicket,
    pub ids: Vec<EntryId>,
}

/// Indices into the ticket's column/pseudonym vectors; `None` means all.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DataEnumerationRequest {
    pub ticket: SignedTicket,
    pub columns: Option<Vec<u32>>,
    pub pseudonyms: Option<Vec<u32>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataEnumerationEntry {
    pub metadata: Metadata,
    pub polymorphic_key: ElgamalCiphertext,
    pub file_size: u64,
    pub id: EntryId,
    pub column_index: u32,
    pub pseudonym_index: u32,
    /// Position of this entry within the response stream.
    pub index: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataHistoryRequest {
    pub ticket: SignedTicket,
    pub columns: Option<Vec<u32>>,
    pub pseudonyms: Option<Vec<u32>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataHistoryEntry {
    pub column_index: u32,
    pub pseudonym_index: u32,
    pub timestamp: TimeStamp,
    pub id: EntryId,
    pub tombstone: bool,
}

/// One cell addressed through ticket indices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataRequestEntry {
    pub column_index: u32,
    pub pseudonym_index: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataDeleteRequest {
    pub ticket: SignedTicket,
    pub entries: Vec<DataRequestEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataDeleteResponse {
    pub timestamp: TimeStamp,
    pub entries: Vec<DataRequestEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetadataReadRequest {
    pub ticket: SignedTicket,
    pub ids: Vec<EntryId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetadataReadResponse {
    pub entries: Vec<DataEnumerationEntry>,
}

/// Head-record-only write inheriting the payload of a prior entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetadataUpdateRequest {
    pub ticket: SignedTicket,
    pub entries: Vec<DataStoreEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetadataUpdateResponse {
    pub ids: Vec<EntryId>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn extra(value: &[u8], bound: bool) -> MetadataXEntry {
        MetadataXEntry {
            value: value.to_vec(),
            stored_encrypted: false,
            bound_to_cell: bound,
            known_by_access_manager: true,
        }
    }

    #[test]
    fn bound_digest_ignores_unbound_extras() {
        let mut metadata = Metadata::new("ParticipantInfo");
        metadata
            .extra
            .insert("fileExtension".to_owned(), extra(b".txt", true));
        let digest = metadata.bound_extras_digest();

        metadata
            .extra
            .insert("comment".to_owned(), extra(b"free-form", false));
        assert_eq!(metadata.bound_extras_digest(), digest);
    }

    #[test]
    fn bound_digest_detects_tampering() {
        let mut metadata = Metadata::new("ParticipantInfo");
        metadata
            .extra
            .insert("fileExtension".to_owned(), extra(b".txt", true));
        let digest = metadata.bound_extras_digest();

        metadata
            .extra
            .insert("fileExtension".to_owned(), extra(b".csv", true));
        assert_ne!(metadata.bound_extras_digest(), digest);
    }
}
