// SPDX-FileCopyrightText: 2025 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! The client: an enrolled user driving the protocol against the party
//! constellation. All payload encryption happens here; the parties only
//! ever handle ciphertext and pseudonyms.

use std::collections::BTreeMap;
use std::sync::Arc;

use morphobackend::{
    access_manager::{AccessManager, AmError},
    key_server::{EnrollmentError, KeyServer},
    storage_facility::{SfError, StorageFacility},
};
use morphocommon::{
    crypto::{
        elgamal::ElgamalPublicKey,
        transcryption::{DataKey, EnrollmentKeys},
    },
    identifiers::{LocalPseudonym, ParticipantIdentifier, PolymorphicPseudonym, UserIdentity},
    messages::{
        access_manager::{
            BlindMode, ColumnAccessRequest, ColumnAccessResponse, EncryptionKeyRequest,
            KeyRequestEntry, ParticipantGroupAccessRequest, ParticipantGroupAccessResponse,
        },
        auth::AsaToken,
        storage::{
            ContentHasher, DataDeleteRequest, DataDeleteResponse, DataEnumerationEntry,
            DataEnumerationRequest, DataHistoryEntry, DataHistoryRequest, DataPayloadPage,
            DataReadRequest, DataRequestEntry, DataStoreEntry, DataStoreRequest, EntryId,
            Metadata, MetadataUpdateRequest,
        },
    },
    ticketing::{IndexedTicket, SignedTicket, Ticket, TicketError, TicketRequest,
        TicketVerifyingKeys, default_ticket_validity},
};
use thiserror::Error;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use crate::envelope::{self, EnvelopeError};

pub use crate::envelope::PlainExtra;

/// The public key material a client needs to participate: the master keys
/// for pseudonym and data-key encryption plus the ticket roots.
#[derive(Debug, Clone)]
pub struct SystemPublicInfo {
    pub master_pseudonym_key: ElgamalPublicKey,
    pub master_data_key: ElgamalPublicKey,
    pub roots: TicketVerifyingKeys,
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    AccessManager(#[from] AmError),
    #[error(transparent)]
    StorageFacility(#[from] SfError),
    #[error(transparent)]
    Enrollment(#[from] EnrollmentError),
    #[error(transparent)]
    Ticket(#[from] TicketError),
    #[error(transparent)]
    Envelope(#[from] EnvelopeError),
    /// The hash returned by the storage layer did not match what we
    /// uploaded.
    #[error("stored object hash mismatch")]
    PersistenceIntegrityFailure,
    /// The response is missing data the request asked for.
    #[error("malformed response: {0}")]
    MalformedResponse(String),
}

/// One cell to be written, addressed through ticket indices.
#[derive(Debug, Clone)]
pub struct CellWrite {
    pub column_index: u32,
    pub pseudonym_index: u32,
    pub payload: Vec<u8>,
    pub extras: BTreeMap<String, PlainExtra>,
}

/// A fully decrypted cell.
#[derive(Debug)]
pub struct RetrievedCell {
    pub payload: Vec<u8>,
    pub extras: BTreeMap<String, Vec<u8>>,
    pub metadata: Metadata,
}

pub struct Client {
    identity: UserIdentity,
    public: SystemPublicInfo,
    enrollment: EnrollmentKeys,
    access_manager: Arc<AccessManager>,
    storage_facility: Arc<StorageFacility>,
}

impl Client {
    /// Enroll with a token obtained from the authentication service. The
    /// Key Server hands out the enrollment keys of the token's user group.
    pub async fn enroll(
        identity: UserIdentity,
        token: &AsaToken,
        public: SystemPublicInfo,
        key_server: &KeyServer,
        access_manager: Arc<AccessManager>,
        storage_facility: Arc<StorageFacility>,
    ) -> Result<Self, ClientError> {
        let enrollment = key_server.enroll(token).await?;
        Ok(Self {
            identity,
            public,
            enrollment,
            access_manager,
            storage_facility,
        })
    }

    pub fn identity(&self) -> &UserIdentity {
        &self.identity
    }

    /// A fresh polymorphic pseudonym for a participant identifier. Each
    /// call produces a different (rerandomised) encryption of the same
    /// identifier.
    pub fn polymorphic_pseudonym(&self, identifier: &ParticipantIdentifier) -> PolymorphicPseudonym {
        identifier.polymorphic(&self.public.master_pseudonym_key)
    }

    /// Decrypt the access-group pseudonym of one ticket entry with the
    /// enrolled pseudonym key.
    pub fn access_group_pseudonym(
        &self,
        ticket: &Ticket,
        pseudonym_index: usize,
    ) -> Result<LocalPseudonym, ClientError> {
        let entry = ticket.pseudonym(pseudonym_index)?;
        let encrypted = entry.access_group.as_ref().ok_or_else(|| {
            ClientError::MalformedResponse("ticket carries no access group pseudonyms".to_owned())
        })?;
        Ok(encrypted.decrypt(&self.enrollment.pseudonym_key))
    }

    pub async fn request_ticket(
        &self,
        request: &TicketRequest,
    ) -> Result<IndexedTicket, ClientError> {
        let indexed = self
            .access_manager
            .request_ticket(&self.identity, request)
            .await?;
        // Never act on a ticket we could not validate ourselves.
        indexed
            .ticket
            .open(&self.public.roots, default_ticket_validity())?;
        Ok(indexed)
    }

    pub async fn column_access(
        &self,
        request: &ColumnAccessRequest,
    ) -> Result<ColumnAccessResponse, ClientError> {
        Ok(self
            .access_manager
            .column_access(&self.identity, request)
            .await?)
    }

    pub async fn participant_group_access(
        &self,
        request: &ParticipantGroupAccessRequest,
    ) -> Result<ParticipantGroupAccessResponse, ClientError> {
        Ok(self
            .access_manager
            .participant_group_access(&self.identity, request)
            .await?)
    }

    // === Data plane ===

    /// Store cells under a write ticket. Returns the new entry ids after
    /// verifying the storage layer's content hash against our own.
    #[instrument(level = "info", skip_all, fields(cells = cells.len()))]
    pub async fn store_data(
        &self,
        ticket: &SignedTicket,
        cells: &[CellWrite],
    ) -> Result<Vec<EntryId>, ClientError> {
        let opened = ticket.open(&self.public.roots, default_ticket_validity())?;

        let mut entries = Vec::with_capacity(cells.len());
        let mut pages = Vec::new();
        let mut hasher = ContentHasher::new();
        for (position, cell) in cells.iter().enumerate() {
            let column = opened.column(cell.column_index as usize)?.to_owned();
            let pseudonym = opened.pseudonym(cell.pseudonym_index as usize)?;

            let data_key = DataKey::random();
            let mut metadata = Metadata::new(column.clone());
            metadata.extra = envelope::seal_extras(&data_key, &column, &cell.extras)?;

            let cell_pages = envelope::encrypt_payload(
                &data_key,
                &column,
                &pseudonym.storage_facility,
                &metadata.bound_extras_digest(),
                &cell.payload,
                position as u64,
            )?;
            for page in &cell_pages {
                hasher.update(page);
            }
            pages.extend(cell_pages);

            // Bind the fresh data key to the cell before it is stored.
            let blinded = self
                .transcrypt_key(
                    ticket,
                    &metadata,
                    &data_key.encrypt(&self.public.master_data_key),
                    BlindMode::Blind,
                    cell.pseudonym_index,
                )
                .await?;

            entries.push(DataStoreEntry {
                metadata,
                polymorphic_key: blinded,
                column_index: cell.column_index,
                pseudonym_index: cell.pseudonym_index,
            });
        }

        let response = self
            .storage_facility
            .store(
                &DataStoreRequest {
                    ticket: ticket.clone(),
                    entries,
                },
                pages,
            )
            .await?;
        if response.hash != hasher.finalize() {
            return Err(ClientError::PersistenceIntegrityFailure);
        }
        Ok(response.ids)
    }

    /// List the current cells covered by the ticket.
    pub async fn enumerate_data(
        &self,
        ticket: &SignedTicket,
        columns: Option<Vec<u32>>,
        pseudonyms: Option<Vec<u32>>,
    ) -> Result<Vec<DataEnumerationEntry>, ClientError> {
        Ok(self
            .storage_facility
            .enumerate(&DataEnumerationRequest {
                ticket: ticket.clone(),
                columns,
                pseudonyms,
            })
            .await?)
    }

    pub async fn data_history(
        &self,
        ticket: &SignedTicket,
        columns: Option<Vec<u32>>,
        pseudonyms: Option<Vec<u32>>,
    ) -> Result<Vec<DataHistoryEntry>, ClientError> {
        Ok(self
            .storage_facility
            .history(&DataHistoryRequest {
                ticket: ticket.clone(),
                columns,
                pseudonyms,
            })
            .await?)
    }

    /// Retrieve and decrypt one enumerated cell.
    #[instrument(level = "info", skip_all, fields(id = %entry.id))]
    pub async fn retrieve_data(
        &self,
        ticket: &SignedTicket,
        entry: &DataEnumerationEntry,
    ) -> Result<RetrievedCell, ClientError> {
        let opened = ticket.open(&self.public.roots, default_ticket_validity())?;
        let column = opened.column(entry.column_index as usize)?.to_owned();
        let pseudonym = opened.pseudonym(entry.pseudonym_index as usize)?;

        // Release the cell's data key toward our enrolled key.
        let unblinded = self
            .transcrypt_key(
                ticket,
                &entry.metadata,
                &entry.polymorphic_key,
                BlindMode::Unblind,
                entry.pseudonym_index,
            )
            .await?;
        let data_key = DataKey::from_element(unblinded.decrypt(&self.enrollment.data_key));

        let pages = self.read_pages(ticket, &entry.id).await?;
        debug!(pages = pages.len(), "payload pages received");
        let payload = envelope::decrypt_payload(
            &data_key,
            &column,
            &pseudonym.storage_facility,
            &entry.metadata.bound_extras_digest(),
            pages,
        )?;
        let extras = envelope::open_extras(&data_key, &entry.metadata)?;
        Ok(RetrievedCell {
            payload,
            extras,
            metadata: entry.metadata.clone(),
        })
    }

    async fn read_pages(
        &self,
        ticket: &SignedTicket,
        id: &EntryId,
    ) -> Result<Vec<DataPayloadPage>, ClientError> {
        let mut stream = self
            .storage_facility
            .read(
                &DataReadRequest {
                    ticket: ticket.clone(),
                    ids: vec![id.clone()],
                },
                CancellationToken::new(),
            )
            .await?;
        let mut pages = Vec::new();
        while let Some(page) = stream.next().await {
            pages.push(page?);
        }
        Ok(pages)
    }

    /// Replace a cell's metadata without re-uploading its payload. The new
    /// head record inherits the payload of `entry` via its id.
    #[instrument(level = "info", skip_all, fields(id = %entry.id))]
    pub async fn update_metadata(
        &self,
        ticket: &SignedTicket,
        entry: &DataEnumerationEntry,
        extras: &BTreeMap<String, PlainExtra>,
    ) -> Result<EntryId, ClientError> {
        let opened = ticket.open(&self.public.roots, default_ticket_validity())?;
        let column = opened.column(entry.column_index as usize)?.to_owned();

        // Re-derive the data key so the new extras can be sealed under it.
        let unblinded = self
            .transcrypt_key(
                ticket,
                &entry.metadata,
                &entry.polymorphic_key,
                BlindMode::Unblind,
                entry.pseudonym_index,
            )
            .await?;
        let data_key = DataKey::from_element(unblinded.decrypt(&self.enrollment.data_key));

        let mut metadata = entry.metadata.clone();
        metadata.original_payload_entry_id = Some(entry.id.clone());
        metadata.extra = envelope::seal_extras(&data_key, &column, extras)?;

        let response = self
            .storage_facility
            .metadata_update(&MetadataUpdateRequest {
                ticket: ticket.clone(),
                entries: vec![DataStoreEntry {
                    metadata,
                    polymorphic_key: entry.polymorphic_key,
                    column_index: entry.column_index,
                    pseudonym_index: entry.pseudonym_index,
                }],
            })
            .await?;
        response
            .ids
            .into_iter()
            .next()
            .ok_or_else(|| ClientError::MalformedResponse("no id for metadata update".to_owned()))
    }

    pub async fn delete_data(
        &self,
        ticket: &SignedTicket,
        entries: Vec<DataRequestEntry>,
    ) -> Result<DataDeleteResponse, ClientError> {
        Ok(self
            .storage_facility
            .delete(&DataDeleteRequest {
                ticket: ticket.clone(),
                entries,
            })
            .await?)
    }

    async fn transcrypt_key(
        &self,
        ticket: &SignedTicket,
        metadata: &Metadata,
        key: &morphocommon::crypto::elgamal::ElgamalCiphertext,
        blind_mode: BlindMode,
        pseudonym_index: u32,
    ) -> Result<morphocommon::crypto::elgamal::ElgamalCiphertext, ClientError> {
        let response = self
            .access_manager
            .handle_encryption_key_request(&EncryptionKeyRequest {
                ticket: ticket.clone(),
                entries: vec![KeyRequestEntry {
                    metadata: metadata.clone(),
                    polymorph_encryption_key: *key,
                    blind_mode,
                    pseudonym_index,
                }],
            })
            .await?;
        response
            .keys
            .into_iter()
            .next()
            .ok_or_else(|| ClientError::MalformedResponse("no transcrypted key".to_owned()))
    }
}
