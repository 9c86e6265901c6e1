// SPDX-FileCopyrightText: 2025 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! The Storage Facility party. It persists cell head records in its own
//! append-only ledger and ciphertext pages in the page store, and serves the
//! data-plane operations: store, read, enumerate, history, delete and
//! metadata reads/updates. It never sees plaintext payloads.

pub mod page_store;

use std::sync::Arc;

use morphocommon::{
    codec::CodecBlob,
    crypto::{
        elgamal::ElgamalCiphertext,
        transcryption::StorageFacilitySecrets,
    },
    errors::CancelledError,
    identifiers::LocalPseudonym,
    messages::storage::{
        ContentHasher, DataDeleteRequest, DataDeleteResponse, DataEnumerationEntry,
        DataEnumerationRequest, DataHistoryEntry, DataHistoryRequest, DataPayloadPage,
        DataReadRequest, DataRequestEntry, DataStoreRequest, DataStoreResponse, EntryId, Metadata,
        MetadataReadRequest, MetadataReadResponse, MetadataUpdateRequest, MetadataUpdateResponse,
    },
    ticketing::{AccessMode, SignedTicket, Ticket, TicketError, TicketVerifyingKeys},
    time::{Duration, TimeStamp},
};
use sqlx::{Row, SqlitePool, sqlite::SqliteRow};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{error, instrument};

use crate::{
    errors::StorageError,
    transcryptor::{SignedIssuanceContext, TranscryptionError, open_issuance_context},
};

use page_store::{PageStore, PageStoreError, with_backoff};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS entries (
    seqno INTEGER PRIMARY KEY AUTOINCREMENT,
    id TEXT NOT NULL,
    timestamp INTEGER NOT NULL,
    tombstone INTEGER NOT NULL,
    column_name TEXT NOT NULL,
    local_pseudonym BLOB NOT NULL,
    metadata BLOB NOT NULL,
    polymorphic_key BLOB NOT NULL,
    file_size INTEGER NOT NULL
);
";

/// Metadata-only heads may chain through at most this many prior heads.
const MAX_PAYLOAD_INDIRECTIONS: usize = 32;

#[derive(Debug, Error)]
pub enum SfError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Ticket(#[from] TicketError),
    #[error(transparent)]
    Transcryption(#[from] TranscryptionError),
    #[error(transparent)]
    PageStore(#[from] PageStoreError),
    #[error("entry {0} not found")]
    NotFound(EntryId),
    /// The request is malformed beyond what the ticket can answer for.
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error(transparent)]
    Cancelled(#[from] CancelledError),
    /// Unrecoverable implementation error
    #[error("Library Error")]
    LibraryError,
}

impl From<sqlx::Error> for SfError {
    fn from(e: sqlx::Error) -> Self {
        Self::Storage(e.into())
    }
}

#[derive(Debug, Clone)]
struct HeadRow {
    id: EntryId,
    timestamp: TimeStamp,
    tombstone: bool,
    column: String,
    local_pseudonym: LocalPseudonym,
    metadata: Metadata,
    polymorphic_key: ElgamalCiphertext,
    file_size: i64,
}

fn head_from_row(row: &SqliteRow) -> Result<HeadRow, SfError> {
    Ok(HeadRow {
        id: row.try_get("id")?,
        timestamp: row.try_get("timestamp")?,
        tombstone: row.try_get("tombstone")?,
        column: row.try_get("column_name")?,
        local_pseudonym: row.try_get("local_pseudonym")?,
        metadata: row
            .try_get::<CodecBlob<Metadata>, _>("metadata")?
            .into_inner(),
        polymorphic_key: row
            .try_get::<CodecBlob<ElgamalCiphertext>, _>("polymorphic_key")?
            .into_inner(),
        file_size: row.try_get("file_size")?,
    })
}

pub struct StorageFacility {
    pool: SqlitePool,
    page_store: Arc<dyn PageStore>,
    secrets: StorageFacilitySecrets,
    roots: TicketVerifyingKeys,
    ticket_validity: Duration,
}

impl StorageFacility {
    pub async fn new(
        pool: SqlitePool,
        page_store: Arc<dyn PageStore>,
        secrets: StorageFacilitySecrets,
        roots: TicketVerifyingKeys,
        ticket_validity: Duration,
    ) -> Result<Self, SfError> {
        sqlx::raw_sql(SCHEMA).execute(&pool).await?;
        Ok(Self {
            pool,
            page_store,
            secrets,
            roots,
            ticket_validity,
        })
    }

    /// Decrypt local pseudonyms targeted at this party during an issuance
    /// signed by the Access Manager.
    pub fn register_pseudonyms(
        &self,
        context: &SignedIssuanceContext,
        ciphertexts: &[ElgamalCiphertext],
    ) -> Result<Vec<LocalPseudonym>, SfError> {
        open_issuance_context(context, &self.roots.access_manager)?;
        Ok(ciphertexts
            .iter()
            .map(|ciphertext| {
                LocalPseudonym::from_element(
                    ciphertext.decrypt(&self.secrets.pseudonym_decryption_key),
                )
            })
            .collect())
    }

    fn open<'t>(&self, ticket: &'t SignedTicket) -> Result<&'t Ticket, SfError> {
        Ok(ticket.open(&self.roots, self.ticket_validity)?)
    }

    fn require_mode(ticket: &Ticket, mode: AccessMode, subject: &str) -> Result<(), SfError> {
        if ticket.grants_mode(mode) {
            Ok(())
        } else {
            Err(TicketError::NotCovered {
                mode,
                subject: subject.to_owned(),
            }
            .into())
        }
    }

    /// Whether the ticket covers the cell `(local_pseudonym, column)`.
    fn cell_indices(ticket: &Ticket, head: &HeadRow) -> Result<(u32, u32), SfError> {
        let column_index = ticket
            .column_index(&head.column)
            .ok_or_else(|| TicketError::NotCovered {
                mode: AccessMode::Read,
                subject: head.column.clone(),
            })?;
        let pseudonym_index = ticket
            .pseudonyms
            .iter()
            .position(|entry| entry.storage_facility == head.local_pseudonym)
            .ok_or_else(|| TicketError::NotCovered {
                mode: AccessMode::Read,
                subject: head.column.clone(),
            })?;
        Ok((column_index as u32, pseudonym_index as u32))
    }

    // === Store ===

    #[instrument(level = "info", skip_all, fields(entries = request.entries.len(), pages = pages.len()))]
    pub async fn store(
        &self,
        request: &DataStoreRequest,
        pages: Vec<DataPayloadPage>,
    ) -> Result<DataStoreResponse, SfError> {
        let ticket = self.open(&request.ticket)?;

        let mut ids = Vec::with_capacity(request.entries.len());
        let mut hasher = ContentHasher::new();
        for page in &pages {
            hasher.update(page);
        }

        for (position, entry) in request.entries.iter().enumerate() {
            let column = ticket.column(entry.column_index as usize)?;
            Self::require_mode(ticket, AccessMode::Write, column)?;
            if entry.metadata.tag != column {
                return Err(SfError::InvalidRequest(format!(
                    "metadata tag {:?} does not match addressed column {column:?}",
                    entry.metadata.tag
                )));
            }
            let pseudonym = ticket.pseudonym(entry.pseudonym_index as usize)?;
            let local_pseudonym = pseudonym.storage_facility;

            let mut entry_pages: Vec<DataPayloadPage> = pages
                .iter()
                .filter(|page| page.index == position as u64)
                .cloned()
                .collect();
            entry_pages.sort_by_key(|page| page.page_number);
            if entry_pages.is_empty() {
                return Err(SfError::InvalidRequest(format!(
                    "no pages for entry {position}"
                )));
            }
            for (expected, page) in entry_pages.iter().enumerate() {
                if page.page_number != expected as u64 {
                    return Err(SfError::InvalidRequest(format!(
                        "pages for entry {position} are not contiguous"
                    )));
                }
            }
            let file_size: i64 = entry_pages
                .iter()
                .map(|page| page.payload_data.len() as i64)
                .sum();

            let id = EntryId::random();
            with_backoff(|| self.page_store.put(&id, entry_pages.clone())).await?;

            let previous = self.current_head(&local_pseudonym, column).await?;
            self.append_head(
                &id,
                column,
                &local_pseudonym,
                &entry.metadata,
                &entry.polymorphic_key,
                file_size,
                false,
            )
            .await?;
            if let Some(previous) = previous {
                self.append_tombstone(&previous).await?;
            }
            ids.push(id);
        }

        Ok(DataStoreResponse {
            ids,
            hash: hasher.finalize(),
        })
    }

    // === Read ===

    /// Stream the payload pages of the requested entries in order. The
    /// producer holds one page at a time; the consumer drives backpressure
    /// by awaiting each page. Cancelling the token unwinds the stream with
    /// `Cancelled`.
    #[instrument(level = "info", skip_all, fields(ids = request.ids.len()))]
    pub async fn read(
        &self,
        request: &DataReadRequest,
        cancel: CancellationToken,
    ) -> Result<ReceiverStream<Result<DataPayloadPage, SfError>>, SfError> {
        let ticket = self.open(&request.ticket)?;

        // Resolve every requested id to the id actually carrying its payload
        // before streaming anything.
        let mut payload_ids = Vec::with_capacity(request.ids.len());
        for id in &request.ids {
            let head = self
                .head_by_id(id)
                .await?
                .ok_or_else(|| SfError::NotFound(id.clone()))?;
            Self::require_mode(ticket, AccessMode::Read, &head.column)?;
            Self::cell_indices(ticket, &head)?;
            payload_ids.push(self.resolve_payload_id(head).await?);
        }

        let (sender, receiver) = mpsc::channel(1);
        let page_store = Arc::clone(&self.page_store);
        tokio::spawn(async move {
            for (position, payload_id) in payload_ids.into_iter().enumerate() {
                let pages = match with_backoff(|| page_store.get(&payload_id)).await {
                    Ok(pages) => pages,
                    Err(error) => {
                        let _ = sender.send(Err(error.into())).await;
                        return;
                    }
                };
                for mut page in pages {
                    if cancel.is_cancelled() {
                        let _ = sender.send(Err(CancelledError.into())).await;
                        return;
                    }
                    page.index = position as u64;
                    if sender.send(Ok(page)).await.is_err() {
                        // Consumer went away.
                        return;
                    }
                }
            }
        });
        Ok(ReceiverStream::new(receiver))
    }

    async fn resolve_payload_id(&self, mut head: HeadRow) -> Result<EntryId, SfError> {
        let mut indirections = 0;
        while let Some(original) = head.metadata.original_payload_entry_id.clone() {
            indirections += 1;
            if indirections > MAX_PAYLOAD_INDIRECTIONS {
                error!(id = %head.id, "payload indirection chain too deep");
                return Err(SfError::LibraryError);
            }
            head = self
                .head_by_id(&original)
                .await?
                .ok_or_else(|| SfError::NotFound(original.clone()))?;
        }
        Ok(head.id)
    }

    // === Enumeration and history ===

    #[instrument(level = "debug", skip_all)]
    pub async fn enumerate(
        &self,
        request: &DataEnumerationRequest,
    ) -> Result<Vec<DataEnumerationEntry>, SfError> {
        let ticket = self.open(&request.ticket)?;
        Self::require_mode(ticket, AccessMode::ReadMeta, "enumeration")?;

        let (columns, pseudonyms) =
            Self::selected_indices(ticket, &request.columns, &request.pseudonyms)?;

        let mut entries = Vec::new();
        let mut index = 0u64;
        for &pseudonym_index in &pseudonyms {
            let local_pseudonym = ticket.pseudonym(pseudonym_index as usize)?.storage_facility;
            for &column_index in &columns {
                let column = ticket.column(column_index as usize)?;
                if let Some(head) = self.current_head(&local_pseudonym, column).await? {
                    entries.push(DataEnumerationEntry {
                        metadata: head.metadata,
                        polymorphic_key: head.polymorphic_key,
                        file_size: head.file_size as u64,
                        id: head.id,
                        column_index,
                        pseudonym_index,
                        index,
                    });
                    index += 1;
                }
            }
        }
        Ok(entries)
    }

    #[instrument(level = "debug", skip_all)]
    pub async fn history(
        &self,
        request: &DataHistoryRequest,
    ) -> Result<Vec<DataHistoryEntry>, SfError> {
        let ticket = self.open(&request.ticket)?;
        Self::require_mode(ticket, AccessMode::ReadMeta, "history")?;

        let (columns, pseudonyms) =
            Self::selected_indices(ticket, &request.columns, &request.pseudonyms)?;

        let mut entries = Vec::new();
        for &pseudonym_index in &pseudonyms {
            let local_pseudonym = ticket.pseudonym(pseudonym_index as usize)?.storage_facility;
            for &column_index in &columns {
                let column = ticket.column(column_index as usize)?;
                let rows = sqlx::query(
                    "SELECT * FROM entries
                     WHERE local_pseudonym = ?1 AND column_name = ?2 ORDER BY seqno",
                )
                .bind(local_pseudonym)
                .bind(column)
                .fetch_all(&self.pool)
                .await?;
                for row in &rows {
                    let head = head_from_row(row)?;
                    entries.push(DataHistoryEntry {
                        column_index,
                        pseudonym_index,
                        timestamp: head.timestamp,
                        id: head.id,
                        tombstone: head.tombstone,
                    });
                }
            }
        }
        Ok(entries)
    }

    fn selected_indices(
        ticket: &Ticket,
        columns: &Option<Vec<u32>>,
        pseudonyms: &Option<Vec<u32>>,
    ) -> Result<(Vec<u32>, Vec<u32>), SfError> {
        let columns = match columns {
            Some(indices) => {
                for &index in indices {
                    ticket.column(index as usize)?;
                }
                indices.clone()
            }
            None => (0..ticket.columns.len() as u32).collect(),
        };
        let pseudonyms = match pseudonyms {
            Some(indices) => {
                for &index in indices {
                    ticket.pseudonym(index as usize)?;
                }
                indices.clone()
            }
            None => (0..ticket.pseudonyms.len() as u32).collect(),
        };
        Ok((columns, pseudonyms))
    }

    // === Delete ===

    #[instrument(level = "info", skip_all, fields(entries = request.entries.len()))]
    pub async fn delete(&self, request: &DataDeleteRequest) -> Result<DataDeleteResponse, SfError> {
        let ticket = self.open(&request.ticket)?;
        let timestamp = TimeStamp::now();

        let mut deleted = Vec::new();
        for entry in &request.entries {
            let column = ticket.column(entry.column_index as usize)?;
            Self::require_mode(ticket, AccessMode::Write, column)?;
            let local_pseudonym = ticket.pseudonym(entry.pseudonym_index as usize)?.storage_facility;
            if let Some(head) = self.current_head(&local_pseudonym, column).await? {
                self.append_tombstone(&head).await?;
                deleted.push(DataRequestEntry {
                    column_index: entry.column_index,
                    pseudonym_index: entry.pseudonym_index,
                });
            }
        }
        Ok(DataDeleteResponse {
            timestamp,
            entries: deleted,
        })
    }

    // === Metadata ===

    #[instrument(level = "debug", skip_all, fields(ids = request.ids.len()))]
    pub async fn metadata_read(
        &self,
        request: &MetadataReadRequest,
    ) -> Result<MetadataReadResponse, SfError> {
        let ticket = self.open(&request.ticket)?;

        let mut entries = Vec::new();
        for (index, id) in request.ids.iter().enumerate() {
            let head = self
                .head_by_id(id)
                .await?
                .ok_or_else(|| SfError::NotFound(id.clone()))?;
            Self::require_mode(ticket, AccessMode::ReadMeta, &head.column)?;
            let (column_index, pseudonym_index) = Self::cell_indices(ticket, &head)?;
            entries.push(DataEnumerationEntry {
                metadata: head.metadata,
                polymorphic_key: head.polymorphic_key,
                file_size: head.file_size as u64,
                id: head.id,
                column_index,
                pseudonym_index,
                index: index as u64,
            });
        }
        Ok(MetadataReadResponse { entries })
    }

    /// Write metadata-only head records that inherit their payload from a
    /// prior head via `original_payload_entry_id`.
    #[instrument(level = "info", skip_all, fields(entries = request.entries.len()))]
    pub async fn metadata_update(
        &self,
        request: &MetadataUpdateRequest,
    ) -> Result<MetadataUpdateResponse, SfError> {
        let ticket = self.open(&request.ticket)?;

        let mut ids = Vec::with_capacity(request.entries.len());
        for entry in &request.entries {
            let column = ticket.column(entry.column_index as usize)?;
            Self::require_mode(ticket, AccessMode::WriteMeta, column)?;
            let local_pseudonym = ticket.pseudonym(entry.pseudonym_index as usize)?.storage_facility;

            let Some(original_id) = &entry.metadata.original_payload_entry_id else {
                return Err(SfError::InvalidRequest(
                    "metadata update without original payload entry id".to_owned(),
                ));
            };
            let original = self
                .head_by_id(original_id)
                .await?
                .ok_or_else(|| SfError::NotFound(original_id.clone()))?;
            if original.tombstone {
                return Err(SfError::InvalidRequest(format!(
                    "original entry {original_id} is no longer current"
                )));
            }
            if original.column != column || original.local_pseudonym != local_pseudonym {
                return Err(SfError::InvalidRequest(format!(
                    "original entry {original_id} belongs to a different cell"
                )));
            }
            // Bound extras are part of the page key derivation; a
            // metadata-only update cannot change them without making the
            // inherited payload undecryptable.
            if entry.metadata.bound_extras_digest() != original.metadata.bound_extras_digest() {
                return Err(SfError::InvalidRequest(
                    "metadata update changes extras bound to the cell".to_owned(),
                ));
            }

            let id = EntryId::random();
            self.append_head(
                &id,
                column,
                &local_pseudonym,
                &entry.metadata,
                &entry.polymorphic_key,
                original.file_size,
                false,
            )
            .await?;
            self.append_tombstone(&original).await?;
            ids.push(id);
        }
        Ok(MetadataUpdateResponse { ids })
    }

    // === Head-record persistence ===

    /// The current head of a cell: among the heads of `(local_pseudonym,
    /// column)` whose newest row is not a tombstone, the newest one.
    async fn current_head(
        &self,
        local_pseudonym: &LocalPseudonym,
        column: &str,
    ) -> Result<Option<HeadRow>, SfError> {
        let row = sqlx::query(
            "SELECT * FROM entries e
             WHERE local_pseudonym = ?1 AND column_name = ?2 AND tombstone = 0
               AND NOT EXISTS (SELECT 1 FROM entries e2
                               WHERE e2.id = e.id AND e2.seqno > e.seqno)
             ORDER BY seqno DESC LIMIT 1",
        )
        .bind(local_pseudonym)
        .bind(column)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(head_from_row).transpose()
    }

    /// The newest row of the head with the given id, tombstoned or not.
    async fn head_by_id(&self, id: &EntryId) -> Result<Option<HeadRow>, SfError> {
        let row = sqlx::query(
            "SELECT * FROM entries WHERE id = ?1 ORDER BY seqno DESC LIMIT 1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(head_from_row).transpose()
    }

    #[allow(clippy::too_many_arguments)]
    async fn append_head(
        &self,
        id: &EntryId,
        column: &str,
        local_pseudonym: &LocalPseudonym,
        metadata: &Metadata,
        polymorphic_key: &ElgamalCiphertext,
        file_size: i64,
        tombstone: bool,
    ) -> Result<(), SfError> {
        sqlx::query(
            "INSERT INTO entries
             (id, timestamp, tombstone, column_name, local_pseudonym, metadata, polymorphic_key, file_size)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        )
        .bind(id)
        .bind(TimeStamp::now())
        .bind(tombstone)
        .bind(column)
        .bind(local_pseudonym)
        .bind(CodecBlob(metadata))
        .bind(CodecBlob(polymorphic_key))
        .bind(file_size)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn append_tombstone(&self, head: &HeadRow) -> Result<(), SfError> {
        self.append_head(
            &head.id,
            &head.column,
            &head.local_pseudonym,
            &head.metadata,
            &head.polymorphic_key,
            head.file_size,
            true,
        )
        .await
    }
}
