// SPDX-FileCopyrightText: 2025 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! The page store: content-addressed persistence of ciphertext pages. The
//! trait abstracts over the actual backing store; the in-memory
//! implementation backs the tests and small deployments.

use std::collections::HashMap;

use async_trait::async_trait;
use morphocommon::{
    messages::storage::{ContentHash, ContentHasher, DataPayloadPage, EntryId},
    time::Duration,
};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::warn;

#[derive(Debug, displaydoc::Display, Error)]
pub enum PageStoreError {
    /// no pages stored under this id
    NotFound,
    /// throttled, retry after {retry_after}
    Throttled { retry_after: Duration },
    /// page store failure: {0}
    Backend(String),
}

impl PageStoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, PageStoreError::Throttled { .. })
    }
}

/// A store for the ciphertext pages of one cell head. Pages are immutable
/// once written; `put` returns the content hash (ETag) over the concatenated
/// ciphertext pages, which the caller must verify.
#[async_trait]
pub trait PageStore: Send + Sync {
    async fn put(
        &self,
        id: &EntryId,
        pages: Vec<DataPayloadPage>,
    ) -> Result<ContentHash, PageStoreError>;

    async fn get(&self, id: &EntryId) -> Result<Vec<DataPayloadPage>, PageStoreError>;
}

/// Retry a page-store operation on transient failures with capped
/// exponential backoff. Non-transient errors surface immediately.
pub(super) async fn with_backoff<T, F, Fut>(mut operation: F) -> Result<T, PageStoreError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, PageStoreError>>,
{
    const MAX_ATTEMPTS: u32 = 4;
    const BACKOFF_CAP_MS: i64 = 2_000;

    let mut attempt = 0;
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(error) if error.is_transient() && attempt + 1 < MAX_ATTEMPTS => {
                let suggested = match &error {
                    PageStoreError::Throttled { retry_after } => retry_after.num_milliseconds(),
                    _ => 0,
                };
                let backoff = suggested.max(50i64 << attempt).min(BACKOFF_CAP_MS);
                warn!(attempt, backoff_ms = backoff, "page store throttled, backing off");
                tokio::time::sleep(std::time::Duration::from_millis(backoff as u64)).await;
                attempt += 1;
            }
            Err(error) => return Err(error),
        }
    }
}

/// In-memory page store.
#[derive(Default)]
pub struct MemoryPageStore {
    objects: RwLock<HashMap<EntryId, (Vec<DataPayloadPage>, ContentHash)>>,
}

impl MemoryPageStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PageStore for MemoryPageStore {
    async fn put(
        &self,
        id: &EntryId,
        pages: Vec<DataPayloadPage>,
    ) -> Result<ContentHash, PageStoreError> {
        let mut hasher = ContentHasher::new();
        for page in &pages {
            hasher.update(page);
        }
        let hash = hasher.finalize();
        self.objects
            .write()
            .await
            .insert(id.clone(), (pages, hash));
        Ok(hash)
    }

    async fn get(&self, id: &EntryId) -> Result<Vec<DataPayloadPage>, PageStoreError> {
        self.objects
            .read()
            .await
            .get(id)
            .map(|(pages, _)| pages.clone())
            .ok_or(PageStoreError::NotFound)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    fn page(data: &[u8], page_number: u64) -> DataPayloadPage {
        DataPayloadPage {
            crypto_nonce: [0; 12],
            crypto_mac: vec![0; 16],
            payload_data: data.to_vec(),
            page_number,
            index: 0,
        }
    }

    #[tokio::test]
    async fn put_get_roundtrip_with_matching_etag() {
        let store = MemoryPageStore::new();
        let id = EntryId::random();
        let pages = vec![page(b"first", 0), page(b"second", 1)];

        let etag = store.put(&id, pages.clone()).await.unwrap();

        let mut hasher = ContentHasher::new();
        for p in &pages {
            hasher.update(p);
        }
        assert_eq!(etag, hasher.finalize());
        assert_eq!(store.get(&id).await.unwrap(), pages);
    }

    #[tokio::test]
    async fn missing_object_is_not_found() {
        let store = MemoryPageStore::new();
        assert!(matches!(
            store.get(&EntryId::random()).await,
            Err(PageStoreError::NotFound)
        ));
    }

    #[tokio::test]
    async fn backoff_retries_transient_failures() {
        let attempts = AtomicU32::new(0);
        let result: Result<u32, _> = with_backoff(|| {
            let n = attempts.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(PageStoreError::Throttled {
                        retry_after: Duration::milliseconds(10),
                    })
                } else {
                    Ok(n)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 2);
    }

    #[tokio::test]
    async fn backoff_gives_up_eventually() {
        let result: Result<(), _> = with_backoff(|| async {
            Err(PageStoreError::Throttled {
                retry_after: Duration::milliseconds(1),
            })
        })
        .await;
        assert!(matches!(result, Err(PageStoreError::Throttled { .. })));
    }

    #[tokio::test]
    async fn backoff_does_not_retry_permanent_failures() {
        let attempts = AtomicU32::new(0);
        let result: Result<(), _> = with_backoff(|| {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Err(PageStoreError::NotFound) }
        })
        .await;
        assert!(matches!(result, Err(PageStoreError::NotFound)));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }
}
