//! The URL-store capability: persistence for in-progress uploads, so a
//! process that crashes or restarts can find its old upload URL by
//! fingerprint and resume instead of starting over.
//!
//! Generalizes `dropbox-sdk-rust`'s OAuth2 `TokenCache`: a small persisted
//! record behind a trait, with an in-memory default for anyone who hasn't
//! wired up real persistence yet.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::Error;

/// An opaque handle identifying one persisted record. Stores are free to use
/// whatever representation suits their backing storage; this driver only
/// ever treats it as an opaque string.
pub type UrlStoreKey = String;

/// One persisted in-progress upload. The fingerprint that led to this record
/// is tracked by the store itself (e.g. as an index key), not carried
/// redundantly inside the record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistedRecord {
    /// The resource URL, for a contiguous (non-parallel) upload.
    pub upload_url: Option<String>,
    /// The ordered part URLs, for a parallel upload. Mutually exclusive
    /// with `upload_url`.
    pub parallel_upload_urls: Option<Vec<String>>,
    pub creation_time: u64,
    pub size: Option<u64>,
}

/// Persistence for resumable upload URLs, keyed by the byte source's
/// fingerprint. Implement this against a database, a local file, or whatever
/// your application already uses to persist state across restarts.
pub trait UrlStore: Send + Sync {
    /// All currently persisted uploads, regardless of fingerprint. Used by
    /// callers that want to sweep for abandoned uploads across every
    /// fingerprint, not just one file's.
    fn find_all_uploads(&self) -> impl Future<Output = crate::error::Result<Vec<(UrlStoreKey, PersistedRecord)>>> + Send;

    /// Every upload previously persisted under this exact fingerprint, most
    /// recent first.
    fn find_uploads_by_fingerprint(
        &self,
        fingerprint: &str,
    ) -> impl Future<Output = crate::error::Result<Vec<(UrlStoreKey, PersistedRecord)>>> + Send;

    /// Remove a persisted record, e.g. after a successful upload when
    /// `removeFingerprintOnSuccess` is set.
    fn remove_upload(&self, key: &UrlStoreKey) -> impl Future<Output = crate::error::Result<()>> + Send;

    /// Persist a new record under the given fingerprint, returning the key
    /// it was stored under.
    fn add_upload(
        &self,
        fingerprint: &str,
        record: PersistedRecord,
    ) -> impl Future<Output = crate::error::Result<UrlStoreKey>> + Send;
}

/// An in-memory store. Uploads don't survive past process exit — useful for
/// short-lived programs, tests, and as a starting point before wiring up
/// real persistence.
#[derive(Default)]
pub struct MemoryUrlStore {
    records: Mutex<HashMap<UrlStoreKey, (String, PersistedRecord)>>,
    next_key: AtomicU64,
}

impl MemoryUrlStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl UrlStore for MemoryUrlStore {
    fn find_all_uploads(&self) -> impl Future<Output = crate::error::Result<Vec<(UrlStoreKey, PersistedRecord)>>> + Send {
        let records = self.records.lock().unwrap();
        let out = records.iter().map(|(k, (_, r))| (k.clone(), r.clone())).collect();
        std::future::ready(Ok(out))
    }

    fn find_uploads_by_fingerprint(
        &self,
        fingerprint: &str,
    ) -> impl Future<Output = crate::error::Result<Vec<(UrlStoreKey, PersistedRecord)>>> + Send {
        let records = self.records.lock().unwrap();
        let mut out: Vec<_> = records
            .iter()
            .filter(|(_, (fp, _))| fp == fingerprint)
            .map(|(k, (_, r))| (k.clone(), r.clone()))
            .collect();
        out.sort_by(|a, b| b.1.creation_time.cmp(&a.1.creation_time));
        std::future::ready(Ok(out))
    }

    fn remove_upload(&self, key: &UrlStoreKey) -> impl Future<Output = crate::error::Result<()>> + Send {
        self.records.lock().unwrap().remove(key);
        std::future::ready(Ok(()))
    }

    fn add_upload(
        &self,
        fingerprint: &str,
        record: PersistedRecord,
    ) -> impl Future<Output = crate::error::Result<UrlStoreKey>> + Send {
        let key = self.next_key.fetch_add(1, Ordering::SeqCst).to_string();
        self.records.lock().unwrap().insert(key.clone(), (fingerprint.to_owned(), record));
        std::future::ready(Ok(key))
    }
}

/// Wraps a backing-store failure (a file write, a database round trip) as
/// an [`Error::Storage`] for a [`UrlStore`] implementation to return from
/// [`find_all_uploads`](UrlStore::find_all_uploads),
/// [`find_uploads_by_fingerprint`](UrlStore::find_uploads_by_fingerprint),
/// [`remove_upload`](UrlStore::remove_upload), or
/// [`add_upload`](UrlStore::add_upload). Not used by [`MemoryUrlStore`],
/// which never fails.
pub fn storage_error(source: impl std::error::Error + Send + Sync + 'static) -> Error {
    Error::storage(source)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(url: &str, time: u64) -> PersistedRecord {
        PersistedRecord {
            upload_url: Some(url.to_owned()),
            parallel_upload_urls: None,
            creation_time: time,
            size: Some(1024),
        }
    }

    #[tokio::test]
    async fn add_then_find_by_fingerprint() {
        let store = MemoryUrlStore::new();
        let key = store.add_upload("fp-a", record("https://example.test/files/1", 10)).await.unwrap();
        assert!(!key.is_empty());

        let found = store.find_uploads_by_fingerprint("fp-a").await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].0, key);
    }

    #[tokio::test]
    async fn most_recent_upload_sorts_first() {
        let store = MemoryUrlStore::new();
        store.add_upload("fp-a", record("https://example.test/files/1", 10)).await.unwrap();
        store.add_upload("fp-a", record("https://example.test/files/2", 20)).await.unwrap();

        let found = store.find_uploads_by_fingerprint("fp-a").await.unwrap();
        assert_eq!(found[0].1.upload_url.as_deref(), Some("https://example.test/files/2"));
        assert_eq!(found[1].1.upload_url.as_deref(), Some("https://example.test/files/1"));
    }

    #[tokio::test]
    async fn remove_drops_the_record() {
        let store = MemoryUrlStore::new();
        let key = store.add_upload("fp-a", record("https://example.test/files/1", 10)).await.unwrap();
        store.remove_upload(&key).await.unwrap();
        assert!(store.find_uploads_by_fingerprint("fp-a").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn find_all_spans_fingerprints() {
        let store = MemoryUrlStore::new();
        store.add_upload("fp-a", record("https://example.test/files/1", 10)).await.unwrap();
        store.add_upload("fp-b", record("https://example.test/files/2", 10)).await.unwrap();
        assert_eq!(store.find_all_uploads().await.unwrap().len(), 2);
    }
}
