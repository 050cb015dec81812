//! In-memory blob store for tests and local runs

use super::{BlobStore, StorageError, StoredObject};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

#[derive(Default)]
pub struct InMemoryBlobStore {
    objects: Mutex<HashMap<String, StoredObject>>,
    /// Keys in the order they were written by `put`
    put_log: Mutex<Vec<String>>,
    get_calls: AtomicUsize,
    put_calls: AtomicUsize,
    fail_gets: AtomicBool,
    fail_signing: AtomicBool,
    /// 1-based index of the `put` call that fails, if any
    fail_put_at: Mutex<Option<usize>>,
}

impl InMemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed an object without counting it as a `put`
    pub fn insert(&self, key: &str, content_type: &str, body: impl Into<Bytes>) {
        let body = body.into();
        self.objects.lock().insert(
            key.to_string(),
            StoredObject {
                content_type: content_type.to_string(),
                size_bytes: body.len() as u64,
                body,
            },
        );
    }

    /// Make every `get` fail as if the store were unreachable
    pub fn fail_gets(&self, fail: bool) {
        self.fail_gets.store(fail, Ordering::SeqCst);
    }

    /// Make every `signed_url` fail to presign
    pub fn fail_signing(&self, fail: bool) {
        self.fail_signing.store(fail, Ordering::SeqCst);
    }

    /// Make the n-th `put` (1-based, counted from now on) fail
    pub fn fail_put_at(&self, nth: Option<usize>) {
        let base = self.put_calls.load(Ordering::SeqCst);
        *self.fail_put_at.lock() = nth.map(|n| base + n);
    }

    pub fn object(&self, key: &str) -> Option<StoredObject> {
        self.objects.lock().get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.objects.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Keys written by successful `put` calls, in order
    pub fn stored_keys(&self) -> Vec<String> {
        self.put_log.lock().clone()
    }

    pub fn get_calls(&self) -> usize {
        self.get_calls.load(Ordering::SeqCst)
    }

    pub fn put_calls(&self) -> usize {
        self.put_calls.load(Ordering::SeqCst)
    }

    /// Total calls of any kind
    pub fn calls(&self) -> usize {
        self.get_calls() + self.put_calls()
    }
}

#[async_trait]
impl BlobStore for InMemoryBlobStore {
    async fn get(&self, key: &str) -> Result<StoredObject, StorageError> {
        self.get_calls.fetch_add(1, Ordering::SeqCst);

        if self.fail_gets.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable("injected get failure".to_string()));
        }

        self.objects
            .lock()
            .get(key)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(key.to_string()))
    }

    async fn put(&self, key: &str, content_type: &str, body: Bytes) -> Result<String, StorageError> {
        let call = self.put_calls.fetch_add(1, Ordering::SeqCst) + 1;

        if *self.fail_put_at.lock() == Some(call) {
            return Err(StorageError::Unavailable(format!(
                "injected failure on put #{call}"
            )));
        }

        self.insert(key, content_type, body);
        self.put_log.lock().push(key.to_string());
        Ok(key.to_string())
    }

    async fn signed_url(&self, key: &str, ttl: Duration) -> Result<String, StorageError> {
        if self.fail_signing.load(Ordering::SeqCst) {
            return Err(StorageError::Presign("injected signing failure".to_string()));
        }
        if !self.objects.lock().contains_key(key) {
            return Err(StorageError::NotFound(key.to_string()));
        }
        Ok(format!("memory://{key}?expires_in={}", ttl.as_secs()))
    }
}
