//! Test doubles for exercising failure paths.

use super::{
    ByteStream, InMemoryStore, ListPage, ObjectStore, StoreError, StoreResult, StoredObject,
};
use async_trait::async_trait;
use bytes::Bytes;
use futures::{TryStreamExt, stream};
use std::{
    io,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU32, Ordering},
    },
};

/// Body that yields `bytes` in small chunks.
pub fn bytes_body(bytes: &[u8]) -> ByteStream {
    let chunks: Vec<io::Result<Bytes>> = bytes
        .chunks(7)
        .map(|c| Ok(Bytes::copy_from_slice(c)))
        .collect();
    Box::pin(stream::iter(chunks))
}

pub async fn collect_body(body: ByteStream) -> Vec<u8> {
    let chunks: Vec<Bytes> = body.try_collect().await.expect("body stream failed");
    chunks.concat()
}

#[derive(Debug, Default)]
struct Faults {
    failing_reads: AtomicU32,
    fail_puts: AtomicBool,
    fail_deletes: AtomicBool,
    read_calls: AtomicU32,
    put_calls: AtomicU32,
    delete_calls: AtomicU32,
}

/// Wraps an [`InMemoryStore`] and injects `Unavailable` failures on demand.
#[derive(Debug, Clone)]
pub struct FaultyStore {
    inner: InMemoryStore,
    faults: Arc<Faults>,
}

impl FaultyStore {
    pub fn new(inner: InMemoryStore) -> Self {
        Self {
            inner,
            faults: Arc::default(),
        }
    }

    pub fn inner(&self) -> &InMemoryStore {
        &self.inner
    }

    /// Fail the next `n` `get`/`list` calls.
    pub fn fail_next_reads(&self, n: u32) {
        self.faults.failing_reads.store(n, Ordering::SeqCst);
    }

    pub fn fail_puts(&self, fail: bool) {
        self.faults.fail_puts.store(fail, Ordering::SeqCst);
    }

    pub fn fail_deletes(&self, fail: bool) {
        self.faults.fail_deletes.store(fail, Ordering::SeqCst);
    }

    pub fn read_calls(&self) -> u32 {
        self.faults.read_calls.load(Ordering::SeqCst)
    }

    pub fn put_calls(&self) -> u32 {
        self.faults.put_calls.load(Ordering::SeqCst)
    }

    pub fn delete_calls(&self) -> u32 {
        self.faults.delete_calls.load(Ordering::SeqCst)
    }

    fn read_fault(&self) -> StoreResult<()> {
        self.faults.read_calls.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .faults
            .failing_reads
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        match failing {
            Ok(_) => Err(StoreError::Unavailable("injected read failure".into())),
            Err(_) => Ok(()),
        }
    }
}

#[async_trait]
impl ObjectStore for FaultyStore {
    async fn put(&self, key: &str, body: ByteStream, content_type: &str) -> StoreResult<()> {
        self.faults.put_calls.fetch_add(1, Ordering::SeqCst);
        if self.faults.fail_puts.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("injected put failure".into()));
        }
        self.inner.put(key, body, content_type).await
    }

    async fn get(&self, key: &str) -> StoreResult<StoredObject> {
        self.read_fault()?;
        self.inner.get(key).await
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        self.faults.delete_calls.fetch_add(1, Ordering::SeqCst);
        if self.faults.fail_deletes.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("injected delete failure".into()));
        }
        self.inner.delete(key).await
    }

    async fn list(
        &self,
        prefix: Option<&str>,
        continuation_token: Option<&str>,
    ) -> StoreResult<ListPage> {
        self.read_fault()?;
        self.inner.list(prefix, continuation_token).await
    }

    fn backend(&self) -> &'static str {
        "faulty"
    }
}
