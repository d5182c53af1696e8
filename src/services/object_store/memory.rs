//! In-memory object store.
//!
//! Objects live in a `BTreeMap` behind an `RwLock`, so listing comes out in key
//! order for free. Everything is lost when the store is dropped; meant for
//! tests and `backend = memory` development runs.

use super::{
    ByteStream, ListPage, ObjectStore, StoreError, StoreResult, StoredObject, paginate,
    validate_key,
};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::{StreamExt, stream};
use std::{collections::BTreeMap, sync::Arc};
use tokio::sync::RwLock;

const DEFAULT_PAGE_SIZE: usize = 1000;

#[derive(Debug, Clone)]
struct MemoryObject {
    bytes: Bytes,
    content_type: Option<String>,
}

#[derive(Debug, Clone)]
pub struct InMemoryStore {
    objects: Arc<RwLock<BTreeMap<String, MemoryObject>>>,
    page_size: usize,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            objects: Arc::new(RwLock::new(BTreeMap::new())),
            page_size: DEFAULT_PAGE_SIZE,
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Number of stored objects (for testing).
    #[cfg(test)]
    pub async fn len(&self) -> usize {
        self.objects.read().await.len()
    }

    /// Write an object the way an out-of-band writer would, bypassing any
    /// content checks (for testing).
    #[cfg(test)]
    pub async fn insert_raw(&self, key: &str, bytes: &[u8], content_type: Option<&str>) {
        self.objects.write().await.insert(
            key.to_string(),
            MemoryObject {
                bytes: Bytes::copy_from_slice(bytes),
                content_type: content_type.map(str::to_string),
            },
        );
    }
}

#[async_trait]
impl ObjectStore for InMemoryStore {
    async fn put(&self, key: &str, mut body: ByteStream, content_type: &str) -> StoreResult<()> {
        validate_key(key)?;
        let mut buf = BytesMut::new();
        while let Some(chunk) = body.next().await {
            buf.extend_from_slice(&chunk?);
        }
        self.objects.write().await.insert(
            key.to_string(),
            MemoryObject {
                bytes: buf.freeze(),
                content_type: Some(content_type.to_string()),
            },
        );
        Ok(())
    }

    async fn get(&self, key: &str) -> StoreResult<StoredObject> {
        validate_key(key)?;
        let object = self
            .objects
            .read()
            .await
            .get(key)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(key.to_string()))?;

        let MemoryObject {
            bytes,
            content_type,
        } = object;
        Ok(StoredObject {
            key: key.to_string(),
            content_type,
            size_bytes: Some(bytes.len() as u64),
            body: Box::pin(stream::once(async move { Ok::<_, std::io::Error>(bytes) })),
        })
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        validate_key(key)?;
        match self.objects.write().await.remove(key) {
            Some(_) => Ok(()),
            None => Err(StoreError::NotFound(key.to_string())),
        }
    }

    async fn list(
        &self,
        prefix: Option<&str>,
        continuation_token: Option<&str>,
    ) -> StoreResult<ListPage> {
        let objects = self.objects.read().await;
        Ok(paginate(
            objects.keys().cloned(),
            prefix,
            continuation_token,
            self.page_size,
        ))
    }

    fn backend(&self) -> &'static str {
        "memory"
    }
}
