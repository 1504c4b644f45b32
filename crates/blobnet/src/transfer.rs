use std::sync::Arc;

use async_trait::async_trait;

use crate::digest::Digest;
use crate::error::{Error, Result};
use crate::scheduler::ReloadableScheduler;
use crate::store::PieceStore;

/// Blob metadata reported by stat calls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobInfo {
    pub size: u64,
}

/// Authoritative backend storage for a namespace (S3, HDFS, ...).
/// Implementations live outside the core; origin hosts use one to hydrate
/// and persist blobs.
#[async_trait]
pub trait Backend: Send + Sync {
    async fn stat(&self, namespace: &str, d: &Digest) -> Result<BlobInfo>;

    async fn download(
        &self,
        namespace: &str,
        d: &Digest,
        w: &mut (dyn tokio::io::AsyncWrite + Send + Unpin),
    ) -> Result<()>;

    async fn upload(
        &self,
        namespace: &str,
        d: &Digest,
        r: &mut (dyn tokio::io::AsyncRead + Send + Unpin),
    ) -> Result<()>;
}

/// Tag index client: resolves human-readable tags to digests.
#[async_trait]
pub trait TagClient: Send + Sync {
    async fn get(&self, tag: &str) -> Result<Digest>;
    async fn put(&self, tag: &str, d: &Digest) -> Result<()>;
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;
}

/// Image transfer operations consumed by registry-facing adapters: blob
/// stat/download/upload plus tag CRUD.
#[async_trait]
pub trait Transferer: Send + Sync {
    async fn stat(&self, namespace: &str, d: &Digest) -> Result<BlobInfo>;
    async fn download(&self, namespace: &str, d: &Digest) -> Result<tokio::fs::File>;
    async fn upload(
        &self,
        namespace: &str,
        d: &Digest,
        r: &mut (dyn tokio::io::AsyncRead + Send + Unpin),
    ) -> Result<()>;

    async fn get_tag(&self, tag: &str) -> Result<Digest>;
    async fn put_tag(&self, tag: &str, d: &Digest) -> Result<()>;
    async fn list_tags(&self, prefix: &str) -> Result<Vec<String>>;
}

/// Transferer which reads through the peer-to-peer scheduler: a download
/// miss triggers a swarm download and then streams the committed blob
/// from the local cache.
pub struct P2PTransferer {
    scheduler: Arc<ReloadableScheduler>,
    store: Arc<PieceStore>,
    tags: Arc<dyn TagClient>,
}

impl P2PTransferer {
    pub fn new(
        scheduler: Arc<ReloadableScheduler>,
        store: Arc<PieceStore>,
        tags: Arc<dyn TagClient>,
    ) -> Self {
        Self { scheduler, store, tags }
    }
}

#[async_trait]
impl Transferer for P2PTransferer {
    async fn stat(&self, _namespace: &str, d: &Digest) -> Result<BlobInfo> {
        let mi = self.store.get_metainfo(d).await?;
        Ok(BlobInfo { size: mi.total_length() })
    }

    async fn download(&self, namespace: &str, d: &Digest) -> Result<tokio::fs::File> {
        match self.store.get_file_reader(d).await {
            Ok(f) => return Ok(f),
            Err(Error::NotCached) | Err(Error::StillDownloading) => {}
            Err(e) => return Err(e),
        }
        self.scheduler.download(namespace, d).await?;
        self.store.get_file_reader(d).await
    }

    async fn upload(
        &self,
        _namespace: &str,
        d: &Digest,
        r: &mut (dyn tokio::io::AsyncRead + Send + Unpin),
    ) -> Result<()> {
        self.store.create_cache_file(d, r).await
    }

    async fn get_tag(&self, tag: &str) -> Result<Digest> {
        self.tags.get(tag).await
    }

    async fn put_tag(&self, tag: &str, d: &Digest) -> Result<()> {
        self.tags.put(tag, d).await
    }

    async fn list_tags(&self, prefix: &str) -> Result<Vec<String>> {
        self.tags.list(prefix).await
    }
}
