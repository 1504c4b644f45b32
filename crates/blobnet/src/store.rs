use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use rand::Rng;
use tokio::fs::{self, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::info;

use crate::bitfield::Bitfield;
use crate::digest::Digest;
use crate::error::{Error, Result};
use crate::metainfo::MetaInfo;

/// Content-addressed piece store.
///
/// Blobs being downloaded live as preallocated files under `download/`;
/// committing the final piece renames the file into `cache/`, which makes
/// the blob readable. Metainfo sidecars are JSON files under `metainfo/`.
/// Piece writes are serialized per `(digest, index)`; concurrent writers
/// for the same piece see exactly one winner.
pub struct PieceStore {
    download_dir: PathBuf,
    cache_dir: PathBuf,
    metainfo_dir: PathBuf,
    downloads: DashMap<Digest, Arc<DownloadEntry>>,
    piece_locks: DashMap<(Digest, u32), Arc<tokio::sync::Mutex<()>>>,
}

struct DownloadEntry {
    metainfo: MetaInfo,
    status: Mutex<Bitfield>,
}

impl PieceStore {
    pub async fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref();
        let download_dir = root.join("download");
        let cache_dir = root.join("cache");
        let metainfo_dir = root.join("metainfo");
        for dir in [&download_dir, &cache_dir, &metainfo_dir] {
            fs::create_dir_all(dir).await?;
        }
        Ok(Self {
            download_dir,
            cache_dir,
            metainfo_dir,
            downloads: DashMap::new(),
            piece_locks: DashMap::new(),
        })
    }

    fn download_path(&self, d: &Digest) -> PathBuf {
        self.download_dir.join(d.hex())
    }

    pub fn cache_file_path(&self, d: &Digest) -> PathBuf {
        self.cache_dir.join(d.hex())
    }

    fn metainfo_path(&self, d: &Digest) -> PathBuf {
        self.metainfo_dir.join(format!("{}.metainfo", d.hex()))
    }

    /// Writes the metainfo sidecar if absent. Returns whether it was new.
    pub async fn put_metainfo(&self, mi: &MetaInfo) -> Result<bool> {
        let path = self.metainfo_path(mi.digest());
        if fs::try_exists(&path).await? {
            return Ok(false);
        }
        let data = serde_json::to_vec(mi)?;
        let tmp = path.with_extension(format!("tmp.{:08x}", rand::thread_rng().gen::<u32>()));
        fs::write(&tmp, &data).await?;
        fs::rename(&tmp, &path).await?;
        Ok(true)
    }

    pub async fn get_metainfo(&self, d: &Digest) -> Result<MetaInfo> {
        match fs::read(self.metainfo_path(d)).await {
            Ok(data) => Ok(serde_json::from_slice(&data)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(Error::NotCached),
            Err(e) => Err(e.into()),
        }
    }

    /// Prepares a staging file for a new download. Idempotent; a no-op if
    /// the blob is already cached or downloading.
    pub async fn create_download(&self, mi: &MetaInfo) -> Result<()> {
        let d = *mi.digest();
        if fs::try_exists(self.cache_file_path(&d)).await? {
            return Ok(());
        }
        if self.downloads.contains_key(&d) {
            return Ok(());
        }
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .open(self.download_path(&d))
            .await?;
        file.set_len(mi.total_length()).await?;
        self.put_metainfo(mi).await?;
        self.downloads.insert(
            d,
            Arc::new(DownloadEntry {
                status: Mutex::new(Bitfield::new(mi.num_pieces())),
                metainfo: mi.clone(),
            }),
        );
        Ok(())
    }

    /// Verifies and commits one piece. Returns whether this write
    /// completed the blob; completion renames the staging file into the
    /// cache before returning, so the blob is readable immediately.
    pub async fn put_piece(&self, d: &Digest, index: u32, data: &[u8]) -> Result<bool> {
        let entry = self.downloads.get(d).map(|e| e.clone());
        let Some(entry) = entry else {
            return if fs::try_exists(self.cache_file_path(d)).await? {
                Err(Error::AlreadyHave)
            } else {
                Err(Error::NotCached)
            };
        };
        let mi = &entry.metainfo;
        let expected = mi
            .piece_hash(index)
            .ok_or_else(|| Error::Parse(format!("piece index {index} out of range")))?;
        if data.len() as u64 != mi.piece_size(index) {
            return Err(Error::Parse(format!(
                "piece {index} has {} bytes, want {}",
                data.len(),
                mi.piece_size(index),
            )));
        }
        let actual = Digest::compute(data);
        if actual != *expected {
            return Err(Error::checksum_mismatch(expected, actual));
        }

        let lock = self
            .piece_locks
            .entry((*d, index))
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();
        let _guard = lock.lock().await;
        if entry.status.lock().has(index as usize) {
            return Err(Error::AlreadyHave);
        }

        let mut file = OpenOptions::new().write(true).open(self.download_path(d)).await?;
        file.seek(std::io::SeekFrom::Start(index as u64 * mi.piece_length())).await?;
        file.write_all(data).await?;
        file.flush().await?;

        let completed = {
            let mut status = entry.status.lock();
            status.set(index as usize);
            status.complete()
        };
        drop(_guard);
        self.piece_locks.remove(&(*d, index));

        if completed {
            fs::rename(self.download_path(d), self.cache_file_path(d)).await?;
            self.downloads.remove(d);
            info!(digest = %d, "blob committed to cache");
        }
        Ok(completed)
    }

    /// Reads one committed piece, from the cache or the staging file.
    pub async fn get_piece(&self, d: &Digest, index: u32) -> Result<Bytes> {
        let staged = self
            .downloads
            .get(d)
            .map(|entry| (entry.status.lock().has(index as usize), entry.metainfo.clone()));
        let (path, mi) = match staged {
            Some((false, _)) => return Err(Error::NotCached),
            Some((true, mi)) => (self.download_path(d), mi),
            None => {
                if !fs::try_exists(self.cache_file_path(d)).await? {
                    return Err(Error::NotCached);
                }
                (self.cache_file_path(d), self.get_metainfo(d).await?)
            }
        };
        let size = mi.piece_size(index);
        if size == 0 {
            return Err(Error::Parse(format!("piece index {index} out of range")));
        }
        let mut file = fs::File::open(path).await?;
        file.seek(std::io::SeekFrom::Start(index as u64 * mi.piece_length())).await?;
        let mut buf = vec![0u8; size as usize];
        file.read_exact(&mut buf).await?;
        Ok(Bytes::from(buf))
    }

    pub async fn have_bitfield(&self, d: &Digest) -> Result<Bitfield> {
        if let Some(entry) = self.downloads.get(d) {
            return Ok(entry.status.lock().clone());
        }
        if fs::try_exists(self.cache_file_path(d)).await? {
            let mi = self.get_metainfo(d).await?;
            return Ok(Bitfield::full(mi.num_pieces()));
        }
        Err(Error::NotCached)
    }

    /// Opens the committed blob for reading. Blobs are only readable once
    /// every piece has been committed.
    pub async fn get_file_reader(&self, d: &Digest) -> Result<fs::File> {
        match fs::File::open(self.cache_file_path(d)).await {
            Ok(f) => Ok(f),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                if self.downloads.contains_key(d) {
                    Err(Error::StillDownloading)
                } else {
                    Err(Error::NotCached)
                }
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Writes a complete blob straight into the cache, via a staging file.
    pub async fn create_cache_file(
        &self,
        d: &Digest,
        mut r: impl tokio::io::AsyncRead + Unpin,
    ) -> Result<()> {
        let tmp = self
            .download_dir
            .join(format!("{}.tmp.{:08x}", d.hex(), rand::thread_rng().gen::<u32>()));
        let mut file = fs::File::create(&tmp).await?;
        tokio::io::copy(&mut r, &mut file).await?;
        file.flush().await?;
        drop(file);
        fs::rename(&tmp, self.cache_file_path(d)).await?;
        Ok(())
    }

    /// Lists committed blob digests; used to rediscover torrents on
    /// restart.
    pub async fn scan(&self) -> Result<Vec<Digest>> {
        let mut out = Vec::new();
        let mut entries = fs::read_dir(&self.cache_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            if let Some(name) = entry.file_name().to_str() {
                if let Ok(d) = Digest::parse(name) {
                    out.push(d);
                }
            }
        }
        Ok(out)
    }

    /// Removes a blob, its sidecar and any staging state.
    pub async fn delete(&self, d: &Digest) -> Result<()> {
        self.downloads.remove(d);
        for path in [self.cache_file_path(d), self.download_path(d), self.metainfo_path(d)] {
            match fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metainfo::{MetaInfoGenerator, PieceLengths};
    use rand::RngCore;
    use tempfile::tempdir;

    fn blob(len: usize) -> (Vec<u8>, Digest) {
        let mut data = vec![0u8; len];
        rand::thread_rng().fill_bytes(&mut data);
        let d = Digest::compute(&data);
        (data, d)
    }

    fn metainfo(data: &[u8], piece_length: u64) -> MetaInfo {
        MetaInfo::new(Digest::compute(data), data, piece_length).unwrap()
    }

    async fn store() -> (tempfile::TempDir, Arc<PieceStore>) {
        let dir = tempdir().unwrap();
        let store = PieceStore::new(dir.path()).await.unwrap();
        (dir, Arc::new(store))
    }

    #[tokio::test]
    async fn test_download_lifecycle() {
        let (_dir, store) = store().await;
        let (data, d) = blob(150);
        let mi = metainfo(&data, 64);
        store.create_download(&mi).await.unwrap();

        assert!(matches!(store.get_file_reader(&d).await, Err(Error::StillDownloading)));
        assert_eq!(store.have_bitfield(&d).await.unwrap().count(), 0);

        assert!(!store.put_piece(&d, 0, &data[..64]).await.unwrap());
        assert!(!store.put_piece(&d, 2, &data[128..]).await.unwrap());
        assert_eq!(store.have_bitfield(&d).await.unwrap().count(), 2);
        assert!(matches!(store.get_file_reader(&d).await, Err(Error::StillDownloading)));

        // Final piece commits the blob.
        assert!(store.put_piece(&d, 1, &data[64..128]).await.unwrap());
        let mut f = store.get_file_reader(&d).await.unwrap();
        let mut out = Vec::new();
        f.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, data);
        assert!(store.have_bitfield(&d).await.unwrap().complete());
    }

    #[tokio::test]
    async fn test_put_piece_rejects_corrupt_data() {
        let (_dir, store) = store().await;
        let (data, d) = blob(100);
        let mi = metainfo(&data, 64);
        store.create_download(&mi).await.unwrap();

        let mut corrupt = data[..64].to_vec();
        corrupt[0] ^= 0xff;
        assert!(matches!(
            store.put_piece(&d, 0, &corrupt).await,
            Err(Error::ChecksumMismatch { .. })
        ));
        // The piece is still missing afterwards.
        assert!(!store.have_bitfield(&d).await.unwrap().has(0));
    }

    #[tokio::test]
    async fn test_put_piece_duplicate_observes_already_have() {
        let (_dir, store) = store().await;
        let (data, d) = blob(100);
        store.create_download(&metainfo(&data, 64)).await.unwrap();

        store.put_piece(&d, 0, &data[..64]).await.unwrap();
        assert!(matches!(store.put_piece(&d, 0, &data[..64]).await, Err(Error::AlreadyHave)));
    }

    #[tokio::test]
    async fn test_concurrent_writers_single_winner() {
        let (_dir, store) = store().await;
        let (data, d) = blob(64);
        store.create_download(&metainfo(&data, 64)).await.unwrap();

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            let data = data.clone();
            tasks.push(tokio::spawn(async move { store.put_piece(&d, 0, &data).await }));
        }
        let mut winners = 0;
        let mut already = 0;
        for t in tasks {
            match t.await.unwrap() {
                Ok(true) => winners += 1,
                Ok(false) => panic!("single-piece blob must complete on the winning write"),
                Err(Error::AlreadyHave) => already += 1,
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        assert_eq!(winners, 1);
        assert_eq!(already, 7);
    }

    #[tokio::test]
    async fn test_get_piece_from_staging_and_cache() {
        let (_dir, store) = store().await;
        let (data, d) = blob(100);
        store.create_download(&metainfo(&data, 64)).await.unwrap();

        store.put_piece(&d, 0, &data[..64]).await.unwrap();
        assert_eq!(&store.get_piece(&d, 0).await.unwrap()[..], &data[..64]);
        assert!(matches!(store.get_piece(&d, 1).await, Err(Error::NotCached)));

        store.put_piece(&d, 1, &data[64..]).await.unwrap();
        assert_eq!(&store.get_piece(&d, 1).await.unwrap()[..], &data[64..]);
    }

    #[tokio::test]
    async fn test_scan_and_delete() {
        let (_dir, store) = store().await;
        let (data, d) = blob(32);
        store.create_cache_file(&d, &data[..]).await.unwrap();
        store.put_metainfo(&metainfo(&data, 16)).await.unwrap();

        assert_eq!(store.scan().await.unwrap(), vec![d]);
        assert!(store.get_file_reader(&d).await.is_ok());

        store.delete(&d).await.unwrap();
        assert!(store.scan().await.unwrap().is_empty());
        assert!(matches!(store.get_file_reader(&d).await, Err(Error::NotCached)));
    }

    #[tokio::test]
    async fn test_metainfo_sidecar_roundtrip() {
        let (_dir, store) = store().await;
        let (data, d) = blob(100);
        let mi = metainfo(&data, 64);
        assert!(store.put_metainfo(&mi).await.unwrap());
        assert!(!store.put_metainfo(&mi).await.unwrap());
        assert_eq!(store.get_metainfo(&d).await.unwrap(), mi);
    }

    #[tokio::test]
    async fn test_metainfo_generator() {
        let (_dir, store) = store().await;
        let (data, d) = blob(300);
        store.create_cache_file(&d, &data[..]).await.unwrap();

        let gen = MetaInfoGenerator::new(PieceLengths::new([(1 << 20, 128)]).unwrap(), store.clone());
        let mi = gen.generate(&d).await.unwrap();
        assert_eq!(mi.piece_length(), 128);
        assert_eq!(mi.num_pieces(), 3);
        assert_eq!(store.get_metainfo(&d).await.unwrap(), mi);

        let (_, missing) = blob(10);
        assert!(matches!(gen.generate(&missing).await, Err(Error::NotCached)));
    }
}
