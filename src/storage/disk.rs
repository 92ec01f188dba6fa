//! Persistent cache storage on the local file system.
//!
//! Layout under the root directory:
//!
//! ```text
//! index.json              cache names and their directories, in creation order
//! <dir>/<entry>.json      entry metadata (request identity, status, headers, type)
//! <dir>/<entry>.body      entry body
//! ```
//!
//! `<entry>` is the SHA-256 digest of the request identity. `<dir>` is a
//! digest unique to each creation of a cache, so a deleted cache never comes
//! back under its old name. Every file is written to a `.tmp` sibling and
//! renamed into place; an entry exists once its metadata file does.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::{Mutex, RwLock};

use super::{Cache, CacheStorage};
use crate::error::{Error, Result};
use crate::fs::{FileSystem, TokioFileSystem, tmp_path, write_atomic};
use crate::http::{CacheResponse, RequestKey, ResponseType};

const INDEX_FILE: &str = "index.json";

/// Disambiguates caches created within the same clock tick.
static NEXT_DIR: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Index {
    caches: Vec<IndexEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct IndexEntry {
    name: String,
    dir: String,
}

impl IndexEntry {
    fn create(name: &str) -> Self {
        let created = Utc::now().to_rfc3339_opts(SecondsFormat::Nanos, true);
        let seq = NEXT_DIR.fetch_add(1, Ordering::Relaxed);
        Self {
            name: name.to_string(),
            dir: digest_hex(&format!("{name}\n{created}\n{}\n{seq}", std::process::id())),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct EntryMeta {
    method: String,
    url: String,
    status: u16,
    headers: Vec<(String, String)>,
    kind: ResponseType,
    response_url: Option<String>,
    stored_at: DateTime<Utc>,
}

fn digest_hex(input: &str) -> String {
    Sha256::digest(input.as_bytes())
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

fn is_not_found(e: &std::io::Error) -> bool {
    e.kind() == std::io::ErrorKind::NotFound
}

fn backup_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".bak");
    PathBuf::from(name)
}

/// Keeps the last response given for each key.
fn last_write_wins(entries: Vec<(RequestKey, CacheResponse)>) -> Vec<(RequestKey, CacheResponse)> {
    let mut seen = HashSet::new();
    let mut unique: Vec<_> = entries
        .into_iter()
        .rev()
        .filter(|(key, _)| seen.insert(key.clone()))
        .collect();
    unique.reverse();
    unique
}

/// Cache storage persisted under a root directory.
pub struct DiskCacheStorage<F: FileSystem = TokioFileSystem> {
    root: PathBuf,
    fs: Arc<F>,
    /// Serializes read-modify-write cycles of `index.json`.
    index_lock: Arc<Mutex<()>>,
    /// Writers of entry files are exclusive; readers never see half a commit.
    entry_lock: Arc<RwLock<()>>,
}

impl<F: FileSystem> Clone for DiskCacheStorage<F> {
    fn clone(&self) -> Self {
        Self {
            root: self.root.clone(),
            fs: Arc::clone(&self.fs),
            index_lock: Arc::clone(&self.index_lock),
            entry_lock: Arc::clone(&self.entry_lock),
        }
    }
}

impl DiskCacheStorage<TokioFileSystem> {
    /// Creates a store rooted at `root` using `tokio::fs`.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self::with_fs(root, TokioFileSystem)
    }
}

impl<F: FileSystem> DiskCacheStorage<F> {
    /// Creates a store with a custom file system implementation.
    #[must_use]
    pub fn with_fs(root: impl Into<PathBuf>, fs: F) -> Self {
        Self {
            root: root.into(),
            fs: Arc::new(fs),
            index_lock: Arc::new(Mutex::new(())),
            entry_lock: Arc::new(RwLock::new(())),
        }
    }

    /// Root directory of the store.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn index_path(&self) -> PathBuf {
        self.root.join(INDEX_FILE)
    }

    async fn load_index(&self) -> Result<Index> {
        match self.fs.read(&self.index_path()).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if is_not_found(&e) => Ok(Index::default()),
            Err(e) => Err(e.into()),
        }
    }

    async fn save_index(&self, index: &Index) -> Result<()> {
        self.fs.create_dir_all(&self.root).await?;
        let bytes = serde_json::to_vec_pretty(index)?;
        write_atomic(self.fs.as_ref(), &self.index_path(), &bytes).await?;
        Ok(())
    }

    fn handle(&self, entry: &IndexEntry) -> DiskCache<F> {
        DiskCache {
            name: entry.name.clone(),
            dir: self.root.join(&entry.dir),
            fs: Arc::clone(&self.fs),
            entry_lock: Arc::clone(&self.entry_lock),
        }
    }
}

/// Handle to one on-disk cache.
///
/// Writes through a handle to a deleted cache fail and never reach a cache
/// later opened under the same name.
pub struct DiskCache<F: FileSystem = TokioFileSystem> {
    name: String,
    dir: PathBuf,
    fs: Arc<F>,
    entry_lock: Arc<RwLock<()>>,
}

impl<F: FileSystem> DiskCache<F> {
    fn entry_paths(&self, key: &RequestKey) -> (PathBuf, PathBuf) {
        let stem = digest_hex(&key.to_string());
        (
            self.dir.join(format!("{stem}.json")),
            self.dir.join(format!("{stem}.body")),
        )
    }

    fn encode(key: &RequestKey, response: &CacheResponse) -> Result<Vec<u8>> {
        let meta = EntryMeta {
            method: key.method.clone(),
            url: key.url.clone(),
            status: response.status,
            headers: response.headers.clone(),
            kind: response.kind,
            response_url: response.url.clone(),
            stored_at: Utc::now(),
        };
        Ok(serde_json::to_vec(&meta)?)
    }

    async fn read_meta(&self, path: &Path) -> Result<Option<EntryMeta>> {
        match self.fs.read(path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if is_not_found(&e) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Writes `key`'s body and metadata to their `.tmp` staging paths.
    async fn stage(
        &self,
        key: &RequestKey,
        response: &CacheResponse,
    ) -> std::io::Result<[(PathBuf, PathBuf); 2]> {
        let (meta_path, body_path) = self.entry_paths(key);
        let meta = Self::encode(key, response).map_err(std::io::Error::other)?;
        let body_tmp = tmp_path(&body_path);
        let meta_tmp = tmp_path(&meta_path);
        self.fs.write(&body_tmp, &response.body).await?;
        self.fs.write(&meta_tmp, &meta).await?;
        Ok([(body_tmp, body_path), (meta_tmp, meta_path)])
    }

    /// Renames every staged file into place, or restores the previous files
    /// and removes the remaining staged ones.
    async fn commit(&self, staged: &[(PathBuf, PathBuf)]) -> std::io::Result<()> {
        let mut backups = Vec::new();
        let mut committed = Vec::new();
        let mut failure = None;

        for (i, (tmp, path)) in staged.iter().enumerate() {
            let backup = backup_path(path);
            match self.fs.rename(path, &backup).await {
                Ok(()) => backups.push((backup, path)),
                Err(e) if is_not_found(&e) => {}
                Err(e) => {
                    failure = Some((i, e));
                    break;
                }
            }
            if let Err(e) = self.fs.rename(tmp, path).await {
                failure = Some((i, e));
                break;
            }
            committed.push(path);
        }

        let Some((failed_at, e)) = failure else {
            for (backup, _) in &backups {
                let _ = self.fs.remove_file(backup).await;
            }
            return Ok(());
        };

        for path in committed {
            let _ = self.fs.remove_file(path).await;
        }
        for (backup, path) in backups {
            let _ = self.fs.rename(&backup, path).await;
        }
        for (tmp, _) in &staged[failed_at..] {
            let _ = self.fs.remove_file(tmp).await;
        }
        Err(e)
    }

    fn write_error(&self, e: std::io::Error) -> Error {
        if is_not_found(&e) {
            Error::Cache(format!("cache {} was deleted", self.name))
        } else {
            e.into()
        }
    }
}

#[async_trait]
impl<F: FileSystem + 'static> Cache for DiskCache<F> {
    fn name(&self) -> &str {
        &self.name
    }

    async fn match_request(&self, key: &RequestKey) -> Result<Option<CacheResponse>> {
        let _read = self.entry_lock.read().await;
        let (meta_path, body_path) = self.entry_paths(key);
        let Some(meta) = self.read_meta(&meta_path).await? else {
            return Ok(None);
        };
        // Digest collisions are not a match.
        if meta.method != key.method || meta.url != key.url {
            return Ok(None);
        }
        let body = match self.fs.read(&body_path).await {
            Ok(body) => body,
            Err(e) if is_not_found(&e) => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(Some(CacheResponse {
            status: meta.status,
            headers: meta.headers,
            body: Bytes::from(body),
            kind: meta.kind,
            url: meta.response_url,
        }))
    }

    async fn put(&self, key: RequestKey, response: CacheResponse) -> Result<()> {
        self.put_all(vec![(key, response)]).await
    }

    async fn put_all(&self, entries: Vec<(RequestKey, CacheResponse)>) -> Result<()> {
        let entries = last_write_wins(entries);
        let _write = self.entry_lock.write().await;

        let mut staged = Vec::with_capacity(entries.len() * 2);
        for (key, response) in &entries {
            match self.stage(key, response).await {
                Ok(files) => staged.extend(files),
                Err(e) => {
                    for (tmp, _) in &staged {
                        let _ = self.fs.remove_file(tmp).await;
                    }
                    let (meta_path, body_path) = self.entry_paths(key);
                    let _ = self.fs.remove_file(&tmp_path(&body_path)).await;
                    let _ = self.fs.remove_file(&tmp_path(&meta_path)).await;
                    return Err(self.write_error(e));
                }
            }
        }

        // Bodies precede their metadata in `staged`, so an entry only
        // becomes visible once its body is in place.
        self.commit(&staged).await.map_err(|e| self.write_error(e))
    }

    async fn keys(&self) -> Result<Vec<RequestKey>> {
        let _read = self.entry_lock.read().await;
        let paths = match self.fs.read_dir(&self.dir).await {
            Ok(paths) => paths,
            Err(e) if is_not_found(&e) => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut keys = Vec::new();
        for path in paths
            .iter()
            .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
        {
            if let Some(meta) = self.read_meta(path).await? {
                keys.push(RequestKey {
                    method: meta.method,
                    url: meta.url,
                });
            }
        }
        keys.sort();
        Ok(keys)
    }
}

#[async_trait]
impl<F: FileSystem + 'static> CacheStorage for DiskCacheStorage<F> {
    type Cache = DiskCache<F>;

    async fn open(&self, name: &str) -> Result<DiskCache<F>> {
        let _guard = self.index_lock.lock().await;
        let mut index = self.load_index().await?;
        if let Some(entry) = index.caches.iter().find(|c| c.name == name) {
            return Ok(self.handle(entry));
        }

        let entry = IndexEntry::create(name);
        self.fs.create_dir_all(&self.root.join(&entry.dir)).await?;
        let cache = self.handle(&entry);
        index.caches.push(entry);
        self.save_index(&index).await?;
        log::debug!("Created cache {name}");
        Ok(cache)
    }

    async fn has(&self, name: &str) -> Result<bool> {
        Ok(self.load_index().await?.caches.iter().any(|c| c.name == name))
    }

    async fn delete(&self, name: &str) -> Result<bool> {
        let _guard = self.index_lock.lock().await;
        let mut index = self.load_index().await?;
        let Some(pos) = index.caches.iter().position(|c| c.name == name) else {
            return Ok(false);
        };
        let entry = index.caches.remove(pos);
        self.save_index(&index).await?;

        match self.fs.remove_dir_all(&self.root.join(&entry.dir)).await {
            Ok(()) => Ok(true),
            Err(e) if is_not_found(&e) => Ok(true),
            Err(e) => Err(Error::Cache(format!(
                "cache {name} unlisted but its directory could not be removed: {e}"
            ))),
        }
    }

    async fn keys(&self) -> Result<Vec<String>> {
        Ok(self
            .load_index()
            .await?
            .caches
            .into_iter()
            .map(|c| c.name)
            .collect())
    }

    async fn match_request(&self, key: &RequestKey) -> Result<Option<CacheResponse>> {
        let index = self.load_index().await?;
        for entry in &index.caches {
            if let Some(response) = self.handle(entry).match_request(key).await? {
                return Ok(Some(response));
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::contract;
    use tempfile::TempDir;

    fn storage() -> (TempDir, DiskCacheStorage) {
        let dir = TempDir::new().unwrap();
        let storage = DiskCacheStorage::new(dir.path().join("caches"));
        (dir, storage)
    }

    #[tokio::test]
    async fn open_creates_and_lists_in_order() {
        let (_dir, storage) = storage();
        contract::open_creates_and_lists_in_order(&storage).await;
    }

    #[tokio::test]
    async fn put_match_and_overwrite() {
        let (_dir, storage) = storage();
        contract::put_match_and_overwrite(&storage).await;
    }

    #[tokio::test]
    async fn put_all_stores_every_entry() {
        let (_dir, storage) = storage();
        contract::put_all_stores_every_entry(&storage).await;
    }

    #[tokio::test]
    async fn match_searches_caches_in_creation_order() {
        let (_dir, storage) = storage();
        contract::match_searches_caches_in_creation_order(&storage).await;
    }

    #[tokio::test]
    async fn delete_removes_cache_and_entries() {
        let (_dir, storage) = storage();
        contract::delete_removes_cache_and_entries(&storage).await;
    }

    #[tokio::test]
    async fn concurrent_puts_keep_one_whole_write() {
        let (_dir, storage) = storage();
        contract::concurrent_puts_keep_one_whole_write(&storage).await;
    }

    #[tokio::test]
    async fn deleted_handle_is_detached() {
        let (_dir, storage) = storage();
        contract::deleted_handle_is_detached(&storage).await;
    }

    #[tokio::test]
    async fn entries_persist_across_instances() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("caches");
        let key = RequestKey::get("/assets/fonts/iransans.ttf");

        {
            let storage = DiskCacheStorage::new(&root);
            let cache = storage.open("board-web-v1").await.unwrap();
            let response = CacheResponse::new(200, vec![0_u8, 1, 2, 255])
                .with_header("Content-Type", "font/ttf");
            cache.put(key.clone(), response).await.unwrap();
        }

        let storage = DiskCacheStorage::new(&root);
        assert_eq!(storage.keys().await.unwrap(), vec!["board-web-v1"]);
        let found = storage.match_request(&key).await.unwrap().unwrap();
        assert_eq!(&found.body[..], &[0, 1, 2, 255]);
        assert_eq!(found.header("content-type"), Some("font/ttf"));
        assert_eq!(found.kind, ResponseType::Basic);
    }

    #[tokio::test]
    async fn missing_root_is_an_empty_store() {
        let dir = TempDir::new().unwrap();
        let storage = DiskCacheStorage::new(dir.path().join("never-created"));
        assert!(storage.keys().await.unwrap().is_empty());
        assert_eq!(storage.match_request(&RequestKey::get("/a")).await.unwrap(), None);
    }

    #[test]
    fn digest_hex_is_stable() {
        assert_eq!(
            digest_hex("board-web-v1"),
            digest_hex("board-web-v1")
        );
        assert_eq!(digest_hex("").len(), 64);
        assert_eq!(
            digest_hex(""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    // =========================================================================
    // Failure injection
    // =========================================================================

    use std::collections::{HashMap, HashSet};
    use std::sync::Mutex as StdMutex;

    /// In-memory file system that can refuse writes to chosen paths.
    #[derive(Default)]
    struct FlakyFileSystem {
        files: StdMutex<HashMap<PathBuf, Vec<u8>>>,
        fail_writes: StdMutex<HashSet<PathBuf>>,
        fail_renames_to: StdMutex<HashSet<PathBuf>>,
    }

    impl FlakyFileSystem {
        fn fail_write(&self, path: PathBuf) {
            self.fail_writes.lock().unwrap().insert(path);
        }

        fn fail_rename_to(&self, path: PathBuf) {
            self.fail_renames_to.lock().unwrap().insert(path);
        }

        fn paths(&self) -> Vec<PathBuf> {
            let mut paths: Vec<_> = self.files.lock().unwrap().keys().cloned().collect();
            paths.sort();
            paths
        }
    }

    #[async_trait]
    impl FileSystem for FlakyFileSystem {
        async fn read(&self, path: &Path) -> std::io::Result<Vec<u8>> {
            self.files
                .lock()
                .unwrap()
                .get(path)
                .cloned()
                .ok_or_else(|| std::io::Error::from(std::io::ErrorKind::NotFound))
        }

        async fn write(&self, path: &Path, contents: &[u8]) -> std::io::Result<()> {
            if self.fail_writes.lock().unwrap().contains(path) {
                return Err(std::io::Error::other("disk full"));
            }
            self.files
                .lock()
                .unwrap()
                .insert(path.to_path_buf(), contents.to_vec());
            Ok(())
        }

        async fn rename(&self, from: &Path, to: &Path) -> std::io::Result<()> {
            if self.fail_renames_to.lock().unwrap().contains(to) {
                return Err(std::io::Error::other("device busy"));
            }
            let mut files = self.files.lock().unwrap();
            let contents = files
                .remove(from)
                .ok_or_else(|| std::io::Error::from(std::io::ErrorKind::NotFound))?;
            files.insert(to.to_path_buf(), contents);
            Ok(())
        }

        async fn remove_file(&self, path: &Path) -> std::io::Result<()> {
            self.files
                .lock()
                .unwrap()
                .remove(path)
                .map(|_| ())
                .ok_or_else(|| std::io::Error::from(std::io::ErrorKind::NotFound))
        }

        async fn create_dir_all(&self, _path: &Path) -> std::io::Result<()> {
            Ok(())
        }

        async fn remove_dir_all(&self, path: &Path) -> std::io::Result<()> {
            self.files.lock().unwrap().retain(|p, _| !p.starts_with(path));
            Ok(())
        }

        async fn read_dir(&self, path: &Path) -> std::io::Result<Vec<PathBuf>> {
            Ok(self
                .files
                .lock()
                .unwrap()
                .keys()
                .filter(|p| p.parent() == Some(path))
                .cloned()
                .collect())
        }
    }

    #[tokio::test]
    async fn put_all_is_all_or_nothing() {
        let root = PathBuf::from("/caches");
        let storage = DiskCacheStorage::with_fs(&root, FlakyFileSystem::default());
        let cache = storage.open("board-web-v1").await.unwrap();
        let (_, failing_body) = cache.entry_paths(&RequestKey::get("/b.ttf"));
        storage.fs.fail_write(tmp_path(&failing_body));

        let result = cache
            .put_all(vec![
                (RequestKey::get("/a.css"), CacheResponse::new(200, "a")),
                (RequestKey::get("/b.ttf"), CacheResponse::new(200, "b")),
            ])
            .await;

        assert!(matches!(result, Err(Error::Io(_))));
        assert!(cache.keys().await.unwrap().is_empty());
        assert_eq!(
            storage.match_request(&RequestKey::get("/a.css")).await.unwrap(),
            None
        );
        // Only the index survives; no staged files are left behind.
        assert_eq!(storage.fs.paths(), vec![root.join(INDEX_FILE)]);
    }

    #[tokio::test]
    async fn failed_commit_restores_previous_entries() {
        let root = PathBuf::from("/caches");
        let storage = DiskCacheStorage::with_fs(&root, FlakyFileSystem::default());
        let cache = storage.open("board-web-v1").await.unwrap();
        cache
            .put(RequestKey::get("/a.css"), CacheResponse::new(200, "old"))
            .await
            .unwrap();
        let files_before = storage.fs.paths();

        // The second entry's metadata is the last file to be renamed.
        let (failing_meta, _) = cache.entry_paths(&RequestKey::get("/b.ttf"));
        storage.fs.fail_rename_to(failing_meta);

        let result = cache
            .put_all(vec![
                (RequestKey::get("/a.css"), CacheResponse::new(200, "new")),
                (RequestKey::get("/b.ttf"), CacheResponse::new(200, "b")),
            ])
            .await;

        assert!(matches!(result, Err(Error::Io(_))));
        let a = cache.match_request(&RequestKey::get("/a.css")).await.unwrap().unwrap();
        assert_eq!(&a.body[..], b"old");
        assert_eq!(cache.match_request(&RequestKey::get("/b.ttf")).await.unwrap(), None);
        assert_eq!(cache.keys().await.unwrap(), vec![RequestKey::get("/a.css")]);
        // No staged or backup files are left behind.
        assert_eq!(storage.fs.paths(), files_before);
    }

    #[tokio::test]
    async fn duplicate_keys_in_put_all_keep_the_last() {
        let (_dir, storage) = storage();
        let cache = storage.open("board-web-v1").await.unwrap();
        cache
            .put_all(vec![
                (RequestKey::get("/a.css"), CacheResponse::new(200, "first")),
                (RequestKey::get("/a.css"), CacheResponse::new(200, "second")),
            ])
            .await
            .unwrap();

        let stored = cache.match_request(&RequestKey::get("/a.css")).await.unwrap().unwrap();
        assert_eq!(&stored.body[..], b"second");
    }

    #[tokio::test]
    async fn recreated_cache_gets_a_new_directory() {
        let (_dir, storage) = storage();
        let first = storage.open("board-web-v0").await.unwrap();
        storage.delete("board-web-v0").await.unwrap();
        let second = storage.open("board-web-v0").await.unwrap();

        assert_ne!(first.dir, second.dir);
        assert!(matches!(
            first
                .put(RequestKey::get("/a.css"), CacheResponse::new(200, "late"))
                .await,
            Err(Error::Cache(_))
        ));
    }
}
