//! Durable storage for the shared collections (agenda catalog, member table,
//! debate state).
//!
//! Every collection is a single JSON document replaced as a whole on each
//! write. [`Collection`] wraps a store with the per-collection critical
//! section: a mutation is applied to a copy, the copy is persisted, and only
//! then does it become visible to readers.

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::fmt;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, error, warn};

use crate::error::{CoreError, CoreResult};

pub const CURRENT_VERSION: u32 = 1;

// --- 1. Store Trait ---

#[async_trait]
pub trait RecordStore<T>: Send + Sync
where
    T: Send + Sync + 'static,
{
    /// Never fails: a missing or unreadable document yields the default value.
    async fn load(&self) -> T;

    /// Replaces the stored document with `value`.
    async fn save(&self, value: &T) -> CoreResult<()>;

    /// Human-readable location, for logs.
    fn describe(&self) -> String;
}

impl<T> fmt::Debug for dyn RecordStore<T>
where
    T: Send + Sync + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecordStore")
            .field("location", &self.describe())
            .finish()
    }
}

// --- 2. On-disk Envelope ---

#[derive(Deserialize)]
struct Versioned<T> {
    #[serde(default = "default_version")]
    version: u32,
    data: T,
}

#[derive(Serialize)]
struct VersionedRef<'a, T> {
    version: u32,
    data: &'a T,
}

fn default_version() -> u32 {
    CURRENT_VERSION
}

/// Accepts the versioned envelope, or a bare document written before the
/// envelope existed.
fn decode<T: DeserializeOwned>(raw: &str) -> Result<(u32, T), serde_json::Error> {
    match serde_json::from_str::<Versioned<T>>(raw) {
        Ok(v) => Ok((v.version, v.data)),
        Err(envelope_err) => match serde_json::from_str::<T>(raw) {
            Ok(bare) => Ok((0, bare)),
            Err(_) => Err(envelope_err),
        },
    }
}

// --- 3. JSON File Store ---

#[derive(Debug, Clone)]
pub struct JsonFileStore<T> {
    path: PathBuf,
    _marker: PhantomData<fn() -> T>,
}

impl<T> JsonFileStore<T> {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            _marker: PhantomData,
        }
    }

    /// Moves an unreadable file out of the way so the next write cannot
    /// overwrite data a person may still want to recover by hand.
    async fn set_aside(&self) {
        let stamp = chrono::Utc::now().format("%Y%m%dT%H%M%S");
        let mut aside = self.path.clone().into_os_string();
        aside.push(format!(".unreadable-{stamp}"));
        let aside = PathBuf::from(aside);
        match tokio::fs::rename(&self.path, &aside).await {
            Ok(()) => warn!(path = %self.path.display(), moved_to = %aside.display(), "Unreadable store file set aside"),
            Err(e) => error!(path = %self.path.display(), error = %e, "Failed to set aside unreadable store file"),
        }
    }

    fn persistence_error(&self, reason: impl fmt::Display) -> CoreError {
        CoreError::Persistence {
            path: self.path.clone(),
            reason: reason.to_string(),
        }
    }
}

#[async_trait]
impl<T> RecordStore<T> for JsonFileStore<T>
where
    T: Serialize + DeserializeOwned + Default + Send + Sync + 'static,
{
    async fn load(&self) -> T {
        let raw = match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(path = %self.path.display(), "Store file missing; starting empty");
                return T::default();
            }
            Err(e) => {
                error!(path = %self.path.display(), error = %e, "Failed to read store file; starting empty");
                return T::default();
            }
        };

        if raw.trim().is_empty() {
            warn!(path = %self.path.display(), "Store file empty; starting empty");
            return T::default();
        }

        match decode::<T>(&raw) {
            Ok((version, data)) => {
                if version == 0 {
                    warn!(path = %self.path.display(), "Loaded unversioned store file; it will be upgraded on next write");
                } else if version > CURRENT_VERSION {
                    warn!(
                        path = %self.path.display(),
                        version = version,
                        supported = CURRENT_VERSION,
                        "Store file written by a newer version"
                    );
                }
                debug!(path = %self.path.display(), version = version, "Store file loaded");
                data
            }
            Err(e) => {
                error!(path = %self.path.display(), error = %e, "Malformed store file; starting empty");
                self.set_aside().await;
                T::default()
            }
        }
    }

    async fn save(&self, value: &T) -> CoreResult<()> {
        let dir = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(|p| p.to_path_buf())
            .unwrap_or_else(|| PathBuf::from("."));

        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| self.persistence_error(format!("create dir {}: {e}", dir.display())))?;

        let raw = serde_json::to_string_pretty(&VersionedRef {
            version: CURRENT_VERSION,
            data: value,
        })
        .map_err(|e| self.persistence_error(format!("serialize: {e}")))?;

        let file_name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "store.json".to_string());
        let tmp_path = dir.join(format!("{file_name}.tmp-{}", uuid::Uuid::new_v4()));

        if let Err(e) = write_synced(&tmp_path, raw.as_bytes()).await {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(self.persistence_error(format!(
                "write temp file {}: {e}",
                tmp_path.display()
            )));
        }

        // rename replaces the destination atomically; readers see old or new, never a mix.
        if let Err(e) = tokio::fs::rename(&tmp_path, &self.path).await {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(self.persistence_error(format!("replace: {e}")));
        }

        Ok(())
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}

async fn write_synced(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut file = tokio::fs::File::create(path).await?;
    file.write_all(bytes).await?;
    file.sync_all().await?;
    Ok(())
}

// --- 4. In-memory Store ---

/// Non-persistent store for tests and throwaway runs. Writes can be made to
/// fail on demand.
#[derive(Debug, Default)]
pub struct MemoryStore<T> {
    value: std::sync::Mutex<T>,
    fail_writes: AtomicBool,
    saves: AtomicUsize,
}

impl<T: Clone> MemoryStore<T> {
    pub fn new(initial: T) -> Self {
        Self {
            value: std::sync::Mutex::new(initial),
            fail_writes: AtomicBool::new(false),
            saves: AtomicUsize::new(0),
        }
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Number of successful saves so far.
    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    pub fn snapshot(&self) -> T {
        self.value.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl<T> RecordStore<T> for MemoryStore<T>
where
    T: Clone + Send + Sync + 'static,
{
    async fn load(&self) -> T {
        self.snapshot()
    }

    async fn save(&self, value: &T) -> CoreResult<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(CoreError::Persistence {
                path: PathBuf::from("memory"),
                reason: "writes disabled".to_string(),
            });
        }
        *self.value.lock().unwrap_or_else(|e| e.into_inner()) = value.clone();
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}

// --- 5. Guarded Collection ---

/// What an update closure did to the working copy.
#[derive(Debug)]
pub enum Change<R> {
    /// The copy was modified and must be persisted before `R` is returned.
    Commit(R),
    /// Nothing changed; no write happens.
    Unchanged(R),
}

pub struct Collection<T>
where
    T: Send + Sync + 'static,
{
    name: &'static str,
    store: Arc<dyn RecordStore<T>>,
    state: Mutex<T>,
}

impl<T> fmt::Debug for Collection<T>
where
    T: Send + Sync + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Collection")
            .field("name", &self.name)
            .field("store", &self.store.describe())
            .finish()
    }
}

impl<T> Collection<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub async fn open(name: &'static str, store: Arc<dyn RecordStore<T>>) -> Self {
        Self::open_with(name, store, |_| {}).await
    }

    /// Like [`Self::open`], letting the owner repair derived fields of the
    /// loaded state before anyone can read it. The repair is not written back
    /// until the next real change.
    pub async fn open_with(
        name: &'static str,
        store: Arc<dyn RecordStore<T>>,
        prepare: impl FnOnce(&mut T),
    ) -> Self {
        let mut initial = store.load().await;
        prepare(&mut initial);
        debug!(collection = name, location = %store.describe(), "Collection opened");
        Self {
            name,
            store,
            state: Mutex::new(initial),
        }
    }

    pub async fn read<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        let guard = self.state.lock().await;
        f(&guard)
    }

    pub async fn snapshot(&self) -> T {
        self.state.lock().await.clone()
    }

    /// Runs `f` against a working copy under the collection lock. The copy
    /// replaces the live state only after a successful save.
    pub async fn update<R, F>(&self, f: F) -> CoreResult<R>
    where
        F: FnOnce(&mut T) -> CoreResult<Change<R>> + Send,
        R: Send,
    {
        let mut guard = self.state.lock().await;
        let mut working = guard.clone();
        match f(&mut working)? {
            Change::Unchanged(out) => Ok(out),
            Change::Commit(out) => {
                if let Err(e) = self.store.save(&working).await {
                    error!(collection = self.name, error = %e, "Persist failed; change discarded");
                    return Err(e);
                }
                *guard = working;
                Ok(out)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    type Table = BTreeMap<String, u32>;

    #[tokio::test]
    async fn missing_file_loads_default() {
        let dir = tempfile::tempdir().unwrap();
        let store: JsonFileStore<Table> = JsonFileStore::new(dir.path().join("absent.json"));
        assert!(store.load().await.is_empty());
    }

    #[tokio::test]
    async fn save_then_load_keeps_envelope_and_leaves_no_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("table.json");
        let store: JsonFileStore<Table> = JsonFileStore::new(&path);

        let mut table = Table::new();
        table.insert("a".into(), 1);
        store.save(&table).await.unwrap();
        table.insert("b".into(), 2);
        store.save(&table).await.unwrap();

        assert_eq!(store.load().await, table);

        let raw = std::fs::read_to_string(&path).unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(value["version"], 1);
        assert_eq!(value["data"]["b"], 2);

        let leftovers: Vec<_> = std::fs::read_dir(path.parent().unwrap())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains(".tmp-"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn legacy_bare_document_is_accepted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("legacy.json");
        std::fs::write(&path, r#"{"x": 5}"#).unwrap();
        let store: JsonFileStore<Table> = JsonFileStore::new(&path);
        assert_eq!(store.load().await.get("x"), Some(&5));
    }

    #[tokio::test]
    async fn malformed_document_falls_back_to_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.json");
        std::fs::write(&path, "{ not json").unwrap();
        let store: JsonFileStore<Table> = JsonFileStore::new(&path);
        assert!(store.load().await.is_empty());

        // The unreadable original survives next to the fresh file.
        store.save(&Table::new()).await.unwrap();
        let kept: Vec<String> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().to_string())
            .filter(|name| name.starts_with("broken.json.unreadable-"))
            .collect();
        assert_eq!(kept.len(), 1);
        assert_eq!(std::fs::read_to_string(dir.path().join(&kept[0])).unwrap(), "{ not json");
    }

    #[tokio::test]
    async fn failed_save_leaves_state_untouched() {
        let store = Arc::new(MemoryStore::new(Table::new()));
        let collection: Collection<Table> = Collection::open("t", store.clone()).await;

        collection
            .update(|t| {
                t.insert("kept".into(), 1);
                Ok(Change::Commit(()))
            })
            .await
            .unwrap();

        store.set_fail_writes(true);
        let err = collection
            .update(|t| {
                t.insert("lost".into(), 2);
                Ok(Change::Commit(()))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Persistence { .. }));

        let snapshot = collection.snapshot().await;
        assert!(snapshot.contains_key("kept"));
        assert!(!snapshot.contains_key("lost"));
        assert_eq!(store.save_count(), 1);
    }

    #[tokio::test]
    async fn unchanged_updates_do_not_write() {
        let store = Arc::new(MemoryStore::new(Table::new()));
        let collection: Collection<Table> = Collection::open("t", store.clone()).await;
        let len = collection
            .update(|t| Ok(Change::Unchanged(t.len())))
            .await
            .unwrap();
        assert_eq!(len, 0);
        assert_eq!(store.save_count(), 0);
    }
}
