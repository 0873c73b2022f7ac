#![expect(
    clippy::module_name_repetitions,
    reason = "Storage types intentionally mirror the module name for clarity"
)]

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret as _, SecretString};
use tokio::sync::{Mutex as AsyncMutex, watch};
use tokio::task;

use super::Credentials;
use crate::Result;
use crate::error::{Error, Kind};

/// Key under which the access token is persisted.
pub const ACCESS_TOKEN_KEY: &str = "access_token";
/// Key under which the refresh token is persisted.
pub const REFRESH_TOKEN_KEY: &str = "refresh_token";
/// Key under which the RFC 3339 expiry is persisted.
pub const EXPIRES_AT_KEY: &str = "token_expires_at";

/// One change applied to a [`TokenStorage`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Entry<'a> {
    Set(&'a str, &'a str),
    Remove(&'a str),
}

/// Durable client-side key/value store holding the persisted tokens.
///
/// Implementations are synchronous; [`CredentialStore`] only ever calls them from the blocking
/// thread pool.
pub trait TokenStorage: Send + Sync + 'static {
    fn get(&self, key: &str) -> Result<Option<String>>;

    /// Apply every entry as one unit. When an error is returned none of the entries may be
    /// visible to a later [`TokenStorage::get`].
    fn write(&self, entries: &[Entry<'_>]) -> Result<()>;

    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.write(&[Entry::Set(key, value)])
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.write(&[Entry::Remove(key)])
    }
}

impl<T: TokenStorage + ?Sized> TokenStorage for Arc<T> {
    fn get(&self, key: &str) -> Result<Option<String>> {
        (**self).get(key)
    }

    fn write(&self, entries: &[Entry<'_>]) -> Result<()> {
        (**self).write(entries)
    }
}

fn apply(map: &mut BTreeMap<String, String>, entries: &[Entry<'_>]) {
    for entry in entries {
        match *entry {
            Entry::Set(key, value) => {
                map.insert(key.to_owned(), value.to_owned());
            }
            Entry::Remove(key) => {
                map.remove(key);
            }
        }
    }
}

/// Non-durable storage, useful for tests and short-lived processes.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    entries: Mutex<BTreeMap<String, String>>,
}

impl MemoryStorage {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl TokenStorage for MemoryStorage {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(entries.get(key).cloned())
    }

    fn write(&self, entries: &[Entry<'_>]) -> Result<()> {
        let mut map = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        apply(&mut map, entries);
        Ok(())
    }
}

/// Storage backed by a single JSON object on disk.
///
/// Every write rewrites the whole file through a sibling temp file and a rename, so a crash
/// mid-write leaves either the old or the new contents.
#[derive(Debug)]
pub struct FileStorage {
    path: PathBuf,
    /// Serializes read-modify-write cycles within this process
    lock: Mutex<()>,
}

impl FileStorage {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_all(&self) -> Result<BTreeMap<String, String>> {
        match fs::read(&self.path) {
            Ok(bytes) if bytes.is_empty() => Ok(BTreeMap::new()),
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| Error::with_source(Kind::Storage, e)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(e) => Err(e.into()),
        }
    }

    fn write_all(&self, entries: &BTreeMap<String, String>) -> Result<()> {
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        fs::write(&tmp, serde_json::to_vec_pretty(entries)?)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl TokenStorage for FileStorage {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(self.read_all()?.remove(key))
    }

    fn write(&self, entries: &[Entry<'_>]) -> Result<()> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut map = self.read_all()?;
        apply(&mut map, entries);
        self.write_all(&map)
    }
}

/// Run a storage call on the blocking thread pool.
async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    task::spawn_blocking(f)
        .await
        .map_err(|e| Error::with_source(Kind::Internal, e))?
}

fn restore(storage: &dyn TokenStorage) -> Result<Option<Credentials>> {
    let access = storage.get(ACCESS_TOKEN_KEY)?;
    let refresh = storage.get(REFRESH_TOKEN_KEY)?;

    let (Some(access), Some(refresh)) = (access, refresh) else {
        return Ok(None);
    };

    let expires_at = storage
        .get(EXPIRES_AT_KEY)?
        .and_then(|raw| DateTime::parse_from_rfc3339(&raw).ok())
        .map(|at| at.with_timezone(&Utc));

    let mut credentials = Credentials::new(access, refresh);
    credentials.expires_at = expires_at;
    Ok(Some(credentials))
}

fn write_through(storage: &dyn TokenStorage, credentials: Option<&Credentials>) -> Result<()> {
    let Some(c) = credentials else {
        return storage.write(&[
            Entry::Remove(ACCESS_TOKEN_KEY),
            Entry::Remove(REFRESH_TOKEN_KEY),
            Entry::Remove(EXPIRES_AT_KEY),
        ]);
    };

    let expires_at = c.expires_at.map(|at| at.to_rfc3339());
    let expiry = match &expires_at {
        Some(at) => Entry::Set(EXPIRES_AT_KEY, at),
        None => Entry::Remove(EXPIRES_AT_KEY),
    };

    storage.write(&[
        Entry::Set(ACCESS_TOKEN_KEY, c.access_token.expose_secret()),
        Entry::Set(REFRESH_TOKEN_KEY, c.refresh_token.expose_secret()),
        expiry,
    ])
}

struct StoreInner {
    current: watch::Sender<Option<Arc<Credentials>>>,
    storage: Arc<dyn TokenStorage>,
    /// Held across a write-through so the newest credentials always land last
    persisting: AsyncMutex<()>,
}

/// The single holder of the current [`Credentials`].
///
/// Readers take a snapshot with [`CredentialStore::get`]; writers replace the credentials as a
/// whole with [`CredentialStore::set`] or [`CredentialStore::clear`]. Every change is written
/// through to the [`TokenStorage`] as one batch and announced on [`CredentialStore::changes`].
///
/// Cloning is cheap and every clone shares the same state.
#[derive(Clone)]
pub struct CredentialStore {
    inner: Arc<StoreInner>,
}

impl Default for CredentialStore {
    fn default() -> Self {
        Self::new(MemoryStorage::new())
    }
}

impl fmt::Debug for CredentialStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialStore")
            .field("authenticated", &self.is_authenticated())
            .finish_non_exhaustive()
    }
}

impl CredentialStore {
    /// Create an empty store over `storage`, without reading what it already holds.
    pub fn new<S: TokenStorage>(storage: S) -> Self {
        let (current, _) = watch::channel(None);
        Self {
            inner: Arc::new(StoreInner {
                current,
                storage: Arc::new(storage),
                persisting: AsyncMutex::new(()),
            }),
        }
    }

    /// Create a store over `storage` and restore previously persisted credentials.
    ///
    /// Both tokens must be present for anything to be restored. An unparsable expiry is
    /// ignored rather than discarding the tokens.
    pub async fn load<S: TokenStorage>(storage: S) -> Result<Self> {
        let store = Self::new(storage);
        let storage = Arc::clone(&store.inner.storage);

        if let Some(credentials) = blocking(move || restore(storage.as_ref())).await? {
            #[cfg(feature = "tracing")]
            tracing::debug!("restored persisted credentials");

            store.inner.current.send_replace(Some(Arc::new(credentials)));
        }

        Ok(store)
    }

    /// Snapshot of the current credentials.
    #[must_use]
    pub fn get(&self) -> Option<Arc<Credentials>> {
        self.inner.current.borrow().clone()
    }

    /// Current access token, read at the moment of the call.
    #[must_use]
    pub fn access_token(&self) -> Option<SecretString> {
        self.inner
            .current
            .borrow()
            .as_ref()
            .map(|c| c.access_token.clone())
    }

    #[must_use]
    pub fn is_authenticated(&self) -> bool {
        self.inner.current.borrow().is_some()
    }

    /// Replace the current credentials.
    ///
    /// The in-memory value is replaced before persisting, so a storage failure is reported
    /// but the new credentials are still in effect for this process.
    pub async fn set(&self, credentials: Credentials) -> Result<()> {
        self.inner.current.send_replace(Some(Arc::new(credentials)));
        self.persist().await
    }

    /// Forget the current credentials (logout or failed renewal).
    pub async fn clear(&self) -> Result<()> {
        self.inner.current.send_replace(None);
        self.persist().await
    }

    /// Receiver notified every time the credentials are replaced or cleared.
    #[must_use]
    pub fn changes(&self) -> watch::Receiver<Option<Arc<Credentials>>> {
        self.inner.current.subscribe()
    }

    async fn persist(&self) -> Result<()> {
        let _guard = self.inner.persisting.lock().await;

        // Whatever is current now, which may already be newer than the caller's value
        let snapshot = self.get();
        let storage = Arc::clone(&self.inner.storage);
        let result = blocking(move || write_through(storage.as_ref(), snapshot.as_deref())).await;

        #[cfg(feature = "tracing")]
        if let Err(e) = &result {
            tracing::warn!(error = %e, "failed to persist credentials");
        }

        result
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread::{self, ThreadId};

    use chrono::TimeDelta;

    use super::*;

    /// Rejects every batch from the `fail_from`th on, without applying any of it.
    struct FlakyStorage {
        backing: Arc<MemoryStorage>,
        writes: AtomicUsize,
        fail_from: usize,
        threads: Mutex<Vec<ThreadId>>,
    }

    impl FlakyStorage {
        fn new(backing: &Arc<MemoryStorage>, fail_from: usize) -> Self {
            Self {
                backing: Arc::clone(backing),
                writes: AtomicUsize::new(0),
                fail_from,
                threads: Mutex::new(Vec::new()),
            }
        }
    }

    impl TokenStorage for FlakyStorage {
        fn get(&self, key: &str) -> Result<Option<String>> {
            self.backing.get(key)
        }

        fn write(&self, entries: &[Entry<'_>]) -> Result<()> {
            self.threads.lock().unwrap().push(thread::current().id());
            let n = self.writes.fetch_add(1, Ordering::SeqCst) + 1;
            if n >= self.fail_from {
                return Err(Error::with_source(
                    Kind::Storage,
                    std::io::Error::other("disk full"),
                ));
            }
            self.backing.write(entries)
        }
    }

    #[tokio::test]
    async fn set_and_clear_round_through_storage() {
        let store = CredentialStore::default();
        assert!(!store.is_authenticated());

        store
            .set(Credentials::new("access".to_owned(), "refresh".to_owned()))
            .await
            .unwrap();
        assert_eq!(store.access_token().unwrap().expose_secret(), "access");

        store.clear().await.unwrap();
        assert!(store.get().is_none());
    }

    #[tokio::test]
    async fn changes_are_signalled() {
        let store = CredentialStore::default();
        let mut rx = store.changes();
        assert!(!rx.has_changed().unwrap());

        store
            .set(Credentials::new("a".to_owned(), "r".to_owned()))
            .await
            .unwrap();
        assert!(rx.has_changed().unwrap());
        assert!(rx.borrow_and_update().is_some());

        store.clear().await.unwrap();
        assert!(rx.has_changed().unwrap());
        assert!(rx.borrow_and_update().is_none());
    }

    #[tokio::test]
    async fn file_storage_persists_across_loads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tokens.json");
        let expiry = Utc::now() + TimeDelta::minutes(5);

        let store = CredentialStore::load(FileStorage::new(&path)).await.unwrap();
        assert!(!store.is_authenticated());
        store
            .set(Credentials::new("a1".to_owned(), "r1".to_owned()).with_expiry(expiry))
            .await
            .unwrap();

        let reloaded = CredentialStore::load(FileStorage::new(&path)).await.unwrap();
        let creds = reloaded.get().unwrap();
        assert_eq!(creds.access_token().expose_secret(), "a1");
        assert_eq!(creds.refresh_token().expose_secret(), "r1");
        assert_eq!(
            creds.expires_at().map(|at| at.timestamp()),
            Some(expiry.timestamp())
        );

        reloaded.clear().await.unwrap();
        let emptied = CredentialStore::load(FileStorage::new(&path)).await.unwrap();
        assert!(!emptied.is_authenticated());
    }

    #[tokio::test]
    async fn failed_write_never_leaves_a_mixed_pair() {
        let backing = Arc::new(MemoryStorage::new());
        let store = CredentialStore::new(FlakyStorage::new(&backing, 2));

        store
            .set(Credentials::new("a1".to_owned(), "r1".to_owned()))
            .await
            .unwrap();
        let err = store
            .set(Credentials::new("a2".to_owned(), "r2".to_owned()))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), Kind::Storage);
        assert_eq!(store.access_token().unwrap().expose_secret(), "a2");

        let reloaded = CredentialStore::load(Arc::clone(&backing)).await.unwrap();
        let creds = reloaded.get().unwrap();
        assert_eq!(creds.access_token().expose_secret(), "a1");
        assert_eq!(creds.refresh_token().expose_secret(), "r1");
    }

    #[tokio::test]
    async fn each_change_is_one_batch() {
        let backing = Arc::new(MemoryStorage::new());
        let flaky = Arc::new(FlakyStorage::new(&backing, usize::MAX));
        let store = CredentialStore::new(Arc::clone(&flaky));

        store
            .set(Credentials::new("a".to_owned(), "r".to_owned()))
            .await
            .unwrap();
        store.clear().await.unwrap();

        assert_eq!(flaky.writes.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn storage_runs_off_the_async_thread() {
        let backing = Arc::new(MemoryStorage::new());
        let flaky = Arc::new(FlakyStorage::new(&backing, usize::MAX));
        let store = CredentialStore::new(Arc::clone(&flaky));

        store
            .set(Credentials::new("a".to_owned(), "r".to_owned()))
            .await
            .unwrap();

        let threads = flaky.threads.lock().unwrap();
        assert_eq!(threads.len(), 1);
        assert_ne!(threads[0], thread::current().id());
    }

    #[tokio::test]
    async fn load_requires_both_tokens() {
        let storage = MemoryStorage::new();
        storage.set(ACCESS_TOKEN_KEY, "orphan").unwrap();

        let store = CredentialStore::load(storage).await.unwrap();
        assert!(!store.is_authenticated());
    }

    #[test]
    fn file_batch_applies_every_entry() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::new(dir.path().join("tokens.json"));

        storage
            .write(&[
                Entry::Set(ACCESS_TOKEN_KEY, "a"),
                Entry::Set(REFRESH_TOKEN_KEY, "r"),
            ])
            .unwrap();
        storage
            .write(&[Entry::Remove(ACCESS_TOKEN_KEY), Entry::Remove(REFRESH_TOKEN_KEY)])
            .unwrap();

        assert_eq!(storage.get(ACCESS_TOKEN_KEY).unwrap(), None);
        assert_eq!(storage.get(REFRESH_TOKEN_KEY).unwrap(), None);
    }

    #[test]
    fn corrupt_file_is_a_storage_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tokens.json");
        fs::write(&path, b"not json").unwrap();

        let err = FileStorage::new(&path).get(ACCESS_TOKEN_KEY).unwrap_err();
        assert_eq!(err.kind(), Kind::Storage);
    }
}
