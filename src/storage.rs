use anyhow::{Context, Result, anyhow};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

pub const SETTINGS_SYNC_TREE: &str = "settings_sync";
pub const SETTINGS_LOCAL_TREE: &str = "settings_local";
pub const RECORDS_TREE: &str = "records";
pub const UI_STATE_TREE: &str = "ui_state";

const LOCAL_STATE_DB_DIR_NAME: &str = "depot_db";
const DATA_DIR_ENV: &str = "DEPOT_DATA_DIR";

/// Byte-oriented key-value partition. Every component persists through this
/// seam so production code runs on sled and tests on [`MemoryStore`].
pub trait KeyValueStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;
    fn insert(&self, key: &str, value: &[u8]) -> Result<()>;
    fn remove(&self, key: &str) -> Result<()>;
    /// Reads the whole partition. Keys that are not valid UTF-8 are skipped.
    fn entries(&self) -> Result<Vec<(String, Vec<u8>)>>;
    fn flush(&self) -> Result<()> {
        Ok(())
    }
}

impl KeyValueStore for sled::Tree {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let value = sled::Tree::get(self, key).with_context(|| format!("read {key}"))?;
        Ok(value.map(|raw| raw.to_vec()))
    }

    fn insert(&self, key: &str, value: &[u8]) -> Result<()> {
        sled::Tree::insert(self, key, value).with_context(|| format!("write {key}"))?;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        sled::Tree::remove(self, key).with_context(|| format!("remove {key}"))?;
        Ok(())
    }

    fn entries(&self) -> Result<Vec<(String, Vec<u8>)>> {
        let mut entries = Vec::new();
        for entry in self.iter() {
            let (key, value) = entry.context("iterate tree")?;
            let Ok(key) = String::from_utf8(key.to_vec()) else {
                continue;
            };
            entries.push((key, value.to_vec()));
        }
        Ok(entries)
    }

    fn flush(&self) -> Result<()> {
        sled::Tree::flush(self).context("flush tree")?;
        Ok(())
    }
}

impl<T: KeyValueStore + ?Sized> KeyValueStore for Arc<T> {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        (**self).get(key)
    }

    fn insert(&self, key: &str, value: &[u8]) -> Result<()> {
        (**self).insert(key, value)
    }

    fn remove(&self, key: &str) -> Result<()> {
        (**self).remove(key)
    }

    fn entries(&self) -> Result<Vec<(String, Vec<u8>)>> {
        (**self).entries()
    }

    fn flush(&self) -> Result<()> {
        (**self).flush()
    }
}

/// In-memory partition. `fail_writes` simulates a full backend and
/// `fail_reads` an unreadable one.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<BTreeMap<String, Vec<u8>>>,
    fail_writes: AtomicBool,
    fail_reads: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::Relaxed);
    }

    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::Relaxed);
    }

    fn check_readable(&self) -> Result<()> {
        if self.fail_reads.load(Ordering::Relaxed) {
            return Err(anyhow!("storage unavailable"));
        }
        Ok(())
    }

    fn check_writable(&self, key: &str) -> Result<()> {
        if self.fail_writes.load(Ordering::Relaxed) {
            return Err(anyhow!("quota exceeded writing {key}"));
        }
        Ok(())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, BTreeMap<String, Vec<u8>>>> {
        self.entries
            .lock()
            .map_err(|_| anyhow!("memory store lock poisoned"))
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.check_readable()?;
        Ok(self.lock()?.get(key).cloned())
    }

    fn insert(&self, key: &str, value: &[u8]) -> Result<()> {
        self.check_writable(key)?;
        self.lock()?.insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.check_writable(key)?;
        self.lock()?.remove(key);
        Ok(())
    }

    fn entries(&self) -> Result<Vec<(String, Vec<u8>)>> {
        self.check_readable()?;
        Ok(self
            .lock()?
            .iter()
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect())
    }
}

/// Whether a read or write reached the backend or fell back to defaults.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum StoreStatus {
    #[default]
    Clean,
    Degraded {
        reason: String,
    },
}

impl StoreStatus {
    pub fn degraded(reason: impl std::fmt::Display) -> Self {
        Self::Degraded {
            reason: reason.to_string(),
        }
    }

    pub fn is_degraded(&self) -> bool {
        matches!(self, Self::Degraded { .. })
    }

    /// Keeps the first fault when several steps of one operation fail.
    pub fn merge(self, other: StoreStatus) -> StoreStatus {
        match self {
            Self::Clean => other,
            degraded => degraded,
        }
    }

    pub fn from_result<T>(result: &Result<T>) -> Self {
        match result {
            Ok(_) => Self::Clean,
            Err(err) => Self::degraded(format!("{err:#}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Outcome<T> {
    pub value: T,
    pub status: StoreStatus,
}

impl<T> Outcome<T> {
    pub fn clean(value: T) -> Self {
        Self {
            value,
            status: StoreStatus::Clean,
        }
    }

    pub fn with_status(value: T, status: StoreStatus) -> Self {
        Self { value, status }
    }
}

/// One backend per partition. In production each is a sled tree opened from
/// a single database.
#[derive(Clone)]
pub struct PersistentStores<B = sled::Tree> {
    pub settings_sync: B,
    pub settings_local: B,
    pub records: B,
    pub ui_state: B,
}

impl PersistentStores<Arc<MemoryStore>> {
    pub fn in_memory() -> Self {
        Self {
            settings_sync: Arc::new(MemoryStore::new()),
            settings_local: Arc::new(MemoryStore::new()),
            records: Arc::new(MemoryStore::new()),
            ui_state: Arc::new(MemoryStore::new()),
        }
    }
}

pub fn db_path_in(data_dir: &Path) -> PathBuf {
    data_dir.join(LOCAL_STATE_DB_DIR_NAME)
}

/// Directory holding the database and the logging files: `$DEPOT_DATA_DIR`,
/// else a per-user default.
pub fn local_state_dir() -> PathBuf {
    if let Some(dir) = std::env::var_os(DATA_DIR_ENV)
        && !dir.is_empty()
    {
        return PathBuf::from(dir);
    }

    if let Some(app_data) = std::env::var_os("APPDATA") {
        return PathBuf::from(app_data).join("avatar-depot");
    }

    if let Some(home) = std::env::var_os("HOME") {
        return PathBuf::from(home).join(".avatar-depot");
    }

    PathBuf::from(".avatar-depot")
}

pub fn open_persistent_stores(db_path: &Path) -> Result<PersistentStores> {
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create state dir {}", parent.display()))?;
    }

    let db = sled::open(db_path).with_context(|| format!("open db {}", db_path.display()))?;
    open_trees(&db).inspect(|_| {
        crate::debug_log!("[store] init path={}", db_path.to_string_lossy());
    })
}

pub fn open_trees(db: &sled::Db) -> Result<PersistentStores> {
    let open = |name: &str| {
        db.open_tree(name)
            .inspect_err(|err| crate::debug_log!("[store] open tree failed: {} | {}", name, err))
            .with_context(|| format!("open tree {name}"))
    };

    Ok(PersistentStores {
        settings_sync: open(SETTINGS_SYNC_TREE)?,
        settings_local: open(SETTINGS_LOCAL_TREE)?,
        records: open(RECORDS_TREE)?,
        ui_state: open(UI_STATE_TREE)?,
    })
}

pub fn decode_stored_bool(value: Option<Vec<u8>>, default: bool) -> bool {
    let Some(raw) = value else {
        return default;
    };
    raw.first().copied().map(|v| v != 0).unwrap_or(default)
}

pub fn decode_stored_string(value: Option<Vec<u8>>) -> Option<String> {
    let raw = value?;
    let value = String::from_utf8(raw).ok()?;
    if value.is_empty() {
        return None;
    }
    Some(value)
}

pub fn decode_stored_u64(value: Option<Vec<u8>>) -> Option<u64> {
    let raw = value?;
    let bytes: [u8; 8] = raw.as_slice().try_into().ok()?;
    Some(u64::from_be_bytes(bytes))
}

pub fn decode_stored_f32(value: Option<Vec<u8>>) -> Option<f32> {
    let raw = value?;
    let bytes: [u8; 4] = raw.as_slice().try_into().ok()?;
    let value = f32::from_be_bytes(bytes);
    value.is_finite().then_some(value)
}
