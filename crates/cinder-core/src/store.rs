//! Shared state store backing the IP pool and the process registry.
//!
//! Several orchestrator processes may run on one host, so the facts "this IP
//! is taken" and "this hypervisor belongs to that socket" must live outside
//! any one of them. [`RedisStore`] and [`FileStore`] provide that;
//! [`MemoryStore`] is the single-process stand-in for tests and embedders.

use crate::error::{CoreError, Result};
use async_trait::async_trait;
use nix::fcntl::{Flock, FlockArg};
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Minimal set and string primitives with the atomicity the pool and
/// registry need.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Add `member` to set `key`. Returns `true` if it was not already a
    /// member. Check and insert happen atomically.
    async fn set_add(&self, key: &str, member: &str) -> Result<bool>;

    /// Remove `member` from set `key`. Returns `true` if it was a member.
    async fn set_remove(&self, key: &str, member: &str) -> Result<bool>;

    /// Membership test.
    async fn set_contains(&self, key: &str, member: &str) -> Result<bool>;

    /// All members of set `key`, in no particular order.
    async fn set_members(&self, key: &str) -> Result<Vec<String>>;

    /// Read string `key`.
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Atomically replace string `key` with `new` if its current value is
    /// `expected` (`None` = key absent). Returns whether the write happened.
    async fn compare_and_set(&self, key: &str, expected: Option<&str>, new: &str) -> Result<bool>;
}

/// In-process [`StateStore`].
#[derive(Debug, Default)]
pub struct MemoryStore {
    sets: Mutex<HashMap<String, BTreeSet<String>>>,
    strings: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

fn poisoned<T>(_: T) -> CoreError {
    CoreError::Store("memory store lock poisoned".into())
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn set_add(&self, key: &str, member: &str) -> Result<bool> {
        let mut sets = self.sets.lock().map_err(poisoned)?;
        Ok(sets
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string()))
    }

    async fn set_remove(&self, key: &str, member: &str) -> Result<bool> {
        let mut sets = self.sets.lock().map_err(poisoned)?;
        Ok(sets.get_mut(key).is_some_and(|s| s.remove(member)))
    }

    async fn set_contains(&self, key: &str, member: &str) -> Result<bool> {
        let sets = self.sets.lock().map_err(poisoned)?;
        Ok(sets.get(key).is_some_and(|s| s.contains(member)))
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>> {
        let sets = self.sets.lock().map_err(poisoned)?;
        Ok(sets
            .get(key)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let strings = self.strings.lock().map_err(poisoned)?;
        Ok(strings.get(key).cloned())
    }

    async fn compare_and_set(&self, key: &str, expected: Option<&str>, new: &str) -> Result<bool> {
        let mut strings = self.strings.lock().map_err(poisoned)?;
        if strings.get(key).map(String::as_str) != expected {
            return Ok(false);
        }
        strings.insert(key.to_string(), new.to_string());
        Ok(true)
    }
}

/// Everything a [`FileStore`] holds.
#[derive(Debug, Default, Serialize, Deserialize)]
struct FileState {
    #[serde(default)]
    sets: BTreeMap<String, BTreeSet<String>>,
    #[serde(default)]
    strings: BTreeMap<String, String>,
}

/// [`StateStore`] in a JSON file, shared by every orchestrator process on
/// the host that opens the same path.
///
/// Each operation takes an exclusive `flock(2)` on `<path>.lock`, reads the
/// file, and, if it changed anything, writes `<path>.tmp` and renames it
/// over `<path>`. Readers therefore never see a half-written file.
#[derive(Debug, Clone)]
pub struct FileStore {
    path: PathBuf,
}

impl FileStore {
    /// Use `path`, creating its directory if needed.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)?;
        }
        tracing::info!(path = %path.display(), "Using state file");
        Ok(Self { path })
    }

    /// Backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Run `f` on the state under the file lock. `f` returns its result and
    /// whether it modified the state.
    async fn transact<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut FileState) -> (T, bool) + Send + 'static,
    {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || transact_blocking(&path, f))
            .await
            .map_err(|e| CoreError::Store(format!("state file task failed: {e}")))?
    }
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

fn transact_blocking<T>(path: &Path, f: impl FnOnce(&mut FileState) -> (T, bool)) -> Result<T> {
    let lock_path = sibling(path, ".lock");
    let lock_file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(&lock_path)?;
    let _lock = Flock::lock(lock_file, FlockArg::LockExclusive).map_err(|(_, errno)| {
        CoreError::Store(format!("cannot lock {}: {errno}", lock_path.display()))
    })?;

    let mut state = match std::fs::read(path) {
        Ok(raw) if raw.iter().all(u8::is_ascii_whitespace) => FileState::default(),
        Ok(raw) => serde_json::from_slice(&raw)?,
        Err(e) if e.kind() == ErrorKind::NotFound => FileState::default(),
        Err(e) => return Err(e.into()),
    };

    let (out, dirty) = f(&mut state);
    if dirty {
        let tmp = sibling(path, ".tmp");
        let mut file = File::create(&tmp)?;
        file.write_all(&serde_json::to_vec(&state)?)?;
        file.sync_all()?;
        std::fs::rename(&tmp, path)?;
    }
    Ok(out)
}

#[async_trait]
impl StateStore for FileStore {
    async fn set_add(&self, key: &str, member: &str) -> Result<bool> {
        let (key, member) = (key.to_string(), member.to_string());
        self.transact(move |state| {
            let added = state.sets.entry(key).or_default().insert(member);
            (added, added)
        })
        .await
    }

    async fn set_remove(&self, key: &str, member: &str) -> Result<bool> {
        let (key, member) = (key.to_string(), member.to_string());
        self.transact(move |state| {
            let removed = state.sets.get_mut(&key).is_some_and(|s| s.remove(&member));
            (removed, removed)
        })
        .await
    }

    async fn set_contains(&self, key: &str, member: &str) -> Result<bool> {
        let (key, member) = (key.to_string(), member.to_string());
        self.transact(move |state| {
            (state.sets.get(&key).is_some_and(|s| s.contains(&member)), false)
        })
        .await
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>> {
        let key = key.to_string();
        self.transact(move |state| {
            let members = state
                .sets
                .get(&key)
                .map(|s| s.iter().cloned().collect())
                .unwrap_or_default();
            (members, false)
        })
        .await
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let key = key.to_string();
        self.transact(move |state| (state.strings.get(&key).cloned(), false))
            .await
    }

    async fn compare_and_set(&self, key: &str, expected: Option<&str>, new: &str) -> Result<bool> {
        let (key, expected, new) = (key.to_string(), expected.map(str::to_string), new.to_string());
        self.transact(move |state| {
            if state.strings.get(&key) != expected.as_ref() {
                return (false, false);
            }
            state.strings.insert(key, new);
            (true, true)
        })
        .await
    }
}

/// Lua compare-and-set. ARGV: has_expected ("0"/"1"), expected, new.
const CAS_SCRIPT: &str = r#"
local current = redis.call('GET', KEYS[1])
if ARGV[1] == '0' then
  if current then return 0 end
elseif current ~= ARGV[2] then
  return 0
end
redis.call('SET', KEYS[1], ARGV[3])
return 1
"#;

/// [`StateStore`] on a Redis server, shared by every orchestrator process
/// on the host.
#[derive(Clone)]
pub struct RedisStore {
    conn: redis::aio::MultiplexedConnection,
    cas: std::sync::Arc<redis::Script>,
}

impl RedisStore {
    /// Connect to `url` (e.g. `redis://127.0.0.1/`).
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let conn = client.get_multiplexed_async_connection().await?;
        tracing::info!(url, "Connected to Redis");
        Ok(Self {
            conn,
            cas: std::sync::Arc::new(redis::Script::new(CAS_SCRIPT)),
        })
    }
}

#[async_trait]
impl StateStore for RedisStore {
    async fn set_add(&self, key: &str, member: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let added: i64 = conn.sadd(key, member).await?;
        Ok(added == 1)
    }

    async fn set_remove(&self, key: &str, member: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let removed: i64 = conn.srem(key, member).await?;
        Ok(removed == 1)
    }

    async fn set_contains(&self, key: &str, member: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        Ok(conn.sismember(key, member).await?)
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        Ok(conn.smembers(key).await?)
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        Ok(conn.get(key).await?)
    }

    async fn compare_and_set(&self, key: &str, expected: Option<&str>, new: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let written: i64 = self
            .cas
            .key(key)
            .arg(if expected.is_some() { "1" } else { "0" })
            .arg(expected.unwrap_or(""))
            .arg(new)
            .invoke_async(&mut conn)
            .await?;
        Ok(written == 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_set_add_reports_new_members() {
        let store = MemoryStore::new();
        assert!(store.set_add("s", "a").await.unwrap());
        assert!(!store.set_add("s", "a").await.unwrap());
        assert!(store.set_contains("s", "a").await.unwrap());
        assert!(!store.set_contains("s", "b").await.unwrap());
        assert!(!store.set_contains("other", "a").await.unwrap());
    }

    #[tokio::test]
    async fn test_set_remove_is_idempotent() {
        let store = MemoryStore::new();
        store.set_add("s", "a").await.unwrap();
        assert!(store.set_remove("s", "a").await.unwrap());
        assert!(!store.set_remove("s", "a").await.unwrap());
        assert!(!store.set_remove("missing", "a").await.unwrap());
        assert!(store.set_members("s").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_compare_and_set() {
        let store = MemoryStore::new();
        assert!(store.get("k").await.unwrap().is_none());

        // absent -> v1
        assert!(store.compare_and_set("k", None, "v1").await.unwrap());
        // absent expected but present
        assert!(!store.compare_and_set("k", None, "v2").await.unwrap());
        // stale expectation
        assert!(!store.compare_and_set("k", Some("v0"), "v2").await.unwrap());
        assert!(store.compare_and_set("k", Some("v1"), "v2").await.unwrap());
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("v2"));
    }

    #[tokio::test]
    async fn test_file_store_is_shared_between_handles() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state/cinder.json");
        let a = FileStore::open(&path).unwrap();
        let b = FileStore::open(&path).unwrap();

        assert!(a.set_add("ips", "172.16.0.2").await.unwrap());
        assert!(!b.set_add("ips", "172.16.0.2").await.unwrap());
        assert!(b.set_contains("ips", "172.16.0.2").await.unwrap());

        assert!(b.compare_and_set("list", None, "[]").await.unwrap());
        assert!(!a.compare_and_set("list", None, "[1]").await.unwrap());
        assert!(a.compare_and_set("list", Some("[]"), "[1]").await.unwrap());
        assert_eq!(b.get("list").await.unwrap().as_deref(), Some("[1]"));

        assert!(a.set_remove("ips", "172.16.0.2").await.unwrap());
        assert!(b.set_members("ips").await.unwrap().is_empty());
        assert!(path.exists());
    }

    #[tokio::test]
    async fn test_file_store_concurrent_adds_from_many_handles() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cinder.json");

        let mut tasks = Vec::new();
        for i in 0..16 {
            let store = FileStore::open(&path).unwrap();
            tasks.push(tokio::spawn(async move {
                store.set_add("s", &format!("m{}", i % 4)).await.unwrap()
            }));
        }
        let mut added = 0;
        for t in tasks {
            if t.await.unwrap() {
                added += 1;
            }
        }
        assert_eq!(added, 4);

        let store = FileStore::open(&path).unwrap();
        assert_eq!(store.set_members("s").await.unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_file_store_reads_leave_no_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cinder.json");
        let store = FileStore::open(&path).unwrap();

        assert!(store.get("k").await.unwrap().is_none());
        assert!(!store.set_remove("s", "x").await.unwrap());
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_file_store_rejects_corrupt_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cinder.json");
        std::fs::write(&path, "{not json").unwrap();

        let store = FileStore::open(&path).unwrap();
        assert!(matches!(
            store.set_add("s", "x").await,
            Err(CoreError::Json(_))
        ));
    }

    /// Needs a local server: `CINDER_TEST_REDIS=redis://127.0.0.1/`.
    #[tokio::test]
    #[ignore = "requires a running Redis server"]
    async fn test_redis_store_roundtrip() {
        let url = std::env::var("CINDER_TEST_REDIS")
            .unwrap_or_else(|_| "redis://127.0.0.1/".to_string());
        let store = RedisStore::connect(&url).await.expect("connect");
        let key = format!("cinder-test:{}", std::process::id());

        assert!(store.set_add(&key, "x").await.unwrap());
        assert!(!store.set_add(&key, "x").await.unwrap());
        assert!(store.set_remove(&key, "x").await.unwrap());

        let skey = format!("{key}:str");
        assert!(store.compare_and_set(&skey, None, "[]").await.unwrap());
        assert!(!store.compare_and_set(&skey, None, "[]").await.unwrap());
        assert!(store.compare_and_set(&skey, Some("[]"), "[1]").await.unwrap());
        assert_eq!(store.get(&skey).await.unwrap().as_deref(), Some("[1]"));

        let mut conn = store.conn.clone();
        let _: () = conn.del(&skey).await.unwrap();
    }
}
