//! Typed facade over the shared key-value store.
//!
//! Every other component goes through [`KvStore`]; the backend is either
//! a remote store or the in-process [`MemoryStore`] used for tests and
//! storeless development runs. Values are marshalled as JSON. A `get` on
//! a missing key is not an error; it yields absent.

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use redis::{aio::ConnectionManager, AsyncCommands};
use serde::{de::DeserializeOwned, Serialize};
use tokio::{sync::Mutex, time::timeout};
use tracing::warn;

use crate::errors::Error;

/// Per-call ceiling on KV I/O.
pub const KV_TIMEOUT: Duration = Duration::from_secs(3);

#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get_raw(&self, key: &str) -> Result<Option<String>, Error>;
    async fn set_raw(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), Error>;
    async fn del(&self, key: &str) -> Result<(), Error>;
    async fn keys(&self, pattern: &str) -> Result<Vec<String>, Error>;

    /// Returns whether the member was newly added.
    async fn sadd(&self, key: &str, member: &str) -> Result<bool, Error>;
    /// Returns whether the member was present.
    async fn srem(&self, key: &str, member: &str) -> Result<bool, Error>;
    async fn smembers(&self, key: &str) -> Result<Vec<String>, Error>;
    async fn sismember(&self, key: &str, member: &str) -> Result<bool, Error>;

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<(), Error>;
    async fn hset_multi(&self, key: &str, entries: &[(String, String)]) -> Result<(), Error>;
    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, Error>;
    async fn hdel(&self, key: &str, field: &str) -> Result<(), Error>;
    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>, Error>;

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), Error>;
    async fn exists(&self, key: &str) -> Result<bool, Error>;
}

/// Cloneable handle adding JSON marshalling on top of a backend.
#[derive(Clone)]
pub struct KvStore {
    backend: Arc<dyn KeyValueStore>,
}

impl KvStore {
    #[must_use]
    pub fn new(backend: Arc<dyn KeyValueStore>) -> Self {
        Self { backend }
    }

    #[must_use]
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryStore::new()))
    }

    pub async fn connect(url: &str) -> Result<Self, Error> {
        Ok(Self::new(Arc::new(RedisStore::connect(url).await?)))
    }

    /// Fetches and deserializes a JSON value. A missing key, and a value
    /// that no longer deserializes, both yield absent; the latter is
    /// logged, since it means a stale or foreign write.
    pub async fn get<T>(&self, key: &str) -> Result<Option<T>, Error>
    where
        T: DeserializeOwned,
    {
        let Some(raw) = self.backend.get_raw(key).await? else {
            return Ok(None);
        };

        match serde_json::from_str(&raw) {
            Ok(value) => Ok(Some(value)),
            Err(e) => {
                warn!(%key, error = %e, "Discarding malformed cache entry.");
                Ok(None)
            }
        }
    }

    pub async fn set<T>(&self, key: &str, value: &T, ttl: Option<Duration>) -> Result<(), Error>
    where
        T: Serialize,
    {
        let raw = serde_json::to_string(value).map_err(|e| Error::Cache {
            operation: "serialize",
            key: key.to_owned(),
            source: Box::new(e),
        })?;

        self.backend.set_raw(key, &raw, ttl).await
    }

    pub async fn del(&self, key: &str) -> Result<(), Error> {
        self.backend.del(key).await
    }

    pub async fn keys(&self, pattern: &str) -> Result<Vec<String>, Error> {
        self.backend.keys(pattern).await
    }

    pub async fn sadd(&self, key: &str, member: &str) -> Result<bool, Error> {
        self.backend.sadd(key, member).await
    }

    pub async fn srem(&self, key: &str, member: &str) -> Result<bool, Error> {
        self.backend.srem(key, member).await
    }

    pub async fn smembers(&self, key: &str) -> Result<Vec<String>, Error> {
        self.backend.smembers(key).await
    }

    pub async fn sismember(&self, key: &str, member: &str) -> Result<bool, Error> {
        self.backend.sismember(key, member).await
    }

    pub async fn hset(&self, key: &str, field: &str, value: &str) -> Result<(), Error> {
        self.backend.hset(key, field, value).await
    }

    pub async fn hset_multi(&self, key: &str, entries: &[(String, String)]) -> Result<(), Error> {
        self.backend.hset_multi(key, entries).await
    }

    pub async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, Error> {
        self.backend.hget(key, field).await
    }

    pub async fn hdel(&self, key: &str, field: &str) -> Result<(), Error> {
        self.backend.hdel(key, field).await
    }

    pub async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>, Error> {
        self.backend.hgetall(key).await
    }

    pub async fn expire(&self, key: &str, ttl: Duration) -> Result<(), Error> {
        self.backend.expire(key, ttl).await
    }

    pub async fn exists(&self, key: &str) -> Result<bool, Error> {
        self.backend.exists(key).await
    }
}

/// Remote backend over a multiplexed connection manager.
pub struct RedisStore {
    manager: ConnectionManager,
}

impl RedisStore {
    pub async fn connect(url: &str) -> Result<Self, Error> {
        let client = redis::Client::open(url).map_err(|e| Error::Cache {
            operation: "connect",
            key: String::new(),
            source: Box::new(e),
        })?;

        let manager = timeout(KV_TIMEOUT, client.get_connection_manager())
            .await
            .map_err(|e| Error::Cache {
                operation: "connect",
                key: String::new(),
                source: Box::new(e),
            })?
            .map_err(|e| Error::Cache {
                operation: "connect",
                key: String::new(),
                source: Box::new(e),
            })?;

        Ok(Self { manager })
    }

    async fn run<T, F>(operation: &'static str, key: &str, fut: F) -> Result<T, Error>
    where
        F: std::future::Future<Output = redis::RedisResult<T>>,
    {
        match timeout(KV_TIMEOUT, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(Error::Cache {
                operation,
                key: key.to_owned(),
                source: Box::new(e),
            }),
            Err(e) => Err(Error::Cache {
                operation,
                key: key.to_owned(),
                source: Box::new(e),
            }),
        }
    }
}

#[async_trait]
impl KeyValueStore for RedisStore {
    async fn get_raw(&self, key: &str) -> Result<Option<String>, Error> {
        let mut con = self.manager.clone();
        Self::run("get", key, con.get(key)).await
    }

    async fn set_raw(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), Error> {
        let mut con = self.manager.clone();

        match ttl {
            Some(ttl) => {
                let secs = ttl.as_secs().max(1);
                Self::run("set", key, con.set_ex(key, value, secs)).await
            }
            None => Self::run("set", key, con.set(key, value)).await,
        }
    }

    async fn del(&self, key: &str) -> Result<(), Error> {
        let mut con = self.manager.clone();
        Self::run("del", key, con.del(key)).await
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>, Error> {
        let mut con = self.manager.clone();
        Self::run("keys", pattern, con.keys(pattern)).await
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<bool, Error> {
        let mut con = self.manager.clone();
        let added: i64 = Self::run("sadd", key, con.sadd(key, member)).await?;
        Ok(added > 0)
    }

    async fn srem(&self, key: &str, member: &str) -> Result<bool, Error> {
        let mut con = self.manager.clone();
        let removed: i64 = Self::run("srem", key, con.srem(key, member)).await?;
        Ok(removed > 0)
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>, Error> {
        let mut con = self.manager.clone();
        Self::run("smembers", key, con.smembers(key)).await
    }

    async fn sismember(&self, key: &str, member: &str) -> Result<bool, Error> {
        let mut con = self.manager.clone();
        Self::run("sismember", key, con.sismember(key, member)).await
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<(), Error> {
        let mut con = self.manager.clone();
        Self::run("hset", key, con.hset(key, field, value)).await
    }

    async fn hset_multi(&self, key: &str, entries: &[(String, String)]) -> Result<(), Error> {
        if entries.is_empty() {
            return Ok(());
        }

        let mut con = self.manager.clone();
        Self::run("hset_multi", key, con.hset_multiple(key, entries)).await
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, Error> {
        let mut con = self.manager.clone();
        Self::run("hget", key, con.hget(key, field)).await
    }

    async fn hdel(&self, key: &str, field: &str) -> Result<(), Error> {
        let mut con = self.manager.clone();
        Self::run("hdel", key, con.hdel(key, field)).await
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>, Error> {
        let mut con = self.manager.clone();
        Self::run("hgetall", key, con.hgetall(key)).await
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), Error> {
        let mut con = self.manager.clone();
        let secs = i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX);
        Self::run("expire", key, con.expire(key, secs)).await
    }

    async fn exists(&self, key: &str) -> Result<bool, Error> {
        let mut con = self.manager.clone();
        Self::run("exists", key, con.exists(key)).await
    }
}

#[derive(Debug, Clone)]
enum EntryData {
    Value(String),
    Set(HashSet<String>),
    Hash(HashMap<String, String>),
}

#[derive(Debug, Clone)]
struct Entry {
    data: EntryData,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Instant::now() >= at)
    }
}

/// In-process backend with the same semantics as the remote store,
/// including TTL expiry and glob-style `keys` patterns.
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn type_error(operation: &'static str, key: &str) -> Error {
        Error::Cache {
            operation,
            key: key.to_owned(),
            source: format!("wrong entry type for {operation}").into(),
        }
    }
}

fn glob_match(pattern: &str, key: &str) -> bool {
    match pattern.split_once('*') {
        None => pattern == key,
        Some((prefix, rest)) => match key.strip_prefix(prefix) {
            None => false,
            Some(remaining) => {
                if rest.is_empty() {
                    return true;
                }

                (0..=remaining.len())
                    .filter(|&i| remaining.is_char_boundary(i))
                    .any(|i| glob_match(rest, &remaining[i..]))
            }
        },
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get_raw(&self, key: &str) -> Result<Option<String>, Error> {
        let mut entries = self.entries.lock().await;

        match entries.get(key) {
            Some(entry) if entry.is_expired() => {
                entries.remove(key);
                Ok(None)
            }
            Some(Entry {
                data: EntryData::Value(value),
                ..
            }) => Ok(Some(value.clone())),
            Some(_) => Err(Self::type_error("get", key)),
            None => Ok(None),
        }
    }

    async fn set_raw(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), Error> {
        let mut entries = self.entries.lock().await;
        entries.insert(
            key.to_owned(),
            Entry {
                data: EntryData::Value(value.to_owned()),
                expires_at: ttl.map(|t| Instant::now() + t),
            },
        );
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<(), Error> {
        self.entries.lock().await.remove(key);
        Ok(())
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>, Error> {
        let entries = self.entries.lock().await;
        Ok(entries
            .iter()
            .filter(|(key, entry)| !entry.is_expired() && glob_match(pattern, key))
            .map(|(key, _)| key.clone())
            .collect())
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<bool, Error> {
        let mut entries = self.entries.lock().await;

        let entry = entries
            .entry(key.to_owned())
            .and_modify(|e| {
                if e.is_expired() {
                    e.data = EntryData::Set(HashSet::new());
                    e.expires_at = None;
                }
            })
            .or_insert_with(|| Entry {
                data: EntryData::Set(HashSet::new()),
                expires_at: None,
            });

        match &mut entry.data {
            EntryData::Set(set) => Ok(set.insert(member.to_owned())),
            _ => Err(Self::type_error("sadd", key)),
        }
    }

    async fn srem(&self, key: &str, member: &str) -> Result<bool, Error> {
        let mut entries = self.entries.lock().await;

        match entries.get_mut(key) {
            Some(entry) if entry.is_expired() => {
                entries.remove(key);
                Ok(false)
            }
            Some(Entry {
                data: EntryData::Set(set),
                ..
            }) => {
                let removed = set.remove(member);
                if set.is_empty() {
                    entries.remove(key);
                }
                Ok(removed)
            }
            Some(_) => Err(Self::type_error("srem", key)),
            None => Ok(false),
        }
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>, Error> {
        let entries = self.entries.lock().await;

        match entries.get(key) {
            Some(entry) if entry.is_expired() => Ok(Vec::new()),
            Some(Entry {
                data: EntryData::Set(set),
                ..
            }) => Ok(set.iter().cloned().collect()),
            Some(_) => Err(Self::type_error("smembers", key)),
            None => Ok(Vec::new()),
        }
    }

    async fn sismember(&self, key: &str, member: &str) -> Result<bool, Error> {
        let entries = self.entries.lock().await;

        match entries.get(key) {
            Some(entry) if entry.is_expired() => Ok(false),
            Some(Entry {
                data: EntryData::Set(set),
                ..
            }) => Ok(set.contains(member)),
            Some(_) => Err(Self::type_error("sismember", key)),
            None => Ok(false),
        }
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<(), Error> {
        let mut entries = self.entries.lock().await;

        let entry = entries
            .entry(key.to_owned())
            .and_modify(|e| {
                if e.is_expired() {
                    e.data = EntryData::Hash(HashMap::new());
                    e.expires_at = None;
                }
            })
            .or_insert_with(|| Entry {
                data: EntryData::Hash(HashMap::new()),
                expires_at: None,
            });

        match &mut entry.data {
            EntryData::Hash(map) => {
                map.insert(field.to_owned(), value.to_owned());
                Ok(())
            }
            _ => Err(Self::type_error("hset", key)),
        }
    }

    async fn hset_multi(&self, key: &str, entries: &[(String, String)]) -> Result<(), Error> {
        for (field, value) in entries {
            self.hset(key, field, value).await?;
        }

        Ok(())
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, Error> {
        let entries = self.entries.lock().await;

        match entries.get(key) {
            Some(entry) if entry.is_expired() => Ok(None),
            Some(Entry {
                data: EntryData::Hash(map),
                ..
            }) => Ok(map.get(field).cloned()),
            Some(_) => Err(Self::type_error("hget", key)),
            None => Ok(None),
        }
    }

    async fn hdel(&self, key: &str, field: &str) -> Result<(), Error> {
        let mut entries = self.entries.lock().await;

        if let Some(Entry {
            data: EntryData::Hash(map),
            ..
        }) = entries.get_mut(key)
        {
            map.remove(field);
        }

        Ok(())
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>, Error> {
        let entries = self.entries.lock().await;

        match entries.get(key) {
            Some(entry) if entry.is_expired() => Ok(HashMap::new()),
            Some(Entry {
                data: EntryData::Hash(map),
                ..
            }) => Ok(map.clone()),
            Some(_) => Err(Self::type_error("hgetall", key)),
            None => Ok(HashMap::new()),
        }
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), Error> {
        let mut entries = self.entries.lock().await;

        if let Some(entry) = entries.get_mut(key) {
            entry.expires_at = Some(Instant::now() + ttl);
        }

        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool, Error> {
        let entries = self.entries.lock().await;
        Ok(entries.get(key).is_some_and(|e| !e.is_expired()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Marker {
        minutes: i64,
    }

    #[tokio::test]
    async fn get_on_missing_key_is_absent_not_error() {
        let kv = KvStore::in_memory();
        assert_eq!(kv.get::<Marker>("nope").await.unwrap(), None);
    }

    #[tokio::test]
    async fn json_round_trip() {
        let kv = KvStore::in_memory();
        kv.set("m", &Marker { minutes: 5 }, None).await.unwrap();
        assert_eq!(
            kv.get::<Marker>("m").await.unwrap(),
            Some(Marker { minutes: 5 })
        );
    }

    #[tokio::test]
    async fn malformed_entries_read_as_absent() {
        let kv = KvStore::in_memory();
        kv.set("m", &"not a marker", None).await.unwrap();
        assert_eq!(kv.get::<Marker>("m").await.unwrap(), None);
    }

    #[tokio::test]
    async fn ttl_expires_values() {
        let kv = KvStore::in_memory();
        kv.set("m", &Marker { minutes: 1 }, Some(Duration::from_millis(20)))
            .await
            .unwrap();
        assert!(kv.exists("m").await.unwrap());

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(kv.get::<Marker>("m").await.unwrap(), None);
        assert!(!kv.exists("m").await.unwrap());
    }

    #[tokio::test]
    async fn set_operations_behave_like_the_remote_store() {
        let kv = KvStore::in_memory();

        assert!(kv.sadd("s", "a").await.unwrap());
        assert!(!kv.sadd("s", "a").await.unwrap());
        assert!(kv.sadd("s", "b").await.unwrap());
        assert!(kv.sismember("s", "a").await.unwrap());

        let mut members = kv.smembers("s").await.unwrap();
        members.sort();
        assert_eq!(members, vec!["a", "b"]);

        assert!(kv.srem("s", "a").await.unwrap());
        assert!(!kv.srem("s", "a").await.unwrap());

        // Removing the last member drops the key entirely.
        assert!(kv.srem("s", "b").await.unwrap());
        assert!(!kv.exists("s").await.unwrap());
    }

    #[tokio::test]
    async fn hash_operations() {
        let kv = KvStore::in_memory();

        kv.hset("h", "UC1", "Pekora").await.unwrap();
        kv.hset_multi(
            "h",
            &[
                ("UC2".to_owned(), "Aqua".to_owned()),
                ("UC3".to_owned(), "Fubuki".to_owned()),
            ],
        )
        .await
        .unwrap();
        assert_eq!(kv.hget("h", "UC1").await.unwrap(), Some("Pekora".into()));
        assert_eq!(kv.hget("h", "UC3").await.unwrap(), Some("Fubuki".into()));
        assert_eq!(kv.hgetall("h").await.unwrap().len(), 3);

        kv.hdel("h", "UC1").await.unwrap();
        assert_eq!(kv.hget("h", "UC1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn keys_supports_glob_patterns() {
        let kv = KvStore::in_memory();
        kv.set("member:a", &1, None).await.unwrap();
        kv.set("member:b", &2, None).await.unwrap();
        kv.set("other:c", &3, None).await.unwrap();

        let mut keys = kv.keys("member:*").await.unwrap();
        keys.sort();
        assert_eq!(keys, vec!["member:a", "member:b"]);
    }

    #[test]
    fn glob_matching_rules() {
        assert!(glob_match("member:*", "member:a"));
        assert!(glob_match("*", "anything"));
        assert!(glob_match("a*c", "abc"));
        assert!(glob_match("a*c", "ac"));
        assert!(!glob_match("a*c", "ab"));
        assert!(!glob_match("member:*", "other:a"));
        assert!(glob_match("exact", "exact"));
    }
}
