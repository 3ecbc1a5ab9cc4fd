use crate::model::{MonitoredUser, RecordHistoryEntry};
use anyhow::Context;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::sync::{Mutex, RwLock};
use tracing::debug;

const WATCHLIST_PREFIX: &str = "watchlist/";
const HISTORY_PREFIX: &str = "history/";

/// 监控列表和录制历史的键值存储
#[async_trait]
pub trait Store: Send + Sync {
    async fn put(&self, key: &str, value: Value) -> anyhow::Result<()>;
    async fn get(&self, key: &str) -> anyhow::Result<Option<Value>>;
    /// 按键排序返回以 `prefix` 开头的条目
    async fn list(&self, prefix: &str) -> anyhow::Result<Vec<(String, Value)>>;
    async fn delete(&self, key: &str) -> anyhow::Result<bool>;
}

#[derive(Default)]
pub struct MemoryStore {
    map: RwLock<BTreeMap<String, Value>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn put(&self, key: &str, value: Value) -> anyhow::Result<()> {
        self.map.write().await.insert(key.to_string(), value);
        Ok(())
    }

    async fn get(&self, key: &str) -> anyhow::Result<Option<Value>> {
        Ok(self.map.read().await.get(key).cloned())
    }

    async fn list(&self, prefix: &str) -> anyhow::Result<Vec<(String, Value)>> {
        Ok(prefixed(&*self.map.read().await, prefix))
    }

    async fn delete(&self, key: &str) -> anyhow::Result<bool> {
        Ok(self.map.write().await.remove(key).is_some())
    }
}

/// 数据全部放在内存，每次修改后整体重写到一个 JSON 文件
pub struct JsonFileStore {
    path: PathBuf,
    map: Mutex<BTreeMap<String, Value>>,
}

impl JsonFileStore {
    pub async fn open<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let map = match tokio::fs::read_to_string(&path).await {
            Ok(content) if !content.trim().is_empty() => serde_json::from_str(&content)
                .with_context(|| format!("corrupt store file {}", path.display()))?,
            Ok(_) => BTreeMap::new(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e).context(format!("reading {}", path.display())),
        };
        Ok(Self {
            path,
            map: Mutex::new(map),
        })
    }

    async fn flush(&self, map: &BTreeMap<String, Value>) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, serde_json::to_vec_pretty(map)?).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        debug!("Store flushed to {:?} ({} keys)", self.path, map.len());
        Ok(())
    }
}

#[async_trait]
impl Store for JsonFileStore {
    async fn put(&self, key: &str, value: Value) -> anyhow::Result<()> {
        let mut map = self.map.lock().await;
        map.insert(key.to_string(), value);
        self.flush(&map).await
    }

    async fn get(&self, key: &str) -> anyhow::Result<Option<Value>> {
        Ok(self.map.lock().await.get(key).cloned())
    }

    async fn list(&self, prefix: &str) -> anyhow::Result<Vec<(String, Value)>> {
        Ok(prefixed(&*self.map.lock().await, prefix))
    }

    async fn delete(&self, key: &str) -> anyhow::Result<bool> {
        let mut map = self.map.lock().await;
        let removed = map.remove(key).is_some();
        if removed {
            self.flush(&map).await?;
        }
        Ok(removed)
    }
}

fn prefixed(map: &BTreeMap<String, Value>, prefix: &str) -> Vec<(String, Value)> {
    map.range(prefix.to_string()..)
        .take_while(|(k, _)| k.starts_with(prefix))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

pub async fn save_user(store: &dyn Store, user: &MonitoredUser) -> anyhow::Result<()> {
    let key = format!("{}{}", WATCHLIST_PREFIX, user.handle);
    store.put(&key, serde_json::to_value(user)?).await
}

pub async fn delete_user(store: &dyn Store, handle: &str) -> anyhow::Result<bool> {
    store.delete(&format!("{}{}", WATCHLIST_PREFIX, handle)).await
}

pub async fn load_watchlist(store: &dyn Store) -> anyhow::Result<Vec<MonitoredUser>> {
    store
        .list(WATCHLIST_PREFIX)
        .await?
        .into_iter()
        .map(|(key, value)| {
            serde_json::from_value(value).with_context(|| format!("bad watchlist entry {}", key))
        })
        .collect()
}

/// 历史记录的键按开始时间排序，按键遍历即为时间顺序
pub async fn append_history(store: &dyn Store, entry: &RecordHistoryEntry) -> anyhow::Result<()> {
    let key = format!(
        "{}{:013}-{}",
        HISTORY_PREFIX,
        entry.started_at.timestamp_millis().max(0),
        entry.handle
    );
    store.put(&key, serde_json::to_value(entry)?).await
}

/// 最新的在前
pub async fn load_history(
    store: &dyn Store,
    limit: usize,
) -> anyhow::Result<Vec<RecordHistoryEntry>> {
    let mut entries = store
        .list(HISTORY_PREFIX)
        .await?
        .into_iter()
        .rev()
        .take(limit)
        .map(|(key, value)| {
            serde_json::from_value(value).with_context(|| format!("bad history entry {}", key))
        })
        .collect::<anyhow::Result<Vec<RecordHistoryEntry>>>()?;
    entries.sort_by(|a, b| b.started_at.cmp(&a.started_at));
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Quality, RecordOutcome};
    use chrono::{TimeZone, Utc};

    fn entry(handle: &str, minute: u32) -> RecordHistoryEntry {
        RecordHistoryEntry {
            handle: handle.to_string(),
            title: "t".to_string(),
            file_path: PathBuf::from(format!("/rec/{}.flv", handle)),
            started_at: Utc.with_ymd_and_hms(2026, 1, 2, 3, minute, 0).unwrap(),
            duration_seconds: 60,
            size_bytes: 1024,
            outcome: RecordOutcome::Completed,
        }
    }

    #[tokio::test]
    async fn list_filters_by_prefix() {
        let store = MemoryStore::new();
        store.put("a/1", Value::from(1)).await.unwrap();
        store.put("b/1", Value::from(2)).await.unwrap();
        store.put("a/2", Value::from(3)).await.unwrap();
        let keys: Vec<String> = store.list("a/").await.unwrap().into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["a/1", "a/2"]);
        assert!(store.delete("a/1").await.unwrap());
        assert!(!store.delete("a/1").await.unwrap());
    }

    #[tokio::test]
    async fn history_is_newest_first() {
        let store = MemoryStore::new();
        append_history(&store, &entry("alice", 1)).await.unwrap();
        append_history(&store, &entry("bob", 5)).await.unwrap();
        append_history(&store, &entry("carol", 3)).await.unwrap();
        let history = load_history(&store, 10).await.unwrap();
        let handles: Vec<&str> = history.iter().map(|e| e.handle.as_str()).collect();
        assert_eq!(handles, vec!["bob", "carol", "alice"]);
        assert_eq!(load_history(&store, 1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn json_file_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.json");
        {
            let store = JsonFileStore::open(&path).await.unwrap();
            save_user(&store, &MonitoredUser::new("alice", Quality::High))
                .await
                .unwrap();
            save_user(&store, &MonitoredUser::new("bob", Quality::Low))
                .await
                .unwrap();
            assert!(delete_user(&store, "bob").await.unwrap());
            append_history(&store, &entry("alice", 7)).await.unwrap();
        }
        let store = JsonFileStore::open(&path).await.unwrap();
        let users = load_watchlist(&store).await.unwrap();
        assert_eq!(users, vec![MonitoredUser::new("alice", Quality::High)]);
        assert_eq!(load_history(&store, 10).await.unwrap(), vec![entry("alice", 7)]);
    }
}
