//! Relay storage (store-and-forward)
//!
//! Rows live in memory behind a lock and are persisted to a single JSON file.
//! Reads return cloned snapshots, so a concurrent `cleanup_expired` can never
//! pull a row out from under a caller. Writes mark the store dirty; a
//! background flusher coalesces bursts into one write after a short debounce.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use mumblechat_core::{now_millis, RelayRequest, StoredMessage};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::Result;

/// Persisted counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayStats {
    #[serde(default)]
    pub stored: u64,
    #[serde(default)]
    pub delivered: u64,
    #[serde(default)]
    pub expired: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublicKeyRecord {
    /// Hex-encoded public key
    pub public_key: String,
    pub updated_at: u64,
}

#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Data file; `None` keeps everything in memory
    pub path: Option<PathBuf>,
    pub max_ttl_days: u32,
    pub flush_debounce: Duration,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: None,
            max_ttl_days: 30,
            flush_debounce: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoreFile {
    #[serde(default)]
    messages: Vec<StoredMessage>,
    #[serde(default)]
    stats: RelayStats,
    #[serde(default)]
    public_keys: HashMap<String, PublicKeyRecord>,
}

#[derive(Default)]
struct StoreState {
    messages: HashMap<String, StoredMessage>,
    stats: RelayStats,
    public_keys: HashMap<String, PublicKeyRecord>,
}

struct StoreInner {
    config: StorageConfig,
    state: RwLock<StoreState>,
    dirty: Notify,
    write_lock: tokio::sync::Mutex<()>,
}

/// Handle to the message store; cheap to clone
#[derive(Clone)]
pub struct RelayStorage {
    inner: Arc<StoreInner>,
}

impl RelayStorage {
    /// Open the store, loading the data file if present.
    ///
    /// A corrupt file is moved aside and the store starts empty.
    pub fn open(config: StorageConfig) -> Result<Self> {
        let mut state = StoreState::default();
        if let Some(path) = &config.path {
            if path.exists() {
                let content = std::fs::read_to_string(path)?;
                match serde_json::from_str::<StoreFile>(&content) {
                    Ok(file) => {
                        state.messages = file
                            .messages
                            .into_iter()
                            .map(|m| (m.id.clone(), m))
                            .collect();
                        state.stats = file.stats;
                        state.public_keys = file.public_keys;
                    }
                    Err(e) => {
                        let aside = path.with_extension("json.corrupt");
                        warn!("Relay store {:?} is corrupt ({}), moving to {:?}", path, e, aside);
                        std::fs::rename(path, &aside)?;
                    }
                }
            }
            info!(
                "Relay store opened at {:?} ({} messages)",
                path,
                state.messages.len()
            );
        }

        Ok(Self {
            inner: Arc::new(StoreInner {
                config,
                state: RwLock::new(state),
                dirty: Notify::new(),
                write_lock: tokio::sync::Mutex::new(()),
            }),
        })
    }

    /// Memory-only store
    pub fn in_memory(max_ttl_days: u32) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                config: StorageConfig {
                    max_ttl_days,
                    ..Default::default()
                },
                state: RwLock::new(StoreState::default()),
                dirty: Notify::new(),
                write_lock: tokio::sync::Mutex::new(()),
            }),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.inner.config.path.as_deref()
    }

    /// Append a row with `delivered=false`.
    ///
    /// Returns false if a row with the same id is already held.
    pub fn store_message(&self, mut msg: StoredMessage) -> bool {
        msg.delivered = false;
        msg.delivered_at = None;
        {
            let mut state = self.inner.state.write();
            if state.messages.contains_key(&msg.id) {
                return false;
            }
            debug!("Storing message {} for {}", msg.id, short_hash(&msg.to));
            state.messages.insert(msg.id.clone(), msg);
            state.stats.stored += 1;
        }
        self.mark_dirty();
        true
    }

    /// Store a relay request received now, clamping its TTL
    pub fn store_relay_request(&self, request: &RelayRequest) -> StoredMessage {
        self.store_relay_request_at(request, now_millis())
    }

    pub fn store_relay_request_at(&self, request: &RelayRequest, now_ms: u64) -> StoredMessage {
        let msg = StoredMessage::from_relay_request(request, now_ms, self.inner.config.max_ttl_days);
        self.store_message(msg.clone());
        msg
    }

    /// Undelivered, unexpired rows for `recipient`, oldest first
    pub fn get_pending_messages(&self, recipient: &str) -> Vec<StoredMessage> {
        self.get_pending_messages_at(recipient, now_millis())
    }

    pub fn get_pending_messages_at(&self, recipient: &str, now_ms: u64) -> Vec<StoredMessage> {
        let mut out: Vec<StoredMessage> = self
            .inner
            .state
            .read()
            .messages
            .values()
            .filter(|m| m.to == recipient && !m.delivered && !m.is_expired(now_ms))
            .cloned()
            .collect();
        out.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id)));
        out
    }

    pub fn get(&self, id: &str) -> Option<StoredMessage> {
        self.inner.state.read().messages.get(id).cloned()
    }

    /// Idempotent; returns true only on the first transition
    pub fn mark_delivered(&self, id: &str) -> bool {
        self.mark_delivered_at(id, now_millis())
    }

    pub fn mark_delivered_at(&self, id: &str, now_ms: u64) -> bool {
        let changed = {
            let mut guard = self.inner.state.write();
            let state = &mut *guard;
            match state.messages.get_mut(id) {
                Some(msg) if !msg.delivered => {
                    msg.delivered = true;
                    msg.delivered_at = Some(now_ms);
                    state.stats.delivered += 1;
                    true
                }
                _ => false,
            }
        };
        if changed {
            self.mark_dirty();
        }
        changed
    }

    /// Remove rows past `expires_at`; returns how many were removed
    pub fn cleanup_expired(&self) -> usize {
        self.cleanup_expired_at(now_millis())
    }

    pub fn cleanup_expired_at(&self, now_ms: u64) -> usize {
        let removed = {
            let mut state = self.inner.state.write();
            let before = state.messages.len();
            state.messages.retain(|_, m| !m.is_expired(now_ms));
            let removed = before - state.messages.len();
            state.stats.expired += removed as u64;
            removed
        };
        if removed > 0 {
            debug!("Purged {} expired messages", removed);
            self.mark_dirty();
        }
        removed
    }

    /// Last write wins
    pub fn put_public_key(&self, address: &str, public_key: &str) {
        self.inner.state.write().public_keys.insert(
            address.to_lowercase(),
            PublicKeyRecord {
                public_key: public_key.to_string(),
                updated_at: now_millis(),
            },
        );
        self.mark_dirty();
    }

    pub fn get_public_key(&self, address: &str) -> Option<PublicKeyRecord> {
        self.inner
            .state
            .read()
            .public_keys
            .get(&address.to_lowercase())
            .cloned()
    }

    pub fn stats(&self) -> RelayStats {
        self.inner.state.read().stats
    }

    /// Rows currently held, delivered or not
    pub fn len(&self) -> usize {
        self.inner.state.read().messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn mark_dirty(&self) {
        if self.inner.config.path.is_some() {
            self.inner.dirty.notify_one();
        }
    }

    /// Write the data file now (temp file + rename)
    pub async fn flush(&self) -> Result<()> {
        let Some(path) = self.inner.config.path.clone() else {
            return Ok(());
        };
        let _guard = self.inner.write_lock.lock().await;

        let content = {
            let state = self.inner.state.read();
            let mut messages: Vec<StoredMessage> = state.messages.values().cloned().collect();
            messages.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id)));
            let file = StoreFile {
                messages,
                stats: state.stats,
                public_keys: state.public_keys.clone(),
            };
            serde_json::to_vec_pretty(&file)?
        };

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, content).await?;
        tokio::fs::rename(&tmp, &path).await?;
        debug!("Relay store flushed to {:?}", path);
        Ok(())
    }

    /// Background task that flushes after each burst of writes
    pub fn spawn_flusher(&self) -> JoinHandle<()> {
        let store = self.clone();
        tokio::spawn(async move {
            loop {
                store.inner.dirty.notified().await;
                tokio::time::sleep(store.inner.config.flush_debounce).await;
                if let Err(e) = store.flush().await {
                    warn!("Relay store flush failed: {}", e);
                }
            }
        })
    }
}

/// First 12 characters, for logs
fn short_hash(h: &str) -> &str {
    match h.char_indices().nth(12) {
        Some((end, _)) => &h[..end],
        None => h,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mumblechat_core::DAY_MS;

    fn temp_file(name: &str) -> PathBuf {
        std::env::temp_dir()
            .join(format!("mumblechat-relay-store-{}-{}", name, std::process::id()))
            .join("messages")
            .join("relay.json")
    }

    fn row(id: &str, to: &str, ts: u64, expires_at: u64) -> StoredMessage {
        StoredMessage {
            id: id.to_string(),
            from: "sender".to_string(),
            to: to.to_string(),
            encrypted_content: vec![1, 2, 3],
            timestamp: ts,
            expires_at,
            delivered: false,
            delivered_at: None,
        }
    }

    #[test]
    fn test_pending_filters_recipient_delivered_and_expired() {
        let store = RelayStorage::in_memory(30);
        store.store_message(row("a", "bob", 1, 1_000));
        store.store_message(row("b", "bob", 2, 50));
        store.store_message(row("c", "carol", 3, 1_000));
        store.store_message(row("d", "bob", 4, 1_000));
        store.mark_delivered_at("d", 10);

        // "b" is expired but not yet purged: still never returned
        let pending = store.get_pending_messages_at("bob", 100);
        let ids: Vec<&str> = pending.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["a"]);
        assert_eq!(store.len(), 4);
    }

    #[test]
    fn test_expiry_boundary() {
        let store = RelayStorage::in_memory(30);
        store.store_message(row("a", "bob", 1, 100));
        assert_eq!(store.get_pending_messages_at("bob", 99).len(), 1);
        assert!(store.get_pending_messages_at("bob", 100).is_empty());
    }

    #[test]
    fn test_mark_delivered_idempotent() {
        let store = RelayStorage::in_memory(30);
        store.store_message(row("a", "bob", 1, 1_000));
        assert!(store.mark_delivered_at("a", 5));
        assert!(!store.mark_delivered_at("a", 6));
        assert!(!store.mark_delivered("missing"));
        let msg = store.get("a").unwrap();
        assert!(msg.delivered);
        assert_eq!(msg.delivered_at, Some(5));
        assert_eq!(store.stats().delivered, 1);
    }

    #[test]
    fn test_duplicate_id_not_stored_twice() {
        let store = RelayStorage::in_memory(30);
        assert!(store.store_message(row("a", "bob", 1, 1_000)));
        assert!(!store.store_message(row("a", "bob", 2, 2_000)));
        assert_eq!(store.stats().stored, 1);
        assert_eq!(store.get("a").unwrap().timestamp, 1);
    }

    #[test]
    fn test_cleanup_and_snapshot() {
        let store = RelayStorage::in_memory(30);
        store.store_message(row("a", "bob", 1, 100));
        store.store_message(row("b", "bob", 2, 1_000));

        let snapshot = store.get_pending_messages_at("bob", 50);
        assert_eq!(store.cleanup_expired_at(150), 1);
        // rows already handed out stay intact
        assert_eq!(snapshot.len(), 2);
        assert!(store.get("a").is_none());
        assert_eq!(store.stats().expired, 1);
    }

    #[test]
    fn test_relay_request_ttl_clamped() {
        let store = RelayStorage::in_memory(30);
        let req = RelayRequest {
            message_id: "r".to_string(),
            recipient_key_hash: "bob".to_string(),
            sender_key_hash: "alice".to_string(),
            encrypted_blob: vec![],
            ttl_days: 90,
            timestamp: 0,
            signature: String::new(),
        };
        let msg = store.store_relay_request_at(&req, 1_000);
        assert_eq!(msg.expires_at, 1_000 + 30 * DAY_MS);
        assert_eq!(msg.from, "alice");
    }

    #[test]
    fn test_seven_day_ttl_window() {
        let store = RelayStorage::in_memory(30);
        let t0 = 1_700_000_000_000;
        let req = RelayRequest {
            message_id: "week".to_string(),
            recipient_key_hash: "bob".to_string(),
            sender_key_hash: "alice".to_string(),
            encrypted_blob: vec![5],
            ttl_days: 7,
            timestamp: t0,
            signature: String::new(),
        };
        store.store_relay_request_at(&req, t0);

        assert_eq!(store.get_pending_messages_at("bob", t0 + 6 * DAY_MS).len(), 1);
        assert!(store.get_pending_messages_at("bob", t0 + 8 * DAY_MS).is_empty());
        assert_eq!(store.cleanup_expired_at(t0 + 6 * DAY_MS), 0);
        assert_eq!(store.cleanup_expired_at(t0 + 8 * DAY_MS), 1);
        assert!(store.get("week").is_none());
    }

    #[test]
    fn test_multibyte_recipient_does_not_panic() {
        assert_eq!(short_hash("abc"), "abc");
        assert_eq!(short_hash("0123456789abcdef"), "0123456789ab");
        let recipient = "ééééééééééééé";
        assert_eq!(short_hash(recipient), "éééééééééééé");

        let store = RelayStorage::in_memory(30);
        assert!(store.store_message(row("m", recipient, 1, 1_000)));
        assert_eq!(store.get_pending_messages_at(recipient, 10).len(), 1);
    }

    #[test]
    fn test_public_keys_last_write_wins() {
        let store = RelayStorage::in_memory(30);
        store.put_public_key("0xABC", "k1");
        store.put_public_key("0xabc", "k2");
        assert_eq!(store.get_public_key("0xAbC").unwrap().public_key, "k2");
    }

    #[tokio::test]
    async fn test_flush_and_reopen() {
        let path = temp_file("reopen");
        let config = StorageConfig {
            path: Some(path.clone()),
            ..Default::default()
        };
        let store = RelayStorage::open(config.clone()).unwrap();
        store.store_message(row("a", "bob", 1, u64::MAX));
        store.mark_delivered("a");
        store.store_message(row("b", "bob", 2, u64::MAX));
        store.put_public_key("0xabc", "k");
        store.flush().await.unwrap();

        let reopened = RelayStorage::open(config).unwrap();
        assert_eq!(reopened.len(), 2);
        assert_eq!(reopened.stats().stored, 2);
        assert_eq!(reopened.stats().delivered, 1);
        assert_eq!(reopened.get_pending_messages("bob").len(), 1);
        assert!(reopened.get_public_key("0xabc").is_some());

        let _ = std::fs::remove_dir_all(path.parent().unwrap().parent().unwrap());
    }

    #[tokio::test]
    async fn test_debounced_flusher_writes_file() {
        let path = temp_file("debounce");
        let store = RelayStorage::open(StorageConfig {
            path: Some(path.clone()),
            max_ttl_days: 30,
            flush_debounce: Duration::from_millis(20),
        })
        .unwrap();
        let flusher = store.spawn_flusher();
        for i in 0..10 {
            store.store_message(row(&format!("m{}", i), "bob", i, u64::MAX));
        }

        let mut written = false;
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            if let Ok(content) = std::fs::read_to_string(&path) {
                if content.contains("\"m9\"") {
                    written = true;
                    break;
                }
            }
        }
        flusher.abort();
        assert!(written);
        let _ = std::fs::remove_dir_all(path.parent().unwrap().parent().unwrap());
    }

    #[test]
    fn test_corrupt_file_moved_aside() {
        let path = temp_file("corrupt");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "not json").unwrap();
        let store = RelayStorage::open(StorageConfig {
            path: Some(path.clone()),
            ..Default::default()
        })
        .unwrap();
        assert!(store.is_empty());
        assert!(path.with_extension("json.corrupt").exists());
        let _ = std::fs::remove_dir_all(path.parent().unwrap().parent().unwrap());
    }
}
