//! Durable session snapshots. One JSON document holds every persisted
//! session plus the per-platform sticky post ids; writes go to a sibling
//! temp file and are renamed into place so a crash never leaves a torn
//! file. A missing or corrupt file loads as an empty store.

use std::collections::HashMap;
use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::session::SessionKey;
use crate::usage::UsageStats;
use crate::worktree::WorktreeInfo;

const STORE_VERSION: u32 = 2;

/// Projection of a session suitable for JSON storage: identity and policy,
/// no timers, no process handles.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedSession {
    pub session_id: String,
    pub platform_id: String,
    pub thread_id: String,
    pub agent_session_id: Uuid,
    pub started_by: String,
    pub started_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub session_number: u64,
    pub working_dir: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worktree: Option<WorktreeInfo>,
    pub allowed_users: Vec<String>,
    #[serde(default)]
    pub force_interactive_permissions: bool,
    #[serde(default)]
    pub was_interrupted: bool,
    #[serde(default)]
    pub resume_fail_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_start_post_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lifecycle_post_id: Option<String>,
    #[serde(default)]
    pub message_count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<UsageStats>,
}

impl PersistedSession {
    pub fn key(&self) -> SessionKey {
        SessionKey {
            platform_id: self.platform_id.clone(),
            thread_id: self.thread_id.clone(),
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreDoc {
    version: u32,
    #[serde(default)]
    sessions: HashMap<String, PersistedSession>,
    #[serde(default)]
    sticky_post_ids: HashMap<String, String>,
}

pub struct SessionStore {
    path: PathBuf,
    doc: Mutex<StoreDoc>,
}

impl SessionStore {
    /// Load the store, tolerating a missing or unreadable file. A document
    /// with an unknown version is treated as empty, but the file on disk is
    /// left untouched until the first save.
    pub async fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let doc = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => parse_doc(&raw),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => empty_doc(),
            Err(e) => {
                tracing::warn!("could not read session store {}: {e}", path.display());
                empty_doc()
            }
        };
        Self {
            path,
            doc: Mutex::new(doc),
        }
    }

    pub async fn sessions(&self) -> Vec<PersistedSession> {
        let doc = self.doc.lock().await;
        let mut sessions: Vec<PersistedSession> = doc.sessions.values().cloned().collect();
        sessions.sort_by_key(|s| s.session_number);
        sessions
    }

    pub async fn get(&self, key: &SessionKey) -> Option<PersistedSession> {
        self.doc.lock().await.sessions.get(&key.to_string()).cloned()
    }

    pub async fn save(&self, session: PersistedSession) -> std::io::Result<()> {
        let mut doc = self.doc.lock().await;
        doc.sessions.insert(session.session_id.clone(), session);
        self.write(&doc).await
    }

    pub async fn remove(&self, key: &SessionKey) -> std::io::Result<()> {
        let mut doc = self.doc.lock().await;
        if doc.sessions.remove(&key.to_string()).is_none() {
            return Ok(());
        }
        self.write(&doc).await
    }

    /// Drop sessions whose `last_activity_at` is older than `max_age`.
    /// Returns the removed session ids.
    pub async fn clean_stale(&self, max_age: Duration) -> Vec<String> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(max_age).unwrap_or(chrono::Duration::MAX);
        let mut doc = self.doc.lock().await;
        let stale: Vec<String> = doc
            .sessions
            .iter()
            .filter(|(_, s)| s.last_activity_at < cutoff)
            .map(|(id, _)| id.clone())
            .collect();
        if stale.is_empty() {
            return stale;
        }
        for id in &stale {
            doc.sessions.remove(id);
        }
        if let Err(e) = self.write(&doc).await {
            tracing::warn!("failed to persist after stale cleanup: {e}");
        }
        stale
    }

    /// Find a persisted session by one of its anchor posts. Used to resume a
    /// timed-out session from a reaction on its lifecycle post.
    pub async fn find_by_post_id(
        &self,
        platform_id: &str,
        post_id: &str,
    ) -> Option<PersistedSession> {
        let doc = self.doc.lock().await;
        doc.sessions
            .values()
            .find(|s| {
                s.platform_id == platform_id
                    && (s.lifecycle_post_id.as_deref() == Some(post_id)
                        || s.session_start_post_id.as_deref() == Some(post_id))
            })
            .cloned()
    }

    pub async fn sticky_post(&self, platform_id: &str) -> Option<String> {
        self.doc
            .lock()
            .await
            .sticky_post_ids
            .get(platform_id)
            .cloned()
    }

    pub async fn set_sticky_post(
        &self,
        platform_id: &str,
        post_id: &str,
    ) -> std::io::Result<()> {
        let mut doc = self.doc.lock().await;
        doc.sticky_post_ids
            .insert(platform_id.to_string(), post_id.to_string());
        self.write(&doc).await
    }

    pub async fn clear_sticky_post(&self, platform_id: &str) -> std::io::Result<()> {
        let mut doc = self.doc.lock().await;
        if doc.sticky_post_ids.remove(platform_id).is_none() {
            return Ok(());
        }
        self.write(&doc).await
    }

    async fn write(&self, doc: &StoreDoc) -> std::io::Result<()> {
        let json = serde_json::to_string_pretty(doc)
            .map_err(|e| std::io::Error::other(format!("serialize store: {e}")))?;
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = tmp_path(&self.path);
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &self.path).await
    }
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "store".to_string());
    name.push_str(".tmp");
    path.with_file_name(name)
}

fn empty_doc() -> StoreDoc {
    StoreDoc {
        version: STORE_VERSION,
        ..Default::default()
    }
}

fn parse_doc(raw: &str) -> StoreDoc {
    let value: Value = match serde_json::from_str(raw) {
        Ok(v) => v,
        Err(e) => {
            tracing::warn!("corrupt session store, starting empty: {e}");
            return empty_doc();
        }
    };
    match value.get("version").and_then(Value::as_u64) {
        Some(2) => match serde_json::from_value::<StoreDoc>(value) {
            Ok(doc) => doc,
            Err(e) => {
                tracing::warn!("unreadable v2 session store, starting empty: {e}");
                empty_doc()
            }
        },
        Some(1) => migrate_v1(&value),
        other => {
            tracing::warn!("session store has unsupported version {other:?}, starting empty");
            empty_doc()
        }
    }
}

/// v1 stores predate multi-platform support: sessions were keyed by bare
/// thread id and carried no `platform_id`. Recompose under `default:`.
fn migrate_v1(value: &Value) -> StoreDoc {
    let mut doc = empty_doc();
    if let Some(sessions) = value.get("sessions").and_then(Value::as_object) {
        for (thread_id, raw) in sessions {
            let mut raw = raw.clone();
            if let Some(obj) = raw.as_object_mut() {
                let session_id = format!("default:{thread_id}");
                obj.insert("platform_id".to_string(), Value::String("default".into()));
                obj.insert("thread_id".to_string(), Value::String(thread_id.clone()));
                obj.insert("session_id".to_string(), Value::String(session_id.clone()));
                match serde_json::from_value::<PersistedSession>(raw) {
                    Ok(session) => {
                        doc.sessions.insert(session_id, session);
                    }
                    Err(e) => {
                        tracing::warn!("skipping unmigratable v1 session {thread_id}: {e}");
                    }
                }
            }
        }
    }
    if let Some(sticky) = value.get("sticky_post_id").and_then(Value::as_str) {
        doc.sticky_post_ids
            .insert("default".to_string(), sticky.to_string());
    }
    tracing::info!("migrated v1 session store ({} sessions)", doc.sessions.len());
    doc
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn sample(platform_id: &str, thread_id: &str) -> PersistedSession {
        PersistedSession {
            session_id: format!("{platform_id}:{thread_id}"),
            platform_id: platform_id.to_string(),
            thread_id: thread_id.to_string(),
            agent_session_id: Uuid::new_v4(),
            started_by: "alice".to_string(),
            started_at: Utc::now(),
            last_activity_at: Utc::now(),
            session_number: 1,
            working_dir: PathBuf::from("/tmp"),
            worktree: None,
            allowed_users: vec!["alice".to_string()],
            force_interactive_permissions: false,
            was_interrupted: false,
            resume_fail_count: 0,
            session_start_post_id: Some("start-1".to_string()),
            lifecycle_post_id: None,
            message_count: 3,
            usage: None,
        }
    }

    #[tokio::test]
    async fn save_and_reload_round_trips() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("sessions.json");

        let store = SessionStore::open(&path).await;
        let session = sample("mm", "thread-1");
        store.save(session.clone()).await.unwrap();

        let reopened = SessionStore::open(&path).await;
        let loaded = reopened.get(&session.key()).await.unwrap();
        assert_eq!(loaded, session);
    }

    #[tokio::test]
    async fn missing_and_corrupt_files_load_empty() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("sessions.json");
        let store = SessionStore::open(&path).await;
        assert!(store.sessions().await.is_empty());

        std::fs::write(&path, "{not json").unwrap();
        let store = SessionStore::open(&path).await;
        assert!(store.sessions().await.is_empty());
    }

    #[tokio::test]
    async fn unknown_version_is_ignored_but_preserved_until_save() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("sessions.json");
        let original = r#"{"version": 99, "sessions": {"x": {}}}"#;
        std::fs::write(&path, original).unwrap();

        let store = SessionStore::open(&path).await;
        assert!(store.sessions().await.is_empty());
        // Nothing was written back; the raw file survives untouched.
        assert_eq!(std::fs::read_to_string(&path).unwrap(), original);

        store.save(sample("mm", "t")).await.unwrap();
        assert_ne!(std::fs::read_to_string(&path).unwrap(), original);
    }

    #[tokio::test]
    async fn migrates_v1_keys_under_default_platform() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("sessions.json");
        let v1_session = sample("ignored", "thread-9");
        let mut raw = serde_json::to_value(&v1_session).unwrap();
        let obj = raw.as_object_mut().unwrap();
        obj.remove("platform_id");
        obj.remove("thread_id");
        obj.remove("session_id");
        let v1 = serde_json::json!({
            "version": 1,
            "sessions": { "thread-9": raw },
            "sticky_post_id": "sticky-7",
        });
        std::fs::write(&path, serde_json::to_string(&v1).unwrap()).unwrap();

        let store = SessionStore::open(&path).await;
        let sessions = store.sessions().await;
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].session_id, "default:thread-9");
        assert_eq!(sessions[0].platform_id, "default");
        assert_eq!(sessions[0].thread_id, "thread-9");
        assert_eq!(store.sticky_post("default").await.as_deref(), Some("sticky-7"));
    }

    #[tokio::test]
    async fn clean_stale_removes_old_entries() {
        let dir = TempDir::new().unwrap();
        let store = SessionStore::open(dir.path().join("s.json")).await;

        let mut old = sample("mm", "old");
        old.last_activity_at = Utc::now() - chrono::Duration::days(30);
        let fresh = sample("mm", "fresh");
        store.save(old).await.unwrap();
        store.save(fresh.clone()).await.unwrap();

        let removed = store.clean_stale(Duration::from_secs(24 * 3600)).await;
        assert_eq!(removed, vec!["mm:old".to_string()]);
        assert_eq!(store.sessions().await, vec![fresh]);
    }

    #[tokio::test]
    async fn find_by_post_id_matches_anchors() {
        let dir = TempDir::new().unwrap();
        let store = SessionStore::open(dir.path().join("s.json")).await;
        let mut session = sample("mm", "t1");
        session.lifecycle_post_id = Some("life-1".to_string());
        store.save(session.clone()).await.unwrap();

        assert_eq!(
            store.find_by_post_id("mm", "life-1").await,
            Some(session.clone())
        );
        assert_eq!(
            store.find_by_post_id("mm", "start-1").await,
            Some(session.clone())
        );
        assert_eq!(store.find_by_post_id("other", "life-1").await, None);
        assert_eq!(store.find_by_post_id("mm", "nope").await, None);
    }

    #[tokio::test]
    async fn sticky_post_crud() {
        let dir = TempDir::new().unwrap();
        let store = SessionStore::open(dir.path().join("s.json")).await;
        assert_eq!(store.sticky_post("mm").await, None);
        store.set_sticky_post("mm", "p1").await.unwrap();
        assert_eq!(store.sticky_post("mm").await.as_deref(), Some("p1"));
        store.clear_sticky_post("mm").await.unwrap();
        assert_eq!(store.sticky_post("mm").await, None);
    }
}
