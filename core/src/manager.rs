// Poisoned mutex should fail the program
#![allow(clippy::unwrap_used)]

//! Top-level owner of all sessions: accepts platform events, enforces the
//! session cap, runs the idle sweeper, persists, and resumes sessions after
//! a bridge restart.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;

use tether_common::elapsed::format_ago;
use tether_platform::ChatPlatform;
use tether_platform::PlatformEvent;
use tether_platform::Post;
use tether_platform::Reaction;
use tether_platform::User;
use tether_platform::emoji;

use crate::config::Config;
use crate::error::Result;
use crate::session;
use crate::session::SessionCtx;
use crate::session::SessionInput;
use crate::session::SessionKey;
use crate::session::SessionState;
use crate::store::PersistedSession;
use crate::store::SessionStore;

const SWEEP_INTERVAL: Duration = Duration::from_secs(60);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);
const SESSION_INBOX_CAPACITY: usize = 256;

/// One connected platform plus what a permission broker needs to reach it
/// on its own (PLATFORM_TYPE/URL/TOKEN/CHANNEL_ID).
pub struct PlatformRuntime {
    pub client: Arc<dyn ChatPlatform>,
    pub broker_env: HashMap<String, String>,
}

/// postId → session routing table. Entries expire with their session.
#[derive(Default)]
pub struct PostIndex {
    map: Mutex<HashMap<(String, String), SessionKey>>,
}

impl PostIndex {
    pub fn register(&self, platform_id: &str, post_id: &str, key: &SessionKey) {
        self.map.lock().unwrap().insert(
            (platform_id.to_string(), post_id.to_string()),
            key.clone(),
        );
    }

    pub fn lookup(&self, platform_id: &str, post_id: &str) -> Option<SessionKey> {
        self.map
            .lock()
            .unwrap()
            .get(&(platform_id.to_string(), post_id.to_string()))
            .cloned()
    }

    fn drop_session(&self, key: &SessionKey) {
        self.map.lock().unwrap().retain(|_, v| v != key);
    }
}

pub(crate) struct SessionHandle {
    pub ctx: Arc<SessionCtx>,
    pub tx: async_channel::Sender<SessionInput>,
    pub worker: JoinHandle<()>,
}

pub(crate) struct ManagerShared {
    pub config: Arc<Config>,
    pub store: Arc<SessionStore>,
    pub platforms: HashMap<String, PlatformRuntime>,
    pub sessions: Mutex<HashMap<SessionKey, SessionHandle>>,
    pub post_index: Arc<PostIndex>,
    pub shutting_down: AtomicBool,
    next_session_number: AtomicU64,
}

impl ManagerShared {
    pub fn live_count(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }

    /// How many other live sessions already work inside `repo_root`.
    pub fn sessions_in_repo(&self, repo_root: &Path, excluding: &SessionKey) -> usize {
        let sessions = self.sessions.lock().unwrap();
        sessions
            .iter()
            .filter(|(key, _)| *key != excluding)
            .filter(|(_, handle)| {
                let state = handle.ctx.lock_state();
                match &state.worktree {
                    Some(wt) => wt.repo_root == repo_root,
                    None => state.working_dir.starts_with(repo_root),
                }
            })
            .count()
    }

    /// Drop a session from the live map. `unpersist` also removes the
    /// stored record; a resumable session (timeout, shutdown) keeps it.
    pub async fn remove_session(self: &Arc<Self>, key: &SessionKey, unpersist: bool) {
        let handle = {
            let mut sessions = self.sessions.lock().unwrap();
            sessions.remove(key)
        };
        if let Some(handle) = handle {
            // Closing the inbox ends the worker loop without running the
            // shutdown path (which would re-persist).
            handle.tx.close();
        }
        self.post_index.drop_session(key);
        if unpersist
            && let Err(e) = self.store.remove(key).await
        {
            tracing::warn!("failed to unpersist {key}: {e}");
        }
        self.refresh_sticky_post(&key.platform_id).await;
    }

    /// Keep the per-platform summary post in sync with the live sessions.
    pub async fn refresh_sticky_post(self: &Arc<Self>, platform_id: &str) {
        let Some(runtime) = self.platforms.get(platform_id) else {
            return;
        };
        let summary = {
            let sessions = self.sessions.lock().unwrap();
            let mut lines: Vec<(u64, String)> = sessions
                .iter()
                .filter(|(key, _)| key.platform_id == platform_id)
                .map(|(_, handle)| {
                    let state = handle.ctx.lock_state();
                    (
                        handle.ctx.session_number,
                        format!(
                            "- #{} started by @{} · {}",
                            handle.ctx.session_number,
                            state.started_by,
                            format_ago(state.started_at)
                        ),
                    )
                })
                .collect();
            lines.sort_by_key(|(number, _)| *number);
            if lines.is_empty() {
                None
            } else {
                Some(format!(
                    "🧵 **Active agent sessions ({})**\n{}",
                    lines.len(),
                    lines
                        .into_iter()
                        .map(|(_, line)| line)
                        .collect::<Vec<_>>()
                        .join("\n")
                ))
            }
        };

        let existing = self.store.sticky_post(platform_id).await;
        match (summary, existing) {
            (Some(text), Some(post_id)) => {
                if runtime.client.update_post(&post_id, &text).await.is_err() {
                    // The post may have been deleted by hand; recreate.
                    if let Ok(post) = runtime.client.create_post(&text, None).await {
                        let _ = self.store.set_sticky_post(platform_id, &post.id).await;
                    }
                }
            }
            (Some(text), None) => {
                if let Ok(post) = runtime.client.create_post(&text, None).await {
                    let _ = self.store.set_sticky_post(platform_id, &post.id).await;
                }
            }
            (None, Some(post_id)) => {
                let _ = runtime.client.delete_post(&post_id).await;
                let _ = self.store.clear_sticky_post(platform_id).await;
            }
            (None, None) => {}
        }
    }

    fn next_number(&self) -> u64 {
        self.next_session_number.fetch_add(1, Ordering::SeqCst)
    }
}

pub struct SessionManager {
    shared: Arc<ManagerShared>,
}

impl SessionManager {
    pub async fn new(config: Config, platforms: Vec<PlatformRuntime>) -> SessionManager {
        let store = Arc::new(SessionStore::open(config.state_file.clone()).await);
        let platforms: HashMap<String, PlatformRuntime> = platforms
            .into_iter()
            .map(|p| (p.client.platform_id().to_string(), p))
            .collect();
        let highest_number = store
            .sessions()
            .await
            .iter()
            .map(|s| s.session_number)
            .max()
            .unwrap_or(0);
        SessionManager {
            shared: Arc::new(ManagerShared {
                config: Arc::new(config),
                store,
                platforms,
                sessions: Mutex::new(HashMap::new()),
                post_index: Arc::new(PostIndex::default()),
                shutting_down: AtomicBool::new(false),
                next_session_number: AtomicU64::new(highest_number + 1),
            }),
        }
    }

    /// Run until `shutdown` fires, then wind every session down with its
    /// persistence intact.
    pub async fn run(&self, shutdown: Arc<Notify>) -> Result<()> {
        let stale = self
            .shared
            .store
            .clean_stale(self.shared.config.stale_session_max_age)
            .await;
        if !stale.is_empty() {
            tracing::info!("dropped {} stale persisted sessions", stale.len());
        }

        self.resume_persisted().await;

        let mut intake_tasks = Vec::new();
        for (platform_id, runtime) in &self.shared.platforms {
            let shared = self.shared.clone();
            let platform_id = platform_id.clone();
            let events = runtime.client.events();
            intake_tasks.push(tokio::spawn(async move {
                while let Ok(event) = events.recv().await {
                    match event {
                        PlatformEvent::Message { post, user } => {
                            handle_message(&shared, &platform_id, post, user).await;
                        }
                        PlatformEvent::Reaction { reaction, user } => {
                            handle_reaction_event(&shared, &platform_id, reaction, user).await;
                        }
                    }
                }
                tracing::info!("event stream for {platform_id} closed");
            }));
        }

        let sweeper = {
            let shared = self.shared.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    ticker.tick().await;
                    let targets: Vec<async_channel::Sender<SessionInput>> = {
                        let sessions = shared.sessions.lock().unwrap();
                        sessions.values().map(|h| h.tx.clone()).collect()
                    };
                    for tx in targets {
                        let _ = tx.send(SessionInput::IdleSweep).await;
                    }
                }
            })
        };

        shutdown.notified().await;
        tracing::info!("shutting down");
        self.shared.shutting_down.store(true, Ordering::SeqCst);
        sweeper.abort();
        for task in intake_tasks {
            task.abort();
        }
        self.graceful_shutdown().await;
        Ok(())
    }

    async fn graceful_shutdown(&self) {
        let handles: Vec<SessionHandle> = {
            let mut sessions = self.shared.sessions.lock().unwrap();
            sessions.drain().map(|(_, h)| h).collect()
        };
        for handle in &handles {
            let _ = handle.tx.send(SessionInput::Shutdown).await;
        }
        for handle in handles {
            if tokio::time::timeout(SHUTDOWN_GRACE, handle.worker).await.is_err() {
                tracing::warn!("session worker did not stop in time");
            }
        }
        for runtime in self.shared.platforms.values() {
            runtime.client.disconnect().await;
        }
    }

    async fn resume_persisted(&self) {
        for persisted in self.shared.store.sessions().await {
            let key = persisted.key();
            if !self.shared.platforms.contains_key(&key.platform_id) {
                tracing::warn!("persisted session {key} references unknown platform; skipping");
                continue;
            }
            tracing::info!("resuming session {key}");
            spawn_session_from_persisted(&self.shared, &persisted, SessionInput::Resume).await;
        }
    }

}

// ---------------------------------------------------------------------
// Event intake
// ---------------------------------------------------------------------

async fn resolve_user(
    client: &Arc<dyn ChatPlatform>,
    user: Option<User>,
    user_id: &str,
) -> Option<User> {
    match user {
        Some(user) => Some(user),
        None => match client.get_user(user_id).await {
            Ok(user) => Some(user),
            Err(e) => {
                tracing::warn!("could not resolve user {user_id}: {e}");
                None
            }
        },
    }
}

/// True when a message opens with a mention of someone other than the bot,
/// i.e. a side conversation inside the session thread.
fn is_side_conversation(text: &str, bot_name: &str) -> bool {
    let trimmed = text.trim_start();
    let Some(rest) = trimmed.strip_prefix('@') else {
        return false;
    };
    let mentioned: String = rest
        .chars()
        .take_while(|c| c.is_alphanumeric() || matches!(c, '.' | '-' | '_'))
        .collect();
    !mentioned.is_empty() && !mentioned.eq_ignore_ascii_case(bot_name)
}

fn mentions_bot(text: &str, bot_name: &str) -> bool {
    let needle = format!("@{bot_name}");
    text.to_ascii_lowercase()
        .contains(&needle.to_ascii_lowercase())
}

async fn handle_message(
    shared: &Arc<ManagerShared>,
    platform_id: &str,
    post: Post,
    user: Option<User>,
) {
    if shared.shutting_down.load(Ordering::SeqCst) {
        return;
    }
    let Some(runtime) = shared.platforms.get(platform_id) else {
        return;
    };
    let client = &runtime.client;
    if post.user_id == client.bot_user().id {
        return;
    }

    let key = SessionKey::new(platform_id, post.thread_root());
    let existing_tx = {
        let sessions = shared.sessions.lock().unwrap();
        sessions.get(&key).map(|h| h.tx.clone())
    };

    if let Some(tx) = existing_tx {
        if is_side_conversation(&post.message, client.bot_name()) {
            return;
        }
        let Some(user) = resolve_user(client, user, &post.user_id).await else {
            return;
        };
        let _ = tx.send(SessionInput::Message { post, user }).await;
        return;
    }

    // Not an active thread: only a fresh authorized mention starts a
    // session.
    if !mentions_bot(&post.message, client.bot_name()) {
        return;
    }
    let Some(user) = resolve_user(client, user, &post.user_id).await else {
        return;
    };
    if !client.is_user_allowed(&user.username) {
        tracing::info!("ignoring mention from unauthorized user {}", user.username);
        return;
    }
    if shared.live_count() >= shared.config.max_sessions {
        let message = format!(
            "⚠️ {}",
            crate::error::user_message(&crate::error::TetherErr::SessionLimit(
                shared.config.max_sessions
            ))
        );
        if let Err(e) = client.create_post(&message, Some(post.thread_root())).await {
            tracing::warn!("failed to post session-limit notice: {e}");
        }
        return;
    }

    create_session(shared, key, post, user).await;
}

async fn create_session(shared: &Arc<ManagerShared>, key: SessionKey, post: Post, user: User) {
    tracing::info!("starting session {key} for @{}", user.username);
    let state = SessionState::new(&user.username, shared.config.default_working_dir.clone());
    let tx = spawn_session(shared, key.clone(), state, shared.next_number()).await;
    // Index the mention itself so early reactions route to the session.
    shared.post_index.register(&key.platform_id, &post.id, &key);
    let _ = tx.send(SessionInput::Start { post, user }).await;
    shared.refresh_sticky_post(&key.platform_id).await;
}

async fn handle_reaction_event(
    shared: &Arc<ManagerShared>,
    platform_id: &str,
    reaction: Reaction,
    user: Option<User>,
) {
    if shared.shutting_down.load(Ordering::SeqCst) {
        return;
    }
    let Some(runtime) = shared.platforms.get(platform_id) else {
        return;
    };
    let client = &runtime.client;
    if reaction.user_id == client.bot_user().id {
        return;
    }

    if let Some(key) = shared.post_index.lookup(platform_id, &reaction.post_id) {
        let tx = {
            let sessions = shared.sessions.lock().unwrap();
            sessions.get(&key).map(|h| h.tx.clone())
        };
        if let Some(tx) = tx {
            let Some(user) = resolve_user(client, user, &reaction.user_id).await else {
                return;
            };
            let _ = tx.send(SessionInput::Reaction { reaction, user }).await;
            return;
        }
    }

    // No live session owns this post: a 👍 on a persisted lifecycle post
    // resurrects the session it belonged to.
    if !emoji::is_approval(&reaction.emoji_name) {
        return;
    }
    let Some(persisted) = shared
        .store
        .find_by_post_id(platform_id, &reaction.post_id)
        .await
    else {
        return;
    };
    let key = persisted.key();
    if shared.sessions.lock().unwrap().contains_key(&key) {
        return;
    }
    let Some(user) = resolve_user(client, user, &reaction.user_id).await else {
        return;
    };
    if !persisted.allowed_users.iter().any(|u| u == &user.username)
        && !client.is_user_allowed(&user.username)
    {
        return;
    }
    if shared.live_count() >= shared.config.max_sessions {
        tracing::info!("cannot resume {key}: session limit reached");
        return;
    }
    tracing::info!("resuming session {key} from a reaction by @{}", user.username);
    spawn_session_from_persisted(shared, &persisted, SessionInput::Resume).await;
}

// ---------------------------------------------------------------------
// Session spawning
// ---------------------------------------------------------------------

async fn spawn_session(
    shared: &Arc<ManagerShared>,
    key: SessionKey,
    state: SessionState,
    session_number: u64,
) -> async_channel::Sender<SessionInput> {
    let runtime = &shared.platforms[&key.platform_id];
    let (tx, rx) = async_channel::bounded(SESSION_INBOX_CAPACITY);
    let ctx = Arc::new(SessionCtx {
        key: key.clone(),
        session_number,
        platform: runtime.client.clone(),
        config: shared.config.clone(),
        store: shared.store.clone(),
        post_index: shared.post_index.clone(),
        manager: Arc::downgrade(shared),
        tx_inbox: tx.clone(),
        broker_env: runtime.broker_env.clone(),
        state: Mutex::new(state),
        agent: tokio::sync::Mutex::new(None),
    });

    let worker = tokio::spawn(session::run_session_worker(ctx.clone(), rx));
    let handle = SessionHandle {
        ctx,
        tx: tx.clone(),
        worker,
    };
    shared.sessions.lock().unwrap().insert(key, handle);
    tx
}

async fn spawn_session_from_persisted(
    shared: &Arc<ManagerShared>,
    persisted: &PersistedSession,
    first_input: SessionInput,
) {
    let key = persisted.key();
    let state = SessionState::from_persisted(persisted);
    let tx = spawn_session(shared, key.clone(), state, persisted.session_number).await;
    // Re-index the anchor posts so cancel/resume reactions keep working.
    if let Some(post_id) = &persisted.session_start_post_id {
        shared.post_index.register(&key.platform_id, post_id, &key);
    }
    if let Some(post_id) = &persisted.lifecycle_post_id {
        shared.post_index.register(&key.platform_id, post_id, &key);
    }
    let _ = tx.send(first_input).await;
    shared.refresh_sticky_post(&key.platform_id).await;
}
