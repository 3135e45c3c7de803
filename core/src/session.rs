// Poisoned mutex should fail the program
#![allow(clippy::unwrap_used)]

//! Per-thread session: the mutable state, the pending-interaction model,
//! and the worker loop that serializes everything that can touch a session
//! (chat messages, reactions, agent events, timers).

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::Weak;

use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use tokio::time::Instant;
use uuid::Uuid;

use tether_common::elapsed::format_ago;
use tether_common::ids::short_id;
use tether_platform::ChatPlatform;
use tether_platform::Post;
use tether_platform::Reaction;
use tether_platform::User;

use crate::agent::AgentClient;
use crate::agent::AgentOutput;
use crate::agent::AgentSpawnParams;
use crate::commands;
use crate::config::Config;
use crate::error::Result;
use crate::error::TetherErr;
use crate::interpreter;
use crate::manager::ManagerShared;
use crate::manager::PostIndex;
use crate::protocol::AgentEvent;
use crate::reactions;
use crate::store::PersistedSession;
use crate::store::SessionStore;
use crate::streaming;
use crate::usage::UsageStats;
use crate::worktree::WorktreeInfo;

pub(crate) const RESUME_MAX_FAILURES: u32 = 3;
pub(crate) const HEADER_REFRESH: std::time::Duration = std::time::Duration::from_secs(30);

/// Composite session identity: one platform instance, one thread.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionKey {
    pub platform_id: String,
    pub thread_id: String,
}

impl SessionKey {
    pub fn new(platform_id: impl Into<String>, thread_id: impl Into<String>) -> Self {
        Self {
            platform_id: platform_id.into(),
            thread_id: thread_id.into(),
        }
    }
}

impl std::fmt::Display for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.platform_id, self.thread_id)
    }
}

// ---------------------------------------------------------------------
// Pending interactions
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingCategory {
    Approval,
    QuestionSet,
    MessageApproval,
    ContextPrompt,
    WorktreePrompt,
    ExistingWorktreePrompt,
}

#[derive(Debug, Clone)]
pub struct PendingApproval {
    pub post_id: String,
    pub tool_use_id: String,
}

#[derive(Debug, Clone)]
pub struct QuestionOption {
    pub label: String,
    pub description: String,
}

#[derive(Debug, Clone)]
pub struct PendingQuestion {
    pub header: String,
    pub question: String,
    pub options: Vec<QuestionOption>,
    pub answer: Option<String>,
}

#[derive(Debug, Clone)]
pub struct PendingQuestionSet {
    pub tool_use_id: String,
    /// Post of the question currently shown; only reactions on it count.
    pub post_id: String,
    pub questions: Vec<PendingQuestion>,
    pub current: usize,
}

#[derive(Debug, Clone)]
pub struct PendingMessageApproval {
    pub post_id: String,
    pub username: String,
    pub text: String,
    pub file_ids: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextChoice {
    Fresh,
    LastN(usize),
    FullThread,
}

impl ContextChoice {
    pub fn label(&self) -> String {
        match self {
            ContextChoice::Fresh => "No context".to_string(),
            ContextChoice::LastN(n) => format!("Last {n} messages"),
            ContextChoice::FullThread => "Full thread".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PendingContextPrompt {
    pub post_id: String,
    pub queued_prompt: String,
    pub queued_file_ids: Vec<String>,
    pub thread_message_count: usize,
    pub options: Vec<ContextChoice>,
    pub deadline: Instant,
}

#[derive(Debug, Clone)]
pub struct PendingWorktreePrompt {
    pub post_id: String,
    pub suggested_branch: String,
    pub queued_prompt: String,
    pub queued_file_ids: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct WorktreeChoice {
    pub path: PathBuf,
    pub branch: String,
}

#[derive(Debug, Clone)]
pub struct PendingExistingWorktreePrompt {
    pub post_id: String,
    pub choices: Vec<WorktreeChoice>,
    pub queued_prompt: String,
    pub queued_file_ids: Vec<String>,
}

#[derive(Debug, Clone)]
pub enum PendingInteraction {
    Approval(PendingApproval),
    QuestionSet(PendingQuestionSet),
    MessageApproval(PendingMessageApproval),
    ContextPrompt(PendingContextPrompt),
    WorktreePrompt(PendingWorktreePrompt),
    ExistingWorktreePrompt(PendingExistingWorktreePrompt),
}

impl PendingInteraction {
    pub fn category(&self) -> PendingCategory {
        match self {
            PendingInteraction::Approval(_) => PendingCategory::Approval,
            PendingInteraction::QuestionSet(_) => PendingCategory::QuestionSet,
            PendingInteraction::MessageApproval(_) => PendingCategory::MessageApproval,
            PendingInteraction::ContextPrompt(_) => PendingCategory::ContextPrompt,
            PendingInteraction::WorktreePrompt(_) => PendingCategory::WorktreePrompt,
            PendingInteraction::ExistingWorktreePrompt(_) => {
                PendingCategory::ExistingWorktreePrompt
            }
        }
    }

    pub fn post_id(&self) -> &str {
        match self {
            PendingInteraction::Approval(p) => &p.post_id,
            PendingInteraction::QuestionSet(p) => &p.post_id,
            PendingInteraction::MessageApproval(p) => &p.post_id,
            PendingInteraction::ContextPrompt(p) => &p.post_id,
            PendingInteraction::WorktreePrompt(p) => &p.post_id,
            PendingInteraction::ExistingWorktreePrompt(p) => &p.post_id,
        }
    }
}

/// Holds the outstanding interactions of a session. Structurally enforces
/// "at most one per category": inserting a variant replaces any previous
/// one of the same category.
#[derive(Debug, Clone, Default)]
pub struct PendingSet {
    items: Vec<PendingInteraction>,
}

impl PendingSet {
    pub fn insert(&mut self, item: PendingInteraction) -> Option<PendingInteraction> {
        let replaced = self.take(item.category());
        self.items.push(item);
        replaced
    }

    pub fn take(&mut self, category: PendingCategory) -> Option<PendingInteraction> {
        let idx = self.items.iter().position(|i| i.category() == category)?;
        Some(self.items.remove(idx))
    }

    pub fn get(&self, category: PendingCategory) -> Option<&PendingInteraction> {
        self.items.iter().find(|i| i.category() == category)
    }

    pub fn find_by_post(&self, post_id: &str) -> Option<&PendingInteraction> {
        self.items.iter().find(|i| i.post_id() == post_id)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }
}

// ---------------------------------------------------------------------
// Session state
// ---------------------------------------------------------------------

#[derive(Debug)]
pub struct SessionState {
    pub agent_session_id: Uuid,
    pub started_by: String,
    pub started_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,

    pub working_dir: PathBuf,
    pub worktree: Option<WorktreeInfo>,

    pub is_restarting: bool,
    pub is_resumed: bool,
    pub was_interrupted: bool,
    pub has_agent_responded: bool,
    pub resume_fail_count: u32,
    pub is_processing: bool,
    pub timeout_warning_posted: bool,
    pub plan_approved: bool,
    pub needs_context_prompt: bool,

    pub pending_content: String,
    pub current_post_id: Option<String>,
    pub update_deadline: Option<Instant>,
    pub typing_deadline: Option<Instant>,
    pub header_refresh_deadline: Option<Instant>,

    pub tasks_post_id: Option<String>,
    pub last_tasks_content: Option<String>,
    pub tasks_completed: bool,
    pub tasks_minimized: bool,

    pub pending: PendingSet,

    pub force_interactive_permissions: bool,
    /// Always contains `started_by`.
    pub allowed_users: Vec<String>,

    pub usage: Option<UsageStats>,

    pub session_start_post_id: Option<String>,
    pub lifecycle_post_id: Option<String>,
    pub compaction_post_id: Option<String>,

    pub message_count: u64,

    /// tool_use_id → tool name, for mirroring interesting tool results.
    pub tool_names: HashMap<String, String>,
}

impl SessionState {
    pub fn new(started_by: &str, working_dir: PathBuf) -> Self {
        let now = Utc::now();
        Self {
            agent_session_id: Uuid::new_v4(),
            started_by: started_by.to_string(),
            started_at: now,
            last_activity_at: now,
            working_dir,
            worktree: None,
            is_restarting: false,
            is_resumed: false,
            was_interrupted: false,
            has_agent_responded: false,
            resume_fail_count: 0,
            is_processing: false,
            timeout_warning_posted: false,
            plan_approved: false,
            needs_context_prompt: false,
            pending_content: String::new(),
            current_post_id: None,
            update_deadline: None,
            typing_deadline: None,
            header_refresh_deadline: None,
            tasks_post_id: None,
            last_tasks_content: None,
            tasks_completed: false,
            tasks_minimized: false,
            pending: PendingSet::default(),
            force_interactive_permissions: false,
            allowed_users: vec![started_by.to_string()],
            usage: None,
            session_start_post_id: None,
            lifecycle_post_id: None,
            compaction_post_id: None,
            message_count: 0,
            tool_names: HashMap::new(),
        }
    }

    pub fn from_persisted(persisted: &PersistedSession) -> Self {
        let mut state = Self::new(&persisted.started_by, persisted.working_dir.clone());
        state.agent_session_id = persisted.agent_session_id;
        state.started_at = persisted.started_at;
        state.last_activity_at = Utc::now();
        state.worktree = persisted.worktree.clone();
        state.allowed_users = persisted.allowed_users.clone();
        if !state.allowed_users.contains(&persisted.started_by) {
            state.allowed_users.push(persisted.started_by.clone());
        }
        state.force_interactive_permissions = persisted.force_interactive_permissions;
        state.resume_fail_count = persisted.resume_fail_count;
        state.session_start_post_id = persisted.session_start_post_id.clone();
        state.lifecycle_post_id = persisted.lifecycle_post_id.clone();
        state.message_count = persisted.message_count;
        state.usage = persisted.usage.clone();
        state.is_resumed = true;
        state
    }

    pub fn touch(&mut self) {
        self.last_activity_at = Utc::now();
        self.timeout_warning_posted = false;
    }

    pub fn is_user_allowed(&self, username: &str) -> bool {
        self.allowed_users.iter().any(|u| u == username)
    }

    /// Owner or a platform admin may run privileged commands.
    pub fn is_owner_or_admin(&self, user: &User) -> bool {
        user.username == self.started_by || user.is_admin
    }
}

// ---------------------------------------------------------------------
// Worker plumbing
// ---------------------------------------------------------------------

/// Everything that can happen to a session, serialized through one inbox.
#[derive(Debug)]
pub(crate) enum SessionInput {
    /// First input after creation: the mention post that started it all.
    Start { post: Post, user: User },
    /// First input after a bridge restart for a persisted session.
    Resume,
    Message { post: Post, user: User },
    Reaction { reaction: Reaction, user: User },
    Agent(Value),
    AgentExit { code: Option<i32> },
    IdleSweep,
    Shutdown,
}

pub(crate) struct SessionCtx {
    pub key: SessionKey,
    pub session_number: u64,
    pub platform: Arc<dyn ChatPlatform>,
    pub config: Arc<Config>,
    pub store: Arc<SessionStore>,
    pub post_index: Arc<PostIndex>,
    pub manager: Weak<ManagerShared>,
    pub tx_inbox: async_channel::Sender<SessionInput>,
    /// Base environment for the permission broker (platform identity);
    /// thread id and allowed users are appended at spawn time.
    pub broker_env: HashMap<String, String>,
    pub state: Mutex<SessionState>,
    pub agent: tokio::sync::Mutex<Option<AgentClient>>,
}

impl SessionCtx {
    pub fn lock_state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap()
    }

    pub fn register_post(&self, post_id: &str) {
        self.post_index
            .register(&self.key.platform_id, post_id, &self.key);
    }

    /// Create a post in the session thread and index it for reaction
    /// routing.
    pub async fn post_to_thread(&self, message: &str) -> Result<Post> {
        let post = self
            .platform
            .create_post(message, Some(&self.key.thread_id))
            .await?;
        self.register_post(&post.id);
        Ok(post)
    }

    pub async fn post_interactive(&self, message: &str, emoji: &[&str]) -> Result<Post> {
        let post = self
            .platform
            .create_interactive_post(message, emoji, Some(&self.key.thread_id))
            .await?;
        self.register_post(&post.id);
        Ok(post)
    }

    /// One-line user-facing error; never fatal.
    pub async fn post_error(&self, message: &str) {
        if let Err(e) = self.post_to_thread(&format!("⚠️ {message}")).await {
            tracing::warn!("failed to post error notice: {e}");
        }
    }

    pub async fn send_agent_message(&self, text: &str) -> Result<()> {
        let guard = self.agent.lock().await;
        match guard.as_ref() {
            Some(agent) => agent.send_message(text).await,
            None => Err(TetherErr::AgentNotRunning),
        }
    }

    pub async fn send_agent_blocks(&self, blocks: Vec<Value>) -> Result<()> {
        let guard = self.agent.lock().await;
        match guard.as_ref() {
            Some(agent) => agent.send_message_blocks(blocks).await,
            None => Err(TetherErr::AgentNotRunning),
        }
    }

    pub async fn send_tool_result(&self, tool_use_id: &str, content: &str) -> Result<()> {
        let guard = self.agent.lock().await;
        match guard.as_ref() {
            Some(agent) => agent.send_tool_result(tool_use_id, content).await,
            None => Err(TetherErr::AgentNotRunning),
        }
    }

    pub fn to_persisted(&self) -> PersistedSession {
        let state = self.lock_state();
        PersistedSession {
            session_id: self.key.to_string(),
            platform_id: self.key.platform_id.clone(),
            thread_id: self.key.thread_id.clone(),
            agent_session_id: state.agent_session_id,
            started_by: state.started_by.clone(),
            started_at: state.started_at,
            last_activity_at: state.last_activity_at,
            session_number: self.session_number,
            working_dir: state.working_dir.clone(),
            worktree: state.worktree.clone(),
            allowed_users: state.allowed_users.clone(),
            force_interactive_permissions: state.force_interactive_permissions,
            was_interrupted: state.was_interrupted,
            resume_fail_count: state.resume_fail_count,
            session_start_post_id: state.session_start_post_id.clone(),
            lifecycle_post_id: state.lifecycle_post_id.clone(),
            message_count: state.message_count,
            usage: state.usage.clone(),
        }
    }

    pub async fn persist(&self) {
        if let Err(e) = self.store.save(self.to_persisted()).await {
            tracing::warn!("failed to persist session {}: {e}", self.key);
        }
    }

    /// Spawn (or respawn) the agent subprocess for the current state.
    pub async fn spawn_agent(&self, resume: bool) -> Result<()> {
        let params = self.spawn_params(resume);
        let (tx, rx) = async_channel::bounded::<AgentOutput>(256);
        let client = AgentClient::spawn(&params, tx)?;

        // Forward subprocess output into the session inbox so the worker
        // stays the single writer of session state.
        let inbox = self.tx_inbox.clone();
        tokio::spawn(async move {
            while let Ok(output) = rx.recv().await {
                let input = match output {
                    AgentOutput::Event(value) => SessionInput::Agent(value),
                    AgentOutput::Exit { code } => SessionInput::AgentExit { code },
                };
                if inbox.send(input).await.is_err() {
                    break;
                }
            }
        });

        let mut guard = self.agent.lock().await;
        *guard = Some(client);
        Ok(())
    }

    fn spawn_params(&self, resume: bool) -> AgentSpawnParams {
        let state = self.lock_state();
        let mut broker_env = self.broker_env.clone();
        broker_env.insert(
            "PLATFORM_THREAD_ID".to_string(),
            self.key.thread_id.clone(),
        );
        broker_env.insert("ALLOWED_USERS".to_string(), state.allowed_users.join(","));
        broker_env.insert(
            "DEBUG".to_string(),
            if self.config.debug { "1" } else { "0" }.to_string(),
        );
        let skip_permissions =
            self.config.skip_permissions && !state.force_interactive_permissions;
        AgentSpawnParams {
            program: self.config.agent_program.clone(),
            working_dir: state.working_dir.clone(),
            agent_session_id: state.agent_session_id,
            resume,
            skip_permissions,
            broker_program: self.config.broker_program.clone(),
            broker_env,
            append_system_prompt: self.config.append_system_prompt.clone(),
            chrome_automation: self.config.chrome_automation,
        }
    }

    pub async fn kill_agent(&self) {
        let guard = self.agent.lock().await;
        if let Some(agent) = guard.as_ref() {
            agent.kill();
        }
    }

    pub async fn interrupt_agent(&self) -> bool {
        let guard = self.agent.lock().await;
        match guard.as_ref() {
            Some(agent) if agent.is_running() => {
                agent.interrupt();
                true
            }
            _ => false,
        }
    }

    // -----------------------------------------------------------------
    // Header post
    // -----------------------------------------------------------------

    pub fn render_header(&self) -> String {
        let state = self.lock_state();
        let status = if state.is_restarting {
            "🔄 Restarting"
        } else if state.was_interrupted {
            "⏸️ Interrupted"
        } else if state.is_processing {
            "🟢 Working"
        } else if state.has_agent_responded {
            "🟢 Ready"
        } else {
            "🟡 Starting"
        };

        let mut lines = vec![format!(
            "#### 🤖 Session #{} · `{}` {}",
            self.session_number,
            short_id(&state.agent_session_id.to_string()),
            if state.is_resumed { "(resumed)" } else { "" }
        )];
        lines.push(format!("**Status:** {status}"));

        let dir = state.working_dir.display().to_string();
        match &state.worktree {
            Some(wt) => lines.push(format!("**Dir:** `{dir}` (worktree `{}`)", wt.branch)),
            None => lines.push(format!("**Dir:** `{dir}`")),
        }

        lines.push(format!(
            "**Started by** @{} · {} · {} messages",
            state.started_by,
            format_ago(state.started_at),
            state.message_count
        ));

        let users = state
            .allowed_users
            .iter()
            .map(|u| format!("@{u}"))
            .collect::<Vec<_>>()
            .join(", ");
        lines.push(format!("**Users:** {users}"));

        if let Some(usage) = &state.usage {
            lines.push(format!(
                "**{}** · context {}% ({}k/{}k) · ${:.2} · {}k tokens total",
                usage.model_display_name,
                usage.context_percent(),
                usage.context_tokens / 1000,
                usage.context_window_size / 1000,
                usage.total_cost_usd,
                usage.total_tokens_used / 1000,
            ));
        }
        if state.force_interactive_permissions {
            lines.push("**Permissions:** interactive".to_string());
        }
        lines.join("\n")
    }

    pub async fn repaint_header(&self) {
        let post_id = { self.lock_state().session_start_post_id.clone() };
        let Some(post_id) = post_id else { return };
        let header = self.render_header();
        if let Err(e) = self.platform.update_post(&post_id, &header).await {
            tracing::warn!("failed to repaint header for {}: {e}", self.key);
        }
    }
}

// ---------------------------------------------------------------------
// Worker loop
// ---------------------------------------------------------------------

fn next_deadline(ctx: &SessionCtx) -> Option<Instant> {
    let state = ctx.lock_state();
    [
        state.update_deadline,
        state.typing_deadline,
        state.header_refresh_deadline,
    ]
    .into_iter()
    .flatten()
    .min()
}

pub(crate) async fn run_session_worker(
    ctx: Arc<SessionCtx>,
    rx: async_channel::Receiver<SessionInput>,
) {
    loop {
        let input = match next_deadline(&ctx) {
            Some(deadline) => {
                tokio::select! {
                    received = rx.recv() => Some(received),
                    _ = tokio::time::sleep_until(deadline) => None,
                }
            }
            None => Some(rx.recv().await),
        };

        match input {
            None => fire_due_timers(&ctx).await,
            Some(Err(_)) => break,
            Some(Ok(SessionInput::Shutdown)) => {
                shutdown_session(&ctx).await;
                break;
            }
            Some(Ok(input)) => handle_input(&ctx, input).await,
        }
    }
    tracing::debug!("session worker for {} exited", ctx.key);
}

async fn handle_input(ctx: &Arc<SessionCtx>, input: SessionInput) {
    match input {
        SessionInput::Start { post, user } => start_session(ctx, post, user).await,
        SessionInput::Resume => resume_session(ctx).await,
        SessionInput::Message { post, user } => {
            commands::handle_user_message(ctx, post, user).await
        }
        SessionInput::Reaction { reaction, user } => {
            reactions::handle_reaction(ctx, reaction, user).await
        }
        SessionInput::Agent(value) => {
            interpreter::handle_agent_event(ctx, AgentEvent::parse(value)).await
        }
        SessionInput::AgentExit { code } => handle_agent_exit(ctx, code).await,
        SessionInput::IdleSweep => idle_sweep(ctx).await,
        SessionInput::Shutdown => unreachable!("handled by the worker loop"),
    }
}

async fn fire_due_timers(ctx: &Arc<SessionCtx>) {
    let now = Instant::now();

    let (flush_due, typing_due, header_due) = {
        let mut state = ctx.lock_state();
        let flush_due = matches!(state.update_deadline, Some(d) if d <= now);
        let typing_due = matches!(state.typing_deadline, Some(d) if d <= now);
        let header_due = matches!(state.header_refresh_deadline, Some(d) if d <= now);
        if typing_due {
            state.typing_deadline = if state.is_processing {
                Some(now + ctx.config.typing_tick)
            } else {
                None
            };
        }
        if header_due {
            state.header_refresh_deadline = Some(now + HEADER_REFRESH);
        }
        (flush_due, typing_due, header_due)
    };

    if flush_due {
        streaming::flush(ctx).await;
    }
    if typing_due {
        let typing = {
            let state = ctx.lock_state();
            state.is_processing
        };
        if typing
            && let Err(e) = ctx.platform.send_typing(Some(&ctx.key.thread_id)).await
        {
            tracing::debug!("typing indicator failed: {e}");
        }
    }
    if header_due {
        ctx.repaint_header().await;
    }
}

// ---------------------------------------------------------------------
// Lifecycle transitions
// ---------------------------------------------------------------------

async fn start_session(ctx: &Arc<SessionCtx>, post: Post, user: User) {
    let header = ctx.render_header();
    match ctx.post_to_thread(&header).await {
        Ok(header_post) => {
            let mut state = ctx.lock_state();
            state.session_start_post_id = Some(header_post.id);
        }
        Err(e) => {
            tracing::warn!("failed to post session header: {e}");
        }
    }

    let prompt = commands::strip_bot_mention(&post.message, ctx.platform.bot_name());

    // When another live session already works in the same repository, offer
    // to isolate this one in a worktree before the agent touches anything.
    let working_dir = {
        let state = ctx.lock_state();
        state.working_dir.clone()
    };
    if let Some(repo_root) = crate::worktree::repo_root(&working_dir).await
        && let Some(manager) = ctx.manager.upgrade()
        && manager.sessions_in_repo(&repo_root, &ctx.key) > 0
    {
        let branch = format!("tether/{}", short_id(&ctx.key.thread_id));
        let message = format!(
            "🌿 Another session is already working in `{}`.\nCreate a worktree on branch `{branch}` for this session?\n1️⃣ create · ❌ continue in place",
            repo_root.display()
        );
        match ctx
            .post_interactive(&message, &[tether_platform::emoji::NUMBERS[0], "x"])
            .await
        {
            Ok(prompt_post) => {
                {
                    let mut state = ctx.lock_state();
                    state
                        .pending
                        .insert(PendingInteraction::WorktreePrompt(PendingWorktreePrompt {
                            post_id: prompt_post.id,
                            suggested_branch: branch,
                            queued_prompt: prompt,
                            queued_file_ids: post.file_ids.clone(),
                        }));
                }
                ctx.persist().await;
                return;
            }
            Err(e) => tracing::warn!("failed to post worktree prompt: {e}"),
        }
    }

    launch_agent_with_prompt(ctx, &prompt, &post.file_ids, &user).await;
}

/// Spawn the agent fresh and deliver the first user prompt.
pub(crate) async fn launch_agent_with_prompt(
    ctx: &Arc<SessionCtx>,
    prompt: &str,
    file_ids: &[String],
    _user: &User,
) {
    if let Err(e) = ctx.spawn_agent(false).await {
        ctx.post_error(&format!("could not start the agent: {e}")).await;
        if let Some(manager) = ctx.manager.upgrade() {
            manager.remove_session(&ctx.key, true).await;
        }
        return;
    }

    {
        let mut state = ctx.lock_state();
        state.is_processing = true;
        state.touch();
        state.message_count += 1;
        state.typing_deadline = Some(Instant::now() + ctx.config.typing_tick);
    }

    send_user_prompt(ctx, prompt, file_ids).await;
    ctx.persist().await;
    if let Some(manager) = ctx.manager.upgrade() {
        manager.refresh_sticky_post(&ctx.key.platform_id).await;
    }
}

/// Deliver a user prompt, attaching any files as content blocks.
pub(crate) async fn send_user_prompt(ctx: &Arc<SessionCtx>, prompt: &str, file_ids: &[String]) {
    let result = if file_ids.is_empty() {
        ctx.send_agent_message(prompt).await
    } else {
        let mut blocks = vec![crate::protocol::text_block(prompt)];
        blocks.extend(crate::attachments::blocks_for_files(&ctx.platform, file_ids).await);
        ctx.send_agent_blocks(blocks).await
    };
    if let Err(e) = result {
        ctx.post_error(&format!("could not reach the agent: {e}")).await;
    }
}

async fn resume_session(ctx: &Arc<SessionCtx>) {
    let mut attempt = {
        let state = ctx.lock_state();
        state.resume_fail_count
    };

    loop {
        match ctx.spawn_agent(true).await {
            Ok(()) => {
                {
                    let mut state = ctx.lock_state();
                    state.resume_fail_count = 0;
                    state.is_resumed = true;
                    state.touch();
                }
                ctx.repaint_header().await;
                match ctx.post_to_thread("🔁 Session resumed — pick up where you left off.").await
                {
                    Ok(post) => {
                        let mut state = ctx.lock_state();
                        state.lifecycle_post_id = Some(post.id);
                    }
                    Err(e) => tracing::warn!("failed to post resume notice: {e}"),
                }
                ctx.persist().await;
                return;
            }
            Err(e) => {
                attempt += 1;
                tracing::warn!("resume attempt {attempt} for {} failed: {e}", ctx.key);
                {
                    let mut state = ctx.lock_state();
                    state.resume_fail_count = attempt;
                }
                if attempt >= RESUME_MAX_FAILURES {
                    ctx.post_error(&format!(
                        "could not resume this session after {attempt} attempts; start a new one with a mention"
                    ))
                    .await;
                    if let Some(manager) = ctx.manager.upgrade() {
                        manager.remove_session(&ctx.key, true).await;
                    }
                    return;
                }
                tokio::time::sleep(crate::util::backoff(attempt as u64)).await;
            }
        }
    }
}

/// Restart the subprocess, usually because the working directory changed.
/// `preserve_agent_session` keeps the agent session id and resumes (only
/// valid when the directory did not change).
pub(crate) async fn restart_session(
    ctx: &Arc<SessionCtx>,
    new_working_dir: Option<PathBuf>,
    new_worktree: Option<Option<WorktreeInfo>>,
    preserve_agent_session: bool,
) {
    {
        let mut state = ctx.lock_state();
        state.is_restarting = true;
    }

    streaming::flush(ctx).await;
    ctx.kill_agent().await;

    {
        let mut state = ctx.lock_state();
        if let Some(dir) = new_working_dir {
            state.working_dir = dir;
        }
        if let Some(worktree) = new_worktree {
            state.worktree = worktree;
        }
        if !preserve_agent_session {
            // The agent's resume is tied to the working directory, so a
            // directory change always gets a fresh id.
            state.agent_session_id = Uuid::new_v4();
            state.needs_context_prompt = true;
            state.plan_approved = false;
        }
        state.current_post_id = None;
        state.pending_content.clear();
        state.is_processing = false;
        state.has_agent_responded = false;
        state.touch();
    }

    if let Err(e) = ctx.spawn_agent(preserve_agent_session).await {
        {
            let mut state = ctx.lock_state();
            state.is_restarting = false;
        }
        ctx.post_error(&format!("restart failed: {e}")).await;
        return;
    }

    ctx.repaint_header().await;
    ctx.persist().await;
}

pub(crate) async fn interrupt_session(ctx: &Arc<SessionCtx>, by: &str) {
    if ctx.interrupt_agent().await {
        {
            let mut state = ctx.lock_state();
            state.was_interrupted = true;
            state.is_processing = false;
            state.typing_deadline = None;
            state.touch();
        }
        streaming::flush(ctx).await;
        if let Err(e) = ctx
            .post_to_thread(&format!(
                "⏸️ Interrupted by @{by} — the session stays alive; send a message to continue."
            ))
            .await
        {
            tracing::warn!("failed to post interrupt notice: {e}");
        }
        ctx.persist().await;
    } else {
        ctx.post_error("nothing to interrupt; the agent is not running").await;
    }
}

pub(crate) async fn kill_session(ctx: &Arc<SessionCtx>, notice: &str) {
    streaming::flush(ctx).await;
    if let Err(e) = ctx.post_to_thread(notice).await {
        tracing::warn!("failed to post cancellation notice: {e}");
    }
    ctx.kill_agent().await;
    if let Some(manager) = ctx.manager.upgrade() {
        manager.remove_session(&ctx.key, true).await;
    }
}

async fn shutdown_session(ctx: &Arc<SessionCtx>) {
    streaming::flush(ctx).await;
    ctx.persist().await;
    ctx.kill_agent().await;
}

async fn handle_agent_exit(ctx: &Arc<SessionCtx>, code: Option<i32>) {
    let (was_restarting, was_interrupted) = {
        let mut state = ctx.lock_state();
        let was_restarting = state.is_restarting;
        if was_restarting {
            // The transient exit of a restart is expected; clearing the
            // flag here (and only here) closes the race a synchronous
            // clear used to have.
            state.is_restarting = false;
        }
        (was_restarting, state.was_interrupted)
    };
    if was_restarting {
        return;
    }

    streaming::flush(ctx).await;

    let notice = match code {
        Some(0) => "✅ Session ended.".to_string(),
        Some(code) => format!("❌ Agent exited unexpectedly (code {code})."),
        None => "❌ Agent exited unexpectedly.".to_string(),
    };
    if let Err(e) = ctx.post_to_thread(&notice).await {
        tracing::warn!("failed to post exit notice: {e}");
    }

    if let Some(manager) = ctx.manager.upgrade() {
        // An interrupted session keeps its persistence so a later resume
        // can pick it up.
        manager.remove_session(&ctx.key, !was_interrupted).await;
    }
}

async fn idle_sweep(ctx: &Arc<SessionCtx>) {
    let now = Utc::now();
    let (idle_for, warning_posted) = {
        let state = ctx.lock_state();
        (
            now.signed_duration_since(state.last_activity_at)
                .to_std()
                .unwrap_or_default(),
            state.timeout_warning_posted,
        )
    };

    // Expire a context prompt whose deadline passed: fall back to sending
    // the queued prompt without extra context.
    let expired_prompt = {
        let mut state = ctx.lock_state();
        let due = matches!(
            state.pending.get(PendingCategory::ContextPrompt),
            Some(PendingInteraction::ContextPrompt(p)) if p.deadline <= Instant::now()
        );
        if due {
            match state.pending.take(PendingCategory::ContextPrompt) {
                Some(PendingInteraction::ContextPrompt(p)) => Some(p),
                _ => None,
            }
        } else {
            None
        }
    };
    if let Some(prompt) = expired_prompt {
        let _ = ctx
            .platform
            .update_post(&prompt.post_id, "⏱️ No choice made — continuing without extra context.")
            .await;
        send_user_prompt(ctx, &prompt.queued_prompt, &prompt.queued_file_ids).await;
    }

    if idle_for >= ctx.config.idle_limit {
        timeout_session(ctx).await;
    } else if idle_for >= ctx.config.idle_limit.saturating_sub(ctx.config.idle_grace)
        && !warning_posted
    {
        let minutes = ctx.config.idle_grace.as_secs() / 60;
        if let Err(e) = ctx
            .post_to_thread(&format!(
                "⏳ This session has been idle for a while and will end in {minutes} minutes."
            ))
            .await
        {
            tracing::warn!("failed to post idle warning: {e}");
        }
        let mut state = ctx.lock_state();
        state.timeout_warning_posted = true;
    }
}

async fn timeout_session(ctx: &Arc<SessionCtx>) {
    streaming::flush(ctx).await;
    let minutes = ctx.config.idle_limit.as_secs() / 60;
    match ctx
        .post_interactive(
            &format!("⏰ Session ended after {minutes} minutes of inactivity. React 👍 to resume it."),
            &[tether_platform::emoji::APPROVE],
        )
        .await
    {
        Ok(post) => {
            let mut state = ctx.lock_state();
            state.lifecycle_post_id = Some(post.id);
        }
        Err(e) => tracing::warn!("failed to post timeout notice: {e}"),
    }
    ctx.persist().await;
    ctx.kill_agent().await;
    if let Some(manager) = ctx.manager.upgrade() {
        // Keep persistence: a reaction on the lifecycle post resumes.
        manager.remove_session(&ctx.key, false).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn session_key_display() {
        let key = SessionKey::new("mm", "thread-1");
        assert_eq!(key.to_string(), "mm:thread-1");
    }

    #[test]
    fn pending_set_replaces_same_category_only() {
        let mut pending = PendingSet::default();
        pending.insert(PendingInteraction::Approval(PendingApproval {
            post_id: "p1".to_string(),
            tool_use_id: "t1".to_string(),
        }));
        pending.insert(PendingInteraction::MessageApproval(PendingMessageApproval {
            post_id: "p2".to_string(),
            username: "mallory".to_string(),
            text: "hi".to_string(),
            file_ids: vec![],
        }));
        assert_eq!(pending.len(), 2);

        // Same category replaces, leaving the other untouched.
        let replaced = pending.insert(PendingInteraction::Approval(PendingApproval {
            post_id: "p3".to_string(),
            tool_use_id: "t2".to_string(),
        }));
        assert!(matches!(replaced, Some(PendingInteraction::Approval(p)) if p.post_id == "p1"));
        assert_eq!(pending.len(), 2);
        assert_eq!(
            pending.get(PendingCategory::Approval).map(|p| p.post_id()),
            Some("p3")
        );
        assert!(pending.find_by_post("p2").is_some());
        assert!(pending.find_by_post("p1").is_none());
    }

    #[test]
    fn allowed_users_always_contains_owner() {
        let state = SessionState::new("alice", PathBuf::from("/tmp"));
        assert!(state.is_user_allowed("alice"));
        assert!(!state.is_user_allowed("bob"));
    }

    #[test]
    fn owner_and_admin_are_privileged() {
        let state = SessionState::new("alice", PathBuf::from("/tmp"));
        let owner = User {
            id: "u1".to_string(),
            username: "alice".to_string(),
            is_admin: false,
        };
        let admin = User {
            id: "u2".to_string(),
            username: "root".to_string(),
            is_admin: true,
        };
        let rando = User {
            id: "u3".to_string(),
            username: "bob".to_string(),
            is_admin: false,
        };
        assert!(state.is_owner_or_admin(&owner));
        assert!(state.is_owner_or_admin(&admin));
        assert!(!state.is_owner_or_admin(&rando));
    }

    #[test]
    fn touch_clears_timeout_warning() {
        let mut state = SessionState::new("alice", PathBuf::from("/tmp"));
        state.timeout_warning_posted = true;
        state.touch();
        assert!(!state.timeout_warning_posted);
    }

    #[test]
    fn context_choice_labels() {
        assert_eq!(ContextChoice::Fresh.label(), "No context");
        assert_eq!(ContextChoice::LastN(5).label(), "Last 5 messages");
        assert_eq!(ContextChoice::FullThread.label(), "Full thread");
    }

    #[tokio::test]
    async fn idle_sweep_is_quiet_for_active_sessions() {
        let (ctx, mock, _rx) = crate::testutil::test_ctx().await;
        idle_sweep(&ctx).await;
        assert!(mock.calls().is_empty());
    }

    #[tokio::test]
    async fn idle_sweep_warns_once_inside_the_grace_window() {
        let (ctx, mock, _rx) = crate::testutil::test_ctx().await;
        {
            let mut state = ctx.lock_state();
            state.last_activity_at = Utc::now() - chrono::Duration::minutes(26);
        }
        idle_sweep(&ctx).await;
        idle_sweep(&ctx).await;

        let warnings = mock
            .live_posts()
            .iter()
            .filter(|p| p.message.contains("will end in 5 minutes"))
            .count();
        assert_eq!(warnings, 1);
        assert!(ctx.lock_state().timeout_warning_posted);
    }

    #[tokio::test]
    async fn idle_timeout_posts_resumable_lifecycle_post_and_persists() {
        let (ctx, mock, _rx) = crate::testutil::test_ctx().await;
        {
            let mut state = ctx.lock_state();
            state.last_activity_at = Utc::now() - chrono::Duration::minutes(31);
        }
        idle_sweep(&ctx).await;

        let lifecycle = {
            let state = ctx.lock_state();
            state.lifecycle_post_id.clone().unwrap()
        };
        assert!(mock
            .post_text(&lifecycle)
            .unwrap()
            .contains("React 👍 to resume"));

        // The persisted record survives with the lifecycle anchor, so a
        // reaction can find it later.
        let persisted = ctx.store.get(&ctx.key).await.unwrap();
        assert_eq!(persisted.lifecycle_post_id.as_deref(), Some(lifecycle.as_str()));
        let found = ctx
            .store
            .find_by_post_id(&ctx.key.platform_id, &lifecycle)
            .await;
        assert!(found.is_some());
    }

    #[tokio::test]
    async fn restart_flag_is_cleared_by_the_exit_handler_and_suppresses_notice() {
        let (ctx, mock, _rx) = crate::testutil::test_ctx().await;
        {
            let mut state = ctx.lock_state();
            state.is_restarting = true;
        }
        handle_agent_exit(&ctx, None).await;
        assert!(!ctx.lock_state().is_restarting);
        assert!(mock.live_posts().is_empty(), "restart exit leaked a notice");

        // A second exit without the flag reports normally.
        handle_agent_exit(&ctx, Some(1)).await;
        assert!(mock
            .live_posts()
            .iter()
            .any(|p| p.message.contains("code 1")));
    }
}
