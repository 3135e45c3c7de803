// Poisoned mutex should fail the program
#![allow(clippy::unwrap_used)]

//! `!` commands in a session thread, plus the routing of ordinary in-thread
//! messages (forwarding, context prompts, message approvals).

use std::path::PathBuf;
use std::sync::Arc;

use tokio::time::Instant;

use tether_platform::Post;
use tether_platform::ThreadHistoryOptions;
use tether_platform::User;
use tether_platform::emoji;

use crate::session;
use crate::session::ContextChoice;
use crate::session::PendingContextPrompt;
use crate::session::PendingExistingWorktreePrompt;
use crate::session::PendingInteraction;
use crate::session::PendingMessageApproval;
use crate::session::SessionCtx;
use crate::session::WorktreeChoice;
use crate::streaming;
use crate::worktree;
use crate::worktree::WorktreeInfo;

/// How long a context prompt waits before falling back to "no context".
const CONTEXT_PROMPT_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(10 * 60);
const FULL_THREAD_LIMIT: usize = 50;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Command {
    Help,
    Invite(String),
    Kick(String),
    PermissionsInteractive,
    Cd(String),
    Worktree(WorktreeCmd),
    Stop,
    Escape,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum WorktreeCmd {
    Create(Option<String>),
    Switch(String),
    List,
    Remove(String),
    Off,
}

pub(crate) enum Parsed {
    /// Forward to the agent as a user message.
    NotACommand,
    /// Recognized command prefix but bad arguments; the string is usage help.
    Invalid(String),
    Command(Command),
}

fn strip_user_arg(arg: &str) -> String {
    arg.trim_start_matches('@').to_string()
}

/// Parse a thread message into a command. `!` is the prefix; a few legacy
/// bare words are kept for muscle memory.
pub(crate) fn parse_command(text: &str) -> Parsed {
    let trimmed = text.trim();
    let lowered = trimmed.to_ascii_lowercase();
    if !trimmed.starts_with('!') {
        return match lowered.as_str() {
            "stop" | "cancel" => Parsed::Command(Command::Stop),
            "escape" => Parsed::Command(Command::Escape),
            "help" => Parsed::Command(Command::Help),
            _ => Parsed::NotACommand,
        };
    }

    let mut words = trimmed[1..].split_whitespace();
    let head = words.next().unwrap_or("").to_ascii_lowercase();
    let rest: Vec<&str> = words.collect();

    match head.as_str() {
        "help" => Parsed::Command(Command::Help),
        "stop" | "cancel" => Parsed::Command(Command::Stop),
        "escape" => Parsed::Command(Command::Escape),
        "invite" => match rest.first() {
            Some(user) => Parsed::Command(Command::Invite(strip_user_arg(user))),
            None => Parsed::Invalid("usage: `!invite @user`".to_string()),
        },
        "kick" => match rest.first() {
            Some(user) => Parsed::Command(Command::Kick(strip_user_arg(user))),
            None => Parsed::Invalid("usage: `!kick @user`".to_string()),
        },
        "permissions" => match rest.first().map(|s| s.to_ascii_lowercase()) {
            Some(mode) if mode == "interactive" => {
                Parsed::Command(Command::PermissionsInteractive)
            }
            _ => Parsed::Invalid(
                "usage: `!permissions interactive` (permissions can only be tightened)"
                    .to_string(),
            ),
        },
        "cd" => {
            if rest.is_empty() {
                Parsed::Invalid("usage: `!cd <directory>`".to_string())
            } else {
                Parsed::Command(Command::Cd(rest.join(" ")))
            }
        }
        "worktree" => parse_worktree(&rest),
        _ => Parsed::Invalid(format!(
            "unknown command `!{head}` — try `!help`"
        )),
    }
}

fn parse_worktree(rest: &[&str]) -> Parsed {
    const USAGE: &str = "usage: `!worktree <create [branch] | switch <branch> | list | remove <branch> | off>`";
    match rest.first().map(|s| s.to_ascii_lowercase()).as_deref() {
        Some("create") => Parsed::Command(Command::Worktree(WorktreeCmd::Create(
            rest.get(1).map(|s| s.to_string()),
        ))),
        Some("switch") => match rest.get(1) {
            Some(branch) => {
                Parsed::Command(Command::Worktree(WorktreeCmd::Switch(branch.to_string())))
            }
            None => Parsed::Invalid(USAGE.to_string()),
        },
        Some("list") => Parsed::Command(Command::Worktree(WorktreeCmd::List)),
        Some("remove") => match rest.get(1) {
            Some(branch) => {
                Parsed::Command(Command::Worktree(WorktreeCmd::Remove(branch.to_string())))
            }
            None => Parsed::Invalid(USAGE.to_string()),
        },
        Some("off") => Parsed::Command(Command::Worktree(WorktreeCmd::Off)),
        _ => Parsed::Invalid(USAGE.to_string()),
    }
}

/// Remove a leading `@bot` mention so the agent sees a clean prompt.
pub(crate) fn strip_bot_mention(text: &str, bot_name: &str) -> String {
    let trimmed = text.trim();
    let mention = format!("@{bot_name}");
    match trimmed.strip_prefix(&mention) {
        Some(rest) => rest.trim_start_matches(':').trim().to_string(),
        None => trimmed.to_string(),
    }
}

// ---------------------------------------------------------------------
// In-thread message routing
// ---------------------------------------------------------------------

pub(crate) async fn handle_user_message(ctx: &Arc<SessionCtx>, post: Post, user: User) {
    let allowed = {
        let state = ctx.lock_state();
        state.is_user_allowed(&user.username)
    };
    if !allowed {
        open_message_approval(ctx, &post, &user).await;
        return;
    }

    {
        let mut state = ctx.lock_state();
        state.touch();
    }

    match parse_command(&post.message) {
        Parsed::Command(cmd) => handle_command(ctx, cmd, &user).await,
        Parsed::Invalid(usage) => ctx.post_error(&usage).await,
        Parsed::NotACommand => {
            let needs_prompt = {
                let state = ctx.lock_state();
                state.needs_context_prompt
            };
            if needs_prompt {
                open_context_prompt(ctx, &post).await;
            } else {
                forward_user_message(ctx, &post.message, &post.file_ids).await;
            }
        }
    }
}

/// Ship a user message to the agent, restarting the streaming post below
/// it and re-bottoming the task list.
pub(crate) async fn forward_user_message(ctx: &Arc<SessionCtx>, text: &str, file_ids: &[String]) {
    streaming::flush(ctx).await;
    {
        let mut state = ctx.lock_state();
        // The next agent reply starts a fresh post below this message.
        state.current_post_id = None;
        state.pending_content.clear();
        state.is_processing = true;
        state.was_interrupted = false;
        state.message_count += 1;
        state.typing_deadline = Some(Instant::now() + ctx.config.typing_tick);
    }
    streaming::bump_tasks_to_bottom(ctx).await;
    session::send_user_prompt(ctx, text, file_ids).await;
    ctx.persist().await;
}

async fn open_message_approval(ctx: &Arc<SessionCtx>, post: &Post, user: &User) {
    let owner = { ctx.lock_state().started_by.clone() };
    // Quote only the first line; the full text is forwarded on approval.
    let first = tether_common::text::first_line(&post.message);
    let preview = tether_common::text::truncate_with_ellipsis(&first, 200);
    let message = format!(
        "📨 @{} wants to send a message to @{owner}'s session:\n> {preview}\n\n👍 allow once · ✅ invite to session · 👎 deny",
        user.username
    );
    match ctx
        .post_interactive(&message, &[emoji::APPROVE, emoji::ALLOW_ALL, emoji::DENY])
        .await
    {
        Ok(prompt_post) => {
            let mut state = ctx.lock_state();
            state
                .pending
                .insert(PendingInteraction::MessageApproval(PendingMessageApproval {
                    post_id: prompt_post.id,
                    username: user.username.clone(),
                    text: post.message.clone(),
                    file_ids: post.file_ids.clone(),
                }));
        }
        Err(e) => tracing::warn!("failed to post message approval: {e}"),
    }
}

async fn open_context_prompt(ctx: &Arc<SessionCtx>, post: &Post) {
    let history_len = ctx
        .platform
        .get_thread_history(
            &ctx.key.thread_id,
            ThreadHistoryOptions {
                limit: None,
                exclude_bot_messages: true,
            },
        )
        .await
        .map(|posts| posts.len())
        .unwrap_or(0);

    let options = vec![
        ContextChoice::Fresh,
        ContextChoice::LastN(5),
        ContextChoice::LastN(10),
        ContextChoice::FullThread,
    ];
    let mut message = format!(
        "🧭 The working directory changed, so the agent starts with fresh context.\nInclude earlier thread messages ({history_len} available)?"
    );
    for (idx, option) in options.iter().enumerate() {
        message.push_str(&format!("\n{}️⃣ {}", idx + 1, option.label()));
    }

    let emojis: Vec<&str> = emoji::NUMBERS[..options.len()].to_vec();
    match ctx.post_interactive(&message, &emojis).await {
        Ok(prompt_post) => {
            let mut state = ctx.lock_state();
            state.needs_context_prompt = false;
            state
                .pending
                .insert(PendingInteraction::ContextPrompt(PendingContextPrompt {
                    post_id: prompt_post.id,
                    queued_prompt: post.message.clone(),
                    queued_file_ids: post.file_ids.clone(),
                    thread_message_count: history_len,
                    options,
                    deadline: Instant::now() + CONTEXT_PROMPT_TIMEOUT,
                }));
        }
        Err(e) => {
            tracing::warn!("failed to post context prompt; forwarding without context: {e}");
            {
                let mut state = ctx.lock_state();
                state.needs_context_prompt = false;
            }
            forward_user_message(ctx, &post.message, &post.file_ids).await;
        }
    }
}

/// Build the prompt for a context-prompt answer: the queued message,
/// optionally preceded by quoted thread history.
pub(crate) async fn resolve_context_choice(
    ctx: &Arc<SessionCtx>,
    prompt: &PendingContextPrompt,
    choice: ContextChoice,
) -> String {
    let limit = match choice {
        ContextChoice::Fresh => return prompt.queued_prompt.clone(),
        ContextChoice::LastN(n) => n,
        ContextChoice::FullThread => FULL_THREAD_LIMIT,
    };
    let history = ctx
        .platform
        .get_thread_history(
            &ctx.key.thread_id,
            ThreadHistoryOptions {
                limit: Some(limit),
                exclude_bot_messages: true,
            },
        )
        .await
        .unwrap_or_default();
    if history.is_empty() {
        return prompt.queued_prompt.clone();
    }
    let mut out = String::from("Earlier conversation in this thread:\n");
    for post in &history {
        out.push_str(&format!("> {}\n", post.message.replace('\n', "\n> ")));
    }
    out.push('\n');
    out.push_str(&prompt.queued_prompt);
    out
}

// ---------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------

const HELP_TEXT: &str = "\
#### Commands
| Command | Effect |
|---|---|
| `!help` | Show this table |
| `!invite @user` | Let a user talk to this session (owner/admin) |
| `!kick @user` | Remove a user from this session (owner/admin) |
| `!permissions interactive` | Require reaction approval for every tool use |
| `!cd <dir>` | Restart the agent in another directory (owner/admin) |
| `!worktree create [branch]` | Isolate this session in a git worktree (owner/admin) |
| `!worktree switch <branch>` | Move to an existing worktree (owner/admin) |
| `!worktree list` | List worktrees of the current repo |
| `!worktree remove <branch>` | Remove a worktree (owner/admin) |
| `!worktree off` | Return to the main checkout (owner/admin) |
| `!stop` | End this session |
| `!escape` | Interrupt the current turn, keep the session |

React ⏸️ to interrupt, ❌ to stop.";

pub(crate) async fn handle_command(ctx: &Arc<SessionCtx>, cmd: Command, user: &User) {
    let privileged = {
        let state = ctx.lock_state();
        state.is_owner_or_admin(user)
    };

    match cmd {
        Command::Help => {
            if let Err(e) = ctx.post_to_thread(HELP_TEXT).await {
                tracing::warn!("failed to post help: {e}");
            }
        }
        Command::Stop => {
            session::kill_session(
                ctx,
                &format!("🛑 Session stopped by @{}.", user.username),
            )
            .await;
        }
        Command::Escape => {
            session::interrupt_session(ctx, &user.username).await;
        }
        Command::Invite(username) => {
            if !privileged {
                ctx.post_error("only the session owner or an admin can invite users").await;
                return;
            }
            {
                let mut state = ctx.lock_state();
                if !state.allowed_users.contains(&username) {
                    state.allowed_users.push(username.clone());
                }
            }
            ctx.repaint_header().await;
            ctx.persist().await;
            let _ = ctx
                .post_to_thread(&format!("✅ @{username} can now talk to this session."))
                .await;
        }
        Command::Kick(username) => {
            if !privileged {
                ctx.post_error("only the session owner or an admin can kick users").await;
                return;
            }
            let owner = { ctx.lock_state().started_by.clone() };
            if username == owner {
                ctx.post_error("the session owner cannot be kicked").await;
                return;
            }
            if ctx.platform.is_user_allowed(&username) {
                ctx.post_error(&format!(
                    "@{username} is on the global allow-list and cannot be kicked"
                ))
                .await;
                return;
            }
            {
                let mut state = ctx.lock_state();
                state.allowed_users.retain(|u| u != &username);
            }
            ctx.repaint_header().await;
            ctx.persist().await;
            let _ = ctx
                .post_to_thread(&format!("👋 @{username} was removed from this session."))
                .await;
        }
        Command::PermissionsInteractive => {
            let already = {
                let state = ctx.lock_state();
                state.force_interactive_permissions
            };
            if already {
                ctx.post_error("permissions are already interactive for this session").await;
                return;
            }
            {
                let mut state = ctx.lock_state();
                state.force_interactive_permissions = true;
            }
            let _ = ctx
                .post_to_thread("🔐 Switching to interactive permissions; restarting the agent…")
                .await;
            // Same directory, so the agent session can be resumed.
            session::restart_session(ctx, None, None, true).await;
        }
        Command::Cd(path) => {
            if !privileged {
                ctx.post_error("only the session owner or an admin can change directories").await;
                return;
            }
            handle_cd(ctx, &path).await;
        }
        Command::Worktree(wt) => {
            if !privileged {
                ctx.post_error("only the session owner or an admin can manage worktrees").await;
                return;
            }
            handle_worktree(ctx, wt).await;
        }
    }
}

async fn handle_cd(ctx: &Arc<SessionCtx>, path: &str) {
    let current = { ctx.lock_state().working_dir.clone() };
    let target = if PathBuf::from(path).is_absolute() {
        PathBuf::from(path)
    } else {
        current.join(path)
    };
    match tokio::fs::metadata(&target).await {
        Ok(meta) if meta.is_dir() => {}
        _ => {
            let err = crate::error::TetherErr::InvalidDirectory(target.display().to_string());
            ctx.post_error(&crate::error::user_message(&err)).await;
            return;
        }
    }
    let _ = ctx
        .post_to_thread(&format!(
            "📂 Moving to `{}` — the agent restarts with fresh context there.",
            target.display()
        ))
        .await;
    session::restart_session(ctx, Some(target), Some(None), false).await;
}

async fn handle_worktree(ctx: &Arc<SessionCtx>, cmd: WorktreeCmd) {
    let working_dir = { ctx.lock_state().working_dir.clone() };
    let Some(repo_root) = current_repo_root(ctx, &working_dir).await else {
        return;
    };

    match cmd {
        WorktreeCmd::List => {
            match worktree::list_worktrees(&repo_root).await {
                Ok(entries) => {
                    let mut out = String::from("🌿 **Worktrees**");
                    for entry in entries {
                        let branch = entry.branch.as_deref().unwrap_or("(detached)");
                        out.push_str(&format!("\n- `{branch}` → `{}`", entry.path.display()));
                    }
                    let _ = ctx.post_to_thread(&out).await;
                }
                Err(e) => ctx.post_error(&crate::error::user_message(&e)).await,
            }
        }
        WorktreeCmd::Create(branch) => {
            let branch = branch.unwrap_or_else(|| {
                format!(
                    "tether/{}",
                    tether_common::ids::short_id(&ctx.key.thread_id)
                )
            });
            if !worktree::is_valid_branch_name(&branch) {
                ctx.post_error(&format!("invalid branch name: `{branch}`")).await;
                return;
            }

            // A worktree for this branch may already exist; offer to join it
            // instead of failing the add.
            if let Ok(entries) = worktree::list_worktrees(&repo_root).await
                && let Some(existing) = entries
                    .iter()
                    .find(|e| e.branch.as_deref() == Some(branch.as_str()))
            {
                offer_existing_worktree(ctx, existing.path.clone(), branch).await;
                return;
            }

            let path = worktree::worktree_path_for(&repo_root, &branch);
            match worktree::add_worktree(&repo_root, &path, &branch).await {
                Ok(()) => {
                    let info = WorktreeInfo {
                        repo_root: repo_root.clone(),
                        worktree_path: path.clone(),
                        branch: branch.clone(),
                    };
                    let _ = ctx
                        .post_to_thread(&format!(
                            "🌿 Created worktree `{branch}` at `{}` — restarting there.",
                            path.display()
                        ))
                        .await;
                    session::restart_session(ctx, Some(path), Some(Some(info)), false).await;
                }
                Err(e) => {
                    ctx.post_error(&format!(
                        "{} — if the branch already exists, try `!worktree switch {branch}`",
                        crate::error::user_message(&e)
                    ))
                    .await;
                }
            }
        }
        WorktreeCmd::Switch(branch) => {
            match worktree::list_worktrees(&repo_root).await {
                Ok(entries) => {
                    match entries
                        .into_iter()
                        .find(|e| e.branch.as_deref() == Some(branch.as_str()))
                    {
                        Some(entry) => {
                            let info = WorktreeInfo {
                                repo_root: repo_root.clone(),
                                worktree_path: entry.path.clone(),
                                branch: branch.clone(),
                            };
                            let _ = ctx
                                .post_to_thread(&format!(
                                    "🌿 Switching to worktree `{branch}` — restarting there."
                                ))
                                .await;
                            session::restart_session(
                                ctx,
                                Some(entry.path),
                                Some(Some(info)),
                                false,
                            )
                            .await;
                        }
                        None => {
                            ctx.post_error(&format!(
                                "no worktree for branch `{branch}` — `!worktree list` shows what exists"
                            ))
                            .await;
                        }
                    }
                }
                Err(e) => ctx.post_error(&crate::error::user_message(&e)).await,
            }
        }
        WorktreeCmd::Remove(branch) => {
            let active_branch = {
                let state = ctx.lock_state();
                state.worktree.as_ref().map(|w| w.branch.clone())
            };
            if active_branch.as_deref() == Some(branch.as_str()) {
                ctx.post_error("this session is inside that worktree — `!worktree off` first").await;
                return;
            }
            match worktree::list_worktrees(&repo_root).await {
                Ok(entries) => {
                    match entries
                        .into_iter()
                        .find(|e| e.branch.as_deref() == Some(branch.as_str()))
                    {
                        Some(entry) => match worktree::remove_worktree(&repo_root, &entry.path)
                            .await
                        {
                            Ok(()) => {
                                let _ = ctx
                                    .post_to_thread(&format!("🗑️ Removed worktree `{branch}`."))
                                    .await;
                            }
                            Err(e) => ctx.post_error(&crate::error::user_message(&e)).await,
                        },
                        None => {
                            ctx.post_error(&format!("no worktree for branch `{branch}`")).await;
                        }
                    }
                }
                Err(e) => ctx.post_error(&crate::error::user_message(&e)).await,
            }
        }
        WorktreeCmd::Off => {
            let info = {
                let state = ctx.lock_state();
                state.worktree.clone()
            };
            match info {
                Some(info) => {
                    let _ = ctx
                        .post_to_thread(&format!(
                            "🌿 Leaving worktree `{}` — back to `{}`.",
                            info.branch,
                            info.repo_root.display()
                        ))
                        .await;
                    session::restart_session(
                        ctx,
                        Some(info.repo_root.clone()),
                        Some(None),
                        false,
                    )
                    .await;
                }
                None => {
                    ctx.post_error("this session is not using a worktree").await;
                }
            }
        }
    }
}

async fn current_repo_root(ctx: &Arc<SessionCtx>, working_dir: &std::path::Path) -> Option<PathBuf> {
    // Prefer the root recorded with an active worktree, so `!worktree`
    // commands keep operating on the main repository.
    let recorded = {
        let state = ctx.lock_state();
        state.worktree.as_ref().map(|w| w.repo_root.clone())
    };
    if let Some(root) = recorded {
        return Some(root);
    }
    match worktree::repo_root(working_dir).await {
        Some(root) => Some(root),
        None => {
            let err = crate::error::TetherErr::NotAGitRepo(working_dir.display().to_string());
            ctx.post_error(&crate::error::user_message(&err)).await;
            None
        }
    }
}

async fn offer_existing_worktree(ctx: &Arc<SessionCtx>, path: PathBuf, branch: String) {
    let message = format!(
        "🌿 A worktree for `{branch}` already exists at `{}`.\n1️⃣ join it · ❌ keep the current directory",
        path.display()
    );
    match ctx
        .post_interactive(&message, &[emoji::NUMBERS[0], emoji::CANCEL])
        .await
    {
        Ok(post) => {
            let mut state = ctx.lock_state();
            state.pending.insert(PendingInteraction::ExistingWorktreePrompt(
                PendingExistingWorktreePrompt {
                    post_id: post.id,
                    choices: vec![WorktreeChoice { path, branch }],
                    queued_prompt: String::new(),
                    queued_file_ids: Vec::new(),
                },
            ));
        }
        Err(e) => tracing::warn!("failed to post existing-worktree prompt: {e}"),
    }
}
