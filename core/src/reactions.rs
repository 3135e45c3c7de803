// Poisoned mutex should fail the program
#![allow(clippy::unwrap_used)]

//! Routes emoji reactions to the session-level controls (pause/stop) and to
//! whichever pending interaction owns the reacted post.

use std::sync::Arc;

use tether_platform::Reaction;
use tether_platform::User;
use tether_platform::emoji;

use crate::commands;
use crate::interpreter;
use crate::session;
use crate::session::PendingCategory;
use crate::session::PendingInteraction;
use crate::session::SessionCtx;
use crate::worktree;
use crate::worktree::WorktreeInfo;

pub(crate) async fn handle_reaction(ctx: &Arc<SessionCtx>, reaction: Reaction, user: User) {
    // The bot seeds its own option reactions; those must never dispatch.
    // This filter is also what tolerates users reacting before all option
    // emojis are in place.
    if user.id == ctx.platform.bot_user().id {
        return;
    }

    let emoji_name = reaction.emoji_name.clone();
    let (allowed, privileged, pending_category) = {
        let state = ctx.lock_state();
        (
            state.is_user_allowed(&user.username),
            state.is_owner_or_admin(&user),
            state
                .pending
                .find_by_post(&reaction.post_id)
                .map(|p| p.category()),
        )
    };

    // Cancel and escape act on the whole session from any of its posts,
    // except on worktree prompts where ❌ means "skip".
    let on_worktree_prompt = matches!(
        pending_category,
        Some(PendingCategory::WorktreePrompt) | Some(PendingCategory::ExistingWorktreePrompt)
    );
    if emoji::is_cancel(&emoji_name) && !on_worktree_prompt {
        if allowed {
            session::kill_session(
                ctx,
                &format!("🛑 Session stopped by @{}.", user.username),
            )
            .await;
        }
        return;
    }
    if emoji::is_escape(&emoji_name) {
        if allowed {
            session::interrupt_session(ctx, &user.username).await;
        }
        return;
    }

    match pending_category {
        Some(PendingCategory::ContextPrompt) if allowed => {
            handle_context_reaction(ctx, &emoji_name, &user).await;
        }
        Some(PendingCategory::QuestionSet) if allowed => {
            handle_question_reaction(ctx, &reaction, &emoji_name, &user).await;
        }
        Some(PendingCategory::Approval) if allowed => {
            handle_plan_reaction(ctx, &emoji_name, &user).await;
        }
        Some(PendingCategory::MessageApproval) if privileged => {
            handle_message_approval_reaction(ctx, &emoji_name, &user).await;
        }
        Some(PendingCategory::WorktreePrompt) if privileged => {
            handle_worktree_prompt_reaction(ctx, &emoji_name, &user).await;
        }
        Some(PendingCategory::ExistingWorktreePrompt) if privileged => {
            handle_existing_worktree_reaction(ctx, &emoji_name, &user).await;
        }
        _ => {}
    }
}

async fn handle_context_reaction(ctx: &Arc<SessionCtx>, emoji_name: &str, user: &User) {
    let Some(idx) = emoji::number_choice(emoji_name) else {
        return;
    };
    let prompt = {
        let mut state = ctx.lock_state();
        let valid = matches!(
            state.pending.get(PendingCategory::ContextPrompt),
            Some(PendingInteraction::ContextPrompt(p)) if idx < p.options.len()
        );
        if !valid {
            return;
        }
        match state.pending.take(PendingCategory::ContextPrompt) {
            Some(PendingInteraction::ContextPrompt(p)) => p,
            _ => return,
        }
    };
    let choice = prompt.options[idx];
    let _ = ctx
        .platform
        .update_post(
            &prompt.post_id,
            &format!("🧭 Context: {} (chosen by @{})", choice.label(), user.username),
        )
        .await;
    let full_prompt = commands::resolve_context_choice(ctx, &prompt, choice).await;
    commands::forward_user_message(ctx, &full_prompt, &prompt.queued_file_ids).await;
}

async fn handle_question_reaction(
    ctx: &Arc<SessionCtx>,
    reaction: &Reaction,
    emoji_name: &str,
    user: &User,
) {
    let Some(idx) = emoji::number_choice(emoji_name) else {
        return;
    };
    let mut set = {
        let mut state = ctx.lock_state();
        let valid = matches!(
            state.pending.get(PendingCategory::QuestionSet),
            // Only the currently shown question accepts answers.
            Some(PendingInteraction::QuestionSet(s))
                if s.post_id == reaction.post_id && idx < s.questions[s.current].options.len()
        );
        if !valid {
            return;
        }
        match state.pending.take(PendingCategory::QuestionSet) {
            Some(PendingInteraction::QuestionSet(s)) => s,
            _ => return,
        }
    };

    let label = set.questions[set.current].options[idx].label.clone();
    set.questions[set.current].answer = Some(label.clone());
    let answered = format!(
        "✔️ {} — **{label}** (@{})",
        if set.questions[set.current].header.is_empty() {
            set.questions[set.current].question.clone()
        } else {
            set.questions[set.current].header.clone()
        },
        user.username
    );
    let _ = ctx.platform.update_post(&set.post_id, &answered).await;

    if set.current + 1 < set.questions.len() {
        set.current += 1;
        if interpreter::post_current_question(ctx, &mut set).await {
            let mut state = ctx.lock_state();
            state.pending.insert(PendingInteraction::QuestionSet(set));
        }
        return;
    }

    // Last answer: one aggregated tool result for the original call.
    let answers = interpreter::aggregate_answers(&set);
    if let Err(e) = ctx.send_tool_result(&set.tool_use_id, &answers).await {
        tracing::warn!("failed to deliver question answers: {e}");
    }
    let mut state = ctx.lock_state();
    state.touch();
}

async fn handle_plan_reaction(ctx: &Arc<SessionCtx>, emoji_name: &str, user: &User) {
    let approve = emoji::is_approval(emoji_name);
    let deny = emoji::is_denial(emoji_name);
    if !approve && !deny {
        return;
    }
    let approval = {
        let mut state = ctx.lock_state();
        match state.pending.take(PendingCategory::Approval) {
            Some(PendingInteraction::Approval(a)) => a,
            _ => return,
        }
    };

    if approve {
        {
            let mut state = ctx.lock_state();
            state.plan_approved = true;
            state.touch();
        }
        let _ = ctx
            .platform
            .update_post(
                &approval.post_id,
                &format!("✅ Plan approved by @{}", user.username),
            )
            .await;
        if let Err(e) = ctx
            .send_tool_result(
                &approval.tool_use_id,
                &format!("Approved by {} — go ahead with the implementation.", user.username),
            )
            .await
        {
            tracing::warn!("failed to deliver plan approval: {e}");
        }
    } else {
        let _ = ctx
            .platform
            .update_post(
                &approval.post_id,
                &format!("👎 Plan rejected by @{} — keep planning.", user.username),
            )
            .await;
        if let Err(e) = ctx
            .send_tool_result(
                &approval.tool_use_id,
                "The user rejected the plan. Stay in plan mode and revise it based on the discussion.",
            )
            .await
        {
            tracing::warn!("failed to deliver plan rejection: {e}");
        }
    }
}

async fn handle_message_approval_reaction(ctx: &Arc<SessionCtx>, emoji_name: &str, user: &User) {
    let approve_once = emoji::is_approval(emoji_name);
    let invite = emoji::is_allow_all(emoji_name);
    let deny = emoji::is_denial(emoji_name);
    if !approve_once && !invite && !deny {
        return;
    }
    let approval = {
        let mut state = ctx.lock_state();
        match state.pending.take(PendingCategory::MessageApproval) {
            Some(PendingInteraction::MessageApproval(a)) => a,
            _ => return,
        }
    };

    if deny {
        let _ = ctx
            .platform
            .update_post(
                &approval.post_id,
                &format!("🚫 Message from @{} denied by @{}.", approval.username, user.username),
            )
            .await;
        return;
    }

    if invite {
        {
            let mut state = ctx.lock_state();
            if !state.allowed_users.contains(&approval.username) {
                state.allowed_users.push(approval.username.clone());
            }
        }
        ctx.repaint_header().await;
        ctx.persist().await;
    }
    let verb = if invite { "invited to the session" } else { "allowed once" };
    let _ = ctx
        .platform
        .update_post(
            &approval.post_id,
            &format!("✅ @{} {verb} by @{}.", approval.username, user.username),
        )
        .await;
    commands::forward_user_message(ctx, &approval.text, &approval.file_ids).await;
}

async fn handle_worktree_prompt_reaction(ctx: &Arc<SessionCtx>, emoji_name: &str, user: &User) {
    let create = emoji::number_choice(emoji_name) == Some(0) || emoji::is_approval(emoji_name);
    let skip = emoji::is_cancel(emoji_name);
    if !create && !skip {
        return;
    }
    let prompt = {
        let mut state = ctx.lock_state();
        match state.pending.take(PendingCategory::WorktreePrompt) {
            Some(PendingInteraction::WorktreePrompt(p)) => p,
            _ => return,
        }
    };

    if create {
        let working_dir = { ctx.lock_state().working_dir.clone() };
        match worktree::repo_root(&working_dir).await {
            Some(repo_root) => {
                let path = worktree::worktree_path_for(&repo_root, &prompt.suggested_branch);
                match worktree::add_worktree(&repo_root, &path, &prompt.suggested_branch).await {
                    Ok(()) => {
                        let _ = ctx
                            .platform
                            .update_post(
                                &prompt.post_id,
                                &format!(
                                    "🌿 Worktree `{}` created at `{}`.",
                                    prompt.suggested_branch,
                                    path.display()
                                ),
                            )
                            .await;
                        let mut state = ctx.lock_state();
                        state.worktree = Some(WorktreeInfo {
                            repo_root,
                            worktree_path: path.clone(),
                            branch: prompt.suggested_branch.clone(),
                        });
                        state.working_dir = path;
                    }
                    Err(e) => {
                        ctx.post_error(&format!(
                            "{} — continuing in the main checkout",
                            crate::error::user_message(&e)
                        ))
                        .await;
                    }
                }
            }
            None => {
                ctx.post_error("the working directory is no longer a git repository").await;
            }
        }
    } else {
        let _ = ctx
            .platform
            .update_post(&prompt.post_id, "➡️ Continuing in the shared checkout.")
            .await;
    }

    session::launch_agent_with_prompt(ctx, &prompt.queued_prompt, &prompt.queued_file_ids, user)
        .await;
}

async fn handle_existing_worktree_reaction(ctx: &Arc<SessionCtx>, emoji_name: &str, user: &User) {
    let join_idx = emoji::number_choice(emoji_name);
    let skip = emoji::is_cancel(emoji_name);
    if join_idx.is_none() && !skip {
        return;
    }
    let prompt = {
        let mut state = ctx.lock_state();
        let valid = match state.pending.get(PendingCategory::ExistingWorktreePrompt) {
            Some(PendingInteraction::ExistingWorktreePrompt(p)) => {
                skip || matches!(join_idx, Some(idx) if idx < p.choices.len())
            }
            _ => false,
        };
        if !valid {
            return;
        }
        match state.pending.take(PendingCategory::ExistingWorktreePrompt) {
            Some(PendingInteraction::ExistingWorktreePrompt(p)) => p,
            _ => return,
        }
    };

    if skip {
        let _ = ctx
            .platform
            .update_post(&prompt.post_id, "➡️ Keeping the current directory.")
            .await;
        return;
    }

    let choice = &prompt.choices[join_idx.unwrap_or(0)];
    let working_dir = { ctx.lock_state().working_dir.clone() };
    let repo_root = worktree::repo_root(&working_dir)
        .await
        .unwrap_or_else(|| working_dir.clone());
    let info = WorktreeInfo {
        repo_root,
        worktree_path: choice.path.clone(),
        branch: choice.branch.clone(),
    };
    let _ = ctx
        .platform
        .update_post(
            &prompt.post_id,
            &format!(
                "🌿 Joining worktree `{}` (chosen by @{}).",
                choice.branch, user.username
            ),
        )
        .await;
    session::restart_session(ctx, Some(choice.path.clone()), Some(Some(info)), false).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::AgentOutput;
    use crate::session::ContextChoice;
    use crate::session::PendingApproval;
    use crate::session::PendingContextPrompt;
    use crate::session::PendingMessageApproval;
    use crate::session::PendingQuestion;
    use crate::session::PendingQuestionSet;
    use crate::session::QuestionOption;
    use crate::testutil::install_echo_agent;
    use crate::testutil::test_ctx;
    use pretty_assertions::assert_eq;
    use tether_platform::ChatPlatform;
    use tether_platform::mock::mock_user;
    use tokio::time::Instant;

    fn reaction(post_id: &str, emoji: &str, user: &User) -> Reaction {
        Reaction {
            post_id: post_id.to_string(),
            user_id: user.id.clone(),
            emoji_name: emoji.to_string(),
        }
    }

    fn two_option_question(header: &str) -> PendingQuestion {
        PendingQuestion {
            header: header.to_string(),
            question: format!("{header}?"),
            options: vec![
                QuestionOption {
                    label: "Yes".to_string(),
                    description: String::new(),
                },
                QuestionOption {
                    label: "No".to_string(),
                    description: String::new(),
                },
            ],
            answer: None,
        }
    }

    #[tokio::test]
    async fn bot_reactions_are_ignored() {
        let (ctx, mock, _rx) = test_ctx().await;
        {
            let mut state = ctx.lock_state();
            state.pending.insert(PendingInteraction::Approval(PendingApproval {
                post_id: "p1".to_string(),
                tool_use_id: "t1".to_string(),
            }));
        }
        let bot = mock.bot_user().clone();
        handle_reaction(&ctx, reaction("p1", "+1", &bot), bot.clone()).await;
        // The pending approval survived the bot's own seed reaction.
        assert!(!ctx.lock_state().pending.is_empty());
    }

    #[tokio::test]
    async fn plan_approval_sets_flag_and_sends_tool_result() {
        let (ctx, mock, _rx) = test_ctx().await;
        let agent_rx = install_echo_agent(&ctx).await;
        let post = ctx.post_to_thread("plan?").await.unwrap();
        {
            let mut state = ctx.lock_state();
            state.pending.insert(PendingInteraction::Approval(PendingApproval {
                post_id: post.id.clone(),
                tool_use_id: "plan-1".to_string(),
            }));
        }

        let alice = mock_user("alice");
        handle_reaction(&ctx, reaction(&post.id, "+1", &alice), alice).await;

        {
            let state = ctx.lock_state();
            assert!(state.plan_approved);
            assert!(state.pending.is_empty());
        }
        assert!(mock.post_text(&post.id).unwrap().contains("approved by @alice"));

        match agent_rx.recv().await.unwrap() {
            AgentOutput::Event(v) => {
                assert_eq!(v["message"]["content"][0]["tool_use_id"], "plan-1");
                assert!(v["message"]["content"][0]["content"]
                    .as_str()
                    .unwrap()
                    .contains("Approved"));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn plan_denial_keeps_plan_unapproved() {
        let (ctx, mock, _rx) = test_ctx().await;
        let _agent_rx = install_echo_agent(&ctx).await;
        let post = ctx.post_to_thread("plan?").await.unwrap();
        {
            let mut state = ctx.lock_state();
            state.pending.insert(PendingInteraction::Approval(PendingApproval {
                post_id: post.id.clone(),
                tool_use_id: "plan-1".to_string(),
            }));
        }
        let alice = mock_user("alice");
        handle_reaction(&ctx, reaction(&post.id, "thumbsdown", &alice), alice).await;
        assert!(!ctx.lock_state().plan_approved);
        assert!(mock.post_text(&post.id).unwrap().contains("rejected"));
    }

    #[tokio::test]
    async fn question_flow_aggregates_answers() {
        let (ctx, mock, _rx) = test_ctx().await;
        let agent_rx = install_echo_agent(&ctx).await;
        let post = ctx.post_to_thread("q1").await.unwrap();
        {
            let mut state = ctx.lock_state();
            state
                .pending
                .insert(PendingInteraction::QuestionSet(PendingQuestionSet {
                    tool_use_id: "ask-1".to_string(),
                    post_id: post.id.clone(),
                    questions: vec![two_option_question("Database"), two_option_question("Cache")],
                    current: 0,
                }));
        }

        let alice = mock_user("alice");
        // Answer question 1 with option 2 ("No").
        handle_reaction(&ctx, reaction(&post.id, "two", &alice), alice.clone()).await;

        let second_post_id = {
            let state = ctx.lock_state();
            match state.pending.get(PendingCategory::QuestionSet) {
                Some(PendingInteraction::QuestionSet(s)) => {
                    assert_eq!(s.current, 1);
                    assert_eq!(s.questions[0].answer.as_deref(), Some("No"));
                    s.post_id.clone()
                }
                other => panic!("unexpected pending: {other:?}"),
            }
        };
        assert_ne!(second_post_id, post.id);
        assert!(mock.post_text(&post.id).unwrap().contains("**No**"));

        // A stale reaction on the first post is ignored now.
        handle_reaction(&ctx, reaction(&post.id, "one", &alice), alice.clone()).await;
        assert!(!ctx.lock_state().pending.is_empty());

        // Answer question 2 with option 1 ("Yes") → aggregated tool result.
        handle_reaction(&ctx, reaction(&second_post_id, "one", &alice), alice).await;
        assert!(ctx.lock_state().pending.is_empty());

        match agent_rx.recv().await.unwrap() {
            AgentOutput::Event(v) => {
                let content = v["message"]["content"][0]["content"].as_str().unwrap();
                assert_eq!(content, "Database: No\nCache: Yes");
                assert_eq!(v["message"]["content"][0]["tool_use_id"], "ask-1");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn unknown_emoji_on_question_is_ignored() {
        let (ctx, _mock, _rx) = test_ctx().await;
        let post = ctx.post_to_thread("q").await.unwrap();
        {
            let mut state = ctx.lock_state();
            state
                .pending
                .insert(PendingInteraction::QuestionSet(PendingQuestionSet {
                    tool_use_id: "ask".to_string(),
                    post_id: post.id.clone(),
                    questions: vec![two_option_question("Q")],
                    current: 0,
                }));
        }
        let alice = mock_user("alice");
        handle_reaction(&ctx, reaction(&post.id, "eyes", &alice), alice.clone()).await;
        // Number beyond the option count is also ignored.
        handle_reaction(&ctx, reaction(&post.id, "four", &alice), alice).await;
        assert!(!ctx.lock_state().pending.is_empty());
    }

    #[tokio::test]
    async fn reactions_from_non_allowed_users_are_ignored() {
        let (ctx, _mock, _rx) = test_ctx().await;
        let post = ctx.post_to_thread("plan?").await.unwrap();
        {
            let mut state = ctx.lock_state();
            state.pending.insert(PendingInteraction::Approval(PendingApproval {
                post_id: post.id.clone(),
                tool_use_id: "t".to_string(),
            }));
        }
        let mallory = mock_user("mallory");
        handle_reaction(&ctx, reaction(&post.id, "+1", &mallory), mallory).await;
        let state = ctx.lock_state();
        assert!(!state.plan_approved);
        assert!(!state.pending.is_empty());
    }

    #[tokio::test]
    async fn message_approval_invite_adds_user_and_forwards() {
        let (ctx, mock, _rx) = test_ctx().await;
        let _agent_rx = install_echo_agent(&ctx).await;
        let post = ctx.post_to_thread("approve?").await.unwrap();
        {
            let mut state = ctx.lock_state();
            state
                .pending
                .insert(PendingInteraction::MessageApproval(PendingMessageApproval {
                    post_id: post.id.clone(),
                    username: "bob".to_string(),
                    text: "run tests please".to_string(),
                    file_ids: vec![],
                }));
        }
        let alice = mock_user("alice");
        handle_reaction(&ctx, reaction(&post.id, "white_check_mark", &alice), alice).await;

        assert!(ctx.lock_state().is_user_allowed("bob"));
        assert!(mock.post_text(&post.id).unwrap().contains("invited"));
    }

    #[tokio::test]
    async fn message_approval_denial_drops_message() {
        let (ctx, mock, _rx) = test_ctx().await;
        let post = ctx.post_to_thread("approve?").await.unwrap();
        {
            let mut state = ctx.lock_state();
            state
                .pending
                .insert(PendingInteraction::MessageApproval(PendingMessageApproval {
                    post_id: post.id.clone(),
                    username: "bob".to_string(),
                    text: "run tests".to_string(),
                    file_ids: vec![],
                }));
        }
        let alice = mock_user("alice");
        handle_reaction(&ctx, reaction(&post.id, "-1", &alice), alice).await;
        assert!(!ctx.lock_state().is_user_allowed("bob"));
        assert!(mock.post_text(&post.id).unwrap().contains("denied"));
    }

    #[tokio::test]
    async fn context_choice_forwards_queued_prompt() {
        let (ctx, mock, _rx) = test_ctx().await;
        let agent_rx = install_echo_agent(&ctx).await;
        let post = ctx.post_to_thread("context?").await.unwrap();
        {
            let mut state = ctx.lock_state();
            state
                .pending
                .insert(PendingInteraction::ContextPrompt(PendingContextPrompt {
                    post_id: post.id.clone(),
                    queued_prompt: "continue the refactor".to_string(),
                    queued_file_ids: vec![],
                    thread_message_count: 0,
                    options: vec![ContextChoice::Fresh, ContextChoice::LastN(5)],
                    deadline: Instant::now() + std::time::Duration::from_secs(600),
                }));
        }
        let alice = mock_user("alice");
        handle_reaction(&ctx, reaction(&post.id, "one", &alice), alice).await;

        assert!(ctx.lock_state().pending.is_empty());
        assert!(mock.post_text(&post.id).unwrap().contains("No context"));
        match agent_rx.recv().await.unwrap() {
            AgentOutput::Event(v) => {
                assert_eq!(v["message"]["content"], "continue the refactor");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }
}
