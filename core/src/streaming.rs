// Poisoned mutex should fail the program
#![allow(clippy::unwrap_used)]

//! Streaming post engine: batches `pending_content` into one editable chat
//! post per assistant turn, splitting near the platform limit and keeping
//! the task-list post glued to the bottom of the thread.

use std::sync::Arc;

use tokio::time::Instant;

use crate::session::SessionCtx;

pub(crate) const HARD_CAP: usize = 16_000;
pub(crate) const SPLIT_THRESHOLD: usize = 14_000;

const CONTINUED_BELOW_MARKER: &str = "\n\n*... (continued below)*";
const CONTINUED_MARKER: &str = "*(continued)*\n\n";
const TRUNCATED_MARKER: &str = "\n\n*... (truncated)*";

/// Collapse runs of three or more newlines down to a paragraph break and
/// trim the edges.
pub(crate) fn normalize(content: &str) -> String {
    let mut out = String::with_capacity(content.len());
    let mut newline_run = 0usize;
    for c in content.chars() {
        if c == '\n' {
            newline_run += 1;
            if newline_run <= 2 {
                out.push(c);
            }
        } else {
            newline_run = 0;
            out.push(c);
        }
    }
    out.trim().to_string()
}

/// Arm the coalescing flush timer. Overlapping calls are idempotent: the
/// first deadline wins.
pub(crate) fn schedule_update(ctx: &SessionCtx) {
    let mut state = ctx.lock_state();
    if state.update_deadline.is_none() {
        state.update_deadline = Some(Instant::now() + ctx.config.update_coalesce);
    }
}

/// Byte index to split at: the last newline before the threshold, unless a
/// clean split would waste 30% or more of the budget.
fn split_index(content: &str) -> usize {
    let threshold = floor_char_boundary(content, SPLIT_THRESHOLD);
    match content[..threshold].rfind('\n') {
        Some(idx) if idx >= SPLIT_THRESHOLD * 7 / 10 => idx,
        _ => threshold,
    }
}

fn floor_char_boundary(s: &str, mut idx: usize) -> usize {
    if idx >= s.len() {
        return s.len();
    }
    while idx > 0 && !s.is_char_boundary(idx) {
        idx -= 1;
    }
    idx
}

fn truncate_chars(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

/// Reconcile `pending_content` with the thread. Runs only on the session
/// worker, so there is never more than one flush in flight. An unusually
/// large buffer splits repeatedly until every post is under the cap.
pub(crate) async fn flush(ctx: &Arc<SessionCtx>) {
    enum Plan {
        Split {
            post_id: String,
            prefix: String,
            body: String,
        },
        Update {
            post_id: String,
            content: String,
        },
        Create {
            content: String,
        },
        Nothing,
    }

    loop {
        let plan = {
            let mut state = ctx.lock_state();
            state.update_deadline = None;
            let mut content = normalize(&state.pending_content);
            if content.is_empty() {
                Plan::Nothing
            } else if content.len() > SPLIT_THRESHOLD && state.current_post_id.is_some() {
                let idx = split_index(&content);
                let prefix = content[..idx].trim_end().to_string();
                let remainder = content[idx..].trim_start().to_string();
                let body = format!("{CONTINUED_MARKER}{remainder}");
                let post_id = state.current_post_id.take().unwrap();
                state.pending_content = body.clone();
                Plan::Split {
                    post_id,
                    prefix,
                    body,
                }
            } else {
                if content.len() > HARD_CAP {
                    // Safety net; the split path keeps us away from here.
                    content = truncate_chars(&content, HARD_CAP - 50);
                    content.push_str(TRUNCATED_MARKER);
                }
                state.pending_content = content.clone();
                match &state.current_post_id {
                    Some(post_id) => Plan::Update {
                        post_id: post_id.clone(),
                        content,
                    },
                    None => Plan::Create { content },
                }
            }
        };

        match plan {
            Plan::Nothing => return,
            Plan::Update { post_id, content } => {
                if let Err(e) = ctx.platform.update_post(&post_id, &content).await {
                    // Dropped updates are tolerable; the next flush
                    // supersedes.
                    tracing::warn!("update_post failed for {post_id}: {e}");
                }
                return;
            }
            Plan::Create { content } => {
                create_current_post(ctx, &content).await;
                return;
            }
            Plan::Split {
                post_id,
                prefix,
                body,
            } => {
                let capped = format!("{prefix}{CONTINUED_BELOW_MARKER}");
                if let Err(e) = ctx.platform.update_post(&post_id, &capped).await {
                    tracing::warn!("finalizing split post {post_id} failed: {e}");
                }
                create_current_post(ctx, &body).await;
                // The remainder may still be over the threshold; go again.
                let done = {
                    let state = ctx.lock_state();
                    state.pending_content.len() <= SPLIT_THRESHOLD
                        || state.current_post_id.is_none()
                };
                if done {
                    return;
                }
            }
        }
    }
}

/// Create the post that becomes `current_post_id`, honoring the
/// sticky-tasks rule: while a task list is live, the task post is
/// repurposed for the new content and a fresh task post is appended below
/// it, so the checklist always trails the newest output.
async fn create_current_post(ctx: &Arc<SessionCtx>, content: &str) {
    let sticky = {
        let state = ctx.lock_state();
        match (&state.tasks_post_id, &state.last_tasks_content) {
            (Some(post_id), Some(tasks)) if !state.tasks_completed => {
                Some((post_id.clone(), tasks.clone()))
            }
            _ => None,
        }
    };

    match sticky {
        Some((tasks_post_id, tasks_content)) => {
            if let Err(e) = ctx.platform.update_post(&tasks_post_id, content).await {
                tracing::warn!("repurposing task post {tasks_post_id} failed: {e}");
            }
            {
                let mut state = ctx.lock_state();
                state.current_post_id = Some(tasks_post_id);
            }
            match ctx.post_to_thread(&tasks_content).await {
                Ok(new_tasks_post) => {
                    let mut state = ctx.lock_state();
                    state.tasks_post_id = Some(new_tasks_post.id);
                }
                Err(e) => {
                    tracing::warn!("recreating task post failed: {e}");
                    let mut state = ctx.lock_state();
                    state.tasks_post_id = None;
                    state.last_tasks_content = None;
                }
            }
        }
        None => match ctx.post_to_thread(content).await {
            Ok(post) => {
                let mut state = ctx.lock_state();
                state.current_post_id = Some(post.id);
            }
            Err(e) => {
                tracing::warn!("create_post failed: {e}");
            }
        },
    }
}

/// Called when a user message lands in-thread: re-create a live task post
/// below the user's message so the checklist stays the lowest post.
pub(crate) async fn bump_tasks_to_bottom(ctx: &Arc<SessionCtx>) {
    let bump = {
        let state = ctx.lock_state();
        match (&state.tasks_post_id, &state.last_tasks_content) {
            (Some(post_id), Some(tasks)) if !state.tasks_completed => {
                Some((post_id.clone(), tasks.clone()))
            }
            _ => None,
        }
    };
    let Some((old_post_id, tasks_content)) = bump else {
        return;
    };

    if let Err(e) = ctx.platform.delete_post(&old_post_id).await {
        tracing::warn!("deleting task post {old_post_id} failed: {e}");
    }
    match ctx.post_to_thread(&tasks_content).await {
        Ok(post) => {
            let mut state = ctx.lock_state();
            state.tasks_post_id = Some(post.id);
        }
        Err(e) => {
            tracing::warn!("re-creating task post failed: {e}");
            let mut state = ctx.lock_state();
            state.tasks_post_id = None;
            state.last_tasks_content = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::test_ctx;
    use pretty_assertions::assert_eq;
    use tether_platform::mock::RecordedCall;

    #[test]
    fn normalize_collapses_newline_runs() {
        assert_eq!(normalize("a\n\n\n\nb"), "a\n\nb");
        assert_eq!(normalize("  a\nb  \n"), "a\nb");
        assert_eq!(normalize("a\n\nb"), "a\n\nb");
    }

    #[test]
    fn split_prefers_newlines_unless_wasteful() {
        // Newline near the threshold: clean split.
        let mut content = "x".repeat(13_000);
        content.push('\n');
        content.push_str(&"y".repeat(3_000));
        assert_eq!(split_index(&content), 13_000);

        // Only an early newline: falls back to the raw threshold.
        let mut content = "x".repeat(100);
        content.push('\n');
        content.push_str(&"y".repeat(16_000));
        assert_eq!(split_index(&content), SPLIT_THRESHOLD);
    }

    #[tokio::test]
    async fn first_flush_creates_then_updates() {
        let (ctx, mock, _rx) = test_ctx().await;
        {
            let mut state = ctx.lock_state();
            state.pending_content = "hello".to_string();
        }
        flush(&ctx).await;
        let post_id = ctx.lock_state().current_post_id.clone().unwrap();
        assert_eq!(mock.post_text(&post_id).as_deref(), Some("hello"));

        {
            let mut state = ctx.lock_state();
            state.pending_content.push_str("\nmore");
        }
        flush(&ctx).await;
        assert_eq!(mock.post_text(&post_id).as_deref(), Some("hello\nmore"));
        // Still a single created post.
        assert_eq!(mock.live_posts().len(), 1);
    }

    #[tokio::test]
    async fn long_content_splits_with_markers_under_cap() {
        let (ctx, mock, _rx) = test_ctx().await;
        {
            let mut state = ctx.lock_state();
            state.pending_content = "start".to_string();
        }
        flush(&ctx).await;
        let first_post = ctx.lock_state().current_post_id.clone().unwrap();

        // One assistant event brings the buffer to 15,100 chars.
        let mut big = String::new();
        for _ in 0..151 {
            big.push_str(&"z".repeat(99));
            big.push('\n');
        }
        {
            let mut state = ctx.lock_state();
            state.pending_content = big;
        }
        flush(&ctx).await;

        let first_text = mock.post_text(&first_post).unwrap();
        assert!(first_text.ends_with("*... (continued below)*"));
        assert!(first_text.len() <= HARD_CAP);

        let continuation = ctx.lock_state().current_post_id.clone().unwrap();
        assert_ne!(continuation, first_post);
        let cont_text = mock.post_text(&continuation).unwrap();
        assert!(cont_text.starts_with("*(continued)*"));
        assert!(cont_text.len() <= HARD_CAP);
    }

    #[tokio::test]
    async fn giant_buffers_split_repeatedly_and_preserve_text() {
        let (ctx, mock, _rx) = test_ctx().await;
        {
            let mut state = ctx.lock_state();
            state.pending_content = "seed".to_string();
        }
        flush(&ctx).await;

        let mut big = String::from("seed");
        for _ in 0..350 {
            big.push_str(&"w".repeat(99));
            big.push('\n');
        }
        {
            let mut state = ctx.lock_state();
            state.pending_content = big;
        }
        flush(&ctx).await;

        let posts = mock.live_posts();
        assert!(posts.len() >= 3, "expected several posts, got {}", posts.len());
        for post in &posts {
            assert!(post.message.len() <= HARD_CAP, "post over cap");
        }
        // Concatenating the posts minus the markers reproduces the text.
        let mut glued = String::new();
        for post in &posts {
            glued.push_str(
                post.message
                    .replace("\n\n*... (continued below)*", "")
                    .replace("*(continued)*\n\n", "")
                    .as_str(),
            );
        }
        let squashed: String = glued.chars().filter(|c| *c != '\n').collect();
        let expected_w = 350 * 99;
        assert_eq!(
            squashed.chars().filter(|c| *c == 'w').count(),
            expected_w
        );
        assert!(squashed.starts_with("seed"));
    }

    #[tokio::test]
    async fn oversized_first_post_is_truncated() {
        let (ctx, mock, _rx) = test_ctx().await;
        {
            let mut state = ctx.lock_state();
            state.pending_content = "q".repeat(HARD_CAP + 500);
        }
        flush(&ctx).await;
        let post = mock.last_post().unwrap();
        assert!(post.message.len() <= HARD_CAP);
        assert!(post.message.ends_with("*... (truncated)*"));
    }

    #[tokio::test]
    async fn sticky_task_post_is_repurposed_on_new_content() {
        let (ctx, mock, _rx) = test_ctx().await;
        // A live task list exists.
        let tasks_post = ctx.post_to_thread("📋 tasks").await.unwrap();
        {
            let mut state = ctx.lock_state();
            state.tasks_post_id = Some(tasks_post.id.clone());
            state.last_tasks_content = Some("📋 tasks".to_string());
            state.tasks_completed = false;
            state.pending_content = "answer text".to_string();
        }

        flush(&ctx).await;

        // The old task post now carries the content; a new task post sits
        // at the bottom.
        assert_eq!(mock.post_text(&tasks_post.id).as_deref(), Some("answer text"));
        let state = ctx.lock_state();
        assert_eq!(state.current_post_id.as_deref(), Some(tasks_post.id.as_str()));
        let new_tasks = state.tasks_post_id.clone().unwrap();
        drop(state);
        assert_ne!(new_tasks, tasks_post.id);
        assert_eq!(mock.post_text(&new_tasks).as_deref(), Some("📋 tasks"));
        assert_eq!(mock.last_post().unwrap().id, new_tasks);
    }

    #[tokio::test]
    async fn completed_tasks_are_not_repositioned() {
        let (ctx, mock, _rx) = test_ctx().await;
        let tasks_post = ctx.post_to_thread("📋 done").await.unwrap();
        {
            let mut state = ctx.lock_state();
            state.tasks_post_id = Some(tasks_post.id.clone());
            state.last_tasks_content = Some("📋 done".to_string());
            state.tasks_completed = true;
            state.pending_content = "after".to_string();
        }
        flush(&ctx).await;
        bump_tasks_to_bottom(&ctx).await;

        // The task post was left in place both times.
        assert_eq!(mock.post_text(&tasks_post.id).as_deref(), Some("📋 done"));
        assert!(!mock
            .calls()
            .iter()
            .any(|c| matches!(c, RecordedCall::Delete { post_id } if *post_id == tasks_post.id)));
    }

    #[tokio::test]
    async fn bump_deletes_and_recreates_live_task_post() {
        let (ctx, mock, _rx) = test_ctx().await;
        let tasks_post = ctx.post_to_thread("📋 1/2").await.unwrap();
        {
            let mut state = ctx.lock_state();
            state.tasks_post_id = Some(tasks_post.id.clone());
            state.last_tasks_content = Some("📋 1/2".to_string());
        }

        bump_tasks_to_bottom(&ctx).await;

        assert!(mock
            .calls()
            .iter()
            .any(|c| matches!(c, RecordedCall::Delete { post_id } if *post_id == tasks_post.id)));
        let state = ctx.lock_state();
        let new_id = state.tasks_post_id.clone().unwrap();
        assert_ne!(new_id, tasks_post.id);
        drop(state);
        assert_eq!(mock.post_text(&new_id).as_deref(), Some("📋 1/2"));
    }

    #[tokio::test]
    async fn empty_buffer_flush_is_a_no_op() {
        let (ctx, mock, _rx) = test_ctx().await;
        flush(&ctx).await;
        assert!(mock.calls().is_empty());
        assert!(ctx.lock_state().current_post_id.is_none());
    }
}
