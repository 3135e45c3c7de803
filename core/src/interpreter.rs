// Poisoned mutex should fail the program
#![allow(clippy::unwrap_used)]

//! Consumes the agent's event stream: streams text into the thread, renders
//! tool activity, maintains the task list, opens approvals and questions,
//! and keeps usage stats current.

use std::sync::Arc;

use serde::Deserialize;
use serde_json::Value;
use tokio::time::Instant;

use tether_platform::emoji;

use crate::protocol::AgentEvent;
use crate::protocol::AssistantEnvelope;
use crate::protocol::ContentBlock;
use crate::protocol::ResultEvent;
use crate::protocol::SystemEvent;
use crate::protocol::UserEnvelope;
use crate::session::HEADER_REFRESH;
use crate::session::PendingApproval;
use crate::session::PendingInteraction;
use crate::session::PendingQuestion;
use crate::session::PendingQuestionSet;
use crate::session::QuestionOption;
use crate::session::SessionCtx;
use crate::streaming;
use crate::usage;

const MAX_PLAN_CHARS: usize = 6_000;
const MAX_RESULT_PREVIEW_LINES: usize = 12;
const MAX_RESULT_PREVIEW_CHARS: usize = 800;
/// Tools whose results are worth mirroring into the thread (diffs and file
/// snippets); everything else is noise at chat granularity.
const MIRRORED_RESULT_TOOLS: [&str; 3] = ["Edit", "Write", "NotebookEdit"];

pub(crate) async fn handle_agent_event(ctx: &Arc<SessionCtx>, event: AgentEvent) {
    match event {
        AgentEvent::System(system) => handle_system(ctx, system).await,
        AgentEvent::Assistant(envelope) => handle_assistant(ctx, envelope).await,
        AgentEvent::User(envelope) => handle_tool_results(ctx, envelope).await,
        AgentEvent::Result(result) => handle_result(ctx, result).await,
        AgentEvent::Other(value) => {
            tracing::debug!("unhandled agent event: {}", value.get("type").unwrap_or(&serde_json::Value::Null));
        }
    }
}

// ---------------------------------------------------------------------
// System events
// ---------------------------------------------------------------------

async fn handle_system(ctx: &Arc<SessionCtx>, system: SystemEvent) {
    match system.subtype.as_str() {
        "status" if system.status.as_deref() == Some("compacting") => {
            set_compaction_notice(ctx, "⏳ Compacting context…", false).await;
        }
        "compact_boundary" => {
            let text = match &system.compact_metadata {
                Some(meta) => format!(
                    "♻️ Context compacted ({}, {}k tokens)",
                    if meta.trigger == "manual" { "manual" } else { "auto" },
                    meta.pre_tokens / 1000
                ),
                None => "♻️ Context compacted".to_string(),
            };
            set_compaction_notice(ctx, &text, true).await;
        }
        "error" => {
            let message = system.message.unwrap_or_else(|| "unknown error".to_string());
            {
                let mut state = ctx.lock_state();
                append_paragraph(&mut state.pending_content, &format!("❌ {message}"));
            }
            streaming::schedule_update(ctx);
        }
        _ => {}
    }
}

async fn set_compaction_notice(ctx: &Arc<SessionCtx>, text: &str, finished: bool) {
    let existing = { ctx.lock_state().compaction_post_id.clone() };
    match existing {
        Some(post_id) => {
            if let Err(e) = ctx.platform.update_post(&post_id, text).await {
                tracing::warn!("failed to update compaction notice: {e}");
            }
        }
        None => match ctx.post_to_thread(text).await {
            Ok(post) => {
                let mut state = ctx.lock_state();
                state.compaction_post_id = Some(post.id);
            }
            Err(e) => tracing::warn!("failed to post compaction notice: {e}"),
        },
    }
    if finished {
        let mut state = ctx.lock_state();
        state.compaction_post_id = None;
    }
}

// ---------------------------------------------------------------------
// Assistant events
// ---------------------------------------------------------------------

async fn handle_assistant(ctx: &Arc<SessionCtx>, envelope: AssistantEnvelope) {
    {
        let mut state = ctx.lock_state();
        state.has_agent_responded = true;
        state.is_processing = true;
        state.touch();
        if state.typing_deadline.is_none() {
            state.typing_deadline = Some(Instant::now() + ctx.config.typing_tick);
        }
    }

    for block in envelope.message.content {
        match block {
            ContentBlock::Text { text } => {
                if text.trim().is_empty() {
                    continue;
                }
                {
                    let mut state = ctx.lock_state();
                    append_paragraph(&mut state.pending_content, &text);
                }
                streaming::schedule_update(ctx);
            }
            ContentBlock::ToolUse { id, name, input } => {
                {
                    let mut state = ctx.lock_state();
                    state.tool_names.insert(id.clone(), name.clone());
                }
                dispatch_tool(ctx, &id, &name, &input).await;
            }
            ContentBlock::ToolResult { .. } | ContentBlock::Unknown => {}
        }
    }
}

async fn dispatch_tool(ctx: &Arc<SessionCtx>, tool_use_id: &str, name: &str, input: &Value) {
    match name {
        "TodoWrite" => handle_todo_write(ctx, input).await,
        "ExitPlanMode" => handle_exit_plan_mode(ctx, tool_use_id, input).await,
        "AskUserQuestion" => handle_ask_user_question(ctx, tool_use_id, input).await,
        _ => {
            let working_dir = { ctx.lock_state().working_dir.clone() };
            if let Some(line) = crate::toolfmt::tool_one_liner(name, input, Some(&working_dir)) {
                {
                    let mut state = ctx.lock_state();
                    append_paragraph(&mut state.pending_content, &line);
                }
                streaming::schedule_update(ctx);
            }
        }
    }
}

// ---------------------------------------------------------------------
// Task list
// ---------------------------------------------------------------------

#[derive(Deserialize)]
struct TodoArgs {
    #[serde(default)]
    todos: Vec<TodoItem>,
}

#[derive(Deserialize)]
struct TodoItem {
    #[serde(default)]
    content: String,
    #[serde(default)]
    status: String,
}

fn render_task_list(todos: &[TodoItem]) -> (String, bool) {
    let total = todos.len();
    let completed = todos.iter().filter(|t| t.status == "completed").count();
    let all_done = total == 0 || completed == total;
    let percent = if total == 0 {
        100
    } else {
        completed * 100 / total
    };

    let mut out = format!("📋 **Tasks** ({completed}/{total} · {percent}%)");
    for todo in todos {
        let marker = match todo.status.as_str() {
            "completed" => "✅",
            "in_progress" => "🔄",
            _ => "▫️",
        };
        out.push_str(&format!("\n{marker} {}", todo.content));
    }
    (out, all_done)
}

async fn handle_todo_write(ctx: &Arc<SessionCtx>, input: &Value) {
    let args: TodoArgs = match serde_json::from_value(input.clone()) {
        Ok(args) => args,
        Err(e) => {
            tracing::warn!("unparseable TodoWrite input: {e}");
            return;
        }
    };
    let (mut content, all_done) = render_task_list(&args.todos);
    // A finished list collapses to its summary line; the expanded
    // checklist is noise once everything is checked off.
    let minimized = all_done && !args.todos.is_empty();
    if minimized {
        content = format!("📋 **Tasks** ({0}/{0} · 100%) — all done", args.todos.len());
    }

    let existing_post = { ctx.lock_state().tasks_post_id.clone() };
    let post_id = match existing_post {
        Some(post_id) => {
            if let Err(e) = ctx.platform.update_post(&post_id, &content).await {
                tracing::warn!("failed to update task post: {e}");
            }
            Some(post_id)
        }
        None => match ctx.post_to_thread(&content).await {
            Ok(post) => Some(post.id),
            Err(e) => {
                tracing::warn!("failed to create task post: {e}");
                None
            }
        },
    };

    let mut state = ctx.lock_state();
    state.tasks_post_id = post_id.clone();
    state.last_tasks_content = post_id.is_some().then_some(content);
    state.tasks_completed = all_done;
    state.tasks_minimized = minimized;
}

// ---------------------------------------------------------------------
// Plan approval
// ---------------------------------------------------------------------

async fn handle_exit_plan_mode(ctx: &Arc<SessionCtx>, tool_use_id: &str, input: &Value) {
    let already_approved = { ctx.lock_state().plan_approved };
    if already_approved {
        // Approve once per session; later plan exits continue silently.
        if let Err(e) = ctx.send_tool_result(tool_use_id, "Continue").await {
            tracing::warn!("failed to auto-continue plan: {e}");
        }
        return;
    }

    // Make sure buffered output lands above the approval prompt.
    streaming::flush(ctx).await;

    let plan = input
        .get("plan")
        .and_then(Value::as_str)
        .unwrap_or("(no plan text)");
    let plan = tether_common::text::truncate_with_ellipsis(plan, MAX_PLAN_CHARS);
    let message = format!("📋 **Plan**\n\n{plan}\n\n👍 approve · 👎 keep planning");

    match ctx
        .post_interactive(&message, &[emoji::APPROVE, emoji::DENY])
        .await
    {
        Ok(post) => {
            let mut state = ctx.lock_state();
            state
                .pending
                .insert(PendingInteraction::Approval(PendingApproval {
                    post_id: post.id,
                    tool_use_id: tool_use_id.to_string(),
                }));
        }
        Err(e) => {
            tracing::warn!("failed to post plan approval: {e}");
        }
    }
}

// ---------------------------------------------------------------------
// Multiple-choice questions
// ---------------------------------------------------------------------

#[derive(Deserialize)]
struct QuestionArgs {
    #[serde(default)]
    questions: Vec<QuestionArg>,
}

#[derive(Deserialize)]
struct QuestionArg {
    #[serde(default)]
    header: String,
    #[serde(default)]
    question: String,
    #[serde(default)]
    options: Vec<OptionArg>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum OptionArg {
    Labeled {
        label: String,
        #[serde(default)]
        description: String,
    },
    Bare(String),
}

async fn handle_ask_user_question(ctx: &Arc<SessionCtx>, tool_use_id: &str, input: &Value) {
    let args: QuestionArgs = match serde_json::from_value(input.clone()) {
        Ok(args) => args,
        Err(e) => {
            tracing::warn!("unparseable AskUserQuestion input: {e}");
            let _ = ctx
                .send_tool_result(tool_use_id, "Could not present the question to the user.")
                .await;
            return;
        }
    };

    let questions: Vec<PendingQuestion> = args
        .questions
        .into_iter()
        .map(|q| PendingQuestion {
            header: q.header,
            question: q.question,
            options: q
                .options
                .into_iter()
                .take(emoji::NUMBERS.len())
                .map(|o| match o {
                    OptionArg::Labeled { label, description } => QuestionOption {
                        label,
                        description,
                    },
                    OptionArg::Bare(label) => QuestionOption {
                        label,
                        description: String::new(),
                    },
                })
                .collect(),
            answer: None,
        })
        .filter(|q| !q.options.is_empty())
        .collect();

    if questions.is_empty() {
        let _ = ctx
            .send_tool_result(tool_use_id, "No answerable questions were provided.")
            .await;
        return;
    }

    streaming::flush(ctx).await;

    let mut set = PendingQuestionSet {
        tool_use_id: tool_use_id.to_string(),
        post_id: String::new(),
        questions,
        current: 0,
    };
    if post_current_question(ctx, &mut set).await {
        let mut state = ctx.lock_state();
        state
            .pending
            .insert(PendingInteraction::QuestionSet(set));
    }
}

pub(crate) fn format_question(set: &PendingQuestionSet) -> String {
    let q = &set.questions[set.current];
    let mut out = String::new();
    if q.header.is_empty() {
        out.push_str(&format!(
            "❓ **Question {}/{}**\n",
            set.current + 1,
            set.questions.len()
        ));
    } else {
        out.push_str(&format!(
            "❓ **{}** ({}/{})\n",
            q.header,
            set.current + 1,
            set.questions.len()
        ));
    }
    out.push_str(&q.question);
    for (idx, option) in q.options.iter().enumerate() {
        let digit = idx + 1;
        if option.description.is_empty() {
            out.push_str(&format!("\n{digit}️⃣ {}", option.label));
        } else {
            out.push_str(&format!("\n{digit}️⃣ {} — {}", option.label, option.description));
        }
    }
    out
}

/// Post the question at `set.current` and record its post id in the set.
/// Returns false when the post could not be created.
pub(crate) async fn post_current_question(
    ctx: &Arc<SessionCtx>,
    set: &mut PendingQuestionSet,
) -> bool {
    let message = format_question(set);
    let option_count = set.questions[set.current].options.len();
    let emojis: Vec<&str> = emoji::NUMBERS[..option_count].to_vec();
    match ctx.post_interactive(&message, &emojis).await {
        Ok(post) => {
            set.post_id = post.id;
            true
        }
        Err(e) => {
            tracing::warn!("failed to post question: {e}");
            false
        }
    }
}

/// Aggregate answered questions into the single tool result the agent
/// expects once the last answer arrives.
pub(crate) fn aggregate_answers(set: &PendingQuestionSet) -> String {
    set.questions
        .iter()
        .map(|q| {
            let label = if q.header.is_empty() {
                q.question.as_str()
            } else {
                q.header.as_str()
            };
            format!(
                "{label}: {}",
                q.answer.as_deref().unwrap_or("(no answer)")
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

// ---------------------------------------------------------------------
// Mirrored tool results
// ---------------------------------------------------------------------

async fn handle_tool_results(ctx: &Arc<SessionCtx>, envelope: UserEnvelope) {
    for block in envelope.message.content {
        let ContentBlock::ToolResult {
            tool_use_id,
            content,
            is_error,
        } = block
        else {
            continue;
        };
        let name = {
            let mut state = ctx.lock_state();
            state.tool_names.remove(&tool_use_id)
        };
        let Some(name) = name else { continue };
        if !MIRRORED_RESULT_TOOLS.contains(&name.as_str()) && !is_error {
            continue;
        }
        let Some(text) = result_text(&content) else {
            continue;
        };
        let preview = preview_lines(&text);
        if preview.is_empty() {
            continue;
        }
        let rendered = if is_error {
            format!("❌ **{name}** failed:\n```\n{preview}\n```")
        } else {
            format!("```\n{preview}\n```")
        };
        {
            let mut state = ctx.lock_state();
            append_paragraph(&mut state.pending_content, &rendered);
        }
        streaming::schedule_update(ctx);
    }
}

fn result_text(content: &Value) -> Option<String> {
    match content {
        Value::String(s) => Some(s.clone()),
        Value::Array(items) => {
            let joined: Vec<&str> = items
                .iter()
                .filter_map(|i| i.get("text").and_then(Value::as_str))
                .collect();
            if joined.is_empty() {
                None
            } else {
                Some(joined.join("\n"))
            }
        }
        _ => None,
    }
}

fn preview_lines(text: &str) -> String {
    let mut preview: String = text
        .lines()
        .take(MAX_RESULT_PREVIEW_LINES)
        .collect::<Vec<_>>()
        .join("\n");
    if preview.len() > MAX_RESULT_PREVIEW_CHARS {
        preview = tether_common::text::truncate_with_ellipsis(&preview, MAX_RESULT_PREVIEW_CHARS);
    }
    preview.trim().to_string()
}

// ---------------------------------------------------------------------
// Results / usage
// ---------------------------------------------------------------------

async fn handle_result(ctx: &Arc<SessionCtx>, result: ResultEvent) {
    let first_result = {
        let mut state = ctx.lock_state();
        let first = usage::apply_result(&mut state.usage, &result);
        state.is_processing = false;
        state.was_interrupted = false;
        state.typing_deadline = None;
        state.touch();
        if first {
            state.header_refresh_deadline = Some(Instant::now() + HEADER_REFRESH);
        }
        first
    };

    streaming::flush(ctx).await;
    ctx.repaint_header().await;
    ctx.persist().await;

    if first_result {
        tracing::debug!("first result for {}; header refresh timer started", ctx.key);
    }
}

fn append_paragraph(buffer: &mut String, text: &str) {
    if !buffer.is_empty() {
        buffer.push_str("\n\n");
    }
    buffer.push_str(text);
}
