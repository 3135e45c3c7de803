//! Compact human-readable renderings of agent tool calls. Used twice: the
//! event interpreter streams one-liners into the session thread, and the
//! permission broker shows a descriptor on its approval prompt.

use std::path::Path;

use serde_json::Value;

use tether_common::text::truncate_with_ellipsis;

const MAX_COMMAND_CHARS: usize = 120;
const MAX_INPUT_CHARS: usize = 160;

/// Strip the session working directory from a path, otherwise keep the last
/// three components so long absolute paths stay readable.
pub fn shorten_path(path: &str, working_dir: Option<&Path>) -> String {
    if let Some(base) = working_dir
        && let Ok(stripped) = Path::new(path).strip_prefix(base)
    {
        let s = stripped.to_string_lossy();
        if !s.is_empty() {
            return s.into_owned();
        }
    }
    let parts: Vec<&str> = path.split('/').filter(|p| !p.is_empty()).collect();
    if parts.len() <= 3 {
        path.to_string()
    } else {
        format!("…/{}", parts[parts.len() - 3..].join("/"))
    }
}

/// Split a fully-qualified MCP tool name (`mcp__server__tool`) into
/// `(server, tool)`.
pub fn split_mcp_tool(name: &str) -> Option<(&str, &str)> {
    let rest = name.strip_prefix("mcp__")?;
    let (server, tool) = rest.split_once("__")?;
    if server.is_empty() || tool.is_empty() {
        return None;
    }
    Some((server, tool))
}

fn input_str<'a>(input: &'a Value, key: &str) -> Option<&'a str> {
    input.get(key).and_then(Value::as_str)
}

fn command_text(input: &Value) -> String {
    match input.get("command") {
        Some(Value::String(s)) => truncate_with_ellipsis(&s.replace('\n', " "), MAX_COMMAND_CHARS),
        Some(Value::Array(parts)) => {
            let words: Vec<String> = parts
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect();
            let joined = shlex::try_join(words.iter().map(String::as_str))
                .unwrap_or_else(|_| words.join(" "));
            truncate_with_ellipsis(&joined, MAX_COMMAND_CHARS)
        }
        _ => String::new(),
    }
}

/// One-line descriptor for a tool call, used on permission prompts:
/// `Write → src/main.rs`, `Bash → `cargo test``, `github → create_issue`.
pub fn describe_tool(name: &str, input: &Value, working_dir: Option<&Path>) -> String {
    if let Some((server, tool)) = split_mcp_tool(name) {
        return format!("{server} → {tool}");
    }
    match name {
        "Bash" => format!("`{}`", command_text(input)),
        "Read" | "Write" | "Edit" | "NotebookEdit" => {
            let path = input_str(input, "file_path")
                .or_else(|| input_str(input, "notebook_path"))
                .unwrap_or("?");
            format!("{name} → {}", shorten_path(path, working_dir))
        }
        "Glob" | "Grep" => {
            let pattern = input_str(input, "pattern").unwrap_or("?");
            format!("{name} → `{pattern}`")
        }
        "WebFetch" => format!("WebFetch → {}", input_str(input, "url").unwrap_or("?")),
        "WebSearch" => format!("WebSearch → {}", input_str(input, "query").unwrap_or("?")),
        _ => {
            let compact = serde_json::to_string(input).unwrap_or_default();
            format!("{name} {}", truncate_with_ellipsis(&compact, MAX_INPUT_CHARS))
        }
    }
}

/// The line streamed into the thread when the agent invokes a tool. Returns
/// `None` for tools that get richer treatment elsewhere (task list, plans,
/// questions).
pub fn tool_one_liner(name: &str, input: &Value, working_dir: Option<&Path>) -> Option<String> {
    if matches!(name, "TodoWrite" | "ExitPlanMode" | "AskUserQuestion") {
        return None;
    }

    if let Some((server, tool)) = split_mcp_tool(name) {
        if server.starts_with("chrome") || tool.starts_with("chrome") {
            return Some(format!("🌐 **{tool}**"));
        }
        return Some(format!("🔌 **{server}** · {tool}"));
    }

    let line = match name {
        "Read" => format!(
            "📖 Reading `{}`",
            shorten_path(input_str(input, "file_path").unwrap_or("?"), working_dir)
        ),
        "Write" => format!(
            "📝 Writing `{}`",
            shorten_path(input_str(input, "file_path").unwrap_or("?"), working_dir)
        ),
        "Edit" => format!(
            "✏️ Editing `{}`",
            shorten_path(input_str(input, "file_path").unwrap_or("?"), working_dir)
        ),
        "NotebookEdit" => format!(
            "✏️ Editing `{}`",
            shorten_path(input_str(input, "notebook_path").unwrap_or("?"), working_dir)
        ),
        "Bash" => format!("💻 `{}`", command_text(input)),
        "Glob" => format!("🔍 Globbing `{}`", input_str(input, "pattern").unwrap_or("?")),
        "Grep" => format!(
            "🔍 Searching for `{}`",
            input_str(input, "pattern").unwrap_or("?")
        ),
        "WebFetch" => format!("🌐 Fetching {}", input_str(input, "url").unwrap_or("?")),
        "WebSearch" => format!(
            "🌐 Searching the web: {}",
            input_str(input, "query").unwrap_or("?")
        ),
        "Task" => format!(
            "🤖 Subagent: {}",
            input_str(input, "description").unwrap_or("task")
        ),
        _ => format!("🔧 **{name}**"),
    };
    Some(line)
}
