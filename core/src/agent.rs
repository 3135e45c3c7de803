//! One agent CLI subprocess per session: spawn, line-framed JSON in/out,
//! interrupt, kill. The adapter does not interpret events beyond splitting
//! stdout into lines and parsing each line as JSON; everything else is the
//! interpreter's job.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use serde_json::Value;
use serde_json::json;
use tokio::io::AsyncBufReadExt;
use tokio::io::AsyncWriteExt;
use tokio::io::BufReader;
use tokio::process::Command;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::Result;
use crate::error::TetherErr;
use crate::protocol;

/// The MCP tool id the agent calls for permission decisions:
/// `mcp__<server>__<tool>` with our broker registered as `permission`.
pub const PERMISSION_PROMPT_TOOL: &str = "mcp__permission__permission_prompt";
const PERMISSION_SERVER_NAME: &str = "permission";

/// Output of the subprocess, delivered in arrival order. `Exit` is always
/// the final item.
#[derive(Debug)]
pub enum AgentOutput {
    /// One parsed stdout line. Raw; not interpreted here.
    Event(Value),
    Exit { code: Option<i32> },
}

#[derive(Debug, Clone)]
pub struct AgentSpawnParams {
    pub program: String,
    pub working_dir: PathBuf,
    pub agent_session_id: Uuid,
    /// `--resume <id>` instead of `--session-id <id>`.
    pub resume: bool,
    /// `--dangerously-skip-permissions` instead of wiring the broker.
    pub skip_permissions: bool,
    /// Broker executable + environment for the `--mcp-config` blob. Ignored
    /// when `skip_permissions` is set.
    pub broker_program: PathBuf,
    pub broker_env: HashMap<String, String>,
    pub append_system_prompt: Option<String>,
    pub chrome_automation: bool,
}

impl AgentSpawnParams {
    fn build_args(&self) -> Vec<String> {
        let mut args = vec![
            "--input-format".to_string(),
            "stream-json".to_string(),
            "--output-format".to_string(),
            "stream-json".to_string(),
            "--verbose".to_string(),
        ];
        if self.skip_permissions {
            args.push("--dangerously-skip-permissions".to_string());
        } else {
            args.push("--mcp-config".to_string());
            args.push(self.mcp_config_json());
            args.push("--permission-prompt-tool".to_string());
            args.push(PERMISSION_PROMPT_TOOL.to_string());
        }
        if self.resume {
            args.push("--resume".to_string());
        } else {
            args.push("--session-id".to_string());
        }
        args.push(self.agent_session_id.to_string());
        if let Some(prompt) = &self.append_system_prompt {
            args.push("--append-system-prompt".to_string());
            args.push(prompt.clone());
        }
        if self.chrome_automation {
            args.push("--chrome".to_string());
        }
        args
    }

    fn mcp_config_json(&self) -> String {
        json!({
            "mcpServers": {
                PERMISSION_SERVER_NAME: {
                    "command": self.broker_program,
                    "args": [],
                    "env": self.broker_env,
                }
            }
        })
        .to_string()
    }
}

pub struct AgentClient {
    stdin_tx: mpsc::Sender<String>,
    pid: i32,
    running: Arc<AtomicBool>,
}

impl AgentClient {
    /// Spawn the agent. Events and the final exit notification arrive on
    /// `output_tx`; the channel is the only way the caller observes the
    /// subprocess.
    pub fn spawn(
        params: &AgentSpawnParams,
        output_tx: async_channel::Sender<AgentOutput>,
    ) -> Result<AgentClient> {
        let mut cmd = Command::new(&params.program);
        cmd.args(params.build_args())
            .current_dir(&params.working_dir);
        Self::spawn_with_command(cmd, output_tx)
    }

    /// Lower-level entry point used by [`AgentClient::spawn`] and tests:
    /// the command is taken as-is apart from stdio wiring.
    pub(crate) fn spawn_with_command(
        mut cmd: Command,
        output_tx: async_channel::Sender<AgentOutput>,
    ) -> Result<AgentClient> {
        let mut child = cmd
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| TetherErr::Spawn(e.to_string()))?;

        let pid = child.id().map(|id| id as i32).unwrap_or(-1);
        let running = Arc::new(AtomicBool::new(true));

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| TetherErr::Spawn("agent stdin not captured".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| TetherErr::Spawn("agent stdout not captured".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| TetherErr::Spawn("agent stderr not captured".to_string()))?;

        // Writer task owns stdin so sends never block the session worker on
        // pipe backpressure.
        let (stdin_tx, mut stdin_rx) = mpsc::channel::<String>(64);
        tokio::spawn(async move {
            let mut stdin = stdin;
            while let Some(line) = stdin_rx.recv().await {
                if stdin.write_all(line.as_bytes()).await.is_err() {
                    break;
                }
                if stdin.write_all(b"\n").await.is_err() {
                    break;
                }
                if stdin.flush().await.is_err() {
                    break;
                }
            }
        });

        // Agent diagnostics arrive on stderr; forward at debug level.
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                tracing::debug!(target: "agent_stderr", "{line}");
            }
        });

        // Reader task: frame stdout by newline, parse, forward, then reap
        // the child and report the exit. `lines()` retains a partial
        // trailing line internally until its terminator (or EOF) arrives.
        let reader_running = running.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        let trimmed = line.trim();
                        if trimmed.is_empty() {
                            continue;
                        }
                        match serde_json::from_str::<Value>(trimmed) {
                            Ok(value) => {
                                if output_tx.send(AgentOutput::Event(value)).await.is_err() {
                                    break;
                                }
                            }
                            Err(e) => {
                                tracing::warn!("skipping malformed agent output line: {e}");
                            }
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        tracing::warn!("agent stdout read error: {e}");
                        break;
                    }
                }
            }

            let code = match child.wait().await {
                Ok(status) => status.code(),
                Err(e) => {
                    tracing::warn!("failed to reap agent process: {e}");
                    None
                }
            };
            reader_running.store(false, Ordering::SeqCst);
            let _ = output_tx.send(AgentOutput::Exit { code }).await;
        });

        Ok(AgentClient {
            stdin_tx,
            pid,
            running,
        })
    }

    pub async fn send_message(&self, text: &str) -> Result<()> {
        self.send_value(protocol::user_message(text)).await
    }

    pub async fn send_message_blocks(&self, blocks: Vec<Value>) -> Result<()> {
        self.send_value(protocol::user_message_blocks(blocks)).await
    }

    pub async fn send_tool_result(&self, tool_use_id: &str, content: &str) -> Result<()> {
        self.send_value(protocol::tool_result_message(tool_use_id, content))
            .await
    }

    async fn send_value(&self, value: Value) -> Result<()> {
        let line = serde_json::to_string(&value)?;
        self.stdin_tx
            .send(line)
            .await
            .map_err(|_| TetherErr::AgentNotRunning)
    }

    /// Stop the current turn without tearing the process down.
    pub fn interrupt(&self) {
        self.signal(libc::SIGINT);
    }

    /// Terminate the subprocess. The exit notification still arrives
    /// asynchronously through the output channel.
    pub fn kill(&self) {
        self.signal(libc::SIGTERM);
    }

    fn signal(&self, sig: i32) {
        if self.pid <= 0 || !self.is_running() {
            return;
        }
        // Safety: plain kill(2) on a pid we spawned; worst case is ESRCH
        // when the process already exited.
        unsafe {
            libc::kill(self.pid, sig);
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}
