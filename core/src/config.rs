use std::io;
use std::path::PathBuf;
use std::time::Duration;

/// Runtime settings for the bridge. Populated by the CLI from flags and
/// environment; library consumers construct it directly.
#[derive(Debug, Clone)]
pub struct Config {
    /// Agent CLI executable, resolved through PATH.
    pub agent_program: String,

    /// Permission-broker executable handed to the agent via its MCP config.
    /// Defaults to `tether-broker` next to the current executable.
    pub broker_program: PathBuf,

    /// Where sessions are persisted across restarts.
    pub state_file: PathBuf,

    /// Default working directory for new sessions.
    pub default_working_dir: PathBuf,

    /// Live-session cap across all platforms.
    pub max_sessions: usize,

    /// A session idle past this is killed (with a resumable lifecycle post).
    pub idle_limit: Duration,

    /// Warning is posted `idle_grace` before `idle_limit` expires.
    pub idle_grace: Duration,

    /// Streaming-post coalesce window.
    pub update_coalesce: Duration,

    /// Typing-indicator cadence while the agent is streaming.
    pub typing_tick: Duration,

    /// Skip the permission broker entirely and run the agent with
    /// `--dangerously-skip-permissions`.
    pub skip_permissions: bool,

    /// Extra system-prompt text appended to every agent session.
    pub append_system_prompt: Option<String>,

    /// Pass the chrome-automation flag through to the agent.
    pub chrome_automation: bool,

    /// Persisted records older than this are dropped on startup.
    pub stale_session_max_age: Duration,

    pub debug: bool,
}

impl Default for Config {
    fn default() -> Self {
        let broker_program = std::env::current_exe()
            .ok()
            .and_then(|p| p.parent().map(|d| d.join("tether-broker")))
            .unwrap_or_else(|| PathBuf::from("tether-broker"));
        let state_file = tether_dir()
            .map(|d| d.join("sessions.json"))
            .unwrap_or_else(|_| PathBuf::from("sessions.json"));
        let default_working_dir =
            std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
        Self {
            agent_program: "claude".to_string(),
            broker_program,
            state_file,
            default_working_dir,
            max_sessions: 5,
            idle_limit: Duration::from_secs(30 * 60),
            idle_grace: Duration::from_secs(5 * 60),
            update_coalesce: Duration::from_millis(500),
            typing_tick: Duration::from_secs(3),
            skip_permissions: false,
            append_system_prompt: None,
            chrome_automation: false,
            stale_session_max_age: Duration::from_secs(7 * 24 * 3600),
            debug: false,
        }
    }
}

/// Returns the path to the bridge's configuration directory (`~/.tether`),
/// creating nothing. Fails when the home directory cannot be determined.
pub fn tether_dir() -> io::Result<PathBuf> {
    let mut p = dirs::home_dir().ok_or_else(|| {
        io::Error::new(io::ErrorKind::NotFound, "could not find home directory")
    })?;
    p.push(".tether");
    Ok(p)
}
