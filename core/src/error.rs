use std::io;
use std::time::Duration;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, TetherErr>;

#[derive(Error, Debug)]
pub enum TetherErr {
    /// Raised when a new session would exceed the configured cap. Surfaced
    /// to the user as a one-line chat error.
    #[error("session limit reached ({0} active); stop one with !stop first")]
    SessionLimit(usize),

    #[error("agent subprocess is not running")]
    AgentNotRunning,

    /// The agent CLI could not be spawned at all (missing binary, bad cwd).
    #[error("failed to spawn agent: {0}")]
    Spawn(String),

    #[error("not a directory: {0}")]
    InvalidDirectory(String),

    #[error("not a git repository: {0}")]
    NotAGitRepo(String),

    #[error("invalid branch name: {0}")]
    InvalidBranchName(String),

    /// A git subcommand exited non-zero; the message carries its stderr.
    #[error("git: {0}")]
    Git(String),

    #[error("git command timed out after {0:?}")]
    GitTimeout(Duration),

    #[error(transparent)]
    Platform(#[from] tether_platform::PlatformError),

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Render an error for a chat post. Today this is `Display`, but the
/// indirection keeps user-facing wording in one place.
pub fn user_message(e: &TetherErr) -> String {
    e.to_string()
}
