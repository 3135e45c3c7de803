//! Git worktree operations behind the `!worktree` commands. Plain `git`
//! CLI calls with a timeout so a huge repository can never wedge a session
//! worker.

use std::path::Path;
use std::path::PathBuf;

use serde::Deserialize;
use serde::Serialize;
use tokio::process::Command;
use tokio::time::Duration as TokioDuration;
use tokio::time::timeout;

use crate::error::Result;
use crate::error::TetherErr;

const GIT_COMMAND_TIMEOUT: TokioDuration = TokioDuration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorktreeInfo {
    pub repo_root: PathBuf,
    pub worktree_path: PathBuf,
    pub branch: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorktreeListEntry {
    pub path: PathBuf,
    pub branch: Option<String>,
}

async fn run_git(args: &[&str], cwd: &Path) -> Result<std::process::Output> {
    let result = timeout(
        GIT_COMMAND_TIMEOUT,
        Command::new("git").args(args).current_dir(cwd).output(),
    )
    .await;
    match result {
        Ok(Ok(output)) => Ok(output),
        Ok(Err(e)) => Err(TetherErr::Io(e)),
        Err(_) => Err(TetherErr::GitTimeout(GIT_COMMAND_TIMEOUT)),
    }
}

fn stdout_line(output: &std::process::Output) -> String {
    String::from_utf8_lossy(&output.stdout).trim().to_string()
}

fn git_err(context: &str, output: &std::process::Output) -> TetherErr {
    let stderr = String::from_utf8_lossy(&output.stderr);
    TetherErr::Git(format!("{context}: {}", stderr.trim()))
}

pub async fn is_repo(cwd: &Path) -> bool {
    matches!(
        run_git(&["rev-parse", "--git-dir"], cwd).await,
        Ok(output) if output.status.success()
    )
}

/// Top-level directory of the repository containing `cwd`, if any.
pub async fn repo_root(cwd: &Path) -> Option<PathBuf> {
    let output = run_git(&["rev-parse", "--show-toplevel"], cwd).await.ok()?;
    if output.status.success() {
        Some(PathBuf::from(stdout_line(&output)))
    } else {
        None
    }
}

pub async fn has_uncommitted_changes(cwd: &Path) -> Result<bool> {
    let output = run_git(&["status", "--porcelain"], cwd).await?;
    if !output.status.success() {
        return Err(git_err("status", &output));
    }
    Ok(!stdout_line(&output).is_empty())
}

/// Parse `git worktree list --porcelain`: blocks separated by blank lines,
/// each starting with `worktree <path>` and optionally `branch refs/heads/x`.
pub async fn list_worktrees(repo_root: &Path) -> Result<Vec<WorktreeListEntry>> {
    let output = run_git(&["worktree", "list", "--porcelain"], repo_root).await?;
    if !output.status.success() {
        return Err(git_err("worktree list", &output));
    }
    Ok(parse_worktree_list(&String::from_utf8_lossy(&output.stdout)))
}

fn parse_worktree_list(porcelain: &str) -> Vec<WorktreeListEntry> {
    let mut entries = Vec::new();
    let mut current: Option<WorktreeListEntry> = None;
    for line in porcelain.lines() {
        if let Some(path) = line.strip_prefix("worktree ") {
            if let Some(entry) = current.take() {
                entries.push(entry);
            }
            current = Some(WorktreeListEntry {
                path: PathBuf::from(path),
                branch: None,
            });
        } else if let Some(branch) = line.strip_prefix("branch ") {
            if let Some(entry) = current.as_mut() {
                entry.branch = Some(
                    branch
                        .strip_prefix("refs/heads/")
                        .unwrap_or(branch)
                        .to_string(),
                );
            }
        }
    }
    if let Some(entry) = current.take() {
        entries.push(entry);
    }
    entries
}

/// `git worktree add <path> -b <branch>`. When the branch already exists
/// git fails; we surface its stderr verbatim rather than papering over the
/// difference between git versions.
pub async fn add_worktree(repo_root: &Path, path: &Path, branch: &str) -> Result<()> {
    if !is_valid_branch_name(branch) {
        return Err(TetherErr::InvalidBranchName(branch.to_string()));
    }
    let path_str = path.to_string_lossy();
    let output = run_git(&["worktree", "add", &path_str, "-b", branch], repo_root).await?;
    if !output.status.success() {
        return Err(git_err("worktree add", &output));
    }
    Ok(())
}

pub async fn remove_worktree(repo_root: &Path, path: &Path) -> Result<()> {
    let path_str = path.to_string_lossy();
    let output = run_git(&["worktree", "remove", &path_str], repo_root).await?;
    if !output.status.success() {
        return Err(git_err("worktree remove", &output));
    }
    Ok(())
}

/// Where a worktree for `branch` goes: a sibling of the repository named
/// `<repo>-<branch>` with path separators flattened.
pub fn worktree_path_for(repo_root: &Path, branch: &str) -> PathBuf {
    let repo_name = repo_root
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "repo".to_string());
    let flat_branch = branch.replace('/', "-");
    repo_root.with_file_name(format!("{repo_name}-{flat_branch}"))
}

/// Branch-name validation following the `git-check-ref-format` rules that
/// matter for a single branch component list (we do allow `/`).
pub fn is_valid_branch_name(name: &str) -> bool {
    if name.is_empty() || name == "@" {
        return false;
    }
    if name.starts_with('/') || name.ends_with('/') || name.contains("//") {
        return false;
    }
    if name.ends_with('.') || name.contains("..") || name.contains("@{") {
        return false;
    }
    for component in name.split('/') {
        if component.is_empty() || component.starts_with('.') || component.ends_with(".lock") {
            return false;
        }
    }
    !name.chars().any(|c| {
        c.is_ascii_control()
            || matches!(c, ' ' | '~' | '^' | ':' | '?' | '*' | '[' | '\\')
    })
}
