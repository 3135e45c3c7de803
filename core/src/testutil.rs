// Test-only helpers; unwraps are fine here.
#![allow(clippy::unwrap_used)]

//! Shared fixtures for unit tests: a `SessionCtx` wired to a
//! `MockPlatform` with a throwaway store and no manager.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::Weak;

use tether_platform::ChatPlatform;
use tether_platform::mock::MockPlatform;

use crate::config::Config;
use crate::manager::PostIndex;
use crate::session::SessionCtx;
use crate::session::SessionInput;
use crate::session::SessionKey;
use crate::session::SessionState;
use crate::store::SessionStore;

/// Stand in for the agent CLI with `cat`: everything written to its stdin
/// comes back as an event, so tests can observe outbound messages.
pub(crate) async fn install_echo_agent(
    ctx: &Arc<SessionCtx>,
) -> async_channel::Receiver<crate::agent::AgentOutput> {
    let (tx, rx) = async_channel::unbounded();
    let cmd = tokio::process::Command::new("cat");
    let client = crate::agent::AgentClient::spawn_with_command(cmd, tx).unwrap();
    *ctx.agent.lock().await = Some(client);
    rx
}

pub(crate) async fn test_ctx() -> (
    Arc<SessionCtx>,
    Arc<MockPlatform>,
    async_channel::Receiver<SessionInput>,
) {
    test_ctx_with_config(Config::default()).await
}

pub(crate) async fn test_ctx_with_config(
    config: Config,
) -> (
    Arc<SessionCtx>,
    Arc<MockPlatform>,
    async_channel::Receiver<SessionInput>,
) {
    let mock = Arc::new(MockPlatform::new("mm"));
    mock.allow_user("alice");
    let platform: Arc<dyn ChatPlatform> = mock.clone();

    // Keep the store directory alive for the duration of the test process.
    let dir = Box::leak(Box::new(tempfile::tempdir().unwrap()));
    let store = Arc::new(SessionStore::open(dir.path().join("sessions.json")).await);

    let key = SessionKey::new("mm", "thread-root");
    let (tx_inbox, rx_inbox) = async_channel::unbounded();
    let state = SessionState::new("alice", std::env::temp_dir());

    let ctx = Arc::new(SessionCtx {
        key,
        session_number: 1,
        platform,
        config: Arc::new(config),
        store,
        post_index: Arc::new(PostIndex::default()),
        manager: Weak::new(),
        tx_inbox,
        broker_env: HashMap::new(),
        state: Mutex::new(state),
        agent: tokio::sync::Mutex::new(None),
    });
    (ctx, mock, rx_inbox)
}
