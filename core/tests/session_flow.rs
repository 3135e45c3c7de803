//! End-to-end flows against a scripted platform and a shell stand-in for
//! the agent CLI.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;

use tether_core::Config;
use tether_core::PlatformRuntime;
use tether_core::SessionManager;
use tether_core::SessionStore;
use tether_core::session::SessionKey;
use tether_platform::ChatPlatform;
use tether_platform::Post;
use tether_platform::Reaction;
use tether_platform::mock::MockPlatform;
use tether_platform::mock::mock_user;

/// A fake agent: emits one assistant text event, then stays alive reading
/// stdin until it is killed.
fn write_fake_agent(dir: &std::path::Path) -> PathBuf {
    let path = dir.join("fake-agent.sh");
    let script = r#"#!/bin/sh
echo '{"type":"assistant","message":{"content":[{"type":"text","text":"hello from agent"}]}}'
while read line; do :; done
"#;
    std::fs::write(&path, script).unwrap();
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }
    path
}

struct Harness {
    mock: Arc<MockPlatform>,
    shutdown: Arc<Notify>,
    state_file: PathBuf,
    _dir: tempfile::TempDir,
}

async fn start_bridge(max_sessions: usize) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let agent = write_fake_agent(dir.path());
    let workdir = dir.path().join("work");
    std::fs::create_dir(&workdir).unwrap();
    let state_file = dir.path().join("sessions.json");

    let config = Config {
        agent_program: agent.to_string_lossy().into_owned(),
        state_file: state_file.clone(),
        default_working_dir: workdir,
        max_sessions,
        update_coalesce: Duration::from_millis(50),
        typing_tick: Duration::from_millis(200),
        skip_permissions: true,
        ..Config::default()
    };

    let mock = Arc::new(MockPlatform::new("mm"));
    mock.allow_user("alice");
    let client: Arc<dyn ChatPlatform> = mock.clone();
    let runtime = PlatformRuntime {
        client,
        broker_env: Default::default(),
    };

    let manager = SessionManager::new(config, vec![runtime]).await;
    let shutdown = Arc::new(Notify::new());
    let run_shutdown = shutdown.clone();
    tokio::spawn(async move {
        let _ = manager.run(run_shutdown).await;
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    Harness {
        mock,
        shutdown,
        state_file,
        _dir: dir,
    }
}

fn mention(thread_id: &str, text: &str, username: &str) -> Post {
    Post {
        id: thread_id.to_string(),
        root_id: String::new(),
        channel_id: "chan".to_string(),
        user_id: format!("uid-{username}"),
        message: text.to_string(),
        file_ids: Vec::new(),
        create_at: 0,
    }
}

fn reply(id: &str, thread_id: &str, text: &str, username: &str) -> Post {
    Post {
        id: id.to_string(),
        root_id: thread_id.to_string(),
        channel_id: "chan".to_string(),
        user_id: format!("uid-{username}"),
        message: text.to_string(),
        file_ids: Vec::new(),
        create_at: 1,
    }
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(400)).await;
}

#[tokio::test]
async fn mention_starts_a_session_and_streams_the_reply() {
    let h = start_bridge(5).await;

    h.mock
        .inject_message(
            mention("thread-1", "@tether write hello to a.txt", "alice"),
            Some(mock_user("alice")),
        )
        .await;
    settle().await;

    let posts = h.mock.live_posts();
    // Header post in the thread.
    assert!(
        posts.iter().any(|p| p.message.contains("Session #1")),
        "no header post in {posts:?}"
    );
    // The agent's streamed text landed in an edited post.
    assert!(
        posts.iter().any(|p| p.message.contains("hello from agent")),
        "no streamed reply in {posts:?}"
    );
    // A sticky channel summary exists at top level.
    assert!(
        posts
            .iter()
            .any(|p| p.root_id.is_empty() && p.message.contains("Active agent sessions")),
        "no sticky summary in {posts:?}"
    );

    // The session was persisted with the owner in its allow-list.
    let store = SessionStore::open(&h.state_file).await;
    let persisted = store.get(&SessionKey::new("mm", "thread-1")).await.unwrap();
    assert_eq!(persisted.started_by, "alice");
    assert!(persisted.allowed_users.contains(&"alice".to_string()));
}

#[tokio::test]
async fn unauthorized_mentions_are_ignored() {
    let h = start_bridge(5).await;

    h.mock
        .inject_message(
            mention("thread-1", "@tether hi", "mallory"),
            Some(mock_user("mallory")),
        )
        .await;
    settle().await;

    assert!(h.mock.calls().is_empty(), "bridge reacted to mallory");
    let store = SessionStore::open(&h.state_file).await;
    assert!(store.sessions().await.is_empty());
}

#[tokio::test]
async fn session_cap_is_enforced_with_a_notice() {
    let h = start_bridge(1).await;

    h.mock
        .inject_message(
            mention("thread-1", "@tether first", "alice"),
            Some(mock_user("alice")),
        )
        .await;
    settle().await;
    h.mock
        .inject_message(
            mention("thread-2", "@tether second", "alice"),
            Some(mock_user("alice")),
        )
        .await;
    settle().await;

    let posts = h.mock.live_posts();
    assert!(
        posts
            .iter()
            .any(|p| p.root_id == "thread-2" && p.message.contains("Session limit reached")),
        "no limit notice in {posts:?}"
    );
    let store = SessionStore::open(&h.state_file).await;
    assert_eq!(store.sessions().await.len(), 1);
}

#[tokio::test]
async fn stop_command_kills_and_unpersists() {
    let h = start_bridge(5).await;

    h.mock
        .inject_message(
            mention("thread-1", "@tether start", "alice"),
            Some(mock_user("alice")),
        )
        .await;
    settle().await;

    h.mock
        .inject_message(
            reply("p-stop", "thread-1", "!stop", "alice"),
            Some(mock_user("alice")),
        )
        .await;
    settle().await;

    let posts = h.mock.live_posts();
    assert!(
        posts.iter().any(|p| p.message.contains("stopped by @alice")),
        "no cancellation notice in {posts:?}"
    );
    let store = SessionStore::open(&h.state_file).await;
    assert!(store.sessions().await.is_empty(), "session still persisted");
}

#[tokio::test]
async fn cancel_reaction_on_the_header_kills_the_session() {
    let h = start_bridge(5).await;

    h.mock
        .inject_message(
            mention("thread-1", "@tether start", "alice"),
            Some(mock_user("alice")),
        )
        .await;
    settle().await;

    let header = h
        .mock
        .live_posts()
        .into_iter()
        .find(|p| p.message.contains("Session #1"))
        .unwrap();
    h.mock
        .inject_reaction(
            Reaction {
                post_id: header.id,
                user_id: "uid-alice".to_string(),
                emoji_name: "x".to_string(),
            },
            Some(mock_user("alice")),
        )
        .await;
    settle().await;

    let posts = h.mock.live_posts();
    assert!(
        posts.iter().any(|p| p.message.contains("stopped by @alice")),
        "no stop notice in {posts:?}"
    );
}

#[tokio::test]
async fn shutdown_keeps_persistence_for_resume() {
    let h = start_bridge(5).await;

    h.mock
        .inject_message(
            mention("thread-1", "@tether start", "alice"),
            Some(mock_user("alice")),
        )
        .await;
    settle().await;

    h.shutdown.notify_waiters();
    tokio::time::sleep(Duration::from_millis(300)).await;

    let store = SessionStore::open(&h.state_file).await;
    let sessions = store.sessions().await;
    assert_eq!(sessions.len(), 1, "session record lost on shutdown");
    assert_eq!(sessions[0].thread_id, "thread-1");
}

#[tokio::test]
async fn persisted_sessions_resume_on_startup_with_the_same_identity() {
    let dir = tempfile::tempdir().unwrap();
    let agent = write_fake_agent(dir.path());
    let workdir = dir.path().join("work");
    std::fs::create_dir(&workdir).unwrap();
    let state_file = dir.path().join("sessions.json");

    // A session survived a previous bridge run.
    let agent_session_id = uuid::Uuid::new_v4();
    {
        let store = SessionStore::open(&state_file).await;
        store
            .save(tether_core::PersistedSession {
                session_id: "mm:thread-9".to_string(),
                platform_id: "mm".to_string(),
                thread_id: "thread-9".to_string(),
                agent_session_id,
                started_by: "alice".to_string(),
                started_at: chrono::Utc::now(),
                last_activity_at: chrono::Utc::now(),
                session_number: 3,
                working_dir: workdir.clone(),
                worktree: None,
                allowed_users: vec!["alice".to_string(), "bob".to_string()],
                force_interactive_permissions: false,
                was_interrupted: false,
                resume_fail_count: 0,
                session_start_post_id: Some("old-header".to_string()),
                lifecycle_post_id: None,
                message_count: 7,
                usage: None,
            })
            .await
            .unwrap();
    }

    let config = Config {
        agent_program: agent.to_string_lossy().into_owned(),
        state_file: state_file.clone(),
        default_working_dir: workdir,
        update_coalesce: Duration::from_millis(50),
        skip_permissions: true,
        ..Config::default()
    };
    let mock = Arc::new(MockPlatform::new("mm"));
    mock.allow_user("alice");
    let client: Arc<dyn ChatPlatform> = mock.clone();
    let manager = SessionManager::new(
        config,
        vec![PlatformRuntime {
            client,
            broker_env: Default::default(),
        }],
    )
    .await;
    let shutdown = Arc::new(Notify::new());
    let run_shutdown = shutdown.clone();
    tokio::spawn(async move {
        let _ = manager.run(run_shutdown).await;
    });
    settle().await;

    let posts = mock.live_posts();
    assert!(
        posts
            .iter()
            .any(|p| p.root_id == "thread-9" && p.message.contains("Session resumed")),
        "no resume notice in {posts:?}"
    );

    // Identity and collaborators survived the restart.
    let store = SessionStore::open(&state_file).await;
    let persisted = store.get(&SessionKey::new("mm", "thread-9")).await.unwrap();
    assert_eq!(persisted.agent_session_id, agent_session_id);
    assert!(persisted.allowed_users.contains(&"bob".to_string()));
    assert_eq!(persisted.session_number, 3);
}

#[tokio::test]
async fn in_thread_messages_from_unknown_users_open_an_approval() {
    let h = start_bridge(5).await;

    h.mock.register_user(mock_user("bob"));
    h.mock
        .inject_message(
            mention("thread-1", "@tether start", "alice"),
            Some(mock_user("alice")),
        )
        .await;
    settle().await;

    h.mock
        .inject_message(
            reply("p-bob", "thread-1", "please add dark mode", "bob"),
            Some(mock_user("bob")),
        )
        .await;
    settle().await;

    let posts = h.mock.live_posts();
    assert!(
        posts
            .iter()
            .any(|p| p.message.contains("@bob wants to send a message")),
        "no approval prompt in {posts:?}"
    );
}
