//! The single RPC this process exists for: ask a human, via a reaction, to
//! allow or deny one agent tool call.

use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tokio::time::Instant;

use tether_platform::ChatPlatform;
use tether_platform::PlatformEvent;
use tether_platform::emoji;

use crate::env::BrokerEnv;

pub const PERMISSION_TIMEOUT: Duration = Duration::from_secs(120);

/// What goes back to the agent, serialized as the tool result text.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PermissionDecision {
    pub behavior: Behavior,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_input: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Behavior {
    Allow,
    Deny,
}

impl PermissionDecision {
    fn allow(input: Value) -> Self {
        PermissionDecision {
            behavior: Behavior::Allow,
            updated_input: Some(input),
            message: None,
        }
    }

    fn deny(message: impl Into<String>) -> Self {
        PermissionDecision {
            behavior: Behavior::Deny,
            updated_input: None,
            message: Some(message.into()),
        }
    }
}

pub async fn prompt_for_permission(
    platform: &Arc<dyn ChatPlatform>,
    env: &BrokerEnv,
    allow_all_latch: &Arc<AtomicBool>,
    tool_name: &str,
    input: Value,
) -> PermissionDecision {
    prompt_with_timeout(
        platform,
        env,
        allow_all_latch,
        tool_name,
        input,
        PERMISSION_TIMEOUT,
    )
    .await
}

pub(crate) async fn prompt_with_timeout(
    platform: &Arc<dyn ChatPlatform>,
    env: &BrokerEnv,
    allow_all_latch: &Arc<AtomicBool>,
    tool_name: &str,
    input: Value,
    timeout: Duration,
) -> PermissionDecision {
    // A previous "allow all" reaction latches for the lifetime of this
    // broker process, i.e. for this agent session.
    if allow_all_latch.load(Ordering::SeqCst) {
        return PermissionDecision::allow(input);
    }

    let descriptor = tether_core::toolfmt::describe_tool(tool_name, &input, None);
    let message =
        format!("🔐 **Permission needed**: {descriptor}\n\n👍 allow · ✅ allow all · 👎 deny");

    let post = match platform
        .create_interactive_post(
            &message,
            &[emoji::APPROVE, emoji::ALLOW_ALL, emoji::DENY],
            Some(&env.thread_id),
        )
        .await
    {
        Ok(post) => post,
        Err(e) => {
            tracing::error!("could not post permission prompt: {e}");
            return PermissionDecision::deny("could not reach the chat platform");
        }
    };

    let events = platform.events();
    let deadline = Instant::now() + timeout;
    let bot_id = platform.bot_user().id.clone();

    loop {
        let event = tokio::select! {
            received = events.recv() => match received {
                Ok(event) => event,
                Err(_) => {
                    return PermissionDecision::deny("event stream closed");
                }
            },
            _ = tokio::time::sleep_until(deadline) => {
                let _ = platform
                    .update_post(&post.id, "⏱️ Permission request timed out — denied.")
                    .await;
                return PermissionDecision::deny("timed out waiting for a decision");
            }
        };

        let PlatformEvent::Reaction { reaction, user } = event else {
            continue;
        };
        if reaction.post_id != post.id || reaction.user_id == bot_id {
            continue;
        }
        // Resolve and filter by the allowed-user list; reactions from
        // anyone else leave the wait running.
        let username = match user {
            Some(user) => user.username,
            None => match platform.get_user(&reaction.user_id).await {
                Ok(user) => user.username,
                Err(e) => {
                    tracing::warn!("could not resolve reacting user: {e}");
                    continue;
                }
            },
        };
        if !env.allowed_users.iter().any(|u| u == &username) {
            continue;
        }

        let name = reaction.emoji_name.as_str();
        if emoji::is_approval(name) {
            let _ = platform
                .update_post(&post.id, &format!("✅ Allowed by @{username}: {descriptor}"))
                .await;
            return PermissionDecision::allow(input);
        }
        if emoji::is_allow_all(name) {
            allow_all_latch.store(true, Ordering::SeqCst);
            let _ = platform
                .update_post(
                    &post.id,
                    &format!("✅ Allowed by @{username} (all future tools): {descriptor}"),
                )
                .await;
            return PermissionDecision::allow(input);
        }
        if emoji::is_denial(name) {
            let _ = platform
                .update_post(&post.id, &format!("🚫 Denied by @{username}: {descriptor}"))
                .await;
            return PermissionDecision::deny(format!("denied by {username}"));
        }
        // Any other emoji keeps waiting.
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use tether_platform::Reaction;
    use tether_platform::mock::MockPlatform;
    use tether_platform::mock::mock_user;

    fn test_env() -> BrokerEnv {
        BrokerEnv {
            platform_type: tether_platform::PlatformKind::Mattermost,
            platform_url: "http://localhost".to_string(),
            platform_token: "token".to_string(),
            channel_id: "chan".to_string(),
            thread_id: "thread-1".to_string(),
            allowed_users: vec!["alice".to_string()],
            debug: false,
        }
    }

    async fn react(mock: &Arc<MockPlatform>, post_id: &str, emoji: &str, username: &str) {
        mock.inject_reaction(
            Reaction {
                post_id: post_id.to_string(),
                user_id: format!("uid-{username}"),
                emoji_name: emoji.to_string(),
            },
            Some(mock_user(username)),
        )
        .await;
    }

    #[tokio::test]
    async fn approval_reaction_allows_and_updates_post() {
        let mock = Arc::new(MockPlatform::new("mm"));
        let platform: Arc<dyn ChatPlatform> = mock.clone();
        let latch = Arc::new(AtomicBool::new(false));
        let env = test_env();

        let mock2 = mock.clone();
        let wait = tokio::spawn({
            let platform = platform.clone();
            let latch = latch.clone();
            async move {
                prompt_with_timeout(
                    &platform,
                    &env,
                    &latch,
                    "Write",
                    json!({"file_path": "/tmp/a.txt", "content": "hello"}),
                    Duration::from_secs(5),
                )
                .await
            }
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        let post = mock2.last_post().unwrap();
        assert!(post.message.contains("Permission needed"));
        react(&mock2, &post.id, "+1", "alice").await;

        let decision = wait.await.unwrap();
        assert_eq!(decision.behavior, Behavior::Allow);
        assert_eq!(
            decision.updated_input.unwrap()["file_path"],
            "/tmp/a.txt"
        );
        assert!(!latch.load(Ordering::SeqCst));
        assert!(mock2.post_text(&post.id).unwrap().contains("Allowed by @alice"));
    }

    #[tokio::test]
    async fn allow_all_sets_the_latch_and_skips_the_next_prompt() {
        let mock = Arc::new(MockPlatform::new("mm"));
        let platform: Arc<dyn ChatPlatform> = mock.clone();
        let latch = Arc::new(AtomicBool::new(false));
        let env = test_env();

        let wait = tokio::spawn({
            let platform = platform.clone();
            let latch = latch.clone();
            let env = env.clone();
            async move {
                prompt_with_timeout(
                    &platform,
                    &env,
                    &latch,
                    "Bash",
                    json!({"command": "cargo test"}),
                    Duration::from_secs(5),
                )
                .await
            }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        let post = mock.last_post().unwrap();
        react(&mock, &post.id, "white_check_mark", "alice").await;
        assert_eq!(wait.await.unwrap().behavior, Behavior::Allow);
        assert!(latch.load(Ordering::SeqCst));

        // With the latch set, no new post is created at all.
        let before = mock.live_posts().len();
        let decision = prompt_with_timeout(
            &platform,
            &env,
            &latch,
            "Bash",
            json!({"command": "rm file"}),
            Duration::from_millis(100),
        )
        .await;
        assert_eq!(decision.behavior, Behavior::Allow);
        assert_eq!(mock.live_posts().len(), before);
    }

    #[tokio::test]
    async fn denial_and_non_allowed_users() {
        let mock = Arc::new(MockPlatform::new("mm"));
        let platform: Arc<dyn ChatPlatform> = mock.clone();
        let latch = Arc::new(AtomicBool::new(false));
        let env = test_env();

        let wait = tokio::spawn({
            let platform = platform.clone();
            let latch = latch.clone();
            async move {
                prompt_with_timeout(
                    &platform,
                    &env,
                    &latch,
                    "Bash",
                    json!({"command": "sudo make install"}),
                    Duration::from_secs(5),
                )
                .await
            }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        let post = mock.last_post().unwrap();

        // A reaction from someone off the allow-list is ignored; the wait
        // continues until alice denies.
        react(&mock, &post.id, "+1", "mallory").await;
        react(&mock, &post.id, "-1", "alice").await;

        let decision = wait.await.unwrap();
        assert_eq!(decision.behavior, Behavior::Deny);
        assert!(decision.message.unwrap().contains("alice"));
        assert!(mock.post_text(&post.id).unwrap().contains("Denied by @alice"));
    }

    #[tokio::test]
    async fn timeout_denies_and_updates_the_post() {
        let mock = Arc::new(MockPlatform::new("mm"));
        let platform: Arc<dyn ChatPlatform> = mock.clone();
        let latch = Arc::new(AtomicBool::new(false));
        let env = test_env();

        let started = std::time::Instant::now();
        let decision = prompt_with_timeout(
            &platform,
            &env,
            &latch,
            "WebFetch",
            json!({"url": "https://example.com"}),
            Duration::from_millis(150),
        )
        .await;
        assert!(started.elapsed() >= Duration::from_millis(150));
        assert_eq!(decision.behavior, Behavior::Deny);
        let post = mock.last_post().unwrap();
        assert!(post.message.contains("timed out"));
    }

    #[test]
    fn decision_serializes_to_the_wire_shape() {
        let allow = PermissionDecision::allow(json!({"command": "ls"}));
        let raw = serde_json::to_value(&allow).unwrap();
        assert_eq!(raw["behavior"], "allow");
        assert_eq!(raw["updatedInput"]["command"], "ls");
        assert!(raw.get("message").is_none());

        let deny = PermissionDecision::deny("nope");
        let raw = serde_json::to_value(&deny).unwrap();
        assert_eq!(raw["behavior"], "deny");
        assert_eq!(raw["message"], "nope");
        assert!(raw.get("updatedInput").is_none());
    }
}
