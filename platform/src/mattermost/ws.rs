//! WebSocket event pump. One background task per connection keeps a socket
//! open against `/api/v4/websocket`, authenticates with the token challenge,
//! and forwards `posted` / `reaction_added` events into the client's event
//! channel. Reconnects with a capped backoff until shutdown.

use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;

use ewebsock::Options;
use ewebsock::WsEvent;
use ewebsock::WsMessage;
use serde::Deserialize;
use tokio::sync::Notify;

use super::MattermostClient;
use crate::PlatformEvent;
use crate::Post;
use crate::Reaction;

const INITIAL_RECONNECT: Duration = Duration::from_secs(5);
const MAX_RECONNECT: Duration = Duration::from_secs(60);
/// Poll fallback so the pump notices shutdown even if the socket is silent.
const IDLE_POLL: Duration = Duration::from_secs(1);

pub(super) fn spawn_pump(
    client: Arc<MattermostClient>,
    events_tx: async_channel::Sender<PlatformEvent>,
    events_rx: async_channel::Receiver<PlatformEvent>,
    shutdown: Arc<AtomicBool>,
) {
    tokio::spawn(async move {
        let mut backoff = INITIAL_RECONNECT;
        loop {
            if shutdown.load(Ordering::SeqCst) {
                break;
            }
            match run_connection(&client, &events_tx, &events_rx, &shutdown).await {
                Ok(()) => break,
                Err(e) => {
                    tracing::warn!("websocket connection lost: {e}; retrying in {backoff:?}");
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(MAX_RECONNECT);
                }
            }
        }
        tracing::debug!("websocket pump exited");
    });
}

fn ws_url(base: &str) -> String {
    let trimmed = base.trim_end_matches('/');
    let swapped = if let Some(rest) = trimmed.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = trimmed.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        trimmed.to_string()
    };
    format!("{swapped}/api/v4/websocket")
}

/// Runs one socket lifetime. `Ok(())` means a clean shutdown was requested;
/// an error asks the caller to reconnect.
async fn run_connection(
    client: &Arc<MattermostClient>,
    events_tx: &async_channel::Sender<PlatformEvent>,
    events_rx: &async_channel::Receiver<PlatformEvent>,
    shutdown: &Arc<AtomicBool>,
) -> Result<(), String> {
    let url = ws_url(&client.config().url);
    let wake = Arc::new(Notify::new());
    let wake_for_socket = wake.clone();
    let (sender, receiver) = ewebsock::connect_with_wakeup(&url, Options::default(), move || {
        wake_for_socket.notify_one()
    })
    .map_err(|e| e.to_string())?;
    client.install_ws_sender(sender);

    loop {
        if shutdown.load(Ordering::SeqCst) {
            return Ok(());
        }
        let _ = tokio::time::timeout(IDLE_POLL, wake.notified()).await;
        while let Some(event) = receiver.try_recv() {
            match event {
                WsEvent::Opened => {
                    authenticate(client);
                }
                WsEvent::Message(WsMessage::Text(text)) => {
                    if let Some(platform_event) = parse_event(&text) {
                        // The consumer may idle for long stretches (the
                        // broker only listens while a prompt is open);
                        // drop the oldest event rather than stalling the
                        // socket.
                        let mut pending = platform_event;
                        loop {
                            match events_tx.try_send(pending) {
                                Ok(()) => break,
                                Err(async_channel::TrySendError::Full(back)) => {
                                    let _ = events_rx.try_recv();
                                    pending = back;
                                }
                                Err(async_channel::TrySendError::Closed(_)) => {
                                    // Consumer gone; treat as shutdown.
                                    return Ok(());
                                }
                            }
                        }
                    }
                }
                WsEvent::Message(_) => {}
                WsEvent::Error(e) => return Err(e),
                WsEvent::Closed => return Err("socket closed".to_string()),
            }
        }
    }
}

fn authenticate(client: &Arc<MattermostClient>) {
    let payload = serde_json::json!({
        "seq": 1,
        "action": "authentication_challenge",
        "data": { "token": client.config().token },
    });
    if let Ok(mut guard) = client.ws_sender_for_pump() {
        if let Some(sender) = guard.as_mut() {
            sender.send(WsMessage::Text(payload.to_string()));
        }
    }
}

#[derive(Deserialize)]
struct WsEnvelope {
    #[serde(default)]
    event: String,
    #[serde(default)]
    data: serde_json::Value,
}

/// Mattermost embeds the post/reaction as a JSON-encoded *string* inside
/// the event data.
fn parse_event(text: &str) -> Option<PlatformEvent> {
    let envelope: WsEnvelope = serde_json::from_str(text).ok()?;
    match envelope.event.as_str() {
        "posted" => {
            let raw = envelope.data.get("post")?.as_str()?;
            let post: Post = serde_json::from_str(raw)
                .map_err(|e| tracing::warn!("unparseable posted event: {e}"))
                .ok()?;
            Some(PlatformEvent::Message { post, user: None })
        }
        "reaction_added" => {
            let raw = envelope.data.get("reaction")?.as_str()?;
            let reaction: Reaction = serde_json::from_str(raw)
                .map_err(|e| tracing::warn!("unparseable reaction event: {e}"))
                .ok()?;
            Some(PlatformEvent::Reaction {
                reaction,
                user: None,
            })
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ws_url_swaps_scheme() {
        assert_eq!(
            ws_url("https://chat.example.com/"),
            "wss://chat.example.com/api/v4/websocket"
        );
        assert_eq!(
            ws_url("http://localhost:8065"),
            "ws://localhost:8065/api/v4/websocket"
        );
    }

    #[test]
    fn parses_posted_event() {
        let text = r#"{"event":"posted","data":{"post":"{\"id\":\"p1\",\"root_id\":\"\",\"message\":\"hi\"}"}}"#;
        match parse_event(text) {
            Some(PlatformEvent::Message { post, user }) => {
                assert_eq!(post.id, "p1");
                assert_eq!(post.message, "hi");
                assert!(user.is_none());
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn parses_reaction_event() {
        let text = r#"{"event":"reaction_added","data":{"reaction":"{\"post_id\":\"p1\",\"user_id\":\"u1\",\"emoji_name\":\"+1\"}"}}"#;
        match parse_event(text) {
            Some(PlatformEvent::Reaction { reaction, .. }) => {
                assert_eq!(reaction.emoji_name, "+1");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn ignores_unrelated_events() {
        assert!(parse_event(r#"{"event":"hello","data":{}}"#).is_none());
        assert!(parse_event("not json").is_none());
    }
}
