//! Thin Mattermost backend: REST for everything the bridge writes,
//! WebSocket for the inbound event stream.

mod rest;
mod ws;

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicI64;
use std::sync::atomic::Ordering;

use async_trait::async_trait;

use crate::FileInfo;
use crate::MessageFormatter;
use crate::PlatformError;
use crate::PlatformEvent;
use crate::PlatformKind;
use crate::Post;
use crate::Result;
use crate::ThreadHistoryOptions;
use crate::User;
use crate::markdown::MattermostFormatter;

#[derive(Debug, Clone)]
pub struct MattermostConfig {
    /// Stable instance id used in session keys (`<id>:<thread>`).
    pub platform_id: String,
    /// Base URL, e.g. `https://chat.example.com`.
    pub url: String,
    pub token: String,
    /// Channel the bridge listens in and posts session threads to.
    pub channel_id: String,
    /// Usernames allowed to start sessions.
    pub allowed_users: Vec<String>,
    /// Mention name override; defaults to the bot account's username.
    pub bot_name: Option<String>,
}

pub struct MattermostClient {
    config: MattermostConfig,
    http: reqwest::Client,
    me: User,
    bot_name: String,
    formatter: MattermostFormatter,
    events_rx: async_channel::Receiver<PlatformEvent>,
    ws_sender: Mutex<Option<ewebsock::WsSender>>,
    ws_seq: AtomicI64,
    shutdown: Arc<AtomicBool>,
}

/// Establish the REST identity and the WebSocket event stream. The returned
/// client owns a background pump task that keeps reconnecting until
/// `disconnect` is called.
pub async fn connect(config: MattermostConfig) -> Result<Arc<MattermostClient>> {
    let http = reqwest::Client::new();
    let me = rest::fetch_me(&http, &config).await?;
    let bot_name = config
        .bot_name
        .clone()
        .unwrap_or_else(|| me.username.clone());

    let (events_tx, events_rx) = async_channel::bounded(256);
    let shutdown = Arc::new(AtomicBool::new(false));

    let client = Arc::new(MattermostClient {
        config,
        http,
        me,
        bot_name,
        formatter: MattermostFormatter,
        events_rx,
        ws_sender: Mutex::new(None),
        ws_seq: AtomicI64::new(1),
        shutdown: shutdown.clone(),
    });

    ws::spawn_pump(client.clone(), events_tx, client.events_rx.clone(), shutdown);
    Ok(client)
}

impl MattermostClient {
    pub(crate) fn config(&self) -> &MattermostConfig {
        &self.config
    }

    pub(crate) fn http(&self) -> &reqwest::Client {
        &self.http
    }

    pub(crate) fn me(&self) -> &User {
        &self.me
    }

    pub(crate) fn install_ws_sender(&self, sender: ewebsock::WsSender) {
        if let Ok(mut guard) = self.ws_sender.lock() {
            *guard = Some(sender);
        }
    }

    pub(crate) fn ws_sender_for_pump(
        &self,
    ) -> std::sync::LockResult<std::sync::MutexGuard<'_, Option<ewebsock::WsSender>>> {
        self.ws_sender.lock()
    }

    fn next_seq(&self) -> i64 {
        self.ws_seq.fetch_add(1, Ordering::Relaxed)
    }
}

#[async_trait]
impl crate::ChatPlatform for MattermostClient {
    fn platform_id(&self) -> &str {
        &self.config.platform_id
    }

    fn kind(&self) -> PlatformKind {
        PlatformKind::Mattermost
    }

    fn bot_user(&self) -> &User {
        &self.me
    }

    fn bot_name(&self) -> &str {
        &self.bot_name
    }

    async fn get_user(&self, user_id: &str) -> Result<User> {
        rest::get_user(self, user_id).await
    }

    fn is_user_allowed(&self, username: &str) -> bool {
        self.config
            .allowed_users
            .iter()
            .any(|allowed| allowed == username)
    }

    async fn create_post(&self, message: &str, thread_id: Option<&str>) -> Result<Post> {
        rest::create_post(self, message, thread_id).await
    }

    async fn update_post(&self, post_id: &str, message: &str) -> Result<()> {
        rest::update_post(self, post_id, message).await
    }

    async fn delete_post(&self, post_id: &str) -> Result<()> {
        rest::delete_post(self, post_id).await
    }

    async fn create_interactive_post(
        &self,
        message: &str,
        emoji_names: &[&str],
        thread_id: Option<&str>,
    ) -> Result<Post> {
        let post = rest::create_post(self, message, thread_id).await?;
        for name in emoji_names {
            // Seed reactions best-effort; a missing option emoji is not
            // worth failing the prompt over.
            if let Err(e) = rest::add_reaction(self, &post.id, name).await {
                tracing::warn!("failed to seed reaction {name} on {}: {e}", post.id);
            }
        }
        Ok(post)
    }

    async fn get_post(&self, post_id: &str) -> Result<Post> {
        rest::get_post(self, post_id).await
    }

    async fn get_thread_history(
        &self,
        thread_id: &str,
        options: ThreadHistoryOptions,
    ) -> Result<Vec<Post>> {
        let mut posts = rest::get_thread(self, thread_id).await?;
        if options.exclude_bot_messages {
            posts.retain(|p| p.user_id != self.me.id);
        }
        if let Some(limit) = options.limit
            && posts.len() > limit
        {
            posts.drain(..posts.len() - limit);
        }
        Ok(posts)
    }

    async fn add_reaction(&self, post_id: &str, emoji_name: &str) -> Result<()> {
        rest::add_reaction(self, post_id, emoji_name).await
    }

    async fn send_typing(&self, thread_id: Option<&str>) -> Result<()> {
        let seq = self.next_seq();
        let payload = serde_json::json!({
            "action": "user_typing",
            "seq": seq,
            "data": {
                "channel_id": self.config.channel_id,
                "parent_id": thread_id.unwrap_or(""),
            },
        });
        let mut guard = self
            .ws_sender
            .lock()
            .map_err(|_| PlatformError::WebSocket("sender lock poisoned".to_string()))?;
        match guard.as_mut() {
            Some(sender) => {
                sender.send(ewebsock::WsMessage::Text(payload.to_string()));
                Ok(())
            }
            None => Err(PlatformError::WebSocket("not connected".to_string())),
        }
    }

    async fn download_file(&self, file_id: &str) -> Result<Vec<u8>> {
        rest::download_file(self, file_id).await
    }

    async fn get_file_info(&self, file_id: &str) -> Result<FileInfo> {
        rest::get_file_info(self, file_id).await
    }

    fn formatter(&self) -> &dyn MessageFormatter {
        &self.formatter
    }

    fn events(&self) -> async_channel::Receiver<PlatformEvent> {
        self.events_rx.clone()
    }

    async fn disconnect(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        // Dropping the sender closes the socket; the pump task notices the
        // shutdown flag on its next wake-up and exits.
        if let Ok(mut guard) = self.ws_sender.lock() {
            *guard = None;
        }
    }
}
