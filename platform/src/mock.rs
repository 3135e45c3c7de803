//! Scripted in-memory platform for tests. Records every call so assertions
//! can inspect the sequence of posts, updates, deletions, and reactions the
//! bridge produced, and lets tests inject inbound events.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use async_trait::async_trait;

use crate::ChatPlatform;
use crate::FileInfo;
use crate::MessageFormatter;
use crate::PlatformError;
use crate::PlatformEvent;
use crate::PlatformKind;
use crate::Post;
use crate::Reaction;
use crate::Result;
use crate::ThreadHistoryOptions;
use crate::User;
use crate::markdown::MattermostFormatter;

/// A user-visible operation the mock observed, in call order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordedCall {
    Create {
        post_id: String,
        message: String,
        thread_id: Option<String>,
    },
    CreateInteractive {
        post_id: String,
        message: String,
        emoji_names: Vec<String>,
        thread_id: Option<String>,
    },
    Update {
        post_id: String,
        message: String,
    },
    Delete {
        post_id: String,
    },
    AddReaction {
        post_id: String,
        emoji_name: String,
    },
    Typing,
}

#[derive(Default)]
struct MockState {
    posts: HashMap<String, Post>,
    order: Vec<String>,
    calls: Vec<RecordedCall>,
    users: HashMap<String, User>,
    files: HashMap<String, (FileInfo, Vec<u8>)>,
    fail_rest: bool,
}

pub struct MockPlatform {
    platform_id: String,
    bot: User,
    allowed: Mutex<Vec<String>>,
    formatter: MattermostFormatter,
    state: Mutex<MockState>,
    events_tx: async_channel::Sender<PlatformEvent>,
    events_rx: async_channel::Receiver<PlatformEvent>,
    next_id: AtomicU64,
}

pub fn mock_user(name: &str) -> User {
    User {
        id: format!("uid-{name}"),
        username: name.to_string(),
        is_admin: false,
    }
}

impl MockPlatform {
    pub fn new(platform_id: &str) -> Self {
        let (events_tx, events_rx) = async_channel::unbounded();
        let bot = User {
            id: "uid-bot".to_string(),
            username: "tether".to_string(),
            is_admin: false,
        };
        Self {
            platform_id: platform_id.to_string(),
            bot,
            allowed: Mutex::new(Vec::new()),
            formatter: MattermostFormatter,
            state: Mutex::new(MockState::default()),
            events_tx,
            events_rx,
            next_id: AtomicU64::new(1),
        }
    }

    pub fn allow_user(&self, username: &str) {
        #[allow(clippy::unwrap_used)]
        self.allowed.lock().unwrap().push(username.to_string());
    }

    pub fn register_user(&self, user: User) {
        #[allow(clippy::unwrap_used)]
        self.state
            .lock()
            .unwrap()
            .users
            .insert(user.id.clone(), user);
    }

    pub fn register_file(&self, info: FileInfo, bytes: Vec<u8>) {
        #[allow(clippy::unwrap_used)]
        self.state
            .lock()
            .unwrap()
            .files
            .insert(info.id.clone(), (info, bytes));
    }

    /// Make subsequent REST-style calls fail, for error-path tests.
    pub fn set_fail_rest(&self, fail: bool) {
        #[allow(clippy::unwrap_used)]
        {
            self.state.lock().unwrap().fail_rest = fail;
        }
    }

    /// Seed an existing post (e.g. the user's mention) without recording a
    /// bridge call.
    pub fn seed_post(&self, post: Post) {
        #[allow(clippy::unwrap_used)]
        let mut state = self.state.lock().unwrap();
        state.order.push(post.id.clone());
        state.posts.insert(post.id.clone(), post);
    }

    pub async fn inject_message(&self, post: Post, user: Option<User>) {
        self.seed_post(post.clone());
        let _ = self.events_tx.send(PlatformEvent::Message { post, user }).await;
    }

    pub async fn inject_reaction(&self, reaction: Reaction, user: Option<User>) {
        let _ = self
            .events_tx
            .send(PlatformEvent::Reaction { reaction, user })
            .await;
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        #[allow(clippy::unwrap_used)]
        self.state.lock().unwrap().calls.clone()
    }

    pub fn post_text(&self, post_id: &str) -> Option<String> {
        #[allow(clippy::unwrap_used)]
        self.state
            .lock()
            .unwrap()
            .posts
            .get(post_id)
            .map(|p| p.message.clone())
    }

    /// Live posts in creation order (deleted posts excluded).
    pub fn live_posts(&self) -> Vec<Post> {
        #[allow(clippy::unwrap_used)]
        let state = self.state.lock().unwrap();
        state
            .order
            .iter()
            .filter_map(|id| state.posts.get(id).cloned())
            .collect()
    }

    pub fn last_post(&self) -> Option<Post> {
        self.live_posts().into_iter().next_back()
    }

    fn fresh_post(&self, message: &str, thread_id: Option<&str>) -> Post {
        let n = self.next_id.fetch_add(1, Ordering::SeqCst);
        Post {
            id: format!("post-{n}"),
            root_id: thread_id.unwrap_or("").to_string(),
            channel_id: "chan".to_string(),
            user_id: self.bot.id.clone(),
            message: message.to_string(),
            file_ids: Vec::new(),
            create_at: n as i64,
        }
    }

    fn bail_if_failing(&self, state: &MockState) -> Result<()> {
        if state.fail_rest {
            Err(PlatformError::Request("mock failure".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl ChatPlatform for MockPlatform {
    fn platform_id(&self) -> &str {
        &self.platform_id
    }

    fn kind(&self) -> PlatformKind {
        PlatformKind::Mattermost
    }

    fn bot_user(&self) -> &User {
        &self.bot
    }

    fn bot_name(&self) -> &str {
        &self.bot.username
    }

    async fn get_user(&self, user_id: &str) -> Result<User> {
        #[allow(clippy::unwrap_used)]
        let state = self.state.lock().unwrap();
        state
            .users
            .get(user_id)
            .cloned()
            .ok_or_else(|| PlatformError::UserNotFound(user_id.to_string()))
    }

    fn is_user_allowed(&self, username: &str) -> bool {
        #[allow(clippy::unwrap_used)]
        self.allowed.lock().unwrap().iter().any(|u| u == username)
    }

    async fn create_post(&self, message: &str, thread_id: Option<&str>) -> Result<Post> {
        let post = self.fresh_post(message, thread_id);
        #[allow(clippy::unwrap_used)]
        let mut state = self.state.lock().unwrap();
        self.bail_if_failing(&state)?;
        state.calls.push(RecordedCall::Create {
            post_id: post.id.clone(),
            message: message.to_string(),
            thread_id: thread_id.map(str::to_string),
        });
        state.order.push(post.id.clone());
        state.posts.insert(post.id.clone(), post.clone());
        Ok(post)
    }

    async fn update_post(&self, post_id: &str, message: &str) -> Result<()> {
        #[allow(clippy::unwrap_used)]
        let mut state = self.state.lock().unwrap();
        self.bail_if_failing(&state)?;
        state.calls.push(RecordedCall::Update {
            post_id: post_id.to_string(),
            message: message.to_string(),
        });
        match state.posts.get_mut(post_id) {
            Some(post) => {
                post.message = message.to_string();
                Ok(())
            }
            None => Err(PlatformError::PostNotFound(post_id.to_string())),
        }
    }

    async fn delete_post(&self, post_id: &str) -> Result<()> {
        #[allow(clippy::unwrap_used)]
        let mut state = self.state.lock().unwrap();
        self.bail_if_failing(&state)?;
        state.calls.push(RecordedCall::Delete {
            post_id: post_id.to_string(),
        });
        state.posts.remove(post_id);
        state.order.retain(|id| id != post_id);
        Ok(())
    }

    async fn create_interactive_post(
        &self,
        message: &str,
        emoji_names: &[&str],
        thread_id: Option<&str>,
    ) -> Result<Post> {
        let post = self.fresh_post(message, thread_id);
        #[allow(clippy::unwrap_used)]
        let mut state = self.state.lock().unwrap();
        self.bail_if_failing(&state)?;
        state.calls.push(RecordedCall::CreateInteractive {
            post_id: post.id.clone(),
            message: message.to_string(),
            emoji_names: emoji_names.iter().map(|s| s.to_string()).collect(),
            thread_id: thread_id.map(str::to_string),
        });
        state.order.push(post.id.clone());
        state.posts.insert(post.id.clone(), post.clone());
        Ok(post)
    }

    async fn get_post(&self, post_id: &str) -> Result<Post> {
        #[allow(clippy::unwrap_used)]
        let state = self.state.lock().unwrap();
        state
            .posts
            .get(post_id)
            .cloned()
            .ok_or_else(|| PlatformError::PostNotFound(post_id.to_string()))
    }

    async fn get_thread_history(
        &self,
        thread_id: &str,
        options: ThreadHistoryOptions,
    ) -> Result<Vec<Post>> {
        #[allow(clippy::unwrap_used)]
        let state = self.state.lock().unwrap();
        let mut posts: Vec<Post> = state
            .order
            .iter()
            .filter_map(|id| state.posts.get(id))
            .filter(|p| p.id == thread_id || p.root_id == thread_id)
            .cloned()
            .collect();
        if options.exclude_bot_messages {
            posts.retain(|p| p.user_id != self.bot.id);
        }
        if let Some(limit) = options.limit
            && posts.len() > limit
        {
            posts.drain(..posts.len() - limit);
        }
        Ok(posts)
    }

    async fn add_reaction(&self, post_id: &str, emoji_name: &str) -> Result<()> {
        #[allow(clippy::unwrap_used)]
        let mut state = self.state.lock().unwrap();
        self.bail_if_failing(&state)?;
        state.calls.push(RecordedCall::AddReaction {
            post_id: post_id.to_string(),
            emoji_name: emoji_name.to_string(),
        });
        Ok(())
    }

    async fn send_typing(&self, _thread_id: Option<&str>) -> Result<()> {
        #[allow(clippy::unwrap_used)]
        let mut state = self.state.lock().unwrap();
        state.calls.push(RecordedCall::Typing);
        Ok(())
    }

    async fn download_file(&self, file_id: &str) -> Result<Vec<u8>> {
        #[allow(clippy::unwrap_used)]
        let state = self.state.lock().unwrap();
        state
            .files
            .get(file_id)
            .map(|(_, bytes)| bytes.clone())
            .ok_or_else(|| PlatformError::Request(format!("no such file: {file_id}")))
    }

    async fn get_file_info(&self, file_id: &str) -> Result<FileInfo> {
        #[allow(clippy::unwrap_used)]
        let state = self.state.lock().unwrap();
        state
            .files
            .get(file_id)
            .map(|(info, _)| info.clone())
            .ok_or_else(|| PlatformError::Request(format!("no such file: {file_id}")))
    }

    fn formatter(&self) -> &dyn MessageFormatter {
        &self.formatter
    }

    fn events(&self) -> async_channel::Receiver<PlatformEvent> {
        self.events_rx.clone()
    }

    async fn disconnect(&self) {
        self.events_tx.close();
    }
}
