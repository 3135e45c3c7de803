use async_trait::async_trait;

use crate::FileInfo;
use crate::MessageFormatter;
use crate::PlatformEvent;
use crate::PlatformKind;
use crate::Post;
use crate::Result;
use crate::User;

#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadHistoryOptions {
    /// Maximum number of posts to return, newest last. `None` = backend
    /// default.
    pub limit: Option<usize>,
    /// Drop posts authored by the bot itself.
    pub exclude_bot_messages: bool,
}

/// One connected chat backend.
///
/// The bridge core and the permission broker are written against this trait
/// only. All methods that reach the network may fail transiently; callers
/// log and continue (a dropped `update_post` is superseded by the next
/// flush).
#[async_trait]
pub trait ChatPlatform: Send + Sync {
    /// Stable identifier of this configured instance, used in session keys
    /// and the persistence store.
    fn platform_id(&self) -> &str;

    fn kind(&self) -> PlatformKind;

    fn bot_user(&self) -> &User;

    /// Display name users mention to address the bot, without the `@`.
    fn bot_name(&self) -> &str;

    async fn get_user(&self, user_id: &str) -> Result<User>;

    /// Global allow-list check for starting sessions.
    fn is_user_allowed(&self, username: &str) -> bool;

    async fn create_post(&self, message: &str, thread_id: Option<&str>) -> Result<Post>;

    async fn update_post(&self, post_id: &str, message: &str) -> Result<()>;

    async fn delete_post(&self, post_id: &str) -> Result<()>;

    /// Create a post and pre-seed it with the given reaction emojis so the
    /// user can answer with one tap.
    async fn create_interactive_post(
        &self,
        message: &str,
        emoji_names: &[&str],
        thread_id: Option<&str>,
    ) -> Result<Post>;

    async fn get_post(&self, post_id: &str) -> Result<Post>;

    async fn get_thread_history(
        &self,
        thread_id: &str,
        options: ThreadHistoryOptions,
    ) -> Result<Vec<Post>>;

    async fn add_reaction(&self, post_id: &str, emoji_name: &str) -> Result<()>;

    async fn send_typing(&self, thread_id: Option<&str>) -> Result<()>;

    async fn download_file(&self, file_id: &str) -> Result<Vec<u8>>;

    async fn get_file_info(&self, file_id: &str) -> Result<FileInfo>;

    fn formatter(&self) -> &dyn MessageFormatter;

    /// The inbound event stream. Exactly one consumer is expected per
    /// connection; each event is delivered once.
    fn events(&self) -> async_channel::Receiver<PlatformEvent>;

    async fn disconnect(&self);
}
