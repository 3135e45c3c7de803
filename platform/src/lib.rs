//! The chat-platform boundary of the bridge.
//!
//! Everything above this crate consumes the [`ChatPlatform`] trait only; the
//! concrete backend (Mattermost today) is selected when a connection is
//! established. Reaction vocabulary and message formatting live here too
//! because they are properties of the chat surface, not of the bridge core.

mod client;
pub mod emoji;
mod error;
pub mod markdown;
pub mod mattermost;
mod types;

#[cfg(any(test, feature = "mock"))]
pub mod mock;

pub use client::ChatPlatform;
pub use client::ThreadHistoryOptions;
pub use error::PlatformError;
pub use error::Result;
pub use markdown::MessageFormatter;
pub use types::FileInfo;
pub use types::PlatformEvent;
pub use types::PlatformKind;
pub use types::Post;
pub use types::Reaction;
pub use types::User;
