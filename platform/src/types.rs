use serde::Deserialize;
use serde::Serialize;

/// Which chat backend a platform instance speaks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlatformKind {
    Mattermost,
}

impl std::fmt::Display for PlatformKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PlatformKind::Mattermost => write!(f, "mattermost"),
        }
    }
}

impl std::str::FromStr for PlatformKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "mattermost" => Ok(PlatformKind::Mattermost),
            other => Err(format!("unknown platform kind: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub username: String,
    /// Whether the backend marks this user as a system admin.
    #[serde(default)]
    pub is_admin: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Post {
    pub id: String,
    /// Root of the thread this post belongs to. Empty string for a
    /// top-level post (Mattermost convention, preserved here).
    #[serde(default)]
    pub root_id: String,
    #[serde(default)]
    pub channel_id: String,
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub file_ids: Vec<String>,
    /// Milliseconds since the epoch.
    #[serde(default)]
    pub create_at: i64,
}

impl Post {
    /// The id of the thread this post lives in: its root, or itself when it
    /// is the thread root.
    pub fn thread_root(&self) -> &str {
        if self.root_id.is_empty() {
            &self.id
        } else {
            &self.root_id
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reaction {
    pub post_id: String,
    pub user_id: String,
    pub emoji_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInfo {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub mime_type: String,
    #[serde(default)]
    pub size: u64,
}

/// One event from the platform's stream. The user is resolved when the
/// backend delivers enough information to do so cheaply; `None` means the
/// consumer must look it up itself if it cares.
#[derive(Debug, Clone)]
pub enum PlatformEvent {
    Message {
        post: Post,
        user: Option<User>,
    },
    Reaction {
        reaction: Reaction,
        user: Option<User>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn thread_root_falls_back_to_own_id() {
        let mut post = Post {
            id: "p1".to_string(),
            ..Default::default()
        };
        assert_eq!(post.thread_root(), "p1");
        post.root_id = "r9".to_string();
        assert_eq!(post.thread_root(), "r9");
    }

    #[test]
    fn platform_kind_parses() {
        assert_eq!(
            "Mattermost".parse::<PlatformKind>().ok(),
            Some(PlatformKind::Mattermost)
        );
        assert!("irc".parse::<PlatformKind>().is_err());
    }
}
