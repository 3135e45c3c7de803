//! REST calls against the Mattermost v4 API. Each helper maps a non-2xx
//! response to [`PlatformError::UnexpectedStatus`] so callers can log the
//! body without caring about reqwest internals.

use reqwest::RequestBuilder;
use reqwest::Response;
use serde::Deserialize;
use serde_json::json;

use super::MattermostClient;
use super::MattermostConfig;
use crate::FileInfo;
use crate::PlatformError;
use crate::Post;
use crate::Result;
use crate::User;

fn api_url(config: &MattermostConfig, path: &str) -> String {
    format!("{}/api/v4{path}", config.url.trim_end_matches('/'))
}

fn authed(builder: RequestBuilder, token: &str) -> RequestBuilder {
    builder.bearer_auth(token)
}

async fn check(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    if status == reqwest::StatusCode::NOT_FOUND {
        return Err(PlatformError::Request(format!("not found: {body}")));
    }
    Err(PlatformError::UnexpectedStatus {
        status: status.as_u16(),
        body,
    })
}

/// Raw user shape from the API; `roles` is a space-separated list.
#[derive(Deserialize)]
struct MmUser {
    id: String,
    username: String,
    #[serde(default)]
    roles: String,
}

impl From<MmUser> for User {
    fn from(u: MmUser) -> Self {
        let is_admin = u.roles.split_whitespace().any(|r| r == "system_admin");
        User {
            id: u.id,
            username: u.username,
            is_admin,
        }
    }
}

pub(super) async fn fetch_me(http: &reqwest::Client, config: &MattermostConfig) -> Result<User> {
    let response = authed(http.get(api_url(config, "/users/me")), &config.token)
        .send()
        .await?;
    let user: MmUser = check(response).await?.json().await?;
    Ok(user.into())
}

pub(super) async fn get_user(client: &MattermostClient, user_id: &str) -> Result<User> {
    let config = client.config();
    let response = authed(
        client.http().get(api_url(config, &format!("/users/{user_id}"))),
        &config.token,
    )
    .send()
    .await?;
    match check(response).await {
        Ok(ok) => Ok(ok.json::<MmUser>().await?.into()),
        Err(PlatformError::Request(_)) => Err(PlatformError::UserNotFound(user_id.to_string())),
        Err(e) => Err(e),
    }
}

pub(super) async fn create_post(
    client: &MattermostClient,
    message: &str,
    thread_id: Option<&str>,
) -> Result<Post> {
    let config = client.config();
    let body = json!({
        "channel_id": config.channel_id,
        "message": message,
        "root_id": thread_id.unwrap_or(""),
    });
    let response = authed(client.http().post(api_url(config, "/posts")), &config.token)
        .json(&body)
        .send()
        .await?;
    Ok(check(response).await?.json().await?)
}

pub(super) async fn update_post(
    client: &MattermostClient,
    post_id: &str,
    message: &str,
) -> Result<()> {
    let config = client.config();
    let body = json!({ "message": message });
    let response = authed(
        client
            .http()
            .put(api_url(config, &format!("/posts/{post_id}/patch"))),
        &config.token,
    )
    .json(&body)
    .send()
    .await?;
    check(response).await?;
    Ok(())
}

pub(super) async fn delete_post(client: &MattermostClient, post_id: &str) -> Result<()> {
    let config = client.config();
    let response = authed(
        client
            .http()
            .delete(api_url(config, &format!("/posts/{post_id}"))),
        &config.token,
    )
    .send()
    .await?;
    check(response).await?;
    Ok(())
}

pub(super) async fn get_post(client: &MattermostClient, post_id: &str) -> Result<Post> {
    let config = client.config();
    let response = authed(
        client
            .http()
            .get(api_url(config, &format!("/posts/{post_id}"))),
        &config.token,
    )
    .send()
    .await?;
    match check(response).await {
        Ok(ok) => Ok(ok.json().await?),
        Err(PlatformError::Request(_)) => Err(PlatformError::PostNotFound(post_id.to_string())),
        Err(e) => Err(e),
    }
}

/// Thread responses come back as `{order: [...], posts: {id: post}}`.
#[derive(Deserialize)]
struct PostList {
    #[serde(default)]
    order: Vec<String>,
    #[serde(default)]
    posts: std::collections::HashMap<String, Post>,
}

pub(super) async fn get_thread(client: &MattermostClient, thread_id: &str) -> Result<Vec<Post>> {
    let config = client.config();
    let response = authed(
        client
            .http()
            .get(api_url(config, &format!("/posts/{thread_id}/thread"))),
        &config.token,
    )
    .send()
    .await?;
    let mut list: PostList = check(response).await?.json().await?;
    let mut posts: Vec<Post> = list
        .order
        .iter()
        .filter_map(|id| list.posts.remove(id))
        .collect();
    // Remaining entries were not referenced by `order`; keep them too.
    posts.extend(list.posts.into_values());
    posts.sort_by_key(|p| p.create_at);
    Ok(posts)
}

pub(super) async fn add_reaction(
    client: &MattermostClient,
    post_id: &str,
    emoji_name: &str,
) -> Result<()> {
    let config = client.config();
    let body = json!({
        "user_id": client.me().id,
        "post_id": post_id,
        "emoji_name": emoji_name,
    });
    let response = authed(
        client.http().post(api_url(config, "/reactions")),
        &config.token,
    )
    .json(&body)
    .send()
    .await?;
    check(response).await?;
    Ok(())
}

pub(super) async fn download_file(client: &MattermostClient, file_id: &str) -> Result<Vec<u8>> {
    let config = client.config();
    let response = authed(
        client
            .http()
            .get(api_url(config, &format!("/files/{file_id}"))),
        &config.token,
    )
    .send()
    .await?;
    Ok(check(response).await?.bytes().await?.to_vec())
}

#[derive(Deserialize)]
struct MmFileInfo {
    id: String,
    name: String,
    #[serde(default)]
    mime_type: String,
    #[serde(default)]
    size: u64,
}

pub(super) async fn get_file_info(client: &MattermostClient, file_id: &str) -> Result<FileInfo> {
    let config = client.config();
    let response = authed(
        client
            .http()
            .get(api_url(config, &format!("/files/{file_id}/info"))),
        &config.token,
    )
    .send()
    .await?;
    let info: MmFileInfo = check(response).await?.json().await?;
    let mime_type = if info.mime_type.is_empty() {
        mime_guess::from_path(&info.name)
            .first_raw()
            .unwrap_or("application/octet-stream")
            .to_string()
    } else {
        info.mime_type
    };
    Ok(FileInfo {
        id: info.id,
        name: info.name,
        mime_type,
        size: info.size,
    })
}
