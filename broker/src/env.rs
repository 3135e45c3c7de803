//! The broker's configuration surface is its environment: the parent
//! bridge bakes these variables into the agent's MCP config.

use anyhow::Context;
use anyhow::Result;

use tether_platform::PlatformKind;

#[derive(Debug, Clone)]
pub struct BrokerEnv {
    pub platform_type: PlatformKind,
    pub platform_url: String,
    pub platform_token: String,
    pub channel_id: String,
    pub thread_id: String,
    pub allowed_users: Vec<String>,
    pub debug: bool,
}

fn required(name: &str) -> Result<String> {
    std::env::var(name).with_context(|| format!("missing environment variable: {name}"))
}

impl BrokerEnv {
    pub fn from_env() -> Result<BrokerEnv> {
        let platform_type = required("PLATFORM_TYPE")?
            .parse::<PlatformKind>()
            .map_err(anyhow::Error::msg)?;
        let allowed_users = std::env::var("ALLOWED_USERS")
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
        Ok(BrokerEnv {
            platform_type,
            platform_url: required("PLATFORM_URL")?,
            platform_token: required("PLATFORM_TOKEN")?,
            channel_id: required("PLATFORM_CHANNEL_ID")?,
            thread_id: required("PLATFORM_THREAD_ID")?,
            allowed_users,
            debug: matches!(
                std::env::var("DEBUG").as_deref(),
                Ok("1") | Ok("true") | Ok("TRUE")
            ),
        })
    }
}
