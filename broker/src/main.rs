use std::sync::Arc;

use anyhow::Context;

use tether_broker::env::BrokerEnv;
use tether_broker::run_main;
use tether_platform::ChatPlatform;
use tether_platform::PlatformKind;
use tether_platform::mattermost;
use tether_platform::mattermost::MattermostConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // stdout carries JSON-RPC frames; all diagnostics go to stderr.
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let broker_env = BrokerEnv::from_env()?;
    let platform: Arc<dyn ChatPlatform> = match broker_env.platform_type {
        PlatformKind::Mattermost => mattermost::connect(MattermostConfig {
            platform_id: "broker".to_string(),
            url: broker_env.platform_url.clone(),
            token: broker_env.platform_token.clone(),
            channel_id: broker_env.channel_id.clone(),
            allowed_users: broker_env.allowed_users.clone(),
            bot_name: None,
        })
        .await
        .context("connecting to the chat platform")?,
    };

    run_main(platform, broker_env).await?;
    Ok(())
}
