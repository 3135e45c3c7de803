use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;

use tether_core::Config;
use tether_core::PlatformRuntime;
use tether_core::SessionManager;
use tether_core::util::notify_on_sigint;
use tether_platform::ChatPlatform;
use tether_platform::PlatformKind;
use tether_platform::mattermost;
use tether_platform::mattermost::MattermostConfig;

#[derive(Parser, Debug)]
#[command(name = "tether", version, about = "Bridge chat threads to an AI coding agent")]
pub struct Cli {
    /// Chat backend to connect to.
    #[arg(long, default_value = "mattermost")]
    pub platform: PlatformKind,

    /// Identifier for this platform instance, used in session keys.
    #[arg(long, default_value = "mattermost")]
    pub platform_id: String,

    /// Base URL of the chat server, e.g. https://chat.example.com
    #[arg(long, env = "TETHER_PLATFORM_URL")]
    pub url: String,

    /// Bot access token.
    #[arg(long, env = "TETHER_PLATFORM_TOKEN", hide_env_values = true)]
    pub token: String,

    /// Channel the bridge listens in.
    #[arg(long, env = "TETHER_CHANNEL_ID")]
    pub channel: String,

    /// Users allowed to start sessions (comma separated).
    #[arg(long, env = "TETHER_ALLOWED_USERS", value_delimiter = ',')]
    pub allowed_users: Vec<String>,

    /// Agent CLI executable.
    #[arg(long, default_value = "claude")]
    pub agent: String,

    /// Permission broker executable. Defaults to `tether-broker` next to
    /// this binary.
    #[arg(long)]
    pub broker: Option<PathBuf>,

    /// Session state file. Defaults to ~/.tether/sessions.json
    #[arg(long)]
    pub state_file: Option<PathBuf>,

    /// Working directory new sessions start in.
    #[arg(long)]
    pub working_dir: Option<PathBuf>,

    /// Maximum number of concurrent sessions.
    #[arg(long, default_value_t = 5)]
    pub max_sessions: usize,

    /// Minutes of inactivity before a session is ended.
    #[arg(long, default_value_t = 30)]
    pub idle_minutes: u64,

    /// Run the agent with --dangerously-skip-permissions instead of the
    /// reaction-based permission broker.
    #[arg(long, default_value_t = false)]
    pub skip_permissions: bool,

    /// Extra system-prompt text appended to every session.
    #[arg(long)]
    pub append_system_prompt: Option<String>,

    /// Enable the agent's chrome-automation integration.
    #[arg(long, default_value_t = false)]
    pub chrome: bool,

    /// Verbose diagnostics (also sets DEBUG=1 for brokers).
    #[arg(long, default_value_t = false)]
    pub debug: bool,
}

pub async fn run_main(cli: Cli) -> anyhow::Result<()> {
    let default_filter = if cli.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter)),
        )
        .with_writer(std::io::stderr)
        .init();

    let client: Arc<dyn ChatPlatform> = match cli.platform {
        PlatformKind::Mattermost => mattermost::connect(MattermostConfig {
            platform_id: cli.platform_id.clone(),
            url: cli.url.clone(),
            token: cli.token.clone(),
            channel_id: cli.channel.clone(),
            allowed_users: cli.allowed_users.clone(),
            bot_name: None,
        })
        .await
        .context("connecting to the chat platform")?,
    };
    tracing::info!(
        "connected to {} as @{}",
        cli.url,
        client.bot_name()
    );

    // What a spawned permission broker needs to open its own connection.
    let broker_env: HashMap<String, String> = HashMap::from([
        ("PLATFORM_TYPE".to_string(), cli.platform.to_string()),
        ("PLATFORM_URL".to_string(), cli.url.clone()),
        ("PLATFORM_TOKEN".to_string(), cli.token.clone()),
        ("PLATFORM_CHANNEL_ID".to_string(), cli.channel.clone()),
    ]);

    let mut config = Config {
        agent_program: cli.agent,
        max_sessions: cli.max_sessions,
        idle_limit: Duration::from_secs(cli.idle_minutes * 60),
        skip_permissions: cli.skip_permissions,
        append_system_prompt: cli.append_system_prompt,
        chrome_automation: cli.chrome,
        debug: cli.debug,
        ..Config::default()
    };
    if let Some(broker) = cli.broker {
        config.broker_program = broker;
    }
    if let Some(state_file) = cli.state_file {
        config.state_file = state_file;
    }
    if let Some(working_dir) = cli.working_dir {
        anyhow::ensure!(
            working_dir.is_dir(),
            "--working-dir {} is not a directory",
            working_dir.display()
        );
        config.default_working_dir = working_dir;
    }

    let manager = SessionManager::new(config, vec![PlatformRuntime { client, broker_env }]).await;
    let shutdown = notify_on_sigint();
    manager.run(shutdown).await?;
    Ok(())
}
