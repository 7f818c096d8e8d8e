use std::time::Duration;

use clap::Parser;
use mcp_session_bridge::config::BridgeConfig;
use mcp_session_bridge::launch::LaunchSpec;
use mcp_session_bridge::{run_server, ServerConfig};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "mcp-session-bridge")]
#[command(about = "HTTP + SSE bridge to per-session stdio MCP workers", version)]
struct Cli {
    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    #[arg(long, env = "PORT", default_value_t = 10000)]
    port: u16,

    #[arg(long)]
    request_timeout_ms: Option<u64>,

    #[arg(long)]
    initialization_timeout_ms: Option<u64>,

    #[arg(long)]
    session_idle_timeout_ms: Option<u64>,

    #[arg(long)]
    session_max_lifetime_ms: Option<u64>,

    #[arg(long)]
    keepalive_interval_ms: Option<u64>,

    #[arg(long)]
    session_check_interval_ms: Option<u64>,

    /// Worker command, e.g. `-- node build/index.js`.
    #[arg(last = true, required = true)]
    command: Vec<String>,
}

impl Cli {
    fn bridge_config(&self) -> BridgeConfig {
        let mut config = BridgeConfig::from_env();
        let overrides = [
            (self.request_timeout_ms, &mut config.request_timeout),
            (self.initialization_timeout_ms, &mut config.initialization_timeout),
            (self.session_idle_timeout_ms, &mut config.session_idle_timeout),
            (self.session_max_lifetime_ms, &mut config.session_max_lifetime),
            (self.keepalive_interval_ms, &mut config.keepalive_interval),
            (self.session_check_interval_ms, &mut config.session_check_interval),
        ];
        for (value, slot) in overrides {
            if let Some(ms) = value.filter(|ms| *ms > 0) {
                *slot = Duration::from_millis(ms);
            }
        }
        config
    }
}

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        tracing::error!(error = %err, "mcp-session-bridge failed");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_logfmt::builder()
                .layer()
                .with_writer(std::io::stderr),
        )
        .init();

    let cli = Cli::parse();
    let launch = LaunchSpec::from_command_line(&cli.command)?;
    run_server(ServerConfig {
        bridge: cli.bridge_config(),
        host: cli.host,
        port: cli.port,
        launch,
    })
    .await
}
