mod instance_commands;
mod session_commands;

use std::path::PathBuf;

use {
    clap::{Parser, Subcommand},
    tracing::info,
    tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt},
};

#[derive(Parser)]
#[command(name = "wagate", about = "wagate: multi-tenant messaging gateway")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Output logs as JSON instead of human-readable.
    #[arg(long, global = true, default_value_t = false)]
    json_logs: bool,

    /// Directory holding wagate.toml (overrides discovery).
    #[arg(long, global = true, env = "WAGATE_CONFIG_DIR")]
    config_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the gateway server.
    Gateway {
        /// Overrides `server.bind`.
        #[arg(long)]
        bind: Option<String>,
        /// Overrides `server.port`.
        #[arg(long)]
        port: Option<u16>,
    },
    /// Stored session credentials.
    Sessions {
        #[command(subcommand)]
        action: session_commands::SessionAction,
    },
    /// Tenant instance records.
    Instances {
        #[command(subcommand)]
        action: instance_commands::InstanceAction,
    },
}

fn init_telemetry(cli: &Cli) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));

    if cli.json_logs {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_target(true).with_thread_ids(false))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_thread_ids(false)
                    .with_ansi(true),
            )
            .init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_telemetry(&cli);

    if let Some(dir) = cli.config_dir.clone() {
        wagate_config::set_config_dir(dir);
    }
    let mut config = wagate_config::discover_and_load();

    info!(version = env!("CARGO_PKG_VERSION"), "wagate starting");

    match cli.command {
        Commands::Gateway { bind, port } => {
            if let Some(bind) = bind {
                config.server.bind = bind;
            }
            if let Some(port) = port {
                config.server.port = port;
            }
            wagate_gateway::start_gateway(config).await
        },
        Commands::Sessions { action } => session_commands::handle_sessions(action, &config).await,
        Commands::Instances { action } => {
            instance_commands::handle_instances(action, &config).await
        },
    }
}
