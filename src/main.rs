use clap::{Parser, Subcommand};
use quoteflow::api::{create_router, AppState};
use quoteflow::config::AppConfig;
use quoteflow::coordination::wait_for_os_signal;
use quoteflow::error::{QuoteflowError, Result};
use quoteflow::services::ServiceContext;
use tracing::{error, info};

mod main_runtime;

use main_runtime::{init_logging, init_logging_simple};

#[derive(Parser)]
#[command(name = "quoteflow")]
#[command(version = "0.1.0")]
#[command(about = "Market-data fan-out and paper order execution service", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Directory holding default.toml and per-environment overrides
    #[arg(short, long, default_value = "config", env = "QUOTEFLOW_CONFIG_DIR")]
    config: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the streaming and order API (default)
    Serve {
        /// Override api.bind
        #[arg(long)]
        bind: Option<String>,
    },
    /// Load and validate configuration, then exit
    CheckConfig,
}

fn load_config(dir: &str) -> Result<AppConfig> {
    let config = AppConfig::load_from(dir)?;
    config
        .validate()
        .map_err(|errors| QuoteflowError::InvalidConfig(errors.join("; ")))?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Serve { bind: None }) {
        Commands::CheckConfig => {
            init_logging_simple();
            let config = load_config(&cli.config)?;
            println!(
                "configuration ok: upstream={} cache={:?} broker={:?} mode={:?}",
                config.upstream.ws_url,
                config.cache.backend,
                config.trading.broker,
                config.trading.mode
            );
        }
        Commands::Serve { bind } => {
            let mut config = load_config(&cli.config)?;
            if let Some(bind) = bind {
                config.api.bind = bind;
            }
            init_logging(&config.logging);
            run_server(config).await?;
        }
    }

    Ok(())
}

async fn run_server(config: AppConfig) -> Result<()> {
    let bind = config.api.bind.clone();
    let ctx = ServiceContext::from_config(config).await?;
    ctx.start()?;

    let app = create_router(AppState::new(ctx.clone()));
    let listener = tokio::net::TcpListener::bind(&bind).await?;
    info!("Quoteflow listening on {}", bind);

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(async {
            wait_for_os_signal().await;
            info!("Shutdown signal received");
        })
        .await;
    if let Err(e) = &served {
        error!("HTTP server error: {}", e);
    }

    ctx.shutdown().await;
    served.map_err(QuoteflowError::Io)
}
