//! Stratum pool server binary

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use stratum_pool::error::Result;
use stratum_pool::stratum::server::{AuthorizeFn, AuthorizeOutcome};
use stratum_pool::{Pool, PoolConfig};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "stratum-pool", version, about = "Stratum mining pool server")]
struct Args {
    /// Path to the TOML configuration file
    #[arg(short, long, default_value = "pool.toml")]
    config: PathBuf,

    /// Log level filter (e.g. info, debug, stratum_pool=trace)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Log format: text or json
    #[arg(long, default_value = "text")]
    log_format: String,
}

fn init_logging(level: &str, format: &str) {
    let env_filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));

    match format {
        "json" => {
            tracing_subscriber::fmt()
                .json()
                .with_env_filter(env_filter)
                .with_target(false)
                .init();
        }
        _ => {
            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .init();
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args.log_level, &args.log_format);

    let config = PoolConfig::from_file(&args.config)?;
    info!(
        "starting stratum-pool {} for {} [{}]",
        stratum_pool::VERSION,
        config.coin.name,
        config.coin.symbol
    );

    // workers are identified by name only; any credentials are accepted
    let authorize_fn: AuthorizeFn = Arc::new(|ip, port, worker, _password| {
        Box::pin(async move {
            info!("authorized worker {} from {} on port {}", worker, ip, port);
            AuthorizeOutcome::accept()
        })
    });

    let pool = Arc::new(Pool::new(config, authorize_fn)?);
    let runner = pool.clone();
    tokio::select! {
        result = async move { runner.start().await } => {
            if let Err(e) = &result {
                error!("pool terminated: {}", e);
            }
            result
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutting down");
            Ok(())
        }
    }
}
