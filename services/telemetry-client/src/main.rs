use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use telemetry_client::config::{DEFAULT_CONFIG_PATH, load_config_from_path};
use telemetry_client::{
    PhaseKind, StaticBase, StaticToken, TelemetryClient, TokenFile, TokenProvider,
};
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(version, about = "Streams live telemetry and prints each update as a JSON line")]
struct Args {
    /// Path to the client TOML config
    #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "telemetry-client starting");

    let args = Args::parse();
    let config = load_config_from_path(&args.config).unwrap_or_else(|e| {
        eprintln!("FATAL: {e}");
        std::process::exit(1);
    });

    let tokens: Arc<dyn TokenProvider> = match &config.auth.token_file {
        Some(path) => Arc::new(TokenFile(path.clone())),
        None => Arc::new(StaticToken(None)),
    };
    let base = Arc::new(StaticBase(config.server.base_url.clone()));

    let client = TelemetryClient::spawn(config, tokens, base);
    let mut values = client.subscribe();
    let mut status = client.subscribe_status();
    client.enable();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown requested");
                client.shutdown().await;
                break;
            }
            changed = values.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = values.borrow_and_update().clone();
                if let Some(snapshot) = snapshot {
                    match serde_json::to_string(&*snapshot) {
                        Ok(line) => println!("{line}"),
                        Err(e) => error!(error = %e, "could not encode snapshot"),
                    }
                }
            }
            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = status.borrow_and_update().clone();
                if current.phase == PhaseKind::PermanentlyFailed {
                    error!(
                        reason = current.last_error.as_deref().unwrap_or("unknown"),
                        "telemetry stream stopped"
                    );
                    std::process::exit(2);
                }
            }
        }
    }
}
