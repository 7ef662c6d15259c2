#![deny(unsafe_code)]
use anyhow::{Context, Result};
use clap::Parser;
use flc_controller::{AppState, InfluxSink, build_app};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "flc-controller", version, about = "Fleetcheck controller")]
struct Args {
    /// Bind address.
    #[arg(long, default_value = "127.0.0.1:8080")]
    bind: String,

    /// Fleet configuration file, re-read on every request.
    #[arg(long, default_value = "config.json")]
    config: PathBuf,

    /// Directory serving check artifacts and their .sig companions.
    #[arg(long, default_value = "checks")]
    checks_dir: PathBuf,

    /// Optional JSON Schema to validate the configuration against at boot.
    #[arg(long)]
    schema: Option<PathBuf>,

    /// Enable debug logging.
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = if args.debug {
        EnvFilter::new("flc=debug")
    } else {
        EnvFilter::new("flc=info")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    if let Some(schema) = &args.schema {
        flc_config::validate_file(&args.config, schema)
            .with_context(|| format!("validate {} against {}", args.config.display(), schema.display()))?;
        info!(target: "flc.controller", schema = %schema.display(), "configuration validated");
    }

    let sink = Arc::new(InfluxSink::from_env());
    info!(target: "flc.controller", backend = sink.write_url(), "result sink configured");

    let state = Arc::new(AppState {
        config_path: args.config,
        checks_dir: args.checks_dir,
        sink,
    });
    let app = build_app(state);

    let listener = tokio::net::TcpListener::bind(&args.bind)
        .await
        .with_context(|| format!("bind {}", args.bind))?;
    info!(target: "flc.controller", bind = %args.bind, "flc-controller listening");

    axum::serve(listener, app).await.context("serve")
}
