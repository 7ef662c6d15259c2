#![deny(unsafe_code)]
use anyhow::{Context, Result, bail};
use clap::Parser;
use flc_worker::{Worker, WorkerConfig, worker_uuid};
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "flc-worker", version, about = "Fleetcheck worker")]
struct Args {
    /// Controller base URL.
    #[arg(short = 'u', long = "url")]
    url: Option<String>,

    /// Enable debug logging.
    #[arg(short = 'd', long)]
    debug: bool,

    /// Print the worker UUID and exit.
    #[arg(short = 'U', long = "uuid")]
    print_uuid: bool,

    /// Pidfile path.
    #[arg(short = 'p', long, default_value = "/tmp/worker.pid")]
    pidfile: PathBuf,

    /// Stay in the foreground (the only supported mode; daemonize externally).
    #[arg(short = 'f', long)]
    foreground: bool,

    /// Send SIGTERM to the pid in the pidfile and exit.
    #[arg(short = 'z', long = "terminate")]
    terminate: bool,

    /// Artifact cache directory.
    #[arg(long, default_value = "/tmp/scripts")]
    scripts_dir: PathBuf,

    /// Certificate artifact signatures must verify against.
    #[arg(long, default_value = "certs/public.cert")]
    cert: PathBuf,

    /// Scheduler singleton lockfile.
    #[arg(long, default_value = "/tmp/scheduler.lock")]
    lockfile: PathBuf,

    /// Seconds between config pulls.
    #[arg(long, default_value_t = 30)]
    callhome_interval: u64,
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

    if args.terminate {
        return terminate(&args.pidfile);
    }

    if args.print_uuid {
        println!("{}", worker_uuid());
        return Ok(());
    }

    let Some(url) = args.url else {
        bail!("-u <base_url> is required");
    };
    if !url.contains("http") {
        bail!("controller url must contain \"http\": {url}");
    }

    // Refuse to start without verifiable key material; every fire depends
    // on it.
    flc_sign::load_public_key(&args.cert)
        .with_context(|| format!("load certificate {}", args.cert.display()))?;

    std::fs::write(&args.pidfile, std::process::id().to_string())
        .with_context(|| format!("write pidfile {}", args.pidfile.display()))?;

    let mut config = WorkerConfig::new(url);
    config.scripts_dir = args.scripts_dir;
    config.cert_path = args.cert;
    config.lockfile = args.lockfile;
    config.callhome_interval = Duration::from_secs(args.callhome_interval);

    let mut worker = Worker::new(config);
    info!(target: "flc.worker", uuid = %worker.uuid(), "flc-worker starting");

    let result = tokio::select! {
        res = worker.run() => res.map_err(Into::into),
        _ = shutdown_signal() => {
            info!(target: "flc.worker", "shutdown signal received");
            Ok(())
        }
    };

    worker.stop();
    let _ = std::fs::remove_file(&args.pidfile);
    result
}

fn terminate(pidfile: &std::path::Path) -> Result<()> {
    let raw = std::fs::read_to_string(pidfile)
        .with_context(|| format!("read pidfile {}", pidfile.display()))?;
    let pid: i32 = raw.trim().parse().context("pidfile does not contain a pid")?;
    kill(Pid::from_raw(pid), Signal::SIGTERM).with_context(|| format!("signal pid {pid}"))?;
    info!(target: "flc.worker", pid, "sent SIGTERM");
    Ok(())
}

async fn shutdown_signal() {
    let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
    {
        Ok(stream) => stream,
        Err(_) => {
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}
