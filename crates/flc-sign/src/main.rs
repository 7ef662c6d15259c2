#![deny(unsafe_code)]
use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// Sign and verify check artifacts.
///
/// Key material is plain openssl output, e.g.
/// `openssl req -x509 -newkey rsa:2048 -keyout private.key -out public.cert -days 365`.
#[derive(Parser, Debug)]
#[command(name = "flc-signer", version, about = "Fleetcheck artifact signer")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Sign an artifact, writing the detached signature to `<file>.sig`.
    Sign {
        /// Artifact to sign.
        file: PathBuf,
        /// PEM RSA private key.
        key: PathBuf,
    },
    /// Verify an artifact against its `<file>.sig` companion.
    Verify {
        /// Artifact to verify.
        file: PathBuf,
        /// PEM certificate (or bare public key).
        cert: PathBuf,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("flc=info")))
        .init();

    let args = Args::parse();

    match args.command {
        Command::Sign { file, key } => {
            let sig_path = flc_sign::sign_file(&file, &key)
                .with_context(|| format!("sign {}", file.display()))?;
            println!("wrote {}", sig_path.display());
        }
        Command::Verify { file, cert } => {
            if flc_sign::verify_file(&file, &cert) {
                println!("signature verified");
            } else {
                bail!("signature verification failed for {}", file.display());
            }
        }
    }

    Ok(())
}
