// SPDX-License-Identifier: MIT OR Apache-2.0
//! Per-fire check lifecycle.
//!
//! Every fire re-establishes the artifact invariant before anything runs:
//! the local bytes must hash to the descriptor's serve-time hash AND the
//! detached signature must verify against the configured certificate. Only
//! then is the script executed, argv-style, without a shell.

use flc_core::{TestDescriptor, sha256_hex};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Delay between execution attempts of a failing check.
pub const RETRY_DELAY: Duration = Duration::from_secs(3);

/// Shared per-worker context a fire executes against.
#[derive(Clone)]
pub struct CheckContext {
    /// Artifact cache directory, shared by all fires on the host.
    pub scripts_dir: PathBuf,
    /// Certificate the artifact signatures must verify against.
    pub cert_path: PathBuf,
    /// HTTP client used for artifact downloads.
    pub client: reqwest::Client,
}

/// Errors from one fire of a check.
#[derive(Debug, Error)]
pub enum CheckError {
    /// The artifact or its signature could not be fetched.
    #[error("download failed from {url}: {reason}")]
    DownloadFailed {
        /// URL that was requested.
        url: String,
        /// Failure detail.
        reason: String,
    },

    /// The artifact's signature does not verify; the check is unsafe and
    /// was not executed.
    #[error("signature verification failed for {artifact}")]
    SignatureInvalid {
        /// Local artifact path.
        artifact: String,
    },

    /// The on-disk bytes do not hash to the descriptor's hash even after a
    /// refresh; the descriptor is stale and nothing was executed.
    #[error("artifact {artifact} does not match the served hash")]
    HashMismatch {
        /// Local artifact path.
        artifact: String,
    },

    /// The descriptor carries no controller URL to download from.
    #[error("no controller url on descriptor for {name}")]
    MissingUrl {
        /// Test name.
        name: String,
    },

    /// Filesystem trouble in the artifact cache.
    #[error("io error on {path}: {source}")]
    Io {
        /// Path involved.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The check process could not be spawned.
    #[error("failed to spawn check {name}: {source}")]
    Spawn {
        /// Test name.
        name: String,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// Every attempt exited non-zero.
    #[error("check {name} failed after {retries} attempts: stdout={stdout:?} stderr={stderr:?}")]
    CheckFailed {
        /// Test name.
        name: String,
        /// Attempts made.
        retries: u32,
        /// Last attempt's stdout, lossily decoded.
        stdout: String,
        /// Last attempt's stderr, lossily decoded.
        stderr: String,
    },
}

/// Run one fire of `descriptor`: refresh the artifact if needed, verify,
/// execute with retries, and return the raw stdout bytes.
pub async fn run_check(
    descriptor: &TestDescriptor,
    ctx: &CheckContext,
) -> Result<Vec<u8>, CheckError> {
    tokio::fs::create_dir_all(&ctx.scripts_dir)
        .await
        .map_err(|source| CheckError::Io {
            path: ctx.scripts_dir.clone(),
            source,
        })?;

    let artifact = ctx.scripts_dir.join(&descriptor.check);

    let local_hash = match tokio::fs::read(&artifact).await {
        Ok(bytes) => Some(sha256_hex(&bytes)),
        Err(_) => None,
    };

    let hash_matches = local_hash.as_deref() == descriptor.hash.as_deref();
    let signed = flc_sign::verify_file(&artifact, &ctx.cert_path);

    if !hash_matches || !signed {
        if !hash_matches {
            info!(
                target: "flc.check",
                check = %descriptor.check,
                local = local_hash.as_deref().unwrap_or("absent"),
                remote = descriptor.hash.as_deref().unwrap_or("absent"),
                "artifact hash differs, refreshing"
            );
        } else {
            info!(target: "flc.check", check = %descriptor.check, "artifact signature stale, refreshing");
        }
        download_artifact(descriptor, ctx, &artifact).await?;
    }

    if !flc_sign::verify_file(&artifact, &ctx.cert_path) {
        warn!(target: "flc.check", check = %descriptor.check, "unsafe artifact, refusing to execute");
        return Err(CheckError::SignatureInvalid {
            artifact: artifact.display().to_string(),
        });
    }

    // Nothing runs unless the bytes on disk hash to the served hash; a
    // mismatch after a refresh means the descriptor is stale and the next
    // config pull carries the current hash.
    if let Some(expected) = descriptor.hash.as_deref() {
        let bytes = tokio::fs::read(&artifact).await.map_err(|source| CheckError::Io {
            path: artifact.clone(),
            source,
        })?;
        if sha256_hex(&bytes) != expected {
            warn!(target: "flc.check", check = %descriptor.check, "artifact hash still differs after refresh");
            return Err(CheckError::HashMismatch {
                artifact: artifact.display().to_string(),
            });
        }
    }

    execute(descriptor, &artifact).await
}

// ---------------------------------------------------------------------------
// Download
// ---------------------------------------------------------------------------

async fn download_artifact(
    descriptor: &TestDescriptor,
    ctx: &CheckContext,
    artifact: &Path,
) -> Result<(), CheckError> {
    let base = descriptor.url.as_deref().ok_or_else(|| CheckError::MissingUrl {
        name: descriptor.name.clone(),
    })?;
    let url = format!("{base}/checks/{}", descriptor.check);
    let sig_url = format!("{url}.sig");

    let body = fetch(ctx, &url).await?;
    let sig_body = fetch(ctx, &sig_url).await?;

    write_atomic(artifact, &body)?;
    write_atomic(&flc_sign::sig_path_for(artifact), &sig_body)?;

    let mut perms = std::fs::metadata(artifact)
        .map_err(|source| CheckError::Io {
            path: artifact.to_path_buf(),
            source,
        })?
        .permissions();
    perms.set_mode(0o700);
    std::fs::set_permissions(artifact, perms).map_err(|source| CheckError::Io {
        path: artifact.to_path_buf(),
        source,
    })?;

    info!(target: "flc.check", check = %descriptor.check, url = %url, "artifact downloaded");
    Ok(())
}

async fn fetch(ctx: &CheckContext, url: &str) -> Result<Vec<u8>, CheckError> {
    let failed = |reason: String| CheckError::DownloadFailed {
        url: url.to_string(),
        reason,
    };
    let resp = ctx
        .client
        .get(url)
        .send()
        .await
        .map_err(|e| failed(e.to_string()))?;
    if !resp.status().is_success() {
        return Err(failed(format!("status {}", resp.status())));
    }
    Ok(resp.bytes().await.map_err(|e| failed(e.to_string()))?.to_vec())
}

/// Write via a sibling temp file and rename, so concurrent fires touching
/// the same artifact name never observe torn bytes.
fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), CheckError> {
    let io_err = |p: &Path, source: std::io::Error| CheckError::Io {
        path: p.to_path_buf(),
        source,
    };

    let nanos = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos();
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "artifact".to_string());
    let tmp = path.with_file_name(format!(".{file_name}.{}.{nanos}.tmp", std::process::id()));

    std::fs::write(&tmp, bytes).map_err(|e| io_err(&tmp, e))?;
    std::fs::rename(&tmp, path).map_err(|e| io_err(path, e))?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Execution
// ---------------------------------------------------------------------------

async fn execute(descriptor: &TestDescriptor, artifact: &Path) -> Result<Vec<u8>, CheckError> {
    let attempts = descriptor.retries.max(1);
    let tail = descriptor.argv_tail();
    let mut last: Option<std::process::Output> = None;

    for attempt in 1..=attempts {
        debug!(target: "flc.check", check = %descriptor.name, attempt, "starting check");
        let output = tokio::process::Command::new(artifact)
            .args(&tail)
            .output()
            .await
            .map_err(|source| CheckError::Spawn {
                name: descriptor.name.clone(),
                source,
            })?;

        if output.status.success() {
            return Ok(output.stdout);
        }

        debug!(
            target: "flc.check",
            check = %descriptor.name,
            attempt,
            code = output.status.code().unwrap_or(-1),
            "attempt failed"
        );
        last = Some(output);
        if attempt < attempts {
            tokio::time::sleep(RETRY_DELAY).await;
        }
    }

    let (stdout, stderr) = last
        .map(|o| {
            (
                String::from_utf8_lossy(&o.stdout).into_owned(),
                String::from_utf8_lossy(&o.stderr).into_owned(),
            )
        })
        .unwrap_or_default();

    warn!(
        target: "flc.check",
        check = %descriptor.name,
        retries = attempts,
        "check failed after all attempts"
    );
    Err(CheckError::CheckFailed {
        name: descriptor.name.clone(),
        retries: attempts,
        stdout,
        stderr,
    })
}
