// SPDX-License-Identifier: MIT OR Apache-2.0
//! Detached RSA-SHA256 signatures over check artifacts.
//!
//! Signatures cover the raw, unmodified artifact bytes and travel as a
//! sibling `<artifact>.sig` file containing the lowercase hex encoding of a
//! PKCS#1 v1.5 RSA-SHA256 signature. There is no embedded signature header;
//! the legacy `--- SIGNATURE START ---` framing is unsupported and a file
//! carrying it simply fails verification.
//!
//! [`verify`] and [`verify_file`] never return an error: key material that
//! cannot be read and signatures that do not match both come back as `false`,
//! with the distinction preserved in the log.
#![deny(unsafe_code)]
#![warn(missing_docs)]

use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::pkcs1v15::{Signature, SigningKey, VerifyingKey};
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey};
use rsa::signature::{SignatureEncoding, Signer, Verifier};
use rsa::{RsaPrivateKey, RsaPublicKey};
use sha2::Sha256;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

/// Errors from signing and strict verification.
#[derive(Debug, Error)]
pub enum SignError {
    /// Key or certificate material could not be read or parsed.
    #[error("unreadable key material at {path}: {reason}")]
    KeyMaterialUnreadable {
        /// Path that was requested.
        path: PathBuf,
        /// What went wrong reading or parsing it.
        reason: String,
    },

    /// The signature is not valid hex or not a well-formed signature blob.
    #[error("malformed signature: {0}")]
    Malformed(String),

    /// The signature does not match the data.
    #[error("signature does not match data")]
    SignatureInvalid,
}

// ---------------------------------------------------------------------------
// Key material loading
// ---------------------------------------------------------------------------

fn unreadable(path: &Path, reason: impl ToString) -> SignError {
    SignError::KeyMaterialUnreadable {
        path: path.to_path_buf(),
        reason: reason.to_string(),
    }
}

/// Load an RSA private key from a PEM file.
///
/// Accepts PKCS#8 (`BEGIN PRIVATE KEY`, what `openssl req -newkey rsa:2048`
/// emits) and PKCS#1 (`BEGIN RSA PRIVATE KEY`).
pub fn load_private_key(path: &Path) -> Result<RsaPrivateKey, SignError> {
    let pem = std::fs::read_to_string(path).map_err(|e| unreadable(path, e))?;
    if pem.contains("BEGIN RSA PRIVATE KEY") {
        RsaPrivateKey::from_pkcs1_pem(&pem).map_err(|e| unreadable(path, e))
    } else {
        RsaPrivateKey::from_pkcs8_pem(&pem).map_err(|e| unreadable(path, e))
    }
}

/// Load an RSA public key from a PEM file.
///
/// Accepts an X.509 certificate (`BEGIN CERTIFICATE`, the distributed
/// `public.cert`) or a bare SPKI public key (`BEGIN PUBLIC KEY`).
pub fn load_public_key(path: &Path) -> Result<RsaPublicKey, SignError> {
    let text = std::fs::read_to_string(path).map_err(|e| unreadable(path, e))?;

    if text.contains("BEGIN CERTIFICATE") {
        let (_, parsed) = x509_parser::pem::parse_x509_pem(text.as_bytes())
            .map_err(|e| unreadable(path, e))?;
        let cert = parsed.parse_x509().map_err(|e| unreadable(path, e))?;
        return RsaPublicKey::from_public_key_der(cert.public_key().raw)
            .map_err(|e| unreadable(path, e));
    }

    RsaPublicKey::from_public_key_pem(&text).map_err(|e| unreadable(path, e))
}

// ---------------------------------------------------------------------------
// Sign / verify over byte strings
// ---------------------------------------------------------------------------

/// Sign `data` with the PEM private key at `key_path`, returning the
/// signature as lowercase hex.
pub fn sign(data: &[u8], key_path: &Path) -> Result<String, SignError> {
    let key = load_private_key(key_path)?;
    let signing_key = SigningKey::<Sha256>::new(key);
    let signature = signing_key.sign(data);
    Ok(hex::encode(signature.to_bytes()))
}

/// Strictly verify a hex signature over `data` against the certificate or
/// public key at `cert_path`.
///
/// Distinguishes unreadable key material, malformed signatures, and plain
/// mismatches. Most callers want [`verify`] instead.
pub fn verify_strict(data: &[u8], sig_hex: &str, cert_path: &Path) -> Result<(), SignError> {
    let key = load_public_key(cert_path)?;
    let raw = hex::decode(sig_hex.trim()).map_err(|e| SignError::Malformed(e.to_string()))?;
    let signature =
        Signature::try_from(raw.as_slice()).map_err(|e| SignError::Malformed(e.to_string()))?;
    let verifying_key = VerifyingKey::<Sha256>::new(key);
    verifying_key
        .verify(data, &signature)
        .map_err(|_| SignError::SignatureInvalid)
}

/// Verify a hex signature over `data` against the certificate at `cert_path`.
///
/// Never errors: any failure — mismatch, malformed signature, unreadable key
/// material — returns `false` and is logged.
pub fn verify(data: &[u8], sig_hex: &str, cert_path: &Path) -> bool {
    match verify_strict(data, sig_hex, cert_path) {
        Ok(()) => true,
        Err(err) => {
            warn!(target: "flc.sign", error = %err, cert = %cert_path.display(), "verification failed");
            false
        }
    }
}

// ---------------------------------------------------------------------------
// File helpers
// ---------------------------------------------------------------------------

/// Sign the file at `path` and write the hex signature to `<path>.sig`.
///
/// Returns the signature file path.
pub fn sign_file(path: &Path, key_path: &Path) -> Result<PathBuf, SignError> {
    let data = std::fs::read(path).map_err(|e| unreadable(path, e))?;
    let sig_hex = sign(&data, key_path)?;
    let sig_path = sig_path_for(path);
    std::fs::write(&sig_path, &sig_hex).map_err(|e| unreadable(&sig_path, e))?;
    debug!(target: "flc.sign", artifact = %path.display(), sig = %sig_path.display(), "signed");
    Ok(sig_path)
}

/// Verify the file at `path` against its `<path>.sig` companion.
///
/// A missing artifact or missing signature file verifies as `false`.
pub fn verify_file(path: &Path, cert_path: &Path) -> bool {
    let data = match std::fs::read(path) {
        Ok(d) => d,
        Err(err) => {
            debug!(target: "flc.sign", artifact = %path.display(), error = %err, "artifact unreadable");
            return false;
        }
    };
    let sig_path = sig_path_for(path);
    let sig_hex = match std::fs::read_to_string(&sig_path) {
        Ok(s) => s,
        Err(err) => {
            debug!(target: "flc.sign", sig = %sig_path.display(), error = %err, "signature unreadable");
            return false;
        }
    };
    verify(&data, &sig_hex, cert_path)
}

/// `<path>.sig` for a given artifact path.
pub fn sig_path_for(path: &Path) -> PathBuf {
    let mut os = path.as_os_str().to_os_string();
    os.push(".sig");
    PathBuf::from(os)
}
