// SPDX-License-Identifier: MIT OR Apache-2.0
//! Worker identity.
//!
//! The uuid is a pure function of the host's MAC node id and the invoking
//! user, so a reinstalled worker keeps its assignments and two users on one
//! host stay distinct. It is derived once at startup and held for the
//! process lifetime.

use tracing::warn;
use uuid::Uuid;

/// Derive the worker uuid from (MAC node id, username).
pub fn worker_uuid() -> Uuid {
    let name = format!("{}:{}", node_id(), username());
    Uuid::new_v5(&Uuid::NAMESPACE_OID, name.as_bytes())
}

fn node_id() -> String {
    match mac_address::get_mac_address() {
        Ok(Some(mac)) => mac.to_string(),
        other => {
            if let Err(err) = other {
                warn!(target: "flc.worker", error = %err, "MAC lookup failed, falling back to hostname");
            } else {
                warn!(target: "flc.worker", "no MAC address available, falling back to hostname");
            }
            nix::unistd::gethostname()
                .map(|h| h.to_string_lossy().into_owned())
                .unwrap_or_else(|_| "localhost".to_string())
        }
    }
}

fn username() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("LOGNAME"))
        .unwrap_or_else(|_| "unknown".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uuid_is_stable_across_calls() {
        assert_eq!(worker_uuid(), worker_uuid());
    }

    #[test]
    fn uuid_is_a_v5_derivation() {
        assert_eq!(worker_uuid().get_version_num(), 5);
    }
}
