// SPDX-License-Identifier: MIT OR Apache-2.0
//! Controller-side fleet configuration.
//!
//! The configuration file maps group names to client UUIDs (with a `*`
//! wildcard), test keys to [`TestDescriptor`]s, and client UUIDs to optional
//! aliases. Resolution is two-step: a uuid resolves to its groups, and a test
//! is assigned to the uuid iff the test's groups overlap with the uuid's.
//!
//! The controller re-reads this file on every request; nothing here caches.
#![deny(unsafe_code)]
#![warn(missing_docs)]

use flc_core::{TestDescriptor, sha256_hex};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use thiserror::Error;
use tracing::warn;

/// Wildcard group member matching every client uuid.
pub const WILDCARD: &str = "*";

/// Errors from configuration loading and validation.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file could not be read or parsed.
    #[error("config unreadable at {path}: {reason}")]
    Unreadable {
        /// Path that was requested.
        path: String,
        /// Read or parse failure detail.
        reason: String,
    },

    /// The configuration does not conform to the JSON Schema.
    #[error("config schema violation: {reasons:?}")]
    SchemaViolation {
        /// Individual validation failure messages.
        reasons: Vec<String>,
    },
}

// ---------------------------------------------------------------------------
// Model
// ---------------------------------------------------------------------------

/// Optional per-client record.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ClientRecord {
    /// Human label, used as an additional tag when storing results.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
}

/// The controller's configuration file.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct FleetConfig {
    /// Group name → member client UUIDs, possibly containing [`WILDCARD`].
    #[serde(default)]
    pub groups: BTreeMap<String, BTreeSet<String>>,
    /// Test key → descriptor. Descriptors in the file carry no `hash`; it is
    /// computed at serving time.
    #[serde(default)]
    pub tests: BTreeMap<String, TestDescriptor>,
    /// Client UUID → optional record.
    #[serde(default)]
    pub clients: BTreeMap<String, ClientRecord>,
}

impl FleetConfig {
    /// Load and parse the configuration file at `path`.
    pub fn load(path: &Path) -> Result<FleetConfig, ConfigError> {
        let unreadable = |reason: String| ConfigError::Unreadable {
            path: path.display().to_string(),
            reason,
        };
        let raw = std::fs::read_to_string(path).map_err(|e| unreadable(e.to_string()))?;
        serde_json::from_str(&raw).map_err(|e| unreadable(e.to_string()))
    }

    /// The groups `uuid` belongs to: every group that lists the uuid as a
    /// member or carries the wildcard.
    pub fn groups_for(&self, uuid: &str) -> Vec<String> {
        self.groups
            .iter()
            .filter(|(_, members)| members.contains(uuid) || members.contains(WILDCARD))
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// The tests assigned to `uuid`, with `hash` freshly computed over the
    /// artifact bytes under `checks_dir`.
    ///
    /// A test whose artifact cannot be read is omitted from the result and
    /// logged; the remaining assignments still serve.
    pub fn tests_for(&self, uuid: &str, checks_dir: &Path) -> Vec<TestDescriptor> {
        let memberships: BTreeSet<String> = self.groups_for(uuid).into_iter().collect();
        if memberships.is_empty() {
            return Vec::new();
        }

        let mut out = Vec::new();
        for test in self.tests.values() {
            if test.groups.is_disjoint(&memberships) {
                continue;
            }
            match hash_artifact(checks_dir, &test.check) {
                Ok(hash) => {
                    let mut assigned = test.clone();
                    assigned.hash = Some(hash);
                    out.push(assigned);
                }
                Err(err) => {
                    warn!(
                        target: "flc.config",
                        test = %test.name,
                        check = %test.check,
                        error = %err,
                        "artifact unreadable, omitting test from assignment"
                    );
                }
            }
        }
        out
    }

    /// The alias for `uuid` when defined and non-empty; the uuid otherwise.
    pub fn alias_for(&self, uuid: &str) -> String {
        self.clients
            .get(uuid)
            .and_then(|c| c.alias.as_deref())
            .filter(|alias| !alias.is_empty())
            .unwrap_or(uuid)
            .to_string()
    }
}

/// SHA-256 hex of `checks_dir/<check>`.
pub fn hash_artifact(checks_dir: &Path, check: &str) -> std::io::Result<String> {
    let bytes = std::fs::read(checks_dir.join(check))?;
    Ok(sha256_hex(&bytes))
}

// ---------------------------------------------------------------------------
// Schema validation
// ---------------------------------------------------------------------------

/// Validate a configuration document against a JSON Schema.
///
/// Used at controller boot when a schema path is supplied; every violation is
/// collected so the operator sees the full list at once.
pub fn validate_against_schema(
    config: &serde_json::Value,
    schema: &serde_json::Value,
) -> Result<(), ConfigError> {
    let validator =
        jsonschema::validator_for(schema).map_err(|e| ConfigError::SchemaViolation {
            reasons: vec![format!("schema itself is invalid: {e}")],
        })?;

    let reasons: Vec<String> = validator
        .iter_errors(config)
        .map(|err| format!("{}: {err}", err.instance_path))
        .collect();

    if reasons.is_empty() {
        Ok(())
    } else {
        Err(ConfigError::SchemaViolation { reasons })
    }
}

/// Read both files and validate the configuration against the schema.
pub fn validate_file(config_path: &Path, schema_path: &Path) -> Result<(), ConfigError> {
    let read = |p: &Path| -> Result<serde_json::Value, ConfigError> {
        let unreadable = |reason: String| ConfigError::Unreadable {
            path: p.display().to_string(),
            reason,
        };
        let raw = std::fs::read_to_string(p).map_err(|e| unreadable(e.to_string()))?;
        serde_json::from_str(&raw).map_err(|e| unreadable(e.to_string()))
    };
    validate_against_schema(&read(config_path)?, &read(schema_path)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn sample() -> FleetConfig {
        serde_json::from_value(serde_json::json!({
            "groups": {
                "admins": ["A", "B"],
                "all": ["*"]
            },
            "tests": {
                "t1": {
                    "name": "t1",
                    "check": "cpu",
                    "args": "",
                    "interval": 60,
                    "retries": 3,
                    "groups": ["admins"]
                },
                "t2": {
                    "name": "t2",
                    "check": "mem",
                    "args": "-v",
                    "interval": 30,
                    "retries": 1,
                    "groups": ["all"]
                }
            },
            "clients": {
                "A": { "alias": "alpha" },
                "D": { "alias": "" }
            }
        }))
        .unwrap()
    }

    fn checks_dir() -> tempfile::TempDir {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(tmp.path().join("cpu"), b"#!/bin/sh\necho 1\n").unwrap();
        fs::write(tmp.path().join("mem"), b"#!/bin/sh\necho 2\n").unwrap();
        tmp
    }

    // -----------------------------------------------------------------------
    // Group resolution
    // -----------------------------------------------------------------------

    #[test]
    fn member_uuid_resolves_to_its_groups_plus_wildcard() {
        let cfg = sample();
        assert_eq!(cfg.groups_for("A"), vec!["admins", "all"]);
    }

    #[test]
    fn unknown_uuid_resolves_to_wildcard_groups_only() {
        let cfg = sample();
        assert_eq!(cfg.groups_for("C"), vec!["all"]);
    }

    #[test]
    fn no_groups_without_wildcard() {
        let mut cfg = sample();
        cfg.groups.remove("all");
        assert!(cfg.groups_for("C").is_empty());
    }

    // -----------------------------------------------------------------------
    // Test assignment
    // -----------------------------------------------------------------------

    #[test]
    fn admin_uuid_gets_both_tests() {
        let cfg = sample();
        let dir = checks_dir();
        let tests = cfg.tests_for("A", dir.path());
        let names: Vec<&str> = tests.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["t1", "t2"]);
    }

    #[test]
    fn outsider_uuid_gets_wildcard_tests_only() {
        let cfg = sample();
        let dir = checks_dir();
        let tests = cfg.tests_for("C", dir.path());
        let names: Vec<&str> = tests.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["t2"]);
    }

    #[test]
    fn served_descriptors_carry_fresh_hashes() {
        let cfg = sample();
        let dir = checks_dir();
        let tests = cfg.tests_for("A", dir.path());
        let cpu = tests.iter().find(|t| t.check == "cpu").unwrap();
        assert_eq!(
            cpu.hash.as_deref().unwrap(),
            sha256_hex(b"#!/bin/sh\necho 1\n")
        );
    }

    #[test]
    fn hash_tracks_artifact_edits() {
        let cfg = sample();
        let dir = checks_dir();
        let before = cfg.tests_for("C", dir.path())[0].hash.clone();
        fs::write(dir.path().join("mem"), b"#!/bin/sh\necho 3\n").unwrap();
        let after = cfg.tests_for("C", dir.path())[0].hash.clone();
        assert_ne!(before, after);
    }

    #[test]
    fn unreadable_artifact_omits_test_but_serves_the_rest() {
        let cfg = sample();
        let dir = checks_dir();
        fs::remove_file(dir.path().join("cpu")).unwrap();
        let tests = cfg.tests_for("A", dir.path());
        let names: Vec<&str> = tests.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["t2"]);
    }

    // -----------------------------------------------------------------------
    // Alias resolution
    // -----------------------------------------------------------------------

    #[test]
    fn alias_returned_when_defined() {
        assert_eq!(sample().alias_for("A"), "alpha");
    }

    #[test]
    fn alias_falls_back_to_uuid_when_absent() {
        assert_eq!(sample().alias_for("B"), "B");
    }

    #[test]
    fn empty_alias_falls_back_to_uuid() {
        assert_eq!(sample().alias_for("D"), "D");
    }

    // -----------------------------------------------------------------------
    // Loading and schema validation
    // -----------------------------------------------------------------------

    #[test]
    fn load_reports_missing_file() {
        let err = FleetConfig::load(Path::new("/nonexistent/config.json")).unwrap_err();
        assert!(matches!(err, ConfigError::Unreadable { .. }));
    }

    #[test]
    fn load_reports_bad_json() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("config.json");
        fs::write(&path, "{not json").unwrap();
        let err = FleetConfig::load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Unreadable { .. }));
    }

    fn schema() -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "required": ["groups", "tests"],
            "properties": {
                "groups": { "type": "object" },
                "tests": { "type": "object" },
                "clients": { "type": "object" }
            }
        })
    }

    #[test]
    fn valid_config_passes_schema() {
        let cfg = serde_json::to_value(sample()).unwrap();
        validate_against_schema(&cfg, &schema()).unwrap();
    }

    #[test]
    fn schema_violations_are_collected() {
        let cfg = serde_json::json!({ "groups": {} });
        let err = validate_against_schema(&cfg, &schema()).unwrap_err();
        match err {
            ConfigError::SchemaViolation { reasons } => assert!(!reasons.is_empty()),
            other => panic!("unexpected error: {other}"),
        }
    }
}
