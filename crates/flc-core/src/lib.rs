// SPDX-License-Identifier: MIT OR Apache-2.0
//! Shared data model for the Fleetcheck fleet.
//!
//! Both halves of the system speak in the types defined here: the controller
//! serves [`TestDescriptor`]s to workers, workers post [`ResultRecord`]s back,
//! and the job ids used as scheduler keys and measurement names go through
//! [`sanitize_job_id`] on both sides.
#![deny(unsafe_code)]
#![warn(missing_docs)]

use serde::de::{self, Deserializer};
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};

// ---------------------------------------------------------------------------
// Test descriptor
// ---------------------------------------------------------------------------

/// Server-authoritative description of one test, shipped to a worker per
/// config request.
///
/// `hash` is computed by the controller at serving time over the artifact
/// bytes; `url` is injected by the worker at schedule time and never appears
/// on the wire from the controller. Both are therefore optional in the
/// serialized form.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TestDescriptor {
    /// Test name, unique within a configuration. Sanitized, it becomes the
    /// scheduler job id and the measurement name.
    pub name: String,
    /// Artifact filename under the controller's checks directory. No path
    /// components.
    pub check: String,
    /// Space-separated argv tail appended after the artifact path.
    #[serde(default)]
    pub args: String,
    /// Seconds between fires.
    pub interval: u64,
    /// Attempts on non-zero exit before the fire counts as failed.
    pub retries: u32,
    /// Groups this test is assigned to.
    pub groups: BTreeSet<String>,
    /// SHA-256 hex of the artifact bytes, computed at serving time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
    /// Base URL of the worker's controller, injected at schedule time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

impl TestDescriptor {
    /// Copy of `self` with the transient `url` field stripped.
    ///
    /// Descriptor lists are compared structurally on every config pull; `url`
    /// is worker-local state and must not participate in that comparison.
    pub fn without_url(&self) -> TestDescriptor {
        TestDescriptor {
            url: None,
            ..self.clone()
        }
    }

    /// The sanitized job id this descriptor schedules under.
    pub fn job_id(&self) -> String {
        sanitize_job_id(&self.name)
    }

    /// Split the `args` string into individual argv entries.
    ///
    /// Whitespace-splitting, no shell involved.
    pub fn argv_tail(&self) -> Vec<String> {
        self.args.split_whitespace().map(str::to_string).collect()
    }
}

// ---------------------------------------------------------------------------
// Result records
// ---------------------------------------------------------------------------

/// One observation posted from a worker to the controller.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ResultRecord {
    /// Measurement name: the sanitized job id.
    pub measurement: String,
    /// Free-form tags. The controller annotates `uuid` and `alias` before
    /// relaying to the time-series backend.
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    /// Observation fields.
    pub fields: ResultFields,
}

/// Fields of a [`ResultRecord`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ResultFields {
    /// Whether the fire succeeded.
    pub success: bool,
    /// The parsed check output. Absent on failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<ResultValue>,
}

/// A check observation: numeric when the stdout parses as a float, the
/// empty marker when stdout was empty, a string otherwise.
#[derive(Clone, Debug, PartialEq)]
pub enum ResultValue {
    /// Numeric observation.
    Num(f64),
    /// Textual observation.
    Str(String),
    /// The check exited 0 with empty stdout.
    Empty,
}

impl ResultValue {
    /// Parse raw check stdout into a value.
    ///
    /// Decoding is lossy, trailing whitespace is stripped, and a successful
    /// `f64` parse wins over the string form.
    pub fn parse(stdout: &[u8]) -> ResultValue {
        let text = String::from_utf8_lossy(stdout);
        let trimmed = text.trim_end();
        if trimmed.is_empty() {
            return ResultValue::Empty;
        }
        match trimmed.parse::<f64>() {
            Ok(n) => ResultValue::Num(n),
            Err(_) => ResultValue::Str(trimmed.to_string()),
        }
    }
}

impl Serialize for ResultValue {
    fn serialize<S: Serializer>(&self, ser: S) -> Result<S::Ok, S::Error> {
        match self {
            ResultValue::Num(n) => ser.serialize_f64(*n),
            ResultValue::Str(s) => ser.serialize_str(s),
            ResultValue::Empty => ser.serialize_str(""),
        }
    }
}

impl<'de> Deserialize<'de> for ResultValue {
    fn deserialize<D: Deserializer<'de>>(de: D) -> Result<Self, D::Error> {
        struct ValueVisitor;

        impl de::Visitor<'_> for ValueVisitor {
            type Value = ResultValue;

            fn expecting(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str("a number or a string")
            }

            fn visit_f64<E: de::Error>(self, v: f64) -> Result<ResultValue, E> {
                Ok(ResultValue::Num(v))
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<ResultValue, E> {
                Ok(ResultValue::Num(v as f64))
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<ResultValue, E> {
                Ok(ResultValue::Num(v as f64))
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<ResultValue, E> {
                if v.is_empty() {
                    Ok(ResultValue::Empty)
                } else {
                    Ok(ResultValue::Str(v.to_string()))
                }
            }
        }

        de.deserialize_any(ValueVisitor)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Sanitize a test name into a job id.
///
/// Replaces `-`, `.`, `:` and spaces with `_`. Idempotent: sanitizing a
/// sanitized id is a no-op.
pub fn sanitize_job_id(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            '-' | '.' | ':' | ' ' => '_',
            other => other,
        })
        .collect()
}

/// SHA-256 of `data`, lowercase hex.
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}
