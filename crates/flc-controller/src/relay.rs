// SPDX-License-Identifier: MIT OR Apache-2.0
//! Relay from validated callhome batches to the time-series backend.
//!
//! The controller never retries a failed write; it maps the failure to HTTP
//! 400 and the worker's next result emission provides the retry.

use async_trait::async_trait;
use flc_core::{ResultRecord, ResultValue};
use tracing::{debug, warn};

/// Destination for validated result batches.
#[async_trait]
pub trait ResultSink: Send + Sync {
    /// Write a batch of points, returning whether the backend accepted it.
    async fn write_points(&self, batch: &[ResultRecord]) -> bool;
}

/// Line-protocol sink for InfluxDB-compatible stores.
pub struct InfluxSink {
    client: reqwest::Client,
    write_url: String,
}

impl InfluxSink {
    /// Sink for an explicit backend address and database.
    pub fn new(host: &str, port: u16, database: &str) -> InfluxSink {
        InfluxSink {
            client: reqwest::Client::new(),
            write_url: format!("http://{host}:{port}/write?db={database}"),
        }
    }

    /// Sink configured from `INFLUX_HOST`, `INFLUX_PORT` and `INFLUX_DB`,
    /// with `localhost:8086` / `testdb` defaults.
    pub fn from_env() -> InfluxSink {
        let host = std::env::var("INFLUX_HOST").unwrap_or_else(|_| "localhost".into());
        let port = std::env::var("INFLUX_PORT")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(8086);
        let database = std::env::var("INFLUX_DB").unwrap_or_else(|_| "testdb".into());
        InfluxSink::new(&host, port, &database)
    }

    /// The `/write` endpoint this sink posts to.
    pub fn write_url(&self) -> &str {
        &self.write_url
    }
}

#[async_trait]
impl ResultSink for InfluxSink {
    async fn write_points(&self, batch: &[ResultRecord]) -> bool {
        if batch.is_empty() {
            return true;
        }
        let body = batch.iter().map(line_protocol).collect::<Vec<_>>().join("\n");
        debug!(target: "flc.relay", points = batch.len(), "writing batch");

        match self.client.post(&self.write_url).body(body).send().await {
            Ok(resp) if resp.status().is_success() => true,
            Ok(resp) => {
                warn!(target: "flc.relay", status = %resp.status(), "backend rejected write");
                false
            }
            Err(err) => {
                warn!(target: "flc.relay", error = %err, "backend unreachable");
                false
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Line protocol encoding
// ---------------------------------------------------------------------------

/// Encode one record as an influx line-protocol point.
///
/// Field typing follows the record: `success` is a boolean, `result` a float
/// or a quoted string. The timestamp is left to the server.
pub fn line_protocol(record: &ResultRecord) -> String {
    let mut line = escape_identifier(&record.measurement);
    for (key, value) in &record.tags {
        line.push(',');
        line.push_str(&escape_identifier(key));
        line.push('=');
        line.push_str(&escape_identifier(value));
    }

    line.push(' ');
    line.push_str("success=");
    line.push_str(if record.fields.success { "true" } else { "false" });

    match &record.fields.result {
        Some(ResultValue::Num(n)) => {
            line.push_str(&format!(",result={n}"));
        }
        Some(ResultValue::Str(s)) => {
            line.push_str(&format!(",result=\"{}\"", escape_string_field(s)));
        }
        Some(ResultValue::Empty) => {
            line.push_str(",result=\"\"");
        }
        None => {}
    }

    line
}

/// Escape measurement names and tag keys/values: commas, spaces and equals
/// signs are significant in line protocol.
fn escape_identifier(raw: &str) -> String {
    raw.replace('\\', "\\\\")
        .replace(',', "\\,")
        .replace(' ', "\\ ")
        .replace('=', "\\=")
}

fn escape_string_field(raw: &str) -> String {
    raw.replace('\\', "\\\\").replace('"', "\\\"")
}
