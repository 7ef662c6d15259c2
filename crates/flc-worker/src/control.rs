// SPDX-License-Identifier: MIT OR Apache-2.0
//! The worker control loop.
//!
//! A [`Worker`] owns its scheduler, HTTP client, and identity — there is no
//! process-global state. The loop pulls the assignment from the controller,
//! diffs it structurally against the running set (with the transient `url`
//! stripped), and on any difference tears every job down and rebuilds from
//! scratch. Results are emitted from scheduler listeners, which hand the
//! HTTP post to a spawned task so a slow controller never stalls firing.

use crate::check::{self, CheckContext};
use crate::identity;
use flc_core::{ResultFields, ResultRecord, ResultValue, TestDescriptor};
use flc_scheduler::{JobError, JobEvent, JobOptions, Scheduler, SchedulerError};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Delay before re-asking a controller that served no assignment.
pub const EMPTY_CONFIG_DELAY: Duration = Duration::from_secs(5);

/// Default seconds between config pulls.
pub const DEFAULT_CALLHOME_INTERVAL: Duration = Duration::from_secs(30);

/// Worker settings.
#[derive(Clone, Debug)]
pub struct WorkerConfig {
    /// Controller base URL.
    pub base_url: String,
    /// Artifact cache directory.
    pub scripts_dir: PathBuf,
    /// Certificate artifact signatures must verify against.
    pub cert_path: PathBuf,
    /// Scheduler singleton lockfile.
    pub lockfile: PathBuf,
    /// Seconds between config pulls.
    pub callhome_interval: Duration,
}

impl WorkerConfig {
    /// Settings for `base_url` with the conventional paths.
    pub fn new(base_url: impl Into<String>) -> WorkerConfig {
        WorkerConfig {
            base_url: base_url.into(),
            scripts_dir: PathBuf::from("/tmp/scripts"),
            cert_path: PathBuf::from("certs/public.cert"),
            lockfile: PathBuf::from("/tmp/scheduler.lock"),
            callhome_interval: DEFAULT_CALLHOME_INTERVAL,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ConfigReply {
    status: String,
    #[serde(default)]
    data: Vec<TestDescriptor>,
    #[serde(default)]
    message: Option<String>,
}

/// A running worker: identity, scheduler, HTTP client, current assignment.
pub struct Worker {
    uuid: Uuid,
    config: WorkerConfig,
    client: reqwest::Client,
    scheduler: Scheduler,
    current: Vec<TestDescriptor>,
}

impl Worker {
    /// Build a worker; the identity is derived once, here.
    pub fn new(config: WorkerConfig) -> Worker {
        Worker {
            uuid: identity::worker_uuid(),
            scheduler: Scheduler::new(&config.lockfile),
            client: reqwest::Client::new(),
            current: Vec::new(),
            config,
        }
    }

    /// This worker's stable uuid.
    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    /// The underlying scheduler.
    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// Run the control loop. Only a failure to (re)start the scheduler —
    /// notably a held lockfile — ends the loop; transient controller
    /// failures keep the current assignment running.
    pub async fn run(&mut self) -> Result<(), SchedulerError> {
        self.register_listeners();
        info!(
            target: "flc.worker",
            uuid = %self.uuid,
            controller = %self.config.base_url,
            "control loop starting"
        );

        loop {
            match self.fetch_config().await {
                Ok(Some(tests)) => {
                    let normalized: Vec<TestDescriptor> =
                        tests.iter().map(TestDescriptor::without_url).collect();
                    if normalized != self.current {
                        info!(target: "flc.worker", tests = tests.len(), "assignment changed, rebuilding jobs");
                        self.stop_checks();
                        self.start_checks(&tests)?;
                        self.current = normalized;
                    }
                }
                Ok(None) => {
                    tokio::time::sleep(EMPTY_CONFIG_DELAY).await;
                    continue;
                }
                Err(err) => {
                    warn!(target: "flc.worker", error = %err, "config pull failed, keeping current assignment");
                }
            }
            tokio::time::sleep(self.config.callhome_interval).await;
        }
    }

    /// Stop firing and drop all jobs.
    pub fn stop(&self) {
        self.stop_checks();
        self.scheduler.stop();
    }

    /// Schedule one job per test and start the engine.
    ///
    /// The controller URL is injected into each descriptor here, just before
    /// scheduling; it is what the fire downloads artifacts from.
    pub fn start_checks(&self, tests: &[TestDescriptor]) -> Result<(), SchedulerError> {
        for test in tests {
            let mut test = test.clone();
            test.url = Some(self.config.base_url.clone());

            let ctx = CheckContext {
                scripts_dir: self.config.scripts_dir.clone(),
                cert_path: self.config.cert_path.clone(),
                client: self.client.clone(),
            };
            let name = test.name.clone();
            let interval = Duration::from_secs(test.interval);

            let added = self.scheduler.add(
                move || {
                    let descriptor = test.clone();
                    let ctx = ctx.clone();
                    async move {
                        check::run_check(&descriptor, &ctx)
                            .await
                            .map_err(|err| JobError(err.to_string()))
                    }
                },
                &name,
                JobOptions {
                    interval,
                    max_runs: 0,
                    ..JobOptions::default()
                },
            );
            match added {
                Ok(_) => {}
                Err(SchedulerError::JobExists(id)) => {
                    warn!(target: "flc.worker", job = %id, "duplicate test name in assignment, skipping");
                }
                Err(err) => return Err(err),
            }
        }

        self.scheduler.start()?;
        Ok(())
    }

    /// Delete every registered job. In-flight fires run to completion and
    /// may still post results afterwards.
    pub fn stop_checks(&self) {
        for id in self.scheduler.get_jobs() {
            if let Err(err) = self.scheduler.delete(&id) {
                warn!(target: "flc.worker", job = %id, error = %err, "failed to remove job");
            }
        }
    }

    fn register_listeners(&self) {
        let url = format!("{}/callhome?uuid={}", self.config.base_url, self.uuid);
        let uuid = self.uuid.to_string();

        let post_client = self.client.clone();
        let post_url = url.clone();
        let post_uuid = uuid.clone();
        self.scheduler.add_success_listener(move |event| {
            let record = success_record(&event, &post_uuid);
            spawn_post(post_client.clone(), post_url.clone(), record);
        });

        let post_client = self.client.clone();
        self.scheduler.add_error_listener(move |event| {
            let record = failure_record(&event, &uuid);
            spawn_post(post_client.clone(), url.clone(), record);
        });
    }

    async fn fetch_config(&self) -> Result<Option<Vec<TestDescriptor>>, reqwest::Error> {
        let url = format!("{}/config?uuid={}", self.config.base_url, self.uuid);
        let reply: ConfigReply = self.client.get(&url).send().await?.json().await?;

        if reply.status != "ok" || reply.data.is_empty() {
            debug!(
                target: "flc.worker",
                status = %reply.status,
                message = reply.message.as_deref().unwrap_or(""),
                "controller served no assignment"
            );
            return Ok(None);
        }
        Ok(Some(reply.data))
    }
}

// ---------------------------------------------------------------------------
// Result emission
// ---------------------------------------------------------------------------

fn base_tags(uuid: &str) -> BTreeMap<String, String> {
    let mut tags = BTreeMap::new();
    tags.insert("uuid".to_string(), uuid.to_string());
    tags
}

pub(crate) fn success_record(event: &JobEvent, uuid: &str) -> ResultRecord {
    let stdout = event.outcome.as_deref().unwrap_or(&[]);
    ResultRecord {
        measurement: event.job_id.clone(),
        tags: base_tags(uuid),
        fields: ResultFields {
            success: true,
            result: Some(ResultValue::parse(stdout)),
        },
    }
}

pub(crate) fn failure_record(event: &JobEvent, uuid: &str) -> ResultRecord {
    ResultRecord {
        measurement: event.job_id.clone(),
        tags: base_tags(uuid),
        fields: ResultFields {
            success: false,
            result: None,
        },
    }
}

fn spawn_post(client: reqwest::Client, url: String, record: ResultRecord) {
    tokio::spawn(async move {
        match client.post(&url).json(&vec![record]).send().await {
            Ok(resp) if resp.status().is_success() => {
                debug!(target: "flc.worker", "result posted");
            }
            Ok(resp) => {
                warn!(target: "flc.worker", status = %resp.status(), "callhome rejected, next fire retries");
            }
            Err(err) => {
                warn!(target: "flc.worker", error = %err, "callhome unreachable");
            }
        }
    });
}
