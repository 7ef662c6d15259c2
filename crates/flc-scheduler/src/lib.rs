// SPDX-License-Identifier: MIT OR Apache-2.0
//! Recurring job engine for Fleetcheck workers.
//!
//! A [`Scheduler`] owns a registry of interval-triggered jobs, a bounded
//! execution pool, and an advisory lockfile that keeps at most one running
//! engine per lockfile path on a host. Fires dispatch into the pool; a fire
//! that cannot start within its misfire grace is dropped, never queued, and
//! at most one fire per job id is in flight at any instant.
//!
//! Outcomes fan out to registered success/error listeners, which run on the
//! execution task, off the trigger loop, so a slow listener cannot stall
//! scheduling.
#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod lock;

pub use lock::{LockError, LockGuard};

use chrono::{DateTime, Utc};
use flc_core::sanitize_job_id;
use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Default bound on concurrently executing fires.
pub const DEFAULT_POOL_SIZE: usize = 100;

/// Default misfire grace.
pub const DEFAULT_MISFIRE_GRACE: Duration = Duration::from_secs(120);

/// Errors from scheduler operations.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// A job with the same (sanitized) id is already registered.
    #[error("job already exists: {0}")]
    JobExists(String),

    /// The named job is not registered.
    #[error("no such job: {0}")]
    UnknownJob(String),

    /// The singleton lock could not be acquired; [`LockError::Held`] is the
    /// fatal another-scheduler-is-running case.
    #[error(transparent)]
    Lock(#[from] LockError),
}

/// Error produced by a failed fire, carried to error listeners.
#[derive(Clone, Debug, Error)]
#[error("{0}")]
pub struct JobError(pub String);

/// Outcome of a single fire: raw job output on success.
pub type FireResult = Result<Vec<u8>, JobError>;

/// Boxed future a job body produces per fire.
pub type JobFuture = Pin<Box<dyn Future<Output = FireResult> + Send>>;

/// A registered job body: invoked once per fire.
pub type JobFn = Arc<dyn Fn() -> JobFuture + Send + Sync>;

/// Event delivered to listeners after each completed fire.
#[derive(Clone, Debug)]
pub struct JobEvent {
    /// Sanitized id of the job that fired.
    pub job_id: String,
    /// The fire's return value or error.
    pub outcome: FireResult,
}

type Listener = Arc<dyn Fn(JobEvent) + Send + Sync>;

// ---------------------------------------------------------------------------
// Options
// ---------------------------------------------------------------------------

/// Per-job scheduling options.
#[derive(Clone, Debug)]
pub struct JobOptions {
    /// Seconds between fires.
    pub interval: Duration,
    /// Total number of fires before the job auto-removes; `<= 0` means
    /// unbounded.
    pub max_runs: i64,
    /// Misfire grace: a fire that cannot start within this window of its
    /// scheduled instant is dropped.
    pub timeout: Duration,
    /// First fire instant; `None` fires immediately on start.
    pub start_at: Option<DateTime<Utc>>,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            max_runs: 0,
            timeout: DEFAULT_MISFIRE_GRACE,
            start_at: None,
        }
    }
}

impl JobOptions {
    /// Options firing every `interval` with defaults otherwise.
    pub fn every(interval: Duration) -> Self {
        Self {
            interval,
            ..Self::default()
        }
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

struct JobEntry {
    options: JobOptions,
    job: JobFn,
    runs: Arc<AtomicU64>,
    in_flight: Arc<Semaphore>,
    ticker: Option<JoinHandle<()>>,
}

struct Inner {
    jobs: Mutex<BTreeMap<String, JobEntry>>,
    auto_id: AtomicU64,
    running: AtomicBool,
    pool: Arc<Semaphore>,
    lockfile: std::path::PathBuf,
    lock: Mutex<Option<LockGuard>>,
    on_success: Mutex<Vec<Listener>>,
    on_error: Mutex<Vec<Listener>>,
}

/// The recurring job engine. Cheap to clone; all clones share one registry.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    /// Engine with the default pool bound.
    pub fn new(lockfile: impl Into<std::path::PathBuf>) -> Scheduler {
        Scheduler::with_pool_size(lockfile, DEFAULT_POOL_SIZE)
    }

    /// Engine with an explicit bound on concurrent fires.
    pub fn with_pool_size(
        lockfile: impl Into<std::path::PathBuf>,
        pool_size: usize,
    ) -> Scheduler {
        Scheduler {
            inner: Arc::new(Inner {
                jobs: Mutex::new(BTreeMap::new()),
                auto_id: AtomicU64::new(0),
                running: AtomicBool::new(false),
                pool: Arc::new(Semaphore::new(pool_size)),
                lockfile: lockfile.into(),
                lock: Mutex::new(None),
                on_success: Mutex::new(Vec::new()),
                on_error: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Register a recurring job.
    ///
    /// The id is sanitized (`-`, `.`, `:`, space → `_`); an empty id gets an
    /// auto-incrementing integer id. Registering an id that is already
    /// present fails with [`SchedulerError::JobExists`]. If the engine is
    /// running, the job begins firing immediately; otherwise it fires once
    /// [`Scheduler::start`] is called.
    ///
    /// Returns the effective job id.
    pub fn add<F, Fut>(
        &self,
        job: F,
        id: &str,
        options: JobOptions,
    ) -> Result<String, SchedulerError>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = FireResult> + Send + 'static,
    {
        let job_id = if id.is_empty() {
            (self.inner.auto_id.fetch_add(1, Ordering::SeqCst) + 1).to_string()
        } else {
            sanitize_job_id(id)
        };

        let job: JobFn = Arc::new(move || Box::pin(job()) as JobFuture);
        let mut entry = JobEntry {
            options,
            job,
            runs: Arc::new(AtomicU64::new(0)),
            in_flight: Arc::new(Semaphore::new(1)),
            ticker: None,
        };

        let mut jobs = self.inner.jobs.lock().expect("scheduler registry poisoned");
        if jobs.contains_key(&job_id) {
            return Err(SchedulerError::JobExists(job_id));
        }

        info!(target: "flc.scheduler", job = %job_id, interval_s = entry.options.interval.as_secs(), "job registered");

        if self.inner.running.load(Ordering::SeqCst) {
            entry.ticker = Some(spawn_ticker(&self.inner, &job_id, &entry));
        }
        jobs.insert(job_id.clone(), entry);

        Ok(job_id)
    }

    /// Acquire the singleton lock and begin firing registered jobs.
    ///
    /// Idempotent when already running. Fails with
    /// [`LockError::Held`] when another scheduler holds the lockfile.
    pub fn start(&self) -> Result<(), SchedulerError> {
        let mut lock_slot = self.inner.lock.lock().expect("scheduler state poisoned");
        if self.inner.running.load(Ordering::SeqCst) {
            debug!(target: "flc.scheduler", "already running");
            return Ok(());
        }

        *lock_slot = Some(LockGuard::acquire(&self.inner.lockfile)?);
        self.inner.running.store(true, Ordering::SeqCst);
        drop(lock_slot);

        let mut jobs = self.inner.jobs.lock().expect("scheduler registry poisoned");
        for (id, entry) in jobs.iter_mut() {
            if entry.ticker.is_none() {
                entry.ticker = Some(spawn_ticker(&self.inner, id, entry));
            }
        }

        info!(target: "flc.scheduler", jobs = jobs.len(), "scheduler started");
        Ok(())
    }

    /// Stop firing and release the lock.
    ///
    /// In-flight executions run to completion and their listeners still
    /// fire; only the triggers stop.
    pub fn stop(&self) {
        let mut lock_slot = self.inner.lock.lock().expect("scheduler state poisoned");
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return;
        }

        let mut jobs = self.inner.jobs.lock().expect("scheduler registry poisoned");
        for entry in jobs.values_mut() {
            if let Some(ticker) = entry.ticker.take() {
                ticker.abort();
            }
        }
        drop(jobs);

        *lock_slot = None;
        info!(target: "flc.scheduler", "scheduler stopped");
    }

    /// Remove a job and its bookkeeping. In-flight fires are not cancelled.
    pub fn delete(&self, id: &str) -> Result<(), SchedulerError> {
        let mut jobs = self.inner.jobs.lock().expect("scheduler registry poisoned");
        match jobs.remove(id) {
            Some(mut entry) => {
                if let Some(ticker) = entry.ticker.take() {
                    ticker.abort();
                }
                info!(target: "flc.scheduler", job = %id, "job removed");
                Ok(())
            }
            None => Err(SchedulerError::UnknownJob(id.to_string())),
        }
    }

    /// Currently registered job ids, sorted.
    pub fn get_jobs(&self) -> Vec<String> {
        self.inner
            .jobs
            .lock()
            .expect("scheduler registry poisoned")
            .keys()
            .cloned()
            .collect()
    }

    /// Whether the engine is currently firing.
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Register a callback for successful fires.
    pub fn add_success_listener(&self, f: impl Fn(JobEvent) + Send + Sync + 'static) {
        self.inner
            .on_success
            .lock()
            .expect("listener list poisoned")
            .push(Arc::new(f));
    }

    /// Register a callback for failed fires.
    pub fn add_error_listener(&self, f: impl Fn(JobEvent) + Send + Sync + 'static) {
        self.inner
            .on_error
            .lock()
            .expect("listener list poisoned")
            .push(Arc::new(f));
    }
}

// ---------------------------------------------------------------------------
// Trigger loop
// ---------------------------------------------------------------------------

fn spawn_ticker(inner: &Arc<Inner>, id: &str, entry: &JobEntry) -> JoinHandle<()> {
    let inner = Arc::clone(inner);
    let id = id.to_string();
    let options = entry.options.clone();
    let job = Arc::clone(&entry.job);
    let runs = Arc::clone(&entry.runs);
    let in_flight = Arc::clone(&entry.in_flight);

    tokio::spawn(async move {
        if let Some(at) = options.start_at {
            let delay = (at - Utc::now()).to_std().unwrap_or_default();
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
        }

        let mut next = Instant::now();
        loop {
            tokio::time::sleep_until(next).await;

            // Backlogged past the grace window: the fire is dropped.
            if next.elapsed() > options.timeout {
                warn!(target: "flc.scheduler", job = %id, "misfire, dropping");
                next += options.interval;
                continue;
            }

            // One fire per job in flight; a tick landing during the previous
            // fire is dropped, not queued.
            let in_flight_permit = match Arc::clone(&in_flight).try_acquire_owned() {
                Ok(permit) => permit,
                Err(_) => {
                    debug!(target: "flc.scheduler", job = %id, "previous fire still running, dropping");
                    next += options.interval;
                    continue;
                }
            };

            // A pool slot, bounded by the same grace window.
            let deadline = next + options.timeout;
            let pool_permit = match tokio::time::timeout_at(
                deadline,
                Arc::clone(&inner.pool).acquire_owned(),
            )
            .await
            {
                Ok(Ok(permit)) => permit,
                _ => {
                    warn!(target: "flc.scheduler", job = %id, "pool saturated past grace, dropping fire");
                    next += options.interval;
                    continue;
                }
            };

            let count = runs.fetch_add(1, Ordering::SeqCst) + 1;
            let last = options.max_runs > 0 && count as i64 >= options.max_runs;
            if last {
                info!(target: "flc.scheduler", job = %id, runs = count, "max runs reached, removing job");
                inner
                    .jobs
                    .lock()
                    .expect("scheduler registry poisoned")
                    .remove(&id);
            }

            let exec_inner = Arc::clone(&inner);
            let exec_job = Arc::clone(&job);
            let exec_id = id.clone();
            tokio::spawn(async move {
                let outcome = (exec_job)().await;
                match &outcome {
                    Ok(_) => debug!(target: "flc.scheduler", job = %exec_id, "fire completed"),
                    Err(err) => {
                        warn!(target: "flc.scheduler", job = %exec_id, error = %err, "fire failed")
                    }
                }
                emit(
                    &exec_inner,
                    JobEvent {
                        job_id: exec_id,
                        outcome,
                    },
                );
                drop(in_flight_permit);
                drop(pool_permit);
            });

            if last {
                break;
            }
            next += options.interval;
        }
    })
}

fn emit(inner: &Arc<Inner>, event: JobEvent) {
    let listeners = match event.outcome {
        Ok(_) => inner
            .on_success
            .lock()
            .expect("listener list poisoned")
            .clone(),
        Err(_) => inner
            .on_error
            .lock()
            .expect("listener list poisoned")
            .clone(),
    };
    for listener in listeners {
        listener(event.clone());
    }
}
