// SPDX-License-Identifier: MIT OR Apache-2.0
//! flc-worker
#![deny(unsafe_code)]
//!
//! Check lifecycle and control loop for the Fleetcheck worker.

pub mod check;
pub mod control;
pub mod identity;

pub use check::{CheckContext, CheckError, run_check};
pub use control::{Worker, WorkerConfig};
pub use identity::worker_uuid;
