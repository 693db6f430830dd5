//! # leaseq
//!
//! Lease-based distributed work queue over a shared document store.
//!
//! Producers publish items onto named topics. Consumers subscribe and
//! lease one item per topic at a time, kept alive by a heartbeat thread
//! while the handler runs. A reaper returns leases whose heartbeat went
//! stale to the pool. Every transition is a conditional update in the
//! store (Postgres, or an in-process store for tests).

pub mod communicator;
pub mod config;
pub mod db;
pub mod error;
pub mod model;
pub mod store;
pub mod telemetry;

pub use communicator::{Communicator, CommunicatorConfig, Handler, WorkTimeAccounting};
pub use error::{Error, Result};
pub use model::{FinishOutcome, ItemId, LeaseState, WorkItem};
