//! Hive coordinator - worker registry, liveness tracking and capability-aware
//! routing for a fleet of volunteer workers.
//!
//! The coordinator is responsible for:
//!
//! - **Registration**: Classifying workers into tiers and indexing the
//!   services they host
//! - **Liveness**: Marking silent workers offline and deleting them, with the
//!   full cascade, once they pass the hard timeout
//! - **Routing**: Scoring live candidates per request and forwarding to the
//!   winner, or fanning a job out to every candidate
//! - **Persistence**: Keeping a durable copy of the registry within a fixed
//!   store write budget
//!
//! # Architecture
//!
//! The in-memory registry is authoritative while the process runs; the store
//! is only written to and is read back once at startup. Routing never waits
//! on store I/O.
//!
//! Heartbeat groups elect a leader through a compare-and-swap slot. The
//! leader relays its peers' heartbeats in batches, so a group of N workers
//! costs one request per interval instead of N.

pub mod api;
pub mod classifier;
pub mod config;
pub mod error;
pub mod index;
pub mod leader;
pub mod registry;
pub mod routing;
pub mod store;
pub mod sweeper;

// Re-export main types
pub use api::AppState;
pub use classifier::{assigned_services, classify, tier_role};
pub use config::CoordinatorConfig;
pub use error::{CoordinatorError, Result};
pub use index::ServiceIndex;
pub use leader::{HeartbeatLeader, LeadershipOutcome};
pub use registry::{RestoreReport, WorkerId, WorkerRecord, WorkerRegistry};
pub use routing::{
    ForwardRequest, ForwardResponse, HttpBackend, RoutingEngine, ScoreBreakdown, Selection,
    WorkerBackend,
};
pub use store::{BudgetedStore, KvStore, MemoryKv, Priority, StoreError, ValkeyKv, WriteOutcome};
pub use sweeper::{LivenessSweeper, SweepAction, SweepReport};
