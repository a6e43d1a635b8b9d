//! Hive worker agent.
//!
//! Runs on each worker host and keeps it visible to the coordinator:
//!
//! - **Identity**: A UUID persisted on first boot, from which the worker id
//!   is derived, so restarts update the same registry record
//! - **Registration**: Declares capabilities and hosted services, retrying
//!   with backoff until the coordinator answers
//! - **Heartbeats**: Probes local services and reports load and health on the
//!   interval the coordinator assigns
//! - **Relay**: Optionally claims the heartbeat group's leader slot and
//!   forwards peer heartbeats to the coordinator in batches

pub mod client;
pub mod config;
pub mod error;
pub mod heartbeat;
pub mod identity;
pub mod probe;
pub mod relay;

pub use client::{CoordinatorApi, CoordinatorClient};
pub use config::AgentConfig;
pub use error::{AgentError, AgentResult};
pub use heartbeat::HeartbeatTask;
pub use identity::WorkerIdentity;
pub use probe::{HeartbeatSource, ServiceProber};
pub use relay::{HeartbeatRelay, PeerRelay};
