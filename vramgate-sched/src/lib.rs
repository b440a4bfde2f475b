//! VRAM admission scheduler.
//!
//! Leases are granted strictly by (priority desc, arrival asc) as long as the
//! concurrency cap, training-lane isolation and the VRAM budget allow it.
//! Model weights stay resident between leases and are evicted LRU-first
//! (hotset last, pinned never) when a new request needs the room.

mod config;
mod error;
mod lease;
mod queue;
mod registry;
mod residency;
mod scheduler;
mod state;

pub use config::*;
pub use error::{ConfigError, SchedError};
pub use lease::ResourceLease;
pub use registry::SchedulerRegistry;
pub use scheduler::{LeaseProvider, ResourceScheduler};
