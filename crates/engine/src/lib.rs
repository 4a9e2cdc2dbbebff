//! Key-scoped debounce and batch coalescing for Quiesce
//!
//! This crate provides the debounce engine:
//! - Per-key buffering of submitted items
//! - Quiet-period timers that reset on every new submit
//! - Exactly-once flush of the accumulated batch to an injected sink
//! - Pluggable flush scheduling (in-memory timers here, a durable
//!   job store in the `durable` crate)

pub mod engine;
pub mod scheduler;
pub mod sink;

pub use engine::{DebounceEngine, EngineConfig};
pub use scheduler::{FlushHandle, Scheduler, TimerScheduler};
pub use sink::Sink;
