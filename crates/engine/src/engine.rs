//! Per-key debounce state machine
//!
//! Coalesces a burst of items submitted under one key into a single
//! batch, delivered to the sink once the key has been quiet for the
//! configured period. Every submit resets that key's timer; a timer
//! that fires without being superseded drains the whole buffer.

use crate::scheduler::{FlushHandle, Scheduler, TimerScheduler};
use crate::sink::Sink;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

/// Engine configuration
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// How long a key must stay quiet after its last submit before the
    /// accumulated batch is delivered
    pub quiet_period: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            quiet_period: Duration::from_secs(30),
        }
    }
}

/// Buffered state for one active key
///
/// Lives from the first submit for an unseen key until a flush finds
/// it empty and unarmed. `generation` increments on every submit; a
/// scheduled flush carries the generation it was armed with and only
/// proceeds if that generation is still current.
#[derive(Default)]
struct KeyState {
    pending: Vec<String>,
    generation: u64,
    armed: bool,
}

pub(crate) struct EngineInner {
    table: DashMap<String, Mutex<KeyState>>,
    quiet_period: Duration,
    sink: Arc<dyn Sink>,
    scheduler: Arc<dyn Scheduler>,
}

/// Debounce engine keyed by an opaque identifier
///
/// Cheap to clone; clones share the same key table. Callers may submit
/// concurrently for the same or different keys. The engine never
/// blocks a submitter on the quiet period or on sink delivery.
#[derive(Clone)]
pub struct DebounceEngine {
    inner: Arc<EngineInner>,
}

impl DebounceEngine {
    /// Create an engine with the in-memory timer scheduler.
    ///
    /// Must be called from within a Tokio runtime, which the timers
    /// are spawned onto.
    pub fn new(config: EngineConfig, sink: Arc<dyn Sink>) -> Self {
        Self::with_scheduler(config, sink, Arc::new(TimerScheduler::new()))
    }

    /// Create an engine using the given flush scheduler.
    pub fn with_scheduler(
        config: EngineConfig,
        sink: Arc<dyn Sink>,
        scheduler: Arc<dyn Scheduler>,
    ) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                table: DashMap::new(),
                quiet_period: config.quiet_period,
                sink,
                scheduler,
            }),
        }
    }

    /// Handle through which a scheduler fires flushes back into this
    /// engine. Holds no strong reference; firing after the engine is
    /// dropped is a no-op.
    pub fn handle(&self) -> FlushHandle {
        FlushHandle::new(Arc::downgrade(&self.inner))
    }

    /// Buffer `item` under `key` and restart the key's quiet period.
    ///
    /// The key is treated as opaque; validating it (non-empty,
    /// well-formed) is the caller's job. Concurrent submits for the
    /// same key are serialized by the key's lock and all preserved.
    pub fn submit(&self, key: &str, item: impl Into<String>) {
        let entry = self.inner.table.entry(key.to_owned()).or_default();
        let mut state = entry.lock();
        state.pending.push(item.into());
        state.generation += 1;
        state.armed = true;
        // Arming inside the exclusive section keeps arm order aligned
        // with generation order; a stale generation must never be the
        // last one armed.
        self.inner
            .scheduler
            .arm(key, state.generation, self.inner.quiet_period, self.handle());
        trace!(key, generation = state.generation, "submit buffered");
    }

    /// Number of keys with live state, armed or mid-flush.
    pub fn active_keys(&self) -> usize {
        self.inner.table.len()
    }

    /// Force-flush every key with buffered items, superseding armed
    /// timers. Intended for graceful shutdown. Returns the number of
    /// batches delivered.
    pub async fn drain_all(&self) -> usize {
        self.inner.drain_all().await
    }
}

impl EngineInner {
    /// Run the flush armed with `generation` for `key`.
    ///
    /// Drains the buffer atomically with respect to concurrent
    /// submits, then delivers outside the lock so a slow sink never
    /// stalls submitters.
    pub(crate) async fn flush(&self, key: &str, generation: u64) {
        let batch = {
            let Some(entry) = self.table.get(key) else {
                // Reachable when a durable job outlives the process
                // that armed it; the buffer it pointed at is gone.
                warn!(key, generation, "dropping flush for key with no buffered state");
                return;
            };
            let mut state = entry.lock();
            if state.generation != generation {
                // Superseded by a newer submit; not a failure.
                trace!(key, generation, current = state.generation, "stale flush suppressed");
                return;
            }
            state.armed = false;
            std::mem::take(&mut state.pending)
        };

        if batch.is_empty() {
            // Already drained elsewhere (e.g. drain_all); nothing to deliver.
            debug!(key, "flush found empty buffer");
        } else {
            let count = batch.len();
            debug!(key, count, "delivering batch");
            if let Err(err) = self.sink.deliver(key, batch).await {
                error!(key, count, "sink delivery failed: {err:#}");
            }
        }

        self.remove_if_idle(key);
    }

    async fn drain_all(&self) -> usize {
        let keys: Vec<String> = self.table.iter().map(|entry| entry.key().clone()).collect();
        let mut delivered = 0;
        for key in keys {
            let batch = {
                let Some(entry) = self.table.get(&key) else {
                    continue;
                };
                let mut state = entry.lock();
                // Bump the generation so an already-fired timer racing
                // with cancellation finds itself superseded. Cancelling
                // inside the exclusive section keeps a concurrent
                // submit's fresh timer out of the blast radius.
                state.generation += 1;
                state.armed = false;
                self.scheduler.cancel(&key);
                std::mem::take(&mut state.pending)
            };
            if !batch.is_empty() {
                let count = batch.len();
                delivered += 1;
                if let Err(err) = self.sink.deliver(&key, batch).await {
                    error!(key = %key, count, "sink delivery failed: {err:#}");
                }
            }
            self.remove_if_idle(&key);
        }
        if delivered > 0 {
            info!(batches = delivered, "drained all pending batches");
        }
        delivered
    }

    /// Drop the key's entry once nothing references it: empty buffer
    /// and no armed timer. A submit that raced in re-arms the state
    /// and keeps the entry alive.
    fn remove_if_idle(&self, key: &str) {
        self.table.remove_if(key, |_, state| {
            let state = state.lock();
            state.pending.is_empty() && !state.armed
        });
    }
}
