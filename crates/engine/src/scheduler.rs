//! Deferred flush scheduling
//!
//! A scheduler owns at most one armed flush per key. Arming a key
//! replaces whatever was armed before; cancelling discards it. The
//! engine's generation check is the authoritative supersede guard, so
//! a scheduler that lets a stale job fire anyway stays harmless.

use crate::engine::EngineInner;
use dashmap::DashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::AbortHandle;

/// Deferred, cancellable flush scheduling for the engine.
///
/// Implementations must not block the caller: `arm` and `cancel` run
/// inside a key's exclusive section.
pub trait Scheduler: Send + Sync + 'static {
    /// Schedule a flush for `key` after `delay`, tagged with the
    /// generation it was armed under. Supersedes any flush previously
    /// armed for the same key.
    fn arm(&self, key: &str, generation: u64, delay: Duration, handle: FlushHandle);

    /// Discard the armed flush for `key`, if any.
    fn cancel(&self, key: &str);
}

/// Weak handle through which a scheduler fires flushes into the engine.
#[derive(Clone)]
pub struct FlushHandle {
    engine: Weak<EngineInner>,
}

impl FlushHandle {
    pub(crate) fn new(engine: Weak<EngineInner>) -> Self {
        Self { engine }
    }

    /// Run the flush for `key` if `generation` is still that key's
    /// current generation. No-op once the engine has been dropped.
    pub async fn fire(&self, key: &str, generation: u64) {
        if let Some(engine) = self.engine.upgrade() {
            engine.flush(key, generation).await;
        }
    }
}

struct ArmedTimer {
    generation: u64,
    abort: AbortHandle,
}

/// In-memory scheduler: one Tokio sleep task per armed key.
///
/// Re-arming aborts the previous task as an optimization; even if an
/// aborted task has already passed its sleep, its fire is rejected by
/// the engine's generation check. Fired tasks remove their own map
/// entry so the timer table stays bounded.
#[derive(Default)]
pub struct TimerScheduler {
    timers: Arc<DashMap<String, ArmedTimer>>,
}

impl TimerScheduler {
    /// Create a scheduler. Timers are spawned onto the ambient Tokio
    /// runtime, so `arm` must be called from within one.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys with an armed timer.
    pub fn armed_keys(&self) -> usize {
        self.timers.len()
    }
}

impl Scheduler for TimerScheduler {
    fn arm(&self, key: &str, generation: u64, delay: Duration, handle: FlushHandle) {
        let timers = Arc::clone(&self.timers);
        let task_key = key.to_owned();
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            // Drop our own slot first; skip it if a newer arm already
            // replaced the entry.
            timers.remove_if(&task_key, |_, timer| timer.generation == generation);
            handle.fire(&task_key, generation).await;
        });
        if let Some(previous) = self.timers.insert(
            key.to_owned(),
            ArmedTimer {
                generation,
                abort: task.abort_handle(),
            },
        ) {
            previous.abort.abort();
        }
    }

    fn cancel(&self, key: &str) {
        if let Some((_, timer)) = self.timers.remove(key) {
            timer.abort.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{DebounceEngine, EngineConfig};
    use crate::sink::Sink;
    use async_trait::async_trait;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct CountingSink {
        delivered: Mutex<usize>,
    }

    #[async_trait]
    impl Sink for CountingSink {
        async fn deliver(&self, _key: &str, _items: Vec<String>) -> anyhow::Result<()> {
            *self.delivered.lock() += 1;
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn timer_map_self_cleans_after_fire() {
        let scheduler = Arc::new(TimerScheduler::new());
        let sink = Arc::new(CountingSink::default());
        let engine = DebounceEngine::with_scheduler(
            EngineConfig {
                quiet_period: Duration::from_secs(5),
            },
            Arc::clone(&sink) as Arc<dyn Sink>,
            Arc::clone(&scheduler) as Arc<dyn Scheduler>,
        );

        engine.submit("alice", "m1");
        assert_eq!(scheduler.armed_keys(), 1);

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(*sink.delivered.lock(), 1);
        assert_eq!(scheduler.armed_keys(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_prevents_fire() {
        let scheduler = Arc::new(TimerScheduler::new());
        let sink = Arc::new(CountingSink::default());
        let engine = DebounceEngine::with_scheduler(
            EngineConfig {
                quiet_period: Duration::from_secs(5),
            },
            Arc::clone(&sink) as Arc<dyn Sink>,
            Arc::clone(&scheduler) as Arc<dyn Scheduler>,
        );

        engine.submit("alice", "m1");
        scheduler.cancel("alice");
        assert_eq!(scheduler.armed_keys(), 0);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(*sink.delivered.lock(), 0);
        // The buffer is still intact; the next submit re-arms it.
        assert_eq!(engine.active_keys(), 1);
    }
}
