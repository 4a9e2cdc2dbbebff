//! Batch delivery seam

use async_trait::async_trait;

/// Consumer of flushed batches.
///
/// Invoked once per completed quiet period with every item buffered
/// for the key since the previous flush, in submit order. The engine
/// logs a failed delivery with the key and item count and moves on;
/// retry policy belongs to the sink itself.
#[async_trait]
pub trait Sink: Send + Sync + 'static {
    async fn deliver(&self, key: &str, items: Vec<String>) -> anyhow::Result<()>;
}
