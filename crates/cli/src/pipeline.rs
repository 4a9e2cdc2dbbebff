//! Envelope ingestion pipeline
//!
//! Reads one envelope per line, validates it, and submits the message
//! text under its sender. Rejected lines are logged and counted, not
//! fatal: a stream of messages should survive one bad producer.

use crate::envelope;
use anyhow::Result;
use engine::DebounceEngine;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineStats {
    pub accepted: u64,
    pub rejected: u64,
}

/// Consume envelope lines until the reader is exhausted.
///
/// Blank lines are skipped. The caller is responsible for draining
/// the engine afterwards; this function returns as soon as input ends
/// even if quiet periods are still running.
pub async fn run<R>(input: R, engine: &DebounceEngine) -> Result<PipelineStats>
where
    R: AsyncBufRead + Unpin,
{
    let mut stats = PipelineStats::default();
    let mut lines = input.lines();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        match envelope::parse(&line) {
            Ok(envelope) => {
                engine.submit(&envelope.sender, envelope.message_text);
                stats.accepted += 1;
            }
            Err(err) => {
                warn!(%err, "rejected envelope");
                stats.rejected += 1;
            }
        }
    }

    debug!(accepted = stats.accepted, rejected = stats.rejected, "input exhausted");
    Ok(stats)
}
