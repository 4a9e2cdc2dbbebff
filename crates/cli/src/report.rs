//! Textual batch reports

use async_trait::async_trait;
use engine::Sink;
use parking_lot::Mutex;
use std::io::Write;

/// Sink that renders each flushed batch as a plain-text report: the
/// sender on a header line, one ` - ` line per message. Output stays
/// free of styling so it can be piped.
pub struct ReportSink<W> {
    out: Mutex<W>,
}

impl ReportSink<std::io::Stdout> {
    pub fn stdout() -> Self {
        Self::new(std::io::stdout())
    }
}

impl<W: Write + Send + 'static> ReportSink<W> {
    pub fn new(out: W) -> Self {
        Self { out: Mutex::new(out) }
    }
}

#[async_trait]
impl<W: Write + Send + 'static> Sink for ReportSink<W> {
    async fn deliver(&self, key: &str, items: Vec<String>) -> anyhow::Result<()> {
        let mut out = self.out.lock();
        writeln!(out, "Processing messages for sender '{key}':")?;
        for item in &items {
            writeln!(out, " - {item}")?;
        }
        out.flush()?;
        Ok(())
    }
}
