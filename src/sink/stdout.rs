use std::io::Write;

use super::QuerySink;

/// Pipe-friendly alternative to the file log: one timestamped line on stdout
/// per query.
pub struct StdoutSink;

impl StdoutSink {
    pub fn new() -> Self {
        Self
    }
}

impl QuerySink for StdoutSink {
    fn append_line(&mut self, line: &str) -> anyhow::Result<()> {
        let stamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S");
        let mut out = std::io::stdout().lock();
        writeln!(out, "[{stamp}] {line}")?;
        out.flush()?;
        Ok(())
    }
}
