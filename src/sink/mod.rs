pub mod rotating;
pub mod stdout;

/// Destination for reconstructed query lines.
pub trait QuerySink: Send + 'static {
    /// Append one line. Implementations flush before returning: a call that
    /// comes back `Ok` has handed the line to the operating system.
    fn append_line(&mut self, line: &str) -> anyhow::Result<()>;
}
