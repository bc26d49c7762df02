use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::Context;
use tracing::debug;

use super::QuerySink;

const MAX_FILE_BYTES: u64 = 4 * 1024 * 1024;
const MAX_FILES: u32 = 10;

/// Appends timestamped lines to `<dir>/<name>-<N>.log`. `N` starts at 1 and
/// only ever grows; a file that has reached the size cap is left behind and
/// the next number opened, and once more than `max_files` exist the
/// oldest-numbered one is deleted.
pub struct RotatingFileSink {
    dir: PathBuf,
    name: String,
    max_bytes: u64,
    max_files: u32,
    counter: u32,
    file: File,
}

impl RotatingFileSink {
    pub fn new(dir: &Path, name: &str) -> anyhow::Result<Self> {
        Self::with_limits(dir, name, MAX_FILE_BYTES, MAX_FILES)
    }

    fn with_limits(dir: &Path, name: &str, max_bytes: u64, max_files: u32) -> anyhow::Result<Self> {
        fs::create_dir_all(dir)
            .with_context(|| format!("creating log directory {}", dir.display()))?;
        let counter = 1;
        let file = open_log(dir, name, counter)?;
        Ok(Self {
            dir: dir.to_path_buf(),
            name: name.to_string(),
            max_bytes,
            max_files,
            counter,
            file,
        })
    }

    fn path_for(&self, counter: u32) -> PathBuf {
        self.dir.join(format!("{}-{}.log", self.name, counter))
    }

    /// On-disk size of the current file. Unreadable metadata counts as
    /// not-yet-oversized; the next write will try again.
    fn oversized(&self) -> bool {
        fs::metadata(self.path_for(self.counter))
            .map(|m| m.len() >= self.max_bytes)
            .unwrap_or(false)
    }

    fn rotate(&mut self) -> anyhow::Result<()> {
        self.counter += 1;
        if self.counter > self.max_files {
            // Best effort: a vanished file is already what we wanted.
            let _ = fs::remove_file(self.path_for(self.counter - self.max_files));
        }
        self.file = open_log(&self.dir, &self.name, self.counter)?;
        debug!("rotated query log to {}", self.path_for(self.counter).display());
        Ok(())
    }
}

impl QuerySink for RotatingFileSink {
    fn append_line(&mut self, line: &str) -> anyhow::Result<()> {
        if self.oversized() {
            self.rotate()?;
        }
        let stamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S");
        writeln!(self.file, "[{stamp}] {line}")?;
        self.file.flush()?;
        Ok(())
    }
}

fn open_log(dir: &Path, name: &str, counter: u32) -> anyhow::Result<File> {
    let path = dir.join(format!("{name}-{counter}.log"));
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("opening log file {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("pgwiretap-{tag}-{}", std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        dir
    }

    #[test]
    fn lines_carry_local_timestamp_prefix() {
        let dir = temp_dir("stamp");
        let mut sink = RotatingFileSink::new(&dir, "query").unwrap();
        sink.append_line("127.0.0.1:9999 SELECT 1").unwrap();

        let text = fs::read_to_string(dir.join("query-1.log")).unwrap();
        let line = text.lines().next().unwrap();
        // "[YYYY-MM-DD HH:MM:SS] <payload>"
        assert_eq!(&line[..1], "[");
        assert_eq!(&line[20..22], "] ");
        assert_eq!(&line[22..], "127.0.0.1:9999 SELECT 1");
        assert_eq!(line.as_bytes()[5], b'-');
        assert_eq!(line.as_bytes()[14], b':');
        assert_eq!(line.as_bytes()[17], b':');

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn rotates_once_current_file_reaches_cap() {
        let dir = temp_dir("rotate");
        let mut sink = RotatingFileSink::with_limits(&dir, "query", 64, 10).unwrap();

        let payload = "x".repeat(80);
        sink.append_line(&payload).unwrap(); // lands in -1, pushes it past the cap
        sink.append_line(&payload).unwrap(); // triggers rotation, lands in -2

        assert!(dir.join("query-1.log").exists());
        assert!(dir.join("query-2.log").exists());
        let second = fs::read_to_string(dir.join("query-2.log")).unwrap();
        assert_eq!(second.lines().count(), 1);

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn prunes_beyond_max_files() {
        let dir = temp_dir("prune");
        let mut sink = RotatingFileSink::with_limits(&dir, "query", 8, 3).unwrap();

        // Every line overflows its file, so each write after the first
        // rotates. Five writes -> files 1..=5, of which only 3..=5 survive.
        for _ in 0..5 {
            sink.append_line("0123456789").unwrap();
        }

        assert!(!dir.join("query-1.log").exists());
        assert!(!dir.join("query-2.log").exists());
        assert!(dir.join("query-3.log").exists());
        assert!(dir.join("query-4.log").exists());
        assert!(dir.join("query-5.log").exists());

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn small_writes_stay_in_one_file() {
        let dir = temp_dir("small");
        let mut sink = RotatingFileSink::with_limits(&dir, "query", 4096, 10).unwrap();
        for i in 0..10 {
            sink.append_line(&format!("SELECT {i}")).unwrap();
        }
        assert!(dir.join("query-1.log").exists());
        assert!(!dir.join("query-2.log").exists());
        assert_eq!(
            fs::read_to_string(dir.join("query-1.log")).unwrap().lines().count(),
            10
        );

        let _ = fs::remove_dir_all(&dir);
    }
}
