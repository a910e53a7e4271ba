//! Daily command log.
//!
//! Every verb invocation and every surfaced error is appended to a daily
//! file `<log_dir>/genie-YYYY-MM-DD-ddd.log` as a tab-separated line:
//!
//! ```text
//! 2026-08-06T14:03:22	(CMD)	(4711)	begin()
//! ```
//!
//! The file is opened and closed per write so several sessions can share it
//! through OS append atomicity of short lines. Log loss must never fail a
//! verb: an unavailable directory means the write is silently skipped.

use chrono::Local;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

#[derive(Clone, Debug)]
pub struct CommandLog {
    dir: PathBuf,
}

impl CommandLog {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Append one line with the given source tag. Failures are swallowed
    /// after a debug-level note.
    pub fn write(&self, source: &str, message: &str) {
        let now = Local::now();
        let line = format!(
            "{}\t({})\t({})\t{}\n",
            now.format("%Y-%m-%dT%H:%M:%S"),
            source,
            std::process::id(),
            message
        );
        let path = self.file_for(now.date_naive());
        if let Err(e) = append(&path, &line) {
            log::debug!("command log write to {} skipped: {}", path.display(), e);
        }
    }

    /// Log a verb invocation (source tag `CMD`).
    pub fn command(&self, message: &str) {
        self.write("CMD", message);
    }

    fn file_for(&self, date: chrono::NaiveDate) -> PathBuf {
        self.dir
            .join(format!("genie-{}.log", date.format("%Y-%m-%d-%a")))
    }
}

fn append(path: &Path, line: &str) -> std::io::Result<()> {
    let mut file = OpenOptions::new().append(true).create(true).open(path)?;
    file.write_all(line.as_bytes())
}
