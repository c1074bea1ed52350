use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};
use tracing::{info, warn};

/// Append-only audit log of watchdog events.
///
/// One line per event, `[YYYY-MM-DD HH:MM:SS.ffffff] message`. Never
/// truncated or rotated here.
#[derive(Debug, Clone)]
pub struct KeepaliveLog {
    path: PathBuf,
}

impl KeepaliveLog {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one event. Write failures are traced, not returned: the
    /// watchdog keeps running when its log is unwritable.
    pub fn append(&self, message: impl AsRef<str>) {
        let message = message.as_ref();
        info!(target: "vaultkeep::keepalive", "{}", message);
        if let Err(e) = self.try_append(message) {
            warn!(path = %self.path.display(), error = %e, "Failed to write keepalive log");
        }
    }

    fn try_append(&self, message: &str) -> io::Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(format_line(Local::now(), message).as_bytes())
    }

    /// Most recent event, for status display
    pub fn last_line(&self) -> Option<String> {
        let contents = std::fs::read_to_string(&self.path).ok()?;
        contents
            .lines()
            .rev()
            .find(|line| !line.trim().is_empty())
            .map(str::to_string)
    }
}

fn format_line(at: DateTime<Local>, message: &str) -> String {
    format!("[{}] {}\n", at.format("%Y-%m-%d %H:%M:%S%.6f"), message)
}
