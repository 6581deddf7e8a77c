use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Local;

use crate::state::Mode;

/// Plain-text transcript of one session's analyses.
#[derive(Debug, Clone)]
pub struct SessionLog {
    path: PathBuf,
}

impl SessionLog {
    /// Create `session_<timestamp>.txt` in `dir` and write the header.
    /// Returns None if the file cannot be created.
    pub fn create(dir: &Path) -> Option<SessionLog> {
        fs::create_dir_all(dir).ok()?;

        let timestamp = Local::now().format("%Y-%m-%d_%H-%M-%S");
        let path = dir.join(format!("session_{timestamp}.txt"));

        let mut file = OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .open(&path)
            .ok()?;

        let header = format!(
            "=== Screenshot Companion - Session Log ===\nDate: {}\n==========================================\n\n",
            Local::now().format("%Y-%m-%d %H:%M:%S")
        );
        file.write_all(header.as_bytes()).ok()?;

        Some(SessionLog { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one finished analysis. Write failures are ignored.
    pub fn log_analysis(&self, mode: Mode, target: &str, images: usize, markdown: &str) {
        let mut file = match OpenOptions::new().append(true).open(&self.path) {
            Ok(f) => f,
            Err(_) => return,
        };

        let now = Local::now().format("%H:%M:%S");
        let entry = format!(
            "[{now}] {mode} analysis via {target} ({images} screenshot(s)):\n{markdown}\n\n"
        );

        let _ = file.write_all(entry.as_bytes());
    }
}
