use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};
use tracing::{debug, info};

pub const DEFAULT_MAX_SLOTS: usize = 2;

#[derive(Debug, thiserror::Error)]
pub enum SlotError {
    #[error("Failed to create screenshot directory {}: {source}", .path.display())]
    CreateDir { path: PathBuf, source: std::io::Error },
    #[error("Failed to write screenshot {}: {source}", .path.display())]
    Write { path: PathBuf, source: std::io::Error },
}

/// One position in the rotating screenshot buffer.
#[derive(Debug, Clone)]
pub struct CaptureSlot {
    /// 1-based, at most the ring capacity.
    pub index: usize,
    pub path: PathBuf,
    pub captured_at: DateTime<Local>,
}

/// Fixed-capacity ring of screenshot files. Writing to an occupied slot
/// deletes the previous file in the background.
#[derive(Debug)]
pub struct CaptureRing {
    directory: PathBuf,
    max_slots: usize,
    /// Last slot index written, 0 when empty.
    count: usize,
    slots: Vec<CaptureSlot>,
    /// Disambiguates files written within the same millisecond.
    sequence: u64,
}

impl CaptureRing {
    pub fn new(directory: impl Into<PathBuf>, max_slots: usize) -> Self {
        Self {
            directory: directory.into(),
            max_slots: max_slots.max(1),
            count: 0,
            slots: Vec::with_capacity(max_slots.max(1)),
            sequence: 0,
        }
    }

    pub fn max_slots(&self) -> usize {
        self.max_slots
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Occupied slots ordered by index.
    pub fn slots(&self) -> &[CaptureSlot] {
        &self.slots
    }

    pub fn paths(&self) -> Vec<PathBuf> {
        self.slots.iter().map(|s| s.path.clone()).collect()
    }

    /// Write `bytes` into the next slot and return it.
    pub fn insert(&mut self, bytes: &[u8]) -> Result<CaptureSlot, SlotError> {
        fs::create_dir_all(&self.directory).map_err(|source| SlotError::CreateDir {
            path: self.directory.clone(),
            source,
        })?;
        let path = self.reserve();
        fs::write(&path, bytes).map_err(|source| SlotError::Write {
            path: path.clone(),
            source,
        })?;
        Ok(self.commit(path))
    }

    fn next_index(&self) -> usize {
        if self.count >= self.max_slots { 1 } else { self.count + 1 }
    }

    /// Fresh file path for the next slot. Nothing changes until the file is
    /// written and passed to [`commit`](Self::commit).
    pub fn reserve(&mut self) -> PathBuf {
        self.sequence += 1;
        self.directory.join(format!(
            "screenshot-{}-{}-{}.png",
            self.next_index(),
            Local::now().timestamp_millis(),
            self.sequence
        ))
    }

    /// Put an already written file into the next slot, evicting the file
    /// that occupied it.
    pub fn commit(&mut self, path: PathBuf) -> CaptureSlot {
        let next = self.next_index();
        let slot = CaptureSlot {
            index: next,
            path,
            captured_at: Local::now(),
        };

        let evicted = match self.slots.iter_mut().find(|s| s.index == next) {
            Some(existing) => Some(std::mem::replace(existing, slot.clone()).path),
            None => {
                self.slots.push(slot.clone());
                self.slots.sort_by_key(|s| s.index);
                None
            }
        };
        self.count = next;

        if let Some(old) = evicted {
            debug!("Slot {next} evicts {}", old.display());
            discard_files(vec![old]);
        }
        info!("Saved screenshot to slot {next}: {}", slot.path.display());
        slot
    }

    /// Forget every slot and delete their files in the background.
    pub fn reset(&mut self) {
        let old: Vec<PathBuf> = self.slots.drain(..).map(|s| s.path).collect();
        self.count = 0;
        if !old.is_empty() {
            info!("Clearing {} screenshot(s)", old.len());
            discard_files(old);
        }
    }
}

/// Write a reserved slot file without blocking the runtime.
pub async fn write_file(path: &Path, bytes: &[u8]) -> Result<(), SlotError> {
    if let Some(dir) = path.parent() {
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|source| SlotError::CreateDir {
                path: dir.to_path_buf(),
                source,
            })?;
    }
    tokio::fs::write(path, bytes)
        .await
        .map_err(|source| SlotError::Write {
            path: path.to_path_buf(),
            source,
        })
}

/// Best-effort deletion, never awaited. Runs on the blocking pool when a
/// tokio runtime is available, inline otherwise.
fn discard_files(paths: Vec<PathBuf>) {
    let remove = move || {
        for path in paths {
            if let Err(e) = fs::remove_file(&path) {
                debug!("Could not delete {}: {e}", path.display());
            }
        }
    };
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn_blocking(remove);
        }
        Err(_) => remove(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wraps_around_and_evicts_oldest_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut ring = CaptureRing::new(dir.path(), 2);

        let first = ring.insert(b"one").unwrap();
        let second = ring.insert(b"two").unwrap();
        let third = ring.insert(b"three").unwrap();

        assert_eq!(
            [first.index, second.index, third.index],
            [1, 2, 1]
        );
        assert!(!first.path.exists());
        assert!(second.path.exists());
        assert_eq!(fs::read(&third.path).unwrap(), b"three");
        assert_eq!(ring.count(), 1);
        assert_eq!(ring.paths(), vec![third.path.clone(), second.path.clone()]);
    }

    #[test]
    fn appends_until_full() {
        let dir = tempfile::tempdir().unwrap();
        let mut ring = CaptureRing::new(dir.path(), 3);
        ring.insert(b"a").unwrap();
        ring.insert(b"b").unwrap();
        assert_eq!(ring.len(), 2);
        assert_eq!(ring.count(), 2);
        ring.insert(b"c").unwrap();
        assert_eq!(ring.len(), 3);
        ring.insert(b"d").unwrap();
        assert_eq!(ring.len(), 3);
        assert_eq!(ring.count(), 1);
    }

    #[test]
    fn reset_clears_state_and_files() {
        let dir = tempfile::tempdir().unwrap();
        let mut ring = CaptureRing::new(dir.path().join("shots"), 2);
        let a = ring.insert(b"a").unwrap();
        let b = ring.insert(b"b").unwrap();

        ring.reset();

        assert!(ring.is_empty());
        assert_eq!(ring.count(), 0);
        assert!(!a.path.exists());
        assert!(!b.path.exists());
        assert_eq!(ring.insert(b"c").unwrap().index, 1);
    }

    #[test]
    fn eviction_of_missing_file_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let mut ring = CaptureRing::new(dir.path(), 1);
        let first = ring.insert(b"a").unwrap();
        fs::remove_file(&first.path).unwrap();
        let second = ring.insert(b"b").unwrap();
        assert_eq!(second.index, 1);
        assert!(second.path.exists());
    }

    #[tokio::test]
    async fn reserved_file_is_committed_after_async_write() {
        let dir = tempfile::tempdir().unwrap();
        let mut ring = CaptureRing::new(dir.path().join("shots"), 2);
        ring.insert(b"a").unwrap();

        let path = ring.reserve();
        assert_eq!(ring.count(), 1);
        write_file(&path, b"b").await.unwrap();
        let slot = ring.commit(path);

        assert_eq!(slot.index, 2);
        assert_eq!(ring.count(), 2);
        assert_eq!(fs::read(&slot.path).unwrap(), b"b");
    }

    #[test]
    fn zero_capacity_is_clamped_to_one() {
        let dir = tempfile::tempdir().unwrap();
        let ring = CaptureRing::new(dir.path(), 0);
        assert_eq!(ring.max_slots(), 1);
    }
}
