use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{debug, warn};

use crate::error::{CoreError, CoreResult};

/// Thumbnail scratch space. Assets live until [`TempAssets::clear`].
pub struct TempAssets {
    dir: PathBuf,
    seq: AtomicU64,
    created: Mutex<Vec<PathBuf>>,
}

impl TempAssets {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            seq: AtomicU64::new(0),
            created: Mutex::new(Vec::new()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn store(&self, bytes: &[u8]) -> CoreResult<PathBuf> {
        fs::create_dir_all(&self.dir)
            .map_err(|err| CoreError::Io(format!("{}: {}", self.dir.display(), err)))?;
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or(0);
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let path = self.dir.join(format!("thumb-{}-{}.img", millis, seq));
        fs::write(&path, bytes)
            .map_err(|err| CoreError::Io(format!("{}: {}", path.display(), err)))?;
        if let Ok(mut created) = self.created.lock() {
            created.push(path.clone());
        }
        Ok(path)
    }

    pub fn len(&self) -> usize {
        self.created.lock().map(|c| c.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Deletes every asset stored so far. Returns how many were removed.
    pub fn clear(&self) -> usize {
        let paths: Vec<PathBuf> = match self.created.lock() {
            Ok(mut created) => created.drain(..).collect(),
            Err(_) => return 0,
        };
        let mut removed = 0usize;
        for path in paths {
            match fs::remove_file(&path) {
                Ok(()) => removed += 1,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => warn!(path = %path.display(), error = %err, "failed to remove temp asset"),
            }
        }
        debug!(removed, "temp assets cleared");
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_then_clear_in_bulk() {
        let dir = tempfile::tempdir().expect("tempdir");
        let assets = TempAssets::new(dir.path().join("thumbs"));
        let a = assets.store(b"one").expect("store");
        let b = assets.store(b"two").expect("store");
        assert_ne!(a, b);
        assert!(a.exists() && b.exists());
        assert_eq!(assets.len(), 2);

        assert_eq!(assets.clear(), 2);
        assert!(!a.exists() && !b.exists());
        assert!(assets.is_empty());
        assert_eq!(assets.clear(), 0);
    }
}
