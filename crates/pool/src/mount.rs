use std::sync::Arc;

use platform::{FileStat, RuntimeFs};
use tokio::sync::Mutex;

use crate::error::PoolError;

/// Serializes every mutation and sync of a runtime's mounted filesystem.
/// The lock is FIFO-fair, so operations apply in the order they were issued.
pub struct SerializedFs {
    fs: Arc<dyn RuntimeFs>,
    lock: Mutex<()>,
}

impl SerializedFs {
    pub fn new(fs: Arc<dyn RuntimeFs>) -> Self {
        Self {
            fs,
            lock: Mutex::new(()),
        }
    }

    /// Unlocked read.
    pub fn stat(&self, path: &str) -> Option<FileStat> {
        self.fs.stat(path).ok()
    }

    /// Run `f` against the filesystem while holding the mount lock.
    pub async fn mutate<T, F>(&self, f: F) -> Result<T, PoolError>
    where
        F: FnOnce(&dyn RuntimeFs) -> Result<T, PoolError>,
    {
        let _guard = self.lock.lock().await;
        f(self.fs.as_ref())
    }

    pub async fn sync(&self, populate: bool) -> Result<(), PoolError> {
        let _guard = self.lock.lock().await;
        self.fs.syncfs(populate).await.map_err(|err| {
            let direction = if populate { "load" } else { "persist" };
            PoolError::Filesystem(format!("failed to {direction} mount: {err:#}"))
        })
    }
}
