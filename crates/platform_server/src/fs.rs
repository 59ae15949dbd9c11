use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use platform::{FileStat, RuntimeFs};
use std::path::{Component, Path, PathBuf};
use std::sync::Mutex;

/// Mount backed by a host directory. Runtime paths are host paths and must
/// stay inside the mount root.
pub struct DirFs {
    root: PathBuf,
    /// Files written since the last persisting sync.
    dirty: Mutex<Vec<PathBuf>>,
}

impl DirFs {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let root = std::path::absolute(&root).unwrap_or(root);
        Self {
            root,
            dirty: Mutex::new(Vec::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &str) -> Result<PathBuf> {
        let candidate = Path::new(path);
        if !candidate.is_absolute() {
            bail!("runtime path must be absolute: {}", path);
        }
        if candidate
            .components()
            .any(|component| matches!(component, Component::ParentDir))
        {
            bail!("runtime path must not contain '..': {}", path);
        }
        if !candidate.starts_with(&self.root) {
            bail!(
                "runtime path {} is outside the mount {}",
                path,
                self.root.display()
            );
        }
        Ok(candidate.to_path_buf())
    }

    fn take_dirty(&self) -> Result<Vec<PathBuf>> {
        let mut dirty = self
            .dirty
            .lock()
            .map_err(|_| anyhow!("failed to lock mount journal"))?;
        Ok(std::mem::take(&mut *dirty))
    }
}

#[async_trait]
impl RuntimeFs for DirFs {
    fn stat(&self, path: &str) -> Result<FileStat> {
        let resolved = self.resolve(path)?;
        let metadata = std::fs::metadata(&resolved)
            .with_context(|| format!("stat {}", resolved.display()))?;
        Ok(FileStat {
            is_dir: metadata.is_dir(),
            size: metadata.len(),
        })
    }

    fn mkdir(&self, path: &str) -> Result<()> {
        let resolved = self.resolve(path)?;
        std::fs::create_dir(&resolved).with_context(|| format!("mkdir {}", resolved.display()))
    }

    fn mkdir_tree(&self, path: &str) -> Result<()> {
        let resolved = self.resolve(path)?;
        std::fs::create_dir_all(&resolved)
            .with_context(|| format!("mkdir -p {}", resolved.display()))
    }

    fn write_file(&self, path: &str, bytes: &[u8]) -> Result<()> {
        let resolved = self.resolve(path)?;
        std::fs::write(&resolved, bytes)
            .with_context(|| format!("write {}", resolved.display()))?;
        self.dirty
            .lock()
            .map_err(|_| anyhow!("failed to lock mount journal"))?
            .push(resolved);
        Ok(())
    }

    async fn syncfs(&self, populate: bool) -> Result<()> {
        if populate {
            let root = self.root.clone();
            return tokio::task::spawn_blocking(move || {
                std::fs::create_dir_all(&root)
                    .with_context(|| format!("prepare mount {}", root.display()))
            })
            .await
            .context("mount task panicked")?;
        }

        let dirty = self.take_dirty()?;
        let root = self.root.clone();
        tokio::task::spawn_blocking(move || -> Result<()> {
            for path in &dirty {
                let file = std::fs::File::open(path)
                    .with_context(|| format!("open {} for sync", path.display()))?;
                file.sync_all()
                    .with_context(|| format!("sync {}", path.display()))?;
            }
            #[cfg(unix)]
            {
                let dir = std::fs::File::open(&root)
                    .with_context(|| format!("open {} for sync", root.display()))?;
                dir.sync_all()
                    .with_context(|| format!("sync {}", root.display()))?;
            }
            tracing::debug!("persisted {} files under {}", dirty.len(), root.display());
            Ok(())
        })
        .await
        .context("mount task panicked")?
    }
}
