//! One-time installation of the packaged application into a runtime mount.
//!
//! An installation fetches the archive, unpacks every entry under the
//! document root, writes the sentinel file last and persists the mount.
//! The sentinel is checked fresh at the start of every attempt, so a mount
//! that was installed by an earlier process is never downloaded again.

use std::sync::Arc;

use platform::{ArchiveDecoder, ArchiveEntry, Fetcher, RuntimeFs};

use crate::config::InstallLayout;
use crate::error::PoolError;
use crate::flight::SingleFlight;
use crate::mount::SerializedFs;

const SENTINEL_CONTENT: &[u8] = b"OK";

pub struct Installer {
    attempt: InstallAttempt,
    flight: SingleFlight<bool>,
}

impl Installer {
    pub fn new(
        layout: InstallLayout,
        fetcher: Arc<dyn Fetcher>,
        decoder: Arc<dyn ArchiveDecoder>,
        mount: Arc<SerializedFs>,
    ) -> Self {
        Self {
            attempt: InstallAttempt {
                layout: Arc::new(layout),
                fetcher,
                decoder,
                mount,
            },
            flight: SingleFlight::new(),
        }
    }

    /// Install unless already installed. Concurrent callers share one
    /// attempt; a failed attempt leaves the installer ready to retry.
    pub async fn ensure_installed(&self) -> Result<bool, PoolError> {
        let attempt = self.attempt.clone();
        self.flight.run(move || attempt.run()).await
    }

    /// Probe the mount for a completed installation without fetching.
    pub async fn is_installed(&self) -> Result<bool, PoolError> {
        if self.flight.is_done() {
            return Ok(true);
        }
        self.attempt.mount.sync(true).await?;
        Ok(self.attempt.sentinel_present())
    }

    pub fn layout(&self) -> &InstallLayout {
        &self.attempt.layout
    }
}

#[derive(Clone)]
struct InstallAttempt {
    layout: Arc<InstallLayout>,
    fetcher: Arc<dyn Fetcher>,
    decoder: Arc<dyn ArchiveDecoder>,
    mount: Arc<SerializedFs>,
}

impl InstallAttempt {
    fn sentinel_present(&self) -> bool {
        self.mount.stat(&self.layout.sentinel_path()).is_some()
    }

    async fn run(self) -> Result<bool, PoolError> {
        self.mount.sync(true).await?;
        if self.sentinel_present() {
            tracing::debug!("{} already installed", self.layout.doc_root);
            return Ok(true);
        }

        let url = &self.layout.archive_url;
        tracing::info!("installing {} into {}", url, self.layout.doc_root);
        let response = self
            .fetcher
            .fetch(url)
            .await
            .map_err(PoolError::transport)?;
        if !response.is_success() {
            return Err(PoolError::Transport(format!(
                "could not download {}: {} {}",
                url, response.status, response.status_text
            )));
        }

        let decoder = Arc::clone(&self.decoder);
        let entries = tokio::task::spawn_blocking(move || decoder.decode(&response.body))
            .await
            .map_err(|err| PoolError::Decode(format!("archive decode task failed: {err}")))?
            .map_err(PoolError::decode)?;
        let planned = plan(&self.layout, entries)?;
        let count = planned.len();

        let sentinel = self.layout.sentinel_path();
        self.mount
            .mutate(|fs| unpack(fs, &planned, &sentinel))
            .await?;
        self.mount.sync(false).await?;
        tracing::info!("installed {} entries into {}", count, self.layout.doc_root);
        Ok(true)
    }
}

enum Planned {
    Dir(String),
    File(String, Vec<u8>),
}

/// Map archive entries onto absolute mount paths, rejecting any entry that
/// would land outside the document root.
fn plan(layout: &InstallLayout, entries: Vec<ArchiveEntry>) -> Result<Vec<Planned>, PoolError> {
    let mut planned = Vec::with_capacity(entries.len());
    for entry in entries {
        if entry.path.starts_with('/') || entry.path.starts_with('\\') {
            return Err(PoolError::Decode(format!(
                "archive entry has an absolute path: {}",
                entry.path
            )));
        }
        let mut segments = Vec::new();
        for segment in entry.path.split(['/', '\\']) {
            match segment {
                "" | "." => {}
                ".." => {
                    return Err(PoolError::Decode(format!(
                        "archive entry escapes the document root: {}",
                        entry.path
                    )));
                }
                segment => segments.push(segment),
            }
        }
        if segments.is_empty() {
            continue;
        }
        let full = layout.join(&segments.join("/"));
        if entry.is_dir() {
            planned.push(Planned::Dir(full));
        } else {
            planned.push(Planned::File(full, entry.content));
        }
    }
    Ok(planned)
}

fn unpack(fs: &dyn RuntimeFs, planned: &[Planned], sentinel: &str) -> Result<(), PoolError> {
    let write = |path: &str, bytes: &[u8]| -> Result<(), PoolError> {
        fs.mkdir_tree(parent(path))
            .and_then(|()| fs.write_file(path, bytes))
            .map_err(|err| PoolError::Filesystem(format!("{path}: {err:#}")))
    };
    for entry in planned {
        match entry {
            Planned::Dir(path) => fs
                .mkdir_tree(path)
                .map_err(|err| PoolError::Filesystem(format!("{path}: {err:#}")))?,
            Planned::File(path, content) => write(path, content)?,
        }
    }
    write(sentinel, SENTINEL_CONTENT)
}

fn parent(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) | None => "/",
        Some(index) => &path[..index],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{DurableStore, FakeDecoder, FakeFetcher, MemFs};
    use std::time::Duration;

    const APP: &[(&str, &str)] = &[
        ("index.php", "echo 'home'"),
        ("lib/", ""),
        ("lib/util/helpers.php", "echo 'helpers'"),
    ];

    fn installer(fetcher: &Arc<FakeFetcher>, store: &DurableStore) -> (Arc<Installer>, Arc<MemFs>) {
        let fs = Arc::new(MemFs::with_store(Arc::clone(store)));
        let mount = Arc::new(SerializedFs::new(fs.clone()));
        let installer = Installer::new(
            InstallLayout::default(),
            fetcher.clone(),
            Arc::new(FakeDecoder),
            mount,
        );
        (Arc::new(installer), fs)
    }

    fn persisted(store: &DurableStore, path: &str) -> bool {
        store.lock().unwrap().contains_key(path)
    }

    #[tokio::test]
    async fn test_concurrent_callers_download_once() {
        let fetcher = Arc::new(FakeFetcher::new());
        fetcher.serve("www.zip", FakeDecoder::encode(APP));
        let gate = fetcher.hold("www.zip");
        let store = MemFs::durable_store();
        let (installer, fs) = installer(&fetcher, &store);

        let callers: Vec<_> = (0..5)
            .map(|_| {
                let installer = Arc::clone(&installer);
                tokio::spawn(async move { installer.ensure_installed().await })
            })
            .collect();
        while fetcher.calls("www.zip") == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        gate.open();

        for caller in callers {
            assert_eq!(caller.await.unwrap(), Ok(true));
        }
        assert_eq!(fetcher.calls("www.zip"), 1);
        assert_eq!(fs.read("/www/INSTALLED").as_deref(), Some(&b"OK"[..]));
        assert_eq!(fs.read("/www/index.php").as_deref(), Some(&b"echo 'home'"[..]));
        assert!(fs.stat("/www/lib").unwrap().is_dir);
        assert!(fs.stat("/www/lib/util").unwrap().is_dir);
        assert!(persisted(&store, "/www/INSTALLED"));
        assert!(persisted(&store, "/www/lib/util/helpers.php"));

        // Installed: later calls neither fetch nor sync.
        let syncs = fs.syncs();
        assert_eq!(installer.ensure_installed().await, Ok(true));
        assert_eq!(fetcher.calls("www.zip"), 1);
        assert_eq!(fs.syncs(), syncs);
    }

    #[tokio::test]
    async fn test_restart_with_persisted_sentinel_skips_download() {
        let fetcher = Arc::new(FakeFetcher::new());
        fetcher.serve("www.zip", FakeDecoder::encode(APP));
        let store = MemFs::durable_store();

        let (first, _) = installer(&fetcher, &store);
        assert_eq!(first.ensure_installed().await, Ok(true));

        let (restarted, fs) = installer(&fetcher, &store);
        assert_eq!(restarted.is_installed().await, Ok(true));
        assert_eq!(restarted.ensure_installed().await, Ok(true));
        assert_eq!(fetcher.calls("www.zip"), 1);
        assert!(fs.read("/www/index.php").is_some());
    }

    #[tokio::test]
    async fn test_failed_download_leaves_no_sentinel_and_retries() {
        let fetcher = Arc::new(FakeFetcher::new());
        fetcher.serve_status("www.zip", 503, "Service Unavailable");
        let store = MemFs::durable_store();
        let (installer, fs) = installer(&fetcher, &store);

        let err = installer.ensure_installed().await.unwrap_err();
        assert_eq!(
            err,
            PoolError::Transport("could not download www.zip: 503 Service Unavailable".to_string())
        );
        assert!(fs.read("/www/INSTALLED").is_none());
        assert!(!persisted(&store, "/www/INSTALLED"));
        assert_eq!(installer.is_installed().await, Ok(false));

        fetcher.serve("www.zip", FakeDecoder::encode(APP));
        assert_eq!(installer.ensure_installed().await, Ok(true));
        assert_eq!(fetcher.calls("www.zip"), 2);
    }

    #[tokio::test]
    async fn test_network_failure_is_transport_error() {
        let fetcher = Arc::new(FakeFetcher::new());
        fetcher.fail("www.zip", "connection refused");
        let (installer, _) = installer(&fetcher, &MemFs::durable_store());
        assert_eq!(
            installer.ensure_installed().await,
            Err(PoolError::Transport("connection refused".to_string()))
        );
    }

    #[tokio::test]
    async fn test_corrupt_archive_is_decode_error() {
        let fetcher = Arc::new(FakeFetcher::new());
        fetcher.serve("www.zip", b"PK\x03\x04 not really".to_vec());
        let (installer, fs) = installer(&fetcher, &MemFs::durable_store());
        assert!(matches!(
            installer.ensure_installed().await,
            Err(PoolError::Decode(_))
        ));
        assert!(fs.read("/www/INSTALLED").is_none());
    }

    #[tokio::test]
    async fn test_entries_outside_doc_root_are_rejected() {
        let fetcher = Arc::new(FakeFetcher::new());
        fetcher.serve(
            "www.zip",
            FakeDecoder::encode(&[("index.php", "echo 'ok'"), ("lib/../../etc/passwd", "root")]),
        );
        let (installer, fs) = installer(&fetcher, &MemFs::durable_store());
        let err = installer.ensure_installed().await.unwrap_err();
        assert!(matches!(err, PoolError::Decode(message) if message.contains("escapes")));
        assert!(fs.read("/www/index.php").is_none());
        assert!(fs.read("/etc/passwd").is_none());
    }

    #[tokio::test]
    async fn test_write_failure_is_filesystem_error() {
        let fetcher = Arc::new(FakeFetcher::new());
        fetcher.serve("www.zip", FakeDecoder::encode(APP));
        let store = MemFs::durable_store();
        let (installer, fs) = installer(&fetcher, &store);
        fs.fail_writes("ENOSPC");

        let err = installer.ensure_installed().await.unwrap_err();
        assert!(matches!(err, PoolError::Filesystem(message) if message.contains("ENOSPC")));
        assert!(!persisted(&store, "/www/INSTALLED"));
        // The failed attempt was not remembered; the next call tries again.
        assert!(matches!(
            installer.ensure_installed().await,
            Err(PoolError::Filesystem(_))
        ));
    }

    #[test]
    fn test_plan_normalizes_paths() {
        let layout = InstallLayout::default();
        let planned = plan(
            &layout,
            vec![
                ArchiveEntry::file("./a.php", b"x".to_vec()),
                ArchiveEntry::dir("b"),
                ArchiveEntry::dir("./"),
            ],
        )
        .unwrap();
        assert_eq!(planned.len(), 2);
        assert!(matches!(&planned[0], Planned::File(path, _) if path == "/www/a.php"));
        assert!(matches!(&planned[1], Planned::Dir(path) if path == "/www/b"));
        assert!(plan(&layout, vec![ArchiveEntry::file("/etc/x", b"x".to_vec())]).is_err());
    }
}
