//! Boundary traits for the collaborators the pool drives but does not own:
//! the network, the archive decoder, and the PHP runtime with its mounted
//! filesystem.

use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;

// ========== Network ==========

/// Raw response of a fetch. Non-2xx statuses are not errors at this layer.
#[derive(Debug, Clone)]
pub struct FetchResponse {
    pub status: u16,
    pub status_text: String,
    pub body: Vec<u8>,
}

impl FetchResponse {
    pub fn ok(body: Vec<u8>) -> Self {
        Self {
            status: 200,
            status_text: "OK".to_string(),
            body,
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<FetchResponse>;
}

// ========== Archives ==========

/// One packaged path. Directories carry no content and end with `/`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveEntry {
    pub path: String,
    pub content: Vec<u8>,
}

impl ArchiveEntry {
    pub fn file(path: impl Into<String>, content: impl Into<Vec<u8>>) -> Self {
        Self {
            path: path.into(),
            content: content.into(),
        }
    }

    pub fn dir(path: impl Into<String>) -> Self {
        let mut path = path.into();
        if !path.ends_with('/') {
            path.push('/');
        }
        Self {
            path,
            content: Vec::new(),
        }
    }

    pub fn is_dir(&self) -> bool {
        self.content.is_empty() && self.path.ends_with('/')
    }
}

pub trait ArchiveDecoder: Send + Sync {
    /// Decode a compressed archive into its entries, in archive order.
    fn decode(&self, bytes: &[u8]) -> Result<Vec<ArchiveEntry>>;
}

// ========== Runtime filesystem ==========

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStat {
    pub is_dir: bool,
    pub size: u64,
}

/// Filesystem exposed by a runtime instance. Paths are absolute paths inside
/// the runtime's mount.
#[async_trait]
pub trait RuntimeFs: Send + Sync {
    fn stat(&self, path: &str) -> Result<FileStat>;
    fn mkdir(&self, path: &str) -> Result<()>;
    /// Create `path` and any missing parents. Succeeds if it already exists.
    fn mkdir_tree(&self, path: &str) -> Result<()>;
    fn write_file(&self, path: &str, bytes: &[u8]) -> Result<()>;
    /// `populate = true` loads durable state into the mount,
    /// `populate = false` persists the mount to durable storage.
    async fn syncfs(&self, populate: bool) -> Result<()>;
}

// ========== Runtime execution ==========

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputEvent {
    Stdout(Vec<u8>),
    Stderr(Vec<u8>),
}

pub type OutputSender = mpsc::UnboundedSender<OutputEvent>;

/// Where a runtime instance mounts its persistent document root.
#[derive(Debug, Clone)]
pub struct MountOptions {
    pub mount_path: String,
}

/// One live interpreter. Instances stay on the thread that created them.
#[async_trait(?Send)]
pub trait Interpreter {
    fn fs(&self) -> Arc<dyn RuntimeFs>;
    /// Reset per-run interpreter state.
    async fn refresh(&mut self) -> Result<()>;
    /// Run PHP source, streaming output chunks through `output`.
    async fn run(&mut self, source: &str, output: OutputSender) -> Result<()>;
}

pub trait RuntimeFactory: Send + Sync {
    /// Build an interpreter from its own copy of the runtime image.
    fn instantiate(&self, image: Vec<u8>, mount: &MountOptions) -> Result<Box<dyn Interpreter>>;
}
