//! Loads the binary runtime image once and hands out per-unit copies.

use std::fmt;
use std::io::Read;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use flate2::read::GzDecoder;
use platform::Fetcher;
use tokio::sync::Mutex;

use crate::error::PoolError;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Immutable runtime image bytes. Never shared live between units: each unit
/// gets its own copy via [`RuntimeImage::copy_for_unit`].
pub struct RuntimeImage {
    bytes: Vec<u8>,
}

impl RuntimeImage {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn copy_for_unit(&self) -> Self {
        Self {
            bytes: self.bytes.clone(),
        }
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }
}

impl fmt::Debug for RuntimeImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuntimeImage")
            .field("len", &self.bytes.len())
            .finish()
    }
}

enum ImageSlot {
    Empty,
    Cached(Arc<RuntimeImage>),
    Released,
}

pub struct ImageLoader {
    url: String,
    fetcher: Arc<dyn Fetcher>,
    slot: Mutex<ImageSlot>,
    loads: AtomicUsize,
}

impl ImageLoader {
    pub fn new(url: impl Into<String>, fetcher: Arc<dyn Fetcher>) -> Self {
        Self {
            url: url.into(),
            fetcher,
            slot: Mutex::new(ImageSlot::Empty),
            loads: AtomicUsize::new(0),
        }
    }

    /// Return the cached image, fetching it first if needed. Concurrent
    /// callers wait on the same load.
    pub async fn acquire(&self) -> Result<Arc<RuntimeImage>, PoolError> {
        let mut slot = self.slot.lock().await;
        match &*slot {
            ImageSlot::Cached(image) => return Ok(Arc::clone(image)),
            ImageSlot::Released => {
                tracing::debug!("runtime image already distributed; fetching {} again", self.url);
            }
            ImageSlot::Empty => {}
        }
        let image = Arc::new(self.load().await?);
        *slot = ImageSlot::Cached(Arc::clone(&image));
        Ok(image)
    }

    /// Drop the cached copy once every unit has its own.
    pub async fn release(&self) {
        let mut slot = self.slot.lock().await;
        if matches!(*slot, ImageSlot::Cached(_)) {
            *slot = ImageSlot::Released;
        }
    }

    /// Number of completed fetches.
    pub fn loads(&self) -> usize {
        self.loads.load(Ordering::Relaxed)
    }

    async fn load(&self) -> Result<RuntimeImage, PoolError> {
        let response = self
            .fetcher
            .fetch(&self.url)
            .await
            .map_err(PoolError::transport)?;
        if !response.is_success() {
            return Err(PoolError::Transport(format!(
                "could not download runtime image {}: {} {}",
                self.url, response.status, response.status_text
            )));
        }
        self.loads.fetch_add(1, Ordering::Relaxed);

        let bytes = if response.body.starts_with(&GZIP_MAGIC) {
            tokio::task::spawn_blocking(move || gunzip(&response.body))
                .await
                .map_err(|err| PoolError::Decode(format!("decompression task failed: {err}")))??
        } else {
            response.body
        };
        if bytes.is_empty() {
            return Err(PoolError::Decode(format!(
                "runtime image {} is empty",
                self.url
            )));
        }
        tracing::info!("runtime image loaded: {} bytes", bytes.len());
        Ok(RuntimeImage::new(bytes))
    }
}

fn gunzip(compressed: &[u8]) -> Result<Vec<u8>, PoolError> {
    let mut decoder = GzDecoder::new(compressed);
    let mut decompressed = Vec::new();
    decoder
        .read_to_end(&mut decompressed)
        .map_err(|err| PoolError::Decode(format!("failed to decompress runtime image: {err}")))?;
    Ok(decompressed)
}
