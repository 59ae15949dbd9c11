use std::sync::Arc;

use platform::{ArchiveDecoder, Fetcher, RuntimeFactory};

/// The external collaborators a pool drives.
#[derive(Clone)]
pub struct Services {
    pub runtime: Arc<dyn RuntimeFactory>,
    pub fetcher: Arc<dyn Fetcher>,
    pub archive: Arc<dyn ArchiveDecoder>,
}
