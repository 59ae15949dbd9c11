/// Default mount point of the persisted document root inside each runtime.
pub const DEFAULT_DOC_ROOT: &str = "/www";
/// File whose presence marks a completed installation.
pub const SENTINEL_NAME: &str = "INSTALLED";

/// Configuration for the worker pool
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Number of execution units (default: num_cpus)
    pub num_units: usize,
    /// Forward stderr and log per-request detail
    pub debug: bool,
    /// PHP source run once on every unit after its handshake
    pub warm_up_script: Option<String>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            num_units: default_num_units(),
            debug: false,
            warm_up_script: None,
        }
    }
}

impl PoolConfig {
    /// Create config from environment variables
    ///
    /// Environment variables:
    /// - PHPW_UNITS: Number of execution units (default: num_cpus)
    /// - PHPW_DEBUG: Verbose unit output (default: false)
    /// - PHPW_WARM_UP: PHP source run on each unit at start-up
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(get: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        Self {
            num_units: get("PHPW_UNITS")
                .and_then(|s| s.parse().ok())
                .filter(|units: &usize| *units > 0)
                .unwrap_or_else(default_num_units),
            debug: get("PHPW_DEBUG").map(|v| is_truthy(&v)).unwrap_or(false),
            warm_up_script: get("PHPW_WARM_UP").filter(|script| !script.trim().is_empty()),
        }
    }
}

fn default_num_units() -> usize {
    num_cpus::get().max(1)
}

pub fn is_truthy(value: &str) -> bool {
    matches!(value, "1" | "true" | "yes" | "on")
}

/// Where the packaged application is fetched from and unpacked to.
#[derive(Debug, Clone)]
pub struct InstallLayout {
    pub doc_root: String,
    pub archive_url: String,
}

impl InstallLayout {
    pub fn new(doc_root: impl Into<String>, archive_url: impl Into<String>) -> Self {
        let doc_root = doc_root.into();
        let trimmed = doc_root.trim_end_matches('/');
        Self {
            doc_root: if trimmed.is_empty() {
                "/".to_string()
            } else {
                trimmed.to_string()
            },
            archive_url: archive_url.into(),
        }
    }

    pub fn sentinel_path(&self) -> String {
        self.join(SENTINEL_NAME)
    }

    /// Join a relative archive path onto the document root.
    pub fn join(&self, relative: &str) -> String {
        let relative = relative.trim_start_matches('/');
        if self.doc_root == "/" {
            format!("/{relative}")
        } else {
            format!("{}/{}", self.doc_root, relative)
        }
    }
}

impl Default for InstallLayout {
    fn default() -> Self {
        Self::new(DEFAULT_DOC_ROOT, "www.zip")
    }
}
