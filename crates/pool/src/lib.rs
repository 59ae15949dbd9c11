//! A pool of PHP execution units with a one-time installation workflow.
//!
//! Each unit owns its own interpreter instance, built from a private copy of
//! a runtime image that is fetched once. Requests queue in FIFO order and
//! are handed to the first free unit; replies are matched back to their
//! callers by request identity.

pub mod bootstrap;
pub mod config;
pub mod deferred;
pub mod error;
pub mod flight;
pub mod image;
pub mod install;
pub mod mount;
pub mod protocol;
pub mod scheduler;
pub mod services;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod unit;
pub mod worker_pool;

pub use config::{DEFAULT_DOC_ROOT, InstallLayout, PoolConfig, SENTINEL_NAME};
pub use deferred::DeferredTasks;
pub use error::PoolError;
pub use flight::SingleFlight;
pub use image::{ImageLoader, RuntimeImage};
pub use install::Installer;
pub use protocol::{Request, RequestId, UnitId};
pub use scheduler::PoolStats;
pub use services::Services;
pub use unit::ExecutionUnit;
pub use worker_pool::WorkerPool;
