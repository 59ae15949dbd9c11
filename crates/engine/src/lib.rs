//! The public face of the PHP worker pool: configuration loading plus an
//! [`Engine`] that gates work behind the one-time installation.

pub mod config;
pub mod engine;

pub use config::RuntimeConfig;
pub use engine::Engine;
pub use pool::{PoolError, PoolStats, Request, Services};
