//! Server-side implementations of the `platform` boundary traits.

mod archive;
mod fs;
mod net;
mod process;

pub use archive::ZipDecoder;
pub use fs::DirFs;
pub use net::ServerFetcher;
pub use process::{ProcessInterpreter, ProcessRuntimeFactory};
