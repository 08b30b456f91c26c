pub mod config;
pub mod console;
pub mod error;
pub mod firmware;
pub mod kernel_config;
pub mod launcher;
pub mod license;
pub mod log_sanitize;
pub mod relay;
pub mod session;
pub mod snapshot;
pub mod vm;

pub use error::{Error, ErrorKind, Result};
