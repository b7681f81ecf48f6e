//! Common types for pcs: errors, retry, progress reporting and credentials

#![deny(missing_docs)]

pub mod credentials;
pub mod error;
pub mod progress;
pub mod retry;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Maximum attempts for every bounded wait (remote shell, cluster API, health probe)
pub const MAX_RETRY: u32 = 36;

/// Portal page describing how to recover a half-deployed solution
pub const TROUBLESHOOTING_GUIDE_URL: &str = "https://aka.ms/iot-rm-tsg";
