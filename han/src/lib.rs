pub mod arch;
pub mod config;
pub mod error;
pub mod init;
pub mod optimization;

pub use error::{HanErr, Result};
