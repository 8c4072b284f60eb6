// Configuration file + flag resolution
pub mod config;
// Logging, signals and panic reporting
pub mod process;
// Session files of running mounts
pub mod session;

pub use config::{ConfigError, FileConfig, PasswordSource, Settings};
pub use session::{SessionError, SessionFile, SessionInfo};
