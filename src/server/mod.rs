//! Host process setup
//!
//! Configuration loading, logging and the main run loop.

mod config;
mod init;
mod loader;
mod logging;

pub use self::config::AppConfig;
pub use init::run;
pub use loader::load_config;
pub use logging::init_logging;
