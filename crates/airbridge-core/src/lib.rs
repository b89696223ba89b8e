/*!
 * AirBridge Core
 *
 * This crate provides the ambient plumbing shared by the AirBridge crates:
 * configuration loading, logging setup, error types and async helpers.
 */

#![warn(missing_docs)]

pub mod config;
pub mod error;
pub mod logging;
pub mod prelude;
pub mod utils;

/// Re-export of dependencies that are part of the public API
pub mod deps {
    pub use serde;
    pub use tokio;
    pub use tracing;
}

/// AirBridge core crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library initialization with the default log filter
pub fn init() -> Result<(), error::Error> {
    logging::init()?;
    tracing::info!("AirBridge Core {} initialized", VERSION);
    Ok(())
}
