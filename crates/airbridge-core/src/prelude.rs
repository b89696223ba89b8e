/*!
 * Prelude module for AirBridge Core.
 *
 * This module re-exports commonly used types and functions from the AirBridge Core crate
 * to make them easier to import.
 */

// Re-export error types
pub use crate::error::{Error, Result};

// Re-export config types
pub use crate::config::{
    Config, ConfigBuilder, DeviceConfig, LoggingConfig, ReconnectConfig, TransportConfig,
};

// Re-export utility functions
pub use crate::utils::{exponential_backoff, with_timeout};

// Re-export logging macros
pub use tracing::{debug, error, info, trace, warn};

// Re-export core initialization
pub use crate::init;
