/*!
 * Prelude module for HubLink Core.
 *
 * This module re-exports commonly used types and functions from the HubLink
 * Core crate to make them easier to import.
 */

// Re-export error types
pub use crate::error::{Error, Result};

// Re-export core types
pub use crate::types::{function_class, HardwareId};

// Re-export config types
pub use crate::config::{Config, ConfigBuilder, SharedConfig};

// Re-export codec entry points
pub use crate::codec::{
    decimal_to_double, decode_floats, decode_public_value, decode_words, double_to_decimal,
    encode_words,
};

// Re-export calibration types
pub use crate::calibration::{CalibrationData, CalibrationPoint};

// Re-export logging macros
pub use tracing::{debug, error, info, trace, warn};

// Re-export core initialization
pub use crate::init;
