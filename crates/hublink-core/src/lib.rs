/*!
 * HubLink Core
 *
 * This crate provides the I/O-free foundation of the HubLink system:
 * configuration, error taxonomy, logging, hardware identifiers, the wire
 * codecs and the calibration engine.
 */

#![warn(missing_docs)]

pub mod calibration;
pub mod codec;
pub mod config;
pub mod error;
pub mod logging;
pub mod prelude;
pub mod types;

/// Re-export of dependencies that are part of the public API
pub mod deps {
    pub use serde;
    pub use tracing;
}

/// HubLink core crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library initialization
pub fn init() -> Result<(), error::Error> {
    logging::init()?;
    tracing::info!("HubLink Core {} initialized", VERSION);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
