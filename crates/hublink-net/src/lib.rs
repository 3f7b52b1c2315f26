/*!
 * HubLink Net
 *
 * This crate provides the client runtime of the HubLink system: the hub
 * registry, device directory, enumeration sync engine, notification decoder
 * and the cooperative request scheduler, all behind the [`HubClient`] facade.
 */

#![warn(missing_docs)]

// Re-export core types
pub use hublink_core::prelude;

pub mod context;
pub mod directory;
pub mod hub;
pub mod notify;
pub mod request;
pub mod sync;
pub mod transport;

pub use context::HubClient;
pub use directory::{DeviceEntry, Directory, FunctionRecord, FunctionTypeIndex};
pub use sync::PlugEvent;
pub use transport::{RequestSpec, Transport, TransportFactory, TransportStatus, Verb};

/// HubLink net crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initialize the client runtime
pub fn init() -> Result<(), hublink_core::error::Error> {
    tracing::info!("HubLink Net {} initialized", VERSION);
    Ok(())
}
