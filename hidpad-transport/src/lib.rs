//! Transport layer for hidpad sessions
//!
//! This crate owns everything that touches the operating system on behalf of
//! a session:
//!
//! - finding attached controllers ([`DeviceDirectory`], [`HidDirectory`])
//! - opening them and streaming input reports ([`DeviceHandle`], [`HidHandle`])
//! - hot-plug notification ([`HotplugMonitor`], [`HotplugSubscription`])
//!
//! The session logic only sees the two traits, so it can be driven by an
//! in-memory directory in tests.

pub mod error;
pub mod hotplug;
pub mod types;

mod discovery;
mod hid_device;

pub use discovery::HidDirectory;
pub use error::TransportError;
pub use hid_device::{HidHandle, ReaderConfig};
pub use hotplug::{HotplugMonitor, HotplugRegistration, HotplugSource, HotplugSubscription};
pub use types::{DeviceDescriptor, DeviceSpec, DiscoveryEvent};

#[cfg(all(target_os = "linux", feature = "hotplug"))]
pub use hotplug::UdevHotplugSource;

use std::sync::Arc;

use async_trait::async_trait;

/// An open device, exclusively owned by one connection
#[async_trait]
pub trait DeviceHandle: Send {
    /// Wait for the next raw input report
    ///
    /// Must be cancel-safe: dropping the future loses no report. An error
    /// means the handle is unusable and should be closed.
    async fn read_report(&mut self) -> Result<Vec<u8>, TransportError>;

    /// Write a raw output report, returning the number of bytes written
    fn write_report(&self, data: &[u8]) -> Result<usize, TransportError>;

    /// Release the device. Calling it more than once is harmless.
    fn close(&mut self);

    /// The device this handle was opened from
    fn descriptor(&self) -> &DeviceDescriptor;
}

/// Where sessions look for devices
#[async_trait]
pub trait DeviceDirectory: Send + Sync {
    /// List attached devices with the spec's vendor/product id
    ///
    /// Implementations may narrow by serial number but callers must not rely
    /// on it.
    async fn find(&self, spec: &DeviceSpec) -> Result<Vec<DeviceDescriptor>, TransportError>;

    /// Open a device returned by [`Self::find`]
    async fn open(
        &self,
        device: &DeviceDescriptor,
    ) -> Result<Box<dyn DeviceHandle>, TransportError>;

    /// Subscribe to add/remove notifications for one vendor/product id pair
    fn watch(
        &self,
        vendor_id: u16,
        product_id: u16,
    ) -> Result<HotplugSubscription, TransportError> {
        let _ = (vendor_id, product_id);
        Err(TransportError::HotplugUnavailable(
            "directory has no hot-plug source".into(),
        ))
    }
}

/// Type alias for a shared directory
pub type BoxedDirectory = Arc<dyn DeviceDirectory>;
