//! hidapi-backed device directory

use std::sync::Arc;

use async_trait::async_trait;
use hidapi::HidApi;
use tracing::{debug, info, warn};

use crate::error::TransportError;
use crate::hid_device::{HidHandle, ReaderConfig};
use crate::hotplug::{HotplugMonitor, HotplugSubscription};
use crate::types::{DeviceDescriptor, DeviceSpec};
use crate::{DeviceDirectory, DeviceHandle};

/// Device directory over the system's HID devices
pub struct HidDirectory {
    /// Shared hot-plug monitor, if the platform has one
    hotplug: Option<Arc<HotplugMonitor>>,
    /// Settings for reader threads of opened handles
    reader: ReaderConfig,
}

impl Default for HidDirectory {
    fn default() -> Self {
        Self::new()
    }
}

impl HidDirectory {
    /// Create a directory with the platform hot-plug source when available
    pub fn new() -> Self {
        Self {
            hotplug: default_monitor(),
            reader: ReaderConfig::default(),
        }
    }

    /// Create a directory without hot-plug notification
    pub fn without_hotplug() -> Self {
        Self {
            hotplug: None,
            reader: ReaderConfig::default(),
        }
    }

    /// Use a specific hot-plug monitor (shared with other directories)
    pub fn with_monitor(mut self, monitor: Arc<HotplugMonitor>) -> Self {
        self.hotplug = Some(monitor);
        self
    }

    /// Override reader thread settings
    pub fn with_reader_config(mut self, config: ReaderConfig) -> Self {
        self.reader = config;
        self
    }

    /// The hot-plug monitor backing [`DeviceDirectory::watch`]
    pub fn monitor(&self) -> Option<&Arc<HotplugMonitor>> {
        self.hotplug.as_ref()
    }

    /// Enumerate every attached HID device, optionally narrowed by ids
    pub fn list_all(
        vendor_id: Option<u16>,
        product_id: Option<u16>,
    ) -> Result<Vec<DeviceDescriptor>, TransportError> {
        let api = HidApi::new()?;
        let mut devices: Vec<DeviceDescriptor> = Vec::new();

        for info in api.device_list() {
            if vendor_id.is_some_and(|v| v != info.vendor_id())
                || product_id.is_some_and(|p| p != info.product_id())
            {
                continue;
            }
            let descriptor = descriptor_from_info(info);
            // One entry per path; composite devices list each usage separately
            if !devices.iter().any(|d| d.path == descriptor.path) {
                devices.push(descriptor);
            }
        }

        Ok(devices)
    }
}

#[cfg(all(target_os = "linux", feature = "hotplug"))]
fn default_monitor() -> Option<Arc<HotplugMonitor>> {
    Some(Arc::new(HotplugMonitor::new(Box::new(
        crate::hotplug::UdevHotplugSource,
    ))))
}

#[cfg(not(all(target_os = "linux", feature = "hotplug")))]
fn default_monitor() -> Option<Arc<HotplugMonitor>> {
    None
}

/// Run hidapi calls on the blocking pool; enumeration can take a while
async fn run_blocking<T, F>(f: F) -> Result<T, TransportError>
where
    F: FnOnce() -> Result<T, TransportError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| TransportError::Internal(format!("HID task failed: {e}")))?
}

fn descriptor_from_info(info: &hidapi::DeviceInfo) -> DeviceDescriptor {
    DeviceDescriptor {
        vendor_id: info.vendor_id(),
        product_id: info.product_id(),
        serial_number: info
            .serial_number()
            .filter(|s| !s.is_empty())
            .map(|s| s.to_string()),
        path: info.path().to_string_lossy().to_string(),
        product_name: info.product_string().map(|s| s.to_string()),
    }
}

#[async_trait]
impl DeviceDirectory for HidDirectory {
    async fn find(&self, spec: &DeviceSpec) -> Result<Vec<DeviceDescriptor>, TransportError> {
        let (vendor_id, product_id) = (spec.vendor_id, spec.product_id);
        let listed = run_blocking(move || Self::list_all(Some(vendor_id), Some(product_id))).await?;
        let devices: Vec<DeviceDescriptor> =
            listed.into_iter().filter(|d| spec.matches(d)).collect();

        for device in &devices {
            debug!("Found device: {}", device);
        }
        if devices.is_empty() {
            debug!("No device matching {}", spec);
        }
        Ok(devices)
    }

    async fn open(
        &self,
        device: &DeviceDescriptor,
    ) -> Result<Box<dyn DeviceHandle>, TransportError> {
        let (descriptor, reader) = (device.clone(), self.reader.clone());
        let handle = run_blocking(move || {
            let api = HidApi::new()?;
            HidHandle::open(&api, descriptor, reader)
        })
        .await
        .map_err(|e| {
            warn!("Failed to open {}: {} (maybe the device is in use)", device.path, e);
            e
        })?;
        info!("Opened {}", device);
        Ok(Box::new(handle))
    }

    fn watch(
        &self,
        vendor_id: u16,
        product_id: u16,
    ) -> Result<HotplugSubscription, TransportError> {
        match &self.hotplug {
            Some(monitor) => monitor.subscribe(vendor_id, product_id),
            None => Err(TransportError::HotplugUnavailable(
                "no hot-plug source on this platform".into(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DiscoveryEvent;

    #[tokio::test]
    async fn test_watch_uses_shared_monitor() {
        let monitor = Arc::new(HotplugMonitor::manual());
        let directory = HidDirectory::without_hotplug().with_monitor(Arc::clone(&monitor));

        let mut sub = directory.watch(0x046D, 0xC216).unwrap();
        assert_eq!(monitor.registrations(), 1);

        let device = DeviceDescriptor {
            vendor_id: 0x046D,
            product_id: 0xC216,
            serial_number: None,
            path: "1-2".into(),
            product_name: None,
        };
        monitor.publish(DiscoveryEvent::DeviceAdded(device.clone()));
        assert_eq!(sub.next().await, Some(DiscoveryEvent::DeviceAdded(device)));

        drop(sub);
        assert_eq!(monitor.registrations(), 0);
    }

    #[tokio::test]
    async fn test_blocking_work_reports_errors() {
        let ok = run_blocking(|| Ok::<_, TransportError>(7)).await;
        assert_eq!(ok.unwrap(), 7);

        let err = run_blocking(|| Err::<u8, _>(TransportError::DeviceNotFound("x".into()))).await;
        assert!(matches!(err, Err(TransportError::DeviceNotFound(_))));

        let panicked = run_blocking(|| -> Result<u8, TransportError> { panic!("hidapi") }).await;
        assert!(matches!(panicked, Err(TransportError::Internal(_))));
    }

    #[test]
    fn test_watch_without_monitor_is_unavailable() {
        let directory = HidDirectory::without_hotplug();
        assert!(matches!(
            directory.watch(1, 2),
            Err(TransportError::HotplugUnavailable(_))
        ));
    }

    #[test]
    #[ignore] // Requires hidapi backend
    fn test_list_all() {
        let devices = HidDirectory::list_all(None, None).unwrap();
        for device in devices {
            println!("{}", device);
        }
    }
}
