//! Common types for the transport layer

use std::fmt;

use serde::{Deserialize, Serialize};

/// Identity of the controller a session is bound to
///
/// Matching is by USB vendor/product id, narrowed to an exact serial number
/// when one is given.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceSpec {
    /// USB Vendor ID
    pub vendor_id: u16,
    /// USB Product ID
    pub product_id: u16,
    /// Serial number, if a specific unit is wanted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub serial_number: Option<String>,
}

impl DeviceSpec {
    pub fn new(vendor_id: u16, product_id: u16) -> Self {
        Self {
            vendor_id,
            product_id,
            serial_number: None,
        }
    }

    /// Restrict matching to one serial number
    pub fn with_serial(mut self, serial: impl Into<String>) -> Self {
        self.serial_number = Some(serial.into());
        self
    }

    /// Check vendor/product ids only
    pub fn matches_ids(&self, vendor_id: u16, product_id: u16) -> bool {
        self.vendor_id == vendor_id && self.product_id == product_id
    }

    /// Check whether an enumerated device is the one this spec targets
    ///
    /// With a serial number set, only an exact serial match counts.
    pub fn matches(&self, device: &DeviceDescriptor) -> bool {
        if !self.matches_ids(device.vendor_id, device.product_id) {
            return false;
        }
        match &self.serial_number {
            Some(wanted) => device.serial_number.as_deref() == Some(wanted.as_str()),
            None => true,
        }
    }

    /// Looser check for hot-plug notifications, which may lack a serial
    pub fn matches_notification(&self, device: &DeviceDescriptor) -> bool {
        if !self.matches_ids(device.vendor_id, device.product_id) {
            return false;
        }
        match (&self.serial_number, &device.serial_number) {
            (Some(wanted), Some(actual)) => wanted == actual,
            _ => true,
        }
    }
}

impl fmt::Display for DeviceSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04X}:{:04X}", self.vendor_id, self.product_id)?;
        if let Some(serial) = &self.serial_number {
            write!(f, " (serial {serial})")?;
        }
        Ok(())
    }
}

/// An attached device that can be opened
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceDescriptor {
    /// USB Vendor ID
    pub vendor_id: u16,
    /// USB Product ID
    pub product_id: u16,
    /// Serial number if available
    pub serial_number: Option<String>,
    /// Platform path used to open the device
    pub path: String,
    /// Product name if available
    pub product_name: Option<String>,
}

impl fmt::Display for DeviceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:04X}:{:04X} {}",
            self.vendor_id,
            self.product_id,
            self.product_name.as_deref().unwrap_or("Unknown")
        )?;
        if let Some(serial) = &self.serial_number {
            write!(f, " [{serial}]")?;
        }
        write!(f, " at {}", self.path)
    }
}

/// Hot-plug notifications
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryEvent {
    /// A device was attached
    DeviceAdded(DeviceDescriptor),
    /// A device was detached
    DeviceRemoved(DeviceDescriptor),
}

impl DiscoveryEvent {
    /// The device the notification is about
    pub fn descriptor(&self) -> &DeviceDescriptor {
        match self {
            Self::DeviceAdded(d) | Self::DeviceRemoved(d) => d,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(serial: Option<&str>) -> DeviceDescriptor {
        DeviceDescriptor {
            vendor_id: 0x054C,
            product_id: 0x05C4,
            serial_number: serial.map(str::to_string),
            path: "/dev/hidraw0".into(),
            product_name: None,
        }
    }

    #[test]
    fn test_spec_without_serial_matches_any_unit() {
        let spec = DeviceSpec::new(0x054C, 0x05C4);
        assert!(spec.matches(&descriptor(None)));
        assert!(spec.matches(&descriptor(Some("abc"))));
        assert!(!DeviceSpec::new(0x054C, 0x09CC).matches(&descriptor(None)));
    }

    #[test]
    fn test_spec_with_serial_requires_exact_match() {
        let spec = DeviceSpec::new(0x054C, 0x05C4).with_serial("abc");
        assert!(spec.matches(&descriptor(Some("abc"))));
        assert!(!spec.matches(&descriptor(Some("abd"))));
        assert!(!spec.matches(&descriptor(None)));
    }

    #[test]
    fn test_notifications_without_serial_still_match() {
        let spec = DeviceSpec::new(0x054C, 0x05C4).with_serial("abc");
        assert!(spec.matches_notification(&descriptor(None)));
        assert!(!spec.matches_notification(&descriptor(Some("xyz"))));
    }

    #[test]
    fn test_spec_display() {
        let spec = DeviceSpec::new(0x046D, 0xC216);
        assert_eq!(spec.to_string(), "046D:C216");
        assert_eq!(spec.with_serial("X1").to_string(), "046D:C216 (serial X1)");
    }
}
