//! Transport error types

use thiserror::Error;

/// Errors that can occur while finding, opening or talking to a device
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Device disconnected")]
    Disconnected,

    #[error("HID error: {0}")]
    HidError(String),

    #[error("HID permission denied: {0}")]
    HidPermissionDenied(String),

    #[error("Hot-plug monitoring unavailable: {0}")]
    HotplugUnavailable(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl TransportError {
    /// Whether the error means the open handle is gone for good
    pub fn is_disconnect(&self) -> bool {
        matches!(self, Self::Disconnected | Self::HidError(_))
    }
}

impl From<hidapi::HidError> for TransportError {
    fn from(e: hidapi::HidError) -> Self {
        let msg = e.to_string();
        if msg.contains("Permission denied") || msg.contains("EPERM") {
            TransportError::HidPermissionDenied(msg)
        } else {
            TransportError::HidError(msg)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_permission_errors_are_classified() {
        let err = TransportError::from(hidapi::HidError::HidApiError {
            message: "Permission denied".into(),
        });
        assert!(matches!(err, TransportError::HidPermissionDenied(_)));

        let err = TransportError::from(hidapi::HidError::HidApiError {
            message: "No such device".into(),
        });
        assert!(matches!(err, TransportError::HidError(_)));
        assert!(err.is_disconnect());
    }
}
