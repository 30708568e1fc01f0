//! Connection manager
//!
//! Owns at most one open device handle and runs the connect/retry state
//! machine:
//!
//! ```text
//! Disconnected --begin--> Connecting --open ok--> Connected
//!                          ^   |  no device / open failed: retry after delay
//!                          |   v
//!                          +---+
//! Connected --read error--> Connecting (immediate attempt)
//! any --disconnect--> Disconnected
//! ```
//!
//! Failures are never fatal. They are logged and retried until the session
//! stops. After a hot-plug removal, an attempt that finds no matching device
//! parks the retry loop until a device is added again.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use hidpad_transport::{
    BoxedDirectory, DeviceDescriptor, DeviceHandle, DeviceSpec, DiscoveryEvent, TransportError,
};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::event::GamepadEvent;

/// Connection state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
        }
    }
}

/// First device the spec accepts; no ranking among several matches
pub fn select_candidate(spec: &DeviceSpec, devices: &[DeviceDescriptor]) -> Option<DeviceDescriptor> {
    devices.iter().find(|d| spec.matches(d)).cloned()
}

/// Outcome of one connect attempt
enum Attempt {
    Opened(Box<dyn DeviceHandle>),
    /// Nothing attached matches the spec
    NoCandidate,
    /// A matching device is attached but could not be opened
    OpenFailed(TransportError),
}

/// Find the device and open it
///
/// Must not borrow the manager: its handle is not `Sync`.
async fn open_candidate(directory: &BoxedDirectory, spec: &DeviceSpec) -> Attempt {
    let devices = match directory.find(spec).await {
        Ok(devices) => devices,
        Err(e) => {
            warn!("Device lookup failed: {}", e);
            Vec::new()
        }
    };
    let Some(candidate) = select_candidate(spec, &devices) else {
        return Attempt::NoCandidate;
    };

    match directory.open(&candidate).await {
        Ok(handle) => Attempt::Opened(handle),
        Err(e) => {
            warn!("Failed to open {}: {}. Maybe the device is in use", candidate.path, e);
            Attempt::OpenFailed(e)
        }
    }
}

pub struct ConnectionManager {
    directory: BoxedDirectory,
    spec: DeviceSpec,
    retry_delay: Duration,
    /// Set by the session when it is told to stop; an attempt in flight
    /// releases whatever it opened and reports nothing
    cancelled: Arc<AtomicBool>,
    state: ConnectionState,
    handle: Option<Box<dyn DeviceHandle>>,
    retry_at: Option<Instant>,
    /// A removal was seen and no add or successful connect since
    device_absent: bool,
}

impl ConnectionManager {
    pub fn new(
        directory: BoxedDirectory,
        spec: DeviceSpec,
        retry_delay: Duration,
        cancelled: Arc<AtomicBool>,
    ) -> Self {
        Self {
            directory,
            spec,
            retry_delay,
            cancelled,
            state: ConnectionState::Disconnected,
            handle: None,
            retry_at: None,
            device_absent: false,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    /// When the next connect attempt is due
    pub fn retry_deadline(&self) -> Option<Instant> {
        self.retry_at
    }

    /// Leave `Disconnected` and attempt a connection right away
    pub fn begin(&mut self) {
        if self.state == ConnectionState::Disconnected {
            self.state = ConnectionState::Connecting;
            self.retry_at = Some(Instant::now());
        }
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// One connect attempt
    ///
    /// Returns `Connected` on success. On failure a retry is scheduled,
    /// unless a removal was seen and the lookup confirms nothing matching is
    /// attached any more.
    pub async fn connect(&mut self) -> Option<GamepadEvent> {
        self.retry_at = None;
        if self.state != ConnectionState::Connecting || self.is_cancelled() {
            return None;
        }

        let attempt = open_candidate(&self.directory, &self.spec).await;
        if self.is_cancelled() {
            if let Attempt::Opened(mut handle) = attempt {
                debug!("Stop requested while connecting, releasing device");
                handle.close();
            }
            return None;
        }

        match attempt {
            Attempt::Opened(handle) => {
                info!("Connected to {}", handle.descriptor());
                self.handle = Some(handle);
                self.state = ConnectionState::Connected;
                self.device_absent = false;
                Some(GamepadEvent::Connected)
            }
            Attempt::NoCandidate if self.device_absent => {
                info!("{} unplugged, waiting for it to be added", self.spec);
                None
            }
            Attempt::NoCandidate => {
                debug!("No {} attached, retrying in {:?}", self.spec, self.retry_delay);
                self.retry_at = Some(Instant::now() + self.retry_delay);
                None
            }
            Attempt::OpenFailed(e) => {
                debug!("Connect failed ({}), retrying in {:?}", e, self.retry_delay);
                self.retry_at = Some(Instant::now() + self.retry_delay);
                None
            }
        }
    }

    /// Wait for the next input report; pending forever without a handle
    ///
    /// Cancel-safe.
    pub async fn next_report(&mut self) -> Result<Vec<u8>, TransportError> {
        match self.handle.as_mut() {
            Some(handle) => handle.read_report().await,
            None => std::future::pending().await,
        }
    }

    /// The open handle failed: release it and reconnect immediately
    pub fn handle_read_error(&mut self, error: TransportError) -> Option<GamepadEvent> {
        let mut handle = self.handle.take()?;
        if error.is_disconnect() {
            info!("{} went away: {}", handle.descriptor(), error);
        } else {
            warn!("Lost {}: {}", handle.descriptor(), error);
        }
        handle.close();
        self.state = ConnectionState::Connecting;
        self.retry_at = Some(Instant::now());
        Some(GamepadEvent::Disconnected)
    }

    /// React to an add/remove notification
    pub fn handle_hotplug(&mut self, event: &DiscoveryEvent) {
        if !self.spec.matches_notification(event.descriptor()) {
            return;
        }
        match event {
            // Other matching units may still be attached: the next attempt
            // decides whether to park
            DiscoveryEvent::DeviceRemoved(device) => {
                debug!("Removed: {}", device);
                self.device_absent = true;
            }
            DiscoveryEvent::DeviceAdded(device) => {
                debug!("Added: {}", device);
                self.device_absent = false;
                if self.state == ConnectionState::Connecting {
                    self.retry_at = Some(Instant::now());
                }
            }
        }
    }

    /// Write an output report; dropped unless connected
    pub fn write(&self, report: &[u8]) -> bool {
        let Some(handle) = self.handle.as_ref().filter(|_| self.is_connected()) else {
            debug!("Output report dropped, not connected");
            return false;
        };
        match handle.write_report(report) {
            Ok(_) => true,
            Err(e) => {
                warn!("Output report write failed: {}", e);
                false
            }
        }
    }

    /// Cancel pending retries and close the handle
    ///
    /// Returns `Disconnected` if a device was open. Safe in any state.
    pub fn disconnect(&mut self) -> Option<GamepadEvent> {
        self.retry_at = None;
        self.state = ConnectionState::Disconnected;
        let mut handle = self.handle.take()?;
        handle.close();
        info!("Disconnected from {}", handle.descriptor());
        Some(GamepadEvent::Disconnected)
    }
}
