//! Hot-plug notification
//!
//! A [`HotplugMonitor`] is shared by every session using the same directory.
//! The OS source runs only while at least one [`HotplugRegistration`] is
//! alive: the first registration starts it and dropping the last one stops
//! it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::error::TransportError;
use crate::types::DiscoveryEvent;

/// Hot-plug events buffered per subscriber
const HOTPLUG_CHANNEL_CAPACITY: usize = 32;

/// Something that can publish add/remove notifications
pub trait HotplugSource: Send + Sync {
    /// Start publishing into `tx` until `shutdown` is set
    fn start(
        &self,
        tx: broadcast::Sender<DiscoveryEvent>,
        shutdown: Arc<AtomicBool>,
    ) -> Result<(), TransportError>;
}

#[derive(Default)]
struct MonitorState {
    registrations: usize,
    shutdown: Option<Arc<AtomicBool>>,
}

/// Reference-counted hot-plug monitor
pub struct HotplugMonitor {
    tx: broadcast::Sender<DiscoveryEvent>,
    source: Option<Box<dyn HotplugSource>>,
    state: Mutex<MonitorState>,
}

impl HotplugMonitor {
    /// Create a monitor backed by an OS source
    pub fn new(source: Box<dyn HotplugSource>) -> Self {
        Self::with_source(Some(source))
    }

    /// Create a monitor that only relays events passed to [`Self::publish`]
    pub fn manual() -> Self {
        Self::with_source(None)
    }

    fn with_source(source: Option<Box<dyn HotplugSource>>) -> Self {
        let (tx, _) = broadcast::channel(HOTPLUG_CHANNEL_CAPACITY);
        Self {
            tx,
            source,
            state: Mutex::new(MonitorState::default()),
        }
    }

    /// Take a reference on the monitor, starting the source if it is idle
    ///
    /// The source is started without holding the state lock, so a slow
    /// source does not block other registrations or queries.
    pub fn register(self: &Arc<Self>) -> Result<HotplugRegistration, TransportError> {
        let start = {
            let mut state = self.state.lock();
            state.registrations += 1;
            debug!("Hot-plug registrations: {}", state.registrations);
            state.registrations == 1 && state.shutdown.is_none()
        };
        // Counted from here on; dropping it undoes the increment on error
        let registration = HotplugRegistration {
            monitor: Arc::clone(self),
        };

        if let (true, Some(source)) = (start, &self.source) {
            let shutdown = Arc::new(AtomicBool::new(false));
            source.start(self.tx.clone(), Arc::clone(&shutdown))?;
            let mut state = self.state.lock();
            match state.shutdown.replace(shutdown) {
                // Raced with another first registration; keep one source
                Some(previous) => previous.store(true, Ordering::SeqCst),
                None => info!("Hot-plug monitoring started"),
            }
        }
        Ok(registration)
    }

    fn deregister(&self) {
        let mut state = self.state.lock();
        state.registrations = state.registrations.saturating_sub(1);
        debug!("Hot-plug registrations: {}", state.registrations);
        if state.registrations == 0 {
            if let Some(shutdown) = state.shutdown.take() {
                shutdown.store(true, Ordering::SeqCst);
                info!("Hot-plug monitoring stopped");
            }
        }
    }

    /// Register and receive notifications for one vendor/product id pair
    pub fn subscribe(
        self: &Arc<Self>,
        vendor_id: u16,
        product_id: u16,
    ) -> Result<HotplugSubscription, TransportError> {
        let registration = self.register()?;
        Ok(HotplugSubscription {
            rx: self.tx.subscribe(),
            vendor_id,
            product_id,
            _registration: registration,
        })
    }

    /// Deliver an event to every subscriber
    pub fn publish(&self, event: DiscoveryEvent) {
        // No receivers is fine, nobody is watching
        let _ = self.tx.send(event);
    }

    /// Number of live registrations
    pub fn registrations(&self) -> usize {
        self.state.lock().registrations
    }

    /// Whether the OS source is currently running
    pub fn is_running(&self) -> bool {
        self.state.lock().shutdown.is_some()
    }
}

/// Keeps the monitor's source alive; dropping it deregisters
pub struct HotplugRegistration {
    monitor: Arc<HotplugMonitor>,
}

impl Drop for HotplugRegistration {
    fn drop(&mut self) {
        self.monitor.deregister();
    }
}

/// Filtered stream of add/remove notifications
pub struct HotplugSubscription {
    rx: broadcast::Receiver<DiscoveryEvent>,
    vendor_id: u16,
    product_id: u16,
    _registration: HotplugRegistration,
}

impl HotplugSubscription {
    /// Wait for the next notification about the subscribed ids
    ///
    /// Returns `None` once the monitor is gone. Cancel-safe.
    pub async fn next(&mut self) -> Option<DiscoveryEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => {
                    let device = event.descriptor();
                    if device.vendor_id == self.vendor_id && device.product_id == self.product_id
                    {
                        return Some(event);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Hot-plug subscriber lagged, {} events skipped", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

#[cfg(all(target_os = "linux", feature = "hotplug"))]
pub use udev_source::UdevHotplugSource;

#[cfg(all(target_os = "linux", feature = "hotplug"))]
mod udev_source {
    use std::ffi::OsStr;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::mpsc as std_mpsc;
    use std::sync::Arc;
    use std::time::Duration;

    use futures::StreamExt;
    use tokio::sync::broadcast;
    use tokio_udev::{AsyncMonitorSocket, EventType, MonitorBuilder};
    use tracing::{debug, trace, warn};

    use super::HotplugSource;
    use crate::error::TransportError;
    use crate::types::{DeviceDescriptor, DiscoveryEvent};

    /// How often the monitor thread checks its shutdown flag when idle
    const SHUTDOWN_POLL: Duration = Duration::from_millis(100);

    /// udev monitor on USB device add/remove
    #[derive(Debug, Default)]
    pub struct UdevHotplugSource;

    impl HotplugSource for UdevHotplugSource {
        fn start(
            &self,
            tx: broadcast::Sender<DiscoveryEvent>,
            shutdown: Arc<AtomicBool>,
        ) -> Result<(), TransportError> {
            // udev sockets are not Send, so they are created on the monitor
            // thread and the setup result is reported back.
            let (ready_tx, ready_rx) = std_mpsc::channel();
            std::thread::Builder::new()
                .name("udev-hotplug".into())
                .spawn(move || run_monitor_thread(tx, shutdown, ready_tx))
                .map_err(|e| TransportError::HotplugUnavailable(e.to_string()))?;

            match ready_rx.recv() {
                Ok(result) => result,
                Err(_) => Err(TransportError::HotplugUnavailable(
                    "monitor thread exited during setup".into(),
                )),
            }
        }
    }

    fn run_monitor_thread(
        tx: broadcast::Sender<DiscoveryEvent>,
        shutdown: Arc<AtomicBool>,
        ready: std_mpsc::Sender<Result<(), TransportError>>,
    ) {
        let runtime = match tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
        {
            Ok(rt) => rt,
            Err(e) => {
                let _ = ready.send(Err(TransportError::HotplugUnavailable(e.to_string())));
                return;
            }
        };

        runtime.block_on(async move {
            let socket = MonitorBuilder::new()
                .and_then(|b| b.match_subsystem_devtype("usb", "usb_device"))
                .and_then(|b| b.listen())
                .and_then(AsyncMonitorSocket::new);
            let mut socket = match socket {
                Ok(socket) => {
                    let _ = ready.send(Ok(()));
                    socket
                }
                Err(e) => {
                    let _ = ready.send(Err(TransportError::HotplugUnavailable(e.to_string())));
                    return;
                }
            };

            debug!("udev hot-plug monitor running");
            let mut ticker = tokio::time::interval(SHUTDOWN_POLL);
            while !shutdown.load(Ordering::Relaxed) {
                tokio::select! {
                    event = socket.next() => match event {
                        Some(Ok(event)) => {
                            let device = event.device();
                            let Some(descriptor) = descriptor_from_udev(&device) else {
                                continue;
                            };
                            let notification = match event.event_type() {
                                EventType::Add => DiscoveryEvent::DeviceAdded(descriptor),
                                EventType::Remove => DiscoveryEvent::DeviceRemoved(descriptor),
                                _ => continue,
                            };
                            trace!("udev: {:?}", notification);
                            let _ = tx.send(notification);
                        }
                        Some(Err(e)) => warn!("udev monitor error: {}", e),
                        None => break,
                    },
                    _ = ticker.tick() => {}
                }
            }
            debug!("udev hot-plug monitor exiting");
        });
    }

    fn descriptor_from_udev(device: &tokio_udev::Device) -> Option<DeviceDescriptor> {
        let product = device.property_value("PRODUCT")?;
        let (vendor_id, product_id) = parse_product_property(product)?;
        let serial_number = device
            .property_value("ID_SERIAL_SHORT")
            .map(|s| s.to_string_lossy().into_owned());
        Some(DeviceDescriptor {
            vendor_id,
            product_id,
            serial_number,
            path: device.syspath().to_string_lossy().into_owned(),
            product_name: device
                .property_value("ID_MODEL")
                .map(|s| s.to_string_lossy().into_owned()),
        })
    }

    /// Parse the kernel's `PRODUCT=vid/pid/bcd` value (unpadded hex)
    pub(super) fn parse_product_property(value: &OsStr) -> Option<(u16, u16)> {
        let value = value.to_str()?;
        let mut parts = value.split('/');
        let vendor_id = u16::from_str_radix(parts.next()?, 16).ok()?;
        let product_id = u16::from_str_radix(parts.next()?, 16).ok()?;
        Some((vendor_id, product_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DeviceDescriptor;
    use std::sync::Weak;

    struct CountingSource {
        started: Arc<Mutex<Vec<Arc<AtomicBool>>>>,
    }

    impl HotplugSource for CountingSource {
        fn start(
            &self,
            _tx: broadcast::Sender<DiscoveryEvent>,
            shutdown: Arc<AtomicBool>,
        ) -> Result<(), TransportError> {
            self.started.lock().push(shutdown);
            Ok(())
        }
    }

    fn device(vendor_id: u16, product_id: u16) -> DeviceDescriptor {
        DeviceDescriptor {
            vendor_id,
            product_id,
            serial_number: None,
            path: "usb1/1-1".into(),
            product_name: None,
        }
    }

    #[test]
    fn test_source_runs_while_registered() {
        let started = Arc::new(Mutex::new(Vec::new()));
        let monitor = Arc::new(HotplugMonitor::new(Box::new(CountingSource {
            started: Arc::clone(&started),
        })));

        let first = monitor.register().unwrap();
        let second = monitor.register().unwrap();
        assert_eq!(started.lock().len(), 1);
        assert_eq!(monitor.registrations(), 2);
        assert!(monitor.is_running());

        drop(first);
        assert!(monitor.is_running());
        let flag = Arc::clone(&started.lock()[0]);
        assert!(!flag.load(Ordering::SeqCst));

        drop(second);
        assert!(!monitor.is_running());
        assert!(flag.load(Ordering::SeqCst));

        // A later registration starts a fresh source
        let _third = monitor.register().unwrap();
        assert_eq!(started.lock().len(), 2);
    }

    /// Queries the monitor it belongs to from inside `start`
    struct ReentrantSource {
        monitor: Arc<Mutex<Weak<HotplugMonitor>>>,
        seen: Arc<Mutex<Option<usize>>>,
    }

    impl HotplugSource for ReentrantSource {
        fn start(
            &self,
            _tx: broadcast::Sender<DiscoveryEvent>,
            _shutdown: Arc<AtomicBool>,
        ) -> Result<(), TransportError> {
            if let Some(monitor) = self.monitor.lock().upgrade() {
                *self.seen.lock() = Some(monitor.registrations());
            }
            Ok(())
        }
    }

    struct FailingSource;

    impl HotplugSource for FailingSource {
        fn start(
            &self,
            _tx: broadcast::Sender<DiscoveryEvent>,
            _shutdown: Arc<AtomicBool>,
        ) -> Result<(), TransportError> {
            Err(TransportError::HotplugUnavailable("no udev".into()))
        }
    }

    #[test]
    fn test_source_starts_outside_state_lock() {
        let slot = Arc::new(Mutex::new(Weak::new()));
        let seen = Arc::new(Mutex::new(None));
        let monitor = Arc::new(HotplugMonitor::new(Box::new(ReentrantSource {
            monitor: Arc::clone(&slot),
            seen: Arc::clone(&seen),
        })));
        *slot.lock() = Arc::downgrade(&monitor);

        let _registration = monitor.register().unwrap();
        assert_eq!(*seen.lock(), Some(1));
        assert!(monitor.is_running());
    }

    #[test]
    fn test_failed_start_is_not_counted() {
        let monitor = Arc::new(HotplugMonitor::new(Box::new(FailingSource)));
        assert!(matches!(
            monitor.register(),
            Err(TransportError::HotplugUnavailable(_))
        ));
        assert_eq!(monitor.registrations(), 0);
        assert!(!monitor.is_running());
    }

    #[tokio::test]
    async fn test_subscription_filters_by_ids() {
        let monitor = Arc::new(HotplugMonitor::manual());
        let mut sub = monitor.subscribe(0x054C, 0x05C4).unwrap();

        monitor.publish(DiscoveryEvent::DeviceAdded(device(0x046D, 0xC216)));
        monitor.publish(DiscoveryEvent::DeviceRemoved(device(0x054C, 0x05C4)));

        let event = sub.next().await.unwrap();
        assert_eq!(
            event,
            DiscoveryEvent::DeviceRemoved(device(0x054C, 0x05C4))
        );
        assert_eq!(monitor.registrations(), 1);
        drop(sub);
        assert_eq!(monitor.registrations(), 0);
    }

    #[cfg(all(target_os = "linux", feature = "hotplug"))]
    #[test]
    fn test_parse_product_property() {
        use std::ffi::OsStr;
        assert_eq!(
            udev_source::parse_product_property(OsStr::new("54c/5c4/100")),
            Some((0x054C, 0x05C4))
        );
        assert_eq!(udev_source::parse_product_property(OsStr::new("zz/1")), None);
    }
}
