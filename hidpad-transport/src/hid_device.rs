//! hidapi-backed device handle
//!
//! Input reports are pulled by a dedicated reader thread and handed to the
//! async side through a bounded channel, so `read_report` is cancel-safe and
//! never blocks the runtime.

use std::ffi::CString;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use async_trait::async_trait;
use hidapi::{HidApi, HidDevice};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::error::TransportError;
use crate::types::DeviceDescriptor;
use crate::DeviceHandle;

/// Largest input report we read in one go
const MAX_REPORT_SIZE: usize = 128;

/// Reports buffered between the reader thread and the session
const REPORT_CHANNEL_CAPACITY: usize = 256;

type ReportResult = Result<Vec<u8>, TransportError>;

/// Configuration for the report reader loop
#[derive(Debug, Clone)]
pub struct ReaderConfig {
    /// Read timeout in milliseconds (for checking the shutdown flag when idle)
    pub read_timeout_ms: i32,
    /// Thread name, also used as log prefix
    pub name: String,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            read_timeout_ms: 5,
            name: "hid-report-reader".into(),
        }
    }
}

/// Open HID device with a background reader
pub struct HidHandle {
    device: Arc<Mutex<HidDevice>>,
    descriptor: DeviceDescriptor,
    reports: mpsc::Receiver<ReportResult>,
    shutdown: Arc<AtomicBool>,
    reader: Option<JoinHandle<()>>,
}

impl HidHandle {
    /// Open the device at the descriptor's path and start reading
    pub fn open(
        api: &HidApi,
        descriptor: DeviceDescriptor,
        config: ReaderConfig,
    ) -> Result<Self, TransportError> {
        let path = CString::new(descriptor.path.as_str())
            .map_err(|e| TransportError::Internal(format!("bad device path: {e}")))?;
        let device = api.open_path(&path)?;
        Self::from_device(device, descriptor, config)
    }

    /// Wrap an already opened device
    pub fn from_device(
        device: HidDevice,
        descriptor: DeviceDescriptor,
        config: ReaderConfig,
    ) -> Result<Self, TransportError> {
        let device = Arc::new(Mutex::new(device));
        let shutdown = Arc::new(AtomicBool::new(false));
        let (tx, reports) = mpsc::channel(REPORT_CHANNEL_CAPACITY);

        let reader = std::thread::Builder::new()
            .name(config.name.clone())
            .spawn({
                let device = Arc::clone(&device);
                let shutdown = Arc::clone(&shutdown);
                move || run_report_reader_loop(device, tx, shutdown, config)
            })
            .map_err(|e| TransportError::Internal(format!("spawning reader thread: {e}")))?;

        Ok(Self {
            device,
            descriptor,
            reports,
            shutdown,
            reader: Some(reader),
        })
    }
}

#[async_trait]
impl DeviceHandle for HidHandle {
    async fn read_report(&mut self) -> Result<Vec<u8>, TransportError> {
        match self.reports.recv().await {
            Some(report) => report,
            None => Err(TransportError::Disconnected),
        }
    }

    fn write_report(&self, data: &[u8]) -> Result<usize, TransportError> {
        if self.shutdown.load(Ordering::Relaxed) {
            return Err(TransportError::Disconnected);
        }
        trace!("Writing output report: {:02X?}", data);
        Ok(self.device.lock().write(data)?)
    }

    fn close(&mut self) {
        if self.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        self.reports.close();
        // The reader notices the flag within one read timeout; joining here
        // would stall the caller for that long, so the thread is detached.
        if let Some(reader) = self.reader.take() {
            debug!(
                "Closed {} (reader finished: {})",
                self.descriptor.path,
                reader.is_finished()
            );
        }
    }

    fn descriptor(&self) -> &DeviceDescriptor {
        &self.descriptor
    }
}

impl Drop for HidHandle {
    fn drop(&mut self) {
        self.close();
    }
}

/// Read input reports until shutdown, a read error, or the receiver is gone
///
/// A read error is forwarded once and ends the loop: the session treats it
/// as the device going away.
fn run_report_reader_loop(
    device: Arc<Mutex<HidDevice>>,
    tx: mpsc::Sender<ReportResult>,
    shutdown: Arc<AtomicBool>,
    config: ReaderConfig,
) {
    debug!("{} started", config.name);
    let mut buf = [0u8; MAX_REPORT_SIZE];

    while !shutdown.load(Ordering::Relaxed) {
        // Short timeout only bounds how long the lock is held when idle
        let result = device.lock().read_timeout(&mut buf, config.read_timeout_ms);
        match result {
            Ok(0) => {}
            Ok(len) => {
                trace!("{} got {} bytes: {:02X?}", config.name, len, &buf[..len.min(16)]);
                if tx.blocking_send(Ok(buf[..len].to_vec())).is_err() {
                    break;
                }
            }
            Err(e) => {
                warn!("{} read error: {}", config.name, e);
                if tx.blocking_send(Err(e.into())).is_err() {
                    debug!("{} error not delivered, receiver closed", config.name);
                }
                break;
            }
        }
    }

    debug!("{} exiting", config.name);
}
