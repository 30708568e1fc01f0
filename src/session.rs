//! Gamepad session
//!
//! A [`Session`] binds one device spec to a field layout. While running, a
//! single worker task owns the connection, the decoder and the rumble
//! scheduler, so reports, reconnects and rumble timers are handled one at a
//! time in the order they become ready.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use hidpad_transport::{BoxedDirectory, DiscoveryEvent, HotplugSubscription};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::config::{ConfigError, SessionConfig};
use crate::connection::{ConnectionManager, ConnectionState};
use crate::decoder::{DecodedState, FrameDecoder};
use crate::event::{EventSelector, GamepadEvent};
use crate::rumble::{strategy_for, RumbleScheduler, RumbleStrategy};

/// Events buffered per subscriber before it lags
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Session errors
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Session must be started from within a tokio runtime")]
    NoRuntime,
}

enum Command {
    Rumble {
        duration: Duration,
        requested_at: Instant,
    },
    Stop,
}

struct RunningWorker {
    commands: mpsc::UnboundedSender<Command>,
    stop_requested: Arc<AtomicBool>,
    task: JoinHandle<FrameDecoder>,
}

impl RunningWorker {
    fn request_stop(&self) {
        self.stop_requested.store(true, Ordering::SeqCst);
        // The worker may already be gone
        let _ = self.commands.send(Command::Stop);
    }
}

/// Live session with one game controller
pub struct Session {
    config: SessionConfig,
    directory: BoxedDirectory,
    strategy: Arc<dyn RumbleStrategy>,
    events: broadcast::Sender<GamepadEvent>,
    state: Arc<watch::Sender<DecodedState>>,
    connection: Arc<watch::Sender<ConnectionState>>,
    /// Decoder kept between runs so field state survives a restart
    decoder: Option<FrameDecoder>,
    worker: Option<RunningWorker>,
}

impl Session {
    /// Create a stopped session; the config must validate
    pub fn new(config: SessionConfig, directory: BoxedDirectory) -> Result<Self, ConfigError> {
        config.validate()?;
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (state, _) = watch::channel(DecodedState::default());
        let (connection, _) = watch::channel(ConnectionState::Disconnected);
        Ok(Self {
            strategy: strategy_for(config.rumble),
            decoder: Some(FrameDecoder::new(config.fields.clone())),
            config,
            directory,
            events,
            state: Arc::new(state),
            connection: Arc::new(connection),
            worker: None,
        })
    }

    /// Replace the rumble encoding chosen by the config's profile
    ///
    /// Takes effect on the next `start()`.
    pub fn with_rumble_strategy(mut self, strategy: Arc<dyn RumbleStrategy>) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.worker.is_some()
    }

    /// Start connecting; does nothing if already running
    pub fn start(&mut self) -> Result<(), SessionError> {
        if self.worker.is_some() {
            return Ok(());
        }
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| SessionError::NoRuntime)?;

        let spec = &self.config.device;
        let hotplug = match self.directory.watch(spec.vendor_id, spec.product_id) {
            Ok(subscription) => Some(subscription),
            Err(e) => {
                info!("{}; relying on retry timer", e);
                None
            }
        };

        let stop_requested = Arc::new(AtomicBool::new(false));
        let (commands, command_rx) = mpsc::unbounded_channel();
        let decoder = self
            .decoder
            .take()
            .unwrap_or_else(|| FrameDecoder::new(self.config.fields.clone()));

        let worker = Worker {
            connection: ConnectionManager::new(
                Arc::clone(&self.directory),
                spec.clone(),
                self.config.connection.retry_delay(),
                Arc::clone(&stop_requested),
            ),
            decoder,
            rumble: RumbleScheduler::new(Arc::clone(&self.strategy)),
            hotplug,
            commands: command_rx,
            events: self.events.clone(),
            state: Arc::clone(&self.state),
            connection_state: Arc::clone(&self.connection),
            finished: false,
        };

        info!("Session started for {}", spec);
        self.worker = Some(RunningWorker {
            commands,
            stop_requested,
            task: runtime.spawn(worker.run()),
        });
        Ok(())
    }

    /// Stop the session and wait until the device is released
    ///
    /// Cancels pending retries and rumble timers, writes the rumble disable
    /// report if a pulse is running, closes the device and releases the
    /// hot-plug subscription. Does nothing if not running.
    pub async fn stop(&mut self) {
        let Some(worker) = self.worker.take() else {
            return;
        };
        worker.request_stop();
        match worker.task.await {
            Ok(decoder) => self.decoder = Some(decoder),
            Err(e) => warn!("Session worker ended abnormally: {}", e),
        }
        info!("Session stopped");
    }

    /// Vibrate for `duration`
    ///
    /// Dropped when no device is connected; a later connection does not
    /// replay it.
    pub fn rumble(&self, duration: Duration) {
        match &self.worker {
            Some(worker) => {
                let _ = worker.commands.send(Command::Rumble {
                    duration,
                    requested_at: Instant::now(),
                });
            }
            None => debug!("Rumble dropped, session not running"),
        }
    }

    /// Receive every event from now on
    pub fn subscribe(&self) -> broadcast::Receiver<GamepadEvent> {
        self.events.subscribe()
    }

    /// Call `callback` for each event the selector matches
    ///
    /// The listener runs until the session is dropped or the returned task
    /// is aborted.
    pub fn on<F>(
        &self,
        selector: EventSelector,
        mut callback: F,
    ) -> Result<JoinHandle<()>, SessionError>
    where
        F: FnMut(GamepadEvent) + Send + 'static,
    {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| SessionError::NoRuntime)?;
        let mut rx = self.events.subscribe();
        Ok(runtime.spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) if selector.matches(&event) => callback(event),
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("Event listener lagged, {} events skipped", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }))
    }

    /// Latest decoded snapshot
    pub fn state(&self) -> DecodedState {
        self.state.borrow().clone()
    }

    /// Receiver notified after each processed report
    pub fn watch_state(&self) -> watch::Receiver<DecodedState> {
        self.state.subscribe()
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.connection.borrow()
    }

    pub fn watch_connection(&self) -> watch::Receiver<ConnectionState> {
        self.connection.subscribe()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        // The worker tears down when it sees the stop, or when the runtime
        // drops it without polling it again
        if let Some(worker) = self.worker.take() {
            worker.request_stop();
        }
    }
}

struct Worker {
    connection: ConnectionManager,
    decoder: FrameDecoder,
    rumble: RumbleScheduler,
    hotplug: Option<HotplugSubscription>,
    commands: mpsc::UnboundedReceiver<Command>,
    events: broadcast::Sender<GamepadEvent>,
    state: Arc<watch::Sender<DecodedState>>,
    connection_state: Arc<watch::Sender<ConnectionState>>,
    /// Set once the device is released
    finished: bool,
}

impl Worker {
    async fn run(mut self) -> FrameDecoder {
        self.connection.begin();
        self.publish_connection_state();

        loop {
            let retry_at = self.connection.retry_deadline();
            let rumble_at = self.rumble.deadline();

            tokio::select! {
                biased;

                command = self.commands.recv() => match command {
                    Some(Command::Rumble { duration, requested_at }) => {
                        let connected = self.connection.is_connected();
                        if let Some(report) = self.rumble.request(requested_at, duration, connected) {
                            self.connection.write(&report);
                        }
                    }
                    Some(Command::Stop) | None => break,
                },

                _ = sleep_until_deadline(rumble_at) => {
                    if let Some(report) = self.rumble.expire(Instant::now()) {
                        self.connection.write(&report);
                    }
                }

                notification = next_hotplug(&mut self.hotplug) => match notification {
                    Some(event) => self.connection.handle_hotplug(&event),
                    None => {
                        debug!("Hot-plug monitor closed");
                        self.hotplug = None;
                    }
                },

                report = self.connection.next_report() => match report {
                    Ok(report) => self.process_report(&report),
                    Err(e) => {
                        self.rumble.clear();
                        if let Some(event) = self.connection.handle_read_error(e) {
                            self.emit(event);
                        }
                    }
                },

                _ = sleep_until_deadline(retry_at) => {
                    if let Some(event) = self.connection.connect().await {
                        self.emit(event);
                    }
                }
            }

            self.publish_connection_state();
        }

        self.shutdown();
        self.decoder.clone()
    }

    fn process_report(&mut self, report: &[u8]) {
        trace!("Report: {:02X?}", report);
        let events = self.decoder.process(report);
        // Snapshot first, so subscribers never see events ahead of state
        self.state.send_replace(self.decoder.state().clone());
        for event in events {
            self.emit(event);
        }
    }

    /// Turn rumble off, close the device and release the hot-plug
    /// subscription. Runs once.
    fn shutdown(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        if let Some(report) = self.rumble.cancel() {
            self.connection.write(&report);
        }
        let disconnected = self.connection.disconnect();
        self.publish_connection_state();
        if let Some(event) = disconnected {
            self.emit(event);
        }
        // Releases the hot-plug registration
        self.hotplug = None;
    }

    fn emit(&self, event: GamepadEvent) {
        debug!("Event: {}", event);
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    fn publish_connection_state(&self) {
        let state = self.connection.state();
        self.connection_state.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        });
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        if !self.finished {
            debug!("Session worker dropped while running, releasing device");
            self.shutdown();
        }
    }
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn next_hotplug(subscription: &mut Option<HotplugSubscription>) -> Option<DiscoveryEvent> {
    match subscription {
        Some(subscription) => subscription.next().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FieldConfig;
    use async_trait::async_trait;
    use hidpad_transport::{
        DeviceDescriptor, DeviceDirectory, DeviceHandle, DeviceSpec, TransportError,
    };

    struct NoDevices;

    #[async_trait]
    impl DeviceDirectory for NoDevices {
        async fn find(&self, _spec: &DeviceSpec) -> Result<Vec<DeviceDescriptor>, TransportError> {
            Ok(Vec::new())
        }

        async fn open(
            &self,
            device: &DeviceDescriptor,
        ) -> Result<Box<dyn DeviceHandle>, TransportError> {
            Err(TransportError::DeviceNotFound(device.path.clone()))
        }
    }

    fn config() -> SessionConfig {
        SessionConfig::new(
            DeviceSpec::new(0x054C, 0x05C4),
            vec![FieldConfig::Scale {
                name: "l2".into(),
                pin: 8,
            }],
        )
    }

    #[test]
    fn test_new_rejects_duplicate_fields() {
        let mut config = config();
        config.fields.push(config.fields[0].clone());
        assert!(matches!(
            Session::new(config, Arc::new(NoDevices)),
            Err(ConfigError::DuplicateField(_))
        ));
    }

    #[test]
    fn test_start_needs_runtime() {
        let mut session = Session::new(config(), Arc::new(NoDevices)).unwrap();
        assert!(matches!(session.start(), Err(SessionError::NoRuntime)));
        assert!(!session.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_is_idempotent() {
        let mut session = Session::new(config(), Arc::new(NoDevices)).unwrap();
        session.start().unwrap();
        session.start().unwrap();
        assert!(session.is_running());

        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(session.connection_state(), ConnectionState::Connecting);

        session.stop().await;
        assert!(!session.is_running());
        assert_eq!(session.connection_state(), ConnectionState::Disconnected);
    }
}
