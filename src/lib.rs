//! HID gamepad sessions
//!
//! Keeps a game controller connected across unplug/replug, decodes its raw
//! input reports into named fields, emits edge-triggered events and drives
//! rumble pulses.

pub mod config;
pub mod connection;
pub mod decoder;
pub mod event;
pub mod predicate;
pub mod presets;
pub mod rumble;
pub mod session;

pub use config::{
    ConfigError, ConnectionSettings, FieldConfig, RumbleProfile, SessionConfig, StatusState,
};
pub use connection::{ConnectionManager, ConnectionState};
pub use decoder::{decode, DecodedState, FieldValue, FrameDecoder};
pub use event::{EventKind, EventSelector, GamepadEvent};
pub use predicate::{Predicate, PredicateError};
pub use rumble::{DualShock4Rumble, NoRumble, RumblePulse, RumbleScheduler, RumbleStrategy};
pub use session::{Session, SessionError};

pub use hidpad_transport::{
    DeviceDescriptor, DeviceDirectory, DeviceHandle, DeviceSpec, DiscoveryEvent, HidDirectory,
    TransportError,
};
