//! Session events

use std::fmt;
use std::str::FromStr;

use serde::Serialize;
use thiserror::Error;

/// Everything a session reports to its subscribers
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum GamepadEvent {
    /// A device was opened
    Connected,
    /// The open device was lost or the session stopped
    Disconnected,
    /// Joystick position changed (carries the new position)
    Move { field: String, x: u8, y: u8 },
    /// Button predicate became true
    Press { field: String },
    /// Button predicate became false
    Release { field: String },
    /// Status byte changed
    StatusChange {
        field: String,
        value: u8,
        label: String,
    },
    /// Scale byte changed
    ScaleChange { field: String, value: u8 },
}

/// Event kind without payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Connected,
    Disconnected,
    Move,
    Press,
    Release,
    Change,
}

impl EventKind {
    fn suffix(self) -> &'static str {
        match self {
            EventKind::Connected => "connected",
            EventKind::Disconnected => "disconnected",
            EventKind::Move => "move",
            EventKind::Press => "press",
            EventKind::Release => "release",
            EventKind::Change => "change",
        }
    }
}

impl GamepadEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            GamepadEvent::Connected => EventKind::Connected,
            GamepadEvent::Disconnected => EventKind::Disconnected,
            GamepadEvent::Move { .. } => EventKind::Move,
            GamepadEvent::Press { .. } => EventKind::Press,
            GamepadEvent::Release { .. } => EventKind::Release,
            GamepadEvent::StatusChange { .. } | GamepadEvent::ScaleChange { .. } => {
                EventKind::Change
            }
        }
    }

    /// Field the event belongs to, `None` for lifecycle events
    pub fn field(&self) -> Option<&str> {
        match self {
            GamepadEvent::Connected | GamepadEvent::Disconnected => None,
            GamepadEvent::Move { field, .. }
            | GamepadEvent::Press { field }
            | GamepadEvent::Release { field }
            | GamepadEvent::StatusChange { field, .. }
            | GamepadEvent::ScaleChange { field, .. } => Some(field),
        }
    }

    /// Event name: `connected`, `disconnected` or `<field>:<kind>`
    pub fn name(&self) -> String {
        match self.field() {
            Some(field) => format!("{}:{}", field, self.kind().suffix()),
            None => self.kind().suffix().to_string(),
        }
    }
}

impl fmt::Display for GamepadEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GamepadEvent::Move { field, x, y } => write!(f, "{field}:move x={x} y={y}"),
            GamepadEvent::StatusChange {
                field,
                value,
                label,
            } => write!(f, "{field}:change {label} ({value})"),
            GamepadEvent::ScaleChange { field, value } => write!(f, "{field}:change {value}"),
            _ => f.write_str(&self.name()),
        }
    }
}

/// Error parsing an event name
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid event name '{0}'")]
pub struct InvalidEventName(pub String);

/// Filter for [`crate::Session::on`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventSelector {
    /// Every event (`*`)
    Any,
    /// `connected` or `disconnected`
    Lifecycle(EventKind),
    /// `<field>:<kind>`
    Field { field: String, kind: EventKind },
}

impl EventSelector {
    pub fn matches(&self, event: &GamepadEvent) -> bool {
        match self {
            EventSelector::Any => true,
            EventSelector::Lifecycle(kind) => event.kind() == *kind,
            EventSelector::Field { field, kind } => {
                event.kind() == *kind && event.field() == Some(field.as_str())
            }
        }
    }
}

impl FromStr for EventSelector {
    type Err = InvalidEventName;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "*" => return Ok(EventSelector::Any),
            "connected" => return Ok(EventSelector::Lifecycle(EventKind::Connected)),
            "disconnected" => return Ok(EventSelector::Lifecycle(EventKind::Disconnected)),
            _ => {}
        }

        // Field names may contain ':' themselves, the kind is the last segment
        let (field, suffix) = s
            .rsplit_once(':')
            .ok_or_else(|| InvalidEventName(s.to_string()))?;
        let kind = match suffix {
            "move" => EventKind::Move,
            "press" => EventKind::Press,
            "release" => EventKind::Release,
            "change" => EventKind::Change,
            _ => return Err(InvalidEventName(s.to_string())),
        };
        if field.is_empty() {
            return Err(InvalidEventName(s.to_string()));
        }
        Ok(EventSelector::Field {
            field: field.to_string(),
            kind,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_names() {
        assert_eq!(GamepadEvent::Connected.name(), "connected");
        assert_eq!(GamepadEvent::Disconnected.name(), "disconnected");
        let moved = GamepadEvent::Move {
            field: "left".into(),
            x: 10,
            y: 12,
        };
        assert_eq!(moved.name(), "left:move");
        assert_eq!(moved.to_string(), "left:move x=10 y=12");
        assert_eq!(GamepadEvent::Press { field: "A".into() }.name(), "A:press");
        assert_eq!(
            GamepadEvent::StatusChange {
                field: "dpad".into(),
                value: 8,
                label: "released".into()
            }
            .name(),
            "dpad:change"
        );
    }

    #[test]
    fn test_selector_matching() {
        let press: EventSelector = "A:press".parse().unwrap();
        assert!(press.matches(&GamepadEvent::Press { field: "A".into() }));
        assert!(!press.matches(&GamepadEvent::Release { field: "A".into() }));
        assert!(!press.matches(&GamepadEvent::Press { field: "B".into() }));

        let change: EventSelector = "l2:change".parse().unwrap();
        assert!(change.matches(&GamepadEvent::ScaleChange {
            field: "l2".into(),
            value: 3
        }));

        let any: EventSelector = "*".parse().unwrap();
        assert!(any.matches(&GamepadEvent::Connected));

        let connected: EventSelector = "connected".parse().unwrap();
        assert!(connected.matches(&GamepadEvent::Connected));
        assert!(!connected.matches(&GamepadEvent::Disconnected));
    }

    #[test]
    fn test_selector_rejects_unknown_names() {
        assert!("A:hold".parse::<EventSelector>().is_err());
        assert!("plugged".parse::<EventSelector>().is_err());
        assert!(":press".parse::<EventSelector>().is_err());
    }

    #[test]
    fn test_json_shape() {
        let json = serde_json::to_string(&GamepadEvent::Move {
            field: "left".into(),
            x: 1,
            y: 2,
        })
        .unwrap();
        assert_eq!(json, r#"{"event":"move","field":"left","x":1,"y":2}"#);
        assert_eq!(
            serde_json::to_string(&GamepadEvent::Connected).unwrap(),
            r#"{"event":"connected"}"#
        );
    }
}
