//! Frame decoder
//!
//! Turns raw input reports into field values and edge-triggered events.
//! Decoding is pure: [`decode`] takes the previous snapshot and returns the
//! next one together with the events the change produced.

use std::collections::HashMap;

use tracing::trace;

use crate::config::{FieldConfig, StatusState};
use crate::event::GamepadEvent;

/// Last observed value of one field
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldValue {
    Joystick { x: u8, y: u8 },
    Button { pressed: bool },
    Status { raw: u8 },
    Scale { value: u8 },
}

/// Snapshot of every field observed so far
///
/// A field without an entry has never been inside a report.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DecodedState {
    values: HashMap<String, FieldValue>,
}

impl DecodedState {
    pub fn get(&self, field: &str) -> Option<FieldValue> {
        self.values.get(field).copied()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, FieldValue)> {
        self.values.iter().map(|(k, v)| (k.as_str(), *v))
    }
}

/// Label for a status byte, first matching entry wins
pub fn status_label(states: &[StatusState], raw: u8) -> String {
    states
        .iter()
        .find(|s| s.value == raw)
        .map(|s| s.label.clone())
        .unwrap_or_else(|| format!("unknown state:{raw}"))
}

/// Decode one report against the previous snapshot
///
/// Fields whose pins lie outside the report keep their previous value and
/// emit nothing; the other fields of the same report are still decoded.
pub fn decode(
    fields: &[FieldConfig],
    previous: &DecodedState,
    report: &[u8],
) -> (DecodedState, Vec<GamepadEvent>) {
    let mut next = previous.clone();
    let mut events = Vec::new();
    let byte = |pin: u16| report.get(usize::from(pin)).copied();

    for field in fields {
        let name = field.name();
        let before = previous.get(name);

        let (value, event) = match field {
            FieldConfig::Joystick { x_pin, y_pin, .. } => {
                let (Some(x), Some(y)) = (byte(*x_pin), byte(*y_pin)) else {
                    continue;
                };
                let value = FieldValue::Joystick { x, y };
                let event = (before != Some(value)).then(|| GamepadEvent::Move {
                    field: name.to_string(),
                    x,
                    y,
                });
                (value, event)
            }
            FieldConfig::Button { pin, predicate, .. } => {
                let Some(raw) = byte(*pin) else { continue };
                let pressed = predicate.evaluate(raw);
                let was_pressed = match before {
                    Some(FieldValue::Button { pressed }) => pressed,
                    // First observation: only a press is an edge
                    _ => false,
                };
                let event = match (was_pressed, pressed) {
                    (false, true) => Some(GamepadEvent::Press {
                        field: name.to_string(),
                    }),
                    (true, false) => Some(GamepadEvent::Release {
                        field: name.to_string(),
                    }),
                    _ => None,
                };
                (FieldValue::Button { pressed }, event)
            }
            FieldConfig::Status {
                pin, mask, states, ..
            } => {
                let Some(raw) = byte(*pin).map(|b| b & mask) else {
                    continue;
                };
                let value = FieldValue::Status { raw };
                let event = (before != Some(value)).then(|| GamepadEvent::StatusChange {
                    field: name.to_string(),
                    value: raw,
                    label: status_label(states, raw),
                });
                (value, event)
            }
            FieldConfig::Scale { pin, .. } => {
                let Some(raw) = byte(*pin) else { continue };
                let value = FieldValue::Scale { value: raw };
                let event = (before != Some(value)).then(|| GamepadEvent::ScaleChange {
                    field: name.to_string(),
                    value: raw,
                });
                (value, event)
            }
        };

        next.values.insert(name.to_string(), value);
        events.extend(event);
    }

    (next, events)
}

/// Stateful wrapper around [`decode`]
#[derive(Debug, Clone)]
pub struct FrameDecoder {
    fields: Vec<FieldConfig>,
    state: DecodedState,
}

impl FrameDecoder {
    pub fn new(fields: Vec<FieldConfig>) -> Self {
        Self {
            fields,
            state: DecodedState::default(),
        }
    }

    /// Decode one report, replacing the snapshot in one step
    pub fn process(&mut self, report: &[u8]) -> Vec<GamepadEvent> {
        let (state, events) = decode(&self.fields, &self.state, report);
        self.state = state;
        if !events.is_empty() {
            trace!("{} event(s) from {} byte report", events.len(), report.len());
        }
        events
    }

    pub fn state(&self) -> &DecodedState {
        &self.state
    }

    pub fn fields(&self) -> &[FieldConfig] {
        &self.fields
    }
}
