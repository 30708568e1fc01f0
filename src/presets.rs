//! Built-in controller layouts

use hidpad_transport::DeviceSpec;

use crate::config::{FieldConfig, RumbleProfile, SessionConfig, StatusState};
use crate::predicate::Predicate;

/// Preset names accepted by [`preset`]
pub fn names() -> &'static [&'static str] {
    &["dualshock4", "f310"]
}

/// Look up a preset by name (case-insensitive)
pub fn preset(name: &str) -> Option<SessionConfig> {
    match name.to_ascii_lowercase().as_str() {
        "dualshock4" | "ds4" => Some(dualshock4()),
        "f310" => Some(f310()),
        _ => None,
    }
}

fn joystick(name: &str, x_pin: u16, y_pin: u16) -> FieldConfig {
    FieldConfig::Joystick {
        name: name.into(),
        x_pin,
        y_pin,
    }
}

fn bit(name: &str, pin: u16, mask: u8) -> FieldConfig {
    FieldConfig::Button {
        name: name.into(),
        pin,
        predicate: Predicate::mask(mask),
    }
}

fn scale(name: &str, pin: u16) -> FieldConfig {
    FieldConfig::Scale {
        name: name.into(),
        pin,
    }
}

/// Eight-way hat in the low nibble, 8 when centred
fn hat(name: &str, pin: u16) -> FieldConfig {
    let labels = [
        "up",
        "up-right",
        "right",
        "down-right",
        "down",
        "down-left",
        "left",
        "up-left",
        "released",
    ];
    FieldConfig::Status {
        name: name.into(),
        pin,
        mask: 0x0F,
        states: (0u8..)
            .zip(labels)
            .map(|(value, label)| StatusState::new(value, label))
            .collect(),
    }
}

/// Sony DualShock 4 (CUH-ZCT1), USB report 0x01
pub fn dualshock4() -> SessionConfig {
    let fields = vec![
        joystick("left", 1, 2),
        joystick("right", 3, 4),
        hat("dpad", 5),
        bit("square", 5, 0x10),
        bit("cross", 5, 0x20),
        bit("circle", 5, 0x40),
        bit("triangle", 5, 0x80),
        bit("l1", 6, 0x01),
        bit("r1", 6, 0x02),
        bit("l2Button", 6, 0x04),
        bit("r2Button", 6, 0x08),
        bit("share", 6, 0x10),
        bit("options", 6, 0x20),
        bit("l3", 6, 0x40),
        bit("r3", 6, 0x80),
        bit("ps", 7, 0x01),
        bit("touchpad", 7, 0x02),
        scale("l2", 8),
        scale("r2", 9),
    ];
    SessionConfig::new(DeviceSpec::new(0x054C, 0x05C4), fields).with_rumble(RumbleProfile::DualShock4)
}

/// Logitech F310 in DirectInput mode
pub fn f310() -> SessionConfig {
    let dpad = |name: &str, directions: &[u8]| FieldConfig::Button {
        name: name.into(),
        pin: 4,
        predicate: Predicate::masked_any_of(0x0F, directions),
    };
    let fields = vec![
        joystick("left", 0, 1),
        joystick("right", 2, 3),
        dpad("dpadUp", &[0, 1, 7]),
        dpad("dpadRight", &[1, 2, 3]),
        dpad("dpadDown", &[3, 4, 5]),
        dpad("dpadLeft", &[5, 6, 7]),
        bit("X", 4, 0x10),
        bit("A", 4, 0x20),
        bit("B", 4, 0x40),
        bit("Y", 4, 0x80),
        bit("LB", 5, 0x01),
        bit("RB", 5, 0x02),
        bit("LT", 5, 0x04),
        bit("RT", 5, 0x08),
        bit("back", 5, 0x10),
        bit("start", 5, 0x20),
        bit("leftStick", 5, 0x40),
        bit("rightStick", 5, 0x80),
    ];
    SessionConfig::new(DeviceSpec::new(0x046D, 0xC216), fields)
}
