//! Rumble pulses
//!
//! A pulse is an enable output report followed by a disable report once the
//! requested duration has passed. [`RumbleStrategy`] knows the bytes,
//! [`RumbleScheduler`] knows the timing. The scheduler does no I/O: it hands
//! back the report to write and exposes the deadline the session waits on.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use crate::config::RumbleProfile;

/// Encodes rumble on/off as vendor output reports
pub trait RumbleStrategy: Send + Sync {
    /// Report that starts the motors, `None` if the device cannot rumble
    fn enable_report(&self) -> Option<Vec<u8>>;

    /// Report that stops the motors
    fn disable_report(&self) -> Option<Vec<u8>>;
}

/// Device without rumble support
#[derive(Debug, Clone, Copy, Default)]
pub struct NoRumble;

impl RumbleStrategy for NoRumble {
    fn enable_report(&self) -> Option<Vec<u8>> {
        None
    }

    fn disable_report(&self) -> Option<Vec<u8>> {
        None
    }
}

/// Sony DualShock 4 over USB
///
/// Output report 0x05 with the feature flags set to 0xFF and the two motor
/// bytes at offsets 3 and 4.
#[derive(Debug, Clone, Copy, Default)]
pub struct DualShock4Rumble;

impl DualShock4Rumble {
    const REPORT_ID: u8 = 0x05;
    const REPORT_LEN: usize = 11;

    fn report(level: u8) -> Vec<u8> {
        let mut report = vec![0u8; Self::REPORT_LEN];
        report[0] = Self::REPORT_ID;
        report[1] = 0xFF;
        report[2] = 0x04;
        report[3] = level;
        report[4] = level;
        report
    }
}

impl RumbleStrategy for DualShock4Rumble {
    fn enable_report(&self) -> Option<Vec<u8>> {
        Some(Self::report(1))
    }

    fn disable_report(&self) -> Option<Vec<u8>> {
        Some(Self::report(0))
    }
}

/// Strategy for a configured profile
pub fn strategy_for(profile: RumbleProfile) -> Arc<dyn RumbleStrategy> {
    match profile {
        RumbleProfile::None => Arc::new(NoRumble),
        RumbleProfile::DualShock4 => Arc::new(DualShock4Rumble),
    }
}

/// The active pulse
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RumblePulse {
    pub enabled_since: Instant,
    pub expires_at: Instant,
}

/// At most one pulse at a time; a new request replaces the window
pub struct RumbleScheduler {
    strategy: Arc<dyn RumbleStrategy>,
    pulse: Option<RumblePulse>,
}

impl RumbleScheduler {
    pub fn new(strategy: Arc<dyn RumbleStrategy>) -> Self {
        Self {
            strategy,
            pulse: None,
        }
    }

    /// Handle `rumble(duration)` at `now`
    ///
    /// Returns the enable report to write, if any. While a pulse is running
    /// only its expiry moves to `now + duration`; the motors are already on.
    /// Requests while disconnected are dropped, not queued.
    pub fn request(&mut self, now: Instant, duration: Duration, connected: bool) -> Option<Vec<u8>> {
        if !connected {
            debug!("Rumble dropped, not connected");
            return None;
        }
        let expires_at = now + duration;
        if let Some(pulse) = &mut self.pulse {
            debug!("Rumble window replaced ({:?})", duration);
            pulse.expires_at = expires_at;
            return None;
        }
        let report = self.strategy.enable_report()?;
        self.pulse = Some(RumblePulse {
            enabled_since: now,
            expires_at,
        });
        debug!("Rumble on for {:?}", duration);
        Some(report)
    }

    /// When the disable report is due
    pub fn deadline(&self) -> Option<Instant> {
        self.pulse.map(|p| p.expires_at)
    }

    pub fn pulse(&self) -> Option<RumblePulse> {
        self.pulse
    }

    /// End the pulse if it is due, returning the disable report
    pub fn expire(&mut self, now: Instant) -> Option<Vec<u8>> {
        match self.pulse {
            Some(pulse) if now >= pulse.expires_at => {
                self.pulse = None;
                debug!("Rumble off after {:?}", now - pulse.enabled_since);
                self.strategy.disable_report()
            }
            _ => None,
        }
    }

    /// End the pulse now, returning the disable report if one was running
    pub fn cancel(&mut self) -> Option<Vec<u8>> {
        self.pulse.take()?;
        self.strategy.disable_report()
    }

    /// Forget the pulse without writing (the device is gone)
    pub fn clear(&mut self) {
        self.pulse = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ENABLE: [u8; 11] = [5, 255, 4, 1, 1, 0, 0, 0, 0, 0, 0];
    const DISABLE: [u8; 11] = [5, 255, 4, 0, 0, 0, 0, 0, 0, 0, 0];

    fn ds4() -> RumbleScheduler {
        RumbleScheduler::new(Arc::new(DualShock4Rumble))
    }

    #[test]
    fn test_dualshock4_reports() {
        assert_eq!(DualShock4Rumble.enable_report().unwrap(), ENABLE);
        assert_eq!(DualShock4Rumble.disable_report().unwrap(), DISABLE);
    }

    #[test]
    fn test_pulse_enable_then_disable() {
        let mut scheduler = ds4();
        let t0 = Instant::now();

        assert_eq!(
            scheduler.request(t0, Duration::from_millis(100), true).unwrap(),
            ENABLE
        );
        assert_eq!(scheduler.deadline(), Some(t0 + Duration::from_millis(100)));
        assert!(scheduler.expire(t0 + Duration::from_millis(99)).is_none());
        assert_eq!(
            scheduler.expire(t0 + Duration::from_millis(100)).unwrap(),
            DISABLE
        );
        assert!(scheduler.deadline().is_none());
    }

    #[test]
    fn test_second_request_replaces_window() {
        let mut scheduler = ds4();
        let t0 = Instant::now();

        assert!(scheduler.request(t0, Duration::from_millis(100), true).is_some());
        let t30 = t0 + Duration::from_millis(30);
        assert!(scheduler.request(t30, Duration::from_millis(50), true).is_none());
        assert_eq!(scheduler.deadline(), Some(t0 + Duration::from_millis(80)));
        assert_eq!(scheduler.pulse().unwrap().enabled_since, t0);

        // Shortening works too
        assert!(scheduler.request(t30, Duration::from_millis(10), true).is_none());
        assert_eq!(scheduler.deadline(), Some(t0 + Duration::from_millis(40)));
    }

    #[test]
    fn test_disconnected_request_dropped() {
        let mut scheduler = ds4();
        assert!(scheduler
            .request(Instant::now(), Duration::from_millis(100), false)
            .is_none());
        assert!(scheduler.deadline().is_none());
    }

    #[test]
    fn test_cancel_and_clear() {
        let mut scheduler = ds4();
        let t0 = Instant::now();

        assert!(scheduler.cancel().is_none());
        scheduler.request(t0, Duration::from_millis(100), true);
        assert_eq!(scheduler.cancel().unwrap(), DISABLE);
        assert!(scheduler.cancel().is_none());

        scheduler.request(t0, Duration::from_millis(100), true);
        scheduler.clear();
        assert!(scheduler.deadline().is_none());
        assert!(scheduler.expire(t0 + Duration::from_secs(1)).is_none());
    }

    #[test]
    fn test_no_rumble_never_arms() {
        let mut scheduler = RumbleScheduler::new(strategy_for(RumbleProfile::None));
        assert!(scheduler
            .request(Instant::now(), Duration::from_millis(100), true)
            .is_none());
        assert!(scheduler.deadline().is_none());
    }
}
