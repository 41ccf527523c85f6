//! Pack-level state of charge, fed from upstream telemetry.
//!
//! The current sensor lives in another box; its readings arrive over
//! the event bus. Anything downstream that gates on pack current must
//! treat a silent sensor as an error, so every reading carries a
//! freshness deadline.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::constants::SOC_STALE_SECS;
use crate::error::{BmsError, Result};
use crate::events::{Event, EventBus};

#[derive(Debug, Clone, Copy, Default)]
struct Inner {
    amps: f64,
    volts: f64,
    amp_hours: f64,
    speed: f64,
    temperature: f64,
    updated: Option<Instant>,
}

/// Latest upstream pack readings, shared between the bus subscriber
/// thread and the monitor loop.
#[derive(Clone)]
pub struct SocTracker {
    inner: Arc<Mutex<Inner>>,
}

impl SocTracker {
    pub fn new() -> Self {
        SocTracker {
            inner: Arc::new(Mutex::new(Inner::default())),
        }
    }

    /// Subscribe this tracker to the upstream input events.
    pub fn attach(&self, bus: &EventBus) {
        let inner = Arc::clone(&self.inner);
        bus.subscribe(move |event| {
            if let Ok(mut state) = inner.lock() {
                match *event {
                    Event::PackCurrent(a) => {
                        state.amps = a;
                        state.updated = Some(Instant::now());
                    }
                    Event::PackVoltage(v) => state.volts = v,
                    Event::PackCharge(ah) => state.amp_hours = ah,
                    Event::PackTemperature(t) => state.temperature = t,
                    Event::Speed(s) => state.speed = s,
                    _ => {}
                }
            }
        });
    }

    /// Pack current in amps, negative while charging. Errors when the
    /// sensor has gone quiet.
    pub fn amps(&self, now: Instant) -> Result<f64> {
        let state = self
            .inner
            .lock()
            .map_err(|_| BmsError::UpstreamSubsystem)?;
        match state.updated {
            Some(at) if now.duration_since(at) <= Duration::from_secs(SOC_STALE_SECS) => {
                Ok(state.amps)
            }
            _ => Err(BmsError::UpstreamSubsystem),
        }
    }

    /// Whether the upstream readings are usable right now.
    pub fn is_error(&self, now: Instant) -> bool {
        self.amps(now).is_err()
    }

    pub fn speed(&self) -> f64 {
        self.inner.lock().map(|s| s.speed).unwrap_or(0.0)
    }

    pub fn volts(&self) -> f64 {
        self.inner.lock().map(|s| s.volts).unwrap_or(0.0)
    }

    pub fn amp_hours(&self) -> f64 {
        self.inner.lock().map(|s| s.amp_hours).unwrap_or(0.0)
    }

    /// Controller-box temperature in centi-degrees C, zero until the
    /// upstream sensor reports one.
    pub fn board_temperature(&self) -> u16 {
        self.inner
            .lock()
            .map(|s| (s.temperature * 100.0).clamp(0.0, u16::MAX as f64) as u16)
            .unwrap_or(0)
    }

    #[cfg(test)]
    pub(crate) fn set_current_at(&self, amps: f64, at: Instant) {
        if let Ok(mut state) = self.inner.lock() {
            state.amps = amps;
            state.updated = Some(at);
        }
    }
}

impl Default for SocTracker {
    fn default() -> Self {
        SocTracker::new()
    }
}
