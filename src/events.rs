//! Telemetry fan-out and upstream inputs.
//!
//! The monitor publishes everything it learns as discrete events;
//! sinks (CAN bridge, log tap, UI) subscribe without the core knowing
//! about them. Inputs from the rest of the vehicle arrive the same way
//! in reverse, landing in [`crate::soc`].

use std::sync::{Arc, Mutex};

use log::debug;

use crate::charger::Reason;
use crate::registry::CellCapabilities;

/// One fact, either published by the monitor or fed into it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Event {
    /// A cell voltage reading; `valid` is false when the value is a
    /// stale carry-over
    Voltage {
        battery: u8,
        cell: u8,
        valid: bool,
        millivolts: u16,
    },
    ShuntCurrent {
        battery: u8,
        cell: u8,
        milliamps: u16,
    },
    CommandedCurrent {
        battery: u8,
        cell: u8,
        milliamps: u16,
    },
    Temperature {
        battery: u8,
        cell: u8,
        centi_celsius: u16,
    },
    ErrorCount {
        battery: u8,
        cell: u8,
        count: u16,
    },
    LatencyMillis {
        battery: u8,
        cell: u8,
        millis: u32,
    },
    CellConfig {
        battery: u8,
        cell: u8,
        revision: u16,
        capabilities: CellCapabilities,
    },
    ChargerState {
        on: bool,
        latched: bool,
        reason: Option<Reason>,
    },
    Phase {
        phase: crate::monitor::Phase,
        remaining_ms: u32,
        cycle: u32,
    },
    /// True while non-kelvin shunts are opened for the voltage read;
    /// shunt-current readings taken in that window are not meaningful
    ShuntsPaused(bool),

    // upstream inputs
    PackVoltage(f64),
    /// Pack current in amps, negative while charging
    PackCurrent(f64),
    /// Charge moved since power-on, amp hours
    PackCharge(f64),
    PackTemperature(f64),
    /// Vehicle speed, used to switch into driving mode
    Speed(f64),
}

type Subscriber = Arc<dyn Fn(&Event) + Send + Sync>;

/// Synchronous publish/subscribe hub. Publishing calls every
/// subscriber in registration order on the publisher's thread.
pub struct EventBus {
    subscribers: Mutex<Vec<Subscriber>>,
}

impl EventBus {
    pub fn new() -> Self {
        EventBus {
            subscribers: Mutex::new(Vec::new()),
        }
    }

    pub fn subscribe<F>(&self, f: F)
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        if let Ok(mut subs) = self.subscribers.lock() {
            subs.push(Arc::new(f));
        }
    }

    /// Subscribers run outside the list lock so they may publish in
    /// turn; a republished event sees the subscriber list as of its own
    /// publish, not its parent's.
    pub fn publish(&self, event: &Event) {
        let snapshot: Vec<Subscriber> = match self.subscribers.lock() {
            Ok(subs) => subs.clone(),
            Err(_) => {
                debug!("event bus poisoned, dropping {event:?}");
                return;
            }
        };
        for sub in &snapshot {
            sub(event);
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        EventBus::new()
    }
}
