//! Charge safety: decides when the charger relay may be closed, and
//! why it was opened.
//!
//! The machine has two states, Off and On. While On it hunts for a
//! reason to turn off, in strict priority order; whether a reason
//! latches is an explicit property of the reason, not of the order it
//! was found in. Only end-of-charge latches: it is terminal until an
//! external reset. Everything else may re-arm once its condition
//! clears, but never sooner than a fixed cooldown after the last Off
//! transition, so cell voltages have settled before being re-read.

use std::fmt;
use std::time::{Duration, Instant};

use log::{info, warn};

use crate::constants::{
    BOOT_OVER_TEMP, COLLAPSE_AMPS, COLLAPSE_SECS, END_OF_CHARGE_AMPS, REARM_COOLDOWN_SECS,
    RELAY_SETTLE_SECS, SHUNT_OVER_TEMP, SLOW_POLL_AFTER_OFF_SECS, STALE_DATA_SECS,
};
use crate::error::Result;

/// Relay hardware behind the charger. The GPIO driver lives outside
/// the core; this is its seam.
pub trait ChargerRelay: Send {
    fn set(&mut self, on: bool) -> Result<()>;
}

/// Relay that only logs; for benches without the relay board.
pub struct NoopRelay;

impl ChargerRelay for NoopRelay {
    fn set(&mut self, on: bool) -> Result<()> {
        info!("charger relay (noop): {}", if on { "on" } else { "off" });
        Ok(())
    }
}

/// Why the charger was switched off. Ranked: listed order is the
/// evaluation priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reason {
    /// State-of-charge subsystem stale or erroring
    SocError,
    BootOverTemp,
    ShuntOverTemp,
    /// Per-cell data incomplete for more than one consecutive cycle
    IncompleteData,
    /// No fully-valid dataset for too long
    StaleData,
    OverVoltage,
    /// Charge current collapsed while the relay was on
    CurrentCollapse,
    /// Minimum cell voltage up and current tapered: charging finished
    EndOfCharge,
    /// A cell would not take its commanded shunt current
    ShuntStuck,
}

impl Reason {
    /// Whether this shutdown is terminal without an external reset.
    pub fn latches(self) -> bool {
        matches!(self, Reason::EndOfCharge)
    }

    pub fn code(self) -> u8 {
        match self {
            Reason::SocError => 1,
            Reason::BootOverTemp => 2,
            Reason::ShuntOverTemp => 3,
            Reason::IncompleteData => 4,
            Reason::StaleData => 5,
            Reason::OverVoltage => 6,
            Reason::CurrentCollapse => 7,
            Reason::EndOfCharge => 8,
            Reason::ShuntStuck => 9,
        }
    }
}

impl fmt::Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Reason::SocError => "state of charge error",
            Reason::BootOverTemp => "board over temperature",
            Reason::ShuntOverTemp => "shunt over temperature",
            Reason::IncompleteData => "incomplete cell data",
            Reason::StaleData => "no valid dataset",
            Reason::OverVoltage => "over voltage",
            Reason::CurrentCollapse => "charge current collapsed",
            Reason::EndOfCharge => "end of charge",
            Reason::ShuntStuck => "shunt actuation failed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChargerState {
    Off,
    On,
}

/// Voltage thresholds for the controlled battery, in mV.
#[derive(Debug, Clone, Copy)]
pub struct ChargeThresholds {
    /// Charger may close again below this maximum
    pub resume_mv: u16,
    /// Charger opens above this maximum
    pub off_mv: u16,
    /// Minimum above this plus tapered current ends the charge
    pub end_mv: u16,
}

/// One cycle's worth of observations fed into the machine.
#[derive(Debug, Clone, Copy)]
pub struct ChargeInput {
    pub max_voltage: Option<u16>,
    pub min_voltage: Option<u16>,
    /// Every cell of the controlled battery produced data this cycle
    pub complete: bool,
    /// Pack current in amps, negative while charging
    pub amps: f64,
    pub soc_error: bool,
    pub boot_temperature: u16,
    pub shunt_temperature: u16,
    pub any_shunting: bool,
}

/// State change produced by one evaluation, for telemetry.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Transition {
    pub on: bool,
    pub latched: bool,
    pub reason: Option<Reason>,
}

/// The charge safety state machine. Sole owner and mutator of the
/// charger state.
pub struct ChargeSafety {
    thresholds: ChargeThresholds,
    state: ChargerState,
    latched: bool,
    reason: Option<Reason>,
    last_on: Option<Instant>,
    last_off: Option<Instant>,
    last_valid_data: Instant,
    collapse_since: Option<Instant>,
    incomplete_cycles: u32,
}

impl ChargeSafety {
    pub fn new(thresholds: ChargeThresholds) -> Self {
        ChargeSafety {
            thresholds,
            state: ChargerState::Off,
            latched: false,
            reason: None,
            last_on: None,
            last_off: None,
            last_valid_data: Instant::now(),
            collapse_since: None,
            incomplete_cycles: 0,
        }
    }

    pub fn is_on(&self) -> bool {
        self.state == ChargerState::On
    }

    pub fn is_latched(&self) -> bool {
        self.latched
    }

    pub fn reason(&self) -> Option<Reason> {
        self.reason
    }

    /// Feed one cycle of observations. Returns the transition if the
    /// state changed.
    pub fn evaluate(&mut self, input: &ChargeInput, now: Instant) -> Option<Transition> {
        if input.complete {
            self.last_valid_data = now;
        }
        match self.state {
            ChargerState::On => match self.off_reason(input, now) {
                Some(reason) => Some(self.turn_off(reason, now)),
                None => None,
            },
            ChargerState::Off => {
                if self.may_turn_on(input, now) {
                    Some(self.turn_on(now))
                } else {
                    None
                }
            }
        }
    }

    /// Precautionary shutdown from outside the normal evaluation, e.g.
    /// when a safety-relevant poll fails mid-cycle.
    pub fn force_off(&mut self, reason: Reason, now: Instant) -> Option<Transition> {
        if self.state == ChargerState::On {
            Some(self.turn_off(reason, now))
        } else {
            None
        }
    }

    /// Clear a latched shutdown. The only path back to On after
    /// end-of-charge; operator action, never automatic.
    pub fn reset_latch(&mut self) {
        if self.latched {
            info!("charger latch reset");
        }
        self.latched = false;
        self.reason = None;
    }

    /// Whether the caller should lengthen its polling interval; true
    /// once the charger has been off for a while, since nothing moves
    /// quickly in a resting pack.
    pub fn wants_longer_poll(&self, now: Instant) -> bool {
        if self.state == ChargerState::On {
            return false;
        }
        match self.last_off {
            Some(off) => now.duration_since(off) > Duration::from_secs(SLOW_POLL_AFTER_OFF_SECS),
            None => false,
        }
    }

    fn may_turn_on(&self, input: &ChargeInput, now: Instant) -> bool {
        if self.latched || input.soc_error || !input.complete {
            return false;
        }
        let below_resume = match input.max_voltage {
            Some(v) => v < self.thresholds.resume_mv,
            None => false,
        };
        if !below_resume {
            return false;
        }
        match self.last_off {
            Some(off) => now.duration_since(off) >= Duration::from_secs(REARM_COOLDOWN_SECS),
            None => true,
        }
    }

    /// First match wins; order is the safety ranking.
    fn off_reason(&mut self, input: &ChargeInput, now: Instant) -> Option<Reason> {
        if input.soc_error {
            return Some(Reason::SocError);
        }
        if input.boot_temperature >= BOOT_OVER_TEMP {
            return Some(Reason::BootOverTemp);
        }
        if input.shunt_temperature >= SHUNT_OVER_TEMP {
            return Some(Reason::ShuntOverTemp);
        }
        if input.complete {
            self.incomplete_cycles = 0;
        } else {
            self.incomplete_cycles += 1;
            if self.incomplete_cycles > 1 {
                return Some(Reason::IncompleteData);
            }
        }
        if now.duration_since(self.last_valid_data) > Duration::from_secs(STALE_DATA_SECS) {
            return Some(Reason::StaleData);
        }
        if let Some(max) = input.max_voltage {
            if max > self.thresholds.off_mv {
                return Some(Reason::OverVoltage);
            }
        }
        if let Some(reason) = self.collapse_reason(input, now) {
            return Some(reason);
        }
        // balancing still bleeding a cell means the laggard is still
        // catching up; do not latch end-of-charge under it
        if input.complete && !input.any_shunting && input.amps > END_OF_CHARGE_AMPS {
            if let Some(min) = input.min_voltage {
                if min > self.thresholds.end_mv {
                    return Some(Reason::EndOfCharge);
                }
            }
        }
        None
    }

    fn collapse_reason(&mut self, input: &ChargeInput, now: Instant) -> Option<Reason> {
        if input.amps <= COLLAPSE_AMPS {
            self.collapse_since = None;
            return None;
        }
        // ignore the inrush window right after closing the relay
        let settled = match self.last_on {
            Some(on) => now.duration_since(on) >= Duration::from_secs(RELAY_SETTLE_SECS),
            None => false,
        };
        if !settled {
            return None;
        }
        let since = *self.collapse_since.get_or_insert(now);
        if now.duration_since(since) > Duration::from_secs(COLLAPSE_SECS) {
            Some(Reason::CurrentCollapse)
        } else {
            None
        }
    }

    fn turn_on(&mut self, now: Instant) -> Transition {
        self.state = ChargerState::On;
        self.last_on = Some(now);
        self.collapse_since = None;
        self.incomplete_cycles = 0;
        self.reason = None;
        info!("charger on");
        Transition { on: true, latched: false, reason: None }
    }

    fn turn_off(&mut self, reason: Reason, now: Instant) -> Transition {
        self.state = ChargerState::Off;
        self.last_off = Some(now);
        self.collapse_since = None;
        self.reason = Some(reason);
        if reason.latches() {
            self.latched = true;
        }
        warn!(
            "charger off: {}{}",
            reason,
            if self.latched { " (latched)" } else { "" }
        );
        Transition { on: false, latched: self.latched, reason: Some(reason) }
    }
}
