//! The poll cycle orchestrator.
//!
//! One cycle walks a fixed phase sequence: wake the slaves if they may
//! have power-saved, quiesce the shunts, read every cell, run the
//! charge safety machine, re-apply balancing targets, and re-read the
//! cells whose shunts changed. Per-cell failures are tolerated and
//! counted; only transport-level faults abort a cycle. The delay
//! between cycles adapts to what the pack is doing.

use std::collections::HashSet;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use log::{error, info, warn};

use crate::balance;
use crate::charger::{ChargeInput, ChargeSafety, ChargerRelay, Reason};
use crate::config::Config;
use crate::constants::{
    CMD_RESET, DRIVING_AMPS, DRIVING_GRACE_SECS, DRIVING_POLL_MS, RESISTOR_SHUNT_PERIOD,
    SHUNT_SETTLE_MS, WAKE_THRESHOLD_MS,
};
use crate::error::{BmsError, Result};
use crate::events::{Event, EventBus};
use crate::link::{SlaveLink, Transport};
use crate::poll::{self, BusRail};
use crate::registry::{Mode, Pack};
use crate::soc::SocTracker;

/// Where in the cycle the monitor currently is; published so sinks can
/// show progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Start,
    WakeSlaves,
    TurnOffShunts,
    ReadVoltage,
    TurnOnShunts,
    ReadCurrent,
    Sleeping,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Phase::Start => "start",
            Phase::WakeSlaves => "waking slaves",
            Phase::TurnOffShunts => "shunts off",
            Phase::ReadVoltage => "reading voltages",
            Phase::TurnOnShunts => "shunts on",
            Phase::ReadCurrent => "reading currents",
            Phase::Sleeping => "sleeping",
        };
        f.write_str(s)
    }
}

/// Owns the bus, the pack model and the charge safety machine, and
/// drives them through poll cycles forever.
pub struct Monitor<T: Transport, R: BusRail, C: ChargerRelay> {
    link: SlaveLink<T>,
    rail: R,
    relay: C,
    pack: Pack,
    charge: ChargeSafety,
    soc: SocTracker,
    bus: Arc<EventBus>,
    controlled_battery: usize,
    floor_ma: u16,
    base_delay: Duration,
    last_drive: Option<Instant>,
    announced: HashSet<u16>,
}

impl<T: Transport, R: BusRail, C: ChargerRelay> Monitor<T, R, C> {
    pub fn new(
        config: &Config,
        link: SlaveLink<T>,
        rail: R,
        relay: C,
        soc: SocTracker,
        bus: Arc<EventBus>,
    ) -> Self {
        Monitor {
            link,
            rail,
            relay,
            pack: Pack::from_config(config),
            charge: ChargeSafety::new(config.thresholds()),
            soc,
            bus,
            controlled_battery: config.controlled_battery,
            floor_ma: config.min_shunt_floor_ma,
            base_delay: Duration::from_millis(config.poll_delay_ms),
            last_drive: None,
            announced: HashSet::new(),
        }
    }

    /// Run poll cycles until a transport-level fault.
    pub fn run(&mut self) -> Result<()> {
        info!(
            "monitoring {} cells across {} batteries",
            self.pack.cell_count(),
            self.pack.batteries.len()
        );
        self.startup_reset()?;
        loop {
            self.run_cycle()?;
            self.sleep_between_cycles();
        }
    }

    /// Put every slave into a known state before the first cycle. No
    /// replies are expected; the slaves drop characters while their
    /// firmware restarts, hence the second wake.
    fn startup_reset(&mut self) -> Result<()> {
        self.link.wake()?;
        for bi in 0..self.pack.batteries.len() {
            for ci in 0..self.pack.batteries[bi].cells.len() {
                let id = self.pack.batteries[bi].cells[ci].id;
                self.link.send_command(id, CMD_RESET)?;
            }
        }
        thread::sleep(Duration::from_secs(1));
        self.link.wake()
    }

    /// One complete poll cycle.
    pub fn run_cycle(&mut self) -> Result<()> {
        let now = Instant::now();
        self.phase(Phase::Start);
        if self.pack.poll_delay >= Duration::from_millis(WAKE_THRESHOLD_MS) {
            self.phase(Phase::WakeSlaves);
            self.link.wake()?;
        }
        self.phase(Phase::TurnOffShunts);
        self.quiesce_shunts()?;
        self.bus.publish(&Event::ShuntsPaused(self.pack.shunt_paused));
        self.phase(Phase::ReadVoltage);
        self.read_all_cells()?;
        self.evaluate_charger(now)?;
        self.phase(Phase::TurnOnShunts);
        let changed = self.apply_balancing(now)?;
        self.pack.shunt_paused = false;
        self.bus.publish(&Event::ShuntsPaused(self.pack.shunt_paused));
        if changed {
            thread::sleep(Duration::from_millis(SHUNT_SETTLE_MS));
            self.phase(Phase::ReadCurrent);
            self.read_shunting_cells()?;
        }
        self.publish_telemetry();
        self.adapt_poll_delay(now);
        self.pack.cycle = self.pack.cycle.wrapping_add(1);
        Ok(())
    }

    /// Open non-kelvin shunts so the voltage read sees true cell
    /// voltages; kelvin-sensed cells read accurately while shunting and
    /// are left alone. Transistor shunts come off every cycle; resistor
    /// shunts distort far less and are only rested periodically.
    fn quiesce_shunts(&mut self) -> Result<()> {
        let rest_resistors = self.pack.cycle % RESISTOR_SHUNT_PERIOD == 0;
        let mut any = false;
        for bi in 0..self.pack.batteries.len() {
            for ci in 0..self.pack.batteries[bi].cells.len() {
                let cell = &self.pack.batteries[bi].cells[ci];
                if cell.commanded_current == 0 || cell.capabilities.has_kelvin_sense {
                    continue;
                }
                if cell.capabilities.is_resistor_shunt && !rest_resistors {
                    continue;
                }
                let cell = &mut self.pack.batteries[bi].cells[ci];
                match balance::apply_target(&mut self.link, &mut self.rail, cell, 0) {
                    Ok(changed) => any |= changed,
                    Err(e @ (BmsError::SerialPort(_) | BmsError::Io(_))) => return Err(e),
                    Err(BmsError::Actuation { .. }) => self.emergency_off()?,
                    Err(_) => {}
                }
            }
        }
        self.pack.shunt_paused = true;
        if any {
            thread::sleep(Duration::from_millis(SHUNT_SETTLE_MS));
        }
        Ok(())
    }

    /// Poll every cell. The periodic deep read uses the full status
    /// query; ordinary cycles take the cheap summary.
    fn read_all_cells(&mut self) -> Result<()> {
        let deep = self.pack.cycle % RESISTOR_SHUNT_PERIOD == 0;
        let controlled = self.controlled_battery;
        let mut controlled_failed = false;
        for bi in 0..self.pack.batteries.len() {
            for ci in 0..self.pack.batteries[bi].cells.len() {
                let cell = &mut self.pack.batteries[bi].cells[ci];
                let outcome = if deep {
                    poll::poll_full(&mut self.link, &mut self.rail, cell)
                } else {
                    poll::poll_summary(&mut self.link, &mut self.rail, cell)
                };
                match outcome {
                    Ok(()) => {}
                    Err(e @ (BmsError::SerialPort(_) | BmsError::Io(_))) => return Err(e),
                    Err(_) => {
                        if bi == controlled {
                            controlled_failed = true;
                        }
                    }
                }
            }
        }
        if controlled_failed && self.charge.is_on() {
            // cannot see the battery the charger is pushing into
            warn!("controlled battery has failed cells, opening the charger as a precaution");
            self.force_charger_off(Reason::IncompleteData)?;
        }
        Ok(())
    }

    fn evaluate_charger(&mut self, now: Instant) -> Result<()> {
        let (amps, soc_error) = match self.soc.amps(now) {
            Ok(a) => (a, false),
            Err(_) => (0.0, true),
        };
        let battery = &self.pack.batteries[self.controlled_battery];
        let input = ChargeInput {
            max_voltage: battery.max_voltage(),
            min_voltage: battery.min_voltage(),
            complete: battery.is_complete(),
            amps,
            soc_error,
            boot_temperature: self.soc.board_temperature(),
            shunt_temperature: battery.worst_temperature(),
            any_shunting: battery.cells.iter().any(|c| c.is_shunting()),
        };
        if let Some(transition) = self.charge.evaluate(&input, now) {
            self.relay.set(transition.on)?;
            self.bus.publish(&Event::ChargerState {
                on: transition.on,
                latched: transition.latched,
                reason: transition.reason,
            });
        }
        Ok(())
    }

    /// Compute and drive this cycle's balancing targets. Returns
    /// whether any shunt changed on the wire.
    fn apply_balancing(&mut self, now: Instant) -> Result<bool> {
        let mode = self.pack.mode;
        let charger_on = self.charge.is_on();
        let amps = match self.soc.amps(now) {
            Ok(a) => a,
            // unknown pack current: no basis for balancing decisions
            Err(_) => return Ok(false),
        };
        let mut any = false;
        for bi in 0..self.pack.batteries.len() {
            let battery = &self.pack.batteries[bi];
            let min = match battery.min_voltage() {
                Some(v) => v,
                None => continue,
            };
            let worst = battery.worst_temperature();
            for ci in 0..self.pack.batteries[bi].cells.len() {
                let target = {
                    let cell = &self.pack.batteries[bi].cells[ci];
                    if !cell.is_data_current {
                        // a stale reading is no basis for bleeding charge,
                        // and it may lag below the battery minimum
                        continue;
                    }
                    balance::target_for(cell, min, worst, amps, mode, charger_on, self.floor_ma)
                };
                let cell = &mut self.pack.batteries[bi].cells[ci];
                match balance::apply_target(&mut self.link, &mut self.rail, cell, target) {
                    Ok(changed) => any |= changed,
                    Err(e @ (BmsError::SerialPort(_) | BmsError::Io(_))) => return Err(e),
                    Err(BmsError::Actuation { .. }) => self.emergency_off()?,
                    Err(_) => {}
                }
            }
        }
        Ok(any)
    }

    /// Re-read the cells whose shunts are meant to be conducting, so
    /// the published currents reflect the settled state.
    fn read_shunting_cells(&mut self) -> Result<()> {
        for bi in 0..self.pack.batteries.len() {
            for ci in 0..self.pack.batteries[bi].cells.len() {
                let cell = &mut self.pack.batteries[bi].cells[ci];
                if cell.target_current == 0 {
                    continue;
                }
                match poll::poll_summary(&mut self.link, &mut self.rail, cell) {
                    Ok(()) | Err(BmsError::VersionUnknown { .. }) => {}
                    Err(e @ (BmsError::SerialPort(_) | BmsError::Io(_))) => return Err(e),
                    Err(_) => {}
                }
            }
        }
        Ok(())
    }

    /// A shunt that will not obey is a fire risk under charge current.
    fn emergency_off(&mut self) -> Result<()> {
        error!("shunt refused its target, forcing the charger off");
        self.force_charger_off(Reason::ShuntStuck)
    }

    fn force_charger_off(&mut self, reason: Reason) -> Result<()> {
        if let Some(transition) = self.charge.force_off(reason, Instant::now()) {
            self.relay.set(false)?;
            self.bus.publish(&Event::ChargerState {
                on: false,
                latched: transition.latched,
                reason: transition.reason,
            });
        }
        Ok(())
    }

    fn publish_telemetry(&mut self) {
        for battery in &self.pack.batteries {
            for cell in &battery.cells {
                let battery_index = cell.battery_index;
                let index = cell.index as u8;
                self.bus.publish(&Event::Voltage {
                    battery: battery_index,
                    cell: index,
                    valid: cell.is_data_current,
                    millivolts: cell.voltage,
                });
                self.bus.publish(&Event::ShuntCurrent {
                    battery: battery_index,
                    cell: index,
                    milliamps: cell.shunt_current,
                });
                self.bus.publish(&Event::CommandedCurrent {
                    battery: battery_index,
                    cell: index,
                    milliamps: cell.commanded_current,
                });
                if cell.capabilities.has_temperature_sensor {
                    self.bus.publish(&Event::Temperature {
                        battery: battery_index,
                        cell: index,
                        centi_celsius: cell.temperature,
                    });
                }
                self.bus.publish(&Event::ErrorCount {
                    battery: battery_index,
                    cell: index,
                    count: cell.error_count,
                });
                self.bus.publish(&Event::LatencyMillis {
                    battery: battery_index,
                    cell: index,
                    millis: cell.latency.as_millis() as u32,
                });
                if matches!(cell.version, crate::version::VersionState::Known(_))
                    && self.announced.insert(cell.id)
                {
                    self.bus.publish(&Event::CellConfig {
                        battery: battery_index,
                        cell: index,
                        revision: cell.revision,
                        capabilities: cell.capabilities,
                    });
                }
            }
        }
    }

    /// Poll fast while the vehicle draws traction current, with a grace
    /// period so the delay does not flap at every stop light; otherwise
    /// relax to the configured delay, stretched further once the
    /// charger has been off for a while.
    fn adapt_poll_delay(&mut self, now: Instant) {
        let driving = match self.soc.amps(now) {
            Ok(a) => a > DRIVING_AMPS,
            Err(_) => false,
        };
        if driving {
            self.last_drive = Some(now);
            if self.pack.mode != Mode::Driving {
                info!("discharge current seen, switching to driving mode");
                self.pack.mode = Mode::Driving;
            }
        } else if self.pack.mode == Mode::Driving {
            let grace = Duration::from_secs(DRIVING_GRACE_SECS);
            let done = match self.last_drive {
                Some(at) => now.duration_since(at) >= grace,
                None => true,
            };
            if done {
                info!("discharge over, back to charging mode");
                self.pack.mode = Mode::Charging;
            }
        }
        self.pack.poll_delay = match self.pack.mode {
            Mode::Driving => Duration::from_millis(DRIVING_POLL_MS),
            Mode::Charging => {
                if self.charge.wants_longer_poll(now) {
                    self.base_delay * 2
                } else {
                    self.base_delay
                }
            }
        };
    }

    fn sleep_between_cycles(&self) {
        let delay = self.pack.poll_delay;
        let deadline = Instant::now() + delay;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            self.bus.publish(&Event::Phase {
                phase: Phase::Sleeping,
                remaining_ms: remaining.as_millis() as u32,
                cycle: self.pack.cycle,
            });
            if remaining.is_zero() {
                break;
            }
            thread::sleep(remaining.min(Duration::from_secs(1)));
        }
    }

    fn phase(&self, phase: Phase) {
        self.bus.publish(&Event::Phase {
            phase,
            remaining_ms: 0,
            cycle: self.pack.cycle,
        });
    }

    #[cfg(test)]
    pub(crate) fn pack(&self) -> &Pack {
        &self.pack
    }

    #[cfg(test)]
    pub(crate) fn charge(&self) -> &ChargeSafety {
        &self.charge
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::encode_reply;
    use crate::link::MockTransport;
    use crate::poll::{full_payload, summary_payload, MockRail};
    use crate::version::{version_payload, ProtocolVersion};
    use std::sync::Mutex;

    struct MockRelay {
        states: Arc<Mutex<Vec<bool>>>,
    }

    impl MockRelay {
        fn new() -> (Self, Arc<Mutex<Vec<bool>>>) {
            let states = Arc::new(Mutex::new(Vec::new()));
            (
                MockRelay {
                    states: Arc::clone(&states),
                },
                states,
            )
        }
    }

    impl ChargerRelay for MockRelay {
        fn set(&mut self, on: bool) -> Result<()> {
            self.states.lock().unwrap().push(on);
            Ok(())
        }
    }

    fn config(cells: &[u16]) -> Config {
        let list = cells
            .iter()
            .map(|c| c.to_string())
            .collect::<Vec<_>>()
            .join(", ");
        Config::parse(&format!(
            "device = \"/dev/null\"\npoll_delay_ms = 1000\n\n[[batteries]]\nname = \"traction\"\ncells = [{list}]\n"
        ))
        .unwrap()
    }

    // kelvin sense + temperature sensor
    const CAPS: u8 = 0x09;

    fn monitor_with(
        cells: &[u16],
        mock: MockTransport,
    ) -> (
        Monitor<MockTransport, MockRail, MockRelay>,
        Arc<Mutex<Vec<bool>>>,
    ) {
        let (relay, states) = MockRelay::new();
        let soc = SocTracker::new();
        soc.set_current_at(-6.0, Instant::now());
        let monitor = Monitor::new(
            &config(cells),
            SlaveLink::without_pacing(mock),
            MockRail::new(),
            relay,
            soc,
            Arc::new(EventBus::new()),
        );
        (monitor, states)
    }

    #[test]
    fn first_cycle_negotiates_reads_and_closes_the_relay() {
        let mut mock = MockTransport::new();
        mock.expect_reply(encode_reply(&version_payload(1, 0, 2, CAPS, 3, true, 0)));
        mock.expect_reply(encode_reply(&full_payload(1, 1, 3400, 0, 0, 2500)));
        let (mut monitor, states) = monitor_with(&[1], mock);
        monitor.run_cycle().unwrap();
        let cell = &monitor.pack().batteries[0].cells[0];
        assert_eq!(cell.voltage, 3400);
        assert!(cell.is_data_current);
        assert!(monitor.charge().is_on());
        assert_eq!(*states.lock().unwrap(), vec![true]);
        assert_eq!(monitor.pack().cycle, 1);
    }

    #[test]
    fn high_cell_gets_balanced_while_the_relay_stays_open() {
        let mut mock = MockTransport::new();
        // negotiation and deep read, cell by cell
        mock.expect_reply(encode_reply(&version_payload(1, 0, 2, CAPS, 3, true, 0)));
        mock.expect_reply(encode_reply(&full_payload(1, 1, 3450, 0, 0, 2500)));
        mock.expect_reply(encode_reply(&version_payload(2, 0, 2, CAPS, 3, true, 0)));
        mock.expect_reply(encode_reply(&full_payload(2, 1, 3550, 0, 0, 2500)));
        // actuation echo for the 300 mA target on cell 2
        mock.expect_reply(encode_reply(&summary_payload(
            ProtocolVersion::V2,
            2,
            2,
            3550,
            280,
            300,
        )));
        // settled re-read
        mock.expect_reply(encode_reply(&summary_payload(
            ProtocolVersion::V2,
            2,
            3,
            3548,
            300,
            300,
        )));
        let (mut monitor, states) = monitor_with(&[1, 2], mock);
        monitor.run_cycle().unwrap();
        // max 3550 is above the resume threshold: relay never closed
        assert!(states.lock().unwrap().is_empty());
        assert!(!monitor.charge().is_on());
        let high = &monitor.pack().batteries[0].cells[1];
        // margin 100 mV over the 3450 minimum asks for 300 mA
        assert_eq!(high.target_current, 300);
        assert_eq!(high.commanded_current, 300);
        assert_eq!(high.shunt_current, 300);
        let low = &monitor.pack().batteries[0].cells[0];
        assert_eq!(low.target_current, 0);
    }

    #[test]
    fn failed_cells_keep_the_cycle_alive_and_open_the_relay() {
        let mut mock = MockTransport::new();
        mock.expect_reply(encode_reply(&version_payload(1, 0, 2, CAPS, 3, true, 0)));
        mock.expect_reply(encode_reply(&full_payload(1, 1, 3300, 0, 0, 2500)));
        let (mut monitor, states) = monitor_with(&[1, 2], mock);
        // cell 2 never answers: negotiation exhausts and the cycle goes on
        monitor.run_cycle().unwrap();
        assert!(monitor.pack().batteries[0].cells[0].is_data_current);
        assert_eq!(
            monitor.pack().batteries[0].cells[1].version,
            crate::version::VersionState::Unknown
        );
        // incomplete data: the charger must not close
        assert!(!monitor.charge().is_on());
        assert!(states.lock().unwrap().is_empty());
    }

    #[test]
    fn stale_cell_lagging_below_the_minimum_is_left_alone() {
        let mut mock = MockTransport::new();
        mock.expect_reply(encode_reply(&version_payload(1, 0, 2, CAPS, 3, true, 0)));
        mock.expect_reply(encode_reply(&full_payload(1, 1, 3450, 0, 0, 2500)));
        mock.expect_reply(encode_reply(&version_payload(2, 0, 2, CAPS, 3, true, 0)));
        mock.expect_reply(encode_reply(&full_payload(2, 1, 3455, 0, 0, 2500)));
        // second cycle: only cell 1 answers, now above cell 2's last reading
        mock.expect_reply(encode_reply(&summary_payload(
            ProtocolVersion::V2,
            1,
            2,
            3470,
            0,
            0,
        )));
        let (mut monitor, _) = monitor_with(&[1, 2], mock);
        monitor.soc.set_current_at(-2.0, Instant::now());
        monitor.run_cycle().unwrap();
        monitor.soc.set_current_at(-2.0, Instant::now());
        monitor.run_cycle().unwrap();
        let stale = &monitor.pack().batteries[0].cells[1];
        assert!(!stale.is_data_current);
        // carried-over 3455 mV sits below the live 3470 mV minimum;
        // it must never be mistaken for a margin worth shunting
        assert_eq!(stale.voltage, 3455);
        assert_eq!(stale.target_current, 0);
        assert_eq!(stale.commanded_current, 0);
    }

    #[test]
    fn shunt_pause_brackets_the_voltage_read() {
        let bus = Arc::new(EventBus::new());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        bus.subscribe(move |e| {
            if let Event::ShuntsPaused(paused) = e {
                sink.lock().unwrap().push(*paused);
            }
        });
        let (relay, _) = MockRelay::new();
        let soc = SocTracker::new();
        soc.set_current_at(-6.0, Instant::now());
        let mut monitor = Monitor::new(
            &config(&[1]),
            SlaveLink::without_pacing(MockTransport::new()),
            MockRail::new(),
            relay,
            soc,
            Arc::clone(&bus),
        );
        monitor.run_cycle().unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![true, false]);
    }

    #[test]
    fn startup_resets_every_cell_between_wakes() {
        let (mut monitor, _) = monitor_with(&[1, 2], MockTransport::new());
        monitor.startup_reset().unwrap();
        let mut expected = vec![0u8; 4];
        expected.extend(crate::frame::encode_command(1, CMD_RESET));
        expected.extend(crate::frame::encode_command(2, CMD_RESET));
        expected.extend_from_slice(&[0, 0, 0, 0]);
        assert_eq!(monitor.link.transport().written, expected);
    }

    #[test]
    fn discharge_current_switches_to_driving_mode() {
        let mock = MockTransport::new();
        let (mut monitor, _) = monitor_with(&[1], mock);
        monitor.soc.set_current_at(20.0, Instant::now());
        monitor.run_cycle().unwrap();
        assert_eq!(monitor.pack().mode, Mode::Driving);
        assert_eq!(
            monitor.pack().poll_delay,
            Duration::from_millis(DRIVING_POLL_MS)
        );
        // the grace period keeps driving mode alive at zero current
        monitor.soc.set_current_at(0.0, Instant::now());
        monitor.run_cycle().unwrap();
        assert_eq!(monitor.pack().mode, Mode::Driving);
    }

    #[test]
    fn soc_silence_keeps_the_relay_open() {
        let mut mock = MockTransport::new();
        mock.expect_reply(encode_reply(&version_payload(1, 0, 2, CAPS, 3, true, 0)));
        mock.expect_reply(encode_reply(&full_payload(1, 1, 3300, 0, 0, 2500)));
        let (relay, states) = MockRelay::new();
        let monitor_soc = SocTracker::new(); // never fed
        let mut monitor = Monitor::new(
            &config(&[1]),
            SlaveLink::without_pacing(mock),
            MockRail::new(),
            relay,
            monitor_soc,
            Arc::new(EventBus::new()),
        );
        monitor.run_cycle().unwrap();
        assert!(!monitor.charge().is_on());
        assert!(states.lock().unwrap().is_empty());
    }
}
