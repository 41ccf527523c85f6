//! Balancing: decide a target shunt current per cell each cycle and
//! drive the slaves until they report it.
//!
//! The margin a cell must hold over the battery minimum widens as the
//! charge current rises; that is deliberate hysteresis so shunts do not
//! chatter on and off as the pack voltage moves under load. Targets are
//! derated by the hottest cell in the battery and quantised to the
//! ladder the slave hardware can actually hold.

use log::{debug, warn};

use crate::constants::{
    ACTUATION_ATTEMPTS, CMD_SHUNT_BASE, SHUNT_MAX_MA, SHUNT_MIN_MA, SHUNT_STEP_MA,
};
use crate::error::{BmsError, Result};
use crate::link::{SlaveLink, Transport};
use crate::poll::{self, BusRail};
use crate::registry::{Cell, Mode};

/// A cell voltage only says something about state of charge when the
/// cell is near full and the charge current is modest; below that the
/// voltage curve is too flat to balance against.
pub fn is_voltage_relevant(voltage_mv: u16, amps: f64) -> bool {
    !(voltage_mv < 3450
        || (voltage_mv < 3500 && amps <= -5.0)
        || (voltage_mv < 3600 && amps <= -10.0)
        || amps < -10.0)
}

/// Should this cell be bleeding charge right now?
pub fn should_shunt(
    cell: &Cell,
    min_voltage_mv: u16,
    amps: f64,
    mode: Mode,
    charger_on: bool,
) -> bool {
    if mode != Mode::Charging {
        return false;
    }
    if cell.has_unreliable_shunting_voltage() && charger_on {
        // transistor shunts without kelvin sense blind us to the very
        // voltage we are trying to control while the charger runs
        return false;
    }
    if !is_voltage_relevant(cell.voltage, amps) {
        return false;
    }
    // a reading can sit below the battery minimum when it is older than
    // the minimum's (the pack charged up underneath it); no margin, no shunt
    if cell.voltage < min_voltage_mv {
        return false;
    }
    let margin = cell.voltage - min_voltage_mv;
    !(margin < 25
        || (margin < 50 && amps < -3.0)
        || (margin < 75 && amps < -5.0)
        || (margin < 125 && amps < -7.0)
        || (margin < 150 && amps < -10.0))
}

/// Maximum shunt current allowed at the battery's worst temperature.
pub fn thermal_cap(worst_centi_c: u16) -> u16 {
    match worst_centi_c {
        t if t < 3000 => 450,
        t if t < 4000 => 400,
        t if t < 5000 => 300,
        t if t < 7000 => 200,
        t if t < 8000 => 150,
        _ => 0,
    }
}

/// Snap a requested current onto the ladder the slaves can hold:
/// zero, or a multiple of 50 mA from 150 up to 450.
pub fn quantize(ma: u16) -> u16 {
    if ma < SHUNT_MIN_MA {
        return 0;
    }
    (ma / SHUNT_STEP_MA * SHUNT_STEP_MA).min(SHUNT_MAX_MA)
}

/// Compute the shunt target for one cell this cycle.
///
/// `min_voltage_mv` is the minimum across the cell's battery and
/// `worst_centi_c` its hottest reading; `floor_ma` is the configured
/// minimum useful shunt current.
pub fn target_for(
    cell: &Cell,
    min_voltage_mv: u16,
    worst_centi_c: u16,
    amps: f64,
    mode: Mode,
    charger_on: bool,
    floor_ma: u16,
) -> u16 {
    if !should_shunt(cell, min_voltage_mv, amps, mode, charger_on) {
        return 0;
    }
    let cap = thermal_cap(worst_centi_c);
    if cap == 0 {
        return 0;
    }
    let margin = cell.voltage - min_voltage_mv;
    // 50 mA per 20 mV of margin, starting one step up
    let requested = (margin / 20) * SHUNT_STEP_MA + SHUNT_STEP_MA;
    quantize(requested.min(cap).max(floor_ma))
}

/// Wire command byte for a quantised target.
fn shunt_command(target_ma: u16) -> u8 {
    CMD_SHUNT_BASE + (target_ma / SHUNT_STEP_MA) as u8
}

/// Drive a cell to the given target.
///
/// Already-applied targets cost zero wire writes. Otherwise the set
/// command is issued and the cell re-polled, bounded to
/// [`ACTUATION_ATTEMPTS`], until it reports the commanded current back.
/// Returns whether anything changed on the wire.
pub fn apply_target<T: Transport, R: BusRail>(
    link: &mut SlaveLink<T>,
    rail: &mut R,
    cell: &mut Cell,
    target_ma: u16,
) -> Result<bool> {
    debug_assert_eq!(target_ma, quantize(target_ma));
    cell.target_current = target_ma;
    if cell.commanded_current == target_ma {
        return Ok(false);
    }
    debug!(
        "cell {}: shunt {} -> {} mA",
        cell.id, cell.commanded_current, target_ma
    );
    for _ in 0..ACTUATION_ATTEMPTS {
        link.send_command(cell.id, shunt_command(target_ma))?;
        if poll::poll_summary(link, rail, cell).is_ok() && cell.commanded_current == target_ma {
            return Ok(true);
        }
    }
    warn!(
        "cell {}: stuck at {} mA wanting {} mA",
        cell.id, cell.commanded_current, target_ma
    );
    Err(BmsError::Actuation {
        cell: cell.id,
        target_ma,
        actual_ma: cell.commanded_current,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::encode_reply;
    use crate::link::{MockTransport, SlaveLink};
    use crate::poll::{summary_payload, MockRail};
    use crate::version::{ProtocolVersion, VersionState};

    fn charging_cell(id: u16, voltage: u16) -> Cell {
        let mut cell = Cell::new(0, 0, id);
        cell.version = VersionState::Known(ProtocolVersion::V2);
        cell.capabilities.has_kelvin_sense = true;
        cell.voltage = voltage;
        cell.is_data_current = true;
        cell
    }

    #[test]
    fn voltage_relevance_table() {
        assert!(!is_voltage_relevant(3449, 0.0));
        assert!(is_voltage_relevant(3450, 0.0));
        assert!(is_voltage_relevant(3500, -9.9));
        assert!(!is_voltage_relevant(3500, -10.0));
        assert!(is_voltage_relevant(3600, -10.0));
        assert!(!is_voltage_relevant(3600, -11.0));
        assert!(!is_voltage_relevant(3499, -5.0));
        assert!(is_voltage_relevant(3499, -4.9));
    }

    #[test]
    fn margin_boundary_is_at_25_millivolts() {
        let min = 3450;
        let low = charging_cell(1, min + 24);
        let high = charging_cell(1, min + 26);
        assert!(!should_shunt(&low, min, -2.0, Mode::Charging, true));
        assert!(should_shunt(&high, min, -2.0, Mode::Charging, true));
    }

    #[test]
    fn margin_requirement_widens_with_charge_current() {
        let min = 3500;
        let cell = charging_cell(1, min + 60);
        // margin 60 is enough at -3 A but not at -5.5 A
        assert!(should_shunt(&cell, min, -3.0, Mode::Charging, true));
        assert!(!should_shunt(&cell, min, -5.5, Mode::Charging, true));
        let taller = charging_cell(1, min + 130);
        assert!(should_shunt(&taller, min, -5.5, Mode::Charging, true));
        assert!(!should_shunt(&taller, min, -10.5, Mode::Charging, true));
    }

    #[test]
    fn reading_below_the_battery_minimum_is_not_a_margin() {
        // a relevant-looking voltage can still sit under the minimum
        // when the reading is older than the rest of the battery's
        let lagging = charging_cell(1, 3455);
        assert!(!should_shunt(&lagging, 3470, -2.0, Mode::Charging, true));
        assert_eq!(
            target_for(&lagging, 3470, 2500, -2.0, Mode::Charging, true, 150),
            0
        );
    }

    #[test]
    fn never_shunts_outside_charging_mode_or_below_relevance() {
        let cell = charging_cell(1, 3500);
        assert!(!should_shunt(&cell, 3400, -2.0, Mode::Driving, false));
        let flat = charging_cell(1, 3426);
        // below 3450 mV the voltage says nothing; margin alone is not enough
        assert!(!should_shunt(&flat, 3400, -2.0, Mode::Charging, true));
    }

    #[test]
    fn non_kelvin_transistor_shunt_stays_off_while_charger_runs() {
        let mut cell = charging_cell(1, 3550);
        cell.capabilities.has_kelvin_sense = false;
        cell.capabilities.is_resistor_shunt = false;
        assert!(!should_shunt(&cell, 3450, -2.0, Mode::Charging, true));
        assert!(should_shunt(&cell, 3450, -2.0, Mode::Charging, false));
        cell.capabilities.is_resistor_shunt = true;
        assert!(should_shunt(&cell, 3450, -2.0, Mode::Charging, true));
    }

    #[test]
    fn thermal_derating_table() {
        assert_eq!(thermal_cap(2999), 450);
        assert_eq!(thermal_cap(3000), 400);
        assert_eq!(thermal_cap(4500), 300);
        assert_eq!(thermal_cap(6999), 200);
        assert_eq!(thermal_cap(7999), 150);
        assert_eq!(thermal_cap(8000), 0);
    }

    #[test]
    fn quantize_snaps_to_the_ladder() {
        assert_eq!(quantize(0), 0);
        assert_eq!(quantize(149), 0);
        assert_eq!(quantize(150), 150);
        assert_eq!(quantize(199), 150);
        assert_eq!(quantize(437), 400);
        assert_eq!(quantize(2000), 450);
    }

    #[test]
    fn target_respects_cap_and_floor() {
        let cell = charging_cell(1, 3650);
        // big margin, cool battery: full cap
        assert_eq!(
            target_for(&cell, 3450, 2500, -2.0, Mode::Charging, true, 150),
            450
        );
        // hot battery derates
        assert_eq!(
            target_for(&cell, 3450, 6500, -2.0, Mode::Charging, true, 150),
            200
        );
        // too hot: off entirely, floor does not resurrect it
        assert_eq!(
            target_for(&cell, 3450, 8100, -2.0, Mode::Charging, true, 150),
            0
        );
        // small margin lands below the floor and is raised onto it
        let barely = charging_cell(1, 3480);
        assert_eq!(
            target_for(&barely, 3450, 2500, -2.0, Mode::Charging, true, 200),
            200
        );
    }

    #[test]
    fn already_applied_target_writes_nothing() {
        let mut link = SlaveLink::without_pacing(MockTransport::new());
        let mut cell = charging_cell(4, 3600);
        cell.commanded_current = 200;
        let changed = apply_target(&mut link, &mut MockRail::new(), &mut cell, 200).unwrap();
        assert!(!changed);
        assert_eq!(link.transport().bytes_written(), 0);
        assert_eq!(cell.target_current, 200);
    }

    #[test]
    fn target_converges_once_the_cell_reports_it() {
        let mut mock = MockTransport::new();
        // first exchange: cell still reports the old current
        mock.expect_reply(encode_reply(&summary_payload(
            ProtocolVersion::V2,
            4,
            1,
            3600,
            0,
            0,
        )));
        // second: the new commanded current is echoed back
        mock.expect_reply(encode_reply(&summary_payload(
            ProtocolVersion::V2,
            4,
            2,
            3600,
            180,
            200,
        )));
        let mut link = SlaveLink::without_pacing(mock);
        let mut cell = charging_cell(4, 3600);
        let changed = apply_target(&mut link, &mut MockRail::new(), &mut cell, 200).unwrap();
        assert!(changed);
        assert_eq!(cell.commanded_current, 200);
    }

    #[test]
    fn failure_to_converge_is_an_actuation_error() {
        let mut link = SlaveLink::without_pacing(MockTransport::new());
        let mut cell = charging_cell(4, 3600);
        match apply_target(&mut link, &mut MockRail::new(), &mut cell, 200) {
            Err(BmsError::Actuation { cell: 4, target_ma: 200, .. }) => {}
            other => panic!("expected Actuation, got {other:?}"),
        }
    }
}
