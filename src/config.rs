//! Runtime configuration, loaded from a TOML file at startup.
//!
//! Topology (which cell addresses belong to which battery) has to come
//! from configuration; everything else carries defaults matching the
//! usual pack.

use std::fs;
use std::path::Path;

use serde::Deserialize;

use crate::charger::ChargeThresholds;
use crate::constants::{CHARGER_OFF_MV, CHARGER_RESUME_MV, END_OF_CHARGE_MV, SHUNT_MIN_MA};
use crate::error::{BmsError, Result};

#[derive(Debug, Clone, Deserialize)]
pub struct BatteryConfig {
    pub name: String,
    /// Bus addresses in physical order
    pub cells: Vec<u16>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Serial device of the slave bus
    pub device: String,
    #[serde(default = "default_poll_delay_ms")]
    pub poll_delay_ms: u64,
    pub batteries: Vec<BatteryConfig>,
    /// Battery whose extrema drive the charger, index into `batteries`
    #[serde(default)]
    pub controlled_battery: usize,
    #[serde(default = "default_resume_mv")]
    pub charger_resume_mv: u16,
    #[serde(default = "default_off_mv")]
    pub charger_off_mv: u16,
    #[serde(default = "default_end_mv")]
    pub end_of_charge_mv: u16,
    /// Smallest shunt current worth commanding at all
    #[serde(default = "default_shunt_floor_ma")]
    pub min_shunt_floor_ma: u16,
}

fn default_poll_delay_ms() -> u64 {
    5000
}

fn default_resume_mv() -> u16 {
    CHARGER_RESUME_MV
}

fn default_off_mv() -> u16 {
    CHARGER_OFF_MV
}

fn default_end_mv() -> u16 {
    END_OF_CHARGE_MV
}

fn default_shunt_floor_ma() -> u16 {
    SHUNT_MIN_MA
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Self> {
        let config: Config =
            toml::from_str(text).map_err(|e| BmsError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.batteries.is_empty() {
            return Err(BmsError::Config("no batteries configured".into()));
        }
        if self.controlled_battery >= self.batteries.len() {
            return Err(BmsError::Config(format!(
                "controlled_battery {} out of range ({} batteries)",
                self.controlled_battery,
                self.batteries.len()
            )));
        }
        if !(self.charger_resume_mv < self.end_of_charge_mv
            && self.end_of_charge_mv < self.charger_off_mv)
        {
            return Err(BmsError::Config(format!(
                "thresholds must order resume < end < off, got {} / {} / {}",
                self.charger_resume_mv, self.end_of_charge_mv, self.charger_off_mv
            )));
        }
        let mut seen = std::collections::HashSet::new();
        for battery in &self.batteries {
            if battery.cells.is_empty() {
                return Err(BmsError::Config(format!(
                    "battery {} has no cells",
                    battery.name
                )));
            }
            for &id in &battery.cells {
                if !seen.insert(id) {
                    return Err(BmsError::Config(format!("duplicate cell address {id}")));
                }
            }
        }
        Ok(())
    }

    pub fn thresholds(&self) -> ChargeThresholds {
        ChargeThresholds {
            resume_mv: self.charger_resume_mv,
            off_mv: self.charger_off_mv,
            end_mv: self.end_of_charge_mv,
        }
    }
}
