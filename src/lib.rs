//! # packmon
//!
//! Master-side controller for an EV battery pack built from per-cell
//! slave monitor boards on a shared serial bus. The controller polls
//! every cell, balances high cells through their shunts, and gates the
//! charger relay through a safety state machine.
//!
//! ## Example
//!
//! ```no_run
//! use std::path::Path;
//! use std::sync::Arc;
//!
//! use packmon::charger::NoopRelay;
//! use packmon::config::Config;
//! use packmon::events::EventBus;
//! use packmon::link::SlaveLink;
//! use packmon::monitor::Monitor;
//! use packmon::poll::NoopRail;
//! use packmon::soc::SocTracker;
//!
//! fn main() -> packmon::Result<()> {
//!     let config = Config::load(Path::new("packmon.toml"))?;
//!     let link = SlaveLink::open(&config.device)?;
//!     let bus = Arc::new(EventBus::new());
//!     let soc = SocTracker::new();
//!     soc.attach(&bus);
//!     let mut monitor = Monitor::new(&config, link, NoopRail, NoopRelay, soc, bus);
//!     monitor.run()
//! }
//! ```

pub mod balance;
pub mod charger;
pub mod config;
pub mod constants;
pub mod error;
pub mod events;
pub mod frame;
pub mod link;
pub mod monitor;
pub mod poll;
pub mod registry;
pub mod soc;
pub mod version;

pub use error::{BmsError, Result};
