//! # powermon-core
//!
//! **Rollover-safe power sampling for CPU power-management experiments.**
//!
//! `powermon-core` reads two telemetry sources on a fixed cadence: the
//! baseboard management controller's instantaneous platform power, and the
//! RAPL package energy counter. It records one CSV row per tick for
//! offline comparison across frequency, idle-state and isolation scenarios.
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::atomic::AtomicBool;
//! use std::time::Duration;
//!
//! use powermon_core::{IpmiConfig, IpmiPowerSource, RaplEnergySource, Run, RunConfig};
//!
//! let config = RunConfig {
//!     interval: Duration::from_secs(1),
//!     duration: Some(Duration::from_secs(60)),
//!     output: "baseline.csv".into(),
//!     ..Default::default()
//! };
//! let mut bmc = IpmiPowerSource::new(&IpmiConfig::default());
//! bmc.cap_timeout(config.platform_timeout_limit());
//!
//! let mut run = Run::new(config, Box::new(bmc), Box::new(RaplEnergySource::detect()));
//! let summary = run.run(&AtomicBool::new(true)).expect("run failed");
//! println!("{} samples in {:.1}s", summary.samples, summary.elapsed.as_secs_f64());
//! ```
//!
//! ## Architecture
//!
//! Sources → Converter → Sample → Recorder, driven by [`Run`].
//!
//! - [`PlatformPowerSource`] / [`EnergyCounterSource`]: one read per tick,
//!   `None` on failure. Failures never end a run.
//! - [`EnergyConverter`]: counter deltas to average watts, correcting for
//!   wraparound at the counter's [`RolloverBound`].
//! - [`Recorder`]: append-only CSV, flushed per row, plus a metadata sidecar.
//! - [`Run`]: cadence, optional duration bound, interrupt-safe stop.

pub mod converter;
pub mod error;
pub mod platform;
pub mod recorder;
pub mod run;
pub mod sample;
pub mod source;
pub mod sources;

pub use converter::{CounterDelta, EnergyConverter, average_power_watts, counter_delta};
pub use error::RunError;
pub use platform::{CpuPowerState, MachineInfo, detect_machine_info, is_privileged};
pub use recorder::{Recorder, RunMeta, SinkMode, meta_path_for};
pub use run::{DEFAULT_INTERVAL, Run, RunConfig, RunState, RunSummary, StopReason};
pub use sample::{CSV_HEADER, RunClock, Sample};
pub use source::{
    BoundOrigin, DEFAULT_MAX_ENERGY_UJ, EnergyCounterSource, NullEnergySource, NullPlatformSource,
    PlatformPowerSource, RolloverBound, SourceInfo, SourceKind,
};
pub use sources::{
    IpmiConfig, IpmiPowerSource, PowerZone, RaplEnergySource, discover_zones,
    parse_dcmi_power_reading,
};

/// Library version (from Cargo.toml).
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
