//! Concrete telemetry sources.

pub mod ipmi;
pub mod rapl;

pub use ipmi::{IpmiConfig, IpmiPowerSource, parse_dcmi_power_reading};
pub use rapl::{PowerZone, RaplEnergySource, discover_zones};
