//! Telemetry source traits and metadata.
//!
//! A run reads from exactly two sources per tick: a [`PlatformPowerSource`]
//! (instantaneous wattage from the baseboard management controller) and an
//! [`EnergyCounterSource`] (a monotonically increasing microjoule counter).
//! Either can be unavailable on any given tick; both return `Option` so a
//! failed read is a value, not an error.

/// Fallback rollover bound for energy counters whose range cannot be read.
///
/// RAPL energy status registers are 32 bits wide; with a 1 µJ unit this
/// is the bound the counter wraps at on most parts.
pub const DEFAULT_MAX_ENERGY_UJ: u64 = 1 << 32;

/// Kind of telemetry a source produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SourceKind {
    /// Out-of-band instantaneous power in watts.
    PlatformPower,
    /// Accumulated energy in microjoules.
    EnergyCounter,
}

impl std::fmt::Display for SourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PlatformPower => write!(f, "platform_power"),
            Self::EnergyCounter => write!(f, "energy_counter"),
        }
    }
}

/// Metadata about a telemetry source.
#[derive(Debug, Clone)]
pub struct SourceInfo {
    /// Unique identifier (e.g. `"ipmi_dcmi"`).
    pub name: String,
    /// One-line human-readable description.
    pub description: String,
    pub kind: SourceKind,
}

/// Where an energy counter's rollover bound came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BoundOrigin {
    /// Read from the hardware interface (e.g. `max_energy_range_uj`).
    Discovered,
    /// [`DEFAULT_MAX_ENERGY_UJ`] was used because discovery failed.
    Default,
}

impl std::fmt::Display for BoundOrigin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Discovered => write!(f, "discovered"),
            Self::Default => write!(f, "default"),
        }
    }
}

/// The value at which an energy counter wraps back to zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RolloverBound {
    pub max_uj: u64,
    pub origin: BoundOrigin,
}

impl RolloverBound {
    pub fn discovered(max_uj: u64) -> Self {
        Self {
            max_uj,
            origin: BoundOrigin::Discovered,
        }
    }

    pub fn fallback() -> Self {
        Self {
            max_uj: DEFAULT_MAX_ENERGY_UJ,
            origin: BoundOrigin::Default,
        }
    }

    /// Operator-facing caveat when the bound is a guess, `None` otherwise.
    pub fn caveat(&self) -> Option<String> {
        match self.origin {
            BoundOrigin::Discovered => None,
            BoundOrigin::Default => Some(format!(
                "energy counter range could not be read; wraparound correction assumes a bound of {} uJ",
                self.max_uj
            )),
        }
    }
}

impl Default for RolloverBound {
    fn default() -> Self {
        Self::fallback()
    }
}

/// Instantaneous platform power reading, one call per tick.
pub trait PlatformPowerSource: Send {
    /// Source metadata.
    fn info(&self) -> &SourceInfo;

    /// Check if this source can operate on the current machine.
    fn is_available(&self) -> bool;

    /// Read the current wattage, or `None` if the reading failed this tick.
    fn read_watts(&mut self) -> Option<f64>;

    /// Convenience: name from info.
    fn name(&self) -> &str {
        &self.info().name
    }
}

/// Monotonic energy counter, one read per tick.
pub trait EnergyCounterSource: Send {
    /// Source metadata.
    fn info(&self) -> &SourceInfo;

    /// Check if this source can operate on the current machine.
    fn is_available(&self) -> bool;

    /// Read the raw counter in microjoules, or `None` on failure.
    fn read_microjoules(&mut self) -> Option<u64>;

    /// The counter's rollover bound, fixed for the lifetime of the source.
    fn rollover_bound(&self) -> RolloverBound;

    /// Convenience: name from info.
    fn name(&self) -> &str {
        &self.info().name
    }
}

/// Platform source used when the operator disables BMC sampling.
pub struct NullPlatformSource {
    info: SourceInfo,
}

impl NullPlatformSource {
    pub fn new() -> Self {
        Self {
            info: SourceInfo {
                name: "disabled".to_string(),
                description: "platform power sampling disabled".to_string(),
                kind: SourceKind::PlatformPower,
            },
        }
    }
}

impl Default for NullPlatformSource {
    fn default() -> Self {
        Self::new()
    }
}

impl PlatformPowerSource for NullPlatformSource {
    fn info(&self) -> &SourceInfo {
        &self.info
    }

    fn is_available(&self) -> bool {
        false
    }

    fn read_watts(&mut self) -> Option<f64> {
        None
    }
}

/// Energy source used when the operator disables RAPL sampling.
pub struct NullEnergySource {
    info: SourceInfo,
}

impl NullEnergySource {
    pub fn new() -> Self {
        Self {
            info: SourceInfo {
                name: "disabled".to_string(),
                description: "energy counter sampling disabled".to_string(),
                kind: SourceKind::EnergyCounter,
            },
        }
    }
}

impl Default for NullEnergySource {
    fn default() -> Self {
        Self::new()
    }
}

impl EnergyCounterSource for NullEnergySource {
    fn info(&self) -> &SourceInfo {
        &self.info
    }

    fn is_available(&self) -> bool {
        false
    }

    fn read_microjoules(&mut self) -> Option<u64> {
        None
    }

    fn rollover_bound(&self) -> RolloverBound {
        RolloverBound::fallback()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_bound_is_32_bit() {
        assert_eq!(DEFAULT_MAX_ENERGY_UJ, 4_294_967_296);
        let b = RolloverBound::default();
        assert_eq!(b.origin, BoundOrigin::Default);
        assert_eq!(b.max_uj, DEFAULT_MAX_ENERGY_UJ);
    }

    #[test]
    fn test_caveat_only_for_default_bound() {
        assert!(RolloverBound::discovered(262_143_328_850).caveat().is_none());
        let caveat = RolloverBound::fallback().caveat().unwrap();
        assert!(caveat.contains("4294967296"));
    }

    #[test]
    fn test_null_sources_never_read() {
        let mut p = NullPlatformSource::new();
        let mut e = NullEnergySource::new();
        assert!(!p.is_available());
        assert!(!e.is_available());
        assert_eq!(p.read_watts(), None);
        assert_eq!(e.read_microjoules(), None);
        assert_eq!(p.info().kind, SourceKind::PlatformPower);
        assert_eq!(e.name(), "disabled");
    }

    #[test]
    fn test_display_names() {
        assert_eq!(SourceKind::EnergyCounter.to_string(), "energy_counter");
        assert_eq!(BoundOrigin::Discovered.to_string(), "discovered");
    }
}
