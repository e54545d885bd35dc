//! RAPL package energy via the Linux powercap interface.
//!
//! Each powercap zone directory exposes `energy_uj` (the running counter) and
//! `max_energy_range_uj` (the value it wraps at). See
//! <https://www.kernel.org/doc/html/latest/power/powercap/powercap.html>.

use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::source::{EnergyCounterSource, RolloverBound, SourceInfo, SourceKind};

/// Root of the powercap class in sysfs.
pub const POWERCAP_ROOT: &str = "/sys/class/powercap";

/// Zone directories tried, in order, when none is given.
pub const DEFAULT_ZONE_CANDIDATES: &[&str] = &[
    "/sys/class/powercap/intel-rapl:0",
    "/sys/class/powercap/intel-rapl/intel-rapl:0",
];

const ENERGY_FILE: &str = "energy_uj";
const MAX_ENERGY_FILE: &str = "max_energy_range_uj";

const PERMISSION_ADVICE: &str =
    "energy_uj is root-readable only on most kernels; try running with sudo";

fn read_counter(path: &Path) -> std::io::Result<u64> {
    let raw = std::fs::read_to_string(path)?;
    raw.trim().parse::<u64>().map_err(|e| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("parse '{}' from {}: {e}", raw.trim(), path.display()),
        )
    })
}

/// Pick the first default zone that has an `energy_uj` file.
pub fn default_zone() -> PathBuf {
    DEFAULT_ZONE_CANDIDATES
        .iter()
        .map(PathBuf::from)
        .find(|p| p.join(ENERGY_FILE).exists())
        .unwrap_or_else(|| PathBuf::from(DEFAULT_ZONE_CANDIDATES[0]))
}

/// Energy counter for one powercap zone (usually `package-0`).
pub struct RaplEnergySource {
    info: SourceInfo,
    energy_path: PathBuf,
    bound: RolloverBound,
}

impl RaplEnergySource {
    /// Open a zone directory. The rollover bound is read once here; if it
    /// can't be read the documented fallback is used.
    pub fn new(zone_dir: impl Into<PathBuf>) -> Self {
        let zone_dir = zone_dir.into();
        let energy_path = zone_dir.join(ENERGY_FILE);
        let bound = match read_counter(&zone_dir.join(MAX_ENERGY_FILE)) {
            Ok(max) if max > 0 => RolloverBound::discovered(max),
            Ok(_) => {
                log::warn!(
                    "{} reports a zero range, using fallback bound",
                    zone_dir.join(MAX_ENERGY_FILE).display()
                );
                RolloverBound::fallback()
            }
            Err(e) => {
                log::warn!("could not read energy range for {}: {e}", zone_dir.display());
                RolloverBound::fallback()
            }
        };
        let zone_name = std::fs::read_to_string(zone_dir.join("name"))
            .map(|s| s.trim().to_string())
            .unwrap_or_else(|_| "package".to_string());

        Self {
            info: SourceInfo {
                name: format!("rapl:{zone_name}"),
                description: format!("powercap energy counter at {}", energy_path.display()),
                kind: SourceKind::EnergyCounter,
            },
            energy_path,
            bound,
        }
    }

    /// Open the first default zone present on this machine.
    pub fn detect() -> Self {
        Self::new(default_zone())
    }

    pub fn energy_path(&self) -> &Path {
        &self.energy_path
    }
}

impl EnergyCounterSource for RaplEnergySource {
    fn info(&self) -> &SourceInfo {
        &self.info
    }

    fn is_available(&self) -> bool {
        read_counter(&self.energy_path).is_ok()
    }

    fn read_microjoules(&mut self) -> Option<u64> {
        match read_counter(&self.energy_path) {
            Ok(uj) => Some(uj),
            Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
                log::warn!("reading {}: {e} ({PERMISSION_ADVICE})", self.energy_path.display());
                None
            }
            Err(e) => {
                log::warn!("reading {}: {e}", self.energy_path.display());
                None
            }
        }
    }

    fn rollover_bound(&self) -> RolloverBound {
        self.bound
    }
}

// ---------------------------------------------------------------------------
// Zone discovery
// ---------------------------------------------------------------------------

/// A powercap zone as seen by `powermon probe`.
#[derive(Debug, Clone, Serialize)]
pub struct PowerZone {
    /// Zone name from the `name` file, e.g. `package-0`, `dram`, `psys`.
    pub name: String,
    pub path: PathBuf,
    pub max_energy_uj: Option<u64>,
    /// Whether `energy_uj` could be read by this process.
    pub readable: bool,
}

/// List the zones directly under a powercap root, sorted by path.
///
/// Only directories with an `energy_uj` file count as zones; control-type
/// directories such as `intel-rapl` itself are skipped.
pub fn discover_zones(root: &Path) -> Vec<PowerZone> {
    let Ok(entries) = std::fs::read_dir(root) else {
        return Vec::new();
    };

    let mut zones: Vec<PowerZone> = entries
        .flatten()
        .map(|e| e.path())
        .filter(|p| p.join(ENERGY_FILE).exists())
        .map(|path| {
            let name = std::fs::read_to_string(path.join("name"))
                .map(|s| s.trim().to_string())
                .unwrap_or_else(|_| {
                    path.file_name()
                        .map(|s| s.to_string_lossy().into_owned())
                        .unwrap_or_default()
                });
            PowerZone {
                name,
                max_energy_uj: read_counter(&path.join(MAX_ENERGY_FILE)).ok(),
                readable: read_counter(&path.join(ENERGY_FILE)).is_ok(),
                path,
            }
        })
        .collect();
    zones.sort_by(|a, b| a.path.cmp(&b.path));
    zones
}
