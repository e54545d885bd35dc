//! One observation per tick, and the clock that stamps it.

use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Local};

/// Column names, in output order.
pub const CSV_HEADER: &str = "timestamp,timestamp_unix,ipmi_watts,rapl_pkg_watts,rapl_energy_uj";

const WALL_CLOCK_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

/// A single sample.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    /// Local time, millisecond precision.
    pub wall_clock_time: String,
    /// Seconds since the Unix epoch.
    pub unix_time: f64,
    pub platform_power_watts: Option<f64>,
    /// Average package power since the previous energy reading.
    pub package_power_watts: Option<f64>,
    pub raw_energy_microjoules: Option<u64>,
}

impl Sample {
    /// Render as one CSV row (no trailing newline). Absent values are empty.
    pub fn to_csv_row(&self) -> String {
        format!(
            "{},{:.6},{},{},{}",
            self.wall_clock_time,
            self.unix_time,
            fmt_opt_f64(self.platform_power_watts),
            fmt_opt_f64(self.package_power_watts),
            self.raw_energy_microjoules
                .map(|v| v.to_string())
                .unwrap_or_default(),
        )
    }

    /// Human-readable console line.
    pub fn console_line(&self) -> String {
        let ipmi = fmt_watts(self.platform_power_watts);
        let rapl = fmt_watts(self.package_power_watts);
        format!("[{}] IPMI: {ipmi:>10} | RAPL Package: {rapl:>10}", self.wall_clock_time)
    }
}

fn fmt_opt_f64(v: Option<f64>) -> String {
    // f64 Display never switches to exponent notation.
    v.map(|x| x.to_string()).unwrap_or_default()
}

fn fmt_watts(v: Option<f64>) -> String {
    v.map(|w| format!("{w:.2}W")).unwrap_or_else(|| "N/A".to_string())
}

/// Clock shared by all samples of a run.
///
/// Wall time is the wall clock at run start plus monotonic elapsed time, so
/// timestamps never step backwards when NTP adjusts the system clock
/// mid-run.
#[derive(Debug, Clone, Copy)]
pub struct RunClock {
    started_wall: SystemTime,
    started: Instant,
}

impl RunClock {
    pub fn start() -> Self {
        Self {
            started_wall: SystemTime::now(),
            started: Instant::now(),
        }
    }

    pub fn started_at(&self) -> Instant {
        self.started
    }

    pub fn started_wall(&self) -> SystemTime {
        self.started_wall
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Wall-clock time corresponding to a monotonic instant of this run.
    pub fn wall_at(&self, at: Instant) -> SystemTime {
        self.started_wall + at.saturating_duration_since(self.started)
    }

    /// `(wall_clock_time, unix_time)` for a monotonic instant.
    pub fn stamp(&self, at: Instant) -> (String, f64) {
        let wall = self.wall_at(at);
        let unix = wall
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs_f64();
        let local: DateTime<Local> = wall.into();
        (local.format(WALL_CLOCK_FORMAT).to_string(), unix)
    }
}
