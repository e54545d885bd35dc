//! The sampling loop.
//!
//! State machine: `Idle -> Running -> Stopping -> Stopped`. One tick at a
//! time: wait for the tick boundary, read the energy counter, read platform
//! power, derive package power, record. Stop requests are honoured between
//! ticks; a tick in progress always completes so the sink never holds a
//! partial row.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, SecondsFormat, Utc};
use uuid::Uuid;

use crate::converter::EnergyConverter;
use crate::error::RunError;
use crate::platform::{CpuPowerState, detect_machine_info, is_privileged};
use crate::recorder::{CounterMeta, Recorder, RunMeta, SinkMode, SourceMeta};
use crate::sample::{RunClock, Sample};
use crate::source::{EnergyCounterSource, PlatformPowerSource};

/// Default sampling interval.
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(1);

/// Granularity of the stop-flag check while waiting for a tick.
const STOP_POLL: Duration = Duration::from_millis(10);

/// Share of the interval a single platform query may take.
const PLATFORM_TIMEOUT_SHARE: f64 = 0.9;

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

/// Configuration for one run.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub interval: Duration,
    /// `None` runs until interrupted.
    pub duration: Option<Duration>,
    pub output: PathBuf,
    pub sink_mode: SinkMode,
    /// Suppress the per-tick console line.
    pub quiet: bool,
    pub tags: BTreeMap<String, String>,
    pub note: Option<String>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_INTERVAL,
            duration: None,
            output: PathBuf::from("power.csv"),
            sink_mode: SinkMode::CreateNew,
            quiet: false,
            tags: BTreeMap::new(),
            note: None,
        }
    }
}

impl RunConfig {
    pub fn validate(&self) -> Result<(), RunError> {
        if self.interval.is_zero() {
            return Err(RunError::InvalidConfig(
                "interval must be greater than zero".to_string(),
            ));
        }
        if self.duration.is_some_and(|d| d.is_zero()) {
            return Err(RunError::InvalidConfig(
                "duration must be greater than zero".to_string(),
            ));
        }
        if self.output.as_os_str().is_empty() {
            return Err(RunError::InvalidConfig("output path is empty".to_string()));
        }
        Ok(())
    }

    /// Upper bound for one platform power query, kept below the interval.
    pub fn platform_timeout_limit(&self) -> Duration {
        self.interval.mul_f64(PLATFORM_TIMEOUT_SHARE)
    }
}

// ---------------------------------------------------------------------------
// State and results
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Idle,
    Running,
    Stopping,
    Stopped,
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Running => write!(f, "running"),
            Self::Stopping => write!(f, "stopping"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    DurationElapsed,
    Interrupted,
    SinkError,
}

impl std::fmt::Display for StopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DurationElapsed => write!(f, "duration_elapsed"),
            Self::Interrupted => write!(f, "interrupted"),
            Self::SinkError => write!(f, "sink_error"),
        }
    }
}

/// What a finished run reports to the operator.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub samples: u64,
    pub elapsed: Duration,
    pub stop_reason: StopReason,
    pub output: PathBuf,
    pub meta_path: PathBuf,
    pub appended: bool,
    pub platform_failures: u64,
    pub energy_failures: u64,
    pub wraparounds: u64,
    /// Set when the counter range is the fallback constant.
    pub caveat: Option<String>,
}

#[derive(Debug, Default)]
struct FailureCounts {
    platform: u64,
    energy: u64,
}

// ---------------------------------------------------------------------------
// Run
// ---------------------------------------------------------------------------

/// A run owns its sources and, once started, its sink.
pub struct Run {
    config: RunConfig,
    platform: Box<dyn PlatformPowerSource>,
    energy: Box<dyn EnergyCounterSource>,
    state: RunState,
}

impl Run {
    pub fn new(
        config: RunConfig,
        platform: Box<dyn PlatformPowerSource>,
        energy: Box<dyn EnergyCounterSource>,
    ) -> Self {
        Self {
            config,
            platform,
            energy,
            state: RunState::Idle,
        }
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    fn transition(&mut self, to: RunState) {
        log::debug!("run state {} -> {}", self.state, to);
        self.state = to;
    }

    /// Sample until the duration elapses or `running` is cleared.
    ///
    /// Fails before sampling if the config is invalid or the sink can't be
    /// opened. A mid-run write failure stops the run, finalizes what was
    /// written, and is returned as [`RunError::SinkWrite`].
    pub fn run(&mut self, running: &AtomicBool) -> Result<RunSummary, RunError> {
        self.config.validate()?;

        let machine = detect_machine_info();
        let cpu_state_start = CpuPowerState::capture();
        let platform_available = self.platform.is_available();
        let energy_available = self.energy.is_available();

        let mut recorder =
            Recorder::open(&self.config.output, self.config.sink_mode, !self.config.quiet)
                .map_err(|source| RunError::SinkOpen {
                    path: self.config.output.clone(),
                    source,
                })?;

        let bound = self.energy.rollover_bound();
        let caveat = bound.caveat();
        if let Some(c) = &caveat {
            log::warn!("{c}");
        }
        let mut converter = EnergyConverter::new(bound.max_uj);
        let mut failures = FailureCounts::default();

        let clock = RunClock::start();
        self.transition(RunState::Running);

        let mut next_tick = clock.started_at();
        let mut write_error = None;
        let stop_reason = loop {
            if !running.load(Ordering::SeqCst) {
                break StopReason::Interrupted;
            }
            if let Some(max) = self.config.duration {
                if next_tick.saturating_duration_since(clock.started_at()) >= max {
                    break StopReason::DurationElapsed;
                }
            }
            if !wait_until(next_tick, running) {
                break StopReason::Interrupted;
            }

            let sample = self.take_sample(&clock, &mut converter, &mut failures);
            if let Err(e) = recorder.record(&sample) {
                log::error!("write to {} failed: {e}", recorder.path().display());
                write_error = Some(e);
                break StopReason::SinkError;
            }

            // Drift is tolerated; an overrun tick re-bases the schedule.
            next_tick += self.config.interval;
            let now = Instant::now();
            if next_tick < now {
                next_tick = now;
            }
        };

        self.transition(RunState::Stopping);

        let elapsed = clock.elapsed();
        let samples = recorder.samples_written();
        let appended = recorder.appended();
        let output = recorder.path().to_path_buf();
        let ended_wall = clock.wall_at(Instant::now());

        let meta = RunMeta {
            version: 1,
            id: Uuid::new_v4().to_string(),
            started_at: iso8601(clock.started_wall()),
            ended_at: iso8601(ended_wall),
            duration_ms: elapsed.as_millis() as u64,
            interval_ms: self.config.interval.as_millis() as u64,
            requested_duration_ms: self.config.duration.map(|d| d.as_millis() as u64),
            total_samples: samples,
            stop_reason: stop_reason.to_string(),
            output: output.display().to_string(),
            appended,
            platform_source: SourceMeta {
                name: self.platform.name().to_string(),
                description: self.platform.info().description.clone(),
                available_at_start: platform_available,
                failed_reads: failures.platform,
            },
            energy_source: SourceMeta {
                name: self.energy.name().to_string(),
                description: self.energy.info().description.clone(),
                available_at_start: energy_available,
                failed_reads: failures.energy,
            },
            energy_counter: CounterMeta {
                max_energy_range_uj: bound.max_uj,
                range_origin: bound.origin.to_string(),
                caveat: caveat.clone(),
                wraparounds: converter.wraparounds(),
            },
            machine,
            cpu_state_start,
            cpu_state_end: CpuPowerState::capture(),
            privileged: is_privileged(),
            tags: self.config.tags.clone(),
            note: self.config.note.clone(),
            powermon_version: crate::VERSION.to_string(),
        };

        let finished = recorder.finish(&meta);
        self.transition(RunState::Stopped);

        if let Some(source) = write_error {
            if let Err(e) = finished {
                log::error!("best-effort finalize after write error also failed: {e}");
            }
            return Err(RunError::SinkWrite {
                samples_written: samples,
                source,
            });
        }
        let meta_path = finished.map_err(RunError::Finalize)?;

        Ok(RunSummary {
            samples,
            elapsed,
            stop_reason,
            output,
            meta_path,
            appended,
            platform_failures: failures.platform,
            energy_failures: failures.energy,
            wraparounds: converter.wraparounds(),
            caveat,
        })
    }

    /// Read both sources once. The energy counter is read first so its
    /// timestamp isn't skewed by a slow BMC query.
    fn take_sample(
        &mut self,
        clock: &RunClock,
        converter: &mut EnergyConverter,
        failures: &mut FailureCounts,
    ) -> Sample {
        let at = Instant::now();
        let (wall_clock_time, unix_time) = clock.stamp(at);

        let raw_energy_microjoules = self.energy.read_microjoules();
        let package_power_watts = match raw_energy_microjoules {
            Some(uj) => converter.update(uj, at),
            None => {
                failures.energy += 1;
                None
            }
        };

        let platform_power_watts = self.platform.read_watts();
        if platform_power_watts.is_none() {
            failures.platform += 1;
        }

        Sample {
            wall_clock_time,
            unix_time,
            platform_power_watts,
            package_power_watts,
            raw_energy_microjoules,
        }
    }
}

/// Sleep until `deadline`, returning early with `false` if `running` clears.
fn wait_until(deadline: Instant, running: &AtomicBool) -> bool {
    loop {
        if !running.load(Ordering::SeqCst) {
            return false;
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return true;
        }
        std::thread::sleep(remaining.min(STOP_POLL));
    }
}

fn iso8601(t: std::time::SystemTime) -> String {
    let dt: DateTime<Utc> = t.into();
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::{RolloverBound, SourceInfo, SourceKind};
    use std::collections::VecDeque;
    use std::sync::Arc;

    /// Platform source replaying scripted readings, then repeating the last.
    struct ScriptedPlatform {
        info: SourceInfo,
        readings: VecDeque<Option<f64>>,
    }

    impl ScriptedPlatform {
        fn new(readings: Vec<Option<f64>>) -> Self {
            Self {
                info: SourceInfo {
                    name: "mock_bmc".to_string(),
                    description: "scripted".to_string(),
                    kind: SourceKind::PlatformPower,
                },
                readings: readings.into(),
            }
        }
    }

    impl PlatformPowerSource for ScriptedPlatform {
        fn info(&self) -> &SourceInfo {
            &self.info
        }
        fn is_available(&self) -> bool {
            true
        }
        fn read_watts(&mut self) -> Option<f64> {
            if self.readings.len() > 1 {
                self.readings.pop_front().flatten()
            } else {
                self.readings.front().copied().flatten()
            }
        }
    }

    /// Energy source replaying scripted counter values.
    struct ScriptedEnergy {
        info: SourceInfo,
        readings: VecDeque<Option<u64>>,
        bound: RolloverBound,
    }

    impl ScriptedEnergy {
        fn new(readings: Vec<Option<u64>>, bound: RolloverBound) -> Self {
            Self {
                info: SourceInfo {
                    name: "mock_rapl".to_string(),
                    description: "scripted".to_string(),
                    kind: SourceKind::EnergyCounter,
                },
                readings: readings.into(),
                bound,
            }
        }
    }

    impl EnergyCounterSource for ScriptedEnergy {
        fn info(&self) -> &SourceInfo {
            &self.info
        }
        fn is_available(&self) -> bool {
            true
        }
        fn read_microjoules(&mut self) -> Option<u64> {
            if self.readings.len() > 1 {
                self.readings.pop_front().flatten()
            } else {
                self.readings.front().copied().flatten()
            }
        }
        fn rollover_bound(&self) -> RolloverBound {
            self.bound
        }
    }

    fn config(dir: &std::path::Path, interval_ms: u64, duration_ms: Option<u64>) -> RunConfig {
        RunConfig {
            interval: Duration::from_millis(interval_ms),
            duration: duration_ms.map(Duration::from_millis),
            output: dir.join("run.csv"),
            quiet: true,
            ..Default::default()
        }
    }

    fn rows(path: &std::path::Path) -> Vec<Vec<String>> {
        std::fs::read_to_string(path)
            .unwrap()
            .lines()
            .skip(1)
            .map(|l| l.split(',').map(str::to_string).collect())
            .collect()
    }

    // -----------------------------------------------------------------------
    // Config
    // -----------------------------------------------------------------------

    #[test]
    fn test_validate_rejects_zero_interval_and_duration() {
        let cfg = RunConfig {
            interval: Duration::ZERO,
            ..Default::default()
        };
        assert!(matches!(cfg.validate(), Err(RunError::InvalidConfig(_))));
        let cfg = RunConfig {
            duration: Some(Duration::ZERO),
            ..Default::default()
        };
        assert!(matches!(cfg.validate(), Err(RunError::InvalidConfig(_))));
        assert!(RunConfig::default().validate().is_ok());
    }

    #[test]
    fn test_platform_timeout_below_interval() {
        let cfg = RunConfig::default();
        assert!(cfg.platform_timeout_limit() < cfg.interval);
        assert_eq!(cfg.platform_timeout_limit(), Duration::from_millis(900));
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    #[test]
    fn test_duration_bound_self_terminates() {
        let tmp = tempfile::tempdir().unwrap();
        let mut run = Run::new(
            config(tmp.path(), 50, Some(150)),
            Box::new(ScriptedPlatform::new(vec![Some(100.0)])),
            Box::new(ScriptedEnergy::new(
                vec![Some(0), Some(1000), Some(2000), Some(3000), Some(4000)],
                RolloverBound::discovered(1_000_000),
            )),
        );
        assert_eq!(run.state(), RunState::Idle);

        let running = AtomicBool::new(true);
        let summary = run.run(&running).unwrap();

        assert_eq!(run.state(), RunState::Stopped);
        assert_eq!(summary.stop_reason, StopReason::DurationElapsed);
        assert!((2..=4).contains(&summary.samples), "got {}", summary.samples);
        assert_eq!(rows(&summary.output).len() as u64, summary.samples);
        assert!(summary.meta_path.exists());
    }

    #[test]
    fn test_first_sample_has_no_package_power() {
        let tmp = tempfile::tempdir().unwrap();
        let mut run = Run::new(
            config(tmp.path(), 20, Some(60)),
            Box::new(ScriptedPlatform::new(vec![Some(100.0)])),
            Box::new(ScriptedEnergy::new(
                vec![Some(100), Some(150), Some(200)],
                RolloverBound::discovered(1000),
            )),
        );
        let summary = run.run(&AtomicBool::new(true)).unwrap();
        let rows = rows(&summary.output);

        assert_eq!(rows[0][3], "");
        assert_eq!(rows[0][4], "100");
        assert_eq!(rows[0][2], "100");
        for row in &rows[1..] {
            let w: f64 = row[3].parse().unwrap();
            assert!(w >= 0.0);
        }
    }

    #[test]
    fn test_unix_time_strictly_increasing() {
        let tmp = tempfile::tempdir().unwrap();
        let mut run = Run::new(
            config(tmp.path(), 10, Some(100)),
            Box::new(ScriptedPlatform::new(vec![None])),
            Box::new(ScriptedEnergy::new(vec![Some(5)], RolloverBound::discovered(1000))),
        );
        let summary = run.run(&AtomicBool::new(true)).unwrap();
        let times: Vec<f64> = rows(&summary.output)
            .iter()
            .map(|r| r[1].parse().unwrap())
            .collect();
        assert!(times.len() >= 2);
        assert!(times.windows(2).all(|w| w[1] > w[0]));
    }

    #[test]
    fn test_partial_availability_is_recorded() {
        let tmp = tempfile::tempdir().unwrap();
        let mut run = Run::new(
            config(tmp.path(), 50, Some(150)),
            Box::new(ScriptedPlatform::new(vec![None])),
            Box::new(ScriptedEnergy::new(
                vec![Some(10), None, Some(30)],
                RolloverBound::discovered(1000),
            )),
        );
        let summary = run.run(&AtomicBool::new(true)).unwrap();
        let rows = rows(&summary.output);
        assert_eq!(rows.len(), 3);
        assert!(rows.iter().all(|r| r[2].is_empty()));
        assert_eq!(rows[1][4], "");
        assert_eq!(rows[1][3], "");
        // Third tick derives power against the first reading.
        assert!(!rows[2][3].is_empty());
        assert_eq!(summary.platform_failures, 3);
        assert_eq!(summary.energy_failures, 1);
    }

    #[test]
    fn test_wraparound_counted_and_non_negative() {
        let tmp = tempfile::tempdir().unwrap();
        let mut run = Run::new(
            config(tmp.path(), 20, Some(60)),
            Box::new(ScriptedPlatform::new(vec![Some(1.0)])),
            Box::new(ScriptedEnergy::new(
                vec![Some(900), Some(950), Some(50)],
                RolloverBound::discovered(1000),
            )),
        );
        let summary = run.run(&AtomicBool::new(true)).unwrap();
        assert_eq!(summary.wraparounds, 1);
        for row in &rows(&summary.output)[1..] {
            assert!(row[3].parse::<f64>().unwrap() >= 0.0);
        }
    }

    #[test]
    fn test_default_bound_caveat_in_meta() {
        let tmp = tempfile::tempdir().unwrap();
        let mut run = Run::new(
            config(tmp.path(), 20, Some(40)),
            Box::new(ScriptedPlatform::new(vec![Some(1.0)])),
            Box::new(ScriptedEnergy::new(vec![Some(1)], RolloverBound::fallback())),
        );
        let summary = run.run(&AtomicBool::new(true)).unwrap();
        assert!(summary.caveat.is_some());
        let meta: RunMeta =
            serde_json::from_str(&std::fs::read_to_string(&summary.meta_path).unwrap()).unwrap();
        assert_eq!(meta.energy_counter.range_origin, "default");
        assert!(meta.energy_counter.caveat.is_some());
    }

    #[test]
    fn test_interrupt_finalizes_sink() {
        let tmp = tempfile::tempdir().unwrap();
        let running = Arc::new(AtomicBool::new(true));
        let r = running.clone();
        let stopper = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(120));
            r.store(false, Ordering::SeqCst);
        });

        let mut run = Run::new(
            config(tmp.path(), 20, None),
            Box::new(ScriptedPlatform::new(vec![Some(200.0)])),
            Box::new(ScriptedEnergy::new(vec![Some(7)], RolloverBound::discovered(1000))),
        );
        let summary = run.run(&running).unwrap();
        stopper.join().unwrap();

        assert_eq!(summary.stop_reason, StopReason::Interrupted);
        assert!(summary.samples >= 1);
        let csv = std::fs::read_to_string(&summary.output).unwrap();
        assert!(csv.ends_with('\n'));
        let rows = rows(&summary.output);
        assert_eq!(rows.len() as u64, summary.samples);
        assert!(rows.iter().all(|r| r.len() == 5));
        assert!(summary.meta_path.exists());
    }

    #[test]
    fn test_already_interrupted_records_nothing() {
        let tmp = tempfile::tempdir().unwrap();
        let mut run = Run::new(
            config(tmp.path(), 20, None),
            Box::new(ScriptedPlatform::new(vec![Some(1.0)])),
            Box::new(ScriptedEnergy::new(vec![Some(1)], RolloverBound::discovered(10))),
        );
        let summary = run.run(&AtomicBool::new(false)).unwrap();
        assert_eq!(summary.samples, 0);
        assert_eq!(summary.stop_reason, StopReason::Interrupted);
    }

    #[test]
    fn test_sink_open_failure_never_runs() {
        let tmp = tempfile::tempdir().unwrap();
        let cfg = config(tmp.path(), 20, Some(40));
        std::fs::write(&cfg.output, "existing\n").unwrap();

        let mut run = Run::new(
            cfg,
            Box::new(ScriptedPlatform::new(vec![Some(1.0)])),
            Box::new(ScriptedEnergy::new(vec![Some(1)], RolloverBound::discovered(10))),
        );
        let err = run.run(&AtomicBool::new(true)).err().unwrap();
        assert!(matches!(err, RunError::SinkOpen { .. }));
        assert_eq!(run.state(), RunState::Idle);
    }

    #[test]
    fn test_wait_until_returns_false_when_stopped() {
        let running = AtomicBool::new(false);
        assert!(!wait_until(Instant::now() + Duration::from_secs(5), &running));
        let running = AtomicBool::new(true);
        assert!(wait_until(Instant::now(), &running));
    }
}
