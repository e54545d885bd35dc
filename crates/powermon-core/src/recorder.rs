//! CSV recording of a run, plus a JSON metadata sidecar.
//!
//! # Storage Format
//!
//! A run writes two files next to each other:
//! - `<name>.csv`: one header row, then one row per sample, written per tick
//! - `<name>.meta.json`: run metadata, written once at finalize
//!
//! The CSV is owned exclusively by one [`Recorder`] for the run's lifetime.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::platform::{CpuPowerState, MachineInfo};
use crate::sample::{CSV_HEADER, Sample};

// ---------------------------------------------------------------------------
// Sink mode
// ---------------------------------------------------------------------------

/// What to do when the output path already exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SinkMode {
    /// Refuse a non-empty existing file. An empty file is reused.
    #[default]
    CreateNew,
    /// Append rows; the header is only written to a new or empty file.
    Append,
    /// Truncate and start over.
    Overwrite,
}

impl std::fmt::Display for SinkMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::CreateNew => write!(f, "create"),
            Self::Append => write!(f, "append"),
            Self::Overwrite => write!(f, "overwrite"),
        }
    }
}

/// Sidecar path for an output file: `run.csv` -> `run.meta.json`.
pub fn meta_path_for(output: &Path) -> PathBuf {
    let stem = output
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "powermon".to_string());
    output.with_file_name(format!("{stem}.meta.json"))
}

// ---------------------------------------------------------------------------
// Run metadata (<name>.meta.json)
// ---------------------------------------------------------------------------

/// One telemetry source as described in the metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceMeta {
    pub name: String,
    pub description: String,
    pub available_at_start: bool,
    /// Ticks on which this source returned no value.
    pub failed_reads: u64,
}

/// Energy counter range and wrap accounting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CounterMeta {
    pub max_energy_range_uj: u64,
    /// `discovered` or `default`.
    pub range_origin: String,
    /// Set when the range is the fallback constant.
    pub caveat: Option<String>,
    pub wraparounds: u64,
}

/// Run metadata written at the end of recording.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunMeta {
    pub version: u32,
    pub id: String,
    pub started_at: String,
    pub ended_at: String,
    pub duration_ms: u64,
    pub interval_ms: u64,
    pub requested_duration_ms: Option<u64>,
    pub total_samples: u64,
    pub stop_reason: String,
    pub output: String,
    /// Rows were appended to a pre-existing file.
    pub appended: bool,
    pub platform_source: SourceMeta,
    pub energy_source: SourceMeta,
    pub energy_counter: CounterMeta,
    pub machine: MachineInfo,
    pub cpu_state_start: CpuPowerState,
    pub cpu_state_end: CpuPowerState,
    pub privileged: bool,
    pub tags: BTreeMap<String, String>,
    pub note: Option<String>,
    pub powermon_version: String,
}

// ---------------------------------------------------------------------------
// Recorder
// ---------------------------------------------------------------------------

/// Append-only CSV sink with optional console echo.
///
/// Each row goes to the file in a single write. `committed` is the file
/// length after the last complete row; a failed write is cut back to it so
/// the file never ends in a partial row.
pub struct Recorder {
    path: PathBuf,
    file: File,
    committed: u64,
    echo: bool,
    appended: bool,
    samples_written: u64,
}

impl Recorder {
    /// Open the sink and write the header when the file is new or empty.
    pub fn open(path: &Path, mode: SinkMode, echo: bool) -> std::io::Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        // Always O_APPEND, so a truncated file is written at its new end.
        let mut file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(path)?;
        let existing = file.metadata()?.len();
        match mode {
            SinkMode::CreateNew if existing > 0 => {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::AlreadyExists,
                    "file exists and is not empty (use append or overwrite)",
                ));
            }
            SinkMode::Overwrite if existing > 0 => file.set_len(0)?,
            SinkMode::Append if existing > 0 && !ends_with_newline(&mut file)? => {
                log::warn!(
                    "{} does not end with a newline; terminating its last line before appending",
                    path.display()
                );
                file.write_all(b"\n")?;
            }
            _ => {}
        }

        let appended = file.metadata()?.len() > 0;
        if !appended {
            file.write_all(format!("{CSV_HEADER}\n").as_bytes())?;
        }
        let committed = file.metadata()?.len();

        Ok(Self {
            path: path.to_path_buf(),
            file,
            committed,
            echo,
            appended,
            samples_written: 0,
        })
    }

    /// Write one row; echo to stdout if enabled.
    ///
    /// On failure the file is truncated back to the last complete row.
    pub fn record(&mut self, sample: &Sample) -> std::io::Result<()> {
        let row = format!("{}\n", sample.to_csv_row());
        if let Err(e) = self.file.write_all(row.as_bytes()) {
            if let Err(te) = self.file.set_len(self.committed) {
                log::error!("could not cut {} back to its last row: {te}", self.path.display());
            }
            return Err(e);
        }
        self.committed += row.len() as u64;
        self.samples_written += 1;

        if self.echo {
            println!("{}", sample.console_line());
        }
        Ok(())
    }

    /// Sync the CSV, then write the metadata sidecar.
    /// Returns the sidecar path.
    pub fn finish(self, meta: &RunMeta) -> std::io::Result<PathBuf> {
        self.file.sync_all()?;

        let json = serde_json::to_string_pretty(meta).map_err(std::io::Error::other)?;
        let meta_path = meta_path_for(&self.path);
        fs::write(&meta_path, json)?;
        Ok(meta_path)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn samples_written(&self) -> u64 {
        self.samples_written
    }

    /// True when rows go after existing content (no header was written).
    pub fn appended(&self) -> bool {
        self.appended
    }

    /// File length through the last complete row.
    pub fn committed_len(&self) -> u64 {
        self.committed
    }
}

fn ends_with_newline(file: &mut File) -> std::io::Result<bool> {
    let mut last = [0u8; 1];
    file.seek(SeekFrom::End(-1))?;
    file.read_exact(&mut last)?;
    Ok(last[0] == b'\n')
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(n: u64) -> Sample {
        Sample {
            wall_clock_time: format!("2026-10-19 10:00:0{n}.000"),
            unix_time: 1_792_400_000.0 + n as f64,
            platform_power_watts: Some(150.0),
            package_power_watts: if n == 0 { None } else { Some(42.5) },
            raw_energy_microjoules: Some(1000 * n),
        }
    }

    fn meta() -> RunMeta {
        RunMeta {
            version: 1,
            id: "test-id".to_string(),
            started_at: "2026-10-19T10:00:00Z".to_string(),
            ended_at: "2026-10-19T10:00:03Z".to_string(),
            duration_ms: 3000,
            interval_ms: 1000,
            requested_duration_ms: Some(3000),
            total_samples: 3,
            stop_reason: "duration_elapsed".to_string(),
            output: "out.csv".to_string(),
            appended: false,
            platform_source: SourceMeta {
                name: "ipmi_dcmi".to_string(),
                description: "test".to_string(),
                available_at_start: true,
                failed_reads: 0,
            },
            energy_source: SourceMeta {
                name: "rapl:package-0".to_string(),
                description: "test".to_string(),
                available_at_start: true,
                failed_reads: 1,
            },
            energy_counter: CounterMeta {
                max_energy_range_uj: 262_143_328_850,
                range_origin: "discovered".to_string(),
                caveat: None,
                wraparounds: 0,
            },
            machine: crate::platform::detect_machine_info(),
            cpu_state_start: CpuPowerState::default(),
            cpu_state_end: CpuPowerState::default(),
            privileged: false,
            tags: BTreeMap::new(),
            note: None,
            powermon_version: crate::VERSION.to_string(),
        }
    }

    // -----------------------------------------------------------------------
    // Sink modes
    // -----------------------------------------------------------------------

    #[test]
    fn test_new_file_gets_header() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("run.csv");
        let rec = Recorder::open(&path, SinkMode::CreateNew, false).unwrap();
        assert!(!rec.appended());
        let csv = fs::read_to_string(&path).unwrap();
        assert_eq!(csv, format!("{CSV_HEADER}\n"));
    }

    #[test]
    fn test_creates_parent_directories() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("a/b/run.csv");
        Recorder::open(&path, SinkMode::CreateNew, false).unwrap();
        assert!(path.exists());
    }

    #[test]
    fn test_create_new_refuses_non_empty_file() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("run.csv");
        fs::write(&path, "precious data\n").unwrap();
        let err = Recorder::open(&path, SinkMode::CreateNew, false).err().unwrap();
        assert_eq!(err.kind(), std::io::ErrorKind::AlreadyExists);
        assert_eq!(fs::read_to_string(&path).unwrap(), "precious data\n");
    }

    #[test]
    fn test_create_new_reuses_empty_file() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("run.csv");
        fs::write(&path, "").unwrap();
        Recorder::open(&path, SinkMode::CreateNew, false).unwrap();
        assert!(fs::read_to_string(&path).unwrap().starts_with("timestamp,"));
    }

    #[test]
    fn test_append_skips_header_on_existing_file() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("run.csv");

        let mut rec = Recorder::open(&path, SinkMode::Append, false).unwrap();
        rec.record(&sample(0)).unwrap();
        drop(rec);

        let mut rec = Recorder::open(&path, SinkMode::Append, false).unwrap();
        assert!(rec.appended());
        rec.record(&sample(1)).unwrap();
        drop(rec);

        let csv = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = csv.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], CSV_HEADER);
        assert_eq!(csv.matches("timestamp,").count(), 1);
    }

    #[test]
    fn test_append_terminates_dangling_last_line() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("run.csv");
        fs::write(&path, format!("{CSV_HEADER}\n2026-10-19 10:00:00.000,17924")).unwrap();

        let mut rec = Recorder::open(&path, SinkMode::Append, false).unwrap();
        assert!(rec.appended());
        rec.record(&sample(1)).unwrap();
        drop(rec);

        let csv = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = csv.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[1], "2026-10-19 10:00:00.000,17924");
        assert_eq!(lines[2], sample(1).to_csv_row());
        assert!(csv.ends_with('\n'));
    }

    #[test]
    fn test_overwrite_truncates() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("run.csv");
        fs::write(&path, "old,row\nold,row\n").unwrap();
        Recorder::open(&path, SinkMode::Overwrite, false).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), format!("{CSV_HEADER}\n"));
    }

    // -----------------------------------------------------------------------
    // Rows and finalize
    // -----------------------------------------------------------------------

    #[test]
    fn test_rows_are_flushed_per_record() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("run.csv");
        let mut rec = Recorder::open(&path, SinkMode::CreateNew, false).unwrap();
        rec.record(&sample(0)).unwrap();
        rec.record(&sample(1)).unwrap();

        // Visible on disk before finish.
        let csv = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = csv.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[1].ends_with(",150,,0"));
        assert!(lines[2].ends_with(",150,42.5,1000"));
        assert_eq!(rec.samples_written(), 2);
        assert_eq!(rec.committed_len(), csv.len() as u64);
    }

    #[test]
    fn test_finish_writes_meta_sidecar() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("run.csv");
        let mut rec = Recorder::open(&path, SinkMode::CreateNew, false).unwrap();
        rec.record(&sample(0)).unwrap();
        let meta_path = rec.finish(&meta()).unwrap();

        assert_eq!(meta_path, tmp.path().join("run.meta.json"));
        let parsed: RunMeta =
            serde_json::from_str(&fs::read_to_string(&meta_path).unwrap()).unwrap();
        assert_eq!(parsed.version, 1);
        assert_eq!(parsed.total_samples, 3);
        assert_eq!(parsed.energy_counter.range_origin, "discovered");
        assert_eq!(parsed.energy_source.failed_reads, 1);
    }

    #[test]
    fn test_meta_path_for() {
        assert_eq!(
            meta_path_for(Path::new("/data/baseline.csv")),
            PathBuf::from("/data/baseline.meta.json")
        );
        assert_eq!(meta_path_for(Path::new("run")), PathBuf::from("run.meta.json"));
    }

    #[test]
    fn test_sink_mode_display() {
        assert_eq!(SinkMode::default().to_string(), "create");
        assert_eq!(SinkMode::Append.to_string(), "append");
    }
}
