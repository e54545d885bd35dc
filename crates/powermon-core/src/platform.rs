//! Machine identity and CPU power-management state, best effort.
//!
//! Frequency pinning, idle-state selection and isolation are configured by
//! other tools and may change while a run is in progress. The sampler never
//! depends on them; it only snapshots what `/sys/devices/system/cpu` reports
//! at run start and end so recordings can be compared across scenarios.

use std::collections::BTreeSet;
use std::path::Path;

use serde::{Deserialize, Serialize};

/// sysfs directory holding per-CPU power-management state.
pub const CPU_SYSFS_ROOT: &str = "/sys/devices/system/cpu";

// ---------------------------------------------------------------------------
// Machine info
// ---------------------------------------------------------------------------

/// Machine information captured at run start.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MachineInfo {
    pub os: String,
    pub arch: String,
    pub chip: String,
    pub cores: usize,
    pub hostname: Option<String>,
}

/// Detect machine information (best-effort).
pub fn detect_machine_info() -> MachineInfo {
    let os = format!(
        "{} {}",
        std::env::consts::OS,
        os_version().unwrap_or_default()
    );
    let arch = std::env::consts::ARCH.to_string();
    let chip = detect_chip().unwrap_or_else(|| "unknown".to_string());
    let cores = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);

    MachineInfo {
        os: os.trim().to_string(),
        arch,
        chip,
        cores,
        hostname: read_trimmed(Path::new("/proc/sys/kernel/hostname")),
    }
}

fn os_version() -> Option<String> {
    std::fs::read_to_string("/etc/os-release").ok().and_then(|s| {
        s.lines()
            .find(|l| l.starts_with("PRETTY_NAME="))
            .map(|l| l.trim_start_matches("PRETTY_NAME=").trim_matches('"').to_string())
    })
}

fn detect_chip() -> Option<String> {
    std::fs::read_to_string("/proc/cpuinfo").ok().and_then(|s| {
        s.lines()
            .find(|l| l.starts_with("model name"))
            .map(|l| l.split(':').nth(1).unwrap_or("").trim().to_string())
    })
}

/// True when running with an effective UID of 0.
pub fn is_privileged() -> bool {
    // SAFETY: `geteuid` has no preconditions and cannot fail.
    unsafe { libc::geteuid() == 0 }
}

// ---------------------------------------------------------------------------
// CPU power state
// ---------------------------------------------------------------------------

/// Snapshot of frequency and idle-state configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CpuPowerState {
    /// CPUs with a `cpufreq` directory.
    pub cpus_sampled: usize,
    pub scaling_driver: Option<String>,
    /// Distinct governors across CPUs, sorted.
    pub governors: Vec<String>,
    pub cur_freq_khz_min: Option<u64>,
    pub cur_freq_khz_avg: Option<u64>,
    pub cur_freq_khz_max: Option<u64>,
    /// Distinct `scaling_max_freq` limits across CPUs, sorted.
    pub scaling_max_freq_khz: Vec<u64>,
    /// Count of `(cpu, idle state)` pairs with `disable` set to 1.
    pub disabled_idle_states: usize,
    /// Isolated CPU list as the kernel reports it, e.g. `2-5`.
    pub isolated: Option<String>,
}

impl CpuPowerState {
    /// Read from the live sysfs tree.
    pub fn capture() -> Self {
        Self::read_from(Path::new(CPU_SYSFS_ROOT))
    }

    /// Read from an arbitrary root laid out like `/sys/devices/system/cpu`.
    pub fn read_from(root: &Path) -> Self {
        let mut state = Self {
            isolated: read_trimmed(&root.join("isolated")),
            ..Self::default()
        };

        let Ok(entries) = std::fs::read_dir(root) else {
            return state;
        };

        let mut cpu_dirs: Vec<(usize, std::path::PathBuf)> = entries
            .flatten()
            .filter_map(|e| {
                let path = e.path();
                let id = path
                    .file_name()?
                    .to_str()?
                    .strip_prefix("cpu")?
                    .parse::<usize>()
                    .ok()?;
                Some((id, path))
            })
            .collect();
        cpu_dirs.sort_by_key(|(id, _)| *id);

        let mut governors = BTreeSet::new();
        let mut max_limits = BTreeSet::new();
        let mut freqs: Vec<u64> = Vec::new();

        for (_, dir) in &cpu_dirs {
            let cpufreq = dir.join("cpufreq");
            if cpufreq.is_dir() {
                state.cpus_sampled += 1;
                if state.scaling_driver.is_none() {
                    state.scaling_driver = read_trimmed(&cpufreq.join("scaling_driver"));
                }
                if let Some(g) = read_trimmed(&cpufreq.join("scaling_governor")) {
                    governors.insert(g);
                }
                if let Some(m) = read_u64(&cpufreq.join("scaling_max_freq")) {
                    max_limits.insert(m);
                }
                if let Some(f) = read_u64(&cpufreq.join("scaling_cur_freq"))
                    .or_else(|| read_u64(&cpufreq.join("cpuinfo_cur_freq")))
                {
                    freqs.push(f);
                }
            }

            let Ok(states) = std::fs::read_dir(dir.join("cpuidle")) else {
                continue;
            };
            state.disabled_idle_states += states
                .flatten()
                .filter(|s| read_u64(&s.path().join("disable")) == Some(1))
                .count();
        }

        if !freqs.is_empty() {
            state.cur_freq_khz_min = freqs.iter().min().copied();
            state.cur_freq_khz_max = freqs.iter().max().copied();
            state.cur_freq_khz_avg = Some(freqs.iter().sum::<u64>() / freqs.len() as u64);
        }
        state.governors = governors.into_iter().collect();
        state.scaling_max_freq_khz = max_limits.into_iter().collect();
        state
    }
}

fn read_trimmed(path: &Path) -> Option<String> {
    let raw = std::fs::read_to_string(path).ok()?;
    let v = raw.trim();
    if v.is_empty() {
        None
    } else {
        Some(v.to_string())
    }
}

fn read_u64(path: &Path) -> Option<u64> {
    read_trimmed(path)?.parse().ok()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
