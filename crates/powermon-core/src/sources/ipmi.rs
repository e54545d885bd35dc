//! Platform power from the BMC via `ipmitool dcmi power reading`.
//!
//! The tool is treated as a black box: one synchronous call per tick, bounded
//! by a timeout, whose text output is reduced to a single wattage by
//! [`parse_dcmi_power_reading`].

use std::io::Read;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};

use crate::source::{PlatformPowerSource, SourceInfo, SourceKind};

/// Default per-call timeout for the BMC query.
pub const DEFAULT_IPMI_TIMEOUT: Duration = Duration::from_secs(5);

const POLL_INTERVAL: Duration = Duration::from_millis(5);
const READING_LABEL: &str = "Instantaneous power reading";

/// How to reach the BMC.
#[derive(Debug, Clone)]
pub struct IpmiConfig {
    /// Path or name of the `ipmitool` binary.
    pub tool: PathBuf,
    /// Remote BMC address; `None` queries the local BMC through the kernel driver.
    pub host: Option<String>,
    pub user: Option<String>,
    /// File holding the BMC password (`ipmitool -f`).
    pub password_file: Option<PathBuf>,
    pub timeout: Duration,
}

impl Default for IpmiConfig {
    fn default() -> Self {
        Self {
            tool: PathBuf::from("ipmitool"),
            host: None,
            user: None,
            password_file: None,
            timeout: DEFAULT_IPMI_TIMEOUT,
        }
    }
}

impl IpmiConfig {
    /// Arguments passed to the tool for one power reading.
    pub fn args(&self) -> Vec<String> {
        let mut args = Vec::new();
        if let Some(host) = &self.host {
            args.extend(["-I".to_string(), "lanplus".to_string(), "-H".to_string(), host.clone()]);
            if let Some(user) = &self.user {
                args.extend(["-U".to_string(), user.clone()]);
            }
            if let Some(pass) = &self.password_file {
                args.extend(["-f".to_string(), pass.display().to_string()]);
            }
        }
        args.extend(["dcmi", "power", "reading"].map(String::from));
        args
    }
}

/// Reduce `ipmitool dcmi power reading` output to watts.
///
/// Looks for a line like `    Instantaneous power reading:   182 Watts` and
/// parses the first token after the colon. Negative or non-finite values are
/// rejected.
pub fn parse_dcmi_power_reading(output: &str) -> Option<f64> {
    let line = output.lines().find(|l| l.contains(READING_LABEL))?;
    let (_, value) = line.split_once(':')?;
    let watts: f64 = value.split_whitespace().next()?.parse().ok()?;
    (watts.is_finite() && watts >= 0.0).then_some(watts)
}

/// Failure modes of a bounded command run.
#[derive(Debug)]
pub enum CommandError {
    Spawn(std::io::Error),
    Wait(std::io::Error),
    TimedOut(Duration),
    ExitStatus(std::process::ExitStatus),
}

impl std::fmt::Display for CommandError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Spawn(e) => write!(f, "could not start: {e}"),
            Self::Wait(e) => write!(f, "wait failed: {e}"),
            Self::TimedOut(t) => write!(f, "timed out after {:.2}s", t.as_secs_f64()),
            Self::ExitStatus(s) => write!(f, "exited with {s}"),
        }
    }
}

impl std::error::Error for CommandError {}

/// Run a command to completion or until `timeout`, returning stdout.
///
/// A child still running at the deadline is killed and reaped.
pub fn run_command_with_timeout(
    program: &std::ffi::OsStr,
    args: &[String],
    timeout: Duration,
) -> Result<String, CommandError> {
    let mut child = std::process::Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .map_err(CommandError::Spawn)?;

    let start = Instant::now();
    loop {
        match child.try_wait() {
            Ok(Some(status)) => {
                if !status.success() {
                    return Err(CommandError::ExitStatus(status));
                }
                let mut out = Vec::new();
                if let Some(mut stdout) = child.stdout.take() {
                    let _ = stdout.read_to_end(&mut out);
                }
                return Ok(String::from_utf8_lossy(&out).into_owned());
            }
            Ok(None) => {
                if start.elapsed() >= timeout {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(CommandError::TimedOut(timeout));
                }
                std::thread::sleep(POLL_INTERVAL);
            }
            Err(e) => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(CommandError::Wait(e));
            }
        }
    }
}

/// BMC platform power source.
pub struct IpmiPowerSource {
    info: SourceInfo,
    program: PathBuf,
    args: Vec<String>,
    timeout: Duration,
}

impl IpmiPowerSource {
    pub fn new(config: &IpmiConfig) -> Self {
        let target = config.host.as_deref().unwrap_or("local BMC");
        Self::with_command(config.tool.clone(), config.args(), config.timeout).described(format!(
            "ipmitool dcmi power reading ({target})"
        ))
    }

    /// Use an arbitrary command whose stdout follows the DCMI reading format.
    pub fn with_command(program: impl Into<PathBuf>, args: Vec<String>, timeout: Duration) -> Self {
        let program = program.into();
        Self {
            info: SourceInfo {
                name: "ipmi_dcmi".to_string(),
                description: format!("{} {}", program.display(), args.join(" ")),
                kind: SourceKind::PlatformPower,
            },
            program,
            args,
            timeout,
        }
    }

    fn described(mut self, description: String) -> Self {
        self.info.description = description;
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Tighten the per-call timeout; never loosens it.
    pub fn cap_timeout(&mut self, limit: Duration) {
        self.timeout = self.timeout.min(limit);
    }
}

impl PlatformPowerSource for IpmiPowerSource {
    fn info(&self) -> &SourceInfo {
        &self.info
    }

    fn is_available(&self) -> bool {
        run_command_with_timeout(self.program.as_os_str(), &self.args, self.timeout)
            .ok()
            .and_then(|out| parse_dcmi_power_reading(&out))
            .is_some()
    }

    fn read_watts(&mut self) -> Option<f64> {
        let result = run_command_with_timeout(self.program.as_os_str(), &self.args, self.timeout);
        let output = match result {
            Ok(out) => out,
            Err(e) => {
                log::warn!("{}: {e}", self.program.display());
                return None;
            }
        };
        let watts = parse_dcmi_power_reading(&output);
        if watts.is_none() {
            log::warn!("could not parse DCMI power reading from {} output", self.program.display());
        }
        watts
    }
}
