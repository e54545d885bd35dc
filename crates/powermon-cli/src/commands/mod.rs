pub mod probe;
pub mod record;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use powermon_core::IpmiConfig;

/// Parse a duration like "1", "1.5", "500ms", "2s", "1m", "1h".
/// A bare number is seconds.
pub fn parse_seconds(s: &str) -> Result<Duration, String> {
    let s = s.trim();

    let (numeric, multiplier) = if let Some(rest) = s.strip_suffix("ms") {
        (rest, 0.001)
    } else if let Some(rest) = s.strip_suffix('s') {
        (rest, 1.0)
    } else if let Some(rest) = s.strip_suffix('m') {
        (rest, 60.0)
    } else if let Some(rest) = s.strip_suffix('h') {
        (rest, 3600.0)
    } else {
        (s, 1.0)
    };

    let value: f64 = numeric
        .trim()
        .parse()
        .map_err(|_| format!("invalid duration: '{s}'"))?;
    if !value.is_finite() || value <= 0.0 {
        return Err(format!("duration must be positive: '{s}'"));
    }
    Duration::try_from_secs_f64(value * multiplier)
        .map_err(|e| format!("invalid duration '{s}': {e}"))
}

/// Turn `key:value` strings into a tag map. Malformed entries are skipped
/// with a warning.
pub fn parse_tags(tags: &[String]) -> BTreeMap<String, String> {
    let mut map = BTreeMap::new();
    for tag in tags {
        match tag.split_once(':') {
            Some((k, v)) if !k.trim().is_empty() => {
                map.insert(k.trim().to_string(), v.trim().to_string());
            }
            _ => log::warn!("ignoring malformed tag '{tag}' (expected key:value)"),
        }
    }
    map
}

pub fn ipmi_config(
    tool: PathBuf,
    host: Option<String>,
    user: Option<String>,
    password_file: Option<PathBuf>,
    timeout_secs: f64,
) -> IpmiConfig {
    let timeout = Duration::try_from_secs_f64(timeout_secs)
        .ok()
        .filter(|d| !d.is_zero())
        .unwrap_or_else(|| {
            log::warn!("ignoring ipmi timeout {timeout_secs}s, using the default");
            IpmiConfig::default().timeout
        });
    IpmiConfig {
        tool,
        host,
        user,
        password_file,
        timeout,
    }
}
