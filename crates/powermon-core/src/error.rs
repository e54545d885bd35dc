//! Run-level errors.
//!
//! Per-tick source failures never show up here; they are recorded as empty
//! fields. Only configuration and sink problems end a run.

use std::path::PathBuf;

#[derive(Debug)]
pub enum RunError {
    /// Rejected before the sink is touched.
    InvalidConfig(String),
    /// The output file could not be opened or its header written.
    SinkOpen {
        path: PathBuf,
        source: std::io::Error,
    },
    /// A row could not be written mid-run. Rows before it are intact.
    SinkWrite {
        samples_written: u64,
        source: std::io::Error,
    },
    /// Flushing the sink or writing the metadata sidecar failed at stop.
    Finalize(std::io::Error),
}

impl std::fmt::Display for RunError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidConfig(msg) => write!(f, "invalid configuration: {msg}"),
            Self::SinkOpen { path, source } => {
                write!(f, "cannot open output {}: {source}", path.display())
            }
            Self::SinkWrite {
                samples_written,
                source,
            } => write!(
                f,
                "write to output failed after {samples_written} samples: {source}"
            ),
            Self::Finalize(e) => write!(f, "finalizing output failed: {e}"),
        }
    }
}

impl std::error::Error for RunError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::InvalidConfig(_) => None,
            Self::SinkOpen { source, .. } | Self::SinkWrite { source, .. } => Some(source),
            Self::Finalize(e) => Some(e),
        }
    }
}
