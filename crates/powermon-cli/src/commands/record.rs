//! `powermon record`: sample platform and package power into a CSV file.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::Context;
use powermon_core::{
    EnergyCounterSource, IpmiConfig, IpmiPowerSource, NullEnergySource, NullPlatformSource,
    PlatformPowerSource, RaplEnergySource, Run, RunConfig, SinkMode, StopReason, is_privileged,
};

pub struct RecordCommandConfig<'a> {
    pub interval: Duration,
    pub duration: Option<Duration>,
    pub output: &'a Path,
    pub quiet: bool,
    pub append: bool,
    pub force: bool,
    pub ipmi: IpmiConfig,
    pub no_ipmi: bool,
    pub rapl_zone: Option<&'a Path>,
    pub no_rapl: bool,
    pub tags: &'a [String],
    pub note: Option<&'a str>,
}

fn sink_mode(append: bool, force: bool) -> SinkMode {
    if append {
        SinkMode::Append
    } else if force {
        SinkMode::Overwrite
    } else {
        SinkMode::CreateNew
    }
}

/// Run the record command.
pub fn run(cfg: RecordCommandConfig<'_>) -> anyhow::Result<()> {
    let config = RunConfig {
        interval: cfg.interval,
        duration: cfg.duration,
        output: cfg.output.to_path_buf(),
        sink_mode: sink_mode(cfg.append, cfg.force),
        quiet: cfg.quiet,
        tags: super::parse_tags(cfg.tags),
        note: cfg.note.map(str::to_string),
    };
    config.validate()?;

    if !is_privileged() && !(cfg.no_ipmi && cfg.no_rapl) {
        log::warn!("not running as root: ipmitool and energy_uj usually need it");
    }

    let platform: Box<dyn PlatformPowerSource> = if cfg.no_ipmi {
        Box::new(NullPlatformSource::new())
    } else {
        let mut bmc = IpmiPowerSource::new(&cfg.ipmi);
        bmc.cap_timeout(config.platform_timeout_limit());
        if bmc.timeout() < cfg.ipmi.timeout {
            log::info!(
                "ipmitool timeout capped to {:.3}s to fit the interval",
                bmc.timeout().as_secs_f64()
            );
        }
        Box::new(bmc)
    };
    let energy: Box<dyn EnergyCounterSource> = if cfg.no_rapl {
        Box::new(NullEnergySource::new())
    } else {
        Box::new(match cfg.rapl_zone {
            Some(zone) => RaplEnergySource::new(zone),
            None => RaplEnergySource::detect(),
        })
    };

    // Set up Ctrl+C handler
    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    })
    .context("setting Ctrl+C handler")?;

    println!("Recording power");
    println!("  Platform:  {}", platform.info().description);
    println!("  Package:   {}", energy.info().description);
    println!("  Interval:  {:.3}s", config.interval.as_secs_f64());
    match config.duration {
        Some(d) => println!("  Duration:  {:.3}s", d.as_secs_f64()),
        None => println!("  Duration:  until Ctrl+C"),
    }
    println!("  Mode:      {}", config.sink_mode);
    println!("  Output:    {}", config.output.display());
    println!();

    let mut run = Run::new(config, platform, energy);
    let summary = run
        .run(&running)
        .with_context(|| format!("recording to {}", cfg.output.display()))?;

    println!();
    match summary.stop_reason {
        StopReason::Interrupted => println!("Stopped by Ctrl+C."),
        StopReason::DurationElapsed => println!("Duration reached."),
        StopReason::SinkError => {}
    }
    println!(
        "{} samples in {:.1}s{}",
        summary.samples,
        summary.elapsed.as_secs_f64(),
        if summary.appended { " (appended)" } else { "" }
    );
    if summary.platform_failures > 0 || summary.energy_failures > 0 {
        println!(
            "  Missing readings: {} platform, {} package",
            summary.platform_failures, summary.energy_failures
        );
    }
    if summary.wraparounds > 0 {
        println!("  Counter wraparounds corrected: {}", summary.wraparounds);
    }
    if let Some(caveat) = &summary.caveat {
        println!("  Note: {caveat}");
    }
    println!("Saved to {}", summary.output.display());
    println!("  metadata: {}", summary.meta_path.display());
    Ok(())
}
