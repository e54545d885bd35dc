//! CLI for powermon: sample BMC platform power and RAPL package power into CSV.

mod commands;

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use powermon_core::sources::ipmi::DEFAULT_IPMI_TIMEOUT;

#[derive(Parser)]
#[command(name = "powermon")]
#[command(about = "powermon: rollover-safe platform and package power sampler")]
#[command(version = powermon_core::VERSION)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Sample both sources at a fixed interval and write one CSV row per tick
    Record {
        /// Sampling interval (e.g. "1", "1.5", "500ms", "2s", "1m")
        #[arg(short, long, default_value = "1", value_parser = commands::parse_seconds)]
        interval: Duration,

        /// Stop after this long (same syntax as --interval); default: until Ctrl+C
        #[arg(short, long, value_parser = commands::parse_seconds)]
        duration: Option<Duration>,

        /// CSV file to write; metadata goes next to it as <name>.meta.json
        #[arg(short, long)]
        output: PathBuf,

        /// Don't print a line per sample
        #[arg(short, long)]
        quiet: bool,

        /// Append to an existing CSV instead of refusing to touch it
        #[arg(long)]
        append: bool,

        /// Truncate an existing CSV
        #[arg(long, conflicts_with = "append")]
        force: bool,

        /// Per-query ipmitool timeout in seconds (capped below the interval)
        #[arg(long, default_value_t = DEFAULT_IPMI_TIMEOUT.as_secs_f64())]
        ipmi_timeout: f64,

        /// ipmitool executable
        #[arg(long, default_value = "ipmitool")]
        ipmitool: PathBuf,

        /// Remote BMC host (uses -I lanplus); default: local interface
        #[arg(long)]
        ipmi_host: Option<String>,

        /// Remote BMC user
        #[arg(long, requires = "ipmi_host")]
        ipmi_user: Option<String>,

        /// File holding the remote BMC password
        #[arg(long, requires = "ipmi_host")]
        ipmi_password_file: Option<PathBuf>,

        /// Don't query the BMC; the ipmi_watts column stays empty
        #[arg(long)]
        no_ipmi: bool,

        /// Powercap zone directory (default: first of intel-rapl:0 locations)
        #[arg(long)]
        rapl_zone: Option<PathBuf>,

        /// Don't read RAPL; the rapl columns stay empty
        #[arg(long, conflicts_with = "rapl_zone")]
        no_rapl: bool,

        /// Metadata tags as key:value pairs
        #[arg(long = "tag")]
        tags: Vec<String>,

        /// Free-form note stored in the metadata sidecar
        #[arg(long)]
        note: Option<String>,
    },

    /// Check which power sources work on this machine
    Probe {
        /// ipmitool executable
        #[arg(long, default_value = "ipmitool")]
        ipmitool: PathBuf,

        /// Per-query ipmitool timeout in seconds
        #[arg(long, default_value_t = DEFAULT_IPMI_TIMEOUT.as_secs_f64())]
        ipmi_timeout: f64,

        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },
}

fn init_logging(quiet: bool) {
    let default = if quiet { "error" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default))
        .format_timestamp_millis()
        .init();
}

fn main() {
    let cli = Cli::parse();
    init_logging(matches!(cli.command, Commands::Record { quiet: true, .. }));

    let result = match cli.command {
        Commands::Record {
            interval,
            duration,
            output,
            quiet,
            append,
            force,
            ipmi_timeout,
            ipmitool,
            ipmi_host,
            ipmi_user,
            ipmi_password_file,
            no_ipmi,
            rapl_zone,
            no_rapl,
            tags,
            note,
        } => commands::record::run(commands::record::RecordCommandConfig {
            interval,
            duration,
            output: &output,
            quiet,
            append,
            force,
            ipmi: commands::ipmi_config(
                ipmitool,
                ipmi_host,
                ipmi_user,
                ipmi_password_file,
                ipmi_timeout,
            ),
            no_ipmi,
            rapl_zone: rapl_zone.as_deref(),
            no_rapl,
            tags: &tags,
            note: note.as_deref(),
        }),
        Commands::Probe {
            ipmitool,
            ipmi_timeout,
            json,
        } => commands::probe::run(
            &commands::ipmi_config(ipmitool, None, None, None, ipmi_timeout),
            json,
        ),
    };

    if let Err(e) = result {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
}
