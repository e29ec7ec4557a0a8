//! vmm-export CLI - Export Synology VMM guests to OVA in bulk.

use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use tracing_subscriber::EnvFilter;
use vmm_export_core::{
    run_export, EventCallback, ExportConfig, ExportEvent, ExportPhase, ExportReport, GuestFilter,
    HttpTransport, PowerOnPolicy,
};

/// Automatically export VMs from Synology Virtual Machine Manager.
///
/// Every option can also be set through a `VME_`-prefixed environment variable,
/// e.g. `VME_PASSWORD`.
#[derive(Parser)]
#[command(name = "vmm-export")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Username to use for logging into the DSM.
    #[arg(long, env = "VME_USERNAME")]
    username: String,

    /// Password to use for logging into the DSM.
    #[arg(long, env = "VME_PASSWORD", hide_env_values = true)]
    password: String,

    /// URL of the DSM, including port, e.g. 192.168.1.100:5000.
    #[arg(long, env = "VME_DSM_URL")]
    dsm_url: String,

    /// The path to export VMs to, e.g. /MyShareName/VMM.
    #[arg(long, env = "VME_PATH")]
    path: String,

    /// How many VMs should be exported in parallel.
    #[arg(
        long,
        env = "VME_WORKERS",
        default_value = "1",
        value_parser = clap::value_parser!(u16).range(1..)
    )]
    workers: u16,

    /// Comma-separated list of VM names to exclude from exporting.
    #[arg(long, env = "VME_EXCLUDE", default_value = "")]
    exclude: String,

    /// Comma-separated list of VM names to include in exporting. Takes precedence
    /// over --exclude.
    #[arg(long, env = "VME_INCLUDE", default_value = "")]
    include: String,

    /// Log verbosity (DEBUG, INFO, WARNING, ERROR, or a tracing filter directive).
    #[arg(long, env = "VME_LOG_LEVEL", default_value = "WARNING")]
    log_level: String,

    /// Seconds between state refreshes while guests are being waited on.
    #[arg(long, env = "VME_POLL_INTERVAL", default_value = "5")]
    poll_interval: u64,

    /// Timeout in seconds of each power-on attempt.
    #[arg(long, env = "VME_POWER_ON_TIMEOUT", default_value = "60")]
    power_on_timeout: u64,

    /// Seconds to wait after DSM refuses a power-on.
    #[arg(long, env = "VME_POWER_ON_RETRY_DELAY", default_value = "60")]
    power_on_retry_delay: u64,

    /// Give up powering a guest back on after this many attempts (default: never).
    #[arg(long, env = "VME_POWER_ON_MAX_ATTEMPTS")]
    power_on_max_attempts: Option<u32>,

    /// Suppress progress output.
    #[arg(short, long)]
    quiet: bool,
}

impl Cli {
    fn export_config(&self) -> ExportConfig {
        ExportConfig::new(&self.dsm_url, &self.username, &self.password, &self.path)
            .with_workers(usize::from(self.workers))
            .with_filter(GuestFilter::from_csv(&self.include, &self.exclude))
            .with_poll_interval(Duration::from_secs(self.poll_interval))
            .with_power_on(PowerOnPolicy {
                timeout: Duration::from_secs(self.power_on_timeout),
                retry_delay: Duration::from_secs(self.power_on_retry_delay),
                max_attempts: self.power_on_max_attempts,
            })
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level)?;

    let config = cli.export_config();
    let transport = HttpTransport::new().context("failed to create HTTP client")?;

    let progress = (!cli.quiet).then(|| {
        let pb = ProgressBar::new_spinner();
        pb.enable_steady_tick(Duration::from_millis(120));
        pb.set_style(
            ProgressStyle::default_spinner()
                .template("{spinner:.green} [{elapsed_precise}] {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        pb
    });

    let callback: Option<EventCallback> = progress.clone().map(|pb| {
        Box::new(move |event: ExportEvent| {
            pb.set_message(format!("{}: {}", event.guest, event.phase));
            if event.phase == ExportPhase::Complete {
                pb.println(format!("Exported {}", event.guest));
            }
        }) as EventCallback
    });

    let report = run_export(&config, transport, callback)
        .with_context(|| format!("export from {} failed", config.dsm_url))?;

    if let Some(pb) = progress {
        pb.finish_and_clear();
    }
    if !cli.quiet {
        print_summary(&report);
    }

    Ok(())
}

/// Install the global subscriber.
///
/// Python-style level names (`WARNING`, `CRITICAL`, ...) are accepted alongside
/// tracing directives so existing configurations keep working.
fn init_logging(level: &str) -> Result<()> {
    let filter = EnvFilter::try_new(log_directive(level))
        .with_context(|| format!("invalid log level '{level}'"))?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
    Ok(())
}

fn log_directive(level: &str) -> String {
    let mapped = match level.to_ascii_uppercase().as_str() {
        "CRITICAL" | "FATAL" | "ERROR" => "error",
        "WARNING" | "WARN" => "warn",
        "INFO" => "info",
        "DEBUG" => "debug",
        "TRACE" | "NOTSET" => "trace",
        _ => return level.to_string(),
    };
    format!("vmm_export_core={mapped},vmm_export={mapped}")
}

fn print_summary(report: &ExportReport) {
    println!();
    println!("Export Summary");
    println!("--------------");
    for outcome in &report.outcomes {
        match &outcome.result {
            Ok(result) => println!(
                "{:<24} ok ({}, task {:?}{})",
                outcome.guest,
                result.initial_status,
                result.task,
                if result.restarted { ", restarted" } else { "" }
            ),
            Err(e) => println!("{:<24} FAILED: {}", outcome.guest, e),
        }
    }
    println!();
    println!("{} exported, {} failed", report.succeeded(), report.failed());
}
