//! carbon-platform - build a PC platform device model and replay trap traces
//! against it.
//!
//! Without a trace the platform is built, started and summarized, which is a
//! quick way to check a configuration and list the address map.

use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use carbon_platform::platform::{format_mac, parse_mac, Platform, PlatformConfig};
use carbon_platform::trace::{self, Outcome};

#[derive(Parser, Debug)]
#[command(name = "carbon-platform")]
#[command(about = "PC platform device model and fault recovery for the carbon hypervisor")]
struct Args {
    /// Number of vCPUs (one LAPIC each)
    #[arg(long, default_value = "1")]
    vcpus: usize,

    /// Memory size in megabytes
    #[arg(short, long, default_value = "64")]
    memory: u64,

    /// Path to raw disk image (attached to virtio-blk and AHCI port 0)
    #[arg(short, long)]
    disk: Option<PathBuf>,

    /// MAC address for the e1000 and virtio-net NICs
    #[arg(long, default_value = "52:54:00:12:34:56")]
    mac: String,

    /// Display memory in megabytes
    #[arg(long, default_value = "16")]
    vram: usize,

    /// Number of HPET comparators
    #[arg(long, default_value = "3")]
    hpet_timers: usize,

    /// Initial RTC time as UNIX seconds (defaults to the host clock)
    #[arg(long)]
    rtc_epoch: Option<u64>,

    /// Device faults tolerated before a device is isolated
    #[arg(long, default_value = "8")]
    fault_threshold: u32,

    /// Entries kept in the exception error log
    #[arg(long, default_value = "64")]
    error_log: usize,

    /// Per-vCPU watchdog deadline in cycles (0 disables)
    #[arg(long, default_value = "0")]
    watchdog: u64,

    /// Trap trace to replay
    #[arg(short, long)]
    trace: Option<PathBuf>,

    /// Write the final device state as JSON
    #[arg(long)]
    save_state: Option<PathBuf>,
}

impl Args {
    fn to_config(&self) -> Result<PlatformConfig, Box<dyn std::error::Error>> {
        Ok(PlatformConfig {
            vcpus: self.vcpus,
            memory_mb: self.memory,
            disk: self.disk.clone(),
            mac: parse_mac(&self.mac)?,
            vram_mb: self.vram,
            hpet_timers: self.hpet_timers,
            rtc_epoch: self.rtc_epoch,
            fault_threshold: self.fault_threshold,
            error_log_capacity: self.error_log,
            watchdog_cycles: self.watchdog,
        })
    }
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    if let Err(e) = run(args) {
        eprintln!("Error: {e}");
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}

fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    let config = args.to_config()?;
    info!(
        "{} vCPU(s), {} MiB, MAC {}",
        config.vcpus,
        config.memory_mb,
        format_mac(&config.mac)
    );
    if let Some(ref disk) = config.disk {
        info!("disk: {}", disk.display());
    }

    let mut platform = Platform::new(config)?;
    for range in platform.bus().ranges() {
        info!(
            "{:<6} {:#010x}+{:#x} {}",
            range.space.to_string(),
            range.base,
            range.len,
            range.device
        );
    }
    platform.start();

    if let Some(ref path) = args.trace {
        let text = fs::read_to_string(path)?;
        let events = trace::parse(&text)?;
        info!("replaying {} events from {}", events.len(), path.display());
        for (step, event) in events.iter().enumerate() {
            let outcome = event.apply(&mut platform);
            if outcome != Outcome::Nothing {
                println!("{:>5}  {}", step + 1, outcome);
            }
            for power in platform.take_power_events() {
                println!("{:>5}  power {:?}", step + 1, power);
            }
            let expired = platform.poll_watchdog();
            if !expired.is_empty() {
                println!("{:>5}  watchdog expired on vCPU(s) {:?}", step + 1, expired);
            }
        }
    }

    for vcpu in 0..platform.config().vcpus {
        if let Some(vector) = platform.pending_vector(vcpu) {
            println!("vCPU {} pending vector {:#04x}", vcpu, vector);
        }
    }
    println!("state: {}", platform.state());
    for ctx in platform.error_log() {
        println!("error: {}", ctx);
    }
    for device in platform.isolation().isolated_devices() {
        println!("isolated: {}", device);
    }

    if let Some(ref path) = args.save_state {
        let snapshot = platform.snapshot()?;
        fs::write(path, serde_json::to_vec_pretty(&snapshot)?)?;
        info!("saved {} device states to {}", snapshot.devices.len(), path.display());
    }

    Ok(())
}
