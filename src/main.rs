use anyhow::Result;
use clap::Parser;
use log::{error, info, warn};
use std::fs::File;
use std::process::Command;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[cfg(unix)]
use anyhow::anyhow;
#[cfg(unix)]
use nix::fcntl::{flock, FlockArg};
#[cfg(unix)]
use std::os::unix::io::AsRawFd;

#[cfg(unix)]
use ptpsyncd::clock::linux::LinuxClock;
use ptpsyncd::config::Config;
use ptpsyncd::engine::{Engine, SignalFlags};
use ptpsyncd::net::{select_interface, UdpTransport};
use ptpsyncd::ptp::datasets::ClockIdentity;

static SIGNALS: SignalFlags = SignalFlags {
    force_step: AtomicBool::new(false),
    reload: AtomicBool::new(false),
    cycle_verbosity: AtomicBool::new(false),
};

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "/etc/ptpsyncd/config.json")]
    config: String,

    /// Network interface to bind to
    #[arg(short, long)]
    interface: Option<String>,

    /// NTP server for the failover service
    #[arg(long)]
    ntp_server: Option<String>,

    /// Never act as a master clock
    #[arg(long, default_value_t = false)]
    slave_only: bool,

    /// PTP domain number
    #[arg(short, long)]
    domain: Option<u8>,

    /// Increase log verbosity (repeatable)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[cfg(unix)]
extern "C" fn handle_signal(sig: libc::c_int) {
    match sig {
        libc::SIGHUP => SIGNALS.reload.store(true, Ordering::SeqCst),
        libc::SIGUSR1 => SIGNALS.force_step.store(true, Ordering::SeqCst),
        libc::SIGUSR2 => SIGNALS.cycle_verbosity.store(true, Ordering::SeqCst),
        _ => {}
    }
}

#[cfg(unix)]
fn install_signal_handlers() {
    unsafe {
        libc::signal(libc::SIGHUP, handle_signal as libc::sighandler_t);
        libc::signal(libc::SIGUSR1, handle_signal as libc::sighandler_t);
        libc::signal(libc::SIGUSR2, handle_signal as libc::sighandler_t);
    }
}

#[cfg(not(unix))]
fn install_signal_handlers() {}

fn stop_conflicting_services() {
    #[cfg(unix)]
    {
        info!("Ensuring system NTP is disabled (timedatectl set-ntp false)...");
        match Command::new("timedatectl")
            .args(["set-ntp", "false"])
            .output()
        {
            Ok(_) => info!("NTP service disabled via timedatectl."),
            Err(e) => warn!("Failed to disable NTP via timedatectl (ignoring): {}", e),
        }
    }
}

fn enable_realtime_priority() {
    #[cfg(unix)]
    unsafe {
        let policy = libc::SCHED_FIFO;
        let param = libc::sched_param { sched_priority: 50 };

        if libc::sched_setscheduler(0, policy, &param) == 0 {
            info!("Realtime priority (SCHED_FIFO, 50) enabled successfully.");
        } else {
            let err = std::io::Error::last_os_error();
            warn!(
                "Failed to set realtime priority: {}. Latency might suffer.",
                err
            );
        }
    }
}

fn acquire_singleton_lock(path: &str) -> Result<File> {
    #[cfg(unix)]
    {
        let file = File::create(path)
            .map_err(|e| anyhow!("Failed to create lock file {}: {}", path, e))?;

        match flock(file.as_raw_fd(), FlockArg::LockExclusiveNonblock) {
            Ok(_) => Ok(file),
            Err(nix::errno::Errno::EAGAIN) => Err(anyhow!(
                "Another instance of ptpsyncd is already running! (Lockfile: {})",
                path
            )),
            Err(e) => Err(e.into()),
        }
    }
    #[cfg(not(unix))]
    {
        Ok(File::create(path)?)
    }
}

fn main() -> Result<()> {
    let args = Args::parse();

    let level = match args.verbose {
        0 => log::LevelFilter::Info,
        1 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    env_logger::builder()
        .format_timestamp_millis()
        .format_target(false)
        .filter_level(level)
        .init();

    info!("ptpsyncd v{}", env!("CARGO_PKG_VERSION"));

    let mut config = Config::load(&args.config);
    if let Some(interface) = args.interface.clone() {
        config.interface = Some(interface);
    }
    if let Some(server) = args.ntp_server.clone() {
        config.ntp_server = server;
    }
    if args.slave_only {
        config.ptp.slave_only = true;
    }
    if let Some(domain) = args.domain {
        config.ptp.domain_number = domain;
    }

    // inconsistent configuration exits before the engine starts
    if let Err(e) = config.ptp.validate() {
        error!("Invalid configuration: {}", e);
        std::process::exit(1);
    }

    let _lock_file = match acquire_singleton_lock(&config.lock_file) {
        Ok(file) => file,
        Err(e) => {
            error!("{}", e);
            std::process::exit(1);
        }
    };

    stop_conflicting_services();
    enable_realtime_priority();
    install_signal_handlers();

    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        info!("Shutdown signal received.");
        r.store(false, Ordering::SeqCst);
    })?;

    // wait for a usable interface, as the daemon may start before the
    // network is up
    let (iface_name, iface_ip) = loop {
        match select_interface(config.interface.as_deref()) {
            Ok(result) => break result,
            Err(e) => {
                if !running.load(Ordering::SeqCst) {
                    return Ok(());
                }
                warn!("Waiting for network interface... ({})", e);
                std::thread::sleep(Duration::from_secs(5));
            }
        }
    };

    let transport = UdpTransport::new(iface_ip)?;
    info!(
        "Joined PTP multicast groups on {} ({})",
        iface_name, iface_ip
    );

    let identity = ClockIdentity::from_addr(&iface_ip.octets(), std::process::id());
    info!("Clock identity: {}", identity);

    #[cfg(unix)]
    let hardware = match LinuxClock::new() {
        Ok(clock) => Box::new(clock) as Box<dyn ptpsyncd::clock::hardware::ClockHardware>,
        Err(e) => {
            error!("Failed to initialize system clock control: {}", e);
            return Err(e);
        }
    };
    #[cfg(not(unix))]
    let hardware = Box::new(ptpsyncd::clock::hardware::VirtualClock::new())
        as Box<dyn ptpsyncd::clock::hardware::ClockHardware>;
    info!("System clock control initialized.");

    let mut engine = Engine::new(config, identity, hardware, Box::new(transport))?;

    #[cfg(unix)]
    {
        let _ = sd_notify::notify(
            false,
            &[
                sd_notify::NotifyState::Ready,
                sd_notify::NotifyState::Status(
                    format!("v{} | PTP engine running", env!("CARGO_PKG_VERSION")).as_str(),
                ),
            ],
        );
    }

    let result = engine.run(running, &SIGNALS);

    #[cfg(unix)]
    {
        let _ = sd_notify::notify(false, &[sd_notify::NotifyState::Stopping]);
    }

    result
}
