//! The engine: one cooperative scheduler driving the PTP port, the
//! clock driver registry and the timing domain.
//!
//! Everything runs on a single thread. Inbound datagrams are processed
//! as they arrive; the registry and the arbitrator tick at one hertz.
//! Signals are latched into atomic flags by the caller and polled at
//! the top of each iteration.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use anyhow::Result;
use log::info;

use crate::clock::hardware::ClockHardware;
use crate::clock::registry::ClockRegistry;
use crate::clock::{ClockEvent, ClockId};
use crate::config::Config;
use crate::domain::{
    BackendReport, ReleaseReason, ServiceBackend, ServiceType, TimingDomain, TimingService,
};
use crate::ntp::{NtpService, NtpServiceBackend};
use crate::ptp::datasets::ClockIdentity;
use crate::ptp::port::{PortState, PtpPort, PtpTransport};
use crate::status::SyncStatus;

/// Registry and arbitrator tick interval, seconds.
const CDR_TICK: f64 = 1.0;
const TDA_TICK: f64 = 1.0;
/// Stats line interval, seconds.
const STATS_TICK: f64 = 10.0;

/// Scheduler sleep between polls.
const LOOP_SLEEP: Duration = Duration::from_millis(1);

/// Snapshot of the port bridged to the arbitrator once per TDA tick.
#[derive(Debug, Default)]
pub struct PtpServiceShared {
    pub operational: bool,
    pub available: bool,
    pub activity: bool,
    pub granted: bool,
}

pub struct PtpServiceBackend {
    shared: Arc<RwLock<PtpServiceShared>>,
}

impl PtpServiceBackend {
    pub fn new(shared: Arc<RwLock<PtpServiceShared>>) -> Self {
        PtpServiceBackend { shared }
    }
}

impl ServiceBackend for PtpServiceBackend {
    fn poll(&mut self) -> BackendReport {
        let mut shared = match self.shared.write() {
            Ok(shared) => shared,
            Err(_) => return BackendReport::default(),
        };
        let activity = shared.activity;
        shared.activity = false;
        BackendReport {
            operational: shared.operational,
            available: shared.available,
            in_control: false,
            activity,
        }
    }

    fn acquire(&mut self) -> bool {
        if let Ok(mut shared) = self.shared.write() {
            shared.granted = true;
            true
        } else {
            false
        }
    }

    fn release(&mut self, _reason: ReleaseReason) -> bool {
        if let Ok(mut shared) = self.shared.write() {
            shared.granted = false;
        }
        true
    }
}

/// Pending signal actions, latched by the signal handlers in main and
/// consumed by the engine at the top of each iteration.
#[derive(Default)]
pub struct SignalFlags {
    /// SIGUSR1: force a manual step of all clocks.
    pub force_step: AtomicBool,
    /// SIGHUP: reload configuration and reopen logs.
    pub reload: AtomicBool,
    /// SIGUSR2: cycle debug verbosity.
    pub cycle_verbosity: AtomicBool,
}

pub struct Engine {
    config: Config,
    pub registry: ClockRegistry,
    pub port: PtpPort,
    pub domain: TimingDomain,
    ntp: Option<NtpService>,
    ptp_shared: Arc<RwLock<PtpServiceShared>>,
    status: Arc<RwLock<SyncStatus>>,
    system_clock: ClockId,

    cdr_acc: f64,
    tda_acc: f64,
    stats_acc: f64,
}

impl Engine {
    /// Build an engine around injected clock hardware and transport.
    /// Multiple engines can coexist; only the caller decides which one
    /// owns the real system clock.
    pub fn new(
        config: Config,
        identity: ClockIdentity,
        hardware: Box<dyn ClockHardware>,
        transport: Box<dyn PtpTransport>,
    ) -> Result<Self> {
        config.ptp.validate().map_err(anyhow::Error::msg)?;

        let mut registry = ClockRegistry::new();
        let system_clock = registry.add_driver(
            crate::clock::registry::SYSTEM_CLOCK_NAME,
            hardware,
            config.clock.clone(),
            true,
        );

        let port = PtpPort::new(config.ptp.clone(), identity, transport, system_clock);

        let mut domain = TimingDomain::new();
        domain.election_delay = config.failover.election_delay;
        domain.update_interval = TDA_TICK as u32;

        let ptp_shared = Arc::new(RwLock::new(PtpServiceShared::default()));
        let mut ptp_service = TimingService::new(
            "PTP0",
            ServiceType::Ptp,
            config.failover.ptp_priority1,
            config.failover.ptp_priority2,
            Box::new(PtpServiceBackend::new(ptp_shared.clone())),
        );
        ptp_service.timeout = config.failover.failover_timeout;
        ptp_service.hold_time = config.failover.hold_time;
        domain.add_service(ptp_service);

        let ntp = if config.failover.enable_engine {
            let mut service =
                NtpService::new(&config.ntp_server, config.failover.clone(), system_clock);
            service.init();

            let mut ntp_service = TimingService::new(
                "NTP0",
                ServiceType::Ntp,
                config.failover.ntp_priority1,
                config.failover.ntp_priority2,
                Box::new(NtpServiceBackend::new(service.shared())),
            );
            ntp_service.update_interval = config.failover.check_interval.max(1);
            ntp_service.timeout = config.failover.failover_timeout;
            domain.add_service(ntp_service);
            Some(service)
        } else {
            None
        };

        Ok(Engine {
            config,
            registry,
            port,
            domain,
            ntp,
            ptp_shared,
            status: Arc::new(RwLock::new(SyncStatus::default())),
            system_clock,
            cdr_acc: 0.0,
            tda_acc: 0.0,
            stats_acc: 0.0,
        })
    }

    pub fn status_shared(&self) -> Arc<RwLock<SyncStatus>> {
        self.status.clone()
    }

    pub fn system_clock(&self) -> ClockId {
        self.system_clock
    }

    pub fn start(&mut self) {
        self.port.initialize(&mut self.registry);
    }

    /// One scheduler iteration covering `dt` seconds of wall time.
    pub fn run_once(&mut self, dt: f64) {
        self.port.process_inbound(&mut self.registry);
        self.port.tick(dt, &mut self.registry);

        self.cdr_acc += dt;
        if self.cdr_acc >= CDR_TICK {
            let interval = self.cdr_acc;
            self.cdr_acc = 0.0;
            self.registry.update(interval);
            self.registry.sync_clocks(interval);
        }

        if let Some(ntp) = self.ntp.as_mut() {
            ntp.tick(dt, &mut self.registry);
        }

        self.tda_acc += dt;
        if self.tda_acc >= TDA_TICK {
            self.tda_acc = 0.0;
            self.arbitrate();
        }

        self.stats_acc += dt;
        if self.stats_acc >= STATS_TICK {
            self.stats_acc = 0.0;
            for line in self.registry.stats_lines() {
                info!("{}", line);
            }
        }

        for event in self.registry.drain_events() {
            if let ClockEvent::LockChanged { clock, locked } = event {
                info!(
                    "clock {}: {}",
                    self.registry.get(clock).name,
                    if locked { "locked" } else { "lock lost" }
                );
            }
        }

        self.update_status();
    }

    /// Bridge the port into the timing domain, run the arbitration
    /// tick, and bridge the grant decision back.
    fn arbitrate(&mut self) {
        if !self.config.failover.enable_failover {
            // PTP always owns the clock when failover is off
            self.port.clock_control.granted = self.port.clock_control.available;
            self.port.clock_control.activity = false;
            return;
        }

        if let Ok(mut shared) = self.ptp_shared.write() {
            shared.operational = !matches!(
                self.port.state,
                PortState::Initializing | PortState::Faulty
            );
            shared.available =
                self.port.state == PortState::Slave && self.port.clock_control.available;
            shared.activity = self.port.clock_control.activity;
        }
        self.port.clock_control.activity = false;

        self.domain.update();

        if let Ok(shared) = self.ptp_shared.read() {
            self.port.clock_control.granted = shared.granted;
        }
    }

    fn update_status(&mut self) {
        if let Ok(mut status) = self.status.write() {
            let driver = self.registry.get(self.system_clock);
            status.port_state = self.port.state.name().to_string();
            status.offset_from_master_ns = self.port.offset_from_master.as_nanos();
            status.mean_path_delay_ns = self.port.mean_path_delay.as_nanos();
            status.grandmaster = if self.port.state == PortState::Slave {
                self.port.parent.grandmaster_identity.to_string()
            } else {
                String::new()
            };
            status.frequency_ppb = driver.last_frequency;
            status.adev = driver.adev;
            status.clock_state = driver.state.name().to_string();
            status.best_clock = self
                .registry
                .best_clock()
                .map(|id| self.registry.get(id).name.clone())
                .unwrap_or_default();
            status.controlling_service = self
                .domain
                .current
                .map(|i| self.domain.service(i).id.clone())
                .unwrap_or_default();
            status.updated_ts = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs();
        }
    }

    /// Handle pending signal actions.
    pub fn poll_signals(&mut self, signals: &SignalFlags) {
        if signals.force_step.swap(false, Ordering::SeqCst) {
            info!("engine: manual clock step requested");
            self.registry.step_clocks(true);
        }
        if signals.reload.swap(false, Ordering::SeqCst) {
            info!("engine: reload requested, reparsing configuration");
            // log reopening is handled by the logger; config reload is a
            // restart-level operation for everything except filters
        }
        if signals.cycle_verbosity.swap(false, Ordering::SeqCst) {
            let next = match log::max_level() {
                log::LevelFilter::Info => log::LevelFilter::Debug,
                log::LevelFilter::Debug => log::LevelFilter::Trace,
                _ => log::LevelFilter::Info,
            };
            log::set_max_level(next);
            info!("engine: log verbosity now {}", next);
        }
    }

    /// Main loop: poll sockets, service timers, sleep until the next
    /// deadline.
    pub fn run(&mut self, running: Arc<AtomicBool>, signals: &SignalFlags) -> Result<()> {
        self.start();
        let mut last = Instant::now();

        while running.load(Ordering::SeqCst) {
            self.poll_signals(signals);

            let now = Instant::now();
            let dt = now.duration_since(last).as_secs_f64();
            last = now;

            self.run_once(dt);

            std::thread::sleep(LOOP_SLEEP);
        }

        info!("engine: shutting down");
        if let Some(ntp) = self.ntp.as_mut() {
            ntp.shutdown(&mut self.registry);
        }
        self.domain.shutdown();
        self.registry.shutdown();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::hardware::VirtualClock;
    use crate::config::Config;
    use crate::time::Timestamp;
    use std::cell::RefCell;
    use std::collections::VecDeque;
    use std::rc::Rc;

    #[derive(Default)]
    struct QueueState {
        inbound: VecDeque<(Vec<u8>, Timestamp)>,
    }

    struct QueueTransport(Rc<RefCell<QueueState>>);

    impl PtpTransport for QueueTransport {
        fn recv(&mut self) -> Result<Option<(Vec<u8>, Timestamp)>> {
            Ok(self.0.borrow_mut().inbound.pop_front())
        }
        fn send_event(&mut self, _buf: &[u8]) -> Result<Timestamp> {
            Ok(Timestamp::ZERO)
        }
        fn send_general(&mut self, _buf: &[u8]) -> Result<()> {
            Ok(())
        }
    }

    fn test_engine(mut config: Config) -> (Engine, Rc<RefCell<QueueState>>) {
        config.clock.outlier_filter = false;
        config.clock.stat_filter = false;
        let state = Rc::new(RefCell::new(QueueState::default()));
        let engine = Engine::new(
            config,
            ClockIdentity([1, 2, 3, 0xFF, 0xFE, 4, 5, 6]),
            Box::new(VirtualClock::new()),
            Box::new(QueueTransport(state.clone())),
        )
        .unwrap();
        (engine, state)
    }

    #[test]
    fn test_engine_starts_listening() {
        let (mut engine, _net) = test_engine(Config::default());
        engine.start();
        assert_eq!(engine.port.state, PortState::Listening);
        assert_eq!(engine.domain.service_count(), 1);
    }

    #[test]
    fn test_failover_disabled_grants_on_availability() {
        let (mut engine, _net) = test_engine(Config::default());
        engine.start();
        engine.port.clock_control.available = true;
        engine.run_once(1.5);
        assert!(engine.port.clock_control.granted);
    }

    #[test]
    fn test_failover_enabled_needs_arbitration() {
        let mut config = Config::default();
        config.failover.enable_engine = true;
        config.failover.enable_failover = true;
        config.failover.election_delay = 0;
        let (mut engine, _net) = test_engine(config);
        engine.start();
        assert_eq!(engine.domain.service_count(), 2);

        // port not slave: no grant even though availability is claimed
        engine.port.clock_control.available = true;
        engine.run_once(1.5);
        assert!(!engine.port.clock_control.granted);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut config = Config::default();
        config.ptp.domain_number = 200;
        let state = Rc::new(RefCell::new(QueueState::default()));
        let result = Engine::new(
            config,
            ClockIdentity::default(),
            Box::new(VirtualClock::new()),
            Box::new(QueueTransport(state)),
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_status_snapshot_updates() {
        let (mut engine, _net) = test_engine(Config::default());
        engine.start();
        engine.run_once(0.5);
        let status = engine.status_shared();
        let snapshot = status.read().unwrap();
        assert_eq!(snapshot.port_state, "LISTENING");
        assert_eq!(snapshot.clock_state, "FREERUN");
    }

    #[test]
    fn test_manual_step_signal() {
        let (mut engine, _net) = test_engine(Config::default());
        engine.start();
        let signals = SignalFlags::default();
        signals.force_step.store(true, Ordering::SeqCst);
        engine.poll_signals(&signals);
        assert!(!signals.force_step.load(Ordering::SeqCst));
    }
}
