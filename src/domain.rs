//! Timing domain arbitration.
//!
//! A timing domain multiplexes one physical clock between independent
//! timing services (PTP, NTP). Services are compared with a BMC-like
//! lexicographic rule; the winner acquires clock control, everything
//! else is told to release. An election hold timer keeps the domain
//! from flapping between services.

use log::{debug, info, warn};

pub const MAX_TIMING_SERVICES: usize = 16;

// service flag bits
pub const SVC_OPERATIONAL: u8 = 0x01;
pub const SVC_AVAILABLE: u8 = 0x02;
pub const SVC_IN_CONTROL: u8 = 0x04;
pub const SVC_IDLE: u8 = 0x08;
pub const SVC_HOLD: u8 = 0x10;
pub const SVC_SINK_ONLY: u8 = 0x20;
pub const SVC_NO_TOD: u8 = 0x40;

/// Service type; lower values win elections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ServiceType {
    Ptp = 0x10,
    Pps = 0x20,
    Gps = 0x30,
    Ntp = 0x40,
    Other = 0xFE,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseReason {
    None,
    Idle,
    Election,
    CtrlNotBest,
    Eligible,
}

impl std::fmt::Display for ReleaseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            ReleaseReason::None => "",
            ReleaseReason::Idle => "idle",
            ReleaseReason::Election => "election",
            ReleaseReason::CtrlNotBest => "in control but not elected",
            ReleaseReason::Eligible => "no longer eligible",
        };
        f.write_str(text)
    }
}

/// What a backend reports on each poll.
#[derive(Debug, Clone, Copy, Default)]
pub struct BackendReport {
    pub operational: bool,
    pub available: bool,
    /// The backend observed that it already controls the clock (used by
    /// the NTP watchdog; normally false).
    pub in_control: bool,
    /// Heartbeat since the last poll.
    pub activity: bool,
}

/// The object behind a timing service: a PTP port or an NTP engine.
pub trait ServiceBackend {
    fn poll(&mut self) -> BackendReport;
    fn acquire(&mut self) -> bool;
    fn release(&mut self, reason: ReleaseReason) -> bool;
    /// Push sync status, UTC offset and leap state toward the clock.
    fn clock_update(&mut self) {}
}

pub struct TimingService {
    pub id: String,
    pub service_type: ServiceType,
    pub priority1: u8,
    pub priority2: u8,
    pub flags: u8,

    /// Seconds between backend polls.
    pub update_interval: u32,
    last_update: u32,
    update_due: bool,

    /// Seconds without activity before the service goes idle.
    pub timeout: u32,
    pub min_idle_time: u32,
    idle_time: u32,

    /// Seconds control is retained after the service stops qualifying.
    pub hold_time: u32,
    hold_time_left: u32,

    activity: bool,
    released: bool,

    backend: Box<dyn ServiceBackend>,
}

impl TimingService {
    pub fn new(
        id: &str,
        service_type: ServiceType,
        priority1: u8,
        priority2: u8,
        backend: Box<dyn ServiceBackend>,
    ) -> Self {
        TimingService {
            id: id.to_string(),
            service_type,
            priority1,
            priority2,
            flags: 0,
            update_interval: 1,
            last_update: 0,
            update_due: false,
            timeout: 120,
            min_idle_time: 0,
            idle_time: 0,
            hold_time: 0,
            hold_time_left: 0,
            activity: false,
            released: false,
            backend,
        }
    }

    pub fn has(&self, flag: u8) -> bool {
        self.flags & flag != 0
    }

    fn set(&mut self, flag: u8) {
        self.flags |= flag;
    }

    fn unset(&mut self, flag: u8) {
        self.flags &= !flag;
    }

    pub fn in_control(&self) -> bool {
        self.has(SVC_IN_CONTROL)
    }

    /// Fold one backend report into the flags, running the hold logic
    /// that keeps control sticky through short dropouts.
    fn apply_report(&mut self, report: BackendReport) {
        if report.operational {
            self.set(SVC_OPERATIONAL);
        } else {
            self.unset(SVC_OPERATIONAL);
        }

        if report.available {
            if !self.has(SVC_AVAILABLE) {
                info!("service {}: now available", self.id);
            }
            self.set(SVC_AVAILABLE);
            if self.has(SVC_HOLD) {
                debug!("service {}: hold cancelled", self.id);
                self.unset(SVC_HOLD);
                self.hold_time_left = 0;
            }
        } else if self.has(SVC_AVAILABLE) {
            if self.has(SVC_HOLD) {
                if self.hold_time_left == 0 {
                    self.unset(SVC_AVAILABLE);
                    self.unset(SVC_HOLD);
                    if self.hold_time > 0 {
                        info!("service {}: hold time expired", self.id);
                    }
                }
            } else if self.hold_time > 0 {
                self.set(SVC_HOLD);
                if self.hold_time_left == 0 {
                    self.hold_time_left = self.hold_time;
                }
                debug!(
                    "service {}: hold started, {} seconds",
                    self.id, self.hold_time_left
                );
            } else {
                self.unset(SVC_AVAILABLE);
            }
        }

        if report.activity {
            self.activity = true;
        }
        if report.in_control {
            self.set(SVC_IN_CONTROL);
        }
    }

    fn acquire(&mut self) {
        if self.backend.acquire() {
            self.set(SVC_IN_CONTROL);
            info!("service {}: acquired clock control", self.id);
        }
    }

    fn release(&mut self, reason: ReleaseReason) {
        self.backend.release(reason);
        self.unset(SVC_IN_CONTROL);
        if !self.released {
            info!(
                "service {}: released clock control, reason: {}",
                self.id, reason
            );
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DomainCounters {
    pub operational: u32,
    pub available: u32,
    pub idle: u32,
    pub in_control: u32,
}

pub struct TimingDomain {
    services: Vec<TimingService>,
    pub current: Option<usize>,
    pub best: Option<usize>,
    pub preferred: Option<usize>,

    /// Seconds between domain updates.
    pub update_interval: u32,
    /// Seconds of election hold after a release.
    pub election_delay: u32,
    election_left: u32,

    pub counters: DomainCounters,
    none_available: bool,
}

/// BMC-like service comparison. Returns true when `a` is at least as
/// good as `b`. With `useable_only`, operational and available services
/// always rank above the rest; without it only the static data set
/// (priority1, type, priority2) is compared.
fn service_outranks(a: &TimingService, b: &TimingService, useable_only: bool) -> bool {
    if useable_only {
        let a_op = a.has(SVC_OPERATIONAL);
        let b_op = b.has(SVC_OPERATIONAL);
        if a_op != b_op {
            return a_op;
        }
        let a_avail = a.has(SVC_AVAILABLE);
        let b_avail = b.has(SVC_AVAILABLE);
        if a_avail != b_avail {
            return a_avail;
        }
    }
    if a.priority1 != b.priority1 {
        return a.priority1 < b.priority1;
    }
    if a.service_type != b.service_type {
        return a.service_type < b.service_type;
    }
    if a.priority2 != b.priority2 {
        return a.priority2 < b.priority2;
    }
    true
}

impl Default for TimingDomain {
    fn default() -> Self {
        Self::new()
    }
}

impl TimingDomain {
    pub fn new() -> Self {
        TimingDomain {
            services: Vec::new(),
            current: None,
            best: None,
            preferred: None,
            update_interval: 1,
            election_delay: 5,
            election_left: 0,
            counters: DomainCounters::default(),
            none_available: false,
        }
    }

    /// Add a service; the domain holds at most
    /// [`MAX_TIMING_SERVICES`].
    pub fn add_service(&mut self, service: TimingService) -> Option<usize> {
        if self.services.len() >= MAX_TIMING_SERVICES {
            warn!("timing domain: service table full, {} dropped", service.id);
            return None;
        }
        self.services.push(service);
        Some(self.services.len() - 1)
    }

    pub fn service(&self, index: usize) -> &TimingService {
        &self.services[index]
    }

    pub fn service_mut(&mut self, index: usize) -> &mut TimingService {
        &mut self.services[index]
    }

    pub fn service_count(&self) -> usize {
        self.services.len()
    }

    pub fn election_hold_active(&self) -> bool {
        self.election_left > 0
    }

    pub fn shutdown(&mut self) {
        for i in (0..self.services.len()).rev() {
            if self.services[i].in_control() {
                self.services[i].release(ReleaseReason::None);
            }
        }
        self.services.clear();
        self.current = None;
        self.best = None;
        self.preferred = None;
    }

    /// One arbitration tick.
    pub fn update(&mut self) {
        let interval = self.update_interval;

        if self.election_left > 0 {
            if self.election_left == self.election_delay {
                info!(
                    "timing domain: election hold timer started, {} seconds",
                    self.election_delay
                );
            }
            self.election_left = self.election_left.saturating_sub(interval);
        }

        if self.services.is_empty() {
            return;
        }

        // first pass: poll backends, track idle time, release where the
        // service no longer qualifies
        for i in 0..self.services.len() {
            let service = &mut self.services[i];

            service.last_update += interval;
            service.hold_time_left = service.hold_time_left.saturating_sub(interval);

            if service.last_update >= service.update_interval {
                service.update_due = true;
                service.last_update = 0;
            } else {
                continue;
            }

            let report = service.backend.poll();
            service.apply_report(report);

            if service.has(SVC_OPERATIONAL) {
                if !service.activity {
                    service.idle_time += interval;
                } else {
                    if service.has(SVC_IDLE) {
                        info!("service {}: no longer idle", service.id);
                    }
                    service.unset(SVC_IDLE);
                    service.idle_time = 0;
                    if service.hold_time_left > 0 && !service.has(SVC_HOLD) {
                        service.hold_time_left = 0;
                    }
                }
                service.activity = false;

                if service.has(SVC_AVAILABLE)
                    && !service.has(SVC_HOLD)
                    && service.idle_time > service.min_idle_time
                    && service.idle_time > service.timeout
                {
                    service.idle_time = 0;
                    if !service.has(SVC_IDLE) {
                        info!("service {}: has gone idle", service.id);
                        if self.current == Some(i) {
                            service.hold_time_left = service.hold_time;
                        }
                    }
                    service.set(SVC_IDLE);
                    if self.current == Some(i) && service.hold_time_left == 0 {
                        service.unset(SVC_AVAILABLE);
                        service.release(ReleaseReason::Idle);
                        service.released = true;
                        self.election_left = self.election_delay;
                        self.current = None;
                    }
                }
            }

            // in control but no longer eligible
            let service = &mut self.services[i];
            if (!service.has(SVC_AVAILABLE) || !service.has(SVC_OPERATIONAL))
                && service.in_control()
                && service.hold_time_left == 0
            {
                service.release(ReleaseReason::Eligible);
                service.released = true;
                if self.current == Some(i) {
                    self.election_left = self.election_delay;
                    self.current = None;
                }
            }
        }

        // second pass: elect best (usability considered) and preferred
        // (static data set only)
        let mut best = 0;
        let mut preferred = 0;
        for i in 0..self.services.len() {
            if service_outranks(&self.services[i], &self.services[best], true) {
                best = i;
            }
            if i != preferred
                && service_outranks(&self.services[i], &self.services[preferred], false)
                && !service_outranks(&self.services[preferred], &self.services[i], false)
            {
                preferred = i;
            }
        }
        self.best = Some(best);
        self.preferred = Some(preferred);

        // best changed: release the incumbent, then hold the election
        if self.current != Some(best) && self.election_left == 0 {
            if let Some(cur) = self.current {
                if self.services[cur].hold_time_left == 0 {
                    self.services[cur].release(ReleaseReason::Election);
                    self.services[cur].released = true;
                    self.election_left = self.election_delay;
                    self.current = None;
                    // the election takes at least one full check interval
                    self.finish_update();
                    return;
                }
            } else {
                self.current = Some(best);
                let qualified = self.services[best].flags & (SVC_OPERATIONAL | SVC_AVAILABLE)
                    == (SVC_OPERATIONAL | SVC_AVAILABLE);
                if qualified {
                    info!(
                        "service {}: elected best timing service",
                        self.services[best].id
                    );
                } else {
                    self.current = None;
                    self.best = None;
                }
            }
        }

        // third pass: release services in control which are not current
        for i in 0..self.services.len() {
            if self.current != Some(i)
                && self.services[i].in_control()
                && self.services[i].update_due
                && self.services[i].hold_time_left == 0
            {
                self.services[i].release(ReleaseReason::CtrlNotBest);
                self.services[i].released = false;
            }
        }

        self.finish_update();
    }

    /// Counter sums, acquisition of the winner, warn-once bookkeeping.
    fn finish_update(&mut self) {
        self.counters = DomainCounters::default();
        for service in &self.services {
            if service.has(SVC_OPERATIONAL) {
                self.counters.operational += 1;
            }
            if service.has(SVC_AVAILABLE) {
                self.counters.available += 1;
            }
            if service.has(SVC_IDLE) {
                self.counters.idle += 1;
            }
            if service.in_control() {
                self.counters.in_control += 1;
            }
        }

        for service in &mut self.services {
            service.update_due = false;
        }

        let best = match self.best {
            Some(best) => best,
            None => {
                self.warn_unavailable("no timing service available");
                return;
            }
        };

        if !self.services[best].has(SVC_OPERATIONAL) {
            self.warn_unavailable("no operational timing service available");
            self.current = None;
            return;
        }
        if !self.services[best].has(SVC_AVAILABLE) {
            self.warn_unavailable("no timing service available for clock control");
            self.current = None;
            return;
        }

        self.none_available = false;

        if self.current == Some(best)
            && !self.services[best].in_control()
            && self.election_left == 0
        {
            self.services[best].released = false;
            self.services[best].acquire();
        }

        if self.current == Some(best) && self.services[best].in_control() {
            self.services[best].backend.clock_update();
        }
    }

    fn warn_unavailable(&mut self, message: &str) {
        if !self.none_available {
            warn!("timing domain: {}", message);
        }
        self.none_available = true;
    }
}
