//! The PTP port state machine.
//!
//! One port per engine. Inbound datagrams are handled reactively with
//! their receive timestamps; outbound traffic is produced by integer
//! countdown timers serviced from the cooperative scheduler tick.

use anyhow::Result;
use log::{debug, error, info, warn};

use crate::clock::registry::ClockRegistry;
use crate::clock::{ClockId, RefClass};
use crate::config::PtpConfig;
use crate::time::Timestamp;

use super::bmc::{self, ForeignMasterTable, Recommendation};
use super::datasets::{
    ClockIdentity, CurrentDS, DefaultDS, DelayMechanism, ParentDS, PortDS, PortIdentity,
    TimePropertiesDS, TimeSource, SLAVE_ONLY_CLOCK_CLASS,
};
use super::messages::{
    Announce, DelayRespBody, FollowUpBody, Header, MessageError, MessageType, PdelayReqBody,
    PdelayRespBody, PdelayRespFollowUpBody, SyncBody, FLAG_FREQUENCY_TRACEABLE, FLAG_LEAP59,
    FLAG_LEAP61, FLAG_PTP_TIMESCALE, FLAG_TIME_TRACEABLE, FLAG_UTC_OFFSET_VALID,
};

/// External reference name under which the port disciplines its clock.
pub const PTP_REF_NAME: &str = "PTP0";

/// Seconds around UTC midnight during which clock updates stay
/// suspended while a leap second is applied.
const LEAP_SECOND_PAUSE_PERIOD: f64 = 5.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortState {
    Initializing,
    Faulty,
    Disabled,
    Listening,
    PreMaster,
    Master,
    Passive,
    Uncalibrated,
    Slave,
}

impl PortState {
    pub fn name(&self) -> &'static str {
        match self {
            PortState::Initializing => "INITIALIZING",
            PortState::Faulty => "FAULTY",
            PortState::Disabled => "DISABLED",
            PortState::Listening => "LISTENING",
            PortState::PreMaster => "PRE_MASTER",
            PortState::Master => "MASTER",
            PortState::Passive => "PASSIVE",
            PortState::Uncalibrated => "UNCALIBRATED",
            PortState::Slave => "SLAVE",
        }
    }
}

impl std::fmt::Display for PortState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Datagram transport below the port: receive with timestamps, send on
/// the event or general channel.
#[cfg_attr(test, mockall::automock)]
pub trait PtpTransport {
    /// Next inbound datagram and its receive timestamp, None when idle.
    fn recv(&mut self) -> Result<Option<(Vec<u8>, Timestamp)>>;

    /// Send an event message and return its transmit timestamp.
    fn send_event(&mut self, buf: &[u8]) -> Result<Timestamp>;

    fn send_general(&mut self, buf: &[u8]) -> Result<()>;

    /// Drop any buffered inbound traffic.
    fn reset(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Handshake between the port and the timing domain arbitrator.
#[derive(Debug, Clone, Copy, Default)]
pub struct ClockControl {
    /// The port is ready to discipline the clock (SLAVE and calibrated).
    pub available: bool,
    /// The arbitrator has granted clock control.
    pub granted: bool,
    /// Heartbeat: the port made progress since the last arbitrator tick.
    pub activity: bool,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PortCounters {
    pub rx_messages: u64,
    pub tx_messages: u64,
    pub discarded: u64,
    pub sequence_errors: u64,
    pub timestamp_errors: u64,
    pub state_transitions: u64,
    pub send_failures: u64,
}

/// A two-step Sync waiting for its FollowUp.
#[derive(Debug, Clone, Copy)]
struct PendingSync {
    source: PortIdentity,
    sequence_id: u16,
    receive_time: Timestamp,
    correction: Timestamp,
    /// Engine time of arrival, for expiry.
    arrived: f64,
}

/// An in-flight Delay_Req.
#[derive(Debug, Clone, Copy)]
struct PendingDelayReq {
    sequence_id: u16,
    send_time: Timestamp,
}

/// Peer delay measurement in progress.
#[derive(Debug, Clone, Copy, Default)]
struct PdelayExchange {
    sequence_id: u16,
    /// t1: our request transmit time.
    t1: Timestamp,
    /// t2: peer's request receipt time.
    t2: Timestamp,
    /// t4: response receive time.
    t4: Timestamp,
    have_resp: bool,
    correction: Timestamp,
}

pub struct PtpPort {
    pub config: PtpConfig,
    pub defaults: DefaultDS,
    pub current: CurrentDS,
    pub parent: ParentDS,
    pub time_properties: TimePropertiesDS,
    pub port_ds: PortDS,

    pub state: PortState,
    pub clock_control: ClockControl,
    pub counters: PortCounters,

    transport: Box<dyn PtpTransport>,
    /// Handle of the clock this port disciplines.
    pub clock: ClockId,

    foreign: ForeignMasterTable,
    record_update: bool,

    /// Engine time in seconds, advanced by `tick`.
    now: f64,

    // countdown timers, seconds; negative means disarmed
    announce_receipt_timer: f64,
    announce_emit_timer: f64,
    sync_emit_timer: f64,
    sync_receipt_timer: f64,
    delay_req_timer: f64,
    pdelay_req_timer: f64,
    qualification_timer: f64,
    fault_reset_timer: f64,

    announce_seq: u16,
    sync_seq: u16,
    delay_req_seq: u16,
    pdelay_req_seq: u16,

    pending_sync: Option<PendingSync>,
    pending_delay_req: Option<PendingDelayReq>,
    pdelay: PdelayExchange,

    /// t1/t2 of the last completed sync exchange, for delay math.
    last_sync_origin: Option<Timestamp>,
    last_sync_receive: Option<Timestamp>,
    sync_correction: Timestamp,

    pub offset_from_master: Timestamp,
    pub mean_path_delay: Timestamp,
    pub peer_mean_path_delay: Timestamp,
    mpd_valid: bool,

    consecutive_timestamp_errors: u32,

    pub leap_second_pending: bool,
    pub leap_second_in_progress: bool,

    /// Delay requests are spaced randomly within [interval, 2*interval);
    /// this is the per-port jitter source (a simple LCG, seeded from the
    /// clock identity).
    rand_state: u32,
}

impl PtpPort {
    pub fn new(
        config: PtpConfig,
        clock_identity: ClockIdentity,
        transport: Box<dyn PtpTransport>,
        clock: ClockId,
    ) -> Self {
        let defaults = DefaultDS::new(clock_identity, &config);
        let parent = ParentDS::from_local(&defaults);
        let port_ds = PortDS::new(clock_identity, &config);
        let foreign = ForeignMasterTable::new(config.max_foreign_records);
        let seed = u32::from_be_bytes([
            clock_identity.0[4],
            clock_identity.0[5],
            clock_identity.0[6],
            clock_identity.0[7],
        ]) | 1;

        PtpPort {
            config,
            defaults,
            current: CurrentDS::default(),
            parent,
            time_properties: TimePropertiesDS::default(),
            port_ds,
            state: PortState::Initializing,
            clock_control: ClockControl::default(),
            counters: PortCounters::default(),
            transport,
            clock,
            foreign,
            record_update: false,
            now: 0.0,
            announce_receipt_timer: -1.0,
            announce_emit_timer: -1.0,
            sync_emit_timer: -1.0,
            sync_receipt_timer: -1.0,
            delay_req_timer: -1.0,
            pdelay_req_timer: -1.0,
            qualification_timer: -1.0,
            fault_reset_timer: -1.0,
            announce_seq: 0,
            sync_seq: 0,
            delay_req_seq: 0,
            pdelay_req_seq: 0,
            pending_sync: None,
            pending_delay_req: None,
            pdelay: PdelayExchange::default(),
            last_sync_origin: None,
            last_sync_receive: None,
            sync_correction: Timestamp::ZERO,
            offset_from_master: Timestamp::ZERO,
            mean_path_delay: Timestamp::ZERO,
            peer_mean_path_delay: Timestamp::ZERO,
            mpd_valid: false,
            consecutive_timestamp_errors: 0,
            leap_second_pending: false,
            leap_second_in_progress: false,
            rand_state: seed,
        }
    }

    fn rand(&mut self) -> f64 {
        // Lehmer generator, enough for timer jitter
        self.rand_state = (self.rand_state.wrapping_mul(48271)) % 0x7FFF_FFFF;
        self.rand_state as f64 / 0x7FFF_FFFF as f64
    }

    pub fn port_identity(&self) -> PortIdentity {
        self.port_ds.port_identity
    }

    pub fn foreign_record_count(&self) -> usize {
        self.foreign.len()
    }

    // ------------------------------------------------------------------
    // state transitions
    // ------------------------------------------------------------------

    pub fn to_state(&mut self, state: PortState, registry: &mut ClockRegistry) {
        if self.state == state {
            return;
        }

        // leaving-state work
        match self.state {
            PortState::Slave | PortState::Uncalibrated => {
                if state != PortState::Slave && state != PortState::Uncalibrated {
                    self.clock_control.available = false;
                    self.clear_slave_state();
                }
            }
            _ => {}
        }

        info!("port: state {} -> {}", self.state.name(), state.name());
        self.counters.state_transitions += 1;

        match state {
            PortState::Initializing => {
                self.disarm_all_timers();
            }
            PortState::Faulty => {
                self.disarm_all_timers();
                self.fault_reset_timer = self.config.fault_reset_delay as f64;
                self.clock_control.available = false;
            }
            PortState::Disabled => {
                self.disarm_all_timers();
            }
            PortState::Listening => {
                self.foreign.clear();
                self.record_update = false;
                self.announce_receipt_timer = self.port_ds.announce_timeout_secs();
                self.sync_receipt_timer = -1.0;
                self.arm_pdelay_timer();
            }
            PortState::PreMaster => {
                // brief qualification pause before asserting mastership
                self.qualification_timer = self.port_ds.announce_interval_secs();
            }
            PortState::Master => {
                self.announce_receipt_timer = -1.0;
                self.sync_receipt_timer = -1.0;
                // first announce and sync go out on the next tick
                self.announce_emit_timer = 0.0;
                self.sync_emit_timer = 0.0;
                self.arm_pdelay_timer();
            }
            PortState::Passive => {
                self.announce_receipt_timer = self.port_ds.announce_timeout_secs();
            }
            PortState::Uncalibrated | PortState::Slave => {
                self.announce_receipt_timer = self.port_ds.announce_timeout_secs();
                self.sync_receipt_timer = self.port_ds.announce_timeout_secs();
                self.arm_delay_req_timer();
                self.arm_pdelay_timer();
                registry.set_external_reference(self.clock, PTP_REF_NAME, RefClass::Ptp);
            }
        }

        self.state = state;
        self.clock_control.activity = true;
    }

    fn disarm_all_timers(&mut self) {
        self.announce_receipt_timer = -1.0;
        self.announce_emit_timer = -1.0;
        self.sync_emit_timer = -1.0;
        self.sync_receipt_timer = -1.0;
        self.delay_req_timer = -1.0;
        self.pdelay_req_timer = -1.0;
        self.qualification_timer = -1.0;
    }

    fn clear_slave_state(&mut self) {
        self.pending_sync = None;
        self.pending_delay_req = None;
        self.last_sync_origin = None;
        self.last_sync_receive = None;
        self.mpd_valid = false;
        self.mean_path_delay.clear();
        self.offset_from_master.clear();
        self.consecutive_timestamp_errors = 0;
    }

    fn arm_delay_req_timer(&mut self) {
        if self.port_ds.delay_mechanism == DelayMechanism::E2E {
            let base = self.port_ds.delay_req_interval_secs();
            self.delay_req_timer = base * (1.0 + self.rand());
        }
    }

    fn arm_pdelay_timer(&mut self) {
        if self.port_ds.delay_mechanism == DelayMechanism::P2P {
            self.pdelay_req_timer =
                2f64.powi(self.port_ds.log_min_pdelay_req_interval as i32);
        }
    }

    /// Local clock becomes (or stays) grandmaster: 1588 9.3.5 table 13.
    fn m1(&mut self) {
        self.current.steps_removed = 0;
        self.current.offset_from_master.clear();
        self.current.mean_path_delay.clear();
        self.parent = ParentDS::from_local(&self.defaults);
        self.time_properties.time_source = TimeSource::InternalOscillator;
        self.time_properties.current_utc_offset_valid = false;
        self.time_properties.leap59 = false;
        self.time_properties.leap61 = false;
    }

    /// Local clock is synchronized to the elected master: table 16.
    fn s1(&mut self, header: &Header, announce: &Announce, registry: &mut ClockRegistry) {
        let previous_leap59 = self.time_properties.leap59;
        let previous_leap61 = self.time_properties.leap61;
        let previous_utc_offset = self.time_properties.current_utc_offset;
        let was_slave = self.state == PortState::Slave;

        self.current.steps_removed = announce.steps_removed + 1;

        self.parent.parent_port_identity = header.source_port_identity;
        self.parent.grandmaster_identity = announce.grandmaster_identity;
        self.parent.grandmaster_clock_quality = announce.grandmaster_clock_quality;
        self.parent.grandmaster_priority1 = announce.grandmaster_priority1;
        self.parent.grandmaster_priority2 = announce.grandmaster_priority2;

        self.time_properties.current_utc_offset = announce.current_utc_offset;
        self.time_properties.current_utc_offset_valid = header.flag(FLAG_UTC_OFFSET_VALID);
        self.time_properties.time_traceable = header.flag(FLAG_TIME_TRACEABLE);
        self.time_properties.frequency_traceable = header.flag(FLAG_FREQUENCY_TRACEABLE);
        self.time_properties.ptp_timescale = header.flag(FLAG_PTP_TIMESCALE);
        self.time_properties.time_source = announce.time_source;

        // leap state only tracks the master while we are a slave
        if was_slave {
            self.time_properties.leap59 = header.flag(FLAG_LEAP59);
            self.time_properties.leap61 = header.flag(FLAG_LEAP61);

            if self.time_properties.leap59 && self.time_properties.leap61 {
                error!("port: both leap59 and leap61 flags set by master");
                self.to_state(PortState::Faulty, registry);
                return;
            }

            // leap flags withdrawn mid-event
            if self.leap_second_pending
                && !self.leap_second_in_progress
                && (previous_leap59 != self.time_properties.leap59
                    || previous_leap61 != self.time_properties.leap61)
            {
                warn!("port: leap second event aborted by grandmaster");
                self.leap_second_pending = false;
                self.leap_second_in_progress = false;
                let _ = registry
                    .get_mut(self.clock)
                    .set_leap(crate::clock::hardware::LeapAction::None);
            }

            // leap flag newly asserted
            if (self.time_properties.leap59 || self.time_properties.leap61)
                && !self.leap_second_pending
                && !self.leap_second_in_progress
            {
                let action = if self.time_properties.leap61 {
                    crate::clock::hardware::LeapAction::Insert
                } else {
                    crate::clock::hardware::LeapAction::Delete
                };
                warn!(
                    "port: leap second pending, arming clock to {} one second at midnight",
                    if self.time_properties.leap61 {
                        "insert"
                    } else {
                        "delete"
                    }
                );
                if registry.get_mut(self.clock).set_leap(action).is_err() {
                    warn!("port: clock cannot arm leap second, expect a step at midnight");
                }
                self.leap_second_pending = true;
            }

            if previous_utc_offset != self.time_properties.current_utc_offset {
                if self.leap_second_pending || self.leap_second_in_progress {
                    warn!(
                        "port: UTC offset changed from {} to {}",
                        previous_utc_offset, self.time_properties.current_utc_offset
                    );
                } else {
                    warn!(
                        "port: UTC offset changed from {} to {} with no leap second pending",
                        previous_utc_offset, self.time_properties.current_utc_offset
                    );
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // periodic tick
    // ------------------------------------------------------------------

    /// Advance all countdown timers by `dt` seconds and act on the ones
    /// that expired.
    pub fn tick(&mut self, dt: f64, registry: &mut ClockRegistry) {
        self.now += dt;

        let mut expire = |timer: &mut f64| -> bool {
            if *timer >= 0.0 {
                *timer -= dt;
                if *timer <= 0.0 {
                    *timer = -1.0;
                    return true;
                }
            }
            false
        };

        let announce_receipt_expired = expire(&mut self.announce_receipt_timer);
        let announce_emit_expired = expire(&mut self.announce_emit_timer);
        let sync_emit_expired = expire(&mut self.sync_emit_timer);
        let sync_receipt_expired = expire(&mut self.sync_receipt_timer);
        let delay_req_expired = expire(&mut self.delay_req_timer);
        let pdelay_req_expired = expire(&mut self.pdelay_req_timer);
        let qualification_expired = expire(&mut self.qualification_timer);
        let fault_reset_expired = expire(&mut self.fault_reset_timer);

        match self.state {
            PortState::Faulty => {
                if fault_reset_expired {
                    info!("port: fault recovery delay elapsed, reinitializing");
                    self.to_state(PortState::Initializing, registry);
                    self.initialize(registry);
                }
                return;
            }
            PortState::Disabled => return,
            _ => {}
        }

        // stale two-step syncs: discard when no FollowUp arrived within
        // one announce interval
        if let Some(pending) = self.pending_sync {
            if self.now - pending.arrived > self.port_ds.announce_interval_secs() {
                debug!("port: discarding stale two-step sync {}", pending.sequence_id);
                self.pending_sync = None;
                self.counters.discarded += 1;
            }
        }

        self.foreign
            .purge_stale(self.now, self.port_ds.announce_timeout_secs());

        if announce_receipt_expired {
            self.on_announce_receipt_timeout(registry);
        }

        if sync_receipt_expired && self.state == PortState::Slave {
            warn!("port: no sync from master within receipt window");
            self.clock_control.available = false;
            self.sync_receipt_timer = self.port_ds.announce_timeout_secs();
        }

        if qualification_expired && self.state == PortState::PreMaster {
            self.m1();
            self.to_state(PortState::Master, registry);
        }

        if self.state == PortState::Master {
            if announce_emit_expired {
                self.issue_announce();
                self.announce_emit_timer = self.port_ds.announce_interval_secs();
            }
            if sync_emit_expired {
                self.issue_sync(registry);
                self.sync_emit_timer = self.port_ds.sync_interval_secs();
            }
        }

        if self.state == PortState::Slave {
            if delay_req_expired && self.port_ds.delay_mechanism == DelayMechanism::E2E {
                self.issue_delay_req(registry);
                self.arm_delay_req_timer();
            }
        }

        if pdelay_req_expired && self.port_ds.delay_mechanism == DelayMechanism::P2P {
            self.issue_pdelay_req(registry);
            self.arm_pdelay_timer();
        }

        self.leap_tick(registry);

        // run BMC when announce state changed
        if self.record_update {
            self.record_update = false;
            self.run_bmc(registry);
        }
    }

    /// Track a pending leap second across UTC midnight. The kernel (or
    /// clock driver) applies the actual insertion; this only suspends
    /// updates around the event and clears the flags afterwards.
    fn leap_tick(&mut self, registry: &mut ClockRegistry) {
        if !self.leap_second_pending && !self.leap_second_in_progress {
            return;
        }

        let now = match registry.get(self.clock).get_time() {
            Ok(now) => now,
            Err(_) => return,
        };
        let utc = match chrono::DateTime::from_timestamp(now.seconds, now.nanoseconds.max(0) as u32)
        {
            Some(utc) => utc,
            None => return,
        };
        let since_midnight = chrono::Timelike::num_seconds_from_midnight(&utc.time()) as f64
            + now.nanoseconds as f64 / 1e9;
        let to_midnight = 86_400.0 - since_midnight;
        let pause = LEAP_SECOND_PAUSE_PERIOD.max(2.0 * self.port_ds.announce_interval_secs());

        if self.leap_second_pending && !self.leap_second_in_progress && to_midnight <= pause {
            warn!("port: leap second event imminent, suspending clock updates");
            self.leap_second_in_progress = true;
        }

        // the event window has passed: the kernel has applied the leap
        if self.leap_second_in_progress && since_midnight > pause && since_midnight < 43_200.0 {
            info!("port: leap second event complete, resuming clock updates");
            self.leap_second_pending = false;
            self.leap_second_in_progress = false;
            self.time_properties.leap59 = false;
            self.time_properties.leap61 = false;
            let _ = registry
                .get_mut(self.clock)
                .set_leap(crate::clock::hardware::LeapAction::None);
        }
    }

    pub fn initialize(&mut self, registry: &mut ClockRegistry) {
        self.current = CurrentDS::default();
        self.parent = ParentDS::from_local(&self.defaults);
        self.foreign.clear();
        self.clear_slave_state();
        self.counters = PortCounters {
            state_transitions: self.counters.state_transitions,
            ..PortCounters::default()
        };
        if self.transport.reset().is_err() {
            self.to_state(PortState::Faulty, registry);
            return;
        }
        self.to_state(PortState::Listening, registry);
    }

    fn on_announce_receipt_timeout(&mut self, registry: &mut ClockRegistry) {
        debug!("port: announce receipt timeout in {}", self.state);
        self.foreign.clear();

        if !self.defaults.slave_only
            && self.defaults.clock_quality.clock_class != SLAVE_ONLY_CLOCK_CLASS
        {
            self.m1();
            if self.state == PortState::Listening {
                // guard against flapping with a short pre-master pause
                self.to_state(PortState::PreMaster, registry);
            } else {
                self.to_state(PortState::Master, registry);
            }
        } else if self.state != PortState::Listening {
            self.to_state(PortState::Listening, registry);
        } else {
            // restart listening
            self.announce_receipt_timer = self.port_ds.announce_timeout_secs();
        }
    }

    fn run_bmc(&mut self, registry: &mut ClockRegistry) {
        let best = self.foreign.best();
        let recommendation = bmc::state_decision(
            &self.defaults,
            best.and_then(|i| self.foreign.get(i)),
            self.state == PortState::Listening,
        );

        match recommendation {
            Recommendation::Listening => {}
            Recommendation::Master => {
                if self.state != PortState::Master {
                    self.m1();
                    if self.state == PortState::Listening {
                        self.to_state(PortState::PreMaster, registry);
                    } else {
                        self.to_state(PortState::Master, registry);
                    }
                }
            }
            Recommendation::Passive => {
                if let Some(rec) = best.and_then(|i| self.foreign.get(i)) {
                    let (header, announce) = (rec.header, rec.announce);
                    self.s1(&header, &announce, registry);
                }
                self.to_state(PortState::Passive, registry);
            }
            Recommendation::Slave => {
                if let Some(rec) = best.and_then(|i| self.foreign.get(i)) {
                    let (header, announce) = (rec.header, rec.announce);
                    let new_parent =
                        self.parent.parent_port_identity != header.source_port_identity;
                    self.s1(&header, &announce, registry);
                    if self.state == PortState::Faulty {
                        return;
                    }
                    match self.state {
                        PortState::Slave if !new_parent => {}
                        PortState::Uncalibrated => {}
                        _ => {
                            // new master selected: recalibrate first
                            self.to_state(PortState::Uncalibrated, registry);
                        }
                    }
                }
            }
            Recommendation::Faulty => {
                self.to_state(PortState::Faulty, registry);
            }
        }
    }

    // ------------------------------------------------------------------
    // inbound
    // ------------------------------------------------------------------

    /// Pull and process every datagram the transport has buffered.
    /// Returns the number of messages handled.
    pub fn process_inbound(&mut self, registry: &mut ClockRegistry) -> usize {
        let mut handled = 0;
        loop {
            match self.transport.recv() {
                Ok(Some((buf, timestamp))) => {
                    self.handle_message(&buf, timestamp, registry);
                    handled += 1;
                }
                Ok(None) => break,
                Err(e) => {
                    error!("port: receive failed: {}", e);
                    self.to_state(PortState::Faulty, registry);
                    break;
                }
            }
        }
        handled
    }

    pub fn handle_message(
        &mut self,
        buf: &[u8],
        timestamp: Timestamp,
        registry: &mut ClockRegistry,
    ) {
        if matches!(
            self.state,
            PortState::Disabled | PortState::Initializing | PortState::Faulty
        ) {
            return;
        }

        let header = match Header::unpack(buf) {
            Ok(header) => header,
            Err(e) => {
                debug!("port: dropping message: {}", e);
                self.counters.discarded += 1;
                return;
            }
        };

        if header.domain_number != self.defaults.domain_number {
            self.counters.discarded += 1;
            return;
        }

        // ignore our own multicast loopback
        if header.source_port_identity.clock_identity == self.defaults.clock_identity {
            return;
        }

        self.counters.rx_messages += 1;

        // event messages need a usable receive timestamp
        if header.message_type.is_event() && (timestamp.is_zero() || timestamp.is_negative()) {
            self.counters.timestamp_errors += 1;
            self.consecutive_timestamp_errors += 1;
            if self.consecutive_timestamp_errors >= self.config.max_timestamp_errors {
                error!(
                    "port: {} consecutive timestamp faults",
                    self.consecutive_timestamp_errors
                );
                self.to_state(PortState::Faulty, registry);
            }
            return;
        }
        if header.message_type.is_event() {
            self.consecutive_timestamp_errors = 0;
        }

        let result = match header.message_type {
            MessageType::Announce => self.handle_announce(&header, buf, registry),
            MessageType::Sync => self.handle_sync(&header, buf, timestamp, registry),
            MessageType::FollowUp => self.handle_follow_up(&header, buf, registry),
            MessageType::DelayReq => self.handle_delay_req(&header, buf, timestamp, registry),
            MessageType::DelayResp => self.handle_delay_resp(&header, buf, registry),
            MessageType::PdelayReq => self.handle_pdelay_req(&header, buf, timestamp, registry),
            MessageType::PdelayResp => {
                self.handle_pdelay_resp(&header, buf, timestamp, registry)
            }
            MessageType::PdelayRespFollowUp => {
                self.handle_pdelay_resp_follow_up(&header, buf, registry)
            }
            MessageType::Signaling | MessageType::Management => {
                // accepted but not acted upon; the management layer is an
                // external collaborator
                Ok(())
            }
        };

        if let Err(e) = result {
            debug!("port: malformed {:?}: {}", header.message_type, e);
            self.counters.discarded += 1;
        }
    }

    fn from_parent(&self, header: &Header) -> bool {
        header.source_port_identity == self.parent.parent_port_identity
    }

    fn handle_announce(
        &mut self,
        header: &Header,
        buf: &[u8],
        registry: &mut ClockRegistry,
    ) -> Result<(), MessageError> {
        let announce = Announce::unpack(buf)?;

        match self.state {
            PortState::Faulty | PortState::Disabled | PortState::Initializing => return Ok(()),
            _ => {}
        }

        self.foreign.update(*header, announce, self.now);
        self.record_update = true;

        // announces from the elected parent refresh the receipt timeout
        // and the leap/UTC properties
        if self.state == PortState::Slave && self.from_parent(header) {
            self.s1(header, &announce, registry);
            self.announce_receipt_timer = self.port_ds.announce_timeout_secs();
        }
        self.clock_control.activity = true;

        Ok(())
    }

    fn handle_sync(
        &mut self,
        header: &Header,
        buf: &[u8],
        t2: Timestamp,
        registry: &mut ClockRegistry,
    ) -> Result<(), MessageError> {
        match self.state {
            PortState::Slave | PortState::Uncalibrated => {}
            _ => return Ok(()),
        }
        if !self.from_parent(header) {
            debug!("port: sync from non-parent source");
            return Ok(());
        }

        self.sync_receipt_timer = self.port_ds.announce_timeout_secs();

        if header.two_step() {
            self.pending_sync = Some(PendingSync {
                source: header.source_port_identity,
                sequence_id: header.sequence_id,
                receive_time: t2,
                correction: header.correction(),
                arrived: self.now,
            });
            return Ok(());
        }

        let body = SyncBody::unpack(buf)?;
        self.complete_sync(body.origin_timestamp, t2, header.correction(), registry);
        Ok(())
    }

    fn handle_follow_up(
        &mut self,
        header: &Header,
        buf: &[u8],
        registry: &mut ClockRegistry,
    ) -> Result<(), MessageError> {
        if self.state != PortState::Slave && self.state != PortState::Uncalibrated {
            return Ok(());
        }
        let body = FollowUpBody::unpack(buf)?;

        let pending = match self.pending_sync {
            Some(p) => p,
            None => {
                debug!("port: follow-up without pending sync");
                self.counters.sequence_errors += 1;
                return Ok(());
            }
        };

        if pending.source != header.source_port_identity
            || pending.sequence_id != header.sequence_id
        {
            debug!(
                "port: follow-up {} does not match pending sync {}",
                header.sequence_id, pending.sequence_id
            );
            self.counters.sequence_errors += 1;
            return Ok(());
        }

        self.pending_sync = None;
        let correction = pending.correction.add(&header.correction());
        self.complete_sync(
            body.precise_origin_timestamp,
            pending.receive_time,
            correction,
            registry,
        );
        Ok(())
    }

    /// A sync exchange completed: t1 (master transmit) and t2 (our
    /// receive) are known. Update the offset and discipline the clock.
    fn complete_sync(
        &mut self,
        t1: Timestamp,
        t2: Timestamp,
        correction: Timestamp,
        registry: &mut ClockRegistry,
    ) {
        self.last_sync_origin = Some(t1);
        self.last_sync_receive = Some(t2);
        self.sync_correction = correction;

        let mpd = match self.port_ds.delay_mechanism {
            DelayMechanism::E2E => self.mean_path_delay,
            DelayMechanism::P2P => self.peer_mean_path_delay,
        };

        // offsetFromMaster = (t2 - t1) - meanPathDelay - correction
        let offset = t2.sub(&t1).sub(&mpd).sub(&correction);
        self.offset_from_master = offset;
        self.current.offset_from_master = offset;

        // discard samples outside the sanity window
        if self.config.max_reset_ns > 0
            && offset.seconds == 0
            && (offset.nanoseconds as i64).abs() > self.config.max_reset_ns
        {
            debug!("port: offset {} above max_reset, ignoring", offset);
            self.counters.discarded += 1;
            return;
        }

        if self.state == PortState::Uncalibrated {
            self.to_state(PortState::Slave, registry);
        }

        self.clock_control.available = true;
        self.clock_control.activity = true;

        // clock updates are suspended around a leap second event
        if self.leap_second_in_progress {
            return;
        }

        if self.clock_control.granted {
            let tau = self.port_ds.sync_interval_secs();
            registry.sync_external(self.clock, offset.neg(), tau);
        }
    }

    fn handle_delay_req(
        &mut self,
        header: &Header,
        buf: &[u8],
        t_recv: Timestamp,
        _registry: &mut ClockRegistry,
    ) -> Result<(), MessageError> {
        if self.state != PortState::Master {
            return Ok(());
        }
        SyncBody::unpack(buf)?;

        let mut resp_header = Header::new(
            MessageType::DelayResp,
            self.defaults.domain_number,
            self.port_identity(),
            header.sequence_id,
            self.port_ds.log_min_delay_req_interval,
        );
        // correction accumulated by transparent clocks on the request is
        // echoed back to the requester
        resp_header.correction_field = header.correction_field;

        let body = DelayRespBody {
            receive_timestamp: t_recv,
            requesting_port_identity: header.source_port_identity,
        };

        let mut buf = vec![0u8; MessageType::DelayResp.total_length()];
        resp_header.pack(&mut buf).ok();
        body.pack(&mut buf).ok();
        if self.transport.send_general(&buf).is_err() {
            self.counters.send_failures += 1;
        } else {
            self.counters.tx_messages += 1;
        }
        Ok(())
    }

    fn handle_delay_resp(
        &mut self,
        header: &Header,
        buf: &[u8],
        _registry: &mut ClockRegistry,
    ) -> Result<(), MessageError> {
        if self.state != PortState::Slave {
            return Ok(());
        }
        let body = DelayRespBody::unpack(buf)?;

        if body.requesting_port_identity != self.port_identity() {
            return Ok(());
        }

        let pending = match self.pending_delay_req {
            Some(p) => p,
            None => {
                self.counters.sequence_errors += 1;
                return Ok(());
            }
        };
        if pending.sequence_id != header.sequence_id {
            debug!(
                "port: delay response {} does not match request {}",
                header.sequence_id, pending.sequence_id
            );
            self.counters.sequence_errors += 1;
            return Ok(());
        }
        self.pending_delay_req = None;

        let (t1, t2) = match (self.last_sync_origin, self.last_sync_receive) {
            (Some(t1), Some(t2)) => (t1, t2),
            _ => return Ok(()),
        };
        let t3 = pending.send_time;
        let t4 = body.receive_timestamp;

        // meanPathDelay = ((t2 - t1) + (t4 - t3)) / 2 - corrections
        let total_correction = self.sync_correction.add(&header.correction());
        let mpd = t2
            .sub(&t1)
            .add(&t4.sub(&t3))
            .half()
            .sub(&total_correction);

        if mpd.is_negative() {
            debug!("port: negative path delay sample {}, discarded", mpd);
            self.counters.discarded += 1;
            return Ok(());
        }

        if self.config.max_delay_ns > 0 && mpd.as_nanos() > self.config.max_delay_ns {
            debug!(
                "port: path delay {} above max_delay {}, sample discarded",
                mpd, self.config.max_delay_ns
            );
            self.counters.discarded += 1;
            return Ok(());
        }

        // single-pole IIR: new = old + (sample - old) / 2^s
        if self.mpd_valid {
            let stiffness = 1i64 << self.config.delay_filter_stiffness.min(16);
            let diff = mpd.sub(&self.mean_path_delay);
            let scaled = Timestamp::from_nanos(diff.as_nanos() / stiffness);
            self.mean_path_delay = self.mean_path_delay.add(&scaled);
        } else {
            self.mean_path_delay = mpd;
            self.mpd_valid = true;
        }
        self.current.mean_path_delay = self.mean_path_delay;
        debug!(
            "port: mean path delay {} (sample {})",
            self.mean_path_delay, mpd
        );
        Ok(())
    }

    fn handle_pdelay_req(
        &mut self,
        header: &Header,
        buf: &[u8],
        t2: Timestamp,
        _registry: &mut ClockRegistry,
    ) -> Result<(), MessageError> {
        PdelayReqBody::unpack(buf)?;

        // two-step response: resp carries t2, follow-up carries t3
        let mut resp_header = Header::new(
            MessageType::PdelayResp,
            self.defaults.domain_number,
            self.port_identity(),
            header.sequence_id,
            0x7F,
        );
        resp_header.set_two_step(true);

        let resp = PdelayRespBody {
            request_receipt_timestamp: t2,
            requesting_port_identity: header.source_port_identity,
        };
        let mut out = vec![0u8; MessageType::PdelayResp.total_length()];
        resp_header.pack(&mut out).ok();
        resp.pack(&mut out).ok();

        let t3 = match self.transport.send_event(&out) {
            Ok(t3) => {
                self.counters.tx_messages += 1;
                t3
            }
            Err(_) => {
                self.counters.send_failures += 1;
                return Ok(());
            }
        };

        let fup_header = Header::new(
            MessageType::PdelayRespFollowUp,
            self.defaults.domain_number,
            self.port_identity(),
            header.sequence_id,
            0x7F,
        );
        let fup = PdelayRespFollowUpBody {
            response_origin_timestamp: t3,
            requesting_port_identity: header.source_port_identity,
        };
        let mut out = vec![0u8; MessageType::PdelayRespFollowUp.total_length()];
        fup_header.pack(&mut out).ok();
        fup.pack(&mut out).ok();
        if self.transport.send_general(&out).is_err() {
            self.counters.send_failures += 1;
        } else {
            self.counters.tx_messages += 1;
        }
        Ok(())
    }

    fn handle_pdelay_resp(
        &mut self,
        header: &Header,
        buf: &[u8],
        t4: Timestamp,
        _registry: &mut ClockRegistry,
    ) -> Result<(), MessageError> {
        let body = PdelayRespBody::unpack(buf)?;
        if body.requesting_port_identity != self.port_identity() {
            return Ok(());
        }
        if header.sequence_id != self.pdelay.sequence_id {
            self.counters.sequence_errors += 1;
            return Ok(());
        }
        self.pdelay.t2 = body.request_receipt_timestamp;
        self.pdelay.t4 = t4;
        self.pdelay.have_resp = true;
        self.pdelay.correction = header.correction();
        Ok(())
    }

    fn handle_pdelay_resp_follow_up(
        &mut self,
        header: &Header,
        buf: &[u8],
        _registry: &mut ClockRegistry,
    ) -> Result<(), MessageError> {
        let body = PdelayRespFollowUpBody::unpack(buf)?;
        if body.requesting_port_identity != self.port_identity() {
            return Ok(());
        }
        if !self.pdelay.have_resp || header.sequence_id != self.pdelay.sequence_id {
            self.counters.sequence_errors += 1;
            return Ok(());
        }

        let t1 = self.pdelay.t1;
        let t2 = self.pdelay.t2;
        let t3 = body.response_origin_timestamp;
        let t4 = self.pdelay.t4;
        let correction = self.pdelay.correction.add(&header.correction());
        self.pdelay.have_resp = false;

        // linkDelay = ((t4 - t1) - (t3 - t2)) / 2 - corrections
        let delay = t4.sub(&t1).sub(&t3.sub(&t2)).half().sub(&correction);
        if delay.is_negative() {
            debug!("port: negative peer delay {}, discarding", delay);
            self.counters.discarded += 1;
            return Ok(());
        }
        self.peer_mean_path_delay = delay;
        debug!("port: peer mean path delay {}", delay);
        Ok(())
    }

    // ------------------------------------------------------------------
    // outbound
    // ------------------------------------------------------------------

    fn announce_flags(&self, header: &mut Header) {
        header.set_flag(FLAG_LEAP59, self.time_properties.leap59);
        header.set_flag(FLAG_LEAP61, self.time_properties.leap61);
        header.set_flag(
            FLAG_UTC_OFFSET_VALID,
            self.time_properties.current_utc_offset_valid,
        );
        header.set_flag(FLAG_PTP_TIMESCALE, self.time_properties.ptp_timescale);
        header.set_flag(FLAG_TIME_TRACEABLE, self.time_properties.time_traceable);
        header.set_flag(
            FLAG_FREQUENCY_TRACEABLE,
            self.time_properties.frequency_traceable,
        );
    }

    fn issue_announce(&mut self) {
        self.announce_seq = self.announce_seq.wrapping_add(1);
        let mut header = Header::new(
            MessageType::Announce,
            self.defaults.domain_number,
            self.port_identity(),
            self.announce_seq,
            self.port_ds.log_announce_interval,
        );
        self.announce_flags(&mut header);

        let announce = Announce {
            origin_timestamp: Timestamp::ZERO,
            current_utc_offset: self.time_properties.current_utc_offset,
            grandmaster_priority1: self.parent.grandmaster_priority1,
            grandmaster_clock_quality: self.parent.grandmaster_clock_quality,
            grandmaster_priority2: self.parent.grandmaster_priority2,
            grandmaster_identity: self.parent.grandmaster_identity,
            steps_removed: self.current.steps_removed,
            time_source: self.time_properties.time_source,
        };

        let mut buf = vec![0u8; MessageType::Announce.total_length()];
        header.pack(&mut buf).ok();
        announce.pack(&mut buf).ok();
        if self.transport.send_general(&buf).is_err() {
            self.counters.send_failures += 1;
        } else {
            self.counters.tx_messages += 1;
        }
    }

    fn issue_sync(&mut self, registry: &mut ClockRegistry) {
        self.sync_seq = self.sync_seq.wrapping_add(1);
        let mut header = Header::new(
            MessageType::Sync,
            self.defaults.domain_number,
            self.port_identity(),
            self.sync_seq,
            self.port_ds.log_sync_interval,
        );
        header.set_two_step(self.defaults.two_step);

        let approx = registry
            .get(self.clock)
            .get_time()
            .unwrap_or(Timestamp::ZERO);
        let body = SyncBody {
            origin_timestamp: approx,
        };
        let mut buf = vec![0u8; MessageType::Sync.total_length()];
        header.pack(&mut buf).ok();
        if body.pack(&mut buf).is_err() {
            self.counters.send_failures += 1;
            return;
        }

        let tx_timestamp = match self.transport.send_event(&buf) {
            Ok(ts) => {
                self.counters.tx_messages += 1;
                ts
            }
            Err(e) => {
                warn!("port: sync transmission failed: {}", e);
                self.counters.send_failures += 1;
                return;
            }
        };

        if self.defaults.two_step {
            let fup_header = Header::new(
                MessageType::FollowUp,
                self.defaults.domain_number,
                self.port_identity(),
                self.sync_seq,
                self.port_ds.log_sync_interval,
            );
            let fup = FollowUpBody {
                precise_origin_timestamp: tx_timestamp,
            };
            let mut buf = vec![0u8; MessageType::FollowUp.total_length()];
            fup_header.pack(&mut buf).ok();
            if fup.pack(&mut buf).is_err() {
                self.counters.send_failures += 1;
                return;
            }
            if self.transport.send_general(&buf).is_err() {
                self.counters.send_failures += 1;
            } else {
                self.counters.tx_messages += 1;
            }
        }
    }

    fn issue_delay_req(&mut self, registry: &mut ClockRegistry) {
        self.delay_req_seq = self.delay_req_seq.wrapping_add(1);
        let header = Header::new(
            MessageType::DelayReq,
            self.defaults.domain_number,
            self.port_identity(),
            self.delay_req_seq,
            0x7F,
        );
        let approx = registry
            .get(self.clock)
            .get_time()
            .unwrap_or(Timestamp::ZERO);
        let body = SyncBody {
            origin_timestamp: approx,
        };
        let mut buf = vec![0u8; MessageType::DelayReq.total_length()];
        header.pack(&mut buf).ok();
        if body.pack(&mut buf).is_err() {
            self.counters.send_failures += 1;
            return;
        }

        match self.transport.send_event(&buf) {
            Ok(t3) => {
                self.counters.tx_messages += 1;
                self.pending_delay_req = Some(PendingDelayReq {
                    sequence_id: self.delay_req_seq,
                    send_time: t3,
                });
            }
            Err(e) => {
                warn!("port: delay request transmission failed: {}", e);
                self.counters.send_failures += 1;
            }
        }
    }

    fn issue_pdelay_req(&mut self, registry: &mut ClockRegistry) {
        self.pdelay_req_seq = self.pdelay_req_seq.wrapping_add(1);
        let header = Header::new(
            MessageType::PdelayReq,
            self.defaults.domain_number,
            self.port_identity(),
            self.pdelay_req_seq,
            0x7F,
        );
        let approx = registry
            .get(self.clock)
            .get_time()
            .unwrap_or(Timestamp::ZERO);
        let body = PdelayReqBody {
            origin_timestamp: approx,
        };
        let mut buf = vec![0u8; MessageType::PdelayReq.total_length()];
        header.pack(&mut buf).ok();
        if body.pack(&mut buf).is_err() {
            self.counters.send_failures += 1;
            return;
        }

        match self.transport.send_event(&buf) {
            Ok(t1) => {
                self.counters.tx_messages += 1;
                self.pdelay = PdelayExchange {
                    sequence_id: self.pdelay_req_seq,
                    t1,
                    ..PdelayExchange::default()
                };
            }
            Err(e) => {
                warn!("port: peer delay request transmission failed: {}", e);
                self.counters.send_failures += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::hardware::VirtualClock;
    use crate::config::ClockConfig;
    use std::cell::RefCell;
    use std::collections::VecDeque;
    use std::rc::Rc;

    /// In-memory transport: the test queues inbound frames and inspects
    /// what the port sent.
    #[derive(Default)]
    struct LoopbackState {
        inbound: VecDeque<(Vec<u8>, Timestamp)>,
        sent_event: Vec<Vec<u8>>,
        sent_general: Vec<Vec<u8>>,
        tx_time: Timestamp,
    }

    struct Loopback(Rc<RefCell<LoopbackState>>);

    impl PtpTransport for Loopback {
        fn recv(&mut self) -> Result<Option<(Vec<u8>, Timestamp)>> {
            Ok(self.0.borrow_mut().inbound.pop_front())
        }

        fn send_event(&mut self, buf: &[u8]) -> Result<Timestamp> {
            let mut state = self.0.borrow_mut();
            state.sent_event.push(buf.to_vec());
            Ok(state.tx_time)
        }

        fn send_general(&mut self, buf: &[u8]) -> Result<()> {
            self.0.borrow_mut().sent_general.push(buf.to_vec());
            Ok(())
        }
    }

    struct Harness {
        port: PtpPort,
        registry: ClockRegistry,
        net: Rc<RefCell<LoopbackState>>,
    }

    fn quiet_clock_config() -> ClockConfig {
        ClockConfig {
            outlier_filter: false,
            stat_filter: false,
            calibration_time: 0,
            step_timeout: 0,
            ..ClockConfig::default()
        }
    }

    fn harness(config: PtpConfig) -> Harness {
        let mut registry = ClockRegistry::new();
        let clock = registry.add_driver(
            "syst",
            Box::new(VirtualClock::new()),
            quiet_clock_config(),
            true,
        );
        let net = Rc::new(RefCell::new(LoopbackState::default()));
        let mut port = PtpPort::new(
            config,
            ClockIdentity([0, 1, 2, 0xFF, 0xFE, 3, 4, 5]),
            Box::new(Loopback(net.clone())),
            clock,
        );
        port.initialize(&mut registry);
        Harness {
            port,
            registry,
            net,
        }
    }

    fn master_identity() -> PortIdentity {
        PortIdentity {
            clock_identity: ClockIdentity([9, 9, 9, 0xFF, 0xFE, 9, 9, 9]),
            port_number: 1,
        }
    }

    fn master_announce(seq: u16) -> Vec<u8> {
        let mut header = Header::new(MessageType::Announce, 0, master_identity(), seq, 1);
        header.set_flag(FLAG_UTC_OFFSET_VALID, true);
        let announce = Announce {
            origin_timestamp: Timestamp::ZERO,
            current_utc_offset: 37,
            grandmaster_priority1: 128,
            grandmaster_clock_quality: super::super::datasets::ClockQuality {
                clock_class: 6,
                clock_accuracy: 0x21,
                offset_scaled_log_variance: 0x4E5D,
            },
            grandmaster_priority2: 128,
            grandmaster_identity: master_identity().clock_identity,
            steps_removed: 0,
            time_source: TimeSource::Gps,
        };
        let mut buf = vec![0u8; 64];
        header.pack(&mut buf).unwrap();
        announce.pack(&mut buf).unwrap();
        buf
    }

    fn two_step_sync(seq: u16, approx: Timestamp) -> Vec<u8> {
        let mut header = Header::new(MessageType::Sync, 0, master_identity(), seq, 0);
        header.set_two_step(true);
        let body = SyncBody {
            origin_timestamp: approx,
        };
        let mut buf = vec![0u8; 44];
        header.pack(&mut buf).unwrap();
        body.pack(&mut buf).unwrap();
        buf
    }

    fn follow_up(seq: u16, t1: Timestamp) -> Vec<u8> {
        let header = Header::new(MessageType::FollowUp, 0, master_identity(), seq, 0);
        let body = FollowUpBody {
            precise_origin_timestamp: t1,
        };
        let mut buf = vec![0u8; 44];
        header.pack(&mut buf).unwrap();
        body.pack(&mut buf).unwrap();
        buf
    }

    fn delay_resp(seq: u16, t4: Timestamp, requester: PortIdentity) -> Vec<u8> {
        let header = Header::new(MessageType::DelayResp, 0, master_identity(), seq, 0);
        let body = DelayRespBody {
            receive_timestamp: t4,
            requesting_port_identity: requester,
        };
        let mut buf = vec![0u8; 54];
        header.pack(&mut buf).unwrap();
        body.pack(&mut buf).unwrap();
        buf
    }

    fn make_slave(h: &mut Harness) {
        // two qualified announces then BMC
        let a1 = master_announce(1);
        let a2 = master_announce(2);
        h.port
            .handle_message(&a1, Timestamp::ZERO, &mut h.registry);
        h.port
            .handle_message(&a2, Timestamp::ZERO, &mut h.registry);
        h.port.tick(0.01, &mut h.registry);
        assert_eq!(h.port.state, PortState::Uncalibrated);
    }

    fn slave_config() -> PtpConfig {
        PtpConfig {
            slave_only: true,
            ..PtpConfig::default()
        }
    }

    #[test]
    fn test_initialize_enters_listening() {
        let h = harness(PtpConfig::default());
        assert_eq!(h.port.state, PortState::Listening);
    }

    #[test]
    fn test_qualified_announce_selects_master() {
        let mut h = harness(slave_config());
        make_slave(&mut h);
        assert_eq!(
            h.port.parent.grandmaster_identity,
            master_identity().clock_identity
        );
        assert_eq!(h.port.current.steps_removed, 1);
        assert!(h.port.time_properties.current_utc_offset_valid);
        assert_eq!(h.port.time_properties.current_utc_offset, 37);
    }

    #[test]
    fn test_single_announce_is_not_qualified() {
        let mut h = harness(slave_config());
        let a1 = master_announce(1);
        h.port
            .handle_message(&a1, Timestamp::ZERO, &mut h.registry);
        h.port.tick(0.01, &mut h.registry);
        assert_eq!(h.port.state, PortState::Listening);
    }

    #[test]
    fn test_two_step_exchange_computes_offset_and_delay() {
        let mut h = harness(slave_config());
        make_slave(&mut h);
        h.port.clock_control.granted = true;

        // t1 = 1000000020.0, t2 = t1 + 0.5 s (offset plus path delay)
        let t1 = Timestamp::new(1_000_000_020, 0);
        let t2 = Timestamp::new(1_000_000_020, 500_000_000);
        let sync = two_step_sync(100, t1);
        h.port.handle_message(&sync, t2, &mut h.registry);
        assert_eq!(h.port.state, PortState::Uncalibrated);

        let fup = follow_up(100, t1);
        h.port
            .handle_message(&fup, Timestamp::ZERO, &mut h.registry);

        // first exchange: no delay measured yet, offset = t2 - t1
        assert_eq!(h.port.state, PortState::Slave);
        assert_eq!(
            h.port.offset_from_master,
            Timestamp::new(0, 500_000_000)
        );

        // delay request goes out at t3, response carries t4
        h.net.borrow_mut().tx_time = Timestamp::new(1_000_000_020, 600_000_000);
        h.port.tick(3.0, &mut h.registry);
        assert!(!h.net.borrow().sent_event.is_empty());
        let req_seq = h.port.delay_req_seq;

        let t4 = Timestamp::new(1_000_000_020, 600_400_000);
        let resp = delay_resp(req_seq, t4, h.port.port_identity());
        h.port
            .handle_message(&resp, Timestamp::ZERO, &mut h.registry);

        // meanPathDelay = ((t2 - t1) + (t4 - t3)) / 2 = (0.5 + 0.0004) / 2
        assert_eq!(
            h.port.mean_path_delay,
            Timestamp::new(0, 250_200_000)
        );

        // next sync now subtracts the measured delay
        let t1b = Timestamp::new(1_000_000_021, 0);
        let t2b = Timestamp::new(1_000_000_021, 500_000_000);
        let sync = two_step_sync(101, t1b);
        h.port.handle_message(&sync, t2b, &mut h.registry);
        let fup = follow_up(101, t1b);
        h.port
            .handle_message(&fup, Timestamp::ZERO, &mut h.registry);
        assert_eq!(
            h.port.offset_from_master,
            Timestamp::new(0, 500_000_000 - 250_200_000)
        );
    }

    #[test]
    fn test_clean_exchange_literal_values() {
        // a slave 50 ms ahead of its master over a 450 us path:
        // expected meanPathDelay 450_000 ns, offsetFromMaster +50 ms
        let mut h = harness(slave_config());
        make_slave(&mut h);

        let t1 = Timestamp::new(1_000_000_020, 0);
        let t2 = Timestamp::new(1_000_000_020, 50_000_000 + 450_000);
        let sync = two_step_sync(100, t1);
        h.port.handle_message(&sync, t2, &mut h.registry);
        let fup = follow_up(100, t1);
        h.port
            .handle_message(&fup, Timestamp::ZERO, &mut h.registry);

        h.net.borrow_mut().tx_time = Timestamp::new(1_000_000_020, 600_000_000);
        h.port.tick(3.0, &mut h.registry);
        let req_seq = h.port.delay_req_seq;
        // return path: t4 = t3 - offset + delay
        let t4 = Timestamp::new(1_000_000_020, 600_000_000 - 50_000_000 + 450_000);
        let resp = delay_resp(req_seq, t4, h.port.port_identity());
        h.port
            .handle_message(&resp, Timestamp::ZERO, &mut h.registry);

        assert_eq!(h.port.mean_path_delay, Timestamp::new(0, 450_000));

        let t1b = Timestamp::new(1_000_000_021, 0);
        let t2b = Timestamp::new(1_000_000_021, 50_000_000 + 450_000);
        let sync = two_step_sync(101, t1b);
        h.port.handle_message(&sync, t2b, &mut h.registry);
        let fup = follow_up(101, t1b);
        h.port
            .handle_message(&fup, Timestamp::ZERO, &mut h.registry);

        assert_eq!(
            h.port.offset_from_master,
            Timestamp::new(0, 50_000_000)
        );
    }

    #[test]
    fn test_follow_up_sequence_mismatch_dropped() {
        let mut h = harness(slave_config());
        make_slave(&mut h);

        let t1 = Timestamp::new(100, 0);
        let sync = two_step_sync(7, t1);
        h.port
            .handle_message(&sync, Timestamp::new(100, 10), &mut h.registry);

        let fup = follow_up(8, t1);
        h.port
            .handle_message(&fup, Timestamp::ZERO, &mut h.registry);
        assert!(h.port.counters.sequence_errors > 0);
        // still waiting: the real follow-up completes the exchange
        let fup = follow_up(7, t1);
        h.port
            .handle_message(&fup, Timestamp::ZERO, &mut h.registry);
        assert_eq!(h.port.state, PortState::Slave);
    }

    #[test]
    fn test_stale_pending_sync_expires() {
        let mut h = harness(slave_config());
        make_slave(&mut h);

        let sync = two_step_sync(7, Timestamp::new(100, 0));
        h.port
            .handle_message(&sync, Timestamp::new(100, 10), &mut h.registry);
        let discarded = h.port.counters.discarded;

        // more than one announce interval with no follow-up
        h.port.tick(5.0, &mut h.registry);
        assert_eq!(h.port.counters.discarded, discarded + 1);

        let fup = follow_up(7, Timestamp::new(100, 0));
        h.port
            .handle_message(&fup, Timestamp::ZERO, &mut h.registry);
        // late follow-up is ignored
        assert_eq!(h.port.state, PortState::Uncalibrated);
    }

    #[test]
    fn test_listening_promotes_to_master_on_timeout() {
        let mut config = PtpConfig::default();
        config.clock_class = 6;
        let mut h = harness(config);
        assert_eq!(h.port.state, PortState::Listening);

        // announce timeout: 3 * 2^1 = 6 seconds
        for _ in 0..7 {
            h.port.tick(1.0, &mut h.registry);
        }
        assert_eq!(h.port.state, PortState::PreMaster);

        // qualification pause is one announce interval
        for _ in 0..3 {
            h.port.tick(1.0, &mut h.registry);
        }
        assert_eq!(h.port.state, PortState::Master);
        assert_eq!(h.port.current.steps_removed, 0);
        assert_eq!(
            h.port.parent.grandmaster_identity,
            h.port.defaults.clock_identity
        );
    }

    #[test]
    fn test_slave_only_never_promotes() {
        let mut h = harness(slave_config());
        for _ in 0..30 {
            h.port.tick(1.0, &mut h.registry);
        }
        assert_eq!(h.port.state, PortState::Listening);
    }

    #[test]
    fn test_master_emits_announce_and_sync() {
        let mut config = PtpConfig::default();
        config.clock_class = 6;
        let mut h = harness(config);
        for _ in 0..11 {
            h.port.tick(1.0, &mut h.registry);
        }
        assert_eq!(h.port.state, PortState::Master);

        let general = h.net.borrow().sent_general.len();
        let event = h.net.borrow().sent_event.len();
        assert!(general > 0, "no announce or follow-up sent");
        assert!(event > 0, "no sync sent");

        // two-step: each sync is followed by a follow-up
        let state = h.net.borrow();
        let syncs = state
            .sent_event
            .iter()
            .filter(|b| b[0] & 0x0F == 0x0)
            .count();
        let fups = state
            .sent_general
            .iter()
            .filter(|b| b[0] & 0x0F == 0x8)
            .count();
        assert_eq!(syncs, fups);
    }

    #[test]
    fn test_master_answers_delay_req() {
        let mut config = PtpConfig::default();
        config.clock_class = 6;
        let mut h = harness(config);
        for _ in 0..11 {
            h.port.tick(1.0, &mut h.registry);
        }
        assert_eq!(h.port.state, PortState::Master);
        h.net.borrow_mut().sent_general.clear();

        let req_header = Header::new(MessageType::DelayReq, 0, master_identity(), 55, 0x7F);
        let body = SyncBody {
            origin_timestamp: Timestamp::new(50, 0),
        };
        let mut buf = vec![0u8; 44];
        req_header.pack(&mut buf).unwrap();
        body.pack(&mut buf).unwrap();

        let t_recv = Timestamp::new(50, 123);
        h.port.handle_message(&buf, t_recv, &mut h.registry);

        let state = h.net.borrow();
        let resp = state
            .sent_general
            .iter()
            .find(|b| b[0] & 0x0F == 0x9)
            .expect("no delay response sent");
        let resp_body = DelayRespBody::unpack(resp).unwrap();
        assert_eq!(resp_body.receive_timestamp, t_recv);
        assert_eq!(resp_body.requesting_port_identity, master_identity());
        let resp_header = Header::unpack(resp).unwrap();
        assert_eq!(resp_header.sequence_id, 55);
    }

    #[test]
    fn test_announce_timeout_falls_back_to_listening() {
        let mut h = harness(slave_config());
        make_slave(&mut h);
        assert!(h.port.foreign_record_count() > 0);

        // starve the port of announces past the receipt timeout
        for _ in 0..8 {
            h.port.tick(1.0, &mut h.registry);
        }
        assert_eq!(h.port.state, PortState::Listening);
        assert_eq!(h.port.foreign_record_count(), 0);
    }

    #[test]
    fn test_wrong_domain_discarded() {
        let mut h = harness(slave_config());
        let mut announce = master_announce(1);
        announce[4] = 5;
        let before = h.port.counters.discarded;
        h.port
            .handle_message(&announce, Timestamp::ZERO, &mut h.registry);
        assert_eq!(h.port.counters.discarded, before + 1);
        assert_eq!(h.port.foreign_record_count(), 0);
    }

    #[test]
    fn test_truncated_message_discarded() {
        let mut h = harness(slave_config());
        let announce = master_announce(1);
        let before = h.port.counters.discarded;
        h.port
            .handle_message(&announce[..40], Timestamp::ZERO, &mut h.registry);
        assert_eq!(h.port.counters.discarded, before + 1);
        assert_eq!(h.port.state, PortState::Listening);
    }

    #[test]
    fn test_timestamp_faults_force_faulty() {
        let mut config = slave_config();
        config.max_timestamp_errors = 3;
        let mut h = harness(config);
        make_slave(&mut h);

        // event messages with a zero receive timestamp are timestamp faults
        for seq in 0..3u16 {
            let sync = two_step_sync(seq, Timestamp::new(100, 0));
            h.port
                .handle_message(&sync, Timestamp::ZERO, &mut h.registry);
        }
        assert_eq!(h.port.state, PortState::Faulty);

        // faulty state recovers by reinitializing after the reset delay
        for _ in 0..11 {
            h.port.tick(1.0, &mut h.registry);
        }
        assert_eq!(h.port.state, PortState::Listening);
    }

    #[test]
    fn test_both_leap_flags_fault() {
        let mut h = harness(slave_config());
        make_slave(&mut h);
        // promote to SLAVE with a clean exchange
        let t1 = Timestamp::new(100, 0);
        let sync = two_step_sync(1, t1);
        h.port
            .handle_message(&sync, Timestamp::new(100, 10), &mut h.registry);
        let fup = follow_up(1, t1);
        h.port
            .handle_message(&fup, Timestamp::ZERO, &mut h.registry);
        assert_eq!(h.port.state, PortState::Slave);

        let mut announce = master_announce(3);
        let mut header = Header::unpack(&announce).unwrap();
        header.set_flag(FLAG_LEAP59, true);
        header.set_flag(FLAG_LEAP61, true);
        header.pack(&mut announce).unwrap();
        h.port
            .handle_message(&announce, Timestamp::ZERO, &mut h.registry);
        assert_eq!(h.port.state, PortState::Faulty);
    }

    #[test]
    fn test_leap_pending_set_and_withdrawn() {
        let mut h = harness(slave_config());
        make_slave(&mut h);
        let t1 = Timestamp::new(100, 0);
        let sync = two_step_sync(1, t1);
        h.port
            .handle_message(&sync, Timestamp::new(100, 10), &mut h.registry);
        let fup = follow_up(1, t1);
        h.port
            .handle_message(&fup, Timestamp::ZERO, &mut h.registry);
        assert_eq!(h.port.state, PortState::Slave);

        // leap61 asserted by the master
        let mut announce = master_announce(3);
        let mut header = Header::unpack(&announce).unwrap();
        header.set_flag(FLAG_LEAP61, true);
        header.pack(&mut announce).unwrap();
        h.port
            .handle_message(&announce, Timestamp::ZERO, &mut h.registry);
        assert!(h.port.leap_second_pending);

        // withdrawn again
        let announce = master_announce(4);
        h.port
            .handle_message(&announce, Timestamp::ZERO, &mut h.registry);
        assert!(!h.port.leap_second_pending);
    }

    #[test]
    fn test_offset_discipline_needs_grant() {
        let mut h = harness(slave_config());
        make_slave(&mut h);
        h.port.clock_control.granted = false;

        let t1 = Timestamp::new(100, 0);
        let sync = two_step_sync(1, t1);
        h.port
            .handle_message(&sync, Timestamp::new(100, 10_000), &mut h.registry);
        let fup = follow_up(1, t1);
        h.port
            .handle_message(&fup, Timestamp::ZERO, &mut h.registry);

        // offset is measured but the clock is untouched
        assert!(!h.port.offset_from_master.is_zero());
        assert!(!h.registry.get(h.port.clock).servo.updated());

        h.port.clock_control.granted = true;
        let sync = two_step_sync(2, t1);
        h.port
            .handle_message(&sync, Timestamp::new(100, 10_000), &mut h.registry);
        let fup = follow_up(2, t1);
        h.port
            .handle_message(&fup, Timestamp::ZERO, &mut h.registry);
        assert!(h.registry.get(h.port.clock).servo.updated());
    }

    #[test]
    fn test_pdelay_exchange_measures_link_delay() {
        let mut config = slave_config();
        config.delay_mechanism = DelayMechanism::P2P;
        config.log_min_pdelay_req_interval = 0;
        let mut h = harness(config);

        // the pdelay timer fires and a request goes out at t1
        h.net.borrow_mut().tx_time = Timestamp::new(500, 0);
        h.port.tick(1.5, &mut h.registry);
        let state = h.net.borrow();
        let req = state
            .sent_event
            .iter()
            .find(|b| b[0] & 0x0F == 0x2)
            .expect("no pdelay request sent");
        let req_seq = Header::unpack(req).unwrap().sequence_id;
        drop(state);

        // peer: t2 = request receipt, t3 = response transmit,
        // t4 = our response receipt; link delay 400 ns each way
        let t2 = Timestamp::new(500, 100_000_400);
        let t3 = Timestamp::new(500, 100_050_000);
        let t4 = Timestamp::new(500, 100_050_800);

        let mut resp_header =
            Header::new(MessageType::PdelayResp, 0, master_identity(), req_seq, 0x7F);
        resp_header.set_two_step(true);
        let resp = PdelayRespBody {
            request_receipt_timestamp: t2,
            requesting_port_identity: h.port.port_identity(),
        };
        let mut buf = vec![0u8; 54];
        resp_header.pack(&mut buf).unwrap();
        resp.pack(&mut buf).unwrap();
        h.port.handle_message(&buf, t4, &mut h.registry);

        let fup_header = Header::new(
            MessageType::PdelayRespFollowUp,
            0,
            master_identity(),
            req_seq,
            0x7F,
        );
        let fup = PdelayRespFollowUpBody {
            response_origin_timestamp: t3,
            requesting_port_identity: h.port.port_identity(),
        };
        let mut buf = vec![0u8; 54];
        fup_header.pack(&mut buf).unwrap();
        fup.pack(&mut buf).unwrap();
        h.port
            .handle_message(&buf, Timestamp::ZERO, &mut h.registry);

        // linkDelay = ((t4 - t1) - (t3 - t2)) / 2
        // t1 = 500.0, so ((100_050_800) - (49_600)) / 2 = 50_000_600
        assert_eq!(
            h.port.peer_mean_path_delay,
            Timestamp::new(0, 50_000_600)
        );
    }

    #[test]
    fn test_pdelay_request_answered_two_step() {
        let mut config = slave_config();
        config.delay_mechanism = DelayMechanism::P2P;
        let mut h = harness(config);
        h.net.borrow_mut().tx_time = Timestamp::new(200, 77);

        let req_header = Header::new(MessageType::PdelayReq, 0, master_identity(), 9, 0x7F);
        let body = PdelayReqBody {
            origin_timestamp: Timestamp::new(200, 0),
        };
        let mut buf = vec![0u8; 54];
        req_header.pack(&mut buf).unwrap();
        body.pack(&mut buf).unwrap();

        let t2 = Timestamp::new(200, 50);
        h.port.handle_message(&buf, t2, &mut h.registry);

        let state = h.net.borrow();
        let resp = state
            .sent_event
            .iter()
            .find(|b| b[0] & 0x0F == 0x3)
            .expect("no pdelay response sent");
        let resp_body = PdelayRespBody::unpack(resp).unwrap();
        assert_eq!(resp_body.request_receipt_timestamp, t2);
        assert_eq!(resp_body.requesting_port_identity, master_identity());
        assert!(Header::unpack(resp).unwrap().two_step());

        // the follow-up carries the response transmit time
        let fup = state
            .sent_general
            .iter()
            .find(|b| b[0] & 0x0F == 0xA)
            .expect("no pdelay response follow-up sent");
        let fup_body = PdelayRespFollowUpBody::unpack(fup).unwrap();
        assert_eq!(fup_body.response_origin_timestamp, Timestamp::new(200, 77));
    }

    #[test]
    fn test_leap_second_event_at_midnight() {
        let mut h = harness(slave_config());
        make_slave(&mut h);

        // park the clock 30 s before a UTC midnight
        let midnight = 86_400i64 * 19_900;
        h.registry
            .get_mut(h.port.clock)
            .set_time(&Timestamp::new(midnight - 30, 0))
            .unwrap();
        h.port.leap_second_pending = true;

        h.port.tick(1.0, &mut h.registry);
        assert!(!h.port.leap_second_in_progress);

        // inside the pause window before midnight
        h.registry
            .get_mut(h.port.clock)
            .set_time(&Timestamp::new(midnight - 2, 0))
            .unwrap();
        h.port.tick(1.0, &mut h.registry);
        assert!(h.port.leap_second_in_progress);

        // well past the event: flags clear and updates resume
        h.registry
            .get_mut(h.port.clock)
            .set_time(&Timestamp::new(midnight + 10, 0))
            .unwrap();
        h.port.tick(1.0, &mut h.registry);
        assert!(!h.port.leap_second_pending);
        assert!(!h.port.leap_second_in_progress);
        assert!(!h.port.time_properties.leap61);
    }

    #[test]
    fn test_own_messages_ignored() {
        let mut h = harness(slave_config());
        let mut announce = master_announce(1);
        // rewrite the source to our own identity
        announce[20..28].copy_from_slice(&h.port.defaults.clock_identity.0);
        h.port
            .handle_message(&announce, Timestamp::ZERO, &mut h.registry);
        assert_eq!(h.port.foreign_record_count(), 0);
    }
}
