//! Clock drivers: the state machine and servo wrapped around one
//! adjustable clock.
//!
//! Drivers live in a [`registry::ClockRegistry`] arena and reference each
//! other by handle, never by pointer. The registry owns best-clock
//! election and the reference graph; this module owns everything that
//! happens to a single clock: state transitions, filtering, frequency
//! estimation and the discipline path itself.

pub mod hardware;
#[cfg(unix)]
pub mod linux;
pub mod registry;

use std::fmt;

use log::{debug, error, info, warn};

use crate::config::{ClockConfig, StepType};
use crate::filter::{AdevAccumulator, FilterType, MovingStatFilter, RunningMean, WindowType};
use crate::servo::PiServo;
use crate::time::Timestamp;

use hardware::ClockHardware;

/// Stable handle into the registry arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClockId(pub usize);

/// Hop count assigned to a clock with no reference.
pub const NO_REFERENCE_DISTANCE: u8 = 255;

/// Seconds between repeated slew warnings.
const WARNING_TIMEOUT: u32 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ClockState {
    /// Locked up after a refused negative step; manual intervention
    /// (or a forced step) required.
    NegStep,
    /// Suspended in panic mode after a 1 s+ offset, counting down to a
    /// step.
    Step,
    /// Hardware fault; no adjustments until the health check recovers.
    HwFault,
    Init,
    /// Not disciplined, or reference present but never updated.
    Freerun,
    /// Estimating frequency error before tracking starts.
    Freqest,
    /// Tracking a reference but not (or no longer) stable.
    Tracking,
    /// Was locked, lost its reference or updates; still usable.
    Holdover,
    /// Locked to reference with Allan deviation below threshold.
    Locked,
}

impl ClockState {
    pub fn name(&self) -> &'static str {
        match self {
            ClockState::NegStep => "NEGSTEP",
            ClockState::Step => "STEP",
            ClockState::HwFault => "HWFAULT",
            ClockState::Init => "INIT",
            ClockState::Freerun => "FREERUN",
            ClockState::Freqest => "FREQEST",
            ClockState::Tracking => "TRACKING",
            ClockState::Holdover => "HOLDOVER",
            ClockState::Locked => "LOCKED",
        }
    }

    pub fn short_name(&self) -> &'static str {
        match self {
            ClockState::NegStep => "NSTP",
            ClockState::Step => "STEP",
            ClockState::HwFault => "HWFL",
            ClockState::Init => "INIT",
            ClockState::Freerun => "FREE",
            ClockState::Freqest => "FEST",
            ClockState::Tracking => "TRCK",
            ClockState::Holdover => "HOLD",
            ClockState::Locked => "LOCK",
        }
    }

    /// Only locked and holdover clocks are election candidates.
    pub fn selectable(&self) -> bool {
        matches!(self, ClockState::Locked | ClockState::Holdover)
    }
}

impl fmt::Display for ClockState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Reference quality rank; lower rank is a better reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum RefClass {
    Ptp = 0,
    External = 1,
    Internal = 2,
    None = 3,
}

/// Observable driver events, drained by the engine once per scheduler
/// pass. Each transition is reported exactly once.
#[derive(Debug, Clone, PartialEq)]
pub enum ClockEvent {
    StateChange {
        clock: ClockId,
        from: ClockState,
        to: ClockState,
    },
    LockChanged {
        clock: ClockId,
        locked: bool,
    },
    Stepped {
        clock: ClockId,
        delta: Timestamp,
    },
}

pub struct ClockDriver {
    pub id: ClockId,
    pub name: String,
    hardware: Box<dyn ClockHardware>,

    pub config: ClockConfig,
    pub system_clock: bool,
    pub best_clock: bool,

    pub state: ClockState,
    pub last_state: ClockState,
    /// Seconds in the current state without a discipline update.
    pub age_secs: f64,
    pub distance: u8,

    pub ref_clock: Option<ClockId>,
    pub ref_name: String,
    pub ref_class: RefClass,
    pub last_ref_class: RefClass,
    pub external_reference: bool,

    pub servo: PiServo,
    mad_filter: MovingStatFilter,
    stat_filter: MovingStatFilter,

    adev_acc: AdevAccumulator,
    total_adev_acc: AdevAccumulator,
    pub adev: f64,
    pub total_adev: f64,
    pub min_adev: f64,
    pub max_adev: f64,
    pub adev_valid: bool,

    pub raw_offset: Timestamp,
    pub ref_offset: Timestamp,
    last_offset: Timestamp,
    pub last_frequency: f64,
    pub stored_frequency: f64,
    pub estimated_frequency: f64,
    cal_mean: RunningMean,
    last_delta: Option<Timestamp>,

    pub tau: f64,
    warning_timeout: u32,
    updated: bool,
    stepped: bool,
    locked_once: bool,
    locked_up: bool,
    can_resume: bool,
    pub wait_for_election: bool,
    pub skip_sync: bool,

    pub events: Vec<ClockEvent>,
}

impl ClockDriver {
    pub fn new(
        id: ClockId,
        name: &str,
        hardware: Box<dyn ClockHardware>,
        config: ClockConfig,
        system_clock: bool,
    ) -> Self {
        let mut servo = PiServo::new(config.servo_kp(), config.servo_ki(), config.servo_max_ppb);
        servo.tau_method = config.servo_tau_method;
        servo.max_tau = config.servo_max_tau;

        let mad_filter =
            MovingStatFilter::new(FilterType::Mad, WindowType::Sliding, config.mad_window_size);
        let stat_filter = MovingStatFilter::new(
            config.filter_type,
            config.filter_window_type,
            config.filter_window_size,
        );

        ClockDriver {
            id,
            name: name.to_string(),
            hardware,
            config,
            system_clock,
            best_clock: false,
            state: ClockState::Init,
            last_state: ClockState::Init,
            age_secs: 0.0,
            distance: NO_REFERENCE_DISTANCE,
            ref_clock: None,
            ref_name: String::new(),
            ref_class: RefClass::None,
            last_ref_class: RefClass::None,
            external_reference: false,
            servo,
            mad_filter,
            stat_filter,
            adev_acc: AdevAccumulator::new(),
            total_adev_acc: AdevAccumulator::new(),
            adev: 0.0,
            total_adev: 0.0,
            min_adev: 0.0,
            max_adev: 0.0,
            adev_valid: false,
            raw_offset: Timestamp::ZERO,
            ref_offset: Timestamp::ZERO,
            last_offset: Timestamp::ZERO,
            last_frequency: 0.0,
            stored_frequency: 0.0,
            estimated_frequency: 0.0,
            cal_mean: RunningMean::new(),
            last_delta: None,
            tau: 1.0,
            warning_timeout: 0,
            updated: false,
            stepped: false,
            locked_once: false,
            locked_up: false,
            can_resume: false,
            wait_for_election: false,
            skip_sync: false,
            events: Vec::new(),
        }
    }

    /// Bring the driver up: verify the hardware responds and enter
    /// FREERUN.
    pub fn init(&mut self) -> bool {
        if self.hardware.get_time().is_err() || !self.hardware.health_check() {
            error!("clock {}: hardware failed to initialize", self.name);
            self.set_state(ClockState::HwFault);
            return false;
        }
        self.last_frequency = self.hardware.get_frequency();
        self.set_state(ClockState::Freerun);
        true
    }

    pub fn shutdown(&mut self) {
        if self.config.store_to_file {
            self.store_frequency();
        }
    }

    // ------------------------------------------------------------------
    // basic capability pass-through
    // ------------------------------------------------------------------

    pub fn get_time(&self) -> anyhow::Result<Timestamp> {
        self.hardware.get_time()
    }

    pub fn get_time_monotonic(&self) -> anyhow::Result<Timestamp> {
        self.hardware.get_time_monotonic()
    }

    pub fn set_time(&mut self, time: &Timestamp) -> anyhow::Result<()> {
        if self.config.no_adjust || self.state == ClockState::HwFault {
            return Ok(());
        }
        self.hardware.set_time(time)
    }

    pub fn get_frequency(&self) -> f64 {
        self.hardware.get_frequency()
    }

    pub fn set_frequency(&mut self, ppb: f64, _tau: f64) -> bool {
        if self.config.no_adjust {
            return true;
        }
        if self.state == ClockState::HwFault {
            return false;
        }
        match self.hardware.set_frequency(ppb) {
            Ok(()) => {
                self.last_frequency = ppb;
                true
            }
            Err(e) => {
                error!("clock {}: frequency adjustment failed: {}", self.name, e);
                self.set_state(ClockState::HwFault);
                false
            }
        }
    }

    pub fn set_leap(&mut self, action: hardware::LeapAction) -> anyhow::Result<()> {
        self.hardware.set_leap(action)
    }

    pub fn health_check(&mut self) -> bool {
        self.hardware.health_check()
    }

    /// Clear accumulated age; called whenever the clock sees an update.
    fn touch(&mut self) {
        self.age_secs = 0.0;
        self.updated = true;
    }

    pub fn is_locked_up(&self) -> bool {
        self.locked_up
    }

    pub fn has_stepped(&self) -> bool {
        self.stepped
    }

    // ------------------------------------------------------------------
    // state machine
    // ------------------------------------------------------------------

    pub fn set_state(&mut self, new_state: ClockState) {
        if self.config.disabled && new_state > ClockState::Freerun {
            return;
        }
        if self.state == new_state {
            return;
        }

        info!(
            "clock {}: state {} -> {}",
            self.name,
            self.state.name(),
            new_state.name()
        );

        self.age_secs = 0.0;

        // entering FREERUN from a bad state restores the last good frequency
        if new_state == ClockState::Freerun
            && !matches!(self.state, ClockState::Locked | ClockState::Holdover)
        {
            self.restore_frequency();
        }

        if new_state == ClockState::Locked && !self.locked_once {
            self.locked_once = true;
            self.min_adev = self.adev;
            self.max_adev = self.adev;
        }

        // entering or leaving LOCKED: pause syncing until the next election
        if new_state == ClockState::Locked || self.state == ClockState::Locked {
            self.wait_for_election = true;
            info!(
                "clock {}: adev {:.3} min {:.3} max {:.3} total {:.3}",
                self.name, self.adev, self.min_adev, self.max_adev, self.total_adev
            );
            self.events.push(ClockEvent::LockChanged {
                clock: self.id,
                locked: new_state == ClockState::Locked,
            });
        }

        self.last_state = self.state;
        self.state = new_state;
        self.events.push(ClockEvent::StateChange {
            clock: self.id,
            from: self.last_state,
            to: new_state,
        });
    }

    /// Post-adjustment bookkeeping: adev tracking and the resulting
    /// state transitions.
    pub fn process_update(&mut self) {
        if self.config.disabled || self.state == ClockState::HwFault {
            return;
        }

        self.adev_acc.feed(self.last_frequency);
        self.total_adev = self.total_adev_acc.feed(self.last_frequency);

        let window = self.adev_acc.count as f64 * self.tau * self.servo.delay_factor;
        if self.tau > 0.0 && window > self.config.adev_period as f64 {
            self.adev = self.adev_acc.adev;

            if self.state == ClockState::Locked {
                if self.adev > self.max_adev {
                    self.max_adev = self.adev;
                }
                if self.adev < self.min_adev {
                    self.min_adev = self.adev;
                }
            }

            if !matches!(self.state, ClockState::Step | ClockState::NegStep) {
                if self.servo.running_max_output() {
                    self.set_state(ClockState::Tracking);
                } else if self.adev <= self.config.stable_adev {
                    self.store_frequency();
                    self.set_state(ClockState::Locked);
                } else if self.adev >= self.config.unstable_adev
                    && self.state == ClockState::Locked
                {
                    self.set_state(ClockState::Tracking);
                }
            }
            self.adev_valid = true;
            self.adev_acc.reset();
        }

        if self.state == ClockState::Freerun {
            if self.config.calibration_time > 0 {
                self.set_state(ClockState::Freqest);
            } else {
                self.set_state(ClockState::Tracking);
            }
        }

        if self.state == ClockState::Holdover
            && self.age_secs <= self.config.holdover_age as f64
        {
            self.set_state(ClockState::Tracking);
        }

        if self.state == ClockState::Locked && self.servo.running_max_output() {
            self.set_state(ClockState::Tracking);
        }

        if self.state == ClockState::NegStep && !self.ref_offset.is_negative() {
            self.locked_up = false;
            self.set_state(ClockState::Freerun);
        }

        self.touch();
    }

    /// Periodic tick from the registry; `interval` is the tick length in
    /// seconds. Reference-graph transitions are handled by the registry,
    /// which sees all drivers.
    pub fn age_tick(&mut self, interval: f64) {
        if self.config.disabled {
            return;
        }
        self.age_secs += interval;
        if self.warning_timeout > 0 {
            self.warning_timeout = self.warning_timeout.saturating_sub(interval as u32);
        }

        match self.state {
            ClockState::HwFault => {
                if self.age_secs >= self.config.failure_delay as f64 {
                    if self.hardware.health_check() {
                        self.set_state(ClockState::Freerun);
                    } else {
                        // stay put, retry after another failure delay
                        self.age_secs = 0.0;
                    }
                }
            }
            ClockState::Step => {
                if self.age_secs >= self.config.step_timeout as f64 {
                    warn!(
                        "clock {}: suspension delay timeout, resuming clock updates",
                        self.name
                    );
                    self.set_state(ClockState::Freerun);
                    self.can_resume = true;
                }
            }
            ClockState::Locked => {
                if self.age_secs > self.config.locked_age as f64 {
                    self.adev_acc.reset();
                    self.set_state(ClockState::Holdover);
                }
            }
            ClockState::Holdover => {
                if self.age_secs > self.config.holdover_age as f64 {
                    self.set_state(ClockState::Freerun);
                }
            }
            _ => {}
        }
    }

    // ------------------------------------------------------------------
    // stepping
    // ------------------------------------------------------------------

    pub fn step_time(&mut self, delta: &Timestamp, force: bool) -> bool {
        if self.state == ClockState::HwFault {
            return false;
        }
        if self.config.no_adjust || self.config.disabled {
            return true;
        }
        if delta.is_zero() {
            return true;
        }

        // ignore sub-threshold steps, acting as if they happened
        if delta.seconds == 0
            && self.config.min_step_ns > 0
            && delta.nanoseconds.abs() <= self.config.min_step_ns
        {
            self.stepped = true;
            return true;
        }

        if force {
            self.locked_up = false;
        }

        if !force && !self.config.negative_step && delta.is_negative() {
            error!(
                "clock {}: refusing to step backwards by {}; manual intervention or SIGUSR1 required",
                self.name, delta
            );
            self.locked_up = true;
            self.set_state(ClockState::NegStep);
            return false;
        }

        let new_time = match self.hardware.get_time() {
            Ok(now) => now.add(delta),
            Err(e) => {
                error!("clock {}: cannot read clock for step: {}", self.name, e);
                return false;
            }
        };
        if new_time.seconds <= 0 {
            error!(
                "clock {}: refusing to step to non-positive time {}",
                self.name, new_time
            );
            return false;
        }

        if let Err(e) = self.hardware.set_offset(delta) {
            error!("clock {}: step failed: {}", self.name, e);
            self.set_state(ClockState::HwFault);
            return false;
        }

        self.mad_filter.reset();
        self.stat_filter.reset();

        info!("clock {}: stepped by {} s", self.name, delta);
        self.events.push(ClockEvent::Stepped {
            clock: self.id,
            delta: *delta,
        });
        self.stepped = true;

        if force || self.state != ClockState::Freqest {
            self.set_state(ClockState::Freerun);
        }

        true
    }

    // ------------------------------------------------------------------
    // frequency persistence
    // ------------------------------------------------------------------

    fn frequency_file(&self) -> std::path::PathBuf {
        std::path::Path::new(&self.config.frequency_dir)
            .join(format!("clock_{}.frequency", self.name))
    }

    pub fn restore_frequency(&mut self) {
        let mut frequency = 0.0;
        if self.config.store_to_file {
            if let Ok(text) = std::fs::read_to_string(self.frequency_file()) {
                frequency = text.trim().parse::<f64>().unwrap_or(0.0);
            }
        }
        if frequency.abs() <= f64::EPSILON {
            frequency = self.hardware.get_frequency();
        }
        frequency = frequency.clamp(-self.config.servo_max_ppb, self.config.servo_max_ppb);
        self.servo.prime(frequency);
        self.stored_frequency = self.servo.output;
        let output = self.servo.output;
        self.set_frequency(output, 1.0);
    }

    pub fn store_frequency(&mut self) {
        if self.config.store_to_file {
            let path = self.frequency_file();
            if let Some(dir) = path.parent() {
                let _ = std::fs::create_dir_all(dir);
            }
            if let Err(e) = std::fs::write(&path, format!("{:.9}\n", self.last_frequency)) {
                warn!(
                    "clock {}: cannot store frequency to {}: {}",
                    self.name,
                    path.display(),
                    e
                );
            }
        }
        self.stored_frequency = self.last_frequency;
    }

    // ------------------------------------------------------------------
    // frequency estimation (FREQEST)
    // ------------------------------------------------------------------

    fn apply_frequency_estimate(&mut self) {
        let mut frequency = self.hardware.get_frequency() + self.estimated_frequency;
        frequency = frequency.clamp(-self.config.servo_max_ppb, self.config.servo_max_ppb);
        if frequency.abs() <= f64::EPSILON {
            return;
        }
        debug!(
            "clock {}: applying estimated frequency {:.3} ppb",
            self.name, frequency
        );
        self.servo.reset();
        self.servo.prime(frequency);
        self.stored_frequency = self.servo.output;
        let output = self.servo.output;
        self.set_frequency(output, 1.0);
    }

    fn estimate_frequency(&mut self, tau: f64) -> bool {
        let last = match self.last_delta {
            Some(last) => last,
            None => {
                self.cal_mean.reset();
                self.age_secs = 0.0;
                self.last_delta = Some(self.ref_offset);
                return false;
            }
        };

        let delta = self.ref_offset.sub(&last);
        self.cal_mean.feed(delta.as_secs_f64() / tau);
        self.estimated_frequency = self.cal_mean.mean * 1e9;
        self.last_delta = Some(self.ref_offset);

        if self.age_secs >= self.config.calibration_time as f64 {
            info!(
                "clock {}: estimated frequency error {:.3} ppb",
                self.name, self.estimated_frequency
            );
            self.last_delta = None;
            self.apply_frequency_estimate();
            let offset = self.ref_offset;
            self.step_time(&offset, false);
            self.set_state(ClockState::Tracking);
        }

        true
    }

    // ------------------------------------------------------------------
    // filtering
    // ------------------------------------------------------------------

    /// Run the configured filters over `ref_offset`. Returns false when
    /// the sample was rejected; `ref_offset` then re-uses the last
    /// accepted value.
    fn filter_offset(&mut self, tau: f64) -> bool {
        let offset = self.ref_offset.as_secs_f64();

        if self.config.outlier_filter {
            let have_stat = self.mad_filter.feed(offset);
            if have_stat && self.mad_filter.count as usize >= self.config.mad_delay {
                let deviation = (offset - self.mad_filter.median).abs();
                let mad = self.mad_filter.output.max(f64::MIN_POSITIVE);
                let mads = deviation / mad;

                if mads > self.config.mad_max {
                    debug!(
                        "clock {}: outlier {:.9} ({:.1} MADs, blocking {:.0}s)",
                        self.name, offset, mads, self.mad_filter.blocking_time
                    );
                    self.ref_offset = self.last_offset;
                    self.mad_filter.mark_blocked(tau);

                    if self.mad_filter.blocking_time
                        > self.config.outlier_filter_block_timeout as f64
                    {
                        debug!(
                            "clock {}: outlier filter blocked for over {} s, resetting",
                            self.name, self.config.outlier_filter_block_timeout
                        );
                        self.mad_filter.reset();
                    }
                    return false;
                }
                self.mad_filter.mark_passed();
            }
        }

        if self.config.stat_filter {
            if !self.stat_filter.feed(offset) {
                self.ref_offset = self.last_offset;
                self.stat_filter.mark_blocked(tau);
                return false;
            }
            self.stat_filter.mark_passed();
            self.ref_offset = Timestamp::from_secs_f64(self.stat_filter.output);
        }

        true
    }

    // ------------------------------------------------------------------
    // discipline
    // ------------------------------------------------------------------

    /// Feed one offset measurement to the clock. The offset is the
    /// correction to apply (reference minus local), so a positive offset
    /// means this clock is behind its reference.
    pub fn discipline(&mut self, offset: Timestamp, tau: f64) -> bool {
        if self.config.disabled {
            return false;
        }

        self.tau = tau;
        self.last_offset = self.ref_offset;
        self.raw_offset = offset;
        self.ref_offset = offset.sub(&Timestamp::new(0, self.config.offset_correction_ns));

        // a zero offset would drag linked clocks around through the servo
        if self.ref_offset.is_zero() {
            self.last_frequency = self.hardware.get_frequency();
            self.process_update();
            return true;
        }

        if self.config.no_adjust {
            return false;
        }

        if offset.seconds != 0 {
            return self.discipline_large_offset(offset, tau);
        }

        if self.state == ClockState::Step {
            // still suspended unless we are back inside the exit window
            if self.config.step_exit_threshold_ns > 0
                && (offset.nanoseconds as i64).abs() > self.config.step_exit_threshold_ns
            {
                return false;
            }
            info!(
                "clock {}: offset below 1 second, resuming clock control",
                self.name
            );
            self.set_state(ClockState::Freerun);
        }

        if self.state == ClockState::NegStep {
            self.locked_up = false;
            self.set_state(ClockState::Freerun);
        }

        if !self.external_reference && !self.filter_offset(tau) {
            return false;
        }

        if self.state == ClockState::Freqest {
            return self.estimate_frequency(tau);
        }

        // a positive offset (clock behind) needs a positive frequency
        // correction
        let input = self.ref_offset.as_nanos() as f64;
        let output = self.servo.feed(input, tau);
        let ok = self.set_frequency(output, tau);
        self.process_update();
        ok
    }

    /// Offset of one second or more: step, panic, or slew.
    fn discipline_large_offset(&mut self, offset: Timestamp, tau: f64) -> bool {
        let sign = if offset.seconds < 0 { -1.0 } else { 1.0 };

        // single startup step, allowed only before the first update and
        // before the servo has produced an adjustment
        if !self.updated && !self.stepped && !self.locked_up && !self.servo.updated() {
            match self.config.step_type {
                StepType::StartupForce => {
                    return self.step_time(&offset, true);
                }
                StepType::Startup => {
                    return self.step_time(&offset, false);
                }
                _ => {}
            }
        }

        if self.state == ClockState::Step {
            return false;
        }
        if sign < 0.0 && self.state == ClockState::NegStep {
            return false;
        }

        if self.config.step_type == StepType::Never || self.config.no_step {
            if self.warning_timeout == 0 {
                self.warning_timeout = WARNING_TIMEOUT;
                warn!(
                    "clock {}: offset above 1 second ({} s) and cannot step, slewing at maximum rate",
                    self.name, self.ref_offset
                );
            }
            let max = self.config.servo_max_ppb;
            self.servo.prime(sign * max);
            self.can_resume = false;
            let ok = self.set_frequency(sign * max, tau);
            self.process_update();
            return ok;
        }

        // panic mode: suspend updates and wait for the step countdown
        if self.config.step_timeout > 0 && !self.can_resume {
            warn!(
                "clock {}: offset above 1 second ({} s), suspending clock control for {} s",
                self.name, self.ref_offset, self.config.step_timeout
            );
            self.set_state(ClockState::Step);
            return false;
        }

        warn!(
            "clock {}: offset above 1 second ({} s), stepping clock",
            self.name, self.ref_offset
        );
        if self.step_time(&offset, false) {
            self.can_resume = false;
            self.ref_offset.clear();
            true
        } else {
            false
        }
    }

    // ------------------------------------------------------------------
    // reporting
    // ------------------------------------------------------------------

    pub fn stats_line(&self) -> String {
        if self.config.disabled {
            return format!("{}: disabled", self.name);
        }
        let ro = if self.config.no_adjust { "r" } else { " " };
        let marker = if self.best_clock {
            "*"
        } else if self.state <= ClockState::Init {
            "!"
        } else {
            " "
        };
        format!(
            "{}{}{}: {} offs: {:<14} adev: {:<8.3} freq: {:.3}",
            ro,
            marker,
            self.name,
            self.state.short_name(),
            self.ref_offset.to_string(),
            self.adev,
            self.last_frequency
        )
    }

    pub fn info_line(&self) -> String {
        format!(
            "name: {} state: {} ref: {} class: {:?} distance: {} age: {:.0}s",
            self.name,
            self.state.name(),
            if self.ref_name.is_empty() {
                "none"
            } else {
                &self.ref_name
            },
            self.ref_class,
            self.distance,
            self.age_secs
        )
    }
}
