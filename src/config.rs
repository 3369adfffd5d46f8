//! Daemon configuration.
//!
//! Loaded from a JSON file and overridden by CLI flags. Every section
//! has full serde defaults so a minimal file like `{"ntp_server": "..."}`
//! is valid.

use serde::{Deserialize, Serialize};

use crate::filter::{FilterType, WindowType};
use crate::ptp::datasets::DelayMechanism;
use crate::servo::TauMethod;

/// Clock stepping policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    /// Never step; slew at maximum rate instead.
    Never,
    /// Step whenever the offset exceeds one second.
    Always,
    /// Step only once, on the first update after startup.
    Startup,
    /// Step on startup regardless of offset sign or magnitude.
    StartupForce,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Interface to bind PTP multicast sockets on; auto-detected when
    /// unset.
    pub interface: Option<String>,
    pub ntp_server: String,
    pub lock_file: String,
    pub ptp: PtpConfig,
    pub clock: ClockConfig,
    pub failover: FailoverConfig,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            interface: None,
            ntp_server: "pool.ntp.org".to_string(),
            lock_file: "/var/run/ptpsyncd.lock".to_string(),
            ptp: PtpConfig::default(),
            clock: ClockConfig::default(),
            failover: FailoverConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PtpConfig {
    pub slave_only: bool,
    pub priority1: u8,
    pub priority2: u8,
    /// 0..=127
    pub domain_number: u8,
    pub log_announce_interval: i8,
    /// Multiples of the announce interval, minimum 2.
    pub announce_receipt_timeout: u8,
    pub log_sync_interval: i8,
    pub log_min_delay_req_interval: i8,
    pub log_min_pdelay_req_interval: i8,
    pub delay_mechanism: DelayMechanism,
    pub two_step: bool,
    pub clock_class: u8,
    pub clock_accuracy: u8,
    pub clock_variance: u16,
    pub max_foreign_records: usize,
    /// Discard samples whose measured delay exceeds this (0 disables).
    pub max_delay_ns: i64,
    /// Discard offset samples above this without stepping (0 disables).
    pub max_reset_ns: i64,
    /// One-way delay IIR stiffness exponent; the pole is 2^s.
    pub delay_filter_stiffness: u8,
    /// Consecutive timestamp faults tolerated before going FAULTY.
    pub max_timestamp_errors: u32,
    /// Seconds to remain FAULTY before reinitializing.
    pub fault_reset_delay: u32,
}

impl Default for PtpConfig {
    fn default() -> Self {
        PtpConfig {
            slave_only: false,
            priority1: 128,
            priority2: 128,
            domain_number: 0,
            log_announce_interval: 1,
            announce_receipt_timeout: 3,
            log_sync_interval: 0,
            log_min_delay_req_interval: 0,
            log_min_pdelay_req_interval: 1,
            delay_mechanism: DelayMechanism::E2E,
            two_step: true,
            clock_class: crate::ptp::datasets::DEFAULT_CLOCK_CLASS,
            clock_accuracy: crate::ptp::datasets::DEFAULT_CLOCK_ACCURACY,
            clock_variance: crate::ptp::datasets::DEFAULT_CLOCK_VARIANCE,
            max_foreign_records: crate::ptp::bmc::DEFAULT_MAX_FOREIGN_RECORDS,
            max_delay_ns: 0,
            max_reset_ns: 0,
            delay_filter_stiffness: 6,
            max_timestamp_errors: 5,
            fault_reset_delay: 10,
        }
    }
}

impl PtpConfig {
    /// Reject combinations the engine cannot run with. Called once at
    /// startup, before any socket is opened.
    pub fn validate(&self) -> Result<(), String> {
        if self.domain_number > 127 {
            return Err(format!("domain_number {} out of range 0..=127", self.domain_number));
        }
        if self.announce_receipt_timeout < 2 {
            return Err("announce_receipt_timeout must be at least 2".to_string());
        }
        if self.slave_only && self.clock_class != crate::ptp::datasets::DEFAULT_CLOCK_CLASS
            && self.clock_class != crate::ptp::datasets::SLAVE_ONLY_CLOCK_CLASS
        {
            return Err("slave_only conflicts with a fixed master clock_class".to_string());
        }
        if self.max_foreign_records == 0 {
            return Err("max_foreign_records must be at least 1".to_string());
        }
        Ok(())
    }
}

/// Per-driver discipline configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClockConfig {
    /// Skip this clock entirely: no sync, no election.
    pub disabled: bool,
    /// Keep the clock running but leave it out of best-clock election.
    pub excluded: bool,
    /// Read-only mode: observe offsets but never adjust.
    pub no_adjust: bool,
    pub step_type: StepType,
    /// Clock may be stepped backwards.
    pub negative_step: bool,
    /// Clock must never be stepped; slew at maximum rate instead.
    pub no_step: bool,
    /// Panic mode duration in seconds when a 1 s+ offset is seen.
    pub step_timeout: u32,
    /// Offset below which panic mode exits early (0 disables).
    pub step_exit_threshold_ns: i64,
    /// Ignore steps smaller than this (0 disables).
    pub min_step_ns: i32,
    /// Constant offset correction subtracted from every sample.
    pub offset_correction_ns: i32,
    /// Frequency estimation period in seconds (0 skips FREQEST).
    pub calibration_time: u32,
    /// Recovery countdown after a hardware fault.
    pub failure_delay: u32,
    /// Maximum seconds in LOCKED without updates before HOLDOVER.
    pub locked_age: u32,
    /// Maximum seconds in HOLDOVER before falling to FREERUN.
    pub holdover_age: u32,
    pub adev_period: u32,
    pub stable_adev: f64,
    pub unstable_adev: f64,
    pub outlier_filter: bool,
    pub stat_filter: bool,
    pub mad_max: f64,
    pub mad_window_size: usize,
    /// Samples required in the MAD window before the gate engages.
    pub mad_delay: usize,
    pub outlier_filter_block_timeout: u32,
    pub filter_window_size: usize,
    pub filter_window_type: WindowType,
    pub filter_type: FilterType,
    /// Only sync from references in LOCKED or HOLDOVER.
    pub strict_sync: bool,
    /// Accept only external references (PTP, NTP).
    pub external_only: bool,
    /// Accept only internal (registry) references.
    pub internal_only: bool,
    /// kP denominator: kP = 1 / servo_ap.
    pub servo_ap: f64,
    /// kI denominator: kI = 1 / servo_ai.
    pub servo_ai: f64,
    pub servo_max_ppb: f64,
    pub servo_tau_method: TauMethod,
    pub servo_max_tau: f64,
    /// Persist the last good frequency to a file.
    pub store_to_file: bool,
    pub frequency_dir: String,
}

impl Default for ClockConfig {
    fn default() -> Self {
        ClockConfig {
            disabled: false,
            excluded: false,
            no_adjust: false,
            step_type: StepType::Always,
            negative_step: false,
            no_step: false,
            step_timeout: 0,
            step_exit_threshold_ns: 0,
            min_step_ns: 0,
            offset_correction_ns: 0,
            calibration_time: 0,
            failure_delay: 10,
            locked_age: 10,
            holdover_age: 300,
            adev_period: 10,
            stable_adev: 100.0,
            unstable_adev: 2000.0,
            outlier_filter: true,
            stat_filter: false,
            mad_max: 5.0,
            mad_window_size: 10,
            mad_delay: 3,
            outlier_filter_block_timeout: 20,
            filter_window_size: 4,
            filter_window_type: WindowType::Sliding,
            filter_type: FilterType::Median,
            strict_sync: true,
            external_only: false,
            internal_only: false,
            servo_ap: 2.0,
            servo_ai: 10.0,
            servo_max_ppb: 500_000.0,
            servo_tau_method: TauMethod::Constant,
            servo_max_tau: 30.0,
            store_to_file: false,
            frequency_dir: "/var/lib/ptpsyncd".to_string(),
        }
    }
}

impl ClockConfig {
    pub fn servo_kp(&self) -> f64 {
        1.0 / self.servo_ap.max(1e-6)
    }

    pub fn servo_ki(&self) -> f64 {
        1.0 / self.servo_ai.max(1e-6)
    }
}

/// NTP failover and timing domain arbitration settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FailoverConfig {
    /// Run the embedded NTP engine at all.
    pub enable_engine: bool,
    /// Allow the NTP service to discipline the clock.
    pub enable_control: bool,
    /// Arbitrate between PTP and NTP; when off, PTP always owns the
    /// clock.
    pub enable_failover: bool,
    /// Seconds of PTP inactivity before the domain fails over.
    pub failover_timeout: u32,
    /// NTP probe interval in seconds.
    pub check_interval: u32,
    /// Hold time after a service loses control.
    pub hold_time: u32,
    /// Election hold applied between releases and acquisitions.
    pub election_delay: u32,
    pub ptp_priority1: u8,
    pub ptp_priority2: u8,
    pub ntp_priority1: u8,
    pub ntp_priority2: u8,
}

impl Default for FailoverConfig {
    fn default() -> Self {
        FailoverConfig {
            enable_engine: false,
            enable_control: false,
            enable_failover: false,
            failover_timeout: 120,
            check_interval: 15,
            hold_time: 30,
            election_delay: 5,
            ptp_priority1: 0,
            ptp_priority2: 0,
            ntp_priority1: 1,
            ntp_priority2: 0,
        }
    }
}

impl Config {
    pub fn load(path: &str) -> Config {
        if let Ok(content) = std::fs::read_to_string(path) {
            match serde_json::from_str::<Config>(&content) {
                Ok(cfg) => return cfg,
                Err(e) => log::warn!("config: cannot parse {}: {}", path, e),
            }
        }
        Config::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_json_uses_defaults() {
        let cfg: Config = serde_json::from_str(r#"{"ntp_server": "10.0.0.1"}"#).unwrap();
        assert_eq!(cfg.ntp_server, "10.0.0.1");
        assert_eq!(cfg.ptp.priority1, 128);
        assert_eq!(cfg.ptp.announce_receipt_timeout, 3);
        assert_eq!(cfg.clock.holdover_age, 300);
    }

    #[test]
    fn test_nested_overrides() {
        let cfg: Config = serde_json::from_str(
            r#"{"ptp": {"slave_only": true, "domain_number": 4},
                "clock": {"step_type": "startup_force"}}"#,
        )
        .unwrap();
        assert!(cfg.ptp.slave_only);
        assert_eq!(cfg.ptp.domain_number, 4);
        assert_eq!(cfg.clock.step_type, StepType::StartupForce);
    }

    #[test]
    fn test_validation() {
        let mut ptp = PtpConfig::default();
        assert!(ptp.validate().is_ok());

        ptp.domain_number = 128;
        assert!(ptp.validate().is_err());
        ptp.domain_number = 0;

        ptp.announce_receipt_timeout = 1;
        assert!(ptp.validate().is_err());
        ptp.announce_receipt_timeout = 3;

        ptp.slave_only = true;
        ptp.clock_class = 6;
        assert!(ptp.validate().is_err());
    }

    #[test]
    fn test_servo_gains_from_denominators() {
        let clock = ClockConfig {
            servo_ap: 4.0,
            servo_ai: 20.0,
            ..ClockConfig::default()
        };
        assert!((clock.servo_kp() - 0.25).abs() < 1e-12);
        assert!((clock.servo_ki() - 0.05).abs() < 1e-12);
    }

    #[test]
    fn test_config_roundtrip() {
        let cfg = Config::default();
        let json = serde_json::to_string(&cfg).unwrap();
        let back: Config = serde_json::from_str(&json).unwrap();
        assert_eq!(back.ntp_server, cfg.ntp_server);
        assert_eq!(back.ptp.max_foreign_records, cfg.ptp.max_foreign_records);
    }
}
