//! IEEE 1588-2008 datasets and the identity types they are built from.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::config::PtpConfig;
use crate::time::Timestamp;

pub const SLAVE_ONLY_CLOCK_CLASS: u8 = 255;
pub const DEFAULT_CLOCK_CLASS: u8 = 187;
pub const DEFAULT_CLOCK_ACCURACY: u8 = 0xFE;
pub const DEFAULT_CLOCK_VARIANCE: u16 = 0xFFFF;

/// 8-octet clock identity, globally stable for the life of the process.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ClockIdentity(pub [u8; 8]);

impl ClockIdentity {
    /// EUI-64 derivation: MAC with 0xFF 0xFE inserted between octets 3
    /// and 4 (1588 7.5.2.2.2).
    pub fn from_mac(mac: [u8; 6]) -> Self {
        ClockIdentity([
            mac[0], mac[1], mac[2], 0xFF, 0xFE, mac[3], mac[4], mac[5],
        ])
    }

    /// Fallback derivation from a protocol address and the process id,
    /// for hosts where no MAC is available.
    pub fn from_addr(addr: &[u8], pid: u32) -> Self {
        let mut id = [0u8; 8];
        for (i, b) in addr.iter().enumerate().take(4) {
            id[i] = *b;
        }
        id[3] = 0xFF;
        id[4] = 0xFE;
        id[5] = (pid >> 16) as u8;
        id[6] = (pid >> 8) as u8;
        id[7] = pid as u8;
        ClockIdentity(id)
    }
}

impl fmt::Display for ClockIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = self.0;
        write!(
            f,
            "{:02x}{:02x}{:02x}.{:02x}{:02x}.{:02x}{:02x}{:02x}",
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]
        )
    }
}

/// (clock identity, port number). Ports are numbered from 1.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PortIdentity {
    pub clock_identity: ClockIdentity,
    pub port_number: u16,
}

impl fmt::Display for PortIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.clock_identity, self.port_number)
    }
}

/// Lower class and accuracy are better; variance is a BMC tie-break.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClockQuality {
    pub clock_class: u8,
    pub clock_accuracy: u8,
    pub offset_scaled_log_variance: u16,
}

impl Default for ClockQuality {
    fn default() -> Self {
        ClockQuality {
            clock_class: DEFAULT_CLOCK_CLASS,
            clock_accuracy: DEFAULT_CLOCK_ACCURACY,
            offset_scaled_log_variance: DEFAULT_CLOCK_VARIANCE,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DelayMechanism {
    E2E,
    P2P,
}

#[derive(Debug, Clone)]
pub struct DefaultDS {
    pub two_step: bool,
    pub clock_identity: ClockIdentity,
    pub number_ports: u16,
    pub clock_quality: ClockQuality,
    pub priority1: u8,
    pub priority2: u8,
    pub domain_number: u8,
    pub slave_only: bool,
}

impl DefaultDS {
    pub fn new(clock_identity: ClockIdentity, config: &PtpConfig) -> Self {
        let mut quality = ClockQuality {
            clock_class: config.clock_class,
            clock_accuracy: config.clock_accuracy,
            offset_scaled_log_variance: config.clock_variance,
        };
        // a slave-only clock must advertise class 255
        if config.slave_only {
            quality.clock_class = SLAVE_ONLY_CLOCK_CLASS;
        }
        DefaultDS {
            two_step: config.two_step,
            clock_identity,
            number_ports: 1,
            clock_quality: quality,
            priority1: config.priority1,
            priority2: config.priority2,
            domain_number: config.domain_number,
            slave_only: config.slave_only,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CurrentDS {
    pub steps_removed: u16,
    pub offset_from_master: Timestamp,
    pub mean_path_delay: Timestamp,
}

#[derive(Debug, Clone)]
pub struct ParentDS {
    pub parent_port_identity: PortIdentity,
    pub grandmaster_identity: ClockIdentity,
    pub grandmaster_clock_quality: ClockQuality,
    pub grandmaster_priority1: u8,
    pub grandmaster_priority2: u8,
}

impl ParentDS {
    /// Parent values when the local clock is its own grandmaster.
    pub fn from_local(defaults: &DefaultDS) -> Self {
        ParentDS {
            parent_port_identity: PortIdentity {
                clock_identity: defaults.clock_identity,
                port_number: 0,
            },
            grandmaster_identity: defaults.clock_identity,
            grandmaster_clock_quality: defaults.clock_quality,
            grandmaster_priority1: defaults.priority1,
            grandmaster_priority2: defaults.priority2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TimeSource {
    AtomicClock,
    Gps,
    TerrestrialRadio,
    Ptp,
    Ntp,
    HandSet,
    Other,
    #[default]
    InternalOscillator,
}

impl TimeSource {
    pub fn to_wire(self) -> u8 {
        match self {
            TimeSource::AtomicClock => 0x10,
            TimeSource::Gps => 0x20,
            TimeSource::TerrestrialRadio => 0x30,
            TimeSource::Ptp => 0x40,
            TimeSource::Ntp => 0x50,
            TimeSource::HandSet => 0x60,
            TimeSource::Other => 0x90,
            TimeSource::InternalOscillator => 0xA0,
        }
    }

    pub fn from_wire(value: u8) -> Self {
        match value {
            0x10 => TimeSource::AtomicClock,
            0x20 => TimeSource::Gps,
            0x30 => TimeSource::TerrestrialRadio,
            0x40 => TimeSource::Ptp,
            0x50 => TimeSource::Ntp,
            0x60 => TimeSource::HandSet,
            0x90 => TimeSource::Other,
            _ => TimeSource::InternalOscillator,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct TimePropertiesDS {
    pub current_utc_offset: i16,
    pub current_utc_offset_valid: bool,
    pub leap59: bool,
    pub leap61: bool,
    pub time_traceable: bool,
    pub frequency_traceable: bool,
    pub ptp_timescale: bool,
    pub time_source: TimeSource,
}

#[derive(Debug, Clone)]
pub struct PortDS {
    pub port_identity: PortIdentity,
    pub log_announce_interval: i8,
    pub announce_receipt_timeout: u8,
    pub log_sync_interval: i8,
    pub log_min_delay_req_interval: i8,
    pub log_min_pdelay_req_interval: i8,
    pub delay_mechanism: DelayMechanism,
    pub version_number: u8,
}

impl PortDS {
    pub fn new(clock_identity: ClockIdentity, config: &PtpConfig) -> Self {
        PortDS {
            port_identity: PortIdentity {
                clock_identity,
                port_number: 1,
            },
            log_announce_interval: config.log_announce_interval,
            announce_receipt_timeout: config.announce_receipt_timeout,
            log_sync_interval: config.log_sync_interval,
            log_min_delay_req_interval: config.log_min_delay_req_interval,
            log_min_pdelay_req_interval: config.log_min_pdelay_req_interval,
            delay_mechanism: config.delay_mechanism,
            version_number: 2,
        }
    }

    pub fn announce_interval_secs(&self) -> f64 {
        2f64.powi(self.log_announce_interval as i32)
    }

    pub fn sync_interval_secs(&self) -> f64 {
        2f64.powi(self.log_sync_interval as i32)
    }

    pub fn delay_req_interval_secs(&self) -> f64 {
        2f64.powi(self.log_min_delay_req_interval as i32)
    }

    /// Announce receipt timeout window in seconds.
    pub fn announce_timeout_secs(&self) -> f64 {
        self.announce_receipt_timeout as f64 * self.announce_interval_secs()
    }
}
