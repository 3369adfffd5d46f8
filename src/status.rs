//! Daemon status snapshot.
//!
//! Updated by the engine once per scheduler pass and shared for
//! reporting (periodic stats lines, systemd status strings).

use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct SyncStatus {
    /// Current PTP port state name.
    pub port_state: String,

    /// Last measured offset from master (nanoseconds).
    pub offset_from_master_ns: i64,

    /// Last measured mean path delay (nanoseconds).
    pub mean_path_delay_ns: i64,

    /// Grandmaster identity as displayed (empty until one is selected).
    pub grandmaster: String,

    /// Current frequency adjustment on the controlled clock (ppb).
    pub frequency_ppb: f64,

    /// Running Allan deviation of the controlled clock.
    pub adev: f64,

    /// State name of the controlled clock driver.
    pub clock_state: String,

    /// Name of the best clock in the registry.
    pub best_clock: String,

    /// Id of the timing service currently in control, if any.
    pub controlling_service: String,

    /// Unix timestamp of the last update.
    pub updated_ts: u64,
}

impl Default for SyncStatus {
    fn default() -> Self {
        SyncStatus {
            port_state: "INITIALIZING".to_string(),
            offset_from_master_ns: 0,
            mean_path_delay_ns: 0,
            grandmaster: String::new(),
            frequency_ppb: 0.0,
            adev: 0.0,
            clock_state: "INIT".to_string(),
            best_clock: String::new(),
            controlling_service: String::new(),
            updated_ts: 0,
        }
    }
}
