//! Auxiliary NTP time source.
//!
//! Used by the timing domain as a failover peer for PTP. The service
//! probes an SNTP server for reachability and, when it holds clock
//! control, disciplines the system clock from the measured offset
//! through an external reference. The ntpd control protocol is not
//! spoken here; the probe/acquire/release contract is carried by the
//! embedded client instead.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use anyhow::Result;
use log::{debug, info, warn};
use rsntp::SntpClient;

use crate::clock::registry::ClockRegistry;
use crate::clock::{ClockId, RefClass};
use crate::config::FailoverConfig;
use crate::domain::{BackendReport, ReleaseReason, ServiceBackend};
use crate::time::Timestamp;

/// External reference name under which NTP disciplines its clock.
pub const NTP_REF_NAME: &str = "NTP0";

pub struct NtpClient {
    server: String,
}

impl NtpClient {
    pub fn new(server: &str) -> Self {
        NtpClient {
            server: server.to_string(),
        }
    }

    /// Fetch the offset to apply to the local clock (local + offset =
    /// server time). A positive sign means the local clock is behind.
    pub fn get_offset(&self) -> Result<(Duration, i8)> {
        let client = SntpClient::new();
        let result = client.synchronize(&self.server)?;

        let offset_secs = result.clock_offset().as_secs_f64();
        let sign = if offset_secs < 0.0 { -1 } else { 1 };
        let abs = offset_secs.abs();
        let secs = abs.trunc() as u64;
        let nanos = (abs.fract() * 1e9) as u32;

        Ok((Duration::new(secs, nanos), sign))
    }
}

/// Probe outcome, reduced to what the arbitrator needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProbeResult {
    Yes,
    No,
    #[default]
    Timeout,
}

/// State shared between the NTP runner and its service backend.
#[derive(Debug, Default)]
pub struct NtpShared {
    pub operational: bool,
    pub reachable: bool,
    pub granted: bool,
    pub activity: bool,
    pub control_enabled: bool,
    pub last_probe: ProbeResult,
    /// Warn-once latch for failed acquire/release requests.
    pub request_failed: bool,
    pub last_offset: Timestamp,
}

pub struct NtpService {
    client: NtpClient,
    config: FailoverConfig,
    shared: Arc<RwLock<NtpShared>>,
    check_timer: f64,
    /// Handle of the clock this service disciplines when in control.
    clock: ClockId,
}

impl NtpService {
    pub fn new(server: &str, config: FailoverConfig, clock: ClockId) -> Self {
        let shared = Arc::new(RwLock::new(NtpShared {
            control_enabled: config.enable_control,
            ..NtpShared::default()
        }));
        let check_timer = config.check_interval.max(1) as f64;
        NtpService {
            client: NtpClient::new(server),
            config,
            shared,
            check_timer,
            clock,
        }
    }

    pub fn shared(&self) -> Arc<RwLock<NtpShared>> {
        self.shared.clone()
    }

    pub fn init(&mut self) -> bool {
        if !self.config.enable_engine {
            info!("ntp: engine not enabled");
            return false;
        }
        if let Ok(mut shared) = self.shared.write() {
            shared.operational = true;
        }
        info!("ntp: service started, server {}", self.client.server);
        true
    }

    pub fn shutdown(&mut self, registry: &mut ClockRegistry) {
        let granted = self
            .shared
            .read()
            .map(|shared| shared.granted)
            .unwrap_or(false);
        if granted {
            registry.set_reference(self.clock, None);
        }
        if let Ok(mut shared) = self.shared.write() {
            shared.operational = false;
            shared.reachable = false;
            shared.granted = false;
        }
    }

    /// Reachability probe plus, when in control, one discipline round.
    pub fn tick(&mut self, dt: f64, registry: &mut ClockRegistry) {
        if !self.config.enable_engine {
            return;
        }

        self.check_timer -= dt;
        if self.check_timer > 0.0 {
            return;
        }
        self.check_timer = self.config.check_interval.max(1) as f64;

        let (probe, result) = match self.client.get_offset() {
            Ok((offset, sign)) => {
                let correction = {
                    let ts = Timestamp::from_duration(offset);
                    if sign < 0 {
                        ts.neg()
                    } else {
                        ts
                    }
                };
                debug!("ntp: probe ok, offset {}", correction);
                if let Ok(mut shared) = self.shared.write() {
                    shared.activity = true;
                    shared.last_offset = correction;
                }
                (Some(correction), ProbeResult::Yes)
            }
            Err(e) => {
                let result = if e.to_string().contains("timed out") {
                    ProbeResult::Timeout
                } else {
                    ProbeResult::No
                };
                debug!("ntp: probe failed: {}", e);
                (None, result)
            }
        };

        let granted = match self.shared.write() {
            Ok(mut shared) => {
                shared.reachable = result == ProbeResult::Yes;
                shared.last_probe = result;
                shared.granted
            }
            Err(_) => return,
        };

        if let Some(correction) = probe {
            if granted && self.config.enable_control {
                registry.set_external_reference(self.clock, NTP_REF_NAME, RefClass::External);
                let tau = self.config.check_interval.max(1) as f64;
                registry.sync_external(self.clock, correction, tau);
            }
        }
    }
}

/// The arbitrator-facing half of the NTP service.
pub struct NtpServiceBackend {
    shared: Arc<RwLock<NtpShared>>,
}

impl NtpServiceBackend {
    pub fn new(shared: Arc<RwLock<NtpShared>>) -> Self {
        NtpServiceBackend { shared }
    }
}

impl ServiceBackend for NtpServiceBackend {
    fn poll(&mut self) -> BackendReport {
        let mut shared = match self.shared.write() {
            Ok(shared) => shared,
            Err(_) => return BackendReport::default(),
        };
        let activity = shared.activity;
        shared.activity = false;
        BackendReport {
            operational: shared.operational,
            available: shared.operational && shared.reachable,
            in_control: shared.granted,
            activity,
        }
    }

    fn acquire(&mut self) -> bool {
        let mut shared = match self.shared.write() {
            Ok(shared) => shared,
            Err(_) => return false,
        };
        if !shared.control_enabled {
            if !shared.request_failed {
                warn!("ntp: control disabled, cannot acquire clock control");
            }
            shared.request_failed = true;
            return false;
        }
        shared.granted = true;
        shared.request_failed = false;
        true
    }

    fn release(&mut self, _reason: ReleaseReason) -> bool {
        let mut shared = match self.shared.write() {
            Ok(shared) => shared,
            Err(_) => return false,
        };
        if !shared.control_enabled {
            if !shared.request_failed {
                warn!("ntp: control disabled, cannot release clock control");
            }
            shared.request_failed = true;
            return true;
        }
        shared.granted = false;
        shared.request_failed = false;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offset_sign_conversion() {
        // positive offset: local behind, correction is positive
        let ts = Timestamp::from_duration(Duration::new(1, 500_000_000));
        assert_eq!(ts, Timestamp::new(1, 500_000_000));
        assert_eq!(ts.neg(), Timestamp::new(-1, -500_000_000));
    }

    #[test]
    fn test_backend_reports_shared_state() {
        let shared = Arc::new(RwLock::new(NtpShared {
            operational: true,
            reachable: true,
            activity: true,
            control_enabled: true,
            ..NtpShared::default()
        }));
        let mut backend = NtpServiceBackend::new(shared.clone());

        let report = backend.poll();
        assert!(report.operational);
        assert!(report.available);
        assert!(report.activity);

        // activity heartbeat is consumed by the poll
        let report = backend.poll();
        assert!(!report.activity);

        shared.write().unwrap().reachable = false;
        let report = backend.poll();
        assert!(!report.available);
    }

    #[test]
    fn test_acquire_respects_control_flag() {
        let shared = Arc::new(RwLock::new(NtpShared {
            operational: true,
            control_enabled: false,
            ..NtpShared::default()
        }));
        let mut backend = NtpServiceBackend::new(shared.clone());
        assert!(!backend.acquire());
        assert!(!shared.read().unwrap().granted);

        shared.write().unwrap().control_enabled = true;
        assert!(backend.acquire());
        assert!(shared.read().unwrap().granted);

        assert!(backend.release(ReleaseReason::Election));
        assert!(!shared.read().unwrap().granted);
    }

    #[test]
    fn test_service_init_disabled_engine() {
        let mut service = NtpService::new(
            "127.0.0.1",
            FailoverConfig::default(),
            crate::clock::ClockId(0),
        );
        assert!(!service.init());
        assert!(!service.shared().read().unwrap().operational);
    }

    #[test]
    fn test_service_init_enabled_engine() {
        let config = FailoverConfig {
            enable_engine: true,
            ..FailoverConfig::default()
        };
        let mut service = NtpService::new("127.0.0.1", config, crate::clock::ClockId(0));
        assert!(service.init());
        assert!(service.shared().read().unwrap().operational);
    }
}
