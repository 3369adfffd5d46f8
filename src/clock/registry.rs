//! Clock driver registry: an arena of drivers addressed by handle.
//!
//! The registry owns the reference graph and best-clock election.
//! References are handles, never pointers, and the graph is kept acyclic
//! by walking the chain before a new reference is accepted.

use anyhow::{anyhow, Result};
use log::{debug, error, info};

use super::hardware::{ClockHardware, VirtualClock};
use super::{ClockDriver, ClockEvent, ClockId, ClockState, RefClass, NO_REFERENCE_DISTANCE};
use crate::config::ClockConfig;
use crate::time::Timestamp;

pub const SYSTEM_CLOCK_NAME: &str = "syst";

pub struct ClockRegistry {
    drivers: Vec<ClockDriver>,
    best: Option<ClockId>,
    system: Option<ClockId>,
}

impl Default for ClockRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ClockRegistry {
    pub fn new() -> Self {
        ClockRegistry {
            drivers: Vec::new(),
            best: None,
            system: None,
        }
    }

    /// Register and initialize a driver. The first driver registered as
    /// the system clock becomes the process-wide system clock.
    pub fn add_driver(
        &mut self,
        name: &str,
        hardware: Box<dyn ClockHardware>,
        config: ClockConfig,
        system_clock: bool,
    ) -> ClockId {
        let id = ClockId(self.drivers.len());
        let mut driver = ClockDriver::new(id, name, hardware, config, system_clock);
        driver.init();
        self.drivers.push(driver);
        if system_clock && self.system.is_none() {
            self.system = Some(id);
        }
        id
    }

    /// Create a driver from a specification string: `system[:name]` or
    /// `virtual:name`.
    pub fn create_from_spec(&mut self, spec: &str, config: ClockConfig) -> Result<ClockId> {
        let mut parts = spec.split(':');
        let kind = parts
            .next()
            .ok_or_else(|| anyhow!("empty clock driver spec"))?;
        let name = parts.next();

        match kind {
            "system" => {
                #[cfg(unix)]
                {
                    let hw = super::linux::LinuxClock::new()?;
                    Ok(self.add_driver(
                        name.unwrap_or(SYSTEM_CLOCK_NAME),
                        Box::new(hw),
                        config,
                        true,
                    ))
                }
                #[cfg(not(unix))]
                Err(anyhow!("system clock driver not supported on this platform"))
            }
            "virtual" => {
                let name = name.ok_or_else(|| anyhow!("virtual clock needs a name"))?;
                Ok(self.add_driver(name, Box::new(VirtualClock::new()), config, false))
            }
            other => Err(anyhow!("unknown clock driver type {:?}", other)),
        }
    }

    pub fn len(&self) -> usize {
        self.drivers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.drivers.is_empty()
    }

    pub fn get(&self, id: ClockId) -> &ClockDriver {
        &self.drivers[id.0]
    }

    pub fn get_mut(&mut self, id: ClockId) -> &mut ClockDriver {
        &mut self.drivers[id.0]
    }

    pub fn iter(&self) -> impl Iterator<Item = &ClockDriver> {
        self.drivers.iter()
    }

    pub fn system_clock(&self) -> Option<ClockId> {
        self.system
    }

    pub fn best_clock(&self) -> Option<ClockId> {
        self.best
    }

    pub fn find_by_name(&self, name: &str) -> Option<ClockId> {
        self.drivers.iter().find(|d| d.name == name).map(|d| d.id)
    }

    pub fn shutdown(&mut self) {
        for driver in &mut self.drivers {
            driver.shutdown();
        }
    }

    // ------------------------------------------------------------------
    // reference graph
    // ------------------------------------------------------------------

    /// Hops from `from` to `target` along the reference chain, or None
    /// when `target` is not reachable.
    fn reference_hops(&self, from: ClockId, target: ClockId) -> Option<u32> {
        let mut hops = 0;
        let mut cursor = self.drivers[from.0].ref_clock;
        while let Some(id) = cursor {
            hops += 1;
            if id == target {
                return Some(hops);
            }
            cursor = self.drivers[id.0].ref_clock;
        }
        None
    }

    /// Point clock `a` at reference `b`, or drop its reference when `b`
    /// is None. A reference that would close a cycle is rejected.
    pub fn set_reference(&mut self, a: ClockId, b: Option<ClockId>) {
        if self.drivers[a.0].config.disabled {
            return;
        }

        let b = match b {
            Some(b) => b,
            None => {
                self.drop_reference(a);
                return;
            }
        };

        if a == b {
            error!(
                "clock {}: cannot use itself as a reference",
                self.drivers[a.0].name
            );
            return;
        }

        if self.drivers[a.0].config.external_only {
            debug!(
                "clock {}: only accepts external references",
                self.drivers[a.0].name
            );
            return;
        }

        if let Some(hops) = self.reference_hops(b, a) {
            info!(
                "clock {}: cannot use {} as reference: {} already references {} ({} hops)",
                self.drivers[a.0].name,
                self.drivers[b.0].name,
                self.drivers[b.0].name,
                self.drivers[a.0].name,
                hops
            );
            return;
        }

        if self.drivers[a.0].ref_clock == Some(b) {
            return;
        }

        let ref_name = self.drivers[b.0].name.clone();
        let ref_distance = self.drivers[b.0].distance;

        info!(
            "clock {}: changing reference to {}",
            self.drivers[a.0].name, ref_name
        );

        let driver = &mut self.drivers[a.0];
        driver.last_ref_class = if driver.ref_clock.is_none() {
            RefClass::None
        } else {
            driver.ref_class
        };
        driver.external_reference = false;
        driver.ref_clock = Some(b);
        driver.ref_name = ref_name;
        driver.ref_class = RefClass::Internal;
        driver.distance = ref_distance.saturating_add(1);

        if driver.config.calibration_time > 0 {
            driver.set_state(ClockState::Freqest);
        } else {
            driver.set_state(ClockState::Freerun);
        }
    }

    fn drop_reference(&mut self, a: ClockId) {
        let driver = &mut self.drivers[a.0];

        if driver.ref_clock.is_some() {
            info!("clock {}: lost reference {}", driver.name, driver.ref_name);
        } else if driver.external_reference {
            info!(
                "clock {}: lost external reference {}",
                driver.name, driver.ref_name
            );
        } else {
            return;
        }

        driver.last_ref_class = driver.ref_class;
        driver.ref_clock = None;
        driver.external_reference = false;
        driver.ref_name.clear();
        driver.ref_class = RefClass::None;
        if driver.state == ClockState::Locked {
            driver.set_state(ClockState::Holdover);
        } else {
            driver.distance = NO_REFERENCE_DISTANCE;
        }
    }

    /// Attach an external (non-registry) reference such as a PTP or NTP
    /// source.
    pub fn set_external_reference(&mut self, a: ClockId, name: &str, class: RefClass) {
        let driver = &mut self.drivers[a.0];
        if driver.config.disabled {
            return;
        }
        if driver.config.internal_only {
            debug!("clock {}: only accepts internal references", driver.name);
            return;
        }

        if !driver.external_reference || driver.ref_name != name {
            info!(
                "clock {}: changing to external reference {}",
                driver.name, name
            );
            if driver.config.calibration_time > 0 {
                driver.set_state(ClockState::Freqest);
            } else {
                driver.set_state(ClockState::Freerun);
            }
        }

        driver.last_ref_class = if driver.ref_clock.is_none() {
            RefClass::None
        } else {
            driver.ref_class
        };
        driver.external_reference = true;
        driver.ref_name = name.to_string();
        driver.ref_class = class;
        driver.ref_clock = None;
        driver.distance = 1;
    }

    // ------------------------------------------------------------------
    // offset measurement
    // ------------------------------------------------------------------

    /// Correction for clock `a` against clock `b` (b minus a). The first
    /// clock is read twice around the second to cancel read latency.
    pub fn offset_from(&self, a: ClockId, b: ClockId) -> Result<Timestamp> {
        if a == b {
            return Ok(Timestamp::ZERO);
        }
        let t1 = self.drivers[a.0].get_time()?;
        let t2 = self.drivers[b.0].get_time()?;
        let t3 = self.drivers[a.0].get_time()?;
        let midpoint = t1.add(&t3).half();
        Ok(t2.sub(&midpoint))
    }

    // ------------------------------------------------------------------
    // periodic update and election
    // ------------------------------------------------------------------

    /// One registry tick. Ages every driver, applies the transitions
    /// that depend on another driver's state, then re-runs the best
    /// clock election.
    pub fn update(&mut self, interval: f64) {
        for i in 0..self.drivers.len() {
            let id = ClockId(i);
            if self.drivers[i].config.disabled {
                continue;
            }

            self.drivers[i].age_tick(interval);

            let (state, has_ref, external, ref_clock) = {
                let d = &self.drivers[i];
                (d.state, d.ref_clock.is_some(), d.external_reference, d.ref_clock)
            };

            match state {
                ClockState::Freerun => {
                    if !has_ref && !external {
                        if let Some(best) = self.best {
                            if best != id {
                                self.set_reference(id, Some(best));
                            }
                        }
                    }
                }
                ClockState::Locked => {
                    if !has_ref && !external {
                        self.drivers[i].adev_acc.reset();
                        self.drivers[i].set_state(ClockState::Holdover);
                    } else if let Some(r) = ref_clock {
                        if !self.drivers[r.0].state.selectable() {
                            self.drivers[i].adev_acc.reset();
                            self.drivers[i].set_state(ClockState::Holdover);
                            self.set_reference(id, None);
                        }
                    }
                }
                ClockState::Tracking => {
                    if !has_ref && !external {
                        self.drivers[i].set_state(ClockState::Freerun);
                    }
                }
                ClockState::HwFault => {
                    if has_ref || external {
                        self.set_reference(id, None);
                    }
                }
                _ => {}
            }
        }

        self.find_best_clock();
    }

    fn eligible(&self, id: ClockId) -> bool {
        let d = &self.drivers[id.0];
        !d.config.disabled && !d.config.excluded && d.state != ClockState::HwFault
    }

    /// Pairwise comparison from the election: returns the winner.
    fn better_clock(&self, ai: ClockId, bi: ClockId) -> ClockId {
        let a = &self.drivers[ai.0];
        let b = &self.drivers[bi.0];

        // better state wins, except that a locked clock further from the
        // reference root does not beat a closer holdover clock
        if b.state > a.state && b.state > ClockState::Freerun {
            if a.state == ClockState::Holdover
                && b.state == ClockState::Locked
                && a.distance < b.distance
            {
                return ai;
            }
            return bi;
        }
        if a.state > b.state && a.state > ClockState::Freerun {
            if b.state == ClockState::Holdover
                && a.state == ClockState::Locked
                && b.distance < a.distance
            {
                return bi;
            }
            return ai;
        }

        if a.state == b.state && a.state.selectable() {
            // an external reference beats an internal one
            if a.external_reference && !b.external_reference {
                return ai;
            }
            if b.external_reference && !a.external_reference {
                return bi;
            }
            // both external: better (lower) reference class wins
            if a.external_reference && b.external_reference {
                if a.ref_class < b.ref_class {
                    return ai;
                }
                if b.ref_class < a.ref_class {
                    return bi;
                }
            }

            // referencing the current best beats not doing so
            if let Some(best) = self.best {
                let a_refs_best = a.ref_clock == Some(best);
                let b_refs_best = b.ref_clock == Some(best);
                if a_refs_best && !b_refs_best {
                    return ai;
                }
                if b_refs_best && !a_refs_best {
                    return bi;
                }
            }

            // referencing the system clock is worse
            if let (Some(ra), Some(rb)) = (a.ref_clock, b.ref_clock) {
                let a_sys = self.drivers[ra.0].system_clock;
                let b_sys = self.drivers[rb.0].system_clock;
                if !a_sys && b_sys {
                    return ai;
                }
                if a_sys && !b_sys {
                    return bi;
                }
            }

            // both in holdover: better last reference class wins
            if a.state == ClockState::Holdover {
                if a.last_ref_class < b.last_ref_class {
                    return ai;
                }
                if b.last_ref_class < a.last_ref_class {
                    return bi;
                }
            }

            if a.distance < b.distance {
                return ai;
            }
            if a.distance > b.distance {
                return bi;
            }

            // the system clock loses ties
            if !a.system_clock && b.system_clock {
                return ai;
            }
            if a.system_clock && !b.system_clock {
                return bi;
            }

            if a.adev > 0.0 && b.adev > 0.0 {
                if a.adev < b.adev {
                    return ai;
                }
                if a.adev > b.adev {
                    return bi;
                }
            }

            if a.age_secs > b.age_secs {
                return ai;
            }
            if a.age_secs < b.age_secs {
                return bi;
            }
        }

        ai
    }

    pub fn find_best_clock(&mut self) {
        let candidates: Vec<ClockId> = (0..self.drivers.len())
            .map(ClockId)
            .filter(|id| self.eligible(*id))
            .collect();

        let mut new_best = candidates
            .iter()
            .copied()
            .find(|id| self.drivers[id.0].state == ClockState::Locked)
            .or_else(|| {
                candidates
                    .iter()
                    .copied()
                    .find(|id| self.drivers[id.0].state == ClockState::Holdover)
            });

        if let Some(mut seed) = new_best {
            for id in &candidates {
                if *id != seed {
                    seed = self.better_clock(seed, *id);
                }
            }
            new_best = Some(seed);
        }

        if new_best != self.best {
            match new_best {
                Some(id) => info!("new best clock selected: {}", self.drivers[id.0].name),
                None => info!("no best clock available"),
            }

            if let Some(old) = self.best {
                self.drivers[old.0].best_clock = false;
                // drop stale references to the outgoing best clock
                for i in 0..self.drivers.len() {
                    let d = &self.drivers[i];
                    if d.config.disabled || d.external_reference {
                        continue;
                    }
                    if d.ref_clock == Some(old) && !d.state.selectable() {
                        self.set_reference(ClockId(i), None);
                    }
                }
            }

            self.best = new_best;
            if let Some(id) = self.best {
                self.drivers[id.0].best_clock = true;
            }

            // re-home every internal clock on the new best
            for i in 0..self.drivers.len() {
                let id = ClockId(i);
                if self.drivers[i].config.disabled || self.drivers[i].external_reference {
                    continue;
                }
                if Some(id) != self.best {
                    self.set_reference(id, None);
                }
            }
            for i in 0..self.drivers.len() {
                let id = ClockId(i);
                if self.drivers[i].config.disabled || self.drivers[i].external_reference {
                    continue;
                }
                if Some(id) != self.best {
                    self.set_reference(id, self.best);
                }
            }
        }

        for driver in &mut self.drivers {
            driver.wait_for_election = false;
        }
    }

    // ------------------------------------------------------------------
    // synchronization
    // ------------------------------------------------------------------

    fn sync_one(&mut self, id: ClockId, tau: f64) -> bool {
        let (external, ref_clock, wait, strict) = {
            let d = &self.drivers[id.0];
            (
                d.external_reference,
                d.ref_clock,
                d.wait_for_election,
                d.config.strict_sync,
            )
        };

        if external {
            return false;
        }
        let r = match ref_clock {
            Some(r) => r,
            None => return false,
        };

        if wait || self.drivers[r.0].wait_for_election {
            debug!(
                "clock {}: not syncing until next best clock election",
                self.drivers[id.0].name
            );
            return false;
        }

        if strict && !self.drivers[r.0].state.selectable() {
            debug!(
                "clock {}: not syncing with reference {} in state {}",
                self.drivers[id.0].name,
                self.drivers[r.0].name,
                self.drivers[r.0].state
            );
            return false;
        }

        let offset = match self.offset_from(id, r) {
            Ok(offset) => offset,
            Err(_) => return false,
        };

        self.drivers[id.0].discipline(offset, tau)
    }

    /// Sync all internally-referenced clocks. Locked clocks run first so
    /// that an unlock propagates before dependents sync.
    pub fn sync_clocks(&mut self, tau: f64) {
        for i in 0..self.drivers.len() {
            if self.drivers[i].config.disabled {
                continue;
            }
            if self.drivers[i].state == ClockState::Locked {
                self.sync_one(ClockId(i), tau);
                self.drivers[i].skip_sync = true;
            }
        }
        for i in 0..self.drivers.len() {
            let d = &self.drivers[i];
            if d.config.disabled || d.state == ClockState::HwFault {
                continue;
            }
            if !self.drivers[i].skip_sync {
                self.sync_one(ClockId(i), tau);
            }
            self.drivers[i].skip_sync = false;
        }
    }

    /// Discipline a clock from an external measurement (PTP, NTP).
    pub fn sync_external(&mut self, id: ClockId, offset: Timestamp, tau: f64) -> bool {
        let d = &self.drivers[id.0];
        if d.config.disabled || !d.external_reference {
            return false;
        }
        if d.wait_for_election {
            debug!(
                "clock {}: not syncing until next best clock election",
                d.name
            );
            return false;
        }
        self.drivers[id.0].discipline(offset, tau)
    }

    /// Step every disciplined clock to its last known offset; the best
    /// clock steps last so dependents do not lose their reference.
    pub fn step_clocks(&mut self, force: bool) {
        for i in 0..self.drivers.len() {
            let d = &self.drivers[i];
            if d.config.disabled || d.state == ClockState::HwFault {
                continue;
            }
            if Some(ClockId(i)) != self.best && (d.ref_clock.is_some() || d.external_reference)
            {
                let offset = d.ref_offset;
                self.drivers[i].step_time(&offset, force);
            }
        }
        if let Some(best) = self.best {
            let offset = self.drivers[best.0].ref_offset;
            self.drivers[best.0].step_time(&offset, force);
        }
    }

    pub fn drain_events(&mut self) -> Vec<ClockEvent> {
        let mut events = Vec::new();
        for driver in &mut self.drivers {
            events.append(&mut driver.events);
        }
        events
    }

    pub fn stats_lines(&self) -> Vec<String> {
        self.drivers.iter().map(|d| d.stats_line()).collect()
    }
}
