//! System clock driver for Linux, built on adjtimex and clock_settime.

use anyhow::{anyhow, Result};
use libc::{adjtimex, timex, ADJ_FREQUENCY, ADJ_STATUS, CLOCK_MONOTONIC, CLOCK_REALTIME};
use std::mem;

use super::hardware::{ClockHardware, LeapAction};
use crate::time::Timestamp;

pub struct LinuxClock {
    original_freq: i64,
}

fn read_clock(clock_id: libc::clockid_t) -> Result<Timestamp> {
    let mut ts: libc::timespec = unsafe { mem::zeroed() };
    let ret = unsafe { libc::clock_gettime(clock_id, &mut ts) };
    if ret < 0 {
        return Err(anyhow!(
            "clock_gettime failed: {}",
            std::io::Error::last_os_error()
        ));
    }
    Ok(Timestamp::new(ts.tv_sec as i64, ts.tv_nsec as i32))
}

impl LinuxClock {
    pub fn new() -> Result<Self> {
        let mut tx: timex = unsafe { mem::zeroed() };
        tx.modes = 0;

        let ret = unsafe { adjtimex(&mut tx) };
        if ret < 0 {
            return Err(anyhow!("adjtimex failed (are you root?)"));
        }

        Ok(LinuxClock {
            original_freq: tx.freq as i64,
        })
    }

    fn adjtimex_status(&self, set: libc::c_int, clear: libc::c_int) -> Result<()> {
        let mut tx: timex = unsafe { mem::zeroed() };
        tx.modes = 0;
        if unsafe { adjtimex(&mut tx) } < 0 {
            return Err(anyhow!("adjtimex status query failed"));
        }

        tx.modes = ADJ_STATUS as _;
        tx.status |= set;
        tx.status &= !clear;
        if unsafe { adjtimex(&mut tx) } < 0 {
            return Err(anyhow!("adjtimex status update failed"));
        }
        Ok(())
    }
}

impl ClockHardware for LinuxClock {
    fn get_time(&self) -> Result<Timestamp> {
        read_clock(CLOCK_REALTIME)
    }

    fn get_time_monotonic(&self) -> Result<Timestamp> {
        read_clock(CLOCK_MONOTONIC)
    }

    fn set_time(&mut self, time: &Timestamp) -> Result<()> {
        let ts = libc::timespec {
            tv_sec: time.seconds as _,
            tv_nsec: time.nanoseconds as _,
        };
        let ret = unsafe { libc::clock_settime(CLOCK_REALTIME, &ts) };
        if ret < 0 {
            return Err(anyhow!(
                "clock_settime failed: {}",
                std::io::Error::last_os_error()
            ));
        }
        Ok(())
    }

    fn set_offset(&mut self, delta: &Timestamp) -> Result<()> {
        let now = self.get_time()?;
        let target = now.add(delta);
        self.set_time(&target)
    }

    fn set_frequency(&mut self, ppb: f64) -> Result<()> {
        // the kernel takes frequency in 2^-16 ppm units
        let ppm = ppb / 1000.0;
        let freq_val = (ppm * 65536.0) as i64;

        let mut tx: timex = unsafe { mem::zeroed() };
        tx.modes = ADJ_FREQUENCY as _;
        tx.freq = freq_val as _;

        let ret = unsafe { adjtimex(&mut tx) };
        if ret < 0 {
            return Err(anyhow!("adjtimex failed to set frequency"));
        }
        Ok(())
    }

    fn get_frequency(&self) -> f64 {
        let mut tx: timex = unsafe { mem::zeroed() };
        tx.modes = 0;
        if unsafe { adjtimex(&mut tx) } < 0 {
            return 0.0;
        }
        (tx.freq as f64 / 65536.0) * 1000.0
    }

    fn set_leap(&mut self, action: LeapAction) -> Result<()> {
        match action {
            LeapAction::Insert => self.adjtimex_status(libc::STA_INS, libc::STA_DEL),
            LeapAction::Delete => self.adjtimex_status(libc::STA_DEL, libc::STA_INS),
            LeapAction::None => self.adjtimex_status(0, libc::STA_INS | libc::STA_DEL),
        }
    }

    fn health_check(&mut self) -> bool {
        let mut tx: timex = unsafe { mem::zeroed() };
        tx.modes = 0;
        unsafe { adjtimex(&mut tx) >= 0 }
    }
}

impl Drop for LinuxClock {
    fn drop(&mut self) {
        let mut tx: timex = unsafe { mem::zeroed() };
        tx.modes = ADJ_FREQUENCY as _;
        tx.freq = self.original_freq as _;
        unsafe { adjtimex(&mut tx) };
    }
}
