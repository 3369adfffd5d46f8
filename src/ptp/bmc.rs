//! Best Master Clock selection (1588-2008 9.3).
//!
//! Foreign masters are tracked in a bounded table fed by Announce
//! messages. A record only becomes eligible once at least two Announces
//! from the same source arrived within the announce receipt window.

use std::cmp::Ordering;

use log::debug;

use super::datasets::{DefaultDS, PortIdentity};
use super::messages::{Announce, Header};

pub const DEFAULT_MAX_FOREIGN_RECORDS: usize = 5;

/// Announces required before a foreign master may win the election.
pub const FOREIGN_MASTER_THRESHOLD: u32 = 2;

#[derive(Debug, Clone)]
pub struct ForeignMasterRecord {
    pub source_port_identity: PortIdentity,
    pub header: Header,
    pub announce: Announce,
    /// Announce messages seen from this source.
    pub count: u32,
    /// Engine time (seconds) when the last Announce arrived.
    pub last_seen: f64,
}

impl ForeignMasterRecord {
    pub fn qualified(&self) -> bool {
        self.count >= FOREIGN_MASTER_THRESHOLD
    }
}

/// Data set comparison, 1588-2008 figure 28.
///
/// `Less` means A is the better master. `None` marks the ambiguous
/// outcomes the standard treats as errors (a message compared against
/// itself, or equal steps removed from the same sender).
pub fn compare_datasets(
    header_a: &Header,
    announce_a: &Announce,
    header_b: &Header,
    announce_b: &Announce,
) -> Option<Ordering> {
    if announce_a.grandmaster_identity == announce_b.grandmaster_identity {
        // part 2: same grandmaster, decide by topology
        let sr_a = announce_a.steps_removed;
        let sr_b = announce_b.steps_removed;

        if sr_a > sr_b + 1 {
            return Some(Ordering::Greater);
        }
        if sr_b > sr_a + 1 {
            return Some(Ordering::Less);
        }

        return match sr_a.cmp(&sr_b) {
            Ordering::Greater => Some(Ordering::Greater),
            Ordering::Less => Some(Ordering::Less),
            Ordering::Equal => {
                match header_a
                    .source_port_identity
                    .clock_identity
                    .cmp(&header_b.source_port_identity.clock_identity)
                {
                    Ordering::Equal => {
                        debug!("bmc: sender equals receiver, comparison rejected");
                        None
                    }
                    other => Some(other),
                }
            }
        };
    }

    let key = |a: &Announce| {
        (
            a.grandmaster_priority1,
            a.grandmaster_clock_quality.clock_class,
            a.grandmaster_clock_quality.clock_accuracy,
            a.grandmaster_clock_quality.offset_scaled_log_variance,
            a.grandmaster_priority2,
            a.grandmaster_identity,
        )
    };

    Some(key(announce_a).cmp(&key(announce_b)))
}

/// Build the local data set D0 as an Announce for comparison (9.3.4
/// table 12).
pub fn local_dataset(defaults: &DefaultDS) -> (Header, Announce) {
    let announce = Announce {
        origin_timestamp: crate::time::Timestamp::ZERO,
        current_utc_offset: 0,
        grandmaster_priority1: defaults.priority1,
        grandmaster_clock_quality: defaults.clock_quality,
        grandmaster_priority2: defaults.priority2,
        grandmaster_identity: defaults.clock_identity,
        steps_removed: 0,
        time_source: super::datasets::TimeSource::InternalOscillator,
    };
    let header = Header::new(
        super::messages::MessageType::Announce,
        defaults.domain_number,
        PortIdentity {
            clock_identity: defaults.clock_identity,
            port_number: 0,
        },
        0,
        0,
    );
    (header, announce)
}

/// Recommendation from the state decision algorithm (figure 26).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recommendation {
    Listening,
    /// Local clock wins; become (or stay) master.
    Master,
    /// A better master exists but the local clock is not allowed to be a
    /// slave (class < 128).
    Passive,
    /// Synchronize to the winning foreign record.
    Slave,
    /// Comparison failed; treat as a protocol fault.
    Faulty,
}

pub struct ForeignMasterTable {
    records: Vec<ForeignMasterRecord>,
    capacity: usize,
}

impl ForeignMasterTable {
    pub fn new(capacity: usize) -> Self {
        ForeignMasterTable {
            records: Vec::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn clear(&mut self) {
        self.records.clear();
    }

    pub fn get(&self, index: usize) -> Option<&ForeignMasterRecord> {
        self.records.get(index)
    }

    /// Insert or refresh a record. On overflow the least recently heard
    /// record is evicted.
    pub fn update(&mut self, header: Header, announce: Announce, now: f64) {
        let source = header.source_port_identity;
        if let Some(rec) = self
            .records
            .iter_mut()
            .find(|r| r.source_port_identity == source)
        {
            rec.header = header;
            rec.announce = announce;
            rec.count = rec.count.saturating_add(1);
            rec.last_seen = now;
            return;
        }

        if self.records.len() >= self.capacity {
            if let Some((idx, _)) = self
                .records
                .iter()
                .enumerate()
                .min_by(|(_, a), (_, b)| a.last_seen.total_cmp(&b.last_seen))
            {
                let evicted = self.records.remove(idx);
                debug!(
                    "bmc: foreign master table full, evicted {}",
                    evicted.source_port_identity
                );
            }
        }

        self.records.push(ForeignMasterRecord {
            source_port_identity: source,
            header,
            announce,
            count: 1,
            last_seen: now,
        });
    }

    /// Drop records not heard within the announce receipt window.
    pub fn purge_stale(&mut self, now: f64, window_secs: f64) {
        self.records.retain(|r| now - r.last_seen <= window_secs);
    }

    /// Index of the best qualified record, if any.
    pub fn best(&self) -> Option<usize> {
        let mut best: Option<usize> = None;
        for (i, rec) in self.records.iter().enumerate() {
            if !rec.qualified() {
                continue;
            }
            best = match best {
                None => Some(i),
                Some(b) => {
                    let cur = &self.records[b];
                    match compare_datasets(&rec.header, &rec.announce, &cur.header, &cur.announce)
                    {
                        Some(Ordering::Less) => Some(i),
                        _ => Some(b),
                    }
                }
            };
        }
        best
    }
}

/// State decision algorithm, 1588-2008 figure 26. `best` is the winning
/// foreign record; the caller passes `None` when the table is empty.
pub fn state_decision(
    defaults: &DefaultDS,
    best: Option<&ForeignMasterRecord>,
    listening: bool,
) -> Recommendation {
    if defaults.slave_only {
        return match best {
            Some(_) => Recommendation::Slave,
            None => Recommendation::Listening,
        };
    }

    let best = match best {
        Some(rec) => rec,
        None => {
            return if listening {
                Recommendation::Listening
            } else {
                Recommendation::Master
            }
        }
    };

    let (d0_header, d0_announce) = local_dataset(defaults);
    let cmp = compare_datasets(&d0_header, &d0_announce, &best.header, &best.announce);

    if defaults.clock_quality.clock_class < 128 {
        match cmp {
            Some(Ordering::Less) => Recommendation::Master,
            Some(Ordering::Greater) => Recommendation::Passive,
            _ => Recommendation::Faulty,
        }
    } else {
        match cmp {
            Some(Ordering::Less) => Recommendation::Master,
            Some(Ordering::Greater) => Recommendation::Slave,
            _ => Recommendation::Faulty,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PtpConfig;
    use crate::ptp::datasets::{ClockIdentity, ClockQuality, TimeSource};
    use crate::ptp::messages::MessageType;
    use crate::time::Timestamp;

    fn announce(
        gm: [u8; 8],
        priority1: u8,
        class: u8,
        steps_removed: u16,
    ) -> (Header, Announce) {
        let identity = ClockIdentity(gm);
        let announce = Announce {
            origin_timestamp: Timestamp::ZERO,
            current_utc_offset: 37,
            grandmaster_priority1: priority1,
            grandmaster_clock_quality: ClockQuality {
                clock_class: class,
                clock_accuracy: 0xFE,
                offset_scaled_log_variance: 0xFFFF,
            },
            grandmaster_priority2: 128,
            grandmaster_identity: identity,
            steps_removed,
            time_source: TimeSource::Gps,
        };
        let header = Header::new(
            MessageType::Announce,
            0,
            PortIdentity {
                clock_identity: identity,
                port_number: 1,
            },
            0,
            1,
        );
        (header, announce)
    }

    #[test]
    fn test_priority_tie_broken_by_clock_class() {
        let (ha, aa) = announce([1; 8], 128, 6, 0);
        let (hb, ab) = announce([2; 8], 128, 13, 0);
        // class 6 wins regardless of identity ordering
        assert_eq!(compare_datasets(&ha, &aa, &hb, &ab), Some(Ordering::Less));
        assert_eq!(
            compare_datasets(&hb, &ab, &ha, &aa),
            Some(Ordering::Greater)
        );
    }

    #[test]
    fn test_priority1_dominates() {
        let (ha, aa) = announce([9; 8], 10, 248, 0);
        let (hb, ab) = announce([1; 8], 128, 6, 0);
        assert_eq!(compare_datasets(&ha, &aa, &hb, &ab), Some(Ordering::Less));
    }

    #[test]
    fn test_identity_is_final_tiebreak() {
        let (ha, aa) = announce([1; 8], 128, 6, 0);
        let (hb, ab) = announce([2; 8], 128, 6, 0);
        assert_eq!(compare_datasets(&ha, &aa, &hb, &ab), Some(Ordering::Less));
    }

    #[test]
    fn test_same_grandmaster_steps_removed() {
        // more than one step apart: lower wins
        let (mut ha, aa) = announce([7; 8], 128, 6, 4);
        let (mut hb, ab) = announce([7; 8], 128, 6, 1);
        ha.source_port_identity.clock_identity = ClockIdentity([3; 8]);
        hb.source_port_identity.clock_identity = ClockIdentity([4; 8]);
        assert_eq!(
            compare_datasets(&ha, &aa, &hb, &ab),
            Some(Ordering::Greater)
        );

        // within one step: sender identity breaks the tie
        let (mut ha, aa) = announce([7; 8], 128, 6, 2);
        let (mut hb, ab) = announce([7; 8], 128, 6, 2);
        ha.source_port_identity.clock_identity = ClockIdentity([3; 8]);
        hb.source_port_identity.clock_identity = ClockIdentity([4; 8]);
        assert_eq!(compare_datasets(&ha, &aa, &hb, &ab), Some(Ordering::Less));

        // identical senders: ambiguous
        hb.source_port_identity.clock_identity = ClockIdentity([3; 8]);
        assert_eq!(compare_datasets(&ha, &aa, &hb, &ab), None);
    }

    #[test]
    fn test_comparison_antisymmetric() {
        let pairs = [
            announce([1; 8], 100, 6, 0),
            announce([2; 8], 128, 6, 0),
            announce([3; 8], 128, 13, 0),
            announce([4; 8], 128, 13, 3),
        ];
        for (ha, aa) in &pairs {
            for (hb, ab) in &pairs {
                let fwd = compare_datasets(ha, aa, hb, ab);
                let rev = compare_datasets(hb, ab, ha, aa);
                if aa.grandmaster_identity == ab.grandmaster_identity {
                    continue;
                }
                assert_eq!(fwd.map(Ordering::reverse), rev);
            }
        }
    }

    #[test]
    fn test_table_qualification() {
        let mut table = ForeignMasterTable::new(5);
        let (h, a) = announce([1; 8], 128, 6, 0);
        table.update(h, a, 0.0);
        // one announce is not enough
        assert_eq!(table.best(), None);
        table.update(h, a, 1.0);
        assert_eq!(table.best(), Some(0));
    }

    #[test]
    fn test_table_eviction() {
        let mut table = ForeignMasterTable::new(2);
        let (h1, a1) = announce([1; 8], 128, 20, 0);
        let (h2, a2) = announce([2; 8], 128, 20, 0);
        let (h3, a3) = announce([3; 8], 128, 20, 0);
        table.update(h1, a1, 0.0);
        table.update(h2, a2, 1.0);
        table.update(h1, a1, 2.0);
        // table full: inserting a third evicts the least recently heard (source 2)
        table.update(h3, a3, 3.0);
        assert_eq!(table.len(), 2);
        assert!(table
            .records
            .iter()
            .all(|r| r.source_port_identity.clock_identity != ClockIdentity([2; 8])));
    }

    #[test]
    fn test_table_purge_stale() {
        let mut table = ForeignMasterTable::new(5);
        let (h1, a1) = announce([1; 8], 128, 20, 0);
        let (h2, a2) = announce([2; 8], 128, 20, 0);
        table.update(h1, a1, 0.0);
        table.update(h2, a2, 9.0);
        table.purge_stale(10.0, 6.0);
        assert_eq!(table.len(), 1);
        assert_eq!(
            table.get(0).unwrap().source_port_identity.clock_identity,
            ClockIdentity([2; 8])
        );
    }

    #[test]
    fn test_table_best_picks_lowest_class() {
        let mut table = ForeignMasterTable::new(5);
        let (h1, a1) = announce([1; 8], 128, 13, 0);
        let (h2, a2) = announce([2; 8], 128, 6, 0);
        for t in 0..2 {
            table.update(h1, a1, t as f64);
            table.update(h2, a2, t as f64);
        }
        let best = table.best().unwrap();
        assert_eq!(
            table.get(best).unwrap().announce.grandmaster_clock_quality.clock_class,
            6
        );
    }

    #[test]
    fn test_state_decision_slave_only() {
        let mut config = PtpConfig::default();
        config.slave_only = true;
        let defaults = DefaultDS::new(ClockIdentity([9; 8]), &config);

        assert_eq!(
            state_decision(&defaults, None, true),
            Recommendation::Listening
        );

        let (h, a) = announce([1; 8], 128, 6, 0);
        let rec = ForeignMasterRecord {
            source_port_identity: h.source_port_identity,
            header: h,
            announce: a,
            count: 2,
            last_seen: 0.0,
        };
        assert_eq!(
            state_decision(&defaults, Some(&rec), false),
            Recommendation::Slave
        );
    }

    #[test]
    fn test_state_decision_low_class_goes_passive() {
        let mut config = PtpConfig::default();
        config.clock_class = 6;
        config.priority1 = 200;
        let defaults = DefaultDS::new(ClockIdentity([9; 8]), &config);

        let (h, a) = announce([1; 8], 100, 6, 0);
        let rec = ForeignMasterRecord {
            source_port_identity: h.source_port_identity,
            header: h,
            announce: a,
            count: 2,
            last_seen: 0.0,
        };
        // outranked on priority1 while class < 128: passive, not slave
        assert_eq!(
            state_decision(&defaults, Some(&rec), false),
            Recommendation::Passive
        );
    }

    #[test]
    fn test_state_decision_high_class_becomes_slave() {
        let config = PtpConfig::default();
        let defaults = DefaultDS::new(ClockIdentity([9; 8]), &config);
        let (h, a) = announce([1; 8], 100, 6, 0);
        let rec = ForeignMasterRecord {
            source_port_identity: h.source_port_identity,
            header: h,
            announce: a,
            count: 2,
            last_seen: 0.0,
        };
        assert_eq!(
            state_decision(&defaults, Some(&rec), false),
            Recommendation::Slave
        );
    }

    #[test]
    fn test_state_decision_local_wins() {
        let mut config = PtpConfig::default();
        config.priority1 = 1;
        config.clock_class = 6;
        let defaults = DefaultDS::new(ClockIdentity([0; 8]), &config);
        let (h, a) = announce([1; 8], 128, 13, 0);
        let rec = ForeignMasterRecord {
            source_port_identity: h.source_port_identity,
            header: h,
            announce: a,
            count: 2,
            last_seen: 0.0,
        };
        assert_eq!(
            state_decision(&defaults, Some(&rec), false),
            Recommendation::Master
        );
    }
}
