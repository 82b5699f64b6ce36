use log::warn;
use std::collections::BTreeMap;
use std::io::{self, Write};
use std::sync::{Arc, Mutex};

use crate::dbi::{read_cstring, AccessKind, TargetMemory, Tid};
use crate::language::Language;
use crate::logger::{LogSubject, Logger};
use crate::registry::{ObjectRecord, Registry};

/// Longest object name the beacon hook will read from target memory.
const NAME_MAX: usize = 255;

/// Reads and writes attributed to an object, split by language. `Shared`
/// accesses are dropped before they reach these counters.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct AccessCounts {
    pub reads: [u64; 2],
    pub writes: [u64; 2],
}

struct ObjectState {
    registry: Registry,
    /// Keyed by object name so counters survive moves and removal; a
    /// freed object still shows up in the final report.
    counts: BTreeMap<String, AccessCounts>,
    next_anonymous: u64,
}

/// The read/write attribution engine plus the named-object lifecycle.
/// One lock covers the registry and the counters.
pub struct ObjectTracker {
    logger: Arc<Logger>,
    state: Mutex<ObjectState>,
}

impl ObjectTracker {
    pub fn new(logger: Arc<Logger>) -> ObjectTracker {
        ObjectTracker {
            logger,
            state: Mutex::new(ObjectState {
                registry: Registry::new(),
                counts: BTreeMap::new(),
                next_anonymous: 0,
            }),
        }
    }

    /// Registers `[addr, addr+size)` under the NUL-terminated name found
    /// at `name_addr`, or under an auto-generated decimal name when
    /// `name_addr` is null or unreadable. Re-registering a name resets
    /// its counters; counts are not merged.
    pub fn register_object(
        &self,
        tid: Tid,
        addr: u64,
        size: u64,
        lang: Language,
        name_addr: u64,
        mem: &dyn TargetMemory,
    ) {
        if size == 0 {
            self.logger.log(
                LogSubject::Objects,
                format_args!("[REGISTER] tid={} ignoring empty object at {:#x}", tid, addr),
            );
            return;
        }

        let name = if name_addr == 0 {
            None
        } else {
            match read_cstring(mem, name_addr, NAME_MAX) {
                Ok(name) => Some(name),
                Err(err) => {
                    warn!("cannot read object name at {:#x}: {}", name_addr, err);
                    None
                }
            }
        };

        let mut state = match self.state.lock() {
            Ok(state) => state,
            Err(_) => return,
        };
        // Every registration consumes a counter slot, named or not; the
        // counter string is only used when no name could be read.
        let counter = state.next_anonymous;
        state.next_anonymous += 1;
        let name = name.unwrap_or_else(|| counter.to_string());
        state.registry.insert(ObjectRecord {
            start: addr,
            size,
            name: name.clone(),
            language: lang,
        });
        state.counts.insert(name.clone(), AccessCounts::default());
        drop(state);

        self.logger.log(
            LogSubject::Objects,
            format_args!(
                "[REGISTER] tid={} object '{}' occupies {} bytes in [{:#x}, {:#x}) for {}",
                tid,
                name,
                size,
                addr,
                addr + size,
                lang
            ),
        );
    }

    /// Relocates a record, preserving name, allocating language and all
    /// accumulated counters. Same address means nothing moved.
    pub fn move_object(&self, tid: Tid, old_addr: u64, new_addr: u64, new_size: u64) {
        if old_addr == new_addr {
            return;
        }
        let mut state = match self.state.lock() {
            Ok(state) => state,
            Err(_) => return,
        };
        let record = match state.registry.remove(old_addr) {
            Some(record) => record,
            None => return,
        };
        state.registry.insert(ObjectRecord {
            start: new_addr,
            size: new_size,
            name: record.name.clone(),
            language: record.language,
        });
        drop(state);

        self.logger.log(
            LogSubject::Objects,
            format_args!(
                "[MOVE] tid={} object '{}' [{:#x}, {:#x}) -> [{:#x}, {:#x})",
                tid,
                record.name,
                record.start,
                record.end(),
                new_addr,
                new_addr + new_size
            ),
        );
    }

    pub fn remove_object(&self, tid: Tid, addr: u64) {
        let mut state = match self.state.lock() {
            Ok(state) => state,
            Err(_) => return,
        };
        let record = match state.registry.remove(addr) {
            Some(record) => record,
            None => return,
        };
        drop(state);

        self.logger.log(
            LogSubject::Objects,
            format_args!(
                "[REMOVE] tid={} object '{}' no longer maps [{:#x}, {:#x})",
                tid,
                record.name,
                record.start,
                record.end()
            ),
        );
    }

    pub fn record_read(&self, tid: Tid, addr: u64, lang: Language) {
        self.record(tid, addr, lang, AccessKind::Read);
    }

    pub fn record_write(&self, tid: Tid, addr: u64, lang: Language) {
        self.record(tid, addr, lang, AccessKind::Write);
    }

    fn record(&self, tid: Tid, addr: u64, lang: Language, kind: AccessKind) {
        // Shared code is nobody's access; unknown addresses are the
        // overwhelmingly common case and not an error.
        let slot = match lang.slot() {
            Some(slot) => slot,
            None => return,
        };
        let mut state = match self.state.lock() {
            Ok(state) => state,
            Err(_) => return,
        };
        let name = match state.registry.find(addr) {
            Some(record) => record.name.clone(),
            None => return,
        };
        let counts = state.counts.entry(name.clone()).or_default();
        match kind {
            AccessKind::Read => counts.reads[slot] += 1,
            AccessKind::Write => counts.writes[slot] += 1,
        }
        drop(state);

        let label = match kind {
            AccessKind::Read => "READ",
            AccessKind::Write => "WRITE",
        };
        self.logger.log(
            LogSubject::Access,
            format_args!("[{}] tid={} {:#x} ('{}') by {}", label, tid, addr, name, lang),
        );
    }

    /// One row per name ever registered, sorted, commas between fields.
    pub fn report(&self, w: &mut dyn Write) -> io::Result<()> {
        writeln!(
            w,
            "Name | Reads (Rust) | Reads (C) | Writes (Rust) | Writes (C)"
        )?;
        let state = match self.state.lock() {
            Ok(state) => state,
            Err(_) => return Ok(()),
        };
        for (name, counts) in &state.counts {
            writeln!(
                w,
                "{}, {}, {}, {}, {}",
                name, counts.reads[0], counts.reads[1], counts.writes[0], counts.writes[1]
            )?;
        }
        Ok(())
    }

    pub fn counts(&self, name: &str) -> Option<AccessCounts> {
        match self.state.lock() {
            Ok(state) => state.counts.get(name).cloned(),
            Err(_) => None,
        }
    }

    pub fn find(&self, addr: u64) -> Option<ObjectRecord> {
        match self.state.lock() {
            Ok(state) => state.registry.find(addr).cloned(),
            Err(_) => None,
        }
    }

    pub fn live_records(&self) -> Vec<ObjectRecord> {
        match self.state.lock() {
            Ok(state) => state.registry.records().cloned().collect(),
            Err(_) => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{AccessCounts, ObjectTracker};
    use crate::language::Language;
    use crate::logger::Logger;
    use crate::replay::ReplayMemory;
    use std::sync::Arc;

    fn tracker() -> ObjectTracker {
        ObjectTracker::new(Arc::new(Logger::disabled()))
    }

    #[test]
    fn named_registration_reads_target_memory() {
        let tracker = tracker();
        let mut mem = ReplayMemory::new();
        mem.insert(0x7000, b"table\0".to_vec());

        tracker.register_object(0, 0x2000, 0x100, Language::Rust, 0x7000, &mem);
        tracker.record_write(0, 0x2080, Language::C);

        let counts = tracker.counts("table").expect("counts for 'table'");
        assert_eq!(counts.writes, [0, 1]);
        assert_eq!(counts.reads, [0, 0]);
    }

    #[test]
    fn unreadable_name_falls_back_to_counter() {
        let tracker = tracker();
        let mem = ReplayMemory::new();

        tracker.register_object(0, 0x1000, 64, Language::Rust, 0xbad, &mem);
        tracker.register_object(0, 0x2000, 64, Language::C, 0, &mem);

        assert!(tracker.counts("0").is_some());
        assert!(tracker.counts("1").is_some());
        assert_eq!(tracker.find(0x1000).map(|r| r.name), Some("0".to_string()));
        assert_eq!(tracker.find(0x2000).map(|r| r.name), Some("1".to_string()));
    }

    #[test]
    fn named_registrations_consume_counter_slots() {
        let tracker = tracker();
        let mut mem = ReplayMemory::new();
        mem.insert(0x7000, b"table\0".to_vec());

        tracker.register_object(0, 0x2000, 0x100, Language::Rust, 0x7000, &mem);
        tracker.register_object(0, 0x3000, 64, Language::Rust, 0, &mem);

        // "table" took slot 0, so the anonymous object is "1".
        assert!(tracker.counts("0").is_none());
        assert_eq!(tracker.find(0x3000).map(|r| r.name), Some("1".to_string()));
    }

    #[test]
    fn zero_sized_registrations_are_ignored() {
        let tracker = tracker();
        tracker.register_object(0, 0x1000, 0, Language::Rust, 0, &ReplayMemory::new());
        assert!(tracker.live_records().is_empty());
    }

    #[test]
    fn shared_accesses_are_dropped() {
        let tracker = tracker();
        tracker.register_object(0, 0x1000, 64, Language::Rust, 0, &ReplayMemory::new());
        tracker.record_read(0, 0x1000, Language::Shared);
        tracker.record_write(0, 0x1000, Language::Shared);
        assert_eq!(tracker.counts("0"), Some(AccessCounts::default()));
    }

    #[test]
    fn move_preserves_identity_and_counters() {
        let tracker = tracker();
        let mut mem = ReplayMemory::new();
        mem.insert(0x7000, b"buf\0".to_vec());
        tracker.register_object(0, 0x3000, 32, Language::Rust, 0x7000, &mem);
        tracker.record_read(0, 0x3010, Language::Rust);

        tracker.move_object(0, 0x3000, 0x4000, 128);
        tracker.record_write(0, 0x4040, Language::C);

        let record = tracker.find(0x4040).expect("moved record");
        assert_eq!(record.name, "buf");
        assert_eq!(record.start, 0x4000);
        assert_eq!(record.size, 128);
        assert_eq!(record.language, Language::Rust);
        assert!(tracker.find(0x3010).is_none());

        let counts = tracker.counts("buf").expect("counts for 'buf'");
        assert_eq!(counts.reads, [1, 0]);
        assert_eq!(counts.writes, [0, 1]);
    }

    #[test]
    fn move_to_same_address_is_a_noop() {
        let tracker = tracker();
        tracker.register_object(0, 0x3000, 32, Language::Rust, 0, &ReplayMemory::new());
        tracker.move_object(0, 0x3000, 0x3000, 128);

        let record = tracker.find(0x3000).expect("record");
        assert_eq!(record.size, 32);
    }

    #[test]
    fn removal_keeps_counters_for_the_report() {
        let tracker = tracker();
        tracker.register_object(0, 0x1000, 64, Language::C, 0, &ReplayMemory::new());
        tracker.record_read(0, 0x1008, Language::C);
        tracker.remove_object(0, 0x1000);

        assert!(tracker.find(0x1008).is_none());
        let counts = tracker.counts("0").expect("counts survive removal");
        assert_eq!(counts.reads, [0, 1]);
    }

    #[test]
    fn live_ranges_stay_disjoint() {
        let tracker = tracker();
        let mem = ReplayMemory::new();
        tracker.register_object(0, 0x1000, 0x100, Language::Rust, 0, &mem);
        tracker.register_object(0, 0x2000, 0x100, Language::C, 0, &mem);
        tracker.move_object(0, 0x2000, 0x3000, 0x80);

        let records = tracker.live_records();
        for a in &records {
            for b in &records {
                if a.start != b.start {
                    assert!(a.end() <= b.start || b.end() <= a.start);
                }
            }
        }
    }

    #[test]
    fn report_rows_are_sorted_by_name() {
        let tracker = tracker();
        let mut mem = ReplayMemory::new();
        mem.insert(0x7000, b"zeta\0".to_vec());
        mem.insert(0x7100, b"alpha\0".to_vec());
        tracker.register_object(0, 0x1000, 16, Language::Rust, 0x7000, &mem);
        tracker.register_object(0, 0x2000, 16, Language::Rust, 0x7100, &mem);
        tracker.record_read(0, 0x1004, Language::Rust);

        let mut out = Vec::new();
        tracker.report(&mut out).expect("report");
        let text = String::from_utf8(out).expect("utf-8");
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(
            lines,
            vec![
                "Name | Reads (Rust) | Reads (C) | Writes (Rust) | Writes (C)",
                "alpha, 0, 0, 0, 0",
                "zeta, 1, 0, 0, 0",
            ]
        );
    }
}
