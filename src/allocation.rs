use log::warn;
use std::collections::HashMap;
use std::io::{self, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::dbi::{read_pointer, TargetMemory, Tid};
use crate::language::Language;
use crate::logger::{LogSubject, Logger};
use crate::object::ObjectTracker;

#[derive(Debug, Clone, Copy)]
struct PendingMalloc {
    seq: u64,
    size: u64,
    language: Language,
}

#[derive(Debug, Clone, Copy)]
struct PendingRealloc {
    seq: u64,
    old_addr: u64,
    new_size: u64,
}

#[derive(Debug, Clone, Copy)]
struct PendingMemalign {
    seq: u64,
    out_addr: u64,
    size: u64,
    language: Language,
}

/// Per-thread monotonic call counters, kept for log correlation only.
#[derive(Debug, Default, Clone, Copy)]
struct CallCounters {
    malloc: u64,
    realloc: u64,
    memalign: u64,
    free: u64,
}

#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct BytesByLanguage {
    pub rust: u64,
    pub c: u64,
    pub shared: u64,
}

impl BytesByLanguage {
    fn add(&mut self, lang: Language, bytes: u64) {
        match lang {
            Language::Rust => self.rust += bytes,
            Language::C => self.c += bytes,
            Language::Shared => self.shared += bytes,
        }
    }

    /// The canonical summary excludes `Shared`.
    pub fn total(&self) -> u64 {
        self.rust + self.c
    }
}

/// Pairs the before/after observations of the libc allocators and keeps
/// the object map and the per-language byte totals consistent with the
/// actual heap layout. The attributed language is the one current at the
/// *before* hook: whichever routine sits on top of the stack at the libc
/// entry wins.
///
/// One lock per allocator kind; none is held across a call into the
/// ObjectTracker, which sits below us in the lock order.
pub struct AllocationTracker {
    logger: Arc<Logger>,
    bytes: Mutex<BytesByLanguage>,
    malloc: Mutex<HashMap<Tid, PendingMalloc>>,
    realloc: Mutex<HashMap<Tid, PendingRealloc>>,
    memalign: Mutex<HashMap<Tid, PendingMemalign>>,
    counters: Mutex<HashMap<Tid, CallCounters>>,
    orphan_logged: AtomicBool,
}

impl AllocationTracker {
    pub fn new(logger: Arc<Logger>) -> AllocationTracker {
        AllocationTracker {
            logger,
            bytes: Mutex::new(BytesByLanguage::default()),
            malloc: Mutex::new(HashMap::new()),
            realloc: Mutex::new(HashMap::new()),
            memalign: Mutex::new(HashMap::new()),
            counters: Mutex::new(HashMap::new()),
            orphan_logged: AtomicBool::new(false),
        }
    }

    pub fn before_malloc(&self, tid: Tid, size: u64, lang: Language) {
        let seq = self.bump(tid, |c| {
            let seq = c.malloc;
            c.malloc += 1;
            seq
        });
        if let Ok(mut pending) = self.malloc.lock() {
            pending.insert(
                tid,
                PendingMalloc {
                    seq,
                    size,
                    language: lang,
                },
            );
        }
        self.logger.log(
            LogSubject::Memory,
            format_args!(
                "[MALLOC #{} tid={}] {} bytes requested by {}",
                seq, tid, size, lang
            ),
        );
    }

    pub fn after_malloc(&self, tid: Tid, ret: u64, objects: &ObjectTracker, mem: &dyn TargetMemory) {
        let pending = match self.malloc.lock() {
            Ok(mut pending) => pending.remove(&tid),
            Err(_) => None,
        };
        let pending = match pending {
            Some(pending) => pending,
            None => return self.orphan(tid, "malloc"),
        };
        if ret == 0 {
            self.logger.log(
                LogSubject::Memory,
                format_args!("[MALLOC #{} tid={}] failed", pending.seq, tid),
            );
            return;
        }
        self.account(pending.language, pending.size);
        objects.register_object(tid, ret, pending.size, pending.language, 0, mem);
        self.logger.log(
            LogSubject::Memory,
            format_args!(
                "[MALLOC #{} tid={}] {} bytes at {:#x} for {}",
                pending.seq, tid, pending.size, ret, pending.language
            ),
        );
    }

    pub fn before_posix_memalign(
        &self,
        tid: Tid,
        out_addr: u64,
        alignment: u64,
        size: u64,
        lang: Language,
    ) {
        let seq = self.bump(tid, |c| {
            let seq = c.memalign;
            c.memalign += 1;
            seq
        });
        if let Ok(mut pending) = self.memalign.lock() {
            pending.insert(
                tid,
                PendingMemalign {
                    seq,
                    out_addr,
                    size,
                    language: lang,
                },
            );
        }
        self.logger.log(
            LogSubject::Memory,
            format_args!(
                "[MEMALIGN #{} tid={}] {} bytes aligned to {} requested by {}",
                seq, tid, size, alignment, lang
            ),
        );
    }

    /// `result` is the int returned by posix_memalign; the allocated
    /// pointer has to be fetched from the out-parameter captured at entry.
    pub fn after_posix_memalign(
        &self,
        tid: Tid,
        result: i32,
        objects: &ObjectTracker,
        mem: &dyn TargetMemory,
    ) {
        let pending = match self.memalign.lock() {
            Ok(mut pending) => pending.remove(&tid),
            Err(_) => None,
        };
        let pending = match pending {
            Some(pending) => pending,
            None => return self.orphan(tid, "posix_memalign"),
        };
        if result != 0 {
            self.logger.log(
                LogSubject::Memory,
                format_args!(
                    "[MEMALIGN #{} tid={}] failed with code {}",
                    pending.seq, tid, result
                ),
            );
            return;
        }
        let ret = match read_pointer(mem, pending.out_addr) {
            Ok(ret) => ret,
            Err(err) => {
                warn!(
                    "cannot read posix_memalign result at {:#x}: {}",
                    pending.out_addr, err
                );
                return;
            }
        };
        if ret == 0 {
            self.logger.log(
                LogSubject::Memory,
                format_args!("[MEMALIGN #{} tid={}] returned null", pending.seq, tid),
            );
            return;
        }
        self.account(pending.language, pending.size);
        objects.register_object(tid, ret, pending.size, pending.language, 0, mem);
        self.logger.log(
            LogSubject::Memory,
            format_args!(
                "[MEMALIGN #{} tid={}] {} bytes at {:#x} for {}",
                pending.seq, tid, pending.size, ret, pending.language
            ),
        );
    }

    pub fn before_realloc(&self, tid: Tid, old_addr: u64, new_size: u64, lang: Language) {
        let seq = self.bump(tid, |c| {
            let seq = c.realloc;
            c.realloc += 1;
            seq
        });
        if let Ok(mut pending) = self.realloc.lock() {
            pending.insert(
                tid,
                PendingRealloc {
                    seq,
                    old_addr,
                    new_size,
                },
            );
        }
        self.logger.log(
            LogSubject::Memory,
            format_args!(
                "[REALLOC #{} tid={}] ({:#x}, {}) by {}",
                seq, tid, old_addr, new_size, lang
            ),
        );
    }

    pub fn after_realloc(&self, tid: Tid, new_addr: u64, objects: &ObjectTracker) {
        let pending = match self.realloc.lock() {
            Ok(mut pending) => pending.remove(&tid),
            Err(_) => None,
        };
        let pending = match pending {
            Some(pending) => pending,
            None => return self.orphan(tid, "realloc"),
        };
        if new_addr == 0 {
            // realloc failed; the old mapping is still live.
            self.logger.log(
                LogSubject::Memory,
                format_args!("[REALLOC #{} tid={}] failed", pending.seq, tid),
            );
            return;
        }
        objects.move_object(tid, pending.old_addr, new_addr, pending.new_size);
        self.logger.log(
            LogSubject::Memory,
            format_args!(
                "[REALLOC #{} tid={}] {:#x} -> {:#x} ({} bytes)",
                pending.seq, tid, pending.old_addr, new_addr, pending.new_size
            ),
        );
    }

    /// No after hook: by the time free returns the range is gone.
    pub fn before_free(&self, tid: Tid, addr: u64, objects: &ObjectTracker) {
        let seq = self.bump(tid, |c| {
            let seq = c.free;
            c.free += 1;
            seq
        });
        self.logger.log(
            LogSubject::Memory,
            format_args!("[FREE #{} tid={}] {:#x}", seq, tid, addr),
        );
        objects.remove_object(tid, addr);
    }

    pub fn bytes(&self) -> BytesByLanguage {
        match self.bytes.lock() {
            Ok(bytes) => *bytes,
            Err(_) => BytesByLanguage::default(),
        }
    }

    pub fn report(&self, w: &mut dyn Write) -> io::Result<()> {
        let bytes = self.bytes();
        writeln!(w, "--- Allocation Report ---")?;
        writeln!(w, "Rust:   {} bytes", bytes.rust)?;
        writeln!(w, "C:      {} bytes", bytes.c)?;
        writeln!(w, "Total:  {} bytes", bytes.total())?;
        Ok(())
    }

    fn account(&self, lang: Language, size: u64) {
        if let Ok(mut bytes) = self.bytes.lock() {
            bytes.add(lang, size);
        }
    }

    fn bump<F: FnOnce(&mut CallCounters) -> u64>(&self, tid: Tid, f: F) -> u64 {
        match self.counters.lock() {
            Ok(mut counters) => f(counters.entry(tid).or_default()),
            Err(_) => 0,
        }
    }

    // Post-hooks can fire without their pre-hook at process teardown.
    fn orphan(&self, tid: Tid, what: &str) {
        if !self.orphan_logged.swap(true, Ordering::Relaxed) {
            warn!("{} post-hook without pending record on thread {}", what, tid);
        }
    }
}
