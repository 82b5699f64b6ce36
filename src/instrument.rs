use log::warn;
use std::collections::HashMap;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use crate::allocation::AllocationTracker;
use crate::classify::Classifier;
use crate::dbi::{AccessKind, Image, Section, TargetMemory, Tid};
use crate::language::{Language, LanguageTracker};
use crate::logger::{LogSubject, Logger};
use crate::object::ObjectTracker;

/// The user-facing registration routine.
const BEACON: &str = "baleen";

/// Routines that must not receive language hooks. Pushing a context for
/// the intercepted libc frames (or the beacon itself) would pollute the
/// attribution stack.
const SKIPPED_ROUTINES: &[&str] = &["malloc", "realloc", "free", "posix_memalign", BEACON];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SpecialHook {
    Beacon,
    Malloc,
    Realloc,
    Free,
    PosixMemalign,
}

/// What the image pass decided to install on one routine. `langs` holds
/// one entry per enter/exit pair; exits pop exactly as many contexts as
/// entries pushed, which keeps the stack balanced when the Rust hook and
/// the allowlist hook coexist on the same routine.
struct RoutineHooks {
    name: String,
    langs: Vec<Language>,
    special: Option<SpecialHook>,
}

/// Classification cache for call events; covers every routine seen at
/// image load, hooked or not.
struct KnownRoutine {
    name: String,
    language: Language,
}

/// Bridges the host framework's callbacks to the trackers: decides at
/// image load what to instrument, dispatches runtime events, and writes
/// the reports at finish.
pub struct Instrumentation {
    classifier: Classifier,
    logger: Arc<Logger>,
    languages: LanguageTracker,
    allocations: AllocationTracker,
    objects: ObjectTracker,
    hooks: Mutex<HashMap<u64, RoutineHooks>>,
    routines: Mutex<HashMap<u64, KnownRoutine>>,
    report_path: PathBuf,
}

impl Instrumentation {
    pub fn new(classifier: Classifier, logger: Arc<Logger>, report_path: PathBuf) -> Instrumentation {
        Instrumentation {
            classifier,
            languages: LanguageTracker::new(),
            allocations: AllocationTracker::new(Arc::clone(&logger)),
            objects: ObjectTracker::new(Arc::clone(&logger)),
            logger,
            hooks: Mutex::new(HashMap::new()),
            routines: Mutex::new(HashMap::new()),
            report_path,
        }
    }

    /// Image-load callback: walk every routine in every section and pick
    /// its hooks. Language hooks follow the pure heuristic; the allowlist
    /// installs its C hooks on top rather than replacing them.
    pub fn image_load(&self, image: &Image, sections: &[Section]) {
        self.logger.log(
            LogSubject::Instrumentation,
            format_args!("Instrumenting image: {}", image.path),
        );

        let mut hooks = match self.hooks.lock() {
            Ok(hooks) => hooks,
            Err(_) => return,
        };
        let mut routines = match self.routines.lock() {
            Ok(routines) => routines,
            Err(_) => return,
        };

        for section in sections {
            for routine in &section.routines {
                let heuristic = self.classifier.heuristic(image, &routine.name);
                let foreign = self.classifier.is_foreign(&routine.name);
                let language = if foreign { Language::C } else { heuristic };
                routines.insert(
                    routine.address,
                    KnownRoutine {
                        name: routine.name.clone(),
                        language,
                    },
                );

                let mut entry = RoutineHooks {
                    name: routine.name.clone(),
                    langs: Vec::new(),
                    special: None,
                };
                if !SKIPPED_ROUTINES.contains(&routine.name.as_str()) {
                    if heuristic == Language::Rust {
                        entry.langs.push(Language::Rust);
                    }
                    if foreign {
                        entry.langs.push(Language::C);
                    }
                }
                if routine.name == BEACON {
                    entry.special = Some(SpecialHook::Beacon);
                } else if image.is_libc() {
                    entry.special = match routine.name.as_str() {
                        "malloc" => Some(SpecialHook::Malloc),
                        "realloc" => Some(SpecialHook::Realloc),
                        "free" => Some(SpecialHook::Free),
                        "posix_memalign" => Some(SpecialHook::PosixMemalign),
                        _ => None,
                    };
                }

                self.logger.log(
                    LogSubject::Instrumentation,
                    format_args!("  inspecting '{}' in {} ({})", routine.name, section.name, language),
                );
                if !entry.langs.is_empty() || entry.special.is_some() {
                    hooks.insert(routine.address, entry);
                }
            }
        }
    }

    /// Pre-hook dispatch. `args` carries the routine's leading integer
    /// arguments as delivered by the host.
    pub fn routine_entry(&self, tid: Tid, addr: u64, args: &[u64], mem: &dyn TargetMemory) {
        let (name, langs, special) = match self.hooks.lock() {
            Ok(hooks) => match hooks.get(&addr) {
                Some(hook) => (hook.name.clone(), hook.langs.clone(), hook.special),
                None => return,
            },
            Err(_) => return,
        };

        for lang in &langs {
            self.languages.enter(tid, *lang);
            self.logger.log(
                LogSubject::Execution,
                format_args!("[ENTER] tid={} '{}' pushes {}", tid, name, lang),
            );
        }

        let arg = |index: usize| args.get(index).copied().unwrap_or(0);
        match special {
            Some(SpecialHook::Beacon) => {
                let lang = self.languages.current(tid);
                self.objects
                    .register_object(tid, arg(0), arg(1), lang, arg(2), mem);
            }
            Some(SpecialHook::Malloc) => {
                let lang = self.languages.current(tid);
                self.allocations.before_malloc(tid, arg(0), lang);
            }
            Some(SpecialHook::Realloc) => {
                let lang = self.languages.current(tid);
                self.allocations.before_realloc(tid, arg(0), arg(1), lang);
            }
            Some(SpecialHook::PosixMemalign) => {
                let lang = self.languages.current(tid);
                self.allocations
                    .before_posix_memalign(tid, arg(0), arg(1), arg(2), lang);
            }
            Some(SpecialHook::Free) => {
                self.allocations.before_free(tid, arg(0), &self.objects);
            }
            None => {}
        }
    }

    /// Post-hook dispatch, LIFO with respect to the entry: the allocator
    /// after-hooks run first, then the language contexts unwind.
    pub fn routine_exit(&self, tid: Tid, addr: u64, ret: u64, mem: &dyn TargetMemory) {
        let (name, depth, special) = match self.hooks.lock() {
            Ok(hooks) => match hooks.get(&addr) {
                Some(hook) => (hook.name.clone(), hook.langs.len(), hook.special),
                None => return,
            },
            Err(_) => return,
        };

        match special {
            Some(SpecialHook::Malloc) => {
                self.allocations.after_malloc(tid, ret, &self.objects, mem)
            }
            Some(SpecialHook::Realloc) => self.allocations.after_realloc(tid, ret, &self.objects),
            Some(SpecialHook::PosixMemalign) => {
                self.allocations
                    .after_posix_memalign(tid, ret as i32, &self.objects, mem)
            }
            _ => {}
        }

        for _ in 0..depth {
            self.languages.exit(tid);
            self.logger.log(
                LogSubject::Execution,
                format_args!("[EXIT] tid={} '{}'", tid, name),
            );
        }
    }

    /// Predicated per-operand pre-hook: runs once for every memory operand
    /// of every retiring instruction.
    pub fn memory_access(&self, tid: Tid, _ip: u64, ea: u64, kind: AccessKind) {
        let lang = self.languages.current(tid);
        match kind {
            AccessKind::Read => self.objects.record_read(tid, ea, lang),
            AccessKind::Write => self.objects.record_write(tid, ea, lang),
        }
    }

    /// Reports calls that cross from Rust source into C routines.
    pub fn call(&self, tid: Tid, _ip: u64, target: u64, caller_file: &str) {
        if !caller_file.ends_with(".rs") {
            return;
        }
        let callee = match self.routines.lock() {
            Ok(routines) => match routines.get(&target) {
                Some(routine) if routine.language == Language::C => routine.name.clone(),
                _ => return,
            },
            Err(_) => return,
        };
        self.logger.log(
            LogSubject::Execution,
            format_args!(
                "[CALL] tid={} call to '{}' from Rust file '{}'",
                tid, callee, caller_file
            ),
        );
    }

    /// Finish callback. Reports are best-effort: the target may have died
    /// abnormally and there is nobody left to propagate an error to.
    pub fn finish(&self, code: i32) {
        self.logger.log(
            LogSubject::Instrumentation,
            format_args!("target exited with status {}", code),
        );
        if let Err(err) = self.write_report() {
            warn!("cannot write report {}: {}", self.report_path.display(), err);
        }
        self.logger.flush();
    }

    pub fn write_report(&self) -> io::Result<()> {
        let file = File::create(&self.report_path)?;
        let mut w = BufWriter::new(file);
        self.allocations.report(&mut w)?;
        writeln!(w)?;
        self.objects.report(&mut w)?;
        w.flush()
    }

    pub fn languages(&self) -> &LanguageTracker {
        &self.languages
    }

    pub fn allocations(&self) -> &AllocationTracker {
        &self.allocations
    }

    pub fn objects(&self) -> &ObjectTracker {
        &self.objects
    }
}
