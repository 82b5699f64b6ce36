use std::collections::HashSet;

use crate::dbi::Image;
use crate::language::Language;

/// Symbols owned by the linker and the language runtimes. Nothing here is
/// attributed to either language.
const RUNTIME_ROUTINES: &[&str] = &[
    "_start",
    "deregister_tm_clones",
    "register_tm_clones",
    "__do_global_dtors_aux",
    "frame_dummy",
    "rust_eh_personality",
    ".init",
    "_init",
    ".fini",
    "_fini",
    ".plt",
    ".plt.got",
    ".plt.sec",
    ".text",
    "__rust_try",
    "",
];

/// Images that sit underneath both languages.
const RUNTIME_IMAGES: &[&str] = &[
    "libc.so.6",
    "libm.so.6",
    "libgcc_s.so.1",
    "libresolv.so.2",
    "libstdc++.so.6",
    "linux-vdso.so.1",
    "ld-linux-x86-64.so.2",
];

/// Decides which language owns a routine. Stateless after construction:
/// the same `(image, routine)` pair always yields the same answer.
pub struct Classifier {
    foreign: HashSet<String>,
}

impl Default for Classifier {
    fn default() -> Classifier {
        Classifier::new()
    }
}

impl Classifier {
    pub fn new() -> Classifier {
        Classifier {
            foreign: HashSet::new(),
        }
    }

    /// `foreign` is the foreign-function finder output: routine names that
    /// are C no matter what the symbol heuristics say. Catches hand-written
    /// assembly and exotic linkage.
    pub fn with_allowlist(foreign: HashSet<String>) -> Classifier {
        Classifier { foreign }
    }

    pub fn is_foreign(&self, routine: &str) -> bool {
        self.foreign.contains(routine)
    }

    /// Full classification: the allowlist wins over every heuristic.
    pub fn classify(&self, image: &Image, routine: &str) -> Language {
        if self.is_foreign(routine) {
            return Language::C;
        }
        self.heuristic(image, routine)
    }

    /// The override-free rules, in order; the first match wins.
    pub fn heuristic(&self, image: &Image, routine: &str) -> Language {
        if image.interpreter || image.is_vdso() {
            return Language::Shared;
        }
        if RUNTIME_IMAGES.contains(&image.basename()) {
            return Language::Shared;
        }
        if RUNTIME_ROUTINES.contains(&routine) {
            return Language::Shared;
        }
        if routine.ends_with("@plt") {
            return Language::Shared;
        }
        if image.main_executable {
            if is_rust_symbol(routine) {
                return Language::Rust;
            }
            return Language::C;
        }
        Language::C
    }
}

pub fn is_rust_symbol(name: &str) -> bool {
    name == "main" || is_modern_mangled(name) || is_legacy_mangled(name)
}

/// `_ZN…17h<16 hex digits>E`: the `17h` run is the Itanium length prefix
/// of the trailing hash segment, so it sits exactly 20 bytes from the end.
/// Deliberately conservative; symbols that fail fall through to C.
fn is_modern_mangled(name: &str) -> bool {
    let bytes = name.as_bytes();
    let len = bytes.len();
    if len < 20 || !name.starts_with("_ZN") || bytes[len - 1] != b'E' {
        return false;
    }
    if bytes[len - 20] != b'1' || bytes[len - 19] != b'7' || bytes[len - 18] != b'h' {
        return false;
    }
    bytes[len - 17..len - 1]
        .iter()
        .all(|b| b.is_ascii_hexdigit())
}

fn is_legacy_mangled(name: &str) -> bool {
    name.contains("___rust")
}
