use log::debug;
use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;

use crate::dbi::Tid;

/// The attributed source languages. `Shared` covers runtime support code
/// and everything the classifier cannot place; it is the default when a
/// thread has no context pushed and never shows up in reported counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Language {
    Rust,
    C,
    Shared,
}

impl Language {
    /// Index into per-language counter pairs. `Shared` is never counted.
    pub fn slot(self) -> Option<usize> {
        match self {
            Language::Rust => Some(0),
            Language::C => Some(1),
            Language::Shared => None,
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            Language::Rust => "Rust",
            Language::C => "C",
            Language::Shared => "Shared",
        })
    }
}

/// Per-thread stack of language contexts, pushed on routine entry and
/// popped on routine exit. One lock covers all threads; reads take it too
/// because access hooks on other threads update neighbouring slots.
#[derive(Default)]
pub struct LanguageTracker {
    stacks: Mutex<HashMap<Tid, Vec<Language>>>,
}

impl LanguageTracker {
    pub fn new() -> LanguageTracker {
        LanguageTracker::default()
    }

    pub fn enter(&self, tid: Tid, lang: Language) {
        if let Ok(mut stacks) = self.stacks.lock() {
            stacks.entry(tid).or_default().push(lang);
        }
    }

    /// Post-hooks are not guaranteed to fire for tail calls, longjmp,
    /// unwinding or thread exit, so the matching entry may be missing.
    /// Underflow is a diagnostic, never a panic.
    pub fn exit(&self, tid: Tid) {
        if let Ok(mut stacks) = self.stacks.lock() {
            match stacks.get_mut(&tid) {
                Some(stack) if !stack.is_empty() => {
                    stack.pop();
                }
                _ => debug!("language context underflow on thread {}", tid),
            }
        }
    }

    pub fn current(&self, tid: Tid) -> Language {
        match self.stacks.lock() {
            Ok(stacks) => stacks
                .get(&tid)
                .and_then(|stack| stack.last())
                .copied()
                .unwrap_or(Language::Shared),
            Err(_) => Language::Shared,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Language, LanguageTracker};

    #[test]
    fn empty_stack_is_shared() {
        let tracker = LanguageTracker::new();
        assert_eq!(tracker.current(0), Language::Shared);
    }

    #[test]
    fn balanced_sequence_restores_previous_context() {
        let tracker = LanguageTracker::new();
        tracker.enter(0, Language::C);
        let before = tracker.current(0);

        tracker.enter(0, Language::Rust);
        tracker.enter(0, Language::C);
        tracker.enter(0, Language::Rust);
        assert_eq!(tracker.current(0), Language::Rust);
        tracker.exit(0);
        tracker.exit(0);
        tracker.exit(0);

        assert_eq!(tracker.current(0), before);
    }

    #[test]
    fn underflow_is_a_noop() {
        let tracker = LanguageTracker::new();
        tracker.exit(7);
        tracker.exit(7);
        assert_eq!(tracker.current(7), Language::Shared);

        tracker.enter(7, Language::Rust);
        assert_eq!(tracker.current(7), Language::Rust);
    }

    #[test]
    fn threads_do_not_interfere() {
        let tracker = LanguageTracker::new();
        tracker.enter(1, Language::Rust);
        tracker.enter(2, Language::C);
        assert_eq!(tracker.current(1), Language::Rust);
        assert_eq!(tracker.current(2), Language::C);
        tracker.exit(1);
        assert_eq!(tracker.current(1), Language::Shared);
        assert_eq!(tracker.current(2), Language::C);
    }

    #[test]
    fn concurrent_threads_see_their_own_stack() {
        use std::sync::Arc;

        let tracker = Arc::new(LanguageTracker::new());
        let mut handles = vec![];
        for tid in 1..5u32 {
            let tracker = Arc::clone(&tracker);
            handles.push(std::thread::spawn(move || {
                let lang = if tid % 2 == 0 {
                    Language::C
                } else {
                    Language::Rust
                };
                for _ in 0..1000 {
                    tracker.enter(tid, lang);
                    assert_eq!(tracker.current(tid), lang);
                    tracker.exit(tid);
                }
                assert_eq!(tracker.current(tid), Language::Shared);
            }));
        }
        for handle in handles {
            assert!(handle.join().is_ok());
        }
    }
}
