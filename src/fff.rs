//! The foreign-function finder is an external subprocess that statically
//! scans the target build for cross-language call sites. We only consume
//! its output: a newline-delimited list of routine names that are C no
//! matter what the symbol heuristics say.

use log::{info, warn};
use simple_error::try_with;
use std::collections::HashSet;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::process::Command;

use crate::result::Result;

pub fn load_allowlist(path: &Path) -> Result<HashSet<String>> {
    let file = try_with!(File::open(path), "cannot open allowlist {}", path.display());
    let mut names = HashSet::new();
    for line in BufReader::new(file).lines() {
        let line = try_with!(line, "cannot read from {}", path.display());
        let name = line.trim();
        if !name.is_empty() {
            names.insert(name.to_string());
        }
    }
    Ok(names)
}

/// Runs the external finder and loads whatever it wrote to `output`.
/// Every failure path degrades to an empty allowlist: classification
/// then rests on the heuristics alone.
pub fn discover(finder: &str, output: &Path) -> HashSet<String> {
    match Command::new(finder).arg("--output").arg(output).status() {
        Ok(status) if status.success() => {}
        Ok(status) => {
            warn!("foreign-function finder exited with {}; continuing without allowlist", status);
            return HashSet::new();
        }
        Err(err) => {
            warn!(
                "cannot run foreign-function finder '{}': {}; continuing without allowlist",
                finder, err
            );
            return HashSet::new();
        }
    }
    match load_allowlist(output) {
        Ok(names) => {
            info!("loaded {} foreign routine names", names.len());
            names
        }
        Err(err) => {
            warn!("{}", err);
            HashSet::new()
        }
    }
}
