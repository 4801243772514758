//! Marker transform engine.
//!
//! Template files staged into the new root carry comment markers that say
//! which content must not survive installation:
//!
//! ```text
//! # File-marker: Trim on install      (delete the whole file)
//! # Start-marker: Trim on install     (drop everything up to the matching end marker)
//! # End-marker: Trim on install
//! foo = 1; # Line-marker: Trim on install   (drop just this line)
//! ```
//!
//! Sections with any other name pass through untouched, marker lines included.
//! A file is only rewritten when something was actually dropped, so marker-free
//! files keep their bytes and modification time.

use regex::Regex;
use std::fs;
use std::path::Path;
use std::sync::LazyLock;
use thiserror::Error;
use tracing::{debug, info};

use crate::error::{InstallError, Result};

/// The only marker name that currently triggers suppression.
pub const TRIM_ON_INSTALL: &str = "Trim on install";

/// Files without this suffix are never touched.
pub const TEMPLATE_SUFFIX: &str = ".nix";

static FILE_MARKER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)\s*# File-marker: (.+)$").expect("valid file-marker regex"));
static LINE_MARKER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s*# Line-marker: (.+)$").expect("valid line-marker regex"));
static START_MARKER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s*# Start-marker: (.+)$").expect("valid start-marker regex"));
static END_MARKER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s*# End-marker: (.+)$").expect("valid end-marker regex"));

/// Marker protocol violations.
#[derive(Error, Debug)]
pub enum MarkerError {
    #[error("unknown file marker: {0:?}")]
    UnknownFileMarker(String),

    #[error("unknown line marker: {0:?}")]
    UnknownLineMarker(String),

    #[error("unmatched start/end: {end} != {start}")]
    UnmatchedEnd { start: String, end: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// What should happen to a template file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transform {
    /// The file carries a trim file-marker.
    Delete,
    /// At least one line was suppressed; write these contents back.
    Rewrite(String),
    /// Nothing to do.
    Unchanged,
}

fn capture<'a>(re: &Regex, line: &'a str) -> Option<&'a str> {
    re.captures(line)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str())
}

/// Compute the transform for one file's contents.
pub fn transform(contents: &str) -> std::result::Result<Transform, MarkerError> {
    if let Some(name) = capture(&FILE_MARKER, contents) {
        return match name {
            TRIM_ON_INSTALL => Ok(Transform::Delete),
            other => Err(MarkerError::UnknownFileMarker(other.to_string())),
        };
    }

    let mut out = String::with_capacity(contents.len());
    let mut changed = false;
    let mut open: Option<&str> = None;

    for line in contents.lines() {
        match open {
            None => {
                if let Some(name) = capture(&START_MARKER, line) {
                    open = Some(name);
                    if name == TRIM_ON_INSTALL {
                        changed = true;
                        continue;
                    }
                } else if let Some(name) = capture(&LINE_MARKER, line) {
                    if name != TRIM_ON_INSTALL {
                        return Err(MarkerError::UnknownLineMarker(name.to_string()));
                    }
                    changed = true;
                    continue;
                }
            }
            Some(section) => {
                if let Some(name) = capture(&END_MARKER, line) {
                    if name != section {
                        return Err(MarkerError::UnmatchedEnd {
                            start: section.to_string(),
                            end: name.to_string(),
                        });
                    }
                    open = None;
                    if name == TRIM_ON_INSTALL {
                        changed = true;
                        continue;
                    }
                } else if section == TRIM_ON_INSTALL {
                    changed = true;
                    continue;
                }
            }
        }

        out.push_str(line);
        out.push('\n');
    }

    if let Some(section) = open {
        debug!("section {:?} still open at end of file", section);
    }

    Ok(if changed {
        Transform::Rewrite(out)
    } else {
        Transform::Unchanged
    })
}

/// Apply markers to a single file. Returns true if the file was deleted or rewritten.
pub fn apply_file(path: &Path) -> Result<bool> {
    let is_template = path
        .file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.ends_with(TEMPLATE_SUFFIX));
    if !is_template {
        return Ok(false);
    }

    let contents = fs::read_to_string(path).map_err(|e| InstallError::marker(path, e.into()))?;
    match transform(&contents).map_err(|e| InstallError::marker(path, e))? {
        Transform::Delete => {
            fs::remove_file(path).map_err(|e| InstallError::marker(path, e.into()))?;
            info!("Removed {}", path.display());
            Ok(true)
        }
        Transform::Rewrite(new_contents) => {
            fs::write(path, new_contents).map_err(|e| InstallError::marker(path, e.into()))?;
            info!("Trimmed {}", path.display());
            Ok(true)
        }
        Transform::Unchanged => Ok(false),
    }
}

/// Apply markers to every template file directly inside `dir`.
///
/// The listing is not recursive. The first error aborts the pass; files
/// already handled stay handled. Returns how many files were changed.
pub fn apply_dir(dir: &Path) -> Result<usize> {
    let mut changed = 0;
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        if apply_file(&entry.path())? {
            changed += 1;
        }
    }
    debug!("Marker pass over {}: {} file(s) changed", dir.display(), changed);
    Ok(changed)
}
