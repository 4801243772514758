//! Install system: run nixos-install and carry over network profiles.

use std::fs;
use std::io;
use tracing::{debug, info};

use super::StepContext;
use crate::command::{Invocation, OutputMode};
use crate::error::{InstallError, Result};

pub fn execute(ctx: &StepContext<'_>) -> Result<()> {
    let root = ctx.paths.mount_root.display().to_string();
    let nixos_install =
        Invocation::new("nixos-install").args(["--no-root-passwd", "--root", root.as_str()]);
    ctx.runner
        .run(ctx.updates, "nixos-install", &nixos_install, OutputMode::Progress)?;

    copy_network_profiles(ctx)
}

/// Copy the live system's saved connections so the new system comes up online.
///
/// A missing profile directory means there is nothing to copy. Any other
/// failure to read it fails the step.
fn copy_network_profiles(ctx: &StepContext<'_>) -> Result<()> {
    let src = &ctx.paths.network_profiles;
    let read_err = |e: io::Error| {
        InstallError::general(format!(
            "reading network profiles in {}: {}",
            src.display(),
            e
        ))
    };
    let mut entries = match fs::read_dir(src) {
        Ok(entries) => entries
            .map(|entry| entry.map(|e| e.path()))
            .collect::<io::Result<Vec<_>>>()
            .map_err(read_err)?,
        Err(e) if e.kind() == io::ErrorKind::NotFound => Vec::new(),
        Err(e) => return Err(read_err(e)),
    };
    if entries.is_empty() {
        debug!("No network profiles under {}", src.display());
        return Ok(());
    }
    entries.sort();

    let dest = ctx.paths.target_network_profiles();
    fs::create_dir_all(&dest)?;
    ctx.updates.blank();
    ctx.updates.info("Copying network profiles");

    let cp = Invocation::new("cp")
        .arg("-ar")
        .args(entries.iter().map(|p| p.display().to_string()))
        .arg(dest.display().to_string());
    ctx.runner.run(ctx.updates, "cp", &cp, OutputMode::Standard)?;
    info!("Copied {} network profile(s) to {}", entries.len(), dest.display());
    Ok(())
}
