//! Configure: mount the new system and write its configuration.

use std::fs;
use std::path::Path;
use tracing::info;

use super::StepContext;
use super::templates::{self, FilesystemIds, SystemConfig};
use crate::command::{Invocation, OutputMode};
use crate::disk;
use crate::error::{InstallError, Result};
use crate::markers;

pub fn execute(ctx: &StepContext<'_>) -> Result<()> {
    mount_filesystems(ctx)?;
    stage_etc(ctx)?;
    fs::create_dir_all(ctx.paths.target_nixos())?;
    write_filesystems_nix(ctx)?;
    write_configuration_nix(ctx)?;

    let etc = ctx.paths.target_etc().display().to_string();
    let chown = Invocation::new("chown").args(["-R", "root", etc.as_str()]);
    ctx.runner.run(ctx.updates, "chown", &chown, OutputMode::Standard)
}

fn mount(ctx: &StepContext<'_>, device: &str, target: &Path) -> Result<()> {
    fs::create_dir_all(target)?;
    ctx.updates
        .info(format!("Mounting {} -> {}", device, target.display()));
    let target = target.display().to_string();
    let mount = Invocation::new("mount").args([device, target.as_str()]);
    ctx.runner.run(ctx.updates, "mount", &mount, OutputMode::Standard)
}

fn mount_filesystems(ctx: &StepContext<'_>) -> Result<()> {
    ctx.updates.blank();
    mount(ctx, &ctx.paths.mapped_device(), &ctx.paths.mount_root)?;
    ctx.updates.info("Mounted root fs.");
    ctx.settle(ctx.timings.after_mount);

    let boot = ctx.settings.disk.path_for_partition(1);
    mount(ctx, &boot, &ctx.paths.target_boot())?;
    ctx.updates.info("Mounted boot fs.");
    ctx.settle(ctx.timings.after_mount);
    Ok(())
}

fn copy_tree(ctx: &StepContext<'_>, src: &Path, dest: &Path) -> Result<()> {
    let src = src.display().to_string();
    let dest = dest.display().to_string();
    let cp = Invocation::new("cp").args(["-ar", src.as_str(), dest.as_str()]);
    ctx.runner.run(ctx.updates, "cp", &cp, OutputMode::Progress)
}

fn stage_etc(ctx: &StepContext<'_>) -> Result<()> {
    let etc = ctx.paths.target_etc();
    fs::create_dir_all(&etc)?;

    ctx.updates.blank();
    ctx.updates.info("Staging configuration:");
    copy_tree(ctx, &ctx.paths.system_config_src, &etc)?;
    copy_tree(ctx, &ctx.paths.base_config_src, &etc)?;

    let staged = ctx.paths.staged_base();
    let changed = markers::apply_dir(&staged)?;
    info!("Applied install markers to {} file(s) in {}", changed, staged.display());
    ctx.updates.info(format!(
        "Trimmed {} file(s) in {}",
        changed,
        staged.display()
    ));
    Ok(())
}

fn fs_uuid(ctx: &StepContext<'_>, device: &str) -> Result<String> {
    let record = disk::read_device(ctx.topology, device, false)?
        .ok_or_else(|| InstallError::discovery(format!("udev has no record of {}", device)))?;
    if record.fs_uuid.is_empty() {
        return Err(InstallError::discovery(format!(
            "{} has no filesystem UUID",
            device
        )));
    }
    Ok(record.fs_uuid)
}

fn write_filesystems_nix(ctx: &StepContext<'_>) -> Result<()> {
    let disk = &ctx.settings.disk;
    let ids = FilesystemIds {
        boot_uuid: fs_uuid(ctx, &disk.path_for_partition(1))?,
        luks_uuid: fs_uuid(ctx, &disk.path_for_partition(2))?,
        ext4_uuid: fs_uuid(ctx, &ctx.paths.mapped_device())?,
    };
    info!("Filesystem UUIDs: {:?}", ids);

    let path = ctx.paths.target_nixos().join("filesystems.nix");
    fs::write(&path, templates::filesystems_nix(&ids, &ctx.paths.mapper_name)?)?;
    ctx.updates.info(format!("Wrote {}", path.display()));
    Ok(())
}

fn hash_password(ctx: &StepContext<'_>) -> Result<String> {
    let mkpasswd = Invocation::new("mkpasswd")
        .args(["-s", "-m", "sha-512"])
        .stdin(ctx.settings.password.clone());
    let output = ctx.runner.run_captured(&mkpasswd)?.ensure_success(&mkpasswd)?;
    let hash = output.stdout.trim().to_string();
    if hash.is_empty() {
        return Err(InstallError::general("mkpasswd produced no hash"));
    }
    Ok(hash)
}

fn write_configuration_nix(ctx: &StepContext<'_>) -> Result<()> {
    let settings = ctx.settings;
    let hash = hash_password(ctx)?;
    let contents = templates::configuration_nix(&SystemConfig {
        username: &settings.username,
        hostname: &settings.hostname,
        timezone: &settings.timezone,
        password_hash: &hash,
        autologin: settings.autologin,
        hardware_import: settings.hardware_import.as_deref(),
    })?;

    let path = ctx.paths.target_nixos().join("configuration.nix");
    fs::write(&path, contents)?;
    ctx.updates.info(format!("Wrote {}", path.display()));
    Ok(())
}
