//! Format disk: GPT table, EFI partition, LUKS2 root.

use tracing::{debug, info};

use super::StepContext;
use crate::command::{Invocation, OutputMode};
use crate::disk::{SECTOR_SIZE, byte_count_decimal};
use crate::error::{InstallError, Result};

const MIB: u64 = 1024 * 1024;

pub const BOOT_PART_MIB: u64 = 256;
pub const BOOT_PART_BLOCKS: u64 = BOOT_PART_MIB * MIB / SECTOR_SIZE;
/// Sectors kept free at the end of the disk for the backup GPT.
pub const UNALLOCATED_BLOCKS: u64 = 128;
/// Smallest root partition worth installing onto.
pub const MIN_ROOT_MIB: u64 = 2;

pub const EFI_LABEL: &str = "SYSTEM-EFI";

/// Partition sizes for a disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionLayout {
    pub disk_blocks: u64,
    pub root_blocks: u64,
    pub root_mib: u64,
}

impl PartitionLayout {
    /// Compute the layout, or fail if the disk cannot hold it.
    pub fn for_disk(disk_blocks: u64) -> Result<Self> {
        let reserved = BOOT_PART_BLOCKS + UNALLOCATED_BLOCKS;
        let root_blocks = disk_blocks.saturating_sub(reserved);
        let root_mib = root_blocks * SECTOR_SIZE / MIB;
        if root_mib < MIN_ROOT_MIB {
            return Err(InstallError::layout(format!(
                "disk of {} is too small for a {} MiB boot partition and a root partition",
                byte_count_decimal(disk_blocks * SECTOR_SIZE),
                BOOT_PART_MIB
            )));
        }
        Ok(Self {
            disk_blocks,
            root_blocks,
            root_mib,
        })
    }

    /// `parted --script` arguments creating the table on `disk_path`.
    ///
    /// Boot spans 1..256 MiB; root starts right after and never reaches the
    /// unallocated tail.
    pub fn parted_args(&self, disk_path: &str) -> Vec<String> {
        let boot_end = BOOT_PART_MIB.to_string();
        let root_start = (BOOT_PART_MIB + 1).to_string();
        let root_end = (BOOT_PART_MIB + self.root_mib).to_string();
        [
            "--script",
            disk_path,
            "mklabel",
            "gpt",
            "mkpart",
            "boot",
            "fat32",
            "1",
            boot_end.as_str(),
            "mkpart",
            "root",
            root_start.as_str(),
            root_end.as_str(),
            "set",
            "1",
            "boot",
            "on",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect()
    }
}

pub fn execute(ctx: &StepContext<'_>) -> Result<()> {
    let disk = &ctx.settings.disk;
    let layout = PartitionLayout::for_disk(disk.num_blocks)?;
    let updates = ctx.updates;

    updates.info(format!("Partitioning {:?}", disk.path));
    updates.info(format!(
        "Device has a capacity of {}",
        byte_count_decimal(disk.capacity_bytes())
    ));
    updates.blank();
    updates.info("New partition table:");
    updates.info(format!(
        "  [FAT32]  Boot partition ({})",
        byte_count_decimal(BOOT_PART_MIB * 1000 * 1000)
    ));
    updates.info(format!(
        "  [LUKS2]  Encrypted root partition ({})",
        byte_count_decimal(layout.root_blocks * SECTOR_SIZE)
    ));
    updates.blank();
    info!("Partitioning {} with {:?}", disk.path, layout);

    let parted = Invocation::new("parted").args(layout.parted_args(&disk.path));
    ctx.runner.run(updates, "parted", &parted, OutputMode::Standard)?;
    ctx.settle(ctx.timings.after_table);

    let partprobe = Invocation::new("partprobe").arg(&disk.path);
    ctx.runner.run(updates, "partprobe", &partprobe, OutputMode::Standard)?;
    let boot = disk.path_for_partition(1);
    let root = disk.path_for_partition(2);
    ctx.settle_device(ctx.timings.after_probe, &root);

    updates.blank();
    updates.info(format!("Creating fat32 EFI filesystem on {}", boot));
    let mkfs_fat = Invocation::new("mkfs.fat").args(["-F32", "-n", EFI_LABEL, boot.as_str()]);
    ctx.runner.run(updates, "mkfs.fat", &mkfs_fat, OutputMode::Standard)?;
    ctx.settle(ctx.timings.after_format);

    updates.blank();
    updates.info(format!("Creating encrypted filesystem on {}", root));
    let luks_format = Invocation::new("cryptsetup")
        .args([
            "luksFormat",
            "--type",
            "luks2",
            root.as_str(),
            "--key-file",
            "-",
            "--hash",
            "sha256",
            "--cipher",
            "aes-xts-plain64",
            "--key-size",
            "512",
            "--iter-time",
            "2600",
            "--use-random",
        ])
        .stdin(ctx.settings.password.clone());
    ctx.runner.run(updates, "cryptsetup", &luks_format, OutputMode::Standard)?;
    ctx.settle(ctx.timings.after_format);

    updates.blank();
    updates.info("Unlocking root filesystem");
    let mapped = ctx.paths.mapped_device();
    let luks_open = Invocation::new("cryptsetup")
        .args(["luksOpen", "--key-file", "-", root.as_str(), ctx.paths.mapper_name.as_str()])
        .stdin(ctx.settings.password.clone());
    ctx.runner.run(updates, "cryptsetup", &luks_open, OutputMode::Standard)?;
    ctx.settle_device(ctx.timings.after_unlock, &mapped);

    if ctx.settings.scrub {
        scrub(ctx, &mapped)?;
    }

    updates.blank();
    updates.info(format!("Creating ext4 filesystem on {}", mapped));
    let mkfs_ext4 = Invocation::new("mkfs.ext4").args(["-qF", mapped.as_str()]);
    ctx.runner.run(updates, "mkfs.ext4", &mkfs_ext4, OutputMode::Standard)?;
    ctx.settle(ctx.timings.after_format);

    Ok(())
}

/// Overwrite the unlocked volume with zeros.
///
/// dd stops with an error once the device is full; that exit status is
/// expected and ignored.
fn scrub(ctx: &StepContext<'_>, mapped: &str) -> Result<()> {
    ctx.updates.blank();
    ctx.updates.info("Scrubbing encrypted partition:");
    let dd = Invocation::new("dd").args([
        "if=/dev/zero".to_string(),
        format!("of={}", mapped),
        "bs=1M".to_string(),
        "status=progress".to_string(),
    ]);
    let status = ctx
        .runner
        .run_interactive(ctx.updates, "dd", &dd, OutputMode::Progress)?;
    debug!("Scrub finished with exit code {:?}", status.code);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_for_500gb_disk() {
        let layout = PartitionLayout::for_disk(976_773_168).unwrap();
        assert_eq!(BOOT_PART_BLOCKS, 524_288);
        assert_eq!(layout.root_blocks, 976_773_168 - 524_288 - 128);
        assert_eq!(layout.root_mib, layout.root_blocks * 512 / (1024 * 1024));
    }

    #[test]
    fn test_root_partition_stays_inside_disk() {
        for blocks in [600_000u64, 976_773_168, 2_000_409_264, 7_814_037_168] {
            let layout = PartitionLayout::for_disk(blocks).unwrap();
            let end_bytes = (BOOT_PART_MIB + layout.root_mib) * MIB;
            assert!(end_bytes + UNALLOCATED_BLOCKS * SECTOR_SIZE <= blocks * SECTOR_SIZE);
        }
    }

    #[test]
    fn test_layout_rejects_tiny_disk() {
        let err = PartitionLayout::for_disk(BOOT_PART_BLOCKS).unwrap_err();
        assert!(matches!(err, InstallError::Layout(_)));
        assert!(PartitionLayout::for_disk(0).is_err());
    }

    #[test]
    fn test_parted_args() {
        let layout = PartitionLayout::for_disk(976_773_168).unwrap();
        let args = layout.parted_args("/dev/sda");
        assert_eq!(&args[..4], ["--script", "/dev/sda", "mklabel", "gpt"]);
        assert_eq!(&args[4..9], ["mkpart", "boot", "fat32", "1", "256"]);
        assert_eq!(&args[9..12], ["mkpart", "root", "257"]);
        assert_eq!(args[12], (256 + layout.root_mib).to_string());
        assert_eq!(&args[13..], ["set", "1", "boot", "on"]);
    }
}
