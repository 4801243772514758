//! Device topology reader.
//!
//! Builds a tree of [`Disk`] records from `lsblk` (which devices exist),
//! `udevadm info` (what each device is) and sysfs (how big it is).
//!
//! # Partition probing
//!
//! Partitions are discovered by asking udev about `<disk><n>` for n = 1..=11.
//! The first index udev refuses to describe ends the probe. That refusal is a
//! clean exit, not an error; anything else (spawn failure, bad output) aborts
//! discovery for the whole call.

use serde::Deserialize;
use std::fmt::Write as _;
use std::path::Path;
use std::process::Command;
use tracing::{debug, info};

use crate::error::{InstallError, Result};

/// Bytes per sector for sysfs `size` and udev block counts.
pub const SECTOR_SIZE: u64 = 512;

/// Highest partition index probed under a whole disk.
pub const MAX_PROBED_PARTITIONS: u32 = 11;

/// A block device or one of its partitions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Disk {
    pub name: String,
    pub path: String,

    pub model: String,
    pub serial: String,
    pub bus: String,
    pub revision: String,
    pub symlinks: Vec<String>,

    /// Size in 512-byte sectors. Only populated for whole disks.
    pub num_blocks: u64,

    pub major: u32,
    pub minor: u32,
    /// Partition index; 0 for a whole disk.
    pub part_n: u32,

    pub part_table_type: String,
    pub part_table_uuid: String,
    pub fs_type: String,
    pub fs_label: String,
    pub fs_uuid: String,

    pub partitions: Vec<Disk>,
}

impl Disk {
    /// True for a whole-disk entry (partition index 0).
    pub fn is_whole_disk(&self) -> bool {
        self.part_n == 0
    }

    /// Device capacity in bytes.
    pub fn capacity_bytes(&self) -> u64 {
        self.num_blocks * SECTOR_SIZE
    }

    /// Device node for partition `n` of this disk.
    ///
    /// Prefers whichever of `<path><n>` / `<path>p<n>` exists. When neither
    /// exists yet, legacy SCSI/SATA names (`/dev/sdX`) get a bare number and
    /// everything else (NVMe, MMC, loop) gets the `p` separator.
    pub fn path_for_partition(&self, n: u32) -> String {
        let plain = format!("{}{}", self.path, n);
        if Path::new(&plain).exists() {
            return plain;
        }
        let separated = format!("{}p{}", self.path, n);
        if Path::new(&separated).exists() {
            return separated;
        }

        if self.path.contains("/sd") {
            plain
        } else {
            separated
        }
    }

    /// Multi-line description shown before the disk is wiped.
    pub fn summary(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "Path: {}", self.path);
        if !self.fs_label.is_empty() {
            let _ = writeln!(out, "Label: {}", self.fs_label);
        }
        let _ = writeln!(out, "Name: {} ({})", self.model, self.serial);
        let _ = writeln!(out, "Capacity: {}", byte_count_decimal(self.capacity_bytes()));
        let _ = writeln!(out, "UUID: {}", self.part_table_uuid);
        let _ = writeln!(
            out,
            "Partitions: {} read from {} table",
            self.partitions.len(),
            if self.part_table_type.is_empty() {
                "no"
            } else {
                self.part_table_type.as_str()
            }
        );
        for (i, part) in self.partitions.iter().enumerate() {
            let _ = writeln!(out, "  {:2}: {} filesystem on {}", i, part.fs_type, part.name);
            let _ = writeln!(out, "      Filesystem UUID: {}", part.fs_uuid);
            let _ = writeln!(out, "      Partition UUID: {}", part.part_table_uuid);
        }
        out
    }
}

/// Pretty-format a byte count with decimal SI prefixes.
///
/// Values below 1000 are exact (`"999 B"`); larger values get one fractional
/// digit (`"1.0 kB"`, `"1.5 MB"`).
pub fn byte_count_decimal(bytes: u64) -> String {
    const UNIT: u64 = 1000;
    const PREFIXES: [char; 6] = ['k', 'M', 'G', 'T', 'P', 'E'];

    if bytes < UNIT {
        return format!("{} B", bytes);
    }
    let mut div = UNIT;
    let mut exp = 0;
    let mut n = bytes / UNIT;
    while n >= UNIT {
        div *= UNIT;
        exp += 1;
        n /= UNIT;
    }
    format!("{:.1} {}B", bytes as f64 / div as f64, PREFIXES[exp])
}

// ============================================================================
// External tool access
// ============================================================================

/// One row of `lsblk -Jadp`.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct BlockDevice {
    pub name: String,
    #[serde(default, rename = "type")]
    pub kind: String,
}

#[derive(Debug, Deserialize)]
struct LsblkOutput {
    #[serde(default)]
    blockdevices: Vec<BlockDevice>,
}

/// Parse `lsblk -J` output into its device rows.
pub fn parse_lsblk(json: &str) -> Result<Vec<BlockDevice>> {
    let parsed: LsblkOutput = serde_json::from_str(json)?;
    Ok(parsed.blockdevices)
}

/// Where topology facts come from.
pub trait TopologySource: Send + Sync {
    /// Every block device the system reports (disks, loops, roms...).
    fn list_block_devices(&self) -> Result<Vec<BlockDevice>>;

    /// Raw `udevadm info` output for `path`.
    ///
    /// `Ok(None)` means the tool ran and reported the device does not exist.
    fn inspect(&self, path: &str) -> Result<Option<String>>;

    /// Size of the named device in sectors.
    fn sector_count(&self, name: &str) -> Result<u64>;
}

/// Reads topology from the running system.
#[derive(Debug, Clone, Default)]
pub struct SystemTopology;

impl TopologySource for SystemTopology {
    fn list_block_devices(&self) -> Result<Vec<BlockDevice>> {
        let output = Command::new("lsblk")
            .arg("-Jadp")
            .output()
            .map_err(|source| InstallError::CommandSpawn {
                program: "lsblk".to_string(),
                source,
            })?;
        if !output.status.success() {
            return Err(InstallError::discovery(format!(
                "lsblk failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        parse_lsblk(&String::from_utf8_lossy(&output.stdout))
    }

    fn inspect(&self, path: &str) -> Result<Option<String>> {
        let output = Command::new("udevadm")
            .args(["info", "-q", "all", "--name", path])
            .output()
            .map_err(|source| InstallError::CommandSpawn {
                program: "udevadm".to_string(),
                source,
            })?;
        if !output.status.success() {
            debug!("udevadm has no record of {}", path);
            return Ok(None);
        }
        Ok(Some(String::from_utf8_lossy(&output.stdout).into_owned()))
    }

    fn sector_count(&self, name: &str) -> Result<u64> {
        let raw = std::fs::read_to_string(format!("/sys/class/block/{}/size", name))?;
        raw.trim()
            .parse()
            .map_err(|e| InstallError::discovery(format!("bad sector count for {}: {}", name, e)))
    }
}

// ============================================================================
// Parsing
// ============================================================================

fn parse_number(key: &str, value: &str) -> Result<u32> {
    value
        .parse()
        .map_err(|e| InstallError::discovery(format!("decoding {}: {}", key, e)))
}

/// Parse `udevadm info -q all` output for the device at `path`.
pub fn parse_udev_info(path: &str, output: &str) -> Result<Disk> {
    let mut disk = Disk {
        path: path.to_string(),
        ..Disk::default()
    };

    for line in output.lines() {
        if line.len() < 4 {
            continue;
        }
        let Some((tag, rest)) = line.split_at_checked(3) else {
            continue;
        };
        match tag {
            "N: " => disk.name = rest.to_string(),
            "S: " => disk.symlinks.push(rest.to_string()),
            "E: " => {
                let Some((key, value)) = rest.split_once('=') else {
                    continue;
                };
                match key {
                    "ID_MODEL" => disk.model = value.to_string(),
                    "ID_PART_TABLE_TYPE" => disk.part_table_type = value.to_string(),
                    "ID_PART_TABLE_UUID" => disk.part_table_uuid = value.to_string(),
                    "ID_SERIAL" => disk.serial = value.to_string(),
                    "ID_REVISION" => disk.revision = value.to_string(),
                    "ID_BUS" => disk.bus = value.to_string(),
                    "ID_FS_TYPE" => disk.fs_type = value.to_string(),
                    "ID_FS_LABEL" => disk.fs_label = value.to_string(),
                    "ID_FS_UUID" => disk.fs_uuid = value.to_string(),
                    "MAJOR" => disk.major = parse_number("major", value)?,
                    "MINOR" => disk.minor = parse_number("minor", value)?,
                    "PARTN" => disk.part_n = parse_number("partN", value)?,
                    _ => {}
                }
            }
            _ => {}
        }
    }

    Ok(disk)
}

/// Inspect one device, and when `probe_partitions` is set, its partitions.
///
/// Returns `Ok(None)` if the device itself does not exist.
pub fn read_device(
    source: &dyn TopologySource,
    path: &str,
    probe_partitions: bool,
) -> Result<Option<Disk>> {
    let Some(output) = source.inspect(path)? else {
        return Ok(None);
    };
    let mut disk = parse_udev_info(path, &output)?;

    if probe_partitions && disk.major != 0 {
        for n in 1..=MAX_PROBED_PARTITIONS {
            let part_path = format!("{}{}", path, n);
            let Some(part) = read_device(source, &part_path, false)? else {
                break;
            };
            if part.part_n != 0 {
                disk.partitions.push(part);
            }
        }
    }

    Ok(Some(disk))
}

/// Discover every whole disk on the system with its partitions and size.
pub fn discover(source: &dyn TopologySource) -> Result<Vec<Disk>> {
    let mut disks = Vec::new();
    for dev in source.list_block_devices()? {
        if dev.kind != "disk" {
            continue;
        }
        let mut disk = read_device(source, &dev.name, true)?.ok_or_else(|| {
            InstallError::discovery(format!("udev has no record of {}", dev.name))
        })?;
        disk.num_blocks = source.sector_count(&disk.name)?;
        debug!(
            "Discovered {} ({}) with {} partition(s)",
            disk.path,
            byte_count_decimal(disk.capacity_bytes()),
            disk.partitions.len()
        );
        disks.push(disk);
    }
    info!("Discovered {} disk(s)", disks.len());
    Ok(disks)
}
