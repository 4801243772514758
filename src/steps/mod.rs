//! Installation steps.
//!
//! A run executes an ordered list of [`StepKind`]s. Each step reports its
//! progress through the [`StepContext`] it is given and returns the first
//! error it hits; it never retries and never undoes earlier work.

pub mod configure;
pub mod install;
pub mod partition;
pub mod templates;

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use strum::{Display, EnumIter, IntoEnumIterator};
use tracing::{debug, warn};

use crate::command::CommandRunner;
use crate::config::Settings;
use crate::disk::TopologySource;
use crate::error::Result;
use crate::progress::{Stage, UpdateSender};

/// One unit of installation work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumIter)]
pub enum StepKind {
    #[strum(serialize = "Format disk")]
    Partition,
    #[strum(serialize = "Configure")]
    Configure,
    #[strum(serialize = "Install system")]
    Install,
}

impl StepKind {
    /// Display name shown when the step starts and in failure messages.
    pub fn name(self) -> &'static str {
        match self {
            Self::Partition => "Format disk",
            Self::Configure => "Configure",
            Self::Install => "Install system",
        }
    }

    pub fn stage(self) -> Stage {
        match self {
            Self::Partition => Stage::Format,
            Self::Configure => Stage::Configure,
            Self::Install => Stage::Copy,
        }
    }

    pub fn execute(self, ctx: &StepContext<'_>) -> Result<()> {
        match self {
            Self::Partition => partition::execute(ctx),
            Self::Configure => configure::execute(ctx),
            Self::Install => install::execute(ctx),
        }
    }

    /// Partition, Configure, Install.
    pub fn default_pipeline() -> Vec<StepKind> {
        StepKind::iter().collect()
    }
}

/// Filesystem locations used during installation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallPaths {
    /// Where the new root filesystem is mounted.
    pub mount_root: PathBuf,
    /// Live system NixOS configuration, copied into the new root.
    pub system_config_src: PathBuf,
    /// Base configuration tree, copied into the new root and trimmed.
    pub base_config_src: PathBuf,
    /// NetworkManager connection profiles of the live system.
    pub network_profiles: PathBuf,
    /// Device-mapper name of the unlocked root volume.
    pub mapper_name: String,
}

impl Default for InstallPaths {
    fn default() -> Self {
        Self {
            mount_root: PathBuf::from("/mnt"),
            system_config_src: PathBuf::from("/etc/nixos"),
            base_config_src: PathBuf::from("/etc/twl-base"),
            network_profiles: PathBuf::from("/etc/NetworkManager/system-connections"),
            mapper_name: "cryptroot".to_string(),
        }
    }
}

impl InstallPaths {
    pub fn with_mount_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.mount_root = root.into();
        self
    }

    /// `/dev/mapper/<name>`
    pub fn mapped_device(&self) -> String {
        format!("/dev/mapper/{}", self.mapper_name)
    }

    pub fn target_etc(&self) -> PathBuf {
        self.mount_root.join("etc")
    }

    pub fn target_boot(&self) -> PathBuf {
        self.mount_root.join("boot")
    }

    /// Generated configuration directory in the new root.
    pub fn target_nixos(&self) -> PathBuf {
        self.target_etc().join("nixos")
    }

    /// Staged copy of the base configuration tree.
    pub fn staged_base(&self) -> PathBuf {
        let name = self
            .base_config_src
            .file_name()
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("twl-base"));
        self.target_etc().join(name)
    }

    /// Where NetworkManager looks for connection profiles in the new system.
    pub fn target_network_profiles(&self) -> PathBuf {
        self.target_etc().join("NetworkManager").join("system-connections")
    }
}

/// Waits after operations that make the kernel create or remove devices.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timings {
    /// After rewriting the partition table, before probing it.
    pub after_table: Duration,
    /// After `partprobe`, while udev replaces the old partition nodes.
    pub after_probe: Duration,
    /// After unlocking the encrypted volume.
    pub after_unlock: Duration,
    /// After formatting or unlocking a device.
    pub after_format: Duration,
    /// After mounting a filesystem.
    pub after_mount: Duration,
    /// Longest wait for an expected device node to appear.
    pub device_timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            after_table: Duration::from_secs(1),
            after_probe: Duration::from_secs(3),
            after_unlock: Duration::from_secs(1),
            after_format: Duration::from_secs(1),
            after_mount: Duration::from_secs(2),
            device_timeout: Duration::from_secs(3),
            poll_interval: Duration::from_millis(100),
        }
    }
}

impl Timings {
    /// No waiting at all.
    pub fn immediate() -> Self {
        Self {
            after_table: Duration::ZERO,
            after_probe: Duration::ZERO,
            after_unlock: Duration::ZERO,
            after_format: Duration::ZERO,
            after_mount: Duration::ZERO,
            device_timeout: Duration::ZERO,
            poll_interval: Duration::ZERO,
        }
    }
}

/// Everything a step may touch.
pub struct StepContext<'a> {
    pub settings: &'a Settings,
    pub updates: &'a UpdateSender,
    pub runner: &'a dyn CommandRunner,
    pub topology: &'a dyn TopologySource,
    pub paths: &'a InstallPaths,
    pub timings: &'a Timings,
}

impl StepContext<'_> {
    pub fn settle(&self, delay: Duration) {
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
    }

    /// Wait out `delay`, then poll until `path` exists or the device timeout
    /// passes.
    ///
    /// A node left over from an old partition table satisfies the poll at
    /// once, so the fixed delay always runs first. A missing node is reported
    /// as a warning, not an error; the next command that needs it reports the
    /// real failure.
    pub fn settle_device(&self, delay: Duration, path: &str) -> bool {
        self.settle(delay);
        self.wait_for_device(path)
    }

    /// Poll until `path` exists or the device timeout passes.
    pub fn wait_for_device(&self, path: &str) -> bool {
        let start = Instant::now();
        loop {
            if Path::new(path).exists() {
                debug!("{} appeared after {:?}", path, start.elapsed());
                return true;
            }
            if start.elapsed() >= self.timings.device_timeout {
                warn!(
                    "{} did not appear within {:?}; continuing",
                    path, self.timings.device_timeout
                );
                self.updates
                    .warn(format!("  {} did not appear; continuing\n", path));
                return false;
            }
            std::thread::sleep(self.timings.poll_interval.max(Duration::from_millis(1)));
        }
    }
}
