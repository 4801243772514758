//! twlinst library
//!
//! Core of the TwitchyLinux installer: disk discovery, the marker transform
//! engine for staged configuration, streamed command execution and the step
//! pipeline that turns a blank disk into an encrypted NixOS system.

pub mod cli;
pub mod command;
pub mod config;
pub mod console;
pub mod disk;
pub mod error;
pub mod markers;
pub mod process_guard;
pub mod profiles;
pub mod progress;
pub mod run;
pub mod run_state;
pub mod secret;
pub mod steps;

// Re-export main types for convenience
pub use command::{CommandRunner, Invocation, OutputMode, SystemRunner};
pub use config::{InstallConfig, Settings};
pub use disk::{Disk, SystemTopology, TopologySource, byte_count_decimal, discover};
pub use error::{InstallError, Result};
pub use process_guard::{ChildRegistry, CommandProcessGroup, ProcessGuard};
pub use progress::{MsgLevel, Stage, Update, UpdateSender, update_channel};
pub use run::{Run, RunEnv, RunHandle, RunOutcome};
pub use run_state::{RunPhase, RunTracker, RunTransitionError};
pub use secret::Secret;
pub use steps::{InstallPaths, StepKind, Timings};
