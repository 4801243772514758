use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::profiles::DEFAULT_CATALOGUE;

/// twlinst - install TwitchyLinux onto an encrypted disk
#[derive(Parser, Debug)]
#[command(name = "twlinst")]
#[command(about = "Partitions, encrypts and provisions a NixOS-based system onto a target disk")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Install non-interactively using a configuration file
    Install {
        /// Path to the JSON configuration file
        #[arg(short, long)]
        config: PathBuf,

        /// Where to mount the new system while installing
        #[arg(long, default_value = "/mnt")]
        mount_root: PathBuf,

        /// Catalogue used to resolve `hardware_profile`
        #[arg(long, default_value = DEFAULT_CATALOGUE)]
        profiles: PathBuf,
    },
    /// Validate a configuration file
    Validate {
        /// Path to configuration file to validate
        config: PathBuf,
    },
    /// List disks available as install targets
    Disks,
    /// List hardware profiles that can be imported
    Profiles {
        /// Hardware profile catalogue
        #[arg(short, long, default_value = DEFAULT_CATALOGUE)]
        file: PathBuf,
    },
}

impl Cli {
    pub fn parse_args() -> Self {
        Self::parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_install_args() {
        let cli = Cli::try_parse_from(["twlinst", "install", "--config", "/tmp/c.json"]).unwrap();
        match cli.command {
            Commands::Install {
                config,
                mount_root,
                profiles,
            } => {
                assert_eq!(config, PathBuf::from("/tmp/c.json"));
                assert_eq!(mount_root, PathBuf::from("/mnt"));
                assert_eq!(profiles, PathBuf::from(DEFAULT_CATALOGUE));
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_install_requires_config() {
        assert!(Cli::try_parse_from(["twlinst", "install"]).is_err());
    }

    #[test]
    fn test_profiles_default_file() {
        let cli = Cli::try_parse_from(["twlinst", "profiles"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Profiles { ref file } if file == &PathBuf::from(DEFAULT_CATALOGUE)
        ));
    }
}
