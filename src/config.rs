//! Installation configuration.
//!
//! A headless install reads an [`InstallConfig`] from JSON, validates it, and
//! resolves it against the discovered disks into [`Settings`].

use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::Path;
use tracing::info;

use crate::disk::Disk;
use crate::error::InstallError;
use crate::profiles::ProfileCatalogue;
use crate::secret::Secret;

/// Characters not allowed in usernames and hostnames.
pub const FORBIDDEN_NAME_CHARS: &str = "!@#$%^&*()=+[]{}~`\\| ?,./<>";

/// Characters that would break out of a quoted Nix string.
const FORBIDDEN_VALUE_CHARS: &[char] = &['"', '\n', '{', '}'];

/// Configuration file contents.
#[derive(Debug, Clone, Deserialize)]
pub struct InstallConfig {
    pub username: String,
    pub hostname: String,
    pub password: Secret,
    pub timezone: String,
    #[serde(default)]
    pub scrub_disk: bool,
    #[serde(default)]
    pub autologin: bool,
    /// Device path of the disk to install onto, e.g. `/dev/sda`.
    pub install_disk: String,
    /// nixos-hardware module to import, e.g. `<nixos-hardware/lenovo/thinkpad/x220>`.
    #[serde(default)]
    pub hardware_import: Option<String>,
    /// Catalogue name such as `lenovo-thinkpad-x220`, resolved into
    /// `hardware_import` by [`InstallConfig::apply_profile`].
    #[serde(default)]
    pub hardware_profile: Option<String>,
}

fn check_name(kind: &str, value: &str) -> Result<()> {
    if value.is_empty() {
        anyhow::bail!("{} must be specified", kind);
    }
    if let Some(c) = value.chars().find(|c| FORBIDDEN_NAME_CHARS.contains(*c)) {
        anyhow::bail!("{} {:?} contains forbidden character {:?}", kind, value, c);
    }
    Ok(())
}

fn check_import(import: &str) -> Result<()> {
    if import.contains(FORBIDDEN_VALUE_CHARS) {
        anyhow::bail!("Hardware import {:?} is not a valid import path", import);
    }
    Ok(())
}

impl InstallConfig {
    /// Load configuration from a JSON file.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read configuration from {:?}", path.as_ref()))?;
        let config: InstallConfig =
            serde_json::from_str(&content).context("Failed to parse configuration JSON")?;
        info!("Loaded configuration from {}", path.as_ref().display());
        Ok(config)
    }

    /// Check the fields an install cannot proceed without.
    pub fn validate(&self) -> Result<()> {
        check_name("Username", &self.username)?;
        check_name("Hostname", &self.hostname)?;
        if self.password.is_empty() {
            anyhow::bail!("Password must be specified");
        }
        if self.timezone.is_empty() {
            anyhow::bail!("Timezone must be specified");
        }
        if self.timezone.contains(FORBIDDEN_VALUE_CHARS) {
            anyhow::bail!("Timezone {:?} is not a valid timezone", self.timezone);
        }
        if self.install_disk.is_empty() {
            anyhow::bail!("Install disk must be specified");
        }
        if let Some(import) = &self.hardware_import {
            check_import(import)?;
        }
        if self.hardware_import.is_some() && self.hardware_profile.is_some() {
            anyhow::bail!("Only one of hardware_import and hardware_profile may be set");
        }
        Ok(())
    }

    /// Resolve `hardware_profile` against `catalogue` into `hardware_import`.
    pub fn apply_profile(&mut self, catalogue: &ProfileCatalogue) -> Result<()> {
        let Some(name) = self.hardware_profile.take() else {
            return Ok(());
        };
        let profile = catalogue
            .find(&name)
            .with_context(|| format!("Unknown hardware profile {:?}", name))?;
        check_import(&profile.import)?;
        info!("Using hardware profile {} ({})", name, profile.import);
        self.hardware_import = Some(profile.import.clone());
        Ok(())
    }

    /// Pick the configured disk out of `disks`.
    pub fn resolve(&self, disks: &[Disk]) -> crate::error::Result<Settings> {
        let disk = disks
            .iter()
            .find(|d| d.path == self.install_disk)
            .cloned()
            .ok_or_else(|| {
                InstallError::config(format!("Couldnt find install disk {:?}", self.install_disk))
            })?;

        Ok(Settings {
            username: self.username.clone(),
            hostname: self.hostname.clone(),
            password: self.password.clone(),
            timezone: self.timezone.clone(),
            disk,
            scrub: self.scrub_disk,
            autologin: self.autologin,
            hardware_import: self.hardware_import.clone().filter(|s| !s.is_empty()),
        })
    }
}

/// Everything a run needs to know about the target system.
#[derive(Debug, Clone)]
pub struct Settings {
    pub username: String,
    pub hostname: String,
    pub password: Secret,
    pub timezone: String,
    pub disk: Disk,
    pub scrub: bool,
    pub autologin: bool,
    pub hardware_import: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const VALID: &str = r#"{
        "username": "twl",
        "hostname": "twitchy",
        "password": "hunter2",
        "timezone": "America/Los_Angeles",
        "scrub_disk": false,
        "autologin": true,
        "install_disk": "/dev/sda"
    }"#;

    fn parse(json: &str) -> InstallConfig {
        serde_json::from_str(json).unwrap()
    }

    fn disks() -> Vec<Disk> {
        vec![
            Disk { path: "/dev/nvme0n1".into(), ..Disk::default() },
            Disk { path: "/dev/sda".into(), num_blocks: 1000, ..Disk::default() },
        ]
    }

    #[test]
    fn test_load_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(VALID.as_bytes()).unwrap();
        let config = InstallConfig::load_from_file(file.path()).unwrap();
        assert_eq!(config.username, "twl");
        assert!(config.autologin);
        assert_eq!(config.hardware_import, None);
        config.validate().unwrap();
    }

    #[test]
    fn test_load_missing_file() {
        let err = InstallConfig::load_from_file("/nonexistent/twlinst.json").unwrap_err();
        assert!(err.to_string().contains("Failed to read configuration"));
    }

    #[test]
    fn test_load_bad_json() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"{\"username\": ").unwrap();
        let err = InstallConfig::load_from_file(file.path()).unwrap_err();
        assert!(err.to_string().contains("Failed to parse configuration JSON"));
    }

    #[test]
    fn test_validate_rejects_forbidden_chars() {
        let mut config = parse(VALID);
        config.hostname = "my host".into();
        assert!(config.validate().is_err());

        let mut config = parse(VALID);
        config.username = "root/evil".into();
        assert!(config.validate().is_err());

        let mut config = parse(VALID);
        config.username.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_requires_password() {
        let mut config = parse(VALID);
        config.password = Secret::new("");
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("Password"));
    }

    #[test]
    fn test_resolve_picks_disk() {
        let settings = parse(VALID).resolve(&disks()).unwrap();
        assert_eq!(settings.disk.path, "/dev/sda");
        assert_eq!(settings.disk.num_blocks, 1000);
        assert!(settings.autologin);
        assert!(!settings.scrub);
    }

    #[test]
    fn test_resolve_missing_disk() {
        let mut config = parse(VALID);
        config.install_disk = "/dev/sdz".into();
        let err = config.resolve(&disks()).unwrap_err();
        assert!(matches!(err, InstallError::Config(_)));
        assert!(err.to_string().contains("/dev/sdz"));
    }

    #[test]
    fn test_validate_rejects_unquotable_timezone() {
        for tz in ["Europe/Berlin\"; evil = \"", "UTC\n", "{{Hostname}}"] {
            let mut config = parse(VALID);
            config.timezone = tz.into();
            let err = config.validate().unwrap_err();
            assert!(err.to_string().contains("Timezone"), "{:?}", tz);
        }
    }

    #[test]
    fn test_apply_profile_sets_import() {
        let catalogue = ProfileCatalogue::parse(
            r#"{"lenovo-thinkpad-x220": "<nixos-hardware/lenovo/thinkpad/x220>"}"#,
        )
        .unwrap();
        let mut config = parse(VALID);
        config.hardware_profile = Some("lenovo-thinkpad-x220".into());
        config.validate().unwrap();
        config.apply_profile(&catalogue).unwrap();

        assert_eq!(config.hardware_profile, None);
        let settings = config.resolve(&disks()).unwrap();
        assert_eq!(
            settings.hardware_import.as_deref(),
            Some("<nixos-hardware/lenovo/thinkpad/x220>")
        );
    }

    #[test]
    fn test_apply_unknown_profile() {
        let catalogue = ProfileCatalogue::parse("{}").unwrap();
        let mut config = parse(VALID);
        config.hardware_profile = Some("acme-rocket".into());
        let err = config.apply_profile(&catalogue).unwrap_err();
        assert!(err.to_string().contains("acme-rocket"));
    }

    #[test]
    fn test_profile_and_import_are_exclusive() {
        let mut config = parse(VALID);
        config.hardware_import = Some("<nixos-hardware/dell/inspiron>".into());
        config.hardware_profile = Some("dell-inspiron".into());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_hardware_import_optional() {
        let json = VALID.replace(
            "\"install_disk\"",
            "\"hardware_import\": \"<nixos-hardware/lenovo/thinkpad/x220>\", \"install_disk\"",
        );
        let settings = parse(&json).resolve(&disks()).unwrap();
        assert_eq!(
            settings.hardware_import.as_deref(),
            Some("<nixos-hardware/lenovo/thinkpad/x220>")
        );
    }
}
