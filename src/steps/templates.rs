//! Generated NixOS configuration files.
//!
//! Templates use `{{Name}}` placeholders. Every placeholder a template
//! mentions must be supplied; rendering fails otherwise so a half-filled
//! configuration is never written to the new system.

use crate::error::{InstallError, Result};

pub const FILESYSTEMS_TEMPLATE: &str = r#"
{config, pkgs, boot, lib, ...}:
	{
		boot.initrd.luks.devices = {
			"{{MapperName}}" = {
				device = "/dev/disk/by-uuid/{{LuksUUID}}";
			};
		};

		fileSystems = {
			"/" = {
				device = "/dev/disk/by-uuid/{{Ext4UUID}}";
				fsType = "ext4";
			};
			"/boot" = {
				device = "/dev/disk/by-uuid/{{BootUUID}}";
				fsType = "vfat";
			};
		};
	}
"#;

pub const CONFIGURATION_TEMPLATE: &str = r#"
{ lib, ... }:
{
	imports = [
		/etc/twl-base
		./filesystems.nix
{{HardwareImport}}	];

	users.users.{{Username}} = {
		isNormalUser = true;
		extraGroups = [ "wheel" "networkmanager" "video" ];
		hashedPassword = "{{PasswordHash}}";
	};

	time.timeZone = "{{Timezone}}";
	networking.hostName = "{{Hostname}}";
{{AutologinBlock}}}
"#;

const AUTOLOGIN_BLOCK: &str = r#"
	# Automatically login on startup.
	services.getty.autologinUser = "{{Username}}";
	system.activationScripts.etc = lib.stringAfter [ "users" "groups" ]
		''
			mkdir -pv /home/{{Username}}/.config/sway
			ln -s /etc/twl-base/resources/sway.config /home/{{Username}}/.config/sway/config || true

			if [ ! -f /home/{{Username}}/.bashrc ]; then
			echo 'if [[ $(tty) == "/dev/tty1" ]]; then' >> /home/{{Username}}/.bash_login
			echo '  sleep 2 && startsway' >> /home/{{Username}}/.bash_login
			echo 'fi' >> /home/{{Username}}/.bash_login
			fi
		'';
"#;

/// Substitute `{{key}}` placeholders in one pass.
///
/// Substituted values are copied verbatim and never scanned for further
/// placeholders.
pub fn render(template: &str, values: &[(&str, &str)]) -> Result<String> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find("}}") else {
            return Err(InstallError::general(format!(
                "unterminated template placeholder {{{{{}",
                after
            )));
        };
        let name = &after[..end];
        let value = values
            .iter()
            .find(|(key, _)| *key == name)
            .map(|(_, value)| *value)
            .ok_or_else(|| {
                InstallError::general(format!(
                    "template placeholder {{{{{}}}}} has no value",
                    name
                ))
            })?;
        out.push_str(value);
        rest = &after[end + 2..];
    }
    out.push_str(rest);
    Ok(out)
}

/// UUIDs referenced by `filesystems.nix`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilesystemIds {
    pub boot_uuid: String,
    pub luks_uuid: String,
    pub ext4_uuid: String,
}

pub fn filesystems_nix(ids: &FilesystemIds, mapper_name: &str) -> Result<String> {
    render(
        FILESYSTEMS_TEMPLATE,
        &[
            ("MapperName", mapper_name),
            ("LuksUUID", &ids.luks_uuid),
            ("Ext4UUID", &ids.ext4_uuid),
            ("BootUUID", &ids.boot_uuid),
        ],
    )
}

/// Values for `configuration.nix`.
#[derive(Debug, Clone)]
pub struct SystemConfig<'a> {
    pub username: &'a str,
    pub hostname: &'a str,
    pub timezone: &'a str,
    pub password_hash: &'a str,
    pub autologin: bool,
    pub hardware_import: Option<&'a str>,
}

pub fn configuration_nix(cfg: &SystemConfig<'_>) -> Result<String> {
    let hardware = cfg
        .hardware_import
        .map(|import| format!("\t\t{}\n", import))
        .unwrap_or_default();
    let autologin = if cfg.autologin {
        render(AUTOLOGIN_BLOCK, &[("Username", cfg.username)])?
    } else {
        String::new()
    };

    render(
        CONFIGURATION_TEMPLATE,
        &[
            ("HardwareImport", &hardware),
            ("AutologinBlock", &autologin),
            ("Username", cfg.username),
            ("PasswordHash", cfg.password_hash),
            ("Timezone", cfg.timezone),
            ("Hostname", cfg.hostname),
        ],
    )
}
