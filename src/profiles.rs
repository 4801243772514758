//! Hardware profile catalogue.
//!
//! The live image ships a JSON object mapping profile names such as
//! `lenovo-thinkpad-x220` to nixos-hardware import paths. Profiles are shown
//! grouped by the vendor prefix before the first `-`. Names starting with `_`
//! are internal and hidden.

use anyhow::{Context, Result};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::Path;

/// Default catalogue location on the live image.
pub const DEFAULT_CATALOGUE: &str = "/nixos-hardware-info.json";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HardwareProfile {
    /// Full catalogue key.
    pub name: String,
    /// Name with the vendor prefix removed, for display under its group.
    pub model: String,
    /// Import path to place in the generated configuration.
    pub import: String,
}

/// Profiles grouped by vendor. Profiles without a vendor prefix sit under
/// [`ProfileCatalogue::ungrouped`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProfileCatalogue {
    pub vendors: BTreeMap<String, Vec<HardwareProfile>>,
    pub ungrouped: Vec<HardwareProfile>,
}

impl ProfileCatalogue {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read hardware profiles from {:?}", path.as_ref()))?;
        Self::parse(&content)
    }

    pub fn parse(json: &str) -> Result<Self> {
        let raw: HashMap<String, String> =
            serde_json::from_str(json).context("Failed to parse hardware profile JSON")?;

        let mut catalogue = ProfileCatalogue::default();
        for (name, import) in raw {
            if name.starts_with('_') {
                continue;
            }
            let split = name
                .split_once('-')
                .filter(|(vendor, _)| !vendor.is_empty())
                .map(|(vendor, model)| (vendor.to_string(), model.to_string()));
            match split {
                Some((vendor, model)) => {
                    catalogue
                        .vendors
                        .entry(vendor)
                        .or_default()
                        .push(HardwareProfile {
                            name,
                            model,
                            import,
                        });
                }
                None => catalogue.ungrouped.push(HardwareProfile {
                    model: name.clone(),
                    name,
                    import,
                }),
            }
        }

        for profiles in catalogue.vendors.values_mut() {
            profiles.sort_by(|a, b| a.name.cmp(&b.name));
        }
        catalogue.ungrouped.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(catalogue)
    }

    pub fn len(&self) -> usize {
        self.vendors.values().map(Vec::len).sum::<usize>() + self.ungrouped.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Look up a profile by its full name.
    pub fn find(&self, name: &str) -> Option<&HardwareProfile> {
        self.vendors
            .values()
            .flatten()
            .chain(self.ungrouped.iter())
            .find(|p| p.name == name)
    }
}
