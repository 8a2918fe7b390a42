//! Mod table served by `list_mods` / `get_mod_manifest`.
//!
//! Mods are registered statically as [`ModInfo`]. A richer [`ModManifest`]
//! may be added for any mod; when present, its fields win over the ones
//! derived from the registration.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::NetworkError;

/// A statically registered mod.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModInfo {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
    /// Module path of the implementation.
    pub implementation: String,
}

impl ModInfo {
    pub fn new(name: impl Into<String>, implementation: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: "0.1.0".to_string(),
            description: String::new(),
            capabilities: Vec::new(),
            implementation: implementation.into(),
        }
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_capabilities<I, S>(mut self, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.capabilities = capabilities.into_iter().map(Into::into).collect();
        self
    }
}

/// Declarative description of a mod. Missing fields fall back to the
/// registered [`ModInfo`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModManifest {
    pub mod_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capabilities: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub requires_mods: Vec<String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub default_config: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub implementation: Option<String>,
}

impl ModManifest {
    /// The manifest implied by a registration alone.
    pub fn derived_from(info: &ModInfo) -> Self {
        Self {
            mod_name: info.name.clone(),
            version: Some(info.version.clone()),
            description: Some(info.description.clone()),
            capabilities: Some(info.capabilities.clone()),
            requires_mods: Vec::new(),
            default_config: Map::new(),
            implementation: Some(info.implementation.clone()),
        }
    }

    /// Fill the gaps in `self` from `base`.
    fn over(mut self, base: &ModManifest) -> Self {
        self.version = self.version.or_else(|| base.version.clone());
        self.description = self.description.or_else(|| base.description.clone());
        self.capabilities = self.capabilities.or_else(|| base.capabilities.clone());
        self.implementation = self.implementation.or_else(|| base.implementation.clone());
        self
    }
}

#[derive(Debug, Default)]
pub struct ModRegistry {
    mods: BTreeMap<String, ModInfo>,
    manifests: BTreeMap<String, ModManifest>,
}

impl ModRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a mod by name.
    pub fn register_mod(&mut self, info: ModInfo) {
        tracing::debug!("Registered mod '{}' ({})", info.name, info.implementation);
        self.mods.insert(info.name.clone(), info);
    }

    pub fn register_manifest(&mut self, manifest: ModManifest) {
        self.manifests.insert(manifest.mod_name.clone(), manifest);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.mods.contains_key(name) || self.manifests.contains_key(name)
    }

    /// Every known mod name, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .mods
            .keys()
            .chain(self.manifests.keys())
            .cloned()
            .collect();
        names.sort();
        names.dedup();
        names
    }

    /// The effective manifest for `name`.
    pub fn get_mod_manifest(&self, name: &str) -> Result<ModManifest, NetworkError> {
        let derived = self.mods.get(name).map(ModManifest::derived_from);
        match (self.manifests.get(name).cloned(), derived) {
            (Some(manifest), Some(derived)) => Ok(manifest.over(&derived)),
            (Some(manifest), None) => Ok(manifest),
            (None, Some(derived)) => Ok(derived),
            (None, None) => Err(NetworkError::Protocol(format!("Unknown mod '{name}'"))),
        }
    }

    /// Every mod with manifest fields merged over its registration.
    pub fn list_mods(&self) -> Vec<ModManifest> {
        self.names()
            .iter()
            .filter_map(|name| self.get_mod_manifest(name).ok())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.names().len()
    }

    pub fn is_empty(&self) -> bool {
        self.mods.is_empty() && self.manifests.is_empty()
    }
}
