//! Plugin manifest, package descriptor and package decoding.
//!
//! A manifest is a TOML document describing a plugin's metadata, how to run
//! it as a local worker and which resources a serverless deployment needs.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::{package_checksum, PluginError, PluginResult, PluginUniqueIdentifier};

/// Plugin manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginManifest {
    /// Plugin metadata.
    pub plugin: PluginMetadata,
    /// Local worker launch settings.
    #[serde(default)]
    pub runner: RunnerConfig,
    /// Resource requirements.
    #[serde(default)]
    pub resources: ResourceConfig,
}

/// Plugin metadata section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginMetadata {
    /// Plugin name.
    pub name: String,
    /// Plugin version.
    pub version: String,
    /// Plugin author.
    #[serde(default)]
    pub author: Option<String>,
    /// Plugin description.
    #[serde(default)]
    pub description: Option<String>,
    /// Asset name of the plugin icon.
    #[serde(default)]
    pub icon: Option<String>,
}

/// How to launch the plugin as a worker process.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunnerConfig {
    /// Program to execute.
    #[serde(default)]
    pub entrypoint: String,
    /// Program arguments.
    #[serde(default)]
    pub args: Vec<String>,
    /// Extra environment variables.
    #[serde(default)]
    pub env: HashMap<String, String>,
}

/// Resources requested for the plugin backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceConfig {
    /// Memory in MiB.
    #[serde(default = "default_memory")]
    pub memory_mb: u32,
    /// Per-invocation timeout in seconds.
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

fn default_memory() -> u32 {
    256
}

fn default_timeout() -> u64 {
    120
}

impl Default for ResourceConfig {
    fn default() -> Self {
        Self { memory_mb: default_memory(), timeout_secs: default_timeout() }
    }
}

impl PluginManifest {
    /// Parse a manifest from TOML string.
    pub fn from_toml(content: &str) -> PluginResult<Self> {
        toml::from_str(content).map_err(|e| PluginError::InvalidPackage(e.to_string()))
    }

    /// Serialize to TOML string.
    pub fn to_toml(&self) -> PluginResult<String> {
        toml::to_string_pretty(self).map_err(|e| PluginError::InvalidPackage(e.to_string()))
    }

    /// Validate the manifest.
    pub fn validate(&self) -> PluginResult<()> {
        let valid_segment = |value: &str| {
            !value.is_empty()
                && value.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        };

        if !valid_segment(&self.plugin.name) {
            return Err(PluginError::InvalidPackage(
                "Plugin name must be non-empty and contain only alphanumeric characters, hyphens, and underscores"
                    .to_string(),
            ));
        }

        if let Some(author) = &self.plugin.author {
            if !valid_segment(author) {
                return Err(PluginError::InvalidPackage(format!("Invalid author '{author}'")));
            }
        }

        if self.plugin.version.is_empty() {
            return Err(PluginError::InvalidPackage("Plugin version is required".to_string()));
        }

        if self.resources.memory_mb == 0 {
            return Err(PluginError::InvalidPackage("memory_mb must be positive".to_string()));
        }

        Ok(())
    }
}

/// A named binary asset shipped in a package (icons, images).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageAsset {
    pub name: String,
    pub bytes: Vec<u8>,
}

impl PackageAsset {
    /// File extension of the asset name, if any.
    pub fn extension(&self) -> Option<&str> {
        self.name.rsplit_once('.').map(|(_, ext)| ext).filter(|ext| !ext.is_empty())
    }
}

/// A decoded, validated plugin package.
#[derive(Debug, Clone)]
pub struct PackageDescriptor {
    /// Identity derived from manifest and content.
    pub identity: PluginUniqueIdentifier,
    /// Parsed manifest.
    pub manifest: PluginManifest,
    /// Declared package size in bytes.
    pub size: u64,
    /// Raw package bytes.
    pub archive: Arc<[u8]>,
    /// Media shipped with the package.
    pub assets: Vec<PackageAsset>,
}

impl PackageDescriptor {
    /// Build a descriptor, deriving the identity from the manifest and the
    /// checksum of `archive`.
    pub fn from_manifest(manifest: PluginManifest, archive: Vec<u8>) -> PluginResult<Self> {
        manifest.validate()?;

        let identity = PluginUniqueIdentifier::new(
            manifest.plugin.author.as_deref(),
            &manifest.plugin.name,
            &manifest.plugin.version,
            &package_checksum(&archive),
        )?;

        Ok(Self {
            identity,
            manifest,
            size: archive.len() as u64,
            archive: Arc::from(archive),
            assets: Vec::new(),
        })
    }

    /// Attach media assets.
    pub fn with_assets(mut self, assets: Vec<PackageAsset>) -> Self {
        self.assets = assets;
        self
    }
}

/// Turns raw package bytes into a validated descriptor.
///
/// Decode failures are never retried.
pub trait PackageDecoder: Send + Sync {
    fn decode(&self, raw: &[u8]) -> PluginResult<PackageDescriptor>;
}

/// Decoder for manifest-only packages: the package is the TOML manifest.
#[derive(Debug, Clone, Copy, Default)]
pub struct ManifestDecoder;

impl PackageDecoder for ManifestDecoder {
    fn decode(&self, raw: &[u8]) -> PluginResult<PackageDescriptor> {
        let content = std::str::from_utf8(raw)
            .map_err(|_| PluginError::InvalidPackage("manifest is not valid UTF-8".to_string()))?;
        let manifest = PluginManifest::from_toml(content)?;
        PackageDescriptor::from_manifest(manifest, raw.to_vec())
    }
}
