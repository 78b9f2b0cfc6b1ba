//! Core plugin types.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::{PluginError, PluginResult};

/// File extension of plugin packages dropped into the storage directory.
pub const PACKAGE_EXTENSION: &str = "plugin";

/// Manifest file name written next to an unpacked plugin.
pub const MANIFEST_FILE: &str = "manifest.toml";

/// Archive file name written next to an unpacked plugin.
pub const ARCHIVE_FILE: &str = "package.bin";

/// Canonical plugin identity: `author/name:version@checksum`.
///
/// The author segment is optional. The checksum is the lowercase hex
/// SHA-256 of the package bytes, so two packages with the same name and
/// version but different content never share an identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PluginUniqueIdentifier(String);

impl PluginUniqueIdentifier {
    /// Build an identifier from its parts.
    pub fn new(
        author: Option<&str>,
        name: &str,
        version: &str,
        checksum: &str,
    ) -> PluginResult<Self> {
        let raw = match author {
            Some(author) if !author.is_empty() => format!("{author}/{name}:{version}@{checksum}"),
            _ => format!("{name}:{version}@{checksum}"),
        };
        raw.parse()
    }

    /// The canonical string form.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// `author/name` (or just `name`), without version and checksum.
    pub fn plugin_id(&self) -> &str {
        self.parts().0
    }

    /// Plugin author, if the identity carries one.
    pub fn author(&self) -> Option<&str> {
        self.plugin_id().split_once('/').map(|(author, _)| author)
    }

    /// Plugin name.
    pub fn name(&self) -> &str {
        let id = self.plugin_id();
        id.split_once('/').map_or(id, |(_, name)| name)
    }

    /// Plugin version.
    pub fn version(&self) -> &str {
        self.parts().1
    }

    /// Package checksum.
    pub fn checksum(&self) -> &str {
        self.parts().2
    }

    // Only called on validated identifiers, so every separator is present.
    fn parts(&self) -> (&str, &str, &str) {
        let (head, checksum) = self.0.rsplit_once('@').unwrap_or((&self.0, ""));
        let (plugin_id, version) = head.rsplit_once(':').unwrap_or((head, ""));
        (plugin_id, version, checksum)
    }
}

fn is_segment(value: &str) -> bool {
    !value.is_empty() && value.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

fn invalid(raw: &str, reason: &str) -> PluginError {
    PluginError::InvalidIdentifier { raw: raw.to_string(), reason: reason.to_string() }
}

impl FromStr for PluginUniqueIdentifier {
    type Err = PluginError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (head, checksum) = s.rsplit_once('@').ok_or_else(|| invalid(s, "missing checksum"))?;
        if checksum.is_empty()
            || !checksum.chars().all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c))
        {
            return Err(invalid(s, "checksum must be lowercase hex"));
        }

        let (plugin_id, version) =
            head.rsplit_once(':').ok_or_else(|| invalid(s, "missing version"))?;
        if version.is_empty()
            || !version.chars().all(|c| c.is_ascii_alphanumeric() || ".-+_".contains(c))
        {
            return Err(invalid(s, "malformed version"));
        }

        let valid_id = match plugin_id.split_once('/') {
            Some((author, name)) => is_segment(author) && is_segment(name),
            None => is_segment(plugin_id),
        };
        if !valid_id {
            return Err(invalid(s, "malformed author or name"));
        }

        Ok(Self(s.to_string()))
    }
}

impl TryFrom<String> for PluginUniqueIdentifier {
    type Error = PluginError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<PluginUniqueIdentifier> for String {
    fn from(value: PluginUniqueIdentifier) -> Self {
        value.0
    }
}

impl AsRef<str> for PluginUniqueIdentifier {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PluginUniqueIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lowercase hex SHA-256 of a package.
pub fn package_checksum(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Kind of backend a plugin lifetime runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeKind {
    /// Worker process on a daemon node.
    Local,
    /// Function on an external execution platform.
    Serverless,
    /// Routing handle to a plugin hosted by another node.
    Remote,
}

impl RuntimeKind {
    /// Get the display name for this runtime kind.
    pub fn display_name(&self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Serverless => "serverless",
            Self::Remote => "remote",
        }
    }
}

impl fmt::Display for RuntimeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.display_name())
    }
}
