//! Plugin control plane.
//!
//! # Architecture
//!
//! A plugin is identified by a [`PluginUniqueIdentifier`] derived from its
//! manifest and package checksum. Packages are decoded into a
//! [`PackageDescriptor`], installed through the [`InstallPipeline`] and
//! tracked by the [`PluginRegistry`] as live [`PluginLifetime`] handles.
//!
//! Every install and invocation reports progress as a stream of
//! [`PluginUniversalEvent`]s terminated by a `session/end` event.

mod error;
mod event;
mod install;
mod lifetime;
mod manifest;
mod registry;
mod types;

pub use error::{BackendError, ErrorCategory, PluginError, PluginResult};
pub use event::{
    broadcast_stream, EventKind, EventStream, LogLevel, PluginLogEvent, PluginUniversalEvent,
    ProgressSink, SessionMessage, SessionMessageType,
};
pub use install::{InstallOutcome, InstallPipeline, InstallSettings};
pub use lifetime::{InvokeRequest, PluginLifetime, RunningLocation};
pub use manifest::{
    ManifestDecoder, PackageAsset, PackageDecoder, PackageDescriptor, PluginManifest,
    PluginMetadata, ResourceConfig, RunnerConfig,
};
pub use registry::{PluginRegistry, RegistryEntry, Resolved};
pub use types::{
    package_checksum, PluginUniqueIdentifier, RuntimeKind, ARCHIVE_FILE, MANIFEST_FILE,
    PACKAGE_EXTENSION,
};
