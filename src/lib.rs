//! # plugind
//!
//! Control plane of a plugin-hosting daemon.
//!
//! plugind accepts plugin packages, starts them on a local worker process or
//! a serverless function platform, and keeps a cluster of daemon nodes in
//! agreement about where each plugin runs, so any node can route a request to
//! any plugin.
//!
//! ## Features
//!
//! - **Two-tier lookup**: local registry first, shared running-location mapping second
//! - **Distributed start locks**: one install per plugin across the whole cluster
//! - **Pluggable runtimes**: local processes or serverless functions behind one trait
//! - **Cluster sync**: watchers that resubscribe and resync after every disconnect
//! - **Asset cache**: byte-bounded LRU in front of content-addressed media storage
//!
//! ## Quick Start
//!
//! ```bash
//! # Run a node
//! plugind serve
//!
//! # Install one package and print its progress events
//! plugind install weather.plugin
//! ```

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
// Allow common patterns that are intentional in this codebase
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::similar_names)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_const_for_fn)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::manual_let_else)]
#![allow(clippy::return_self_not_must_use)]
#![allow(clippy::option_if_let_else)]
#![allow(clippy::significant_drop_tightening)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::items_after_statements)]
#![allow(clippy::redundant_closure_for_method_calls)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::future_not_send)]

pub mod cluster;
pub mod core;
pub mod daemon;
pub mod media;
pub mod plugin;
pub mod runtime;

// Re-export commonly used types
pub use core::Config;
pub use daemon::{BackgroundTasks, DaemonContext};
pub use plugin::{
    EventStream, InstallOutcome, InvokeRequest, PluginError, PluginResult, PluginUniqueIdentifier,
    PluginUniversalEvent,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = "plugind";
