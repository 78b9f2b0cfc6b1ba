//! Core functionality shared by the daemon: configuration and retry policy.

mod config;
mod retry;

pub use config::{
    Config, CoordinationConfig, DaemonConfig, InnerApiConfig, MediaConfig, Platform,
    ServerlessConfig, WatcherConfig,
};
pub use retry::{retry_async, retry_async_if, RetryConfig, RetryResult};
