//! Plugin media: icons and other assets shipped in packages.

mod cache;
mod manager;

pub use cache::AssetCache;
pub use manager::MediaManager;

use thiserror::Error;

/// Asset cache failures.
#[derive(Debug, Error)]
pub enum CacheError {
    /// The asset alone exceeds the cache capacity.
    #[error("Asset of {size} bytes exceeds cache capacity of {capacity} bytes")]
    AssetTooLarge { size: u64, capacity: u64 },

    /// The asset id is not a plain file name.
    #[error("Invalid asset id '{0}'")]
    InvalidAssetId(String),
}
