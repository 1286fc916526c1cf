//! Host-side services: logging, the local catalog and recipe builds, and
//! file watching.

pub mod catalog;
pub mod file_watcher;
pub mod kubeconfig;
pub mod logging;
pub mod recipes;

pub use catalog::LocalCatalog;
pub use file_watcher::FileWatcher;
pub use recipes::LocalRecipeManager;
