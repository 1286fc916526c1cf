pub mod api;
pub mod app;
pub mod config;
pub mod core;
pub mod domain;
pub mod infrastructure;
pub mod platform;

#[cfg(test)]
mod testing;

// Re-export main modules
pub use domain::application;
pub use domain::inference;
pub use domain::instructlab;
pub use domain::monitoring;
pub use domain::registry;
pub use infrastructure::catalog;
pub use infrastructure::logging;
pub use platform::container;
pub use platform::k8s;
