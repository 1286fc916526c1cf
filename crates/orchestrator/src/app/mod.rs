//! Application module
//!
//! Builds the services of the daemon, runs their background tasks and
//! shuts them down on SIGINT/SIGTERM.

pub mod builder;
pub mod core;
pub mod services;
pub mod tasks;

pub use builder::ApplicationBuilder;
pub use self::core::Application;
pub use services::ApplicationServices;
