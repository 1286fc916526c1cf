//! Reconciliation engines and the registries aggregating them.

pub mod application;
pub mod inference;
pub mod instructlab;
pub mod monitoring;
pub mod registry;
