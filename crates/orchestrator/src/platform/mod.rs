//! Adapters to the runtimes: container engine, Kubernetes cluster, and the
//! provider strategies built on top of them.

pub mod container;
pub mod k8s;
pub mod providers;
