//! Watchtower CRD Definitions
//!
//! Kubernetes Custom Resource Definitions for the watchtower controller.

pub mod watcher;

pub use watcher::*;
