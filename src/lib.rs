//! LVM Backup Kubernetes Operator
//!
//! Node-local operator for LVM-backed volumes: capacity-checked volume
//! creation, resizing and removal, plus Backup and Restore resources executed
//! by external scripts and tracked by a reconciliation loop on every node.

pub mod adapters;
pub mod config;
pub mod controllers;
pub mod crd;
pub mod error;
pub mod lvm;
pub mod metrics;
pub mod orchestrator;
pub mod reconcilers;
pub mod script;

pub use error::{Error, Result};
