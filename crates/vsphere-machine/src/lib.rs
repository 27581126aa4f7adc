//! vSphere machine actuator
//!
//! Reconciles Machine resources against vCenter: clones VMs from templates,
//! powers them on, reflects their state back into the Machine and tears them
//! down again once the Node has released its volumes.
//!
//! Related crates:
//! - `machine-api-common`: CRDs, feature gates, events and telemetry
//! - `vsphere-client`: vCenter SOAP/REST clients, sessions and the simulator

#![deny(missing_docs)]

pub mod actuator;
pub mod client;
pub mod cloud_config;
pub mod clone;
pub mod controller;
pub mod drain;
pub mod error;
pub mod ipam;
pub mod network;
pub mod reconciler;
pub mod scope;
pub mod status;
pub mod task;
pub mod vm;
pub mod vm_group;

#[cfg(test)]
mod test_support;

pub use actuator::Actuator;
pub use client::{KubeClient, KubeClientImpl};
pub use controller::{error_policy, reconcile, Context, ContextBuilder};
pub use error::{Error, Result};
