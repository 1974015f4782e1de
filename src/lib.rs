//! groupkind-controller: level-triggered reconciliation for App resources
//!
//! An `App` declares a set of dependent Deployments, Services and
//! Ingresses. The controller watches Apps and their dependents, and
//! creates or corrects dependents until the cluster matches what each
//! App declares.

pub mod controller;
pub mod crd;
pub mod error;
pub mod registry;
pub mod store;

#[cfg(feature = "rest-api")]
pub mod rest_api;

pub use crate::error::{Error, Result};
