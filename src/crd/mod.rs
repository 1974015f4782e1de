//! Custom Resource Definitions
//!
//! The App CRD is the primary resource watched by the controller.

mod app;
pub mod types;


pub use app::{is_dns1123_subdomain, App, AppSpec, AppStatus, SpecValidationError};
pub use types::*;
