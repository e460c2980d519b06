//! Shared building blocks for the workspace-instance services.
//!
//! Holds the error type used for rejected user input and the validation
//! routines that guard every value which ends up interpolated into a remote
//! boot script or a firewall rule.

pub mod error;
pub mod validation;

pub use error::{Result, VmError};
