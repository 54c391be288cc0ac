//! Typed clients for the platform directory services.
//!
//! - [`cloud_controller`]: spaces, organizations and their member users
//! - [`uaa`]: user e-mail lookup with a client-credentials token

pub mod cloud_controller;
pub mod error;
pub mod types;
pub mod uaa;

#[cfg(any(test, feature = "test-utils"))]
pub mod fakes;

pub use cloud_controller::{CloudController, CloudControllerClient};
pub use error::DirectoryError;
pub use types::{Organization, Space};
pub use uaa::{UaaClient, UserDirectory};
