//! Upstream vault access: trust-store management, CA-blob validation, and
//! the HTTP client factory the pipeline and scheduler use to talk to
//! configured vaults.

pub mod client;
pub mod error;
pub mod trust;
pub mod types;
pub mod validation;

pub use client::{ClientFactory, CyberArkClient, VaultSession};
pub use error::{UpstreamError, UpstreamResult};
pub use trust::{CaSource, TrustSnapshot, TrustStore};
pub use types::UpstreamPage;
pub use validation::validate_ca_blob;
