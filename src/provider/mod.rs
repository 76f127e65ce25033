//! C1 — Provider Client Facade.
//!
//! Typed operations over the provider VM API with retries, rate limiting,
//! and token refresh handled internally; callers only ever see the
//! `ProviderError` taxonomy.

mod client;
mod error;
mod rate_limit;
mod token;
mod types;

pub use client::{ProviderClient, VmApi};
pub use error::ProviderError;
pub use types::{CreateVmRequest, CreateVmResponse, Credentials, K8sNodeGroup, K8sOffer, Vm};

#[cfg(test)]
pub use client::fake::FakeVmApi;
