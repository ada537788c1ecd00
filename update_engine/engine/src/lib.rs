//! Update Engine Core Library
//!
//! Protocol state and algorithms for a Director, a Primary and its
//! Secondaries: dual-repository consensus, nonce-bound ECU manifests,
//! registration and confined downloads.

pub mod audit;
pub mod config;
pub mod consensus;
pub mod crypto;
pub mod director;
pub mod error;
pub mod jail;
pub mod logging;
pub mod manifest;
pub mod nonce;
pub mod orchestrator;
pub mod registry;
pub mod repository;
pub mod rpc;
pub mod timeserver;
pub mod types;

pub use error::UpdateError;

#[cfg(test)]
mod tests;
