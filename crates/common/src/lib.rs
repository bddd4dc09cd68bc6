//! avidfp-common
//!
//! Shared building blocks for the AVID-FP object store:
//! - `fingerprint`: seeded 64-bit polynomial hash (Horner's rule)
//! - `erasure`: Reed-Solomon (m, n) split / reconstruct
//! - `fpcc`: fingerprinted cross-checksum construction and verification
//! - `config`: TOML configuration with env and CLI layering

pub mod config;
pub mod erasure;
pub mod fingerprint;
pub mod fpcc;

pub use config::Config;
pub use erasure::{ErasureCodec, ErasureError};
pub use fingerprint::Fingerprint;
