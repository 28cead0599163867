//! Strata Store - OCI/Docker Image Store
//!
//! Pulls images from v2 registries and materializes their layered root
//! filesystems: content-addressed blob caching, schema-1/schema-2
//! manifest normalization, whiteout-aware layer extraction, and overlay
//! mount composition.
//!
//! # Architecture
//!
//! ```text
//! image string
//!   └─> reference  ── parse ──> (registry, repository, reference)
//!         └─> registry ── manifest GET (content-type negotiated)
//!               └─> manifest ── normalize schema-1 / schema-2 / index
//!                     └─> blob  ── verified, atomic blob cache
//!                           └─> unpack ── per-layer trees + whiteouts
//!                                 └─> mount ── short links + overlay
//! ```

pub mod blob;
pub mod config;
pub mod digest;
pub mod manifest;
pub mod mount;
pub mod reference;
pub mod registry;
pub mod store;
pub mod unpack;

// Re-export commonly used types
pub use blob::BlobCache;
pub use config::{ContainerConfig, HealthConfig, ImageConfig};
pub use digest::{Digest, DigestVerifier};
pub use manifest::{Descriptor, Manifest};
pub use reference::ImageReference;
pub use registry::RegistryClient;
pub use store::{ImageStore, DEFAULT_PARALLELISM};
pub use unpack::{unpack_layer, UnpackOptions};
