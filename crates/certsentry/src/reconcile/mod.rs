//! Disk reconciliation
//!
//! Compares the in-memory certificate material against the files on disk
//! and writes only what is missing or stale, tracking partial failure so
//! the scheduler can re-arm.
//!
//! # Architecture
//!
//! - [`ReconciliationEngine`] - the per-file write decisions and container
//!   notification pass
//! - [`PfxEncoder`] - opaque PKCS12 encoding capability (modern and legacy
//!   variants) behind a narrow trait

mod engine;
mod pfx;

pub use engine::{ReconciliationEngine, StorageLayout, CERT_CHAIN_FILENAME, KEY_PEM_FILENAME};
pub use pfx::{OpensslPfxEncoder, PfxEncoder, PfxError, PfxVariant};
