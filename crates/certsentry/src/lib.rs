//! Certsentry library
//!
//! An unattended agent that keeps a TLS key/certificate pair synchronized
//! from a remote issuing service onto local storage, serves the certificate
//! live over TLS, accepts authenticated encrypted pushes of new material,
//! and coordinates dependent container restarts.
//!
//! Core components:
//!
//! - **Certificate store**: thread-safe holder of the live key/cert pair,
//!   consulted on every TLS handshake
//! - **Reconciliation engine**: writes only missing or stale files to disk,
//!   tolerating partial failure
//! - **Scheduler**: maintenance-window aware, single-flight jobs with
//!   supersession and cancellable sleeps
//! - **Push receiver**: AES-256-GCM encrypted certificate installs over HTTPS
//! - **Container notifier**: restart/stop of dependent containers after a
//!   successful write

// ============================================================================
// Module Declarations
// ============================================================================

pub mod config;
pub mod containers;
pub mod fetch;
pub mod reconcile;
pub mod schedule;
pub mod server;
pub mod store;

// ============================================================================
// Public API Re-exports
// ============================================================================

// Configuration
pub use config::{Config, ConfigError, PfxFileConfig};

// Certificate store
pub use store::{CertificateStore, LiveCertResolver, StoreError};

// Disk reconciliation
pub use reconcile::{OpensslPfxEncoder, PfxEncoder, PfxVariant, ReconciliationEngine, StorageLayout};

// Scheduling
pub use schedule::{JobKind, MaintenanceWindow, Scheduler};

// Remote fetch
pub use fetch::{FetchError, RemoteFetcher};

// Served endpoint
pub use server::{HttpsServer, PushReceiver};

// Container lifecycle
pub use containers::{ContainerNotifier, ContainerRuntime, DockerRuntime, LifecycleAction};
