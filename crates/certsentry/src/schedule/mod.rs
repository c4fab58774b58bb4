//! Maintenance-window scheduling
//!
//! Disk writes and container restarts are confined to an
//! administrator-defined recurring time window. This module owns the window
//! math and the single-flight job machinery that defers work until the
//! window opens.
//!
//! # Architecture
//!
//! - [`MaintenanceWindow`] - pure time-of-day/weekday math, including
//!   windows that span midnight
//! - [`Scheduler`] - owns the single pending job slot; scheduling a new job
//!   supersedes (cancels) the previous one, and all sleeps are cancellable

mod scheduler;
mod window;

pub use scheduler::{JobKind, Scheduler};
pub use window::MaintenanceWindow;
