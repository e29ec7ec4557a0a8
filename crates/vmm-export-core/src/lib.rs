//! vmm-export Core Library
//!
//! This crate exports Synology Virtual Machine Manager guests to OVA files in
//! bulk, through the DSM Web API.
//!
//! # Overview
//!
//! Each selected guest goes through the same workflow: delete the previous export,
//! power off, export, and power back on if it was running. A small worker pool runs
//! several workflows at once. Workflows never poll DSM themselves: a single refresh
//! loop re-reads guest and export-task state every few seconds and wakes everyone
//! waiting on a state change.
//!
//! # Modules
//!
//! - [`error`] - Error types and Result alias
//! - [`codes`] - DSM error-code messages
//! - [`transport`] - HTTP transport abstraction
//! - [`client`] - DSM API client and response envelopes
//! - [`guest`] - Guest snapshots and live guest records
//! - [`signal`] - Refresh broadcast used by guest waits
//! - [`task`] - Export task ids and results
//! - [`refresh`] - Background state refresh loop
//! - [`workflow`] - Per-guest export workflow
//! - [`filter`] - Include/exclude guest selection
//! - [`pool`] - Worker pool draining the export queue
//! - [`export`] - Orchestrator for a complete run
//!
//! # Quick Start
//!
//! ```no_run
//! use vmm_export_core::{run_export, ExportConfig, GuestFilter, HttpTransport};
//!
//! let config = ExportConfig::new("192.168.1.100:5000", "admin", "secret", "/Backups/VMM")
//!     .with_filter(GuestFilter::from_csv("", "scratch"));
//! run_export(&config, HttpTransport::new().unwrap(), None).unwrap();
//! ```

pub mod client;
pub mod codes;
pub mod error;
pub mod export;
pub mod filter;
pub mod guest;
pub mod pool;
pub mod refresh;
pub mod signal;
pub mod task;
pub mod transport;
pub mod workflow;

pub use error::{Error, Result};

// Re-export the main entry points for convenience
pub use client::{DsmClient, Envelope};
pub use export::{run_export, ExportConfig, ExportReport};
pub use filter::GuestFilter;
pub use guest::{Field, Guest, GuestSnapshot, GuestStatus};
pub use pool::GuestOutcome;
pub use task::{TaskId, TaskOutcome};
pub use transport::{HttpTransport, Transport};
pub use workflow::{EventCallback, ExportEvent, ExportOutcome, ExportPhase, PowerOnPolicy};
