//! ovfexport Core Library
//!
//! This crate exports hypervisor VMs into portable OVF packages: one
//! descriptor plus one compressed image per virtual disk.
//!
//! # Overview
//!
//! The [`Exporter`] reads a VM's records through a [`RemoteModelReader`],
//! builds the package metadata, and streams each disk through a
//! [`TransferChannel`] into a local image file. Progress, warnings and
//! failures are delivered through a single [`EventSink`].
//!
//! # Modules
//!
//! - [`error`] - Error types and Result alias
//! - [`events`] - Export events and their delivery point
//! - [`model`] - Records of the remote object model
//! - [`transfer`] - Transfer channel, session guard and cancellation
//! - [`ovf`] - Package metadata tree and descriptor serialisation
//! - [`guest_os`] - Guest operating system identification
//! - [`image`] - Compressed image container
//! - [`pipeline`] - Parallel grain compression
//! - [`disk_copy`] - Disk copy engine
//! - [`export`] - Export orchestrator
//! - [`config`] - TOML configuration
//! - [`backend`] - Directory-backed model and channel
//!
//! # Quick Start
//!
//! ```no_run
//! use ovfexport_core::{EventSink, ExportConfig, ExportJob, Exporter, LocalBackend};
//! use std::path::Path;
//!
//! let backend = LocalBackend::load(Path::new("/srv/pool")).unwrap();
//! let channel = backend.channel();
//! let mut exporter =
//!     Exporter::new(backend, channel, ExportConfig::default(), EventSink::discard()).unwrap();
//! exporter
//!     .run(ExportJob::new("/exports/web", "web", vec!["web-01".to_string()]))
//!     .unwrap();
//! ```

pub mod backend;
pub mod config;
pub mod disk_copy;
pub mod error;
pub mod events;
pub mod export;
pub mod guest_os;
pub mod image;
pub mod model;
pub mod ovf;
pub mod pipeline;
pub mod transfer;

pub use error::{Error, ErrorKind, Result, TransferError};

// Re-export main export functionality for convenience
pub use backend::{LocalBackend, LocalChannel};
pub use config::ExportConfig;
pub use events::{EventKind, EventSink, Stage, TransferEvent};
pub use export::{
    get_vm_info, DiskDetail, ExportFlags, ExportJob, ExportResult, Exporter, VmInfo,
};
pub use model::RemoteModelReader;
pub use ovf::Envelope;
pub use pipeline::CompressionLevel;
pub use transfer::{CancelToken, TransferChannel};
