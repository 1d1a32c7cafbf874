//! # nvmex
//!
//! Capability-adaptive NVIDIA GPU metrics exporter producing the Prometheus
//! text exposition format.
//!
//! Every device keeps a record of which metric families it supports. A family
//! that answers "not supported" once is never queried again; anything else is
//! retried on the next scrape. Attributes that cannot change while the driver
//! is loaded (names, clock envelopes, thresholds, link layout) are formatted
//! once and replayed from a per-device cache.
//!
//! ## Quick Start
//!
//! ```rust
//! use nvmex::prelude::*;
//!
//! let backend = StubBackend::with_full_devices(2);
//! let mut session = Session::new(backend, ScrapeOptions::default(), &MetricSelection::all())?;
//! let text = session.scrape();
//! assert!(text.contains("nvmex_gpu_info{"));
//! # Ok::<(), nvmex::ExporterError>(())
//! ```
//!
//! ## Feature Flags
//!
//! - `nvidia`: NVML backend over `nvml-wrapper`
//! - `server`: HTTP `/metrics` endpoint over `axum`
//! - `full`: both, required by the `nvmex` binary

#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(missing_docs)]
// Allow unwrap() in tests only - banned in production code
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::similar_names)]
#![allow(clippy::doc_markdown)]

// ============================================================================
// Core Modules
// ============================================================================

/// Per-device capability state.
pub mod capability;

/// Per-device cache of formatted static attributes.
pub mod cache;

/// Device enumeration and handle table.
pub mod device;

/// Driver query seam and backends.
pub mod query;

// ============================================================================
// Exposition Modules
// ============================================================================

/// Growable scrape output buffer.
pub mod buffer;

/// Text exposition format: family descriptors and sample formatting.
pub mod exposition;

/// Metric collectors, one per family group.
pub mod collectors;

/// Scrape orchestration.
pub mod scrape;

/// HTTP endpoint.
#[cfg(feature = "server")]
#[cfg_attr(docsrs, doc(cfg(feature = "server")))]
pub mod server;

// ============================================================================
// Ambient Modules
// ============================================================================

/// YAML configuration and metric selection.
pub mod config;

/// Error types.
pub mod error;

/// Log subscriber setup and scope timing.
pub mod logging;

pub use error::{ExporterError, Result};

// ============================================================================
// Prelude
// ============================================================================

/// Commonly used types and traits for convenient imports.
///
/// ```rust
/// use nvmex::prelude::*;
/// ```
pub mod prelude {
    pub use crate::capability::{Capability, Family};
    pub use crate::config::{Config, MetricSelection, MetricToggle};
    pub use crate::device::{Device, DeviceTable};
    pub use crate::error::{ExporterError, Result};
    #[cfg(feature = "nvidia")]
    pub use crate::query::NvmlBackend;
    pub use crate::query::{GpuBackend, QueryError, QueryResult, StubBackend, StubDevice};
    pub use crate::scrape::{ScrapeOptions, Session};
}
