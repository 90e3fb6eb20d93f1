//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! All subsystems produce:
//!     → logging.rs (structured tracing events, request_id spans)
//!     → metrics.rs (counters, gauges, histograms)
//!
//! Consumers:
//!     → stdout (fmt layer, RUST_LOG or configured level)
//!     → Metrics endpoint (Prometheus scrape)
//! ```
//!
//! # Design Decisions
//! - Every served request runs inside a span carrying its request ID
//! - Metrics are cheap (atomic increments) and no-ops without a recorder
//! - Secret material (keys, bearer tokens, opaque blobs) is never logged

pub mod logging;
pub mod metrics;
