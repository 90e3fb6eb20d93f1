//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Shutdown (shutdown.rs):
//!     Signal received → cancel root token → listener stops accepting
//!     → streams in header parse abort → open sockets close 1001
//!     → drain tracked streams (deadline) → exit
//!
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → trigger graceful shutdown
//! ```
//!
//! # Design Decisions
//! - One root `CancellationToken`; each task gets a child token
//! - Shutdown has a deadline: streams still open after it are abandoned

pub mod shutdown;
pub mod signals;

pub use shutdown::Shutdown;
pub use signals::wait_for_signal;
