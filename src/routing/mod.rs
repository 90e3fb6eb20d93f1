//! Protocol routing subsystem.
//!
//! # Data Flow
//! ```text
//! Inbound stream (protocol /http/1.1)
//!     → service.rs (read preamble, header timeout, request span)
//!     → dispatch.rs
//!         ├─ well_known.rs (reserved discovery path)
//!         ├─ registrar.rs (snapshot lookup, longest path first)
//!         ├─ peer auth (Required / Optional routes)
//!         ├─ method check (OPTIONS → 204, else 405)
//!         └─ handler (errors and panics → 500)
//!     → cors.rs (Allow, Access-Control-* echo)
//!     → writer → stream
//!
//! Upgrade requests take the same lookup, then a 101 and a WebSocket
//! handed to the route's socket handler.
//! ```
//!
//! # Design Decisions
//! - Registration is serialized; dispatch reads an immutable snapshot
//! - Path matching is segment-aware prefix matching, most specific first
//! - The discovery path is reserved and answered before route lookup
//! - One request per stream; the writer closes after the response

pub mod cors;
pub mod dispatch;
pub mod registrar;
pub mod route;
pub mod service;
pub mod well_known;

pub use dispatch::{DispatchError, Dispatcher, UpgradeTarget};
pub use registrar::{ProtocolEntry, ProtocolMap, Registrar, RouteError, RouteTable, WELL_KNOWN_PROTOCOLS};
pub use route::{AuthRequirement, HandlerError, HttpHandler, RegisteredRoute, RequestContext, Route, WebSocketHandler};
pub use service::{HttpService, ServiceLimits, HTTP_PROTOCOL};
