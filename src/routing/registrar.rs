//! Protocol registration and the route snapshot.
//!
//! Writers are serialized behind a mutex and publish a fresh [`RouteTable`]
//! with a bumped generation; readers load the current table without locking.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::routing::route::{RegisteredRoute, Route};

/// Reserved discovery path.
pub const WELL_KNOWN_PROTOCOLS: &str = "/.well-known/libp2p/protocols";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RouteError {
    #[error("protocol {0} is already registered")]
    DuplicateProtocol(String),

    #[error("path {0} is reserved")]
    ReservedPath(String),

    #[error("protocol {0} is not registered")]
    NotRegistered(String),
}

/// One entry of the discovery document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolEntry {
    pub path: String,
}

/// Protocol id → mount path, as served by the discovery endpoint.
pub type ProtocolMap = BTreeMap<String, ProtocolEntry>;

/// An immutable view of the registered routes, most specific first.
#[derive(Debug, Default)]
pub struct RouteTable {
    pub generation: u64,
    routes: Vec<Arc<RegisteredRoute>>,
}

impl RouteTable {
    /// Longest matching path wins.
    pub fn lookup(&self, path: &str) -> Option<Arc<RegisteredRoute>> {
        self.routes.iter().find(|r| r.matches(path)).cloned()
    }

    pub fn get(&self, protocol: &str) -> Option<Arc<RegisteredRoute>> {
        self.routes.iter().find(|r| r.protocol == protocol).cloned()
    }

    pub fn protocol_map(&self) -> ProtocolMap {
        self.routes
            .iter()
            .map(|r| (r.protocol.clone(), ProtocolEntry { path: r.path.clone() }))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

#[derive(Default)]
pub struct Registrar {
    table: ArcSwap<RouteTable>,
    write: Mutex<()>,
}

impl Registrar {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mount `route` for `protocol`. The path defaults to the protocol id.
    pub fn handle(&self, protocol: &str, route: Route) -> Result<(), RouteError> {
        let path = normalize_path(route.path.as_deref().unwrap_or(protocol));
        if is_reserved(&path) {
            return Err(RouteError::ReservedPath(path));
        }

        let _guard = self.write.lock().unwrap_or_else(PoisonError::into_inner);
        let current = self.table.load();
        if current.get(protocol).is_some() {
            return Err(RouteError::DuplicateProtocol(protocol.to_string()));
        }

        let mut routes = current.routes.clone();
        routes.push(Arc::new(RegisteredRoute {
            protocol: protocol.to_string(),
            path: path.clone(),
            route,
        }));
        // Stable sort keeps registration order among equal lengths.
        routes.sort_by(|a, b| b.path.len().cmp(&a.path.len()));
        let generation = current.generation + 1;
        self.table.store(Arc::new(RouteTable { generation, routes }));

        tracing::info!(protocol, path = %path, generation, "Route registered");
        Ok(())
    }

    pub fn unhandle(&self, protocol: &str) -> Result<(), RouteError> {
        let _guard = self.write.lock().unwrap_or_else(PoisonError::into_inner);
        let current = self.table.load();
        if current.get(protocol).is_none() {
            return Err(RouteError::NotRegistered(protocol.to_string()));
        }

        let routes = current
            .routes
            .iter()
            .filter(|r| r.protocol != protocol)
            .cloned()
            .collect();
        let generation = current.generation + 1;
        self.table.store(Arc::new(RouteTable { generation, routes }));

        tracing::info!(protocol, generation, "Route removed");
        Ok(())
    }

    pub fn snapshot(&self) -> Arc<RouteTable> {
        self.table.load_full()
    }

    pub fn lookup(&self, path: &str) -> Option<Arc<RegisteredRoute>> {
        self.table.load().lookup(path)
    }

    pub fn protocol_map(&self) -> ProtocolMap {
        self.table.load().protocol_map()
    }
}

impl std::fmt::Debug for Registrar {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let table = self.table.load();
        f.debug_struct("Registrar")
            .field("generation", &table.generation)
            .field("routes", &table.len())
            .finish()
    }
}

fn normalize_path(path: &str) -> String {
    if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{path}")
    }
}

fn is_reserved(path: &str) -> bool {
    let trimmed = path.trim_end_matches('/');
    trimmed == WELL_KNOWN_PROTOCOLS || trimmed.starts_with(&format!("{WELL_KNOWN_PROTOCOLS}/"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::{Request, Response};
    use crate::routing::route::{HandlerError, RequestContext};

    async fn ok(_: Request, _: RequestContext) -> Result<Response, HandlerError> {
        Ok(Response::ok())
    }

    #[test]
    fn path_defaults_to_protocol_id() {
        let registrar = Registrar::new();
        registrar.handle("/echo/1", Route::http(ok)).unwrap();
        registrar.handle("plain", Route::http(ok)).unwrap();
        let map = registrar.protocol_map();
        assert_eq!(map["/echo/1"].path, "/echo/1");
        assert_eq!(map["plain"].path, "/plain");
    }

    #[test]
    fn most_specific_route_wins() {
        let registrar = Registrar::new();
        registrar.handle("a", Route::http(ok).path("/a")).unwrap();
        registrar.handle("ab", Route::http(ok).path("/a/b")).unwrap();
        assert_eq!(registrar.lookup("/a/b").unwrap().protocol, "ab");
        assert_eq!(registrar.lookup("/a/b/c").unwrap().protocol, "ab");
        assert_eq!(registrar.lookup("/a").unwrap().protocol, "a");
        assert_eq!(registrar.lookup("/a/x").unwrap().protocol, "a");
        assert!(registrar.lookup("/b").is_none());
    }

    #[test]
    fn registration_errors() {
        let registrar = Registrar::new();
        registrar.handle("p", Route::http(ok)).unwrap();
        assert_eq!(
            registrar.handle("p", Route::http(ok).path("/other")),
            Err(RouteError::DuplicateProtocol("p".into()))
        );
        assert!(matches!(
            registrar.handle("w", Route::http(ok).path(WELL_KNOWN_PROTOCOLS)),
            Err(RouteError::ReservedPath(_))
        ));
        assert_eq!(registrar.unhandle("missing"), Err(RouteError::NotRegistered("missing".into())));
    }

    #[test]
    fn unhandle_bumps_generation_and_keeps_old_snapshots() {
        let registrar = Registrar::new();
        registrar.handle("a", Route::http(ok)).unwrap();
        registrar.handle("b", Route::http(ok)).unwrap();
        let before = registrar.snapshot();
        registrar.unhandle("a").unwrap();

        let after = registrar.snapshot();
        assert_eq!(after.generation, before.generation + 1);
        assert!(after.get("a").is_none());
        assert!(after.get("b").is_some());
        assert!(before.get("a").is_some());
    }
}
