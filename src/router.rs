//! # Router
//!
//! The router resolves a [`Query`] to a connected duplex stream:
//!
//! - **Local target**: the route table is consulted by exact service name
//!   first, then by longest matching registered prefix. The handler runs
//!   in its own task on one end of an in-memory duplex pair; the caller
//!   gets the other end.
//! - **Remote target**: the link cache supplies the preferred link to the
//!   peer (highest configured network priority, ties broken by the most
//!   recently established link) and the query is opened across it. When
//!   the cache has no link, an optional injected [`Dialer`] may establish
//!   one.
//!
//! The route table and link cache are process-wide maps owned by the
//! router and guarded by short-held mutexes; no lock is ever held across
//! an await point. Routes become visible to other tasks the moment
//! `add_route` returns.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, trace};

use crate::identity::Identity;
use crate::link::{Dialer, Link, SecureStream};

/// Buffer size of the in-memory duplex pair created for local dispatch.
const LOCAL_STREAM_BUFFER: usize = 64 * 1024;

/// Disambiguates sessions created for the same logical query.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Nonce(u64);

impl Nonce {
    pub fn random() -> Self {
        Self(rand::random())
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl From<u64> for Nonce {
    fn from(v: u64) -> Self {
        Self(v)
    }
}

impl std::fmt::Display for Nonce {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl std::fmt::Debug for Nonce {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Nonce({:016x})", self.0)
    }
}

/// A named service request from a caller identity toward a target identity.
/// Queries are ephemeral; they exist only for the duration of a connection
/// attempt.
#[derive(Clone, Debug)]
pub struct Query {
    pub caller: Identity,
    pub target: Identity,
    pub query: String,
    pub nonce: Nonce,
}

impl Query {
    pub fn new(caller: Identity, target: Identity, query: impl Into<String>) -> Self {
        Self::with_nonce(caller, target, query, Nonce::random())
    }

    pub fn with_nonce(
        caller: Identity,
        target: Identity,
        query: impl Into<String>,
        nonce: Nonce,
    ) -> Self {
        Self {
            caller,
            target,
            query: query.into(),
            nonce,
        }
    }
}

/// Soft routing preferences. Hints affect candidate ordering only, never
/// correctness.
#[derive(Clone, Debug, Default)]
pub struct Hints {
    pub preferred_network: Option<String>,
}

#[derive(Debug, Error)]
pub enum RouteError {
    #[error("route not found")]
    RouteNotFound,
    #[error("route already registered: {0}")]
    AlreadyRegistered(String),
    #[error("no link available to {}", .0.short())]
    LinkUnavailable(Identity),
    #[error("rejected")]
    Rejected,
}

/// A locally registered service capable of answering queries.
#[async_trait]
pub trait QueryHandler: Send + Sync {
    /// Serve one accepted query on the given stream. Errors terminate only
    /// this connection and are logged by the router.
    async fn serve(&self, query: Query, stream: SecureStream) -> anyhow::Result<()>;
}

pub struct Router {
    local: Identity,
    routes: Mutex<HashMap<String, Arc<dyn QueryHandler>>>,
    links: Mutex<HashMap<Identity, Vec<Link>>>,
    priorities: Mutex<HashMap<String, i32>>,
    dialer: Mutex<Option<Arc<dyn Dialer>>>,
}

impl Router {
    pub fn new(local: Identity) -> Self {
        Self {
            local,
            routes: Mutex::new(HashMap::new()),
            links: Mutex::new(HashMap::new()),
            priorities: Mutex::new(HashMap::new()),
            dialer: Mutex::new(None),
        }
    }

    pub fn local_identity(&self) -> Identity {
        self.local
    }

    // ------------------------------------------------------------------
    // Route table
    // ------------------------------------------------------------------

    /// Register a handler under an exact service name, or under a prefix
    /// pattern when the name ends with `*`.
    pub fn add_route(&self, name: &str, handler: Arc<dyn QueryHandler>) -> Result<(), RouteError> {
        let mut routes = self.routes.lock().unwrap();
        if routes.contains_key(name) {
            return Err(RouteError::AlreadyRegistered(name.to_string()));
        }
        routes.insert(name.to_string(), handler);
        trace!(route = name, "route added");
        Ok(())
    }

    /// Remove a registered route. Removing an absent route is a no-op.
    pub fn remove_route(&self, name: &str) {
        if self.routes.lock().unwrap().remove(name).is_some() {
            trace!(route = name, "route removed");
        }
    }

    /// Resolve a queried name: exact match first, then the longest
    /// registered prefix pattern.
    fn resolve(&self, name: &str) -> Option<Arc<dyn QueryHandler>> {
        let routes = self.routes.lock().unwrap();
        if let Some(handler) = routes.get(name) {
            return Some(handler.clone());
        }
        routes
            .iter()
            .filter_map(|(key, handler)| {
                let stem = key.strip_suffix('*')?;
                name.starts_with(stem).then_some((stem.len(), handler))
            })
            .max_by_key(|(stem_len, _)| *stem_len)
            .map(|(_, handler)| handler.clone())
    }

    // ------------------------------------------------------------------
    // Link cache
    // ------------------------------------------------------------------

    pub fn add_link(&self, link: Link) {
        debug!(
            peer = %link.remote_identity().short(),
            network = link.network(),
            "link added"
        );
        self.links
            .lock()
            .unwrap()
            .entry(link.remote_identity())
            .or_default()
            .push(link);
    }

    /// Remove one specific link (by id) from the cache, e.g. when its
    /// transport closes.
    pub fn remove_link(&self, link: &Link) {
        let mut links = self.links.lock().unwrap();
        if let Some(peer_links) = links.get_mut(&link.remote_identity()) {
            let before = peer_links.len();
            peer_links.retain(|l| l.id() != link.id());
            let removed = peer_links.len() < before;
            if peer_links.is_empty() {
                links.remove(&link.remote_identity());
            }
            if removed {
                debug!(peer = %link.remote_identity().short(), "link removed");
            }
        }
    }

    pub fn link_count(&self, peer: Identity) -> usize {
        self.links
            .lock()
            .unwrap()
            .get(&peer)
            .map(|l| l.len())
            .unwrap_or(0)
    }

    /// Configure the priority of a network type for outbound link selection.
    /// Unconfigured networks default to priority 0.
    pub fn set_network_priority(&self, network: &str, priority: i32) {
        self.priorities
            .lock()
            .unwrap()
            .insert(network.to_string(), priority);
    }

    /// Set the dialer used to establish links when the cache has none.
    pub fn set_dialer(&self, dialer: Arc<dyn Dialer>) {
        *self.dialer.lock().unwrap() = Some(dialer);
    }

    /// Pick the preferred link to a peer: highest configured network
    /// priority wins; among equals, a hinted network is preferred; then
    /// the most recently established link.
    pub(crate) fn preferred_link(&self, peer: Identity, hints: &Hints) -> Option<Link> {
        let links = self.links.lock().unwrap();
        let priorities = self.priorities.lock().unwrap();
        links.get(&peer)?.iter().max_by_key(|link| {
            let priority = priorities.get(link.network()).copied().unwrap_or(0);
            let hinted = hints.preferred_network.as_deref() == Some(link.network());
            (priority, hinted, link.established_at())
        }).cloned()
    }

    // ------------------------------------------------------------------
    // Query routing
    // ------------------------------------------------------------------

    /// Resolve a query to a connected duplex stream: local dispatch when
    /// the target is this node, otherwise forward over a link to the peer.
    pub async fn route_query(
        &self,
        query: Query,
        hints: &Hints,
    ) -> Result<SecureStream, RouteError> {
        if query.target == self.local {
            return self.route_local(query);
        }

        let link = match self.preferred_link(query.target, hints) {
            Some(link) => link,
            None => {
                let dialer = self.dialer.lock().unwrap().clone();
                match dialer {
                    Some(dialer) => {
                        let link = dialer.dial(query.target, hints).await?;
                        self.add_link(link.clone());
                        link
                    }
                    None => return Err(RouteError::LinkUnavailable(query.target)),
                }
            }
        };

        trace!(
            target = %query.target.short(),
            query = %query.query,
            network = link.network(),
            "forwarding query over link"
        );
        link.open(&query).await
    }

    fn route_local(&self, query: Query) -> Result<SecureStream, RouteError> {
        let handler = self.resolve(&query.query).ok_or(RouteError::RouteNotFound)?;
        let (near, far) = tokio::io::duplex(LOCAL_STREAM_BUFFER);

        trace!(
            caller = %query.caller.short(),
            query = %query.query,
            nonce = %query.nonce,
            "dispatching local query"
        );

        tokio::spawn(async move {
            let name = query.query.clone();
            let caller = query.caller;
            if let Err(error) = handler.serve(query, Box::new(far)).await {
                debug!(
                    query = %name,
                    caller = %caller.short(),
                    %error,
                    "query handler finished with error"
                );
            }
        });

        Ok(Box::new(near))
    }
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router")
            .field("local", &self.local)
            .field("routes", &self.routes.lock().unwrap().len())
            .field("links", &self.links.lock().unwrap().len())
            .finish()
    }
}
