//! # Links
//!
//! A [`Link`] is an authenticated, encrypted duplex channel to a remote
//! identity, produced by an external handshake/transport layer. The core
//! never performs its own handshake: a transport hands the router a link
//! that already knows the verified remote identity and can open named
//! queries across the wire.
//!
//! The [`memory`] submodule provides an in-process transport used by the
//! integration tests and the demo binary; a real network transport plugs
//! in the same way, through [`QueryOpener`] and [`Dialer`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::identity::Identity;
use crate::router::{Hints, Query, RouteError};

/// Object-safe duplex byte stream.
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

impl std::fmt::Debug for dyn AsyncStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("AsyncStream")
    }
}

/// An authenticated duplex stream to whichever party answers a query.
pub type SecureStream = Box<dyn AsyncStream>;

static NEXT_LINK_ID: AtomicU64 = AtomicU64::new(1);

/// Transport half of a link: opens a named query across the wire and
/// returns the connected stream.
#[async_trait]
pub trait QueryOpener: Send + Sync {
    async fn open(&self, query: &Query) -> Result<SecureStream, RouteError>;
}

/// Establishes new links on demand when the link cache has none.
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, target: Identity, hints: &Hints) -> Result<Link, RouteError>;
}

/// An active authenticated link to a peer.
#[derive(Clone)]
pub struct Link {
    id: u64,
    remote: Identity,
    network: String,
    established_at: Instant,
    opener: Arc<dyn QueryOpener>,
}

impl Link {
    pub fn new(remote: Identity, network: impl Into<String>, opener: Arc<dyn QueryOpener>) -> Self {
        Self {
            id: NEXT_LINK_ID.fetch_add(1, Ordering::Relaxed),
            remote,
            network: network.into(),
            established_at: Instant::now(),
            opener,
        }
    }

    /// Process-unique link id, used to remove a specific link from the cache.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn remote_identity(&self) -> Identity {
        self.remote
    }

    /// Network type this link runs over, e.g. `"memory"` or `"inet"`.
    /// Used by the router's priority policy.
    pub fn network(&self) -> &str {
        &self.network
    }

    pub fn established_at(&self) -> Instant {
        self.established_at
    }

    /// Open a named query across this link.
    pub async fn open(&self, query: &Query) -> Result<SecureStream, RouteError> {
        self.opener.open(query).await
    }
}

impl std::fmt::Debug for Link {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Link")
            .field("id", &self.id)
            .field("remote", &self.remote)
            .field("network", &self.network)
            .finish_non_exhaustive()
    }
}

pub mod memory {
    //! In-process transport: queries opened on one side are delivered
    //! straight into the peer's router. The transport-level authentication
    //! of a real handshake is simulated by construction: the caller
    //! identity on every delivered query is the opening node's identity,
    //! never whatever the query claimed.

    use super::*;
    use crate::node::Node;
    use crate::router::Router;

    /// Network name links created by this transport carry.
    pub const MEMORY_NETWORK: &str = "memory";

    struct MemoryOpener {
        local: Identity,
        remote_router: Arc<Router>,
    }

    #[async_trait]
    impl QueryOpener for MemoryOpener {
        async fn open(&self, query: &Query) -> Result<SecureStream, RouteError> {
            let authenticated = Query {
                caller: self.local,
                ..query.clone()
            };
            self.remote_router.route_query(authenticated, &Hints::default()).await
        }
    }

    /// Connect two nodes with a pair of authenticated in-memory links and
    /// register them in both link caches.
    pub fn connect(a: &Node, b: &Node) -> (Link, Link) {
        let a_to_b = Link::new(
            b.identity(),
            MEMORY_NETWORK,
            Arc::new(MemoryOpener {
                local: a.identity(),
                remote_router: b.router(),
            }),
        );
        let b_to_a = Link::new(
            a.identity(),
            MEMORY_NETWORK,
            Arc::new(MemoryOpener {
                local: b.identity(),
                remote_router: a.router(),
            }),
        );
        a.router().add_link(a_to_b.clone());
        b.router().add_link(b_to_a.clone());
        (a_to_b, b_to_a)
    }
}
