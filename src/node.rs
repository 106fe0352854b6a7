//! # Node
//!
//! A [`Node`] ties the pieces together: one keypair-backed identity, a
//! [`Router`] with its route table and link cache, a certificate store and
//! a registered relay service. It is the surface applications talk to;
//! transports attach by adding links to the node's router.
//!
//! Dropping the node (or calling [`Node::shutdown`]) signals every
//! background session it spawned to wind down.

use std::sync::Arc;

use anyhow::Context;
use tokio::sync::watch;
use tracing::{debug, info};

use crate::cert::{CertError, CertStore, RelayCert};
use crate::identity::{Identity, Keypair};
use crate::link::SecureStream;
use crate::relay::{RelayConfig, RelayRefused, RelayService, RELAY_SERVICE_NAME};
use crate::router::{Hints, Query, QueryHandler, RouteError, Router};
use crate::wire::{self, ErrorCode, QueryParams, QueryResponse};

pub struct Node {
    keypair: Keypair,
    router: Arc<Router>,
    certs: Arc<CertStore>,
    shutdown: watch::Sender<bool>,
}

impl Node {
    /// Create a node with the default relay configuration.
    pub fn new(keypair: Keypair) -> anyhow::Result<Self> {
        Self::with_config(keypair, RelayConfig::default())
    }

    pub fn with_config(keypair: Keypair, config: RelayConfig) -> anyhow::Result<Self> {
        let identity = keypair.identity();
        let router = Arc::new(Router::new(identity));
        let certs = Arc::new(CertStore::new());
        let (shutdown, shutdown_rx) = watch::channel(false);

        let relay = RelayService::new(router.clone(), certs.clone(), config, shutdown_rx);
        relay
            .register()
            .context("registering the relay service")?;

        info!(identity = %identity.short(), "node created");

        Ok(Self {
            keypair,
            router,
            certs,
            shutdown,
        })
    }

    pub fn identity(&self) -> Identity {
        self.keypair.identity()
    }

    pub fn keypair(&self) -> &Keypair {
        &self.keypair
    }

    pub fn router(&self) -> Arc<Router> {
        self.router.clone()
    }

    pub fn certs(&self) -> Arc<CertStore> {
        self.certs.clone()
    }

    /// Register a local service under a name (or prefix pattern ending in
    /// `*`).
    pub fn register(
        &self,
        name: &str,
        handler: Arc<dyn QueryHandler>,
    ) -> Result<(), RouteError> {
        self.router.add_route(name, handler)
    }

    pub fn unregister(&self, name: &str) {
        self.router.remove_route(name);
    }

    /// Accept a relay certificate into the local store. The certificate is
    /// validated first; issuance and exchange happen out of band.
    pub fn add_cert(&self, cert: RelayCert) -> Result<(), CertError> {
        self.certs.add(cert)
    }

    /// Open a named query toward a target this node can reach directly
    /// (itself, or a peer in the link cache).
    pub async fn query(&self, target: Identity, name: &str) -> anyhow::Result<SecureStream> {
        self.router
            .route_query(Query::new(self.identity(), target, name), &Hints::default())
            .await
            .with_context(|| format!("querying {} for {name}", target.short()))
    }

    /// Open a named query toward a target through a relay's relay service.
    pub async fn query_via(
        &self,
        relay: Identity,
        target: Identity,
        name: &str,
    ) -> anyhow::Result<SecureStream> {
        self.query_via_with_cert(relay, target, name, &[]).await
    }

    /// Like [`Node::query_via`], attaching a certificate blob that lets
    /// this node assert a deeper identity to the relay.
    pub async fn query_via_with_cert(
        &self,
        relay: Identity,
        target: Identity,
        name: &str,
        cert: &[u8],
    ) -> anyhow::Result<SecureStream> {
        let local = self.identity();
        let nonce = crate::router::Nonce::random();

        let mut control = self
            .router
            .route_query(
                Query::with_nonce(local, relay, RELAY_SERVICE_NAME, nonce),
                &Hints::default(),
            )
            .await
            .with_context(|| format!("reaching relay service on {}", relay.short()))?;

        let params = QueryParams {
            target,
            query: name.to_string(),
            nonce,
            cert: cert.to_vec(),
        };
        wire::write_frame(&mut control, &params.encode()?)
            .await
            .context("sending relay query params")?;

        let frame = wire::read_frame(&mut control)
            .await
            .context("reading relay response")?;
        let response = QueryResponse::decode(&frame).context("decoding relay response")?;

        if response.error != ErrorCode::Success {
            debug!(
                relay = %relay.short(),
                target = %target.short(),
                code = ?response.error,
                "relay refused query"
            );
            return Err(RelayRefused(response.error).into());
        }

        // The relay may attach the target's own certificate so we can use
        // it for further hops. Store it if it checks out.
        if !response.cert.is_empty() {
            match RelayCert::decode(&response.cert) {
                Ok(cert) => {
                    if let Err(error) = self.certs.add(cert) {
                        debug!(%error, "discarding attached target certificate");
                    }
                }
                Err(error) => {
                    debug!(%error, "ignoring undecodable attached certificate");
                }
            }
        }

        self.router
            .route_query(
                Query::with_nonce(local, relay, response.proxy_service.clone(), nonce),
                &Hints::default(),
            )
            .await
            .with_context(|| {
                format!(
                    "joining redirect session {} on {}",
                    response.proxy_service,
                    relay.short()
                )
            })
    }

    /// Signal every background session spawned by this node to wind down.
    /// Dropping the node has the same effect.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        info!(identity = %self.identity().short(), "node shut down");
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("identity", &self.identity())
            .finish_non_exhaustive()
    }
}
