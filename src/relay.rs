//! # Relay Service
//!
//! The relay service lets a caller traverse one relay hop to reach a
//! target it cannot connect to directly. It is a locally registered query
//! handler speaking a small binary control protocol; each accepted
//! connection walks the states
//!
//! `AwaitParams -> ApplyCert -> AuthorizeTarget -> Redirect -> Closed`
//!
//! 1. **AwaitParams**: decode [`QueryParams`] from the control channel.
//! 2. **ApplyCert**: if the caller attached a certificate, apply it to an
//!    [`IdentityMachine`] seeded with the transport-authenticated caller
//!    identity. A rejected certificate answers `CertificateRejected` and
//!    ends the session before any routing happens.
//! 3. **AuthorizeTarget**: unless the target is this node itself, the
//!    service must hold a valid *inbound* certificate naming itself as the
//!    relay for the target; otherwise it answers `RouteNotFound` and never
//!    opens an outbound connection.
//! 4. **Redirect**: open the real query toward the target through the
//!    router, then register an ephemeral proxy route (unique per session)
//!    the caller can query to have its bytes joined with the outbound
//!    stream. The session lives under an inactivity budget: it outlives
//!    the budget only while traffic is actively flowing.
//! 5. **Closed**: either side closing, budget expiry or an I/O error tears
//!    the session down; the ephemeral route is unregistered and both
//!    streams are proactively shut (no half-open leaks).
//!
//! A misbehaving peer can only affect its own session: certificate and
//! authorization problems are reported via protocol codes, I/O and codec
//! errors terminate the one affected connection and are logged.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{watch, Notify};
use tracing::{debug, trace, warn};

use crate::cert::{CertQuery, CertStore, Direction};
use crate::identity::{now_ms, Identity};
use crate::link::SecureStream;
use crate::machine::IdentityMachine;
use crate::router::{Query, QueryHandler, RouteError, Router};
use crate::wire::{self, ErrorCode, QueryParams, QueryResponse};

/// Well-known route name the relay service registers under.
pub const RELAY_SERVICE_NAME: &str = "net.relay";

/// Default inactivity budget for a redirect session.
pub const DEFAULT_REDIRECT_TIMEOUT: Duration = Duration::from_secs(60);

/// Buffer size used by the byte pump joining two streams.
const PUMP_BUFFER: usize = 16 * 1024;

/// The relay answered the control request with a non-success code.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("relay refused with code {0:?}")]
pub struct RelayRefused(pub ErrorCode);

#[derive(Clone, Debug)]
pub struct RelayConfig {
    /// Inactivity budget for redirect sessions.
    pub redirect_timeout: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            redirect_timeout: DEFAULT_REDIRECT_TIMEOUT,
        }
    }
}

pub struct RelayService {
    local: Identity,
    router: Arc<Router>,
    certs: Arc<CertStore>,
    config: RelayConfig,
    shutdown: watch::Receiver<bool>,
}

impl RelayService {
    pub fn new(
        router: Arc<Router>,
        certs: Arc<CertStore>,
        config: RelayConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Arc<Self> {
        Arc::new(Self {
            local: router.local_identity(),
            router,
            certs,
            config,
            shutdown,
        })
    }

    /// Register this service under [`RELAY_SERVICE_NAME`].
    pub fn register(self: &Arc<Self>) -> Result<(), RouteError> {
        self.router.add_route(RELAY_SERVICE_NAME, self.clone())
    }

    async fn respond(
        &self,
        stream: &mut SecureStream,
        code: ErrorCode,
        proxy_service: &str,
        cert: &[u8],
    ) -> anyhow::Result<()> {
        let response = QueryResponse {
            error: code,
            proxy_service: proxy_service.to_string(),
            cert: cert.to_vec(),
        };
        wire::write_frame(stream, &response.encode()?)
            .await
            .context("writing relay response")
    }
}

#[async_trait]
impl QueryHandler for RelayService {
    async fn serve(&self, query: Query, mut stream: SecureStream) -> anyhow::Result<()> {
        // AwaitParams
        let frame = wire::read_frame(&mut stream)
            .await
            .context("reading query params")?;
        let params = QueryParams::decode(&frame).context("decoding query params")?;

        // ApplyCert: recover the identity the caller is acting for.
        let mut machine = IdentityMachine::new(query.caller);
        if !params.cert.is_empty() {
            if let Err(error) = machine.apply(&params.cert) {
                debug!(
                    caller = %query.caller.short(),
                    %error,
                    "caller certificate rejected"
                );
                self.respond(&mut stream, ErrorCode::CertificateRejected, "", &[])
                    .await?;
                return Err(error.into());
            }
        }

        // AuthorizeTarget: unless the target is this node, we must hold an
        // inbound certificate for it. The target's certificate also goes
        // back to the caller so it can chain further hops.
        let mut attached_cert = Vec::new();
        if params.target != self.local {
            let found = self.certs.find(&CertQuery {
                target_id: params.target,
                relay_id: self.local,
                direction: Direction::Inbound,
            });
            match found {
                Some(cert) => match cert.encode() {
                    Ok(bytes) => attached_cert = bytes,
                    Err(error) => {
                        warn!(%error, "failed to encode target certificate");
                        self.respond(&mut stream, ErrorCode::InternalError, "", &[])
                            .await?;
                        return Err(error.into());
                    }
                },
                None => {
                    debug!(
                        target = %params.target.short(),
                        "no inbound certificate for target"
                    );
                    self.respond(&mut stream, ErrorCode::RouteNotFound, "", &[])
                        .await?;
                    anyhow::bail!(
                        "no inbound certificate for target {}",
                        params.target.short()
                    );
                }
            }
        }

        // Redirect: open the real query, then expose it behind an
        // ephemeral proxy route only the requesting party may use.
        let real_query = Query::with_nonce(
            machine.identity(),
            params.target,
            params.query.clone(),
            params.nonce,
        );
        trace!(
            caller = %query.caller.short(),
            effective = %real_query.caller.short(),
            target = %params.target.short(),
            nonce = %params.nonce,
            "starting redirect session"
        );

        let redirect = Redirect::start(
            real_query,
            query.caller,
            self.router.clone(),
            self.config.redirect_timeout,
            self.shutdown.clone(),
        )
        .await;

        match redirect {
            Ok(redirect) => {
                debug!(
                    proxy = %redirect.service_name,
                    target = %params.target.short(),
                    "redirect session ready"
                );
                self.respond(
                    &mut stream,
                    ErrorCode::Success,
                    &redirect.service_name,
                    &attached_cert,
                )
                .await?;
                Ok(())
            }
            Err(error) => {
                let code = match error {
                    RouteError::RouteNotFound | RouteError::LinkUnavailable(_) => {
                        ErrorCode::RouteNotFound
                    }
                    _ => ErrorCode::InternalError,
                };
                debug!(%error, "redirect setup failed");
                self.respond(&mut stream, code, "", &[]).await?;
                Err(error.into())
            }
        }
    }
}

// ============================================================================
// Redirect session
// ============================================================================

/// A bounded-lifetime proxy session created by the relay service.
pub struct Redirect {
    /// Ephemeral proxy route the caller queries to reach the joined stream.
    pub service_name: String,
}

impl Redirect {
    /// Open the outbound query toward the target and, on success, register
    /// the ephemeral proxy route. A watchdog task enforces the inactivity
    /// budget and reacts to parent shutdown.
    pub(crate) async fn start(
        real_query: Query,
        allow: Identity,
        router: Arc<Router>,
        timeout: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<Redirect, RouteError> {
        let target_stream = router
            .route_query(real_query.clone(), &Default::default())
            .await?;

        let service_name = format!(
            ".redirect.{}.{:08x}",
            real_query.nonce,
            rand::random::<u32>()
        );

        let handler = Arc::new(RedirectHandler {
            allow,
            service_name: service_name.clone(),
            router: router.clone(),
            target_stream: Mutex::new(Some(target_stream)),
            last_activity: AtomicU64::new(now_ms()),
            cancel: Notify::new(),
            finished: AtomicBool::new(false),
        });

        router.add_route(&service_name, handler.clone())?;

        let watchdog = handler.clone();
        tokio::spawn(async move {
            let tick = (timeout / 4).max(Duration::from_millis(25));
            // A cloned receiver marks the current value as seen, so a
            // shutdown sent before this session spawned must be checked
            // directly rather than waited for.
            if *shutdown.borrow() {
                debug!(service = %watchdog.service_name, "redirect session shut down");
            } else {
                loop {
                    tokio::select! {
                        _ = tokio::time::sleep(tick) => {
                            if watchdog.finished.load(Ordering::Relaxed) {
                                break;
                            }
                            if watchdog.idle() >= timeout {
                                debug!(service = %watchdog.service_name, "redirect session expired");
                                break;
                            }
                        }
                        changed = shutdown.changed() => {
                            if changed.is_err() || *shutdown.borrow() {
                                debug!(service = %watchdog.service_name, "redirect session shut down");
                                break;
                            }
                        }
                    }
                }
            }
            watchdog.router.remove_route(&watchdog.service_name);
            watchdog.close();
        });

        Ok(Redirect { service_name })
    }
}

struct RedirectHandler {
    /// Only the transport-authenticated identity that made the relay
    /// request may use this route.
    allow: Identity,
    service_name: String,
    router: Arc<Router>,
    target_stream: Mutex<Option<SecureStream>>,
    /// Milliseconds since Unix epoch of the last observed traffic.
    last_activity: AtomicU64,
    cancel: Notify,
    finished: AtomicBool,
}

impl RedirectHandler {
    fn touch(&self) {
        self.last_activity.store(now_ms(), Ordering::Relaxed);
    }

    fn idle(&self) -> Duration {
        Duration::from_millis(now_ms().saturating_sub(self.last_activity.load(Ordering::Relaxed)))
    }

    fn close(&self) {
        *self.target_stream.lock().unwrap() = None;
        self.cancel.notify_one();
    }
}

#[async_trait]
impl QueryHandler for RedirectHandler {
    async fn serve(&self, query: Query, caller_stream: SecureStream) -> anyhow::Result<()> {
        if query.caller != self.allow {
            debug!(
                caller = %query.caller.short(),
                expected = %self.allow.short(),
                service = %self.service_name,
                "refusing redirect query from unexpected caller"
            );
            return Err(RouteError::Rejected.into());
        }

        let target_stream = self.target_stream.lock().unwrap().take();
        let Some(target_stream) = target_stream else {
            anyhow::bail!("redirect session already consumed");
        };

        self.touch();
        trace!(service = %self.service_name, "redirect session joined");

        pump(caller_stream, target_stream, self).await;

        self.finished.store(true, Ordering::Relaxed);
        self.router.remove_route(&self.service_name);
        debug!(service = %self.service_name, "redirect session closed");
        Ok(())
    }
}

/// Join two streams, copying bytes both ways until either direction closes
/// or the session is cancelled. Both far sides are proactively shut on exit.
///
/// The cancel signal races the whole copy loop, not just its read edges: a
/// peer that stops draining leaves the pump parked in a `write_all`, and
/// the session must still tear down when the watchdog fires.
async fn pump(mut caller: SecureStream, mut target: SecureStream, handler: &RedirectHandler) {
    let copy = async {
        let mut caller_buf = vec![0u8; PUMP_BUFFER];
        let mut target_buf = vec![0u8; PUMP_BUFFER];
        loop {
            tokio::select! {
                read = caller.read(&mut caller_buf) => match read {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if target.write_all(&caller_buf[..n]).await.is_err() {
                            break;
                        }
                        handler.touch();
                    }
                },
                read = target.read(&mut target_buf) => match read {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if caller.write_all(&target_buf[..n]).await.is_err() {
                            break;
                        }
                        handler.touch();
                    }
                },
            }
        }
    };

    tokio::select! {
        _ = copy => {}
        _ = handler.cancel.notified() => {}
    }

    let _ = caller.shutdown().await;
    let _ = target.shutdown().await;
}
