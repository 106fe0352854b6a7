//! Integration tests for the public node API: local and remote queries,
//! service registration, and the certificate store surface.

use std::sync::Arc;
use std::sync::Once;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use lattica::link::memory;
use lattica::{
    CertError, Direction, Keypair, Node, Query, QueryHandler, RelayCert, RouteError,
    SecureStream, RELAY_SERVICE_NAME,
};

/// One-time tracing initialization
static INIT: Once = Once::new();

fn init_tracing() {
    INIT.call_once(|| {
        let filter = if std::env::var("RUST_LOG").is_ok() {
            tracing_subscriber::EnvFilter::from_default_env()
        } else {
            tracing_subscriber::EnvFilter::new("debug")
        };

        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init()
            .ok();
    });
}

/// Echoes bytes back until the caller closes.
struct Echo;

#[async_trait]
impl QueryHandler for Echo {
    async fn serve(&self, _query: Query, mut stream: SecureStream) -> anyhow::Result<()> {
        let mut buf = [0u8; 1024];
        loop {
            let n = stream.read(&mut buf).await?;
            if n == 0 {
                return Ok(());
            }
            stream.write_all(&buf[..n]).await?;
        }
    }
}

fn new_node() -> Node {
    Node::new(Keypair::generate()).unwrap()
}

#[tokio::test]
async fn local_service_roundtrip() {
    init_tracing();
    let node = new_node();
    node.register("svc.echo", Arc::new(Echo)).unwrap();

    let mut stream = node.query(node.identity(), "svc.echo").await.unwrap();
    stream.write_all(b"local").await.unwrap();
    let mut buf = [0u8; 5];
    stream.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"local");
}

#[tokio::test]
async fn remote_query_over_link() {
    init_tracing();
    let a = new_node();
    let b = new_node();
    memory::connect(&a, &b);
    b.register("svc.echo", Arc::new(Echo)).unwrap();

    let mut stream = a.query(b.identity(), "svc.echo").await.unwrap();
    stream.write_all(b"remote").await.unwrap();
    let mut buf = [0u8; 6];
    stream.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"remote");
}

#[tokio::test]
async fn unknown_route_errors() {
    init_tracing();
    let node = new_node();
    assert!(node.query(node.identity(), "no.such.service").await.is_err());
}

#[tokio::test]
async fn query_without_link_fails() {
    init_tracing();
    let a = new_node();
    let stranger = Keypair::generate().identity();
    assert!(a.query(stranger, "svc.echo").await.is_err());
}

#[tokio::test]
async fn duplicate_registration_rejected() {
    init_tracing();
    let node = new_node();
    node.register("svc", Arc::new(Echo)).unwrap();
    assert!(matches!(
        node.register("svc", Arc::new(Echo)),
        Err(RouteError::AlreadyRegistered(_))
    ));
}

#[tokio::test]
async fn unregister_removes_route() {
    init_tracing();
    let node = new_node();
    node.register("svc.echo", Arc::new(Echo)).unwrap();
    assert!(node.query(node.identity(), "svc.echo").await.is_ok());

    node.unregister("svc.echo");
    assert!(node.query(node.identity(), "svc.echo").await.is_err());
}

#[tokio::test]
async fn prefix_route_matches_subqueries() {
    init_tracing();
    let node = new_node();
    node.register("files.*", Arc::new(Echo)).unwrap();

    let mut stream = node.query(node.identity(), "files.read").await.unwrap();
    stream.write_all(b"ok").await.unwrap();
    let mut buf = [0u8; 2];
    stream.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"ok");
}

#[tokio::test]
async fn relay_service_registered_by_default() {
    init_tracing();
    let node = new_node();
    // The well-known relay route is taken by the built-in service.
    assert!(matches!(
        node.register(RELAY_SERVICE_NAME, Arc::new(Echo)),
        Err(RouteError::AlreadyRegistered(_))
    ));
}

#[tokio::test]
async fn add_cert_validates_before_storing() {
    init_tracing();
    let node = new_node();
    let target = Keypair::generate();
    let relay = Keypair::generate();

    // Unsigned certificate is refused.
    let unsigned = RelayCert::new(
        target.identity(),
        relay.identity(),
        Direction::Inbound,
        Duration::from_secs(60),
    );
    assert_eq!(node.add_cert(unsigned), Err(CertError::MissingSignature));
    assert!(node.certs().is_empty());

    // A properly co-signed certificate is accepted.
    let mut cert = RelayCert::new(
        target.identity(),
        relay.identity(),
        Direction::Inbound,
        Duration::from_secs(60),
    );
    cert.sign_as_target(&target).unwrap();
    cert.sign_as_relay(&relay).unwrap();
    node.add_cert(cert).unwrap();
    assert_eq!(node.certs().len(), 1);
}
