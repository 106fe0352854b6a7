//! Demo binary: three in-process nodes where the caller reaches a target it
//! has no link to by traversing a relay that holds the target's inbound
//! certificate.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::Parser;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

use lattica::link::memory;
use lattica::{
    Direction, Keypair, Node, Query, QueryHandler, RelayCert, RelayConfig, SecureStream,
};

#[derive(Parser, Debug)]
#[command(name = "lattica")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Message to send through the relay
    #[arg(short, long, default_value = "hello through the relay")]
    message: String,

    /// Certificate lifetime in seconds
    #[arg(long, default_value = "600")]
    cert_ttl: u64,

    /// Redirect session inactivity budget in seconds
    #[arg(long, default_value = "60")]
    redirect_timeout: u64,
}

/// Echoes bytes back until the caller closes.
struct Echo;

#[async_trait]
impl QueryHandler for Echo {
    async fn serve(&self, _query: Query, mut stream: SecureStream) -> Result<()> {
        let mut buf = [0u8; 4096];
        loop {
            let n = stream.read(&mut buf).await?;
            if n == 0 {
                return Ok(());
            }
            stream.write_all(&buf[..n]).await?;
        }
    }
}

fn issue_inbound_cert(target: &Keypair, relay: &Keypair, ttl: Duration) -> Result<RelayCert> {
    let mut cert = RelayCert::new(
        target.identity(),
        relay.identity(),
        Direction::Inbound,
        ttl,
    );
    cert.sign_as_target(target)?;
    cert.sign_as_relay(relay)?;
    Ok(cert)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).init();

    let caller_keys = Keypair::generate();
    let relay_keys = Keypair::generate();
    let target_keys = Keypair::generate();

    let config = RelayConfig {
        redirect_timeout: Duration::from_secs(args.redirect_timeout),
    };
    let caller = Node::with_config(caller_keys, config.clone())?;
    let relay = Node::with_config(relay_keys, config.clone())?;
    let target = Node::with_config(target_keys, config)?;

    // The caller can reach the relay, the relay can reach the target, but
    // there is no caller-to-target link.
    memory::connect(&caller, &relay);
    memory::connect(&relay, &target);

    target.register("demo.echo", Arc::new(Echo))?;

    // Out-of-band issuance: the target authorizes the relay to accept
    // inbound traffic on its behalf, and the relay learns the certificate.
    let cert = issue_inbound_cert(
        target.keypair(),
        relay.keypair(),
        Duration::from_secs(args.cert_ttl),
    )?;
    relay.add_cert(cert)?;

    info!(
        caller = %caller.identity().short(),
        relay = %relay.identity().short(),
        target = %target.identity().short(),
        "overlay assembled"
    );

    let mut stream = caller
        .query_via(relay.identity(), target.identity(), "demo.echo")
        .await
        .context("opening relayed query")?;

    stream.write_all(args.message.as_bytes()).await?;
    let mut reply = vec![0u8; args.message.len()];
    stream.read_exact(&mut reply).await?;

    info!(reply = %String::from_utf8_lossy(&reply), "echo received through relay");
    println!("{}", String::from_utf8_lossy(&reply));

    caller.shutdown();
    relay.shutdown();
    target.shutdown();
    Ok(())
}
