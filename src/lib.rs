//! # Lattica - Identity-Routed Overlay Networking
//!
//! Lattica is the routing core of a peer-to-peer overlay in which nodes are
//! addressed by Ed25519 public keys and unreachable nodes are traversed
//! through co-signed relay certificates:
//!
//! - **Identity**: a node *is* its 32-byte Ed25519 public key; no separate
//!   naming layer
//! - **Routing**: named queries resolve against a local route table or are
//!   forwarded over cached authenticated links
//! - **Relay**: a certificate signed by both target and relay authorizes
//!   the relay to accept traffic on the target's behalf; sessions are
//!   bounded-lifetime byte pipes
//! - **Wire**: a compact big-endian binary protocol with one-byte length
//!   prefixes and tagged data objects
//!
//! ## Trust Model
//!
//! Transports hand the router links whose remote identity was verified by
//! an external handshake; everything above builds on that. A relay never
//! forwards for a target it holds no valid inbound certificate for, and a
//! caller asserting a deeper identity must present an unbroken certificate
//! chain ending at itself. Certificates expire and are directional.
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|--------|
//! | `node` | High-level API combining all components |
//! | `identity` | Ed25519 keypairs and public-key identities |
//! | `cert` | Relay certificates, validation, and the certificate store |
//! | `machine` | Certificate-chain resolution to the effective caller |
//! | `router` | Route table, link cache, and query routing |
//! | `link` | Authenticated links and the transport seams |
//! | `relay` | Relay service and bounded redirect sessions |
//! | `wire` | Binary codec and stream framing |

pub mod cert;
pub mod identity;
pub mod link;
pub mod machine;
pub mod node;
pub mod relay;
pub mod router;
pub mod wire;

pub use cert::{CertError, CertQuery, CertStore, Direction, RelayCert};
pub use identity::{Identity, Keypair};
pub use link::{AsyncStream, Dialer, Link, QueryOpener, SecureStream};
pub use machine::{IdentityMachine, MachineError};
pub use node::Node;
pub use relay::{RelayConfig, RelayRefused, RelayService, RELAY_SERVICE_NAME};
pub use router::{Hints, Nonce, Query, QueryHandler, RouteError, Router};
pub use wire::{ErrorCode, QueryParams, QueryResponse, WireError};
