//! # Relay Certificates
//!
//! A [`RelayCert`] is a signed, expiring assertion: "RelayID may forward
//! traffic between TargetID and the outside world, in Direction, until
//! ExpiresAt". It is co-signed by both the target and the relay over the
//! certificate's canonical SHA-256 digest, so neither party can fabricate
//! an authorization the other did not agree to.
//!
//! ## Canonical hash
//!
//! The digest covers, in order: the object type tag, target identity,
//! relay identity, direction and the seconds-resolution expiry. Signatures
//! are never part of their own hash input.
//!
//! ## Validity
//!
//! A certificate is valid iff it has not expired, target and relay differ
//! (no self-relay), both signatures are present, and both verify against
//! the canonical digest. See [`RelayCert::validate`].
//!
//! Certificates are immutable once both parties have signed. Issuance
//! happens out-of-band: each side calls its half of the signing flow
//! ([`RelayCert::sign_as_target`] / [`RelayCert::sign_as_relay`]) and the
//! result is distributed as an opaque blob ([`RelayCert::encode`]).

use sha2::{Digest, Sha256};
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;

use crate::identity::{now_secs, Identity, Keypair, SIGNATURE_LEN};
use crate::wire::{Decoder, Encoder, WireError, RELAY_CERT_TAG};

/// Which way the relay is authorized to forward traffic.
///
/// `Inbound` lets the relay accept traffic for the target from third
/// parties; `Outbound` lets it forward the target's outgoing traffic;
/// `Both` grants both.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
    Both,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Inbound => "inbound",
            Direction::Outbound => "outbound",
            Direction::Both => "both",
        }
    }

    pub fn from_str(s: &str) -> Result<Self, WireError> {
        match s {
            "inbound" => Ok(Direction::Inbound),
            "outbound" => Ok(Direction::Outbound),
            "both" => Ok(Direction::Both),
            other => Err(WireError::UnknownDirection(other.to_string())),
        }
    }

    /// True if a certificate granting `self` satisfies a request for `wanted`.
    pub fn covers(&self, wanted: Direction) -> bool {
        *self == Direction::Both || *self == wanted
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CertError {
    #[error("certificate expired")]
    Expired,
    #[error("relay and target cannot be equal")]
    SelfRelay,
    #[error("signature missing")]
    MissingSignature,
    #[error("identity missing")]
    MissingIdentity,
    #[error("hashing error")]
    HashFailure,
    #[error("target signature invalid")]
    BadTargetSignature,
    #[error("relay signature invalid")]
    BadRelaySignature,
}

/// A co-signed, time-bounded, directional authorization for one relay hop.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RelayCert {
    pub target_id: Identity,
    pub relay_id: Identity,
    pub direction: Direction,
    /// Absolute expiry as seconds since Unix epoch. The certificate is
    /// invalid at or after this instant.
    pub expires_at: u64,
    pub target_sig: Option<[u8; SIGNATURE_LEN]>,
    pub relay_sig: Option<[u8; SIGNATURE_LEN]>,
}

impl RelayCert {
    /// Build an unsigned certificate expiring `ttl` from now.
    pub fn new(target_id: Identity, relay_id: Identity, direction: Direction, ttl: Duration) -> Self {
        let expires_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .saturating_add(ttl)
            .as_secs();
        Self {
            target_id,
            relay_id,
            direction,
            expires_at,
            target_sig: None,
            relay_sig: None,
        }
    }

    /// Canonical SHA-256 digest over the non-signature fields.
    pub fn hash(&self) -> Result<[u8; 32], CertError> {
        let mut enc = Encoder::new();
        enc.put_fixed(&RELAY_CERT_TAG);
        enc.put_fixed(self.target_id.as_bytes());
        enc.put_fixed(self.relay_id.as_bytes());
        enc.put_string(self.direction.as_str())
            .map_err(|_| CertError::HashFailure)?;
        enc.put_u64(self.expires_at);
        Ok(Sha256::digest(enc.into_bytes()).into())
    }

    /// Target's half of the out-of-band issuance flow.
    pub fn sign_as_target(&mut self, keypair: &Keypair) -> Result<(), CertError> {
        let hash = self.hash()?;
        self.target_sig = Some(keypair.sign(&hash));
        Ok(())
    }

    /// Relay's half of the out-of-band issuance flow.
    pub fn sign_as_relay(&mut self, keypair: &Keypair) -> Result<(), CertError> {
        let hash = self.hash()?;
        self.relay_sig = Some(keypair.sign(&hash));
        Ok(())
    }

    pub fn is_expired(&self) -> bool {
        now_secs() >= self.expires_at
    }

    /// Check that the certificate has not expired and signatures are valid.
    pub fn validate(&self) -> Result<(), CertError> {
        if self.is_expired() {
            return Err(CertError::Expired);
        }
        if self.target_id == self.relay_id {
            return Err(CertError::SelfRelay);
        }
        self.verify()
    }

    /// Verify both signatures against the canonical digest.
    pub fn verify(&self) -> Result<(), CertError> {
        let (Some(target_sig), Some(relay_sig)) = (&self.target_sig, &self.relay_sig) else {
            return Err(CertError::MissingSignature);
        };
        if self.target_id.is_zero() || self.relay_id.is_zero() {
            return Err(CertError::MissingIdentity);
        }
        let hash = self.hash()?;
        if !self.target_id.verify(&hash, target_sig) {
            return Err(CertError::BadTargetSignature);
        }
        if !self.relay_id.verify(&hash, relay_sig) {
            return Err(CertError::BadRelaySignature);
        }
        Ok(())
    }

    /// True if this certificate satisfies `query` and has not expired.
    pub fn matches(&self, query: &CertQuery) -> bool {
        self.target_id == query.target_id
            && self.relay_id == query.relay_id
            && self.direction.covers(query.direction)
            && !self.is_expired()
    }

    /// Encode as an opaque data object (type tag followed by the body).
    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        let mut enc = Encoder::new();
        enc.put_fixed(&RELAY_CERT_TAG);
        enc.put_fixed(self.target_id.as_bytes());
        enc.put_fixed(self.relay_id.as_bytes());
        enc.put_string(self.direction.as_str())?;
        enc.put_u64(self.expires_at);
        enc.put_bytes(self.target_sig.as_ref().map(|s| &s[..]).unwrap_or(&[]))?;
        enc.put_bytes(self.relay_sig.as_ref().map(|s| &s[..]).unwrap_or(&[]))?;
        Ok(enc.into_bytes())
    }

    /// Decode a data object, rejecting blobs that do not carry the relay
    /// certificate type tag.
    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        let mut dec = Decoder::new(bytes);
        let tag = dec.get_fixed()?;
        if tag != RELAY_CERT_TAG {
            return Err(WireError::WrongType(tag));
        }
        Self::decode_body(&mut dec)
    }

    /// Decode the certificate body, after the type tag has been consumed.
    pub(crate) fn decode_body(dec: &mut Decoder<'_>) -> Result<Self, WireError> {
        let target_id = dec.get_identity()?;
        let relay_id = dec.get_identity()?;
        let direction = Direction::from_str(&dec.get_string()?)?;
        let expires_at = dec.get_u64()?;
        let target_sig = decode_signature(dec, "target signature")?;
        let relay_sig = decode_signature(dec, "relay signature")?;
        Ok(Self {
            target_id,
            relay_id,
            direction,
            expires_at,
            target_sig,
            relay_sig,
        })
    }
}

fn decode_signature(
    dec: &mut Decoder<'_>,
    field: &'static str,
) -> Result<Option<[u8; SIGNATURE_LEN]>, WireError> {
    let bytes = dec.get_bytes()?;
    match bytes.len() {
        0 => Ok(None),
        SIGNATURE_LEN => {
            let mut sig = [0u8; SIGNATURE_LEN];
            sig.copy_from_slice(&bytes);
            Ok(Some(sig))
        }
        _ => Err(WireError::InvalidLength(field)),
    }
}

/// Lookup criteria for a held certificate.
#[derive(Clone, Copy, Debug)]
pub struct CertQuery {
    pub target_id: Identity,
    pub relay_id: Identity,
    pub direction: Direction,
}

/// Shared set of certificates this node holds.
///
/// Mutation goes through `add`/`prune_expired`; the lock is never held
/// across an await point.
#[derive(Default)]
pub struct CertStore {
    certs: Mutex<Vec<RelayCert>>,
}

impl CertStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a certificate after validating it.
    pub fn add(&self, cert: RelayCert) -> Result<(), CertError> {
        cert.validate()?;
        let mut certs = self.certs.lock().unwrap();
        if !certs.contains(&cert) {
            certs.push(cert);
        }
        Ok(())
    }

    /// Find a valid certificate matching the query. When several match,
    /// the one with the latest expiry wins.
    pub fn find(&self, query: &CertQuery) -> Option<RelayCert> {
        self.certs
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.matches(query))
            .max_by_key(|c| c.expires_at)
            .cloned()
    }

    /// Drop expired certificates, returning how many were removed.
    pub fn prune_expired(&self) -> usize {
        let mut certs = self.certs.lock().unwrap();
        let before = certs.len();
        certs.retain(|c| !c.is_expired());
        before - certs.len()
    }

    pub fn len(&self) -> usize {
        self.certs.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signed_cert(
        target: &Keypair,
        relay: &Keypair,
        direction: Direction,
        ttl: Duration,
    ) -> RelayCert {
        let mut cert = RelayCert::new(target.identity(), relay.identity(), direction, ttl);
        cert.sign_as_target(target).unwrap();
        cert.sign_as_relay(relay).unwrap();
        cert
    }

    fn hour() -> Duration {
        Duration::from_secs(3600)
    }

    #[test]
    fn signed_cert_validates() {
        let target = Keypair::generate();
        let relay = Keypair::generate();
        let cert = signed_cert(&target, &relay, Direction::Inbound, hour());
        assert_eq!(cert.validate(), Ok(()));
    }

    #[test]
    fn encode_decode_preserves_fields_and_hash() {
        let target = Keypair::generate();
        let relay = Keypair::generate();
        let cert = signed_cert(&target, &relay, Direction::Both, hour());

        let decoded = RelayCert::decode(&cert.encode().unwrap()).unwrap();
        assert_eq!(decoded, cert);
        assert_eq!(decoded.hash().unwrap(), cert.hash().unwrap());
        assert_eq!(decoded.validate(), Ok(()));
    }

    #[test]
    fn decode_rejects_wrong_type() {
        let mut blob = b"XXXX".to_vec();
        blob.extend_from_slice(&[0u8; 80]);
        assert!(matches!(
            RelayCert::decode(&blob),
            Err(WireError::WrongType(tag)) if &tag == b"XXXX"
        ));
    }

    #[test]
    fn expired_cert_rejected() {
        let target = Keypair::generate();
        let relay = Keypair::generate();
        let mut cert = RelayCert::new(
            target.identity(),
            relay.identity(),
            Direction::Inbound,
            hour(),
        );
        cert.expires_at = now_secs().saturating_sub(10);
        cert.sign_as_target(&target).unwrap();
        cert.sign_as_relay(&relay).unwrap();
        assert_eq!(cert.validate(), Err(CertError::Expired));
    }

    #[test]
    fn self_relay_rejected() {
        let keypair = Keypair::generate();
        let cert = RelayCert::new(
            keypair.identity(),
            keypair.identity(),
            Direction::Inbound,
            hour(),
        );
        assert_eq!(cert.validate(), Err(CertError::SelfRelay));
    }

    #[test]
    fn missing_signature_rejected() {
        let target = Keypair::generate();
        let relay = Keypair::generate();
        let mut cert = RelayCert::new(
            target.identity(),
            relay.identity(),
            Direction::Inbound,
            hour(),
        );
        assert_eq!(cert.verify(), Err(CertError::MissingSignature));

        cert.sign_as_target(&target).unwrap();
        assert_eq!(cert.verify(), Err(CertError::MissingSignature));
    }

    #[test]
    fn flipped_signature_bit_rejected() {
        let target = Keypair::generate();
        let relay = Keypair::generate();

        let mut cert = signed_cert(&target, &relay, Direction::Inbound, hour());
        cert.target_sig.as_mut().unwrap()[3] ^= 0x01;
        assert_eq!(cert.validate(), Err(CertError::BadTargetSignature));

        let mut cert = signed_cert(&target, &relay, Direction::Inbound, hour());
        cert.relay_sig.as_mut().unwrap()[40] ^= 0x80;
        assert_eq!(cert.validate(), Err(CertError::BadRelaySignature));
    }

    #[test]
    fn hash_excludes_signatures() {
        let target = Keypair::generate();
        let relay = Keypair::generate();
        let unsigned = RelayCert::new(
            target.identity(),
            relay.identity(),
            Direction::Outbound,
            hour(),
        );
        let mut signed = unsigned.clone();
        signed.sign_as_target(&target).unwrap();
        signed.sign_as_relay(&relay).unwrap();
        assert_eq!(unsigned.hash().unwrap(), signed.hash().unwrap());
    }

    #[test]
    fn direction_covers() {
        assert!(Direction::Both.covers(Direction::Inbound));
        assert!(Direction::Both.covers(Direction::Outbound));
        assert!(Direction::Inbound.covers(Direction::Inbound));
        assert!(!Direction::Inbound.covers(Direction::Outbound));
        assert!(!Direction::Outbound.covers(Direction::Both));
    }

    #[test]
    fn store_find_prefers_latest_expiry() {
        let target = Keypair::generate();
        let relay = Keypair::generate();
        let store = CertStore::new();

        let short = signed_cert(&target, &relay, Direction::Inbound, hour());
        let long = signed_cert(&target, &relay, Direction::Both, hour() * 2);
        store.add(short).unwrap();
        store.add(long.clone()).unwrap();

        let query = CertQuery {
            target_id: target.identity(),
            relay_id: relay.identity(),
            direction: Direction::Inbound,
        };
        assert_eq!(store.find(&query), Some(long));
    }

    #[test]
    fn store_find_respects_direction() {
        let target = Keypair::generate();
        let relay = Keypair::generate();
        let store = CertStore::new();
        store
            .add(signed_cert(&target, &relay, Direction::Outbound, hour()))
            .unwrap();

        let query = CertQuery {
            target_id: target.identity(),
            relay_id: relay.identity(),
            direction: Direction::Inbound,
        };
        assert_eq!(store.find(&query), None);
    }

    #[test]
    fn prune_removes_expired() {
        let target = Keypair::generate();
        let relay = Keypair::generate();
        let store = CertStore::new();
        store
            .add(signed_cert(
                &target,
                &relay,
                Direction::Inbound,
                Duration::from_secs(1),
            ))
            .unwrap();
        store
            .add(signed_cert(&target, &relay, Direction::Both, hour()))
            .unwrap();

        std::thread::sleep(Duration::from_millis(1100));
        assert_eq!(store.prune_expired(), 1);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn store_rejects_invalid() {
        let keypair = Keypair::generate();
        let store = CertStore::new();
        let cert = RelayCert::new(
            keypair.identity(),
            keypair.identity(),
            Direction::Inbound,
            hour(),
        );
        assert_eq!(store.add(cert), Err(CertError::SelfRelay));
        assert!(store.is_empty());
    }
}
