//! # Identity Machine
//!
//! An [`IdentityMachine`] resolves a chain of relay certificates to the
//! identity ultimately being vouched for. It starts at the identity the
//! transport handshake authenticated and rewinds one hop of indirection
//! per applied certificate: a caller holding a certificate proves it is a
//! relay acting *for* the certificate's target, so applying it replaces
//! the asserted identity with the deeper one it speaks for.
//!
//! The machine is applied incrementally as certificates arrive and is not
//! thread-safe; each in-flight session owns its own instance. A failed
//! `apply` never mutates state.

use thiserror::Error;

use crate::cert::{CertError, RelayCert};
use crate::identity::Identity;
use crate::wire::{Decoder, ObjectTag, WireError, RELAY_CERT_TAG};

#[derive(Debug, Error)]
pub enum MachineError {
    #[error("unknown certificate type {0:?}")]
    UnknownCertificateType(ObjectTag),
    /// The certificate does not authorize the party currently asserted as
    /// the caller. Both identities travel in the error so the caller can
    /// log them through the structured path.
    #[error("relay identity mismatch: certificate names {}, caller is {}", cert_relay.short(), asserted.short())]
    IdentityMismatch {
        asserted: Identity,
        cert_relay: Identity,
    },
    #[error("invalid certificate: {0}")]
    InvalidCertificate(#[from] CertError),
    #[error(transparent)]
    Wire(#[from] WireError),
}

pub struct IdentityMachine {
    identity: Identity,
}

impl IdentityMachine {
    /// Create a machine seeded with the transport-authenticated identity of
    /// the connection presenting the certificates.
    pub fn new(identity: Identity) -> Self {
        Self { identity }
    }

    /// The identity currently being asserted.
    pub fn identity(&self) -> Identity {
        self.identity
    }

    /// Apply one certificate blob, rewinding one hop of indirection.
    ///
    /// The certificate must name the current identity as its relay and must
    /// pass [`RelayCert::validate`]; otherwise the state is left unchanged.
    pub fn apply(&mut self, cert_bytes: &[u8]) -> Result<(), MachineError> {
        let mut dec = Decoder::new(cert_bytes);
        let tag: ObjectTag = dec.get_fixed()?;

        match tag {
            RELAY_CERT_TAG => {
                let cert = RelayCert::decode_body(&mut dec)?;

                if cert.relay_id != self.identity {
                    return Err(MachineError::IdentityMismatch {
                        asserted: self.identity,
                        cert_relay: cert.relay_id,
                    });
                }

                cert.validate()?;

                self.identity = cert.target_id;
                Ok(())
            }
            other => Err(MachineError::UnknownCertificateType(other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cert::Direction;
    use crate::identity::Keypair;
    use std::time::Duration;

    fn cert_blob(target: &Keypair, relay: &Keypair) -> Vec<u8> {
        let mut cert = RelayCert::new(
            target.identity(),
            relay.identity(),
            Direction::Both,
            Duration::from_secs(3600),
        );
        cert.sign_as_target(target).unwrap();
        cert.sign_as_relay(relay).unwrap();
        cert.encode().unwrap()
    }

    #[test]
    fn apply_rewinds_one_hop() {
        let a = Keypair::generate();
        let b = Keypair::generate();

        let mut machine = IdentityMachine::new(a.identity());
        machine.apply(&cert_blob(&b, &a)).unwrap();
        assert_eq!(machine.identity(), b.identity());
    }

    #[test]
    fn apply_chain_recovers_originator() {
        let a = Keypair::generate();
        let b = Keypair::generate();
        let c = Keypair::generate();

        let mut machine = IdentityMachine::new(a.identity());
        machine.apply(&cert_blob(&b, &a)).unwrap();
        machine.apply(&cert_blob(&c, &b)).unwrap();
        assert_eq!(machine.identity(), c.identity());
    }

    #[test]
    fn mismatch_leaves_state_unchanged() {
        let a = Keypair::generate();
        let b = Keypair::generate();
        let c = Keypair::generate();

        // Certificate names b as relay, but the machine asserts a.
        let mut machine = IdentityMachine::new(a.identity());
        let err = machine.apply(&cert_blob(&c, &b)).unwrap_err();
        assert!(matches!(err, MachineError::IdentityMismatch { .. }));
        assert_eq!(machine.identity(), a.identity());
    }

    #[test]
    fn invalid_cert_leaves_state_unchanged() {
        let a = Keypair::generate();
        let b = Keypair::generate();

        let mut cert = RelayCert::new(
            b.identity(),
            a.identity(),
            Direction::Both,
            Duration::from_secs(3600),
        );
        cert.sign_as_target(&b).unwrap();
        cert.sign_as_relay(&a).unwrap();
        cert.target_sig.as_mut().unwrap()[0] ^= 1;

        let mut machine = IdentityMachine::new(a.identity());
        let err = machine.apply(&cert.encode().unwrap()).unwrap_err();
        assert!(matches!(
            err,
            MachineError::InvalidCertificate(CertError::BadTargetSignature)
        ));
        assert_eq!(machine.identity(), a.identity());
    }

    #[test]
    fn unknown_type_rejected() {
        let a = Keypair::generate();
        let mut blob = b"ZZZZ".to_vec();
        blob.extend_from_slice(&[0u8; 32]);

        let mut machine = IdentityMachine::new(a.identity());
        let err = machine.apply(&blob).unwrap_err();
        assert!(matches!(
            err,
            MachineError::UnknownCertificateType(tag) if &tag == b"ZZZZ"
        ));
        assert_eq!(machine.identity(), a.identity());
    }
}
