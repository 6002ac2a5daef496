//! Signing and verification, in the two modes selectable by §4.2:
//!
//! - **Digital signatures** (`CryptoMethod::Rsa` / `CryptoMethod::Ed25519`):
//!   one signature per outbound message, verifiable by any receiver against
//!   the known verification key of `return_node_id`. We implement this
//!   family with Ed25519 via `ring` (`crypto_signature_ring_ed25519`);
//!   `CryptoMethod::Rsa` selects the same mechanism (see DESIGN.md for why
//!   a dedicated RSA implementation was not added).
//! - **Pairwise authenticators** (`CryptoMethod::Cmac`): one MAC per
//!   destination, verifiable only by that destination. We implement this
//!   with HMAC-SHA256 over a secret established, per ordered pair of
//!   replicas, during the key-exchange bootstrap of §4.3 (see DESIGN.md's
//!   Open Question notes for why this stands in for a true CMAC).

use std::fmt;

use ring::hmac;
use ring::rand::SystemRandom;
use ring::signature::{self, Ed25519KeyPair, KeyPair as _};

#[cfg(feature = "serialize_serde")]
use serde::{Deserialize, Serialize};

use parking_lot::RwLock;

use crate::bft::collections::{self, HashMap};
use crate::bft::communication::NodeId;
use crate::bft::error::*;

/// Selects the cryptographic primitive backing signatures, per the
/// `CRYPTO_METHOD` config option of §6.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
pub enum CryptoMethod {
    Rsa,
    Ed25519,
    Cmac,
}

impl CryptoMethod {
    pub fn mode(self) -> AuthMode {
        match self {
            CryptoMethod::Rsa | CryptoMethod::Ed25519 => AuthMode::Digital,
            CryptoMethod::Cmac => AuthMode::Authenticator,
        }
    }
}

/// The two message-authentication disciplines of §4.2.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum AuthMode {
    Digital,
    Authenticator,
}

/// A signature or authenticator tag, stored inline in the wire [`Header`](
/// crate::bft::communication::message::Header).
#[derive(Copy, Clone, Eq, PartialEq)]
pub struct Signature([u8; Signature::LENGTH]);

impl Signature {
    /// Large enough to hold an Ed25519 signature (64 bytes); HMAC-SHA256
    /// tags (32 bytes) are zero-padded into the remainder.
    pub const LENGTH: usize = 64;

    pub const fn zeroed() -> Self {
        Self([0; Self::LENGTH])
    }

    pub fn from_bytes(raw: &[u8]) -> Result<Self> {
        if raw.len() > Self::LENGTH {
            return Err("Signature has an invalid length")
                .wrapped(ErrorKind::CryptoSignature);
        }
        let mut inner = [0; Self::LENGTH];
        inner[..raw.len()].copy_from_slice(raw);
        Ok(Self(inner))
    }
}

impl AsRef<[u8]> for Signature {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Signature(..)")
    }
}

/// The verification material a replica publishes for itself, per §4.3.
#[derive(Clone)]
#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
pub struct PublicKey {
    method: CryptoMethod,
    #[cfg_attr(feature = "serialize_serde", serde(with = "serde_bytes"))]
    raw: Vec<u8>,
}

impl PublicKey {
    pub fn method(&self) -> CryptoMethod {
        self.method
    }

    /// Verifies a digital signature produced by [`KeyPair::sign_digital`].
    ///
    /// Always fails for keys belonging to an `Authenticator`-mode replica,
    /// since those never produce a broadcastable signature.
    pub fn verify_digital(&self, canonical: &[u8], sig: &Signature) -> bool {
        if self.method.mode() != AuthMode::Digital {
            return false;
        }
        self.verify_bootstrap(canonical, sig)
    }

    /// Verifies a signature produced by [`KeyPair::sign_bootstrap`],
    /// regardless of the key's configured `CRYPTO_METHOD` (§4.3): every
    /// replica's identity key is Ed25519, even one that runs pairwise
    /// authenticators for steady-state traffic.
    pub fn verify_bootstrap(&self, canonical: &[u8], sig: &Signature) -> bool {
        let unparsed = signature::UnparsedPublicKey::new(&signature::ED25519, &self.raw);
        unparsed.verify(canonical, &sig.0[..64]).is_ok()
    }
}

/// A frozen table of every replica's verification key, installed once the
/// key-exchange bootstrap of §4.3 completes.
#[derive(Clone)]
pub struct PublicKeySet {
    keys: HashMap<NodeId, PublicKey>,
}

impl PublicKeySet {
    pub fn empty() -> Self {
        Self {
            keys: collections::hash_map(),
        }
    }

    pub fn from_map(keys: HashMap<NodeId, PublicKey>) -> Self {
        Self { keys }
    }

    pub fn get(&self, id: NodeId) -> Option<&PublicKey> {
        self.keys.get(&id)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

/// A replica's own secret key material.
///
/// In `Authenticator` mode, `pairwise_secrets` is populated during §4.3's
/// key-exchange phase with one 32-byte shared secret per destination,
/// established directly over the bootstrap channel (before any adversarial
/// traffic is assumed); the Ed25519 keypair still signs the key-exchange
/// message itself, so a man-in-the-middle on the bootstrap phase is
/// detectable even in `Authenticator` mode.
pub struct KeyPair {
    method: CryptoMethod,
    ed25519: Ed25519KeyPair,
    ed25519_pkcs8: Vec<u8>,
    pairwise_secrets: RwLock<HashMap<NodeId, [u8; 32]>>,
}

impl KeyPair {
    pub fn generate(method: CryptoMethod) -> Result<Self> {
        let rng = SystemRandom::new();
        let pkcs8 = Ed25519KeyPair::generate_pkcs8(&rng)
            .simple(ErrorKind::CryptoSignature)?;
        let ed25519 = Ed25519KeyPair::from_pkcs8(pkcs8.as_ref())
            .simple(ErrorKind::CryptoSignature)?;
        Ok(Self {
            method,
            ed25519,
            ed25519_pkcs8: pkcs8.as_ref().to_vec(),
            pairwise_secrets: RwLock::new(collections::hash_map()),
        })
    }

    pub fn method(&self) -> CryptoMethod {
        self.method
    }

    pub fn public_key(&self) -> PublicKey {
        PublicKey {
            method: self.method,
            raw: self.ed25519.public_key().as_ref().to_vec(),
        }
    }

    /// Re-derives a usable keypair handle from stored PKCS8 bytes; used
    /// internally when the same secret needs to be shared across threads
    /// that each hold their own `Ed25519KeyPair` (which is `!Sync`).
    pub fn try_clone(&self) -> Result<Self> {
        let ed25519 = Ed25519KeyPair::from_pkcs8(&self.ed25519_pkcs8)
            .simple(ErrorKind::CryptoSignature)?;
        Ok(Self {
            method: self.method,
            ed25519,
            ed25519_pkcs8: self.ed25519_pkcs8.clone(),
            pairwise_secrets: RwLock::new(self.pairwise_secrets.read().clone()),
        })
    }

    /// Signs the bootstrap key-exchange payload itself; always a digital
    /// signature, regardless of `self.method`, since every replica must be
    /// able to authenticate this one broadcast message.
    pub fn sign_bootstrap(&self, canonical: &[u8]) -> Signature {
        let sig = self.ed25519.sign(canonical);
        Signature::from_bytes(sig.as_ref()).unwrap()
    }

    /// Digital-signature mode: signs a message once, for every receiver.
    pub fn sign_digital(&self, canonical: &[u8]) -> Signature {
        self.sign_bootstrap(canonical)
    }

    /// Authenticator mode: computes a MAC specific to `dest`.
    pub fn authenticate_for(&self, dest: NodeId, canonical: &[u8]) -> Result<Signature> {
        let secrets = self.pairwise_secrets.read();
        let secret = secrets
            .get(&dest)
            .ok_or("No pairwise secret established for destination")
            .simple(ErrorKind::CryptoSignature)?;
        let key = hmac::Key::new(hmac::HMAC_SHA256, secret);
        let tag = hmac::sign(&key, canonical);
        Signature::from_bytes(tag.as_ref())
    }

    /// Authenticator mode: verifies a MAC received from `sender`.
    pub fn verify_authenticated(
        &self,
        sender: NodeId,
        canonical: &[u8],
        sig: &Signature,
    ) -> bool {
        let secrets = self.pairwise_secrets.read();
        let secret = match secrets.get(&sender) {
            Some(s) => s,
            None => return false,
        };
        let key = hmac::Key::new(hmac::HMAC_SHA256, secret);
        hmac::verify(&key, canonical, &sig.0[..32]).is_ok()
    }

    /// Installs the pairwise secret shared with `peer`, established during
    /// §4.3's key-exchange bootstrap.
    pub fn install_pairwise_secret(&self, peer: NodeId, secret: [u8; 32]) {
        self.pairwise_secrets.write().insert(peer, secret);
    }

    /// Generates a fresh 32-byte secret to propose to a new peer.
    pub fn generate_pairwise_secret() -> [u8; 32] {
        use rand_core::{OsRng, RngCore};
        let mut secret = [0u8; 32];
        OsRng.fill_bytes(&mut secret);
        secret
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digital_signature_round_trips() {
        let key = KeyPair::generate(CryptoMethod::Ed25519).unwrap();
        let pk = key.public_key();
        let sig = key.sign_digital(b"decide seq 7");

        assert!(pk.verify_digital(b"decide seq 7", &sig));
        assert!(!pk.verify_digital(b"decide seq 8", &sig));
    }

    #[test]
    fn authenticator_mode_key_never_verifies_digitally() {
        let key = KeyPair::generate(CryptoMethod::Cmac).unwrap();
        let pk = key.public_key();
        let sig = key.sign_bootstrap(b"key-exchange announcement");

        assert!(!pk.verify_digital(b"key-exchange announcement", &sig));
        assert!(pk.verify_bootstrap(b"key-exchange announcement", &sig));
    }

    #[test]
    fn pairwise_authenticator_requires_installed_secret() {
        let alice = KeyPair::generate(CryptoMethod::Cmac).unwrap();
        let bob = NodeId::from(1u32);

        assert!(alice.authenticate_for(bob, b"ping").is_err());

        let secret = KeyPair::generate_pairwise_secret();
        alice.install_pairwise_secret(bob, secret);
        let tag = alice.authenticate_for(bob, b"ping").unwrap();

        // the receiver installs the same secret under the sender's id
        let receiver = KeyPair::generate(CryptoMethod::Cmac).unwrap();
        let sender_id = NodeId::from(0u32);
        receiver.install_pairwise_secret(sender_id, secret);
        assert!(receiver.verify_authenticated(sender_id, b"ping", &tag));
        assert!(!receiver.verify_authenticated(sender_id, b"pong", &tag));
    }

    #[test]
    fn public_key_set_looks_up_by_node_id() {
        let mut map = collections::hash_map();
        let key = KeyPair::generate(CryptoMethod::Ed25519).unwrap();
        map.insert(NodeId::from(0u32), key.public_key());
        let set = PublicKeySet::from_map(map);

        assert_eq!(set.len(), 1);
        assert!(set.get(NodeId::from(0u32)).is_some());
        assert!(set.get(NodeId::from(1u32)).is_none());
    }
}
