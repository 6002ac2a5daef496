//! Bootstrap key exchange (§4.3): every replica broadcasts its public
//! key (signed with its own Ed25519 identity key, regardless of the
//! configured `CRYPTO_METHOD`), and in `Authenticator` mode additionally
//! unicasts a freshly generated pairwise secret to each peer. A replica
//! is considered bootstrapped once it holds keys for all `n` peers.

use crate::bft::collections::{self, HashMap};
use crate::bft::communication::message::KeyExchangeMessage;
use crate::bft::communication::NodeId;
use crate::bft::crypto::signature::{AuthMode, KeyPair, PublicKey, PublicKeySet};
use crate::bft::error::*;

/// Tracks in-progress key exchange until every peer has checked in.
pub struct KeyExchange {
    n: usize,
    collected: HashMap<NodeId, PublicKey>,
}

impl KeyExchange {
    pub fn new(n: usize) -> Self {
        Self {
            n,
            collected: collections::hash_map(),
        }
    }

    /// Builds the outbound `KeyExchangeMessage` this replica broadcasts
    /// at startup. In `Authenticator` mode, callers must additionally
    /// unicast a per-destination copy carrying a fresh pairwise secret
    /// (see `KeyPair::generate_pairwise_secret`); this method returns the
    /// broadcast-only variant, with no pairwise secret attached.
    pub fn announcement(my_key: &KeyPair) -> KeyExchangeMessage {
        KeyExchangeMessage {
            method: my_key.method(),
            public_key: my_key.public_key(),
            pairwise_secret: None,
        }
    }

    /// Builds the unicast copy carrying a secret proposal for `dest`,
    /// used only in `Authenticator` mode.
    pub fn unicast_secret(my_key: &KeyPair, secret: [u8; 32]) -> KeyExchangeMessage {
        KeyExchangeMessage {
            method: my_key.method(),
            public_key: my_key.public_key(),
            pairwise_secret: Some(secret),
        }
    }

    /// Records a peer's announcement, installing any pairwise secret it
    /// carried into `my_key`.
    pub fn receive(&mut self, from: NodeId, my_key: &KeyPair, msg: KeyExchangeMessage) {
        if let (AuthMode::Authenticator, Some(secret)) = (msg.method.mode(), msg.pairwise_secret) {
            my_key.install_pairwise_secret(from, secret);
        }
        self.collected.insert(from, msg.public_key);
    }

    /// `collected` never gains an entry for this replica's own id: it only
    /// ever receives announcements from its `n - 1` peers, never from
    /// itself, so completion is `n - 1` collected keys, not `n`.
    pub fn is_complete(&self) -> bool {
        self.collected.len() + 1 >= self.n
    }

    pub fn into_public_key_set(self) -> Result<PublicKeySet> {
        if !self.is_complete() {
            return Err("Key exchange has not collected every peer's key")
                .wrapped(ErrorKind::Communication);
        }
        Ok(PublicKeySet::from_map(self.collected))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bft::crypto::signature::CryptoMethod;

    #[test]
    fn completes_after_every_peer_checks_in_not_including_self() {
        let mut ke = KeyExchange::new(4);
        let my_key = KeyPair::generate(CryptoMethod::Ed25519).unwrap();

        for id in 1..4u32 {
            let peer_key = KeyPair::generate(CryptoMethod::Ed25519).unwrap();
            let msg = KeyExchange::announcement(&peer_key);
            assert!(!ke.is_complete());
            ke.receive(NodeId::from(id), &my_key, msg);
        }

        assert!(ke.is_complete());
        let set = ke.into_public_key_set().expect("complete exchange");
        assert_eq!(set.len(), 3);
    }

    #[test]
    fn incomplete_exchange_is_rejected() {
        let ke = KeyExchange::new(4);
        assert!(ke.into_public_key_set().is_err());
    }

    #[test]
    fn authenticator_mode_installs_pairwise_secret_on_receive() {
        let mut ke = KeyExchange::new(2);
        let my_key = KeyPair::generate(CryptoMethod::Cmac).unwrap();
        let peer_key = KeyPair::generate(CryptoMethod::Cmac).unwrap();
        let secret = KeyPair::generate_pairwise_secret();
        let msg = KeyExchange::unicast_secret(&peer_key, secret);

        ke.receive(NodeId::from(1u32), &my_key, msg);
        assert!(my_key.authenticate_for(NodeId::from(1u32), b"ping").is_ok());
    }
}
