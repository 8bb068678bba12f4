use crate::common::crypto::{Digest, Pubkey, Signature};
use super::message::{ReplicaId, View};

/// Replica public keys; replica `i` (1-based) owns `members[i - 1]`.
#[derive(Debug, Clone)]
pub struct Peers {
    pub members: Vec<Pubkey>,
}

impl Peers {
    pub fn new(members: Vec<Pubkey>) -> Self {
        Peers { members }
    }

    pub fn len(&self) -> u64 {
        self.members.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = ReplicaId> {
        1..=self.len()
    }

    /// Primary of view `v`. Views start at 1, so view `v` maps to replica
    /// `((v - 1) mod N) + 1`; view 0 maps to replica N.
    pub fn primary(&self, view: View) -> ReplicaId {
        let n = self.len().max(1);
        (view + n - 1) % n + 1
    }

    pub fn pubkey(&self, id: ReplicaId) -> Option<&Pubkey> {
        if id == 0 {
            return None;
        }
        self.members.get((id - 1) as usize)
    }

    /// True when `sig` was produced by replica `id` over `digest`.
    pub fn verify(&self, id: ReplicaId, sig: &Signature, digest: &Digest) -> bool {
        match self.pubkey(id) {
            Some(pubkey) => *pubkey == sig.signer && sig.verify(digest),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::crypto::Keypair;

    #[test]
    fn test_primary_rotation() {
        let keys: Vec<_> = (0..4).map(|_| Keypair::new_pair().pubkey()).collect();
        let peers = Peers::new(keys);
        assert_eq!(peers.primary(1), 1);
        assert_eq!(peers.primary(2), 2);
        assert_eq!(peers.primary(3), 3);
        assert_eq!(peers.primary(4), 4);
        assert_eq!(peers.primary(5), 1);
        assert_eq!(peers.primary(0), 4);
    }

    #[test]
    fn test_verify_checks_signer_identity() {
        let a = Keypair::new_pair();
        let b = Keypair::new_pair();
        let peers = Peers::new(vec![a.pubkey(), b.pubkey()]);
        let digest = [9u8; 32];
        let sig = a.sign(&digest);
        assert!(peers.verify(1, &sig, &digest));
        assert!(!peers.verify(2, &sig, &digest));
        assert!(!peers.verify(3, &sig, &digest));
        assert!(!peers.verify(0, &sig, &digest));
    }
}
