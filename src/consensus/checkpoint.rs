use std::collections::HashMap;

use tracing::{debug, error, info, warn};

use crate::common::crypto::{short, Digest};
use super::message::{Checkpoint, CheckpointEntry, Message, SeqNo};
use super::replica::Replica;

/// Votes collected for the checkpoint at one sequence number.
#[derive(Clone, Default, Debug)]
pub struct ChkpCert {
    pub sent_checkpoint: bool,
    /// This replica's own state digest at the sequence number.
    pub own_digest: Option<Digest>,
    pub checkpoints: Vec<Checkpoint>,
}

impl ChkpCert {
    fn has_vote_from(&self, replica: u64) -> bool {
        self.checkpoints.iter().any(|c| c.replica == replica)
    }

    /// The digest with the most votes and its count.
    fn leading(&self) -> Option<(Digest, usize)> {
        let mut tally: HashMap<Digest, usize> = HashMap::new();
        for c in &self.checkpoints {
            *tally.entry(c.digest).or_default() += 1;
        }
        tally.into_iter().max_by(|a, b| a.1.cmp(&b.1).then(a.0.cmp(&b.0)))
    }
}

impl Replica {
    /// Called after executing a sequence number that is a multiple of K.
    pub(crate) fn send_checkpoint(&mut self, n: SeqNo) {
        let digest = self.state_digest;
        let id = self.id;
        let cert = self.chkp_store.entry(n).or_default();
        if cert.sent_checkpoint {
            return;
        }
        let checkpoint = Checkpoint { sequence: n, digest, replica: id };
        cert.sent_checkpoint = true;
        cert.own_digest = Some(digest);
        if !cert.has_vote_from(id) {
            cert.checkpoints.push(checkpoint.clone());
        }

        info!(replica = id, seq = n, digest = %short(&digest), "sending checkpoint");
        self.broadcast(Message::Checkpoint(checkpoint));
        self.check_stable(n);
    }

    pub(crate) fn recv_checkpoint(&mut self, c: Checkpoint) {
        debug!(replica = self.id, from = c.replica, seq = c.sequence, "received checkpoint");
        if c.sequence <= self.h {
            debug!(replica = self.id, seq = c.sequence, h = self.h, "checkpoint below low watermark");
            return;
        }
        if !self.in_w(c.sequence) {
            warn!(replica = self.id, seq = c.sequence, "checkpoint above high watermark");
            return;
        }

        let n = c.sequence;
        let cert = self.chkp_store.entry(n).or_default();
        if cert.has_vote_from(c.replica) {
            warn!(replica = self.id, from = c.replica, seq = n, "duplicate checkpoint, ignoring");
            return;
        }
        cert.checkpoints.push(c);
        self.check_stable(n);
    }

    fn check_stable(&mut self, n: SeqNo) {
        let quorum = self.quorum.quorum();
        let Some(cert) = self.chkp_store.get(&n) else {
            return;
        };
        let Some((digest, count)) = cert.leading() else {
            return;
        };

        if count < quorum {
            if cert.checkpoints.len() >= quorum {
                warn!(replica = self.id, seq = n, votes = cert.checkpoints.len(), "checkpoint digests disagree, no stable checkpoint");
            }
            return;
        }
        match cert.own_digest {
            None => {
                debug!(replica = self.id, seq = n, "checkpoint quorum ahead of local execution");
                return;
            }
            Some(own) if own != digest => {
                error!(
                    replica = self.id,
                    seq = n,
                    own = %short(&own),
                    stable = %short(&digest),
                    "local state diverges from stable checkpoint, state transfer required"
                );
                return;
            }
            Some(_) => {}
        }

        self.move_watermarks(n, digest);
    }

    /// Makes the checkpoint at `n` stable: discards every log entry at or
    /// below it and slides the window to `(n, n + L]`.
    pub(crate) fn move_watermarks(&mut self, n: SeqNo, digest: Digest) {
        if n <= self.h {
            return;
        }

        for dropped in self.certs.truncate(n) {
            self.store.forget(&dropped);
        }
        self.pset.retain(|seq, _| *seq > n);
        self.qset.retain(|idx, _| idx.n > n);
        self.chkp_store.retain(|seq, _| *seq > n);
        self.committed.retain(|seq, _| *seq > n);

        self.h = n;
        self.stable_checkpoint = n;
        self.checkpoint_store.push(CheckpointEntry { sequence: n, digest });
        self.checkpoint_store.retain(|c| c.sequence >= n);
        info!(replica = self.id, h = n, high = self.high_water_mark(), "stable checkpoint, moved watermarks");

        if self.active_view && self.is_primary() {
            self.propose_outstanding();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::crypto::Keypair;
    use crate::consensus::config::ReplicaConfig;
    use crate::consensus::peers::Peers;

    fn replica() -> Replica {
        let keypairs: Vec<Keypair> = (0..4).map(|_| Keypair::new_pair()).collect();
        let peers = Peers::new(keypairs.iter().map(|k| k.pubkey()).collect());
        Replica::new(&ReplicaConfig::new(1, 1, 4), keypairs[0].clone(), peers).unwrap()
    }

    fn vote(replica: u64, digest: Digest) -> Checkpoint {
        Checkpoint { sequence: 10, digest, replica }
    }

    #[test]
    fn test_split_digests_never_stabilize() {
        let mut replica = replica();
        replica.recv_checkpoint(vote(2, [1u8; 32]));
        replica.recv_checkpoint(vote(3, [2u8; 32]));
        replica.recv_checkpoint(vote(4, [1u8; 32]));

        assert_eq!(replica.chkp_store[&10].checkpoints.len(), 3);
        assert_eq!(replica.h, 0);
        assert_eq!(replica.stable_checkpoint, 0);
    }

    #[test]
    fn test_quorum_against_own_digest_does_not_move_watermarks() {
        let mut replica = replica();
        replica.send_checkpoint(10);
        let own = replica.state_digest();
        let other = [9u8; 32];
        assert_ne!(own, other);

        for id in 2..=4 {
            replica.recv_checkpoint(vote(id, other));
        }
        assert_eq!(replica.h, 0);
        assert_eq!(replica.stable_checkpoint, 0);
        assert!(replica.chkp_store.contains_key(&10));
    }

    #[test]
    fn test_matching_quorum_moves_watermarks() {
        let mut replica = replica();
        replica.send_checkpoint(10);
        let own = replica.state_digest();

        replica.recv_checkpoint(vote(2, own));
        assert_eq!(replica.h, 0);
        replica.recv_checkpoint(vote(3, own));
        assert_eq!(replica.h, 10);
        assert_eq!(replica.stable_checkpoint, 10);
        assert!(!replica.chkp_store.contains_key(&10));
        assert_eq!(replica.high_water_mark(), 10 + replica.quorum.l);
    }

    #[test]
    fn test_leading_digest() {
        let mut cert = ChkpCert::default();
        assert!(cert.leading().is_none());
        for (replica, digest) in [(1, [1u8; 32]), (2, [2u8; 32]), (3, [1u8; 32])] {
            cert.checkpoints.push(Checkpoint { sequence: 10, digest, replica });
        }
        assert_eq!(cert.leading(), Some(([1u8; 32], 2)));
        assert!(cert.has_vote_from(2));
        assert!(!cert.has_vote_from(4));
    }
}
