use std::collections::HashMap;

use crate::common::crypto::Digest;
use super::message::{Commit, PrePrepare, Prepare, SeqNo, View};

/*
    The three-phase log. One certificate per (view, sequence) slot collects
    the accepted pre-prepare and the prepare and commit votes for it; the
    sent_* flags record what this replica already broadcast for the slot so
    re-delivered messages never trigger a second send.

    A slot moves Empty -> PrePrepared -> Prepared -> Committed -> Executed.
    Prepared needs quorum - 1 prepares matching the pre-prepare (the primary
    never prepares), Committed needs quorum matching commits.
*/

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub struct MsgId {
    pub v: View,
    pub n: SeqNo,
}

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub enum SlotState {
    Empty,
    PrePrepared,
    Prepared,
    Committed,
    Executed,
}

#[derive(Clone, Default, Debug)]
pub struct MsgCert {
    pub digest: Option<Digest>,
    pub pre_prepare: Option<PrePrepare>,
    pub sent_pre_prepare: bool,
    pub sent_prepare: bool,
    pub prepare: Vec<Prepare>,
    pub sent_commit: bool,
    pub commit: Vec<Commit>,
    /// Queued for execution.
    pub committed: bool,
    pub sent_reply: bool,
}

impl MsgCert {
    /// Records a prepare; false if this replica already voted in the slot.
    pub fn add_prepare(&mut self, prepare: Prepare) -> bool {
        if self.prepare.iter().any(|p| p.replica == prepare.replica) {
            return false;
        }
        self.prepare.push(prepare);
        true
    }

    /// Records a commit; false if this replica already voted in the slot.
    pub fn add_commit(&mut self, commit: Commit) -> bool {
        if self.commit.iter().any(|c| c.replica == commit.replica) {
            return false;
        }
        self.commit.push(commit);
        true
    }

    pub fn prepare_count(&self, digest: &Digest) -> usize {
        self.prepare.iter().filter(|p| p.digest == *digest).count()
    }

    pub fn commit_count(&self, digest: &Digest) -> usize {
        self.commit.iter().filter(|c| c.digest == *digest).count()
    }

    pub fn is_pre_prepared(&self, digest: &Digest, v: View, n: SeqNo) -> bool {
        match &self.pre_prepare {
            Some(pp) => pp.view == v && pp.sequence == n && pp.digest == *digest,
            None => false,
        }
    }

    pub fn is_prepared(&self, digest: &Digest, v: View, n: SeqNo, quorum: usize) -> bool {
        self.is_pre_prepared(digest, v, n) && self.prepare_count(digest) + 1 >= quorum
    }

    pub fn is_committed(&self, digest: &Digest, v: View, n: SeqNo, quorum: usize) -> bool {
        self.is_prepared(digest, v, n, quorum) && self.commit_count(digest) >= quorum
    }

    pub fn state(&self, v: View, n: SeqNo, quorum: usize) -> SlotState {
        let Some(digest) = self.digest else {
            return SlotState::Empty;
        };
        if self.sent_reply {
            SlotState::Executed
        } else if self.is_committed(&digest, v, n, quorum) {
            SlotState::Committed
        } else if self.is_prepared(&digest, v, n, quorum) {
            SlotState::Prepared
        } else if self.is_pre_prepared(&digest, v, n) {
            SlotState::PrePrepared
        } else {
            SlotState::Empty
        }
    }
}

#[derive(Default)]
pub struct CertStore {
    certs: HashMap<MsgId, MsgCert>,
}

impl CertStore {
    pub fn new() -> Self {
        CertStore::default()
    }

    /// The certificate for `(v, n)`, created empty on first use.
    pub fn get_cert(&mut self, v: View, n: SeqNo) -> &mut MsgCert {
        self.certs.entry(MsgId { v, n }).or_default()
    }

    pub fn get(&self, v: View, n: SeqNo) -> Option<&MsgCert> {
        self.certs.get(&MsgId { v, n })
    }

    pub fn iter(&self) -> impl Iterator<Item = (&MsgId, &MsgCert)> {
        self.certs.iter()
    }

    pub fn len(&self) -> usize {
        self.certs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.certs.is_empty()
    }

    pub fn contains_digest(&self, digest: &Digest) -> bool {
        self.certs.values().any(|cert| cert.digest.as_ref() == Some(digest))
    }

    /// Sequence already assigned to `digest` in view `v`, if any.
    pub fn sequence_of(&self, digest: &Digest, v: View) -> Option<SeqNo> {
        self.certs
            .iter()
            .find(|(idx, cert)| idx.v == v && cert.digest.as_ref() == Some(digest))
            .map(|(idx, _)| idx.n)
    }

    /// Drops every slot with `n <= h` and returns the digests it held.
    pub fn truncate(&mut self, h: SeqNo) -> Vec<Digest> {
        let mut dropped = Vec::new();
        self.certs.retain(|idx, cert| {
            if idx.n <= h {
                dropped.extend(cert.digest);
                false
            } else {
                true
            }
        });
        dropped
    }

    pub fn clear(&mut self) {
        self.certs.clear();
    }
}
