use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::common::crypto::{Digest, Hashable, Hasher, Keypair, Signature, NULL_DIGEST};

/*
    The messages of the three-phase protocol, checkpointing and view change.
    A replica signs the digest of every message it sends; the envelope
    signature of a view-change doubles as the proof carried in a new-view,
    since both are computed over the view-change digest.
*/

pub type ReplicaId = u64;
pub type View = u64;
pub type SeqNo = u64;

/// Operation submitted by a client. `(client, timestamp)` identifies it.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct RequestClient {
    pub client: String,
    pub timestamp: u64,
    pub op: Vec<u8>,
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct PrePrepare {
    pub view: View,
    pub sequence: SeqNo,
    pub digest: Digest,
    /// Carried so backups can check the digest; `None` for a null request.
    pub request: Option<RequestClient>,
    pub replica: ReplicaId,
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Prepare {
    pub view: View,
    pub sequence: SeqNo,
    pub digest: Digest,
    pub replica: ReplicaId,
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Commit {
    pub view: View,
    pub sequence: SeqNo,
    pub digest: Digest,
    pub replica: ReplicaId,
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct ClientReply {
    pub view: View,
    pub sequence: SeqNo,
    pub timestamp: u64,
    pub client: String,
    pub replica: ReplicaId,
    pub result: Vec<u8>,
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Checkpoint {
    pub sequence: SeqNo,
    pub digest: Digest,
    pub replica: ReplicaId,
}

/// An entry of the P or Q set: `<n, d, v>`.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct PqEntry {
    pub view: View,
    pub sequence: SeqNo,
    pub digest: Digest,
}

/// A checkpoint a replica vouches for in its view-change.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct CheckpointEntry {
    pub sequence: SeqNo,
    pub digest: Digest,
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct ViewChange {
    pub view: View,
    pub h: SeqNo,
    pub cset: Vec<CheckpointEntry>,
    pub pset: Vec<PqEntry>,
    pub qset: Vec<PqEntry>,
    pub replica: ReplicaId,
}

/// A view-change together with its sender's signature over `vc.hash()`.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct SignedViewChange {
    pub vc: ViewChange,
    pub sig: Signature,
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct ViewChangeAck {
    pub view: View,
    pub replica: ReplicaId,
    pub vc_sender: ReplicaId,
    pub digest: Digest,
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct NewView {
    pub view: View,
    pub vset: Vec<SignedViewChange>,
    /// The O set: sequence number to request digest, `NULL_DIGEST` for gaps.
    pub xset: BTreeMap<SeqNo, Digest>,
    pub requests: Vec<RequestClient>,
    pub replica: ReplicaId,
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub enum Message {
    PrePrepare(PrePrepare),
    Prepare(Prepare),
    Commit(Commit),
    Checkpoint(Checkpoint),
    ViewChange(ViewChange),
    ViewChangeAck(ViewChangeAck),
    NewView(NewView),
    Reply(ClientReply),
}

impl Message {
    pub fn kind(&self) -> &'static str {
        match self {
            Message::PrePrepare(_) => "pre-prepare",
            Message::Prepare(_) => "prepare",
            Message::Commit(_) => "commit",
            Message::Checkpoint(_) => "checkpoint",
            Message::ViewChange(_) => "view-change",
            Message::ViewChangeAck(_) => "view-change-ack",
            Message::NewView(_) => "new-view",
            Message::Reply(_) => "reply",
        }
    }

    /// Replica id the message claims as its author.
    pub fn author(&self) -> ReplicaId {
        match self {
            Message::PrePrepare(m) => m.replica,
            Message::Prepare(m) => m.replica,
            Message::Commit(m) => m.replica,
            Message::Checkpoint(m) => m.replica,
            Message::ViewChange(m) => m.replica,
            Message::ViewChangeAck(m) => m.replica,
            Message::NewView(m) => m.replica,
            Message::Reply(m) => m.replica,
        }
    }
}

/// What travels between replicas.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct SignedMessage {
    pub from: ReplicaId,
    pub message: Message,
    pub sig: Signature,
}

impl SignedMessage {
    pub fn new(from: ReplicaId, message: Message, keypair: &Keypair) -> Self {
        let sig = keypair.sign(&message.hash());
        SignedMessage { from, message, sig }
    }
}

impl RequestClient {
    pub fn new(client: impl Into<String>, timestamp: u64, op: Vec<u8>) -> Self {
        RequestClient {
            client: client.into(),
            timestamp,
            op,
        }
    }
}

impl PrePrepare {
    pub fn is_null(&self) -> bool {
        self.digest == NULL_DIGEST
    }
}

impl Hashable for RequestClient {
    fn hash(&self) -> Digest {
        let mut hasher = Hasher::new(b"request");
        hasher.bytes(self.client.as_bytes()).u64(self.timestamp).bytes(&self.op);
        hasher.finish()
    }
}

impl Hashable for PrePrepare {
    fn hash(&self) -> Digest {
        let mut hasher = Hasher::new(b"pre-prepare");
        hasher.u64(self.view).u64(self.sequence).digest(&self.digest).u64(self.replica);
        match &self.request {
            Some(request) => hasher.digest(&request.hash()),
            None => hasher.digest(&NULL_DIGEST),
        };
        hasher.finish()
    }
}

impl Hashable for Prepare {
    fn hash(&self) -> Digest {
        let mut hasher = Hasher::new(b"prepare");
        hasher.u64(self.view).u64(self.sequence).digest(&self.digest).u64(self.replica);
        hasher.finish()
    }
}

impl Hashable for Commit {
    fn hash(&self) -> Digest {
        let mut hasher = Hasher::new(b"commit");
        hasher.u64(self.view).u64(self.sequence).digest(&self.digest).u64(self.replica);
        hasher.finish()
    }
}

impl Hashable for ClientReply {
    fn hash(&self) -> Digest {
        let mut hasher = Hasher::new(b"reply");
        hasher
            .u64(self.view)
            .u64(self.sequence)
            .u64(self.timestamp)
            .bytes(self.client.as_bytes())
            .u64(self.replica)
            .bytes(&self.result);
        hasher.finish()
    }
}

impl Hashable for Checkpoint {
    fn hash(&self) -> Digest {
        let mut hasher = Hasher::new(b"checkpoint");
        hasher.u64(self.sequence).digest(&self.digest).u64(self.replica);
        hasher.finish()
    }
}

impl Hashable for ViewChange {
    fn hash(&self) -> Digest {
        let mut hasher = Hasher::new(b"view-change");
        hasher.u64(self.view).u64(self.h).u64(self.replica);
        hasher.u64(self.cset.len() as u64);
        for c in &self.cset {
            hasher.u64(c.sequence).digest(&c.digest);
        }
        for set in [&self.pset, &self.qset] {
            hasher.u64(set.len() as u64);
            for entry in set {
                hasher.u64(entry.view).u64(entry.sequence).digest(&entry.digest);
            }
        }
        hasher.finish()
    }
}

impl Hashable for ViewChangeAck {
    fn hash(&self) -> Digest {
        let mut hasher = Hasher::new(b"view-change-ack");
        hasher.u64(self.view).u64(self.replica).u64(self.vc_sender).digest(&self.digest);
        hasher.finish()
    }
}

impl Hashable for NewView {
    fn hash(&self) -> Digest {
        let mut hasher = Hasher::new(b"new-view");
        hasher.u64(self.view).u64(self.replica);
        hasher.u64(self.vset.len() as u64);
        for signed in &self.vset {
            hasher.digest(&signed.vc.hash());
        }
        hasher.u64(self.xset.len() as u64);
        for (n, d) in &self.xset {
            hasher.u64(*n).digest(d);
        }
        hasher.u64(self.requests.len() as u64);
        for request in &self.requests {
            hasher.digest(&request.hash());
        }
        hasher.finish()
    }
}

impl Hashable for Message {
    fn hash(&self) -> Digest {
        match self {
            Message::PrePrepare(m) => m.hash(),
            Message::Prepare(m) => m.hash(),
            Message::Commit(m) => m.hash(),
            Message::Checkpoint(m) => m.hash(),
            Message::ViewChange(m) => m.hash(),
            Message::ViewChangeAck(m) => m.hash(),
            Message::NewView(m) => m.hash(),
            Message::Reply(m) => m.hash(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_digest_depends_on_every_field() {
        let base = RequestClient::new("client-1", 7, b"op1".to_vec());
        let mut other_client = base.clone();
        other_client.client = "client-2".into();
        let mut other_time = base.clone();
        other_time.timestamp = 8;
        let mut other_op = base.clone();
        other_op.op = b"op2".to_vec();

        assert_eq!(base.hash(), base.clone().hash());
        assert_ne!(base.hash(), other_client.hash());
        assert_ne!(base.hash(), other_time.hash());
        assert_ne!(base.hash(), other_op.hash());
        assert_ne!(base.hash(), NULL_DIGEST);
    }

    #[test]
    fn test_prepare_and_commit_do_not_collide() {
        let digest = RequestClient::new("c", 1, vec![1]).hash();
        let prepare = Prepare { view: 1, sequence: 1, digest, replica: 2 };
        let commit = Commit { view: 1, sequence: 1, digest, replica: 2 };
        assert_ne!(prepare.hash(), commit.hash());
    }

    #[test]
    fn test_signed_view_change_signature_reused_as_proof() {
        let keypair = Keypair::new_pair();
        let vc = ViewChange { view: 2, h: 0, cset: vec![], pset: vec![], qset: vec![], replica: 3 };
        let signed = SignedMessage::new(3, Message::ViewChange(vc.clone()), &keypair);
        assert!(signed.sig.verify(&vc.hash()));
        assert_eq!(signed.message.author(), 3);
    }
}
