use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::common::crypto::{short, Digest, Hashable, Hasher, Keypair, NULL_DIGEST};
use crate::common::timer::TimerKind;
use super::cert::{CertStore, MsgId, SlotState};
use super::checkpoint::ChkpCert;
use super::config::{Quorum, ReplicaConfig};
use super::error::{PbftError, PbftResult};
use super::message::{
    CheckpointEntry, ClientReply, Commit, Message, NewView, PqEntry, PrePrepare, Prepare, ReplicaId,
    RequestClient, SeqNo, SignedMessage, SignedViewChange, View, ViewChangeAck,
};
use super::peers::Peers;
use super::store::Store;
use super::view_change::{AckIdx, QIdx, VcIdx};
use super::wal::RequestWal;

/*
    Normal case operation (Castro & Liskov, section 4.2). The primary
    assigns a sequence number n to a request and multicasts a pre-prepare
    <v, n, d>. A backup accepts it if it is in view v, has not accepted a
    pre-prepare for v and n with a different digest, and h < n <= H. It then
    multicasts a prepare. A replica is prepared once it holds the pre-prepare
    and 2f matching prepares, and then multicasts a commit; it is committed
    once it holds 2f+1 matching commits. Requests execute in sequence order.

    The replica is a plain state machine: every handler runs to completion on
    the processor's single loop and leaves its side effects in the action
    queue, which the processor drains after each event.
*/

/// Side effects requested by the replica, drained by the processor.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Action {
    Broadcast(SignedMessage),
    Send { to: ReplicaId, message: SignedMessage },
    Reply(ClientReply),
    Execute(CommittedRequest),
    StartTimer { kind: TimerKind, reason: &'static str, duration: Duration },
    StopTimer(TimerKind),
}

/// A request executed at `sequence`, in total order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommittedRequest {
    pub view: View,
    pub sequence: SeqNo,
    pub digest: Digest,
    pub request: RequestClient,
}

#[derive(Clone, Copy, Debug)]
pub(crate) struct Timeouts {
    pub view_change: Duration,
    pub resend: Duration,
    pub new_view: Duration,
    pub last_new_view: Duration,
}

pub struct Replica {
    pub id: ReplicaId,
    pub(crate) keypair: Keypair,
    pub peers: Peers,
    pub quorum: Quorum,

    pub view: View,
    pub active_view: bool,
    pub seq_no: SeqNo,
    pub last_exec: SeqNo,
    pub stable_checkpoint: SeqNo,
    pub h: SeqNo,
    pub byzantine: bool,

    pub store: Store,
    pub certs: CertStore,
    pub chkp_store: HashMap<SeqNo, ChkpCert>,
    pub checkpoint_store: Vec<CheckpointEntry>,
    pub pset: BTreeMap<SeqNo, PqEntry>,
    pub qset: HashMap<QIdx, PqEntry>,
    pub sset: HashMap<VcIdx, SignedViewChange>,
    pub view_change_store: HashMap<VcIdx, SignedViewChange>,
    pub ack_store: HashMap<AckIdx, ViewChangeAck>,
    pub new_view_store: HashMap<View, NewView>,
    pub(crate) new_view_acks: HashMap<View, HashSet<ReplicaId>>,
    pub(crate) vc_quorum_seen: Option<View>,

    /// Committed slots waiting for their predecessor to execute.
    pub(crate) committed: BTreeMap<SeqNo, MsgId>,
    pub(crate) state_digest: Digest,
    pub(crate) timeouts: Timeouts,
    armed: HashMap<TimerKind, View>,
    wal: Option<RequestWal>,
    actions: Vec<Action>,
}

impl Replica {
    pub fn new(config: &ReplicaConfig, keypair: Keypair, peers: Peers) -> PbftResult<Self> {
        let quorum = Quorum::new(config, peers.len())?;
        match peers.pubkey(config.id) {
            Some(pubkey) if *pubkey == keypair.pubkey() => {}
            _ => return Err(PbftError::UnknownReplica(config.id)),
        }

        let mut genesis = Hasher::new(b"genesis");
        genesis.bytes(config.genesis.genesis.as_bytes()).u64(config.genesis.genesis_block_time);
        let genesis_digest = genesis.finish();

        let mut replica = Replica {
            id: config.id,
            keypair,
            peers,
            quorum,
            view: config.initial_view,
            active_view: true,
            seq_no: 0,
            last_exec: 0,
            stable_checkpoint: 0,
            h: 0,
            byzantine: config.byzantine,
            store: Store::new(),
            certs: CertStore::new(),
            chkp_store: HashMap::new(),
            checkpoint_store: vec![CheckpointEntry { sequence: 0, digest: genesis_digest }],
            pset: BTreeMap::new(),
            qset: HashMap::new(),
            sset: HashMap::new(),
            view_change_store: HashMap::new(),
            ack_store: HashMap::new(),
            new_view_store: HashMap::new(),
            new_view_acks: HashMap::new(),
            vc_quorum_seen: None,
            committed: BTreeMap::new(),
            state_digest: genesis_digest,
            timeouts: Timeouts {
                view_change: config.view_change_timeout(),
                resend: config.view_change_resend_timeout(),
                new_view: config.new_view_timeout(),
                last_new_view: config.new_view_timeout(),
            },
            armed: HashMap::new(),
            wal: None,
            actions: Vec::new(),
        };

        if let Some(path) = &config.wal_path {
            let wal = RequestWal::open(path)?;
            let recovered = wal.replay()?;
            info!(replica = replica.id, requests = recovered.len(), "replaying request log");
            for request in recovered {
                replica.store.add_request(request);
            }
            replica.wal = Some(wal);
        }

        debug!(replica = replica.id, n = quorum.n, f = quorum.f, count = quorum.replica_count, "PBFT basic info");
        debug!(replica = replica.id, log_size = quorum.l, byzantine = replica.byzantine, "PBFT basic info");
        Ok(replica)
    }

    /// Drains the side effects produced so far.
    pub fn take_actions(&mut self) -> Vec<Action> {
        std::mem::take(&mut self.actions)
    }

    //=====================================================
    // Inbound
    //=====================================================

    /// Entry point for protocol messages from the transport.
    pub fn deliver(&mut self, sender: ReplicaId, envelope: SignedMessage) {
        if let Err(err) = self.verify_envelope(sender, &envelope) {
            warn!(replica = self.id, %err, "dropping message");
            return;
        }
        if sender == self.id {
            return;
        }

        match envelope.message {
            Message::PrePrepare(pp) => self.recv_pre_prepare(pp),
            Message::Prepare(p) => self.recv_prepare(p),
            Message::Commit(c) => self.recv_commit(c),
            Message::Checkpoint(c) => self.recv_checkpoint(c),
            Message::ViewChange(vc) => self.recv_view_change(SignedViewChange { vc, sig: envelope.sig }),
            Message::ViewChangeAck(ack) => self.recv_view_change_ack(ack),
            Message::NewView(nv) => self.recv_new_view(nv),
            Message::Reply(reply) => {
                debug!(replica = self.id, from = reply.replica, "replica ignores client replies");
            }
        }
    }

    fn verify_envelope(&self, sender: ReplicaId, envelope: &SignedMessage) -> PbftResult<()> {
        if envelope.from != sender {
            return Err(PbftError::SenderMismatch { claimed: envelope.from, actual: sender });
        }
        let author = envelope.message.author();
        if author != sender {
            return Err(PbftError::SenderMismatch { claimed: author, actual: sender });
        }
        if !self.peers.verify(sender, &envelope.sig, &envelope.message.hash()) {
            return Err(PbftError::InvalidSignature { from: sender });
        }
        Ok(())
    }

    /// A client request, either sent directly by the client or resubmitted.
    pub fn recv_request(&mut self, request: RequestClient) {
        if let Some(reply) = self.store.reply_for(&request.client, request.timestamp).cloned() {
            info!(replica = self.id, client = %request.client, timestamp = request.timestamp, "request already executed, resending reply");
            self.actions.push(Action::Reply(reply));
            return;
        }

        let (digest, is_new) = self.store.add_request(request.clone());
        if is_new {
            self.persist_request(&request);
        }
        info!(replica = self.id, view = self.view, digest = %short(&digest), "received client request");

        if !self.active_view {
            info!(replica = self.id, "view change in progress, request queued");
            return;
        }

        if self.is_primary() {
            if self.certs.sequence_of(&digest, self.view).is_some() {
                debug!(replica = self.id, digest = %short(&digest), "request already assigned a sequence number");
                return;
            }
            self.send_pre_prepare(request, digest);
        } else if !self.is_timer_armed(TimerKind::ViewChange) {
            // Backups expect the primary to get this request executed in time.
            self.start_timer(TimerKind::ViewChange, "View-change", self.timeouts.view_change);
        }
    }

    pub fn handle_timeout(&mut self, kind: TimerKind) {
        let Some(armed_view) = self.armed.remove(&kind) else {
            debug!(replica = self.id, timer = ?kind, "timer not armed, ignoring fire");
            return;
        };
        if armed_view != self.view {
            debug!(replica = self.id, timer = ?kind, armed_view, view = self.view, "stale timer fire");
            return;
        }

        info!(replica = self.id, timer = ?kind, view = self.view, "timer fired");
        match kind {
            TimerKind::ViewChange if self.active_view => self.send_view_change(self.view + 1),
            TimerKind::ViewChangeResend if !self.active_view => self.resend_view_change(),
            TimerKind::NewView if !self.active_view => self.send_view_change(self.view + 1),
            _ => debug!(replica = self.id, timer = ?kind, "timer fire does not apply in this state"),
        }
    }

    //=====================================================
    // Three-phase agreement
    //=====================================================

    pub(crate) fn send_pre_prepare(&mut self, request: RequestClient, digest: Digest) -> bool {
        let n = self.seq_no + 1;
        if let Some(assigned) = self.certs.sequence_of(&digest, self.view) {
            warn!(replica = self.id, assigned, n, "pre-prepare with same digest but different sequence number");
            return false;
        }
        if !self.in_w(n) {
            warn!(replica = self.id, n, h = self.h, "sequence number out of watermarks, waiting for checkpoint");
            return false;
        }

        self.seq_no = n;
        let pp = PrePrepare {
            view: self.view,
            sequence: n,
            digest,
            request: Some(request),
            replica: self.id,
        };
        let cert = self.certs.get_cert(self.view, n);
        cert.digest = Some(digest);
        cert.pre_prepare = Some(pp.clone());
        cert.sent_pre_prepare = true;
        info!(replica = self.id, view = self.view, seq = n, digest = %short(&digest), "sending pre-prepare");

        if self.byzantine {
            self.equivocate(&pp);
        } else {
            self.broadcast(Message::PrePrepare(pp));
        }
        self.maybe_send_commit(self.view, n, digest);
        true
    }

    /// Fault injection: every backup gets a different request for the slot.
    fn equivocate(&mut self, pp: &PrePrepare) {
        warn!(replica = self.id, seq = pp.sequence, "byzantine primary sending conflicting pre-prepares");
        let targets: Vec<_> = self.peers.ids().filter(|id| *id != self.id).collect();
        for to in targets {
            let mut forged = pp.clone();
            if let Some(request) = forged.request.as_mut() {
                request.op.extend_from_slice(&to.to_be_bytes());
                forged.digest = request.hash();
            }
            self.send_to(to, Message::PrePrepare(forged));
        }
    }

    pub(crate) fn recv_pre_prepare(&mut self, pp: PrePrepare) {
        debug!(replica = self.id, view = pp.view, seq = pp.sequence, "received pre-prepare");
        if self.is_primary() {
            debug!(replica = self.id, "primary ignores pre-prepare");
            return;
        }
        if !self.active_view {
            info!(replica = self.id, "view change in progress, ignoring pre-prepare");
            return;
        }
        if pp.replica != self.primary_id() {
            warn!(replica = self.id, from = pp.replica, "pre-prepare not from primary");
            return;
        }
        if !self.in_vw(pp.view, pp.sequence) {
            warn!(replica = self.id, view = pp.view, seq = pp.sequence, h = self.h, "pre-prepare not in view or watermarks");
            return;
        }
        if let Some(existing) = self.certs.get(pp.view, pp.sequence).and_then(|cert| cert.digest) {
            if existing != pp.digest {
                warn!(replica = self.id, seq = pp.sequence, "conflicting pre-prepare for slot, rejected");
                return;
            }
        }

        if pp.is_null() {
            if pp.request.is_some() {
                warn!(replica = self.id, "null pre-prepare carries a request");
                return;
            }
        } else {
            match &pp.request {
                Some(request) if request.hash() == pp.digest => {
                    let (_, is_new) = self.store.add_request(request.clone());
                    if is_new {
                        self.persist_request(request);
                    }
                }
                Some(_) => {
                    warn!(replica = self.id, seq = pp.sequence, "pre-prepare does not match client request");
                    return;
                }
                None if self.store.has_request(&pp.digest) => {}
                None => {
                    warn!(replica = self.id, seq = pp.sequence, "pre-prepare for unknown request");
                    return;
                }
            }
            if !self.is_timer_armed(TimerKind::ViewChange) {
                self.start_timer(TimerKind::ViewChange, "View-change", self.timeouts.view_change);
            }
        }

        let (v, n, digest) = (pp.view, pp.sequence, pp.digest);
        self.seq_no = self.seq_no.max(n);
        let id = self.id;
        let cert = self.certs.get_cert(v, n);
        cert.digest = Some(digest);
        cert.pre_prepare = Some(pp);

        let mut prepare = None;
        if !cert.sent_prepare {
            let p = Prepare { view: v, sequence: n, digest, replica: id };
            cert.sent_prepare = true;
            cert.add_prepare(p.clone());
            prepare = Some(p);
        }
        if let Some(p) = prepare {
            self.broadcast(Message::Prepare(p));
        }
        self.maybe_send_commit(v, n, digest);
    }

    pub(crate) fn recv_prepare(&mut self, p: Prepare) {
        debug!(replica = self.id, from = p.replica, seq = p.sequence, "received prepare");
        if p.replica == self.peers.primary(p.view) {
            warn!(replica = self.id, from = p.replica, "prepare from primary, ignoring");
            return;
        }
        if !self.in_vw(p.view, p.sequence) {
            warn!(replica = self.id, view = p.view, seq = p.sequence, "prepare not in view or watermarks");
            return;
        }
        let (v, n, digest) = (p.view, p.sequence, p.digest);
        if !self.certs.get_cert(v, n).add_prepare(p) {
            warn!(replica = self.id, seq = n, "duplicate prepare, ignoring");
            return;
        }
        self.maybe_send_commit(v, n, digest);
    }

    pub(crate) fn maybe_send_commit(&mut self, v: View, n: SeqNo, digest: Digest) {
        if digest != NULL_DIGEST && !self.store.has_request(&digest) {
            return;
        }
        let quorum = self.quorum.quorum();
        let id = self.id;
        let cert = self.certs.get_cert(v, n);
        if cert.sent_commit || !cert.is_prepared(&digest, v, n, quorum) {
            return;
        }

        let commit = Commit { view: v, sequence: n, digest, replica: id };
        cert.sent_commit = true;
        cert.add_commit(commit.clone());
        debug!(replica = id, view = v, seq = n, "prepared, sending commit");
        self.broadcast(Message::Commit(commit));
        self.maybe_commit(v, n, digest);
    }

    pub(crate) fn recv_commit(&mut self, c: Commit) {
        debug!(replica = self.id, from = c.replica, seq = c.sequence, "received commit");
        if !self.in_vw(c.view, c.sequence) {
            warn!(replica = self.id, view = c.view, seq = c.sequence, "commit not in view or watermarks");
            return;
        }
        let (v, n, digest) = (c.view, c.sequence, c.digest);
        if !self.certs.get_cert(v, n).add_commit(c) {
            warn!(replica = self.id, seq = n, "duplicate commit, ignoring");
            return;
        }
        self.maybe_commit(v, n, digest);
    }

    fn maybe_commit(&mut self, v: View, n: SeqNo, digest: Digest) {
        let quorum = self.quorum.quorum();
        let last_exec = self.last_exec;
        let cert = self.certs.get_cert(v, n);
        if cert.committed || !cert.is_committed(&digest, v, n, quorum) {
            return;
        }
        cert.committed = true;
        if n <= last_exec {
            cert.sent_reply = true;
            debug!(replica = self.id, seq = n, "slot committed again after view change, already executed");
            return;
        }

        info!(replica = self.id, view = v, seq = n, digest = %short(&digest), "committed");
        self.committed.insert(n, MsgId { v, n });
        self.execute_ready();
    }

    /// Executes committed slots in sequence order, without gaps.
    fn execute_ready(&mut self) {
        while let Some(idx) = self.committed.remove(&(self.last_exec + 1)) {
            self.execute(idx);
        }
    }

    fn execute(&mut self, idx: MsgId) {
        let cert = self.certs.get_cert(idx.v, idx.n);
        let Some(digest) = cert.digest else {
            error!(replica = self.id, seq = idx.n, "committed slot without digest");
            return;
        };
        cert.sent_reply = true;
        self.last_exec = idx.n;

        let mut state = Hasher::new(b"state");
        state.digest(&self.state_digest).u64(idx.n).digest(&digest);
        self.state_digest = state.finish();

        if digest == NULL_DIGEST {
            debug!(replica = self.id, seq = idx.n, "executed null request");
        } else if self.store.request(&digest).is_some_and(|request| self.store.is_executed(request)) {
            warn!(replica = self.id, seq = idx.n, digest = %short(&digest), "request already executed at a lower sequence number, skipping");
        } else if let Some(request) = self.store.mark_executed(idx.n, &digest) {
            let reply = ClientReply {
                view: self.view,
                sequence: idx.n,
                timestamp: request.timestamp,
                client: request.client.clone(),
                replica: self.id,
                result: request.op.clone(),
            };
            info!(replica = self.id, seq = idx.n, client = %request.client, "executed request, sending reply");
            self.store.persist_reply(reply.clone());
            self.actions.push(Action::Reply(reply));
            self.actions.push(Action::Execute(CommittedRequest {
                view: idx.v,
                sequence: idx.n,
                digest,
                request,
            }));
        } else {
            error!(replica = self.id, seq = idx.n, digest = %short(&digest), "executed slot but request missing from log");
        }

        self.stop_timer(TimerKind::ViewChange);
        if self.active_view && !self.is_primary() && self.store.outstanding_len() > 0 {
            self.start_timer(TimerKind::ViewChange, "View-change", self.timeouts.view_change);
        }
        if self.quorum.is_checkpoint(idx.n) {
            self.send_checkpoint(idx.n);
        }
        if self.active_view && self.is_primary() {
            self.propose_outstanding();
        }
    }

    /// Primary only: assigns sequence numbers to outstanding requests that
    /// have none in the current view, until the window is full.
    pub(crate) fn propose_outstanding(&mut self) {
        for (digest, request) in self.store.outstanding() {
            if self.certs.contains_digest(&digest) {
                continue;
            }
            debug!(replica = self.id, digest = %short(&digest), "resubmitting outstanding request");
            if !self.send_pre_prepare(request, digest) {
                break;
            }
        }
    }

    fn persist_request(&mut self, request: &RequestClient) {
        if let Some(wal) = self.wal.as_mut() {
            if let Err(err) = wal.append(request) {
                error!(replica = self.id, %err, "failed to append request to log");
            }
        }
    }

    //=====================================================
    // Helpers
    //=====================================================

    pub fn primary_id(&self) -> ReplicaId {
        self.peers.primary(self.view)
    }

    pub fn is_primary(&self) -> bool {
        self.primary_id() == self.id
    }

    /// High watermark H.
    pub fn high_water_mark(&self) -> SeqNo {
        self.h + self.quorum.l
    }

    pub fn in_w(&self, n: SeqNo) -> bool {
        n > self.h && n <= self.high_water_mark()
    }

    pub fn in_vw(&self, v: View, n: SeqNo) -> bool {
        self.view == v && self.in_w(n)
    }

    pub fn slot_state(&self, v: View, n: SeqNo) -> SlotState {
        match self.certs.get(v, n) {
            Some(cert) => cert.state(v, n, self.quorum.quorum()),
            None => SlotState::Empty,
        }
    }

    pub fn state_digest(&self) -> Digest {
        self.state_digest
    }

    pub fn is_timer_armed(&self, kind: TimerKind) -> bool {
        self.armed.contains_key(&kind)
    }

    pub(crate) fn start_timer(&mut self, kind: TimerKind, reason: &'static str, duration: Duration) {
        self.armed.insert(kind, self.view);
        self.actions.push(Action::StartTimer { kind, reason, duration });
    }

    pub(crate) fn stop_timer(&mut self, kind: TimerKind) {
        if self.armed.remove(&kind).is_some() {
            self.actions.push(Action::StopTimer(kind));
        }
    }

    pub(crate) fn broadcast(&mut self, message: Message) {
        let envelope = SignedMessage::new(self.id, message, &self.keypair);
        self.actions.push(Action::Broadcast(envelope));
    }

    pub(crate) fn send_to(&mut self, to: ReplicaId, message: Message) {
        let envelope = SignedMessage::new(self.id, message, &self.keypair);
        self.actions.push(Action::Send { to, message: envelope });
    }

    pub(crate) fn push_action(&mut self, action: Action) {
        self.actions.push(action);
    }
}
