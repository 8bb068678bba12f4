use std::collections::{BTreeMap, HashMap, HashSet};

use tracing::{debug, error, info, warn};

use crate::common::crypto::{short, Digest, Hashable, NULL_DIGEST};
use crate::common::timer::TimerKind;
use super::cert::CertStore;
use super::message::{
    CheckpointEntry, Message, NewView, PqEntry, PrePrepare, Prepare, ReplicaId, SeqNo, SignedMessage,
    SignedViewChange, View, ViewChange, ViewChangeAck,
};
use super::replica::{Action, Replica};

/*
    View changes (Castro & Liskov, section 4.4 and the acknowledgement
    variant of the TOCS paper). A backup that suspects the primary moves to
    view v+1 and multicasts <VIEW-CHANGE, v+1, h, C, P, Q>. Every replica
    acknowledges each view-change it accepts to the primary of v+1, which
    admits a view-change into its S set once quorum - 1 matching acks are in.
    With a quorum of view-changes in S, the new primary picks the starting
    checkpoint and the O set of sequence numbers to re-propose and multicasts
    a NEW-VIEW. Backups recompute both from the embedded view-changes before
    accepting it.
*/

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct QIdx {
    pub d: Digest,
    pub n: SeqNo,
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub struct VcIdx {
    pub v: View,
    pub id: ReplicaId,
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct AckIdx {
    pub v: View,
    pub vc_sender: ReplicaId,
    pub ack_sender: ReplicaId,
}

/// Carries forward every slot prepared in the current log, keeping the
/// entry from the highest view per sequence number.
pub fn calc_pset(prev: &BTreeMap<SeqNo, PqEntry>, certs: &CertStore, quorum: usize) -> BTreeMap<SeqNo, PqEntry> {
    let mut pset = prev.clone();
    for (idx, cert) in certs.iter() {
        let Some(digest) = cert.digest else { continue };
        if !cert.is_prepared(&digest, idx.v, idx.n, quorum) {
            continue;
        }
        if let Some(existing) = pset.get(&idx.n) {
            if existing.view > idx.v {
                continue;
            }
        }
        pset.insert(idx.n, PqEntry { view: idx.v, sequence: idx.n, digest });
    }
    pset
}

/// Carries forward every slot pre-prepared without a prepare certificate.
pub fn calc_qset(prev: &HashMap<QIdx, PqEntry>, certs: &CertStore, quorum: usize) -> HashMap<QIdx, PqEntry> {
    let mut qset = prev.clone();
    for (idx, cert) in certs.iter() {
        let Some(digest) = cert.digest else { continue };
        if !cert.is_pre_prepared(&digest, idx.v, idx.n) || cert.is_prepared(&digest, idx.v, idx.n, quorum) {
            continue;
        }
        let key = QIdx { d: digest, n: idx.n };
        if let Some(existing) = qset.get(&key) {
            if existing.view > idx.v {
                continue;
            }
        }
        qset.insert(key, PqEntry { view: idx.v, sequence: idx.n, digest });
    }
    qset
}

/// Structural checks on a view-change: P and Q entries from earlier views
/// inside `(h, h + L]`, checkpoints inside `[h, h + L]`.
pub fn correct_view_change(vc: &ViewChange, l: SeqNo) -> bool {
    let high = vc.h + l;
    let pq_ok = vc
        .pset
        .iter()
        .chain(vc.qset.iter())
        .all(|e| e.view < vc.view && e.sequence > vc.h && e.sequence <= high);
    let c_ok = vc.cset.iter().all(|c| c.sequence >= vc.h && c.sequence <= high);
    pq_ok && c_ok
}

/// Highest checkpoint vouched for by more than f replicas and not below the
/// low watermark of at least `quorum - 1` of the view-changes.
pub fn select_initial_checkpoint(vset: &[&ViewChange], quorum: usize, weak: usize) -> Option<CheckpointEntry> {
    let mut vouchers: HashMap<CheckpointEntry, HashSet<ReplicaId>> = HashMap::new();
    for vc in vset {
        for c in &vc.cset {
            vouchers.entry(*c).or_default().insert(vc.replica);
        }
    }

    let mut best: Option<CheckpointEntry> = None;
    for (c, who) in vouchers {
        if who.len() < weak {
            continue;
        }
        let covered = vset.iter().filter(|vc| vc.h <= c.sequence).count();
        if covered + 1 < quorum {
            continue;
        }
        let better = match best {
            None => true,
            Some(b) => (c.sequence, c.digest) > (b.sequence, b.digest),
        };
        if better {
            best = Some(c);
        }
    }
    best
}

/// Builds the O set for the window starting at checkpoint `h`: each
/// sequence number gets the digest some quorum may have committed, or the
/// null digest when a quorum provably prepared nothing there. Trailing
/// null entries are dropped. `None` when some sequence number qualifies for
/// neither.
pub fn assign_sequence_numbers(
    vset: &[&ViewChange],
    h: SeqNo,
    l: SeqNo,
    quorum: usize,
    weak: usize,
) -> Option<BTreeMap<SeqNo, Digest>> {
    let mut list = BTreeMap::new();
    let mut max_n = h;

    'seq: for n in h + 1..=h + l {
        for m in vset {
            for em in m.pset.iter().filter(|e| e.sequence == n) {
                // A quorum whose logs do not contradict em.
                let agree = vset
                    .iter()
                    .filter(|mp| {
                        mp.h < n
                            && mp.pset.iter().filter(|e| e.sequence == n).all(|emp| {
                                emp.view < em.view || (emp.view == em.view && emp.digest == em.digest)
                            })
                    })
                    .count();
                if agree < quorum {
                    continue;
                }
                // f + 1 replicas pre-prepared em in em.view or later.
                let witnesses = vset
                    .iter()
                    .filter(|mp| {
                        mp.pset
                            .iter()
                            .chain(mp.qset.iter())
                            .any(|e| e.sequence == n && e.view >= em.view && e.digest == em.digest)
                    })
                    .count();
                if witnesses < weak {
                    continue;
                }
                list.insert(n, em.digest);
                max_n = n;
                continue 'seq;
            }
        }

        let empty = vset
            .iter()
            .filter(|m| m.h < n && !m.pset.iter().any(|e| e.sequence == n))
            .count();
        if empty >= quorum {
            list.insert(n, NULL_DIGEST);
            continue;
        }

        debug!(seq = n, "no request or null request qualifies for sequence number");
        return None;
    }

    list.retain(|n, _| *n <= max_n);
    Some(list)
}

impl Replica {
    /// Recomputes P and Q from the current log and leaves the current view.
    fn enter_view(&mut self, new_view: View) {
        let quorum = self.quorum.quorum();
        self.pset = calc_pset(&self.pset, &self.certs, quorum);
        self.qset = calc_qset(&self.qset, &self.certs, quorum);

        self.stop_timer(TimerKind::NewView);
        self.stop_timer(TimerKind::ViewChange);
        self.view = new_view;
        self.active_view = false;
        self.vc_quorum_seen = None;
        self.certs.clear();
        self.committed.clear();

        self.view_change_store.retain(|idx, _| idx.v >= new_view);
        self.ack_store.retain(|idx, _| idx.v >= new_view);
        self.sset.retain(|idx, _| idx.v >= new_view);
        self.new_view_store.retain(|v, _| *v >= new_view);
        self.new_view_acks.retain(|v, _| *v >= new_view);
    }

    /// Suspects the primary and moves to `new_view`.
    pub(crate) fn send_view_change(&mut self, new_view: View) {
        if new_view <= self.view {
            warn!(replica = self.id, new_view, view = self.view, "already past requested view");
            return;
        }
        self.enter_view(new_view);

        let h = self.h;
        let mut cset: Vec<CheckpointEntry> = self.checkpoint_store.iter().filter(|c| c.sequence >= h).copied().collect();
        cset.sort_by_key(|c| (c.sequence, c.digest));
        let pset: Vec<PqEntry> = self.pset.values().filter(|e| e.sequence > h).copied().collect();
        let mut qset: Vec<PqEntry> = self.qset.values().filter(|e| e.sequence > h).copied().collect();
        qset.sort_by_key(|e| (e.sequence, e.view, e.digest));

        let vc = ViewChange { view: new_view, h, cset, pset, qset, replica: self.id };
        let envelope = SignedMessage::new(self.id, Message::ViewChange(vc.clone()), &self.keypair);
        info!(replica = self.id, view = new_view, h, p = vc.pset.len(), q = vc.qset.len(), "sending view-change");

        self.push_action(Action::Broadcast(envelope.clone()));
        self.start_timer(TimerKind::ViewChangeResend, "Resend-View-change", self.timeouts.resend);
        self.start_timer(TimerKind::NewView, "New-View", self.timeouts.last_new_view);
        self.accept_view_change(SignedViewChange { vc, sig: envelope.sig });
    }

    pub(crate) fn resend_view_change(&mut self) {
        let idx = VcIdx { v: self.view, id: self.id };
        let Some(own) = self.view_change_store.get(&idx).cloned() else {
            warn!(replica = self.id, view = self.view, "no view-change to resend");
            return;
        };
        info!(replica = self.id, view = self.view, "resending view-change");
        self.push_action(Action::Broadcast(SignedMessage {
            from: self.id,
            message: Message::ViewChange(own.vc),
            sig: own.sig,
        }));
        self.start_timer(TimerKind::ViewChangeResend, "Resend-View-change", self.timeouts.resend);
    }

    pub(crate) fn recv_view_change(&mut self, signed: SignedViewChange) {
        let vc = &signed.vc;
        debug!(replica = self.id, from = vc.replica, view = vc.view, "received view-change");
        if vc.view < self.view || (vc.view == self.view && self.active_view) {
            warn!(replica = self.id, from = vc.replica, view = vc.view, current = self.view, "view-change for old view");
            return;
        }
        if !correct_view_change(vc, self.quorum.l) {
            warn!(replica = self.id, from = vc.replica, view = vc.view, "view-change failed correctness checks");
            return;
        }
        if self.view_change_store.contains_key(&VcIdx { v: vc.view, id: vc.replica }) {
            warn!(replica = self.id, from = vc.replica, view = vc.view, "duplicate view-change");
            return;
        }

        self.accept_view_change(signed);
        if let Some(target) = self.jump_target() {
            info!(replica = self.id, view = self.view, target, "f+1 replicas moved to a later view, following");
            self.send_view_change(target);
        }
    }

    /// Smallest later view that f + 1 distinct replicas already asked for.
    fn jump_target(&self) -> Option<View> {
        let mut senders = HashSet::new();
        let mut min_view = None;
        for idx in self.view_change_store.keys().filter(|idx| idx.v > self.view) {
            senders.insert(idx.id);
            min_view = Some(min_view.map_or(idx.v, |m: View| m.min(idx.v)));
        }
        if senders.len() >= self.quorum.weak() {
            min_view
        } else {
            None
        }
    }

    fn accept_view_change(&mut self, signed: SignedViewChange) {
        let idx = VcIdx { v: signed.vc.view, id: signed.vc.replica };
        if self.view_change_store.contains_key(&idx) {
            return;
        }
        let ack = ViewChangeAck {
            view: signed.vc.view,
            replica: self.id,
            vc_sender: signed.vc.replica,
            digest: signed.vc.hash(),
        };
        self.view_change_store.insert(idx, signed);

        let primary = self.peers.primary(ack.view);
        if primary == self.id {
            self.recv_view_change_ack(ack);
        } else {
            self.send_to(primary, Message::ViewChangeAck(ack));
        }
        self.maybe_accept_into_sset(idx.v, idx.id);
        self.check_view_change_quorum();
    }

    /// Once a quorum asked for the current view, stop resending and wait
    /// for the new-view with a timeout that doubles on every attempt.
    fn check_view_change_quorum(&mut self) {
        if self.active_view || self.vc_quorum_seen == Some(self.view) {
            return;
        }
        let count = self.view_change_store.keys().filter(|idx| idx.v == self.view).count();
        if count < self.quorum.quorum() {
            return;
        }
        self.vc_quorum_seen = Some(self.view);
        self.stop_timer(TimerKind::ViewChangeResend);
        self.start_timer(TimerKind::NewView, "New-View", self.timeouts.last_new_view);
        self.timeouts.last_new_view *= 2;
        info!(replica = self.id, view = self.view, count, "view-change quorum, waiting for new-view");
    }

    pub(crate) fn recv_view_change_ack(&mut self, ack: ViewChangeAck) {
        debug!(replica = self.id, from = ack.replica, vc_sender = ack.vc_sender, view = ack.view, "received view-change ack");
        if self.peers.primary(ack.view) != self.id {
            debug!(replica = self.id, view = ack.view, "not the primary of the acked view");
            return;
        }
        if ack.view < self.view {
            debug!(replica = self.id, view = ack.view, "ack for old view");
            return;
        }

        if let Some(nv) = self.new_view_store.get(&ack.view) {
            if ack.vc_sender == self.id && ack.digest == nv.hash() {
                let acks = self.new_view_acks.entry(ack.view).or_default();
                acks.insert(ack.replica);
                if acks.len() + 1 == self.quorum.quorum() {
                    info!(replica = self.id, view = ack.view, "new-view acknowledged by a quorum");
                }
                return;
            }
        }

        let idx = AckIdx { v: ack.view, vc_sender: ack.vc_sender, ack_sender: ack.replica };
        if self.ack_store.contains_key(&idx) {
            warn!(replica = self.id, from = ack.replica, "duplicate view-change ack");
            return;
        }
        self.ack_store.insert(idx, ack);
        self.maybe_accept_into_sset(idx.v, idx.vc_sender);
    }

    /// New primary only: admits a stored view-change into S once enough
    /// replicas acknowledged the same digest for it.
    fn maybe_accept_into_sset(&mut self, v: View, sender: ReplicaId) {
        if self.peers.primary(v) != self.id {
            return;
        }
        let idx = VcIdx { v, id: sender };
        if self.sset.contains_key(&idx) {
            return;
        }
        let Some(signed) = self.view_change_store.get(&idx) else {
            return;
        };
        let digest = signed.vc.hash();
        let acks = self
            .ack_store
            .iter()
            .filter(|(k, a)| k.v == v && k.vc_sender == sender && a.digest == digest)
            .count();
        if acks + 1 < self.quorum.quorum() {
            return;
        }

        debug!(replica = self.id, view = v, vc_sender = sender, acks, "view-change admitted to S");
        self.sset.insert(idx, signed.clone());
        if v == self.view && !self.active_view {
            self.try_send_new_view();
        }
    }

    fn try_send_new_view(&mut self) {
        if self.new_view_store.contains_key(&self.view) {
            return;
        }
        if let Some(nv) = self.create_new_view() {
            self.send_new_view(nv);
        }
    }

    fn create_new_view(&self) -> Option<NewView> {
        let mut vset: Vec<SignedViewChange> =
            self.sset.iter().filter(|(idx, _)| idx.v == self.view).map(|(_, s)| s.clone()).collect();
        if vset.len() < self.quorum.quorum() {
            debug!(replica = self.id, view = self.view, have = vset.len(), "not enough view-changes for new-view");
            return None;
        }
        vset.sort_by_key(|s| s.vc.replica);

        let vcs: Vec<&ViewChange> = vset.iter().map(|s| &s.vc).collect();
        let (quorum, weak) = (self.quorum.quorum(), self.quorum.weak());
        let Some(cp) = select_initial_checkpoint(&vcs, quorum, weak) else {
            warn!(replica = self.id, view = self.view, "no initial checkpoint selectable");
            return None;
        };
        let Some(xset) = assign_sequence_numbers(&vcs, cp.sequence, self.quorum.l, quorum, weak) else {
            warn!(replica = self.id, view = self.view, "sequence numbers not assignable");
            return None;
        };

        let mut requests = Vec::new();
        for digest in xset.values().filter(|d| **d != NULL_DIGEST) {
            match self.store.request(digest) {
                Some(request) => requests.push(request.clone()),
                None => warn!(replica = self.id, digest = %short(digest), "request for O set entry missing"),
            }
        }

        Some(NewView { view: self.view, vset, xset, requests, replica: self.id })
    }

    fn send_new_view(&mut self, nv: NewView) {
        info!(replica = self.id, view = nv.view, o = nv.xset.len(), "sending new-view");
        self.new_view_store.insert(nv.view, nv.clone());
        self.broadcast(Message::NewView(nv));
        self.process_new_view();
    }

    pub(crate) fn recv_new_view(&mut self, nv: NewView) {
        info!(replica = self.id, from = nv.replica, view = nv.view, "received new-view");
        if nv.view == 0 || nv.view < self.view || (nv.view == self.view && self.active_view) {
            warn!(replica = self.id, view = nv.view, current = self.view, "new-view for old view");
            return;
        }
        if self.peers.primary(nv.view) != nv.replica {
            warn!(replica = self.id, from = nv.replica, view = nv.view, "new-view not from the view's primary");
            return;
        }
        if self.new_view_store.contains_key(&nv.view) {
            warn!(replica = self.id, view = nv.view, "duplicate new-view");
            return;
        }
        if !self.verify_new_view(&nv) {
            warn!(replica = self.id, view = nv.view, "new-view carries invalid view-changes");
            return;
        }

        if nv.view > self.view {
            info!(replica = self.id, view = self.view, target = nv.view, "catching up to new-view");
            self.enter_view(nv.view);
        }
        self.stop_timer(TimerKind::NewView);
        self.new_view_store.insert(nv.view, nv);
        self.process_new_view();
    }

    fn verify_new_view(&self, nv: &NewView) -> bool {
        let mut senders = HashSet::new();
        for signed in &nv.vset {
            let vc = &signed.vc;
            if vc.view != nv.view || !senders.insert(vc.replica) {
                return false;
            }
            if !self.peers.verify(vc.replica, &signed.sig, &vc.hash()) {
                warn!(replica = self.id, vc_sender = vc.replica, "bad signature on embedded view-change");
                return false;
            }
            if !correct_view_change(vc, self.quorum.l) {
                return false;
            }
        }
        senders.len() >= self.quorum.quorum()
    }

    /// Checks the stored new-view for the current view against its own
    /// view-changes and, if it holds, installs it.
    fn process_new_view(&mut self) {
        if self.active_view {
            return;
        }
        let Some(nv) = self.new_view_store.get(&self.view).cloned() else {
            return;
        };

        let vcs: Vec<&ViewChange> = nv.vset.iter().map(|s| &s.vc).collect();
        let (quorum, weak) = (self.quorum.quorum(), self.quorum.weak());
        let checked = select_initial_checkpoint(&vcs, quorum, weak).and_then(|cp| {
            assign_sequence_numbers(&vcs, cp.sequence, self.quorum.l, quorum, weak).map(|xset| (cp, xset))
        });
        let Some((cp, xset)) = checked else {
            warn!(replica = self.id, view = self.view, "new-view checkpoint or O set not derivable");
            self.send_view_change(self.view + 1);
            return;
        };
        if xset != nv.xset {
            warn!(replica = self.id, view = self.view, "failed to verify new-view O set");
            self.send_view_change(self.view + 1);
            return;
        }

        for request in &nv.requests {
            if nv.xset.values().any(|d| *d == request.hash()) {
                self.store.add_request(request.clone());
            }
        }

        if cp.sequence > self.h {
            if cp.sequence <= self.last_exec {
                self.move_watermarks(cp.sequence, cp.digest);
            } else {
                error!(
                    replica = self.id,
                    checkpoint = cp.sequence,
                    last_exec = self.last_exec,
                    "new-view starts past local execution, state transfer required"
                );
            }
        }

        self.install_new_view(nv);
    }

    fn install_new_view(&mut self, nv: NewView) {
        self.active_view = true;
        self.stop_timer(TimerKind::ViewChange);
        self.stop_timer(TimerKind::ViewChangeResend);
        self.stop_timer(TimerKind::NewView);
        self.timeouts.last_new_view = self.timeouts.new_view;

        let primary = self.primary_id();
        let is_primary = self.is_primary();
        let view = self.view;
        self.seq_no = self.h;

        let slots: Vec<(SeqNo, Digest)> = nv.xset.iter().filter(|(n, _)| **n > self.h).map(|(n, d)| (*n, *d)).collect();
        for (n, digest) in &slots {
            let request = if *digest == NULL_DIGEST {
                None
            } else {
                let request = self.store.request(digest).cloned();
                if request.is_none() {
                    error!(replica = self.id, seq = n, digest = %short(digest), "request for new-view slot missing");
                }
                request
            };
            let cert = self.certs.get_cert(view, *n);
            cert.digest = Some(*digest);
            cert.pre_prepare = Some(PrePrepare { view, sequence: *n, digest: *digest, request, replica: primary });
            cert.sent_pre_prepare = is_primary;
            self.seq_no = self.seq_no.max(*n);
        }
        info!(replica = self.id, view, primary, slots = slots.len(), "new view installed");

        if is_primary {
            for (n, digest) in &slots {
                self.maybe_send_commit(view, *n, *digest);
            }
            self.propose_outstanding();
            return;
        }

        for (n, digest) in &slots {
            let prepare = Prepare { view, sequence: *n, digest: *digest, replica: self.id };
            let cert = self.certs.get_cert(view, *n);
            cert.sent_prepare = true;
            cert.add_prepare(prepare.clone());
            self.broadcast(Message::Prepare(prepare));
            self.maybe_send_commit(view, *n, *digest);
        }
        let ack = ViewChangeAck { view, replica: self.id, vc_sender: primary, digest: nv.hash() };
        self.send_to(primary, Message::ViewChangeAck(ack));
        if self.store.outstanding_len() > 0 {
            self.start_timer(TimerKind::ViewChange, "View-change", self.timeouts.view_change);
        }
    }
}
