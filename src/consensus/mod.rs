pub mod cert;
pub mod checkpoint;
pub mod client;
pub mod config;
pub mod error;
pub mod message;
pub mod peers;
pub mod processor;
pub mod replica;
pub mod store;
pub mod view_change;
pub mod wal;

pub use cert::*;
pub use client::*;
pub use config::*;
pub use error::*;
pub use message::*;
pub use peers::*;
pub use processor::*;
pub use replica::*;
pub use store::*;

#[cfg(test)]
mod tests {
    use std::collections::{HashMap, HashSet, VecDeque};

    use crate::common::crypto::{Hashable, Keypair};
    use crate::common::timer::TimerKind;
    use super::*;

    /// Replicas wired through an in-memory FIFO queue. Timers never fire on
    /// their own; tests fire them explicitly.
    struct Cluster {
        replicas: Vec<Replica>,
        keypairs: Vec<Keypair>,
        down: HashSet<ReplicaId>,
        queue: VecDeque<(ReplicaId, ReplicaId, SignedMessage)>,
        replies: Vec<ClientReply>,
        executed: HashMap<ReplicaId, Vec<CommittedRequest>>,
    }

    impl Cluster {
        fn new(n: u64, f: u64, tweak: impl Fn(&mut ReplicaConfig)) -> Self {
            let keypairs: Vec<Keypair> = (0..n).map(|_| Keypair::new_pair()).collect();
            let peers = Peers::new(keypairs.iter().map(|k| k.pubkey()).collect());
            let replicas = (1..=n)
                .map(|id| {
                    let mut config = ReplicaConfig::new(id, f, n);
                    tweak(&mut config);
                    Replica::new(&config, keypairs[(id - 1) as usize].clone(), peers.clone()).unwrap()
                })
                .collect();
            Cluster {
                replicas,
                keypairs,
                down: HashSet::new(),
                queue: VecDeque::new(),
                replies: Vec::new(),
                executed: HashMap::new(),
            }
        }

        fn replica(&self, id: ReplicaId) -> &Replica {
            &self.replicas[(id - 1) as usize]
        }

        fn replica_mut(&mut self, id: ReplicaId) -> &mut Replica {
            &mut self.replicas[(id - 1) as usize]
        }

        fn live(&self) -> Vec<ReplicaId> {
            (1..=self.replicas.len() as u64).filter(|id| !self.down.contains(id)).collect()
        }

        fn executed_ops(&self, id: ReplicaId) -> Vec<(SeqNo, Vec<u8>)> {
            self.executed
                .get(&id)
                .map(|list| list.iter().map(|c| (c.sequence, c.request.op.clone())).collect())
                .unwrap_or_default()
        }

        fn collect(&mut self) {
            let ids: Vec<ReplicaId> = (1..=self.replicas.len() as u64).collect();
            for from in ids {
                let actions = self.replica_mut(from).take_actions();
                if self.down.contains(&from) {
                    continue;
                }
                for action in actions {
                    match action {
                        Action::Broadcast(envelope) => {
                            for to in self.live().into_iter().filter(|to| *to != from) {
                                self.queue.push_back((from, to, envelope.clone()));
                            }
                        }
                        Action::Send { to, message } => self.queue.push_back((from, to, message)),
                        Action::Reply(reply) => self.replies.push(reply),
                        Action::Execute(committed) => self.executed.entry(from).or_default().push(committed),
                        Action::StartTimer { .. } | Action::StopTimer(_) => {}
                    }
                }
            }
        }

        /// Delivers messages until the cluster is quiet.
        fn pump(&mut self) {
            loop {
                self.collect();
                let Some((from, to, envelope)) = self.queue.pop_front() else {
                    break;
                };
                if self.down.contains(&to) {
                    continue;
                }
                self.replica_mut(to).deliver(from, envelope);
            }
        }

        fn submit(&mut self, request: RequestClient) {
            for id in self.live() {
                self.replica_mut(id).recv_request(request.clone());
            }
            self.pump();
        }

        /// Hands every request to the replicas before any message moves.
        fn submit_all(&mut self, requests: &[RequestClient]) {
            for request in requests {
                for id in self.live() {
                    self.replica_mut(id).recv_request(request.clone());
                }
            }
            self.pump();
        }

        fn fire(&mut self, id: ReplicaId, kind: TimerKind) {
            assert!(self.replica(id).is_timer_armed(kind), "replica {} has no {:?} timer armed", id, kind);
            self.replica_mut(id).handle_timeout(kind);
            self.pump();
        }
    }

    fn request(timestamp: u64, op: &str) -> RequestClient {
        RequestClient::new("client", timestamp, op.as_bytes().to_vec())
    }

    #[test]
    fn test_happy_path_four_replicas() {
        let mut cluster = Cluster::new(4, 1, |_| {});
        cluster.submit(request(1, "op1"));

        for id in 1..=4 {
            assert_eq!(cluster.executed_ops(id), vec![(1, b"op1".to_vec())]);
            let replica = cluster.replica(id);
            assert_eq!(replica.last_exec, 1);
            assert_eq!(replica.slot_state(1, 1), SlotState::Executed);
        }

        let mut client = PbftClient::new("client", 1);
        let accepted: Vec<_> = cluster.replies.iter().cloned().filter_map(|r| client.recv_reply(r)).collect();
        assert_eq!(accepted.len(), 1);
        assert_eq!(accepted[0].sequence, 1);
        assert_eq!(accepted[0].result, b"op1".to_vec());
    }

    #[test]
    fn test_total_order_across_replicas() {
        let mut cluster = Cluster::new(4, 1, |_| {});
        let requests: Vec<_> = (1..=5).map(|i| request(i, &format!("op{}", i))).collect();
        cluster.submit_all(&requests);

        let expected = cluster.executed_ops(1);
        assert_eq!(expected.len(), 5);
        for (i, (seq, _)) in expected.iter().enumerate() {
            assert_eq!(*seq, i as u64 + 1);
        }
        for id in 2..=4 {
            assert_eq!(cluster.executed_ops(id), expected);
            assert_eq!(cluster.replica(id).state_digest(), cluster.replica(1).state_digest());
        }
    }

    #[test]
    fn test_duplicate_request_resends_reply() {
        let mut cluster = Cluster::new(4, 1, |_| {});
        cluster.submit(request(1, "op1"));
        let replies_before = cluster.replies.len();

        cluster.submit(request(1, "op1"));
        for id in 1..=4 {
            assert_eq!(cluster.executed_ops(id).len(), 1);
            assert_eq!(cluster.replica(id).seq_no, 1);
        }
        let resent = &cluster.replies[replies_before..];
        assert_eq!(resent.len(), 4);
        assert!(resent.iter().all(|r| r.sequence == 1 && r.timestamp == 1));
    }

    #[test]
    fn test_redelivered_votes_are_idempotent() {
        let mut cluster = Cluster::new(4, 1, |_| {});
        cluster.submit(request(1, "op1"));

        let digest = request(1, "op1").hash();
        let commit = Commit { view: 1, sequence: 1, digest, replica: 2 };
        let prepare = Prepare { view: 1, sequence: 1, digest, replica: 2 };
        let keypair = cluster.keypairs[1].clone();
        let replica = cluster.replica_mut(3);
        replica.deliver(2, SignedMessage::new(2, Message::Commit(commit), &keypair));
        replica.deliver(2, SignedMessage::new(2, Message::Prepare(prepare), &keypair));
        assert!(replica.take_actions().is_empty());
        assert_eq!(replica.last_exec, 1);
    }

    #[test]
    fn test_conflicting_pre_prepare_dropped() {
        let mut cluster = Cluster::new(4, 1, |_| {});
        let primary_key = cluster.keypairs[0].clone();
        let first = request(1, "op1");
        let second = request(2, "op2");
        let pre_prepare = |r: &RequestClient| PrePrepare {
            view: 1,
            sequence: 1,
            digest: r.hash(),
            request: Some(r.clone()),
            replica: 1,
        };

        let backup = cluster.replica_mut(2);
        backup.deliver(1, SignedMessage::new(1, Message::PrePrepare(pre_prepare(&first)), &primary_key));
        backup.take_actions();
        backup.deliver(1, SignedMessage::new(1, Message::PrePrepare(pre_prepare(&second)), &primary_key));

        assert!(backup.take_actions().is_empty());
        assert_eq!(backup.certs.get(1, 1).and_then(|c| c.digest), Some(first.hash()));
        assert!(backup.active_view);
    }

    #[test]
    fn test_checkpoint_truncates_log() {
        let mut cluster = Cluster::new(4, 1, |config| {
            config.checkpoint_period = 2;
            config.log_multiplier = 2;
        });
        // The window holds four sequence numbers; the last two requests wait
        // for a stable checkpoint.
        let requests: Vec<_> = (1..=6).map(|i| request(i, &format!("op{}", i))).collect();
        cluster.submit_all(&requests);

        for id in 1..=4 {
            let replica = cluster.replica(id);
            assert_eq!(replica.last_exec, 6);
            assert_eq!(replica.h, 6);
            assert_eq!(replica.stable_checkpoint, 6);
            assert_eq!(replica.high_water_mark(), 10);
            assert!(replica.certs.is_empty());
            assert!(replica.chkp_store.is_empty());
            assert_eq!(replica.checkpoint_store.len(), 1);
            assert_eq!(replica.checkpoint_store[0].sequence, 6);
            assert_eq!(replica.checkpoint_store[0].digest, replica.state_digest());
        }
    }

    #[test]
    fn test_view_change_when_primary_silent() {
        let mut cluster = Cluster::new(4, 1, |_| {});
        cluster.down.insert(1);
        cluster.submit(request(1, "op1"));
        assert!(cluster.executed.is_empty());

        cluster.fire(2, TimerKind::ViewChange);
        cluster.fire(3, TimerKind::ViewChange);

        for id in 2..=4 {
            let replica = cluster.replica(id);
            assert_eq!(replica.view, 2, "replica {}", id);
            assert!(replica.active_view, "replica {}", id);
            assert_eq!(replica.primary_id(), 2);
            assert_eq!(cluster.executed_ops(id), vec![(1, b"op1".to_vec())]);
        }
        // Replica 4 never timed out; it followed the f + 1 view-changes.
        assert!(cluster.replica(2).new_view_store.contains_key(&2));
    }

    #[test]
    fn test_view_change_carries_prepared_request() {
        let mut cluster = Cluster::new(4, 1, |_| {});
        cluster.submit(request(1, "op1"));
        // Primary stops after op1; op2 only reaches the backups.
        cluster.down.insert(1);
        cluster.submit(request(2, "op2"));

        cluster.fire(2, TimerKind::ViewChange);
        cluster.fire(3, TimerKind::ViewChange);

        for id in 2..=4 {
            let replica = cluster.replica(id);
            assert_eq!(replica.view, 2);
            assert_eq!(cluster.executed_ops(id), vec![(1, b"op1".to_vec()), (2, b"op2".to_vec())]);
        }
        let nv = &cluster.replica(2).new_view_store[&2];
        assert_eq!(nv.xset.get(&1), Some(&request(1, "op1").hash()));
    }

    #[test]
    fn test_new_view_timeout_moves_past_dead_primary() {
        let mut cluster = Cluster::new(7, 2, |_| {});
        let base = cluster.replica(3).timeouts.new_view;
        cluster.down.insert(1);
        cluster.down.insert(2);
        cluster.submit(request(1, "op1"));

        for id in 3..=5 {
            cluster.fire(id, TimerKind::ViewChange);
        }
        for id in 3..=7 {
            let replica = cluster.replica(id);
            assert_eq!(replica.view, 2);
            assert!(!replica.active_view);
            assert_eq!(replica.timeouts.last_new_view, base * 2);
            assert!(replica.is_timer_armed(TimerKind::NewView));
        }

        // The primary of view 2 is down as well.
        for id in 3..=5 {
            cluster.fire(id, TimerKind::NewView);
        }
        for id in 3..=7 {
            let replica = cluster.replica(id);
            assert_eq!(replica.view, 3, "replica {}", id);
            assert!(replica.active_view);
            assert_eq!(replica.timeouts.last_new_view, base);
            assert_eq!(cluster.executed_ops(id), vec![(1, b"op1".to_vec())]);
        }
    }

    #[test]
    fn test_byzantine_primary_cannot_split_backups() {
        let mut cluster = Cluster::new(4, 1, |config| config.byzantine = config.id == 1);
        cluster.submit(request(1, "op1"));

        let mut digests = HashSet::new();
        for id in 2..=4 {
            let replica = cluster.replica(id);
            assert_eq!(replica.slot_state(1, 1), SlotState::PrePrepared);
            digests.insert(replica.certs.get(1, 1).and_then(|c| c.digest));
        }
        assert_eq!(digests.len(), 3);
        assert!(cluster.executed.is_empty());

        cluster.fire(2, TimerKind::ViewChange);
        cluster.fire(3, TimerKind::ViewChange);
        for id in 2..=4 {
            assert_eq!(cluster.replica(id).view, 2);
            assert_eq!(cluster.executed_ops(id), vec![(1, b"op1".to_vec())]);
        }
    }

    #[test]
    fn test_request_ordered_twice_executes_once() {
        let mut cluster = Cluster::new(4, 1, |_| {});
        let op = request(1, "op1");
        for sequence in 1..=2 {
            let pp = PrePrepare { view: 1, sequence, digest: op.hash(), request: Some(op.clone()), replica: 1 };
            let envelope = SignedMessage::new(1, Message::PrePrepare(pp), &cluster.keypairs[0]);
            for to in 2..=4 {
                cluster.queue.push_back((1, to, envelope.clone()));
            }
        }
        cluster.pump();

        for id in 2..=4 {
            let replica = cluster.replica(id);
            assert_eq!(replica.last_exec, 2);
            assert_eq!(cluster.executed_ops(id), vec![(1, b"op1".to_vec())]);
        }
        assert_eq!(cluster.replies.len(), 3);
        assert!(cluster.replies.iter().all(|r| r.sequence == 1));
    }
}
