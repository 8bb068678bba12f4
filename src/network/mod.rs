pub mod node;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::mpsc::{Receiver, Sender};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::consensus::message::{ClientReply, ReplicaId, RequestClient, SignedMessage};

/*
    Network communication is point-to-point, authenticated and reliable
    between correct replicas. A broadcast is the same point-to-point message
    sent to every other replica. LocalNetwork is an in-process router over
    tokio channels; a replica can be disconnected to model a crash or a
    partition, after which everything it sends or is sent is dropped.
*/

/// What a replica's processor consumes.
#[derive(Clone, Debug)]
pub enum Inbound {
    Request(RequestClient),
    Message { from: ReplicaId, envelope: SignedMessage },
}

/// What a replica's processor produces.
#[derive(Clone, Debug)]
pub enum Outbound {
    Broadcast(SignedMessage),
    Send { to: ReplicaId, envelope: SignedMessage },
    Reply(ClientReply),
}

#[derive(Default)]
pub struct LocalNetwork {
    replicas: RwLock<HashMap<ReplicaId, Sender<Inbound>>>,
    clients: RwLock<HashMap<String, Sender<ClientReply>>>,
    disconnected: RwLock<HashSet<ReplicaId>>,
}

impl LocalNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(LocalNetwork::default())
    }

    pub fn register_replica(&self, id: ReplicaId, inbox: Sender<Inbound>) {
        self.replicas.write().insert(id, inbox);
    }

    pub fn register_client(&self, name: impl Into<String>, inbox: Sender<ClientReply>) {
        self.clients.write().insert(name.into(), inbox);
    }

    /// Drops the replica's inbox so its processor stops.
    pub fn deregister_replica(&self, id: ReplicaId) {
        self.replicas.write().remove(&id);
    }

    pub fn disconnect(&self, id: ReplicaId) {
        warn!(replica = id, "disconnecting replica");
        self.disconnected.write().insert(id);
    }

    pub fn reconnect(&self, id: ReplicaId) {
        self.disconnected.write().remove(&id);
    }

    pub fn is_connected(&self, id: ReplicaId) -> bool {
        !self.disconnected.read().contains(&id)
    }

    fn targets(&self, from: ReplicaId, to: Option<ReplicaId>) -> Vec<(ReplicaId, Sender<Inbound>)> {
        if !self.is_connected(from) {
            return Vec::new();
        }
        self.replicas
            .read()
            .iter()
            .filter(|(id, _)| **id != from && to.map_or(true, |to| to == **id) && self.is_connected(**id))
            .map(|(id, tx)| (*id, tx.clone()))
            .collect()
    }

    /// Delivers one processor output.
    pub async fn route(&self, from: ReplicaId, out: Outbound) {
        match out {
            Outbound::Broadcast(envelope) => {
                trace!(from, kind = envelope.message.kind(), "broadcast");
                for (id, tx) in self.targets(from, None) {
                    let inbound = Inbound::Message { from, envelope: envelope.clone() };
                    if tx.send(inbound).await.is_err() {
                        debug!(from, to = id, "replica inbox closed");
                    }
                }
            }
            Outbound::Send { to, envelope } => {
                trace!(from, to, kind = envelope.message.kind(), "send");
                for (id, tx) in self.targets(from, Some(to)) {
                    if tx.send(Inbound::Message { from, envelope: envelope.clone() }).await.is_err() {
                        debug!(from, to = id, "replica inbox closed");
                    }
                }
            }
            Outbound::Reply(reply) => {
                if !self.is_connected(from) {
                    return;
                }
                let inbox = self.clients.read().get(&reply.client).cloned();
                match inbox {
                    Some(tx) => {
                        if tx.send(reply).await.is_err() {
                            debug!(from, "client inbox closed");
                        }
                    }
                    None => debug!(from, client = %reply.client, "reply for unknown client"),
                }
            }
        }
    }

    /// Sends a client request to every connected replica.
    pub async fn submit(&self, request: RequestClient) {
        let targets: Vec<_> = self
            .replicas
            .read()
            .iter()
            .filter(|(id, _)| self.is_connected(**id))
            .map(|(id, tx)| (*id, tx.clone()))
            .collect();
        for (id, tx) in targets {
            if tx.send(Inbound::Request(request.clone())).await.is_err() {
                debug!(to = id, "replica inbox closed");
            }
        }
    }

    /// Forwards everything a replica's processor emits until it stops.
    pub fn spawn_router(self: &Arc<Self>, from: ReplicaId, mut out_rx: Receiver<Outbound>) -> JoinHandle<()> {
        let network = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(out) = out_rx.recv().await {
                network.route(from, out).await;
            }
            debug!(replica = from, "router stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::crypto::Keypair;
    use crate::consensus::message::{Checkpoint, Message};
    use tokio::sync::mpsc;

    fn checkpoint_from(replica: ReplicaId, keypair: &Keypair) -> SignedMessage {
        let checkpoint = Checkpoint { sequence: 10, digest: [1u8; 32], replica };
        SignedMessage::new(replica, Message::Checkpoint(checkpoint), keypair)
    }

    #[tokio::test]
    async fn test_broadcast_skips_sender_and_disconnected() {
        let network = LocalNetwork::new();
        let mut inboxes = HashMap::new();
        for id in 1..=4 {
            let (tx, rx) = mpsc::channel(8);
            network.register_replica(id, tx);
            inboxes.insert(id, rx);
        }
        network.disconnect(4);

        let keypair = Keypair::new_pair();
        network.route(1, Outbound::Broadcast(checkpoint_from(1, &keypair))).await;

        assert!(inboxes.get_mut(&1).unwrap().try_recv().is_err());
        for id in 2..=3 {
            let inbound = inboxes.get_mut(&id).unwrap().try_recv().unwrap();
            assert!(matches!(inbound, Inbound::Message { from: 1, .. }));
        }
        assert!(inboxes.get_mut(&4).unwrap().try_recv().is_err());

        // A disconnected sender reaches nobody.
        network.route(4, Outbound::Broadcast(checkpoint_from(4, &keypair))).await;
        for id in 1..=3 {
            assert!(inboxes.get_mut(&id).unwrap().try_recv().is_err());
        }
    }

    #[tokio::test]
    async fn test_send_and_reply_routing() {
        let network = LocalNetwork::new();
        let (tx2, mut rx2) = mpsc::channel(8);
        let (tx3, mut rx3) = mpsc::channel(8);
        network.register_replica(2, tx2);
        network.register_replica(3, tx3);
        let (client_tx, mut client_rx) = mpsc::channel(8);
        network.register_client("c", client_tx);

        let keypair = Keypair::new_pair();
        network.route(1, Outbound::Send { to: 3, envelope: checkpoint_from(1, &keypair) }).await;
        assert!(rx2.try_recv().is_err());
        assert!(rx3.try_recv().is_ok());

        let reply = ClientReply { view: 1, sequence: 1, timestamp: 1, client: "c".into(), replica: 2, result: vec![] };
        network.route(2, Outbound::Reply(reply.clone())).await;
        assert_eq!(client_rx.try_recv().unwrap(), reply);
    }
}
