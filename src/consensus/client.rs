use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc::{self, Receiver};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::network::LocalNetwork;
use super::message::{ClientReply, RequestClient};

/// Replies collected for one request timestamp.
#[derive(Clone, Default, Debug)]
pub struct ReplyCert {
    pub reply: Vec<ClientReply>,
    /// Whether the result was already handed to the caller.
    pub sent_data: bool,
}

/// Client-side bookkeeping: timestamps its requests and accepts a result
/// once f + 1 replicas replied with the same one.
pub struct PbftClient {
    name: String,
    f: u64,
    next_timestamp: u64,
    reply_store: HashMap<u64, ReplyCert>,
}

impl PbftClient {
    pub fn new(name: impl Into<String>, f: u64) -> Self {
        PbftClient {
            name: name.into(),
            f,
            next_timestamp: 0,
            reply_store: HashMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Builds the next request. Timestamps increase strictly.
    pub fn propose(&mut self, op: Vec<u8>) -> RequestClient {
        self.next_timestamp += 1;
        RequestClient::new(self.name.clone(), self.next_timestamp, op)
    }

    /// Records a reply; returns it the first time f + 1 distinct replicas
    /// agree on the sequence number and result for its timestamp.
    pub fn recv_reply(&mut self, reply: ClientReply) -> Option<ClientReply> {
        if reply.client != self.name {
            debug!(client = %self.name, other = %reply.client, "reply for another client");
            return None;
        }
        let weak = (self.f + 1) as usize;
        let cert = self.reply_store.entry(reply.timestamp).or_default();
        if cert.sent_data || cert.reply.iter().any(|r| r.replica == reply.replica) {
            return None;
        }
        cert.reply.push(reply.clone());

        let matching = cert
            .reply
            .iter()
            .filter(|r| r.sequence == reply.sequence && r.result == reply.result)
            .count();
        if matching < weak {
            return None;
        }
        cert.sent_data = true;
        info!(client = %self.name, timestamp = reply.timestamp, seq = reply.sequence, "request completed");
        Some(reply)
    }
}

/// A client attached to a LocalNetwork: requests go to every replica,
/// accepted replies come out of `replies`.
pub struct ClientHandle {
    client: PbftClient,
    network: Arc<LocalNetwork>,
    pub replies: Receiver<ClientReply>,
    collector: JoinHandle<()>,
}

impl ClientHandle {
    pub fn connect(name: impl Into<String>, f: u64, network: Arc<LocalNetwork>) -> Self {
        let client = PbftClient::new(name, f);
        let (inbox_tx, mut inbox_rx) = mpsc::channel::<ClientReply>(1024);
        let (done_tx, done_rx) = mpsc::channel(1024);
        network.register_client(client.name(), inbox_tx);

        let mut collector_client = PbftClient::new(client.name(), f);
        let collector = tokio::spawn(async move {
            while let Some(reply) = inbox_rx.recv().await {
                if let Some(accepted) = collector_client.recv_reply(reply) {
                    if done_tx.send(accepted).await.is_err() {
                        break;
                    }
                }
            }
        });

        ClientHandle { client, network, replies: done_rx, collector }
    }

    /// Fire-and-forget submission to every replica.
    pub async fn propose(&mut self, op: Vec<u8>) -> RequestClient {
        let request = self.client.propose(op);
        self.network.submit(request.clone()).await;
        request
    }

    /// Sends an already built request, or sends one again when no reply
    /// arrived in time.
    pub async fn submit(&self, request: &RequestClient) {
        self.network.submit(request.clone()).await;
    }
}

impl Drop for ClientHandle {
    fn drop(&mut self) {
        self.collector.abort();
    }
}
