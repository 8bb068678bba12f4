use std::collections::{BTreeMap, HashMap};

use crate::common::crypto::{Digest, Hashable};
use super::message::{ClientReply, RequestClient, SeqNo};

/// The replica's request log: every request it knows about by digest, the
/// ones still waiting for execution, the executed ones by sequence number,
/// and the replies already sent to each client.
#[derive(Default)]
pub struct Store {
    pub requests: HashMap<Digest, RequestClient>,
    outstanding: HashMap<Digest, (u64, RequestClient)>,
    arrivals: u64,
    pub executed: BTreeMap<SeqNo, RequestClient>,
    pub replies: HashMap<String, Vec<ClientReply>>,
}

impl Store {
    pub fn new() -> Self {
        Store::default()
    }

    /// Logs a request and marks it outstanding. Returns its digest and
    /// whether it was unknown before.
    pub fn add_request(&mut self, request: RequestClient) -> (Digest, bool) {
        let digest = request.hash();
        let is_new = !self.requests.contains_key(&digest);
        if is_new {
            self.requests.insert(digest, request.clone());
        }
        if !self.outstanding.contains_key(&digest) && !self.is_executed(&request) && !self.is_pending(&request) {
            self.arrivals += 1;
            self.outstanding.insert(digest, (self.arrivals, request));
        }
        (digest, is_new)
    }

    /// Another request with the same `(client, timestamp)` awaits execution.
    fn is_pending(&self, request: &RequestClient) -> bool {
        self.outstanding
            .values()
            .any(|(_, r)| r.client == request.client && r.timestamp == request.timestamp)
    }

    pub fn request(&self, digest: &Digest) -> Option<&RequestClient> {
        self.requests.get(digest)
    }

    pub fn has_request(&self, digest: &Digest) -> bool {
        self.requests.contains_key(digest)
    }

    pub fn is_outstanding(&self, digest: &Digest) -> bool {
        self.outstanding.contains_key(digest)
    }

    pub fn outstanding_len(&self) -> usize {
        self.outstanding.len()
    }

    /// Outstanding requests in arrival order.
    pub fn outstanding(&self) -> Vec<(Digest, RequestClient)> {
        let mut pending: Vec<_> = self
            .outstanding
            .iter()
            .map(|(digest, (order, request))| (*order, *digest, request.clone()))
            .collect();
        pending.sort_by_key(|(order, _, _)| *order);
        pending.into_iter().map(|(_, digest, request)| (digest, request)).collect()
    }

    pub fn mark_executed(&mut self, seq: SeqNo, digest: &Digest) -> Option<RequestClient> {
        self.outstanding.remove(digest);
        let request = self.requests.get(digest).cloned()?;
        self.executed.insert(seq, request.clone());
        Some(request)
    }

    pub fn is_executed(&self, request: &RequestClient) -> bool {
        self.reply_for(&request.client, request.timestamp).is_some()
    }

    /// Drops a request from the digest index unless it still awaits execution.
    pub fn forget(&mut self, digest: &Digest) {
        if !self.outstanding.contains_key(digest) {
            self.requests.remove(digest);
        }
    }

    pub fn persist_reply(&mut self, reply: ClientReply) {
        self.replies.entry(reply.client.clone()).or_default().push(reply);
    }

    pub fn reply_for(&self, client: &str, timestamp: u64) -> Option<&ClientReply> {
        self.replies
            .get(client)?
            .iter()
            .rev()
            .find(|reply| reply.timestamp == timestamp)
    }
}
