use tokio::sync::mpsc::{self, Receiver, Sender};
use tracing::{debug, info, warn};

use crate::common::timer::{Timer, TimerFired, TimerKind};
use crate::network::{Inbound, Outbound};
use super::replica::{Action, CommittedRequest, Replica};

/*
    Drives one replica. Network messages, client requests and timer fires
    are all consumed on this single loop, so the replica state is never
    touched concurrently. After every event the replica's queued actions are
    applied: messages go to the transport, executed requests to the commit
    stream, timer actions to the three timers.
*/

const TIMER_CHANNEL_SIZE: usize = 16;

struct Timers {
    view_change: Timer,
    resend: Timer,
    new_view: Timer,
}

impl Timers {
    fn new(fire_tx: Sender<TimerFired>) -> Self {
        Timers {
            view_change: Timer::new(TimerKind::ViewChange, fire_tx.clone()),
            resend: Timer::new(TimerKind::ViewChangeResend, fire_tx.clone()),
            new_view: Timer::new(TimerKind::NewView, fire_tx),
        }
    }

    fn get(&mut self, kind: TimerKind) -> &mut Timer {
        match kind {
            TimerKind::ViewChange => &mut self.view_change,
            TimerKind::ViewChangeResend => &mut self.resend,
            TimerKind::NewView => &mut self.new_view,
        }
    }

    fn close_all(&mut self) {
        self.view_change.close();
        self.resend.close();
        self.new_view.close();
    }
}

pub struct ConsensusProcessor {
    pub replica: Replica,
    pub msg_rx: Receiver<Inbound>,
    pub msg_tx: Sender<Outbound>,
    pub commit_tx: Sender<CommittedRequest>,
    timer_rx: Receiver<TimerFired>,
    timers: Timers,
}

impl ConsensusProcessor {
    pub fn new(
        replica: Replica,
        msg_rx: Receiver<Inbound>,
        msg_tx: Sender<Outbound>,
        commit_tx: Sender<CommittedRequest>,
    ) -> Self {
        let (fire_tx, timer_rx) = mpsc::channel(TIMER_CHANNEL_SIZE);
        ConsensusProcessor {
            replica,
            msg_rx,
            msg_tx,
            commit_tx,
            timer_rx,
            timers: Timers::new(fire_tx),
        }
    }

    /// Runs until the inbound channel closes or the transport goes away.
    pub async fn run(&mut self) {
        info!(replica = self.replica.id, view = self.replica.view, "running consensus processor");
        loop {
            tokio::select! {
                inbound = self.msg_rx.recv() => match inbound {
                    Some(Inbound::Request(request)) => self.replica.recv_request(request),
                    Some(Inbound::Message { from, envelope }) => self.replica.deliver(from, envelope),
                    None => {
                        info!(replica = self.replica.id, "inbound channel closed, stopping");
                        break;
                    }
                },
                Some(fired) = self.timer_rx.recv() => {
                    if self.timers.get(fired.kind).is_current(&fired) {
                        debug!(replica = self.replica.id, reason = fired.reason, "timer expired");
                        self.replica.handle_timeout(fired.kind);
                    } else {
                        debug!(replica = self.replica.id, timer = ?fired.kind, "dropping superseded timer fire");
                    }
                }
            }

            if !self.apply_actions().await {
                warn!(replica = self.replica.id, "transport closed, stopping");
                break;
            }
        }
        self.timers.close_all();
    }

    /// False once the transport is gone.
    async fn apply_actions(&mut self) -> bool {
        for action in self.replica.take_actions() {
            match action {
                Action::Broadcast(envelope) => {
                    if self.msg_tx.send(Outbound::Broadcast(envelope)).await.is_err() {
                        return false;
                    }
                }
                Action::Send { to, message } => {
                    if self.msg_tx.send(Outbound::Send { to, envelope: message }).await.is_err() {
                        return false;
                    }
                }
                Action::Reply(reply) => {
                    if self.msg_tx.send(Outbound::Reply(reply)).await.is_err() {
                        return false;
                    }
                }
                Action::Execute(committed) => {
                    if self.commit_tx.send(committed).await.is_err() {
                        debug!(replica = self.replica.id, "no commit stream consumer");
                    }
                }
                Action::StartTimer { kind, reason, duration } => self.timers.get(kind).reset(reason, duration),
                Action::StopTimer(kind) => self.timers.get(kind).stop(),
            }
        }
        true
    }
}
