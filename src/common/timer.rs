use std::time::Duration;

use tokio::sync::mpsc::Sender;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

/*
    Every timeout-driven transition of the replica goes through one of three
    timers. A timer never calls back into the replica: a fire is enqueued on
    the processor's timer channel and handled on the same loop as network
    messages. Each reset bumps the generation, so a fire that was already
    queued when the timer was re-armed or stopped is recognised as stale.
*/

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum TimerKind {
    ViewChange,
    ViewChangeResend,
    NewView,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TimerFired {
    pub kind: TimerKind,
    pub reason: &'static str,
    pub generation: u64,
}

pub struct Timer {
    kind: TimerKind,
    generation: u64,
    pending: Option<JoinHandle<()>>,
    closed: bool,
    fire_tx: Sender<TimerFired>,
}

impl Timer {
    pub fn new(kind: TimerKind, fire_tx: Sender<TimerFired>) -> Self {
        Timer {
            kind,
            generation: 0,
            pending: None,
            closed: false,
            fire_tx,
        }
    }

    /// Re-arms the timer. Any pending deadline is superseded.
    pub fn reset(&mut self, reason: &'static str, duration: Duration) {
        if self.closed {
            warn!(timer = ?self.kind, reason, "reset on closed timer ignored");
            return;
        }
        self.cancel_pending();
        self.generation += 1;

        let fired = TimerFired {
            kind: self.kind,
            reason,
            generation: self.generation,
        };
        let fire_tx = self.fire_tx.clone();
        let deadline = Instant::now() + duration;
        debug!(timer = ?self.kind, reason, ?duration, "timer armed");
        self.pending = Some(tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            // The processor may already be gone on shutdown.
            let _ = fire_tx.send(fired).await;
        }));
    }

    /// Cancels the pending deadline, if any, without firing.
    pub fn stop(&mut self) {
        self.cancel_pending();
        self.generation += 1;
    }

    /// Permanently disables the timer.
    pub fn close(&mut self) {
        self.stop();
        self.closed = true;
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// True when `fired` belongs to the latest reset of this timer.
    pub fn is_current(&self, fired: &TimerFired) -> bool {
        fired.kind == self.kind && fired.generation == self.generation && !self.closed
    }

    fn cancel_pending(&mut self) {
        if let Some(handle) = self.pending.take() {
            handle.abort();
        }
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.cancel_pending();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;
    use tokio::time::sleep;

    #[tokio::test(start_paused = true)]
    async fn test_reset_twice_fires_once_from_second_call() {
        let (tx, mut rx) = mpsc::channel(8);
        let mut timer = Timer::new(TimerKind::ViewChange, tx);

        timer.reset("View-change", Duration::from_secs(10));
        sleep(Duration::from_secs(6)).await;
        timer.reset("View-change", Duration::from_secs(10));

        // 12s after the first reset, only 6s after the second.
        sleep(Duration::from_secs(6)).await;
        assert!(rx.try_recv().is_err());

        sleep(Duration::from_secs(5)).await;
        let fired = rx.try_recv().unwrap();
        assert_eq!(fired.kind, TimerKind::ViewChange);
        assert!(timer.is_current(&fired));

        sleep(Duration::from_secs(30)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_cancels_silently() {
        let (tx, mut rx) = mpsc::channel(8);
        let mut timer = Timer::new(TimerKind::NewView, tx);

        timer.reset("New-View", Duration::from_secs(1));
        timer.stop();
        sleep(Duration::from_secs(5)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_is_permanent() {
        let (tx, mut rx) = mpsc::channel(8);
        let mut timer = Timer::new(TimerKind::ViewChangeResend, tx);

        timer.close();
        timer.reset("Resend-View-change", Duration::from_secs(1));
        sleep(Duration::from_secs(5)).await;
        assert!(rx.try_recv().is_err());
        assert!(timer.is_closed());
    }

    #[tokio::test]
    async fn test_stale_fire_not_current() {
        let (tx, _rx) = mpsc::channel(8);
        let mut timer = Timer::new(TimerKind::ViewChange, tx);
        timer.reset("View-change", Duration::from_secs(1));
        let stale = TimerFired { kind: TimerKind::ViewChange, reason: "View-change", generation: 1 };
        assert!(timer.is_current(&stale));
        timer.stop();
        assert!(!timer.is_current(&stale));
    }
}
