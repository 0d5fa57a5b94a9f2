//! Request/response correlation.
//!
//! Owns the pending-request table for one endpoint: id matching, the
//! ack-gated retransmit schedule, timeout expiry, and duplicate-request
//! memory. The reactor drives it with explicit `now` instants, which keeps
//! every schedule decision testable without a runtime.

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::error::BrokerError;

/// First retransmit fires this long after the initial send.
pub const RETRY_INITIAL: Duration = Duration::from_millis(200);
/// Retransmit interval doubles up to this cap.
pub const RETRY_MAX: Duration = Duration::from_secs(1);
/// Total per-request timeout unless overridden.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// How many handled request ids we remember for duplicate re-acks.
const SEEN_CAP: usize = 1024;

type Responder = oneshot::Sender<Result<Option<Value>, BrokerError>>;

/// One outbound request awaiting ack and response.
pub(crate) struct Pending {
    pub name: String,
    /// Encoded frame, re-posted verbatim on each retransmit.
    pub encoded: String,
    pub responder: Responder,
    pub deadline: Instant,
    pub ack_received: bool,
    pub next_retry: Instant,
    pub retry_interval: Duration,
    pub timeout: Duration,
}

/// A frame due for retransmission.
pub(crate) struct Retransmit {
    pub id: String,
    pub encoded: String,
}

/// An expired request to reject.
pub(crate) struct Expired {
    pub name: String,
    pub responder: Responder,
    pub timeout: Duration,
}

#[derive(Default)]
pub(crate) struct Correlator {
    pending: HashMap<String, Pending>,
    seen_order: VecDeque<String>,
    seen: HashSet<String>,
}

impl Correlator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Register an outbound request. Ids are assigned by the endpoint from a
    /// monotonic counter, so a collision here would be a broker bug.
    pub fn insert(&mut self, id: String, pending: Pending) {
        debug_assert!(!self.pending.contains_key(&id), "correlation id reuse: {id}");
        self.pending.insert(id, pending);
    }

    /// Inbound ack: stop retransmits, keep waiting for the response.
    /// Returns false for unknown (late or duplicate) acks.
    pub fn mark_acked(&mut self, id: &str) -> bool {
        match self.pending.get_mut(id) {
            Some(p) => {
                p.ack_received = true;
                true
            }
            None => false,
        }
    }

    /// Inbound response: take the pending record if the id is live.
    /// `None` means a late duplicate that the caller drops.
    pub fn take(&mut self, id: &str) -> Option<Pending> {
        self.pending.remove(id)
    }

    /// The next instant at which a retransmit or expiry is due.
    pub fn next_wakeup(&self) -> Option<Instant> {
        self.pending
            .values()
            .map(|p| {
                if p.ack_received {
                    p.deadline
                } else {
                    p.deadline.min(p.next_retry)
                }
            })
            .min()
    }

    /// Collect frames whose retransmit is due and advance their schedule:
    /// 200ms, 400ms, 800ms, then 1s flat.
    pub fn due_retransmits(&mut self, now: Instant) -> Vec<Retransmit> {
        let mut due = Vec::new();
        for (id, p) in self.pending.iter_mut() {
            if !p.ack_received && now >= p.next_retry {
                due.push(Retransmit {
                    id: id.clone(),
                    encoded: p.encoded.clone(),
                });
                p.retry_interval = (p.retry_interval * 2).min(RETRY_MAX);
                p.next_retry = now + p.retry_interval;
            }
        }
        due
    }

    /// Remove and return requests whose total timeout elapsed. Timeouts fire
    /// independently of acks.
    pub fn expire(&mut self, now: Instant) -> Vec<Expired> {
        let expired_ids: Vec<String> = self
            .pending
            .iter()
            .filter(|(_, p)| now >= p.deadline)
            .map(|(id, _)| id.clone())
            .collect();

        expired_ids
            .into_iter()
            .filter_map(|id| self.pending.remove(&id))
            .map(|p| Expired {
                name: p.name,
                responder: p.responder,
                timeout: p.timeout,
            })
            .collect()
    }

    /// Reject everything; used on endpoint disposal.
    pub fn fail_all(&mut self, err: BrokerError) {
        for (_, p) in self.pending.drain() {
            let _ = p.responder.send(Err(err.clone()));
        }
    }

    /// Remember a handled inbound request id. Returns true when the id was
    /// already seen, in which case the handler must not run again (the ack
    /// is still re-emitted).
    pub fn record_seen(&mut self, id: &str) -> bool {
        if self.seen.contains(id) {
            return true;
        }
        self.seen.insert(id.to_string());
        self.seen_order.push_back(id.to_string());
        if self.seen_order.len() > SEEN_CAP {
            if let Some(evicted) = self.seen_order.pop_front() {
                self.seen.remove(&evicted);
            }
        }
        false
    }

    /// Unremember an id recorded by [`record_seen`]; used when dispatch
    /// fails before the handler runs so a retransmit gets a fresh chance.
    pub fn forget_seen(&mut self, id: &str) {
        if self.seen.remove(id) {
            self.seen_order.retain(|s| s != id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pending(now: Instant, timeout: Duration) -> (Pending, oneshot::Receiver<Result<Option<Value>, BrokerError>>) {
        let (tx, rx) = oneshot::channel();
        (
            Pending {
                name: "handshake".into(),
                encoded: "forgeframe:{}".into(),
                responder: tx,
                deadline: now + timeout,
                ack_received: false,
                next_retry: now + RETRY_INITIAL,
                retry_interval: RETRY_INITIAL,
                timeout,
            },
            rx,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn retry_schedule_doubles_to_cap() {
        let now = Instant::now();
        let mut c = Correlator::new();
        let (p, _rx) = pending(now, Duration::from_secs(60));
        c.insert("a/1".into(), p);

        // Expected offsets from send: 200, 600, 1400, 2400, 3400 ms
        // (intervals 200, 400, 800, 1000, 1000).
        let mut offsets = Vec::new();
        let mut t = now;
        for _ in 0..5 {
            t = c.next_wakeup().unwrap();
            let due = c.due_retransmits(t);
            assert_eq!(due.len(), 1);
            offsets.push(t - now);
        }
        assert_eq!(
            offsets,
            vec![
                Duration::from_millis(200),
                Duration::from_millis(600),
                Duration::from_millis(1400),
                Duration::from_millis(2400),
                Duration::from_millis(3400),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn ack_stops_retransmits_but_not_timeout() {
        let now = Instant::now();
        let mut c = Correlator::new();
        let timeout = Duration::from_secs(10);
        let (p, mut rx) = pending(now, timeout);
        c.insert("a/1".into(), p);

        assert!(c.mark_acked("a/1"));
        assert!(c.due_retransmits(now + Duration::from_secs(5)).is_empty());
        // Next event is the timeout itself.
        assert_eq!(c.next_wakeup(), Some(now + timeout));

        let expired = c.expire(now + timeout);
        assert_eq!(expired.len(), 1);
        for e in expired {
            let _ = e.responder.send(Err(BrokerError::Timeout {
                name: e.name,
                timeout_ms: e.timeout.as_millis() as u64,
            }));
        }
        assert!(matches!(
            rx.try_recv().unwrap(),
            Err(BrokerError::Timeout { .. })
        ));
        assert_eq!(c.pending_len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn late_response_is_orphaned() {
        let now = Instant::now();
        let mut c = Correlator::new();
        let (p, _rx) = pending(now, Duration::from_secs(1));
        c.insert("a/1".into(), p);

        assert!(c.take("a/1").is_some());
        // Second response for the same id has nothing to match.
        assert!(c.take("a/1").is_none());
        assert!(!c.mark_acked("a/1"));
    }

    #[tokio::test(start_paused = true)]
    async fn seen_requests_bounded() {
        let mut c = Correlator::new();
        assert!(!c.record_seen("x/1"));
        assert!(c.record_seen("x/1"));

        for i in 0..SEEN_CAP {
            c.record_seen(&format!("y/{i}"));
        }
        // Oldest id evicted once past the cap.
        assert!(!c.record_seen("x/1"));
    }
}
