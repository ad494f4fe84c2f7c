//! Destination queue lifecycle and throttling.
//!
//! A destination queue holds the entries bound for one nexthop on
//! one transport. Its window caps concurrent deliveries; a window of
//! zero means the site was declared dead and is waiting out its
//! back-off. Dead queues survive draining so the back-off state is
//! not lost, up to a memory bound.

use crate::metrics;
use crate::sched::arena::{list_append, list_unlink, Links, ListHead};
use crate::sched::{EntryId, QueueId, Scheduler, TransportId};
use std::time::Duration;

pub struct DestQueue {
    /// Transport-specific nexthop; doubles as the lookup key.
    pub name: String,
    pub transport: TransportId,
    pub todo: ListHead<EntryId>,
    pub busy: ListHead<EntryId>,
    pub todo_refcount: usize,
    pub busy_refcount: usize,
    /// Concurrency window; 0 = dead (throttled).
    pub window: usize,
    /// Window to restore on unthrottle.
    saved_window: usize,
    /// Doubles per consecutive throttle; zero until first throttle.
    pub(crate) backoff: Duration,
    pub dead_reason: Option<String>,
    /// Stamp matching the transport's current blocker tag while this
    /// queue is known to block job scans; 0 = never stamped.
    pub blocker_tag: u64,
    pub transport_links: Links<QueueId>,
}

/// Unthrottle deadline, keyed by (transport, nexthop) name rather
/// than arena index so a queue destroyed and re-created in the
/// meantime cannot inherit its predecessor's deadline.
pub(crate) struct RetryDeadline {
    pub key: (String, String),
    pub delay: Duration,
}

impl retryq::RetryEntry for RetryDeadline {
    type Id = (String, String);

    fn id(&self) -> &(String, String) {
        &self.key
    }

    fn delay(&self) -> Duration {
        self.delay
    }
}

impl Scheduler {
    pub(crate) fn queue_find(&self, tid: TransportId, nexthop: &str) -> Option<QueueId> {
        self.transports[tid].queue_by_name.get(nexthop).copied()
    }

    pub(crate) fn queue_create(&mut self, tid: TransportId, nexthop: &str) -> QueueId {
        let window = self.transports[tid].limits.dest_concurrency_limit;
        let qid = self.queues.insert(DestQueue {
            name: nexthop.to_string(),
            transport: tid,
            todo: ListHead::default(),
            busy: ListHead::default(),
            todo_refcount: 0,
            busy_refcount: 0,
            window,
            saved_window: window,
            backoff: Duration::ZERO,
            dead_reason: None,
            blocker_tag: 0,
            transport_links: Links::default(),
        });
        let transport = &mut self.transports[tid];
        transport.queue_by_name.insert(nexthop.to_string(), qid);
        list_append!(self.queues, self.transports[tid].queue_list, qid, transport_links);
        tracing::debug!(
            "created queue {}:{nexthop} window {window}",
            self.transports[tid].name
        );
        self.update_gauges();
        qid
    }

    pub(crate) fn queue_obtain(&mut self, tid: TransportId, nexthop: &str) -> QueueId {
        match self.queue_find(tid, nexthop) {
            Some(qid) => qid,
            None => self.queue_create(tid, nexthop),
        }
    }

    /// Discard a drained queue. Destruction wins over a pending
    /// retry deadline: the deadline is cancelled here, and a fire
    /// that races the cancellation finds no queue and is ignored.
    pub(crate) fn queue_done(&mut self, qid: QueueId) {
        let queue = &self.queues[qid];
        if !queue.todo.is_empty() || !queue.busy.is_empty() {
            panic!("queue_done: queue {} is not empty", queue.name);
        }
        if queue.todo_refcount != 0 || queue.busy_refcount != 0 {
            panic!("queue_done: queue {} has dangling refcounts", queue.name);
        }
        let tid = queue.transport;
        let name = queue.name.clone();
        let transport_name = self.transports[tid].name.clone();
        self.cancel_retry(&transport_name, &name);
        self.transports[tid].queue_by_name.remove(&name);
        list_unlink!(self.queues, self.transports[tid].queue_list, qid, transport_links);
        self.queues.remove(qid);
        tracing::debug!("discarded queue {transport_name}:{name}");
        self.update_gauges();
    }

    /// Declare the destination dead: close the window so nothing
    /// more is selected, and schedule the unthrottle deadline.
    /// Entries already dispatched still complete normally; entries
    /// on todo stay pending.
    pub(crate) fn queue_throttle(&mut self, qid: QueueId, reason: String) {
        let minimal = self.cfg.minimal_backoff;
        let maximal = self.cfg.maximal_backoff;
        let queue = &mut self.queues[qid];
        if queue.window == 0 {
            // Already dead; keep the original deadline, refresh the
            // operator-visible reason.
            queue.dead_reason = Some(reason);
            return;
        }
        queue.saved_window = queue.window;
        queue.window = 0;
        queue.backoff = if queue.backoff.is_zero() {
            minimal
        } else {
            (queue.backoff * 2).min(maximal)
        };
        let backoff = queue.backoff;
        let name = queue.name.clone();
        let tid = queue.transport;
        tracing::info!(
            "throttling {}:{name} for {backoff:?}: {reason}",
            self.transports[tid].name
        );
        self.queues[qid].dead_reason = Some(reason);
        metrics::THROTTLE_TOTAL.inc();
        let transport_name = self.transports[tid].name.clone();
        self.schedule_retry(transport_name, name, backoff);
    }

    /// Restore a dead queue's window. `delivered` is set when the
    /// revival was triggered by a successful delivery rather than
    /// the back-off deadline; success also resets the back-off.
    pub(crate) fn queue_unthrottle(&mut self, qid: QueueId, delivered: bool) {
        let queue = &mut self.queues[qid];
        if queue.window != 0 {
            return;
        }
        queue.window = queue.saved_window.max(1);
        queue.dead_reason = None;
        if delivered {
            queue.backoff = Duration::ZERO;
        }
        let name = queue.name.clone();
        let tid = queue.transport;
        let transport_name = self.transports[tid].name.clone();
        tracing::info!("unthrottling {transport_name}:{name}");
        self.cancel_retry(&transport_name, &name);
        // Unthrottling is an unblocking event: jobs pinned behind
        // this destination must be revisited, so restart the scan
        // epoch just as a completion that lifts the window does.
        if self.queues[qid].blocker_tag == self.transports[tid].blocker_tag {
            self.transports[tid].blocker_tag += 2;
            self.transports[tid].job_current = self.transports[tid].job_list.head;
        }
        self.queues[qid].blocker_tag = 0;
        self.transports[tid].candidate_cache_current = false;
    }

    /// Defer every todo entry of this queue and retire them.
    /// Queues, peers and messages may disappear as a side effect;
    /// the queue itself survives only if it is dead or has busy
    /// entries in flight.
    pub fn defer_todo(&mut self, qid: QueueId, reason: &str) {
        while let Some(eid) = self.queues.get(qid).and_then(|q| q.todo.head) {
            self.entry_defer_todo(eid, reason);
        }
    }
}
