//! The per-site delivery scheduler core.
//!
//! Single-threaded, run-to-completion: every mutation of the model
//! happens on the event loop's thread, and none of the operations
//! here perform I/O. Interactions with the outside world (queue
//! files, workers, the disposition log) are returned to the caller
//! as [`SideEffect`]s, which the loop executes between core calls.
//!
//! Data flow: queue file -> message -> (per transport) job -> (per
//! destination) peer -> entry -> destination-queue todo -> selected
//! -> busy -> worker -> completion -> accounting -> recycling.

use crate::config::FerrydConfig;
use crate::dispatch::{
    Completion, DeliveryRequest, DispatchToken, RecipientDisposition, Reply, SiteVerdict,
};
use crate::disposition::RecordType;
use crate::metrics;
use crate::resolve::RecipientResolver;
use retryq::{PopResult, RetryQ};
use spool::{FinalDisposition, SpoolId};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

pub mod arena;
mod entry;
mod job;
mod message;
mod peer;
mod queue;
mod transport;

#[cfg(test)]
mod test;

use arena::{entity_id, Arena};

pub use entry::{Entry, Placement};
pub use job::Job;
pub use message::{AdmitBatch, Message, MessageFlags, RefillBatch};
pub use peer::Peer;
pub use queue::DestQueue;
pub use transport::Transport;

entity_id!(MessageId, JobId, PeerId, EntryId, QueueId, TransportId);

/// An interaction with the world outside the scheduler model,
/// produced by core operations and executed by the event loop.
#[derive(Debug)]
pub enum SideEffect {
    /// Overwrite the recipient record at `offset` with a completion
    /// marker; the recipient must never be delivered again.
    MarkDone { spool_id: SpoolId, offset: u64 },
    /// Append a disposition record.
    Log(LogEvent),
    /// The message has no references left; move its queue file to
    /// its final resting place.
    Finalize {
        spool_id: SpoolId,
        disposition: FinalDisposition,
    },
    /// The message drained its in-core recipients but the queue file
    /// has more; read up to `limit` recipients starting at `offset`
    /// and feed them to [`Scheduler::refill_apply`].
    Refill {
        message: MessageId,
        spool_id: SpoolId,
        offset: u64,
        limit: usize,
    },
}

/// Owned form of a disposition record, carried in a [`SideEffect`].
#[derive(Debug, Clone)]
pub struct LogEvent {
    pub kind: RecordType,
    pub queue_id: String,
    pub recipient: Option<String>,
    pub reply: Option<Reply>,
    pub destination: Option<String>,
    pub transport: Option<String>,
    pub reason: Option<String>,
}

impl LogEvent {
    pub fn emit(&self, log: &crate::disposition::DispositionLog) {
        log.log(crate::disposition::LogDisposition {
            kind: self.kind,
            queue_id: &self.queue_id,
            recipient: self.recipient.as_deref(),
            reply: self.reply.as_ref(),
            destination: self.destination.as_deref(),
            transport: self.transport.as_deref(),
            reason: self.reason.as_deref(),
        });
    }
}

pub struct Scheduler {
    pub(crate) cfg: Arc<FerrydConfig>,
    resolver: Arc<dyn RecipientResolver>,

    pub(crate) messages: Arena<MessageId, Message>,
    pub(crate) jobs: Arena<JobId, Job>,
    pub(crate) peers: Arena<PeerId, Peer>,
    pub(crate) entries: Arena<EntryId, Entry>,
    pub(crate) queues: Arena<QueueId, DestQueue>,
    pub(crate) transports: Arena<TransportId, Transport>,

    pub(crate) transport_by_name: HashMap<String, TransportId>,
    /// Stable cycle order for the top-level transport scan.
    pub(crate) transport_order: Vec<TransportId>,
    scan_cursor: usize,

    /// Process-wide count of in-core recipients; the pool they draw
    /// from is `cfg.recipient_limit`.
    pub(crate) recipient_count: usize,

    retry: RetryQ<queue::RetryDeadline>,
    dispatched: HashMap<DispatchToken, EntryId>,
    token_seq: DispatchToken,
    effects: Vec<SideEffect>,
    /// Set during shutdown: drained messages finalize instead of
    /// refilling from their queue files.
    draining: bool,
}

impl Scheduler {
    pub fn new(cfg: Arc<FerrydConfig>, resolver: Arc<dyn RecipientResolver>) -> Self {
        Self {
            cfg,
            resolver,
            messages: Arena::default(),
            jobs: Arena::default(),
            peers: Arena::default(),
            entries: Arena::default(),
            queues: Arena::default(),
            transports: Arena::default(),
            transport_by_name: HashMap::new(),
            transport_order: Vec::new(),
            scan_cursor: 0,
            recipient_count: 0,
            retry: RetryQ::new(),
            dispatched: HashMap::new(),
            token_seq: 0,
            effects: Vec::new(),
            draining: false,
        }
    }

    /// Stop asking for recipient refills; drained messages finalize
    /// with whatever recipients they still owe left in their files.
    pub fn drain_mode(&mut self) {
        self.draining = true;
    }

    /// Recipient slots available to a message admitted right now;
    /// 0 means admission must wait for deliveries to drain.
    pub fn admission_budget(&self) -> usize {
        self.cfg
            .recipient_limit
            .saturating_sub(self.recipient_count)
    }

    pub fn can_admit(&self) -> bool {
        self.messages.len() < self.cfg.message_active_limit && self.admission_budget() > 0
    }

    pub fn message_count(&self) -> usize {
        self.messages.len()
    }

    pub fn inflight_count(&self) -> usize {
        self.dispatched.len()
    }

    /// Drain the side effects accumulated by core calls since the
    /// last drain, in the order they were produced.
    pub fn take_effects(&mut self) -> Vec<SideEffect> {
        std::mem::take(&mut self.effects)
    }

    pub(crate) fn push_effect(&mut self, effect: SideEffect) {
        self.effects.push(effect);
    }

    /// Select the next dispatchable entry, cycling transports
    /// round-robin. Returns the entry and the request describing it;
    /// the caller either hands it to an agent and confirms with
    /// [`Scheduler::note_dispatched`], or backs out with
    /// [`Scheduler::entry_unselect`].
    pub fn next_delivery(&mut self) -> Option<(EntryId, DeliveryRequest)> {
        let count = self.transport_order.len();
        for step in 0..count {
            let tid = self.transport_order[(self.scan_cursor + step) % count];
            if let Some(eid) = self.transport_select(tid) {
                self.scan_cursor = (self.scan_cursor + step + 1) % count;
                let request = self.build_request(eid);
                return Some((eid, request));
            }
        }
        None
    }

    fn build_request(&self, eid: EntryId) -> DeliveryRequest {
        let entry = &self.entries[eid];
        let message = &self.messages[entry.message];
        let queue = &self.queues[entry.queue];
        let transport = &self.transports[queue.transport];
        DeliveryRequest {
            queue_id: message.spool_id.to_string(),
            sender: message.sender.clone(),
            recipients: entry.rcpts.iter().map(|r| r.address.clone()).collect(),
            transport: transport.name.clone(),
            nexthop: queue.name.clone(),
            time_limit_secs: self.cfg.time_limit.as_secs(),
        }
    }

    pub fn next_token(&mut self) -> DispatchToken {
        self.token_seq += 1;
        self.token_seq
    }

    /// The dispatcher took ownership of the entry; it now has an
    /// open stream to a worker and may no longer be unselected.
    pub fn note_dispatched(&mut self, eid: EntryId, token: DispatchToken) {
        let entry = &mut self.entries[eid];
        assert!(
            entry.stream.is_none(),
            "note_dispatched: entry already has an open stream"
        );
        assert_eq!(entry.placement, Placement::Busy);
        entry.stream = Some(token);
        self.dispatched.insert(token, eid);
        let tid = self.queues[entry.queue].transport;
        self.transports[tid].inflight += 1;
        metrics::DISPATCH_TOTAL.inc();
        metrics::INFLIGHT_DELIVERIES.set(self.dispatched.len() as i64);
    }

    /// Process a worker's report for a dispatched entry: write
    /// completion markers and log records, feed the destination-wide
    /// verdict into throttling, then retire the entry.
    pub fn complete(&mut self, completion: Completion) {
        let Completion { token, report } = completion;
        let Some(eid) = self.dispatched.remove(&token) else {
            tracing::warn!("completion for unknown dispatch token {token}");
            return;
        };
        metrics::INFLIGHT_DELIVERIES.set(self.dispatched.len() as i64);

        let entry = &mut self.entries[eid];
        entry.stream = None;
        let mid = entry.message;
        let qid = entry.queue;
        let rcpts = entry.rcpts.clone();
        let tid = self.queues[qid].transport;
        self.transports[tid].inflight -= 1;

        let spool_id = self.messages[mid].spool_id;
        let queue_id = spool_id.to_string();
        let nexthop = self.queues[qid].name.clone();
        let transport_name = self.transports[tid].name.clone();

        let mut dispositions = report.dispositions;
        // A short vector is a worker lost mid-batch; the tail was
        // never acknowledged and must be retried.
        while dispositions.len() < rcpts.len() {
            dispositions.push(RecipientDisposition::Defer(Reply::new(
                451,
                "worker lost before acknowledgment",
            )));
        }

        let mut any_delivered = false;
        for (rcpt, disposition) in rcpts.iter().zip(dispositions.iter()) {
            let (kind, reply) = match disposition {
                RecipientDisposition::Delivered => {
                    any_delivered = true;
                    self.effects.push(SideEffect::MarkDone {
                        spool_id,
                        offset: rcpt.offset,
                    });
                    (RecordType::Delivery, None)
                }
                RecipientDisposition::Bounce(reply) => {
                    self.effects.push(SideEffect::MarkDone {
                        spool_id,
                        offset: rcpt.offset,
                    });
                    (RecordType::Bounce, Some(reply.clone()))
                }
                RecipientDisposition::Defer(reply) => {
                    self.messages[mid].flags |= MessageFlags::ANY_DEFER;
                    (RecordType::Defer, Some(reply.clone()))
                }
            };
            self.effects.push(SideEffect::Log(LogEvent {
                kind,
                queue_id: queue_id.clone(),
                recipient: Some(rcpt.address.clone()),
                reply,
                destination: Some(nexthop.clone()),
                transport: Some(transport_name.clone()),
                reason: None,
            }));
        }

        match report.verdict {
            Some(SiteVerdict::Dead(reason)) => {
                self.queue_throttle(qid, reason);
            }
            _ => {
                // A delivery got through; if the destination was
                // throttled in the meantime by a sibling entry,
                // revive it rather than waiting out the back-off.
                if any_delivered && self.queues[qid].window == 0 {
                    self.queue_unthrottle(qid, true);
                }
            }
        }

        self.entry_done(eid, Placement::Busy);
        #[cfg(debug_assertions)]
        self.verify_model();
    }

    /// Run due unthrottle deadlines. Returns how long the caller may
    /// sleep before checking again; `None` when no deadline pends.
    pub fn service_retries(&mut self) -> Option<Duration> {
        loop {
            match self.retry.pop() {
                PopResult::Due(due) => {
                    for deadline in due {
                        self.retry_due(&deadline.key.0, &deadline.key.1);
                    }
                }
                PopResult::Sleep(hint) => return Some(hint),
                PopResult::Empty => return None,
            }
        }
    }

    pub(crate) fn schedule_retry(&mut self, transport: String, nexthop: String, delay: Duration) {
        let key = (transport, nexthop);
        self.retry.cancel(&key);
        if self
            .retry
            .insert(queue::RetryDeadline { key, delay })
            .is_err()
        {
            tracing::error!("failed to schedule retry deadline");
        }
    }

    pub(crate) fn cancel_retry(&mut self, transport: &str, nexthop: &str) {
        self.retry
            .cancel(&(transport.to_string(), nexthop.to_string()));
    }

    fn retry_due(&mut self, transport: &str, nexthop: &str) {
        let Some(&tid) = self.transport_by_name.get(transport) else {
            return;
        };
        // The queue may have been destroyed since the deadline was
        // scheduled; destruction cancels, but a fire can race it.
        let Some(&qid) = self.transports[tid].queue_by_name.get(nexthop) else {
            return;
        };
        tracing::debug!("retry deadline for {transport}:{nexthop}, unthrottling");
        self.queue_unthrottle(qid, false);
        let queue = &self.queues[qid];
        if queue.todo.is_empty() && queue.busy.is_empty() {
            self.queue_done(qid);
        }
    }

    /// Sync the process-wide gauges to the authoritative counters.
    pub(crate) fn update_gauges(&self) {
        metrics::MESSAGE_COUNT.set(self.messages.len() as i64);
        metrics::RECIPIENT_COUNT.set(self.recipient_count as i64);
        metrics::DEST_QUEUE_COUNT.set(self.queues.len() as i64);
    }

    /// Walk the whole model and panic on any broken cross-entity
    /// invariant. Runs after every top-level operation in debug
    /// builds; silent corruption here must become a loud crash.
    #[cfg_attr(not(any(debug_assertions, test)), allow(dead_code))]
    pub(crate) fn verify_model(&self) {
        let mut queue_refs = 0;
        for (_, queue) in self.queues.iter() {
            assert_eq!(queue.todo_refcount, queue.todo.len, "{}", queue.name);
            assert_eq!(queue.busy_refcount, queue.busy.len, "{}", queue.name);
            queue_refs += queue.todo_refcount + queue.busy_refcount;
            assert!(
                queue.window == 0 || queue.busy_refcount <= queue.window,
                "queue {} busy {} over window {}",
                queue.name,
                queue.busy_refcount,
                queue.window
            );
            assert!(
                queue.window == 0 || queue.todo_refcount + queue.busy_refcount > 0,
                "live queue {} should not linger empty",
                queue.name
            );
        }
        assert_eq!(queue_refs, self.entries.len(), "entries on queue lists");

        let mut peer_refs = 0;
        for (_, peer) in self.peers.iter() {
            assert!(peer.refcount > 0, "peer with zero refcount is unreachable");
            peer_refs += peer.refcount;
        }
        assert_eq!(queue_refs, peer_refs, "peer refcounts vs queue refcounts");

        for (jid, job) in self.jobs.iter() {
            assert!(
                job.rcpt_count <= job.rcpt_limit,
                "{jid:?} count {} over limit {}",
                job.rcpt_count,
                job.rcpt_limit
            );
            assert!(
                job.selected_entries <= job.read_entries,
                "{jid:?} selected more entries than it read"
            );
        }

        let by_message: usize = self.messages.iter().map(|(_, m)| m.rcpt_count).sum();
        let by_entry: usize = self.entries.iter().map(|(_, e)| e.rcpts.len()).sum();
        assert_eq!(self.recipient_count, by_message);
        assert_eq!(self.recipient_count, by_entry);

        for (_, message) in self.messages.iter() {
            assert!(message.refcount > 0, "message with zero refcount lingers");
            assert!(message.rcpt_count <= message.rcpt_limit);
        }

        for (_, transport) in self.transports.iter() {
            assert_eq!(transport.blocker_tag % 2, 1, "blocker tag must stay odd");
        }
    }
}
