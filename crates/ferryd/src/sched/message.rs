//! In-core messages: admission, recipient assignment, streaming
//! refills, and final disposition.

use crate::disposition::RecordType;
use crate::resolve::ResolveOutcome;
use crate::sched::arena::ListHead;
use crate::sched::{JobId, LogEvent, MessageId, Scheduler, SideEffect};
use envelope::Recipient;
use spool::{FinalDisposition, SpoolId};

bitflags::bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct MessageFlags: u8 {
        /// At least one recipient was deferred; the queue file goes
        /// to the deferred area instead of being removed.
        const ANY_DEFER = 1;
        /// The envelope turned out to be damaged mid-life; the file
        /// is set aside for inspection.
        const CORRUPT = 2;
    }
}

pub struct Message {
    pub spool_id: SpoolId,
    pub arrival: i64,
    pub sender: String,
    /// Entries referencing this message, plus one transient hold
    /// while the loop is admitting or refilling it.
    pub refcount: usize,
    /// Resume position for further recipient records; 0 once the
    /// envelope has been read to the end.
    pub rcpt_offset: u64,
    /// In-core recipients across all of this message's entries.
    pub rcpt_count: usize,
    /// Recipient slots this message may occupy; grows and shrinks
    /// through the slot-borrowing protocol.
    pub rcpt_limit: usize,
    pub flags: MessageFlags,
    pub jobs: ListHead<JobId>,
}

/// The harvest of one envelope read, handed to the core by the
/// event loop (which owns the file I/O).
#[derive(Debug)]
pub struct AdmitBatch {
    pub arrival: i64,
    pub sender: String,
    pub recipients: Vec<Recipient>,
    /// Resume position; 0 when the envelope was read to the end.
    pub rcpt_offset: u64,
    /// The budget the read was granted; becomes the message's
    /// initial recipient limit.
    pub budget: usize,
}

/// A follow-up read at a message's resume offset.
#[derive(Debug)]
pub struct RefillBatch {
    pub recipients: Vec<Recipient>,
    pub rcpt_offset: u64,
}

struct ResolvedRcpt {
    rcpt: Recipient,
    transport: String,
    nexthop: String,
}

impl Scheduler {
    /// Admit a queue file: create the in-core message and assign its
    /// first batch of recipients. Returns `None` when every
    /// recipient was disposed of synchronously and the message is
    /// already gone again.
    pub fn admit(&mut self, spool_id: SpoolId, batch: AdmitBatch) -> Option<MessageId> {
        assert!(batch.budget > 0, "admit: no recipient slots available");
        let mid = self.messages.insert(Message {
            spool_id,
            arrival: batch.arrival,
            sender: batch.sender,
            refcount: 1,
            rcpt_offset: batch.rcpt_offset,
            rcpt_count: 0,
            rcpt_limit: batch.budget,
            flags: MessageFlags::empty(),
            jobs: ListHead::default(),
        });
        tracing::debug!(
            "admitted {spool_id} with {} recipients (budget {})",
            batch.recipients.len(),
            batch.budget
        );
        self.assign_batch(mid, batch.recipients);
        if self.messages[mid].rcpt_offset == 0 {
            self.message_move_limits(mid);
        }
        self.message_release(mid);
        self.update_gauges();
        #[cfg(debug_assertions)]
        self.verify_model();
        self.messages.contains(mid).then_some(mid)
    }

    /// Apply the batch read for a [`SideEffect::Refill`].
    pub fn refill_apply(&mut self, mid: MessageId, batch: RefillBatch) {
        let message = &mut self.messages[mid];
        message.rcpt_offset = batch.rcpt_offset;
        self.assign_batch(mid, batch.recipients);
        if self.messages[mid].rcpt_offset == 0 {
            self.message_move_limits(mid);
        }
        self.message_release(mid);
        self.update_gauges();
        #[cfg(debug_assertions)]
        self.verify_model();
    }

    /// The read for a [`SideEffect::Refill`] failed. A damaged
    /// envelope quarantines the file; a vanished or unreadable one
    /// defers whatever the message still owes.
    pub fn refill_failed(&mut self, mid: MessageId, corrupt: bool) {
        let message = &mut self.messages[mid];
        tracing::warn!(
            "refill of {} failed (corrupt: {corrupt})",
            message.spool_id
        );
        message.rcpt_offset = 0;
        message.flags |= if corrupt {
            MessageFlags::CORRUPT
        } else {
            MessageFlags::ANY_DEFER
        };
        self.message_release(mid);
    }

    pub(crate) fn message_release(&mut self, mid: MessageId) {
        self.messages[mid].refcount -= 1;
        if self.messages[mid].refcount == 0 {
            self.message_done(mid);
        }
    }

    /// The last reference dropped: either resume reading recipients
    /// the budget now has room for, or put the queue file to rest.
    pub(crate) fn message_done(&mut self, mid: MessageId) {
        let message = &self.messages[mid];
        if message.rcpt_offset != 0
            && !message.flags.contains(MessageFlags::CORRUPT)
            && !self.draining
        {
            let limit = message.rcpt_limit - message.rcpt_count;
            if limit == 0 {
                panic!(
                    "message_done: no recipient slots available for {}",
                    message.spool_id
                );
            }
            let effect = SideEffect::Refill {
                message: mid,
                spool_id: message.spool_id,
                offset: message.rcpt_offset,
                limit,
            };
            self.messages[mid].refcount += 1;
            self.push_effect(effect);
            return;
        }

        let message = &self.messages[mid];
        let (disposition, reason) = if message.flags.contains(MessageFlags::CORRUPT) {
            (FinalDisposition::Quarantined, "corrupt")
        } else if message.flags.contains(MessageFlags::ANY_DEFER) || message.rcpt_offset != 0 {
            // Unread recipients also keep the file; deleting it here
            // would lose them.
            (FinalDisposition::Deferred, "deferred")
        } else {
            (FinalDisposition::Removed, "delivered")
        };
        let spool_id = message.spool_id;
        tracing::debug!("message {spool_id} finalized: {reason}");
        self.push_effect(SideEffect::Log(LogEvent {
            kind: RecordType::Finalized,
            queue_id: spool_id.to_string(),
            recipient: None,
            reply: None,
            destination: None,
            transport: None,
            reason: Some(reason.to_string()),
        }));
        self.push_effect(SideEffect::Finalize {
            spool_id,
            disposition,
        });
        self.message_free(mid);
    }

    fn message_free(&mut self, mid: MessageId) {
        if self.messages[mid].refcount != 0 {
            panic!(
                "message_free: reference count {}",
                self.messages[mid].refcount
            );
        }
        while let Some(jid) = self.messages[mid].jobs.head {
            self.job_free(jid);
        }
        self.messages.remove(mid);
        self.update_gauges();
    }

    pub(crate) fn message_move_limits(&mut self, mid: MessageId) {
        let mut cursor = self.messages[mid].jobs.head;
        while let Some(jid) = cursor {
            cursor = self.jobs[jid].message_links.next;
            self.job_move_limits(jid);
        }
    }

    /// Resolve, order and bundle a batch of recipients into entries.
    ///
    /// Recipients are grouped by (transport, nexthop) and packed
    /// into entries of at most the transport's per-delivery cap, so
    /// one worker transaction carries as many recipients as allowed.
    /// Unresolvable recipients are disposed of on the spot; so are
    /// recipients whose destination is currently dead.
    fn assign_batch(&mut self, mid: MessageId, recipients: Vec<Recipient>) {
        let resolver = self.resolver.clone();
        let queue_id = self.messages[mid].spool_id.to_string();

        let mut resolved = Vec::with_capacity(recipients.len());
        for rcpt in recipients {
            match resolver.resolve(&rcpt.address) {
                ResolveOutcome::Resolved(address) => resolved.push(ResolvedRcpt {
                    rcpt,
                    transport: address.transport,
                    nexthop: address.nexthop,
                }),
                ResolveOutcome::Bounce(reason) => {
                    self.bounce_recipient(mid, &queue_id, &rcpt, &reason);
                }
                ResolveOutcome::Defer(reason) => {
                    self.defer_recipient(mid, &queue_id, &rcpt.address, "", "", &reason);
                }
            }
        }

        resolved.sort_by(|a, b| {
            (a.transport.as_str(), a.nexthop.as_str())
                .cmp(&(b.transport.as_str(), b.nexthop.as_str()))
                .then_with(|| domain_of(&a.rcpt.address).cmp(domain_of(&b.rcpt.address)))
                .then_with(|| a.rcpt.address.cmp(&b.rcpt.address))
        });

        let mut current: Option<(crate::sched::EntryId, crate::sched::QueueId, JobId)> = None;
        for r in resolved {
            let tid = self.transport_obtain(&r.transport);
            let qid = self.queue_obtain(tid, &r.nexthop);
            if self.queues[qid].window == 0 {
                let reason = self.queues[qid]
                    .dead_reason
                    .clone()
                    .unwrap_or_else(|| "destination is throttled".to_string());
                let (nexthop, transport) =
                    (r.nexthop.clone(), self.transports[tid].name.clone());
                self.defer_recipient(
                    mid,
                    &queue_id,
                    &r.rcpt.address,
                    &nexthop,
                    &transport,
                    &reason,
                );
                continue;
            }

            let cap = self.transports[tid].limits.dest_recipient_limit;
            let need_new = match current {
                Some((eid, cur_qid, _)) => {
                    cur_qid != qid || (cap != 0 && self.entries[eid].rcpts.len() >= cap)
                }
                None => true,
            };
            if need_new {
                let jid = self.job_obtain(mid, tid);
                let pid = self.peer_obtain(jid, qid);
                let eid = self.entry_create(pid);
                self.jobs[jid].read_entries += 1;
                current = Some((eid, qid, jid));
            }

            let (eid, _, jid) = current.expect("entry was just ensured");
            self.entries[eid].rcpts.push(r.rcpt);
            self.jobs[jid].rcpt_count += 1;
            // Assignment stays within the message budget, so the
            // slot backing this recipient is already accounted for.
            self.jobs[jid].rcpt_limit = self.jobs[jid].rcpt_limit.max(self.jobs[jid].rcpt_count);
            self.messages[mid].rcpt_count += 1;
            self.recipient_count += 1;
        }

        // This message may have jobs the batch never touched, whose
        // candidate caches are now stale.
        let mut cursor = self.messages[mid].jobs.head;
        while let Some(jid) = cursor {
            cursor = self.jobs[jid].message_links.next;
            let job = &self.jobs[jid];
            let tid = job.transport;
            if job.selected_entries < job.read_entries
                && job.blocker_tag != self.transports[tid].blocker_tag
            {
                self.transports[tid].candidate_cache_current = false;
            }
        }
    }

    /// Permanent failure discovered before any worker saw the
    /// recipient: log the bounce and mark the recipient complete so
    /// it never runs again.
    pub(crate) fn bounce_recipient(
        &mut self,
        mid: MessageId,
        queue_id: &str,
        rcpt: &Recipient,
        reason: &str,
    ) {
        let spool_id = self.messages[mid].spool_id;
        self.push_effect(SideEffect::MarkDone {
            spool_id,
            offset: rcpt.offset,
        });
        self.push_effect(SideEffect::Log(LogEvent {
            kind: RecordType::Bounce,
            queue_id: queue_id.to_string(),
            recipient: Some(rcpt.address.clone()),
            reply: None,
            destination: None,
            transport: None,
            reason: Some(reason.to_string()),
        }));
    }

    /// Transient failure discovered before dispatch: log it and
    /// leave the recipient in the queue file for a later sweep.
    pub(crate) fn defer_recipient(
        &mut self,
        mid: MessageId,
        queue_id: &str,
        address: &str,
        nexthop: &str,
        transport: &str,
        reason: &str,
    ) {
        self.messages[mid].flags |= MessageFlags::ANY_DEFER;
        self.push_effect(SideEffect::Log(LogEvent {
            kind: RecordType::Defer,
            queue_id: queue_id.to_string(),
            recipient: Some(address.to_string()),
            reply: None,
            destination: (!nexthop.is_empty()).then(|| nexthop.to_string()),
            transport: (!transport.is_empty()).then(|| transport.to_string()),
            reason: Some(reason.to_string()),
        }));
    }
}

fn domain_of(address: &str) -> &str {
    address
        .rsplit_once('@')
        .map(|(_, domain)| domain)
        .unwrap_or("")
}
