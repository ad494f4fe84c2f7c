//! Entry lifecycle: create, select, unselect, done.
//!
//! An entry is one delivery unit: a slice of one message's
//! recipients bound for one destination queue. It lives on exactly
//! one of the queue's todo/busy lists, and additionally on its
//! peer's list while awaiting selection.

use crate::dispatch::DispatchToken;
use crate::sched::arena::{list_append, list_prepend, list_unlink, Links};
use crate::sched::{EntryId, MessageId, PeerId, QueueId, Scheduler};
use envelope::Recipient;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    Todo,
    Busy,
}

pub struct Entry {
    pub message: MessageId,
    pub peer: PeerId,
    pub queue: QueueId,
    pub rcpts: Vec<Recipient>,
    /// Set while a worker owns this entry; must be cleared before
    /// the entry may be retired.
    pub stream: Option<DispatchToken>,
    pub placement: Placement,
    pub queue_links: Links<EntryId>,
    pub peer_links: Links<EntryId>,
}

impl Scheduler {
    /// Create an empty entry bound to `pid`'s destination queue and
    /// append it to the peer list and the queue's todo list.
    /// Recipients are filled in by the caller (assignment), which
    /// also maintains the recipient counters.
    ///
    /// Panics when the destination queue is dead; callers check.
    pub(crate) fn entry_create(&mut self, pid: PeerId) -> EntryId {
        let peer = &self.peers[pid];
        let qid = peer.queue;
        let mid = self.jobs[peer.job].message;

        if self.queues[qid].window == 0 {
            panic!("entry_create: dead queue: {}", self.queues[qid].name);
        }

        let eid = self.entries.insert(Entry {
            message: mid,
            peer: pid,
            queue: qid,
            rcpts: Vec::new(),
            stream: None,
            placement: Placement::Todo,
            queue_links: Links::default(),
            peer_links: Links::default(),
        });

        self.messages[mid].refcount += 1;
        list_append!(self.entries, self.peers[pid].entries, eid, peer_links);
        self.peers[pid].refcount += 1;
        list_append!(self.entries, self.queues[qid].todo, eid, queue_links);
        self.queues[qid].todo_refcount += 1;
        eid
    }

    /// Pop the peer's first pending entry and move it from the
    /// queue's todo list to its busy list. The caller dispatches it
    /// and then either confirms with `note_dispatched` or backs out
    /// with `entry_unselect`.
    pub(crate) fn entry_select(&mut self, pid: PeerId) -> Option<EntryId> {
        let eid = self.peers[pid].entries.head?;
        let qid = self.entries[eid].queue;

        list_unlink!(self.entries, self.queues[qid].todo, eid, queue_links);
        self.queues[qid].todo_refcount -= 1;
        list_append!(self.entries, self.queues[qid].busy, eid, queue_links);
        self.queues[qid].busy_refcount += 1;
        list_unlink!(self.entries, self.peers[pid].entries, eid, peer_links);
        self.entries[eid].placement = Placement::Busy;
        self.jobs[self.peers[pid].job].selected_entries += 1;
        Some(eid)
    }

    /// The inverse of select, for a dispatch that failed before any
    /// worker took ownership: the entry returns to the head of both
    /// lists it came from.
    pub fn entry_unselect(&mut self, eid: EntryId) {
        let entry = &self.entries[eid];
        assert!(
            entry.stream.is_none(),
            "entry_unselect: entry has an open stream"
        );
        assert_eq!(entry.placement, Placement::Busy, "entry_unselect: not busy");
        let pid = entry.peer;
        let qid = entry.queue;

        list_unlink!(self.entries, self.queues[qid].busy, eid, queue_links);
        self.queues[qid].busy_refcount -= 1;
        list_prepend!(self.entries, self.queues[qid].todo, eid, queue_links);
        self.queues[qid].todo_refcount += 1;
        list_prepend!(self.entries, self.peers[pid].entries, eid, peer_links);
        self.entries[eid].placement = Placement::Todo;
        self.jobs[self.peers[pid].job].selected_entries -= 1;

        let tid = self.queues[qid].transport;
        self.transports[tid].candidate_cache_current = false;
    }

    /// Retire an entry, releasing its recipients' slots and
    /// recycling whatever structures drop to zero references:
    /// peer, destination queue, message.
    pub(crate) fn entry_done(&mut self, eid: EntryId, which: Placement) {
        let entry = &self.entries[eid];
        if entry.stream.is_some() {
            panic!("entry_done: entry has an open stream");
        }
        if entry.placement != which {
            panic!(
                "entry_done: entry is on the {:?} list, done({which:?}) requested",
                entry.placement
            );
        }
        let mid = entry.message;
        let pid = entry.peer;
        let qid = entry.queue;
        let jid = self.peers[pid].job;
        let tid = self.jobs[jid].transport;

        match which {
            Placement::Busy => {
                list_unlink!(self.entries, self.queues[qid].busy, eid, queue_links);
                self.queues[qid].busy_refcount -= 1;
            }
            Placement::Todo => {
                list_unlink!(self.entries, self.peers[pid].entries, eid, peer_links);
                // A todo entry consumed without delivery still counts
                // against the job's pending-selection accounting.
                self.jobs[jid].selected_entries += 1;
                list_unlink!(self.entries, self.queues[qid].todo, eid, queue_links);
                self.queues[qid].todo_refcount -= 1;
            }
        }

        let entry = self.entries.remove(eid);
        let nrcpt = entry.rcpts.len();
        self.jobs[jid].rcpt_count -= nrcpt;
        self.messages[mid].rcpt_count -= nrcpt;
        self.recipient_count -= nrcpt;

        // Let any retired or finishing sibling job that donated
        // recipient slots to this message take them back, then pass
        // this job's own unused slots along.
        let mut sponsor = self.messages[mid].jobs.head;
        while let Some(sid) = sponsor {
            sponsor = self.jobs[sid].message_links.next;
            if sid == jid || self.jobs[sid].rcpt_count >= self.jobs[sid].rcpt_limit {
                continue;
            }
            if self.jobs[sid].stack_level < 0 || self.messages[mid].rcpt_offset == 0 {
                self.job_move_limits(sid);
            }
        }
        if self.messages[mid].rcpt_offset == 0 {
            self.job_move_limits(jid);
        }

        // If this queue was blocking jobs on the transport's list,
        // restart the scan: when the concurrency limit has lifted
        // with pending deliveries remaining, and also when the queue
        // is dead. The tag bump unmarks all blockers at once, and
        // keeping the tag odd ensures it never matches queues that
        // were never stamped. The queue's own mark is cleared only
        // once the window actually has room again; a dead queue
        // stays marked, at what is now a stale epoch.
        if self.queues[qid].blocker_tag == self.transports[tid].blocker_tag {
            let queue = &self.queues[qid];
            if (queue.window > queue.busy_refcount && !queue.todo.is_empty())
                || queue.window == 0
            {
                self.transports[tid].blocker_tag += 2;
                self.transports[tid].job_current = self.transports[tid].job_list.head;
                self.transports[tid].candidate_cache_current = false;
            }
            let queue = &mut self.queues[qid];
            if queue.window > queue.busy_refcount {
                queue.blocker_tag = 0;
            }
        }

        self.peers[pid].refcount -= 1;
        if self.peers[pid].refcount == 0 {
            self.peer_free(pid);
        }

        // When the in-core queue for this site drained: a live site
        // is simply discarded; a dead site is kept so its back-off
        // state survives, unless too many dead queues have piled up,
        // in which case it is revived and discarded to bound memory.
        let queue = &self.queues[qid];
        if queue.todo.is_empty() && queue.busy.is_empty() {
            if queue.window == 0 && self.queues.len() > 2 * self.cfg.recipient_limit {
                self.queue_unthrottle(qid, false);
            }
            if self.queues[qid].window > 0 {
                self.queue_done(qid);
            }
        }

        self.messages[mid].refcount -= 1;
        if self.messages[mid].refcount == 0 {
            self.message_done(mid);
        }

        self.update_gauges();
    }

    /// Defer every recipient of an entry (without a worker having
    /// seen it) and retire it from the todo side.
    pub(crate) fn entry_defer_todo(&mut self, eid: EntryId, reason: &str) {
        let entry = &self.entries[eid];
        let mid = entry.message;
        let rcpts = entry.rcpts.clone();
        let qid = entry.queue;
        let queue_id = self.messages[mid].spool_id.to_string();
        let nexthop = self.queues[qid].name.clone();
        let transport = self.transports[self.queues[qid].transport].name.clone();

        for rcpt in &rcpts {
            self.defer_recipient(mid, &queue_id, &rcpt.address, &nexthop, &transport, reason);
        }
        self.entry_done(eid, Placement::Todo);
    }
}
