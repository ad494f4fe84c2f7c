//! A job is the (message, transport) junction. It owns the
//! recipient-slot accounting for one message's deliveries over one
//! transport, a round-robin over its peers, and a position in the
//! transport's job list.

use crate::sched::arena::{list_append, list_unlink, Links, ListHead};
use crate::sched::{EntryId, JobId, MessageId, PeerId, Scheduler, TransportId};

pub struct Job {
    pub message: MessageId,
    pub transport: TransportId,
    /// In-core recipients across this job's entries.
    pub rcpt_count: usize,
    /// Slots this job may hold: its share of the message budget plus
    /// anything borrowed from finished sibling jobs.
    pub rcpt_limit: usize,
    /// Entries created for this job so far.
    pub read_entries: usize,
    /// Entries consumed: selected for delivery, or retired unsent
    /// from the todo side.
    pub selected_entries: usize,
    /// Non-negative while the job sits on the transport's job list;
    /// negative once retired from scanning.
    pub stack_level: i32,
    /// Stamp matching the transport's blocker tag while every one of
    /// this job's destinations is blocked.
    pub blocker_tag: u64,
    pub peers: ListHead<PeerId>,
    pub peer_current: Option<PeerId>,
    pub message_links: Links<JobId>,
    pub transport_links: Links<JobId>,
}

impl Scheduler {
    pub(crate) fn job_find(&self, mid: MessageId, tid: TransportId) -> Option<JobId> {
        let mut cursor = self.messages[mid].jobs.head;
        while let Some(jid) = cursor {
            if self.jobs[jid].transport == tid {
                return Some(jid);
            }
            cursor = self.jobs[jid].message_links.next;
        }
        None
    }

    /// Find or create the job binding `mid` to `tid`. A new job
    /// starts with no recipient slots; assignment grows its limit as
    /// recipients arrive, within the message budget.
    pub(crate) fn job_obtain(&mut self, mid: MessageId, tid: TransportId) -> JobId {
        if let Some(jid) = self.job_find(mid, tid) {
            return jid;
        }
        let jid = self.jobs.insert(Job {
            message: mid,
            transport: tid,
            rcpt_count: 0,
            rcpt_limit: 0,
            read_entries: 0,
            selected_entries: 0,
            stack_level: 0,
            blocker_tag: 0,
            peers: ListHead::default(),
            peer_current: None,
            message_links: Links::default(),
            transport_links: Links::default(),
        });
        list_append!(self.jobs, self.messages[mid].jobs, jid, message_links);
        list_append!(self.jobs, self.transports[tid].job_list, jid, transport_links);
        let transport = &mut self.transports[tid];
        if transport.job_current.is_none() {
            transport.job_current = Some(jid);
        }
        transport.candidate_cache_current = false;
        jid
    }

    /// Take a finished job out of the transport's scan rotation.
    /// It stays on the message's job list so the slot-borrowing
    /// protocol can still see (and drain) it.
    pub(crate) fn job_retire(&mut self, jid: JobId) {
        let tid = self.jobs[jid].transport;
        debug_assert!(self.jobs[jid].stack_level >= 0, "job already retired");
        self.transport_unlink_job(tid, jid);
        self.jobs[jid].stack_level = -1;
    }

    pub(crate) fn job_free(&mut self, jid: JobId) {
        let job = &self.jobs[jid];
        if job.rcpt_count != 0 {
            panic!("job_free: rcpt_count {}", job.rcpt_count);
        }
        if !job.peers.is_empty() {
            panic!("job_free: peer list not empty");
        }
        let mid = job.message;
        let tid = job.transport;
        if job.stack_level >= 0 {
            self.transport_unlink_job(tid, jid);
        }
        list_unlink!(self.jobs, self.messages[mid].jobs, jid, message_links);
        self.jobs.remove(jid);
    }

    /// Unlink from the transport job list, stepping any cursor that
    /// points at the departing job.
    fn transport_unlink_job(&mut self, tid: TransportId, jid: JobId) {
        let next = self.jobs[jid].transport_links.next;
        let transport = &mut self.transports[tid];
        if transport.job_current == Some(jid) {
            transport.job_current = next;
        }
        if transport.next_unread == Some(jid) {
            transport.next_unread = next;
        }
        list_unlink!(self.jobs, self.transports[tid].job_list, jid, transport_links);
        let transport = &mut self.transports[tid];
        if transport.job_current.is_none() {
            transport.job_current = transport.job_list.head;
        }
    }

    /// Redistribute unused recipient slots between co-resident
    /// messages.
    ///
    /// When this job is retired, or its message has been read to the
    /// end, whatever slots it holds beyond its in-core recipients
    /// are moved to the transport's next job whose message still has
    /// unread recipients, raising both that job's and that message's
    /// budget. With no taker the slots lapse back to the global
    /// pool. A job whose message still has unread recipients may
    /// instead be awarded fresh slots from the global pool, capped
    /// at one entry's worth of read-ahead.
    pub(crate) fn job_move_limits(&mut self, jid: JobId) {
        let mid = self.jobs[jid].message;
        let tid = self.jobs[jid].transport;

        let next = self.find_next_unread(tid, jid);
        self.transports[tid].next_unread = next;

        let job = &self.jobs[jid];
        let message = &self.messages[mid];
        let unused = (job.rcpt_limit - job.rcpt_count)
            .min(message.rcpt_limit - message.rcpt_count);

        if unused > 0 && (message.rcpt_offset == 0 || job.stack_level < 0) {
            self.jobs[jid].rcpt_limit -= unused;
            self.messages[mid].rcpt_limit -= unused;
            if let Some(nj) = next {
                let nmid = self.jobs[nj].message;
                self.jobs[nj].rcpt_limit += unused;
                self.messages[nmid].rcpt_limit += unused;
                tracing::trace!("job_move_limits: moved {unused} slots to {nj:?}");
            }
        }

        let message = &self.messages[mid];
        if message.rcpt_offset != 0 {
            let headroom = self
                .cfg
                .recipient_limit
                .saturating_sub(self.recipient_count);
            let already = message.rcpt_limit - message.rcpt_count;
            let per_entry = self.transports[tid].limits.dest_recipient_limit;
            let award = headroom.min(per_entry.saturating_sub(already));
            if award > 0 {
                self.messages[mid].rcpt_limit += award;
                self.jobs[jid].rcpt_limit += award;
            }
        }
    }

    /// The transport's donation cursor: the next job after `skip`
    /// whose message still has unread recipients, wrapping once
    /// around the job list.
    fn find_next_unread(&self, tid: TransportId, skip: JobId) -> Option<JobId> {
        let start = self.transports[tid]
            .next_unread
            .or(self.transports[tid].job_list.head)?;
        let mut jid = start;
        loop {
            if jid != skip && self.messages[self.jobs[jid].message].rcpt_offset != 0 {
                return Some(jid);
            }
            jid = self.jobs[jid]
                .transport_links
                .next
                .or(self.transports[tid].job_list.head)?;
            if jid == start {
                return None;
            }
        }
    }

    /// Round-robin over this job's peers for a destination that can
    /// accept another delivery. Destinations that cannot are stamped
    /// with the transport's blocker tag so later scans in this epoch
    /// skip them without re-checking.
    pub(crate) fn job_entry_select(&mut self, jid: JobId) -> Option<EntryId> {
        let tid = self.jobs[jid].transport;
        let tag = self.transports[tid].blocker_tag;
        let start = self.jobs[jid].peer_current.or(self.jobs[jid].peers.head)?;
        let mut pid = start;
        loop {
            let next = self.peers[pid]
                .job_links
                .next
                .or(self.jobs[jid].peers.head)
                .expect("peer list is non-empty");
            if !self.peers[pid].entries.is_empty() {
                let qid = self.peers[pid].queue;
                let queue = &self.queues[qid];
                if queue.blocker_tag == tag {
                    // Known-blocked this epoch.
                } else if queue.window == 0 || queue.busy_refcount >= queue.window {
                    self.queues[qid].blocker_tag = tag;
                } else {
                    let eid = self
                        .entry_select(pid)
                        .expect("peer has a pending entry");
                    self.jobs[jid].peer_current = Some(next);
                    return Some(eid);
                }
            }
            if next == start {
                return None;
            }
            pid = next;
        }
    }
}
