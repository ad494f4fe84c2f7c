//! A transport owns the round-robin of jobs competing for its
//! worker pool, the blocker-tag epoch for its destination queues,
//! and the per-transport default limits.

use crate::config::TransportLimits;
use crate::sched::arena::ListHead;
use crate::sched::{EntryId, JobId, QueueId, Scheduler, TransportId};
use std::collections::HashMap;

pub struct Transport {
    pub name: String,
    pub limits: TransportLimits,
    /// Monotone odd epoch counter; queues and jobs stamped with the
    /// current value are skipped by scans until the next bump. Odd
    /// so that it can never match a never-stamped (zero) mark.
    pub blocker_tag: u64,
    pub job_list: ListHead<JobId>,
    pub job_current: Option<JobId>,
    /// Donation cursor: where the slot-borrowing protocol resumes
    /// its search for a job with unread recipients.
    pub next_unread: Option<JobId>,
    /// True while the last full scan is known to still hold: no
    /// entry is selectable on this transport. Cleared by every event
    /// that could change that.
    pub candidate_cache_current: bool,
    pub queue_list: ListHead<QueueId>,
    pub queue_by_name: HashMap<String, QueueId>,
    /// Entries currently dispatched across all queues; bounded by
    /// `limits.process_limit`.
    pub inflight: usize,
}

impl Scheduler {
    pub(crate) fn transport_obtain(&mut self, name: &str) -> TransportId {
        if let Some(&tid) = self.transport_by_name.get(name) {
            return tid;
        }
        let limits = self.cfg.transport_limits(name);
        let tid = self.transports.insert(Transport {
            name: name.to_string(),
            limits,
            blocker_tag: 1,
            job_list: ListHead::default(),
            job_current: None,
            next_unread: None,
            candidate_cache_current: false,
            queue_list: ListHead::default(),
            queue_by_name: HashMap::new(),
            inflight: 0,
        });
        self.transport_by_name.insert(name.to_string(), tid);
        self.transport_order.push(tid);
        tracing::debug!("created transport {name} with {limits:?}");
        tid
    }

    /// One full round-robin pass over this transport's jobs for a
    /// selectable entry. Jobs that can no longer contribute anything
    /// are retired or freed along the way. A pass that comes up
    /// empty is cached until an unblocking event invalidates it.
    pub(crate) fn transport_select(&mut self, tid: TransportId) -> Option<EntryId> {
        {
            let transport = &self.transports[tid];
            if transport.inflight >= transport.limits.process_limit {
                return None;
            }
            if transport.candidate_cache_current {
                return None;
            }
        }

        let start = self.transports[tid]
            .job_current
            .or(self.transports[tid].job_list.head);
        let mut cursor = start;
        let mut remaining = self.transports[tid].job_list.len;
        while remaining > 0 {
            remaining -= 1;
            let jid = match cursor {
                Some(jid) => jid,
                None => break,
            };
            let next = self.jobs[jid]
                .transport_links
                .next
                .or(self.transports[tid].job_list.head);

            // Scrub jobs with nothing left to offer out of the
            // rotation before considering them.
            let mid = self.jobs[jid].message;
            if self.messages[mid].rcpt_offset == 0 && !self.job_has_pending(jid) {
                if self.jobs[jid].rcpt_count == 0 {
                    self.job_free(jid);
                } else {
                    self.job_retire(jid);
                }
                if self.transports[tid].job_list.is_empty() {
                    break;
                }
                // `next` may have been the job just unlinked when it
                // was the only one; fall back to the list head.
                cursor = if next == Some(jid) {
                    self.transports[tid].job_list.head
                } else {
                    next
                };
                continue;
            }

            if self.jobs[jid].rcpt_limit > 0 {
                if let Some(eid) = self.job_entry_select(jid) {
                    self.transports[tid].job_current = next;
                    return Some(eid);
                }
                // Every destination this job wants is blocked at the
                // current epoch.
                let tag = self.transports[tid].blocker_tag;
                self.jobs[jid].blocker_tag = tag;
            }

            cursor = next;
            if cursor == start {
                break;
            }
        }

        self.transports[tid].candidate_cache_current = true;
        None
    }

    /// Whether any of the job's peers still has an entry awaiting
    /// selection.
    pub(crate) fn job_has_pending(&self, jid: JobId) -> bool {
        let mut cursor = self.jobs[jid].peers.head;
        while let Some(pid) = cursor {
            if !self.peers[pid].entries.is_empty() {
                return true;
            }
            cursor = self.peers[pid].job_links.next;
        }
        false
    }

    /// Defer the todo backlog of every destination queue on this
    /// transport. Queues, messages and the jobs between them may all
    /// disappear as a side effect.
    pub fn defer_transport(&mut self, tid: TransportId, reason: &str) {
        tracing::info!(
            "deferring all pending deliveries for transport {}: {reason}",
            self.transports[tid].name
        );
        let mut queues = Vec::new();
        let mut cursor = self.transports[tid].queue_list.head;
        while let Some(qid) = cursor {
            queues.push(qid);
            cursor = self.queues[qid].transport_links.next;
        }
        for qid in queues {
            if self.queues.contains(qid) {
                self.defer_todo(qid, reason);
            }
        }
    }
}
