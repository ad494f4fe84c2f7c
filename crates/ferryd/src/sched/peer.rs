//! A peer is the (message, destination-queue) junction: it groups
//! the todo entries of one message bound for one destination, and
//! links them into the owning job's round-robin.

use crate::sched::arena::{list_append, list_unlink, Links, ListHead};
use crate::sched::{EntryId, JobId, PeerId, QueueId, Scheduler};

pub struct Peer {
    pub job: JobId,
    pub queue: QueueId,
    pub entries: ListHead<EntryId>,
    /// Entries owned (todo and selected alike); the peer dies when
    /// the last of them is done.
    pub refcount: usize,
    pub job_links: Links<PeerId>,
}

impl Scheduler {
    pub(crate) fn peer_find(&self, jid: JobId, qid: QueueId) -> Option<PeerId> {
        let mut cursor = self.jobs[jid].peers.head;
        while let Some(pid) = cursor {
            if self.peers[pid].queue == qid {
                return Some(pid);
            }
            cursor = self.peers[pid].job_links.next;
        }
        None
    }

    pub(crate) fn peer_create(&mut self, jid: JobId, qid: QueueId) -> PeerId {
        let pid = self.peers.insert(Peer {
            job: jid,
            queue: qid,
            entries: ListHead::default(),
            refcount: 0,
            job_links: Links::default(),
        });
        list_append!(self.peers, self.jobs[jid].peers, pid, job_links);
        if self.jobs[jid].peer_current.is_none() {
            self.jobs[jid].peer_current = Some(pid);
        }
        pid
    }

    pub(crate) fn peer_obtain(&mut self, jid: JobId, qid: QueueId) -> PeerId {
        match self.peer_find(jid, qid) {
            Some(pid) => pid,
            None => self.peer_create(jid, qid),
        }
    }

    pub(crate) fn peer_free(&mut self, pid: PeerId) {
        let peer = &self.peers[pid];
        if peer.refcount != 0 {
            panic!("peer_free: refcount {}", peer.refcount);
        }
        if !peer.entries.is_empty() {
            panic!("peer_free: entry list not empty");
        }
        let jid = peer.job;
        if self.jobs[jid].peer_current == Some(pid) {
            self.jobs[jid].peer_current = self.peers[pid].job_links.next;
        }
        list_unlink!(self.peers, self.jobs[jid].peers, pid, job_links);
        if self.jobs[jid].peer_current.is_none() {
            self.jobs[jid].peer_current = self.jobs[jid].peers.head;
        }
        self.peers.remove(pid);
    }
}
