#![cfg(test)]
use super::*;
use crate::config::FerrydConfig;
use crate::dispatch::{DeliveryReport, RecipientDisposition, Reply, SiteVerdict};
use crate::resolve::RuleResolver;
use envelope::Recipient;
use std::time::Duration;

fn config(tweak: impl FnOnce(&mut FerrydConfig)) -> Arc<FerrydConfig> {
    let mut cfg = FerrydConfig::default();
    tweak(&mut cfg);
    Arc::new(cfg)
}

fn scheduler(cfg: Arc<FerrydConfig>) -> Scheduler {
    Scheduler::new(cfg, Arc::new(RuleResolver::new("testhost")))
}

fn recipients(addrs: &[&str]) -> Vec<Recipient> {
    addrs
        .iter()
        .enumerate()
        .map(|(i, address)| Recipient {
            address: address.to_string(),
            offset: 100 + 10 * i as u64,
        })
        .collect()
}

/// Admit a fully-read message.
fn admit(s: &mut Scheduler, addrs: &[&str]) -> (SpoolId, Option<MessageId>) {
    admit_partial(s, addrs, 0)
}

/// Admit a message whose queue file has more recipients waiting at
/// `rcpt_offset` (0 means fully read).
fn admit_partial(
    s: &mut Scheduler,
    addrs: &[&str],
    rcpt_offset: u64,
) -> (SpoolId, Option<MessageId>) {
    let budget = s.admission_budget();
    let spool_id = SpoolId::new();
    let mid = s.admit(
        spool_id,
        AdmitBatch {
            arrival: 1_700_000_000,
            sender: "from@origin.example".to_string(),
            recipients: recipients(addrs),
            rcpt_offset,
            budget,
        },
    );
    (spool_id, mid)
}

/// Select the next entry and simulate the dispatcher taking it.
fn select_dispatched(s: &mut Scheduler) -> Option<EntryId> {
    let (eid, request) = s.next_delivery()?;
    assert!(!request.recipients.is_empty());
    let token = s.next_token();
    s.note_dispatched(eid, token);
    Some(eid)
}

fn report_for(s: &Scheduler, eid: EntryId, disposition: RecipientDisposition) -> DeliveryReport {
    DeliveryReport {
        dispositions: vec![disposition; s.entries[eid].rcpts.len()],
        verdict: None,
    }
}

/// Complete a dispatched entry with the given report.
fn complete(s: &mut Scheduler, eid: EntryId, report: DeliveryReport) {
    let token = s.entries[eid].stream.expect("entry was dispatched");
    s.complete(crate::dispatch::Completion { token, report });
}

fn complete_ok(s: &mut Scheduler, eid: EntryId) {
    let report = report_for(s, eid, RecipientDisposition::Delivered);
    complete(s, eid, report);
}

fn complete_defer(s: &mut Scheduler, eid: EntryId) {
    let report = report_for(
        s,
        eid,
        RecipientDisposition::Defer(Reply::new(451, "try later")),
    );
    complete(s, eid, report);
}

fn queue_by_name<'a>(s: &'a Scheduler, transport: &str, nexthop: &str) -> Option<&'a DestQueue> {
    let tid = *s.transport_by_name.get(transport)?;
    let qid = *s.transports[tid].queue_by_name.get(nexthop)?;
    s.queues.get(qid)
}

fn the_job(s: &Scheduler, mid: MessageId) -> JobId {
    let jid = s.messages[mid].jobs.head.expect("message has a job");
    assert!(
        s.jobs[jid].message_links.next.is_none(),
        "message has more than one job"
    );
    jid
}

/// The cross-entity invariants must hold after every top-level
/// scheduler step; the core checks them itself in debug builds, and
/// the scenarios below re-check at interesting points.
fn check_invariants(s: &Scheduler) {
    s.verify_model();
}

fn drain_effects(s: &mut Scheduler) -> Vec<SideEffect> {
    s.take_effects()
}

fn count_logs(effects: &[SideEffect], kind: RecordType) -> usize {
    effects
        .iter()
        .filter(|e| matches!(e, SideEffect::Log(ev) if ev.kind == kind))
        .count()
}

fn final_disposition(effects: &[SideEffect]) -> Option<FinalDisposition> {
    effects.iter().find_map(|e| match e {
        SideEffect::Finalize { disposition, .. } => Some(*disposition),
        _ => None,
    })
}

#[test]
fn single_recipient_round_trip() {
    // One message, one recipient, one transport, one destination,
    // all windows 1.
    let mut s = scheduler(config(|c| {
        c.dest_concurrency_limit = 1;
        c.process_limit = 1;
    }));
    let (_spool, mid) = admit(&mut s, &["r@dest.example"]);
    let mid = mid.unwrap();
    check_invariants(&s);
    assert_eq!(s.entries.len(), 1);
    drain_effects(&mut s);

    let eid = select_dispatched(&mut s).unwrap();
    {
        let queue = queue_by_name(&s, "smtp", "dest.example").unwrap();
        assert_eq!(queue.busy_refcount, 1);
        assert_eq!(queue.todo_refcount, 0);
    }
    check_invariants(&s);

    // The window is full and there is nothing else; no second
    // delivery may be selected.
    assert!(s.next_delivery().is_none());

    complete_ok(&mut s, eid);
    let effects = drain_effects(&mut s);
    assert_eq!(count_logs(&effects, RecordType::Delivery), 1);
    assert_eq!(count_logs(&effects, RecordType::Finalized), 1);
    assert_eq!(final_disposition(&effects), Some(FinalDisposition::Removed));
    assert!(effects
        .iter()
        .any(|e| matches!(e, SideEffect::MarkDone { offset: 100, .. })));

    // Everything was recycled.
    assert!(!s.messages.contains(mid));
    assert_eq!(s.messages.len(), 0);
    assert_eq!(s.entries.len(), 0);
    assert_eq!(s.queues.len(), 0);
    assert_eq!(s.jobs.len(), 0);
    assert_eq!(s.peers.len(), 0);
    assert_eq!(s.recipient_count, 0);
    check_invariants(&s);
}

#[test]
fn create_then_done_restores_every_counter() {
    // Law: creating N entries and retiring them all returns every
    // counter to its pre-create value.
    let mut s = scheduler(config(|c| {
        c.dest_recipient_limit = 2;
    }));
    let (_spool, mid) = admit(
        &mut s,
        &[
            "a@one.example",
            "b@one.example",
            "c@one.example",
            "d@two.example",
        ],
    );
    let mid = mid.unwrap();
    assert_eq!(s.entries.len(), 3); // 2+1 to one.example, 1 to two.example
    assert_eq!(s.recipient_count, 4);
    check_invariants(&s);
    drain_effects(&mut s);

    let tid = *s.transport_by_name.get("smtp").unwrap();
    s.defer_transport(tid, "operator hold");

    let effects = drain_effects(&mut s);
    assert_eq!(count_logs(&effects, RecordType::Defer), 4);
    assert_eq!(
        final_disposition(&effects),
        Some(FinalDisposition::Deferred)
    );
    assert!(!s.messages.contains(mid));
    assert_eq!(s.recipient_count, 0);
    assert_eq!(s.entries.len(), 0);
    assert_eq!(s.queues.len(), 0);
    assert_eq!(s.jobs.len(), 0);
    assert_eq!(s.peers.len(), 0);
    check_invariants(&s);
}

#[test]
fn unselect_restores_list_order() {
    // Law: unselect(select(p)) restores the lists in order.
    let mut s = scheduler(config(|c| {
        c.dest_recipient_limit = 1;
    }));
    let (_spool, mid) = admit(&mut s, &["a@dest.example", "b@dest.example"]);
    let mid = mid.unwrap();
    let jid = the_job(&s, mid);
    let pid = s.jobs[jid].peers.head.unwrap();

    let todo_before: Vec<EntryId> = collect_list(&s, "smtp", "dest.example");
    let peer_before = collect_peer(&s, pid);
    let selected_before = s.jobs[jid].selected_entries;
    assert_eq!(todo_before.len(), 2);

    let eid = s.entry_select(pid).unwrap();
    assert_eq!(eid, todo_before[0]);
    assert_eq!(s.jobs[jid].selected_entries, selected_before + 1);

    s.entry_unselect(eid);
    assert_eq!(collect_list(&s, "smtp", "dest.example"), todo_before);
    assert_eq!(collect_peer(&s, pid), peer_before);
    assert_eq!(s.jobs[jid].selected_entries, selected_before);
    check_invariants(&s);
}

fn collect_list(s: &Scheduler, transport: &str, nexthop: &str) -> Vec<EntryId> {
    let queue = queue_by_name(s, transport, nexthop).unwrap();
    let mut out = vec![];
    let mut cursor = queue.todo.head;
    while let Some(eid) = cursor {
        out.push(eid);
        cursor = s.entries[eid].queue_links.next;
    }
    out
}

fn collect_peer(s: &Scheduler, pid: PeerId) -> Vec<EntryId> {
    let mut out = vec![];
    let mut cursor = s.peers[pid].entries.head;
    while let Some(eid) = cursor {
        out.push(eid);
        cursor = s.entries[eid].peer_links.next;
    }
    out
}

#[test]
fn todo_done_counts_as_selected() {
    // The source increments selected_entries when a todo entry is
    // consumed without delivery; with that, a job that has consumed
    // all its entries always shows selected == read.
    let mut s = scheduler(config(|c| {
        c.dest_recipient_limit = 1;
    }));
    let (_spool, mid) = admit(&mut s, &["a@dest.example", "b@dest.example"]);
    let mid = mid.unwrap();
    let jid = the_job(&s, mid);
    assert_eq!(s.jobs[jid].read_entries, 2);

    // Consume one by delivery, one from the todo side.
    let eid = select_dispatched(&mut s).unwrap();
    let read = s.jobs[jid].read_entries;
    let tid = *s.transport_by_name.get("smtp").unwrap();
    let qid = *s.transports[tid].queue_by_name.get("dest.example").unwrap();
    s.defer_todo(qid, "shedding");
    assert_eq!(s.jobs[jid].selected_entries, read);

    complete_ok(&mut s, eid);
    check_invariants(&s);
}

#[test]
fn slot_borrowing_raises_the_next_job() {
    // A (1 rcpt) and B (many rcpts, only 9 slots left) to the same
    // destination; when A completes, its unused slot moves to B.
    let mut s = scheduler(config(|c| {
        c.recipient_limit = 10;
        c.dest_recipient_limit = 10;
        c.dest_concurrency_limit = 1;
    }));
    let (_a_spool, a_mid) = admit(&mut s, &["a@dest.example"]);
    let a_mid = a_mid.unwrap();
    assert_eq!(s.admission_budget(), 9);

    let b_addrs: Vec<String> = (0..9).map(|i| format!("b{i}@dest.example")).collect();
    let b_refs: Vec<&str> = b_addrs.iter().map(|a| a.as_str()).collect();
    let (_b_spool, b_mid) = admit_partial(&mut s, &b_refs, 4096);
    let b_mid = b_mid.unwrap();

    let b_jid = the_job(&s, b_mid);
    assert!(s.jobs[b_jid].rcpt_limit <= 9);
    assert_eq!(s.messages[b_mid].rcpt_limit, 9);
    check_invariants(&s);
    drain_effects(&mut s);

    // A's job was admitted first and wins the round-robin.
    let eid = select_dispatched(&mut s).unwrap();
    assert_eq!(s.entries[eid].message, a_mid);

    complete_ok(&mut s, eid);
    assert_eq!(s.jobs[b_jid].rcpt_limit, 10);
    assert_eq!(s.messages[b_mid].rcpt_limit, 10);
    check_invariants(&s);

    // B drains its in-core batch, then asks for a refill sized by
    // the raised limit.
    let eid = select_dispatched(&mut s).unwrap();
    assert_eq!(s.entries[eid].message, b_mid);
    complete_ok(&mut s, eid);
    let effects = drain_effects(&mut s);
    let refill = effects
        .iter()
        .find_map(|e| match e {
            SideEffect::Refill {
                message,
                offset,
                limit,
                ..
            } => Some((*message, *offset, *limit)),
            _ => None,
        })
        .expect("B wants a refill");
    assert_eq!(refill, (b_mid, 4096, 10));
    check_invariants(&s);
}

#[test]
fn donations_pass_over_finished_messages() {
    // Three co-resident messages; the two finished ones donate to
    // the one that still has unread recipients.
    let mut s = scheduler(config(|c| {
        c.recipient_limit = 10;
        c.dest_recipient_limit = 10;
        c.dest_concurrency_limit = 5;
    }));
    let (_sa, a_mid) = admit(&mut s, &["a@x.example"]);
    let (_sb, b_mid) = admit(&mut s, &["b@y.example"]);
    let (a_mid, b_mid) = (a_mid.unwrap(), b_mid.unwrap());
    let (_sc, c_mid) = admit_partial(&mut s, &["c0@z.example", "c1@z.example"], 2048);
    let c_mid = c_mid.unwrap();
    let c_jid = the_job(&s, c_mid);
    let base_limit = s.jobs[c_jid].rcpt_limit;

    // Complete B first, then A; each donation lands on C.
    for target in [b_mid, a_mid] {
        let eid = loop {
            let eid = select_dispatched(&mut s).expect("something selectable");
            if s.entries[eid].message == target {
                break eid;
            }
            // Not the one we want this round; put it back.
            let token = s.entries[eid].stream.take().unwrap();
            s.dispatched.remove(&token);
            s.transports[s.queues[s.entries[eid].queue].transport].inflight -= 1;
            s.entry_unselect(eid);
        };
        complete_ok(&mut s, eid);
    }

    assert_eq!(s.jobs[c_jid].rcpt_limit, base_limit + 2);
    assert_eq!(s.messages[c_mid].rcpt_limit, base_limit + 2);
    check_invariants(&s);
}

#[test]
fn throttled_destination_stays_allocated_until_retry() {
    // Destination declared dead while another entry is still in
    // flight; the queue survives its own draining.
    let mut s = scheduler(config(|c| {
        c.dest_concurrency_limit = 2;
        c.dest_recipient_limit = 1;
        c.minimal_backoff = Duration::from_millis(10);
    }));
    let (_spool, _mid) = admit(&mut s, &["a@dead.example", "b@dead.example"]);
    let first = select_dispatched(&mut s).unwrap();
    let second = select_dispatched(&mut s).unwrap();

    // First worker reports a site-wide failure.
    complete(
        &mut s,
        first,
        DeliveryReport {
            dispositions: vec![RecipientDisposition::Defer(Reply::new(
                421,
                "service not available",
            ))],
            verdict: Some(SiteVerdict::Dead("connection refused".to_string())),
        },
    );
    {
        let queue = queue_by_name(&s, "smtp", "dead.example").unwrap();
        assert_eq!(queue.window, 0);
        assert_eq!(queue.busy_refcount, 1);
        assert_eq!(
            queue.dead_reason.as_deref(),
            Some("connection refused")
        );
    }
    assert!(s.next_delivery().is_none());
    check_invariants(&s);

    // The in-flight entry still completes normally; the queue stays
    // allocated, dead, with its retry pending.
    complete_defer(&mut s, second);
    let effects = drain_effects(&mut s);
    assert_eq!(
        final_disposition(&effects),
        Some(FinalDisposition::Deferred)
    );
    let queue = queue_by_name(&s, "smtp", "dead.example").unwrap();
    assert_eq!(queue.window, 0);
    assert_eq!(queue.todo_refcount + queue.busy_refcount, 0);
    assert!(s
        .retry
        .contains(&("smtp".to_string(), "dead.example".to_string())));

    // Once the back-off deadline fires the queue revives, finds
    // itself empty, and is discarded.
    std::thread::sleep(Duration::from_millis(30));
    s.service_retries();
    assert!(queue_by_name(&s, "smtp", "dead.example").is_none());
    assert_eq!(s.queues.len(), 0);
    check_invariants(&s);
}

#[test]
fn delivery_on_dead_queue_revives_it() {
    // A success from an entry dispatched before the throttle lifts
    // the throttle rather than waiting out the back-off.
    let mut s = scheduler(config(|c| {
        c.dest_concurrency_limit = 2;
        c.dest_recipient_limit = 1;
    }));
    let (_spool, _mid) = admit(
        &mut s,
        &["a@flaky.example", "b@flaky.example", "c@flaky.example"],
    );
    let first = select_dispatched(&mut s).unwrap();
    let second = select_dispatched(&mut s).unwrap();

    complete(
        &mut s,
        first,
        DeliveryReport {
            dispositions: vec![RecipientDisposition::Defer(Reply::new(421, "later"))],
            verdict: Some(SiteVerdict::Dead("first connection refused".to_string())),
        },
    );
    assert_eq!(queue_by_name(&s, "smtp", "flaky.example").unwrap().window, 0);
    assert!(s.next_delivery().is_none());

    complete_ok(&mut s, second);
    let queue = queue_by_name(&s, "smtp", "flaky.example").unwrap();
    assert_eq!(queue.window, 2);
    assert!(!s
        .retry
        .contains(&("smtp".to_string(), "flaky.example".to_string())));

    // And the third recipient is selectable again.
    assert!(select_dispatched(&mut s).is_some());
    check_invariants(&s);
}

#[test]
fn retry_deadline_unblocks_pending_todo() {
    // A destination that waits out its back-off with a todo backlog
    // must be rescanned at a fresh epoch; the deadline-driven
    // revival bumps the tag just like a completion does.
    let mut s = scheduler(config(|c| {
        c.dest_concurrency_limit = 1;
        c.dest_recipient_limit = 1;
        c.minimal_backoff = Duration::from_millis(10);
    }));
    let (_spool, _mid) = admit(&mut s, &["a@stall.example", "b@stall.example"]);
    let first = select_dispatched(&mut s).unwrap();
    complete(
        &mut s,
        first,
        DeliveryReport {
            dispositions: vec![RecipientDisposition::Defer(Reply::new(421, "busy"))],
            verdict: Some(SiteVerdict::Dead("greeting failure".to_string())),
        },
    );

    // Scanning while the queue is dead stamps it at the current
    // epoch and leaves nothing selectable.
    let tid = *s.transport_by_name.get("smtp").unwrap();
    assert!(s.next_delivery().is_none());
    let tag_before = s.transports[tid].blocker_tag;
    assert_eq!(
        queue_by_name(&s, "smtp", "stall.example").unwrap().blocker_tag,
        tag_before
    );

    std::thread::sleep(Duration::from_millis(30));
    s.service_retries();

    // The revival advanced the epoch and unmarked the queue, so the
    // pending entry is selectable again instead of being skipped as
    // known-blocked forever.
    assert_eq!(s.transports[tid].blocker_tag, tag_before + 2);
    assert_eq!(
        queue_by_name(&s, "smtp", "stall.example").unwrap().blocker_tag,
        0
    );
    let eid = select_dispatched(&mut s).unwrap();
    complete_ok(&mut s, eid);
    assert_eq!(s.messages.len(), 0);
    check_invariants(&s);
}

#[test]
fn blocked_queue_is_skipped_until_tag_bump() {
    // A job whose only destination is saturated gets its queue
    // stamped; scans skip it at the stamped tag until a completion
    // on that destination bumps the epoch.
    let mut s = scheduler(config(|c| {
        c.dest_concurrency_limit = 1;
        c.dest_recipient_limit = 1;
    }));
    let (_s1, m1) = admit(&mut s, &["a@blocked.example", "b@blocked.example"]);
    let (_s2, _m2) = admit(&mut s, &["c@free.example"]);
    let (_s3, _m3) = admit(&mut s, &["d@open.example"]);
    let m1 = m1.unwrap();

    let tid = *s.transport_by_name.get("smtp").unwrap();
    let tag_before = s.transports[tid].blocker_tag;

    // First selection takes J1's first entry and fills the window.
    let j1_first = select_dispatched(&mut s).unwrap();
    assert_eq!(s.entries[j1_first].message, m1);

    // The rest of the round-robin: J2 and J3 deliver, J1's second
    // entry is pinned behind the full window and its queue gets
    // stamped.
    let other_a = select_dispatched(&mut s).unwrap();
    let other_b = select_dispatched(&mut s).unwrap();
    assert!(s.next_delivery().is_none());
    {
        let queue = queue_by_name(&s, "smtp", "blocked.example").unwrap();
        assert_eq!(queue.blocker_tag, tag_before);
        assert!(s.transports[tid].candidate_cache_current);
    }

    // Unrelated completions do not bump the epoch.
    complete_ok(&mut s, other_a);
    complete_ok(&mut s, other_b);
    assert_eq!(s.transports[tid].blocker_tag, tag_before);

    // A completion on the blocked queue does, unmarking it.
    complete_ok(&mut s, j1_first);
    let tag_after = s.transports[tid].blocker_tag;
    assert_eq!(tag_after, tag_before + 2);
    assert_eq!(tag_after % 2, 1);
    assert_eq!(
        queue_by_name(&s, "smtp", "blocked.example").unwrap().blocker_tag,
        0
    );

    // And the next scan revisits J1.
    let eid = select_dispatched(&mut s).unwrap();
    assert_eq!(s.entries[eid].message, m1);
    complete_ok(&mut s, eid);
    assert_eq!(s.messages.len(), 0);
    check_invariants(&s);
}

#[test]
fn streaming_reads_follow_the_budget() {
    // A message bigger than its budget is read in waves, each wave
    // sized by the current limit, until the envelope is exhausted.
    let mut s = scheduler(config(|c| {
        c.recipient_limit = 2;
        c.dest_recipient_limit = 2;
    }));
    let (_spool, mid) = admit_partial(&mut s, &["r0@big.example", "r1@big.example"], 1000);
    let mid = mid.unwrap();
    drain_effects(&mut s);

    let eid = select_dispatched(&mut s).unwrap();
    complete_ok(&mut s, eid);
    let effects = drain_effects(&mut s);
    let (message, offset, limit) = effects
        .iter()
        .find_map(|e| match e {
            SideEffect::Refill {
                message,
                offset,
                limit,
                ..
            } => Some((*message, *offset, *limit)),
            _ => None,
        })
        .expect("partial message wants a refill");
    assert_eq!((message, offset), (mid, 1000));
    assert!(limit >= 2);

    // The loop reads the next wave and the message keeps going.
    s.refill_apply(
        mid,
        RefillBatch {
            recipients: recipients(&["r2@big.example", "r3@big.example"]),
            rcpt_offset: 0,
        },
    );
    check_invariants(&s);
    let eid = select_dispatched(&mut s).unwrap();
    complete_ok(&mut s, eid);
    let effects = drain_effects(&mut s);
    assert_eq!(final_disposition(&effects), Some(FinalDisposition::Removed));
    assert_eq!(s.messages.len(), 0);
    check_invariants(&s);
}

#[test]
fn refill_failure_defers_the_message() {
    let mut s = scheduler(config(|c| {
        c.recipient_limit = 1;
    }));
    let (_spool, mid) = admit_partial(&mut s, &["r@host.example"], 700);
    let mid = mid.unwrap();
    let eid = select_dispatched(&mut s).unwrap();
    complete_ok(&mut s, eid);
    drain_effects(&mut s);

    s.refill_failed(mid, false);
    let effects = drain_effects(&mut s);
    assert_eq!(
        final_disposition(&effects),
        Some(FinalDisposition::Deferred)
    );
    assert_eq!(s.messages.len(), 0);
    check_invariants(&s);
}

#[test]
fn zero_recipient_pool_admits_nothing() {
    let s = scheduler(config(|c| {
        c.recipient_limit = 0;
    }));
    assert_eq!(s.admission_budget(), 0);
    assert!(!s.can_admit());
}

#[test]
#[should_panic(expected = "entry is on the Busy list")]
fn done_with_mismatched_list_is_fail_stop() {
    // done(Todo) on a busy entry aborts.
    let mut s = scheduler(config(|_| {}));
    let (_spool, mid) = admit(&mut s, &["r@dest.example"]);
    let mid = mid.unwrap();
    let jid = the_job(&s, mid);
    let pid = s.jobs[jid].peers.head.unwrap();
    let eid = s.entry_select(pid).unwrap();
    s.entry_done(eid, Placement::Todo);
}

#[test]
#[should_panic(expected = "entry has an open stream")]
fn done_with_open_stream_is_fail_stop() {
    let mut s = scheduler(config(|_| {}));
    let (_spool, _mid) = admit(&mut s, &["r@dest.example"]);
    let eid = select_dispatched(&mut s).unwrap();
    s.entry_done(eid, Placement::Busy);
}

#[test]
#[should_panic(expected = "dead queue")]
fn creating_an_entry_on_a_dead_queue_is_fail_stop() {
    let mut s = scheduler(config(|_| {}));
    let (_spool, mid) = admit(&mut s, &["r@dead.example"]);
    let mid = mid.unwrap();
    let jid = the_job(&s, mid);
    let pid = s.jobs[jid].peers.head.unwrap();
    let qid = s.peers[pid].queue;
    s.queue_throttle(qid, "site failure".to_string());
    s.entry_create(pid);
}

#[test]
fn recipients_to_dead_destinations_defer_at_assignment() {
    let mut s = scheduler(config(|c| {
        c.dest_recipient_limit = 1;
    }));
    let (_s1, m1) = admit(&mut s, &["a@down.example"]);
    let _m1 = m1.unwrap();
    let tid = *s.transport_by_name.get("smtp").unwrap();
    let qid = *s.transports[tid].queue_by_name.get("down.example").unwrap();
    s.queue_throttle(qid, "refused".to_string());
    drain_effects(&mut s);

    // A second message to the same destination cannot place entries
    // there while the queue is dead.
    let (_s2, m2) = admit(&mut s, &["b@down.example", "c@up.example"]);
    let m2 = m2.unwrap();
    let effects = drain_effects(&mut s);
    assert_eq!(count_logs(&effects, RecordType::Defer), 1);
    assert_eq!(s.messages[m2].rcpt_count, 1);
    assert!(s.messages[m2]
        .flags
        .contains(MessageFlags::ANY_DEFER));
    check_invariants(&s);
}

#[test]
fn bad_addresses_bounce_at_assignment() {
    let mut s = scheduler(config(|_| {}));
    let (_spool, mid) = admit(&mut s, &["-dash@evil.example", "ok@good.example"]);
    let mid = mid.unwrap();
    let effects = drain_effects(&mut s);
    assert_eq!(count_logs(&effects, RecordType::Bounce), 1);
    assert!(effects
        .iter()
        .any(|e| matches!(e, SideEffect::MarkDone { offset: 100, .. })));
    assert_eq!(s.messages[mid].rcpt_count, 1);
    check_invariants(&s);
}

#[test]
fn multi_transport_message_builds_one_job_per_transport() {
    let mut s = scheduler(config(|_| {}));
    let (_spool, mid) = admit(&mut s, &["remote@far.example", "localuser"]);
    let mid = mid.unwrap();

    let mut transports = vec![];
    let mut cursor = s.messages[mid].jobs.head;
    while let Some(jid) = cursor {
        transports.push(s.transports[s.jobs[jid].transport].name.clone());
        cursor = s.jobs[jid].message_links.next;
    }
    transports.sort();
    assert_eq!(transports, vec!["local", "smtp"]);
    check_invariants(&s);

    let first = select_dispatched(&mut s).unwrap();
    let second = select_dispatched(&mut s).unwrap();
    complete_ok(&mut s, first);
    check_invariants(&s);
    complete_ok(&mut s, second);
    let effects = drain_effects(&mut s);
    assert_eq!(final_disposition(&effects), Some(FinalDisposition::Removed));
    assert_eq!(s.jobs.len(), 0);
    check_invariants(&s);
}

#[test]
fn short_worker_report_defers_the_tail() {
    // Worker crash semantics: unacknowledged recipients defer.
    let mut s = scheduler(config(|_| {}));
    let (_spool, _mid) = admit(&mut s, &["a@host.example", "b@host.example"]);
    let eid = select_dispatched(&mut s).unwrap();
    complete(
        &mut s,
        eid,
        DeliveryReport {
            dispositions: vec![RecipientDisposition::Delivered],
            verdict: None,
        },
    );
    let effects = drain_effects(&mut s);
    assert_eq!(count_logs(&effects, RecordType::Delivery), 1);
    assert_eq!(count_logs(&effects, RecordType::Defer), 1);
    assert_eq!(
        final_disposition(&effects),
        Some(FinalDisposition::Deferred)
    );
    check_invariants(&s);
}

#[test]
fn evicting_a_dead_queue_cancels_its_retry_deadline() {
    // When the in-core queue bound forces a drained dead queue out,
    // destruction wins over the pending unthrottle deadline.
    let mut s = scheduler(config(|c| {
        c.recipient_limit = 1;
        c.dest_concurrency_limit = 1;
    }));
    for i in 0..3 {
        let addr = format!("r@site{i}.example");
        let (_spool, _mid) = admit(&mut s, &[addr.as_str()]);
        let eid = select_dispatched(&mut s).unwrap();
        complete(
            &mut s,
            eid,
            DeliveryReport {
                dispositions: vec![RecipientDisposition::Defer(Reply::new(421, "down"))],
                verdict: Some(SiteVerdict::Dead("timed out".to_string())),
            },
        );
        drain_effects(&mut s);
    }

    // With recipient_limit 1 the eviction threshold is two in-core
    // queues; the third done pushed us over and evicted its own
    // queue, cancelling the deadline it had scheduled.
    assert_eq!(s.queues.len(), 2);
    assert!(queue_by_name(&s, "smtp", "site2.example").is_none());
    assert!(!s
        .retry
        .contains(&("smtp".to_string(), "site2.example".to_string())));
    for i in 0..2 {
        assert!(s
            .retry
            .contains(&("smtp".to_string(), format!("site{i}.example"))));
    }
    check_invariants(&s);
}

#[test]
fn backoff_doubles_per_consecutive_throttle() {
    let mut s = scheduler(config(|c| {
        c.minimal_backoff = Duration::from_millis(20);
        c.maximal_backoff = Duration::from_millis(50);
        c.dest_recipient_limit = 1;
    }));
    let (_spool, _mid) = admit(
        &mut s,
        &["a@slow.example", "b@slow.example", "c@slow.example"],
    );
    let tid = *s.transport_by_name.get("smtp").unwrap();
    let qid = *s.transports[tid].queue_by_name.get("slow.example").unwrap();

    s.queue_throttle(qid, "one".to_string());
    assert_eq!(s.queues[qid].backoff, Duration::from_millis(20));
    s.queue_unthrottle(qid, false);
    s.queue_throttle(qid, "two".to_string());
    assert_eq!(s.queues[qid].backoff, Duration::from_millis(40));
    s.queue_unthrottle(qid, false);
    s.queue_throttle(qid, "three".to_string());
    // Capped at the maximum.
    assert_eq!(s.queues[qid].backoff, Duration::from_millis(50));

    // A successful delivery resets the ladder.
    s.queue_unthrottle(qid, true);
    s.queue_throttle(qid, "four".to_string());
    assert_eq!(s.queues[qid].backoff, Duration::from_millis(20));
    check_invariants(&s);
}

#[test]
fn draining_finalizes_instead_of_refilling() {
    let mut s = scheduler(config(|c| {
        c.recipient_limit = 1;
    }));
    let (_spool, _mid) = admit_partial(&mut s, &["r@host.example"], 900);
    s.drain_mode();

    let tid = *s.transport_by_name.get("smtp").unwrap();
    s.defer_transport(tid, "scheduler shutdown");
    let effects = drain_effects(&mut s);
    assert!(effects
        .iter()
        .all(|e| !matches!(e, SideEffect::Refill { .. })));
    assert_eq!(
        final_disposition(&effects),
        Some(FinalDisposition::Deferred)
    );
    assert_eq!(s.messages.len(), 0);
    check_invariants(&s);
}

#[test]
fn transport_process_limit_caps_inflight_deliveries() {
    let mut s = scheduler(config(|c| {
        c.process_limit = 2;
        c.dest_concurrency_limit = 10;
        c.dest_recipient_limit = 1;
    }));
    let (_spool, _mid) = admit(
        &mut s,
        &["a@one.example", "b@two.example", "c@three.example"],
    );
    let first = select_dispatched(&mut s).unwrap();
    let _second = select_dispatched(&mut s).unwrap();
    assert!(s.next_delivery().is_none(), "process limit reached");

    complete_ok(&mut s, first);
    assert!(select_dispatched(&mut s).is_some());
    check_invariants(&s);
}
