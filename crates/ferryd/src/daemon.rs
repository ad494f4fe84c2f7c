//! The event loop wrapping the scheduler core: it owns every file
//! handle and collaborator, feeds events into the core, and executes
//! the side effects the core hands back. The core itself never
//! blocks; this loop is the only place that awaits.

use crate::config::FerrydConfig;
use crate::dispatch::{Completion, DeliveryAgent};
use crate::disposition::{DispositionLog, LogDisposition, RecordType};
use crate::ingest::{read_batch, ReadOutcome};
use crate::resolve::RecipientResolver;
use crate::sched::{AdmitBatch, RefillBatch, Scheduler, SideEffect};
use spool::{FinalDisposition, QueueFile, SpoolHandle, SpoolId};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;

/// Upper bound on one select! sleep; retries re-arm it precisely.
const IDLE_WAIT: Duration = Duration::from_secs(3600);

pub struct Daemon {
    cfg: Arc<FerrydConfig>,
    core: Scheduler,
    spool: SpoolHandle,
    agent: Arc<dyn DeliveryAgent>,
    log: Arc<DispositionLog>,
    completions: UnboundedReceiver<Completion>,
    /// Open queue files, one per resident message; dropped when the
    /// message finalizes.
    files: HashMap<SpoolId, QueueFile>,
}

impl Daemon {
    pub fn new(
        cfg: Arc<FerrydConfig>,
        resolver: Arc<dyn RecipientResolver>,
        spool: SpoolHandle,
        agent: Arc<dyn DeliveryAgent>,
        log: Arc<DispositionLog>,
        completions: UnboundedReceiver<Completion>,
    ) -> Self {
        Self {
            core: Scheduler::new(cfg.clone(), resolver),
            cfg,
            spool,
            agent,
            log,
            completions,
            files: HashMap::new(),
        }
    }

    pub async fn run(mut self) -> anyhow::Result<()> {
        tracing::info!("scheduler starting, spool at {}", self.cfg.spool_path.display());
        self.sweep_deferred().await;
        self.sweep_active().await;
        self.turn().await?;

        let mut sweep = tokio::time::interval(self.cfg.sweep_interval);
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        sweep.reset();

        loop {
            let retry_hint = self.core.service_retries();
            self.turn().await?;

            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("shutdown requested");
                    break;
                }
                completion = self.completions.recv() => {
                    match completion {
                        Some(completion) => self.core.complete(completion),
                        None => {
                            tracing::error!("completion channel closed, stopping");
                            break;
                        }
                    }
                }
                _ = tokio::time::sleep(retry_hint.unwrap_or(IDLE_WAIT)) => {}
                _ = sweep.tick() => {
                    self.sweep_deferred().await;
                    self.sweep_active().await;
                }
            }
        }

        // Shed the pending backlog so every undispatched queue file
        // reaches the deferred area with a clean log trail. Entries
        // already at workers are abandoned; their files stay in the
        // active area and the next start rediscovers them.
        self.core.drain_mode();
        let transports = self.core.transport_order.clone();
        for tid in transports {
            self.core.defer_transport(tid, "scheduler shutdown");
        }
        self.run_effects().await?;

        tracing::info!(
            "stopped with {} messages resident, {} deliveries in flight",
            self.core.message_count(),
            self.core.inflight_count()
        );
        Ok(())
    }

    /// One run-to-completion turn: execute pending side effects and
    /// dispatch everything the caps allow, until both settle.
    async fn turn(&mut self) -> anyhow::Result<()> {
        loop {
            self.run_effects().await?;
            let mut dispatched = false;
            while let Some((eid, request)) = self.core.next_delivery() {
                let token = self.core.next_token();
                tracing::trace!(
                    "dispatching {}/{} ({} rcpts) as {token}",
                    request.transport,
                    request.nexthop,
                    request.recipients.len()
                );
                match self.agent.dispatch(token, request) {
                    Ok(()) => {
                        self.core.note_dispatched(eid, token);
                        dispatched = true;
                    }
                    Err(err) => {
                        // No worker saw the entry; put it back where
                        // it came from and stop trying for now.
                        tracing::error!("dispatch failed: {err:#}");
                        self.core.entry_unselect(eid);
                        return Ok(());
                    }
                }
            }
            if !dispatched {
                return Ok(());
            }
        }
    }

    async fn run_effects(&mut self) -> anyhow::Result<()> {
        loop {
            let effects = self.core.take_effects();
            if effects.is_empty() {
                return Ok(());
            }
            for effect in effects {
                match effect {
                    SideEffect::MarkDone { spool_id, offset } => {
                        match self.files.get_mut(&spool_id) {
                            Some(file) => {
                                if let Err(err) = file.mark_done(offset) {
                                    tracing::error!(
                                        "failed to mark {spool_id} offset {offset} done: {err:#}"
                                    );
                                }
                            }
                            None => tracing::error!(
                                "mark_done for {spool_id} but its file is not open"
                            ),
                        }
                    }
                    SideEffect::Log(event) => event.emit(&self.log),
                    SideEffect::Finalize {
                        spool_id,
                        disposition,
                    } => {
                        self.files.remove(&spool_id);
                        let result = match disposition {
                            FinalDisposition::Removed => self.spool.remove(spool_id).await,
                            FinalDisposition::Deferred => self.spool.defer(spool_id).await,
                            FinalDisposition::Quarantined => {
                                self.spool.quarantine(spool_id).await
                            }
                        };
                        if let Err(err) = result {
                            tracing::error!("failed to finalize {spool_id}: {err:#}");
                        }
                    }
                    SideEffect::Refill {
                        message,
                        spool_id,
                        offset,
                        limit,
                    } => {
                        let outcome = match self.files.get_mut(&spool_id) {
                            Some(file) => read_batch(file, offset, limit),
                            None => Err(anyhow::anyhow!("file for {spool_id} is not open")),
                        };
                        match outcome {
                            Ok(ReadOutcome::Batch(harvest)) => self.core.refill_apply(
                                message,
                                RefillBatch {
                                    recipients: harvest.recipients,
                                    rcpt_offset: harvest.rcpt_offset,
                                },
                            ),
                            Ok(ReadOutcome::Corrupt(reason)) => {
                                tracing::warn!("{spool_id} became corrupt: {reason}");
                                self.core.refill_failed(message, true);
                            }
                            Err(err) => {
                                tracing::warn!("refill read for {spool_id} failed: {err:#}");
                                self.core.refill_failed(message, false);
                            }
                        }
                    }
                }
            }
        }
    }

    /// Move deferred queue files back into the active area so the
    /// active sweep can pick them up for another round.
    async fn sweep_deferred(&mut self) {
        let (tx, rx) = flume::bounded(128);
        let spool = self.spool.clone();
        let walker =
            tokio::task::spawn_blocking(move || spool.enumerate_deferred(tx));
        while let Ok(entry) = rx.recv_async().await {
            if let Err(err) = self.spool.admit_deferred(entry.id).await {
                tracing::warn!("failed to re-admit deferred {}: {err:#}", entry.id);
            }
        }
        match walker.await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => tracing::warn!("deferred sweep failed: {err:#}"),
            Err(err) => tracing::error!("deferred sweep panicked: {err:#}"),
        }
    }

    /// Scan the active area and admit queue files while the message
    /// and recipient caps allow.
    async fn sweep_active(&mut self) {
        let (tx, rx) = flume::bounded(128);
        let spool = self.spool.clone();
        let walker = tokio::task::spawn_blocking(move || spool.enumerate(tx));
        let mut admitted = 0usize;
        while let Ok(entry) = rx.recv_async().await {
            if self.files.contains_key(&entry.id) {
                continue;
            }
            if !self.core.can_admit() {
                tracing::debug!("admission caps reached, sweep will resume later");
                break;
            }
            if self.admit_one(entry.id).await {
                admitted += 1;
            }
        }
        drop(rx);
        match walker.await {
            Ok(Ok(())) => {}
            // The walker reports a send error when we stop early.
            Ok(Err(err)) => tracing::debug!("active sweep ended: {err:#}"),
            Err(err) => tracing::error!("active sweep panicked: {err:#}"),
        }
        if admitted > 0 {
            tracing::info!("admitted {admitted} queue files");
        }
        if let Err(err) = self.turn().await {
            tracing::error!("post-sweep turn failed: {err:#}");
        }
    }

    async fn admit_one(&mut self, id: SpoolId) -> bool {
        let mut file = match self.spool.open(id).await {
            Ok(file) => file,
            Err(err) => {
                tracing::warn!("failed to open {id}: {err:#}");
                return false;
            }
        };
        let budget = self.core.admission_budget();
        match read_batch(&mut file, 0, budget) {
            Ok(ReadOutcome::Batch(harvest)) => {
                self.files.insert(id, file);
                self.core.admit(
                    id,
                    AdmitBatch {
                        arrival: harvest.arrival.unwrap_or_default(),
                        sender: harvest.sender.unwrap_or_default(),
                        recipients: harvest.recipients,
                        rcpt_offset: harvest.rcpt_offset,
                        budget,
                    },
                );
                true
            }
            Ok(ReadOutcome::Corrupt(reason)) => {
                tracing::warn!("quarantining corrupt queue file {id}: {reason}");
                drop(file);
                self.log.log(LogDisposition {
                    kind: RecordType::Finalized,
                    queue_id: &id.to_string(),
                    recipient: None,
                    reply: None,
                    destination: None,
                    transport: None,
                    reason: Some(&format!("corrupt: {reason}")),
                });
                if let Err(err) = self.spool.quarantine(id).await {
                    tracing::error!("failed to quarantine {id}: {err:#}");
                }
                false
            }
            Err(err) => {
                tracing::warn!("failed to read {id}, leaving for the next sweep: {err:#}");
                false
            }
        }
    }
}
