//! Orchestrator: owns component lifecycles and drives
//! fetch -> enqueue -> dequeue -> process -> dispatch -> mark.
//!
//! One task per connector runs the fetch cycle on an interval; a fixed pool
//! of workers consumes the shared queue. Shutdown lets in-flight items
//! finish, closes the queue to producers, and drains whatever is buffered
//! before the workers exit.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use metrics::counter;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::{MarkPolicy, SinkFailurePolicy};
use crate::connector::Connector;
use crate::engine::{ProcessOutcome, ProcessingEngine};
use crate::error::ConnectorError;
use crate::event::DeadLetter;
use crate::queue::EventQueue;
use crate::sink::EventSink;

/// Retained dead-letter records; beyond this the oldest are dropped and
/// counted, so a permanently-bad source item cannot grow memory unbounded.
pub const DEAD_LETTER_CAP: usize = 256;

#[derive(Debug, Clone, Copy)]
pub struct OrchestratorSettings {
    pub fetch_interval: Duration,
    pub fetch_limit: usize,
    pub workers: usize,
    pub on_validation_failure: MarkPolicy,
    pub on_sink_failure: SinkFailurePolicy,
}

/// Monotonic pipeline counters, exposed over `/inspect`.
#[derive(Default)]
pub struct PipelineStats {
    pub fetched: AtomicU64,
    pub fetch_item_errors: AtomicU64,
    pub fetch_cycle_errors: AtomicU64,
    pub enqueued: AtomicU64,
    pub duplicates_skipped: AtomicU64,
    pub dispatched: AtomicU64,
    pub dispatch_failed: AtomicU64,
    pub validation_failed: AtomicU64,
    pub dead_lettered: AtomicU64,
    pub dead_letters_dropped: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub queue_depth: usize,
    pub fetched: u64,
    pub fetch_item_errors: u64,
    pub fetch_cycle_errors: u64,
    pub enqueued: u64,
    pub duplicates_skipped: u64,
    pub dispatched: u64,
    pub dispatch_failed: u64,
    pub validation_failed: u64,
    pub dead_lettered: u64,
    pub dead_letters_dropped: u64,
}

pub struct Orchestrator {
    connectors: Vec<Arc<dyn Connector>>,
    by_id: HashMap<String, Arc<dyn Connector>>,
    queue: Arc<EventQueue>,
    engine: Arc<ProcessingEngine>,
    sinks: Vec<Arc<dyn EventSink>>,
    settings: OrchestratorSettings,
    stats: Arc<PipelineStats>,
    dead_letters: Arc<Mutex<VecDeque<DeadLetter>>>,
    // Claims on (connector_id, source_id) pairs currently being processed,
    // so two workers never race the same item through dispatch.
    in_flight: Arc<Mutex<HashSet<(String, String)>>>,
    shutdown: watch::Sender<bool>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Orchestrator {
    pub fn new(
        connectors: Vec<Arc<dyn Connector>>,
        queue: Arc<EventQueue>,
        engine: Arc<ProcessingEngine>,
        sinks: Vec<Arc<dyn EventSink>>,
        settings: OrchestratorSettings,
    ) -> Self {
        let by_id = connectors
            .iter()
            .map(|c| (c.id().to_string(), c.clone()))
            .collect();
        let (shutdown, _) = watch::channel(false);
        Self {
            connectors,
            by_id,
            queue,
            engine,
            sinks,
            settings,
            stats: Arc::new(PipelineStats::default()),
            dead_letters: Arc::new(Mutex::new(VecDeque::new())),
            in_flight: Arc::new(Mutex::new(HashSet::new())),
            shutdown,
            handles: Mutex::new(Vec::new()),
        }
    }

    pub fn stats(&self) -> Arc<PipelineStats> {
        self.stats.clone()
    }

    pub fn queue(&self) -> Arc<EventQueue> {
        self.queue.clone()
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let s = &self.stats;
        StatsSnapshot {
            queue_depth: self.queue.depth(),
            fetched: s.fetched.load(Ordering::Relaxed),
            fetch_item_errors: s.fetch_item_errors.load(Ordering::Relaxed),
            fetch_cycle_errors: s.fetch_cycle_errors.load(Ordering::Relaxed),
            enqueued: s.enqueued.load(Ordering::Relaxed),
            duplicates_skipped: s.duplicates_skipped.load(Ordering::Relaxed),
            dispatched: s.dispatched.load(Ordering::Relaxed),
            dispatch_failed: s.dispatch_failed.load(Ordering::Relaxed),
            validation_failed: s.validation_failed.load(Ordering::Relaxed),
            dead_lettered: s.dead_lettered.load(Ordering::Relaxed),
            dead_letters_dropped: s.dead_letters_dropped.load(Ordering::Relaxed),
        }
    }

    /// Dead-letter records retained so far, oldest first (diagnostic
    /// surface, capped at `DEAD_LETTER_CAP`).
    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.dead_letters
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .cloned()
            .collect()
    }

    /// Connect every connector, then spawn fetch loops and the worker pool.
    /// A connector that fails auth is skipped (logged), not fatal.
    pub async fn start(&self) -> anyhow::Result<()> {
        let mut handles = Vec::new();

        for connector in &self.connectors {
            match connector.connect().await {
                Ok(()) => {
                    tracing::info!(target: "orchestrator", connector = connector.id(), "connected");
                }
                Err(e @ ConnectorError::Auth { .. }) => {
                    tracing::error!(
                        target: "orchestrator",
                        connector = connector.id(),
                        error = %e,
                        "authentication failed; connector disabled until restart"
                    );
                    continue;
                }
                Err(e) => {
                    // Transient connect failures still get a fetch loop; the
                    // health check gates each cycle.
                    tracing::warn!(
                        target: "orchestrator",
                        connector = connector.id(),
                        error = %e,
                        "connect failed, will retry via health check"
                    );
                }
            }
            handles.push(self.spawn_fetch_loop(connector.clone()));
        }

        for worker_id in 0..self.settings.workers.max(1) {
            handles.push(self.spawn_worker(worker_id));
        }

        self.handles
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .extend(handles);
        Ok(())
    }

    /// Signal shutdown, stop producers, and wait for workers to drain the
    /// queue. Idempotent.
    pub async fn stop(&self) {
        let _ = self.shutdown.send(true);
        let pending = self.queue.depth();
        if pending > 0 {
            tracing::info!(target: "orchestrator", pending, "draining queue before shutdown");
        }
        self.queue.close();

        let handles: Vec<_> = self
            .handles
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect();
        for h in handles {
            if let Err(e) = h.await {
                tracing::warn!(target: "orchestrator", error = %e, "task join failed");
            }
        }
        tracing::info!(target: "orchestrator", "shutdown complete");
    }

    fn spawn_fetch_loop(&self, connector: Arc<dyn Connector>) -> JoinHandle<()> {
        let queue = self.queue.clone();
        let stats = self.stats.clone();
        let settings = self.settings;
        let mut shutdown = self.shutdown.subscribe();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(settings.fetch_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = shutdown.changed() => break,
                }
                if *shutdown.borrow() {
                    break;
                }
                run_fetch_cycle(&*connector, &queue, &stats, settings.fetch_limit).await;
            }
            tracing::debug!(target: "orchestrator", connector = connector.id(), "fetch loop stopped");
        })
    }

    fn spawn_worker(&self, worker_id: usize) -> JoinHandle<()> {
        let queue = self.queue.clone();
        let engine = self.engine.clone();
        let sinks = self.sinks.clone();
        let by_id = self.by_id.clone();
        let stats = self.stats.clone();
        let dead_letters = self.dead_letters.clone();
        let in_flight = self.in_flight.clone();
        let settings = self.settings;

        tokio::spawn(async move {
            // `dequeue` returns None only when the queue is closed and
            // drained, so in-flight items always complete.
            while let Some(item) = queue.dequeue().await {
                // Claim the item before processing. The claim is held through
                // dispatch and marking, so a duplicate dequeued by another
                // worker either fails the claim here or sees the marker in
                // the is_processed re-check.
                let key = (item.raw.connector_id.clone(), item.raw.source_id.clone());
                let claimed = in_flight
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .insert(key.clone());
                if !claimed {
                    stats.duplicates_skipped.fetch_add(1, Ordering::Relaxed);
                    counter!("orchestrator_duplicates_skipped_total").increment(1);
                    tracing::debug!(
                        target: "orchestrator",
                        source_id = %key.1,
                        "skipping duplicate already in flight"
                    );
                    continue;
                }

                let connector = by_id.get(&item.raw.connector_id).cloned();
                process_one(
                    &item, connector, &engine, &sinks, &stats, &dead_letters, settings,
                )
                .await;

                in_flight
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .remove(&key);
            }
            tracing::debug!(target: "orchestrator", worker_id, "worker stopped");
        })
    }
}

async fn run_fetch_cycle(
    connector: &dyn Connector,
    queue: &EventQueue,
    stats: &PipelineStats,
    limit: usize,
) {
    match connector.health_check().await {
        Ok(status) if status.is_healthy() => {}
        Ok(status) => {
            tracing::warn!(
                target: "orchestrator",
                connector = connector.id(),
                ?status,
                "skipping fetch cycle, connector degraded"
            );
            return;
        }
        Err(e) => {
            tracing::error!(target: "orchestrator", connector = connector.id(), error = %e, "health check misuse");
            return;
        }
    }

    let items = match connector.fetch_events(limit).await {
        Ok(items) => items,
        Err(e) => {
            // A failed cycle is logged and skipped, never fatal.
            stats.fetch_cycle_errors.fetch_add(1, Ordering::Relaxed);
            counter!("orchestrator_fetch_cycle_errors_total").increment(1);
            tracing::warn!(target: "orchestrator", connector = connector.id(), error = %e, "fetch cycle failed");
            return;
        }
    };

    for item in items {
        match item {
            Ok(raw) => {
                stats.fetched.fetch_add(1, Ordering::Relaxed);
                // Awaiting enqueue is the backpressure path: a burst fetch
                // slows down here instead of overflowing the queue.
                match queue.enqueue(raw).await {
                    Ok(_) => {
                        stats.enqueued.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(e) => {
                        tracing::info!(target: "orchestrator", error = %e, "enqueue rejected, stopping cycle");
                        return;
                    }
                }
            }
            Err(item_err) => {
                stats.fetch_item_errors.fetch_add(1, Ordering::Relaxed);
                counter!("orchestrator_fetch_item_errors_total").increment(1);
                tracing::warn!(
                    target: "orchestrator",
                    connector = connector.id(),
                    source_id = ?item_err.source_id,
                    reason = %item_err.reason,
                    "fetch item error"
                );
            }
        }
    }
}

async fn process_one(
    item: &crate::event::QueuedEvent,
    connector: Option<Arc<dyn Connector>>,
    engine: &ProcessingEngine,
    sinks: &[Arc<dyn EventSink>],
    stats: &PipelineStats,
    dead_letters: &Mutex<VecDeque<DeadLetter>>,
    settings: OrchestratorSettings,
) {
    let source_id = item.raw.source_id.clone();

    // Defensive re-check: the queue may hold stale duplicates of an item a
    // previous cycle already handled.
    if let Some(c) = &connector {
        match c.is_processed(&source_id).await {
            Ok(true) => {
                stats.duplicates_skipped.fetch_add(1, Ordering::Relaxed);
                counter!("orchestrator_duplicates_skipped_total").increment(1);
                tracing::debug!(target: "orchestrator", %source_id, "skipping already-processed duplicate");
                return;
            }
            Ok(false) => {}
            Err(e) => {
                tracing::warn!(target: "orchestrator", %source_id, error = %e, "is_processed check failed, continuing");
            }
        }
    }

    match engine.process(item).await {
        ProcessOutcome::Validated(event) if event.is_valid() => {
            let mut acked = 0usize;
            for sink in sinks {
                match sink.dispatch(&event).await {
                    Ok(()) => acked += 1,
                    Err(e) => {
                        stats.dispatch_failed.fetch_add(1, Ordering::Relaxed);
                        tracing::warn!(
                            target: "orchestrator",
                            sink = sink.name(),
                            %source_id,
                            error = %e,
                            "sink dispatch failed"
                        );
                    }
                }
            }

            let all_acked = acked == sinks.len();
            if all_acked {
                stats.dispatched.fetch_add(1, Ordering::Relaxed);
                counter!("orchestrator_dispatched_total").increment(1);
            }

            let should_mark =
                all_acked || settings.on_sink_failure == SinkFailurePolicy::MarkAnyway;
            if should_mark {
                mark(connector.as_deref(), &source_id).await;
            }
        }
        ProcessOutcome::Validated(event) => {
            // Validation failure: diagnosable dead letter, never a crash.
            stats.validation_failed.fetch_add(1, Ordering::Relaxed);
            let record = DeadLetter {
                source_id: event.source_id.clone(),
                connector_id: event.connector_id.clone(),
                stage: crate::event::FailureStage::Validate,
                reason: event.validation_errors.join("; "),
                occurred_at: event.processed_at,
            };
            push_dead_letter(dead_letters, stats, record);

            if settings.on_validation_failure == MarkPolicy::MarkWithErrors {
                mark(connector.as_deref(), &source_id).await;
            }
        }
        ProcessOutcome::Rejected(record) => {
            // Terminal failure before validation: no marker, so the item
            // stays eligible for a manual re-run.
            push_dead_letter(dead_letters, stats, record);
        }
    }
}

fn push_dead_letter(
    dead_letters: &Mutex<VecDeque<DeadLetter>>,
    stats: &PipelineStats,
    record: DeadLetter,
) {
    stats.dead_lettered.fetch_add(1, Ordering::Relaxed);
    counter!("orchestrator_dead_lettered_total").increment(1);
    tracing::info!(
        target: "orchestrator",
        source_id = %record.source_id,
        stage = ?record.stage,
        reason = %record.reason,
        "dead-lettered"
    );
    let mut letters = dead_letters.lock().unwrap_or_else(|e| e.into_inner());
    if letters.len() == DEAD_LETTER_CAP {
        letters.pop_front();
        stats.dead_letters_dropped.fetch_add(1, Ordering::Relaxed);
        counter!("orchestrator_dead_letters_dropped_total").increment(1);
    }
    letters.push_back(record);
}

async fn mark(connector: Option<&dyn Connector>, source_id: &str) {
    let Some(c) = connector else {
        tracing::warn!(target: "orchestrator", %source_id, "no connector to mark against");
        return;
    };
    if let Err(e) = c.mark_processed(source_id).await {
        // The item will be fetched and processed again; the defensive
        // is_processed check cannot help here, so this is the one path where
        // duplicate dispatch is possible. Loud log.
        tracing::error!(target: "orchestrator", %source_id, error = %e, "mark_processed failed");
    }
}
