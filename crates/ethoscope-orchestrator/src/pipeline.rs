//! The pipeline: a collection cycle and a slower scoring cycle on two timers
//!
//! Each collection tick fans out to every registered collector with its own
//! deadline. Results are merged only at the join point, so a late or crashed
//! collector can never touch a batch that was already processed.

use ethoscope_collectors::{Collector, CollectorRegistry};
use ethoscope_core::delivery::{deliver, Delivery, RetryPolicy};
use ethoscope_core::{
    EthoscopeConfig, EthoscopeError, NetworkHealthScoreRecord, PipelineSettings, RawMetricRecord,
    Result,
};
use ethoscope_health::HealthScoreCalculator;
use ethoscope_metrics::{
    MetricProcessor, MetricSink, PipelineTelemetry, ProcessOutcome, TelemetryEvent,
};
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::{self, JoinError, JoinSet};
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, error, info, instrument, warn, Span};
use uuid::Uuid;

use crate::events::{EventSink, PipelineEvent};

/// What happened to one collector in one cycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CollectorOutcome {
    Collected { records: usize, duration_ms: u64 },
    /// Denied by an open circuit; same as no data
    CircuitOpen { retry_in_ms: u64 },
    TimedOut { timeout_ms: u64 },
    Crashed { reason: String },
    /// Still running when the shutdown grace period ran out
    Abandoned,
}

impl CollectorOutcome {
    fn telemetry(&self) -> TelemetryEvent {
        match self {
            Self::Collected {
                records,
                duration_ms,
            } => TelemetryEvent::Collected {
                records: *records,
                duration_ms: *duration_ms,
            },
            Self::CircuitOpen { .. } => TelemetryEvent::CircuitRejected,
            Self::TimedOut { timeout_ms } => TelemetryEvent::TimedOut {
                timeout_ms: *timeout_ms,
            },
            Self::Crashed { reason } => TelemetryEvent::Crashed {
                reason: reason.clone(),
            },
            Self::Abandoned => TelemetryEvent::Crashed {
                reason: "abandoned at shutdown".to_string(),
            },
        }
    }
}

/// Result of one collection cycle
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectionReport {
    pub cycle_id: Uuid,
    pub outcomes: BTreeMap<String, CollectorOutcome>,
    pub processed: ProcessOutcome,
    /// Records acknowledged by the storage sink
    pub persisted: usize,
    /// Batches the sink rejected after all retries
    pub persist_failures: usize,
}

impl CollectionReport {
    /// Processed records attributed to a collector, including its `<id>/<endpoint>` sources
    pub fn records_from(&self, collector_id: &str) -> usize {
        let prefix = format!("{}/", collector_id);
        self.processed
            .batches
            .values()
            .flat_map(|b| &b.records)
            .filter(|r| r.source_id == collector_id || r.source_id.starts_with(&prefix))
            .count()
    }
}

type Collected = (CollectorOutcome, Vec<RawMetricRecord>);
type Joined = (String, CollectorOutcome, Vec<RawMetricRecord>);

/// Storage target name for health score records
const HEALTH_SCORE_TARGET: &str = "health_score";

pub struct Pipeline {
    registry: CollectorRegistry,
    processor: MetricProcessor,
    calculator: HealthScoreCalculator,
    sink: Arc<dyn MetricSink>,
    events: Arc<dyn EventSink>,
    settings: PipelineSettings,
    telemetry: Arc<PipelineTelemetry>,
    /// Consecutive failed persists per storage target
    persist_streaks: Mutex<HashMap<String, u32>>,
    shutdown: watch::Sender<bool>,
}

impl Pipeline {
    /// Build a pipeline; the configuration is validated first and a bad one
    /// refuses to start
    pub fn new(
        config: &EthoscopeConfig,
        registry: CollectorRegistry,
        sink: Arc<dyn MetricSink>,
        events: Arc<dyn EventSink>,
    ) -> Result<Self> {
        config.validate()?;
        let (shutdown, _) = watch::channel(false);

        Ok(Self {
            registry,
            processor: MetricProcessor::new()?,
            calculator: HealthScoreCalculator::new(Arc::clone(&sink), &config.scoring),
            sink,
            events,
            settings: config.pipeline.clone(),
            telemetry: Arc::new(PipelineTelemetry::new()),
            persist_streaks: Mutex::new(HashMap::new()),
            shutdown,
        })
    }

    pub fn registry(&self) -> &CollectorRegistry {
        &self.registry
    }

    pub fn telemetry(&self) -> Arc<PipelineTelemetry> {
        Arc::clone(&self.telemetry)
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Begin graceful shutdown: timers stop, in-flight collectors get the grace period
    pub fn stop(&self) {
        if !self.shutdown.send_replace(true) {
            info!("Pipeline shutdown requested");
        }
    }

    /// Run every collector once, process the merged records and persist them
    #[instrument(skip(self), fields(cycle_id = tracing::field::Empty))]
    pub async fn run_collection_cycle(&self) -> Result<CollectionReport> {
        if self.is_shutting_down() {
            return Err(EthoscopeError::Pipeline(
                "shutting down, no new collection cycle".to_string(),
            ));
        }

        let cycle_id = Uuid::new_v4();
        Span::current().record("cycle_id", tracing::field::display(cycle_id));

        let joined = self.fan_out().await;

        let mut outcomes = BTreeMap::new();
        let mut records = Vec::new();
        for (id, outcome, collected) in joined {
            self.telemetry.record(&id, outcome.telemetry()).await;
            records.extend(collected);
            outcomes.insert(id, outcome);
        }

        let processed = self.processor.process(&records);
        self.telemetry
            .record_collection_cycle(processed.record_count(), processed.dropped.len());

        let mut persisted = 0;
        let mut persist_failures = 0;
        for batch in processed.batches.values() {
            let target = batch.metric_kind.to_string();
            let delivery = deliver(
                &format!("persist {}", target),
                RetryPolicy::persist(&self.settings),
                || self.sink.persist(batch),
            )
            .await;
            self.note_persist(&target, &delivery);
            match delivery.value() {
                Some(written) => persisted += written,
                None => persist_failures += 1,
            }
        }

        info!(
            collectors = outcomes.len(),
            raw = records.len(),
            processed = processed.record_count(),
            dropped = processed.dropped.len(),
            persisted,
            "Collection cycle complete"
        );

        Ok(CollectionReport {
            cycle_id,
            outcomes,
            processed,
            persisted,
            persist_failures,
        })
    }

    /// Invoke all collectors concurrently and join them
    ///
    /// Every collector runs under its own deadline. If shutdown begins while
    /// collectors are in flight they get the grace period, then are aborted.
    async fn fan_out(&self) -> Vec<Joined> {
        let deadline = Duration::from_secs(self.settings.collector_timeout_secs);
        let mut tasks = JoinSet::new();
        let mut running: HashMap<task::Id, String> = HashMap::new();

        for collector in self.registry.iter() {
            let id = collector.id().to_string();
            let handle = tasks.spawn(collect_one(Arc::clone(collector), deadline));
            running.insert(handle.id(), id);
        }

        let mut joined = Vec::with_capacity(running.len());
        let mut shutdown = self.shutdown.subscribe();

        let finished = loop {
            tokio::select! {
                next = tasks.join_next_with_id() => match next {
                    Some(result) => joined.extend(settle(&mut running, result)),
                    None => break true,
                },
                _ = stopped(&mut shutdown) => break false,
            }
        };

        if !finished {
            let grace = tokio::time::sleep(Duration::from_secs(self.settings.shutdown_grace_secs));
            tokio::pin!(grace);
            loop {
                tokio::select! {
                    next = tasks.join_next_with_id() => match next {
                        Some(result) => joined.extend(settle(&mut running, result)),
                        None => break,
                    },
                    _ = &mut grace => {
                        warn!(abandoned = tasks.len(), "Grace period over, abandoning collectors");
                        tasks.abort_all();
                        break;
                    }
                }
            }
        }

        for id in running.into_values() {
            joined.push((id, CollectorOutcome::Abandoned, Vec::new()));
        }
        joined
    }

    /// Score the network, persist the record and publish it with its anomalies
    ///
    /// A calculator error skips the cycle entirely; nothing is persisted or published.
    #[instrument(skip(self), fields(cycle_id = tracing::field::Empty))]
    pub async fn run_scoring_cycle(&self) -> Result<NetworkHealthScoreRecord> {
        if self.is_shutting_down() {
            return Err(EthoscopeError::Pipeline(
                "shutting down, no new scoring cycle".to_string(),
            ));
        }

        let cycle_id = Uuid::new_v4();
        Span::current().record("cycle_id", tracing::field::display(cycle_id));

        let purged: usize = self.registry.iter().map(|c| c.purge_caches()).sum();
        if purged > 0 {
            debug!(purged, "Dropped expired cache entries");
        }

        let record = match self.calculator.calculate().await {
            Ok(record) => record,
            Err(e) => {
                self.telemetry.record_scoring_failure();
                error!(%cycle_id, "Scoring cycle skipped: {}", e);
                return Err(e);
            }
        };

        let stored = deliver(
            "persist health_score",
            RetryPolicy::persist(&self.settings),
            || self.sink.persist_health(&record),
        )
        .await;
        self.note_persist(HEALTH_SCORE_TARGET, &stored);

        // Publishing is best effort, one attempt per event
        deliver("publish health_score", RetryPolicy::once(), || {
            self.events
                .publish(PipelineEvent::HealthScore(record.clone()))
        })
        .await;
        for flag in &record.anomalies {
            deliver("publish anomaly", RetryPolicy::once(), || {
                self.events.publish(PipelineEvent::Anomaly(flag.clone()))
            })
            .await;
        }

        self.telemetry.record_scoring_cycle(record.anomalies.len());
        Ok(record)
    }

    /// Drive both cycles until [`Pipeline::stop`] is called
    pub async fn run(self: Arc<Self>) -> Result<()> {
        if self.is_shutting_down() {
            return Ok(());
        }
        let mut shutdown = self.shutdown.subscribe();

        info!(
            collectors = self.registry.len(),
            collection_interval_secs = self.settings.collection_interval_secs,
            scoring_interval_secs = self.settings.scoring_interval_secs,
            "Pipeline started"
        );

        let collection = {
            let pipeline = Arc::clone(&self);
            tokio::spawn(async move { pipeline.collection_loop().await })
        };
        let scoring = {
            let pipeline = Arc::clone(&self);
            tokio::spawn(async move { pipeline.scoring_loop().await })
        };

        stopped(&mut shutdown).await;

        // Collection cycles honor the grace period themselves; this bounds the rest
        let grace = Duration::from_secs(self.settings.shutdown_grace_secs);
        for (name, handle) in [("collection", collection), ("scoring", scoring)] {
            let abort = handle.abort_handle();
            if tokio::time::timeout(grace + Duration::from_secs(1), handle)
                .await
                .is_err()
            {
                warn!(loop_name = name, "Loop did not stop within grace period, aborting");
                abort.abort();
            }
        }

        info!("Pipeline stopped");
        Ok(())
    }

    async fn collection_loop(&self) {
        let mut shutdown = self.shutdown.subscribe();
        let mut ticker = interval(Duration::from_secs(self.settings.collection_interval_secs));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                _ = stopped(&mut shutdown) => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.run_collection_cycle().await {
                        error!("Collection cycle failed: {}", e);
                    }
                }
            }
        }
        debug!("Collection loop stopped");
    }

    async fn scoring_loop(&self) {
        let mut shutdown = self.shutdown.subscribe();
        let period = Duration::from_secs(self.settings.scoring_interval_secs);
        // First score after one full period so there is history to read
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                _ = stopped(&mut shutdown) => break,
                _ = ticker.tick() => {
                    // Failures are logged inside the cycle
                    let _ = self.run_scoring_cycle().await;
                }
            }
        }
        debug!("Scoring loop stopped");
    }

    /// Track the failure streak of one storage target and alert when it gets long
    fn note_persist<T>(&self, target: &str, delivery: &Delivery<T>) {
        let mut streaks = self.persist_streaks();
        let Delivery::Failed { attempts, error } = delivery else {
            streaks.remove(target);
            return;
        };

        self.telemetry.record_persist_failure();
        let failures = streaks.entry(target.to_string()).or_insert(0);
        *failures += 1;
        if *failures >= self.settings.storage_alert_threshold {
            error!(
                alert = true,
                persist_target = target,
                consecutive_failures = *failures,
                attempts,
                %error,
                "Storage sink is failing persistently"
            );
        }
    }

    /// Consecutive persist failures for `target` (a metric kind or `health_score`)
    /// since its last success
    pub fn consecutive_persist_failures(&self, target: &str) -> u32 {
        self.persist_streaks().get(target).copied().unwrap_or(0)
    }

    fn persist_streaks(&self) -> MutexGuard<'_, HashMap<String, u32>> {
        self.persist_streaks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Resolves once shutdown has been requested
async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    loop {
        let stopping = *shutdown.borrow_and_update();
        if stopping {
            return;
        }
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

/// One collector under its deadline
///
/// Runs as its own `JoinSet` task; a panic surfaces as a `JoinError` for that task.
async fn collect_one(collector: Arc<dyn Collector>, deadline: Duration) -> Collected {
    let started = Instant::now();

    match tokio::time::timeout(deadline, collector.collect()).await {
        Ok(Ok(records)) => {
            let outcome = CollectorOutcome::Collected {
                records: records.len(),
                duration_ms: started.elapsed().as_millis() as u64,
            };
            (outcome, records)
        }
        Ok(Err(open)) => {
            debug!(collector = collector.id(), "Circuit open, no data this cycle: {}", open);
            let outcome = CollectorOutcome::CircuitOpen {
                retry_in_ms: open.retry_in.as_millis() as u64,
            };
            (outcome, Vec::new())
        }
        Err(_) => {
            warn!(
                collector = collector.id(),
                timeout_ms = deadline.as_millis() as u64,
                "Collector timed out"
            );
            let outcome = CollectorOutcome::TimedOut {
                timeout_ms: deadline.as_millis() as u64,
            };
            (outcome, Vec::new())
        }
    }
}

/// Attribute a finished task to its collector
fn settle(
    running: &mut HashMap<task::Id, String>,
    result: std::result::Result<(task::Id, Collected), JoinError>,
) -> Option<Joined> {
    match result {
        Ok((task_id, (outcome, records))) => {
            let id = running.remove(&task_id)?;
            Some((id, outcome, records))
        }
        Err(e) => {
            let id = running.remove(&e.id())?;
            let reason = if e.is_panic() {
                format!("panicked: {}", panic_message(e.into_panic()))
            } else {
                "task cancelled".to_string()
            };
            error!(collector = %id, %reason, "Collector crashed");
            Some((id, CollectorOutcome::Crashed { reason }, Vec::new()))
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        msg.to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
