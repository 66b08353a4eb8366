//! Pipeline wiring: builds every stage from [`AppConfig`], runs them as
//! tokio tasks and tears them down in order.
//!
//! Shutdown order: sources stop producing, then the sweep, then the
//! admission queue is closed and drained through the workers and the sink
//! flushes its last batch. Only then are adapters disconnected (each gets
//! `shutdown_grace`). Samples still in the overflow store stay there for
//! the next start.

pub mod runner;
pub mod worker;

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use anyhow::{Context, Result};
use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::AppConfig;
use crate::detect::factory::DetectorFactory;
use crate::detect::DetectorRegistry;
use crate::error::PipelineError;
use crate::health::{HealthInputs, HealthReport, SourceState};
use crate::ingest::{sweep, Admitted, IngestionStage, SubmitOutcome};
use crate::metrics::PipelineMetrics;
use crate::sink::bus::MessageBus;
use crate::sink::memory::{self, SharedMemory};
use crate::sink::{EventSink, SinkSettings};
use crate::sources::factory::{connect_policy, SourceFactory};
use crate::sources::push::PushHandle;
use crate::sources::{BoxedSource, ConnectPolicy, MetricSample};
use crate::storage::dead_letter::DeadLetterStore;
use crate::storage::outbox::OutboxStore;
use crate::storage::overflow::OverflowStore;
use crate::storage::{self, Pool};
use crate::window::WindowStore;
use runner::SourceRunner;

/// First pipeline-fatal error, shared between the component that hit it and
/// whoever is waiting on the pipeline.
#[derive(Clone, Default)]
pub(crate) struct FatalSignal {
    token: CancellationToken,
    error: Arc<Mutex<Option<PipelineError>>>,
}

impl FatalSignal {
    pub(crate) fn trigger(&self, e: PipelineError) {
        if let Ok(mut slot) = self.error.lock() {
            if slot.is_none() {
                error!(error = %e, "pipeline-fatal error");
                *slot = Some(e);
            }
        }
        self.token.cancel();
    }

    fn take(&self) -> Option<PipelineError> {
        self.error.lock().ok().and_then(|mut slot| slot.take())
    }
}

/// Assembles a [`Pipeline`].
pub struct PipelineBuilder {
    config: AppConfig,
    pool: Option<Pool>,
    memory: Option<SharedMemory>,
    bus: Option<MessageBus>,
    detectors: DetectorFactory,
    source_factory: SourceFactory,
    extra_sources: Vec<(BoxedSource, ConnectPolicy)>,
}

impl PipelineBuilder {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config,
            pool: None,
            memory: None,
            bus: None,
            detectors: DetectorFactory::builtin(),
            source_factory: SourceFactory::builtin(),
            extra_sources: Vec::new(),
        }
    }

    /// Use an already open pool instead of opening `[storage] path`.
    pub fn pool(mut self, pool: Pool) -> Self {
        self.pool = Some(pool);
        self
    }

    /// Bind the memory interface, overriding `[memory] mode`. Required for
    /// `direct` mode.
    pub fn memory(mut self, memory: SharedMemory) -> Self {
        self.memory = Some(memory);
        self
    }

    /// Bus used by `channel` mode. Required for that mode; subscribe to
    /// `[memory] channel` on it before starting the pipeline.
    pub fn bus(mut self, bus: MessageBus) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn detector_factory(mut self, factory: DetectorFactory) -> Self {
        self.detectors = factory;
        self
    }

    pub fn source_factory(mut self, factory: SourceFactory) -> Self {
        self.source_factory = factory;
        self
    }

    /// Run an adapter built outside the configuration.
    pub fn source(mut self, source: BoxedSource, policy: ConnectPolicy) -> Self {
        self.extra_sources.push((source, policy));
        self
    }

    /// Validate the configuration against this builder's factories and
    /// construct every stage. Any invalid detector or source is fatal here.
    pub fn build(self) -> Result<Pipeline> {
        let config = self.config;
        config
            .validate_with(&self.detectors, &self.source_factory)
            .map_err(PipelineError::from)?;

        let pool = match self.pool {
            Some(pool) => pool,
            None => storage::open_pool(&config.storage.path)?,
        };
        let metrics = Arc::new(PipelineMetrics::new().context("failed to create metrics registry")?);

        let registry = DetectorRegistry::from_config(&config.detectors, &self.detectors)
            .map_err(PipelineError::from)?
            .with_metrics(metrics.clone());
        if registry.is_empty() {
            warn!("no detectors enabled; samples will be windowed but never scored");
        }

        let memory = match self.memory {
            Some(memory) => memory,
            None => memory::from_config(
                &config.memory,
                self.bus.as_ref(),
                config.pipeline.delivery_timeout(),
            )
            .map_err(PipelineError::from)?,
        };

        let (ingest, queue) = IngestionStage::new(
            config.pipeline.queue_capacity,
            OverflowStore::new(pool.clone(), &config.storage),
            metrics.clone(),
            config.pipeline.max_consecutive_store_failures,
        )
        .map_err(PipelineError::from)?;

        let sink = EventSink::new(
            memory,
            OutboxStore::new(pool.clone()),
            DeadLetterStore::new(pool),
            metrics.clone(),
            SinkSettings::from_config(&config.pipeline),
        );

        let mut sources = Vec::new();
        for source_config in config.sources.iter().filter(|s| s.enabled) {
            let source = self
                .source_factory
                .build(source_config)
                .map_err(PipelineError::from)?;
            sources.push((source, connect_policy(source_config)));
        }
        sources.extend(self.extra_sources);

        let mut push_handles = HashMap::new();
        let source_states = Arc::new(DashMap::new());
        for (source, _) in &sources {
            if let Some(handle) = source.push_handle() {
                push_handles.insert(source.source_id().to_string(), handle);
            }
            source_states.insert(source.source_id().to_string(), SourceState::Connecting);
        }

        let context = Arc::new(PipelineContext {
            metrics,
            windows: Arc::new(WindowStore::new(config.window.clone())),
            registry: Arc::new(registry),
            ingest: Arc::new(ingest),
            sink: Arc::new(sink),
            source_states,
            started: Instant::now(),
        });

        Ok(Pipeline {
            config,
            context,
            queue,
            sources,
            push_handles,
        })
    }
}

/// Shared, read-mostly view of a pipeline for health queries and the API.
pub struct PipelineContext {
    pub metrics: Arc<PipelineMetrics>,
    pub windows: Arc<WindowStore>,
    pub registry: Arc<DetectorRegistry>,
    pub ingest: Arc<IngestionStage>,
    pub sink: Arc<EventSink>,
    source_states: Arc<DashMap<String, SourceState>>,
    started: Instant,
}

impl PipelineContext {
    pub fn health(&self) -> HealthReport {
        let source_states: BTreeMap<String, SourceState> = self
            .source_states
            .iter()
            .map(|e| (e.key().clone(), *e.value()))
            .collect();
        HealthReport::assemble(HealthInputs {
            detectors: self.registry.health(),
            detector_stats: self.registry.stats(),
            source_states,
            source_counters: self.ingest.source_counters(),
            queue_depth: self.ingest.queue_depth(),
            overflow_depth: self.ingest.overflow_depth(),
            dead_letters: self.sink.dead_letters().count().unwrap_or(0),
            uptime: self.started.elapsed(),
            ingestion_exhausted: self.ingest.is_exhausted(),
        })
    }

    pub fn source_state(&self, source_id: &str) -> Option<SourceState> {
        self.source_states.get(source_id).map(|s| *s)
    }
}

/// A built, not yet started pipeline.
pub struct Pipeline {
    config: AppConfig,
    context: Arc<PipelineContext>,
    queue: mpsc::Receiver<Admitted>,
    sources: Vec<(BoxedSource, ConnectPolicy)>,
    push_handles: HashMap<String, PushHandle>,
}

impl Pipeline {
    pub fn builder(config: AppConfig) -> PipelineBuilder {
        PipelineBuilder::new(config)
    }

    pub fn context(&self) -> Arc<PipelineContext> {
        self.context.clone()
    }

    /// Spawn every stage. Batches left in the outbox by a previous run are
    /// re-delivered before new events.
    pub async fn start(self) -> Result<PipelineHandle> {
        let Pipeline {
            config,
            context,
            queue,
            sources,
            push_handles,
        } = self;
        let pipeline_config = &config.pipeline;

        context
            .sink
            .replay_outbox()
            .await
            .context("failed to replay outbox")?;

        let fatal = FatalSignal::default();
        let stop_sources = CancellationToken::new();
        let stop_sweep = CancellationToken::new();
        let stop_dispatch = CancellationToken::new();

        let (events_tx, events_rx) = mpsc::channel(pipeline_config.batch_size.max(1) * 4);
        let sink = context.sink.clone();
        let sink_task = tokio::spawn(async move { sink.run(events_rx).await });

        let mut worker_txs = Vec::with_capacity(pipeline_config.worker_count);
        let mut workers = Vec::with_capacity(pipeline_config.worker_count);
        for index in 0..pipeline_config.worker_count.max(1) {
            let (tx, rx) = mpsc::channel(pipeline_config.queue_capacity.max(1));
            worker_txs.push(tx);
            let detection = worker::Worker {
                index,
                windows: context.windows.clone(),
                registry: context.registry.clone(),
                ingest: context.ingest.clone(),
                metrics: context.metrics.clone(),
                events: events_tx.clone(),
            };
            workers.push(tokio::spawn(worker::run_worker(detection, rx)));
        }
        drop(events_tx);

        let dispatcher = tokio::spawn(worker::dispatch(queue, worker_txs, stop_dispatch.clone()));

        let sweep = tokio::spawn(sweep::run_sweep_loop(
            context.ingest.clone(),
            pipeline_config.sweep_interval(),
            std::time::Duration::from_secs(config.storage.overflow_ttl_secs),
            stop_sweep.clone(),
        ));

        let mut source_tasks = Vec::with_capacity(sources.len());
        for (source, policy) in sources {
            let runner = SourceRunner {
                source,
                policy,
                ingest: context.ingest.clone(),
                states: context.source_states.clone(),
                shutdown: stop_sources.clone(),
                fatal: fatal.clone(),
                grace: pipeline_config.shutdown_grace(),
            };
            source_tasks.push(tokio::spawn(runner.run()));
        }

        info!(
            sources = source_tasks.len(),
            workers = workers.len(),
            detectors = context.registry.len(),
            "pipeline started"
        );

        Ok(PipelineHandle {
            context,
            push_handles,
            fatal,
            stop_sources,
            stop_sweep,
            stop_dispatch,
            source_tasks,
            sweep,
            dispatcher,
            workers,
            sink_task,
        })
    }
}

/// A running pipeline.
pub struct PipelineHandle {
    context: Arc<PipelineContext>,
    push_handles: HashMap<String, PushHandle>,
    fatal: FatalSignal,
    stop_sources: CancellationToken,
    stop_sweep: CancellationToken,
    stop_dispatch: CancellationToken,
    source_tasks: Vec<JoinHandle<Option<SourceRunner>>>,
    sweep: JoinHandle<()>,
    dispatcher: JoinHandle<()>,
    workers: Vec<JoinHandle<()>>,
    sink_task: JoinHandle<()>,
}

impl PipelineHandle {
    pub fn context(&self) -> Arc<PipelineContext> {
        self.context.clone()
    }

    pub fn health(&self) -> HealthReport {
        self.context.health()
    }

    pub fn metrics(&self) -> &PipelineMetrics {
        &self.context.metrics
    }

    /// Callback handle of a push source.
    pub fn push_handle(&self, source_id: &str) -> Option<PushHandle> {
        self.push_handles.get(source_id).cloned()
    }

    /// Admit a sample directly, bypassing any adapter.
    pub fn submit(&self, sample: MetricSample) -> Result<SubmitOutcome, PipelineError> {
        let outcome = self.context.ingest.submit(sample);
        if let Err(PipelineError::ResourceExhausted { consecutive }) = &outcome {
            self.fatal.trigger(PipelineError::ResourceExhausted {
                consecutive: *consecutive,
            });
        }
        outcome
    }

    /// Resolves once a pipeline-fatal error has been raised.
    pub async fn fatal(&self) {
        self.fatal.token.cancelled().await
    }

    /// Stop every stage in order and wait for them. Returns the fatal error
    /// that stopped the pipeline, if any.
    pub async fn shutdown(self) -> Result<(), PipelineError> {
        info!("pipeline shutting down");
        self.stop_sources.cancel();
        let mut runners = Vec::with_capacity(self.source_tasks.len());
        for task in self.source_tasks {
            match task.await {
                Ok(Some(runner)) => runners.push(runner),
                Ok(None) => {}
                Err(e) => error!(error = %e, "source runner panicked"),
            }
        }

        self.stop_sweep.cancel();
        if let Err(e) = self.sweep.await {
            error!(error = %e, "overflow sweep panicked");
        }

        self.stop_dispatch.cancel();
        if let Err(e) = self.dispatcher.await {
            error!(error = %e, "dispatcher panicked");
        }
        for worker in self.workers {
            if let Err(e) = worker.await {
                error!(error = %e, "detection worker panicked");
            }
        }
        if let Err(e) = self.sink_task.await {
            error!(error = %e, "event sink panicked");
        }

        for runner in runners {
            runner.disconnect().await;
        }

        let remaining = self.context.ingest.overflow_depth();
        if remaining > 0 {
            info!(records = remaining, "overflow records kept for next start");
        }
        info!("pipeline stopped");

        match self.fatal.take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
