//! Application state wiring the pipeline together.
//!
//! AppState holds the concrete pipeline used by both CLI and REST API. The
//! core components are generic over store, backend, queue and clock traits;
//! AppState pins them to the SQLite repositories, the HTTP chat backend, the
//! channel queue and the system clock.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parley_core::batch::aggregator::{Aggregator, AggregatorConfig};
use parley_core::batch::recovery::{RecoveryReport, recover_in_flight};
use parley_core::batch::sweeper::StaleBatchSweeper;
use parley_core::batch::worker::BatchWorker;
use parley_core::clock::{Clock, SystemClock};
use parley_core::dispatch::{ChannelDispatchQueue, WorkerPool};
use parley_core::event::EventBus;
use parley_core::pipeline::PipelineHandler;
use parley_core::repository::{BatchStore, FailureStore, SettingsRepository};
use parley_core::retry::{RetryCoordinator, RetryExecutor};
use parley_infra::config::load_global_config;
use parley_infra::filesystem::{ensure_data_dir, resolve_data_dir};
use parley_infra::remote::HttpChatBackend;
use parley_infra::sqlite::pool::database_url;
use parley_infra::sqlite::{
    DatabasePool, SqliteBatchRepository, SqliteFailureRepository, SqliteSettingsRepository,
};
use parley_types::config::GlobalConfig;
use parley_types::error::{PipelineError, RepositoryError};
use parley_types::event::{BatchEvent, BatchEventKind};
use parley_types::settings::{ServiceSettings, ServiceSettingsSummary};
use parley_types::task::TaskStatus;
use parley_types::work::WorkItem;
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

/// Concrete type aliases for the pipeline generics pinned to infra implementations.
pub type ConcreteAggregator = Aggregator<
    SqliteBatchRepository,
    SqliteSettingsRepository,
    ChannelDispatchQueue,
    SystemClock,
>;

pub type ConcreteBatchWorker =
    BatchWorker<SqliteBatchRepository, SqliteSettingsRepository, HttpChatBackend, SystemClock>;

pub type ConcreteRetryCoordinator = RetryCoordinator<
    SqliteBatchRepository,
    SqliteFailureRepository,
    ChannelDispatchQueue,
    SystemClock,
>;

pub type ConcreteRetryExecutor = RetryExecutor<
    SqliteBatchRepository,
    SqliteFailureRepository,
    SqliteSettingsRepository,
    HttpChatBackend,
    SystemClock,
>;

pub type ConcretePipeline = PipelineHandler<
    SqliteBatchRepository,
    SqliteFailureRepository,
    SqliteSettingsRepository,
    HttpChatBackend,
    SystemClock,
>;

/// Shared application state holding the pipeline and its stores.
///
/// Used by both CLI commands and REST API handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<GlobalConfig>,
    pub data_dir: PathBuf,
    pub batches: Arc<SqliteBatchRepository>,
    pub failures: Arc<SqliteFailureRepository>,
    pub settings: Arc<SqliteSettingsRepository>,
    pub backend: Arc<HttpChatBackend>,
    pub queue: Arc<ChannelDispatchQueue>,
    pub aggregator: Arc<ConcreteAggregator>,
    pub worker: Arc<ConcreteBatchWorker>,
    pub retries: Arc<ConcreteRetryCoordinator>,
    pub pipeline: Arc<ConcretePipeline>,
    pub events: EventBus,
    pub clock: Arc<SystemClock>,
}

/// Background tasks started by [`AppState::start_workers`].
pub struct Workers {
    cancel: CancellationToken,
    pool: JoinHandle<()>,
    /// Cancelled only after the pool has drained, so late outcomes still get logged.
    logger_cancel: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl Workers {
    /// Stop intake, let queued work finish, and wait for every task.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(e) = self.pool.await {
            warn!(error = %e, "worker pool ended abnormally");
        }
        self.logger_cancel.cancel();
        for handle in self.handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "background task ended abnormally");
            }
        }
    }
}

impl AppState {
    /// Initialize the application state in the resolved data directory.
    ///
    /// Returns the state plus the receiving end of the dispatch queue, which
    /// [`AppState::start_workers`] hands to the worker pool.
    pub async fn init() -> anyhow::Result<(Self, mpsc::Receiver<WorkItem>)> {
        Self::open(&resolve_data_dir()).await
    }

    /// Initialize the application state rooted at `data_dir`.
    pub async fn open(data_dir: &Path) -> anyhow::Result<(Self, mpsc::Receiver<WorkItem>)> {
        let data_dir = ensure_data_dir(data_dir.to_path_buf()).await?;
        let config = load_global_config(&data_dir).await;

        let db_pool = DatabasePool::new(&database_url(&data_dir)).await?;

        let batches = Arc::new(SqliteBatchRepository::new(db_pool.clone()));
        let failures = Arc::new(SqliteFailureRepository::new(db_pool.clone()));
        let settings = Arc::new(SqliteSettingsRepository::new(db_pool));
        let backend = Arc::new(HttpChatBackend::new()?);
        let clock = Arc::new(SystemClock);
        let events = EventBus::new(config.event_capacity);

        let (queue, receiver) = ChannelDispatchQueue::channel(config.queue_capacity);
        let queue = Arc::new(queue);

        let aggregator_config =
            AggregatorConfig::new(config.aggregation_timeout_secs, config.ordinal_label.clone());
        let label = aggregator_config.ordinal_label.clone();
        let aggregator = Arc::new(Aggregator::new(
            Arc::clone(&batches),
            Arc::clone(&settings),
            Arc::clone(&queue),
            Arc::clone(&clock),
            aggregator_config,
        ));

        let worker = Arc::new(BatchWorker::new(
            Arc::clone(&batches),
            Arc::clone(&settings),
            Arc::clone(&backend),
            Arc::clone(&clock),
            events.clone(),
        ));

        let claim_ttl = chrono::Duration::seconds(config.retry_claim_ttl_secs as i64);
        let retries = Arc::new(RetryCoordinator::new(
            Arc::clone(&batches),
            Arc::clone(&failures),
            Arc::clone(&queue),
            Arc::clone(&clock),
            claim_ttl,
        ));
        let executor: Arc<ConcreteRetryExecutor> = Arc::new(RetryExecutor::new(
            Arc::clone(&batches),
            Arc::clone(&failures),
            Arc::clone(&worker),
            Arc::clone(&clock),
            label,
            claim_ttl,
        ));
        let pipeline = Arc::new(PipelineHandler::new(Arc::clone(&worker), executor));

        let state = Self {
            config: Arc::new(config),
            data_dir,
            batches,
            failures,
            settings,
            backend,
            queue,
            aggregator,
            worker,
            retries,
            pipeline,
            events,
            clock,
        };
        Ok((state, receiver))
    }

    /// Spawn the worker pool and the event logger, plus the stale-batch
    /// sweeper when `sweep` is set.
    pub fn start_workers(&self, receiver: mpsc::Receiver<WorkItem>, sweep: bool) -> Workers {
        let cancel = CancellationToken::new();
        let logger_cancel = CancellationToken::new();
        let mut handles = Vec::new();

        let pool = WorkerPool::new(
            receiver,
            Arc::clone(&self.pipeline),
            self.config.worker_concurrency,
            cancel.clone(),
        );
        let pool = tokio::spawn(pool.run());

        handles.push(tokio::spawn(log_events(
            self.events.subscribe(),
            logger_cancel.clone(),
        )));

        if sweep {
            let sweeper = StaleBatchSweeper::new(
                Arc::clone(&self.aggregator),
                Duration::from_secs(self.config.sweep_interval_secs),
                cancel.clone(),
            );
            handles.push(tokio::spawn(sweeper.run()));
        }

        Workers {
            cancel,
            pool,
            logger_cancel,
            handles,
        }
    }

    /// Re-enqueue or time out batches a previous process left in flight.
    pub async fn recover(&self) -> anyhow::Result<RecoveryReport> {
        let report = recover_in_flight(
            self.batches.as_ref(),
            self.queue.as_ref(),
            self.worker.as_ref(),
            self.clock.now(),
        )
        .await?;
        info!(
            requeued = report.requeued,
            orphaned = report.orphaned,
            timed_out = report.timed_out,
            "recovery finished"
        );
        Ok(report)
    }
}

/// Input for registering remote service settings.
#[derive(Debug, Deserialize)]
pub struct NewSettings {
    pub name: String,
    pub base_url: String,
    pub api_key: String,
    pub user_id: String,
    pub batch_threshold: Option<u32>,
    pub request_timeout_secs: Option<u64>,
    /// Make these the active settings right away.
    #[serde(default)]
    pub activate: bool,
}

impl NewSettings {
    fn into_settings(
        self,
        now: chrono::DateTime<chrono::Utc>,
    ) -> Result<ServiceSettings, PipelineError> {
        if self.name.trim().is_empty() {
            return Err(PipelineError::Validation("settings name must not be empty".into()));
        }
        if !(self.base_url.starts_with("http://") || self.base_url.starts_with("https://")) {
            return Err(PipelineError::Validation(format!(
                "base url '{}' must start with http:// or https://",
                self.base_url
            )));
        }
        if self.api_key.trim().is_empty() {
            return Err(PipelineError::Validation("api key must not be empty".into()));
        }

        let mut settings = ServiceSettings::new(
            self.name.trim(),
            self.base_url.trim(),
            SecretString::from(self.api_key),
            self.user_id,
            now,
        );
        if let Some(threshold) = self.batch_threshold {
            if threshold == 0 {
                return Err(PipelineError::Validation("batch threshold must be at least 1".into()));
            }
            settings.batch_threshold = threshold;
        }
        if let Some(secs) = self.request_timeout_secs {
            if secs == 0 {
                return Err(PipelineError::Validation(
                    "request timeout must be at least 1 second".into(),
                ));
            }
            settings.request_timeout_secs = secs;
        }
        settings.is_active = self.activate;
        Ok(settings)
    }
}

/// Point-in-time view of the pipeline for `status` and `/stats`.
#[derive(Debug, Serialize)]
pub struct StatusSnapshot {
    pub version: &'static str,
    pub data_dir: String,
    pub tasks: std::collections::BTreeMap<String, u64>,
    pub open_batches: usize,
    pub unretried_failures: u64,
    pub queue_capacity: usize,
    pub queue_free: usize,
    pub active_settings: Option<ServiceSettingsSummary>,
}

impl AppState {
    pub async fn create_settings(
        &self,
        input: NewSettings,
    ) -> Result<ServiceSettingsSummary, PipelineError> {
        let settings = input.into_settings(self.clock.now())?;
        self.settings.create_settings(&settings).await?;
        info!(
            settings_id = %settings.id,
            name = %settings.name,
            active = settings.is_active,
            "settings created"
        );
        Ok(settings.summary())
    }

    pub async fn activate_settings(
        &self,
        id: Uuid,
    ) -> Result<ServiceSettingsSummary, PipelineError> {
        match self.settings.activate_settings(&id).await {
            Ok(()) => {}
            Err(RepositoryError::NotFound) => return Err(PipelineError::not_found("settings", id)),
            Err(e) => return Err(e.into()),
        }
        info!(settings_id = %id, "settings activated");
        self.settings
            .get_settings(&id)
            .await?
            .map(|s| s.summary())
            .ok_or_else(|| PipelineError::not_found("settings", id))
    }

    pub async fn active_settings(&self) -> Result<Option<ServiceSettings>, PipelineError> {
        Ok(self.settings.active_settings().await?)
    }

    pub async fn status_snapshot(&self) -> Result<StatusSnapshot, PipelineError> {
        let mut tasks: std::collections::BTreeMap<String, u64> = [
            TaskStatus::Pending,
            TaskStatus::Processing,
            TaskStatus::Completed,
            TaskStatus::Failed,
            TaskStatus::Timeout,
        ]
        .iter()
        .map(|status| (status.to_string(), 0))
        .collect();
        for (status, count) in self.batches.count_tasks_by_status().await? {
            tasks.insert(status.to_string(), count);
        }

        Ok(StatusSnapshot {
            version: env!("CARGO_PKG_VERSION"),
            data_dir: self.data_dir.display().to_string(),
            tasks,
            open_batches: self.aggregator.open_batches().await.len(),
            unretried_failures: self.failures.count_unretried().await?,
            queue_capacity: self.config.queue_capacity,
            queue_free: self.queue.remaining_capacity(),
            active_settings: self.active_settings().await?.map(|s| s.summary()),
        })
    }
}

/// Log every batch outcome until cancelled.
async fn log_events(mut events: broadcast::Receiver<BatchEvent>, cancel: CancellationToken) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            received = events.recv() => match received {
                Ok(event) => log_event(&event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "event logger lagged behind");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }
}

fn log_event(event: &BatchEvent) {
    match &event.kind {
        BatchEventKind::Succeeded { content } => info!(
            conversation_id = %event.conversation_id,
            task_id = %event.task_id,
            batch_id = %event.batch_id,
            reply_chars = content.chars().count(),
            "batch delivered"
        ),
        BatchEventKind::Failed { error } => warn!(
            conversation_id = %event.conversation_id,
            task_id = %event.task_id,
            batch_id = %event.batch_id,
            error = %error,
            "batch failed"
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_settings(base_url: &str) -> NewSettings {
        NewSettings {
            name: "primary".to_string(),
            base_url: base_url.to_string(),
            api_key: "sk-test-abcd1234".to_string(),
            user_id: "tester".to_string(),
            batch_threshold: Some(3),
            request_timeout_secs: None,
            activate: false,
        }
    }

    #[tokio::test]
    async fn open_creates_database_with_default_config() {
        let dir = tempfile::tempdir().unwrap();
        let (state, _receiver) = AppState::open(dir.path()).await.unwrap();

        assert!(dir.path().join("parley.db").exists());
        assert_eq!(state.config.aggregation_timeout_secs, 30);

        let snapshot = state.status_snapshot().await.unwrap();
        assert_eq!(snapshot.tasks.len(), 5);
        assert!(snapshot.tasks.values().all(|count| *count == 0));
        assert_eq!(snapshot.unretried_failures, 0);
        assert!(snapshot.active_settings.is_none());
        assert_eq!(snapshot.queue_free, snapshot.queue_capacity);
    }

    #[tokio::test]
    async fn settings_are_validated_and_activated() {
        let dir = tempfile::tempdir().unwrap();
        let (state, _receiver) = AppState::open(dir.path()).await.unwrap();

        let err = state
            .create_settings(new_settings("ftp://example.test"))
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Validation(_)));

        let mut zero = new_settings("https://example.test/v1");
        zero.batch_threshold = Some(0);
        assert!(matches!(
            state.create_settings(zero).await,
            Err(PipelineError::Validation(_))
        ));

        let summary = state
            .create_settings(new_settings("https://example.test/v1"))
            .await
            .unwrap();
        assert_eq!(summary.batch_threshold, 3);
        assert_eq!(summary.key_hint, "...1234");
        assert!(state.active_settings().await.unwrap().is_none());

        let active = state.activate_settings(summary.id).await.unwrap();
        assert!(active.is_active);
        assert_eq!(
            state.active_settings().await.unwrap().map(|s| s.id),
            Some(summary.id)
        );

        assert!(matches!(
            state.activate_settings(Uuid::now_v7()).await,
            Err(PipelineError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn workers_drain_and_stop() {
        let dir = tempfile::tempdir().unwrap();
        let (state, receiver) = AppState::open(dir.path()).await.unwrap();
        let workers = state.start_workers(receiver, true);

        // With nothing open, recovery has nothing to do.
        let report = state.recover().await.unwrap();
        assert_eq!(report, RecoveryReport::default());

        tokio::time::timeout(Duration::from_secs(5), workers.shutdown())
            .await
            .unwrap();
    }
}
