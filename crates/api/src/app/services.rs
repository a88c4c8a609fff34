use std::{convert::Infallible, sync::Arc, time::Duration};

use anyhow::Context;
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use tokio_stream::{wrappers::BroadcastStream, StreamExt};
use tracing::{info, warn};

use docflow_analysis::{
    Analyzer, DocumentAnalyzer, GeminiClient, GeminiConfig, LocalDocuments, OfflineDigest, ReportWriter,
};
use docflow_broker::{Broker, InMemoryBroker};
use docflow_infra::{
    jobs::{
        InMemoryJobStore, JobEvents, JobStore, LeaseReaper, NotifyingJobStore, PostgresJobStore, ReaperHandle,
        SqliteJobStore, StatusReader, SubmissionGateway, WorkerPool, WorkerPoolHandle, WorkerStatsSnapshot,
    },
    AnalyzerKind, AppConfig,
};

#[cfg(feature = "redis")]
use docflow_infra::queue::{RedisStreamsBroker, RedisStreamsConfig};

/// Everything the handlers need, built once per process.
pub struct AppServices {
    pub config: AppConfig,
    pub gateway: SubmissionGateway,
    pub reader: StatusReader,
    pub events: JobEvents,
    pool: WorkerPool,
    reaper: Arc<LeaseReaper>,
}

/// Background tasks started by [`AppServices::start`].
pub struct Background {
    pool: WorkerPoolHandle,
    reaper: ReaperHandle,
}

impl Background {
    /// Stop consuming, give in-flight attempts `SHUTDOWN_GRACE_SECS`, stop the reaper.
    pub async fn shutdown(self) {
        if !self.pool.shutdown().await {
            warn!("some attempts were cut short; their leases will be reclaimed");
        }
        self.reaper.shutdown().await;
        info!("background tasks stopped");
    }
}

impl AppServices {
    pub fn start(&self) -> Background {
        Background {
            pool: self.pool.spawn(),
            reaper: Arc::clone(&self.reaper).spawn(),
        }
    }

    pub fn worker_stats(&self) -> WorkerStatsSnapshot {
        self.pool.stats().snapshot()
    }

    pub fn default_document(&self) -> &str {
        &self.config.default_document
    }
}

pub async fn build_services(config: AppConfig) -> anyhow::Result<AppServices> {
    let events = JobEvents::default();
    let store = open_store(&config, events.clone()).await?;
    let broker = open_broker(&config)?;
    let documents = LocalDocuments::new(&config.documents_dir);
    let analyzer = build_analyzer(&config, documents.clone())?;

    let gateway = SubmissionGateway::new(store.clone(), broker.clone(), documents, config.max_attempts);
    let reader = StatusReader::new(store.clone());
    let pool = WorkerPool::new(store.clone(), broker.clone(), analyzer, config.worker_pool());
    let reaper = Arc::new(LeaseReaper::new(store, broker, config.reaper()));

    Ok(AppServices {
        config,
        gateway,
        reader,
        events,
        pool,
        reaper,
    })
}

async fn open_store(config: &AppConfig, events: JobEvents) -> anyhow::Result<Arc<dyn JobStore>> {
    let store: Arc<dyn JobStore> = match config.database_url.as_deref() {
        Some(url) if url.starts_with("sqlite:") => {
            let store = SqliteJobStore::connect(url)
                .await
                .context("failed to open sqlite job store")?;
            info!("using sqlite job store");
            Arc::new(NotifyingJobStore::new(store, events))
        }
        Some(url) if url.starts_with("postgres://") || url.starts_with("postgresql://") => {
            let store = PostgresJobStore::connect(url)
                .await
                .context("failed to open postgres job store")?;
            info!("using postgres job store");
            Arc::new(NotifyingJobStore::new(store, events))
        }
        Some(url) => {
            let scheme = url.split(':').next().unwrap_or_default();
            anyhow::bail!("unsupported DATABASE_URL scheme '{scheme}' (expected sqlite or postgres)");
        }
        None => {
            warn!("DATABASE_URL not set; jobs are kept in memory and lost on restart");
            Arc::new(NotifyingJobStore::new(InMemoryJobStore::new(), events))
        }
    };
    Ok(store)
}

fn open_broker(config: &AppConfig) -> anyhow::Result<Arc<dyn Broker>> {
    match config.redis_url.as_deref() {
        #[cfg(feature = "redis")]
        Some(url) => {
            let broker = RedisStreamsBroker::new(url, RedisStreamsConfig::default())
                .context("failed to configure redis streams broker")?;
            info!(stream = %broker.config().stream_key, "using redis streams broker");
            Ok(Arc::new(broker))
        }
        #[cfg(not(feature = "redis"))]
        Some(_) => {
            warn!("REDIS_URL set but the redis feature is not enabled, falling back to the in-process broker");
            Ok(Arc::new(InMemoryBroker::new()))
        }
        None => Ok(Arc::new(InMemoryBroker::new())),
    }
}

fn build_analyzer(config: &AppConfig, documents: LocalDocuments) -> anyhow::Result<Arc<dyn Analyzer>> {
    let reports = ReportWriter::new(&config.output_dir);
    match config.analyzer {
        AnalyzerKind::Gemini => {
            let api_key = config
                .gemini_api_key
                .clone()
                .context("GEMINI_API_KEY is required when ANALYZER=gemini")?;
            let client = GeminiClient::new(GeminiConfig::new(api_key).with_model(&config.gemini_model))
                .context("failed to build gemini client")?;
            info!(model = %config.gemini_model, "using gemini analyzer");
            Ok(Arc::new(DocumentAnalyzer::new(documents, reports, client)))
        }
        AnalyzerKind::Offline => {
            info!("using offline analyzer");
            Ok(Arc::new(DocumentAnalyzer::new(documents, reports, OfflineDigest::new())))
        }
    }
}

/// SSE of job state changes. Lagged receivers skip what they missed.
pub fn job_sse_stream(services: Arc<AppServices>) -> Sse<impl tokio_stream::Stream<Item = Result<SseEvent, Infallible>>> {
    let rx = services.events.subscribe();
    let stream = BroadcastStream::new(rx).filter_map(|msg| match msg {
        Ok(event) => {
            let data = serde_json::to_string(&event).unwrap_or_else(|_| "{}".to_string());
            Some(Ok(SseEvent::default().event("job.state").data(data)))
        }
        Err(_) => None,
    });

    Sse::new(stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(15)))
}
