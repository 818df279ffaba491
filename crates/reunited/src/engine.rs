use reunite_core::{
    CacheCounters, DescriptorExtractor, DistanceMetric, ExtractError, FaceSearch, GalleryStore,
    IngestionPipeline, MatchPolicy, MatchResult, MissingPersonRecord, QueryError, RecordId,
    RegisterError, RegistrationForm, StoreError,
};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Semaphore;

use crate::config::Config;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Register(#[from] RegisterError),
    #[error(transparent)]
    Query(#[from] QueryError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("worker task failed: {0}")]
    Worker(#[from] tokio::task::JoinError),
}

/// Snapshot reported by `Status()`.
#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub records: usize,
    pub threshold: f32,
    pub policy: MatchPolicy,
    pub metric: DistanceMetric,
    pub model_id: String,
    pub cache: CacheCounters,
}

/// Everything a request needs, built once at startup.
struct Engine {
    store: Arc<dyn GalleryStore>,
    ingest: IngestionPipeline,
    search: FaceSearch,
}

/// Query extractions allowed on the blocking pool at once.
pub const QUERY_SLOTS: usize = 4;

/// Clone-safe handle to the engine.
///
/// Each call runs the blocking core work on tokio's blocking pool. The
/// query photo's extraction is bounded by the configured timeout; gallery
/// scans are not.
///
/// A timed-out extraction cannot be cancelled. It keeps its pool thread and
/// its query slot until the model returns, so at most [`QUERY_SLOTS`] hung
/// extractions pile up before new queries start timing out while they wait.
#[derive(Clone)]
pub struct EngineHandle {
    inner: Arc<Engine>,
    query_timeout: Duration,
    query_slots: Arc<Semaphore>,
}

impl EngineHandle {
    pub fn new(
        store: Arc<dyn GalleryStore>,
        extractor: Arc<dyn DescriptorExtractor>,
        config: &Config,
    ) -> Self {
        let engine = Engine {
            ingest: IngestionPipeline::new(store.clone()).with_max_image_bytes(config.max_image_bytes),
            search: FaceSearch::new(store.clone(), extractor, config.match_config()),
            store,
        };
        Self {
            inner: Arc::new(engine),
            query_timeout: config.query_timeout(),
            query_slots: Arc::new(Semaphore::new(QUERY_SLOTS)),
        }
    }

    #[cfg(test)]
    fn with_query_timeout(mut self, timeout: Duration) -> Self {
        self.query_timeout = timeout;
        self
    }

    #[cfg(test)]
    fn with_query_slots(mut self, slots: usize) -> Self {
        self.query_slots = Arc::new(Semaphore::new(slots));
        self
    }

    async fn blocking<T, F>(&self, work: F) -> Result<T, EngineError>
    where
        T: Send + 'static,
        F: FnOnce(&Engine) -> Result<T, EngineError> + Send + 'static,
    {
        let engine = self.inner.clone();
        tokio::task::spawn_blocking(move || work(&engine)).await?
    }

    pub async fn register(&self, form: RegistrationForm) -> Result<MissingPersonRecord, EngineError> {
        self.blocking(move |e| Ok(e.ingest.register(form)?)).await
    }

    /// Describe the query photo, then scan the gallery.
    pub async fn match_image(&self, image: Vec<u8>) -> Result<Option<MatchResult>, EngineError> {
        let engine = self.inner.clone();
        let slots = self.query_slots.clone();
        // Waiting for a slot counts against the timeout.
        let describe = async move {
            let Ok(permit) = slots.acquire_owned().await else {
                let closed = ExtractError::Failed("query slots closed".into());
                return Err(EngineError::from(QueryError::from(closed)));
            };
            let described = tokio::task::spawn_blocking(move || {
                let _permit = permit;
                engine.search.describe(&image)
            })
            .await?;
            Ok::<_, EngineError>(described?)
        };
        let query = match tokio::time::timeout(self.query_timeout, describe).await {
            Ok(described) => described?,
            Err(_) => {
                tracing::warn!(timeout = ?self.query_timeout, "query extraction timed out");
                return Err(QueryError::from(ExtractError::TimedOut(self.query_timeout)).into());
            }
        };

        self.blocking(move |e| Ok(e.search.find(&query)?)).await
    }

    pub async fn get(&self, id: RecordId) -> Result<Option<MissingPersonRecord>, EngineError> {
        self.blocking(move |e| Ok(e.ingest.get(id)?)).await
    }

    pub async fn replace_image(
        &self,
        id: RecordId,
        image: Option<Vec<u8>>,
    ) -> Result<MissingPersonRecord, EngineError> {
        self.blocking(move |e| Ok(e.ingest.replace_image(id, image)?)).await
    }

    pub async fn remove(&self, id: RecordId) -> Result<bool, EngineError> {
        self.blocking(move |e| Ok(e.ingest.remove(id)?)).await
    }

    pub async fn status(&self) -> Result<EngineStatus, EngineError> {
        self.blocking(|e| {
            let config = e.search.engine().config();
            Ok(EngineStatus {
                records: e.store.count()?,
                threshold: config.threshold,
                policy: config.policy,
                metric: config.metric,
                model_id: e.search.model_id().to_string(),
                cache: e.search.engine().cache().counters(),
            })
        })
        .await
    }
}
