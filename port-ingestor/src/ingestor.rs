use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time;

use port_common::metrics::{
    INGEST_DROPPED_ERRORS, INGEST_DURATION, INGEST_RUNS, INGEST_UPSERTS, INGEST_WORKER_SATURATION,
};
use port_common::repository::Repository;
use port_common::stream::{Entry, JsonStream, TrailingContent};
use serde::de::DeserializeOwned;
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::IngestError;
use crate::source::SourceSelection;

/// The host's available parallelism, or 1 if it cannot be determined.
pub fn default_concurrency() -> NonZeroUsize {
    std::thread::available_parallelism().unwrap_or(NonZeroUsize::MIN)
}

#[derive(Debug, Clone)]
pub struct IngestorConfig {
    /// Directory relative source paths are resolved against.
    pub data_dir: PathBuf,
    /// Maximum number of upsert tasks in flight at any time.
    pub max_concurrent_upserts: NonZeroUsize,
    /// Optional deadline for a whole run, handled like an external cancellation.
    pub timeout: Option<time::Duration>,
    pub trailing_content: TrailingContent,
}

impl IngestorConfig {
    pub fn new(data_dir: impl Into<PathBuf>, max_concurrent_upserts: NonZeroUsize) -> Self {
        Self {
            data_dir: data_dir.into(),
            max_concurrent_upserts,
            timeout: None,
            trailing_content: TrailingContent::default(),
        }
    }

    pub fn timeout(mut self, timeout: time::Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn trailing_content(mut self, trailing_content: TrailingContent) -> Self {
        self.trailing_content = trailing_content;
        self
    }
}

/// Counts of what a successful run did to the repository.
/// Upserts are only skipped or failed in runs that end with an error, so those are not counted.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct IngestSummary {
    pub created: u64,
    pub updated: u64,
}

impl IngestSummary {
    fn tally(&mut self, outcome: UpsertOutcome) {
        match outcome {
            UpsertOutcome::Created => self.created += 1,
            UpsertOutcome::Updated => self.updated += 1,
            UpsertOutcome::Skipped | UpsertOutcome::Failed => {}
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UpsertOutcome {
    Created,
    Updated,
    Skipped,
    Failed,
}

impl UpsertOutcome {
    fn as_str(&self) -> &'static str {
        match self {
            UpsertOutcome::Created => "created",
            UpsertOutcome::Updated => "updated",
            UpsertOutcome::Skipped => "skipped",
            UpsertOutcome::Failed => "failed",
        }
    }
}

/// Shared failure state of a single run: the first error recorded and the token every task
/// checks before touching the repository. Recording any error cancels the token.
struct Failure {
    first: Mutex<Option<IngestError>>,
    cancel: CancellationToken,
}

impl Failure {
    fn new(cancel: CancellationToken) -> Self {
        Self {
            first: Mutex::new(None),
            cancel,
        }
    }

    fn record(&self, error: IngestError) {
        {
            let mut first = self.first.lock().unwrap_or_else(PoisonError::into_inner);
            match *first {
                None => *first = Some(error),
                Some(_) => {
                    warn!(%error, stage = error.stage(), "dropping error observed after the run failed");
                    metrics::counter!(INGEST_DROPPED_ERRORS).increment(1);
                }
            }
        }

        self.cancel.cancel();
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    fn take(&self) -> Option<IngestError> {
        self.first
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}

/// Upserts every record of a keyed JSON document into a Repository, with at most
/// `max_concurrent_upserts` repository round trips in flight.
pub struct Ingestor<P> {
    repository: Arc<P>,
    config: IngestorConfig,
}

impl<P> Ingestor<P>
where
    P: Repository + 'static,
    P::Record: DeserializeOwned + 'static,
{
    pub fn new(repository: Arc<P>, config: IngestorConfig) -> Self {
        Self { repository, config }
    }

    pub fn repository(&self) -> &Arc<P> {
        &self.repository
    }

    pub fn config(&self) -> &IngestorConfig {
        &self.config
    }

    /// Run a single ingestion. Returns once every spawned task has finished.
    pub async fn run(&self, selection: SourceSelection) -> Result<IngestSummary, IngestError> {
        self.run_until(selection, CancellationToken::new()).await
    }

    /// Like `run`, but also stops early once `shutdown` is cancelled. In-flight repository calls
    /// are left to complete and no new ones are started.
    pub async fn run_until(
        &self,
        selection: SourceSelection,
        shutdown: CancellationToken,
    ) -> Result<IngestSummary, IngestError> {
        let start = tokio::time::Instant::now();

        let result = self.ingest(selection, shutdown).await;

        metrics::histogram!(INGEST_DURATION).record(start.elapsed().as_secs_f64());

        match &result {
            Ok(summary) => {
                metrics::counter!(INGEST_RUNS, "outcome" => "success").increment(1);
                info!(
                    created = summary.created,
                    updated = summary.updated,
                    "ingestion completed"
                );
            }
            Err(err) => {
                metrics::counter!(INGEST_RUNS, "outcome" => err.stage()).increment(1);
                error!(error = %err, stage = err.stage(), key = err.key(), "ingestion failed");
            }
        }

        result
    }

    async fn ingest(
        &self,
        selection: SourceSelection,
        shutdown: CancellationToken,
    ) -> Result<IngestSummary, IngestError> {
        let source = selection.validate(&self.config.data_dir)?;

        let cancel = shutdown.child_token();
        let reader = source.open(cancel.clone()).await?;

        let (stream, mut entries) = JsonStream::<P::Record>::new();
        let producer = stream
            .trailing_content(self.config.trailing_content)
            .spawn(reader);

        let failure = Arc::new(Failure::new(cancel.clone()));
        let watchdog = tokio::spawn(watch_deadline(
            failure.clone(),
            shutdown,
            self.config.timeout,
        ));

        let max_concurrent_upserts = self.config.max_concurrent_upserts.get();
        let semaphore = Arc::new(Semaphore::new(max_concurrent_upserts));
        let report_semaphore_utilization = || {
            metrics::gauge!(INGEST_WORKER_SATURATION).set(
                1f64 - semaphore.available_permits() as f64 / max_concurrent_upserts as f64,
            );
        };

        let mut tasks = JoinSet::new();
        let mut summary = IngestSummary::default();

        loop {
            let entry = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                entry = entries.recv() => entry,
            };

            let (key, record) = match entry {
                Some(Entry::Record { key, record }) => (key, record),
                // Reads fail once the run is cancelled, the cause is already recorded.
                Some(Entry::Failed(_)) if cancel.is_cancelled() => break,
                Some(Entry::Failed(error)) => {
                    failure.record(error.into());
                    break;
                }
                None => break,
            };

            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                permit = semaphore.clone().acquire_owned() => permit.expect("semaphore has been closed"),
            };
            report_semaphore_utilization();

            let repository = self.repository.clone();
            let task_failure = failure.clone();
            tasks.spawn(async move {
                let outcome = if task_failure.is_cancelled() {
                    UpsertOutcome::Skipped
                } else {
                    match upsert(repository.as_ref(), key, record).await {
                        Ok(outcome) => outcome,
                        Err(error) => {
                            task_failure.record(error);
                            UpsertOutcome::Failed
                        }
                    }
                };
                drop(permit);

                metrics::counter!(INGEST_UPSERTS, "outcome" => outcome.as_str()).increment(1);
                outcome
            });

            while let Some(joined) = tasks.try_join_next() {
                collect(joined, &mut summary, &failure);
            }
        }

        debug!(in_flight = tasks.len(), "dispatch finished, draining upsert tasks");

        // Unblocks the producer if it is waiting for room in the channel.
        drop(entries);

        while let Some(joined) = tasks.join_next().await {
            collect(joined, &mut summary, &failure);
        }
        report_semaphore_utilization();

        if let Err(error) = producer.await {
            failure.record(IngestError::TaskFailed(error));
        }

        cancel.cancel();
        if let Err(error) = watchdog.await {
            failure.record(IngestError::TaskFailed(error));
        }

        match failure.take() {
            Some(error) => Err(error),
            None => Ok(summary),
        }
    }
}

fn collect(
    joined: Result<UpsertOutcome, JoinError>,
    summary: &mut IngestSummary,
    failure: &Failure,
) {
    match joined {
        Ok(outcome) => summary.tally(outcome),
        Err(error) => failure.record(IngestError::TaskFailed(error)),
    }
}

/// Get the record, then update it if it exists or create it if the repository reports it missing.
async fn upsert<P>(
    repository: &P,
    key: String,
    record: P::Record,
) -> Result<UpsertOutcome, IngestError>
where
    P: Repository + ?Sized,
{
    match repository.get(&key).await {
        Ok(_) => match repository.update(&key, record).await {
            Ok(()) => {
                debug!(key = %key, "updated record");
                Ok(UpsertOutcome::Updated)
            }
            Err(error) => Err(IngestError::Update { key, error }),
        },
        Err(error) if error.is_not_found() => match repository.create(&key, record).await {
            Ok(()) => {
                debug!(key = %key, "created record");
                Ok(UpsertOutcome::Created)
            }
            Err(error) => Err(IngestError::Create { key, error }),
        },
        Err(error) => Err(IngestError::Get { key, error }),
    }
}

/// Turn an external shutdown or an expired deadline into a recorded failure.
/// Returns as soon as the run is cancelled for any reason.
async fn watch_deadline(
    failure: Arc<Failure>,
    shutdown: CancellationToken,
    timeout: Option<time::Duration>,
) {
    let expired = async move {
        match timeout {
            Some(timeout) => {
                tokio::time::sleep(timeout).await;
                IngestError::DeadlineExceeded(timeout)
            }
            None => std::future::pending().await,
        }
    };

    tokio::select! {
        biased;
        _ = shutdown.cancelled() => failure.record(IngestError::Cancelled),
        error = expired => failure.record(error),
        _ = failure.cancel.cancelled() => {}
    }
}
