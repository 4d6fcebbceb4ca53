use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio::sync::{watch, Semaphore};
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::models::batch::BatchProgress;
use crate::models::item::{ImageAsset, ItemStatus, ItemUpdate, WorkItem};
use crate::services::control::{BatchControl, PAUSE_POLL_INTERVAL};
use crate::services::generator::ImageService;
use crate::services::naming::{self, LABEL_TIMEOUT};
use crate::services::processor::{ItemProcessor, RetryPolicy, RunContext};
use crate::services::queue::{QueueError, SharedQueue};
use crate::services::rate_governor::{RateGovernor, RateLimit};

/// Tunables for one batch run.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SchedulerConfig {
    /// K: processors allowed to run at once.
    pub concurrency: usize,
    pub rate_limit: RateLimit,
    pub retry: RetryPolicy,
    pub pause_poll_interval: Duration,
    /// Run the descriptive-naming call for unlabelled items on submission.
    pub describe_items: bool,
    pub label_timeout: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            concurrency: 3,
            rate_limit: RateLimit::default(),
            retry: RetryPolicy::default(),
            pause_poll_interval: PAUSE_POLL_INTERVAL,
            describe_items: false,
            label_timeout: LABEL_TIMEOUT,
        }
    }
}

/// Creates batch runs against one external service.
#[derive(Clone)]
pub struct BatchScheduler {
    service: Arc<dyn ImageService>,
    config: SchedulerConfig,
}

impl BatchScheduler {
    pub fn new(service: Arc<dyn ImageService>, config: SchedulerConfig) -> Self {
        Self { service, config }
    }

    /// Open an idle run. Items are added with [`BatchHandle::submit`].
    pub fn start(&self, reference: Option<ImageAsset>) -> (BatchHandle, UnboundedReceiver<ItemUpdate>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (outstanding, _) = watch::channel(0usize);
        let id = Uuid::new_v4();

        let run = BatchRun {
            id,
            queue: SharedQueue::new(events_tx),
            control: BatchControl::new(self.config.pause_poll_interval),
            governor: RateGovernor::new(self.config.rate_limit),
            processor: ItemProcessor::new(Arc::clone(&self.service), self.config.retry),
            service: Arc::clone(&self.service),
            slots: Arc::new(Semaphore::new(self.config.concurrency.max(1))),
            reference,
            outstanding,
            fatal: Mutex::new(None),
            config: self.config,
        };

        info!(
            batch_id = %id,
            concurrency = self.config.concurrency,
            max_requests_per_minute = self.config.rate_limit.max_requests,
            has_reference = run.reference.is_some(),
            "Batch run started"
        );

        (
            BatchHandle {
                inner: Arc::new(run),
            },
            events_rx,
        )
    }

    /// Open a run and submit `items` to it.
    pub fn run(
        &self,
        items: Vec<WorkItem>,
        reference: Option<ImageAsset>,
    ) -> Result<(BatchHandle, UnboundedReceiver<ItemUpdate>), PipelineError> {
        let (handle, events) = self.start(reference);
        handle.submit(items)?;
        Ok((handle, events))
    }
}

struct BatchRun {
    id: Uuid,
    queue: SharedQueue,
    control: BatchControl,
    governor: RateGovernor,
    processor: ItemProcessor,
    service: Arc<dyn ImageService>,
    slots: Arc<Semaphore>,
    reference: Option<ImageAsset>,
    /// Spawned tasks not yet finished.
    outstanding: watch::Sender<usize>,
    fatal: Mutex<Option<String>>,
    config: SchedulerConfig,
}

impl BatchRun {
    fn ctx(&self) -> RunContext<'_> {
        RunContext {
            queue: &self.queue,
            control: &self.control,
            governor: &self.governor,
        }
    }

    /// Spawn `task` and count it as outstanding until it ends. A panic inside
    /// `task` is an invariant violation: it cancels the whole run and makes
    /// [`BatchHandle::wait`] return an error.
    fn spawn_tracked<F>(self: &Arc<Self>, name: &'static str, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.outstanding.send_modify(|n| *n += 1);
        let run = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = tokio::spawn(task).await {
                if e.is_panic() {
                    error!(batch_id = %run.id, task = name, "Task panicked, aborting batch run");
                    *run.fatal.lock() = Some(format!("{name} task panicked"));
                    run.control.cancel();
                }
            }
            run.outstanding.send_modify(|n| *n = n.saturating_sub(1));
        });
    }

    /// Hand a Queued item to the pool. It waits for one of the K slots; a
    /// cancellation while waiting puts it back to Pending.
    fn dispatch(self: &Arc<Self>, item: WorkItem) {
        let run = Arc::clone(self);
        self.spawn_tracked("process", async move {
            let permit = tokio::select! {
                permit = Arc::clone(&run.slots).acquire_owned() => permit,
                _ = run.control.cancelled() => {
                    run.queue.publish(item.reset());
                    return;
                }
            };
            let Ok(_permit) = permit else {
                run.queue.publish(item.reset());
                return;
            };

            metrics::gauge!("studio_items_in_flight").increment(1.0);
            run.processor.process(item, run.ctx()).await;
            metrics::gauge!("studio_items_in_flight").decrement(1.0);
        });
    }

    fn describe(self: &Arc<Self>, item: &WorkItem) {
        let run = Arc::clone(self);
        let item_id = item.id;
        let source = item.source.clone();
        self.spawn_tracked("describe", async move {
            let label =
                naming::describe_with_timeout(run.service.as_ref(), &source, run.config.label_timeout)
                    .await;
            run.queue.with(|q| {
                if q.get(item_id).is_some_and(|current| current.label.is_none()) {
                    q.set_label(item_id, &label);
                }
            });
        });
    }
}

/// Cloneable control surface of a running batch.
#[derive(Clone)]
pub struct BatchHandle {
    inner: Arc<BatchRun>,
}

impl BatchHandle {
    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    /// Add items to this run. Pending items become Queued and are dispatched
    /// as concurrency slots free up. Works on idle and running batches.
    pub fn submit(&self, items: Vec<WorkItem>) -> Result<Vec<Uuid>, PipelineError> {
        let run = &self.inner;
        if run.control.is_cancelled() {
            return Err(PipelineError::BatchClosed(run.id));
        }

        let ids: Vec<Uuid> = items.iter().map(|item| item.id).collect();
        let queued = run.queue.with(|q| -> Result<Vec<WorkItem>, PipelineError> {
            for item in &items {
                if let Some(existing) = q.get(item.id) {
                    if existing.status.is_in_flight() {
                        return Err(QueueError::Busy {
                            item_id: item.id,
                            status: existing.status,
                        }
                        .into());
                    }
                }
            }
            for item in items {
                q.insert(item.with_reference(run.reference.clone()))?;
            }
            Ok(q.initialize())
        })?;

        metrics::counter!("studio_items_submitted_total").increment(queued.len() as u64);
        info!(batch_id = %run.id, submitted = ids.len(), queued = queued.len(), "Items submitted");

        for item in queued {
            if run.config.describe_items && item.label.is_none() {
                run.describe(&item);
            }
            run.dispatch(item);
        }
        Ok(ids)
    }

    /// Reset a finished item to Pending (dropping its result) and queue it
    /// again.
    pub fn reprocess(&self, item_id: Uuid) -> Result<(), PipelineError> {
        let run = &self.inner;
        if run.control.is_cancelled() {
            return Err(PipelineError::BatchClosed(run.id));
        }

        let queued = run.queue.with(|q| -> Result<Vec<WorkItem>, PipelineError> {
            let current = q.get(item_id).ok_or(PipelineError::UnknownItem(item_id))?;
            if current.status.is_in_flight() {
                return Err(PipelineError::InvalidState {
                    item_id,
                    status: current.status,
                });
            }
            let reset = current.reset();
            q.apply(reset);
            Ok(q.initialize())
        })?;

        debug!(batch_id = %run.id, %item_id, "Item reprocessing requested");
        for item in queued {
            run.dispatch(item);
        }
        Ok(())
    }

    /// Targeted single-attempt edit of a finished item. Bypasses the
    /// concurrency slots but still passes the rate gate.
    pub fn retouch(&self, item_id: Uuid, instruction: &str) -> Result<(), PipelineError> {
        let instruction = instruction.trim();
        if instruction.is_empty() {
            return Err(PipelineError::EmptyInstruction);
        }
        let (claimed, input) = self.claim_edit(item_id, ItemStatus::Retouching)?;

        let run = Arc::clone(&self.inner);
        let instruction = instruction.to_string();
        self.inner.spawn_tracked("retouch", async move {
            run.processor
                .retouch(claimed, input, instruction, run.ctx())
                .await;
        });
        Ok(())
    }

    /// Single-attempt hero render of a finished item.
    pub fn hero(&self, item_id: Uuid) -> Result<(), PipelineError> {
        let (claimed, input) = self.claim_edit(item_id, ItemStatus::Processing)?;

        let run = Arc::clone(&self.inner);
        self.inner.spawn_tracked("hero", async move {
            run.processor.hero(claimed, input, run.ctx()).await;
        });
        Ok(())
    }

    fn claim_edit(
        &self,
        item_id: Uuid,
        status: ItemStatus,
    ) -> Result<(WorkItem, ImageAsset), PipelineError> {
        let run = &self.inner;
        if run.control.is_cancelled() {
            return Err(PipelineError::BatchClosed(run.id));
        }
        run.queue.with(|q| {
            let current = q.get(item_id).ok_or(PipelineError::UnknownItem(item_id))?;
            if !current.status.is_terminal() {
                return Err(PipelineError::InvalidState {
                    item_id,
                    status: current.status,
                });
            }
            let (claimed, input) = current.begin_edit(status);
            Ok((q.apply(claimed), input))
        })
    }

    pub fn pause(&self) {
        info!(batch_id = %self.inner.id, "Batch paused");
        self.inner.control.pause();
    }

    pub fn resume(&self) {
        info!(batch_id = %self.inner.id, "Batch resumed");
        self.inner.control.resume();
    }

    pub fn is_paused(&self) -> bool {
        self.inner.control.is_paused()
    }

    /// Stop the run at the next safe point. In-flight service calls finish;
    /// items that have not reached a terminal status return to Pending.
    pub fn cancel(&self) {
        info!(batch_id = %self.inner.id, "Batch cancelled");
        self.inner.control.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.control.is_cancelled()
    }

    /// No spawned task of this run is still outstanding.
    pub fn is_idle(&self) -> bool {
        *self.inner.outstanding.borrow() == 0
    }

    pub fn item(&self, item_id: Uuid) -> Option<WorkItem> {
        self.inner.queue.get(item_id)
    }

    pub fn items(&self) -> Vec<WorkItem> {
        self.inner.queue.items()
    }

    pub fn progress(&self) -> BatchProgress {
        self.inner.queue.progress()
    }

    /// Wait until every spawned task of this run has finished.
    pub async fn wait(&self) -> Result<BatchProgress, PipelineError> {
        let mut outstanding = self.inner.outstanding.subscribe();
        // The sender lives in `inner`, which `self` keeps alive.
        let _ = outstanding.wait_for(|n| *n == 0).await;

        if let Some(reason) = self.inner.fatal.lock().clone() {
            return Err(PipelineError::Aborted(reason));
        }
        let progress = self.progress();
        info!(
            batch_id = %self.inner.id,
            completed = progress.completed,
            failed = progress.failed,
            pending = progress.pending,
            "Batch run idle"
        );
        Ok(progress)
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PipelineError {
    #[error("Item {0} is not part of this batch")]
    UnknownItem(Uuid),

    #[error("Item {item_id} is {status} and cannot take this action")]
    InvalidState { item_id: Uuid, status: ItemStatus },

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error("Retouch instruction is empty")]
    EmptyInstruction,

    #[error("Batch {0} was cancelled and accepts no new work")]
    BatchClosed(Uuid),

    #[error("Batch run aborted: {0}")]
    Aborted(String),
}
