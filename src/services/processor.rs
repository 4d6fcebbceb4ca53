use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::models::item::{ImageAsset, ItemStatus, WorkItem};
use crate::services::control::BatchControl;
use crate::services::generator::{
    GenerationOutcome, GenerationRequest, GenerationTask, ImageService,
};
use crate::services::queue::SharedQueue;
use crate::services::rate_governor::RateGovernor;

const CREDENTIAL_MESSAGE: &str = "The image service rejected the API key. Set a valid \
    GEMINI_API_KEY (not expired, with the Generative Language API enabled for its project), \
    restart the service, then reprocess this photo.";

const SAFETY_MESSAGE: &str = "The image service blocked this photo for safety reasons. \
    Retake or replace the photo and try again.";

const PAUSED_MESSAGE: &str = "Paused";

/// Retry and backoff limits for the main generation path.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    /// Fixed wait after a transient failure (no image, stop reason, unknown).
    pub retry_delay: Duration,
    /// First wait after a rate-limit signal.
    pub rate_limit_base: Duration,
    /// Growth of the rate-limit wait per attempt.
    pub rate_limit_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            retry_delay: Duration::from_secs(3),
            rate_limit_base: Duration::from_secs(120),
            rate_limit_factor: 1.5,
        }
    }
}

impl RetryPolicy {
    /// `base × factor^(attempt-1)`, or the service's hint when that is longer.
    pub fn rate_limit_delay(&self, attempt: u32, hint: Option<Duration>) -> Duration {
        let exponent = attempt.saturating_sub(1) as i32;
        let backoff = self
            .rate_limit_base
            .mul_f64(self.rate_limit_factor.powi(exponent));
        match hint {
            Some(hint) if hint > backoff => hint,
            _ => backoff,
        }
    }
}

/// Everything a processor shares with its siblings in one run.
#[derive(Clone, Copy)]
pub struct RunContext<'a> {
    pub queue: &'a SharedQueue,
    pub control: &'a BatchControl,
    pub governor: &'a RateGovernor,
}

enum Step {
    Complete {
        image: ImageAsset,
        label: Option<String>,
    },
    Retry {
        delay: Duration,
        status: ItemStatus,
        message: String,
        reason: &'static str,
    },
    Fail(String),
}

/// Drives single items through the generation state machine.
///
/// Never returns an error: every outcome ends as a published snapshot, and
/// the returned item is the last one published.
pub struct ItemProcessor {
    service: Arc<dyn ImageService>,
    policy: RetryPolicy,
}

impl ItemProcessor {
    pub fn new(service: Arc<dyn ImageService>, policy: RetryPolicy) -> Self {
        Self { service, policy }
    }

    /// Background replacement with retries.
    ///
    /// Suspension points: the pause gate before each attempt, the rate gate,
    /// the service call, and the retry wait. Cancellation is honoured at the
    /// pause gate and the retry wait and returns the item to Pending.
    pub async fn process(&self, item: WorkItem, ctx: RunContext<'_>) -> WorkItem {
        let started = Instant::now();
        let mut item = item;
        info!(item_id = %item.id, "Processing item");

        loop {
            if !self.pause_gate(&mut item, ctx).await {
                return self.abandon(&item, ctx);
            }

            item = item.next_attempt();
            let attempt = item.attempts();
            item = ctx.queue.publish(item.mark_status(ItemStatus::Processing, None));

            ctx.governor.await_slot().await;
            debug!(item_id = %item.id, attempt, "Requesting background replacement");
            metrics::counter!("studio_generation_requests_total", "task" => "background")
                .increment(1);

            let outcome = self
                .service
                .generate(GenerationRequest {
                    task: GenerationTask::ReplaceBackground,
                    image: item.source.clone(),
                    reference: item.reference.clone(),
                })
                .await;

            match self.next_step(outcome, attempt) {
                Step::Complete { image, label } => {
                    let done = ctx.queue.publish(item.complete(image, label));
                    metrics::counter!("studio_items_completed_total").increment(1);
                    metrics::histogram!("studio_item_processing_seconds")
                        .record(started.elapsed().as_secs_f64());
                    info!(item_id = %done.id, attempts = attempt, "Item completed");
                    return done;
                }
                Step::Fail(message) => return self.fail(&item, message, ctx),
                Step::Retry {
                    delay,
                    status,
                    message,
                    reason,
                } => {
                    warn!(
                        item_id = %item.id,
                        attempt,
                        max_attempts = self.policy.max_attempts,
                        reason,
                        delay_ms = delay.as_millis() as u64,
                        "Generation attempt failed, retrying"
                    );
                    metrics::counter!("studio_generation_retries_total", "reason" => reason)
                        .increment(1);

                    if !self.pause_gate(&mut item, ctx).await {
                        return self.abandon(&item, ctx);
                    }
                    item = ctx.queue.publish(item.mark_status(status, Some(message)));
                    if !ctx.control.sleep(delay).await {
                        return self.abandon(&item, ctx);
                    }
                }
            }
        }
    }

    /// Single-attempt targeted edit. `claimed` is the Retouching snapshot
    /// already published by the caller and `input` the image to edit (see
    /// [`WorkItem::begin_edit`]).
    pub async fn retouch(
        &self,
        claimed: WorkItem,
        input: ImageAsset,
        instruction: String,
        ctx: RunContext<'_>,
    ) -> WorkItem {
        info!(item_id = %claimed.id, "Retouching item");
        self.single_shot(claimed, GenerationTask::Retouch { instruction }, input, None, ctx)
            .await
    }

    /// Single-attempt higher-fidelity render against the batch reference.
    /// `claimed` is the published Processing snapshot.
    pub async fn hero(&self, claimed: WorkItem, input: ImageAsset, ctx: RunContext<'_>) -> WorkItem {
        info!(item_id = %claimed.id, "Rendering hero shot");
        let reference = claimed.reference.clone();
        self.single_shot(claimed, GenerationTask::Hero, input, reference, ctx)
            .await
    }

    async fn single_shot(
        &self,
        item: WorkItem,
        task: GenerationTask,
        image: ImageAsset,
        reference: Option<ImageAsset>,
        ctx: RunContext<'_>,
    ) -> WorkItem {
        ctx.governor.await_slot().await;
        metrics::counter!("studio_generation_requests_total", "task" => task.name()).increment(1);

        let outcome = self
            .service
            .generate(GenerationRequest {
                task,
                image,
                reference,
            })
            .await;

        let message = match outcome {
            GenerationOutcome::Success { image, label } => {
                let done = ctx.queue.publish(item.complete(image, label));
                metrics::counter!("studio_items_completed_total").increment(1);
                info!(item_id = %done.id, "Edit completed");
                return done;
            }
            GenerationOutcome::InvalidCredential => CREDENTIAL_MESSAGE.to_string(),
            GenerationOutcome::SafetyBlocked => SAFETY_MESSAGE.to_string(),
            GenerationOutcome::RateLimited { .. } => {
                "Rate limit reached. Wait a minute, then try the edit again.".to_string()
            }
            GenerationOutcome::NoImage => {
                "The image service returned no image. Try the edit again.".to_string()
            }
            GenerationOutcome::Stopped { reason } => {
                format!("Generation stopped ({reason}). Try the edit again.")
            }
            GenerationOutcome::Other(detail) => format!("Edit failed: {detail}"),
        };
        self.fail(&item, message, ctx)
    }

    fn next_step(&self, outcome: GenerationOutcome, attempt: u32) -> Step {
        let max = self.policy.max_attempts;
        let exhausted = attempt >= max;

        match outcome {
            GenerationOutcome::Success { image, label } => Step::Complete { image, label },
            GenerationOutcome::InvalidCredential => Step::Fail(CREDENTIAL_MESSAGE.to_string()),
            GenerationOutcome::SafetyBlocked => Step::Fail(SAFETY_MESSAGE.to_string()),
            GenerationOutcome::RateLimited { .. } if exhausted => Step::Fail(format!(
                "Rate limit still exceeded after {max} attempts. Wait a few minutes, \
                 then reprocess this photo manually."
            )),
            GenerationOutcome::RateLimited { retry_after } => {
                let delay = self.policy.rate_limit_delay(attempt, retry_after);
                Step::Retry {
                    delay,
                    status: ItemStatus::Paused,
                    message: format!(
                        "Rate limit reached. Retrying in {}s (attempt {}/{max})",
                        delay.as_secs(),
                        attempt + 1
                    ),
                    reason: "rate_limited",
                }
            }
            transient if exhausted => Step::Fail(format!(
                "Generation failed after {max} attempts ({}). Reprocess this photo to try again.",
                describe_transient(&transient)
            )),
            transient => Step::Retry {
                delay: self.policy.retry_delay,
                status: ItemStatus::Processing,
                message: format!(
                    "{}. Retrying in {}s (attempt {}/{max})",
                    capitalize(&describe_transient(&transient)),
                    self.policy.retry_delay.as_secs(),
                    attempt + 1
                ),
                reason: transient.kind(),
            },
        }
    }

    /// Wait out a user pause. Publishes a Paused snapshot first when the flag
    /// is set. Returns `false` if the run was cancelled.
    async fn pause_gate(&self, item: &mut WorkItem, ctx: RunContext<'_>) -> bool {
        if ctx.control.is_cancelled() {
            return false;
        }
        if !ctx.control.is_paused() {
            return true;
        }
        debug!(item_id = %item.id, "Batch paused, holding item");
        *item = ctx
            .queue
            .publish(item.mark_status(ItemStatus::Paused, Some(PAUSED_MESSAGE.to_string())));
        ctx.control.wait_while_paused().await
    }

    fn fail(&self, item: &WorkItem, message: String, ctx: RunContext<'_>) -> WorkItem {
        warn!(item_id = %item.id, attempts = item.attempts(), error = %message, "Item failed");
        metrics::counter!("studio_items_failed_total").increment(1);
        ctx.queue
            .publish(item.mark_status(ItemStatus::Failed, Some(message)))
    }

    fn abandon(&self, item: &WorkItem, ctx: RunContext<'_>) -> WorkItem {
        info!(item_id = %item.id, "Run cancelled, returning item to pending");
        ctx.queue.publish(item.reset())
    }
}

fn describe_transient(outcome: &GenerationOutcome) -> String {
    match outcome {
        GenerationOutcome::NoImage => "no image returned".to_string(),
        GenerationOutcome::Stopped { reason } => format!("generation stopped: {reason}"),
        GenerationOutcome::Other(detail) => format!("service error: {detail}"),
        other => other.kind().replace('_', " "),
    }
}

fn capitalize(text: &str) -> String {
    let mut chars = text.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}
