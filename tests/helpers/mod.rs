//! Test helper utilities for pipeline and route scenarios
#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::Instant;
use vehicle_studio_pipeline::models::item::{ImageAsset, ItemStatus, ItemUpdate};
use vehicle_studio_pipeline::services::generator::{
    GenerationOutcome, GenerationRequest, GenerationTask, ImageService, ServiceError,
};

use crate::fixtures;

/// One observed generation call.
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub started: Instant,
    pub task: GenerationTask,
    pub had_reference: bool,
}

/// Image service double. Answers from a script, then from a fallback, after
/// an optional simulated latency. Tracks how many calls overlap.
pub struct MockImageService {
    script: Mutex<VecDeque<GenerationOutcome>>,
    fallback: GenerationOutcome,
    latency: Duration,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
    calls: Mutex<Vec<RecordedCall>>,
}

pub fn success() -> GenerationOutcome {
    GenerationOutcome::Success {
        image: fixtures::generated_image(),
        label: None,
    }
}

pub fn quota_exceeded() -> GenerationOutcome {
    GenerationOutcome::RateLimited { retry_after: None }
}

impl MockImageService {
    pub fn always(fallback: GenerationOutcome) -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            fallback,
            latency: Duration::ZERO,
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn succeeding() -> Self {
        Self::always(success())
    }

    /// Answer with `script` in call order, then with `fallback`.
    pub fn scripted(script: Vec<GenerationOutcome>, fallback: GenerationOutcome) -> Self {
        let service = Self::always(fallback);
        *service.script.lock() = script.into();
        service
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn into_arc(self) -> Arc<Self> {
        Arc::new(self)
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    /// Gaps between consecutive call start times.
    pub fn gaps(&self) -> Vec<Duration> {
        self.calls()
            .windows(2)
            .map(|w| w[1].started - w[0].started)
            .collect()
    }
}

#[async_trait]
impl ImageService for MockImageService {
    async fn generate(&self, request: GenerationRequest) -> GenerationOutcome {
        self.calls.lock().push(RecordedCall {
            started: Instant::now(),
            task: request.task.clone(),
            had_reference: request.reference.is_some(),
        });
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        let scripted = self.script.lock().pop_front();
        scripted.unwrap_or_else(|| self.fallback.clone())
    }

    async fn describe(&self, _image: &ImageAsset) -> Result<String, ServiceError> {
        Ok("Front Three-Quarter".to_string())
    }
}

/// Everything currently buffered on an event stream.
pub fn drain(events: &mut UnboundedReceiver<ItemUpdate>) -> Vec<ItemUpdate> {
    let mut updates = Vec::new();
    while let Ok(update) = events.try_recv() {
        updates.push(update);
    }
    updates
}

pub fn count_status(updates: &[ItemUpdate], status: ItemStatus) -> usize {
    updates
        .iter()
        .filter(|u| u.snapshot.status == status)
        .count()
}

pub fn approx_eq(actual: Duration, expected: Duration, tolerance: Duration) -> bool {
    let diff = if actual > expected {
        actual - expected
    } else {
        expected - actual
    };
    diff <= tolerance
}

pub const MULTIPART_BOUNDARY: &str = "studio-test-boundary";

/// `multipart/form-data` body with one part per `(field, bytes)` pair.
pub fn multipart_body(parts: &[(&str, Vec<u8>)]) -> Vec<u8> {
    let mut body = Vec::new();
    for (i, (name, bytes)) in parts.iter().enumerate() {
        body.extend_from_slice(
            format!(
                "--{MULTIPART_BOUNDARY}\r\n\
                 Content-Disposition: form-data; name=\"{name}\"; filename=\"upload-{i}\"\r\n\
                 Content-Type: application/octet-stream\r\n\r\n"
            )
            .as_bytes(),
        );
        body.extend_from_slice(bytes);
        body.extend_from_slice(b"\r\n");
    }
    body.extend_from_slice(format!("--{MULTIPART_BOUNDARY}--\r\n").as_bytes());
    body
}
