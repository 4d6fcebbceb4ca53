use axum::extract::{Multipart, Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use garde::Validate;
use serde::Serialize;
use uuid::Uuid;

use crate::app_state::AppState;
use crate::models::batch::{
    BatchStatusResponse, ItemView, RejectedImage, RetouchRequest, SubmitResponse,
};
use crate::models::item::{ImageAsset, WorkItem};
use crate::services::queue::QueueError;
use crate::services::scheduler::{BatchHandle, PipelineError};
use crate::services::validation::{self, ValidationError};

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

/// Handler error rendered as `{ "error": … }` with a matching status.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(ErrorResponse {
            error: self.message,
        });
        (self.status, body).into_response()
    }
}

impl From<ValidationError> for ApiError {
    fn from(e: ValidationError) -> Self {
        Self::new(validation_status(&e), e.to_string())
    }
}

impl From<PipelineError> for ApiError {
    fn from(e: PipelineError) -> Self {
        Self::new(pipeline_status(&e), e.to_string())
    }
}

fn validation_status(error: &ValidationError) -> StatusCode {
    match error {
        ValidationError::TooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
        ValidationError::UnsupportedFormat(_) | ValidationError::Unrecognized => {
            StatusCode::UNSUPPORTED_MEDIA_TYPE
        }
        ValidationError::Empty | ValidationError::TooSmall { .. } => StatusCode::BAD_REQUEST,
    }
}

fn pipeline_status(error: &PipelineError) -> StatusCode {
    match error {
        PipelineError::UnknownItem(_) => StatusCode::NOT_FOUND,
        PipelineError::InvalidState { .. }
        | PipelineError::Queue(QueueError::Busy { .. })
        | PipelineError::BatchClosed(_) => StatusCode::CONFLICT,
        PipelineError::EmptyInstruction => StatusCode::UNPROCESSABLE_ENTITY,
        PipelineError::Aborted(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn find_batch(state: &AppState, batch_id: Uuid) -> Result<BatchHandle, ApiError> {
    state
        .batch(batch_id)
        .ok_or_else(|| ApiError::not_found(format!("Batch {batch_id} not found")))
}

/// Images and an optional reference read from a multipart upload.
struct Upload {
    items: Vec<WorkItem>,
    reference: Option<ImageAsset>,
    rejected: Vec<RejectedImage>,
}

impl Upload {
    fn summary(&self, accepted: usize, verb: &str) -> String {
        match self.rejected.len() {
            0 => format!("{accepted} photo(s) {verb}"),
            n => format!("{accepted} photo(s) {verb}, {n} rejected"),
        }
    }
}

/// Every part is validated before anything is handed to the scheduler. Bad
/// images are reported per field; the request only fails when no image
/// passes or the reference itself is invalid.
async fn read_upload(mut multipart: Multipart) -> Result<Upload, ApiError> {
    let mut items = Vec::new();
    let mut reference = None;
    let mut rejected = Vec::new();
    let mut first_error: Option<ValidationError> = None;
    let mut index = 0;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::new(StatusCode::BAD_REQUEST, e.body_text()))?
    {
        let name = field.name().map(str::to_owned);
        let data = field
            .bytes()
            .await
            .map_err(|e| ApiError::new(StatusCode::BAD_REQUEST, e.body_text()))?;

        match name.as_deref() {
            Some("image") => {
                match WorkItem::from_upload(data.to_vec()) {
                    Ok(item) => items.push(item),
                    Err(e) => {
                        tracing::debug!(index, error = %e, "Rejected uploaded image");
                        rejected.push(RejectedImage {
                            index,
                            error: e.to_string(),
                        });
                        if first_error.is_none() {
                            first_error = Some(e);
                        }
                    }
                }
                index += 1;
            }
            Some("reference") => reference = Some(validation::validate_reference(data.to_vec())?),
            _ => tracing::debug!(field = ?name, "Ignoring unknown multipart field"),
        }
    }

    if items.is_empty() {
        return Err(match first_error {
            Some(e) => {
                let details: Vec<String> = rejected
                    .iter()
                    .map(|r| format!("image {}: {}", r.index, r.error))
                    .collect();
                ApiError::new(validation_status(&e), details.join("; "))
            }
            None => ApiError::new(
                StatusCode::BAD_REQUEST,
                "At least one 'image' field is required",
            ),
        });
    }
    Ok(Upload {
        items,
        reference,
        rejected,
    })
}

/// POST /api/v1/batches: start a batch run from uploaded photos.
pub async fn create_batch(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<(StatusCode, Json<SubmitResponse>), ApiError> {
    let mut upload = read_upload(multipart).await?;
    let items = std::mem::take(&mut upload.items);
    let count = items.len();

    let (handle, events) = state.scheduler.run(items, upload.reference.take())?;
    let batch_id = handle.id();
    let item_ids = handle.items().iter().map(|i| i.id).collect();
    state.register(handle, events);

    tracing::info!(
        batch_id = %batch_id,
        items = count,
        rejected = upload.rejected.len(),
        "Batch submitted"
    );

    Ok((
        StatusCode::ACCEPTED,
        Json(SubmitResponse {
            batch_id,
            item_ids,
            message: upload.summary(count, "queued for processing"),
            rejected: upload.rejected,
        }),
    ))
}

/// POST /api/v1/batches/{batch_id}/items: add photos to a running batch.
pub async fn add_items(
    State(state): State<AppState>,
    Path(batch_id): Path<Uuid>,
    multipart: Multipart,
) -> Result<(StatusCode, Json<SubmitResponse>), ApiError> {
    let handle = find_batch(&state, batch_id)?;
    let mut upload = read_upload(multipart).await?;
    if upload.reference.is_some() {
        tracing::debug!(batch_id = %batch_id, "Reference ignored for incremental submission");
    }

    let item_ids = handle.submit(std::mem::take(&mut upload.items))?;
    Ok((
        StatusCode::ACCEPTED,
        Json(SubmitResponse {
            batch_id,
            message: upload.summary(item_ids.len(), "added"),
            item_ids,
            rejected: upload.rejected,
        }),
    ))
}

/// GET /api/v1/batches/{batch_id}: progress and per-item status.
pub async fn get_batch(
    State(state): State<AppState>,
    Path(batch_id): Path<Uuid>,
) -> Result<Json<BatchStatusResponse>, ApiError> {
    let handle = find_batch(&state, batch_id)?;
    let items = handle.items();

    Ok(Json(BatchStatusResponse {
        batch_id,
        paused: handle.is_paused(),
        progress: handle.progress(),
        items: items.iter().map(ItemView::from).collect(),
    }))
}

/// POST /api/v1/batches/{batch_id}/pause
pub async fn pause_batch(
    State(state): State<AppState>,
    Path(batch_id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    find_batch(&state, batch_id)?.pause();
    Ok(StatusCode::NO_CONTENT)
}

/// POST /api/v1/batches/{batch_id}/resume
pub async fn resume_batch(
    State(state): State<AppState>,
    Path(batch_id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    find_batch(&state, batch_id)?.resume();
    Ok(StatusCode::NO_CONTENT)
}

/// POST /api/v1/batches/{batch_id}/cancel
pub async fn cancel_batch(
    State(state): State<AppState>,
    Path(batch_id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    find_batch(&state, batch_id)?.cancel();
    Ok(StatusCode::NO_CONTENT)
}

/// DELETE /api/v1/batches/{batch_id}: cancel the run and forget it.
pub async fn delete_batch(
    State(state): State<AppState>,
    Path(batch_id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    let handle = state
        .remove(batch_id)
        .ok_or_else(|| ApiError::not_found(format!("Batch {batch_id} not found")))?;
    handle.cancel();
    tracing::info!(batch_id = %batch_id, "Batch deleted");
    Ok(StatusCode::NO_CONTENT)
}

/// POST /api/v1/batches/{batch_id}/items/{item_id}/reprocess
pub async fn reprocess_item(
    State(state): State<AppState>,
    Path((batch_id, item_id)): Path<(Uuid, Uuid)>,
) -> Result<StatusCode, ApiError> {
    find_batch(&state, batch_id)?.reprocess(item_id)?;
    Ok(StatusCode::ACCEPTED)
}

/// POST /api/v1/batches/{batch_id}/items/{item_id}/retouch
pub async fn retouch_item(
    State(state): State<AppState>,
    Path((batch_id, item_id)): Path<(Uuid, Uuid)>,
    Json(request): Json<RetouchRequest>,
) -> Result<StatusCode, ApiError> {
    request
        .validate()
        .map_err(|e| ApiError::new(StatusCode::UNPROCESSABLE_ENTITY, e.to_string()))?;
    find_batch(&state, batch_id)?.retouch(item_id, &request.instruction)?;
    Ok(StatusCode::ACCEPTED)
}

/// POST /api/v1/batches/{batch_id}/items/{item_id}/hero
pub async fn hero_item(
    State(state): State<AppState>,
    Path((batch_id, item_id)): Path<(Uuid, Uuid)>,
) -> Result<StatusCode, ApiError> {
    find_batch(&state, batch_id)?.hero(item_id)?;
    Ok(StatusCode::ACCEPTED)
}

/// GET /api/v1/batches/{batch_id}/items/{item_id}/result: processed image bytes.
pub async fn get_result(
    State(state): State<AppState>,
    Path((batch_id, item_id)): Path<(Uuid, Uuid)>,
) -> Result<impl IntoResponse, ApiError> {
    let item = find_batch(&state, batch_id)?
        .item(item_id)
        .ok_or_else(|| ApiError::not_found(format!("Item {item_id} not found")))?;
    let result = item.result().cloned().ok_or_else(|| {
        ApiError::not_found(format!(
            "Item {item_id} has no result (status {})",
            item.status
        ))
    })?;

    Ok((
        [(header::CONTENT_TYPE, result.mime().to_string())],
        result.bytes().to_vec(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::item::ItemStatus;

    #[test]
    fn test_validation_errors_map_to_client_statuses() {
        assert_eq!(
            validation_status(&ValidationError::TooLarge { size: 2, limit: 1 }),
            StatusCode::PAYLOAD_TOO_LARGE
        );
        assert_eq!(
            validation_status(&ValidationError::Unrecognized),
            StatusCode::UNSUPPORTED_MEDIA_TYPE
        );
        assert_eq!(
            validation_status(&ValidationError::TooSmall { size: 1, minimum: 2 }),
            StatusCode::BAD_REQUEST
        );
    }

    #[test]
    fn test_pipeline_errors_map_to_statuses() {
        let id = Uuid::new_v4();
        assert_eq!(pipeline_status(&PipelineError::UnknownItem(id)), StatusCode::NOT_FOUND);
        assert_eq!(
            pipeline_status(&PipelineError::InvalidState {
                item_id: id,
                status: ItemStatus::Processing
            }),
            StatusCode::CONFLICT
        );
        assert_eq!(
            pipeline_status(&PipelineError::Queue(QueueError::Busy {
                item_id: id,
                status: ItemStatus::Queued
            })),
            StatusCode::CONFLICT
        );
        assert_eq!(
            pipeline_status(&PipelineError::EmptyInstruction),
            StatusCode::UNPROCESSABLE_ENTITY
        );
    }
}
