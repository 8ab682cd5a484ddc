use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use std::sync::Arc;
use uuid::Uuid;

use crate::admin::{Admin, CampaignReport, CancelReport};
use crate::campaigns::{CampaignJob, CampaignLog, CampaignStore, DeliveryOutcome, DeliveryRecord, NewCampaign};
use crate::enqueuer::Enqueuer;
use crate::error::{AdminError, EnqueueError, InfraError, ValidationError};

pub mod models;

use models::{
    CreatedCampaign, ErrorBody, ListCampaignsQuery, ListDeliveriesQuery, RateResponse,
    RequeueRequest, SetRateRequest,
};

#[derive(Clone)]
pub struct ApiState {
    pub store: Arc<dyn CampaignStore>,
    pub enqueuer: Arc<Enqueuer>,
    pub admin: Arc<Admin>,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/campaigns", get(list_campaigns).post(create_campaign))
        .route("/campaigns/:id", get(get_campaign))
        .route("/campaigns/:id/cancel", post(cancel_campaign))
        .route("/campaigns/:id/requeue", post(requeue_campaign))
        .route("/campaigns/:id/deliveries", get(list_deliveries))
        .route("/campaigns/:id/logs", get(list_logs))
        .route("/tenants/:id/rate", put(set_rate))
        .route("/health", get(health))
        .with_state(state)
}

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    Admin(AdminError),
    Enqueue(EnqueueError),
    Infra(InfraError),
}

impl From<AdminError> for ApiError {
    fn from(e: AdminError) -> Self {
        ApiError::Admin(e)
    }
}

impl From<EnqueueError> for ApiError {
    fn from(e: EnqueueError) -> Self {
        ApiError::Enqueue(e)
    }
}

impl From<InfraError> for ApiError {
    fn from(e: InfraError) -> Self {
        ApiError::Infra(e)
    }
}

fn validation_status(e: &ValidationError) -> StatusCode {
    match e {
        ValidationError::CampaignNotFound(_) => StatusCode::NOT_FOUND,
        _ => StatusCode::UNPROCESSABLE_ENTITY,
    }
}

fn enqueue_status(e: &EnqueueError) -> StatusCode {
    match e {
        EnqueueError::Validation { source, .. } => validation_status(source),
        EnqueueError::PartialPublish { .. } => StatusCode::SERVICE_UNAVAILABLE,
        EnqueueError::Infra(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, campaign_id) = match &self {
            ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, None),
            ApiError::Admin(AdminError::NotFound(id)) => (StatusCode::NOT_FOUND, Some(*id)),
            ApiError::Admin(AdminError::AlreadyFinished(_)) => (StatusCode::CONFLICT, None),
            ApiError::Admin(AdminError::Validation(v)) => (validation_status(v), None),
            ApiError::Admin(AdminError::Enqueue(e)) | ApiError::Enqueue(e) => {
                (enqueue_status(e), e.campaign_id())
            }
            ApiError::Admin(AdminError::Infra(_)) | ApiError::Infra(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, None)
            }
        };

        let error = match &self {
            ApiError::BadRequest(msg) => msg.clone(),
            ApiError::Admin(e) => e.to_string(),
            ApiError::Enqueue(e) => e.to_string(),
            ApiError::Infra(e) => format!("internal error: {e}"),
        };
        if status.is_server_error() {
            tracing::error!(%status, error = %error, "admin api request failed");
        }

        (status, Json(ErrorBody { error, campaign_id })).into_response()
    }
}

pub async fn create_campaign(
    State(state): State<ApiState>,
    Json(body): Json<NewCampaign>,
) -> Result<(StatusCode, Json<CreatedCampaign>), ApiError> {
    let job = state.enqueuer.create_campaign(body).await?;
    Ok((StatusCode::CREATED, Json(CreatedCampaign::from(&job))))
}

pub async fn list_campaigns(
    State(state): State<ApiState>,
    Query(q): Query<ListCampaignsQuery>,
) -> Result<Json<Vec<CampaignJob>>, ApiError> {
    let items = state
        .store
        .list_campaigns(q.tenant_id, q.limit.unwrap_or(100))
        .await?;
    Ok(Json(items))
}

pub async fn get_campaign(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
) -> Result<Json<CampaignReport>, ApiError> {
    Ok(Json(state.admin.campaign_report(id).await?))
}

pub async fn cancel_campaign(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
) -> Result<Json<CancelReport>, ApiError> {
    Ok(Json(state.admin.cancel_campaign(id).await?))
}

pub async fn requeue_campaign(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
    Json(body): Json<RequeueRequest>,
) -> Result<(StatusCode, Json<CreatedCampaign>), ApiError> {
    let job = state.admin.requeue(id, body.scope, body.template_id).await?;
    Ok((StatusCode::CREATED, Json(CreatedCampaign::from(&job))))
}

pub async fn list_deliveries(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
    Query(q): Query<ListDeliveriesQuery>,
) -> Result<Json<Vec<DeliveryRecord>>, ApiError> {
    let outcome = match q.outcome.as_deref() {
        None => None,
        Some(s) => Some(
            DeliveryOutcome::parse(s)
                .ok_or_else(|| ApiError::BadRequest(format!("unknown outcome {s:?}")))?,
        ),
    };
    let limit = q.limit.unwrap_or(100).clamp(1, 1000);
    Ok(Json(state.store.list_deliveries(id, outcome, limit).await?))
}

pub async fn list_logs(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Vec<CampaignLog>>, ApiError> {
    Ok(Json(state.store.list_logs(id).await?))
}

pub async fn set_rate(
    State(state): State<ApiState>,
    Path(tenant_id): Path<Uuid>,
    Json(body): Json<SetRateRequest>,
) -> Result<Json<RateResponse>, ApiError> {
    let messages_per_second = state
        .admin
        .set_messages_per_second(tenant_id, body.messages_per_second)
        .await?;
    Ok(Json(RateResponse {
        tenant_id,
        messages_per_second,
    }))
}

pub async fn health() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}
