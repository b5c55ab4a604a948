//! HTTP routes

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post, put},
    Json, Router,
};
use chrono::Utc;
use netbill_billing::{
    CheckoutSummary, Invoice, InvoiceLedger, ReconciliationAdapter, Transition,
    CALLBACK_SIGNATURE_HEADER,
};
use netbill_common::{InvoiceId, Profile, ProfileCatalog, ProfileDraft, ProfileId, ProfileRepository};
use netbill_enforcement::{FailureLog, FailureRecord};
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::error::{ApiError, ApiResult};
use crate::models::{
    ApiResponse, CallbackAck, CheckoutRequest, FailureQuery, HealthResponse, MethodOffer,
    StatusOverride,
};

/// Shared handler state
#[derive(Clone)]
pub struct AppState {
    pub ledger: Arc<InvoiceLedger>,
    pub adapter: Arc<ReconciliationAdapter>,
    pub catalog: Arc<ProfileCatalog>,
    pub profiles: Arc<dyn ProfileRepository>,
    pub failures: Arc<FailureLog>,
}

/// Build the application router
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/payments/callback", post(payment_callback))
        .route("/api/invoices/:id", get(get_invoice))
        .route("/api/invoices/:id/methods", get(list_methods))
        .route("/api/invoices/:id/checkout", post(checkout))
        .route("/api/invoices/:id/cancel", post(cancel_invoice))
        .route("/api/invoices/:id/status", put(override_status))
        .route("/api/profiles", get(list_profiles).post(create_profile))
        .route("/api/profiles/:id", put(update_profile).delete(delete_profile))
        .route("/api/enforcement/failures", get(list_failures))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    Json(ApiResponse::success(HealthResponse {
        status: "healthy".into(),
        version: env!("CARGO_PKG_VERSION").into(),
        timestamp: Utc::now().to_rfc3339(),
    }))
}

/// Gateway callback; the signature covers the raw body
async fn payment_callback(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Json<ApiResponse<CallbackAck>>> {
    let signature = headers
        .get(CALLBACK_SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ApiError::validation("missing callback signature"))?;

    let outcome = state.adapter.handle_callback(&body, signature).await?;
    info!(
        reference = %outcome.reference,
        status = %outcome.status,
        replayed = outcome.replayed,
        "payment callback processed"
    );
    Ok(Json(ApiResponse::success(outcome.into())))
}

async fn get_invoice(
    State(state): State<AppState>,
    Path(id): Path<u64>,
) -> ApiResult<Json<ApiResponse<Invoice>>> {
    let invoice = state.ledger.get(InvoiceId(id), Utc::now()).await?;
    Ok(Json(ApiResponse::success(invoice)))
}

async fn list_methods(
    State(state): State<AppState>,
    Path(id): Path<u64>,
) -> ApiResult<Json<ApiResponse<Vec<MethodOffer>>>> {
    let offers = state.adapter.offered_methods(InvoiceId(id)).await?;
    Ok(Json(ApiResponse::success(offers.into_iter().map(MethodOffer::from).collect())))
}

async fn checkout(
    State(state): State<AppState>,
    Path(id): Path<u64>,
    Json(request): Json<CheckoutRequest>,
) -> ApiResult<Json<ApiResponse<CheckoutSummary>>> {
    let summary = state.adapter.create_payment(InvoiceId(id), &request.method).await?;
    Ok(Json(ApiResponse::success(summary)))
}

async fn cancel_invoice(
    State(state): State<AppState>,
    Path(id): Path<u64>,
) -> ApiResult<Json<ApiResponse<Transition>>> {
    let transition = state.ledger.cancel(InvoiceId(id)).await?;
    Ok(Json(ApiResponse::success(transition)))
}

async fn override_status(
    State(state): State<AppState>,
    Path(id): Path<u64>,
    Json(request): Json<StatusOverride>,
) -> ApiResult<Json<ApiResponse<Transition>>> {
    let transition = state
        .ledger
        .override_status(InvoiceId(id), request.status, Utc::now())
        .await?;
    Ok(Json(ApiResponse::success(transition)))
}

async fn list_profiles(State(state): State<AppState>) -> ApiResult<Json<ApiResponse<Vec<Profile>>>> {
    let mut profiles = state.profiles.list().await?;
    profiles.sort_by_key(|p| p.id);
    Ok(Json(ApiResponse::success(profiles)))
}

async fn create_profile(
    State(state): State<AppState>,
    Json(draft): Json<ProfileDraft>,
) -> ApiResult<(StatusCode, Json<ApiResponse<Profile>>)> {
    let profile = state.catalog.create(draft).await?;
    Ok((StatusCode::CREATED, Json(ApiResponse::success(profile))))
}

async fn update_profile(
    State(state): State<AppState>,
    Path(id): Path<u64>,
    Json(draft): Json<ProfileDraft>,
) -> ApiResult<Json<ApiResponse<Profile>>> {
    let profile = state.catalog.update(ProfileId(id), draft).await?;
    Ok(Json(ApiResponse::success(profile)))
}

async fn delete_profile(State(state): State<AppState>, Path(id): Path<u64>) -> ApiResult<StatusCode> {
    state.catalog.delete(ProfileId(id)).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn list_failures(
    State(state): State<AppState>,
    Query(query): Query<FailureQuery>,
) -> Json<ApiResponse<Vec<FailureRecord>>> {
    Json(ApiResponse::success(state.failures.recent(query.limit)))
}
