//! HTTP surface: thin orchestration over the engine.
//!
//! Handlers authenticate the caller, validate request shape, call one engine
//! operation, and map failures onto transport status codes. No balance math
//! happens here.

pub mod auth;

use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use crate::engine::{Engine, EngineError, RechargeOutcome};
use crate::model::{Campaign, CampaignId, CutScenario, LedgerEntry, Role, UserAccount, UserId};
use crate::store::Store;
use auth::{AuthError, Identity, TokenVerifier, bearer_token};

/// Upper bound on request amounts (points, costs, campaign prices).
const MAX_AMOUNT: u64 = 1_000_000_000;

/// Shared router state.
pub struct AppState<S> {
    pub engine: Arc<Engine<S>>,
    pub verifier: Arc<dyn TokenVerifier>,
}

impl<S> Clone for AppState<S> {
    fn clone(&self) -> Self {
        Self {
            engine: self.engine.clone(),
            verifier: self.verifier.clone(),
        }
    }
}

/// Build the service router.
pub fn build_router<S: Store>(state: AppState<S>) -> Router {
    let api = Router::new()
        .route("/register", post(register::<S>))
        .route("/referral", post(referral::<S>))
        .route("/slash/start", post(slash_start::<S>))
        .route("/slash/help", post(slash_help::<S>))
        .route("/slash/:id", get(slash_view::<S>))
        .route("/points/consume", post(consume::<S>))
        .route("/account", get(account::<S>))
        .route("/account/ledger", get(account_ledger::<S>))
        .route("/admin/reward", post(admin_reward::<S>))
        .route("/admin/jobs/daily-bonus", post(job_daily_bonus::<S>))
        .route("/admin/jobs/update-levels", post(job_update_levels::<S>));

    Router::new()
        .route("/health", get(health))
        .route("/hooks/payment", post(payment_webhook::<S>))
        .nest("/api", api)
        .with_state(state)
}

/// Transport-facing error: a safe message plus the status it maps to.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn validation(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    fn forbidden(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::FORBIDDEN,
            message: message.into(),
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(ErrorBody {
                error: self.message,
            }),
        )
            .into_response()
    }
}

impl From<AuthError> for ApiError {
    fn from(err: AuthError) -> Self {
        Self {
            status: StatusCode::UNAUTHORIZED,
            message: err.to_string(),
        }
    }
}

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        let status = match &err {
            EngineError::AccountNotFound(_) | EngineError::CampaignNotFound(_) => {
                StatusCode::NOT_FOUND
            }
            EngineError::AlreadyRegistered(_)
            | EngineError::AlreadyInvited { .. }
            | EngineError::AlreadyHelped { .. }
            | EngineError::CampaignClosed(_)
            | EngineError::TransactionConflict => StatusCode::CONFLICT,
            EngineError::InsufficientBalance { .. } => StatusCode::PAYMENT_REQUIRED,
            EngineError::SelfInvite => StatusCode::BAD_REQUEST,
            EngineError::Upstream(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let message = match &err {
            EngineError::Upstream(reason) => {
                warn!(%reason, "upstream failure");
                "internal error".to_string()
            }
            _ => err.to_string(),
        };
        Self { status, message }
    }
}

async fn authenticate<S>(
    state: &AppState<S>,
    headers: &HeaderMap,
) -> Result<Identity, ApiError> {
    let token = bearer_token(headers)?;
    Ok(state.verifier.verify(token).await?)
}

async fn require_admin<S>(
    state: &AppState<S>,
    headers: &HeaderMap,
) -> Result<Identity, ApiError> {
    let identity = authenticate(state, headers).await?;
    if identity.role != Role::Admin {
        return Err(ApiError::forbidden("admin role required"));
    }
    Ok(identity)
}

fn parse_body<T>(body: Result<Json<T>, JsonRejection>) -> Result<T, ApiError> {
    body.map(|Json(value)| value)
        .map_err(|rejection| ApiError::validation(rejection.body_text()))
}

fn check_amount(amount: u64, what: &str) -> Result<(), ApiError> {
    if amount == 0 {
        return Err(ApiError::validation(format!("{what} must be positive")));
    }
    if amount > MAX_AMOUNT {
        return Err(ApiError::validation(format!("{what} too large")));
    }
    Ok(())
}

// --- handlers ---

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

#[derive(Deserialize)]
struct RegisterRequest {
    email: Option<String>,
}

async fn register<S: Store>(
    State(state): State<AppState<S>>,
    headers: HeaderMap,
    body: Option<Json<RegisterRequest>>,
) -> Result<Json<UserAccount>, ApiError> {
    let who = authenticate(&state, &headers).await?;
    let email = body.and_then(|Json(request)| request.email);
    let account = state.engine.register(&who.uid, email).await?;
    Ok(Json(account))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReferralRequest {
    invitee_id: UserId,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ReferralResponse {
    inviter_reward: u64,
    invitee_reward: u64,
}

async fn referral<S: Store>(
    State(state): State<AppState<S>>,
    headers: HeaderMap,
    body: Result<Json<ReferralRequest>, JsonRejection>,
) -> Result<Json<ReferralResponse>, ApiError> {
    let who = authenticate(&state, &headers).await?;
    let request = parse_body(body)?;
    if request.invitee_id.is_empty() {
        return Err(ApiError::validation("inviteeId is required"));
    }
    let receipt = state.engine.referral(&who.uid, &request.invitee_id).await?;
    Ok(Json(ReferralResponse {
        inviter_reward: receipt.inviter_reward,
        invitee_reward: receipt.invitee_reward,
    }))
}

#[derive(Deserialize)]
struct SlashStartRequest {
    amount: Option<u64>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SlashStartResponse {
    campaign_id: CampaignId,
    original_price: u64,
    target_price: u64,
    share_link: String,
}

async fn slash_start<S: Store>(
    State(state): State<AppState<S>>,
    headers: HeaderMap,
    body: Option<Json<SlashStartRequest>>,
) -> Result<Json<SlashStartResponse>, ApiError> {
    let who = authenticate(&state, &headers).await?;
    // A missing or zero amount falls back to the stock campaign price.
    let amount = body
        .and_then(|Json(request)| request.amount)
        .filter(|&amount| amount > 0)
        .unwrap_or(100);
    check_amount(amount, "amount")?;

    let receipt = state.engine.start_campaign(&who.uid, amount).await?;
    Ok(Json(SlashStartResponse {
        campaign_id: receipt.campaign_id,
        original_price: receipt.original_price,
        target_price: receipt.target_price,
        share_link: format!("/slash/{}", receipt.campaign_id),
    }))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SlashHelpRequest {
    campaign_id: CampaignId,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SlashHelpResponse {
    campaign_id: CampaignId,
    scenario: CutScenario,
    new_price: u64,
    helper_reward: u64,
}

async fn slash_help<S: Store>(
    State(state): State<AppState<S>>,
    headers: HeaderMap,
    body: Result<Json<SlashHelpRequest>, JsonRejection>,
) -> Result<Json<SlashHelpResponse>, ApiError> {
    let who = authenticate(&state, &headers).await?;
    let request = parse_body(body)?;
    let receipt = state
        .engine
        .help_cut(&request.campaign_id, &who.uid)
        .await?;
    Ok(Json(SlashHelpResponse {
        campaign_id: request.campaign_id,
        scenario: receipt.scenario,
        new_price: receipt.new_price,
        helper_reward: receipt.helper_reward,
    }))
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SlashViewResponse {
    campaign_id: CampaignId,
    #[serde(flatten)]
    campaign: Campaign,
}

async fn slash_view<S: Store>(
    State(state): State<AppState<S>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<SlashViewResponse>, ApiError> {
    authenticate(&state, &headers).await?;
    let campaign_id =
        Uuid::parse_str(&id).map_err(|_| ApiError::validation("invalid campaign id"))?;
    let campaign = state.engine.campaign(&campaign_id).await?;
    Ok(Json(SlashViewResponse {
        campaign_id,
        campaign,
    }))
}

#[derive(Deserialize)]
struct ConsumeRequest {
    cost: u64,
    feature: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct BalanceResponse {
    new_balance: u64,
}

async fn consume<S: Store>(
    State(state): State<AppState<S>>,
    headers: HeaderMap,
    body: Result<Json<ConsumeRequest>, JsonRejection>,
) -> Result<Json<BalanceResponse>, ApiError> {
    let who = authenticate(&state, &headers).await?;
    let request = parse_body(body)?;
    check_amount(request.cost, "cost")?;
    if request.feature.is_empty() {
        return Err(ApiError::validation("feature is required"));
    }
    let receipt = state
        .engine
        .consume(&who.uid, request.cost, &request.feature)
        .await?;
    Ok(Json(BalanceResponse {
        new_balance: receipt.new_balance,
    }))
}

async fn account<S: Store>(
    State(state): State<AppState<S>>,
    headers: HeaderMap,
) -> Result<Json<UserAccount>, ApiError> {
    let who = authenticate(&state, &headers).await?;
    Ok(Json(state.engine.account(&who.uid).await?))
}

async fn account_ledger<S: Store>(
    State(state): State<AppState<S>>,
    headers: HeaderMap,
) -> Result<Json<Vec<LedgerEntry>>, ApiError> {
    let who = authenticate(&state, &headers).await?;
    Ok(Json(state.engine.ledger(&who.uid).await?))
}

#[derive(Deserialize)]
struct AdminRewardRequest {
    uid: UserId,
    amount: u64,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct AdminRewardResponse {
    success: bool,
    new_balance: u64,
}

async fn admin_reward<S: Store>(
    State(state): State<AppState<S>>,
    headers: HeaderMap,
    body: Result<Json<AdminRewardRequest>, JsonRejection>,
) -> Result<Json<AdminRewardResponse>, ApiError> {
    require_admin(&state, &headers).await?;
    let request = parse_body(body)?;
    if request.uid.is_empty() {
        return Err(ApiError::validation("uid is required"));
    }
    check_amount(request.amount, "amount")?;
    let receipt = state.engine.grant(&request.uid, request.amount).await?;
    Ok(Json(AdminRewardResponse {
        success: true,
        new_balance: receipt.new_balance,
    }))
}

#[derive(Serialize)]
struct JobResponse {
    processed: usize,
}

async fn job_daily_bonus<S: Store>(
    State(state): State<AppState<S>>,
    headers: HeaderMap,
) -> Result<Json<JobResponse>, ApiError> {
    require_admin(&state, &headers).await?;
    let processed = state.engine.daily_bonus().await?;
    Ok(Json(JobResponse { processed }))
}

async fn job_update_levels<S: Store>(
    State(state): State<AppState<S>>,
    headers: HeaderMap,
) -> Result<Json<JobResponse>, ApiError> {
    require_admin(&state, &headers).await?;
    let processed = state.engine.update_levels().await?;
    Ok(Json(JobResponse { processed }))
}

// --- payment webhook ---

#[derive(Deserialize)]
struct PaymentEvent {
    #[serde(default)]
    id: Option<String>,
    #[serde(rename = "type")]
    event_type: String,
    #[serde(default)]
    data: Option<PaymentEventData>,
}

#[derive(Deserialize)]
struct PaymentEventData {
    object: PaymentObject,
}

#[derive(Deserialize)]
struct PaymentObject {
    #[serde(default)]
    metadata: Option<PaymentMetadata>,
}

#[derive(Deserialize)]
struct PaymentMetadata {
    uid: UserId,
    points: serde_json::Value,
}

#[derive(Serialize)]
struct WebhookResponse {
    received: bool,
}

/// Payment processors send metadata values as strings; tolerate numbers too.
fn parse_points(value: &serde_json::Value) -> Option<u64> {
    match value {
        serde_json::Value::String(s) => s.parse().ok(),
        serde_json::Value::Number(n) => n.as_u64(),
        _ => None,
    }
}

async fn payment_webhook<S: Store>(
    State(state): State<AppState<S>>,
    body: Result<Json<PaymentEvent>, JsonRejection>,
) -> Result<Json<WebhookResponse>, ApiError> {
    let event = parse_body(body)?;
    if event.event_type != "checkout.session.completed" {
        return Ok(Json(WebhookResponse { received: true }));
    }

    let metadata = event
        .data
        .and_then(|data| data.object.metadata)
        .ok_or_else(|| ApiError::validation("missing checkout metadata"))?;
    let points = parse_points(&metadata.points)
        .ok_or_else(|| ApiError::validation("invalid points value"))?;
    check_amount(points, "points")?;

    // Duplicate deliveries are acknowledged the same as first deliveries.
    let _: RechargeOutcome = state
        .engine
        .recharge(&metadata.uid, points, event.id.as_deref())
        .await?;
    Ok(Json(WebhookResponse { received: true }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status_for(err: EngineError) -> StatusCode {
        ApiError::from(err).status
    }

    #[test]
    fn engine_errors_map_to_expected_statuses() {
        assert_eq!(
            status_for(EngineError::AccountNotFound("x".to_string())),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            status_for(EngineError::AlreadyInvited {
                inviter: "a".to_string(),
                invitee: "b".to_string(),
            }),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status_for(EngineError::InsufficientBalance {
                user: "a".to_string(),
                have: 5,
                need: 10,
            }),
            StatusCode::PAYMENT_REQUIRED
        );
        assert_eq!(
            status_for(EngineError::TransactionConflict),
            StatusCode::CONFLICT
        );
        assert_eq!(status_for(EngineError::SelfInvite), StatusCode::BAD_REQUEST);
        assert_eq!(
            status_for(EngineError::Upstream("db down".to_string())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn upstream_details_are_not_leaked() {
        let err = ApiError::from(EngineError::Upstream("secret dsn".to_string()));
        assert_eq!(err.message, "internal error");
    }

    #[test]
    fn parse_points_accepts_strings_and_numbers() {
        assert_eq!(parse_points(&serde_json::json!("500")), Some(500));
        assert_eq!(parse_points(&serde_json::json!(500)), Some(500));
        assert_eq!(parse_points(&serde_json::json!("abc")), None);
        assert_eq!(parse_points(&serde_json::json!(-5)), None);
        assert_eq!(parse_points(&serde_json::json!(null)), None);
    }
}
