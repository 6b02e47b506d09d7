#![deny(unsafe_code)]

use axum::async_trait;
use axum::extract::{FromRequestParts, Path, Query, State};
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use propdesk_core::{
    Assignment, BankDraft, BankPatch, BranchDraft, BranchPatch, FormDraft, FormPatch, NewRequest,
    NewUser, Propdesk, PropdeskConfig, PropdeskError, StatusUpdate, UserPatch, WalletReceipt,
};
use propdesk_storage::{RequestFilter, UserFilter};
use propdesk_types::{
    Bank, BankBranch, BankId, BranchId, Decimal, ForWhom, Form, FormId, Page, PageRequest,
    PermissionSet, Principal, Priority, Request, RequestId, RequestStats, RequestStatus,
    TransactionType, User, UserId, WalletTransaction,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tower_http::trace::TraceLayer;
use tracing::{debug, info};

/// Credentials for the administrator seeded into an empty store.
#[derive(Debug, Clone)]
pub struct BootstrapAdmin {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Clone, Default)]
pub struct ServiceConfig {
    pub desk: PropdeskConfig,
    pub bootstrap_admin: Option<BootstrapAdmin>,
}

#[derive(Clone)]
pub struct ServiceState {
    pub desk: Arc<Propdesk>,
}

impl ServiceState {
    pub async fn bootstrap(config: ServiceConfig) -> Result<Self, ServiceError> {
        let desk = Propdesk::bootstrap(config.desk).await?;
        if let Some(admin) = config.bootstrap_admin {
            if let Some(user) = desk.bootstrap_admin(&admin.email, &admin.password).await? {
                info!(user_id = %user.id, email = %user.email, "seeded bootstrap administrator");
            }
        }
        Ok(Self {
            desk: Arc::new(desk),
        })
    }

    pub fn from_desk(desk: Propdesk) -> Self {
        Self {
            desk: Arc::new(desk),
        }
    }
}

pub fn build_router(state: ServiceState) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/auth/login", post(login))
        .route("/v1/me", get(me))
        .route("/v1/banks", get(list_banks).post(create_bank))
        .route(
            "/v1/banks/:bank_id",
            get(get_bank).patch(update_bank).delete(delete_bank),
        )
        .route(
            "/v1/banks/:bank_id/branches",
            get(list_branches).post(create_branch),
        )
        .route(
            "/v1/branches/:branch_id",
            axum::routing::patch(update_branch).delete(delete_branch),
        )
        .route("/v1/users", get(list_users).post(create_user))
        .route(
            "/v1/users/:user_id",
            get(get_user).patch(update_user).delete(delete_user),
        )
        .route("/v1/forms", get(list_forms).post(create_form))
        .route(
            "/v1/forms/:form_id",
            get(get_form).patch(update_form).delete(delete_form),
        )
        .route("/v1/forms/:form_id/duplicate", post(duplicate_form))
        .route("/v1/requests", get(list_requests).post(create_request))
        .route("/v1/requests/stats", get(request_stats))
        .route(
            "/v1/requests/:request_id",
            get(get_request).delete(delete_request),
        )
        .route("/v1/requests/:request_id/assign", post(assign_request))
        .route("/v1/requests/:request_id/status", post(update_request_status))
        .route(
            "/v1/wallet/:user_id",
            get(wallet_balance).post(apply_wallet_transaction),
        )
        .route("/v1/wallet/:user_id/transactions", get(wallet_history))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("core error: {0}")]
    Core(#[from] PropdeskError),
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{message}")]
    Http { status: StatusCode, message: String },
    #[error(transparent)]
    Core(#[from] PropdeskError),
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self::Http {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }
}

fn status_of(err: &PropdeskError) -> StatusCode {
    match err {
        PropdeskError::InvalidCredentials
        | PropdeskError::InvalidToken
        | PropdeskError::ExpiredToken => StatusCode::UNAUTHORIZED,
        PropdeskError::AccountInactive | PropdeskError::Forbidden(_) => StatusCode::FORBIDDEN,
        PropdeskError::NotFound { .. } => StatusCode::NOT_FOUND,
        PropdeskError::Validation { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        PropdeskError::InvalidTransition { .. }
        | PropdeskError::Conflict { .. }
        | PropdeskError::InsufficientBalance { .. } => StatusCode::CONFLICT,
        PropdeskError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::Http { status, message } => (
                status,
                Json(serde_json::json!({ "error": "bad_request", "message": message })),
            )
                .into_response(),
            ApiError::Core(err) => {
                let status = status_of(&err);
                let mut body = serde_json::json!({
                    "error": err.code(),
                    "message": err.to_string(),
                });
                match &err {
                    PropdeskError::Validation { field, .. } => {
                        body["field"] = serde_json::json!(field);
                    }
                    PropdeskError::InvalidTransition { from, to, .. } => {
                        body["from"] = serde_json::json!(from);
                        body["to"] = serde_json::json!(to);
                    }
                    PropdeskError::NotFound { kind, .. } | PropdeskError::Conflict { kind, .. } => {
                        body["kind"] = serde_json::json!(kind);
                    }
                    PropdeskError::InsufficientBalance {
                        available,
                        requested,
                        ..
                    } => {
                        body["available"] = serde_json::json!(available);
                        body["requested"] = serde_json::json!(requested);
                    }
                    PropdeskError::Internal(_) => {
                        body["message"] = serde_json::json!("internal error");
                    }
                    _ => {}
                }
                debug!(status = status.as_u16(), code = err.code(), "request refused");
                (status, Json(body)).into_response()
            }
        }
    }
}

/// The authenticated caller, recovered from `Authorization: Bearer <token>`.
pub struct Caller(pub Principal);

#[async_trait]
impl FromRequestParts<ServiceState> for Caller {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &ServiceState,
    ) -> Result<Self, Self::Rejection> {
        let token = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or(PropdeskError::InvalidToken)?;
        Ok(Caller(state.desk.identity().verify_token(token)?))
    }
}

#[derive(Debug, Clone, Deserialize)]
struct PageQuery {
    page: Option<usize>,
    limit: Option<usize>,
    search: Option<String>,
}

impl PageQuery {
    fn window(&self) -> PageRequest {
        PageRequest::new(
            self.page.unwrap_or(1),
            self.limit.unwrap_or(PageRequest::DEFAULT_LIMIT),
        )
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthResponse {
    status: &'static str,
    service: &'static str,
    storage_backend: &'static str,
}

async fn health(State(state): State<ServiceState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        service: "propdesk-service",
        storage_backend: state.desk.storage_label(),
    })
}

#[derive(Debug, Clone, Deserialize)]
struct LoginRequest {
    email: String,
    password: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct LoginResponse {
    token: String,
    expires_at: DateTime<Utc>,
    user_id: UserId,
    permissions: PermissionSet,
    bank_id: Option<BankId>,
}

async fn login(
    State(state): State<ServiceState>,
    Json(body): Json<LoginRequest>,
) -> Result<Json<LoginResponse>, ApiError> {
    let outcome = state.desk.identity().login(&body.email, &body.password).await?;
    Ok(Json(LoginResponse {
        token: outcome.session.token,
        expires_at: outcome.session.expires_at,
        user_id: outcome.principal.id,
        permissions: outcome.principal.permissions,
        bank_id: outcome.principal.bank_id,
    }))
}

async fn me(Caller(p): Caller, State(state): State<ServiceState>) -> Result<Json<User>, ApiError> {
    Ok(Json(state.desk.directory().get_user(&p, &p.id).await?))
}

// -- banks and branches -----------------------------------------------------

async fn list_banks(
    Caller(p): Caller,
    State(state): State<ServiceState>,
    Query(query): Query<PageQuery>,
) -> Result<Json<Page<Bank>>, ApiError> {
    let page = state
        .desk
        .directory()
        .list_banks(&p, query.search.as_deref(), query.window())
        .await?;
    Ok(Json(page))
}

async fn create_bank(
    Caller(p): Caller,
    State(state): State<ServiceState>,
    Json(draft): Json<BankDraft>,
) -> Result<(StatusCode, Json<Bank>), ApiError> {
    let bank = state.desk.directory().create_bank(&p, draft).await?;
    Ok((StatusCode::CREATED, Json(bank)))
}

async fn get_bank(
    Caller(p): Caller,
    Path(bank_id): Path<String>,
    State(state): State<ServiceState>,
) -> Result<Json<Bank>, ApiError> {
    Ok(Json(
        state.desk.directory().get_bank(&p, &BankId::new(bank_id)).await?,
    ))
}

async fn update_bank(
    Caller(p): Caller,
    Path(bank_id): Path<String>,
    State(state): State<ServiceState>,
    Json(patch): Json<BankPatch>,
) -> Result<Json<Bank>, ApiError> {
    Ok(Json(
        state
            .desk
            .directory()
            .update_bank(&p, &BankId::new(bank_id), patch)
            .await?,
    ))
}

async fn delete_bank(
    Caller(p): Caller,
    Path(bank_id): Path<String>,
    State(state): State<ServiceState>,
) -> Result<StatusCode, ApiError> {
    state
        .desk
        .directory()
        .delete_bank(&p, &BankId::new(bank_id))
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn list_branches(
    Caller(p): Caller,
    Path(bank_id): Path<String>,
    State(state): State<ServiceState>,
    Query(query): Query<PageQuery>,
) -> Result<Json<Page<BankBranch>>, ApiError> {
    let page = state
        .desk
        .directory()
        .list_branches(
            &p,
            &BankId::new(bank_id),
            query.search.as_deref(),
            query.window(),
        )
        .await?;
    Ok(Json(page))
}

async fn create_branch(
    Caller(p): Caller,
    Path(bank_id): Path<String>,
    State(state): State<ServiceState>,
    Json(draft): Json<BranchDraft>,
) -> Result<(StatusCode, Json<BankBranch>), ApiError> {
    let branch = state
        .desk
        .directory()
        .create_branch(&p, &BankId::new(bank_id), draft)
        .await?;
    Ok((StatusCode::CREATED, Json(branch)))
}

async fn update_branch(
    Caller(p): Caller,
    Path(branch_id): Path<String>,
    State(state): State<ServiceState>,
    Json(patch): Json<BranchPatch>,
) -> Result<Json<BankBranch>, ApiError> {
    Ok(Json(
        state
            .desk
            .directory()
            .update_branch(&p, &BranchId::new(branch_id), patch)
            .await?,
    ))
}

async fn delete_branch(
    Caller(p): Caller,
    Path(branch_id): Path<String>,
    State(state): State<ServiceState>,
) -> Result<StatusCode, ApiError> {
    state
        .desk
        .directory()
        .delete_branch(&p, &BranchId::new(branch_id))
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

// -- users ------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UserListQuery {
    page: Option<usize>,
    limit: Option<usize>,
    search: Option<String>,
    /// Comma-separated permission names, matched any-of.
    permissions: Option<String>,
    bank_id: Option<String>,
}

async fn list_users(
    Caller(p): Caller,
    State(state): State<ServiceState>,
    Query(query): Query<UserListQuery>,
) -> Result<Json<Page<User>>, ApiError> {
    let permissions = match query.permissions.as_deref() {
        Some(raw) if !raw.trim().is_empty() => {
            PermissionSet::parse_all(raw.split(',').map(str::trim))
                .map_err(|e| ApiError::bad_request(e.to_string()))?
        }
        _ => PermissionSet::new(),
    };
    let filter = UserFilter {
        search: query.search,
        permissions,
        bank_id: query.bank_id.map(BankId::new),
    };
    let window = PageRequest::new(
        query.page.unwrap_or(1),
        query.limit.unwrap_or(PageRequest::DEFAULT_LIMIT),
    );
    Ok(Json(
        state.desk.directory().list_users(&p, &filter, window).await?,
    ))
}

async fn create_user(
    Caller(p): Caller,
    State(state): State<ServiceState>,
    Json(input): Json<NewUser>,
) -> Result<(StatusCode, Json<User>), ApiError> {
    let user = state.desk.directory().create_user(&p, input).await?;
    Ok((StatusCode::CREATED, Json(user)))
}

async fn get_user(
    Caller(p): Caller,
    Path(user_id): Path<String>,
    State(state): State<ServiceState>,
) -> Result<Json<User>, ApiError> {
    Ok(Json(
        state.desk.directory().get_user(&p, &UserId::new(user_id)).await?,
    ))
}

async fn update_user(
    Caller(p): Caller,
    Path(user_id): Path<String>,
    State(state): State<ServiceState>,
    Json(patch): Json<UserPatch>,
) -> Result<Json<User>, ApiError> {
    Ok(Json(
        state
            .desk
            .directory()
            .update_user(&p, &UserId::new(user_id), patch)
            .await?,
    ))
}

async fn delete_user(
    Caller(p): Caller,
    Path(user_id): Path<String>,
    State(state): State<ServiceState>,
) -> Result<StatusCode, ApiError> {
    state
        .desk
        .directory()
        .delete_user(&p, &UserId::new(user_id))
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

// -- forms ------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FormListQuery {
    bank_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
struct ItemsResponse<T> {
    items: Vec<T>,
}

async fn list_forms(
    Caller(p): Caller,
    State(state): State<ServiceState>,
    Query(query): Query<FormListQuery>,
) -> Result<Json<ItemsResponse<Form>>, ApiError> {
    let bank_id = query.bank_id.map(BankId::new);
    let items = state
        .desk
        .forms()
        .list_visible(&p, bank_id.as_ref())
        .await?;
    Ok(Json(ItemsResponse { items }))
}

async fn create_form(
    Caller(p): Caller,
    State(state): State<ServiceState>,
    Json(draft): Json<FormDraft>,
) -> Result<(StatusCode, Json<Form>), ApiError> {
    let form = state.desk.forms().create(&p, draft).await?;
    Ok((StatusCode::CREATED, Json(form)))
}

async fn get_form(
    Caller(p): Caller,
    Path(form_id): Path<String>,
    State(state): State<ServiceState>,
) -> Result<Json<Form>, ApiError> {
    Ok(Json(
        state.desk.forms().get(&p, &FormId::new(form_id)).await?,
    ))
}

async fn update_form(
    Caller(p): Caller,
    Path(form_id): Path<String>,
    State(state): State<ServiceState>,
    Json(patch): Json<FormPatch>,
) -> Result<Json<Form>, ApiError> {
    Ok(Json(
        state
            .desk
            .forms()
            .update(&p, &FormId::new(form_id), patch)
            .await?,
    ))
}

async fn delete_form(
    Caller(p): Caller,
    Path(form_id): Path<String>,
    State(state): State<ServiceState>,
) -> Result<StatusCode, ApiError> {
    state.desk.forms().delete(&p, &FormId::new(form_id)).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DuplicateFormRequest {
    form_name: String,
    #[serde(default)]
    bank_id: Option<BankId>,
}

async fn duplicate_form(
    Caller(p): Caller,
    Path(form_id): Path<String>,
    State(state): State<ServiceState>,
    Json(body): Json<DuplicateFormRequest>,
) -> Result<(StatusCode, Json<Form>), ApiError> {
    let form = state
        .desk
        .forms()
        .duplicate(&p, &FormId::new(form_id), &body.form_name, body.bank_id)
        .await?;
    Ok((StatusCode::CREATED, Json(form)))
}

// -- requests ---------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RequestListQuery {
    page: Option<usize>,
    limit: Option<usize>,
    status: Option<RequestStatus>,
    for_whom: Option<ForWhom>,
    bank_id: Option<String>,
    assigned_to: Option<String>,
    priority: Option<Priority>,
}

async fn list_requests(
    Caller(p): Caller,
    State(state): State<ServiceState>,
    Query(query): Query<RequestListQuery>,
) -> Result<Json<Page<Request>>, ApiError> {
    let filter = RequestFilter {
        status: query.status,
        for_whom: query.for_whom,
        bank_id: query.bank_id.map(BankId::new),
        assigned_to: query.assigned_to.map(UserId::new),
        priority: query.priority,
    };
    let window = PageRequest::new(
        query.page.unwrap_or(1),
        query.limit.unwrap_or(PageRequest::DEFAULT_LIMIT),
    );
    Ok(Json(
        state.desk.requests().query(&p, &filter, window).await?,
    ))
}

async fn create_request(
    Caller(p): Caller,
    State(state): State<ServiceState>,
    Json(input): Json<NewRequest>,
) -> Result<(StatusCode, Json<Request>), ApiError> {
    let request = state.desk.requests().create(&p, input).await?;
    Ok((StatusCode::CREATED, Json(request)))
}

async fn request_stats(
    Caller(p): Caller,
    State(state): State<ServiceState>,
) -> Result<Json<RequestStats>, ApiError> {
    Ok(Json(state.desk.requests().stats(&p).await?))
}

async fn get_request(
    Caller(p): Caller,
    Path(request_id): Path<String>,
    State(state): State<ServiceState>,
) -> Result<Json<Request>, ApiError> {
    Ok(Json(
        state
            .desk
            .requests()
            .get(&p, &RequestId::new(request_id))
            .await?,
    ))
}

async fn delete_request(
    Caller(p): Caller,
    Path(request_id): Path<String>,
    State(state): State<ServiceState>,
) -> Result<StatusCode, ApiError> {
    state
        .desk
        .requests()
        .delete(&p, &RequestId::new(request_id))
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn assign_request(
    Caller(p): Caller,
    Path(request_id): Path<String>,
    State(state): State<ServiceState>,
    Json(assignment): Json<Assignment>,
) -> Result<Json<Request>, ApiError> {
    Ok(Json(
        state
            .desk
            .requests()
            .assign(&p, &RequestId::new(request_id), assignment)
            .await?,
    ))
}

async fn update_request_status(
    Caller(p): Caller,
    Path(request_id): Path<String>,
    State(state): State<ServiceState>,
    Json(update): Json<StatusUpdate>,
) -> Result<Json<Request>, ApiError> {
    Ok(Json(
        state
            .desk
            .requests()
            .update_status(&p, &RequestId::new(request_id), update)
            .await?,
    ))
}

// -- wallet -----------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct BalanceResponse {
    user_id: UserId,
    balance: Decimal,
}

async fn wallet_balance(
    Caller(p): Caller,
    Path(user_id): Path<String>,
    State(state): State<ServiceState>,
) -> Result<Json<BalanceResponse>, ApiError> {
    let user_id = UserId::new(user_id);
    let balance = state.desk.wallet().get_balance(&p, &user_id).await?;
    Ok(Json(BalanceResponse { user_id, balance }))
}

#[derive(Debug, Clone, Deserialize)]
struct WalletTransactionRequest {
    amount: Decimal,
    #[serde(rename = "type")]
    transaction_type: TransactionType,
    #[serde(default)]
    description: Option<String>,
}

async fn apply_wallet_transaction(
    Caller(p): Caller,
    Path(user_id): Path<String>,
    State(state): State<ServiceState>,
    Json(body): Json<WalletTransactionRequest>,
) -> Result<(StatusCode, Json<WalletReceipt>), ApiError> {
    let receipt = state
        .desk
        .wallet()
        .apply_transaction(
            &p,
            &UserId::new(user_id),
            body.amount,
            body.transaction_type,
            body.description,
        )
        .await?;
    Ok((StatusCode::CREATED, Json(receipt)))
}

async fn wallet_history(
    Caller(p): Caller,
    Path(user_id): Path<String>,
    State(state): State<ServiceState>,
    Query(query): Query<PageQuery>,
) -> Result<Json<Page<WalletTransaction>>, ApiError> {
    Ok(Json(
        state
            .desk
            .wallet()
            .history(&p, &UserId::new(user_id), query.window())
            .await?,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::Request as HttpRequest;
    use tower::ServiceExt;

    const ADMIN_EMAIL: &str = "root@desk.test";
    const ADMIN_PASSWORD: &str = "initial-pass";

    async fn app() -> Router {
        let state = ServiceState::bootstrap(ServiceConfig {
            desk: PropdeskConfig::default(),
            bootstrap_admin: Some(BootstrapAdmin {
                email: ADMIN_EMAIL.to_string(),
                password: ADMIN_PASSWORD.to_string(),
            }),
        })
        .await
        .unwrap();
        build_router(state)
    }

    async fn call(
        app: &Router,
        method: &str,
        uri: &str,
        token: Option<&str>,
        body: Option<serde_json::Value>,
    ) -> (StatusCode, serde_json::Value) {
        let mut builder = HttpRequest::builder().method(method).uri(uri);
        if let Some(token) = token {
            builder = builder.header("authorization", format!("Bearer {token}"));
        }
        let request = match body {
            Some(json) => builder
                .header("content-type", "application/json")
                .body(Body::from(json.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = if bytes.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    async fn admin_token(app: &Router) -> String {
        let (status, body) = call(
            app,
            "POST",
            "/v1/auth/login",
            None,
            Some(serde_json::json!({ "email": ADMIN_EMAIL, "password": ADMIN_PASSWORD })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        body["token"].as_str().unwrap().to_string()
    }

    #[tokio::test]
    async fn health_needs_no_token() {
        let app = app().await;
        let (status, body) = call(&app, "GET", "/v1/health", None, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["storageBackend"], "memory");
    }

    #[tokio::test]
    async fn protected_routes_reject_missing_or_bad_tokens() {
        let app = app().await;
        let (status, body) = call(&app, "GET", "/v1/me", None, None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"], "invalid_token");

        let (status, _) = call(&app, "GET", "/v1/requests", Some("garbage"), None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn wrong_password_is_invalid_credentials() {
        let app = app().await;
        let (status, body) = call(
            &app,
            "POST",
            "/v1/auth/login",
            None,
            Some(serde_json::json!({ "email": ADMIN_EMAIL, "password": "nope-nope" })),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"], "invalid_credentials");
    }

    #[tokio::test]
    async fn request_flow_over_http() {
        let app = app().await;
        let token = admin_token(&app).await;

        let (status, bank) = call(
            &app,
            "POST",
            "/v1/banks",
            Some(&token),
            Some(serde_json::json!({ "name": "Bank One", "code": "B1" })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        let bank_id = bank["id"].as_str().unwrap().to_string();

        let (status, form) = call(
            &app,
            "POST",
            "/v1/forms",
            Some(&token),
            Some(serde_json::json!({
                "formName": "F1",
                "isDefaultForm": true,
                "fields": [{
                    "id": "type",
                    "label": "Property Type",
                    "type": "select",
                    "required": true,
                    "options": ["residential", "commercial"]
                }]
            })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED, "{form}");
        let form_id = form["id"].as_str().unwrap().to_string();

        let (status, body) = call(
            &app,
            "POST",
            "/v1/requests",
            Some(&token),
            Some(serde_json::json!({
                "formId": form_id,
                "bankId": bank_id,
                "forWhom": "valuator",
                "fields": [{ "fieldId": "type", "value": "industrial" }]
            })),
        )
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["field"], "type");

        let (status, request) = call(
            &app,
            "POST",
            "/v1/requests",
            Some(&token),
            Some(serde_json::json!({
                "formId": form_id,
                "bankId": bank_id,
                "forWhom": "valuator",
                "fields": [{ "fieldId": "type", "value": "residential" }]
            })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(request["status"], "pending");
        let request_id = request["id"].as_str().unwrap().to_string();

        let (status, body) = call(
            &app,
            "POST",
            &format!("/v1/requests/{request_id}/status"),
            Some(&token),
            Some(serde_json::json!({ "status": "completed" })),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"], "invalid_transition");
        assert_eq!(body["from"], "pending");

        let (status, stats) = call(&app, "GET", "/v1/requests/stats", Some(&token), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(stats["pending"], 1);

        let (status, page) = call(
            &app,
            "GET",
            "/v1/requests?status=pending&limit=5",
            Some(&token),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(page["total"], 1);
        assert_eq!(page["currentPage"], 1);
    }

    #[tokio::test]
    async fn overdraft_maps_to_conflict() {
        let app = app().await;
        let token = admin_token(&app).await;
        let (_, me) = call(&app, "GET", "/v1/me", Some(&token), None).await;
        let user_id = me["id"].as_str().unwrap().to_string();

        let (status, receipt) = call(
            &app,
            "POST",
            &format!("/v1/wallet/{user_id}"),
            Some(&token),
            Some(serde_json::json!({ "amount": "100", "type": "credit" })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED, "{receipt}");

        let (status, body) = call(
            &app,
            "POST",
            &format!("/v1/wallet/{user_id}"),
            Some(&token),
            Some(serde_json::json!({ "amount": "150", "type": "debit" })),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"], "insufficient_balance");

        let (status, history) = call(
            &app,
            "GET",
            &format!("/v1/wallet/{user_id}/transactions"),
            Some(&token),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(history["total"], 1);
    }
}
