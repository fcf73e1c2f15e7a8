use crate::config::ServerConfig;
use crate::constants::{SERVICE_NAME, USERNAME_HEADER};
use crate::error::PredictError;
use crate::metrics;
use crate::service::{PredictionService, QuestionDraft};
use crate::types::{Question, RegistrationStatus, ServedQuestion, User};
use axum::{
    async_trait,
    body::Body,
    extract::{
        rejection::{JsonRejection, PathRejection, QueryRejection},
        FromRequestParts, Path, Query, State,
    },
    http::{header, request::Parts, Method, Request, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use hyper::Server;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, info_span};
use uuid::Uuid;

#[derive(Clone)]
pub struct AppState {
    pub service: Arc<PredictionService>,
}

impl IntoResponse for PredictError {
    fn into_response(self) -> Response {
        let status = match &self {
            PredictError::Validation(_) | PredictError::MissingHeader(_) | PredictError::NoInterests => {
                StatusCode::BAD_REQUEST
            }
            PredictError::UserNotFound(_) | PredictError::QuestionNotFound(_) => StatusCode::NOT_FOUND,
            PredictError::AlreadyResolved(_) | PredictError::UsernameTaken(_) => StatusCode::CONFLICT,
            PredictError::Database(_)
            | PredictError::Json(_)
            | PredictError::Toml(_)
            | PredictError::Io(_)
            | PredictError::Config(_)
            | PredictError::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            error!("Request failed: {}", self);
        }
        (status, Json(serde_json::json!({ "detail": self.to_string() }))).into_response()
    }
}

fn bad_request(rejection: impl std::fmt::Display) -> PredictError {
    PredictError::Validation(rejection.to_string())
}

/// Caller identity taken from the `username` header
#[derive(Debug, Clone)]
pub struct Username(pub String);

#[async_trait]
impl<S> FromRequestParts<S> for Username
where
    S: Send + Sync,
{
    type Rejection = PredictError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let value = parts
            .headers
            .get(USERNAME_HEADER)
            .ok_or(PredictError::MissingHeader(USERNAME_HEADER))?
            .to_str()
            .map_err(|_| PredictError::Validation("username header must be visible ASCII".to_string()))?;
        if value.trim().is_empty() {
            return Err(PredictError::MissingHeader(USERNAME_HEADER));
        }
        Ok(Username(value.to_string()))
    }
}

#[derive(Debug, Deserialize)]
pub struct RegisterUserRequest {
    pub username: String,
    #[serde(default)]
    pub interests: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct RegisterUserResponse {
    pub user_id: i64,
    pub username: String,
    pub interests: Vec<String>,
    pub status: RegistrationStatus,
    pub message: &'static str,
}

#[derive(Debug, Deserialize)]
pub struct FreshParams {
    pub count: Option<u32>,
}

#[derive(Debug, Serialize)]
pub struct FreshQuestionsResponse {
    pub questions: Vec<Question>,
    pub count: usize,
}

#[derive(Debug, Deserialize)]
pub struct HistoryParams {
    pub interest: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct PendingParams {
    #[serde(default)]
    pub due: bool,
}

#[derive(Debug, Deserialize)]
pub struct ResolveRequest {
    pub result: String,
    #[serde(default)]
    pub note: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ResolveResponse {
    pub message: &'static str,
    pub question: Question,
}

/// Health check endpoint
async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": SERVICE_NAME,
        "version": env!("CARGO_PKG_VERSION")
    }))
}

async fn render_metrics() -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        metrics::render(),
    )
}

async fn create_user(
    State(state): State<AppState>,
    payload: Result<Json<RegisterUserRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<RegisterUserResponse>), PredictError> {
    let Json(request) = payload.map_err(bad_request)?;
    let registration = state
        .service
        .register_user(&request.username, &request.interests)
        .await?;

    let (code, message) = match registration.status {
        RegistrationStatus::Created => (StatusCode::CREATED, "User created successfully"),
        RegistrationStatus::Existing => (
            StatusCode::OK,
            "User already exists, interests updated if provided",
        ),
    };
    let user = registration.user;
    Ok((
        code,
        Json(RegisterUserResponse {
            user_id: user.id,
            username: user.username,
            interests: user.interests,
            status: registration.status,
            message,
        }),
    ))
}

async fn get_user(
    State(state): State<AppState>,
    Path(username): Path<String>,
) -> Result<Json<User>, PredictError> {
    Ok(Json(state.service.get_user(&username).await?))
}

async fn create_question(
    State(state): State<AppState>,
    payload: Result<Json<QuestionDraft>, JsonRejection>,
) -> Result<(StatusCode, Json<Question>), PredictError> {
    let Json(draft) = payload.map_err(bad_request)?;
    let question = state.service.add_question(draft).await?;
    Ok((StatusCode::CREATED, Json(question)))
}

async fn fresh_questions(
    State(state): State<AppState>,
    Username(username): Username,
    params: Result<Query<FreshParams>, QueryRejection>,
) -> Result<Json<FreshQuestionsResponse>, PredictError> {
    let Query(params) = params.map_err(bad_request)?;
    let questions = state
        .service
        .fresh_questions(&username, params.count)
        .await?;
    Ok(Json(FreshQuestionsResponse {
        count: questions.len(),
        questions,
    }))
}

async fn question_history(
    State(state): State<AppState>,
    Username(username): Username,
    params: Result<Query<HistoryParams>, QueryRejection>,
) -> Result<Json<Vec<ServedQuestion>>, PredictError> {
    let Query(params) = params.map_err(bad_request)?;
    let history = state
        .service
        .question_history(&username, params.interest.as_deref())
        .await?;
    Ok(Json(history))
}

async fn pending_questions(
    State(state): State<AppState>,
    Username(username): Username,
    params: Result<Query<PendingParams>, QueryRejection>,
) -> Result<Json<Vec<ServedQuestion>>, PredictError> {
    let Query(params) = params.map_err(bad_request)?;
    let pending = state
        .service
        .pending_resolutions(&username, params.due)
        .await?;
    Ok(Json(pending))
}

async fn resolve_question(
    State(state): State<AppState>,
    Username(username): Username,
    question_id: Result<Path<i64>, PathRejection>,
    payload: Result<Json<ResolveRequest>, JsonRejection>,
) -> Result<Json<ResolveResponse>, PredictError> {
    let Path(question_id) = question_id.map_err(bad_request)?;
    let Json(request) = payload.map_err(bad_request)?;
    let question = state
        .service
        .resolve_question(&username, question_id, &request.result, request.note.as_deref())
        .await?;
    Ok(Json(ResolveResponse {
        message: "Question resolved successfully",
        question,
    }))
}

/// Create the HTTP router with all routes
pub fn create_router(service: Arc<PredictionService>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(Any);

    let trace = TraceLayer::new_for_http().make_span_with(|request: &Request<Body>| {
        info_span!(
            "request",
            method = %request.method(),
            path = %request.uri().path(),
            id = %Uuid::new_v4(),
        )
    });

    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(render_metrics))
        .route("/users/", post(create_user))
        .route("/users/:username/", get(get_user))
        .route("/questions/", post(create_question))
        .route("/questions/fresh/", get(fresh_questions))
        .route("/questions/history/", get(question_history))
        .route("/questions/pending/", get(pending_questions))
        .route("/questions/:id/resolve/", post(resolve_question))
        .with_state(AppState { service })
        .layer(ServiceBuilder::new().layer(trace).layer(cors))
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Shutdown signal received"),
        Err(e) => {
            // Without a signal handler, keep serving until the process is killed
            error!("Failed to listen for shutdown signal: {}", e);
            std::future::pending::<()>().await;
        }
    }
}

/// Start the HTTP server and run until Ctrl-C
pub async fn start_server(config: &ServerConfig, service: Arc<PredictionService>) -> anyhow::Result<()> {
    let app = create_router(service);
    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;

    info!("HTTP server running on http://{}", addr);
    info!("Health check: http://{}/health", addr);

    Server::bind(&addr)
        .serve(app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}
