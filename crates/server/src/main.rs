use std::{net::SocketAddr, sync::Arc};

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::{
        header::{AUTHORIZATION, CONTENT_TYPE},
        HeaderValue, Method, StatusCode,
    },
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use server_api::{
    append_and_broadcast,
    auth::{AuthConfig, DEV_JWT_SECRET},
    create_conversation, get_conversation, list_conversations, list_messages,
    live::LiveHub,
    ApiContext,
};
use shared::{
    domain::ConversationId,
    error::{ApiError, ErrorCode},
    protocol::{
        ConversationRecord, ConversationSummary, CreateConversationRequest, MessageView,
        SendMessageRequest,
    },
};
use storage::Storage;
use tower_http::{
    cors::{AllowOrigin, CorsLayer},
    limit::RequestBodyLimitLayer,
};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

mod auth;
mod config;
mod ws;

use auth::AuthUser;
use config::{load_settings, normalize_database_url, Settings};

#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) api: ApiContext,
}

pub(crate) type HttpError = (StatusCode, Json<ApiError>);

#[derive(Debug, Serialize, Deserialize)]
struct HealthResponse {
    status: String,
    message: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let settings = load_settings();
    if settings.jwt_secret == DEV_JWT_SECRET {
        warn!("JWT_SECRET is not set; tokens are signed with the development secret");
    }

    let database_url = normalize_database_url(&settings.database_url);
    let storage = Storage::new(&database_url).await.map_err(|error| {
        error!(
            %database_url,
            %error,
            "failed to open SQLite database; verify parent directory exists and permissions are correct"
        );
        error
    })?;
    let api = ApiContext {
        storage,
        hub: LiveHub::new(),
        auth: AuthConfig {
            jwt_secret: settings.jwt_secret.clone(),
            ttl_seconds: settings.jwt_ttl_seconds,
        },
    };

    let app = build_router(Arc::new(AppState { api }), &settings);

    let addr: SocketAddr = settings.server_bind.parse()?;
    info!(%addr, origins = ?settings.allowed_origins, "server listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

fn build_router(state: Arc<AppState>, settings: &Settings) -> Router {
    let origins: Vec<HeaderValue> = settings
        .allowed_origins
        .iter()
        .filter_map(|origin| origin.parse().ok())
        .collect();
    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([AUTHORIZATION, CONTENT_TYPE])
        .allow_credentials(true);

    Router::new()
        .route("/api/health", get(health))
        .route("/api/chats", get(http_list_chats).post(http_create_chat))
        .route("/api/chats/:chat_id", get(http_get_chat))
        .route(
            "/api/chats/:chat_id/messages",
            get(http_list_messages).post(http_send_message),
        )
        .route("/ws", get(ws::ws_handler))
        .layer(RequestBodyLimitLayer::new(settings.max_body_bytes))
        .layer(cors)
        .with_state(state)
}

pub(crate) fn error_response(error: ApiError) -> HttpError {
    let status = match error.code {
        ErrorCode::Unauthorized => StatusCode::UNAUTHORIZED,
        ErrorCode::Forbidden => StatusCode::FORBIDDEN,
        ErrorCode::NotFound => StatusCode::NOT_FOUND,
        ErrorCode::Validation => StatusCode::BAD_REQUEST,
        ErrorCode::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(error))
}

fn body_error(rejection: JsonRejection) -> HttpError {
    let status = match rejection.status() {
        StatusCode::PAYLOAD_TOO_LARGE => StatusCode::PAYLOAD_TOO_LARGE,
        _ => StatusCode::BAD_REQUEST,
    };
    (status, Json(ApiError::validation(rejection.body_text())))
}

async fn health(State(state): State<Arc<AppState>>) -> (StatusCode, Json<HealthResponse>) {
    match state.api.storage.health_check().await {
        Ok(()) => (
            StatusCode::OK,
            Json(HealthResponse {
                status: "OK".into(),
                message: "MedConnect API is running".into(),
            }),
        ),
        Err(error) => {
            error!(error = %format!("{error:#}"), "health check failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(HealthResponse {
                    status: "DEGRADED".into(),
                    message: "database unavailable".into(),
                }),
            )
        }
    }
}

async fn http_create_chat(
    State(state): State<Arc<AppState>>,
    AuthUser(identity): AuthUser,
    payload: Result<Json<CreateConversationRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<ConversationRecord>), HttpError> {
    let Json(request) = payload.map_err(body_error)?;
    let (conversation, created) = create_conversation(&state.api, identity, &request)
        .await
        .map_err(error_response)?;
    let status = if created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(conversation)))
}

async fn http_list_chats(
    State(state): State<Arc<AppState>>,
    AuthUser(identity): AuthUser,
) -> Result<Json<Vec<ConversationSummary>>, HttpError> {
    let conversations = list_conversations(&state.api, identity)
        .await
        .map_err(error_response)?;
    Ok(Json(conversations))
}

async fn http_get_chat(
    State(state): State<Arc<AppState>>,
    AuthUser(identity): AuthUser,
    Path(chat_id): Path<i64>,
) -> Result<Json<ConversationRecord>, HttpError> {
    let conversation = get_conversation(&state.api, identity.user_id, ConversationId(chat_id))
        .await
        .map_err(error_response)?;
    Ok(Json(conversation))
}

async fn http_list_messages(
    State(state): State<Arc<AppState>>,
    AuthUser(identity): AuthUser,
    Path(chat_id): Path<i64>,
) -> Result<Json<Vec<MessageView>>, HttpError> {
    let messages = list_messages(&state.api, identity.user_id, ConversationId(chat_id))
        .await
        .map_err(error_response)?;
    Ok(Json(messages))
}

async fn http_send_message(
    State(state): State<Arc<AppState>>,
    AuthUser(identity): AuthUser,
    Path(chat_id): Path<i64>,
    payload: Result<Json<SendMessageRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<MessageView>), HttpError> {
    let Json(request) = payload.map_err(body_error)?;
    let message = append_and_broadcast(
        &state.api,
        ConversationId(chat_id),
        identity.user_id,
        request.content.as_deref(),
    )
    .await
    .map_err(error_response)?;
    Ok((StatusCode::CREATED, Json(message)))
}

#[cfg(test)]
#[path = "tests/main_tests.rs"]
mod tests;
