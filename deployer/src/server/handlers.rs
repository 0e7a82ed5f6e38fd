//! HTTP request handlers

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, error, info};

use crate::config::descriptor::DeploymentConfig;
use crate::config::loader::{resolve_config, validate_env_name, Overrides};
use crate::deploy::guard::GuardState;
use crate::errors::DeployError;
use crate::report::{DeployEvent, Reporter};
use crate::server::state::ServerState;
use crate::utils::version_info;

/// Error body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

/// Handler error carrying its status code
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }
}

impl From<DeployError> for ApiError {
    fn from(err: DeployError) -> Self {
        let status = match &err {
            DeployError::Busy => StatusCode::CONFLICT,
            DeployError::ConfigError(_) | DeployError::CredentialError(_) => {
                StatusCode::BAD_REQUEST
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(ErrorResponse {
                error: self.message,
            }),
        )
            .into_response()
    }
}

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub service: String,
    pub version: String,
}

/// Health check handler
pub async fn health_handler() -> impl IntoResponse {
    let version = version_info();
    Json(HealthResponse {
        status: "healthy".to_string(),
        service: "koram".to_string(),
        version: version.version,
    })
}

#[derive(Debug, Serialize)]
pub struct ConfigsResponse {
    pub configs: Vec<String>,
    pub total: usize,
}

/// Environments with a descriptor
pub async fn list_configs_handler(
    State(state): State<Arc<ServerState>>,
) -> Result<impl IntoResponse, ApiError> {
    let configs = state.loader.discover().await?;
    let total = configs.len();
    Ok(Json(ConfigsResponse { configs, total }))
}

/// One descriptor, secrets removed
pub async fn get_config_handler(
    State(state): State<Arc<ServerState>>,
    Path(name): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let file = state.loader.descriptor_file(&name)?;
    if !file.exists().await {
        return Err(ApiError::not_found(format!("No descriptor for '{}'", name)));
    }
    let (_, mut config) = state.loader.load(Some(&name)).await?;
    config.strip_secrets();
    Ok(Json(config))
}

#[derive(Debug, Serialize)]
pub struct SaveResponse {
    pub saved: bool,
    pub config: String,
}

/// Replace a descriptor. Secrets in the body are dropped.
pub async fn put_config_handler(
    State(state): State<Arc<ServerState>>,
    Path(name): Path<String>,
    Json(config): Json<DeploymentConfig>,
) -> Result<impl IntoResponse, ApiError> {
    state.loader.save(&name, &config).await?;
    Ok(Json(SaveResponse {
        saved: true,
        config: name,
    }))
}

#[derive(Debug, Serialize)]
pub struct DeployAccepted {
    pub accepted: bool,
    pub config: String,
}

/// Start a deployment in the background: 202, or 409 while one is running
pub async fn deploy_handler(
    State(state): State<Arc<ServerState>>,
    Path(name): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    validate_env_name(&name)?;

    let permit = match state.guard.try_acquire(&name) {
        Ok(permit) => permit,
        Err(e) => {
            state.events.publish(DeployEvent::Status {
                busy: true,
                state: None,
            });
            state.events.warn("A deployment is already in progress");
            return Err(e.into());
        }
    };

    info!("Deploy of '{}' requested", name);
    state.events.publish(DeployEvent::Status {
        busy: true,
        state: None,
    });

    let task_state = state.clone();
    let config_name = name.clone();
    tokio::spawn(async move {
        if let Err(e) = run_deploy(&task_state, &config_name).await {
            error!("Deploy of '{}' failed: {}", config_name, e);
        }
        drop(permit);
        task_state.events.publish(DeployEvent::Status {
            busy: false,
            state: None,
        });
    });

    Ok((
        StatusCode::ACCEPTED,
        Json(DeployAccepted {
            accepted: true,
            config: name,
        }),
    ))
}

async fn run_deploy(state: &ServerState, name: &str) -> Result<(), DeployError> {
    let (_, config) = match resolve_config(
        &state.loader,
        Some(name),
        state.credentials.as_ref(),
        &Overrides::default(),
    )
    .await
    {
        Ok(resolved) => resolved,
        Err(e) => {
            state.events.error(&e.to_string());
            return Err(e);
        }
    };
    state
        .orchestrator
        .deploy(&state.project_root, &config)
        .await
        .map(|_| ())
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub busy: bool,
    pub guard: GuardState,
    pub subscribers: usize,
}

pub async fn status_handler(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    let guard = state.guard.state();
    Json(StatusResponse {
        busy: matches!(guard, GuardState::Busy { .. }),
        guard,
        subscribers: state.events.subscriber_count(),
    })
}

/// Websocket stream of deploy events
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<ServerState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| stream_events(socket, state))
}

async fn stream_events(mut socket: WebSocket, state: Arc<ServerState>) {
    let mut events = state.events.subscribe();
    let hello = DeployEvent::Status {
        busy: state.guard.is_busy(),
        state: None,
    };
    if send_event(&mut socket, &hello).await.is_err() {
        return;
    }

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => {
                    if send_event(&mut socket, &event).await.is_err() {
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    debug!("Websocket subscriber lagged, {} events skipped", skipped);
                }
                Err(RecvError::Closed) => break,
            },
            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }
    debug!("Websocket subscriber disconnected");
}

async fn send_event(socket: &mut WebSocket, event: &DeployEvent) -> Result<(), axum::Error> {
    let text = serde_json::to_string(event).map_err(axum::Error::new)?;
    socket.send(Message::Text(text.into())).await
}
