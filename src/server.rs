//! HTTP surface: image, summary and streaming-text endpoints plus a liveness probe.

use crate::error::Error;
use crate::gateway::Gateway;
use crate::prompt::{self, Message, Role};
use crate::registry::ModelRegistry;
use crate::relay::StreamRelay;
use axum::body::Body;
use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info};

pub const INVALID_PROMPT: &str = "Please enter a valid prompt.";
pub const UNSUPPORTED_MODEL: &str =
    "Unsupported model. Please try from the given list of models.";
pub const INVALID_BODY: &str = "Invalid request body.";

/// Shared, read-only state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<ModelRegistry>,
    pub gateway: Arc<Gateway>,
    pub default_system_prompt: Option<String>,
    pub max_tokens: Option<u32>,
}

/// JSON `{ "error": ... }` with a status code.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    /// Map a domain error for `route`. Input errors keep their user-facing
    /// text; anything else is logged in full and replaced by `generic`.
    fn from_error(route: &str, generic: &str, err: Error) -> Self {
        if err.is_client_error() {
            return match err {
                Error::Validation(msg) => Self::bad_request(msg),
                _ => Self::bad_request(UNSUPPORTED_MODEL),
            };
        }
        error!(
            route,
            at = %Utc::now().to_rfc3339(),
            error = %err,
            "request failed"
        );
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: generic.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateRequest {
    #[serde(default)]
    pub prompt: Option<String>,
    #[serde(default)]
    pub model_name: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TextRequest {
    #[serde(default)]
    pub prompt: Option<String>,
    #[serde(default)]
    pub messages: Option<Vec<Message>>,
    #[serde(default)]
    pub model_name: Option<String>,
    #[serde(default)]
    pub system_prompt: Option<String>,
}

impl TextRequest {
    /// The conversation to format: explicit messages, or the prompt as one user turn.
    fn conversation(&self) -> Result<Vec<Message>, Error> {
        let conversation = match (&self.messages, &self.prompt) {
            (Some(messages), _) if !messages.is_empty() => messages.clone(),
            (_, Some(prompt)) => vec![Message::user(prompt.clone())],
            _ => Vec::new(),
        };
        let has_user_turn = conversation
            .iter()
            .any(|m| m.role == Role::User && !m.content.trim().is_empty());
        if !has_user_turn {
            return Err(Error::validation(INVALID_PROMPT));
        }
        Ok(conversation)
    }
}

fn require_prompt(prompt: Option<&str>) -> Result<&str, Error> {
    prompt
        .filter(|p| !p.trim().is_empty())
        .ok_or_else(|| Error::validation(INVALID_PROMPT))
}

fn parse_body<T>(body: Result<Json<T>, JsonRejection>) -> Result<T, ApiError> {
    body.map(|Json(value)| value).map_err(|e| {
        debug!(error = %e, "rejected request body");
        ApiError::bad_request(INVALID_BODY)
    })
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(health))
        .route("/models", get(list_models))
        .route("/generate-image", post(generate_image))
        .route("/generate-summary", post(generate_summary))
        .route("/generate-text", post(generate_text))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve on a pre-bound listener until Ctrl-C.
pub async fn serve(listener: TcpListener, state: AppState) -> std::io::Result<()> {
    let addr = listener.local_addr()?;
    info!(%addr, "relay listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown requested");
        })
        .await
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "detail": "Relay API is up!" }))
}

async fn list_models(State(state): State<AppState>) -> Json<ModelRegistry> {
    Json(state.registry.as_ref().clone())
}

async fn generate_image(
    State(state): State<AppState>,
    body: Result<Json<GenerateRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    const ROUTE: &str = "POST /generate-image";
    const GENERIC: &str = "An error occurred while generating the image.";

    let req = parse_body(body)?;
    let result = async {
        let prompt = require_prompt(req.prompt.as_deref())?;
        let spec = state
            .registry
            .image
            .lookup(req.model_name.as_deref().unwrap_or_default())?;
        state
            .gateway
            .generate_image(spec, prompt, &CancellationToken::new())
            .await
    }
    .await;

    let image = result.map_err(|e| ApiError::from_error(ROUTE, GENERIC, e))?;
    Ok(([(header::CONTENT_TYPE, image.content_type)], image.bytes).into_response())
}

async fn generate_summary(
    State(state): State<AppState>,
    body: Result<Json<GenerateRequest>, JsonRejection>,
) -> Result<Json<serde_json::Value>, ApiError> {
    const ROUTE: &str = "POST /generate-summary";
    const GENERIC: &str = "An error occurred while generating the summary.";

    let req = parse_body(body)?;
    let result = async {
        let prompt = require_prompt(req.prompt.as_deref())?;
        let spec = state
            .registry
            .summary
            .lookup(req.model_name.as_deref().unwrap_or_default())?;
        state
            .gateway
            .summarize(spec, prompt, &CancellationToken::new())
            .await
    }
    .await;

    let summary = result.map_err(|e| ApiError::from_error(ROUTE, GENERIC, e))?;
    Ok(Json(json!({ "summary": summary })))
}

async fn generate_text(
    State(state): State<AppState>,
    body: Result<Json<TextRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    const ROUTE: &str = "POST /generate-text";
    const GENERIC: &str = "An error occurred while generating the text.";

    let req = parse_body(body)?;
    let cancel = CancellationToken::new();
    let result = async {
        let conversation = req.conversation()?;
        let spec = state
            .registry
            .text
            .lookup(req.model_name.as_deref().unwrap_or_default())?;
        let system = req
            .system_prompt
            .as_deref()
            .or(state.default_system_prompt.as_deref());
        let payload = prompt::format(&conversation, spec.family, system);
        debug!(model = %spec.provider_id, family = %spec.family, turns = conversation.len(), "streaming chat turn");
        state
            .gateway
            .stream_text(spec, &payload, state.max_tokens, &cancel)
            .await
    }
    .await;

    let upstream = result.map_err(|e| ApiError::from_error(ROUTE, GENERIC, e))?;
    let relay = StreamRelay::new(upstream, cancel);

    Ok((
        [
            (header::CONTENT_TYPE, "text/event-stream"),
            (header::CACHE_CONTROL, "no-cache"),
            (header::CONNECTION, "keep-alive"),
        ],
        Body::from_stream(relay.into_sse()),
    )
        .into_response())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prompt_wins_when_messages_absent() {
        let req = TextRequest {
            prompt: Some("Hello".into()),
            messages: None,
            model_name: Some("m1".into()),
            system_prompt: None,
        };
        assert_eq!(req.conversation().unwrap(), vec![Message::user("Hello")]);
    }

    #[test]
    fn messages_take_precedence_over_prompt() {
        let req = TextRequest {
            prompt: Some("ignored".into()),
            messages: Some(vec![Message::user("Hi"), Message::assistant("Hey")]),
            model_name: None,
            system_prompt: None,
        };
        assert_eq!(req.conversation().unwrap().len(), 2);
    }

    #[test]
    fn conversation_without_user_text_is_rejected() {
        for (prompt, messages) in [
            (None, None),
            (Some(String::new()), None),
            (Some("   ".to_string()), None),
            (None, Some(vec![Message::system("only system")])),
        ] {
            let req = TextRequest {
                prompt,
                messages,
                model_name: Some("m1".into()),
                system_prompt: None,
            };
            let err = req.conversation().unwrap_err();
            assert!(matches!(err, Error::Validation(ref m) if m == INVALID_PROMPT));
        }
    }

    #[test]
    fn internal_errors_get_generic_message() {
        let err = ApiError::from_error(
            "POST /x",
            "generic",
            Error::provider("@cf/x", "secret upstream detail"),
        );
        assert_eq!(err.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(err.message, "generic");
    }

    #[test]
    fn lookup_errors_become_unsupported_model() {
        let err = ApiError::from_error("POST /x", "generic", Error::unknown_model("zzz"));
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
        assert_eq!(err.message, UNSUPPORTED_MODEL);
    }

    #[test]
    fn validation_errors_keep_their_message() {
        let err = ApiError::from_error("POST /x", "generic", Error::validation(INVALID_PROMPT));
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
        assert_eq!(err.message, INVALID_PROMPT);
    }
}
