//! One provider call per request against the Workers AI REST API.

use crate::config::ProviderConfig;
use crate::error::{Error, Result};
use crate::http::HttpClient;
use crate::prompt::Payload;
use crate::registry::{ImageEncoding, ModelSpec};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use bytes::Bytes;
use futures::Stream;
use reqwest::header;
use serde::Deserialize;
use serde_json::{Value, json};
use std::pin::Pin;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Forward-only provider byte stream. Not restartable: retrying means a new call.
pub type ByteStream = Pin<Box<dyn Stream<Item = reqwest::Result<Bytes>> + Send>>;

pub enum ProviderResponse {
    Bytes { content_type: String, body: Bytes },
    Json(Value),
    Stream(ByteStream),
}

impl std::fmt::Debug for ProviderResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bytes { content_type, body } => f
                .debug_struct("Bytes")
                .field("content_type", content_type)
                .field("len", &body.len())
                .finish(),
            Self::Json(v) => f.debug_tuple("Json").field(v).finish(),
            Self::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedImage {
    pub content_type: &'static str,
    pub bytes: Bytes,
}

// -- Workers AI envelope --

#[derive(Deserialize)]
struct Envelope {
    #[serde(default)]
    success: Option<bool>,
    #[serde(default)]
    result: Value,
    #[serde(default)]
    errors: Vec<ApiMessage>,
}

#[derive(Deserialize)]
struct ApiMessage {
    #[serde(default)]
    code: Option<i64>,
    #[serde(default)]
    message: String,
}

pub struct Gateway {
    http: HttpClient,
    base_url: String,
    account_id: String,
    api_token: String,
}

impl Gateway {
    pub fn new(
        base_url: impl Into<String>,
        account_id: impl Into<String>,
        api_token: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let http = HttpClient::new(concat!("workers-relay/", env!("CARGO_PKG_VERSION")), timeout)?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            account_id: account_id.into(),
            api_token: api_token.into(),
        })
    }

    /// Build from config, reading the API token from the configured env var.
    pub fn from_config(config: &ProviderConfig) -> Result<Self> {
        Self::new(
            config.base_url.clone(),
            config.account_id.clone(),
            config.api_token(),
            Duration::from_secs(config.timeout_secs),
        )
    }

    fn run_url(&self, provider_id: &str) -> String {
        format!(
            "{}/accounts/{}/ai/run/{}",
            self.base_url, self.account_id, provider_id
        )
    }

    /// Issue one provider call. An event-stream answer to a streaming call is
    /// handed back unread; anything else is read fully and JSON envelopes
    /// unwrapped, so a stream request answered with an error envelope fails here.
    pub async fn invoke(
        &self,
        provider_id: &str,
        body: &Value,
        streaming: bool,
        cancel: &CancellationToken,
    ) -> Result<ProviderResponse> {
        let url = self.run_url(provider_id);
        let call = async {
            let resp = self
                .http
                .post_json(&url, body, &self.api_token, provider_id, streaming)
                .await?;
            let content_type = resp
                .headers()
                .get(header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("application/octet-stream")
                .to_string();
            if streaming && content_type.starts_with("text/event-stream") {
                return Ok(ProviderResponse::Stream(Box::pin(resp.bytes_stream())));
            }

            let body = resp.bytes().await.map_err(|e| Error::http(e.to_string()))?;
            if body.is_empty() {
                return Err(Error::empty_response(provider_id));
            }
            debug!(model = provider_id, %content_type, len = body.len(), "provider responded");

            if streaming || content_type.starts_with("application/json") {
                unwrap_envelope(provider_id, &body).map(ProviderResponse::Json)
            } else {
                Ok(ProviderResponse::Bytes { content_type, body })
            }
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Error::Aborted),
            res = call => res,
        }
    }

    /// Generate an image, decoding it according to the model's declared encoding.
    pub async fn generate_image(
        &self,
        spec: &ModelSpec,
        prompt: &str,
        cancel: &CancellationToken,
    ) -> Result<GeneratedImage> {
        let encoding = spec.image_encoding.unwrap_or(ImageEncoding::RawPng);
        let resp = self
            .invoke(&spec.provider_id, &json!({ "prompt": prompt }), false, cancel)
            .await?;

        match (encoding, resp) {
            (ImageEncoding::RawPng, ProviderResponse::Bytes { body, .. }) => Ok(GeneratedImage {
                content_type: encoding.content_type(),
                bytes: body,
            }),
            (ImageEncoding::Base64Jpeg, ProviderResponse::Json(result)) => {
                let encoded = result
                    .get("image")
                    .and_then(Value::as_str)
                    .filter(|s| !s.is_empty())
                    .ok_or_else(|| Error::empty_response(&spec.provider_id))?;
                let bytes = STANDARD
                    .decode(encoded)
                    .map_err(|e| Error::parse(format!("decode base64 image: {e}")))?;
                Ok(GeneratedImage {
                    content_type: encoding.content_type(),
                    bytes: Bytes::from(bytes),
                })
            }
            (encoding, other) => Err(Error::provider(
                &spec.provider_id,
                format!("expected {encoding:?} image, got {other:?}"),
            )),
        }
    }

    pub async fn summarize(
        &self,
        spec: &ModelSpec,
        text: &str,
        cancel: &CancellationToken,
    ) -> Result<String> {
        let resp = self
            .invoke(&spec.provider_id, &json!({ "input_text": text }), false, cancel)
            .await?;

        let ProviderResponse::Json(result) = resp else {
            return Err(Error::provider(&spec.provider_id, "expected JSON summary"));
        };
        result
            .get("summary")
            .and_then(Value::as_str)
            .or_else(|| result.as_str())
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .ok_or_else(|| Error::empty_response(&spec.provider_id))
    }

    /// Open a token stream for a chat turn. Structured-message payloads the
    /// provider rejects with 400 are re-sent once as a flat transcript.
    pub async fn stream_text(
        &self,
        spec: &ModelSpec,
        payload: &Payload,
        max_tokens: Option<u32>,
        cancel: &CancellationToken,
    ) -> Result<ByteStream> {
        let body = payload.to_request_body(true, max_tokens);
        match self.invoke(&spec.provider_id, &body, true, cancel).await {
            Ok(resp) => expect_stream(spec, resp),
            Err(e) if e.provider_status() == Some(400) => {
                let Some(fallback) = payload.to_fallback_body(true, max_tokens) else {
                    return Err(e);
                };
                warn!(model = %spec.provider_id, error = %e, "messages rejected, retrying as transcript prompt");
                let resp = self
                    .invoke(&spec.provider_id, &fallback, true, cancel)
                    .await?;
                expect_stream(spec, resp)
            }
            Err(e) => Err(e),
        }
    }
}

fn expect_stream(spec: &ModelSpec, resp: ProviderResponse) -> Result<ByteStream> {
    match resp {
        ProviderResponse::Stream(stream) => Ok(stream),
        other => Err(Error::provider(
            &spec.provider_id,
            format!("expected event stream, got {other:?}"),
        )),
    }
}

/// Unwrap `{ success, result, errors }`, treating a falsy result as empty.
fn unwrap_envelope(model: &str, body: &[u8]) -> Result<Value> {
    let envelope: Envelope = serde_json::from_slice(body)
        .map_err(|e| Error::parse(format!("parse provider response: {e}")))?;

    if envelope.success == Some(false) {
        let message = envelope
            .errors
            .iter()
            .map(|e| match e.code {
                Some(code) => format!("{code}: {}", e.message),
                None => e.message.clone(),
            })
            .collect::<Vec<_>>()
            .join("; ");
        return Err(Error::provider(model, message));
    }

    let empty = match &envelope.result {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        Value::Object(map) => map.is_empty(),
        Value::Array(items) => items.is_empty(),
        _ => false,
    };
    if empty {
        return Err(Error::empty_response(model));
    }
    Ok(envelope.result)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_result_is_unwrapped() {
        let body = br#"{"success":true,"result":{"summary":"short"},"errors":[],"messages":[]}"#;
        let result = unwrap_envelope("@cf/x", body).unwrap();
        assert_eq!(result["summary"], "short");
    }

    #[test]
    fn failed_envelope_is_provider_error() {
        let body = br#"{"success":false,"result":null,"errors":[{"code":5006,"message":"bad input"}]}"#;
        let err = unwrap_envelope("@cf/x", body).unwrap_err();
        match err {
            Error::Provider { model, message, .. } => {
                assert_eq!(model, "@cf/x");
                assert_eq!(message, "5006: bad input");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn falsy_results_are_empty_responses() {
        let bodies: [&[u8]; 4] = [
            br#"{"success":true,"result":null}"#,
            br#"{"success":true,"result":""}"#,
            br#"{"success":true,"result":{}}"#,
            br#"{}"#,
        ];
        for body in bodies {
            let err = unwrap_envelope("@cf/x", body).unwrap_err();
            assert!(matches!(err, Error::EmptyResponse(_)), "got {err:?}");
        }
    }

    #[test]
    fn malformed_envelope_is_parse_error() {
        let err = unwrap_envelope("@cf/x", b"<html>").unwrap_err();
        assert!(matches!(err, Error::Parse(_)));
    }

    #[test]
    fn run_url_joins_account_and_model() {
        let gw = Gateway::new("http://host/v4/", "acct", "tok", Duration::from_secs(1)).unwrap();
        assert_eq!(
            gw.run_url("@cf/facebook/bart-large-cnn"),
            "http://host/v4/accounts/acct/ai/run/@cf/facebook/bart-large-cnn"
        );
    }

    #[tokio::test]
    async fn cancelled_token_aborts_before_calling_provider() {
        let gw = Gateway::new("http://127.0.0.1:1", "acct", "tok", Duration::from_secs(1)).unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = gw
            .invoke("@cf/x", &json!({}), false, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Aborted));
    }
}
