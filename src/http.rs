use crate::error::{Error, Result};
use reqwest::{Client, StatusCode, header};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Clone)]
pub struct HttpClient {
    client: Client,
    timeout: Duration,
}

impl HttpClient {
    /// The client-wide limit is on connecting only; streamed bodies may run
    /// far longer than `timeout`, so one-shot calls opt in per request and
    /// streams are bounded only until response headers arrive.
    pub fn new(user_agent: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(timeout)
            .user_agent(user_agent)
            .build()
            .map_err(|e| Error::http(e.to_string()))?;

        Ok(Self { client, timeout })
    }

    /// POST a JSON body with bearer auth. Non-2xx statuses become
    /// `Error::Provider` tagged with `model`.
    pub async fn post_json(
        &self,
        url: &str,
        body: &Value,
        token: &str,
        model: &str,
        streaming: bool,
    ) -> Result<reqwest::Response> {
        let mut req = self
            .client
            .post(url)
            .header(header::AUTHORIZATION, format!("Bearer {token}"))
            .json(body);
        if streaming {
            req = req.header(header::ACCEPT, "text/event-stream");
        } else {
            req = req.timeout(self.timeout);
        }

        debug!(model, streaming, "sending provider request");
        // Streams have no per-request timeout, so bound the wait for headers here.
        let resp = tokio::time::timeout(self.timeout, req.send())
            .await
            .map_err(|_| {
                warn!(model, "provider did not answer before timeout");
                Error::http(format!("no response from provider within {:?}", self.timeout))
            })?
            .map_err(|e| {
                if e.is_timeout() {
                    warn!(model, "provider request timed out");
                }
                Error::http(e.to_string())
            })?;

        check_status(resp, model).await
    }
}

async fn check_status(resp: reqwest::Response, model: &str) -> Result<reqwest::Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    let message = match status {
        StatusCode::TOO_MANY_REQUESTS => format!("rate limited: {body}"),
        _ => body,
    };
    Err(Error::provider_with_status(model, message, status.as_u16()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn stream_request_gives_up_when_headers_never_arrive() {
        // Accepts the connection and then stays silent.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let silent = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(30)).await;
            drop(socket);
        });

        let client = HttpClient::new("test", Duration::from_millis(200)).unwrap();
        let err = tokio::time::timeout(
            Duration::from_secs(5),
            client.post_json(&format!("http://{addr}/run"), &json!({}), "tok", "@cf/x", true),
        )
        .await
        .expect("post_json should time out on its own")
        .unwrap_err();
        assert!(matches!(err, Error::Http(_)), "got {err:?}");
        silent.abort();
    }

    #[tokio::test]
    async fn error_status_carries_provider_code() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/run")
            .with_status(429)
            .with_body("slow down")
            .create_async()
            .await;

        let client = HttpClient::new("test", Duration::from_secs(5)).unwrap();
        let err = client
            .post_json(&format!("{}/run", server.url()), &json!({}), "tok", "@cf/x", false)
            .await
            .unwrap_err();
        assert_eq!(err.provider_status(), Some(429));
        assert!(err.to_string().contains("rate limited: slow down"));
    }
}
