//! HTTP dispatch backed by `reqwest`.

use std::collections::BTreeMap;
use std::time::Instant;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{AdapterError, HttpAuth, HttpDispatch, HttpOutcome, HttpRequest};

/// `reqwest`-based HTTP adapter.
///
/// Holds two clients: the default verifying client and one that accepts
/// invalid certificates, selected per request by `verify_tls` (internal
/// appliances frequently carry self-signed certificates).
pub struct ReqwestHttp {
    verifying: reqwest::Client,
    permissive: reqwest::Client,
}

impl ReqwestHttp {
    pub fn new() -> Result<Self, AdapterError> {
        let verifying = reqwest::Client::builder()
            .build()
            .map_err(|e| AdapterError::Transport(format!("failed to build client: {e}")))?;
        let permissive = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .build()
            .map_err(|e| AdapterError::Transport(format!("failed to build client: {e}")))?;
        Ok(Self {
            verifying,
            permissive,
        })
    }
}

#[async_trait]
impl HttpDispatch for ReqwestHttp {
    async fn send(
        &self,
        request: &HttpRequest,
        cancel: &CancellationToken,
    ) -> Result<HttpOutcome, AdapterError> {
        let method: reqwest::Method = request
            .method
            .to_ascii_uppercase()
            .parse()
            .map_err(|_| AdapterError::Transport(format!("invalid method {}", request.method)))?;

        let client = if request.verify_tls {
            &self.verifying
        } else {
            &self.permissive
        };

        let mut builder = client
            .request(method, &request.url)
            .timeout(request.timeout);

        for (key, value) in &request.headers {
            builder = builder.header(key, value);
        }
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        if let Some(body) = &request.body {
            builder = match body {
                serde_json::Value::String(raw) => builder.body(raw.clone()),
                other => builder.json(other),
            };
        }
        match &request.auth {
            Some(HttpAuth::Basic { username, password }) => {
                builder = builder.basic_auth(username, Some(password));
            }
            Some(HttpAuth::Bearer { token }) => {
                builder = builder.bearer_auth(token);
            }
            None => {}
        }

        debug!(method = %request.method, url = %request.url, "sending http request");
        let started = Instant::now();
        let classify = |err: reqwest::Error| classify_reqwest_error(err, request.timeout);

        let response = tokio::select! {
            result = builder.send() => result.map_err(classify)?,
            _ = cancel.cancelled() => return Err(AdapterError::Cancelled),
        };

        let status = response.status().as_u16();
        let headers: BTreeMap<String, String> = response
            .headers()
            .iter()
            .map(|(k, v)| {
                (
                    k.as_str().to_owned(),
                    v.to_str().unwrap_or_default().to_owned(),
                )
            })
            .collect();

        let body = tokio::select! {
            result = response.text() => result.map_err(classify)?,
            _ = cancel.cancelled() => return Err(AdapterError::Cancelled),
        };

        Ok(HttpOutcome {
            status,
            body,
            headers,
            duration_ms: started.elapsed().as_millis() as i64,
        })
    }
}

fn classify_reqwest_error(err: reqwest::Error, timeout: std::time::Duration) -> AdapterError {
    if err.is_timeout() {
        AdapterError::Timeout(timeout)
    } else if err.is_connect() {
        AdapterError::ConnectFailure(err.to_string())
    } else {
        AdapterError::Transport(err.to_string())
    }
}
