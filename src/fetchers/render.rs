use std::time::Duration;

use serde_json::{Value, json};

use super::adapter::{FetchAdapter, FetchRequest};
use super::http::parse_body;
use crate::config::RenderServiceConfig;
use crate::error::FetchError;
use crate::schema::FetchMechanism;

const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// Adapter for the `browser` and `crawl` mechanisms.
///
/// Page rendering and content extraction happen in an external
/// service. This adapter POSTs
///
/// ```text
/// { "url": ..., "mode": "browser" | "crawl", "hints": ... }
/// ```
///
/// to the service and expects the extracted JSON payload back.
/// The optional `data` envelope used by most render services is
/// unwrapped.
pub struct RenderServiceAdapter {
    client: reqwest::Client,
    endpoint: String,
    token: Option<String>,
}

impl RenderServiceAdapter {
    pub fn new(cfg: &RenderServiceConfig) -> Result<Self, FetchError> {
        Ok(Self {
            client: reqwest::Client::builder().build()?,
            endpoint: cfg.url.trim_end_matches('/').to_string(),
            token: cfg.token.clone(),
        })
    }

    fn request_body(request: &FetchRequest) -> Value {
        json!({
            "url": request.url,
            "mode": request.mechanism.as_str(),
            "hints": request.hints.clone().unwrap_or(Value::Null),
            "headers": request.headers,
            "timeout_ms": request.timeout.as_millis() as u64,
        })
    }
}

#[async_trait::async_trait]
impl FetchAdapter for RenderServiceAdapter {
    fn name(&self) -> &'static str {
        "render-service"
    }

    async fn fetch(&self, request: &FetchRequest) -> Result<Value, FetchError> {
        if request.mechanism == FetchMechanism::Http {
            return Err(FetchError::Adapter(
                "render service does not handle plain http sources".to_string(),
            ));
        }

        let mut req = self
            .client
            .post(format!("{}/extract", self.endpoint))
            .timeout(request.timeout)
            .json(&Self::request_body(request));
        if let Some(token) = &self.token {
            req = req.bearer_auth(token);
        }

        let resp = req.send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                status: status.as_u16(),
                url: request.url.clone(),
            });
        }

        let body = parse_body(&resp.bytes().await?)?;
        Ok(unwrap_envelope(body))
    }

    async fn probe(&self) -> bool {
        match self
            .client
            .get(format!("{}/health", self.endpoint))
            .timeout(PROBE_TIMEOUT)
            .send()
            .await
        {
            Ok(resp) => resp.status().is_success(),
            Err(_) => false,
        }
    }
}

fn unwrap_envelope(body: Value) -> Value {
    match body {
        Value::Object(mut map) if map.contains_key("data") && map.len() <= 3 => {
            map.remove("data").unwrap_or(Value::Null)
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn envelope_is_unwrapped() {
        let body = json!({ "success": true, "data": { "players": [] } });
        assert_eq!(unwrap_envelope(body), json!({ "players": [] }));

        let bare = json!({ "players": [1] });
        assert_eq!(unwrap_envelope(bare.clone()), bare);
    }

    #[test]
    fn request_body_carries_mode_and_hints() {
        let req = FetchRequest {
            source_id: "rotowire-injuries".to_string(),
            url: "https://www.example.com/injuries".to_string(),
            mechanism: FetchMechanism::Browser,
            hints: Some(json!({ "selector": "table.injuries" })),
            headers: HashMap::new(),
            timeout: Duration::from_secs(10),
        };

        let body = RenderServiceAdapter::request_body(&req);
        assert_eq!(body["mode"], "browser");
        assert_eq!(body["hints"]["selector"], "table.injuries");
        assert_eq!(body["timeout_ms"], 10_000);
    }
}
