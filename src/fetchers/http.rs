use std::io::Read;

use flate2::read::GzDecoder;
use serde_json::Value;

use super::adapter::{FetchAdapter, FetchRequest};
use crate::error::FetchError;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Plain HTTP adapter.
///
/// Performs a GET with the source's headers and parses the body
/// as JSON. Bodies served as raw gzip files (`.json.gz` feeds)
/// are decompressed before parsing.
pub struct HttpAdapter {
    client: reqwest::Client,
}

impl HttpAdapter {
    pub fn new() -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("sportsfeed-collector/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client })
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait::async_trait]
impl FetchAdapter for HttpAdapter {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn fetch(&self, request: &FetchRequest) -> Result<Value, FetchError> {
        let mut req = self.client.get(&request.url).timeout(request.timeout);
        for (key, value) in &request.headers {
            req = req.header(key.as_str(), value.as_str());
        }

        let resp = req.send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                status: status.as_u16(),
                url: request.url.clone(),
            });
        }

        let body = resp.bytes().await?;
        parse_body(&body)
    }
}

/// Parses a response body as JSON, inflating gzip first if needed.
pub(crate) fn parse_body(body: &[u8]) -> Result<Value, FetchError> {
    if body.starts_with(&GZIP_MAGIC) {
        let mut inflated = Vec::new();
        GzDecoder::new(body)
            .read_to_end(&mut inflated)
            .map_err(|e| FetchError::Decode(format!("gzip: {e}")))?;
        return serde_json::from_slice(&inflated).map_err(|e| FetchError::Decode(e.to_string()));
    }

    serde_json::from_slice(body).map_err(|e| FetchError::Decode(e.to_string()))
}
