//! Stage processor that calls a remote endpoint per stage.

use async_trait::async_trait;
use std::time::Duration;
use tracing::debug;

use super::{StageProcessor, StageRequest, StageResponse};

const MAX_ERROR_BODY: usize = 512;

/// Posts each stage request to `{base_url}/{stage_id}`.
///
/// The request body is `{"organization": ..., "priorStageOutputs": ...}` and
/// the response body is decoded as a [`StageResponse`]. Transport errors,
/// non-success statuses and undecodable bodies all become failed responses.
#[derive(Debug, Clone)]
pub struct HttpStageProcessor {
    client: reqwest::Client,
    base_url: String,
}

impl HttpStageProcessor {
    /// Creates a processor with a default client.
    #[must_use]
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(reqwest::Client::new(), base_url)
    }

    /// Creates a processor with a caller-supplied client.
    #[must_use]
    pub fn with_client(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into(),
        }
    }

    /// Creates a processor whose client enforces a request timeout.
    pub fn with_timeout(base_url: impl Into<String>, timeout: Duration) -> reqwest::Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self::with_client(client, base_url))
    }

    /// Endpoint for a stage.
    #[must_use]
    pub fn endpoint(&self, stage_id: &str) -> String {
        format!("{}/{}", self.base_url.trim_end_matches('/'), stage_id)
    }
}

#[async_trait]
impl StageProcessor for HttpStageProcessor {
    async fn process(&self, request: &StageRequest) -> StageResponse {
        let url = self.endpoint(request.stage.id());
        debug!(%url, attempt = request.attempt, "Posting stage request");

        let response = match self.client.post(&url).json(request).send().await {
            Ok(response) => response,
            Err(e) => return StageResponse::fail(format!("request to {url} failed: {e}")),
        };

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let body: String = body.chars().take(MAX_ERROR_BODY).collect();
            return StageResponse::fail(format!("{url} returned {status}: {body}"));
        }

        match response.json::<StageResponse>().await {
            Ok(decoded) => decoded,
            Err(e) => StageResponse::fail(format!("invalid response body from {url}: {e}")),
        }
    }
}
