use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, instrument};

use relay_core::config::RetrievalConfig;
use relay_core::errors::BackendError;
use relay_core::retrieval::{RetrievalResult, Retriever};

const RETRIEVAL_TIMEOUT: Duration = Duration::from_secs(30);

/// Knowledge-base lookup over HTTP.
///
/// Sends `{"retrievalQuery":{"text":..},"retrievalConfiguration":..}` and reads
/// `retrievalResults[].{content.text, location.s3Location.uri, score}`.
pub struct HttpRetriever {
    client: Client,
    url: String,
    max_results: usize,
}

impl HttpRetriever {
    pub fn new(config: &RetrievalConfig) -> Result<Self, BackendError> {
        let client = Client::builder()
            .timeout(RETRIEVAL_TIMEOUT)
            .build()
            .map_err(|e| BackendError::NetworkError(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            url: config.url.clone(),
            max_results: config.max_results,
        })
    }
}

#[async_trait]
impl Retriever for HttpRetriever {
    #[instrument(skip(self, query), fields(url = %self.url))]
    async fn retrieve(&self, query: &str) -> Result<Vec<RetrievalResult>, BackendError> {
        let body = json!({
            "retrievalQuery": { "text": query },
            "retrievalConfiguration": {
                "vectorSearchConfiguration": { "numberOfResults": self.max_results },
            },
        });

        let resp = self
            .client
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    BackendError::Timeout(RETRIEVAL_TIMEOUT)
                } else {
                    BackendError::NetworkError(e.to_string())
                }
            })?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(BackendError::from_status(status, body));
        }

        let parsed: RetrieveResponse = resp
            .json()
            .await
            .map_err(|e| BackendError::InvalidRequest(format!("unreadable retrieval response: {e}")))?;

        let results: Vec<RetrievalResult> = parsed
            .retrieval_results
            .into_iter()
            .map(|r| RetrievalResult {
                text: r.content.and_then(|c| c.text).unwrap_or_default(),
                source_uri: r
                    .location
                    .and_then(|l| l.s3_location)
                    .and_then(|s| s.uri)
                    .unwrap_or_default(),
                score: r.score.unwrap_or(0.0),
            })
            .collect();
        debug!(count = results.len(), "retrieval finished");
        Ok(results)
    }
}

#[derive(Deserialize)]
struct RetrieveResponse {
    #[serde(rename = "retrievalResults", default)]
    retrieval_results: Vec<RawResult>,
}

#[derive(Deserialize)]
struct RawResult {
    content: Option<RawContent>,
    location: Option<RawLocation>,
    score: Option<f64>,
}

#[derive(Deserialize)]
struct RawContent {
    text: Option<String>,
}

#[derive(Deserialize)]
struct RawLocation {
    #[serde(rename = "s3Location")]
    s3_location: Option<RawS3Location>,
}

#[derive(Deserialize)]
struct RawS3Location {
    uri: Option<String>,
}
