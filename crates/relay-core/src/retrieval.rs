//! Retrieved source snippets and the citation block appended to answers.

use std::collections::HashSet;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::errors::BackendError;

pub const DEFAULT_MIN_SCORE: f64 = 0.5;
pub const DEFAULT_MAX_RESULTS: usize = 5;

const CITATION_HEADER: &str = "\n\n📚 Sources\n";

/// One scored snippet returned by a document lookup.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RetrievalResult {
    pub text: String,
    pub source_uri: String,
    pub score: f64,
}

/// Document lookup used to ground answers and build citations.
#[async_trait]
pub trait Retriever: Send + Sync {
    async fn retrieve(&self, query: &str) -> Result<Vec<RetrievalResult>, BackendError>;
}

/// Keep results scoring at least `min_score`, capped at `max_results`, in lookup order.
pub fn filter_relevant(
    results: Vec<RetrievalResult>,
    min_score: f64,
    max_results: usize,
) -> Vec<RetrievalResult> {
    results
        .into_iter()
        .filter(|r| r.score >= min_score)
        .take(max_results)
        .collect()
}

/// Last path segment of a source location.
pub fn file_name(uri: &str) -> &str {
    uri.trim_end_matches('/').rsplit('/').next().unwrap_or(uri)
}

/// Publicly reachable URL for a source location.
///
/// `s3://bucket/key` maps to the bucket's virtual-hosted URL with the key
/// percent-encoded segment by segment.
pub fn public_url(uri: &str) -> Option<String> {
    if uri.starts_with("https://") || uri.starts_with("http://") {
        return Some(uri.to_string());
    }
    let rest = uri.strip_prefix("s3://")?;
    let (bucket, key) = rest.split_once('/')?;
    if bucket.is_empty() || key.is_empty() {
        return None;
    }
    let encoded: Vec<String> = key
        .split('/')
        .map(|segment| urlencoding::encode(segment).into_owned())
        .collect();
    Some(format!("https://{bucket}.s3.amazonaws.com/{}", encoded.join("/")))
}

/// Citation block listing each distinct source file once.
pub fn format_citations(results: &[RetrievalResult]) -> Option<String> {
    let mut seen = HashSet::new();
    let mut lines = Vec::new();

    for result in results {
        if result.source_uri.is_empty() {
            continue;
        }
        let name = file_name(&result.source_uri);
        if name.is_empty() || !seen.insert(name.to_string()) {
            continue;
        }
        match public_url(&result.source_uri) {
            Some(url) => lines.push(format!("{name} ({url})")),
            None => lines.push(name.to_string()),
        }
    }

    if lines.is_empty() {
        return None;
    }
    Some(format!("{CITATION_HEADER}{}", lines.join("\n")))
}

/// Wrap the question with the retrieved snippets as grounding context.
pub fn contextualize(prompt: &str, results: &[RetrievalResult]) -> String {
    let snippets: Vec<&str> = results
        .iter()
        .map(|r| r.text.trim())
        .filter(|t| !t.is_empty())
        .collect();
    if snippets.is_empty() {
        return prompt.to_string();
    }
    format!(
        "Use the following context to answer the question.\n<context>\n{}\n</context>\n\n<question>\n{}\n</question>",
        snippets.join("\n\n"),
        prompt
    )
}
