//! LLM oracle client.
//!
//! The oracle is a request→text endpoint; every caller extracts a JSON object
//! from the text itself and fails closed when none can be extracted. Raw
//! responses are dumped to `logs/llm_raw/` on parse failure so a bad prompt
//! can be diagnosed after the fact.

use async_trait::async_trait;
use reqwest_middleware::ClientWithMiddleware;
use serde::Deserialize;
use serde_json::Value;
use std::path::PathBuf;
use std::time::Duration;
use tracing::warn;

use crate::domain::errors::OracleError;
use crate::domain::ports::{LlmOracle, OracleRequest};

/// Extract the first JSON object from oracle output. Handles markdown fences
/// and prose preamble; returns None when no balanced object parses.
pub fn extract_json_object(text: &str) -> Option<Value> {
    let trimmed = text.trim();

    if let Ok(value) = serde_json::from_str::<Value>(trimmed)
        && value.is_object()
    {
        return Some(value);
    }

    // Strip ```json fences
    if let Some(start) = trimmed.find("```") {
        let after = &trimmed[start + 3..];
        let after = after.strip_prefix("json").unwrap_or(after);
        if let Some(end) = after.find("```")
            && let Ok(value) = serde_json::from_str::<Value>(after[..end].trim())
            && value.is_object()
        {
            return Some(value);
        }
    }

    // Balanced-brace scan from the first '{'
    let bytes = trimmed.as_bytes();
    let start = trimmed.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, &b) in bytes[start..].iter().enumerate() {
        if escaped {
            escaped = false;
            continue;
        }
        match b {
            b'\\' if in_string => escaped = true,
            b'"' => in_string = !in_string,
            b'{' if !in_string => depth += 1,
            b'}' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    let candidate = &trimmed[start..=start + offset];
                    return serde_json::from_str::<Value>(candidate).ok().filter(|v| v.is_object());
                }
            }
            _ => {}
        }
    }
    None
}

/// Dump a raw unparseable response for later inspection. Best effort.
pub fn dump_raw_response(logs_dir: &PathBuf, stage: &str, task_id: &str, raw: &str) {
    let dir = logs_dir.join("llm_raw");
    if std::fs::create_dir_all(&dir).is_err() {
        return;
    }
    let path = dir.join(format!("{stage}_{task_id}.txt"));
    if let Err(e) = std::fs::write(&path, raw) {
        warn!("Failed to dump raw {stage} response: {e}");
    }
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    text: String,
}

/// HTTP oracle against an inference gateway: POST {model, system, user,
/// max_tokens} → {text}. The per-call deadline comes from the cold-path
/// timeout so a hung endpoint cannot stall a worker past its budget.
pub struct HttpLlmOracle {
    client: ClientWithMiddleware,
    endpoint: String,
    timeout: Duration,
}

impl HttpLlmOracle {
    pub fn new(client: ClientWithMiddleware, endpoint: String, timeout: Duration) -> Self {
        Self { client, endpoint, timeout }
    }
}

#[async_trait]
impl LlmOracle for HttpLlmOracle {
    async fn complete(&self, request: OracleRequest) -> Result<String, OracleError> {
        let body = serde_json::json!({
            "model": request.model,
            "system": request.system_prompt,
            "user": request.user_message,
            "max_tokens": request.max_tokens,
            "metadata": { "stage": request.stage, "token": request.token_symbol },
        });

        let call = self.client.post(&self.endpoint).json(&body).send();

        let response = tokio::time::timeout(self.timeout, call)
            .await
            .map_err(|_| OracleError::Timeout { seconds: self.timeout.as_secs() })?
            .map_err(|e| OracleError::Transport(e.to_string()))?;

        if !response.status().is_success() {
            return Err(OracleError::Transport(format!(
                "oracle endpoint returned HTTP {}",
                response.status()
            )));
        }

        let parsed: CompletionResponse = response
            .json()
            .await
            .map_err(|e| OracleError::Transport(format!("bad oracle envelope: {e}")))?;

        if parsed.text.trim().is_empty() {
            return Err(OracleError::Empty { stage: request.stage });
        }
        Ok(parsed.text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bare_json() {
        let v = extract_json_object(r#"{"verdict": "APPROVE", "confidence": 80}"#).unwrap();
        assert_eq!(v["verdict"], "APPROVE");
    }

    #[test]
    fn parses_fenced_json() {
        let text = "Here is my analysis:\n```json\n{\"trust_score\": 72}\n```\nDone.";
        let v = extract_json_object(text).unwrap();
        assert_eq!(v["trust_score"], 72);
    }

    #[test]
    fn parses_json_with_preamble_and_trailer() {
        let text = "After careful review I conclude: {\"verdict\": \"REJECT\", \"nested\": {\"a\": 1}} — final.";
        let v = extract_json_object(text).unwrap();
        assert_eq!(v["nested"]["a"], 1);
    }

    #[test]
    fn braces_inside_strings_do_not_confuse_the_scan() {
        let text = r#"{"reasoning": "the pattern {x} repeats", "confidence": 55}"#;
        let v = extract_json_object(text).unwrap();
        assert_eq!(v["confidence"], 55);
    }

    #[test]
    fn no_object_returns_none() {
        assert!(extract_json_object("I cannot provide a verdict at this time.").is_none());
        assert!(extract_json_object("[1, 2, 3]").is_none());
        assert!(extract_json_object("").is_none());
    }
}
