//! HTTP-backed refinement capability (OpenAI-compatible chat completions).
//!
//! Generation goes to the endpoint; verification keeps the rule-based
//! default from the `refinement` crate.

use async_trait::async_trait;
use refinement::capability::{CapabilityError, GenerationRequest, RefinementCapability};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::RunnerConfig;

const SYSTEM_PROMPT: &str = "You revise one section of a longer document. \
Keep every [[key: value]] and [[key]] marker intact unless the instruction says otherwise. \
Reply with the revised section only.";

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    max_tokens: u32,
    temperature: f32,
}

#[derive(Debug, Serialize, Deserialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    content: Option<String>,
}

pub struct HttpCapability {
    config: RunnerConfig,
    http: reqwest::Client,
}

impl HttpCapability {
    pub fn new(config: RunnerConfig) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()?;
        Ok(Self { config, http })
    }

    fn build_request(&self, request: &GenerationRequest) -> ChatRequest {
        ChatRequest {
            model: self.config.model.clone(),
            messages: vec![
                ChatMessage {
                    role: "system".to_string(),
                    content: SYSTEM_PROMPT.to_string(),
                },
                ChatMessage {
                    role: "user".to_string(),
                    content: request.render_prompt(),
                },
            ],
            max_tokens: self.config.max_tokens,
            temperature: self.config.temperature_for(request.candidate_index),
        }
    }

    fn map_send_error(&self, e: reqwest::Error) -> CapabilityError {
        if e.is_timeout() {
            CapabilityError::Timeout {
                after_ms: self.config.request_timeout.as_millis() as u64,
            }
        } else {
            CapabilityError::Failure(format!("HTTP request failed: {}", e))
        }
    }
}

/// Strip a surrounding code fence some models add.
fn strip_fence(text: &str) -> String {
    let trimmed = text.trim();
    if let Some(inner) = trimmed.strip_prefix("```") {
        let body = inner.split_once('\n').map(|(_, rest)| rest).unwrap_or("");
        return body.trim_end().trim_end_matches("```").trim().to_string();
    }
    trimmed.to_string()
}

#[async_trait]
impl RefinementCapability for HttpCapability {
    async fn generate(&self, request: &GenerationRequest) -> Result<String, CapabilityError> {
        let body = self.build_request(request);
        debug!(
            unit_id = %request.unit_id,
            round = request.round_index,
            candidate = request.candidate_index,
            temperature = body.temperature,
            "Requesting candidate"
        );

        let mut call = self.http.post(self.config.chat_url()).json(&body);
        if let Some(key) = &self.config.api_key {
            call = call.bearer_auth(key);
        }
        let response = call.send().await.map_err(|e| self.map_send_error(e))?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(CapabilityError::Failure(format!("LLM API error ({}): {}", status, text)));
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| CapabilityError::Failure(format!("Failed to parse response: {}", e)))?;
        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| CapabilityError::Failure("No response from LLM".to_string()))?;

        let text = strip_fence(&content);
        if text.is_empty() {
            return Err(CapabilityError::Failure("empty completion".to_string()));
        }
        Ok(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use refinement::stage::{ReferenceFacts, StageKind};

    fn request(candidate_index: usize) -> GenerationRequest {
        GenerationRequest {
            unit_id: "u-01".to_string(),
            unit_title: "Introduction".to_string(),
            content: "The amplifier reaches [[gain: 3 dB]].".to_string(),
            stage: StageKind::DiffVerify,
            instruction: StageKind::DiffVerify.instruction().to_string(),
            carry_over: String::new(),
            candidate_index,
            round_index: 2,
            context_header: String::new(),
            reference_facts: ReferenceFacts::new(),
        }
    }

    #[test]
    fn test_build_request_shape() {
        let cap = HttpCapability::new(RunnerConfig::from_lookup(|_| None)).unwrap();
        let body = cap.build_request(&request(1));
        assert_eq!(body.messages.len(), 2);
        assert_eq!(body.messages[0].role, "system");
        assert!(body.messages[1].content.contains("Section 'Introduction'"));
        assert!((body.temperature - 0.5).abs() < 1e-6);

        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["model"], "default");
        assert_eq!(json["max_tokens"], 4096);
    }

    #[test]
    fn test_strip_fence() {
        assert_eq!(strip_fence("```markdown\nRevised text.\n```"), "Revised text.");
        assert_eq!(strip_fence("  plain text \n"), "plain text");
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_a_failure() {
        let config = RunnerConfig::from_lookup(|k| match k {
            "REFINE_ENDPOINT_URL" => Some("http://127.0.0.1:9/v1".to_string()),
            "REFINE_REQUEST_TIMEOUT_SECS" => Some("2".to_string()),
            _ => None,
        });
        let cap = HttpCapability::new(config).unwrap();
        assert!(cap.generate(&request(0)).await.is_err());
    }
}
