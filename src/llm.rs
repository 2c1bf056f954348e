use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }
}

/// The external generation capability. Both calls are side-effect free on
/// the provider, so retrying them is always safe. Tests substitute a stub.
#[async_trait]
pub trait GenerationCapability: Send + Sync {
    /// Open-ended dialogue generation.
    async fn generate(&self, messages: &[Message]) -> Result<String>;

    /// Structured classification over a finished transcript. Returns the
    /// model's raw output; the evaluator owns parsing and validation.
    async fn classify(&self, messages: &[Message]) -> Result<String>;

    /// Cheap reachability probe used by the scheduler's preflight.
    async fn health(&self) -> Result<()>;
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<Message>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: Message,
}

#[derive(Clone)]
pub struct LlmClient {
    api_url: String,
    api_key: String,
    model: String,
    classify_model: Option<String>,
    max_attempts: u32,
    retry_base: Duration,
    client: reqwest::Client,
}

impl LlmClient {
    pub fn new(
        api_url: String,
        api_key: Option<String>,
        model: String,
        classify_model: Option<String>,
        max_attempts: u32,
        retry_base: Duration,
    ) -> Self {
        Self {
            api_url,
            api_key: api_key.unwrap_or_default(),
            model,
            classify_model,
            max_attempts: max_attempts.max(1),
            retry_base,
            client: reqwest::Client::new(),
        }
    }

    async fn chat(&self, messages: &[Message], model: &str, temperature: f32) -> Result<String> {
        let url = format!("{}/chat/completions", self.api_url);

        let request = ChatCompletionRequest {
            model: model.to_string(),
            messages: messages.to_vec(),
            temperature: Some(temperature),
            max_tokens: Some(2000),
        };

        let mut attempt = 0u32;
        loop {
            let mut req = self.client.post(&url).json(&request);

            // API key header is optional for local models.
            if !self.api_key.is_empty() {
                req = req.header("Authorization", format!("Bearer {}", self.api_key));
            }

            let response = req.send().await;

            match response {
                Ok(resp) => {
                    let status = resp.status();

                    if status.is_success() {
                        let completion: ChatCompletionResponse = resp
                            .json()
                            .await
                            .context("Failed to parse generation response")?;

                        return completion
                            .choices
                            .first()
                            .map(|c| c.message.content.clone())
                            .ok_or_else(|| anyhow::anyhow!("No choices in generation response"));
                    }

                    let transient = status.as_u16() == 429 || status.is_server_error();
                    if !transient || attempt + 1 >= self.max_attempts {
                        let body = resp
                            .text()
                            .await
                            .unwrap_or_else(|_| "Unable to read body".to_string());
                        anyhow::bail!("Generation API returned error {}: {}", status, body);
                    }

                    let backoff = self.retry_base * 2u32.pow(attempt);
                    tracing::warn!(
                        "Generation API returned {}, retrying in {:?} (attempt {}/{})",
                        status,
                        backoff,
                        attempt + 1,
                        self.max_attempts
                    );
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
                Err(e) if e.is_timeout() || e.is_connect() => {
                    if attempt + 1 >= self.max_attempts {
                        return Err(anyhow::Error::from(e)
                            .context(format!("Generation request failed after {} attempts", self.max_attempts)));
                    }
                    let backoff = self.retry_base * 2u32.pow(attempt);
                    tracing::warn!(
                        "Generation request failed ({}), retrying in {:?} (attempt {}/{})",
                        e,
                        backoff,
                        attempt + 1,
                        self.max_attempts
                    );
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
                Err(e) => return Err(e).context("Failed to send generation request"),
            }
        }
    }
}

#[async_trait]
impl GenerationCapability for LlmClient {
    async fn generate(&self, messages: &[Message]) -> Result<String> {
        self.chat(messages, &self.model, 0.7).await
    }

    async fn classify(&self, messages: &[Message]) -> Result<String> {
        let model = self.classify_model.as_deref().unwrap_or(&self.model);
        self.chat(messages, model, 0.0).await
    }

    async fn health(&self) -> Result<()> {
        let url = format!("{}/models", self.api_url);
        let mut req = self.client.get(&url).timeout(Duration::from_secs(10));
        if !self.api_key.is_empty() {
            req = req.header("Authorization", format!("Bearer {}", self.api_key));
        }
        let resp = req
            .send()
            .await
            .context("Generation capability unreachable")?;
        if resp.status().is_client_error() && resp.status().as_u16() != 404 {
            anyhow::bail!("Generation capability rejected probe: {}", resp.status());
        }
        Ok(())
    }
}

/// Pull a JSON object out of model output that may wrap it in markdown
/// fencing or leading prose.
pub fn extract_json_block(response: &str) -> &str {
    if let Some(start) = response.find("```json") {
        let after_start = &response[start + 7..];
        if let Some(end) = after_start.find("```") {
            return after_start[..end].trim();
        }
    }
    if let (Some(start), Some(end)) = (response.find('{'), response.rfind('}')) {
        // A closing brace before the first opening one means there is no
        // object here, just stray braces.
        if start < end {
            return &response[start..=end];
        }
    }
    response.trim()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_fenced_json() {
        let raw = "Here you go:\n```json\n{\"outcome\": \"STRONG_MATCH\"}\n```\nDone.";
        assert_eq!(extract_json_block(raw), "{\"outcome\": \"STRONG_MATCH\"}");
    }

    #[test]
    fn extracts_bare_object_with_prose() {
        let raw = "Classification: {\"outcome\": \"no_match\", \"score\": 0} thanks";
        assert_eq!(
            extract_json_block(raw),
            "{\"outcome\": \"no_match\", \"score\": 0}"
        );
    }

    #[test]
    fn passes_through_plain_text() {
        assert_eq!(extract_json_block("  not json  "), "not json");
    }

    #[test]
    fn stray_braces_without_an_object_pass_through() {
        let raw = "score 0.2} because {unfinished";
        assert_eq!(extract_json_block(raw), raw);
    }
}
