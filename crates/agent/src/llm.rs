use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use propline_core::config::{LlmConfig, LlmProvider};
use propline_core::flows::IntakeStep;

use crate::conversation::RuleBasedExtractor;

const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
const OLLAMA_BASE_URL: &str = "http://localhost:11434/v1";
const ANTHROPIC_BASE_URL: &str = "https://api.anthropic.com";
const ANTHROPIC_VERSION: &str = "2023-06-01";
const MAX_OUTPUT_TOKENS: u32 = 512;

/// One extraction call. `step` is carried for clients that do not read prose
/// prompts; HTTP clients only send `system` and `user`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CompletionRequest {
    pub step: IntakeStep,
    pub system: String,
    pub user: String,
}

#[async_trait]
pub trait LlmClient: Send + Sync {
    fn provider(&self) -> &'static str;
    async fn complete(&self, request: &CompletionRequest) -> Result<String>;
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
    max_tokens: u32,
    response_format: ResponseFormat,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatReply,
}

#[derive(Debug, Deserialize)]
struct ChatReply {
    content: Option<String>,
}

/// Chat-completions client for OpenAI and any server speaking the same
/// protocol (Ollama, vLLM, LM Studio).
pub struct OpenAiCompatibleClient {
    provider: &'static str,
    base_url: String,
    api_key: Option<SecretString>,
    model: String,
    http: reqwest::Client,
}

impl OpenAiCompatibleClient {
    pub fn new(
        provider: &'static str,
        base_url: impl Into<String>,
        api_key: Option<SecretString>,
        model: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            provider,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
            model: model.into(),
            http,
        })
    }
}

#[async_trait]
impl LlmClient for OpenAiCompatibleClient {
    fn provider(&self) -> &'static str {
        self.provider
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<String> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = ChatCompletionRequest {
            model: &self.model,
            messages: vec![
                ChatMessage { role: "system", content: &request.system },
                ChatMessage { role: "user", content: &request.user },
            ],
            temperature: 0.0,
            max_tokens: MAX_OUTPUT_TOKENS,
            response_format: ResponseFormat { kind: "json_object" },
        };

        let mut call = self.http.post(&url).json(&body);
        if let Some(api_key) = &self.api_key {
            call = call.bearer_auth(api_key.expose_secret());
        }

        let response = call.send().await.context("failed to send completion request")?;
        if !response.status().is_success() {
            let status = response.status();
            let detail = response.text().await.unwrap_or_default();
            bail!("completion endpoint returned {status}: {}", truncate(&detail, 200));
        }

        let completion: ChatCompletionResponse =
            response.json().await.context("failed to decode completion response")?;
        completion
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| anyhow::anyhow!("completion response had no content"))
    }
}

#[derive(Debug, Serialize)]
struct AnthropicRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    system: &'a str,
    messages: Vec<ChatMessage<'a>>,
}

#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    content: Vec<AnthropicBlock>,
}

#[derive(Debug, Deserialize)]
struct AnthropicBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: Option<String>,
}

pub struct AnthropicClient {
    base_url: String,
    api_key: SecretString,
    model: String,
    http: reqwest::Client,
}

impl AnthropicClient {
    pub fn new(
        base_url: impl Into<String>,
        api_key: SecretString,
        model: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
            model: model.into(),
            http,
        })
    }
}

#[async_trait]
impl LlmClient for AnthropicClient {
    fn provider(&self) -> &'static str {
        LlmProvider::Anthropic.as_str()
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<String> {
        let url = format!("{}/v1/messages", self.base_url);
        let body = AnthropicRequest {
            model: &self.model,
            max_tokens: MAX_OUTPUT_TOKENS,
            system: &request.system,
            messages: vec![ChatMessage { role: "user", content: &request.user }],
        };

        let response = self
            .http
            .post(&url)
            .header("x-api-key", self.api_key.expose_secret())
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&body)
            .send()
            .await
            .context("failed to send messages request")?;
        if !response.status().is_success() {
            let status = response.status();
            let detail = response.text().await.unwrap_or_default();
            bail!("messages endpoint returned {status}: {}", truncate(&detail, 200));
        }

        let message: AnthropicResponse =
            response.json().await.context("failed to decode messages response")?;
        let text: String = message
            .content
            .into_iter()
            .filter(|block| block.kind == "text")
            .filter_map(|block| block.text)
            .collect();
        if text.trim().is_empty() {
            bail!("messages response had no text content");
        }
        Ok(text)
    }
}

/// Builds the configured extraction client. Config validation already ensures
/// the hosted providers have the credentials they need.
pub fn build_client(config: &LlmConfig) -> Result<Arc<dyn LlmClient>> {
    let timeout = Duration::from_secs(config.timeout_secs.max(1));
    let client: Arc<dyn LlmClient> = match config.provider {
        LlmProvider::Rules => Arc::new(RuleBasedExtractor::new()),
        LlmProvider::OpenAi => Arc::new(OpenAiCompatibleClient::new(
            LlmProvider::OpenAi.as_str(),
            config.base_url.clone().unwrap_or_else(|| OPENAI_BASE_URL.to_string()),
            config.api_key.clone(),
            config.model.clone(),
            timeout,
        )?),
        LlmProvider::Ollama => Arc::new(OpenAiCompatibleClient::new(
            LlmProvider::Ollama.as_str(),
            config.base_url.clone().unwrap_or_else(|| OLLAMA_BASE_URL.to_string()),
            config.api_key.clone(),
            config.model.clone(),
            timeout,
        )?),
        LlmProvider::Anthropic => {
            let Some(api_key) = config.api_key.clone() else {
                bail!("llm.api_key is required for the anthropic provider");
            };
            Arc::new(AnthropicClient::new(
                config.base_url.clone().unwrap_or_else(|| ANTHROPIC_BASE_URL.to_string()),
                api_key,
                config.model.clone(),
                timeout,
            )?)
        }
    };
    Ok(client)
}

fn truncate(value: &str, max_chars: usize) -> String {
    value.chars().take(max_chars).collect()
}
