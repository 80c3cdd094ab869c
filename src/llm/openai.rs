//! Chapter generation over an OpenAI-compatible chat completions API
//! (OpenAI, vLLM, llama.cpp server, Ollama).

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::{ChapterGenerator, GenerationRequest};
use crate::error::PipelineError;
use crate::model::{Device, LoadedModel, ModelKind, ModelLoader};

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    max_tokens: u32,
    temperature: f32,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
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
    #[serde(default)]
    content: Option<String>,
}

pub struct OpenAiChatGenerator {
    client: Client,
    base_url: String,
    model: String,
    api_key: Option<String>,
    context_window: usize,
}

impl OpenAiChatGenerator {
    pub fn new(
        client: Client,
        base_url: impl Into<String>,
        model: impl Into<String>,
        api_key: Option<String>,
        context_window: usize,
    ) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model: model.into(),
            api_key,
            context_window,
        }
    }
}

#[async_trait]
impl ChapterGenerator for OpenAiChatGenerator {
    fn context_window(&self) -> usize {
        self.context_window
    }

    async fn generate(&self, request: &GenerationRequest) -> Result<String, PipelineError> {
        let body = ChatRequest {
            model: &self.model,
            messages: vec![
                ChatMessage { role: "system", content: &request.system },
                ChatMessage { role: "user", content: &request.prompt },
            ],
            max_tokens: request.max_tokens,
            temperature: request.temperature,
        };

        let mut builder = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .json(&body);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        let response: ChatResponse = builder.send().await?.error_for_status()?.json().await?;
        let content = response
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| PipelineError::validation("completion contained no message"))?;

        debug!(chars = content.len(), "Received chapter completion");
        Ok(content)
    }
}

/// Builds an [`OpenAiChatGenerator`] after checking the endpoint answers.
pub struct OpenAiLoader {
    base_url: String,
    model: String,
    api_key: Option<String>,
    context_window: usize,
    request_timeout: Duration,
}

impl OpenAiLoader {
    pub fn new(
        base_url: impl Into<String>,
        model: impl Into<String>,
        api_key: Option<String>,
        context_window: usize,
    ) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model: model.into(),
            api_key,
            context_window,
            request_timeout: Duration::from_secs(300),
        }
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}

#[async_trait]
impl ModelLoader for OpenAiLoader {
    fn kind(&self) -> ModelKind {
        ModelKind::ChapterGeneration
    }

    async fn load(&self, device: Device) -> Result<LoadedModel, PipelineError> {
        let client = Client::builder()
            .timeout(self.request_timeout)
            .build()
            .map_err(|e| PipelineError::model_load(self.kind(), e.to_string()))?;

        let mut probe = client.get(format!("{}/models", self.base_url));
        if let Some(key) = &self.api_key {
            probe = probe.bearer_auth(key);
        }
        probe
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| {
                PipelineError::model_load(
                    self.kind(),
                    format!("endpoint {} is not reachable: {}", self.base_url, e),
                )
            })?;

        info!(model = %self.model, device = %device, "Chapter generation endpoint ready");
        Ok(LoadedModel::Generator(Arc::new(OpenAiChatGenerator::new(
            client,
            self.base_url.clone(),
            self.model.clone(),
            self.api_key.clone(),
            self.context_window,
        ))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn request() -> GenerationRequest {
        GenerationRequest {
            system: "system".into(),
            prompt: "prompt".into(),
            max_tokens: 64,
            temperature: 0.3,
        }
    }

    #[tokio::test]
    async fn test_generate_returns_first_choice() -> anyhow::Result<()> {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(header("authorization", "Bearer secret"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{"message": {"role": "assistant", "content": "{\"chapters\": []}"}}]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let generator = OpenAiChatGenerator::new(
            Client::new(),
            format!("{}/v1/", server.uri()),
            "test-model",
            Some("secret".into()),
            4096,
        );
        let text = generator.generate(&request()).await?;
        assert_eq!(text, "{\"chapters\": []}");
        Ok(())
    }

    #[tokio::test]
    async fn test_server_errors_are_transient() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let generator = OpenAiChatGenerator::new(Client::new(), server.uri(), "m", None, 4096);
        let err = generator.generate(&request()).await;
        assert!(matches!(err, Err(ref e) if e.is_transient()));
    }

    #[tokio::test]
    async fn test_client_errors_are_fatal() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(400))
            .mount(&server)
            .await;

        let generator = OpenAiChatGenerator::new(Client::new(), server.uri(), "m", None, 4096);
        let err = generator.generate(&request()).await;
        assert!(matches!(err, Err(PipelineError::Fatal(_))));
    }

    #[tokio::test]
    async fn test_loader_probes_endpoint() -> anyhow::Result<()> {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/models"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"data": []})))
            .expect(1)
            .mount(&server)
            .await;

        let loader = OpenAiLoader::new(server.uri(), "m", None, 8192);
        match loader.load(Device::Cpu).await? {
            LoadedModel::Generator(generator) => assert_eq!(generator.context_window(), 8192),
            other => anyhow::bail!("unexpected model: {:?}", other),
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_loader_reports_unreachable_endpoint() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/models"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let loader = OpenAiLoader::new(server.uri(), "m", None, 4096);
        let result = loader.load(Device::Cpu).await;
        assert!(matches!(
            result,
            Err(PipelineError::ModelLoad { kind: ModelKind::ChapterGeneration, .. })
        ));
    }
}
