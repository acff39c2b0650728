//! OpenAI-compatible HTTP client.
//!
//! One client serves free-text generation, schema-constrained decisions and
//! embeddings. Profiles made with [`HttpLlmClient::with_profile`] share the
//! underlying connection pool.

use std::time::Instant;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info};

use prodlens_core::config::LlmConfig;
use prodlens_core::error::Result;
use prodlens_core::services::{DecisionGenerator, DecisionSchema, EmbeddingService, TextGenerator};

use crate::error::LlmError;

const MAX_LOG_CHARS: usize = 2_000;

/// Connection and generation settings.
#[derive(Clone)]
pub struct HttpLlmClientConfig {
    /// Base URL, e.g. `https://api.openai.com/v1`.
    pub endpoint: String,
    pub api_key: Option<String>,
    pub model: String,
    pub temperature: f32,
    pub max_tokens: Option<u32>,
    pub embedding_model: String,
    pub embedding_dimensions: usize,
    pub timeout_secs: u64,
}

impl Default for HttpLlmClientConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://api.openai.com/v1".to_string(),
            api_key: None,
            model: "gpt-4o-mini".to_string(),
            temperature: 0.1,
            max_tokens: None,
            embedding_model: "text-embedding-3-small".to_string(),
            embedding_dimensions: 1536,
            timeout_secs: 30,
        }
    }
}

impl HttpLlmClientConfig {
    /// Build from the `[llm]` config section, reading the API key from the
    /// configured environment variable.
    pub fn from_llm_config(llm: &LlmConfig) -> Self {
        let api_key = std::env::var(&llm.api_key_env)
            .ok()
            .filter(|k| !k.trim().is_empty());
        Self {
            endpoint: llm.endpoint.clone(),
            api_key,
            model: llm.chat_model.clone(),
            temperature: llm.decision_temperature,
            max_tokens: None,
            embedding_model: llm.embedding_model.clone(),
            embedding_dimensions: llm.embedding_dimensions,
            timeout_secs: llm.request_timeout_secs,
        }
    }
}

impl std::fmt::Debug for HttpLlmClientConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpLlmClientConfig")
            .field("endpoint", &self.endpoint)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("model", &self.model)
            .field("temperature", &self.temperature)
            .field("max_tokens", &self.max_tokens)
            .field("embedding_model", &self.embedding_model)
            .field("timeout_secs", &self.timeout_secs)
            .finish()
    }
}

/// HTTP client for an OpenAI-compatible API.
#[derive(Debug, Clone)]
pub struct HttpLlmClient {
    client: reqwest::Client,
    config: HttpLlmClientConfig,
}

impl HttpLlmClient {
    pub fn new(config: HttpLlmClientConfig) -> std::result::Result<Self, LlmError> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self { client, config })
    }

    /// Same connection pool, different model and temperature.
    pub fn with_profile(&self, model: impl Into<String>, temperature: f32) -> Self {
        let mut config = self.config.clone();
        config.model = model.into();
        config.temperature = temperature;
        Self {
            client: self.client.clone(),
            config,
        }
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.config.max_tokens = Some(max_tokens);
        self
    }

    pub fn config(&self) -> &HttpLlmClientConfig {
        &self.config
    }

    pub fn has_api_key(&self) -> bool {
        self.config.api_key.is_some()
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.config.endpoint.trim_end_matches('/'), path)
    }

    async fn post_json<B, R>(&self, path: &str, body: &B) -> std::result::Result<R, LlmError>
    where
        B: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let mut request = self.client.post(self.url(path)).json(body);
        if let Some(key) = &self.config.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(LlmError::Response(format!(
                "HTTP {}: {}",
                status,
                truncate_for_log(&text, 500)
            )));
        }

        let text = response.text().await?;
        serde_json::from_str(&text).map_err(|e| LlmError::Serialization(e.to_string()))
    }

    async fn chat(
        &self,
        system: &str,
        user: &str,
        response_format: Option<Value>,
    ) -> std::result::Result<String, LlmError> {
        let body = ChatRequest {
            model: &self.config.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: system,
                },
                ChatMessage {
                    role: "user",
                    content: user,
                },
            ],
            temperature: self.config.temperature,
            max_tokens: self.config.max_tokens,
            response_format,
        };

        debug!(
            model = %self.config.model,
            user = %truncate_for_log(user, MAX_LOG_CHARS),
            "Chat completion request"
        );
        let started = Instant::now();
        let parsed: ChatResponse = self.post_json("chat/completions", &body).await?;

        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| LlmError::Response("Missing choices".to_string()))?;

        info!(
            model = %self.config.model,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Chat completion received"
        );
        debug!(output = %truncate_for_log(&content, MAX_LOG_CHARS), "Chat completion output");
        Ok(content)
    }
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessageResponse,
}

#[derive(Debug, Deserialize)]
struct ChatMessageResponse {
    content: Option<String>,
}

#[derive(Debug, Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: [&'a str; 1],
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
}

#[async_trait]
impl TextGenerator for HttpLlmClient {
    async fn generate(&self, system: &str, user: &str) -> Result<String> {
        Ok(self.chat(system, user, None).await?)
    }
}

#[async_trait]
impl DecisionGenerator for HttpLlmClient {
    async fn decide(&self, system: &str, user: &str, schema: &DecisionSchema) -> Result<Value> {
        let response_format = json!({
            "type": "json_schema",
            "json_schema": {
                "name": schema.name,
                "schema": schema.schema,
            }
        });
        let content = self.chat(system, user, Some(response_format)).await?;
        Ok(parse_decision(&content)?)
    }
}

#[async_trait]
impl EmbeddingService for HttpLlmClient {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let body = EmbeddingRequest {
            model: &self.config.embedding_model,
            input: [text],
        };
        let started = Instant::now();
        let parsed: EmbeddingResponse = self.post_json("embeddings", &body).await?;
        let embedding = parsed
            .data
            .into_iter()
            .next()
            .map(|d| d.embedding)
            .ok_or_else(|| LlmError::Response("Missing embedding data".to_string()))?;
        info!(
            model = %self.config.embedding_model,
            dimensions = embedding.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Embedding received"
        );
        Ok(embedding)
    }

    fn dimensions(&self) -> usize {
        self.config.embedding_dimensions
    }
}

/// Parse a decision object out of model output, tolerating code fences and
/// surrounding prose.
pub fn parse_decision(text: &str) -> std::result::Result<Value, LlmError> {
    let json = extract_json(text).ok_or_else(|| {
        LlmError::Serialization(format!(
            "no JSON object in {:?}",
            truncate_for_log(text, 200)
        ))
    })?;
    let value: Value =
        serde_json::from_str(json).map_err(|e| LlmError::Serialization(e.to_string()))?;
    if !value.is_object() {
        return Err(LlmError::Serialization(
            "decision is not a JSON object".to_string(),
        ));
    }
    Ok(value)
}

fn extract_json(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end <= start {
        return None;
    }
    Some(&text[start..=end])
}

fn truncate_for_log(input: &str, max_chars: usize) -> String {
    if input.chars().count() <= max_chars {
        return input.to_string();
    }
    let truncated: String = input.chars().take(max_chars).collect();
    format!("{}...", truncated)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::post;
    use axum::{Json, Router};
    use prodlens_core::error::ProdLensError;

    type Captured = Arc<Mutex<Vec<(Option<String>, Value)>>>;

    async fn spawn(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{}/v1", addr)
    }

    fn chat_router(reply: &str, captured: Captured) -> Router {
        let reply = reply.to_string();
        Router::new().route(
            "/v1/chat/completions",
            post(move |headers: HeaderMap, Json(body): Json<Value>| {
                let captured = Arc::clone(&captured);
                let reply = reply.clone();
                async move {
                    let auth = headers
                        .get("authorization")
                        .and_then(|v| v.to_str().ok())
                        .map(String::from);
                    captured.lock().unwrap().push((auth, body));
                    Json(json!({
                        "choices": [{"message": {"role": "assistant", "content": reply}}]
                    }))
                }
            }),
        )
    }

    fn client(endpoint: String, api_key: Option<&str>) -> HttpLlmClient {
        HttpLlmClient::new(HttpLlmClientConfig {
            endpoint,
            api_key: api_key.map(String::from),
            timeout_secs: 5,
            ..Default::default()
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_generate_sends_system_and_user_messages() {
        let captured: Captured = Arc::default();
        let endpoint = spawn(chat_router("  Hello there  ", Arc::clone(&captured))).await;
        let client = client(endpoint, Some("sk-test"));

        let text = client.generate("be brief", "hi").await.unwrap();
        assert_eq!(text, "  Hello there  ");

        let calls = captured.lock().unwrap();
        let (auth, body) = &calls[0];
        assert_eq!(auth.as_deref(), Some("Bearer sk-test"));
        assert_eq!(body["model"], "gpt-4o-mini");
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][0]["content"], "be brief");
        assert_eq!(body["messages"][1]["content"], "hi");
        assert!(body.get("response_format").is_none());
        assert!(body.get("max_tokens").is_none());
    }

    #[tokio::test]
    async fn test_profile_changes_model_and_temperature() {
        let captured: Captured = Arc::default();
        let endpoint = spawn(chat_router("SELECT 1", Arc::clone(&captured))).await;
        let client = client(endpoint, None)
            .with_profile("gpt-4o", 0.0)
            .with_max_tokens(800);

        client.generate("sys", "q").await.unwrap();

        let calls = captured.lock().unwrap();
        let (auth, body) = &calls[0];
        assert!(auth.is_none());
        assert_eq!(body["model"], "gpt-4o");
        assert_eq!(body["temperature"], 0.0);
        assert_eq!(body["max_tokens"], 800);
    }

    #[tokio::test]
    async fn test_decide_requests_json_schema_and_parses_fenced_reply() {
        let captured: Captured = Arc::default();
        let reply = "```json\n{\"route\": \"semantic_retrieval\", \"reasoning\": \"definition\"}\n```";
        let endpoint = spawn(chat_router(reply, Arc::clone(&captured))).await;
        let client = client(endpoint, None);

        let schema = DecisionSchema::new("route_decision", json!({"type": "object"}));
        let decision = client.decide("sys", "What is refresh rate?", &schema).await.unwrap();
        assert_eq!(decision["route"], "semantic_retrieval");

        let calls = captured.lock().unwrap();
        let format = &calls[0].1["response_format"];
        assert_eq!(format["type"], "json_schema");
        assert_eq!(format["json_schema"]["name"], "route_decision");
    }

    #[tokio::test]
    async fn test_decide_rejects_non_json_reply() {
        let endpoint = spawn(chat_router("I think it is rag", Arc::default())).await;
        let client = client(endpoint, None);
        let schema = DecisionSchema::new("x", json!({}));
        let err = client.decide("s", "u", &schema).await.unwrap_err();
        assert!(matches!(err, ProdLensError::Llm(_)));
    }

    #[tokio::test]
    async fn test_http_error_status_is_llm_error() {
        let router = Router::new().route(
            "/v1/chat/completions",
            post(|| async { (StatusCode::INTERNAL_SERVER_ERROR, "upstream exploded") }),
        );
        let endpoint = spawn(router).await;
        let err = client(endpoint, None).generate("s", "u").await.unwrap_err();
        let message = err.to_string();
        assert!(message.contains("500"));
        assert!(message.contains("upstream exploded"));
    }

    #[tokio::test]
    async fn test_missing_choices_is_error() {
        let router = Router::new().route(
            "/v1/chat/completions",
            post(|| async { Json(json!({"choices": []})) }),
        );
        let endpoint = spawn(router).await;
        let err = client(endpoint, None).generate("s", "u").await.unwrap_err();
        assert!(err.to_string().contains("Missing choices"));
    }

    #[tokio::test]
    async fn test_embed() {
        let router = Router::new().route(
            "/v1/embeddings",
            post(|Json(body): Json<Value>| async move {
                assert_eq!(body["model"], "text-embedding-3-small");
                assert_eq!(body["input"][0], "refresh rate");
                Json(json!({"data": [{"embedding": [0.25, -0.5, 1.0]}]}))
            }),
        );
        let endpoint = spawn(router).await;
        let client = client(endpoint, None);
        assert_eq!(
            client.embed("refresh rate").await.unwrap(),
            vec![0.25, -0.5, 1.0]
        );
        assert_eq!(client.dimensions(), 1536);
    }

    #[tokio::test]
    async fn test_connection_refused_is_llm_error() {
        let client = client("http://127.0.0.1:1/v1".to_string(), None);
        assert!(matches!(
            client.generate("s", "u").await,
            Err(ProdLensError::Llm(_))
        ));
    }

    #[test]
    fn test_parse_decision_variants() {
        assert_eq!(
            parse_decision("{\"a\": 1}").unwrap()["a"],
            1
        );
        assert_eq!(
            parse_decision("Sure! {\"content_type\": \"reviews\"} hope that helps").unwrap()
                ["content_type"],
            "reviews"
        );
        assert!(parse_decision("no braces").is_err());
        assert!(parse_decision("} backwards {").is_err());
    }

    #[test]
    fn test_from_llm_config_reads_env_key() {
        let mut llm = LlmConfig::default();
        llm.api_key_env = "PRODLENS_TEST_KEY_THAT_IS_NOT_SET".to_string();
        let config = HttpLlmClientConfig::from_llm_config(&llm);
        assert!(config.api_key.is_none());
        assert_eq!(config.model, "gpt-4o-mini");
        assert_eq!(config.embedding_dimensions, 1536);
        assert!(!format!("{:?}", config).contains("sk-"));
    }

    #[test]
    fn test_truncate_for_log() {
        assert_eq!(truncate_for_log("abc", 5), "abc");
        assert_eq!(truncate_for_log("abcdef", 3), "abc...");
    }
}
