use quizpipe_core::{AnswerGenerator, Error, Result};
use serde::{Deserialize, Serialize};

pub const DEFAULT_BASE_URL: &str = "https://api.groq.com/openai";
pub const DEFAULT_MODEL: &str = "llama-3.3-70b-versatile";
pub const DEFAULT_TIMEOUT_MS: u64 = 60_000;

fn env(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Chat-completions client for any OpenAI-compatible endpoint (Groq by default).
#[derive(Debug, Clone)]
pub struct OpenAiCompatClient {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    model: String,
    timeout_ms: u64,
}

impl OpenAiCompatClient {
    pub fn new(
        client: reqwest::Client,
        base_url: impl Into<String>,
        api_key: Option<String>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            client,
            base_url: base_url.into(),
            api_key,
            model: model.into(),
            timeout_ms: DEFAULT_TIMEOUT_MS,
        }
    }

    /// Reads `QUIZPIPE_LLM_BASE_URL`, `QUIZPIPE_LLM_API_KEY` (or `GROQ_API_KEY`)
    /// and `QUIZPIPE_LLM_MODEL`.
    pub fn from_env(client: reqwest::Client, model_override: Option<String>) -> Result<Self> {
        Self::from_lookup(client, model_override, env)
    }

    pub(crate) fn from_lookup(
        client: reqwest::Client,
        model_override: Option<String>,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self> {
        let base_url = lookup("QUIZPIPE_LLM_BASE_URL").unwrap_or_else(|| DEFAULT_BASE_URL.into());
        let api_key = lookup("QUIZPIPE_LLM_API_KEY").or_else(|| lookup("GROQ_API_KEY"));
        if api_key.is_none() && base_url == DEFAULT_BASE_URL {
            return Err(Error::NotConfigured(
                "missing QUIZPIPE_LLM_API_KEY (or GROQ_API_KEY) for the default endpoint"
                    .to_string(),
            ));
        }
        let model = model_override
            .or_else(|| lookup("QUIZPIPE_LLM_MODEL"))
            .unwrap_or_else(|| DEFAULT_MODEL.into());
        Ok(Self::new(client, base_url, api_key, model))
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn endpoint_chat_completions(&self) -> String {
        format!(
            "{}/v1/chat/completions",
            self.base_url.trim_end_matches('/')
        )
    }

    /// One-turn chat: `user` is sent as the only message.
    pub async fn chat(&self, user: &str) -> Result<String> {
        let req = ChatCompletionsRequest {
            model: self.model.clone(),
            messages: vec![Message {
                role: "user".to_string(),
                content: user.to_string(),
            }],
            stream: Some(false),
        };

        let mut rb = self
            .client
            .post(self.endpoint_chat_completions())
            .timeout(std::time::Duration::from_millis(self.timeout_ms))
            .header(reqwest::header::CONTENT_TYPE, "application/json");
        if let Some(k) = &self.api_key {
            rb = rb.header(reqwest::header::AUTHORIZATION, format!("Bearer {k}"));
        }

        let resp = rb
            .json(&req)
            .send()
            .await
            .map_err(|e| Error::Llm(e.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(Error::Llm(format!("chat.completions HTTP {status}")));
        }

        let parsed: ChatCompletionsResponse =
            resp.json().await.map_err(|e| Error::Llm(e.to_string()))?;
        Ok(parsed
            .choices
            .first()
            .map(|c| c.message.content.clone())
            .unwrap_or_default())
    }
}

#[async_trait::async_trait]
impl AnswerGenerator for OpenAiCompatClient {
    fn name(&self) -> &str {
        &self.model
    }

    async fn generate(&self, prompt: &str) -> Result<String> {
        tracing::info!(model = %self.model, prompt_chars = prompt.chars().count(), "dispatching prompt");
        let out = self.chat(prompt).await?;
        tracing::debug!(answer_chars = out.chars().count(), "answer received");
        Ok(out)
    }
}

#[derive(Debug, Clone, Serialize)]
struct ChatCompletionsRequest {
    model: String,
    messages: Vec<Message>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Message {
    role: String,
    content: String,
}

#[derive(Debug, Clone, Deserialize)]
struct ChatCompletionsResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Debug, Clone, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Clone, Deserialize)]
struct ChoiceMessage {
    content: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::serve;
    use axum::{
        http::{HeaderMap, StatusCode},
        routing::post,
        Json, Router,
    };
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |k| map.get(k).cloned()
    }

    #[test]
    fn defaults_target_groq_and_accept_the_groq_key() {
        let c = OpenAiCompatClient::from_lookup(
            reqwest::Client::new(),
            None,
            lookup(&[("GROQ_API_KEY", "gsk_test")]),
        )
        .unwrap();
        assert_eq!(c.base_url(), DEFAULT_BASE_URL);
        assert_eq!(c.model(), DEFAULT_MODEL);
        assert_eq!(c.api_key.as_deref(), Some("gsk_test"));
    }

    #[test]
    fn explicit_key_and_model_override_win() {
        let c = OpenAiCompatClient::from_lookup(
            reqwest::Client::new(),
            Some("m-override".to_string()),
            lookup(&[
                ("QUIZPIPE_LLM_API_KEY", "primary"),
                ("GROQ_API_KEY", "fallback"),
                ("QUIZPIPE_LLM_MODEL", "m-env"),
            ]),
        )
        .unwrap();
        assert_eq!(c.api_key.as_deref(), Some("primary"));
        assert_eq!(c.model(), "m-override");
    }

    #[test]
    fn default_endpoint_without_key_is_not_configured() {
        let err = OpenAiCompatClient::from_lookup(reqwest::Client::new(), None, lookup(&[]))
            .unwrap_err();
        assert!(matches!(err, Error::NotConfigured(_)));

        // A custom (e.g. local) endpoint may run keyless.
        let c = OpenAiCompatClient::from_lookup(
            reqwest::Client::new(),
            None,
            lookup(&[("QUIZPIPE_LLM_BASE_URL", "http://127.0.0.1:11434")]),
        )
        .unwrap();
        assert!(c.api_key.is_none());
    }

    #[tokio::test]
    async fn generate_posts_prompt_as_single_user_message() {
        let seen: Arc<Mutex<Option<(Option<String>, serde_json::Value)>>> =
            Arc::new(Mutex::new(None));
        let seen2 = seen.clone();
        let app = Router::new().route(
            "/v1/chat/completions",
            post(move |headers: HeaderMap, Json(body): Json<serde_json::Value>| {
                let auth = headers
                    .get("authorization")
                    .and_then(|v| v.to_str().ok())
                    .map(|s| s.to_string());
                *seen2.lock().unwrap() = Some((auth, body));
                async {
                    Json(serde_json::json!({
                        "choices": [{"message": {"role": "assistant",
                            "content": "{\"submit_url\": \"/submit\", \"answer\": 30}"}}]
                    }))
                }
            }),
        );
        let addr = serve(app).await;

        let c = OpenAiCompatClient::new(
            reqwest::Client::new(),
            format!("http://{addr}/"),
            Some("sk-test".to_string()),
            "test-model",
        );
        let out = c.generate("what is the sum?").await.unwrap();
        assert_eq!(out, r#"{"submit_url": "/submit", "answer": 30}"#);

        let (auth, body) = seen.lock().unwrap().take().unwrap();
        assert_eq!(auth.as_deref(), Some("Bearer sk-test"));
        assert_eq!(body["model"], "test-model");
        let messages = body["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0]["role"], "user");
        assert_eq!(messages[0]["content"], "what is the sum?");
        assert_eq!(body["stream"], false);
        let keys: Vec<&str> = body.as_object().unwrap().keys().map(String::as_str).collect();
        assert_eq!(keys.len(), 3, "unexpected request fields: {keys:?}");
    }

    #[tokio::test]
    async fn http_errors_map_to_llm_error() {
        let app = Router::new().route(
            "/v1/chat/completions",
            post(|| async { (StatusCode::INTERNAL_SERVER_ERROR, "down") }),
        );
        let addr = serve(app).await;
        let c = OpenAiCompatClient::new(
            reqwest::Client::new(),
            format!("http://{addr}"),
            None,
            "m",
        );
        let err = c.generate("x").await.unwrap_err();
        assert!(matches!(err, Error::Llm(_)));
    }
}
