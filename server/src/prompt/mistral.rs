use async_trait::async_trait;
use serde_json::json;

use crate::{
    error::{AppError, AppResult},
    rate_limiters::RateLimiters,
    server_config::{ApiConfig, ModelConfig},
    HttpClient,
};

use super::{ChatApiResponseOrError, GenerativeProvider};

const RATE_LIMIT_MESSAGE: &str = "Requests rate limit exceeded";

/// Chat-completions client for the Mistral API
pub struct MistralProvider {
    http_client: HttpClient,
    rate_limiters: RateLimiters,
    endpoint: String,
    api_key: String,
    model_id: String,
}

impl MistralProvider {
    pub fn new(
        http_client: HttpClient,
        rate_limiters: RateLimiters,
        api: &ApiConfig,
        model: &ModelConfig,
    ) -> Self {
        Self {
            http_client,
            rate_limiters,
            endpoint: api.endpoint.clone(),
            api_key: api.key.clone(),
            model_id: model.id.clone(),
        }
    }
}

#[async_trait]
impl GenerativeProvider for MistralProvider {
    async fn complete(&self, prompt: &str, max_tokens: u32, temperature: f64) -> AppResult<String> {
        self.rate_limiters.acquire_one().await;

        let resp = self
            .http_client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&json!({
                "model": &self.model_id,
                "temperature": temperature,
                "max_tokens": max_tokens,
                "messages": [{ "role": "user", "content": prompt }],
                "response_format": { "type": "json_object" }
            }))
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    AppError::Timeout(e.to_string())
                } else {
                    AppError::Provider(e.to_string())
                }
            })?
            .json::<serde_json::Value>()
            .await
            .map_err(|e| AppError::Provider(format!("Unreadable chat response: {e}")))?;

        let parsed = serde_json::from_value::<ChatApiResponseOrError>(resp.clone())
            .map_err(|_| AppError::Provider(format!("Could not parse chat response: {resp}")))?;

        let parsed = match parsed {
            ChatApiResponseOrError::Error(error) => {
                if error.message == RATE_LIMIT_MESSAGE {
                    self.rate_limiters.trigger_backoff();
                    return Err(AppError::RateLimit(error.message));
                }
                return Err(AppError::Provider(error.message));
            }
            ChatApiResponseOrError::Response(parsed) => parsed,
        };

        if let Some(usage) = &parsed.usage {
            tracing::debug!("Chat completion used {} tokens", usage.total_tokens);
        }

        parsed
            .choices
            .into_iter()
            .next()
            .map(|choice| choice.message.content)
            .ok_or_else(|| AppError::Provider("No choices in response".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{routing::post, Json, Router};
    use serde_json::Value;

    use crate::testing::common::spawn_server;

    fn provider(base: &str) -> MistralProvider {
        MistralProvider {
            http_client: reqwest::Client::new(),
            rate_limiters: RateLimiters::new(100, 10, 100),
            endpoint: format!("{base}/v1/chat/completions"),
            api_key: "key".to_string(),
            model_id: "mistral-small-latest".to_string(),
        }
    }

    #[tokio::test]
    async fn test_complete_returns_first_choice() {
        let app = Router::new().route(
            "/v1/chat/completions",
            post(|Json(body): Json<Value>| async move {
                assert_eq!(body["max_tokens"], 1000);
                assert_eq!(body["response_format"]["type"], "json_object");
                Json(json!({
                    "choices": [{
                        "index": 0,
                        "message": { "role": "assistant", "content": "{\"ok\": true}" },
                        "finish_reason": "stop"
                    }],
                    "usage": { "prompt_tokens": 10, "completion_tokens": 5, "total_tokens": 15 }
                }))
            }),
        );
        let base = spawn_server(app).await;

        let out = provider(&base).complete("hello", 1000, 0.1).await.unwrap();
        assert_eq!(out, "{\"ok\": true}");
    }

    #[tokio::test]
    async fn test_rate_limit_triggers_backoff() {
        let app = Router::new().route(
            "/v1/chat/completions",
            post(|| async { Json(json!({ "message": "Requests rate limit exceeded" })) }),
        );
        let base = spawn_server(app).await;
        let provider = provider(&base);

        let result = provider.complete("hello", 10, 0.1).await;
        assert!(matches!(result, Err(AppError::RateLimit(_))), "{:?}", result);
        assert!(provider.rate_limiters.is_backing_off());
    }
}
