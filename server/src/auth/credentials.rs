use async_trait::async_trait;
use serde::Deserialize;

use crate::{
    error::{AppError, AppResult},
    server_config::GmailConfig,
    HttpClient,
};

/// Exchanges a stored long-lived credential for a short-lived access token
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    /// Fails with `AppError::Auth` when the credential is invalid or revoked
    async fn refresh(&self, refresh_token: &str) -> AppResult<String>;
}

#[derive(Debug, Deserialize)]
struct RefreshTokenResponse {
    access_token: String,
    #[allow(dead_code)]
    expires_in: Option<i64>,
}

pub struct GoogleTokenRefresher {
    http_client: HttpClient,
    token_uri: String,
    client_id: String,
    client_secret: String,
}

impl GoogleTokenRefresher {
    pub fn new(http_client: HttpClient, cfg: &GmailConfig) -> Self {
        Self {
            http_client,
            token_uri: cfg.token_uri.clone(),
            client_id: cfg.client_id.clone(),
            client_secret: cfg.client_secret.clone(),
        }
    }
}

#[async_trait]
impl CredentialProvider for GoogleTokenRefresher {
    async fn refresh(&self, refresh_token: &str) -> AppResult<String> {
        let resp = self
            .http_client
            .post(&self.token_uri)
            .form(&[
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
                ("refresh_token", refresh_token),
                ("grant_type", "refresh_token"),
            ])
            .send()
            .await
            .map_err(|e| {
                tracing::error!("Error refreshing token: {:?}", e);
                AppError::UpstreamFetch(format!("Token endpoint unreachable: {e}"))
            })?;

        let resp = resp
            .json::<serde_json::Value>()
            .await
            .map_err(|e| AppError::UpstreamFetch(format!("Unreadable token response: {e}")))?;

        if resp.get("error").is_some() {
            let desc = resp
                .get("error_description")
                .and_then(|d| d.as_str())
                .or_else(|| resp.get("error").and_then(|e| e.as_str()))
                .unwrap_or("unknown error");
            tracing::info!("Refresh token rejected: {}", desc);
            return Err(AppError::Auth(desc.to_string()));
        }

        let token = serde_json::from_value::<RefreshTokenResponse>(resp.clone()).map_err(|_| {
            tracing::error!("Unexpected oauth2 response: {:?}", resp);
            AppError::Auth("Malformed token response".to_string())
        })?;

        Ok(token.access_token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{routing::post, Form, Json, Router};
    use serde_json::json;
    use std::collections::HashMap;

    use crate::testing::common::spawn_server;

    fn refresher(base: &str) -> GoogleTokenRefresher {
        GoogleTokenRefresher {
            http_client: reqwest::Client::new(),
            token_uri: format!("{base}/token"),
            client_id: "client".to_string(),
            client_secret: "secret".to_string(),
        }
    }

    fn fake_token_endpoint() -> Router {
        Router::new().route(
            "/token",
            post(|Form(form): Form<HashMap<String, String>>| async move {
                assert_eq!(form.get("grant_type").map(String::as_str), Some("refresh_token"));
                match form.get("refresh_token").map(String::as_str) {
                    Some("good") => Json(json!({"access_token": "fresh", "expires_in": 3599})),
                    _ => Json(json!({
                        "error": "invalid_grant",
                        "error_description": "Token has been expired or revoked."
                    })),
                }
            }),
        )
    }

    #[tokio::test]
    async fn test_refresh_success_and_revoked() {
        let base = spawn_server(fake_token_endpoint()).await;
        let refresher = refresher(&base);

        assert_eq!(refresher.refresh("good").await.unwrap(), "fresh");

        let revoked = refresher.refresh("stale").await;
        match revoked {
            Err(AppError::Auth(desc)) => assert_eq!(desc, "Token has been expired or revoked."),
            other => panic!("expected auth error, got {:?}", other),
        }
    }
}
