use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use google_gmail1::api::{ListMessagesResponse, Message};
use leaky_bucket::RateLimiter;
use reqwest::{Response, StatusCode};

use crate::{
    error::{AppError, AppResult},
    HttpClient,
};

use super::source::{MessagePage, MessageSource, MessageSourceFactory};

/// Gmail quota units per call, see https://developers.google.com/gmail/api/reference/quota
pub struct GmailApiQuota {
    pub messages_list: usize,
    pub messages_get: usize,
}

pub const GMAIL_API_QUOTA: GmailApiQuota = GmailApiQuota {
    messages_list: 5,
    messages_get: 5,
};

pub const MAX_MESSAGES_PER_PAGE: u32 = 500;

/// Format parameter for Gmail API message requests
#[derive(Debug, Clone, Copy, Default)]
pub enum MessageFormat {
    /// Returns the full email message data with body content parsed
    #[default]
    Full,
    /// Returns the full email message in RFC 2822 format as a base64url encoded string
    Raw,
}

impl MessageFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageFormat::Full => "full",
            MessageFormat::Raw => "raw",
        }
    }
}

fn request_error(error: reqwest::Error) -> AppError {
    if error.is_timeout() {
        AppError::Timeout(error.to_string())
    } else {
        AppError::UpstreamFetch(error.to_string())
    }
}

async fn check_status(resp: Response, what: &str) -> AppResult<Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    tracing::warn!("Gmail {} failed with {}: {}", what, status, body);
    Err(match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            AppError::Auth(format!("{what}: {status}"))
        }
        StatusCode::TOO_MANY_REQUESTS => AppError::RateLimit(format!("{what}: {status}")),
        _ => AppError::UpstreamFetch(format!("{what}: {status} {body}")),
    })
}

#[derive(Clone)]
pub struct EmailClient {
    http_client: HttpClient,
    access_token: String,
    api_base: String,
    format: MessageFormat,
    rate_limiter: Arc<RateLimiter>,
}

impl EmailClient {
    pub fn new(
        http_client: HttpClient,
        api_base: impl Into<String>,
        access_token: impl Into<String>,
        rate_limiter: Arc<RateLimiter>,
    ) -> Self {
        EmailClient {
            http_client,
            access_token: access_token.into(),
            api_base: api_base.into().trim_end_matches('/').to_string(),
            format: MessageFormat::Full,
            rate_limiter,
        }
    }

    pub fn with_format(mut self, format: MessageFormat) -> Self {
        self.format = format;
        self
    }

    fn url(&self, path: &[&str]) -> String {
        format!("{}/{}", self.api_base, path.join("/"))
    }
}

#[async_trait]
impl MessageSource for EmailClient {
    async fn list_message_ids(
        &self,
        query: &str,
        page_size: u32,
        page_token: Option<&str>,
    ) -> AppResult<MessagePage> {
        self.rate_limiter
            .acquire(GMAIL_API_QUOTA.messages_list)
            .await;

        let mut params = vec![
            ("q", query.to_string()),
            (
                "maxResults",
                page_size.clamp(1, MAX_MESSAGES_PER_PAGE).to_string(),
            ),
        ];
        if let Some(token) = page_token {
            params.push(("pageToken", token.to_string()));
        }

        let resp = self
            .http_client
            .get(self.url(&["messages"]))
            .query(&params)
            .bearer_auth(&self.access_token)
            .send()
            .await
            .map_err(request_error)?;
        let data = check_status(resp, "messages.list")
            .await?
            .json::<ListMessagesResponse>()
            .await
            .map_err(request_error)?;

        Ok(MessagePage {
            ids: data
                .messages
                .unwrap_or_default()
                .into_iter()
                .filter_map(|m| m.id)
                .collect(),
            next_page_token: data.next_page_token.filter(|t| !t.is_empty()),
            result_size_estimate: data.result_size_estimate.unwrap_or_default() as u64,
        })
    }

    async fn fetch_message(&self, id: &str) -> AppResult<Message> {
        self.rate_limiter
            .acquire(GMAIL_API_QUOTA.messages_get)
            .await;

        let resp = self
            .http_client
            .get(self.url(&["messages", id]))
            .query(&[("format", self.format.as_str())])
            .bearer_auth(&self.access_token)
            .send()
            .await
            .map_err(request_error)?;

        check_status(resp, "messages.get")
            .await?
            .json::<Message>()
            .await
            .map_err(request_error)
    }
}

/// Hands out Gmail clients that share one per-process quota bucket
pub struct GmailSourceFactory {
    http_client: HttpClient,
    api_base: String,
    rate_limiter: Arc<RateLimiter>,
}

impl GmailSourceFactory {
    pub fn new(http_client: HttpClient, api_base: impl Into<String>, quota_per_second: usize) -> Self {
        let rate_limiter = Arc::new(
            RateLimiter::builder()
                .initial(quota_per_second)
                .interval(Duration::from_secs(1))
                .max(quota_per_second)
                .refill(quota_per_second)
                .build(),
        );
        GmailSourceFactory {
            http_client,
            api_base: api_base.into(),
            rate_limiter,
        }
    }
}

impl MessageSourceFactory for GmailSourceFactory {
    fn for_access_token(&self, access_token: &str) -> Arc<dyn MessageSource> {
        Arc::new(EmailClient::new(
            self.http_client.clone(),
            self.api_base.clone(),
            access_token,
            self.rate_limiter.clone(),
        ))
    }
}
