use std::sync::Arc;

use async_trait::async_trait;
use google_gmail1::api::Message;

use crate::error::AppResult;

/// One page of a mailbox search
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessagePage {
    pub ids: Vec<String>,
    pub next_page_token: Option<String>,
    pub result_size_estimate: u64,
}

/// Read-only mailbox access. Errors are `UpstreamFetch`, `RateLimit` or `Auth`.
#[async_trait]
pub trait MessageSource: Send + Sync {
    async fn list_message_ids(
        &self,
        query: &str,
        page_size: u32,
        page_token: Option<&str>,
    ) -> AppResult<MessagePage>;

    async fn fetch_message(&self, id: &str) -> AppResult<Message>;
}

/// Builds a mailbox client bound to a freshly refreshed access token
pub trait MessageSourceFactory: Send + Sync {
    fn for_access_token(&self, access_token: &str) -> Arc<dyn MessageSource>;
}
