//! Message Fetcher
//!
//! Lists matching message ids and streams decoded messages in bounded batches.
//! A message that fails to fetch or decode is logged and skipped; it never
//! aborts the batch.

use std::sync::Arc;
use std::time::Duration;

use futures::{future::join_all, stream, Stream, StreamExt};

use crate::{error::AppResult, server_config::ScanConfig, util::with_timeout};

use super::{
    message::NormalizedMessage,
    source::{MessagePage, MessageSource},
};

#[derive(Debug, Clone)]
pub struct FetchConfig {
    pub batch_size: usize,
    pub batch_pause: Duration,
    pub fetch_timeout: Duration,
}

impl From<&ScanConfig> for FetchConfig {
    fn from(cfg: &ScanConfig) -> Self {
        FetchConfig {
            batch_size: cfg.batch_size,
            batch_pause: cfg.batch_pause(),
            fetch_timeout: cfg.fetch_timeout(),
        }
    }
}

#[derive(Clone)]
pub struct MessageFetcher {
    source: Arc<dyn MessageSource>,
    config: FetchConfig,
}

impl MessageFetcher {
    pub fn new(source: Arc<dyn MessageSource>, config: FetchConfig) -> Self {
        Self { source, config }
    }

    pub async fn list_message_ids(
        &self,
        query: &str,
        page_size: u32,
        page_token: Option<&str>,
    ) -> AppResult<MessagePage> {
        with_timeout(
            "messages.list",
            self.config.fetch_timeout,
            self.source.list_message_ids(query, page_size, page_token),
        )
        .await
    }

    pub async fn fetch_message(&self, id: &str) -> AppResult<NormalizedMessage> {
        let raw = with_timeout(
            "messages.get",
            self.config.fetch_timeout,
            self.source.fetch_message(id),
        )
        .await?;
        NormalizedMessage::from_gmail_message(raw)
    }

    /// Stream decoded messages for `ids`. Messages inside a batch are fetched
    /// concurrently, batches run sequentially with a pause between them.
    /// Yield order follows input order; failed ids are skipped.
    pub fn fetch_batch<'a>(
        &'a self,
        ids: &'a [String],
    ) -> impl Stream<Item = NormalizedMessage> + Send + 'a {
        let batch_size = self.config.batch_size.max(1);
        let pause = self.config.batch_pause;

        stream::iter(ids.chunks(batch_size).enumerate())
            .then(move |(i, chunk)| async move {
                if i > 0 && !pause.is_zero() {
                    tokio::time::sleep(pause).await;
                }
                self.fetch_chunk(chunk).await
            })
            .flat_map(stream::iter)
    }

    async fn fetch_chunk(&self, chunk: &[String]) -> Vec<NormalizedMessage> {
        let results = join_all(chunk.iter().map(|id| self.fetch_message(id))).await;

        chunk
            .iter()
            .zip(results)
            .filter_map(|(id, result)| match result {
                Ok(msg) => Some(msg),
                Err(e) => {
                    tracing::warn!("Skipping message {}: {}", id, e);
                    None
                }
            })
            .collect()
    }
}
