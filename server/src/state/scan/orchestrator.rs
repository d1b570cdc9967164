//! Scan Orchestrator
//!
//! Drives one scan session: refresh the mailbox credential, page through the
//! search results, run every message through detection and the registry,
//! and checkpoint counters along the way.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{NaiveDate, Utc};
use futures::StreamExt;
use uuid::Uuid;

use crate::{
    auth::credentials::CredentialProvider,
    detection::detector::SubscriptionDetector,
    email::{
        fetcher::{FetchConfig, MessageFetcher},
        source::MessageSourceFactory,
    },
    error::AppResult,
    model::{
        repository::Repository,
        scan_session::{ScanParams, ScanSession},
    },
    observability::{ScanPhase, ScanTracker},
    server_config::ScanConfig,
    state::registry::Registry,
};

/// Base query restricted to mail newer than the lookback window
pub fn build_search_query(base: &str, lookback_years: u32, today: NaiveDate) -> AppResult<String> {
    let since = ScanParams::new(lookback_years, today)?.since;
    Ok(format!("({}) after:{}", base, since.format("%Y/%m/%d")))
}

pub struct ScanOrchestrator {
    repo: Arc<dyn Repository>,
    credentials: Arc<dyn CredentialProvider>,
    sources: Arc<dyn MessageSourceFactory>,
    detector: Arc<SubscriptionDetector>,
    registry: Arc<Registry>,
    tracker: ScanTracker,
    config: ScanConfig,
}

impl ScanOrchestrator {
    pub fn new(
        repo: Arc<dyn Repository>,
        credentials: Arc<dyn CredentialProvider>,
        sources: Arc<dyn MessageSourceFactory>,
        detector: Arc<SubscriptionDetector>,
        registry: Arc<Registry>,
        tracker: ScanTracker,
        config: ScanConfig,
    ) -> Self {
        Self {
            repo,
            credentials,
            sources,
            detector,
            registry,
            tracker,
            config,
        }
    }

    /// Run the session to a terminal state. Failures inside the scan are
    /// recorded on the session; only a failure to persist that outcome is
    /// returned as an error.
    pub async fn run(
        &self,
        user_id: Uuid,
        session_id: Uuid,
        lookback_years: u32,
    ) -> AppResult<ScanSession> {
        let mut session = self.repo.get_scan_session(session_id).await?;
        if session.status.is_terminal() {
            tracing::info!(
                "Scan session {} already {}, skipping",
                session_id,
                session.status
            );
            return Ok(session);
        }

        self.tracker.register_scan(session_id, user_id);
        match self.scan(user_id, lookback_years, &mut session).await {
            Ok(()) => {
                let now = Utc::now();
                session.complete(now);
                self.repo.update_scan_session(&session).await?;
                self.repo.record_scan_summary(user_id, now).await?;
                self.tracker.set_phase(session_id, ScanPhase::Complete);
                tracing::info!(
                    "Scan {} completed: {} messages, {} subscriptions",
                    session_id,
                    session.messages_processed,
                    session.subscriptions_found
                );
            }
            Err(e) => {
                tracing::error!("Scan {} failed: {}", session_id, e);
                session.fail(e.to_string(), Utc::now());
                self.tracker.set_phase(
                    session_id,
                    ScanPhase::Failed {
                        error: e.to_string(),
                    },
                );
                self.repo.update_scan_session(&session).await?;
            }
        }

        Ok(session)
    }

    async fn scan(
        &self,
        user_id: Uuid,
        lookback_years: u32,
        session: &mut ScanSession,
    ) -> AppResult<()> {
        let user = self.repo.get_user(user_id).await?;
        let access_token = self.credentials.refresh(&user.refresh_token).await?;
        let fetcher = MessageFetcher::new(
            self.sources.for_access_token(&access_token),
            FetchConfig::from(&self.config),
        );

        let query = build_search_query(
            &self.config.search_query,
            lookback_years,
            Utc::now().date_naive(),
        )?;
        let checkpoint_every = self.config.checkpoint_every.max(1);
        let mut found: HashSet<Uuid> = HashSet::new();
        let mut page_token: Option<String> = None;
        let mut first_page = true;

        loop {
            let page = fetcher
                .list_message_ids(&query, self.config.page_size, page_token.as_deref())
                .await?;

            if first_page {
                first_page = false;
                session.total_messages_estimated = page.result_size_estimate;
                self.repo.update_scan_session(session).await?;
                self.tracker
                    .set_estimated_total(session.id, page.result_size_estimate);
                self.tracker.set_phase(session.id, ScanPhase::Detecting);
            }

            let messages = fetcher.fetch_batch(&page.ids);
            futures::pin_mut!(messages);
            while let Some(msg) = messages.next().await {
                if let Some(candidate) = self.detector.detect(&msg).await.candidate() {
                    let subscription = self.registry.upsert(user_id, &candidate).await?;
                    found.insert(subscription.id);
                }

                session.messages_processed += 1;
                session.subscriptions_found = found.len() as u64;
                if session.messages_processed % checkpoint_every == 0 {
                    self.repo.update_scan_session(session).await?;
                    self.tracker.set_counts(
                        session.id,
                        session.messages_processed,
                        session.subscriptions_found,
                    );
                }
            }

            match page.next_page_token {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }

        Ok(())
    }
}
