//! Confirmation Monitor
//!
//! Watches the inbox for the vendor's cancellation receipt while an action
//! is `awaiting_confirmation`, and times the action out at its deadline.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use futures::StreamExt;
use url::Url;
use uuid::Uuid;

use crate::{
    auth::credentials::CredentialProvider,
    detection::patterns,
    email::{
        fetcher::{FetchConfig, MessageFetcher},
        source::{MessageSource, MessageSourceFactory},
    },
    error::AppResult,
    model::{
        cancellation_action::{CancellationAction, CancellationStatus},
        repository::Repository,
        subscription::Subscription,
    },
    server_config::{CancellationConfig, ScanConfig},
    state::registry::Registry,
};

use super::link::manual_instructions;

pub fn confirmation_query(domain: &str, since: NaiveDate) -> String {
    format!("from:@{} after:{}", domain, since.format("%Y/%m/%d"))
}

/// Sender domain to search for receipts from
pub fn vendor_domain(subscription: &Subscription, target_url: Option<&str>) -> Option<String> {
    subscription.domain.as_deref().map(patterns::base_domain).or_else(|| {
        let url = Url::parse(target_url?).ok()?;
        Some(patterns::base_domain(url.host_str()?))
    })
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub checked: usize,
    pub confirmed: usize,
    pub timed_out: usize,
    pub errors: usize,
}

pub struct ConfirmationMonitor {
    repo: Arc<dyn Repository>,
    registry: Arc<Registry>,
    credentials: Arc<dyn CredentialProvider>,
    sources: Arc<dyn MessageSourceFactory>,
    config: CancellationConfig,
    fetch: FetchConfig,
}

impl ConfirmationMonitor {
    pub fn new(
        repo: Arc<dyn Repository>,
        registry: Arc<Registry>,
        credentials: Arc<dyn CredentialProvider>,
        sources: Arc<dyn MessageSourceFactory>,
        config: CancellationConfig,
        scan: &ScanConfig,
    ) -> Self {
        Self {
            repo,
            registry,
            credentials,
            sources,
            config,
            fetch: FetchConfig::from(scan),
        }
    }

    async fn source_for(&self, user_id: Uuid) -> AppResult<Arc<dyn MessageSource>> {
        let user = self.repo.get_user(user_id).await?;
        let token = self.credentials.refresh(&user.refresh_token).await?;
        Ok(self.sources.for_access_token(&token))
    }

    /// Check a single action. Non-awaiting actions are returned untouched.
    pub async fn check(&self, action_id: Uuid, now: DateTime<Utc>) -> AppResult<CancellationAction> {
        let action = self.repo.get_cancellation_action(action_id).await?;
        if action.status != CancellationStatus::AwaitingConfirmation {
            return Ok(action);
        }
        if self.is_expired(&action, now) {
            return self.time_out(action, now).await;
        }
        let source = self.source_for(action.user_id).await?;
        self.check_with(action, source, now).await
    }

    /// Check every awaiting action, refreshing each user's credential at most once
    pub async fn sweep(&self, now: DateTime<Utc>) -> AppResult<SweepReport> {
        let awaiting = self.repo.list_awaiting_confirmation().await?;
        let mut report = SweepReport::default();
        let mut sources: HashMap<Uuid, Option<Arc<dyn MessageSource>>> = HashMap::new();

        for action in awaiting {
            report.checked += 1;
            let action_id = action.id;

            let result = if self.is_expired(&action, now) {
                self.time_out(action, now).await
            } else {
                if !sources.contains_key(&action.user_id) {
                    let source = match self.source_for(action.user_id).await {
                        Ok(source) => Some(source),
                        Err(e) => {
                            tracing::warn!(
                                "Skipping confirmation checks for user {}: {}",
                                action.user_id,
                                e
                            );
                            None
                        }
                    };
                    sources.insert(action.user_id, source);
                }
                match sources.get(&action.user_id).cloned().flatten() {
                    Some(source) => self.check_with(action, source, now).await,
                    None => {
                        report.errors += 1;
                        continue;
                    }
                }
            };

            match result {
                Ok(done) => match done.status {
                    CancellationStatus::Confirmed => report.confirmed += 1,
                    CancellationStatus::Failed => report.timed_out += 1,
                    _ => {}
                },
                Err(e) => {
                    report.errors += 1;
                    tracing::warn!("Confirmation check for {} failed: {}", action_id, e);
                }
            }
        }

        if report.checked > 0 {
            tracing::info!(
                "Confirmation sweep: {} checked, {} confirmed, {} timed out, {} errors",
                report.checked,
                report.confirmed,
                report.timed_out,
                report.errors
            );
        }
        Ok(report)
    }

    fn is_expired(&self, action: &CancellationAction, now: DateTime<Utc>) -> bool {
        let deadline = action
            .monitoring_deadline
            .unwrap_or(action.initiated_at + self.config.monitoring_window());
        now >= deadline
    }

    async fn check_with(
        &self,
        action: CancellationAction,
        source: Arc<dyn MessageSource>,
        now: DateTime<Utc>,
    ) -> AppResult<CancellationAction> {
        let subscription = self.repo.get_subscription(action.subscription_id).await?;
        let Some(domain) = vendor_domain(&subscription, action.target_url.as_deref()) else {
            tracing::debug!("No vendor domain for cancellation {}", action.id);
            return Ok(action);
        };

        let fetcher = MessageFetcher::new(source, self.fetch.clone());
        let query = confirmation_query(&domain, action.initiated_at.date_naive());
        let page = fetcher
            .list_message_ids(&query, self.config.monitor_max_results, None)
            .await?;

        let messages = fetcher.fetch_batch(&page.ids);
        futures::pin_mut!(messages);
        let mut confirmation = None;
        while let Some(msg) = messages.next().await {
            if patterns::matches_confirmation(&msg.preview_text()) {
                confirmation = Some(msg.id);
                break;
            }
        }

        let Some(message_id) = confirmation else {
            return Ok(action);
        };

        let mut locked = self.registry.lock_subscription(action.subscription_id).await?;
        let mut action = self.repo.get_cancellation_action(action.id).await?;
        if action.status != CancellationStatus::AwaitingConfirmation {
            return Ok(action);
        }
        action.transition(CancellationStatus::Confirmed)?;
        action.confirmation_message_id = Some(message_id);
        action.confirmed_at = Some(now);
        action.completed_at = Some(now);
        self.repo.update_cancellation_action(&action).await?;

        locked.subscription.mark_cancelled(now);
        self.registry.save(&locked).await?;
        tracing::info!(
            "Cancellation of {} confirmed by message {:?}",
            locked.subscription.service_name,
            action.confirmation_message_id
        );
        Ok(action)
    }

    /// Deadline passed without a receipt; the subscription stays pending
    async fn time_out(
        &self,
        action: CancellationAction,
        now: DateTime<Utc>,
    ) -> AppResult<CancellationAction> {
        let locked = self.registry.lock_subscription(action.subscription_id).await?;
        let mut action = self.repo.get_cancellation_action(action.id).await?;
        if action.status != CancellationStatus::AwaitingConfirmation {
            return Ok(action);
        }
        action.transition(CancellationStatus::Failed)?;
        let reason = "no confirmation email arrived before the deadline";
        action.error_message = Some(reason.to_string());
        action.requires_manual_action = true;
        action.manual_instructions = Some(manual_instructions(
            &locked.subscription.service_name,
            action.target_url.as_deref(),
            reason,
        ));
        action.completed_at = Some(now);
        self.repo.update_cancellation_action(&action).await?;
        tracing::info!("Cancellation {} timed out", action.id);
        Ok(action)
    }
}
