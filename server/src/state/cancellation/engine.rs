//! Cancellation Engine
//!
//! Moves a cancellation action from `pending` to its outcome:
//! `awaiting_confirmation`, `manual_required` or `failed`.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::{
    detection::patterns,
    error::{AppError, AppResult},
    model::{
        cancellation_action::{ActionType, CancellationAction, CancellationStatus, LinkKind},
        repository::Repository,
    },
    server_config::CancellationConfig,
    state::registry::Registry,
    util::truncate_chars,
    HttpClient,
};

use super::{
    browser::{run_form_flow, BrowserHost, FormOutcome, FormTimings},
    link::{classify_link, manual_instructions},
};

pub const RESPONSE_SNIPPET_CHARS: usize = 500;

/// Result of one automated attempt
#[derive(Debug, Clone, PartialEq)]
enum AttemptOutcome {
    Succeeded {
        status: Option<u16>,
        snippet: Option<String>,
    },
    Failed {
        status: Option<u16>,
        snippet: Option<String>,
        error: String,
    },
    Manual {
        reason: String,
    },
}

pub struct CancellationEngine {
    repo: Arc<dyn Repository>,
    registry: Arc<Registry>,
    http_client: HttpClient,
    browser: Option<Arc<dyn BrowserHost>>,
    config: CancellationConfig,
}

impl CancellationEngine {
    pub fn new(
        repo: Arc<dyn Repository>,
        registry: Arc<Registry>,
        http_client: HttpClient,
        browser: Option<Arc<dyn BrowserHost>>,
        config: CancellationConfig,
    ) -> Self {
        Self {
            repo,
            registry,
            http_client,
            browser,
            config,
        }
    }

    /// Create a `pending` action, or hand back the one already in flight
    pub async fn initiate(
        &self,
        subscription_id: Uuid,
        now: DateTime<Utc>,
    ) -> AppResult<(CancellationAction, bool)> {
        let mut locked = self.registry.lock_subscription(subscription_id).await?;
        if !locked.subscription.status.is_open() {
            return Err(AppError::Conflict(format!(
                "Subscription {} is {}",
                subscription_id, locked.subscription.status
            )));
        }
        if let Some(existing) = self.repo.find_active_action(subscription_id).await? {
            return Ok((existing, false));
        }

        let action = CancellationAction::new(&locked.subscription, self.config.max_retries, now);
        self.repo.insert_cancellation_action(&action).await?;
        locked.subscription.mark_pending_cancellation(now);
        self.registry.save(&locked).await?;
        tracing::info!(
            "Cancellation {} initiated for {}",
            action.id,
            locked.subscription.service_name
        );
        Ok((action, true))
    }

    /// User retry of a `failed` or `manual_required` action. Refused while
    /// another action for the subscription is in flight.
    pub async fn retry(&self, action_id: Uuid, now: DateTime<Utc>) -> AppResult<CancellationAction> {
        let subscription_id = self.repo.get_cancellation_action(action_id).await?.subscription_id;
        let mut locked = self.registry.lock_subscription(subscription_id).await?;

        let mut action = self.repo.get_cancellation_action(action_id).await?;
        if let Some(active) = self.repo.find_active_action(subscription_id).await? {
            if active.id != action.id {
                return Err(AppError::Conflict(format!(
                    "Cancellation {} is already {} for subscription {}",
                    active.id, active.status, subscription_id
                )));
            }
        }
        if !locked.subscription.status.is_open() {
            return Err(AppError::Conflict(format!(
                "Subscription {} is {}",
                subscription_id, locked.subscription.status
            )));
        }

        action.retry(now)?;
        self.repo.update_cancellation_action(&action).await?;
        locked.subscription.mark_pending_cancellation(now);
        self.registry.save(&locked).await?;
        Ok(action)
    }

    /// Run a pending action. Anything not `pending` is returned untouched.
    pub async fn execute(&self, action_id: Uuid) -> AppResult<CancellationAction> {
        let action = self.repo.get_cancellation_action(action_id).await?;
        if action.status != CancellationStatus::Pending {
            tracing::info!("Cancellation {} is {}, skipping", action_id, action.status);
            return Ok(action);
        }

        // Claim the action under the lock; the attempts themselves run unlocked
        let (mut action, service_name) = {
            let locked = self.registry.lock_subscription(action.subscription_id).await?;
            let mut action = self.repo.get_cancellation_action(action_id).await?;
            if action.status != CancellationStatus::Pending {
                tracing::info!("Cancellation {} is {}, skipping", action_id, action.status);
                return Ok(action);
            }
            action.link_kind = Some(classify_link(action.target_url.as_deref()));
            action.transition(CancellationStatus::InProgress)?;
            self.repo.update_cancellation_action(&action).await?;
            (action, locked.subscription.service_name.clone())
        };

        let outcome = match action.link_kind.unwrap_or(LinkKind::Unknown) {
            LinkKind::LoginRequired => AttemptOutcome::Manual {
                reason: "the page requires signing in".to_string(),
            },
            LinkKind::Unknown => AttemptOutcome::Manual {
                reason: match action.target_url {
                    Some(_) => "the link could not be automated".to_string(),
                    None => "no cancellation link".to_string(),
                },
            },
            kind @ (LinkKind::Direct | LinkKind::Form) => {
                self.attempt_with_retries(&mut action, kind).await?
            }
        };

        let now = Utc::now();
        let mut locked = self.registry.lock_subscription(action.subscription_id).await?;
        self.apply_outcome(&mut action, &service_name, outcome, now)?;
        self.repo.update_cancellation_action(&action).await?;
        if matches!(
            action.status,
            CancellationStatus::Failed | CancellationStatus::ManualRequired
        ) {
            locked.subscription.reopen(now);
            self.registry.save(&locked).await?;
        }
        tracing::info!("Cancellation {} finished as {}", action.id, action.status);
        Ok(action)
    }

    async fn attempt_with_retries(
        &self,
        action: &mut CancellationAction,
        kind: LinkKind,
    ) -> AppResult<AttemptOutcome> {
        loop {
            let outcome = self.attempt(action, kind).await;
            let error = match &outcome {
                AttemptOutcome::Failed { error, .. } => error.clone(),
                _ => return Ok(outcome),
            };
            if action.retry_count >= action.max_retries {
                if action.max_retries == 0 {
                    return Ok(outcome);
                }
                return Ok(AttemptOutcome::Manual {
                    reason: format!(
                        "automated attempts failed {} times: {}",
                        action.retry_count + 1,
                        error
                    ),
                });
            }

            action.retry_count += 1;
            self.repo.update_cancellation_action(action).await?;
            let backoff = self.config.retry_backoff() * 2u32.saturating_pow(action.retry_count - 1);
            tracing::warn!(
                "Cancellation {} attempt failed ({}), retry {}/{} in {:?}",
                action.id,
                error,
                action.retry_count,
                action.max_retries,
                backoff
            );
            tokio::time::sleep(backoff).await;
        }
    }

    async fn attempt(&self, action: &mut CancellationAction, kind: LinkKind) -> AttemptOutcome {
        let Some(url) = action.target_url.clone() else {
            return AttemptOutcome::Manual {
                reason: "no cancellation link".to_string(),
            };
        };
        match kind {
            LinkKind::Direct => {
                action.http_method = Some("GET".to_string());
                self.attempt_direct(&url).await
            }
            _ => self.attempt_form(&url).await,
        }
    }

    async fn attempt_direct(&self, url: &str) -> AttemptOutcome {
        let resp = match self
            .http_client
            .get(url)
            .timeout(self.config.request_timeout())
            .send()
            .await
        {
            Ok(resp) => resp,
            Err(e) => {
                return AttemptOutcome::Failed {
                    status: None,
                    snippet: None,
                    error: e.to_string(),
                }
            }
        };

        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        let snippet = Some(truncate_chars(&body, RESPONSE_SNIPPET_CHARS).to_string());

        if status.is_success() || patterns::matches_success_phrase(&body) {
            AttemptOutcome::Succeeded {
                status: Some(status.as_u16()),
                snippet,
            }
        } else {
            AttemptOutcome::Failed {
                status: Some(status.as_u16()),
                snippet,
                error: format!("Unexpected response status {status}"),
            }
        }
    }

    async fn attempt_form(&self, url: &str) -> AttemptOutcome {
        let Some(browser) = &self.browser else {
            return AttemptOutcome::Manual {
                reason: "browser automation is not available".to_string(),
            };
        };

        match run_form_flow(browser.as_ref(), url, &FormTimings::from(&self.config)).await {
            Ok(FormOutcome::Cancelled { .. }) => AttemptOutcome::Succeeded {
                status: None,
                snippet: None,
            },
            Ok(FormOutcome::NoControl) => AttemptOutcome::Manual {
                reason: "no cancel control found on the page".to_string(),
            },
            Ok(FormOutcome::NoSuccessPhrase { clicked }) => AttemptOutcome::Manual {
                reason: format!("clicked {clicked} but saw no confirmation"),
            },
            Err(e) => AttemptOutcome::Failed {
                status: None,
                snippet: None,
                error: e.to_string(),
            },
        }
    }

    fn apply_outcome(
        &self,
        action: &mut CancellationAction,
        service_name: &str,
        outcome: AttemptOutcome,
        now: DateTime<Utc>,
    ) -> AppResult<()> {
        let url = action.target_url.clone();
        match outcome {
            AttemptOutcome::Succeeded { status, snippet } => {
                action.transition(CancellationStatus::AwaitingConfirmation)?;
                action.response_status = status;
                action.response_snippet = snippet;
                action.monitoring_deadline = Some(action.initiated_at + self.config.monitoring_window());
            }
            AttemptOutcome::Failed {
                status,
                snippet,
                error,
            } => {
                action.transition(CancellationStatus::Failed)?;
                action.response_status = status;
                action.response_snippet = snippet;
                action.manual_instructions = Some(manual_instructions(
                    service_name,
                    url.as_deref(),
                    &error,
                ));
                action.error_message = Some(error);
                action.requires_manual_action = true;
                action.completed_at = Some(now);
            }
            AttemptOutcome::Manual { reason } => {
                action.transition(CancellationStatus::ManualRequired)?;
                action.action_type = if url.is_some() {
                    ActionType::ManualLink
                } else {
                    ActionType::ManualPhone
                };
                action.manual_instructions = Some(manual_instructions(
                    service_name,
                    url.as_deref(),
                    &reason,
                ));
                action.error_message = Some(reason);
                action.requires_manual_action = true;
                action.completed_at = Some(now);
            }
        }
        Ok(())
    }
}
