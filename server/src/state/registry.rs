//! Subscription Registry
//!
//! Folds detection candidates into one open subscription per (user, service).
//! Writes for the same key are serialized; different keys proceed in parallel.
//! Every subscription write, status changes included, happens under the key
//! lock with the row re-read inside it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use tokio::sync::OwnedMutexGuard;
use uuid::Uuid;

use crate::{
    detection::patterns,
    error::AppResult,
    model::{
        cancellation_action::CancellationStatus,
        candidate::DetectionCandidate,
        repository::Repository,
        subscription::{Subscription, SubscriptionStatus},
    },
};

/// Map of per-key async locks. Entries nobody holds are pruned on the next lock.
#[derive(Default)]
pub struct KeyedLocks {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl KeyedLocks {
    pub async fn lock(&self, key: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            locks.retain(|k, l| k == key || Arc::strong_count(l) > 1);
            locks
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }

    pub fn len(&self) -> usize {
        self.locks.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SpendingSummary {
    /// Monthly-equivalent spend across open subscriptions
    pub monthly_total: Decimal,
    pub annual_total: Decimal,
    pub open_subscriptions: usize,
    /// Open subscriptions whose cadence is unknown or one-off
    pub excluded: usize,
}

/// A subscription row read while holding its key lock. The lock is released
/// on drop.
pub struct LockedSubscription {
    pub subscription: Subscription,
    _guard: OwnedMutexGuard<()>,
}

fn lock_key(user_id: Uuid, normalized_name: &str) -> String {
    format!("{user_id}:{normalized_name}")
}

pub struct Registry {
    repo: Arc<dyn Repository>,
    locks: KeyedLocks,
}

impl Registry {
    pub fn new(repo: Arc<dyn Repository>) -> Self {
        Self {
            repo,
            locks: KeyedLocks::default(),
        }
    }

    pub async fn upsert(
        &self,
        user_id: Uuid,
        candidate: &DetectionCandidate,
    ) -> AppResult<Subscription> {
        self.upsert_at(user_id, candidate, Utc::now()).await
    }

    pub async fn upsert_at(
        &self,
        user_id: Uuid,
        candidate: &DetectionCandidate,
        now: DateTime<Utc>,
    ) -> AppResult<Subscription> {
        let display_name = patterns::normalize_service_name(&candidate.service_name);
        let normalized = patterns::service_key(&candidate.service_name);
        let _guard = self.locks.lock(&lock_key(user_id, &normalized)).await;

        match self.repo.find_open_subscription(user_id, &normalized).await? {
            Some(mut existing) => {
                existing.merge_candidate(candidate, now);
                self.repo.update_subscription(&existing).await?;
                tracing::debug!("Updated subscription {} for user {}", existing.service_name, user_id);
                Ok(existing)
            }
            None => {
                let category = patterns::service_category(&normalized).to_string();
                let created = Subscription::from_candidate(
                    user_id,
                    display_name,
                    normalized,
                    category,
                    candidate,
                    now,
                );
                self.repo.insert_subscription(&created).await?;
                tracing::info!("New subscription {} for user {}", created.service_name, user_id);
                Ok(created)
            }
        }
    }

    /// Take the key lock of a subscription and load its current row
    pub async fn lock_subscription(&self, subscription_id: Uuid) -> AppResult<LockedSubscription> {
        // user and normalized name never change, so any copy gives the key
        let key = {
            let snapshot = self.repo.get_subscription(subscription_id).await?;
            lock_key(snapshot.user_id, &snapshot.normalized_name)
        };
        let guard = self.locks.lock(&key).await;
        let subscription = self.repo.get_subscription(subscription_id).await?;
        Ok(LockedSubscription {
            subscription,
            _guard: guard,
        })
    }

    /// Write back a row whose lock the caller still holds
    pub async fn save(&self, locked: &LockedSubscription) -> AppResult<()> {
        self.repo.update_subscription(&locked.subscription).await
    }

    pub async fn spending_summary(&self, user_id: Uuid) -> AppResult<SpendingSummary> {
        let open: Vec<Subscription> = self
            .repo
            .list_subscriptions(user_id)
            .await?
            .into_iter()
            .filter(|s| s.status.is_open())
            .collect();

        let monthly: Vec<Decimal> = open.iter().filter_map(Subscription::monthly_cost).collect();
        let monthly_total: Decimal = monthly.iter().copied().sum();

        Ok(SpendingSummary {
            monthly_total,
            annual_total: monthly_total * Decimal::from(12),
            open_subscriptions: open.len(),
            excluded: open.len() - monthly.len(),
        })
    }

    /// User says the subscription is gone. An action waiting on an inbox
    /// confirmation is confirmed along with it.
    pub async fn mark_cancelled_by_user(
        &self,
        subscription_id: Uuid,
        now: DateTime<Utc>,
    ) -> AppResult<Subscription> {
        let mut locked = self.lock_subscription(subscription_id).await?;
        if locked.subscription.status == SubscriptionStatus::Cancelled {
            return Ok(locked.subscription);
        }
        locked.subscription.mark_cancelled(now);
        self.save(&locked).await?;

        if let Some(mut action) = self.repo.find_active_action(subscription_id).await? {
            if action.status == CancellationStatus::AwaitingConfirmation {
                action.transition(CancellationStatus::Confirmed)?;
                action.confirmed_at = Some(now);
                action.completed_at = Some(now);
                self.repo.update_cancellation_action(&action).await?;
            }
        }

        Ok(locked.subscription)
    }
}
