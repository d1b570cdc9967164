use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::{AppError, AppResult};

use super::{
    cancellation_action::{CancellationAction, CancellationStatus},
    scan_session::ScanSession,
    subscription::Subscription,
    user::UserAccount,
};

/// Storage seam for the pipeline. Implementations only need plain CRUD;
/// per-key write serialization for subscriptions is done by the registry.
#[async_trait]
pub trait Repository: Send + Sync {
    async fn upsert_user(&self, user: &UserAccount) -> AppResult<()>;
    async fn get_user(&self, user_id: Uuid) -> AppResult<UserAccount>;
    /// Stamp the last scan time and recount the user's open subscriptions
    async fn record_scan_summary(&self, user_id: Uuid, scanned_at: DateTime<Utc>) -> AppResult<()>;

    async fn insert_scan_session(&self, session: &ScanSession) -> AppResult<()>;
    async fn get_scan_session(&self, session_id: Uuid) -> AppResult<ScanSession>;
    async fn update_scan_session(&self, session: &ScanSession) -> AppResult<()>;

    async fn find_open_subscription(
        &self,
        user_id: Uuid,
        normalized_name: &str,
    ) -> AppResult<Option<Subscription>>;
    async fn insert_subscription(&self, subscription: &Subscription) -> AppResult<()>;
    async fn update_subscription(&self, subscription: &Subscription) -> AppResult<()>;
    async fn get_subscription(&self, subscription_id: Uuid) -> AppResult<Subscription>;
    async fn list_subscriptions(&self, user_id: Uuid) -> AppResult<Vec<Subscription>>;

    async fn insert_cancellation_action(&self, action: &CancellationAction) -> AppResult<()>;
    async fn update_cancellation_action(&self, action: &CancellationAction) -> AppResult<()>;
    async fn get_cancellation_action(&self, action_id: Uuid) -> AppResult<CancellationAction>;
    /// The non-terminal action for a subscription, if any
    async fn find_active_action(&self, subscription_id: Uuid)
        -> AppResult<Option<CancellationAction>>;
    async fn list_awaiting_confirmation(&self) -> AppResult<Vec<CancellationAction>>;
}

#[derive(Default)]
pub struct InMemoryRepository {
    users: RwLock<HashMap<Uuid, UserAccount>>,
    sessions: RwLock<HashMap<Uuid, ScanSession>>,
    subscriptions: RwLock<HashMap<Uuid, Subscription>>,
    actions: RwLock<HashMap<Uuid, CancellationAction>>,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

fn not_found(kind: &str, id: Uuid) -> AppError {
    AppError::NotFound(format!("{kind} {id}"))
}

#[async_trait]
impl Repository for InMemoryRepository {
    async fn upsert_user(&self, user: &UserAccount) -> AppResult<()> {
        self.users.write().await.insert(user.id, user.clone());
        Ok(())
    }

    async fn get_user(&self, user_id: Uuid) -> AppResult<UserAccount> {
        self.users
            .read()
            .await
            .get(&user_id)
            .cloned()
            .ok_or_else(|| not_found("User", user_id))
    }

    async fn record_scan_summary(&self, user_id: Uuid, scanned_at: DateTime<Utc>) -> AppResult<()> {
        let open = self
            .subscriptions
            .read()
            .await
            .values()
            .filter(|s| s.user_id == user_id && s.status.is_open())
            .count() as u64;

        let mut users = self.users.write().await;
        let user = users
            .get_mut(&user_id)
            .ok_or_else(|| not_found("User", user_id))?;
        user.last_scan_at = Some(scanned_at);
        user.subscription_count = open;
        Ok(())
    }

    async fn insert_scan_session(&self, session: &ScanSession) -> AppResult<()> {
        let mut sessions = self.sessions.write().await;
        if sessions.contains_key(&session.id) {
            return Err(AppError::Conflict(format!("Scan session {}", session.id)));
        }
        sessions.insert(session.id, session.clone());
        Ok(())
    }

    async fn get_scan_session(&self, session_id: Uuid) -> AppResult<ScanSession> {
        self.sessions
            .read()
            .await
            .get(&session_id)
            .cloned()
            .ok_or_else(|| not_found("Scan session", session_id))
    }

    async fn update_scan_session(&self, session: &ScanSession) -> AppResult<()> {
        let mut sessions = self.sessions.write().await;
        let stored = sessions
            .get_mut(&session.id)
            .ok_or_else(|| not_found("Scan session", session.id))?;
        *stored = session.clone();
        Ok(())
    }

    async fn find_open_subscription(
        &self,
        user_id: Uuid,
        normalized_name: &str,
    ) -> AppResult<Option<Subscription>> {
        Ok(self
            .subscriptions
            .read()
            .await
            .values()
            .find(|s| {
                s.user_id == user_id
                    && s.normalized_name == normalized_name
                    && s.status.is_open()
            })
            .cloned())
    }

    async fn insert_subscription(&self, subscription: &Subscription) -> AppResult<()> {
        let mut subscriptions = self.subscriptions.write().await;
        if subscriptions.contains_key(&subscription.id) {
            return Err(AppError::Conflict(format!(
                "Subscription {}",
                subscription.id
            )));
        }
        subscriptions.insert(subscription.id, subscription.clone());
        Ok(())
    }

    async fn update_subscription(&self, subscription: &Subscription) -> AppResult<()> {
        let mut subscriptions = self.subscriptions.write().await;
        let stored = subscriptions
            .get_mut(&subscription.id)
            .ok_or_else(|| not_found("Subscription", subscription.id))?;
        *stored = subscription.clone();
        Ok(())
    }

    async fn get_subscription(&self, subscription_id: Uuid) -> AppResult<Subscription> {
        self.subscriptions
            .read()
            .await
            .get(&subscription_id)
            .cloned()
            .ok_or_else(|| not_found("Subscription", subscription_id))
    }

    async fn list_subscriptions(&self, user_id: Uuid) -> AppResult<Vec<Subscription>> {
        let mut subscriptions: Vec<Subscription> = self
            .subscriptions
            .read()
            .await
            .values()
            .filter(|s| s.user_id == user_id)
            .cloned()
            .collect();
        subscriptions.sort_by(|a, b| a.service_name.cmp(&b.service_name));
        Ok(subscriptions)
    }

    async fn insert_cancellation_action(&self, action: &CancellationAction) -> AppResult<()> {
        let mut actions = self.actions.write().await;
        if actions.contains_key(&action.id) {
            return Err(AppError::Conflict(format!("Cancellation {}", action.id)));
        }
        actions.insert(action.id, action.clone());
        Ok(())
    }

    async fn update_cancellation_action(&self, action: &CancellationAction) -> AppResult<()> {
        let mut actions = self.actions.write().await;
        let stored = actions
            .get_mut(&action.id)
            .ok_or_else(|| not_found("Cancellation", action.id))?;
        *stored = action.clone();
        Ok(())
    }

    async fn get_cancellation_action(&self, action_id: Uuid) -> AppResult<CancellationAction> {
        self.actions
            .read()
            .await
            .get(&action_id)
            .cloned()
            .ok_or_else(|| not_found("Cancellation", action_id))
    }

    async fn find_active_action(
        &self,
        subscription_id: Uuid,
    ) -> AppResult<Option<CancellationAction>> {
        Ok(self
            .actions
            .read()
            .await
            .values()
            .find(|a| a.subscription_id == subscription_id && !a.status.is_terminal())
            .cloned())
    }

    async fn list_awaiting_confirmation(&self) -> AppResult<Vec<CancellationAction>> {
        Ok(self
            .actions
            .read()
            .await
            .values()
            .filter(|a| a.status == CancellationStatus::AwaitingConfirmation)
            .cloned()
            .collect())
    }
}
