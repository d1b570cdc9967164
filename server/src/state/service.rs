//! Subscription Service
//!
//! Synchronous handles over the background pipeline. Writes that start work
//! return as soon as the job is queued.

use std::sync::Arc;

use chrono::Utc;
use uuid::Uuid;

use crate::{
    error::{AppError, AppResult},
    model::{
        cancellation_action::CancellationAction,
        repository::Repository,
        scan_session::{ScanParams, ScanSession},
        subscription::Subscription,
    },
    state::{
        cancellation::engine::CancellationEngine,
        jobs::{Job, JobQueue},
        registry::{Registry, SpendingSummary},
    },
};

#[derive(Clone)]
pub struct SubscriptionService {
    repo: Arc<dyn Repository>,
    registry: Arc<Registry>,
    engine: Arc<CancellationEngine>,
    queue: JobQueue,
    default_lookback_years: u32,
}

impl SubscriptionService {
    pub fn new(
        repo: Arc<dyn Repository>,
        registry: Arc<Registry>,
        engine: Arc<CancellationEngine>,
        queue: JobQueue,
        default_lookback_years: u32,
    ) -> Self {
        Self {
            repo,
            registry,
            engine,
            queue,
            default_lookback_years,
        }
    }

    /// Create a running session and queue the scan for it
    pub async fn start_scan(&self, user_id: Uuid, lookback_years: Option<u32>) -> AppResult<Uuid> {
        let lookback_years = lookback_years.unwrap_or(self.default_lookback_years);
        if lookback_years == 0 {
            return Err(AppError::BadRequest(
                "lookback must be at least one year".to_string(),
            ));
        }
        let now = Utc::now();
        let params = ScanParams::new(lookback_years, now.date_naive())?;
        self.repo.get_user(user_id).await?;

        let session = ScanSession::new(user_id, params, now);
        self.repo.insert_scan_session(&session).await?;
        self.queue.push(Job::Scan {
            user_id,
            session_id: session.id,
            lookback_years,
        });
        tracing::info!("Queued scan {} for user {}", session.id, user_id);
        Ok(session.id)
    }

    pub async fn get_scan_status(&self, session_id: Uuid) -> AppResult<ScanSession> {
        self.repo.get_scan_session(session_id).await
    }

    /// Returns the action in flight for the subscription, creating and
    /// queueing a new one if there is none
    pub async fn initiate_cancellation(&self, subscription_id: Uuid) -> AppResult<CancellationAction> {
        let (action, created) = self.engine.initiate(subscription_id, Utc::now()).await?;
        if created {
            self.queue.push(Job::Cancellation {
                action_id: action.id,
            });
        }
        Ok(action)
    }

    pub async fn retry_cancellation(&self, action_id: Uuid) -> AppResult<CancellationAction> {
        let action = self.engine.retry(action_id, Utc::now()).await?;
        self.queue.push(Job::Cancellation {
            action_id: action.id,
        });
        Ok(action)
    }

    /// Queue an out-of-band inbox check for an action awaiting confirmation
    pub async fn request_confirmation_check(&self, action_id: Uuid) -> AppResult<()> {
        self.repo.get_cancellation_action(action_id).await?;
        self.queue.push(Job::ConfirmationCheck { action_id });
        Ok(())
    }

    pub async fn mark_cancelled_by_user(&self, subscription_id: Uuid) -> AppResult<Subscription> {
        self.registry
            .mark_cancelled_by_user(subscription_id, Utc::now())
            .await
    }

    pub async fn list_subscriptions(&self, user_id: Uuid) -> AppResult<Vec<Subscription>> {
        self.repo.list_subscriptions(user_id).await
    }

    pub async fn spending_summary(&self, user_id: Uuid) -> AppResult<SpendingSummary> {
        self.registry.spending_summary(user_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        model::{
            cancellation_action::CancellationStatus,
            candidate::{Cadence, DetectionCandidate, DetectionMethod, Price},
            repository::InMemoryRepository,
            scan_session::ScanStatus,
            subscription::SubscriptionStatus,
            user::UserAccount,
        },
        testing::common::test_cancellation_config,
    };
    use rust_decimal::Decimal;

    struct Fixture {
        repo: Arc<InMemoryRepository>,
        queue: JobQueue,
        service: SubscriptionService,
        user: UserAccount,
    }

    async fn fixture() -> Fixture {
        let repo = Arc::new(InMemoryRepository::new());
        let user = UserAccount::new("someone@example.com", "refresh");
        repo.upsert_user(&user).await.unwrap();
        let queue = JobQueue::new();
        let registry = Arc::new(Registry::new(repo.clone()));
        let engine = CancellationEngine::new(
            repo.clone(),
            registry.clone(),
            reqwest::Client::new(),
            None,
            test_cancellation_config(),
        );
        let service = SubscriptionService::new(
            repo.clone(),
            registry,
            Arc::new(engine),
            queue.clone(),
            3,
        );
        Fixture {
            repo,
            queue,
            service,
            user,
        }
    }

    fn candidate(name: &str, cents: i64) -> DetectionCandidate {
        DetectionCandidate {
            service_name: name.to_string(),
            price: Price {
                amount: Decimal::new(cents, 2),
                currency: "USD".to_string(),
            },
            cadence: Some(Cadence::Monthly),
            renewal_date: None,
            cancellation_url: None,
            management_url: None,
            confidence: 0.9,
            method: DetectionMethod::RuleBased,
            source_message_id: format!("{name}-1"),
            sender_domain: None,
            payment_method_last4: None,
            tier: None,
        }
    }

    async fn subscription(f: &Fixture, name: &str, cents: i64) -> Subscription {
        Registry::new(f.repo.clone())
            .upsert(f.user.id, &candidate(name, cents))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_start_scan_queues_job_with_default_lookback() {
        let f = fixture().await;
        let session_id = f.service.start_scan(f.user.id, None).await.unwrap();

        let session = f.service.get_scan_status(session_id).await.unwrap();
        assert_eq!(session.status, ScanStatus::Running);
        assert_eq!(session.params.lookback_years, 3);

        let queued = f.queue.pop().unwrap();
        assert_eq!(
            queued.job,
            Job::Scan {
                user_id: f.user.id,
                session_id,
                lookback_years: 3
            }
        );
    }

    #[tokio::test]
    async fn test_start_scan_rejects_bad_input() {
        let f = fixture().await;
        let result = f.service.start_scan(f.user.id, Some(0)).await;
        assert!(matches!(result, Err(AppError::BadRequest(_))));

        let result = f.service.start_scan(f.user.id, Some(1_000_000)).await;
        assert!(matches!(result, Err(AppError::BadRequest(_))));

        let result = f.service.start_scan(Uuid::new_v4(), Some(1)).await;
        assert!(matches!(result, Err(AppError::NotFound(_))));
        assert!(f.queue.is_empty());
    }

    #[tokio::test]
    async fn test_initiate_queues_once() {
        let f = fixture().await;
        let sub = subscription(&f, "Hulu", 799).await;

        let first = f.service.initiate_cancellation(sub.id).await.unwrap();
        let second = f.service.initiate_cancellation(sub.id).await.unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(f.queue.len(), 1);
        assert_eq!(
            f.queue.pop().unwrap().job,
            Job::Cancellation {
                action_id: first.id
            }
        );
    }

    #[tokio::test]
    async fn test_retry_requeues_failed_action() {
        let f = fixture().await;
        let sub = subscription(&f, "Hulu", 799).await;
        let action = f.service.initiate_cancellation(sub.id).await.unwrap();
        f.queue.pop();

        let mut stored = f.repo.get_cancellation_action(action.id).await.unwrap();
        stored.transition(CancellationStatus::InProgress).unwrap();
        stored.transition(CancellationStatus::Failed).unwrap();
        f.repo.update_cancellation_action(&stored).await.unwrap();

        let retried = f.service.retry_cancellation(action.id).await.unwrap();
        assert_eq!(retried.status, CancellationStatus::Pending);
        assert_eq!(f.queue.len(), 1);

        // pending cannot be retried again
        let again = f.service.retry_cancellation(action.id).await;
        assert!(matches!(again, Err(AppError::InvalidTransition { .. })));
    }

    #[tokio::test]
    async fn test_listing_summary_and_user_cancellation() {
        let f = fixture().await;
        let hulu = subscription(&f, "Hulu", 800).await;
        subscription(&f, "Spotify", 1200).await;

        let summary = f.service.spending_summary(f.user.id).await.unwrap();
        assert_eq!(summary.monthly_total, Decimal::new(2000, 2));
        assert_eq!(summary.open_subscriptions, 2);

        let cancelled = f.service.mark_cancelled_by_user(hulu.id).await.unwrap();
        assert_eq!(cancelled.status, SubscriptionStatus::Cancelled);

        let subs = f.service.list_subscriptions(f.user.id).await.unwrap();
        assert_eq!(subs.len(), 2);
        let summary = f.service.spending_summary(f.user.id).await.unwrap();
        assert_eq!(summary.monthly_total, Decimal::new(1200, 2));
    }
}
