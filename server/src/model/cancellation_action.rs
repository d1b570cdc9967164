use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};
use uuid::Uuid;

use crate::error::{AppError, AppResult};

use super::subscription::Subscription;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum CancellationStatus {
    Pending,
    InProgress,
    AwaitingConfirmation,
    Confirmed,
    Failed,
    ManualRequired,
}

impl CancellationStatus {
    pub fn can_transition_to(self, next: CancellationStatus) -> bool {
        use CancellationStatus::*;
        matches!(
            (self, next),
            (Pending, InProgress)
                | (InProgress, AwaitingConfirmation)
                | (InProgress, ManualRequired)
                | (InProgress, Failed)
                | (AwaitingConfirmation, Confirmed)
                | (AwaitingConfirmation, Failed)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            CancellationStatus::Confirmed
                | CancellationStatus::Failed
                | CancellationStatus::ManualRequired
        )
    }

    /// Terminal states a user may send back to `pending`
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            CancellationStatus::Failed | CancellationStatus::ManualRequired
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, AsRefStr)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ActionType {
    Automated,
    ManualLink,
    ManualPhone,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, AsRefStr)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum LinkKind {
    Direct,
    LoginRequired,
    Form,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CancellationAction {
    pub id: Uuid,
    pub subscription_id: Uuid,
    pub user_id: Uuid,
    pub action_type: ActionType,
    pub status: CancellationStatus,
    pub target_url: Option<String>,
    pub link_kind: Option<LinkKind>,
    pub http_method: Option<String>,
    pub response_status: Option<u16>,
    pub response_snippet: Option<String>,
    pub confirmation_message_id: Option<String>,
    pub confirmed_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub error_message: Option<String>,
    pub requires_manual_action: bool,
    pub manual_instructions: Option<String>,
    pub initiated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub monitoring_deadline: Option<DateTime<Utc>>,
}

impl CancellationAction {
    pub fn new(subscription: &Subscription, max_retries: u32, now: DateTime<Utc>) -> Self {
        CancellationAction {
            id: Uuid::new_v4(),
            subscription_id: subscription.id,
            user_id: subscription.user_id,
            action_type: ActionType::Automated,
            status: CancellationStatus::Pending,
            target_url: subscription
                .cancellation_url
                .clone()
                .or_else(|| subscription.management_url.clone()),
            link_kind: None,
            http_method: None,
            response_status: None,
            response_snippet: None,
            confirmation_message_id: None,
            confirmed_at: None,
            retry_count: 0,
            max_retries,
            error_message: None,
            requires_manual_action: false,
            manual_instructions: None,
            initiated_at: now,
            completed_at: None,
            monitoring_deadline: None,
        }
    }

    pub fn transition(&mut self, next: CancellationStatus) -> AppResult<()> {
        if !self.status.can_transition_to(next) {
            return Err(AppError::InvalidTransition {
                from: self.status,
                to: next,
            });
        }
        tracing::debug!("Cancellation {}: {} -> {}", self.id, self.status, next);
        self.status = next;
        Ok(())
    }

    /// User-driven re-entry into `pending`; the only way out of a terminal state
    pub fn retry(&mut self, now: DateTime<Utc>) -> AppResult<()> {
        if !self.status.is_retryable() {
            return Err(AppError::InvalidTransition {
                from: self.status,
                to: CancellationStatus::Pending,
            });
        }
        self.status = CancellationStatus::Pending;
        self.action_type = ActionType::Automated;
        self.link_kind = None;
        self.http_method = None;
        self.retry_count = 0;
        self.initiated_at = now;
        self.completed_at = None;
        self.monitoring_deadline = None;
        self.error_message = None;
        self.requires_manual_action = false;
        self.manual_instructions = None;
        self.response_status = None;
        self.response_snippet = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use CancellationStatus::*;

    const ALL: [CancellationStatus; 6] = [
        Pending,
        InProgress,
        AwaitingConfirmation,
        Confirmed,
        Failed,
        ManualRequired,
    ];

    #[test]
    fn test_no_edges_out_of_terminal_states() {
        for from in ALL.iter().filter(|s| s.is_terminal()) {
            for to in ALL {
                assert!(
                    !from.can_transition_to(to),
                    "{} -> {} should not be allowed",
                    from,
                    to
                );
            }
        }
    }

    #[test]
    fn test_allowed_edges() {
        let allowed: Vec<(CancellationStatus, CancellationStatus)> = ALL
            .iter()
            .flat_map(|from| ALL.iter().map(move |to| (*from, *to)))
            .filter(|(from, to)| from.can_transition_to(*to))
            .collect();
        assert_eq!(
            allowed,
            vec![
                (Pending, InProgress),
                (InProgress, AwaitingConfirmation),
                (InProgress, Failed),
                (InProgress, ManualRequired),
                (AwaitingConfirmation, Confirmed),
                (AwaitingConfirmation, Failed),
            ]
        );
    }

    #[test]
    fn test_retry_only_from_failed_or_manual() {
        let mut action = CancellationAction {
            id: Uuid::new_v4(),
            subscription_id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            action_type: ActionType::Automated,
            status: Confirmed,
            target_url: None,
            link_kind: None,
            http_method: None,
            response_status: None,
            response_snippet: None,
            confirmation_message_id: None,
            confirmed_at: None,
            retry_count: 2,
            max_retries: 3,
            error_message: None,
            requires_manual_action: false,
            manual_instructions: None,
            initiated_at: Utc::now(),
            completed_at: None,
            monitoring_deadline: None,
        };
        assert!(action.retry(Utc::now()).is_err());

        action.status = ManualRequired;
        action.action_type = ActionType::ManualLink;
        action.link_kind = Some(LinkKind::LoginRequired);
        action.http_method = Some("GET".to_string());
        action.requires_manual_action = true;
        action.retry(Utc::now()).expect("Retry from manual_required");
        assert_eq!(action.status, Pending);
        assert_eq!(action.retry_count, 0);
        assert!(!action.requires_manual_action);
        assert_eq!(action.action_type, ActionType::Automated);
        assert_eq!(action.link_kind, None);
        assert_eq!(action.http_method, None);

        assert!(action.transition(Confirmed).is_err());
        action.transition(InProgress).expect("pending -> in_progress");
    }
}
