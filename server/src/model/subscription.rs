use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};
use uuid::Uuid;

use super::candidate::{Cadence, DetectionCandidate, DetectionMethod};

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum SubscriptionStatus {
    Active,
    PendingCancellation,
    Cancelled,
    Expired,
}

impl SubscriptionStatus {
    /// Open subscriptions take part in deduplication; at most one per service
    pub fn is_open(self) -> bool {
        matches!(
            self,
            SubscriptionStatus::Active | SubscriptionStatus::PendingCancellation
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscription {
    pub id: Uuid,
    pub user_id: Uuid,
    pub service_name: String,
    /// Dedup key: lowercased normalized service name
    pub normalized_name: String,
    pub domain: Option<String>,
    pub category: String,
    pub price: Decimal,
    pub currency: String,
    pub cadence: Option<Cadence>,
    pub first_detected: NaiveDate,
    pub next_renewal: Option<NaiveDate>,
    pub last_verified: DateTime<Utc>,
    pub cancellation_url: Option<String>,
    pub management_url: Option<String>,
    pub payment_method_last4: Option<String>,
    pub tier: Option<String>,
    pub status: SubscriptionStatus,
    pub confidence: f64,
    pub method: DetectionMethod,
    pub source_message_ids: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub cancelled_at: Option<DateTime<Utc>>,
}

impl Subscription {
    pub fn from_candidate(
        user_id: Uuid,
        service_name: String,
        normalized_name: String,
        category: String,
        candidate: &DetectionCandidate,
        now: DateTime<Utc>,
    ) -> Self {
        Subscription {
            id: Uuid::new_v4(),
            user_id,
            service_name,
            normalized_name,
            domain: candidate.sender_domain.clone(),
            category,
            price: candidate.price.amount,
            currency: candidate.price.currency.clone(),
            cadence: candidate.cadence,
            first_detected: now.date_naive(),
            next_renewal: candidate.renewal_date,
            last_verified: now,
            cancellation_url: candidate.cancellation_url.clone(),
            management_url: candidate.management_url.clone(),
            payment_method_last4: candidate.payment_method_last4.clone(),
            tier: candidate.tier.clone(),
            status: SubscriptionStatus::Active,
            confidence: candidate.confidence,
            method: candidate.method,
            source_message_ids: vec![candidate.source_message_id.clone()],
            created_at: now,
            updated_at: now,
            cancelled_at: None,
        }
    }

    /// Fold a later detection into this record. Known fields are only ever
    /// replaced by non-null values.
    pub fn merge_candidate(&mut self, candidate: &DetectionCandidate, now: DateTime<Utc>) {
        self.price = candidate.price.amount;
        self.currency = candidate.price.currency.clone();
        if let Some(cadence) = candidate.cadence {
            self.cadence = Some(cadence);
        }
        if let Some(renewal) = candidate.renewal_date {
            self.next_renewal = Some(renewal);
        }
        if let Some(url) = &candidate.cancellation_url {
            self.cancellation_url = Some(url.clone());
        }
        if let Some(url) = &candidate.management_url {
            self.management_url = Some(url.clone());
        }
        if let Some(last4) = &candidate.payment_method_last4 {
            self.payment_method_last4 = Some(last4.clone());
        }
        if let Some(tier) = &candidate.tier {
            self.tier = Some(tier.clone());
        }
        if self.domain.is_none() {
            self.domain = candidate.sender_domain.clone();
        }
        if candidate.confidence >= self.confidence {
            self.confidence = candidate.confidence;
            self.method = candidate.method;
        }
        if !self
            .source_message_ids
            .iter()
            .any(|id| id == &candidate.source_message_id)
        {
            self.source_message_ids
                .push(candidate.source_message_id.clone());
        }
        self.last_verified = now;
        self.updated_at = now;
    }

    pub fn mark_pending_cancellation(&mut self, now: DateTime<Utc>) {
        if self.status == SubscriptionStatus::Active {
            self.status = SubscriptionStatus::PendingCancellation;
            self.updated_at = now;
        }
    }

    /// Back to `active` once no action is working on the cancellation
    pub fn reopen(&mut self, now: DateTime<Utc>) {
        if self.status == SubscriptionStatus::PendingCancellation {
            self.status = SubscriptionStatus::Active;
            self.updated_at = now;
        }
    }

    pub fn mark_cancelled(&mut self, now: DateTime<Utc>) {
        self.status = SubscriptionStatus::Cancelled;
        self.cancelled_at = Some(now);
        self.updated_at = now;
    }

    /// Monthly-equivalent cost, `None` for one-off or unknown cadence
    pub fn monthly_cost(&self) -> Option<Decimal> {
        let months = self.cadence?.months()?;
        Some((self.price / Decimal::from(months)).round_dp(2))
    }
}
