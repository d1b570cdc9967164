use chrono::{DateTime, Days, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};
use uuid::Uuid;

use crate::error::{AppError, AppResult};

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ScanStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl ScanStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, ScanStatus::Running)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanParams {
    pub lookback_years: u32,
    /// Lower date bound of the mailbox search
    pub since: NaiveDate,
}

impl ScanParams {
    pub fn new(lookback_years: u32, today: NaiveDate) -> AppResult<Self> {
        let since = today
            .checked_sub_days(Days::new(365 * u64::from(lookback_years)))
            .ok_or_else(|| {
                AppError::BadRequest(format!("lookback of {lookback_years} years is out of range"))
            })?;
        Ok(ScanParams {
            lookback_years,
            since,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanSession {
    pub id: Uuid,
    pub user_id: Uuid,
    pub status: ScanStatus,
    pub total_messages_estimated: u64,
    pub messages_processed: u64,
    pub subscriptions_found: u64,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub params: ScanParams,
}

impl ScanSession {
    pub fn new(user_id: Uuid, params: ScanParams, now: DateTime<Utc>) -> Self {
        ScanSession {
            id: Uuid::new_v4(),
            user_id,
            status: ScanStatus::Running,
            total_messages_estimated: 0,
            messages_processed: 0,
            subscriptions_found: 0,
            started_at: now,
            completed_at: None,
            error_message: None,
            params,
        }
    }

    pub fn complete(&mut self, now: DateTime<Utc>) {
        self.status = ScanStatus::Completed;
        self.completed_at = Some(now);
    }

    pub fn fail(&mut self, error: String, now: DateTime<Utc>) {
        self.status = ScanStatus::Failed;
        self.error_message = Some(error);
        self.completed_at = Some(now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_params_lower_bound() {
        let today = NaiveDate::from_ymd_opt(2026, 10, 19).unwrap();
        let params = ScanParams::new(1, today).unwrap();
        assert_eq!(params.since, NaiveDate::from_ymd_opt(2025, 10, 19).unwrap());
    }

    #[test]
    fn test_params_reject_out_of_range_lookback() {
        let today = NaiveDate::from_ymd_opt(2026, 10, 19).unwrap();
        let result = ScanParams::new(1_000_000, today);
        assert!(matches!(result, Err(AppError::BadRequest(_))));
        assert!(ScanParams::new(u32::MAX, today).is_err());
    }

    #[test]
    fn test_terminal_states() {
        assert!(!ScanStatus::Running.is_terminal());
        assert!(ScanStatus::Completed.is_terminal());
        assert!(ScanStatus::Failed.is_terminal());
        assert!(ScanStatus::Cancelled.is_terminal());
    }
}
