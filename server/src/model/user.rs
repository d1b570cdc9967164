use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Mailbox owner. The refresh credential is opaque to the pipeline and only
/// ever handed to the credential provider.
#[derive(Clone, Serialize, Deserialize)]
pub struct UserAccount {
    pub id: Uuid,
    pub email: String,
    #[serde(skip_serializing)]
    pub refresh_token: String,
    pub last_scan_at: Option<DateTime<Utc>>,
    pub subscription_count: u64,
}

impl UserAccount {
    pub fn new(email: impl Into<String>, refresh_token: impl Into<String>) -> Self {
        UserAccount {
            id: Uuid::new_v4(),
            email: email.into(),
            refresh_token: refresh_token.into(),
            last_scan_at: None,
            subscription_count: 0,
        }
    }
}

impl std::fmt::Debug for UserAccount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UserAccount")
            .field("id", &self.id)
            .field("email", &self.email)
            .field("last_scan_at", &self.last_scan_at)
            .field("subscription_count", &self.subscription_count)
            .finish_non_exhaustive()
    }
}
