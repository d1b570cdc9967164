use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum Cadence {
    Monthly,
    #[strum(to_string = "annually", serialize = "annual", serialize = "yearly")]
    Annually,
    Quarterly,
    #[serde(rename = "one-time")]
    #[strum(to_string = "one-time", serialize = "one_time", serialize = "onetime")]
    OneTime,
}

impl Cadence {
    /// Number of months one charge covers; `None` for one-off purchases
    pub fn months(self) -> Option<u32> {
        match self {
            Cadence::Monthly => Some(1),
            Cadence::Quarterly => Some(3),
            Cadence::Annually => Some(12),
            Cadence::OneTime => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, AsRefStr)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum DetectionMethod {
    RuleBased,
    Generative,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Price {
    pub amount: Decimal,
    /// ISO 4217 code
    pub currency: String,
}

impl std::fmt::Display for Price {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.amount, self.currency)
    }
}

/// Unconfirmed per-message extraction, consumed once by the registry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionCandidate {
    pub service_name: String,
    pub price: Price,
    pub cadence: Option<Cadence>,
    pub renewal_date: Option<NaiveDate>,
    pub cancellation_url: Option<String>,
    pub management_url: Option<String>,
    pub confidence: f64,
    pub method: DetectionMethod,
    pub source_message_id: String,
    pub sender_domain: Option<String>,
    pub payment_method_last4: Option<String>,
    pub tier: Option<String>,
}
