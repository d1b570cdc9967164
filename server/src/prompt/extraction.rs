//! Few-shot extraction prompt and strict parsing of the model's reply

use std::str::FromStr;

use indoc::indoc;
use rust_decimal::{prelude::FromPrimitive, Decimal};
use serde::Deserialize;

use crate::{
    detection::patterns,
    error::{AppError, AppResult},
    model::candidate::{Cadence, DetectionCandidate, DetectionMethod, Price},
    util::truncate_chars,
};

const EXTRACTION_INSTRUCTIONS: &str = indoc! {r#"
    You extract subscription details from emails.

    Reply with one JSON object with these keys:
    - service_name: company or product name (string, required)
    - price: amount charged per period (number, required)
    - currency: ISO 4217 code (string, default "USD")
    - billing_period: one of "monthly", "annually", "quarterly", "one-time" (string, required)
    - next_renewal_date: YYYY-MM-DD (string or null)
    - unsubscribe_link: full URL to cancel or manage the subscription (string or null)
    - payment_method_last4: last four digits of the card (string or null)
    - subscription_tier: plan name such as "Premium" or "Pro" (string or null)
    - confidence: how sure you are, 0.0 to 1.0 (number, required)

    Rules:
    1. Use null for anything not present in the email, never an empty string.
    2. Only return a link that appears in the email verbatim.
    3. If the price is ambiguous keep confidence below 0.5.
    4. Drop plan tiers from service_name ("Spotify Premium" becomes "Spotify").

    Example email:
    ---
    Subject: Your Netflix subscription is confirmed
    From: info@netflix.com

    Plan: Premium. Price: $19.99/month. Next billing date: January 15, 2026.
    Payment method: Visa ending in 4532.
    Cancel anytime: https://www.netflix.com/cancelplan
    ---
    Output:
    {"service_name": "Netflix", "price": 19.99, "currency": "USD", "billing_period": "monthly", "next_renewal_date": "2026-01-15", "unsubscribe_link": "https://www.netflix.com/cancelplan", "payment_method_last4": "4532", "subscription_tier": "Premium", "confidence": 0.95}

    Example email:
    ---
    Subject: Welcome to Dropbox Plus!
    From: no-reply@dropbox.com

    2 TB of storage for $11.99 per month, renews on the 20th of each month.
    Manage subscription: https://www.dropbox.com/account/manage
    ---
    Output:
    {"service_name": "Dropbox", "price": 11.99, "currency": "USD", "billing_period": "monthly", "next_renewal_date": null, "unsubscribe_link": "https://www.dropbox.com/account/manage", "payment_method_last4": null, "subscription_tier": "Plus", "confidence": 0.9}

    Example email:
    ---
    Subject: Your annual membership renews soon
    From: support@gymflow.com

    Your GymFlow Premium membership will auto-renew on March 1, 2026.
    Annual fee: $299.00. Payment: MasterCard ****8765.
    Account link: https://gymflow.com/my-account
    ---
    Output:
    {"service_name": "GymFlow", "price": 299.0, "currency": "USD", "billing_period": "annually", "next_renewal_date": "2026-03-01", "unsubscribe_link": "https://gymflow.com/my-account", "payment_method_last4": "8765", "subscription_tier": "Premium", "confidence": 0.88}
"#};

/// Deterministic prompt for one message: subject plus the first `body_chars`
/// characters of its body.
pub fn build_extraction_prompt(subject: &str, body: &str, body_chars: usize) -> String {
    format!(
        "{EXTRACTION_INSTRUCTIONS}\nNow extract from this email:\n---\nSubject: {subject}\n\n{}\n---\n\nOutput only valid JSON, no additional text.",
        truncate_chars(body, body_chars)
    )
}

/// Strip a surrounding markdown code fence, with or without a language tag
pub fn strip_code_fence(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(inner) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let inner = match inner.find('\n') {
        Some(idx) if !inner[..idx].trim_start().starts_with('{') => &inner[idx + 1..],
        _ => inner,
    };
    inner.trim_end().strip_suffix("```").unwrap_or(inner).trim()
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExtractionResponse {
    pub service_name: String,
    pub price: f64,
    pub billing_period: String,
    pub confidence: f64,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub next_renewal_date: Option<String>,
    #[serde(default)]
    pub unsubscribe_link: Option<String>,
    #[serde(default)]
    pub payment_method_last4: Option<String>,
    #[serde(default)]
    pub subscription_tier: Option<String>,
}

impl ExtractionResponse {
    /// Parse a raw model reply. Any shape mismatch is an `AppError::Schema`.
    pub fn parse(raw: &str) -> AppResult<Self> {
        let parsed: ExtractionResponse = serde_json::from_str(strip_code_fence(raw))
            .map_err(|e| AppError::Schema(format!("Extraction reply: {e}")))?;

        if !(0.0..=1.0).contains(&parsed.confidence) {
            return Err(AppError::Schema(format!(
                "Confidence {} outside [0, 1]",
                parsed.confidence
            )));
        }
        parsed.cadence()?;
        Ok(parsed)
    }

    pub fn cadence(&self) -> AppResult<Cadence> {
        Cadence::from_str(self.billing_period.trim()).map_err(|_| {
            AppError::Schema(format!("Unknown billing period {:?}", self.billing_period))
        })
    }

    /// Candidate before validation penalties. `None` when the reply has no
    /// usable service name or a non-positive price.
    pub fn into_candidate(
        self,
        source_message_id: &str,
        sender_domain: Option<String>,
    ) -> AppResult<Option<DetectionCandidate>> {
        let cadence = self.cadence()?;
        let service_name = self.service_name.trim().to_string();
        let amount = Decimal::from_f64(self.price)
            .map(|d| d.round_dp(2))
            .filter(|d| d.is_sign_positive() && !d.is_zero());
        let Some(amount) = amount.filter(|_| !service_name.is_empty()) else {
            return Ok(None);
        };

        let non_empty = |s: Option<String>| s.map(|s| s.trim().to_string()).filter(|s| !s.is_empty());

        Ok(Some(DetectionCandidate {
            service_name,
            price: Price {
                amount,
                currency: non_empty(self.currency)
                    .map(|c| c.to_ascii_uppercase())
                    .unwrap_or_else(|| "USD".to_string()),
            },
            cadence: Some(cadence),
            renewal_date: non_empty(self.next_renewal_date)
                .and_then(|d| patterns::parse_date(&d)),
            cancellation_url: non_empty(self.unsubscribe_link),
            management_url: None,
            confidence: self.confidence,
            method: DetectionMethod::Generative,
            source_message_id: source_message_id.to_string(),
            sender_domain,
            payment_method_last4: non_empty(self.payment_method_last4),
            tier: non_empty(self.subscription_tier),
        }))
    }
}
