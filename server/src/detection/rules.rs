//! Pattern-only extraction, the cheap path tried before any model call

use crate::{
    email::message::NormalizedMessage,
    model::candidate::{DetectionCandidate, DetectionMethod, Price},
};

use super::patterns::{self, UNKNOWN_SERVICE};

/// Fields that count towards rule confidence
const SCORED_FIELDS: f64 = 4.0;

#[derive(Debug, Clone, PartialEq)]
pub struct RuleExtraction {
    /// Present when a price was found; the name falls back to the sentinel
    pub candidate: Option<DetectionCandidate>,
    pub confidence: f64,
}

/// Service name by priority: known service in the subject, sender domain
/// brand, first capitalized word of the body. `None` when nothing matched.
pub fn service_name_for(msg: &NormalizedMessage, text: &str) -> Option<String> {
    if let Some(known) = patterns::known_service_in(&msg.subject) {
        return Some(known.to_string());
    }
    if let Some(brand) = msg.sender_domain().as_deref().and_then(patterns::domain_brand) {
        return Some(patterns::title_case(&brand));
    }
    patterns::first_capitalized_word(text)
}

pub fn extract(msg: &NormalizedMessage) -> RuleExtraction {
    let text = msg.text_view();
    let haystack = format!("{}\n{}\n{}", msg.subject, text, msg.body_html);

    let price = patterns::extract_price(&haystack);
    let cadence = patterns::infer_cadence(&haystack);
    let cancellation_url = patterns::extract_cancellation_link(&format!("{}\n{}", text, msg.body_html));
    // The sentinel is a name like any other and scores
    let service_name = service_name_for(msg, &text).unwrap_or_else(|| UNKNOWN_SERVICE.to_string());

    let found = [
        price.is_some(),
        cadence.is_some(),
        cancellation_url.is_some(),
        !service_name.is_empty(),
    ]
    .iter()
    .filter(|hit| **hit)
    .count();
    let confidence = found as f64 / SCORED_FIELDS;

    let candidate = price.map(|amount| DetectionCandidate {
        service_name,
        price: Price {
            amount,
            currency: patterns::infer_currency(&haystack).to_string(),
        },
        cadence,
        renewal_date: patterns::extract_date(&text).and_then(patterns::parse_date),
        management_url: patterns::extract_management_link(&format!("{}\n{}", text, msg.body_html)),
        cancellation_url,
        confidence,
        method: DetectionMethod::RuleBased,
        source_message_id: msg.id.clone(),
        sender_domain: msg.sender_domain(),
        payment_method_last4: patterns::extract_payment_last4(&text),
        tier: None,
    });

    RuleExtraction {
        candidate,
        confidence,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::candidate::Cadence;
    use chrono::NaiveDate;
    use rust_decimal::Decimal;

    fn message(from: &str, subject: &str, body: &str) -> NormalizedMessage {
        NormalizedMessage {
            id: "m1".to_string(),
            from: from.to_string(),
            subject: subject.to_string(),
            body_text: body.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_full_rule_extraction() {
        let msg = message(
            "Netflix <info@mailer.netflix.com>",
            "Your Netflix membership receipt",
            "Your subscription renews on 2026-11-15 at $15.49/month. \
             To cancel visit https://www.netflix.com/cancelplan. Visa ending in 4242.",
        );
        let result = extract(&msg);
        assert_eq!(result.confidence, 1.0);

        let candidate = result.candidate.unwrap();
        assert_eq!(candidate.service_name, "Netflix");
        assert_eq!(candidate.price.amount, Decimal::new(1549, 2));
        assert_eq!(candidate.price.currency, "USD");
        assert_eq!(candidate.cadence, Some(Cadence::Monthly));
        assert_eq!(candidate.renewal_date, NaiveDate::from_ymd_opt(2026, 11, 15));
        assert_eq!(
            candidate.cancellation_url.as_deref(),
            Some("https://www.netflix.com/cancelplan")
        );
        assert_eq!(candidate.payment_method_last4.as_deref(), Some("4242"));
        assert_eq!(candidate.sender_domain.as_deref(), Some("mailer.netflix.com"));
        assert_eq!(candidate.method, DetectionMethod::RuleBased);
    }

    #[test]
    fn test_domain_brand_fallback_and_partial_confidence() {
        let msg = message(
            "Billing <billing@acmecloud.io>",
            "Payment received",
            "We charged $42.00 to your card.",
        );
        let result = extract(&msg);
        // price and name only
        assert_eq!(result.confidence, 0.5);
        assert_eq!(result.candidate.unwrap().service_name, "Acmecloud");
    }

    #[test]
    fn test_no_price_means_no_candidate() {
        let msg = message(
            "Spotify <no-reply@spotify.com>",
            "Spotify monthly plan",
            "Your subscription renews monthly.",
        );
        let result = extract(&msg);
        assert!(result.candidate.is_none());
        assert_eq!(result.confidence, 0.5);
    }

    #[test]
    fn test_unknown_sentinel_counts_as_found() {
        let msg = message("", "", "paid $5.00 today");
        let result = extract(&msg);
        // price and the sentinel name
        assert_eq!(result.confidence, 0.5);
        assert_eq!(result.candidate.unwrap().service_name, UNKNOWN_SERVICE);
    }
}
