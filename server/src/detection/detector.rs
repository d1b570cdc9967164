//! Subscription Detector
//!
//! Per message: keyword gate, rule extraction, then the generative fallback
//! with post-validation. Provider and schema failures are reported as
//! outcomes and never abort the surrounding scan.

use std::sync::Arc;
use std::time::Duration;

use url::Url;

use crate::{
    email::message::NormalizedMessage,
    model::candidate::DetectionCandidate,
    prompt::{
        extraction::{build_extraction_prompt, ExtractionResponse},
        GenerativeProvider,
    },
    server_config::ModelConfig,
    util::with_timeout,
};

use super::{patterns, rules};

/// Distinct keyword hits required before any extraction runs
pub const MIN_KEYWORD_HITS: usize = 2;
const MISSING_LINK_PENALTY: f64 = 0.3;
const FOREIGN_HOST_PENALTY: f64 = 0.2;

#[derive(Debug, Clone)]
pub struct DetectorConfig {
    pub rule_acceptance_threshold: f64,
    pub detection_threshold: f64,
    pub max_tokens: u32,
    pub temperature: f64,
    pub request_timeout: Duration,
    pub prompt_body_chars: usize,
}

impl From<&ModelConfig> for DetectorConfig {
    fn from(cfg: &ModelConfig) -> Self {
        DetectorConfig {
            rule_acceptance_threshold: cfg.rule_acceptance_threshold,
            detection_threshold: cfg.detection_confidence_threshold,
            max_tokens: cfg.max_tokens,
            temperature: cfg.temperature,
            request_timeout: cfg.request_timeout(),
            prompt_body_chars: cfg.prompt_body_chars,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum NoMatchReason {
    KeywordGate { hits: usize },
    LowConfidence { confidence: f64 },
    ValidationFailed(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum DetectionOutcome {
    Candidate(DetectionCandidate),
    NoMatch(NoMatchReason),
    /// Provider or schema failure for this message only
    Failed(String),
}

impl DetectionOutcome {
    pub fn candidate(self) -> Option<DetectionCandidate> {
        match self {
            DetectionOutcome::Candidate(c) => Some(c),
            _ => None,
        }
    }
}

pub struct SubscriptionDetector {
    provider: Arc<dyn GenerativeProvider>,
    config: DetectorConfig,
}

impl SubscriptionDetector {
    pub fn new(provider: Arc<dyn GenerativeProvider>, config: DetectorConfig) -> Self {
        Self { provider, config }
    }

    pub async fn detect(&self, msg: &NormalizedMessage) -> DetectionOutcome {
        let hits = patterns::keyword_hits(&msg.preview_text());
        if hits < MIN_KEYWORD_HITS {
            return DetectionOutcome::NoMatch(NoMatchReason::KeywordGate { hits });
        }

        let rule = rules::extract(msg);
        if rule.confidence >= self.config.rule_acceptance_threshold {
            if let Some(candidate) = rule.candidate {
                tracing::debug!(
                    "Rule match for message {}: {} ({:.2})",
                    msg.id,
                    candidate.service_name,
                    rule.confidence
                );
                return DetectionOutcome::Candidate(candidate);
            }
        }

        self.detect_generative(msg).await
    }

    async fn detect_generative(&self, msg: &NormalizedMessage) -> DetectionOutcome {
        let prompt = build_extraction_prompt(
            &msg.subject,
            &msg.text_view(),
            self.config.prompt_body_chars,
        );

        let reply = with_timeout(
            "generative extraction",
            self.config.request_timeout,
            self.provider
                .complete(&prompt, self.config.max_tokens, self.config.temperature),
        )
        .await;

        let candidate = match reply
            .and_then(|raw| ExtractionResponse::parse(&raw))
            .and_then(|parsed| parsed.into_candidate(&msg.id, msg.sender_domain()))
        {
            Ok(Some(candidate)) => candidate,
            Ok(None) => {
                return DetectionOutcome::NoMatch(NoMatchReason::ValidationFailed(
                    "missing service name or non-positive price".to_string(),
                ))
            }
            Err(e) => {
                tracing::warn!("Generative extraction failed for message {}: {}", msg.id, e);
                return DetectionOutcome::Failed(e.to_string());
            }
        };

        let candidate = validate(candidate, msg);
        if candidate.confidence < self.config.detection_threshold {
            return DetectionOutcome::NoMatch(NoMatchReason::LowConfidence {
                confidence: candidate.confidence,
            });
        }
        DetectionOutcome::Candidate(candidate)
    }
}

/// Apply link penalties to a generative candidate. A link that is not in the
/// message is likely invented; a link off the sender's domain may be injected.
pub fn validate(mut candidate: DetectionCandidate, msg: &NormalizedMessage) -> DetectionCandidate {
    let Some(link) = candidate.cancellation_url.as_deref() else {
        return candidate;
    };

    if !msg.body_html.contains(link) && !msg.body_text.contains(link) {
        candidate.confidence = (candidate.confidence - MISSING_LINK_PENALTY).max(0.0);
    }

    let host = Url::parse(link)
        .ok()
        .and_then(|u| u.host_str().map(str::to_lowercase));
    if let (Some(host), Some(sender)) = (host, candidate.sender_domain.as_deref()) {
        if !host.contains(&patterns::base_domain(sender)) {
            candidate.confidence = (candidate.confidence - FOREIGN_HOST_PENALTY).max(0.0);
        }
    }

    candidate
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        error::AppError,
        model::candidate::{Cadence, DetectionMethod},
        testing::common::FakeProvider,
    };
    use serde_json::json;

    fn config() -> DetectorConfig {
        DetectorConfig {
            rule_acceptance_threshold: 0.7,
            detection_threshold: 0.5,
            max_tokens: 1000,
            temperature: 0.1,
            request_timeout: Duration::from_secs(5),
            prompt_body_chars: 2000,
        }
    }

    fn message(from: &str, subject: &str, body: &str) -> NormalizedMessage {
        NormalizedMessage {
            id: "m1".to_string(),
            from: from.to_string(),
            subject: subject.to_string(),
            body_text: body.to_string(),
            ..Default::default()
        }
    }

    fn reply(link: Option<&str>, confidence: f64) -> String {
        json!({
            "service_name": "Example",
            "price": 9.99,
            "currency": "USD",
            "billing_period": "monthly",
            "unsubscribe_link": link,
            "confidence": confidence
        })
        .to_string()
    }

    #[tokio::test]
    async fn test_keyword_gate_skips_provider() {
        let provider = Arc::new(FakeProvider::replying(reply(None, 0.9)));
        let detector = SubscriptionDetector::new(provider.clone(), config());

        let msg = message("friend@example.com", "Lunch tomorrow?", "See you at noon.");
        let outcome = detector.detect(&msg).await;

        assert_eq!(
            outcome,
            DetectionOutcome::NoMatch(NoMatchReason::KeywordGate { hits: 0 })
        );
        assert_eq!(provider.calls(), 0);
    }

    #[tokio::test]
    async fn test_confident_rules_skip_provider() {
        let provider = Arc::new(FakeProvider::replying(reply(None, 0.9)));
        let detector = SubscriptionDetector::new(provider.clone(), config());

        let msg = message(
            "Spotify <no-reply@spotify.com>",
            "Your Spotify Premium receipt",
            "Thanks for your payment of $11.99/month for your subscription. \
             Cancel any time: https://www.spotify.com/account/cancel",
        );
        let candidate = detector.detect(&msg).await.candidate().unwrap();

        assert_eq!(candidate.method, DetectionMethod::RuleBased);
        assert_eq!(candidate.service_name, "Spotify");
        assert_eq!(candidate.cadence, Some(Cadence::Monthly));
        assert_eq!(provider.calls(), 0);
    }

    #[tokio::test]
    async fn test_invented_link_is_penalized() {
        let link = "https://example.com/cancel-now";
        let provider = Arc::new(FakeProvider::replying(reply(Some(link), 0.9)));
        let detector = SubscriptionDetector::new(provider.clone(), config());

        let msg = message(
            "Example <billing@example.com>",
            "Your subscription receipt",
            "Your payment was received. Thank you for being a member.",
        );
        let candidate = detector.detect(&msg).await.candidate().unwrap();

        assert_eq!(provider.calls(), 1);
        assert_eq!(candidate.method, DetectionMethod::Generative);
        assert!((candidate.confidence - 0.6).abs() < 1e-9, "{}", candidate.confidence);
    }

    #[tokio::test]
    async fn test_foreign_host_penalty_can_drop_below_threshold() {
        let link = "https://evil.test/cancel";
        let provider = Arc::new(FakeProvider::replying(reply(Some(link), 0.9)));
        let detector = SubscriptionDetector::new(provider, config());

        let msg = message(
            "Example <billing@example.com>",
            "Your subscription receipt",
            "Your payment was received.",
        );
        // both penalties: 0.9 - 0.3 - 0.2
        match detector.detect(&msg).await {
            DetectionOutcome::NoMatch(NoMatchReason::LowConfidence { confidence }) => {
                assert!((confidence - 0.4).abs() < 1e-9)
            }
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_link_present_on_sender_domain_keeps_confidence() {
        let link = "https://www.example.com/account/cancel";
        let provider = Arc::new(FakeProvider::replying(reply(Some(link), 0.8)));
        let detector = SubscriptionDetector::new(provider, config());

        let msg = message(
            "Example <billing@mail.example.com>",
            "Subscription renewal",
            &format!("Your payment is due. Manage at {link}"),
        );
        let candidate = detector.detect(&msg).await.candidate().unwrap();
        assert_eq!(candidate.confidence, 0.8);
    }

    #[tokio::test]
    async fn test_provider_and_schema_failures_are_outcomes() {
        let msg = message(
            "Example <billing@example.com>",
            "Your subscription receipt",
            "Your payment was received.",
        );

        let provider = Arc::new(FakeProvider::failing(AppError::Provider("down".to_string())));
        let detector = SubscriptionDetector::new(provider, config());
        assert!(matches!(detector.detect(&msg).await, DetectionOutcome::Failed(_)));

        let provider = Arc::new(FakeProvider::replying("I think it's Netflix".to_string()));
        let detector = SubscriptionDetector::new(provider, config());
        assert!(matches!(detector.detect(&msg).await, DetectionOutcome::Failed(_)));
    }
}
